//! Request-surface middleware.

pub mod auth;
