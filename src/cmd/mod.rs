//! CLI command handlers. The subcommand enum itself lives on
//! [`crate::config::Configuration`] (clap's `#[command(subcommand)]` field),
//! since the daemon has no on-disk config file separate from its CLI/env
//! surface.

pub mod diagnostics;
pub mod root;
