//! System utilities — the broadcast sink pool PTY output fans out through.

mod sink;

pub use sink::SinkPool;
