//! Structured logging for the relay.
//!
//! All output goes to stderr or a file; the delegate's stdio pipes carry
//! protocol frames only and must never receive log lines.

mod logging;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
