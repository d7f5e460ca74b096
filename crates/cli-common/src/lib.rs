//! Helpers shared by the rust-based CLIs: logging bootstrap with common
//! flags, so every binary logs the same way.

mod logging;

pub use logging::{init_logging, LogArgs, LogFormat, LogLevel};
