//! # Tether Utilities
//!
//! Shared helpers for the Tether workspace. For now that is logging setup on
//! top of `tracing`.

pub mod logging;

// Re-export commonly used logging functions for convenience
pub use logging::{
    default_log_file, init_logging, init_logging_with, init_logging_with_level, LogFormat, LogLevel, LogSettings,
    LoggingError, LoggingGuard,
};
pub use tracing::{debug, error, info, trace, warn};
