//! Result extension trait for logging errors with context.

use std::fmt::Display;
use tracing::error;

/// Adds a `log` method to `Result` for error logging with context
/// and source location, without consuming the result.
pub trait ResultExt<T, E> {
    /// Log the error with context if this is an `Err` variant, then
    /// return the result unchanged.
    fn log<S: ToString>(self, context: S) -> Result<T, E>;
}

impl<T, E: Display> ResultExt<T, E> for Result<T, E> {
    #[track_caller]
    fn log<S: ToString>(self, context: S) -> Result<T, E> {
        if let Err(ref e) = self {
            let caller = std::panic::Location::caller();
            error!(
                target: "job_plane",
                error = %e,
                file = %format!("{}:{}", caller.file(), caller.line()),
                context = %context.to_string(),
                "Operation failed"
            );
        }
        self
    }
}
