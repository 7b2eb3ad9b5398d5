use std::time::Duration;

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Why a wrapped operation did not produce a value. Every variant names the operation.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The breaker for `operation` is open; the operation was never invoked.
    #[error("circuit breaker is open for {operation}")]
    CircuitOpen { operation: String },
    /// The operation did not finish within `after` and was aborted.
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },
    /// The operation ran and failed.
    #[error("{operation} failed: {source}")]
    Underlying {
        operation: String,
        #[source]
        source: BoxError,
    },
}

pub type ExecutionResult<T> = Result<T, ExecutionError>;

impl ExecutionError {
    pub fn operation(&self) -> &str {
        match self {
            ExecutionError::CircuitOpen { operation }
            | ExecutionError::Timeout { operation, .. }
            | ExecutionError::Underlying { operation, .. } => operation,
        }
    }

    /// Follows `Underlying` sources through nested wrappers down to the innermost
    /// `ExecutionError`, which decides how the failure is reported.
    pub fn innermost(&self) -> &ExecutionError {
        let mut current = self;
        while let ExecutionError::Underlying { source, .. } = current {
            match source.downcast_ref::<ExecutionError>() {
                Some(inner) => current = inner,
                None => break,
            }
        }
        current
    }

    /// The cause an `Underlying` failure carries after unwrapping nested wrappers.
    pub fn root_source(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self.innermost() {
            ExecutionError::Underlying { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}
