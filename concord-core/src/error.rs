//! Error taxonomy shared by every coordination primitive.
//!
//! Construction errors are reported once, at the constructor. Run-time errors
//! are surfaced to the caller of the blocking operation and never retried by
//! the primitive itself.

use std::any::Any;
use std::error::Error;
use std::sync::Arc;

/// Boxed error accepted from user computations and barrier actions.
///
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

pub type Result<T> = std::result::Result<T, CoordinationError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CoordinationError {
    /// A constructor argument was out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A blocking wait observed an interrupt delivered to the calling thread.
    #[error("interrupted while waiting")]
    Interrupted,

    /// A barrier participant observed a broken generation.
    #[error("barrier is broken")]
    BrokenBarrier,

    /// The wait budget elapsed before the awaited condition held.
    #[error("timed out while waiting")]
    Timeout,

    /// The deferred result was cancelled before it produced an outcome.
    #[error("computation was cancelled")]
    Cancelled,

    /// The wrapped computation, or a barrier action, failed.
    #[error("computation failed: {0}")]
    ComputationFailed(Arc<dyn Error + Send + Sync + 'static>),
}

impl CoordinationError {
    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        CoordinationError::InvalidArgument(message.into())
    }

    pub(crate) fn computation_failed(error: BoxError) -> Self {
        CoordinationError::ComputationFailed(Arc::from(error))
    }

    pub(crate) fn panicked(payload: Box<dyn Any + Send>) -> Self {
        Self::computation_failed(Box::new(Panicked::from_payload(payload)))
    }

    /// Returns the underlying failure if this is `ComputationFailed`.
    ///
    pub fn computation_error(&self) -> Option<&(dyn Error + Send + Sync + 'static)> {
        match self {
            CoordinationError::ComputationFailed(error) => Some(error.as_ref()),
            _ => None,
        }
    }
}

/// A computation or barrier action panicked; carries the panic message.
///
#[derive(Debug, Clone, thiserror::Error)]
#[error("panicked: {message}")]
pub struct Panicked {
    pub message: String,
}

impl Panicked {
    fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = match payload.downcast::<String>() {
            Ok(message) => *message,
            Err(payload) => match payload.downcast::<&'static str>() {
                Ok(message) => (*message).to_string(),
                Err(_) => "unknown panic payload".to_string(),
            },
        };

        Panicked { message }
    }
}
