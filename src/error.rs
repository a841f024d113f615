//! Error types for the pulse control core.
//!
//! Two layers, matching the two seams of the system:
//!
//! - [`DispatchError`] covers the transport boundary: the driver process
//!   could not be reached, its reply could not be parsed, or it executed
//!   the command and reported a domain failure.
//! - [`PulseError`] is the session-facing taxonomy. Each variant names the
//!   failed operation and carries the underlying driver/transport message,
//!   so a failure surfaced to the UI is always attributable.
//!
//! Timeouts in `wait_until_stopped` are deliberately *not* errors; they are
//! a normal boolean outcome of that operation.

use crate::instruction::ValidationError;
use crate::session::Lifecycle;
use thiserror::Error;

/// Convenience alias for results using the session error type.
pub type PulseResult<T> = std::result::Result<T, PulseError>;

/// Transport-level failures from a single dispatch round trip.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The driver process could not be reached or started.
    #[error("driver transport unavailable: {0}")]
    TransportUnavailable(String),

    /// The driver replied, but the reply did not have the expected shape.
    #[error("malformed driver reply: {0}")]
    MalformedReply(String),

    /// The driver executed the command and reported a domain failure.
    #[error("driver reported error: {0}")]
    DriverReported(String),
}

/// Failures surfaced by device session operations.
#[derive(Error, Debug)]
pub enum PulseError {
    /// The instruction sequence was rejected before any driver call.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// `connect` failed; the session remains uninitialized.
    #[error("connect failed: {0}")]
    Connection(DispatchError),

    /// `program` reached the driver and the driver refused it.
    #[error("program failed: {0}")]
    Programming(DispatchError),

    /// A start/stop/reset command failed on the driver side.
    #[error("{operation} failed: {source}")]
    Execution {
        /// Name of the failed operation.
        operation: &'static str,
        /// Underlying transport or driver failure.
        source: DispatchError,
    },

    /// A status query failed; the last-known status is left unchanged.
    #[error("status query failed: {0}")]
    Query(DispatchError),

    /// The operation is not allowed in the session's current state.
    #[error("operation '{operation}' not allowed in state {state:?}")]
    InvalidState {
        /// Name of the rejected operation.
        operation: &'static str,
        /// Lifecycle state at the time of the call.
        state: Lifecycle,
    },

    /// Another exclusive operation is already in flight on this session.
    #[error("session is busy with another operation")]
    Busy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_carries_operation_and_message() {
        let err = PulseError::Execution {
            operation: "start",
            source: DispatchError::DriverReported("no board at index 2".into()),
        };
        let text = err.to_string();
        assert!(text.contains("start"));
        assert!(text.contains("no board at index 2"));
    }

    #[test]
    fn test_invalid_state_names_operation() {
        let err = PulseError::InvalidState {
            operation: "start",
            state: Lifecycle::Connected,
        };
        assert!(err.to_string().contains("'start'"));
        assert!(err.to_string().contains("Connected"));
    }
}
