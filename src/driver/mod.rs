//! Transport seam between the control core and the driver collaborator.
//!
//! The driver is an external program that performs the actual hardware
//! I/O. The core addresses it exclusively through [`DriverTransport`]:
//! one structured request in, one raw reply out. Transports move bytes;
//! the command dispatcher owns the wire format on both sides.
//!
//! Two implementations are provided:
//!
//! - [`SubprocessTransport`] spawns the configured driver executable once
//!   per command (the production path).
//! - [`MockDriver`] simulates a board in-process for tests and offline
//!   development.

mod mock;
mod subprocess;

pub use mock::MockDriver;
pub use subprocess::SubprocessTransport;

use crate::error::DispatchError;
use async_trait::async_trait;

/// A single serialized command bound for the driver.
#[derive(Debug, Clone)]
pub struct DriverRequest {
    /// Driver command name (e.g. `"initialize"`, `"status"`).
    pub command: &'static str,
    /// Structured arguments, if the command takes any.
    pub payload: Option<serde_json::Value>,
}

/// Async request/reply channel to the driver collaborator.
///
/// A transport performs exactly one underlying driver invocation per
/// `roundtrip` call; retry policy, if any, belongs to the caller.
#[async_trait]
pub trait DriverTransport: Send + Sync {
    /// Transport name for logging.
    fn name(&self) -> &str;

    /// Send one request and return the driver's raw reply text.
    async fn roundtrip(&self, request: &DriverRequest) -> Result<String, DispatchError>;
}

// Lets a caller keep a handle to a shared transport (the mock driver in
// tests) after handing it to the dispatcher.
#[async_trait]
impl<T: DriverTransport + ?Sized> DriverTransport for std::sync::Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn roundtrip(&self, request: &DriverRequest) -> Result<String, DispatchError> {
        (**self).roundtrip(request).await
    }
}
