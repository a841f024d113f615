//! Subprocess transport: one driver process per command.
//!
//! The driver executable receives the command name as its first argument
//! and the JSON payload on stdin, and prints its structured JSON reply on
//! stdout. A non-zero exit means the driver ran the command and refused
//! it; its stderr carries the reason.

use crate::driver::{DriverRequest, DriverTransport};
use crate::error::DispatchError;
use async_trait::async_trait;
use log::debug;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Transport that spawns the driver executable for every command.
#[derive(Debug, Clone)]
pub struct SubprocessTransport {
    executable: PathBuf,
}

impl SubprocessTransport {
    /// Create a transport for the driver executable at `executable`.
    pub fn new(executable: PathBuf) -> Self {
        Self { executable }
    }

    /// Path of the driver executable this transport spawns.
    pub fn executable(&self) -> &PathBuf {
        &self.executable
    }
}

#[async_trait]
impl DriverTransport for SubprocessTransport {
    fn name(&self) -> &str {
        "subprocess"
    }

    async fn roundtrip(&self, request: &DriverRequest) -> Result<String, DispatchError> {
        let mut child = Command::new(&self.executable)
            .arg(request.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                DispatchError::TransportUnavailable(format!(
                    "failed to spawn driver '{}': {}",
                    self.executable.display(),
                    e
                ))
            })?;

        if let Some(payload) = &request.payload {
            let body = serde_json::to_string(payload).map_err(|e| {
                DispatchError::TransportUnavailable(format!("failed to serialize payload: {e}"))
            })?;
            if let Some(stdin) = child.stdin.as_mut() {
                stdin.write_all(body.as_bytes()).await.map_err(|e| {
                    DispatchError::TransportUnavailable(format!(
                        "failed to write driver stdin: {e}"
                    ))
                })?;
            }
        }
        // Close stdin so a driver reading to EOF does not hang.
        drop(child.stdin.take());

        let output = child.wait_with_output().await.map_err(|e| {
            DispatchError::TransportUnavailable(format!("failed to collect driver output: {e}"))
        })?;

        debug!(
            "driver '{}' command '{}' exited with {}",
            self.executable.display(),
            request.command,
            output.status
        );

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = if stderr.is_empty() {
                format!("driver exited with {}", output.status)
            } else {
                stderr
            };
            return Err(DispatchError::DriverReported(message));
        }

        String::from_utf8(output.stdout)
            .map_err(|e| DispatchError::MalformedReply(format!("driver output not UTF-8: {e}")))
    }
}
