//! Simulated driver for testing without physical hardware.
//!
//! `MockDriver` behaves like the external driver process behind the same
//! transport seam: it parses the structured requests the dispatcher
//! produces and answers with the same reply shape a real driver would.
//!
//! Simulation characteristics:
//!
//! - Configurable per-command latency (default zero).
//! - A started program "runs" for a configurable wall-clock duration and
//!   then reports `stopped`, as a real board does when it executes its
//!   STOP instruction.
//! - Fault injection: fail the next command once, or a named command
//!   persistently.

use crate::driver::{DriverRequest, DriverTransport};
use crate::error::DispatchError;
use crate::status::{STATUS_RESET, STATUS_RUNNING, STATUS_STOPPED};
use async_trait::async_trait;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

#[derive(Debug, Default)]
struct BoardState {
    initialized: bool,
    instruction_count: usize,
    /// Deadline of the simulated run, if a program was started.
    running_until: Option<Instant>,
    stopped: bool,
    in_reset: bool,
    freq_registers: Vec<f64>,
    phase_registers: Vec<f64>,
    amp_registers: Vec<f64>,
    fail_next: Option<String>,
    failing_commands: HashSet<String>,
}

impl BoardState {
    fn raw_status(&mut self) -> u32 {
        // A run that passed its deadline has executed its STOP instruction.
        if let Some(deadline) = self.running_until {
            if Instant::now() >= deadline {
                self.running_until = None;
                self.stopped = true;
            }
        }

        let mut raw = 0;
        if self.running_until.is_some() {
            raw |= STATUS_RUNNING;
        }
        if self.stopped {
            raw |= STATUS_STOPPED;
        }
        if self.in_reset {
            raw |= STATUS_RESET;
        }
        raw
    }
}

/// In-process simulated pulse generator board.
pub struct MockDriver {
    state: Mutex<BoardState>,
    latency: Duration,
    run_duration: Duration,
}

impl MockDriver {
    /// Create a mock board with zero latency and a 50 ms simulated run.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BoardState::default()),
            latency: Duration::ZERO,
            run_duration: Duration::from_millis(50),
        }
    }

    /// Set the artificial latency applied to every command.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Set how long a started program runs before reporting `stopped`.
    pub fn with_run_duration(mut self, run_duration: Duration) -> Self {
        self.run_duration = run_duration;
        self
    }

    /// Fail the next command, whatever it is, with `message`.
    pub async fn fail_next(&self, message: impl Into<String>) {
        self.state.lock().await.fail_next = Some(message.into());
    }

    /// Fail every future invocation of `command`.
    pub async fn fail_command(&self, command: impl Into<String>) {
        self.state.lock().await.failing_commands.insert(command.into());
    }

    /// Number of instructions currently held in program memory.
    pub async fn instruction_count(&self) -> usize {
        self.state.lock().await.instruction_count
    }

    /// Frequency register table last programmed, if any.
    pub async fn freq_registers(&self) -> Vec<f64> {
        self.state.lock().await.freq_registers.clone()
    }

    /// Phase register table last programmed, if any.
    pub async fn phase_registers(&self) -> Vec<f64> {
        self.state.lock().await.phase_registers.clone()
    }

    /// Amplitude register table last programmed, if any.
    pub async fn amp_registers(&self) -> Vec<f64> {
        self.state.lock().await.amp_registers.clone()
    }

    fn ok(message: impl Into<String>) -> String {
        serde_json::json!({ "ok": true, "message": message.into() }).to_string()
    }

    fn refused(message: impl Into<String>) -> String {
        serde_json::json!({ "ok": false, "message": message.into() }).to_string()
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DriverTransport for MockDriver {
    fn name(&self) -> &str {
        "mock"
    }

    async fn roundtrip(&self, request: &DriverRequest) -> Result<String, DispatchError> {
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }

        let mut state = self.state.lock().await;

        if let Some(message) = state.fail_next.take() {
            return Ok(Self::refused(message));
        }
        if state.failing_commands.contains(request.command) {
            return Ok(Self::refused(format!(
                "injected failure for '{}'",
                request.command
            )));
        }

        let reply = match request.command {
            "initialize" => {
                state.initialized = true;
                state.in_reset = true;
                state.stopped = false;
                state.running_until = None;
                Self::ok("board initialized")
            }
            "program" => {
                if !state.initialized {
                    Self::refused("board not initialized")
                } else {
                    let count = request
                        .payload
                        .as_ref()
                        .and_then(|p| p.get("instructions"))
                        .and_then(|i| i.as_array())
                        .map(|a| a.len())
                        .unwrap_or(0);
                    if count == 0 {
                        Self::refused("empty program")
                    } else {
                        state.instruction_count = count;
                        state.running_until = None;
                        state.in_reset = false;
                        state.stopped = false;
                        Self::ok(format!("programmed {count} instructions"))
                    }
                }
            }
            "start" => {
                if !state.initialized {
                    Self::refused("board not initialized")
                } else if state.instruction_count == 0 {
                    Self::refused("no program loaded")
                } else {
                    state.running_until = Some(Instant::now() + self.run_duration);
                    state.stopped = false;
                    state.in_reset = false;
                    Self::ok("program started")
                }
            }
            "stop" => {
                state.running_until = None;
                state.stopped = true;
                Self::ok("program stopped")
            }
            "reset" => {
                state.running_until = None;
                state.instruction_count = 0;
                state.stopped = false;
                state.in_reset = true;
                Self::ok("board reset")
            }
            "status" => {
                if !state.initialized {
                    Self::refused("board not initialized")
                } else {
                    let raw = state.raw_status();
                    serde_json::json!({ "ok": true, "message": "status", "status": raw })
                        .to_string()
                }
            }
            "program_freq_registers" => {
                let freqs: Vec<f64> = register_table(request, "frequencies_mhz");
                let ids: Vec<u32> = (0..freqs.len() as u32).collect();
                state.freq_registers = freqs;
                serde_json::json!({
                    "ok": true,
                    "message": "frequency registers programmed",
                    "registers": ids,
                })
                .to_string()
            }
            "program_phase_registers" => {
                state.phase_registers = register_table(request, "degrees");
                Self::ok("phase registers programmed")
            }
            "program_amp_registers" => {
                state.amp_registers = register_table(request, "scales");
                Self::ok("amplitude registers programmed")
            }
            other => Self::refused(format!("unknown command '{other}'")),
        };

        Ok(reply)
    }
}

fn register_table(request: &DriverRequest, key: &str) -> Vec<f64> {
    request
        .payload
        .as_ref()
        .and_then(|p| p.get(key))
        .and_then(|v| v.as_array())
        .map(|a| a.iter().filter_map(|v| v.as_f64()).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(command: &'static str, payload: Option<serde_json::Value>) -> DriverRequest {
        DriverRequest { command, payload }
    }

    async fn parse(driver: &MockDriver, req: DriverRequest) -> serde_json::Value {
        let raw = driver.roundtrip(&req).await.unwrap();
        serde_json::from_str(&raw).unwrap()
    }

    #[tokio::test]
    async fn test_status_requires_initialize() {
        let driver = MockDriver::new();
        let reply = parse(&driver, request("status", None)).await;
        assert_eq!(reply["ok"], false);
    }

    #[tokio::test]
    async fn test_run_reports_stopped_after_deadline() {
        let driver = MockDriver::new().with_run_duration(Duration::from_millis(30));
        parse(&driver, request("initialize", None)).await;
        parse(
            &driver,
            request(
                "program",
                Some(serde_json::json!({"instructions": [{}, {}]})),
            ),
        )
        .await;
        parse(&driver, request("start", None)).await;

        let running = parse(&driver, request("status", None)).await;
        assert_eq!(running["status"].as_u64().unwrap() & 0x1, 0x1);

        sleep(Duration::from_millis(60)).await;
        let done = parse(&driver, request("status", None)).await;
        assert_eq!(done["status"].as_u64().unwrap() & 0x3, 0x2);
    }

    #[tokio::test]
    async fn test_start_without_program_refused() {
        let driver = MockDriver::new();
        parse(&driver, request("initialize", None)).await;
        let reply = parse(&driver, request("start", None)).await;
        assert_eq!(reply["ok"], false);
    }

    #[tokio::test]
    async fn test_reset_clears_program_memory() {
        let driver = MockDriver::new();
        parse(&driver, request("initialize", None)).await;
        parse(
            &driver,
            request("program", Some(serde_json::json!({"instructions": [{}]}))),
        )
        .await;
        assert_eq!(driver.instruction_count().await, 1);

        parse(&driver, request("reset", None)).await;
        assert_eq!(driver.instruction_count().await, 0);
    }

    #[tokio::test]
    async fn test_fail_next_applies_once() {
        let driver = MockDriver::new();
        driver.fail_next("board on fire").await;
        let refused = parse(&driver, request("initialize", None)).await;
        assert_eq!(refused["ok"], false);
        assert_eq!(refused["message"], "board on fire");

        let accepted = parse(&driver, request("initialize", None)).await;
        assert_eq!(accepted["ok"], true);
    }

    #[tokio::test]
    async fn test_freq_registers_return_indices() {
        let driver = MockDriver::new();
        let reply = parse(
            &driver,
            request(
                "program_freq_registers",
                Some(serde_json::json!({"frequencies_mhz": [10.0, 20.0, 30.0]})),
            ),
        )
        .await;
        assert_eq!(reply["registers"], serde_json::json!([0, 1, 2]));
        assert_eq!(driver.freq_registers().await, vec![10.0, 20.0, 30.0]);
    }
}
