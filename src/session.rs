//! Device session: lifecycle state machine over one pulse generator board.
//!
//! A [`DeviceSession`] owns the [`Dispatcher`] for one board and tracks
//! where the board is in its lifecycle:
//!
//! ```text
//! Uninitialized --connect--> Connected --program--> Programmed
//!      ^                         ^                      |
//!      |                       reset                  start
//!  disconnect                    |                      v
//!      |                         +---- Stopped <--stop-- Running
//! ```
//!
//! `program` is also accepted from `Programmed` (replace the program) and
//! from `Stopped` (load the next sequence after a run). `reset` returns
//! any post-connect state to `Connected` and clears program memory.
//!
//! Mutating operations are serialized: at most one of connect, program,
//! start, stop, reset, wait or register programming runs at a time, and a
//! second caller gets [`PulseError::Busy`] instead of queueing. Status
//! queries never contend with that guard, so polling stays responsive
//! during long waits.

use crate::config::BoardConfig;
use crate::dispatch::{Dispatcher, DriverCommand};
use crate::error::{DispatchError, PulseError, PulseResult};
use crate::instruction::{normalize_sequence, CanonicalInstruction, Instruction, NormalizeWarning};
use crate::status::BoardStatus;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::{sleep, Instant};

/// Where the session is in the board lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Lifecycle {
    /// No board connection; only `connect` is allowed.
    Uninitialized,
    /// Board opened and clock set; no program loaded.
    Connected,
    /// A program is loaded and ready to start.
    Programmed,
    /// The loaded program is executing.
    Running,
    /// Execution halted; the program is still loaded.
    Stopped,
}

/// One timestamped status observation.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct StatusSample {
    /// Decoded status register.
    pub status: BoardStatus,
    /// When the sample was taken.
    pub at: DateTime<Utc>,
}

#[derive(Debug)]
struct SessionCore {
    lifecycle: Lifecycle,
    config: Option<BoardConfig>,
    program: Option<Vec<CanonicalInstruction>>,
}

/// Session over one board, valid from `connect` to `disconnect`.
pub struct DeviceSession {
    dispatcher: Dispatcher,
    core: RwLock<SessionCore>,
    /// Serializes mutating operations. `try_lock` failure maps to `Busy`.
    op_guard: Mutex<()>,
    status_tx: watch::Sender<Option<StatusSample>>,
    wait_poll_interval: Duration,
}

impl DeviceSession {
    /// Create a session over the given dispatcher. The session starts
    /// uninitialized; call [`connect`](Self::connect) before anything else.
    pub fn new(dispatcher: Dispatcher) -> Self {
        let (status_tx, _) = watch::channel(None);
        Self {
            dispatcher,
            core: RwLock::new(SessionCore {
                lifecycle: Lifecycle::Uninitialized,
                config: None,
                program: None,
            }),
            op_guard: Mutex::new(()),
            status_tx,
            wait_poll_interval: Duration::from_millis(100),
        }
    }

    /// Set the poll interval used by [`wait_until_stopped`](Self::wait_until_stopped).
    pub fn with_wait_poll_interval(mut self, interval: Duration) -> Self {
        self.wait_poll_interval = interval;
        self
    }

    /// Current lifecycle state.
    pub async fn lifecycle(&self) -> Lifecycle {
        self.core.read().await.lifecycle
    }

    /// Most recent status sample, if the board has ever been queried.
    pub fn last_status(&self) -> Option<StatusSample> {
        *self.status_tx.borrow()
    }

    /// Subscribe to status samples as they are observed. Receivers see
    /// `None` again after a disconnect.
    pub fn subscribe_status(&self) -> watch::Receiver<Option<StatusSample>> {
        self.status_tx.subscribe()
    }

    fn invalid_state(operation: &'static str, state: Lifecycle) -> PulseError {
        PulseError::InvalidState { operation, state }
    }

    /// Open the board and set its core clock.
    ///
    /// Allowed only from `Uninitialized`. On driver failure the session
    /// stays uninitialized and can retry.
    pub async fn connect(&self, config: BoardConfig) -> PulseResult<()> {
        let _guard = self.op_guard.try_lock().map_err(|_| PulseError::Busy)?;

        {
            let core = self.core.read().await;
            if core.lifecycle != Lifecycle::Uninitialized {
                return Err(Self::invalid_state("connect", core.lifecycle));
            }
        }

        self.dispatcher
            .dispatch(&DriverCommand::Initialize {
                board: config.board,
                core_clock_mhz: config.core_clock_mhz,
                debug: config.debug,
            })
            .await
            .map_err(PulseError::Connection)?;

        let mut core = self.core.write().await;
        core.lifecycle = Lifecycle::Connected;
        core.config = Some(config);
        info!(
            "connected to board {} at {} MHz",
            config.board, config.core_clock_mhz
        );
        Ok(())
    }

    /// Validate, normalize and load an instruction sequence.
    ///
    /// Allowed from `Connected`, `Programmed` and `Stopped`; a new program
    /// replaces the previous one. Validation failures never reach the
    /// driver and leave session state untouched. Returns the normalization
    /// warnings, which are also logged.
    pub async fn program(&self, sequence: &[Instruction]) -> PulseResult<Vec<NormalizeWarning>> {
        let _guard = self.op_guard.try_lock().map_err(|_| PulseError::Busy)?;

        let config = {
            let core = self.core.read().await;
            match core.lifecycle {
                Lifecycle::Connected | Lifecycle::Programmed | Lifecycle::Stopped => {}
                state => return Err(Self::invalid_state("program", state)),
            }
            // Lifecycle is past Uninitialized, so a config is present.
            core.config.ok_or(PulseError::InvalidState {
                operation: "program",
                state: core.lifecycle,
            })?
        };

        let (instructions, warnings) = normalize_sequence(sequence, config.core_clock_mhz)?;
        for warning in &warnings {
            warn!("{warning}");
        }

        self.dispatcher
            .dispatch(&DriverCommand::Program {
                instructions: instructions.clone(),
            })
            .await
            .map_err(PulseError::Programming)?;

        let mut core = self.core.write().await;
        info!("programmed {} instructions", instructions.len());
        core.program = Some(instructions);
        core.lifecycle = Lifecycle::Programmed;
        Ok(warnings)
    }

    /// Start executing the loaded program.
    ///
    /// Allowed from `Programmed` and `Stopped` (restart).
    pub async fn start(&self) -> PulseResult<()> {
        let _guard = self.op_guard.try_lock().map_err(|_| PulseError::Busy)?;

        {
            let core = self.core.read().await;
            match core.lifecycle {
                Lifecycle::Programmed | Lifecycle::Stopped => {}
                state => return Err(Self::invalid_state("start", state)),
            }
        }

        self.dispatcher
            .dispatch(&DriverCommand::Start)
            .await
            .map_err(|source| PulseError::Execution {
                operation: "start",
                source,
            })?;

        self.core.write().await.lifecycle = Lifecycle::Running;
        info!("program started");
        Ok(())
    }

    /// Halt execution. Allowed only from `Running`.
    pub async fn stop(&self) -> PulseResult<()> {
        let _guard = self.op_guard.try_lock().map_err(|_| PulseError::Busy)?;

        {
            let core = self.core.read().await;
            if core.lifecycle != Lifecycle::Running {
                return Err(Self::invalid_state("stop", core.lifecycle));
            }
        }

        self.dispatcher
            .dispatch(&DriverCommand::Stop)
            .await
            .map_err(|source| PulseError::Execution {
                operation: "stop",
                source,
            })?;

        self.core.write().await.lifecycle = Lifecycle::Stopped;
        info!("program stopped");
        Ok(())
    }

    /// Reset the board, clearing program memory.
    ///
    /// Allowed from any post-connect state; returns the session to
    /// `Connected`.
    pub async fn reset(&self) -> PulseResult<()> {
        let _guard = self.op_guard.try_lock().map_err(|_| PulseError::Busy)?;

        {
            let core = self.core.read().await;
            if core.lifecycle == Lifecycle::Uninitialized {
                return Err(Self::invalid_state("reset", core.lifecycle));
            }
        }

        self.dispatcher
            .dispatch(&DriverCommand::Reset)
            .await
            .map_err(|source| PulseError::Execution {
                operation: "reset",
                source,
            })?;

        let mut core = self.core.write().await;
        core.lifecycle = Lifecycle::Connected;
        core.program = None;
        info!("board reset");
        Ok(())
    }

    /// Query the board's status register.
    ///
    /// Allowed from any post-connect state. Never contends with the
    /// operation guard, so it stays usable while a wait is in progress.
    /// A successful sample is published to status subscribers.
    pub async fn status(&self) -> PulseResult<BoardStatus> {
        {
            let core = self.core.read().await;
            if core.lifecycle == Lifecycle::Uninitialized {
                return Err(Self::invalid_state("status", core.lifecycle));
            }
        }

        let reply = self
            .dispatcher
            .dispatch(&DriverCommand::Status)
            .await
            .map_err(PulseError::Query)?;

        let raw = reply.raw_status.ok_or_else(|| {
            PulseError::Query(DispatchError::MalformedReply(
                "status reply is missing the status field".to_string(),
            ))
        })?;

        let status = BoardStatus::decode(raw);
        // Publish under the core lock so a concurrent disconnect's None is
        // never overwritten by a stale sample.
        let core = self.core.read().await;
        if core.lifecycle != Lifecycle::Uninitialized {
            self.status_tx.send_replace(Some(StatusSample {
                status,
                at: Utc::now(),
            }));
        }
        Ok(status)
    }

    /// Block until the board reports `stopped`, or until `timeout`.
    ///
    /// Returns `Ok(true)` if the board stopped, `Ok(false)` on timeout.
    /// A timeout is a normal outcome, not an error. Transient status
    /// query failures during the wait are logged and retried on the next
    /// poll. On observing the stop, the session lifecycle is synchronized
    /// to `Stopped`.
    pub async fn wait_until_stopped(&self, timeout: Duration) -> PulseResult<bool> {
        let _guard = self.op_guard.try_lock().map_err(|_| PulseError::Busy)?;

        {
            let core = self.core.read().await;
            match core.lifecycle {
                Lifecycle::Running => {}
                // Already stopped; nothing to wait for.
                Lifecycle::Stopped => return Ok(true),
                state => return Err(Self::invalid_state("wait_until_stopped", state)),
            }
        }

        let deadline = Instant::now() + timeout;
        loop {
            match self.status().await {
                Ok(status) if status.stopped => {
                    self.core.write().await.lifecycle = Lifecycle::Stopped;
                    debug!("board reported stopped");
                    return Ok(true);
                }
                Ok(_) => {}
                Err(e) => {
                    // Transient; the next poll may succeed.
                    warn!("status poll during wait failed: {e}");
                }
            }

            let now = Instant::now();
            if now >= deadline {
                debug!("wait_until_stopped timed out after {timeout:?}");
                return Ok(false);
            }
            sleep(self.wait_poll_interval.min(deadline - now)).await;
        }
    }

    /// Load the DDS frequency register table.
    ///
    /// Returns the register indices assigned by the driver, for use in
    /// the `freq` field of [`DdsChannel`](crate::instruction::DdsChannel).
    /// Allowed from any post-connect state.
    pub async fn program_freq_registers(&self, frequencies_mhz: &[f64]) -> PulseResult<Vec<u32>> {
        let _guard = self.op_guard.try_lock().map_err(|_| PulseError::Busy)?;
        self.require_connected("program_freq_registers").await?;

        let reply = self
            .dispatcher
            .dispatch(&DriverCommand::ProgramFreqRegisters {
                frequencies_mhz: frequencies_mhz.to_vec(),
            })
            .await
            .map_err(PulseError::Programming)?;

        reply.registers.ok_or_else(|| {
            PulseError::Programming(DispatchError::MalformedReply(
                "frequency register reply is missing register indices".to_string(),
            ))
        })
    }

    /// Load the DDS phase register table. Allowed from any post-connect state.
    pub async fn program_phase_registers(&self, degrees: &[f64]) -> PulseResult<()> {
        let _guard = self.op_guard.try_lock().map_err(|_| PulseError::Busy)?;
        self.require_connected("program_phase_registers").await?;

        self.dispatcher
            .dispatch(&DriverCommand::ProgramPhaseRegisters {
                degrees: degrees.to_vec(),
            })
            .await
            .map_err(PulseError::Programming)?;
        Ok(())
    }

    /// Load the DDS amplitude register table. Allowed from any post-connect state.
    pub async fn program_amp_registers(&self, scales: &[f64]) -> PulseResult<()> {
        let _guard = self.op_guard.try_lock().map_err(|_| PulseError::Busy)?;
        self.require_connected("program_amp_registers").await?;

        self.dispatcher
            .dispatch(&DriverCommand::ProgramAmpRegisters {
                scales: scales.to_vec(),
            })
            .await
            .map_err(PulseError::Programming)?;
        Ok(())
    }

    async fn require_connected(&self, operation: &'static str) -> PulseResult<()> {
        let core = self.core.read().await;
        if core.lifecycle == Lifecycle::Uninitialized {
            return Err(Self::invalid_state(operation, core.lifecycle));
        }
        Ok(())
    }

    /// Tear the session down. Never fails.
    ///
    /// If the board is running it is stopped and reset on a best-effort
    /// basis; failures are logged and swallowed. The session always ends
    /// `Uninitialized`, and status subscribers observe `None`.
    pub async fn disconnect(&self) {
        // Waits for any in-flight operation instead of reporting Busy;
        // teardown must always make progress.
        let _guard = self.op_guard.lock().await;

        let lifecycle = self.core.read().await.lifecycle;
        if lifecycle == Lifecycle::Uninitialized {
            return;
        }

        if lifecycle == Lifecycle::Running {
            if let Err(e) = self.dispatcher.dispatch(&DriverCommand::Stop).await {
                warn!("stop during disconnect failed: {e}");
            }
        }
        if let Err(e) = self.dispatcher.dispatch(&DriverCommand::Reset).await {
            warn!("reset during disconnect failed: {e}");
        }

        let mut core = self.core.write().await;
        core.lifecycle = Lifecycle::Uninitialized;
        core.config = None;
        core.program = None;
        self.status_tx.send_replace(None);
        info!("disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MockDriver;
    use crate::instruction::{Flags, Opcode, TimeUnit};

    fn session() -> DeviceSession {
        DeviceSession::new(Dispatcher::new(MockDriver::new()))
            .with_wait_poll_interval(Duration::from_millis(5))
    }

    fn short_program() -> Vec<Instruction> {
        vec![
            Instruction::new(Flags::Mask(0x1), Opcode::Continue, 0, 1.0, TimeUnit::Us),
            Instruction::new(Flags::Mask(0x0), Opcode::Stop, 0, 100.0, TimeUnit::Ns),
        ]
    }

    #[tokio::test]
    async fn test_connect_moves_to_connected() {
        let session = session();
        assert_eq!(session.lifecycle().await, Lifecycle::Uninitialized);
        session.connect(BoardConfig::default()).await.unwrap();
        assert_eq!(session.lifecycle().await, Lifecycle::Connected);
    }

    #[tokio::test]
    async fn test_connect_twice_is_invalid_state() {
        let session = session();
        session.connect(BoardConfig::default()).await.unwrap();
        let err = session.connect(BoardConfig::default()).await.unwrap_err();
        assert!(matches!(
            err,
            PulseError::InvalidState {
                operation: "connect",
                state: Lifecycle::Connected,
            }
        ));
    }

    #[tokio::test]
    async fn test_program_before_connect_is_invalid_state() {
        let session = session();
        let err = session.program(&short_program()).await.unwrap_err();
        assert!(matches!(err, PulseError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_validation_failure_leaves_state_unchanged() {
        let session = session();
        session.connect(BoardConfig::default()).await.unwrap();

        // No terminal instruction.
        let bad = vec![Instruction::new(
            Flags::Mask(0x1),
            Opcode::Continue,
            0,
            1.0,
            TimeUnit::Us,
        )];
        let err = session.program(&bad).await.unwrap_err();
        assert!(matches!(err, PulseError::Validation(_)));
        assert_eq!(session.lifecycle().await, Lifecycle::Connected);
    }

    #[tokio::test]
    async fn test_start_requires_program() {
        let session = session();
        session.connect(BoardConfig::default()).await.unwrap();
        let err = session.start().await.unwrap_err();
        assert!(matches!(
            err,
            PulseError::InvalidState {
                operation: "start",
                state: Lifecycle::Connected,
            }
        ));
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let session = session();
        session.connect(BoardConfig::default()).await.unwrap();
        session.program(&short_program()).await.unwrap();
        assert_eq!(session.lifecycle().await, Lifecycle::Programmed);

        session.start().await.unwrap();
        assert_eq!(session.lifecycle().await, Lifecycle::Running);

        session.stop().await.unwrap();
        assert_eq!(session.lifecycle().await, Lifecycle::Stopped);

        // A stopped program can be restarted without reprogramming.
        session.start().await.unwrap();
        session.stop().await.unwrap();

        session.reset().await.unwrap();
        assert_eq!(session.lifecycle().await, Lifecycle::Connected);
    }

    #[tokio::test]
    async fn test_status_publishes_sample() {
        let session = session();
        let mut rx = session.subscribe_status();
        assert!(rx.borrow().is_none());

        session.connect(BoardConfig::default()).await.unwrap();
        let status = session.status().await.unwrap();

        rx.changed().await.unwrap();
        let sample = rx.borrow().unwrap();
        assert_eq!(sample.status.raw, status.raw);
        assert!(session.last_status().is_some());
    }

    #[tokio::test]
    async fn test_wait_until_stopped_observes_stop() {
        let driver = MockDriver::new().with_run_duration(Duration::from_millis(20));
        let session = DeviceSession::new(Dispatcher::new(driver))
            .with_wait_poll_interval(Duration::from_millis(5));
        session.connect(BoardConfig::default()).await.unwrap();
        session.program(&short_program()).await.unwrap();
        session.start().await.unwrap();

        let stopped = session
            .wait_until_stopped(Duration::from_millis(500))
            .await
            .unwrap();
        assert!(stopped);
        assert_eq!(session.lifecycle().await, Lifecycle::Stopped);
    }

    #[tokio::test]
    async fn test_wait_when_already_stopped_returns_immediately() {
        let session = session();
        session.connect(BoardConfig::default()).await.unwrap();
        session.program(&short_program()).await.unwrap();
        session.start().await.unwrap();
        session.stop().await.unwrap();

        let stopped = session.wait_until_stopped(Duration::ZERO).await.unwrap();
        assert!(stopped);
    }

    #[tokio::test]
    async fn test_wait_until_stopped_times_out() {
        let driver = MockDriver::new().with_run_duration(Duration::from_secs(10));
        let session = DeviceSession::new(Dispatcher::new(driver))
            .with_wait_poll_interval(Duration::from_millis(5));
        session.connect(BoardConfig::default()).await.unwrap();
        session.program(&short_program()).await.unwrap();
        session.start().await.unwrap();

        let stopped = session
            .wait_until_stopped(Duration::from_millis(30))
            .await
            .unwrap();
        assert!(!stopped);
        assert_eq!(session.lifecycle().await, Lifecycle::Running);
    }

    #[tokio::test]
    async fn test_driver_refusal_surfaces_as_programming_error() {
        let driver = MockDriver::new();
        driver.fail_command("program").await;
        let session = DeviceSession::new(Dispatcher::new(driver));
        session.connect(BoardConfig::default()).await.unwrap();
        let err = session.program(&short_program()).await.unwrap_err();
        assert!(matches!(
            err,
            PulseError::Programming(DispatchError::DriverReported(_))
        ));
        assert_eq!(session.lifecycle().await, Lifecycle::Connected);
    }

    #[tokio::test]
    async fn test_disconnect_never_fails() {
        let driver = MockDriver::new();
        driver.fail_command("stop").await;
        driver.fail_command("reset").await;
        let session = DeviceSession::new(Dispatcher::new(driver));
        session.connect(BoardConfig::default()).await.unwrap();
        session.program(&short_program()).await.unwrap();
        session.start().await.unwrap();

        session.disconnect().await;
        assert_eq!(session.lifecycle().await, Lifecycle::Uninitialized);
        assert!(session.last_status().is_none());
    }

    #[tokio::test]
    async fn test_disconnect_when_uninitialized_is_a_no_op() {
        let session = session();
        session.disconnect().await;
        assert_eq!(session.lifecycle().await, Lifecycle::Uninitialized);
    }

    #[tokio::test]
    async fn test_dds_register_round_trip() {
        let session = session();
        session.connect(BoardConfig::default()).await.unwrap();

        let ids = session
            .program_freq_registers(&[10.0, 74.481])
            .await
            .unwrap();
        assert_eq!(ids, vec![0, 1]);

        session.program_phase_registers(&[0.0, 90.0]).await.unwrap();
        session.program_amp_registers(&[1.0, 0.5]).await.unwrap();
    }

    #[tokio::test]
    async fn test_dds_registers_require_connect() {
        let session = session();
        let err = session.program_freq_registers(&[10.0]).await.unwrap_err();
        assert!(matches!(err, PulseError::InvalidState { .. }));
    }
}
