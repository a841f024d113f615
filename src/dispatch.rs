//! Command dispatcher: typed commands in, typed replies out.
//!
//! The dispatcher turns a [`DriverCommand`] into a structured request,
//! performs exactly one round trip on its [`DriverTransport`], and parses
//! the structured reply. It performs no retries: a single `dispatch`
//! call results in at most one underlying driver invocation, so an
//! ambiguous failure can never have duplicated a side effect. Retry
//! policy, where it exists at all, belongs to the caller.
//!
//! Commands and replies are field-named JSON, never positional, so added
//! optional fields do not break older drivers.

use crate::driver::{DriverRequest, DriverTransport};
use crate::error::DispatchError;
use crate::instruction::CanonicalInstruction;
use log::debug;
use serde::Deserialize;
use serde_json::json;

/// A typed command bound for the driver collaborator.
#[derive(Debug, Clone)]
pub enum DriverCommand {
    /// Open the board and set its core clock.
    Initialize {
        /// Board index.
        board: u32,
        /// Core clock frequency in MHz.
        core_clock_mhz: f64,
        /// Enable driver-side debug logging.
        debug: bool,
    },
    /// Load a canonical instruction sequence into program memory.
    Program {
        /// Canonical instructions, already validated and normalized.
        instructions: Vec<CanonicalInstruction>,
    },
    /// Start executing the loaded program.
    Start,
    /// Halt execution.
    Stop,
    /// Reset the board, clearing program memory.
    Reset,
    /// Read the raw status register.
    Status,
    /// Load the DDS frequency register table.
    ProgramFreqRegisters {
        /// Frequencies in MHz, one per register.
        frequencies_mhz: Vec<f64>,
    },
    /// Load the DDS phase register table.
    ProgramPhaseRegisters {
        /// Phases in degrees, one per register.
        degrees: Vec<f64>,
    },
    /// Load the DDS amplitude register table.
    ProgramAmpRegisters {
        /// Amplitude scale factors (0.0-1.0), one per register.
        scales: Vec<f64>,
    },
}

impl DriverCommand {
    /// Wire name of this command.
    pub fn name(&self) -> &'static str {
        match self {
            DriverCommand::Initialize { .. } => "initialize",
            DriverCommand::Program { .. } => "program",
            DriverCommand::Start => "start",
            DriverCommand::Stop => "stop",
            DriverCommand::Reset => "reset",
            DriverCommand::Status => "status",
            DriverCommand::ProgramFreqRegisters { .. } => "program_freq_registers",
            DriverCommand::ProgramPhaseRegisters { .. } => "program_phase_registers",
            DriverCommand::ProgramAmpRegisters { .. } => "program_amp_registers",
        }
    }

    fn payload(&self) -> Option<serde_json::Value> {
        match self {
            DriverCommand::Initialize {
                board,
                core_clock_mhz,
                debug,
            } => Some(json!({
                "board": board,
                "core_clock_mhz": core_clock_mhz,
                "debug": debug,
            })),
            DriverCommand::Program { instructions } => {
                Some(json!({ "instructions": instructions }))
            }
            DriverCommand::ProgramFreqRegisters { frequencies_mhz } => {
                Some(json!({ "frequencies_mhz": frequencies_mhz }))
            }
            DriverCommand::ProgramPhaseRegisters { degrees } => {
                Some(json!({ "degrees": degrees }))
            }
            DriverCommand::ProgramAmpRegisters { scales } => {
                Some(json!({ "scales": scales }))
            }
            DriverCommand::Start
            | DriverCommand::Stop
            | DriverCommand::Reset
            | DriverCommand::Status => None,
        }
    }
}

/// Structured reply shape expected from the driver.
#[derive(Debug, Deserialize)]
struct RawReply {
    ok: bool,
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: Option<u32>,
    #[serde(default)]
    registers: Option<Vec<u32>>,
}

/// A successfully parsed driver reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Human-readable driver message.
    pub message: String,
    /// Raw status register, present on status queries.
    pub raw_status: Option<u32>,
    /// Register indices, present on register-programming commands.
    pub registers: Option<Vec<u32>>,
}

/// Serializes commands, performs one transport round trip, parses replies.
pub struct Dispatcher {
    transport: Box<dyn DriverTransport>,
}

impl Dispatcher {
    /// Create a dispatcher over the given transport.
    pub fn new(transport: impl DriverTransport + 'static) -> Self {
        Self {
            transport: Box::new(transport),
        }
    }

    /// Execute one command against the driver.
    pub async fn dispatch(&self, command: &DriverCommand) -> Result<Reply, DispatchError> {
        let request = DriverRequest {
            command: command.name(),
            payload: command.payload(),
        };
        debug!(
            "dispatching '{}' via {} transport",
            request.command,
            self.transport.name()
        );

        let raw = self.transport.roundtrip(&request).await?;
        let reply: RawReply = serde_json::from_str(&raw).map_err(|e| {
            DispatchError::MalformedReply(format!(
                "reply to '{}' is not valid: {e}",
                request.command
            ))
        })?;

        if !reply.ok {
            return Err(DispatchError::DriverReported(reply.message));
        }
        debug!("driver accepted '{}': {}", request.command, reply.message);

        Ok(Reply {
            message: reply.message,
            raw_status: reply.status,
            registers: reply.registers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    type SeenRequests = Arc<Mutex<Vec<(String, Option<serde_json::Value>)>>>;

    /// Transport that answers from a canned script and records requests.
    struct ScriptedTransport {
        replies: Mutex<Vec<Result<String, DispatchError>>>,
        seen: SeenRequests,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<Result<String, DispatchError>>) -> Self {
            Self {
                replies: Mutex::new(replies),
                seen: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl DriverTransport for ScriptedTransport {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn roundtrip(&self, request: &DriverRequest) -> Result<String, DispatchError> {
            self.seen
                .lock()
                .unwrap()
                .push((request.command.to_string(), request.payload.clone()));
            self.replies.lock().unwrap().remove(0)
        }
    }

    #[tokio::test]
    async fn test_status_reply_parsed() {
        let dispatcher = Dispatcher::new(ScriptedTransport::new(vec![Ok(
            r#"{"ok": true, "message": "status", "status": 3}"#.to_string(),
        )]));
        let reply = dispatcher.dispatch(&DriverCommand::Status).await.unwrap();
        assert_eq!(reply.raw_status, Some(3));
        assert_eq!(reply.message, "status");
    }

    #[tokio::test]
    async fn test_driver_refusal_maps_to_driver_reported() {
        let dispatcher = Dispatcher::new(ScriptedTransport::new(vec![Ok(
            r#"{"ok": false, "message": "no board at that index"}"#.to_string(),
        )]));
        let err = dispatcher
            .dispatch(&DriverCommand::Initialize {
                board: 2,
                core_clock_mhz: 500.0,
                debug: false,
            })
            .await
            .unwrap_err();
        assert_eq!(
            err,
            DispatchError::DriverReported("no board at that index".to_string())
        );
    }

    #[tokio::test]
    async fn test_unparsable_reply_is_malformed() {
        let dispatcher =
            Dispatcher::new(ScriptedTransport::new(vec![Ok("not json at all".to_string())]));
        let err = dispatcher.dispatch(&DriverCommand::Start).await.unwrap_err();
        assert!(matches!(err, DispatchError::MalformedReply(_)));
    }

    #[tokio::test]
    async fn test_transport_error_propagates() {
        let dispatcher = Dispatcher::new(ScriptedTransport::new(vec![Err(
            DispatchError::TransportUnavailable("spawn failed".to_string()),
        )]));
        let err = dispatcher.dispatch(&DriverCommand::Reset).await.unwrap_err();
        assert!(matches!(err, DispatchError::TransportUnavailable(_)));
    }

    #[tokio::test]
    async fn test_initialize_payload_is_field_named() {
        let transport = ScriptedTransport::new(vec![Ok(
            r#"{"ok": true, "message": "board initialized"}"#.to_string(),
        )]);
        let seen = transport.seen.clone();
        let dispatcher = Dispatcher::new(transport);
        dispatcher
            .dispatch(&DriverCommand::Initialize {
                board: 1,
                core_clock_mhz: 400.0,
                debug: true,
            })
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "initialize");
        assert_eq!(
            seen[0].1,
            Some(json!({"board": 1, "core_clock_mhz": 400.0, "debug": true}))
        );
    }

    #[tokio::test]
    async fn test_program_payload_carries_instructions() {
        use crate::instruction::Opcode;

        let transport = ScriptedTransport::new(vec![Ok(
            r#"{"ok": true, "message": "programmed 1 instructions"}"#.to_string(),
        )]);
        let seen = transport.seen.clone();
        let dispatcher = Dispatcher::new(transport);
        dispatcher
            .dispatch(&DriverCommand::Program {
                instructions: vec![CanonicalInstruction {
                    flags: 0x5,
                    opcode: Opcode::Stop,
                    data: 0,
                    duration_ticks: 500,
                    dds0: None,
                    dds1: None,
                }],
            })
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        let instructions = seen[0].1.as_ref().unwrap()["instructions"]
            .as_array()
            .unwrap();
        assert_eq!(instructions.len(), 1);
        assert_eq!(instructions[0]["flags"], 5);
        assert_eq!(instructions[0]["duration_ticks"], 500);
    }
}
