//! Control core for SpinCore-style programmable pulse generators.
//!
//! This library models one board behind an external driver process: a
//! typed instruction model with validation and clock-tick normalization,
//! a lifecycle state machine ([`session::DeviceSession`]), a command
//! dispatcher over a pluggable driver transport, and a background status
//! poller. The binary in `main.rs` wraps it in a small CLI.

pub mod config;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod instruction;
pub mod poller;
pub mod session;
pub mod status;

pub use config::Settings;
pub use dispatch::Dispatcher;
pub use error::{DispatchError, PulseError, PulseResult};
pub use instruction::{Flags, Instruction, Opcode, TimeUnit};
pub use session::{DeviceSession, Lifecycle};
pub use status::BoardStatus;
