//! Typed model of one timing-generator instruction.
//!
//! An [`Instruction`] is pure data: output flags, a control opcode, an
//! opcode-dependent operand, a duration with an explicit time unit, and
//! optional DDS register selectors. Sequences are checked by
//! [`validate`] and converted to the device's native representation by
//! [`normalize_sequence`] before anything reaches the driver.
//!
//! Flags are polymorphic at this boundary only: a bit-mask integer, an
//! explicit channel list, or a symbolic string all normalize to one
//! canonical `u32` mask. Nothing past this module ever branches on the
//! flag representation.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Number of output channels addressable by the flag word.
pub const OUTPUT_CHANNELS: u32 = 32;

/// Control operation of an instruction.
///
/// The set is closed and driver-defined; the wire names match the
/// SpinAPI opcode mnemonics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Opcode {
    /// Proceed to the next instruction after the duration elapses.
    Continue,
    /// Halt the program; the board reports `stopped` afterwards.
    Stop,
    /// Begin a loop; `data` is the iteration count.
    Loop,
    /// Close a loop; `data` is the index of the matching `Loop`.
    EndLoop,
    /// Jump to subroutine; `data` is the target instruction index.
    Jsr,
    /// Return from subroutine.
    Rts,
    /// Jump to `data` unconditionally.
    Branch,
    /// Extended-duration instruction; `data` is the delay multiplier.
    LongDelay,
    /// Pause until an external trigger arrives.
    Wait,
}

/// Unit a duration is expressed in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeUnit {
    /// Nanoseconds.
    #[serde(rename = "ns")]
    Ns,
    /// Microseconds.
    #[serde(rename = "us")]
    Us,
    /// Milliseconds.
    #[serde(rename = "ms")]
    Ms,
    /// Seconds.
    #[serde(rename = "s")]
    S,
}

impl TimeUnit {
    /// Nanoseconds per unit.
    pub fn factor_ns(self) -> f64 {
        match self {
            TimeUnit::Ns => 1.0,
            TimeUnit::Us => 1e3,
            TimeUnit::Ms => 1e6,
            TimeUnit::S => 1e9,
        }
    }
}

/// Output-channel selector, polymorphic over representation.
///
/// All three encodings are equivalent; [`Flags::to_mask`] resolves them
/// to the canonical bit-mask.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Flags {
    /// Canonical bit-mask.
    Mask(u32),
    /// Explicit list of active channel indices.
    Channels(Vec<u32>),
    /// Symbolic text: binary (`0b1010` or bare `1010`), hex (`0x3F`),
    /// or decimal.
    Symbolic(String),
}

/// Failure to resolve a flag encoding to a bit-mask.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlagError {
    /// The symbolic string did not parse as binary, hex, or decimal.
    #[error("unparsable flag string '{0}'")]
    Unparsable(String),

    /// A channel index exceeds the flag word width.
    #[error("output channel {0} out of range (0-{})", OUTPUT_CHANNELS - 1)]
    ChannelOutOfRange(u32),
}

impl Flags {
    /// Resolve this encoding to the canonical bit-mask.
    pub fn to_mask(&self) -> Result<u32, FlagError> {
        match self {
            Flags::Mask(mask) => Ok(*mask),
            Flags::Channels(channels) => {
                let mut mask = 0u32;
                for &ch in channels {
                    if ch >= OUTPUT_CHANNELS {
                        return Err(FlagError::ChannelOutOfRange(ch));
                    }
                    mask |= 1 << ch;
                }
                Ok(mask)
            }
            Flags::Symbolic(text) => {
                let text = text.trim();
                let parsed = if let Some(bits) = text.strip_prefix("0b") {
                    u32::from_str_radix(bits, 2)
                } else if let Some(hex) = text.strip_prefix("0x") {
                    u32::from_str_radix(hex, 16)
                } else if !text.is_empty() && text.chars().all(|c| c == '0' || c == '1') {
                    u32::from_str_radix(text, 2)
                } else {
                    text.parse::<u32>()
                };
                parsed.map_err(|_| FlagError::Unparsable(text.to_string()))
            }
        }
    }
}

/// DDS register selectors for one synthesis channel.
///
/// `None` means "leave the register unchanged".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DdsChannel {
    /// Frequency register index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freq: Option<u32>,
    /// Phase register index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<u32>,
    /// Amplitude register index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amp: Option<u32>,
    /// Output enable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dds_en: Option<bool>,
    /// Phase accumulator reset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_reset: Option<bool>,
}

/// One step of a hardware timing program.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    /// Output-channel selector.
    pub flags: Flags,
    /// Control operation.
    pub opcode: Opcode,
    /// Opcode-dependent operand (loop count, branch target, ...).
    #[serde(default)]
    pub data: u32,
    /// Duration value, interpreted in `units`.
    pub duration: f64,
    /// Unit of `duration`.
    pub units: TimeUnit,
    /// DDS registers for synthesis channel 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dds0: Option<DdsChannel>,
    /// DDS registers for synthesis channel 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dds1: Option<DdsChannel>,
}

impl Instruction {
    /// Convenience constructor for plain (non-DDS) instructions.
    pub fn new(flags: Flags, opcode: Opcode, data: u32, duration: f64, units: TimeUnit) -> Self {
        Self {
            flags,
            opcode,
            data,
            duration,
            units,
            dds0: None,
            dds1: None,
        }
    }
}

/// An instruction in the device's native representation: canonical
/// bit-mask flags and a duration in clock ticks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalInstruction {
    /// Canonical output bit-mask.
    pub flags: u32,
    /// Control operation.
    pub opcode: Opcode,
    /// Opcode-dependent operand.
    pub data: u32,
    /// Duration in native clock ticks, rounded to nearest.
    pub duration_ticks: u64,
    /// DDS registers for synthesis channel 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dds0: Option<DdsChannel>,
    /// DDS registers for synthesis channel 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dds1: Option<DdsChannel>,
}

/// Reasons a sequence is rejected before any driver call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// A program must contain at least one instruction.
    #[error("instruction sequence is empty")]
    EmptySequence,

    /// The last instruction does not terminate the program.
    #[error("last instruction ({last:?}) is not a terminal opcode (STOP, or BRANCH)")]
    MissingTerminal {
        /// Opcode of the final instruction.
        last: Opcode,
    },

    /// A branch/loop target points outside the sequence.
    #[error("instruction {index}: {opcode:?} target {target} out of bounds (sequence length {len})")]
    TargetOutOfBounds {
        /// Index of the offending instruction.
        index: usize,
        /// Opcode carrying the target.
        opcode: Opcode,
        /// The out-of-bounds target.
        target: u32,
        /// Sequence length.
        len: usize,
    },

    /// A LOOP instruction with an iteration count of zero.
    #[error("instruction {index}: LOOP count must be at least 1")]
    InvalidLoopCount {
        /// Index of the offending instruction.
        index: usize,
    },

    /// A LONG_DELAY instruction with a multiplier of zero.
    #[error("instruction {index}: LONG_DELAY multiplier must be at least 1")]
    InvalidDelayMultiplier {
        /// Index of the offending instruction.
        index: usize,
    },

    /// Duration is negative, NaN, or infinite.
    #[error("instruction {index}: invalid duration {value}")]
    InvalidDuration {
        /// Index of the offending instruction.
        index: usize,
        /// The rejected duration value.
        value: f64,
    },

    /// The flag encoding could not be resolved.
    #[error("instruction {index}: {source}")]
    Flags {
        /// Index of the offending instruction.
        index: usize,
        /// Underlying flag failure.
        #[source]
        source: FlagError,
    },
}

/// A non-fatal finding produced during normalization.
#[derive(Clone, Debug, PartialEq)]
pub struct NormalizeWarning {
    /// Index of the instruction the warning refers to.
    pub index: usize,
    /// Human-readable description.
    pub message: String,
}

impl fmt::Display for NormalizeWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "instruction {}: {}", self.index, self.message)
    }
}

/// Validate an instruction sequence. Pure, no side effects.
///
/// Checks non-emptiness, terminal-opcode presence, in-bounds branch and
/// loop targets, sane loop counts and delay multipliers, non-negative
/// finite durations, and that every flag encoding resolves.
pub fn validate(sequence: &[Instruction]) -> Result<(), ValidationError> {
    if sequence.is_empty() {
        return Err(ValidationError::EmptySequence);
    }

    let len = sequence.len();
    for (index, instr) in sequence.iter().enumerate() {
        if !instr.duration.is_finite() || instr.duration < 0.0 {
            return Err(ValidationError::InvalidDuration {
                index,
                value: instr.duration,
            });
        }

        instr
            .flags
            .to_mask()
            .map_err(|source| ValidationError::Flags { index, source })?;

        match instr.opcode {
            Opcode::Loop => {
                if instr.data == 0 {
                    return Err(ValidationError::InvalidLoopCount { index });
                }
            }
            Opcode::LongDelay => {
                if instr.data == 0 {
                    return Err(ValidationError::InvalidDelayMultiplier { index });
                }
            }
            Opcode::EndLoop | Opcode::Branch | Opcode::Jsr => {
                if instr.data as usize >= len {
                    return Err(ValidationError::TargetOutOfBounds {
                        index,
                        opcode: instr.opcode,
                        target: instr.data,
                        len,
                    });
                }
            }
            Opcode::Continue | Opcode::Stop | Opcode::Rts | Opcode::Wait => {}
        }
    }

    // A program terminates with STOP, or loops forever via an in-bounds
    // BRANCH (bounds were checked above).
    #[allow(clippy::unwrap_used)] // non-empty checked at the top
    let last = sequence.last().unwrap();
    match last.opcode {
        Opcode::Stop | Opcode::Branch => Ok(()),
        other => Err(ValidationError::MissingTerminal { last: other }),
    }
}

/// Convert one instruction to canonical form.
///
/// `core_clock_mhz` is the board's configured core clock. Tick conversion
/// is round-to-nearest; a non-zero duration that collapses to zero ticks
/// yields a warning instead of being silently dropped.
pub fn normalize(
    instr: &Instruction,
    index: usize,
    core_clock_mhz: f64,
) -> Result<(CanonicalInstruction, Option<NormalizeWarning>), ValidationError> {
    let flags = instr
        .flags
        .to_mask()
        .map_err(|source| ValidationError::Flags { index, source })?;

    let duration_ns = instr.duration * instr.units.factor_ns();
    let duration_ticks = (duration_ns * core_clock_mhz / 1e3).round() as u64;

    let warning = if duration_ticks == 0 && instr.duration > 0.0 {
        Some(NormalizeWarning {
            index,
            message: format!(
                "duration {}{} collapsed to zero ticks at {} MHz",
                instr.duration,
                match instr.units {
                    TimeUnit::Ns => "ns",
                    TimeUnit::Us => "us",
                    TimeUnit::Ms => "ms",
                    TimeUnit::S => "s",
                },
                core_clock_mhz
            ),
        })
    } else {
        None
    };

    Ok((
        CanonicalInstruction {
            flags,
            opcode: instr.opcode,
            data: instr.data,
            duration_ticks,
            dds0: instr.dds0,
            dds1: instr.dds1,
        },
        warning,
    ))
}

/// Validate and normalize a whole sequence.
///
/// Returns the canonical program plus any collapsed-to-zero warnings.
pub fn normalize_sequence(
    sequence: &[Instruction],
    core_clock_mhz: f64,
) -> Result<(Vec<CanonicalInstruction>, Vec<NormalizeWarning>), ValidationError> {
    validate(sequence)?;

    let mut canonical = Vec::with_capacity(sequence.len());
    let mut warnings = Vec::new();
    for (index, instr) in sequence.iter().enumerate() {
        let (instr, warning) = normalize(instr, index, core_clock_mhz)?;
        canonical.push(instr);
        warnings.extend(warning);
    }
    Ok((canonical, warnings))
}
