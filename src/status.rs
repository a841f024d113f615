//! Decoded view of the board's raw status register.
//!
//! The status register layout is a protocol constant shared by every
//! driver implementation: bit 0 = running, bit 1 = stopped, bit 2 = reset,
//! bit 3 = waiting. Decoding is total over all 32-bit inputs; bits above
//! 3 are ignored, never an error.

use serde::Serialize;

/// Status register bit for "program is executing".
pub const STATUS_RUNNING: u32 = 1 << 0;
/// Status register bit for "program halted at a STOP instruction".
pub const STATUS_STOPPED: u32 = 1 << 1;
/// Status register bit for "board is in its reset state".
pub const STATUS_RESET: u32 = 1 << 2;
/// Status register bit for "program paused at a WAIT instruction".
pub const STATUS_WAITING: u32 = 1 << 3;

/// Decoded board status with the raw register value it came from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BoardStatus {
    /// Raw status register value as reported by the driver.
    pub raw: u32,
    /// Pulse program is executing.
    pub running: bool,
    /// Pulse program halted at a STOP instruction.
    pub stopped: bool,
    /// Board is in its reset state.
    pub reset: bool,
    /// Pulse program is paused at a WAIT instruction.
    pub waiting: bool,
}

impl BoardStatus {
    /// Decode a raw status register value.
    pub fn decode(raw: u32) -> Self {
        Self {
            raw,
            running: raw & STATUS_RUNNING != 0,
            stopped: raw & STATUS_STOPPED != 0,
            reset: raw & STATUS_RESET != 0,
            waiting: raw & STATUS_WAITING != 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_running_only() {
        let status = BoardStatus::decode(0x1);
        assert!(status.running);
        assert!(!status.stopped);
        assert!(!status.reset);
        assert!(!status.waiting);
    }

    #[test]
    fn test_decode_stopped_only() {
        let status = BoardStatus::decode(0x2);
        assert!(!status.running);
        assert!(status.stopped);
        assert!(!status.reset);
        assert!(!status.waiting);
    }

    #[test]
    fn test_decode_all_conditions() {
        let status = BoardStatus::decode(0xF);
        assert!(status.running);
        assert!(status.stopped);
        assert!(status.reset);
        assert!(status.waiting);
    }

    #[test]
    fn test_decode_ignores_unused_bits() {
        let status = BoardStatus::decode(0xFFFF_FFF0);
        assert_eq!(
            status,
            BoardStatus {
                raw: 0xFFFF_FFF0,
                ..BoardStatus::default()
            }
        );
    }

    #[test]
    fn test_decode_preserves_raw() {
        assert_eq!(BoardStatus::decode(0x106).raw, 0x106);
    }
}
