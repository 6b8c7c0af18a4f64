use core::fmt;
use core::ops::{BitOr, BitOrAssign};
use serde::Serialize;
use thiserror::Error;

/// Status byte reported by a servo alongside every reply.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize)]
#[serde(transparent)]
pub struct ErrorFlags(u8);

impl ErrorFlags {
    pub const VOLTAGE: u8 = 0x01;
    pub const ANGLE: u8 = 0x02;
    pub const OVERHEAT: u8 = 0x04;
    pub const OVERCURRENT: u8 = 0x08;
    pub const CHECKSUM: u8 = 0x10;
    pub const OVERLOAD: u8 = 0x20;
    pub const INSTRUCTION: u8 = 0x40;

    const NAMES: [(u8, &'static str); 7] = [
        (Self::VOLTAGE, "input voltage"),
        (Self::ANGLE, "angle sensor"),
        (Self::OVERHEAT, "overheat"),
        (Self::OVERCURRENT, "over-current"),
        (Self::CHECKSUM, "checksum"),
        (Self::OVERLOAD, "overload"),
        (Self::INSTRUCTION, "instruction"),
    ];

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, bit: u8) -> bool {
        self.0 & bit == bit
    }

    /// Names of the conditions that are set, lowest bit first.
    pub fn conditions(self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl BitOr for ErrorFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ErrorFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for ErrorFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let names = self.conditions();
        if names.is_empty() {
            write!(f, "0x{:02X}", self.0)
        } else {
            write!(f, "{} (0x{:02X})", names.join(", "), self.0)
        }
    }
}

/// Bytes on the line could not be turned into a status packet.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum FramingError {
    #[error("no packet header found")]
    NoSync,
    #[error("truncated packet: have {have} bytes, need {need}")]
    Truncated { have: usize, need: usize },
    #[error("checksum mismatch: expected 0x{expected:02X}, found 0x{found:02X}")]
    ChecksumMismatch { expected: u8, found: u8 },
    #[error("declared length {0} out of range")]
    BadLength(u8),
    #[error("unknown instruction 0x{0:02X}")]
    UnknownInstruction(u8),
}

/// No valid response was obtained.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum CommError {
    #[error("no status packet within the response timeout")]
    Timeout,
    #[error("corrupt status packet: {0}")]
    Framing(#[from] FramingError),
    #[error("failed to transmit instruction packet: {0}")]
    TxFailed(String),
    #[error("failed to receive status packet: {0}")]
    RxFailed(String),
}

impl CommError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, CommError::Timeout)
    }
}

/// Caller misuse, rejected before any byte is sent.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum ValidationError {
    #[error("servo id {0} is out of range (0..=253)")]
    InvalidId(u8),
    #[error("instruction cannot be sent to the broadcast id")]
    BroadcastNotAllowed,
    #[error("payload is empty")]
    EmptyPayload,
    #[error("payload width {found} does not match batch width {expected}")]
    WidthMismatch { expected: usize, found: usize },
    #[error("packet of {len} bytes exceeds the {max} byte limit")]
    PacketTooLong { len: usize, max: usize },
    #[error("batch has no entries")]
    EmptyBatch,
    #[error("{what} value {value} is out of range")]
    ValueOutOfRange { what: &'static str, value: i64 },
    #[error("register {0} is read-only")]
    ReadOnly(&'static str),
}

/// Facade-level error for a single bus operation.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum BusError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Comm(#[from] CommError),
    #[error("servo reported: {flags}")]
    Device { flags: ErrorFlags, params: Vec<u8> },
}

impl BusError {
    pub fn is_comm(&self) -> bool {
        matches!(self, BusError::Comm(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_name_each_condition() {
        let flags = ErrorFlags::from_bits(ErrorFlags::OVERHEAT | ErrorFlags::OVERLOAD);
        assert!(flags.contains(ErrorFlags::OVERHEAT));
        assert!(!flags.contains(ErrorFlags::VOLTAGE));
        assert_eq!(flags.conditions(), vec!["overheat", "overload"]);
        assert_eq!(flags.to_string(), "overheat, overload (0x24)");
        assert_eq!(ErrorFlags::default().to_string(), "none");
    }

    #[test]
    fn flags_accumulate() {
        let mut seen = ErrorFlags::default();
        seen |= ErrorFlags::from_bits(ErrorFlags::VOLTAGE);
        seen |= ErrorFlags::from_bits(ErrorFlags::OVERHEAT);
        assert_eq!(seen.bits(), 0x05);
        assert_eq!(serde_json::to_value(seen).unwrap(), 5);
    }

    #[test]
    fn comm_error_wraps_framing() {
        let err: CommError = FramingError::NoSync.into();
        assert_eq!(err.to_string(), "corrupt status packet: no packet header found");
        assert!(!err.is_timeout());
        let bus: BusError = err.into();
        assert!(bus.is_comm());
    }
}
