//! STS/SMS control table and value encoding.
//!
//! Multi-byte registers are little-endian on STS/SMS servos and big-endian on the SCSCL
//! family. Signed registers use sign-magnitude: the top bit is a sign flag, the remaining
//! bits hold the magnitude. This is not two's complement.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Memory {
    /// Persisted; writes must be bracketed by unlock/lock.
    Eprom,
    Sram,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Register {
    pub name: &'static str,
    pub address: u8,
    pub width: u8,
    pub signed: bool,
    pub access: Access,
    pub memory: Memory,
}

impl Register {
    const fn new(
        name: &'static str,
        address: u8,
        width: u8,
        signed: bool,
        access: Access,
        memory: Memory,
    ) -> Self {
        Self {
            name,
            address,
            width,
            signed,
            access,
            memory,
        }
    }

    pub const fn is_writable(&self) -> bool {
        matches!(self.access, Access::ReadWrite)
    }

    pub const fn needs_unlock(&self) -> bool {
        matches!(self.memory, Memory::Eprom) && self.is_writable()
    }

    /// Index of the sign flag for signed registers.
    pub const fn sign_bit(&self) -> u8 {
        self.width * 8 - 1
    }
}

use Access::{ReadOnly, ReadWrite};
use Memory::{Eprom, Sram};

// EPROM, read only
pub const MODEL: Register = Register::new("model", 3, 2, false, ReadOnly, Eprom);

// EPROM, read/write
pub const ID: Register = Register::new("id", 5, 1, false, ReadWrite, Eprom);
pub const BAUD_RATE: Register = Register::new("baud_rate", 6, 1, false, ReadWrite, Eprom);
pub const MIN_ANGLE_LIMIT: Register = Register::new("min_angle_limit", 9, 2, true, ReadWrite, Eprom);
pub const MAX_ANGLE_LIMIT: Register = Register::new("max_angle_limit", 11, 2, true, ReadWrite, Eprom);
pub const MAX_TEMPERATURE_LIMIT: Register =
    Register::new("max_temperature_limit", 13, 1, false, ReadWrite, Eprom);
pub const MAX_INPUT_VOLTAGE: Register =
    Register::new("max_input_voltage", 14, 1, false, ReadWrite, Eprom);
pub const MIN_INPUT_VOLTAGE: Register =
    Register::new("min_input_voltage", 15, 1, false, ReadWrite, Eprom);
pub const CW_DEAD_ZONE: Register = Register::new("cw_dead_zone", 26, 1, false, ReadWrite, Eprom);
pub const CCW_DEAD_ZONE: Register = Register::new("ccw_dead_zone", 27, 1, false, ReadWrite, Eprom);
pub const POSITION_OFFSET: Register =
    Register::new("position_offset", 31, 2, true, ReadWrite, Eprom);
pub const MODE: Register = Register::new("mode", 33, 1, false, ReadWrite, Eprom);

// SRAM, read/write
pub const TORQUE_ENABLE: Register = Register::new("torque_enable", 40, 1, false, ReadWrite, Sram);
pub const ACCELERATION: Register = Register::new("acceleration", 41, 1, false, ReadWrite, Sram);
pub const GOAL_POSITION: Register = Register::new("goal_position", 42, 2, true, ReadWrite, Sram);
pub const GOAL_TIME: Register = Register::new("goal_time", 44, 2, false, ReadWrite, Sram);
pub const GOAL_SPEED: Register = Register::new("goal_speed", 46, 2, true, ReadWrite, Sram);
pub const LOCK: Register = Register::new("lock", 55, 1, false, ReadWrite, Sram);

// SRAM, read only
pub const PRESENT_POSITION: Register =
    Register::new("present_position", 56, 2, true, ReadOnly, Sram);
pub const PRESENT_SPEED: Register = Register::new("present_speed", 58, 2, true, ReadOnly, Sram);
pub const PRESENT_LOAD: Register = Register::new("present_load", 60, 2, true, ReadOnly, Sram);
pub const PRESENT_VOLTAGE: Register =
    Register::new("present_voltage", 62, 1, false, ReadOnly, Sram);
pub const PRESENT_TEMPERATURE: Register =
    Register::new("present_temperature", 63, 1, false, ReadOnly, Sram);
pub const MOVING: Register = Register::new("moving", 66, 1, false, ReadOnly, Sram);
pub const PRESENT_CURRENT: Register =
    Register::new("present_current", 69, 2, true, ReadOnly, Sram);

pub const ALL: [Register; 25] = [
    MODEL,
    ID,
    BAUD_RATE,
    MIN_ANGLE_LIMIT,
    MAX_ANGLE_LIMIT,
    MAX_TEMPERATURE_LIMIT,
    MAX_INPUT_VOLTAGE,
    MIN_INPUT_VOLTAGE,
    CW_DEAD_ZONE,
    CCW_DEAD_ZONE,
    POSITION_OFFSET,
    MODE,
    TORQUE_ENABLE,
    ACCELERATION,
    GOAL_POSITION,
    GOAL_TIME,
    GOAL_SPEED,
    LOCK,
    PRESENT_POSITION,
    PRESENT_SPEED,
    PRESENT_LOAD,
    PRESENT_VOLTAGE,
    PRESENT_TEMPERATURE,
    MOVING,
    PRESENT_CURRENT,
];

pub fn by_name(name: &str) -> Option<Register> {
    ALL.iter().copied().find(|r| r.name == name)
}

/// Width of the acceleration + goal position + goal time + goal speed block.
pub const POSITION_COMMAND_LEN: usize = 7;

pub const LOCKED: u8 = 1;
pub const UNLOCKED: u8 = 0;

/// Full mechanical range in position steps.
pub const POSITION_MAX: u16 = 4095;

/// Sign bit used for 2-byte signed registers.
pub const SIGN_BIT_16: u8 = 15;

/// Baud-rate codes stored in [`BAUD_RATE`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum BaudCode {
    B1M = 0,
    B500k = 1,
    B250k = 2,
    B128k = 3,
    B115200 = 4,
    B76800 = 5,
    B57600 = 6,
    B38400 = 7,
}

impl BaudCode {
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub const fn bits_per_second(self) -> u32 {
        match self {
            BaudCode::B1M => 1_000_000,
            BaudCode::B500k => 500_000,
            BaudCode::B250k => 250_000,
            BaudCode::B128k => 128_000,
            BaudCode::B115200 => 115_200,
            BaudCode::B76800 => 76_800,
            BaudCode::B57600 => 57_600,
            BaudCode::B38400 => 38_400,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        [
            BaudCode::B1M,
            BaudCode::B500k,
            BaudCode::B250k,
            BaudCode::B128k,
            BaudCode::B115200,
            BaudCode::B76800,
            BaudCode::B57600,
            BaudCode::B38400,
        ]
        .into_iter()
        .find(|b| b.code() == code)
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    /// STS/SMS series.
    #[default]
    Little,
    /// SCSCL series.
    Big,
}

impl ByteOrder {
    pub fn make_word(self, first: u8, second: u8) -> u16 {
        match self {
            ByteOrder::Little => u16::from(first) | (u16::from(second) << 8),
            ByteOrder::Big => u16::from(second) | (u16::from(first) << 8),
        }
    }

    /// Byte sent first on the wire.
    pub fn low_byte(self, value: u16) -> u8 {
        match self {
            ByteOrder::Little => (value & 0xFF) as u8,
            ByteOrder::Big => (value >> 8) as u8,
        }
    }

    /// Byte sent second on the wire.
    pub fn high_byte(self, value: u16) -> u8 {
        match self {
            ByteOrder::Little => (value >> 8) as u8,
            ByteOrder::Big => (value & 0xFF) as u8,
        }
    }

    pub fn word_bytes(self, value: u16) -> [u8; 2] {
        [self.low_byte(value), self.high_byte(value)]
    }

    pub fn dword_bytes(self, value: u32) -> [u8; 4] {
        let [a, b] = self.word_bytes(low_word(value));
        let [c, d] = self.word_bytes(high_word(value));
        [a, b, c, d]
    }

    /// Combine 1, 2 or 4 register bytes into one value.
    pub fn decode(self, bytes: &[u8]) -> Option<u32> {
        match *bytes {
            [a] => Some(u32::from(a)),
            [a, b] => Some(u32::from(self.make_word(a, b))),
            [a, b, c, d] => Some(make_dword(self.make_word(a, b), self.make_word(c, d))),
            _ => None,
        }
    }
}

pub fn make_dword(low: u16, high: u16) -> u32 {
    u32::from(low) | (u32::from(high) << 16)
}

pub fn low_word(value: u32) -> u16 {
    (value & 0xFFFF) as u16
}

pub fn high_word(value: u32) -> u16 {
    (value >> 16) as u16
}

/// Little-endian low byte, independent of the servo family.
pub fn low_byte(value: u16) -> u8 {
    ByteOrder::Little.low_byte(value)
}

pub fn high_byte(value: u16) -> u8 {
    ByteOrder::Little.high_byte(value)
}

/// Sign-magnitude device value to host integer. `sign_bit` is the index of the sign flag.
pub fn to_host(raw: u32, sign_bit: u8) -> i32 {
    let flag = 1u32 << sign_bit;
    let magnitude = (raw & (flag - 1)) as i32;
    if raw & flag != 0 {
        -magnitude
    } else {
        magnitude
    }
}

/// Host integer to sign-magnitude device value. Magnitudes wider than `sign_bit` bits are
/// truncated to fit.
pub fn to_device(value: i32, sign_bit: u8) -> u32 {
    let flag = 1u32 << sign_bit;
    let magnitude = value.unsigned_abs() & (flag - 1);
    if value < 0 {
        magnitude | flag
    } else {
        magnitude
    }
}

/// Degrees (any range, wrapped to one turn) to a 12-bit position.
pub fn degrees_to_position(degrees: f64) -> u16 {
    let mut wrapped = degrees.rem_euclid(360.0);
    // rem_euclid of a tiny negative angle can land exactly on 360
    if wrapped >= 360.0 {
        wrapped = 0.0;
    }
    (wrapped / 360.0 * f64::from(POSITION_MAX)).round() as u16
}

pub fn position_to_degrees(position: u16) -> f64 {
    f64::from(position.min(POSITION_MAX)) / f64::from(POSITION_MAX) * 360.0
}

/// Voltage registers count in 0.1 V.
pub fn decivolts(raw: u32) -> f32 {
    raw as f32 / 10.0
}
