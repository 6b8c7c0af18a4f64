//! Wire framing: `[0xFF][0xFF][ID][LEN][INSTR|ERROR][PARAM...][CHECKSUM]`.
//!
//! `LEN` counts the parameters plus the instruction (or error) byte and the checksum.
//! The checksum is the inverted 8-bit sum of every byte from `ID` through the last parameter.

use crate::error::{ErrorFlags, FramingError, ValidationError};

pub const HEADER: [u8; 2] = [0xFF, 0xFF];
pub const BROADCAST_ID: u8 = 0xFE;
/// Highest addressable servo id.
pub const MAX_ID: u8 = 0xFD;
/// Longest packet either side may put on the line.
pub const MAX_PACKET_LEN: usize = 250;
/// Header, id, length, instruction and checksum.
pub const PACKET_OVERHEAD: usize = 6;

const PKT_ID: usize = 2;
const PKT_LENGTH: usize = 3;
const PKT_INSTRUCTION: usize = 4;
const PKT_PARAMETER0: usize = 5;

/// Instruction codes understood by STS/SMS/SCSCL firmware.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum Instruction {
    Ping = 0x01,
    Read = 0x02,
    Write = 0x03,
    RegWrite = 0x04,
    Action = 0x05,
    SyncRead = 0x82,
    SyncWrite = 0x83,
}

impl Instruction {
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x01 => Instruction::Ping,
            0x02 => Instruction::Read,
            0x03 => Instruction::Write,
            0x04 => Instruction::RegWrite,
            0x05 => Instruction::Action,
            0x82 => Instruction::SyncRead,
            0x83 => Instruction::SyncWrite,
            _ => return None,
        })
    }

    /// Whether a unicast servo answers this instruction with a status packet.
    pub const fn expects_status(self) -> bool {
        !matches!(self, Instruction::SyncRead | Instruction::SyncWrite)
    }
}

/// An instruction packet, validated on construction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Packet {
    id: u8,
    instruction: Instruction,
    params: Vec<u8>,
}

impl Packet {
    pub fn new(id: u8, instruction: Instruction, params: Vec<u8>) -> Result<Self, ValidationError> {
        if id > MAX_ID && id != BROADCAST_ID {
            return Err(ValidationError::InvalidId(id));
        }
        let len = params.len() + PACKET_OVERHEAD;
        if len > MAX_PACKET_LEN {
            return Err(ValidationError::PacketTooLong {
                len,
                max: MAX_PACKET_LEN,
            });
        }
        Ok(Self {
            id,
            instruction,
            params,
        })
    }

    pub fn ping(id: u8) -> Result<Self, ValidationError> {
        unicast_only(id)?;
        Self::new(id, Instruction::Ping, Vec::new())
    }

    pub fn read(id: u8, address: u8, length: u8) -> Result<Self, ValidationError> {
        unicast_only(id)?;
        if length == 0 {
            return Err(ValidationError::EmptyPayload);
        }
        Self::new(id, Instruction::Read, vec![address, length])
    }

    pub fn write(id: u8, address: u8, data: &[u8]) -> Result<Self, ValidationError> {
        Self::new(id, Instruction::Write, addressed(address, data)?)
    }

    pub fn reg_write(id: u8, address: u8, data: &[u8]) -> Result<Self, ValidationError> {
        Self::new(id, Instruction::RegWrite, addressed(address, data)?)
    }

    pub fn action(id: u8) -> Result<Self, ValidationError> {
        Self::new(id, Instruction::Action, Vec::new())
    }

    /// One broadcast packet carrying `[id, data...]` groups of identical width.
    pub fn sync_write(address: u8, entries: &[(u8, &[u8])]) -> Result<Self, ValidationError> {
        let Some((_, first)) = entries.first() else {
            return Err(ValidationError::EmptyBatch);
        };
        let width = first.len();
        if width == 0 {
            return Err(ValidationError::EmptyPayload);
        }
        let width_byte = u8::try_from(width).map_err(|_| ValidationError::PacketTooLong {
            len: width,
            max: MAX_PACKET_LEN,
        })?;
        let mut params = Vec::with_capacity(2 + entries.len() * (width + 1));
        params.push(address);
        params.push(width_byte);
        for (id, data) in entries {
            unicast_only(*id)?;
            if data.len() != width {
                return Err(ValidationError::WidthMismatch {
                    expected: width,
                    found: data.len(),
                });
            }
            params.push(*id);
            params.extend_from_slice(data);
        }
        Self::new(BROADCAST_ID, Instruction::SyncWrite, params)
    }

    pub fn sync_read(address: u8, length: u8, ids: &[u8]) -> Result<Self, ValidationError> {
        if ids.is_empty() {
            return Err(ValidationError::EmptyBatch);
        }
        if length == 0 {
            return Err(ValidationError::EmptyPayload);
        }
        let mut params = Vec::with_capacity(2 + ids.len());
        params.push(address);
        params.push(length);
        for id in ids {
            unicast_only(*id)?;
            params.push(*id);
        }
        Self::new(BROADCAST_ID, Instruction::SyncRead, params)
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn instruction(&self) -> Instruction {
        self.instruction
    }

    pub fn params(&self) -> &[u8] {
        &self.params
    }

    pub fn is_broadcast(&self) -> bool {
        self.id == BROADCAST_ID
    }

    pub fn encoded_len(&self) -> usize {
        self.params.len() + PACKET_OVERHEAD
    }

    /// Wire bytes for this packet.
    pub fn encode(&self) -> Vec<u8> {
        frame(self.id, self.instruction.code(), &self.params)
    }
}

fn unicast_only(id: u8) -> Result<(), ValidationError> {
    if id == BROADCAST_ID {
        return Err(ValidationError::BroadcastNotAllowed);
    }
    if id > MAX_ID {
        return Err(ValidationError::InvalidId(id));
    }
    Ok(())
}

fn addressed(address: u8, data: &[u8]) -> Result<Vec<u8>, ValidationError> {
    if data.is_empty() {
        return Err(ValidationError::EmptyPayload);
    }
    let mut params = Vec::with_capacity(1 + data.len());
    params.push(address);
    params.extend_from_slice(data);
    Ok(params)
}

/// Encode an instruction packet from its parts.
pub fn encode(id: u8, instruction: Instruction, params: &[u8]) -> Result<Vec<u8>, ValidationError> {
    Ok(Packet::new(id, instruction, params.to_vec())?.encode())
}

/// Inverted 8-bit sum over `ID..=last parameter`.
pub fn checksum(body: &[u8]) -> u8 {
    !body.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

fn frame(id: u8, middle: u8, params: &[u8]) -> Vec<u8> {
    let length = (params.len() + 2) as u8;
    let mut out = Vec::with_capacity(params.len() + PACKET_OVERHEAD);
    out.extend_from_slice(&HEADER);
    out.push(id);
    out.push(length);
    out.push(middle);
    out.extend_from_slice(params);
    out.push(checksum(&out[PKT_ID..]));
    out
}

/// A reply from one servo.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StatusPacket {
    pub id: u8,
    pub error: ErrorFlags,
    pub params: Vec<u8>,
}

/// Encode a status packet, as a servo would.
pub fn encode_status(id: u8, error: ErrorFlags, params: &[u8]) -> Vec<u8> {
    frame(id, error.bits(), params)
}

/// Result of scanning a receive buffer for one status packet.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Scan {
    /// A well-formed packet ending at `consumed`.
    Frame { status: StatusPacket, consumed: usize },
    /// No complete packet yet; the first `skip` bytes are garbage and may be dropped.
    Incomplete { skip: usize },
    /// A framed packet ending at `consumed` failed its checksum. `id` is the id byte it
    /// carried, which may itself be damaged.
    Corrupt {
        id: u8,
        error: FramingError,
        consumed: usize,
    },
}

/// Locate and validate the first status packet in `buf`, skipping leading noise.
///
/// A header whose id, length or error byte cannot belong to a status packet is treated as
/// noise and the search resumes one byte later.
pub fn scan(buf: &[u8]) -> Scan {
    let mut start = 0;
    loop {
        let Some(offset) = find_header(&buf[start..]) else {
            let keep = usize::from(buf.last() == Some(&HEADER[0]));
            return Scan::Incomplete {
                skip: buf.len() - keep,
            };
        };
        let idx = start + offset;
        if buf.len() < idx + PACKET_OVERHEAD {
            return Scan::Incomplete { skip: idx };
        }
        let id = buf[idx + PKT_ID];
        let length = usize::from(buf[idx + PKT_LENGTH]);
        let error = buf[idx + PKT_INSTRUCTION];
        if id > MAX_ID || length < 2 || length + 4 > MAX_PACKET_LEN || error > 0x7F {
            start = idx + 1;
            continue;
        }
        let end = idx + length + 4;
        if buf.len() < end {
            return Scan::Incomplete { skip: idx };
        }
        let expected = checksum(&buf[idx + PKT_ID..end - 1]);
        let found = buf[end - 1];
        if expected != found {
            return Scan::Corrupt {
                id,
                error: FramingError::ChecksumMismatch { expected, found },
                consumed: end,
            };
        }
        return Scan::Frame {
            status: StatusPacket {
                id,
                error: ErrorFlags::from_bits(error),
                params: buf[idx + PKT_PARAMETER0..end - 1].to_vec(),
            },
            consumed: end,
        };
    }
}

fn find_header(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == HEADER)
}

/// Decode one complete status packet from `bytes`.
pub fn decode(bytes: &[u8]) -> Result<StatusPacket, FramingError> {
    match scan(bytes) {
        Scan::Frame { status, .. } => Ok(status),
        Scan::Corrupt { error, .. } => Err(error),
        Scan::Incomplete { skip } => {
            let rest = &bytes[skip..];
            if rest.len() >= 2 && rest[..2] == HEADER {
                let need = if rest.len() > PKT_LENGTH {
                    usize::from(rest[PKT_LENGTH]) + 4
                } else {
                    PACKET_OVERHEAD
                };
                Err(FramingError::Truncated {
                    have: rest.len(),
                    need,
                })
            } else {
                Err(FramingError::NoSync)
            }
        }
    }
}

/// Decode an instruction packet, as a servo would. Leading noise before the header is skipped.
pub fn decode_request(bytes: &[u8]) -> Result<Packet, FramingError> {
    let idx = find_header(bytes).ok_or(FramingError::NoSync)?;
    let buf = &bytes[idx..];
    if buf.len() < PACKET_OVERHEAD {
        return Err(FramingError::Truncated {
            have: buf.len(),
            need: PACKET_OVERHEAD,
        });
    }
    let length = buf[PKT_LENGTH];
    if length < 2 || usize::from(length) + 4 > MAX_PACKET_LEN {
        return Err(FramingError::BadLength(length));
    }
    let end = usize::from(length) + 4;
    if buf.len() < end {
        return Err(FramingError::Truncated {
            have: buf.len(),
            need: end,
        });
    }
    let expected = checksum(&buf[PKT_ID..end - 1]);
    if expected != buf[end - 1] {
        return Err(FramingError::ChecksumMismatch {
            expected,
            found: buf[end - 1],
        });
    }
    let code = buf[PKT_INSTRUCTION];
    let instruction = Instruction::from_code(code).ok_or(FramingError::UnknownInstruction(code))?;
    Ok(Packet {
        id: buf[PKT_ID],
        instruction,
        params: buf[PKT_PARAMETER0..end - 1].to_vec(),
    })
}
