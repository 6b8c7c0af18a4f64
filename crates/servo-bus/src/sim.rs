//! In-process STS servo bus.
//!
//! [`VirtualBus`] is a [`ByteChannel`] that decodes every written instruction packet and
//! answers like a chain of STS servos, each with its own 256-byte control table. Motion is
//! instant: a goal position write also sets the present position.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serial_transport::{ByteChannel, PortInfo, TransportError, DEFAULT_BAUD_RATE};
use tracing::debug;

use crate::error::ErrorFlags;
use crate::packet::{self, encode_status, Instruction, Packet};
use crate::registers::{self, ByteOrder, LOCKED};

pub const DEFAULT_MODEL: u16 = 777;
const REGISTER_COUNT: usize = 256;

/// Misbehavior to inject into one servo's replies.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Faults {
    /// Never answer.
    pub silent: bool,
    /// Bytes sent before every reply.
    pub garbage_prefix: Vec<u8>,
    /// Flip the checksum of every reply.
    pub corrupt_checksum: bool,
    /// Flags reported in every reply.
    pub flags: ErrorFlags,
}

#[derive(Clone, Debug)]
struct VirtualServo {
    registers: [u8; REGISTER_COUNT],
    staged: Vec<(u8, Vec<u8>)>,
    faults: Faults,
}

impl VirtualServo {
    fn new(id: u8, model: u16) -> Self {
        let mut servo = Self {
            registers: [0u8; REGISTER_COUNT],
            staged: Vec::new(),
            faults: Faults::default(),
        };
        servo.set_word(registers::MODEL.address, model);
        servo.set(registers::ID.address, id);
        servo.set(registers::BAUD_RATE.address, 0);
        servo.set_word(registers::MIN_ANGLE_LIMIT.address, 0);
        servo.set_word(registers::MAX_ANGLE_LIMIT.address, registers::POSITION_MAX);
        servo.set(registers::MAX_TEMPERATURE_LIMIT.address, 70);
        servo.set(registers::MAX_INPUT_VOLTAGE.address, 140);
        servo.set(registers::MIN_INPUT_VOLTAGE.address, 40);
        servo.set(registers::TORQUE_ENABLE.address, 1);
        servo.set(registers::LOCK.address, LOCKED);
        servo.set(registers::PRESENT_VOLTAGE.address, 74);
        servo.set(registers::PRESENT_TEMPERATURE.address, 30);
        servo
    }

    fn set(&mut self, address: u8, value: u8) {
        self.registers[usize::from(address)] = value;
    }

    fn set_word(&mut self, address: u8, value: u16) {
        let [lo, hi] = ByteOrder::Little.word_bytes(value);
        self.set(address, lo);
        self.set(address.wrapping_add(1), hi);
    }

    fn word(&self, address: u8) -> u16 {
        let lo = self.registers[usize::from(address)];
        let hi = self.registers[usize::from(address.wrapping_add(1))];
        ByteOrder::Little.make_word(lo, hi)
    }

    fn id(&self) -> u8 {
        self.registers[usize::from(registers::ID.address)]
    }

    fn read(&self, address: u8, length: u8) -> Option<Vec<u8>> {
        let start = usize::from(address);
        let end = start + usize::from(length);
        self.registers.get(start..end).map(<[u8]>::to_vec)
    }

    fn write(&mut self, address: u8, data: &[u8]) -> bool {
        let start = usize::from(address);
        let end = start + data.len();
        let Some(target) = self.registers.get_mut(start..end) else {
            return false;
        };
        target.copy_from_slice(data);
        let goal = usize::from(registers::GOAL_POSITION.address);
        if start <= goal + 1 && end > goal {
            let position = self.word(registers::GOAL_POSITION.address);
            self.set_word(registers::PRESENT_POSITION.address, position);
        }
        true
    }

    fn apply_staged(&mut self) {
        for (address, data) in std::mem::take(&mut self.staged) {
            self.write(address, &data);
        }
    }

    fn reply(&self, id: u8, flags: ErrorFlags, params: &[u8]) -> Vec<u8> {
        if self.faults.silent {
            return Vec::new();
        }
        let flags = flags | self.faults.flags;
        let mut frame = self.faults.garbage_prefix.clone();
        frame.extend(encode_status(id, flags, params));
        if self.faults.corrupt_checksum {
            if let Some(last) = frame.last_mut() {
                *last ^= 0xFF;
            }
        }
        frame
    }

    fn read_reply(&self, id: u8, address: u8, length: u8) -> Vec<u8> {
        match self.read(address, length) {
            Some(params) => self.reply(id, ErrorFlags::default(), &params),
            None => self.reply(
                id,
                ErrorFlags::from_bits(ErrorFlags::INSTRUCTION),
                &vec![0u8; usize::from(length)],
            ),
        }
    }
}

#[derive(Debug)]
struct SimState {
    servos: BTreeMap<u8, VirtualServo>,
    rx: VecDeque<u8>,
    requests: Vec<Packet>,
    closed: bool,
}

impl SimState {
    fn handle(&mut self, request: &Packet) {
        let params = request.params();
        if request.is_broadcast() {
            match request.instruction() {
                Instruction::SyncWrite => self.sync_write(params),
                Instruction::SyncRead => self.sync_read(params),
                Instruction::Action => self.servos.values_mut().for_each(VirtualServo::apply_staged),
                Instruction::Write => {
                    if let Some((&address, data)) = params.split_first() {
                        for servo in self.servos.values_mut() {
                            servo.write(address, data);
                        }
                    }
                }
                Instruction::RegWrite => {
                    if let Some((&address, data)) = params.split_first() {
                        for servo in self.servos.values_mut() {
                            servo.staged.push((address, data.to_vec()));
                        }
                    }
                }
                Instruction::Ping | Instruction::Read => {}
            }
            return;
        }

        let id = request.id();
        let Some(servo) = self.servos.get_mut(&id) else {
            return;
        };
        let reply = match request.instruction() {
            Instruction::Ping => servo.reply(id, ErrorFlags::default(), &[]),
            Instruction::Read => match params {
                [address, length] => servo.read_reply(id, *address, *length),
                _ => servo.reply(id, ErrorFlags::from_bits(ErrorFlags::INSTRUCTION), &[]),
            },
            Instruction::Write => {
                let ok = params
                    .split_first()
                    .is_some_and(|(&address, data)| servo.write(address, data));
                servo.reply(id, instruction_flags(ok), &[])
            }
            Instruction::RegWrite => {
                let ok = match params.split_first() {
                    Some((&address, data)) => {
                        servo.staged.push((address, data.to_vec()));
                        true
                    }
                    None => false,
                };
                servo.reply(id, instruction_flags(ok), &[])
            }
            Instruction::Action => {
                servo.apply_staged();
                servo.reply(id, ErrorFlags::default(), &[])
            }
            Instruction::SyncWrite | Instruction::SyncRead => Vec::new(),
        };
        self.rx.extend(reply);

        // an id write re-addresses the servo after it has answered under the old id
        if let Some(servo) = self.servos.get(&id) {
            let new_id = servo.id();
            if new_id != id {
                if let Some(servo) = self.servos.remove(&id) {
                    debug!(old = id, new = new_id, "virtual servo changed id");
                    self.servos.insert(new_id, servo);
                }
            }
        }
    }

    fn sync_write(&mut self, params: &[u8]) {
        let [address, width, entries @ ..] = params else {
            return;
        };
        let width = usize::from(*width);
        if width == 0 {
            return;
        }
        for entry in entries.chunks_exact(width + 1) {
            if let Some(servo) = self.servos.get_mut(&entry[0]) {
                servo.write(*address, &entry[1..]);
            }
        }
    }

    fn sync_read(&mut self, params: &[u8]) {
        let [address, length, ids @ ..] = params else {
            return;
        };
        for id in ids {
            if let Some(servo) = self.servos.get(id) {
                let reply = servo.read_reply(*id, *address, *length);
                self.rx.extend(reply);
            }
        }
    }
}

fn instruction_flags(ok: bool) -> ErrorFlags {
    if ok {
        ErrorFlags::default()
    } else {
        ErrorFlags::from_bits(ErrorFlags::INSTRUCTION)
    }
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Virtual bus endpoint. Keep a [`VirtualBusHandle`] to inspect or disturb the servos after
/// the bus is moved into an engine.
#[derive(Debug)]
pub struct VirtualBus {
    name: String,
    baud_rate: u32,
    state: Arc<Mutex<SimState>>,
}

/// Test-side view of a [`VirtualBus`].
#[derive(Debug, Clone)]
pub struct VirtualBusHandle {
    state: Arc<Mutex<SimState>>,
}

impl VirtualBus {
    pub fn new() -> Self {
        Self {
            name: "virtual0".to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            state: Arc::new(Mutex::new(SimState {
                servos: BTreeMap::new(),
                rx: VecDeque::new(),
                requests: Vec::new(),
                closed: false,
            })),
        }
    }

    pub fn with_servos(ids: impl IntoIterator<Item = u8>) -> Self {
        let bus = Self::new();
        let handle = bus.handle();
        for id in ids {
            handle.add_servo(id);
        }
        bus
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> VirtualBusHandle {
        VirtualBusHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl Default for VirtualBus {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualBusHandle {
    pub fn add_servo(&self, id: u8) {
        self.add_servo_model(id, DEFAULT_MODEL);
    }

    pub fn add_servo_model(&self, id: u8, model: u16) {
        lock(&self.state)
            .servos
            .entry(id)
            .or_insert_with(|| VirtualServo::new(id, model));
    }

    pub fn remove_servo(&self, id: u8) -> bool {
        lock(&self.state).servos.remove(&id).is_some()
    }

    pub fn ids(&self) -> Vec<u8> {
        lock(&self.state).servos.keys().copied().collect()
    }

    pub fn set_faults(&self, id: u8, faults: Faults) -> bool {
        match lock(&self.state).servos.get_mut(&id) {
            Some(servo) => {
                servo.faults = faults;
                true
            }
            None => false,
        }
    }

    pub fn set_silent(&self, id: u8, silent: bool) -> bool {
        self.update_faults(id, |faults| faults.silent = silent)
    }

    pub fn set_error_flags(&self, id: u8, flags: ErrorFlags) -> bool {
        self.update_faults(id, |faults| faults.flags = flags)
    }

    fn update_faults(&self, id: u8, f: impl FnOnce(&mut Faults)) -> bool {
        match lock(&self.state).servos.get_mut(&id) {
            Some(servo) => {
                f(&mut servo.faults);
                true
            }
            None => false,
        }
    }

    pub fn register(&self, id: u8, address: u8) -> Option<u8> {
        lock(&self.state)
            .servos
            .get(&id)
            .map(|servo| servo.registers[usize::from(address)])
    }

    /// Little-endian word at `address`.
    pub fn word(&self, id: u8, address: u8) -> Option<u16> {
        lock(&self.state).servos.get(&id).map(|servo| servo.word(address))
    }

    pub fn set_register(&self, id: u8, address: u8, value: u8) -> bool {
        match lock(&self.state).servos.get_mut(&id) {
            Some(servo) => {
                servo.set(address, value);
                true
            }
            None => false,
        }
    }

    pub fn set_word(&self, id: u8, address: u8, value: u16) -> bool {
        match lock(&self.state).servos.get_mut(&id) {
            Some(servo) => {
                servo.set_word(address, value);
                true
            }
            None => false,
        }
    }

    /// Every instruction packet the bus has decoded, in order.
    pub fn requests(&self) -> Vec<Packet> {
        lock(&self.state).requests.clone()
    }

    pub fn clear_requests(&self) {
        lock(&self.state).requests.clear();
    }

}

impl ByteChannel for VirtualBus {
    fn open(path: &str, baud_rate: u32) -> serial_transport::Result<Self> {
        let mut bus = Self::new();
        bus.name = path.to_string();
        bus.baud_rate = baud_rate;
        Ok(bus)
    }

    fn list() -> serial_transport::Result<Vec<PortInfo>> {
        Ok(vec![PortInfo {
            name: "virtual0".to_string(),
            driver: "sim".to_string(),
        }])
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> serial_transport::Result<()> {
        self.baud_rate = baud_rate;
        Ok(())
    }

    // replies are queued during `write`, so reads never block
    fn set_timeout(&mut self, _timeout: Duration) -> serial_transport::Result<()> {
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> serial_transport::Result<usize> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(TransportError::Closed);
        }
        match packet::decode_request(bytes) {
            Ok(request) => {
                state.handle(&request);
                state.requests.push(request);
            }
            Err(e) => debug!(error = %e, "virtual bus ignored malformed request"),
        }
        Ok(bytes.len())
    }

    fn read(&mut self, max_len: usize) -> serial_transport::Result<Vec<u8>> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(TransportError::Closed);
        }
        let take = max_len.min(state.rx.len());
        Ok(state.rx.drain(..take).collect())
    }

    fn clear_buffers(&mut self) -> serial_transport::Result<()> {
        lock(&self.state).rx.clear();
        Ok(())
    }

    fn close(&mut self) -> serial_transport::Result<()> {
        lock(&self.state).closed = true;
        Ok(())
    }
}
