//! Servo-level operations on top of the shared bus.
//!
//! Nothing here caches device state or retries. Bulk helpers are plain sequential loops; a
//! failure for one servo is logged and reported for that servo only.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serial_transport::ByteChannel;
use time::OffsetDateTime;
use tracing::{debug, error, warn};

use crate::bus::SharedBus;
use crate::engine::TransactionEngine;
use crate::error::{BusError, CommError, ErrorFlags, FramingError, ValidationError};
use crate::group::{GroupSyncRead, GroupSyncWrite};
use crate::packet::{Packet, BROADCAST_ID, MAX_ID};
use crate::registers::{
    self, decivolts, to_device, to_host, ByteOrder, Register, LOCKED, POSITION_COMMAND_LEN,
    SIGN_BIT_16, UNLOCKED,
};

pub const DEFAULT_SPEED: u16 = 800;
pub const DEFAULT_ACCELERATION: u8 = 25;

/// Largest magnitude a 16-bit sign-magnitude register holds.
const MAGNITUDE_MAX: i32 = 0x7FFF;

/// Speed and acceleration used for position commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionProfile {
    pub speed: u16,
    pub acceleration: u8,
}

impl Default for MotionProfile {
    fn default() -> Self {
        Self {
            speed: DEFAULT_SPEED,
            acceleration: DEFAULT_ACCELERATION,
        }
    }
}

/// Snapshot assembled by [`ServoBus::read_state`]. Fields that could not be read are `None`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MotorState {
    pub id: u8,
    pub model_number: u16,
    pub min_voltage_limit: Option<f32>,
    pub max_voltage_limit: Option<f32>,
    pub max_temperature: Option<u8>,
    pub min_angle_limit: Option<i32>,
    pub max_angle_limit: Option<i32>,
    pub position: Option<i32>,
    pub temperature: Option<u8>,
    pub voltage: Option<f32>,
    /// Every error flag reported while the snapshot was read.
    pub flags: ErrorFlags,
    /// RFC 3339 time the snapshot was taken.
    pub read_at: Option<String>,
}

impl MotorState {
    fn new(id: u8, model_number: u16) -> Self {
        Self {
            id,
            model_number,
            min_voltage_limit: None,
            max_voltage_limit: None,
            max_temperature: None,
            min_angle_limit: None,
            max_angle_limit: None,
            position: None,
            temperature: None,
            voltage: None,
            flags: ErrorFlags::default(),
            read_at: OffsetDateTime::now_utc()
                .format(&time::format_description::well_known::Rfc3339)
                .ok(),
        }
    }

    /// Whether every register of the snapshot was read.
    pub fn is_complete(&self) -> bool {
        self.min_voltage_limit.is_some()
            && self.max_voltage_limit.is_some()
            && self.max_temperature.is_some()
            && self.min_angle_limit.is_some()
            && self.max_angle_limit.is_some()
            && self.position.is_some()
            && self.temperature.is_some()
            && self.voltage.is_some()
    }
}

fn or_unknown<T: fmt::Display>(value: &Option<T>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "?".to_string(),
    }
}

impl fmt::Display for MotorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Motor #{} | Model #{}", self.id, self.model_number)?;
        writeln!(f, "--------------------------")?;
        writeln!(
            f,
            " Position:    {} - [{}, {}]",
            or_unknown(&self.position),
            or_unknown(&self.min_angle_limit),
            or_unknown(&self.max_angle_limit)
        )?;
        writeln!(
            f,
            " Voltage:     {} V - [{}, {}]",
            or_unknown(&self.voltage),
            or_unknown(&self.min_voltage_limit),
            or_unknown(&self.max_voltage_limit)
        )?;
        write!(
            f,
            " Temperature: {}/{} C",
            or_unknown(&self.temperature),
            or_unknown(&self.max_temperature)
        )?;
        if !self.flags.is_empty() {
            write!(f, "\n Errors:      {}", self.flags)?;
        }
        Ok(())
    }
}

fn check_magnitude(what: &'static str, value: i32) -> Result<(), ValidationError> {
    if value.unsigned_abs() > MAGNITUDE_MAX as u32 {
        return Err(ValidationError::ValueOutOfRange {
            what,
            value: i64::from(value),
        });
    }
    Ok(())
}

fn unicast(id: u8) -> Result<(), ValidationError> {
    match id {
        BROADCAST_ID => Err(ValidationError::BroadcastNotAllowed),
        id if id > MAX_ID => Err(ValidationError::InvalidId(id)),
        _ => Ok(()),
    }
}

/// The 7-byte block written from the acceleration register: acceleration, goal position,
/// goal time (always zero), goal speed.
pub fn position_command(
    order: ByteOrder,
    position: i32,
    speed: i32,
    acceleration: u8,
) -> Result<[u8; POSITION_COMMAND_LEN], ValidationError> {
    check_magnitude("position", position)?;
    check_magnitude("speed", speed)?;
    let [p0, p1] = order.word_bytes(to_device(position, SIGN_BIT_16) as u16);
    let [s0, s1] = order.word_bytes(to_device(speed, SIGN_BIT_16) as u16);
    Ok([acceleration, p0, p1, 0, 0, s0, s1])
}

fn write_on<C: ByteChannel>(
    engine: &mut TransactionEngine<C>,
    id: u8,
    address: u8,
    data: &[u8],
) -> Result<(), BusError> {
    let packet = Packet::write(id, address, data)?;
    engine.transact(&packet, true).into_result().map(|_| ())
}

/// Run `write` between an EPROM unlock on `id` and a relock on `relock_id`, holding the bus
/// for all three exchanges.
///
/// An unlock that gets no valid reply aborts before anything else is sent. Error flags on the
/// unlock reply are only logged. The relock runs even if `write` fails.
fn bracketed<C: ByteChannel>(
    engine: &mut TransactionEngine<C>,
    id: u8,
    relock_id: u8,
    write: impl FnOnce(&mut TransactionEngine<C>) -> Result<(), BusError>,
) -> Result<(), BusError> {
    match write_on(engine, id, registers::LOCK.address, &[UNLOCKED]) {
        Ok(()) => {}
        Err(BusError::Device { flags, .. }) => {
            warn!(id, %flags, "EPROM unlock reported error flags");
        }
        Err(e) => {
            error!(id, error = %e, "EPROM unlock failed, write skipped");
            return Err(e);
        }
    }
    let written = write(engine);
    if let Err(e) = &written {
        error!(id, error = %e, "EPROM write failed");
    }
    let relocked = write_on(engine, relock_id, registers::LOCK.address, &[LOCKED]);
    if let Err(e) = &relocked {
        error!(id = relock_id, error = %e, "EPROM relock failed");
    }
    written.and(relocked)
}

/// Facade over one bus. Clones share the same bus lock.
pub struct ServoBus<C: ByteChannel> {
    bus: SharedBus<C>,
    order: ByteOrder,
}

impl<C: ByteChannel> Clone for ServoBus<C> {
    fn clone(&self) -> Self {
        Self {
            bus: self.bus.clone(),
            order: self.order,
        }
    }
}

impl<C: ByteChannel> ServoBus<C> {
    pub fn new(bus: SharedBus<C>) -> Self {
        Self {
            bus,
            order: ByteOrder::default(),
        }
    }

    pub fn from_channel(channel: C) -> Self {
        Self::new(SharedBus::from_channel(channel))
    }

    pub fn with_byte_order(mut self, order: ByteOrder) -> Self {
        self.order = order;
        self
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.order
    }

    pub fn shared(&self) -> &SharedBus<C> {
        &self.bus
    }

    pub fn close(&self) -> serial_transport::Result<()> {
        self.bus.lock().channel_mut().close()
    }

    // ---- raw register access ----

    pub fn read_bytes(&self, id: u8, address: u8, length: u8) -> Result<Vec<u8>, BusError> {
        let packet = Packet::read(id, address, length)?;
        self.bus.transact(&packet, true).into_result()
    }

    /// Write `data` at `address`. Unicast writes wait for the acknowledgment.
    pub fn write_bytes(&self, id: u8, address: u8, data: &[u8]) -> Result<(), BusError> {
        self.bus.with(|engine| write_on(engine, id, address, data))
    }

    fn decode(&self, register: Register, bytes: &[u8]) -> Result<i32, BusError> {
        if bytes.len() != usize::from(register.width) {
            return Err(CommError::Framing(FramingError::BadLength(bytes.len() as u8)).into());
        }
        let raw = self
            .order
            .decode(bytes)
            .ok_or(CommError::Framing(FramingError::BadLength(register.width)))?;
        Ok(if register.signed {
            to_host(raw, register.sign_bit())
        } else {
            raw as i32
        })
    }

    /// Read one register. Device error flags fail the read; their parameters travel in
    /// [`BusError::Device`].
    pub fn read_register(&self, id: u8, register: Register) -> Result<i32, BusError> {
        let bytes = self.read_bytes(id, register.address, register.width)?;
        self.decode(register, &bytes)
    }

    /// Read one register, accepting a value that arrives with device error flags. The flags
    /// are returned with it.
    pub fn read_register_flagged(
        &self,
        id: u8,
        register: Register,
    ) -> Result<(i32, ErrorFlags), BusError> {
        let packet = Packet::read(id, register.address, register.width)?;
        let (bytes, flags) = self.bus.transact(&packet, true).into_params()?;
        if !flags.is_empty() {
            warn!(id, register = register.name, %flags, "value read with error flags");
        }
        Ok((self.decode(register, &bytes)?, flags))
    }

    fn register_bytes(&self, register: Register, value: i32) -> Result<Vec<u8>, ValidationError> {
        let out_of_range = || ValidationError::ValueOutOfRange {
            what: register.name,
            value: i64::from(value),
        };
        let raw = if register.signed {
            let limit = (1i32 << register.sign_bit()) - 1;
            if value.unsigned_abs() > limit as u32 {
                return Err(out_of_range());
            }
            to_device(value, register.sign_bit())
        } else {
            let limit = (1i64 << (8 * u32::from(register.width))) - 1;
            if value < 0 || i64::from(value) > limit {
                return Err(out_of_range());
            }
            value as u32
        };
        Ok(match register.width {
            1 => vec![raw as u8],
            2 => self.order.word_bytes(raw as u16).to_vec(),
            _ => self.order.dword_bytes(raw).to_vec(),
        })
    }

    /// Write one register. EPROM registers are wrapped in the unlock/lock bracket.
    pub fn write_register(&self, id: u8, register: Register, value: i32) -> Result<(), BusError> {
        if !register.is_writable() {
            return Err(ValidationError::ReadOnly(register.name).into());
        }
        let bytes = self.register_bytes(register, value)?;
        if register.needs_unlock() {
            unicast(id)?;
            return self.bus.with(|engine| {
                bracketed(engine, id, id, |engine| {
                    write_on(engine, id, register.address, &bytes)
                })
            });
        }
        self.write_bytes(id, register.address, &bytes)
    }

    // ---- discovery ----

    /// True when `id` answers a ping, whatever its error flags.
    pub fn ping(&self, id: u8) -> bool {
        let Ok(packet) = Packet::ping(id) else {
            return false;
        };
        let outcome = self.bus.transact(&packet, true);
        if !outcome.flags().is_empty() {
            warn!(id, flags = %outcome.flags(), "ping answered with error flags");
        }
        outcome.responded()
    }

    /// Ping, then read the model number.
    pub fn ping_model(&self, id: u8) -> Result<u16, BusError> {
        self.ping_model_flagged(id).map(|(model, _)| model)
    }

    /// [`ServoBus::ping_model`] together with the flags of both replies.
    fn ping_model_flagged(&self, id: u8) -> Result<(u16, ErrorFlags), BusError> {
        unicast(id)?;
        let packet = Packet::ping(id)?;
        let (_, ping_flags) = self.bus.transact(&packet, true).into_params()?;
        let (model, read_flags) = self.read_register_flagged(id, registers::MODEL)?;
        Ok((model as u16, ping_flags | read_flags))
    }

    /// Ping every id in `ids` and return the model numbers of those that answer.
    pub fn discover(&self, ids: impl IntoIterator<Item = u8>) -> Vec<(u8, u16)> {
        ids.into_iter()
            .filter_map(|id| match self.ping_model(id) {
                Ok(model) => {
                    debug!(id, model, "servo found");
                    Some((id, model))
                }
                Err(_) => None,
            })
            .collect()
    }

    // ---- state reads ----

    pub fn read_position(&self, id: u8) -> Result<i32, BusError> {
        self.read_register(id, registers::PRESENT_POSITION)
    }

    pub fn read_speed(&self, id: u8) -> Result<i32, BusError> {
        self.read_register(id, registers::PRESENT_SPEED)
    }

    /// Position and speed from one 4-byte read.
    pub fn read_position_speed(&self, id: u8) -> Result<(i32, i32), BusError> {
        let bytes = self.read_bytes(id, registers::PRESENT_POSITION.address, 4)?;
        let raw = self
            .order
            .decode(&bytes)
            .ok_or(CommError::Framing(FramingError::BadLength(bytes.len() as u8)))?;
        Ok((
            to_host(u32::from(registers::low_word(raw)), SIGN_BIT_16),
            to_host(u32::from(registers::high_word(raw)), SIGN_BIT_16),
        ))
    }

    pub fn read_moving(&self, id: u8) -> Result<bool, BusError> {
        Ok(self.read_register(id, registers::MOVING)? != 0)
    }

    pub fn read_load(&self, id: u8) -> Result<i32, BusError> {
        self.read_register(id, registers::PRESENT_LOAD)
    }

    pub fn read_current(&self, id: u8) -> Result<i32, BusError> {
        self.read_register(id, registers::PRESENT_CURRENT)
    }

    /// Supply voltage in volts.
    pub fn read_voltage(&self, id: u8) -> Result<f32, BusError> {
        Ok(decivolts(self.read_register(id, registers::PRESENT_VOLTAGE)? as u32))
    }

    /// `(min, max)` input voltage limits in volts.
    pub fn read_voltage_limits(&self, id: u8) -> Result<(f32, f32), BusError> {
        let max = self.read_register(id, registers::MAX_INPUT_VOLTAGE)?;
        let min = self.read_register(id, registers::MIN_INPUT_VOLTAGE)?;
        Ok((decivolts(min as u32), decivolts(max as u32)))
    }

    /// Temperature in °C.
    pub fn read_temperature(&self, id: u8) -> Result<u8, BusError> {
        Ok(self.read_register(id, registers::PRESENT_TEMPERATURE)? as u8)
    }

    pub fn read_temperature_limit(&self, id: u8) -> Result<u8, BusError> {
        Ok(self.read_register(id, registers::MAX_TEMPERATURE_LIMIT)? as u8)
    }

    /// `(min, max)` angle limits as raw positions.
    pub fn read_angle_limits(&self, id: u8) -> Result<(i32, i32), BusError> {
        let min = self.read_register(id, registers::MIN_ANGLE_LIMIT)?;
        let max = self.read_register(id, registers::MAX_ANGLE_LIMIT)?;
        Ok((min, max))
    }

    fn sub_read(&self, id: u8, register: Register, seen: &mut ErrorFlags) -> Option<i32> {
        match self.read_register_flagged(id, register) {
            Ok((value, flags)) => {
                *seen |= flags;
                Some(value)
            }
            Err(e) => {
                warn!(id, register = register.name, error = %e, "state read incomplete");
                None
            }
        }
    }

    /// Model, voltages, temperatures, position and angle limits of one servo.
    ///
    /// `None` when the servo does not answer the ping. Later reads that fail leave their field
    /// empty. Error flags from every reply are collected in [`MotorState::flags`].
    pub fn read_state(&self, id: u8) -> Option<MotorState> {
        let (model, flags) = match self.ping_model_flagged(id) {
            Ok(found) => found,
            Err(e) => {
                warn!(id, error = %e, "ping failed");
                return None;
            }
        };
        let mut state = MotorState::new(id, model);
        state.flags = flags;
        let volts = |raw: i32| decivolts(raw as u32);
        let seen = &mut state.flags;
        let voltage = self.sub_read(id, registers::PRESENT_VOLTAGE, seen).map(volts);
        let max_voltage = self.sub_read(id, registers::MAX_INPUT_VOLTAGE, seen).map(volts);
        let min_voltage = self.sub_read(id, registers::MIN_INPUT_VOLTAGE, seen).map(volts);
        let max_temperature = self
            .sub_read(id, registers::MAX_TEMPERATURE_LIMIT, seen)
            .map(|t| t as u8);
        let temperature = self
            .sub_read(id, registers::PRESENT_TEMPERATURE, seen)
            .map(|t| t as u8);
        let position = self.sub_read(id, registers::PRESENT_POSITION, seen);
        let min_angle = self.sub_read(id, registers::MIN_ANGLE_LIMIT, seen);
        let max_angle = self.sub_read(id, registers::MAX_ANGLE_LIMIT, seen);

        state.voltage = voltage;
        state.max_voltage_limit = max_voltage;
        state.min_voltage_limit = min_voltage;
        state.max_temperature = max_temperature;
        state.temperature = temperature;
        state.position = position;
        state.min_angle_limit = min_angle;
        state.max_angle_limit = max_angle;
        Some(state)
    }

    /// Present position of every id, in order, with a result per id. A position that arrived
    /// with device error flags is returned together with them.
    pub fn read_positions(&self, ids: &[u8]) -> Vec<(u8, Result<(i32, ErrorFlags), BusError>)> {
        ids.iter()
            .map(|&id| {
                let result = self.read_register_flagged(id, registers::PRESENT_POSITION);
                if let Err(e) = &result {
                    error!(id, error = %e, "failed to read position");
                }
                (id, result)
            })
            .collect()
    }

    /// Positions of the ids that answered, flags dropped.
    pub fn get_positions(&self, ids: &[u8]) -> BTreeMap<u8, i32> {
        self.read_positions(ids)
            .into_iter()
            .filter_map(|(id, result)| result.ok().map(|(position, _)| (id, position)))
            .collect()
    }

    // ---- motion ----

    pub fn write_position(
        &self,
        id: u8,
        position: i32,
        speed: u16,
        acceleration: u8,
    ) -> Result<(), BusError> {
        let command = position_command(self.order, position, i32::from(speed), acceleration)?;
        debug!(id, position, speed, acceleration, "write position");
        self.write_bytes(id, registers::ACCELERATION.address, &command)
    }

    /// One unicast position write per entry. Every entry is attempted.
    pub fn set_positions(
        &self,
        positions: &[(u8, i32)],
        motion: MotionProfile,
    ) -> Vec<(u8, Result<(), BusError>)> {
        positions
            .iter()
            .map(|&(id, position)| {
                let result =
                    self.write_position(id, position, motion.speed, motion.acceleration);
                match &result {
                    Err(BusError::Device { flags, .. }) => {
                        error!(id, %flags, "servo reported error after position write");
                    }
                    Err(e) => error!(id, error = %e, "failed to send position"),
                    Ok(()) => {}
                }
                (id, result)
            })
            .collect()
    }

    /// Stage a position command; it runs on the next [`ServoBus::action`].
    pub fn reg_write_position(
        &self,
        id: u8,
        position: i32,
        speed: u16,
        acceleration: u8,
    ) -> Result<(), BusError> {
        let command = position_command(self.order, position, i32::from(speed), acceleration)?;
        let packet = Packet::reg_write(id, registers::ACCELERATION.address, &command)?;
        self.bus.transact(&packet, true).into_result().map(|_| ())
    }

    /// Broadcast Action: every servo runs its staged write.
    pub fn action(&self) -> Result<(), BusError> {
        self.bus.lock().action_broadcast().into_result().map(|_| ())
    }

    /// All position commands in one SyncWrite. No servo acknowledges it.
    pub fn sync_write_positions(
        &self,
        positions: &[(u8, i32)],
        motion: MotionProfile,
    ) -> Result<(), BusError> {
        let mut batch = GroupSyncWrite::new(registers::ACCELERATION.address);
        for &(id, position) in positions {
            let command = position_command(
                self.order,
                position,
                i32::from(motion.speed),
                motion.acceleration,
            )?;
            batch.add(id, &command)?;
        }
        self.bus.with(|engine| batch.transmit(engine))
    }

    /// Present positions through one SyncRead, in the order of `ids`, each with the error
    /// flags its reply carried.
    pub fn sync_read_positions(
        &self,
        ids: &[u8],
    ) -> Result<Vec<(u8, Result<(i32, ErrorFlags), CommError>)>, BusError> {
        let register = registers::PRESENT_POSITION;
        let mut group = GroupSyncRead::new(register.address, register.width);
        for &id in ids {
            group.add_address(id)?;
        }
        let order = self.order;
        let collected = self.bus.with(|engine| group.transmit_and_collect(engine))?;
        Ok(collected
            .into_iter()
            .map(|(id, reply)| {
                let position = reply.and_then(|reply| {
                    reply
                        .value(order)
                        .map(|raw| (to_host(raw, register.sign_bit()), reply.flags))
                        .ok_or(CommError::Framing(FramingError::BadLength(register.width)))
                });
                (id, position)
            })
            .collect())
    }

    /// Continuous-rotation speed (wheel mode). Negative turns the other way.
    pub fn write_speed(&self, id: u8, speed: i32, acceleration: u8) -> Result<(), BusError> {
        check_magnitude("speed", speed)?;
        let [s0, s1] = self.order.word_bytes(to_device(speed, SIGN_BIT_16) as u16);
        let command = [acceleration, 0, 0, 0, 0, s0, s1];
        self.write_bytes(id, registers::ACCELERATION.address, &command)
    }

    /// Switch between position mode and wheel mode. Not persisted across power cycles.
    pub fn set_wheel_mode(&self, id: u8, enabled: bool) -> Result<(), BusError> {
        self.write_bytes(id, registers::MODE.address, &[u8::from(enabled)])
    }

    pub fn set_torque(&self, id: u8, enabled: bool) -> Result<(), BusError> {
        self.write_bytes(id, registers::TORQUE_ENABLE.address, &[u8::from(enabled)])
    }

    // ---- EPROM ----

    pub fn lock_eprom(&self, id: u8) -> Result<(), BusError> {
        self.write_bytes(id, registers::LOCK.address, &[LOCKED])
    }

    pub fn unlock_eprom(&self, id: u8) -> Result<(), BusError> {
        self.write_bytes(id, registers::LOCK.address, &[UNLOCKED])
    }

    /// Unlock, write one byte, relock.
    pub fn write_eprom_byte(&self, id: u8, address: u8, value: u8) -> Result<(), BusError> {
        unicast(id)?;
        self.bus.with(|engine| {
            bracketed(engine, id, id, |engine| write_on(engine, id, address, &[value]))
        })
    }

    /// Input voltage limits in 0.1 V units, written inside one unlock/lock bracket.
    pub fn write_voltage_limits(&self, id: u8, min: u8, max: u8) -> Result<(), BusError> {
        unicast(id)?;
        if min > max {
            return Err(ValidationError::ValueOutOfRange {
                what: "min_input_voltage",
                value: i64::from(min),
            }
            .into());
        }
        self.bus.with(|engine| {
            bracketed(engine, id, id, |engine| {
                write_on(engine, id, registers::MAX_INPUT_VOLTAGE.address, &[max])?;
                write_on(engine, id, registers::MIN_INPUT_VOLTAGE.address, &[min])
            })
        })
    }

    pub fn write_temperature_limit(&self, id: u8, celsius: u8) -> Result<(), BusError> {
        self.write_eprom_byte(id, registers::MAX_TEMPERATURE_LIMIT.address, celsius)
    }

    /// Give servo `id` the id `new_id`. The relock goes to `new_id`, which the servo answers
    /// to as soon as the id byte is written.
    pub fn change_id(&self, id: u8, new_id: u8) -> Result<(), BusError> {
        unicast(id)?;
        unicast(new_id)?;
        self.bus.with(|engine| {
            bracketed(engine, id, new_id, |engine| {
                write_on(engine, id, registers::ID.address, &[new_id])
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_command_layout() {
        let command = position_command(ByteOrder::Little, 2048, 800, 25).unwrap();
        assert_eq!(command, [0x19, 0x00, 0x08, 0x00, 0x00, 0x20, 0x03]);

        let command = position_command(ByteOrder::Little, -100, 0, 0).unwrap();
        assert_eq!(command[1..3], [0x64, 0x80]);

        let command = position_command(ByteOrder::Big, 2048, 800, 25).unwrap();
        assert_eq!(command, [0x19, 0x08, 0x00, 0x00, 0x00, 0x03, 0x20]);
    }

    #[test]
    fn position_command_rejects_wide_values() {
        assert!(matches!(
            position_command(ByteOrder::Little, 40_000, 0, 0),
            Err(ValidationError::ValueOutOfRange { what: "position", .. })
        ));
        assert!(position_command(ByteOrder::Little, -32_767, 32_767, 0).is_ok());
    }

    #[test]
    fn state_display_marks_missing_fields() {
        let mut state = MotorState::new(7, 777);
        state.position = Some(2048);
        state.voltage = Some(7.4);
        let text = state.to_string();
        assert!(text.starts_with("Motor #7 | Model #777"));
        assert!(text.contains("Position:    2048 - [?, ?]"));
        assert!(text.contains("Voltage:     7.4 V"));
        assert!(!state.is_complete());
        assert!(state.read_at.is_some());
        assert!(!text.contains("Errors"));

        state.flags = ErrorFlags::from_bits(ErrorFlags::OVERHEAT);
        assert!(state.to_string().ends_with("Errors:      overheat (0x04)"));
    }

    #[test]
    fn state_serializes_to_json() {
        let state = MotorState::new(1, 777);
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["id"], 1);
        assert_eq!(json["model_number"], 777);
        assert!(json["position"].is_null());
        assert_eq!(json["flags"], 0);
    }

    #[test]
    fn motion_profile_defaults() {
        let motion = MotionProfile::default();
        assert_eq!(motion.speed, 800);
        assert_eq!(motion.acceleration, 25);
    }
}
