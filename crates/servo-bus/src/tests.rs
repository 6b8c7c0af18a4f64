use std::thread;
use std::time::Duration;

use serial_transport::{ByteChannel, MockChannel, MockHandle};

use crate::packet::encode_status;
use crate::registers::{self, degrees_to_position};
use crate::*;

const TIMEOUT: Duration = Duration::from_millis(10);

fn virtual_bus(ids: &[u8]) -> (ServoBus<VirtualBus>, VirtualBusHandle) {
    let channel = VirtualBus::with_servos(ids.iter().copied());
    let handle = channel.handle();
    let engine = TransactionEngine::new(channel).with_timeout(TIMEOUT);
    (ServoBus::new(SharedBus::new(engine)), handle)
}

fn mock_bus() -> (ServoBus<MockChannel>, MockHandle) {
    let channel = MockChannel::new();
    let handle = channel.handle();
    let engine = TransactionEngine::new(channel).with_timeout(TIMEOUT);
    (ServoBus::new(SharedBus::new(engine)), handle)
}

fn ack(id: u8) -> Vec<u8> {
    encode_status(id, ErrorFlags::default(), &[])
}

#[test]
fn position_write_golden_bytes() {
    let (bus, handle) = mock_bus();
    handle.queue_reply(&ack(5));
    bus.write_position(5, 2048, 800, 25).unwrap();
    assert_eq!(
        handle.written(),
        vec![vec![
            0xFF, 0xFF, 0x05, 0x0A, 0x03, 0x29, 0x19, 0x00, 0x08, 0x00, 0x00, 0x20, 0x03, 0x80
        ]]
    );
}

#[test]
fn failed_unlock_sends_nothing_else() {
    let (bus, handle) = mock_bus();
    handle.queue_reply(&[]);
    let err = bus.write_temperature_limit(1, 65).unwrap_err();
    assert_eq!(err, BusError::Comm(CommError::Timeout));
    assert_eq!(handle.write_count(), 1);
    assert_eq!(handle.written()[0][5..7], [registers::LOCK.address, 0]);
}

#[test]
fn relock_runs_after_failed_write() {
    let (bus, handle) = mock_bus();
    handle.queue_reply(&ack(1));
    handle.queue_reply(&[]);
    handle.queue_reply(&ack(1));
    let err = bus.write_eprom_byte(1, 13, 65).unwrap_err();
    assert!(err.is_comm());

    let written = handle.written();
    assert_eq!(written.len(), 3);
    assert_eq!(written[2][5..7], [registers::LOCK.address, 1]);
}

#[test]
fn unlock_flags_do_not_abort_bracket() {
    let (bus, handle) = mock_bus();
    let flags = ErrorFlags::from_bits(ErrorFlags::VOLTAGE);
    handle.queue_reply(&encode_status(1, flags, &[]));
    handle.queue_reply(&ack(1));
    handle.queue_reply(&ack(1));
    bus.write_eprom_byte(1, 13, 65).unwrap();
    assert_eq!(handle.write_count(), 3);
}

#[test]
fn eprom_bracket_order_on_virtual_servo() {
    let (bus, handle) = virtual_bus(&[1]);
    bus.write_temperature_limit(1, 65).unwrap();

    let writes: Vec<Vec<u8>> = handle
        .requests()
        .iter()
        .map(|packet| packet.params().to_vec())
        .collect();
    assert_eq!(writes, vec![vec![55, 0], vec![13, 65], vec![55, 1]]);
    assert_eq!(handle.register(1, 13), Some(65));
    assert_eq!(handle.register(1, 55), Some(1));
}

#[test]
fn write_register_brackets_eprom_only() {
    let (bus, handle) = virtual_bus(&[1]);
    bus.write_register(1, registers::TORQUE_ENABLE, 0).unwrap();
    assert_eq!(handle.requests().len(), 1);

    handle.clear_requests();
    bus.write_register(1, registers::MAX_ANGLE_LIMIT, 3000).unwrap();
    assert_eq!(handle.requests().len(), 3);
    assert_eq!(handle.word(1, 11), Some(3000));

    assert_eq!(
        bus.write_register(1, registers::PRESENT_POSITION, 1),
        Err(BusError::Validation(ValidationError::ReadOnly("present_position")))
    );
    assert!(matches!(
        bus.write_register(1, registers::ACCELERATION, 256),
        Err(BusError::Validation(ValidationError::ValueOutOfRange { .. }))
    ));
}

#[test]
fn read_state_collects_everything() {
    let (bus, _handle) = virtual_bus(&[3]);
    let state = bus.read_state(3).unwrap();
    assert_eq!(state.model_number, 777);
    assert_eq!(state.voltage, Some(7.4));
    assert_eq!(state.min_voltage_limit, Some(4.0));
    assert_eq!(state.max_voltage_limit, Some(14.0));
    assert_eq!(state.temperature, Some(30));
    assert_eq!(state.max_temperature, Some(70));
    assert_eq!(state.min_angle_limit, Some(0));
    assert_eq!(state.max_angle_limit, Some(4095));
    assert_eq!(state.position, Some(0));
    assert!(state.is_complete());
    assert!(state.flags.is_empty());
}

#[test]
fn read_state_of_absent_servo_is_none() {
    let (bus, _handle) = virtual_bus(&[3]);
    assert!(bus.read_state(4).is_none());
}

#[test]
fn read_state_keeps_partial_results() {
    let (bus, handle) = mock_bus();
    handle.queue_reply(&ack(2));
    handle.queue_reply(&encode_status(2, ErrorFlags::default(), &[0x09, 0x03]));
    handle.queue_reply(&encode_status(2, ErrorFlags::default(), &[72]));

    let state = bus.read_state(2).unwrap();
    assert_eq!(state.model_number, 777);
    assert_eq!(state.voltage, Some(7.2));
    assert_eq!(state.position, None);
    assert!(!state.is_complete());
}

#[test]
fn device_flags_keep_the_value() {
    let (bus, handle) = virtual_bus(&[1]);
    handle.set_word(1, 56, 1500);
    let flags = ErrorFlags::from_bits(ErrorFlags::OVERHEAT);
    handle.set_error_flags(1, flags);

    assert!(bus.ping(1));
    match bus.read_position(1) {
        Err(BusError::Device { flags: got, params }) => {
            assert_eq!(got, flags);
            assert_eq!(params, 1500u16.to_le_bytes().to_vec());
        }
        other => panic!("unexpected {other:?}"),
    }
    let state = bus.read_state(1).unwrap();
    assert_eq!(state.position, Some(1500));
    assert!(state.flags.contains(ErrorFlags::OVERHEAT));
    assert!(state.to_string().contains("overheat"));

    let positions = bus.read_positions(&[1]);
    assert_eq!(positions, vec![(1, Ok((1500, flags)))]);
    assert_eq!(bus.get_positions(&[1]).get(&1), Some(&1500));
}

#[test]
fn noisy_line_resynchronizes() {
    let (bus, handle) = virtual_bus(&[1]);
    handle.set_faults(
        1,
        Faults {
            garbage_prefix: vec![0x55, 0x00, 0xFF],
            ..Faults::default()
        },
    );
    assert_eq!(bus.read_temperature(1).unwrap(), 30);
}

#[test]
fn corrupt_reply_is_a_framing_error() {
    let (bus, handle) = virtual_bus(&[1]);
    handle.set_faults(
        1,
        Faults {
            corrupt_checksum: true,
            ..Faults::default()
        },
    );
    assert!(matches!(
        bus.read_position(1),
        Err(BusError::Comm(CommError::Framing(FramingError::ChecksumMismatch { .. })))
    ));
    assert!(!bus.ping(1));
}

#[test]
fn sync_read_isolates_missing_servo() {
    let (bus, handle) = virtual_bus(&[1, 2, 3]);
    handle.set_word(1, 56, 100);
    handle.set_word(3, 56, 300);
    handle.set_silent(2, true);

    let results = bus.sync_read_positions(&[1, 2, 3]).unwrap();
    assert_eq!(
        results,
        vec![
            (1, Ok((100, ErrorFlags::default()))),
            (2, Err(CommError::Timeout)),
            (3, Ok((300, ErrorFlags::default())))
        ]
    );
}

#[test]
fn sync_read_charges_corrupt_reply_to_its_sender() {
    let (bus, handle) = virtual_bus(&[1, 2]);
    handle.set_silent(1, true);
    handle.set_faults(
        2,
        Faults {
            corrupt_checksum: true,
            ..Faults::default()
        },
    );

    let results = bus.sync_read_positions(&[1, 2]).unwrap();
    assert_eq!(results[0], (1, Err(CommError::Timeout)));
    assert_eq!(results[1].0, 2);
    assert!(matches!(
        results[1].1,
        Err(CommError::Framing(FramingError::ChecksumMismatch { .. }))
    ));
}

#[test]
fn sync_read_reports_flags_per_servo() {
    let (bus, handle) = virtual_bus(&[1, 2]);
    handle.set_word(2, 56, 2000);
    let overheat = ErrorFlags::from_bits(ErrorFlags::OVERHEAT);
    handle.set_error_flags(2, overheat);

    let results = bus.sync_read_positions(&[1, 2]).unwrap();
    assert_eq!(results[0], (1, Ok((0, ErrorFlags::default()))));
    assert_eq!(results[1], (2, Ok((2000, overheat))));
}

#[test]
fn sync_write_moves_every_servo_without_replies() {
    let (bus, handle) = virtual_bus(&[1, 2]);
    bus.sync_write_positions(&[(1, 1024), (2, 3072)], MotionProfile::default())
        .unwrap();

    let requests = handle.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].is_broadcast());
    assert_eq!(requests[0].instruction(), Instruction::SyncWrite);
    assert_eq!(handle.word(1, 56), Some(1024));
    assert_eq!(handle.word(2, 56), Some(3072));
}

#[test]
fn set_positions_reports_each_servo() {
    let (bus, handle) = virtual_bus(&[1, 3]);
    let results = bus.set_positions(&[(1, 500), (2, 600), (3, 700)], MotionProfile::default());

    assert!(results[0].1.is_ok());
    assert_eq!(results[1], (2, Err(BusError::Comm(CommError::Timeout))));
    assert!(results[2].1.is_ok());
    assert_eq!(handle.word(3, 56), Some(700));

    let positions = bus.get_positions(&[1, 2, 3]);
    assert_eq!(positions.len(), 2);
    assert_eq!(positions.get(&1), Some(&500));
}

#[test]
fn degrees_become_raw_positions() {
    let (bus, handle) = virtual_bus(&[1]);
    bus.write_position(1, i32::from(degrees_to_position(45.0)), 800, 25)
        .unwrap();
    assert_eq!(handle.word(1, 42), Some(512));
    assert_eq!(degrees_to_position(0.0), 0);
    assert_eq!(degrees_to_position(360.0), 0);
}

#[test]
fn negative_goal_uses_sign_magnitude() {
    let (bus, handle) = virtual_bus(&[1]);
    bus.write_register(1, registers::GOAL_POSITION, -100).unwrap();
    assert_eq!(handle.word(1, 42), Some(0x8064));
    assert_eq!(bus.read_position(1).unwrap(), -100);
}

#[test]
fn position_and_speed_from_one_read() {
    let (bus, handle) = virtual_bus(&[1]);
    handle.set_word(1, 56, 2000);
    handle.set_word(1, 58, 0x8000 | 50);
    assert_eq!(bus.read_position_speed(1).unwrap(), (2000, -50));
}

#[test]
fn staged_position_runs_on_action() {
    let (bus, handle) = virtual_bus(&[1, 2]);
    bus.reg_write_position(1, 1000, 800, 25).unwrap();
    bus.reg_write_position(2, 2000, 800, 25).unwrap();
    assert_eq!(handle.word(1, 56), Some(0));

    bus.action().unwrap();
    assert_eq!(handle.word(1, 56), Some(1000));
    assert_eq!(handle.word(2, 56), Some(2000));
}

#[test]
fn change_id_relocks_under_new_id() {
    let (bus, handle) = virtual_bus(&[1]);
    bus.change_id(1, 7).unwrap();
    assert_eq!(handle.ids(), vec![7]);
    assert_eq!(handle.register(7, 55), Some(1));
    assert!(bus.ping(7));
    assert_eq!(
        bus.change_id(7, BROADCAST_ID),
        Err(BusError::Validation(ValidationError::BroadcastNotAllowed))
    );
}

#[test]
fn unplugged_servo_drops_out_of_discovery() {
    let (bus, handle) = virtual_bus(&[1, 2]);
    assert!(handle.remove_servo(2));
    assert!(!handle.remove_servo(2));
    assert_eq!(handle.ids(), vec![1]);
    assert!(!bus.ping(2));
    assert_eq!(bus.discover(1..=2), vec![(1, 777)]);
}

#[test]
fn discovery_lists_models() {
    let (bus, handle) = virtual_bus(&[2, 9]);
    handle.add_servo_model(4, 1025);
    assert_eq!(bus.discover(0..=10), vec![(2, 777), (4, 1025), (9, 777)]);
}

#[test]
fn limits_and_modes() {
    let (bus, handle) = virtual_bus(&[1]);
    bus.write_voltage_limits(1, 50, 120).unwrap();
    assert_eq!(bus.read_voltage_limits(1).unwrap(), (5.0, 12.0));
    assert!(bus.write_voltage_limits(1, 130, 120).is_err());

    bus.set_wheel_mode(1, true).unwrap();
    assert_eq!(handle.register(1, 33), Some(1));
    bus.write_speed(1, -300, 10).unwrap();
    assert_eq!(handle.word(1, 46), Some(0x8000 | 300));

    bus.set_torque(1, false).unwrap();
    assert_eq!(handle.register(1, 40), Some(0));
    assert!(!bus.read_moving(1).unwrap());
}

#[test]
fn concurrent_facades_share_the_bus() {
    let (bus, handle) = virtual_bus(&[1, 2, 3, 4]);
    for id in 1..=4u8 {
        handle.set_word(id, 56, u16::from(id) * 100);
    }
    let workers: Vec<_> = (1..=4u8)
        .map(|id| {
            let bus = bus.clone();
            thread::spawn(move || {
                (0..10)
                    .map(|_| bus.read_position(id).unwrap())
                    .all(|p| p == i32::from(id) * 100)
            })
        })
        .collect();
    for worker in workers {
        assert!(worker.join().unwrap());
    }
}

#[test]
fn metrics_follow_facade_traffic() {
    let hub = MetricsHub::new().unwrap();
    let channel = VirtualBus::with_servos([1]);
    let engine = TransactionEngine::new(channel)
        .with_timeout(TIMEOUT)
        .with_metrics(hub.bus.clone());
    let bus = ServoBus::new(SharedBus::new(engine));

    assert!(bus.ping(1));
    assert!(!bus.ping(2));
    assert_eq!(hub.bus.tx_packets.get(), 2);
    assert_eq!(hub.bus.rx_packets.get(), 1);
    assert_eq!(hub.bus.comm_errors.get(), 1);
    assert!(hub.encode_text().contains("scs_comm_errors 1"));
}

#[test]
fn closed_bus_fails_transactions() {
    let (bus, _handle) = virtual_bus(&[1]);
    bus.close().unwrap();
    assert!(matches!(
        bus.read_position(1),
        Err(BusError::Comm(CommError::TxFailed(_)))
    ));
    assert!(bus.shared().lock().channel().baud_rate() > 0);
}
