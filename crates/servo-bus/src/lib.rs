//! servo-bus: Feetech SCS/STS half-duplex servo protocol over a byte channel

mod error;
pub use error::{BusError, CommError, ErrorFlags, FramingError, ValidationError};

pub mod packet;
pub use packet::{Instruction, Packet, StatusPacket, BROADCAST_ID, MAX_ID};

pub mod registers;
pub use registers::{BaudCode, ByteOrder, Register};

mod engine;
pub use engine::{expected_reply_len, Outcome, RxFailure, TransactionEngine};

mod bus;
pub use bus::SharedBus;

mod group;
pub use group::{GroupReply, GroupSyncRead, GroupSyncWrite};

mod motor;
pub use motor::{
    position_command, MotionProfile, MotorState, ServoBus, DEFAULT_ACCELERATION, DEFAULT_SPEED,
};

mod config;
pub use config::{load_config_file, parse_config, BusConfig, Limits, MotorEntry};

mod metrics;
pub use metrics::{BusMetrics, MetricsHub};

#[cfg(feature = "sim")]
pub mod sim;
#[cfg(feature = "sim")]
pub use sim::{Faults, VirtualBus, VirtualBusHandle};

#[cfg(all(test, feature = "sim"))]
mod tests;
