//! serial-transport: byte channels for half-duplex serial buses
//!
//! This crate provides the [`ByteChannel`] trait a bus protocol drives, plus feature-gated
//! backends. The default build enables a scripted `mock` backend so that protocol code and
//! binaries can be exercised on any host without a USB adapter attached.

mod types;
pub use types::{byte_time, PortInfo, DEFAULT_BAUD_RATE};

mod error;
pub use error::{Result, TransportError};

mod traits;
pub use traits::ByteChannel;

#[cfg(feature = "mock")]
mod mock;

#[cfg(feature = "mock")]
pub use mock::{MockChannel, MockHandle};

#[cfg(feature = "serial")]
mod serial;

#[cfg(feature = "serial")]
pub use serial::SerialChannel;
