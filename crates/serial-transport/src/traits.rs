use std::time::Duration;

use crate::{PortInfo, Result, TransportError};

/// A minimal blocking byte stream over a serial line.
///
/// Implementations are not expected to frame anything: `read` hands back whatever bytes
/// arrived, up to `max_len`, and returns fewer (possibly none) once the read timeout elapses.
pub trait ByteChannel: Send {
    /// Open a port by path (e.g. "/dev/ttyUSB0", "COM3") at the given baud rate.
    fn open(path: &str, baud_rate: u32) -> Result<Self>
    where
        Self: Sized;

    /// Attempt to list ports this backend can open.
    fn list() -> Result<Vec<PortInfo>>
    where
        Self: Sized;

    fn baud_rate(&self) -> u32;

    /// Change line speed if supported.
    fn set_baud_rate(&mut self, _baud_rate: u32) -> Result<()> {
        Err(TransportError::Unsupported("baud rate change not supported"))
    }

    /// Upper bound a single `read` call may block for.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Write all bytes, returning the count written.
    fn write(&mut self, bytes: &[u8]) -> Result<usize>;

    /// Read up to `max_len` bytes. An empty vector means nothing arrived before the timeout.
    fn read(&mut self, max_len: usize) -> Result<Vec<u8>>;

    /// Drop any bytes pending in the receive buffer.
    fn clear_buffers(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}
