//! Half-duplex request/response over one [`ByteChannel`].

use std::time::{Duration, Instant};

use serial_transport::{byte_time, ByteChannel};
use tracing::{debug, warn};

use crate::error::{BusError, CommError, ErrorFlags, FramingError};
use crate::metrics::BusMetrics;
use crate::packet::{self, Instruction, Packet, Scan, StatusPacket, BROADCAST_ID, PACKET_OVERHEAD};

const READ_CHUNK: usize = 64;
/// Slack added to the wire time of the expected reply.
const TIMEOUT_MARGIN: Duration = Duration::from_millis(50);

/// What one transaction produced.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Outcome {
    Success(Vec<u8>),
    /// No valid status packet was obtained.
    CommError(CommError),
    /// A valid status packet carrying nonzero error flags. Its parameters are kept.
    DeviceError { flags: ErrorFlags, params: Vec<u8> },
}

impl Outcome {
    pub fn from_status(status: StatusPacket) -> Self {
        if status.error.is_empty() {
            Outcome::Success(status.params)
        } else {
            Outcome::DeviceError {
                flags: status.error,
                params: status.params,
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    /// Whether a valid status packet arrived, regardless of its error flags.
    pub fn responded(&self) -> bool {
        !matches!(self, Outcome::CommError(_))
    }

    pub fn flags(&self) -> ErrorFlags {
        match self {
            Outcome::DeviceError { flags, .. } => *flags,
            _ => ErrorFlags::default(),
        }
    }

    pub fn comm_error(&self) -> Option<&CommError> {
        match self {
            Outcome::CommError(e) => Some(e),
            _ => None,
        }
    }

    /// Strict view: device flags are an error.
    pub fn into_result(self) -> Result<Vec<u8>, BusError> {
        match self {
            Outcome::Success(params) => Ok(params),
            Outcome::CommError(e) => Err(BusError::Comm(e)),
            Outcome::DeviceError { flags, params } => Err(BusError::Device { flags, params }),
        }
    }

    /// Lenient view: any valid reply yields its parameters together with the flags.
    pub fn into_params(self) -> Result<(Vec<u8>, ErrorFlags), CommError> {
        match self {
            Outcome::Success(params) => Ok((params, ErrorFlags::default())),
            Outcome::DeviceError { flags, params } => Ok((params, flags)),
            Outcome::CommError(e) => Err(e),
        }
    }
}

/// Why [`TransactionEngine::receive_frame`] returned no status packet.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RxFailure {
    /// Id byte of a frame that failed its checksum.
    pub from: Option<u8>,
    pub error: CommError,
}

impl From<CommError> for RxFailure {
    fn from(error: CommError) -> Self {
        Self { from: None, error }
    }
}

/// Owns the channel and the receive buffer. One engine must see at most one transaction at a
/// time; share it through [`crate::SharedBus`] when several callers need the bus.
pub struct TransactionEngine<C: ByteChannel> {
    channel: C,
    rx: Vec<u8>,
    timeout: Option<Duration>,
    metrics: Option<BusMetrics>,
}

impl<C: ByteChannel> TransactionEngine<C> {
    pub fn new(channel: C) -> Self {
        Self {
            channel,
            rx: Vec::with_capacity(READ_CHUNK),
            timeout: None,
            metrics: None,
        }
    }

    /// Fixed response deadline instead of the baud-derived one.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_metrics(mut self, metrics: BusMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    /// Deadline for a reply of `reply_len` bytes: wire time for the reply plus three bytes of
    /// turnaround, plus a fixed margin.
    pub fn response_timeout(&self, reply_len: usize) -> Duration {
        if let Some(timeout) = self.timeout {
            return timeout;
        }
        let per_byte = byte_time(self.channel.baud_rate());
        per_byte * (reply_len as u32 + 3) + TIMEOUT_MARGIN
    }

    /// Write `packet` and, when asked and the packet is not broadcast, wait for its reply.
    ///
    /// Never retries. Replies from other ids are discarded while waiting.
    pub fn transact(&mut self, packet: &Packet, expect_response: bool) -> Outcome {
        if let Err(e) = self.send(packet) {
            return self.failed(e);
        }
        if !expect_response || packet.is_broadcast() {
            return Outcome::Success(Vec::new());
        }
        let deadline = Instant::now() + self.response_timeout(expected_reply_len(packet));
        match self.receive_from(packet.id(), deadline) {
            Ok(status) => {
                let outcome = Outcome::from_status(status);
                if let Outcome::DeviceError { flags, .. } = &outcome {
                    warn!(id = packet.id(), %flags, "servo reported error flags");
                }
                outcome
            }
            Err(e) => self.failed(e),
        }
    }

    /// Trigger staged RegWrite payloads on every servo at once.
    pub fn action_broadcast(&mut self) -> Outcome {
        match Packet::action(BROADCAST_ID) {
            Ok(packet) => self.transact(&packet, false),
            Err(e) => Outcome::CommError(CommError::TxFailed(e.to_string())),
        }
    }

    /// Clear pending input and write the whole packet.
    pub fn send(&mut self, packet: &Packet) -> Result<(), CommError> {
        self.rx.clear();
        self.channel
            .clear_buffers()
            .map_err(|e| CommError::TxFailed(e.to_string()))?;
        let bytes = packet.encode();
        let written = self
            .channel
            .write(&bytes)
            .map_err(|e| CommError::TxFailed(e.to_string()))?;
        if written != bytes.len() {
            return Err(CommError::TxFailed(format!(
                "short write: {written} of {} bytes",
                bytes.len()
            )));
        }
        if let Some(m) = &self.metrics {
            m.tx_packets.inc();
        }
        debug!(
            id = packet.id(),
            instruction = ?packet.instruction(),
            len = bytes.len(),
            "tx"
        );
        Ok(())
    }

    /// Next status packet addressed from `id`; packets from other ids are dropped.
    pub fn receive_from(&mut self, id: u8, deadline: Instant) -> Result<StatusPacket, CommError> {
        loop {
            let status = self.receive(deadline)?;
            if status.id == id {
                return Ok(status);
            }
            debug!(expected = id, got = status.id, "discarding reply from another servo");
        }
    }

    /// Next well-formed status packet from any servo, or the reason none arrived by `deadline`.
    pub fn receive(&mut self, deadline: Instant) -> Result<StatusPacket, CommError> {
        self.receive_frame(deadline).map_err(|failure| failure.error)
    }

    /// Like [`TransactionEngine::receive`], but a checksum failure also names the id byte of
    /// the damaged frame.
    pub fn receive_frame(&mut self, deadline: Instant) -> Result<StatusPacket, RxFailure> {
        self.arm(deadline)?;
        loop {
            match packet::scan(&self.rx) {
                Scan::Frame { status, consumed } => {
                    self.rx.drain(..consumed);
                    if let Some(m) = &self.metrics {
                        m.rx_packets.inc();
                        if !status.error.is_empty() {
                            m.device_errors.inc();
                        }
                    }
                    debug!(id = status.id, flags = %status.error, len = status.params.len(), "rx");
                    return Ok(status);
                }
                Scan::Corrupt {
                    id,
                    error,
                    consumed,
                } => {
                    self.rx.drain(..consumed);
                    if let Some(m) = &self.metrics {
                        m.framing_errors.inc();
                    }
                    return Err(RxFailure {
                        from: Some(id),
                        error: CommError::Framing(error),
                    });
                }
                Scan::Incomplete { skip } => {
                    self.rx.drain(..skip);
                }
            }

            if Instant::now() >= deadline {
                if self.rx.is_empty() {
                    return Err(CommError::Timeout.into());
                }
                let error = packet::decode(&self.rx)
                    .err()
                    .unwrap_or(FramingError::NoSync);
                self.rx.clear();
                if let Some(m) = &self.metrics {
                    m.framing_errors.inc();
                }
                return Err(CommError::Framing(error).into());
            }

            let chunk = self
                .channel
                .read(READ_CHUNK)
                .map_err(|e| CommError::RxFailed(e.to_string()))?;
            if chunk.is_empty() {
                std::thread::yield_now();
            } else {
                self.rx.extend_from_slice(&chunk);
                self.arm(deadline)?;
            }
        }
    }

    /// Bound the next blocking read by the time left until `deadline`.
    fn arm(&mut self, deadline: Instant) -> Result<(), CommError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(());
        }
        self.channel
            .set_timeout(remaining)
            .map_err(|e| CommError::RxFailed(e.to_string()))
    }

    fn failed(&self, error: CommError) -> Outcome {
        if let Some(m) = &self.metrics {
            m.comm_errors.inc();
        }
        debug!(%error, "transaction failed");
        Outcome::CommError(error)
    }
}

/// Bytes a servo answers `packet` with.
pub fn expected_reply_len(packet: &Packet) -> usize {
    match packet.instruction() {
        Instruction::Read => PACKET_OVERHEAD + usize::from(packet.params().get(1).copied().unwrap_or(0)),
        _ => PACKET_OVERHEAD,
    }
}
