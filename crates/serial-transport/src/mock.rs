use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::{ByteChannel, PortInfo, Result, TransportError, DEFAULT_BAUD_RATE};

#[derive(Debug, Default)]
struct MockState {
    rx: VecDeque<u8>,
    replies: VecDeque<Vec<u8>>,
    written: Vec<Vec<u8>>,
    fail_writes: usize,
    clears: usize,
    timeouts: Vec<Duration>,
    closed: bool,
}

/// A scripted in-process channel. Replies queued with [`MockHandle::queue_reply`] are
/// released into the receive buffer one per `write`, so a clear before the write does not
/// discard them. Each channel owns its own state; clone the [`MockHandle`] to inspect it
/// after the channel has been moved into a protocol engine.
#[derive(Debug)]
pub struct MockChannel {
    name: String,
    baud_rate: u32,
    state: Arc<Mutex<MockState>>,
}

/// Test-side view of a [`MockChannel`].
#[derive(Debug, Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockChannel {
    pub fn new() -> Self {
        Self {
            name: "mock0".to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> MockHandle {
        MockHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl Default for MockChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHandle {
    /// Bytes the next `write` will make readable. An empty reply models a silent device.
    pub fn queue_reply(&self, bytes: &[u8]) {
        lock(&self.state).replies.push_back(bytes.to_vec());
    }

    /// Bytes that are readable right away, e.g. stale noise on the line.
    pub fn push_rx(&self, bytes: &[u8]) {
        lock(&self.state).rx.extend(bytes.iter().copied());
    }

    /// Make the next `count` writes fail with an I/O error.
    pub fn fail_next_writes(&self, count: usize) {
        lock(&self.state).fail_writes = count;
    }

    /// Every buffer handed to `write`, including failed attempts.
    pub fn written(&self) -> Vec<Vec<u8>> {
        lock(&self.state).written.clone()
    }

    pub fn write_count(&self) -> usize {
        lock(&self.state).written.len()
    }

    pub fn clear_count(&self) -> usize {
        lock(&self.state).clears
    }

    pub fn pending_rx(&self) -> usize {
        lock(&self.state).rx.len()
    }

    /// Every read timeout set on the channel, oldest first.
    pub fn timeouts(&self) -> Vec<Duration> {
        lock(&self.state).timeouts.clone()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }
}

impl ByteChannel for MockChannel {
    fn open(path: &str, baud_rate: u32) -> Result<Self> {
        let mut channel = Self::new();
        channel.name = path.to_string();
        channel.baud_rate = baud_rate;
        Ok(channel)
    }

    fn list() -> Result<Vec<PortInfo>> {
        Ok(vec![PortInfo {
            name: "mock0".to_string(),
            driver: "mock".to_string(),
        }])
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        self.baud_rate = baud_rate;
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        lock(&self.state).timeouts.push(timeout);
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.written.push(bytes.to_vec());
        if state.fail_writes > 0 {
            state.fail_writes -= 1;
            return Err(TransportError::Io("scripted write failure".to_string()));
        }
        if let Some(reply) = state.replies.pop_front() {
            state.rx.extend(reply);
        }
        Ok(bytes.len())
    }

    fn read(&mut self, max_len: usize) -> Result<Vec<u8>> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(TransportError::Closed);
        }
        let take = max_len.min(state.rx.len());
        Ok(state.rx.drain(..take).collect())
    }

    fn clear_buffers(&mut self) -> Result<()> {
        let mut state = lock(&self.state);
        state.rx.clear();
        state.clears += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        lock(&self.state).closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replies_are_released_per_write() -> anyhow::Result<()> {
        let mut channel = MockChannel::new();
        let handle = channel.handle();
        handle.queue_reply(&[1, 2, 3]);
        handle.queue_reply(&[]);

        assert!(channel.read(8)?.is_empty());
        channel.write(&[0xAA])?;
        assert_eq!(channel.read(2)?, vec![1, 2]);
        assert_eq!(channel.read(8)?, vec![3]);

        channel.write(&[0xBB])?;
        assert!(channel.read(8)?.is_empty());
        assert_eq!(handle.write_count(), 2);
        Ok(())
    }

    #[test]
    fn clear_drops_stale_bytes_but_not_queued_replies() -> anyhow::Result<()> {
        let mut channel = MockChannel::new();
        let handle = channel.handle();
        handle.push_rx(&[0x55, 0x55]);
        handle.queue_reply(&[9]);

        channel.clear_buffers()?;
        assert_eq!(handle.pending_rx(), 0);
        channel.write(&[0x01])?;
        assert_eq!(channel.read(4)?, vec![9]);
        assert_eq!(handle.clear_count(), 1);
        Ok(())
    }

    #[test]
    fn scripted_write_failure_is_recorded() {
        let mut channel = MockChannel::new();
        let handle = channel.handle();
        handle.fail_next_writes(1);

        assert!(matches!(channel.write(&[1]), Err(TransportError::Io(_))));
        assert!(channel.write(&[2]).is_ok());
        assert_eq!(handle.written(), vec![vec![1], vec![2]]);
    }

    #[test]
    fn closed_channel_rejects_io() -> anyhow::Result<()> {
        let mut channel = MockChannel::open("mock1", 115_200)?;
        assert_eq!(channel.name(), "mock1");
        assert_eq!(channel.baud_rate(), 115_200);
        channel.set_timeout(Duration::from_millis(3))?;
        assert_eq!(channel.handle().timeouts(), vec![Duration::from_millis(3)]);
        channel.close()?;
        assert!(channel.handle().is_closed());
        assert!(matches!(channel.write(&[1]), Err(TransportError::Closed)));
        Ok(())
    }
}
