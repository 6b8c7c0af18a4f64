use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serial_transport::ByteChannel;

use crate::engine::{Outcome, TransactionEngine};
use crate::packet::Packet;

/// Cloneable handle that serializes every transaction on one channel.
///
/// The lock is held for the whole write and read of a transaction, so callers on different
/// threads never interleave on the wire.
pub struct SharedBus<C: ByteChannel> {
    inner: Arc<Mutex<TransactionEngine<C>>>,
}

impl<C: ByteChannel> Clone for SharedBus<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: ByteChannel> SharedBus<C> {
    pub fn new(engine: TransactionEngine<C>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(engine)),
        }
    }

    pub fn from_channel(channel: C) -> Self {
        Self::new(TransactionEngine::new(channel))
    }

    /// Exclusive access to the engine. A poisoned lock is recovered; the engine clears its
    /// buffers at the start of every transaction.
    pub fn lock(&self) -> MutexGuard<'_, TransactionEngine<C>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn transact(&self, packet: &Packet, expect_response: bool) -> Outcome {
        self.lock().transact(packet, expect_response)
    }

    /// Run several exchanges without releasing the bus in between.
    pub fn with<R>(&self, f: impl FnOnce(&mut TransactionEngine<C>) -> R) -> R {
        let mut engine = self.lock();
        f(&mut engine)
    }

    pub fn handles(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorFlags;
    use crate::packet::encode_status;
    use serial_transport::MockChannel;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn clones_share_one_engine() {
        let channel = MockChannel::new();
        let handle = channel.handle();
        let bus = SharedBus::new(
            TransactionEngine::new(channel).with_timeout(Duration::from_millis(20)),
        );
        for _ in 0..8 {
            handle.queue_reply(&encode_status(1, ErrorFlags::default(), &[]));
        }

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let bus = bus.clone();
                thread::spawn(move || {
                    let ping = Packet::ping(1).unwrap();
                    (0..2)
                        .filter(|_| bus.transact(&ping, true).is_success())
                        .count()
                })
            })
            .collect();
        let ok: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();

        assert_eq!(ok, 8);
        assert_eq!(handle.write_count(), 8);
        assert_eq!(bus.handles(), 1);
    }
}
