//! Batched SyncWrite / SyncRead over one bus transaction.

use std::collections::HashMap;
use std::time::Instant;

use serial_transport::ByteChannel;
use tracing::{debug, warn};

use crate::engine::{RxFailure, TransactionEngine};
use crate::error::{BusError, CommError, ErrorFlags, FramingError, ValidationError};
use crate::packet::{Packet, StatusPacket, MAX_ID, PACKET_OVERHEAD};
use crate::registers::ByteOrder;

/// Payloads for several servos sharing one start register and width.
#[derive(Clone, Debug)]
pub struct GroupSyncWrite {
    start_address: u8,
    width: Option<usize>,
    entries: Vec<(u8, Vec<u8>)>,
}

impl GroupSyncWrite {
    pub fn new(start_address: u8) -> Self {
        Self {
            start_address,
            width: None,
            entries: Vec::new(),
        }
    }

    pub fn start_address(&self) -> u8 {
        self.start_address
    }

    /// Width fixed by the first accepted payload, if any.
    pub fn data_length(&self) -> Option<usize> {
        self.width
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: u8) -> bool {
        self.entries.iter().any(|(entry, _)| *entry == id)
    }

    pub fn payload(&self, id: u8) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(entry, _)| *entry == id)
            .map(|(_, data)| data.as_slice())
    }

    /// Stage `data` for `id`. Re-adding an id replaces its payload in place.
    pub fn add(&mut self, id: u8, data: &[u8]) -> Result<(), ValidationError> {
        if id > MAX_ID {
            return Err(ValidationError::InvalidId(id));
        }
        if data.is_empty() {
            return Err(ValidationError::EmptyPayload);
        }
        if let Some(expected) = self.width {
            if data.len() != expected {
                return Err(ValidationError::WidthMismatch {
                    expected,
                    found: data.len(),
                });
            }
        }
        match self.entries.iter_mut().find(|(entry, _)| *entry == id) {
            Some((_, existing)) => *existing = data.to_vec(),
            None => self.entries.push((id, data.to_vec())),
        }
        self.width = Some(data.len());
        Ok(())
    }

    pub fn remove(&mut self, id: u8) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry, _)| *entry != id);
        if self.entries.is_empty() {
            self.width = None;
        }
        self.entries.len() != before
    }

    /// Drop every entry; the next `add` picks a new width.
    pub fn clear_all(&mut self) {
        self.entries.clear();
        self.width = None;
    }

    pub fn packet(&self) -> Result<Packet, ValidationError> {
        if self.entries.is_empty() {
            return Err(ValidationError::EmptyBatch);
        }
        let entries: Vec<(u8, &[u8])> = self
            .entries
            .iter()
            .map(|(id, data)| (*id, data.as_slice()))
            .collect();
        Packet::sync_write(self.start_address, &entries)
    }

    /// Broadcast the batch. Servos never acknowledge a SyncWrite, so `Ok` only means the bytes
    /// left the controller.
    pub fn transmit<C: ByteChannel>(&self, engine: &mut TransactionEngine<C>) -> Result<(), BusError> {
        let packet = self.packet()?;
        debug!(
            address = self.start_address,
            servos = self.entries.len(),
            "sync write"
        );
        engine.transact(&packet, false).into_result().map(|_| ())
    }
}

/// One servo's answer to a SyncRead.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GroupReply {
    pub data: Vec<u8>,
    pub flags: ErrorFlags,
}

impl GroupReply {
    /// The register value in `order`, for 1, 2 or 4 byte reads.
    pub fn value(&self, order: ByteOrder) -> Option<u32> {
        order.decode(&self.data)
    }
}

/// Ordered servo ids to read one register block from.
#[derive(Clone, Debug)]
pub struct GroupSyncRead {
    start_address: u8,
    data_length: u8,
    ids: Vec<u8>,
}

impl GroupSyncRead {
    pub fn new(start_address: u8, data_length: u8) -> Self {
        Self {
            start_address,
            data_length,
            ids: Vec::new(),
        }
    }

    pub fn start_address(&self) -> u8 {
        self.start_address
    }

    pub fn data_length(&self) -> u8 {
        self.data_length
    }

    pub fn ids(&self) -> &[u8] {
        &self.ids
    }

    /// Append `id`; an id already present keeps its position.
    pub fn add_address(&mut self, id: u8) -> Result<(), ValidationError> {
        if id > MAX_ID {
            return Err(ValidationError::InvalidId(id));
        }
        if !self.ids.contains(&id) {
            self.ids.push(id);
        }
        Ok(())
    }

    pub fn remove_address(&mut self, id: u8) -> bool {
        let before = self.ids.len();
        self.ids.retain(|entry| *entry != id);
        self.ids.len() != before
    }

    pub fn clear_all(&mut self) {
        self.ids.clear();
    }

    pub fn packet(&self) -> Result<Packet, ValidationError> {
        if self.ids.is_empty() {
            return Err(ValidationError::EmptyBatch);
        }
        Packet::sync_read(self.start_address, self.data_length, &self.ids)
    }

    /// Broadcast one SyncRead, then collect each servo's reply in the order ids were added.
    ///
    /// A missing or corrupt reply only fails that id. Replies that arrive early for a later id
    /// are held until that id's turn, and so is a corrupt frame naming a later id.
    pub fn transmit_and_collect<C: ByteChannel>(
        &self,
        engine: &mut TransactionEngine<C>,
    ) -> Result<Vec<(u8, Result<GroupReply, CommError>)>, ValidationError> {
        let packet = self.packet()?;
        if let Err(e) = engine.send(&packet) {
            return Ok(self.ids.iter().map(|&id| (id, Err(e.clone()))).collect());
        }

        let reply_len = PACKET_OVERHEAD + usize::from(self.data_length);
        let mut early: HashMap<u8, Result<StatusPacket, CommError>> = HashMap::new();
        let mut results = Vec::with_capacity(self.ids.len());
        for &id in &self.ids {
            let status = match early.remove(&id) {
                Some(stashed) => stashed,
                None => {
                    let deadline = Instant::now() + engine.response_timeout(reply_len);
                    self.wait_for(engine, id, deadline, &mut early)
                }
            };
            let result = status.and_then(|status| self.reply(status));
            if let Err(error) = &result {
                warn!(id, %error, "no sync read reply");
            }
            results.push((id, result));
        }
        Ok(results)
    }

    fn wait_for<C: ByteChannel>(
        &self,
        engine: &mut TransactionEngine<C>,
        id: u8,
        deadline: Instant,
        early: &mut HashMap<u8, Result<StatusPacket, CommError>>,
    ) -> Result<StatusPacket, CommError> {
        loop {
            match engine.receive_frame(deadline) {
                Ok(status) if status.id == id => return Ok(status),
                Ok(status) if self.ids.contains(&status.id) => {
                    early.entry(status.id).or_insert(Ok(status));
                }
                Ok(status) => {
                    debug!(got = status.id, "discarding reply from servo outside the group");
                }
                Err(RxFailure {
                    from: Some(other),
                    error,
                }) if other != id && self.ids.contains(&other) => {
                    early.entry(other).or_insert(Err(error));
                }
                Err(failure) => return Err(failure.error),
            }
        }
    }

    fn reply(&self, status: StatusPacket) -> Result<GroupReply, CommError> {
        if status.params.len() != usize::from(self.data_length) {
            return Err(CommError::Framing(FramingError::BadLength(
                status.params.len() as u8,
            )));
        }
        if !status.error.is_empty() {
            warn!(id = status.id, flags = %status.error, "servo reported error flags");
        }
        Ok(GroupReply {
            data: status.params,
            flags: status.error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::encode_status;
    use serial_transport::MockChannel;
    use std::time::Duration;

    #[test]
    fn first_add_fixes_width() {
        let mut batch = GroupSyncWrite::new(42);
        batch.add(1, &[1, 2]).unwrap();
        assert_eq!(
            batch.add(2, &[1, 2, 3]),
            Err(ValidationError::WidthMismatch {
                expected: 2,
                found: 3
            })
        );
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.data_length(), Some(2));
    }

    #[test]
    fn re_add_replaces_payload() {
        let mut batch = GroupSyncWrite::new(42);
        batch.add(1, &[1, 1]).unwrap();
        batch.add(2, &[2, 2]).unwrap();
        batch.add(1, &[9, 9]).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.payload(1), Some(&[9u8, 9][..]));
        let packet = batch.packet().unwrap();
        assert_eq!(packet.params(), &[42, 2, 1, 9, 9, 2, 2, 2]);
    }

    #[test]
    fn clear_all_resets_width() {
        let mut batch = GroupSyncWrite::new(42);
        batch.add(1, &[1, 1]).unwrap();
        batch.clear_all();
        assert!(batch.is_empty());
        assert_eq!(batch.packet(), Err(ValidationError::EmptyBatch));
        batch.add(1, &[1, 2, 3]).unwrap();
        assert_eq!(batch.data_length(), Some(3));
    }

    #[test]
    fn transmit_is_one_unacknowledged_broadcast() {
        let channel = MockChannel::new();
        let handle = channel.handle();
        let mut engine = TransactionEngine::new(channel);
        let mut batch = GroupSyncWrite::new(42);
        batch.add(1, &[0x00, 0x08]).unwrap();
        batch.add(2, &[0x00, 0x04]).unwrap();
        batch.transmit(&mut engine).unwrap();

        let written = handle.written();
        assert_eq!(written.len(), 1);
        assert_eq!(&written[0][..5], &[0xFF, 0xFF, 0xFE, 0x0A, 0x83]);
    }

    #[test]
    fn read_ids_are_an_ordered_set() {
        let mut group = GroupSyncRead::new(56, 2);
        group.add_address(3).unwrap();
        group.add_address(1).unwrap();
        group.add_address(3).unwrap();
        assert_eq!(group.ids(), &[3, 1]);
        assert_eq!(group.add_address(0xFE), Err(ValidationError::InvalidId(0xFE)));
    }

    #[test]
    fn missing_reply_fails_only_that_id() {
        let channel = MockChannel::new();
        let handle = channel.handle();
        let mut engine =
            TransactionEngine::new(channel).with_timeout(Duration::from_millis(10));
        let mut replies = encode_status(1, ErrorFlags::default(), &[0x00, 0x08]);
        replies.extend(encode_status(3, ErrorFlags::default(), &[0x00, 0x04]));
        handle.queue_reply(&replies);

        let mut group = GroupSyncRead::new(56, 2);
        for id in [1, 2, 3] {
            group.add_address(id).unwrap();
        }
        let results = group.transmit_and_collect(&mut engine).unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].0, 1);
        let first = results[0].1.as_ref().unwrap();
        assert_eq!(first.value(ByteOrder::Little), Some(2048));
        assert_eq!(results[1], (2, Err(CommError::Timeout)));
        let third = results[2].1.as_ref().unwrap();
        assert_eq!(third.value(ByteOrder::Little), Some(1024));
    }

    #[test]
    fn corrupt_reply_is_charged_to_its_sender() {
        let channel = MockChannel::new();
        let handle = channel.handle();
        let mut engine =
            TransactionEngine::new(channel).with_timeout(Duration::from_millis(10));
        let mut reply = encode_status(2, ErrorFlags::default(), &[0x02, 0x00]);
        let last = reply.len() - 1;
        reply[last] ^= 0xFF;
        handle.queue_reply(&reply);

        let mut group = GroupSyncRead::new(56, 2);
        group.add_address(1).unwrap();
        group.add_address(2).unwrap();
        let results = group.transmit_and_collect(&mut engine).unwrap();

        assert_eq!(results[0], (1, Err(CommError::Timeout)));
        assert!(matches!(
            results[1],
            (2, Err(CommError::Framing(FramingError::ChecksumMismatch { .. })))
        ));
    }

    #[test]
    fn removing_entries() {
        let mut batch = GroupSyncWrite::new(42);
        batch.add(1, &[1, 1]).unwrap();
        batch.add(2, &[2, 2]).unwrap();
        assert!(batch.remove(1));
        assert!(!batch.remove(1));
        assert_eq!(batch.data_length(), Some(2));
        assert!(batch.remove(2));
        assert_eq!(batch.data_length(), None);
        batch.add(3, &[3, 3, 3]).unwrap();
        assert!(batch.contains(3));

        let mut group = GroupSyncRead::new(56, 2);
        for id in [1, 2, 3] {
            group.add_address(id).unwrap();
        }
        assert!(group.remove_address(2));
        assert!(!group.remove_address(2));
        assert_eq!(group.ids(), &[1, 3]);
        assert_eq!(group.packet().unwrap().params(), &[56, 2, 1, 3]);
    }

    #[test]
    fn early_reply_is_held_for_its_turn() {
        let channel = MockChannel::new();
        let handle = channel.handle();
        let mut engine =
            TransactionEngine::new(channel).with_timeout(Duration::from_millis(10));
        let mut replies = encode_status(2, ErrorFlags::default(), &[0x02, 0x00]);
        replies.extend(encode_status(1, ErrorFlags::default(), &[0x01, 0x00]));
        handle.queue_reply(&replies);

        let mut group = GroupSyncRead::new(56, 2);
        group.add_address(1).unwrap();
        group.add_address(2).unwrap();
        let results = group.transmit_and_collect(&mut engine).unwrap();

        assert_eq!(results[0].1.as_ref().unwrap().data, vec![0x01, 0x00]);
        assert_eq!(results[1].1.as_ref().unwrap().data, vec![0x02, 0x00]);
    }
}
