//! Fragmented block transfer over the handshake.
//!
//! During connection setup each side may push an opaque byte block to the
//! other: the client's payload rides up while it is in `SendingClientData`,
//! the server's streams down alongside the later handshake states.
//! Fragments are fixed-size (only the last may be short), individually
//! acked, and retransmitted round-robin until every ack is in.

use std::net::SocketAddr;

use thiserror::Error;

use crate::consts::MAX_FRAGMENT_SIZE;
use crate::interface::NetworkInterface;
use crate::packet::{DataBlockFragmentAckPacket, DataBlockFragmentPacket};
use crate::time::TimeBase;

/// Identity a block endpoint stamps into every packet it emits, installed
/// once the challenge exchange has fixed both guids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    pub address: SocketAddr,
    pub client_guid: u64,
    pub server_guid: u64,
}

/// Why a block transfer was abandoned. The code is surfaced as the
/// client's extended error.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BlockError {
    #[error("declared block size exceeds the configured maximum")]
    BlockTooLarge = 1,
    #[error("fragment is inconsistent with the block descriptor")]
    InvalidFragment = 2,
    #[error("block descriptor changed mid-transfer")]
    DescriptorMismatch = 3,
}

impl BlockError {
    pub fn code(self) -> u32 {
        self as u32
    }
}

/// Rate-paced fragmented transmission of one opaque payload.
pub struct BlockSender {
    block: Vec<u8>,
    fragment_size: usize,
    fragments_per_second: f64,
    acked: Vec<bool>,
    num_acked: usize,
    cursor: usize,
    accumulator: f64,
    info: Option<SessionInfo>,
}

impl BlockSender {
    pub fn new(block: Vec<u8>, fragment_size: usize, fragments_per_second: f64) -> Self {
        debug_assert!(fragment_size >= 1 && fragment_size <= MAX_FRAGMENT_SIZE);
        debug_assert!(fragments_per_second > 0.0);
        let num_fragments = block.len().div_ceil(fragment_size);
        Self {
            block,
            fragment_size,
            fragments_per_second,
            acked: vec![false; num_fragments],
            num_acked: 0,
            cursor: 0,
            accumulator: 0.0,
            info: None,
        }
    }

    /// Install the session identity. Must happen before the first update
    /// that transmits; the client does this when the challenge lands.
    pub fn set_info(&mut self, info: SessionInfo) {
        self.info = Some(info);
    }

    pub fn num_fragments(&self) -> usize {
        self.acked.len()
    }

    /// True once every fragment has been acknowledged.
    pub fn send_completed(&self) -> bool {
        self.num_acked == self.acked.len()
    }

    /// Mark a fragment acknowledged. Out-of-range ids are ignored.
    pub fn process_ack(&mut self, fragment_id: u16) {
        let Some(acked) = self.acked.get_mut(fragment_id as usize) else {
            return;
        };
        if !*acked {
            *acked = true;
            self.num_acked += 1;
            log::trace!(
                "fragment {} acked ({}/{})",
                fragment_id,
                self.num_acked,
                self.acked.len()
            );
        }
    }

    /// Spend accumulated send budget on unacked fragments, lowest index
    /// first, wrapping to the lowest unacked after the last.
    pub fn update(&mut self, time_base: &TimeBase, interface: &mut impl NetworkInterface) {
        let Some(info) = self.info else {
            debug_assert!(false, "block sender updated before set_info");
            return;
        };
        if self.send_completed() {
            return;
        }
        self.accumulator += time_base.delta_time;
        let time_between_fragments = 1.0 / self.fragments_per_second;
        while self.accumulator >= time_between_fragments {
            self.accumulator -= time_between_fragments;
            let Some(fragment_id) = self.next_unacked() else {
                break;
            };
            let begin = fragment_id * self.fragment_size;
            let end = usize::min(begin + self.fragment_size, self.block.len());
            log::trace!("sending block fragment {} [{}..{}]", fragment_id, begin, end);
            let packet = DataBlockFragmentPacket::create(
                info.client_guid,
                info.server_guid,
                self.block.len() as u32,
                self.acked.len() as u16,
                fragment_id as u16,
                &self.block[begin..end],
            );
            interface.send_packet(info.address, packet);
            self.cursor = fragment_id + 1;
        }
    }

    fn next_unacked(&self) -> Option<usize> {
        let num_fragments = self.acked.len();
        (self.cursor..num_fragments)
            .chain(0..self.cursor)
            .find(|&id| !self.acked[id])
    }

    /// Release per-send state for reuse.
    pub fn clear(&mut self) {
        self.acked.fill(false);
        self.num_acked = 0;
        self.cursor = 0;
        self.accumulator = 0.0;
        self.info = None;
    }
}

/// Windowed reassembly of one inbound payload.
pub struct BlockReceiver {
    fragment_size: usize,
    max_block_size: usize,
    block_size: usize,
    received: Vec<bool>,
    num_received: usize,
    data: Vec<u8>,
    error: Option<BlockError>,
    info: Option<SessionInfo>,
}

impl BlockReceiver {
    pub fn new(fragment_size: usize, max_block_size: usize) -> Self {
        debug_assert!(fragment_size >= 1 && fragment_size <= MAX_FRAGMENT_SIZE);
        Self {
            fragment_size,
            max_block_size,
            block_size: 0,
            received: Vec::new(),
            num_received: 0,
            data: Vec::new(),
            error: None,
            info: None,
        }
    }

    /// Install the session identity used to stamp outbound acks.
    pub fn set_info(&mut self, info: SessionInfo) {
        self.info = Some(info);
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn error(&self) -> Option<BlockError> {
        self.error
    }

    /// The reassembled block once every fragment has arrived, else `None`.
    pub fn block(&self) -> Option<&[u8]> {
        let complete = !self.received.is_empty() && self.num_received == self.received.len();
        if self.error.is_none() && complete {
            Some(&self.data)
        } else {
            None
        }
    }

    /// Fold one fragment in. The first consistent fragment fixes the
    /// descriptor and allocates the buffer; duplicates are no-ops; every
    /// accepted non-duplicate fragment is acked to the sender.
    pub fn process_fragment(
        &mut self,
        block_size: u32,
        num_fragments: u16,
        fragment_id: u16,
        fragment_data: &[u8],
        interface: &mut impl NetworkInterface,
    ) {
        if self.error.is_some() {
            return;
        }
        let Some(info) = self.info else {
            debug_assert!(false, "block receiver fed before set_info");
            return;
        };
        let block_size = block_size as usize;
        let num_fragments = num_fragments as usize;
        let fragment_id = fragment_id as usize;

        if self.received.is_empty() {
            if block_size > self.max_block_size {
                self.set_error(BlockError::BlockTooLarge);
                return;
            }
            if block_size == 0 || num_fragments != block_size.div_ceil(self.fragment_size) {
                self.set_error(BlockError::InvalidFragment);
                return;
            }
            self.block_size = block_size;
            self.received = vec![false; num_fragments];
            self.data = vec![0; block_size];
        } else if block_size != self.block_size || num_fragments != self.received.len() {
            self.set_error(BlockError::DescriptorMismatch);
            return;
        }

        if fragment_id >= self.received.len() {
            self.set_error(BlockError::InvalidFragment);
            return;
        }

        let begin = fragment_id * self.fragment_size;
        let end = usize::min(begin + self.fragment_size, self.block_size);
        if fragment_data.len() != end - begin {
            self.set_error(BlockError::InvalidFragment);
            return;
        }

        if self.received[fragment_id] {
            return;
        }

        self.data[begin..end].copy_from_slice(fragment_data);
        self.received[fragment_id] = true;
        self.num_received += 1;
        log::trace!(
            "received block fragment {} ({}/{})",
            fragment_id,
            self.num_received,
            self.received.len()
        );

        let ack = DataBlockFragmentAckPacket::create(
            info.client_guid,
            info.server_guid,
            fragment_id as u16,
        );
        interface.send_packet(info.address, ack);
    }

    fn set_error(&mut self, error: BlockError) {
        log::debug!("block receiver error: {}", error);
        self.error = Some(error);
    }

    /// Discard all transfer state.
    pub fn clear(&mut self) {
        self.block_size = 0;
        self.received.clear();
        self.num_received = 0;
        self.data.clear();
        self.error = None;
        self.info = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::MAX_PACKET_SIZE;
    use crate::packet::Packet;

    const TICK: f64 = 1.0 / 60.0;

    #[derive(Default)]
    struct CapturedPackets {
        sent: Vec<(SocketAddr, Packet)>,
    }

    impl CapturedPackets {
        fn fragment_ids(&self) -> Vec<u16> {
            self.sent
                .iter()
                .filter_map(|(_, packet)| match packet {
                    Packet::DataBlockFragment(fragment) => Some(fragment.fragment_id),
                    _ => None,
                })
                .collect()
        }

        fn ack_ids(&self) -> Vec<u16> {
            self.sent
                .iter()
                .filter_map(|(_, packet)| match packet {
                    Packet::DataBlockFragmentAck(ack) => Some(ack.fragment_id),
                    _ => None,
                })
                .collect()
        }
    }

    impl NetworkInterface for CapturedPackets {
        fn send_packet(&mut self, to: SocketAddr, packet: Packet) {
            self.sent.push((to, packet));
        }

        fn receive_packet(&mut self) -> Option<(SocketAddr, Packet)> {
            None
        }

        fn update(&mut self, _time_base: &TimeBase) {}

        fn max_packet_size(&self) -> usize {
            MAX_PACKET_SIZE
        }
    }

    fn session_info() -> SessionInfo {
        SessionInfo {
            address: "127.0.0.1:40000".parse().unwrap(),
            client_guid: 0x1111,
            server_guid: 0x2222,
        }
    }

    fn tick(sender: &mut BlockSender, captured: &mut CapturedPackets) {
        sender.update(&TimeBase::new(0.0, TICK), captured);
    }

    #[test]
    fn sender_walks_fragments_round_robin() {
        let block: Vec<u8> = (0..3000).map(|i| (i % 251) as u8).collect();
        let mut sender = BlockSender::new(block, 1024, 60.0);
        sender.set_info(session_info());
        assert_eq!(sender.num_fragments(), 3);

        let mut captured = CapturedPackets::default();
        for _ in 0..6 {
            tick(&mut sender, &mut captured);
        }
        // One fragment per tick at 60/s and a 60 Hz tick, wrapping.
        assert_eq!(captured.fragment_ids(), vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn sender_skips_acked_fragments_and_completes() {
        let block = vec![7u8; 3000];
        let mut sender = BlockSender::new(block, 1024, 60.0);
        sender.set_info(session_info());

        sender.process_ack(1);
        assert!(!sender.send_completed());

        let mut captured = CapturedPackets::default();
        for _ in 0..4 {
            tick(&mut sender, &mut captured);
        }
        assert_eq!(captured.fragment_ids(), vec![0, 2, 0, 2]);

        sender.process_ack(0);
        sender.process_ack(2);
        assert!(sender.send_completed());

        // Nothing more goes out once everything is acked.
        captured.sent.clear();
        tick(&mut sender, &mut captured);
        assert!(captured.sent.is_empty());
    }

    #[test]
    fn sender_ignores_out_of_range_and_duplicate_acks() {
        let mut sender = BlockSender::new(vec![0u8; 2048], 1024, 60.0);
        sender.set_info(session_info());

        sender.process_ack(9);
        sender.process_ack(0);
        sender.process_ack(0);
        assert!(!sender.send_completed());

        sender.process_ack(1);
        assert!(sender.send_completed());
    }

    #[test]
    fn sender_paces_to_the_fragment_budget() {
        let mut sender = BlockSender::new(vec![0u8; 100 * 16], 16, 8.0);
        sender.set_info(session_info());

        let mut captured = CapturedPackets::default();
        // 0.5 s at 8 fragments/s buys 4 sends regardless of tick rate.
        sender.update(&TimeBase::new(0.0, 0.5), &mut captured);
        assert_eq!(captured.sent.len(), 4);
    }

    #[test]
    fn final_short_fragment_carries_the_remainder() {
        let block: Vec<u8> = (0..2500).map(|i| (i % 256) as u8).collect();
        let mut sender = BlockSender::new(block.clone(), 1024, 60.0);
        sender.set_info(session_info());

        let mut captured = CapturedPackets::default();
        for _ in 0..3 {
            tick(&mut sender, &mut captured);
        }
        let last = match &captured.sent[2].1 {
            Packet::DataBlockFragment(fragment) => fragment,
            other => panic!("expected fragment, got {:?}", other),
        };
        assert_eq!(last.fragment_id, 2);
        assert_eq!(last.fragment_data.len(), 2500 - 2 * 1024);
        assert_eq!(last.fragment_data[..], block[2048..]);
    }

    fn feed(
        receiver: &mut BlockReceiver,
        captured: &mut CapturedPackets,
        block: &[u8],
        fragment_id: u16,
    ) {
        let begin = fragment_id as usize * 1024;
        let end = usize::min(begin + 1024, block.len());
        receiver.process_fragment(
            block.len() as u32,
            block.len().div_ceil(1024) as u16,
            fragment_id,
            &block[begin..end],
            captured,
        );
    }

    #[test]
    fn receiver_reassembles_out_of_order_with_duplicates() {
        let block: Vec<u8> = (0..4096).map(|i| (i * 7 % 256) as u8).collect();
        let mut receiver = BlockReceiver::new(1024, 8192);
        receiver.set_info(session_info());

        let mut captured = CapturedPackets::default();
        for id in [2u16, 0, 2, 3, 0, 1] {
            feed(&mut receiver, &mut captured, &block, id);
        }

        assert!(!receiver.is_error());
        assert_eq!(receiver.block(), Some(&block[..]));
        // One ack per distinct fragment, none for the duplicates.
        let mut acks = captured.ack_ids();
        acks.sort_unstable();
        assert_eq!(acks, vec![0, 1, 2, 3]);
    }

    #[test]
    fn receiver_is_incomplete_until_every_fragment_arrives() {
        let block = vec![3u8; 4096];
        let mut receiver = BlockReceiver::new(1024, 8192);
        receiver.set_info(session_info());

        let mut captured = CapturedPackets::default();
        for id in [0u16, 1, 3] {
            feed(&mut receiver, &mut captured, &block, id);
        }
        assert_eq!(receiver.block(), None);

        feed(&mut receiver, &mut captured, &block, 2);
        assert_eq!(receiver.block(), Some(&block[..]));
    }

    #[test]
    fn receiver_rejects_oversized_block() {
        let mut receiver = BlockReceiver::new(1024, 2048);
        receiver.set_info(session_info());

        let mut captured = CapturedPackets::default();
        receiver.process_fragment(4096, 4, 0, &[0u8; 1024], &mut captured);

        assert_eq!(receiver.error(), Some(BlockError::BlockTooLarge));
        assert!(captured.ack_ids().is_empty());
        assert_eq!(receiver.block(), None);
    }

    #[test]
    fn receiver_rejects_descriptor_changes() {
        let mut receiver = BlockReceiver::new(1024, 8192);
        receiver.set_info(session_info());

        let mut captured = CapturedPackets::default();
        receiver.process_fragment(4096, 4, 0, &[0u8; 1024], &mut captured);
        receiver.process_fragment(2048, 2, 1, &[0u8; 1024], &mut captured);

        assert_eq!(receiver.error(), Some(BlockError::DescriptorMismatch));
    }

    #[test]
    fn receiver_rejects_inconsistent_first_fragment() {
        let mut receiver = BlockReceiver::new(1024, 8192);
        receiver.set_info(session_info());

        // num_fragments does not match the declared block size.
        let mut captured = CapturedPackets::default();
        receiver.process_fragment(4096, 3, 0, &[0u8; 1024], &mut captured);
        assert_eq!(receiver.error(), Some(BlockError::InvalidFragment));
    }

    #[test]
    fn receiver_rejects_short_non_final_fragment() {
        let mut receiver = BlockReceiver::new(1024, 8192);
        receiver.set_info(session_info());

        let mut captured = CapturedPackets::default();
        receiver.process_fragment(4096, 4, 1, &[0u8; 100], &mut captured);
        assert_eq!(receiver.error(), Some(BlockError::InvalidFragment));
    }

    #[test]
    fn receiver_clear_allows_reuse() {
        let block = vec![9u8; 2048];
        let mut receiver = BlockReceiver::new(1024, 8192);
        receiver.set_info(session_info());

        let mut captured = CapturedPackets::default();
        for id in [0u16, 1] {
            feed(&mut receiver, &mut captured, &block, id);
        }
        assert!(receiver.block().is_some());

        receiver.clear();
        assert_eq!(receiver.block(), None);
        assert!(!receiver.is_error());
    }
}
