use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::time::Instant;

use crate::{frame::Frame, packet::SpaceId};

/// A packet this endpoint has transmitted and may still care about
///
/// `included_in_bytes_in_flight` implies the packet is present in its
/// space's history; removal decrements the handler's `bytes_in_flight`
/// exactly once.
#[derive(Debug, Clone)]
pub(crate) struct SentPacket {
    pub(crate) pn: u64,
    pub(crate) space: SpaceId,
    pub(crate) send_time: Instant,
    /// Bytes on the wire, QUIC framing included, UDP/IP overhead excluded
    pub(crate) length: u64,
    /// Retransmittable frames the packet carried; ACKs are excluded
    pub(crate) frames: Vec<Frame>,
    /// Largest acknowledged of an ACK frame the packet carried, if any
    pub(crate) largest_acked: Option<u64>,
    pub(crate) can_be_retransmitted: bool,
    pub(crate) included_in_bytes_in_flight: bool,
    pub(crate) is_retransmission: bool,
    pub(crate) retransmission_of: Option<u64>,
    pub(crate) retransmitted_as: Vec<u64>,
}

impl SentPacket {
    pub(crate) fn new(
        pn: u64,
        space: SpaceId,
        send_time: Instant,
        length: u64,
        frames: Vec<Frame>,
        largest_acked: Option<u64>,
    ) -> Self {
        Self {
            pn,
            space,
            send_time,
            length,
            frames,
            largest_acked,
            can_be_retransmitted: false,
            included_in_bytes_in_flight: false,
            is_retransmission: false,
            retransmission_of: None,
            retransmitted_as: Vec::new(),
        }
    }
}

/// Ordered log of sent packets for one packet number space
#[derive(Debug, Default)]
pub(crate) struct SentPacketHistory {
    // BTreeMap so ACK processing and loss detection can walk ranges
    packets: BTreeMap<u64, SentPacket>,
}

impl SentPacketHistory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn sent_packet(&mut self, packet: SentPacket) {
        debug_assert!(self
            .packets
            .last_key_value()
            .map_or(true, |(&pn, _)| pn < packet.pn));
        self.packets.insert(packet.pn, packet);
    }

    /// Record retransmissions of `retransmission_of`, linking parent and
    /// children so later acks can settle the whole tree
    pub(crate) fn sent_packets_as_retransmission(
        &mut self,
        packets: Vec<SentPacket>,
        retransmission_of: u64,
    ) {
        for mut packet in packets {
            packet.is_retransmission = true;
            packet.retransmission_of = Some(retransmission_of);
            if let Some(parent) = self.packets.get_mut(&retransmission_of) {
                parent.retransmitted_as.push(packet.pn);
            }
            self.packets.insert(packet.pn, packet);
        }
    }

    pub(crate) fn get(&self, pn: u64) -> Option<&SentPacket> {
        self.packets.get(&pn)
    }

    pub(crate) fn get_mut(&mut self, pn: u64) -> Option<&mut SentPacket> {
        self.packets.get_mut(&pn)
    }

    pub(crate) fn remove(&mut self, pn: u64) -> Option<SentPacket> {
        self.packets.remove(&pn)
    }

    pub(crate) fn len(&self) -> usize {
        self.packets.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &SentPacket> {
        self.packets.values()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut SentPacket> {
        self.packets.values_mut()
    }

    /// Packets within `range`, ascending
    pub(crate) fn range(
        &self,
        range: RangeInclusive<u64>,
    ) -> impl Iterator<Item = &SentPacket> {
        self.packets.range(range).map(|(_, p)| p)
    }

    /// The oldest packet still awaiting acknowledgement
    pub(crate) fn first_outstanding(&self) -> Option<&SentPacket> {
        self.packets.values().find(|p| p.can_be_retransmitted)
    }

    pub(crate) fn has_outstanding_packets(&self) -> bool {
        self.first_outstanding().is_some()
    }

    /// Returns whether the packet was present and not already marked
    pub(crate) fn mark_cannot_be_retransmitted(&mut self, pn: u64) -> bool {
        match self.packets.get_mut(&pn) {
            Some(p) => {
                let was = p.can_be_retransmitted;
                p.can_be_retransmitted = false;
                was
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(pn: u64) -> SentPacket {
        let mut p = SentPacket::new(pn, SpaceId::Data, Instant::now(), 1200, vec![Frame::Ping], None);
        p.can_be_retransmitted = true;
        p
    }

    #[test]
    fn ordered_iteration() {
        let mut history = SentPacketHistory::new();
        for pn in [1, 3, 4, 7] {
            history.sent_packet(packet(pn));
        }
        let pns: Vec<_> = history.iter().map(|p| p.pn).collect();
        assert_eq!(pns, [1, 3, 4, 7]);
        let ranged: Vec<_> = history.range(3..=4).map(|p| p.pn).collect();
        assert_eq!(ranged, [3, 4]);
    }

    #[test]
    fn first_outstanding_skips_settled() {
        let mut history = SentPacketHistory::new();
        history.sent_packet(packet(1));
        history.sent_packet(packet(2));
        assert_eq!(history.first_outstanding().unwrap().pn, 1);
        assert!(history.mark_cannot_be_retransmitted(1));
        assert_eq!(history.first_outstanding().unwrap().pn, 2);
        assert!(!history.mark_cannot_be_retransmitted(1));
        assert!(history.mark_cannot_be_retransmitted(2));
        assert!(!history.has_outstanding_packets());
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn retransmission_links() {
        let mut history = SentPacketHistory::new();
        history.sent_packet(packet(1));
        history.sent_packets_as_retransmission(vec![packet(5), packet(6)], 1);
        assert_eq!(history.get(1).unwrap().retransmitted_as, [5, 6]);
        assert_eq!(history.get(5).unwrap().retransmission_of, Some(1));
        assert!(history.get(6).unwrap().is_retransmission);
    }
}
