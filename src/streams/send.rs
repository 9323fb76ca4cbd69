use std::ops::Range;

use bytes::{Buf, Bytes, BytesMut};

use crate::range_set::RangeSet;

/// Buffer of outgoing retransmittable stream data
#[derive(Default, Debug)]
pub(crate) struct SendBuffer {
    /// Data written by the application but not yet acknowledged. May or may
    /// not have been sent.
    unacked: BytesMut,
    /// The first offset not yet written by the application, i.e. the offset
    /// past the end of `unacked`
    offset: u64,
    /// The first offset that hasn't been sent
    ///
    /// Always lies in (offset - unacked.len())..=offset
    unsent: u64,
    /// Acknowledged ranges which can't be discarded yet because they don't
    /// include the earliest offset in `unacked`
    acks: RangeSet,
}

impl SendBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append application data to the end of the stream
    pub(crate) fn write(&mut self, data: &[u8]) {
        self.unacked.extend_from_slice(data);
        self.offset += data.len() as u64;
    }

    /// Discard a range of acknowledged stream data
    pub(crate) fn ack(&mut self, range: Range<u64>) {
        self.acks.insert(range);
        while self.acks.min() == Some(self.offset - self.unacked.len() as u64) {
            let prefix = self.acks.pop_min().unwrap();
            self.unacked.advance((prefix.end - prefix.start) as usize);
        }
    }

    /// Compute the next range to transmit and account for its transmission
    pub(crate) fn poll_transmit(&mut self, max_len: usize) -> Range<u64> {
        let end = self.offset.min((max_len as u64).saturating_add(self.unsent));
        let result = self.unsent..end;
        self.unsent = end;
        result
    }

    /// Copy out previously written data for (re)transmission
    pub(crate) fn get(&self, offsets: Range<u64>) -> Bytes {
        let base_offset = self.offset - self.unacked.len() as u64;
        let start = (offsets.start - base_offset) as usize;
        let end = (offsets.end - base_offset) as usize;
        Bytes::copy_from_slice(&self.unacked[start..end])
    }

    /// First offset the next write will begin at
    pub(crate) fn offset(&self) -> u64 {
        self.offset
    }

    /// Whether all sent data has been acknowledged
    pub(crate) fn is_fully_acked(&self) -> bool {
        self.unacked.is_empty()
    }

    /// Whether there's data not yet put on the wire
    pub(crate) fn has_unsent_data(&self) -> bool {
        self.unsent != self.offset
    }

    /// Bytes written but not yet sent
    pub(crate) fn unsent_len(&self) -> u64 {
        self.offset - self.unsent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment() {
        let mut buf = SendBuffer::new();
        const MSG: &[u8] = b"Hello, world!";
        buf.write(MSG);
        assert_eq!(buf.poll_transmit(5), 0..5);
        assert_eq!(buf.poll_transmit(MSG.len() - 5), 5..MSG.len() as u64);
        assert_eq!(buf.poll_transmit(42), MSG.len() as u64..MSG.len() as u64);
        assert!(!buf.has_unsent_data());
    }

    #[test]
    fn ack() {
        let mut buf = SendBuffer::new();
        const MSG: &[u8] = b"Hello, world!";
        buf.write(MSG);
        assert_eq!(buf.poll_transmit(5), 0..5);
        buf.ack(0..5);
        assert_eq!(&buf.unacked[..], &MSG[5..]);
        assert!(!buf.is_fully_acked());
    }

    #[test]
    fn reordered_ack() {
        let mut buf = SendBuffer::new();
        const MSG: &[u8] = b"Hello, world!";
        buf.write(MSG);
        assert_eq!(buf.poll_transmit(5), 0..5);
        assert_eq!(buf.poll_transmit(MSG.len() - 5), 5..MSG.len() as u64);
        buf.ack(5..MSG.len() as u64);
        assert_eq!(&buf.unacked[..], MSG);
        buf.ack(0..5);
        assert!(buf.is_fully_acked());
        assert!(buf.acks.is_empty());
    }

    #[test]
    fn get_after_partial_ack() {
        let mut buf = SendBuffer::new();
        buf.write(b"abcdefgh");
        assert_eq!(buf.poll_transmit(8), 0..8);
        buf.ack(0..4);
        assert_eq!(&buf.get(4..8)[..], b"efgh");
    }
}
