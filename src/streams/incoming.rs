use rustc_hash::FxHashSet;

use crate::transport_error::Error as TransportError;
use crate::Dir;

/// Bookkeeping for peer-initiated streams of one directionality
///
/// Streams are identified here by their 60-bit ordinal within the
/// (initiator, direction) pair. The peer may open any ordinal up to
/// `max_index`; opening ordinal `n` lazily materialises every not-yet-seen
/// stream below it so the application observes them in order.
#[derive(Debug)]
pub(crate) struct IncomingStreams {
    dir: Dir,

    /// Materialised, not yet deleted
    streams: FxHashSet<u64>,
    /// Deleted before the application accepted them; deletion completes at
    /// accept time
    streams_to_delete: FxHashSet<u64>,

    /// Next ordinal `accept()` will hand to the application
    next_to_accept: u64,
    /// Lowest ordinal not yet materialised
    next_to_open: u64,
    /// Highest ordinal the peer is currently allowed to open (inclusive)
    max_index: u64,
    /// Concurrent stream budget granted to the peer
    max_num_streams: u64,
}

/// Result of routing a frame to a possibly-new incoming stream
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum OpenResult {
    /// The ordinal was already materialised (or already deleted, in which
    /// case frames for it are stale and ignorable)
    Existing { deleted: bool },
    /// Ordinals `materialize` were created by this call
    Opened { materialize: std::ops::RangeInclusive<u64> },
}

impl IncomingStreams {
    pub(crate) fn new(dir: Dir, max_num_streams: u64) -> Self {
        Self {
            dir,
            streams: FxHashSet::default(),
            streams_to_delete: FxHashSet::default(),
            next_to_accept: 0,
            next_to_open: 0,
            max_index: max_num_streams.saturating_sub(1),
            max_num_streams,
        }
    }

    /// Route an inbound reference to stream ordinal `num`
    pub(crate) fn get_or_open(&mut self, num: u64) -> Result<OpenResult, TransportError> {
        if self.max_num_streams == 0 || num > self.max_index {
            return Err(TransportError::STREAM_LIMIT_ERROR(format!(
                "peer tried to open {} stream {} (current limit: {})",
                self.dir, num, self.max_num_streams,
            )));
        }
        if num < self.next_to_open {
            return Ok(OpenResult::Existing {
                deleted: !self.streams.contains(&num) || self.streams_to_delete.contains(&num),
            });
        }
        for n in self.next_to_open..=num {
            self.streams.insert(n);
        }
        let materialize = self.next_to_open..=num;
        self.next_to_open = num + 1;
        Ok(OpenResult::Opened { materialize })
    }

    /// The next acceptable ordinal, if one has been materialised
    ///
    /// Advances the accept cursor; a stream that was deleted while waiting
    /// finishes deletion here and the credit update is returned alongside.
    pub(crate) fn try_accept(&mut self) -> Option<(u64, Option<u64>)> {
        let num = self.next_to_accept;
        if !self.streams.contains(&num) {
            return None;
        }
        self.next_to_accept += 1;
        let mut credit = None;
        if self.streams_to_delete.remove(&num) {
            credit = self.delete_stream(num).expect("stream existed");
        }
        Some((num, credit))
    }

    /// Remove a finished stream
    ///
    /// Returns the new MAX_STREAMS count to advertise, when deletion frees
    /// budget for the peer. Deleting the same ordinal twice is an error.
    pub(crate) fn delete(&mut self, num: u64) -> Result<Option<u64>, TransportError> {
        if !self.streams.contains(&num) {
            return Err(TransportError::INTERNAL_ERROR(format!(
                "tried to delete unknown {} stream {num}",
                self.dir,
            )));
        }
        // Keep streams the application hasn't accepted yet; they are
        // deleted as soon as they're accepted
        if num >= self.next_to_accept {
            if self.streams_to_delete.contains(&num) {
                return Err(TransportError::INTERNAL_ERROR(format!(
                    "tried to delete {} stream {num} multiple times",
                    self.dir,
                )));
            }
            self.streams_to_delete.insert(num);
            return Ok(None);
        }
        self.delete_stream(num)
    }

    fn delete_stream(&mut self, num: u64) -> Result<Option<u64>, TransportError> {
        self.streams.remove(&num);
        // Free budget lets the peer open that many additional streams
        if self.max_num_streams > self.streams.len() as u64 {
            let new_streams = self.max_num_streams - self.streams.len() as u64;
            self.max_index = self.next_to_open + new_streams - 1;
            return Ok(Some(self.max_index + 1));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn over_limit_is_stream_limit_error() {
        let mut incoming = IncomingStreams::new(Dir::Bi, 5);
        let err = incoming.get_or_open(5).unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::STREAM_LIMIT_ERROR);
        assert_matches!(
            incoming.get_or_open(4),
            Ok(OpenResult::Opened { materialize }) if materialize == (0..=4)
        );
    }

    #[test]
    fn lazy_materialisation() {
        let mut incoming = IncomingStreams::new(Dir::Uni, 100);
        assert_matches!(
            incoming.get_or_open(2),
            Ok(OpenResult::Opened { materialize }) if materialize == (0..=2)
        );
        assert_matches!(
            incoming.get_or_open(1),
            Ok(OpenResult::Existing { deleted: false })
        );
        assert_matches!(
            incoming.get_or_open(3),
            Ok(OpenResult::Opened { materialize }) if materialize == (3..=3)
        );
    }

    #[test]
    fn accept_in_order() {
        let mut incoming = IncomingStreams::new(Dir::Bi, 100);
        assert!(incoming.try_accept().is_none());
        incoming.get_or_open(1).unwrap();
        assert_eq!(incoming.try_accept(), Some((0, None)));
        assert_eq!(incoming.try_accept(), Some((1, None)));
        assert!(incoming.try_accept().is_none());
    }

    #[test]
    fn delete_before_accept_is_deferred() {
        let mut incoming = IncomingStreams::new(Dir::Bi, 100);
        incoming.get_or_open(0).unwrap();
        assert_eq!(incoming.delete(0).unwrap(), None);
        // Frames routed to it now see a deleted stream
        assert_matches!(
            incoming.get_or_open(0),
            Ok(OpenResult::Existing { deleted: true })
        );
        // Acceptance completes the deletion and frees budget
        let (num, credit) = incoming.try_accept().unwrap();
        assert_eq!(num, 0);
        assert_eq!(credit, Some(101));
    }

    #[test]
    fn double_delete_is_an_error() {
        let mut incoming = IncomingStreams::new(Dir::Bi, 100);
        incoming.get_or_open(0).unwrap();
        incoming.try_accept().unwrap();
        assert_eq!(incoming.delete(0).unwrap(), Some(101));
        assert!(incoming.delete(0).is_err());
    }

    #[test]
    fn double_deferred_delete_is_an_error() {
        let mut incoming = IncomingStreams::new(Dir::Bi, 100);
        incoming.get_or_open(0).unwrap();
        incoming.delete(0).unwrap();
        assert!(incoming.delete(0).is_err());
    }

    #[test]
    fn credit_tracks_open_streams() {
        let mut incoming = IncomingStreams::new(Dir::Bi, 2);
        incoming.get_or_open(1).unwrap();
        incoming.try_accept().unwrap();
        incoming.try_accept().unwrap();
        // Limit reached
        assert!(incoming.get_or_open(2).is_err());
        // Deleting one stream advertises room for exactly one more
        assert_eq!(incoming.delete(0).unwrap(), Some(3));
        assert_matches!(
            incoming.get_or_open(2),
            Ok(OpenResult::Opened { .. })
        );
        assert!(incoming.get_or_open(3).is_err());
    }
}
