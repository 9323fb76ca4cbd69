//! Decides when and how received packets are acknowledged
//!
//! One tracker per packet number space. The first packet in a space is
//! acknowledged immediately; afterwards every second ack-eliciting packet
//! is, until enough packets have arrived that acks decimate to every tenth
//! with a delayed-ack alarm as backstop. Reordering gets special treatment:
//! filling a gap the peer already saw reported triggers an immediate ACK,
//! and a freshly created gap arms a short alarm so the sender learns about
//! possible loss quickly.

use std::time::{Duration, Instant};

use tracing::trace;

use crate::frame::Ack;
use crate::range_set::RangeSet;
use crate::recovery::RttEstimator;
use crate::transport_error::Error as TransportError;
use crate::MAX_ACK_DELAY;

/// Hard cap on tracked ACK ranges; an attacker sending every other packet
/// number must not grow our state without bound
pub(crate) const MAX_ACK_RANGES: usize = 500;

/// Packet count below which every second ack-eliciting packet is acked
const MIN_RECEIVED_BEFORE_ACK_DECIMATION: u64 = 100;

/// Ack frequency before decimation kicks in
const PACKETS_BEFORE_ACK: usize = 2;
/// Ack frequency after decimation
const ACK_ELICITING_PACKETS_BEFORE_ACK: usize = 10;

/// A new top range at most this long signals fresh reordering worth a
/// fast-armed alarm
const MAX_PACKETS_AFTER_NEW_MISSING: u64 = 4;

/// Ranges included in a single ACK frame; keeps every ACK within one
/// minimum-MTU packet with room to spare
const MAX_ACK_RANGES_PER_FRAME: usize = 32;

#[derive(Debug, Default)]
pub(crate) struct ReceivedPacketTracker {
    largest_observed: Option<u64>,
    largest_observed_received_time: Option<Instant>,

    /// Packets below this are no longer tracked; set from the peer's
    /// confirmation of our ACKs
    ignore_below: u64,

    /// Contiguous intervals of received packet numbers
    packet_history: RangeSet,

    ack_queued: bool,
    ack_alarm: Option<Instant>,
    last_ack: Option<Ack>,

    packets_received_since_last_ack: usize,
    ack_eliciting_packets_received_since_last_ack: usize,
}

impl ReceivedPacketTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record receipt of a packet and decide whether to acknowledge
    pub(crate) fn received_packet(
        &mut self,
        pn: u64,
        recv_time: Instant,
        ack_eliciting: bool,
        rtt: &RttEstimator,
    ) -> Result<(), TransportError> {
        let was_missing = self.was_reported_missing(pn);

        if pn >= self.ignore_below && self.packet_history.insert_one(pn) {
            if self.packet_history.len() > MAX_ACK_RANGES {
                return Err(TransportError::INTERNAL_ERROR(
                    "too many outstanding received ACK ranges",
                ));
            }
        }

        if self.largest_observed.map_or(true, |largest| pn > largest) {
            self.largest_observed = Some(pn);
            self.largest_observed_received_time = Some(recv_time);
        }

        self.maybe_queue_ack(recv_time, ack_eliciting, was_missing, rtt);
        Ok(())
    }

    fn maybe_queue_ack(
        &mut self,
        recv_time: Instant,
        ack_eliciting: bool,
        was_missing: bool,
        rtt: &RttEstimator,
    ) {
        self.packets_received_since_last_ack += 1;
        if ack_eliciting {
            self.ack_eliciting_packets_received_since_last_ack += 1;
        }

        if self.last_ack.is_none() {
            // The very first packet in a space is always acked immediately
            self.ack_queued = true;
            return;
        }

        // Filling a gap the peer already saw reported means it may be
        // spuriously retransmitting; tell it right away
        if was_missing {
            self.ack_queued = true;
        }

        if !self.ack_queued && ack_eliciting {
            let threshold = if self
                .largest_observed
                .map_or(true, |largest| largest < MIN_RECEIVED_BEFORE_ACK_DECIMATION)
            {
                PACKETS_BEFORE_ACK
            } else {
                ACK_ELICITING_PACKETS_BEFORE_ACK
            };
            if self.ack_eliciting_packets_received_since_last_ack >= threshold {
                self.ack_queued = true;
            } else {
                self.ack_alarm = Some(recv_time + MAX_ACK_DELAY);
            }

            // A brand-new missing range warrants a fast response so the
            // sender can detect the loss within a fraction of an RTT
            if self.has_new_missing_packets() {
                let delay = rtt.min() / 8;
                self.ack_alarm = Some(recv_time + delay);
            }
        }

        if self.ack_queued {
            self.ack_alarm = None;
        }
    }

    /// Stop tracking packets below `pn`
    ///
    /// Later arrivals below the cutoff still bump counters but never rejoin
    /// the range set.
    pub(crate) fn ignore_below(&mut self, pn: u64) {
        if pn <= self.ignore_below {
            return;
        }
        self.ignore_below = pn;
        self.packet_history.remove_below(pn);
    }

    /// Produce an ACK frame if one is queued or the alarm has expired
    pub(crate) fn get_ack_frame(&mut self, now: Instant) -> Option<Ack> {
        if !self.ack_queued && self.ack_alarm.map_or(true, |alarm| alarm > now) {
            return None;
        }

        let delay = self
            .largest_observed_received_time
            .map_or(Duration::ZERO, |t| now.saturating_duration_since(t));
        let ack = Ack::from_range_set(&self.packet_history, delay, MAX_ACK_RANGES_PER_FRAME, None)?;
        trace!(largest = ack.largest_acked(), ranges = ack.ranges.len(), "sending ACK");

        self.last_ack = Some(ack.clone());
        self.ack_alarm = None;
        self.ack_queued = false;
        self.packets_received_since_last_ack = 0;
        self.ack_eliciting_packets_received_since_last_ack = 0;
        Some(ack)
    }

    pub(crate) fn get_alarm_timeout(&self) -> Option<Instant> {
        self.ack_alarm
    }

    /// Whether `pn` has been seen before (or predates the tracked window)
    ///
    /// Duplicate packets must not be processed twice; anything below the
    /// ignore threshold is indistinguishable from a replay.
    pub(crate) fn is_duplicate(&self, pn: u64) -> bool {
        pn < self.ignore_below || self.packet_history.contains(pn)
    }

    /// Whether `pn` fell in a gap of the last ACK we sent
    fn was_reported_missing(&self, pn: u64) -> bool {
        if pn < self.ignore_below {
            return false;
        }
        match &self.last_ack {
            Some(ack) => pn < ack.largest_acked() && !ack.acks_packet(pn),
            None => false,
        }
    }

    /// Whether the latest arrivals opened a gap the last ACK didn't report
    fn has_new_missing_packets(&self) -> bool {
        let last_ack = match &self.last_ack {
            Some(ack) => ack,
            None => return false,
        };
        let highest = match self.packet_history.peek_max() {
            Some(range) => range,
            None => return false,
        };
        highest.start >= last_ack.largest_acked()
            && highest.end - highest.start <= MAX_PACKETS_AFTER_NEW_MISSING
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rtt() -> RttEstimator {
        RttEstimator::new(Duration::from_millis(100))
    }

    fn rtt_of(ms: u64) -> RttEstimator {
        let mut est = RttEstimator::new(Duration::from_millis(100));
        est.update(Duration::ZERO, Duration::from_millis(ms));
        est
    }

    fn receive_and_ack(tracker: &mut ReceivedPacketTracker, pns: impl Iterator<Item = u64>, now: Instant) {
        for pn in pns {
            tracker.received_packet(pn, now, true, &rtt()).unwrap();
        }
        assert!(tracker.get_ack_frame(now).is_some());
        assert!(!tracker.ack_queued);
    }

    #[test]
    fn first_packet_always_acked() {
        let mut tracker = ReceivedPacketTracker::new();
        let now = Instant::now();
        tracker.received_packet(1, now, false, &rtt()).unwrap();
        assert!(tracker.ack_queued);
        assert_eq!(tracker.get_alarm_timeout(), None);
        let ack = tracker.get_ack_frame(now).unwrap();
        assert!(ack.delay_time() < Duration::from_secs(1));
    }

    #[test]
    fn works_with_packet_number_zero() {
        let mut tracker = ReceivedPacketTracker::new();
        let now = Instant::now();
        tracker.received_packet(0, now, false, &rtt()).unwrap();
        assert!(tracker.ack_queued);
        let ack = tracker.get_ack_frame(now).unwrap();
        assert_eq!(ack.largest_acked(), 0);
        assert_eq!(ack.lowest_acked(), 0);
    }

    #[test]
    fn every_second_packet_acked_before_decimation() {
        let mut tracker = ReceivedPacketTracker::new();
        let now = Instant::now();
        receive_and_ack(&mut tracker, 1..=10, now);
        let mut pn = 11;
        for _ in 0..20 {
            tracker.received_packet(pn, now, true, &rtt()).unwrap();
            assert!(!tracker.ack_queued);
            pn += 1;
            tracker.received_packet(pn, now, true, &rtt()).unwrap();
            assert!(tracker.ack_queued);
            pn += 1;
            assert!(tracker.get_ack_frame(now).is_some());
        }
    }

    #[test]
    fn every_tenth_packet_acked_after_decimation() {
        let mut tracker = ReceivedPacketTracker::new();
        let now = Instant::now();
        receive_and_ack(&mut tracker, 1..=MIN_RECEIVED_BEFORE_ACK_DECIMATION, now);
        let mut pn = 10_000;
        for _ in 0..9 {
            tracker.received_packet(pn, now, true, &rtt()).unwrap();
            assert!(!tracker.ack_queued);
            pn += 1;
        }
        assert!(tracker.get_alarm_timeout().is_some());
        tracker.received_packet(pn, now, true, &rtt()).unwrap();
        assert!(tracker.ack_queued);
        assert_eq!(tracker.get_alarm_timeout(), None);
    }

    #[test]
    fn alarm_only_set_by_ack_eliciting() {
        let mut tracker = ReceivedPacketTracker::new();
        let now = Instant::now();
        receive_and_ack(&mut tracker, 1..=10, now);
        tracker.received_packet(11, now, false, &rtt()).unwrap();
        assert!(!tracker.ack_queued);
        assert_eq!(tracker.get_alarm_timeout(), None);
        let recv_time = now + Duration::from_millis(10);
        tracker.received_packet(12, recv_time, true, &rtt()).unwrap();
        assert!(!tracker.ack_queued);
        assert_eq!(tracker.get_alarm_timeout(), Some(recv_time + MAX_ACK_DELAY));
    }

    #[test]
    fn closing_reported_gap_queues_immediately() {
        let mut tracker = ReceivedPacketTracker::new();
        let now = Instant::now();
        receive_and_ack(&mut tracker, 1..=10, now);
        tracker.received_packet(11, now, true, &rtt()).unwrap();
        tracker.received_packet(13, now, true, &rtt()).unwrap();
        let ack = tracker.get_ack_frame(now).unwrap(); // 1-11 and 13; 12 missing
        assert!(ack.has_missing_ranges());
        assert!(!tracker.ack_queued);
        // 12 closes the reported gap, even though it isn't ack-eliciting
        tracker.received_packet(12, now, false, &rtt()).unwrap();
        assert!(tracker.ack_queued);
    }

    #[test]
    fn gap_below_ignore_threshold_is_not_missing() {
        let mut tracker = ReceivedPacketTracker::new();
        let now = Instant::now();
        receive_and_ack(&mut tracker, 1..=10, now);
        tracker.received_packet(12, now, true, &rtt()).unwrap();
        tracker.received_packet(13, now, true, &rtt()).unwrap();
        assert!(tracker.get_ack_frame(now).is_some()); // 1-10, 12-13
        tracker.ignore_below(12);
        tracker.received_packet(11, now, false, &rtt()).unwrap();
        assert!(tracker.get_ack_frame(now).is_none());
    }

    #[test]
    fn unreported_gap_close_does_not_queue() {
        let mut tracker = ReceivedPacketTracker::new();
        let now = Instant::now();
        receive_and_ack(&mut tracker, 1..=MIN_RECEIVED_BEFORE_ACK_DECIMATION, now);
        let p = MIN_RECEIVED_BEFORE_ACK_DECIMATION + 1;
        tracker.received_packet(p + 1, now, true, &rtt()).unwrap(); // p missing now
        assert!(!tracker.ack_queued);
        assert!(tracker.get_alarm_timeout().is_some());
        tracker.received_packet(p, now, true, &rtt()).unwrap(); // no longer missing
        assert!(!tracker.ack_queued);
    }

    #[test]
    fn new_missing_range_arms_fast_alarm() {
        let mut tracker = ReceivedPacketTracker::new();
        let now = Instant::now();
        let rtt = rtt_of(80);
        receive_and_ack(&mut tracker, 1..=MIN_RECEIVED_BEFORE_ACK_DECIMATION, now);
        let p = MIN_RECEIVED_BEFORE_ACK_DECIMATION + 1;
        for pn in p..p + 6 {
            tracker.received_packet(pn, now, true, &rtt).unwrap();
        }
        // p+7, p+8, p+9 are now known missing
        tracker.received_packet(p + 10, now, true, &rtt).unwrap();
        assert_eq!(
            tracker.get_alarm_timeout(),
            Some(now + Duration::from_millis(10)) // min_rtt / 8
        );
        let ack = tracker
            .get_ack_frame(now + Duration::from_millis(10))
            .unwrap();
        assert!(ack.has_missing_ranges());
    }

    #[test]
    fn delay_time_measures_since_largest_observed() {
        let mut tracker = ReceivedPacketTracker::new();
        let now = Instant::now();
        tracker.received_packet(1, now, true, &rtt()).unwrap();
        tracker
            .received_packet(2, now - Duration::from_millis(1337), true, &rtt())
            .unwrap();
        // pn 2 arrived "later" logically but carries the older timestamp;
        // largest observed time tracks pn 2
        let ack = tracker.get_ack_frame(now).unwrap();
        assert!(ack.delay_time() >= Duration::from_millis(1337));
        assert!(ack.delay_time() < Duration::from_millis(1387));
    }

    #[test]
    fn packets_below_lower_limit_accepted() {
        let mut tracker = ReceivedPacketTracker::new();
        let now = Instant::now();
        tracker.ignore_below(6);
        tracker.received_packet(2, now, true, &rtt()).unwrap();
        // ...but do not join the history
        tracker.received_packet(10, now, true, &rtt()).unwrap();
        let ack = tracker.get_ack_frame(now).unwrap();
        assert_eq!(ack.largest_acked(), 10);
        assert_eq!(ack.lowest_acked(), 10);
    }

    #[test]
    fn lower_limit_prunes_history() {
        let mut tracker = ReceivedPacketTracker::new();
        let now = Instant::now();
        for pn in 1..=12 {
            tracker.received_packet(pn, now, true, &rtt()).unwrap();
        }
        tracker.ignore_below(7);
        let ack = tracker.get_ack_frame(now).unwrap();
        assert_eq!(ack.largest_acked(), 12);
        assert_eq!(ack.lowest_acked(), 7);
        assert!(!ack.has_missing_ranges());
    }

    #[test]
    fn counters_reset_on_ack() {
        let mut tracker = ReceivedPacketTracker::new();
        let now = Instant::now();
        tracker.received_packet(1, now, true, &rtt()).unwrap();
        tracker.ack_alarm = Some(now - Duration::from_secs(60));
        assert!(tracker.get_ack_frame(now).is_some());
        assert_eq!(tracker.packets_received_since_last_ack, 0);
        assert_eq!(tracker.ack_eliciting_packets_received_since_last_ack, 0);
        assert_eq!(tracker.get_alarm_timeout(), None);
        assert!(!tracker.ack_queued);
    }

    #[test]
    fn no_frame_without_queue_or_expired_alarm() {
        let mut tracker = ReceivedPacketTracker::new();
        let now = Instant::now();
        tracker.received_packet(1, now, true, &rtt()).unwrap();
        tracker.ack_queued = false;
        tracker.ack_alarm = None;
        assert!(tracker.get_ack_frame(now).is_none());
        tracker.ack_alarm = Some(now + Duration::from_secs(60));
        assert!(tracker.get_ack_frame(now).is_none());
        tracker.ack_alarm = Some(now - Duration::from_secs(60));
        assert!(tracker.get_ack_frame(now).is_some());
    }

    #[test]
    fn spaces_track_independently() {
        // One tracker per packet number space; interleaved arrivals across
        // spaces must not contaminate each other's ranges
        let mut initial = ReceivedPacketTracker::new();
        let mut handshake = ReceivedPacketTracker::new();
        let mut data = ReceivedPacketTracker::new();
        let t0 = Instant::now();
        let rtt = rtt();

        initial.received_packet(2, t0, true, &rtt).unwrap();
        handshake.received_packet(1, t0, true, &rtt).unwrap();
        data.received_packet(5, t0, true, &rtt).unwrap();
        initial.received_packet(3, t0, true, &rtt).unwrap();
        handshake.received_packet(2, t0, true, &rtt).unwrap();
        data.received_packet(4, t0, true, &rtt).unwrap();

        let now = t0 + Duration::from_millis(5);
        let ack = initial.get_ack_frame(now).unwrap();
        assert_eq!((ack.lowest_acked(), ack.largest_acked()), (2, 3));
        assert!(!ack.has_missing_ranges());
        let ack = handshake.get_ack_frame(now).unwrap();
        assert_eq!((ack.lowest_acked(), ack.largest_acked()), (1, 2));
        let ack = data.get_ack_frame(now).unwrap();
        assert_eq!((ack.lowest_acked(), ack.largest_acked()), (4, 5));
        assert!(ack.delay_time() >= Duration::from_millis(5));
        assert!(ack.delay_time() < Duration::from_millis(55));
    }

    #[test]
    fn ranges_stay_sorted_and_disjoint() {
        let mut tracker = ReceivedPacketTracker::new();
        let now = Instant::now();
        // Arrival order chosen to force merges, extensions, and gaps
        for pn in [9, 1, 5, 2, 8, 30, 3, 10, 29, 0, 7] {
            tracker.received_packet(pn, now, true, &rtt()).unwrap();
        }
        tracker.ack_queued = true;
        let ack = tracker.get_ack_frame(now).unwrap();
        for window in ack.ranges.windows(2) {
            assert!(window[0].smallest <= window[0].largest);
            assert!(
                window[0].smallest > window[1].largest + 1,
                "ranges must be descending with a strictly positive gap"
            );
        }
        // Every acknowledged number was actually received
        let received = [9, 1, 5, 2, 8, 30, 3, 10, 29, 0, 7];
        for range in &ack.ranges {
            for pn in range.smallest..=range.largest {
                assert!(received.contains(&pn));
            }
        }
    }

    #[test]
    fn range_cap_fails_closed() {
        let mut tracker = ReceivedPacketTracker::new();
        let now = Instant::now();
        let mut result = Ok(());
        for i in 0..5 * MAX_ACK_RANGES as u64 {
            result = tracker.received_packet(2 * i + 1, now, true, &rtt());
            if result.is_err() {
                break;
            }
        }
        let err = result.unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::INTERNAL_ERROR);
    }
}
