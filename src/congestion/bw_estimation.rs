use std::fmt::{self, Display, Formatter};
use std::time::{Duration, Instant};

use super::min_max::MinMax;

/// Number of round trips the bandwidth filter looks back over
const BANDWIDTH_WINDOW: u64 = 10;

/// Estimates delivered bytes per second from send/ack timing
///
/// Bandwidth is sampled as the minimum of the instantaneous send rate and
/// ack arrival rate and fed through a windowed max filter, so the estimate
/// tracks the fastest the path has recently proven itself to be.
#[derive(Clone, Debug)]
pub(super) struct BandwidthEstimation {
    total_acked: u64,
    prev_total_acked: u64,
    acked_time: Option<Instant>,
    prev_acked_time: Option<Instant>,
    total_sent: u64,
    prev_total_sent: u64,
    sent_time: Option<Instant>,
    prev_sent_time: Option<Instant>,
    max_filter: MinMax,
    acked_at_last_window: u64,
}

impl Default for BandwidthEstimation {
    fn default() -> Self {
        Self {
            total_acked: 0,
            prev_total_acked: 0,
            acked_time: None,
            prev_acked_time: None,
            total_sent: 0,
            prev_total_sent: 0,
            sent_time: None,
            prev_sent_time: None,
            max_filter: MinMax::new(BANDWIDTH_WINDOW),
            acked_at_last_window: 0,
        }
    }
}

impl BandwidthEstimation {
    pub(super) fn on_sent(&mut self, now: Instant, bytes: u64) {
        self.prev_total_sent = self.total_sent;
        self.total_sent += bytes;
        self.prev_sent_time = self.sent_time;
        self.sent_time = Some(now);
    }

    pub(super) fn on_ack(&mut self, now: Instant, bytes: u64, round: u64, app_limited: bool) {
        self.prev_total_acked = self.total_acked;
        self.total_acked += bytes;
        self.prev_acked_time = self.acked_time;
        self.acked_time = Some(now);

        let (sent_time, prev_sent_time) = match (self.sent_time, self.prev_sent_time) {
            (Some(s), Some(p)) => (s, p),
            _ => return,
        };

        let send_rate = if sent_time > prev_sent_time {
            Self::bw_from_delta(
                self.total_sent - self.prev_total_sent,
                sent_time - prev_sent_time,
            )
            .unwrap_or(0)
        } else {
            // Sampling faster than we send; rely on the ack rate alone
            u64::MAX
        };

        let ack_rate = match self.prev_acked_time {
            Some(prev_acked_time) => Self::bw_from_delta(
                self.total_acked - self.prev_total_acked,
                now - prev_acked_time,
            )
            .unwrap_or(0),
            None => 0,
        };

        let bandwidth = send_rate.min(ack_rate);
        if !app_limited && self.max_filter.get() < bandwidth {
            self.max_filter.update_max(round, bandwidth);
        }
    }

    pub(super) fn bytes_acked_this_window(&self) -> u64 {
        self.total_acked - self.acked_at_last_window
    }

    pub(super) fn end_acks(&mut self) {
        self.acked_at_last_window = self.total_acked;
    }

    /// Estimated bottleneck bandwidth in bytes per second
    pub(super) fn get_estimate(&self) -> u64 {
        self.max_filter.get()
    }

    pub(super) const fn bw_from_delta(bytes: u64, delta: Duration) -> Option<u64> {
        let window_duration_ns = delta.as_nanos();
        if window_duration_ns == 0 {
            return None;
        }
        let b_ns = bytes * 1_000_000_000;
        Some(b_ns / (window_duration_ns as u64))
    }
}

impl Display for BandwidthEstimation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.3} MB/s",
            self.get_estimate() as f32 / (1024 * 1024) as f32
        )
    }
}
