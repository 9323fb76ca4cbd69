use std::time::{Duration, Instant};

use rand::Rng;

use crate::recovery::RttEstimator;

use super::bw_estimation::BandwidthEstimation;
use super::min_max::MinMax;
use super::{AckedPacket, CongestionEventHandler, Controller, LostPacket, BASE_DATAGRAM_SIZE};

/// BBR congestion control
///
/// A model-based controller: the operating point is estimated bottleneck
/// bandwidth times minimum round-trip time rather than a loss signal.
/// Based on google's quiche implementation
/// <https://source.chromium.org/chromium/chromium/src/+/master:net/third_party/quiche/src/quic/core/congestion_control/bbr_sender.cc>
/// of BBR <https://datatracker.ietf.org/doc/html/draft-cardwell-iccrg-bbr-congestion-control>.
#[derive(Debug, Clone)]
pub struct Bbr {
    config: BbrConfig,
    current_mtu: u64,
    max_bandwidth: BandwidthEstimation,
    acked_bytes: u64,
    mode: Mode,
    loss_state: LossState,
    recovery_state: RecoveryState,
    recovery_window: u64,
    is_at_full_bandwidth: bool,
    pacing_gain: f32,
    high_gain: f32,
    drain_gain: f32,
    cwnd_gain: f32,
    high_cwnd_gain: f32,
    last_cycle_start: Option<Instant>,
    current_cycle_offset: u8,
    init_cwnd: u64,
    min_cwnd: u64,
    prev_in_flight_count: u64,
    exit_probe_rtt_at: Option<Instant>,
    probe_rtt_last_started_at: Option<Instant>,
    min_rtt: Duration,
    rtt_min_sample: Duration,
    pacing_rate: u64,
    max_acked_packet_number: u64,
    max_sent_packet_number: u64,
    end_recovery_at_packet_number: u64,
    cwnd: u64,
    current_round_trip_end_packet_number: u64,
    round_count: u64,
    bw_at_last_round: u64,
    round_wo_bw_gain: u64,
    ack_aggregation: AckAggregationState,
}

impl Bbr {
    /// Construct a state using the given `config` and packet size
    pub fn new(config: BbrConfig, current_mtu: u16) -> Self {
        let initial_window = config.initial_window;
        let min_cwnd = calculate_min_window(current_mtu as u64);
        Self {
            config,
            current_mtu: current_mtu as u64,
            max_bandwidth: BandwidthEstimation::default(),
            acked_bytes: 0,
            mode: Mode::Startup,
            loss_state: Default::default(),
            recovery_state: RecoveryState::NotInRecovery,
            recovery_window: 0,
            is_at_full_bandwidth: false,
            pacing_gain: K_DEFAULT_HIGH_GAIN,
            high_gain: K_DEFAULT_HIGH_GAIN,
            drain_gain: 1.0 / K_DEFAULT_HIGH_GAIN,
            cwnd_gain: K_DEFAULT_HIGH_GAIN,
            high_cwnd_gain: K_DEFAULT_HIGH_GAIN,
            last_cycle_start: None,
            current_cycle_offset: 0,
            init_cwnd: initial_window.max(min_cwnd),
            min_cwnd,
            prev_in_flight_count: 0,
            exit_probe_rtt_at: None,
            probe_rtt_last_started_at: None,
            min_rtt: Duration::ZERO,
            rtt_min_sample: Duration::ZERO,
            pacing_rate: 0,
            max_acked_packet_number: 0,
            max_sent_packet_number: 0,
            end_recovery_at_packet_number: 0,
            cwnd: initial_window.max(min_cwnd),
            current_round_trip_end_packet_number: 0,
            round_count: 0,
            bw_at_last_round: 0,
            round_wo_bw_gain: 0,
            ack_aggregation: AckAggregationState::default(),
        }
    }

    fn enter_startup_mode(&mut self) {
        self.mode = Mode::Startup;
        self.pacing_gain = self.high_gain;
        self.cwnd_gain = self.high_cwnd_gain;
    }

    fn enter_probe_bandwidth_mode(&mut self, now: Instant) {
        self.mode = Mode::ProbeBw;
        self.cwnd_gain = K_DERIVED_HIGH_CWNDGAIN;
        self.last_cycle_start = Some(now);
        // Pick a random offset for the gain cycle out of {0, 2..7}; 1 is
        // excluded so an increased gain is always followed by a drain.
        let mut rand_index = rand::rng().random_range(0..K_PACING_GAIN.len() as u8 - 1);
        if rand_index >= 1 {
            rand_index += 1;
        }
        self.current_cycle_offset = rand_index;
        self.pacing_gain = K_PACING_GAIN[rand_index as usize];
    }

    fn update_recovery_state(&mut self, is_round_start: bool) {
        // Exit recovery when there have been no losses for a round.
        if self.loss_state.has_losses() {
            self.end_recovery_at_packet_number = self.max_sent_packet_number;
        }
        match self.recovery_state {
            // Enter conservation on the first loss.
            RecoveryState::NotInRecovery if self.loss_state.has_losses() => {
                self.recovery_state = RecoveryState::Conservation;
                // `recovery_window` is set in calculate_recovery_window().
                self.recovery_window = 0;
                // Conservation lasts a whole round; extend the current round
                // as if it started right now.
                self.current_round_trip_end_packet_number = self.max_sent_packet_number;
            }
            RecoveryState::Growth | RecoveryState::Conservation => {
                if self.recovery_state == RecoveryState::Conservation && is_round_start {
                    self.recovery_state = RecoveryState::Growth;
                }
                if !self.loss_state.has_losses()
                    && self.max_acked_packet_number > self.end_recovery_at_packet_number
                {
                    self.recovery_state = RecoveryState::NotInRecovery;
                }
            }
            _ => {}
        }
    }

    fn update_gain_cycle_phase(&mut self, now: Instant, in_flight: u64) {
        // In most cases the cycle advances after an RTT passes.
        let mut should_advance_gain_cycling = self
            .last_cycle_start
            .map(|last_cycle_start| now.duration_since(last_cycle_start) > self.min_rtt)
            .unwrap_or(false);

        // With pacing gain above 1.0 the connection is probing, trying to
        // put at least pacing_gain * BDP in flight. Hold the phase until
        // that target is actually reached, unless losses say the buffers
        // can't hold it.
        if self.pacing_gain > 1.0
            && !self.loss_state.has_losses()
            && self.prev_in_flight_count < self.get_target_cwnd(self.pacing_gain)
        {
            should_advance_gain_cycling = false;
        }

        // With pacing gain below 1.0 the connection is draining the queue
        // incurred by the probe; once in-flight falls to the estimated BDP
        // the drain is done and the phase can end early.
        if self.pacing_gain < 1.0 && in_flight <= self.get_target_cwnd(1.0) {
            should_advance_gain_cycling = true;
        }

        if should_advance_gain_cycling {
            self.current_cycle_offset =
                (self.current_cycle_offset + 1) % K_PACING_GAIN.len() as u8;
            self.last_cycle_start = Some(now);
            // Stay in low gain until the target BDP is hit.
            if self.pacing_gain < 1.0
                && (K_PACING_GAIN[self.current_cycle_offset as usize] - 1.0).abs() < f32::EPSILON
                && in_flight > self.get_target_cwnd(1.0)
            {
                return;
            }
            self.pacing_gain = K_PACING_GAIN[self.current_cycle_offset as usize];
        }
    }

    fn maybe_exit_startup_or_drain(&mut self, now: Instant, in_flight: u64) {
        if self.mode == Mode::Startup && self.is_at_full_bandwidth {
            self.mode = Mode::Drain;
            self.pacing_gain = self.drain_gain;
            self.cwnd_gain = self.high_cwnd_gain;
        }
        if self.mode == Mode::Drain && in_flight <= self.get_target_cwnd(1.0) {
            self.enter_probe_bandwidth_mode(now);
        }
    }

    fn is_min_rtt_expired(&self, now: Instant, app_limited: bool) -> bool {
        !app_limited
            && self
                .probe_rtt_last_started_at
                .map(|last| now.saturating_duration_since(last) > K_MIN_RTT_EXPIRY)
                .unwrap_or(true)
    }

    fn maybe_enter_or_exit_probe_rtt(
        &mut self,
        now: Instant,
        is_round_start: bool,
        bytes_in_flight: u64,
        app_limited: bool,
    ) {
        let min_rtt_expired = self.is_min_rtt_expired(now, app_limited);
        if min_rtt_expired && self.mode != Mode::ProbeRtt {
            self.mode = Mode::ProbeRtt;
            self.pacing_gain = 1.0;
            // The exit time isn't decided until bytes_in_flight has reached
            // the target small value.
            self.exit_probe_rtt_at = None;
            self.probe_rtt_last_started_at = Some(now);
        }

        if self.mode == Mode::ProbeRtt {
            match self.exit_probe_rtt_at {
                None => {
                    // Schedule the exit once the window has drained to the
                    // ProbeRtt size, allowing an extra packet since the
                    // window is checked before sending.
                    if bytes_in_flight < self.get_probe_rtt_cwnd() + self.current_mtu {
                        self.exit_probe_rtt_at = Some(now + K_PROBE_RTT_TIME.max(self.min_rtt));
                    }
                }
                Some(exit_at) => {
                    if is_round_start && now >= exit_at {
                        if !self.is_at_full_bandwidth {
                            self.enter_startup_mode();
                        } else {
                            self.enter_probe_bandwidth_mode(now);
                        }
                    }
                }
            }
        }
    }

    fn update_min_rtt(&mut self, now: Instant, app_limited: bool) {
        if self.rtt_min_sample == Duration::ZERO {
            return;
        }
        if self.min_rtt == Duration::ZERO
            || self.is_min_rtt_expired(now, app_limited)
            || self.rtt_min_sample < self.min_rtt
        {
            self.min_rtt = self.rtt_min_sample;
        }
    }

    fn get_target_cwnd(&self, gain: f32) -> u64 {
        let bw = self.max_bandwidth.get_estimate();
        let bdp = self.min_rtt.as_micros() as u64 * bw;
        let cwnd = ((gain as f64 * bdp as f64) / 1_000_000f64) as u64;
        // The BDP estimate is zero until bandwidth samples arrive.
        if cwnd == 0 {
            return self.init_cwnd;
        }
        cwnd.max(self.min_cwnd)
    }

    fn get_probe_rtt_cwnd(&self) -> u64 {
        self.get_target_cwnd(K_MODERATE_PROBE_RTT_MULTIPLIER)
    }

    fn calculate_pacing_rate(&mut self) {
        let bw = self.max_bandwidth.get_estimate();
        if bw == 0 {
            return;
        }
        let target_rate = (bw as f64 * self.pacing_gain as f64) as u64;
        if self.is_at_full_bandwidth {
            self.pacing_rate = target_rate;
            return;
        }

        // Pace at initial_window / RTT as soon as RTT measurements exist.
        if self.pacing_rate == 0 && self.min_rtt != Duration::ZERO {
            self.pacing_rate =
                BandwidthEstimation::bw_from_delta(self.init_cwnd, self.min_rtt).unwrap();
            return;
        }

        // Never decrease the pacing rate during startup.
        if self.pacing_rate < target_rate {
            self.pacing_rate = target_rate;
        }
    }

    fn calculate_cwnd(&mut self, bytes_acked: u64, excess_acked: u64) {
        if self.mode == Mode::ProbeRtt {
            return;
        }
        let mut target_window = self.get_target_cwnd(self.cwnd_gain);
        if self.is_at_full_bandwidth {
            // Add the max recently measured ack aggregation to the window.
            target_window += self.ack_aggregation.max_ack_height.get();
        } else {
            // Add the most recent excess acked. The window never decreases
            // in STARTUP, which makes this a very localized max filter.
            target_window += excess_acked;
        }
        // Grow towards the target by at most bytes_acked per event.
        if self.is_at_full_bandwidth {
            self.cwnd = target_window.min(self.cwnd + bytes_acked);
        } else if self.cwnd < target_window || self.acked_bytes < self.init_cwnd {
            // Still in startup; the window only grows.
            self.cwnd += bytes_acked;
        }
        self.cwnd = self.cwnd.max(self.min_cwnd);
    }

    fn calculate_recovery_window(&mut self, bytes_acked: u64, bytes_lost: u64, in_flight: u64) {
        if !self.recovery_state.in_recovery() {
            return;
        }
        if self.recovery_window == 0 {
            self.recovery_window = self.min_cwnd.max(in_flight + bytes_acked);
            return;
        }

        self.recovery_window = if self.recovery_window >= bytes_lost {
            self.recovery_window - bytes_lost
        } else {
            self.current_mtu
        };
        // In CONSERVATION just subtracting losses suffices; GROWTH releases
        // an additional bytes_acked for slow-start-like behavior.
        if self.recovery_state == RecoveryState::Growth {
            self.recovery_window += bytes_acked;
        }

        self.recovery_window = self
            .recovery_window
            .max(in_flight + bytes_acked)
            .max(self.min_cwnd);
    }

    /// <https://datatracker.ietf.org/doc/html/draft-cardwell-iccrg-bbr-congestion-control#section-4.3.2.2>
    fn check_if_full_bw_reached(&mut self, app_limited: bool) {
        if app_limited {
            return;
        }
        let target = (self.bw_at_last_round as f64 * f64::from(K_STARTUP_GROWTH_TARGET)) as u64;
        let bw = self.max_bandwidth.get_estimate();
        if bw >= target {
            self.bw_at_last_round = bw;
            self.round_wo_bw_gain = 0;
            self.ack_aggregation.max_ack_height.reset();
            return;
        }

        self.round_wo_bw_gain += 1;
        if self.round_wo_bw_gain >= u64::from(K_ROUND_TRIPS_WITHOUT_GROWTH_BEFORE_EXITING_STARTUP)
            || self.recovery_state.in_recovery()
        {
            self.is_at_full_bandwidth = true;
        }
    }
}

impl Controller for Bbr {
    fn on_packet_sent(
        &mut self,
        send_time: Instant,
        _bytes_in_flight: u64,
        pn: u64,
        bytes: u64,
        is_ack_eliciting: bool,
    ) {
        self.max_sent_packet_number = pn;
        if is_ack_eliciting {
            self.max_bandwidth.on_sent(send_time, bytes);
        }
    }

    fn on_packet_acked(&mut self, pn: u64, bytes: u64, prior_in_flight: u64, event_time: Instant) {
        let acked = [AckedPacket {
            pn,
            bytes,
            send_time: event_time,
        }];
        self.on_congestion_event(prior_in_flight, event_time, &acked, &[]);
    }

    fn on_packet_lost(&mut self, _pn: u64, bytes: u64, _prior_in_flight: u64) {
        self.loss_state.lost_bytes += bytes;
    }

    fn can_send(&self, bytes_in_flight: u64) -> bool {
        bytes_in_flight < self.get_congestion_window()
    }

    fn get_congestion_window(&self) -> u64 {
        if self.mode == Mode::ProbeRtt {
            return self.get_probe_rtt_cwnd();
        } else if self.recovery_state.in_recovery() && self.mode != Mode::Startup {
            return self.cwnd.min(self.recovery_window);
        }
        self.cwnd
    }

    fn time_until_send(&self, bytes_in_flight: u64) -> Duration {
        if bytes_in_flight == 0 || self.pacing_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.current_mtu * 1_000_000_000 / self.pacing_rate)
    }

    fn maybe_exit_slow_start(&mut self) {
        // Startup exit is driven by the bandwidth plateau check instead of
        // an RTT threshold.
    }

    fn on_rtt_update(&mut self, rtt: &RttEstimator) {
        self.rtt_min_sample = rtt.min();
    }

    fn congestion_event_handler(&mut self) -> Option<&mut dyn CongestionEventHandler> {
        Some(self)
    }
}

impl CongestionEventHandler for Bbr {
    fn on_congestion_event(
        &mut self,
        prior_in_flight: u64,
        event_time: Instant,
        acked: &[AckedPacket],
        lost: &[LostPacket],
    ) {
        // Samples taken while in-flight never filled the window understate
        // the available bandwidth.
        let app_limited = prior_in_flight < self.cwnd;

        for p in lost {
            self.loss_state.lost_bytes += p.bytes;
        }
        for p in acked {
            self.max_bandwidth
                .on_ack(event_time, p.bytes, self.round_count, app_limited);
            self.acked_bytes += p.bytes;
        }
        self.update_min_rtt(event_time, app_limited);

        let bytes_acked = self.max_bandwidth.bytes_acked_this_window();
        let bytes_lost = self.loss_state.lost_bytes;
        let in_flight = prior_in_flight
            .saturating_sub(bytes_acked)
            .saturating_sub(bytes_lost);
        let excess_acked = self.ack_aggregation.update_ack_aggregation_bytes(
            bytes_acked,
            event_time,
            self.round_count,
            self.max_bandwidth.get_estimate(),
        );
        self.max_bandwidth.end_acks();
        if let Some(largest) = acked.iter().map(|p| p.pn).max() {
            self.max_acked_packet_number = self.max_acked_packet_number.max(largest);
        }

        let mut is_round_start = false;
        if bytes_acked > 0 {
            is_round_start =
                self.max_acked_packet_number > self.current_round_trip_end_packet_number;
            if is_round_start {
                self.current_round_trip_end_packet_number = self.max_sent_packet_number;
                self.round_count += 1;
            }
        }

        self.update_recovery_state(is_round_start);

        if self.mode == Mode::ProbeBw {
            self.update_gain_cycle_phase(event_time, in_flight);
        }

        if is_round_start && !self.is_at_full_bandwidth {
            self.check_if_full_bw_reached(app_limited);
        }

        self.maybe_exit_startup_or_drain(event_time, in_flight);

        self.maybe_enter_or_exit_probe_rtt(event_time, is_round_start, in_flight, app_limited);

        // With the model updated, recalculate the pacing rate and window.
        self.calculate_pacing_rate();
        self.calculate_cwnd(bytes_acked, excess_acked);
        self.calculate_recovery_window(bytes_acked, bytes_lost, in_flight);

        self.prev_in_flight_count = in_flight;
        self.loss_state.reset();
    }
}

/// Configuration for the [`Bbr`] congestion controller
#[derive(Debug, Clone)]
pub struct BbrConfig {
    initial_window: u64,
}

impl BbrConfig {
    /// Initial limit on outstanding data, in bytes
    pub fn initial_window(&mut self, value: u64) -> &mut Self {
        self.initial_window = value;
        self
    }
}

impl Default for BbrConfig {
    fn default() -> Self {
        Self {
            initial_window: K_INITIAL_CONGESTION_WINDOW_PACKETS * BASE_DATAGRAM_SIZE,
        }
    }
}

#[derive(Debug, Default, Copy, Clone)]
struct AckAggregationState {
    max_ack_height: MinMax,
    aggregation_epoch_start_time: Option<Instant>,
    aggregation_epoch_bytes: u64,
}

impl AckAggregationState {
    fn update_ack_aggregation_bytes(
        &mut self,
        newly_acked_bytes: u64,
        now: Instant,
        round: u64,
        max_bandwidth: u64,
    ) -> u64 {
        // Bytes expected to have been delivered at max bandwidth since the
        // epoch started.
        let expected_bytes_acked = max_bandwidth
            * now
                .saturating_duration_since(self.aggregation_epoch_start_time.unwrap_or(now))
                .as_micros() as u64
            / 1_000_000;

        // Start a new epoch as soon as the arrival rate falls to or below
        // max bandwidth.
        if self.aggregation_epoch_bytes <= expected_bytes_acked {
            self.aggregation_epoch_bytes = newly_acked_bytes;
            self.aggregation_epoch_start_time = Some(now);
            return 0;
        }

        // Excess delivered over max bandwidth, including the bytes just
        // acked to account for stretch acks.
        self.aggregation_epoch_bytes += newly_acked_bytes;
        let diff = self.aggregation_epoch_bytes - expected_bytes_acked;
        self.max_ack_height.update_max(round, diff);
        diff
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Mode {
    /// Ramp up quickly to find the available bandwidth.
    Startup,
    /// Lower the pacing rate to drain the queue built during startup.
    Drain,
    /// Cruise, cycling the pacing gain to periodically probe for more.
    ProbeBw,
    /// Briefly slow down to empty the buffer and re-measure min RTT.
    ProbeRtt,
}

/// How congestion control limits bytes in flight after loss
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum RecoveryState {
    NotInRecovery,
    /// One extra outstanding byte allowed per byte acknowledged.
    Conservation,
    /// Two extra outstanding bytes allowed per byte acknowledged.
    Growth,
}

impl RecoveryState {
    fn in_recovery(&self) -> bool {
        !matches!(self, Self::NotInRecovery)
    }
}

#[derive(Debug, Clone, Default)]
struct LossState {
    lost_bytes: u64,
}

impl LossState {
    fn reset(&mut self) {
        self.lost_bytes = 0;
    }

    fn has_losses(&self) -> bool {
        self.lost_bytes != 0
    }
}

fn calculate_min_window(current_mtu: u64) -> u64 {
    4 * current_mtu
}

// The gain used for STARTUP, equal to 2/ln(2).
const K_DEFAULT_HIGH_GAIN: f32 = 2.885;
// The derived CWND gain for STARTUP.
const K_DERIVED_HIGH_CWNDGAIN: f32 = 2.0;
// The cycle of gains used during the ProbeBw stage.
const K_PACING_GAIN: [f32; 8] = [1.25, 0.75, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0];

const K_STARTUP_GROWTH_TARGET: f32 = 1.25;
const K_ROUND_TRIPS_WITHOUT_GROWTH_BEFORE_EXITING_STARTUP: u8 = 3;

const K_INITIAL_CONGESTION_WINDOW_PACKETS: u64 = 32;

const K_MODERATE_PROBE_RTT_MULTIPLIER: f32 = 0.75;
const K_PROBE_RTT_TIME: Duration = Duration::from_millis(200);
const K_MIN_RTT_EXPIRY: Duration = Duration::from_secs(10);

#[cfg(test)]
mod tests {
    use super::*;

    fn acked(pn: u64, bytes: u64, t: Instant) -> AckedPacket {
        AckedPacket {
            pn,
            bytes,
            send_time: t,
        }
    }

    fn rtt_with_sample(ms: u64) -> RttEstimator {
        let mut rtt = RttEstimator::new(Duration::from_millis(ms));
        rtt.update(Duration::ZERO, Duration::from_millis(ms));
        rtt
    }

    #[test]
    fn starts_in_startup_with_initial_window() {
        let bbr = Bbr::new(BbrConfig::default(), 1200);
        assert_eq!(bbr.mode, Mode::Startup);
        assert_eq!(bbr.get_congestion_window(), 32 * 1200);
        assert!(bbr.can_send(0));
        assert!(!bbr.can_send(32 * 1200));
    }

    #[test]
    fn window_grows_on_acks_in_startup() {
        let mut bbr = Bbr::new(BbrConfig::default(), 1200);
        bbr.on_rtt_update(&rtt_with_sample(50));
        let start = Instant::now();
        let before = bbr.get_congestion_window();
        let mut t = start;
        for pn in 0..40u64 {
            t += Duration::from_millis(1);
            bbr.on_packet_sent(t, (pn + 1) * 1200, pn, 1200, true);
        }
        let evt = t + Duration::from_millis(50);
        let batch: Vec<_> = (0..40u64).map(|pn| acked(pn, 1200, t)).collect();
        bbr.on_congestion_event(40 * 1200, evt, &batch, &[]);
        assert!(bbr.get_congestion_window() > before);
    }

    #[test]
    fn loss_enters_recovery() {
        let mut bbr = Bbr::new(BbrConfig::default(), 1200);
        bbr.on_rtt_update(&rtt_with_sample(50));
        let t = Instant::now();
        bbr.on_packet_sent(t, 1200, 0, 1200, true);
        bbr.on_packet_sent(t, 2400, 1, 1200, true);
        bbr.on_congestion_event(
            2400,
            t + Duration::from_millis(60),
            &[acked(1, 1200, t)],
            &[LostPacket { pn: 0, bytes: 1200 }],
        );
        assert!(bbr.recovery_state.in_recovery());
    }

    #[test]
    fn batched_capability_is_exposed() {
        let mut bbr = Bbr::new(BbrConfig::default(), 1200);
        assert!(bbr.congestion_event_handler().is_some());
    }

    #[test]
    fn pacing_delay_after_estimate() {
        let mut bbr = Bbr::new(BbrConfig::default(), 1200);
        assert_eq!(bbr.time_until_send(1200), Duration::ZERO);
        bbr.pacing_rate = 1_200_000; // 1.2 MB/s
        assert_eq!(bbr.time_until_send(0), Duration::ZERO);
        assert_eq!(bbr.time_until_send(1200), Duration::from_millis(1));
    }
}
