//! Congestion control for the sending side of a connection

use std::fmt::Debug;
use std::time::{Duration, Instant};

use crate::recovery::RttEstimator;

mod bbr;
mod bw_estimation;
mod min_max;

pub use bbr::{Bbr, BbrConfig};

/// Summary of one acknowledged packet, for batched congestion events
#[derive(Debug, Copy, Clone)]
pub struct AckedPacket {
    /// Packet number within its space
    pub pn: u64,
    /// Bytes the packet occupied on the wire
    pub bytes: u64,
    /// When the packet was sent
    pub send_time: Instant,
}

/// Summary of one lost packet, for batched congestion events
#[derive(Debug, Copy, Clone)]
pub struct LostPacket {
    /// Packet number within its space
    pub pn: u64,
    /// Bytes the packet occupied on the wire
    pub bytes: u64,
}

/// Common interface for congestion controllers
///
/// Controllers are pure consumers of ack and loss events; they own no
/// timers and must not be shared across connections. A controller that
/// understands batched ack/loss reports additionally exposes
/// [`Controller::congestion_event_handler`]; the sent-packet handler probes
/// for that capability and falls back to the per-packet
/// [`Controller::on_packet_acked`] / [`Controller::on_packet_lost`] calls.
pub trait Controller: Send + Debug {
    /// A packet, ack-eliciting or not, has been put on the wire
    fn on_packet_sent(
        &mut self,
        send_time: Instant,
        bytes_in_flight: u64,
        pn: u64,
        bytes: u64,
        is_ack_eliciting: bool,
    );

    /// One packet was confirmed delivered (fallback API)
    fn on_packet_acked(&mut self, pn: u64, bytes: u64, prior_in_flight: u64, event_time: Instant);

    /// One packet was declared lost (fallback API)
    fn on_packet_lost(&mut self, pn: u64, bytes: u64, prior_in_flight: u64);

    /// Whether another packet may be sent with `bytes_in_flight` outstanding
    fn can_send(&self, bytes_in_flight: u64) -> bool;

    /// Current congestion window in bytes
    fn get_congestion_window(&self) -> u64;

    /// Pacing delay to impose before the next packet leaves
    fn time_until_send(&self, bytes_in_flight: u64) -> Duration;

    /// Give loss-based controllers a chance to leave slow start on an RTT sample
    fn maybe_exit_slow_start(&mut self);

    /// Latest RTT statistics, delivered before ack/loss events are applied
    fn on_rtt_update(&mut self, rtt: &RttEstimator);

    /// Probe for the preferred batched event interface
    fn congestion_event_handler(&mut self) -> Option<&mut dyn CongestionEventHandler> {
        None
    }
}

/// Preferred batched interface: one call per received ACK frame
pub trait CongestionEventHandler {
    /// Report every newly acked and newly lost packet from one ACK
    fn on_congestion_event(
        &mut self,
        prior_in_flight: u64,
        event_time: Instant,
        acked: &[AckedPacket],
        lost: &[LostPacket],
    );
}

pub(crate) const BASE_DATAGRAM_SIZE: u64 = crate::BASE_DATAGRAM_SIZE;
