use rand::Rng;

use crate::frame::Ack;

/// Average distance between deliberately skipped packet numbers
pub(crate) const SKIP_PACKET_AVERAGE_PERIOD: u64 = 500;

/// Skipped packet numbers remembered for optimistic-ACK detection
const MAX_SKIP_HISTORY: usize = 16;

/// Produces monotonic, unique packet numbers with occasional deliberate
/// skips
///
/// A peer acknowledging a skipped number proves it is acking packets it
/// never received (an optimistic-ACK attack), which [`Self::validate`]
/// detects.
#[derive(Debug)]
pub(crate) struct PacketNumberGenerator {
    average_period: u64,
    next: u64,
    next_to_skip: u64,
    skipped: Vec<u64>,
}

impl PacketNumberGenerator {
    pub(crate) fn new(initial: u64, average_period: u64) -> Self {
        let mut generator = Self {
            average_period,
            next: initial,
            next_to_skip: 0,
            skipped: Vec::new(),
        };
        generator.generate_new_skip();
        generator
    }

    /// The packet number the next call to [`Self::pop`] will return
    pub(crate) fn peek(&self) -> u64 {
        self.next
    }

    pub(crate) fn pop(&mut self) -> u64 {
        let number = self.next;
        self.next += 1;
        if self.next == self.next_to_skip {
            if self.skipped.len() == MAX_SKIP_HISTORY {
                self.skipped.remove(0);
            }
            self.skipped.push(self.next);
            self.next += 1;
            self.generate_new_skip();
        }
        number
    }

    /// Check that an ACK doesn't report any skipped packet number as received
    pub(crate) fn validate(&self, ack: &Ack) -> bool {
        !self.skipped.iter().any(|&pn| ack.acks_packet(pn))
    }

    fn generate_new_skip(&mut self) {
        // Skips are spaced randomly in [period/2, 3*period/2] so their
        // positions can't be predicted.
        let skip = rand::rng().random_range(self.average_period / 2..=self.average_period * 3 / 2);
        self.next_to_skip = self.next + skip.max(1);
    }
}
