/// Windowed maximum estimator
///
/// Kathleen Nichols' algorithm for tracking the maximum of a data stream
/// over a fixed interval measured in round trips. Keeps the best, 2nd and
/// 3rd best samples with the invariant that the measurement time of the
/// n'th best is >= that of the (n-1)'th; a new overall max resets the
/// later choices since nothing older can matter again.
#[derive(Debug, Default, Copy, Clone)]
pub(super) struct MinMax {
    /// Length of the tracked window, in rounds
    window: u64,
    /// samples[0] holds the maximum; samples[1..] are progressively more
    /// recent, smaller candidates
    samples: [Sample; 3],
}

#[derive(Debug, Default, Copy, Clone)]
struct Sample {
    round: u64,
    value: u64,
}

impl MinMax {
    pub(super) fn new(window: u64) -> Self {
        Self {
            window,
            samples: Default::default(),
        }
    }

    pub(super) fn get(&self) -> u64 {
        self.samples[0].value
    }

    pub(super) fn reset(&mut self) {
        self.samples = Default::default();
    }

    pub(super) fn update_max(&mut self, round: u64, measurement: u64) {
        let sample = Sample {
            round,
            value: measurement,
        };

        if self.samples[0].value == 0 // uninitialized
            || sample.value >= self.samples[0].value // new overall max
            || sample.round.saturating_sub(self.samples[2].round) > self.window
        // nothing else left in the window
        {
            self.samples = [sample; 3];
            return;
        }

        if sample.value >= self.samples[1].value {
            self.samples[1] = sample;
            self.samples[2] = sample;
        } else if sample.value >= self.samples[2].value {
            self.samples[2] = sample;
        }

        // Roll forward samples that have aged out of the window
        if sample.round.saturating_sub(self.samples[0].round) > self.window {
            self.samples[0] = self.samples[1];
            self.samples[1] = self.samples[2];
            self.samples[2] = sample;
            if sample.round.saturating_sub(self.samples[0].round) > self.window {
                self.samples[0] = self.samples[1];
                self.samples[1] = self.samples[2];
            }
        } else if self.samples[1].round == self.samples[0].round
            && sample.round.saturating_sub(self.samples[1].round) > self.window / 4
        {
            // 2nd best hasn't been updated for a quarter window; refresh it
            self.samples[1] = sample;
            self.samples[2] = sample;
        } else if self.samples[2].round == self.samples[1].round
            && sample.round.saturating_sub(self.samples[2].round) > self.window / 2
        {
            self.samples[2] = sample;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_maximum() {
        let mut filter = MinMax::new(10);
        filter.update_max(1, 100);
        assert_eq!(filter.get(), 100);
        filter.update_max(2, 50);
        assert_eq!(filter.get(), 100);
        filter.update_max(3, 200);
        assert_eq!(filter.get(), 200);
    }

    #[test]
    fn old_max_expires() {
        let mut filter = MinMax::new(10);
        filter.update_max(1, 1000);
        for round in 2..30 {
            filter.update_max(round, 10);
        }
        // The early spike is long outside the window
        assert_eq!(filter.get(), 10);
    }

    #[test]
    fn reset_forgets() {
        let mut filter = MinMax::new(10);
        filter.update_max(1, 42);
        filter.reset();
        assert_eq!(filter.get(), 0);
    }
}
