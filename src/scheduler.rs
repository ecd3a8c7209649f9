//! C7: the sample-accurate event clock.
//!
//! Ticks are always 140 Hz; everything else runs at the configured output
//! sample rate. `advance_for_delay` keeps `next_event_sample` exact without
//! ever accumulating floating-point drift, by carrying the division
//! remainder forward exactly as §4.6 specifies.

/// Drives the relationship between 140 Hz MUS ticks and output samples.
/// Owns no event or chip state itself — `Player` asks it "is an event due"
/// and tells it "advance by this many ticks" as it drains the score.
#[derive(Debug, Clone, Copy)]
pub struct Scheduler {
    sample_rate: u32,
    current_sample: u64,
    next_event_sample: u64,
    remainder: u64,
}

/// MUS event clock rate, fixed by the format.
const TICK_RATE_HZ: u64 = 140;

impl Scheduler {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            current_sample: 0,
            next_event_sample: 0,
            remainder: 0,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn current_sample(&self) -> u64 {
        self.current_sample
    }

    /// Resets the clock to the start of playback (fresh `start()`, or a
    /// loop wrap).
    pub fn reset(&mut self) {
        self.current_sample = 0;
        self.next_event_sample = 0;
        self.remainder = 0;
    }

    /// Whether at least one event is due to be processed at the current
    /// sample index.
    pub fn event_due(&self) -> bool {
        self.current_sample >= self.next_event_sample
    }

    /// Advances `next_event_sample` by `delay_ticks` worth of time at the
    /// configured sample rate, carrying the exact remainder of the
    /// division forward so no fractional tick is ever lost or double
    /// counted (§8 property 3).
    pub fn advance_for_delay(&mut self, delay_ticks: u32) {
        let total = self.remainder + delay_ticks as u64 * self.sample_rate as u64;
        self.next_event_sample += total / TICK_RATE_HZ;
        self.remainder = total % TICK_RATE_HZ;
    }

    /// Advances the output sample clock by one frame.
    pub fn tick_sample(&mut self) {
        self.current_sample += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_with_event_due_immediately() {
        let sched = Scheduler::new(44100);
        assert!(sched.event_due());
    }

    #[test]
    fn advance_for_delay_is_drift_free_over_many_ticks() {
        let rate = 44100u64;
        let mut sched = Scheduler::new(rate as u32);
        let delays = [1u32, 7, 13, 1, 140, 200, 3, 99, 1000, 1];
        let mut expected_total: u64 = 0;
        for &d in &delays {
            sched.advance_for_delay(d);
            expected_total += d as u64 * rate;
            let expected = expected_total / TICK_RATE_HZ;
            assert_eq!(sched.next_event_sample_for_test(), expected);
        }
    }

    #[test]
    fn reset_zeros_everything() {
        let mut sched = Scheduler::new(44100);
        sched.advance_for_delay(50);
        sched.tick_sample();
        sched.reset();
        assert_eq!(sched.current_sample(), 0);
        assert!(sched.event_due());
    }

    impl Scheduler {
        fn next_event_sample_for_test(&self) -> u64 {
            self.next_event_sample
        }
    }
}
