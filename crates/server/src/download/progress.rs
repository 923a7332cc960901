//! Download speed sampling.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Shortest span a speed sample may cover.
const MIN_WINDOW: Duration = Duration::from_secs(1);

/// Number of samples averaged.
const SAMPLES: usize = 10;

/// Rolling average of byte deltas over windows of at least one second.
#[derive(Debug)]
pub struct SpeedTracker {
    window_start: Instant,
    window_bytes: u64,
    samples: VecDeque<f64>,
}

impl SpeedTracker {
    /// Start tracking from `bytes` already on disk.
    pub fn new(bytes: u64) -> Self {
        Self::starting_at(bytes, Instant::now())
    }

    pub fn starting_at(bytes: u64, now: Instant) -> Self {
        Self {
            window_start: now,
            window_bytes: bytes,
            samples: VecDeque::with_capacity(SAMPLES),
        }
    }

    /// Record the running total at `now` and return the current speed in bytes per second.
    pub fn observe_at(&mut self, total: u64, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed >= MIN_WINDOW {
            let delta = total.saturating_sub(self.window_bytes);
            if self.samples.len() == SAMPLES {
                self.samples.pop_front();
            }
            self.samples.push_back(delta as f64 / elapsed.as_secs_f64());
            self.window_start = now;
            self.window_bytes = total;
        }
        self.speed()
    }

    pub fn observe(&mut self, total: u64) -> u64 {
        self.observe_at(total, Instant::now())
    }

    pub fn speed(&self) -> u64 {
        if self.samples.is_empty() {
            return 0;
        }
        (self.samples.iter().sum::<f64>() / self.samples.len() as f64) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_windows_do_not_produce_samples() {
        let t0 = Instant::now();
        let mut tracker = SpeedTracker::starting_at(0, t0);
        assert_eq!(tracker.observe_at(500, t0 + Duration::from_millis(400)), 0);
        assert_eq!(tracker.observe_at(1000, t0 + Duration::from_secs(1)), 1000);
    }

    #[test]
    fn speed_averages_the_last_ten_samples() {
        let t0 = Instant::now();
        let mut tracker = SpeedTracker::starting_at(0, t0);
        let mut total = 0;
        // Ten slow seconds, then ten fast ones push the slow ones out.
        for i in 1..=10u64 {
            total += 100;
            tracker.observe_at(total, t0 + Duration::from_secs(i));
        }
        assert_eq!(tracker.speed(), 100);
        for i in 11..=20u64 {
            total += 300;
            tracker.observe_at(total, t0 + Duration::from_secs(i));
        }
        assert_eq!(tracker.speed(), 300);
    }
}
