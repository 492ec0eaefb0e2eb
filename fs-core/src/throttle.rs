//! Self-throttling for background runs
//!
//! One in every `sample_every` transfers is timed. The sample is clamped,
//! folded into a smoothed average, and the caller sleeps for that average.
//! Throttling changes latency only, never ordering.

use std::thread;
use std::time::{Duration, Instant};

use crate::config::ThrottleConfig;

#[derive(Debug)]
pub struct Throttle {
    config: ThrottleConfig,
    enabled: bool,
    ops: u64,
    avg_us: u64,
    slept: Duration,
}

impl Throttle {
    pub fn new(config: ThrottleConfig, enabled: bool) -> Self {
        Self {
            config,
            enabled,
            ops: 0,
            avg_us: 0,
            slept: Duration::ZERO,
        }
    }

    /// A throttle that never sleeps
    pub fn disabled() -> Self {
        Self::new(ThrottleConfig::default(), false)
    }

    /// Start timing a transfer. Returns `None` when this transfer is not
    /// sampled.
    pub fn start(&mut self) -> Option<Instant> {
        if !self.enabled {
            return None;
        }
        self.ops += 1;
        if self.ops % self.config.sample_every.max(1) as u64 == 0 {
            Some(Instant::now())
        } else {
            None
        }
    }

    /// Finish a transfer started with [`Throttle::start`]
    pub fn finish(&mut self, started: Option<Instant>) {
        let Some(started) = started else {
            return;
        };
        let delay = self.record(started.elapsed());
        if !delay.is_zero() {
            thread::sleep(delay);
            self.slept += delay;
        }
    }

    /// Fold one sample into the average and return the delay to apply
    fn record(&mut self, elapsed: Duration) -> Duration {
        let sample = (elapsed.as_micros() as u64)
            .clamp(self.config.min_delay_us, self.config.max_delay_us);
        self.avg_us = (self.avg_us * 7 + sample) / 8;
        Duration::from_micros(self.avg_us)
    }

    /// Current smoothed response time
    pub fn average(&self) -> Duration {
        Duration::from_micros(self.avg_us)
    }

    /// Total time spent sleeping
    pub fn slept(&self) -> Duration {
        self.slept
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_never_samples() {
        let mut t = Throttle::disabled();
        for _ in 0..100 {
            assert!(t.start().is_none());
        }
        assert_eq!(t.slept(), Duration::ZERO);
    }

    #[test]
    fn test_sampling_interval() {
        let mut t = Throttle::new(ThrottleConfig::default(), true);
        let sampled = (0..64).filter(|_| t.start().is_some()).count();
        assert_eq!(sampled, 4);
    }

    #[test]
    fn test_smoothed_average() {
        let mut t = Throttle::new(ThrottleConfig::default(), true);
        // Clamped up to the floor
        assert_eq!(t.record(Duration::from_micros(1)), Duration::from_micros(8));
        for _ in 0..200 {
            t.record(Duration::from_micros(800));
        }
        let avg = t.average().as_micros();
        assert!(avg > 700 && avg <= 800, "average {}", avg);
        // Clamped down to the ceiling
        t.record(Duration::from_secs(60));
        assert!(t.average() < Duration::from_secs(1));
    }
}
