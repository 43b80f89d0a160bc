//! A small byte-rate counter feeding the pipeline-size heuristic.

use std::time::{Duration, Instant};

/// The shortest interval over which a rate sample is considered meaningful.
/// Below this, elapsed time is too noisy (scheduler jitter, clock
/// resolution) to produce a stable rate, so the previous rate is kept.
const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(50);

/// Tracks bytes transferred since the last tick and converts them into a
/// KiB/s rate, used to size a peer's request pipeline.
#[derive(Clone, Debug)]
pub(crate) struct ThroughputCounter {
    bytes_this_round: u64,
    last_tick: Instant,
    rate: f64,
}

impl ThroughputCounter {
    pub fn new() -> Self {
        Self {
            bytes_this_round: 0,
            last_tick: Instant::now(),
            rate: 0.0,
        }
    }

    /// Records that `n` additional bytes were transferred since the last
    /// tick.
    pub fn update(&mut self, n: u64) {
        self.bytes_this_round += n;
    }

    /// Folds the bytes accumulated since the last tick into the rate, unless
    /// not enough time has passed to produce a stable sample, in which case
    /// the previous rate is returned unchanged and the accumulated bytes
    /// carry over to the next tick.
    ///
    /// Returns the updated rate, in KiB/s.
    pub fn tick(&mut self) -> f64 {
        let now = Instant::now();
        let dt = now.duration_since(self.last_tick);
        if dt < MIN_SAMPLE_INTERVAL {
            return self.rate;
        }
        let kib = self.bytes_this_round as f64 / 1024.0;
        self.rate = kib / dt.as_secs_f64();
        self.bytes_this_round = 0;
        self.last_tick = now;
        self.rate
    }

    /// Returns the most recently computed rate without sampling again.
    pub fn rate(&self) -> f64 {
        self.rate
    }
}

impl Default for ThroughputCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_below_min_interval_keeps_previous_rate() {
        let mut counter = ThroughputCounter::new();
        counter.update(1024);
        // immediately ticking again is below MIN_SAMPLE_INTERVAL
        let first = counter.tick();
        let second = counter.tick();
        assert_eq!(first, second);
    }

    #[test]
    fn test_zero_bytes_yields_zero_rate() {
        let mut counter = ThroughputCounter::new();
        std::thread::sleep(MIN_SAMPLE_INTERVAL);
        assert_eq!(counter.tick(), 0.0);
    }
}
