use std::collections::VecDeque;
use std::time::{Duration, Instant};

const DEFAULT_WINDOW: Duration = Duration::from_secs(5);
const DEFAULT_MAX_SAMPLES: usize = 100;

struct SpeedSample {
    bytes: u64,
    timestamp: Instant,
}

/// Calculates transfer speed over a sliding window of samples.
///
/// Owned by a single consumer, so no interior locking.
pub struct SpeedCalculator {
    samples: VecDeque<SpeedSample>,
    max_samples: usize,
    window: Duration,
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_MAX_SAMPLES)
    }
}

impl SpeedCalculator {
    /// Creates a calculator keeping at most `max_samples` samples no older
    /// than `window`.
    pub fn new(window: Duration, max_samples: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            max_samples: max_samples.max(2),
            window,
        }
    }

    /// Records `bytes` transferred at the current instant.
    pub fn add_sample(&mut self, bytes: u64) {
        self.add_sample_at(bytes, Instant::now());
    }

    fn add_sample_at(&mut self, bytes: u64, now: Instant) {
        self.samples.push_back(SpeedSample {
            bytes,
            timestamp: now,
        });

        while let Some(front) = self.samples.front() {
            if now.duration_since(front.timestamp) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
    }

    /// Average speed in bytes/second within the window.
    ///
    /// Returns 0.0 with fewer than 2 samples.
    pub fn bytes_per_second(&self) -> f64 {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };
        if self.samples.len() < 2 {
            return 0.0;
        }

        let elapsed = last.timestamp.duration_since(first.timestamp);
        if elapsed.is_zero() {
            return 0.0;
        }

        // The first sample marks the start of the window; its bytes were
        // transferred before it.
        let bytes: u64 = self.samples.iter().skip(1).map(|s| s.bytes).sum();
        bytes as f64 / elapsed.as_secs_f64()
    }

    /// Estimated time to transfer `remaining` bytes, `None` if the speed is
    /// unknown.
    pub fn eta(&self, remaining: u64) -> Option<Duration> {
        let speed = self.bytes_per_second();
        if speed <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining as f64 / speed))
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}
