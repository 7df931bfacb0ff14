//! Progress snapshots, speed smoothing and event throttling.
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// A point-in-time view of a download's progress.
///
/// `downloaded_bytes` is clamped to `total_bytes`, `percent` to 100. `speed`
/// and `eta` are zero when there is nothing to report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    /// Percent complete in `[0, 100]`.
    pub percent: f64,
    /// Bytes per second.
    pub speed: f64,
    /// Estimated seconds remaining.
    pub eta: f64,
}

impl Progress {
    /// Builds a snapshot with the raw (unsmoothed) speed for `elapsed`.
    pub fn compute(total_bytes: u64, downloaded_bytes: u64, elapsed: Duration) -> Self {
        let downloaded_bytes = downloaded_bytes.min(total_bytes);
        let percent = if total_bytes > 0 {
            (downloaded_bytes as f64 * 100.0 / total_bytes as f64).min(100.0)
        } else {
            0.0
        };
        let elapsed_secs = elapsed.as_secs_f64();
        let speed = if elapsed_secs > 0.0 {
            downloaded_bytes as f64 / elapsed_secs
        } else {
            0.0
        };
        let eta = if speed > 0.0 {
            (total_bytes - downloaded_bytes) as f64 / speed
        } else {
            0.0
        };
        Self {
            total_bytes,
            downloaded_bytes,
            percent,
            speed,
            eta,
        }
    }
}

/// Smooths the reported speed by averaging the last few samples.
#[derive(Debug, Default)]
pub(crate) struct SpeedEstimator {
    samples: VecDeque<f64>,
}

impl SpeedEstimator {
    const WINDOW: usize = 10;

    /// Records one sample and returns the smoothed speed in bytes/sec.
    pub(crate) fn record(&mut self, downloaded_bytes: u64, elapsed: Duration) -> f64 {
        let millis = elapsed.as_millis() as f64;
        let instant = if millis > 0.0 {
            downloaded_bytes as f64 / millis * 1000.0
        } else {
            0.0
        };
        if self.samples.len() == Self::WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(instant);
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }
}

/// Decides when a progress event is worth publishing.
///
/// An event goes out when it is forced, when the percentage moved by at
/// least one point, or when the minimum interval elapsed, whichever comes
/// first.
#[derive(Debug)]
pub(crate) struct ProgressThrottle {
    last_emit: Option<Instant>,
    last_percent: f64,
    min_interval: Duration,
}

impl ProgressThrottle {
    pub(crate) fn new(min_interval: Duration) -> Self {
        Self {
            last_emit: None,
            last_percent: 0.0,
            min_interval,
        }
    }

    pub(crate) fn should_emit(&mut self, percent: f64, force: bool) -> bool {
        let now = Instant::now();
        let due = match self.last_emit {
            None => true,
            Some(last) => {
                (percent - self.last_percent).abs() >= 1.0
                    || now.duration_since(last) >= self.min_interval
            }
        };
        if force || due {
            self.last_emit = Some(now);
            self.last_percent = percent;
            true
        } else {
            false
        }
    }
}

impl Default for ProgressThrottle {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_clamps_downloaded_and_percent() {
        let progress = Progress::compute(100, 250, Duration::from_secs(1));
        assert_eq!(progress.downloaded_bytes, 100);
        assert_eq!(progress.percent, 100.0);
        assert_eq!(progress.eta, 0.0);
    }

    #[test]
    fn compute_handles_zero_total() {
        let progress = Progress::compute(0, 0, Duration::from_secs(1));
        assert_eq!(progress.percent, 0.0);
        assert_eq!(progress.speed, 0.0);
        assert_eq!(progress.eta, 0.0);
    }

    #[test]
    fn eta_is_zero_without_speed() {
        let progress = Progress::compute(100, 50, Duration::ZERO);
        assert_eq!(progress.speed, 0.0);
        assert_eq!(progress.eta, 0.0);
    }

    #[test]
    fn estimator_averages_over_window() {
        let mut estimator = SpeedEstimator::default();
        // 1000 bytes in 1s, then 4000 bytes in 2s: samples 1000 and 2000.
        let first = estimator.record(1000, Duration::from_secs(1));
        assert_eq!(first, 1000.0);
        let second = estimator.record(4000, Duration::from_secs(2));
        assert_eq!(second, 1500.0);
    }

    #[test]
    fn estimator_drops_old_samples() {
        let mut estimator = SpeedEstimator::default();
        for _ in 0..20 {
            estimator.record(1000, Duration::from_secs(1));
        }
        let speed = estimator.record(1000, Duration::from_secs(1));
        assert_eq!(speed, 1000.0);
        assert_eq!(estimator.samples.len(), SpeedEstimator::WINDOW);
    }

    #[test]
    fn throttle_first_and_forced_emits() {
        let mut throttle = ProgressThrottle::default();
        assert!(throttle.should_emit(0.0, false));
        assert!(!throttle.should_emit(0.1, false));
        assert!(throttle.should_emit(0.2, true));
    }

    #[test]
    fn throttle_emits_on_percent_jump() {
        let mut throttle = ProgressThrottle::default();
        assert!(throttle.should_emit(0.0, false));
        assert!(!throttle.should_emit(0.5, false));
        assert!(throttle.should_emit(1.5, false));
    }

    #[test]
    fn throttle_emits_after_interval() {
        let mut throttle = ProgressThrottle::new(Duration::from_millis(20));
        assert!(throttle.should_emit(0.0, false));
        assert!(!throttle.should_emit(0.1, false));
        std::thread::sleep(Duration::from_millis(30));
        assert!(throttle.should_emit(0.1, false));
    }
}
