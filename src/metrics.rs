use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

/// Efficiency samples needed before the history is classified.
pub const MIN_CLASSIFIED_SAMPLES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Initializing,
    Excellent,
    Good,
    Warning,
    Critical,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Initializing => "initializing",
            HealthStatus::Excellent => "excellent",
            HealthStatus::Good => "good",
            HealthStatus::Warning => "warning",
            HealthStatus::Critical => "critical",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EfficiencyReport {
    pub avg: f64,
    pub jitter: f64,
    pub status: HealthStatus,
}

impl EfficiencyReport {
    pub fn initial() -> EfficiencyReport {
        EfficiencyReport {
            avg: 0.0,
            jitter: 0.0,
            status: HealthStatus::Initializing,
        }
    }
}

/// Classifies a history of efficiency percentages.
///
/// Below [`MIN_CLASSIFIED_SAMPLES`] entries the status is `Initializing` and the average is the
/// most recent value.
pub fn classify(history: &VecDeque<f64>) -> EfficiencyReport {
    if history.len() < MIN_CLASSIFIED_SAMPLES {
        return EfficiencyReport {
            avg: history.back().copied().unwrap_or(0.0),
            jitter: 0.0,
            status: HealthStatus::Initializing,
        };
    }

    let n = history.len() as f64;
    let avg = history.iter().sum::<f64>() / n;
    let variance = history.iter().map(|e| (e - avg).powi(2)).sum::<f64>() / n;
    let jitter = variance.sqrt();

    let status = if avg >= 95.0 && jitter < 5.0 {
        HealthStatus::Excellent
    } else if avg >= 90.0 && jitter < 10.0 {
        HealthStatus::Good
    } else if avg >= 80.0 || jitter < 15.0 {
        HealthStatus::Warning
    } else {
        HealthStatus::Critical
    };

    EfficiencyReport { avg, jitter, status }
}

/// Rolling ingest rate and efficiency against the expected downsampled rate.
#[derive(Debug, Clone)]
pub struct MetricsTracker {
    window: Duration,
    samples_window: VecDeque<(Instant, usize)>,
    expected_rate: f64,
    history: VecDeque<f64>,
    history_len: usize,
    ingest_rate: f64,
    total_samples: u64,
}

impl MetricsTracker {
    pub fn new(window: Duration, history_len: usize) -> MetricsTracker {
        MetricsTracker {
            window,
            samples_window: VecDeque::new(),
            expected_rate: 0.0,
            history: VecDeque::with_capacity(history_len),
            history_len: history_len.max(1),
            ingest_rate: 0.0,
            total_samples: 0,
        }
    }

    /// Sets the expected downsampled rate and drops everything measured against the old one.
    pub fn rebase(&mut self, expected_rate: f64) {
        log::debug!(
            "metrics rebased: expected {:.2} samples/s (was {:.2})",
            expected_rate,
            self.expected_rate
        );

        self.expected_rate = expected_rate;
        self.samples_window.clear();
        self.history.clear();
        self.ingest_rate = 0.0;
    }

    pub fn expected_rate(&self) -> f64 {
        self.expected_rate
    }

    pub fn ingest_rate(&self) -> f64 {
        self.ingest_rate
    }

    pub fn total_samples(&self) -> u64 {
        self.total_samples
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn record(&mut self, n_samples: usize) -> f64 {
        self.record_at(n_samples, Instant::now())
    }

    /// Accounts a batch ingested at `now` and returns the resulting efficiency percentage.
    pub fn record_at(&mut self, n_samples: usize, now: Instant) -> f64 {
        self.total_samples += n_samples as u64;
        self.samples_window.push_back((now, n_samples));

        while let Some(&(ts, _)) = self.samples_window.front() {
            if now.saturating_duration_since(ts) > self.window {
                self.samples_window.pop_front();
            } else {
                break;
            }
        }

        self.ingest_rate = match (self.samples_window.front(), self.samples_window.back()) {
            (Some(&(first, _)), Some(&(last, _))) if last > first => {
                let span = (last - first).as_secs_f64();
                let samples: usize = self.samples_window.iter().map(|&(_, n)| n).sum();
                samples as f64 / span
            }
            _ => 0.0,
        };

        let efficiency = self.efficiency();
        self.push_efficiency(efficiency);

        efficiency
    }

    /// Instantaneous efficiency, 0 while either rate is unknown.
    pub fn efficiency(&self) -> f64 {
        if self.expected_rate > 0.0 && self.ingest_rate > 0.0 {
            self.ingest_rate / self.expected_rate * 100.0
        } else {
            0.0
        }
    }

    pub fn push_efficiency(&mut self, efficiency: f64) {
        if self.history.len() == self.history_len {
            self.history.pop_front();
        }
        self.history.push_back(efficiency);
    }

    pub fn current_efficiency(&self) -> EfficiencyReport {
        classify(&self.history)
    }
}
