//! Progress display adapters

use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use tracing::info;

use super::ProgressSample;

/// Receives aggregated progress; rendering is up to the implementation
pub trait ProgressReporter: Send + Sync {
    fn sample(&self, sample: &ProgressSample, fraction: f64);

    fn task_started(&self, _task_id: &str, _fraction: f64) {}

    fn task_finished(&self, _task_id: &str, _fraction: f64) {}

    fn finish(&self, _message: &str) {}
}

const BAR_LENGTH: u64 = 1000;

/// Single terminal progress bar
pub struct BarReporter {
    bar: ProgressBar,
}

impl BarReporter {
    pub fn new() -> Self {
        let bar = ProgressBar::new(BAR_LENGTH);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {percent:>3}% {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        bar.enable_steady_tick(Duration::from_millis(200));
        Self { bar }
    }

    fn set_fraction(&self, fraction: f64) {
        self.bar.set_position((fraction * BAR_LENGTH as f64).round() as u64);
    }
}

impl Default for BarReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter for BarReporter {
    fn sample(&self, sample: &ProgressSample, fraction: f64) {
        self.set_fraction(fraction);
        if !sample.message.is_empty() {
            self.bar.set_message(format!("{}: {}", sample.task_id, sample.message));
        }
    }

    fn task_started(&self, task_id: &str, fraction: f64) {
        self.set_fraction(fraction);
        self.bar.set_message(task_id.to_string());
    }

    fn task_finished(&self, _task_id: &str, fraction: f64) {
        self.set_fraction(fraction);
    }

    fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }
}

/// Periodic progress lines through `tracing` (for non-interactive runs)
pub struct LogReporter {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl LogReporter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }
}

impl ProgressReporter for LogReporter {
    fn sample(&self, sample: &ProgressSample, fraction: f64) {
        let mut last = self.last.lock();
        if last.is_some_and(|t| t.elapsed() < self.interval) {
            return;
        }
        *last = Some(Instant::now());
        drop(last);

        info!(
            "[{:>5.1}%] {}: {}",
            fraction * 100.0,
            sample.task_id,
            sample.message
        );
    }

    fn task_started(&self, task_id: &str, fraction: f64) {
        info!("[{:>5.1}%] Starting {}", fraction * 100.0, task_id);
    }

    fn task_finished(&self, task_id: &str, fraction: f64) {
        info!("[{:>5.1}%] Finished {}", fraction * 100.0, task_id);
    }
}
