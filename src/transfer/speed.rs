//! Transfer rate sampling.
//!
//! Decoupled from the transfer logic: fragment tasks call [`SpeedCalculator::record`]
//! with each chunk's byte count, observers subscribe to the published
//! samples. One sample per cadence interval at most, so a fast transfer
//! does not flood observers. Uses `tokio::time::Instant` so paused-clock
//! tests can drive the cadence deterministically.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

/// One published rate sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpeedSample {
    pub bytes_per_sec: u64,
    /// Bytes recorded since the last reset.
    pub total_bytes: u64,
}

struct Window {
    started: Instant,
    window_bytes: u64,
    total_bytes: u64,
}

/// Windowed throughput meter, reset at each file boundary.
pub struct SpeedCalculator {
    window: Mutex<Window>,
    sample: watch::Sender<SpeedSample>,
    cadence: Duration,
}

impl SpeedCalculator {
    pub fn new() -> Self {
        Self::with_cadence(Duration::from_secs(1))
    }

    pub fn with_cadence(cadence: Duration) -> Self {
        Self {
            window: Mutex::new(Window {
                started: Instant::now(),
                window_bytes: 0,
                total_bytes: 0,
            }),
            sample: watch::Sender::new(SpeedSample::default()),
            cadence,
        }
    }

    /// Start a fresh measurement, publishing a zero sample.
    pub fn reset(&self) {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        window.started = Instant::now();
        window.window_bytes = 0;
        window.total_bytes = 0;
        self.sample.send_replace(SpeedSample::default());
    }

    /// Record `bytes` moved. Publishes a sample once per cadence interval.
    pub fn record(&self, bytes: u64) {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        window.window_bytes += bytes;
        window.total_bytes += bytes;

        let elapsed = window.started.elapsed();
        if elapsed >= self.cadence {
            let bytes_per_sec =
                (window.window_bytes as f64 / elapsed.as_secs_f64()).round() as u64;
            let sample = SpeedSample {
                bytes_per_sec,
                total_bytes: window.total_bytes,
            };
            window.started = Instant::now();
            window.window_bytes = 0;
            self.sample.send_replace(sample);
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SpeedSample> {
        self.sample.subscribe()
    }
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new()
    }
}

/// Render a byte rate for display: `B/s`, `KB/s`, `MB/s` or `GB/s` with
/// one decimal place above bytes.
pub fn format_speed(bytes_per_sec: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;

    let rate = bytes_per_sec as f64;
    if rate >= GB {
        format!("{:.1} GB/s", rate / GB)
    } else if rate >= MB {
        format!("{:.1} MB/s", rate / MB)
    } else if rate >= KB {
        format!("{:.1} KB/s", rate / KB)
    } else {
        format!("{bytes_per_sec} B/s")
    }
}
