use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

/// Transfer rate over the last few seconds of progress reports.
///
/// Fed with the cumulative byte count after every chunk, so a resumed
/// transfer only measures what this run sent.
pub struct TransferRate {
    window: Duration,
    marks: Mutex<VecDeque<(Instant, u64)>>,
}

impl Default for TransferRate {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl TransferRate {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            marks: Mutex::new(VecDeque::new()),
        }
    }

    /// Notes that `done` bytes have been sent so far.
    pub fn record(&self, done: u64) {
        let now = Instant::now();
        let mut marks = self.marks.lock().unwrap_or_else(PoisonError::into_inner);
        marks.push_back((now, done));
        // Keep one mark at or before the window start as the baseline.
        while marks.len() > 2 && now.duration_since(marks[1].0) >= self.window {
            marks.pop_front();
        }
    }

    /// Bytes per second, 0 until two reports are apart in time.
    pub fn bytes_per_second(&self) -> f64 {
        let marks = self.marks.lock().unwrap_or_else(PoisonError::into_inner);
        let (Some(&(t0, b0)), Some(&(t1, b1))) = (marks.front(), marks.back()) else {
            return 0.0;
        };
        let elapsed = t1.duration_since(t0);
        if elapsed.is_zero() {
            return 0.0;
        }
        b1.saturating_sub(b0) as f64 / elapsed.as_secs_f64()
    }

    /// Time left for `remaining` bytes at the current rate.
    pub fn eta(&self, remaining: u64) -> Option<Duration> {
        let rate = self.bytes_per_second();
        (rate > 0.0).then(|| Duration::from_secs_f64(remaining as f64 / rate))
    }
}
