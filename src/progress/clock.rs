//! Time sources for progress estimation.
//!
//! All timestamps are milliseconds as `f64`. Only differences between two
//! readings of the same clock are meaningful.

use std::sync::Mutex;

/// A source of millisecond timestamps.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_ms(&self) -> f64;
}

/// Wall clock backed by `chrono::Utc`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> f64 {
        chrono::Utc::now().timestamp_millis() as f64
    }
}

/// A clock that only moves when told to.
///
/// ```
/// use workloop::progress::{Clock, ManualClock};
///
/// let clock = ManualClock::new(1_000.0);
/// clock.advance_ms(250.0);
/// assert_eq!(clock.now_ms(), 1_250.0);
/// ```
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<f64>,
}

impl ManualClock {
    pub fn new(start_ms: f64) -> Self {
        Self {
            now: Mutex::new(start_ms),
        }
    }

    pub fn set_ms(&self, ms: f64) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = ms;
    }

    pub fn advance_ms(&self, ms: f64) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) += ms;
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> f64 {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}
