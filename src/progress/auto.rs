//! Time-driven estimation for tasks whose backend reports no progress.
//!
//! An auto task runs in two phases. Until its deadline (the estimate plus a
//! short grace period) one elapsed second is one unit of progress. After the
//! deadline the total is inflated once and the count approaches it along a
//! chain of segments, each covering half the remaining gap at half the speed
//! of the previous one. The count keeps moving but never reaches the total;
//! only [`AutoDrive::close`] snaps it to 100%.

/// Grace period added to every estimate, in milliseconds.
pub const DEADLINE_GRACE_MS: f64 = 500.0;

/// Factor applied to the total when the deadline passes.
pub const OVERRUN_INFLATION: f64 = 1.3;

/// Approach speed of the first decay segment, in units per second.
///
/// Per second rather than per millisecond: a per-millisecond rate would
/// close most of the remaining gap within a single 200 ms tick and land
/// inside the completion tolerance right after the overrun.
const INITIAL_DECAY_RATE: f64 = 0.5;

/// One segment of the post-deadline approach curve.
///
/// Position inside a segment is `(now - start) / 1000 * mult + base`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Barrier {
    /// Timestamp (ms) at which the position equals `base`.
    pub start: f64,
    /// Speed in units per second.
    pub mult: f64,
    /// Position at which the next, slower segment begins.
    pub mul_point: f64,
    pub base: f64,
}

impl Barrier {
    fn position(&self, now: f64) -> f64 {
        (now - self.start) / 1000.0 * self.mult + self.base
    }

    /// Timestamp at which this segment reaches `mul_point`.
    fn switch_ts(&self) -> f64 {
        self.start + (self.mul_point - self.base) / self.mult * 1000.0
    }
}

/// Target values computed by a tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Target {
    pub total: f64,
    pub count: f64,
}

#[derive(Debug, Clone)]
pub struct AutoDrive {
    pub start_ts: f64,
    pub end_ts: f64,
    pub closed: bool,
    pub barrier: Option<Barrier>,
}

impl AutoDrive {
    pub fn new(now: f64, estimate_secs: f64) -> Self {
        Self {
            start_ts: now,
            end_ts: now + estimate_secs * 1000.0 + DEADLINE_GRACE_MS,
            closed: false,
            barrier: None,
        }
    }

    /// Compute where the task should be at `now`.
    ///
    /// Returns `None` once closed.
    pub fn step(&mut self, now: f64, total: f64) -> Option<Target> {
        if self.closed {
            return None;
        }

        if now <= self.end_ts {
            return Some(Target {
                total,
                count: (now - self.start_ts) / 1000.0,
            });
        }

        let total = match self.barrier {
            Some(_) => total,
            None => {
                let inflated = total * OVERRUN_INFLATION;
                self.barrier = Some(Barrier {
                    start: now,
                    mult: INITIAL_DECAY_RATE,
                    mul_point: total + (inflated - total) * 0.5,
                    base: total,
                });
                inflated
            }
        };

        let barrier = self.barrier.as_mut()?;
        let mut pos = barrier.position(now);
        while pos > barrier.mul_point {
            let next = (total + barrier.mul_point) * 0.5;
            if next <= barrier.mul_point || next >= total {
                // No representable point left between the segment end and the total.
                pos = barrier.mul_point;
                break;
            }
            barrier.start = barrier.switch_ts();
            barrier.mult *= 0.5;
            barrier.base = barrier.mul_point;
            barrier.mul_point = next;
            pos = barrier.position(now);
        }

        Some(Target { total, count: pos })
    }

    pub fn close(&mut self) {
        self.closed = true;
    }
}
