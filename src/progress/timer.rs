//! Shared periodic ticker for auto tasks.
//!
//! The scheduler keeps the set of live auto tasks and a single periodic
//! tokio task that ticks them. The periodic task is spawned when the first
//! auto task registers and cancelled as soon as no task is live, so an idle
//! scheduler costs nothing. [`TickScheduler::tick_all`] is the period body
//! and can be called directly when driving time by hand.
//!
//! A timer whose runtime has shut down counts as stopped, and the next
//! registration spawns a fresh one on the current runtime.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::clock::{Clock, SystemClock};
use super::node::ProgressNode;
use crate::{wlog_debug, wlog_trace};

/// Default tick period.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(200);

static GLOBAL: OnceLock<TickScheduler> = OnceLock::new();

struct Timer {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl Timer {
    fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }
}

#[derive(Default)]
struct SchedulerState {
    live: Vec<ProgressNode>,
    timer: Option<Timer>,
}

struct SchedulerInner {
    clock: Arc<dyn Clock>,
    period: Duration,
    state: Mutex<SchedulerState>,
}

/// Handle to a tick scheduler. Clones share the same live set and timer.
#[derive(Clone)]
pub struct TickScheduler {
    inner: Arc<SchedulerInner>,
}

impl TickScheduler {
    pub fn new() -> Self {
        Self::with_clock_and_period(Arc::new(SystemClock), DEFAULT_TICK_INTERVAL)
    }

    pub fn with_period(period: Duration) -> Self {
        Self::with_clock_and_period(Arc::new(SystemClock), period)
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self::with_clock_and_period(clock, DEFAULT_TICK_INTERVAL)
    }

    pub fn with_clock_and_period(clock: Arc<dyn Clock>, period: Duration) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                clock,
                period,
                state: Mutex::new(SchedulerState::default()),
            }),
        }
    }

    /// The process-wide scheduler used by [`ProgressNode::root`].
    pub fn global() -> &'static TickScheduler {
        GLOBAL.get_or_init(TickScheduler::new)
    }

    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn now_ms(&self) -> f64 {
        self.inner.clock.now_ms()
    }

    pub fn period(&self) -> Duration {
        self.inner.period
    }

    pub fn live_count(&self) -> usize {
        self.state().live.len()
    }

    /// Whether the periodic timer is currently running.
    pub fn is_running(&self) -> bool {
        self.state().timer.as_ref().is_some_and(Timer::is_alive)
    }

    /// Enrol an auto task and make sure the timer runs.
    pub fn register(&self, task: ProgressNode) {
        let mut state = self.state();
        if !state.live.contains(&task) {
            state.live.push(task);
        }
        self.ensure_timer(&mut state);
    }

    /// Drop a task from the live set, stopping the timer if it was the last one.
    pub fn unregister(&self, task: &ProgressNode) {
        let mut state = self.state();
        state.live.retain(|t| t != task);
        if state.live.is_empty() {
            Self::cancel(&mut state);
        }
    }

    /// Start the timer if there is anything to tick.
    ///
    /// Tasks registered outside a runtime are picked up by calling this
    /// once one is available.
    pub fn start(&self) {
        let mut state = self.state();
        self.ensure_timer(&mut state);
    }

    fn ensure_timer(&self, state: &mut SchedulerState) {
        if state.live.is_empty() || state.timer.as_ref().is_some_and(Timer::is_alive) {
            return;
        }
        if state.timer.take().is_some() {
            wlog_debug!("TickScheduler: timer ended with its runtime, respawning");
        }
        state.timer = self.spawn_timer();
    }

    /// Stop the timer. Registered tasks stay registered.
    pub fn stop(&self) {
        Self::cancel(&mut self.state());
    }

    fn cancel(state: &mut SchedulerState) {
        if let Some(timer) = state.timer.take() {
            wlog_debug!("TickScheduler stopped");
            timer.token.cancel();
        }
    }

    /// Tick every live task once at the clock's current time.
    ///
    /// Tasks reporting that they need no more ticks are dropped; the timer
    /// stops when none remain. Returns the number of tasks still live.
    pub fn tick_all(&self) -> usize {
        let now = self.now_ms();
        // Ticking locks each task's tree, so it happens outside the state lock.
        let live = self.state().live.clone();

        let finished: Vec<ProgressNode> = live.into_iter().filter(|task| !task.tick(now)).collect();

        let mut state = self.state();
        if !finished.is_empty() {
            state.live.retain(|t| !finished.contains(t));
        }
        let remaining = state.live.len();
        if remaining == 0 {
            Self::cancel(&mut state);
        }
        wlog_trace!("TickScheduler tick now={} live={}", now, remaining);
        remaining
    }

    fn spawn_timer(&self) -> Option<Timer> {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                wlog_debug!("TickScheduler: no runtime, ticks must be driven manually");
                return None;
            }
        };

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let scheduler = self.clone();
        let period = self.inner.period;
        wlog_debug!("TickScheduler started period={:?}", period);

        let task = runtime.spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick of a tokio interval completes immediately.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = interval.tick() => {
                        if scheduler.tick_all() == 0 {
                            break;
                        }
                    }
                }
            }
        });

        Some(Timer { token, task })
    }
}

impl Default for TickScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TickScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TickScheduler")
            .field("period", &self.inner.period)
            .field("clock", &self.inner.clock)
            .finish()
    }
}
