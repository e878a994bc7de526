//! A process that hands out a fixed list of work units.
//!
//! Units are handed out in order. A unit whose update failed goes back to
//! the end of the queue until it has been tried [`DEFAULT_MAX_ATTEMPTS`]
//! times, after which it is abandoned. While the queue is empty but units
//! are still in flight, `create_work` waits, since a failure may put one
//! back.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{Command, Process, UpdateResult, Work};
use crate::error::Error;
use crate::progress::ProgressNode;
use crate::{wlog_debug, wlog_warn};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Default)]
struct BatchState {
    pending: VecDeque<Work>,
    in_flight: usize,
    done: usize,
    abandoned: usize,
    attempts: HashMap<u64, u32>,
    results: Vec<(u64, UpdateResult)>,
    stopped: bool,
}

pub struct BatchProcess {
    name: String,
    total: usize,
    max_attempts: u32,
    task: Option<ProgressNode>,
    state: Mutex<BatchState>,
    changed: Notify,
}

impl BatchProcess {
    /// One work unit per command list, with ids counting from 0.
    pub fn new(name: &str, units: Vec<Vec<Command>>) -> Self {
        let pending: VecDeque<Work> = units
            .into_iter()
            .enumerate()
            .map(|(i, commands)| Work::new(i as u64, commands))
            .collect();
        Self {
            name: name.to_string(),
            total: pending.len(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            task: None,
            state: Mutex::new(BatchState {
                pending,
                ..Default::default()
            }),
            changed: Notify::new(),
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Report progress into a new task under `parent`, one unit per work item.
    pub fn with_progress(mut self, parent: &ProgressNode, tag: &str, label: &str) -> Self {
        self.task = Some(parent.create_task(tag, label, self.total as f64));
        self
    }

    pub fn task(&self) -> Option<&ProgressNode> {
        self.task.as_ref()
    }

    fn state(&self) -> MutexGuard<'_, BatchState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn done(&self) -> usize {
        self.state().done
    }

    pub fn abandoned(&self) -> usize {
        self.state().abandoned
    }

    pub fn pending(&self) -> usize {
        self.state().pending.len()
    }

    /// Results in the order they arrived.
    pub fn results(&self) -> Vec<(u64, UpdateResult)> {
        self.state().results.clone()
    }
}

#[async_trait]
impl Process for BatchProcess {
    async fn create_work(&self) -> Option<Work> {
        loop {
            // Registered before inspecting state so a notify in between is not lost.
            let changed = self.changed.notified();
            {
                let mut state = self.state();
                if state.stopped {
                    return None;
                }
                if let Some(work) = state.pending.pop_front() {
                    state.in_flight += 1;
                    return Some(work);
                }
                if state.in_flight == 0 {
                    return None;
                }
            }
            changed.await;
        }
    }

    fn add_result(&self, work: Work, result: UpdateResult) {
        {
            let mut state = self.state();
            state.in_flight = state.in_flight.saturating_sub(1);
            state.done += 1;
            state.results.push((work.id, result));
        }
        if let Some(task) = &self.task {
            task.add_count(1.0);
        }
        self.changed.notify_waiters();
    }

    fn add_failure(&self, work: Work, error: &Error) {
        let gave_up = {
            let mut state = self.state();
            state.in_flight = state.in_flight.saturating_sub(1);
            let attempts = state.attempts.entry(work.id).or_insert(0);
            *attempts += 1;
            if *attempts >= self.max_attempts {
                state.abandoned += 1;
                true
            } else {
                state.pending.push_back(work.clone());
                false
            }
        };

        if gave_up {
            wlog_warn!("{}: abandoning work {} after {}", self.name, work.id, error);
            if let Some(task) = &self.task {
                task.add_total(-1.0);
            }
        } else {
            wlog_debug!("{}: requeued work {} after {}", self.name, work.id, error);
        }
        self.changed.notify_waiters();
    }

    fn progress(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        let state = self.state();
        (state.done + state.abandoned) as f64 / self.total as f64 * 100.0
    }

    fn is_active(&self) -> bool {
        let state = self.state();
        !state.stopped && (!state.pending.is_empty() || state.in_flight > 0)
    }

    fn stop(&self) {
        self.state().stopped = true;
        self.changed.notify_waiters();
    }

    fn name(&self) -> &str {
        &self.name
    }
}
