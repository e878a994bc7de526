//! Per-session process manager.
//!
//! The manager is Idle until [`ProcessManager::run`] installs a process,
//! Running while that process's per-deployment loops are in flight, and
//! Idle again once they have all finished or the process was stopped.
//!
//! Each run is tagged with a generation number. Loops compare it with the
//! manager's current generation after every suspension point: a mismatch
//! means the process was superseded or stopped, and whatever the loop was
//! holding is discarded without touching the process. In-flight updates are
//! never aborted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Deployment, NodeId, Process, SessionId, Work};
use crate::error::Error;
use crate::util::with_timeout;
use crate::{wlog, wlog_trace, wlog_warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Deadline for one deployment update. `None` waits indefinitely.
    pub update_timeout: Option<Duration>,
}

/// Events emitted by a manager for observers such as a UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerEvent {
    /// A process was installed and its loops started.
    Started { session: SessionId, process: String },
    /// The active process was replaced by another one.
    Superseded { session: SessionId, process: String },
    /// The active process was stopped explicitly.
    Stopped { session: SessionId, process: String },
    /// A deployment finished one unit of work.
    WorkDone { session: SessionId, node: NodeId },
    /// A deployment update failed; its loop has ended.
    DeploymentFailed {
        session: SessionId,
        node: NodeId,
        error: String,
    },
    /// Every loop of the active process finished and the manager is idle.
    Completed { session: SessionId, process: String },
}

/// How a call to [`ProcessManager::run`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// All loops finished while the process was still active.
    Completed,
    /// The process was replaced or stopped before its loops finished.
    Superseded,
    /// The process was already the active one; nothing was started.
    AlreadyActive,
}

/// Most recent update failure seen on a node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeFailure {
    pub error: String,
    pub at: DateTime<Utc>,
    /// Number of failed updates on this node so far.
    pub failures: u32,
}

struct Active {
    process: Arc<dyn Process>,
    generation: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
struct ManagerState {
    active: Option<Active>,
    generation: u64,
    counters: HashMap<NodeId, u64>,
    failures: HashMap<NodeId, NodeFailure>,
    last_result: Option<Arc<dyn Process>>,
}

fn same_process(a: &Arc<dyn Process>, b: &Arc<dyn Process>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Runs at most one process at a time for a session.
///
/// Clones share state.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use workloop::process::{BatchProcess, Command, Deployment, NodeId, ProcessManager, RunOutcome, SessionId};
/// use workloop::sim::SimDeployment;
///
/// # tokio_test::block_on(async {
/// let manager = ProcessManager::new(SessionId::new());
/// let process = Arc::new(BatchProcess::new("bench", vec![vec![Command::Wait]; 2]));
/// let deployments: Vec<Arc<dyn Deployment>> = vec![Arc::new(SimDeployment::new("node-1"))];
///
/// let outcome = manager.run(process, deployments).await;
/// assert_eq!(outcome, RunOutcome::Completed);
/// assert_eq!(manager.work_cnt(&NodeId::from("node-1")), 2);
/// # });
/// ```
#[derive(Clone)]
pub struct ProcessManager {
    session: SessionId,
    config: ManagerConfig,
    state: Arc<Mutex<ManagerState>>,
    events: Option<mpsc::UnboundedSender<ManagerEvent>>,
}

impl ProcessManager {
    pub fn new(session: SessionId) -> Self {
        Self::with_config(session, ManagerConfig::default())
    }

    pub fn with_config(session: SessionId, config: ManagerConfig) -> Self {
        Self {
            session,
            config,
            state: Arc::new(Mutex::new(ManagerState::default())),
            events: None,
        }
    }

    /// Send lifecycle events to `tx`.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<ManagerEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    fn state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: ManagerEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.state()
            .active
            .as_ref()
            .is_some_and(|a| a.generation == generation)
    }

    /// The active process, if any.
    pub fn process(&self) -> Option<Arc<dyn Process>> {
        self.state().active.as_ref().map(|a| Arc::clone(&a.process))
    }

    /// Whether a process is installed, regardless of what it reports.
    pub fn has_process(&self) -> bool {
        self.state().active.is_some()
    }

    /// The last process that ran to completion.
    pub fn last_result(&self) -> Option<Arc<dyn Process>> {
        self.state().last_result.clone()
    }

    /// Progress of the active process, 100 when idle.
    pub fn progress(&self) -> f64 {
        self.process().map(|p| p.progress()).unwrap_or(100.0)
    }

    pub fn is_active(&self) -> bool {
        self.process().is_some_and(|p| p.is_active())
    }

    /// Successful updates performed on `node`.
    pub fn work_cnt(&self, node: &NodeId) -> u64 {
        self.state().counters.get(node).copied().unwrap_or(0)
    }

    pub fn failure(&self, node: &NodeId) -> Option<NodeFailure> {
        self.state().failures.get(node).cloned()
    }

    /// All failure records, sorted by node.
    pub fn failures(&self) -> Vec<(NodeId, NodeFailure)> {
        let mut all: Vec<_> = self
            .state()
            .failures
            .iter()
            .map(|(n, f)| (n.clone(), f.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Install `process` and drive it on every deployment until it runs dry.
    ///
    /// A different active process is stopped first. Resolves when all loops
    /// have ended; only a run that is still current at that point records
    /// its process as [`last_result`](Self::last_result) and returns the
    /// manager to idle.
    pub async fn run(
        &self,
        process: Arc<dyn Process>,
        deployments: Vec<Arc<dyn Deployment>>,
    ) -> RunOutcome {
        let Some((generation, cancel)) = self.install(&process) else {
            wlog_trace!("session {} run ignored: {} already active", self.session.short(), process.name());
            return RunOutcome::AlreadyActive;
        };

        wlog!(
            "session {} running {} on {} deployments",
            self.session.short(),
            process.name(),
            deployments.len()
        );
        self.emit(ManagerEvent::Started {
            session: self.session,
            process: process.name().to_string(),
        });

        let loops = deployments
            .iter()
            .map(|deployment| self.work_loop(&process, deployment.as_ref(), generation, &cancel));
        join_all(loops).await;

        let completed = {
            let mut state = self.state();
            if state.active.as_ref().is_some_and(|a| a.generation == generation) {
                state.active = None;
                state.last_result = Some(Arc::clone(&process));
                true
            } else {
                false
            }
        };

        if completed {
            wlog!("session {} completed {}", self.session.short(), process.name());
            self.emit(ManagerEvent::Completed {
                session: self.session,
                process: process.name().to_string(),
            });
            RunOutcome::Completed
        } else {
            wlog_trace!("session {} {} loops ended after supersession", self.session.short(), process.name());
            RunOutcome::Superseded
        }
    }

    /// Replace whatever is active with `process`.
    ///
    /// The previous process is cleared and stopped before the new one is
    /// installed. Returns `None` if `process` is already active.
    fn install(&self, process: &Arc<dyn Process>) -> Option<(u64, CancellationToken)> {
        loop {
            let old = {
                let mut state = self.state();
                if state
                    .active
                    .as_ref()
                    .is_some_and(|a| same_process(&a.process, process))
                {
                    return None;
                }
                match state.active.take() {
                    Some(old) => old,
                    None => {
                        state.generation += 1;
                        let generation = state.generation;
                        let cancel = CancellationToken::new();
                        state.active = Some(Active {
                            process: Arc::clone(process),
                            generation,
                            cancel: cancel.clone(),
                        });
                        return Some((generation, cancel));
                    }
                }
            };

            wlog!("session {} superseding {}", self.session.short(), old.process.name());
            old.cancel.cancel();
            old.process.stop();
            self.emit(ManagerEvent::Superseded {
                session: self.session,
                process: old.process.name().to_string(),
            });
        }
    }

    /// Stop the active process. Returns false when idle.
    ///
    /// Loops notice at their next resumption and end without side effects.
    pub fn stop(&self) -> bool {
        let Some(old) = self.state().active.take() else {
            return false;
        };
        wlog!("session {} stopping {}", self.session.short(), old.process.name());
        old.cancel.cancel();
        old.process.stop();
        self.emit(ManagerEvent::Stopped {
            session: self.session,
            process: old.process.name().to_string(),
        });
        true
    }

    async fn next_work(&self, process: &Arc<dyn Process>, cancel: &CancellationToken) -> Option<Work> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            work = process.create_work() => work,
        }
    }

    async fn work_loop(
        &self,
        process: &Arc<dyn Process>,
        deployment: &dyn Deployment,
        generation: u64,
        cancel: &CancellationToken,
    ) {
        let node = deployment.node_id().clone();
        if !self.is_current(generation) {
            return;
        }

        let mut work = self.next_work(process, cancel).await;
        while let Some(unit) = work {
            if !self.is_current(generation) {
                return;
            }

            match with_timeout(self.config.update_timeout, deployment.update(&unit.commands)).await {
                Ok(result) => {
                    self.record_success(&node);
                    if !self.is_current(generation) {
                        wlog_trace!("node {} result for work {} discarded", node, unit.id);
                        return;
                    }
                    process.add_result(unit, result);
                    self.emit(ManagerEvent::WorkDone {
                        session: self.session,
                        node: node.clone(),
                    });
                }
                Err(err) => {
                    self.record_failure(&node, &err);
                    wlog_warn!("node {} update failed for work {}: {}", node, unit.id, err);
                    self.emit(ManagerEvent::DeploymentFailed {
                        session: self.session,
                        node: node.clone(),
                        error: err.to_string(),
                    });
                    if self.is_current(generation) {
                        process.add_failure(unit, &err);
                    }
                    return;
                }
            }

            work = self.next_work(process, cancel).await;
        }
    }

    fn record_success(&self, node: &NodeId) {
        let mut state = self.state();
        let count = state.counters.entry(node.clone()).or_insert(0);
        *count += 1;
        wlog_trace!("node {} work count {}", node, *count);
    }

    fn record_failure(&self, node: &NodeId, err: &Error) {
        let mut state = self.state();
        let failures = state.failures.get(node).map(|f| f.failures).unwrap_or(0) + 1;
        state.failures.insert(
            node.clone(),
            NodeFailure {
                error: err.to_string(),
                at: Utc::now(),
                failures,
            },
        );
    }
}

impl std::fmt::Debug for ProcessManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("ProcessManager")
            .field("session", &self.session)
            .field("active", &state.active.as_ref().map(|a| a.process.name().to_string()))
            .field("generation", &state.generation)
            .field("counters", &state.counters)
            .finish()
    }
}
