//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Progress roots on a manual clock
//! - Scripted deployments and processes
//! - Gated deployments for holding an update in flight

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use workloop::process::{Command, Deployment, NodeId, Process, UpdateResult, Work};
use workloop::progress::{ManualClock, ProgressNode, TickScheduler};
use workloop::{Error, Result};

/// A root domain whose auto tasks tick on a manual clock starting at `start_ms`.
pub struct ClockedRoot {
    pub clock: Arc<ManualClock>,
    pub scheduler: TickScheduler,
    pub root: ProgressNode,
}

impl ClockedRoot {
    pub fn new(start_ms: f64) -> Self {
        let clock = Arc::new(ManualClock::new(start_ms));
        let scheduler = TickScheduler::with_clock(clock.clone());
        let root = ProgressNode::root_with(&scheduler);
        Self {
            clock,
            scheduler,
            root,
        }
    }

    /// Move the clock to `ms` and tick every live task once.
    pub fn tick_at(&self, ms: f64) -> usize {
        self.clock.set_ms(ms);
        self.scheduler.tick_all()
    }
}

/// A deployment that answers from a script of outcomes, then succeeds forever.
pub struct MockDeployment {
    node: NodeId,
    script: Mutex<VecDeque<std::result::Result<UpdateResult, String>>>,
    calls: AtomicUsize,
}

impl MockDeployment {
    pub fn new(node: &str) -> Self {
        Self {
            node: NodeId::from(node),
            script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Queue a failure for the next scripted call.
    pub fn then_fail(self, message: &str) -> Self {
        self.script.lock().unwrap().push_back(Err(message.to_string()));
        self
    }

    pub fn then_ok(self, lines: &[&str]) -> Self {
        self.script
            .lock()
            .unwrap()
            .push_back(Ok(lines.iter().map(|l| l.to_string()).collect()));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Deployment for MockDeployment {
    fn node_id(&self) -> &NodeId {
        &self.node
    }

    async fn update(&self, commands: &[Command]) -> Result<UpdateResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(lines)) => Ok(lines),
            Some(Err(message)) => Err(Error::deployment(&self.node, message)),
            None => Ok(vec![format!("{} commands", commands.len())]),
        }
    }
}

/// A deployment whose updates block until the gate is opened once per update.
pub struct GatedDeployment {
    node: NodeId,
    pub gate: Arc<Notify>,
    pub entered: Arc<Notify>,
}

impl GatedDeployment {
    pub fn new(node: &str) -> Self {
        Self {
            node: NodeId::from(node),
            gate: Arc::new(Notify::new()),
            entered: Arc::new(Notify::new()),
        }
    }
}

#[async_trait]
impl Deployment for GatedDeployment {
    fn node_id(&self) -> &NodeId {
        &self.node
    }

    async fn update(&self, _commands: &[Command]) -> Result<UpdateResult> {
        self.entered.notify_one();
        self.gate.notified().await;
        Ok(vec!["released".to_string()])
    }
}

/// A process that hands out a fixed script of work units and records
/// every call the manager makes on it.
pub struct ScriptedProcess {
    name: String,
    queue: Mutex<VecDeque<Work>>,
    results: Mutex<Vec<(u64, UpdateResult)>>,
    failures: Mutex<Vec<u64>>,
    stops: AtomicUsize,
}

impl ScriptedProcess {
    pub fn new(name: &str, units: usize) -> Arc<Self> {
        let queue = (0..units as u64)
            .map(|id| Work::new(id, vec![Command::exec("bench", &[&id.to_string()])]))
            .collect();
        Arc::new(Self {
            name: name.to_string(),
            queue: Mutex::new(queue),
            results: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
        })
    }

    /// Each of `units` is handed out once per deployment, round by round.
    pub fn per_deployment(name: &str, units: &[u64], deployments: usize) -> Arc<Self> {
        let queue = units
            .iter()
            .flat_map(|&id| std::iter::repeat(id).take(deployments))
            .map(|id| Work::new(id, vec![Command::Wait]))
            .collect();
        Arc::new(Self {
            name: name.to_string(),
            queue: Mutex::new(queue),
            results: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
        })
    }

    pub fn results(&self) -> Vec<(u64, UpdateResult)> {
        self.results.lock().unwrap().clone()
    }

    pub fn failures(&self) -> Vec<u64> {
        self.failures.lock().unwrap().clone()
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Process for ScriptedProcess {
    async fn create_work(&self) -> Option<Work> {
        self.queue.lock().unwrap().pop_front()
    }

    fn add_result(&self, work: Work, result: UpdateResult) {
        self.results.lock().unwrap().push((work.id, result));
    }

    fn add_failure(&self, work: Work, _error: &Error) {
        self.failures.lock().unwrap().push(work.id);
    }

    fn progress(&self) -> f64 {
        if self.queue.lock().unwrap().is_empty() {
            100.0
        } else {
            0.0
        }
    }

    fn is_active(&self) -> bool {
        self.stops() == 0
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Thin-pointer identity of two processes.
pub fn same_process(a: &Arc<dyn Process>, b: &Arc<dyn Process>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}
