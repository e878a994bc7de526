//! Hierarchical progress aggregation.
//!
//! A progress tree is an arena of nodes behind a single mutex. A
//! [`ProgressNode`] is a cheap handle (tree + slot) to one of them:
//!
//! - a *domain* is a node without a parent (the root returned by
//!   [`progress_domain`](super::progress_domain)),
//! - a *task* is a node registered under a tag of its parent,
//! - an *auto task* is a task that additionally carries an [`AutoDrive`]
//!   and is ticked by a [`TickScheduler`].
//!
//! Every mutation is applied locally, clamped, and the delta that actually
//! took effect is forwarded up the parent chain under the same lock, so
//! each node's `total`/`count` always equals the sum over its children plus
//! whatever was added at the node directly.
//!
//! Nodes that were replaced or moved out of the tree are reclaimed once the
//! last handle to them is dropped, and their slots are reused.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use super::auto::AutoDrive;
use super::snapshot::TaskSnapshot;
use super::timer::TickScheduler;
use crate::{wlog, wlog_trace, wlog_warn, Error, Result};

/// Relative tolerance under which `count` is considered equal to `total`.
pub const COMPLETION_TOLERANCE: f64 = 0.001;

type Slot = usize;

#[derive(Debug)]
struct Node {
    tag: Option<String>,
    label: String,
    total: f64,
    count: f64,
    parent: Option<Slot>,
    /// Children in insertion order. Replacing a tag keeps its position.
    children: Vec<(String, Slot)>,
    leading: Option<Slot>,
    drive: Option<AutoDrive>,
    /// Alive while any [`ProgressNode`] refers to this slot.
    handles: Weak<()>,
    vacant: bool,
}

impl Node {
    fn new(tag: Option<String>, label: String, total: f64) -> Self {
        Self {
            tag,
            label,
            total: total.max(0.0),
            count: 0.0,
            parent: None,
            children: Vec::new(),
            leading: None,
            drive: None,
            handles: Weak::new(),
            vacant: false,
        }
    }

    fn vacant() -> Self {
        Self {
            vacant: true,
            ..Self::new(None, String::new(), 0.0)
        }
    }

    fn is_completed(&self) -> bool {
        (self.total - self.count).abs() / self.total.max(1.0) <= COMPLETION_TOLERANCE
    }
}

#[derive(Debug)]
struct Tree {
    nodes: Vec<Node>,
    /// Reclaimed slots, reused before the arena grows.
    free: Vec<Slot>,
    /// Parentless nodes other than the root, candidates for reclaiming.
    detached: Vec<Slot>,
    scheduler: TickScheduler,
}

impl Tree {
    fn new(root: Node, scheduler: TickScheduler) -> Self {
        Self {
            nodes: vec![root],
            free: Vec::new(),
            detached: Vec::new(),
            scheduler,
        }
    }

    fn alloc(&mut self, node: Node) -> Slot {
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = node;
                slot
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    /// Token that keeps `slot` from being reclaimed while it is held.
    fn pin(&mut self, slot: Slot) -> Arc<()> {
        if let Some(token) = self.nodes[slot].handles.upgrade() {
            return token;
        }
        let token = Arc::new(());
        self.nodes[slot].handles = Arc::downgrade(&token);
        token
    }

    /// Free every detached node without handles. Its children become detached in turn.
    fn reclaim(&mut self) {
        let mut pending = std::mem::take(&mut self.detached);
        pending.sort_unstable();
        pending.dedup();

        while let Some(slot) = pending.pop() {
            let node = &self.nodes[slot];
            if slot == 0 || node.vacant || node.parent.is_some() {
                continue;
            }
            if node.handles.strong_count() > 0 {
                self.detached.push(slot);
                continue;
            }

            let children = std::mem::take(&mut self.nodes[slot].children);
            for (_, child) in children {
                self.nodes[child].parent = None;
                pending.push(child);
            }
            self.nodes[slot] = Node::vacant();
            for node in &mut self.nodes {
                if node.leading == Some(slot) {
                    node.leading = None;
                }
            }
            self.free.push(slot);
        }
    }

    /// Apply `(dt, dc)` at `slot` and propagate what took effect to ancestors.
    ///
    /// Returns the deltas applied at `slot` itself.
    fn apply(&mut self, slot: Slot, dt: f64, dc: f64) -> (f64, f64) {
        if !dt.is_finite() || !dc.is_finite() {
            return (0.0, 0.0);
        }

        let mut current = slot;
        let (mut dt, mut dc) = (dt, dc);
        let mut applied_here = None;

        loop {
            let node = &mut self.nodes[current];

            let old_total = node.total;
            node.total = (node.total + dt).max(0.0);
            let applied_total = node.total - old_total;

            let old_count = node.count;
            node.count = (node.count + dc).clamp(0.0, node.total);
            let applied_count = node.count - old_count;

            if applied_here.is_none() {
                applied_here = Some((applied_total, applied_count));
            }

            match node.parent {
                Some(parent) if applied_total != 0.0 || applied_count != 0.0 => {
                    current = parent;
                    dt = applied_total;
                    dc = applied_count;
                }
                _ => break,
            }
        }

        applied_here.unwrap_or((0.0, 0.0))
    }

    fn child(&self, parent: Slot, tag: &str) -> Option<Slot> {
        self.nodes[parent]
            .children
            .iter()
            .find(|(t, _)| t == tag)
            .map(|(_, s)| *s)
    }

    /// Register `child` under `tag`, replacing and detaching any previous holder.
    fn attach(&mut self, parent: Slot, tag: &str, child: Slot) {
        let prev = self.child(parent, tag);
        if prev == Some(child) {
            return;
        }

        let (prev_total, prev_count) = prev
            .map(|p| (self.nodes[p].total, self.nodes[p].count))
            .unwrap_or((0.0, 0.0));
        let dt = self.nodes[child].total - prev_total;
        let dc = self.nodes[child].count - prev_count;

        if let Some(p) = prev {
            self.nodes[p].parent = None;
            self.detached.push(p);
            if self.nodes[parent].leading == Some(p) {
                self.nodes[parent].leading = None;
            }
        }

        let entry = &mut self.nodes[parent];
        match entry.children.iter_mut().find(|(t, _)| t == tag) {
            Some(existing) => existing.1 = child,
            None => entry.children.push((tag.to_string(), child)),
        }
        let node = &mut self.nodes[child];
        node.parent = Some(parent);
        node.tag = Some(tag.to_string());

        self.apply(parent, dt, dc);
        self.reclaim();
    }

    /// Remove `slot` from its parent, withdrawing its contribution.
    fn detach(&mut self, slot: Slot) {
        let Some(parent) = self.nodes[slot].parent else {
            return;
        };
        let (total, count) = (self.nodes[slot].total, self.nodes[slot].count);
        let entry = &mut self.nodes[parent];
        entry.children.retain(|(_, s)| *s != slot);
        if entry.leading == Some(slot) {
            entry.leading = None;
        }
        self.nodes[slot].parent = None;
        self.detached.push(slot);
        self.apply(parent, -total, -count);
    }

    fn is_ancestor(&self, candidate: Slot, of: Slot) -> bool {
        let mut current = Some(of);
        while let Some(slot) = current {
            if slot == candidate {
                return true;
            }
            current = self.nodes[slot].parent;
        }
        false
    }

    fn leading(&mut self, slot: Slot, recursive: bool) -> Option<Slot> {
        if self.nodes[slot].children.is_empty() {
            return Some(slot);
        }

        if let Some(cached) = self.nodes[slot].leading {
            // A cached descendant may have been moved out of this subtree since.
            if self.is_ancestor(slot, cached) && !self.nodes[cached].is_completed() {
                return Some(cached);
            }
        }

        let children: Vec<Slot> = self.nodes[slot].children.iter().map(|(_, s)| *s).collect();
        for child in children {
            if self.nodes[child].is_completed() {
                continue;
            }
            let chosen = if recursive {
                self.leading(child, true).unwrap_or(child)
            } else {
                child
            };
            self.nodes[slot].leading = Some(chosen);
            return Some(chosen);
        }

        self.nodes[slot].leading = None;
        None
    }

    fn tick(&mut self, slot: Slot, now: f64) -> bool {
        let total = self.nodes[slot].total;
        let Some(drive) = self.nodes[slot].drive.as_mut() else {
            return false;
        };
        let Some(target) = drive.step(now, total) else {
            return false;
        };

        self.apply(slot, target.total - total, 0.0);
        let count = self.nodes[slot].count;
        self.apply(slot, 0.0, target.count - count);
        true
    }

    fn close(&mut self, slot: Slot) {
        if let Some(drive) = self.nodes[slot].drive.as_mut() {
            drive.close();
        }
        let node = &self.nodes[slot];
        let gap = node.total - node.count;
        self.apply(slot, 0.0, gap);
    }

    fn snapshot(&self, slot: Slot) -> TaskSnapshot {
        let node = &self.nodes[slot];
        TaskSnapshot {
            tag: node.tag.clone(),
            total: node.total,
            count: node.count,
            label: (!node.label.is_empty()).then(|| node.label.clone()),
            tasks: node
                .children
                .iter()
                .map(|(_, child)| self.snapshot(*child))
                .collect(),
        }
    }
}

/// Handle to one node of a progress tree.
///
/// Clones refer to the same node. Equality is node identity.
#[derive(Clone)]
pub struct ProgressNode {
    tree: Arc<Mutex<Tree>>,
    slot: Slot,
    _pin: Arc<()>,
}

impl ProgressNode {
    /// Create a fresh root domain ticked by the process-wide scheduler.
    pub fn root() -> Self {
        Self::root_with(TickScheduler::global())
    }

    /// Create a fresh root domain whose auto tasks enrol with `scheduler`.
    pub fn root_with(scheduler: &TickScheduler) -> Self {
        Self::detached(scheduler.clone(), None, String::new(), 0.0)
    }

    fn detached(scheduler: TickScheduler, tag: Option<String>, label: String, total: f64) -> Self {
        let mut tree = Tree::new(Node::new(tag, label, total), scheduler);
        let pin = tree.pin(0);
        Self {
            tree: Arc::new(Mutex::new(tree)),
            slot: 0,
            _pin: pin,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A handle to `slot`. Must be made under the lock that found the slot.
    fn handle(&self, tree: &mut Tree, slot: Slot) -> Self {
        Self {
            tree: Arc::clone(&self.tree),
            slot,
            _pin: tree.pin(slot),
        }
    }

    fn insert(&self, tag: &str, mut node: Node) -> Self {
        let mut tree = self.lock();
        node.tag = Some(tag.to_string());
        let slot = tree.alloc(node);
        // Pinned before attaching so the reclaim pass cannot touch it.
        let handle = self.handle(&mut tree, slot);
        tree.attach(self.slot, tag, slot);
        handle
    }

    pub fn tag(&self) -> Option<String> {
        self.lock().nodes[self.slot].tag.clone()
    }

    pub fn label(&self) -> String {
        self.lock().nodes[self.slot].label.clone()
    }

    pub fn total(&self) -> f64 {
        self.lock().nodes[self.slot].total
    }

    pub fn count(&self) -> f64 {
        self.lock().nodes[self.slot].count
    }

    /// Completion in percent, 100 for an empty node.
    pub fn percent(&self) -> f64 {
        let tree = self.lock();
        let node = &tree.nodes[self.slot];
        if node.total <= 0.0 {
            100.0
        } else {
            node.count / node.total * 100.0
        }
    }

    /// Whether this node is registered under a parent.
    pub fn has_parent(&self) -> bool {
        self.lock().nodes[self.slot].parent.is_some()
    }

    pub fn is_auto(&self) -> bool {
        self.lock().nodes[self.slot].drive.is_some()
    }

    /// Whether an auto task has been closed. Always false for plain nodes.
    pub fn is_closed(&self) -> bool {
        self.lock().nodes[self.slot]
            .drive
            .as_ref()
            .map(|d| d.closed)
            .unwrap_or(false)
    }

    /// Tags of the direct children, in insertion order.
    pub fn task_tags(&self) -> Vec<String> {
        self.lock().nodes[self.slot]
            .children
            .iter()
            .map(|(t, _)| t.clone())
            .collect()
    }

    /// Create a task under `tag`, replacing any task already there.
    pub fn create_task(&self, tag: &str, label: &str, total: f64) -> Self {
        self.insert(tag, Node::new(None, label.to_string(), total))
    }

    /// Create an auto task estimated to take `estimate_secs`, closed when `done` resolves.
    ///
    /// Success and failure of `done` both close the task to 100%; the
    /// outcome is only logged. Without a tokio runtime the binding cannot be
    /// made and the caller has to [`close`](Self::close) the task.
    pub fn create_auto_task<F, T, E>(
        &self,
        tag: &str,
        label: &str,
        estimate_secs: f64,
        done: F,
    ) -> Self
    where
        F: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let task = self.start_auto_task(tag, label, estimate_secs);
        let closer = task.clone();
        let tag = tag.to_string();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    match done.await {
                        Ok(_) => wlog!("auto task {} succeeded", tag),
                        Err(e) => wlog!("auto task {} failed: {}", tag, e),
                    }
                    closer.close();
                });
            }
            Err(_) => {
                wlog_warn!("auto task {} created outside a runtime, completion is not bound", tag)
            }
        }
        task
    }

    /// Create an auto task that only closes through [`close`](Self::close).
    pub fn start_auto_task(&self, tag: &str, label: &str, estimate_secs: f64) -> Self {
        let scheduler = self.lock().scheduler.clone();
        let mut node = Node::new(None, label.to_string(), estimate_secs);
        node.drive = Some(AutoDrive::new(scheduler.now_ms(), estimate_secs.max(0.0)));
        let task = self.insert(tag, node);
        // Registered after the tree lock is released: the scheduler ticks under its own lock.
        scheduler.register(task.clone());
        task
    }

    /// Child at `tag`, or a fresh unregistered placeholder with zero total.
    ///
    /// The tree is never modified by this call.
    pub fn get_task(&self, tag: &str) -> Self {
        let mut tree = self.lock();
        match tree.child(self.slot, tag) {
            Some(slot) => self.handle(&mut tree, slot),
            None => Self::detached(
                tree.scheduler.clone(),
                Some(tag.to_string()),
                String::new(),
                0.0,
            ),
        }
    }

    /// Register `task` under `tag`, replacing any previous holder.
    ///
    /// `task` must belong to the same tree and must not be this node or
    /// one of its ancestors. A task moved from another parent stops
    /// contributing there.
    pub fn add_task(&self, tag: &str, task: &ProgressNode) -> Result<()> {
        if !Arc::ptr_eq(&self.tree, &task.tree) {
            return Err(Error::Validation(format!(
                "task for tag {} belongs to a different progress tree",
                tag
            )));
        }
        let mut tree = self.lock();
        if tree.is_ancestor(task.slot, self.slot) {
            return Err(Error::Validation(format!(
                "task for tag {} would create a cycle",
                tag
            )));
        }
        let already_here = tree.child(self.slot, tag) == Some(task.slot);
        if !already_here {
            tree.detach(task.slot);
            tree.attach(self.slot, tag, task.slot);
        }
        Ok(())
    }

    /// Adjust the total. Returns the change that took effect here.
    pub fn add_total(&self, diff: f64) -> f64 {
        self.lock().apply(self.slot, diff, 0.0).0
    }

    /// Adjust the count, clamped into `[0, total]`. Returns the change that took effect.
    pub fn add_count(&self, diff: f64) -> f64 {
        self.lock().apply(self.slot, 0.0, diff).1
    }

    pub fn is_completed(&self) -> bool {
        self.lock().nodes[self.slot].is_completed()
    }

    /// The node that should currently represent this one in a UI.
    ///
    /// A leaf is its own leading task. Otherwise the previously chosen
    /// child is kept while it is incomplete, then the first incomplete
    /// child in insertion order is chosen. `None` once every child is done.
    pub fn leading_task(&self, recursive: bool) -> Option<Self> {
        let mut tree = self.lock();
        let slot = tree.leading(self.slot, recursive)?;
        Some(self.handle(&mut tree, slot))
    }

    /// Leading task of the child at `tag`, if such a child exists.
    pub fn leading_task_for(&self, tag: &str) -> Option<Self> {
        let mut tree = self.lock();
        let child = tree.child(self.slot, tag)?;
        let slot = tree.leading(child, false)?;
        Some(self.handle(&mut tree, slot))
    }

    /// Advance an auto task to `now_ms`. Returns false once it needs no more ticks.
    pub fn tick(&self, now_ms: f64) -> bool {
        let live = self.lock().tick(self.slot, now_ms);
        wlog_trace!("progress tick slot={} live={}", self.slot, live);
        live
    }

    /// Snap the count to the total and stop any time-driven estimation.
    pub fn close(&self) {
        self.lock().close(self.slot);
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        self.lock().snapshot(self.slot)
    }
}

impl PartialEq for ProgressNode {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.tree, &other.tree) && self.slot == other.slot
    }
}

impl Eq for ProgressNode {}

impl fmt::Debug for ProgressNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tree = self.lock();
        let node = &tree.nodes[self.slot];
        f.debug_struct("ProgressNode")
            .field("tag", &node.tag)
            .field("total", &node.total)
            .field("count", &node.count)
            .field("children", &node.children.len())
            .finish()
    }
}

impl fmt::Display for ProgressNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(&self.snapshot()).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}
