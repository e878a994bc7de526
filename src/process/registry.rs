//! One [`ProcessManager`] per session, with bounded size.
//!
//! Sessions are kept in least-recently-used order. When the registry grows
//! past its capacity the oldest manager without an installed process is
//! dropped; managers that are running something are never evicted.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::mpsc;

use super::{ManagerConfig, ManagerEvent, ProcessManager, SessionId};
use crate::config::DEFAULT_MAX_MANAGERS;
use crate::error::{Error, Result};
use crate::{wlog_debug, wlog_warn};

#[derive(Default)]
struct RegistryState {
    managers: HashMap<SessionId, ProcessManager>,
    /// Oldest first.
    order: VecDeque<SessionId>,
}

impl RegistryState {
    fn touch(&mut self, session: SessionId) {
        self.order.retain(|s| *s != session);
        self.order.push_back(session);
    }
}

pub struct ManagerRegistry {
    capacity: usize,
    config: ManagerConfig,
    events: Option<mpsc::UnboundedSender<ManagerEvent>>,
    state: Mutex<RegistryState>,
}

impl ManagerRegistry {
    pub fn new(capacity: usize, config: ManagerConfig) -> Self {
        Self {
            capacity: capacity.max(1),
            config,
            events: None,
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Managers created from now on report to `tx`.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<ManagerEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state().managers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sessions from least to most recently used.
    pub fn sessions(&self) -> Vec<SessionId> {
        self.state().order.iter().copied().collect()
    }

    /// The manager for `session`, created on first use.
    pub fn manager(&self, session: SessionId) -> ProcessManager {
        let mut state = self.state();
        let manager = match state.managers.get(&session).cloned() {
            Some(existing) => existing,
            None => {
                let mut manager = ProcessManager::with_config(session, self.config.clone());
                if let Some(tx) = &self.events {
                    manager = manager.with_events(tx.clone());
                }
                state.managers.insert(session, manager.clone());
                manager
            }
        };
        state.touch(session);
        self.evict(&mut state, session);
        manager
    }

    pub fn get(&self, session: SessionId) -> Result<ProcessManager> {
        let mut state = self.state();
        let manager = state
            .managers
            .get(&session)
            .cloned()
            .ok_or_else(|| Error::SessionNotFound(session.to_string()))?;
        state.touch(session);
        Ok(manager)
    }

    /// Drop the manager for `session`, stopping whatever it runs.
    pub fn remove(&self, session: SessionId) -> Result<ProcessManager> {
        let manager = {
            let mut state = self.state();
            state.order.retain(|s| *s != session);
            state
                .managers
                .remove(&session)
                .ok_or_else(|| Error::SessionNotFound(session.to_string()))?
        };
        manager.stop();
        Ok(manager)
    }

    fn evict(&self, state: &mut RegistryState, keep: SessionId) {
        while state.managers.len() > self.capacity {
            let victim = state
                .order
                .iter()
                .copied()
                .filter(|s| *s != keep)
                .find(|s| state.managers.get(s).is_some_and(|m| !m.has_process()));
            match victim {
                Some(session) => {
                    wlog_debug!("ManagerRegistry evicting idle session {}", session.short());
                    state.managers.remove(&session);
                    state.order.retain(|s| *s != session);
                }
                None => {
                    wlog_warn!(
                        "ManagerRegistry over capacity ({} > {}), every manager is busy",
                        state.managers.len(),
                        self.capacity
                    );
                    break;
                }
            }
        }
    }
}

impl Default for ManagerRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MANAGERS, ManagerConfig::default())
    }
}
