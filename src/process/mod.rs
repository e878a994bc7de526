//! Distributed work loops.
//!
//! A [`Process`] produces units of [`Work`]; a [`ProcessManager`] fans those
//! out over a set of [`Deployment`]s, feeds each deployment's result back
//! into the process and keeps at most one process active per session.

mod batch;
mod manager;
mod registry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

pub use batch::{BatchProcess, DEFAULT_MAX_ATTEMPTS};
pub use manager::{ManagerConfig, ManagerEvent, NodeFailure, ProcessManager, RunOutcome};
pub use registry::ManagerRegistry;

/// Identifier of a remote node, used as a counter key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(&self.0)
    }
}

/// Identifier of the logical session a manager belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// A command executed inside a remote deployment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Command {
    Exec {
        executable: String,
        args: Vec<String>,
    },
    Start {
        executable: String,
        args: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Stop {
        child_id: String,
    },
    Wait,
    AddTags(Vec<String>),
    DelTags(Vec<String>),
    #[serde(rename_all = "camelCase")]
    DownloadFile {
        uri: String,
        file_path: String,
    },
    #[serde(rename_all = "camelCase")]
    UploadFile {
        uri: String,
        file_path: String,
    },
    #[serde(rename_all = "camelCase")]
    WriteFile {
        content: String,
        file_path: String,
    },
}

impl Command {
    pub fn exec(executable: &str, args: &[&str]) -> Self {
        Command::Exec {
            executable: executable.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// Output lines returned by a deployment update.
pub type UpdateResult = Vec<String>;

/// One round trip worth of commands produced by a process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Work {
    pub id: u64,
    pub commands: Vec<Command>,
}

impl Work {
    pub fn new(id: u64, commands: Vec<Command>) -> Self {
        Self { id, commands }
    }
}

/// A slot of remote execution capacity on one node.
#[async_trait]
pub trait Deployment: Send + Sync {
    fn node_id(&self) -> &NodeId;

    /// Run `commands` remotely. Retries and deadlines are the caller's concern.
    async fn update(&self, commands: &[Command]) -> Result<UpdateResult>;
}

/// A pluggable source of work for a [`ProcessManager`].
///
/// The manager relies on nothing beyond these methods.
#[async_trait]
pub trait Process: Send + Sync {
    /// Next unit of work, or `None` when this process has nothing left to hand out.
    async fn create_work(&self) -> Option<Work>;

    /// Fold a deployment's result back into the process.
    fn add_result(&self, work: Work, result: UpdateResult);

    /// A unit whose update failed. Called only while the process is still active.
    fn add_failure(&self, _work: Work, _error: &Error) {}

    /// Completion in percent (0 to 100).
    fn progress(&self) -> f64;

    fn is_active(&self) -> bool;

    /// Request cancellation.
    fn stop(&self);

    fn name(&self) -> &str {
        "process"
    }
}
