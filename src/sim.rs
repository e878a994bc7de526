//! In-process deployments for local runs and tests.
//!
//! A [`SimDeployment`] answers every update after a fixed latency with one
//! output line per command. It can be told to fail, either on every call
//! or from a given call onwards.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::process::{Command, Deployment, NodeId, UpdateResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    Never,
    Always,
    /// Fail the n-th call (1-based) and every call after it.
    FromCall(u64),
}

#[derive(Debug)]
pub struct SimDeployment {
    node: NodeId,
    latency: Duration,
    failure: FailureMode,
    calls: AtomicU64,
}

impl SimDeployment {
    pub fn new(node: impl Into<NodeId>) -> Self {
        Self {
            node: node.into(),
            latency: Duration::ZERO,
            failure: FailureMode::Never,
            calls: AtomicU64::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn failing(mut self, mode: FailureMode) -> Self {
        self.failure = mode;
        self
    }

    /// Number of updates received so far, failed ones included.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn should_fail(&self, call: u64) -> bool {
        match self.failure {
            FailureMode::Never => false,
            FailureMode::Always => true,
            FailureMode::FromCall(n) => call >= n,
        }
    }
}

fn describe(command: &Command) -> String {
    match command {
        Command::Exec { executable, args } | Command::Start { executable, args } => {
            if args.is_empty() {
                executable.clone()
            } else {
                format!("{} {}", executable, args.join(" "))
            }
        }
        Command::Stop { child_id } => format!("stopped {}", child_id),
        Command::Wait => "waited".to_string(),
        Command::AddTags(tags) => format!("tagged {}", tags.join(",")),
        Command::DelTags(tags) => format!("untagged {}", tags.join(",")),
        Command::DownloadFile { file_path, .. } => format!("downloaded {}", file_path),
        Command::UploadFile { file_path, .. } => format!("uploaded {}", file_path),
        Command::WriteFile { file_path, .. } => format!("wrote {}", file_path),
    }
}

#[async_trait]
impl Deployment for SimDeployment {
    fn node_id(&self) -> &NodeId {
        &self.node
    }

    async fn update(&self, commands: &[Command]) -> Result<UpdateResult> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.should_fail(call) {
            return Err(Error::deployment(
                &self.node,
                format!("simulated failure on call {}", call),
            ));
        }
        Ok(commands.iter().map(describe).collect())
    }
}
