use thiserror::Error;

use crate::process::NodeId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Deployment update failed on {node}: {}", messages.join("; "))]
    Deployment { node: NodeId, messages: Vec<String> },

    #[error("Session not found: {0}")]
    SessionNotFound(String),
}

impl Error {
    /// Build a deployment failure from a single message.
    pub fn deployment(node: &NodeId, message: impl Into<String>) -> Self {
        Error::Deployment {
            node: node.clone(),
            messages: vec![message.into()],
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
