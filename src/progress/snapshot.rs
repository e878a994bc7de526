use serde::{Deserialize, Serialize};

/// Structural copy of a progress subtree, for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub total: f64,
    pub count: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub tasks: Vec<TaskSnapshot>,
}

impl TaskSnapshot {
    /// Find a direct child by tag.
    pub fn task(&self, tag: &str) -> Option<&TaskSnapshot> {
        self.tasks.iter().find(|t| t.tag.as_deref() == Some(tag))
    }
}
