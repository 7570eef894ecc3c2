//! Hierarchical execution identifiers used to correlate nested runs.
//!
//! An [`ExecutionInfo`] is a value threaded down the call chain. Entering a
//! named sub-unit (subgraph, scoped sub-task) produces a child with a fresh id
//! whose parent is the current id; leaving the sub-unit simply drops the child,
//! so the caller's frame is restored on every exit path.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Separator between path segments.
pub const PATH_SEPARATOR: &str = "/";

/// Dotted path of the currently active sub-unit names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionPath {
    segments: Vec<String>,
}

impl ExecutionPath {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root(name: impl Into<String>) -> Self {
        Self {
            segments: vec![name.into()],
        }
    }

    pub fn append(&mut self, segment: impl Into<String>) {
        self.segments.push(segment.into());
    }

    /// Remove the most recently appended segment. Must pair with [`append`](Self::append).
    pub fn drop_last(&mut self) -> Option<String> {
        self.segments.pop()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

impl std::fmt::Display for ExecutionPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.segments.join(PATH_SEPARATOR))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionInfo {
    pub id: String,
    pub parent_id: Option<String>,
    pub path: ExecutionPath,
}

impl ExecutionInfo {
    /// Top-level frame for an agent run.
    pub fn root(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            parent_id: None,
            path: ExecutionPath::root(name),
        }
    }

    /// Frame for a named sub-unit entered from this one.
    pub fn child(&self, name: impl Into<String>) -> Self {
        let mut path = self.path.clone();
        path.append(name);
        Self {
            id: Uuid::new_v4().to_string(),
            parent_id: Some(self.id.clone()),
            path,
        }
    }
}
