use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::payload::Payload;
use waypoint_core::types::ChatMessage;

/// A resumable snapshot: the node to restart at, its input and the message
/// history at that point. Persisting it is up to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCheckpoint {
    pub checkpoint_id: String,
    pub created_at: DateTime<Utc>,
    /// Node the walk resumes at.
    pub node_id: String,
    /// Input that node receives on resume.
    pub last_input: Payload,
    pub message_history: Vec<ChatMessage>,
}

impl AgentCheckpoint {
    pub fn new(node_id: impl Into<String>, last_input: Payload, message_history: Vec<ChatMessage>) -> Self {
        Self {
            checkpoint_id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            node_id: node_id.into(),
            last_input,
            message_history,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| WaypointError::Checkpoint(format!("serialize: {}", e)))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| WaypointError::Checkpoint(format!("deserialize: {}", e)))
    }
}
