use serde::{Deserialize, Serialize};

use crate::protocol::Progress;

pub const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressScope {
    Tool,
}

/// Out-of-band progress for one in-flight call. Not ordered against the result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub scope: ProgressScope,
    /// Namespaced tool name.
    pub tool_name: String,
    pub progress: Progress,
}

/// Lifecycle and progress notifications published by a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connected { name: String },
    Disconnected { name: String },
    Progress(ProgressEvent),
}
