use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::errors::Result;
use crate::orchestrator::tool_set::ToolPolicyEntry;
use crate::tools::{ToolCallRequest, ToolDescriptor};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum ChatMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCallRequest>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage::System {
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage::User {
            content: content.into(),
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        ChatMessage::Tool {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
        }
    }

    pub fn content(&self) -> &str {
        match self {
            ChatMessage::System { content }
            | ChatMessage::User { content }
            | ChatMessage::Assistant { content, .. }
            | ChatMessage::Tool { content, .. } => content,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

impl std::ops::AddAssign for Usage {
    fn add_assign(&mut self, other: Self) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// One language-model turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelReply {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRequest>,
}

impl ModelReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCallRequest>) -> Self {
        self.tool_calls = tool_calls;
        self
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub(crate) fn to_message(&self) -> ChatMessage {
        ChatMessage::Assistant {
            content: self.content.clone(),
            tool_calls: self.tool_calls.clone(),
        }
    }
}

/// The conversation a run reads its tool policy from and writes into.
#[async_trait]
pub trait Session: Send + Sync {
    async fn append_message(&self, message: ChatMessage) -> Result<()>;
    async fn sum_usage(&self, usage: Usage) -> Result<()>;
    fn tool_policy(&self) -> Vec<ToolPolicyEntry>;
}

/// The model capability the orchestrator drives.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn invoke(&self, messages: &[ChatMessage], tools: &[ToolDescriptor]) -> Result<ModelReply>;
}

/// Session kept entirely in memory.
#[derive(Debug, Default)]
pub struct InMemorySession {
    messages: Mutex<Vec<ChatMessage>>,
    usage: Mutex<Usage>,
    policy: Vec<ToolPolicyEntry>,
}

impl InMemorySession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: Vec<ToolPolicyEntry>) -> Self {
        Self {
            policy,
            ..Default::default()
        }
    }

    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.messages.lock().await.clone()
    }

    pub async fn usage(&self) -> Usage {
        *self.usage.lock().await
    }
}

#[async_trait]
impl Session for InMemorySession {
    async fn append_message(&self, message: ChatMessage) -> Result<()> {
        self.messages.lock().await.push(message);
        Ok(())
    }

    async fn sum_usage(&self, usage: Usage) -> Result<()> {
        *self.usage.lock().await += usage;
        Ok(())
    }

    fn tool_policy(&self) -> Vec<ToolPolicyEntry> {
        self.policy.clone()
    }
}
