//! Bounded model/tool loop on top of a [`ConnectionRegistry`].
pub mod session;
pub mod tool_set;

pub use session::{ChatMessage, InMemorySession, LanguageModel, ModelReply, Session, Usage};
pub use tool_set::{EnabledToolSet, ToolPolicyEntry};

use futures::future::try_join_all;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{CallOptions, RuntimeConfig, DEFAULT_MAX_TOOL_CALL_COUNT};
use crate::connection::{Connection, InvokeToolRequest};
use crate::errors::{McpRuntimeError, Result};
use crate::registry::ConnectionRegistry;
use crate::tools::{ToolCallRequest, ToolCallResult};

pub struct ToolCallOrchestrator {
    registry: Arc<ConnectionRegistry>,
    model: Arc<dyn LanguageModel>,
    max_tool_call_count: usize,
    /// Overrides each connection's own budget when set.
    call_options: Option<CallOptions>,
}

impl ToolCallOrchestrator {
    pub fn new(registry: Arc<ConnectionRegistry>, model: Arc<dyn LanguageModel>) -> Self {
        Self {
            registry,
            model,
            max_tool_call_count: DEFAULT_MAX_TOOL_CALL_COUNT,
            call_options: None,
        }
    }

    pub fn from_config(
        registry: Arc<ConnectionRegistry>,
        model: Arc<dyn LanguageModel>,
        config: &RuntimeConfig,
    ) -> Self {
        let orchestrator =
            Self::new(registry, model).with_max_tool_call_count(config.max_tool_call_count);
        match &config.tool_call_options {
            Some(options) => orchestrator.with_call_options(options.clone()),
            None => orchestrator,
        }
    }

    pub fn with_max_tool_call_count(mut self, count: usize) -> Self {
        self.max_tool_call_count = count;
        self
    }

    pub fn with_call_options(mut self, options: CallOptions) -> Self {
        self.call_options = Some(options);
        self
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Drive the model until it stops asking for tools.
    ///
    /// Returns `messages` followed by every assistant reply and tool result of
    /// the run; the same replies and results are appended to `session`. Fails
    /// with [`McpRuntimeError::ToolCallLimitExceeded`] when the model still
    /// wants tools after `max_tool_call_count` rounds.
    pub async fn run(
        &self,
        session: &dyn Session,
        messages: Vec<ChatMessage>,
        abort: Option<&CancellationToken>,
    ) -> Result<Vec<ChatMessage>> {
        let tool_set = EnabledToolSet::resolve(&self.registry, &session.tool_policy()).await?;
        debug!(tools = tool_set.len(), "Resolved enabled tools");

        let mut buffer = messages;
        let mut reply = self.ask_model(session, &mut buffer, &tool_set).await?;

        for round in 0..self.max_tool_call_count {
            if reply.tool_calls.is_empty() {
                return Ok(buffer);
            }
            if abort.is_some_and(CancellationToken::is_cancelled) {
                info!(round, "Run aborted");
                return Err(McpRuntimeError::Aborted);
            }

            let calls = self.resolve_calls(&tool_set, &reply.tool_calls).await?;
            debug!(round, calls = calls.len(), "Executing tool calls");
            let results = try_join_all(
                calls
                    .into_iter()
                    .map(|(call, connection)| self.execute(call, connection)),
            )
            .await?;

            for (call, result) in results {
                let message = ChatMessage::tool(call.tool_call_id.clone(), result.rendered());
                session.append_message(message.clone()).await?;
                buffer.push(message);
            }

            reply = self.ask_model(session, &mut buffer, &tool_set).await?;
        }

        if reply.tool_calls.is_empty() {
            return Ok(buffer);
        }
        Err(McpRuntimeError::ToolCallLimitExceeded(
            self.max_tool_call_count,
        ))
    }

    async fn ask_model(
        &self,
        session: &dyn Session,
        buffer: &mut Vec<ChatMessage>,
        tool_set: &EnabledToolSet,
    ) -> Result<ModelReply> {
        let reply = self.model.invoke(buffer.as_slice(), tool_set.descriptors()).await?;
        let message = reply.to_message();
        session.append_message(message.clone()).await?;
        buffer.push(message);
        if let Some(usage) = reply.usage {
            session.sum_usage(usage).await?;
        }
        Ok(reply)
    }

    /// Map every call to its connection before anything runs.
    async fn resolve_calls<'a>(
        &self,
        tool_set: &EnabledToolSet,
        calls: &'a [ToolCallRequest],
    ) -> Result<Vec<(&'a ToolCallRequest, Arc<Connection>)>> {
        let mut resolved = Vec::with_capacity(calls.len());
        for call in calls {
            let owner = tool_set
                .owner_of(&call.tool_name)
                .ok_or_else(|| McpRuntimeError::NotRegistered(call.tool_name.clone()))?;
            let connection = self
                .registry
                .get(owner)
                .await
                .ok_or_else(|| McpRuntimeError::NotRegistered(call.tool_name.clone()))?;
            resolved.push((call, connection));
        }
        Ok(resolved)
    }

    async fn execute<'a>(
        &self,
        call: &'a ToolCallRequest,
        connection: Arc<Connection>,
    ) -> Result<(&'a ToolCallRequest, ToolCallResult)> {
        let result = connection
            .invoke_tool(
                &call.tool_name,
                InvokeToolRequest::new(call.arguments.clone()),
                self.call_options.clone(),
            )
            .await?;
        if result.is_error {
            return Err(McpRuntimeError::ToolInvocation {
                tool_name: call.tool_name.clone(),
                message: result.first_error_content(),
            });
        }
        Ok((call, result))
    }
}
