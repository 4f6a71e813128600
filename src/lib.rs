//! Connections to MCP tool providers and a bounded tool-calling loop over them.
pub mod config;
pub mod connection;
pub mod errors;
pub mod events;
pub mod loader;
pub mod orchestrator;
pub mod protocol;
pub mod registry;
pub mod tools;
pub mod transports;

pub use config::{
    CallOptions, ConnectionConfig, DotEnvLoader, ReconnectPolicy, RuntimeConfig, TransportConfig,
    VariablesLoader,
};
pub use connection::{Connection, InvokeToolRequest, SafeOutcome};
pub use errors::{McpRuntimeError, Result};
pub use events::{ConnectionEvent, ProgressEvent, ProgressScope};
pub use orchestrator::{
    ChatMessage, EnabledToolSet, InMemorySession, LanguageModel, ModelReply, Session,
    ToolCallOrchestrator, ToolPolicyEntry, Usage,
};
pub use protocol::{InitializeResult, Progress, ServerInfo};
pub use registry::ConnectionRegistry;
pub use tools::{
    Content, PromptDescriptor, PromptMessage, PromptResult, ResourceContents, ResourceDescriptor,
    ToolCallRequest, ToolCallResult, ToolDescriptor,
};
pub use transports::{DefaultTransportFactory, Transport, TransportFactory};
