use thiserror::Error;

/// Errors produced by connections, the registry and the orchestrator.
#[derive(Error, Debug)]
pub enum McpRuntimeError {
    /// Handshake or transport failure while connecting.
    #[error("Connection to '{name}' failed: {reason}")]
    Connection { name: String, reason: String },
    /// Unknown connection name or unresolved tool name.
    #[error("Not registered: {0}")]
    NotRegistered(String),
    /// A connection with this name is already in the registry.
    #[error("Connection already registered: {0}")]
    AlreadyRegistered(String),
    /// The operation needs a live connection.
    #[error("Connection '{0}' is not connected")]
    NotConnected(String),
    /// The peer reported `isError` for a tool call.
    #[error("Tool '{tool_name}' failed: {message}")]
    ToolInvocation { tool_name: String, message: String },
    /// The model kept requesting tools after the last allowed round.
    #[error("Tool call limit of {0} rounds exceeded")]
    ToolCallLimitExceeded(usize),
    /// The caller's abort signal fired between rounds.
    #[error("Run aborted")]
    Aborted,
    /// A transport configuration named a kind this runtime cannot build.
    #[error("Unsupported transport kind: {0}")]
    UnsupportedTransportKind(String),
    /// JSON-RPC error object returned by the peer.
    #[error("MCP error {code}: {message}")]
    Rpc { code: i64, message: String },
    /// No response arrived within the request budget.
    #[error("Request '{0}' timed out")]
    Timeout(String),
    /// The request was cancelled, usually by a disconnect.
    #[error("Request '{0}' was cancelled")]
    Cancelled(String),
    /// Failure reading from or writing to the transport.
    #[error("Transport error: {0}")]
    Transport(String),
    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),
    /// The language-model capability failed.
    #[error("Model invocation failed: {0}")]
    Model(String),
    /// Other errors wrapped by anyhow.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, McpRuntimeError>;
