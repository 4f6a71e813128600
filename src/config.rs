use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::McpRuntimeError;

/// Default per-request budget, matching the MCP reference clients.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_TOOL_CALL_COUNT: usize = 3;

/// How to reach one MCP peer. The variant decides which fields matter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Spawn a local process and speak newline-delimited JSON over its pipes.
    #[serde(alias = "stdio")]
    ProcessPipe {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        working_dir: Option<PathBuf>,
    },
    /// Streamable HTTP: POST per message, JSON or SSE responses.
    #[serde(alias = "streamable_http", alias = "http")]
    HttpStreaming {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        reconnect_policy: ReconnectPolicy,
    },
    #[serde(alias = "websocket")]
    WebSocket { url: String },
    /// Legacy HTTP+SSE: a GET event stream plus a POST endpoint it announces.
    #[serde(alias = "sse")]
    ServerSentEvents {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

impl TransportConfig {
    const KNOWN_KINDS: &'static [&'static str] = &[
        "process_pipe",
        "stdio",
        "http_streaming",
        "streamable_http",
        "http",
        "web_socket",
        "websocket",
        "server_sent_events",
        "sse",
    ];

    /// Parse a transport block, reporting unknown `type` tags as
    /// [`McpRuntimeError::UnsupportedTransportKind`] rather than a serde error.
    pub fn from_value(value: Value) -> crate::errors::Result<Self> {
        let kind = value
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| McpRuntimeError::Config("transport is missing a 'type' tag".into()))?;
        if !Self::KNOWN_KINDS.contains(&kind) {
            return Err(McpRuntimeError::UnsupportedTransportKind(kind.to_string()));
        }
        serde_json::from_value(value).map_err(|e| McpRuntimeError::Config(e.to_string()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TransportConfig::ProcessPipe { .. } => "process_pipe",
            TransportConfig::HttpStreaming { .. } => "http_streaming",
            TransportConfig::WebSocket { .. } => "web_socket",
            TransportConfig::ServerSentEvents { .. } => "server_sent_events",
        }
    }

    pub fn process_pipe(command: impl Into<String>, args: Vec<String>) -> Self {
        TransportConfig::ProcessPipe {
            command: command.into(),
            args,
            env: HashMap::new(),
            working_dir: None,
        }
    }

    pub fn http_streaming(url: impl Into<String>) -> Self {
        TransportConfig::HttpStreaming {
            url: url.into(),
            headers: HashMap::new(),
            reconnect_policy: ReconnectPolicy::default(),
        }
    }
}

/// Backoff used when an HTTP streaming response is interrupted mid-stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub growth_factor: f64,
    pub max_retries: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            growth_factor: 1.5,
            max_retries: 2,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given (zero-based) reconnection attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.growth_factor.max(1.0).powi(attempt as i32);
        let delay = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(delay as u64)
    }
}

/// Per-call time budget.
#[derive(Debug, Clone, PartialEq)]
pub struct CallOptions {
    /// Silence allowed before the request fails.
    pub timeout: Option<Duration>,
    /// Absolute cap, only meaningful when progress resets `timeout`.
    pub max_total_timeout: Option<Duration>,
    pub reset_timeout_on_progress: bool,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            timeout: Some(DEFAULT_REQUEST_TIMEOUT),
            max_total_timeout: None,
            reset_timeout_on_progress: false,
        }
    }
}

impl CallOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_total_timeout(mut self, max_total: Duration) -> Self {
        self.max_total_timeout = Some(max_total);
        self.reset_timeout_on_progress = true;
        self
    }
}

fn default_version() -> String {
    "1.0.0".to_string()
}

/// Everything needed to build and connect one [`crate::connection::Connection`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub transport: TransportConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_total_timeout_ms: Option<u64>,
}

impl ConnectionConfig {
    pub fn new(name: impl Into<String>, transport: TransportConfig) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            transport,
            timeout_ms: None,
            max_total_timeout_ms: None,
        }
    }

    /// Budget applied to the handshake and, unless overridden, to every call.
    pub fn call_options(&self) -> CallOptions {
        let mut options = CallOptions::default();
        if let Some(ms) = self.timeout_ms {
            options.timeout = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = self.max_total_timeout_ms {
            options = options.with_max_total_timeout(Duration::from_millis(ms));
        }
        options
    }
}

#[async_trait]
pub trait VariablesLoader: Send + Sync {
    async fn load(&self) -> Result<HashMap<String, String>>;
    async fn get(&self, key: &str) -> Result<String>;
}

#[derive(Clone)]
pub struct RuntimeConfig {
    pub variables: HashMap<String, String>,
    pub connections_file_path: Option<PathBuf>,
    pub load_variables_from: Vec<Arc<dyn VariablesLoader>>,
    pub max_tool_call_count: usize,
    /// Budget for tool invocations issued by the orchestrator; `None` defers
    /// to each connection's own budget.
    pub tool_call_options: Option<CallOptions>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            variables: HashMap::new(),
            connections_file_path: None,
            load_variables_from: Vec::new(),
            max_tool_call_count: DEFAULT_MAX_TOOL_CALL_COUNT,
            tool_call_options: None,
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connections_file(mut self, path: PathBuf) -> Self {
        self.connections_file_path = Some(path);
        self
    }

    pub fn with_variable(mut self, key: String, value: String) -> Self {
        self.variables.insert(key, value);
        self
    }

    pub fn with_variables(mut self, vars: HashMap<String, String>) -> Self {
        self.variables.extend(vars);
        self
    }

    pub fn with_variables_loader(mut self, loader: Arc<dyn VariablesLoader>) -> Self {
        self.load_variables_from.push(loader);
        self
    }

    pub fn with_max_tool_call_count(mut self, count: usize) -> Self {
        self.max_tool_call_count = count;
        self
    }

    pub fn with_tool_call_options(mut self, options: CallOptions) -> Self {
        self.tool_call_options = Some(options);
        self
    }

    pub async fn get_variable(&self, key: &str) -> Option<String> {
        if let Some(val) = self.variables.get(key) {
            return Some(val.clone());
        }

        for loader in &self.load_variables_from {
            if let Ok(val) = loader.get(key).await {
                return Some(val);
            }
        }

        std::env::var(key).ok()
    }
}

/// Reads `KEY=value` pairs from a dotenv-style file.
pub struct DotEnvLoader {
    file_path: PathBuf,
}

impl DotEnvLoader {
    pub fn new(file_path: PathBuf) -> Self {
        Self { file_path }
    }
}

#[async_trait]
impl VariablesLoader for DotEnvLoader {
    async fn load(&self) -> Result<HashMap<String, String>> {
        let contents = tokio::fs::read_to_string(&self.file_path).await?;
        let mut vars = HashMap::new();

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                vars.insert(
                    key.trim().to_string(),
                    value.trim().trim_matches('"').to_string(),
                );
            }
        }

        Ok(vars)
    }

    async fn get(&self, key: &str) -> Result<String> {
        let vars = self.load().await?;
        vars.get(key)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Variable {} not found", key))
    }
}
