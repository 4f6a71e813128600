use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{CallOptions, ConnectionConfig};
use crate::errors::{McpRuntimeError, Result};
use crate::events::{ConnectionEvent, ProgressEvent, ProgressScope, EVENT_CHANNEL_CAPACITY};
use crate::protocol::{methods, InitializeResult, ProtocolClient, RequestOptions};
use crate::tools::{
    add_prefix, strip_prefix, PromptDescriptor, PromptResult, ResourceContents,
    ResourceDescriptor, ToolCallResult, ToolDescriptor,
};
use crate::transports::TransportFactory;

/// Result of an operation whose failure is logged rather than returned.
#[derive(Debug, Clone, PartialEq)]
pub enum SafeOutcome<T> {
    Success(T),
    Failure { reason: String },
}

impl<T> SafeOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, SafeOutcome::Success(_))
    }
}

/// Arguments for one `tools/call`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvokeToolRequest {
    pub input: Value,
    /// Token from an earlier interrupted call of the same tool.
    pub resumption_token: Option<String>,
}

impl InvokeToolRequest {
    pub fn new(input: Value) -> Self {
        Self {
            input,
            resumption_token: None,
        }
    }

    pub fn resume(mut self, token: impl Into<String>) -> Self {
        self.resumption_token = Some(token.into());
        self
    }
}

#[derive(Clone)]
struct Live {
    client: Arc<ProtocolClient>,
    cancel: CancellationToken,
    server: InitializeResult,
}

/// One named session with an MCP peer.
///
/// `connect` and `disconnect` are idempotent. Every identifier the peer exposes is
/// namespaced as `"{name}.{raw}"`; raw names never leave this type.
pub struct Connection {
    config: ConnectionConfig,
    factory: Arc<dyn TransportFactory>,
    lifecycle: Mutex<()>,
    live: RwLock<Option<Live>>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.config.name)
            .field("version", &self.config.version)
            .field("transport", &self.config.transport.kind())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Connection {
    pub fn new(config: ConnectionConfig, factory: Arc<dyn TransportFactory>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            factory,
            lifecycle: Mutex::new(()),
            live: RwLock::new(None),
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn version(&self) -> &str {
        &self.config.version
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// True while a cancellation handle is held.
    pub fn is_connected(&self) -> bool {
        self.live
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Handshake result, when connected.
    pub fn server_info(&self) -> Option<InitializeResult> {
        self.current().map(|live| live.server)
    }

    fn current(&self) -> Option<Live> {
        self.live
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn require_live(&self) -> Result<Live> {
        self.current()
            .ok_or_else(|| McpRuntimeError::NotConnected(self.config.name.clone()))
    }

    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub async fn connect(&self, options: Option<CallOptions>) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        let name = self.config.name.clone();
        let cancel = CancellationToken::new();
        let transport = self
            .factory
            .create(&self.config.transport)
            .map_err(|e| McpRuntimeError::Connection {
                name: name.clone(),
                reason: e.to_string(),
            })?;
        debug!(connection = %name, transport = transport.kind(), "Connecting");

        let client = match ProtocolClient::start(name.clone(), Arc::clone(&transport)).await {
            Ok(client) => Arc::new(client),
            Err(e) => {
                let _ = transport.close().await;
                warn!(connection = %name, error = %e, "Failed to start transport");
                return Err(McpRuntimeError::Connection {
                    name,
                    reason: e.to_string(),
                });
            }
        };

        let handshake = RequestOptions {
            call: options.unwrap_or_else(|| self.config.call_options()),
            cancel: Some(cancel.clone()),
            ..Default::default()
        };
        let server = match client
            .initialize(&self.config.name, &self.config.version, handshake)
            .await
        {
            Ok(server) => server,
            Err(e) => {
                cancel.cancel();
                if let Err(close_err) = client.close().await {
                    debug!(connection = %name, error = %close_err, "Close after failed handshake");
                }
                warn!(connection = %name, error = %e, "MCP handshake failed");
                return Err(McpRuntimeError::Connection {
                    name,
                    reason: e.to_string(),
                });
            }
        };

        info!(
            connection = %name,
            server = %server.server_info.name,
            server_version = %server.server_info.version,
            "Connected"
        );
        *self.live.write().unwrap_or_else(PoisonError::into_inner) = Some(Live {
            client,
            cancel,
            server,
        });
        self.emit(ConnectionEvent::Connected { name });
        Ok(())
    }

    /// Close the session. State becomes disconnected even if the close fails.
    pub async fn disconnect(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let taken = self
            .live
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(live) = taken else {
            return Ok(());
        };

        let closed = live.client.close().await;
        live.cancel.cancel();
        info!(connection = %self.config.name, "Disconnected");
        self.emit(ConnectionEvent::Disconnected {
            name: self.config.name.clone(),
        });
        closed
    }

    pub async fn safe_connect(&self, options: Option<CallOptions>) -> SafeOutcome<()> {
        match self.connect(options).await {
            Ok(()) => SafeOutcome::Success(()),
            Err(e) => {
                warn!(connection = %self.config.name, error = %e, "connect failed");
                SafeOutcome::Failure {
                    reason: e.to_string(),
                }
            }
        }
    }

    pub async fn safe_disconnect(&self) -> SafeOutcome<()> {
        match self.disconnect().await {
            Ok(()) => SafeOutcome::Success(()),
            Err(e) => {
                warn!(connection = %self.config.name, error = %e, "disconnect failed");
                SafeOutcome::Failure {
                    reason: e.to_string(),
                }
            }
        }
    }

    fn request_options(&self, live: &Live, options: Option<CallOptions>) -> RequestOptions {
        RequestOptions {
            call: options.unwrap_or_else(|| self.config.call_options()),
            cancel: Some(live.cancel.clone()),
            ..Default::default()
        }
    }

    /// Fetch every page of a list method.
    async fn list_all<T: DeserializeOwned>(
        &self,
        method: &str,
        capability: &str,
        key: &str,
    ) -> Result<Vec<T>> {
        let live = self.require_live()?;
        if !live.server.supports(capability) {
            debug!(connection = %self.config.name, capability, "Peer does not advertise capability");
            return Ok(Vec::new());
        }

        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = match &cursor {
                Some(cursor) => json!({ "cursor": cursor }),
                None => json!({}),
            };
            let outcome = live
                .client
                .request(method, params, self.request_options(&live, None))
                .await?;
            let page = outcome
                .result
                .get(key)
                .cloned()
                .unwrap_or_else(|| Value::Array(Vec::new()));
            let page: Vec<T> = serde_json::from_value(page).map_err(|e| {
                McpRuntimeError::Transport(format!("invalid {method} result: {e}"))
            })?;
            items.extend(page);

            cursor = outcome
                .result
                .get("nextCursor")
                .and_then(Value::as_str)
                .filter(|next| !next.is_empty())
                .map(str::to_string);
            if cursor.is_none() {
                break;
            }
        }
        Ok(items)
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        let tools: Vec<ToolDescriptor> = self
            .list_all(methods::TOOLS_LIST, "tools", "tools")
            .await?;
        Ok(tools
            .into_iter()
            .map(|tool| tool.namespaced(&self.config.name))
            .collect())
    }

    pub async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>> {
        let resources: Vec<ResourceDescriptor> = self
            .list_all(methods::RESOURCES_LIST, "resources", "resources")
            .await?;
        Ok(resources
            .into_iter()
            .map(|resource| resource.namespaced(&self.config.name))
            .collect())
    }

    pub async fn list_prompts(&self) -> Result<Vec<PromptDescriptor>> {
        let prompts: Vec<PromptDescriptor> = self
            .list_all(methods::PROMPTS_LIST, "prompts", "prompts")
            .await?;
        Ok(prompts
            .into_iter()
            .map(|prompt| prompt.namespaced(&self.config.name))
            .collect())
    }

    /// Call a tool by its namespaced (or raw) name.
    ///
    /// Progress reported by the peer is published as [`ConnectionEvent::Progress`].
    /// Disconnecting while the call is in flight cancels it.
    pub async fn invoke_tool(
        &self,
        tool_name: &str,
        request: InvokeToolRequest,
        options: Option<CallOptions>,
    ) -> Result<ToolCallResult> {
        let live = self.require_live()?;
        let raw_name = strip_prefix(&self.config.name, tool_name);
        let exposed_name = add_prefix(&self.config.name, raw_name);

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let events = self.events.clone();
        let progress_name = exposed_name.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(progress) = progress_rx.recv().await {
                let _ = events.send(ConnectionEvent::Progress(ProgressEvent {
                    scope: ProgressScope::Tool,
                    tool_name: progress_name.clone(),
                    progress,
                }));
            }
        });

        let mut request_options = self.request_options(&live, options);
        request_options.on_progress = Some(progress_tx);
        request_options.resumption_token = request.resumption_token;

        debug!(connection = %self.config.name, tool = raw_name, "Invoking tool");
        let params = json!({ "name": raw_name, "arguments": request.input });
        let outcome = live
            .client
            .request(methods::TOOLS_CALL, params, request_options)
            .await;
        // The sender went away with the request options, so this drains and ends.
        let _ = forwarder.await;
        let outcome = outcome?;

        let mut result: ToolCallResult = serde_json::from_value(outcome.result).map_err(|e| {
            McpRuntimeError::Transport(format!("invalid tools/call result for {exposed_name}: {e}"))
        })?;
        result.resumption_token = outcome.resumption_token;
        Ok(result)
    }

    pub async fn get_resource(&self, uri: &str) -> Result<Vec<ResourceContents>> {
        let live = self.require_live()?;
        let raw_uri = strip_prefix(&self.config.name, uri);
        let outcome = live
            .client
            .request(
                methods::RESOURCES_READ,
                json!({ "uri": raw_uri }),
                self.request_options(&live, None),
            )
            .await?;
        let contents: Vec<ResourceContents> = serde_json::from_value(
            outcome
                .result
                .get("contents")
                .cloned()
                .unwrap_or_else(|| Value::Array(Vec::new())),
        )
        .map_err(|e| McpRuntimeError::Transport(format!("invalid resources/read result: {e}")))?;
        Ok(contents
            .into_iter()
            .map(|mut item| {
                item.uri = add_prefix(&self.config.name, &item.uri);
                item
            })
            .collect())
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: HashMap<String, String>,
    ) -> Result<PromptResult> {
        let live = self.require_live()?;
        let raw_name = strip_prefix(&self.config.name, name);
        let outcome = live
            .client
            .request(
                methods::PROMPTS_GET,
                json!({ "name": raw_name, "arguments": arguments }),
                self.request_options(&live, None),
            )
            .await?;
        serde_json::from_value(outcome.result)
            .map_err(|e| McpRuntimeError::Transport(format!("invalid prompts/get result: {e}")))
    }

    /// Short description of the peer suitable for a model's system prompt.
    pub fn description_for_llm(&self) -> String {
        let mut description = format!("MCP server '{}'", self.config.name);
        if let Some(server) = self.server_info() {
            let info = &server.server_info;
            if !info.name.is_empty() {
                description.push_str(&format!(" ({} {})", info.name, info.version));
            }
            if let Some(instructions) = server.instructions.filter(|i| !i.trim().is_empty()) {
                description.push_str(": ");
                description.push_str(instructions.trim());
            }
        }
        description
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::transports::memory::{InMemoryPeer, InMemoryTransport};
    use crate::transports::Transport;
    use std::sync::Mutex as StdMutex;

    /// Hands out pre-built in-memory transports, one per `create`.
    struct QueuedFactory {
        transports: StdMutex<Vec<Arc<dyn Transport>>>,
    }

    impl TransportFactory for QueuedFactory {
        fn create(&self, config: &TransportConfig) -> Result<Arc<dyn Transport>> {
            self.transports
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| McpRuntimeError::UnsupportedTransportKind(config.kind().into()))
        }
    }

    fn connection_with_peer() -> (Connection, InMemoryPeer) {
        let (transport, peer) = InMemoryTransport::pair();
        let factory = QueuedFactory {
            transports: StdMutex::new(vec![Arc::new(transport)]),
        };
        let config = ConnectionConfig::new("calc", TransportConfig::process_pipe("calc", vec![]));
        (Connection::new(config, Arc::new(factory)), peer)
    }

    async fn answer_handshake(peer: &mut InMemoryPeer) {
        let init = peer.recv().await.unwrap().message;
        assert_eq!(init["method"], "initialize");
        assert_eq!(init["params"]["protocolVersion"], "2025-06-18");
        assert_eq!(init["params"]["clientInfo"]["name"], "calc");
        assert_eq!(init["params"]["clientInfo"]["version"], "1.0.0");
        peer.send(json!({
            "jsonrpc": "2.0",
            "id": init["id"],
            "result": {
                "protocolVersion": "2025-06-18",
                "capabilities": { "tools": {} },
                "serverInfo": { "name": "calc-server", "version": "0.2.0" },
                "instructions": "Arithmetic only."
            }
        }))
        .unwrap();
        let initialized = peer.recv().await.unwrap().message;
        assert_eq!(initialized["method"], "notifications/initialized");
    }

    #[tokio::test]
    async fn connect_handshakes_and_reports_server() {
        let (connection, mut peer) = connection_with_peer();
        let mut events = connection.subscribe();
        let server = tokio::spawn(async move {
            answer_handshake(&mut peer).await;
            peer
        });

        connection.connect(None).await.unwrap();
        let _peer = server.await.unwrap();
        assert!(connection.is_connected());
        assert_eq!(
            events.recv().await.unwrap(),
            ConnectionEvent::Connected {
                name: "calc".into()
            }
        );
        assert_eq!(
            connection.description_for_llm(),
            "MCP server 'calc' (calc-server 0.2.0): Arithmetic only."
        );

        // Second connect is a no-op: the factory has nothing left to hand out.
        connection.connect(None).await.unwrap();
    }

    #[tokio::test]
    async fn failed_handshake_leaves_connection_disconnected() {
        let (connection, mut peer) = connection_with_peer();
        tokio::spawn(async move {
            let init = peer.recv().await.unwrap().message;
            peer.send(json!({
                "jsonrpc": "2.0",
                "id": init["id"],
                "error": { "code": -32603, "message": "boot failure" }
            }))
            .unwrap();
            peer
        });

        let err = connection.connect(None).await.unwrap_err();
        assert!(matches!(err, McpRuntimeError::Connection { ref name, .. } if name == "calc"));
        assert!(!connection.is_connected());
        assert!(matches!(
            connection.safe_connect(None).await,
            SafeOutcome::Failure { .. }
        ));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_emits_once() {
        let (connection, mut peer) = connection_with_peer();
        let server = tokio::spawn(async move {
            answer_handshake(&mut peer).await;
            peer
        });
        connection.connect(None).await.unwrap();
        let peer = server.await.unwrap();

        let mut events = connection.subscribe();
        connection.disconnect().await.unwrap();
        assert!(!connection.is_connected());
        assert!(peer.is_closed());
        assert_eq!(
            connection.safe_disconnect().await,
            SafeOutcome::Success(())
        );
        assert_eq!(
            events.recv().await.unwrap(),
            ConnectionEvent::Disconnected {
                name: "calc".into()
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn operations_require_a_live_session() {
        let (connection, _peer) = connection_with_peer();
        let err = connection
            .invoke_tool("calc.add", InvokeToolRequest::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, McpRuntimeError::NotConnected(ref name) if name == "calc"));
        assert_eq!(connection.description_for_llm(), "MCP server 'calc'");
    }

    #[tokio::test]
    async fn list_tools_follows_cursors_and_namespaces() {
        let (connection, mut peer) = connection_with_peer();
        let server = tokio::spawn(async move {
            answer_handshake(&mut peer).await;
            let first = peer.recv().await.unwrap().message;
            assert_eq!(first["params"], json!({}));
            peer.send(json!({
                "jsonrpc": "2.0",
                "id": first["id"],
                "result": { "tools": [{ "name": "add" }], "nextCursor": "page-2" }
            }))
            .unwrap();
            let second = peer.recv().await.unwrap().message;
            assert_eq!(second["params"]["cursor"], "page-2");
            peer.send(json!({
                "jsonrpc": "2.0",
                "id": second["id"],
                "result": { "tools": [{ "name": "sub", "description": "Subtract" }] }
            }))
            .unwrap();
            peer
        });

        connection.connect(None).await.unwrap();
        let tools = connection.list_tools().await.unwrap();
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["calc.add", "calc.sub"]);
        // Not advertised, so no round trip.
        assert!(connection.list_prompts().await.unwrap().is_empty());
        server.await.unwrap();
    }
}
