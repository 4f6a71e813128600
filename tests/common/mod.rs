#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::{json, Value};

use mcp_runtime::transports::memory::{InMemoryPeer, InMemoryTransport, Outbound};
use mcp_runtime::transports::SendOptions;
use mcp_runtime::{
    ChatMessage, ConnectionConfig, LanguageModel, McpRuntimeError, ModelReply, ToolDescriptor,
    Transport, TransportConfig, TransportFactory,
};

/// How the fake server answers one `tools/call`.
#[derive(Clone)]
pub enum Reply {
    Result(Value),
    /// Progress notifications first, then the result.
    WithProgress { steps: Vec<f64>, result: Value },
    /// Never answer.
    Never,
}

pub fn text_result(text: &str) -> Value {
    json!({ "content": [{ "type": "text", "text": text }], "isError": false })
}

pub fn error_result(text: &str) -> Value {
    json!({ "content": [{ "type": "text", "text": text }], "isError": true })
}

type Handler = Arc<dyn Fn(&Value) -> Reply + Send + Sync>;

/// A scripted MCP peer speaking over an in-memory transport.
#[derive(Clone)]
pub struct FakeServer {
    pub name: String,
    tools: Vec<(Value, Handler)>,
    /// Every message the client sent, in order.
    pub received: Arc<Mutex<Vec<Outbound>>>,
    pub initialize_count: Arc<AtomicUsize>,
    pub fail_handshake: bool,
    pub fail_close: bool,
}

impl FakeServer {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tools: Vec::new(),
            received: Arc::new(Mutex::new(Vec::new())),
            initialize_count: Arc::new(AtomicUsize::new(0)),
            fail_handshake: false,
            fail_close: false,
        }
    }

    pub fn tool<F>(mut self, name: &str, description: &str, handler: F) -> Self
    where
        F: Fn(&Value) -> Reply + Send + Sync + 'static,
    {
        let descriptor = json!({
            "name": name,
            "description": description,
            "inputSchema": { "type": "object" }
        });
        self.tools.push((descriptor, Arc::new(handler)));
        self
    }

    pub fn failing_handshake(mut self) -> Self {
        self.fail_handshake = true;
        self
    }

    pub fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    pub fn calls(&self) -> Vec<Value> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter(|o| o.message["method"] == "tools/call")
            .map(|o| o.message.clone())
            .collect()
    }

    pub fn received_methods(&self) -> Vec<String> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter_map(|o| o.message["method"].as_str().map(str::to_string))
            .collect()
    }

    /// Poll until some received message matches.
    pub async fn wait_for<P>(&self, predicate: P) -> Outbound
    where
        P: Fn(&Outbound) -> bool,
    {
        for _ in 0..200 {
            let found = self
                .received
                .lock()
                .unwrap()
                .iter()
                .find(|o| predicate(o))
                .cloned();
            if let Some(found) = found {
                return found;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("fake server '{}' never received the expected message", self.name);
    }

    async fn serve(self, mut peer: InMemoryPeer) {
        let mut event_seq = 0u32;
        let mut next_event = || {
            event_seq += 1;
            Some(format!("ev-{event_seq}"))
        };

        while let Some(outbound) = peer.recv().await {
            self.received.lock().unwrap().push(outbound.clone());
            let message = outbound.message;
            let Some(method) = message["method"].as_str() else {
                continue;
            };
            let id = message["id"].clone();

            let reply = match method {
                "initialize" => {
                    self.initialize_count.fetch_add(1, Ordering::SeqCst);
                    if self.fail_handshake {
                        json!({ "jsonrpc": "2.0", "id": id, "error": { "code": -32603, "message": "boot failure" } })
                    } else {
                        json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "result": {
                                "protocolVersion": "2025-06-18",
                                "capabilities": { "tools": {} },
                                "serverInfo": { "name": format!("{}-server", self.name), "version": "1.0.0" }
                            }
                        })
                    }
                }
                "tools/list" => {
                    let tools: Vec<Value> = self.tools.iter().map(|(d, _)| d.clone()).collect();
                    json!({ "jsonrpc": "2.0", "id": id, "result": { "tools": tools } })
                }
                "tools/call" => {
                    let params = &message["params"];
                    let tool = params["name"].as_str().unwrap_or_default();
                    let handler = self
                        .tools
                        .iter()
                        .find(|(d, _)| d["name"] == tool)
                        .map(|(_, h)| Arc::clone(h));
                    let Some(handler) = handler else {
                        let _ = peer.send(json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "result": error_result(&format!("Unknown tool: {tool}"))
                        }));
                        continue;
                    };
                    match handler(&params["arguments"]) {
                        Reply::Result(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
                        Reply::WithProgress { steps, result } => {
                            let token = params["_meta"]["progressToken"].clone();
                            for step in steps {
                                let _ = peer.send_with_event_id(
                                    json!({
                                        "jsonrpc": "2.0",
                                        "method": "notifications/progress",
                                        "params": { "progressToken": token, "progress": step, "total": 1.0 }
                                    }),
                                    next_event(),
                                );
                            }
                            let _ = peer.send_with_event_id(
                                json!({ "jsonrpc": "2.0", "id": id, "result": result }),
                                next_event(),
                            );
                            continue;
                        }
                        Reply::Never => continue,
                    }
                }
                _ if id.is_null() => continue,
                other => json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": { "code": -32601, "message": format!("Method not found: {other}") }
                }),
            };
            if peer.send(reply).is_err() {
                break;
            }
        }
    }
}

/// In-memory transport whose `close` reports failure after closing.
struct FailingClose(InMemoryTransport);

#[async_trait]
impl Transport for FailingClose {
    async fn start(&self) -> anyhow::Result<mcp_runtime::transports::InboundReceiver> {
        self.0.start().await
    }

    async fn send(&self, message: Value, options: SendOptions) -> anyhow::Result<()> {
        self.0.send(message, options).await
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.0.close().await?;
        Err(anyhow!("close failed"))
    }

    fn kind(&self) -> &'static str {
        "in_memory"
    }
}

/// Routes process-pipe configs to fake servers keyed by command.
#[derive(Clone, Default)]
pub struct FakeFactory {
    servers: Arc<Mutex<HashMap<String, FakeServer>>>,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, server: FakeServer) -> Self {
        self.servers
            .lock()
            .unwrap()
            .insert(server.name.clone(), server);
        self
    }

    pub fn server(&self, name: &str) -> FakeServer {
        self.servers.lock().unwrap()[name].clone()
    }
}

impl TransportFactory for FakeFactory {
    fn create(&self, config: &TransportConfig) -> mcp_runtime::Result<Arc<dyn Transport>> {
        let TransportConfig::ProcessPipe { command, .. } = config else {
            return Err(McpRuntimeError::UnsupportedTransportKind(config.kind().to_string()));
        };
        let server = self
            .servers
            .lock()
            .unwrap()
            .get(command)
            .cloned()
            .ok_or_else(|| McpRuntimeError::Config(format!("no fake server named {command}")))?;

        let (transport, peer) = InMemoryTransport::pair();
        let fail_close = server.fail_close;
        tokio::spawn(server.serve(peer));
        if fail_close {
            Ok(Arc::new(FailingClose(transport)))
        } else {
            Ok(Arc::new(transport))
        }
    }
}

pub fn config(name: &str) -> ConnectionConfig {
    ConnectionConfig::new(name, TransportConfig::process_pipe(name, vec![]))
}

/// `calc` with `add` and `fail` tools.
pub fn calc_server() -> FakeServer {
    FakeServer::new("calc")
        .tool("add", "Add two numbers", |args| {
            let sum = args["a"].as_f64().unwrap_or(0.0) + args["b"].as_f64().unwrap_or(0.0);
            Reply::Result(text_result(&format!("{}", sum)))
        })
        .tool("fail", "Always fails", |_| {
            Reply::Result(error_result("division by zero"))
        })
}

/// Model that replays a script, then repeats `fallback` (or plain text) forever.
pub struct ScriptedModel {
    script: Mutex<VecDeque<ModelReply>>,
    fallback: Option<ModelReply>,
    pub invocations: Mutex<Vec<(Vec<ChatMessage>, Vec<String>)>>,
}

impl ScriptedModel {
    pub fn new(script: Vec<ModelReply>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: None,
            invocations: Mutex::new(Vec::new()),
        }
    }

    pub fn always(reply: ModelReply) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Some(reply),
            invocations: Mutex::new(Vec::new()),
        }
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.lock().unwrap().len()
    }

    /// Tool names offered on the given invocation.
    pub fn offered_tools(&self, invocation: usize) -> Vec<String> {
        self.invocations.lock().unwrap()[invocation].1.clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn invoke(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDescriptor],
    ) -> mcp_runtime::Result<ModelReply> {
        self.invocations.lock().unwrap().push((
            messages.to_vec(),
            tools.iter().map(|t| t.name.clone()).collect(),
        ));
        let next = self.script.lock().unwrap().pop_front();
        Ok(next
            .or_else(|| self.fallback.clone())
            .unwrap_or_else(|| ModelReply::text("done")))
    }
}

pub fn tool_call(id: &str, name: &str, arguments: Value) -> mcp_runtime::ToolCallRequest {
    mcp_runtime::ToolCallRequest {
        tool_call_id: id.to_string(),
        tool_name: name.to_string(),
        arguments,
    }
}
