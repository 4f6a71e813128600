use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::CallOptions;
use crate::errors::{McpRuntimeError, Result};
use crate::protocol::{
    classify, error_response, methods, notification, request, result_response, token_key,
    Incoming, InitializeResult, Progress, METHOD_NOT_FOUND, PROTOCOL_VERSION,
};
use crate::transports::{InboundMessage, InboundReceiver, SendOptions, Transport};

/// Upper bound on delivering a `notifications/cancelled` to the peer.
const CANCEL_NOTICE_TIMEOUT: Duration = Duration::from_secs(5);

type PendingMap = HashMap<u64, oneshot::Sender<InboundMessage>>;
type ProgressMap = HashMap<String, mpsc::UnboundedSender<ProgressNotice>>;

#[derive(Debug)]
struct ProgressNotice {
    progress: Progress,
    event_id: Option<String>,
}

/// Per-request knobs beyond method and params.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub call: CallOptions,
    /// Cancelling this aborts the wait and notifies the peer.
    pub cancel: Option<CancellationToken>,
    pub on_progress: Option<mpsc::UnboundedSender<Progress>>,
    pub resumption_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestOutcome {
    pub result: Value,
    /// Last stream position seen for this request, if the transport reported one.
    pub resumption_token: Option<String>,
}

#[derive(Default)]
struct Routes {
    pending: Mutex<PendingMap>,
    progress: Mutex<ProgressMap>,
}

impl Routes {
    fn pending(&self) -> MutexGuard<'_, PendingMap> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn progress(&self) -> MutexGuard<'_, ProgressMap> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// JSON-RPC request/response correlation over one [`Transport`].
pub struct ProtocolClient {
    name: String,
    transport: Arc<dyn Transport>,
    next_id: AtomicU64,
    routes: Arc<Routes>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ProtocolClient {
    /// Start the transport and begin routing its inbound messages.
    pub async fn start(name: impl Into<String>, transport: Arc<dyn Transport>) -> Result<Self> {
        let name = name.into();
        let inbound = transport
            .start()
            .await
            .map_err(|e| McpRuntimeError::Transport(e.to_string()))?;
        let routes = Arc::new(Routes::default());
        let dispatcher = tokio::spawn(dispatch(
            name.clone(),
            inbound,
            Arc::clone(&routes),
            Arc::clone(&transport),
        ));
        Ok(Self {
            name,
            transport,
            next_id: AtomicU64::new(1),
            routes,
            dispatcher: Mutex::new(Some(dispatcher)),
            closed: AtomicBool::new(false),
        })
    }

    /// MCP handshake: `initialize` followed by `notifications/initialized`.
    pub async fn initialize(
        &self,
        client_name: &str,
        client_version: &str,
        options: RequestOptions,
    ) -> Result<InitializeResult> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": { "name": client_name, "version": client_version },
        });
        let outcome = self.request(methods::INITIALIZE, params, options).await?;
        let result: InitializeResult = serde_json::from_value(outcome.result).map_err(|e| {
            McpRuntimeError::Transport(format!("invalid initialize result: {e}"))
        })?;
        if result.protocol_version != PROTOCOL_VERSION {
            debug!(
                connection = %self.name,
                server_version = %result.protocol_version,
                "Peer negotiated a different protocol version"
            );
        }
        self.notify(methods::INITIALIZED, json!({})).await?;
        Ok(result)
    }

    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        self.transport
            .send(notification(method, params), SendOptions::default())
            .await
            .map_err(|e| McpRuntimeError::Transport(e.to_string()))
    }

    pub async fn request(
        &self,
        method: &str,
        mut params: Value,
        options: RequestOptions,
    ) -> Result<RequestOutcome> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let wants_progress =
            options.on_progress.is_some() || options.call.reset_timeout_on_progress;

        let (response_tx, mut response_rx) = oneshot::channel();
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let progress_key = wants_progress.then(|| id.to_string());
        if wants_progress {
            attach_progress_token(&mut params, id);
        }

        self.routes.pending().insert(id, response_tx);
        if let Some(key) = &progress_key {
            self.routes.progress().insert(key.clone(), progress_tx);
        } else {
            drop(progress_tx);
        }
        let mut guard = InFlight {
            id,
            progress_key,
            routes: Arc::clone(&self.routes),
            transport: Arc::clone(&self.transport),
        };

        let cancel = options.cancel.clone().unwrap_or_else(CancellationToken::new);
        let started = Instant::now();
        let mut deadline = options.call.timeout.map(|t| started + t);
        let total_deadline = options.call.max_total_timeout.map(|t| started + t);
        let mut last_event_id = options.resumption_token.clone();
        let mut progress_open = wants_progress;

        debug!(connection = %self.name, request_id = id, method, "Sending MCP request");
        let send_options = SendOptions {
            resumption_token: options.resumption_token.clone(),
        };
        // Streamable HTTP only returns from `send` once the peer has answered.
        let send = self.transport.send(request(id, method, params), send_options);
        tokio::pin!(send);
        let mut sent = false;

        loop {
            tokio::select! {
                written = &mut send, if !sent => {
                    sent = true;
                    if let Err(e) = written {
                        guard.forget();
                        return Err(McpRuntimeError::Transport(e.to_string()));
                    }
                }
                _ = cancel.cancelled() => {
                    self.abandon(&mut guard, "Connection closed");
                    return Err(McpRuntimeError::Cancelled(method.to_string()));
                }
                _ = sleep_until(deadline), if deadline.is_some() => {
                    self.abandon(&mut guard, "Request timed out");
                    return Err(McpRuntimeError::Timeout(method.to_string()));
                }
                _ = sleep_until(total_deadline), if total_deadline.is_some() => {
                    self.abandon(&mut guard, "Maximum total timeout exceeded");
                    return Err(McpRuntimeError::Timeout(method.to_string()));
                }
                notice = progress_rx.recv(), if progress_open => {
                    let Some(notice) = notice else {
                        progress_open = false;
                        continue;
                    };
                    if options.call.reset_timeout_on_progress {
                        deadline = options.call.timeout.map(|t| Instant::now() + t);
                    }
                    deliver_progress(notice, &options, &mut last_event_id);
                }
                response = &mut response_rx => {
                    // Progress routed ahead of the response is still owed to the caller.
                    while let Ok(notice) = progress_rx.try_recv() {
                        deliver_progress(notice, &options, &mut last_event_id);
                    }
                    guard.forget();
                    let response = response.map_err(|_| {
                        if self.closed.load(Ordering::SeqCst) {
                            McpRuntimeError::Cancelled(method.to_string())
                        } else {
                            McpRuntimeError::Transport(format!(
                                "connection '{}' closed before '{}' completed",
                                self.name, method
                            ))
                        }
                    })?;
                    if response.event_id.is_some() {
                        last_event_id = response.event_id;
                    }
                    return into_outcome(response.message, last_event_id);
                }
            }
        }
    }

    /// Drop routing for a request we stop waiting on and tell the peer, unless
    /// someone else (a response or `close`) already claimed it.
    ///
    /// The notice goes out on a background task.
    fn abandon(&self, guard: &mut InFlight, reason: &str) {
        let claimed = self.routes.pending().remove(&guard.id).is_some();
        guard.forget();
        if claimed {
            spawn_cancelled_notice(Arc::clone(&self.transport), guard.id, reason);
        }
    }

    /// Cancel every outstanding request, telling the peer, then close the transport.
    pub async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        let abandoned: Vec<u64> = self.routes.pending().drain().map(|(id, _)| id).collect();
        self.routes.progress().clear();
        for id in abandoned {
            let notice = self.notify(methods::CANCELLED, cancelled_params(id, "Connection closed"));
            if tokio::time::timeout(CANCEL_NOTICE_TIMEOUT, notice).await.is_err() {
                debug!(connection = %self.name, request_id = id, "Cancellation notice timed out");
            }
        }
        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(dispatcher) = dispatcher {
            dispatcher.abort();
        }
        self.transport
            .close()
            .await
            .map_err(|e| McpRuntimeError::Transport(e.to_string()))
    }

    pub fn transport_kind(&self) -> &'static str {
        self.transport.kind()
    }
}

/// Routing entries for one request; removed again if the request future is dropped.
struct InFlight {
    id: u64,
    progress_key: Option<String>,
    routes: Arc<Routes>,
    transport: Arc<dyn Transport>,
}

impl InFlight {
    fn forget(&mut self) {
        self.routes.pending().remove(&self.id);
        if let Some(key) = self.progress_key.take() {
            self.routes.progress().remove(&key);
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let claimed = self.routes.pending().remove(&self.id).is_some();
        if let Some(key) = self.progress_key.take() {
            self.routes.progress().remove(&key);
        }
        if !claimed {
            return;
        }
        // The caller stopped polling mid-request; the peer should stop too.
        spawn_cancelled_notice(Arc::clone(&self.transport), self.id, "Request abandoned");
    }
}

/// Tell the peer to stop working on `id` without waiting for the write.
fn spawn_cancelled_notice(transport: Arc<dyn Transport>, id: u64, reason: &str) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        return;
    };
    let message = notification(methods::CANCELLED, cancelled_params(id, reason));
    handle.spawn(async move {
        let write = transport.send(message, SendOptions::default());
        let _ = tokio::time::timeout(CANCEL_NOTICE_TIMEOUT, write).await;
    });
}

async fn dispatch(
    name: String,
    mut inbound: InboundReceiver,
    routes: Arc<Routes>,
    transport: Arc<dyn Transport>,
) {
    while let Some(inbound_message) = inbound.recv().await {
        match classify(&inbound_message.message) {
            Incoming::Response { id } => {
                let sender = routes.pending().remove(&id);
                match sender {
                    Some(sender) => {
                        let _ = sender.send(inbound_message);
                    }
                    None => debug!(connection = %name, request_id = id, "Dropping response for unknown request"),
                }
            }
            Incoming::Request { id, method } => {
                let reply = if method == methods::PING {
                    result_response(id, json!({}))
                } else {
                    debug!(connection = %name, method, "Rejecting unsupported server request");
                    error_response(id, METHOD_NOT_FOUND, &format!("Method not found: {method}"))
                };
                if let Err(e) = transport.send(reply, SendOptions::default()).await {
                    warn!(connection = %name, error = %e, "Failed to answer server request");
                }
            }
            Incoming::Notification { method } if method == methods::PROGRESS => {
                let params = &inbound_message.message["params"];
                let Some(token) = params.get("progressToken").map(token_key) else {
                    continue;
                };
                let progress = match serde_json::from_value::<Progress>(params.clone()) {
                    Ok(progress) => progress,
                    Err(e) => {
                        debug!(connection = %name, error = %e, "Ignoring malformed progress");
                        continue;
                    }
                };
                let sender = routes.progress().get(&token).cloned();
                if let Some(sender) = sender {
                    let _ = sender.send(ProgressNotice {
                        progress,
                        event_id: inbound_message.event_id.clone(),
                    });
                }
            }
            Incoming::Notification { method } => {
                debug!(connection = %name, method, "Received MCP notification");
            }
            Incoming::Unknown => {
                debug!(connection = %name, "Ignoring unrecognized JSON-RPC message");
            }
        }
    }
    debug!(connection = %name, "Inbound stream ended");
    // Dropping the senders fails every waiter with a closed-channel error.
    routes.pending().clear();
    routes.progress().clear();
}

fn deliver_progress(
    notice: ProgressNotice,
    options: &RequestOptions,
    last_event_id: &mut Option<String>,
) {
    if notice.event_id.is_some() {
        *last_event_id = notice.event_id;
    }
    if let Some(on_progress) = &options.on_progress {
        let _ = on_progress.send(notice.progress);
    }
}

fn attach_progress_token(params: &mut Value, id: u64) {
    if !params.is_object() {
        *params = Value::Object(Map::new());
    }
    if let Some(obj) = params.as_object_mut() {
        let meta = obj
            .entry("_meta")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Some(meta) = meta.as_object_mut() {
            meta.insert("progressToken".to_string(), json!(id));
        }
    }
}

fn cancelled_params(id: u64, reason: &str) -> Value {
    json!({ "requestId": id, "reason": reason })
}

fn into_outcome(message: Value, resumption_token: Option<String>) -> Result<RequestOutcome> {
    if let Some(error) = message.get("error") {
        return Err(McpRuntimeError::Rpc {
            code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        });
    }
    Ok(RequestOutcome {
        result: message.get("result").cloned().unwrap_or(Value::Null),
        resumption_token,
    })
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
