//! Streamable HTTP transport: one POST per outgoing message, JSON or SSE responses.
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::{header, Client, Response, StatusCode};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ReconnectPolicy;
use crate::transports::{
    forward_json, InboundMessage, InboundReceiver, InboundSlot, SendOptions, Transport,
};

pub const SESSION_HEADER: &str = "mcp-session-id";
const LAST_EVENT_ID_HEADER: &str = "last-event-id";
const ACCEPT_BOTH: &str = "application/json, text/event-stream";

struct HttpInner {
    client: Client,
    url: String,
    headers: HashMap<String, String>,
    reconnect_policy: ReconnectPolicy,
    session_id: RwLock<Option<String>>,
}

impl HttpInner {
    async fn apply_headers(&self, mut builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (k, v) in &self.headers {
            builder = builder.header(k, v);
        }
        if let Some(session_id) = self.session_id.read().await.as_ref() {
            builder = builder.header(SESSION_HEADER, session_id);
        }
        builder
    }

    async fn remember_session(&self, response: &Response) {
        if let Some(id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut guard = self.session_id.write().await;
            if guard.as_deref() != Some(id) {
                debug!(url = %self.url, session_id = %id, "MCP session established");
                *guard = Some(id.to_string());
            }
        }
    }

    /// Re-open the server's event stream from `last_event_id`.
    async fn open_resumed_stream(&self, last_event_id: &str) -> Result<Response> {
        let request = self
            .client
            .get(&self.url)
            .header(header::ACCEPT, "text/event-stream")
            .header(LAST_EVENT_ID_HEADER, last_event_id);
        let response = self.apply_headers(request).await.send().await?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "Failed to resume stream from {}: {}",
                last_event_id,
                response.status()
            ));
        }
        Ok(response)
    }
}

/// Transport for MCP servers speaking the streamable HTTP protocol.
pub struct StreamableHttpTransport {
    inner: Arc<HttpInner>,
    inbound: InboundSlot,
    shutdown: CancellationToken,
}

impl StreamableHttpTransport {
    pub fn new(
        url: String,
        headers: HashMap<String, String>,
        reconnect_policy: ReconnectPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(HttpInner {
                client: Client::new(),
                url,
                headers,
                reconnect_policy,
                session_id: RwLock::new(None),
            }),
            inbound: InboundSlot::default(),
            shutdown: CancellationToken::new(),
        }
    }

    pub async fn session_id(&self) -> Option<String> {
        self.inner.session_id.read().await.clone()
    }

    fn is_event_stream(response: &Response) -> bool {
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("text/event-stream"))
            .unwrap_or(false)
    }

    fn spawn_sse_reader(
        &self,
        response: Response,
        tx: mpsc::UnboundedSender<InboundMessage>,
        replay_id: Option<Value>,
        resume_from: Option<String>,
    ) {
        let inner = Arc::clone(&self.inner);
        let shutdown = self.shutdown.clone();
        tokio::spawn(pump_event_stream(
            inner, response, tx, replay_id, resume_from, shutdown,
        ));
    }
}

/// Point a replayed response at the request id that asked for the replay.
fn rewrite_response_id(value: &mut Value, replay_id: &Value) {
    let rewrite = |message: &mut Value| {
        if message.get("result").is_some() || message.get("error").is_some() {
            if let Some(obj) = message.as_object_mut() {
                obj.insert("id".to_string(), replay_id.clone());
            }
        }
    };
    match value {
        Value::Array(batch) => batch.iter_mut().for_each(rewrite),
        single => rewrite(single),
    }
}

async fn pump_event_stream(
    inner: Arc<HttpInner>,
    mut response: Response,
    tx: mpsc::UnboundedSender<InboundMessage>,
    replay_id: Option<Value>,
    mut last_event_id: Option<String>,
    shutdown: CancellationToken,
) {
    let policy = inner.reconnect_policy.clone();
    let mut attempt = 0u32;

    loop {
        let mut events = response.bytes_stream().eventsource();
        let mut interrupted = false;

        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => return,
                next = events.next() => next,
            };
            match next {
                Some(Ok(event)) => {
                    attempt = 0;
                    if !event.id.is_empty() {
                        last_event_id = Some(event.id.clone());
                    }
                    // Priming events carry only an id.
                    let is_message = event.event.is_empty() || event.event == "message";
                    if event.data.trim().is_empty() || !is_message {
                        continue;
                    }
                    match serde_json::from_str::<Value>(&event.data) {
                        Ok(mut value) => {
                            if let Some(id) = &replay_id {
                                rewrite_response_id(&mut value, id);
                            }
                            forward_json(&tx, value, last_event_id.clone());
                        }
                        Err(e) => debug!(url = %inner.url, error = %e, "Dropping unparsable SSE event"),
                    }
                }
                Some(Err(e)) => {
                    warn!(url = %inner.url, error = %e, "SSE response interrupted");
                    interrupted = true;
                    break;
                }
                None => break,
            }
        }

        let Some(resume_from) = last_event_id.clone().filter(|_| interrupted) else {
            return;
        };

        loop {
            if attempt >= policy.max_retries {
                warn!(url = %inner.url, attempts = attempt, "Giving up on SSE reconnection");
                return;
            }
            let delay = policy.delay_for_attempt(attempt);
            attempt += 1;
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            match inner.open_resumed_stream(&resume_from).await {
                Ok(resumed) => {
                    debug!(url = %inner.url, last_event_id = %resume_from, "SSE stream resumed");
                    response = resumed;
                    break;
                }
                Err(e) => warn!(url = %inner.url, error = %e, "SSE reconnection failed"),
            }
        }
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    async fn start(&self) -> Result<InboundReceiver> {
        self.inbound.open()
    }

    async fn send(&self, message: Value, options: SendOptions) -> Result<()> {
        let tx = self.inbound.sender()?;

        if let Some(token) = options.resumption_token {
            let response = self.inner.open_resumed_stream(&token).await?;
            self.inner.remember_session(&response).await;
            self.spawn_sse_reader(response, tx, message.get("id").cloned(), Some(token));
            return Ok(());
        }

        let request = self
            .inner
            .client
            .post(&self.inner.url)
            .header(header::ACCEPT, ACCEPT_BOTH)
            .json(&message);
        let response = self.inner.apply_headers(request).await.send().await?;
        self.inner.remember_session(&response).await;

        let status = response.status();
        if status == StatusCode::ACCEPTED {
            return Ok(());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("MCP request failed: {} {}", status, body));
        }

        if Self::is_event_stream(&response) {
            self.spawn_sse_reader(response, tx, None, None);
            return Ok(());
        }

        let body = response.bytes().await?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(());
        }
        let value: Value = serde_json::from_slice(&body)?;
        forward_json(&tx, value, None);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        self.inbound.close();

        let session_id = self.inner.session_id.write().await.take();
        if let Some(session_id) = session_id {
            let mut request = self
                .inner
                .client
                .delete(&self.inner.url)
                .header(SESSION_HEADER, &session_id);
            for (k, v) in &self.inner.headers {
                request = request.header(k, v);
            }
            // Servers may answer 405 when they do not support explicit termination.
            match request.send().await {
                Ok(response) if !response.status().is_success() => {
                    debug!(url = %self.inner.url, status = %response.status(), "Session DELETE not honoured");
                }
                Ok(_) => {}
                Err(e) => debug!(url = %self.inner.url, error = %e, "Session DELETE failed"),
            }
        }
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "http_streaming"
    }
}
