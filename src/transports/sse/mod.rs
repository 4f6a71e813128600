// Legacy HTTP+SSE transport: GET an event stream, POST to the endpoint it announces.
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::{header, Client, Url};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{oneshot, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::transports::{forward_json, InboundReceiver, InboundSlot, SendOptions, Transport};

const ENDPOINT_EVENT: &str = "endpoint";
const ENDPOINT_WAIT: Duration = Duration::from_secs(30);

pub struct SseTransport {
    client: Client,
    url: String,
    headers: HashMap<String, String>,
    endpoint: RwLock<Option<Url>>,
    inbound: InboundSlot,
    shutdown: CancellationToken,
}

impl SseTransport {
    pub fn new(url: String, headers: HashMap<String, String>) -> Self {
        Self {
            client: Client::new(),
            url,
            headers,
            endpoint: RwLock::new(None),
            inbound: InboundSlot::default(),
            shutdown: CancellationToken::new(),
        }
    }

    fn apply_headers(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let mut builder = request;
        for (k, v) in &self.headers {
            builder = builder.header(k, v);
        }
        builder
    }

    /// Resolve the announced endpoint against the stream URL; it is usually relative.
    fn resolve_endpoint(base: &str, announced: &str) -> Result<Url> {
        let base = Url::parse(base)?;
        let endpoint = base.join(announced.trim())?;
        if endpoint.origin() != base.origin() {
            return Err(anyhow!(
                "Endpoint origin {} does not match stream origin {}",
                endpoint.origin().ascii_serialization(),
                base.origin().ascii_serialization()
            ));
        }
        Ok(endpoint)
    }

    pub async fn endpoint(&self) -> Option<Url> {
        self.endpoint.read().await.clone()
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn start(&self) -> Result<InboundReceiver> {
        let request = self
            .client
            .get(&self.url)
            .header(header::ACCEPT, "text/event-stream");
        let response = self.apply_headers(request).send().await?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "Failed to open SSE stream {}: {}",
                self.url,
                response.status()
            ));
        }

        let (tx, rx) = self.inbound.open_owned()?;
        let (endpoint_tx, endpoint_rx) = oneshot::channel::<Result<Url>>();
        let base = self.url.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut endpoint_tx = Some(endpoint_tx);
            let mut events = response.bytes_stream().eventsource();
            loop {
                let next = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    next = events.next() => next,
                };
                match next {
                    Some(Ok(event)) if event.event == ENDPOINT_EVENT => {
                        if let Some(sender) = endpoint_tx.take() {
                            let _ = sender.send(SseTransport::resolve_endpoint(&base, &event.data));
                        }
                    }
                    Some(Ok(event)) => {
                        if event.data.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<Value>(&event.data) {
                            Ok(value) => {
                                let event_id = (!event.id.is_empty()).then(|| event.id.clone());
                                forward_json(&tx, value, event_id);
                            }
                            Err(e) => debug!(url = %base, error = %e, "Dropping unparsable SSE event"),
                        }
                    }
                    Some(Err(e)) => {
                        warn!(url = %base, error = %e, "SSE stream error");
                        break;
                    }
                    None => break,
                }
            }
            if let Some(sender) = endpoint_tx.take() {
                let _ = sender.send(Err(anyhow!("SSE stream ended before announcing an endpoint")));
            }
        });

        let endpoint = tokio::time::timeout(ENDPOINT_WAIT, endpoint_rx)
            .await
            .map_err(|_| anyhow!("Timed out waiting for the SSE endpoint event"))?
            .map_err(|_| anyhow!("SSE reader stopped unexpectedly"))??;
        debug!(url = %self.url, endpoint = %endpoint, "SSE endpoint announced");
        *self.endpoint.write().await = Some(endpoint);
        Ok(rx)
    }

    async fn send(&self, message: Value, _options: SendOptions) -> Result<()> {
        let endpoint = self
            .endpoint
            .read()
            .await
            .clone()
            .ok_or_else(|| anyhow!("SSE transport {} is not started", self.url))?;

        let request = self.client.post(endpoint).json(&message);
        let response = self.apply_headers(request).send().await?;
        if !response.status().is_success() {
            return Err(anyhow!("MCP POST failed: {}", response.status()));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        self.endpoint.write().await.take();
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "server_sent_events"
    }
}
