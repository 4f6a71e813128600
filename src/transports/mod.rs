pub mod http_stream;
pub mod memory;
pub mod sse;
pub mod stdio;
pub mod websocket;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::config::TransportConfig;

/// One JSON-RPC message received from the peer.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub message: Value,
    /// Stream position usable as a resumption token, when the transport has one.
    pub event_id: Option<String>,
}

impl InboundMessage {
    pub fn new(message: Value) -> Self {
        Self {
            message,
            event_id: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Resume a previously interrupted response stream instead of sending fresh.
    pub resumption_token: Option<String>,
}

pub type InboundReceiver = mpsc::UnboundedReceiver<InboundMessage>;

/// A bidirectional JSON-RPC channel to one peer.
///
/// `start` opens the channel and hands back the inbound stream; the stream ends
/// when the transport is closed or the peer goes away.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn start(&self) -> Result<InboundReceiver>;
    async fn send(&self, message: Value, options: SendOptions) -> Result<()>;
    async fn close(&self) -> Result<()>;
    fn kind(&self) -> &'static str;
}

/// Builds transports from configuration without opening them.
pub trait TransportFactory: Send + Sync {
    fn create(&self, config: &TransportConfig) -> crate::errors::Result<Arc<dyn Transport>>;
}

#[derive(Debug, Clone, Default)]
pub struct DefaultTransportFactory;

impl TransportFactory for DefaultTransportFactory {
    fn create(&self, config: &TransportConfig) -> crate::errors::Result<Arc<dyn Transport>> {
        let transport: Arc<dyn Transport> = match config {
            TransportConfig::ProcessPipe {
                command,
                args,
                env,
                working_dir,
            } => Arc::new(stdio::StdioTransport::new(
                command.clone(),
                args.clone(),
                env.clone(),
                working_dir.clone(),
            )),
            TransportConfig::HttpStreaming {
                url,
                headers,
                reconnect_policy,
            } => Arc::new(http_stream::StreamableHttpTransport::new(
                url.clone(),
                headers.clone(),
                reconnect_policy.clone(),
            )),
            TransportConfig::WebSocket { url } => {
                Arc::new(websocket::WebSocketTransport::new(url.clone()))
            }
            TransportConfig::ServerSentEvents { url, headers } => {
                Arc::new(sse::SseTransport::new(url.clone(), headers.clone()))
            }
        };
        Ok(transport)
    }
}

/// Sender half of a transport's inbound stream, installed by `start`.
#[derive(Default)]
pub(crate) struct InboundSlot {
    started: AtomicBool,
    tx: Mutex<Option<mpsc::UnboundedSender<InboundMessage>>>,
}

impl InboundSlot {
    fn mark_started(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(anyhow!("transport already started"));
        }
        Ok(())
    }

    /// Open the stream and keep a sender for later `send` calls to feed it.
    pub(crate) fn open(&self) -> Result<InboundReceiver> {
        self.mark_started()?;
        let (tx, rx) = mpsc::unbounded_channel();
        *self.tx.lock().map_err(|_| anyhow!("inbound slot poisoned"))? = Some(tx);
        Ok(rx)
    }

    /// Open the stream with the caller's reader as the only sender, so the
    /// stream ends when that reader stops.
    pub(crate) fn open_owned(
        &self,
    ) -> Result<(mpsc::UnboundedSender<InboundMessage>, InboundReceiver)> {
        self.mark_started()?;
        Ok(mpsc::unbounded_channel())
    }

    pub(crate) fn sender(&self) -> Result<mpsc::UnboundedSender<InboundMessage>> {
        self.tx
            .lock()
            .map_err(|_| anyhow!("inbound slot poisoned"))?
            .clone()
            .ok_or_else(|| anyhow!("transport not started"))
    }

    /// Drop the sender so the inbound stream ends once spawned readers finish.
    pub(crate) fn close(&self) {
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }
    }
}

/// Push every message of a JSON value (single message or batch) downstream.
pub(crate) fn forward_json(
    tx: &mpsc::UnboundedSender<InboundMessage>,
    value: Value,
    event_id: Option<String>,
) {
    let messages = match value {
        Value::Array(batch) => batch,
        single => vec![single],
    };
    for message in messages {
        let _ = tx.send(InboundMessage {
            message,
            event_id: event_id.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn factory_builds_every_transport_kind() {
        let factory = DefaultTransportFactory;
        let configs = vec![
            TransportConfig::process_pipe("mcp-calc", vec![]),
            TransportConfig::http_streaming("http://localhost:1/mcp"),
            TransportConfig::WebSocket {
                url: "ws://localhost:1/mcp".into(),
            },
            TransportConfig::ServerSentEvents {
                url: "http://localhost:1/sse".into(),
                headers: HashMap::new(),
            },
        ];
        let kinds: Vec<_> = configs
            .iter()
            .map(|c| factory.create(c).unwrap().kind())
            .collect();
        assert_eq!(
            kinds,
            vec!["process_pipe", "http_streaming", "web_socket", "server_sent_events"]
        );
    }

    #[tokio::test]
    async fn forward_json_splits_batches() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        forward_json(
            &tx,
            json!([{ "id": 1 }, { "id": 2 }]),
            Some("ev-7".to_string()),
        );
        forward_json(&tx, json!({ "id": 3 }), None);
        drop(tx);

        let mut seen = Vec::new();
        while let Some(inbound) = rx.recv().await {
            seen.push((inbound.message["id"].as_i64().unwrap(), inbound.event_id));
        }
        assert_eq!(
            seen,
            vec![
                (1, Some("ev-7".to_string())),
                (2, Some("ev-7".to_string())),
                (3, None)
            ]
        );
    }

    #[test]
    fn inbound_slot_starts_once() {
        let slot = InboundSlot::default();
        assert!(slot.sender().is_err());
        let _rx = slot.open().unwrap();
        assert!(slot.sender().is_ok());
        assert!(slot.open().is_err());
        slot.close();
        assert!(slot.sender().is_err());

        let owned = InboundSlot::default();
        let (tx, mut rx) = owned.open_owned().unwrap();
        assert!(owned.sender().is_err());
        assert!(owned.open_owned().is_err());
        drop(tx);
        assert!(rx.try_recv().is_err());
    }
}
