use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::transports::{InboundMessage, InboundReceiver, InboundSlot, SendOptions, Transport};

/// What the peer side sees for each client message.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub message: Value,
    pub resumption_token: Option<String>,
}

/// In-process transport linked to an [`InMemoryPeer`]; for tests and local usage.
pub struct InMemoryTransport {
    outbound: mpsc::UnboundedSender<Outbound>,
    /// Messages the peer pushed before `start` was called.
    pending: Mutex<Option<mpsc::UnboundedReceiver<InboundMessage>>>,
    inbound: InboundSlot,
    shutdown: CancellationToken,
    closed: Arc<AtomicBool>,
}

/// The server end of an [`InMemoryTransport`].
pub struct InMemoryPeer {
    incoming: mpsc::UnboundedReceiver<Outbound>,
    to_client: mpsc::UnboundedSender<InboundMessage>,
    closed: Arc<AtomicBool>,
}

impl InMemoryTransport {
    pub fn pair() -> (Self, InMemoryPeer) {
        let (outbound, incoming) = mpsc::unbounded_channel();
        let (to_client, pending) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        (
            Self {
                outbound,
                pending: Mutex::new(Some(pending)),
                inbound: InboundSlot::default(),
                shutdown: CancellationToken::new(),
                closed: Arc::clone(&closed),
            },
            InMemoryPeer {
                incoming,
                to_client,
                closed,
            },
        )
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn start(&self) -> Result<InboundReceiver> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| anyhow!("in-memory transport poisoned"))?
            .take()
            .ok_or_else(|| anyhow!("in-memory transport already started"))?;
        let (tx, rx) = self.inbound.open_owned()?;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    message = pending.recv() => message,
                };
                let Some(message) = message else { break };
                if tx.send(message).is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn send(&self, message: Value, options: SendOptions) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(anyhow!("in-memory transport closed"));
        }
        self.outbound
            .send(Outbound {
                message,
                resumption_token: options.resumption_token,
            })
            .map_err(|_| anyhow!("in-memory peer dropped"))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "in_memory"
    }
}

impl InMemoryPeer {
    /// Next message written by the client; `None` once the client side is gone.
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.incoming.recv().await
    }

    pub fn send(&self, message: Value) -> Result<()> {
        self.send_with_event_id(message, None)
    }

    pub fn send_with_event_id(&self, message: Value, event_id: Option<String>) -> Result<()> {
        self.to_client
            .send(InboundMessage { message, event_id })
            .map_err(|_| anyhow!("in-memory client dropped"))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
