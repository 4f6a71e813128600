// WebSocket transport: one JSON-RPC message per text frame.
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, protocol::Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, warn};

use crate::transports::{InboundMessage, InboundReceiver, InboundSlot, SendOptions, Transport};

const SUBPROTOCOL: &str = "mcp";

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Transport that talks to an MCP server over a single WebSocket.
pub struct WebSocketTransport {
    url: String,
    sink: Mutex<Option<WsSink>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    inbound: InboundSlot,
}

impl WebSocketTransport {
    pub fn new(url: String) -> Self {
        Self {
            url,
            sink: Mutex::new(None),
            reader: Mutex::new(None),
            inbound: InboundSlot::default(),
        }
    }

    fn parse_frame(text: &str) -> Option<Value> {
        match serde_json::from_str::<Value>(text) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(error = %e, "Dropping non-JSON WebSocket frame");
                None
            }
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn start(&self) -> Result<InboundReceiver> {
        let mut request = self.url.as_str().into_client_request()?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(SUBPROTOCOL));

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| anyhow!("WebSocket connect to {} failed: {}", self.url, e))?;
        let (sink, mut stream) = ws_stream.split();

        let (tx, rx) = self.inbound.open_owned()?;
        let url = self.url.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let value = match msg {
                    Ok(Message::Text(text)) => Self::parse_frame(&text),
                    Ok(Message::Binary(bin)) => String::from_utf8(bin)
                        .ok()
                        .and_then(|text| Self::parse_frame(&text)),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => None,
                    Err(e) => {
                        warn!(url = %url, error = %e, "WebSocket read failed");
                        break;
                    }
                };
                if let Some(value) = value {
                    if tx.send(InboundMessage::new(value)).is_err() {
                        break;
                    }
                }
            }
        });

        *self.sink.lock().await = Some(sink);
        *self.reader.lock().await = Some(reader);
        Ok(rx)
    }

    async fn send(&self, message: Value, _options: SendOptions) -> Result<()> {
        let mut guard = self.sink.lock().await;
        let sink = guard
            .as_mut()
            .ok_or_else(|| anyhow!("WebSocket {} is not open", self.url))?;
        sink.send(Message::Text(serde_json::to_string(&message)?))
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        }
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
        }
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "web_socket"
    }
}
