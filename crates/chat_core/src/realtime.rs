use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{stream::SplitSink, SinkExt, StreamExt};
use shared::protocol::{RealtimeEvent, RealtimeRequest};
use tokio::{
    net::TcpStream,
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::connection::{ChannelFrame, ChannelHandle, RealtimeConnector, RealtimeSink};

type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Opens the chat WebSocket and speaks JSON text frames on it.
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl RealtimeConnector for WebSocketConnector {
    async fn open(&self) -> Result<ChannelHandle> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket: {}", self.url))?;
        let (writer, mut reader) = ws_stream.split();
        let (tx, rx) = mpsc::unbounded_channel();

        let url = self.url.clone();
        let reader_task = tokio::spawn(async move {
            while let Some(msg) = reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<RealtimeEvent>(&text) {
                        Ok(event) => {
                            if tx.send(ChannelFrame::Event(event)).is_err() {
                                return;
                            }
                        }
                        Err(err) => warn!(url = %url, "realtime: ignoring malformed event: {err}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        let _ = tx.send(ChannelFrame::Error(format!(
                            "websocket receive failed: {err}"
                        )));
                        return;
                    }
                }
            }
            debug!(url = %url, "realtime: websocket stream ended");
            let _ = tx.send(ChannelFrame::Closed);
        });

        Ok(ChannelHandle {
            sink: Arc::new(WebSocketSink {
                writer: Mutex::new(writer),
                reader_task,
            }),
            inbound: rx,
        })
    }
}

struct WebSocketSink {
    writer: Mutex<WsWriter>,
    reader_task: JoinHandle<()>,
}

#[async_trait]
impl RealtimeSink for WebSocketSink {
    async fn send(&self, request: RealtimeRequest) -> Result<()> {
        let text = serde_json::to_string(&request)?;
        self.writer
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .context("websocket send failed")?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.reader_task.abort();
        self.writer
            .lock()
            .await
            .close()
            .await
            .context("websocket close failed")?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/realtime_tests.rs"]
mod tests;
