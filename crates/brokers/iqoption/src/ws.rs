use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use optbridge_brokers_common::{EventSink, Transport};
use optbridge_core::{BridgeError, TransportEvent};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// WebSocket transport to the venue's streaming endpoint.
///
/// Each connect spawns a writer task fed by a channel and a reader task that
/// forwards every JSON frame to the event sink. Frames that are not JSON are
/// dropped.
pub struct WsTransport {
    url: String,
    writer: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    generation: Arc<AtomicU64>,
    open: Arc<AtomicBool>,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            writer: Mutex::new(None),
            generation: Arc::new(AtomicU64::new(0)),
            open: Arc::new(AtomicBool::new(false)),
        }
    }

    fn writer(&self) -> Option<mpsc::UnboundedSender<Message>> {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, generation: u64, sink: EventSink) -> Result<(), BridgeError> {
        let (stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| BridgeError::Transport(format!("WebSocket connect failed: {}", e)))?;
        info!(url = %self.url, generation, "WebSocket connected");

        let (mut write, mut read) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        *self.writer.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        self.generation.store(generation, Ordering::SeqCst);
        self.open.store(true, Ordering::SeqCst);

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = write.send(message).await {
                    warn!(generation, error = %e, "WebSocket write failed");
                    break;
                }
            }
            let _ = write.close().await;
        });

        let current = Arc::clone(&self.generation);
        let open = Arc::clone(&self.open);
        tokio::spawn(async move {
            let _ = sink.send(TransportEvent::Opened { generation });

            let reason = loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => forward(&sink, generation, text.as_bytes()),
                    Some(Ok(Message::Binary(bytes))) => forward(&sink, generation, &bytes),
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| f.reason.to_string())
                            .unwrap_or_else(|| "closed by venue".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break format!("read error: {}", e),
                    None => break "stream ended".to_string(),
                }
            };

            if current.load(Ordering::SeqCst) == generation {
                open.store(false, Ordering::SeqCst);
            }
            let _ = sink.send(TransportEvent::Closed { generation, reason });
        });

        Ok(())
    }

    async fn send(&self, message: &serde_json::Value) -> Result<(), BridgeError> {
        let writer = self
            .writer()
            .filter(|_| self.is_open())
            .ok_or_else(|| BridgeError::ConnectionLost("WebSocket not connected".to_string()))?;
        writer
            .send(Message::Text(message.to_string()))
            .map_err(|_| BridgeError::ConnectionLost("WebSocket writer stopped".to_string()))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

fn forward(sink: &EventSink, generation: u64, bytes: &[u8]) {
    match serde_json::from_slice(bytes) {
        Ok(payload) => {
            let _ = sink.send(TransportEvent::Message {
                generation,
                payload,
            });
        }
        Err(e) => debug!(generation, error = %e, "Dropping non-JSON frame"),
    }
}
