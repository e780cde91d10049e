//! Production delta stream over a websocket.
//!
//! JSON text frames in both directions; a split sink/stream pair with
//! forwarding tasks, plus a ping loop whose pongs surface as latency events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::{ErrorBody, SyncError};
use crate::protocol::{
    ClientProfile, ConnectionDetails, ConnectionMode, ContentMessage, OutboundMessage,
    SequencedMessage, SignalMessage,
};
use crate::service::{DeltaStorage, DeltaStreamConnection, DocumentService, StreamEvent, StreamHandle};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const PING_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum ClientFrame<'a> {
    ConnectDocument {
        document_id: &'a str,
        connection_id: &'a str,
        mode: ConnectionMode,
        client: &'a ClientProfile,
    },
    SubmitOp {
        messages: &'a [OutboundMessage],
    },
    SubmitSignal {
        content: &'a str,
    },
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum ServerFrame {
    ConnectSuccess { details: ConnectionDetails },
    Op { messages: Vec<SequencedMessage> },
    OpContent { content: ContentMessage },
    Signal { signal: SignalMessage },
    Nack { target: i64 },
    Disconnect { reason: String },
    Error { error: ErrorBody },
}

enum Outgoing {
    Frame(Message),
    Acked(Message, oneshot::Sender<Result<(), SyncError>>),
}

/// Document service backed by a websocket stream endpoint and a delta
/// storage implementation built separately (see [`super::storage`]).
pub struct WebSocketDocumentService {
    stream_endpoint: Url,
    document_id: String,
    storage: Arc<dyn DeltaStorage>,
}

impl WebSocketDocumentService {
    pub fn new(
        stream_endpoint: Url,
        document_id: impl Into<String>,
        storage: Arc<dyn DeltaStorage>,
    ) -> Self {
        Self {
            stream_endpoint,
            document_id: document_id.into(),
            storage,
        }
    }

    fn stream_url(&self, mode: ConnectionMode) -> Result<Url, SyncError> {
        let mut url = self
            .stream_endpoint
            .join(&format!("documents/{}/deltas/stream", self.document_id))
            .map_err(|err| SyncError::fatal(format!("invalid stream endpoint: {err}")))?;
        let mode = match mode {
            ConnectionMode::Read => "read",
            ConnectionMode::Write => "write",
        };
        url.query_pairs_mut().append_pair("mode", mode);
        Ok(url)
    }
}

#[async_trait]
impl DocumentService for WebSocketDocumentService {
    async fn connect_to_delta_stream(
        &self,
        client: &ClientProfile,
        mode: ConnectionMode,
    ) -> Result<StreamHandle, SyncError> {
        let url = self.stream_url(mode)?;
        let (ws_stream, _) = connect_async(url.as_str()).await.map_err(|err| {
            SyncError::transient(format!("websocket connect failed: {err}"))
        })?;
        let (mut sink, mut stream) = ws_stream.split();

        let connection_id = uuid::Uuid::new_v4().to_string();
        let connect_frame = serde_json::to_string(&ClientFrame::ConnectDocument {
            document_id: &self.document_id,
            connection_id: &connection_id,
            mode,
            client,
        })
        .map_err(|err| SyncError::fatal(format!("encode connect frame: {err}")))?;
        sink.send(Message::Text(connect_frame)).await.map_err(|err| {
            SyncError::transient(format!("websocket handshake send failed: {err}"))
        })?;

        // The first meaningful frame decides the handshake.
        let details = tokio::time::timeout(CONNECT_TIMEOUT, async {
            while let Some(frame) = stream.next().await {
                let frame = frame.map_err(|err| {
                    SyncError::transient(format!("websocket handshake failed: {err}"))
                })?;
                if let Message::Text(text) = frame {
                    match serde_json::from_str::<ServerFrame>(&text) {
                        Ok(ServerFrame::ConnectSuccess { details }) => return Ok(details),
                        Ok(ServerFrame::Error { error }) => return Err(error.into_error()),
                        Ok(ServerFrame::Disconnect { reason }) => {
                            return Err(SyncError::transient(format!(
                                "disconnected during handshake: {reason}"
                            )));
                        }
                        Ok(_) => {
                            trace!(target: "riptide::ws", "frame before handshake ignored");
                        }
                        Err(err) => {
                            warn!(target: "riptide::ws", error = %err, "unparseable handshake frame");
                        }
                    }
                }
            }
            Err(SyncError::transient("websocket closed during handshake"))
        })
        .await
        .map_err(|_| SyncError::transient("websocket handshake timed out"))??;

        debug!(
            target: "riptide::ws",
            client_id = %details.client_id,
            mode = ?details.mode,
            "delta stream connected"
        );

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outgoing>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<StreamEvent>();

        // Writer: owns the sink; resolves submit_async acks.
        tokio::spawn(async move {
            while let Some(outgoing) = out_rx.recv().await {
                match outgoing {
                    Outgoing::Frame(frame) => {
                        if sink.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Outgoing::Acked(frame, ack) => {
                        let result = sink.send(frame).await.map_err(|err| {
                            SyncError::transient(format!("websocket send failed: {err}"))
                        });
                        let failed = result.is_err();
                        let _ = ack.send(result);
                        if failed {
                            break;
                        }
                    }
                }
            }
        });

        // Reader: turns frames into stream events until the socket drops.
        let reader_events = event_tx.clone();
        let epoch_start = Instant::now();
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerFrame>(&text) {
                        Ok(frame) => {
                            let event = match frame {
                                ServerFrame::Op { messages } => StreamEvent::Op(messages),
                                ServerFrame::OpContent { content } => {
                                    StreamEvent::OpContent(content)
                                }
                                ServerFrame::Signal { signal } => StreamEvent::Signal(signal),
                                ServerFrame::Nack { target } => StreamEvent::Nack { target },
                                ServerFrame::Disconnect { reason } => {
                                    let _ = reader_events.send(StreamEvent::Disconnect { reason });
                                    break;
                                }
                                ServerFrame::Error { error } => {
                                    StreamEvent::Error(error.into_error())
                                }
                                ServerFrame::ConnectSuccess { .. } => {
                                    trace!(target: "riptide::ws", "duplicate handshake frame ignored");
                                    continue;
                                }
                            };
                            if reader_events.send(event).is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            warn!(target: "riptide::ws", error = %err, "unparseable frame dropped");
                        }
                    },
                    Ok(Message::Pong(payload)) => {
                        if let Ok(bytes) = <[u8; 8]>::try_from(payload.as_slice()) {
                            let sent = Duration::from_millis(u64::from_le_bytes(bytes));
                            let latency = epoch_start.elapsed().saturating_sub(sent);
                            let _ = reader_events.send(StreamEvent::Pong(latency));
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => {
                        let _ = reader_events.send(StreamEvent::Disconnect {
                            reason: "socket closed".into(),
                        });
                        break;
                    }
                    Ok(_) => {}
                }
            }
        });

        // Ping loop; stops once the writer side is gone.
        let ping_tx = out_tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PING_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let stamp = epoch_start.elapsed().as_millis() as u64;
                let frame = Message::Ping(stamp.to_le_bytes().to_vec());
                if ping_tx.send(Outgoing::Frame(frame)).is_err() {
                    break;
                }
            }
        });

        let connection = Arc::new(WebSocketDeltaStream {
            details,
            out_tx,
            closed: AtomicBool::new(false),
        });

        Ok(StreamHandle {
            connection,
            events: event_rx,
        })
    }

    async fn connect_to_delta_storage(&self) -> Result<Arc<dyn DeltaStorage>, SyncError> {
        Ok(Arc::clone(&self.storage))
    }
}

struct WebSocketDeltaStream {
    details: ConnectionDetails,
    out_tx: mpsc::UnboundedSender<Outgoing>,
    closed: AtomicBool,
}

impl WebSocketDeltaStream {
    fn encode<T: Serialize>(frame: &T) -> Result<Message, SyncError> {
        let text = serde_json::to_string(frame)
            .map_err(|err| SyncError::fatal(format!("encode frame: {err}")))?;
        Ok(Message::Text(text))
    }

    fn send(&self, frame: Message) -> Result<(), SyncError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::transient("connection closed"));
        }
        self.out_tx
            .send(Outgoing::Frame(frame))
            .map_err(|_| SyncError::transient("connection closed"))
    }
}

#[async_trait]
impl DeltaStreamConnection for WebSocketDeltaStream {
    fn details(&self) -> &ConnectionDetails {
        &self.details
    }

    fn submit(&self, batch: &[OutboundMessage]) -> Result<(), SyncError> {
        self.send(Self::encode(&ClientFrame::SubmitOp { messages: batch })?)
    }

    async fn submit_async(&self, batch: &[OutboundMessage]) -> Result<(), SyncError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::transient("connection closed"));
        }
        let frame = Self::encode(&ClientFrame::SubmitOp { messages: batch })?;
        let (ack_tx, ack_rx) = oneshot::channel();
        self.out_tx
            .send(Outgoing::Acked(frame, ack_tx))
            .map_err(|_| SyncError::transient("connection closed"))?;
        ack_rx
            .await
            .map_err(|_| SyncError::transient("connection closed"))?
    }

    fn submit_signal(&self, content: &str) -> Result<(), SyncError> {
        self.send(Self::encode(&ClientFrame::SubmitSignal { content })?)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.out_tx.send(Outgoing::Frame(Message::Close(None)));
    }
}
