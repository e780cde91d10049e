//! Seams onto the document service and its collaborators.
//!
//! The delta manager and epoch tracker only ever talk to these traits; the
//! production implementations live in [`websocket`] and [`storage`], and the
//! test suites substitute scripted mocks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::SyncError;
use crate::protocol::{
    ClientProfile, ConnectionDetails, ConnectionMode, ContentMessage, OutboundMessage, Seq,
    SequencedMessage, SignalMessage,
};

pub mod storage;
pub mod websocket;

/// Everything a live delta stream can tell us.
#[derive(Debug)]
pub enum StreamEvent {
    /// One or more sequenced ops, in the order the server emitted them.
    Op(Vec<SequencedMessage>),
    /// Out-of-band contents for an op that travelled without them.
    OpContent(ContentMessage),
    Signal(SignalMessage),
    /// The server rejected a write; `target` is the sequence number it was
    /// at, or -1.
    Nack { target: i64 },
    Disconnect { reason: String },
    Error(SyncError),
    Pong(Duration),
}

/// A freshly opened delta stream: the submit surface plus its event feed.
pub struct StreamHandle {
    pub connection: Arc<dyn DeltaStreamConnection>,
    pub events: mpsc::UnboundedReceiver<StreamEvent>,
}

/// The realtime bidirectional socket, post-handshake.
#[async_trait]
pub trait DeltaStreamConnection: Send + Sync {
    fn details(&self) -> &ConnectionDetails;

    /// Fire-and-forget submit of one batch.
    fn submit(&self, batch: &[OutboundMessage]) -> Result<(), SyncError>;

    /// Submit that completes once the socket has accepted the batch.
    async fn submit_async(&self, batch: &[OutboundMessage]) -> Result<(), SyncError>;

    fn submit_signal(&self, content: &str) -> Result<(), SyncError>;

    fn close(&self);
}

/// Bounded REST history endpoint.
///
/// `get(from, to)` returns messages with sequence numbers strictly between
/// `from` and `to` (exclusive on both ends) and may return more than asked.
#[async_trait]
pub trait DeltaStorage: Send + Sync {
    async fn get(&self, from: Seq, to: Seq) -> Result<Vec<SequencedMessage>, SyncError>;
}

/// The document service: a stream factory plus storage access.
#[async_trait]
pub trait DocumentService: Send + Sync {
    async fn connect_to_delta_stream(
        &self,
        client: &ClientProfile,
        mode: ConnectionMode,
    ) -> Result<StreamHandle, SyncError>;

    async fn connect_to_delta_storage(&self) -> Result<Arc<dyn DeltaStorage>, SyncError>;
}

/// What the handler reports back for a processed message.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessOutcome {
    /// Request an immediate no-op acknowledgement instead of the lazy timer.
    pub immediate_no_op: bool,
}

/// A parsed out-of-band signal.
#[derive(Debug, Clone)]
pub struct SignalEnvelope {
    pub client_id: Option<String>,
    pub content: Value,
}

/// Consumer of the ordered stream.  `process` is invoked exactly once per
/// sequence number, in order.
pub trait OpHandler: Send + Sync {
    fn process(&self, message: &SequencedMessage) -> Result<ProcessOutcome, SyncError>;

    fn process_signal(&self, signal: SignalEnvelope) -> Result<(), SyncError>;
}

/// File-scoped key under which cached artifacts live.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileEntry {
    pub document_id: String,
    pub file_url: String,
}

/// A value read back from the persistent cache.
#[derive(Debug, Clone)]
pub struct CachedValue {
    pub fluid_epoch: Option<String>,
    pub value: Value,
}

/// Identifies one entry within a file's cache namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheEntryKey {
    pub file: FileEntry,
    pub kind: String,
}

/// Content-addressable persistent cache.  The epoch tracker is its only
/// writer and purges a whole file's entries on epoch divergence.
#[async_trait]
pub trait PersistentCache: Send + Sync {
    async fn get(
        &self,
        entry: &CacheEntryKey,
        max_op_count: Option<u64>,
    ) -> Result<Option<CachedValue>, SyncError>;

    async fn remove_entries(&self, file: &FileEntry) -> Result<(), SyncError>;
}
