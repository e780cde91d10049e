//! Wire value types exchanged with the document service.
//!
//! Field names mirror the service JSON (camelCase); the structs stay plain
//! data so both the realtime stream and the history endpoint can reuse them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Document-scoped sequence number.
pub type Seq = u64;

/// Kind of a protocol message.
///
/// Everything except `Operation` is a system message: the server inspects
/// its payload, which therefore rides in the top-level `data` field rather
/// than `contents`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "op")]
    Operation,
    #[serde(rename = "join")]
    ClientJoin,
    #[serde(rename = "leave")]
    ClientLeave,
    #[serde(rename = "propose")]
    Propose,
    #[serde(rename = "reject")]
    Reject,
    #[serde(rename = "noop")]
    NoOp,
}

impl MessageType {
    pub fn is_system(self) -> bool {
        !matches!(self, MessageType::Operation)
    }
}

/// One hop annotation carried for end-to-end latency accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub service: String,
    pub action: String,
    pub timestamp: f64,
}

/// A server-sequenced message.  Sequence numbers are strictly increasing in
/// the authoritative stream; the minimum sequence number never decreases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequencedMessage {
    pub sequence_number: Seq,
    pub minimum_sequence_number: Seq,
    #[serde(default)]
    pub client_id: Option<String>,
    pub client_sequence_number: i64,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contents: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traces: Vec<Trace>,
}

/// Out-of-band payload for an op whose `contents` travelled separately.
/// Uniquely keyed by `(client_id, client_sequence_number)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentMessage {
    pub client_id: String,
    pub client_sequence_number: i64,
    pub contents: Value,
}

/// A message this client is submitting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub client_sequence_number: i64,
    pub reference_sequence_number: Seq,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contents: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traces: Vec<Trace>,
}

/// An out-of-band signal.  `content` is JSON text; the signal worker parses
/// it before handing it to the handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    #[serde(default)]
    pub client_id: Option<String>,
    pub content: String,
}

/// Whether the connection may submit ops or only observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    Read,
    Write,
}

impl Default for ConnectionMode {
    fn default() -> Self {
        ConnectionMode::Write
    }
}

/// Everything the service tells us about a freshly opened delta stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDetails {
    pub client_id: String,
    #[serde(default)]
    pub mode: ConnectionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_configuration: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_message_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub initial_messages: Vec<SequencedMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub initial_contents: Vec<ContentMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub initial_signals: Vec<SignalMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claims: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<String>,
}

impl ConnectionDetails {
    /// Advertised size limit, falling back to the default chunk size.
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
            .unwrap_or(crate::config::DEFAULT_CHUNK_SIZE)
    }
}

/// Client identity offered when opening a delta stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}
