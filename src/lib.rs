//! Riptide: client-side delta synchronization core for collaborative
//! document sessions.
//!
//! The crate has two loosely coupled halves.  The [`manager::DeltaManager`]
//! keeps a totally ordered stream of sequenced operations flowing between a
//! client and a document service over a realtime socket plus a bounded REST
//! history endpoint: it owns the connection lifecycle, the staged inbound
//! queues, outbound batching and acknowledgement, and the content
//! side-channel.  The [`epoch::EpochTracker`] binds every request and cached
//! artifact to a server-assigned epoch and invalidates local caches when the
//! epoch diverges.
//!
//! Everything the core consumes — the document service, the op handler, the
//! persistent cache — is a trait defined in [`service`], so the whole
//! pipeline runs against mocks in tests.

pub mod config;
pub mod epoch;
pub mod error;
pub mod manager;
pub mod protocol;
pub mod queue;
pub mod service;
pub mod telemetry;
pub mod util;

pub use config::DeltaManagerConfig;
pub use error::SyncError;
pub use manager::{ConnectionState, ConnectionStats, DeltaManager, DeltaManagerEvent};
pub use protocol::{
    ConnectionDetails, ConnectionMode, ContentMessage, MessageType, OutboundMessage, Seq,
    SequencedMessage, SignalMessage,
};
pub use service::{
    DeltaStorage, DeltaStreamConnection, DocumentService, OpHandler, PersistentCache,
    ProcessOutcome, StreamEvent, StreamHandle,
};
