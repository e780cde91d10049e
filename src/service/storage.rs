//! REST history endpoint client.
//!
//! All requests flow through the epoch tracker so they are annotated,
//! validated, and rate limited like every other epoch-scoped call.

use std::sync::Arc;

use async_trait::async_trait;

use crate::epoch::{EpochTracker, FetchKind, HttpRequest};
use crate::error::SyncError;
use crate::protocol::{Seq, SequencedMessage};
use crate::service::DeltaStorage;

use url::Url;

pub struct RestDeltaStorage {
    tracker: Arc<EpochTracker>,
    endpoint: Url,
    document_id: String,
}

impl RestDeltaStorage {
    pub fn new(tracker: Arc<EpochTracker>, endpoint: Url, document_id: impl Into<String>) -> Self {
        Self {
            tracker,
            endpoint,
            document_id: document_id.into(),
        }
    }

    fn deltas_url(&self, from: Seq, to: Seq) -> Result<Url, SyncError> {
        let mut url = self
            .endpoint
            .join(&format!("deltas/{}", self.document_id))
            .map_err(|err| SyncError::fatal(format!("invalid storage endpoint: {err}")))?;
        url.query_pairs_mut()
            .append_pair("from", &from.to_string())
            .append_pair("to", &to.to_string());
        Ok(url)
    }
}

#[async_trait]
impl DeltaStorage for RestDeltaStorage {
    async fn get(&self, from: Seq, to: Seq) -> Result<Vec<SequencedMessage>, SyncError> {
        let url = self.deltas_url(from, to)?;
        self.tracker
            .fetch_and_parse_json(HttpRequest::get(url), FetchKind::Ops, false)
            .await
    }
}
