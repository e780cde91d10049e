//! Epoch tracker specialization coordinating the trees-latest /
//! join-session race.
//!
//! Joining a shared file can outrun the storage call that redeems the
//! sharing link.  The first successful `TreesLatest` fetch proves access
//! and resolves a one-shot latch; a `JoinSession` that 404s before that
//! point waits for the latch and retries once.

use std::sync::Mutex;

use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::SyncError;
use crate::util::Deferred;

use super::{EpochTracker, FetchKind, HttpRequest, HttpResponse};

/// One-shot resolvable latch: one producer resolves or rejects, any number
/// of consumers await.
pub struct ResolvableLatch {
    deferred: Deferred<()>,
    callback: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl ResolvableLatch {
    pub fn new() -> Self {
        Self {
            deferred: Deferred::new(),
            callback: Mutex::new(None),
        }
    }

    pub fn resolve(&self) -> bool {
        self.deferred.resolve(())
    }

    pub fn reject(&self, error: SyncError) -> bool {
        self.deferred.reject(error)
    }

    pub fn is_complete(&self) -> bool {
        self.deferred.is_complete()
    }

    /// Reserved hook invoked before each `wait`; never set in tree, kept
    /// for forward compatibility.
    pub fn set_callback(&self, callback: Box<dyn Fn() + Send + Sync>) {
        *self.callback.lock().expect("latch callback poisoned") = Some(callback);
    }

    pub async fn wait(&self) -> Result<(), SyncError> {
        if let Some(callback) = self
            .callback
            .lock()
            .expect("latch callback poisoned")
            .as_ref()
        {
            callback();
        }
        self.deferred.wait().await
    }
}

impl Default for ResolvableLatch {
    fn default() -> Self {
        Self::new()
    }
}

/// [`EpochTracker`] wrapper that gates join-session retries on redemption.
pub struct RedeemingEpochTracker {
    tracker: EpochTracker,
    latch: ResolvableLatch,
}

impl RedeemingEpochTracker {
    pub fn new(tracker: EpochTracker) -> Self {
        Self {
            tracker,
            latch: ResolvableLatch::new(),
        }
    }

    pub fn tracker(&self) -> &EpochTracker {
        &self.tracker
    }

    pub fn latch(&self) -> &ResolvableLatch {
        &self.latch
    }

    pub async fn fetch_response(
        &self,
        request: HttpRequest,
        kind: FetchKind,
        add_in_body: bool,
    ) -> Result<HttpResponse, SyncError> {
        self.tracker.fetch_response(request, kind, add_in_body).await
    }

    /// Like [`EpochTracker::fetch_and_parse_json`], plus the redemption
    /// protocol for `TreesLatest` and `JoinSession`.
    pub async fn fetch_and_parse_json<T: DeserializeOwned>(
        &self,
        request: HttpRequest,
        kind: FetchKind,
        add_in_body: bool,
    ) -> Result<T, SyncError> {
        match kind {
            FetchKind::TreesLatest => {
                let result = self
                    .tracker
                    .fetch_and_parse_json(request, kind, add_in_body)
                    .await;
                match &result {
                    Ok(_) => {
                        self.latch.resolve();
                    }
                    Err(err) => {
                        self.latch.reject(err.clone());
                    }
                }
                result
            }
            FetchKind::JoinSession => {
                let redeemed_at_entry = self.latch.is_complete();
                let result = self
                    .tracker
                    .fetch_and_parse_json(request.clone(), kind, add_in_body)
                    .await;
                match result {
                    Err(err) if err.status() == Some(404) && !redeemed_at_entry => {
                        debug!(
                            target: "riptide::epoch",
                            "join before redemption 404'd, waiting for trees-latest"
                        );
                        self.latch.wait().await?;
                        self.tracker
                            .fetch_and_parse_json(request, kind, add_in_body)
                            .await
                    }
                    other => other,
                }
            }
            _ => {
                self.tracker
                    .fetch_and_parse_json(request, kind, add_in_body)
                    .await
            }
        }
    }
}
