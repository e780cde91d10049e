//! Retriable bounded-batch fetch over the history endpoint.
//!
//! A fetch walks the requested range in `max_batch_deltas` windows under
//! the storage endpoint's exclusive bounds.  Empty batches and retryable
//! errors back off exponentially (`min(max, base * 2^k)`), a
//! service-supplied retry-after always wins, and the retry counter resets
//! whenever a batch makes progress.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::DeltaManagerConfig;
use crate::error::SyncError;
use crate::protocol::{Seq, SequencedMessage};
use crate::service::DeltaStorage;
use crate::telemetry;

pub(crate) struct DeltaFetcher {
    missing_fetch_delay: Duration,
    max_fetch_delay: Duration,
    max_batch_deltas: u64,
    closed: Arc<AtomicBool>,
}

impl DeltaFetcher {
    pub fn new(config: &DeltaManagerConfig, closed: Arc<AtomicBool>) -> Self {
        Self {
            missing_fetch_delay: config.missing_fetch_delay,
            max_fetch_delay: config.max_fetch_delay,
            max_batch_deltas: config.max_batch_deltas,
            closed,
        }
    }

    fn backoff(&self, retry: u32) -> Duration {
        let base = self.missing_fetch_delay.as_millis() as u64;
        let exp = base.saturating_mul(1u64.checked_shl(retry).unwrap_or(u64::MAX));
        Duration::from_millis(exp.min(self.max_fetch_delay.as_millis() as u64))
    }

    /// Fetch messages with sequence numbers in `(from, to)` exclusive, or
    /// everything past `from` when `to` is `None`, feeding each batch to
    /// `emit` as it lands.
    pub async fn fetch<F>(
        &self,
        reason: &str,
        storage: &Arc<dyn DeltaStorage>,
        from: Seq,
        to: Option<Seq>,
        mut emit: F,
    ) -> Result<(), SyncError>
    where
        F: FnMut(Vec<SequencedMessage>),
    {
        let mut from = from;
        let mut retry: u32 = 0;
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(());
            }
            let max_fetch_to = from.saturating_add(self.max_batch_deltas);
            let fetch_to = to.map_or(max_fetch_to, |t| t.min(max_fetch_to));

            match storage.get(from, fetch_to).await {
                Ok(deltas) => {
                    let retrieved = deltas.len();
                    let last_fetch = deltas
                        .last()
                        .map(|m| m.sequence_number)
                        .unwrap_or(from);
                    debug!(
                        target: "riptide::fetch",
                        reason,
                        from,
                        fetch_to,
                        retrieved,
                        "deltas retrieved"
                    );
                    telemetry::record_gauge("deltas_retrieved", retrieved as u64);
                    if retrieved > 0 {
                        emit(deltas);
                        retry = 0;
                    }
                    match to {
                        // Unbounded: a window that came back short means the
                        // source is exhausted.
                        None if last_fetch < max_fetch_to.saturating_sub(1) => return Ok(()),
                        Some(t) if t.saturating_sub(1) <= last_fetch => return Ok(()),
                        _ => {}
                    }
                    from = last_fetch;
                    if retrieved == 0 {
                        retry += 1;
                        let delay = self.backoff(retry);
                        debug!(target: "riptide::fetch", reason, retry, ?delay, "empty batch, backing off");
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(err) => {
                    if !err.can_retry() {
                        warn!(target: "riptide::fetch", reason, error = %err, "fetch failed fatally");
                        return Err(err);
                    }
                    retry += 1;
                    let delay = err.retry_after().unwrap_or_else(|| self.backoff(retry));
                    warn!(
                        target: "riptide::fetch",
                        reason,
                        retry,
                        ?delay,
                        error = %err,
                        "fetch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
