//! Epoch learning, divergence handling, rate limiting, and the
//! join-session redemption race, against a scripted HTTP backend.

mod support;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use url::Url;

use riptide::epoch::{
    EpochTracker, FetchKind, HttpRequest, RateLimiter, RedeemingEpochTracker, EPOCH_HEADER,
};
use riptide::service::{CacheEntryKey, CachedValue};
use riptide::SyncError;

use support::{file_entry, ok_response, response, wait_until, MockCache, MockHttpBackend};

fn tracker_with(
    backend: &Arc<MockHttpBackend>,
    cache: &Arc<MockCache>,
) -> EpochTracker {
    let tracker = EpochTracker::with_backend(
        Arc::clone(backend) as Arc<dyn riptide::epoch::HttpBackend>,
        Arc::clone(cache) as Arc<dyn riptide::service::PersistentCache>,
    );
    tracker.set_file_entry(file_entry()).unwrap();
    tracker
}

fn url(path: &str) -> Url {
    Url::parse(&format!("https://service.example/{path}")).unwrap()
}

async fn learn_epoch(tracker: &EpochTracker, backend: &Arc<MockHttpBackend>, epoch: &str) {
    backend.script("prime", Ok(ok_response(Some(epoch), "{}")));
    let _: Value = tracker
        .fetch_and_parse_json(HttpRequest::get(url("prime")), FetchKind::Other, false)
        .await
        .unwrap();
    assert_eq!(tracker.epoch().as_deref(), Some(epoch));
}

/// S5: learn on first contact, then mismatch purges the cache exactly once
/// and surfaces the error.
#[tokio::test]
async fn learn_then_mismatch_purges_once() {
    let backend = MockHttpBackend::new();
    let cache = MockCache::new();
    let tracker = tracker_with(&backend, &cache);

    learn_epoch(&tracker, &backend, "A").await;

    backend.script("snapshot", Ok(ok_response(Some("B"), "{}")));
    let err = tracker
        .fetch_and_parse_json::<Value>(
            HttpRequest::get(url("snapshot")),
            FetchKind::SnapshotTree,
            false,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::EpochMismatch { .. }));
    assert_eq!(cache.removed_count(), 1);
    assert_eq!(cache.removed.lock().unwrap()[0], file_entry());
}

/// Property: for responses (e, e, e, e'), exactly one purge, on the first
/// divergent response.
#[tokio::test]
async fn purge_happens_exactly_once_at_divergence() {
    let backend = MockHttpBackend::new();
    let cache = MockCache::new();
    let tracker = tracker_with(&backend, &cache);

    for _ in 0..3 {
        backend.script("ops", Ok(ok_response(Some("A"), "[]")));
        let _: Value = tracker
            .fetch_and_parse_json(HttpRequest::get(url("ops")), FetchKind::Ops, false)
            .await
            .unwrap();
        assert_eq!(cache.removed_count(), 0);
    }
    backend.script("ops", Ok(ok_response(Some("Z"), "[]")));
    let err = tracker
        .fetch_and_parse_json::<Value>(HttpRequest::get(url("ops")), FetchKind::Ops, false)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::EpochMismatch { .. }));
    assert_eq!(cache.removed_count(), 1);
}

/// S6: a reported epoch error whose response epoch matches ours is a
/// coherency conflict, translated to a 1 s throttle with no purge.
#[tokio::test]
async fn coherency_conflict_translates_to_throttle() {
    let backend = MockHttpBackend::new();
    let cache = MockCache::new();
    let tracker = tracker_with(&backend, &cache);

    learn_epoch(&tracker, &backend, "A").await;

    backend.script(
        "join",
        Ok(response(
            409,
            Some("A"),
            r#"{"errorType":"epochVersionMismatch","statusCode":409}"#,
        )),
    );
    let err = tracker
        .fetch_and_parse_json::<Value>(
            HttpRequest::get(url("join")),
            FetchKind::JoinSession,
            false,
        )
        .await
        .unwrap_err();
    match err {
        SyncError::Throttled {
            retry_after,
            status,
            ..
        } => {
            assert_eq!(retry_after, Duration::from_secs(1));
            assert_eq!(status, Some(429));
        }
        other => panic!("expected throttle, got {other:?}"),
    }
    assert_eq!(cache.removed_count(), 0);
}

/// Responses without an epoch header are accepted as-is.
#[tokio::test]
async fn absent_epoch_is_a_no_op() {
    let backend = MockHttpBackend::new();
    let cache = MockCache::new();
    let tracker = tracker_with(&backend, &cache);

    learn_epoch(&tracker, &backend, "A").await;
    backend.script("blob", Ok(ok_response(None, "{}")));
    let _: Value = tracker
        .fetch_and_parse_json(HttpRequest::get(url("blob")), FetchKind::Blob, false)
        .await
        .unwrap();
    assert_eq!(tracker.epoch().as_deref(), Some("A"));
    assert_eq!(cache.removed_count(), 0);
}

/// Annotation: a known epoch rides the query string by default.
#[tokio::test]
async fn epoch_annotates_the_query_string() {
    let backend = MockHttpBackend::new();
    let cache = MockCache::new();
    let tracker = tracker_with(&backend, &cache);

    learn_epoch(&tracker, &backend, "A").await;
    backend.script("versions", Ok(ok_response(Some("A"), "{}")));
    let _: Value = tracker
        .fetch_and_parse_json(
            HttpRequest::get(url("versions")),
            FetchKind::Versions,
            false,
        )
        .await
        .unwrap();

    let recorded = backend.requests_matching("versions");
    assert_eq!(recorded[0].url.query(), Some("epoch=A"));
}

/// Annotation: oversized URLs fall back to the epoch header.
#[tokio::test]
async fn long_urls_fall_back_to_the_header() {
    let backend = MockHttpBackend::new();
    let cache = MockCache::new();
    let tracker = tracker_with(&backend, &cache);

    learn_epoch(&tracker, &backend, "A").await;
    let long_path = format!("versions/{}", "x".repeat(2100));
    backend.script("versions", Ok(ok_response(Some("A"), "{}")));
    let _: Value = tracker
        .fetch_and_parse_json(
            HttpRequest::get(url(&long_path)),
            FetchKind::Versions,
            false,
        )
        .await
        .unwrap();

    let recorded = backend.requests_matching("versions");
    assert!(recorded[0].url.query().is_none());
    assert!(recorded[0]
        .headers
        .iter()
        .any(|(name, value)| name == EPOCH_HEADER && value == "A"));
}

/// Annotation: multipart bodies get an epoch form field after the boundary.
#[tokio::test]
async fn multipart_bodies_carry_the_epoch_field() {
    let backend = MockHttpBackend::new();
    let cache = MockCache::new();
    let tracker = tracker_with(&backend, &cache);

    learn_epoch(&tracker, &backend, "A").await;
    let body = "--formBoundary\r\ncontent-type: application/json\r\n\r\n{}\r\n--formBoundary--\r\n";
    backend.script("upload", Ok(ok_response(Some("A"), "{}")));
    let _: Value = tracker
        .fetch_and_parse_json(
            HttpRequest::post(url("upload"), bytes::Bytes::from(body)),
            FetchKind::UploadSummary,
            true,
        )
        .await
        .unwrap();

    let recorded = backend.requests_matching("upload");
    let sent = recorded[0].body.as_ref().unwrap();
    let text = std::str::from_utf8(sent).unwrap();
    assert!(text.starts_with("--formBoundary\r\nepoch=A\r\n"));
    // URL untouched when the epoch rides the body.
    assert!(recorded[0].url.query().is_none());
}

/// Cached entries are admitted only under the current epoch.
#[tokio::test]
async fn cache_entries_gated_by_epoch() {
    let backend = MockHttpBackend::new();
    let cache = MockCache::new();
    let tracker = tracker_with(&backend, &cache);

    learn_epoch(&tracker, &backend, "A").await;
    cache.insert(
        "snapshot",
        CachedValue {
            fluid_epoch: Some("A".to_string()),
            value: json!({"tree": 1}),
        },
    );
    let entry = CacheEntryKey {
        file: file_entry(),
        kind: "snapshot".to_string(),
    };
    let hit: Option<Value> = tracker
        .fetch_from_cache(&entry, None, FetchKind::SnapshotTree)
        .await
        .unwrap();
    assert_eq!(hit, Some(json!({"tree": 1})));

    cache.insert(
        "snapshot",
        CachedValue {
            fluid_epoch: Some("B".to_string()),
            value: json!({"tree": 2}),
        },
    );
    let err = tracker
        .fetch_from_cache::<Value>(&entry, None, FetchKind::SnapshotTree)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::EpochMismatch { .. }));
    assert_eq!(cache.removed_count(), 1);
}

/// Property: scheduled work never exceeds the permit ceiling.
#[tokio::test]
async fn rate_limiter_bounds_concurrency() {
    let backend = MockHttpBackend::new();
    let cache = MockCache::new();
    let tracker = Arc::new(tracker_with(&backend, &cache));
    *backend.delay.lock().unwrap() = Some(Duration::from_millis(5));

    let mut handles = Vec::new();
    for i in 0..60 {
        let tracker = Arc::clone(&tracker);
        handles.push(tokio::spawn(async move {
            let _: Value = tracker
                .fetch_and_parse_json(
                    HttpRequest::get(
                        Url::parse(&format!("https://service.example/bulk/{i}")).unwrap(),
                    ),
                    FetchKind::Other,
                    false,
                )
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    assert!(backend.peak.load(std::sync::atomic::Ordering::SeqCst) <= 24);
}

#[tokio::test]
async fn standalone_rate_limiter_serves_fifo() {
    let limiter = Arc::new(RateLimiter::new(24));
    let result = limiter.schedule(async { 7 }).await;
    assert_eq!(result, 7);
    assert_eq!(limiter.available(), 24);
}

/// S7: a join-session 404 issued before redemption waits for trees-latest
/// and retries exactly once.
#[tokio::test]
async fn join_session_race_waits_for_redemption() {
    let backend = MockHttpBackend::new();
    let cache = MockCache::new();
    let tracker = Arc::new(RedeemingEpochTracker::new(tracker_with(&backend, &cache)));

    backend.script(
        "joinSession",
        Ok(response(404, None, r#"{"statusCode":404}"#)),
    );
    backend.script("joinSession", Ok(ok_response(None, r#"{"ok":true}"#)));
    backend.script("treesLatest", Ok(ok_response(None, "{}")));

    let join_tracker = Arc::clone(&tracker);
    let join = tokio::spawn(async move {
        join_tracker
            .fetch_and_parse_json::<Value>(
                HttpRequest::get(url("joinSession")),
                FetchKind::JoinSession,
                false,
            )
            .await
    });

    // The first attempt 404s and parks on the latch; no second attempt yet.
    wait_until(|| backend.requests_matching("joinSession").len() == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(backend.requests_matching("joinSession").len(), 1);
    assert!(!tracker.latch().is_complete());

    let _: Value = tracker
        .fetch_and_parse_json(
            HttpRequest::get(url("treesLatest")),
            FetchKind::TreesLatest,
            false,
        )
        .await
        .unwrap();
    assert!(tracker.latch().is_complete());

    let joined = join.await.unwrap().unwrap();
    assert_eq!(joined, json!({"ok": true}));
    assert_eq!(backend.requests_matching("joinSession").len(), 2);
    assert_eq!(backend.requests_matching("treesLatest").len(), 1);
}

/// After redemption, a join-session 404 propagates without retry.
#[tokio::test]
async fn join_session_404_after_redemption_propagates() {
    let backend = MockHttpBackend::new();
    let cache = MockCache::new();
    let tracker = RedeemingEpochTracker::new(tracker_with(&backend, &cache));

    backend.script("treesLatest", Ok(ok_response(None, "{}")));
    let _: Value = tracker
        .fetch_and_parse_json(
            HttpRequest::get(url("treesLatest")),
            FetchKind::TreesLatest,
            false,
        )
        .await
        .unwrap();

    backend.script(
        "joinSession",
        Ok(response(404, None, r#"{"statusCode":404}"#)),
    );
    let err = tracker
        .fetch_and_parse_json::<Value>(
            HttpRequest::get(url("joinSession")),
            FetchKind::JoinSession,
            false,
        )
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(404));
    assert_eq!(backend.requests_matching("joinSession").len(), 1);
}

/// A failed trees-latest rejects the latch, failing parked joins.
#[tokio::test]
async fn trees_latest_failure_rejects_waiting_join() {
    let backend = MockHttpBackend::new();
    let cache = MockCache::new();
    let tracker = Arc::new(RedeemingEpochTracker::new(tracker_with(&backend, &cache)));

    backend.script(
        "joinSession",
        Ok(response(404, None, r#"{"statusCode":404}"#)),
    );
    backend.script(
        "treesLatest",
        Ok(response(403, None, r#"{"canRetry":false,"statusCode":403}"#)),
    );

    let join_tracker = Arc::clone(&tracker);
    let join = tokio::spawn(async move {
        join_tracker
            .fetch_and_parse_json::<Value>(
                HttpRequest::get(url("joinSession")),
                FetchKind::JoinSession,
                false,
            )
            .await
    });
    wait_until(|| backend.requests_matching("joinSession").len() == 1).await;

    let trees = tracker
        .fetch_and_parse_json::<Value>(
            HttpRequest::get(url("treesLatest")),
            FetchKind::TreesLatest,
            false,
        )
        .await;
    assert!(trees.is_err());

    let err = join.await.unwrap().unwrap_err();
    assert!(matches!(err, SyncError::Fatal { .. }));
    assert_eq!(backend.requests_matching("joinSession").len(), 1);
}

/// Epochs reported by the realtime handshake are validated the same way.
#[tokio::test]
async fn push_epoch_divergence_purges_cache() {
    let backend = MockHttpBackend::new();
    let cache = MockCache::new();
    let tracker = tracker_with(&backend, &cache);

    learn_epoch(&tracker, &backend, "A").await;
    let details = riptide::ConnectionDetails {
        client_id: "c1".to_string(),
        mode: riptide::ConnectionMode::Write,
        service_configuration: None,
        max_message_size: None,
        initial_messages: Vec::new(),
        initial_contents: Vec::new(),
        initial_signals: Vec::new(),
        version: None,
        claims: None,
        epoch: Some("B".to_string()),
    };
    let err = tracker.validate_epoch_from_push(&details).await.unwrap_err();
    assert!(matches!(err, SyncError::EpochMismatch { .. }));
    assert_eq!(cache.removed_count(), 1);
}

/// The file entry is settable exactly once.
#[tokio::test]
async fn file_entry_set_once() {
    let backend = MockHttpBackend::new();
    let cache = MockCache::new();
    let tracker = tracker_with(&backend, &cache);
    assert!(tracker.set_file_entry(file_entry()).is_err());
    assert_eq!(tracker.file_entry(), Some(&file_entry()));
}
