//! Epoch-versioning core.
//!
//! Every request to the document service carries the current epoch once it
//! is known; every response can teach or contradict it.  On divergence the
//! tracker purges the file's persisted cache entries so no stale artifact
//! survives the server-side reset.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{DEFAULT_CONCURRENT_REQUESTS, MAX_URL_LENGTH};
use crate::error::{ErrorBody, SyncError};
use crate::protocol::ConnectionDetails;
use crate::service::{CacheEntryKey, FileEntry, PersistentCache};

pub mod rate_limit;
pub mod redeem;

pub use rate_limit::RateLimiter;
pub use redeem::{RedeemingEpochTracker, ResolvableLatch};

/// Header the service uses to carry the epoch in both directions.
pub const EPOCH_HEADER: &str = "x-fluid-epoch";

/// What a request is for; feeds tracing and telemetry labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchKind {
    Blob,
    CreateBlob,
    CreateFile,
    JoinSession,
    Ops,
    SnapshotTree,
    TreesLatest,
    UploadSummary,
    Push,
    Versions,
    Other,
}

impl FetchKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FetchKind::Blob => "blob",
            FetchKind::CreateBlob => "createBlob",
            FetchKind::CreateFile => "createFile",
            FetchKind::JoinSession => "joinSession",
            FetchKind::Ops => "ops",
            FetchKind::SnapshotTree => "snapshotTree",
            FetchKind::TreesLatest => "treesLatest",
            FetchKind::UploadSummary => "uploadSummary",
            FetchKind::Push => "push",
            FetchKind::Versions => "versions",
            FetchKind::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }
}

/// One outgoing request, before epoch annotation.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

impl HttpRequest {
    pub fn get(url: Url) -> Self {
        Self {
            method: HttpMethod::Get,
            url,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post(url: Url, body: Bytes) -> Self {
        Self {
            method: HttpMethod::Post,
            url,
            headers: Vec::new(),
            body: Some(body),
        }
    }
}

/// A response with lowercased header names.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|v| v.as_str())
    }

    pub fn epoch(&self) -> Option<&str> {
        self.header(EPOCH_HEADER)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Transport seam so the tracker runs against mocks in tests.
#[async_trait]
pub trait HttpBackend: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, SyncError>;
}

struct ReqwestBackend {
    client: reqwest::Client,
}

impl ReqwestBackend {
    fn new() -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| SyncError::fatal(format!("http client build failed: {err}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpBackend for ReqwestBackend {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, SyncError> {
        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|err| SyncError::fatal(format!("invalid method: {err}")))?;
        let mut builder = self.client.request(method, request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        let response = builder
            .send()
            .await
            .map_err(|err| SyncError::transient(format!("request failed: {err}")))?;
        let status = response.status().as_u16();
        let mut headers = HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str().to_ascii_lowercase(), value.to_string());
            }
        }
        let body = response
            .bytes()
            .await
            .map_err(|err| SyncError::transient(format!("body read failed: {err}")))?;
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// Binds requests and cached artifacts to the server-assigned epoch.
pub struct EpochTracker {
    backend: Arc<dyn HttpBackend>,
    cache: Arc<dyn PersistentCache>,
    limiter: Arc<RateLimiter>,
    epoch: Mutex<Option<String>>,
    file_entry: OnceLock<FileEntry>,
}

impl EpochTracker {
    pub fn new(cache: Arc<dyn PersistentCache>) -> Result<Self, SyncError> {
        Ok(Self::with_backend(Arc::new(ReqwestBackend::new()?), cache))
    }

    /// Construct over an alternate transport (tests, instrumentation).
    pub fn with_backend(backend: Arc<dyn HttpBackend>, cache: Arc<dyn PersistentCache>) -> Self {
        Self {
            backend,
            cache,
            limiter: Arc::new(RateLimiter::new(DEFAULT_CONCURRENT_REQUESTS)),
            epoch: Mutex::new(None),
            file_entry: OnceLock::new(),
        }
    }

    /// The file this tracker guards.  Settable once; required before any
    /// cache purge can happen.
    pub fn set_file_entry(&self, entry: FileEntry) -> Result<(), SyncError> {
        self.file_entry
            .set(entry)
            .map_err(|_| SyncError::invariant("file entry already set"))
    }

    pub fn file_entry(&self) -> Option<&FileEntry> {
        self.file_entry.get()
    }

    pub fn epoch(&self) -> Option<String> {
        self.epoch.lock().expect("epoch state poisoned").clone()
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Issue an annotated request and decode its JSON body.
    pub async fn fetch_and_parse_json<T: DeserializeOwned>(
        &self,
        request: HttpRequest,
        kind: FetchKind,
        add_in_body: bool,
    ) -> Result<T, SyncError> {
        let response = self.fetch_response(request, kind, add_in_body).await?;
        serde_json::from_slice(&response.body).map_err(|err| {
            SyncError::fatal(format!("malformed {} response: {err}", kind.as_str()))
        })
    }

    /// Issue an annotated request and validate the response epoch.
    pub async fn fetch_response(
        &self,
        mut request: HttpRequest,
        kind: FetchKind,
        add_in_body: bool,
    ) -> Result<HttpResponse, SyncError> {
        self.annotate(&mut request, add_in_body)?;
        debug!(
            target: "riptide::epoch",
            kind = kind.as_str(),
            url = %request.url,
            "fetch"
        );
        let response = self.limiter.schedule(self.backend.execute(request)).await?;
        let response_epoch = response.epoch().map(|e| e.to_string());

        if response.is_success() {
            if let Err(err) = self.validate_epoch(response_epoch.as_deref()) {
                return Err(self.handle_epoch_error(err, response_epoch.as_deref()).await);
            }
            return Ok(response);
        }

        let error = Self::error_from_response(&response, kind);
        if matches!(error, SyncError::EpochMismatch { .. }) {
            return Err(self.handle_epoch_error(error, response_epoch.as_deref()).await);
        }
        Err(error)
    }

    /// Admit a persisted entry only if its epoch matches.
    pub async fn fetch_from_cache<T: DeserializeOwned>(
        &self,
        entry: &CacheEntryKey,
        max_op_count: Option<u64>,
        kind: FetchKind,
    ) -> Result<Option<T>, SyncError> {
        let cached = self
            .limiter
            .schedule(self.cache.get(entry, max_op_count))
            .await?;
        let Some(cached) = cached else {
            return Ok(None);
        };
        if let Err(err) = self.validate_epoch(cached.fluid_epoch.as_deref()) {
            return Err(self
                .handle_epoch_error(err, cached.fluid_epoch.as_deref())
                .await);
        }
        debug!(target: "riptide::epoch", kind = kind.as_str(), "cache hit");
        let value = serde_json::from_value(cached.value)
            .map_err(|err| SyncError::fatal(format!("malformed cached value: {err}")))?;
        Ok(Some(value))
    }

    /// Validate the epoch a realtime connection handshake reported.
    pub async fn validate_epoch_from_push(
        &self,
        details: &ConnectionDetails,
    ) -> Result<(), SyncError> {
        match self.validate_epoch(details.epoch.as_deref()) {
            Ok(()) => Ok(()),
            Err(err) => Err(self.handle_epoch_error(err, details.epoch.as_deref()).await),
        }
    }

    /// Learn-on-first-contact, error on divergence, ignore absence.
    fn validate_epoch(&self, response_epoch: Option<&str>) -> Result<(), SyncError> {
        let Some(response_epoch) = response_epoch else {
            return Ok(());
        };
        let mut stored = self.epoch.lock().expect("epoch state poisoned");
        match stored.as_deref() {
            None => {
                info!(
                    target: "riptide::epoch",
                    epoch = response_epoch,
                    "epoch learned"
                );
                crate::telemetry::record_gauge("epoch_learned", 1);
                *stored = Some(response_epoch.to_string());
                Ok(())
            }
            Some(current) if current != response_epoch => Err(SyncError::EpochMismatch {
                message: format!("expected epoch {current}, service reported {response_epoch}"),
            }),
            Some(_) => Ok(()),
        }
    }

    /// Coherency conflicts become throttles; true divergence purges the
    /// file's cache entries exactly once per error, then propagates.
    async fn handle_epoch_error(
        &self,
        error: SyncError,
        response_epoch: Option<&str>,
    ) -> SyncError {
        let stored = self.epoch();
        if stored.is_some() && stored.as_deref() == response_epoch {
            debug!(target: "riptide::epoch", "coherency conflict, translating to throttle");
            return SyncError::Throttled {
                message: "coherency conflict".into(),
                retry_after: Duration::from_secs(1),
                status: Some(429),
            };
        }
        let file = self
            .file_entry
            .get()
            .expect("file entry must be set before epoch handling");
        warn!(
            target: "riptide::epoch",
            document_id = %file.document_id,
            "epoch mismatch, purging cached entries"
        );
        if let Err(purge_err) = self.cache.remove_entries(file).await {
            warn!(target: "riptide::epoch", error = %purge_err, "cache purge failed");
        }
        error
    }

    fn error_from_response(response: &HttpResponse, kind: FetchKind) -> SyncError {
        let mut body: ErrorBody = serde_json::from_slice(&response.body).unwrap_or_default();
        if body.status_code.is_none() {
            body.status_code = Some(response.status);
        }
        if body.error_message.is_none() {
            body.error_message = Some(format!(
                "{} request failed with status {}",
                kind.as_str(),
                response.status
            ));
        }
        body.into_error()
    }

    /// Attach the current epoch to an outgoing request.
    fn annotate(&self, request: &mut HttpRequest, add_in_body: bool) -> Result<(), SyncError> {
        let Some(epoch) = self.epoch() else {
            return Ok(());
        };
        if add_in_body {
            let body = request
                .body
                .take()
                .ok_or_else(|| SyncError::invariant("epoch-in-body request has no body"))?;
            request.body = Some(add_epoch_in_body(&body, &epoch)?);
            return Ok(());
        }
        let mut annotated = request.url.clone();
        annotated.query_pairs_mut().append_pair("epoch", &epoch);
        if annotated.as_str().len() > MAX_URL_LENGTH {
            request
                .headers
                .push((EPOCH_HEADER.to_string(), epoch));
        } else {
            request.url = annotated;
        }
        Ok(())
    }
}

/// Insert an `epoch=<value>` form field right after the first multipart
/// boundary line.  The boundary token is whatever follows the leading `--`
/// on the first CRLF-terminated line.
fn add_epoch_in_body(body: &Bytes, epoch: &str) -> Result<Bytes, SyncError> {
    let text = std::str::from_utf8(body)
        .map_err(|_| SyncError::invariant("multipart body is not utf-8"))?;
    let mut lines: Vec<&str> = text.split("\r\n").collect();
    let first = lines
        .first()
        .filter(|line| line.starts_with("--"))
        .ok_or_else(|| SyncError::invariant("multipart body has no boundary line"))?;
    let _boundary = &first[2..];
    let field = format!("epoch={epoch}");
    lines.insert(1, &field);
    Ok(Bytes::from(lines.join("\r\n")))
}
