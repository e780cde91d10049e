//! Error taxonomy shared by the delta manager and the epoch tracker.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Every failure the sync core can surface.
///
/// The service reports errors as loose JSON bags ([`ErrorBody`]); this enum
/// is the typed rendition.  `Transient` and `Throttled` are retryable,
/// `Fatal` and `Invariant` close the manager, `EpochMismatch` additionally
/// purges the file's cache entries.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("transient failure: {message}")]
    Transient {
        message: String,
        retry_after: Option<Duration>,
        status: Option<u16>,
    },
    #[error("throttled: {message} (retry after {retry_after:?})")]
    Throttled {
        message: String,
        retry_after: Duration,
        status: Option<u16>,
    },
    #[error("fatal: {message}")]
    Fatal {
        message: String,
        status: Option<u16>,
    },
    #[error("epoch version mismatch: {message}")]
    EpochMismatch { message: String },
    #[error("invariant violated: {message}")]
    Invariant { message: String },
}

impl SyncError {
    pub fn transient(message: impl Into<String>) -> Self {
        SyncError::Transient {
            message: message.into(),
            retry_after: None,
            status: None,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        SyncError::Fatal {
            message: message.into(),
            status: None,
        }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        SyncError::Invariant {
            message: message.into(),
        }
    }

    /// Whether the backoff ladders may retry after this error.
    pub fn can_retry(&self) -> bool {
        matches!(
            self,
            SyncError::Transient { .. } | SyncError::Throttled { .. }
        )
    }

    /// Service-suggested delay before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SyncError::Transient { retry_after, .. } => *retry_after,
            SyncError::Throttled { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            SyncError::Transient { status, .. }
            | SyncError::Throttled { status, .. }
            | SyncError::Fatal { status, .. } => *status,
            _ => None,
        }
    }
}

/// `errorType` value the service uses for epoch divergence.
pub const EPOCH_MISMATCH_ERROR_TYPE: &str = "epochVersionMismatch";

/// Error shape the service puts on the wire.
///
/// Every field is optional; a missing `canRetry` means retryable.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub can_retry: Option<bool>,
    pub retry_after_seconds: Option<f64>,
    pub error_type: Option<String>,
    pub status_code: Option<u16>,
    pub error_message: Option<String>,
}

impl ErrorBody {
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after_seconds.map(Duration::from_secs_f64)
    }

    /// Lift the wire bag into the typed taxonomy.
    pub fn into_error(self) -> SyncError {
        let message = self
            .error_message
            .clone()
            .unwrap_or_else(|| "service error".to_string());
        if self.error_type.as_deref() == Some(EPOCH_MISMATCH_ERROR_TYPE) {
            return SyncError::EpochMismatch { message };
        }
        if self.status_code == Some(429) {
            return SyncError::Throttled {
                message,
                retry_after: self.retry_after().unwrap_or(Duration::from_secs(1)),
                status: self.status_code,
            };
        }
        if self.can_retry == Some(false) {
            return SyncError::Fatal {
                message,
                status: self.status_code,
            };
        }
        let retry_after = self.retry_after();
        SyncError::Transient {
            message,
            retry_after,
            status: self.status_code,
        }
    }
}
