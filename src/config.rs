//! Wire-visible constants and tunable knobs for the delta manager.

use std::time::Duration;

use crate::protocol::ConnectionMode;

/// First reconnect attempt waits this long; doubled per failure.
pub const INITIAL_RECONNECT_DELAY: Duration = Duration::from_millis(1000);
/// Ceiling for the reconnect ladder.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_millis(8000);

/// Base delay when a delta fetch comes back empty.
pub const MISSING_FETCH_DELAY: Duration = Duration::from_millis(100);
/// Ceiling for the fetch backoff ladder.
pub const MAX_FETCH_DELAY: Duration = Duration::from_millis(10_000);

/// Upper bound on a single history fetch window.
pub const MAX_BATCH_DELTAS: u64 = 2000;

/// Fallback maximum serialized message size when the connection does not
/// advertise one.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Capacity of the content side-channel buffer.
pub const DEFAULT_CONTENT_BUFFER_SIZE: usize = 10;

/// Concurrency ceiling for epoch-scoped requests.
pub const DEFAULT_CONCURRENT_REQUESTS: usize = 24;

/// Annotated URLs longer than this fall back to the epoch header.
pub const MAX_URL_LENGTH: usize = 2048;

/// Delay before a processed message is acknowledged with a no-op.
pub const ACK_INTERVAL: Duration = Duration::from_millis(100);

/// MSN window growth is reported from this floor...
pub const MSN_WINDOW_FLOOR: u64 = 30;
/// ...in increments of this many sequence numbers.
pub const MSN_WINDOW_STEP: u64 = 20;

/// Tunables for [`crate::manager::DeltaManager`].
///
/// The defaults carry the wire-visible constants; tests shrink the delays.
#[derive(Debug, Clone)]
pub struct DeltaManagerConfig {
    /// Automatically re-run the connection ladder after a retryable drop.
    pub reconnect: bool,
    /// Mode used for automatic reconnects (nacks always force write).
    pub default_reconnect_mode: ConnectionMode,
    pub initial_reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub missing_fetch_delay: Duration,
    pub max_fetch_delay: Duration,
    pub max_batch_deltas: u64,
    pub content_buffer_size: usize,
    pub ack_interval: Duration,
    /// How long the pending-content stage waits for a side-channel frame
    /// before fetching the op from storage.
    pub content_fetch_delay: Duration,
}

impl Default for DeltaManagerConfig {
    fn default() -> Self {
        Self {
            reconnect: true,
            default_reconnect_mode: ConnectionMode::Write,
            initial_reconnect_delay: INITIAL_RECONNECT_DELAY,
            max_reconnect_delay: MAX_RECONNECT_DELAY,
            missing_fetch_delay: MISSING_FETCH_DELAY,
            max_fetch_delay: MAX_FETCH_DELAY,
            max_batch_deltas: MAX_BATCH_DELTAS,
            content_buffer_size: DEFAULT_CONTENT_BUFFER_SIZE,
            ack_interval: ACK_INTERVAL,
            content_fetch_delay: Duration::from_secs(3),
        }
    }
}
