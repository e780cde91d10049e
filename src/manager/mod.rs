//! The delta manager: ordering, delivery, and connection lifecycle.
//!
//! One manager owns the single live connection to the document service,
//! four pipeline queues, and every sequence counter.  Inbound ops flow
//! socket → pending-content stage → inbound queue → handler in strict
//! sequence-number order; gaps are filled from the history endpoint.
//! Outbound ops are batched in-process and submitted once connected.
//! All state lives behind a sync mutex that is never held across an await;
//! the queues serialize the actual work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::{DeltaManagerConfig, MSN_WINDOW_FLOOR, MSN_WINDOW_STEP};
use crate::error::SyncError;
use crate::protocol::{
    ClientProfile, ConnectionDetails, ConnectionMode, MessageType, OutboundMessage, Seq,
    SequencedMessage, SignalMessage,
};
use crate::queue::{QueueHandle, WorkQueue};
use crate::service::{
    DeltaStorage, DeltaStreamConnection, DocumentService, OpHandler, ProcessOutcome,
    SignalEnvelope, StreamEvent, StreamHandle,
};
use crate::telemetry;
use crate::util::Deferred;

mod content;
mod fetcher;

use content::ContentCache;
use fetcher::DeltaFetcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

/// Observable lifecycle and progress notifications.
#[derive(Debug, Clone)]
pub enum DeltaManagerEvent {
    Connect { details: ConnectionDetails },
    Disconnect { reason: String },
    Error { error: SyncError },
    Pong { latency: Duration },
    ProcessTime { elapsed: Duration },
    AllSentOpsAcked,
    CaughtUp,
    PrepareSend { count: usize },
    SubmitOp { kind: MessageType, client_sequence_number: i64 },
    ConnectionDelay { delay: Duration },
}

/// Point-in-time counters, mostly for diagnostics and tests.
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    pub duplicates: u64,
    pub out_of_order: u64,
    pub base_sequence_number: Seq,
    pub minimum_sequence_number: Seq,
    pub last_queued_sequence_number: Seq,
}

struct ManagerState {
    connection_state: ConnectionState,
    connection: Option<Arc<dyn DeltaStreamConnection>>,
    details: Option<ConnectionDetails>,
    connection_mode: ConnectionMode,
    connection_epoch: u64,
    pending_connect: Option<Deferred<ConnectionDetails>>,
    handler: Option<Arc<dyn OpHandler>>,

    base_seq: Seq,
    min_seq: Seq,
    last_queued_seq: Seq,
    client_seq: i64,
    client_seq_observed: i64,
    duplicates: u64,
    out_of_order: u64,
    pending: Vec<SequencedMessage>,
    message_buffer: Vec<OutboundMessage>,
    in_quorum: bool,
    fetching: bool,
    ack_armed: bool,
    ack_generation: u64,
    msn_window_threshold: u64,
}

pub struct DeltaManager {
    service: Arc<dyn DocumentService>,
    client: ClientProfile,
    config: DeltaManagerConfig,

    inbound_pending: WorkQueue<SequencedMessage>,
    inbound: WorkQueue<SequencedMessage>,
    inbound_signal: WorkQueue<SignalMessage>,
    outbound: WorkQueue<Vec<OutboundMessage>>,

    state: Mutex<ManagerState>,
    content: Mutex<ContentCache>,
    content_arrived: Notify,
    storage: tokio::sync::Mutex<Option<Arc<dyn DeltaStorage>>>,
    fetcher: DeltaFetcher,
    observers: Mutex<Vec<Arc<dyn Fn(&DeltaManagerEvent) + Send + Sync>>>,
    closed: Arc<AtomicBool>,
}

impl DeltaManager {
    pub fn new(
        service: Arc<dyn DocumentService>,
        client: ClientProfile,
        config: DeltaManagerConfig,
    ) -> Arc<Self> {
        let closed = Arc::new(AtomicBool::new(false));
        let fetcher = DeltaFetcher::new(&config, Arc::clone(&closed));
        let manager = Arc::new(Self {
            service,
            client,
            content: Mutex::new(ContentCache::new(config.content_buffer_size)),
            config,
            inbound_pending: WorkQueue::new("inboundPending"),
            inbound: WorkQueue::new("inbound"),
            inbound_signal: WorkQueue::new("inboundSignal"),
            outbound: WorkQueue::new("outbound"),
            state: Mutex::new(ManagerState {
                connection_state: ConnectionState::Disconnected,
                connection: None,
                details: None,
                connection_mode: ConnectionMode::Read,
                connection_epoch: 0,
                pending_connect: None,
                handler: None,
                base_seq: 0,
                min_seq: 0,
                last_queued_seq: 0,
                client_seq: 0,
                client_seq_observed: 0,
                duplicates: 0,
                out_of_order: 0,
                pending: Vec::new(),
                message_buffer: Vec::new(),
                in_quorum: false,
                fetching: false,
                ack_armed: false,
                ack_generation: 0,
                msn_window_threshold: MSN_WINDOW_FLOOR,
            }),
            content_arrived: Notify::new(),
            storage: tokio::sync::Mutex::new(None),
            fetcher,
            observers: Mutex::new(Vec::new()),
            closed,
        });
        manager.spawn_pipeline_workers();
        manager
    }

    /// Register an event observer.  Observers must not block.
    pub fn on_event(&self, observer: impl Fn(&DeltaManagerEvent) + Send + Sync + 'static) {
        self.observers
            .lock()
            .expect("observer list poisoned")
            .push(Arc::new(observer));
    }

    fn emit(&self, event: DeltaManagerEvent) {
        let observers = self
            .observers
            .lock()
            .expect("observer list poisoned")
            .clone();
        for observer in observers {
            observer(&event);
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().expect("manager state poisoned")
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.lock_state().connection_state
    }

    pub fn connection_details(&self) -> Option<ConnectionDetails> {
        self.lock_state().details.clone()
    }

    pub fn stats(&self) -> ConnectionStats {
        let st = self.lock_state();
        ConnectionStats {
            duplicates: st.duplicates,
            out_of_order: st.out_of_order,
            base_sequence_number: st.base_seq,
            minimum_sequence_number: st.min_seq,
            last_queued_sequence_number: st.last_queued_seq,
        }
    }

    /// Quorum membership, pushed in by the owning container.
    pub fn set_in_quorum(&self, in_quorum: bool) {
        self.lock_state().in_quorum = in_quorum;
    }

    /// Active clients (in quorum, write mode, live connection) participate
    /// in acknowledgement and MSN advancement.
    pub fn active(&self) -> bool {
        let st = self.lock_state();
        st.in_quorum && st.connection_mode == ConnectionMode::Write && st.connection.is_some()
    }

    pub fn inbound_pending_queue(&self) -> QueueHandle<SequencedMessage> {
        self.inbound_pending.handle()
    }

    pub fn inbound_queue(&self) -> QueueHandle<SequencedMessage> {
        self.inbound.handle()
    }

    pub fn signal_queue(&self) -> QueueHandle<SignalMessage> {
        self.inbound_signal.handle()
    }

    pub fn outbound_queue(&self) -> QueueHandle<Vec<OutboundMessage>> {
        self.outbound.handle()
    }

    // ---- connection lifecycle -------------------------------------------

    /// Open the realtime stream, joining an in-flight attempt if one exists.
    pub async fn connect(self: &Arc<Self>, reason: &str) -> Result<ConnectionDetails, SyncError> {
        let deferred = {
            let mut st = self.lock_state();
            match st.connection_state {
                ConnectionState::Closed => {
                    return Err(SyncError::fatal("delta manager closed"));
                }
                ConnectionState::Connected => {
                    let details = st.details.clone().ok_or_else(|| {
                        SyncError::invariant("connected without connection details")
                    })?;
                    return Ok(details);
                }
                ConnectionState::Connecting => st
                    .pending_connect
                    .clone()
                    .ok_or_else(|| SyncError::invariant("connecting without pending deferred"))?,
                ConnectionState::Disconnected => {
                    st.connection_state = ConnectionState::Connecting;
                    let deferred = Deferred::new();
                    st.pending_connect = Some(deferred.clone());
                    let manager = Arc::clone(self);
                    let mode = self.config.default_reconnect_mode;
                    let reason = reason.to_string();
                    let handoff = deferred.clone();
                    tokio::spawn(async move {
                        manager.connect_core(&reason, mode, handoff).await;
                    });
                    deferred
                }
            }
        };
        deferred.wait().await
    }

    /// The reconnect ladder: doubled delay per failed attempt, capped, with
    /// service-supplied retry-after taking precedence.
    async fn connect_core(
        self: Arc<Self>,
        reason: &str,
        mode: ConnectionMode,
        deferred: Deferred<ConnectionDetails>,
    ) {
        let mut delay = self.config.initial_reconnect_delay;
        loop {
            if self.is_closed() {
                deferred.reject(SyncError::fatal("delta manager closed"));
                return;
            }
            match self
                .service
                .connect_to_delta_stream(&self.client, mode)
                .await
            {
                Ok(handle) => {
                    self.setup_connection(reason, handle, &deferred);
                    return;
                }
                Err(err) if !err.can_retry() => {
                    warn!(
                        target: "riptide::manager",
                        reason,
                        error = %err,
                        "connect failed fatally"
                    );
                    {
                        let mut st = self.lock_state();
                        st.connection_state = ConnectionState::Disconnected;
                        st.pending_connect = None;
                    }
                    deferred.reject(err.clone());
                    self.close_with_error(err);
                    return;
                }
                Err(err) => {
                    let wait = err.retry_after().unwrap_or(delay);
                    debug!(
                        target: "riptide::manager",
                        reason,
                        error = %err,
                        delay_ms = wait.as_millis() as u64,
                        "connect failed, retrying"
                    );
                    self.emit(DeltaManagerEvent::ConnectionDelay { delay: wait });
                    tokio::time::sleep(wait).await;
                    delay = (delay * 2).min(self.config.max_reconnect_delay);
                }
            }
        }
    }

    fn setup_connection(
        self: &Arc<Self>,
        reason: &str,
        handle: StreamHandle,
        deferred: &Deferred<ConnectionDetails>,
    ) {
        let StreamHandle {
            connection,
            mut events,
        } = handle;
        let details = connection.details().clone();
        let epoch = {
            let mut st = self.lock_state();
            if st.connection_state == ConnectionState::Closed {
                drop(st);
                connection.close();
                deferred.reject(SyncError::fatal("delta manager closed"));
                return;
            }
            st.connection = Some(Arc::clone(&connection));
            st.details = Some(details.clone());
            st.connection_state = ConnectionState::Connected;
            st.connection_mode = details.mode;
            st.client_seq = 0;
            st.client_seq_observed = 0;
            st.pending_connect = None;
            st.connection_epoch += 1;
            st.connection_epoch
        };
        self.outbound.resume();
        info!(
            target: "riptide::manager",
            reason,
            client_id = %details.client_id,
            mode = ?details.mode,
            "delta stream connected"
        );

        // Backlog handed over in the handshake lands before any live event:
        // the event channel only buffers frames sequenced after it.
        if !details.initial_contents.is_empty() {
            let mut cache = self.content.lock().expect("content cache poisoned");
            for content in details.initial_contents.clone() {
                cache.set(content);
            }
            drop(cache);
            self.content_arrived.notify_waiters();
        }
        self.enqueue_messages(details.initial_messages.clone());
        for signal in details.initial_signals.clone() {
            self.inbound_signal.push(signal);
        }

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if manager.is_closed() {
                    break;
                }
                let terminal = matches!(
                    &event,
                    StreamEvent::Disconnect { .. } | StreamEvent::Error(_)
                );
                manager.handle_stream_event(epoch, event);
                if terminal {
                    break;
                }
            }
        });

        self.emit(DeltaManagerEvent::Connect {
            details: details.clone(),
        });
        deferred.resolve(details);
    }

    fn handle_stream_event(self: &Arc<Self>, epoch: u64, event: StreamEvent) {
        match event {
            StreamEvent::Op(messages) => self.enqueue_messages(messages),
            StreamEvent::OpContent(content) => {
                self.content
                    .lock()
                    .expect("content cache poisoned")
                    .set(content);
                self.content_arrived.notify_waiters();
            }
            StreamEvent::Signal(signal) => self.inbound_signal.push(signal),
            StreamEvent::Nack { target } => {
                warn!(target: "riptide::manager", nack_target = target, "write nacked, reconnecting");
                self.teardown_connection(epoch, "nack", None, Some(ConnectionMode::Write));
            }
            StreamEvent::Disconnect { reason } => {
                self.teardown_connection(epoch, &reason, None, None);
            }
            StreamEvent::Error(error) => {
                self.teardown_connection(epoch, "error", Some(error), None);
            }
            StreamEvent::Pong(latency) => {
                telemetry::record_duration("pong_latency", latency);
                self.emit(DeltaManagerEvent::Pong { latency });
            }
        }
    }

    /// Connected → Disconnected, then maybe back up the ladder.
    fn teardown_connection(
        self: &Arc<Self>,
        epoch: u64,
        reason: &str,
        error: Option<SyncError>,
        forced_mode: Option<ConnectionMode>,
    ) {
        let connection = {
            let mut st = self.lock_state();
            if st.connection_epoch != epoch
                || st.connection_state != ConnectionState::Connected
            {
                return;
            }
            st.connection_epoch += 1;
            st.connection_state = ConnectionState::Disconnected;
            st.connection_mode = ConnectionMode::Read;
            st.ack_generation += 1;
            st.ack_armed = false;
            st.connection.take()
        };
        self.outbound.pause();
        self.outbound.clear();
        if let Some(connection) = connection {
            connection.close();
        }
        info!(target: "riptide::manager", reason, "delta stream disconnected");
        self.emit(DeltaManagerEvent::Disconnect {
            reason: reason.to_string(),
        });

        if let Some(error) = error {
            if !error.can_retry() {
                self.close_with_error(error);
                return;
            }
            self.emit(DeltaManagerEvent::Error { error });
        }

        match forced_mode {
            Some(mode) => self.schedule_reconnect(mode),
            None if self.config.reconnect => {
                self.schedule_reconnect(self.config.default_reconnect_mode)
            }
            None => {}
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, mode: ConnectionMode) {
        let deferred = {
            let mut st = self.lock_state();
            if st.connection_state != ConnectionState::Disconnected {
                return;
            }
            st.connection_state = ConnectionState::Connecting;
            let deferred = Deferred::new();
            st.pending_connect = Some(deferred.clone());
            deferred
        };
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.connect_core("reconnect", mode, deferred).await;
        });
    }

    /// Idempotent terminal shutdown: clears queues, rejects the in-flight
    /// connect, drops the pending backlog.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let (connection, deferred) = {
            let mut st = self.lock_state();
            st.connection_state = ConnectionState::Closed;
            st.pending.clear();
            st.message_buffer.clear();
            st.ack_generation += 1;
            st.ack_armed = false;
            (st.connection.take(), st.pending_connect.take())
        };
        if let Some(connection) = connection {
            connection.close();
        }
        if let Some(deferred) = deferred {
            deferred.reject(SyncError::fatal("delta manager closed"));
        }
        self.inbound_pending.close();
        self.inbound.close();
        self.inbound_signal.close();
        self.outbound.close();
        info!(target: "riptide::manager", "delta manager closed");
    }

    fn close_with_error(&self, error: SyncError) {
        self.emit(DeltaManagerEvent::Error { error });
        self.close();
    }

    fn queue_error(&self, error: SyncError) {
        warn!(target: "riptide::manager", error = %error, "pipeline error");
        self.close_with_error(error);
    }

    // ---- inbound pipeline ------------------------------------------------

    /// Install the handler and prime the sequence counters, optionally
    /// resuming the inbound queues and catching up.
    pub fn attach_op_handler(
        self: &Arc<Self>,
        min_seq: Seq,
        seq: Seq,
        handler: Arc<dyn OpHandler>,
        resume: bool,
    ) {
        let pending_backlog = {
            let mut st = self.lock_state();
            st.handler = Some(handler);
            st.base_seq = seq;
            st.min_seq = min_seq;
            st.last_queued_seq = seq;
            st.msn_window_threshold = MSN_WINDOW_FLOOR;
            !st.pending.is_empty()
        };
        debug!(
            target: "riptide::manager",
            sequence_number = seq,
            minimum_sequence_number = min_seq,
            resume,
            "op handler attached"
        );
        if resume {
            self.inbound_pending.resume();
            self.inbound.resume();
            self.inbound_signal.resume();
            if pending_backlog {
                self.catch_up(Vec::new());
            } else {
                self.fetch_missing_deltas("DocumentOpen", seq, None);
            }
        }
    }

    /// Route a batch of sequenced messages: in-order ones advance the
    /// stream, stale ones are dropped, future ones park in `pending` and
    /// trigger a gap fill.
    fn enqueue_messages(self: &Arc<Self>, messages: Vec<SequencedMessage>) {
        if messages.is_empty() {
            return;
        }
        let gap = {
            let mut st = self.lock_state();
            let mut gap = None;
            for message in messages {
                let seq = message.sequence_number;
                if seq <= st.last_queued_seq {
                    st.duplicates += 1;
                    continue;
                }
                if seq == st.last_queued_seq + 1 {
                    st.last_queued_seq = seq;
                    // Pushed under the state lock so concurrent routers
                    // cannot interleave claimed slots out of order.
                    self.inbound_pending.push(message);
                } else {
                    st.out_of_order += 1;
                    st.pending.push(message);
                    if !st.fetching {
                        let first_missing_end = st
                            .pending
                            .iter()
                            .map(|m| m.sequence_number)
                            .min()
                            .unwrap_or(seq);
                        gap = Some((st.last_queued_seq, first_missing_end));
                    }
                }
            }
            gap
        };
        if let Some((from, to)) = gap {
            self.fetch_missing_deltas("gap", from, Some(to));
        }
    }

    /// Enqueue freshly fetched messages, then replay the parked backlog.
    fn catch_up(self: &Arc<Self>, messages: Vec<SequencedMessage>) {
        let mut parked = {
            let mut st = self.lock_state();
            std::mem::take(&mut st.pending)
        };
        self.enqueue_messages(messages);
        parked.sort_by_key(|m| m.sequence_number);
        self.enqueue_messages(parked);
    }

    /// Kick off a background gap fill; at most one runs at a time.
    fn fetch_missing_deltas(self: &Arc<Self>, reason: &'static str, from: Seq, to: Option<Seq>) {
        {
            let mut st = self.lock_state();
            if st.fetching || st.connection_state == ConnectionState::Closed {
                return;
            }
            st.fetching = true;
        }
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let result = manager.run_fetch(reason, from, to).await;
            enum FollowUp {
                CaughtUp,
                Refetch(Seq, Seq),
            }
            match result {
                Ok(()) => {
                    let follow_up = {
                        let mut st = manager.lock_state();
                        st.fetching = false;
                        match st.pending.iter().map(|m| m.sequence_number).min() {
                            // A new gap opened while this fetch was in
                            // flight and was suppressed by the guard.
                            Some(next) => FollowUp::Refetch(st.last_queued_seq, next),
                            None => FollowUp::CaughtUp,
                        }
                    };
                    match follow_up {
                        FollowUp::CaughtUp => manager.emit(DeltaManagerEvent::CaughtUp),
                        FollowUp::Refetch(from, to) => {
                            manager.fetch_missing_deltas(reason, from, Some(to))
                        }
                    }
                }
                Err(error) => {
                    manager.lock_state().fetching = false;
                    manager.close_with_error(error);
                }
            }
        });
    }

    async fn run_fetch(
        self: &Arc<Self>,
        reason: &'static str,
        from: Seq,
        to: Option<Seq>,
    ) -> Result<(), SyncError> {
        let storage = self.ensure_storage().await?;
        let manager = Arc::clone(self);
        self.fetcher
            .fetch(reason, &storage, from, to, move |batch| {
                manager.catch_up(batch)
            })
            .await
    }

    async fn ensure_storage(&self) -> Result<Arc<dyn DeltaStorage>, SyncError> {
        let mut guard = self.storage.lock().await;
        if let Some(storage) = guard.as_ref() {
            return Ok(Arc::clone(storage));
        }
        match self.service.connect_to_delta_storage().await {
            Ok(storage) => {
                *guard = Some(Arc::clone(&storage));
                Ok(storage)
            }
            // Failing to reach storage at all leaves no recovery path.
            Err(err) => Err(SyncError::Fatal {
                message: format!("delta storage connect failed: {err}"),
                status: err.status(),
            }),
        }
    }

    /// Retrieve messages with sequence numbers in `(from, to)` exclusive;
    /// `to = None` reads to the end of the stream.
    pub async fn get_deltas(
        self: &Arc<Self>,
        reason: &'static str,
        from: Seq,
        to: Option<Seq>,
    ) -> Result<Vec<SequencedMessage>, SyncError> {
        let storage = self.ensure_storage().await?;
        let mut collected = Vec::new();
        self.fetcher
            .fetch(reason, &storage, from, to, |batch| collected.extend(batch))
            .await?;
        Ok(collected)
    }

    /// Inbound worker body: enforce ordering invariants, hand the message
    /// to the handler, then schedule acknowledgement.
    fn process_message(self: &Arc<Self>, message: &SequencedMessage) -> Result<(), SyncError> {
        let _perf = telemetry::PerfGuard::new("process_message");
        let start = Instant::now();
        let (handler, all_acked) = {
            let mut st = self.lock_state();
            if message.sequence_number != st.base_seq + 1 {
                return Err(SyncError::invariant(format!(
                    "processed sequence {} but expected {}",
                    message.sequence_number,
                    st.base_seq + 1
                )));
            }
            if message.minimum_sequence_number < st.min_seq {
                return Err(SyncError::invariant(format!(
                    "minimum sequence number regressed from {} to {}",
                    st.min_seq, message.minimum_sequence_number
                )));
            }
            st.base_seq = message.sequence_number;
            st.min_seq = message.minimum_sequence_number;

            let own = match (&st.details, &message.client_id) {
                (Some(details), Some(client_id)) => details.client_id == *client_id,
                _ => false,
            };
            let mut all_acked = false;
            if own {
                let cseq = message.client_sequence_number;
                if cseq < st.client_seq_observed || cseq > st.client_seq {
                    return Err(SyncError::invariant(format!(
                        "own client sequence {cseq} outside [{}, {}]",
                        st.client_seq_observed, st.client_seq
                    )));
                }
                st.client_seq_observed = cseq;
                all_acked = cseq == st.client_seq;
            }

            let window = message.sequence_number - message.minimum_sequence_number;
            if window >= st.msn_window_threshold {
                telemetry::record_gauge("msn_window", window);
                while st.msn_window_threshold <= window {
                    st.msn_window_threshold += MSN_WINDOW_STEP;
                }
            }

            let handler = st
                .handler
                .clone()
                .ok_or_else(|| SyncError::invariant("message processed before handler attach"))?;
            (handler, all_acked)
        };

        let outcome = handler.process(message)?;
        let elapsed = start.elapsed();
        self.emit(DeltaManagerEvent::ProcessTime { elapsed });
        if all_acked {
            self.emit(DeltaManagerEvent::AllSentOpsAcked);
        }
        self.schedule_ack(message.kind, outcome);
        Ok(())
    }

    /// Bound MSN lag without ack loops: immediate no-op when asked, else a
    /// single deferred no-op per burst of processed messages.
    fn schedule_ack(self: &Arc<Self>, kind: MessageType, outcome: ProcessOutcome) {
        if !self.active() {
            return;
        }
        if outcome.immediate_no_op {
            // Sentinel non-null payload marks the requested ack.
            let _ = self.submit(MessageType::NoOp, Some(Value::String(String::new())), false);
            return;
        }
        if kind == MessageType::NoOp {
            return;
        }
        let generation = {
            let mut st = self.lock_state();
            if st.ack_armed {
                return;
            }
            st.ack_armed = true;
            st.ack_generation
        };
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(manager.config.ack_interval).await;
            let fire = {
                let mut st = manager.lock_state();
                if st.ack_generation != generation || !st.ack_armed {
                    false
                } else {
                    st.ack_armed = false;
                    true
                }
            };
            if fire && manager.active() {
                let _ = manager.submit(MessageType::NoOp, Some(Value::Null), false);
            }
        });
    }

    // ---- outbound pipeline ----------------------------------------------

    /// Stamp and buffer an outgoing message, returning its client sequence
    /// number.  Unbatched submissions flush around themselves.
    pub fn submit(
        &self,
        kind: MessageType,
        contents: Option<Value>,
        batch: bool,
    ) -> Result<i64, SyncError> {
        if self.is_closed() {
            return Err(SyncError::fatal("delta manager closed"));
        }
        let mut flushes: Vec<Vec<OutboundMessage>> = Vec::new();
        let client_sequence_number = {
            let mut st = self.lock_state();
            // Any outbound op supersedes a scheduled ack.
            st.ack_generation += 1;
            st.ack_armed = false;

            if let Some(contents) = &contents {
                let size = serde_json::to_vec(contents).map(|v| v.len()).unwrap_or(0);
                let limit = st
                    .details
                    .as_ref()
                    .map(|d| d.max_message_size())
                    .unwrap_or(crate::config::DEFAULT_CHUNK_SIZE);
                if size > limit {
                    return Err(SyncError::fatal(format!(
                        "message of {size} bytes exceeds the {limit} byte limit"
                    )));
                }
            }

            st.client_seq += 1;
            let client_sequence_number = st.client_seq;
            let (contents, data) = if kind.is_system() {
                (None, contents)
            } else {
                (contents, None)
            };
            let message = OutboundMessage {
                client_sequence_number,
                reference_sequence_number: st.base_seq,
                kind,
                contents,
                data,
                metadata: None,
                traces: Vec::new(),
            };
            if batch {
                st.message_buffer.push(message);
            } else {
                if !st.message_buffer.is_empty() {
                    flushes.push(std::mem::take(&mut st.message_buffer));
                }
                flushes.push(vec![message]);
            }
            client_sequence_number
        };
        for batch in flushes {
            self.emit(DeltaManagerEvent::PrepareSend { count: batch.len() });
            self.outbound.push(batch);
        }
        self.emit(DeltaManagerEvent::SubmitOp {
            kind,
            client_sequence_number,
        });
        Ok(client_sequence_number)
    }

    /// Move the in-process buffer onto the outbound queue as one batch.
    pub fn flush(&self) {
        let batch = {
            let mut st = self.lock_state();
            if st.message_buffer.is_empty() {
                None
            } else {
                Some(std::mem::take(&mut st.message_buffer))
            }
        };
        if let Some(batch) = batch {
            self.emit(DeltaManagerEvent::PrepareSend { count: batch.len() });
            self.outbound.push(batch);
        }
    }

    /// Send an out-of-band signal on the live connection.
    pub fn submit_signal(&self, content: &Value) -> Result<(), SyncError> {
        let connection = self
            .lock_state()
            .connection
            .clone()
            .ok_or_else(|| SyncError::transient("no connection for signal"))?;
        let text = serde_json::to_string(content)
            .map_err(|err| SyncError::fatal(format!("encode signal: {err}")))?;
        connection.submit_signal(&text)
    }

    // ---- pipeline workers ------------------------------------------------

    fn spawn_pipeline_workers(self: &Arc<Self>) {
        let sink = |manager: Arc<Self>| move |err: SyncError| manager.queue_error(err);

        // Stage 1: resolve out-of-band contents, then forward in order.
        let mgr = Arc::clone(self);
        self.inbound_pending.spawn_worker(
            move |message| {
                let mgr = Arc::clone(&mgr);
                async move { mgr.stage_content(message).await }
            },
            sink(Arc::clone(self)),
        );

        // Stage 2: apply messages in strict sequence.
        let mgr = Arc::clone(self);
        self.inbound.spawn_worker(
            move |message| {
                let mgr = Arc::clone(&mgr);
                async move { mgr.process_message(&message) }
            },
            sink(Arc::clone(self)),
        );

        // Signals: independent of op ordering.
        let mgr = Arc::clone(self);
        self.inbound_signal.spawn_worker(
            move |signal: SignalMessage| {
                let mgr = Arc::clone(&mgr);
                async move {
                    let handler = mgr.lock_state().handler.clone().ok_or_else(|| {
                        SyncError::invariant("signal processed before handler attach")
                    })?;
                    let content: Value = serde_json::from_str(&signal.content)
                        .map_err(|err| SyncError::transient(format!("malformed signal: {err}")))?;
                    handler.process_signal(SignalEnvelope {
                        client_id: signal.client_id,
                        content,
                    })
                }
            },
            sink(Arc::clone(self)),
        );

        // Outbound: one batch per submit, in flush order.
        let mgr = Arc::clone(self);
        self.outbound.spawn_worker(
            move |batch: Vec<OutboundMessage>| {
                let mgr = Arc::clone(&mgr);
                async move {
                    let Some(connection) = mgr.lock_state().connection.clone() else {
                        // The connection dropped between pop and here; the
                        // teardown already cleared the rest of the queue.
                        warn!(
                            target: "riptide::manager",
                            count = batch.len(),
                            "dropping outbound batch, connection gone"
                        );
                        return Ok(());
                    };
                    telemetry::record_gauge("outbound_batch", batch.len() as u64);
                    connection.submit_async(&batch).await
                }
            },
            sink(Arc::clone(self)),
        );
    }

    async fn stage_content(self: &Arc<Self>, mut message: SequencedMessage) -> Result<(), SyncError> {
        if message.kind == MessageType::Operation && message.contents.is_none() {
            if let Some(client_id) = message.client_id.clone() {
                let contents = self
                    .resolve_content(
                        &client_id,
                        message.client_sequence_number,
                        message.sequence_number,
                    )
                    .await?;
                message.contents = Some(contents);
            }
        }
        self.inbound.push(message);
        Ok(())
    }

    /// Find the op's contents: cache first (skipping entries the stream has
    /// moved past), then a bounded wait for the side channel, then storage.
    async fn resolve_content(
        self: &Arc<Self>,
        client_id: &str,
        client_sequence_number: i64,
        sequence_number: Seq,
    ) -> Result<Value, SyncError> {
        enum Decision {
            Found(Value),
            Fetch,
            Wait,
        }
        loop {
            let notified = self.content_arrived.notified();
            tokio::pin!(notified);
            // Register before the cache check so an arrival racing with it
            // is not missed.
            notified.as_mut().enable();
            let decision = {
                let mut cache = self.content.lock().expect("content cache poisoned");
                loop {
                    match cache.peek(client_id) {
                        Some(head) if head.client_sequence_number < client_sequence_number => {
                            cache.get(client_id);
                        }
                        Some(head) if head.client_sequence_number == client_sequence_number => {
                            let matched =
                                cache.get(client_id).expect("peeked entry disappeared");
                            break Decision::Found(matched.contents);
                        }
                        // The buffer has moved past us: the frame was lost
                        // or evicted, only storage still has it.
                        Some(_) => break Decision::Fetch,
                        None => break Decision::Wait,
                    }
                }
            };
            match decision {
                Decision::Found(contents) => return Ok(contents),
                Decision::Fetch => return self.fetch_op_content(sequence_number).await,
                Decision::Wait => {
                    let arrived = tokio::select! {
                        _ = &mut notified => true,
                        _ = tokio::time::sleep(self.config.content_fetch_delay) => false,
                    };
                    if !arrived {
                        return self.fetch_op_content(sequence_number).await;
                    }
                }
            }
        }
    }

    async fn fetch_op_content(self: &Arc<Self>, sequence_number: Seq) -> Result<Value, SyncError> {
        debug!(
            target: "riptide::manager",
            sequence_number,
            "fetching op content from storage"
        );
        let messages = self
            .get_deltas("opContent", sequence_number - 1, Some(sequence_number + 1))
            .await?;
        messages
            .into_iter()
            .find(|m| m.sequence_number == sequence_number)
            .and_then(|m| m.contents)
            .ok_or_else(|| {
                SyncError::invariant(format!(
                    "storage returned no contents for sequence {sequence_number}"
                ))
            })
    }
}
