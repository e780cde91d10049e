//! Scripted collaborators shared by the integration suites.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use riptide::epoch::{HttpBackend, HttpRequest, HttpResponse, EPOCH_HEADER};
use riptide::protocol::ClientProfile;
use riptide::service::{
    CacheEntryKey, CachedValue, FileEntry, PersistentCache, SignalEnvelope,
};
use riptide::{
    ConnectionDetails, ConnectionMode, DeltaManagerConfig, DeltaManagerEvent, DeltaStorage,
    DeltaStreamConnection, DocumentService, MessageType, OpHandler, OutboundMessage,
    ProcessOutcome, SequencedMessage, StreamEvent, StreamHandle, SyncError,
};

pub type Seq = u64;

// ---- message constructors ---------------------------------------------------

pub fn msg(seq: Seq) -> SequencedMessage {
    msg_from(seq, 0, "remote", seq as i64)
}

pub fn msg_msn(seq: Seq, msn: Seq) -> SequencedMessage {
    msg_from(seq, msn, "remote", seq as i64)
}

pub fn msg_from(seq: Seq, msn: Seq, client_id: &str, cseq: i64) -> SequencedMessage {
    SequencedMessage {
        sequence_number: seq,
        minimum_sequence_number: msn,
        client_id: Some(client_id.to_string()),
        client_sequence_number: cseq,
        kind: MessageType::Operation,
        contents: Some(serde_json::json!({ "seq": seq })),
        data: None,
        traces: Vec::new(),
    }
}

pub fn fast_config() -> DeltaManagerConfig {
    DeltaManagerConfig {
        initial_reconnect_delay: Duration::from_millis(10),
        max_reconnect_delay: Duration::from_millis(80),
        missing_fetch_delay: Duration::from_millis(5),
        max_fetch_delay: Duration::from_millis(50),
        content_fetch_delay: Duration::from_millis(50),
        ..DeltaManagerConfig::default()
    }
}

/// Poll until `condition` holds; works under both real and paused time.
pub async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..2000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

// ---- document service -------------------------------------------------------

pub struct MockConnection {
    details: ConnectionDetails,
    pub batches: Mutex<Vec<Vec<OutboundMessage>>>,
    pub signals: Mutex<Vec<String>>,
    pub closed: AtomicBool,
}

impl MockConnection {
    fn new(details: ConnectionDetails) -> Self {
        Self {
            details,
            batches: Mutex::new(Vec::new()),
            signals: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn submitted(&self) -> Vec<Vec<OutboundMessage>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn submitted_flat(&self) -> Vec<OutboundMessage> {
        self.submitted().into_iter().flatten().collect()
    }
}

#[async_trait]
impl DeltaStreamConnection for MockConnection {
    fn details(&self) -> &ConnectionDetails {
        &self.details
    }

    fn submit(&self, batch: &[OutboundMessage]) -> Result<(), SyncError> {
        self.batches.lock().unwrap().push(batch.to_vec());
        Ok(())
    }

    async fn submit_async(&self, batch: &[OutboundMessage]) -> Result<(), SyncError> {
        self.submit(batch)
    }

    fn submit_signal(&self, content: &str) -> Result<(), SyncError> {
        self.signals.lock().unwrap().push(content.to_string());
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct ServiceState {
    connect_errors: VecDeque<SyncError>,
    mode_overrides: VecDeque<ConnectionMode>,
    initial_messages: Vec<SequencedMessage>,
    initial_contents: Vec<riptide::ContentMessage>,
    initial_signals: Vec<riptide::SignalMessage>,
    client_id: String,
    requested_modes: Vec<ConnectionMode>,
    current: Option<(Arc<MockConnection>, mpsc::UnboundedSender<StreamEvent>)>,
}

pub struct MockService {
    pub storage: Arc<MockStorage>,
    state: Mutex<ServiceState>,
}

impl MockService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            storage: Arc::new(MockStorage::default()),
            state: Mutex::new(ServiceState {
                connect_errors: VecDeque::new(),
                mode_overrides: VecDeque::new(),
                initial_messages: Vec::new(),
                initial_contents: Vec::new(),
                initial_signals: Vec::new(),
                client_id: "local-client".to_string(),
                requested_modes: Vec::new(),
                current: None,
            }),
        })
    }

    pub fn push_connect_error(&self, error: SyncError) {
        self.state.lock().unwrap().connect_errors.push_back(error);
    }

    /// Force the next granted connection's mode, regardless of the request.
    pub fn push_mode_override(&self, mode: ConnectionMode) {
        self.state.lock().unwrap().mode_overrides.push_back(mode);
    }

    pub fn set_initial_messages(&self, messages: Vec<SequencedMessage>) {
        self.state.lock().unwrap().initial_messages = messages;
    }

    pub fn set_initial_contents(&self, contents: Vec<riptide::ContentMessage>) {
        self.state.lock().unwrap().initial_contents = contents;
    }

    pub fn set_initial_signals(&self, signals: Vec<riptide::SignalMessage>) {
        self.state.lock().unwrap().initial_signals = signals;
    }

    pub fn requested_modes(&self) -> Vec<ConnectionMode> {
        self.state.lock().unwrap().requested_modes.clone()
    }

    pub fn connection(&self) -> Arc<MockConnection> {
        self.state
            .lock()
            .unwrap()
            .current
            .as_ref()
            .expect("no live connection")
            .0
            .clone()
    }

    /// Drive a server-side event into the live connection.
    pub fn emit(&self, event: StreamEvent) {
        let sender = self
            .state
            .lock()
            .unwrap()
            .current
            .as_ref()
            .expect("no live connection")
            .1
            .clone();
        sender.send(event).expect("event channel closed");
    }

    pub fn emit_ops(&self, messages: Vec<SequencedMessage>) {
        self.emit(StreamEvent::Op(messages));
    }
}

#[async_trait]
impl DocumentService for MockService {
    async fn connect_to_delta_stream(
        &self,
        _client: &ClientProfile,
        mode: ConnectionMode,
    ) -> Result<StreamHandle, SyncError> {
        let mut state = self.state.lock().unwrap();
        state.requested_modes.push(mode);
        if let Some(error) = state.connect_errors.pop_front() {
            return Err(error);
        }
        let granted = state.mode_overrides.pop_front().unwrap_or(mode);
        let details = ConnectionDetails {
            client_id: state.client_id.clone(),
            mode: granted,
            service_configuration: None,
            max_message_size: None,
            initial_messages: state.initial_messages.drain(..).collect(),
            initial_contents: state.initial_contents.drain(..).collect(),
            initial_signals: state.initial_signals.drain(..).collect(),
            version: Some("1.0".to_string()),
            claims: None,
            epoch: None,
        };
        let connection = Arc::new(MockConnection::new(details));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        state.current = Some((Arc::clone(&connection), event_tx));
        Ok(StreamHandle {
            connection,
            events: event_rx,
        })
    }

    async fn connect_to_delta_storage(&self) -> Result<Arc<dyn DeltaStorage>, SyncError> {
        Ok(Arc::clone(&self.storage) as Arc<dyn DeltaStorage>)
    }
}

// ---- delta storage ----------------------------------------------------------

#[derive(Default)]
pub struct MockStorage {
    ops: Mutex<Vec<SequencedMessage>>,
    scripted: Mutex<VecDeque<Result<Vec<SequencedMessage>, SyncError>>>,
    pub calls: Mutex<Vec<(Seq, Seq)>>,
}

impl MockStorage {
    pub fn seed(&self, ops: Vec<SequencedMessage>) {
        *self.ops.lock().unwrap() = ops;
    }

    /// Queue a response consumed before the seeded ops are consulted.
    pub fn script(&self, response: Result<Vec<SequencedMessage>, SyncError>) {
        self.scripted.lock().unwrap().push_back(response);
    }

    pub fn call_log(&self) -> Vec<(Seq, Seq)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeltaStorage for MockStorage {
    async fn get(&self, from: Seq, to: Seq) -> Result<Vec<SequencedMessage>, SyncError> {
        self.calls.lock().unwrap().push((from, to));
        if let Some(response) = self.scripted.lock().unwrap().pop_front() {
            return response;
        }
        Ok(self
            .ops
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.sequence_number > from && m.sequence_number < to)
            .cloned()
            .collect())
    }
}

// ---- op handler -------------------------------------------------------------

#[derive(Default)]
pub struct RecordingHandler {
    pub seqs: Mutex<Vec<Seq>>,
    pub msns: Mutex<Vec<Seq>>,
    pub contents: Mutex<Vec<Option<Value>>>,
    pub signals: Mutex<Vec<Value>>,
    pub immediate_no_op: AtomicBool,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sequence_numbers(&self) -> Vec<Seq> {
        self.seqs.lock().unwrap().clone()
    }
}

impl OpHandler for RecordingHandler {
    fn process(&self, message: &SequencedMessage) -> Result<ProcessOutcome, SyncError> {
        self.seqs.lock().unwrap().push(message.sequence_number);
        self.msns
            .lock()
            .unwrap()
            .push(message.minimum_sequence_number);
        self.contents.lock().unwrap().push(message.contents.clone());
        Ok(ProcessOutcome {
            immediate_no_op: self.immediate_no_op.load(Ordering::SeqCst),
        })
    }

    fn process_signal(&self, signal: SignalEnvelope) -> Result<(), SyncError> {
        self.signals.lock().unwrap().push(signal.content);
        Ok(())
    }
}

// ---- event log --------------------------------------------------------------

#[derive(Default)]
pub struct EventLog {
    events: Mutex<Vec<DeltaManagerEvent>>,
}

impl EventLog {
    pub fn attach(manager: &Arc<riptide::DeltaManager>) -> Arc<Self> {
        let log = Arc::new(Self::default());
        let sink = Arc::clone(&log);
        manager.on_event(move |event| {
            sink.events.lock().unwrap().push(event.clone());
        });
        log
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|event| match event {
                DeltaManagerEvent::Connect { .. } => "connect",
                DeltaManagerEvent::Disconnect { .. } => "disconnect",
                DeltaManagerEvent::Error { .. } => "error",
                DeltaManagerEvent::Pong { .. } => "pong",
                DeltaManagerEvent::ProcessTime { .. } => "processTime",
                DeltaManagerEvent::AllSentOpsAcked => "allSentOpsAckd",
                DeltaManagerEvent::CaughtUp => "caughtUp",
                DeltaManagerEvent::PrepareSend { .. } => "prepareSend",
                DeltaManagerEvent::SubmitOp { .. } => "submitOp",
                DeltaManagerEvent::ConnectionDelay { .. } => "connectionDelay",
            })
            .collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.names().iter().filter(|n| **n == name).count()
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                DeltaManagerEvent::ConnectionDelay { delay } => Some(*delay),
                _ => None,
            })
            .collect()
    }
}

// ---- epoch collaborators ----------------------------------------------------

pub fn ok_response(epoch: Option<&str>, body: &str) -> HttpResponse {
    response(200, epoch, body)
}

pub fn response(status: u16, epoch: Option<&str>, body: &str) -> HttpResponse {
    let mut headers = HashMap::new();
    if let Some(epoch) = epoch {
        headers.insert(EPOCH_HEADER.to_string(), epoch.to_string());
    }
    HttpResponse {
        status,
        headers,
        body: bytes::Bytes::from(body.to_string()),
    }
}

#[derive(Default)]
pub struct MockHttpBackend {
    routes: Mutex<Vec<(String, VecDeque<Result<HttpResponse, SyncError>>)>>,
    pub requests: Mutex<Vec<HttpRequest>>,
    active: AtomicUsize,
    pub peak: AtomicUsize,
    pub delay: Mutex<Option<Duration>>,
}

impl MockHttpBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a response for any request whose URL contains `key`.
    pub fn script(&self, key: &str, response: Result<HttpResponse, SyncError>) {
        let mut routes = self.routes.lock().unwrap();
        if let Some((_, queue)) = routes.iter_mut().find(|(k, _)| k == key) {
            queue.push_back(response);
        } else {
            let mut queue = VecDeque::new();
            queue.push_back(response);
            routes.push((key.to_string(), queue));
        }
    }

    pub fn requests_matching(&self, key: &str) -> Vec<HttpRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url.as_str().contains(key))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl HttpBackend for MockHttpBackend {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, SyncError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        let url = request.url.as_str().to_string();
        self.requests.lock().unwrap().push(request);
        let mut routes = self.routes.lock().unwrap();
        if let Some((_, queue)) = routes.iter_mut().find(|(k, _)| url.contains(k.as_str())) {
            if let Some(response) = queue.pop_front() {
                return response;
            }
        }
        Ok(ok_response(None, "{}"))
    }
}

#[derive(Default)]
pub struct MockCache {
    pub entries: Mutex<HashMap<String, CachedValue>>,
    pub removed: Mutex<Vec<FileEntry>>,
}

impl MockCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, kind: &str, value: CachedValue) {
        self.entries.lock().unwrap().insert(kind.to_string(), value);
    }

    pub fn removed_count(&self) -> usize {
        self.removed.lock().unwrap().len()
    }
}

#[async_trait]
impl PersistentCache for MockCache {
    async fn get(
        &self,
        entry: &CacheEntryKey,
        _max_op_count: Option<u64>,
    ) -> Result<Option<CachedValue>, SyncError> {
        Ok(self.entries.lock().unwrap().get(&entry.kind).cloned())
    }

    async fn remove_entries(&self, file: &FileEntry) -> Result<(), SyncError> {
        self.removed.lock().unwrap().push(file.clone());
        self.entries.lock().unwrap().clear();
        Ok(())
    }
}

pub fn file_entry() -> FileEntry {
    FileEntry {
        document_id: "doc-1".to_string(),
        file_url: "https://service.example/files/doc-1".to_string(),
    }
}
