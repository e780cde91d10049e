//! Pausable FIFO work queues.
//!
//! Each pipeline stage of the delta manager owns one [`WorkQueue`] plus a
//! spawned worker that dequeues a single item, awaits its handler, then
//! moves on.  A handler error pauses the queue and is reported through the
//! error sink supplied at spawn time; the manager forwards it as its own
//! error event.  Queues start paused.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::error::SyncError;

struct QueueState<T> {
    items: VecDeque<T>,
    paused: bool,
    closed: bool,
    processing: bool,
}

struct QueueShared<T> {
    name: &'static str,
    state: Mutex<QueueState<T>>,
    signal: Notify,
    idle: Notify,
}

impl<T> QueueShared<T> {
    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState<T>> {
        self.state.lock().expect("queue state poisoned")
    }
}

pub struct WorkQueue<T> {
    shared: Arc<QueueShared<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> WorkQueue<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                name,
                state: Mutex::new(QueueState {
                    items: VecDeque::new(),
                    paused: true,
                    closed: false,
                    processing: false,
                }),
                signal: Notify::new(),
                idle: Notify::new(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.shared.name
    }

    pub fn push(&self, item: T) {
        {
            let mut state = self.shared.lock();
            if state.closed {
                trace!(target: "riptide::queue", queue = self.shared.name, "push after close dropped");
                return;
            }
            state.items.push_back(item);
        }
        self.shared.signal.notify_one();
    }

    pub fn pause(&self) {
        self.shared.lock().paused = true;
    }

    pub fn resume(&self) {
        self.shared.lock().paused = false;
        self.shared.signal.notify_one();
    }

    pub fn clear(&self) {
        {
            let mut state = self.shared.lock();
            state.items.clear();
        }
        self.shared.idle.notify_waiters();
    }

    /// Terminal: the worker exits and later pushes are dropped.
    pub fn close(&self) {
        {
            let mut state = self.shared.lock();
            state.closed = true;
            state.items.clear();
        }
        // notify_one stores a permit, so a worker that has not re-polled
        // its notified future yet still observes the close.
        self.shared.signal.notify_one();
        self.shared.signal.notify_waiters();
        self.shared.idle.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.shared.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_paused(&self) -> bool {
        self.shared.lock().paused
    }

    /// Read-only view handed out by the manager.
    pub fn handle(&self) -> QueueHandle<T> {
        QueueHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Spawn the worker that drains this queue through `handler`.
    ///
    /// On handler error the queue is paused and the error goes to `on_error`.
    pub fn spawn_worker<F, Fut, E>(&self, mut handler: F, on_error: E) -> JoinHandle<()>
    where
        F: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), SyncError>> + Send + 'static,
        E: Fn(SyncError) + Send + Sync + 'static,
    {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            loop {
                let notified = shared.signal.notified();
                let item = {
                    let mut state = shared.lock();
                    if state.closed {
                        return;
                    }
                    if state.paused {
                        None
                    } else if let Some(item) = state.items.pop_front() {
                        state.processing = true;
                        Some(item)
                    } else {
                        None
                    }
                };
                match item {
                    Some(item) => {
                        let result = handler(item).await;
                        let mut state = shared.lock();
                        state.processing = false;
                        if let Err(err) = result {
                            state.paused = true;
                            drop(state);
                            trace!(target: "riptide::queue", queue = shared.name, error = %err, "worker error");
                            on_error(err);
                        } else if state.items.is_empty() {
                            drop(state);
                            shared.idle.notify_waiters();
                        }
                    }
                    None => notified.await,
                }
            }
        })
    }
}

/// Read-only handle onto a queue: length, paused state, idle waits.
pub struct QueueHandle<T> {
    shared: Arc<QueueShared<T>>,
}

impl<T> Clone for QueueHandle<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> QueueHandle<T> {
    pub fn name(&self) -> &'static str {
        self.shared.name
    }

    pub fn len(&self) -> usize {
        self.shared.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_paused(&self) -> bool {
        self.shared.lock().paused
    }

    /// Wait until the queue is drained and no item is mid-handler.
    pub async fn idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.shared.lock();
                if state.closed || (state.items.is_empty() && !state.processing) {
                    return;
                }
            }
            notified.await;
        }
    }
}
