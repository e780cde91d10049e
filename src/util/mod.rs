//! Small concurrency primitives shared across the crate.

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::error::SyncError;

/// Single-shot completion: one producer resolves or rejects, any number of
/// consumers await.  The first completion wins; later ones are ignored.
pub struct Deferred<T> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    state: Mutex<Option<Result<T, SyncError>>>,
    notify: Notify,
}

impl<T: Clone> Deferred<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(None),
                notify: Notify::new(),
            }),
        }
    }

    /// Returns false if the deferred was already completed.
    pub fn resolve(&self, value: T) -> bool {
        self.complete(Ok(value))
    }

    /// Returns false if the deferred was already completed.
    pub fn reject(&self, error: SyncError) -> bool {
        self.complete(Err(error))
    }

    fn complete(&self, outcome: Result<T, SyncError>) -> bool {
        let mut state = self.shared.state.lock().expect("deferred state poisoned");
        if state.is_some() {
            return false;
        }
        *state = Some(outcome);
        drop(state);
        self.shared.notify.notify_waiters();
        true
    }

    pub fn is_complete(&self) -> bool {
        self.shared
            .state
            .lock()
            .expect("deferred state poisoned")
            .is_some()
    }

    pub async fn wait(&self) -> Result<T, SyncError> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a completion racing with this
            // wait cannot slip between the check and the await.
            notified.as_mut().enable();
            {
                let state = self.shared.state.lock().expect("deferred state poisoned");
                if let Some(outcome) = state.as_ref() {
                    return outcome.clone();
                }
            }
            notified.await;
        }
    }
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}
