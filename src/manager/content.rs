//! Bounded buffer for the content side-channel.
//!
//! Ops can arrive on the realtime stream without their `contents`; the
//! payload travels separately keyed by `(client_id, client_sequence_number)`
//! and is matched up here.  Per client, content arrives in increasing
//! client sequence order, so lookups may skip over stale entries.  The
//! buffer evicts its globally oldest entry once full.

use std::collections::{HashMap, VecDeque};

use crate::protocol::ContentMessage;

pub(crate) struct ContentCache {
    capacity: usize,
    total: usize,
    arrival: VecDeque<String>,
    by_client: HashMap<String, VecDeque<ContentMessage>>,
}

impl ContentCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            total: 0,
            arrival: VecDeque::new(),
            by_client: HashMap::new(),
        }
    }

    pub fn set(&mut self, message: ContentMessage) {
        let client_id = message.client_id.clone();
        self.by_client
            .entry(client_id.clone())
            .or_default()
            .push_back(message);
        self.arrival.push_back(client_id);
        self.total += 1;
        while self.total > self.capacity {
            self.evict_oldest();
        }
    }

    pub fn peek(&self, client_id: &str) -> Option<&ContentMessage> {
        self.by_client.get(client_id).and_then(|queue| queue.front())
    }

    pub fn get(&mut self, client_id: &str) -> Option<ContentMessage> {
        let queue = self.by_client.get_mut(client_id)?;
        let message = queue.pop_front()?;
        if queue.is_empty() {
            self.by_client.remove(client_id);
        }
        if let Some(pos) = self.arrival.iter().position(|id| id == client_id) {
            self.arrival.remove(pos);
        }
        self.total -= 1;
        Some(message)
    }

    pub fn len(&self) -> usize {
        self.total
    }

    fn evict_oldest(&mut self) {
        // The oldest entry overall is the front of the oldest client's
        // queue, which is exactly what get() removes.
        if let Some(client_id) = self.arrival.front().cloned() {
            self.get(&client_id);
        }
    }
}
