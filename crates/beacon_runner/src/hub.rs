//! WebSocket broadcast hub.
//!
//! Fan-out bus from core components to connected clients. Each client has
//! a bounded queue; a slow client is dropped rather than ever blocking a
//! producer. Back-pressure never reaches the executor or the log writer.

use crate::metrics::{Metrics, METRICS};
use beacon_transparency::Emitter;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

pub struct Hub {
    clients: Mutex<HashMap<u64, mpsc::Sender<String>>>,
    next_id: AtomicU64,
    client_queue: usize,
}

impl Hub {
    pub fn new(client_queue: usize) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            client_queue,
        }
    }

    /// Register a client; the receiver feeds its WebSocket writer task.
    pub fn subscribe(&self) -> (u64, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(self.client_queue);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        clients.insert(id, tx);
        METRICS
            .ws_clients
            .store(clients.len() as i64, Ordering::Relaxed);
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        clients.remove(&id);
        METRICS
            .ws_clients
            .store(clients.len() as i64, Ordering::Relaxed);
    }

    pub fn client_count(&self) -> usize {
        self.clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Send `{type, data, ts}` to every client. Full or closed queues get
    /// the client evicted.
    pub fn broadcast(&self, event: &str, data: Value) {
        let message = json!({
            "type": event,
            "data": data,
            "ts": Utc::now().to_rfc3339(),
        })
        .to_string();

        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        let mut dropped = Vec::new();
        for (id, tx) in clients.iter() {
            if tx.try_send(message.clone()).is_err() {
                dropped.push(*id);
            }
        }
        for id in dropped {
            clients.remove(&id);
            Metrics::inc(&METRICS.ws_dropped);
            debug!(client = id, "Dropped slow WebSocket client");
        }
        METRICS
            .ws_clients
            .store(clients.len() as i64, Ordering::Relaxed);
    }
}

impl Emitter for Hub {
    fn emit(&self, event: &str, data: Value) {
        if event == beacon_transparency::log::ENTRY_APPENDED {
            Metrics::inc(&METRICS.transparency_appended);
        }
        self.broadcast(event, data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_reaches_all_clients() {
        let hub = Hub::new(4);
        let (_id_a, mut rx_a) = hub.subscribe();
        let (_id_b, mut rx_b) = hub.subscribe();

        hub.broadcast("job.status_changed", json!({"id": "job-A"}));

        let raw = rx_a.recv().await.unwrap();
        let parsed: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["type"], "job.status_changed");
        assert_eq!(parsed["data"]["id"], "job-A");
        assert!(rx_b.recv().await.is_some());
    }

    #[tokio::test]
    async fn slow_client_is_dropped_not_awaited() {
        let hub = Hub::new(1);
        let (_id, mut rx) = hub.subscribe();

        hub.broadcast("e", json!(1));
        hub.broadcast("e", json!(2)); // queue full: client evicted

        assert_eq!(hub.client_count(), 0);
        // The first message is still deliverable.
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn unsubscribe_removes_client() {
        let hub = Hub::new(4);
        let (id, _rx) = hub.subscribe();
        assert_eq!(hub.client_count(), 1);
        hub.unsubscribe(id);
        assert_eq!(hub.client_count(), 0);
    }
}
