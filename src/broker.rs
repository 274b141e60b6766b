//! Per-node outbound mailboxes and per-message-id response mailboxes,
//! modelled on `cache/memory/message_broker.py`'s `AsyncQueue`: FIFO per
//! key, no ordering across keys, non-blocking enqueue.

use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

use crate::message::NetworkMessage;

/// How long a consumer will wait on an empty queue before giving up, per
/// `spec.md` §5.
pub const DRIVER_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("broker wait for key {0} timed out")]
    Timeout(String),
    #[error("broker queue for key {0} was closed")]
    Closed(String),
}

struct Mailbox {
    tx: mpsc::UnboundedSender<NetworkMessage>,
    /// `Arc`-wrapped so a caller can clone the handle out of the `DashMap`
    /// entry and drop the shard's write-lock guard before awaiting the
    /// receiver lock — holding the `DashMap` guard across an `.await` would
    /// block any concurrent `publish`/`add_response` on the same key for as
    /// long as the wait lasts.
    rx: Arc<Mutex<mpsc::UnboundedReceiver<NetworkMessage>>>,
}

impl Mailbox {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }
}

/// Outbound per-peer mailboxes and per-message-id response mailboxes,
/// sharing the same key/value shape but kept in separate maps so a peer id
/// and a message id never collide.
pub struct Broker {
    outbound: DashMap<String, Mailbox>,
    responses: DashMap<String, Mailbox>,
    /// Message ids someone is actively awaiting a correlated reply for,
    /// distinguishing a point-to-point request/response from an
    /// uncorrelated broadcast carrying the same built-in message type
    /// (e.g. a `SyncRequest` reply vs. periodic `SyncNode` gossip).
    pending: DashSet<String>,
    wait_timeout: Duration,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    pub fn new() -> Self {
        Self {
            outbound: DashMap::new(),
            responses: DashMap::new(),
            pending: DashSet::new(),
            wait_timeout: DRIVER_TIMEOUT,
        }
    }

    /// Test/tuning hook: build a broker with a shorter wait than the
    /// production 60s default.
    pub fn with_timeout(wait_timeout: Duration) -> Self {
        Self {
            outbound: DashMap::new(),
            responses: DashMap::new(),
            pending: DashSet::new(),
            wait_timeout,
        }
    }

    /// Mark `message_id` as awaiting a correlated reply. Callers making a
    /// point-to-point request should call this before sending, then check
    /// [`Broker::is_pending`] on the receive side to tell a correlated
    /// response apart from an uncorrelated broadcast of the same message
    /// type.
    pub fn mark_pending(&self, message_id: &str) {
        self.pending.insert(message_id.to_string());
    }

    pub fn is_pending(&self, message_id: &str) -> bool {
        self.pending.contains(message_id)
    }

    /// Enqueue `envelope` for the peer-bound send loop. Non-blocking.
    pub fn publish(&self, node_id: &str, envelope: NetworkMessage) {
        let mailbox = self
            .outbound
            .entry(node_id.to_string())
            .or_insert_with(Mailbox::new);
        // an unbounded channel send only fails if every receiver (including
        // our own retained clone) was dropped, which never happens here.
        let _ = mailbox.tx.send(envelope);
    }

    /// Block up to [`DRIVER_TIMEOUT`] for the next message addressed to
    /// `node_id`, returning `None` on timeout (the caller's send loop should
    /// treat that as "nothing to send right now", not an error).
    pub async fn get(&self, node_id: &str) -> Option<NetworkMessage> {
        let rx = self
            .outbound
            .entry(node_id.to_string())
            .or_insert_with(Mailbox::new)
            .rx
            .clone();
        let mut rx = rx.lock().await;
        timeout(self.wait_timeout, rx.recv()).await.ok().flatten()
    }

    /// Enqueue a response, keyed by the originating request's `message_id`.
    pub fn add_response(&self, envelope: NetworkMessage) {
        let key = envelope.metadata().message_id.clone();
        let mailbox = self.responses.entry(key).or_insert_with(Mailbox::new);
        let _ = mailbox.tx.send(envelope);
    }

    /// Drain up to `expected_count` responses keyed by `message_id`, waiting
    /// up to [`DRIVER_TIMEOUT`] between each one. Returns fewer than
    /// `expected_count` items (never an error) once the timeout elapses —
    /// callers that need partial-result semantics (e.g. broadcast
    /// collection) should treat a short return as "whatever arrived in
    /// time", matching `spec.md` scenario 5.
    pub async fn response_stream(
        &self,
        message_id: &str,
        expected_count: usize,
    ) -> Vec<NetworkMessage> {
        let mut collected = Vec::with_capacity(expected_count);
        if expected_count == 0 {
            return collected;
        }

        self.mark_pending(message_id);
        let rx = self
            .responses
            .entry(message_id.to_string())
            .or_insert_with(Mailbox::new)
            .rx
            .clone();
        let mut rx = rx.lock().await;

        while collected.len() < expected_count {
            match timeout(self.wait_timeout, rx.recv()).await {
                Ok(Some(envelope)) => collected.push(envelope),
                Ok(None) | Err(_) => break,
            }
        }

        collected
    }

    /// Same as [`Broker::response_stream`] but surfaces the timeout as an
    /// error, for callers that require the full `expected_count` (`spec.md`
    /// §4.3: "raises `BrokerTimeout` if stall exceeds `DRIVER_TIMEOUT`").
    pub async fn response_stream_strict(
        &self,
        message_id: &str,
        expected_count: usize,
    ) -> Result<Vec<NetworkMessage>, BrokerError> {
        let collected = self.response_stream(message_id, expected_count).await;
        if collected.len() < expected_count {
            return Err(BrokerError::Timeout(message_id.to_string()));
        }
        Ok(collected)
    }

    /// Drop a mailbox once its responses are no longer needed, to avoid
    /// unbounded growth of the responses map over a long-running process.
    pub fn forget_response_key(&self, message_id: &str) {
        self.responses.remove(message_id);
        self.pending.remove(message_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageMetadata;

    fn envelope(network_id: &str, node_id: &str) -> NetworkMessage {
        NetworkMessage::AuthConnect {
            metadata: MessageMetadata::new(network_id, node_id),
        }
    }

    #[tokio::test]
    async fn publish_then_get_is_fifo() {
        let broker = Broker::new();
        let first = envelope("net-1", "a");
        let second = envelope("net-1", "b");
        broker.publish("peer-1", first.clone());
        broker.publish("peer-1", second.clone());

        assert_eq!(broker.get("peer-1").await, Some(first));
        assert_eq!(broker.get("peer-1").await, Some(second));
    }

    #[tokio::test]
    async fn get_blocked_on_empty_queue_still_receives_concurrent_publish() {
        let broker = Arc::new(Broker::new());
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.get("peer-1").await })
        };
        tokio::task::yield_now().await;
        broker.publish("peer-1", envelope("net-1", "a"));

        let result = tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .expect("get() must not block behind its own entry lock")
            .unwrap();
        assert_eq!(result, Some(envelope("net-1", "a")));
    }

    #[tokio::test]
    async fn response_stream_waiting_still_receives_concurrent_add_response() {
        let broker = Arc::new(Broker::new());
        let message_id = "mid-1".to_string();
        let waiter = {
            let broker = broker.clone();
            let message_id = message_id.clone();
            tokio::spawn(async move { broker.response_stream(&message_id, 1).await })
        };
        tokio::task::yield_now().await;

        let mut reply = envelope("net-1", "a");
        if let NetworkMessage::AuthConnect { metadata } = &mut reply {
            metadata.message_id = message_id.clone();
        }
        broker.add_response(reply.clone());

        let result = tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .expect("response_stream() must not block behind its own entry lock")
            .unwrap();
        assert_eq!(result, vec![reply]);
    }

    #[tokio::test]
    async fn get_on_empty_queue_times_out() {
        let broker = Broker::new();
        let result = tokio::time::timeout(Duration::from_millis(50), broker.get("nobody")).await;
        assert!(result.is_err(), "get() should still be waiting at 50ms");
    }

    #[tokio::test]
    async fn response_stream_collects_up_to_expected_count() {
        let broker = Broker::new();
        let one = envelope("net-1", "a");
        let message_id = one.metadata().message_id.clone();

        broker.add_response(one.clone());

        let collected = broker.response_stream(&message_id, 1).await;
        assert_eq!(collected, vec![one]);
    }

    #[tokio::test]
    async fn response_stream_strict_errors_on_short_collection() {
        let broker = Broker::with_timeout(Duration::from_millis(20));
        let err = broker
            .response_stream_strict("nonexistent", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Timeout(_)));
    }

    #[tokio::test]
    async fn response_stream_returns_partial_collection_on_timeout() {
        let broker = Broker::with_timeout(Duration::from_millis(20));
        let one = envelope("net-1", "a");
        let message_id = one.metadata().message_id.clone();
        broker.add_response(one.clone());

        let collected = broker.response_stream(&message_id, 3).await;
        assert_eq!(collected, vec![one]);
    }
}
