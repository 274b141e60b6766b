//! Connection manager: establishes and maintains exactly one live route per
//! approved peer, per `spec.md` §4.7's state machine
//! (`detached → probing → ws_up ⇄ ws_retry → sse_up ⇄ sse_retry →
//! relay_request → proxied|unreachable`), grounded on
//! `network_interface.py`'s `_establish_connection`/`_websocket_handler`/
//! `send_message`/`broadcast_message`.
//!
//! This module never imports [`crate::routing`] or [`crate::sync`]
//! directly; the post-authentication dispatch hook is supplied as a
//! callback (`MessageHandler`), breaking the cyclic dependency `spec.md`
//! §9 calls out between the connection manager and the routing/auth/sync
//! interfaces.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::db::{DbError, NodeRepository};
use crate::engine::Engine;
use crate::kms::KmsError;
use crate::message::{MessageError, MessageMetadata, NetworkMessage};
use crate::model::Node;
use crate::route::{ConnectivityType, Route, TransportType};
use crate::routing;
use crate::transport::TransportError;

/// How long a connection attempt keeps retrying the current transport
/// before falling to the next one, per `spec.md` §4.7/§5.
pub const STAGE_BUDGET: Duration = Duration::from_secs(60);
/// Polling interval used by the WS send loop between mailbox checks.
const SEND_LOOP_POLL: Duration = Duration::from_secs(10);
/// How long the send loop waits for a pong before closing, per `spec.md` §5.
const PONG_TIMEOUT: Duration = Duration::from_secs(10);
/// Fully-qualified id of the relay wrapper used for proxy hops (resolves
/// `spec.md` §9's Open Question on the exact proxy envelope: this crate
/// wraps the inner message once per `send_message`'s TODO and forwards it
/// through the broker like any other message).
pub const RELAY_MESSAGE_ID: &str = "link.dedi.core.relay";
/// How many `RouteResponse`s a relay attempt waits for before giving up.
const RELAY_RESPONSE_BUDGET: usize = 8;

#[derive(thiserror::Error, Debug)]
pub enum ConnectionError {
    #[error("node {0} is not connected")]
    NotConnected(String),
    #[error("no route to node {0} could be established")]
    Unreachable(String),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("db error: {0}")]
    Db(#[from] DbError),
    #[error("kms error: {0}")]
    Kms(#[from] KmsError),
    #[error("message error: {0}")]
    Message(#[from] MessageError),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("invalid signature on incoming message")]
    InvalidSignature,
    #[error("serialisation error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Callback invoked once an inbound envelope has been authenticated. Takes
/// the place of a direct dependency on the admission/routing/sync modules.
pub type MessageHandler =
    dyn Fn(NetworkMessage) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync;

/// Wire shape of a signed envelope frame, exchanged over both WebSocket and
/// the SSE/`POST /service/message` pair.
#[derive(Debug, Serialize)]
pub(crate) struct OutFrame<'a> {
    pub message: &'a NetworkMessage,
    pub signature: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct InFrame {
    pub message: NetworkMessage,
    pub signature: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct RelayBody {
    message: NetworkMessage,
    remaining_chain: Vec<String>,
}

/// Build the signed `{message, signature}` frame for `message`, sharing the
/// exact JSON bytes between signing and transmission (see `kms` module
/// docs on why that invariant matters).
pub(crate) async fn sign_frame(engine: &Engine, network_id: &str, message: &NetworkMessage) -> Result<String, ConnectionError> {
    let body = message.canonical_json()?;
    let signature = engine.kms.sign_payload(&body, network_id).await?;
    Ok(serde_json::to_string(&OutFrame { message, signature })?)
}

fn to_ws_url(http_url: &str, path: &str) -> Result<String, ConnectionError> {
    let mut url = url::Url::parse(http_url).map_err(|_| TransportError::BadUrl(http_url.to_string()))?;
    let scheme = match url.scheme() {
        "https" => "wss",
        _ => "ws",
    };
    url.set_scheme(scheme).ok();
    url.set_path(path);
    Ok(url.to_string())
}

/// Maintains live peer connections and dispatches inbound traffic to a
/// caller-supplied handler.
pub struct ConnectionManager {
    engine: Arc<Engine>,
    handler: Arc<MessageHandler>,
}

impl ConnectionManager {
    pub fn new(engine: Arc<Engine>, handler: Arc<MessageHandler>) -> Self {
        Self { engine, handler }
    }

    /// `establish(network, node)`: no-op if a route is already cached;
    /// otherwise walk WS → SSE → relay, publishing a `Route` on success.
    pub async fn establish(
        self: &Arc<Self>,
        network_id: &str,
        self_instance_id: &str,
        node: &Node,
    ) -> Result<(), ConnectionError> {
        if self.engine.routes.contains(network_id, &node.node_id) {
            return Ok(());
        }

        if !self.engine.transport.check_connectivity(&node.node_url).await {
            return self.fall_to_sse(network_id, self_instance_id, node).await;
        }

        match self.try_websocket(network_id, self_instance_id, node).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(node_id = %node.node_id, error = %e, "websocket stage exhausted, falling to sse");
                self.fall_to_sse(network_id, self_instance_id, node).await
            }
        }
    }

    async fn fall_to_sse(
        self: &Arc<Self>,
        network_id: &str,
        self_instance_id: &str,
        node: &Node,
    ) -> Result<(), ConnectionError> {
        match self.try_sse(network_id, self_instance_id, node).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(node_id = %node.node_id, error = %e, "sse stage exhausted, attempting relay");
                self.relay_request(network_id, self_instance_id, &node.node_id).await
            }
        }
    }

    /// `probing → ws_up ⇄ ws_retry`: dial immediately, retrying with no
    /// backoff until `STAGE_BUDGET` has elapsed since the last successful
    /// connection.
    async fn try_websocket(
        self: &Arc<Self>,
        network_id: &str,
        self_instance_id: &str,
        node: &Node,
    ) -> Result<(), ConnectionError> {
        let ws_url = to_ws_url(&node.node_url, "/service/websocket")?;
        let mut last_success = Instant::now();

        loop {
            match tokio_tungstenite::connect_async(&ws_url).await {
                Ok((stream, _response)) => {
                    last_success = Instant::now();
                    info!(node_id = %node.node_id, "websocket connected");

                    self.engine.routes.insert(Route::direct(
                        network_id,
                        &node.node_id,
                        TransportType::Websocket,
                        true,
                    ));

                    let first_frame = NetworkMessage::AuthConnect {
                        metadata: MessageMetadata::new(network_id, self_instance_id),
                    };
                    let framed = sign_frame(&self.engine, network_id, &first_frame).await?;

                    let (mut sink, stream) = stream.split();
                    if sink.send(WsMessage::Text(framed)).await.is_err() {
                        continue;
                    }

                    self.clone()
                        .run_ws_session(sink, stream, node.node_id.clone())
                        .await;

                    self.engine.routes.remove(network_id, &node.node_id);
                }
                Err(e) => {
                    debug!(node_id = %node.node_id, error = %e, "websocket dial failed");
                }
            }

            if last_success.elapsed() > STAGE_BUDGET {
                return Err(ConnectionError::Unreachable(node.node_id.clone()));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Drives one established WebSocket's send and receive loops until
    /// either side closes or a ping goes unanswered, per `spec.md` §4.7.
    async fn run_ws_session(
        self: Arc<Self>,
        mut sink: futures::stream::SplitSink<
            tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
            WsMessage,
        >,
        mut stream: futures::stream::SplitStream<
            tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
        >,
        peer_id: String,
    ) {
        loop {
            tokio::select! {
                outbound = timeout(SEND_LOOP_POLL, self.engine.broker.get(&peer_id)) => {
                    match outbound {
                        Ok(Some(message)) => {
                            let Ok(framed) = sign_frame(&self.engine, &message.metadata().network_id, &message).await else {
                                continue;
                            };
                            if sink.send(WsMessage::Text(framed)).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => {
                            // get() itself timed out internally; loop back and poll again.
                        }
                        Err(_) => {
                            if sink.send(WsMessage::Text(r#"{"ping":true}"#.to_string())).await.is_err() {
                                return;
                            }
                            match timeout(PONG_TIMEOUT, stream.next()).await {
                                Ok(Some(Ok(frame))) if is_pong(&frame) => {}
                                _ => {
                                    let _ = sink.close().await;
                                    return;
                                }
                            }
                        }
                    }
                }
                inbound = stream.next() => {
                    match inbound {
                        Some(Ok(frame)) => {
                            if let Some(reply) = self.handle_frame(&peer_id, &frame).await {
                                if sink.send(reply).await.is_err() {
                                    return;
                                }
                            }
                        }
                        _ => return,
                    }
                }
            }
        }
    }

    async fn handle_frame(&self, peer_id: &str, frame: &WsMessage) -> Option<WsMessage> {
        let text = match frame {
            WsMessage::Text(t) => t.clone(),
            WsMessage::Close(_) => return None,
            _ => return None,
        };

        let value: serde_json::Value = serde_json::from_str(&text).ok()?;
        if value.get("ping").and_then(|v| v.as_bool()) == Some(true) {
            return Some(WsMessage::Text(r#"{"pong":true}"#.to_string()));
        }
        if value.get("pong").is_some() {
            return None;
        }

        match self.authenticate_and_dispatch(&text).await {
            Ok(()) => None,
            Err(e) => {
                warn!(peer_id, error = %e, "dropping unauthenticated inbound frame");
                Some(WsMessage::Text(
                    serde_json::json!({"error": e.to_string()}).to_string(),
                ))
            }
        }
    }

    /// Parse a `{message, signature}` frame, verify it against the sender's
    /// known public key, and hand it off to the configured handler.
    /// Shared by the outbound WS loop and by `http`'s inbound WS/SSE
    /// handlers.
    pub async fn authenticate_and_dispatch(&self, frame_json: &str) -> Result<(), ConnectionError> {
        let InFrame { message, signature } = serde_json::from_str(frame_json)?;
        self.verify_and_dispatch(message, &signature).await
    }

    pub async fn verify_and_dispatch(
        &self,
        message: NetworkMessage,
        signature: &str,
    ) -> Result<(), ConnectionError> {
        let metadata = message.metadata().clone();
        let sender = self
            .engine
            .db
            .nodes
            .get(&metadata.node_id)
            .await?
            .ok_or_else(|| ConnectionError::NotConnected(metadata.node_id.clone()))?;
        let public_key = sender
            .public_key
            .ok_or_else(|| ConnectionError::NotConnected(metadata.node_id.clone()))?;

        let body = message.canonical_json()?;
        if !self.engine.kms.verify_signature(&body, &public_key, signature).await? {
            return Err(ConnectionError::InvalidSignature);
        }

        if let NetworkMessage::Custom { id, body, .. } = &message {
            if id == RELAY_MESSAGE_ID {
                self.handle_relay(&metadata.network_id, body.clone()).await;
                return Ok(());
            }
        }

        (self.handler)(message).await;
        Ok(())
    }

    /// `sse_up ⇄ sse_retry`: same retry budget as WS, opened against
    /// `/service/event` with the `AuthConnect` body and
    /// `Message-Signature` header.
    async fn try_sse(
        self: &Arc<Self>,
        network_id: &str,
        self_instance_id: &str,
        node: &Node,
    ) -> Result<(), ConnectionError> {
        let connect = NetworkMessage::AuthConnect {
            metadata: MessageMetadata::new(network_id, self_instance_id),
        };
        let body = connect.canonical_json()?;
        let signature = self.engine.kms.sign_payload(&body, network_id).await?;

        let deadline = Instant::now() + STAGE_BUDGET;
        loop {
            let url = format!("{}/service/event", node.node_url);
            let headers = vec![("Message-Signature".to_string(), signature.clone())];
            let payload: serde_json::Value = serde_json::from_str(&body)?;
            let mut lines = Box::pin(self.engine.transport.stream(url, payload, headers));

            match lines.next().await {
                Some(Ok(_first)) => {
                    self.engine.routes.insert(Route::direct(
                        network_id,
                        &node.node_id,
                        TransportType::Sse,
                        true,
                    ));

                    let manager = self.clone();
                    let peer_id = node.node_id.clone();
                    tokio::spawn(async move {
                        while let Some(line) = lines.next().await {
                            let Ok(line) = line else { break };
                            if line.trim() == "ping" {
                                continue;
                            }
                            if let Err(e) = manager.authenticate_and_dispatch(&line).await {
                                warn!(peer_id = %peer_id, error = %e, "dropping sse frame");
                            }
                        }
                        manager.engine.routes.remove(network_id, &peer_id);
                    });
                    return Ok(());
                }
                _ => {
                    if Instant::now() >= deadline {
                        return Err(ConnectionError::Unreachable(node.node_id.clone()));
                    }
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            }
        }
    }

    /// `relay_request`: broadcast `RouteRequest`, keep the shortest
    /// non-empty proxy chain a peer responds with.
    async fn relay_request(
        self: &Arc<Self>,
        network_id: &str,
        self_instance_id: &str,
        target_node: &str,
    ) -> Result<(), ConnectionError> {
        let manager = self.clone();
        let network_id_owned = network_id.to_string();
        let broadcast: &routing::BroadcastFn = &move |message| {
            let manager = manager.clone();
            Box::pin(async move { manager.broadcast(&message).await })
        };

        let found = routing::request_route(
            &self.engine,
            self_instance_id,
            broadcast,
            &network_id_owned,
            target_node,
        )
        .await;

        if found {
            Ok(())
        } else {
            Err(ConnectionError::Unreachable(target_node.to_string()))
        }
    }

    /// `send(message, node)`: route-dependent dispatch, per `spec.md` §4.7.
    pub async fn send(&self, network_id: &str, node_id: &str, message: NetworkMessage) -> Result<(), ConnectionError> {
        let route = self
            .engine
            .routes
            .get(network_id, node_id)
            .ok_or_else(|| ConnectionError::NotConnected(node_id.to_string()))?;

        match (route.connectivity_type, route.transport_type, route.outbound) {
            (ConnectivityType::Direct, TransportType::Websocket, _) => {
                self.engine.broker.publish(node_id, message);
                Ok(())
            }
            (ConnectivityType::Direct, TransportType::Sse, false) => {
                self.engine.broker.publish(node_id, message);
                Ok(())
            }
            (ConnectivityType::Direct, TransportType::Sse, true) => {
                let node = self
                    .engine
                    .db
                    .nodes
                    .get(node_id)
                    .await?
                    .ok_or_else(|| ConnectionError::NotConnected(node_id.to_string()))?;
                let url = format!("{}/service/message", node.node_url);
                let framed = sign_frame(&self.engine, network_id, &message).await?;
                self.engine
                    .transport
                    .post_message(&url, &framed, network_id, self.engine.kms.as_ref())
                    .await?;
                Ok(())
            }
            (ConnectivityType::Proxied, _, _) => {
                let Some(first_hop) = route.proxy_nodes.first().cloned() else {
                    return Err(ConnectionError::NotConnected(node_id.to_string()));
                };
                let remaining_chain = route.proxy_nodes[1..].to_vec();
                let relay = NetworkMessage::Custom {
                    metadata: MessageMetadata::new(network_id, node_id),
                    id: RELAY_MESSAGE_ID.to_string(),
                    body: serde_json::to_value(RelayBody { message, remaining_chain })?,
                };
                self.engine.broker.publish(&first_hop, relay);
                Ok(())
            }
        }
    }

    /// `broadcast(message)`: best-effort fan-out to every approved peer,
    /// ignoring per-peer failures (`spec.md` §4.7, scenario 5).
    pub async fn broadcast(&self, message: &NetworkMessage) -> usize {
        let network_id = message.metadata().network_id.clone();
        let peers = match self.engine.db.nodes.filter(Some(true)).await {
            Ok(peers) => peers,
            Err(_) => return 0,
        };

        let mut delivered = 0;
        for peer in peers {
            if self.send(&network_id, &peer.node_id, message.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Forward or locally consume a proxied envelope. If `remaining_chain`
    /// is empty we are the final hop and hand the inner message to the
    /// normal dispatch path; otherwise we re-wrap and send it one hop
    /// further, using `proxy_nodes[0]` of the remaining chain as the next
    /// direct neighbour.
    async fn handle_relay(&self, network_id: &str, body: serde_json::Value) {
        let Ok(RelayBody { message, remaining_chain }) = serde_json::from_value::<RelayBody>(body) else {
            warn!("malformed relay body, dropping");
            return;
        };

        if remaining_chain.is_empty() {
            (self.handler)(message).await;
            return;
        }

        let next_hop = remaining_chain[0].clone();
        let rest = remaining_chain[1..].to_vec();
        let Ok(body) = serde_json::to_value(RelayBody { message, remaining_chain: rest }) else {
            warn!("failed to re-serialise relay body, dropping");
            return;
        };
        let relay = NetworkMessage::Custom {
            metadata: MessageMetadata::new(network_id, &next_hop),
            id: RELAY_MESSAGE_ID.to_string(),
            body,
        };
        self.engine.broker.publish(&next_hop, relay);
    }

    /// Broadcast a `RouteNotification` for `broken_node`, per `spec.md`
    /// §4.9.
    pub async fn notify_route_broken(&self, network_id: &str, self_instance_id: &str, broken_node: &str) -> usize {
        let notification = routing::build_route_notification(network_id, self_instance_id, broken_node);
        self.broadcast(&notification).await
    }

    /// Dependents of a proxy that just went away: every cached route that
    /// rode through `broken_node`. Callers (the HTTP surface, on detecting
    /// a dropped connection) use this to decide who else to notify.
    pub fn routes_depending_on(&self, network_id: &str, broken_node: &str) -> Vec<Route> {
        self.engine.routes.routes_via(network_id, broken_node)
    }
}

fn is_pong(frame: &WsMessage) -> bool {
    match frame {
        WsMessage::Text(t) => serde_json::from_str::<serde_json::Value>(t)
            .ok()
            .and_then(|v| v.get("pong").cloned())
            .is_some(),
        WsMessage::Pong(_) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use clap::Parser;

    fn test_engine() -> Arc<Engine> {
        Arc::new(Engine::new(Config::parse_from(["test"])))
    }

    fn noop_handler() -> Arc<MessageHandler> {
        Arc::new(|_msg| Box::pin(async {}))
    }

    #[test]
    fn ws_url_rewrites_scheme_and_path() {
        assert_eq!(
            to_ws_url("http://example.com:5321", "/service/websocket").unwrap(),
            "ws://example.com:5321/service/websocket"
        );
        assert_eq!(
            to_ws_url("https://example.com", "/service/websocket").unwrap(),
            "wss://example.com/service/websocket"
        );
    }

    #[tokio::test]
    async fn send_without_route_is_not_connected() {
        let engine = test_engine();
        let manager = ConnectionManager::new(engine, noop_handler());

        let message = NetworkMessage::AuthConnect {
            metadata: MessageMetadata::new("net-1", "self"),
        };
        let err = manager.send("net-1", "nobody", message).await.unwrap_err();
        assert!(matches!(err, ConnectionError::NotConnected(_)));
    }

    #[tokio::test]
    async fn send_over_websocket_route_publishes_to_broker() {
        let engine = test_engine();
        engine
            .routes
            .insert(Route::direct("net-1", "peer-a", TransportType::Websocket, true));
        let manager = ConnectionManager::new(engine.clone(), noop_handler());

        let message = NetworkMessage::AuthConnect {
            metadata: MessageMetadata::new("net-1", "self"),
        };
        manager.send("net-1", "peer-a", message.clone()).await.unwrap();

        assert_eq!(engine.broker.get("peer-a").await, Some(message));
    }

    #[tokio::test]
    async fn send_over_proxy_route_wraps_and_publishes_to_first_hop() {
        let engine = test_engine();
        engine
            .routes
            .insert(Route::proxied("net-1", "target", vec!["hop-a".to_string(), "hop-b".to_string()]));
        let manager = ConnectionManager::new(engine.clone(), noop_handler());

        let message = NetworkMessage::AuthConnect {
            metadata: MessageMetadata::new("net-1", "self"),
        };
        manager.send("net-1", "target", message).await.unwrap();

        let wrapped = engine.broker.get("hop-a").await.unwrap();
        match wrapped {
            NetworkMessage::Custom { id, body, .. } => {
                assert_eq!(id, RELAY_MESSAGE_ID);
                let relay: RelayBody = serde_json::from_value(body).unwrap();
                assert_eq!(relay.remaining_chain, vec!["hop-b".to_string()]);
            }
            other => panic!("expected relay wrapper, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn broadcast_counts_successful_sends_only() {
        let engine = test_engine();
        engine.db.nodes.save(Node::new("peer-a", "A", "http://a")).await.unwrap();
        let mut approved = Node::new("peer-a", "A", "http://a");
        approved.approved = true;
        engine.db.nodes.update(approved).await.unwrap();
        engine
            .routes
            .insert(Route::direct("net-1", "peer-a", TransportType::Websocket, true));

        let manager = ConnectionManager::new(engine, noop_handler());
        let message = NetworkMessage::SyncRequest {
            metadata: MessageMetadata::new("net-1", "self"),
            target: "INSTANCE".to_string(),
        };
        let count = manager.broadcast(&message).await;
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn relay_with_empty_remaining_chain_dispatches_locally() {
        use std::sync::atomic::{AtomicBool, Ordering};
        let engine = test_engine();
        let received = Arc::new(AtomicBool::new(false));
        let received_clone = received.clone();
        let handler: Arc<MessageHandler> = Arc::new(move |_msg| {
            let received = received_clone.clone();
            Box::pin(async move {
                received.store(true, Ordering::SeqCst);
            })
        });
        let manager = ConnectionManager::new(engine, handler);

        let inner = NetworkMessage::AuthConnect {
            metadata: MessageMetadata::new("net-1", "self"),
        };
        let body = serde_json::to_value(RelayBody {
            message: inner,
            remaining_chain: vec![],
        })
        .unwrap();

        manager.handle_relay("net-1", body).await;
        assert!(received.load(Ordering::SeqCst));
    }
}
