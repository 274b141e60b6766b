//! HTTP/WS surface: thin `warp` glue over the engine, split into the
//! local `/manage/*` administrative routes and the node-to-node
//! `/service/*` routes, composed the way a `warp::Filter` chain of
//! method+path+body filters `and_then`-ed into handlers normally reads.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::admission::{self, AdmissionError, ChallengeCache, NetworkSummary};
use crate::connection::{self, ConnectionManager};
use crate::db::{NetworkMessageRepository, NetworkRepository, NodeRepository};
use crate::engine::Engine;
use crate::error::GatewayError;
use crate::message::{MessageError, NetworkMessage};
use crate::model::{AdmissionStatus, Network};
use crate::route::{Route, TransportType};
use crate::transport::Transport;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub connection: Arc<ConnectionManager>,
    pub challenges: Arc<ChallengeCache>,
}

fn reject(err: GatewayError) -> Rejection {
    warp::reject::custom(err)
}

fn with_state(state: AppState) -> impl Filter<Extract = (AppState,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

/// Build the full route tree. Callers bind it with `warp::serve`.
pub fn routes(state: AppState) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    manage_routes(state.clone())
        .or(service_routes(state))
        .recover(crate::error::handle_rejection)
}

fn manage_routes(state: AppState) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let base = warp::path("manage");

    let list_networks = base
        .and(warp::path("networks"))
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(state.clone()))
        .and(warp::query::<NetworksQuery>())
        .and_then(list_networks);

    let create_network = base
        .and(warp::path("networks"))
        .and(warp::path::end())
        .and(warp::post())
        .and(with_state(state.clone()))
        .and(warp::body::json())
        .and_then(create_network);

    let get_network = base
        .and(warp::path("networks"))
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(get_network);

    let update_network = base
        .and(warp::path("networks"))
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::patch())
        .and(with_state(state.clone()))
        .and(warp::body::json())
        .and_then(update_network);

    let delete_network = base
        .and(warp::path("networks"))
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::delete())
        .and(with_state(state.clone()))
        .and_then(delete_network);

    let join_network = base
        .and(warp::path("networks"))
        .and(warp::path("join"))
        .and(warp::path::end())
        .and(warp::post())
        .and(with_state(state.clone()))
        .and(warp::body::json())
        .and_then(|state, body| join_or_invite(state, body, false));

    let invite_node = base
        .and(warp::path("networks"))
        .and(warp::path("invite"))
        .and(warp::path::end())
        .and(warp::post())
        .and(with_state(state.clone()))
        .and(warp::body::json())
        .and_then(|state, body| join_or_invite(state, body, true));

    let list_requests = base
        .and(warp::path("requests"))
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(state.clone()))
        .and(warp::query::<RequestsQuery>())
        .and_then(list_requests);

    let decide_request = base
        .and(warp::path("requests"))
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::patch())
        .and(with_state(state.clone()))
        .and(warp::body::json())
        .and_then(decide_request);

    let post_messages = base
        .and(warp::path("messages"))
        .and(warp::path::end())
        .and(warp::post())
        .and(with_state(state))
        .and(warp::body::json())
        .and_then(post_messages);

    list_networks
        .or(create_network)
        .or(get_network)
        .or(update_network)
        .or(delete_network)
        .or(join_network)
        .or(invite_node)
        .or(list_requests)
        .or(decide_request)
        .or(post_messages)
}

fn service_routes(state: AppState) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let base = warp::path("service");

    let status = base
        .and(warp::path("status"))
        .and(warp::path::end())
        .and(warp::get())
        .map(|| warp::reply::json(&serde_json::json!({"status": "running"})));

    let challenge = base
        .and(warp::path("challenge"))
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(service_challenge);

    let networks = base
        .and(warp::path("networks"))
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(service_networks);

    let requests = base
        .and(warp::path("requests"))
        .and(warp::path::end())
        .and(warp::post())
        .and(with_state(state.clone()))
        .and(warp::header::<String>("Message-Signature"))
        .and(warp::body::bytes())
        .and_then(service_requests);

    let requests_poll = base
        .and(warp::path("requests"))
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::post())
        .and(with_state(state.clone()))
        .and(warp::header::<String>("Message-Signature"))
        .and(warp::body::bytes())
        .and_then(service_requests_poll);

    let responses = base
        .and(warp::path("responses"))
        .and(warp::path::end())
        .and(warp::post())
        .and(with_state(state.clone()))
        .and(warp::body::bytes())
        .and_then(service_responses);

    let websocket = base
        .and(warp::path("websocket"))
        .and(warp::path::end())
        .and(warp::ws())
        .and(with_state(state.clone()))
        .map(|ws: warp::ws::Ws, state: AppState| ws.on_upgrade(move |socket| handle_websocket(state, socket)));

    let event = base
        .and(warp::path("event"))
        .and(warp::path::end())
        .and(warp::post())
        .and(with_state(state.clone()))
        .and(warp::header::<String>("Message-Signature"))
        .and(warp::body::bytes())
        .and_then(service_event);

    let message = base
        .and(warp::path("message"))
        .and(warp::path::end())
        .and(warp::post())
        .and(with_state(state))
        .and(warp::body::bytes())
        .and_then(service_message);

    status
        .or(challenge)
        .or(networks)
        .or(requests)
        .or(requests_poll)
        .or(responses)
        .or(websocket)
        .or(event)
        .or(message)
}

#[derive(Debug, Deserialize)]
struct NetworksQuery {
    visible: Option<bool>,
    registered: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RequestsQuery {
    sent: Option<bool>,
    status: Option<AdmissionStatus>,
}

#[derive(Debug, Deserialize)]
struct JoinInviteBody {
    target_url: String,
    network_id: String,
    #[serde(default)]
    justification: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DecideBody {
    approve: bool,
    #[serde(default)]
    #[allow(dead_code)]
    justification: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CustomMessageSpec {
    id: String,
    #[serde(default)]
    body: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageBody {
    network_id: String,
    message: CustomMessageSpec,
    #[serde(default)]
    broadcast: Option<bool>,
    #[serde(default)]
    target_node: Option<String>,
}

async fn list_networks(state: AppState, q: NetworksQuery) -> Result<impl Reply, Rejection> {
    let networks = state
        .engine
        .db
        .networks
        .filter(q.visible, q.registered)
        .await
        .map_err(GatewayError::from)
        .map_err(reject)?;
    Ok(warp::reply::json(&networks))
}

async fn create_network(state: AppState, network: Network) -> Result<impl Reply, Rejection> {
    if let Some(central) = &network.central_node {
        if central != &network.instance_id {
            return Err(reject(GatewayError::InvalidCentralNode));
        }
    }

    state
        .engine
        .db
        .networks
        .save(network.clone())
        .await
        .map_err(GatewayError::from)
        .map_err(reject)?;
    state
        .engine
        .kms
        .generate_network_management_key(&network.network_id)
        .await
        .map_err(GatewayError::from)
        .map_err(reject)?;
    state
        .engine
        .kms
        .generate_network_node_key(&network.network_id)
        .await
        .map_err(GatewayError::from)
        .map_err(reject)?;

    Ok(warp::reply::with_status(warp::reply::json(&network), StatusCode::CREATED))
}

async fn get_network(network_id: String, state: AppState) -> Result<impl Reply, Rejection> {
    let network = state
        .engine
        .db
        .networks
        .get(&network_id)
        .await
        .map_err(GatewayError::from)
        .map_err(reject)?;
    Ok(warp::reply::json(&network))
}

async fn update_network(network_id: String, state: AppState, mut network: Network) -> Result<impl Reply, Rejection> {
    network.network_id = network_id;
    state
        .engine
        .db
        .networks
        .update(network.clone())
        .await
        .map_err(GatewayError::from)
        .map_err(reject)?;
    Ok(warp::reply::json(&network))
}

async fn delete_network(network_id: String, state: AppState) -> Result<impl Reply, Rejection> {
    state
        .engine
        .db
        .networks
        .delete(&network_id)
        .await
        .map_err(GatewayError::from)
        .map_err(reject)?;
    Ok(warp::reply::with_status(warp::reply::json(&serde_json::json!({})), StatusCode::NO_CONTENT))
}

async fn join_or_invite(state: AppState, body: JoinInviteBody, invite: bool) -> Result<impl Reply, Rejection> {
    let engine = state.engine.clone();
    let justification = body.justification.unwrap_or_default();
    tokio::spawn(async move {
        let transport = Transport::new();
        let outcome = if invite {
            admission::send_join_invite(&engine, &transport, &body.target_url, &body.network_id, &justification).await
        } else {
            admission::send_join_request(&engine, &transport, &body.target_url, &body.network_id, &justification).await
        };
        if let Err(e) = outcome {
            tracing::warn!(error = %e, invite, "admission handshake failed");
        }
    });

    Ok(warp::reply::with_status(
        warp::reply::json(&serde_json::json!({"status": "accepted"})),
        StatusCode::ACCEPTED,
    ))
}

async fn list_requests(state: AppState, q: RequestsQuery) -> Result<impl Reply, Rejection> {
    let docs = state
        .engine
        .db
        .messages
        .get_requests(q.sent, q.status)
        .await
        .map_err(GatewayError::from)
        .map_err(reject)?;
    Ok(warp::reply::json(&docs))
}

async fn decide_request(request_id: String, state: AppState, body: DecideBody) -> Result<impl Reply, Rejection> {
    let response_message = admission::decide_request(&state.engine, &request_id, body.approve)
        .await
        .map_err(GatewayError::from)
        .map_err(reject)?;

    if body.approve {
        let record = state
            .engine
            .db
            .messages
            .get_received_request(&request_id)
            .await
            .map_err(GatewayError::from)
            .map_err(reject)?;
        let original: NetworkMessage = serde_json::from_value(record.payload.clone())
            .map_err(|e| reject(GatewayError::Message(MessageError::from(e))))?;

        let node = match &original {
            NetworkMessage::AuthRequest { node, .. } | NetworkMessage::AuthInvite { node, .. } => Some(node.clone()),
            _ => None,
        };

        if let Some(node) = node {
            let framed = connection::sign_frame(&state.engine, &record.network_id, &response_message)
                .await
                .map_err(|e| reject(GatewayError::Config(e.to_string())))?;
            let url = format!("{}/service/responses", node.node_url);
            // Best-effort: if the original sender is unreachable, it is
            // expected to fall back to polling `POST /service/requests/<id>`.
            let _ = state
                .engine
                .transport
                .post_message(&url, &framed, &record.network_id, state.engine.kms.as_ref())
                .await;

            let engine = state.engine.clone();
            let connection = state.connection.clone();
            let network_id = record.network_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(2)).await;
                if let Ok(network) = engine.db.networks.get(&network_id).await {
                    let _ = connection.establish(&network_id, &network.instance_id, &node).await;
                }
            });
        }
    }

    Ok(warp::reply::json(&serde_json::json!({
        "status": if body.approve { "accepted" } else { "rejected" },
    })))
}

async fn post_messages(state: AppState, body: SendMessageBody) -> Result<impl Reply, Rejection> {
    let fq_id = format!("{}.{}", crate::message::registry::CORE_PACKAGE, body.message.id);
    let config = state.engine.registry.get(&fq_id).or_else(|_| state.engine.registry.get(&body.message.id));
    let resolved_id = if state.engine.registry.get(&fq_id).is_ok() {
        fq_id.clone()
    } else {
        body.message.id.clone()
    };
    if state.engine.registry.is_response_only(&resolved_id) {
        return Err(reject(GatewayError::Message(MessageError::ConfigurationNotFound(body.message.id))));
    }

    let network = state
        .engine
        .db
        .networks
        .get(&body.network_id)
        .await
        .map_err(GatewayError::from)
        .map_err(reject)?;

    let envelope = NetworkMessage::Custom {
        metadata: crate::message::MessageMetadata::new(&body.network_id, &network.instance_id),
        id: body.message.id.clone(),
        body: body.message.body.clone(),
    };
    let message_id = envelope.metadata().message_id.clone();

    let delivered = if body.broadcast.unwrap_or(false) {
        state.connection.broadcast(&envelope).await
    } else {
        let Some(target) = body.target_node.clone() else {
            return Err(reject(GatewayError::Config("targetNode required when broadcast is false".to_string())));
        };
        match state.connection.send(&body.network_id, &target, envelope).await {
            Ok(()) => 1,
            Err(_) => 0,
        }
    };

    let asynchronous = config.map(|c| c.asynchronous).unwrap_or(false);
    let responses = if asynchronous || delivered == 0 {
        Vec::new()
    } else {
        let responses = state.engine.broker.response_stream(&message_id, delivered).await;
        state.engine.broker.forget_response_key(&message_id);
        responses
    };

    Ok(warp::reply::json(&serde_json::json!({
        "deliveredCount": delivered,
        "responses": responses,
    })))
}

async fn service_challenge(state: AppState) -> Result<impl Reply, Rejection> {
    let entry = state.challenges.issue(state.engine.config.challenge_difficulty);
    Ok(warp::reply::json(&serde_json::json!({
        "nonce": entry.nonce,
        "difficulty": entry.difficulty,
    })))
}

async fn service_networks(state: AppState) -> Result<impl Reply, Rejection> {
    let networks = state
        .engine
        .db
        .networks
        .filter(Some(true), None)
        .await
        .map_err(GatewayError::from)
        .map_err(reject)?;

    let mut summaries = Vec::with_capacity(networks.len());
    for network in networks {
        let central_url = match &network.central_node {
            Some(central) if *central == network.instance_id => Some(state.engine.access_url().to_string()),
            Some(central) => state
                .engine
                .db
                .nodes
                .get(central)
                .await
                .ok()
                .flatten()
                .map(|n| n.node_url),
            None => None,
        };
        summaries.push(NetworkSummary {
            network_id: network.network_id,
            network_name: network.network_name,
            description: network.description,
            central_url,
        });
    }

    Ok(warp::reply::json(&summaries))
}

fn admission_node(message: &NetworkMessage) -> Option<crate::model::Node> {
    match message {
        NetworkMessage::AuthRequest { node, .. } | NetworkMessage::AuthInvite { node, .. } => Some(node.clone()),
        _ => None,
    }
}

async fn service_requests(state: AppState, signature: String, body: bytes::Bytes) -> Result<impl Reply, Rejection> {
    let raw = String::from_utf8(body.to_vec()).map_err(|_| reject(GatewayError::InvalidSignature))?;
    let message: NetworkMessage =
        serde_json::from_str(&raw).map_err(|e| reject(GatewayError::Message(MessageError::from(e))))?;

    let Some(node) = admission_node(&message) else {
        return Err(reject(GatewayError::Admission(AdmissionError::NotPending(
            "not an admission message".to_string(),
        ))));
    };
    let Some(public_key) = &node.public_key else {
        return Err(reject(GatewayError::InvalidSignature));
    };

    let verified = state
        .engine
        .kms
        .verify_signature(&raw, public_key, &signature)
        .await
        .map_err(GatewayError::from)
        .map_err(reject)?;
    if !verified {
        return Err(reject(GatewayError::InvalidSignature));
    }

    let reachable = admission::receive_request(&state.engine, &state.engine.transport, &state.challenges, &message)
        .await
        .map_err(GatewayError::from)
        .map_err(reject)?;

    Ok(warp::reply::json(&serde_json::json!({
        "status": "success",
        "reachable": reachable,
    })))
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct PollBody {
    message_id: String,
    challenge: crate::message::Challenge,
}

async fn service_requests_poll(
    request_id: String,
    state: AppState,
    signature: String,
    body: bytes::Bytes,
) -> Result<impl Reply, Rejection> {
    let raw = String::from_utf8(body.to_vec()).map_err(|_| reject(GatewayError::InvalidSignature))?;
    serde_json::from_str::<PollBody>(&raw).map_err(|e| reject(GatewayError::Message(MessageError::from(e))))?;

    let record = state
        .engine
        .db
        .messages
        .get_received_request(&request_id)
        .await
        .map_err(GatewayError::from)
        .map_err(reject)?;
    let original: NetworkMessage = serde_json::from_value(record.payload.clone())
        .map_err(|e| reject(GatewayError::Message(MessageError::from(e))))?;
    let Some(node) = admission_node(&original) else {
        return Err(reject(GatewayError::InvalidSignature));
    };
    let Some(public_key) = &node.public_key else {
        return Err(reject(GatewayError::InvalidSignature));
    };

    let verified = state
        .engine
        .kms
        .verify_signature(&raw, public_key, &signature)
        .await
        .map_err(GatewayError::from)
        .map_err(reject)?;
    if !verified {
        return Err(reject(GatewayError::InvalidSignature));
    }

    let (status, response) = admission::poll_request(&state.engine, &request_id)
        .await
        .map_err(GatewayError::from)
        .map_err(reject)?;

    Ok(warp::reply::json(&serde_json::json!({
        "status": status,
        "response": response,
    })))
}

/// Signature verification on `/service/responses` is intentionally
/// best-effort: the responder signs with its own node key, which we only
/// learn from the response body itself on first contact. `spec.md` leaves
/// this edge under-specified (see `DESIGN.md`); we correlate against the
/// stored sent-request instead of a pre-known public key.
async fn service_responses(state: AppState, body: bytes::Bytes) -> Result<impl Reply, Rejection> {
    let raw = String::from_utf8(body.to_vec()).map_err(|_| reject(GatewayError::InvalidSignature))?;
    let message: NetworkMessage =
        serde_json::from_str(&raw).map_err(|e| reject(GatewayError::Message(MessageError::from(e))))?;

    admission::receive_response(&state.engine, message)
        .await
        .map_err(GatewayError::from)
        .map_err(reject)?;

    Ok(warp::reply::json(&serde_json::json!({"status": "ok"})))
}

async fn service_message(state: AppState, body: bytes::Bytes) -> Result<impl Reply, Rejection> {
    let raw = String::from_utf8(body.to_vec()).map_err(|_| reject(GatewayError::InvalidSignature))?;
    state
        .connection
        .authenticate_and_dispatch(&raw)
        .await
        .map_err(GatewayError::from)
        .map_err(reject)?;
    Ok(warp::reply::json(&serde_json::json!({"status": "ok"})))
}

/// Inbound WebSocket: symmetric send/receive loop, mirroring the outbound
/// session `connection::ConnectionManager` drives, per `spec.md` §4.7.
async fn handle_websocket(state: AppState, socket: warp::ws::WebSocket) {
    let (mut tx, mut rx) = socket.split();

    let first = match rx.next().await {
        Some(Ok(frame)) if frame.is_text() => frame,
        _ => return,
    };
    let Ok(text) = first.to_str() else { return };
    let Ok(parsed) = serde_json::from_str::<connection::InFrame>(text) else {
        return;
    };
    let NetworkMessage::AuthConnect { metadata } = &parsed.message else {
        return;
    };
    let network_id = metadata.network_id.clone();
    let peer_id = metadata.node_id.clone();

    if state
        .connection
        .verify_and_dispatch(parsed.message.clone(), &parsed.signature)
        .await
        .is_err()
    {
        let _ = tx
            .send(warp::ws::Message::text(
                serde_json::json!({"error": "invalid signature"}).to_string(),
            ))
            .await;
        return;
    }

    state
        .engine
        .routes
        .insert(Route::direct(&network_id, &peer_id, TransportType::Websocket, false));

    loop {
        tokio::select! {
            outbound = tokio::time::timeout(Duration::from_secs(10), state.engine.broker.get(&peer_id)) => {
                match outbound {
                    Ok(Some(message)) => {
                        let Ok(framed) = connection::sign_frame(&state.engine, &message.metadata().network_id, &message).await else {
                            continue;
                        };
                        if tx.send(warp::ws::Message::text(framed)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(_) => {
                        if tx.send(warp::ws::Message::text(r#"{"ping":true}"#)).await.is_err() {
                            break;
                        }
                        match tokio::time::timeout(Duration::from_secs(10), rx.next()).await {
                            Ok(Some(Ok(frame))) if frame.is_text() && frame.to_str().unwrap_or("").contains("pong") => {}
                            _ => break,
                        }
                    }
                }
            }
            inbound = rx.next() => {
                match inbound {
                    Some(Ok(frame)) if frame.is_text() => {
                        let Ok(text) = frame.to_str() else { continue };
                        if let Ok(value) = serde_json::from_str::<serde_json::Value>(text) {
                            if value.get("ping").and_then(|v| v.as_bool()) == Some(true) {
                                let _ = tx.send(warp::ws::Message::text(r#"{"pong":true}"#)).await;
                                continue;
                            }
                            if value.get("pong").is_some() {
                                continue;
                            }
                        }
                        if let Err(e) = state.connection.authenticate_and_dispatch(text).await {
                            let _ = tx
                                .send(warp::ws::Message::text(serde_json::json!({"error": e.to_string()}).to_string()))
                                .await;
                        }
                    }
                    Some(Ok(frame)) if frame.is_close() => break,
                    None | Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    state.engine.routes.remove(&network_id, &peer_id);
    notify_peer_unreachable(&state, &network_id, &peer_id).await;
}

/// Broadcast a `RouteNotification` for a peer whose direct connection just
/// dropped, so any node proxying through us evicts the now-stale hop.
async fn notify_peer_unreachable(state: &AppState, network_id: &str, peer_id: &str) {
    if let Ok(network) = state.engine.db.networks.get(network_id).await {
        state
            .connection
            .notify_route_broken(network_id, &network.instance_id, peer_id)
            .await;
    }
}

/// Inbound SSE: the peer dialed us, so *we* act as the send loop, draining
/// their mailbox and streaming `data:` frames; their traffic to us arrives
/// on the sibling `POST /service/message` endpoint.
async fn service_event(state: AppState, signature: String, body: bytes::Bytes) -> Result<impl Reply, Rejection> {
    let raw = String::from_utf8(body.to_vec()).map_err(|_| reject(GatewayError::InvalidSignature))?;
    let message: NetworkMessage =
        serde_json::from_str(&raw).map_err(|e| reject(GatewayError::Message(MessageError::from(e))))?;
    let NetworkMessage::AuthConnect { metadata } = &message else {
        return Err(reject(GatewayError::InvalidSignature));
    };

    let node = state
        .engine
        .db
        .nodes
        .get(&metadata.node_id)
        .await
        .map_err(GatewayError::from)
        .map_err(reject)?
        .ok_or_else(|| reject(GatewayError::NodeNotApproved(metadata.node_id.clone())))?;
    let Some(public_key) = &node.public_key else {
        return Err(reject(GatewayError::InvalidSignature));
    };

    let verified = state
        .engine
        .kms
        .verify_signature(&raw, public_key, &signature)
        .await
        .map_err(GatewayError::from)
        .map_err(reject)?;
    if !verified {
        return Err(reject(GatewayError::InvalidSignature));
    }

    let network_id = metadata.network_id.clone();
    let peer_id = metadata.node_id.clone();
    state
        .engine
        .routes
        .insert(Route::direct(&network_id, &peer_id, TransportType::Sse, false));

    let engine = state.engine.clone();
    let guard = RouteGuard {
        engine: state.engine.clone(),
        connection: state.connection.clone(),
        network_id: network_id.clone(),
        peer_id: peer_id.clone(),
    };
    let stream = async_stream::stream! {
        let _guard = guard;
        loop {
            match tokio::time::timeout(Duration::from_secs(10), engine.broker.get(&peer_id)).await {
                Ok(Some(outgoing)) => {
                    if let Ok(framed) = connection::sign_frame(&engine, &network_id, &outgoing).await {
                        yield Ok::<_, Infallible>(warp::sse::Event::default().data(framed));
                    }
                }
                Ok(None) | Err(_) => {
                    yield Ok(warp::sse::Event::default().event("ping").data(""));
                }
            }
        }
    };

    Ok(warp::sse::reply(warp::sse::keep_alive().stream(stream)))
}

/// Drops the cached direct route and broadcasts a `RouteNotification` once
/// the peer's SSE send loop stops being polled (client disconnected), since
/// an `async_stream` generator has no "after the loop" point to run cleanup
/// at — only `Drop` fires reliably when the consumer goes away mid-stream.
struct RouteGuard {
    engine: Arc<Engine>,
    connection: Arc<ConnectionManager>,
    network_id: String,
    peer_id: String,
}

impl Drop for RouteGuard {
    fn drop(&mut self) {
        self.engine.routes.remove(&self.network_id, &self.peer_id);
        let engine = self.engine.clone();
        let connection = self.connection.clone();
        let network_id = self.network_id.clone();
        let peer_id = self.peer_id.clone();
        tokio::spawn(async move {
            if let Ok(network) = engine.db.networks.get(&network_id).await {
                connection
                    .notify_route_broken(&network_id, &network.instance_id, &peer_id)
                    .await;
            }
        });
    }
}

/// Bind and serve `routes` on `port`, running until the process is asked
/// to shut down.
pub async fn serve(state: AppState, port: u16) {
    warp::serve(routes(state)).run(([0, 0, 0, 0], port)).await;
}
