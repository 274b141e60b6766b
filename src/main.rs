//! Binary entry point: load configuration, build the [`Engine`], wire the
//! connection manager's post-authentication dispatch handler (breaking the
//! cyclic dependency [`dedi_gateway::connection`] documents), and serve the
//! HTTP/WS surface alongside the periodic gossip and reconnection loops.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use dedi_gateway::admission::{self, ChallengeCache};
use dedi_gateway::config::Config;
use dedi_gateway::connection::{ConnectionManager, MessageHandler};
use dedi_gateway::db::{DataIndexRepository, NetworkRepository, NodeRepository};
use dedi_gateway::engine::Engine;
use dedi_gateway::http::{self, AppState};
use dedi_gateway::message::{MessageMetadata, NetworkMessage};
use dedi_gateway::model::Node;
use dedi_gateway::{routing, sync};

/// How often this instance broadcasts its known-node set and data index to
/// every approved peer in each registered network.
const GOSSIP_INTERVAL: Duration = Duration::from_secs(300);
/// How often a disconnected approved peer is retried.
const RECONNECT_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    let config = Config::parse();
    if let Err(e) = config.validate() {
        eprintln!("configuration error: {e}");
        std::process::exit(1);
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(config.logging_level.clone()))
        .json()
        .init();

    let engine = Arc::new(Engine::new(config));

    // `ConnectionManager` needs a handler at construction time, and the
    // handler needs a `ConnectionManager` to send replies through. Break the
    // cycle with a cell the handler reads from lazily, filled in immediately
    // after the manager itself is built.
    let connection_cell: Arc<OnceCell<Arc<ConnectionManager>>> = Arc::new(OnceCell::new());
    let handler = build_handler(engine.clone(), connection_cell.clone());
    let connection = Arc::new(ConnectionManager::new(engine.clone(), handler));
    connection_cell
        .set(connection.clone())
        .unwrap_or_else(|_| unreachable!("set exactly once, immediately after construction"));

    let state = AppState {
        engine: engine.clone(),
        connection: connection.clone(),
        challenges: Arc::new(ChallengeCache::new()),
    };

    tokio::spawn(gossip_loop(engine.clone(), connection.clone()));
    tokio::spawn(reconnect_loop(engine.clone(), connection.clone()));

    info!(
        port = engine.config.port,
        access_url = %engine.access_url(),
        "starting dedi-gateway"
    );

    tokio::select! {
        _ = http::serve(state, engine.config.port) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }
}

/// Build the `MessageHandler` callback `ConnectionManager` invokes once an
/// inbound envelope has been authenticated.
fn build_handler(
    engine: Arc<Engine>,
    connection_cell: Arc<OnceCell<Arc<ConnectionManager>>>,
) -> Arc<MessageHandler> {
    Arc::new(move |message: NetworkMessage| {
        let engine = engine.clone();
        let connection_cell = connection_cell.clone();
        Box::pin(async move {
            dispatch_message(engine, connection_cell, message).await;
        })
    })
}

/// Route one authenticated inbound message to whichever interface module
/// owns its semantics, first checking whether it is a correlated reply
/// someone is already awaiting via the broker.
async fn dispatch_message(
    engine: Arc<Engine>,
    connection_cell: Arc<OnceCell<Arc<ConnectionManager>>>,
    message: NetworkMessage,
) {
    let message_id = message.metadata().message_id.clone();
    if engine.broker.is_pending(&message_id) {
        engine.broker.add_response(message);
        return;
    }

    let Some(connection) = connection_cell.get().cloned() else {
        warn!("dispatch invoked before the connection manager was initialised");
        return;
    };

    let result: Result<(), String> = match message {
        NetworkMessage::AuthConnect { .. } => Ok(()),
        NetworkMessage::AuthRequest { .. } | NetworkMessage::AuthInvite { .. } => {
            // Admission handshakes travel over `/service/requests`, never
            // over an established connection; nothing to do here.
            Ok(())
        }
        NetworkMessage::AuthRequestResponse { .. } | NetworkMessage::AuthInviteResponse { .. } => {
            admission::receive_response(&engine, message)
                .await
                .map_err(|e| e.to_string())
        }
        NetworkMessage::SyncNode { metadata, nodes } => {
            let sender_node_id = metadata.node_id.clone();
            let engine_for_send = engine.clone();
            let connection_for_send = connection.clone();
            let send: &sync::SendFn = &move |request, target| {
                Box::pin(point_to_point(
                    engine_for_send.clone(),
                    connection_for_send.clone(),
                    request,
                    target,
                ))
            };
            sync::on_sync_node(&engine, &metadata.network_id, &sender_node_id, nodes, send)
                .await
                .map_err(|e| e.to_string())
        }
        NetworkMessage::SyncIndex { metadata, data_index } => sync::on_sync_index(&engine, &metadata.node_id, data_index)
            .await
            .map_err(|e| e.to_string()),
        NetworkMessage::SyncRequest { metadata, target } => {
            handle_sync_request(&engine, &connection, metadata, target).await
        }
        NetworkMessage::RouteRequest { metadata, target_node } => {
            handle_route_request(&engine, &connection, metadata, target_node).await
        }
        NetworkMessage::RouteResponse { .. } => {
            // Only meaningful to whoever is awaiting it by message id, which
            // the `is_pending` check above already handles; a `RouteResponse`
            // reaching here is stale (its waiter already gave up).
            Ok(())
        }
        NetworkMessage::RouteNotification { metadata, broken_node } => {
            routing::on_route_notification(&engine, &metadata.network_id, &broken_node);
            Ok(())
        }
        NetworkMessage::Custom { metadata, id, body } => {
            handle_custom_message(&engine, &connection, metadata, id, body).await
        }
    };

    if let Err(e) = result {
        warn!(error = %e, "message dispatch failed");
    }
}

/// Send `request` to `target` and wait for its one correlated reply,
/// matching [`sync::SendFn`]'s signature so a `sync::on_sync_node` re-fetch
/// can drive an actual round trip through the connection manager.
async fn point_to_point(
    engine: Arc<Engine>,
    connection: Arc<ConnectionManager>,
    request: NetworkMessage,
    target: String,
) -> Option<NetworkMessage> {
    let metadata = request.metadata().clone();
    if connection.send(&metadata.network_id, &target, request).await.is_err() {
        return None;
    }
    let mut responses = engine.broker.response_stream(&metadata.message_id, 1).await;
    engine.broker.forget_response_key(&metadata.message_id);
    responses.pop()
}

/// Answer a `SyncRequest{target}` with our current node set or data index.
async fn handle_sync_request(
    engine: &Arc<Engine>,
    connection: &Arc<ConnectionManager>,
    metadata: MessageMetadata,
    target: String,
) -> Result<(), String> {
    let network = engine.db.networks.get(&metadata.network_id).await.map_err(|e| e.to_string())?;
    let requester = metadata.node_id.clone();

    let reply = match target.as_str() {
        "INSTANCE" => {
            let self_node = Node::new(
                network.instance_id.clone(),
                &engine.config.service_name,
                engine.access_url(),
            );
            let nodes = sync::known_nodes_for_gossip(engine, &self_node).await.map_err(|e| e.to_string())?;
            NetworkMessage::SyncNode {
                metadata: MessageMetadata::reply_to(&metadata, network.instance_id.clone()),
                nodes,
            }
        }
        "INDEX" => {
            let data_index = engine
                .db
                .data_index
                .get(&metadata.network_id)
                .await
                .map_err(|e| e.to_string())?;
            NetworkMessage::SyncIndex {
                metadata: MessageMetadata::reply_to(&metadata, network.instance_id.clone()),
                data_index,
            }
        }
        other => return Err(format!("unrecognised sync target: {other}")),
    };

    connection
        .send(&metadata.network_id, &requester, reply)
        .await
        .map_err(|e| e.to_string())
}

/// Forward a `Custom` message to its registered local sink, if any, and
/// (for a non-async message with a configured `response`) reply to the
/// sender with the sink's result, matching `network_interface.py`'s
/// `process_network_message` proxy-destination handling (`spec.md` §4.5).
/// An id with no registry entry is an uncorrelated message this crate
/// doesn't know about and is simply logged.
async fn handle_custom_message(
    engine: &Arc<Engine>,
    connection: &Arc<ConnectionManager>,
    metadata: MessageMetadata,
    id: String,
    body: serde_json::Value,
) -> Result<(), String> {
    let config = match engine.registry.get(&id) {
        Ok(config) => config.clone(),
        Err(_) => {
            tracing::debug!(id, "uncorrelated custom message, no registry entry");
            return Ok(());
        }
    };

    let mut result_body = body.clone();
    if let Some(destination) = &config.destination {
        result_body = engine
            .transport
            .post::<serde_json::Value, serde_json::Value>(destination, &body, Vec::new())
            .await
            .map_err(|e| e.to_string())?;
    }

    if config.asynchronous {
        return Ok(());
    }
    let Some(response_id) = &config.response else {
        return Ok(());
    };

    let network = engine.db.networks.get(&metadata.network_id).await.map_err(|e| e.to_string())?;
    let reply = NetworkMessage::Custom {
        metadata: MessageMetadata::reply_to(&metadata, network.instance_id.clone()),
        id: response_id.clone(),
        body: result_body,
    };

    connection
        .send(&metadata.network_id, &metadata.node_id, reply)
        .await
        .map_err(|e| e.to_string())
}

/// Answer a `RouteRequest` with whatever chain (possibly empty) currently
/// reaches `target_node` from here.
async fn handle_route_request(
    engine: &Arc<Engine>,
    connection: &Arc<ConnectionManager>,
    metadata: MessageMetadata,
    target_node: String,
) -> Result<(), String> {
    let network = engine.db.networks.get(&metadata.network_id).await.map_err(|e| e.to_string())?;
    let route = routing::build_route_response(engine, &metadata.network_id, &network.instance_id, &target_node);
    let reply = NetworkMessage::RouteResponse {
        metadata: MessageMetadata::reply_to(&metadata, network.instance_id.clone()),
        route,
    };

    connection
        .send(&metadata.network_id, &metadata.node_id, reply)
        .await
        .map_err(|e| e.to_string())
}

/// Periodically broadcast this instance's known-node set and data index to
/// every approved peer in every registered network, per `sync_interface.py`'s
/// scheduled gossip.
async fn gossip_loop(engine: Arc<Engine>, connection: Arc<ConnectionManager>) {
    let mut ticker = tokio::time::interval(GOSSIP_INTERVAL);
    ticker.tick().await; // first tick fires immediately; skip it, nothing to gossip yet

    loop {
        ticker.tick().await;

        let networks = match engine.db.networks.filter(None, Some(true)).await {
            Ok(networks) => networks,
            Err(e) => {
                warn!(error = %e, "gossip: failed to list registered networks");
                continue;
            }
        };

        for network in networks {
            let self_node = Node::new(
                network.instance_id.clone(),
                &engine.config.service_name,
                engine.access_url(),
            );
            let connection_for_broadcast = connection.clone();
            let broadcast: &sync::BroadcastFn = &move |message| {
                let connection = connection_for_broadcast.clone();
                Box::pin(async move { connection.broadcast(&message).await })
            };

            if let Err(e) =
                sync::sync_known_nodes(&engine, &network.instance_id, &self_node, broadcast, &network.network_id).await
            {
                warn!(network_id = %network.network_id, error = %e, "gossip: sync_known_nodes failed");
            }
            if let Err(e) = sync::sync_data_index(&engine, &network.instance_id, broadcast, &network.network_id).await {
                warn!(network_id = %network.network_id, error = %e, "gossip: sync_data_index failed");
            }
        }
    }
}

/// Periodically retry establishing a connection to every approved peer this
/// instance doesn't currently have a cached route to, and tell the network
/// about any peer that still can't be reached.
async fn reconnect_loop(engine: Arc<Engine>, connection: Arc<ConnectionManager>) {
    let mut ticker = tokio::time::interval(RECONNECT_INTERVAL);

    loop {
        ticker.tick().await;

        let networks = match engine.db.networks.filter(None, Some(true)).await {
            Ok(networks) => networks,
            Err(e) => {
                warn!(error = %e, "reconnect: failed to list registered networks");
                continue;
            }
        };

        for network in networks {
            let peers = match engine.db.nodes.filter(Some(true)).await {
                Ok(peers) => peers,
                Err(e) => {
                    warn!(network_id = %network.network_id, error = %e, "reconnect: failed to list approved nodes");
                    continue;
                }
            };

            for peer in peers {
                if peer.node_id == network.instance_id {
                    continue;
                }
                if engine.routes.contains(&network.network_id, &peer.node_id) {
                    continue;
                }

                let engine = engine.clone();
                let connection = connection.clone();
                let network_id = network.network_id.clone();
                let self_instance_id = network.instance_id.clone();
                tokio::spawn(async move {
                    if let Err(e) = connection.establish(&network_id, &self_instance_id, &peer).await {
                        warn!(node_id = %peer.node_id, error = %e, "reconnect attempt failed");
                        connection
                            .notify_route_broken(&network_id, &self_instance_id, &peer.node_id)
                            .await;
                    }
                    let _ = &engine;
                });
            }
        }
    }
}
