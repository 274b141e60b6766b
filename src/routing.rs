//! Multi-hop route discovery, grounded on `route_interface.py`: broadcast a
//! `RouteRequest`, let every reachable peer answer with whatever chain it
//! would use to reach the target, and keep the shortest non-empty one.
//!
//! This module never imports [`crate::connection`] directly — the
//! broadcaster is passed in as a closure, breaking the cyclic dependency
//! `spec.md` §9 calls out between the connection manager and the routing/
//! sync interfaces.

use std::future::Future;
use std::pin::Pin;

use crate::db::NodeRepository;
use crate::engine::Engine;
use crate::message::{MessageMetadata, NetworkMessage};
use crate::route::{ConnectivityType, Route, TransportType};

pub type BroadcastFn<'a> = dyn Fn(NetworkMessage) -> Pin<Box<dyn Future<Output = usize> + Send + 'a>> + Send + Sync + 'a;

async fn approved_peer_count(engine: &Engine) -> usize {
    engine
        .db
        .nodes
        .filter(Some(true))
        .await
        .map(|nodes| nodes.len())
        .unwrap_or(0)
}

/// `request_route`: if a route is already cached, succeed trivially.
/// Otherwise broadcast `RouteRequest`, collect responses, and save the
/// shortest non-empty chain as a proxy route.
pub async fn request_route(
    engine: &Engine,
    self_instance_id: &str,
    broadcast: &BroadcastFn<'_>,
    network_id: &str,
    target_node: &str,
) -> bool {
    if engine.routes.contains(network_id, target_node) {
        return true;
    }

    let metadata = MessageMetadata::new(network_id, self_instance_id);
    let message_id = metadata.message_id.clone();
    let request = NetworkMessage::RouteRequest {
        metadata,
        target_node: target_node.to_string(),
    };

    let expected = approved_peer_count(engine).await.max(1);
    broadcast(request).await;

    let responses = engine.broker.response_stream(&message_id, expected).await;
    engine.broker.forget_response_key(&message_id);

    let best = responses
        .into_iter()
        .filter_map(|envelope| match envelope {
            NetworkMessage::RouteResponse { metadata, route } if !route.is_empty() => {
                Some((metadata.node_id, route))
            }
            _ => None,
        })
        .min_by_key(|(_, route)| route.len());

    let Some((first_hop, chain)) = best else {
        return false;
    };

    engine.routes.insert(Route {
        network_id: network_id.to_string(),
        node_id: target_node.to_string(),
        connectivity_type: ConnectivityType::Proxied,
        transport_type: first_hop_transport(engine, network_id, &first_hop),
        outbound: first_hop_outbound(engine, network_id, &first_hop),
        proxy_nodes: chain,
    });

    true
}

fn first_hop_transport(engine: &Engine, network_id: &str, first_hop: &str) -> TransportType {
    engine
        .routes
        .get(network_id, first_hop)
        .map(|r| r.transport_type)
        .unwrap_or(TransportType::Websocket)
}

fn first_hop_outbound(engine: &Engine, network_id: &str, first_hop: &str) -> bool {
    engine
        .routes
        .get(network_id, first_hop)
        .map(|r| r.outbound)
        .unwrap_or(true)
}

/// Respond to an incoming `RouteRequest`: if we have a direct route to the
/// target, answer `route=[self]`; if we have a proxy route, prepend
/// ourselves to the existing chain; otherwise answer with an empty route.
pub fn build_route_response(
    engine: &Engine,
    network_id: &str,
    self_instance_id: &str,
    target_node: &str,
) -> Vec<String> {
    match engine.routes.get(network_id, target_node) {
        Some(route) if route.connectivity_type == ConnectivityType::Direct => {
            vec![self_instance_id.to_string()]
        }
        Some(route) if route.connectivity_type == ConnectivityType::Proxied => {
            let mut chain = vec![self_instance_id.to_string()];
            chain.extend(route.proxy_nodes);
            chain
        }
        _ => Vec::new(),
    }
}

/// Build the `RouteNotification` broadcast for a peer that just became
/// unreachable.
pub fn build_route_notification(network_id: &str, self_instance_id: &str, broken_node: &str) -> NetworkMessage {
    NetworkMessage::RouteNotification {
        metadata: MessageMetadata::new(network_id, self_instance_id),
        broken_node: broken_node.to_string(),
    }
}

/// On receipt of `RouteNotification`: evict the cached route to
/// `broken_node` only if it is currently a *proxy* route (a direct route
/// failing is this node's own problem to detect, not something a third
/// party gets to override).
pub fn on_route_notification(engine: &Engine, network_id: &str, broken_node: &str) {
    if let Some(route) = engine.routes.get(network_id, broken_node) {
        if route.connectivity_type == ConnectivityType::Proxied {
            engine.routes.remove(network_id, broken_node);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use clap::Parser;

    fn test_engine() -> Engine {
        Engine::new(Config::parse_from(["test"]))
    }

    #[test]
    fn route_response_for_direct_route_is_self_only() {
        let engine = test_engine();
        engine
            .routes
            .insert(Route::direct("net-1", "target", TransportType::Websocket, true));

        let response = build_route_response(&engine, "net-1", "self-id", "target");
        assert_eq!(response, vec!["self-id".to_string()]);
    }

    #[test]
    fn route_response_for_proxy_route_prepends_self() {
        let engine = test_engine();
        engine
            .routes
            .insert(Route::proxied("net-1", "target", vec!["hop-a".to_string()]));

        let response = build_route_response(&engine, "net-1", "self-id", "target");
        assert_eq!(response, vec!["self-id".to_string(), "hop-a".to_string()]);
    }

    #[test]
    fn route_response_for_unknown_target_is_empty() {
        let engine = test_engine();
        let response = build_route_response(&engine, "net-1", "self-id", "nobody");
        assert!(response.is_empty());
    }

    #[test]
    fn route_notification_evicts_only_proxy_routes() {
        let engine = test_engine();
        engine
            .routes
            .insert(Route::direct("net-1", "c", TransportType::Websocket, true));
        on_route_notification(&engine, "net-1", "c");
        assert!(engine.routes.contains("net-1", "c"));

        engine
            .routes
            .insert(Route::proxied("net-1", "c", vec!["b".to_string()]));
        on_route_notification(&engine, "net-1", "c");
        assert!(!engine.routes.contains("net-1", "c"));
    }

    #[tokio::test]
    async fn request_route_returns_true_when_already_cached() {
        let engine = test_engine();
        engine
            .routes
            .insert(Route::direct("net-1", "target", TransportType::Websocket, true));

        let broadcast: &BroadcastFn = &|_msg| Box::pin(async { 0 });
        assert!(request_route(&engine, "self", broadcast, "net-1", "target").await);
    }

}
