//! Route bookkeeping: how this instance reaches any given peer node, and
//! the single shared cache other subsystems consult before opening a new
//! connection.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectivityType {
    Direct,
    Proxied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransportType {
    Websocket,
    Sse,
}

/// How this node currently reaches `node_id`. `proxy_nodes` lists the hop
/// chain closest-first; it is empty for a direct route.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub network_id: String,
    pub node_id: String,
    pub connectivity_type: ConnectivityType,
    pub transport_type: TransportType,
    #[serde(default)]
    pub outbound: bool,
    #[serde(default)]
    pub proxy_nodes: Vec<String>,
}

impl Route {
    pub fn direct(
        network_id: impl Into<String>,
        node_id: impl Into<String>,
        transport_type: TransportType,
        outbound: bool,
    ) -> Self {
        Self {
            network_id: network_id.into(),
            node_id: node_id.into(),
            connectivity_type: ConnectivityType::Direct,
            transport_type,
            outbound,
            proxy_nodes: Vec::new(),
        }
    }

    pub fn proxied(
        network_id: impl Into<String>,
        node_id: impl Into<String>,
        proxy_nodes: Vec<String>,
    ) -> Self {
        Self {
            network_id: network_id.into(),
            node_id: node_id.into(),
            connectivity_type: ConnectivityType::Proxied,
            transport_type: TransportType::Websocket,
            outbound: true,
            proxy_nodes,
        }
    }

    pub fn hop_count(&self) -> usize {
        self.proxy_nodes.len()
    }
}

/// Single source of truth for "how do we currently reach node X". Keyed by
/// `(network_id, node_id)` so the same node id in two networks never
/// collides.
#[derive(Default)]
pub struct RouteCache {
    routes: DashMap<(String, String), Route>,
}

impl RouteCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, network_id: &str, node_id: &str) -> Option<Route> {
        self.routes
            .get(&(network_id.to_string(), node_id.to_string()))
            .map(|r| r.clone())
    }

    pub fn insert(&self, route: Route) {
        self.routes
            .insert((route.network_id.clone(), route.node_id.clone()), route);
    }

    pub fn remove(&self, network_id: &str, node_id: &str) -> Option<Route> {
        self.routes
            .remove(&(network_id.to_string(), node_id.to_string()))
            .map(|(_, r)| r)
    }

    pub fn contains(&self, network_id: &str, node_id: &str) -> bool {
        self.routes
            .contains_key(&(network_id.to_string(), node_id.to_string()))
    }

    /// Routes that proxy through `node_id`, anywhere in the network. Used
    /// when a proxy disappears and every route riding on it needs to be
    /// invalidated.
    pub fn routes_via(&self, network_id: &str, node_id: &str) -> Vec<Route> {
        self.routes
            .iter()
            .filter(|entry| {
                entry.key().0 == network_id && entry.value().proxy_nodes.contains(&node_id.to_string())
            })
            .map(|entry| entry.value().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_get_round_trip() {
        let cache = RouteCache::new();
        cache.insert(Route::direct("net-1", "node-a", TransportType::Websocket, true));

        let route = cache.get("net-1", "node-a").unwrap();
        assert_eq!(route.connectivity_type, ConnectivityType::Direct);
    }

    #[test]
    fn same_node_id_different_networks_do_not_collide() {
        let cache = RouteCache::new();
        cache.insert(Route::direct("net-1", "node-a", TransportType::Websocket, true));
        cache.insert(Route::direct("net-2", "node-a", TransportType::Sse, false));

        assert_eq!(
            cache.get("net-1", "node-a").unwrap().transport_type,
            TransportType::Websocket
        );
        assert_eq!(
            cache.get("net-2", "node-a").unwrap().transport_type,
            TransportType::Sse
        );
    }

    #[test]
    fn routes_via_finds_dependent_proxied_routes() {
        let cache = RouteCache::new();
        cache.insert(Route::proxied("net-1", "node-b", vec!["node-a".to_string()]));
        cache.insert(Route::direct("net-1", "node-a", TransportType::Websocket, true));

        let dependents = cache.routes_via("net-1", "node-a");
        assert_eq!(dependents.len(), 1);
        assert_eq!(dependents[0].node_id, "node-b");
    }
}
