//! Periodic node-set and data-index gossip, grounded on `sync_interface.py`.
//! Like [`crate::routing`], this module takes its broadcaster as a
//! parameter rather than depending on [`crate::connection`] directly.

use std::future::Future;
use std::pin::Pin;

use tracing::{debug, warn};

use crate::db::{DbError, NetworkRepository, NodeRepository};
use crate::engine::Engine;
use crate::message::{MessageMetadata, NetworkMessage};
use crate::model::Node;

pub type BroadcastFn<'a> = dyn Fn(NetworkMessage) -> Pin<Box<dyn Future<Output = usize> + Send + 'a>> + Send + Sync + 'a;
pub type SendFn<'a> =
    dyn Fn(NetworkMessage, String) -> Pin<Box<dyn Future<Output = Option<NetworkMessage>> + Send + 'a>> + Send + Sync + 'a;

/// Build the node list this instance gossips: every known member plus
/// ourselves, with `data_index` and `approved` stripped (peers decide their
/// own trust of each node; they don't take ours on faith).
pub async fn known_nodes_for_gossip(engine: &Engine, self_node: &Node) -> Result<Vec<Node>, DbError> {
    let mut nodes = engine.db.nodes.filter(None).await?;
    nodes.push(self_node.clone());
    for node in &mut nodes {
        node.data_index.clear();
        node.approved = false;
    }
    Ok(nodes)
}

/// `sync_known_nodes`: broadcast the stripped node list for `network_id`.
pub async fn sync_known_nodes(
    engine: &Engine,
    self_instance_id: &str,
    self_node: &Node,
    broadcast: &BroadcastFn<'_>,
    network_id: &str,
) -> Result<usize, DbError> {
    let nodes = known_nodes_for_gossip(engine, self_node).await?;
    let message = NetworkMessage::SyncNode {
        metadata: MessageMetadata::new(network_id, self_instance_id),
        nodes,
    };
    Ok(broadcast(message).await)
}

/// On receipt of a `SyncNode` gossip message: reconcile each reported node
/// against our local view.
///
/// - Equal to what we already know -> no-op.
/// - Reported by a third party and differs from our copy -> re-fetch
///   authoritative data directly from the node in question via
///   `SyncRequest{INSTANCE}`, preserving our local `approved` flag.
/// - Reported by itself (its own `node_id` equals the sender) -> overwrite
///   our fields from the gossip, preserving `approved`.
/// - Unknown -> insert as unapproved with an empty data index.
pub async fn on_sync_node(
    engine: &Engine,
    network_id: &str,
    sender_node_id: &str,
    reported: Vec<Node>,
    send: &SendFn<'_>,
) -> Result<(), DbError> {
    for reported_node in reported {
        let existing = engine.db.nodes.get(&reported_node.node_id).await?;

        match existing {
            None => {
                let mut fresh = reported_node;
                fresh.approved = false;
                fresh.data_index.clear();
                engine.db.nodes.save(fresh).await?;
            }
            Some(local) if local == reported_node => {
                // identical, nothing to do
            }
            Some(local) if reported_node.node_id == sender_node_id => {
                let mut merged = reported_node;
                merged.approved = local.approved;
                engine.db.nodes.update(merged).await?;
            }
            Some(local) => {
                debug!(
                    network_id,
                    node_id = %reported_node.node_id,
                    "sync: third-party report differs, re-fetching from source"
                );
                let request = NetworkMessage::SyncRequest {
                    metadata: MessageMetadata::new(network_id, &local.node_id),
                    target: "INSTANCE".to_string(),
                };
                match send(request, reported_node.node_id.clone()).await {
                    Some(NetworkMessage::SyncNode { nodes, .. }) => {
                        if let Some(mut authoritative) =
                            nodes.into_iter().find(|n| n.node_id == reported_node.node_id)
                        {
                            authoritative.approved = local.approved;
                            engine.db.nodes.update(authoritative).await?;
                        }
                    }
                    _ => {
                        warn!(
                            network_id,
                            node_id = %reported_node.node_id,
                            "sync: re-fetch from source failed, keeping local copy"
                        );
                    }
                }
            }
        }
    }
    Ok(())
}

/// `sync_data_index`: broadcast our local data index for `network_id`.
pub async fn sync_data_index(
    engine: &Engine,
    self_instance_id: &str,
    broadcast: &BroadcastFn<'_>,
    network_id: &str,
) -> Result<usize, DbError> {
    let index = engine.db.data_index.get(network_id).await?;
    let message = NetworkMessage::SyncIndex {
        metadata: MessageMetadata::new(network_id, self_instance_id),
        data_index: index,
    };
    Ok(broadcast(message).await)
}

/// On receipt of `SyncIndex`: replace the sender node's `data_index`.
pub async fn on_sync_index(
    engine: &Engine,
    sender_node_id: &str,
    data_index: serde_json::Map<String, serde_json::Value>,
) -> Result<(), DbError> {
    let Some(mut node) = engine.db.nodes.get(sender_node_id).await? else {
        return Ok(());
    };
    node.data_index = data_index;
    engine.db.nodes.update(node).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use clap::Parser;

    fn test_engine() -> Engine {
        Engine::new(Config::parse_from(["test"]))
    }

    #[tokio::test]
    async fn unknown_reported_node_is_inserted_unapproved() {
        let engine = test_engine();
        let reported = Node::new("node-x", "X", "http://x");

        let send: &SendFn = &|_msg, _target| Box::pin(async { None });
        on_sync_node(&engine, "net-1", "node-y", vec![reported], send)
            .await
            .unwrap();

        let stored = engine.db.nodes.get("node-x").await.unwrap().unwrap();
        assert!(!stored.approved);
    }

    #[tokio::test]
    async fn self_reported_node_overwrites_but_preserves_approved() {
        let engine = test_engine();
        let mut local = Node::new("node-x", "Old Name", "http://old");
        local.approved = true;
        engine.db.nodes.save(local).await.unwrap();

        let mut reported = Node::new("node-x", "New Name", "http://new");
        reported.approved = false;

        let send: &SendFn = &|_msg, _target| Box::pin(async { None });
        on_sync_node(&engine, "net-1", "node-x", vec![reported], send)
            .await
            .unwrap();

        let stored = engine.db.nodes.get("node-x").await.unwrap().unwrap();
        assert_eq!(stored.node_name, "New Name");
        assert!(stored.approved);
    }

    #[tokio::test]
    async fn third_party_report_triggers_refetch_and_preserves_approved() {
        let engine = test_engine();
        let mut local = Node::new("node-x", "Old Name", "http://old");
        local.approved = true;
        engine.db.nodes.save(local).await.unwrap();

        let reported = Node::new("node-x", "Stale Name", "http://stale");
        let authoritative = Node::new("node-x", "Authoritative Name", "http://auth");

        let send: &SendFn = &|_msg, _target| {
            let authoritative = Node::new("node-x", "Authoritative Name", "http://auth");
            Box::pin(async move {
                Some(NetworkMessage::SyncNode {
                    metadata: MessageMetadata::new("net-1", "node-z"),
                    nodes: vec![authoritative],
                })
            })
        };
        let _ = authoritative;

        on_sync_node(&engine, "net-1", "node-z", vec![reported], send)
            .await
            .unwrap();

        let stored = engine.db.nodes.get("node-x").await.unwrap().unwrap();
        assert_eq!(stored.node_name, "Authoritative Name");
        assert!(stored.approved);
    }

    #[tokio::test]
    async fn sync_index_replaces_sender_data_index() {
        let engine = test_engine();
        engine.db.nodes.save(Node::new("node-x", "X", "http://x")).await.unwrap();

        let mut index = serde_json::Map::new();
        index.insert("k".to_string(), serde_json::json!(1));
        on_sync_index(&engine, "node-x", index.clone()).await.unwrap();

        let stored = engine.db.nodes.get("node-x").await.unwrap().unwrap();
        assert_eq!(stored.data_index, index);
    }
}
