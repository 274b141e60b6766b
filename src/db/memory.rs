//! In-memory persistence driver, modelled directly on
//! `database/memory/{network,node,network_message,user}.py`. The default
//! and only fully supported driver; state is lost on process exit.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::model::{AdmissionRecord, AdmissionStatus, Network, Node};
use crate::user::User;

use super::{DataIndexRepository, DbError, NetworkMessageRepository, NetworkRepository, NodeRepository, UserRepository};

#[derive(Default)]
pub struct NodeStore {
    nodes: RwLock<HashMap<String, Node>>,
}

#[async_trait]
impl NodeRepository for NodeStore {
    async fn get(&self, node_id: &str) -> Result<Option<Node>, DbError> {
        Ok(self.nodes.read().await.get(node_id).cloned())
    }

    async fn batch_get(&self, node_ids: &[String]) -> Result<Vec<Node>, DbError> {
        let guard = self.nodes.read().await;
        Ok(node_ids.iter().filter_map(|id| guard.get(id).cloned()).collect())
    }

    async fn filter(&self, approved: Option<bool>) -> Result<Vec<Node>, DbError> {
        let guard = self.nodes.read().await;
        Ok(guard
            .values()
            .filter(|n| approved.is_none_or(|a| n.approved == a))
            .cloned()
            .collect())
    }

    async fn save(&self, node: Node) -> Result<(), DbError> {
        self.nodes.write().await.insert(node.node_id.clone(), node);
        Ok(())
    }

    async fn update(&self, node: Node) -> Result<(), DbError> {
        let mut guard = self.nodes.write().await;
        if !guard.contains_key(&node.node_id) {
            return Err(DbError::Conflict(node.node_id));
        }
        guard.insert(node.node_id.clone(), node);
        Ok(())
    }

    async fn delete(&self, node_id: &str) -> Result<(), DbError> {
        self.nodes
            .write()
            .await
            .remove(node_id)
            .map(|_| ())
            .ok_or_else(|| DbError::NotFound(node_id.to_string()))
    }
}

pub struct MemoryNetworkRepository {
    networks: RwLock<HashMap<String, Network>>,
    nodes: std::sync::Arc<NodeStore>,
}

impl MemoryNetworkRepository {
    pub fn new(nodes: std::sync::Arc<NodeStore>) -> Self {
        Self {
            networks: RwLock::new(HashMap::new()),
            nodes,
        }
    }
}

#[async_trait]
impl NetworkRepository for MemoryNetworkRepository {
    async fn get(&self, network_id: &str) -> Result<Network, DbError> {
        self.networks
            .read()
            .await
            .get(network_id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(network_id.to_string()))
    }

    async fn filter(
        &self,
        visible: Option<bool>,
        registered: Option<bool>,
    ) -> Result<Vec<Network>, DbError> {
        let guard = self.networks.read().await;
        Ok(guard
            .values()
            .filter(|n| visible.is_none_or(|v| n.visible == v))
            .filter(|n| registered.is_none_or(|r| n.registered == r))
            .cloned()
            .collect())
    }

    async fn save(&self, network: Network) -> Result<(), DbError> {
        let mut guard = self.networks.write().await;
        if guard.contains_key(&network.network_id) {
            return Err(DbError::AlreadyExists(network.network_id));
        }
        guard.insert(network.network_id.clone(), network);
        Ok(())
    }

    async fn delete(&self, network_id: &str) -> Result<(), DbError> {
        self.networks
            .write()
            .await
            .remove(network_id)
            .map(|_| ())
            .ok_or_else(|| DbError::NotFound(network_id.to_string()))
    }

    async fn update(&self, network: Network) -> Result<(), DbError> {
        let mut guard = self.networks.write().await;
        if !guard.contains_key(&network.network_id) {
            return Err(DbError::Conflict(network.network_id));
        }
        guard.insert(network.network_id.clone(), network);
        Ok(())
    }

    async fn add_node(&self, network_id: &str, node: Node) -> Result<(), DbError> {
        self.nodes.save(node.clone()).await?;

        let mut guard = self.networks.write().await;
        let network = guard
            .get_mut(network_id)
            .ok_or_else(|| DbError::NotFound(network_id.to_string()))?;
        network.node_ids.push(node.node_id);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryNetworkMessageRepository {
    sent: RwLock<HashMap<String, AdmissionRecord>>,
    received: RwLock<HashMap<String, AdmissionRecord>>,
}

#[async_trait]
impl NetworkMessageRepository for MemoryNetworkMessageRepository {
    async fn save_sent_request(
        &self,
        message_id: &str,
        network_id: &str,
        target_url: &str,
        payload: serde_json::Value,
        requires_polling: bool,
    ) -> Result<(), DbError> {
        self.sent.write().await.insert(
            message_id.to_string(),
            AdmissionRecord {
                message_id: message_id.to_string(),
                network_id: network_id.to_string(),
                sent: true,
                payload,
                target_url: Some(target_url.to_string()),
                requires_polling: Some(requires_polling),
                status: AdmissionStatus::Pending,
            },
        );
        Ok(())
    }

    async fn save_received_request(
        &self,
        message_id: &str,
        network_id: &str,
        payload: serde_json::Value,
    ) -> Result<(), DbError> {
        self.received.write().await.insert(
            message_id.to_string(),
            AdmissionRecord {
                message_id: message_id.to_string(),
                network_id: network_id.to_string(),
                sent: false,
                payload,
                target_url: None,
                requires_polling: None,
                status: AdmissionStatus::Pending,
            },
        );
        Ok(())
    }

    async fn get_requests(
        &self,
        sent: Option<bool>,
        status: Option<AdmissionStatus>,
    ) -> Result<Vec<AdmissionRecord>, DbError> {
        let mut docs = Vec::new();

        if sent != Some(true) {
            docs.extend(self.received.read().await.values().cloned());
        }
        if sent != Some(false) {
            docs.extend(self.sent.read().await.values().cloned());
        }

        if let Some(status) = status {
            docs.retain(|d| d.status == status);
        }

        Ok(docs)
    }

    async fn get_received_request(&self, request_id: &str) -> Result<AdmissionRecord, DbError> {
        self.received
            .read()
            .await
            .get(request_id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(request_id.to_string()))
    }

    async fn get_sent_request(&self, request_id: &str) -> Result<AdmissionRecord, DbError> {
        self.sent
            .read()
            .await
            .get(request_id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(request_id.to_string()))
    }

    async fn update_request_status(
        &self,
        request_id: &str,
        status: AdmissionStatus,
    ) -> Result<(), DbError> {
        if let Some(record) = self.received.write().await.get_mut(request_id) {
            record.status = status;
            return Ok(());
        }
        if let Some(record) = self.sent.write().await.get_mut(request_id) {
            record.status = status;
            return Ok(());
        }
        Err(DbError::NotFound(request_id.to_string()))
    }
}

#[derive(Default)]
pub struct MemoryUserRepository {
    users: RwLock<HashMap<String, User>>,
}

#[async_trait]
impl UserRepository for MemoryUserRepository {
    async fn get(&self, user_id: &str) -> Result<Option<User>, DbError> {
        Ok(self.users.read().await.get(user_id).cloned())
    }

    async fn save(&self, user: User) -> Result<(), DbError> {
        self.users.write().await.insert(user.user_id.clone(), user);
        Ok(())
    }

    async fn delete(&self, user_id: &str) -> Result<(), DbError> {
        self.users
            .write()
            .await
            .remove(user_id)
            .map(|_| ())
            .ok_or_else(|| DbError::NotFound(user_id.to_string()))
    }
}

#[derive(Default)]
pub struct MemoryDataIndexRepository {
    indices: RwLock<HashMap<String, serde_json::Map<String, serde_json::Value>>>,
}

#[async_trait]
impl DataIndexRepository for MemoryDataIndexRepository {
    async fn get(&self, network_id: &str) -> Result<serde_json::Map<String, serde_json::Value>, DbError> {
        Ok(self.indices.read().await.get(network_id).cloned().unwrap_or_default())
    }

    async fn save(
        &self,
        network_id: &str,
        index: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), DbError> {
        self.indices.write().await.insert(network_id.to_string(), index);
        Ok(())
    }
}

/// Bundles all memory-backed repositories behind the trait objects the
/// `Engine` holds.
pub struct MemoryDb {
    pub networks: MemoryNetworkRepository,
    pub nodes: std::sync::Arc<NodeStore>,
    pub messages: MemoryNetworkMessageRepository,
    pub users: MemoryUserRepository,
    pub data_index: MemoryDataIndexRepository,
}

impl MemoryDb {
    pub fn new() -> Self {
        let nodes = std::sync::Arc::new(NodeStore::default());
        Self {
            networks: MemoryNetworkRepository::new(nodes.clone()),
            nodes,
            messages: MemoryNetworkMessageRepository::default(),
            users: MemoryUserRepository::default(),
            data_index: MemoryDataIndexRepository::default(),
        }
    }
}

impl Default for MemoryDb {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeRepository for MemoryDb {
    async fn get(&self, node_id: &str) -> Result<Option<Node>, DbError> {
        self.nodes.get(node_id).await
    }
    async fn batch_get(&self, node_ids: &[String]) -> Result<Vec<Node>, DbError> {
        self.nodes.batch_get(node_ids).await
    }
    async fn filter(&self, approved: Option<bool>) -> Result<Vec<Node>, DbError> {
        self.nodes.filter(approved).await
    }
    async fn save(&self, node: Node) -> Result<(), DbError> {
        self.nodes.save(node).await
    }
    async fn update(&self, node: Node) -> Result<(), DbError> {
        self.nodes.update(node).await
    }
    async fn delete(&self, node_id: &str) -> Result<(), DbError> {
        self.nodes.delete(node_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_node_appends_id_and_persists_node() {
        let db = MemoryDb::new();
        db.networks
            .save(Network {
                network_id: "net-1".to_string(),
                network_name: "Net".to_string(),
                description: String::new(),
                node_ids: Vec::new(),
                visible: true,
                registered: true,
                instance_id: "self".to_string(),
                central_node: None,
            })
            .await
            .unwrap();

        db.networks
            .add_node("net-1", Node::new("node-b", "B", "http://b"))
            .await
            .unwrap();

        let network = db.networks.get("net-1").await.unwrap();
        assert_eq!(network.node_ids, vec!["node-b".to_string()]);
        assert!(db.nodes.get("node-b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn save_twice_is_already_exists() {
        let db = MemoryDb::new();
        let network = Network {
            network_id: "net-1".to_string(),
            network_name: "Net".to_string(),
            description: String::new(),
            node_ids: Vec::new(),
            visible: true,
            registered: true,
            instance_id: "self".to_string(),
            central_node: None,
        };
        db.networks.save(network.clone()).await.unwrap();
        let err = db.networks.save(network).await.unwrap_err();
        assert!(matches!(err, DbError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn get_requests_filters_by_status_and_direction() {
        let db = MemoryDb::new();
        db.messages
            .save_sent_request("m1", "net-1", "http://x", serde_json::json!({}), true)
            .await
            .unwrap();
        db.messages
            .save_received_request("m2", "net-1", serde_json::json!({}))
            .await
            .unwrap();
        db.messages
            .update_request_status("m2", AdmissionStatus::Accepted)
            .await
            .unwrap();

        let sent_only = db.messages.get_requests(Some(true), None).await.unwrap();
        assert_eq!(sent_only.len(), 1);

        let accepted_only = db
            .messages
            .get_requests(None, Some(AdmissionStatus::Accepted))
            .await
            .unwrap();
        assert_eq!(accepted_only.len(), 1);
        assert_eq!(accepted_only[0].message_id, "m2");
    }
}
