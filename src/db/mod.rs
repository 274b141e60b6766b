//! Persistence: repositories for networks, nodes, admission records, and
//! the mapped-user table, plus a single shared data-index document.
//!
//! `memory` is the only fully implemented driver; `document` is a thin
//! trait-contract stub standing in for the original's `mongo_driver`
//! package, out of scope per `spec.md` §1's "storage/cache/KMS driver
//! back-ends" framing.

pub mod document;
pub mod memory;

pub use memory::MemoryDb;

use async_trait::async_trait;

use crate::model::{AdmissionRecord, AdmissionStatus, Network, Node};

#[derive(thiserror::Error, Debug)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("unsupported database driver: {0}")]
    UnsupportedDriver(String),
}

#[async_trait]
pub trait NetworkRepository: Send + Sync {
    async fn get(&self, network_id: &str) -> Result<Network, DbError>;
    async fn filter(
        &self,
        visible: Option<bool>,
        registered: Option<bool>,
    ) -> Result<Vec<Network>, DbError>;
    async fn save(&self, network: Network) -> Result<(), DbError>;
    async fn delete(&self, network_id: &str) -> Result<(), DbError>;
    async fn update(&self, network: Network) -> Result<(), DbError>;

    /// Save `node` then atomically append its id to the network's
    /// `node_ids`, mirroring `database/memory/network.py::add_node`.
    async fn add_node(&self, network_id: &str, node: Node) -> Result<(), DbError>;
}

#[async_trait]
pub trait NodeRepository: Send + Sync {
    async fn get(&self, node_id: &str) -> Result<Option<Node>, DbError>;
    async fn batch_get(&self, node_ids: &[String]) -> Result<Vec<Node>, DbError>;
    async fn filter(&self, approved: Option<bool>) -> Result<Vec<Node>, DbError>;
    async fn save(&self, node: Node) -> Result<(), DbError>;
    async fn update(&self, node: Node) -> Result<(), DbError>;
    async fn delete(&self, node_id: &str) -> Result<(), DbError>;
}

#[async_trait]
pub trait NetworkMessageRepository: Send + Sync {
    async fn save_sent_request(
        &self,
        message_id: &str,
        network_id: &str,
        target_url: &str,
        payload: serde_json::Value,
        requires_polling: bool,
    ) -> Result<(), DbError>;

    async fn save_received_request(
        &self,
        message_id: &str,
        network_id: &str,
        payload: serde_json::Value,
    ) -> Result<(), DbError>;

    async fn get_requests(
        &self,
        sent: Option<bool>,
        status: Option<AdmissionStatus>,
    ) -> Result<Vec<AdmissionRecord>, DbError>;

    async fn get_received_request(&self, request_id: &str) -> Result<AdmissionRecord, DbError>;
    async fn get_sent_request(&self, request_id: &str) -> Result<AdmissionRecord, DbError>;
    async fn update_request_status(
        &self,
        request_id: &str,
        status: AdmissionStatus,
    ) -> Result<(), DbError>;
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn get(&self, user_id: &str) -> Result<Option<crate::user::User>, DbError>;
    async fn save(&self, user: crate::user::User) -> Result<(), DbError>;
    async fn delete(&self, user_id: &str) -> Result<(), DbError>;
}

/// Single keyed document shared across a network, holding the node's own
/// data index before it is folded into `Node::data_index` on peers.
#[async_trait]
pub trait DataIndexRepository: Send + Sync {
    async fn get(&self, network_id: &str) -> Result<serde_json::Map<String, serde_json::Value>, DbError>;
    async fn save(
        &self,
        network_id: &str,
        index: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), DbError>;
}
