//! Stub contract for a document-store backend (mirrors the original's
//! `mongo_driver` package). Selecting `DG_DATABASE_DRIVER=document` parses
//! successfully so the connection string shape can be validated ahead of a
//! real driver landing, but every operation fails fast rather than silently
//! behaving like the memory driver.

use async_trait::async_trait;

use super::{DbError, NetworkRepository, NodeRepository};
use crate::model::{Network, Node};

pub struct DocumentDb {
    pub host: String,
    pub port: u16,
    pub database_name: String,
}

impl DocumentDb {
    pub fn new(host: impl Into<String>, port: u16, database_name: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            database_name: database_name.into(),
        }
    }

    fn unavailable() -> DbError {
        DbError::UnsupportedDriver("document".to_string())
    }
}

#[async_trait]
impl NetworkRepository for DocumentDb {
    async fn get(&self, _network_id: &str) -> Result<Network, DbError> {
        Err(Self::unavailable())
    }

    async fn filter(&self, _visible: Option<bool>, _registered: Option<bool>) -> Result<Vec<Network>, DbError> {
        Err(Self::unavailable())
    }

    async fn save(&self, _network: Network) -> Result<(), DbError> {
        Err(Self::unavailable())
    }

    async fn delete(&self, _network_id: &str) -> Result<(), DbError> {
        Err(Self::unavailable())
    }

    async fn update(&self, _network: Network) -> Result<(), DbError> {
        Err(Self::unavailable())
    }

    async fn add_node(&self, _network_id: &str, _node: Node) -> Result<(), DbError> {
        Err(Self::unavailable())
    }
}

#[async_trait]
impl NodeRepository for DocumentDb {
    async fn get(&self, _node_id: &str) -> Result<Option<Node>, DbError> {
        Err(Self::unavailable())
    }

    async fn batch_get(&self, _node_ids: &[String]) -> Result<Vec<Node>, DbError> {
        Err(Self::unavailable())
    }

    async fn filter(&self, _approved: Option<bool>) -> Result<Vec<Node>, DbError> {
        Err(Self::unavailable())
    }

    async fn save(&self, _node: Node) -> Result<(), DbError> {
        Err(Self::unavailable())
    }

    async fn update(&self, _node: Node) -> Result<(), DbError> {
        Err(Self::unavailable())
    }

    async fn delete(&self, _node_id: &str) -> Result<(), DbError> {
        Err(Self::unavailable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_operation_reports_unavailable() {
        let db = DocumentDb::new("localhost", 27017, "dedi-gateway");
        assert!(matches!(
            NetworkRepository::get(&db, "net-1").await,
            Err(DbError::UnsupportedDriver(_))
        ));
        assert!(matches!(
            NodeRepository::get(&db, "node-1").await,
            Err(DbError::UnsupportedDriver(_))
        ));
    }
}
