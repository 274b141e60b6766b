//! Shared data-model entities: [`Network`], [`Node`], admission bookkeeping.
//!
//! These are plain data plus the handful of pure operations (EMA score
//! update, placeholder-id construction) the spec pins down; the
//! repositories that persist them live in [`crate::db`].

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A logical federation of nodes agreeing to exchange messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    pub network_id: String,
    pub network_name: String,
    pub description: String,
    #[serde(default)]
    pub node_ids: Vec<String>,
    pub visible: bool,
    pub registered: bool,
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub central_node: Option<String>,
}

impl Network {
    /// `pending-<network_id>` placeholder created while a join is in
    /// flight, replaced atomically once the remote accepts.
    pub fn placeholder(network_id: &str, network_name: &str, description: &str) -> Self {
        Self {
            network_id: format!("pending-{network_id}"),
            network_name: network_name.to_string(),
            description: description.to_string(),
            node_ids: Vec::new(),
            visible: true,
            registered: false,
            instance_id: Uuid::new_v4().to_string(),
            central_node: None,
        }
    }
}

/// One running gateway instance's identity inside a single network.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub node_id: String,
    pub node_name: String,
    pub node_url: String,
    #[serde(default)]
    pub node_description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub data_index: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub approved: bool,
}

impl Node {
    pub fn new(node_id: impl Into<String>, node_name: impl Into<String>, node_url: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            node_name: node_name.into(),
            node_url: node_url.into(),
            node_description: String::new(),
            public_key: None,
            data_index: serde_json::Map::new(),
            score: 0.0,
            approved: false,
        }
    }

    /// Serialise omitting `publicKey` unless `include_key` is set, matching
    /// the default administrative listing behaviour.
    pub fn to_json(&self, include_key: bool) -> serde_json::Value {
        let mut value = serde_json::to_value(self).expect("Node always serialises");
        if !include_key {
            if let Some(obj) = value.as_object_mut() {
                obj.remove("publicKey");
            }
        }
        value
    }

    /// Exponential Moving Average score update: `weight = ema_factor *
    /// (|new| / (|new| + |old|))`, `score' = weight*new + (1-weight)*old`.
    pub fn update_score(&mut self, new_score: f64, ema_factor: f64) {
        let denom = new_score.abs() + self.score.abs();
        let weight = if denom == 0.0 {
            ema_factor
        } else {
            ema_factor * (new_score.abs() / denom)
        };
        self.score = weight * new_score + (1.0 - weight) * self.score;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionStatus {
    Pending,
    Accepted,
    Rejected,
}

/// A sent or received join/invite, identified by the originating message's
/// `message_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRecord {
    pub message_id: String,
    pub network_id: String,
    pub sent: bool,
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requires_polling: Option<bool>,
    pub status: AdmissionStatus,
}

/// A proof-of-work challenge handed out by `/service/challenge`, valid for
/// 300 seconds from issuance.
#[derive(Debug, Clone)]
pub struct ChallengeEntry {
    pub nonce: String,
    pub difficulty: u32,
    pub issued_at: chrono::DateTime<chrono::Utc>,
}

impl ChallengeEntry {
    pub const VALIDITY_SECONDS: i64 = 300;

    pub fn is_expired_at(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        (now - self.issued_at).num_seconds() >= Self::VALIDITY_SECONDS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_score_matches_formula() {
        let mut node = Node::new("n", "name", "url");
        node.update_score(1.0, 0.3);
        assert!((node.score - 0.3).abs() < 1e-9);

        node.update_score(1.0, 0.3);
        let weight = 0.3 * (1.0 / (1.0 + 0.3));
        let expected = weight * 1.0 + (1.0 - weight) * 0.3;
        assert!((node.score - expected).abs() < 1e-9);
    }

    #[test]
    fn placeholder_network_uses_pending_prefix() {
        let net = Network::placeholder("net-1", "Net One", "desc");
        assert_eq!(net.network_id, "pending-net-1");
    }

    #[test]
    fn node_to_json_omits_key_by_default() {
        let mut node = Node::new("n", "name", "url");
        node.public_key = Some("PEM".to_string());

        let without_key = node.to_json(false);
        assert!(without_key.get("publicKey").is_none());

        let with_key = node.to_json(true);
        assert_eq!(with_key["publicKey"], "PEM");
    }

    #[test]
    fn challenge_expires_after_300_seconds() {
        let entry = ChallengeEntry {
            nonce: "n".to_string(),
            difficulty: 10,
            issued_at: chrono::Utc::now() - chrono::Duration::seconds(301),
        };
        assert!(entry.is_expired_at(chrono::Utc::now()));
    }
}
