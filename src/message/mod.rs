//! The signed-message envelope, its twelve built-in variants, and the
//! catalog registry that resolves custom message ids to their delivery
//! rules (response-only, async, proxy destination).

pub mod registry;

pub use registry::{MessageConfig, MessageRegistry};

use serde::{Deserialize, Serialize};

use crate::model::{AdmissionStatus, Network, Node};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    pub network_id: String,
    pub node_id: String,
    pub message_id: String,
    pub timestamp: f64,
}

impl MessageMetadata {
    pub fn new(network_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            network_id: network_id.into(),
            node_id: node_id.into(),
            message_id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().timestamp() as f64,
        }
    }

    /// Build a reply's metadata, keeping the original `message_id` so the
    /// requester's broker mailbox (keyed by that id) picks it up.
    pub fn reply_to(original: &MessageMetadata, node_id: impl Into<String>) -> Self {
        Self {
            network_id: original.network_id.clone(),
            node_id: node_id.into(),
            message_id: original.message_id.clone(),
            timestamp: chrono::Utc::now().timestamp() as f64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
    pub nonce: String,
    pub solution: u64,
}

/// Tagged envelope: the `messageType` field selects which variant's body
/// fields are present, mirroring the registry dispatch the original
/// `NetworkMessage.from_dict` performed through an inheritance hierarchy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "messageType", rename_all = "camelCase")]
pub enum NetworkMessage {
    AuthRequest {
        metadata: MessageMetadata,
        node: Node,
        challenge: Challenge,
        justification: String,
    },
    AuthInvite {
        metadata: MessageMetadata,
        node: Node,
        network: Network,
        challenge: Challenge,
        justification: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        management_private_key: Option<String>,
    },
    AuthRequestResponse {
        metadata: MessageMetadata,
        status: AdmissionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        network: Option<Network>,
    },
    AuthInviteResponse {
        metadata: MessageMetadata,
        status: AdmissionStatus,
    },
    AuthConnect {
        metadata: MessageMetadata,
    },
    SyncNode {
        metadata: MessageMetadata,
        nodes: Vec<Node>,
    },
    SyncIndex {
        metadata: MessageMetadata,
        data_index: serde_json::Map<String, serde_json::Value>,
    },
    SyncRequest {
        metadata: MessageMetadata,
        target: String,
    },
    RouteRequest {
        metadata: MessageMetadata,
        target_node: String,
    },
    RouteResponse {
        metadata: MessageMetadata,
        route: Vec<String>,
    },
    RouteNotification {
        metadata: MessageMetadata,
        broken_node: String,
    },
    Custom {
        metadata: MessageMetadata,
        id: String,
        body: serde_json::Value,
    },
}

impl NetworkMessage {
    pub fn metadata(&self) -> &MessageMetadata {
        match self {
            NetworkMessage::AuthRequest { metadata, .. }
            | NetworkMessage::AuthInvite { metadata, .. }
            | NetworkMessage::AuthRequestResponse { metadata, .. }
            | NetworkMessage::AuthInviteResponse { metadata, .. }
            | NetworkMessage::AuthConnect { metadata, .. }
            | NetworkMessage::SyncNode { metadata, .. }
            | NetworkMessage::SyncIndex { metadata, .. }
            | NetworkMessage::SyncRequest { metadata, .. }
            | NetworkMessage::RouteRequest { metadata, .. }
            | NetworkMessage::RouteResponse { metadata, .. }
            | NetworkMessage::RouteNotification { metadata, .. }
            | NetworkMessage::Custom { metadata, .. } => metadata,
        }
    }

    /// The fully-qualified registry id this message corresponds to, within
    /// the built-in `link.dedi.core` package (or, for `Custom`, the
    /// caller-supplied id verbatim).
    pub fn type_id(&self) -> String {
        match self {
            NetworkMessage::Custom { id, .. } => id.clone(),
            other => format!("{}.{}", registry::CORE_PACKAGE, other.type_name()),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            NetworkMessage::AuthRequest { .. } => "authRequest",
            NetworkMessage::AuthInvite { .. } => "authInvite",
            NetworkMessage::AuthRequestResponse { .. } => "authRequestResponse",
            NetworkMessage::AuthInviteResponse { .. } => "authInviteResponse",
            NetworkMessage::AuthConnect { .. } => "authConnect",
            NetworkMessage::SyncNode { .. } => "syncNode",
            NetworkMessage::SyncIndex { .. } => "syncIndex",
            NetworkMessage::SyncRequest { .. } => "syncRequest",
            NetworkMessage::RouteRequest { .. } => "routeRequest",
            NetworkMessage::RouteResponse { .. } => "routeResponse",
            NetworkMessage::RouteNotification { .. } => "routeNotification",
            NetworkMessage::Custom { .. } => "custom",
        }
    }

    /// The exact JSON bytes that must be both signed and transmitted;
    /// signing anything else is an invariant violation (see `kms` module
    /// docs).
    pub fn canonical_json(&self) -> Result<String, MessageError> {
        serde_json::to_string(self).map_err(MessageError::from)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum MessageError {
    #[error("error serialising or deserialising message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message configuration not found: {0}")]
    ConfigurationNotFound(String),
    #[error("error parsing message configuration: {0}")]
    ConfigurationParsing(String),
    #[error("invalid signature on incoming message")]
    Signature,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_through_json() {
        let message = NetworkMessage::AuthConnect {
            metadata: MessageMetadata::new("net-1", "node-a"),
        };

        let json = message.canonical_json().unwrap();
        let decoded: NetworkMessage = serde_json::from_str(&json).unwrap();

        assert_eq!(message, decoded);
    }

    #[test]
    fn custom_message_keeps_caller_supplied_id() {
        let message = NetworkMessage::Custom {
            metadata: MessageMetadata::new("net-1", "node-a"),
            id: "com.example.ping".to_string(),
            body: serde_json::json!({"n": 1}),
        };

        assert_eq!(message.type_id(), "com.example.ping");
    }

    #[test]
    fn wire_tag_is_camel_case() {
        let message = NetworkMessage::AuthRequestResponse {
            metadata: MessageMetadata::new("net-1", "node-a"),
            status: AdmissionStatus::Pending,
            network: None,
        };

        let json = message.canonical_json().unwrap();
        assert!(json.contains(r#""messageType":"authRequestResponse""#));
    }

    #[test]
    fn built_in_message_resolves_fully_qualified_id() {
        let message = NetworkMessage::RouteRequest {
            metadata: MessageMetadata::new("net-1", "node-a"),
            target_node: "node-b".to_string(),
        };

        assert_eq!(message.type_id(), "link.dedi.core.routeRequest");
    }
}
