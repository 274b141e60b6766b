//! Network-admission protocol: join/invite handshake with proof-of-work,
//! grounded on `auth_interface.py`'s `send_join_request`/`send_join_invite`
//! and their server-side counterparts.

use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::db::{NetworkMessageRepository, NetworkRepository};
use crate::engine::Engine;
use crate::kms::Kms;
use crate::message::{Challenge, MessageMetadata, NetworkMessage};
use crate::model::{AdmissionRecord, AdmissionStatus, ChallengeEntry, Network, Node};
use crate::pow;
use crate::transport::{Transport, TransportError};

#[derive(thiserror::Error, Debug)]
pub enum AdmissionError {
    #[error("challenge {0} not found or expired")]
    InvalidChallenge(String),
    #[error("proof of work did not satisfy the issued difficulty")]
    ProofOfWorkFailed,
    #[error("target network declares a different central url: {0}")]
    NetworkMismatch(String),
    #[error("network {0} not visible at target")]
    NetworkNotVisible(String),
    #[error("request {0} is not in pending state")]
    NotPending(String),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("persistence error: {0}")]
    Db(#[from] crate::db::DbError),
    #[error("kms error: {0}")]
    Kms(#[from] crate::kms::KmsError),
    #[error("message error: {0}")]
    Message(#[from] crate::message::MessageError),
    #[error("serialisation error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Outward-facing summary returned by `GET /service/networks`: enough for a
/// prospective joiner to identify and validate the network without leaking
/// its full member list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSummary {
    pub network_id: String,
    pub network_name: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub central_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChallengeResponse {
    nonce: String,
    difficulty: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestAck {
    #[allow(dead_code)]
    status: String,
    reachable: bool,
}

/// Outstanding proof-of-work challenges, keyed by nonce, pruned lazily on
/// validation since they expire on their own after 300s.
#[derive(Default)]
pub struct ChallengeCache {
    entries: DashMap<String, ChallengeEntry>,
}

impl ChallengeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&self, difficulty: u32) -> ChallengeEntry {
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let entry = ChallengeEntry {
            nonce: nonce.clone(),
            difficulty,
            issued_at: chrono::Utc::now(),
        };
        self.entries.insert(nonce, entry.clone());
        entry
    }

    pub fn validate_and_consume(&self, nonce: &str, solution: u64) -> Result<(), AdmissionError> {
        let Some((_, entry)) = self.entries.remove(nonce) else {
            return Err(AdmissionError::InvalidChallenge(nonce.to_string()));
        };
        if entry.is_expired_at(chrono::Utc::now()) {
            return Err(AdmissionError::InvalidChallenge(nonce.to_string()));
        }
        if !pow::validate(&entry.nonce, entry.difficulty, solution) {
            return Err(AdmissionError::ProofOfWorkFailed);
        }
        Ok(())
    }
}

async fn fetch_and_validate_target(
    transport: &Transport,
    target_url: &str,
    network_id: &str,
) -> Result<NetworkSummary, AdmissionError> {
    let summaries: Vec<NetworkSummary> = transport
        .get(&format!("{target_url}/service/networks"))
        .await?;
    let summary = summaries
        .into_iter()
        .find(|s| s.network_id == network_id)
        .ok_or_else(|| AdmissionError::NetworkNotVisible(network_id.to_string()))?;

    if let Some(declared) = &summary.central_url {
        if declared != target_url {
            return Err(AdmissionError::NetworkMismatch(declared.clone()));
        }
    }
    Ok(summary)
}

async fn fetch_and_solve_challenge(
    transport: &Transport,
    target_url: &str,
) -> Result<Challenge, AdmissionError> {
    let response: ChallengeResponse = transport.get(&format!("{target_url}/service/challenge")).await?;
    let solution = pow::solve(&response.nonce, response.difficulty)
        .map_err(|_| AdmissionError::ProofOfWorkFailed)?;
    Ok(Challenge {
        nonce: response.nonce,
        solution,
    })
}

/// `send_join_request`: steps 1-5 of `spec.md` §4.8's join-request flow.
pub async fn send_join_request(
    engine: &Engine,
    transport: &Transport,
    target_url: &str,
    network_id: &str,
    justification: &str,
) -> Result<AdmissionRecord, AdmissionError> {
    let summary = fetch_and_validate_target(transport, target_url, network_id).await?;
    let challenge = fetch_and_solve_challenge(transport, target_url).await?;

    let placeholder = Network::placeholder(network_id, &summary.network_name, &summary.description);
    let self_node_id = placeholder.instance_id.clone();
    engine.db.networks.save(placeholder).await?;

    let public_key = engine.kms.generate_network_node_key(network_id).await?;
    let mut self_node = Node::new(self_node_id.clone(), &engine.config.service_name, engine.access_url());
    self_node.node_description = engine.config.service_description.clone();
    self_node.public_key = Some(public_key);

    let metadata = MessageMetadata::new(network_id, &self_node_id);
    let message_id = metadata.message_id.clone();
    let request = NetworkMessage::AuthRequest {
        metadata,
        node: self_node,
        challenge,
        justification: justification.to_string(),
    };
    let body = request.canonical_json()?;
    let signature = engine.kms.sign_payload(&body, network_id).await?;

    let ack: RequestAck = transport
        .post(
            &format!("{target_url}/service/requests"),
            &request,
            vec![("Message-Signature", signature)],
        )
        .await?;

    engine
        .db
        .messages
        .save_sent_request(
            &message_id,
            network_id,
            target_url,
            serde_json::to_value(&request)?,
            !ack.reachable,
        )
        .await?;

    engine.db.messages.get_sent_request(&message_id).await.map_err(Into::into)
}

/// `send_join_invite`: the mirror flow, additionally carrying our network
/// document and management public key (and, for decentralised networks,
/// the management private key too).
pub async fn send_join_invite(
    engine: &Engine,
    transport: &Transport,
    target_url: &str,
    network_id: &str,
    justification: &str,
) -> Result<AdmissionRecord, AdmissionError> {
    let network = engine.db.networks.get(network_id).await?;
    let challenge = fetch_and_solve_challenge(transport, target_url).await?;

    let public_key = engine
        .kms
        .get_network_management_public_key(network_id, false)
        .await?;
    let management_private_key = if network.central_node.is_none() {
        Some(
            engine
                .kms
                .get_network_management_private_key(network_id)
                .await?,
        )
    } else {
        None
    };

    let self_node = Node::new(
        network.instance_id.clone(),
        &engine.config.service_name,
        engine.access_url(),
    );

    let metadata = MessageMetadata::new(network_id, &network.instance_id);
    let message_id = metadata.message_id.clone();
    let invite = NetworkMessage::AuthInvite {
        metadata,
        node: self_node,
        network: network.clone(),
        challenge,
        justification: justification.to_string(),
        management_private_key,
    };
    let body = invite.canonical_json()?;
    let signature = engine.kms.sign_payload(&body, network_id).await?;

    let ack: RequestAck = transport
        .post(
            &format!("{target_url}/service/requests"),
            &invite,
            vec![("Message-Signature", signature)],
        )
        .await?;

    engine
        .db
        .messages
        .save_sent_request(
            &message_id,
            network_id,
            target_url,
            serde_json::to_value(&invite)?,
            !ack.reachable,
        )
        .await?;

    engine.db.messages.get_sent_request(&message_id).await.map_err(Into::into)
}

/// Server-side `POST /service/requests`: verify the embedded challenge
/// solution, persist the record as pending, and probe reachability.
///
/// Signature verification against `node.public_key` (trust-on-first-use) is
/// the HTTP layer's job since it needs the raw header and raw body bytes;
/// this function assumes the caller has already confirmed the signature.
pub async fn receive_request(
    engine: &Engine,
    transport: &Transport,
    challenges: &ChallengeCache,
    message: &NetworkMessage,
) -> Result<bool, AdmissionError> {
    let (metadata, node, challenge) = match message {
        NetworkMessage::AuthRequest {
            metadata,
            node,
            challenge,
            ..
        } => (metadata, node, challenge),
        NetworkMessage::AuthInvite {
            metadata,
            node,
            challenge,
            ..
        } => (metadata, node, challenge),
        _ => return Err(AdmissionError::NotPending("not an admission message".to_string())),
    };

    challenges.validate_and_consume(&challenge.nonce, challenge.solution)?;

    engine
        .db
        .messages
        .save_received_request(&metadata.message_id, &metadata.network_id, serde_json::to_value(message)?)
        .await?;

    Ok(transport.check_connectivity(&node.node_url).await)
}

/// `PATCH /manage/requests/<id>`: flip the stored record to accepted or
/// rejected and, on acceptance, approve the peer locally and build the
/// response envelope the caller should deliver.
pub async fn decide_request(
    engine: &Engine,
    request_id: &str,
    approve: bool,
) -> Result<NetworkMessage, AdmissionError> {
    let record = engine.db.messages.get_received_request(request_id).await?;
    if record.status != AdmissionStatus::Pending {
        return Err(AdmissionError::NotPending(request_id.to_string()));
    }

    let status = if approve {
        AdmissionStatus::Accepted
    } else {
        AdmissionStatus::Rejected
    };
    engine
        .db
        .messages
        .update_request_status(request_id, status)
        .await?;

    let original: NetworkMessage = serde_json::from_value(record.payload)?;
    match original {
        NetworkMessage::AuthRequest { metadata, node, .. } => {
            if approve {
                let mut approved = node.clone();
                approved.approved = true;
                engine.db.networks.add_node(&metadata.network_id, approved).await?;
            }
            Ok(NetworkMessage::AuthRequestResponse {
                metadata: MessageMetadata::reply_to(&metadata, engine_self_node_id(engine, &metadata.network_id).await?),
                status,
                network: if approve {
                    Some(engine.db.networks.get(&metadata.network_id).await?)
                } else {
                    None
                },
            })
        }
        NetworkMessage::AuthInvite { metadata, node, .. } => {
            if approve {
                let mut approved = node.clone();
                approved.approved = true;
                engine.db.networks.add_node(&metadata.network_id, approved).await?;
            }
            Ok(NetworkMessage::AuthInviteResponse {
                metadata: MessageMetadata::reply_to(&metadata, engine_self_node_id(engine, &metadata.network_id).await?),
                status,
            })
        }
        _ => Err(AdmissionError::NotPending(request_id.to_string())),
    }
}

async fn engine_self_node_id(engine: &Engine, network_id: &str) -> Result<String, AdmissionError> {
    Ok(engine.db.networks.get(network_id).await?.instance_id)
}

/// Server-side `POST /service/responses`: correlate with the originally
/// sent request, then fold the outcome into local state.
pub async fn receive_response(engine: &Engine, message: NetworkMessage) -> Result<(), AdmissionError> {
    match message {
        NetworkMessage::AuthRequestResponse { metadata, status, network } => {
            let sent = engine.db.messages.get_sent_request(&metadata.message_id).await?;
            engine
                .db
                .messages
                .update_request_status(&metadata.message_id, status)
                .await?;
            if status == AdmissionStatus::Accepted {
                if let Some(authoritative) = network {
                    let placeholder_id = format!("pending-{}", sent.network_id);
                    engine.db.networks.delete(&placeholder_id).await.ok();
                    engine.db.networks.save(authoritative).await?;
                }
                let target_url = sent.target_url.clone().unwrap_or_default();
                let mut approved = Node::new(metadata.node_id.clone(), "", target_url);
                approved.approved = true;
                engine.db.networks.add_node(&sent.network_id, approved).await?;
            }
            Ok(())
        }
        NetworkMessage::AuthInviteResponse { metadata, status } => {
            let sent = engine.db.messages.get_sent_request(&metadata.message_id).await?;
            engine
                .db
                .messages
                .update_request_status(&metadata.message_id, status)
                .await?;
            if status == AdmissionStatus::Accepted {
                let target_url = sent.target_url.clone().unwrap_or_default();
                let mut approved = Node::new(metadata.node_id.clone(), "", target_url);
                approved.approved = true;
                engine.db.networks.add_node(&sent.network_id, approved).await?;
            }
            Ok(())
        }
        _ => Err(AdmissionError::NotPending("not a response message".to_string())),
    }
}

/// `POST /service/requests/<id>` polling fallback: an unreachable requester
/// re-presents its message id; we report the current status and, once
/// accepted, the generated response envelope.
pub async fn poll_request(engine: &Engine, request_id: &str) -> Result<(AdmissionStatus, Option<NetworkMessage>), AdmissionError> {
    let record = engine.db.messages.get_received_request(request_id).await?;
    if record.status != AdmissionStatus::Accepted {
        return Ok((record.status, None));
    }
    let response = decide_request_noop_response(engine, &record).await?;
    Ok((record.status, response))
}

async fn decide_request_noop_response(
    engine: &Engine,
    record: &AdmissionRecord,
) -> Result<Option<NetworkMessage>, AdmissionError> {
    let original: NetworkMessage = serde_json::from_value(record.payload.clone())?;
    let self_id = engine_self_node_id(engine, &record.network_id).await?;
    match original {
        NetworkMessage::AuthRequest { metadata, .. } => Ok(Some(NetworkMessage::AuthRequestResponse {
            metadata: MessageMetadata::reply_to(&metadata, &self_id),
            status: AdmissionStatus::Accepted,
            network: Some(engine.db.networks.get(&record.network_id).await?),
        })),
        NetworkMessage::AuthInvite { metadata, .. } => Ok(Some(NetworkMessage::AuthInviteResponse {
            metadata: MessageMetadata::reply_to(&metadata, &self_id),
            status: AdmissionStatus::Accepted,
        })),
        _ => Ok(None),
    }
}

pub const POLL_RETRY_INTERVAL: Duration = Duration::from_secs(60);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_cache_rejects_unknown_nonce() {
        let cache = ChallengeCache::new();
        let err = cache.validate_and_consume("nope", 0).unwrap_err();
        assert!(matches!(err, AdmissionError::InvalidChallenge(_)));
    }

    #[test]
    fn challenge_cache_round_trip_accepts_correct_solution() {
        let cache = ChallengeCache::new();
        let entry = cache.issue(1);
        let solution = pow::solve(&entry.nonce, entry.difficulty).unwrap();
        cache.validate_and_consume(&entry.nonce, solution).unwrap();
    }

    #[test]
    fn challenge_cache_is_single_use() {
        let cache = ChallengeCache::new();
        let entry = cache.issue(1);
        let solution = pow::solve(&entry.nonce, entry.difficulty).unwrap();
        cache.validate_and_consume(&entry.nonce, solution).unwrap();

        let err = cache.validate_and_consume(&entry.nonce, solution).unwrap_err();
        assert!(matches!(err, AdmissionError::InvalidChallenge(_)));
    }

    #[test]
    fn challenge_cache_rejects_wrong_solution() {
        let cache = ChallengeCache::new();
        let entry = cache.issue(4);
        let err = cache.validate_and_consume(&entry.nonce, 0).unwrap_err();
        assert!(matches!(err, AdmissionError::ProofOfWorkFailed));
    }
}
