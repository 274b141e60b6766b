//! Unified error taxonomy for the gateway.
//!
//! Each subsystem defines its own `thiserror` enum (see `kms`, `db`,
//! `broker`, `transport`, `admission`); this module collapses all of them
//! into [`GatewayError`], the type the HTTP surface actually serialises.

use thiserror::Error;
use warp::http::StatusCode;
use warp::Reply;

use crate::admission::AdmissionError;
use crate::broker::BrokerError;
use crate::db::DbError;
use crate::kms::KmsError;
use crate::message::MessageError;
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error(transparent)]
    Kms(#[from] KmsError),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error(transparent)]
    Message(#[from] MessageError),

    #[error("node {0} is not approved in this network")]
    NodeNotApproved(String),
    #[error("node {0} is not connected")]
    NodeNotConnected(String),
    #[error("invalid signature on incoming message")]
    InvalidSignature,
    #[error("configuration error: {0}")]
    Config(String),
    #[error("central node must equal this network's instance id")]
    InvalidCentralNode,
}

impl GatewayError {
    /// The status code the original service would reply with for this
    /// error, per `spec.md` §7.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Kms(KmsError::NotFound(_)) => StatusCode::NOT_FOUND,
            GatewayError::Kms(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Db(DbError::NotFound(_)) => StatusCode::NOT_FOUND,
            GatewayError::Db(DbError::AlreadyExists(_)) => StatusCode::CONFLICT,
            GatewayError::Db(DbError::Conflict(_)) => StatusCode::CONFLICT,
            GatewayError::Db(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Broker(BrokerError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Transport(TransportError::RequestFailed(status)) => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            GatewayError::Transport(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Admission(AdmissionError::InvalidChallenge(_)) => StatusCode::FORBIDDEN,
            GatewayError::Admission(AdmissionError::NetworkMismatch(_)) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::Admission(_) => StatusCode::BAD_REQUEST,
            GatewayError::Message(_) => StatusCode::BAD_REQUEST,
            GatewayError::NodeNotApproved(_) => StatusCode::FORBIDDEN,
            GatewayError::NodeNotConnected(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::InvalidSignature => StatusCode::BAD_REQUEST,
            GatewayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::InvalidCentralNode => StatusCode::BAD_REQUEST,
        }
    }

    /// WebSocket close code, per `spec.md` §7 (`4000 + status`, pong
    /// timeout uses 4408, internal errors use 4500).
    pub fn ws_close_code(&self) -> u16 {
        4000 + self.status_code().as_u16()
    }
}

impl warp::reject::Reject for GatewayError {}

#[derive(serde::Serialize)]
struct ErrorBody {
    error: String,
}

/// Turn a rejected request (one that carried a [`GatewayError`]) into the
/// `{"error": ...}` JSON body the service contract promises.
pub async fn handle_rejection(
    err: warp::Rejection,
) -> Result<impl warp::Reply, std::convert::Infallible> {
    let (status, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "not found".to_string())
    } else if let Some(e) = err.find::<GatewayError>() {
        (e.status_code(), e.to_string())
    } else if err.find::<warp::filters::body::BodyDeserializeError>().is_some() {
        (StatusCode::BAD_REQUEST, "malformed request body".to_string())
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal error".to_string(),
        )
    };

    let mut response = warp::reply::with_status(warp::reply::json(&ErrorBody { error: message }), status)
        .into_response();

    if status == StatusCode::UNAUTHORIZED {
        response.headers_mut().insert(
            warp::http::header::WWW_AUTHENTICATE,
            warp::http::HeaderValue::from_static("Signature realm=\"dedi-link\""),
        );
    }

    Ok(response)
}
