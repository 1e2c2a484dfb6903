use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use dc_crypto::CryptoError;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error")]
    Internal,
}

/// Failures inside a running tree protocol. Each one is fatal to its protocol instance.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A peer's channel closed or a node task died.
    #[error("transport: {0}")]
    Transport(String),

    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),

    #[error("node {node} received unexpected {kind} from node {from}")]
    UnexpectedMessage { node: usize, from: usize, kind: &'static str },

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("add/remove proof rejected: {0}")]
    ProofRejected(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, msg) = match &self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, m.clone()),
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string()),
        };

        (status, Json(ErrorBody { error: msg })).into_response()
    }
}

impl From<CryptoError> for ApiError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::Decode(m) => ApiError::BadRequest(format!("malformed encoding: {m}")),
            other => {
                tracing::error!(error = %other, "crypto failure");
                ApiError::Internal
            }
        }
    }
}

impl From<ProtocolError> for ApiError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Crypto(c) => c.into(),
            ProtocolError::ProofRejected(m) => ApiError::Conflict(format!("proof rejected: {m}")),
            other => {
                tracing::error!(error = %other, "protocol failure");
                ApiError::Internal
            }
        }
    }
}
