//! HTTP error types for the gateway edge.
//!
//! Maps domain errors from `hypertuna-core` into HTTP responses. Every error
//! produces a JSON body `{error: "<slug>", message: "<human text>"}` where
//! the slug comes from a closed vocabulary so clients can localise.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use hypertuna_core::error::{
    EscrowError, MirrorError, RegistryError, SigningError, TokenError, VaultError,
};

/// Application-level error returned from HTTP handlers.
#[derive(Debug)]
pub enum AppError {
    /// Authentication failed (bad token, bad signature).
    Unauthorized(String),
    /// Authenticated but not allowed (admin gate).
    Forbidden(String),
    /// Client sent invalid input.
    BadRequest(String),
    /// Requested resource not found.
    NotFound(String),
    /// Too many requests in the current window.
    RateLimited(String),
    /// State conflict (duplicate lease, already-revoked deposit).
    Conflict(String),
    /// A presented token sequence is older than the stored one.
    SequenceMismatch(String),
    /// Relay exists but has no live peer.
    NoLivePeer(String),
    /// The subsystem is disabled or stopped.
    Inactive(String),
    /// Upstream dependency failed transiently.
    Transient(String),
    /// Internal server error.
    Internal(String),
}

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, slug, message) = match self {
            Self::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg),
            Self::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad-request", msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not-found", msg),
            Self::RateLimited(msg) => (StatusCode::TOO_MANY_REQUESTS, "rate-limited", msg),
            Self::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            Self::SequenceMismatch(msg) => (StatusCode::CONFLICT, "sequence-mismatch", msg),
            Self::NoLivePeer(msg) => (StatusCode::SERVICE_UNAVAILABLE, "no-live-peer", msg),
            Self::Inactive(msg) => (StatusCode::SERVICE_UNAVAILABLE, "inactive", msg),
            Self::Transient(msg) => (StatusCode::BAD_GATEWAY, "transient", msg),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal", msg),
        };

        let body = ErrorBody {
            error: slug,
            message,
        };

        (status, axum::Json(body)).into_response()
    }
}

impl From<SigningError> for AppError {
    fn from(err: SigningError) -> Self {
        match err {
            SigningError::InvalidSignature { .. } | SigningError::Expired { .. } => {
                Self::Unauthorized(err.to_string())
            }
            SigningError::BadEncoding { .. } => Self::BadRequest(err.to_string()),
        }
    }
}

impl From<TokenError> for AppError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::UnknownSubject | TokenError::Unauthorized { .. } => {
                Self::Unauthorized("unauthorized".to_owned())
            }
            TokenError::SequenceMismatch { .. } => Self::SequenceMismatch(err.to_string()),
            TokenError::Corrupt { .. } | TokenError::Storage(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<RegistryError> for AppError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownRelay { .. } => Self::NotFound(err.to_string()),
            RegistryError::NoLivePeer { .. } => Self::NoLivePeer(err.to_string()),
            RegistryError::InvalidProof(_) => Self::Unauthorized(err.to_string()),
            RegistryError::InvalidIdentifier { .. } => Self::BadRequest(err.to_string()),
            RegistryError::Corrupt { .. } | RegistryError::Storage(_) => {
                Self::Internal(err.to_string())
            }
        }
    }
}

impl From<VaultError> for AppError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::NotFound { .. } => Self::NotFound(err.to_string()),
            VaultError::Destroyed => Self::Inactive(err.to_string()),
        }
    }
}

impl From<EscrowError> for AppError {
    fn from(err: EscrowError) -> Self {
        match err {
            EscrowError::Api { status, ref body } => match status {
                401 | 403 => Self::Unauthorized(body.to_string()),
                404 => Self::NotFound(body.to_string()),
                409 => Self::Conflict(body.to_string()),
                429 => Self::RateLimited(body.to_string()),
                _ => Self::Transient(err.to_string()),
            },
            EscrowError::Transport { .. } | EscrowError::DeadlineExceeded { .. } => {
                Self::Transient(err.to_string())
            }
            EscrowError::Decode { .. } | EscrowError::Config { .. } | EscrowError::Sealed(_) => {
                Self::Internal(err.to_string())
            }
        }
    }
}

impl From<MirrorError> for AppError {
    fn from(err: MirrorError) -> Self {
        match err {
            MirrorError::Init { .. } => Self::Inactive(err.to_string()),
            MirrorError::Persist { .. } | MirrorError::Storage(_) => {
                Self::Internal(err.to_string())
            }
        }
    }
}
