//! Authorization errors.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Why an upgrade request was refused.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No token in the query string or `Authorization` header.
    #[error("missing authorization token")]
    MissingCredential,

    /// `device_` prefix with nothing after it.
    #[error("empty agent id in device token")]
    EmptyAgentId,

    /// The device directory does not know this agent.
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    /// Signature, algorithm or structure of the token is wrong.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// Token `exp` is in the past.
    #[error("token expired")]
    TokenExpired,

    /// Token verified but lacks a usable `checker_id` or `role`.
    #[error("invalid token claims: {0}")]
    InvalidClaims(String),

    /// Token role is not `admin`.
    #[error("only admins can connect with a signed token (role: {0})")]
    NotAdmin(String),
}

impl AuthError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::MissingCredential => "missing_credential",
            AuthError::EmptyAgentId => "empty_agent_id",
            AuthError::UnknownDevice(_) => "unknown_device",
            AuthError::InvalidToken(_) => "invalid_token",
            AuthError::TokenExpired => "token_expired",
            AuthError::InvalidClaims(_) => "invalid_claims",
            AuthError::NotAdmin(_) => "not_admin",
        }
    }
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct AuthErrorResponse {
    /// Human-readable reason.
    pub error: String,
    /// See [`AuthError::code`].
    pub error_code: String,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let body = Json(AuthErrorResponse {
            error: self.to_string(),
            error_code: self.code().to_string(),
        });
        (StatusCode::UNAUTHORIZED, body).into_response()
    }
}
