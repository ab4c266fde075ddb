//! Connection authorization gate.
//!
//! Classifies the credential presented on an upgrade request:
//!
//! - `device_<agentID>` is an agent, placed on `agent::<agentID>`
//! - anything else must be an HMAC-signed JWT whose `role` claim is
//!   `admin`; the numeric `checker_id` claim becomes the client id and the
//!   session lands on `admin::dashboard`
//!
//! Classification has no side effects. [`AuthGate::authorize`] additionally
//! asks the [`DeviceDirectory`] whether a device is registered.

use std::sync::Arc;

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use classos_core::{ADMIN_DASHBOARD, Role, agent_channel};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;
use tracing::{debug, warn};

use super::directory::{DeviceDirectory, OpenDirectory};
use super::error::AuthError;

/// Prefix that marks an agent device token.
pub const DEVICE_TOKEN_PREFIX: &str = "device_";

/// Who a connection belongs to and where it lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Admin checker id as a string, or the agent id.
    pub client_id: String,
    /// Admin or agent.
    pub role: Role,
    /// Channel the session registers under.
    pub channel: String,
}

#[derive(Debug, Deserialize)]
struct AdminClaims {
    checker_id: serde_json::Number,
    role: String,
}

/// Verifies credentials against the process-wide signing key.
pub struct AuthGate {
    decoding_key: DecodingKey,
    validation: Validation,
    directory: Arc<dyn DeviceDirectory>,
}

impl AuthGate {
    /// Gate verifying admin tokens with `secret`, accepting every device.
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.algorithms = vec![Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];
        validation.validate_exp = true;
        validation.validate_nbf = false;
        // exp is checked when present; tokens without one are accepted
        validation.required_spec_claims.clear();

        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            directory: Arc::new(OpenDirectory),
        }
    }

    /// Consult `directory` for device tokens.
    #[must_use]
    pub fn with_directory(mut self, directory: Arc<dyn DeviceDirectory>) -> Self {
        self.directory = directory;
        self
    }

    /// Classify a credential without consulting the device directory.
    pub fn classify(&self, credential: Option<&str>) -> Result<Identity, AuthError> {
        let token = credential
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MissingCredential)?;

        if let Some(agent_id) = token.strip_prefix(DEVICE_TOKEN_PREFIX) {
            if agent_id.is_empty() {
                return Err(AuthError::EmptyAgentId);
            }
            return Ok(Identity {
                client_id: agent_id.to_string(),
                role: Role::Agent,
                channel: agent_channel(agent_id),
            });
        }

        self.classify_admin(token)
    }

    fn classify_admin(&self, token: &str) -> Result<Identity, AuthError> {
        let data = decode::<serde_json::Value>(token, &self.decoding_key, &self.validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken(e.to_string()),
            })?;

        let claims: AdminClaims = serde_json::from_value(data.claims)
            .map_err(|e| AuthError::InvalidClaims(e.to_string()))?;

        if claims.role.parse::<Role>().ok() != Some(Role::Admin) {
            return Err(AuthError::NotAdmin(claims.role));
        }

        let client_id = format_checker_id(&claims.checker_id)
            .ok_or_else(|| AuthError::InvalidClaims("checker_id is not a finite number".into()))?;

        Ok(Identity {
            client_id,
            role: Role::Admin,
            channel: ADMIN_DASHBOARD.to_string(),
        })
    }

    /// Classify a credential and check devices against the directory.
    pub async fn authorize(&self, credential: Option<&str>) -> Result<Identity, AuthError> {
        let identity = self.classify(credential).inspect_err(|err| {
            warn!(error = %err, code = err.code(), "connection refused");
        })?;

        if identity.role == Role::Agent && !self.directory.is_known(&identity.client_id).await {
            warn!(client_id = %identity.client_id, "connection refused: unknown device");
            return Err(AuthError::UnknownDevice(identity.client_id));
        }

        debug!(
            client_id = %identity.client_id,
            role = %identity.role,
            channel = %identity.channel,
            "connection authorized"
        );
        Ok(identity)
    }
}

/// Integer rendering of the `checker_id` claim; fractional values truncate.
fn format_checker_id(n: &serde_json::Number) -> Option<String> {
    if let Some(v) = n.as_i64() {
        return Some(v.to_string());
    }
    if let Some(v) = n.as_u64() {
        return Some(v.to_string());
    }
    n.as_f64()
        .filter(|f| f.is_finite())
        .map(|f| format!("{:.0}", f.trunc()))
}

/// Pick the credential from an upgrade request. A non-empty `token` query
/// parameter wins over an `Authorization: Bearer` header.
pub fn credential_from_request(query_token: Option<&str>, headers: &HeaderMap) -> Option<String> {
    if let Some(token) = query_token.filter(|t| !t.is_empty()) {
        return Some(token.to_string());
    }
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    bearer_token(value).map(str::to_string)
}

fn bearer_token(header_value: &str) -> Option<&str> {
    let mut parts = header_value.split_whitespace();
    let scheme = parts.next()?;
    let token = parts.next()?;
    if parts.next().is_some() || !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    Some(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::directory::StaticDirectory;
    use assert_matches::assert_matches;
    use axum::http::HeaderValue;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use proptest::prelude::*;
    use serde_json::json;

    const SECRET: &str = "test-signing-key";

    fn mint(claims: &serde_json::Value) -> String {
        encode(&Header::default(), claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
    }

    fn future_exp() -> i64 {
        chrono::Utc::now().timestamp() + 3600
    }

    fn gate() -> AuthGate {
        AuthGate::new(SECRET)
    }

    #[test]
    fn device_token_is_agent() {
        let id = gate().classify(Some("device_A1")).unwrap();
        assert_eq!(
            id,
            Identity {
                client_id: "A1".into(),
                role: Role::Agent,
                channel: "agent::A1".into(),
            }
        );
    }

    #[test]
    fn empty_device_id_rejected() {
        assert_matches!(gate().classify(Some("device_")), Err(AuthError::EmptyAgentId));
    }

    #[test]
    fn missing_or_empty_credential_rejected() {
        assert_matches!(gate().classify(None), Err(AuthError::MissingCredential));
        assert_matches!(gate().classify(Some("")), Err(AuthError::MissingCredential));
    }

    #[test]
    fn admin_token_lands_on_dashboard() {
        let token = mint(&json!({"checker_id": 42, "role": "admin", "exp": future_exp()}));
        let id = gate().classify(Some(&token)).unwrap();
        assert_eq!(id.client_id, "42");
        assert_eq!(id.role, Role::Admin);
        assert_eq!(id.channel, ADMIN_DASHBOARD);
    }

    #[test]
    fn float_checker_id_is_rendered_as_integer() {
        let token = mint(&json!({"checker_id": 7.0, "role": "admin"}));
        assert_eq!(gate().classify(Some(&token)).unwrap().client_id, "7");
    }

    #[test]
    fn token_without_exp_is_accepted() {
        let token = mint(&json!({"checker_id": 1, "role": "admin"}));
        assert!(gate().classify(Some(&token)).is_ok());
    }

    #[test]
    fn non_admin_role_rejected() {
        for role in ["agent", "teacher", "Admin"] {
            let token = mint(&json!({"checker_id": 5, "role": role, "exp": future_exp()}));
            assert_matches!(gate().classify(Some(&token)), Err(AuthError::NotAdmin(r)) if r == role);
        }
    }

    #[test]
    fn expired_token_rejected() {
        let exp = chrono::Utc::now().timestamp() - 3600;
        let token = mint(&json!({"checker_id": 5, "role": "admin", "exp": exp}));
        assert_matches!(gate().classify(Some(&token)), Err(AuthError::TokenExpired));
    }

    #[test]
    fn wrong_key_rejected() {
        let token = encode(
            &Header::default(),
            &json!({"checker_id": 5, "role": "admin"}),
            &EncodingKey::from_secret(b"someone-else"),
        )
        .unwrap();
        assert_matches!(gate().classify(Some(&token)), Err(AuthError::InvalidToken(_)));
    }

    #[test]
    fn hs512_is_accepted() {
        let token = encode(
            &Header::new(Algorithm::HS512),
            &json!({"checker_id": 9, "role": "admin"}),
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        assert_eq!(gate().classify(Some(&token)).unwrap().client_id, "9");
    }

    #[test]
    fn malformed_token_rejected() {
        assert_matches!(gate().classify(Some("not.a.jwt")), Err(AuthError::InvalidToken(_)));
        assert_matches!(gate().classify(Some("garbage")), Err(AuthError::InvalidToken(_)));
    }

    #[test]
    fn missing_claims_rejected() {
        let token = mint(&json!({"role": "admin"}));
        assert_matches!(gate().classify(Some(&token)), Err(AuthError::InvalidClaims(_)));
        let token = mint(&json!({"checker_id": "abc", "role": "admin"}));
        assert_matches!(gate().classify(Some(&token)), Err(AuthError::InvalidClaims(_)));
    }

    #[tokio::test]
    async fn directory_refuses_unknown_devices() {
        let gate = gate().with_directory(Arc::new(StaticDirectory::new(["A1"])));
        assert!(gate.authorize(Some("device_A1")).await.is_ok());
        assert_matches!(
            gate.authorize(Some("device_A2")).await,
            Err(AuthError::UnknownDevice(id)) if id == "A2"
        );
    }

    #[tokio::test]
    async fn directory_not_consulted_for_admins() {
        let gate = gate().with_directory(Arc::new(StaticDirectory::default()));
        let token = mint(&json!({"checker_id": 3, "role": "admin"}));
        assert!(gate.authorize(Some(&token)).await.is_ok());
    }

    // ── credential extraction ───────────────────────────────────────

    #[test]
    fn query_token_wins_over_header() {
        let mut headers = HeaderMap::new();
        let _ = headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer header-token"));
        assert_eq!(
            credential_from_request(Some("device_Q"), &headers).as_deref(),
            Some("device_Q")
        );
    }

    #[test]
    fn header_used_when_query_absent_or_empty() {
        let mut headers = HeaderMap::new();
        let _ = headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer device_H"));
        assert_eq!(credential_from_request(None, &headers).as_deref(), Some("device_H"));
        assert_eq!(credential_from_request(Some(""), &headers).as_deref(), Some("device_H"));
    }

    #[test]
    fn malformed_authorization_header_ignored() {
        for value in ["Basic abc", "Bearer", "Bearer a b", "token"] {
            let mut headers = HeaderMap::new();
            let _ = headers.insert(AUTHORIZATION, HeaderValue::from_static(value));
            assert_eq!(credential_from_request(None, &headers), None, "{value}");
        }
    }

    #[test]
    fn no_credential_anywhere() {
        assert_eq!(credential_from_request(None, &HeaderMap::new()), None);
    }

    proptest! {
        #[test]
        fn any_nonempty_device_id_is_an_agent(agent_id in "[A-Za-z0-9_.:-]{1,40}") {
            let token = format!("{DEVICE_TOKEN_PREFIX}{agent_id}");
            let id = gate().classify(Some(&token)).unwrap();
            prop_assert_eq!(id.role, Role::Agent);
            prop_assert_eq!(&id.channel, &format!("agent::{agent_id}"));
            prop_assert_eq!(id.client_id, agent_id);
        }

        #[test]
        fn signed_non_admin_role_never_authorizes(role in "[a-z]{1,12}", checker_id in 0u32..100_000) {
            prop_assume!(role != "admin");
            let token = mint(&json!({"checker_id": checker_id, "role": role}));
            prop_assert!(matches!(gate().classify(Some(&token)), Err(AuthError::NotAdmin(_))));
        }
    }
}
