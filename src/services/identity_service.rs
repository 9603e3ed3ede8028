//! Bearer credential verification.
//!
//! Credentials are HS256 JSON Web Tokens signed with `ACCESS_TOKEN_SECRET`. They are
//! accepted from the `Authorization: Bearer` header, the `access_token` cookie or a
//! `token` query parameter (browsers cannot set headers on WebSocket upgrades).

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::http::{HeaderMap, Uri, header};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use crate::error::ServiceError;

const BEARER_PREFIX: &str = "Bearer ";
const TOKEN_COOKIE: &str = "access_token";
const TOKEN_QUERY_PARAM: &str = "token";

/// Claims carried by an access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// User identifier.
    pub sub: String,
    /// Display name suggested by the identity provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Expiration (Unix timestamp, seconds).
    pub exp: u64,
}

/// Verified caller of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub claims: Claims,
}

/// Validate `token` and return the identity it carries.
pub fn verify(secret: &str, token: &str) -> Result<Identity, ServiceError> {
    let validation = Validation::new(Algorithm::HS256);
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|err| ServiceError::Unauthorized(format!("invalid credential: {err}")))?;

    if data.claims.sub.trim().is_empty() {
        return Err(ServiceError::Unauthorized(
            "credential carries no subject".into(),
        ));
    }
    Ok(Identity {
        user_id: data.claims.sub.clone(),
        claims: data.claims,
    })
}

/// Sign a token for `user_id` valid for `ttl`. Used by local tooling and tests.
pub fn issue(
    secret: &str,
    user_id: &str,
    name: Option<&str>,
    ttl: Duration,
) -> Result<String, ServiceError> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let claims = Claims {
        sub: user_id.to_owned(),
        name: name.map(str::to_owned),
        exp: (now + ttl).as_secs(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|err| ServiceError::InvalidState(format!("failed to sign credential: {err}")))
}

/// Find the raw credential of a request: header first, then cookie, then query.
pub fn extract_token(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    bearer_token(headers)
        .or_else(|| cookie_token(headers))
        .or_else(|| query_token(uri))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix(BEARER_PREFIX)?.trim();
    (!token.is_empty()).then(|| token.to_owned())
}

fn cookie_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == TOKEN_COOKIE && !value.is_empty())
        .map(|(_, value)| value.to_owned())
}

fn query_token(uri: &Uri) -> Option<String> {
    uri.query()?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(name, value)| *name == TOKEN_QUERY_PARAM && !value.is_empty())
        .map(|(_, value)| value.to_owned())
}

/// Verify the credential of a request, if it carries one.
pub fn authenticate(
    secret: &str,
    headers: &HeaderMap,
    uri: &Uri,
) -> Result<Option<Identity>, ServiceError> {
    extract_token(headers, uri)
        .map(|token| verify(secret, &token))
        .transpose()
}
