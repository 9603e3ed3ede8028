//! Request extractors for bearer identities.

use axum::{extract::FromRequestParts, http::request::Parts};

use crate::{
    error::{AppError, ServiceError},
    services::identity_service::{self, Identity},
    state::SharedState,
};

/// Caller authenticated by a valid credential; rejects the request with 401 otherwise.
#[derive(Debug, Clone)]
pub struct Authenticated(pub Identity);

/// Caller identity when a credential is present. An invalid credential is still rejected.
#[derive(Debug, Clone)]
pub struct MaybeAuthenticated(pub Option<Identity>);

impl FromRequestParts<SharedState> for Authenticated {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        let MaybeAuthenticated(identity) =
            MaybeAuthenticated::from_request_parts(parts, state).await?;
        identity
            .map(Authenticated)
            .ok_or_else(|| ServiceError::Unauthorized("missing credential".into()).into())
    }
}

impl FromRequestParts<SharedState> for MaybeAuthenticated {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        let identity = identity_service::authenticate(
            &state.config().access_token_secret,
            &parts.headers,
            &parts.uri,
        )?;
        Ok(MaybeAuthenticated(identity))
    }
}
