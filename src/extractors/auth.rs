use axum::{extract::FromRequestParts, http::request::Parts};

use crate::error::ApiError;
use crate::middleware::host::HostContext;

/// Authenticated principal extracted from request extensions (populated by
/// the bearer-token middleware).
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub id: String,
    pub email: Option<String>,
    pub name: Option<String>,
}

impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthenticatedUser>()
            .cloned()
            .ok_or(ApiError::Unauthorized)
    }
}

/// Optional principal — anonymous requests pass through as `None`.
#[derive(Debug, Clone)]
pub struct OptionalUser(pub Option<AuthenticatedUser>);

impl<S> FromRequestParts<S> for OptionalUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(OptionalUser(
            parts.extensions.get::<AuthenticatedUser>().cloned(),
        ))
    }
}

/// Rate-limit identifier for this request: the user id when authenticated,
/// otherwise `ip:<addr>`.
#[derive(Debug, Clone)]
pub struct RateKey(pub String);

impl<S> FromRequestParts<S> for RateKey
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<RateKey>()
            .cloned()
            .ok_or(ApiError::Internal)
    }
}

/// The pod targeted by this request's host. Rejects main-domain requests.
#[derive(Debug, Clone)]
pub struct PodHost(pub String);

impl<S> FromRequestParts<S> for PodHost
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        match parts.extensions.get::<HostContext>() {
            Some(HostContext::Pod(name)) => Ok(PodHost(name.clone())),
            _ => Err(ApiError::PodNotFound("request host is not a pod".to_string())),
        }
    }
}
