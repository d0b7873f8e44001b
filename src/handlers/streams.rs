use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::{
    error::ApiError,
    extractors::{AuthenticatedUser, OptionalUser, PodHost, RateKey},
    models::{rate_limit::RateLimitAction, stream::is_valid_access_permission, stream::Stream},
    services::{PermissionService, PodService, StreamService},
    AppState,
};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamListResponse {
    pub streams: Vec<Stream>,
    pub total: usize,
}

/// GET /.meta/api/streams — read-only projection of the pod's stream tree,
/// filtered to what the caller may read.
pub async fn meta_streams(
    State(state): State<AppState>,
    PodHost(pod): PodHost,
    OptionalUser(user): OptionalUser,
    RateKey(identifier): RateKey,
) -> Result<Response, ApiError> {
    let outcome = state
        .rate_limiter
        .debit(&identifier, RateLimitAction::Read)
        .await?;

    let pods = PodService::new(state.db.clone(), state.cache.clone());
    if pods.get(&pod).await?.is_none() {
        return Err(ApiError::PodNotFound(pod));
    }

    let streams_svc = StreamService::new(state.db.clone(), state.cache.clone());
    let permissions = PermissionService::new(state.db.clone());
    let user_id = user.as_ref().map(|u| u.id.as_str());

    let all = streams_svc.list(&pod).await?;
    let decisions =
        futures::future::join_all(all.iter().map(|s| permissions.can_read(s, user_id))).await;

    let mut visible = Vec::new();
    for (stream, decision) in all.into_iter().zip(decisions) {
        if decision? {
            visible.push(stream);
        }
    }

    let total = visible.len();
    let mut response = Json(StreamListResponse {
        streams: visible,
        total,
    })
    .into_response();
    for (name, value) in outcome.headers() {
        if let Ok(v) = axum::http::HeaderValue::from_str(&value) {
            response
                .headers_mut()
                .insert(axum::http::HeaderName::from_static(name), v);
        }
    }
    Ok(response)
}

/// Creating (or growing) the tree requires write access to the nearest
/// existing ancestor; with no ancestor at all, only the pod owner may
/// plant new roots. `.config/*` is always owner-only.
pub(crate) async fn authorize_creation(
    streams: &StreamService,
    permissions: &PermissionService,
    pod: &str,
    segments: &[&str],
    user: &AuthenticatedUser,
) -> Result<(), ApiError> {
    if segments.first() == Some(&".config") {
        return permissions.require_owner(pod, &user.id).await;
    }
    match streams.nearest_ancestor(pod, segments).await? {
        Some(ancestor) => {
            if permissions.can_write(&ancestor, &user.id).await? {
                Ok(())
            } else {
                Err(ApiError::Forbidden("write access denied".to_string()))
            }
        }
        None => permissions.require_owner(pod, &user.id).await,
    }
}

/// Explicit stream creation (`POST /{stream...}` with an empty body).
/// On an existing stream, `?access=` re-points its permission instead
/// (owner or creator only).
pub(crate) async fn create_stream(
    state: &AppState,
    pod: &str,
    segments: &[&str],
    user: &AuthenticatedUser,
    identifier: &str,
    access: Option<&str>,
) -> Result<Response, ApiError> {
    if let Some(access) = access {
        if !is_valid_access_permission(access) {
            return Err(ApiError::InvalidInput(format!(
                "invalid access permission '{}'",
                access
            )));
        }
    }

    let streams_svc = StreamService::new(state.db.clone(), state.cache.clone());
    let permissions = PermissionService::new(state.db.clone());

    if let Some(existing) = streams_svc.get_by_path(pod, &segments.join("/")).await? {
        let Some(access) = access else {
            return Err(ApiError::StreamAlreadyExists(existing.path));
        };
        if existing.user_id != user.id {
            permissions.require_owner(pod, &user.id).await?;
        }
        let updated = streams_svc.update_access(&existing, access).await?;
        return Ok(Json(updated).into_response());
    }

    authorize_creation(&streams_svc, &permissions, pod, segments, user).await?;

    let (stream, outcome) = streams_svc
        .create(pod, segments, &user.id, access, &state.rate_limiter, identifier)
        .await?;

    let mut response = (StatusCode::CREATED, Json(stream)).into_response();
    for (name, value) in outcome.headers() {
        if let Ok(v) = axum::http::HeaderValue::from_str(&value) {
            response
                .headers_mut()
                .insert(axum::http::HeaderName::from_static(name), v);
        }
    }
    Ok(response)
}
