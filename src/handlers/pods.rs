use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;

use crate::{
    error::ApiError,
    extractors::{AuthenticatedUser, RateKey},
    models::pod::Pod,
    services::{PermissionService, PodService},
    AppState,
};

#[derive(Debug, Deserialize)]
pub struct CreatePodInput {
    pub name: String,
}

/// POST /api/pods — create a pod owned by the caller (main domain,
/// global token).
pub async fn create(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    RateKey(identifier): RateKey,
    Json(input): Json<CreatePodInput>,
) -> Result<Response, ApiError> {
    let name = input.name.trim().to_ascii_lowercase();

    let pods = PodService::new(state.db.clone(), state.cache.clone());
    let (pod, outcome) = pods
        .create(&name, &user.id, &state.rate_limiter, &identifier)
        .await?;

    let mut response = (StatusCode::CREATED, Json(pod)).into_response();
    for (header, value) in outcome.headers() {
        if let Ok(v) = axum::http::HeaderValue::from_str(&value) {
            response
                .headers_mut()
                .insert(axum::http::HeaderName::from_static(header), v);
        }
    }
    Ok(response)
}

/// GET /api/pods — pods owned by the caller.
pub async fn list(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Json<Vec<Pod>>, ApiError> {
    let pods = PodService::new(state.db.clone(), state.cache.clone());
    Ok(Json(pods.list_owned(&user.id).await?))
}

/// DELETE /api/pods/{name} — delete a pod from the main-domain API
/// (owner only; the pod-host `DELETE /` route is equivalent).
pub async fn delete(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let pods = PodService::new(state.db.clone(), state.cache.clone());
    if pods.get(&name).await?.is_none() {
        return Err(ApiError::PodNotFound(name));
    }

    let permissions = PermissionService::new(state.db.clone());
    permissions.require_owner(&name, &user.id).await?;

    pods.delete(&name).await?;
    state.blob.delete_pod(&name).await?;

    Ok(Json(serde_json::json!({ "success": true })))
}
