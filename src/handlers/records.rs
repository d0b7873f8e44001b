use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;

use crate::{
    error::ApiError,
    extractors::{AuthenticatedUser, OptionalUser, PodHost, RateKey},
    handlers::streams,
    models::{
        rate_limit::{RateLimitAction, RateLimitOutcome},
        record::{Record, RecordList},
        stream::Stream,
    },
    services::{
        record_service::{parse_index_query, IndexQuery},
        stream_service::ResolvedPath,
        PermissionService, PodService, RecordService, StreamService,
    },
    utils::{content::resolve_content, validation::split_path},
    AppState,
};

#[derive(Debug, Deserialize)]
pub struct ReadQuery {
    pub i: Option<String>,
    pub unique: Option<bool>,
    pub recursive: Option<bool>,
    pub limit: Option<i64>,
    pub after: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct WriteQuery {
    pub access: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteQuery {
    pub purge: Option<bool>,
}

fn record_service(state: &AppState) -> RecordService {
    RecordService::new(
        state.db.clone(),
        state.cache.clone(),
        state.blob.clone(),
        state.schema_validator.clone(),
        &state.settings,
    )
}

/// 401 for anonymous callers, 403 for authenticated ones.
fn deny(user: Option<&AuthenticatedUser>) -> ApiError {
    match user {
        Some(_) => ApiError::Forbidden("access denied".to_string()),
        None => ApiError::Unauthorized,
    }
}

fn with_rate_headers(mut response: Response, outcome: &RateLimitOutcome) -> Response {
    for (name, value) in outcome.headers() {
        if let Ok(v) = HeaderValue::from_str(&value) {
            response.headers_mut().insert(HeaderName::from_static(name), v);
        }
    }
    response
}

/// Headers carried by every single-record read.
fn single_record_headers(record: &Record) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let mut put = |name: &'static str, value: &str| {
        if let Ok(v) = HeaderValue::from_str(value) {
            headers.insert(HeaderName::from_static(name), v);
        }
    };
    put("x-hash", &record.hash);
    if let Some(prev) = &record.previous_hash {
        put("x-previous-hash", prev);
    }
    put("x-author", &record.user_id);
    put("x-timestamp", &record.created_at.timestamp_millis().to_string());

    // Stored custom headers are replayed with their prefix restored.
    if let Some(serde_json::Value::Object(map)) = &record.headers {
        for (key, value) in map {
            if let (Ok(name), Some(text)) = (
                HeaderName::try_from(format!("x-record-header-{}", key)),
                value.as_str(),
            ) {
                if let Ok(v) = HeaderValue::from_str(text) {
                    headers.insert(name, v);
                }
            }
        }
    }
    headers
}

/// Serve a single record: inline bytes, or a CDN redirect / blob read for
/// externally stored content.
async fn serve_record(
    records: &RecordService,
    stream: &Stream,
    record: &Record,
    outcome: &RateLimitOutcome,
) -> Result<Response, ApiError> {
    let mut headers = single_record_headers(record);

    if record.storage.is_some() {
        if let Some(url) = records.external_url(stream, record) {
            headers.insert(header::LOCATION, HeaderValue::from_str(&url).map_err(|_| ApiError::Internal)?);
            headers.insert(
                header::CACHE_CONTROL,
                HeaderValue::from_static("public, max-age=31536000, immutable"),
            );
            return Ok(with_rate_headers(
                (StatusCode::FOUND, headers).into_response(),
                outcome,
            ));
        }
        let bytes = records.external_content(stream, record).await?;
        if let Ok(v) = HeaderValue::from_str(&record.content_type) {
            headers.insert(header::CONTENT_TYPE, v);
        }
        return Ok(with_rate_headers(
            (StatusCode::OK, headers, bytes).into_response(),
            outcome,
        ));
    }

    if let Ok(v) = HeaderValue::from_str(&record.content_type) {
        headers.insert(header::CONTENT_TYPE, v);
    }
    Ok(with_rate_headers(
        (StatusCode::OK, headers, record.content.clone()).into_response(),
        outcome,
    ))
}

fn list_response(
    records: Vec<Record>,
    total: i64,
    limit: i64,
    has_more: bool,
    outcome: &RateLimitOutcome,
) -> Response {
    let body = RecordList {
        records: records.iter().map(Record::to_api).collect(),
        total,
        limit,
        has_more,
    };
    with_rate_headers(Json(body).into_response(), outcome)
}

/// GET / — serve the pod root through the `.config/routing` table.
pub async fn get_root(
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

    let streams = StreamService::new(state.db.clone(), state.cache.clone());
    let permissions = PermissionService::new(state.db.clone());
    let records = record_service(&state);

    serve_routed_path(
        &pods, &streams, &permissions, &records, &pod, "", user.as_ref(), &outcome,
    )
    .await
    .map_err(|e| match e {
        // The root path has no stream fallback; surface a plain 404.
        ApiError::StreamNotFound(_) => {
            ApiError::NotFound("no root routing configured".to_string())
        }
        other => other,
    })
}

/// GET /{path} — stream listings, index/range reads, and record reads.
pub async fn get_path(
    State(state): State<AppState>,
    PodHost(pod): PodHost,
    OptionalUser(user): OptionalUser,
    RateKey(identifier): RateKey,
    Path(path): Path<String>,
    Query(query): Query<ReadQuery>,
) -> Result<Response, ApiError> {
    let outcome = state
        .rate_limiter
        .debit(&identifier, RateLimitAction::Read)
        .await?;

    let segments =
        split_path(&path).ok_or_else(|| ApiError::InvalidInput(format!("invalid path '{}'", path)))?;

    let pods = PodService::new(state.db.clone(), state.cache.clone());
    if pods.get(&pod).await?.is_none() {
        return Err(ApiError::PodNotFound(pod));
    }

    let streams = StreamService::new(state.db.clone(), state.cache.clone());
    let permissions = PermissionService::new(state.db.clone());
    let records = record_service(&state);
    let user_id = user.as_ref().map(|u| u.id.as_str());

    let Some(resolved) = streams.resolve_read_path(&pod, &segments).await? else {
        // Unresolvable paths fall through to the routing table, so a pod
        // can host a site whose URLs don't mirror its stream layout.
        return serve_routed_path(
            &pods, &streams, &permissions, &records, &pod, &path, user.as_ref(), &outcome,
        )
        .await;
    };

    match resolved {
        ResolvedPath::Stream(stream) => {
            if !permissions.can_read(&stream, user_id).await? {
                return Err(deny(user.as_ref()));
            }

            if let Some(spec) = &query.i {
                return match parse_index_query(spec)? {
                    IndexQuery::Single(i) => {
                        let record = records.get_by_index(&stream, i).await?;
                        serve_record(&records, &stream, &record, &outcome).await
                    }
                    IndexQuery::Range(start, end) => {
                        let rows = records.range(&stream, start, end).await?;
                        let total = rows.len() as i64;
                        Ok(list_response(rows, total, total.max(1), false, &outcome))
                    }
                };
            }

            if query.recursive == Some(true) {
                return recursive_listing(
                    &state, &streams, &records, &permissions, &stream, user_id, &query, &outcome,
                )
                .await;
            }

            let (rows, total, has_more) = if query.unique == Some(true) {
                records.list_unique(&stream, query.limit, query.after).await?
            } else {
                records.list(&stream, query.limit, query.after).await?
            };
            let limit = query
                .limit
                .unwrap_or(state.settings.query.max_record_limit)
                .clamp(1, state.settings.query.max_record_limit);
            Ok(list_response(rows, total, limit, has_more, &outcome))
        }
        ResolvedPath::Record { stream, name } => {
            if !permissions.can_read(&stream, user_id).await? {
                return Err(deny(user.as_ref()));
            }
            let record = records
                .get_by_name(&stream, &name)
                .await?
                .ok_or_else(|| ApiError::RecordNotFound(format!("{}/{}", stream.path, name)))?;
            serve_record(&records, &stream, &record, &outcome).await
        }
    }
}

/// Serve a path through the pod's routing table (`.config/routing` maps
/// URL paths to `streamPath/recordName` targets).
#[allow(clippy::too_many_arguments)]
async fn serve_routed_path(
    pods: &PodService,
    streams: &StreamService,
    permissions: &PermissionService,
    records: &RecordService,
    pod: &str,
    path: &str,
    user: Option<&AuthenticatedUser>,
    outcome: &RateLimitOutcome,
) -> Result<Response, ApiError> {
    let target = pods
        .routing(pod)
        .await?
        .and_then(|routing| {
            routing
                .get(format!("/{}", path.trim_matches('/')))
                .and_then(|v| v.as_str())
                .map(str::to_string)
        })
        .ok_or_else(|| ApiError::StreamNotFound(path.to_string()))?;

    let segments = split_path(&target)
        .filter(|s| s.len() >= 2)
        .ok_or_else(|| ApiError::NotFound(format!("bad routing target '{}'", target)))?;
    let Some((name, prefix)) = segments.split_last() else {
        return Err(ApiError::NotFound(format!("bad routing target '{}'", target)));
    };

    let stream = streams
        .get_by_path(pod, &prefix.join("/"))
        .await?
        .ok_or_else(|| ApiError::StreamNotFound(target.clone()))?;

    if !permissions
        .can_read(&stream, user.map(|u| u.id.as_str()))
        .await?
    {
        return Err(deny(user));
    }

    let record = records
        .get_by_name(&stream, name)
        .await?
        .ok_or_else(|| ApiError::RecordNotFound(target))?;

    serve_record(records, &stream, &record, outcome).await
}

/// Records across a stream and its descendants, stream-path order then
/// index order. Authority is re-checked per stream; unreadable subtrees
/// are skipped.
#[allow(clippy::too_many_arguments)]
async fn recursive_listing(
    state: &AppState,
    streams: &StreamService,
    records: &RecordService,
    permissions: &PermissionService,
    root: &Stream,
    user_id: Option<&str>,
    query: &ReadQuery,
    outcome: &RateLimitOutcome,
) -> Result<Response, ApiError> {
    let limit = query
        .limit
        .unwrap_or(state.settings.query.max_record_limit)
        .clamp(1, state.settings.query.max_record_limit);
    let unique = query.unique == Some(true);

    let mut collected: Vec<Record> = Vec::new();
    for stream in streams.list_subtree(&root.pod_name, &root.path).await? {
        let remaining = limit - collected.len() as i64;
        if remaining <= 0 {
            break;
        }
        if !permissions.can_read(&stream, user_id).await? {
            continue;
        }
        collected.extend(records.list_for_recursive(&stream, unique, remaining).await?);
    }

    let total = collected.len() as i64;
    Ok(list_response(collected, total, limit, false, outcome))
}

/// POST /{path} — append a record, or create a stream when the body is
/// empty.
pub async fn post_path(
    State(state): State<AppState>,
    PodHost(pod): PodHost,
    user: AuthenticatedUser,
    RateKey(identifier): RateKey,
    Path(path): Path<String>,
    Query(query): Query<WriteQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let segments =
        split_path(&path).ok_or_else(|| ApiError::InvalidInput(format!("invalid path '{}'", path)))?;

    let pods = PodService::new(state.db.clone(), state.cache.clone());
    if pods.get(&pod).await?.is_none() {
        return Err(ApiError::PodNotFound(pod));
    }

    if body.is_empty() {
        return streams::create_stream(
            &state,
            &pod,
            &segments,
            &user,
            &identifier,
            query.access.as_deref(),
        )
        .await;
    }

    let Some((name, stream_segments)) = segments.split_last().filter(|(_, rest)| !rest.is_empty())
    else {
        return Err(ApiError::InvalidInput(
            "record writes need a stream path and a record name".to_string(),
        ));
    };

    let mut content = resolve_content(
        &body,
        header_str(&headers, header::CONTENT_TYPE.as_str()),
        header_str(&headers, "x-content-type"),
        header_str(&headers, "x-record-type"),
        state.settings.blob.max_payload_size,
    )?;

    // File uploads without a declared type fall back to the record name's
    // extension (`photo.png` -> image/png).
    if content.content_type == "application/octet-stream" {
        if let Some(guessed) = mime_guess::from_path(*name).first() {
            content.content_type = guessed.essence_str().to_string();
        }
    }

    let custom_headers = collect_custom_headers(&headers);

    let stream_svc = StreamService::new(state.db.clone(), state.cache.clone());
    let permissions = PermissionService::new(state.db.clone());

    let stream = match stream_svc.get_by_path(&pod, &stream_segments.join("/")).await? {
        Some(stream) => {
            if !permissions.can_write(&stream, &user.id).await? {
                return Err(ApiError::Forbidden("write access denied".to_string()));
            }
            stream
        }
        None => {
            // Lazy hierarchy creation: whoever may write to the nearest
            // existing ancestor (the pod owner when there is none) may
            // grow the tree beneath it.
            streams::authorize_creation(&stream_svc, &permissions, &pod, stream_segments, &user)
                .await?;
            let mut tx = state.db.begin().await?;
            let stream = stream_svc
                .ensure_hierarchy(&mut tx, &pod, stream_segments, &user.id)
                .await?;
            tx.commit().await?;
            stream
        }
    };

    let records = record_service(&state);
    let (record, outcome) = records
        .append(
            &stream,
            name,
            content,
            custom_headers,
            &user.id,
            &state.rate_limiter,
            &identifier,
        )
        .await?;

    let mut response_headers = single_record_headers(&record);
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    let response = (
        StatusCode::CREATED,
        response_headers,
        Json(record.to_api()),
    )
        .into_response();
    Ok(with_rate_headers(response, &outcome))
}

/// DELETE /{path} — soft delete or purge a record, or delete a stream.
pub async fn delete_path(
    State(state): State<AppState>,
    PodHost(pod): PodHost,
    user: AuthenticatedUser,
    RateKey(identifier): RateKey,
    Path(path): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> Result<Response, ApiError> {
    let segments =
        split_path(&path).ok_or_else(|| ApiError::InvalidInput(format!("invalid path '{}'", path)))?;

    let pods = PodService::new(state.db.clone(), state.cache.clone());
    if pods.get(&pod).await?.is_none() {
        return Err(ApiError::PodNotFound(pod));
    }

    let streams_svc = StreamService::new(state.db.clone(), state.cache.clone());
    let permissions = PermissionService::new(state.db.clone());
    let resolved = streams_svc
        .resolve_read_path(&pod, &segments)
        .await?
        .ok_or_else(|| ApiError::NotFound(path.clone()))?;

    match resolved {
        ResolvedPath::Stream(stream) => {
            require_owner_or_creator(&permissions, &stream, &user).await?;
            streams_svc.delete(&stream).await?;
            state.blob.delete_stream(&pod, &stream.path).await?;
            Ok(Json(serde_json::json!({ "success": true })).into_response())
        }
        ResolvedPath::Record { stream, name } => {
            require_owner_or_creator(&permissions, &stream, &user).await?;
            let records = record_service(&state);
            if query.purge == Some(true) {
                let (purged, outcome) = records
                    .purge(&stream, &name, &user.id, &state.rate_limiter, &identifier)
                    .await?;
                Ok(with_rate_headers(
                    Json(serde_json::json!({ "success": true, "purged": purged }))
                        .into_response(),
                    &outcome,
                ))
            } else {
                let (_, outcome) = records
                    .soft_delete(&stream, &name, &user.id, &state.rate_limiter, &identifier)
                    .await?;
                Ok(with_rate_headers(
                    Json(serde_json::json!({ "success": true })).into_response(),
                    &outcome,
                ))
            }
        }
    }
}

/// DELETE / — delete the pod (owner only).
pub async fn delete_root(
    State(state): State<AppState>,
    PodHost(pod): PodHost,
    user: AuthenticatedUser,
) -> Result<Response, ApiError> {
    let permissions = PermissionService::new(state.db.clone());
    permissions.require_owner(&pod, &user.id).await?;

    let pods = PodService::new(state.db.clone(), state.cache.clone());
    pods.delete(&pod).await?;
    state.blob.delete_pod(&pod).await?;

    Ok(Json(serde_json::json!({ "success": true })).into_response())
}

/// Deletion requires the pod owner or the stream creator.
async fn require_owner_or_creator(
    permissions: &PermissionService,
    stream: &Stream,
    user: &AuthenticatedUser,
) -> Result<(), ApiError> {
    if stream.user_id == user.id {
        return Ok(());
    }
    permissions.require_owner(&stream.pod_name, &user.id).await
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Persist `x-record-header-*` request headers (prefix stripped) with the
/// record.
fn collect_custom_headers(headers: &HeaderMap) -> Option<serde_json::Value> {
    let mut map = serde_json::Map::new();
    for (name, value) in headers {
        if let Some(key) = name.as_str().strip_prefix("x-record-header-") {
            if let Ok(text) = value.to_str() {
                map.insert(key.to_string(), serde_json::Value::String(text.to_string()));
            }
        }
    }
    if map.is_empty() {
        None
    } else {
        Some(serde_json::Value::Object(map))
    }
}
