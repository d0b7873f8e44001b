use axum::{
    extract::Request,
    routing::{get, post},
    Router,
};
use tower::util::ServiceExt;

use crate::{
    handlers::{pods, records, streams},
    middleware::{authenticate, resolve_host, HostContext},
    AppState,
};

mod health;

/// Routes served on pod hosts (`{pod}.{domain}`, custom domains, root pod).
///
/// The wildcard handlers own path resolution: whether a path names a
/// stream or a record is decided against the stream tree, not the route
/// table.
fn pod_router() -> Router<AppState> {
    Router::new()
        .route(
            "/",
            get(records::get_root).delete(records::delete_root),
        )
        .route("/.meta/api/streams", get(streams::meta_streams))
        .route(
            "/{*path}",
            get(records::get_path)
                .post(records::post_path)
                .delete(records::delete_path),
        )
}

/// Routes served on the main domain.
fn main_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/pods", post(pods::create).get(pods::list))
        .route("/api/pods/{name}", axum::routing::delete(pods::delete))
}

/// Assemble the host-dispatched application.
///
/// Middleware runs outside the dispatch: the host resolver stamps every
/// request with a `HostContext` (and the client address), the
/// authenticator validates bearer tokens against it, and the dispatcher
/// then hands the request to the pod or main router.
pub fn build(state: AppState) -> Router {
    let pod_routes = pod_router().with_state(state.clone());
    let main_routes = main_router().with_state(state.clone());

    let dispatch = tower::service_fn(move |request: Request| {
        let pod_routes = pod_routes.clone();
        let main_routes = main_routes.clone();
        async move {
            match request.extensions().get::<HostContext>() {
                Some(HostContext::Pod(_)) => pod_routes.oneshot(request).await,
                _ => main_routes.oneshot(request).await,
            }
        }
    });

    Router::new()
        .fallback_service(dispatch)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            authenticate,
        ))
        .layer(axum::middleware::from_fn_with_state(state, resolve_host))
}
