//! Axum router construction.
//!
//! Builds the full application router with all route groups and middleware
//! layers.

use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::context::AppContext;
use crate::middleware::auth::auth_middleware;
use crate::middleware::request_id::request_id_middleware;
use crate::routes;

/// Build the complete Axum router.
pub fn build_router(ctx: AppContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Routes authenticated by a query-string credential, since media
    // elements and EventSource cannot send an Authorization header.
    let query_auth_routes = Router::new()
        .route("/videos/stream/{id}", get(routes::stream::stream_video))
        .route("/status/events", get(routes::events::status_events));

    // Protected API routes.
    let protected_routes = Router::new()
        // Upload size is enforced while streaming into the blob store.
        .route(
            "/videos",
            post(routes::videos::upload_video).layer(DefaultBodyLimit::disable()),
        )
        .route("/videos/{id}", get(routes::videos::get_video))
        .route(
            "/videos/{id}/moderation",
            post(routes::videos::moderate_video),
        )
        .route(
            "/videos/{id}/stream-token",
            post(routes::videos::issue_stream_token),
        )
        .route(
            "/videos/{id}/thumbnail",
            get(routes::videos::get_thumbnail),
        )
        .layer(middleware::from_fn_with_state(ctx.clone(), auth_middleware));

    let api = query_auth_routes.merge(protected_routes);

    Router::new()
        .route("/health", get(routes::health::health_check))
        .nest("/api", api)
        .layer(middleware::from_fn(request_id_middleware))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}
