use crate::controller::{health_check_controller, sse_stats_controller};
use crate::sse::handler;
use axum::{routing::get, Router};
use service::AppState;

use utoipa::OpenApi;
use utoipa_rapidoc::RapiDoc;

// This is the global definition of our OpenAPI spec. To be a part
// of the rendered spec, a path and schema must be listed here.
#[derive(OpenApi)]
#[openapi(
        info(
            title = "Chat Stream API"
        ),
        paths(
            health_check_controller::health_check,
            handler::chat_stream_handler,
            sse_stats_controller::index,
        ),
        components(
            schemas(
                sse_stats_controller::StreamStats,
                sse_stats_controller::ChatStreamStats,
            )
        ),
        tags(
            (name = "chat_stream", description = "Real-time chat event streams")
        )
    )]
struct ApiDoc;

pub fn define_routes(app_state: AppState) -> Router {
    Router::new()
        .merge(health_routes())
        .merge(sse_routes(app_state))
        .merge(RapiDoc::with_openapi("/api-docs/openapi.json", ApiDoc::openapi()).path("/rapidoc"))
}

fn health_routes() -> Router {
    Router::new().route("/health", get(health_check_controller::health_check))
}

fn sse_routes(app_state: AppState) -> Router {
    Router::new()
        .route("/chats/:chat_id/stream", get(handler::chat_stream_handler))
        .route("/sse/stats", get(sse_stats_controller::index))
        .with_state(app_state)
}
