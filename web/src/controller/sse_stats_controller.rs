use crate::controller::ApiResponse;
use crate::params::sse::StatsParams;
use ::sse::{BrokerStats, Topic};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use service::AppState;
use std::collections::BTreeMap;
use utoipa::ToSchema;

/// Open stream counts across all chats.
#[derive(Debug, Serialize, ToSchema)]
pub struct StreamStats {
    pub total_connections: usize,
    /// Open streams per chat id
    pub chats: BTreeMap<String, usize>,
}

impl From<BrokerStats> for StreamStats {
    fn from(stats: BrokerStats) -> Self {
        Self {
            total_connections: stats.total_connections,
            chats: stats
                .topics
                .into_iter()
                .map(|(topic, count)| (topic.as_str().to_string(), count))
                .collect(),
        }
    }
}

/// Open stream count for one chat.
#[derive(Debug, Serialize, ToSchema)]
pub struct ChatStreamStats {
    pub chat_id: String,
    pub connections: usize,
}

/// GET open SSE stream counts
#[utoipa::path(
    get,
    path = "/sse/stats",
    params(StatsParams),
    responses(
        (status = 200, description = "Stream counts, for one chat when chat_id is given", body = StreamStats),
    )
)]
pub async fn index(
    State(app_state): State<AppState>,
    Query(params): Query<StatsParams>,
) -> Response {
    match params.chat_id {
        Some(chat_id) => {
            let connections = app_state
                .broker()
                .topic_connection_count(&Topic::from(chat_id.as_str()));

            Json(ApiResponse::new(
                StatusCode::OK.into(),
                ChatStreamStats {
                    chat_id,
                    connections,
                },
            ))
            .into_response()
        }
        None => Json(ApiResponse::new(
            StatusCode::OK.into(),
            StreamStats::from(app_state.broker().stats()),
        ))
        .into_response(),
    }
}
