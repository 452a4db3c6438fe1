use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::app_state::AppState;
use crate::services::queue::{DeadLetter, QueueDepth};

const DEFAULT_DEAD_LETTER_LIMIT: usize = 50;
const MAX_DEAD_LETTER_LIMIT: usize = 500;

#[derive(Serialize)]
pub struct QueueSummary {
    pub name: String,
    pub max_attempts: u32,
    pub depth: QueueDepth,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

/// GET /api/v1/queues: depth of every queue.
pub async fn list_queues(State(state): State<AppState>) -> Result<Json<Vec<QueueSummary>>, ApiError> {
    let mut summaries = Vec::new();
    for queue in state.queues() {
        let depth = queue.depth().await.map_err(|e| {
            tracing::error!(queue = %queue.name(), error = %e, "Failed to read queue depth");
            api_error(StatusCode::SERVICE_UNAVAILABLE, "queue backend unavailable")
        })?;
        summaries.push(QueueSummary {
            name: queue.name().to_string(),
            max_attempts: queue.settings().max_attempts,
            depth,
        });
    }
    Ok(Json(summaries))
}

#[derive(Debug, Deserialize)]
pub struct DeadLetterQuery {
    pub limit: Option<usize>,
}

/// GET /api/v1/queues/{queue}/dead-letters: jobs that exhausted their attempts.
pub async fn list_dead_letters(
    State(state): State<AppState>,
    Path(queue_name): Path<String>,
    Query(query): Query<DeadLetterQuery>,
) -> Result<Json<Vec<DeadLetter>>, ApiError> {
    let queue = state
        .queue_by_name(&queue_name)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("unknown queue '{queue_name}'")))?;

    let limit = query
        .limit
        .unwrap_or(DEFAULT_DEAD_LETTER_LIMIT)
        .clamp(1, MAX_DEAD_LETTER_LIMIT);

    let letters = queue.dead_letters(limit).await.map_err(|e| {
        tracing::error!(queue = %queue_name, error = %e, "Failed to read dead letters");
        api_error(StatusCode::SERVICE_UNAVAILABLE, "queue backend unavailable")
    })?;
    Ok(Json(letters))
}
