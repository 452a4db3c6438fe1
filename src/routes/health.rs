use std::collections::BTreeMap;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub detector_loaded: bool,
    pub store: ComponentHealth,
    pub queues: BTreeMap<String, ComponentHealth>,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: &'static str,
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentHealth {
    fn measure<E: std::fmt::Display>(started: Instant, result: Result<(), E>) -> Self {
        match result {
            Ok(()) => Self {
                status: "ok",
                latency_ms: Some(started.elapsed().as_millis() as u64),
                error: None,
            },
            Err(e) => Self {
                status: "error",
                latency_ms: None,
                error: Some(e.to_string()),
            },
        }
    }

    fn healthy(&self) -> bool {
        self.error.is_none()
    }
}

/// GET /health: status store and queue backends.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let started = Instant::now();
    let store = ComponentHealth::measure(started, state.store.health_check().await);

    let mut queues = BTreeMap::new();
    for queue in state.queues() {
        let started = Instant::now();
        let check = ComponentHealth::measure(started, queue.health_check().await);
        queues.insert(queue.name().to_string(), check);
    }

    let healthy = store.healthy() && queues.values().all(ComponentHealth::healthy);
    if !healthy {
        tracing::warn!("Health check degraded");
    }

    let response = HealthResponse {
        status: if healthy { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        detector_loaded: state.detector.is_loaded(),
        store,
        queues,
    };
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(response))
}
