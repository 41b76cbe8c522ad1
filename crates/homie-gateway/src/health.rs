//! GET /health: liveness for process supervisors.

use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde_json::{json, Value};

use crate::app::AppState;

/// A liveness probe slower than this fails the health check.
const CHECK_TIMEOUT_MS: u64 = 1_500;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn health_handler(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    let shutting_down = state.lifecycle.is_shutting_down();

    // Cheap store round-trip under a timeout: a wedged SQLite mutex should
    // flip the probe, not hang it.
    let sessions = Arc::clone(&state.stores.sessions);
    let probe = tokio::time::timeout(
        Duration::from_millis(CHECK_TIMEOUT_MS),
        tokio::task::spawn_blocking(move || {
            sessions
                .list_notes(&homie_core::types::ChatId::from("cli:local"), 1)
                .map(|_| ())
        }),
    )
    .await;
    let store_ok = matches!(probe, Ok(Ok(Ok(()))));

    let healthy = !shutting_down && store_ok;
    let detail = if shutting_down {
        Some("shutting down")
    } else if !store_ok {
        Some("session store probe failed")
    } else {
        None
    };

    let body = json!({
        "status": if healthy { "ok" } else { "unavailable" },
        "uptime_sec": state.lifecycle.uptime_sec(),
        "shutting_down": shutting_down,
        "last_successful_turn_ms": state.lifecycle.last_successful_turn_ms(),
        "last_turn_ago_sec": state.lifecycle.last_turn_ago_sec(),
        "detail": detail,
    });

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}
