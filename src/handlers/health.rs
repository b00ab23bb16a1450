// handlers/health.rs - GET /health

use axum::{extract::State, http::StatusCode, response::Json};
use serde_json::{json, Value};

use crate::api::AppState;

pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let now = chrono::Utc::now();
    let ready = state.readiness.is_ready();

    match sqlx::query("SELECT 1").execute(state.executor.backend().pool()).await {
        Ok(_) => {
            let status = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
            (
                status,
                Json(json!({
                    "success": ready,
                    "data": {
                        "status": if ready { "ok" } else { "unsafe" },
                        "timestamp": now,
                        "database": "ok",
                        "privilege_guard": if ready { "safe" } else { "unsafe" }
                    }
                })),
            )
        }
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "success": false,
                "error": "database unavailable",
                "data": {
                    "status": "degraded",
                    "timestamp": now,
                    "database_error": e.to_string()
                }
            })),
        ),
    }
}
