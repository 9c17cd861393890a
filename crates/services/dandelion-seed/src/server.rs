//! The agent's own HTTP surface: a health probe and a manual check
//! trigger, mirroring the server's response envelope.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use crate::reconcile::Agent;

pub fn routes(agent: Arc<Agent>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/check/{app_id}", post(check_handler))
        .with_state(agent)
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "code": 0, "info": "success" }))
}

async fn check_handler(
    State(agent): State<Arc<Agent>>,
    Path(app_id): Path<String>,
) -> impl IntoResponse {
    if !agent.knows_app(&app_id) {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "code": 404, "info": "not found specified app_id" })),
        );
    }

    let mut errors: Vec<Option<String>> = Vec::new();
    let sections: Vec<_> = agent
        .conf
        .configs
        .iter()
        .filter(|s| s.app_id == app_id)
        .cloned()
        .collect();
    for section in &sections {
        errors.push(agent.check_app(section).await.err().map(|e| e.to_string()));
    }

    (
        StatusCode::OK,
        Json(json!({ "code": 0, "info": { "app_id": app_id, "errors": errors } })),
    )
}
