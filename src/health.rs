use crate::AppState;
use axum::{
    extract::State,
    http::StatusCode,
    Json,
};
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize)]
pub struct LivenessResponse {
    pub status: &'static str,
    pub service: String,
}

#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub model: String,
}

pub async fn liveness(State(state): State<Arc<AppState>>) -> Json<LivenessResponse> {
    Json(LivenessResponse {
        status: "ok",
        service: state.settings.app_name.clone(),
    })
}

pub async fn readiness(State(state): State<Arc<AppState>>) -> (StatusCode, Json<ReadinessResponse>) {
    let model_ok = state.agent.ready();
    if !model_ok {
        tracing::error!("Readiness check: model credentials missing");
    }

    let status_code = if model_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(ReadinessResponse {
            status: if model_ok { "ready" } else { "unready" }.to_string(),
            model: if model_ok { "ok" } else { "unconfigured" }.to_string(),
        }),
    )
}
