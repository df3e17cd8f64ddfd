use crate::agent::{AgentBackend, DecisionCall};
use crate::config::Settings;
use crate::health;
use crate::logging;
use crate::protocol::{DecisionRequest, DecisionResponse, StreamOpenRequest};
use crate::types::{DecisionAction, HoldlineError, Result};
use axum::{
    body::Body,
    extract::State,
    http::{header, Method, StatusCode},
    middleware,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing_error::SpanTrace;

pub struct AppState {
    pub agent: Arc<dyn AgentBackend>,
    pub settings: Settings,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.settings);
    let api = Router::new()
        .route("/agent/chat/stream", post(chat_stream))
        .route("/agent/reservations/decision", post(decision));

    Router::new()
        .nest(&state.settings.api_prefix, api)
        .route("/health", get(health::liveness))
        .route("/readyz", get(health::readiness))
        .layer(axum::extract::DefaultBodyLimit::max(64 * 1024))
        .layer(middleware::from_fn(logging::request_id_middleware))
        .layer(cors)
        .with_state(state)
}

fn cors_layer(settings: &Settings) -> CorsLayer {
    let origins: Vec<axum::http::HeaderValue> = settings
        .allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
}

/// Opens one conversational turn and streams its events back as NDJSON.
/// The stream ends after the `done` event.
pub async fn chat_stream(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StreamOpenRequest>,
) -> Result<Response> {
    if request.session_id.trim().is_empty() {
        return Err(HoldlineError::InvalidRequest("session_id must not be empty".to_string()).into());
    }
    if request.message.trim().is_empty() {
        return Err(HoldlineError::InvalidRequest("message must not be empty".to_string()).into());
    }
    if !state.agent.ready() {
        return Err(HoldlineError::ModelUnavailable(
            "Model credentials are not configured.".to_string(),
        )
        .into());
    }

    tracing::info!(
        "[stream] opening turn for session {} ({} chars)",
        request.session_id,
        request.message.len()
    );

    let events = state.agent.stream_turn(request.session_id, request.message);
    let lines = events.map(|event| {
        serde_json::to_string(&event).map(|mut line| {
            line.push('\n');
            line
        })
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(lines))
        .map_err(|e| HoldlineError::Internal(e.to_string(), SpanTrace::capture()).into())
}

/// Forwards a confirm/cancel decision to the agent. Field requirements
/// depend on the action; violations come back as 422 before anything runs.
pub async fn decision(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DecisionRequest>,
) -> Result<Json<DecisionResponse>> {
    if request.session_id.trim().is_empty() {
        return Err(HoldlineError::InvalidRequest("session_id must not be empty".to_string()).into());
    }
    match request.action {
        DecisionAction::Confirm
            if request
                .start_time
                .as_deref()
                .map(|s| s.trim().is_empty())
                .unwrap_or(true) =>
        {
            return Err(HoldlineError::InvalidRequest(
                "start_time is required to confirm a reservation".to_string(),
            )
            .into());
        }
        DecisionAction::Cancel
            if request
                .reservation_id
                .as_deref()
                .map(|s| s.trim().is_empty())
                .unwrap_or(true) =>
        {
            return Err(HoldlineError::InvalidRequest(
                "reservation_id is required to cancel a reservation".to_string(),
            )
            .into());
        }
        _ => {}
    }

    tracing::info!(
        "[stream] decision '{}' for session {}",
        request.action,
        request.session_id
    );

    let reply = state
        .agent
        .apply_decision(DecisionCall {
            session_id: request.session_id,
            action: request.action,
            start_time: request.start_time,
            reservation_id: request.reservation_id,
        })
        .await?;

    Ok(Json(reply))
}
