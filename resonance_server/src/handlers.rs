use crate::error::ApiError;
use crate::AppState;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use brain_core::pipeline::PipelineError;
use futures::stream::{Stream, StreamExt};
use resonance_protocol::{GenerateRequest, GenerateResponse, ProviderHealth, StreamEvent};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::time::Duration;

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let pipeline = &state.pipeline;
    Json(json!({
        "status": "ok",
        "parameters": pipeline.registry().len(),
        "default_provider": pipeline.providers().default_name(),
    }))
}

pub async fn generate(
    State(state): State<AppState>,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Json<GenerateResponse>, ApiError> {
    let Json(req) = payload.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let resp = state.pipeline.apply_description(req).await?;
    Ok(Json(resp))
}

/// SSE: `chunk` events while the model writes, then one `complete` or `error`.
pub async fn generate_stream(
    State(state): State<AppState>,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let Json(req) = payload.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let events = state.pipeline.stream_description(req).await?;

    let stream = events.map(|ev| Ok(to_sse_event(&ev)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

fn to_sse_event(ev: &StreamEvent) -> Event {
    let name = match ev {
        StreamEvent::Chunk { .. } => "chunk",
        StreamEvent::Complete(_) => "complete",
        StreamEvent::Error(_) => "error",
    };
    let data = serde_json::to_string(ev).unwrap_or_else(|e| {
        let body = PipelineError::Internal(format!("event serialization failed: {e}")).to_error_body();
        json!({"type": "error", "error": body.error, "code": body.code}).to_string()
    });
    Event::default().event(name).data(data)
}

#[derive(Debug, Deserialize)]
pub struct HealthQuery {
    provider: Option<String>,
}

pub async fn llm_health(
    State(state): State<AppState>,
    Query(q): Query<HealthQuery>,
) -> Json<ProviderHealth> {
    Json(state.pipeline.check_provider_health(q.provider.as_deref()).await)
}
