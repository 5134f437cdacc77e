use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use brain_core::pipeline::PipelineError;
use brain_core::providers::LlmError;
use std::any::Any;

/// A categorized pipeline failure rendered as `{error, code, raw?}`.
#[derive(Debug)]
pub struct ApiError(pub PipelineError);

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        Self(e)
    }
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(PipelineError::ClientInput(msg.into()))
    }

    pub fn status(&self) -> StatusCode {
        status_for(&self.0)
    }
}

pub fn status_for(err: &PipelineError) -> StatusCode {
    match err {
        PipelineError::ClientInput(_) => StatusCode::BAD_REQUEST,
        PipelineError::UpstreamFetch(_) => err
            .upstream_status()
            .filter(|s| (400..600).contains(s))
            .and_then(|s| StatusCode::from_u16(s).ok())
            .unwrap_or(StatusCode::BAD_GATEWAY),
        PipelineError::LlmFormat { .. } => StatusCode::BAD_GATEWAY,
        PipelineError::LlmProvider(e) => match e {
            LlmError::UnknownProvider(_) => StatusCode::BAD_REQUEST,
            LlmError::Auth { .. } => StatusCode::UNAUTHORIZED,
            LlmError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            LlmError::Unreachable { .. } | LlmError::BadStatus { .. } | LlmError::Parse { .. } => {
                StatusCode::BAD_GATEWAY
            }
        },
        PipelineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(%status, "request failed: {}", self.0);
        } else {
            tracing::info!(%status, "request rejected: {}", self.0);
        }
        (status, Json(self.0.to_error_body())).into_response()
    }
}

/// A panicking handler still answers with a categorized `internal` error.
pub fn panic_response(payload: Box<dyn Any + Send + 'static>) -> Response {
    let detail = payload
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| payload.downcast_ref::<&str>().copied())
        .unwrap_or("non-string panic payload");
    tracing::error!("request handler panicked: {detail}");
    ApiError(PipelineError::Internal("request handler panicked".to_string())).into_response()
}
