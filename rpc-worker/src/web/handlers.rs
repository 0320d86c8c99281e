//! HTTP endpoint handlers.
//!
//! Each request to `/calls/:message_type` turns into one producer call and
//! holds the connection open until the reply or the timeout.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::info;

use crate::error::CallError;
use crate::queue::{MessageData, Transport};
use crate::rpc::Producer;

/// Shared application state.
pub struct AppState<T> {
    pub producer: Arc<Producer<T>>,
    pub call_timeout: Duration,
}

impl<T> AppState<T> {
    pub fn new(producer: Arc<Producer<T>>, call_timeout: Duration) -> Self {
        Self {
            producer,
            call_timeout,
        }
    }
}

impl<T> Clone for AppState<T> {
    fn clone(&self) -> Self {
        Self {
            producer: Arc::clone(&self.producer),
            call_timeout: self.call_timeout,
        }
    }
}

// =============================================================================
// Health Check
// =============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub pending_calls: usize,
}

pub async fn health<T: Transport>(State(state): State<AppState<T>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        pending_calls: state.producer.registry().len(),
    })
}

// =============================================================================
// Calls
// =============================================================================

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Issue a `message_type` call with the JSON body as its payload.
pub async fn call<T: Transport>(
    State(state): State<AppState<T>>,
    Path(message_type): Path<String>,
    Json(data): Json<MessageData>,
) -> Response {
    info!(message_type = %message_type, fields = data.len(), "call_request_received");

    match state
        .producer
        .call(&message_type, data, state.call_timeout)
        .await
    {
        Ok(reply) => (StatusCode::OK, Json(reply)).into_response(),
        Err(e) => {
            let status = match &e {
                CallError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                CallError::Abandoned { .. } | CallError::Publish { .. } => StatusCode::BAD_GATEWAY,
                CallError::Registry(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, Json(ErrorResponse { error: e.to_string() })).into_response()
        }
    }
}
