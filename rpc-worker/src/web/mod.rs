//! HTTP surface sharing the process's producer.
//!
//! Calls have to originate in the process running the consumer loop, since
//! that loop is the only one holding this process's pending calls.

pub mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::queue::Transport;

pub use handlers::{call, health, AppState, ErrorResponse, HealthResponse};

/// Build the router.
pub fn router<T: Transport>(state: AppState<T>) -> Router {
    Router::new()
        .route("/health", get(health::<T>))
        .route("/calls/:message_type", post(call::<T>))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{CorrelationRegistry, Producer};
    use crate::testkit::{FailingTransport, RecordingTransport};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn state<T: Transport>(transport: T, timeout_ms: u64) -> AppState<T> {
        let producer = Producer::new(transport, CorrelationRegistry::new(), "requests", "inbound");
        AppState::new(Arc::new(producer), Duration::from_millis(timeout_ms))
    }

    fn call_request(message_type: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(format!("/calls/{message_type}"))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_pending_calls() {
        let response = router(state(RecordingTransport::default(), 10))
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!({ "status": "ok", "pending_calls": 0 }));
    }

    #[tokio::test]
    async fn test_call_returns_reply() {
        let transport = RecordingTransport::default();
        let state = state(transport.clone(), 5_000);
        let registry = state.producer.registry().clone();

        let responder = tokio::spawn(async move {
            let id = transport.wait_for_sent(1).await[0].1.id.clone();
            let mut reply = crate::queue::MessageData::new();
            reply.insert("message".to_string(), json!("success"));
            registry.deliver(&id, reply);
        });

        let response = router(state)
            .oneshot(call_request("send_mail", json!({ "to": "a@x.com" })))
            .await
            .unwrap();
        responder.await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!({ "message": "success" }));
    }

    #[tokio::test]
    async fn test_call_timeout_maps_to_504() {
        let response = router(state(RecordingTransport::default(), 10))
            .oneshot(call_request("send_mail", json!({})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        let body = json_body(response).await;
        assert!(body["error"].as_str().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_publish_failure_maps_to_502() {
        let response = router(state(FailingTransport, 1_000))
            .oneshot(call_request("send_mail", json!({})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_non_object_body_rejected() {
        let response = router(state(RecordingTransport::default(), 10))
            .oneshot(call_request("send_mail", json!([1, 2])))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
