//! Push transport: an inbound HTTP endpoint (and optional WebSocket
//! endpoint) that decodes one [`Message`] per request/frame and drives
//! the dispatcher synchronously from the caller's point of view.
//!
//! There is no durable queue to ack against here: `ack` is a log
//! no-op, `nack` a warning. The producer on the other end owns retries.

use crate::dispatcher::Dispatcher;
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::StreamExt;
use rustpress_core::error::{Error, Result};
use rustpress_events::bus::Consumer;
use rustpress_events::event::Message;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Clone)]
struct PushState {
    dispatcher: Arc<Dispatcher>,
    live_connections: Arc<AtomicUsize>,
}

/// Configuration for the webhook/websocket push consumer.
#[derive(Debug, Clone)]
pub struct PushConsumerConfig {
    pub bind_addr: SocketAddr,
    pub http_path: String,
    pub websocket_path: Option<String>,
}

impl Default for PushConsumerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8089".parse().unwrap(),
            http_path: "/events".to_string(),
            websocket_path: Some("/events/ws".to_string()),
        }
    }
}

/// Exposes `POST /events` and, if configured, `GET /events/ws`.
pub struct PushConsumer {
    config: PushConsumerConfig,
    dispatcher: Arc<Dispatcher>,
    shutdown: Arc<Notify>,
    live_connections: Arc<AtomicUsize>,
}

impl PushConsumer {
    pub fn new(dispatcher: Arc<Dispatcher>, config: PushConsumerConfig) -> Self {
        Self {
            config,
            dispatcher,
            shutdown: Arc::new(Notify::new()),
            live_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn router(&self) -> Router {
        let state = PushState {
            dispatcher: self.dispatcher.clone(),
            live_connections: self.live_connections.clone(),
        };

        let mut router = Router::new().route(&self.config.http_path, axum::routing::post(webhook_handler));

        if let Some(ws_path) = &self.config.websocket_path {
            router = router.route(ws_path, get(websocket_handler));
        }

        router.with_state(state)
    }

    /// Number of currently open WebSocket connections, for diagnostics.
    pub fn live_connections(&self) -> usize {
        self.live_connections.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Consumer for PushConsumer {
    async fn start(&self) -> Result<()> {
        let router = self.router();
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| Error::ConsumerStartFailed {
                message: format!("failed to bind {}: {e}", self.config.bind_addr),
            })?;

        let shutdown = self.shutdown.clone();
        tracing::info!(addr = %self.config.bind_addr, "push consumer listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.notified().await })
            .await
            .map_err(|e| Error::ConsumerStartFailed {
                message: format!("server error: {e}"),
            })?;

        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.shutdown.notify_waiters();
        Ok(())
    }
}

async fn webhook_handler(
    State(state): State<PushState>,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    let message = Message::new(uuid::Uuid::now_v7().to_string(), body, "webhook");
    dispatch_one(&state.dispatcher, message).await
}

async fn dispatch_one(dispatcher: &Arc<Dispatcher>, message: Message) -> axum::response::Response {
    use axum::http::StatusCode;

    let Some(event) = message.into_event() else {
        tracing::warn!("push message carried no `type`, treating as handled");
        return (StatusCode::OK, Json(serde_json::json!({"status": "acked"}))).into_response();
    };

    let ok = dispatcher.dispatch(event, None).await;
    if ok {
        (StatusCode::OK, Json(serde_json::json!({"status": "acked"}))).into_response()
    } else {
        tracing::warn!("push dispatch reported failure; no durable queue to nack against");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"status": "nacked"})),
        )
            .into_response()
    }
}

async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<PushState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: PushState) {
    state.live_connections.fetch_add(1, Ordering::Relaxed);
    tracing::debug!("websocket push connection opened");

    while let Some(frame) = socket.next().await {
        let frame = match frame {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(error = %e, "websocket frame error");
                break;
            }
        };

        let WsMessage::Text(text) = frame else {
            continue;
        };

        let body: serde_json::Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "failed to parse websocket frame as JSON");
                continue;
            }
        };

        let message = Message::new(uuid::Uuid::now_v7().to_string(), body, "websocket");
        if let Some(event) = message.into_event() {
            let _ = state.dispatcher.dispatch(event, None).await;
        }
    }

    state.live_connections.fetch_sub(1, Ordering::Relaxed);
    tracing::debug!("websocket push connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{EventRouter, HandlerOptions};
    use crate::state_store::InMemoryStateStore;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn dispatcher_with(router: EventRouter) -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(
            Arc::new(router),
            Arc::new(InMemoryStateStore::new()),
            4,
        ))
    }

    #[tokio::test]
    async fn test_dispatch_one_acks_on_success() {
        let router = EventRouter::new();
        router
            .route(
                "checkout.complete",
                |_ctx| async { Ok(serde_json::json!({"ok": true})) },
                HandlerOptions {
                    name: Some("validate".into()),
                    ..Default::default()
                },
            )
            .unwrap();

        let dispatcher = dispatcher_with(router);
        let message = Message::new(
            "m1",
            serde_json::json!({"type": "checkout.complete", "data": {}}),
            "webhook",
        );
        let response = dispatch_one(&dispatcher, message).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_dispatch_one_returns_500_on_handler_failure() {
        let router = EventRouter::new();
        router
            .route(
                "checkout.complete",
                |_ctx| async { Err(Error::handler_failed("validate", "boom")) },
                HandlerOptions {
                    name: Some("validate".into()),
                    retry_policy: Some(Arc::new(crate::retry::NoRetry)),
                    ..Default::default()
                },
            )
            .unwrap();

        let dispatcher = dispatcher_with(router);
        let message = Message::new(
            "m2",
            serde_json::json!({"type": "checkout.complete", "data": {}}),
            "webhook",
        );
        let response = dispatch_one(&dispatcher, message).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_dispatch_one_acks_message_without_type() {
        let router = EventRouter::new();
        let dispatcher = dispatcher_with(router);
        let message = Message::new("m3", serde_json::json!({"no": "type"}), "webhook");
        let response = dispatch_one(&dispatcher, message).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_webhook_endpoint_dispatches_posted_event() {
        let router = EventRouter::new();
        router
            .route(
                "checkout.complete",
                |_ctx| async { Ok(serde_json::json!({"ok": true})) },
                HandlerOptions {
                    name: Some("validate".into()),
                    ..Default::default()
                },
            )
            .unwrap();

        let consumer = PushConsumer::new(dispatcher_with(router), PushConsumerConfig::default());
        let app = consumer.router();

        let request = Request::builder()
            .method("POST")
            .uri("/events")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({"type": "checkout.complete", "data": {}}).to_string(),
            ))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_webhook_endpoint_rejects_non_json_body() {
        let router = EventRouter::new();
        let consumer = PushConsumer::new(dispatcher_with(router), PushConsumerConfig::default());
        let app = consumer.router();

        let request = Request::builder()
            .method("POST")
            .uri("/events")
            .header("content-type", "application/json")
            .body(Body::from("not json"))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
