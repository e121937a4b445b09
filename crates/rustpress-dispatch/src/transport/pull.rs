//! Pull transport: a long-running poll loop against a remote queue.
//!
//! The workspace carries no AWS SDK crate, so [`PullQueue`] is a
//! transport-agnostic trait (mirroring an SQS-style contract:
//! long-poll receive, visibility timeout, chunked delete, change
//! visibility, send) with a concrete implementation backed by the
//! `redis`/`deadpool-redis` crates already in the dependency stack.
//! A list holds pending bodies; an in-flight set (sorted set scored by
//! visibility deadline, plus a parallel hash of bodies) tracks
//! messages that have been received but not yet acked or nacked.

use crate::dispatcher::{Dispatcher, VisibilityExtender};
use crate::metrics::Metrics;
use async_trait::async_trait;
use rustpress_core::error::{Error, Result};
use rustpress_events::bus::Consumer;
use rustpress_events::event::Message;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{Notify, Semaphore};

/// SQS-style contract a pull consumer polls against.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PullQueue: Send + Sync {
    async fn receive(
        &self,
        max_messages: u32,
        wait_time_secs: u64,
        visibility_timeout_secs: u64,
    ) -> Result<Vec<Message>>;

    async fn delete_batch(&self, ack_handles: &[String]) -> Result<()>;

    async fn change_visibility(&self, ack_handle: &str, seconds: u64) -> Result<()>;

    async fn send(&self, body: serde_json::Value) -> Result<()>;
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Redis-list-backed pull queue. `queue_key` is the pending list
/// (`RPUSH` by producers, `BLPOP`/`LPOP` by the consumer);
/// `processing_zset`/`processing_hash` track in-flight receipts keyed
/// by a generated ack handle, scored by visibility deadline so expired
/// receipts can be reclaimed.
pub struct RedisPullQueue {
    pool: deadpool_redis::Pool,
    queue_key: String,
}

impl RedisPullQueue {
    pub fn new(pool: deadpool_redis::Pool, queue_name: impl Into<String>) -> Self {
        Self {
            pool,
            queue_key: queue_name.into(),
        }
    }

    fn processing_zset(&self) -> String {
        format!("{}:processing", self.queue_key)
    }

    fn processing_hash(&self) -> String {
        format!("{}:processing:bodies", self.queue_key)
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::transport_with_source("failed to acquire redis connection", e))
    }

    async fn reclaim_expired(&self, conn: &mut deadpool_redis::Connection) -> Result<()> {
        use redis::AsyncCommands;
        let now = now_secs();
        let expired: Vec<String> = conn
            .zrangebyscore(self.processing_zset(), 0, now)
            .await
            .map_err(|e| Error::transport_with_source("redis ZRANGEBYSCORE failed", e))?;

        for handle in expired {
            let body: Option<String> = conn
                .hget(self.processing_hash(), &handle)
                .await
                .map_err(|e| Error::transport_with_source("redis HGET failed", e))?;
            if let Some(body) = body {
                let _: () = conn
                    .rpush(&self.queue_key, body)
                    .await
                    .map_err(|e| Error::transport_with_source("redis RPUSH failed", e))?;
            }
            let _: () = conn
                .zrem(self.processing_zset(), &handle)
                .await
                .map_err(|e| Error::transport_with_source("redis ZREM failed", e))?;
            let _: () = conn
                .hdel(self.processing_hash(), &handle)
                .await
                .map_err(|e| Error::transport_with_source("redis HDEL failed", e))?;
            tracing::warn!(ack_handle = %handle, "reclaimed expired in-flight message");
        }
        Ok(())
    }
}

#[async_trait]
impl PullQueue for RedisPullQueue {
    async fn receive(
        &self,
        max_messages: u32,
        wait_time_secs: u64,
        visibility_timeout_secs: u64,
    ) -> Result<Vec<Message>> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        self.reclaim_expired(&mut conn).await?;

        let mut out = Vec::new();

        let first: Option<(String, String)> = conn
            .blpop(&self.queue_key, wait_time_secs as f64)
            .await
            .map_err(|e| Error::transport_with_source("redis BLPOP failed", e))?;

        let Some((_, raw)) = first else {
            return Ok(out);
        };

        let mut bodies = vec![raw];
        while bodies.len() < max_messages as usize {
            let next: Option<String> = conn
                .lpop(&self.queue_key, None)
                .await
                .map_err(|e| Error::transport_with_source("redis LPOP failed", e))?;
            match next {
                Some(b) => bodies.push(b),
                None => break,
            }
        }

        for raw in bodies {
            let ack_handle = uuid::Uuid::now_v7().to_string();
            let visible_at = now_secs() + visibility_timeout_secs as i64;

            let _: () = conn
                .hset(self.processing_hash(), &ack_handle, &raw)
                .await
                .map_err(|e| Error::transport_with_source("redis HSET failed", e))?;
            let _: () = conn
                .zadd(self.processing_zset(), &ack_handle, visible_at)
                .await
                .map_err(|e| Error::transport_with_source("redis ZADD failed", e))?;

            let body: serde_json::Value = serde_json::from_str(&raw)
                .unwrap_or_else(|_| serde_json::Value::String(raw.clone()));

            out.push(Message::new(ack_handle.clone(), body, "redis").with_ack_handle(ack_handle));
        }

        Ok(out)
    }

    async fn delete_batch(&self, ack_handles: &[String]) -> Result<()> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        for chunk in ack_handles.chunks(10) {
            for handle in chunk {
                let _: () = conn
                    .zrem(self.processing_zset(), handle)
                    .await
                    .map_err(|e| Error::transport_with_source("redis ZREM failed", e))?;
                let _: () = conn
                    .hdel(self.processing_hash(), handle)
                    .await
                    .map_err(|e| Error::transport_with_source("redis HDEL failed", e))?;
            }
        }
        Ok(())
    }

    async fn change_visibility(&self, ack_handle: &str, seconds: u64) -> Result<()> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;

        if seconds == 0 {
            let body: Option<String> = conn
                .hget(self.processing_hash(), ack_handle)
                .await
                .map_err(|e| Error::transport_with_source("redis HGET failed", e))?;
            if let Some(body) = body {
                let _: () = conn
                    .rpush(&self.queue_key, body)
                    .await
                    .map_err(|e| Error::transport_with_source("redis RPUSH failed", e))?;
            }
            let _: () = conn
                .zrem(self.processing_zset(), ack_handle)
                .await
                .map_err(|e| Error::transport_with_source("redis ZREM failed", e))?;
            let _: () = conn
                .hdel(self.processing_hash(), ack_handle)
                .await
                .map_err(|e| Error::transport_with_source("redis HDEL failed", e))?;
        } else {
            let visible_at = now_secs() + seconds as i64;
            let _: () = conn
                .zadd(self.processing_zset(), ack_handle, visible_at)
                .await
                .map_err(|e| Error::transport_with_source("redis ZADD failed", e))?;
        }
        Ok(())
    }

    async fn send(&self, body: serde_json::Value) -> Result<()> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        let raw = serde_json::to_string(&body)
            .map_err(|e| Error::transport(format!("serialize message: {e}")))?;
        let _: () = conn
            .rpush(&self.queue_key, raw)
            .await
            .map_err(|e| Error::transport_with_source("redis RPUSH failed", e))?;
        Ok(())
    }
}

struct QueueVisibilityExtender(Arc<dyn PullQueue>);

#[async_trait]
impl VisibilityExtender for QueueVisibilityExtender {
    async fn extend_visibility(&self, ack_handle: &str, seconds: u64) -> Result<()> {
        self.0.change_visibility(ack_handle, seconds).await
    }
}

/// Poll loop configuration.
#[derive(Debug, Clone)]
pub struct PullConsumerConfig {
    pub max_batch: u32,
    pub wait_time_secs: u64,
    pub visibility_timeout_secs: u64,
    pub max_concurrent_messages: usize,
    pub max_retries: u32,
    pub poll_interval_secs: u64,
}

impl Default for PullConsumerConfig {
    fn default() -> Self {
        Self {
            max_batch: 10,
            wait_time_secs: 10,
            visibility_timeout_secs: 30,
            max_concurrent_messages: 8,
            max_retries: 5,
            poll_interval_secs: 1,
        }
    }
}

/// Long-running poll loop driving the dispatcher from a [`PullQueue`].
pub struct PullConsumer {
    queue: Arc<dyn PullQueue>,
    dlq: Option<Arc<dyn PullQueue>>,
    dispatcher: Arc<Dispatcher>,
    config: PullConsumerConfig,
    shutdown: Arc<Notify>,
    running: Arc<AtomicBool>,
    metrics: Metrics,
}

impl PullConsumer {
    pub fn new(
        queue: Arc<dyn PullQueue>,
        dlq: Option<Arc<dyn PullQueue>>,
        dispatcher: Arc<Dispatcher>,
        config: PullConsumerConfig,
    ) -> Self {
        Self::with_metrics(queue, dlq, dispatcher, config, Metrics::default())
    }

    pub fn with_metrics(
        queue: Arc<dyn PullQueue>,
        dlq: Option<Arc<dyn PullQueue>>,
        dispatcher: Arc<Dispatcher>,
        config: PullConsumerConfig,
        metrics: Metrics,
    ) -> Self {
        Self {
            queue,
            dlq,
            dispatcher,
            config,
            shutdown: Arc::new(Notify::new()),
            running: Arc::new(AtomicBool::new(false)),
            metrics,
        }
    }

    async fn handle_one(&self, message: Message, semaphore: Arc<Semaphore>) {
        let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
        let ack_handle = message.ack_handle.clone();
        let body = message.body.clone();

        let Some(event) = message.into_event() else {
            tracing::warn!("pull message carried no `type`, acking as handled");
            if let Some(handle) = ack_handle {
                self.ack(&handle).await;
            }
            return;
        };

        let extender: Arc<dyn VisibilityExtender> = Arc::new(QueueVisibilityExtender(self.queue.clone()));
        let ok = self.dispatcher.dispatch(event, Some(extender)).await;

        let Some(handle) = ack_handle else { return };
        if ok {
            self.ack(&handle).await;
        } else {
            self.nack(&handle, body, true).await;
        }
    }

    async fn ack(&self, ack_handle: &str) {
        let handles = vec![ack_handle.to_string()];
        if let Err(e) = self.queue.delete_batch(&handles).await {
            tracing::warn!(ack_handle, error = %e, "ack failed");
        }
    }

    async fn nack(&self, ack_handle: &str, body: serde_json::Value, requeue: bool) {
        if requeue {
            if let Some(dlq) = &self.dlq {
                let event_type = body.get("type").and_then(|v| v.as_str()).unwrap_or("unknown").to_string();
                tracing::warn!(ack_handle, "forwarding failed message to dead-letter queue");
                if let Err(e) = dlq.send(body).await {
                    tracing::error!(ack_handle, error = %e, "dlq forward failed");
                } else {
                    self.metrics.record_dlq_send(&event_type);
                }
                let handles = vec![ack_handle.to_string()];
                if let Err(e) = self.queue.delete_batch(&handles).await {
                    tracing::warn!(ack_handle, error = %e, "delete after dlq forward failed");
                }
                return;
            }
        }
        if let Err(e) = self.queue.change_visibility(ack_handle, 0).await {
            tracing::warn!(ack_handle, error = %e, "nack (reset visibility) failed");
        }
    }
}

#[async_trait]
impl Consumer for PullConsumer {
    async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::ConsumerAlreadyRunning);
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_messages.max(1)));
        let mut consecutive_errors = 0u32;
        let backoff = crate::backoff::ExponentialBackoff::default();

        loop {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            let shutdown = self.shutdown.notified();
            tokio::pin!(shutdown);

            let received = tokio::select! {
                r = self.queue.receive(self.config.max_batch, self.config.wait_time_secs, self.config.visibility_timeout_secs) => r,
                _ = &mut shutdown => {
                    tracing::info!("pull consumer received shutdown signal");
                    break;
                }
            };

            let messages = match received {
                Ok(m) => {
                    consecutive_errors = 0;
                    m
                }
                Err(e) => {
                    consecutive_errors += 1;
                    self.metrics.record_poll_error();
                    tracing::warn!(error = %e, attempt = consecutive_errors, "receive failed");
                    if consecutive_errors >= self.config.max_retries {
                        tracing::error!("receive retries exhausted, stopping consumer");
                        self.running.store(false, Ordering::SeqCst);
                        return Err(Error::ConsumerStartFailed {
                            message: "poll retries exhausted".to_string(),
                        });
                    }
                    tokio::time::sleep(tokio::time::Duration::from_secs_f64(backoff.next_delay(consecutive_errors)))
                        .await;
                    continue;
                }
            };

            if messages.is_empty() {
                tokio::time::sleep(tokio::time::Duration::from_secs(self.config.poll_interval_secs)).await;
                continue;
            }

            let mut handles = Vec::with_capacity(messages.len());
            for message in messages {
                let semaphore = semaphore.clone();
                handles.push(self.handle_one(message, semaphore));
            }
            futures::future::join_all(handles).await;
        }

        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::NoRetry;
    use crate::router::{EventRouter, HandlerOptions};
    use crate::state_store::InMemoryStateStore;
    use mockall::predicate::eq;

    fn dispatcher_with(router: EventRouter) -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(
            Arc::new(router),
            Arc::new(InMemoryStateStore::new()),
            4,
        ))
    }

    fn message_for(event_type: &str, ack_handle: &str) -> Message {
        Message::new(
            "m1",
            serde_json::json!({"type": event_type, "data": {}}),
            "redis",
        )
        .with_ack_handle(ack_handle)
    }

    fn consumer_with(
        queue: MockPullQueue,
        dlq: Option<MockPullQueue>,
        dispatcher: Arc<Dispatcher>,
    ) -> PullConsumer {
        PullConsumer::new(
            Arc::new(queue),
            dlq.map(|d| Arc::new(d) as Arc<dyn PullQueue>),
            dispatcher,
            PullConsumerConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_handle_one_acks_on_success() {
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

        let mut queue = MockPullQueue::new();
        queue
            .expect_delete_batch()
            .with(eq(vec!["handle-1".to_string()]))
            .times(1)
            .returning(|_| Ok(()));

        let consumer = consumer_with(queue, None, dispatcher_with(router));
        let message = message_for("checkout.complete", "handle-1");
        consumer.handle_one(message, Arc::new(Semaphore::new(1))).await;
    }

    #[tokio::test]
    async fn test_handle_one_acks_message_without_type() {
        let router = EventRouter::new();
        let mut queue = MockPullQueue::new();
        queue
            .expect_delete_batch()
            .with(eq(vec!["handle-2".to_string()]))
            .times(1)
            .returning(|_| Ok(()));

        let consumer = consumer_with(queue, None, dispatcher_with(router));
        let message = Message::new("m2", serde_json::json!({"no": "type"}), "redis").with_ack_handle("handle-2");
        consumer.handle_one(message, Arc::new(Semaphore::new(1))).await;
    }

    /// S6: a nacked message with a configured DLQ is forwarded there with
    /// its original body, then removed from the main queue.
    #[tokio::test]
    async fn test_handle_one_forwards_original_body_to_dlq_on_nack() {
        let router = EventRouter::new();
        router
            .route(
                "checkout.complete",
                |_ctx| async { Err(Error::handler_failed("validate", "boom")) },
                HandlerOptions {
                    name: Some("validate".into()),
                    retry_policy: Some(Arc::new(NoRetry)),
                    ..Default::default()
                },
            )
            .unwrap();

        let body = serde_json::json!({"type": "checkout.complete", "data": {"amount": 42}});

        let mut queue = MockPullQueue::new();
        queue
            .expect_delete_batch()
            .with(eq(vec!["handle-3".to_string()]))
            .times(1)
            .returning(|_| Ok(()));

        let mut dlq = MockPullQueue::new();
        dlq.expect_send()
            .withf(move |sent: &serde_json::Value| {
                sent.get("type").and_then(|v| v.as_str()) == Some("checkout.complete")
                    && sent["data"]["amount"] == 42
            })
            .times(1)
            .returning(|_| Ok(()));

        let consumer = consumer_with(queue, Some(dlq), dispatcher_with(router));
        let message = Message::new("m3", body, "redis").with_ack_handle("handle-3");
        consumer.handle_one(message, Arc::new(Semaphore::new(1))).await;
    }

    #[tokio::test]
    async fn test_dlq_forward_records_metric() {
        let router = EventRouter::new();
        router
            .route(
                "checkout.complete",
                |_ctx| async { Err(Error::handler_failed("validate", "boom")) },
                HandlerOptions {
                    name: Some("validate".into()),
                    retry_policy: Some(Arc::new(NoRetry)),
                    ..Default::default()
                },
            )
            .unwrap();

        let mut queue = MockPullQueue::new();
        queue.expect_delete_batch().returning(|_| Ok(()));
        let mut dlq = MockPullQueue::new();
        dlq.expect_send().returning(|_| Ok(()));

        let metrics = Metrics::new();
        let consumer = PullConsumer::with_metrics(
            Arc::new(queue),
            Some(Arc::new(dlq)),
            dispatcher_with(router),
            PullConsumerConfig::default(),
            metrics.clone(),
        );
        let message = message_for("checkout.complete", "handle-5");
        consumer.handle_one(message, Arc::new(Semaphore::new(1))).await;

        let mut registry = prometheus_client::registry::Registry::default();
        metrics.register(&mut registry);
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &registry).unwrap();
        assert!(buf.contains("dlq_sends_total"));
    }

    #[tokio::test]
    async fn test_handle_one_resets_visibility_on_nack_without_dlq() {
        let router = EventRouter::new();
        router
            .route(
                "checkout.complete",
                |_ctx| async { Err(Error::handler_failed("validate", "boom")) },
                HandlerOptions {
                    name: Some("validate".into()),
                    retry_policy: Some(Arc::new(NoRetry)),
                    ..Default::default()
                },
            )
            .unwrap();

        let mut queue = MockPullQueue::new();
        queue
            .expect_change_visibility()
            .with(eq("handle-4"), eq(0u64))
            .times(1)
            .returning(|_, _| Ok(()));

        let consumer = consumer_with(queue, None, dispatcher_with(router));
        let message = message_for("checkout.complete", "handle-4");
        consumer.handle_one(message, Arc::new(Semaphore::new(1))).await;
    }
}
