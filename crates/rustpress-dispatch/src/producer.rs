//! Concrete [`Producer`] implementations: publish an [`Event`] onto a
//! Redis list or over HTTP to a downstream collector.

use async_trait::async_trait;
use rustpress_core::error::{Error, Result};
use rustpress_events::bus::Producer;
use rustpress_events::event::Event;

/// Publishes events onto a Redis list, the same wire shape
/// [`crate::transport::pull::RedisPullQueue`] consumes from.
pub struct RedisProducer {
    pool: deadpool_redis::Pool,
    queue_key: String,
}

impl RedisProducer {
    pub fn new(pool: deadpool_redis::Pool, queue_key: impl Into<String>) -> Self {
        Self {
            pool,
            queue_key: queue_key.into(),
        }
    }
}

#[async_trait]
impl Producer for RedisProducer {
    async fn publish(&self, event: Event) -> Result<()> {
        use redis::AsyncCommands;
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| Error::PublishFailed {
                message: "failed to acquire redis connection".to_string(),
                source: Some(Box::new(e)),
            })?;

        let body = serde_json::json!({"type": event.event_type.as_str(), "data": event.data});
        let raw = serde_json::to_string(&body)
            .map_err(|e| Error::PublishFailed {
                message: format!("serialize event: {e}"),
                source: None,
            })?;

        let _: () = conn
            .rpush(&self.queue_key, raw)
            .await
            .map_err(|e| Error::PublishFailed {
                message: "redis RPUSH failed".to_string(),
                source: Some(Box::new(e)),
            })?;
        Ok(())
    }
}

/// Publishes events as JSON `POST` requests to a downstream HTTP
/// endpoint (for example, another service's push consumer).
pub struct HttpProducer {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpProducer {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl Producer for HttpProducer {
    async fn publish(&self, event: Event) -> Result<()> {
        let body = serde_json::json!({"type": event.event_type.as_str(), "data": event.data});

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::PublishFailed {
                message: format!("request to {} failed", self.endpoint),
                source: Some(Box::new(e)),
            })?;

        if !response.status().is_success() {
            return Err(Error::PublishFailed {
                message: format!("{} responded with {}", self.endpoint, response.status()),
                source: None,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fake::{Dummy, Fake, Faker};

    /// A fixture payload shape for producer tests, generated with `fake`
    /// rather than hand-written literals.
    #[derive(Debug, Dummy, serde::Serialize)]
    struct OrderPayload {
        order_id: u32,
        #[dummy(faker = "0.0..500.0")]
        amount: f64,
        customer_email: String,
    }

    #[tokio::test]
    async fn test_http_producer_publishes_fake_payload() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path("/events"))
            .respond_with(wiremock::ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let payload: OrderPayload = Faker.fake();
        let data = serde_json::to_value(&payload).unwrap();

        let producer = HttpProducer::new(format!("{}/events", server.uri()));
        let event = Event::new("checkout.complete", data);
        producer.publish(event).await.unwrap();
    }

    #[tokio::test]
    async fn test_http_producer_publishes_successfully() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path("/events"))
            .respond_with(wiremock::ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let producer = HttpProducer::new(format!("{}/events", server.uri()));
        let event = Event::new("checkout.complete", serde_json::json!({"amount": 10}));
        producer.publish(event).await.unwrap();
    }

    #[tokio::test]
    async fn test_http_producer_reports_failure_status() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path("/events"))
            .respond_with(wiremock::ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let producer = HttpProducer::new(format!("{}/events", server.uri()));
        let event = Event::new("checkout.complete", serde_json::json!({"amount": 10}));
        assert!(producer.publish(event).await.is_err());
    }
}
