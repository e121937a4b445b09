//! Maps a [`BusConfig`] to a wired-up [`EventBus`], resolving each
//! tagged `state_store`/`consumers`/`producer` entry to the matching
//! concrete transport constructor, the way a binary built on this
//! crate would otherwise do by hand.

use crate::dispatcher::Dispatcher;
use crate::metrics::Metrics;
use crate::producer::{HttpProducer, RedisProducer};
use crate::router::EventRouter;
use crate::state_store::{InMemoryStateStore, RedisStateStore, StateStore};
use crate::transport::{PullConsumer, PullConsumerConfig, PullQueue, PushConsumer, PushConsumerConfig, RedisPullQueue};
use prometheus_client::registry::Registry;
use rustpress_core::config::{BusConfig, ConsumerConfig, ProducerConfig, StateStoreConfig};
use rustpress_core::error::{Error, Result};
use rustpress_events::bus::{Consumer, EventBus, EventBusBuilder, Producer};
use std::sync::Arc;

/// Builds a state store, dispatcher, producer, and (at most one)
/// consumer from a [`BusConfig`], wiring them into an [`EventBus`].
///
/// The router is supplied separately because handler registration is
/// application code, not configuration.
pub struct EventBusFactory;

impl EventBusFactory {
    /// Builds the bus without exposing its metrics registry, for callers
    /// that don't scrape Prometheus.
    pub async fn from_config(config: &BusConfig, router: Arc<EventRouter>) -> Result<EventBus> {
        let mut registry = Registry::default();
        let (bus, _metrics) = Self::from_config_with_registry(config, router, &mut registry).await?;
        Ok(bus)
    }

    /// Builds the bus and registers its metrics (dispatched messages,
    /// handler attempts/retries/duration, DLQ sends, poll errors) under
    /// `registry`, returning the shared [`Metrics`] handle alongside the
    /// bus. The dispatcher and any pull consumer built here report into
    /// the same `Metrics` instance.
    pub async fn from_config_with_registry(
        config: &BusConfig,
        router: Arc<EventRouter>,
        registry: &mut Registry,
    ) -> Result<(EventBus, Metrics)> {
        config.dispatcher.validate()?;
        let metrics = Metrics::new();
        metrics.register(registry);

        let state_store = build_state_store(&config.state_store).await?;
        let dispatcher = Arc::new(Dispatcher::with_metrics(
            router,
            state_store,
            config.dispatcher.concurrency_limit,
            metrics.clone(),
        ));

        let mut builder = EventBusBuilder::new();

        if let Some(producer_config) = &config.producer {
            let producer = build_producer(producer_config).await?;
            builder = builder.producer(producer);
        }

        if let Some((name, consumer_config)) = config.consumers.iter().next() {
            consumer_config.validate()?;
            let consumer = build_consumer(consumer_config, dispatcher.clone(), metrics.clone()).await?;
            tracing::info!(consumer = %name, "wiring consumer from configuration");
            builder = builder.consumer(consumer);
        }

        Ok((builder.build(), metrics))
    }
}

async fn build_state_store(config: &StateStoreConfig) -> Result<Arc<dyn StateStore>> {
    match config {
        StateStoreConfig::InMemory => Ok(Arc::new(InMemoryStateStore::new())),
        StateStoreConfig::Redis { url, ttl_seconds } => {
            let cfg = deadpool_redis::Config::from_url(url);
            let pool = cfg
                .create_pool(Some(deadpool_redis::Runtime::Tokio1))
                .map_err(|e| Error::Configuration {
                    message: format!("failed to build redis pool: {e}"),
                })?;
            Ok(Arc::new(RedisStateStore::new(pool, *ttl_seconds)))
        }
    }
}

async fn build_producer(config: &ProducerConfig) -> Result<Arc<dyn Producer>> {
    match config {
        ProducerConfig::Redis { url } => {
            let cfg = deadpool_redis::Config::from_url(url);
            let pool = cfg
                .create_pool(Some(deadpool_redis::Runtime::Tokio1))
                .map_err(|e| Error::Configuration {
                    message: format!("failed to build redis pool: {e}"),
                })?;
            Ok(Arc::new(RedisProducer::new(pool, "events")))
        }
        ProducerConfig::Http { endpoint } => Ok(Arc::new(HttpProducer::new(endpoint.clone()))),
    }
}

async fn build_consumer(config: &ConsumerConfig, dispatcher: Arc<Dispatcher>, metrics: Metrics) -> Result<Arc<dyn Consumer>> {
    match config {
        ConsumerConfig::Queue { .. } => Err(Error::NotImplemented {
            operation: "queue consumer: no queue-specific SDK in this workspace, use redis".to_string(),
        }),
        ConsumerConfig::Redis {
            url,
            dlq_uri,
            visibility_timeout,
            wait_time,
            max_messages,
            poll_interval,
            concurrency,
            max_retries,
        } => {
            let cfg = deadpool_redis::Config::from_url(url);
            let pool = cfg
                .create_pool(Some(deadpool_redis::Runtime::Tokio1))
                .map_err(|e| Error::Configuration {
                    message: format!("failed to build redis pool: {e}"),
                })?;
            let queue: Arc<dyn PullQueue> = Arc::new(RedisPullQueue::new(pool, "events"));

            let dlq: Option<Arc<dyn PullQueue>> = match dlq_uri {
                Some(uri) => {
                    let dlq_cfg = deadpool_redis::Config::from_url(uri);
                    let dlq_pool =
                        dlq_cfg
                            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
                            .map_err(|e| Error::Configuration {
                                message: format!("failed to build dlq redis pool: {e}"),
                            })?;
                    Some(Arc::new(RedisPullQueue::new(dlq_pool, "events:dlq")))
                }
                None => None,
            };

            let consumer_config = PullConsumerConfig {
                max_batch: *max_messages,
                wait_time_secs: *wait_time,
                visibility_timeout_secs: *visibility_timeout,
                max_concurrent_messages: *concurrency,
                max_retries: *max_retries,
                poll_interval_secs: *poll_interval,
            };

            Ok(Arc::new(PullConsumer::with_metrics(
                queue,
                dlq,
                dispatcher,
                consumer_config,
                metrics,
            )))
        }
        ConsumerConfig::Webhook { endpoint } => {
            let addr = endpoint.parse().map_err(|e| Error::Configuration {
                message: format!("invalid webhook endpoint {endpoint}: {e}"),
            })?;
            let push_config = PushConsumerConfig {
                bind_addr: addr,
                http_path: "/events".to_string(),
                websocket_path: None,
            };
            Ok(Arc::new(PushConsumer::new(dispatcher, push_config)))
        }
        ConsumerConfig::WebSocket { endpoint, channel } => {
            let addr = endpoint.parse().map_err(|e| Error::Configuration {
                message: format!("invalid websocket endpoint {endpoint}: {e}"),
            })?;
            tracing::debug!(channel = %channel, "websocket consumer ignores channel filtering at the transport level");
            let push_config = PushConsumerConfig {
                bind_addr: addr,
                http_path: "/events".to_string(),
                websocket_path: Some("/events/ws".to_string()),
            };
            Ok(Arc::new(PushConsumer::new(dispatcher, push_config)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_factory_builds_in_memory_bus_with_no_consumer() {
        let config = BusConfig::default();
        let router = Arc::new(EventRouter::new());
        let bus = EventBusFactory::from_config(&config, router).await.unwrap();
        assert!(bus.event_types().is_empty());
    }

    #[tokio::test]
    async fn test_factory_rejects_timeout_above_max() {
        let config = BusConfig {
            dispatcher: rustpress_core::config::DispatcherConfig {
                default_timeout_seconds: 600,
                ..rustpress_core::config::DispatcherConfig::default()
            },
            ..BusConfig::default()
        };
        let router = Arc::new(EventRouter::new());
        assert!(EventBusFactory::from_config(&config, router).await.is_err());
    }

    #[tokio::test]
    async fn test_factory_with_registry_exposes_metrics() {
        let config = BusConfig::default();
        let router = Arc::new(EventRouter::new());
        let mut registry = Registry::default();
        let (bus, _metrics) = EventBusFactory::from_config_with_registry(&config, router, &mut registry)
            .await
            .unwrap();
        assert!(bus.event_types().is_empty());

        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &registry).unwrap();
        assert!(buf.contains("dispatched_total"));
    }
}
