//! # RustPress Dispatch
//!
//! The handler-graph dispatcher: backoff and retry policies, DAG
//! validation, handler routing, the state store abstraction, the
//! pull/push message transports, outbound producers, and the
//! configuration-driven factory that wires them together.

pub mod backoff;
pub mod dispatcher;
pub mod factory;
pub mod graph;
pub mod metrics;
pub mod producer;
pub mod retry;
pub mod router;
pub mod state_store;
pub mod transport;

pub use backoff::{Backoff, ExponentialBackoff, FixedBackoff};
pub use dispatcher::{Dispatcher, VisibilityExtender};
pub use factory::EventBusFactory;
pub use metrics::Metrics;
pub use producer::{HttpProducer, RedisProducer};
pub use retry::{ExponentialRetry, NoRetry, RetryPolicy};
pub use router::{EventRouter, HandlerContext, HandlerOptions, HandlerSpec};
pub use state_store::{
    in_memory, HandlerState, HandlerStatus, InMemoryStateStore, MessageState, OverallStatus,
    RedisStateStore, StateStore,
};
pub use transport::{PullConsumer, PullConsumerConfig, PullQueue, PushConsumer, PushConsumerConfig, RedisPullQueue};
