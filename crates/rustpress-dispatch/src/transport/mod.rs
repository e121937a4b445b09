//! Message transports: pull (poll loop against a remote queue) and
//! push (inbound HTTP/WebSocket) consumers.

pub mod pull;
pub mod push;

pub use pull::{PullConsumer, PullConsumerConfig, PullQueue, RedisPullQueue};
pub use push::{PushConsumer, PushConsumerConfig};
