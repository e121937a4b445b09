//! # RustPress Events
//!
//! Message/event data model, the subscriber middleware chain, and the
//! event bus facade that ties producers, consumers, and in-process
//! subscribers together.

pub mod bus;
pub mod event;
pub mod subscriber;

pub use bus::{Consumer, EventBus, EventBusBuilder, EventBusConfig, Producer};
pub use event::{Event, EventType, Message};
pub use subscriber::{
    compose, EventHandler, GroupMiddleware, LoggingMiddleware, RetryMiddleware, Subscriber,
    SubscriberBuilder, SubscriberConfig, SubscriberMiddleware,
};
