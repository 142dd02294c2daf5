//! Queue bridge worker.
//!
//! Consumes messages from a durable RabbitMQ queue and POSTs each body to a
//! single HTTP endpoint. A 2xx response acks the message; anything else
//! nacks it with requeue so the broker redelivers it.
//!
//! ## Architecture
//!
//! ```text
//! RabbitMQ queue → ConsumerLoop (prefetch 1) → HttpForwarder → target API
//!                        ▲                            │
//!                        └──── ack / nack(requeue) ◀──┘
//! ```

pub mod broker;
pub mod config;
pub mod consumer;
pub mod error;
pub mod forwarder;
pub mod shutdown;

pub use broker::AmqpBroker;
pub use config::{QueueDeclare, Settings};
pub use consumer::{ConsumerLoop, Resolution, PREFETCH_COUNT};
pub use error::{BrokerError, ConfigError};
pub use forwarder::{Forward, HttpForwarder};
