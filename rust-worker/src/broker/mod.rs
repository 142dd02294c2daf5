//! Broker abstraction used by the consumer loop.
//!
//! The traits mirror the AMQP lifecycle one step at a time:
//!
//! ```text
//! Broker::connect → BrokerConnection::create_channel → BrokerChannel::{declare_queue, set_prefetch, consume}
//!                                                   → DeliveryStream::next_delivery → Acknowledge::{ack, nack_requeue}
//! ```
//!
//! [`amqp`] implements them on top of lapin. Tests drive the loop with an
//! in-memory implementation instead.

pub mod amqp;

use async_trait::async_trait;

use crate::config::QueueDeclare;
use crate::error::BrokerError;

pub use amqp::AmqpBroker;

/// Entry point that dials the broker.
#[async_trait]
pub trait Broker: Send + Sync {
    type Connection: BrokerConnection;

    async fn connect(&self) -> Result<Self::Connection, BrokerError>;
}

/// A live connection. Owned by exactly one loop iteration.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    type Channel: BrokerChannel;

    async fn create_channel(&self) -> Result<Self::Channel, BrokerError>;

    /// Close the connection. Errors are logged, never returned.
    async fn close(self);
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    type Deliveries: DeliveryStream;

    async fn declare_queue(&self, queue: &str, policy: QueueDeclare) -> Result<(), BrokerError>;

    /// Limit unacknowledged deliveries on this consumer to `count`.
    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError>;

    /// Start a manual-ack, non-exclusive consumer on `queue`.
    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> Result<Self::Deliveries, BrokerError>;

    async fn close(self);
}

/// Stream of deliveries for one consumer.
#[async_trait]
pub trait DeliveryStream: Send {
    type Delivery: Acknowledge;

    /// Next delivery, or `None` once the stream has closed.
    async fn next_delivery(&mut self) -> Option<Result<Self::Delivery, BrokerError>>;
}

/// A consumed message that must be resolved exactly once.
#[async_trait]
pub trait Acknowledge: Send {
    fn payload(&self) -> &[u8];

    fn delivery_tag(&self) -> u64;

    async fn ack(self) -> Result<(), BrokerError>;

    /// Negative-acknowledge and put the message back on the queue.
    async fn nack_requeue(self) -> Result<(), BrokerError>;
}
