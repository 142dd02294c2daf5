//! Consumer loop: keeps one broker connection alive and forwards every
//! delivery to the downstream endpoint.
//!
//! The loop is an explicit state machine:
//!
//! ```text
//! Disconnected ──connect ok──▶ Connected ──setup ok──▶ Streaming
//!      ▲  │                        │                      │
//!      │  └─connect failed         └─setup failed         └─stream closed
//!      └──────────── fixed backoff ◀───────────────────────┘
//! ```
//!
//! Only one delivery is handled at a time. It is acked when the forwarder
//! accepts it and nacked with requeue otherwise.

use std::borrow::Cow;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::broker::{Acknowledge, Broker, BrokerChannel, BrokerConnection, DeliveryStream};
use crate::config::Settings;
use crate::error::BrokerError;
use crate::forwarder::Forward;

/// Unacknowledged deliveries allowed per consumer.
pub const PREFETCH_COUNT: u16 = 1;

/// Longest slice of a message body written to debug logs.
const BODY_PREVIEW_LIMIT: usize = 500;

type ChannelOf<B> = <<B as Broker>::Connection as BrokerConnection>::Channel;
type DeliveriesOf<B> = <ChannelOf<B> as BrokerChannel>::Deliveries;

/// How a single delivery was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Acked,
    Requeued,
}

/// Why a streaming epoch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    Closed,
    Shutdown,
}

/// Connection and channel owned by one loop iteration.
///
/// `release` closes the channel before the connection and is called on every
/// path that leaves the `Connected` or `Streaming` state.
struct Link<C: BrokerConnection> {
    connection: C,
    channel: Option<C::Channel>,
}

impl<C: BrokerConnection> Link<C> {
    fn new(connection: C) -> Self {
        Self {
            connection,
            channel: None,
        }
    }

    async fn release(self) {
        if let Some(channel) = self.channel {
            channel.close().await;
        }
        self.connection.close().await;
        debug!("rabbitmq_link_released");
    }
}

enum State<B: Broker> {
    Disconnected { attempt: u32 },
    Connected(Link<B::Connection>),
    Streaming(Link<B::Connection>, DeliveriesOf<B>),
}

/// Long-running loop that bridges a queue to a [`Forward`] implementation.
pub struct ConsumerLoop<B, F> {
    broker: B,
    forwarder: F,
    settings: Arc<Settings>,
}

impl<B: Broker, F: Forward> ConsumerLoop<B, F> {
    pub fn new(broker: B, forwarder: F, settings: Arc<Settings>) -> Self {
        Self {
            broker,
            forwarder,
            settings,
        }
    }

    /// Run forever, reconnecting after every failure.
    pub async fn run(self) {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Run until `shutdown` resolves.
    ///
    /// Shutdown is observed while connecting, while waiting for the next
    /// delivery and during backoff. A delivery already being forwarded is
    /// resolved first, and any open channel and connection are closed.
    pub async fn run_until<S: Future>(self, shutdown: S) {
        tokio::pin!(shutdown);

        let mut state = State::Disconnected { attempt: 1 };
        while let Some(next) = self.step(state, &mut shutdown).await {
            state = next;
        }

        info!(queue = %self.settings.queue_name, "consumer_loop_stopped");
    }

    /// Advance the state machine by one transition. `None` means stop.
    async fn step<S: Future>(
        &self,
        state: State<B>,
        shutdown: &mut Pin<&mut S>,
    ) -> Option<State<B>> {
        match state {
            State::Disconnected { attempt } => {
                info!(
                    url_length = self.settings.rabbitmq_url.len(),
                    attempt = attempt,
                    "rabbitmq_connecting"
                );

                let connected = tokio::select! {
                    _ = shutdown.as_mut() => return None,
                    connected = self.broker.connect() => connected,
                };

                match connected {
                    Ok(connection) => {
                        info!(attempt = attempt, "rabbitmq_connected");
                        Some(State::Connected(Link::new(connection)))
                    }
                    Err(e) => {
                        error!(
                            attempt = attempt,
                            error = %e,
                            retry_in_ms = self.settings.reconnect_delay.as_millis() as u64,
                            "rabbitmq_connect_failed"
                        );
                        self.backoff(shutdown)
                            .await
                            .then_some(State::Disconnected {
                                attempt: attempt.saturating_add(1),
                            })
                    }
                }
            }

            State::Connected(mut link) => match self.subscribe(&mut link).await {
                Ok(deliveries) => Some(State::Streaming(link, deliveries)),
                Err(e) => {
                    error!(
                        queue = %self.settings.queue_name,
                        error = %e,
                        retry_in_ms = self.settings.reconnect_delay.as_millis() as u64,
                        "rabbitmq_setup_failed"
                    );
                    link.release().await;
                    self.backoff(shutdown)
                        .await
                        .then_some(State::Disconnected { attempt: 1 })
                }
            },

            State::Streaming(link, mut deliveries) => {
                let end = self.stream(&mut deliveries, shutdown).await;
                drop(deliveries);
                link.release().await;

                match end {
                    StreamEnd::Shutdown => None,
                    StreamEnd::Closed => {
                        info!(
                            retry_in_ms = self.settings.reconnect_delay.as_millis() as u64,
                            "rabbitmq_reconnecting"
                        );
                        self.backoff(shutdown)
                            .await
                            .then_some(State::Disconnected { attempt: 1 })
                    }
                }
            }
        }
    }

    /// Open a channel on `link`, declare the queue, set QoS and start consuming.
    async fn subscribe(
        &self,
        link: &mut Link<B::Connection>,
    ) -> Result<DeliveriesOf<B>, BrokerError> {
        let settings = &self.settings;

        let channel = link.connection.create_channel().await?;
        let channel = link.channel.insert(channel);
        info!("rabbitmq_channel_created");

        channel
            .declare_queue(&settings.queue_name, settings.queue_declare)
            .await?;
        info!(
            queue = %settings.queue_name,
            policy = ?settings.queue_declare,
            "rabbitmq_queue_declared"
        );

        channel.set_prefetch(PREFETCH_COUNT).await?;
        info!(prefetch_count = PREFETCH_COUNT, "rabbitmq_qos_set");

        let deliveries = channel
            .consume(&settings.queue_name, &settings.consumer_tag)
            .await?;
        info!(queue = %settings.queue_name, "rabbitmq_consumer_started");

        Ok(deliveries)
    }

    /// Handle deliveries in receipt order until the stream closes or
    /// shutdown is requested.
    async fn stream<S: Future>(
        &self,
        deliveries: &mut DeliveriesOf<B>,
        shutdown: &mut Pin<&mut S>,
    ) -> StreamEnd {
        loop {
            let next = tokio::select! {
                _ = shutdown.as_mut() => {
                    info!(queue = %self.settings.queue_name, "consumer_stopping");
                    return StreamEnd::Shutdown;
                }
                next = deliveries.next_delivery() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    self.handle(delivery).await;
                }
                Some(Err(e)) => {
                    error!(error = %e, "rabbitmq_delivery_error");
                    return StreamEnd::Closed;
                }
                None => {
                    warn!(queue = %self.settings.queue_name, "rabbitmq_consumer_closed");
                    return StreamEnd::Closed;
                }
            }
        }
    }

    /// Forward one delivery and resolve it exactly once.
    ///
    /// Ack and nack transport errors are logged and otherwise ignored.
    pub async fn handle<D: Acknowledge>(&self, delivery: D) -> Resolution {
        let delivery_tag = delivery.delivery_tag();
        let body_length = delivery.payload().len();

        info!(
            queue = %self.settings.queue_name,
            delivery_tag = delivery_tag,
            body_length = body_length,
            "rabbitmq_message_received"
        );
        debug!(
            delivery_tag = delivery_tag,
            body_preview = %body_preview(delivery.payload()),
            "rabbitmq_message_body"
        );

        if self.forwarder.forward(delivery.payload()).await {
            match delivery.ack().await {
                Ok(()) => info!(delivery_tag = delivery_tag, "message_acked"),
                Err(e) => error!(delivery_tag = delivery_tag, error = %e, "rabbitmq_ack_failed"),
            }
            Resolution::Acked
        } else {
            match delivery.nack_requeue().await {
                Ok(()) => warn!(delivery_tag = delivery_tag, "message_requeued"),
                Err(e) => error!(delivery_tag = delivery_tag, error = %e, "rabbitmq_nack_failed"),
            }
            Resolution::Requeued
        }
    }

    /// Sleep for the reconnect delay. Returns `false` if shutdown fired first.
    async fn backoff<S: Future>(&self, shutdown: &mut Pin<&mut S>) -> bool {
        tokio::select! {
            _ = shutdown.as_mut() => false,
            _ = sleep(self.settings.reconnect_delay) => true,
        }
    }
}

fn body_preview(data: &[u8]) -> Cow<'_, str> {
    String::from_utf8_lossy(&data[..data.len().min(BODY_PREVIEW_LIMIT)])
}
