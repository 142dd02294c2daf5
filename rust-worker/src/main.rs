//! Bridge Worker - RabbitMQ consumer that forwards messages to an HTTP API.
//!
//! Each message body is POSTed to the configured endpoint. The message is
//! acked on a 2xx response and requeued otherwise. Broker failures are
//! retried forever with a fixed delay.

use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bridge::{shutdown, AmqpBroker, ConsumerLoop, HttpForwarder, Settings};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    tracing::info!("worker_starting");

    // Missing or invalid settings are fatal
    let settings = match Settings::from_env() {
        Ok(settings) => Arc::new(settings),
        Err(e) => {
            tracing::error!(error = %e, "config_invalid");
            return Err(e.into());
        }
    };

    tracing::info!(
        rabbitmq_url_length = settings.rabbitmq_url.len(),
        queue = %settings.queue_name,
        target_url = %settings.target_url,
        http_timeout_ms = settings.http_timeout.as_millis() as u64,
        reconnect_delay_ms = settings.reconnect_delay.as_millis() as u64,
        queue_declare = ?settings.queue_declare,
        "config_loaded"
    );

    let broker = AmqpBroker::new(settings.rabbitmq_url.clone());
    let forwarder = HttpForwarder::from_settings(&settings)?;

    ConsumerLoop::new(broker, forwarder, Arc::clone(&settings))
        .run_until(shutdown::signal())
        .await;

    tracing::info!("worker_shutdown_complete");
    Ok(())
}
