//! Error types shared by the worker modules.
//!
//! Configuration errors are fatal at startup. Broker errors are always
//! absorbed by the consumer loop, which logs them and reconnects.

use thiserror::Error;

/// Failure to build [`Settings`](crate::config::Settings) from the environment.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A required variable is absent or blank.
    #[error("missing required setting {0}")]
    Missing(&'static str),

    /// A variable is present but its value cannot be used.
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Failure talking to the message broker, tagged with the step that failed.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to connect to broker: {0}")]
    Connect(String),

    #[error("failed to open channel: {0}")]
    Channel(String),

    #[error("failed to declare queue {queue}: {reason}")]
    Declare { queue: String, reason: String },

    #[error("failed to set QoS: {0}")]
    Qos(String),

    #[error("failed to start consumer on {queue}: {reason}")]
    Consume { queue: String, reason: String },

    /// The delivery stream yielded an error instead of a message.
    #[error("delivery stream error: {0}")]
    Delivery(String),

    /// The ack or nack frame could not be sent.
    #[error("acknowledgment failed: {0}")]
    Ack(String),
}
