//! Forwarding of message bodies to the downstream HTTP endpoint.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{header, redirect, Client};
use tracing::{error, info, warn};
use url::Url;

use crate::config::Settings;

/// Delivers one payload downstream and reports whether it was accepted.
///
/// Implementations must not retry on their own; a `false` verdict makes the
/// consumer loop requeue the message.
#[async_trait]
pub trait Forward: Send + Sync {
    async fn forward(&self, payload: &[u8]) -> bool;
}

/// Forwarder that POSTs the payload verbatim as JSON.
#[derive(Debug, Clone)]
pub struct HttpForwarder {
    client: Client,
    target_url: Url,
    timeout: Duration,
}

impl HttpForwarder {
    /// Build a forwarder whose requests use `timeout` as their total deadline.
    pub fn new(target_url: Url, timeout: Duration) -> Result<Self> {
        // Redirects are not followed so a 3xx is classified like any other
        // non-2xx status.
        let client = Client::builder()
            .timeout(timeout)
            .redirect(redirect::Policy::none())
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            target_url,
            timeout,
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Self::new(settings.target_url.clone(), settings.http_timeout)
    }
}

#[async_trait]
impl Forward for HttpForwarder {
    async fn forward(&self, payload: &[u8]) -> bool {
        let request = self
            .client
            .post(self.target_url.clone())
            .header(header::CONTENT_TYPE, "application/json")
            .body(payload.to_vec());

        match request.send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();

                if (200..300).contains(&status) {
                    info!(
                        url = %self.target_url,
                        status_code = status,
                        body_length = payload.len(),
                        "forward_succeeded"
                    );
                    true
                } else {
                    warn!(
                        url = %self.target_url,
                        status_code = status,
                        body_length = payload.len(),
                        "forward_rejected"
                    );
                    false
                }
            }
            Err(e) => {
                error!(
                    url = %self.target_url,
                    timeout = e.is_timeout(),
                    connect = e.is_connect(),
                    builder = e.is_builder(),
                    timeout_seconds = self.timeout.as_secs_f64(),
                    error = %e,
                    "forward_failed"
                );
                false
            }
        }
    }
}
