//! Polling transport.
//!
//! Fetches the URL on a fixed interval; each successful response is one JSON
//! payload (usually an array of notifications). The first fetch happens
//! immediately. A failed cycle is reported as an error and the interval
//! keeps running, so polling never goes through reconnect backoff.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::{Interval, MissedTickBehavior};

use super::{http_url, Link, Transport, TransportError, TransportKind};
use crate::constants::{HTTP_REQUEST_TIMEOUT, POLL_INTERVAL_FLOOR};
use crate::notification::Payload;

/// Polling cadence for a reconnect minimum: `max(2 s, reconnect_min)`.
pub fn poll_interval_for(reconnect_min: Duration) -> Duration {
    reconnect_min.max(POLL_INTERVAL_FLOOR)
}

/// Opens polling links.
#[derive(Debug, Clone)]
pub struct PollingTransport {
    client: reqwest::Client,
    interval: Duration,
}

impl PollingTransport {
    /// Transport polling every `interval`.
    pub fn new(interval: Duration) -> Self {
        Self::with_client(reqwest::Client::new(), interval)
    }

    /// Transport sharing an existing HTTP client.
    pub fn with_client(client: reqwest::Client, interval: Duration) -> Self {
        Self { client, interval }
    }
}

#[async_trait]
impl Transport for PollingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Polling
    }

    async fn open(&self, url: &str) -> Result<Box<dyn Link>, TransportError> {
        let Some(url) = http_url(url) else {
            return Err(TransportError::unavailable(
                TransportKind::Polling,
                format!("unsupported URL: {url}"),
            ));
        };

        let mut ticker = tokio::time::interval(self.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        log::debug!("Polling {} every {:?}", url, self.interval);
        Ok(Box::new(PollingLink {
            client: self.client.clone(),
            url,
            ticker,
        }))
    }
}

/// Live polling loop.
#[derive(Debug)]
pub struct PollingLink {
    client: reqwest::Client,
    url: String,
    ticker: Interval,
}

impl PollingLink {
    async fn fetch(&self) -> reqwest::Result<Value> {
        self.client
            .get(&self.url)
            .timeout(HTTP_REQUEST_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json::<Value>()
            .await
    }
}

#[async_trait]
impl Link for PollingLink {
    fn kind(&self) -> TransportKind {
        TransportKind::Polling
    }

    async fn recv(&mut self) -> Option<Result<Payload, TransportError>> {
        self.ticker.tick().await;
        Some(
            self.fetch()
                .await
                .map(Payload::Json)
                .map_err(|e| TransportError::failure(TransportKind::Polling, e)),
        )
    }
}
