//! Provider adapters: poll one HTTP API each, normalize to raw records.
//!
//! `fetch` never fails to its caller. Timeouts, HTTP errors and malformed
//! payloads produce an empty list and bump the source's consecutive-failure
//! counter; `failure_threshold` in a row (three by default) mark the source
//! unhealthy until the next success.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use track_core::config::SourceConfig;
use track_core::geo::BoundingBox;
use track_core::providers::{parse_payload, PayloadOrigin};
use track_core::types::{now, EntityClass, RawTrackRecord, TrackError};

use crate::channel::RawChannel;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider returned HTTP {0}")]
    Status(u16),
    #[error(transparent)]
    Payload(#[from] TrackError),
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct SourceHealth {
    threshold: u32,
    consecutive_failures: AtomicU32,
    total_fetches: AtomicU64,
    total_failures: AtomicU64,
    last_records: AtomicUsize,
    last_success_secs: AtomicU64,
}

impl SourceHealth {
    pub fn new(threshold: u32) -> Self {
        SourceHealth {
            threshold: threshold.max(1),
            consecutive_failures: AtomicU32::new(0),
            total_fetches: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            last_records: AtomicUsize::new(0),
            last_success_secs: AtomicU64::new(0),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn record_success(&self, records: usize, at: f64) {
        self.total_fetches.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.last_records.store(records, Ordering::Relaxed);
        self.last_success_secs.store(at as u64, Ordering::Relaxed);
    }

    /// Returns the new consecutive-failure count.
    pub fn record_failure(&self) -> u32 {
        self.total_fetches.fetch_add(1, Ordering::Relaxed);
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn is_healthy(&self) -> bool {
        self.consecutive_failures() < self.threshold
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceStatus {
    pub name: String,
    pub class: EntityClass,
    pub format: String,
    pub enabled: bool,
    pub available: bool,
    pub consecutive_failures: u32,
    pub total_fetches: u64,
    pub total_failures: u64,
    pub last_record_count: usize,
    pub last_success: Option<u64>,
}

// ---------------------------------------------------------------------------
// Adapter trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &str;
    fn class(&self) -> EntityClass;
    fn poll_interval(&self) -> Duration;
    /// Empty on any failure.
    async fn fetch(&self) -> Vec<RawTrackRecord>;
    fn is_healthy(&self) -> bool;
    fn status(&self) -> SourceStatus;
}

/// Adapter for any of the supported JSON provider formats over HTTP GET.
pub struct HttpAdapter {
    pub config: SourceConfig,
    bounds: BoundingBox,
    client: reqwest::Client,
    health: SourceHealth,
}

impl HttpAdapter {
    pub fn new(config: SourceConfig, bounds: BoundingBox) -> Result<Self, AdapterError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(config.timeout_secs))
            .build()?;
        let health = SourceHealth::new(config.failure_threshold);
        Ok(HttpAdapter {
            config,
            bounds,
            client,
            health,
        })
    }

    async fn request(&self) -> Result<(String, u64), AdapterError> {
        let started = Instant::now();
        let mut req = self.client.get(&self.config.url).query(&[
            ("minLat", self.bounds.min_lat),
            ("maxLat", self.bounds.max_lat),
            ("minLon", self.bounds.min_lon),
            ("maxLon", self.bounds.max_lon),
        ]);
        if let Some(key) = &self.config.api_key {
            req = req.header("X-API-Key", key);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(AdapterError::Status(status.as_u16()));
        }
        let body = resp.text().await?;
        Ok((body, started.elapsed().as_millis() as u64))
    }

    fn fail(&self, error: AdapterError) -> Vec<RawTrackRecord> {
        let failures = self.health.record_failure();
        if failures == self.health.threshold() {
            warn!(source = %self.config.name, failures, error = %error, "source marked unhealthy");
        } else {
            warn!(source = %self.config.name, failures, error = %error, "fetch failed");
        }
        Vec::new()
    }
}

#[async_trait]
impl ProviderAdapter for HttpAdapter {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn class(&self) -> EntityClass {
        self.config.class
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.config.interval_secs)
    }

    async fn fetch(&self) -> Vec<RawTrackRecord> {
        let (body, latency_ms) = match self.request().await {
            Ok(r) => r,
            Err(e) => return self.fail(e),
        };
        let received_at = now();
        let origin = PayloadOrigin {
            source: &self.config.name,
            format: self.config.format,
            quality: self.config.quality,
            received_at,
        };
        let batch = match parse_payload(&origin, &body) {
            Ok(b) => b,
            Err(e) => return self.fail(e.into()),
        };
        if batch.skipped > 0 {
            debug!(source = %self.config.name, skipped = batch.skipped, "entries skipped");
        }
        if !self.health.is_healthy() {
            info!(source = %self.config.name, "source recovered");
        }
        self.health.record_success(batch.records.len(), received_at);
        batch
            .records
            .into_iter()
            .map(|r| r.with_response_ms(latency_ms))
            .collect()
    }

    fn is_healthy(&self) -> bool {
        self.health.is_healthy()
    }

    fn status(&self) -> SourceStatus {
        let h = &self.health;
        let last_success = h.last_success_secs.load(Ordering::Relaxed);
        SourceStatus {
            name: self.config.name.clone(),
            class: self.config.class,
            format: self.config.format.to_string(),
            enabled: self.config.enabled,
            available: h.is_healthy(),
            consecutive_failures: h.consecutive_failures(),
            total_fetches: h.total_fetches.load(Ordering::Relaxed),
            total_failures: h.total_failures.load(Ordering::Relaxed),
            last_record_count: h.last_records.load(Ordering::Relaxed),
            last_success: (last_success > 0).then_some(last_success),
        }
    }
}

/// Poll `adapter` on its own interval and publish to its raw channel.
/// Unhealthy sources keep being polled so they can recover.
pub async fn run_adapter(adapter: Arc<dyn ProviderAdapter>, channel: RawChannel, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(adapter.poll_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    info!(source = adapter.name(), topic = %channel.topic, "adapter started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let records = tokio::select! {
                    _ = cancel.cancelled() => break,
                    r = adapter.fetch() => r,
                };
                if records.is_empty() {
                    continue;
                }
                match channel.publish_batch(records).await {
                    Ok(report) => debug!(
                        source = adapter.name(),
                        buffered = report.buffered,
                        rejected = report.rejected,
                        "published"
                    ),
                    Err(e) => {
                        warn!(source = adapter.name(), error = %e, "raw channel closed, adapter stopping");
                        break;
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
