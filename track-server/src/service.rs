//! Service wiring: one task per adapter, raw consumer, aggregator, plus
//! batch delivery, cleanup and the status API.
//!
//! Shutdown order on cancel: adapters and consumers stop first (consumers
//! buffer whatever is already queued), then the aggregators run a final
//! fusion pass.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use track_core::config::Config;
use track_core::fusion::{FusionEngine, SourcePriorityTable};
use track_core::gate::StateStore;
use track_core::types::{now, EntityClass};

use crate::adapter::{run_adapter, HttpAdapter, ProviderAdapter};
use crate::aggregator::FusionAggregator;
use crate::channel::{run_consumer, RawChannel};
use crate::db::TrackStore;
use crate::notifier::GeoNotifier;
use crate::pipeline::{Pipeline, PipelineStats};
use crate::web::{self, AppState};

const CHANNEL_CAPACITY: usize = 1024;

/// Shared components, built once.
pub struct Components {
    pub config: Config,
    pub engine: Arc<FusionEngine>,
    pub pipeline: Arc<Pipeline>,
    pub notifier: Arc<GeoNotifier>,
    pub stats: Arc<PipelineStats>,
    pub aircraft: Arc<FusionAggregator>,
    pub vessel: Arc<FusionAggregator>,
}

impl Components {
    pub fn new(config: Config, store: Arc<dyn TrackStore>) -> Self {
        let stats = Arc::new(PipelineStats::default());
        let state = Arc::new(StateStore::new());
        let notifier = Arc::new(GeoNotifier::new(config.notifier.clone(), state.clone(), stats.clone()));
        let pipeline = Arc::new(Pipeline::new(&config, state, store, notifier.clone(), stats.clone()));
        let engine = Arc::new(FusionEngine::new(
            SourcePriorityTable::from_sources(&config.sources),
            config.fusion.clone(),
        ));
        Components {
            aircraft: Arc::new(FusionAggregator::new(EntityClass::Aircraft, &config.fusion)),
            vessel: Arc::new(FusionAggregator::new(EntityClass::Vessel, &config.fusion)),
            config,
            engine,
            pipeline,
            notifier,
            stats,
        }
    }

    pub fn aggregator(&self, class: EntityClass) -> &Arc<FusionAggregator> {
        match class {
            EntityClass::Aircraft => &self.aircraft,
            EntityClass::Vessel => &self.vessel,
        }
    }
}

/// Run the live service until `cancel` fires.
pub async fn run(components: Components, host: String, port: u16, cancel: CancellationToken) {
    let c = Arc::new(components);
    let fusion_cancel = CancellationToken::new();

    let mut ingest: Vec<JoinHandle<()>> = Vec::new();
    let mut adapters: Vec<Arc<dyn ProviderAdapter>> = Vec::new();

    for source in c.config.enabled_sources() {
        let adapter = match HttpAdapter::new(source.clone(), c.config.bounds) {
            Ok(a) => Arc::new(a) as Arc<dyn ProviderAdapter>,
            Err(e) => {
                error!(source = %source.name, error = %e, "adapter setup failed, source skipped");
                continue;
            }
        };
        let (channel, rx) = RawChannel::new(&source.name, source.class, CHANNEL_CAPACITY);
        let aggregator = c.aggregator(source.class).clone();
        ingest.push(tokio::spawn(run_consumer(rx, aggregator, c.stats.clone(), cancel.clone())));
        ingest.push(tokio::spawn(run_adapter(adapter.clone(), channel, cancel.clone())));
        adapters.push(adapter);
    }
    info!(sources = adapters.len(), "adapters started");

    let fusion: Vec<JoinHandle<()>> = [&c.aircraft, &c.vessel]
        .into_iter()
        .map(|agg| {
            tokio::spawn(agg.clone().run(c.engine.clone(), c.pipeline.clone(), fusion_cancel.clone()))
        })
        .collect();

    let mut background = vec![
        tokio::spawn(c.notifier.clone().run_batches(cancel.clone())),
        tokio::spawn(run_cleanup(c.clone(), cancel.clone())),
    ];

    let app_state = Arc::new(AppState {
        adapters,
        aggregators: vec![c.aircraft.clone(), c.vessel.clone()],
        stats: c.stats.clone(),
        notifier: c.notifier.clone(),
        state: c.pipeline.state.clone(),
        started_at: Instant::now(),
    });
    let web_cancel = cancel.clone();
    background.push(tokio::spawn(async move {
        if let Err(e) = web::serve(app_state, &host, port, web_cancel).await {
            error!(error = %e, "status API failed");
        }
    }));

    cancel.cancelled().await;
    info!("shutting down");

    for task in ingest {
        join(task).await;
    }
    fusion_cancel.cancel();
    for task in fusion.into_iter().chain(background) {
        join(task).await;
    }

    let s = c.stats.snapshot();
    info!(
        raw = s.raw_received,
        fused = s.fused,
        persisted = s.persisted,
        duplicates = s.duplicates,
        "stopped"
    );
}

async fn join(task: JoinHandle<()>) {
    if let Err(e) = task.await {
        warn!(error = %e, "task ended abnormally");
    }
}

/// Purge inactive entities, stale dedup entries, expired raw reports and
/// closed sessions.
async fn run_cleanup(c: Arc<Components>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(Duration::from_secs_f64(c.config.cleanup.interval_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let report = c.pipeline.cleanup(&c.config, now()).await;
                let sessions = c.notifier.cleanup_closed();
                debug!(
                    entities = report.entities,
                    dedup = report.dedup_entries,
                    raw = report.raw_records,
                    sessions,
                    "cleanup"
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
