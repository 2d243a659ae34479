mod cache;
mod config;
mod errors;
mod geocode;
mod pipeline;
mod spots;
mod telemetry;

use std::path::Path;

use once_cell::sync::OnceCell;
use serde::Serialize;
use serde_json::json;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use cache::{CacheEntry, Coordinate, CoordinateCache};
pub use config::{AppConfig, PublicAppConfig};
pub use errors::{AppError, AppResult};
pub use geocode::{Geocoder, GeocodingService, RateLimiter};
pub use pipeline::{MapPipeline, PipelineSnapshot, ResolveProgress, RunStats};
pub use spots::{AnnotatedSpot, InMemorySpotSource, LocationKey, SpotRecord, SpotSource};
pub use telemetry::{TelemetryClient, TelemetryEvent};

/// One map session: its own cache, resolver, and telemetry. Sessions never
/// share resolution state, so server-side and client-side instances (or two
/// tests) cannot observe each other's outcomes.
pub struct MapSession {
    config: AppConfig,
    telemetry: TelemetryClient,
    pipeline: MapPipeline,
}

#[derive(Debug, Serialize)]
pub struct SessionHealth {
    pub telemetry_buffer_path: String,
    pub telemetry_queue_depth: usize,
    pub cached_locations: usize,
    pub config: PublicAppConfig,
}

impl MapSession {
    pub fn initialize<P: AsRef<Path>>(data_dir: P) -> AppResult<Self> {
        init_tracing();
        let config = AppConfig::from_env();
        Self::with_config(data_dir, config)
    }

    pub fn with_config<P: AsRef<Path>>(data_dir: P, config: AppConfig) -> AppResult<Self> {
        let telemetry = TelemetryClient::new(data_dir, &config)?;
        let pipeline = MapPipeline::new(&config)?;

        if let Err(err) = telemetry.record(
            "session_start",
            json!({
                "version": env!("CARGO_PKG_VERSION"),
                "has_geocoding_key": config.opencage_api_key.is_some(),
                "min_interval_ms": config.geocode_min_interval_ms,
            }),
        ) {
            warn!(?err, "failed to queue session start event");
        }

        Ok(Self {
            config,
            telemetry,
            pipeline,
        })
    }

    pub fn pipeline(&self) -> &MapPipeline {
        &self.pipeline
    }

    pub fn telemetry(&self) -> &TelemetryClient {
        &self.telemetry
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        self.pipeline.snapshot()
    }

    pub async fn refresh(&self, records: &[SpotRecord]) -> RunStats {
        let stats = self.pipeline.refresh(records).await;
        self.record_run(&stats);
        stats
    }

    pub async fn refresh_from_source(&self, source: &dyn SpotSource) -> AppResult<RunStats> {
        let stats = self.pipeline.refresh_from_source(source).await?;
        self.record_run(&stats);
        Ok(stats)
    }

    pub fn health(&self) -> SessionHealth {
        SessionHealth {
            telemetry_buffer_path: self.telemetry.buffer_path().to_string_lossy().to_string(),
            telemetry_queue_depth: self.telemetry.queue_depth(),
            cached_locations: self.pipeline.cache().len(),
            config: self.config.public_profile(),
        }
    }

    fn record_run(&self, stats: &RunStats) {
        if let Err(err) = self.telemetry.record(
            "pipeline_run",
            json!({
                "total_records": stats.total_records,
                "distinct_keys": stats.distinct_keys,
                "cache_hits": stats.cache_hits,
                "resolver_calls": stats.resolver_calls,
                "resolved_keys": stats.resolved_keys,
                "unresolved_keys": stats.unresolved_keys,
                "annotated": stats.annotated,
            }),
        ) {
            warn!(?err, "failed to record pipeline run event");
        }
        if let Err(err) = self.telemetry.flush() {
            warn!(?err, "failed to flush telemetry queue");
        }
    }
}

fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,spotmap=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}
