use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::cache::{CacheEntry, CoordinateCache};
use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::geocode::{GeocodingService, RateLimiter};
use crate::spots::{AnnotatedSpot, SpotRecord, SpotSource};

#[derive(Debug, Clone, Serialize)]
pub struct PipelineSnapshot {
    pub annotated: Vec<AnnotatedSpot>,
    pub loading: bool,
}

impl Default for PipelineSnapshot {
    fn default() -> Self {
        Self {
            annotated: Vec::new(),
            loading: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunStats {
    pub total_records: usize,
    pub distinct_keys: usize,
    pub cache_hits: usize,
    pub resolver_calls: usize,
    pub resolved_keys: usize,
    pub unresolved_keys: usize,
    pub annotated: usize,
}

impl RunStats {
    fn with_total(total_records: usize) -> Self {
        Self {
            total_records,
            distinct_keys: 0,
            cache_hits: 0,
            resolver_calls: 0,
            resolved_keys: 0,
            unresolved_keys: 0,
            annotated: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolveProgress {
    pub total_keys: usize,
    pub attempted: usize,
    pub resolved: usize,
}

pub struct MapPipeline {
    cache: CoordinateCache,
    resolver: GeocodingService,
    rate_limiter: RateLimiter,
    guard: AsyncMutex<()>,
    published: Arc<Mutex<PipelineSnapshot>>,
}

impl MapPipeline {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        Ok(Self {
            cache: CoordinateCache::new(),
            resolver: GeocodingService::new(config)?,
            rate_limiter: RateLimiter::new(config.geocode_min_interval_ms),
            guard: AsyncMutex::new(()),
            published: Arc::new(Mutex::new(PipelineSnapshot::default())),
        })
    }

    #[cfg(test)]
    pub(crate) fn with_resolver(resolver: GeocodingService, min_interval_ms: u64) -> Self {
        Self {
            cache: CoordinateCache::new(),
            resolver,
            rate_limiter: RateLimiter::new(min_interval_ms),
            guard: AsyncMutex::new(()),
            published: Arc::new(Mutex::new(PipelineSnapshot::default())),
        }
    }

    pub fn cache(&self) -> &CoordinateCache {
        &self.cache
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        self.published.lock().clone()
    }

    pub fn set_min_interval_ms(&self, min_interval_ms: u64) {
        self.rate_limiter.set_min_interval_ms(min_interval_ms);
    }

    pub async fn refresh(&self, records: &[SpotRecord]) -> RunStats {
        self.refresh_with_observer(records, None).await
    }

    pub async fn refresh_from_source(&self, source: &dyn SpotSource) -> AppResult<RunStats> {
        let records = source.list().await?;
        Ok(self.refresh(&records).await)
    }

    /// One generation over a record-set snapshot: key every record, resolve
    /// the distinct keys the cache has not seen, then join and publish. The
    /// guard holds a generation to completion before the next one starts.
    pub async fn refresh_with_observer(
        &self,
        records: &[SpotRecord],
        observer: Option<Arc<dyn Fn(ResolveProgress) + Send + Sync>>,
    ) -> RunStats {
        let _generation = self.guard.lock().await;

        let mut stats = RunStats::with_total(records.len());

        // Keying: distinct keys without a cache entry, in first-seen order.
        let mut seen = HashSet::new();
        let mut pending = Vec::new();
        for record in records {
            let key = record.location_key();
            if !seen.insert(key.clone()) {
                continue;
            }
            stats.distinct_keys += 1;
            if self.cache.has(&key) {
                stats.cache_hits += 1;
            } else {
                pending.push(key);
            }
        }

        // Resolving: strictly sequential, one outbound request in flight,
        // spaced by the rate limiter. Every attempted key gets a cache
        // entry, resolved or not.
        let total_keys = pending.len();
        for (index, key) in pending.iter().enumerate() {
            self.rate_limiter.wait().await;
            stats.resolver_calls += 1;
            let entry = match self.resolver.resolve(key).await {
                Some(coordinate) => {
                    stats.resolved_keys += 1;
                    CacheEntry::Resolved(coordinate)
                }
                None => {
                    stats.unresolved_keys += 1;
                    CacheEntry::Unresolved
                }
            };
            self.cache.put(key.clone(), entry);
            if let Some(callback) = &observer {
                callback(ResolveProgress {
                    total_keys,
                    attempted: index + 1,
                    resolved: stats.resolved_keys,
                });
            }
        }

        // Joining: records whose key stayed unresolved are excluded, never
        // plotted with a placeholder.
        let mut annotated = Vec::with_capacity(records.len());
        for record in records {
            let key = record.location_key();
            let entry = self.cache.get(&key);
            debug_assert!(
                entry.is_some(),
                "location {key} reached joining without a cache entry"
            );
            if let Some(coordinate) = entry.and_then(|entry| entry.coordinate()) {
                annotated.push(AnnotatedSpot {
                    spot: record.clone(),
                    latitude: coordinate.latitude,
                    longitude: coordinate.longitude,
                });
            }
        }
        stats.annotated = annotated.len();

        {
            let mut published = self.published.lock();
            published.annotated = annotated;
            published.loading = false;
        }

        debug!(
            total_records = stats.total_records,
            distinct_keys = stats.distinct_keys,
            cache_hits = stats.cache_hits,
            resolver_calls = stats.resolver_calls,
            annotated = stats.annotated,
            "map generation published"
        );
        stats
    }
}
