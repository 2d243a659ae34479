use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};
use tracing::{trace, warn};

use crate::cache::Coordinate;
use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::spots::LocationKey;

#[async_trait]
pub trait Geocoder: Send + Sync {
    /// One outbound provider request. `Ok(None)` means the provider had no
    /// candidate for the query; `Err` is a transport or decoding fault.
    async fn geocode(&self, query: &str) -> AppResult<Option<Coordinate>>;
}

#[derive(Clone)]
pub struct GeocodingService {
    inner: Arc<dyn Geocoder>,
}

impl GeocodingService {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let inner: Arc<dyn Geocoder> = match config.opencage_api_key.clone() {
            Some(key) => Arc::new(HttpGeocoder::new(
                config.geocode_endpoint.clone(),
                key,
                Duration::from_secs(config.geocode_http_timeout_secs),
            )?),
            None => {
                warn!("no geocoding credential configured; every location will stay unresolved");
                Arc::new(DisabledGeocoder)
            }
        };
        Ok(Self { inner })
    }

    #[cfg(test)]
    pub(crate) fn from_geocoder(geocoder: Arc<dyn Geocoder>) -> Self {
        Self { inner: geocoder }
    }

    /// Resolve one location key. Provider failures and empty result sets are
    /// absorbed here: both come back as `None`, never as an error. A wrong
    /// coordinate is worse than a missing marker, so nothing is guessed.
    pub async fn resolve(&self, key: &LocationKey) -> Option<Coordinate> {
        match self.inner.geocode(key.as_str()).await {
            Ok(Some(coordinate)) => {
                trace!(query = %key, "geocode query resolved");
                Some(coordinate)
            }
            Ok(None) => {
                warn!(query = %key, "geocode query returned no candidates");
                None
            }
            Err(err) => {
                warn!(?err, query = %key, "geocode request failed");
                None
            }
        }
    }
}

struct HttpGeocoder {
    http: reqwest::Client,
    endpoint: String,
    api_key: SecretString,
}

impl HttpGeocoder {
    fn new(endpoint: String, api_key: SecretString, timeout: Duration) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("spotmap/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            endpoint,
            api_key,
        })
    }
}

#[async_trait]
impl Geocoder for HttpGeocoder {
    async fn geocode(&self, query: &str) -> AppResult<Option<Coordinate>> {
        #[derive(Deserialize)]
        struct Response {
            results: Vec<ResponseResult>,
        }

        #[derive(Deserialize)]
        struct ResponseResult {
            geometry: ResponseGeometry,
        }

        #[derive(Deserialize)]
        struct ResponseGeometry {
            lat: f64,
            lng: f64,
        }

        let response = self
            .http
            .get(&self.endpoint)
            .query(&[
                ("q", query),
                ("key", self.api_key.expose_secret()),
                ("limit", "1"),
                ("no_annotations", "1"),
            ])
            .send()
            .await?
            .error_for_status()?;

        let parsed: Response = response.json().await?;
        Ok(parsed.results.into_iter().next().map(|result| Coordinate {
            latitude: result.geometry.lat,
            longitude: result.geometry.lng,
        }))
    }
}

struct DisabledGeocoder;

#[async_trait]
impl Geocoder for DisabledGeocoder {
    async fn geocode(&self, _query: &str) -> AppResult<Option<Coordinate>> {
        Err(AppError::Config("geocoding credential missing".into()))
    }
}

/// Enforces the minimum spacing between successive provider requests. The
/// first `wait` of a session returns immediately; every later one sleeps
/// until the interval since the previous tick has elapsed.
pub struct RateLimiter {
    min_interval_ms: AtomicU64,
    last_tick: AsyncMutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval_ms: u64) -> Self {
        Self {
            min_interval_ms: AtomicU64::new(min_interval_ms.max(1)),
            last_tick: AsyncMutex::new(None),
        }
    }

    pub fn set_min_interval_ms(&self, min_interval_ms: u64) {
        self.min_interval_ms
            .store(min_interval_ms.max(1), Ordering::SeqCst);
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms.load(Ordering::SeqCst))
    }

    pub async fn wait(&self) {
        let interval = self.min_interval();
        let mut guard = self.last_tick.lock().await;
        if let Some(prev) = *guard {
            let elapsed = prev.elapsed();
            if elapsed < interval {
                sleep(interval - elapsed).await;
            }
        }
        *guard = Some(Instant::now());
    }
}
