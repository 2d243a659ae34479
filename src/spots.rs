use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::AppResult;

const KEY_SEPARATOR: char = ',';

/// A spot record as the directory stores it. The pipeline only reads
/// `city` and `country`; everything else passes through untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpotRecord {
    pub id: String,
    pub brand: String,
    pub model: String,
    pub year: String,
    pub city: String,
    pub country: String,
    pub user_id: String,
    pub username: String,
    pub image_public_ids: Vec<String>,
    pub post_id: String,
}

impl SpotRecord {
    pub fn location_key(&self) -> LocationKey {
        LocationKey::new(&self.city, &self.country)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnnotatedSpot {
    #[serde(flatten)]
    pub spot: SpotRecord,
    pub latitude: f64,
    pub longitude: f64,
}

/// Cache index for a city/country pair. Derivation is plain concatenation
/// with a fixed separator: no trimming, no case folding, total even for
/// empty strings. The key doubles as the provider query text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocationKey(String);

impl LocationKey {
    pub fn new(city: &str, country: &str) -> Self {
        Self(format!("{city}{KEY_SEPARATOR}{country}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LocationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
pub trait SpotSource: Send + Sync {
    async fn list(&self) -> AppResult<Vec<SpotRecord>>;
}

#[derive(Default)]
pub struct InMemorySpotSource {
    records: parking_lot::Mutex<Vec<SpotRecord>>,
}

impl InMemorySpotSource {
    pub fn new(records: Vec<SpotRecord>) -> Self {
        Self {
            records: parking_lot::Mutex::new(records),
        }
    }

    pub fn replace(&self, records: Vec<SpotRecord>) {
        *self.records.lock() = records;
    }
}

#[async_trait]
impl SpotSource for InMemorySpotSource {
    async fn list(&self) -> AppResult<Vec<SpotRecord>> {
        Ok(self.records.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(city: &str, country: &str) -> SpotRecord {
        SpotRecord {
            id: "spot-1".into(),
            brand: "Porsche".into(),
            model: "911 GT3".into(),
            year: "2021".into(),
            city: city.into(),
            country: country.into(),
            user_id: "user-1".into(),
            username: "spotter".into(),
            image_public_ids: vec!["img-1".into()],
            post_id: "post-1".into(),
        }
    }

    #[test]
    fn keying_is_deterministic() {
        let a = LocationKey::new("Zagreb", "Croatia");
        let b = LocationKey::new("Zagreb", "Croatia");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "Zagreb,Croatia");
    }

    #[test]
    fn keying_is_total_for_empty_strings() {
        let key = LocationKey::new("", "");
        assert_eq!(key.as_str(), ",");
    }

    #[test]
    fn keying_preserves_case_and_whitespace() {
        assert_ne!(
            LocationKey::new("zagreb", "Croatia"),
            LocationKey::new("Zagreb", "Croatia")
        );
        assert_ne!(
            LocationKey::new("Zagreb ", "Croatia"),
            LocationKey::new("Zagreb", "Croatia")
        );
    }

    #[test]
    fn record_key_matches_direct_derivation() {
        let spot = record("Zagreb", "Croatia");
        assert_eq!(spot.location_key(), LocationKey::new("Zagreb", "Croatia"));
    }

    #[tokio::test]
    async fn in_memory_source_lists_and_replaces() {
        let source = InMemorySpotSource::new(vec![record("Zagreb", "Croatia")]);
        assert_eq!(source.list().await.unwrap().len(), 1);

        source.replace(vec![
            record("Zagreb", "Croatia"),
            record("Split", "Croatia"),
        ]);
        assert_eq!(source.list().await.unwrap().len(), 2);
    }
}
