use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::spots::LocationKey;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CacheEntry {
    Resolved(Coordinate),
    Unresolved,
}

impl CacheEntry {
    pub fn coordinate(&self) -> Option<Coordinate> {
        match self {
            CacheEntry::Resolved(coordinate) => Some(*coordinate),
            CacheEntry::Unresolved => None,
        }
    }
}

/// Session-lifetime memo of resolution outcomes. Entries are only ever
/// added: `put` on a key that already holds an entry is a no-op, so a key
/// is resolved at most once per session. No eviction.
#[derive(Clone, Default)]
pub struct CoordinateCache {
    entries: Arc<Mutex<HashMap<LocationKey, CacheEntry>>>,
}

impl CoordinateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &LocationKey) -> Option<CacheEntry> {
        self.entries.lock().get(key).copied()
    }

    pub fn put(&self, key: LocationKey, entry: CacheEntry) {
        self.entries.lock().entry(key).or_insert(entry);
    }

    pub fn has(&self, key: &LocationKey) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
