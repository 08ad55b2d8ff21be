//! Bounded, concurrent in-process cache of the most recently accepted state
//! per aircraft (spec §4.2). Read path for the live portion of the read API;
//! write path is fed by the ingestion worker after a durable-store accept.
//!
//! Modeled on the per-key `DashMap` + periodic `retain()`-based cleanup used
//! to hold accumulated per-aircraft state in the protocol decoder: no global
//! lock on the hot path, a message counter driving infrequent full scans
//! instead of a scan per insert.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::state::StateRecord;

/// How many inserts between eviction sweeps.
const CLEANUP_INTERVAL: u64 = 500;

/// Bounded, TTL-aware, LRU-by-`last_contact` cache of live aircraft state.
///
/// Two independent eviction forces apply, matching spec §4.2:
/// - entries older than `ttl` (measured from `last_contact`) are dropped on
///   each cleanup sweep regardless of capacity;
/// - once at `max_entries`, an insert of a *new* key evicts the entry with
///   the oldest `last_contact` to make room.
pub struct LiveStateCache {
    entries: Arc<DashMap<String, StateRecord>>,
    max_entries: usize,
    ttl: chrono::Duration,
    insert_count: AtomicU64,
}

impl LiveStateCache {
    pub fn new(max_entries: usize, ttl: chrono::Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            max_entries,
            ttl,
            insert_count: AtomicU64::new(0),
        }
    }

    /// Insert or overwrite the cached record for `record.icao24`. Runs a
    /// capacity check before insert (new keys only) and a periodic TTL sweep.
    pub fn upsert(&self, record: StateRecord) {
        let is_new_key = !self.entries.contains_key(&record.icao24);

        if is_new_key && self.entries.len() >= self.max_entries {
            self.evict_oldest();
        }

        self.entries.insert(record.icao24.clone(), record);

        let count = self.insert_count.fetch_add(1, Ordering::Relaxed);
        if count.is_multiple_of(CLEANUP_INTERVAL) {
            self.sweep_expired(Utc::now());
        }

        metrics::gauge!("hot_cache.entries").set(self.entries.len() as f64);
    }

    pub fn get(&self, icao24: &str) -> Option<StateRecord> {
        self.entries.get(icao24).map(|e| e.value().clone())
    }

    pub fn remove(&self, icao24: &str) {
        self.entries.remove(icao24);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records whose bounding box and freshness match the read API's query.
    pub fn query_bounds(
        &self,
        min_lat: f64,
        min_lon: f64,
        max_lat: f64,
        max_lon: f64,
        visibility_window: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Vec<StateRecord> {
        self.entries
            .iter()
            .filter_map(|entry| {
                let record = entry.value();
                let last_contact = DateTime::<Utc>::from_timestamp(record.last_contact, 0)?;
                if now - last_contact > visibility_window {
                    return None;
                }
                let (lat, lon) = (record.latitude?, record.longitude?);
                if lat < min_lat || lat > max_lat || lon < min_lon || lon > max_lon {
                    return None;
                }
                Some(record.clone())
            })
            .collect()
    }

    /// Drop the entry with the smallest `last_contact`, breaking ties
    /// arbitrarily (DashMap iteration order). Called only when at capacity.
    fn evict_oldest(&self) {
        let oldest_key = self
            .entries
            .iter()
            .min_by_key(|e| e.value().last_contact)
            .map(|e| e.key().clone());

        if let Some(key) = oldest_key {
            self.entries.remove(&key);
            metrics::counter!("hot_cache.evicted_capacity_total").increment(1);
        }
    }

    fn sweep_expired(&self, now: DateTime<Utc>) {
        let before = self.entries.len();
        self.entries.retain(|_, record| {
            match DateTime::<Utc>::from_timestamp(record.last_contact, 0) {
                Some(last_contact) => now - last_contact <= self.ttl,
                None => false,
            }
        });
        let removed = before - self.entries.len();
        if removed > 0 {
            metrics::counter!("hot_cache.evicted_ttl_total").increment(removed as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SourceTag;

    fn record(icao24: &str, last_contact: i64) -> StateRecord {
        StateRecord {
            icao24: icao24.to_string(),
            callsign: None,
            country: None,
            latitude: Some(37.0),
            longitude: Some(-122.0),
            baro_altitude: Some(1000.0),
            geo_altitude: None,
            on_ground: false,
            velocity: None,
            true_track: None,
            vertical_rate: None,
            last_contact,
            ingestion_timestamp: Utc::now(),
            data_source: SourceTag::GlobalPublic,
            source_priority: 30,
            feeder_id: None,
            category: None,
            squawk: None,
            emergency: false,
        }
    }

    #[test]
    fn upsert_then_get_roundtrips() {
        let cache = LiveStateCache::new(10, chrono::Duration::seconds(300));
        cache.upsert(record("abc123", 1000));
        assert_eq!(cache.get("abc123").unwrap().last_contact, 1000);
    }

    #[test]
    fn evicts_oldest_when_at_capacity() {
        let cache = LiveStateCache::new(2, chrono::Duration::seconds(300));
        cache.upsert(record("aaa111", 100));
        cache.upsert(record("bbb222", 200));
        cache.upsert(record("ccc333", 300));

        assert_eq!(cache.len(), 2);
        assert!(cache.get("aaa111").is_none());
        assert!(cache.get("bbb222").is_some());
        assert!(cache.get("ccc333").is_some());
    }

    #[test]
    fn updating_existing_key_does_not_evict() {
        let cache = LiveStateCache::new(2, chrono::Duration::seconds(300));
        cache.upsert(record("aaa111", 100));
        cache.upsert(record("bbb222", 200));
        cache.upsert(record("aaa111", 500));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("aaa111").unwrap().last_contact, 500);
    }

    #[test]
    fn sweep_removes_entries_older_than_ttl() {
        let cache = LiveStateCache::new(100, chrono::Duration::seconds(60));
        let now = Utc::now();
        cache.upsert(record("stale1", (now - chrono::Duration::seconds(120)).timestamp()));
        cache.upsert(record("fresh1", now.timestamp()));

        cache.sweep_expired(now);

        assert!(cache.get("stale1").is_none());
        assert!(cache.get("fresh1").is_some());
    }

    #[test]
    fn query_bounds_filters_by_box_and_freshness() {
        let cache = LiveStateCache::new(100, chrono::Duration::seconds(300));
        let now = Utc::now();

        let mut inside = record("inside1", now.timestamp());
        inside.latitude = Some(10.0);
        inside.longitude = Some(10.0);
        cache.upsert(inside);

        let mut outside = record("outside1", now.timestamp());
        outside.latitude = Some(80.0);
        outside.longitude = Some(80.0);
        cache.upsert(outside);

        let mut expired = record("expired1", (now - chrono::Duration::seconds(1000)).timestamp());
        expired.latitude = Some(10.0);
        expired.longitude = Some(10.0);
        cache.upsert(expired);

        let results = cache.query_bounds(0.0, 0.0, 20.0, 20.0, chrono::Duration::seconds(900), now);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].icao24, "inside1");
    }
}
