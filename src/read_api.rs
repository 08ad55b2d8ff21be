//! Read API (spec §4.9, C9): serves bounds queries from the hot cache when
//! it has enough coverage, falling back to the durable store to fill gaps
//! the cache hasn't warmed yet (e.g. just after a restart, or a region that
//! has had no recent activity worth caching).
//!
//! Mirrors the teacher's two-tier read pattern in `analytics_cache.rs`: try
//! the fast path, only pay for the durable-store round trip when the fast
//! path's result looks too thin to trust.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::task::spawn_blocking;

use crate::hot_cache::LiveStateCache;
use crate::state::StateRecord;
use crate::state_repository::StateRepository;

#[derive(Debug, Clone, Copy)]
pub struct BoundsQuery {
    pub min_lat: f64,
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
}

impl BoundsQuery {
    pub fn validate(&self) -> Result<(), String> {
        if self.min_lat > self.max_lat || self.min_lon > self.max_lon {
            return Err("min bound must not exceed max bound".to_string());
        }
        if !(-90.0..=90.0).contains(&self.min_lat) || !(-90.0..=90.0).contains(&self.max_lat) {
            return Err("latitude out of range".to_string());
        }
        if !(-180.0..=180.0).contains(&self.min_lon) || !(-180.0..=180.0).contains(&self.max_lon) {
            return Err("longitude out of range".to_string());
        }
        Ok(())
    }
}

pub struct ReadApi {
    cache: Arc<LiveStateCache>,
    repository: Arc<StateRepository>,
    min_results_before_db_fallback: usize,
    visibility_window: chrono::Duration,
}

impl ReadApi {
    pub fn new(
        cache: Arc<LiveStateCache>,
        repository: Arc<StateRepository>,
        min_results_before_db_fallback: usize,
        visibility_window: chrono::Duration,
    ) -> Self {
        Self {
            cache,
            repository,
            min_results_before_db_fallback,
            visibility_window,
        }
    }

    /// Serve a bounds query (spec §4.9): query the hot cache first; if it
    /// yields fewer than `min_results_before_db_fallback` records, also
    /// query the durable store and merge, preferring the cache's copy of
    /// any `icao24` both sides return since the cache is refreshed on every
    /// accepted ingest (spec §9: "cache never precedes the store").
    pub async fn query_bounds(&self, query: BoundsQuery, now: DateTime<Utc>) -> Result<Vec<StateRecord>> {
        query.validate().map_err(anyhow::Error::msg)?;

        let cache_hits = self.cache.query_bounds(
            query.min_lat,
            query.min_lon,
            query.max_lat,
            query.max_lon,
            self.visibility_window,
            now,
        );

        if cache_hits.len() >= self.min_results_before_db_fallback {
            metrics::counter!("read_api.cache_only_total").increment(1);
            return Ok(cache_hits);
        }

        metrics::counter!("read_api.db_fallback_total").increment(1);

        let repository = Arc::clone(&self.repository);
        let visibility_window = self.visibility_window;
        let store_hits = spawn_blocking(move || {
            repository.query_bounds(
                query.min_lat,
                query.min_lon,
                query.max_lat,
                query.max_lon,
                visibility_window,
                now,
            )
        })
        .await??;

        Ok(merge(cache_hits, store_hits))
    }
}

/// Merge cache and store results, keyed by `icao24`. On overlap the cache's
/// copy wins only when it is the §4.4-acceptance-rule winner over the
/// store's copy — not unconditionally (spec §8 scenario 6) — since a cache
/// entry can itself lag the store by the insert-after-upsert window.
fn merge(cache_hits: Vec<StateRecord>, store_hits: Vec<StateRecord>) -> Vec<StateRecord> {
    let mut by_icao24: HashMap<String, StateRecord> = HashMap::with_capacity(cache_hits.len() + store_hits.len());
    for record in store_hits {
        by_icao24.insert(record.icao24.clone(), record);
    }
    for cache_record in cache_hits {
        match by_icao24.get(&cache_record.icao24) {
            Some(store_record) => {
                if outranks(&cache_record, store_record) {
                    by_icao24.insert(cache_record.icao24.clone(), cache_record);
                }
            }
            None => {
                by_icao24.insert(cache_record.icao24.clone(), cache_record);
            }
        }
    }
    by_icao24.into_values().collect()
}

/// Whether `a` outranks `b` by the `(priority, ingestion_ts)` tuple from
/// spec §8 scenario 6 — lower `source_priority` wins, ties broken by the
/// later `ingestion_timestamp`. Deliberately ignores `last_contact` and the
/// staleness override here: those govern whether a *write* is accepted into
/// the store, not which of two already-accepted copies of the same record
/// a read should prefer.
fn outranks(a: &StateRecord, b: &StateRecord) -> bool {
    if a.source_priority != b.source_priority {
        a.source_priority < b.source_priority
    } else {
        a.ingestion_timestamp > b.ingestion_timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SourceTag;

    fn record(icao24: &str, ts: DateTime<Utc>) -> StateRecord {
        StateRecord {
            icao24: icao24.to_string(),
            callsign: None,
            country: None,
            latitude: Some(0.0),
            longitude: Some(0.0),
            baro_altitude: None,
            geo_altitude: None,
            on_ground: false,
            velocity: None,
            true_track: None,
            vertical_rate: None,
            last_contact: ts.timestamp(),
            ingestion_timestamp: ts,
            data_source: SourceTag::GlobalPublic,
            source_priority: 30,
            feeder_id: None,
            category: None,
            squawk: None,
            emergency: false,
        }
    }

    #[test]
    fn bounds_query_rejects_inverted_bounds() {
        let q = BoundsQuery { min_lat: 10.0, min_lon: 0.0, max_lat: 5.0, max_lon: 1.0 };
        assert!(q.validate().is_err());
    }

    #[test]
    fn bounds_query_accepts_world_bounds() {
        let q = BoundsQuery { min_lat: -90.0, min_lon: -180.0, max_lat: 90.0, max_lon: 180.0 };
        assert!(q.validate().is_ok());
    }

    #[test]
    fn merge_prefers_cache_copy_on_overlap() {
        let now = Utc::now();
        let cache_record = record("a12b34", now);
        let mut store_record = record("a12b34", now - chrono::Duration::seconds(30));
        store_record.callsign = Some("STALE".to_string());

        let merged = merge(vec![cache_record.clone()], vec![store_record]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].ingestion_timestamp, cache_record.ingestion_timestamp);
    }

    #[test]
    fn merge_prefers_store_copy_when_it_outranks_cache() {
        let now = Utc::now();
        let mut cache_record = record("a12b34", now);
        cache_record.source_priority = 30;
        let mut store_record = record("a12b34", now - chrono::Duration::seconds(30));
        store_record.source_priority = 10;

        let merged = merge(vec![cache_record], vec![store_record.clone()]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].source_priority, store_record.source_priority);
    }

    #[test]
    fn merge_includes_store_only_records() {
        let now = Utc::now();
        let cache_record = record("a12b34", now);
        let store_only = record("b56c78", now);

        let merged = merge(vec![cache_record], vec![store_only]);
        assert_eq!(merged.len(), 2);
    }
}
