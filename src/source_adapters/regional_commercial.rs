//! Regional-commercial adapter (spec §4.3): polls a lat/lon grid of cells,
//! paced by a global token bucket (default 1 req/s) to respect the vendor's
//! rate limit. Cells that returned nothing interesting on their last poll
//! are polled less often ("stale cells polled less often").

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::queue::RedisQueue;
use crate::source_adapters::normalize::finish_normalizing;
use crate::state::{IngestMessage, NormalizedState, SourceTag};

/// A single grid cell, in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cell {
    pub min_lat: f64,
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
}

impl Cell {
    fn key(&self) -> (i64, i64) {
        ((self.min_lat * 100.0) as i64, (self.min_lon * 100.0) as i64)
    }
}

/// Build a grid of cells covering the whole world at `cell_size_degrees`
/// resolution.
pub fn build_grid(cell_size_degrees: f64) -> Vec<Cell> {
    let mut cells = Vec::new();
    let mut lat = -90.0;
    while lat < 90.0 {
        let mut lon = -180.0;
        while lon < 180.0 {
            cells.push(Cell {
                min_lat: lat,
                min_lon: lon,
                max_lat: (lat + cell_size_degrees).min(90.0),
                max_lon: (lon + cell_size_degrees).min(180.0),
            });
            lon += cell_size_degrees;
        }
        lat += cell_size_degrees;
    }
    cells
}

/// Process-local pacing: one permit is available every `1/rate_per_sec`
/// seconds, shared across every cell so the adapter never exceeds the
/// vendor's global rate limit.
struct TokenPacer {
    interval: Duration,
    next_allowed: Mutex<Instant>,
}

impl TokenPacer {
    fn new(rate_per_sec: u32) -> Self {
        let rate = rate_per_sec.max(1);
        Self {
            interval: Duration::from_secs_f64(1.0 / rate as f64),
            next_allowed: Mutex::new(Instant::now()),
        }
    }

    async fn acquire(&self) {
        let wait_until = {
            let mut next = self.next_allowed.lock().unwrap();
            let now = Instant::now();
            let scheduled = (*next).max(now);
            *next = scheduled + self.interval;
            scheduled
        };
        tokio::time::sleep_until(wait_until).await;
    }
}

struct CellState {
    last_polled: chrono::DateTime<Utc>,
    interval: chrono::Duration,
}

const BASE_CELL_INTERVAL_SECS: i64 = 30;
const MAX_CELL_INTERVAL_SECS: i64 = 600;

#[derive(Debug, Deserialize)]
struct CellResponse {
    aircraft: Vec<CellAircraft>,
}

#[derive(Debug, Deserialize)]
struct CellAircraft {
    icao24: String,
    callsign: Option<String>,
    country: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    altitude_m: Option<f64>,
    ground_speed_kn: Option<f64>,
    track_deg: Option<f64>,
    vertical_rate_mps: Option<f64>,
    last_contact: i64,
    squawk: Option<String>,
}

pub struct RegionalCommercialAdapter {
    client: Client,
    base_url: String,
    api_key: String,
    queue: RedisQueue,
    pacer: TokenPacer,
    cells: Vec<Cell>,
    cell_state: Mutex<HashMap<(i64, i64), CellState>>,
}

impl RegionalCommercialAdapter {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        queue: RedisQueue,
        cell_size_degrees: f64,
        rate_per_sec: u32,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            queue,
            pacer: TokenPacer::new(rate_per_sec),
            cells: build_grid(cell_size_degrees),
            cell_state: Mutex::new(HashMap::new()),
        }
    }

    /// One poll cycle: for every cell due for a refresh, acquire a pacing
    /// permit then fetch+enqueue. Cells not yet due are skipped silently.
    pub async fn poll_once(&self) {
        let now = Utc::now();
        let due: Vec<Cell> = self
            .cells
            .iter()
            .filter(|c| self.is_due(c, now))
            .copied()
            .collect();

        for cell in due {
            self.pacer.acquire().await;
            match self.fetch_cell(&cell).await {
                Ok(count) => self.record_poll(&cell, now, count),
                Err(e) => {
                    warn!(error = %e, "regional-commercial cell fetch failed, skipping");
                    metrics::counter!("ingest.source.regional_commercial.cell_failed_total").increment(1);
                }
            }
        }
    }

    fn is_due(&self, cell: &Cell, now: chrono::DateTime<Utc>) -> bool {
        let state = self.cell_state.lock().unwrap();
        match state.get(&cell.key()) {
            Some(s) => now - s.last_polled >= s.interval,
            None => true,
        }
    }

    fn record_poll(&self, cell: &Cell, now: chrono::DateTime<Utc>, observation_count: usize) {
        let mut state = self.cell_state.lock().unwrap();
        let entry = state.entry(cell.key()).or_insert(CellState {
            last_polled: now,
            interval: chrono::Duration::seconds(BASE_CELL_INTERVAL_SECS),
        });
        entry.last_polled = now;
        entry.interval = if observation_count == 0 {
            (entry.interval * 2).min(chrono::Duration::seconds(MAX_CELL_INTERVAL_SECS))
        } else {
            chrono::Duration::seconds(BASE_CELL_INTERVAL_SECS)
        };
    }

    async fn fetch_cell(&self, cell: &Cell) -> Result<usize> {
        let response = self
            .client
            .get(format!("{}/v1/cell", self.base_url))
            .bearer_auth(&self.api_key)
            .query(&[
                ("min_lat", cell.min_lat),
                ("min_lon", cell.min_lon),
                ("max_lat", cell.max_lat),
                ("max_lon", cell.max_lon),
            ])
            .send()
            .await
            .context("regional-commercial fetch failed")?
            .error_for_status()
            .context("regional-commercial returned error status")?;

        let body: CellResponse = response
            .json()
            .await
            .context("failed to parse regional-commercial response")?;

        let ingestion_timestamp = Utc::now();
        let mut enqueued = 0usize;

        for aircraft in body.aircraft {
            let state = NormalizedState {
                icao24: aircraft.icao24.trim().to_lowercase(),
                callsign: aircraft.callsign,
                country: aircraft.country,
                latitude: aircraft.latitude,
                longitude: aircraft.longitude,
                baro_altitude: aircraft.altitude_m,
                geo_altitude: None,
                on_ground: false,
                velocity: aircraft.ground_speed_kn,
                true_track: aircraft.track_deg,
                vertical_rate: aircraft.vertical_rate_mps,
                last_contact: aircraft.last_contact,
                category: None,
                squawk: aircraft.squawk,
                emergency: false,
            };

            match finish_normalizing(state) {
                Ok(normalized) => {
                    let message = IngestMessage {
                        state: normalized,
                        source: SourceTag::RegionalCommercial,
                        source_priority: SourceTag::RegionalCommercial.priority(),
                        ingestion_timestamp,
                        feeder_id: None,
                        attempts: 0,
                        skip_history: false,
                    };
                    if self.queue.enqueue(&message).await.is_ok() {
                        enqueued += 1;
                    }
                }
                Err(reason) => {
                    debug!(reason, "dropping regional-commercial observation");
                }
            }
        }

        Ok(enqueued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_grid_covers_world_bounds() {
        let cells = build_grid(45.0);
        assert!(cells.iter().any(|c| c.min_lat <= -90.0 + 1e-9));
        assert!(cells.iter().all(|c| c.max_lat <= 90.0 && c.max_lon <= 180.0));
    }

    #[test]
    fn cell_key_distinguishes_distinct_cells() {
        let a = Cell { min_lat: 0.0, min_lon: 0.0, max_lat: 5.0, max_lon: 5.0 };
        let b = Cell { min_lat: 5.0, min_lon: 0.0, max_lat: 10.0, max_lon: 5.0 };
        assert_ne!(a.key(), b.key());
    }
}
