//! Global-public adapter (spec §4.3): polls a single worldwide states
//! endpoint every `P_public` seconds. On HTTP error or rate-limit it skips
//! the cycle — no in-cycle retry, the next scheduled poll picks it back up.
//!
//! Modeled on the teacher's `OpenAipClient` (`openaip_client.rs`): a thin
//! `reqwest::Client` wrapper owning base URL and credentials, one method
//! per endpoint, `serde` structs matching the upstream JSON shape.

use anyhow::{Context, Result};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::queue::RedisQueue;
use crate::source_adapters::normalize::{finish_normalizing, feet_to_metres, mps_to_knots};
use crate::state::{IngestMessage, NormalizedState, SourceTag};

/// OpenSky-style `/states/all` response: `states` is an array of
/// positional arrays, not objects — index-based like the upstream API.
#[derive(Debug, Deserialize)]
struct StatesResponse {
    time: i64,
    states: Option<Vec<Vec<serde_json::Value>>>,
}

pub struct GlobalPublicAdapter {
    client: Client,
    base_url: String,
    credentials: Option<(String, String)>,
    queue: RedisQueue,
}

impl GlobalPublicAdapter {
    pub fn new(base_url: impl Into<String>, credentials: Option<(String, String)>, queue: RedisQueue) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            credentials,
            queue,
        }
    }

    /// Run one poll cycle: fetch, normalize, enqueue. Errors are logged and
    /// swallowed — this is "skip the cycle", not a retry.
    pub async fn poll_once(&self) {
        match self.fetch_and_enqueue().await {
            Ok(enqueued) => {
                info!(enqueued, "global-public adapter cycle complete");
            }
            Err(e) => {
                warn!(error = %e, "global-public adapter cycle failed, skipping");
                metrics::counter!("ingest.source.global_public.cycle_failed_total").increment(1);
            }
        }
    }

    async fn fetch_and_enqueue(&self) -> Result<usize> {
        let mut request = self.client.get(format!("{}/states/all", self.base_url));
        if let Some((user, pass)) = &self.credentials {
            request = request.basic_auth(user, Some(pass));
        }

        let response = request.send().await.context("global-public fetch failed")?;
        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            anyhow::bail!("rate limited by global-public source");
        }
        let response = response.error_for_status().context("global-public returned error status")?;
        let body: StatesResponse = response.json().await.context("failed to parse global-public response")?;

        let ingestion_timestamp = chrono::Utc::now();
        let mut enqueued = 0usize;
        let mut dropped = 0usize;

        for raw in body.states.unwrap_or_default() {
            match normalize_row(&raw, body.time) {
                Ok(state) => {
                    let message = IngestMessage {
                        state,
                        source: SourceTag::GlobalPublic,
                        source_priority: SourceTag::GlobalPublic.priority(),
                        ingestion_timestamp,
                        feeder_id: None,
                        attempts: 0,
                        skip_history: false,
                    };
                    if let Err(e) = self.queue.enqueue(&message).await {
                        warn!(error = %e, "failed to enqueue global-public observation");
                    } else {
                        enqueued += 1;
                    }
                }
                Err(reason) => {
                    debug!(reason, "dropping global-public observation");
                    dropped += 1;
                }
            }
        }

        if dropped > 0 {
            metrics::counter!("ingest.source.global_public.dropped_total").increment(dropped as u64);
        }
        Ok(enqueued)
    }
}

/// Indices into the positional state-vector array, matching the upstream
/// worldwide-states wire format.
fn normalize_row(row: &[serde_json::Value], fallback_time: i64) -> Result<NormalizedState, String> {
    let icao24 = row
        .first()
        .and_then(|v| v.as_str())
        .ok_or_else(|| "missing icao24".to_string())?
        .trim()
        .to_lowercase();

    let callsign = row.get(1).and_then(|v| v.as_str()).map(str::to_string);
    let country = row.get(2).and_then(|v| v.as_str()).map(str::to_string);
    let last_contact = row
        .get(4)
        .and_then(|v| v.as_i64())
        .unwrap_or(fallback_time);
    let longitude = row.get(5).and_then(|v| v.as_f64());
    let latitude = row.get(6).and_then(|v| v.as_f64());
    // Upstream reports baro_altitude in metres already; geo_altitude too.
    let baro_altitude = row.get(7).and_then(|v| v.as_f64());
    let on_ground = row.get(8).and_then(|v| v.as_bool()).unwrap_or(false);
    // Upstream reports velocity in m/s and vertical_rate in m/s.
    let velocity_mps = row.get(9).and_then(|v| v.as_f64());
    let true_track = row.get(10).and_then(|v| v.as_f64());
    let vertical_rate_mps = row.get(11).and_then(|v| v.as_f64());
    let geo_altitude = row.get(13).and_then(|v| v.as_f64());
    let squawk = row.get(14).and_then(|v| v.as_str()).map(str::to_string);
    let emergency = false;
    let category = row.get(17).and_then(|v| v.as_i64()).map(|c| c as i32);

    let state = NormalizedState {
        icao24,
        callsign,
        country,
        latitude,
        longitude,
        baro_altitude,
        geo_altitude,
        on_ground,
        velocity: velocity_mps.map(mps_to_knots),
        true_track,
        vertical_rate: vertical_rate_mps,
        last_contact,
        category,
        squawk,
        emergency,
    };

    finish_normalizing(state)
}

/// Exercised by the regional-commercial adapter too when its upstream
/// reports feet instead of metres: kept here since it's the canonical
/// conversion path for this source family.
#[allow(dead_code)]
fn normalize_feet_altitude(feet: f64) -> f64 {
    feet_to_metres(feet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_row_converts_velocity_and_keeps_altitude() {
        let row = vec![
            json!("a12b34"),
            json!("UAL123  "),
            json!("United States"),
            json!(null),
            json!(1_700_000_000_i64),
            json!(-122.0),
            json!(37.0),
            json!(10000.0),
            json!(false),
            json!(100.0),
            json!(90.0),
            json!(0.0),
            json!(null),
            json!(10200.0),
            json!("1200"),
        ];
        let normalized = normalize_row(&row, 0).expect("should normalize");
        assert_eq!(normalized.icao24, "a12b34");
        assert_eq!(normalized.callsign.as_deref(), Some("UAL123"));
        assert!((normalized.velocity.unwrap() - mps_to_knots(100.0)).abs() < 1e-9);
    }

    #[test]
    fn normalize_row_rejects_missing_icao24() {
        let row = vec![json!(null)];
        assert!(normalize_row(&row, 0).is_err());
    }
}
