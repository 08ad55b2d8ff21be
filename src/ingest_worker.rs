//! Ingestion worker (spec §4.4, C4): the authoritative serializer. Each of
//! `W` parallel worker tasks runs `reserve -> decide -> persist -> fan-out`
//! in a tight loop, opportunistically draining a batch after the first
//! blocking reserve.
//!
//! Ordering for a given `icao24` is not preserved at the queue level; the
//! conditional upsert in [`crate::state_repository`] is what makes two
//! workers applying two messages for the same aircraft converge regardless
//! of arrival order (spec §4.4 "Concurrency").

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};

use crate::config::Config;
use crate::hot_cache::LiveStateCache;
use crate::queue::{RedisQueue, retry_backoff_ms};
use crate::state::{IngestMessage, StateRecord};
use crate::state_repository::StateRepository;
use crate::webhook::{NewEvent, WebhookPublisher};

/// Position/altitude deltas beyond which a position-update event is emitted
/// even without a periodic re-announce (spec §4.4 post-accept action iv).
const POSITION_EPSILON_DEGREES: f64 = 0.01;
const ALTITUDE_DELTA_METRES: f64 = 50.0;
/// Periodic re-announce interval per aircraft, independent of the deltas.
const PERIODIC_EVENT_INTERVAL_SECS: i64 = 60;

pub struct IngestWorker {
    queue: RedisQueue,
    repository: Arc<StateRepository>,
    cache: Arc<LiveStateCache>,
    publisher: Arc<WebhookPublisher>,
    config: Config,
}

impl IngestWorker {
    pub fn new(
        queue: RedisQueue,
        repository: Arc<StateRepository>,
        cache: Arc<LiveStateCache>,
        publisher: Arc<WebhookPublisher>,
        config: Config,
    ) -> Self {
        Self {
            queue,
            repository,
            cache,
            publisher,
            config,
        }
    }

    /// One iteration of the worker loop: promote due delayed messages, then
    /// block-reserve up to `batch_size` messages (first with the full poll
    /// timeout, the rest with a short timeout to amortize persistence
    /// round-trips without unboundedly delaying the batch).
    pub async fn run_once(&self) -> Result<()> {
        let _ = self.queue.promote(Utc::now().timestamp_millis(), 500).await;

        let Some(first) = self
            .queue
            .reserve::<IngestMessage>(self.config.poll_timeout)
            .await?
        else {
            return Ok(());
        };

        let mut batch = vec![first];
        let drain_timeout = Duration::from_millis(50);
        while batch.len() < self.config.batch_size {
            match self.queue.reserve::<IngestMessage>(drain_timeout).await? {
                Some(msg) => batch.push(msg),
                None => break,
            }
        }

        for message in batch {
            self.apply(message).await;
        }

        Ok(())
    }

    /// Apply one message: decide, persist, update cache, fan out. Errors
    /// are handled internally (requeue/park) rather than propagated, so one
    /// bad message never stalls the batch.
    async fn apply(&self, mut message: IngestMessage) {
        let icao24 = message.state.icao24.clone();

        if let Err(e) = message.state.validate() {
            warn!(icao24 = %icao24, error = %e, "dropping invalid observation at ingest");
            metrics::counter!("ingest.validation_dropped_total").increment(1);
            return;
        }

        let record = StateRecord {
            icao24: message.state.icao24.clone(),
            callsign: message.state.callsign.clone(),
            country: message.state.country.clone(),
            latitude: message.state.latitude,
            longitude: message.state.longitude,
            baro_altitude: message.state.baro_altitude,
            geo_altitude: message.state.geo_altitude,
            on_ground: message.state.on_ground,
            velocity: message.state.velocity,
            true_track: message.state.true_track,
            vertical_rate: message.state.vertical_rate,
            last_contact: message.state.last_contact,
            ingestion_timestamp: message.ingestion_timestamp,
            data_source: message.source,
            source_priority: message.source_priority,
            feeder_id: message.feeder_id.clone(),
            category: message.state.category,
            squawk: message.state.squawk.clone(),
            emergency: message.state.emergency,
        };

        let previous = self.cache.get(&icao24);

        let accepted = {
            let repository = Arc::clone(&self.repository);
            let record_clone = record.clone();
            let stale_threshold = self.config.stale_threshold;
            let skip_history = message.skip_history;
            tokio::task::spawn_blocking(move || {
                repository.conditional_upsert(&record_clone, stale_threshold, skip_history)
            })
            .await
        };

        let accepted = match accepted {
            Ok(Ok(accepted)) => accepted,
            Ok(Err(e)) => {
                self.handle_store_error(message, e).await;
                return;
            }
            Err(join_err) => {
                warn!(icao24 = %icao24, error = %join_err, "ingest worker task join error");
                return;
            }
        };

        if !accepted {
            metrics::counter!("ingest.rejected_total").increment(1);
            return;
        }

        metrics::counter!("ingest.accepted_total").increment(1);
        self.cache.upsert(record.clone());

        if should_emit_position_update(previous.as_ref(), &record) {
            self.emit_position_update(&record).await;
        }
    }

    async fn handle_store_error(&self, mut message: IngestMessage, error: anyhow::Error) {
        warn!(icao24 = %message.state.icao24, error = %error, "transient store error on ingest");
        metrics::counter!("ingest.store_error_total").increment(1);

        message.attempts += 1;
        if message.attempts >= self.config.max_attempts {
            if let Err(e) = self.queue.park(&message, "max attempts exhausted").await {
                warn!(error = %e, "failed to park exhausted ingest message");
            }
            return;
        }

        let backoff = retry_backoff_ms(message.attempts, self.config.retry_base_ms, self.config.retry_jitter_ms);
        let available_at_ms = Utc::now().timestamp_millis() + backoff as i64;
        if let Err(e) = self.queue.schedule(&message, available_at_ms).await {
            warn!(error = %e, "failed to reschedule ingest message after store error");
        }
    }

    async fn emit_position_update(&self, record: &StateRecord) {
        let payload = serde_json::json!({
            "icao24": record.icao24,
            "callsign": record.callsign,
            "country": record.country,
            "latitude": record.latitude,
            "longitude": record.longitude,
            "baro_altitude": record.baro_altitude,
            "geo_altitude": record.geo_altitude,
            "on_ground": record.on_ground,
            "velocity": record.velocity,
            "true_track": record.true_track,
            "vertical_rate": record.vertical_rate,
            "last_contact": record.last_contact,
            "data_source": record.data_source.to_string(),
        });

        let event = NewEvent {
            event_type: "aircraft.position_update".to_string(),
            version: "v1".to_string(),
            occurred_at: record.ingestion_timestamp,
            payload,
        };

        if let Err(e) = self.publisher.publish(event).await {
            warn!(icao24 = %record.icao24, error = %e, "failed to publish position-update event");
        }
    }
}

/// Spec §4.4 post-accept action (iv): emit on crossing a position/altitude
/// delta threshold, or every `T` seconds per aircraft regardless of delta.
fn should_emit_position_update(previous: Option<&StateRecord>, current: &StateRecord) -> bool {
    let Some(previous) = previous else {
        return true;
    };

    if previous.ingestion_timestamp <= current.ingestion_timestamp
        && (current.ingestion_timestamp - previous.ingestion_timestamp)
            >= chrono::Duration::seconds(PERIODIC_EVENT_INTERVAL_SECS)
    {
        return true;
    }

    let position_changed = match (
        previous.latitude,
        previous.longitude,
        current.latitude,
        current.longitude,
    ) {
        (Some(plat), Some(plon), Some(clat), Some(clon)) => {
            (plat - clat).abs() > POSITION_EPSILON_DEGREES || (plon - clon).abs() > POSITION_EPSILON_DEGREES
        }
        _ => true,
    };

    let altitude_changed = match (previous.baro_altitude, current.baro_altitude) {
        (Some(p), Some(c)) => (p - c).abs() > ALTITUDE_DELTA_METRES,
        _ => true,
    };

    position_changed || altitude_changed
}
