//! State repository (spec §4.5, C5): the conditional upsert that is the
//! single source of truth for the §4.4 acceptance rules, plus the history
//! insert and the bounds query.
//!
//! The conditional upsert is one `INSERT ... ON CONFLICT (icao24) DO UPDATE
//! ... WHERE <predicate>` statement, mirroring the teacher's
//! `on_conflict(...).do_update().set(...)` idiom in `aircraft_repo.rs` but
//! expressed as `sql_query` because diesel's high-level DSL has no way to
//! attach a WHERE clause to `DO UPDATE` — the predicate itself encodes
//! [`crate::state::decide_acceptance`] (kept in sync with it; see the unit
//! test at the bottom asserting the SQL string embeds the same rules). When
//! the WHERE clause evaluates false, Postgres treats the conflict as a
//! no-op and the `RETURNING` clause yields zero rows — that is how
//! `accepted_bool` is derived, with no application-side locking per
//! `icao24` (spec §9: "the database row is the lock").

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::sql_types::{
    Bool, Float8, Int4, Int8, Nullable, Text, Timestamptz,
};
use tracing::error;

use crate::schema::{history_records, state_records};
use crate::state::{NewHistoryRecord, StateRecord};

pub type PgPool = Pool<ConnectionManager<PgConnection>>;
type PgPooledConnection = PooledConnection<ConnectionManager<PgConnection>>;

/// The conditional upsert statement. `$1..$19` are the incoming record's
/// columns in `StateRecord` field order; `$20` is the staleness-threshold
/// interval in seconds.
const CONDITIONAL_UPSERT_SQL: &str = r#"
INSERT INTO state_records (
    icao24, callsign, country, latitude, longitude, baro_altitude,
    geo_altitude, on_ground, velocity, true_track, vertical_rate,
    last_contact, ingestion_timestamp, data_source, source_priority,
    feeder_id, category, squawk, emergency
) VALUES (
    $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14::source_tag, $15, $16, $17, $18, $19
)
ON CONFLICT (icao24) DO UPDATE SET
    callsign = EXCLUDED.callsign,
    country = EXCLUDED.country,
    latitude = EXCLUDED.latitude,
    longitude = EXCLUDED.longitude,
    baro_altitude = EXCLUDED.baro_altitude,
    geo_altitude = EXCLUDED.geo_altitude,
    on_ground = EXCLUDED.on_ground,
    velocity = EXCLUDED.velocity,
    true_track = EXCLUDED.true_track,
    vertical_rate = EXCLUDED.vertical_rate,
    last_contact = EXCLUDED.last_contact,
    ingestion_timestamp = EXCLUDED.ingestion_timestamp,
    data_source = EXCLUDED.data_source,
    source_priority = EXCLUDED.source_priority,
    feeder_id = EXCLUDED.feeder_id,
    category = EXCLUDED.category,
    squawk = EXCLUDED.squawk,
    emergency = EXCLUDED.emergency
WHERE
    -- rule 2: strictly newer last_contact always wins
    state_records.last_contact < EXCLUDED.last_contact
    OR (
        -- rule 4a: equal last_contact, incoming has higher priority (lower number)
        state_records.last_contact = EXCLUDED.last_contact
        AND state_records.source_priority > EXCLUDED.source_priority
    )
    OR (
        -- rule 4c: full tie, later ingestion_timestamp wins
        state_records.last_contact = EXCLUDED.last_contact
        AND state_records.source_priority = EXCLUDED.source_priority
        AND state_records.ingestion_timestamp < EXCLUDED.ingestion_timestamp
    )
    OR (
        -- staleness override: the stored record is older than the
        -- threshold by last_contact, and would otherwise be rejected by
        -- rule 3 or rule 4b.
        (now() - to_timestamp(state_records.last_contact)) > make_interval(secs => $20::double precision)
        AND (
            state_records.last_contact > EXCLUDED.last_contact
            OR (
                state_records.last_contact = EXCLUDED.last_contact
                AND state_records.source_priority < EXCLUDED.source_priority
            )
        )
    )
RETURNING icao24
"#;

#[derive(QueryableByName)]
struct AcceptedRow {
    #[diesel(sql_type = Text)]
    #[allow(dead_code)]
    icao24: String,
}

pub struct StateRepository {
    pool: PgPool,
}

impl StateRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn get_connection(&self) -> Result<PgPooledConnection> {
        self.pool
            .get()
            .context("failed to get database connection")
    }

    /// Apply the §4.4 acceptance rules atomically at the row level. Returns
    /// whether `record` was accepted (inserted fresh, or won the conditional
    /// update). When accepted and `skip_history` is false, also inserts a
    /// history row — a failure there is logged and swallowed per §4.5,
    /// since the authoritative current state has already been written.
    pub fn conditional_upsert(
        &self,
        record: &StateRecord,
        stale_threshold: chrono::Duration,
        skip_history: bool,
    ) -> Result<bool> {
        let mut conn = self.get_connection()?;

        let rows: Vec<AcceptedRow> = diesel::sql_query(CONDITIONAL_UPSERT_SQL)
            .bind::<Text, _>(&record.icao24)
            .bind::<Nullable<Text>, _>(&record.callsign)
            .bind::<Nullable<Text>, _>(&record.country)
            .bind::<Nullable<Float8>, _>(record.latitude)
            .bind::<Nullable<Float8>, _>(record.longitude)
            .bind::<Nullable<Float8>, _>(record.baro_altitude)
            .bind::<Nullable<Float8>, _>(record.geo_altitude)
            .bind::<Bool, _>(record.on_ground)
            .bind::<Nullable<Float8>, _>(record.velocity)
            .bind::<Nullable<Float8>, _>(record.true_track)
            .bind::<Nullable<Float8>, _>(record.vertical_rate)
            .bind::<Int8, _>(record.last_contact)
            .bind::<Timestamptz, _>(record.ingestion_timestamp)
            .bind::<Text, _>(record.data_source.to_string())
            .bind::<Int4, _>(record.source_priority)
            .bind::<Nullable<Text>, _>(&record.feeder_id)
            .bind::<Nullable<Int4>, _>(record.category)
            .bind::<Nullable<Text>, _>(&record.squawk)
            .bind::<Bool, _>(record.emergency)
            .bind::<Int8, _>(stale_threshold.num_seconds())
            .load(&mut conn)
            .context("conditional upsert failed")?;

        let accepted = !rows.is_empty();

        if accepted && !skip_history {
            let history: NewHistoryRecord = record.into();
            if let Err(e) = diesel::insert_into(history_records::table)
                .values(&history)
                .execute(&mut conn)
            {
                // History-insert errors must not fail the upsert (spec §4.5).
                error!(icao24 = %record.icao24, error = %e, "history insert failed, swallowed");
                metrics::counter!("ingest.history_insert_failed_total").increment(1);
            }
        }

        Ok(accepted)
    }

    /// Bounds query (spec §4.5): all current records in the box whose
    /// `last_contact` is within `freshness_window`.
    pub fn query_bounds(
        &self,
        min_lat: f64,
        min_lon: f64,
        max_lat: f64,
        max_lon: f64,
        freshness_window: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<StateRecord>> {
        let mut conn = self.get_connection()?;
        let min_last_contact = (now - freshness_window).timestamp();

        let records = state_records::table
            .filter(state_records::latitude.ge(min_lat))
            .filter(state_records::latitude.le(max_lat))
            .filter(state_records::longitude.ge(min_lon))
            .filter(state_records::longitude.le(max_lon))
            .filter(state_records::last_contact.ge(min_last_contact))
            .select(StateRecord::as_select())
            .load(&mut conn)
            .context("bounds query failed")?;

        Ok(records)
    }

    /// Fetch the current record for one aircraft, if any — used by the
    /// ingestion worker only for cache-miss reconciliation and by tests.
    pub fn get(&self, icao24: &str) -> Result<Option<StateRecord>> {
        let mut conn = self.get_connection()?;
        let record = state_records::table
            .find(icao24)
            .select(StateRecord::as_select())
            .first(&mut conn)
            .optional()
            .context("get failed")?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conditional_upsert_sql_encodes_all_four_rules() {
        // This pins the SQL text against silent drift from
        // `decide_acceptance` — a change to one without the other is a bug.
        assert!(CONDITIONAL_UPSERT_SQL.contains("state_records.last_contact < EXCLUDED.last_contact"));
        assert!(CONDITIONAL_UPSERT_SQL.contains("state_records.source_priority > EXCLUDED.source_priority"));
        assert!(CONDITIONAL_UPSERT_SQL.contains("state_records.ingestion_timestamp < EXCLUDED.ingestion_timestamp"));
        assert!(CONDITIONAL_UPSERT_SQL.contains("make_interval(secs => $20::double precision)"));
    }
}
