//! Aircraft state domain model: the state record, history record, and the
//! acceptance predicate that reconciles conflicting reports for the same
//! `icao24` (spec §3, §4.4).

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_derive_enum::DbEnum;
use serde::{Deserialize, Serialize};

use crate::schema::{history_records, state_records};

/// Source tags and their priority, lower number wins (spec §4.4). `Websocket`
/// is part of the canonical table but no adapter in this crate emits it —
/// there is no push-from-self source in scope here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, DbEnum)]
#[db_enum(existing_type_path = "crate::schema::sql_types::SourceTag")]
#[serde(rename_all = "snake_case")]
pub enum SourceTag {
    Websocket,
    Feeder,
    RegionalCommercial,
    GlobalPublic,
}

impl SourceTag {
    pub const fn priority(self) -> i32 {
        match self {
            SourceTag::Websocket => 5,
            SourceTag::Feeder => 10,
            SourceTag::RegionalCommercial => 20,
            SourceTag::GlobalPublic => 30,
        }
    }
}

impl std::fmt::Display for SourceTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SourceTag::Websocket => "websocket",
            SourceTag::Feeder => "feeder",
            SourceTag::RegionalCommercial => "regional_commercial",
            SourceTag::GlobalPublic => "global_public",
        };
        write!(f, "{s}")
    }
}

/// Altitude validity range (metres), per §8's quantified invariant.
pub const MIN_BARO_ALTITUDE_M: f64 = -500.0;
pub const MAX_BARO_ALTITUDE_M: f64 = 25_000.0;

/// Unit conversions applied at the adapter boundary (spec §4.3, CRITICAL).
pub const FEET_TO_METRES: f64 = 0.3048;
pub const MPS_TO_KNOTS: f64 = 1.94384;

/// One record per aircraft: the most-recently-accepted telemetry (spec §3).
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, AsChangeset, Serialize)]
#[diesel(table_name = state_records)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct StateRecord {
    pub icao24: String,
    pub callsign: Option<String>,
    pub country: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub baro_altitude: Option<f64>,
    pub geo_altitude: Option<f64>,
    pub on_ground: bool,
    pub velocity: Option<f64>,
    pub true_track: Option<f64>,
    pub vertical_rate: Option<f64>,
    pub last_contact: i64,
    pub ingestion_timestamp: DateTime<Utc>,
    pub data_source: SourceTag,
    pub source_priority: i32,
    pub feeder_id: Option<String>,
    pub category: Option<i32>,
    pub squawk: Option<String>,
    pub emergency: bool,
}

/// Append-only copy of every accepted state-change (spec §3). Same shape as
/// [`StateRecord`] but with its own surrogate key and no upsert semantics.
#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = history_records)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct NewHistoryRecord {
    pub icao24: String,
    pub callsign: Option<String>,
    pub country: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub baro_altitude: Option<f64>,
    pub geo_altitude: Option<f64>,
    pub on_ground: bool,
    pub velocity: Option<f64>,
    pub true_track: Option<f64>,
    pub vertical_rate: Option<f64>,
    pub last_contact: i64,
    pub ingestion_timestamp: DateTime<Utc>,
    pub data_source: SourceTag,
    pub source_priority: i32,
    pub feeder_id: Option<String>,
    pub category: Option<i32>,
    pub squawk: Option<String>,
    pub emergency: bool,
}

impl From<&StateRecord> for NewHistoryRecord {
    fn from(s: &StateRecord) -> Self {
        Self {
            icao24: s.icao24.clone(),
            callsign: s.callsign.clone(),
            country: s.country.clone(),
            latitude: s.latitude,
            longitude: s.longitude,
            baro_altitude: s.baro_altitude,
            geo_altitude: s.geo_altitude,
            on_ground: s.on_ground,
            velocity: s.velocity,
            true_track: s.true_track,
            vertical_rate: s.vertical_rate,
            last_contact: s.last_contact,
            ingestion_timestamp: s.ingestion_timestamp,
            data_source: s.data_source,
            source_priority: s.source_priority,
            feeder_id: s.feeder_id.clone(),
            category: s.category,
            squawk: s.squawk.clone(),
            emergency: s.emergency,
        }
    }
}

/// A single normalized observation as it comes off a source adapter, before
/// it is wrapped in a queue envelope. Already unit-converted and validated
/// shallowly (coordinate ranges, `icao24` presence); the acceptance decision
/// itself is made later, against the stored record, by the repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedState {
    pub icao24: String,
    pub callsign: Option<String>,
    pub country: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub baro_altitude: Option<f64>,
    pub geo_altitude: Option<f64>,
    pub on_ground: bool,
    pub velocity: Option<f64>,
    pub true_track: Option<f64>,
    pub vertical_rate: Option<f64>,
    pub last_contact: i64,
    pub category: Option<i32>,
    pub squawk: Option<String>,
    pub emergency: bool,
}

impl NormalizedState {
    /// Shallow validation applied at the adapter boundary: a normalized
    /// state with a missing identity or clearly-wrong units is dropped
    /// before it ever reaches the queue (spec §4.3).
    pub fn validate(&self) -> Result<(), String> {
        if self.icao24.trim().is_empty() {
            return Err("missing icao24".to_string());
        }
        if self.icao24.len() != 6 || !self.icao24.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!("icao24 not 6 hex characters: {:?}", self.icao24));
        }
        if let Some(lat) = self.latitude
            && !(-90.0..=90.0).contains(&lat)
        {
            return Err(format!("latitude out of range: {lat}"));
        }
        if let Some(lon) = self.longitude
            && !(-180.0..=180.0).contains(&lon)
        {
            return Err(format!("longitude out of range: {lon}"));
        }
        if let Some(alt) = self.baro_altitude
            && !(MIN_BARO_ALTITUDE_M..=MAX_BARO_ALTITUDE_M).contains(&alt)
        {
            return Err(format!("baro_altitude out of range (metres): {alt}"));
        }
        Ok(())
    }

    /// Trim trailing whitespace from the callsign, per §4.3's normalization
    /// rules. Called by adapters after unit conversion, before `validate`.
    pub fn trim_callsign(&mut self) {
        if let Some(cs) = &mut self.callsign {
            let trimmed = cs.trim_end().to_string();
            *cs = trimmed;
        }
    }
}

/// Normalized message carried on the ingest queue (spec §3 "Queue message").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestMessage {
    pub state: NormalizedState,
    pub source: SourceTag,
    pub source_priority: i32,
    pub ingestion_timestamp: DateTime<Utc>,
    pub feeder_id: Option<String>,
    pub attempts: u32,
    /// Bulk-backfill messages set this so the worker skips the history
    /// insert (spec §4.4 post-accept action ii).
    #[serde(default)]
    pub skip_history: bool,
}

/// The outcome of applying the §4.4 acceptance rules to an incoming record
/// `R` against a stored record `S`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    Accept,
    Reject,
}

/// The minimal projection of a stored record needed to run the acceptance
/// predicate, so it can be exercised in tests without a database round-trip.
#[derive(Debug, Clone, Copy)]
pub struct AcceptanceInput {
    pub last_contact: i64,
    pub source_priority: i32,
    pub ingestion_timestamp: DateTime<Utc>,
}

/// Apply the §4.4 acceptance decision: incoming `r` against stored `s`
/// (`None` when no stored record exists), with the staleness override from
/// §4.4 folded in. Pure and total — the single source of truth both the SQL
/// WHERE-equivalent in the repository and the read API's merge logic encode.
pub fn decide_acceptance(
    r: AcceptanceInput,
    s: Option<AcceptanceInput>,
    stale_threshold: chrono::Duration,
    now: DateTime<Utc>,
) -> Acceptance {
    let Some(s) = s else {
        return Acceptance::Accept;
    };

    if r.last_contact > s.last_contact {
        return Acceptance::Accept;
    }
    if r.last_contact < s.last_contact {
        return apply_staleness_override(s, stale_threshold, now, false);
    }

    // last_contact equal
    if r.source_priority < s.source_priority {
        return Acceptance::Accept;
    }
    if r.source_priority > s.source_priority {
        return apply_staleness_override(s, stale_threshold, now, false);
    }
    if r.ingestion_timestamp > s.ingestion_timestamp {
        Acceptance::Accept
    } else {
        Acceptance::Reject
    }
}

fn apply_staleness_override(
    s: AcceptanceInput,
    stale_threshold: chrono::Duration,
    now: DateTime<Utc>,
    _would_reject_by_tiebreak: bool,
) -> Acceptance {
    let s_age = now - DateTime::<Utc>::from_timestamp(s.last_contact, 0).unwrap_or(now);
    if s_age > stale_threshold {
        Acceptance::Accept
    } else {
        Acceptance::Reject
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(last_contact: i64, priority: i32, ingestion_offset_secs: i64) -> AcceptanceInput {
        AcceptanceInput {
            last_contact,
            source_priority: priority,
            ingestion_timestamp: Utc::now() + chrono::Duration::seconds(ingestion_offset_secs),
        }
    }

    #[test]
    fn accepts_when_no_stored_record() {
        let r = input(1000, 30, 0);
        assert_eq!(
            decide_acceptance(r, None, chrono::Duration::seconds(600), Utc::now()),
            Acceptance::Accept
        );
    }

    #[test]
    fn accepts_newer_last_contact() {
        let s = input(1000, 10, 0);
        let r = input(1001, 30, 0);
        assert_eq!(
            decide_acceptance(r, Some(s), chrono::Duration::seconds(600), Utc::now()),
            Acceptance::Accept
        );
    }

    #[test]
    fn rejects_older_last_contact_when_not_stale() {
        let s = input(1000, 30, 0);
        let r = input(999, 10, 0);
        let now = Utc::now();
        assert_eq!(
            decide_acceptance(r, Some(s), chrono::Duration::seconds(600), now),
            Acceptance::Reject
        );
    }

    #[test]
    fn feeder_beats_public_at_equal_last_contact() {
        // scenario 1: feeder (priority 10) beats global-public (priority 30)
        let s = input(1000, 30, 0);
        let r = input(1000, 10, 0);
        assert_eq!(
            decide_acceptance(r, Some(s), chrono::Duration::seconds(600), Utc::now()),
            Acceptance::Accept
        );
    }

    #[test]
    fn lower_priority_source_rejected_at_equal_last_contact_when_fresh() {
        let s = input(1000, 10, 0);
        let r = input(1000, 30, 0);
        let now = Utc::now();
        assert_eq!(
            decide_acceptance(r, Some(s), chrono::Duration::seconds(600), now),
            Acceptance::Reject
        );
    }

    #[test]
    fn tie_break_by_ingestion_timestamp_on_full_equality() {
        // scenario 3: same last_contact, same priority, later ingestion wins
        let now = Utc::now();
        let s = AcceptanceInput {
            last_contact: 2000,
            source_priority: 20,
            ingestion_timestamp: now,
        };
        let r = AcceptanceInput {
            last_contact: 2000,
            source_priority: 20,
            ingestion_timestamp: now + chrono::Duration::seconds(5),
        };
        assert_eq!(
            decide_acceptance(r, Some(s), chrono::Duration::seconds(600), now),
            Acceptance::Accept
        );
        // and the reverse arrival order yields the same final state
        assert_eq!(
            decide_acceptance(s, Some(r), chrono::Duration::seconds(600), now),
            Acceptance::Reject
        );
    }

    #[test]
    fn staleness_override_accepts_lower_priority_replacement() {
        // scenario 2: stored record is 900s stale (> 600s threshold), so a
        // lower-priority but fresher record is accepted despite rule 4b.
        let now = Utc::now();
        let s = AcceptanceInput {
            last_contact: (now - chrono::Duration::seconds(900)).timestamp(),
            source_priority: 10,
            ingestion_timestamp: now - chrono::Duration::seconds(900),
        };
        let r = AcceptanceInput {
            last_contact: (now - chrono::Duration::seconds(100)).timestamp(),
            source_priority: 30,
            ingestion_timestamp: now,
        };
        assert_eq!(
            decide_acceptance(r, Some(s), chrono::Duration::seconds(600), now),
            Acceptance::Accept
        );
    }

    #[test]
    fn staleness_override_does_not_apply_when_stored_record_is_fresh() {
        let now = Utc::now();
        let s = input(
            (now - chrono::Duration::seconds(60)).timestamp(),
            10,
            -60,
        );
        let r = input((now - chrono::Duration::seconds(30)).timestamp(), 30, 0);
        assert_eq!(
            decide_acceptance(r, Some(s), chrono::Duration::seconds(600), now),
            Acceptance::Reject
        );
    }

    #[test]
    fn commutativity_under_acceptance_rules() {
        // applying A then B, or B then A, must converge to the same winner.
        let now = Utc::now();
        let a = AcceptanceInput {
            last_contact: 5000,
            source_priority: 20,
            ingestion_timestamp: now,
        };
        let b = AcceptanceInput {
            last_contact: 5000,
            source_priority: 10,
            ingestion_timestamp: now,
        };
        // b has higher priority (lower number), so b always wins regardless
        // of application order.
        let order1_accepts_b = decide_acceptance(b, Some(a), chrono::Duration::seconds(600), now);
        let order2_rejects_a = decide_acceptance(a, Some(b), chrono::Duration::seconds(600), now);
        assert_eq!(order1_accepts_b, Acceptance::Accept);
        assert_eq!(order2_rejects_a, Acceptance::Reject);
    }

    #[test]
    fn validate_rejects_missing_icao24() {
        let s = NormalizedState {
            icao24: String::new(),
            callsign: None,
            country: None,
            latitude: None,
            longitude: None,
            baro_altitude: None,
            geo_altitude: None,
            on_ground: false,
            velocity: None,
            true_track: None,
            vertical_rate: None,
            last_contact: 0,
            category: None,
            squawk: None,
            emergency: false,
        };
        assert!(s.validate().is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_altitude() {
        let mut s = NormalizedState {
            icao24: "a12b34".to_string(),
            callsign: None,
            country: None,
            latitude: Some(0.0),
            longitude: Some(0.0),
            baro_altitude: Some(30_000.0),
            geo_altitude: None,
            on_ground: false,
            velocity: None,
            true_track: None,
            vertical_rate: None,
            last_contact: 0,
            category: None,
            squawk: None,
            emergency: false,
        };
        assert!(s.validate().is_err());
        s.baro_altitude = Some(10_000.0);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn trim_callsign_removes_trailing_whitespace() {
        let mut s = NormalizedState {
            icao24: "a12b34".to_string(),
            callsign: Some("N12345  ".to_string()),
            country: None,
            latitude: None,
            longitude: None,
            baro_altitude: None,
            geo_altitude: None,
            on_ground: false,
            velocity: None,
            true_track: None,
            vertical_rate: None,
            last_contact: 0,
            category: None,
            squawk: None,
            emergency: false,
        };
        s.trim_callsign();
        assert_eq!(s.callsign.as_deref(), Some("N12345"));
    }
}
