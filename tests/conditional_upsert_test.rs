//! Integration tests for the conditional upsert that backs the acceptance
//! rules (spec §4.4, §4.5): a real row-level race with no application-side
//! locking, exercised against a real database rather than the predicate
//! alone so a regression in the SQL text can't hide behind a passing unit
//! test of `decide_acceptance`.
mod common;

use chrono::{Duration, Utc};
use common::TestDatabase;
use flyoverhead_ingest::state::{SourceTag, StateRecord};
use flyoverhead_ingest::state_repository::StateRepository;

fn state(icao24: &str, last_contact: i64, source: SourceTag, lat: f64) -> StateRecord {
    StateRecord {
        icao24: icao24.to_string(),
        callsign: Some("TEST123".to_string()),
        country: Some("US".to_string()),
        latitude: Some(lat),
        longitude: Some(-122.0),
        baro_altitude: Some(3000.0),
        geo_altitude: Some(3050.0),
        on_ground: false,
        velocity: Some(120.0),
        true_track: Some(270.0),
        vertical_rate: Some(0.0),
        last_contact,
        ingestion_timestamp: Utc::now(),
        data_source: source,
        source_priority: source.priority(),
        feeder_id: None,
        category: None,
        squawk: None,
        emergency: false,
    }
}

#[tokio::test]
async fn fresh_icao24_is_always_accepted() {
    if !common::database_available() {
        eprintln!("skipping: set DATABASE_URL or TEST_DATABASE_URL to run this test");
        return;
    }
    let test_db = TestDatabase::new().await.expect("failed to create test database");
    let repo = StateRepository::new(test_db.pool());

    let accepted = repo
        .conditional_upsert(&state("abc123", 1000, SourceTag::GlobalPublic, 37.0), Duration::seconds(60), false)
        .expect("upsert failed");

    assert!(accepted);
    let stored = repo.get("abc123").expect("get failed").expect("row missing");
    assert_eq!(stored.latitude, Some(37.0));
}

#[tokio::test]
async fn strictly_newer_last_contact_always_wins_even_from_lower_priority_source() {
    if !common::database_available() {
        eprintln!("skipping: set DATABASE_URL or TEST_DATABASE_URL to run this test");
        return;
    }
    let test_db = TestDatabase::new().await.expect("failed to create test database");
    let repo = StateRepository::new(test_db.pool());
    let stale_threshold = Duration::seconds(60);

    repo.conditional_upsert(&state("abc123", 1000, SourceTag::Feeder, 37.0), stale_threshold, false)
        .unwrap();

    let accepted = repo
        .conditional_upsert(&state("abc123", 1001, SourceTag::GlobalPublic, 38.0), stale_threshold, false)
        .expect("upsert failed");

    assert!(accepted);
    let stored = repo.get("abc123").unwrap().unwrap();
    assert_eq!(stored.latitude, Some(38.0));
}

#[tokio::test]
async fn equal_last_contact_lower_priority_report_is_rejected() {
    if !common::database_available() {
        eprintln!("skipping: set DATABASE_URL or TEST_DATABASE_URL to run this test");
        return;
    }
    let test_db = TestDatabase::new().await.expect("failed to create test database");
    let repo = StateRepository::new(test_db.pool());
    let stale_threshold = Duration::seconds(60);

    repo.conditional_upsert(&state("abc123", 1000, SourceTag::Feeder, 37.0), stale_threshold, false)
        .unwrap();

    let accepted = repo
        .conditional_upsert(&state("abc123", 1000, SourceTag::GlobalPublic, 99.0), stale_threshold, false)
        .expect("upsert failed");

    assert!(!accepted);
    let stored = repo.get("abc123").unwrap().unwrap();
    assert_eq!(stored.latitude, Some(37.0), "lower-priority report at an equal last_contact must not overwrite");
}

#[tokio::test]
async fn equal_last_contact_higher_priority_report_wins() {
    if !common::database_available() {
        eprintln!("skipping: set DATABASE_URL or TEST_DATABASE_URL to run this test");
        return;
    }
    let test_db = TestDatabase::new().await.expect("failed to create test database");
    let repo = StateRepository::new(test_db.pool());
    let stale_threshold = Duration::seconds(60);

    repo.conditional_upsert(&state("abc123", 1000, SourceTag::GlobalPublic, 37.0), stale_threshold, false)
        .unwrap();

    let accepted = repo
        .conditional_upsert(&state("abc123", 1000, SourceTag::Feeder, 99.0), stale_threshold, false)
        .expect("upsert failed");

    assert!(accepted);
    let stored = repo.get("abc123").unwrap().unwrap();
    assert_eq!(stored.latitude, Some(99.0));
}

#[tokio::test]
async fn staleness_override_lets_a_lower_priority_report_through_on_a_stale_row() {
    if !common::database_available() {
        eprintln!("skipping: set DATABASE_URL or TEST_DATABASE_URL to run this test");
        return;
    }
    let test_db = TestDatabase::new().await.expect("failed to create test database");
    let repo = StateRepository::new(test_db.pool());
    let stale_threshold = Duration::seconds(60);

    // last_contact far enough in the past (relative to wall-clock `now()`
    // evaluated inside Postgres) that the row counts as stale.
    let old_last_contact = Utc::now().timestamp() - 3600;
    repo.conditional_upsert(
        &state("abc123", old_last_contact, SourceTag::Feeder, 37.0),
        stale_threshold,
        false,
    )
    .unwrap();

    // Same last_contact, lower priority — would normally be rejected by
    // rule 4b, but the stored row is stale so the override applies.
    let accepted = repo
        .conditional_upsert(
            &state("abc123", old_last_contact, SourceTag::GlobalPublic, 99.0),
            stale_threshold,
            false,
        )
        .expect("upsert failed");

    assert!(accepted, "staleness override must admit a lower-priority report once the stored row is stale");
}

#[tokio::test]
async fn accepted_write_also_appends_a_history_row() {
    if !common::database_available() {
        eprintln!("skipping: set DATABASE_URL or TEST_DATABASE_URL to run this test");
        return;
    }
    let test_db = TestDatabase::new().await.expect("failed to create test database");
    let repo = StateRepository::new(test_db.pool());
    let stale_threshold = Duration::seconds(60);

    repo.conditional_upsert(&state("abc123", 1000, SourceTag::GlobalPublic, 37.0), stale_threshold, false)
        .unwrap();
    repo.conditional_upsert(&state("abc123", 1001, SourceTag::GlobalPublic, 38.0), stale_threshold, false)
        .unwrap();

    use diesel::prelude::*;
    use flyoverhead_ingest::schema::history_records;
    let mut conn = test_db.pool().get().unwrap();
    let count: i64 = history_records::table
        .filter(history_records::icao24.eq("abc123"))
        .count()
        .get_result(&mut conn)
        .unwrap();

    assert_eq!(count, 2, "every accepted write should append its own history row");
}

#[tokio::test]
async fn bounds_query_only_returns_records_within_the_box_and_freshness_window() {
    if !common::database_available() {
        eprintln!("skipping: set DATABASE_URL or TEST_DATABASE_URL to run this test");
        return;
    }
    let test_db = TestDatabase::new().await.expect("failed to create test database");
    let repo = StateRepository::new(test_db.pool());
    let stale_threshold = Duration::seconds(60);
    let now = Utc::now();

    repo.conditional_upsert(
        &state("in_box", now.timestamp(), SourceTag::GlobalPublic, 37.5),
        stale_threshold,
        false,
    )
    .unwrap();
    repo.conditional_upsert(
        &state("out_of_box", now.timestamp(), SourceTag::GlobalPublic, 60.0),
        stale_threshold,
        false,
    )
    .unwrap();
    repo.conditional_upsert(
        &state("too_old", now.timestamp() - 7200, SourceTag::GlobalPublic, 37.6),
        stale_threshold,
        false,
    )
    .unwrap();

    let results = repo
        .query_bounds(37.0, -123.0, 38.0, -121.0, Duration::minutes(5), now)
        .expect("bounds query failed");

    let icaos: Vec<&str> = results.iter().map(|r| r.icao24.as_str()).collect();
    assert!(icaos.contains(&"in_box"));
    assert!(!icaos.contains(&"out_of_box"));
    assert!(!icaos.contains(&"too_old"));
}
