//! Integration tests for the webhook publisher's fan-out (spec §4.6): event
//! persistence, active-subscription matching, delivery-row creation, and
//! the resulting queue message, exercised against real Postgres and Redis
//! rather than mocks.
mod common;

use chrono::Utc;
use common::TestDatabase;
use diesel::prelude::*;
use diesel::sql_types::{Int4, Text, Uuid as SqlUuid};
use flyoverhead_ingest::queue::RedisQueue;
use flyoverhead_ingest::webhook::model::WebhookQueueMessage;
use flyoverhead_ingest::webhook::publisher::{NewEvent, WebhookPublisher};
use uuid::Uuid;

fn redis_url() -> String {
    std::env::var("TEST_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

/// Subscriptions are created by an operator/self-service API out of scope
/// for this crate, so there is no `Insertable` model for them — seed rows
/// directly for the test the same way.
fn insert_subscription(pool: &diesel::r2d2::Pool<diesel::r2d2::ConnectionManager<PgConnection>>, filter: &str) -> Uuid {
    let id = Uuid::new_v4();
    let mut conn = pool.get().unwrap();
    diesel::sql_query(
        "INSERT INTO webhook_subscriptions \
         (id, subscriber_id, callback_url, event_type_filter, signing_secret, status, rate_limit_per_minute, max_attempts, backoff_ms) \
         VALUES ($1, 'test-subscriber', 'https://example.com/hook', $2, 's3cret', 'active', 60, $3, 1000)",
    )
    .bind::<SqlUuid, _>(id)
    .bind::<Text, _>(filter)
    .bind::<Int4, _>(5)
    .execute(&mut conn)
    .expect("failed to insert subscription");
    id
}

#[tokio::test]
#[ignore] // Requires a running Redis server (TEST_REDIS_URL or 127.0.0.1:6379)
async fn publish_enqueues_one_delivery_per_matching_subscription() {
    if !common::database_available() {
        eprintln!("skipping: set DATABASE_URL or TEST_DATABASE_URL to run this test");
        return;
    }
    let test_db = TestDatabase::new().await.expect("failed to create test database");
    let pool = test_db.pool();
    let matching_id = insert_subscription(&pool, "aircraft.position_update");
    insert_subscription(&pool, "aircraft.landed"); // non-matching, must not receive a delivery

    let client = redis::Client::open(redis_url()).expect("failed to open redis client");
    let prefix = format!("flyoverhead_test:webhooks:{}", Uuid::new_v4());
    let queue = RedisQueue::new(client, prefix);

    let publisher = WebhookPublisher::new(pool.clone(), queue.clone());
    let enqueued = publisher
        .publish(NewEvent {
            event_type: "aircraft.position_update".to_string(),
            version: "v1".to_string(),
            occurred_at: Utc::now(),
            payload: serde_json::json!({ "icao24": "abc123" }),
        })
        .await
        .expect("publish failed");

    assert_eq!(enqueued, 1);

    let message: WebhookQueueMessage = queue
        .reserve(std::time::Duration::from_secs(2))
        .await
        .expect("reserve failed")
        .expect("expected one queued delivery");

    assert_eq!(message.subscription_id, matching_id);
    assert_eq!(message.event_type, "aircraft.position_update");
    assert_eq!(message.max_attempts, 5);
}

#[tokio::test]
#[ignore] // Requires a running Redis server (TEST_REDIS_URL or 127.0.0.1:6379)
async fn publish_with_no_matching_subscriptions_enqueues_nothing() {
    if !common::database_available() {
        eprintln!("skipping: set DATABASE_URL or TEST_DATABASE_URL to run this test");
        return;
    }
    let test_db = TestDatabase::new().await.expect("failed to create test database");
    let pool = test_db.pool();
    insert_subscription(&pool, "aircraft.landed");

    let client = redis::Client::open(redis_url()).expect("failed to open redis client");
    let prefix = format!("flyoverhead_test:webhooks:{}", Uuid::new_v4());
    let queue = RedisQueue::new(client, prefix);

    let publisher = WebhookPublisher::new(pool.clone(), queue.clone());
    let enqueued = publisher
        .publish(NewEvent {
            event_type: "aircraft.position_update".to_string(),
            version: "v1".to_string(),
            occurred_at: Utc::now(),
            payload: serde_json::json!({ "icao24": "abc123" }),
        })
        .await
        .expect("publish failed");

    assert_eq!(enqueued, 0);
    assert_eq!(queue.main_len().await.unwrap(), 0);
}
