// @generated-by-hand to mirror migrations/ — kept in sync manually, the
// same convention the teacher's diesel setup uses for its own schema.rs.

pub mod sql_types {
    #[derive(diesel::sql_types::SqlType)]
    #[diesel(postgres_type(name = "source_tag"))]
    pub struct SourceTag;

    #[derive(diesel::sql_types::SqlType)]
    #[diesel(postgres_type(name = "webhook_subscription_status"))]
    pub struct WebhookSubscriptionStatus;

    #[derive(diesel::sql_types::SqlType)]
    #[diesel(postgres_type(name = "webhook_delivery_status"))]
    pub struct WebhookDeliveryStatus;
}

diesel::table! {
    use diesel::sql_types::*;
    use super::sql_types::SourceTag;

    // State record (spec §3): one row per aircraft, the most-recently-
    // accepted telemetry. `icao24` is the primary key; the conditional
    // upsert in state_repository.rs is the only writer.
    state_records (icao24) {
        icao24 -> Varchar,
        callsign -> Nullable<Varchar>,
        country -> Nullable<Varchar>,
        latitude -> Nullable<Float8>,
        longitude -> Nullable<Float8>,
        baro_altitude -> Nullable<Float8>,
        geo_altitude -> Nullable<Float8>,
        on_ground -> Bool,
        velocity -> Nullable<Float8>,
        true_track -> Nullable<Float8>,
        vertical_rate -> Nullable<Float8>,
        last_contact -> Int8,
        ingestion_timestamp -> Timestamptz,
        data_source -> SourceTag,
        source_priority -> Int4,
        feeder_id -> Nullable<Varchar>,
        category -> Nullable<Int4>,
        squawk -> Nullable<Varchar>,
        emergency -> Bool,
    }
}

diesel::table! {
    use diesel::sql_types::*;
    use super::sql_types::SourceTag;

    // History record (spec §3): append-only copy of every accepted
    // state-change, never updated, retained for a rolling window.
    history_records (id) {
        id -> Int8,
        icao24 -> Varchar,
        callsign -> Nullable<Varchar>,
        country -> Nullable<Varchar>,
        latitude -> Nullable<Float8>,
        longitude -> Nullable<Float8>,
        baro_altitude -> Nullable<Float8>,
        geo_altitude -> Nullable<Float8>,
        on_ground -> Bool,
        velocity -> Nullable<Float8>,
        true_track -> Nullable<Float8>,
        vertical_rate -> Nullable<Float8>,
        last_contact -> Int8,
        ingestion_timestamp -> Timestamptz,
        data_source -> SourceTag,
        source_priority -> Int4,
        feeder_id -> Nullable<Varchar>,
        category -> Nullable<Int4>,
        squawk -> Nullable<Varchar>,
        emergency -> Bool,
        recorded_at -> Timestamptz,
    }
}

diesel::table! {
    // Trusted feeder clients (spec §4.3 feeder adapter, §6 feeder auth).
    // `token_hash` is a SHA-256 hex digest of the bearer token; the plain
    // token is never stored.
    feeders (feeder_id) {
        feeder_id -> Varchar,
        token_hash -> Varchar,
        active -> Bool,
        rate_limit_per_minute -> Int4,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    use diesel::sql_types::*;
    use super::sql_types::WebhookSubscriptionStatus;

    // Webhook subscription (spec §3). Consumed read-only by the publisher
    // and dispatcher; created out of scope (operator/self-service API).
    webhook_subscriptions (id) {
        id -> Uuid,
        subscriber_id -> Varchar,
        callback_url -> Varchar,
        event_type_filter -> Varchar,
        signing_secret -> Varchar,
        status -> WebhookSubscriptionStatus,
        rate_limit_per_minute -> Int4,
        max_attempts -> Int4,
        backoff_ms -> Int4,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    // Webhook event (spec §3): immutable, persisted before any delivery
    // message is produced (write-through, §4.6).
    webhook_events (event_id) {
        event_id -> Uuid,
        event_type -> Varchar,
        version -> Varchar,
        occurred_at -> Timestamptz,
        payload -> Jsonb,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    use diesel::sql_types::*;
    use super::sql_types::WebhookDeliveryStatus;

    // Webhook delivery attempt (spec §3): one row per (event, subscription)
    // pairing, mutated exclusively by the dispatcher.
    webhook_deliveries (delivery_id) {
        delivery_id -> Uuid,
        event_id -> Uuid,
        subscription_id -> Uuid,
        status -> WebhookDeliveryStatus,
        attempt_count -> Int4,
        next_attempt_at -> Nullable<Timestamptz>,
        last_error -> Nullable<Text>,
        response_status -> Nullable<Int4>,
        response_body -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::joinable!(webhook_deliveries -> webhook_events (event_id));
diesel::joinable!(webhook_deliveries -> webhook_subscriptions (subscription_id));

diesel::allow_tables_to_appear_in_same_query!(
    webhook_deliveries,
    webhook_events,
    webhook_subscriptions,
);
