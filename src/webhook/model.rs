//! Webhook domain types: subscriptions, events, delivery attempts, and the
//! message carried on the webhook queue (spec §3, §4.6, §4.7).

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_derive_enum::DbEnum;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::{webhook_deliveries, webhook_events, webhook_subscriptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, DbEnum)]
#[db_enum(existing_type_path = "crate::schema::sql_types::WebhookSubscriptionStatus")]
#[serde(rename_all = "snake_case")]
pub enum WebhookSubscriptionStatus {
    Active,
    Paused,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, DbEnum)]
#[db_enum(existing_type_path = "crate::schema::sql_types::WebhookDeliveryStatus")]
#[serde(rename_all = "snake_case")]
pub enum WebhookDeliveryStatus {
    Pending,
    Delivering,
    Success,
    Failed,
}

/// Webhook subscription (spec §3). Created by an operator or self-service
/// endpoint out of scope here; consumed read-only by the publisher and
/// dispatcher.
#[derive(Debug, Clone, Queryable, Selectable, Identifiable)]
#[diesel(table_name = webhook_subscriptions)]
#[diesel(primary_key(id))]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct WebhookSubscription {
    pub id: Uuid,
    pub subscriber_id: String,
    pub callback_url: String,
    pub event_type_filter: String,
    pub signing_secret: String,
    pub status: WebhookSubscriptionStatus,
    pub rate_limit_per_minute: i32,
    pub max_attempts: i32,
    pub backoff_ms: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookSubscription {
    /// Exact match or wildcard `*` / `all` (spec §4.6).
    pub fn matches_event_type(&self, event_type: &str) -> bool {
        matches!(self.event_type_filter.as_str(), "*" | "all") || self.event_type_filter == event_type
    }
}

/// Webhook event (spec §3): immutable, persisted before any delivery
/// message is produced.
#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = webhook_events)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct WebhookEvent {
    pub event_id: Uuid,
    pub event_type: String,
    pub version: String,
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Webhook delivery attempt (spec §3), mutated exclusively by the
/// dispatcher.
#[derive(Debug, Clone, Queryable, Selectable, Identifiable)]
#[diesel(table_name = webhook_deliveries)]
#[diesel(primary_key(delivery_id))]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct WebhookDelivery {
    pub delivery_id: Uuid,
    pub event_id: Uuid,
    pub subscription_id: Uuid,
    pub status: WebhookDeliveryStatus,
    pub attempt_count: i32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub response_status: Option<i32>,
    pub response_body: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = webhook_deliveries)]
pub struct NewWebhookDelivery {
    pub delivery_id: Uuid,
    pub event_id: Uuid,
    pub subscription_id: Uuid,
    pub status: WebhookDeliveryStatus,
}

/// Message carried on the webhook queue (spec §4.6/§4.7): everything the
/// dispatcher needs to attempt a delivery without another DB round-trip for
/// the hot fields, though it re-reads the subscription for up-to-date
/// status/secret before sending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookQueueMessage {
    pub delivery_id: Uuid,
    pub event_id: Uuid,
    pub subscription_id: Uuid,
    pub callback_url: String,
    pub signing_secret: String,
    pub event_type: String,
    pub version: String,
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub attempt: u32,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub rate_limit_per_minute: u32,
}

/// The outbound HTTP body (spec §6): `{id, type, occurred_at, version, data}`.
#[derive(Debug, Serialize)]
pub struct WebhookBody<'a> {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: &'a str,
    pub occurred_at: DateTime<Utc>,
    pub version: &'a str,
    pub data: &'a serde_json::Value,
}
