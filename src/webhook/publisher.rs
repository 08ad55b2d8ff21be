//! Webhook publisher (spec §4.6): given an event, persist it write-through,
//! list matching active subscriptions, create a `pending` delivery row per
//! match, and enqueue one message per delivery on the webhook queue.

use anyhow::{Context, Result};
use chrono::Utc;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use tokio::task::spawn_blocking;
use tracing::{info, warn};
use uuid::Uuid;

use crate::queue::RedisQueue;
use crate::schema::{webhook_events, webhook_subscriptions};
use crate::webhook::model::{
    NewWebhookDelivery, WebhookDeliveryStatus, WebhookEvent, WebhookQueueMessage,
    WebhookSubscription, WebhookSubscriptionStatus,
};

pub type PgPool = Pool<ConnectionManager<PgConnection>>;
type PgPooledConnection = PooledConnection<ConnectionManager<PgConnection>>;

/// An event about to be published, not yet assigned an id.
pub struct NewEvent {
    pub event_type: String,
    pub version: String,
    pub occurred_at: chrono::DateTime<Utc>,
    pub payload: serde_json::Value,
}

pub struct WebhookPublisher {
    pool: PgPool,
    queue: RedisQueue,
}

impl WebhookPublisher {
    pub fn new(pool: PgPool, queue: RedisQueue) -> Self {
        Self { pool, queue }
    }

    /// Assign `event_id = UUIDv4`, persist the event, then fan out a
    /// delivery row + queue message to every matching active subscription.
    /// Returns the number of deliveries enqueued.
    pub async fn publish(&self, new_event: NewEvent) -> Result<usize> {
        let event = WebhookEvent {
            event_id: Uuid::new_v4(),
            event_type: new_event.event_type,
            version: new_event.version,
            occurred_at: new_event.occurred_at,
            payload: new_event.payload,
            created_at: Utc::now(),
        };

        {
            let pool = self.pool.clone();
            let event = event.clone();
            spawn_blocking(move || persist_event(&pool, &event)).await??;
        }

        let matching = {
            let pool = self.pool.clone();
            let event_type = event.event_type.clone();
            spawn_blocking(move || matching_subscriptions(&pool, &event_type)).await??
        };
        metrics::counter!("webhook.published_total").increment(1);
        let mut enqueued = 0usize;

        for sub in matching {
            match self.fan_out_to_subscription(&event, &sub).await {
                Ok(()) => enqueued += 1,
                Err(e) => {
                    // A single subscriber's enqueue failure must not stop
                    // fan-out to the rest; the delivery row (if it made it
                    // in) is still eligible for a future sweep to re-enqueue.
                    warn!(
                        subscription_id = %sub.id,
                        event_id = %event.event_id,
                        error = %e,
                        "failed to enqueue webhook delivery for subscription"
                    );
                }
            }
        }

        info!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            enqueued,
            "published webhook event"
        );
        Ok(enqueued)
    }

    async fn fan_out_to_subscription(
        &self,
        event: &WebhookEvent,
        sub: &WebhookSubscription,
    ) -> Result<()> {
        let delivery_id = Uuid::new_v4();
        let new_delivery = NewWebhookDelivery {
            delivery_id,
            event_id: event.event_id,
            subscription_id: sub.id,
            status: WebhookDeliveryStatus::Pending,
        };

        {
            let pool = self.pool.clone();
            spawn_blocking(move || insert_delivery_row(&pool, &new_delivery)).await??;
        }

        let message = WebhookQueueMessage {
            delivery_id,
            event_id: event.event_id,
            subscription_id: sub.id,
            callback_url: sub.callback_url.clone(),
            signing_secret: sub.signing_secret.clone(),
            event_type: event.event_type.clone(),
            version: event.version.clone(),
            occurred_at: event.occurred_at,
            payload: event.payload.clone(),
            attempt: 0,
            max_attempts: sub.max_attempts.max(1) as u32,
            backoff_ms: sub.backoff_ms.max(0) as u64,
            rate_limit_per_minute: sub.rate_limit_per_minute.max(1) as u32,
        };

        self.queue
            .enqueue(&message)
            .await
            .context("failed to enqueue webhook delivery message")?;

        Ok(())
    }
}

fn persist_event(pool: &PgPool, event: &WebhookEvent) -> Result<()> {
    let mut conn: PgPooledConnection = pool.get().context("failed to get database connection")?;
    diesel::insert_into(webhook_events::table)
        .values(event)
        .execute(&mut conn)
        .context("failed to persist webhook event")?;
    Ok(())
}

fn matching_subscriptions(pool: &PgPool, event_type: &str) -> Result<Vec<WebhookSubscription>> {
    let mut conn: PgPooledConnection = pool.get().context("failed to get database connection")?;
    let active: Vec<WebhookSubscription> = webhook_subscriptions::table
        .filter(webhook_subscriptions::status.eq(WebhookSubscriptionStatus::Active))
        .select(WebhookSubscription::as_select())
        .load(&mut conn)
        .context("failed to query webhook subscriptions")?;

    Ok(active
        .into_iter()
        .filter(|s| s.matches_event_type(event_type))
        .collect())
}

fn insert_delivery_row(pool: &PgPool, new_delivery: &NewWebhookDelivery) -> Result<()> {
    let mut conn: PgPooledConnection = pool.get().context("failed to get database connection")?;
    diesel::insert_into(crate::schema::webhook_deliveries::table)
        .values(new_delivery)
        .execute(&mut conn)
        .context("failed to insert delivery row")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhook::model::WebhookSubscriptionStatus as Status;

    fn subscription(filter: &str, status: Status) -> WebhookSubscription {
        WebhookSubscription {
            id: Uuid::new_v4(),
            subscriber_id: "sub-1".to_string(),
            callback_url: "https://example.com/hook".to_string(),
            event_type_filter: filter.to_string(),
            signing_secret: "secret".to_string(),
            status,
            rate_limit_per_minute: 60,
            max_attempts: 5,
            backoff_ms: 1000,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn matches_exact_event_type() {
        let sub = subscription("aircraft.position_update", Status::Active);
        assert!(sub.matches_event_type("aircraft.position_update"));
        assert!(!sub.matches_event_type("aircraft.landed"));
    }

    #[test]
    fn wildcard_filters_match_everything() {
        let star = subscription("*", Status::Active);
        let all = subscription("all", Status::Active);
        assert!(star.matches_event_type("aircraft.position_update"));
        assert!(all.matches_event_type("anything.else"));
    }
}
