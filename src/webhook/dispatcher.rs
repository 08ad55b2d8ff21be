//! Webhook dispatcher (spec §4.7): drains the webhook queue, consults the
//! per-subscriber governor, signs and POSTs the delivery, classifies the
//! outcome, and updates the delivery row — rescheduling on transient
//! failure, parking in the DLQ once attempts are exhausted.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use reqwest::Client;
use tokio::task::spawn_blocking;
use tracing::{info, warn};

use crate::config::Config;
use crate::governor::Governor;
use crate::queue::{RedisQueue, retry_backoff_ms};
use crate::schema::webhook_deliveries;
use crate::webhook::model::{WebhookBody, WebhookDeliveryStatus, WebhookQueueMessage};
use crate::webhook::signing;

pub type PgPool = Pool<ConnectionManager<PgConnection>>;
type PgPooledConnection = PooledConnection<ConnectionManager<PgConnection>>;

/// Truncate response bodies recorded on the delivery row, per spec §3.
const RESPONSE_BODY_TRUNCATE_BYTES: usize = 500;

pub struct WebhookDispatcher {
    pool: PgPool,
    queue: RedisQueue,
    governor: Governor,
    http: Client,
    enforce_https: bool,
    timeout: Duration,
}

impl WebhookDispatcher {
    pub fn new(pool: PgPool, queue: RedisQueue, governor: Governor, config: &Config) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.webhook_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("failed to build webhook HTTP client")?;

        Ok(Self {
            pool,
            queue,
            governor,
            http,
            enforce_https: config.webhook_enforce_https,
            timeout: config.webhook_timeout,
        })
    }

    /// Runs one dispatcher loop iteration: reserve a message, promote due
    /// delayed messages, and process whatever was reserved. Intended to be
    /// called in a tight loop by each of the `D` dispatcher tasks (spec §5).
    pub async fn run_once(&self, poll_timeout: Duration) -> Result<()> {
        let _ = self.queue.promote(Utc::now().timestamp_millis(), 100).await;

        let Some(message) = self
            .queue
            .reserve::<WebhookQueueMessage>(poll_timeout)
            .await?
        else {
            return Ok(());
        };

        self.process(message).await
    }

    async fn process(&self, message: WebhookQueueMessage) -> Result<()> {
        if self.enforce_https && !message.callback_url.starts_with("https://") {
            self.park_permanent(&message, "non-https callback url").await?;
            return Ok(());
        }

        let now = Utc::now();
        let decision = self
            .governor
            .check(
                &message.subscription_id.to_string(),
                message.rate_limit_per_minute,
                now,
            )
            .await?;

        if !decision.allowed {
            self.reschedule(&message, decision.retry_at.timestamp_millis())
                .await?;
            return Ok(());
        }

        self.mark_delivering(&message).await?;

        let outcome = self.attempt_delivery(&message).await;

        match outcome {
            Ok((status_code, body)) if (200..300).contains(&status_code) => {
                self.mark_success(&message, status_code, &body).await?;
                self.governor
                    .record_success(&message.subscription_id.to_string())
                    .await?;
            }
            Ok((status_code, body)) => {
                self.governor
                    .record_failure(&message.subscription_id.to_string(), now)
                    .await?;
                self.handle_failure(&message, Some(status_code as i32), &body, None)
                    .await?;
            }
            Err(e) => {
                self.governor
                    .record_failure(&message.subscription_id.to_string(), now)
                    .await?;
                self.handle_failure(&message, None, "", Some(e.to_string()))
                    .await?;
            }
        }

        Ok(())
    }

    /// POST the signed body to the callback URL. Returns `(status_code,
    /// truncated_response_body)` on any HTTP response (2xx or otherwise);
    /// errors only for timeouts and network failures.
    async fn attempt_delivery(&self, message: &WebhookQueueMessage) -> Result<(u16, String)> {
        let body = WebhookBody {
            id: message.event_id,
            event_type: &message.event_type,
            occurred_at: message.occurred_at,
            version: &message.version,
            data: &message.payload,
        };
        let body_json = serde_json::to_string(&body).context("failed to serialize webhook body")?;
        let timestamp_ms = Utc::now().timestamp_millis();
        let signature = signing::signature_header_value(&message.signing_secret, timestamp_ms, &body_json);

        let response = self
            .http
            .post(&message.callback_url)
            .timeout(self.timeout)
            .header("Content-Type", "application/json")
            .header(signing::EVENT_HEADER, &message.event_type)
            .header(signing::DELIVERY_HEADER, message.delivery_id.to_string())
            .header(signing::EVENT_ID_HEADER, message.event_id.to_string())
            .header(signing::TIMESTAMP_HEADER, timestamp_ms.to_string())
            .header(signing::SIGNATURE_HEADER, signature)
            .body(body_json)
            .send()
            .await
            .context("webhook HTTP call failed")?;

        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        let truncated: String = text.chars().take(RESPONSE_BODY_TRUNCATE_BYTES).collect();
        Ok((status, truncated))
    }

    async fn handle_failure(
        &self,
        message: &WebhookQueueMessage,
        response_status: Option<i32>,
        response_body: &str,
        network_error: Option<String>,
    ) -> Result<()> {
        let next_attempt = message.attempt + 1;
        if should_retry(next_attempt, message.max_attempts) {
            let backoff = retry_backoff_ms(next_attempt, message.backoff_ms, message.backoff_ms / 4);
            let available_at_ms = Utc::now().timestamp_millis() + backoff as i64;
            let next_attempt_at = chrono::DateTime::<Utc>::from_timestamp_millis(available_at_ms)
                .unwrap_or_else(Utc::now);

            self.update_delivery_row(
                message.delivery_id,
                WebhookDeliveryStatus::Pending,
                next_attempt as i32,
                Some(next_attempt_at),
                network_error.as_deref(),
                response_status,
                Some(response_body),
            )
            .await?;

            let mut rescheduled = message.clone();
            rescheduled.attempt = next_attempt;
            self.queue.schedule(&rescheduled, available_at_ms).await?;

            metrics::counter!("webhook.delivery_failed_total").increment(1);
            warn!(
                delivery_id = %message.delivery_id,
                attempt = next_attempt,
                response_status,
                "webhook delivery failed, rescheduled"
            );
        } else {
            self.update_delivery_row(
                message.delivery_id,
                WebhookDeliveryStatus::Failed,
                next_attempt as i32,
                None,
                network_error.as_deref(),
                response_status,
                Some(response_body),
            )
            .await?;
            self.queue
                .park(message, "max attempts exhausted")
                .await?;

            metrics::counter!("webhook.delivery_parked_total").increment(1);
            warn!(
                delivery_id = %message.delivery_id,
                attempt = next_attempt,
                "webhook delivery exhausted attempts, parked in DLQ"
            );
        }
        Ok(())
    }

    async fn park_permanent(&self, message: &WebhookQueueMessage, reason: &str) -> Result<()> {
        self.update_delivery_row(
            message.delivery_id,
            WebhookDeliveryStatus::Failed,
            message.attempt as i32,
            None,
            Some(reason),
            None,
            None,
        )
        .await?;
        self.queue.park(message, reason).await?;
        metrics::counter!("webhook.delivery_parked_total").increment(1);
        warn!(delivery_id = %message.delivery_id, reason, "webhook delivery parked permanently");
        Ok(())
    }

    async fn reschedule(&self, message: &WebhookQueueMessage, available_at_ms: i64) -> Result<()> {
        self.queue.schedule(message, available_at_ms).await?;
        Ok(())
    }

    async fn mark_delivering(&self, message: &WebhookQueueMessage) -> Result<()> {
        self.update_delivery_row(
            message.delivery_id,
            WebhookDeliveryStatus::Delivering,
            message.attempt as i32,
            None,
            None,
            None,
            None,
        )
        .await
    }

    async fn mark_success(
        &self,
        message: &WebhookQueueMessage,
        status_code: u16,
        body: &str,
    ) -> Result<()> {
        self.update_delivery_row(
            message.delivery_id,
            WebhookDeliveryStatus::Success,
            (message.attempt + 1) as i32,
            None,
            None,
            Some(status_code as i32),
            Some(body),
        )
        .await?;
        metrics::counter!("webhook.delivered_total").increment(1);
        info!(delivery_id = %message.delivery_id, "webhook delivered");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn update_delivery_row(
        &self,
        delivery_id: uuid::Uuid,
        status: WebhookDeliveryStatus,
        attempt_count: i32,
        next_attempt_at: Option<chrono::DateTime<Utc>>,
        last_error: Option<&str>,
        response_status: Option<i32>,
        response_body: Option<&str>,
    ) -> Result<()> {
        let pool = self.pool.clone();
        let last_error = last_error.map(str::to_string);
        let response_body = response_body.map(str::to_string);
        spawn_blocking(move || {
            apply_delivery_row_update(
                &pool,
                delivery_id,
                status,
                attempt_count,
                next_attempt_at,
                last_error.as_deref(),
                response_status,
                response_body.as_deref(),
            )
        })
        .await?
    }
}

/// Whether a failed delivery still has attempts left, per spec §4.7's
/// `max_attempts` exhaustion rule.
fn should_retry(next_attempt: u32, max_attempts: u32) -> bool {
    next_attempt < max_attempts
}

#[allow(clippy::too_many_arguments)]
fn apply_delivery_row_update(
    pool: &PgPool,
    delivery_id: uuid::Uuid,
    status: WebhookDeliveryStatus,
    attempt_count: i32,
    next_attempt_at: Option<chrono::DateTime<Utc>>,
    last_error: Option<&str>,
    response_status: Option<i32>,
    response_body: Option<&str>,
) -> Result<()> {
    let mut conn: PgPooledConnection = pool.get().context("failed to get database connection")?;
    diesel::update(webhook_deliveries::table.find(delivery_id))
        .set((
            webhook_deliveries::status.eq(status),
            webhook_deliveries::attempt_count.eq(attempt_count),
            webhook_deliveries::next_attempt_at.eq(next_attempt_at),
            webhook_deliveries::last_error.eq(last_error),
            webhook_deliveries::response_status.eq(response_status),
            webhook_deliveries::response_body.eq(response_body),
            webhook_deliveries::updated_at.eq(Utc::now()),
        ))
        .execute(&mut conn)
        .context("failed to update delivery row")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Building a `WebhookDispatcher` requires a live pool/Redis connection;
    // the retry/truncation decision logic is plain functions and is covered
    // directly, the same way `governor.rs` tests its state machine without
    // a connection.

    #[test]
    fn retries_while_attempts_remain() {
        assert!(should_retry(1, 5));
        assert!(should_retry(4, 5));
    }

    #[test]
    fn stops_retrying_once_max_attempts_reached() {
        assert!(!should_retry(5, 5));
        assert!(!should_retry(6, 5));
    }

    #[test]
    fn response_body_is_truncated_to_the_configured_length() {
        let long_body: String = std::iter::repeat('x').take(2_000).collect();
        let truncated: String = long_body
            .chars()
            .take(RESPONSE_BODY_TRUNCATE_BYTES)
            .collect();
        assert_eq!(truncated.len(), RESPONSE_BODY_TRUNCATE_BYTES);
    }

    #[test]
    fn non_https_callback_is_rejected_when_enforced() {
        let enforce_https = true;
        let callback_url = "http://example.com/hook";
        assert!(enforce_https && !callback_url.starts_with("https://"));
    }
}
