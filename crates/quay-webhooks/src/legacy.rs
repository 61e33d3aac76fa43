//! The legacy webhook queue: subscribers register a URL and a
//! comma-separated event list; matching events POST the caller's payload.

use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::{PgConnection, Row};
use uuid::Uuid;

use quay_core::Context;
use quay_db::{query_with_args, with_tx, Arg, DbError, SelectBuilder, TxOptions};
use quay_work::{Queue, Task, WorkError};

use crate::delivery::{post_webhook, request_headers, serialize_headers};

/// Legacy responses are truncated to 64 KiB.
const RESPONSE_LIMIT: usize = 65536;

/// One legacy subscription row.
#[derive(Debug, Clone)]
pub struct LegacySubscription {
    pub id: i32,
    pub created: DateTime<Utc>,
    pub url: String,
    pub events: Vec<String>,
}

/// The legacy webhook delivery queue.
#[derive(Clone)]
pub struct LegacyQueue {
    queue: Arc<Queue>,
}

impl Default for LegacyQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl LegacyQueue {
    /// Create the queue. The caller registers it with the server, which
    /// starts and drains it.
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue: Arc::new(Queue::new("webhooks_legacy")),
        }
    }

    /// The underlying work queue, for registration with the server.
    #[must_use]
    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    /// Schedule delivery of an event to every matching subscriber.
    ///
    /// The select builder should carry no columns: the caller prepares FROM
    /// (with the subscription table aliased to `sub`) and any WHERE clauses
    /// refining the subscriber list; the queue completes the column list
    /// and event filter. `name` is the prefix of the webhook tables, e.g.
    /// `"user"` for `user_webhook_{subscription,delivery}`.
    pub fn schedule(&self, q: SelectBuilder, name: &str, event: &str, payload: Vec<u8>) {
        let queue = self.queue.clone();
        let name = name.to_string();
        let event = event.to_string();
        let payload: Arc<Vec<u8>> = Arc::new(payload);

        self.queue.enqueue(Task::new(move |ctx| {
            let queue = queue.clone();
            let q = q.clone();
            let name = name.clone();
            let event = event.clone();
            let payload = payload.clone();
            async move { stage_one(ctx, queue, q, name, event, payload).await }
        }));
    }
}

/// Fetch the subscriber list, create every delivery record in one
/// transaction, then enqueue one delivery task per subscriber.
async fn stage_one(
    ctx: Context,
    queue: Arc<Queue>,
    q: SelectBuilder,
    name: String,
    event: String,
    payload: Arc<Vec<u8>>,
) -> Result<(), WorkError> {
    let subs = fetch_subscriptions(&ctx, q, &event)
        .await
        .map_err(WorkError::transient)?;
    if subs.is_empty() {
        return Ok(());
    }
    let count = subs.len();

    let tx_name = name.clone();
    let tx_event = event.clone();
    let tx_payload = payload.clone();
    let tasks = with_tx(&ctx, TxOptions::default(), move |tx| {
        Box::pin(async move {
            let mut tasks = Vec::with_capacity(subs.len());
            for sub in subs {
                tasks.push(
                    stage_two(&mut *tx, &tx_name, &tx_event, &sub, tx_payload.clone()).await?,
                );
            }
            Ok(tasks)
        })
    })
    .await
    .map_err(|e| {
        tracing::error!(
            target: "webhooks",
            name = %name,
            event = %event,
            error = %e,
            "failed to enqueue legacy webhooks"
        );
        WorkError::transient(e)
    })?;

    for task in tasks {
        queue.enqueue(task);
    }
    tracing::info!(
        target: "webhooks",
        name = %name,
        event = %event,
        subscriptions = count,
        "enqueued legacy webhook delivery"
    );
    Ok(())
}

/// True when the decoded event list contains exactly `event`.
fn subscribed_to(events: &str, event: &str) -> bool {
    events.split(',').any(|e| e == event)
}

async fn fetch_subscriptions(
    ctx: &Context,
    q: SelectBuilder,
    event: &str,
) -> Result<Vec<LegacySubscription>, DbError> {
    let (sql, args) = q
        .columns(&["sub.id", "sub.created", "sub.url", "sub.events"])
        .where_("sub.events LIKE ?", [Arg::Text(format!("%{event}%"))])
        .build();

    let event = event.to_string();
    with_tx(ctx, TxOptions::read_only(), move |tx| {
        Box::pin(async move {
            let rows = query_with_args(&sql, args).fetch_all(&mut *tx).await?;
            let mut subs = Vec::with_capacity(rows.len());
            for row in rows {
                let events: String = row.try_get(3)?;
                // The LIKE clause only pre-filters; decode the event list
                // and keep exact matches so that e.g. "profile:update"
                // never matches a "profile:update-v2" subscriber.
                if !subscribed_to(&events, &event) {
                    continue;
                }
                subs.push(LegacySubscription {
                    id: row.try_get(0)?,
                    created: DateTime::from_naive_utc_and_offset(
                        row.try_get::<NaiveDateTime, _>(1)?,
                        Utc,
                    ),
                    url: row.try_get(2)?,
                    events: events.split(',').map(str::to_string).collect(),
                });
            }
            Ok(subs)
        })
    })
    .await
}

/// Insert the delivery record and build the delivery task.
async fn stage_two(
    tx: &mut PgConnection,
    name: &str,
    event: &str,
    sub: &LegacySubscription,
    payload: Arc<Vec<u8>>,
) -> Result<Task, DbError> {
    let delivery_uuid = Uuid::new_v4().to_string();
    let headers = request_headers(event, &delivery_uuid);
    let serialized = serialize_headers(&headers);

    let sql = format!(
        "INSERT INTO {name}_webhook_delivery \
         (uuid, created, event, url, payload, payload_headers, response_status, subscription_id) \
         VALUES ($1, NOW() at time zone 'utc', $2, $3, $4, $5, -2, $6) \
         RETURNING id"
    );
    let (delivery_id,): (i32,) = sqlx::query_as(&sql)
        .bind(&delivery_uuid)
        .bind(event)
        .bind(&sub.url)
        .bind(String::from_utf8_lossy(&payload).into_owned())
        .bind(&serialized)
        .bind(sub.id)
        .fetch_one(&mut *tx)
        .await?;

    let task_name = name.to_string();
    let task_url = sub.url.clone();
    let task = Task::new(move |ctx| {
        let name = task_name.clone();
        let url = task_url.clone();
        let headers = headers.clone();
        let payload = payload.clone();
        async move { deliver(ctx, name, url, headers, payload, delivery_id).await }
    })
    .retries(5)
    .after(move |_ctx, status| match &status.result {
        Ok(()) => {
            tracing::info!(
                target: "webhooks",
                delivery = %delivery_uuid,
                attempts = status.attempts,
                "delivery complete"
            );
        }
        Err(err) => {
            tracing::error!(
                target: "webhooks",
                delivery = %delivery_uuid,
                attempts = status.attempts,
                error = %err,
                "delivery failed"
            );
        }
    });
    Ok(task)
}

/// Perform one delivery attempt and record the response.
async fn deliver(
    ctx: Context,
    name: String,
    url: String,
    headers: Vec<(String, String)>,
    payload: Arc<Vec<u8>>,
    delivery_id: i32,
) -> Result<(), WorkError> {
    let response = post_webhook(&ctx, &url, &headers, &payload, RESPONSE_LIMIT).await?;

    let sql = format!(
        "UPDATE {name}_webhook_delivery \
         SET response = $1, response_status = $2, response_headers = $3 \
         WHERE id = $4"
    );
    let body = response.body.clone();
    let response_headers = response.headers.clone();
    let status = response.status;
    let update = with_tx(&ctx, TxOptions::default(), move |tx| {
        Box::pin(async move {
            sqlx::query(&sql)
                .bind(&body)
                .bind(status)
                .bind(&response_headers)
                .bind(delivery_id)
                .execute(&mut *tx)
                .await?;
            Ok(())
        })
    })
    .await;

    if let Err(err) = update {
        // The receiver got the webhook; re-delivering to fix our own
        // bookkeeping would duplicate it.
        tracing::warn!(
            target: "webhooks",
            error = %err,
            "webhook delivered, but updating delivery record failed"
        );
        return Ok(());
    }

    if response.should_retry() {
        return Err(WorkError::transient(format!(
            "Server returned status {}",
            response.status
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_list_matching_is_exact() {
        assert!(subscribed_to("profile:update", "profile:update"));
        assert!(subscribed_to(
            "profile:update,profile:delete",
            "profile:delete"
        ));

        // The LIKE pre-filter would pass these; the exact check must not.
        assert!(!subscribed_to("profile:update-v2", "profile:update"));
        assert!(!subscribed_to("xprofile:update", "profile:update"));
        assert!(!subscribed_to("profile:updater,other", "profile:update"));
    }

    #[test]
    fn subscriber_query_has_like_prefilter() {
        let q = SelectBuilder::new()
            .from("user_webhook_subscription sub")
            .where_("sub.user_id = ?", [Arg::Int(42)]);
        let (sql, args) = q
            .columns(&["sub.id", "sub.created", "sub.url", "sub.events"])
            .where_("sub.events LIKE ?", [Arg::Text("%profile:update%".into())])
            .build();

        assert_eq!(
            sql,
            "SELECT sub.id, sub.created, sub.url, sub.events \
             FROM user_webhook_subscription sub \
             WHERE (sub.user_id = $1) AND (sub.events LIKE $2)"
        );
        assert_eq!(
            args,
            vec![Arg::Int(42), Arg::Text("%profile:update%".into())]
        );
    }
}
