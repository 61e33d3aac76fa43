//! The native webhook queue: each subscription stores a GraphQL query which
//! executes under a reduced re-creation of the subscriber's authentication
//! context; the rendered response is the delivery body.

use std::any::Any;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::{PgConnection, Row};
use uuid::Uuid;

use quay_auth::{webhook_auth, AuthContext, TokenHash};
use quay_core::Context;
use quay_db::{query_with_args, with_tx, Arg, DbError, SelectBuilder, TxOptions};
use quay_graphql::{ExecutableSchema, GqlError, Variables};
use quay_work::{Queue, Task, WorkError};

use crate::delivery::{post_webhook, request_headers};
use crate::error::WebhookError;

/// Native responses are truncated to 256 KiB.
const RESPONSE_LIMIT: usize = 262144;

/// Sentinel recorded when staging fails before any attempt is made.
const STATUS_STAGING_FAILED: i32 = -1;

/// One native subscription row.
#[derive(Debug, Clone)]
pub struct WebhookSubscription {
    pub id: i32,
    pub url: String,
    /// The stored GraphQL query, validated at subscription creation.
    pub query: String,
    /// Hex SHA-512 of the token that created the subscription.
    pub token_hash: String,
    pub grants: String,
    pub client_id: Option<String>,
    pub expires: DateTime<Utc>,
}

/// One delivery in flight.
pub struct WebhookContext {
    /// The webhook table prefix, e.g. "profile" for
    /// `gql_profile_wh_{sub,delivery}`.
    pub name: String,
    pub event: String,
    /// The authentication context of the request that caused the event.
    pub user: AuthContext,
    /// The event payload, exposed to resolvers during query execution.
    pub payload: Arc<dyn Any + Send + Sync>,
    /// The delivery identifier shared by every subscription receiving this
    /// event.
    pub payload_uuid: Uuid,
    pub subscription: WebhookSubscription,
}

impl std::fmt::Debug for WebhookContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookContext")
            .field("name", &self.name)
            .field("event", &self.event)
            .field("payload_uuid", &self.payload_uuid)
            .field("subscription", &self.subscription.id)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
struct PayloadValue(Arc<dyn Any + Send + Sync>);

/// Attach a webhook event payload to a context for query execution.
#[must_use]
pub fn payload_context(ctx: &Context, payload: Arc<dyn Any + Send + Sync>) -> Context {
    ctx.with(PayloadValue(payload))
}

/// Returns the active webhook payload. Resolvers backing webhook-only
/// fields call this to surface the event payload.
pub fn payload<T: Send + Sync + 'static>(ctx: &Context) -> Result<Arc<T>, GqlError> {
    let value = ctx.get::<PayloadValue>().ok_or_else(|| {
        GqlError::new("Cannot use this resolver without an active webhook context")
    })?;
    value
        .0
        .clone()
        .downcast::<T>()
        .map_err(|_| GqlError::new("Cannot use this resolver without an active webhook context"))
}

impl WebhookContext {
    /// Execute the stored query under the subscription's reduced
    /// authentication context and render the response body.
    pub async fn exec(
        &self,
        ctx: &Context,
        schema: &dyn ExecutableSchema,
    ) -> Result<Vec<u8>, WebhookError> {
        let sub = &self.subscription;
        let token_hash =
            TokenHash::from_hex(&sub.token_hash).expect("invalid token hash on subscription");

        let auth = match webhook_auth(
            ctx,
            &self.user,
            token_hash,
            &sub.grants,
            sub.client_id.as_deref(),
            sub.expires,
        ) {
            Ok(auth) => auth,
            Err(quay_auth::AuthError::WebhookExpired) => {
                return Err(WebhookError::SubscriptionExpired);
            }
            // The grants were validated when the subscription was created.
            Err(err) => panic!("invalid subscription auth: {err}"),
        };

        let exec_ctx = quay_auth::context(&payload_context(ctx, self.payload.clone()), auth);

        // Stored queries are validated at creation; failing to compile one
        // is an invariant violation.
        let op = schema
            .compile(&sub.query, None)
            .unwrap_or_else(|errs| panic!("stored webhook query failed to compile: {errs:?}"));

        let limits = quay_graphql::limits(ctx);
        let complexity = schema.complexity(&op, &Variables::new());
        if complexity > limits.max_complexity {
            return Err(WebhookError::TooComplex {
                complexity,
                max: limits.max_complexity,
            });
        }

        let response = schema.dispatch(exec_ctx, &op, Variables::new()).await;
        Ok(serde_json::to_vec(&response).expect("serialize webhook response"))
    }
}

/// The native webhook delivery queue.
#[derive(Clone)]
pub struct WebhookQueue {
    queue: Arc<Queue>,
    schema: Arc<dyn ExecutableSchema>,
}

impl WebhookQueue {
    /// Create the queue for the given schema. The caller registers it with
    /// the server, which starts and drains it.
    #[must_use]
    pub fn new(schema: Arc<dyn ExecutableSchema>) -> Self {
        Self {
            queue: Arc::new(Queue::new("webhooks")),
            schema,
        }
    }

    /// The underlying work queue, for registration with the server.
    #[must_use]
    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    /// Schedule delivery of an event to every matching subscription.
    ///
    /// The select builder should carry no columns: the caller prepares FROM
    /// (with the subscription table aliased to `sub`) and any refining
    /// WHERE clauses. `name` is the webhook table prefix, e.g. "profile"
    /// for `gql_profile_wh_{sub,delivery}`.
    ///
    /// `ctx` must carry the authentication context of the request causing
    /// the event; the queue snapshots it for per-delivery re-authentication.
    pub fn schedule(
        &self,
        ctx: &Context,
        q: SelectBuilder,
        name: &str,
        event: &str,
        payload_uuid: Uuid,
        payload: Arc<dyn Any + Send + Sync>,
    ) {
        let user = quay_auth::for_context(ctx).clone();
        let queue = self.queue.clone();
        let schema = self.schema.clone();
        let name = name.to_string();
        let event = event.to_string();

        self.queue.enqueue(Task::new(move |task_ctx| {
            let user = user.clone();
            let queue = queue.clone();
            let schema = schema.clone();
            let q = q.clone();
            let name = name.clone();
            let event = event.clone();
            let payload = payload.clone();
            async move {
                stage_one(
                    task_ctx,
                    queue,
                    schema,
                    q,
                    name,
                    event,
                    user,
                    payload_uuid,
                    payload,
                )
                .await
            }
        }));
    }
}

/// Fetch matching subscriptions, execute and persist every delivery in one
/// transaction, then enqueue the delivery tasks.
#[allow(clippy::too_many_arguments)]
async fn stage_one(
    ctx: Context,
    queue: Arc<Queue>,
    schema: Arc<dyn ExecutableSchema>,
    q: SelectBuilder,
    name: String,
    event: String,
    user: AuthContext,
    payload_uuid: Uuid,
    payload: Arc<dyn Any + Send + Sync>,
) -> Result<(), WorkError> {
    let subs = fetch_subscriptions(&ctx, q, &event)
        .await
        .map_err(WorkError::transient)?;
    if subs.is_empty() {
        return Ok(());
    }
    let count = subs.len();

    let webhooks: Vec<WebhookContext> = subs
        .into_iter()
        .map(|sub| WebhookContext {
            name: name.clone(),
            event: event.clone(),
            user: user.clone(),
            payload: payload.clone(),
            payload_uuid,
            subscription: sub,
        })
        .collect();

    let tx_ctx = ctx.clone();
    let tasks = with_tx(&ctx, TxOptions::default(), move |tx| {
        Box::pin(async move {
            let mut tasks = Vec::with_capacity(webhooks.len());
            for webhook in webhooks {
                if let Some(task) =
                    stage_two(&mut *tx, &tx_ctx, schema.as_ref(), &webhook).await?
                {
                    tasks.push(task);
                }
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
            "failed to enqueue webhooks"
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
        "enqueued webhook delivery"
    );
    Ok(())
}

async fn fetch_subscriptions(
    ctx: &Context,
    q: SelectBuilder,
    event: &str,
) -> Result<Vec<WebhookSubscription>, DbError> {
    let (sql, args) = q
        .columns(&[
            "sub.id",
            "sub.url",
            "sub.query",
            "sub.token_hash",
            "sub.grants",
            "sub.client_id",
            "sub.expires",
        ])
        .where_("? = ANY(sub.events)", [Arg::Text(event.to_string())])
        .build();

    with_tx(ctx, TxOptions::read_only(), move |tx| {
        Box::pin(async move {
            let rows = query_with_args(&sql, args).fetch_all(&mut *tx).await?;
            let mut subs = Vec::with_capacity(rows.len());
            for row in rows {
                subs.push(WebhookSubscription {
                    id: row.try_get(0)?,
                    url: row.try_get(1)?,
                    query: row.try_get(2)?,
                    token_hash: row.try_get(3)?,
                    grants: row.try_get(4)?,
                    client_id: row.try_get(5)?,
                    expires: DateTime::from_naive_utc_and_offset(
                        row.try_get::<NaiveDateTime, _>(6)?,
                        Utc,
                    ),
                });
            }
            Ok(subs)
        })
    })
    .await
}

/// Execute the stored query, insert the delivery record, and build the
/// delivery task. Returns `None` when the delivery is abandoned (expired
/// subscription) or recorded as failed without an attempt (complexity).
async fn stage_two(
    tx: &mut PgConnection,
    ctx: &Context,
    schema: &dyn ExecutableSchema,
    webhook: &WebhookContext,
) -> Result<Option<Task>, DbError> {
    let name = &webhook.name;
    let delivery_uuid = webhook.payload_uuid.to_string();
    let headers = request_headers(&webhook.event, &delivery_uuid);

    let payload = match webhook.exec(ctx, schema).await {
        Ok(payload) => payload,
        Err(err @ WebhookError::SubscriptionExpired) => {
            tracing::info!(
                target: "webhooks",
                subscription = webhook.subscription.id,
                error = %err,
                "abandoning webhook delivery"
            );
            return Ok(None);
        }
        Err(err) => {
            // Surface the failure in the delivery record; there is nothing
            // to POST and nothing to retry.
            let sql = format!(
                "INSERT INTO gql_{name}_wh_delivery \
                 (uuid, date, event, subscription_id, request_body, response_body, response_status) \
                 VALUES ($1, NOW() at time zone 'utc', $2, $3, '', $4, $5)"
            );
            sqlx::query(&sql)
                .bind(&delivery_uuid)
                .bind(&webhook.event)
                .bind(webhook.subscription.id)
                .bind(err.to_string())
                .bind(STATUS_STAGING_FAILED)
                .execute(&mut *tx)
                .await?;
            return Ok(None);
        }
    };

    let sql = format!(
        "INSERT INTO gql_{name}_wh_delivery \
         (uuid, date, event, subscription_id, request_body) \
         VALUES ($1, NOW() at time zone 'utc', $2, $3, $4) \
         RETURNING id"
    );
    let (delivery_id,): (i32,) = sqlx::query_as(&sql)
        .bind(&delivery_uuid)
        .bind(&webhook.event)
        .bind(webhook.subscription.id)
        .bind(String::from_utf8_lossy(&payload).into_owned())
        .fetch_one(&mut *tx)
        .await?;

    let task_name = name.clone();
    let task_url = webhook.subscription.url.clone();
    let payload = Arc::new(payload);
    let task = Task::new(move |task_ctx| {
        let name = task_name.clone();
        let url = task_url.clone();
        let headers = headers.clone();
        let payload = payload.clone();
        async move { deliver(task_ctx, name, url, headers, payload, delivery_id).await }
    })
    .retries(5)
    .after(move |_ctx, status| match &status.result {
        Ok(()) => {
            tracing::info!(
                target: "webhooks",
                delivery = %delivery_uuid,
                attempts = status.attempts,
                "webhook delivery complete"
            );
        }
        Err(err) => {
            tracing::error!(
                target: "webhooks",
                delivery = %delivery_uuid,
                attempts = status.attempts,
                error = %err,
                "webhook delivery failed"
            );
        }
    });
    Ok(Some(task))
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
        "UPDATE gql_{name}_wh_delivery \
         SET response_body = $1, response_status = $2, response_headers = $3 \
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
    fn subscriber_query_uses_events_array_membership() {
        let q = SelectBuilder::new()
            .from("gql_profile_wh_sub sub")
            .where_("sub.user_id = ?", [Arg::Int(7)]);
        let (sql, args) = q
            .columns(&[
                "sub.id",
                "sub.url",
                "sub.query",
                "sub.token_hash",
                "sub.grants",
                "sub.client_id",
                "sub.expires",
            ])
            .where_("? = ANY(sub.events)", [Arg::Text("profile:update".into())])
            .build();

        assert!(sql.ends_with("WHERE (sub.user_id = $1) AND ($2 = ANY(sub.events))"));
        assert_eq!(
            args,
            vec![Arg::Int(7), Arg::Text("profile:update".into())]
        );
    }

    #[test]
    fn payload_accessor_requires_webhook_context() {
        let ctx = Context::new();
        let err = payload::<String>(&ctx).unwrap_err();
        assert_eq!(
            err.message,
            "Cannot use this resolver without an active webhook context"
        );

        let ctx = payload_context(&ctx, Arc::new("hello".to_string()));
        let value = payload::<String>(&ctx).unwrap();
        assert_eq!(*value, "hello");

        // Wrong type is also a missing-context error to the resolver.
        assert!(payload::<i32>(&ctx).is_err());
    }
}
