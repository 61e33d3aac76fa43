//! Webhook delivery for quay services.
//!
//! Two queue systems share one delivery contract (signed POSTs, persisted
//! delivery records, bounded retries):
//!
//! - the **legacy queue** fans an event out to subscribers registered by
//!   URL and event list, POSTing a caller-supplied JSON payload;
//! - the **native queue** executes each subscription's stored GraphQL query
//!   under a reduced re-creation of the subscriber's authentication context
//!   and POSTs the rendered response.
//!
//! Both stage deliveries the same way: one read-only transaction fetches
//! the subscribers, one read-write transaction inserts every delivery row,
//! and only then do the delivery tasks run.

mod config;
mod delivery;
mod error;
mod legacy;
mod native;

pub use config::{auth_config, filter_webhooks, AuthConfig};
pub use error::WebhookError;
pub use legacy::{LegacyQueue, LegacySubscription};
pub use native::{
    payload, payload_context, WebhookContext, WebhookQueue, WebhookSubscription,
};

use quay_core::Context;

/// Attach a native webhook queue handle to a context.
#[must_use]
pub fn context(ctx: &Context, queue: WebhookQueue) -> Context {
    ctx.with(queue)
}

/// Returns the native webhook queue for this context.
#[must_use]
pub fn for_context(ctx: &Context) -> &WebhookQueue {
    ctx.expect::<WebhookQueue>("webhook queue")
}

/// Attach a legacy webhook queue handle to a context.
#[must_use]
pub fn legacy_context(ctx: &Context, queue: LegacyQueue) -> Context {
    ctx.with(queue)
}

/// Returns the legacy webhook queue for this context.
#[must_use]
pub fn legacy_for_context(ctx: &Context) -> &LegacyQueue {
    ctx.expect::<LegacyQueue>("legacy webhook queue")
}
