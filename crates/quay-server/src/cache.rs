//! The shared cache client, injected into the request context for
//! embedding services. The core itself never queries it.

use quay_core::Context;

/// A handle on the fleet's Redis instance.
pub type CacheClient = redis::Client;

/// Attach a cache client to a context.
#[must_use]
pub fn context(ctx: &Context, client: CacheClient) -> Context {
    ctx.with(client)
}

/// Returns the cache client for this context.
#[must_use]
pub fn cache_for_context(ctx: &Context) -> &CacheClient {
    ctx.expect::<CacheClient>("cache client")
}
