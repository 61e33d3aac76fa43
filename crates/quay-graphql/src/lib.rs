//! The seam between the quay core and a GraphQL execution engine.
//!
//! The core never executes GraphQL itself. Embedding services provide an
//! [`ExecutableSchema`]: the core asks it to compile queries, estimate their
//! complexity, and dispatch compiled operations against a request context.
//! Everything else (type system, resolvers, field collection) belongs to the
//! engine behind the trait.
//!
//! This crate also owns the GraphQL wire error shape ([`GqlError`],
//! [`GqlResponse`]) used by the auth middleware and the input validation
//! helper in [`valid`].

mod error;
mod schema;
pub mod valid;

pub use error::{GqlError, GqlResponse};
pub use schema::{validate, CompiledQuery, ExecutableSchema, Variables};

use quay_core::Context;

/// Execution limits the server enforces on operations, carried in the
/// request context so webhook delivery can apply the same gate to stored
/// queries.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_complexity: usize,
}

/// Attach execution limits to a context.
#[must_use]
pub fn limits_context(ctx: &Context, limits: Limits) -> Context {
    ctx.with(limits)
}

/// Returns the execution limits for this context.
#[must_use]
pub fn limits(ctx: &Context) -> Limits {
    *ctx.expect::<Limits>("execution limits")
}
