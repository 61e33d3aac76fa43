//! Shared request context for the quay service core.
//!
//! Every request handler, GraphQL resolver, and background task in a quay
//! service runs against a [`Context`]: an immutable bag of typed values
//! (configuration, database pool, auth context, queue handles, …) assembled
//! by the server's middleware stack. Background tasks receive a context
//! assembled once at startup instead.
//!
//! Each crate that contributes a value owns its accessor (for example
//! `quay_auth::for_context`), keeping the set of keys decentralized. A
//! missing value is broken wiring and the accessors treat it as such.

mod context;

pub use context::Context;
