use std::any::Any;

use async_trait::async_trait;
use serde_json::{Map, Value};

use quay_core::Context;

use crate::error::{GqlError, GqlResponse};

/// GraphQL operation variables.
pub type Variables = Map<String, Value>;

/// A parsed and validated GraphQL operation.
///
/// The engine-specific representation is opaque to the core; the engine
/// downcasts it back in [`ExecutableSchema::complexity`] and
/// [`ExecutableSchema::dispatch`].
pub struct CompiledQuery {
    query: String,
    operation_name: Option<String>,
    inner: Box<dyn Any + Send + Sync>,
}

impl CompiledQuery {
    /// Wrap an engine-compiled operation.
    #[must_use]
    pub fn new(
        query: &str,
        operation_name: Option<&str>,
        inner: Box<dyn Any + Send + Sync>,
    ) -> Self {
        Self {
            query: query.to_string(),
            operation_name: operation_name.map(str::to_string),
            inner,
        }
    }

    /// The raw query text this operation was compiled from.
    #[must_use]
    pub fn query(&self) -> &str {
        &self.query
    }

    /// The requested operation name, if any.
    #[must_use]
    pub fn operation_name(&self) -> Option<&str> {
        self.operation_name.as_deref()
    }

    /// Recover the engine's compiled representation.
    #[must_use]
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }
}

impl std::fmt::Debug for CompiledQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledQuery")
            .field("operation_name", &self.operation_name)
            .finish_non_exhaustive()
    }
}

/// What the core requires of a GraphQL execution engine.
#[async_trait]
pub trait ExecutableSchema: Send + Sync + 'static {
    /// Parse and validate `query` against the schema without executing it.
    fn compile(
        &self,
        query: &str,
        operation_name: Option<&str>,
    ) -> Result<CompiledQuery, Vec<GqlError>>;

    /// Estimate the cost of a compiled operation.
    fn complexity(&self, query: &CompiledQuery, variables: &Variables) -> usize;

    /// Execute a compiled operation against the given request context.
    async fn dispatch(
        &self,
        ctx: Context,
        query: &CompiledQuery,
        variables: Variables,
    ) -> GqlResponse;
}

/// Validate `query` against `schema` without executing it. Used when storing
/// user-supplied webhook queries.
pub fn validate(schema: &dyn ExecutableSchema, query: &str) -> Result<(), Vec<GqlError>> {
    schema.compile(query, None).map(|_| ())
}
