//! Transactional PostgreSQL access for quay services.
//!
//! The connection pool is shared through the request context; queries run
//! inside [`with_tx`], which commits on success and rolls back on error (or
//! unwind). Read paths ask for a read-only transaction.

mod builder;
mod error;

pub use builder::{Arg, SelectBuilder};
pub use error::{is_cancellation, DbError};

use futures::future::BoxFuture;
use sqlx::postgres::{PgArguments, PgPoolOptions};
use sqlx::query::Query;
use sqlx::{PgConnection, PgPool, Postgres};

use quay_core::Context;

/// Open a connection pool for the given PostgreSQL connection string.
pub async fn connect(connection_string: &str) -> Result<PgPool, DbError> {
    PgPoolOptions::new()
        .max_connections(16)
        .connect(connection_string)
        .await
        .map_err(DbError::Connect)
}

/// Attach a connection pool to a context.
#[must_use]
pub fn context(ctx: &Context, pool: PgPool) -> Context {
    ctx.with(pool)
}

/// Returns the connection pool for this context.
#[must_use]
pub fn for_context(ctx: &Context) -> &PgPool {
    ctx.expect::<PgPool>("database")
}

/// Transaction options.
#[derive(Debug, Clone, Copy, Default)]
pub struct TxOptions {
    pub read_only: bool,
}

impl TxOptions {
    /// Options for a read-only transaction.
    #[must_use]
    pub fn read_only() -> Self {
        Self { read_only: true }
    }
}

/// Run `f` inside a transaction on the context's pool.
///
/// The transaction is committed when `f` returns `Ok` and rolled back when
/// it returns `Err`. If `f` unwinds, the dropped transaction rolls back
/// before the panic continues.
pub async fn with_tx<T, F>(ctx: &Context, opts: TxOptions, f: F) -> Result<T, DbError>
where
    F: for<'t> FnOnce(&'t mut PgConnection) -> BoxFuture<'t, Result<T, DbError>>,
{
    with_pool_tx(for_context(ctx), opts, f).await
}

/// [`with_tx`] against an explicit pool.
pub async fn with_pool_tx<T, F>(pool: &PgPool, opts: TxOptions, f: F) -> Result<T, DbError>
where
    F: for<'t> FnOnce(&'t mut PgConnection) -> BoxFuture<'t, Result<T, DbError>>,
{
    let mut tx = pool.begin().await.map_err(DbError::Begin)?;
    if opts.read_only {
        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(DbError::Begin)?;
    }

    match f(&mut *tx).await {
        Ok(value) => {
            tx.commit().await.map_err(DbError::Commit)?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rb) = tx.rollback().await {
                tracing::error!(target: "database", error = %rb, "transaction rollback failed");
            }
            Err(err)
        }
    }
}

/// Build an executable query from SQL and the builder's collected arguments.
#[must_use]
pub fn query_with_args(sql: &str, args: Vec<Arg>) -> Query<'_, Postgres, PgArguments> {
    let mut query = sqlx::query(sql);
    for arg in args {
        query = match arg {
            Arg::Bool(v) => query.bind(v),
            Arg::Int(v) => query.bind(v),
            Arg::BigInt(v) => query.bind(v),
            Arg::Text(v) => query.bind(v),
            Arg::Uuid(v) => query.bind(v),
            Arg::Timestamp(v) => query.bind(v),
            Arg::Null => query.bind(None::<String>),
        };
    }
    query
}
