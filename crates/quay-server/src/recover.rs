//! The recovery path for errors escaping GraphQL dispatch.
//!
//! Cancellation and deadline errors pass through verbatim so clients can
//! tell a timeout from a server fault. Everything else is logged with a
//! backtrace, emailed to the configured admin address (outside debug
//! mode), and replaced with the generic "internal system error".

use std::any::Any;
use std::backtrace::Backtrace;
use std::error::Error;

use quay_auth::AuthContext;
use quay_core::Context;
use quay_db::DbError;
use quay_email::EmailQueue;
use quay_graphql::GqlError;

/// Handle a panic escaping dispatch.
pub fn panic_recover(
    ctx: &Context,
    panic: Box<dyn Any + Send>,
    raw_query: Option<&str>,
) -> GqlError {
    let message = panic
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| panic.downcast_ref::<&str>().map(|s| (*s).to_string()))
        .unwrap_or_else(|| "unknown panic".to_string());
    report(ctx, &message, raw_query)
}

/// Handle an error escaping dispatch.
pub fn email_recover(
    ctx: &Context,
    err: &(dyn Error + 'static),
    raw_query: Option<&str>,
) -> GqlError {
    if is_cancellation(err) {
        return GqlError::new(err.to_string());
    }
    report(ctx, &err.to_string(), raw_query)
}

/// Cancellation and deadline errors are the client's doing, not ours.
fn is_cancellation(err: &(dyn Error + 'static)) -> bool {
    let mut current: Option<&(dyn Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(db) = e.downcast_ref::<DbError>() {
            if db.is_cancellation() {
                return true;
            }
        }
        if let Some(sql) = e.downcast_ref::<sqlx::Error>() {
            if quay_db::is_cancellation(sql) {
                return true;
            }
        }
        if e.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
            return true;
        }
        if e.to_string() == "canceling statement due to user request" {
            return true;
        }
        current = e.source();
    }
    false
}

fn report(ctx: &Context, message: &str, raw_query: Option<&str>) -> GqlError {
    let internal = GqlError::new("internal system error");
    let backtrace = Backtrace::force_capture();

    tracing::error!(target: "server", error = %message, "unhandled error in GraphQL dispatch");
    tracing::error!(target: "server", "{backtrace}");

    if quay_config::debug(ctx) {
        return internal;
    }

    let conf = quay_config::for_context(ctx);
    let Some(to) = conf.get("mail", "error-to") else {
        return internal;
    };
    if ctx.get::<EmailQueue>().is_none() {
        return internal;
    }

    let (username, email) = match ctx.get::<AuthContext>() {
        Some(auth) => (auth.username.clone(), auth.email.clone()),
        None => ("<unauthenticated>".to_string(), String::new()),
    };
    let subject = format!(
        "[{}] GraphQL query error: {message}",
        quay_config::service_name(ctx)
    );
    let body = format!(
        "Error occured processing GraphQL request:\n\n\
         {message}\n\n\
         When running the following query on behalf of {username} <{email}>:\n\n\
         {}\n\n\
         The following stack trace was produced:\n\n\
         {backtrace}",
        raw_query.unwrap_or("<none>"),
    );

    let to = to.to_string();
    if let Err(err) = quay_email::enqueue_std(ctx, &to, &subject, body) {
        tracing::error!(target: "server", error = %err, "failed to enqueue error report mail");
    }
    internal
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use quay_config::Config;

    fn debug_ctx() -> Context {
        let conf = Arc::new(Config::from_ini("[mail]\nerror-to=errors@example.org\n").unwrap());
        let ctx = quay_config::context(&Context::new(), conf, "todo.example.org");
        quay_config::options_context(
            &ctx,
            quay_config::Options {
                addr: None,
                debug: true,
            },
        )
    }

    #[test]
    fn panics_become_the_generic_error() {
        let err = panic_recover(&debug_ctx(), Box::new("boom".to_string()), None);
        assert_eq!(err.message, "internal system error");
    }

    #[test]
    fn cancellation_passes_through_verbatim() {
        let ctx = debug_ctx();

        let canceled = sqlx::Error::Database(Box::new(FakePgError));
        let err = email_recover(&ctx, &canceled, None);
        assert_eq!(err.message, canceled.to_string());

        let timeout = make_elapsed();
        let err = email_recover(&ctx, &timeout, None);
        assert_eq!(err.message, timeout.to_string());
    }

    #[test]
    fn other_errors_are_masked() {
        let ctx = debug_ctx();
        let err = email_recover(
            &ctx,
            &std::io::Error::new(std::io::ErrorKind::Other, "disk on fire"),
            Some("query { me }"),
        );
        assert_eq!(err.message, "internal system error");
    }

    fn make_elapsed() -> tokio::time::error::Elapsed {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(async {
            tokio::time::timeout(std::time::Duration::from_millis(1), std::future::pending::<()>())
                .await
                .unwrap_err()
        })
    }

    /// A stand-in for PostgreSQL's "canceling statement due to user
    /// request" (SQLSTATE 57014).
    #[derive(Debug)]
    struct FakePgError;

    impl std::fmt::Display for FakePgError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("canceling statement due to user request")
        }
    }

    impl std::error::Error for FakePgError {}

    impl sqlx::error::DatabaseError for FakePgError {
        fn message(&self) -> &str {
            "canceling statement due to user request"
        }

        fn code(&self) -> Option<std::borrow::Cow<'_, str>> {
            Some("57014".into())
        }

        fn kind(&self) -> sqlx::error::ErrorKind {
            sqlx::error::ErrorKind::Other
        }

        fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
            self
        }
    }
}
