//! Server assembly for quay GraphQL services.
//!
//! An embedding service builds its daemon in four steps:
//!
//! ```rust,ignore
//! let options = Options::parse_or_default("127.0.0.1:5103");
//! let conf = Config::load()?;
//! let webhooks = WebhookQueue::new(schema.clone());
//! let legacy = LegacyQueue::new();
//! Server::new("todo.example.org", conf, options)?
//!     .with_default_middleware()
//!     .await?
//!     .with_schema(schema, &["PROFILE", "TRACKERS", "TICKETS"])
//!     .with_context(|ctx| {
//!         let ctx = quay_webhooks::context(ctx, webhooks.clone());
//!         quay_webhooks::legacy_context(&ctx, legacy.clone())
//!     })
//!     .with_queues(&[webhooks.queue().clone(), legacy.queue().clone()])
//!     .run()
//!     .await?;
//! ```
//!
//! The server wires the middleware stack (metrics, context injection,
//! authentication, tracing, timeouts), the GraphQL routes, and graceful
//! shutdown: the first SIGINT drains in-flight requests for up to 30
//! seconds and then joins every registered work queue; a second SIGINT
//! terminates immediately.

mod cache;
mod directives;
mod handler;
mod middleware;
mod recover;

pub use cache::{cache_for_context, CacheClient};
pub use directives::{access, anon_internal, internal, private};
pub use middleware::{remote_addr, RemoteAddr};
pub use recover::{email_recover, panic_recover};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use quay_config::{Config, Options};
use quay_core::Context;
use quay_crypto::Keys;
use quay_graphql::{ExecutableSchema, Limits};
use quay_work::Queue;

use handler::HandlerState;

/// Requests time out after this long unless `[svc::api] max-duration` says
/// otherwise.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Default operation complexity cap, overridden by
/// `[svc::api] max-complexity`.
const DEFAULT_MAX_COMPLEXITY: usize = 250;

/// Drain window for in-flight requests after the first SIGINT.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// Upload cap on the GraphQL endpoint (1 GiB).
const UPLOAD_LIMIT: usize = 1024 * 1024 * 1024;

/// Server assembly errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] quay_config::ConfigError),

    #[error(transparent)]
    Crypto(#[from] quay_crypto::CryptoError),

    #[error(transparent)]
    Database(#[from] quay_db::DbError),

    #[error("invalid sr.ht::redis-host in config: {0}")]
    Redis(String),

    #[error("invalid [{0}::api] max-duration: {1}")]
    InvalidDuration(String, String),

    #[error("failed to install metrics recorder: {0}")]
    Metrics(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The common server for a quay GraphQL daemon.
pub struct Server {
    service: String,
    conf: Arc<Config>,
    options: Options,
    base_ctx: Context,
    limits: Limits,
    timeout: Duration,
    prometheus: PrometheusHandle,
    schema: Option<Arc<dyn ExecutableSchema>>,
    scopes: Vec<String>,
    queues: Vec<Arc<Queue>>,
}

impl Server {
    /// Create a server for `service`, loading the crypto keys and
    /// installing the metrics recorder.
    pub fn new(service: &str, conf: Config, options: Options) -> Result<Self, ServerError> {
        let conf = Arc::new(conf);
        let keys = Keys::from_config(&conf)?;
        let prometheus = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| ServerError::Metrics(e.to_string()))?;

        let base_ctx = quay_config::context(&Context::new(), conf.clone(), service);
        let base_ctx = quay_config::options_context(&base_ctx, options.clone());
        let base_ctx = base_ctx.with(keys);

        let max_complexity = match conf.get_api(service, "max-complexity") {
            Some(limit) => limit
                .parse()
                .unwrap_or_else(|e| panic!("invalid max-complexity {limit:?}: {e}")),
            None => DEFAULT_MAX_COMPLEXITY,
        };
        let timeout = match conf.get_api(service, "max-duration") {
            Some(spec) => parse_duration(spec).ok_or_else(|| {
                ServerError::InvalidDuration(service.to_string(), spec.to_string())
            })?,
            None => DEFAULT_TIMEOUT,
        };

        Ok(Self {
            service: service.to_string(),
            conf,
            options,
            base_ctx,
            limits: Limits { max_complexity },
            timeout,
            prometheus,
            schema: None,
            scopes: Vec::new(),
            queues: Vec::new(),
        })
    }

    /// Connect the database, cache, and mail queue, making them available
    /// to every request and queue task.
    pub async fn with_default_middleware(mut self) -> Result<Self, ServerError> {
        let pgcs = self.conf.require(&self.service, "connection-string")?;
        let pool = quay_db::connect(pgcs).await?;

        let rcs = self.conf.get_or("sr.ht", "redis-host", "redis://");
        let cache = CacheClient::open(rcs).map_err(|e| ServerError::Redis(e.to_string()))?;

        let email = quay_email::new_queue();
        self.queues.push(email.queue().clone());

        let ctx = quay_db::context(&self.base_ctx, pool);
        let ctx = cache::context(&ctx, cache);
        let ctx = quay_email::context(&ctx, email);
        let ctx = quay_graphql::limits_context(&ctx, self.limits);
        self.base_ctx = ctx;
        Ok(self)
    }

    /// Attach the GraphQL schema and the scopes it supports.
    #[must_use]
    pub fn with_schema(mut self, schema: Arc<dyn ExecutableSchema>, scopes: &[&str]) -> Self {
        self.schema = Some(schema);
        self.scopes = scopes.iter().map(|s| (*s).to_string()).collect();
        self
    }

    /// Register work queues for this server to start and, at shutdown,
    /// drain.
    #[must_use]
    pub fn with_queues(mut self, queues: &[Arc<Queue>]) -> Self {
        self.queues.extend(queues.iter().cloned());
        self
    }

    /// Layer additional values into the server's base context, making them
    /// available to every request and queue task. Embedding services use
    /// this to install their webhook queue handles.
    #[must_use]
    pub fn with_context(mut self, f: impl FnOnce(&Context) -> Context) -> Self {
        self.base_ctx = f(&self.base_ctx);
        self
    }

    /// The context queue tasks and request handlers run against. Useful for
    /// wiring additional queues that need the server's handles.
    #[must_use]
    pub fn context(&self) -> &Context {
        &self.base_ctx
    }

    fn router(&self) -> Router {
        let schema = self.schema.clone().expect("with_schema was not called");
        let state = HandlerState {
            schema,
            limits: self.limits,
            prometheus: self.prometheus.clone(),
            scopes: Arc::new(self.scopes.clone()),
        };

        let mut router = Router::new()
            .route(
                "/query",
                post(handler::graphql).layer(RequestBodyLimitLayer::new(UPLOAD_LIMIT)),
            )
            .route("/query/metrics", get(handler::metrics))
            .route("/query/api-meta.json", get(handler::api_meta));
        if self.options.debug {
            router = router.route("/", get(handler::playground));
        }

        let auth_state = quay_auth::AuthState::from_config(&self.conf, &self.service);

        // Outermost first: instrumentation, context injection, auth,
        // request-scoped concerns.
        router.with_state(state).layer(
            ServiceBuilder::new()
                .layer(axum::middleware::from_fn(middleware::instrument))
                .layer(axum::middleware::from_fn_with_state(
                    self.base_ctx.clone(),
                    middleware::inject,
                ))
                .layer(axum::middleware::from_fn_with_state(
                    auth_state,
                    quay_auth::middleware,
                ))
                .layer(axum::middleware::from_fn(middleware::real_ip))
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(self.timeout)),
        )
    }

    /// Run the server. Blocks until SIGINT and the subsequent drain.
    pub async fn run(self) -> Result<(), ServerError> {
        let addr = self.options.bind_addr().to_string();
        let router = self.router();

        for queue in &self.queues {
            queue.start(self.base_ctx.clone());
        }

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(target: "server", service = %self.service, %addr, "running");

        let token = CancellationToken::new();
        let sig_token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            tracing::info!(target: "server", "SIGINT caught, initiating warm shutdown");
            tracing::info!(target: "server", "SIGINT again to terminate immediately and drop pending requests & tasks");
            sig_token.cancel();
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!(target: "server", "second SIGINT, terminating");
                std::process::exit(1);
            }
        });

        let shutdown_token = token.clone();
        let serve = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown_token.cancelled().await });

        tokio::select! {
            result = serve => result?,
            () = async {
                token.cancelled().await;
                tokio::time::sleep(SHUTDOWN_DEADLINE).await;
            } => {
                tracing::warn!(target: "server", "drain deadline exceeded, dropping in-flight requests");
            }
        }

        tracing::info!(target: "server", "terminating work queues");
        for queue in &self.queues {
            tracing::info!(target: "server", queue = queue.name(), "draining queue");
            queue.join().await;
        }
        tracing::info!(target: "server", "server terminated");
        Ok(())
    }
}

/// Parse a duration like `500ms`, `3s`, or `2m`. A bare number is seconds.
fn parse_duration(spec: &str) -> Option<Duration> {
    let spec = spec.trim();
    if let Some(ms) = spec.strip_suffix("ms") {
        return ms.trim().parse().ok().map(Duration::from_millis);
    }
    if let Some(s) = spec.strip_suffix('s') {
        return s.trim().parse().ok().map(Duration::from_secs);
    }
    if let Some(m) = spec.strip_suffix('m') {
        return m.trim().parse::<u64>().ok().map(|m| Duration::from_secs(m * 60));
    }
    spec.parse().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_parsing() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("3s"), Some(Duration::from_secs(3)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("45"), Some(Duration::from_secs(45)));
        assert_eq!(parse_duration("soon"), None);
    }
}
