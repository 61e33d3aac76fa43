//! The GraphQL endpoint and its sibling routes.

use std::sync::Arc;

use axum::extract::State;
use axum::http::header;
use axum::response::{Html, IntoResponse, Response};
use axum::{Extension, Json};
use futures::FutureExt;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;

use quay_core::Context;
use quay_graphql::{ExecutableSchema, GqlResponse, Limits, Variables};

use crate::recover::panic_recover;

#[derive(Clone)]
pub(crate) struct HandlerState {
    pub schema: Arc<dyn ExecutableSchema>,
    pub limits: Limits,
    pub prometheus: PrometheusHandle,
    pub scopes: Arc<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GraphQlRequest {
    query: String,
    #[serde(default)]
    variables: Variables,
    #[serde(default, rename = "operationName")]
    operation_name: Option<String>,
}

/// POST /query
pub(crate) async fn graphql(
    State(state): State<HandlerState>,
    Extension(ctx): Extension<Context>,
    Json(request): Json<GraphQlRequest>,
) -> Response {
    let op = match state
        .schema
        .compile(&request.query, request.operation_name.as_deref())
    {
        Ok(op) => op,
        Err(errors) => return Json(GqlResponse::from_errors(errors)).into_response(),
    };

    let complexity = state.schema.complexity(&op, &request.variables);
    if complexity > state.limits.max_complexity {
        return Json(GqlResponse::from_error(format!(
            "operation has complexity {complexity}, which exceeds the maximum of {}",
            state.limits.max_complexity
        )))
        .into_response();
    }

    let dispatch = state.schema.dispatch(ctx.clone(), &op, request.variables);
    match std::panic::AssertUnwindSafe(dispatch).catch_unwind().await {
        Ok(response) => Json(response).into_response(),
        Err(panic) => {
            let err = panic_recover(&ctx, panic, Some(&request.query));
            Json(GqlResponse::from_errors(vec![err])).into_response()
        }
    }
}

/// GET /query/metrics
pub(crate) async fn metrics(State(state): State<HandlerState>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus.render(),
    )
        .into_response()
}

/// GET /query/api-meta.json
pub(crate) async fn api_meta(State(state): State<HandlerState>) -> Response {
    Json(serde_json::json!({ "scopes": &*state.scopes })).into_response()
}

/// GET /, only routed in debug mode.
pub(crate) async fn playground() -> Html<&'static str> {
    Html(PLAYGROUND)
}

const PLAYGROUND: &str = r#"<!DOCTYPE html>
<html>
  <head>
    <title>GraphQL playground</title>
    <style>body { margin: 0; } #graphiql { height: 100vh; }</style>
    <link rel="stylesheet" href="https://unpkg.com/graphiql/graphiql.min.css" />
  </head>
  <body>
    <div id="graphiql">Loading...</div>
    <script src="https://unpkg.com/react/umd/react.production.min.js"></script>
    <script src="https://unpkg.com/react-dom/umd/react-dom.production.min.js"></script>
    <script src="https://unpkg.com/graphiql/graphiql.min.js"></script>
    <script>
      ReactDOM.render(
        React.createElement(GraphiQL, {
          fetcher: GraphiQL.createFetcher({ url: '/query' }),
        }),
        document.getElementById('graphiql'),
      );
    </script>
  </body>
</html>
"#;
