//! GraphQL client for service-to-service calls within the quay fleet.
//!
//! Requests are authenticated with an encrypted `Internal` envelope naming
//! the user on whose behalf the call is made and the calling service. The
//! receiving side's auth middleware only accepts these envelopes from
//! configured internal networks and within a short freshness window.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use quay_core::Context;

/// Errors from internal GraphQL calls.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no {0} origin specified in config")]
    NoOrigin(String),

    #[error("request to {service} failed: {source}")]
    Request {
        service: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{service} returned status {status}: {body}")]
    Status {
        service: String,
        status: u16,
        body: String,
    },

    #[error("invalid response from {service}: {source}")]
    Decode {
        service: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A GraphQL request body.
#[derive(Debug, Clone, Serialize)]
pub struct GraphQlQuery {
    pub query: String,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub variables: Map<String, Value>,
}

impl GraphQlQuery {
    /// A query without variables.
    #[must_use]
    pub fn new(query: &str) -> Self {
        Self {
            query: query.to_string(),
            variables: Map::new(),
        }
    }

    /// Add a variable.
    #[must_use]
    pub fn variable(mut self, name: &str, value: Value) -> Self {
        self.variables.insert(name.to_string(), value);
        self
    }
}

#[derive(Serialize)]
struct InternalAuth<'a> {
    name: &'a str,
    client_id: &'a str,
    node_id: &'a str,
}

/// Execute `query` against the service `svc` on behalf of `username`,
/// deserializing the full response body into `result`.
///
/// The target origin is resolved from config as `[svc] api-origin`, then
/// `internal-origin`, then `origin`.
pub async fn execute<T: DeserializeOwned>(
    ctx: &Context,
    username: &str,
    svc: &str,
    query: GraphQlQuery,
) -> Result<T, ClientError> {
    let conf = quay_config::for_context(ctx);
    let origin = conf
        .get(svc, "api-origin")
        .or_else(|| conf.origin(svc, false))
        .ok_or_else(|| ClientError::NoOrigin(svc.to_string()))?;

    let auth = InternalAuth {
        name: username,
        client_id: quay_config::service_name(ctx),
        // TODO: Identify the node this process runs on.
        node_id: "quay",
    };
    let envelope = serde_json::to_vec(&auth).expect("serialize internal auth");
    let envelope = quay_crypto::for_context(ctx).encrypt(&envelope);

    let url = format!("{origin}/query");
    let response = reqwest::Client::new()
        .post(&url)
        .header("Content-Type", "application/json")
        .header("Authorization", format!("Internal {envelope}"))
        .json(&query)
        .send()
        .await
        .map_err(|source| ClientError::Request {
            service: svc.to_string(),
            source,
        })?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|source| ClientError::Request {
            service: svc.to_string(),
            source,
        })?;

    if status.as_u16() != 200 {
        return Err(ClientError::Status {
            service: svc.to_string(),
            status: status.as_u16(),
            body,
        });
    }

    serde_json::from_str(&body).map_err(|source| ClientError::Decode {
        service: svc.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde::Deserialize;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use quay_config::Config;
    use quay_crypto::Keys;

    const CONF_TEMPLATE: &str = r#"
[webhooks]
private-key=ebzsjPaN6E13ln/FeNWly1C92q6bVMVdOnDo1HPl5fc=

[sr.ht]
network-key=tbuG-7Vh44vrDq1L_HKWkHnWrDOtJhEkPKPiauaLeuk=

[meta.example.org]
api-origin=__ORIGIN__
"#;

    fn context(origin: &str) -> Context {
        let conf =
            Arc::new(Config::from_ini(&CONF_TEMPLATE.replace("__ORIGIN__", origin)).unwrap());
        let keys = Keys::from_config(&conf).unwrap();
        quay_config::context(&Context::new(), conf, "todo.example.org").with(keys)
    }

    #[derive(Debug, Deserialize)]
    struct MeResponse {
        data: MeData,
    }

    #[derive(Debug, Deserialize)]
    struct MeData {
        me: Profile,
    }

    #[derive(Debug, Deserialize)]
    struct Profile {
        id: i32,
        username: String,
    }

    #[tokio::test]
    async fn posts_query_with_internal_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/query"))
            .and(header_exists("Authorization"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {"me": {"id": 1337, "username": "jdoe"}}
            })))
            .mount(&server)
            .await;

        let ctx = context(&server.uri());
        let result: MeResponse = execute(
            &ctx,
            "jdoe",
            "meta.example.org",
            GraphQlQuery::new("query { me { id username } }"),
        )
        .await
        .unwrap();

        assert_eq!(result.data.me.id, 1337);
        assert_eq!(result.data.me.username, "jdoe");

        // The envelope decrypts with the shared network key and names both
        // the user and the calling service.
        let requests = server.received_requests().await.unwrap();
        let auth = requests[0].headers.get("Authorization").unwrap();
        let envelope = auth.to_str().unwrap().strip_prefix("Internal ").unwrap();
        let keys = Keys::from_keys(
            "ebzsjPaN6E13ln/FeNWly1C92q6bVMVdOnDo1HPl5fc=",
            "tbuG-7Vh44vrDq1L_HKWkHnWrDOtJhEkPKPiauaLeuk=",
        )
        .unwrap();
        let plain = keys.decrypt(envelope, 30).unwrap();
        let parsed: Value = serde_json::from_slice(&plain).unwrap();
        assert_eq!(parsed["name"], "jdoe");
        assert_eq!(parsed["client_id"], "todo.example.org");
    }

    #[tokio::test]
    async fn non_200_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/query"))
            .respond_with(ResponseTemplate::new(403).set_body_string("denied"))
            .mount(&server)
            .await;

        let ctx = context(&server.uri());
        let result: Result<MeResponse, _> = execute(
            &ctx,
            "jdoe",
            "meta.example.org",
            GraphQlQuery::new("query { me { id } }"),
        )
        .await;

        match result {
            Err(ClientError::Status { status, .. }) => assert_eq!(status, 403),
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_origin_is_an_error() {
        let ctx = context("http://unused.invalid");
        let result: Result<MeResponse, _> = execute(
            &ctx,
            "jdoe",
            "absent.example.org",
            GraphQlQuery::new("query { me { id } }"),
        )
        .await;
        assert!(matches!(result, Err(ClientError::NoOrigin(_))));
    }
}
