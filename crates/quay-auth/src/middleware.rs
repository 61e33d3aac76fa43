//! The authentication middleware.
//!
//! Runs ahead of every `/query*` route (metrics and the API metadata
//! document excepted), classifies the request's credentials, and attaches
//! the resulting [`AuthContext`] to the request context. Failures answer
//! with a GraphQL-shaped error body and an HTTP status distinguishing
//! malformed requests (400), missing credentials (401), rejected
//! credentials (403), and transient infrastructure trouble (500).

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use ipnetwork::IpNetwork;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use quay_config::Config;
use quay_core::Context;
use quay_graphql::GqlResponse;

use crate::lookup::{
    auth_for_oauth_client, auth_for_username, lookup_legacy_token, lookup_token_revocation,
    lookup_user,
};
use crate::models::{AuthContext, AuthMethod, InternalAuth, TokenHash};
use crate::token::BearerToken;
use crate::{AuthError, Grants};

/// The unified login session cookie shared across the fleet.
pub const LOGIN_COOKIE: &str = "sr.ht.unified-login.v1";

/// Freshness window for internal envelopes.
const INTERNAL_TTL_SECONDS: u64 = 30;

static OAUTH2_BEARER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9a-zA-Z_+/]{33,}$").unwrap());
static LEGACY_BEARER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9a-f]{32}$").unwrap());

/// Configuration parsed once at server assembly.
#[derive(Clone)]
pub struct AuthState {
    internal_nets: Arc<Vec<IpNetwork>>,
}

impl AuthState {
    /// Read `[<service>::api] internal-ipnet` (default loopback ranges).
    ///
    /// Panics on an unparseable CIDR; that is a deployment error caught at
    /// startup.
    #[must_use]
    pub fn from_config(conf: &Config, service: &str) -> Self {
        let src = conf
            .get_api(service, "internal-ipnet")
            .unwrap_or("127.0.0.1/24,::1/64");
        let nets = src
            .split(',')
            .map(|cidr| {
                cidr.trim()
                    .parse::<IpNetwork>()
                    .unwrap_or_else(|e| panic!("invalid internal-ipnet {cidr:?}: {e}"))
            })
            .collect();
        Self {
            internal_nets: Arc::new(nets),
        }
    }

    /// True when `ip` falls within one of the configured internal networks.
    #[must_use]
    pub fn is_internal(&self, ip: IpAddr) -> bool {
        self.internal_nets.iter().any(|net| net.contains(ip))
    }
}

fn auth_error(reason: &str, code: StatusCode) -> Response {
    let body = GqlResponse::from_error(format!("Authentication error: {reason}"));
    (code, Json(body)).into_response()
}

/// Map a lookup failure onto the wire: transient trouble is a 500, anything
/// else rejects the credentials.
fn auth_error_from(err: &AuthError) -> Response {
    if err.is_transient() {
        tracing::error!(target: "auth", error = %err, "transient authentication failure");
        return auth_error("Temporary error; try again later", StatusCode::INTERNAL_SERVER_ERROR);
    }
    auth_error(&err.to_string(), StatusCode::FORBIDDEN)
}

#[derive(Debug, PartialEq, Eq)]
enum BearerKind {
    OAuth2,
    Legacy,
    Invalid,
}

fn classify_bearer(token: &str) -> BearerKind {
    if OAUTH2_BEARER.is_match(token) {
        BearerKind::OAuth2
    } else if LEGACY_BEARER.is_match(token) {
        BearerKind::Legacy
    } else {
        BearerKind::Invalid
    }
}

fn request_cookie(req: &Request, name: &str) -> Option<String> {
    for header in req.headers().get_all(axum::http::header::COOKIE) {
        let Ok(value) = header.to_str() else { continue };
        for pair in value.split(';') {
            let Some((key, val)) = pair.trim().split_once('=') else {
                continue;
            };
            if key == name {
                return Some(val.to_string());
            }
        }
    }
    None
}

/// The auth middleware. Expects the request context (config, keys,
/// database, …) to already be installed in the request extensions.
pub async fn middleware(State(state): State<AuthState>, req: Request, next: Next) -> Response {
    let path = req.uri().path();
    if !path.starts_with("/query")
        || path == "/query/metrics"
        || path == "/query/api-meta.json"
    {
        return next.run(req).await;
    }

    let ctx = req
        .extensions()
        .get::<Context>()
        .cloned()
        .expect("no request context installed before auth middleware");

    if let Some(cookie) = request_cookie(&req, LOGIN_COOKIE) {
        return match cookie_auth(&ctx, &cookie).await {
            Ok(auth) => proceed(req, next, &ctx, auth).await,
            Err(resp) => resp,
        };
    }

    let Some(header) = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    else {
        return auth_error(
            "Authorization header is required. Expected 'Authorization: Bearer [token]'",
            StatusCode::UNAUTHORIZED,
        );
    };

    let Some((scheme, credential)) = header.split_once(' ') else {
        return auth_error("Invalid Authorization header", StatusCode::BAD_REQUEST);
    };

    match scheme {
        "Bearer" => match classify_bearer(credential) {
            BearerKind::OAuth2 => {
                let hash = TokenHash::of(credential);
                match oauth2(&ctx, credential, hash).await {
                    Ok(auth) => proceed(req, next, &ctx, auth).await,
                    Err(resp) => resp,
                }
            }
            BearerKind::Legacy => {
                let hash = TokenHash::of(credential);
                match legacy_oauth(&ctx, hash).await {
                    Ok(auth) => proceed(req, next, &ctx, auth).await,
                    Err(resp) => resp,
                }
            }
            BearerKind::Invalid => {
                auth_error("Invalid OAuth bearer token", StatusCode::BAD_REQUEST)
            }
        },
        "Internal" => {
            let ip = remote_ip(&req);
            match internal_auth(&ctx, &state, ip, credential).await {
                Ok(auth) => proceed(req, next, &ctx, auth).await,
                Err(resp) => resp,
            }
        }
        _ => auth_error("Invalid Authorization header", StatusCode::BAD_REQUEST),
    }
}

async fn proceed(mut req: Request, next: Next, ctx: &Context, auth: AuthContext) -> Response {
    req.extensions_mut().insert(crate::context(ctx, auth));
    next.run(req).await
}

fn remote_ip(req: &Request) -> IpAddr {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip())
        .expect("unable to determine remote address")
}

#[derive(Deserialize)]
struct AuthCookie {
    /// The username of the authenticated user.
    name: String,
}

async fn cookie_auth(ctx: &Context, cookie: &str) -> Result<AuthContext, Response> {
    let keys = quay_crypto::for_context(ctx);
    // Cookie rotation is the login service's responsibility; no freshness
    // check is applied here.
    let Some(payload) = keys.decrypt_without_expiration(cookie) else {
        return Err(auth_error(
            "Invalid authentication cookie",
            StatusCode::FORBIDDEN,
        ));
    };

    // The payload authenticated, so it is trusted data.
    let cookie: AuthCookie =
        serde_json::from_slice(&payload).expect("invalid authentication cookie payload");

    match auth_for_username(ctx, &cookie.name).await {
        Ok(mut auth) => {
            auth.method = AuthMethod::Cookie;
            Ok(auth)
        }
        Err(err) => Err(auth_error_from(&err)),
    }
}

/// How one half of the OAuth 2.0 verification went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Pass,
    Reject,
    Transient,
}

/// The verdict over both halves: any transient failure wins (the client
/// should retry), then any rejection; otherwise the request passes.
fn fold_outcomes(user: Outcome, revocation: Outcome) -> Outcome {
    match (user, revocation) {
        (Outcome::Transient, _) | (_, Outcome::Transient) => Outcome::Transient,
        (Outcome::Reject, _) | (_, Outcome::Reject) => Outcome::Reject,
        (Outcome::Pass, Outcome::Pass) => Outcome::Pass,
    }
}

async fn oauth2(ctx: &Context, token: &str, hash: TokenHash) -> Result<AuthContext, Response> {
    let keys = quay_crypto::for_context(ctx);
    let Some(bt) = BearerToken::decode(keys, token) else {
        return Err(auth_error(
            "Invalid or expired OAuth 2.0 bearer token",
            StatusCode::FORBIDDEN,
        ));
    };

    // Both lookups run concurrently and both must succeed. Neither cancels
    // the other; each is classified on its own.
    let (user, revocation) = tokio::join!(
        lookup_user(ctx, &bt.username),
        lookup_token_revocation(ctx, &bt.username, &hash, &bt.client_id),
    );

    let user_outcome = match &user {
        Ok(_) => Outcome::Pass,
        Err(err) => {
            tracing::error!(target: "auth", error = %err, "user lookup failed");
            if err.is_transient() {
                Outcome::Transient
            } else {
                Outcome::Reject
            }
        }
    };
    let revocation_outcome = match &revocation {
        Ok(false) => Outcome::Pass,
        Ok(true) => Outcome::Reject,
        Err(err) => {
            tracing::error!(target: "auth", error = %err, "token revocation lookup failed");
            Outcome::Transient
        }
    };

    match fold_outcomes(user_outcome, revocation_outcome) {
        Outcome::Transient => {
            return Err(auth_error(
                "Temporary error; try again later",
                StatusCode::INTERNAL_SERVER_ERROR,
            ));
        }
        Outcome::Reject => {
            return Err(auth_error(
                "Invalid or expired OAuth 2.0 bearer token",
                StatusCode::FORBIDDEN,
            ));
        }
        Outcome::Pass => {}
    }

    let mut auth = user.expect("verified user lookup");
    if auth.user_type == crate::UserType::Suspended {
        return Err(auth_error(
            &AuthError::Suspended(auth.suspension_notice.unwrap_or_default()).to_string(),
            StatusCode::FORBIDDEN,
        ));
    }

    let grants = match Grants::decode(quay_config::service_name(ctx), &bt.grants) {
        Ok(grants) => grants,
        Err(err) => {
            tracing::error!(target: "auth", error = %err, "malformed grants in bearer token");
            return Err(auth_error(
                "Invalid or expired OAuth 2.0 bearer token",
                StatusCode::FORBIDDEN,
            ));
        }
    };

    auth.method = AuthMethod::Oauth2;
    auth.bearer_token = Some(bt);
    auth.token_hash = Some(hash);
    auth.grants = grants;
    Ok(auth)
}

async fn legacy_oauth(ctx: &Context, hash: TokenHash) -> Result<AuthContext, Response> {
    let token = match lookup_legacy_token(ctx, &hash.hex()).await {
        Ok(Some(token)) => token,
        Ok(None) => {
            return Err(auth_error(
                "Invalid or expired OAuth token",
                StatusCode::FORBIDDEN,
            ));
        }
        Err(err) => return Err(auth_error_from(&err)),
    };

    if Utc::now() > token.expires {
        return Err(auth_error(
            "Invalid or expired OAuth token",
            StatusCode::FORBIDDEN,
        ));
    }

    let auth = token.auth;
    if auth.user_type == crate::UserType::Suspended {
        return Err(auth_error(
            &AuthError::Suspended(auth.suspension_notice.clone().unwrap_or_default()).to_string(),
            StatusCode::FORBIDDEN,
        ));
    }

    // Only wildcard-scope legacy tokens may use the GraphQL API.
    if token.scopes != "*" {
        return Err(auth_error(
            "Presently, OAuth authentication to the GraphQL API is only supported for OAuth tokens with all permissions, namely '*'.",
            StatusCode::FORBIDDEN,
        ));
    }

    Ok(auth)
}

async fn internal_auth(
    ctx: &Context,
    state: &AuthState,
    ip: IpAddr,
    envelope: &str,
) -> Result<AuthContext, Response> {
    if !state.is_internal(ip) {
        return Err(auth_error(
            &format!("Invalid source IP {ip} for internal auth"),
            StatusCode::UNAUTHORIZED,
        ));
    }

    let keys = quay_crypto::for_context(ctx);
    let Some(payload) = keys.decrypt(envelope, INTERNAL_TTL_SECONDS) else {
        return Err(auth_error(
            "Invalid Authorization header (encryption error)",
            StatusCode::FORBIDDEN,
        ));
    };

    // Authenticated by the network key, so trusted data.
    let internal: InternalAuth =
        serde_json::from_slice(&payload).expect("invalid internal auth payload");

    if internal.client_id.is_empty() || internal.node_id.is_empty() {
        return Err(auth_error(
            "Invalid Authorization header (missing Client ID or Node ID)",
            StatusCode::FORBIDDEN,
        ));
    }

    let result = if let Some(uuid) = internal
        .oauth_client_uuid
        .as_deref()
        .filter(|u| !u.is_empty())
    {
        auth_for_oauth_client(ctx, uuid).await
    } else if !internal.name.is_empty() {
        auth_for_username(ctx, &internal.name).await
    } else {
        // Anonymous internal auth: only used when registering a new account.
        Ok(AuthContext::anonymous_internal())
    };

    match result {
        Ok(mut auth) => {
            if auth.method != AuthMethod::AnonInternal {
                auth.method = AuthMethod::Internal;
            }
            auth.internal = Some(internal);
            Ok(auth)
        }
        Err(err) => Err(auth_error_from(&err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_classification() {
        // 33+ chars of token alphabet is an OAuth 2.0 token.
        assert_eq!(
            classify_bearer("0123456789abcdefghijklmnopqrstuvw"),
            BearerKind::OAuth2
        );
        assert_eq!(
            classify_bearer("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA+/_0"),
            BearerKind::OAuth2
        );
        // Exactly 32 lowercase hex chars is a legacy token.
        assert_eq!(
            classify_bearer("0123456789abcdef0123456789abcdef"),
            BearerKind::Legacy
        );
        // Anything else is malformed.
        assert_eq!(classify_bearer("shorttoken"), BearerKind::Invalid);
        assert_eq!(
            classify_bearer("0123456789ABCDEF0123456789ABCDEF"),
            BearerKind::Invalid
        );
        assert_eq!(classify_bearer("has spaces in it and is long enough"), BearerKind::Invalid);
    }

    #[test]
    fn internal_network_gate() {
        let conf = Config::from_ini("").unwrap();
        let state = AuthState::from_config(&conf, "todo.example.org");

        assert!(state.is_internal("127.0.0.1".parse().unwrap()));
        assert!(state.is_internal("127.0.0.99".parse().unwrap()));
        assert!(state.is_internal("::1".parse().unwrap()));
        assert!(!state.is_internal("1.2.3.4".parse().unwrap()));
    }

    #[test]
    fn internal_network_gate_from_config() {
        let conf = Config::from_ini(
            "[todo.example.org::api]\ninternal-ipnet=10.0.0.0/8,192.168.1.0/24\n",
        )
        .unwrap();
        let state = AuthState::from_config(&conf, "todo.example.org");

        assert!(state.is_internal("10.1.2.3".parse().unwrap()));
        assert!(state.is_internal("192.168.1.10".parse().unwrap()));
        assert!(!state.is_internal("127.0.0.1".parse().unwrap()));
    }

    #[test]
    #[should_panic(expected = "invalid internal-ipnet")]
    fn malformed_internal_ipnet_panics_at_startup() {
        let conf =
            Config::from_ini("[todo.example.org::api]\ninternal-ipnet=not-a-cidr\n").unwrap();
        let _ = AuthState::from_config(&conf, "todo.example.org");
    }

    #[test]
    fn outcome_folding() {
        use Outcome::{Pass, Reject, Transient};

        // Both halves must pass.
        assert_eq!(fold_outcomes(Pass, Pass), Pass);
        assert_eq!(fold_outcomes(Reject, Pass), Reject);
        assert_eq!(fold_outcomes(Pass, Reject), Reject);
        assert_eq!(fold_outcomes(Reject, Reject), Reject);

        // Transient trouble anywhere wins over rejection: the client should
        // retry rather than conclude its token is dead.
        assert_eq!(fold_outcomes(Transient, Pass), Transient);
        assert_eq!(fold_outcomes(Pass, Transient), Transient);
        assert_eq!(fold_outcomes(Transient, Reject), Transient);
        assert_eq!(fold_outcomes(Reject, Transient), Transient);
    }

    #[test]
    fn cookie_header_parsing() {
        let req = axum::http::Request::builder()
            .uri("/query")
            .header("Cookie", "a=1; sr.ht.unified-login.v1=gAAAAAtoken; b=2")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(
            request_cookie(&req, LOGIN_COOKIE).as_deref(),
            Some("gAAAAAtoken")
        );
        assert_eq!(request_cookie(&req, "missing"), None);
    }
}
