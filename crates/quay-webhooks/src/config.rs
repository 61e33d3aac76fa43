//! Deriving webhook subscription configuration from the authenticated
//! request that creates or manages a subscription.

use chrono::{DateTime, Utc};

use quay_auth::AuthMethod;
use quay_core::Context;
use quay_db::Arg;

use crate::error::WebhookError;

/// A snapshot of the authentication parameters a webhook context is rebuilt
/// from at delivery time.
///
/// Invariants:
/// 1. `auth_method` is always [`AuthMethod::Oauth2`] (other methods cannot
///    configure native webhooks).
/// 2. `token_hash`, `grants`, and `expires` are set; `client_id` is set for
///    third-party tokens only.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub auth_method: AuthMethod,
    pub token_hash: String,
    pub grants: String,
    pub client_id: Option<String>,
    pub expires: DateTime<Utc>,
}

/// Pull the authentication details for a new webhook subscription out of
/// the request context.
///
/// Legacy OAuth and cookie sessions cannot configure native webhooks and
/// are reported as errors. Internal and recursive webhook authentication
/// reaching this point is a bug.
pub fn auth_config(ctx: &Context) -> Result<AuthConfig, WebhookError> {
    let user = quay_auth::for_context(ctx);
    match user.method {
        AuthMethod::OauthLegacy => Err(WebhookError::UnsupportedAuth(
            "Native webhooks are not supported with legacy OAuth",
        )),
        AuthMethod::Cookie => Err(WebhookError::UnsupportedAuth(
            "Native webhooks are not supported with web authentication",
        )),
        AuthMethod::Oauth2 => {
            let token_hash = user
                .token_hash
                .as_ref()
                .expect("OAuth 2.0 auth context without token hash")
                .hex();
            let bt = user
                .bearer_token
                .as_ref()
                .expect("OAuth 2.0 auth context without bearer token");
            let client_id = if bt.client_id.is_empty() {
                None
            } else {
                Some(bt.client_id.clone())
            };
            Ok(AuthConfig {
                auth_method: AuthMethod::Oauth2,
                token_hash,
                grants: bt.grants.clone(),
                client_id,
                expires: bt.expires_at(),
            })
        }
        AuthMethod::Internal | AuthMethod::AnonInternal => {
            panic!("Internal webtoken auth is not supported")
        }
        AuthMethod::Webhook => panic!("Recursive webhook auth is not supported"),
    }
}

/// An SQL condition restricting webhook subscription rows to those the
/// current token may see, for use with
/// [`quay_db::SelectBuilder::where_`].
pub fn filter_webhooks(ctx: &Context) -> Result<(String, Vec<Arg>), WebhookError> {
    let ac = auth_config(ctx)?;
    if let Some(client_id) = ac.client_id {
        Ok((
            "NOW() at time zone 'utc' < expires AND token_hash = ? AND client_id = ?".to_string(),
            vec![Arg::Text(ac.token_hash), Arg::Text(client_id)],
        ))
    } else {
        Ok(("NOW() at time zone 'utc' < expires".to_string(), Vec::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    use quay_auth::{AuthContext, BearerToken, Grants, TokenHash};

    fn ctx_with(auth: AuthContext) -> Context {
        quay_auth::context(&Context::new(), auth)
    }

    fn oauth2_auth(client_id: &str) -> AuthContext {
        let mut auth = AuthContext::empty(AuthMethod::Oauth2);
        auth.username = "jdoe".to_string();
        auth.token_hash = Some(TokenHash::of("token"));
        auth.grants = Grants::all();
        auth.bearer_token = Some(BearerToken {
            version: 0,
            expires: (Utc::now() + Duration::hours(1)).timestamp(),
            grants: "todo.example.org/TRACKERS:RW".to_string(),
            client_id: client_id.to_string(),
            username: "jdoe".to_string(),
        });
        auth
    }

    #[test]
    fn oauth2_personal_token_config() {
        let ctx = ctx_with(oauth2_auth(""));
        let ac = auth_config(&ctx).unwrap();
        assert_eq!(ac.auth_method, AuthMethod::Oauth2);
        assert_eq!(ac.token_hash, TokenHash::of("token").hex());
        assert_eq!(ac.grants, "todo.example.org/TRACKERS:RW");
        assert_eq!(ac.client_id, None);
    }

    #[test]
    fn oauth2_client_token_config() {
        let ctx = ctx_with(oauth2_auth("client-uuid"));
        let ac = auth_config(&ctx).unwrap();
        assert_eq!(ac.client_id.as_deref(), Some("client-uuid"));
    }

    #[test]
    fn legacy_and_cookie_are_rejected() {
        let ctx = ctx_with(AuthContext::empty(AuthMethod::OauthLegacy));
        assert!(matches!(
            auth_config(&ctx),
            Err(WebhookError::UnsupportedAuth(_))
        ));

        let ctx = ctx_with(AuthContext::empty(AuthMethod::Cookie));
        assert!(matches!(
            auth_config(&ctx),
            Err(WebhookError::UnsupportedAuth(_))
        ));
    }

    #[test]
    #[should_panic(expected = "Internal webtoken auth is not supported")]
    fn internal_auth_is_a_hard_guard() {
        let ctx = ctx_with(AuthContext::empty(AuthMethod::Internal));
        let _ = auth_config(&ctx);
    }

    #[test]
    #[should_panic(expected = "Recursive webhook auth is not supported")]
    fn recursive_webhook_auth_is_a_hard_guard() {
        let ctx = ctx_with(AuthContext::empty(AuthMethod::Webhook));
        let _ = auth_config(&ctx);
    }

    #[test]
    fn filter_limits_by_token_for_client_tokens() {
        let ctx = ctx_with(oauth2_auth("client-uuid"));
        let (clause, args) = filter_webhooks(&ctx).unwrap();
        assert!(clause.contains("token_hash = ?"));
        assert!(clause.contains("client_id = ?"));
        assert_eq!(args.len(), 2);

        let ctx = ctx_with(oauth2_auth(""));
        let (clause, args) = filter_webhooks(&ctx).unwrap();
        assert_eq!(clause, "NOW() at time zone 'utc' < expires");
        assert!(args.is_empty());
    }
}
