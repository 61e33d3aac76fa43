//! Field-level access gates.
//!
//! The embedding service's schema wires these into its field directives;
//! each consults the request's authentication context and returns a
//! GraphQL error (never an HTTP error) on rejection.

use quay_auth::{AccessMode, AuthMethod};
use quay_core::Context;
use quay_graphql::GqlError;

/// `@anoninternal`: the field is only reachable over anonymous internal
/// authentication (account registration).
pub fn anon_internal(ctx: &Context) -> Result<(), GqlError> {
    if quay_auth::for_context(ctx).method != AuthMethod::AnonInternal {
        return Err(GqlError::new("Internal auth access denied"));
    }
    Ok(())
}

/// `@internal`: the field is only reachable from other services in the
/// fleet.
pub fn internal(ctx: &Context) -> Result<(), GqlError> {
    if quay_auth::for_context(ctx).method != AuthMethod::Internal {
        return Err(GqlError::new("Internal auth access denied"));
    }
    Ok(())
}

/// `@private`: reachable internally and with first-party credentials, but
/// never by a third-party OAuth client.
pub fn private(ctx: &Context) -> Result<(), GqlError> {
    let user = quay_auth::for_context(ctx);
    match user.method {
        AuthMethod::Internal => Ok(()),
        AuthMethod::Oauth2 => {
            let client_id = user
                .bearer_token
                .as_ref()
                .map(|bt| bt.client_id.as_str())
                .unwrap_or_default();
            if client_id.is_empty() {
                Ok(())
            } else {
                Err(GqlError::new("Private auth access denied"))
            }
        }
        _ => Err(GqlError::new("Private auth access denied")),
    }
}

/// `@access(scope, kind)`: the general scope gate.
///
/// Internal callers and cookie sessions carry every scope. Legacy tokens
/// (wildcard-scoped by construction) may read but never write. Webhook
/// execution may read whatever the subscription's grants allow.
pub fn access(ctx: &Context, scope: &str, kind: AccessMode) -> Result<(), GqlError> {
    let authctx = quay_auth::for_context(ctx);
    match authctx.method {
        AuthMethod::Internal | AuthMethod::Cookie => return Ok(()),
        AuthMethod::OauthLegacy => {
            // Only legacy tokens with "*" scopes ever get this far.
            if kind == AccessMode::Ro {
                return Ok(());
            }
        }
        AuthMethod::Webhook => {
            if kind != AccessMode::Ro {
                return Err(GqlError::new(
                    "Access to read/write resolver denied for webhook",
                ));
            }
            if authctx.grants.has(scope, kind) {
                return Ok(());
            }
        }
        AuthMethod::Oauth2 => {
            if authctx.grants.has(scope, kind) {
                return Ok(());
            }
        }
        AuthMethod::AnonInternal => {
            panic!("unknown auth method for access check")
        }
    }

    Err(GqlError::new("Access denied for invalid auth method"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    use quay_auth::{AuthContext, BearerToken, Grants, TokenHash};

    const SERVICE: &str = "todo.example.org";

    fn ctx_with(auth: AuthContext) -> Context {
        quay_auth::context(&Context::new(), auth)
    }

    fn oauth2(grants: &str, client_id: &str) -> AuthContext {
        let mut auth = AuthContext::empty(AuthMethod::Oauth2);
        auth.username = "jdoe".to_string();
        auth.grants = Grants::decode(SERVICE, grants).unwrap();
        auth.token_hash = Some(TokenHash::of("token"));
        auth.bearer_token = Some(BearerToken {
            version: 0,
            expires: (Utc::now() + Duration::hours(1)).timestamp(),
            grants: grants.to_string(),
            client_id: client_id.to_string(),
            username: "jdoe".to_string(),
        });
        auth
    }

    fn webhook(grants: &str) -> AuthContext {
        let mut auth = oauth2(grants, "");
        auth.method = AuthMethod::Webhook;
        auth.grants.read_only = true;
        auth
    }

    #[test]
    fn internal_gates() {
        let internal_ctx = ctx_with(AuthContext::empty(AuthMethod::Internal));
        let anon_ctx = ctx_with(AuthContext::anonymous_internal());
        let oauth_ctx = ctx_with(oauth2("", ""));

        assert!(internal(&internal_ctx).is_ok());
        assert!(internal(&anon_ctx).is_err());
        assert!(internal(&oauth_ctx).is_err());

        assert!(anon_internal(&anon_ctx).is_ok());
        assert!(anon_internal(&internal_ctx).is_err());
        assert!(anon_internal(&oauth_ctx).is_err());
    }

    #[test]
    fn private_allows_first_party_only() {
        assert!(private(&ctx_with(AuthContext::empty(AuthMethod::Internal))).is_ok());
        assert!(private(&ctx_with(oauth2("", ""))).is_ok());
        assert!(private(&ctx_with(oauth2("", "third-party-client"))).is_err());
        assert!(private(&ctx_with(AuthContext::empty(AuthMethod::Cookie))).is_err());
        assert!(private(&ctx_with(webhook(""))).is_err());
    }

    #[test]
    fn access_allows_internal_and_cookie_unconditionally() {
        for method in [AuthMethod::Internal, AuthMethod::Cookie] {
            let ctx = ctx_with(AuthContext::empty(method));
            assert!(access(&ctx, "TRACKERS", AccessMode::Ro).is_ok());
            assert!(access(&ctx, "TRACKERS", AccessMode::Rw).is_ok());
        }
    }

    #[test]
    fn access_limits_legacy_tokens_to_reads() {
        let ctx = ctx_with(AuthContext::empty(AuthMethod::OauthLegacy));
        assert!(access(&ctx, "TRACKERS", AccessMode::Ro).is_ok());
        assert!(access(&ctx, "TRACKERS", AccessMode::Rw).is_err());
    }

    #[test]
    fn access_consults_oauth2_grants() {
        let ctx = ctx_with(oauth2("todo.example.org/TRACKERS:RW", ""));
        assert!(access(&ctx, "TRACKERS", AccessMode::Rw).is_ok());
        assert!(access(&ctx, "TRACKERS", AccessMode::Ro).is_ok());
        assert!(access(&ctx, "TICKETS", AccessMode::Ro).is_err());

        let ctx = ctx_with(oauth2("todo.example.org/TICKETS", ""));
        assert!(access(&ctx, "TICKETS", AccessMode::Ro).is_ok());
        assert!(access(&ctx, "TICKETS", AccessMode::Rw).is_err());
    }

    #[test]
    fn access_denies_webhook_writes_before_grants() {
        // Even an all-grants webhook context may never write.
        let ctx = ctx_with(webhook(""));
        assert!(access(&ctx, "TRACKERS", AccessMode::Ro).is_ok());
        assert!(access(&ctx, "TRACKERS", AccessMode::Rw).is_err());

        let ctx = ctx_with(webhook("todo.example.org/TRACKERS:RW"));
        assert!(access(&ctx, "TRACKERS", AccessMode::Ro).is_ok());
        assert!(access(&ctx, "TRACKERS", AccessMode::Rw).is_err());
        assert!(access(&ctx, "TICKETS", AccessMode::Ro).is_err());
    }

    #[test]
    #[should_panic(expected = "unknown auth method")]
    fn access_panics_on_anon_internal() {
        let ctx = ctx_with(AuthContext::anonymous_internal());
        let _ = access(&ctx, "TRACKERS", AccessMode::Ro);
    }
}
