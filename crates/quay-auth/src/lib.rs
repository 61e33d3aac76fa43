//! Request authentication and authorization for quay services.
//!
//! Every GraphQL request is resolved to an [`AuthContext`] before the
//! handler runs: the middleware classifies the credentials (session cookie,
//! OAuth 2.0 bearer token, legacy token, or intra-cluster envelope), loads
//! the user, and attaches the result to the request context. Webhook
//! delivery re-creates a reduced context with [`webhook_auth`].

mod grants;
mod lookup;
mod middleware;
mod models;
mod token;
mod wire;

pub use grants::{AccessMode, Grants, GrantsError};
pub use lookup::{fetch_meta_profile, META_SERVICE};
pub use middleware::{middleware, AuthState, LOGIN_COOKIE};
pub use models::{webhook_auth, AuthContext, AuthMethod, InternalAuth, TokenHash, UserType};
pub use token::{BearerToken, TOKEN_VERSION};

use thiserror::Error;

use quay_core::Context;
use quay_db::DbError;

/// Authentication failures.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Authenticating for unknown user {0}")]
    UnknownUser(String),

    #[error("Authenticating for unknown client ID {0}")]
    UnknownClient(String),

    #[error("Account suspended with the following notice: {0}\nContact support")]
    Suspended(String),

    #[error(transparent)]
    InvalidGrants(#[from] GrantsError),

    #[error("The authentication token used to create this webhook has expired")]
    WebhookExpired,

    #[error("account service error: {0}")]
    MetaService(String),

    #[error(transparent)]
    Database(#[from] DbError),
}

impl AuthError {
    /// True for infrastructure failures that warrant a 500 and a retry, as
    /// opposed to definitive credential rejections.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, AuthError::Database(_) | AuthError::MetaService(_))
    }
}

/// Attach an authentication context to a request context. The result is
/// immutable; webhook delivery derives a fresh one instead of mutating.
#[must_use]
pub fn context(ctx: &Context, auth: AuthContext) -> Context {
    ctx.with(auth)
}

/// Returns the authentication context for this request.
#[must_use]
pub fn for_context(ctx: &Context) -> &AuthContext {
    ctx.expect::<AuthContext>("authentication context")
}
