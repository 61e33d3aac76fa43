use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};

use quay_core::Context;

use crate::grants::Grants;
use crate::token::BearerToken;
use crate::AuthError;

/// How a request was authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// The unified login session cookie.
    Cookie,
    /// A legacy (pre-OAuth 2.0) personal access token.
    OauthLegacy,
    /// A self-issued OAuth 2.0 bearer token.
    Oauth2,
    /// An encrypted intra-cluster envelope naming a user.
    Internal,
    /// An encrypted intra-cluster envelope with no user (registration only).
    AnonInternal,
    /// Webhook query execution on behalf of the subscription's creator.
    Webhook,
}

impl AuthMethod {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            AuthMethod::Cookie => "COOKIE",
            AuthMethod::OauthLegacy => "OAUTH_LEGACY",
            AuthMethod::Oauth2 => "OAUTH2",
            AuthMethod::Internal => "INTERNAL",
            AuthMethod::AnonInternal => "ANON_INTERNAL",
            AuthMethod::Webhook => "WEBHOOK",
        }
    }
}

impl std::fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Account standing, as stored in the user table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserType {
    Unconfirmed,
    ActiveNonPaying,
    ActiveFree,
    ActivePaying,
    ActiveDelinquent,
    Admin,
    Suspended,
    Unknown,
}

impl UserType {
    /// Parse the database representation. Unrecognized values map to
    /// [`UserType::Unknown`].
    #[must_use]
    pub fn from_db(s: &str) -> Self {
        match s {
            "unconfirmed" => UserType::Unconfirmed,
            "active_non_paying" => UserType::ActiveNonPaying,
            "active_free" => UserType::ActiveFree,
            "active_paying" => UserType::ActivePaying,
            "active_delinquent" => UserType::ActiveDelinquent,
            "admin" => UserType::Admin,
            "suspended" => UserType::Suspended,
            _ => UserType::Unknown,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            UserType::Unconfirmed => "unconfirmed",
            UserType::ActiveNonPaying => "active_non_paying",
            UserType::ActiveFree => "active_free",
            UserType::ActivePaying => "active_paying",
            UserType::ActiveDelinquent => "active_delinquent",
            UserType::Admin => "admin",
            UserType::Suspended => "suspended",
            UserType::Unknown => "unknown",
        }
    }
}

/// The SHA-512 hash of a raw token string. Stored (hex-encoded) with
/// webhook subscriptions and checked against the revocation registry.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TokenHash(pub [u8; 64]);

impl TokenHash {
    /// Hash a raw token string.
    #[must_use]
    pub fn of(token: &str) -> Self {
        Self(Sha512::digest(token.as_bytes()).into())
    }

    /// The hex encoding used in the database and on the wire.
    #[must_use]
    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse the hex encoding.
    #[must_use]
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let bytes: [u8; 64] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }
}

impl std::fmt::Debug for TokenHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TokenHash({})", self.hex())
    }
}

/// The decrypted contents of an `Authorization: Internal` envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InternalAuth {
    /// The username the calling service acts on behalf of.
    pub name: String,

    /// An arbitrary identifier for the calling service, e.g. "git.example.org".
    pub client_id: String,

    /// An arbitrary identifier for the calling node, e.g. "us-east-3".
    pub node_id: String,

    /// Set by specific account-service routes to act as an OAuth client's
    /// owner.
    #[serde(
        default,
        rename = "oauth_client_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub oauth_client_uuid: Option<String>,
}

/// The uniform representation of "who made this request", attached to the
/// request context by the auth middleware and immutable afterwards.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub method: AuthMethod,

    // Filled out for non-anonymous authentication.
    pub user_id: i32,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub username: String,
    pub email: String,
    pub user_type: UserType,
    pub url: Option<String>,
    pub location: Option<String>,
    pub bio: Option<String>,
    pub suspension_notice: Option<String>,

    /// Only populated on the account service.
    pub pgp_key: Option<String>,

    /// Only set for [`AuthMethod::Internal`] and [`AuthMethod::AnonInternal`].
    pub internal: Option<InternalAuth>,

    // Only set for AuthMethod::Oauth2 and AuthMethod::Webhook.
    pub bearer_token: Option<BearerToken>,
    pub grants: Grants,
    pub token_hash: Option<TokenHash>,
}

impl AuthContext {
    /// An empty context for the given method, with no user attached.
    #[must_use]
    pub fn empty(method: AuthMethod) -> Self {
        Self {
            method,
            user_id: 0,
            created: DateTime::UNIX_EPOCH,
            updated: DateTime::UNIX_EPOCH,
            username: String::new(),
            email: String::new(),
            user_type: UserType::Unknown,
            url: None,
            location: None,
            bio: None,
            suspension_notice: None,
            pgp_key: None,
            internal: None,
            bearer_token: None,
            grants: Grants::default(),
            token_hash: None,
        }
    }

    /// The context used for account registration: an internal caller with
    /// no user.
    #[must_use]
    pub fn anonymous_internal() -> Self {
        Self::empty(AuthMethod::AnonInternal)
    }
}

/// Build the authentication context under which a webhook's stored query
/// executes: the subscription creator's identity with the subscription's
/// token hash, grants, and client ID, forced read-only.
///
/// This configuration is not reachable from a normal GraphQL request.
/// Returns an error when the token that created the subscription has
/// expired; such deliveries are abandoned.
pub fn webhook_auth(
    ctx: &Context,
    user: &AuthContext,
    token_hash: TokenHash,
    grants: &str,
    client_id: Option<&str>,
    expires: DateTime<Utc>,
) -> Result<AuthContext, AuthError> {
    if Utc::now() >= expires {
        return Err(AuthError::WebhookExpired);
    }

    let mut grants = Grants::decode(quay_config::service_name(ctx), grants)?;
    grants.read_only = true;

    let mut auth = user.clone();
    auth.method = AuthMethod::Webhook;
    auth.token_hash = Some(token_hash);
    auth.grants = grants;
    auth.bearer_token = Some(BearerToken {
        client_id: client_id.unwrap_or_default().to_string(),
        ..BearerToken::default()
    });
    Ok(auth)
}
