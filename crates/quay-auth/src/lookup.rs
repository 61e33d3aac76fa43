//! User lookup and the cross-service queries behind authentication.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use quay_client::GraphQlQuery;
use quay_core::Context;
use quay_db::{with_tx, TxOptions};

use crate::models::{AuthContext, AuthMethod, TokenHash, UserType};
use crate::AuthError;

/// The service that owns user accounts and OAuth clients. Every other
/// service in the fleet fetches profiles and revocation state from it.
pub const META_SERVICE: &str = "meta.sr.ht";

const USER_COLUMNS: &str = "u.id, u.username, u.created, u.updated, u.email, u.user_type, \
     u.url, u.location, u.bio, u.suspension_notice";

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    id: i32,
    username: String,
    created: NaiveDateTime,
    updated: NaiveDateTime,
    email: String,
    user_type: String,
    url: Option<String>,
    location: Option<String>,
    bio: Option<String>,
    suspension_notice: Option<String>,
    #[sqlx(default)]
    pgp_key: Option<String>,
}

impl UserRow {
    fn into_auth(self, method: AuthMethod) -> AuthContext {
        let mut auth = AuthContext::empty(method);
        auth.user_id = self.id;
        auth.username = self.username;
        auth.created = DateTime::from_naive_utc_and_offset(self.created, Utc);
        auth.updated = DateTime::from_naive_utc_and_offset(self.updated, Utc);
        auth.email = self.email;
        auth.user_type = UserType::from_db(&self.user_type);
        auth.url = self.url;
        auth.location = self.location;
        auth.bio = self.bio;
        auth.suspension_notice = self.suspension_notice;
        auth.pgp_key = self.pgp_key;
        auth
    }
}

fn single_user(mut rows: Vec<UserRow>, method: AuthMethod) -> Option<AuthContext> {
    match rows.len() {
        0 => None,
        1 => Some(rows.remove(0).into_auth(method)),
        _ => panic!("multiple matching user accounts; invariant broken"),
    }
}

/// Load the user named by a cookie or internal envelope. Unknown and
/// suspended users fail the authentication.
pub(crate) async fn auth_for_username(
    ctx: &Context,
    username: &str,
) -> Result<AuthContext, AuthError> {
    let sql = format!(r#"SELECT {USER_COLUMNS} FROM "user" u WHERE u.username = $1"#);
    let username_owned = username.to_string();
    let rows = with_tx(ctx, TxOptions::read_only(), move |tx| {
        Box::pin(async move {
            let rows: Vec<UserRow> = sqlx::query_as(&sql)
                .bind(&username_owned)
                .fetch_all(&mut *tx)
                .await?;
            Ok(rows)
        })
    })
    .await?;

    let auth = single_user(rows, AuthMethod::Internal)
        .ok_or_else(|| AuthError::UnknownUser(username.to_string()))?;
    reject_suspended(auth)
}

/// Load the user owning the given OAuth client. Only meaningful on the
/// account service, which owns the client table.
pub(crate) async fn auth_for_oauth_client(
    ctx: &Context,
    client_uuid: &str,
) -> Result<AuthContext, AuthError> {
    let sql = format!(
        r#"SELECT {USER_COLUMNS} FROM "oauth2_client" client
           JOIN "user" u ON u.id = client.owner_id
           WHERE client.client_uuid = $1 AND client.revoked = false"#
    );
    let client_owned = client_uuid.to_string();
    let rows = with_tx(ctx, TxOptions::read_only(), move |tx| {
        Box::pin(async move {
            let rows: Vec<UserRow> = sqlx::query_as(&sql)
                .bind(&client_owned)
                .fetch_all(&mut *tx)
                .await?;
            Ok(rows)
        })
    })
    .await?;

    let auth = single_user(rows, AuthMethod::Internal)
        .ok_or_else(|| AuthError::UnknownClient(client_uuid.to_string()))?;
    reject_suspended(auth)
}

fn reject_suspended(auth: AuthContext) -> Result<AuthContext, AuthError> {
    if auth.user_type == UserType::Suspended {
        return Err(AuthError::Suspended(
            auth.suspension_notice.unwrap_or_default(),
        ));
    }
    Ok(auth)
}

/// Load the user behind an OAuth 2.0 bearer token.
///
/// When the user is not locally known and this is not the account service,
/// the profile is fetched from the account service and upserted into the
/// local user table. Suspension is checked by the caller after both halves
/// of the verification complete.
pub(crate) async fn lookup_user(ctx: &Context, username: &str) -> Result<AuthContext, AuthError> {
    let on_meta = quay_config::service_name(ctx) == META_SERVICE;
    let sql = if on_meta {
        format!(
            r#"SELECT {USER_COLUMNS}, p.key AS pgp_key FROM "user" u
               LEFT JOIN pgpkey p ON p.id = u.pgp_key_id
               WHERE u.username = $1"#
        )
    } else {
        format!(r#"SELECT {USER_COLUMNS} FROM "user" u WHERE u.username = $1"#)
    };

    let username_owned = username.to_string();
    let rows = with_tx(ctx, TxOptions::read_only(), move |tx| {
        Box::pin(async move {
            let rows: Vec<UserRow> = sqlx::query_as(&sql)
                .bind(&username_owned)
                .fetch_all(&mut *tx)
                .await?;
            Ok(rows)
        })
    })
    .await?;

    match single_user(rows, AuthMethod::Oauth2) {
        Some(auth) => Ok(auth),
        None if on_meta => Err(AuthError::UnknownUser(username.to_string())),
        None => fetch_meta_profile(ctx, username).await,
    }
}

#[derive(Debug, Deserialize)]
struct ProfileResponse {
    data: ProfileData,
}

#[derive(Debug, Deserialize)]
struct ProfileData {
    me: Profile,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Profile {
    username: String,
    email: String,
    url: Option<String>,
    location: Option<String>,
    bio: Option<String>,
    user_type: String,
}

/// Fetch a user's profile from the account service and upsert it into the
/// local user table.
pub async fn fetch_meta_profile(ctx: &Context, username: &str) -> Result<AuthContext, AuthError> {
    assert!(
        quay_config::service_name(ctx) != META_SERVICE,
        "cannot fetch profile from ourselves"
    );

    let query = GraphQlQuery::new(
        r"
        query {
            me {
                id
                username
                email
                url
                location
                bio
                userType
            }
        }",
    );
    let result: ProfileResponse = quay_client::execute(ctx, username, META_SERVICE, query)
        .await
        .map_err(|e| AuthError::MetaService(e.to_string()))?;

    let profile = result.data.me;
    let user_type = profile.user_type.to_lowercase();
    let rows = with_tx(ctx, TxOptions::default(), move |tx| {
        Box::pin(async move {
            let rows: Vec<UserRow> = sqlx::query_as(
                r#"INSERT INTO "user" (
                    created, updated, username, email, user_type,
                    url, location, bio, suspension_notice
                )
                VALUES (
                    NOW() at time zone 'utc', NOW() at time zone 'utc',
                    $1, $2, $3, $4, $5, $6, $7
                )
                ON CONFLICT DO NOTHING
                RETURNING
                    id, username, created, updated, email, user_type,
                    url, location, bio, suspension_notice"#,
            )
            .bind(&profile.username)
            .bind(&profile.email)
            .bind(&user_type)
            .bind(&profile.url)
            .bind(&profile.location)
            .bind(&profile.bio)
            .bind(None::<String>)
            .fetch_all(&mut *tx)
            .await?;
            Ok(rows)
        })
    })
    .await?;

    match single_user(rows, AuthMethod::Oauth2) {
        Some(auth) => Ok(auth),
        None => panic!("failed to upsert user record from {META_SERVICE}"),
    }
}

#[derive(Debug, Deserialize)]
struct RevocationResponse {
    data: RevocationData,
}

#[derive(Debug, Deserialize)]
struct RevocationData {
    #[serde(rename = "tokenRevocationStatus")]
    revocation_status: bool,
}

/// Ask the account service whether this token or client has been revoked.
/// Errors are reported as revoked alongside the error so that a failing
/// registry never admits a token.
pub(crate) async fn lookup_token_revocation(
    ctx: &Context,
    username: &str,
    hash: &TokenHash,
    client_id: &str,
) -> Result<bool, AuthError> {
    let query = GraphQlQuery::new(
        r"
        query RevocationStatus($hash: String!, $clientId: String) {
            tokenRevocationStatus(hash: $hash, clientId: $clientId)
        }",
    )
    .variable("hash", Value::String(hash.hex()))
    .variable("clientId", Value::String(client_id.to_string()));

    let result: RevocationResponse = quay_client::execute(ctx, username, META_SERVICE, query)
        .await
        .map_err(|e| AuthError::MetaService(e.to_string()))?;
    Ok(result.data.revocation_status)
}

#[derive(Debug, sqlx::FromRow)]
struct LegacyTokenRow {
    expires: NaiveDateTime,
    scopes: String,
    #[sqlx(flatten)]
    user: UserRow,
}

pub(crate) struct LegacyToken {
    pub expires: DateTime<Utc>,
    pub scopes: String,
    pub auth: AuthContext,
}

/// Look up a legacy OAuth token by the hex SHA-512 of its raw value.
pub(crate) async fn lookup_legacy_token(
    ctx: &Context,
    token_hash_hex: &str,
) -> Result<Option<LegacyToken>, AuthError> {
    let sql = format!(
        r#"SELECT ot.expires, ot.scopes, {USER_COLUMNS} FROM oauthtoken ot
           JOIN "user" u ON u.id = ot.user_id
           WHERE ot.token_hash = $1"#
    );
    let hash_owned = token_hash_hex.to_string();
    let mut rows = with_tx(ctx, TxOptions::read_only(), move |tx| {
        Box::pin(async move {
            let rows: Vec<LegacyTokenRow> = sqlx::query_as(&sql)
                .bind(&hash_owned)
                .fetch_all(&mut *tx)
                .await?;
            Ok(rows)
        })
    })
    .await?;

    match rows.len() {
        0 => Ok(None),
        1 => {
            let row = rows.remove(0);
            Ok(Some(LegacyToken {
                expires: DateTime::from_naive_utc_and_offset(row.expires, Utc),
                scopes: row.scopes,
                auth: row.user.into_auth(AuthMethod::OauthLegacy),
            }))
        }
        _ => panic!("multiple matching OAuth tokens; invariant broken"),
    }
}
