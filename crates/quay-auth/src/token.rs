//! The self-issued bearer token: a MAC-authenticated binary payload carrying
//! its own expiry, grants, subject, and optional OAuth client identity.

use base64::engine::general_purpose::STANDARD_NO_PAD as BASE64_NOPAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};

use quay_crypto::Keys;

use crate::wire;

/// The only accepted token version. Bumped when the payload layout changes.
pub const TOKEN_VERSION: u64 = 0;

/// The decoded form of an OAuth 2.0 bearer token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BearerToken {
    pub version: u64,
    /// Expiry as UNIX seconds, UTC.
    pub expires: i64,
    /// The encoded grant string. Empty means every permission the user has.
    pub grants: String,
    /// Empty for personal tokens; the OAuth client UUID for third-party
    /// tokens.
    pub client_id: String,
    pub username: String,
}

impl BearerToken {
    /// The token's expiry as a timestamp.
    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.expires, 0).single().unwrap_or_else(Utc::now)
    }

    /// Encode and authenticate the token for the wire.
    #[must_use]
    pub fn encode(&self, keys: &Keys) -> String {
        let payload = self.marshal();
        let mac = keys.mac(&payload);
        let mut buf = payload;
        buf.extend_from_slice(&mac);
        BASE64_NOPAD.encode(buf)
    }

    /// Marshal the payload without the trailing MAC.
    #[must_use]
    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            16 + self.grants.len() + self.client_id.len() + self.username.len(),
        );
        wire::put_uvarint(&mut buf, self.version);
        wire::put_i64(&mut buf, self.expires);
        wire::put_string(&mut buf, &self.grants);
        wire::put_string(&mut buf, &self.client_id);
        wire::put_string(&mut buf, &self.username);
        buf
    }

    /// Decode and verify a bearer token.
    ///
    /// Returns `None` for anything other than a well-formed, authenticated,
    /// current-version, unexpired token. The failure modes are deliberately
    /// indistinguishable.
    #[must_use]
    pub fn decode(keys: &Keys, token: &str) -> Option<Self> {
        let payload = match BASE64_NOPAD.decode(token) {
            Ok(p) => p,
            Err(err) => {
                tracing::debug!(target: "auth", error = %err, "invalid bearer token: bad base64");
                return None;
            }
        };
        if payload.len() <= 32 {
            tracing::debug!(target: "auth", "invalid bearer token: payload too short");
            return None;
        }

        let (payload, mac) = payload.split_at(payload.len() - 32);
        if !keys.mac_verify(payload, mac) {
            tracing::debug!(target: "auth", "invalid bearer token: MAC verification failed");
            return None;
        }

        let mut reader = wire::Reader::new(payload);
        let token = BearerToken {
            version: reader.uvarint()?,
            expires: reader.i64()?,
            grants: reader.string()?,
            client_id: reader.string()?,
            username: reader.string()?,
        };
        if !reader.is_empty() {
            tracing::debug!(target: "auth", "invalid bearer token: trailing bytes");
            return None;
        }
        if token.version != TOKEN_VERSION {
            tracing::debug!(target: "auth", version = token.version, "invalid bearer token: bad version");
            return None;
        }
        if Utc::now().timestamp() > token.expires {
            tracing::debug!(target: "auth", "invalid bearer token: expired");
            return None;
        }
        Some(token)
    }
}
