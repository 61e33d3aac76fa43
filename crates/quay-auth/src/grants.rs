//! The grants algebra: deciding what a token may touch.
//!
//! A grant string is a space-separated list of `service/scope[:mode]`
//! entries. Only grants addressed to the current service are retained; an
//! empty grant string means "everything the user can do".

use std::collections::HashMap;

use thiserror::Error;

/// Access mode for a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Read-only access.
    Ro,
    /// Read/write access.
    Rw,
}

impl AccessMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            AccessMode::Ro => "RO",
            AccessMode::Rw => "RW",
        }
    }
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A malformed grant entry. Callers treat this as an invalid token.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("OAuth grant '{0}' without service/scope format")]
pub struct GrantsError(pub String);

/// The decoded access rights of one token, restricted to the current
/// service.
///
/// The scope map is immutable after construction; the webhook path derives
/// new `Grants` values rather than mutating shared state.
#[derive(Debug, Clone, Default)]
pub struct Grants {
    /// Overlay forcing read-only access regardless of the stored modes.
    /// Forced on for webhook query execution.
    pub read_only: bool,

    all: bool,
    grants: HashMap<String, String>,
    encoded: String,
}

impl Grants {
    /// Decode a grant string for `service`. Grants addressed to other
    /// services are dropped; a missing mode defaults to read-only; an empty
    /// string yields every permission.
    pub fn decode(service: &str, grants: &str) -> Result<Self, GrantsError> {
        if grants.is_empty() {
            return Ok(Self {
                read_only: false,
                all: true,
                grants: HashMap::new(),
                encoded: String::new(),
            });
        }

        let mut access = HashMap::new();
        for grant in grants.split(' ') {
            let (svc, rest) = grant
                .split_once('/')
                .ok_or_else(|| GrantsError(grant.to_string()))?;
            let (scope, mode) = match rest.split_once(':') {
                Some((scope, mode)) => (scope, mode),
                None => (rest, "RO"),
            };
            if svc == service {
                access.insert(scope.to_string(), mode.to_string());
            }
        }

        Ok(Self {
            read_only: false,
            all: false,
            grants: access,
            encoded: grants.to_string(),
        })
    }

    /// Grants carrying every permission (an empty grant string).
    #[must_use]
    pub fn all() -> Self {
        Self {
            read_only: false,
            all: true,
            grants: HashMap::new(),
            encoded: String::new(),
        }
    }

    /// True when this token carries every permission.
    #[must_use]
    pub fn is_all(&self) -> bool {
        self.all
    }

    /// Decide access for `(scope, mode)`.
    ///
    /// A stored read/write grant implies read access; the read-only overlay
    /// denies every write.
    #[must_use]
    pub fn has(&self, scope: &str, mode: AccessMode) -> bool {
        if self.read_only && mode == AccessMode::Rw {
            return false;
        }
        if self.all {
            return true;
        }
        match self.grants.get(scope) {
            None => false,
            Some(_) if mode == AccessMode::Ro => true,
            Some(stored) => stored == mode.as_str(),
        }
    }

    /// The raw grant string, preserved for forwarding to webhook
    /// subscriptions.
    #[must_use]
    pub fn encoded(&self) -> &str {
        &self.encoded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVICE: &str = "todo.example.org";

    #[test]
    fn empty_string_grants_everything() {
        let grants = Grants::decode(SERVICE, "").unwrap();
        assert!(grants.is_all());
        assert!(grants.has("TRACKERS", AccessMode::Ro));
        assert!(grants.has("TRACKERS", AccessMode::Rw));
        assert_eq!(grants.encoded(), "");
    }

    #[test]
    fn modes_are_enforced() {
        let grants = Grants::decode(
            SERVICE,
            "todo.example.org/TRACKERS:RW todo.example.org/TICKETS",
        )
        .unwrap();

        assert!(grants.has("TRACKERS", AccessMode::Rw));
        assert!(grants.has("TRACKERS", AccessMode::Ro));
        assert!(grants.has("TICKETS", AccessMode::Ro));
        assert!(!grants.has("TICKETS", AccessMode::Rw));
        assert!(!grants.has("PROFILE", AccessMode::Ro));
    }

    #[test]
    fn rw_implies_ro() {
        let grants = Grants::decode(SERVICE, "todo.example.org/TRACKERS:RW").unwrap();
        assert!(grants.has("TRACKERS", AccessMode::Ro));
    }

    #[test]
    fn read_only_overlay_denies_writes() {
        let mut grants = Grants::decode(SERVICE, "todo.example.org/TRACKERS:RW").unwrap();
        grants.read_only = true;
        assert!(!grants.has("TRACKERS", AccessMode::Rw));
        assert!(grants.has("TRACKERS", AccessMode::Ro));

        let mut all = Grants::decode(SERVICE, "").unwrap();
        all.read_only = true;
        assert!(!all.has("ANYTHING", AccessMode::Rw));
        assert!(all.has("ANYTHING", AccessMode::Ro));
    }

    #[test]
    fn foreign_service_grants_are_dropped() {
        let grants =
            Grants::decode(SERVICE, "lists.example.org/LISTS:RW todo.example.org/TICKETS:RW")
                .unwrap();
        assert!(!grants.has("LISTS", AccessMode::Ro));
        assert!(grants.has("TICKETS", AccessMode::Rw));
    }

    #[test]
    fn encoded_string_is_preserved() {
        let raw = "lists.example.org/LISTS:RW todo.example.org/TICKETS";
        let grants = Grants::decode(SERVICE, raw).unwrap();
        assert_eq!(grants.encoded(), raw);
    }

    #[test]
    fn malformed_grant_is_an_error() {
        let err = Grants::decode(SERVICE, "no-slash-here").unwrap_err();
        assert_eq!(err, GrantsError("no-slash-here".to_string()));

        assert!(Grants::decode(SERVICE, "a/b nope").is_err());
    }

    #[test]
    fn default_grants_deny_everything() {
        let grants = Grants::default();
        assert!(!grants.has("TRACKERS", AccessMode::Ro));
    }
}
