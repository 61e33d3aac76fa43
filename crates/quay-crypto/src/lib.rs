//! Cryptographic primitives shared by the quay service fleet.
//!
//! Three keys are loaded once at startup from the configuration:
//!
//! - `[webhooks] private-key`: an Ed25519 seed used to sign outbound
//!   webhook payloads.
//! - `[sr.ht] network-key`: a Fernet key used for intra-cluster envelopes
//!   and login cookies.
//! - a MAC key derived from the Ed25519 seed, used to authenticate
//!   self-issued bearer tokens.
//!
//! The derivation of the MAC key is a stable contract shared with the other
//! services in the fleet and must not change.

mod keys;

pub use keys::{CryptoError, Keys};

use quay_core::Context;

/// Returns the key set for this context.
#[must_use]
pub fn for_context(ctx: &Context) -> &Keys {
    ctx.expect::<Keys>("crypto keys")
}
