use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use fernet::Fernet;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use quay_config::Config;

type HmacSha256 = Hmac<Sha256>;

/// The fixed info string for deriving the bearer-token MAC key from the
/// webhook signing seed. Changing this breaks every issued token.
const MAC_KEY_INFO: &[u8] = b"sr.ht HMAC key";

/// Errors raised while loading the key material.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("no webhook key configured")]
    MissingWebhookKey,

    #[error("base64 decode webhooks private key: {0}")]
    InvalidWebhookKey(String),

    #[error("no network key configured")]
    MissingNetworkKey,

    #[error("invalid Fernet network encryption key")]
    InvalidNetworkKey,
}

/// The process-wide key set. Constructed once at startup and shared
/// read-only through the request context.
pub struct Keys {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    fernet: Fernet,
    mac_key: [u8; 32],
}

impl Keys {
    /// Load the key set from `[webhooks] private-key` and
    /// `[sr.ht] network-key`.
    pub fn from_config(config: &Config) -> Result<Self, CryptoError> {
        let b64seed = config
            .get("webhooks", "private-key")
            .ok_or(CryptoError::MissingWebhookKey)?;
        let network_key = config
            .get("sr.ht", "network-key")
            .ok_or(CryptoError::MissingNetworkKey)?;
        Self::from_keys(b64seed, network_key)
    }

    /// Construct the key set from raw key strings.
    pub fn from_keys(b64seed: &str, network_key: &str) -> Result<Self, CryptoError> {
        let seed = BASE64
            .decode(b64seed)
            .map_err(|e| CryptoError::InvalidWebhookKey(e.to_string()))?;
        let seed: [u8; 32] = seed
            .try_into()
            .map_err(|_| CryptoError::InvalidWebhookKey("seed must be 32 bytes".into()))?;

        let signing_key = SigningKey::from_bytes(&seed);
        let verifying_key = signing_key.verifying_key();

        let fernet = Fernet::new(network_key).ok_or(CryptoError::InvalidNetworkKey)?;

        let mut mac = <HmacSha256 as Mac>::new_from_slice(&seed)
            .expect("HMAC can take key of any size");
        mac.update(MAC_KEY_INFO);
        let mac_key: [u8; 32] = mac.finalize().into_bytes().into();

        Ok(Self {
            signing_key,
            verifying_key,
            fernet,
            mac_key,
        })
    }

    /// Sign `payload` with the webhook key. Returns the 64-byte signature.
    #[must_use]
    pub fn sign(&self, payload: &[u8]) -> [u8; 64] {
        self.signing_key.sign(payload).to_bytes()
    }

    /// Verify an Ed25519 signature over `payload`.
    #[must_use]
    pub fn verify(&self, payload: &[u8], signature: &[u8]) -> bool {
        let Ok(sig) = Signature::from_slice(signature) else {
            return false;
        };
        self.verifying_key.verify(payload, &sig).is_ok()
    }

    /// Encrypt `payload` into a Fernet token for another service in the
    /// fleet (or a login cookie).
    #[must_use]
    pub fn encrypt(&self, payload: &[u8]) -> String {
        self.fernet.encrypt(payload)
    }

    /// Decrypt a Fernet token, rejecting tokens older than `ttl_seconds`.
    ///
    /// Returns `None` for any invalid input. Tampering and expiry are
    /// deliberately indistinguishable to the caller.
    #[must_use]
    pub fn decrypt(&self, token: &str, ttl_seconds: u64) -> Option<Vec<u8>> {
        if ttl_seconds == 0 {
            return self.decrypt_without_expiration(token);
        }
        self.fernet.decrypt_with_ttl(token, ttl_seconds).ok()
    }

    /// Decrypt a Fernet token without a freshness check.
    #[must_use]
    pub fn decrypt_without_expiration(&self, token: &str) -> Option<Vec<u8>> {
        self.fernet.decrypt(token).ok()
    }

    /// Authenticate `payload` with the derived bearer MAC key.
    #[must_use]
    pub fn mac(&self, payload: &[u8]) -> [u8; 32] {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.mac_key)
            .expect("HMAC can take key of any size");
        mac.update(payload);
        mac.finalize().into_bytes().into()
    }

    /// Verify a bearer MAC in constant time.
    #[must_use]
    pub fn mac_verify(&self, payload: &[u8], signature: &[u8]) -> bool {
        let expected = self.mac(payload);
        expected.as_slice().ct_eq(signature).into()
    }

    /// Sign a webhook payload. Returns `(nonce, signature)` where the nonce
    /// is 8 random bytes hex-encoded and the signature is the base64 Ed25519
    /// signature over the payload with the ASCII nonce appended.
    #[must_use]
    pub fn sign_webhook(&self, payload: &[u8]) -> (String, String) {
        let mut seed = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut seed);
        let nonce = hex::encode(seed);

        let mut signed = Vec::with_capacity(payload.len() + nonce.len());
        signed.extend_from_slice(payload);
        signed.extend_from_slice(nonce.as_bytes());

        let signature = BASE64.encode(self.sign(&signed));
        (nonce, signature)
    }

    /// Verify a webhook signature produced by [`Keys::sign_webhook`].
    #[must_use]
    pub fn verify_webhook(&self, payload: &[u8], nonce: &str, signature: &str) -> bool {
        let Ok(sig) = BASE64.decode(signature) else {
            return false;
        };
        let mut signed = Vec::with_capacity(payload.len() + nonce.len());
        signed.extend_from_slice(payload);
        signed.extend_from_slice(nonce.as_bytes());
        self.verify(&signed, &sig)
    }
}

impl std::fmt::Debug for Keys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        f.debug_struct("Keys").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WEBHOOK_KEY: &str = "ebzsjPaN6E13ln/FeNWly1C92q6bVMVdOnDo1HPl5fc=";
    const NETWORK_KEY: &str = "tbuG-7Vh44vrDq1L_HKWkHnWrDOtJhEkPKPiauaLeuk=";

    fn keys() -> Keys {
        Keys::from_keys(WEBHOOK_KEY, NETWORK_KEY).unwrap()
    }

    #[test]
    fn load_from_config() {
        let conf = Config::from_ini(
            "[webhooks]\nprivate-key=ebzsjPaN6E13ln/FeNWly1C92q6bVMVdOnDo1HPl5fc=\n\
             [sr.ht]\nnetwork-key=tbuG-7Vh44vrDq1L_HKWkHnWrDOtJhEkPKPiauaLeuk=\n",
        )
        .unwrap();
        assert!(Keys::from_config(&conf).is_ok());
    }

    #[test]
    fn rejects_bad_seed() {
        assert!(matches!(
            Keys::from_keys("not base64!", NETWORK_KEY),
            Err(CryptoError::InvalidWebhookKey(_))
        ));
        assert!(matches!(
            Keys::from_keys("c2hvcnQ=", NETWORK_KEY),
            Err(CryptoError::InvalidWebhookKey(_))
        ));
    }

    #[test]
    fn sign_and_verify() {
        let keys = keys();
        let payload = b"Hello world!";
        let signature = keys.sign(payload);

        assert!(keys.verify(payload, &signature));
        assert!(!keys.verify(b"Something else", &signature));
    }

    #[test]
    fn sign_webhook_round_trip() {
        let keys = keys();
        let payload = b"Hello world!";
        let (nonce, signature) = keys.sign_webhook(payload);

        assert_eq!(nonce.len(), 16);
        assert!(keys.verify_webhook(payload, &nonce, &signature));
        assert!(!keys.verify_webhook(b"Something else", &nonce, &signature));
        assert!(!keys.verify_webhook(payload, "0000000000000000", &signature));
    }

    #[test]
    fn encrypt_and_decrypt() {
        let keys = keys();
        let payload = b"Hello, world!";

        let token = keys.encrypt(payload);
        assert_ne!(token.as_bytes(), payload);

        let plain = keys.decrypt_without_expiration(&token).unwrap();
        assert_eq!(plain, payload);

        // A generous TTL accepts a fresh token; ttl = 0 disables the check.
        assert_eq!(keys.decrypt(&token, 1800).unwrap(), payload);
        assert_eq!(keys.decrypt(&token, 0).unwrap(), payload);
    }

    #[test]
    fn decrypt_rejects_garbage() {
        let keys = keys();
        assert!(keys.decrypt_without_expiration("not a token").is_none());
        assert!(keys.decrypt("not a token", 30).is_none());
    }

    #[test]
    fn decrypt_with_other_key_fails() {
        let keys = keys();
        let other = Keys::from_keys(WEBHOOK_KEY, &Fernet::generate_key()).unwrap();
        let token = keys.encrypt(b"secret");
        assert!(other.decrypt_without_expiration(&token).is_none());
    }

    #[test]
    fn mac_and_verify() {
        let keys = keys();
        let payload = b"Hello, world!";
        let mac = keys.mac(payload);

        assert!(keys.mac_verify(payload, &mac));
        assert!(!keys.mac_verify(b"Something else", &mac));
        assert!(!keys.mac_verify(payload, &mac[..16]));
    }

    #[test]
    fn mac_key_derivation_is_stable() {
        // Two key sets built from the same seed must agree, or every token
        // in the fleet is invalidated.
        let a = keys();
        let b = Keys::from_keys(WEBHOOK_KEY, NETWORK_KEY).unwrap();
        assert_eq!(a.mac(b"payload"), b.mac(b"payload"));
    }
}
