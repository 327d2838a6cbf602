//! Non-exportable signing keys behind opaque aliases.
//!
//! The pool manager only ever sees a [`KeyInfo`] (alias + public key); private
//! material stays behind the [`SecureArea`] implementation. Platform builds
//! bind this trait to the device keystore; [`SoftwareSecureArea`] serves tests
//! and development.

use std::collections::HashMap;
use std::sync::Mutex;

use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use p256::elliptic_curve::JwkEcKey;
use rand::rngs::OsRng;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecureAreaError {
    #[error("no key under alias {0}")]
    UnknownAlias(String),
    #[error("key creation failed: {0}")]
    KeyCreation(String),
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("secure area lock poisoned")]
    Poisoned,
}

/// Handle to a key held by a secure area.
#[derive(Debug, Clone)]
pub struct KeyInfo {
    /// Opaque local handle; never leaves the device.
    pub alias: String,
    pub public_key: p256::PublicKey,
}

impl KeyInfo {
    /// The public key as a JWK, the form `certifyKeys` submits.
    #[must_use]
    pub fn public_key_jwk(&self) -> JwkEcKey {
        self.public_key.to_jwk()
    }
}

/// A store of non-exportable P-256 signing keys.
pub trait SecureArea: Send + Sync {
    /// Creates a fresh key pair and returns its handle.
    ///
    /// # Errors
    ///
    /// Returns an error if key generation fails.
    fn create_key(&self) -> Result<KeyInfo, SecureAreaError>;

    /// Looks up the handle for `alias`.
    ///
    /// # Errors
    ///
    /// Returns [`SecureAreaError::UnknownAlias`] if no key exists.
    fn get_key_info(&self, alias: &str) -> Result<KeyInfo, SecureAreaError>;

    /// Signs `message` with the key under `alias`; returns a DER ECDSA
    /// signature. This is the hand-off point for mdoc reader authentication.
    ///
    /// # Errors
    ///
    /// Returns an error if the alias is unknown or signing fails.
    fn sign(&self, alias: &str, message: &[u8]) -> Result<Vec<u8>, SecureAreaError>;

    /// Deletes the key under `alias`. Returns whether a key existed; deleting
    /// an absent alias is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error only on store failure.
    fn delete_key(&self, alias: &str) -> Result<bool, SecureAreaError>;

    /// Lists all aliases currently in the store, for orphan collection.
    ///
    /// # Errors
    ///
    /// Returns an error only on store failure.
    fn aliases(&self) -> Result<Vec<String>, SecureAreaError>;
}

/// In-process software key store.
///
/// Private keys live in process memory and are never returned by the API.
pub struct SoftwareSecureArea {
    keys: Mutex<HashMap<String, SigningKey>>,
}

impl SoftwareSecureArea {
    #[must_use]
    pub fn new() -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for SoftwareSecureArea {
    fn default() -> Self {
        Self::new()
    }
}

impl SecureArea for SoftwareSecureArea {
    fn create_key(&self) -> Result<KeyInfo, SecureAreaError> {
        let signing_key = SigningKey::random(&mut OsRng);
        let public_key = p256::PublicKey::from(*signing_key.verifying_key());
        let alias = crate::storage::random_key();
        let mut keys = self.keys.lock().map_err(|_| SecureAreaError::Poisoned)?;
        keys.insert(alias.clone(), signing_key);
        Ok(KeyInfo { alias, public_key })
    }

    fn get_key_info(&self, alias: &str) -> Result<KeyInfo, SecureAreaError> {
        let keys = self.keys.lock().map_err(|_| SecureAreaError::Poisoned)?;
        let signing_key = keys
            .get(alias)
            .ok_or_else(|| SecureAreaError::UnknownAlias(alias.to_string()))?;
        Ok(KeyInfo {
            alias: alias.to_string(),
            public_key: p256::PublicKey::from(*signing_key.verifying_key()),
        })
    }

    fn sign(&self, alias: &str, message: &[u8]) -> Result<Vec<u8>, SecureAreaError> {
        let keys = self.keys.lock().map_err(|_| SecureAreaError::Poisoned)?;
        let signing_key = keys
            .get(alias)
            .ok_or_else(|| SecureAreaError::UnknownAlias(alias.to_string()))?;
        let signature: Signature = signing_key.sign(message);
        Ok(signature.to_der().as_bytes().to_vec())
    }

    fn delete_key(&self, alias: &str) -> Result<bool, SecureAreaError> {
        let mut keys = self.keys.lock().map_err(|_| SecureAreaError::Poisoned)?;
        Ok(keys.remove(alias).is_some())
    }

    fn aliases(&self) -> Result<Vec<String>, SecureAreaError> {
        let keys = self.keys.lock().map_err(|_| SecureAreaError::Poisoned)?;
        Ok(keys.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::signature::Verifier;
    use p256::ecdsa::VerifyingKey;

    #[test]
    fn test_create_sign_verify_delete() {
        let area = SoftwareSecureArea::new();
        let key_info = area.create_key().expect("create");
        let message = b"mdoc reader auth payload";
        let der = area.sign(&key_info.alias, message).expect("sign");

        let verifying_key = VerifyingKey::from(key_info.public_key);
        let signature = Signature::from_der(&der).expect("parse signature");
        verifying_key.verify(message, &signature).expect("verify");

        assert!(area.delete_key(&key_info.alias).expect("delete"));
        assert!(!area.delete_key(&key_info.alias).expect("repeat delete"));
        assert!(matches!(
            area.sign(&key_info.alias, message),
            Err(SecureAreaError::UnknownAlias(_))
        ));
    }

    #[test]
    fn test_aliases_tracks_live_keys() {
        let area = SoftwareSecureArea::new();
        let first = area.create_key().expect("create");
        let second = area.create_key().expect("create");
        let mut aliases = area.aliases().expect("aliases");
        aliases.sort();
        let mut expected = vec![first.alias.clone(), second.alias.clone()];
        expected.sort();
        assert_eq!(aliases, expected);

        area.delete_key(&first.alias).expect("delete");
        assert_eq!(area.aliases().expect("aliases"), vec![second.alias]);
    }

    #[test]
    fn test_jwk_roundtrip_preserves_key() {
        let area = SoftwareSecureArea::new();
        let key_info = area.create_key().expect("create");
        let jwk = key_info.public_key_jwk();
        let recovered = p256::PublicKey::from_jwk(&jwk).expect("from jwk");
        assert_eq!(recovered, key_info.public_key);
    }
}
