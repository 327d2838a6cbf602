//! Reader root identity: the CA that signs single-use reader certificates.
//!
//! Roots are generated on first use (EC P-384, five-year validity), persisted
//! in storage under a named slot, and loaded on demand. The backend may hold
//! two roots: the trusted one and a second root for devices that failed the
//! attestation policy, so their certifications stay distinguishable.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use der::asn1::UtcTime;
use der::{Decode, Encode};
use p384::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey};
use rand::rngs::OsRng;
use readerkit_core::protocol::b64;
use readerkit_core::storage::StorageTable;
use serde::{Deserialize, Serialize};
use x509_cert::builder::{Builder, CertificateBuilder, Profile};
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::SubjectPublicKeyInfoOwned;
use x509_cert::time::{Time, Validity};

use crate::error::BackendError;

/// Subject of every issued single-use reader certificate.
pub const READER_LEAF_SUBJECT: &str = "CN=Multipaz Identity Verifier Single-Use Key";

/// Subject of the reader root certificate.
pub const READER_ROOT_SUBJECT: &str = "CN=Multipaz Identity Verifier Reader Root";

/// Root certificate lifetime: five years.
pub const ROOT_VALIDITY_SECONDS: u64 = 5 * 365 * 24 * 3600;

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedRoot {
    /// PKCS#8 DER private key. Never leaves the server process.
    #[serde(with = "b64")]
    private_key: Vec<u8>,
    #[serde(with = "b64")]
    certificate: Vec<u8>,
}

/// A reader root: P-384 private key plus its self-signed certificate.
pub struct ReaderRootIdentity {
    secret_key: p384::SecretKey,
    certificate: Vec<u8>,
}

impl fmt::Debug for ReaderRootIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderRootIdentity")
            .field("secret_key", &"[REDACTED]")
            .field("certificate", &format!("{} bytes", self.certificate.len()))
            .finish()
    }
}

impl ReaderRootIdentity {
    /// Loads the root stored under `slot`, generating and persisting a fresh
    /// one on first use.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure or corrupt key material.
    pub fn load_or_generate(
        table: &dyn StorageTable,
        slot: &str,
        now: u64,
    ) -> Result<Self, BackendError> {
        if let Some(bytes) = table.get(slot, now)? {
            let persisted: PersistedRoot = serde_json::from_slice(&bytes)?;
            let secret_key = p384::SecretKey::from_pkcs8_der(&persisted.private_key)
                .map_err(|err| BackendError::Certificate(err.to_string()))?;
            return Ok(Self {
                secret_key,
                certificate: persisted.certificate,
            });
        }
        let identity = Self::generate(now)?;
        let persisted = PersistedRoot {
            private_key: identity
                .secret_key
                .to_pkcs8_der()
                .map_err(|err| BackendError::Certificate(err.to_string()))?
                .as_bytes()
                .to_vec(),
            certificate: identity.certificate.clone(),
        };
        table.insert(Some(slot), &serde_json::to_vec(&persisted)?, None)?;
        log::info!("generated reader root identity in slot {slot}");
        Ok(identity)
    }

    fn generate(now: u64) -> Result<Self, BackendError> {
        let secret_key = p384::SecretKey::random(&mut OsRng);
        let signer = p384::ecdsa::SigningKey::from(&secret_key);
        let subject = parse_name(READER_ROOT_SUBJECT)?;
        let spki = spki_from_key(&secret_key.public_key())?;
        let builder = CertificateBuilder::new(
            Profile::Root,
            random_serial()?,
            validity(now, now + ROOT_VALIDITY_SECONDS)?,
            subject,
            spki,
            &signer,
        )
        .map_err(|err| BackendError::Certificate(err.to_string()))?;
        let certificate = builder
            .build::<p384::ecdsa::DerSignature>()
            .map_err(|err| BackendError::Certificate(err.to_string()))?
            .to_der()
            .map_err(|err| BackendError::Certificate(err.to_string()))?;
        Ok(Self {
            secret_key,
            certificate,
        })
    }

    /// The root certificate, DER.
    #[must_use]
    pub fn certificate_der(&self) -> &[u8] {
        &self.certificate
    }

    /// Issues a single-use reader certificate for `subject_key` with the
    /// given validity window and a 128-bit random serial.
    ///
    /// # Errors
    ///
    /// Returns an error if certificate construction or signing fails.
    pub fn issue_reader_certificate(
        &self,
        subject_key: &p256::PublicKey,
        valid_from: u64,
        valid_until: u64,
    ) -> Result<Vec<u8>, BackendError> {
        let signer = p384::ecdsa::SigningKey::from(&self.secret_key);
        let profile = Profile::Leaf {
            issuer: parse_name(READER_ROOT_SUBJECT)?,
            enable_key_agreement: false,
            enable_key_encipherment: false,
        };
        let builder = CertificateBuilder::new(
            profile,
            random_serial()?,
            validity(valid_from, valid_until)?,
            parse_name(READER_LEAF_SUBJECT)?,
            spki_from_key(subject_key)?,
            &signer,
        )
        .map_err(|err| BackendError::Certificate(err.to_string()))?;
        builder
            .build::<p384::ecdsa::DerSignature>()
            .map_err(|err| BackendError::Certificate(err.to_string()))?
            .to_der()
            .map_err(|err| BackendError::Certificate(err.to_string()))
    }
}

fn parse_name(name: &str) -> Result<Name, BackendError> {
    Name::from_str(name).map_err(|err| BackendError::Certificate(err.to_string()))
}

fn spki_from_key(key: &impl EncodePublicKey) -> Result<SubjectPublicKeyInfoOwned, BackendError> {
    let der = key
        .to_public_key_der()
        .map_err(|err| BackendError::Certificate(err.to_string()))?;
    SubjectPublicKeyInfoOwned::from_der(der.as_bytes())
        .map_err(|err| BackendError::Certificate(err.to_string()))
}

fn validity(from: u64, until: u64) -> Result<Validity, BackendError> {
    Ok(Validity {
        not_before: unix_time(from)?,
        not_after: unix_time(until)?,
    })
}

fn unix_time(at: u64) -> Result<Time, BackendError> {
    UtcTime::from_unix_duration(Duration::from_secs(at))
        .map(Time::UtcTime)
        .map_err(|err| BackendError::Certificate(err.to_string()))
}

fn random_serial() -> Result<SerialNumber, BackendError> {
    let mut bytes = [0u8; 16];
    getrandom::getrandom(&mut bytes)
        .map_err(|err| BackendError::Internal(format!("rng failure: {err}")))?;
    // DER integers are signed; keep the top byte in [0x40, 0x7f] so the
    // serial stays positive without a leading-zero octet.
    bytes[0] = (bytes[0] & 0x3f) | 0x40;
    SerialNumber::new(&bytes).map_err(|err| BackendError::Certificate(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use p384::pkcs8::DecodePublicKey;
    use readerkit_core::storage::{SqliteStorage, Storage};
    use signature::Verifier;
    use x509_cert::Certificate;

    const NOW: u64 = 1_750_000_000;

    fn roots_table() -> (SqliteStorage, std::sync::Arc<dyn StorageTable>) {
        let storage = SqliteStorage::open_in_memory().expect("open storage");
        let table = storage.table("ReaderBackendRootIdentities").expect("table");
        (storage, table)
    }

    #[test]
    fn test_root_generated_once_and_reloaded() {
        let (_storage, table) = roots_table();
        let first =
            ReaderRootIdentity::load_or_generate(table.as_ref(), "reader_root_identity", NOW)
                .expect("generate root");
        let second =
            ReaderRootIdentity::load_or_generate(table.as_ref(), "reader_root_identity", NOW + 10)
                .expect("reload root");
        assert_eq!(first.certificate_der(), second.certificate_der());
    }

    #[test]
    fn test_root_validity_is_five_years() {
        let (_storage, table) = roots_table();
        let root = ReaderRootIdentity::load_or_generate(table.as_ref(), "slot", NOW)
            .expect("generate root");
        let cert = Certificate::from_der(root.certificate_der()).expect("parse root");
        let validity = cert.tbs_certificate.validity;
        assert_eq!(validity.not_before.to_unix_duration().as_secs(), NOW);
        assert_eq!(
            validity.not_after.to_unix_duration().as_secs(),
            NOW + ROOT_VALIDITY_SECONDS
        );
    }

    #[test]
    fn test_leaf_signed_by_root_with_expected_subject() {
        let (_storage, table) = roots_table();
        let root =
            ReaderRootIdentity::load_or_generate(table.as_ref(), "slot", NOW).expect("root");
        let subject_key = p256::SecretKey::random(&mut OsRng).public_key();
        let leaf_der = root
            .issue_reader_certificate(&subject_key, NOW - 100, NOW + 86_400)
            .expect("issue leaf");

        let leaf = Certificate::from_der(&leaf_der).expect("parse leaf");
        assert_eq!(
            leaf.tbs_certificate.subject.to_string(),
            "CN=Multipaz Identity Verifier Single-Use Key"
        );
        assert_eq!(
            leaf.tbs_certificate.issuer.to_string(),
            "CN=Multipaz Identity Verifier Reader Root"
        );
        let serial = leaf.tbs_certificate.serial_number.as_bytes();
        assert_eq!(serial.len(), 16);

        // Signature verifies under the root's P-384 key.
        let root_cert = Certificate::from_der(root.certificate_der()).expect("parse root");
        let spki_der = root_cert
            .tbs_certificate
            .subject_public_key_info
            .to_der()
            .expect("spki der");
        let root_key = p384::PublicKey::from_public_key_der(&spki_der).expect("root key");
        let verifying_key = p384::ecdsa::VerifyingKey::from(root_key);
        let signature = ecdsa::Signature::<p384::NistP384>::from_der(
            leaf.signature.raw_bytes(),
        )
        .expect("parse signature");
        let message = leaf.tbs_certificate.to_der().expect("tbs der");
        verifying_key.verify(&message, &signature).expect("leaf signed by root");
    }

    #[test]
    fn test_serials_are_random() {
        let (_storage, table) = roots_table();
        let root =
            ReaderRootIdentity::load_or_generate(table.as_ref(), "slot", NOW).expect("root");
        let subject_key = p256::SecretKey::random(&mut OsRng).public_key();
        let first = root
            .issue_reader_certificate(&subject_key, NOW, NOW + 1_000)
            .expect("issue");
        let second = root
            .issue_reader_certificate(&subject_key, NOW, NOW + 1_000)
            .expect("issue");
        let serial = |der: &[u8]| {
            Certificate::from_der(der)
                .expect("parse")
                .tbs_certificate
                .serial_number
                .as_bytes()
                .to_vec()
        };
        assert_ne!(serial(&first), serial(&second));
    }
}
