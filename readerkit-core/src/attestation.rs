//! Device attestation and assertion interfaces.
//!
//! The protocol treats attestations and assertions as sealed byte strings
//! bound to a challenge nonce. Platform builds supply real attesters (App
//! Attest, Play Integrity); the backend consults an [`AttestationValidator`]
//! to enforce its [`AttestationPolicy`]. The software token implementations
//! here sign with an in-process P-256 device key so every validation path is
//! exercisable in tests and development builds.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::JwkEcKey;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::b64;

const ATTESTATION_CONTEXT: &[u8] = b"readerkit:device-attestation";
const ASSERTION_CONTEXT: &[u8] = b"readerkit:device-assertion";

#[derive(Debug, Error)]
pub enum AttestationError {
    /// The blob is malformed or its challenge binding does not hold.
    #[error("attestation_invalid: {0}")]
    AttestationInvalid(String),
    /// The blob is well-formed but the device does not meet policy.
    #[error("attestation_policy_rejected: {0}")]
    PolicyRejected(String),
    /// The assertion does not bind to the attestation or the challenge.
    #[error("assertion_mismatch: {0}")]
    AssertionMismatch(String),
    /// No attestation was generated under this local id.
    #[error("unknown attestation id {0}")]
    UnknownAttestation(String),
    #[error("serialization_error: {0}")]
    Serialization(String),
}

/// An attestation freshly produced by the platform, plus the local handle the
/// client persists to generate assertions against it later.
#[derive(Debug, Clone)]
pub struct GeneratedAttestation {
    pub attestation_id: String,
    pub attestation: Vec<u8>,
}

/// Client-side producer of attestation and assertion blobs.
#[async_trait]
pub trait DeviceAttester: Send + Sync {
    /// Produces a fresh attestation bound to `challenge`.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform refuses or the challenge is unusable.
    async fn generate_attestation(
        &self,
        challenge: &[u8],
    ) -> Result<GeneratedAttestation, AttestationError>;

    /// Produces an assertion over `challenge`, bound to the attestation
    /// previously generated under `attestation_id`.
    ///
    /// # Errors
    ///
    /// Returns [`AttestationError::UnknownAttestation`] if the id is not
    /// known locally.
    async fn generate_assertion(
        &self,
        attestation_id: &str,
        challenge: &[u8],
    ) -> Result<Vec<u8>, AttestationError>;
}

/// Server-side policy for accepting device attestations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AttestationPolicy {
    /// Reject iOS builds that are not release builds.
    pub ios_release_build: bool,
    /// Required iOS bundle/team identifier, when set.
    pub ios_app_identifier: Option<String>,
    /// Require Google-rooted attestation on Android.
    pub android_require_gms_attestation: bool,
    /// Require verified-boot state green on Android.
    pub android_require_verified_boot_green: bool,
    /// Allowed Android app signing certificate SHA-256 digests (hex). Empty
    /// means any digest is accepted.
    pub android_app_signature_certificate_digests: Vec<String>,
}

/// Server-side validation of sealed attestation/assertion blobs.
pub trait AttestationValidator: Send + Sync {
    /// Checks that `attestation` is well-formed, binds to `challenge`, and
    /// meets `policy`.
    ///
    /// # Errors
    ///
    /// [`AttestationError::AttestationInvalid`] for structural or binding
    /// failures, [`AttestationError::PolicyRejected`] for policy failures.
    fn validate_attestation(
        &self,
        attestation: &[u8],
        challenge: &[u8],
        policy: &AttestationPolicy,
    ) -> Result<(), AttestationError>;

    /// Checks that `assertion` is signed by the device key in `attestation`
    /// and carries exactly `challenge`.
    ///
    /// # Errors
    ///
    /// Returns [`AttestationError::AssertionMismatch`] on any failure.
    fn validate_assertion(
        &self,
        assertion: &[u8],
        attestation: &[u8],
        challenge: &[u8],
    ) -> Result<(), AttestationError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Platform {
    Android,
    Ios,
}

/// Self-description of the device, baked into software attestation tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceClaims {
    pub platform: Platform,
    pub release_build: bool,
    pub app_identifier: String,
    pub gms_attestation: bool,
    pub verified_boot_green: bool,
    /// SHA-256 of the app signing certificate, hex.
    pub signature_digest: String,
}

impl Default for DeviceClaims {
    fn default() -> Self {
        Self {
            platform: Platform::Android,
            release_build: true,
            app_identifier: "org.example.reader".to_string(),
            gms_attestation: true,
            verified_boot_green: true,
            signature_digest: String::new(),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttestationToken {
    claims: DeviceClaims,
    device_key: JwkEcKey,
    #[serde(with = "b64")]
    challenge: Vec<u8>,
    #[serde(with = "b64")]
    signature: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssertionToken {
    #[serde(with = "b64")]
    challenge: Vec<u8>,
    #[serde(with = "b64")]
    signature: Vec<u8>,
}

/// Software attester: one P-256 device key per generated attestation.
pub struct SoftwareDeviceAttester {
    claims: DeviceClaims,
    device_keys: Mutex<HashMap<String, SigningKey>>,
}

impl SoftwareDeviceAttester {
    #[must_use]
    pub fn new(claims: DeviceClaims) -> Self {
        Self {
            claims,
            device_keys: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for SoftwareDeviceAttester {
    fn default() -> Self {
        Self::new(DeviceClaims::default())
    }
}

#[async_trait]
impl DeviceAttester for SoftwareDeviceAttester {
    async fn generate_attestation(
        &self,
        challenge: &[u8],
    ) -> Result<GeneratedAttestation, AttestationError> {
        let device_key = SigningKey::random(&mut OsRng);
        let signature: Signature = device_key.sign(&signed_payload(ATTESTATION_CONTEXT, challenge));
        let token = AttestationToken {
            claims: self.claims.clone(),
            device_key: p256::PublicKey::from(*device_key.verifying_key()).to_jwk(),
            challenge: challenge.to_vec(),
            signature: signature.to_der().as_bytes().to_vec(),
        };
        let attestation = serde_json::to_vec(&token)
            .map_err(|err| AttestationError::Serialization(err.to_string()))?;

        let attestation_id = crate::storage::random_key();
        let mut device_keys = self
            .device_keys
            .lock()
            .map_err(|_| AttestationError::Serialization("attester lock poisoned".to_string()))?;
        device_keys.insert(attestation_id.clone(), device_key);
        Ok(GeneratedAttestation {
            attestation_id,
            attestation,
        })
    }

    async fn generate_assertion(
        &self,
        attestation_id: &str,
        challenge: &[u8],
    ) -> Result<Vec<u8>, AttestationError> {
        let device_keys = self
            .device_keys
            .lock()
            .map_err(|_| AttestationError::Serialization("attester lock poisoned".to_string()))?;
        let device_key = device_keys
            .get(attestation_id)
            .ok_or_else(|| AttestationError::UnknownAttestation(attestation_id.to_string()))?;
        let signature: Signature = device_key.sign(&signed_payload(ASSERTION_CONTEXT, challenge));
        let token = AssertionToken {
            challenge: challenge.to_vec(),
            signature: signature.to_der().as_bytes().to_vec(),
        };
        serde_json::to_vec(&token).map_err(|err| AttestationError::Serialization(err.to_string()))
    }
}

/// Validator for software attestation tokens.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftwareAttestationValidator;

impl AttestationValidator for SoftwareAttestationValidator {
    fn validate_attestation(
        &self,
        attestation: &[u8],
        challenge: &[u8],
        policy: &AttestationPolicy,
    ) -> Result<(), AttestationError> {
        let token = parse_attestation(attestation)?;
        if token.challenge != challenge {
            return Err(AttestationError::AttestationInvalid(
                "attestation challenge does not match nonce".to_string(),
            ));
        }
        let device_key = device_verifying_key(&token)?;
        verify_signature(
            &device_key,
            ATTESTATION_CONTEXT,
            challenge,
            &token.signature,
        )
        .map_err(|()| {
            AttestationError::AttestationInvalid("attestation signature invalid".to_string())
        })?;
        check_policy(&token.claims, policy)
    }

    fn validate_assertion(
        &self,
        assertion: &[u8],
        attestation: &[u8],
        challenge: &[u8],
    ) -> Result<(), AttestationError> {
        let attestation_token = parse_attestation(attestation)?;
        let device_key = device_verifying_key(&attestation_token)?;
        let token: AssertionToken = serde_json::from_slice(assertion)
            .map_err(|err| AttestationError::AssertionMismatch(err.to_string()))?;
        if token.challenge != challenge {
            return Err(AttestationError::AssertionMismatch(
                "assertion challenge does not match nonce".to_string(),
            ));
        }
        verify_signature(&device_key, ASSERTION_CONTEXT, challenge, &token.signature).map_err(
            |()| {
                AttestationError::AssertionMismatch(
                    "assertion not signed by attested device key".to_string(),
                )
            },
        )
    }
}

fn signed_payload(context: &[u8], challenge: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(context.len() + challenge.len());
    payload.extend_from_slice(context);
    payload.extend_from_slice(challenge);
    payload
}

fn parse_attestation(attestation: &[u8]) -> Result<AttestationToken, AttestationError> {
    serde_json::from_slice(attestation)
        .map_err(|err| AttestationError::AttestationInvalid(err.to_string()))
}

fn device_verifying_key(token: &AttestationToken) -> Result<VerifyingKey, AttestationError> {
    let public_key = p256::PublicKey::from_jwk(&token.device_key)
        .map_err(|err| AttestationError::AttestationInvalid(err.to_string()))?;
    Ok(VerifyingKey::from(public_key))
}

fn verify_signature(
    key: &VerifyingKey,
    context: &[u8],
    challenge: &[u8],
    der: &[u8],
) -> Result<(), ()> {
    let signature = Signature::from_der(der).map_err(|_| ())?;
    key.verify(&signed_payload(context, challenge), &signature)
        .map_err(|_| ())
}

fn check_policy(claims: &DeviceClaims, policy: &AttestationPolicy) -> Result<(), AttestationError> {
    match claims.platform {
        Platform::Ios => {
            if policy.ios_release_build && !claims.release_build {
                return Err(AttestationError::PolicyRejected(
                    "iOS build is not a release build".to_string(),
                ));
            }
            if let Some(required) = &policy.ios_app_identifier {
                if claims.app_identifier != *required {
                    return Err(AttestationError::PolicyRejected(format!(
                        "iOS app identifier {} is not allowed",
                        claims.app_identifier
                    )));
                }
            }
        }
        Platform::Android => {
            if policy.android_require_gms_attestation && !claims.gms_attestation {
                return Err(AttestationError::PolicyRejected(
                    "Android attestation is not Google-rooted".to_string(),
                ));
            }
            if policy.android_require_verified_boot_green && !claims.verified_boot_green {
                return Err(AttestationError::PolicyRejected(
                    "Android verified-boot state is not green".to_string(),
                ));
            }
            if !policy.android_app_signature_certificate_digests.is_empty()
                && !policy
                    .android_app_signature_certificate_digests
                    .iter()
                    .any(|digest| digest.eq_ignore_ascii_case(&claims.signature_digest))
            {
                return Err(AttestationError::PolicyRejected(
                    "Android app signing certificate digest is not allowed".to_string(),
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attest(claims: DeviceClaims, challenge: &[u8]) -> (SoftwareDeviceAttester, GeneratedAttestation) {
        let attester = SoftwareDeviceAttester::new(claims);
        let generated = block_on(attester.generate_attestation(challenge))
            .expect("generate attestation");
        (attester, generated)
    }

    // Attester methods are async only because platform attesters suspend;
    // the software one never does, so a minimal executor is enough here.
    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("build runtime")
            .block_on(future)
    }

    #[test]
    fn test_attestation_validates_against_policy() {
        let challenge = [7u8; 16];
        let (_attester, generated) = attest(DeviceClaims::default(), &challenge);
        let validator = SoftwareAttestationValidator;
        let policy = AttestationPolicy {
            android_require_gms_attestation: true,
            android_require_verified_boot_green: true,
            ..AttestationPolicy::default()
        };
        validator
            .validate_attestation(&generated.attestation, &challenge, &policy)
            .expect("attestation accepted");
    }

    #[test]
    fn test_attestation_challenge_mismatch_rejected() {
        let (_attester, generated) = attest(DeviceClaims::default(), &[7u8; 16]);
        let validator = SoftwareAttestationValidator;
        let err = validator
            .validate_attestation(&generated.attestation, &[8u8; 16], &AttestationPolicy::default())
            .expect_err("stale challenge");
        assert!(matches!(err, AttestationError::AttestationInvalid(_)));
    }

    #[test]
    fn test_policy_rejection_is_distinguishable() {
        let claims = DeviceClaims {
            verified_boot_green: false,
            ..DeviceClaims::default()
        };
        let challenge = [9u8; 16];
        let (_attester, generated) = attest(claims, &challenge);
        let validator = SoftwareAttestationValidator;
        let policy = AttestationPolicy {
            android_require_verified_boot_green: true,
            ..AttestationPolicy::default()
        };
        let err = validator
            .validate_attestation(&generated.attestation, &challenge, &policy)
            .expect_err("boot state not green");
        assert!(matches!(err, AttestationError::PolicyRejected(_)));
    }

    #[test]
    fn test_ios_app_identifier_policy() {
        let claims = DeviceClaims {
            platform: Platform::Ios,
            app_identifier: "TEAM.org.example.reader".to_string(),
            ..DeviceClaims::default()
        };
        let challenge = [3u8; 16];
        let (_attester, generated) = attest(claims, &challenge);
        let validator = SoftwareAttestationValidator;

        let matching = AttestationPolicy {
            ios_app_identifier: Some("TEAM.org.example.reader".to_string()),
            ..AttestationPolicy::default()
        };
        validator
            .validate_attestation(&generated.attestation, &challenge, &matching)
            .expect("identifier accepted");

        let mismatched = AttestationPolicy {
            ios_app_identifier: Some("OTHER.org.example".to_string()),
            ..AttestationPolicy::default()
        };
        assert!(matches!(
            validator.validate_attestation(&generated.attestation, &challenge, &mismatched),
            Err(AttestationError::PolicyRejected(_))
        ));
    }

    #[test]
    fn test_assertion_binds_attestation_and_challenge() {
        let challenge = [1u8; 16];
        let (attester, generated) = attest(DeviceClaims::default(), &challenge);
        let validator = SoftwareAttestationValidator;

        let assertion_challenge = [2u8; 16];
        let assertion = block_on(
            attester.generate_assertion(&generated.attestation_id, &assertion_challenge),
        )
        .expect("generate assertion");
        validator
            .validate_assertion(&assertion, &generated.attestation, &assertion_challenge)
            .expect("assertion accepted");

        // Same assertion against a different nonce must fail.
        assert!(matches!(
            validator.validate_assertion(&assertion, &generated.attestation, &[4u8; 16]),
            Err(AttestationError::AssertionMismatch(_))
        ));

        // An assertion from a different device key must fail.
        let (other_attester, other) = attest(DeviceClaims::default(), &challenge);
        let foreign = block_on(
            other_attester.generate_assertion(&other.attestation_id, &assertion_challenge),
        )
        .expect("generate assertion");
        assert!(matches!(
            validator.validate_assertion(&foreign, &generated.attestation, &assertion_challenge),
            Err(AttestationError::AssertionMismatch(_))
        ));
    }

    #[test]
    fn test_unknown_attestation_id() {
        let attester = SoftwareDeviceAttester::default();
        let err = block_on(attester.generate_assertion("missing", &[0u8; 16]))
            .expect_err("unknown id");
        assert!(matches!(err, AttestationError::UnknownAttestation(_)));
    }
}
