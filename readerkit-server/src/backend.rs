//! The four protocol handlers.
//!
//! Handlers are stateless across requests; correctness rests on the storage
//! layer's single-key atomicity. Nonces are minted with a five-minute expiry
//! and deleted when a `register` or `certifyKeys` consumes them, so an
//! assertion cannot be replayed after the certification it authorised.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rand::Rng;
use readerkit_core::attestation::{AttestationError, AttestationValidator};
use readerkit_core::clock::Clock;
use readerkit_core::protocol::{
    b64, CertificateChain, CertifyKeysRequest, CertifyKeysResponse, GetIssuerListRequest,
    GetIssuerListResponse, GetNonceResponse, RegisterRequest, RegisterResponse,
};
use readerkit_core::storage::{Storage, StorageError, StorageTable};
use serde::{Deserialize, Serialize};

use crate::error::BackendError;
use crate::root::ReaderRootIdentity;
use crate::settings::BackendSettings;

/// Nonce lifetime: five minutes.
pub const NONCE_TTL_SECONDS: u64 = 5 * 60;

/// Maximum validity jitter applied independently to each end of an issued
/// certificate's window. Breaks correlation of simultaneously-issued certs.
pub const CERT_VALIDITY_JITTER_SECONDS: u64 = 12 * 3600;

const NONCES_TABLE: &str = "ReaderBackendNonces";
const CLIENTS_TABLE: &str = "ReaderBackendClients";
const ROOTS_TABLE: &str = "ReaderBackendRootIdentities";

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationRecord {
    /// The attestation blob exactly as presented at registration.
    #[serde(with = "b64")]
    device_attestation: Vec<u8>,
    /// Whether the device met the attestation policy. Untrusted devices are
    /// certified under the untrusted-devices root.
    trusted: bool,
}

/// The reader backend protocol handler.
pub struct ReaderBackend {
    settings: BackendSettings,
    clock: Arc<dyn Clock>,
    validator: Arc<dyn AttestationValidator>,
    nonces: Arc<dyn StorageTable>,
    clients: Arc<dyn StorageTable>,
    roots: Arc<dyn StorageTable>,
    root_cache: Mutex<HashMap<String, Arc<ReaderRootIdentity>>>,
}

impl ReaderBackend {
    /// Opens the backend tables in `storage`.
    ///
    /// # Errors
    ///
    /// Returns an error if the tables cannot be created.
    pub fn new(
        storage: &dyn Storage,
        settings: BackendSettings,
        validator: Arc<dyn AttestationValidator>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, BackendError> {
        Ok(Self {
            settings,
            clock,
            validator,
            nonces: storage.table(NONCES_TABLE)?,
            clients: storage.table(CLIENTS_TABLE)?,
            roots: storage.table(ROOTS_TABLE)?,
            root_cache: Mutex::new(HashMap::new()),
        })
    }

    /// Mints a fresh 16-byte nonce with a five-minute expiry.
    ///
    /// # Errors
    ///
    /// Returns an error on storage or RNG failure.
    pub fn get_nonce(&self) -> Result<GetNonceResponse, BackendError> {
        let now = self.clock.now();
        self.nonces.purge_expired(now)?;
        let mut nonce = [0u8; 16];
        getrandom::getrandom(&mut nonce)
            .map_err(|err| BackendError::Internal(format!("rng failure: {err}")))?;
        self.nonces
            .insert(Some(&b64::encode(&nonce)), b"{}", Some(now + NONCE_TTL_SECONDS))?;
        Ok(GetNonceResponse {
            nonce: nonce.to_vec(),
        })
    }

    /// Registers a device: validates its attestation against the policy with
    /// the nonce as challenge and persists the blob under a fresh
    /// registration id.
    ///
    /// # Errors
    ///
    /// [`BackendError::NonceUnknown`] for a stale nonce,
    /// [`BackendError::AttestationInvalid`] for binding or (when untrusted
    /// devices are disallowed) policy failures.
    pub fn register(&self, request: &RegisterRequest) -> Result<RegisterResponse, BackendError> {
        let now = self.clock.now();
        let nonce_key = self.require_nonce(&request.nonce, now)?;
        let policy_check = self.validator.validate_attestation(
            &request.device_attestation,
            &request.nonce,
            &self.settings.attestation_policy,
        );
        let trusted = match policy_check {
            Ok(()) => true,
            Err(AttestationError::PolicyRejected(reason))
                if self.settings.allow_untrusted_devices =>
            {
                log::warn!("attestation policy rejected ({reason}); registering as untrusted");
                false
            }
            Err(err) => return Err(err.into()),
        };
        let record = RegistrationRecord {
            device_attestation: request.device_attestation.clone(),
            trusted,
        };
        let registration_id = self
            .clients
            .insert(None, &serde_json::to_vec(&record)?, None)?;
        self.nonces.delete(&nonce_key)?;
        log::info!("registered device as {registration_id} (trusted: {trusted})");
        Ok(RegisterResponse { registration_id })
    }

    /// Certifies a batch of reader keys under the registration's root. The
    /// response carries one chain per key, in request order. The nonce is
    /// consumed together with success.
    ///
    /// # Errors
    ///
    /// [`BackendError::UnknownRegistration`] (HTTP 404) when the id is not
    /// known; nonce, assertion, and request-shape failures otherwise.
    pub fn certify_keys(
        &self,
        request: &CertifyKeysRequest,
    ) -> Result<CertifyKeysResponse, BackendError> {
        let now = self.clock.now();
        let record_bytes = self
            .clients
            .get(&request.registration_id, now)?
            .ok_or_else(|| BackendError::UnknownRegistration(request.registration_id.clone()))?;
        let record: RegistrationRecord = serde_json::from_slice(&record_bytes)?;
        let nonce_key = self.require_nonce(&request.nonce, now)?;
        self.validator.validate_assertion(
            &request.device_assertion,
            &record.device_attestation,
            &request.nonce,
        )?;

        let root = self.root_for(record.trusted)?;
        let duration = u64::from(self.settings.reader_cert_validity_days) * 86_400;
        let mut rng = rand::thread_rng();
        let mut chains = Vec::with_capacity(request.keys.len());
        for jwk in &request.keys {
            let public_key = p256::PublicKey::from_jwk(jwk)
                .map_err(|err| BackendError::InvalidRequest(format!("unusable JWK: {err}")))?;
            let jitter_from = rng.gen_range(0..CERT_VALIDITY_JITTER_SECONDS);
            let jitter_until = rng.gen_range(0..CERT_VALIDITY_JITTER_SECONDS);
            let valid_from = now.saturating_sub(jitter_from);
            let valid_until = now + duration + jitter_until;
            let leaf = root.issue_reader_certificate(&public_key, valid_from, valid_until)?;
            chains.push(CertificateChain(vec![
                leaf,
                root.certificate_der().to_vec(),
            ]));
        }
        self.nonces.delete(&nonce_key)?;
        log::info!(
            "issued {} reader certifications for {}",
            chains.len(),
            request.registration_id
        );
        Ok(CertifyKeysResponse {
            reader_certifications: chains,
        })
    }

    /// Returns the configured issuer list, or "up to date" when the client's
    /// version matches.
    ///
    /// # Errors
    ///
    /// Never fails today; the signature leaves room for stored lists.
    pub fn get_issuer_list(
        &self,
        request: &GetIssuerListRequest,
    ) -> Result<GetIssuerListResponse, BackendError> {
        let list = &self.settings.trusted_issuers;
        if request.current_version == Some(list.version) {
            Ok(GetIssuerListResponse::up_to_date())
        } else {
            Ok(GetIssuerListResponse::Update(list.clone()))
        }
    }

    /// Checks the nonce is extant without consuming it; consumption happens
    /// only on handler success.
    fn require_nonce(&self, nonce: &[u8], now: u64) -> Result<String, BackendError> {
        let key = b64::encode(nonce);
        match self.nonces.get(&key, now)? {
            Some(_) => Ok(key),
            None => Err(BackendError::NonceUnknown),
        }
    }

    fn root_for(&self, trusted: bool) -> Result<Arc<ReaderRootIdentity>, BackendError> {
        let slot = if trusted {
            &self.settings.root_slot
        } else {
            &self.settings.untrusted_root_slot
        };
        let mut cache = self
            .root_cache
            .lock()
            .map_err(|_| BackendError::from(StorageError::Poisoned))?;
        if let Some(root) = cache.get(slot) {
            return Ok(Arc::clone(root));
        }
        let root = Arc::new(ReaderRootIdentity::load_or_generate(
            self.roots.as_ref(),
            slot,
            self.clock.now(),
        )?);
        cache.insert(slot.clone(), Arc::clone(&root));
        Ok(root)
    }
}
