//! Certified reader-key pool management against the reader backend.
//!
//! [`ReaderBackendClient`] keeps a balanced supply of currently-valid
//! certified single-use reader keys. It registers the device once, certifies
//! keys in batches, evicts stale material, and degrades gracefully offline:
//! the last remaining key is never deleted unless a replenishment just
//! succeeded, so a device that has ever certified keys can present *some*
//! reader identity until those certificates expire.
//!
//! All mutating operations serialise on one mutex covering the in-memory
//! pool, the local tables, and the secure store. The in-memory map is a
//! lazily-loaded authoritative cache of the certified-keys table; after a
//! crash the table is the truth and orphaned secure-store keys are collected
//! on the next load.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use der::Decode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::attestation::DeviceAttester;
use crate::error::ReaderKitError;
use crate::protocol::{
    CertificateChain, CertifyKeysRequest, CertifyKeysResponse, GetIssuerListRequest,
    GetIssuerListResponse, GetNonceRequest, GetNonceResponse, RegisterRequest, RegisterResponse,
    METHOD_CERTIFY_KEYS, METHOD_GET_ISSUER_LIST, METHOD_GET_NONCE, METHOD_REGISTER,
};
use crate::secure_area::{KeyInfo, SecureArea};
use crate::storage::{Storage, StorageTable};
use crate::transport::{HttpTransport, Transport, TransportResponse};
use crate::trust::{IssuerList, TrustManager};

/// Default pool size.
pub const DEFAULT_TARGET_COUNT: usize = 10;

const REGISTRATION_TABLE: &str = "ReaderBackendClientRegistrationData";
const CERTIFIED_KEYS_TABLE: &str = "ReaderBackendClientCertifiedKeys";
const REGISTRATION_KEY: &str = "default";

/// The device's registration with the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationData {
    /// Local handle to the platform attestation, for generating assertions.
    pub device_attestation_id: String,
    /// The id the backend issued at registration.
    pub registration_id: String,
}

/// One certified reader key: the secure-store alias plus its certification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertifiedKey {
    pub alias: String,
    pub cert_chain: CertificateChain,
    pub valid_from: u64,
    pub valid_until: u64,
    /// Two thirds into the validity window; past this the key is stale and
    /// evicted on the next successful replenishment.
    pub refresh_at: u64,
}

impl CertifiedKey {
    fn from_chain(alias: String, cert_chain: CertificateChain) -> Result<Self, ReaderKitError> {
        let leaf = cert_chain
            .leaf()
            .ok_or_else(|| ReaderKitError::Certificate("empty certification chain".to_string()))?;
        let cert = x509_cert::Certificate::from_der(leaf)
            .map_err(|err| ReaderKitError::Certificate(err.to_string()))?;
        let validity = &cert.tbs_certificate.validity;
        let valid_from = validity.not_before.to_unix_duration().as_secs();
        let valid_until = validity.not_after.to_unix_duration().as_secs();
        if valid_until < valid_from {
            return Err(ReaderKitError::Certificate(
                "certificate validity range inverted".to_string(),
            ));
        }
        let refresh_at = valid_from + (valid_until - valid_from) * 2 / 3;
        Ok(Self {
            alias,
            cert_chain,
            valid_from,
            valid_until,
            refresh_at,
        })
    }

    fn currently_valid(&self, now: u64) -> bool {
        self.valid_from < now && now < self.valid_until
    }
}

/// Configuration for [`ReaderBackendClient`].
pub struct ReaderBackendClientConfig {
    pub transport: Arc<dyn Transport>,
    pub storage: Arc<dyn Storage>,
    pub secure_area: Arc<dyn SecureArea>,
    pub attester: Arc<dyn DeviceAttester>,
    /// Pool target size; the pool replenishes once fewer than
    /// `num_keys / 2 + 1` keys remain good.
    pub num_keys: usize,
}

struct State {
    registration: Arc<dyn StorageTable>,
    keys: Arc<dyn StorageTable>,
    /// Authoritative cache of the certified-keys table, keyed by row id.
    pool: Option<HashMap<String, CertifiedKey>>,
}

/// Client for the reader backend: key pool plus issuer trust feed.
///
/// The configured secure area is assumed to be dedicated to this pool;
/// aliases not referenced by the certified-keys table are collected as
/// orphans when the pool loads.
pub struct ReaderBackendClient {
    transport: Arc<dyn Transport>,
    secure_area: Arc<dyn SecureArea>,
    attester: Arc<dyn DeviceAttester>,
    target_count: usize,
    state: Mutex<State>,
}

impl ReaderBackendClient {
    /// Creates a client from explicit components.
    ///
    /// # Errors
    ///
    /// Returns an error if the local tables cannot be opened.
    pub fn new(config: ReaderBackendClientConfig) -> Result<Self, ReaderKitError> {
        let registration = config.storage.table(REGISTRATION_TABLE)?;
        let keys = config.storage.table(CERTIFIED_KEYS_TABLE)?;
        Ok(Self {
            transport: config.transport,
            secure_area: config.secure_area,
            attester: config.attester,
            target_count: config.num_keys.max(1),
            state: Mutex::new(State {
                registration,
                keys,
                pool: None,
            }),
        })
    }

    /// Creates a client talking HTTP to `reader_backend_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the local tables cannot be opened.
    pub fn with_base_url(
        reader_backend_url: impl Into<String>,
        storage: Arc<dyn Storage>,
        secure_area: Arc<dyn SecureArea>,
        attester: Arc<dyn DeviceAttester>,
        num_keys: usize,
    ) -> Result<Self, ReaderKitError> {
        Self::new(ReaderBackendClientConfig {
            transport: Arc::new(HttpTransport::new(reader_backend_url)),
            storage,
            secure_area,
            attester,
            num_keys,
        })
    }

    /// Returns the oldest still-valid certified key, best-effort replenishing
    /// the pool first. Replenishment failures are swallowed: as long as a
    /// currently-valid key exists it is served.
    ///
    /// # Errors
    ///
    /// [`ReaderKitError::NoValidKey`] if no currently-valid key exists and
    /// replenishment failed; storage or secure-store failures otherwise.
    pub async fn get_key(&self, now: u64) -> Result<(KeyInfo, CertificateChain), ReaderKitError> {
        let mut state = self.state.lock().await;
        if let Err(err) = self.ensure_replenished(&mut state, now).await {
            log::warn!("pool replenishment failed, serving from inventory: {err}");
        }
        self.load_pool(&mut state, now)?;
        let pool = state.pool.get_or_insert_with(HashMap::new);

        // Oldest-first exhausts soon-to-expire material and maximises the
        // utility of remaining inventory when offline.
        let best = pool
            .iter()
            .filter(|(_, key)| key.currently_valid(now))
            .min_by(|a, b| {
                a.1.valid_from
                    .cmp(&b.1.valid_from)
                    .then_with(|| a.0.cmp(b.0))
            })
            .map(|(_, key)| key.clone());
        let Some(key) = best else {
            return Err(ReaderKitError::NoValidKey);
        };
        let key_info = self.secure_area.get_key_info(&key.alias)?;
        Ok((key_info, key.cert_chain))
    }

    /// Retires a key after use. The last remaining key is only evicted when a
    /// replenishment succeeds first; otherwise it is retained for reuse so an
    /// offline reader keeps a presentable identity.
    ///
    /// # Errors
    ///
    /// [`ReaderKitError::UnknownKey`] if the alias is not in the pool;
    /// storage or secure-store failures otherwise.
    pub async fn mark_key_as_used(
        &self,
        key_info: &KeyInfo,
        now: u64,
    ) -> Result<(), ReaderKitError> {
        let mut state = self.state.lock().await;
        self.load_pool(&mut state, now)?;
        let (row_id, pool_len) = {
            let pool = state.pool.get_or_insert_with(HashMap::new);
            let row_id = pool
                .iter()
                .find(|(_, key)| key.alias == key_info.alias)
                .map(|(row_id, _)| row_id.clone());
            (row_id, pool.len())
        };
        let Some(row_id) = row_id else {
            return Err(ReaderKitError::UnknownKey {
                alias: key_info.alias.clone(),
            });
        };

        if pool_len <= 1 {
            if let Err(err) = self.ensure_replenished(&mut state, now).await {
                log::warn!("retaining last reader key, replenishment failed: {err}");
                return Ok(());
            }
            if state.pool.as_ref().map_or(0, HashMap::len) <= 1 {
                log::warn!("retaining last reader key, replenishment added nothing");
                return Ok(());
            }
        }
        self.remove_key(&mut state, &row_id)
    }

    /// Fetches the issuer trust list when the server's version differs from
    /// `current_version`; `None` means the client is up to date.
    ///
    /// # Errors
    ///
    /// Returns transport or protocol failures.
    pub async fn get_trusted_issuers(
        &self,
        current_version: Option<i64>,
    ) -> Result<Option<IssuerList>, ReaderKitError> {
        let _serialised = self.state.lock().await;
        self.get_trusted_issuers_inner(current_version).await
    }

    /// Pulls the issuer feed and atomically rebuilds `trust`'s built-in list
    /// when an update is available. Returns whether an update was applied.
    ///
    /// # Errors
    ///
    /// Returns transport, protocol, or storage failures.
    pub async fn refresh_trusted_issuers(
        &self,
        trust: &TrustManager,
        now: u64,
    ) -> Result<bool, ReaderKitError> {
        let _serialised = self.state.lock().await;
        let current_version = trust.built_in_version(now)?;
        match self.get_trusted_issuers_inner(current_version).await? {
            Some(list) => {
                trust.apply_feed(list.version, &list.entries, now)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_trusted_issuers_inner(
        &self,
        current_version: Option<i64>,
    ) -> Result<Option<IssuerList>, ReaderKitError> {
        let request = GetIssuerListRequest { current_version };
        let response = self
            .transport
            .post(METHOD_GET_ISSUER_LIST, serde_json::to_value(request)?)
            .await?;
        if !response.is_success() {
            return Err(protocol_error(METHOD_GET_ISSUER_LIST, &response));
        }
        match serde_json::from_value::<GetIssuerListResponse>(response.body)? {
            GetIssuerListResponse::Update(list) => Ok(Some(list)),
            GetIssuerListResponse::UpToDate { .. } => Ok(None),
        }
    }

    /// Tops the pool up to `target_count` good keys when fewer than half
    /// remain good, evicting past-refresh material only after the new batch
    /// is committed. A 404 from `certifyKeys` means the backend lost our
    /// registration: local registration data is dropped and the whole
    /// operation retried once.
    async fn ensure_replenished(
        &self,
        state: &mut State,
        now: u64,
    ) -> Result<(), ReaderKitError> {
        match self.replenish_once(state, now).await {
            Err(ReaderKitError::RegistrationLost) => {
                log::info!("backend lost our registration, re-registering");
                state.registration.delete(REGISTRATION_KEY)?;
                self.replenish_once(state, now).await
            }
            other => other,
        }
    }

    async fn replenish_once(&self, state: &mut State, now: u64) -> Result<(), ReaderKitError> {
        self.load_pool(state, now)?;
        // A cancelled earlier run may have left keys without rows; sweep
        // before minting more.
        self.collect_orphan_aliases(state)?;
        let (to_delete, good_count) = {
            let pool = state.pool.get_or_insert_with(HashMap::new);
            let to_delete: Vec<String> = pool
                .iter()
                .filter(|(_, key)| now > key.refresh_at)
                .map(|(row_id, _)| row_id.clone())
                .collect();
            let good_count = pool
                .values()
                .filter(|key| key.currently_valid(now) && now <= key.refresh_at)
                .count();
            (to_delete, good_count)
        };

        if good_count > self.target_count / 2 {
            for row_id in &to_delete {
                self.remove_key(state, row_id)?;
            }
            return Ok(());
        }

        let registration = self.ensure_registered(state, now).await?;
        let nonce = self.fetch_nonce().await?;
        let device_assertion = self
            .attester
            .generate_assertion(&registration.device_attestation_id, &nonce)
            .await?;

        let need = self.target_count - good_count;
        let mut fresh: Vec<KeyInfo> = Vec::with_capacity(need);
        for _ in 0..need {
            match self.secure_area.create_key() {
                Ok(key_info) => fresh.push(key_info),
                Err(err) => {
                    self.discard_fresh(&fresh);
                    return Err(err.into());
                }
            }
        }

        let request = CertifyKeysRequest {
            registration_id: registration.registration_id,
            nonce,
            device_assertion,
            keys: fresh.iter().map(KeyInfo::public_key_jwk).collect(),
        };
        let response = match serde_json::to_value(&request) {
            Ok(body) => self.transport.post(METHOD_CERTIFY_KEYS, body).await,
            Err(err) => {
                self.discard_fresh(&fresh);
                return Err(err.into());
            }
        };
        let response = match response {
            Ok(response) => response,
            Err(err) => {
                self.discard_fresh(&fresh);
                return Err(err.into());
            }
        };
        if response.status == 404 {
            self.discard_fresh(&fresh);
            return Err(ReaderKitError::RegistrationLost);
        }
        if !response.is_success() {
            self.discard_fresh(&fresh);
            return Err(protocol_error(METHOD_CERTIFY_KEYS, &response));
        }
        let parsed: CertifyKeysResponse = match serde_json::from_value(response.body) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.discard_fresh(&fresh);
                return Err(err.into());
            }
        };
        if parsed.reader_certifications.len() != fresh.len() {
            self.discard_fresh(&fresh);
            return Err(ReaderKitError::Protocol {
                method: METHOD_CERTIFY_KEYS,
                status: response.status,
                message: format!(
                    "expected {} certifications, got {}",
                    fresh.len(),
                    parsed.reader_certifications.len()
                ),
            });
        }

        // Validate every chain before committing any row.
        let mut records = Vec::with_capacity(fresh.len());
        for (key_info, chain) in fresh.iter().zip(parsed.reader_certifications) {
            match CertifiedKey::from_chain(key_info.alias.clone(), chain) {
                Ok(record) => records.push(record),
                Err(err) => {
                    self.discard_fresh(&fresh);
                    return Err(err);
                }
            }
        }
        let committed = records.len();
        for record in records {
            let row_id = state.keys.insert(None, &serde_json::to_vec(&record)?, None)?;
            state
                .pool
                .get_or_insert_with(HashMap::new)
                .insert(row_id, record);
        }
        for row_id in &to_delete {
            self.remove_key(state, row_id)?;
        }
        log::info!(
            "certified {committed} fresh reader keys, pool holds {}",
            state.pool.as_ref().map_or(0, HashMap::len)
        );
        Ok(())
    }

    /// Returns cached registration data, registering first if none exists.
    async fn ensure_registered(
        &self,
        state: &mut State,
        now: u64,
    ) -> Result<RegistrationData, ReaderKitError> {
        if let Some(bytes) = state.registration.get(REGISTRATION_KEY, now)? {
            return Ok(serde_json::from_slice(&bytes)?);
        }
        let nonce = self.fetch_nonce().await?;
        let generated = self.attester.generate_attestation(&nonce).await?;
        let request = RegisterRequest {
            nonce,
            device_attestation: generated.attestation,
        };
        let response: RegisterResponse = self.post_expect_ok(METHOD_REGISTER, &request).await?;
        let data = RegistrationData {
            device_attestation_id: generated.attestation_id,
            registration_id: response.registration_id,
        };
        state
            .registration
            .insert(Some(REGISTRATION_KEY), &serde_json::to_vec(&data)?, None)?;
        log::info!("registered with reader backend as {}", data.registration_id);
        Ok(data)
    }

    async fn fetch_nonce(&self) -> Result<Vec<u8>, ReaderKitError> {
        let response: GetNonceResponse = self
            .post_expect_ok(METHOD_GET_NONCE, &GetNonceRequest::default())
            .await?;
        Ok(response.nonce)
    }

    async fn post_expect_ok<Request: Serialize, Response: DeserializeOwned>(
        &self,
        method: &'static str,
        request: &Request,
    ) -> Result<Response, ReaderKitError> {
        let response = self
            .transport
            .post(method, serde_json::to_value(request)?)
            .await?;
        if !response.is_success() {
            return Err(protocol_error(method, &response));
        }
        Ok(serde_json::from_value(response.body)?)
    }

    /// Loads the pool from the table on first use and collects strays in
    /// both directions: rows whose key material is gone, and secure-store
    /// aliases no row references.
    fn load_pool(&self, state: &mut State, now: u64) -> Result<(), ReaderKitError> {
        if state.pool.is_some() {
            return Ok(());
        }
        let mut pool = HashMap::new();
        for (row_id, bytes) in state.keys.enumerate(now)? {
            let record: CertifiedKey = serde_json::from_slice(&bytes)?;
            if self.secure_area.get_key_info(&record.alias).is_ok() {
                pool.insert(row_id, record);
            } else {
                log::warn!("dropping certified-key row {row_id} with missing key material");
                state.keys.delete(&row_id)?;
            }
        }
        state.pool = Some(pool);
        self.collect_orphan_aliases(state)?;
        Ok(())
    }

    /// Deletes secure-store aliases no pool row references.
    fn collect_orphan_aliases(&self, state: &State) -> Result<(), ReaderKitError> {
        let Some(pool) = state.pool.as_ref() else {
            return Ok(());
        };
        let referenced: HashSet<&str> = pool.values().map(|key| key.alias.as_str()).collect();
        for alias in self.secure_area.aliases()? {
            if !referenced.contains(alias.as_str()) {
                log::info!("collecting orphaned reader key {alias}");
                self.secure_area.delete_key(&alias)?;
            }
        }
        Ok(())
    }

    /// Removes a key's row and its secure-store material together. Each half
    /// is idempotent, so a failure between the two is healed on reload.
    fn remove_key(&self, state: &mut State, row_id: &str) -> Result<(), ReaderKitError> {
        let record = state
            .pool
            .as_mut()
            .and_then(|pool| pool.remove(row_id));
        if let Some(record) = record {
            self.secure_area.delete_key(&record.alias)?;
        }
        state.keys.delete(row_id)?;
        Ok(())
    }

    fn discard_fresh(&self, fresh: &[KeyInfo]) {
        for key_info in fresh {
            if let Err(err) = self.secure_area.delete_key(&key_info.alias) {
                log::warn!("failed to discard uncommitted key {}: {err}", key_info.alias);
            }
        }
    }
}

fn protocol_error(method: &'static str, response: &TransportResponse) -> ReaderKitError {
    ReaderKitError::Protocol {
        method,
        status: response.status,
        message: body_text(&response.body),
    }
}

fn body_text(body: &Value) -> String {
    match body {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
