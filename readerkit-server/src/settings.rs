//! Backend configuration.

use std::path::Path;

use readerkit_core::attestation::AttestationPolicy;
use readerkit_core::trust::IssuerList;
use serde::{Deserialize, Serialize};

use crate::error::BackendError;

/// Everything the backend needs to know, JSON-loadable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackendSettings {
    /// Reader certificate lifetime in days, before jitter.
    pub reader_cert_validity_days: u32,
    /// Policy the device attestation must meet.
    pub attestation_policy: AttestationPolicy,
    /// When set, devices failing the attestation policy still register but
    /// are certified under the untrusted-devices root, keeping the service
    /// functional but distinguishable.
    pub allow_untrusted_devices: bool,
    /// The issuer trust list distributed by `getIssuerList`.
    pub trusted_issuers: IssuerList,
    /// Storage slot of the reader root identity. Rotate by renaming.
    pub root_slot: String,
    /// Storage slot of the untrusted-devices root identity.
    pub untrusted_root_slot: String,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            reader_cert_validity_days: 30,
            attestation_policy: AttestationPolicy::default(),
            allow_untrusted_devices: true,
            trusted_issuers: IssuerList {
                version: 0,
                entries: Vec::new(),
            },
            root_slot: "reader_root_identity".to_string(),
            untrusted_root_slot: "reader_root_identity_untrusted_devices".to_string(),
        }
    }
}

impl BackendSettings {
    /// Loads settings from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Settings`] if the file cannot be read or
    /// parsed.
    pub fn from_json_file(path: &Path) -> Result<Self, BackendError> {
        let bytes = std::fs::read(path)
            .map_err(|err| BackendError::Settings(format!("{}: {err}", path.display())))?;
        serde_json::from_slice(&bytes)
            .map_err(|err| BackendError::Settings(format!("{}: {err}", path.display())))
    }
}
