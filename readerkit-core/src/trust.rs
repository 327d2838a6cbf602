//! Issuer trust entries and the client-side trust manager.
//!
//! The backend distributes a versioned list of trusted identity issuers:
//! individual IACA certificates or signed VICALs, each with display metadata.
//! The client mirrors the feed into a built-in trust list with replace-all
//! semantics; a user-managed list coexists in a disjoint table and is never
//! touched by feed updates.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ReaderKitError;
use crate::protocol::{b64, b64_opt};
use crate::storage::{Storage, StorageResult, StorageTable};

/// How often the client pulls the issuer feed.
pub const REFRESH_INTERVAL_SECONDS: u64 = 4 * 3600;

const BUILT_IN_TABLE: &str = "TrustManagerBuiltInIssuers";
const USER_TABLE: &str = "TrustManagerUserIssuers";
const META_TABLE: &str = "TrustManagerMetadata";
const META_VERSION_KEY: &str = "builtInIssuersVersion";
const META_UPDATED_AT_KEY: &str = "builtInIssuersUpdatedAt";

/// Display material accompanying a trusted issuer. Carries no secrets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuerMetadata {
    pub display_name: String,
    /// Small icon image bytes, when the issuer ships one.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "b64_opt")]
    pub display_icon: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub privacy_policy_url: Option<String>,
    #[serde(default)]
    pub test_only: bool,
}

/// One entry in the issuer trust list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum IssuerTrustEntry {
    /// A single IACA root certificate (DER).
    #[serde(rename_all = "camelCase")]
    Iaca {
        #[serde(with = "b64")]
        cert: Vec<u8>,
        metadata: IssuerMetadata,
    },
    /// A signed VICAL carrying many issuer CAs at once.
    #[serde(rename_all = "camelCase")]
    Vical {
        #[serde(with = "b64")]
        signed_vical: Vec<u8>,
        metadata: IssuerMetadata,
    },
}

impl IssuerTrustEntry {
    #[must_use]
    pub fn metadata(&self) -> &IssuerMetadata {
        match self {
            Self::Iaca { metadata, .. } | Self::Vical { metadata, .. } => metadata,
        }
    }
}

/// The versioned feed payload: a monotonic version plus the full ordered list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuerList {
    pub version: i64,
    pub entries: Vec<IssuerTrustEntry>,
}

/// Client-side trust state: the feed-managed built-in list plus the
/// user-managed list.
pub struct TrustManager {
    built_in: Arc<dyn StorageTable>,
    user: Arc<dyn StorageTable>,
    meta: Arc<dyn StorageTable>,
}

impl TrustManager {
    /// Opens the trust tables in `storage`.
    ///
    /// # Errors
    ///
    /// Returns an error if the tables cannot be created.
    pub fn new(storage: &dyn Storage) -> StorageResult<Self> {
        Ok(Self {
            built_in: storage.table(BUILT_IN_TABLE)?,
            user: storage.table(USER_TABLE)?,
            meta: storage.table(META_TABLE)?,
        })
    }

    /// The version of the last applied feed, if any was ever applied.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure or corrupt bookkeeping.
    pub fn built_in_version(&self, now: u64) -> Result<Option<i64>, ReaderKitError> {
        self.meta_i64(META_VERSION_KEY, now)
    }

    /// When the built-in list was last rebuilt, if ever.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure or corrupt bookkeeping.
    pub fn built_in_updated_at(&self, now: u64) -> Result<Option<i64>, ReaderKitError> {
        self.meta_i64(META_UPDATED_AT_KEY, now)
    }

    /// Whether the 4-hour refresh cadence calls for another feed pull.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub fn needs_refresh(&self, now: u64) -> Result<bool, ReaderKitError> {
        let updated_at = self.built_in_updated_at(now)?;
        Ok(updated_at.map_or(true, |at| {
            u64::try_from(at).map_or(true, |at| now.saturating_sub(at) >= REFRESH_INTERVAL_SECONDS)
        }))
    }

    /// Atomically rebuilds the built-in list from a feed payload: existing
    /// entries are removed, the new entries inserted in feed order, and the
    /// version/updated-at bookkeeping persisted. The user list is untouched.
    ///
    /// # Errors
    ///
    /// Returns an error on storage or serialization failure.
    pub fn apply_feed(
        &self,
        version: i64,
        entries: &[IssuerTrustEntry],
        now: u64,
    ) -> Result<(), ReaderKitError> {
        for (key, _) in self.built_in.enumerate(now)? {
            self.built_in.delete(&key)?;
        }
        for entry in entries {
            self.built_in.insert(None, &serde_json::to_vec(entry)?, None)?;
        }
        self.put_meta_i64(META_VERSION_KEY, version)?;
        self.put_meta_i64(META_UPDATED_AT_KEY, i64::try_from(now).unwrap_or(i64::MAX))?;
        log::info!(
            "applied issuer trust feed version {version} with {} entries",
            entries.len()
        );
        Ok(())
    }

    /// The current built-in list in feed order.
    ///
    /// # Errors
    ///
    /// Returns an error on storage or serialization failure.
    pub fn built_in_issuers(&self, now: u64) -> Result<Vec<IssuerTrustEntry>, ReaderKitError> {
        self.built_in
            .enumerate(now)?
            .into_iter()
            .map(|(_, bytes)| serde_json::from_slice(&bytes).map_err(ReaderKitError::from))
            .collect()
    }

    /// Adds a user-managed issuer; returns its row key.
    ///
    /// # Errors
    ///
    /// Returns an error on storage or serialization failure.
    pub fn add_user_issuer(&self, entry: &IssuerTrustEntry) -> Result<String, ReaderKitError> {
        Ok(self.user.insert(None, &serde_json::to_vec(entry)?, None)?)
    }

    /// Removes a user-managed issuer by row key. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub fn remove_user_issuer(&self, key: &str) -> Result<bool, ReaderKitError> {
        Ok(self.user.delete(key)?)
    }

    /// The user-managed list with row keys, in insertion order.
    ///
    /// # Errors
    ///
    /// Returns an error on storage or serialization failure.
    pub fn user_issuers(
        &self,
        now: u64,
    ) -> Result<Vec<(String, IssuerTrustEntry)>, ReaderKitError> {
        self.user
            .enumerate(now)?
            .into_iter()
            .map(|(key, bytes)| {
                serde_json::from_slice(&bytes)
                    .map(|entry| (key, entry))
                    .map_err(ReaderKitError::from)
            })
            .collect()
    }

    fn meta_i64(&self, key: &str, now: u64) -> Result<Option<i64>, ReaderKitError> {
        self.meta
            .get(key, now)?
            .map(|bytes| serde_json::from_slice(&bytes).map_err(ReaderKitError::from))
            .transpose()
    }

    fn put_meta_i64(&self, key: &str, value: i64) -> Result<(), ReaderKitError> {
        let bytes = serde_json::to_vec(&value)?;
        if self.meta.update(key, &bytes).is_err() {
            self.meta.insert(Some(key), &bytes, None)?;
        }
        Ok(())
    }
}
