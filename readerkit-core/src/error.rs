use thiserror::Error;

use crate::attestation::AttestationError;
use crate::secure_area::SecureAreaError;
use crate::storage::StorageError;
use crate::transport::TransportError;

/// Error outputs from the reader client.
#[derive(Debug, Error)]
pub enum ReaderKitError {
    /// The local pool has no currently-valid key and replenishment failed.
    #[error("no_valid_key")]
    NoValidKey,
    /// `mark_key_as_used` was called with an alias that is not in the pool.
    #[error("unknown_key: {alias}")]
    UnknownKey {
        /// The alias that was presented.
        alias: String,
    },
    /// The backend returned 404 for our registration id on `certifyKeys`.
    ///
    /// Handled internally: local registration data is dropped and the
    /// replenishment retried once. Surfaces only if the retry hits it again.
    #[error("registration_lost")]
    RegistrationLost,
    /// The backend answered with an unexpected status or a malformed body.
    #[error("protocol_error: {method} returned {status}: {message}")]
    Protocol {
        method: &'static str,
        status: u16,
        message: String,
    },
    /// A returned certificate chain could not be parsed.
    #[error("certificate_error: {0}")]
    Certificate(String),
    /// Unexpected error serializing information.
    #[error("serialization_error: {0}")]
    Serialization(String),
    /// Local table storage failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// Secure key store failure.
    #[error(transparent)]
    SecureArea(#[from] SecureAreaError),
    /// Attestation or assertion generation failure.
    #[error(transparent)]
    Attestation(#[from] AttestationError),
    /// Network-level transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<serde_json::Error> for ReaderKitError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
