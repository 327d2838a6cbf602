use readerkit_core::attestation::AttestationError;
use readerkit_core::storage::StorageError;
use thiserror::Error;

/// Server-side request failures, each with an HTTP status mapping.
///
/// [`BackendError::UnknownRegistration`] is the only 404: it is the sole
/// signal that prompts a client to drop its registration and re-register, so
/// no other failure may share the status.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The presented nonce was never minted or has expired.
    #[error("nonce_unknown")]
    NonceUnknown,
    /// The device attestation is malformed, unbound, or rejected by policy.
    #[error("attestation_invalid: {0}")]
    AttestationInvalid(String),
    /// The assertion does not bind the stored attestation to the nonce.
    #[error("assertion_mismatch: {0}")]
    AssertionMismatch(String),
    /// No registration exists under this id.
    #[error("unknown_registration: {0}")]
    UnknownRegistration(String),
    /// The request body is structurally unusable (bad JWK, bad fields).
    #[error("invalid_request: {0}")]
    InvalidRequest(String),
    /// Certificate generation or parsing failed.
    #[error("certificate_error: {0}")]
    Certificate(String),
    /// Settings could not be loaded.
    #[error("settings_error: {0}")]
    Settings(String),
    #[error("serialization_error: {0}")]
    Serialization(String),
    #[error("internal_error: {0}")]
    Internal(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl BackendError {
    /// The HTTP status this failure maps to.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Self::UnknownRegistration(_) => 404,
            Self::NonceUnknown
            | Self::AttestationInvalid(_)
            | Self::AssertionMismatch(_)
            | Self::InvalidRequest(_) => 400,
            Self::Certificate(_)
            | Self::Settings(_)
            | Self::Serialization(_)
            | Self::Internal(_)
            | Self::Storage(_) => 500,
        }
    }
}

impl From<AttestationError> for BackendError {
    fn from(err: AttestationError) -> Self {
        match err {
            AttestationError::AssertionMismatch(message) => Self::AssertionMismatch(message),
            other => Self::AttestationInvalid(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
