#![deny(clippy::all)]
#![warn(clippy::pedantic)]
//! Reader credential lifecycle for mdoc identity readers.
//!
//! This crate contains the client half of the reader backend protocol: the
//! certified-key pool manager ([`backend_client::ReaderBackendClient`]), the
//! wire shapes ([`protocol`]), the storage and secure-key-store abstractions,
//! the device attestation/assertion interfaces, the transport layer, and the
//! issuer trust manager. The server half lives in `readerkit-server`.

pub mod attestation;
pub mod backend_client;
pub mod clock;
pub mod error;
pub mod protocol;
pub mod secure_area;
pub mod storage;
pub mod transport;
pub mod trust;

pub use backend_client::ReaderBackendClient;
pub use error::ReaderKitError;
