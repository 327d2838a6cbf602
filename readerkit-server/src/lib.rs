#![deny(clippy::all)]
#![warn(clippy::pedantic)]
//! The reader backend: a stateless-over-storage protocol handler that
//! attests reader devices, certifies batches of ephemeral reader keys under
//! a trusted reader root, and distributes a versioned issuer trust list.
//!
//! Handlers live in [`backend::ReaderBackend`]; the thin HTTP surface is in
//! `src/main.rs`.

pub mod backend;
pub mod error;
pub mod root;
pub mod settings;

pub use backend::ReaderBackend;
pub use error::BackendError;
pub use settings::BackendSettings;
