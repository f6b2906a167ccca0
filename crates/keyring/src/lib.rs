//! Keel keyring: registry credentials resolved from referenced pull secrets.

#![forbid(unsafe_code)]

pub mod dockercfg;
mod keyring;
mod sync;

pub use keyring::{CredentialKeyring, SecretRef, SecretSource};
pub use sync::KeyringSync;

#[derive(Debug, thiserror::Error)]
pub enum KeyringError {
    #[error("fetching secret {secret}: {message}")]
    Fetch { secret: String, message: String },
    #[error("decoding secret {secret}: {message}")]
    Decode { secret: String, message: String },
    #[error("keyring references kept changing over {rounds} rebuilds")]
    Unsettled { rounds: usize },
    #[error(transparent)]
    InvalidImage(#[from] keel_core::ImageRefError),
}
