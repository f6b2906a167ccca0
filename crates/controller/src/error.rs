use keel_core::SelectorError;
use keel_exec::ExecError;
use keel_keyring::KeyringError;
use keel_kubehub::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Keyring(#[from] KeyringError),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error("declaration {declaration}: {source}")]
    Selector {
        declaration: String,
        #[source]
        source: SelectorError,
    },
}

impl ControllerError {
    pub(crate) fn config(msg: impl Into<String>) -> Self { ControllerError::Config(msg.into()) }
}

pub type Result<T, E = ControllerError> = std::result::Result<T, E>;
