//! Keel kubehub: the kube side of keel.
//!
//! The `CachedImage` CRD, a [`ResourceStore`] over nodes and declarations,
//! pull secret access for the keyring, and the watchers that feed replica
//! membership and pass triggers.

#![forbid(unsafe_code)]

pub mod crd;
pub mod node;
mod secrets;
pub mod selector;
mod store;
pub mod watch;

use kube::Client;
use tracing::info;

pub use crd::{CachedImage, CachedImageSpec, CachedImageStatus, ImageSummary, PullSecret, FINALIZER};
pub use node::{machine_view, machine_view_with, readiness, reported_images};
pub use secrets::KubeSecrets;
pub use selector::to_core_selector;
pub use store::{KubeStore, MachineLister, ResourceStore, StoreError};
pub use watch::{membership_event, watch_declarations, watch_members};

/// Client from the in-cluster environment or the local kubeconfig.
pub async fn get_kube_client() -> Result<Client, StoreError> {
    let client = Client::try_default().await.map_err(StoreError::Kube)?;
    info!(version = ?client.apiserver_version().await.ok().map(|v| v.git_version), "kube client ready");
    Ok(client)
}
