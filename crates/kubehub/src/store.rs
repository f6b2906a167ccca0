//! Reads and writes against the cluster, behind traits the controllers test against.

use std::time::Instant;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use keel_core::{LabelDelta, LabelSelector, MachineView};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use metrics::{counter, histogram};
use serde_json::json;
use tracing::debug;

use crate::crd::{CachedImage, CachedImageStatus};
use crate::node::machine_view;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("kube api: {0}")]
    Kube(#[source] kube::Error),
    #[error("conflicting update of {0}")]
    Conflict(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("serializing: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("{object} is missing {field}")]
    MissingField { object: String, field: &'static str },
}

impl StoreError {
    fn from_kube(err: kube::Error, object: &str) -> Self {
        match &err {
            kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(object.to_string()),
            kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(object.to_string()),
            _ => StoreError::Kube(err),
        }
    }

    pub fn is_conflict(&self) -> bool { matches!(self, StoreError::Conflict(_)) }
}

/// Narrow view used by the deletion coordinator.
#[async_trait]
pub trait MachineLister: Send + Sync {
    /// Machines whose labels match `selector`, as seen by the store.
    async fn list_machines(&self, selector: &LabelSelector) -> Result<Vec<MachineView>, StoreError>;
}

#[async_trait]
pub trait ResourceStore: MachineLister {
    async fn list_declarations(&self) -> Result<Vec<CachedImage>, StoreError>;
    async fn get_node(&self, name: &str) -> Result<Node, StoreError>;
    async fn patch_node_labels(&self, name: &str, delta: &LabelDelta) -> Result<(), StoreError>;
    /// Replace the finalizer list, failing with `Conflict` if the declaration changed since read.
    async fn set_finalizers(&self, declaration: &CachedImage, finalizers: Vec<String>) -> Result<(), StoreError>;
    async fn patch_status(&self, name: &str, status: &CachedImageStatus) -> Result<(), StoreError>;
}

/// [`ResourceStore`] over the kube API.
#[derive(Clone)]
pub struct KubeStore {
    nodes: Api<Node>,
    declarations: Api<CachedImage>,
}

impl KubeStore {
    pub fn new(client: Client) -> Self { Self { nodes: Api::all(client.clone()), declarations: Api::all(client) } }
}

#[async_trait]
impl MachineLister for KubeStore {
    async fn list_machines(&self, selector: &LabelSelector) -> Result<Vec<MachineView>, StoreError> {
        let started = Instant::now();
        let mut lp = ListParams::default();
        if !selector.is_everything() {
            lp = lp.labels(&selector.to_string());
        }
        let list = self.nodes.list(&lp).await.map_err(|e| StoreError::from_kube(e, "nodes"))?;
        histogram!("keel_store_list_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(selector = %selector, count = list.items.len(), "listed nodes");
        Ok(list.items.iter().map(machine_view).collect())
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn list_declarations(&self) -> Result<Vec<CachedImage>, StoreError> {
        let list = self.declarations.list(&ListParams::default()).await.map_err(|e| StoreError::from_kube(e, "cachedimages"))?;
        Ok(list.items)
    }

    async fn get_node(&self, name: &str) -> Result<Node, StoreError> {
        self.nodes.get(name).await.map_err(|e| StoreError::from_kube(e, &format!("node/{}", name)))
    }

    async fn patch_node_labels(&self, name: &str, delta: &LabelDelta) -> Result<(), StoreError> {
        if delta.is_empty() {
            return Ok(());
        }
        let patch = delta.to_merge_patch();
        self.nodes
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| StoreError::from_kube(e, &format!("node/{}", name)))?;
        counter!("keel_labels_patched_total", (delta.set.len() + delta.remove.len()) as u64);
        debug!(node = name, set = delta.set.len(), removed = delta.remove.len(), "node labels patched");
        Ok(())
    }

    async fn set_finalizers(&self, declaration: &CachedImage, finalizers: Vec<String>) -> Result<(), StoreError> {
        let name = declaration.name_any();
        let rv = declaration
            .resource_version()
            .ok_or_else(|| StoreError::MissingField { object: format!("cachedimage/{}", name), field: "metadata.resourceVersion" })?;
        let patch = json!({ "metadata": { "resourceVersion": rv, "finalizers": finalizers } });
        self.declarations
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| StoreError::from_kube(e, &format!("cachedimage/{}", name)))?;
        Ok(())
    }

    async fn patch_status(&self, name: &str, status: &CachedImageStatus) -> Result<(), StoreError> {
        let patch = json!({ "status": serde_json::to_value(status)? });
        self.declarations
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| StoreError::from_kube(e, &format!("cachedimage/{}", name)))?;
        Ok(())
    }
}
