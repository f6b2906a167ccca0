//! `CachedImage`: the cluster-scoped declaration of images to keep on nodes.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector as KubeSelector;
use keel_core::{ImageRefError, ManagedImage, SelectorError};
use keel_keyring::SecretRef;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::selector::to_core_selector;

/// Finalizer guarding a declaration until no node carries its labels.
pub const FINALIZER: &str = "keel.dev/cleanup";

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "keel.dev",
    version = "v1alpha1",
    kind = "CachedImage",
    plural = "cachedimages",
    shortname = "cimg",
    status = "CachedImageStatus",
    printcolumn = r#"{"name":"Nodes","type":"integer","jsonPath":".status.nodes"}"#,
    printcolumn = r#"{"name":"Reconciled","type":"date","jsonPath":".status.lastReconciled"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CachedImageSpec {
    /// Image references to keep cached, e.g. `nginx:1.25`.
    pub images: Vec<String>,
    /// Nodes the images go to; absent means every node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<KubeSelector>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pull_secrets: Vec<PullSecret>,
    /// Also copy the images into the mirror registry.
    #[serde(default)]
    pub mirror: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct PullSecret {
    pub name: String,
    pub namespace: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CachedImageStatus {
    #[serde(default)]
    pub images: Vec<ImageSummary>,
    /// Nodes matched by the selector at the last reconcile.
    #[serde(default)]
    pub nodes: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconciled: Option<DateTime<Utc>>,
}

/// Per-image label counts across the matched nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct ImageSummary {
    pub image: String,
    pub hash: String,
    pub pending: u32,
    pub available: u32,
    pub deleting: u32,
    pub unknown: u32,
}

impl CachedImage {
    /// Parsed images; references that fail to parse come back separately.
    pub fn managed_images(&self) -> (Vec<ManagedImage>, Vec<ImageRefError>) {
        let mut ok = Vec::new();
        let mut bad = Vec::new();
        let mut seen = BTreeSet::new();
        for raw in &self.spec.images {
            match ManagedImage::parse(raw) {
                Ok(m) => {
                    if seen.insert(m.hash.clone()) {
                        ok.push(m);
                    }
                }
                Err(e) => bad.push(e),
            }
        }
        (ok, bad)
    }

    pub fn selector(&self) -> Result<keel_core::LabelSelector, SelectorError> { to_core_selector(self.spec.node_selector.as_ref()) }

    pub fn secret_refs(&self) -> BTreeSet<SecretRef> {
        self.spec.pull_secrets.iter().map(|s| SecretRef::new(&s.namespace, &s.name)).collect()
    }

    pub fn is_deleting(&self) -> bool { self.metadata.deletion_timestamp.is_some() }

    pub fn has_finalizer(&self) -> bool { self.finalizers().iter().any(|f| f == FINALIZER) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ObjectMeta;
    use kube::CustomResourceExt;

    fn decl(images: &[&str]) -> CachedImage {
        let mut ci = CachedImage::new(
            "web",
            CachedImageSpec { images: images.iter().map(|s| s.to_string()).collect(), ..Default::default() },
        );
        ci.metadata = ObjectMeta { name: Some("web".into()), ..Default::default() };
        ci
    }

    #[test]
    fn crd_is_cluster_scoped() {
        let crd = CachedImage::crd();
        assert_eq!(crd.spec.scope, "Cluster");
        assert_eq!(crd.spec.group, "keel.dev");
    }

    #[test]
    fn managed_images_dedupe_and_report_bad_refs() {
        let ci = decl(&["nginx:1.25", "docker.io/library/nginx:1.25", "Bad Ref"]);
        let (ok, bad) = ci.managed_images();
        assert_eq!(ok.len(), 1);
        assert_eq!(bad.len(), 1);
    }

    #[test]
    fn finalizer_and_deletion_flags() {
        let mut ci = decl(&["nginx:1.25"]);
        assert!(!ci.has_finalizer());
        ci.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
        assert!(ci.has_finalizer());
        assert!(!ci.is_deleting());
    }

    #[test]
    fn spec_wire_format() {
        let json = serde_json::json!({
            "images": ["nginx:1.25"],
            "nodeSelector": {"matchLabels": {"pool": "gpu"}},
            "pullSecrets": [{"name": "regcred", "namespace": "default"}]
        });
        let spec: CachedImageSpec = serde_json::from_value(json).unwrap();
        assert!(!spec.mirror);
        assert_eq!(spec.pull_secrets[0].name, "regcred");
    }
}
