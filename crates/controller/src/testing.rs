//! In-memory collaborators for unit tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ContainerImage, Node, NodeCondition, NodeStatus};
use keel_core::{LabelDelta, LabelSelector, MachineView};
use keel_kubehub::{machine_view, CachedImage, CachedImageSpec, CachedImageStatus, MachineLister, PullSecret, ResourceStore, StoreError};
use kube::core::ObjectMeta;
use kube::ResourceExt;

pub(crate) fn node(name: &str, labels: &[(&str, &str)], images: &[&str]) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.into()),
            labels: Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
            ..Default::default()
        },
        spec: None,
        status: Some(NodeStatus {
            conditions: Some(vec![NodeCondition { type_: "Ready".into(), status: "True".into(), ..Default::default() }]),
            images: Some(vec![ContainerImage { names: Some(images.iter().map(|s| s.to_string()).collect()), size_bytes: None }]),
            ..Default::default()
        }),
    }
}

pub(crate) fn declaration(name: &str, images: &[&str]) -> CachedImage {
    let mut ci = CachedImage::new(name, CachedImageSpec { images: images.iter().map(|s| s.to_string()).collect(), ..Default::default() });
    ci.metadata.resource_version = Some("1".into());
    ci
}

pub(crate) fn with_secret(mut ci: CachedImage, namespace: &str, name: &str) -> CachedImage {
    ci.spec.pull_secrets.push(PullSecret { name: name.into(), namespace: namespace.into() });
    ci
}

pub(crate) fn deleting(mut ci: CachedImage) -> CachedImage {
    ci.metadata.deletion_timestamp = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()));
    ci
}

#[derive(Default)]
pub(crate) struct MemoryStore {
    pub nodes: Mutex<BTreeMap<String, Node>>,
    pub declarations: Mutex<BTreeMap<String, CachedImage>>,
    pub statuses: Mutex<BTreeMap<String, CachedImageStatus>>,
    pub fail_lists: Mutex<bool>,
}

impl MemoryStore {
    pub fn with(nodes: Vec<Node>, declarations: Vec<CachedImage>) -> Self {
        let store = Self::default();
        for n in nodes {
            store.nodes.lock().unwrap().insert(n.name_any(), n);
        }
        for d in declarations {
            store.put_declaration(d);
        }
        store
    }

    pub fn put_declaration(&self, d: CachedImage) { self.declarations.lock().unwrap().insert(d.name_any(), d); }

    pub fn declaration(&self, name: &str) -> CachedImage { self.declarations.lock().unwrap()[name].clone() }

    pub fn labels(&self, node: &str) -> BTreeMap<String, String> { self.nodes.lock().unwrap()[node].labels().clone() }

    pub fn set_label(&self, node: &str, key: &str, value: Option<&str>) {
        let mut nodes = self.nodes.lock().unwrap();
        let labels = nodes.get_mut(node).unwrap().labels_mut();
        match value {
            Some(v) => labels.insert(key.to_string(), v.to_string()),
            None => labels.remove(key),
        };
    }
}

#[async_trait]
impl MachineLister for MemoryStore {
    async fn list_machines(&self, selector: &LabelSelector) -> Result<Vec<MachineView>, StoreError> {
        if *self.fail_lists.lock().unwrap() {
            return Err(StoreError::NotFound("nodes".into()));
        }
        Ok(self.nodes.lock().unwrap().values().filter(|n| selector.matches(n.labels())).map(machine_view).collect())
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn list_declarations(&self) -> Result<Vec<CachedImage>, StoreError> {
        Ok(self.declarations.lock().unwrap().values().cloned().collect())
    }

    async fn get_node(&self, name: &str) -> Result<Node, StoreError> {
        self.nodes.lock().unwrap().get(name).cloned().ok_or_else(|| StoreError::NotFound(format!("node/{}", name)))
    }

    async fn patch_node_labels(&self, name: &str, delta: &LabelDelta) -> Result<(), StoreError> {
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes.get_mut(name).ok_or_else(|| StoreError::NotFound(format!("node/{}", name)))?;
        delta.apply_to(node.labels_mut());
        Ok(())
    }

    async fn set_finalizers(&self, declaration: &CachedImage, finalizers: Vec<String>) -> Result<(), StoreError> {
        let mut decls = self.declarations.lock().unwrap();
        let name = declaration.name_any();
        let stored = decls.get_mut(&name).ok_or_else(|| StoreError::NotFound(name.clone()))?;
        if stored.resource_version() != declaration.resource_version() {
            return Err(StoreError::Conflict(name));
        }
        let next: u64 = stored.resource_version().and_then(|v| v.parse().ok()).unwrap_or(0) + 1;
        stored.metadata.finalizers = Some(finalizers);
        stored.metadata.resource_version = Some(next.to_string());
        Ok(())
    }

    async fn patch_status(&self, name: &str, status: &CachedImageStatus) -> Result<(), StoreError> {
        self.statuses.lock().unwrap().insert(name.to_string(), status.clone());
        Ok(())
    }
}

/// Runtime whose image store is a plain list of tags.
#[derive(Default)]
pub(crate) struct FakeRuntime {
    pub images: Mutex<Vec<String>>,
}

impl FakeRuntime {
    pub fn with(images: &[&str]) -> Self { Self { images: Mutex::new(images.iter().map(|s| s.to_string()).collect()) } }
}

#[async_trait]
impl keel_exec::RuntimeClient for FakeRuntime {
    async fn pull_image(&self, image: &str, _auth: Option<&keel_core::Credential>) -> Result<String, keel_exec::ExecError> {
        self.images.lock().unwrap().push(image.to_string());
        Ok(format!("sha256:{}", image.len()))
    }

    async fn remove_image(&self, image: &str) -> Result<(), keel_exec::ExecError> {
        self.images.lock().unwrap().retain(|i| i != image);
        Ok(())
    }

    async fn list_images(&self) -> Result<Vec<keel_exec::RuntimeImage>, keel_exec::ExecError> {
        Ok(self
            .images
            .lock()
            .unwrap()
            .iter()
            .map(|i| keel_exec::RuntimeImage { id: format!("sha256:{}", i.len()), repo_tags: vec![i.clone()] })
            .collect())
    }
}

/// Registry holding `repository -> tags` for the destination.
#[derive(Default)]
pub(crate) struct FakeRegistry {
    pub tags: Mutex<BTreeMap<String, Vec<String>>>,
    pub copies: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl keel_exec::RegistryClient for FakeRegistry {
    async fn copy(&self, source: &str, destination: &str, _auth: Option<&keel_core::Credential>) -> Result<(), keel_exec::ExecError> {
        self.copies.lock().unwrap().push((source.to_string(), destination.to_string()));
        Ok(())
    }

    async fn list_tags(
        &self,
        _registry: &str,
        repository: &str,
        _auth: Option<&keel_core::Credential>,
    ) -> Result<Vec<String>, keel_exec::ExecError> {
        Ok(self.tags.lock().unwrap().get(repository).cloned().unwrap_or_default())
    }
}

/// Secret source serving one docker config per secret name.
#[derive(Default)]
pub(crate) struct FakeSecrets {
    pub fetches: Mutex<usize>,
}

#[async_trait]
impl keel_keyring::SecretSource for FakeSecrets {
    async fn fetch(&self, secret: &keel_keyring::SecretRef) -> Result<BTreeMap<String, Vec<u8>>, keel_keyring::KeyringError> {
        *self.fetches.lock().unwrap() += 1;
        let body = format!(
            r#"{{"auths":{{"registry.example.com":{{"username":"{}","password":"pw"}}}}}}"#,
            secret.name
        );
        Ok([(keel_keyring::dockercfg::DOCKER_CONFIG_JSON_KEY.to_string(), body.into_bytes())].into_iter().collect())
    }
}
