use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use keel_keyring::{KeyringError, SecretRef, SecretSource};
use kube::api::Api;
use kube::Client;

/// Pull secrets read straight from the API server.
#[derive(Clone)]
pub struct KubeSecrets {
    client: Client,
}

impl KubeSecrets {
    pub fn new(client: Client) -> Self { Self { client } }
}

#[async_trait]
impl SecretSource for KubeSecrets {
    async fn fetch(&self, secret: &SecretRef) -> Result<BTreeMap<String, Vec<u8>>, KeyringError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &secret.namespace);
        let s = api
            .get(&secret.name)
            .await
            .map_err(|e| KeyringError::Fetch { secret: secret.to_string(), message: e.to_string() })?;
        Ok(s.data.unwrap_or_default().into_iter().map(|(k, v)| (k, v.0)).collect())
    }
}
