use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use keel_core::{Credential, Credentials, ImageRef};
use metrics::counter;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::dockercfg::parse_secret_data;
use crate::KeyringError;

/// Rebuild attempts per lookup when references keep changing under it.
const MAX_REBUILD_ROUNDS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SecretRef {
    pub namespace: String,
    pub name: String,
}

impl SecretRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}/{}", self.namespace, self.name) }
}

/// Where secret content comes from (the cluster, or a fake in tests).
#[async_trait::async_trait]
pub trait SecretSource: Send + Sync {
    async fn fetch(&self, secret: &SecretRef) -> Result<BTreeMap<String, Vec<u8>>, KeyringError>;
}

#[derive(Debug, Default)]
struct Entry {
    refs: usize,
    /// `None` until fetched, and again after a new reference marks it stale.
    material: Option<Arc<Vec<Credential>>>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: BTreeMap<SecretRef, Entry>,
    index: FxHashMap<String, Vec<Credential>>,
    dirty: bool,
    generation: u64,
}

impl Inner {
    fn rebuild_index(&mut self) {
        let mut index: FxHashMap<String, Vec<Credential>> = FxHashMap::default();
        for entry in self.entries.values() {
            if let Some(material) = &entry.material {
                for cred in material.iter() {
                    index.entry(cred.registry.clone()).or_default().push(cred.clone());
                }
            }
        }
        self.index = index;
    }

    fn answer(&self, registry: &str) -> Credentials {
        self.index.get(registry).map(|v| v.iter().cloned().collect()).unwrap_or_default()
    }
}

/// Reference-counted cache of registry credentials from referenced secrets.
///
/// Any `add`/`remove` marks the keyring dirty; the next `lookup` rebuilds the
/// whole index, fetching only secrets whose material is stale. The lock is
/// never held across a fetch.
pub struct CredentialKeyring<S> {
    source: S,
    inner: Mutex<Inner>,
}

impl<S: SecretSource> CredentialKeyring<S> {
    pub fn new(source: S) -> Self {
        Self { source, inner: Mutex::new(Inner::default()) }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> { self.inner.lock().unwrap_or_else(PoisonError::into_inner) }

    pub fn add<'a>(&self, secrets: impl IntoIterator<Item = &'a SecretRef>) {
        let mut inner = self.lock();
        for s in secrets {
            let entry = inner.entries.entry(s.clone()).or_default();
            entry.refs += 1;
            entry.material = None;
            debug!(secret = %s, refs = entry.refs, "keyring reference added");
        }
        inner.dirty = true;
        inner.generation += 1;
    }

    pub fn remove<'a>(&self, secrets: impl IntoIterator<Item = &'a SecretRef>) {
        let mut inner = self.lock();
        for s in secrets {
            let gone = match inner.entries.get_mut(s) {
                Some(entry) => {
                    entry.refs = entry.refs.saturating_sub(1);
                    entry.refs == 0
                }
                None => {
                    debug!(secret = %s, "remove of unreferenced secret ignored");
                    continue;
                }
            };
            if gone {
                inner.entries.remove(s);
                debug!(secret = %s, "keyring entry dropped");
            }
        }
        inner.dirty = true;
        inner.generation += 1;
    }

    pub fn references(&self, secret: &SecretRef) -> usize {
        self.lock().entries.get(secret).map(|e| e.refs).unwrap_or(0)
    }

    pub fn is_dirty(&self) -> bool { self.lock().dirty }

    /// Candidate credentials for `image`, and whether any were found.
    ///
    /// Fails with [`KeyringError::Unsettled`] when references still change
    /// after `MAX_REBUILD_ROUNDS` rebuilds; the keyring stays dirty.
    pub async fn lookup(&self, image: &str) -> Result<(Credentials, bool), KeyringError> {
        let registry = ImageRef::parse(image)?.registry().to_string();

        for _ in 0..MAX_REBUILD_ROUNDS {
            let (stale, generation) = {
                let inner = self.lock();
                if !inner.dirty {
                    let creds = inner.answer(&registry);
                    let found = !creds.is_empty();
                    return Ok((creds, found));
                }
                let stale: Vec<SecretRef> =
                    inner.entries.iter().filter(|(_, e)| e.material.is_none()).map(|(k, _)| k.clone()).collect();
                (stale, inner.generation)
            };

            let mut fetched = Vec::with_capacity(stale.len());
            for secret in &stale {
                let data = match self.source.fetch(secret).await {
                    Ok(d) => d,
                    Err(e) => {
                        counter!("keel_keyring_fetch_errors_total", 1u64);
                        warn!(secret = %secret, error = %e, "keyring rebuild aborted");
                        return Err(e);
                    }
                };
                let creds = parse_secret_data(&data)
                    .map_err(|message| KeyringError::Decode { secret: secret.to_string(), message })?;
                fetched.push((secret.clone(), Arc::new(creds)));
            }

            let mut inner = self.lock();
            if inner.generation != generation {
                debug!("keyring references changed during rebuild; retrying");
                continue;
            }
            for (secret, material) in fetched {
                if let Some(entry) = inner.entries.get_mut(&secret) {
                    entry.material = Some(material);
                }
            }
            inner.rebuild_index();
            inner.dirty = false;
            counter!("keel_keyring_rebuilds_total", 1u64);
            let creds = inner.answer(&registry);
            let found = !creds.is_empty();
            return Ok((creds, found));
        }

        // Never answer from a dirty index; the caller retries on its next pass.
        counter!("keel_keyring_fetch_errors_total", 1u64);
        warn!(rounds = MAX_REBUILD_ROUNDS, "keyring references still changing; lookup abandoned");
        Err(KeyringError::Unsettled { rounds: MAX_REBUILD_ROUNDS })
    }
}
