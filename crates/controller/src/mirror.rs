//! Sharded mirror worker: copies declared images into the local registry,
//! each replica handling only the copies it owns on the ring.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};

use keel_core::{Credential, ImageRef, WorkItem};
use keel_exec::{Destination, Engine, Executor, RegistryClient, SemaphoreSet, SkopeoRegistry};
use keel_keyring::{dockercfg, CredentialKeyring, KeyringSync, SecretSource};
use keel_kubehub::{watch_declarations, watch_members, KubeSecrets, KubeStore, ResourceStore};
use keel_shard::{MembershipEvent, RendezvousRing, ShardRouter};
use kube::Client;
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MirrorConfig;
use crate::converge::prepare;
use crate::error::{ControllerError, Result};
use crate::pass_loop::PassLoop;

pub struct Mirror<S: SecretSource + 'static> {
    config: MirrorConfig,
    store: Arc<dyn ResourceStore>,
    registry: Arc<dyn RegistryClient>,
    keyring: Arc<CredentialKeyring<S>>,
    sync: Mutex<KeyringSync>,
    router: Arc<ShardRouter>,
    engine: Arc<Engine>,
}

impl<S: SecretSource + 'static> Mirror<S> {
    pub fn new(
        config: MirrorConfig,
        store: Arc<dyn ResourceStore>,
        registry: Arc<dyn RegistryClient>,
        keyring: Arc<CredentialKeyring<S>>,
        router: Arc<ShardRouter>,
        engine: Arc<Engine>,
    ) -> Self {
        Self { config, store, registry, keyring, sync: Mutex::new(KeyringSync::new()), router, engine }
    }

    pub fn engine(&self) -> &Arc<Engine> { &self.engine }

    /// Copies this replica owns that the destination does not have yet.
    pub async fn plan(&self) -> Result<Vec<WorkItem>> {
        let declared = prepare(&self.store.list_declarations().await?)?;
        let mirrored: Vec<_> = declared.iter().filter(|d| d.is_active() && d.mirror).collect();
        {
            let current = mirrored.iter().map(|d| (d.name.clone(), d.secrets.clone())).collect();
            self.sync.lock().unwrap_or_else(PoisonError::into_inner).replace_all(&self.keyring, current);
        }

        let mut sources: BTreeMap<String, ImageRef> = BTreeMap::new();
        for d in &mirrored {
            for m in &d.images {
                sources.entry(m.name()).or_insert_with(|| m.reference.clone());
            }
        }

        let mut present: FxHashMap<String, Option<BTreeSet<String>>> = FxHashMap::default();
        let mut candidates = Vec::new();
        for (name, source) in sources {
            let Some(tag) = source.tag() else {
                debug!(image = %name, "digest-only reference; not mirrored");
                counter!("keel_mirror_skipped_total", 1u64, "reason" => "digest");
                continue;
            };
            if source.registry() == self.config.registry {
                counter!("keel_mirror_skipped_total", 1u64, "reason" => "local");
                continue;
            }
            let dest = source.rehome(&self.config.registry);
            let repo = dest.repository().to_string();
            if !present.contains_key(&repo) {
                let tags = match self.registry.list_tags(&self.config.registry, &repo, None).await {
                    Ok(t) => Some(t.into_iter().collect()),
                    Err(e) => {
                        warn!(repository = %repo, error = %e, "listing mirror tags failed");
                        None
                    }
                };
                present.insert(repo.clone(), tags);
            }
            match present.get(&repo) {
                Some(Some(tags)) if tags.contains(tag) => {
                    counter!("keel_mirror_skipped_total", 1u64, "reason" => "present");
                    continue;
                }
                Some(Some(_)) => {}
                _ => {
                    counter!("keel_mirror_skipped_total", 1u64, "reason" => "unreachable");
                    continue;
                }
            }
            let creds = match self.keyring.lookup(&name).await {
                Ok((creds, _)) => creds,
                Err(e) => {
                    warn!(image = %name, error = %e, "credential lookup failed; copy deferred");
                    continue;
                }
            };
            candidates.push(WorkItem::copy(name, dest.canonical(), creds));
        }
        Ok(self.router.plan(candidates))
    }

    pub async fn pass(&self) -> Result<()> {
        let work = self.plan().await?;
        let queued = work.len();
        for item in work {
            self.engine.enqueue(item).await?;
        }
        if queued > 0 {
            info!(replica = %self.router.local(), queued, "mirror copies queued");
        }
        Ok(())
    }
}

/// Apply replica membership changes to the router until the sender goes away.
pub async fn follow_membership(router: Arc<ShardRouter>, mut rx: mpsc::Receiver<MembershipEvent>) {
    while let Some(event) = rx.recv().await {
        router.apply(event);
    }
}

/// Credential for the mirror registry from the configured docker config secret.
async fn destination_credential<S: SecretSource>(source: &S, config: &MirrorConfig) -> Result<Option<Credential>> {
    let Some(secret) = &config.registry_secret else { return Ok(None) };
    let data = source.fetch(secret).await?;
    let creds = dockercfg::parse_secret_data(&data)
        .map_err(|message| ControllerError::config(format!("registry secret {}: {}", secret, message)))?;
    let found = creds.into_iter().find(|c| c.registry == config.registry);
    if found.is_none() {
        warn!(secret = %secret, registry = %config.registry, "registry secret has no entry for the mirror registry");
    }
    Ok(found)
}

/// Wire a mirror replica against the cluster and run it until cancelled.
pub async fn run_mirror(client: Client, config: MirrorConfig, cancel: CancellationToken) -> Result<()> {
    let config = config.validate()?;
    let secrets = KubeSecrets::new(client.clone());
    let destination = Destination {
        registry: config.registry.clone(),
        credential: destination_credential(&secrets, &config).await?,
        tls_verify: config.tls_verify,
    };
    let registry: Arc<dyn RegistryClient> =
        Arc::new(SkopeoRegistry::new(config.skopeo.clone(), destination, cancel.child_token()));
    let semaphores = SemaphoreSet::new();
    let router = Arc::new(ShardRouter::new(config.pod.clone(), &config.registry, RendezvousRing::new(), semaphores.clone()));
    let engine = Engine::start(Executor::for_registry(registry.clone()).with_semaphores(semaphores), &config.engine, None);
    let keyring = Arc::new(CredentialKeyring::new(secrets));
    let store: Arc<dyn ResourceStore> = Arc::new(KubeStore::new(client.clone()));

    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(watch_members(client.clone(), config.namespace.clone(), config.member_selector.clone(), tx, cancel.clone()));
    tokio::spawn(follow_membership(router.clone(), rx));
    let trigger = Arc::new(Notify::new());
    tokio::spawn(watch_declarations(client, trigger.clone(), cancel.clone()));

    info!(replica = %config.pod, registry = %config.registry, "mirror starting");
    let passes = PassLoop::new("mirror", config.interval).with_trigger(trigger);
    let mirror = Arc::new(Mirror::new(config, store, registry, keyring, router, engine));
    passes
        .run(cancel, || {
            let mirror = mirror.clone();
            async move { mirror.pass().await }
        })
        .await;
    mirror.engine().shutdown().await;
    info!("mirror stopped");
    Ok(())
}
