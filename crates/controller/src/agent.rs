//! Machine-side agent: converges this node's labels against the runtime's
//! image list and feeds pulls and removals to the execution engine.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use keel_core::{IdentityHash, ImageState, WorkItem};
use keel_exec::{CrictlRuntime, Engine, Executor, Outcome, RuntimeClient};
use keel_keyring::{CredentialKeyring, KeyringSync, SecretSource};
use keel_kubehub::{machine_view_with, watch_declarations, KubeSecrets, KubeStore, ResourceStore};
use kube::Client;
use metrics::counter;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::converge::{desired_for, prepare, Declared, LabelPlan};
use crate::error::Result;
use crate::pass_loop::PassLoop;

/// One pass worth of decisions for the local node.
#[derive(Debug, Clone)]
pub struct AgentPlan {
    pub node: String,
    pub labels: LabelPlan,
    pub work: Vec<WorkItem>,
}

pub struct Agent<S: SecretSource + 'static> {
    config: AgentConfig,
    store: Arc<dyn ResourceStore>,
    runtime: Arc<dyn RuntimeClient>,
    keyring: Arc<CredentialKeyring<S>>,
    sync: Mutex<KeyringSync>,
    engine: Arc<Engine>,
}

impl<S: SecretSource + 'static> Agent<S> {
    pub fn new(
        config: AgentConfig,
        store: Arc<dyn ResourceStore>,
        runtime: Arc<dyn RuntimeClient>,
        keyring: Arc<CredentialKeyring<S>>,
        engine: Arc<Engine>,
    ) -> Self {
        Self { config, store, runtime, keyring, sync: Mutex::new(KeyringSync::new()), engine }
    }

    pub fn engine(&self) -> &Arc<Engine> { &self.engine }

    fn sync_keyring(&self, declared: &[Declared]) {
        let current: BTreeMap<_, _> =
            declared.iter().filter(|d| d.is_active()).map(|d| (d.name.clone(), d.secrets.clone())).collect();
        let mut sync = self.sync.lock().unwrap_or_else(PoisonError::into_inner);
        sync.replace_all(&self.keyring, current);
    }

    /// Compute this node's next labels and the runtime work behind them.
    /// `None` when the node is not ready.
    pub async fn plan(&self) -> Result<Option<AgentPlan>> {
        let node = self.store.get_node(&self.config.node).await?;
        let declared = prepare(&self.store.list_declarations().await?)?;
        self.sync_keyring(&declared);

        let inventory = self.runtime.list_images().await?;
        let view = machine_view_with(&node, inventory.iter().flat_map(|i| i.repo_tags.iter().map(String::as_str)));
        if !view.is_ready() {
            debug!(node = %view.name, "node not ready; skipping pass");
            return Ok(None);
        }

        let desired = desired_for(&view.labels, &declared);
        let labels = LabelPlan::for_machine(&view, &desired, &view.images);

        let pending: Vec<IdentityHash> = labels.in_state(ImageState::Pending).cloned().collect();
        let mut work = Vec::new();
        for hash in &pending {
            let Some(image) = desired.get(hash) else { continue };
            match self.keyring.lookup(image).await {
                Ok((creds, _)) => work.push(WorkItem::pull(image.clone(), creds)),
                Err(e) => warn!(image = %image, error = %e, "credential lookup failed; pull deferred"),
            }
        }
        for hash in labels.in_state(ImageState::Deleting) {
            if let Some(image) = view.images.get(hash) {
                work.push(WorkItem::remove(image.clone()));
            }
        }
        Ok(Some(AgentPlan { node: view.name, labels, work }))
    }

    /// Patch labels, then hand the work to the engine.
    pub async fn pass(&self) -> Result<()> {
        let Some(plan) = self.plan().await? else { return Ok(()) };
        if !plan.labels.delta.is_empty() {
            self.store.patch_node_labels(&plan.node, &plan.labels.delta).await?;
        }
        let queued = plan.work.len();
        for item in plan.work {
            self.engine.enqueue(item).await?;
        }
        if queued > 0 {
            counter!("keel_agent_work_queued_total", queued as u64);
            debug!(node = %plan.node, queued, "work queued");
        }
        Ok(())
    }

    /// Remove every image whose label says `deleting` and that the runtime
    /// still reports, independent of the convergence pass.
    pub async fn cleanup(&self) -> Result<usize> {
        let node = self.store.get_node(&self.config.node).await?;
        let inventory = self.runtime.list_images().await?;
        let view = machine_view_with(&node, inventory.iter().flat_map(|i| i.repo_tags.iter().map(String::as_str)));
        let mut removed = 0;
        for hash in view.labelled(ImageState::Deleting) {
            let Some(image) = view.images.get(&hash) else { continue };
            self.engine.enqueue(WorkItem::remove(image.clone())).await?;
            removed += 1;
        }
        if removed > 0 {
            info!(node = %view.name, removed, "cleanup sweep queued removals");
        }
        Ok(removed)
    }

    /// Run the convergence and cleanup loops until cancelled, then drain the engine.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken, trigger: Arc<Notify>) {
        let converge = PassLoop::new("agent", self.config.interval).with_trigger(trigger);
        let sweep = PassLoop::new("cleanup", self.config.cleanup_interval);
        tokio::join!(
            converge.run(cancel.clone(), || {
                let agent = self.clone();
                async move { agent.pass().await }
            }),
            sweep.run(cancel.clone(), || {
                let agent = self.clone();
                async move { agent.cleanup().await.map(|_| ()) }
            }),
        );
        self.engine.shutdown().await;
    }
}

/// Wake the convergence loop whenever an operation lands, so labels catch up
/// without waiting for the next tick.
pub async fn follow_outcomes(mut rx: mpsc::UnboundedReceiver<Outcome>, trigger: Arc<Notify>) {
    while let Some(outcome) = rx.recv().await {
        if outcome.is_success() {
            debug!(image = %outcome.image, op = %outcome.operation, "operation landed");
            trigger.notify_one();
        }
    }
}

/// Wire the agent against the cluster and the local runtime, and run it.
pub async fn run_agent(client: Client, config: AgentConfig, cancel: CancellationToken) -> Result<()> {
    let config = config.validate()?;
    let runtime: Arc<dyn RuntimeClient> =
        Arc::new(CrictlRuntime::new(config.crictl.clone(), config.runtime_endpoint.clone(), cancel.child_token()));
    let (tx, rx) = mpsc::unbounded_channel();
    let engine = Engine::start(Executor::for_runtime(runtime.clone(), config.engine.wait), &config.engine, Some(tx));
    let keyring = Arc::new(CredentialKeyring::new(KubeSecrets::new(client.clone())));
    let store: Arc<dyn ResourceStore> = Arc::new(KubeStore::new(client.clone()));
    let trigger = Arc::new(Notify::new());

    info!(node = %config.node, "agent starting");
    let agent = Arc::new(Agent::new(config, store, runtime, keyring, engine));
    tokio::spawn(watch_declarations(client, trigger.clone(), cancel.clone()));
    tokio::spawn(follow_outcomes(rx, trigger.clone()));
    agent.run(cancel, trigger).await;
    info!("agent stopped");
    Ok(())
}
