//! Declaration reconciler: node labels from the declarations' side, status
//! counts, and the finalizer protocol.

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use keel_core::{observed_from_labels, ImageState, LabelSelector, MachineView};
use keel_kubehub::{CachedImage, CachedImageStatus, ImageSummary, KubeStore, ResourceStore};
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;
use crate::converge::{desired_for, prepare, Declared, LabelPlan};
use crate::deletion::{finalize, Finalize};
use crate::error::{ControllerError, Result};

pub struct Context {
    pub store: Arc<dyn ResourceStore>,
    pub config: ControllerConfig,
}

/// Apply the label table to every ready machine using label-reported presence
/// as the observation. Returns the machines with their labels after patching.
pub async fn converge_fleet<S>(store: &S, declared: &[Declared]) -> Result<Vec<MachineView>>
where
    S: ResourceStore + ?Sized,
{
    let mut machines = store.list_machines(&LabelSelector::everything()).await?;
    for m in machines.iter_mut() {
        if !m.is_ready() {
            debug!(node = %m.name, "node not ready; labels left alone");
            continue;
        }
        let desired = desired_for(&m.labels, declared);
        let observed = observed_from_labels(&m.labels);
        let plan = LabelPlan::for_machine(m, &desired, &observed);
        if plan.delta.is_empty() {
            continue;
        }
        store.patch_node_labels(&m.name, &plan.delta).await?;
        plan.delta.apply_to(&mut m.labels);
    }
    Ok(machines)
}

/// Per-image label counts over the machines `me` selects.
pub fn summarize(me: &Declared, machines: &[MachineView]) -> CachedImageStatus {
    let scoped: Vec<&MachineView> = machines.iter().filter(|m| me.selector.matches(&m.labels)).collect();
    let images = me
        .images
        .iter()
        .map(|img| {
            let mut s = ImageSummary { image: img.name(), hash: img.hash.to_string(), ..Default::default() };
            for m in &scoped {
                match m.state_of(&img.hash) {
                    Some(ImageState::Pending) => s.pending += 1,
                    Some(ImageState::Available) => s.available += 1,
                    Some(ImageState::Deleting) => s.deleting += 1,
                    Some(ImageState::Unknown) => s.unknown += 1,
                    None => {}
                }
            }
            s
        })
        .collect();
    CachedImageStatus { images, nodes: scoped.len() as u32, last_reconciled: Some(Utc::now()) }
}

pub async fn reconcile(declaration: Arc<CachedImage>, ctx: Arc<Context>) -> Result<Action> {
    let store = ctx.store.as_ref();
    let name = declaration.name_any();
    let all = store.list_declarations().await?;
    let declared = prepare(&all)?;

    if !declaration.is_deleting() {
        // The marker goes on before any label is written for this declaration.
        if finalize(store, &declaration, &declared).await? == Finalize::Added {
            return Ok(Action::await_change());
        }
    }

    let machines = converge_fleet(store, &declared).await?;

    if declaration.is_deleting() {
        return match finalize(store, &declaration, &declared).await? {
            Finalize::Deferred { remaining } => {
                info!(declaration = %name, remaining, "waiting for nodes to drop labels");
                Ok(Action::requeue(ctx.config.deletion_requeue))
            }
            _ => Ok(Action::await_change()),
        };
    }

    let Some(me) = declared.iter().find(|d| d.name == name) else {
        return Ok(Action::await_change());
    };
    let status = summarize(me, &machines);
    store.patch_status(&name, &status).await?;
    debug!(declaration = %name, nodes = status.nodes, "status updated");
    Ok(Action::requeue(ctx.config.resync))
}

pub fn error_policy(declaration: Arc<CachedImage>, error: &ControllerError, ctx: Arc<Context>) -> Action {
    warn!(declaration = %declaration.name_any(), error = %error, "reconcile failed");
    Action::requeue(ctx.config.error_backoff)
}

/// Run the declaration controller until `cancel` fires.
pub async fn run(client: Client, config: ControllerConfig, cancel: CancellationToken) {
    let ctx = Arc::new(Context { store: Arc::new(KubeStore::new(client.clone())), config });
    let api: Api<CachedImage> = Api::all(client);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        cancel.cancelled().await;
        let _ = stop_tx.send(());
    });
    info!("declaration controller starting");
    Controller::new(api, watcher::Config::default())
        .graceful_shutdown_on(async move {
            let _ = stop_rx.await;
        })
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!(declaration = %obj.name, "reconciled"),
                Err(e) => warn!(error = %e, "reconcile failed"),
            }
        })
        .await;
    info!("declaration controller stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{declaration, deleting, node, MemoryStore};
    use keel_core::{label_key, ImageRef};
    use std::time::Duration;

    fn key(image: &str) -> String { label_key(&ImageRef::parse(image).unwrap().identity()) }

    fn ctx(store: Arc<MemoryStore>) -> Arc<Context> { Arc::new(Context { store, config: ControllerConfig::default() }) }

    async fn reconcile_named(store: &Arc<MemoryStore>, name: &str) -> Action {
        reconcile(Arc::new(store.declaration(name)), ctx(store.clone())).await.unwrap()
    }

    #[tokio::test]
    async fn lifecycle_from_declare_to_finalize() {
        let k = key("nginx:1.25");
        let store = Arc::new(MemoryStore::with(
            vec![node("n1", &[], &[]), node("n2", &[], &[])],
            vec![declaration("web", &["nginx:1.25"])],
        ));

        // First pass only places the finalizer.
        assert_eq!(reconcile_named(&store, "web").await, Action::await_change());
        assert!(store.labels("n1").is_empty());

        assert_eq!(reconcile_named(&store, "web").await, Action::requeue(Duration::from_secs(60)));
        assert_eq!(store.labels("n1").get(&k).map(String::as_str), Some("pending"));
        let status = store.statuses.lock().unwrap()["web"].clone();
        assert_eq!(status.nodes, 2);
        assert_eq!(status.images[0].pending, 2);

        // The agents confirm presence on both nodes.
        store.set_label("n1", &k, Some("available"));
        store.set_label("n2", &k, Some("available"));

        store.put_declaration(deleting(store.declaration("web")));
        assert_eq!(reconcile_named(&store, "web").await, Action::requeue(Duration::from_secs(10)));
        assert_eq!(store.labels("n1").get(&k).map(String::as_str), Some("deleting"));
        assert!(store.declaration("web").has_finalizer());

        // The agents remove the images and drop the labels.
        store.set_label("n1", &k, None);
        store.set_label("n2", &k, None);
        assert_eq!(reconcile_named(&store, "web").await, Action::await_change());
        assert!(!store.declaration("web").has_finalizer());
    }

    #[tokio::test]
    async fn pending_labels_of_undeclared_images_are_dropped() {
        let stale = key("redis:7");
        let store = Arc::new(MemoryStore::with(
            vec![node("n1", &[(stale.as_str(), "pending"), ("pool", "a")], &[])],
            vec![declaration("web", &["nginx:1.25"])],
        ));
        reconcile_named(&store, "web").await;
        reconcile_named(&store, "web").await;
        let labels = store.labels("n1");
        assert!(!labels.contains_key(&stale));
        assert_eq!(labels.get("pool").map(String::as_str), Some("a"));
    }

    #[tokio::test]
    async fn unknown_is_held() {
        let k = key("nginx:1.25");
        let store = Arc::new(MemoryStore::with(
            vec![node("n1", &[(k.as_str(), "unknown")], &[])],
            vec![declaration("web", &["nginx:1.25"])],
        ));
        reconcile_named(&store, "web").await;
        reconcile_named(&store, "web").await;
        assert_eq!(store.labels("n1").get(&k).map(String::as_str), Some("unknown"));
        assert_eq!(store.statuses.lock().unwrap()["web"].images[0].unknown, 1);
    }

    #[tokio::test]
    async fn error_policy_backs_off() {
        let store = Arc::new(MemoryStore::default());
        let err = ControllerError::Config("x".into());
        let action = error_policy(Arc::new(declaration("web", &[])), &err, ctx(store));
        assert_eq!(action, Action::requeue(Duration::from_secs(30)));
    }
}
