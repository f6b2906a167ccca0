//! Watch wiring: replica membership from pods, and declaration change triggers.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use keel_shard::MembershipEvent;
use kube::api::Api;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Client, ResourceExt};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::crd::CachedImage;

fn is_member(pod: &Pod) -> bool { pod.metadata.name.is_some() && pod.metadata.deletion_timestamp.is_none() }

/// Map one pod watch event to a ring change. Updates of live pods are no-ops
/// for the ring, so they come back as `Joined` which the ring ignores.
pub fn membership_event(event: Event<Pod>) -> Option<MembershipEvent> {
    match event {
        Event::Applied(p) if is_member(&p) => Some(MembershipEvent::Joined(p.name_any())),
        Event::Applied(p) => p.metadata.name.map(MembershipEvent::Left),
        Event::Deleted(p) => p.metadata.name.map(MembershipEvent::Left),
        Event::Restarted(pods) => {
            Some(MembershipEvent::Resync(pods.iter().filter(|p| is_member(p)).map(|p| p.name_any()).collect()))
        }
    }
}

/// Watch pods matching `selector` in `namespace` and forward membership
/// changes until cancelled.
pub async fn watch_members(
    client: Client,
    namespace: String,
    selector: String,
    tx: mpsc::Sender<MembershipEvent>,
    cancel: CancellationToken,
) {
    let api: Api<Pod> = Api::namespaced(client, &namespace);
    let cfg = watcher::Config::default().labels(&selector);
    let stream = watcher::watcher(api, cfg).default_backoff();
    futures::pin_mut!(stream);
    info!(namespace = %namespace, selector = %selector, "member watcher started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            ev = stream.next() => match ev {
                Some(Ok(ev)) => {
                    if let Some(change) = membership_event(ev) {
                        debug!(?change, "membership change");
                        if tx.send(change).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Err(e)) => warn!(error = %e, "member watch error"),
                None => break,
            },
        }
    }
    info!("member watcher stopped");
}

/// Wake `trigger` whenever any declaration changes, until cancelled.
pub async fn watch_declarations(client: Client, trigger: Arc<Notify>, cancel: CancellationToken) {
    let api: Api<CachedImage> = Api::all(client);
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    info!("declaration watcher started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            ev = stream.next() => match ev {
                Some(Ok(Event::Restarted(list))) => {
                    debug!(count = list.len(), "watch restart");
                    trigger.notify_one();
                }
                Some(Ok(_)) => trigger.notify_one(),
                Some(Err(e)) => warn!(error = %e, "declaration watch error"),
                None => break,
            },
        }
    }
    info!("declaration watcher stopped");
}
