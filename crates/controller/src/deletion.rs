//! Finalizer protocol: a declaration goes away only once no machine in its
//! scope still carries a label for any image it alone declares.

use keel_core::label_key;
use keel_kubehub::{CachedImage, ResourceStore, FINALIZER};
use kube::ResourceExt;
use metrics::counter;
use tracing::{debug, info};

use crate::converge::Declared;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finalize {
    /// The marker was just added.
    Added,
    /// Active declaration with its marker in place.
    Ready,
    /// Deleting, but `remaining` machine labels still hold it.
    Deferred { remaining: usize },
    /// Marker removed (or never there); deletion can complete.
    Removed,
}

/// Advance `declaration` one step through the finalizer protocol.
///
/// `all` is the prepared set of every declaration. A labelled machine in scope
/// blocks removal unless another active declaration declares the same image
/// and selects that machine. Store errors propagate and never remove the
/// marker.
pub async fn finalize<S>(store: &S, declaration: &CachedImage, all: &[Declared]) -> Result<Finalize>
where
    S: ResourceStore + ?Sized,
{
    let name = declaration.name_any();
    let has = declaration.has_finalizer();
    if !declaration.is_deleting() {
        if has {
            return Ok(Finalize::Ready);
        }
        let mut finalizers = declaration.finalizers().to_vec();
        finalizers.push(FINALIZER.to_string());
        store.set_finalizers(declaration, finalizers).await?;
        info!(declaration = %name, "finalizer added");
        return Ok(Finalize::Added);
    }
    if !has {
        return Ok(Finalize::Removed);
    }

    let me = Declared::from_resource(declaration)?;
    let mut remaining = 0usize;
    for image in &me.images {
        let selector = me.selector.and_exists(&label_key(&image.hash));
        let holders = store.list_machines(&selector).await?;
        // A machine another active declaration still selects for this image
        // keeps its label for that declaration.
        let blocking = holders
            .iter()
            .filter(|m| !all.iter().any(|d| d.name != me.name && d.is_active() && d.declares(&image.hash) && d.selector.matches(&m.labels)))
            .count();
        if blocking < holders.len() {
            debug!(declaration = %name, image = %image.name(), shared = holders.len() - blocking, "labels held by other declarations");
        }
        if blocking > 0 {
            debug!(declaration = %name, image = %image.name(), machines = blocking, "labels remain");
        }
        remaining += blocking;
    }
    if remaining > 0 {
        counter!("keel_finalizer_deferred_total", 1u64);
        return Ok(Finalize::Deferred { remaining });
    }

    let finalizers: Vec<String> = declaration.finalizers().iter().filter(|f| *f != FINALIZER).cloned().collect();
    store.set_finalizers(declaration, finalizers).await?;
    info!(declaration = %name, "finalizer removed");
    Ok(Finalize::Removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converge::prepare;
    use crate::testing::{declaration, deleting, node, MemoryStore};
    use crate::ControllerError;
    use keel_core::ImageRef;

    fn key(image: &str) -> String { label_key(&ImageRef::parse(image).unwrap().identity()) }

    fn in_pool(mut ci: keel_kubehub::CachedImage, pool: &str) -> keel_kubehub::CachedImage {
        ci.spec.node_selector = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector {
            match_labels: Some([("pool".to_string(), pool.to_string())].into_iter().collect()),
            match_expressions: None,
        });
        ci
    }

    async fn step(store: &MemoryStore, name: &str) -> Result<Finalize> {
        let all = prepare(&store.list_declarations().await?)?;
        finalize(store, &store.declaration(name), &all).await
    }

    #[tokio::test]
    async fn marker_is_added_once() {
        let store = MemoryStore::with(vec![], vec![declaration("web", &["nginx:1.25"])]);
        assert_eq!(step(&store, "web").await.unwrap(), Finalize::Added);
        assert!(store.declaration("web").has_finalizer());
        assert_eq!(step(&store, "web").await.unwrap(), Finalize::Ready);
    }

    #[tokio::test]
    async fn two_labelled_machines_gate_removal() {
        let k = key("nginx:1.25");
        let store = MemoryStore::with(
            vec![node("n1", &[(k.as_str(), "deleting")], &[]), node("n2", &[(k.as_str(), "available")], &[])],
            vec![declaration("web", &["nginx:1.25"])],
        );
        step(&store, "web").await.unwrap();
        store.put_declaration(deleting(store.declaration("web")));

        assert_eq!(step(&store, "web").await.unwrap(), Finalize::Deferred { remaining: 2 });
        store.set_label("n1", &k, None);
        assert_eq!(step(&store, "web").await.unwrap(), Finalize::Deferred { remaining: 1 });
        assert!(store.declaration("web").has_finalizer());
        store.set_label("n2", &k, None);
        assert_eq!(step(&store, "web").await.unwrap(), Finalize::Removed);
        assert!(!store.declaration("web").has_finalizer());
    }

    #[tokio::test]
    async fn images_shared_with_active_declarations_do_not_block() {
        let k = key("nginx:1.25");
        let store = MemoryStore::with(
            vec![node("n1", &[(k.as_str(), "available")], &[])],
            vec![declaration("web", &["nginx:1.25"]), declaration("also", &["nginx:1.25"])],
        );
        step(&store, "web").await.unwrap();
        store.put_declaration(deleting(store.declaration("web")));
        assert_eq!(step(&store, "web").await.unwrap(), Finalize::Removed);
    }

    #[tokio::test]
    async fn shared_image_with_disjoint_selector_still_blocks() {
        let k = key("nginx:1.25");
        let store = MemoryStore::with(
            vec![
                node("gpu-1", &[(k.as_str(), "available"), ("pool", "gpu")], &[]),
                node("cpu-1", &[(k.as_str(), "available"), ("pool", "cpu")], &[]),
            ],
            vec![in_pool(declaration("web", &["nginx:1.25"]), "gpu"), in_pool(declaration("also", &["nginx:1.25"]), "cpu")],
        );
        step(&store, "web").await.unwrap();
        store.put_declaration(deleting(store.declaration("web")));

        assert_eq!(step(&store, "web").await.unwrap(), Finalize::Deferred { remaining: 1 });
        assert!(store.declaration("web").has_finalizer());
        store.set_label("gpu-1", &k, None);
        assert_eq!(step(&store, "web").await.unwrap(), Finalize::Removed);
    }

    #[tokio::test]
    async fn store_errors_keep_the_marker() {
        let k = key("nginx:1.25");
        let store = MemoryStore::with(vec![node("n1", &[(k.as_str(), "deleting")], &[])], vec![declaration("web", &["nginx:1.25"])]);
        step(&store, "web").await.unwrap();
        store.put_declaration(deleting(store.declaration("web")));
        *store.fail_lists.lock().unwrap() = true;
        assert!(matches!(step(&store, "web").await, Err(ControllerError::Store(_))));
        assert!(store.declaration("web").has_finalizer());
    }

    #[tokio::test]
    async fn stale_resource_version_conflicts() {
        let store = MemoryStore::with(vec![], vec![declaration("web", &["nginx:1.25"])]);
        let stale = store.declaration("web");
        step(&store, "web").await.unwrap();
        let err = store.set_finalizers(&stale, vec![]).await.unwrap_err();
        assert!(err.is_conflict());
    }
}
