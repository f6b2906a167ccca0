use std::sync::{PoisonError, RwLock};

use keel_core::{normalize_registry, ImageRef, Operation, WorkItem};
use keel_exec::SemaphoreSet;
use metrics::{counter, gauge};
use tracing::{debug, info};

use crate::{MembershipRing, RendezvousRing};

/// Replica membership change derived from watching the mirror's own pods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    Joined(String),
    Left(String),
    /// Full membership after a (re)list.
    Resync(Vec<String>),
}

/// Key a mirror copy is sharded on: `<destination registry>/<normalized source>`.
pub fn shard_key(registry: &str, source: &ImageRef) -> String { format!("{}/{}", normalize_registry(registry), source.canonical()) }

/// Filters candidate mirror work down to what this replica owns.
pub struct ShardRouter<R = RendezvousRing> {
    local: String,
    registry: String,
    ring: RwLock<R>,
    semaphores: SemaphoreSet,
}

impl<R: MembershipRing> ShardRouter<R> {
    /// The local replica joins `ring` immediately.
    pub fn new(local: impl Into<String>, registry: &str, mut ring: R, semaphores: SemaphoreSet) -> Self {
        let local = local.into();
        ring.add(&local);
        gauge!("keel_ring_members", ring.len() as f64);
        Self { local, registry: normalize_registry(registry), ring: RwLock::new(ring), semaphores }
    }

    pub fn local(&self) -> &str { &self.local }

    pub fn registry(&self) -> &str { &self.registry }

    pub fn apply(&self, event: MembershipEvent) {
        let mut ring = self.ring.write().unwrap_or_else(PoisonError::into_inner);
        match event {
            MembershipEvent::Joined(m) => {
                if ring.add(&m) {
                    info!(member = %m, "replica joined");
                }
            }
            MembershipEvent::Left(m) => {
                // The local replica never leaves its own ring.
                if m != self.local && ring.remove(&m) {
                    info!(member = %m, "replica left");
                }
            }
            MembershipEvent::Resync(members) => {
                for m in ring.members() {
                    if m != self.local && !members.contains(&m) {
                        ring.remove(&m);
                    }
                }
                for m in &members {
                    ring.add(m);
                }
                info!(members = ring.len(), "replica membership resynced");
            }
        }
        gauge!("keel_ring_members", ring.len() as f64);
    }

    pub fn members(&self) -> Vec<String> { self.ring.read().unwrap_or_else(PoisonError::into_inner).members() }

    pub fn owns(&self, key: &str) -> bool { self.ring.read().unwrap_or_else(PoisonError::into_inner).owns(&self.local, key) }

    /// Keep the copy items this replica owns and that are not already in flight.
    /// Ownership is recomputed on every call.
    pub fn plan(&self, candidates: impl IntoIterator<Item = WorkItem>) -> Vec<WorkItem> {
        let mut out = Vec::new();
        for item in candidates {
            if !matches!(item.operation, Operation::Copy { .. }) {
                continue;
            }
            let key = match ImageRef::parse(&item.image) {
                Ok(source) => shard_key(&self.registry, &source),
                Err(e) => {
                    debug!(image = %item.image, error = %e, "unparseable mirror source");
                    counter!("keel_mirror_skipped_total", 1u64, "reason" => "invalid");
                    continue;
                }
            };
            if !self.owns(&key) {
                counter!("keel_mirror_skipped_total", 1u64, "reason" => "not_owner");
                continue;
            }
            if self.semaphores.is_held(item.exclusion_key()) {
                counter!("keel_mirror_skipped_total", 1u64, "reason" => "in_flight");
                continue;
            }
            out.push(item);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::Credentials;

    fn copy(src: &str) -> WorkItem {
        let dest = ImageRef::parse(src).unwrap().rehome("mirror.local:5000").canonical();
        WorkItem::copy(src, dest, Credentials::new())
    }

    fn candidates() -> Vec<WorkItem> { (0..60).map(|i| copy(&format!("ghcr.io/acme/svc{}:v1", i))).collect() }

    #[test]
    fn replicas_partition_the_work() {
        let members = ["mirror-0", "mirror-1", "mirror-2"];
        let routers: Vec<_> = members
            .iter()
            .map(|m| {
                let r = ShardRouter::new(*m, "mirror.local:5000", RendezvousRing::new(), SemaphoreSet::new());
                r.apply(MembershipEvent::Resync(members.iter().map(|s| s.to_string()).collect()));
                r
            })
            .collect();
        let total: usize = routers.iter().map(|r| r.plan(candidates()).len()).sum();
        assert_eq!(total, 60);
        for r in &routers {
            assert!(!r.plan(candidates()).is_empty(), "{} owns nothing", r.local());
        }
    }

    #[test]
    fn alone_owns_everything_and_survives_own_leave() {
        let r = ShardRouter::new("mirror-0", "mirror.local:5000", RendezvousRing::new(), SemaphoreSet::new());
        r.apply(MembershipEvent::Left("mirror-0".into()));
        assert_eq!(r.plan(candidates()).len(), 60);
    }

    #[test]
    fn churn_only_moves_departed_keys() {
        let r = ShardRouter::new("mirror-0", "mirror.local:5000", RendezvousRing::new(), SemaphoreSet::new());
        r.apply(MembershipEvent::Joined("mirror-1".into()));
        r.apply(MembershipEvent::Joined("mirror-2".into()));
        let before: Vec<_> = r.plan(candidates()).into_iter().map(|w| w.image).collect();
        r.apply(MembershipEvent::Left("mirror-2".into()));
        let after: Vec<_> = r.plan(candidates()).into_iter().map(|w| w.image).collect();
        assert!(before.iter().all(|i| after.contains(i)));
        r.apply(MembershipEvent::Joined("mirror-2".into()));
        let again: Vec<_> = r.plan(candidates()).into_iter().map(|w| w.image).collect();
        assert_eq!(before, again);
    }

    #[test]
    fn in_flight_destinations_are_skipped() {
        let sems = SemaphoreSet::new();
        let r = ShardRouter::new("mirror-0", "mirror.local:5000", RendezvousRing::new(), sems.clone());
        let item = copy("ghcr.io/acme/svc1:v1");
        let _p = sems.try_acquire(item.exclusion_key()).unwrap();
        assert!(r.plan(vec![item]).is_empty());
    }

    #[test]
    fn resync_drops_vanished_members_but_keeps_local() {
        let r = ShardRouter::new("mirror-0", "mirror.local:5000", RendezvousRing::new(), SemaphoreSet::new());
        r.apply(MembershipEvent::Joined("mirror-9".into()));
        r.apply(MembershipEvent::Resync(vec!["mirror-1".into()]));
        assert_eq!(r.members(), vec!["mirror-0".to_string(), "mirror-1".to_string()]);
    }

    #[test]
    fn shard_key_normalizes_both_sides() {
        let src = ImageRef::parse("nginx:1.25").unwrap();
        assert_eq!(shard_key("https://Mirror.Local:5000/", &src), "mirror.local:5000/docker.io/library/nginx:1.25");
    }
}
