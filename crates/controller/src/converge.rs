//! Desired image sets per machine and the label plan derived from them.

use std::collections::{BTreeMap, BTreeSet};

use keel_core::{compute_state, IdentityHash, ImageState, LabelDelta, LabelSelector, MachineView, ManagedImage};
use keel_keyring::SecretRef;
use keel_kubehub::CachedImage;
use kube::ResourceExt;
use tracing::warn;

use crate::error::{ControllerError, Result};

/// A declaration with its selector and images parsed once per pass.
#[derive(Debug, Clone)]
pub struct Declared {
    pub name: String,
    pub selector: LabelSelector,
    pub images: Vec<ManagedImage>,
    pub secrets: BTreeSet<SecretRef>,
    pub deleting: bool,
    pub mirror: bool,
}

impl Declared {
    pub fn from_resource(ci: &CachedImage) -> Result<Self> {
        let name = ci.name_any();
        let selector = ci.selector().map_err(|source| ControllerError::Selector { declaration: name.clone(), source })?;
        let (images, bad) = ci.managed_images();
        for e in bad {
            warn!(declaration = %name, error = %e, "ignoring invalid image reference");
        }
        Ok(Self { name, selector, images, secrets: ci.secret_refs(), deleting: ci.is_deleting(), mirror: ci.spec.mirror })
    }

    pub fn is_active(&self) -> bool { !self.deleting }

    pub fn declares(&self, hash: &IdentityHash) -> bool { self.images.iter().any(|m| &m.hash == hash) }
}

/// Parse every declaration. A malformed selector on an active declaration
/// fails the whole pass: dropping it would read as "undeclared" and start
/// deleting its images fleet-wide.
pub fn prepare(declarations: &[CachedImage]) -> Result<Vec<Declared>> {
    let mut out = Vec::with_capacity(declarations.len());
    for ci in declarations {
        match Declared::from_resource(ci) {
            Ok(d) => out.push(d),
            Err(e) if ci.is_deleting() => warn!(error = %e, "skipping deleting declaration with invalid selector"),
            Err(e) => return Err(e),
        }
    }
    Ok(out)
}

/// Union of images of active declarations whose selector matches `labels`.
pub fn desired_for(labels: &BTreeMap<String, String>, declared: &[Declared]) -> BTreeMap<IdentityHash, String> {
    let mut out = BTreeMap::new();
    for d in declared.iter().filter(|d| d.is_active() && d.selector.matches(labels)) {
        for m in &d.images {
            out.entry(m.hash.clone()).or_insert_with(|| m.name());
        }
    }
    out
}

/// Next label states and the edit that gets the machine there.
#[derive(Debug, Clone, Default)]
pub struct LabelPlan {
    pub next: BTreeMap<IdentityHash, ImageState>,
    pub delta: LabelDelta,
}

impl LabelPlan {
    pub fn for_machine(view: &MachineView, desired: &BTreeMap<IdentityHash, String>, observed: &BTreeMap<IdentityHash, String>) -> Self {
        let next = compute_state(desired, observed, &view.labels);
        let delta = LabelDelta::between(&view.labels, &next);
        Self { next, delta }
    }

    pub fn in_state(&self, state: ImageState) -> impl Iterator<Item = &IdentityHash> + '_ {
        self.next.iter().filter(move |(_, s)| **s == state).map(|(h, _)| h)
    }
}
