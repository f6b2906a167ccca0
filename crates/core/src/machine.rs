//! Read-only view of one machine, rebuilt on every read.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::image::{IdentityHash, ImageRef};
use crate::state::{tracked_labels, ImageState};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Readiness {
    pub ready: bool,
    pub disk_pressure: bool,
    pub pid_pressure: bool,
}

impl Readiness {
    pub fn is_ready(&self) -> bool { self.ready && !self.disk_pressure && !self.pid_pressure }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachineView {
    pub name: String,
    pub readiness: Readiness,
    /// Images present on the machine, keyed by identity hash.
    pub images: BTreeMap<IdentityHash, String>,
    pub labels: BTreeMap<String, String>,
}

impl MachineView {
    /// Build a view; image names that do not parse are skipped.
    pub fn new<'a>(
        name: impl Into<String>,
        readiness: Readiness,
        image_names: impl IntoIterator<Item = &'a str>,
        labels: BTreeMap<String, String>,
    ) -> Self {
        Self { name: name.into(), readiness, images: hash_images(image_names), labels }
    }

    pub fn is_ready(&self) -> bool { self.readiness.is_ready() }

    pub fn state_of(&self, hash: &IdentityHash) -> Option<ImageState> {
        self.labels.get(&crate::state::label_key(hash)).and_then(|v| v.parse().ok())
    }

    /// Hashes currently labelled with `state`.
    pub fn labelled(&self, state: ImageState) -> Vec<IdentityHash> {
        tracked_labels(&self.labels)
            .into_iter()
            .filter(|(_, s)| *s == Some(state))
            .map(|(h, _)| h)
            .collect()
    }
}

/// Hash runtime-reported image names into the identity space.
pub fn hash_images<'a>(names: impl IntoIterator<Item = &'a str>) -> BTreeMap<IdentityHash, String> {
    let mut out = BTreeMap::new();
    for name in names {
        if let Ok(r) = ImageRef::parse(name) {
            out.insert(r.identity(), name.to_string());
        }
    }
    out
}
