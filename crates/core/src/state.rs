//! Per-machine image label states and the convergence function shared by the
//! declaration controller and the machine agent.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::image::IdentityHash;

/// Label key prefix; the key name is the image identity hash.
pub const LABEL_PREFIX: &str = "image.keel.dev/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageState {
    Pending,
    Available,
    Deleting,
    /// Operator hold: never transitioned automatically.
    Unknown,
}

impl ImageState {
    pub const ALL: [ImageState; 4] = [ImageState::Pending, ImageState::Available, ImageState::Deleting, ImageState::Unknown];

    pub fn as_str(&self) -> &'static str {
        match self {
            ImageState::Pending => "pending",
            ImageState::Available => "available",
            ImageState::Deleting => "deleting",
            ImageState::Unknown => "unknown",
        }
    }

    /// Whether the label reports the image as present on the machine.
    pub fn reports_present(&self) -> bool { matches!(self, ImageState::Available | ImageState::Deleting) }
}

impl fmt::Display for ImageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid image state label value: {0:?}")]
pub struct InvalidState(pub String);

impl FromStr for ImageState {
    type Err = InvalidState;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ImageState::Pending),
            "available" => Ok(ImageState::Available),
            "deleting" => Ok(ImageState::Deleting),
            "unknown" => Ok(ImageState::Unknown),
            other => Err(InvalidState(other.to_string())),
        }
    }
}

pub fn label_key(hash: &IdentityHash) -> String { format!("{}{}", LABEL_PREFIX, hash) }

/// Identity hash encoded in a label key, if the key belongs to keel.
pub fn hash_from_label_key(key: &str) -> Option<IdentityHash> {
    key.strip_prefix(LABEL_PREFIX).filter(|h| !h.is_empty()).map(IdentityHash::from_raw)
}

/// Keel labels of a machine as `hash -> state`; values that do not parse map to `None`.
pub fn tracked_labels(labels: &BTreeMap<String, String>) -> BTreeMap<IdentityHash, Option<ImageState>> {
    labels
        .iter()
        .filter_map(|(k, v)| hash_from_label_key(k).map(|h| (h, v.parse::<ImageState>().ok())))
        .collect()
}

/// The transition table. `None` in the result means "no label".
///
/// Absent labels only appear for desired images; images the machine has but
/// nobody declared are never tracked. `unknown` is held until the image is
/// neither desired nor present.
pub fn next_state(desired: bool, observed: bool, current: Option<ImageState>) -> Option<ImageState> {
    match (current, desired, observed) {
        (Some(ImageState::Unknown), false, false) => None,
        (Some(ImageState::Unknown), _, _) => Some(ImageState::Unknown),
        (None, false, _) => None,
        (_, true, true) => Some(ImageState::Available),
        (_, true, false) => Some(ImageState::Pending),
        (Some(_), false, true) => Some(ImageState::Deleting),
        (Some(_), false, false) => None,
    }
}

/// Derive the next label state of every tracked image on one machine.
///
/// `desired` and `observed` map identity hashes to image names; only their
/// keys matter here. Labels outside [`LABEL_PREFIX`] are ignored.
pub fn compute_state(
    desired: &BTreeMap<IdentityHash, String>,
    observed: &BTreeMap<IdentityHash, String>,
    current_labels: &BTreeMap<String, String>,
) -> BTreeMap<IdentityHash, ImageState> {
    let current = tracked_labels(current_labels);
    let mut out = BTreeMap::new();

    for hash in desired.keys() {
        let cur = current.get(hash).copied().flatten();
        if let Some(next) = next_state(true, observed.contains_key(hash), cur) {
            out.insert(hash.clone(), next);
        }
    }
    for (hash, cur) in current.iter() {
        if desired.contains_key(hash) {
            continue;
        }
        // An unparseable value still counts as an existing label.
        let cur = Some(cur.unwrap_or(ImageState::Pending));
        if let Some(next) = next_state(false, observed.contains_key(hash), cur) {
            out.insert(hash.clone(), next);
        }
    }
    out
}

/// Observation derived from labels alone, for callers without runtime access.
pub fn observed_from_labels(current_labels: &BTreeMap<String, String>) -> BTreeMap<IdentityHash, String> {
    tracked_labels(current_labels)
        .into_iter()
        .filter(|(_, s)| s.map(|s| s.reports_present()).unwrap_or(false))
        .map(|(h, _)| {
            let name = h.to_string();
            (h, name)
        })
        .collect()
}

/// Minimal label edit turning the current keel labels into `next`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelDelta {
    pub set: BTreeMap<String, String>,
    pub remove: BTreeSet<String>,
}

impl LabelDelta {
    pub fn between(current_labels: &BTreeMap<String, String>, next: &BTreeMap<IdentityHash, ImageState>) -> Self {
        let mut delta = LabelDelta::default();
        for (hash, state) in next {
            let key = label_key(hash);
            if current_labels.get(&key).map(String::as_str) != Some(state.as_str()) {
                delta.set.insert(key, state.as_str().to_string());
            }
        }
        for key in current_labels.keys() {
            if let Some(hash) = hash_from_label_key(key) {
                if !next.contains_key(&hash) {
                    delta.remove.insert(key.clone());
                }
            }
        }
        delta
    }

    pub fn is_empty(&self) -> bool { self.set.is_empty() && self.remove.is_empty() }

    /// JSON merge patch for `metadata.labels`; removals are `null`.
    pub fn to_merge_patch(&self) -> serde_json::Value {
        let mut labels = serde_json::Map::new();
        for (k, v) in &self.set {
            labels.insert(k.clone(), serde_json::Value::String(v.clone()));
        }
        for k in &self.remove {
            labels.insert(k.clone(), serde_json::Value::Null);
        }
        serde_json::json!({ "metadata": { "labels": labels } })
    }

    /// Apply to a label map in place (used by in-memory stores and tests).
    pub fn apply_to(&self, labels: &mut BTreeMap<String, String>) {
        for k in &self.remove {
            labels.remove(k);
        }
        for (k, v) in &self.set {
            labels.insert(k.clone(), v.clone());
        }
    }
}
