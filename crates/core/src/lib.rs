//! Keel core types: image identity, label states and the convergence table.
//!
//! Everything here is pure; kube, runtime and registry access live in the
//! other crates.

#![forbid(unsafe_code)]

pub mod image;
pub mod machine;
pub mod selector;
pub mod state;
pub mod work;

pub use image::{normalize_registry, IdentityHash, ImageRef, ImageRefError, ManagedImage};
pub use machine::{hash_images, MachineView, Readiness};
pub use selector::{LabelSelector, SelectorError};
pub use state::{
    compute_state, hash_from_label_key, label_key, next_state, observed_from_labels, tracked_labels, ImageState, LabelDelta, LABEL_PREFIX,
};
pub use work::{Credential, Credentials, Operation, WorkItem};

pub mod prelude {
    pub use super::{
        compute_state, label_key, IdentityHash, ImageRef, ImageState, LabelDelta, LabelSelector, MachineView, Operation, WorkItem,
    };
}
