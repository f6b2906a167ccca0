use std::collections::{BTreeMap, BTreeSet};

use crate::{CredentialKeyring, SecretRef, SecretSource};

/// Tracks which secrets each declaration references and turns declaration
/// changes into the minimal keyring `add`/`remove` calls.
#[derive(Debug, Default)]
pub struct KeyringSync {
    by_owner: BTreeMap<String, BTreeSet<SecretRef>>,
}

impl KeyringSync {
    pub fn new() -> Self { Self::default() }

    /// Record the current references of one owner.
    pub fn observe<S: SecretSource>(&mut self, keyring: &CredentialKeyring<S>, owner: &str, refs: BTreeSet<SecretRef>) {
        let empty = BTreeSet::new();
        let before = self.by_owner.get(owner).unwrap_or(&empty);
        let added: Vec<&SecretRef> = refs.difference(before).collect();
        let removed: Vec<&SecretRef> = before.difference(&refs).collect();
        if !added.is_empty() {
            keyring.add(added);
        }
        if !removed.is_empty() {
            keyring.remove(removed);
        }
        if refs.is_empty() {
            self.by_owner.remove(owner);
        } else {
            self.by_owner.insert(owner.to_string(), refs);
        }
    }

    /// Drop every reference held by a deleted owner.
    pub fn forget<S: SecretSource>(&mut self, keyring: &CredentialKeyring<S>, owner: &str) {
        if let Some(refs) = self.by_owner.remove(owner) {
            keyring.remove(refs.iter());
        }
    }

    /// Replace the full owner set: owners missing from `current` are forgotten.
    pub fn replace_all<S: SecretSource>(
        &mut self,
        keyring: &CredentialKeyring<S>,
        current: BTreeMap<String, BTreeSet<SecretRef>>,
    ) {
        let gone: Vec<String> = self.by_owner.keys().filter(|o| !current.contains_key(*o)).cloned().collect();
        for owner in gone {
            self.forget(keyring, &owner);
        }
        for (owner, refs) in current {
            self.observe(keyring, &owner, refs);
        }
    }

    pub fn owners(&self) -> usize { self.by_owner.len() }
}
