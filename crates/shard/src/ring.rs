use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Membership structure deciding which member owns a work key.
pub trait MembershipRing: Send + Sync {
    fn add(&mut self, member: &str) -> bool;
    fn remove(&mut self, member: &str) -> bool;
    /// Member owning `key`, or `None` on an empty ring.
    fn owner(&self, key: &str) -> Option<&str>;
    fn members(&self) -> Vec<String>;

    fn owns(&self, member: &str, key: &str) -> bool { self.owner(key) == Some(member) }

    fn len(&self) -> usize { self.members().len() }

    fn is_empty(&self) -> bool { self.len() == 0 }
}

/// Highest-random-weight ring: every member scores every key, the best score wins.
///
/// Removing a member only moves the keys it owned.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RendezvousRing {
    members: BTreeSet<String>,
}

impl RendezvousRing {
    pub fn new() -> Self { Self::default() }

    pub fn with_members<I, S>(members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { members: members.into_iter().map(Into::into).collect() }
    }
}

fn score(member: &str, key: &str) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325; // 64-bit FNV-1a offset
    for b in member.as_bytes().iter().chain([0u8].iter()).chain(key.as_bytes()) {
        h ^= *b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    // FNV alone mixes the trailing bytes poorly; finish with a murmur-style avalanche.
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51afd7ed558ccd);
    h ^= h >> 33;
    h
}

impl MembershipRing for RendezvousRing {
    fn add(&mut self, member: &str) -> bool { self.members.insert(member.to_string()) }

    fn remove(&mut self, member: &str) -> bool { self.members.remove(member) }

    fn owner(&self, key: &str) -> Option<&str> {
        // Ties broken by name so every replica agrees.
        self.members
            .iter()
            .max_by(|a, b| score(a, key).cmp(&score(b, key)).then_with(|| b.cmp(a)))
            .map(String::as_str)
    }

    fn members(&self) -> Vec<String> { self.members.iter().cloned().collect() }

    fn len(&self) -> usize { self.members.len() }
}
