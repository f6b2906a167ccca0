//! Keel shard routing for the mirror workers.
//!
//! Each replica sees the same membership (its own pods) and the same hash, so
//! every candidate copy is claimed by exactly one replica without coordination.

#![forbid(unsafe_code)]

mod ring;
mod router;

pub use ring::{MembershipRing, RendezvousRing};
pub use router::{shard_key, MembershipEvent, ShardRouter};
