//! Keel execution: runtime and registry adapters plus the worker pool that
//! applies pulls, removals and mirror copies.
//!
//! Nothing here talks to Kubernetes. Work arrives as [`keel_core::WorkItem`]s
//! and results leave as [`Outcome`]s.

#![forbid(unsafe_code)]

mod cache;
mod engine;
mod error;
mod process;
pub mod registry;
pub mod runtime;
mod semaphore;
pub mod wait;

pub use cache::CredentialCache;
pub use engine::{Engine, EngineConfig, Executor, Outcome, Status};
pub use error::ExecError;
pub use registry::{Destination, RegistryClient, SkopeoRegistry};
pub use runtime::{CrictlRuntime, RuntimeClient, RuntimeImage};
pub use semaphore::{ImagePermit, SemaphoreSet};
pub use wait::{wait_for_presence, WaitConfig};
