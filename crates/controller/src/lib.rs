//! Keel controllers.
//!
//! Three processes share one convergence function: the declaration reconciler
//! (labels from the declarations' side, status, finalizer), the node agent
//! (labels from the runtime's side, pulls and removals) and the sharded mirror
//! worker (registry copies).

#![forbid(unsafe_code)]

pub mod agent;
pub mod config;
pub mod converge;
pub mod declaration;
pub mod deletion;
mod error;
pub mod mirror;
pub mod pass_loop;
#[cfg(test)]
mod testing;

pub use agent::{run_agent, Agent, AgentPlan};
pub use config::{AgentConfig, ControllerConfig, MirrorConfig};
pub use converge::{desired_for, prepare, Declared, LabelPlan};
pub use deletion::{finalize, Finalize};
pub use error::{ControllerError, Result};
pub use mirror::{run_mirror, Mirror};
pub use pass_loop::{LoopState, PassLoop};
