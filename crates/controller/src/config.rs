//! Immutable, validated settings for each process flavour.

use std::time::Duration;

use keel_core::normalize_registry;
use keel_exec::EngineConfig;
use keel_keyring::SecretRef;

use crate::error::{ControllerError, Result};

fn positive(what: &str, d: Duration) -> Result<()> {
    if d.is_zero() {
        return Err(ControllerError::config(format!("{} must be greater than zero", what)));
    }
    Ok(())
}

fn engine_ok(engine: &EngineConfig) -> Result<()> {
    if engine.workers == 0 {
        return Err(ControllerError::config("workers must be at least 1"));
    }
    if engine.queue_capacity == 0 {
        return Err(ControllerError::config("queue capacity must be at least 1"));
    }
    if let Some(w) = engine.wait {
        positive("wait interval", w.interval)?;
        if w.timeout < w.interval {
            return Err(ControllerError::config("wait timeout must not be shorter than the wait interval"));
        }
    }
    Ok(())
}

/// Declaration reconciler settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Requeue of a settled declaration.
    pub resync: Duration,
    /// Requeue while waiting for nodes to drop a deleting declaration's labels.
    pub deletion_requeue: Duration,
    pub error_backoff: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self { resync: Duration::from_secs(60), deletion_requeue: Duration::from_secs(10), error_backoff: Duration::from_secs(30) }
    }
}

impl ControllerConfig {
    pub fn validate(self) -> Result<Self> {
        positive("resync", self.resync)?;
        positive("deletion requeue", self.deletion_requeue)?;
        positive("error backoff", self.error_backoff)?;
        Ok(self)
    }
}

/// Node agent settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub node: String,
    pub interval: Duration,
    pub cleanup_interval: Duration,
    pub crictl: String,
    pub runtime_endpoint: Option<String>,
    pub engine: EngineConfig,
}

impl AgentConfig {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(300),
            crictl: "crictl".into(),
            runtime_endpoint: None,
            engine: EngineConfig::default(),
        }
    }

    pub fn validate(self) -> Result<Self> {
        if self.node.trim().is_empty() {
            return Err(ControllerError::config("node name is required"));
        }
        if self.crictl.trim().is_empty() {
            return Err(ControllerError::config("crictl binary must not be empty"));
        }
        positive("pass interval", self.interval)?;
        positive("cleanup interval", self.cleanup_interval)?;
        engine_ok(&self.engine)?;
        Ok(self)
    }
}

/// Mirror worker settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorConfig {
    pub pod: String,
    pub namespace: String,
    /// Selector matching the mirror deployment's own pods.
    pub member_selector: String,
    pub registry: String,
    pub registry_secret: Option<SecretRef>,
    pub tls_verify: bool,
    pub interval: Duration,
    pub skopeo: String,
    pub engine: EngineConfig,
}

impl MirrorConfig {
    pub fn new(pod: impl Into<String>, namespace: impl Into<String>, registry: &str) -> Self {
        Self {
            pod: pod.into(),
            namespace: namespace.into(),
            member_selector: "app.kubernetes.io/name=keel-mirror".into(),
            registry: registry.to_string(),
            registry_secret: None,
            tls_verify: true,
            interval: Duration::from_secs(60),
            skopeo: "skopeo".into(),
            engine: EngineConfig::default(),
        }
    }

    /// Validates and normalizes the registry host.
    pub fn validate(mut self) -> Result<Self> {
        if self.pod.trim().is_empty() {
            return Err(ControllerError::config("pod name is required"));
        }
        if self.namespace.trim().is_empty() {
            return Err(ControllerError::config("namespace is required"));
        }
        if self.member_selector.trim().is_empty() {
            return Err(ControllerError::config("member selector must not be empty"));
        }
        if self.registry.trim().is_empty() {
            return Err(ControllerError::config("mirror registry is required"));
        }
        self.registry = normalize_registry(&self.registry);
        positive("pass interval", self.interval)?;
        engine_ok(&self.engine)?;
        Ok(self)
    }
}
