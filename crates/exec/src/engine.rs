//! Fixed-size worker pool consuming a shared bounded queue of work items.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use keel_core::{Credential, ImageRef, Operation, WorkItem};
use metrics::{counter, histogram};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::wait::{wait_for_presence, WaitConfig};
use crate::{CredentialCache, ExecError, RegistryClient, RuntimeClient, SemaphoreSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    /// When set, pulls and removals block until the runtime reflects them.
    pub wait: Option<WaitConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self { Self { workers: 4, queue_capacity: 256, wait: None } }
}

#[derive(Debug, Clone)]
pub enum Status {
    Succeeded,
    Failed(ExecError),
    /// Another in-flight operation held the image.
    Skipped,
}

impl Status {
    fn as_str(&self) -> &'static str {
        match self {
            Status::Succeeded => "ok",
            Status::Failed(_) => "error",
            Status::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Outcome {
    pub image: String,
    pub operation: Operation,
    pub status: Status,
    pub elapsed: Duration,
}

impl Outcome {
    pub fn is_success(&self) -> bool { matches!(self.status, Status::Succeeded) }
}

/// Runs single work items against the runtime or registry.
pub struct Executor {
    runtime: Option<Arc<dyn RuntimeClient>>,
    registry: Option<Arc<dyn RegistryClient>>,
    semaphores: SemaphoreSet,
    cache: CredentialCache,
    wait: Option<WaitConfig>,
}

impl Executor {
    /// Executor for a node agent: pulls and removals against `runtime`.
    pub fn for_runtime(runtime: Arc<dyn RuntimeClient>, wait: Option<WaitConfig>) -> Self {
        Self { runtime: Some(runtime), registry: None, semaphores: SemaphoreSet::new(), cache: CredentialCache::new(), wait }
    }

    /// Executor for a mirror worker: copies through `registry`.
    pub fn for_registry(registry: Arc<dyn RegistryClient>) -> Self {
        Self { runtime: None, registry: Some(registry), semaphores: SemaphoreSet::new(), cache: CredentialCache::new(), wait: None }
    }

    /// Share an existing semaphore set, e.g. with the shard router.
    pub fn with_semaphores(mut self, semaphores: SemaphoreSet) -> Self {
        self.semaphores = semaphores;
        self
    }

    pub fn semaphores(&self) -> &SemaphoreSet { &self.semaphores }

    pub fn cache(&self) -> &CredentialCache { &self.cache }

    pub async fn execute(&self, item: WorkItem) -> Outcome {
        let started = Instant::now();
        let op = item.operation.as_str();
        let Some(permit) = self.semaphores.try_acquire(item.exclusion_key()) else {
            counter!("keel_exec_skipped_total", 1u64, "op" => op);
            debug!(image = %item.image, op, "already in flight; skipping");
            return Outcome { image: item.image, operation: item.operation, status: Status::Skipped, elapsed: started.elapsed() };
        };

        let result = self.run(&item).await;
        drop(permit);

        let elapsed = started.elapsed();
        let status = match result {
            Ok(()) => {
                info!(image = %item.image, op, elapsed_ms = elapsed.as_millis() as u64, "operation complete");
                Status::Succeeded
            }
            Err(e) => {
                if matches!(item.operation, Operation::Remove) {
                    warn!(image = %item.image, error = %e, "remove failed; a later pass retries");
                } else {
                    error!(image = %item.image, op, error = %e, "operation failed");
                }
                Status::Failed(e)
            }
        };
        counter!("keel_exec_total", 1u64, "op" => op, "result" => status.as_str());
        histogram!("keel_exec_duration_ms", elapsed.as_secs_f64() * 1000.0, "op" => op);
        Outcome { image: item.image, operation: item.operation, status, elapsed }
    }

    async fn run(&self, item: &WorkItem) -> Result<(), ExecError> {
        ImageRef::parse(&item.image)?;
        match &item.operation {
            Operation::Pull => {
                self.authenticated(item).await?;
                self.settle(&item.image, true).await
            }
            Operation::Remove => {
                self.runtime(&item.image)?.remove_image(&item.image).await?;
                self.settle(&item.image, false).await
            }
            Operation::Copy { destination } => {
                ImageRef::parse(destination)?;
                if self.registry.is_none() {
                    return Err(ExecError::NoRegistry(item.image.clone()));
                }
                self.authenticated(item).await
            }
        }
    }

    fn runtime(&self, image: &str) -> Result<&dyn RuntimeClient, ExecError> {
        self.runtime.as_deref().ok_or_else(|| ExecError::NoRuntime(image.to_string()))
    }

    async fn settle(&self, image: &str, present: bool) -> Result<(), ExecError> {
        match self.wait {
            Some(cfg) => wait_for_presence(self.runtime(image)?, image, present, cfg).await,
            None => Ok(()),
        }
    }

    async fn attempt(&self, item: &WorkItem, auth: Option<&Credential>) -> Result<(), ExecError> {
        match &item.operation {
            Operation::Pull => self.runtime(&item.image)?.pull_image(&item.image, auth).await.map(|_| ()),
            Operation::Copy { destination } => match &self.registry {
                Some(r) => r.copy(&item.image, destination, auth).await,
                None => Err(ExecError::NoRegistry(item.image.clone())),
            },
            Operation::Remove => self.runtime(&item.image)?.remove_image(&item.image).await,
        }
    }

    /// Cached credential first, then each candidate in order. Only an auth
    /// failure moves on to the next candidate.
    async fn authenticated(&self, item: &WorkItem) -> Result<(), ExecError> {
        let failed_cached = match self.cache.get(&item.image) {
            Some(cached) => match self.attempt(item, Some(&cached)).await {
                Ok(()) => return Ok(()),
                Err(ExecError::Cancelled) => return Err(ExecError::Cancelled),
                Err(e) => {
                    debug!(image = %item.image, registry = %cached.registry, error = %e, "cached credential rejected");
                    self.cache.evict(&item.image);
                    counter!("keel_auth_retries_total", 1u64);
                    Some(cached)
                }
            },
            None => None,
        };

        if item.credentials.is_empty() {
            return self.attempt(item, None).await;
        }

        let mut last = None;
        for cred in item.credentials.iter().filter(|c| Some(*c) != failed_cached.as_ref()) {
            match self.attempt(item, Some(cred)).await {
                Ok(()) => {
                    self.cache.put(&item.image, cred.clone());
                    return Ok(());
                }
                Err(e) if e.is_auth() => {
                    counter!("keel_auth_retries_total", 1u64);
                    debug!(image = %item.image, registry = %cred.registry, "credential rejected; trying next");
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or_else(|| ExecError::Unauthorized {
            image: item.image.clone(),
            message: "no usable credential".into(),
        }))
    }
}

/// Queue plus worker pool around a shared [`Executor`].
pub struct Engine {
    executor: Arc<Executor>,
    sender: Mutex<Option<mpsc::Sender<WorkItem>>>,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Spawn `cfg.workers` workers. Outcomes go to `outcomes` when given.
    pub fn start(executor: Executor, cfg: &EngineConfig, outcomes: Option<mpsc::UnboundedSender<Outcome>>) -> Arc<Self> {
        let executor = Arc::new(executor);
        let (tx, rx) = mpsc::channel::<WorkItem>(cfg.queue_capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let handles = (0..cfg.workers.max(1))
            .map(|id| tokio::spawn(worker(id, rx.clone(), executor.clone(), outcomes.clone())))
            .collect();
        info!(workers = cfg.workers.max(1), capacity = cfg.queue_capacity, "execution engine started");
        Arc::new(Self { executor, sender: Mutex::new(Some(tx)), workers: tokio::sync::Mutex::new(handles) })
    }

    pub fn executor(&self) -> &Arc<Executor> { &self.executor }

    pub fn semaphores(&self) -> &SemaphoreSet { self.executor.semaphores() }

    /// Waits for queue space; fails once the engine is closed.
    pub async fn enqueue(&self, item: WorkItem) -> Result<(), ExecError> {
        let tx = self.sender.lock().unwrap_or_else(PoisonError::into_inner).clone();
        match tx {
            Some(tx) => tx.send(item).await.map_err(|_| ExecError::Closed),
            None => Err(ExecError::Closed),
        }
    }

    /// Stop accepting work; queued items still drain.
    pub fn close(&self) { self.sender.lock().unwrap_or_else(PoisonError::into_inner).take(); }

    pub fn is_closed(&self) -> bool { self.sender.lock().unwrap_or_else(PoisonError::into_inner).is_none() }

    /// Close and wait for every worker to finish.
    pub async fn shutdown(&self) {
        self.close();
        let handles: Vec<_> = std::mem::take(&mut *self.workers.lock().await);
        for h in handles {
            if let Err(e) = h.await {
                warn!(error = %e, "worker join failed");
            }
        }
        info!("execution engine stopped");
    }
}

async fn worker(
    id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<WorkItem>>>,
    executor: Arc<Executor>,
    outcomes: Option<mpsc::UnboundedSender<Outcome>>,
) {
    loop {
        let next = rx.lock().await.recv().await;
        let Some(item) = next else { break };
        let image = item.image.clone();
        let operation = item.operation.clone();
        let started = Instant::now();
        let exec = executor.clone();
        // Inner task so a panicking operation costs one item, not the worker.
        let outcome = match tokio::spawn(async move { exec.execute(item).await }).await {
            Ok(o) => o,
            Err(e) => {
                error!(worker = id, image = %image, error = %e, "work item aborted");
                Outcome { image, operation, status: Status::Failed(ExecError::Panicked(e.to_string())), elapsed: started.elapsed() }
            }
        };
        if let Some(tx) = &outcomes {
            let _ = tx.send(outcome);
        }
    }
    debug!(worker = id, "worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RuntimeImage;
    use async_trait::async_trait;
    use keel_core::Credentials;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct FakeRuntime {
        accepted: Option<String>,
        attempts: Mutex<Vec<Option<String>>>,
        images: Mutex<Vec<RuntimeImage>>,
        failures: Mutex<VecDeque<ExecError>>,
    }

    impl FakeRuntime {
        fn accepting(user: &str) -> Self { Self { accepted: Some(user.into()), ..Default::default() } }
        fn attempts(&self) -> Vec<Option<String>> { self.attempts.lock().unwrap().clone() }
    }

    #[async_trait]
    impl RuntimeClient for FakeRuntime {
        async fn pull_image(&self, image: &str, auth: Option<&Credential>) -> Result<String, ExecError> {
            let user = auth.map(|c| c.username.clone());
            self.attempts.lock().unwrap().push(user.clone());
            if let Some(e) = self.failures.lock().unwrap().pop_front() {
                return Err(e);
            }
            if self.accepted.is_some() && user != self.accepted {
                return Err(ExecError::Unauthorized { image: image.into(), message: "401".into() });
            }
            self.images.lock().unwrap().push(RuntimeImage { id: "sha256:1".into(), repo_tags: vec![image.into()] });
            Ok("sha256:1".into())
        }
        async fn remove_image(&self, image: &str) -> Result<(), ExecError> {
            if image.contains("boom") {
                panic!("runtime exploded");
            }
            Ok(())
        }
        async fn list_images(&self) -> Result<Vec<RuntimeImage>, ExecError> { Ok(self.images.lock().unwrap().clone()) }
    }

    fn cred(user: &str) -> Credential { Credential::new("registry.example.com", user, "pw") }

    #[tokio::test]
    async fn stale_cache_is_replaced_by_working_candidate() {
        let rt = Arc::new(FakeRuntime::accepting("second"));
        let ex = Executor::for_runtime(rt.clone(), None);
        let image = "registry.example.com/app:v1";
        ex.cache().put(image, cred("stale"));
        let creds: Credentials = [cred("first"), cred("second")].into_iter().collect();
        let out = ex.execute(WorkItem::pull(image, creds)).await;
        assert!(out.is_success(), "{:?}", out.status);
        assert_eq!(rt.attempts(), vec![Some("stale".into()), Some("first".into()), Some("second".into())]);
        assert_eq!(ex.cache().get(image).map(|c| c.username), Some("second".into()));
    }

    #[tokio::test]
    async fn failed_cached_credential_is_not_retried_from_the_list() {
        let rt = Arc::new(FakeRuntime::accepting("other"));
        let ex = Executor::for_runtime(rt.clone(), None);
        let image = "registry.example.com/app:v1";
        ex.cache().put(image, cred("a"));
        let creds: Credentials = [cred("a"), cred("other")].into_iter().collect();
        assert!(ex.execute(WorkItem::pull(image, creds)).await.is_success());
        assert_eq!(rt.attempts(), vec![Some("a".into()), Some("other".into())]);
    }

    #[tokio::test]
    async fn no_credentials_pulls_anonymously() {
        let rt = Arc::new(FakeRuntime::default());
        let ex = Executor::for_runtime(rt.clone(), None);
        assert!(ex.execute(WorkItem::pull("nginx:1.25", Credentials::new())).await.is_success());
        assert_eq!(rt.attempts(), vec![None]);
        assert!(ex.cache().is_empty());
    }

    #[tokio::test]
    async fn non_auth_failure_stops_the_candidate_walk() {
        let rt = Arc::new(FakeRuntime::accepting("second"));
        rt.failures.lock().unwrap().push_back(ExecError::Failed { op: "pull", image: "x".into(), message: "i/o timeout".into() });
        let ex = Executor::for_runtime(rt.clone(), None);
        let creds: Credentials = [cred("first"), cred("second")].into_iter().collect();
        let out = ex.execute(WorkItem::pull("registry.example.com/app:v1", creds)).await;
        assert!(matches!(out.status, Status::Failed(ExecError::Failed { .. })));
        assert_eq!(rt.attempts().len(), 1);
    }

    #[tokio::test]
    async fn held_key_is_skipped_without_blocking() {
        let rt = Arc::new(FakeRuntime::default());
        let ex = Executor::for_runtime(rt.clone(), None);
        let _held = ex.semaphores().try_acquire("nginx:1.25").unwrap();
        let out = ex.execute(WorkItem::pull("nginx:1.25", Credentials::new())).await;
        assert!(matches!(out.status, Status::Skipped));
        assert!(rt.attempts().is_empty());
    }

    #[tokio::test]
    async fn malformed_image_fails_locally() {
        let rt = Arc::new(FakeRuntime::default());
        let ex = Executor::for_runtime(rt.clone(), None);
        let out = ex.execute(WorkItem::pull("Not A Ref!!", Credentials::new())).await;
        match out.status {
            Status::Failed(e) => assert!(e.is_permanent()),
            other => panic!("unexpected {:?}", other),
        }
        assert!(ex.semaphores().is_empty());
    }

    #[tokio::test]
    async fn copy_without_registry_is_rejected() {
        let ex = Executor::for_runtime(Arc::new(FakeRuntime::default()), None);
        let out = ex.execute(WorkItem::copy("nginx:1", "mirror.local:5000/library/nginx:1", Credentials::new())).await;
        assert!(matches!(out.status, Status::Failed(ExecError::NoRegistry(_))));
    }

    #[tokio::test]
    async fn wait_mode_times_out_when_runtime_never_settles() {
        #[derive(Default)]
        struct Stubborn;
        #[async_trait]
        impl RuntimeClient for Stubborn {
            async fn pull_image(&self, _: &str, _: Option<&Credential>) -> Result<String, ExecError> { Ok("id".into()) }
            async fn remove_image(&self, _: &str) -> Result<(), ExecError> { Ok(()) }
            async fn list_images(&self) -> Result<Vec<RuntimeImage>, ExecError> { Ok(Vec::new()) }
        }
        let wait = WaitConfig { interval: Duration::from_millis(5), timeout: Duration::from_millis(30) };
        let ex = Executor::for_runtime(Arc::new(Stubborn), Some(wait));
        let out = ex.execute(WorkItem::pull("nginx:1.25", Credentials::new())).await;
        assert!(matches!(out.status, Status::Failed(ExecError::Timeout { present: true, .. })));
    }

    #[tokio::test]
    async fn pool_survives_a_panicking_item() {
        let rt = Arc::new(FakeRuntime::default());
        let ex = Executor::for_runtime(rt.clone(), None);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = Engine::start(ex, &EngineConfig { workers: 1, queue_capacity: 4, wait: None }, Some(tx));
        engine.enqueue(WorkItem::remove("boom:1")).await.unwrap();
        engine.enqueue(WorkItem::pull("nginx:1.25", Credentials::new())).await.unwrap();
        engine.shutdown().await;

        let first = rx.recv().await.unwrap();
        assert!(matches!(first.status, Status::Failed(ExecError::Panicked(_))));
        let second = rx.recv().await.unwrap();
        assert!(second.is_success());
        assert!(engine.semaphores().is_empty());
        assert!(matches!(engine.enqueue(WorkItem::remove("x:1")).await, Err(ExecError::Closed)));
    }
}
