//! Periodic pass scheduling as an explicit Idle / Running / Stopped machine.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use tokio::sync::{watch, Notify};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Running,
    Stopped,
}

/// Runs one pass at a time, on every tick or trigger, until cancelled.
///
/// Cancellation during a pass lets it finish; the loop then stops.
pub struct PassLoop {
    name: &'static str,
    interval: Duration,
    trigger: Arc<Notify>,
    state: watch::Sender<LoopState>,
}

impl PassLoop {
    pub fn new(name: &'static str, interval: Duration) -> Self {
        let (state, _) = watch::channel(LoopState::Idle);
        Self { name, interval, trigger: Arc::new(Notify::new()), state }
    }

    /// Share a trigger (e.g. a watcher's) that starts a pass early.
    pub fn with_trigger(mut self, trigger: Arc<Notify>) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn trigger(&self) -> Arc<Notify> { self.trigger.clone() }

    pub fn state(&self) -> LoopState { *self.state.borrow() }

    pub fn subscribe(&self) -> watch::Receiver<LoopState> { self.state.subscribe() }

    pub async fn run<F, Fut>(&self, cancel: CancellationToken, mut pass: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if cancel.is_cancelled() {
            self.state.send_replace(LoopState::Stopped);
            return;
        }
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(pass = self.name, interval_ms = self.interval.as_millis() as u64, "pass loop started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.trigger.notified() => debug!(pass = self.name, "triggered"),
            }
            self.state.send_replace(LoopState::Running);
            let started = Instant::now();
            let result = pass().await;
            let ms = started.elapsed().as_secs_f64() * 1000.0;
            histogram!("keel_pass_duration_ms", ms, "loop" => self.name);
            match result {
                Ok(()) => {
                    counter!("keel_pass_total", 1u64, "loop" => self.name, "result" => "ok");
                    debug!(pass = self.name, elapsed_ms = ms as u64, "pass complete");
                }
                Err(e) => {
                    counter!("keel_pass_total", 1u64, "loop" => self.name, "result" => "error");
                    warn!(pass = self.name, error = %e, "pass failed; retrying next tick");
                }
            }
            if cancel.is_cancelled() {
                break;
            }
            self.state.send_replace(LoopState::Idle);
        }
        self.state.send_replace(LoopState::Stopped);
        info!(pass = self.name, "pass loop stopped");
    }
}
