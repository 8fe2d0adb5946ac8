//! Tokio task harness for monitors that sync in periodic passes.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Monitor, MonitorFactory, MonitorTarget, SyncKind};
use crate::account::AccountId;
use crate::error::{Result, SyncError};
use crate::heartbeat::HeartbeatStore;

/// One unit of synchronisation work, repeated until the monitor is killed.
#[async_trait]
pub trait SyncPass: Send + Sync {
    async fn run_once(&self) -> Result<()>;
}

/// Monitor that runs a [`SyncPass`] on a fixed interval in its own task.
pub struct TaskMonitor {
    account_id: AccountId,
    kind: SyncKind,
    interval: Duration,
    pass: Arc<dyn SyncPass>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl TaskMonitor {
    pub fn new(
        account_id: AccountId,
        kind: SyncKind,
        interval: Duration,
        pass: Arc<dyn SyncPass>,
    ) -> Self {
        Self {
            account_id,
            kind,
            interval,
            pass,
            cancel: CancellationToken::new(),
            handle: None,
        }
    }

    /// True between a successful start and the task finishing.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Monitor for TaskMonitor {
    fn start(&mut self) -> Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }
        if self.cancel.is_cancelled() {
            return Err(SyncError::monitor(
                self.account_id,
                self.kind,
                "monitor was already killed",
            ));
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SyncError::monitor(self.account_id, self.kind, e.to_string()))?;

        self.handle = Some(runtime.spawn(run_passes(
            self.account_id,
            self.kind,
            self.interval,
            self.pass.clone(),
            self.cancel.clone(),
        )));
        Ok(())
    }

    fn kill(&mut self) {
        self.cancel.cancel();
        // Detach; the task exits at its next cancellation check.
        self.handle = None;
    }
}

impl std::fmt::Debug for TaskMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskMonitor")
            .field("account_id", &self.account_id)
            .field("kind", &self.kind)
            .field("interval", &self.interval)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

async fn run_passes(
    account_id: AccountId,
    kind: SyncKind,
    interval: Duration,
    pass: Arc<dyn SyncPass>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = pass.run_once().await {
                    warn!(account_id, kind = %kind, error = %e, "sync pass failed");
                }
            }
        }
    }

    debug!(account_id, kind = %kind, "monitor stopped");
}

type PassBuilder = dyn Fn(MonitorTarget<'_>) -> Arc<dyn SyncPass> + Send + Sync;

/// Builds [`TaskMonitor`]s around passes produced by a closure.
pub struct TaskMonitorFactory {
    interval: Duration,
    build_pass: Box<PassBuilder>,
}

impl TaskMonitorFactory {
    pub fn new<F>(interval: Duration, build_pass: F) -> Self
    where
        F: Fn(MonitorTarget<'_>) -> Arc<dyn SyncPass> + Send + Sync + 'static,
    {
        Self {
            interval,
            build_pass: Box::new(build_pass),
        }
    }

    /// Factory whose monitors only report liveness to the heartbeat store.
    pub fn heartbeat(interval: Duration, heartbeats: Arc<dyn HeartbeatStore>) -> Self {
        Self::new(interval, move |target| {
            let pass: Arc<dyn SyncPass> = Arc::new(HeartbeatPass::new(
                heartbeats.clone(),
                target.account_id(),
                target.kind(),
            ));
            pass
        })
    }
}

impl MonitorFactory for TaskMonitorFactory {
    fn create(&self, target: MonitorTarget<'_>) -> Result<Box<dyn Monitor>> {
        let pass = (self.build_pass)(target);
        Ok(Box::new(TaskMonitor::new(
            target.account_id(),
            target.kind(),
            self.interval,
            pass,
        )))
    }
}

/// Generic pass that records a heartbeat for its account and kind.
pub struct HeartbeatPass {
    heartbeats: Arc<dyn HeartbeatStore>,
    account_id: AccountId,
    kind: SyncKind,
}

impl HeartbeatPass {
    pub fn new(heartbeats: Arc<dyn HeartbeatStore>, account_id: AccountId, kind: SyncKind) -> Self {
        Self {
            heartbeats,
            account_id,
            kind,
        }
    }
}

#[async_trait]
impl SyncPass for HeartbeatPass {
    async fn run_once(&self) -> Result<()> {
        self.heartbeats.report(self.account_id, self.kind).await?;
        Ok(())
    }
}
