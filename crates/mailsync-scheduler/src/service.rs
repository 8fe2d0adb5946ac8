//! The reconciliation loop.
//!
//! Every tick the service optionally claims one more account, reads the
//! assignment view, and converges the supervisor's running set towards the
//! accounts assigned to this process.

use std::collections::BTreeSet;
use std::sync::Arc;

use metrics::gauge;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::account::{AccountId, AccountStore};
use crate::admission::{AdmissionController, AdmissionDecision};
use crate::assignment::{owned_by, WorkAssignment};
use crate::config::SyncServiceConfig;
use crate::error::SyncError;
use crate::heartbeat::HeartbeatStore;
use crate::identity::ProcessIdentity;
use crate::monitor::MonitorRegistry;
use crate::supervisor::{AccountSupervisor, StartOutcome};

/// External collaborators the service drives.
pub struct SyncBackends {
    pub accounts: Arc<dyn AccountStore>,
    pub heartbeats: Arc<dyn HeartbeatStore>,
    pub assignment: Arc<dyn WorkAssignment>,
    pub monitors: MonitorRegistry,
}

/// Accounts to start and stop to reach the desired set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConvergencePlan {
    pub to_start: Vec<AccountId>,
    pub to_stop: Vec<AccountId>,
}

impl ConvergencePlan {
    /// `running` are fully started accounts; `tracked` additionally includes
    /// accounts holding leftover monitors from a failed start.
    #[must_use]
    pub fn compute(
        running: &BTreeSet<AccountId>,
        tracked: &BTreeSet<AccountId>,
        desired: &BTreeSet<AccountId>,
    ) -> Self {
        Self {
            to_start: desired.difference(running).copied().collect(),
            to_stop: tracked
                .union(running)
                .filter(|id| !desired.contains(id))
                .copied()
                .collect(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.to_start.is_empty() && self.to_stop.is_empty()
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Account claimed during the acquire phase.
    pub claimed: Option<AccountId>,
    /// Size of the desired set, if the assignment view could be read.
    pub desired: Option<usize>,
    pub started: Vec<AccountId>,
    pub stopped: Vec<AccountId>,
    /// Accounts whose start or stop failed this tick.
    pub failed: Vec<AccountId>,
}

/// Periodic driver converging this process's work to its assignment.
pub struct SyncService {
    identity: ProcessIdentity,
    config: SyncServiceConfig,
    admission: AdmissionController,
    assignment: Arc<dyn WorkAssignment>,
    supervisor: Arc<AccountSupervisor>,
}

impl SyncService {
    pub fn new(
        identity: ProcessIdentity,
        config: SyncServiceConfig,
        admission: AdmissionController,
        backends: SyncBackends,
    ) -> Self {
        let supervisor = Arc::new(AccountSupervisor::new(
            identity.clone(),
            backends.accounts,
            backends.heartbeats,
            backends.assignment.clone(),
            backends.monitors,
            config.features.push_notifications,
        ));

        info!(
            process = %identity,
            cpu_id = identity.cpu_id(),
            zone = config.zone(),
            stealing_enabled = config.scheduling.stealing_enabled,
            "starting mail sync process"
        );

        Self {
            identity,
            config,
            admission,
            assignment: backends.assignment,
            supervisor,
        }
    }

    #[must_use]
    pub fn supervisor(&self) -> &AccountSupervisor {
        &self.supervisor
    }

    #[must_use]
    pub const fn identity(&self) -> &ProcessIdentity {
        &self.identity
    }

    /// Runs one tick: acquire, then converge.
    pub async fn poll(&self) -> TickReport {
        let mut report = TickReport {
            claimed: self.acquire().await,
            ..TickReport::default()
        };

        let view = match self.assignment.assigned().await {
            Ok(view) => view,
            Err(e) => {
                warn!(error = %e, "assignment service unavailable, skipping convergence");
                return report;
            }
        };

        let desired: BTreeSet<AccountId> = owned_by(&view, self.identity.process_identifier())
            .into_iter()
            .collect();
        report.desired = Some(desired.len());
        self.record_desired(desired.len());

        let plan = ConvergencePlan::compute(
            &self.supervisor.running().await,
            &self.supervisor.tracked().await,
            &desired,
        );

        for account_id in plan.to_start {
            let supervisor = Arc::clone(&self.supervisor);
            let attempt =
                tokio::spawn(async move { supervisor.start(account_id).await }.in_current_span());

            match attempt.await {
                Ok(Ok(StartOutcome::Started { .. })) => report.started.push(account_id),
                Ok(Ok(StartOutcome::Abandoned)) => report.failed.push(account_id),
                Ok(Ok(StartOutcome::AlreadyRunning | StartOutcome::NotFound)) => {}
                Ok(Err(e)) => {
                    log_account_error(account_id, &e, "starting");
                    report.failed.push(account_id);
                }
                Err(e) => {
                    error!(account_id, error = %e, "account sync start panicked");
                    report.failed.push(account_id);
                }
            }
        }

        for account_id in plan.to_stop {
            info!(account_id, "sync service stopping sync");
            let supervisor = Arc::clone(&self.supervisor);
            let attempt =
                tokio::spawn(async move { supervisor.stop(account_id).await }.in_current_span());

            match attempt.await {
                Ok(Ok(_)) => report.stopped.push(account_id),
                Ok(Err(e)) => {
                    log_account_error(account_id, &e, "stopping");
                    report.failed.push(account_id);
                }
                Err(e) => {
                    error!(account_id, error = %e, "account sync stop panicked");
                    report.failed.push(account_id);
                }
            }
        }

        report
    }

    async fn acquire(&self) -> Option<AccountId> {
        if !self.config.scheduling.stealing_enabled {
            return None;
        }

        if let AdmissionDecision::Saturated { cores } = self.admission.evaluate() {
            debug!(cores, "every core saturated, not claiming new accounts");
            return None;
        }

        match self.assignment.claim_next(self.identity.process_identifier()).await {
            Ok(Some(account_id)) => {
                info!(account_id, "claimed new account sync");
                Some(account_id)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "failed to claim account");
                None
            }
        }
    }

    fn record_desired(&self, count: usize) {
        let count = u32::try_from(count).unwrap_or(u32::MAX);
        gauge!(
            "mailsync.accounts.desired",
            "host" => self.identity.host().to_owned(),
            "cpu_id" => self.identity.cpu_id().to_string()
        )
        .set(f64::from(count));
    }

    /// Runs the loop until `cancel` fires, re-entering it whenever it panics.
    ///
    /// A panicking tick is followed by the usual poll interval (or the
    /// restart delay, if longer) before the loop starts again.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let span = info_span!("sync_service", cpu_id = self.identity.cpu_id());

        async move {
            loop {
                let service = Arc::clone(&self);
                let token = cancel.clone();
                let attempt =
                    tokio::spawn(async move { service.run_loop(token).await }.in_current_span());

                match attempt.await {
                    Ok(()) => break,
                    Err(e) if e.is_panic() => error!(error = %e, "sync loop panicked, restarting"),
                    Err(e) => error!(error = %e, "sync loop aborted, restarting"),
                }

                if cancel.is_cancelled() {
                    break;
                }

                // The failed tick never reached its sleep.
                let delay = self.config.poll_interval.max(self.config.restart_delay);
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }
            }
            info!("sync loop stopped");
        }
        .instrument(span)
        .await;
    }

    async fn run_loop(&self, cancel: CancellationToken) {
        loop {
            let report = self.poll().await;
            debug!(?report, "tick complete");

            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// Stops every account this process still holds.
    pub async fn shutdown(&self) {
        info!("stopping all account syncs");
        self.supervisor.stop_all().await;
    }
}

impl std::fmt::Debug for SyncService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncService")
            .field("identity", &self.identity)
            .field("poll_interval", &self.config.poll_interval)
            .field("supervisor", &self.supervisor)
            .finish_non_exhaustive()
    }
}

fn log_account_error(account_id: AccountId, e: &SyncError, action: &str) {
    if e.is_transient_storage() {
        warn!(account_id, error = %e, "database error {action} account sync");
    } else {
        error!(account_id, error = %e, "error {action} account sync");
    }
}
