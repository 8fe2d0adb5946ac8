//! Per-account start/stop of monitors.
//!
//! The supervisor owns the [`RunningSet`]: which accounts this process is
//! syncing and the live monitor handles for each. Every start and stop runs
//! under one process-wide lock, so the multi-step sequence of starting
//! monitors, persisting the owner and updating bookkeeping never interleaves
//! with another account's sequence.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::account::{Account, AccountId, AccountStore};
use crate::assignment::WorkAssignment;
use crate::error::{Result, SyncError};
use crate::heartbeat::HeartbeatStore;
use crate::identity::ProcessIdentity;
use crate::monitor::{Monitor, MonitorFactory, MonitorRegistry, MonitorTarget, SyncKind, SyncTarget};

/// Accounts this process is syncing and their monitor handles.
///
/// An account in `syncing` always has at least one handle unless none of its
/// capabilities apply. Handles may exist for an account outside `syncing`
/// after a start that failed part way; the next start reuses them and a stop
/// kills them.
#[derive(Debug, Default)]
pub struct RunningSet {
    syncing: BTreeSet<AccountId>,
    handles: BTreeMap<AccountId, BTreeMap<SyncKind, Box<dyn Monitor>>>,
}

impl RunningSet {
    #[must_use]
    pub fn contains(&self, account_id: AccountId) -> bool {
        self.syncing.contains(&account_id)
    }

    /// Accounts fully started on this process.
    #[must_use]
    pub fn syncing(&self) -> BTreeSet<AccountId> {
        self.syncing.clone()
    }

    /// Accounts that are syncing or hold any monitor handle.
    #[must_use]
    pub fn tracked(&self) -> BTreeSet<AccountId> {
        self.syncing
            .iter()
            .chain(self.handles.keys())
            .copied()
            .collect()
    }

    /// Kinds with a live handle for the account.
    #[must_use]
    pub fn kinds(&self, account_id: AccountId) -> Vec<SyncKind> {
        self.handles
            .get(&account_id)
            .map(|monitors| monitors.keys().copied().collect())
            .unwrap_or_default()
    }

    fn has_handle(&self, account_id: AccountId, kind: SyncKind) -> bool {
        self.handles
            .get(&account_id)
            .is_some_and(|monitors| monitors.contains_key(&kind))
    }

    fn insert_handle(&mut self, account_id: AccountId, kind: SyncKind, monitor: Box<dyn Monitor>) {
        self.handles.entry(account_id).or_default().insert(kind, monitor);
    }

    /// Kills and drops every handle for the account.
    fn kill_all(&mut self, account_id: AccountId) -> Vec<SyncKind> {
        let Some(monitors) = self.handles.remove(&account_id) else {
            return Vec::new();
        };
        monitors
            .into_iter()
            .map(|(kind, mut monitor)| {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| monitor.kill())) {
                    warn!(
                        account_id,
                        kind = %kind,
                        panic = %panic_message(payload.as_ref()),
                        "monitor panicked while being killed"
                    );
                }
                kind
            })
            .collect()
    }
}

/// What a start request did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// Monitors are running and the account joined the running set.
    Started { kinds: Vec<SyncKind> },
    /// The account was already in the running set.
    AlreadyRunning,
    /// No such account row.
    NotFound,
    /// A monitor failed to build or start; retried on a later tick.
    Abandoned,
}

/// Starts and stops the monitors of accounts assigned to this process.
pub struct AccountSupervisor {
    identity: ProcessIdentity,
    accounts: Arc<dyn AccountStore>,
    heartbeats: Arc<dyn HeartbeatStore>,
    assignment: Arc<dyn WorkAssignment>,
    monitors: MonitorRegistry,
    push_notifications: bool,
    running: Mutex<RunningSet>,
}

impl AccountSupervisor {
    pub fn new(
        identity: ProcessIdentity,
        accounts: Arc<dyn AccountStore>,
        heartbeats: Arc<dyn HeartbeatStore>,
        assignment: Arc<dyn WorkAssignment>,
        monitors: MonitorRegistry,
        push_notifications: bool,
    ) -> Self {
        Self {
            identity,
            accounts,
            heartbeats,
            assignment,
            monitors,
            push_notifications,
            running: Mutex::new(RunningSet::default()),
        }
    }

    /// Starts syncing an account.
    ///
    /// Missing accounts and accounts already running are no-ops. Monitor
    /// failures are logged here and reported as [`StartOutcome::Abandoned`].
    /// Storage errors are returned to the caller.
    pub async fn start(&self, account_id: AccountId) -> Result<StartOutcome> {
        let mut running = self.running.lock().await;

        let Some(account) = self.accounts.get(account_id).await? else {
            warn!(account_id, "no such account");
            return Ok(StartOutcome::NotFound);
        };

        if running.contains(account_id) {
            info!(account_id, "sync already started");
            return Ok(StartOutcome::AlreadyRunning);
        }

        info!(
            account_id,
            email_address = %account.email_address,
            provider = %account.provider,
            "starting sync"
        );

        let kinds = match self.start_monitors(&mut running, &account) {
            Ok(kinds) => kinds,
            Err(e) => {
                error!(account_id, error = %e, "error starting sync");
                return Ok(StartOutcome::Abandoned);
            }
        };

        self.accounts
            .mark_sync_started(account_id, self.identity.process_identifier())
            .await?;
        running.syncing.insert(account_id);

        info!(
            account_id,
            sync_host = %self.identity,
            kinds = ?kinds,
            "sync started"
        );
        Ok(StartOutcome::Started { kinds })
    }

    fn start_monitors(&self, running: &mut RunningSet, account: &Account) -> Result<Vec<SyncKind>> {
        let mut kinds = Vec::new();

        if account.sync_email {
            let factory = self.monitors.email_factory(&account.provider);
            ensure_monitor(running, factory, MonitorTarget::Email(account))?;
            kinds.push(SyncKind::Email);
        }

        let target = SyncTarget::from(account);

        if account.wants_contacts() {
            let factory = self.monitors.contacts_factory();
            ensure_monitor(running, factory, MonitorTarget::Contacts(&target))?;
            kinds.push(SyncKind::Contacts);
        }

        if account.wants_events() {
            let factory = self.monitors.events_factory(account, self.push_notifications);
            ensure_monitor(running, factory, MonitorTarget::Events(&target))?;
            kinds.push(SyncKind::Events);
        }

        Ok(kinds)
    }

    /// Stops syncing an account and releases its claim.
    ///
    /// Kills every recorded monitor, persists the stopped marker, and releases
    /// the assignment. Returns the release acknowledgement. The release is
    /// attempted even when persisting fails; the persistence error is then
    /// returned.
    pub async fn stop(&self, account_id: AccountId) -> Result<bool> {
        let mut running = self.running.lock().await;

        info!(account_id, "stopping monitors");
        let killed = running.kill_all(account_id);
        running.syncing.remove(&account_id);
        debug!(account_id, kinds = ?killed, "monitors killed");

        let persisted = self.record_stopped(account_id).await;
        let released = self
            .assignment
            .unassign(account_id, self.identity.process_identifier())
            .await?;
        persisted?;

        Ok(released)
    }

    async fn record_stopped(&self, account_id: AccountId) -> Result<()> {
        let Some(account) = self.accounts.get(account_id).await? else {
            debug!(account_id, "account gone, nothing to mark stopped");
            return Ok(());
        };

        if !account.sync_should_run {
            self.heartbeats.clear(account_id).await?;
        }

        if self
            .accounts
            .mark_sync_stopped(account_id, self.identity.process_identifier())
            .await?
        {
            info!(account_id, "sync stopped");
        }
        Ok(())
    }

    /// Stops every tracked account. Used on shutdown.
    pub async fn stop_all(&self) {
        for account_id in self.tracked().await {
            if let Err(e) = self.stop(account_id).await {
                warn!(account_id, error = %e, "failed to stop account during shutdown");
            }
        }
    }

    /// Accounts fully started on this process.
    pub async fn running(&self) -> BTreeSet<AccountId> {
        self.running.lock().await.syncing()
    }

    /// Accounts that are running or hold leftover monitor handles.
    pub async fn tracked(&self) -> BTreeSet<AccountId> {
        self.running.lock().await.tracked()
    }

    /// Monitor kinds currently held for an account.
    pub async fn monitor_kinds(&self, account_id: AccountId) -> Vec<SyncKind> {
        self.running.lock().await.kinds(account_id)
    }

    #[must_use]
    pub const fn identity(&self) -> &ProcessIdentity {
        &self.identity
    }
}

impl std::fmt::Debug for AccountSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountSupervisor")
            .field("identity", &self.identity)
            .field("monitors", &self.monitors)
            .field("push_notifications", &self.push_notifications)
            .finish_non_exhaustive()
    }
}

/// Builds and starts a monitor unless a live one of the same kind exists.
fn ensure_monitor(
    running: &mut RunningSet,
    factory: &Arc<dyn MonitorFactory>,
    target: MonitorTarget<'_>,
) -> Result<()> {
    let (account_id, kind) = (target.account_id(), target.kind());
    if running.has_handle(account_id, kind) {
        debug!(account_id, kind = %kind, "reusing monitor from earlier attempt");
        return Ok(());
    }

    let panicked = |payload: Box<dyn Any + Send>| {
        SyncError::monitor(
            account_id,
            kind,
            format!("panicked: {}", panic_message(payload.as_ref())),
        )
    };

    let mut monitor = panic::catch_unwind(AssertUnwindSafe(|| factory.create(target)))
        .map_err(panicked)??;

    let started = panic::catch_unwind(AssertUnwindSafe(|| monitor.start()))
        .map_err(panicked)
        .and_then(|started| started);
    if let Err(e) = started {
        // Best effort: a monitor that panicked may panic again here.
        let _ = panic::catch_unwind(AssertUnwindSafe(|| monitor.kill()));
        return Err(e);
    }
    running.insert_handle(account_id, kind, monitor);
    Ok(())
}

/// Text of a panic payload, for logging.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|msg| (*msg).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_owned())
}
