//! Test fixtures for scheduler integration tests.

use async_trait::async_trait;
use mailsync_scheduler::account::StoreResult;
use mailsync_scheduler::{
    Account, AccountId, AccountStore, AssignmentView, CpuSampler, InMemoryAccountStore,
    InMemoryAssignmentClient, Monitor, MonitorFactory, MonitorTarget, StoreError, SyncError,
    SyncKind, WorkAssignment,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Builder for creating test Account instances.
pub struct AccountBuilder {
    account: Account,
}

impl AccountBuilder {
    /// Creates a mail-only gmail account.
    pub fn new(id: AccountId) -> Self {
        Self {
            account: Account::new(id, format!("user{id}@example.com"), "gmail"),
        }
    }

    /// Sets the provider tag.
    pub fn with_provider(mut self, provider: &str) -> Self {
        self.account.provider = provider.to_string();
        self.account.verbose_provider = provider.to_string();
        self
    }

    /// Enables contacts sync, with provider support.
    pub fn with_contacts(mut self) -> Self {
        self.account.provider_info.contacts = true;
        self.account.sync_contacts = true;
        self
    }

    /// Enables event sync, with provider support.
    pub fn with_events(mut self) -> Self {
        self.account.provider_info.events = true;
        self.account.sync_events = true;
        self
    }

    /// Marks the provider as able to push event changes.
    pub fn with_push_events(mut self) -> Self {
        self.account.provider_info.push_events = true;
        self
    }

    /// Sets whether the account should keep syncing.
    pub fn should_run(mut self, should_run: bool) -> Self {
        self.account.sync_should_run = should_run;
        self
    }

    /// Builds the Account.
    pub fn build(self) -> Account {
        self.account
    }
}

/// What happened to a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorCall {
    Start,
    Kill,
}

/// One recorded monitor call: account, backend label, call.
pub type MonitorEvent = (AccountId, &'static str, MonitorCall);

/// Shared record of every monitor call, in order.
#[derive(Debug, Clone, Default)]
pub struct MonitorLog {
    events: Arc<Mutex<Vec<MonitorEvent>>>,
}

impl MonitorLog {
    pub fn events(&self) -> Vec<MonitorEvent> {
        self.events.lock().clone()
    }

    pub fn for_account(&self, account_id: AccountId) -> Vec<(&'static str, MonitorCall)> {
        self.events
            .lock()
            .iter()
            .filter(|(id, _, _)| *id == account_id)
            .map(|(_, label, call)| (*label, *call))
            .collect()
    }

    pub fn count(&self, label: &str, call: MonitorCall) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|(_, l, c)| *l == label && *c == call)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    fn push(&self, event: MonitorEvent) {
        self.events.lock().push(event);
    }
}

/// Monitor that records its calls instead of syncing.
#[derive(Debug)]
pub struct RecordingMonitor {
    account_id: AccountId,
    kind: SyncKind,
    label: &'static str,
    log: MonitorLog,
    refuse: bool,
}

impl Monitor for RecordingMonitor {
    fn start(&mut self) -> mailsync_scheduler::Result<()> {
        if self.refuse {
            return Err(SyncError::monitor(self.account_id, self.kind, "provider refused"));
        }
        self.log.push((self.account_id, self.label, MonitorCall::Start));
        Ok(())
    }

    fn kill(&mut self) {
        self.log.push((self.account_id, self.label, MonitorCall::Kill));
    }
}

/// Factory for [`RecordingMonitor`]s under one backend label.
pub struct RecordingFactory {
    label: &'static str,
    log: MonitorLog,
    refuse_account: Option<AccountId>,
    panic_account: Option<AccountId>,
}

impl RecordingFactory {
    pub fn new(label: &'static str, log: MonitorLog, refuse_account: Option<AccountId>) -> Self {
        Self {
            label,
            log,
            refuse_account,
            panic_account: None,
        }
    }

    /// Makes `create` panic for one account.
    pub fn panicking_for(mut self, account_id: Option<AccountId>) -> Self {
        self.panic_account = account_id;
        self
    }
}

impl MonitorFactory for RecordingFactory {
    fn create(&self, target: MonitorTarget<'_>) -> mailsync_scheduler::Result<Box<dyn Monitor>> {
        if self.panic_account == Some(target.account_id()) {
            panic!("{} backend crashed for account {}", self.label, target.account_id());
        }
        Ok(Box::new(RecordingMonitor {
            account_id: target.account_id(),
            kind: target.kind(),
            label: self.label,
            log: self.log.clone(),
            refuse: self.refuse_account == Some(target.account_id()),
        }))
    }
}

/// CPU sampler returning whatever the test last set.
#[derive(Debug, Clone, Default)]
pub struct FixedCpuSampler {
    usage: Arc<Mutex<Vec<f32>>>,
}

impl FixedCpuSampler {
    pub fn set(&self, usage: &[f32]) {
        *self.usage.lock() = usage.to_vec();
    }
}

impl CpuSampler for FixedCpuSampler {
    fn sample(&self) -> Vec<f32> {
        self.usage.lock().clone()
    }
}

/// Account store whose writes can be made to fail transiently.
#[derive(Debug, Default)]
pub struct FlakyAccountStore {
    inner: InMemoryAccountStore,
    fail_writes: AtomicBool,
    panic_on_get: Mutex<Option<AccountId>>,
}

impl FlakyAccountStore {
    pub fn insert(&self, account: Account) {
        self.inner.insert(account);
    }

    pub fn snapshot(&self, id: AccountId) -> Option<Account> {
        self.inner.snapshot(id)
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Makes reads of one account panic.
    pub fn panic_on_get(&self, account_id: Option<AccountId>) {
        *self.panic_on_get.lock() = account_id;
    }

    fn check_writes(&self) -> StoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::transient("connection reset by peer"));
        }
        Ok(())
    }
}

#[async_trait]
impl AccountStore for FlakyAccountStore {
    async fn get(&self, id: AccountId) -> StoreResult<Option<Account>> {
        if *self.panic_on_get.lock() == Some(id) {
            panic!("row decoder crashed on account {id}");
        }
        self.inner.get(id).await
    }

    async fn mark_sync_started(&self, id: AccountId, sync_host: &str) -> StoreResult<()> {
        self.check_writes()?;
        self.inner.mark_sync_started(id, sync_host).await
    }

    async fn mark_sync_stopped(&self, id: AccountId, sync_host: &str) -> StoreResult<bool> {
        self.check_writes()?;
        self.inner.mark_sync_stopped(id, sync_host).await
    }
}

/// Assignment client that records releases and can simulate an outage.
#[derive(Debug, Default)]
pub struct RecordingAssignment {
    inner: InMemoryAssignmentClient,
    released: Mutex<Vec<(AccountId, String)>>,
    unavailable: AtomicBool,
    panic_next_view: AtomicBool,
    view_reads: AtomicUsize,
}

impl RecordingAssignment {
    pub fn enqueue(&self, account_id: AccountId) {
        self.inner.enqueue(account_id);
    }

    pub fn assign(&self, account_id: AccountId, process_identifier: &str) {
        self.inner.assign(account_id, process_identifier);
    }

    pub fn remove(&self, account_id: AccountId) {
        self.inner.remove(account_id);
    }

    pub fn owner(&self, account_id: AccountId) -> Option<String> {
        self.inner.owner(account_id)
    }

    /// Every `unassign` call received, in order.
    pub fn released(&self) -> Vec<(AccountId, String)> {
        self.released.lock().clone()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Makes the next `assigned` call panic.
    pub fn panic_next_view(&self) {
        self.panic_next_view.store(true, Ordering::SeqCst);
    }

    /// Number of `assigned` calls so far.
    pub fn view_reads(&self) -> usize {
        self.view_reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkAssignment for RecordingAssignment {
    async fn claim_next(&self, process_identifier: &str) -> mailsync_scheduler::Result<Option<AccountId>> {
        self.inner.claim_next(process_identifier).await
    }

    async fn assigned(&self) -> mailsync_scheduler::Result<AssignmentView> {
        self.view_reads.fetch_add(1, Ordering::SeqCst);
        if self.panic_next_view.swap(false, Ordering::SeqCst) {
            panic!("assignment view decoder crashed");
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SyncError::Assignment("connection refused".to_string()));
        }
        self.inner.assigned().await
    }

    async fn unassign(
        &self,
        account_id: AccountId,
        process_identifier: &str,
    ) -> mailsync_scheduler::Result<bool> {
        self.released
            .lock()
            .push((account_id, process_identifier.to_string()));
        self.inner.unassign(account_id, process_identifier).await
    }
}
