//! Common test utilities for scheduler integration tests.

#![allow(dead_code)]

pub mod fixtures;

use fixtures::{FixedCpuSampler, FlakyAccountStore, MonitorLog, RecordingAssignment, RecordingFactory};
use mailsync_scheduler::{
    AccountId, AdmissionController, InMemoryHeartbeatStore, MonitorFactory, MonitorRegistry, ProcessIdentity,
    SyncBackends, SyncService, SyncServiceConfig,
};
use std::sync::Arc;
use std::time::Duration;

/// Process identifier every test service runs as.
pub const PROCESS: &str = "hostA:0";

/// Complete test service setup with all collaborators wired together.
pub struct TestService {
    pub service: Arc<SyncService>,
    pub accounts: Arc<FlakyAccountStore>,
    pub heartbeats: Arc<InMemoryHeartbeatStore>,
    pub assignment: Arc<RecordingAssignment>,
    pub cpu: FixedCpuSampler,
    pub monitors: MonitorLog,
}

impl TestService {
    /// Creates a test service with default configuration.
    pub fn new() -> Self {
        Self::build(test_config(), None, None)
    }

    /// Creates a test service with custom configuration.
    pub fn with_config(config: SyncServiceConfig) -> Self {
        Self::build(config, None, None)
    }

    /// Creates a test service whose monitors refuse to start for one account.
    pub fn refusing(account_id: AccountId) -> Self {
        Self::build(test_config(), Some(account_id), None)
    }

    /// Creates a test service whose mail backend panics for one account.
    pub fn panicking(account_id: AccountId) -> Self {
        Self::build(test_config(), None, Some(account_id))
    }

    fn build(
        config: SyncServiceConfig,
        refuse_account: Option<AccountId>,
        panic_account: Option<AccountId>,
    ) -> Self {
        let accounts = Arc::new(FlakyAccountStore::default());
        let heartbeats = Arc::new(InMemoryHeartbeatStore::new());
        let assignment = Arc::new(RecordingAssignment::default());
        let cpu = FixedCpuSampler::default();
        let monitors = MonitorLog::default();

        let factory = |label: &'static str| -> Arc<dyn MonitorFactory> {
            Arc::new(RecordingFactory::new(label, monitors.clone(), refuse_account))
        };
        let email = Arc::new(
            RecordingFactory::new("email", monitors.clone(), refuse_account)
                .panicking_for(panic_account),
        );
        let registry = MonitorRegistry::new(email, factory("contacts"), factory("events"))
            .with_email_backend("eas", factory("eas"))
            .with_push_events(factory("push-events"));

        let admission = AdmissionController::new(&config.admission, Box::new(cpu.clone()));
        let backends = SyncBackends {
            accounts: accounts.clone(),
            heartbeats: heartbeats.clone(),
            assignment: assignment.clone(),
            monitors: registry,
        };

        let service = Arc::new(SyncService::new(
            ProcessIdentity::with_host("hostA", 0, PROCESS),
            config,
            admission,
            backends,
        ));

        Self {
            service,
            accounts,
            heartbeats,
            assignment,
            cpu,
            monitors,
        }
    }
}

impl Default for TestService {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration with a short poll interval for loop tests.
pub fn test_config() -> SyncServiceConfig {
    let mut config = SyncServiceConfig::default();
    config.poll_interval = Duration::from_millis(100);
    config
}
