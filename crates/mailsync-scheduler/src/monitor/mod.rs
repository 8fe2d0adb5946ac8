//! Monitor tasks: the per-account workers that perform synchronisation.
//!
//! The scheduler treats a monitor as an opaque, cancellable unit. It builds one
//! through a [`MonitorFactory`] picked from the [`MonitorRegistry`], calls
//! [`Monitor::start`], and later [`Monitor::kill`]. What a monitor actually does
//! is up to the backend that registered the factory.

mod registry;
mod task;

pub use registry::{MonitorRegistry, GENERIC_PROVIDER};
pub use task::{HeartbeatPass, SyncPass, TaskMonitor, TaskMonitorFactory};

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::account::{Account, AccountId};
use crate::error::Result;

/// Kind of synchronisation a monitor performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncKind {
    Email,
    Contacts,
    Events,
}

impl SyncKind {
    /// Every kind, in start order.
    pub const ALL: [Self; 3] = [Self::Email, Self::Contacts, Self::Events];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Contacts => "contacts",
            Self::Events => "events",
        }
    }
}

impl fmt::Display for SyncKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Construction parameters for contacts and events monitors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTarget {
    pub email_address: String,
    pub verbose_provider: String,
    pub account_id: AccountId,
    pub namespace_id: u64,
}

impl From<&Account> for SyncTarget {
    fn from(account: &Account) -> Self {
        Self {
            email_address: account.email_address.clone(),
            verbose_provider: account.verbose_provider.clone(),
            account_id: account.id,
            namespace_id: account.namespace_id,
        }
    }
}

/// What a factory is asked to build.
#[derive(Debug, Clone, Copy)]
pub enum MonitorTarget<'a> {
    /// Mail monitors receive the whole account.
    Email(&'a Account),
    Contacts(&'a SyncTarget),
    Events(&'a SyncTarget),
}

impl MonitorTarget<'_> {
    #[must_use]
    pub const fn kind(&self) -> SyncKind {
        match self {
            Self::Email(_) => SyncKind::Email,
            Self::Contacts(_) => SyncKind::Contacts,
            Self::Events(_) => SyncKind::Events,
        }
    }

    #[must_use]
    pub const fn account_id(&self) -> AccountId {
        match self {
            Self::Email(account) => account.id,
            Self::Contacts(target) | Self::Events(target) => target.account_id,
        }
    }
}

/// A cancellable background sync worker for one account.
pub trait Monitor: Send + fmt::Debug {
    /// Begins running in the background. Must not block on the sync itself.
    fn start(&mut self) -> Result<()>;

    /// Asks the monitor to stop as soon as it safely can. Best effort and
    /// idempotent; the caller drops the handle right after.
    fn kill(&mut self);
}

/// Builds monitors of one variant.
pub trait MonitorFactory: Send + Sync {
    /// Constructs a monitor without starting it.
    fn create(&self, target: MonitorTarget<'_>) -> Result<Box<dyn Monitor>>;
}
