//! Mailsync scheduler - account assignment and monitor supervision for one
//! sync process in a fleet.
//!
//! Each sync process runs a reconciliation loop that:
//!
//! - **Admits work**: Claims an unassigned account only while at least one
//!   CPU core has headroom
//! - **Reads its assignment**: Derives the accounts it should sync from the
//!   shared assignment service, never from its own claim results
//! - **Converges**: Starts monitors for newly assigned accounts and stops
//!   monitors for accounts assigned elsewhere
//! - **Survives failures**: Isolates errors per account and restarts the loop
//!   itself if it ever panics
//!
//! # Architecture
//!
//! ```text
//! SyncService ──▶ AdmissionController ──▶ CpuSampler
//!      │
//!      ├──▶ WorkAssignment (claim_next, assigned)
//!      │
//!      └──▶ AccountSupervisor ──▶ MonitorRegistry ──▶ Monitor (start, kill)
//!                  │
//!                  ├──▶ AccountStore (sync_host, started/stopped markers)
//!                  ├──▶ HeartbeatStore (clear)
//!                  └──▶ WorkAssignment (unassign)
//! ```
//!
//! Assignment is advisory: claims and releases are idempotent and the loop
//! recomputes the desired set every tick.
//!
//! # Example
//!
//! ```ignore
//! use mailsync_scheduler::{ProcessIdentity, SyncService, SyncServiceConfig};
//!
//! let config = SyncServiceConfig::load()?;
//! let service = Arc::new(SyncService::new(identity, config, admission, backends));
//! service.run(cancel).await;
//! ```

pub mod account;
pub mod admission;
pub mod assignment;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod identity;
pub mod monitor;
pub mod service;
pub mod supervisor;

// Re-export main types
pub use account::{Account, AccountId, AccountStore, InMemoryAccountStore, ProviderInfo, ValkeyAccountStore};
pub use admission::{AdmissionController, AdmissionDecision, CpuSampler, SystemCpuSampler};
pub use assignment::{AssignmentView, InMemoryAssignmentClient, ValkeyAssignmentClient, WorkAssignment};
pub use config::SyncServiceConfig;
pub use error::{Result, StoreError, SyncError};
pub use heartbeat::{HeartbeatStore, InMemoryHeartbeatStore, ValkeyHeartbeatStore};
pub use identity::ProcessIdentity;
pub use monitor::{Monitor, MonitorFactory, MonitorRegistry, MonitorTarget, SyncKind, SyncTarget};
pub use service::{ConvergencePlan, SyncBackends, SyncService, TickReport};
pub use supervisor::{AccountSupervisor, RunningSet, StartOutcome};
