//! Client for the shared work-assignment service.
//!
//! The assignment service maps account ids to the process that should sync
//! them. Claims and releases are idempotent and the view is only eventually
//! consistent, so the reconciliation loop always derives its desired set from
//! [`WorkAssignment::assigned`] rather than from a claim result.

use async_trait::async_trait;
use deadpool_redis::redis::{AsyncCommands, Script};
use deadpool_redis::Pool;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

use crate::account::AccountId;
use crate::error::{Result, SyncError};

/// Current fleet-wide assignment: account id to process identifier.
pub type AssignmentView = HashMap<AccountId, String>;

/// Trait for work-assignment backends.
#[async_trait]
pub trait WorkAssignment: Send + Sync {
    /// Takes ownership of one unassigned account, if any.
    async fn claim_next(&self, process_identifier: &str) -> Result<Option<AccountId>>;

    /// Returns every assigned account in this zone and its owner.
    async fn assigned(&self) -> Result<AssignmentView>;

    /// Releases ownership. Returns false, not an error, if `process_identifier`
    /// does not own the account.
    async fn unassign(&self, account_id: AccountId, process_identifier: &str) -> Result<bool>;
}

/// Accounts assigned to `process_identifier`, in id order.
#[must_use]
pub fn owned_by(view: &AssignmentView, process_identifier: &str) -> Vec<AccountId> {
    let mut owned: Vec<_> = view
        .iter()
        .filter(|(_, owner)| owner.as_str() == process_identifier)
        .map(|(id, _)| *id)
        .collect();
    owned.sort_unstable();
    owned
}

/// Claims the first account whose owner is empty.
const CLAIM_SCRIPT: &str = r"
local entries = redis.call('HGETALL', KEYS[1])
for i = 1, #entries, 2 do
    if entries[i + 1] == '' then
        redis.call('HSET', KEYS[1], entries[i], ARGV[1])
        return entries[i]
    end
end
return false
";

/// Clears the owner only if it matches the caller.
const UNASSIGN_SCRIPT: &str = r"
if redis.call('HGET', KEYS[1], ARGV[1]) == ARGV[2] then
    redis.call('HSET', KEYS[1], ARGV[1], '')
    return 1
end
return 0
";

/// Valkey-backed assignment client.
///
/// Each zone is one hash of account id to owner; an empty owner marks an
/// account waiting to be claimed.
pub struct ValkeyAssignmentClient {
    pool: Pool,
    key: String,
    claim: Script,
    unassign: Script,
}

impl ValkeyAssignmentClient {
    /// Creates a client for one zone.
    pub fn new(pool: Pool, key_prefix: &str, zone: &str) -> Self {
        Self {
            pool,
            key: format!("{key_prefix}:assignments:{zone}"),
            claim: Script::new(CLAIM_SCRIPT),
            unassign: Script::new(UNASSIGN_SCRIPT),
        }
    }
}

#[async_trait]
impl WorkAssignment for ValkeyAssignmentClient {
    async fn claim_next(&self, process_identifier: &str) -> Result<Option<AccountId>> {
        let mut conn = self.pool.get().await?;
        let claimed: Option<String> = self
            .claim
            .key(&self.key)
            .arg(process_identifier)
            .invoke_async(&mut conn)
            .await?;

        claimed.map(|raw| parse_claimed(&raw)).transpose()
    }

    async fn assigned(&self) -> Result<AssignmentView> {
        let mut conn = self.pool.get().await?;
        let entries: HashMap<String, String> = conn.hgetall(&self.key).await?;

        Ok(entries
            .into_iter()
            .filter(|(_, owner)| !owner.is_empty())
            .filter_map(|(raw, owner)| parse_account_id(&raw).map(|id| (id, owner)))
            .collect())
    }

    async fn unassign(&self, account_id: AccountId, process_identifier: &str) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        let released: i64 = self
            .unassign
            .key(&self.key)
            .arg(account_id)
            .arg(process_identifier)
            .invoke_async(&mut conn)
            .await?;

        Ok(released == 1)
    }
}

impl std::fmt::Debug for ValkeyAssignmentClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValkeyAssignmentClient")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// A claimed field that is not an account id now names this process as its
/// owner, so it is reported rather than skipped.
fn parse_claimed(raw: &str) -> Result<AccountId> {
    raw.parse()
        .map_err(|e| SyncError::Assignment(format!("claimed malformed account id {raw:?}: {e}")))
}

fn parse_account_id(raw: &str) -> Option<AccountId> {
    match raw.parse() {
        Ok(id) => Some(id),
        Err(e) => {
            warn!(raw, error = %e, "skipping malformed account id in assignment view");
            None
        }
    }
}

/// In-memory assignment client for testing and single-process runs.
#[derive(Debug, Default)]
pub struct InMemoryAssignmentClient {
    // Ordered so claims are deterministic.
    owners: Mutex<BTreeMap<AccountId, Option<String>>>,
}

impl InMemoryAssignmentClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an unassigned account if unknown.
    pub fn enqueue(&self, account_id: AccountId) {
        self.owners.lock().entry(account_id).or_insert(None);
    }

    /// Forces an owner, as an operator or another process would.
    pub fn assign(&self, account_id: AccountId, process_identifier: &str) {
        self.owners
            .lock()
            .insert(account_id, Some(process_identifier.to_owned()));
    }

    /// Drops an account from the zone entirely.
    pub fn remove(&self, account_id: AccountId) {
        self.owners.lock().remove(&account_id);
    }

    pub fn owner(&self, account_id: AccountId) -> Option<String> {
        self.owners.lock().get(&account_id).cloned().flatten()
    }
}

#[async_trait]
impl WorkAssignment for InMemoryAssignmentClient {
    async fn claim_next(&self, process_identifier: &str) -> Result<Option<AccountId>> {
        let mut owners = self.owners.lock();
        let claimed = owners
            .iter_mut()
            .find(|(_, owner)| owner.is_none())
            .map(|(id, owner)| {
                *owner = Some(process_identifier.to_owned());
                *id
            });
        Ok(claimed)
    }

    async fn assigned(&self) -> Result<AssignmentView> {
        Ok(self
            .owners
            .lock()
            .iter()
            .filter_map(|(id, owner)| owner.clone().map(|owner| (*id, owner)))
            .collect())
    }

    async fn unassign(&self, account_id: AccountId, process_identifier: &str) -> Result<bool> {
        let mut owners = self.owners.lock();
        match owners.get_mut(&account_id) {
            Some(owner) if owner.as_deref() == Some(process_identifier) => {
                *owner = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
