//! Externally visible per-account sync status.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use deadpool_redis::{redis::AsyncCommands, Pool};
use std::collections::HashMap;

use crate::account::{AccountId, StoreResult};
use crate::monitor::SyncKind;

/// Trait for heartbeat status backends.
#[async_trait]
pub trait HeartbeatStore: Send + Sync {
    /// Records that a monitor of `kind` is alive for the account.
    async fn report(&self, account_id: AccountId, kind: SyncKind) -> StoreResult<()>;

    /// Removes all status for the account. Idempotent.
    async fn clear(&self, account_id: AccountId) -> StoreResult<()>;
}

/// Valkey-backed heartbeat store: one hash per account of kind to unix time.
pub struct ValkeyHeartbeatStore {
    pool: Pool,
    key_prefix: String,
}

impl ValkeyHeartbeatStore {
    /// Creates a store over an existing pool.
    pub fn new(pool: Pool, key_prefix: &str) -> Self {
        Self {
            pool,
            key_prefix: format!("{key_prefix}:heartbeat:"),
        }
    }

    fn heartbeat_key(&self, account_id: AccountId) -> String {
        format!("{}{}", self.key_prefix, account_id)
    }
}

#[async_trait]
impl HeartbeatStore for ValkeyHeartbeatStore {
    async fn report(&self, account_id: AccountId, kind: SyncKind) -> StoreResult<()> {
        let mut conn = self.pool.get().await?;
        conn.hset::<_, _, _, ()>(
            self.heartbeat_key(account_id),
            kind.as_str(),
            Utc::now().timestamp(),
        )
        .await?;
        Ok(())
    }

    async fn clear(&self, account_id: AccountId) -> StoreResult<()> {
        let mut conn = self.pool.get().await?;
        conn.del::<_, ()>(self.heartbeat_key(account_id)).await?;
        Ok(())
    }
}

impl std::fmt::Debug for ValkeyHeartbeatStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValkeyHeartbeatStore")
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

/// In-memory heartbeat store for testing.
#[derive(Debug, Default)]
pub struct InMemoryHeartbeatStore {
    status: DashMap<AccountId, HashMap<SyncKind, i64>>,
}

impl InMemoryHeartbeatStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Kinds that have reported for the account.
    pub fn reported(&self, account_id: AccountId) -> Vec<SyncKind> {
        self.status
            .get(&account_id)
            .map(|kinds| kinds.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn has_status(&self, account_id: AccountId) -> bool {
        self.status.contains_key(&account_id)
    }
}

#[async_trait]
impl HeartbeatStore for InMemoryHeartbeatStore {
    async fn report(&self, account_id: AccountId, kind: SyncKind) -> StoreResult<()> {
        self.status
            .entry(account_id)
            .or_default()
            .insert(kind, Utc::now().timestamp());
        Ok(())
    }

    async fn clear(&self, account_id: AccountId) -> StoreResult<()> {
        self.status.remove(&account_id);
        Ok(())
    }
}
