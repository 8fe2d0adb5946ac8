//! Account records and their persistence.
//!
//! The scheduler never owns an account's lifecycle. It reads the current row
//! on every start and stop, and writes only the owning `sync_host` together
//! with the started/stopped markers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use deadpool_redis::redis::{self, AsyncCommands, Script};
use deadpool_redis::Pool;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::StoreError;

/// Opaque account identifier.
pub type AccountId = u64;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Sync types a provider backend supports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderInfo {
    /// Provider exposes contacts.
    pub contacts: bool,
    /// Provider exposes calendar events.
    pub events: bool,
    /// Provider can push event changes instead of being polled.
    pub push_events: bool,
}

/// A mailbox being synchronised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub email_address: String,
    /// Provider tag used to pick the mail monitor backend.
    pub provider: String,
    /// Human-readable provider label.
    pub verbose_provider: String,
    pub namespace_id: u64,
    pub provider_info: ProviderInfo,
    pub sync_email: bool,
    pub sync_contacts: bool,
    pub sync_events: bool,
    /// False once the account has been disabled and should stay stopped.
    pub sync_should_run: bool,
    /// Process currently syncing this account.
    pub sync_host: Option<String>,
    pub sync_started_at: Option<DateTime<Utc>>,
    pub sync_stopped_at: Option<DateTime<Utc>>,
}

impl Account {
    /// Creates an account that syncs mail only.
    pub fn new(id: AccountId, email_address: impl Into<String>, provider: impl Into<String>) -> Self {
        let provider = provider.into();
        Self {
            id,
            email_address: email_address.into(),
            verbose_provider: provider.clone(),
            provider,
            namespace_id: id,
            provider_info: ProviderInfo::default(),
            sync_email: true,
            sync_contacts: false,
            sync_events: false,
            sync_should_run: true,
            sync_host: None,
            sync_started_at: None,
            sync_stopped_at: None,
        }
    }

    /// Contacts sync is both enabled and supported by the provider.
    #[must_use]
    pub const fn wants_contacts(&self) -> bool {
        self.sync_contacts && self.provider_info.contacts
    }

    /// Event sync is both enabled and supported by the provider.
    #[must_use]
    pub const fn wants_events(&self) -> bool {
        self.sync_events && self.provider_info.events
    }

    /// Records that `sync_host` started syncing this account.
    pub fn sync_started(&mut self, sync_host: &str, at: DateTime<Utc>) {
        self.sync_host = Some(sync_host.to_owned());
        self.sync_started_at = Some(at);
    }

    /// Records that `sync_host` stopped syncing this account.
    ///
    /// Returns false and leaves the record untouched when another process
    /// owns it.
    pub fn sync_stopped(&mut self, sync_host: &str, at: DateTime<Utc>) -> bool {
        if self.sync_host.as_deref() != Some(sync_host) {
            return false;
        }
        self.sync_host = None;
        self.sync_stopped_at = Some(at);
        true
    }
}

/// Trait for account persistence backends.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Reads the current account row.
    async fn get(&self, id: AccountId) -> StoreResult<Option<Account>>;

    /// Commits `sync_host` as owner together with a started marker.
    async fn mark_sync_started(&self, id: AccountId, sync_host: &str) -> StoreResult<()>;

    /// Clears ownership and commits a stopped marker if `sync_host` owns the
    /// account. Returns whether the record changed.
    async fn mark_sync_stopped(&self, id: AccountId, sync_host: &str) -> StoreResult<bool>;
}

/// Hash field holding the JSON account record.
const RECORD_FIELD: &str = "record";
const SYNC_HOST_FIELD: &str = "sync_host";
const STARTED_AT_FIELD: &str = "sync_started_at";
const STOPPED_AT_FIELD: &str = "sync_stopped_at";

/// Takes ownership of an existing account and stamps the started marker.
const MARK_STARTED_SCRIPT: &str = r"
if redis.call('HEXISTS', KEYS[1], 'record') == 0 then
    return 0
end
redis.call('HSET', KEYS[1], 'sync_host', ARGV[1], 'sync_started_at', ARGV[2])
return 1
";

/// Releases ownership only if the caller still holds it.
const MARK_STOPPED_SCRIPT: &str = r"
if redis.call('HGET', KEYS[1], 'sync_host') ~= ARGV[1] then
    return 0
end
redis.call('HDEL', KEYS[1], 'sync_host')
redis.call('HSET', KEYS[1], 'sync_stopped_at', ARGV[2])
return 1
";

/// Valkey-backed account store.
///
/// Each account is a hash: the JSON record plus separate ownership fields, so
/// the owner check and the marker write run together in one script.
pub struct ValkeyAccountStore {
    pool: Pool,
    key_prefix: String,
    mark_started: Script,
    mark_stopped: Script,
}

impl ValkeyAccountStore {
    /// Creates a store over an existing pool.
    pub fn new(pool: Pool, key_prefix: &str) -> Self {
        Self {
            pool,
            key_prefix: format!("{key_prefix}:account:"),
            mark_started: Script::new(MARK_STARTED_SCRIPT),
            mark_stopped: Script::new(MARK_STOPPED_SCRIPT),
        }
    }

    fn account_key(&self, id: AccountId) -> String {
        format!("{}{}", self.key_prefix, id)
    }

    /// Writes a full account record, replacing any previous one.
    pub async fn put(&self, account: &Account) -> StoreResult<()> {
        let mut conn = self.pool.get().await?;
        let key = self.account_key(account.id);
        let json = serde_json::to_string(account)?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(&key)
            .ignore()
            .hset(&key, RECORD_FIELD, json)
            .ignore();
        if let Some(host) = &account.sync_host {
            pipe.hset(&key, SYNC_HOST_FIELD, host).ignore();
        }
        if let Some(at) = account.sync_started_at {
            pipe.hset(&key, STARTED_AT_FIELD, at.to_rfc3339()).ignore();
        }
        if let Some(at) = account.sync_stopped_at {
            pipe.hset(&key, STOPPED_AT_FIELD, at.to_rfc3339()).ignore();
        }

        let () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl AccountStore for ValkeyAccountStore {
    async fn get(&self, id: AccountId) -> StoreResult<Option<Account>> {
        let mut conn = self.pool.get().await?;
        let fields: HashMap<String, String> = conn.hgetall(self.account_key(id)).await?;

        if fields.is_empty() {
            return Ok(None);
        }
        decode_account(id, &fields).map(Some)
    }

    async fn mark_sync_started(&self, id: AccountId, sync_host: &str) -> StoreResult<()> {
        let mut conn = self.pool.get().await?;
        let _: i64 = self
            .mark_started
            .key(self.account_key(id))
            .arg(sync_host)
            .arg(Utc::now().to_rfc3339())
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn mark_sync_stopped(&self, id: AccountId, sync_host: &str) -> StoreResult<bool> {
        let mut conn = self.pool.get().await?;
        let changed: i64 = self
            .mark_stopped
            .key(self.account_key(id))
            .arg(sync_host)
            .arg(Utc::now().to_rfc3339())
            .invoke_async(&mut conn)
            .await?;
        Ok(changed == 1)
    }
}

impl std::fmt::Debug for ValkeyAccountStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValkeyAccountStore")
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

/// Rebuilds an account from its hash. Ownership fields win over whatever the
/// JSON record carries.
fn decode_account(id: AccountId, fields: &HashMap<String, String>) -> StoreResult<Account> {
    let corrupt = |reason: String| StoreError::Corrupt {
        account_id: id,
        reason,
    };

    let record = fields
        .get(RECORD_FIELD)
        .ok_or_else(|| corrupt("missing record field".to_owned()))?;
    let mut account: Account =
        serde_json::from_str(record).map_err(|e| corrupt(e.to_string()))?;

    let timestamp = |field: &str| {
        fields
            .get(field)
            .map(|raw| {
                DateTime::parse_from_rfc3339(raw)
                    .map(|at| at.with_timezone(&Utc))
                    .map_err(|e| corrupt(format!("{field}: {e}")))
            })
            .transpose()
    };

    account.sync_host = fields.get(SYNC_HOST_FIELD).cloned();
    account.sync_started_at = timestamp(STARTED_AT_FIELD)?;
    account.sync_stopped_at = timestamp(STOPPED_AT_FIELD)?;
    Ok(account)
}

/// In-memory account store for testing and local runs.
#[derive(Debug, Default)]
pub struct InMemoryAccountStore {
    accounts: DashMap<AccountId, Account>,
}

impl InMemoryAccountStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces an account.
    pub fn insert(&self, account: Account) {
        self.accounts.insert(account.id, account);
    }

    /// Deletes an account row.
    pub fn remove(&self, id: AccountId) -> Option<Account> {
        self.accounts.remove(&id).map(|(_, account)| account)
    }

    /// Returns a copy of the stored row.
    pub fn snapshot(&self, id: AccountId) -> Option<Account> {
        self.accounts.get(&id).map(|r| r.clone())
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn get(&self, id: AccountId) -> StoreResult<Option<Account>> {
        Ok(self.snapshot(id))
    }

    async fn mark_sync_started(&self, id: AccountId, sync_host: &str) -> StoreResult<()> {
        if let Some(mut account) = self.accounts.get_mut(&id) {
            account.sync_started(sync_host, Utc::now());
        }
        Ok(())
    }

    async fn mark_sync_stopped(&self, id: AccountId, sync_host: &str) -> StoreResult<bool> {
        Ok(self
            .accounts
            .get_mut(&id)
            .is_some_and(|mut account| account.sync_stopped(sync_host, Utc::now())))
    }
}
