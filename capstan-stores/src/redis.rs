// Copyright 2025 Capstan Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Redis-backed checkpoint store and work queue.
//!
//! Both types share a `deadpool-redis` connection pool and retry transient
//! failures with exponential backoff.
//!
//! # Key Layout
//!
//! Every key of a cluster carries the cluster name as a hash tag, so the keys
//! touched by one script always live in the same slot:
//!
//! ```text
//! {prefix}:{cluster}:watcher:{db.coll}   hash: batchId, count, checkpoint (JSON)
//! {prefix}:{cluster}:ledger              hash: {watcherId}::{batchStatus} -> entry (JSON)
//! {prefix}:{cluster}:pending:{db.coll}   sorted set of unprocessed batch ids
//! {prefix}:{cluster}:namespaces          JSON array
//! {prefix}:{cluster}:tracker:{component} "start" | "stop"
//! {prefix}:{cluster}:status              JSON
//! {prefix}:queue:{name}                  list of ready messages
//! {prefix}:queue:{name}:delayed          sorted set scored by visibility time
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use capstan_core::checkpoint::CheckpointStore;
//! use capstan_core::event::Namespace;
//! use capstan_stores::redis::{RedisCheckpointStore, RedisConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RedisConfig::builder()
//!     .url("redis://localhost:6379")
//!     .pool_size(10)
//!     .build()?;
//!
//! let store = RedisCheckpointStore::new(config).await?;
//! let checkpoint = store
//!     .get_watcher("prod", &Namespace::new("shop", "orders"))
//!     .await?;
//! println!("resuming from {:?}", checkpoint.map(|c| c.resume_token));
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use capstan_core::checkpoint::{
    ChangeLedgerEntry, CheckpointError, CheckpointStore, TrackerState, WatcherCheckpoint,
};
use capstan_core::control::{QueueError, WorkQueue};
use capstan_core::event::Namespace;
use capstan_core::lag::ReplicationStatus;
use chrono::{DateTime, Utc};
use deadpool_redis::{Config as PoolConfig, Connection, Pool, Runtime};
use redis::{AsyncCommands, RedisError, Script};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Default key prefix.
const KEY_PREFIX: &str = "capstan";

/// Maximum number of retry attempts for transient Redis errors.
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff (milliseconds).
const BASE_RETRY_DELAY_MS: u64 = 100;

/// Applies a flush: the watcher row moves forward only for a newer batch id,
/// and the ledger entry is written either way.
///
/// KEYS: watcher hash, ledger hash, pending set.
/// ARGV: batch id, document delta, checkpoint JSON, ledger field, entry JSON,
/// "1" when the entry is unprocessed.
const COMMIT_SCRIPT: &str = r"
local stored = redis.call('HGET', KEYS[1], 'batchId')
if (not stored) or tonumber(stored) < tonumber(ARGV[1]) then
    redis.call('HINCRBY', KEYS[1], 'count', ARGV[2])
    redis.call('HSET', KEYS[1], 'batchId', ARGV[1], 'checkpoint', ARGV[3])
end
if ARGV[4] ~= '' then
    redis.call('HSET', KEYS[2], ARGV[4], ARGV[5])
    if ARGV[6] == '1' then
        redis.call('ZADD', KEYS[3], ARGV[1], ARGV[1])
    else
        redis.call('ZREM', KEYS[3], ARGV[1])
    end
end
return 1
";

/// Moves a ledger entry to its processed field if it is still unprocessed.
///
/// KEYS: ledger hash, pending set.
/// ARGV: unprocessed field, processed field, processed entry JSON, batch id.
const MARK_PROCESSED_SCRIPT: &str = r"
if redis.call('HEXISTS', KEYS[1], ARGV[1]) == 0 then
    return 0
end
redis.call('HDEL', KEYS[1], ARGV[1])
redis.call('HSET', KEYS[1], ARGV[2], ARGV[3])
redis.call('ZREM', KEYS[2], ARGV[4])
return 1
";

/// Enqueues a delayed message under a unique member.
///
/// KEYS: delayed set, sequence counter. ARGV: visibility time (ms), body.
const DELAY_SCRIPT: &str = r"
local id = redis.call('INCR', KEYS[2])
redis.call('ZADD', KEYS[1], ARGV[1], id .. ':' .. ARGV[2])
return id
";

/// Moves due delayed messages to the ready list.
///
/// KEYS: delayed set, ready list. ARGV: current time (ms).
const PROMOTE_SCRIPT: &str = r"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, member in ipairs(due) do
    local sep = string.find(member, ':', 1, true)
    redis.call('RPUSH', KEYS[2], string.sub(member, sep + 1))
end
if #due > 0 then
    redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
end
return #due
";

/// Configuration for the Redis backends.
///
/// ```rust
/// use capstan_stores::redis::RedisConfig;
/// use std::time::Duration;
///
/// let config = RedisConfig::builder()
///     .url("redis://localhost:6379")
///     .pool_size(15)
///     .connection_timeout(Duration::from_secs(2))
///     .build()
///     .expect("valid config");
/// assert_eq!(config.key_prefix, "capstan");
/// ```
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis connection URL (e.g., "redis://localhost:6379")
    pub url: String,

    /// Connection pool size (default: 10)
    pub pool_size: usize,

    /// Prefix of every key (default: "capstan")
    pub key_prefix: String,

    /// Connection timeout (default: 5 seconds)
    pub connection_timeout: Duration,

    /// Maximum number of retries for transient errors (default: 3)
    pub max_retries: u32,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 10,
            key_prefix: KEY_PREFIX.to_string(),
            connection_timeout: Duration::from_secs(5),
            max_retries: MAX_RETRIES,
        }
    }
}

impl RedisConfig {
    /// Creates a new builder for `RedisConfig`.
    #[must_use]
    pub fn builder() -> RedisConfigBuilder {
        RedisConfigBuilder::new()
    }
}

/// Builder for [`RedisConfig`] with validation.
#[derive(Debug, Default)]
pub struct RedisConfigBuilder {
    url: Option<String>,
    pool_size: Option<usize>,
    key_prefix: Option<String>,
    connection_timeout: Option<Duration>,
    max_retries: Option<u32>,
}

impl RedisConfigBuilder {
    /// Creates a builder with every field unset.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the Redis connection URL.
    ///
    /// # Formats
    ///
    /// - Standalone: `redis://localhost:6379`
    /// - With auth: `redis://:password@localhost:6379`
    /// - With database: `redis://localhost:6379/0`
    /// - TLS: `rediss://localhost:6380`
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Default: 10
    #[must_use]
    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = Some(size);
        self
    }

    /// Prefix shared by every key, for running several deployments on one
    /// Redis instance.
    #[must_use]
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    /// Default: 5 seconds
    #[must_use]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = Some(timeout);
        self
    }

    /// Default: 3
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Builds the `RedisConfig`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is missing, the pool size is 0 or the key
    /// prefix is empty.
    pub fn build(self) -> Result<RedisConfig, CheckpointError> {
        let url = self
            .url
            .ok_or_else(|| CheckpointError::Other("Redis URL is required".to_string()))?;

        let pool_size = self.pool_size.unwrap_or(10);
        if pool_size == 0 {
            return Err(CheckpointError::Other(
                "Pool size must be greater than 0".to_string(),
            ));
        }

        let key_prefix = self.key_prefix.unwrap_or_else(|| KEY_PREFIX.to_string());
        if key_prefix.is_empty() {
            return Err(CheckpointError::Other("Key prefix cannot be empty".to_string()));
        }

        Ok(RedisConfig {
            url,
            pool_size,
            key_prefix,
            connection_timeout: self.connection_timeout.unwrap_or(Duration::from_secs(5)),
            max_retries: self.max_retries.unwrap_or(MAX_RETRIES),
        })
    }
}

/// Pool plus retry policy shared by the store and the queue.
#[derive(Clone)]
struct RedisClient {
    pool: Pool,
    config: RedisConfig,
}

impl RedisClient {
    async fn connect(config: RedisConfig) -> Result<Self, String> {
        debug!(url = %config.url, pool_size = config.pool_size, "Connecting to Redis");

        let mut pool_config = PoolConfig::from_url(&config.url);
        let mut pool = deadpool_redis::PoolConfig::new(config.pool_size);
        pool.timeouts.wait = Some(config.connection_timeout);
        pool.timeouts.create = Some(config.connection_timeout);
        pool.timeouts.recycle = Some(config.connection_timeout);
        pool_config.pool = Some(pool);

        let pool = pool_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| format!("Failed to create pool: {e}"))?;

        let mut conn = pool
            .get()
            .await
            .map_err(|e| format!("Failed to connect to Redis: {e}"))?;
        redis::cmd("PING")
            .query_async::<()>(&mut *conn)
            .await
            .map_err(|e| format!("Redis connection test failed: {e}"))?;

        debug!("Redis connection pool ready");
        Ok(Self { pool, config })
    }

    async fn conn(&self) -> Result<Connection, RedisError> {
        self.pool.get().await.map_err(|e| {
            RedisError::from((
                redis::ErrorKind::IoError,
                "Failed to get connection from pool",
                e.to_string(),
            ))
        })
    }

    /// Executes a Redis operation with retry logic for transient errors.
    async fn with_retry<F, T, Fut>(&self, what: &'static str, operation: F) -> Result<T, RedisError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, RedisError>>,
    {
        let mut retries = 0;
        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if is_retryable(&e) && retries < self.config.max_retries => {
                    retries += 1;
                    let delay = Duration::from_millis(BASE_RETRY_DELAY_MS * 2_u64.pow(retries - 1));
                    warn!(
                        what,
                        attempt = retries,
                        max_retries = self.config.max_retries,
                        ?delay,
                        error = %e,
                        "Redis operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(what, retries, error = %e, "Redis operation failed");
                    return Err(e);
                }
            }
        }
    }
}

/// Determines if a Redis error is retryable.
fn is_retryable(error: &RedisError) -> bool {
    matches!(
        error.kind(),
        redis::ErrorKind::IoError | redis::ErrorKind::TryAgain | redis::ErrorKind::BusyLoadingError
    ) || error.is_connection_dropped()
        || error.is_timeout()
}

fn store_err(e: RedisError) -> CheckpointError {
    CheckpointError::Connection(format!("Redis operation failed: {e}"))
}

fn to_json<T: Serialize>(value: &T) -> Result<String, CheckpointError> {
    serde_json::to_string(value).map_err(|e| CheckpointError::Serialization(e.to_string()))
}

fn from_json<T: DeserializeOwned>(raw: &str) -> Result<T, CheckpointError> {
    serde_json::from_str(raw).map_err(|e| CheckpointError::Serialization(e.to_string()))
}

/// [`CheckpointStore`] backed by Redis.
///
/// Batch commits run as one Lua script, so the checkpoint and the ledger
/// entry are written atomically.
#[derive(Clone)]
pub struct RedisCheckpointStore {
    client: RedisClient,
}

impl RedisCheckpointStore {
    /// Connects and verifies the connection with `PING`.
    ///
    /// # Errors
    ///
    /// Returns `CheckpointError::Connection` if the pool cannot be created or
    /// Redis does not answer.
    pub async fn new(config: RedisConfig) -> Result<Self, CheckpointError> {
        let client = RedisClient::connect(config).await.map_err(|e| {
            error!(error = %e, "Failed to initialize Redis checkpoint store");
            CheckpointError::Connection(e)
        })?;
        Ok(Self { client })
    }

    fn cluster_key(&self, cluster_name: &str, suffix: &str) -> String {
        format!("{}:{{{}}}:{}", self.client.config.key_prefix, cluster_name, suffix)
    }

    fn watcher_key(&self, cluster_name: &str, namespace: &Namespace) -> String {
        self.cluster_key(cluster_name, &format!("watcher:{namespace}"))
    }

    fn ledger_key(&self, cluster_name: &str) -> String {
        self.cluster_key(cluster_name, "ledger")
    }

    fn pending_key(&self, cluster_name: &str, namespace: &Namespace) -> String {
        self.cluster_key(cluster_name, &format!("pending:{namespace}"))
    }

    fn ledger_field(entry: &ChangeLedgerEntry) -> String {
        format!("{}::{}", entry.watcher_id(), entry.batch_status())
    }

    async fn run_commit(
        &self,
        checkpoint: &WatcherCheckpoint,
        delta: u64,
        entry: Option<&ChangeLedgerEntry>,
    ) -> Result<(), CheckpointError> {
        let cluster = &checkpoint.cluster_name;
        let watcher_key = self.watcher_key(cluster, &checkpoint.namespace);
        let ledger_key = self.ledger_key(cluster);
        let pending_key = self.pending_key(cluster, &checkpoint.namespace);
        let checkpoint_json = to_json(checkpoint)?;
        let (field, entry_json, pending) = match entry {
            Some(entry) => (
                Self::ledger_field(entry),
                to_json(entry)?,
                if entry.is_processed { "0" } else { "1" },
            ),
            None => (String::new(), String::new(), "0"),
        };

        let script = Script::new(COMMIT_SCRIPT);
        let _: i64 = self
            .client
            .with_retry("commit", || async {
                let mut conn = self.client.conn().await?;
                script
                    .key(&watcher_key)
                    .key(&ledger_key)
                    .key(&pending_key)
                    .arg(checkpoint.batch_id)
                    .arg(delta)
                    .arg(&checkpoint_json)
                    .arg(&field)
                    .arg(&entry_json)
                    .arg(pending)
                    .invoke_async(&mut *conn)
                    .await
            })
            .await
            .map_err(store_err)?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for RedisCheckpointStore {
    async fn get_watcher(
        &self,
        cluster_name: &str,
        namespace: &Namespace,
    ) -> Result<Option<WatcherCheckpoint>, CheckpointError> {
        let key = self.watcher_key(cluster_name, namespace);

        let (raw, count): (Option<String>, Option<u64>) = self
            .client
            .with_retry("get watcher", || async {
                let mut conn = self.client.conn().await?;
                redis::cmd("HMGET")
                    .arg(&key)
                    .arg("checkpoint")
                    .arg("count")
                    .query_async(&mut *conn)
                    .await
            })
            .await
            .map_err(store_err)?;

        match raw {
            Some(raw) => {
                let mut checkpoint: WatcherCheckpoint = from_json(&raw)?;
                checkpoint.cumulative_document_count = count.unwrap_or_default();
                debug!(watcher = %checkpoint.watcher_id(), batch_id = checkpoint.batch_id, "Loaded checkpoint");
                Ok(Some(checkpoint))
            }
            None => Ok(None),
        }
    }

    async fn save_watcher(&self, checkpoint: &WatcherCheckpoint, document_delta: u64) -> Result<(), CheckpointError> {
        self.run_commit(checkpoint, document_delta, None).await
    }

    async fn save_change_event(&self, entry: &ChangeLedgerEntry) -> Result<(), CheckpointError> {
        let ledger_key = self.ledger_key(&entry.cluster_name);
        let pending_key = self.pending_key(&entry.cluster_name, &entry.namespace);
        let field = Self::ledger_field(entry);
        let json = to_json(entry)?;

        self.client
            .with_retry("save ledger entry", || async {
                let mut conn = self.client.conn().await?;
                let mut pipe = redis::pipe();
                pipe.atomic().hset(&ledger_key, &field, &json).ignore();
                if entry.is_processed {
                    pipe.zrem(&pending_key, entry.batch_id).ignore();
                } else {
                    pipe.zadd(&pending_key, entry.batch_id, entry.batch_id).ignore();
                }
                pipe.query_async::<()>(&mut *conn).await
            })
            .await
            .map_err(store_err)
    }

    async fn commit_batch(
        &self,
        checkpoint: &WatcherCheckpoint,
        document_delta: u64,
        entry: &ChangeLedgerEntry,
    ) -> Result<(), CheckpointError> {
        self.run_commit(checkpoint, document_delta, Some(entry)).await
    }

    async fn list_ledger(&self, cluster_name: &str) -> Result<Vec<ChangeLedgerEntry>, CheckpointError> {
        let key = self.ledger_key(cluster_name);

        let values: Vec<String> = self
            .client
            .with_retry("list ledger", || async {
                let mut conn = self.client.conn().await?;
                conn.hvals(&key).await
            })
            .await
            .map_err(store_err)?;

        values.iter().map(|raw| from_json(raw)).collect()
    }

    async fn next_unprocessed(
        &self,
        cluster_name: &str,
        namespace: &Namespace,
    ) -> Result<Option<ChangeLedgerEntry>, CheckpointError> {
        let pending_key = self.pending_key(cluster_name, namespace);
        let ledger_key = self.ledger_key(cluster_name);

        let oldest: Vec<u64> = self
            .client
            .with_retry("next unprocessed", || async {
                let mut conn = self.client.conn().await?;
                conn.zrange(&pending_key, 0, 0).await
            })
            .await
            .map_err(store_err)?;

        let Some(batch_id) = oldest.first().copied() else {
            return Ok(None);
        };

        let field = format!(
            "{}::{}",
            capstan_core::checkpoint::watcher_id(cluster_name, namespace),
            capstan_core::checkpoint::batch_status(false, batch_id)
        );
        let raw: Option<String> = self
            .client
            .with_retry("get ledger entry", || async {
                let mut conn = self.client.conn().await?;
                conn.hget(&ledger_key, &field).await
            })
            .await
            .map_err(store_err)?;

        match raw {
            Some(raw) => from_json(&raw).map(Some),
            None => {
                warn!(batch_id, namespace = %namespace, "Pending batch has no ledger entry");
                Ok(None)
            }
        }
    }

    async fn mark_processed(
        &self,
        cluster_name: &str,
        namespace: &Namespace,
        batch_id: u64,
        processed_at: DateTime<Utc>,
    ) -> Result<bool, CheckpointError> {
        let ledger_key = self.ledger_key(cluster_name);
        let pending_key = self.pending_key(cluster_name, namespace);
        let id = capstan_core::checkpoint::watcher_id(cluster_name, namespace);
        let old_field = format!("{id}::{}", capstan_core::checkpoint::batch_status(false, batch_id));

        let raw: Option<String> = self
            .client
            .with_retry("get ledger entry", || async {
                let mut conn = self.client.conn().await?;
                conn.hget(&ledger_key, &old_field).await
            })
            .await
            .map_err(store_err)?;
        let Some(raw) = raw else {
            return Ok(false);
        };

        let done = from_json::<ChangeLedgerEntry>(&raw)?.processed(processed_at);
        let new_field = Self::ledger_field(&done);
        let json = to_json(&done)?;

        let script = Script::new(MARK_PROCESSED_SCRIPT);
        let moved: i64 = self
            .client
            .with_retry("mark processed", || async {
                let mut conn = self.client.conn().await?;
                script
                    .key(&ledger_key)
                    .key(&pending_key)
                    .arg(&old_field)
                    .arg(&new_field)
                    .arg(&json)
                    .arg(batch_id)
                    .invoke_async(&mut *conn)
                    .await
            })
            .await
            .map_err(store_err)?;
        Ok(moved == 1)
    }

    async fn save_namespaces(&self, cluster_name: &str, namespaces: &[Namespace]) -> Result<(), CheckpointError> {
        let key = self.cluster_key(cluster_name, "namespaces");
        let json = to_json(&namespaces)?;

        self.client
            .with_retry("save namespaces", || async {
                let mut conn = self.client.conn().await?;
                conn.set::<_, _, ()>(&key, &json).await
            })
            .await
            .map_err(store_err)
    }

    async fn list_namespaces(&self, cluster_name: &str) -> Result<Vec<Namespace>, CheckpointError> {
        let key = self.cluster_key(cluster_name, "namespaces");

        let raw: Option<String> = self
            .client
            .with_retry("list namespaces", || async {
                let mut conn = self.client.conn().await?;
                conn.get(&key).await
            })
            .await
            .map_err(store_err)?;

        raw.map_or_else(|| Ok(Vec::new()), |raw| from_json(&raw))
    }

    async fn set_tracker(&self, cluster_name: &str, component: &str, state: TrackerState) -> Result<(), CheckpointError> {
        let key = self.cluster_key(cluster_name, &format!("tracker:{component}"));

        self.client
            .with_retry("set tracker", || async {
                let mut conn = self.client.conn().await?;
                conn.set::<_, _, ()>(&key, state.as_str()).await
            })
            .await
            .map_err(store_err)
    }

    async fn get_tracker(&self, cluster_name: &str, component: &str) -> Result<Option<TrackerState>, CheckpointError> {
        let key = self.cluster_key(cluster_name, &format!("tracker:{component}"));

        let raw: Option<String> = self
            .client
            .with_retry("get tracker", || async {
                let mut conn = self.client.conn().await?;
                conn.get(&key).await
            })
            .await
            .map_err(store_err)?;

        match raw {
            None => Ok(None),
            Some(value) => TrackerState::parse(&value).map(Some).ok_or_else(|| {
                CheckpointError::Serialization(format!("unknown tracker value '{value}'"))
            }),
        }
    }

    async fn save_status(&self, status: &ReplicationStatus) -> Result<(), CheckpointError> {
        let key = self.cluster_key(&status.cluster_name, "status");
        let json = to_json(status)?;

        self.client
            .with_retry("save status", || async {
                let mut conn = self.client.conn().await?;
                conn.set::<_, _, ()>(&key, &json).await
            })
            .await
            .map_err(store_err)
    }

    async fn get_status(&self, cluster_name: &str) -> Result<Option<ReplicationStatus>, CheckpointError> {
        let key = self.cluster_key(cluster_name, "status");

        let raw: Option<String> = self
            .client
            .with_retry("get status", || async {
                let mut conn = self.client.conn().await?;
                conn.get(&key).await
            })
            .await
            .map_err(store_err)?;

        raw.map(|raw| from_json(&raw)).transpose()
    }

    async fn close(&self) -> Result<(), CheckpointError> {
        debug!("Closing Redis checkpoint store");
        self.client.pool.close();
        Ok(())
    }
}

/// [`WorkQueue`] backed by Redis lists.
///
/// Delayed messages wait in a sorted set scored by their visibility time and
/// are moved to the list by the next `receive` after they come due.
#[derive(Clone)]
pub struct RedisWorkQueue {
    client: RedisClient,
}

impl RedisWorkQueue {
    /// Connects and verifies the connection with `PING`.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Connection` if Redis cannot be reached.
    pub async fn new(config: RedisConfig) -> Result<Self, QueueError> {
        let client = RedisClient::connect(config).await.map_err(|e| {
            error!(error = %e, "Failed to initialize Redis work queue");
            QueueError::Connection(e)
        })?;
        Ok(Self { client })
    }

    fn ready_key(&self, queue: &str) -> String {
        format!("{}:queue:{}", self.client.config.key_prefix, queue)
    }
}

fn queue_err(e: RedisError) -> QueueError {
    QueueError::Connection(format!("Redis operation failed: {e}"))
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[async_trait]
impl WorkQueue for RedisWorkQueue {
    async fn send(&self, queue: &str, body: String, delay: Duration) -> Result<(), QueueError> {
        let ready = self.ready_key(queue);

        if delay.is_zero() {
            return self
                .client
                .with_retry("enqueue", || async {
                    let mut conn = self.client.conn().await?;
                    conn.rpush::<_, _, ()>(&ready, &body).await
                })
                .await
                .map_err(queue_err);
        }

        let delayed = format!("{ready}:delayed");
        let sequence = format!("{ready}:seq");
        let delay_ms = i64::try_from(delay.as_millis())
            .map_err(|_| QueueError::Other(format!("delay {delay:?} is too large")))?;
        let visible_at = now_millis().saturating_add(delay_ms);

        let script = Script::new(DELAY_SCRIPT);
        let _: i64 = self
            .client
            .with_retry("enqueue delayed", || async {
                let mut conn = self.client.conn().await?;
                script
                    .key(&delayed)
                    .key(&sequence)
                    .arg(visible_at)
                    .arg(&body)
                    .invoke_async(&mut *conn)
                    .await
            })
            .await
            .map_err(queue_err)?;
        Ok(())
    }

    async fn receive(&self, queue: &str, max: usize) -> Result<Vec<String>, QueueError> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let ready = self.ready_key(queue);
        let delayed = format!("{ready}:delayed");

        let script = Script::new(PROMOTE_SCRIPT);
        let promoted: i64 = self
            .client
            .with_retry("promote delayed", || async {
                let mut conn = self.client.conn().await?;
                script
                    .key(&delayed)
                    .key(&ready)
                    .arg(now_millis())
                    .invoke_async(&mut *conn)
                    .await
            })
            .await
            .map_err(queue_err)?;
        if promoted > 0 {
            debug!(queue, promoted, "Delayed messages are due");
        }

        let received: Option<Vec<String>> = self
            .client
            .with_retry("dequeue", || async {
                let mut conn = self.client.conn().await?;
                redis::cmd("LPOP")
                    .arg(&ready)
                    .arg(max)
                    .query_async(&mut *conn)
                    .await
            })
            .await
            .map_err(queue_err)?;

        Ok(received.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = RedisConfig::builder()
            .url("redis://localhost:6379")
            .pool_size(20)
            .key_prefix("cdc")
            .max_retries(5)
            .build()
            .unwrap();

        assert_eq!(config.url, "redis://localhost:6379");
        assert_eq!(config.pool_size, 20);
        assert_eq!(config.key_prefix, "cdc");
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.connection_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_config_builder_missing_url() {
        assert!(RedisConfig::builder().pool_size(10).build().is_err());
    }

    #[test]
    fn test_config_builder_rejects_bad_values() {
        let zero_pool = RedisConfig::builder()
            .url("redis://localhost:6379")
            .pool_size(0)
            .build();
        assert!(zero_pool.is_err());

        let empty_prefix = RedisConfig::builder()
            .url("redis://localhost:6379")
            .key_prefix("")
            .build();
        assert!(empty_prefix.is_err());
    }

    #[test]
    fn test_retryable_errors() {
        let io = RedisError::from((redis::ErrorKind::IoError, "broken pipe"));
        let script = RedisError::from((redis::ErrorKind::TypeError, "wrong type"));
        assert!(is_retryable(&io));
        assert!(!is_retryable(&script));
    }

    #[test]
    fn test_store_errors_are_retryable_for_batcher() {
        let err = store_err(RedisError::from((redis::ErrorKind::IoError, "reset")));
        assert!(err.is_retryable());
    }
}
