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

//! In-memory checkpoint store and work queue.
//!
//! Both keep everything in process memory behind a single [`RwLock`] /
//! [`Mutex`], so they suit local runs and tests, not deployments where
//! capture must survive a restart.
//!
//! # Example
//!
//! ```rust
//! use capstan_core::checkpoint::{CheckpointStore, TrackerState};
//! use capstan_stores::memory::MemoryCheckpointStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = MemoryCheckpointStore::new();
//! store.set_tracker("prod", "event_writer", TrackerState::Start).await?;
//! assert_eq!(
//!     store.get_tracker("prod", "event_writer").await?,
//!     Some(TrackerState::Start)
//! );
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use capstan_core::checkpoint::{
    watcher_id, ChangeLedgerEntry, CheckpointError, CheckpointStore, TrackerState,
    WatcherCheckpoint,
};
use capstan_core::control::{QueueError, WorkQueue};
use capstan_core::event::Namespace;
use capstan_core::lag::ReplicationStatus;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, trace};

type LedgerKey = (String, bool, u64);

#[derive(Debug, Default)]
struct Tables {
    watchers: HashMap<String, WatcherCheckpoint>,
    /// Keyed by `(watcherId, isProcessed, batchId)`, which orders unprocessed
    /// entries of a watcher numerically by batch id.
    ledger: BTreeMap<LedgerKey, ChangeLedgerEntry>,
    namespaces: HashMap<String, Vec<Namespace>>,
    trackers: HashMap<(String, String), TrackerState>,
    statuses: HashMap<String, ReplicationStatus>,
}

/// [`CheckpointStore`] kept in process memory.
///
/// Clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryCheckpointStore {
    #[must_use]
    pub fn new() -> Self {
        debug!("Creating in-memory checkpoint store");
        Self::default()
    }

    /// Number of ledger entries across all clusters.
    pub async fn ledger_len(&self) -> usize {
        self.tables.read().await.ledger.len()
    }

    /// Drops every table.
    pub async fn clear(&self) {
        *self.tables.write().await = Tables::default();
        debug!("Cleared in-memory checkpoint store");
    }
}

fn merge_watcher(tables: &mut Tables, checkpoint: &WatcherCheckpoint, delta: u64) {
    let key = checkpoint.watcher_id();
    let merged = WatcherCheckpoint::merge(tables.watchers.get(&key), checkpoint, delta);
    tables.watchers.insert(key, merged);
}

fn insert_entry(tables: &mut Tables, entry: &ChangeLedgerEntry) {
    tables
        .ledger
        .insert((entry.watcher_id(), entry.is_processed, entry.batch_id), entry.clone());
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get_watcher(
        &self,
        cluster_name: &str,
        namespace: &Namespace,
    ) -> Result<Option<WatcherCheckpoint>, CheckpointError> {
        let tables = self.tables.read().await;
        Ok(tables.watchers.get(&watcher_id(cluster_name, namespace)).cloned())
    }

    async fn save_watcher(&self, checkpoint: &WatcherCheckpoint, document_delta: u64) -> Result<(), CheckpointError> {
        trace!(watcher = %checkpoint.watcher_id(), batch_id = checkpoint.batch_id, "Saving watcher");
        merge_watcher(&mut *self.tables.write().await, checkpoint, document_delta);
        Ok(())
    }

    async fn save_change_event(&self, entry: &ChangeLedgerEntry) -> Result<(), CheckpointError> {
        insert_entry(&mut *self.tables.write().await, entry);
        Ok(())
    }

    /// Both writes happen under one write lock, so readers never see one
    /// without the other.
    async fn commit_batch(
        &self,
        checkpoint: &WatcherCheckpoint,
        document_delta: u64,
        entry: &ChangeLedgerEntry,
    ) -> Result<(), CheckpointError> {
        let mut tables = self.tables.write().await;
        merge_watcher(&mut tables, checkpoint, document_delta);
        insert_entry(&mut tables, entry);
        debug!(
            watcher = %checkpoint.watcher_id(),
            batch_id = entry.batch_id,
            documents = entry.document_count,
            "Committed batch"
        );
        Ok(())
    }

    async fn list_ledger(&self, cluster_name: &str) -> Result<Vec<ChangeLedgerEntry>, CheckpointError> {
        let tables = self.tables.read().await;
        Ok(tables
            .ledger
            .values()
            .filter(|e| e.cluster_name == cluster_name)
            .cloned()
            .collect())
    }

    async fn next_unprocessed(
        &self,
        cluster_name: &str,
        namespace: &Namespace,
    ) -> Result<Option<ChangeLedgerEntry>, CheckpointError> {
        let id = watcher_id(cluster_name, namespace);
        let from = (id.clone(), false, 0);
        let to = (id, true, 0);

        let tables = self.tables.read().await;
        Ok(tables.ledger.range(from..to).next().map(|(_, e)| e.clone()))
    }

    async fn mark_processed(
        &self,
        cluster_name: &str,
        namespace: &Namespace,
        batch_id: u64,
        processed_at: DateTime<Utc>,
    ) -> Result<bool, CheckpointError> {
        let id = watcher_id(cluster_name, namespace);
        let mut tables = self.tables.write().await;

        let Some(entry) = tables.ledger.remove(&(id.clone(), false, batch_id)) else {
            return Ok(false);
        };
        tables.ledger.insert((id, true, batch_id), entry.processed(processed_at));
        Ok(true)
    }

    async fn save_namespaces(&self, cluster_name: &str, namespaces: &[Namespace]) -> Result<(), CheckpointError> {
        self.tables
            .write()
            .await
            .namespaces
            .insert(cluster_name.to_string(), namespaces.to_vec());
        Ok(())
    }

    async fn list_namespaces(&self, cluster_name: &str) -> Result<Vec<Namespace>, CheckpointError> {
        let tables = self.tables.read().await;
        Ok(tables.namespaces.get(cluster_name).cloned().unwrap_or_default())
    }

    async fn set_tracker(&self, cluster_name: &str, component: &str, state: TrackerState) -> Result<(), CheckpointError> {
        self.tables
            .write()
            .await
            .trackers
            .insert((cluster_name.to_string(), component.to_string()), state);
        Ok(())
    }

    async fn get_tracker(&self, cluster_name: &str, component: &str) -> Result<Option<TrackerState>, CheckpointError> {
        let tables = self.tables.read().await;
        Ok(tables
            .trackers
            .get(&(cluster_name.to_string(), component.to_string()))
            .copied())
    }

    async fn save_status(&self, status: &ReplicationStatus) -> Result<(), CheckpointError> {
        self.tables
            .write()
            .await
            .statuses
            .insert(status.cluster_name.clone(), status.clone());
        Ok(())
    }

    async fn get_status(&self, cluster_name: &str) -> Result<Option<ReplicationStatus>, CheckpointError> {
        Ok(self.tables.read().await.statuses.get(cluster_name).cloned())
    }

    async fn close(&self) -> Result<(), CheckpointError> {
        debug!("Closing in-memory checkpoint store (no-op)");
        Ok(())
    }
}

#[derive(Debug)]
struct Message {
    body: String,
    visible_at: Instant,
}

/// [`WorkQueue`] kept in process memory.
///
/// A delayed message becomes visible once its delay has elapsed on the tokio
/// clock. Visible messages are received in send order.
#[derive(Debug, Clone, Default)]
pub struct MemoryWorkQueue {
    queues: Arc<Mutex<HashMap<String, VecDeque<Message>>>>,
}

impl MemoryWorkQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages waiting on `queue`, visible or not.
    pub async fn len(&self, queue: &str) -> usize {
        self.queues.lock().await.get(queue).map_or(0, VecDeque::len)
    }

    pub async fn is_empty(&self, queue: &str) -> bool {
        self.len(queue).await == 0
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn send(&self, queue: &str, body: String, delay: Duration) -> Result<(), QueueError> {
        trace!(queue, ?delay, "Enqueueing message");
        self.queues
            .lock()
            .await
            .entry(queue.to_string())
            .or_default()
            .push_back(Message {
                body,
                visible_at: Instant::now() + delay,
            });
        Ok(())
    }

    async fn receive(&self, queue: &str, max: usize) -> Result<Vec<String>, QueueError> {
        let mut queues = self.queues.lock().await;
        let Some(messages) = queues.get_mut(queue) else {
            return Ok(Vec::new());
        };

        let now = Instant::now();
        let mut received = Vec::new();
        let mut waiting = VecDeque::with_capacity(messages.len());
        while let Some(message) = messages.pop_front() {
            if received.len() < max && message.visible_at <= now {
                received.push(message.body);
            } else {
                waiting.push_back(message);
            }
        }
        *messages = waiting;
        Ok(received)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capstan_core::event::ResumeToken;

    fn orders() -> Namespace {
        Namespace::new("shop", "orders")
    }

    fn checkpoint(batch_id: u64) -> WatcherCheckpoint {
        WatcherCheckpoint {
            cluster_name: "prod".into(),
            namespace: orders(),
            resume_token: ResumeToken::Earliest,
            validation_document: None,
            batch_id,
            cumulative_document_count: 0,
            updated_at: Utc::now(),
        }
    }

    fn entry(batch_id: u64, count: u64) -> ChangeLedgerEntry {
        ChangeLedgerEntry::new(
            "prod",
            orders(),
            batch_id,
            (count > 0).then(|| format!("prod/shop/orders/{batch_id}.json")),
            count,
            ResumeToken::Earliest,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_commit_accumulates_counts() {
        let store = MemoryCheckpointStore::new();
        store.commit_batch(&checkpoint(0), 10, &entry(0, 10)).await.unwrap();
        store.commit_batch(&checkpoint(1), 0, &entry(1, 0)).await.unwrap();
        store.commit_batch(&checkpoint(2), 5, &entry(2, 5)).await.unwrap();

        let saved = store.get_watcher("prod", &orders()).await.unwrap().unwrap();
        assert_eq!(saved.batch_id, 2);
        assert_eq!(saved.cumulative_document_count, 15);
        assert_eq!(store.ledger_len().await, 3);
    }

    #[tokio::test]
    async fn test_repeated_commit_is_idempotent() {
        let store = MemoryCheckpointStore::new();
        store.commit_batch(&checkpoint(3), 7, &entry(3, 7)).await.unwrap();
        store.commit_batch(&checkpoint(3), 7, &entry(3, 7)).await.unwrap();

        let saved = store.get_watcher("prod", &orders()).await.unwrap().unwrap();
        assert_eq!(saved.cumulative_document_count, 7);
        assert_eq!(store.ledger_len().await, 1);
    }

    #[tokio::test]
    async fn test_next_unprocessed_in_batch_order() {
        let store = MemoryCheckpointStore::new();
        for id in [12, 3, 7] {
            store.save_change_event(&entry(id, 1)).await.unwrap();
        }

        let next = store.next_unprocessed("prod", &orders()).await.unwrap().unwrap();
        assert_eq!(next.batch_id, 3);

        assert!(store.mark_processed("prod", &orders(), 3, Utc::now()).await.unwrap());
        assert!(!store.mark_processed("prod", &orders(), 3, Utc::now()).await.unwrap());

        let next = store.next_unprocessed("prod", &orders()).await.unwrap().unwrap();
        assert_eq!(next.batch_id, 7);

        let other = Namespace::new("shop", "carts");
        assert!(store.next_unprocessed("prod", &other).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_next_unprocessed_past_six_digits() {
        let store = MemoryCheckpointStore::new();
        store.save_change_event(&entry(1_000_000, 1)).await.unwrap();
        store.save_change_event(&entry(999_999, 1)).await.unwrap();

        let next = store.next_unprocessed("prod", &orders()).await.unwrap().unwrap();
        assert_eq!(next.batch_id, 999_999);

        store.mark_processed("prod", &orders(), 999_999, Utc::now()).await.unwrap();
        let next = store.next_unprocessed("prod", &orders()).await.unwrap().unwrap();
        assert_eq!(next.batch_id, 1_000_000);
    }

    #[tokio::test]
    async fn test_ledger_is_per_cluster() {
        let store = MemoryCheckpointStore::new();
        store.save_change_event(&entry(0, 1)).await.unwrap();
        let mut foreign = entry(0, 1);
        foreign.cluster_name = "staging".into();
        store.save_change_event(&foreign).await.unwrap();

        assert_eq!(store.list_ledger("prod").await.unwrap().len(), 1);
        assert_eq!(store.list_ledger("staging").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_namespaces_and_trackers() {
        let store = MemoryCheckpointStore::new();
        assert!(store.list_namespaces("prod").await.unwrap().is_empty());
        assert!(store.get_tracker("prod", "event_writer").await.unwrap().is_none());

        store.save_namespaces("prod", &[orders()]).await.unwrap();
        store.set_tracker("prod", "event_writer", TrackerState::Stop).await.unwrap();

        assert_eq!(store.list_namespaces("prod").await.unwrap(), vec![orders()]);
        assert_eq!(
            store.get_tracker("prod", "event_writer").await.unwrap(),
            Some(TrackerState::Stop)
        );
    }

    #[tokio::test]
    async fn test_clones_share_tables() {
        let store = MemoryCheckpointStore::new();
        let clone = store.clone();
        clone.save_change_event(&entry(0, 1)).await.unwrap();
        assert_eq!(store.ledger_len().await, 1);

        store.clear().await;
        assert_eq!(clone.ledger_len().await, 0);
    }

    #[tokio::test]
    async fn test_queue_receive_respects_max() {
        let queue = MemoryWorkQueue::new();
        for i in 0..3 {
            queue.send("q", format!("m{i}"), Duration::ZERO).await.unwrap();
        }

        assert_eq!(queue.receive("q", 2).await.unwrap(), vec!["m0", "m1"]);
        assert_eq!(queue.receive("q", 2).await.unwrap(), vec!["m2"]);
        assert!(queue.receive("q", 2).await.unwrap().is_empty());
        assert!(queue.receive("other", 2).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_delay() {
        let queue = MemoryWorkQueue::new();
        queue.send("q", "later".into(), Duration::from_secs(5)).await.unwrap();
        queue.send("q", "now".into(), Duration::ZERO).await.unwrap();

        assert_eq!(queue.receive("q", 10).await.unwrap(), vec!["now"]);
        assert_eq!(queue.len("q").await, 1);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(queue.receive("q", 10).await.unwrap(), vec!["later"]);
        assert!(queue.is_empty("q").await);
    }
}
