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

//! Durable capture progress.
//!
//! The [`CheckpointStore`] trait abstracts the key/value service that keeps:
//!
//! - one [`WatcherCheckpoint`] per namespace, keyed by `{cluster}::{namespace}`
//! - the append-only ledger of flushed batches ([`ChangeLedgerEntry`]), keyed by
//!   `(watcherId, batchStatus)` where `batchStatus` is `{isProcessed}::{batchId:06}`
//! - the list of captured namespaces, the control-plane tracker flag and the
//!   latest replication status
//!
//! Backends live in the `capstan-stores` crate.

use crate::event::{Namespace, ResumeToken};
use crate::lag::ReplicationStatus;
use bson::Document;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Object link recorded for heartbeat batches that carried no payload.
pub const NULL_OBJECT_LINK: &str = "null";

/// Tracker component controlled by the dispatcher.
pub const EVENT_WRITER_COMPONENT: &str = "event_writer";

/// Builds the watcher key `{cluster}::{database}.{collection}`.
#[must_use]
pub fn watcher_id(cluster_name: &str, namespace: &Namespace) -> String {
    format!("{}::{}", cluster_name, namespace)
}

/// Builds the ledger sort key `{isProcessed}::{batchId:06}`.
#[must_use]
pub fn batch_status(is_processed: bool, batch_id: u64) -> String {
    format!("{}::{:06}", is_processed, batch_id)
}

/// `processedAt` value of entries nobody has consumed yet.
#[must_use]
pub fn pending_processed_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(9999, 12, 31, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Last recorded progress of one namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatcherCheckpoint {
    pub cluster_name: String,
    pub namespace: Namespace,
    /// Position to reopen the stream at
    pub resume_token: ResumeToken,
    /// Last event observed before the checkpoint was written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_document: Option<Document>,
    /// Id of the last flushed batch
    pub batch_id: u64,
    pub cumulative_document_count: u64,
    pub updated_at: DateTime<Utc>,
}

impl WatcherCheckpoint {
    #[must_use]
    pub fn watcher_id(&self) -> String {
        watcher_id(&self.cluster_name, &self.namespace)
    }

    /// Batch id the next flush after a restart must use.
    #[must_use]
    pub fn next_batch_id(&self) -> u64 {
        self.batch_id + 1
    }

    /// Applies an incoming flush to the stored row.
    ///
    /// The count only grows when the incoming batch is newer than the stored
    /// one, so replaying the same commit is a no-op. Stale writes never move
    /// the row backwards.
    #[must_use]
    pub fn merge(existing: Option<&WatcherCheckpoint>, incoming: &WatcherCheckpoint, delta: u64) -> Self {
        match existing {
            Some(current) if current.batch_id >= incoming.batch_id => current.clone(),
            Some(current) => WatcherCheckpoint {
                cumulative_document_count: current.cumulative_document_count + delta,
                ..incoming.clone()
            },
            None => WatcherCheckpoint {
                cumulative_document_count: delta,
                ..incoming.clone()
            },
        }
    }
}

/// One flushed batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeLedgerEntry {
    pub cluster_name: String,
    pub namespace: Namespace,
    pub batch_id: u64,
    /// Object key of the payload, or `"null"` for heartbeats
    pub object_link: String,
    pub document_count: u64,
    pub created_at: DateTime<Utc>,
    pub is_processed: bool,
    pub processed_at: DateTime<Utc>,
    /// Position held before the batch's first event
    pub resume_token: ResumeToken,
}

impl ChangeLedgerEntry {
    /// Creates an unprocessed entry.
    #[must_use]
    pub fn new(
        cluster_name: impl Into<String>,
        namespace: Namespace,
        batch_id: u64,
        object_link: Option<String>,
        document_count: u64,
        resume_token: ResumeToken,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            namespace,
            batch_id,
            object_link: object_link.unwrap_or_else(|| NULL_OBJECT_LINK.to_string()),
            document_count,
            created_at,
            is_processed: false,
            processed_at: pending_processed_at(),
            resume_token,
        }
    }

    #[must_use]
    pub fn watcher_id(&self) -> String {
        watcher_id(&self.cluster_name, &self.namespace)
    }

    #[must_use]
    pub fn batch_status(&self) -> String {
        batch_status(self.is_processed, self.batch_id)
    }

    /// False for heartbeat entries.
    #[must_use]
    pub fn has_payload(&self) -> bool {
        self.object_link != NULL_OBJECT_LINK
    }

    /// Returns the processed copy of this entry.
    #[must_use]
    pub fn processed(&self, processed_at: DateTime<Utc>) -> Self {
        Self {
            is_processed: true,
            processed_at,
            ..self.clone()
        }
    }

    /// Seconds between recording and consumption. Unprocessed entries are
    /// measured against `now`.
    #[must_use]
    pub fn gap_seconds(&self, now: DateTime<Utc>) -> i64 {
        let end = if self.is_processed { self.processed_at } else { now };
        (end - self.created_at).num_seconds().max(0)
    }
}

/// Value of the control-plane tracker flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackerState {
    Start,
    Stop,
}

impl TrackerState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerState::Start => "start",
            TrackerState::Stop => "stop",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "start" => Some(TrackerState::Start),
            "stop" => Some(TrackerState::Stop),
            _ => None,
        }
    }
}

impl fmt::Display for TrackerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trait for checkpoint storage backends.
///
/// Implementations must persist durably; capture resumes from whatever
/// [`CheckpointStore::get_watcher`] returns after a restart.
#[async_trait::async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Retrieves the checkpoint of a namespace.
    ///
    /// Returns `None` if the namespace has never been flushed.
    async fn get_watcher(
        &self,
        cluster_name: &str,
        namespace: &Namespace,
    ) -> Result<Option<WatcherCheckpoint>, CheckpointError>;

    /// Upserts a checkpoint, adding `document_delta` to the stored cumulative
    /// count.
    ///
    /// The increment is conditional on `checkpoint.batch_id` being newer than
    /// the stored one (see [`WatcherCheckpoint::merge`]), so retrying the same
    /// write does not double count.
    async fn save_watcher(
        &self,
        checkpoint: &WatcherCheckpoint,
        document_delta: u64,
    ) -> Result<(), CheckpointError>;

    /// Inserts a ledger entry keyed by `(watcherId, batchStatus)`.
    ///
    /// Writing the same entry twice leaves a single row.
    async fn save_change_event(&self, entry: &ChangeLedgerEntry) -> Result<(), CheckpointError>;

    /// Records a flushed batch: checkpoint first, then ledger.
    ///
    /// Backends that can write both in one step should override this. The
    /// default is safe to retry because both writes are idempotent.
    async fn commit_batch(
        &self,
        checkpoint: &WatcherCheckpoint,
        document_delta: u64,
        entry: &ChangeLedgerEntry,
    ) -> Result<(), CheckpointError> {
        self.save_watcher(checkpoint, document_delta).await?;
        self.save_change_event(entry).await
    }

    /// Lists every ledger entry of a cluster, processed or not.
    async fn list_ledger(&self, cluster_name: &str) -> Result<Vec<ChangeLedgerEntry>, CheckpointError>;

    /// Returns the unprocessed entry with the lowest batch id.
    async fn next_unprocessed(
        &self,
        cluster_name: &str,
        namespace: &Namespace,
    ) -> Result<Option<ChangeLedgerEntry>, CheckpointError>;

    /// Moves an entry from `false::NNNNNN` to `true::NNNNNN`.
    ///
    /// Returns `false` when no unprocessed entry with that id exists.
    async fn mark_processed(
        &self,
        cluster_name: &str,
        namespace: &Namespace,
        batch_id: u64,
        processed_at: DateTime<Utc>,
    ) -> Result<bool, CheckpointError>;

    /// Replaces the namespace list of a cluster.
    async fn save_namespaces(
        &self,
        cluster_name: &str,
        namespaces: &[Namespace],
    ) -> Result<(), CheckpointError>;

    async fn list_namespaces(&self, cluster_name: &str) -> Result<Vec<Namespace>, CheckpointError>;

    async fn set_tracker(
        &self,
        cluster_name: &str,
        component: &str,
        state: TrackerState,
    ) -> Result<(), CheckpointError>;

    async fn get_tracker(
        &self,
        cluster_name: &str,
        component: &str,
    ) -> Result<Option<TrackerState>, CheckpointError>;

    async fn save_status(&self, status: &ReplicationStatus) -> Result<(), CheckpointError>;

    async fn get_status(&self, cluster_name: &str) -> Result<Option<ReplicationStatus>, CheckpointError>;

    /// Closes the store, releasing any resources.
    async fn close(&self) -> Result<(), CheckpointError>;
}

/// Errors that can occur during checkpoint store operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Not found error
    #[error("Not found: {0}")]
    NotFound(String),

    /// Other errors
    #[error("Checkpoint store error: {0}")]
    Other(String),
}

impl CheckpointError {
    /// Only connection failures are worth retrying.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}
