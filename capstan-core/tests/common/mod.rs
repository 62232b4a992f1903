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

//! In-process fakes shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bson::{doc, Document};
use capstan_core::batcher::{BatcherConfig, BatcherError};
use capstan_core::checkpoint::{
    watcher_id, ChangeLedgerEntry, CheckpointError, CheckpointStore, TrackerState,
    WatcherCheckpoint,
};
use capstan_core::control::{QueueError, WorkQueue};
use capstan_core::event::{ChangeEvent, Namespace, OperationType, ResumeToken};
use capstan_core::lag::ReplicationStatus;
use capstan_core::replay::{ReplayError, TargetWriter};
use capstan_core::sink::{ObjectSink, SinkError};
use capstan_core::stream::{ChangeSource, EventSink, EventStream, StreamError};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub const CLUSTER: &str = "prod";
pub const BUCKET: &str = "change-feed";

pub fn orders() -> Namespace {
    Namespace::new("shop", "orders")
}

pub fn batcher_config() -> BatcherConfig {
    BatcherConfig::builder()
        .bucket(BUCKET)
        .retry_delay(Duration::from_millis(1))
        .max_retry_delay(Duration::from_millis(4))
        .build()
        .unwrap()
}

/// Event number `seq` of `namespace`, with a deterministic position token.
pub fn event(namespace: &Namespace, seq: u32, operation: OperationType) -> ChangeEvent {
    ChangeEvent {
        id: token_doc(namespace, seq),
        operation,
        namespace: namespace.clone(),
        document_key: Some(doc! { "_id": i64::from(seq) }),
        full_document: Some(doc! { "_id": i64::from(seq), "ns": namespace.full_name() }),
    }
}

pub fn token_doc(namespace: &Namespace, seq: u32) -> Document {
    doc! { "_data": format!("{}-{:04}", namespace, seq) }
}

pub fn checkpoint(namespace: &Namespace, batch_id: u64, token: ResumeToken, count: u64) -> WatcherCheckpoint {
    WatcherCheckpoint {
        cluster_name: CLUSTER.to_string(),
        namespace: namespace.clone(),
        resume_token: token,
        validation_document: None,
        batch_id,
        cumulative_document_count: count,
        updated_at: Utc::now(),
    }
}

pub fn invalid_token() -> StreamError {
    StreamError::InvalidResumeToken {
        code: Some(260),
        message: "resume token was not found".to_string(),
    }
}

pub fn transient() -> StreamError {
    StreamError::Connection {
        message: "connection reset by peer".to_string(),
        source: None,
        code: None,
        labels: vec!["NetworkError".to_string()],
    }
}

// ---------------------------------------------------------------------------
// Checkpoint store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StoreState {
    watchers: HashMap<String, WatcherCheckpoint>,
    ledger: BTreeMap<(String, bool, u64), ChangeLedgerEntry>,
    namespaces: HashMap<String, Vec<Namespace>>,
    trackers: HashMap<String, TrackerState>,
    statuses: HashMap<String, ReplicationStatus>,
}

#[derive(Default)]
pub struct FakeStore {
    state: Mutex<StoreState>,
    fail_commits: AtomicU32,
    pub commits: AtomicUsize,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_checkpoint(self, checkpoint: WatcherCheckpoint) -> Self {
        self.state
            .lock()
            .unwrap()
            .watchers
            .insert(checkpoint.watcher_id(), checkpoint);
        self
    }

    pub fn with_tracker(self, state: TrackerState) -> Self {
        self.state
            .lock()
            .unwrap()
            .trackers
            .insert(format!("{CLUSTER}::event_writer"), state);
        self
    }

    pub fn with_entry(self, entry: ChangeLedgerEntry) -> Self {
        self.state
            .lock()
            .unwrap()
            .ledger
            .insert((entry.watcher_id(), entry.is_processed, entry.batch_id), entry);
        self
    }

    /// Makes the next `n` commits fail with a retryable error.
    pub fn fail_next_commits(&self, n: u32) {
        self.fail_commits.store(n, Ordering::SeqCst);
    }

    /// Ledger entries ordered by watcher and batch status.
    pub fn ledger(&self) -> Vec<ChangeLedgerEntry> {
        self.state.lock().unwrap().ledger.values().cloned().collect()
    }

    pub fn ledger_for(&self, namespace: &Namespace) -> Vec<ChangeLedgerEntry> {
        let mut entries: Vec<_> = self
            .ledger()
            .into_iter()
            .filter(|e| &e.namespace == namespace)
            .collect();
        entries.sort_by_key(|e| e.batch_id);
        entries
    }

    pub fn watcher(&self, namespace: &Namespace) -> Option<WatcherCheckpoint> {
        self.state
            .lock()
            .unwrap()
            .watchers
            .get(&watcher_id(CLUSTER, namespace))
            .cloned()
    }

    pub fn status(&self) -> Option<ReplicationStatus> {
        self.state.lock().unwrap().statuses.get(CLUSTER).cloned()
    }

    pub fn tracker(&self) -> Option<TrackerState> {
        self.state
            .lock()
            .unwrap()
            .trackers
            .get(&format!("{CLUSTER}::event_writer"))
            .copied()
    }
}

#[async_trait]
impl CheckpointStore for FakeStore {
    async fn get_watcher(
        &self,
        cluster_name: &str,
        namespace: &Namespace,
    ) -> Result<Option<WatcherCheckpoint>, CheckpointError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .watchers
            .get(&watcher_id(cluster_name, namespace))
            .cloned())
    }

    async fn save_watcher(&self, checkpoint: &WatcherCheckpoint, delta: u64) -> Result<(), CheckpointError> {
        let mut state = self.state.lock().unwrap();
        let key = checkpoint.watcher_id();
        let merged = WatcherCheckpoint::merge(state.watchers.get(&key), checkpoint, delta);
        state.watchers.insert(key, merged);
        Ok(())
    }

    async fn save_change_event(&self, entry: &ChangeLedgerEntry) -> Result<(), CheckpointError> {
        self.state
            .lock()
            .unwrap()
            .ledger
            .insert((entry.watcher_id(), entry.is_processed, entry.batch_id), entry.clone());
        Ok(())
    }

    async fn commit_batch(
        &self,
        checkpoint: &WatcherCheckpoint,
        delta: u64,
        entry: &ChangeLedgerEntry,
    ) -> Result<(), CheckpointError> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        let pending = self.fail_commits.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_commits.store(pending - 1, Ordering::SeqCst);
            return Err(CheckpointError::Connection("store unavailable".to_string()));
        }
        self.save_watcher(checkpoint, delta).await?;
        self.save_change_event(entry).await
    }

    async fn list_ledger(&self, cluster_name: &str) -> Result<Vec<ChangeLedgerEntry>, CheckpointError> {
        Ok(self
            .ledger()
            .into_iter()
            .filter(|e| e.cluster_name == cluster_name)
            .collect())
    }

    async fn next_unprocessed(
        &self,
        cluster_name: &str,
        namespace: &Namespace,
    ) -> Result<Option<ChangeLedgerEntry>, CheckpointError> {
        let id = watcher_id(cluster_name, namespace);
        Ok(self
            .state
            .lock()
            .unwrap()
            .ledger
            .iter()
            .find(|((w, processed, _), _)| w == &id && !processed)
            .map(|(_, entry)| entry.clone()))
    }

    async fn mark_processed(
        &self,
        cluster_name: &str,
        namespace: &Namespace,
        batch_id: u64,
        processed_at: DateTime<Utc>,
    ) -> Result<bool, CheckpointError> {
        let id = watcher_id(cluster_name, namespace);
        let mut state = self.state.lock().unwrap();
        match state.ledger.remove(&(id.clone(), false, batch_id)) {
            Some(entry) => {
                state.ledger.insert((id, true, batch_id), entry.processed(processed_at));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn save_namespaces(&self, cluster_name: &str, namespaces: &[Namespace]) -> Result<(), CheckpointError> {
        self.state
            .lock()
            .unwrap()
            .namespaces
            .insert(cluster_name.to_string(), namespaces.to_vec());
        Ok(())
    }

    async fn list_namespaces(&self, cluster_name: &str) -> Result<Vec<Namespace>, CheckpointError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .namespaces
            .get(cluster_name)
            .cloned()
            .unwrap_or_default())
    }

    async fn set_tracker(&self, cluster_name: &str, component: &str, value: TrackerState) -> Result<(), CheckpointError> {
        self.state
            .lock()
            .unwrap()
            .trackers
            .insert(format!("{cluster_name}::{component}"), value);
        Ok(())
    }

    async fn get_tracker(&self, cluster_name: &str, component: &str) -> Result<Option<TrackerState>, CheckpointError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .trackers
            .get(&format!("{cluster_name}::{component}"))
            .copied())
    }

    async fn save_status(&self, status: &ReplicationStatus) -> Result<(), CheckpointError> {
        self.state
            .lock()
            .unwrap()
            .statuses
            .insert(status.cluster_name.clone(), status.clone());
        Ok(())
    }

    async fn get_status(&self, cluster_name: &str) -> Result<Option<ReplicationStatus>, CheckpointError> {
        Ok(self.state.lock().unwrap().statuses.get(cluster_name).cloned())
    }

    async fn close(&self) -> Result<(), CheckpointError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Object sink
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeSink {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    fail_puts: AtomicU32,
    pub puts: AtomicUsize,
    pub gets: AtomicUsize,
}

impl FakeSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` uploads fail with a retryable error.
    pub fn fail_next_puts(&self, n: u32) {
        self.fail_puts.store(n, Ordering::SeqCst);
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn lines(&self, key: &str) -> Vec<String> {
        self.object(key)
            .map(|body| {
                String::from_utf8(body)
                    .unwrap()
                    .lines()
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }
}

#[async_trait]
impl ObjectSink for FakeSink {
    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), SinkError> {
        assert_eq!(bucket, BUCKET);
        self.puts.fetch_add(1, Ordering::SeqCst);
        let pending = self.fail_puts.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_puts.store(pending - 1, Ordering::SeqCst);
            return Err(SinkError::write_msg(key, "throttled", true));
        }
        self.objects.lock().unwrap().insert(key.to_string(), body);
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, SinkError> {
        assert_eq!(bucket, BUCKET);
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.object(key).ok_or_else(|| SinkError::NotFound { key: key.to_string() })
    }
}

// ---------------------------------------------------------------------------
// Work queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sent {
    pub queue: String,
    pub body: String,
    pub delay: Duration,
}

#[derive(Default)]
pub struct FakeQueue {
    sent: Mutex<Vec<Sent>>,
}

impl FakeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, queue: &str) -> Vec<Sent> {
        self.sent().into_iter().filter(|s| s.queue == queue).collect()
    }
}

#[async_trait]
impl WorkQueue for FakeQueue {
    async fn send(&self, queue: &str, body: String, delay: Duration) -> Result<(), QueueError> {
        self.sent.lock().unwrap().push(Sent {
            queue: queue.to_string(),
            body,
            delay,
        });
        Ok(())
    }

    async fn receive(&self, queue: &str, max: usize) -> Result<Vec<String>, QueueError> {
        let mut sent = self.sent.lock().unwrap();
        let mut taken = Vec::new();
        sent.retain(|s| {
            if s.queue == queue && taken.len() < max {
                taken.push(s.body.clone());
                false
            } else {
                true
            }
        });
        Ok(taken)
    }
}

// ---------------------------------------------------------------------------
// Change source
// ---------------------------------------------------------------------------

/// Change source replaying fixed per-namespace event lists.
///
/// `At(token)` resumes after the event carrying `token`; unknown tokens are
/// rejected as invalid. `Tail` yields nothing. Open and mid-read failures can
/// be queued per namespace.
#[derive(Default)]
pub struct ScriptedSource {
    databases: BTreeMap<String, Vec<String>>,
    events: Mutex<HashMap<Namespace, Vec<ChangeEvent>>>,
    open_failures: Mutex<HashMap<Namespace, VecDeque<StreamError>>>,
    read_failures: Mutex<HashMap<Namespace, VecDeque<(usize, StreamError)>>>,
    opens: Mutex<Vec<(Namespace, ResumeToken)>>,
    hold_open: AtomicBool,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collection(mut self, database: &str, collection: &str) -> Self {
        self.databases
            .entry(database.to_string())
            .or_default()
            .push(collection.to_string());
        self
    }

    /// Keeps streams open after the scripted events instead of ending them.
    pub fn hold_open(self) -> Self {
        self.hold_open.store(true, Ordering::SeqCst);
        self
    }

    /// Appends events `1..=count` to `namespace`.
    pub fn push_events(&self, namespace: &Namespace, count: u32) -> Vec<ChangeEvent> {
        let mut events = self.events.lock().unwrap();
        let list = events.entry(namespace.clone()).or_default();
        let start = u32::try_from(list.len()).unwrap() + 1;
        let added: Vec<_> = (start..start + count)
            .map(|seq| {
                let op = if seq % 2 == 0 {
                    OperationType::Update
                } else {
                    OperationType::Insert
                };
                event(namespace, seq, op)
            })
            .collect();
        list.extend(added.iter().cloned());
        added
    }

    pub fn fail_open(&self, namespace: &Namespace, error: StreamError) {
        self.open_failures
            .lock()
            .unwrap()
            .entry(namespace.clone())
            .or_default()
            .push_back(error);
    }

    /// Fails the next stream of `namespace` after `after` events.
    pub fn fail_read(&self, namespace: &Namespace, after: usize, error: StreamError) {
        self.read_failures
            .lock()
            .unwrap()
            .entry(namespace.clone())
            .or_default()
            .push_back((after, error));
    }

    pub fn opens(&self) -> Vec<(Namespace, ResumeToken)> {
        self.opens.lock().unwrap().clone()
    }

    pub fn opens_for(&self, namespace: &Namespace) -> Vec<ResumeToken> {
        self.opens()
            .into_iter()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, token)| token)
            .collect()
    }
}

#[async_trait]
impl ChangeSource for ScriptedSource {
    async fn list_databases(&self) -> Result<Vec<String>, StreamError> {
        let mut names: Vec<String> = self.databases.keys().cloned().collect();
        names.extend(["admin", "local", "config"].map(String::from));
        Ok(names)
    }

    async fn list_collections(&self, database: &str) -> Result<Vec<String>, StreamError> {
        Ok(self.databases.get(database).cloned().unwrap_or_default())
    }

    async fn open(&self, namespace: &Namespace, position: &ResumeToken) -> Result<EventStream, StreamError> {
        self.opens
            .lock()
            .unwrap()
            .push((namespace.clone(), position.clone()));

        if let Some(error) = self
            .open_failures
            .lock()
            .unwrap()
            .get_mut(namespace)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }

        let all = self
            .events
            .lock()
            .unwrap()
            .get(namespace)
            .cloned()
            .unwrap_or_default();

        let remaining: Vec<ChangeEvent> = match position {
            ResumeToken::Tail => Vec::new(),
            ResumeToken::Earliest => all,
            ResumeToken::At(token) => match all.iter().position(|e| &e.id == token) {
                Some(index) => all[index + 1..].to_vec(),
                None => return Err(invalid_token()),
            },
        };

        let failure = self
            .read_failures
            .lock()
            .unwrap()
            .get_mut(namespace)
            .and_then(VecDeque::pop_front);

        let stream = match failure {
            Some((after, error)) => {
                let ok: Vec<_> = remaining.into_iter().take(after).map(Ok).collect();
                futures::stream::iter(ok)
                    .chain(futures::stream::once(async move { Err(error) }))
                    .boxed()
            }
            None => futures::stream::iter(remaining.into_iter().map(Ok)).boxed(),
        };

        if self.hold_open.load(Ordering::SeqCst) {
            Ok(stream.chain(futures::stream::pending()).boxed())
        } else {
            Ok(stream)
        }
    }
}

// ---------------------------------------------------------------------------
// Event sink and target
// ---------------------------------------------------------------------------

/// Records delivered events; can be told to refuse them.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ChangeEvent>>,
    refuse: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refusing() -> Self {
        let sink = Self::default();
        sink.refuse.store(true, Ordering::SeqCst);
        sink
    }

    pub fn events(&self) -> Vec<ChangeEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn deliver(&self, event: ChangeEvent) -> Result<(), BatcherError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(BatcherError::Halted {
                namespace: event.namespace.to_string(),
                reason: "flush failed".to_string(),
            });
        }
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeTarget {
    documents: Mutex<HashMap<Namespace, BTreeMap<String, Document>>>,
}

impl FakeTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn documents(&self, namespace: &Namespace) -> Vec<Document> {
        self.documents
            .lock()
            .unwrap()
            .get(namespace)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl TargetWriter for FakeTarget {
    async fn upsert(&self, namespace: &Namespace, documents: Vec<Document>) -> Result<u64, ReplayError> {
        let mut all = self.documents.lock().unwrap();
        let target = all.entry(namespace.clone()).or_default();
        let mut applied = 0;
        for document in documents {
            let id = document.get("_id").map(ToString::to_string).unwrap_or_default();
            target.insert(id, document);
            applied += 1;
        }
        Ok(applied)
    }
}
