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

//! Consumer side of the ledger.
//!
//! A [`BatchReplayer`] applies recorded batches to a target cluster one at a
//! time and in batch order. Each [`WatchTrigger`] replays at most one batch of
//! one namespace, then re-posts itself so the namespace keeps draining:
//! immediately after a replayed batch, after the idle delay when the
//! namespace has caught up. A stopped event writer ends the chain.

use crate::checkpoint::{CheckpointError, CheckpointStore, TrackerState, EVENT_WRITER_COMPONENT};
use crate::control::{jitter, take_first, to_body, ControlError, QueueError, WatchTrigger, WorkQueue, MAX_RESEND_JITTER, WATCH_QUEUE};
use crate::event::Namespace;
use crate::sink::{ObjectSink, SinkError};
use async_trait::async_trait;
use bson::{doc, Bson, Document};
use chrono::Utc;
use mongodb::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

const DUPLICATE_KEY_CODE: i32 = 11000;

/// Errors returned by replay.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("Checkpoint store error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Object sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Control(#[from] ControlError),

    /// A payload line is not a JSON document
    #[error("Cannot decode line {line} of {key}: {message}")]
    Decode { key: String, line: usize, message: String },

    /// The target rejected a write
    #[error("Target write to {namespace} failed: {message}")]
    Target { namespace: String, message: String },
}

/// Destination cluster of a replay.
#[async_trait]
pub trait TargetWriter: Send + Sync {
    /// Replaces each document by `_id`, inserting missing ones.
    ///
    /// Returns the number of documents applied.
    async fn upsert(&self, namespace: &Namespace, documents: Vec<Document>) -> Result<u64, ReplayError>;
}

/// [`TargetWriter`] backed by the MongoDB driver.
#[derive(Debug, Clone)]
pub struct MongoTargetWriter {
    client: Client,
}

impl MongoTargetWriter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn connect(uri: &str) -> Result<Self, ReplayError> {
        let client = Client::with_uri_str(uri)
            .await
            .map_err(|e| ReplayError::Target {
                namespace: String::new(),
                message: e.to_string(),
            })?;
        Ok(Self::new(client))
    }
}

/// Statements per `update` command.
const MAX_COMMAND_STATEMENTS: usize = 1000;

/// Encoded statement bytes per `update` command, well under the 16 MiB
/// document limit.
const MAX_COMMAND_BYTES: usize = 8 * 1024 * 1024;

/// Builds one upsert-by-`_id` statement per document, skipping documents
/// without an `_id`.
fn replace_statements(namespace: &Namespace, documents: Vec<Document>) -> Vec<Document> {
    documents
        .into_iter()
        .filter_map(|document| {
            let Some(id) = document.get("_id").cloned() else {
                warn!(namespace = %namespace, "Skipping document without _id");
                return None;
            };
            Some(doc! { "q": { "_id": id }, "u": document, "upsert": true })
        })
        .collect()
}

/// Splits statements into command-sized groups, keeping their order.
fn command_chunks(statements: Vec<Document>) -> Vec<Vec<Document>> {
    let mut chunks = Vec::new();
    let mut current: Vec<Document> = Vec::new();
    let mut bytes = 0;

    for statement in statements {
        let size = bson::to_vec(&statement).map_or(0, |encoded| encoded.len());
        if !current.is_empty()
            && (current.len() >= MAX_COMMAND_STATEMENTS || bytes + size > MAX_COMMAND_BYTES)
        {
            chunks.push(std::mem::take(&mut current));
            bytes = 0;
        }
        bytes += size;
        current.push(statement);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn update_command(collection: &str, statements: &[Document]) -> Document {
    doc! {
        "update": collection,
        "updates": statements.to_vec(),
        "ordered": true,
    }
}

/// A write error reported in an `update` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StatementError {
    index: usize,
    code: i32,
    message: String,
}

/// First write error of an ordered `update` reply. The server stops at it.
fn first_write_error(reply: &Document) -> Option<StatementError> {
    let first = reply.get_array("writeErrors").ok()?.first()?.as_document()?;
    let index = match first.get("index") {
        Some(Bson::Int32(i)) => usize::try_from(*i).ok()?,
        Some(Bson::Int64(i)) => usize::try_from(*i).ok()?,
        _ => return None,
    };
    Some(StatementError {
        index,
        code: first.get_i32("code").unwrap_or_default(),
        message: first.get_str("errmsg").unwrap_or_default().to_string(),
    })
}

#[async_trait]
impl TargetWriter for MongoTargetWriter {
    /// Sends the batch as ordered multi-statement `update` commands, one
    /// round trip per chunk. A duplicate key resumes after the failed
    /// statement; any other write error aborts the batch.
    async fn upsert(&self, namespace: &Namespace, documents: Vec<Document>) -> Result<u64, ReplayError> {
        let database = self.client.database(&namespace.database);
        let target_error = |message: String| ReplayError::Target {
            namespace: namespace.to_string(),
            message,
        };

        let mut applied = 0;
        for chunk in command_chunks(replace_statements(namespace, documents)) {
            let mut offset = 0;
            while offset < chunk.len() {
                let pending = &chunk[offset..];
                let reply = database
                    .run_command(update_command(&namespace.collection, pending))
                    .await
                    .map_err(|e| target_error(e.to_string()))?;

                if let Ok(concern) = reply.get_document("writeConcernError") {
                    return Err(target_error(format!("write concern error: {concern}")));
                }

                match first_write_error(&reply) {
                    None => {
                        applied += pending.len() as u64;
                        offset = chunk.len();
                    }
                    Some(error) if error.code == DUPLICATE_KEY_CODE => {
                        debug!(namespace = %namespace, index = offset + error.index, "Ignoring duplicate key on upsert");
                        applied += error.index as u64 + 1;
                        offset += error.index + 1;
                    }
                    Some(error) => {
                        return Err(target_error(format!(
                            "statement {} failed with code {}: {}",
                            offset + error.index,
                            error.code,
                            error.message
                        )))
                    }
                }
            }
        }
        Ok(applied)
    }
}

/// Decodes a newline-delimited payload into documents.
///
/// Blank lines and `null` documents are skipped.
pub fn decode_batch(key: &str, body: &[u8]) -> Result<Vec<Document>, ReplayError> {
    let text = std::str::from_utf8(body).map_err(|e| ReplayError::Decode {
        key: key.to_string(),
        line: 0,
        message: e.to_string(),
    })?;

    let mut documents = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let decode_err = |message: String| ReplayError::Decode {
            key: key.to_string(),
            line: index + 1,
            message,
        };

        let value: serde_json::Value = serde_json::from_str(line).map_err(|e| decode_err(e.to_string()))?;
        match Bson::try_from(value).map_err(|e| decode_err(e.to_string()))? {
            Bson::Document(document) => documents.push(document),
            Bson::Null => {}
            other => return Err(decode_err(format!("expected a document, found {:?}", other.element_type()))),
        }
    }
    Ok(documents)
}

/// Result of one [`BatchReplayer::replay_next`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// The event writer is not running
    Stopped,
    /// No unprocessed batch
    Idle,
    /// A batch was applied and marked processed
    Replayed { batch_id: u64, documents: u64 },
}

/// Applies ledger batches to a target.
pub struct BatchReplayer<C: ?Sized, O: ?Sized, T: ?Sized, Q: ?Sized> {
    store: Arc<C>,
    sink: Arc<O>,
    target: Arc<T>,
    queue: Arc<Q>,
    bucket: String,
    idle_delay: Duration,
}

impl<C, O, T, Q> BatchReplayer<C, O, T, Q>
where
    C: CheckpointStore + ?Sized,
    O: ObjectSink + ?Sized,
    T: TargetWriter + ?Sized,
    Q: WorkQueue + ?Sized,
{
    pub fn new(store: Arc<C>, sink: Arc<O>, target: Arc<T>, queue: Arc<Q>, bucket: impl Into<String>) -> Self {
        Self {
            store,
            sink,
            target,
            queue,
            bucket: bucket.into(),
            idle_delay: Duration::from_secs(10),
        }
    }

    /// Delay before a caught-up namespace is polled again. Defaults to 10s.
    #[must_use]
    pub fn with_idle_delay(mut self, delay: Duration) -> Self {
        self.idle_delay = delay;
        self
    }

    /// Applies the oldest unprocessed batch of `namespace`.
    #[instrument(skip(self), fields(namespace = %namespace))]
    pub async fn replay_next(&self, cluster_name: &str, namespace: &Namespace) -> Result<ReplayOutcome, ReplayError> {
        let tracker = self.store.get_tracker(cluster_name, EVENT_WRITER_COMPONENT).await?;
        if tracker != Some(TrackerState::Start) {
            debug!("Event writer not running");
            return Ok(ReplayOutcome::Stopped);
        }

        let Some(entry) = self.store.next_unprocessed(cluster_name, namespace).await? else {
            debug!("No unprocessed batch");
            return Ok(ReplayOutcome::Idle);
        };

        let documents = if entry.has_payload() && entry.document_count > 0 {
            let body = self.sink.get(&self.bucket, &entry.object_link).await?;
            let documents = decode_batch(&entry.object_link, &body)?;
            self.target.upsert(namespace, documents).await?
        } else {
            0
        };

        let marked = self
            .store
            .mark_processed(cluster_name, namespace, entry.batch_id, Utc::now())
            .await?;
        if !marked {
            warn!(batch_id = entry.batch_id, "Batch already marked processed");
        }

        info!(batch_id = entry.batch_id, documents, "Batch replayed");
        Ok(ReplayOutcome::Replayed {
            batch_id: entry.batch_id,
            documents,
        })
    }

    /// Handles one delivery of watch triggers.
    ///
    /// Extra triggers are re-enqueued with a jittered delay. After the first
    /// one is processed its trigger is posted again unless the event writer
    /// stopped; a failed replay is retried after the idle delay.
    #[instrument(skip_all, fields(messages = bodies.len()))]
    pub async fn handle(&self, bodies: Vec<String>) -> Result<Option<ReplayOutcome>, ReplayError> {
        let Some(first) = take_first(self.queue.as_ref(), WATCH_QUEUE, bodies, || jitter(MAX_RESEND_JITTER)).await? else {
            return Ok(None);
        };

        let trigger = WatchTrigger::from_json(&first)?;
        let namespace = trigger.namespace()?;

        let outcome = match self.replay_next(&trigger.cluster_name, &namespace).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(namespace = %namespace, error = %e, "Replay failed, retrying later");
                self.queue.send(WATCH_QUEUE, to_body(&trigger)?, self.idle_delay).await?;
                return Err(e);
            }
        };

        let next = match outcome {
            ReplayOutcome::Replayed { .. } => Some(Duration::ZERO),
            ReplayOutcome::Idle => Some(self.idle_delay),
            ReplayOutcome::Stopped => None,
        };
        if let Some(delay) = next {
            self.queue.send(WATCH_QUEUE, to_body(&trigger)?, delay).await?;
        }

        Ok(Some(outcome))
    }
}
