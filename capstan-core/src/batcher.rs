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

//! Per-namespace buffering and flush engine.
//!
//! A [`DocumentBatcher`] accumulates the events of one namespace and, on a
//! fixed interval, turns them into one batch:
//!
//! 1. the full documents are uploaded to the [`ObjectSink`] as NDJSON (empty
//!    ticks upload nothing and record a `"null"` link)
//! 2. the [`WatcherCheckpoint`] and the [`ChangeLedgerEntry`] are committed to
//!    the [`CheckpointStore`]
//! 3. the batch id advances
//!
//! The buffer sits behind an async mutex that the flush holds from drain to
//! commit. Producers calling [`DocumentBatcher::on_event`] wait on that mutex,
//! so an event is either part of the batch being flushed or of the next one.
//!
//! # Recorded positions
//!
//! - the ledger entry of batch *N* carries the position held before the first
//!   event of *N*; reopening the stream there replays exactly the batch
//! - the checkpoint carries the position just before the last observed event
//!   and that event as validation document, so a restart replays the last
//!   event and can verify it
//!
//! When a write still fails after the configured retries the batcher halts:
//! the buffer is kept, further events are refused and the caller (the watcher)
//! stops with the error instead of dropping data.

use crate::checkpoint::{ChangeLedgerEntry, CheckpointError, CheckpointStore, WatcherCheckpoint};
use crate::event::{ChangeEvent, Namespace, ResumeToken};
use crate::metrics::{self, BatchKind, Timer};
use crate::sink::{batch_key, encode_batch, ObjectSink, SinkError};
use bson::Document;
use chrono::Utc;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Configuration for [`DocumentBatcher`].
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// Bucket receiving batch payloads
    pub bucket: String,

    /// Time between two flushes
    pub flush_interval: Duration,

    /// Retries for each external write of a flush
    pub max_retries: u32,

    /// Initial retry delay (doubles with each retry)
    pub retry_delay: Duration,

    /// Maximum retry delay
    pub max_retry_delay: Duration,
}

impl BatcherConfig {
    /// Creates a new builder for `BatcherConfig`.
    #[must_use]
    pub fn builder() -> BatcherConfigBuilder {
        BatcherConfigBuilder::default()
    }
}

/// Builder for `BatcherConfig`.
#[derive(Debug, Default)]
pub struct BatcherConfigBuilder {
    bucket: Option<String>,
    flush_interval: Option<Duration>,
    max_retries: Option<u32>,
    retry_delay: Option<Duration>,
    max_retry_delay: Option<Duration>,
}

impl BatcherConfigBuilder {
    #[must_use]
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Sets the flush interval. Default: 10s.
    #[must_use]
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = Some(interval);
        self
    }

    /// Default: 3.
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Default: 100ms.
    #[must_use]
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    /// Default: 5s.
    #[must_use]
    pub fn max_retry_delay(mut self, delay: Duration) -> Self {
        self.max_retry_delay = Some(delay);
        self
    }

    /// Builds the `BatcherConfig`.
    ///
    /// # Errors
    ///
    /// Returns an error if the bucket is missing or the interval is zero.
    pub fn build(self) -> Result<BatcherConfig, String> {
        let bucket = self.bucket.ok_or("bucket is required")?;
        if bucket.is_empty() {
            return Err("bucket cannot be empty".to_string());
        }

        let flush_interval = self.flush_interval.unwrap_or(Duration::from_secs(10));
        if flush_interval.is_zero() {
            return Err("flush_interval must be greater than zero".to_string());
        }

        let retry_delay = self.retry_delay.unwrap_or(Duration::from_millis(100));
        let max_retry_delay = self.max_retry_delay.unwrap_or(Duration::from_secs(5));
        if retry_delay > max_retry_delay {
            return Err(format!(
                "retry_delay ({retry_delay:?}) must be <= max_retry_delay ({max_retry_delay:?})"
            ));
        }

        Ok(BatcherConfig {
            bucket,
            flush_interval,
            max_retries: self.max_retries.unwrap_or(3),
            retry_delay,
            max_retry_delay,
        })
    }
}

/// Errors returned by [`DocumentBatcher`].
#[derive(Debug, thiserror::Error)]
pub enum BatcherError {
    /// The batcher has been closed
    #[error("Batcher for {namespace} is closed")]
    Closed { namespace: String },

    /// A previous flush failed for good; capture of the namespace must stop
    #[error("Batcher for {namespace} halted after a failed flush: {reason}")]
    Halted { namespace: String, reason: String },

    /// Payload upload failed
    #[error("Object sink error: {0}")]
    Sink(#[from] SinkError),

    /// Checkpoint commit failed
    #[error("Checkpoint store error: {0}")]
    Checkpoint(#[from] CheckpointError),
}

/// Result of one flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushOutcome {
    pub batch_id: u64,
    pub document_count: usize,
    /// Object key, `None` for heartbeats
    pub object_key: Option<String>,
}

#[derive(Debug)]
struct BatchState {
    buffer: Vec<ChangeEvent>,
    batch_id: u64,
    /// Position before the first buffered event
    batch_start: ResumeToken,
    /// Position before `current`
    previous: ResumeToken,
    /// Last observed event
    current: Option<ChangeEvent>,
    /// Validation document of the last commit, kept for heartbeats
    last_validation: Option<Document>,
    closed: bool,
    halted: Option<String>,
}

struct Shared<C, O> {
    cluster_name: String,
    namespace: Namespace,
    config: BatcherConfig,
    store: Arc<C>,
    sink: Arc<O>,
    state: Mutex<BatchState>,
}

/// Buffers the events of one namespace and flushes them on a timer.
pub struct DocumentBatcher<C, O> {
    shared: Arc<Shared<C, O>>,
    shutdown: CancellationToken,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl<C, O> DocumentBatcher<C, O>
where
    C: CheckpointStore + 'static,
    O: ObjectSink + 'static,
{
    /// Creates a batcher without a running timer; flushes happen only through
    /// [`DocumentBatcher::on_tick`].
    ///
    /// With a checkpoint, batch ids continue at `checkpoint.batch_id + 1` and
    /// the recorded position starts at the checkpoint token. Without one the
    /// namespace is new and starts at batch 0 from the `earliest` sentinel.
    pub fn new(
        cluster_name: impl Into<String>,
        namespace: Namespace,
        checkpoint: Option<&WatcherCheckpoint>,
        config: BatcherConfig,
        store: Arc<C>,
        sink: Arc<O>,
    ) -> Self {
        let (batch_id, initial, last_validation) = match checkpoint {
            Some(cp) => (
                cp.next_batch_id(),
                cp.resume_token.clone(),
                cp.validation_document.clone(),
            ),
            None => (0, ResumeToken::Earliest, None),
        };

        let state = BatchState {
            buffer: Vec::new(),
            batch_id,
            batch_start: initial.clone(),
            previous: initial,
            current: None,
            last_validation,
            closed: false,
            halted: None,
        };

        Self {
            shared: Arc::new(Shared {
                cluster_name: cluster_name.into(),
                namespace,
                config,
                store,
                sink,
                state: Mutex::new(state),
            }),
            shutdown: CancellationToken::new(),
            timer: Mutex::new(None),
        }
    }

    /// Creates a batcher and starts its flush timer.
    pub async fn spawn(
        cluster_name: impl Into<String>,
        namespace: Namespace,
        checkpoint: Option<&WatcherCheckpoint>,
        config: BatcherConfig,
        store: Arc<C>,
        sink: Arc<O>,
    ) -> Self {
        let batcher = Self::new(cluster_name, namespace, checkpoint, config, store, sink);
        let handle = Self::spawn_timer(Arc::clone(&batcher.shared), batcher.shutdown.clone());
        *batcher.timer.lock().await = Some(handle);
        batcher
    }

    fn spawn_timer(shared: Arc<Shared<C, O>>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = shared.config.flush_interval;
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            debug!(namespace = %shared.namespace, interval = ?period, "Flush timer started");

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = shared.flush().await {
                            error!(namespace = %shared.namespace, error = %e, "Flush timer stopping");
                            break;
                        }
                    }
                }
            }

            debug!(namespace = %shared.namespace, "Flush timer stopped");
        })
    }

    #[must_use]
    pub fn namespace(&self) -> &Namespace {
        &self.shared.namespace
    }

    /// Appends an event, waiting while a flush is in progress.
    ///
    /// # Errors
    ///
    /// Fails once the batcher is closed or halted; the event is not buffered.
    pub async fn on_event(&self, event: ChangeEvent) -> Result<(), BatcherError> {
        let mut state = self.shared.state.lock().await;
        self.shared.check_open(&state)?;

        metrics::increment_events_captured(
            &self.shared.namespace.to_string(),
            event.operation.as_str(),
        );

        if let Some(current) = state.current.take() {
            state.previous = current.position();
        }
        state.current = Some(event.clone());
        state.buffer.push(event);
        Ok(())
    }

    /// Flushes the buffer now. The timer calls the same code path.
    ///
    /// # Errors
    ///
    /// Returns the write error after retries are exhausted; the batcher is
    /// halted from then on.
    pub async fn on_tick(&self) -> Result<FlushOutcome, BatcherError> {
        self.shared.flush().await
    }

    /// Stops the timer, waits for an in-flight flush and flushes what is left.
    ///
    /// Further calls to [`DocumentBatcher::on_event`] fail. Closing twice is a
    /// no-op. A halted batcher reports [`BatcherError::Halted`] on its first
    /// close.
    #[instrument(skip(self), fields(namespace = %self.shared.namespace))]
    pub async fn close(&self) -> Result<(), BatcherError> {
        self.shutdown.cancel();
        if let Some(handle) = self.timer.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Flush timer task ended abnormally");
            }
        }

        let mut state = self.shared.state.lock().await;
        if state.closed {
            return Ok(());
        }

        let result = if let Some(reason) = &state.halted {
            Err(BatcherError::Halted {
                namespace: self.shared.namespace.to_string(),
                reason: reason.clone(),
            })
        } else if state.buffer.is_empty() {
            Ok(())
        } else {
            info!(pending = state.buffer.len(), "Flushing pending events on close");
            self.shared.flush_guarded(&mut state).await.map(|_| ())
        };

        state.closed = true;
        result
    }

    /// Number of buffered events.
    pub async fn pending(&self) -> usize {
        self.shared.state.lock().await.buffer.len()
    }

    /// Id the next flush will use.
    pub async fn next_batch_id(&self) -> u64 {
        self.shared.state.lock().await.batch_id
    }
}

impl<C, O> Shared<C, O>
where
    C: CheckpointStore,
    O: ObjectSink,
{
    fn check_open(&self, state: &BatchState) -> Result<(), BatcherError> {
        if state.closed {
            return Err(BatcherError::Closed {
                namespace: self.namespace.to_string(),
            });
        }
        if let Some(reason) = &state.halted {
            return Err(BatcherError::Halted {
                namespace: self.namespace.to_string(),
                reason: reason.clone(),
            });
        }
        Ok(())
    }

    async fn flush(&self) -> Result<FlushOutcome, BatcherError> {
        let mut state = self.state.lock().await;
        self.check_open(&state)?;
        self.flush_guarded(&mut state).await
    }

    async fn flush_guarded(&self, state: &mut BatchState) -> Result<FlushOutcome, BatcherError> {
        match self.flush_locked(state).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                metrics::increment_flush_failures(&self.namespace.to_string());
                error!(
                    namespace = %self.namespace,
                    batch_id = state.batch_id,
                    pending = state.buffer.len(),
                    error = %e,
                    "Flush failed, halting capture of namespace"
                );
                state.halted = Some(e.to_string());
                Err(e)
            }
        }
    }

    #[instrument(skip(self, state), fields(namespace = %self.namespace, batch_id = state.batch_id, batch_size = state.buffer.len()))]
    async fn flush_locked(&self, state: &mut BatchState) -> Result<FlushOutcome, BatcherError> {
        let ns = self.namespace.to_string();
        let _timer = Timer::new(ns.clone(), |duration, ns| {
            metrics::record_flush_duration(duration, ns);
        });

        let document_count = state.buffer.len();
        let object_key = if state.buffer.is_empty() {
            None
        } else {
            let key = batch_key(&self.cluster_name, &self.namespace, state.batch_id);
            let body = encode_batch(&state.buffer);
            let bucket = self.config.bucket.as_str();

            retry_with_backoff(&self.config, "object upload", SinkError::is_retryable, || {
                self.sink.put(bucket, &key, body.clone())
            })
            .await?;

            Some(key)
        };

        let now = Utc::now();
        let validation_document = match &state.current {
            Some(event) => match event.to_document() {
                Ok(doc) => Some(doc),
                Err(e) => {
                    warn!(error = %e, "Could not render validation document");
                    None
                }
            },
            None => state.last_validation.clone(),
        };

        let checkpoint = WatcherCheckpoint {
            cluster_name: self.cluster_name.clone(),
            namespace: self.namespace.clone(),
            resume_token: state.previous.clone(),
            validation_document,
            batch_id: state.batch_id,
            cumulative_document_count: 0,
            updated_at: now,
        };
        let entry = ChangeLedgerEntry::new(
            self.cluster_name.clone(),
            self.namespace.clone(),
            state.batch_id,
            object_key.clone(),
            document_count as u64,
            state.batch_start.clone(),
            now,
        );

        retry_with_backoff(&self.config, "checkpoint commit", CheckpointError::is_retryable, || {
            self.store.commit_batch(&checkpoint, document_count as u64, &entry)
        })
        .await?;

        state.last_validation = checkpoint.validation_document;
        if let Some(last) = state.buffer.last() {
            state.batch_start = last.position();
        }
        state.buffer.clear();
        let batch_id = state.batch_id;
        state.batch_id += 1;

        let kind = if object_key.is_some() {
            BatchKind::Payload
        } else {
            BatchKind::Heartbeat
        };
        metrics::increment_batches_flushed(&ns, kind);
        metrics::record_batch_documents(document_count, &ns);

        if object_key.is_some() {
            info!(document_count, "Batch flushed");
        } else {
            debug!("Heartbeat recorded");
        }

        Ok(FlushOutcome {
            batch_id,
            document_count,
            object_key,
        })
    }
}

/// Runs `op` with exponential backoff until it succeeds, fails with a
/// non-retryable error or exhausts `config.max_retries`.
pub(crate) async fn retry_with_backoff<T, E, F, Fut>(
    config: &BatcherConfig,
    what: &'static str,
    is_retryable: fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut retry_delay = config.retry_delay;
    let mut attempt = 0;

    loop {
        match op().await {
            Ok(value) => {
                if attempt > 0 {
                    info!(what, attempts = attempt + 1, "Write succeeded after retries");
                }
                return Ok(value);
            }
            Err(e) => {
                attempt += 1;

                if attempt > config.max_retries || !is_retryable(&e) {
                    error!(what, attempts = attempt, error = %e, "Write failed");
                    return Err(e);
                }

                warn!(
                    what,
                    attempt,
                    max_retries = config.max_retries,
                    retry_delay_ms = retry_delay.as_millis(),
                    error = %e,
                    "Write failed, retrying"
                );

                tokio::time::sleep(retry_delay).await;
                retry_delay = std::cmp::min(retry_delay * 2, config.max_retry_delay);
            }
        }
    }
}
