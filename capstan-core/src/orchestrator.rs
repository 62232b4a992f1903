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

//! Cluster-wide watcher lifecycle.
//!
//! [`ClusterOrchestrator`] discovers the namespaces of the source cluster and
//! runs one [`NamespaceWatcher`] per namespace on its own task. A watcher that
//! fails only ends its own namespace; [`ClusterOrchestrator::watch`] returns
//! once every watcher has finished and reports how each one ended.

use crate::checkpoint::{CheckpointStore, WatcherCheckpoint};
use crate::event::{Namespace, ResumeToken};
use crate::metrics;
use crate::stream::{ChangeSource, EventSink, NamespaceWatcher, StreamError, WatchError, WatchExit};
use bson::Document;
use futures::StreamExt;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Databases never captured.
pub const SYSTEM_DATABASES: [&str; 3] = ["admin", "local", "config"];

/// Database name to collection names.
pub type NamespaceMap = BTreeMap<String, BTreeSet<String>>;

/// Errors returned by [`ClusterOrchestrator`].
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Source error: {0}")]
    Stream(#[from] StreamError),

    #[error("Checkpoint store error: {0}")]
    Checkpoint(#[from] crate::checkpoint::CheckpointError),

    /// No event arrived within the allotted time
    #[error("Timed out waiting for events on {namespace}")]
    Timeout { namespace: String },
}

/// How every watcher of a [`ClusterOrchestrator::watch`] call ended.
#[derive(Debug, Default)]
pub struct WatchReport {
    pub finished: Vec<(Namespace, WatchExit)>,
    pub failed: Vec<(Namespace, WatchError)>,
    /// Watcher tasks that panicked
    pub aborted: usize,
}

impl WatchReport {
    /// True when no watcher failed or panicked.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.aborted == 0
    }
}

/// Start position found by [`ClusterOrchestrator::peek`].
#[derive(Debug, Clone, PartialEq)]
pub struct PeekResult {
    /// Position of the first retained event
    pub resume_token: ResumeToken,
    /// The event that follows it, if any
    pub validation_document: Option<Document>,
}

/// Discovers namespaces and supervises their watchers.
pub struct ClusterOrchestrator<S: ?Sized> {
    source: Arc<S>,
    cluster_name: String,
    excluded: BTreeSet<String>,
    max_attempts: u32,
    cancel: CancellationToken,
}

impl<S> ClusterOrchestrator<S>
where
    S: ChangeSource + ?Sized + 'static,
{
    /// Creates an orchestrator skipping [`SYSTEM_DATABASES`].
    pub fn new(source: Arc<S>, cluster_name: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            source,
            cluster_name: cluster_name.into(),
            excluded: SYSTEM_DATABASES.iter().map(|db| (*db).to_string()).collect(),
            max_attempts,
            cancel: CancellationToken::new(),
        }
    }

    /// Adds databases to skip during discovery.
    #[must_use]
    pub fn exclude_databases<I, T>(mut self, databases: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.excluded.extend(databases.into_iter().map(Into::into));
        self
    }

    /// Uses `token` as the stop signal, so cancelling it has the same effect
    /// as [`Self::close`].
    #[must_use]
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    #[must_use]
    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// Lists user databases and their collections.
    #[instrument(skip(self), fields(cluster = %self.cluster_name))]
    pub async fn discover_namespaces(&self) -> Result<NamespaceMap, OrchestratorError> {
        let mut namespaces = NamespaceMap::new();

        for database in self.source.list_databases().await? {
            if self.excluded.contains(&database) {
                debug!(database = %database, "Skipping excluded database");
                continue;
            }
            let collections = self.source.list_collections(&database).await?;
            namespaces.insert(database, collections.into_iter().collect());
        }

        info!(
            databases = namespaces.len(),
            collections = namespaces.values().map(BTreeSet::len).sum::<usize>(),
            "Namespaces discovered"
        );
        Ok(namespaces)
    }

    /// Loads the stored checkpoint of every namespace that has one.
    pub async fn load_checkpoints<C>(
        &self,
        store: &C,
        namespaces: &[Namespace],
    ) -> Result<HashMap<Namespace, WatcherCheckpoint>, OrchestratorError>
    where
        C: CheckpointStore + ?Sized,
    {
        let mut checkpoints = HashMap::new();
        for namespace in namespaces {
            if let Some(checkpoint) = store.get_watcher(&self.cluster_name, namespace).await? {
                debug!(
                    namespace = %namespace,
                    batch_id = checkpoint.batch_id,
                    "Loaded checkpoint"
                );
                checkpoints.insert(namespace.clone(), checkpoint);
            }
        }
        Ok(checkpoints)
    }

    /// Discovers the namespaces and watches all of them.
    pub async fn watch<K>(
        &self,
        checkpoints: &HashMap<Namespace, WatcherCheckpoint>,
        sink: Arc<K>,
    ) -> Result<WatchReport, OrchestratorError>
    where
        K: EventSink + ?Sized + 'static,
    {
        let namespaces = flatten(&self.discover_namespaces().await?);
        Ok(self.watch_namespaces(namespaces, checkpoints, sink).await)
    }

    /// Runs one watcher per namespace and waits for all of them.
    ///
    /// Each watcher starts at its checkpoint token, or at `earliest` when the
    /// namespace has none.
    #[instrument(skip_all, fields(cluster = %self.cluster_name, namespaces = namespaces.len()))]
    pub async fn watch_namespaces<K>(
        &self,
        namespaces: Vec<Namespace>,
        checkpoints: &HashMap<Namespace, WatcherCheckpoint>,
        sink: Arc<K>,
    ) -> WatchReport
    where
        K: EventSink + ?Sized + 'static,
    {
        let mut tasks = JoinSet::new();

        for namespace in namespaces {
            let start = checkpoints
                .get(&namespace)
                .map_or(ResumeToken::Earliest, |cp| cp.resume_token.clone());
            let watcher = NamespaceWatcher::new(
                Arc::clone(&self.source),
                namespace.clone(),
                self.max_attempts,
                self.cancel.child_token(),
            );
            let sink = Arc::clone(&sink);

            tasks.spawn(async move {
                let result = watcher.run(start, sink.as_ref()).await;
                (namespace, result)
            });
        }

        let mut running = tasks.len();
        metrics::set_active_watchers(running);
        info!(watchers = running, "Watchers started");

        let mut report = WatchReport::default();
        while let Some(joined) = tasks.join_next().await {
            running -= 1;
            metrics::set_active_watchers(running);

            match joined {
                Ok((namespace, Ok(exit))) => report.finished.push((namespace, exit)),
                Ok((namespace, Err(e))) => {
                    error!(namespace = %namespace, error = %e, "Watcher failed");
                    report.failed.push((namespace, e));
                }
                Err(e) => {
                    error!(error = %e, "Watcher task panicked");
                    report.aborted += 1;
                }
            }
        }

        info!(
            finished = report.finished.len(),
            failed = report.failed.len(),
            "All watchers stopped"
        );
        report
    }

    /// Asks every watcher to stop before its next read.
    pub fn close(&self) {
        info!(cluster = %self.cluster_name, "Stopping watchers");
        self.cancel.cancel();
    }

    /// Finds the oldest retained position of a namespace.
    ///
    /// Reads the first two events from `earliest`: the first gives the
    /// position, the second becomes the validation document. Returns `None`
    /// if the stream ends before any event.
    pub async fn peek(
        &self,
        namespace: &Namespace,
        wait: Duration,
    ) -> Result<Option<PeekResult>, OrchestratorError> {
        let mut stream = self.source.open(namespace, &ResumeToken::Earliest).await?;
        let timeout = || OrchestratorError::Timeout {
            namespace: namespace.to_string(),
        };

        let first = match tokio::time::timeout(wait, stream.next()).await.map_err(|_| timeout())? {
            Some(event) => event?,
            None => return Ok(None),
        };

        let validation_document = match tokio::time::timeout(wait, stream.next()).await {
            Ok(Some(event)) => Some(event?.to_document().map_err(|e| {
                StreamError::Configuration(format!("cannot render validation document: {e}"))
            })?),
            Ok(None) | Err(_) => None,
        };

        Ok(Some(PeekResult {
            resume_token: first.position(),
            validation_document,
        }))
    }

    /// Checks that reopening at the checkpoint yields its validation document
    /// as the next event.
    pub async fn validate(
        &self,
        checkpoint: &WatcherCheckpoint,
        wait: Duration,
    ) -> Result<bool, OrchestratorError> {
        let Some(expected) = &checkpoint.validation_document else {
            warn!(namespace = %checkpoint.namespace, "Checkpoint has no validation document");
            return Ok(false);
        };

        let mut stream = self
            .source
            .open(&checkpoint.namespace, &checkpoint.resume_token)
            .await?;

        let next = tokio::time::timeout(wait, stream.next())
            .await
            .map_err(|_| OrchestratorError::Timeout {
                namespace: checkpoint.namespace.to_string(),
            })?;

        match next {
            Some(event) => {
                let event = event?;
                let matches = event.to_document().is_ok_and(|doc| &doc == expected);
                if !matches {
                    warn!(namespace = %checkpoint.namespace, "Validation document mismatch");
                }
                Ok(matches)
            }
            None => Ok(false),
        }
    }
}

/// Flattens a [`NamespaceMap`] into namespaces, sorted.
#[must_use]
pub fn flatten(map: &NamespaceMap) -> Vec<Namespace> {
    map.iter()
        .flat_map(|(db, collections)| collections.iter().map(move |coll| Namespace::new(db.clone(), coll.clone())))
        .collect()
}
