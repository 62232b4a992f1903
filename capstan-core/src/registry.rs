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

//! Namespace to batcher routing.
//!
//! The registry owns one [`DocumentBatcher`] per namespace and creates it the
//! first time an event for that namespace arrives. Lookups take a shared read
//! lock; only creation goes through the creation mutex, and the map is
//! re-checked under it so two watchers racing on a new namespace end up with
//! the same batcher.

use crate::batcher::{BatcherConfig, BatcherError, DocumentBatcher};
use crate::checkpoint::{CheckpointStore, WatcherCheckpoint};
use crate::event::{ChangeEvent, Namespace};
use crate::sink::ObjectSink;
use crate::stream::EventSink;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info};

/// Owns the batchers of every captured namespace.
pub struct NamespaceRegistry<C, O> {
    cluster_name: String,
    config: BatcherConfig,
    store: Arc<C>,
    sink: Arc<O>,
    checkpoints: HashMap<Namespace, WatcherCheckpoint>,
    batchers: RwLock<HashMap<Namespace, Arc<DocumentBatcher<C, O>>>>,
    create_lock: Mutex<()>,
    closed: AtomicBool,
}

impl<C, O> NamespaceRegistry<C, O>
where
    C: CheckpointStore + 'static,
    O: ObjectSink + 'static,
{
    /// Creates an empty registry.
    ///
    /// `checkpoints` are the rows loaded at startup; each new batcher is
    /// initialized from the one matching its namespace.
    pub fn new(
        cluster_name: impl Into<String>,
        config: BatcherConfig,
        store: Arc<C>,
        sink: Arc<O>,
        checkpoints: HashMap<Namespace, WatcherCheckpoint>,
    ) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            config,
            store,
            sink,
            checkpoints,
            batchers: RwLock::new(HashMap::new()),
            create_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns the batcher of `namespace`, creating it on first use.
    pub async fn batcher_for(&self, namespace: &Namespace) -> Arc<DocumentBatcher<C, O>> {
        if let Some(batcher) = self.batchers.read().await.get(namespace) {
            return Arc::clone(batcher);
        }

        let _guard = self.create_lock.lock().await;
        if let Some(batcher) = self.batchers.read().await.get(namespace) {
            return Arc::clone(batcher);
        }

        let checkpoint = self.checkpoints.get(namespace);
        debug!(
            namespace = %namespace,
            resumed = checkpoint.is_some(),
            "Creating batcher"
        );

        let batcher = Arc::new(
            DocumentBatcher::spawn(
                self.cluster_name.clone(),
                namespace.clone(),
                checkpoint,
                self.config.clone(),
                Arc::clone(&self.store),
                Arc::clone(&self.sink),
            )
            .await,
        );

        self.batchers
            .write()
            .await
            .insert(namespace.clone(), Arc::clone(&batcher));
        batcher
    }

    /// Returns the batcher of `namespace` if one exists.
    pub async fn get(&self, namespace: &Namespace) -> Option<Arc<DocumentBatcher<C, O>>> {
        self.batchers.read().await.get(namespace).cloned()
    }

    pub async fn len(&self) -> usize {
        self.batchers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.batchers.read().await.is_empty()
    }

    /// Closes every batcher.
    ///
    /// All batchers are closed even if some fail; the first error is
    /// returned.
    pub async fn close(&self) -> Result<(), BatcherError> {
        self.closed.store(true, Ordering::SeqCst);

        let batchers: Vec<_> = self.batchers.read().await.values().cloned().collect();
        info!(batchers = batchers.len(), "Closing namespace registry");

        let mut first_error = None;
        for batcher in batchers {
            if let Err(e) = batcher.close().await {
                error!(namespace = %batcher.namespace(), error = %e, "Failed to close batcher");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl<C, O> EventSink for NamespaceRegistry<C, O>
where
    C: CheckpointStore + 'static,
    O: ObjectSink + 'static,
{
    async fn deliver(&self, event: ChangeEvent) -> Result<(), BatcherError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BatcherError::Closed {
                namespace: event.namespace.to_string(),
            });
        }
        let batcher = self.batcher_for(&event.namespace).await;
        batcher.on_event(event).await
    }
}
