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

//! End-to-end capture of one cluster.
//!
//! [`CaptureService`] wires the pieces together:
//!
//! 1. discover the namespaces of the source
//! 2. persist them for the control plane
//! 3. load their checkpoints
//! 4. build the [`NamespaceRegistry`]
//! 5. watch until shutdown or until every watcher ends
//! 6. close the registry, flushing what is still buffered
//!
//! # Example
//!
//! ```rust,no_run
//! use capstan_core::batcher::BatcherConfig;
//! use capstan_core::capture::CaptureConfig;
//! use std::time::Duration;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CaptureConfig::builder()
//!     .cluster_name("prod")
//!     .batcher_config(
//!         BatcherConfig::builder()
//!             .bucket("change-feed")
//!             .flush_interval(Duration::from_secs(10))
//!             .build()?,
//!     )
//!     .build()?;
//!
//! // let service = CaptureService::new(config, source, store, sink);
//! // let report = service.run(shutdown_token).await?;
//! # Ok(())
//! # }
//! ```

use crate::batcher::{BatcherConfig, BatcherError};
use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::orchestrator::{flatten, ClusterOrchestrator, OrchestratorError, WatchReport};
use crate::registry::NamespaceRegistry;
use crate::sink::ObjectSink;
use crate::stream::{ChangeSource, ChangeStreamConfig};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Configuration for a [`CaptureService`].
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Name the cluster is tracked under
    pub cluster_name: String,

    /// Databases skipped in addition to `admin`, `local` and `config`
    pub excluded_databases: Vec<String>,

    /// Change stream configuration
    pub stream_config: ChangeStreamConfig,

    /// Per-namespace batching configuration
    pub batcher_config: BatcherConfig,
}

impl CaptureConfig {
    #[must_use]
    pub fn builder() -> CaptureConfigBuilder {
        CaptureConfigBuilder::default()
    }
}

/// Builder for [`CaptureConfig`].
#[derive(Debug, Default)]
pub struct CaptureConfigBuilder {
    cluster_name: Option<String>,
    excluded_databases: Vec<String>,
    stream_config: Option<ChangeStreamConfig>,
    batcher_config: Option<BatcherConfig>,
}

impl CaptureConfigBuilder {
    #[must_use]
    pub fn cluster_name(mut self, name: impl Into<String>) -> Self {
        self.cluster_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn exclude_database(mut self, database: impl Into<String>) -> Self {
        self.excluded_databases.push(database.into());
        self
    }

    #[must_use]
    pub fn stream_config(mut self, config: ChangeStreamConfig) -> Self {
        self.stream_config = Some(config);
        self
    }

    #[must_use]
    pub fn batcher_config(mut self, config: BatcherConfig) -> Self {
        self.batcher_config = Some(config);
        self
    }

    /// Builds the `CaptureConfig`.
    ///
    /// # Errors
    ///
    /// Returns an error if the cluster name or the batcher configuration is
    /// missing, or the stream configuration is invalid.
    pub fn build(self) -> Result<CaptureConfig, String> {
        let cluster_name = self.cluster_name.ok_or("cluster_name is required")?;
        if cluster_name.trim().is_empty() {
            return Err("cluster_name cannot be empty".to_string());
        }
        if cluster_name.contains("::") {
            return Err("cluster_name cannot contain '::'".to_string());
        }

        let batcher_config = self.batcher_config.ok_or("batcher_config is required")?;
        let stream_config = self.stream_config.unwrap_or_default();
        stream_config.validate().map_err(|e| e.to_string())?;

        Ok(CaptureConfig {
            cluster_name,
            excluded_databases: self.excluded_databases,
            stream_config,
            batcher_config,
        })
    }
}

/// Errors returned by [`CaptureService::run`].
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error("Checkpoint store error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Buffered events could not be flushed on shutdown
    #[error("Final flush failed: {0}")]
    Flush(#[from] BatcherError),
}

/// Captures every namespace of one cluster.
pub struct CaptureService<S: ?Sized, C, O> {
    config: CaptureConfig,
    source: Arc<S>,
    store: Arc<C>,
    sink: Arc<O>,
}

impl<S, C, O> CaptureService<S, C, O>
where
    S: ChangeSource + ?Sized + 'static,
    C: CheckpointStore + 'static,
    O: ObjectSink + 'static,
{
    pub fn new(config: CaptureConfig, source: Arc<S>, store: Arc<C>, sink: Arc<O>) -> Self {
        Self {
            config,
            source,
            store,
            sink,
        }
    }

    #[must_use]
    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Runs capture until `shutdown` fires or every watcher has ended.
    ///
    /// Watcher failures are reported in the returned [`WatchReport`]; only
    /// setup failures and a failed final flush are errors.
    #[instrument(skip_all, fields(cluster = %self.config.cluster_name))]
    pub async fn run(&self, shutdown: CancellationToken) -> Result<WatchReport, CaptureError> {
        let cluster = self.config.cluster_name.as_str();
        let orchestrator = ClusterOrchestrator::new(
            Arc::clone(&self.source),
            cluster,
            self.config.stream_config.max_attempts,
        )
        .exclude_databases(self.config.excluded_databases.iter().cloned())
        .with_cancellation_token(shutdown.clone());

        let namespaces = flatten(&orchestrator.discover_namespaces().await?);
        self.store.save_namespaces(cluster, &namespaces).await?;

        let checkpoints = orchestrator
            .load_checkpoints(self.store.as_ref(), &namespaces)
            .await?;
        info!(
            namespaces = namespaces.len(),
            resumed = checkpoints.len(),
            "Starting capture"
        );

        let registry = Arc::new(NamespaceRegistry::new(
            cluster,
            self.config.batcher_config.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.sink),
            checkpoints.clone(),
        ));

        let report = orchestrator
            .watch_namespaces(namespaces, &checkpoints, Arc::clone(&registry))
            .await;
        if shutdown.is_cancelled() {
            info!("Shutdown requested");
        }

        if !report.is_clean() {
            warn!(
                failed = report.failed.len(),
                aborted = report.aborted,
                "Some namespaces stopped with errors"
            );
        }

        if let Err(e) = registry.close().await {
            error!(error = %e, "Failed to flush pending batches");
            return Err(e.into());
        }

        info!(finished = report.finished.len(), "Capture stopped");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batcher() -> BatcherConfig {
        BatcherConfig::builder().bucket("feed").build().unwrap()
    }

    #[test]
    fn builder_requires_cluster_and_batcher() {
        assert!(CaptureConfig::builder().batcher_config(batcher()).build().is_err());
        assert!(CaptureConfig::builder().cluster_name("prod").build().is_err());
        assert!(CaptureConfig::builder()
            .cluster_name("a::b")
            .batcher_config(batcher())
            .build()
            .is_err());
    }

    #[test]
    fn builder_defaults() {
        let config = CaptureConfig::builder()
            .cluster_name("prod")
            .exclude_database("scratch")
            .batcher_config(batcher())
            .build()
            .unwrap();

        assert_eq!(config.cluster_name, "prod");
        assert_eq!(config.excluded_databases, vec!["scratch"]);
        assert_eq!(config.stream_config.max_attempts, 3);
    }
}
