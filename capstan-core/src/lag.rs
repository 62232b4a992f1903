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

//! Replication lag monitoring.
//!
//! The [`LagMonitor`] reads the change ledger and summarizes, per namespace,
//! how far the consumer side trails the producer side:
//!
//! - with unprocessed entries, the age of the oldest one
//! - otherwise, `processedAt - createdAt` of the most recently processed entry
//!
//! The worst namespace becomes the cluster gap. Summaries are persisted as a
//! [`ReplicationStatus`] and exported through the replication-lag gauge.

use crate::checkpoint::{ChangeLedgerEntry, CheckpointStore, TrackerState, EVENT_WRITER_COMPONENT};
use crate::control::{jitter, take_first, ControlError, LagTrigger, WorkQueue, LAG_QUEUE, MAX_RESEND_JITTER};
use crate::event::Namespace;
use crate::metrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

/// Gap of one namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceGap {
    /// `database.collection`
    pub namespace: String,
    /// Ledger entry the gap was measured on
    pub batch_id: u64,
    pub created_at: DateTime<Utc>,
    /// `None` while the entry is unprocessed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    pub gap_in_seconds: i64,
}

/// Latest lag summary of a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationStatus {
    pub cluster_name: String,
    pub current_time: DateTime<Utc>,
    /// Worst gap across namespaces
    pub gap_in_seconds: i64,
    /// Per-namespace gaps, largest first
    pub details: Vec<NamespaceGap>,
}

impl ReplicationStatus {
    /// Summarizes the ledger entries of `cluster_name` as of `now`.
    #[must_use]
    pub fn compute(cluster_name: &str, entries: &[ChangeLedgerEntry], now: DateTime<Utc>) -> Self {
        let mut by_namespace: BTreeMap<&Namespace, Vec<&ChangeLedgerEntry>> = BTreeMap::new();
        for entry in entries.iter().filter(|e| e.cluster_name == cluster_name) {
            by_namespace.entry(&entry.namespace).or_default().push(entry);
        }

        let mut details: Vec<NamespaceGap> = by_namespace
            .into_iter()
            .filter_map(|(namespace, entries)| {
                let oldest_pending = entries
                    .iter()
                    .filter(|e| !e.is_processed)
                    .min_by_key(|e| (e.created_at, e.batch_id));
                let latest_processed = entries
                    .iter()
                    .filter(|e| e.is_processed)
                    .max_by_key(|e| (e.processed_at, e.batch_id));

                oldest_pending.or(latest_processed).map(|entry| NamespaceGap {
                    namespace: namespace.full_name(),
                    batch_id: entry.batch_id,
                    created_at: entry.created_at,
                    processed_at: entry.is_processed.then_some(entry.processed_at),
                    gap_in_seconds: entry.gap_seconds(now),
                })
            })
            .collect();

        details.sort_by(|a, b| {
            b.gap_in_seconds
                .cmp(&a.gap_in_seconds)
                .then_with(|| a.namespace.cmp(&b.namespace))
        });

        Self {
            cluster_name: cluster_name.to_string(),
            current_time: now,
            gap_in_seconds: details.first().map_or(0, |d| d.gap_in_seconds),
            details,
        }
    }
}

/// Configuration for the [`LagMonitor`].
#[derive(Debug, Clone)]
pub struct LagMonitorConfig {
    /// Time between two recurring runs
    pub interval: Duration,
    /// Upper bound of the delay applied to re-enqueued triggers
    pub resend_jitter: Duration,
}

impl Default for LagMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            resend_jitter: MAX_RESEND_JITTER,
        }
    }
}

impl LagMonitorConfig {
    #[must_use]
    pub fn builder() -> LagMonitorConfigBuilder {
        LagMonitorConfigBuilder::default()
    }
}

/// Builder for [`LagMonitorConfig`].
#[derive(Debug, Default)]
pub struct LagMonitorConfigBuilder {
    interval: Option<Duration>,
    resend_jitter: Option<Duration>,
}

impl LagMonitorConfigBuilder {
    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    #[must_use]
    pub fn resend_jitter(mut self, jitter: Duration) -> Self {
        self.resend_jitter = Some(jitter);
        self
    }

    pub fn build(self) -> Result<LagMonitorConfig, String> {
        let defaults = LagMonitorConfig::default();
        let config = LagMonitorConfig {
            interval: self.interval.unwrap_or(defaults.interval),
            resend_jitter: self.resend_jitter.unwrap_or(defaults.resend_jitter),
        };
        if config.interval.is_zero() {
            return Err("interval must be greater than zero".to_string());
        }
        Ok(config)
    }
}

/// Computes and persists replication status.
pub struct LagMonitor<C: ?Sized, Q: ?Sized> {
    store: Arc<C>,
    queue: Arc<Q>,
    config: LagMonitorConfig,
}

impl<C, Q> LagMonitor<C, Q>
where
    C: CheckpointStore + ?Sized,
    Q: WorkQueue + ?Sized,
{
    pub fn new(store: Arc<C>, queue: Arc<Q>, config: LagMonitorConfig) -> Self {
        Self { store, queue, config }
    }

    /// Computes and stores one status.
    ///
    /// Returns `None` without touching the store when the event writer is not
    /// running.
    #[instrument(skip(self))]
    pub async fn run_once(&self, cluster_name: &str) -> Result<Option<ReplicationStatus>, ControlError> {
        let tracker = self.store.get_tracker(cluster_name, EVENT_WRITER_COMPONENT).await?;
        if tracker != Some(TrackerState::Start) {
            debug!(tracker = ?tracker, "Event writer not running, skipping");
            return Ok(None);
        }

        let entries = self.store.list_ledger(cluster_name).await?;
        let status = ReplicationStatus::compute(cluster_name, &entries, Utc::now());
        self.store.save_status(&status).await?;
        metrics::set_replication_lag(status.gap_in_seconds, cluster_name);

        info!(
            gap_in_seconds = status.gap_in_seconds,
            namespaces = status.details.len(),
            "Replication status updated"
        );
        Ok(Some(status))
    }

    /// Runs [`Self::run_once`] every interval until the event writer stops or
    /// `cancel` fires. Store errors are logged and the next tick retries.
    pub async fn run_recurring(&self, cluster_name: &str, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    info!(cluster = cluster_name, "Lag monitor cancelled");
                    break;
                }

                _ = ticker.tick() => {
                    match self.run_once(cluster_name).await {
                        Ok(Some(_)) => {}
                        Ok(None) => {
                            info!(cluster = cluster_name, "Event writer stopped, lag monitor exiting");
                            break;
                        }
                        Err(e) => error!(cluster = cluster_name, error = %e, "Lag computation failed"),
                    }
                }
            }
        }
    }

    /// Handles one delivery of lag triggers.
    ///
    /// The first trigger is processed once; extra triggers go back to
    /// [`LAG_QUEUE`] with a jittered delay.
    #[instrument(skip_all, fields(messages = bodies.len()))]
    pub async fn handle(&self, bodies: Vec<String>) -> Result<Option<ReplicationStatus>, ControlError> {
        let max_jitter = self.config.resend_jitter;
        let Some(first) = take_first(self.queue.as_ref(), LAG_QUEUE, bodies, || jitter(max_jitter)).await? else {
            return Ok(None);
        };

        let trigger = LagTrigger::from_json(&first)?;
        if trigger.cluster_name.trim().is_empty() {
            return Err(ControlError::Validation("clusterName is required".into()));
        }
        self.run_once(&trigger.cluster_name).await
    }
}
