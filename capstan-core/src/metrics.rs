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

//! Metrics instrumentation for capture observability.
//!
//! Uses the `metrics` facade; the embedding binary chooses an exporter. Without
//! one installed every call is a no-op.
//!
//! # Labels
//!
//! - **namespace**: `database.collection` being captured
//! - **operation**: `insert`, `update` or `replace`
//! - **kind**: `payload` or `heartbeat` for flushed batches
//! - **reason**: restart cause of a watcher (`invalid_token`, `transient`)
//! - **cluster**: cluster name for lag gauges
//!
//! # Examples
//!
//! ```rust
//! use capstan_core::metrics;
//!
//! metrics::increment_events_captured("shop.orders", "insert");
//! metrics::increment_batches_flushed("shop.orders", metrics::BatchKind::Heartbeat);
//! metrics::set_active_watchers(3);
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric name prefix for all capstan metrics.
#[doc(hidden)]
pub const METRIC_PREFIX: &str = "capstan";

/// Events handed to a batcher.
///
/// Type: Counter
/// Labels: namespace, operation
#[doc(hidden)]
pub const EVENTS_CAPTURED_TOTAL: &str = "capstan_events_captured_total";

/// Flushes committed to the checkpoint store.
///
/// Type: Counter
/// Labels: namespace, kind
#[doc(hidden)]
pub const BATCHES_FLUSHED_TOTAL: &str = "capstan_batches_flushed_total";

/// Flushes that exhausted their retries.
///
/// Type: Counter
/// Labels: namespace
const FLUSH_FAILURES_TOTAL: &str = "capstan_flush_failures_total";

/// Time from draining a buffer to committing its checkpoint.
///
/// Type: Histogram
/// Labels: namespace
/// Unit: seconds
#[doc(hidden)]
pub const FLUSH_DURATION_SECONDS: &str = "capstan_flush_duration_seconds";

/// Documents per flushed batch.
///
/// Type: Histogram
/// Labels: namespace
const BATCH_DOCUMENTS: &str = "capstan_batch_documents";

/// Stream reopen attempts.
///
/// Type: Counter
/// Labels: namespace, reason
#[doc(hidden)]
pub const WATCHER_RESTARTS_TOTAL: &str = "capstan_watcher_restarts_total";

/// Watchers currently running.
///
/// Type: Gauge
const ACTIVE_WATCHERS: &str = "capstan_active_watchers";

/// Worst-case replication gap reported by the lag monitor.
///
/// Type: Gauge
/// Labels: cluster
/// Unit: seconds
#[doc(hidden)]
pub const REPLICATION_LAG_SECONDS: &str = "capstan_replication_lag_seconds";

/// Describes all metrics. Call once after installing an exporter.
pub fn init_metrics() {
    describe_counter!(
        EVENTS_CAPTURED_TOTAL,
        "Total number of change events handed to a batcher"
    );
    describe_counter!(
        BATCHES_FLUSHED_TOTAL,
        "Total number of batches committed to the checkpoint store"
    );
    describe_counter!(
        FLUSH_FAILURES_TOTAL,
        "Total number of flushes that failed after all retries"
    );
    describe_counter!(
        WATCHER_RESTARTS_TOTAL,
        "Total number of change stream reopen attempts"
    );

    describe_histogram!(
        FLUSH_DURATION_SECONDS,
        metrics::Unit::Seconds,
        "Time taken to upload a batch and commit its checkpoint"
    );
    describe_histogram!(
        BATCH_DOCUMENTS,
        metrics::Unit::Count,
        "Number of documents per flushed batch"
    );

    describe_gauge!(ACTIVE_WATCHERS, "Number of running namespace watchers");
    describe_gauge!(
        REPLICATION_LAG_SECONDS,
        metrics::Unit::Seconds,
        "Worst-case gap between recording and processing a batch"
    );
}

/// Kind of a flushed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchKind {
    /// Batch with an uploaded payload
    Payload,
    /// Empty tick that only advanced the ledger
    Heartbeat,
}

impl BatchKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Payload => "payload",
            Self::Heartbeat => "heartbeat",
        }
    }
}

pub fn increment_events_captured(namespace: &str, operation: &str) {
    counter!(EVENTS_CAPTURED_TOTAL, "namespace" => namespace.to_string(), "operation" => operation.to_string())
        .increment(1);
}

pub fn increment_batches_flushed(namespace: &str, kind: BatchKind) {
    counter!(BATCHES_FLUSHED_TOTAL, "namespace" => namespace.to_string(), "kind" => kind.as_str())
        .increment(1);
}

pub fn increment_flush_failures(namespace: &str) {
    counter!(FLUSH_FAILURES_TOTAL, "namespace" => namespace.to_string()).increment(1);
}

/// Records the duration of a flush.
pub fn record_flush_duration(duration: Duration, namespace: &str) {
    histogram!(FLUSH_DURATION_SECONDS, "namespace" => namespace.to_string())
        .record(duration.as_secs_f64());
}

pub fn record_batch_documents(count: usize, namespace: &str) {
    #[allow(clippy::cast_precision_loss)]
    histogram!(BATCH_DOCUMENTS, "namespace" => namespace.to_string()).record(count as f64);
}

/// Counts a stream reopen. `reason` should be a fixed category string.
pub fn increment_watcher_restarts(namespace: &str, reason: &'static str) {
    counter!(WATCHER_RESTARTS_TOTAL, "namespace" => namespace.to_string(), "reason" => reason)
        .increment(1);
}

pub fn set_active_watchers(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!(ACTIVE_WATCHERS).set(count as f64);
}

pub fn set_replication_lag(seconds: i64, cluster: &str) {
    #[allow(clippy::cast_precision_loss)]
    gauge!(REPLICATION_LAG_SECONDS, "cluster" => cluster.to_string()).set(seconds as f64);
}

/// Helper for timing operations and automatically recording the duration.
///
/// ```rust
/// use capstan_core::metrics::{self, Timer};
///
/// {
///     let _timer = Timer::new("shop.orders", |duration, ns| {
///         metrics::record_flush_duration(duration, ns);
///     });
///     // ... flush ...
/// }
/// ```
pub struct Timer<F>
where
    F: FnOnce(Duration, &str),
{
    start: std::time::Instant,
    label: String,
    record_fn: Option<F>,
}

impl<F> Timer<F>
where
    F: FnOnce(Duration, &str),
{
    /// Creates a new timer that will record the duration when dropped.
    pub fn new(label: impl Into<String>, record_fn: F) -> Self {
        Self {
            start: std::time::Instant::now(),
            label: label.into(),
            record_fn: Some(record_fn),
        }
    }
}

impl<F> Drop for Timer<F>
where
    F: FnOnce(Duration, &str),
{
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        if let Some(record_fn) = self.record_fn.take() {
            record_fn(duration, &self.label);
        }
    }
}
