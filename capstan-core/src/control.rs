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

//! Control plane.
//!
//! Operators start and stop capture by posting a [`ControlRequest`] to the
//! [`CONTROL_QUEUE`]. The [`Dispatcher`] flips the cluster's tracker flag and,
//! on start, fans out one [`WatchTrigger`] per stored namespace plus a single
//! [`LagTrigger`].
//!
//! Handlers take the raw message bodies of one delivery. Only the first one is
//! processed; any extra bodies go back to their queue unchanged.
//!
//! # Message shapes
//!
//! ```json
//! {"clusterName": "prod", "component": "event_writer", "operation": "start"}
//! {"clusterName": "prod", "namespace": "shop.orders"}
//! {"clusterName": "prod"}
//! ```

use crate::checkpoint::{CheckpointError, CheckpointStore, TrackerState, EVENT_WRITER_COMPONENT};
use crate::event::Namespace;
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Queue of start/stop requests.
pub const CONTROL_QUEUE: &str = "app-request-queue";

/// Queue of per-namespace watch triggers.
pub const WATCH_QUEUE: &str = "read-batch-request-queue";

/// Queue of lag-watch triggers.
pub const LAG_QUEUE: &str = "gap-watch-request-queue";

/// Upper bound of the jitter applied to re-enqueued triggers.
pub const MAX_RESEND_JITTER: Duration = Duration::from_secs(5);

/// Errors raised by a [`WorkQueue`] backend.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue connection error: {0}")]
    Connection(String),

    #[error("Queue serialization error: {0}")]
    Serialization(String),

    #[error("Queue error: {0}")]
    Other(String),
}

/// Named message queues with delayed delivery.
///
/// Bodies are opaque strings; handlers in this module exchange JSON.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Enqueues `body` on `queue`, visible after `delay`.
    async fn send(&self, queue: &str, body: String, delay: Duration) -> Result<(), QueueError>;

    /// Removes and returns up to `max` visible messages of `queue`.
    async fn receive(&self, queue: &str, max: usize) -> Result<Vec<String>, QueueError>;
}

/// Errors returned by control-plane handlers.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// Malformed or contradictory message. Never retried.
    #[error("Invalid control message: {0}")]
    Validation(String),

    #[error("Checkpoint store error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ControlError {
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

/// Start/stop request as it arrives on the wire.
///
/// Every field is optional so that missing fields surface as
/// [`ControlError::Validation`] rather than a decode error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
}

/// A validated [`ControlRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlCommand {
    pub cluster_name: String,
    pub state: TrackerState,
}

impl ControlRequest {
    /// Builds an `event_writer` request.
    #[must_use]
    pub fn event_writer(cluster_name: impl Into<String>, state: TrackerState) -> Self {
        Self {
            cluster_name: Some(cluster_name.into()),
            component: Some(EVENT_WRITER_COMPONENT.to_string()),
            operation: Some(state.as_str().to_string()),
        }
    }

    /// Parses a message body.
    pub fn from_json(body: &str) -> Result<Self, ControlError> {
        serde_json::from_str(body)
            .map_err(|e| ControlError::Validation(format!("malformed request: {e}")))
    }

    pub fn validate(&self) -> Result<ControlCommand, ControlError> {
        let cluster_name = match self.cluster_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => return Err(ControlError::Validation("clusterName is required".into())),
        };

        match self.component.as_deref() {
            Some(EVENT_WRITER_COMPONENT) => {}
            Some(other) => {
                return Err(ControlError::Validation(format!(
                    "unsupported component '{other}'"
                )))
            }
            None => return Err(ControlError::Validation("component is required".into())),
        }

        let state = match self.operation.as_deref() {
            Some(op) => TrackerState::parse(op).ok_or_else(|| {
                ControlError::Validation(format!("operation must be start or stop, got '{op}'"))
            })?,
            None => return Err(ControlError::Validation("operation is required".into())),
        };

        Ok(ControlCommand { cluster_name, state })
    }
}

/// Asks a consumer to replay the next batch of one namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchTrigger {
    pub cluster_name: String,
    /// `database.collection`
    pub namespace: String,
}

impl WatchTrigger {
    #[must_use]
    pub fn new(cluster_name: impl Into<String>, namespace: &Namespace) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            namespace: namespace.full_name(),
        }
    }

    pub fn from_json(body: &str) -> Result<Self, ControlError> {
        serde_json::from_str(body)
            .map_err(|e| ControlError::Validation(format!("malformed watch trigger: {e}")))
    }

    /// Parsed namespace of the trigger.
    pub fn namespace(&self) -> Result<Namespace, ControlError> {
        Namespace::parse(&self.namespace).ok_or_else(|| {
            ControlError::Validation(format!("invalid namespace '{}'", self.namespace))
        })
    }
}

/// Asks the lag monitor to compute a status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LagTrigger {
    pub cluster_name: String,
}

impl LagTrigger {
    pub fn from_json(body: &str) -> Result<Self, ControlError> {
        serde_json::from_str(body)
            .map_err(|e| ControlError::Validation(format!("malformed lag trigger: {e}")))
    }
}

/// Result status of a dispatched request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchStatus {
    Started,
    Stopped,
}

/// What the [`Dispatcher`] did with a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchResponse {
    pub cluster_name: String,
    pub component: String,
    pub status: DispatchStatus,
}

/// Serializes a message body.
pub fn to_body<T: Serialize>(message: &T) -> Result<String, ControlError> {
    serde_json::to_string(message).map_err(|e| ControlError::Serialization(e.to_string()))
}

/// Uniform delay in `[0, max]`.
#[must_use]
pub fn jitter(max: Duration) -> Duration {
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

/// Splits off the first body and puts the rest back on `queue`.
pub(crate) async fn take_first<Q>(
    queue: &Q,
    queue_name: &str,
    bodies: Vec<String>,
    delay: impl Fn() -> Duration,
) -> Result<Option<String>, QueueError>
where
    Q: WorkQueue + ?Sized,
{
    let mut bodies = bodies.into_iter();
    let first = bodies.next();

    for extra in bodies {
        warn!(queue = queue_name, "More than one message delivered, re-enqueueing");
        queue.send(queue_name, extra, delay()).await?;
    }
    Ok(first)
}

/// Handles start/stop requests.
pub struct Dispatcher<C: ?Sized, Q: ?Sized> {
    store: Arc<C>,
    queue: Arc<Q>,
}

impl<C, Q> Dispatcher<C, Q>
where
    C: CheckpointStore + ?Sized,
    Q: WorkQueue + ?Sized,
{
    pub fn new(store: Arc<C>, queue: Arc<Q>) -> Self {
        Self { store, queue }
    }

    /// Processes the first body of a delivery.
    ///
    /// Returns `None` for an empty delivery. Extra bodies are re-enqueued on
    /// [`CONTROL_QUEUE`] before the first one is looked at.
    #[instrument(skip_all, fields(messages = bodies.len()))]
    pub async fn handle(&self, bodies: Vec<String>) -> Result<Option<DispatchResponse>, ControlError> {
        let Some(first) = take_first(self.queue.as_ref(), CONTROL_QUEUE, bodies, || Duration::ZERO).await? else {
            return Ok(None);
        };

        let command = ControlRequest::from_json(&first)?.validate()?;
        self.dispatch(&command).await.map(Some)
    }

    /// Applies a validated command.
    #[instrument(skip(self), fields(cluster = %command.cluster_name, state = %command.state))]
    pub async fn dispatch(&self, command: &ControlCommand) -> Result<DispatchResponse, ControlError> {
        let cluster = &command.cluster_name;
        self.store
            .set_tracker(cluster, EVENT_WRITER_COMPONENT, command.state)
            .await?;

        let status = match command.state {
            TrackerState::Start => {
                let namespaces = self.store.list_namespaces(cluster).await?;
                for namespace in &namespaces {
                    let body = to_body(&WatchTrigger::new(cluster.clone(), namespace))?;
                    self.queue.send(WATCH_QUEUE, body, Duration::ZERO).await?;
                }

                let body = to_body(&LagTrigger {
                    cluster_name: cluster.clone(),
                })?;
                self.queue.send(LAG_QUEUE, body, Duration::ZERO).await?;

                info!(namespaces = namespaces.len(), "Event writer started");
                DispatchStatus::Started
            }
            TrackerState::Stop => {
                info!("Event writer stopped");
                DispatchStatus::Stopped
            }
        };

        Ok(DispatchResponse {
            cluster_name: cluster.clone(),
            component: EVENT_WRITER_COMPONENT.to_string(),
            status,
        })
    }
}
