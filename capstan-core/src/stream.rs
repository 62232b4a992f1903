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

//! Change stream sources and the per-namespace watcher.
//!
//! [`ChangeSource`] is the seam to the source cluster: it lists databases and
//! collections and opens a change stream for one namespace at a given
//! [`ResumeToken`]. [`MongoChangeSource`] implements it with the official
//! driver; tests use scripted sources.
//!
//! [`NamespaceWatcher`] reads one stream and hands every event to an
//! [`EventSink`]. When the stream fails it reopens it according to a fixed
//! policy:
//!
//! | failure                    | next attempt                                      |
//! |----------------------------|---------------------------------------------------|
//! | invalid resume token       | `At(token)` → `Earliest` → `Tail` → give up        |
//! | interrupted / cancelled    | stop cleanly                                      |
//! | anything else              | same position, at most `max_attempts` in a row     |
//!
//! Falling back to `Tail` can skip events that were never captured. It is
//! logged at `warn` level and counted under the `invalid_token` restart reason.
//!
//! # Example
//!
//! ```rust,no_run
//! use capstan_core::event::{Namespace, ResumeToken};
//! use capstan_core::stream::{ChangeStreamConfig, MongoChangeSource, NamespaceWatcher};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! # use capstan_core::stream::EventSink;
//!
//! # async fn example(sink: impl EventSink) -> Result<(), Box<dyn std::error::Error>> {
//! let source = Arc::new(
//!     MongoChangeSource::connect("mongodb://localhost:27017", ChangeStreamConfig::default()).await?,
//! );
//! let watcher = NamespaceWatcher::new(
//!     source,
//!     Namespace::new("shop", "orders"),
//!     3,
//!     CancellationToken::new(),
//! );
//! watcher.run(ResumeToken::Earliest, &sink).await?;
//! # Ok(())
//! # }
//! ```

use crate::batcher::BatcherError;
use crate::event::{ChangeEvent, ConversionError, Namespace, ResumeToken};
use crate::metrics;
use async_trait::async_trait;
use bson::{doc, spec::BinarySubtype, Binary, Document};
use futures::stream::BoxStream;
use futures::StreamExt;
use mongodb::{
    error::{Error as MongoError, ErrorKind as MongoErrorKind},
    options::{ChangeStreamOptions, FullDocumentType},
    Client,
};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Errors that can occur while opening or reading a change stream.
#[derive(Debug, Error)]
pub enum StreamError {
    /// MongoDB connection or command error
    #[error("Connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
        /// MongoDB error code
        code: Option<i32>,
        /// MongoDB error labels (e.g., "NetworkError")
        labels: Vec<String>,
    },

    /// Failed to convert MongoDB event to ChangeEvent
    #[error("Event conversion failed: {0}")]
    Conversion(#[from] ConversionError),

    /// Resume token is invalid, unknown or no longer in the oplog
    #[error("Invalid resume token: {message}")]
    InvalidResumeToken { code: Option<i32>, message: String },

    /// The server interrupted the operation (shutdown or killOp)
    #[error("Operation interrupted: {message}")]
    Interrupted { message: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<MongoError> for StreamError {
    fn from(err: MongoError) -> Self {
        Self::from_mongo_error(err)
    }
}

/// Codes the server uses for unusable resume positions.
const INVALID_TOKEN_CODES: [i32; 3] = [
    260, // InvalidResumeToken
    280, // ChangeStreamFatalError
    286, // ChangeStreamHistoryLost
];

const INTERRUPTED_CODE: i32 = 11601;

impl StreamError {
    /// Creates a StreamError from a MongoDB error with proper classification.
    ///
    /// Besides error codes this looks at the message, since some
    /// Mongo-compatible services report bad tokens without a code.
    pub fn from_mongo_error(err: MongoError) -> Self {
        let code = match err.kind.as_ref() {
            MongoErrorKind::Command(cmd_err) => Some(cmd_err.code),
            _ => None,
        };
        let message = err.to_string();

        if code.is_some_and(|c| INVALID_TOKEN_CODES.contains(&c)) || mentions_bad_token(&message) {
            return Self::InvalidResumeToken { code, message };
        }

        if code == Some(INTERRUPTED_CODE) || message.contains("operation was interrupted") {
            return Self::Interrupted { message };
        }

        let labels: Vec<String> = err.labels().iter().cloned().collect();

        Self::Connection {
            message,
            source: Some(Box::new(err)),
            code,
            labels,
        }
    }

    #[must_use]
    pub fn is_invalid_resume_token(&self) -> bool {
        matches!(self, Self::InvalidResumeToken { .. })
    }

    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }

    /// Returns the error category for metrics/logging.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::Conversion(_) => "conversion",
            Self::InvalidResumeToken { .. } => "invalid_token",
            Self::Interrupted { .. } => "interrupted",
            Self::Configuration(_) => "configuration",
        }
    }
}

fn mentions_bad_token(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("change feed token format is invalid")
        || lower.contains("bad resume token")
        || (lower.contains("resume token") && (lower.contains("invalid") || lower.contains("not found")))
}

/// Stream of converted change events.
pub type EventStream = BoxStream<'static, Result<ChangeEvent, StreamError>>;

/// Source cluster as seen by the capture pipeline.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Lists every database name, system databases included.
    async fn list_databases(&self) -> Result<Vec<String>, StreamError>;

    /// Lists the collections of one database.
    async fn list_collections(&self, database: &str) -> Result<Vec<String>, StreamError>;

    /// Opens the change stream of `namespace` positioned at `position`.
    async fn open(&self, namespace: &Namespace, position: &ResumeToken) -> Result<EventStream, StreamError>;
}

/// Receives the events read by a watcher.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Accepts one event. May wait while the target flushes but never drops
    /// the event silently: either it is buffered or an error is returned.
    async fn deliver(&self, event: ChangeEvent) -> Result<(), BatcherError>;
}

/// Configuration for change stream behavior.
///
/// ```rust
/// use capstan_core::stream::ChangeStreamConfig;
///
/// let config = ChangeStreamConfig::builder()
///     .batch_size(500)
///     .max_attempts(5)
///     .build()
///     .unwrap();
/// assert!(config.full_document_update_lookup);
/// ```
#[derive(Debug, Clone)]
pub struct ChangeStreamConfig {
    /// Aggregation pipeline applied to the stream
    pub pipeline: Vec<Document>,

    /// Fetch the current document for update events
    pub full_document_update_lookup: bool,

    /// Batch size for fetching events
    pub batch_size: Option<u32>,

    /// Token sent to the server when resuming from `Earliest`
    pub earliest_token: Document,

    /// Consecutive failed attempts before a watcher gives up
    pub max_attempts: u32,
}

impl Default for ChangeStreamConfig {
    fn default() -> Self {
        Self {
            pipeline: capture_pipeline(),
            full_document_update_lookup: true,
            batch_size: None,
            earliest_token: big_bang_token(),
            max_attempts: 3,
        }
    }
}

/// Filters to data modifications and projects the captured fields.
///
/// `operationType` stays in the projection because the driver needs it to
/// decode events.
#[must_use]
pub fn capture_pipeline() -> Vec<Document> {
    vec![
        doc! { "$match": { "operationType": { "$in": ["insert", "update", "replace"] } } },
        doc! { "$project": {
            "_id": 1,
            "operationType": 1,
            "fullDocument": 1,
            "ns": 1,
            "documentKey": 1,
        } },
    ]
}

/// Start-of-feed token understood by Cosmos DB's Mongo API.
#[must_use]
pub fn big_bang_token() -> Document {
    doc! {
        "_data": Binary {
            subtype: BinarySubtype::Generic,
            bytes: br#"[{"token":"\"0\"","range":{"min":"","max":"FF"}}]"#.to_vec(),
        }
    }
}

impl ChangeStreamConfig {
    /// Creates a new builder for configuring a change stream.
    #[must_use]
    pub fn builder() -> ChangeStreamConfigBuilder {
        ChangeStreamConfigBuilder::default()
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.max_attempts == 0 {
            return Err(StreamError::Configuration(
                "max_attempts must be greater than 0".to_string(),
            ));
        }
        if self.batch_size == Some(0) {
            return Err(StreamError::Configuration(
                "batch_size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Converts this config to MongoDB's `ChangeStreamOptions` for a stream
    /// opened at `position`.
    pub fn to_mongo_options(&self, position: &ResumeToken) -> Result<ChangeStreamOptions, StreamError> {
        let mut options = ChangeStreamOptions::default();

        if self.full_document_update_lookup {
            options.full_document = Some(FullDocumentType::UpdateLookup);
        }
        options.batch_size = self.batch_size;
        options.resume_after = position.to_driver(&self.earliest_token)?;

        Ok(options)
    }
}

/// Builder for [`ChangeStreamConfig`].
#[derive(Debug, Default)]
pub struct ChangeStreamConfigBuilder {
    pipeline: Option<Vec<Document>>,
    full_document_update_lookup: Option<bool>,
    batch_size: Option<u32>,
    earliest_token: Option<Document>,
    max_attempts: Option<u32>,
}

impl ChangeStreamConfigBuilder {
    /// Replaces the capture pipeline.
    #[must_use]
    pub fn pipeline(mut self, pipeline: Vec<Document>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    /// Default: enabled.
    #[must_use]
    pub fn full_document_update_lookup(mut self, enabled: bool) -> Self {
        self.full_document_update_lookup = Some(enabled);
        self
    }

    #[must_use]
    pub fn batch_size(mut self, size: u32) -> Self {
        self.batch_size = Some(size);
        self
    }

    /// Token used for `Earliest`. Default: [`big_bang_token`].
    #[must_use]
    pub fn earliest_token(mut self, token: Document) -> Self {
        self.earliest_token = Some(token);
        self
    }

    /// Default: 3.
    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns `StreamError::Configuration` if validation fails.
    pub fn build(self) -> Result<ChangeStreamConfig, StreamError> {
        let defaults = ChangeStreamConfig::default();
        let config = ChangeStreamConfig {
            pipeline: self.pipeline.unwrap_or(defaults.pipeline),
            full_document_update_lookup: self
                .full_document_update_lookup
                .unwrap_or(defaults.full_document_update_lookup),
            batch_size: self.batch_size,
            earliest_token: self.earliest_token.unwrap_or(defaults.earliest_token),
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts),
        };

        config.validate()?;
        Ok(config)
    }
}

/// [`ChangeSource`] backed by the MongoDB driver.
#[derive(Debug, Clone)]
pub struct MongoChangeSource {
    client: Client,
    config: ChangeStreamConfig,
}

impl MongoChangeSource {
    pub fn new(client: Client, config: ChangeStreamConfig) -> Self {
        Self { client, config }
    }

    /// Connects to `uri`.
    pub async fn connect(uri: &str, config: ChangeStreamConfig) -> Result<Self, StreamError> {
        config.validate()?;
        let client = Client::with_uri_str(uri).await?;
        Ok(Self::new(client, config))
    }
}

#[async_trait]
impl ChangeSource for MongoChangeSource {
    async fn list_databases(&self) -> Result<Vec<String>, StreamError> {
        Ok(self.client.list_database_names().await?)
    }

    async fn list_collections(&self, database: &str) -> Result<Vec<String>, StreamError> {
        Ok(self.client.database(database).list_collection_names().await?)
    }

    async fn open(&self, namespace: &Namespace, position: &ResumeToken) -> Result<EventStream, StreamError> {
        let collection = self
            .client
            .database(&namespace.database)
            .collection::<Document>(&namespace.collection);
        let options = self.config.to_mongo_options(position)?;

        debug!(namespace = %namespace, position = %position, "Opening change stream");

        let stream = collection
            .watch()
            .pipeline(self.config.pipeline.clone())
            .with_options(options)
            .await?;

        Ok(stream
            .map(|item| match item {
                Ok(event) => ChangeEvent::try_from(event).map_err(StreamError::from),
                Err(e) => Err(StreamError::from_mongo_error(e)),
            })
            .boxed())
    }
}

/// How a watcher ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchExit {
    /// Stop was requested or the server interrupted the read
    Cancelled,
    /// The source closed the stream
    Exhausted,
}

/// Terminal watcher failures.
#[derive(Debug, Error)]
pub enum WatchError {
    /// Every resume position, down to the tail, was rejected
    #[error("No usable resume position for {namespace}: {source}")]
    PositionsExhausted {
        namespace: String,
        #[source]
        source: StreamError,
    },

    /// Too many consecutive failures at the same position
    #[error("Gave up on {namespace} after {attempts} attempts: {source}")]
    RetriesExhausted {
        namespace: String,
        attempts: u32,
        #[source]
        source: StreamError,
    },

    /// The batcher refused an event
    #[error("Delivery failed for {namespace}: {source}")]
    Delivery {
        namespace: String,
        #[source]
        source: BatcherError,
    },
}

enum ReadFailure {
    Stream(StreamError),
    Delivery(BatcherError),
}

/// Long-lived read loop of one namespace.
pub struct NamespaceWatcher<S: ?Sized> {
    source: Arc<S>,
    namespace: Namespace,
    max_attempts: u32,
    cancel: CancellationToken,
}

impl<S: ChangeSource + ?Sized> NamespaceWatcher<S> {
    pub fn new(source: Arc<S>, namespace: Namespace, max_attempts: u32, cancel: CancellationToken) -> Self {
        Self {
            source,
            namespace,
            max_attempts: max_attempts.max(1),
            cancel,
        }
    }

    #[must_use]
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Reads the stream from `start` until cancelled, exhausted or failed.
    ///
    /// Transient failures reopen the stream at the position after the last
    /// delivered event; the attempt counter resets whenever an attempt
    /// delivered at least one event.
    #[instrument(skip(self, start, sink), fields(namespace = %self.namespace))]
    pub async fn run<K: EventSink + ?Sized>(&self, start: ResumeToken, sink: &K) -> Result<WatchExit, WatchError> {
        let mut position = start;
        let mut failures = 0u32;

        info!(position = %position, "Watcher started");

        loop {
            if self.cancel.is_cancelled() {
                info!("Watcher cancelled");
                return Ok(WatchExit::Cancelled);
            }

            let mut delivered = 0u64;
            let error = match self.read(&mut position, &mut delivered, sink).await {
                Ok(exit) => {
                    info!(?exit, "Watcher finished");
                    return Ok(exit);
                }
                Err(ReadFailure::Delivery(source)) => {
                    return Err(WatchError::Delivery {
                        namespace: self.namespace.to_string(),
                        source,
                    });
                }
                Err(ReadFailure::Stream(e)) => e,
            };

            if error.is_interrupted() {
                info!(error = %error, "Change stream interrupted, stopping");
                return Ok(WatchExit::Cancelled);
            }

            if error.is_invalid_resume_token() {
                position = match position {
                    ResumeToken::At(_) => ResumeToken::Earliest,
                    ResumeToken::Earliest => ResumeToken::Tail,
                    ResumeToken::Tail => {
                        return Err(WatchError::PositionsExhausted {
                            namespace: self.namespace.to_string(),
                            source: error,
                        });
                    }
                };
                if position == ResumeToken::Tail {
                    warn!(error = %error, "Earliest position rejected, resuming from tail; events may be skipped");
                } else {
                    warn!(error = %error, "Resume token rejected, retrying from earliest position");
                }
                metrics::increment_watcher_restarts(&self.namespace.to_string(), "invalid_token");
                continue;
            }

            if delivered > 0 {
                failures = 0;
            }
            failures += 1;
            if failures >= self.max_attempts {
                return Err(WatchError::RetriesExhausted {
                    namespace: self.namespace.to_string(),
                    attempts: failures,
                    source: error,
                });
            }

            warn!(
                attempt = failures,
                max_attempts = self.max_attempts,
                category = error.category(),
                error = %error,
                "Change stream failed, reopening"
            );
            metrics::increment_watcher_restarts(&self.namespace.to_string(), "transient");
        }
    }

    async fn read<K: EventSink + ?Sized>(
        &self,
        position: &mut ResumeToken,
        delivered: &mut u64,
        sink: &K,
    ) -> Result<WatchExit, ReadFailure> {
        let mut stream = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Ok(WatchExit::Cancelled),
            opened = self.source.open(&self.namespace, position) => opened.map_err(ReadFailure::Stream)?,
        };

        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Ok(WatchExit::Cancelled),
                next = stream.next() => next,
            };

            match next {
                None => return Ok(WatchExit::Exhausted),
                Some(Err(e)) => return Err(ReadFailure::Stream(e)),
                Some(Ok(event)) => {
                    let next_position = event.position();
                    sink.deliver(event).await.map_err(ReadFailure::Delivery)?;
                    *position = next_position;
                    *delivered += 1;
                }
            }
        }
    }
}
