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

//! Blob storage for batch payloads.
//!
//! Each non-empty batch becomes one object whose body is newline-delimited
//! JSON, one full document per line. Keys follow
//! `{cluster}/{db}/{collection}/{db}.{collection}-batch-{batchId:06}.json`.
//!
//! # Example
//!
//! ```rust
//! use capstan_core::event::Namespace;
//! use capstan_core::sink::batch_key;
//!
//! let key = batch_key("prod", &Namespace::new("shop", "orders"), 42);
//! assert_eq!(key, "prod/shop/orders/shop.orders-batch-000042.json");
//! ```

use crate::event::{ChangeEvent, Namespace};
use async_trait::async_trait;

/// Errors that can occur when writing to or reading from an object sink.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// Connection to the storage service failed.
    ///
    /// Typically retryable after a backoff period.
    #[error("Connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Failed to write an object.
    #[error("Write error for key '{key}': {message}")]
    Write {
        key: String,
        message: String,
        /// Whether this specific write error is retryable
        retryable: bool,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Object does not exist.
    #[error("Object not found: {key}")]
    NotFound { key: String },

    /// Invalid sink configuration.
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        parameter: Option<String>,
    },
}

impl SinkError {
    /// Creates a connection error from any error type.
    #[must_use]
    pub fn connection(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Connection {
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a write error with retryability information.
    #[must_use]
    pub fn write(
        key: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
        retryable: bool,
    ) -> Self {
        Self::Write {
            key: key.into(),
            message: source.to_string(),
            retryable,
            source: Some(Box::new(source)),
        }
    }

    /// Creates a write error with a custom message.
    #[must_use]
    pub fn write_msg(key: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        Self::Write {
            key: key.into(),
            message: message.into(),
            retryable,
            source: None,
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>, parameter: Option<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            parameter,
        }
    }

    /// Returns whether this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::Write { retryable, .. } => *retryable,
            Self::NotFound { .. } | Self::Configuration { .. } => false,
        }
    }
}

/// Write-once blob storage.
#[async_trait]
pub trait ObjectSink: Send + Sync {
    /// Stores `body` under `key`. Writing the same key again replaces the
    /// object, which keeps retried flushes harmless.
    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), SinkError>;

    /// Reads an object back, used when replaying batches.
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, SinkError>;
}

/// Builds the object key of a batch payload.
#[must_use]
pub fn batch_key(cluster_name: &str, namespace: &Namespace, batch_id: u64) -> String {
    format!(
        "{}/{}/{}/{}-batch-{:06}.json",
        cluster_name, namespace.database, namespace.collection, namespace, batch_id
    )
}

/// Serializes the full documents of a batch as newline-delimited JSON.
#[must_use]
pub fn encode_batch(events: &[ChangeEvent]) -> Vec<u8> {
    let mut body = String::with_capacity(events.len() * 256);
    for event in events {
        body.push_str(&event.full_document_json());
        body.push('\n');
    }
    body.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::OperationType;
    use bson::doc;

    fn event(n: i32, full: Option<bson::Document>) -> ChangeEvent {
        ChangeEvent {
            id: doc! { "_data": n.to_string() },
            operation: OperationType::Insert,
            namespace: Namespace::new("shop", "orders"),
            document_key: Some(doc! { "_id": n }),
            full_document: full,
        }
    }

    #[test]
    fn key_pads_batch_id() {
        let ns = Namespace::new("shop", "orders");
        assert_eq!(batch_key("c1", &ns, 0), "c1/shop/orders/shop.orders-batch-000000.json");
        assert_eq!(
            batch_key("c1", &ns, 1_234_567),
            "c1/shop/orders/shop.orders-batch-1234567.json"
        );
    }

    #[test]
    fn batch_body_is_one_line_per_event() {
        let body = encode_batch(&[
            event(1, Some(doc! { "_id": 1, "sku": "a" })),
            event(2, None),
        ]);
        let text = String::from_utf8(body).unwrap();
        assert_eq!(text, "{\"_id\":1,\"sku\":\"a\"}\nnull\n");
    }

    #[test]
    fn retryability() {
        assert!(SinkError::write_msg("k", "throttled", true).is_retryable());
        assert!(!SinkError::NotFound { key: "k".into() }.is_retryable());
        assert!(!SinkError::configuration("bad bucket", Some("bucket".into())).is_retryable());
    }
}
