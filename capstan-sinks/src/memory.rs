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

//! In-memory object sink for tests and local runs.

use async_trait::async_trait;
use capstan_core::sink::{ObjectSink, SinkError};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::trace;

/// Objects keyed by `(bucket, key)`.
type Objects = BTreeMap<(String, String), Vec<u8>>;

/// [`ObjectSink`] keeping every object in process memory.
///
/// Clones share the same objects, so a test can hand one clone to the
/// capture side and inspect the other.
///
/// # Example
///
/// ```rust
/// use capstan_core::sink::ObjectSink;
/// use capstan_sinks::MemoryObjectSink;
///
/// # #[tokio::main]
/// # async fn main() {
/// let sink = MemoryObjectSink::new();
/// sink.put("feed", "a.json", b"{}\n".to_vec()).await.unwrap();
/// assert_eq!(sink.get("feed", "a.json").await.unwrap(), b"{}\n");
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryObjectSink {
    objects: Arc<RwLock<Objects>>,
}

impl MemoryObjectSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects across all buckets.
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    /// Keys stored in `bucket`, in lexical order.
    pub async fn keys(&self, bucket: &str) -> Vec<String> {
        self.objects
            .read()
            .await
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, key)| key.clone())
            .collect()
    }
}

#[async_trait]
impl ObjectSink for MemoryObjectSink {
    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), SinkError> {
        if bucket.is_empty() {
            return Err(SinkError::configuration(
                "bucket cannot be empty",
                Some("bucket".to_string()),
            ));
        }
        trace!(bucket, key, size = body.len(), "Storing object");
        self.objects
            .write()
            .await
            .insert((bucket.to_string(), key.to_string()), body);
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, SinkError> {
        self.objects
            .read()
            .await
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| SinkError::NotFound { key: key.to_string() })
    }
}
