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

//! Change events, namespaces and resume positions.
//!
//! A [`ChangeEvent`] is what a watcher hands to the batching layer. Only data
//! modifications (insert, update, replace) are captured; everything else is
//! filtered out by the change stream pipeline before it reaches this type.
//!
//! [`ResumeToken`] is the single representation of a stream position used
//! throughout the crate. Persisted tokens go through [`ResumeToken::encode`]
//! and [`ResumeToken::decode`]; the MongoDB driver only ever sees the result of
//! [`ResumeToken::to_driver`].
//!
//! # Examples
//!
//! ```rust
//! use capstan_core::event::{Namespace, ResumeToken};
//! use bson::doc;
//!
//! let ns = Namespace::new("shop", "orders");
//! assert_eq!(ns.full_name(), "shop.orders");
//!
//! let token = ResumeToken::At(doc! { "_data": "8263A1" });
//! let encoded = token.encode();
//! assert_eq!(ResumeToken::decode(&encoded).unwrap(), token);
//! assert_eq!(ResumeToken::decode("earliest").unwrap(), ResumeToken::Earliest);
//! ```

use bson::{Bson, Document};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Error that can occur when converting from MongoDB driver's ChangeStreamEvent.
#[derive(Debug, Clone)]
pub enum ConversionError {
    /// Failed to convert resume token to BSON document
    ResumeTokenConversion(String),

    /// Event carried no namespace
    MissingNamespace,
}

impl fmt::Display for ConversionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversionError::ResumeTokenConversion(msg) => {
                write!(f, "Failed to convert resume token: {}", msg)
            }
            ConversionError::MissingNamespace => write!(f, "Change event has no namespace"),
        }
    }
}

impl std::error::Error for ConversionError {}

/// Error returned when a persisted resume token cannot be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenDecodeError(String);

impl fmt::Display for TokenDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid encoded resume token: {}", self.0)
    }
}

impl std::error::Error for TokenDecodeError {}

/// Operation types captured from the change stream.
///
/// The stream pipeline filters to data modifications, so anything else can only
/// appear if the source ignores the filter. It is kept as `Unknown` rather than
/// dropped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    /// A document was inserted into a collection
    Insert,

    /// A document was updated (modified in place)
    Update,

    /// A document was replaced entirely
    Replace,

    /// Any other operation type, with the original name
    #[serde(untagged)]
    Unknown(String),
}

impl OperationType {
    /// Name used for metric labels and logs.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            OperationType::Insert => "insert",
            OperationType::Update => "update",
            OperationType::Replace => "replace",
            OperationType::Unknown(name) => name,
        }
    }
}

/// Database + collection pair being captured.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Namespace {
    /// Database name
    #[serde(rename = "db")]
    pub database: String,

    /// Collection name
    #[serde(rename = "coll")]
    pub collection: String,
}

impl Namespace {
    /// Creates a new namespace from database and collection names.
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }

    /// Parses `database.collection`. Collection names may themselves contain
    /// dots, so only the first one separates the two parts.
    pub fn parse(full_name: &str) -> Option<Self> {
        let (database, collection) = full_name.split_once('.')?;
        if database.is_empty() || collection.is_empty() {
            return None;
        }
        Some(Self::new(database, collection))
    }

    /// Returns the fully qualified namespace as "database.collection".
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.database, self.collection)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

/// Position in one namespace's change stream.
///
/// `Tail` and `Earliest` are sentinels: the first opens the stream at the
/// current end of the log, the second at the oldest retained position.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ResumeToken {
    /// Resume from the current tail (no resume option sent)
    #[default]
    Tail,

    /// Resume from the oldest retained position
    Earliest,

    /// Resume after a concrete token returned by the source
    At(Document),
}

const TAIL_ENCODING: &str = "none";
const EARLIEST_ENCODING: &str = "earliest";

impl ResumeToken {
    /// Encodes the token for persistence.
    ///
    /// Sentinels encode as `"none"` and `"earliest"`; concrete tokens as
    /// relaxed extended JSON.
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            ResumeToken::Tail => TAIL_ENCODING.to_string(),
            ResumeToken::Earliest => EARLIEST_ENCODING.to_string(),
            ResumeToken::At(doc) => Bson::Document(doc.clone()).into_relaxed_extjson().to_string(),
        }
    }

    /// Decodes a value produced by [`ResumeToken::encode`].
    pub fn decode(encoded: &str) -> Result<Self, TokenDecodeError> {
        match encoded {
            TAIL_ENCODING | "" => Ok(ResumeToken::Tail),
            EARLIEST_ENCODING => Ok(ResumeToken::Earliest),
            other => {
                let value: serde_json::Value =
                    serde_json::from_str(other).map_err(|e| TokenDecodeError(e.to_string()))?;
                match Bson::try_from(value).map_err(|e| TokenDecodeError(e.to_string()))? {
                    Bson::Document(doc) => Ok(ResumeToken::At(doc)),
                    other => Err(TokenDecodeError(format!(
                        "expected a document, found {:?}",
                        other.element_type()
                    ))),
                }
            }
        }
    }

    /// Converts the position into the driver's resume option.
    ///
    /// `Earliest` is expressed through `earliest_sentinel`, which is
    /// source-specific. `Tail` yields `None`.
    pub fn to_driver(
        &self,
        earliest_sentinel: &Document,
    ) -> Result<Option<mongodb::change_stream::event::ResumeToken>, ConversionError> {
        let doc = match self {
            ResumeToken::Tail => return Ok(None),
            ResumeToken::Earliest => earliest_sentinel,
            ResumeToken::At(doc) => doc,
        };

        // The driver token is opaque, so go through its BSON representation.
        let bytes =
            bson::to_vec(doc).map_err(|e| ConversionError::ResumeTokenConversion(e.to_string()))?;
        let token = bson::from_slice(&bytes)
            .map_err(|e| ConversionError::ResumeTokenConversion(e.to_string()))?;
        Ok(Some(token))
    }
}

impl fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl Serialize for ResumeToken {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for ResumeToken {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        ResumeToken::decode(&encoded).map_err(serde::de::Error::custom)
    }
}

/// A captured change event.
///
/// Carries only the projected fields: the position token, the operation, the
/// namespace, the document key and the post-image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Position token of this event
    #[serde(rename = "_id")]
    pub id: Document,

    /// Type of operation that occurred
    #[serde(rename = "operationType")]
    pub operation: OperationType,

    /// Namespace where the operation occurred
    #[serde(rename = "ns")]
    pub namespace: Namespace,

    /// Document key (_id and shard key if sharded)
    #[serde(rename = "documentKey", default, skip_serializing_if = "Option::is_none")]
    pub document_key: Option<Document>,

    /// Full document after the operation (update lookups may find none)
    #[serde(rename = "fullDocument", default, skip_serializing_if = "Option::is_none")]
    pub full_document: Option<Document>,
}

impl ChangeEvent {
    /// Stream position directly after this event.
    #[must_use]
    pub fn position(&self) -> ResumeToken {
        ResumeToken::At(self.id.clone())
    }

    /// Renders the event as a BSON document, used for validation snapshots.
    pub fn to_document(&self) -> Result<Document, bson::ser::Error> {
        bson::to_document(self)
    }

    /// Full document as one line of relaxed extended JSON; `null` when the
    /// post-image is missing.
    #[must_use]
    pub fn full_document_json(&self) -> String {
        match &self.full_document {
            Some(doc) => Bson::Document(doc.clone()).into_relaxed_extjson().to_string(),
            None => "null".to_string(),
        }
    }
}

/// Conversion from MongoDB driver's ChangeStreamEvent.
impl TryFrom<mongodb::change_stream::event::ChangeStreamEvent<Document>> for ChangeEvent {
    type Error = ConversionError;

    fn try_from(
        event: mongodb::change_stream::event::ChangeStreamEvent<Document>,
    ) -> Result<Self, Self::Error> {
        use mongodb::change_stream::event::OperationType as MongoOpType;

        let operation = match event.operation_type {
            MongoOpType::Insert => OperationType::Insert,
            MongoOpType::Update => OperationType::Update,
            MongoOpType::Replace => OperationType::Replace,
            other => OperationType::Unknown(format!("{:?}", other).to_lowercase()),
        };

        let namespace = event
            .ns
            .and_then(|ns| ns.coll.map(|coll| Namespace::new(ns.db, coll)))
            .ok_or(ConversionError::MissingNamespace)?;

        let id = bson::to_document(&event.id).map_err(|e| {
            ConversionError::ResumeTokenConversion(format!(
                "Failed to serialize resume token to BSON document: {}",
                e
            ))
        })?;

        Ok(Self {
            id,
            operation,
            namespace,
            document_key: event.document_key,
            full_document: event.full_document,
        })
    }
}
