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

//! Capstan Sinks - object storage for batch payloads
//!
//! Implementations of [`ObjectSink`](capstan_core::sink::ObjectSink), the
//! blob store that receives one newline-delimited JSON object per flushed
//! batch and serves it back to the replayer.
//!
//! # Available Sinks
//!
//! - **Memory**: process-local, always available
//! - **S3**: AWS S3 and S3-compatible storage (MinIO, LocalStack)
//!
//! # Features
//!
//! - `s3` - AWS S3 sink (default)
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use capstan_sinks::s3::{S3Config, S3ObjectSink};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = S3Config::builder().region("us-east-1").build()?;
//!     let sink = S3ObjectSink::new(config).await?;
//!     Ok(())
//! }
//! ```

pub mod memory;

#[cfg(feature = "s3")]
pub mod s3;

pub use memory::MemoryObjectSink;
