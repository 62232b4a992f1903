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

//! Checkpoint store and work queue backends for Capstan.
//!
//! Capture persists its progress through
//! [`CheckpointStore`](capstan_core::checkpoint::CheckpointStore) and the
//! control plane exchanges messages through
//! [`WorkQueue`](capstan_core::control::WorkQueue). This crate provides the
//! backends for both.
//!
//! # Available Backends
//!
//! - **Memory** (always available): process-local tables and queues, for
//!   tests and single-process runs
//! - **Redis** (`redis-store` feature): durable storage shared by every
//!   process of a deployment
//!
//! # Example: Redis
//!
//! ```rust,ignore
//! use capstan_core::checkpoint::{CheckpointStore, TrackerState, EVENT_WRITER_COMPONENT};
//! use capstan_stores::redis::{RedisCheckpointStore, RedisConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RedisConfig::builder()
//!     .url("redis://localhost:6379")
//!     .pool_size(10)
//!     .build()?;
//!
//! let store = RedisCheckpointStore::new(config).await?;
//! store
//!     .set_tracker("prod", EVENT_WRITER_COMPONENT, TrackerState::Start)
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod memory;

#[cfg(feature = "redis-store")]
pub mod redis;

pub use memory::{MemoryCheckpointStore, MemoryWorkQueue};
