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

//! Capstan Core - change capture from MongoDB-compatible clusters
//!
//! This crate captures inserts, updates and replaces from every collection of
//! a source cluster, writes them in time-windowed batches to an object store
//! and records durable progress so capture resumes where it stopped.
//!
//! # Key Components
//!
//! - **Events**: [`event`] defines change events, namespaces and resume tokens
//! - **Watching**: [`stream`] reads one namespace with position fallback
//! - **Batching**: [`batcher`] and [`registry`] buffer events per namespace
//! - **Orchestration**: [`orchestrator`] and [`capture`] run a whole cluster
//! - **Storage traits**: [`checkpoint`] and [`sink`] abstract the backends
//! - **Control plane**: [`control`], [`lag`] and [`replay`] handle queue
//!   messages, lag reporting and batch replay
//!
//! # Example
//!
//! ```rust
//! use capstan_core::event::{Namespace, ResumeToken};
//!
//! let ns = Namespace::parse("shop.orders").unwrap();
//! assert_eq!(ns.to_string(), "shop.orders");
//!
//! let token = ResumeToken::decode("earliest").unwrap();
//! assert_eq!(token, ResumeToken::Earliest);
//! ```

pub mod batcher;
pub mod capture;
pub mod checkpoint;
pub mod control;
pub mod event;
pub mod lag;
pub mod metrics;
pub mod orchestrator;
pub mod registry;
pub mod replay;
pub mod sink;
pub mod stream;
