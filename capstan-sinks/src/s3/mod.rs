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

//! Object sink backed by AWS S3.
//!
//! Works with AWS S3 and S3-compatible storage such as MinIO or LocalStack.
//! Credentials come from the default provider chain (environment variables,
//! profiles, instance roles).
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use capstan_core::sink::ObjectSink;
//! use capstan_sinks::s3::{S3Config, S3ObjectSink};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = S3Config::builder().region("us-east-1").build()?;
//!     let sink = S3ObjectSink::new(config).await?;
//!
//!     sink.put("change-feed", "prod/shop/orders/shop.orders-batch-000000.json", b"{}\n".to_vec())
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod config;
mod sink;

pub use config::{S3Config, S3ConfigBuilder};
pub use sink::S3ObjectSink;
