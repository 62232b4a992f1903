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

//! Command-line arguments and environment validation.

use capstan_core::checkpoint::TrackerState;
use clap::{ArgGroup, Parser, ValueEnum};
use std::fmt;

/// Variables every mode needs.
pub const REQUIRED_VARS: [&str; 6] = [
    "AWS_DEFAULT_REGION",
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "S3_CHANGE_FEED_BUCKET_NAME",
    "SOURCE_URI",
    "REDIS_URL",
];

/// Connection string of the replay target, needed by `--worker` only.
pub const TARGET_URI_VAR: &str = "TARGET_URI";

/// Capstan - change capture from MongoDB-compatible clusters
///
/// Without a mode flag the binary captures every namespace of the cluster
/// until interrupted.
#[derive(Parser, Debug)]
#[command(name = "capstan")]
#[command(author, version, about, long_about = None)]
#[command(group(
    ArgGroup::new("mode")
        .args(["event_writer", "status", "watch_status", "worker"])
        .multiple(false)
))]
pub struct Cli {
    /// Name the source cluster is tracked under
    #[arg(short = 'n', long)]
    pub cluster_name: String,

    /// Start or stop the event writer of the cluster
    #[arg(short, long, value_enum)]
    pub event_writer: Option<WriterState>,

    /// Print the latest replication status
    #[arg(short, long)]
    pub status: bool,

    /// Print the replication status every few seconds until interrupted
    #[arg(short, long)]
    pub watch_status: bool,

    /// Consume the control, replay and lag queues until interrupted
    #[arg(long)]
    pub worker: bool,
}

/// Value of `--event-writer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum WriterState {
    Start,
    Stop,
}

impl From<WriterState> for TrackerState {
    fn from(state: WriterState) -> Self {
        match state {
            WriterState::Start => Self::Start,
            WriterState::Stop => Self::Stop,
        }
    }
}

/// What the process does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Capture,
    EventWriter(TrackerState),
    Status,
    WatchStatus,
    Worker,
}

impl Cli {
    #[must_use]
    pub fn mode(&self) -> Mode {
        if let Some(state) = self.event_writer {
            Mode::EventWriter(state.into())
        } else if self.status {
            Mode::Status
        } else if self.watch_status {
            Mode::WatchStatus
        } else if self.worker {
            Mode::Worker
        } else {
            Mode::Capture
        }
    }

    /// Checks what clap cannot express.
    ///
    /// # Errors
    ///
    /// Returns a message when the cluster name is blank or contains the
    /// `::` key separator.
    pub fn validate(&self) -> Result<(), String> {
        let name = self.cluster_name.trim();
        if name.is_empty() {
            return Err("--cluster-name cannot be empty".to_string());
        }
        if name.contains("::") {
            return Err("--cluster-name cannot contain '::'".to_string());
        }
        Ok(())
    }
}

/// Environment variables that were not set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("missing required environment variables: {}", .0.join(", "))]
pub struct MissingVars(pub Vec<&'static str>);

/// Settings read from the environment at startup.
#[derive(Clone, PartialEq, Eq)]
pub struct Environment {
    pub region: String,
    pub bucket: String,
    pub source_uri: String,
    pub redis_url: String,
    pub target_uri: Option<String>,
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // connection strings may carry credentials
        f.debug_struct("Environment")
            .field("region", &self.region)
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

impl Environment {
    /// Reads the process environment.
    pub fn load(mode: Mode) -> Result<Self, MissingVars> {
        Self::from_lookup(mode, |name| std::env::var(name).ok())
    }

    /// Reads variables through `lookup`. Empty values count as missing.
    ///
    /// # Errors
    ///
    /// Lists every missing variable at once.
    pub fn from_lookup(mode: Mode, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, MissingVars> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let mut missing: Vec<&'static str> = REQUIRED_VARS
            .iter()
            .copied()
            .filter(|name| get(name).is_none())
            .collect();

        let target_uri = get(TARGET_URI_VAR);
        if mode == Mode::Worker && target_uri.is_none() {
            missing.push(TARGET_URI_VAR);
        }

        if !missing.is_empty() {
            return Err(MissingVars(missing));
        }

        Ok(Self {
            region: get("AWS_DEFAULT_REGION").unwrap_or_default(),
            bucket: get("S3_CHANGE_FEED_BUCKET_NAME").unwrap_or_default(),
            source_uri: get("SOURCE_URI").unwrap_or_default(),
            redis_url: get("REDIS_URL").unwrap_or_default(),
            target_uri,
        })
    }
}
