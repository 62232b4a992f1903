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

//! S3 client configuration.

/// Configuration for [`S3ObjectSink`](crate::s3::S3ObjectSink).
///
/// The bucket is not part of the configuration: every `put` and `get` names
/// its bucket, so one client serves the capture side and the replay side.
///
/// # Examples
///
/// ## AWS
///
/// ```rust
/// use capstan_sinks::s3::S3Config;
///
/// let config = S3Config::builder()
///     .region("us-east-1")
///     .build()
///     .unwrap();
/// assert_eq!(config.max_retries, 3);
/// ```
///
/// ## LocalStack or MinIO
///
/// ```rust
/// use capstan_sinks::s3::S3Config;
///
/// let config = S3Config::builder()
///     .region("us-east-1")
///     .endpoint_url("http://localhost:4566")
///     .force_path_style(true)
///     .build()
///     .unwrap();
/// assert!(config.force_path_style);
/// ```
#[derive(Debug, Clone)]
pub struct S3Config {
    /// AWS region (required).
    ///
    /// Examples: "us-east-1", "eu-west-1", "ap-southeast-2"
    pub region: String,

    /// Maximum attempts for S3 operations (default: 3).
    ///
    /// The SDK retries throttling and transient errors with exponential
    /// backoff before the sink sees them.
    pub max_retries: u32,

    /// Custom endpoint URL for S3-compatible storage (e.g., MinIO, LocalStack).
    ///
    /// Example: "http://localhost:4566" for LocalStack
    pub endpoint_url: Option<String>,

    /// Whether to use path-style addressing (default: false).
    ///
    /// Path-style: `https://s3.region.amazonaws.com/bucket/key`
    /// Virtual-hosted: `https://bucket.s3.region.amazonaws.com/key`
    ///
    /// Required for: LocalStack, MinIO
    pub force_path_style: bool,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            region: String::from("us-east-1"),
            max_retries: 3,
            endpoint_url: None,
            force_path_style: false,
        }
    }
}

impl S3Config {
    /// Creates a new builder for `S3Config`.
    #[must_use]
    pub fn builder() -> S3ConfigBuilder {
        S3ConfigBuilder::default()
    }
}

/// Builder for `S3Config`.
#[derive(Debug, Default)]
pub struct S3ConfigBuilder {
    region: Option<String>,
    max_retries: Option<u32>,
    endpoint_url: Option<String>,
    force_path_style: Option<bool>,
}

impl S3ConfigBuilder {
    /// Sets the AWS region (required).
    #[must_use]
    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Sets the maximum number of attempts (default: 3).
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Sets a custom S3 endpoint URL.
    #[must_use]
    pub fn endpoint_url(mut self, url: impl Into<String>) -> Self {
        self.endpoint_url = Some(url.into());
        self
    }

    /// Forces path-style addressing (required for LocalStack/MinIO).
    #[must_use]
    pub fn force_path_style(mut self, force: bool) -> Self {
        self.force_path_style = Some(force);
        self
    }

    /// Builds the `S3Config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the region is missing or empty, the retry budget
    /// is zero, or the endpoint is not an http(s) URL.
    pub fn build(self) -> Result<S3Config, String> {
        let region = self.region.ok_or("region is required")?;
        if region.is_empty() {
            return Err("region cannot be empty".to_string());
        }

        let max_retries = self.max_retries.unwrap_or(3);
        if max_retries == 0 {
            return Err("max_retries must be at least 1".to_string());
        }

        if let Some(url) = &self.endpoint_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(format!("endpoint_url must be an http(s) URL, got '{url}'"));
            }
        }

        Ok(S3Config {
            region,
            max_retries,
            endpoint_url: self.endpoint_url,
            force_path_style: self.force_path_style.unwrap_or(false),
        })
    }
}
