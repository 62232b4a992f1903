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

//! S3 implementation of [`ObjectSink`].

use crate::s3::config::S3Config;
use async_trait::async_trait;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use capstan_core::sink::{ObjectSink, SinkError};
use tracing::{debug, error, info};

/// Content type of batch payloads.
const CONTENT_TYPE: &str = "application/x-ndjson";

/// Service error codes worth another attempt.
const RETRYABLE_CODES: [&str; 4] = ["SlowDown", "ServiceUnavailable", "InternalError", "RequestTimeout"];

/// Writes batch payloads to S3 and reads them back for replay.
///
/// The client is cheap to clone and safe to share between every batcher of
/// a cluster.
#[derive(Debug, Clone)]
pub struct S3ObjectSink {
    client: S3Client,
}

impl S3ObjectSink {
    /// Creates a sink, loading credentials from the default provider chain.
    ///
    /// # Errors
    ///
    /// Returns `SinkError::Configuration` if the region is empty.
    pub async fn new(config: S3Config) -> Result<Self, SinkError> {
        if config.region.is_empty() {
            return Err(SinkError::configuration("region cannot be empty", Some("region".to_string())));
        }
        info!(region = %config.region, "Initializing S3 object sink");

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));

        if let Some(endpoint_url) = &config.endpoint_url {
            debug!(endpoint_url, "Using custom S3 endpoint");
            loader = loader.endpoint_url(endpoint_url);
        }

        let shared = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared).retry_config(
            aws_sdk_s3::config::retry::RetryConfig::standard().with_max_attempts(config.max_retries),
        );
        if config.force_path_style {
            debug!("Using path-style S3 addressing");
            builder = builder.force_path_style(true);
        }

        Ok(Self::from_client(S3Client::from_conf(builder.build())))
    }

    /// Wraps an already configured client.
    #[must_use]
    pub fn from_client(client: S3Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ObjectSink for S3ObjectSink {
    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), SinkError> {
        let size = body.len();
        debug!(bucket, key, size, "Uploading batch payload");

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(CONTENT_TYPE)
            .send()
            .await
            .map_err(|e| {
                error!(bucket, key, error = %e, "Failed to write to S3");
                classify_error(key, e)
            })?;

        debug!(bucket, key, size, "Uploaded batch payload");
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, SinkError> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify_error(key, e))?;

        let data = output.body.collect().await.map_err(SinkError::connection)?;
        Ok(data.into_bytes().to_vec())
    }
}

/// Classifies S3 SDK errors into [`SinkError`] variants.
fn classify_error<E>(key: &str, error: SdkError<E>) -> SinkError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    match error {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => SinkError::connection(error),

        SdkError::ServiceError(ref service_err) => {
            let code = service_err.err().code().unwrap_or_default().to_string();
            if code == "NoSuchKey" || code == "NotFound" {
                SinkError::NotFound { key: key.to_string() }
            } else {
                let retryable = RETRYABLE_CODES.contains(&code.as_str());
                SinkError::write(key, error, retryable)
            }
        }

        SdkError::ConstructionFailure(_) => {
            SinkError::configuration(error.to_string(), Some("s3_client".to_string()))
        }

        _ => SinkError::write(key, error, false),
    }
}
