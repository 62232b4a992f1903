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

//! `capstan` binary.
//!
//! ```bash
//! # capture every namespace of the cluster
//! capstan --cluster-name prod
//!
//! # let replay workers apply captured batches
//! capstan --cluster-name prod --event-writer start
//! capstan --cluster-name prod --worker
//!
//! # inspect replication lag
//! capstan --cluster-name prod --status
//! ```

mod cli;

use capstan_core::batcher::BatcherConfig;
use capstan_core::capture::{CaptureConfig, CaptureService};
use capstan_core::checkpoint::{CheckpointStore, TrackerState};
use capstan_core::control::{to_body, ControlRequest, Dispatcher, WorkQueue, CONTROL_QUEUE, LAG_QUEUE, WATCH_QUEUE};
use capstan_core::lag::{LagMonitor, LagMonitorConfig};
use capstan_core::metrics;
use capstan_core::replay::{BatchReplayer, MongoTargetWriter};
use capstan_core::stream::{ChangeStreamConfig, MongoChangeSource};
use capstan_sinks::s3::{S3Config, S3ObjectSink};
use capstan_stores::redis::{RedisCheckpointStore, RedisConfig, RedisWorkQueue};
use clap::Parser;
use cli::{Cli, Environment, Mode};
use std::future::Future;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Delay between two status prints of `--watch-status`.
const STATUS_REFRESH: Duration = Duration::from_secs(5);

/// Delay before polling an empty queue again.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Messages taken per receive.
const RECEIVE_BATCH: usize = 10;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() { ExitCode::FAILURE } else { ExitCode::SUCCESS };
        }
    };

    if let Err(message) = cli.validate() {
        error!("{message}");
        return ExitCode::FAILURE;
    }

    let mode = cli.mode();
    let env = match Environment::load(mode) {
        Ok(env) => env,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    debug!(?env, ?mode, "Environment validated");

    match run(&cli.cluster_name, mode, env).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(cluster = %cli.cluster_name, error = %e, "capstan failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cluster: &str, mode: Mode, env: Environment) -> Result<(), BoxError> {
    match mode {
        Mode::Capture => capture(cluster, env).await,
        Mode::EventWriter(state) => set_event_writer(cluster, state, &env).await,
        Mode::Status => {
            let store = checkpoint_store(&env).await?;
            print_status(&store, cluster).await
        }
        Mode::WatchStatus => watch_status(cluster, &env).await,
        Mode::Worker => worker(cluster, env).await,
    }
}

fn redis_config(env: &Environment) -> Result<RedisConfig, BoxError> {
    Ok(RedisConfig::builder().url(&env.redis_url).build()?)
}

async fn checkpoint_store(env: &Environment) -> Result<RedisCheckpointStore, BoxError> {
    Ok(RedisCheckpointStore::new(redis_config(env)?).await?)
}

async fn object_sink(env: &Environment) -> Result<S3ObjectSink, BoxError> {
    let config = S3Config::builder().region(&env.region).build()?;
    Ok(S3ObjectSink::new(config).await?)
}

/// Cancels the returned token on Ctrl+C.
fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down");
                trigger.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for Ctrl+C"),
        }
    });
    token
}

/// Sleeps for `delay`. Returns `true` if `cancel` fired first.
async fn pause(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        () = cancel.cancelled() => true,
        () = tokio::time::sleep(delay) => false,
    }
}

async fn capture(cluster: &str, env: Environment) -> Result<(), BoxError> {
    metrics::init_metrics();

    let config = CaptureConfig::builder()
        .cluster_name(cluster)
        .batcher_config(BatcherConfig::builder().bucket(&env.bucket).build()?)
        .build()?;

    let source = MongoChangeSource::connect(&env.source_uri, config.stream_config.clone()).await?;
    let store = checkpoint_store(&env).await?;
    let sink = object_sink(&env).await?;

    let service = CaptureService::new(config, Arc::new(source), Arc::new(store), Arc::new(sink));
    info!(cluster, bucket = %env.bucket, "Starting capture, press Ctrl+C to stop");

    let report = service.run(shutdown_on_ctrl_c()).await?;
    for (namespace, exit) in &report.finished {
        info!(namespace = %namespace, ?exit, "Watcher finished");
    }
    if report.is_clean() {
        return Ok(());
    }
    for (namespace, err) in &report.failed {
        error!(namespace = %namespace, error = %err, "Watcher failed");
    }
    Err(format!("{} namespace(s) failed", report.failed.len()).into())
}

async fn set_event_writer(cluster: &str, state: TrackerState, env: &Environment) -> Result<(), BoxError> {
    let queue = RedisWorkQueue::new(redis_config(env)?).await?;
    let body = to_body(&ControlRequest::event_writer(cluster, state))?;
    queue.send(CONTROL_QUEUE, body, Duration::ZERO).await?;
    info!(cluster, state = %state, queue = CONTROL_QUEUE, "Event writer request sent");
    Ok(())
}

async fn print_status(store: &RedisCheckpointStore, cluster: &str) -> Result<(), BoxError> {
    match store.get_status(cluster).await? {
        Some(status) => println!("{}", serde_json::to_string_pretty(&status)?),
        None => println!("Status: not available yet. Is the event writer started?"),
    }
    Ok(())
}

async fn watch_status(cluster: &str, env: &Environment) -> Result<(), BoxError> {
    let store = checkpoint_store(env).await?;
    let cancel = shutdown_on_ctrl_c();
    loop {
        print_status(&store, cluster).await?;
        if pause(&cancel, STATUS_REFRESH).await {
            return Ok(());
        }
    }
}

/// Receives from `queue_name` until `cancel` fires, passing every non-empty
/// delivery to `handle`.
async fn consume<F, Fut>(queue: &RedisWorkQueue, queue_name: &'static str, cancel: &CancellationToken, mut handle: F)
where
    F: FnMut(Vec<String>) -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        let received = tokio::select! {
            () = cancel.cancelled() => break,
            received = queue.receive(queue_name, RECEIVE_BATCH) => received,
        };

        match received {
            Ok(bodies) if !bodies.is_empty() => handle(bodies).await,
            Ok(_) => {
                if pause(cancel, POLL_INTERVAL).await {
                    break;
                }
            }
            Err(e) => {
                warn!(queue = queue_name, error = %e, "Receive failed");
                if pause(cancel, POLL_INTERVAL).await {
                    break;
                }
            }
        }
    }
    debug!(queue = queue_name, "Consumer stopped");
}

async fn worker(cluster: &str, env: Environment) -> Result<(), BoxError> {
    let target_uri = env.target_uri.clone().ok_or("TARGET_URI is required")?;

    let store = Arc::new(checkpoint_store(&env).await?);
    let queue = Arc::new(RedisWorkQueue::new(redis_config(&env)?).await?);
    let sink = Arc::new(object_sink(&env).await?);
    let target = Arc::new(MongoTargetWriter::connect(&target_uri).await?);

    let dispatcher = Dispatcher::new(Arc::clone(&store), Arc::clone(&queue));
    let lag = LagMonitor::new(Arc::clone(&store), Arc::clone(&queue), LagMonitorConfig::default());
    let replayer = BatchReplayer::new(
        Arc::clone(&store),
        sink,
        target,
        Arc::clone(&queue),
        env.bucket.clone(),
    );

    let cancel = shutdown_on_ctrl_c();
    info!(cluster, "Worker started, press Ctrl+C to stop");

    let (dispatcher, lag, replayer, cancel_ref) = (&dispatcher, &lag, &replayer, &cancel);
    tokio::join!(
        consume(&queue, CONTROL_QUEUE, &cancel, move |bodies| async move {
            match dispatcher.handle(bodies).await {
                Ok(Some(response)) => info!(cluster = %response.cluster_name, status = ?response.status, "Request dispatched"),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Control request rejected"),
            }
        }),
        consume(&queue, WATCH_QUEUE, &cancel, move |bodies| async move {
            match replayer.handle(bodies).await {
                Ok(Some(outcome)) => debug!(?outcome, "Watch trigger handled"),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Replay failed"),
            }
        }),
        consume(&queue, LAG_QUEUE, &cancel, move |bodies| async move {
            match lag.handle(bodies).await {
                // keep reporting while the event writer runs
                Ok(Some(status)) => lag.run_recurring(&status.cluster_name, cancel_ref.child_token()).await,
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Lag trigger rejected"),
            }
        }),
    );

    info!(cluster, "Worker stopped");
    store.close().await?;
    Ok(())
}
