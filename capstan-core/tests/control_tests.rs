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

//! Control plane: dispatcher, lag monitor and batch replayer.

mod common;

use capstan_core::batcher::DocumentBatcher;
use capstan_core::checkpoint::{ChangeLedgerEntry, CheckpointStore, TrackerState};
use capstan_core::control::{
    to_body, ControlRequest, DispatchStatus, Dispatcher, LagTrigger, WatchTrigger, CONTROL_QUEUE,
    LAG_QUEUE, MAX_RESEND_JITTER, WATCH_QUEUE,
};
use capstan_core::event::{Namespace, OperationType, ResumeToken};
use capstan_core::lag::{LagMonitor, LagMonitorConfig};
use capstan_core::replay::{BatchReplayer, ReplayError, ReplayOutcome};
use chrono::{Duration as ChronoDuration, Utc};
use common::{batcher_config, event, orders, FakeQueue, FakeSink, FakeStore, FakeTarget, BUCKET, CLUSTER};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn carts() -> Namespace {
    Namespace::new("shop", "carts")
}

fn request(state: TrackerState) -> String {
    to_body(&ControlRequest::event_writer(CLUSTER, state)).unwrap()
}

fn trigger(namespace: &Namespace) -> String {
    to_body(&WatchTrigger::new(CLUSTER, namespace)).unwrap()
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_fans_out_triggers() {
    let store = Arc::new(FakeStore::new());
    store.save_namespaces(CLUSTER, &[carts(), orders()]).await.unwrap();
    let queue = Arc::new(FakeQueue::new());
    let dispatcher = Dispatcher::new(Arc::clone(&store), Arc::clone(&queue));

    let response = dispatcher
        .handle(vec![request(TrackerState::Start)])
        .await
        .unwrap()
        .unwrap();

    assert_eq!(response.status, DispatchStatus::Started);
    assert_eq!(response.component, "event_writer");
    assert_eq!(store.tracker(), Some(TrackerState::Start));

    let triggers: Vec<WatchTrigger> = queue
        .sent_to(WATCH_QUEUE)
        .iter()
        .map(|s| WatchTrigger::from_json(&s.body).unwrap())
        .collect();
    assert_eq!(
        triggers,
        vec![WatchTrigger::new(CLUSTER, &carts()), WatchTrigger::new(CLUSTER, &orders())]
    );

    let lag = queue.sent_to(LAG_QUEUE);
    assert_eq!(lag.len(), 1);
    assert_eq!(LagTrigger::from_json(&lag[0].body).unwrap().cluster_name, CLUSTER);
}

#[tokio::test]
async fn stop_only_flips_the_tracker() {
    let store = Arc::new(FakeStore::new().with_tracker(TrackerState::Start));
    store.save_namespaces(CLUSTER, &[orders()]).await.unwrap();
    let queue = Arc::new(FakeQueue::new());
    let dispatcher = Dispatcher::new(Arc::clone(&store), Arc::clone(&queue));

    let response = dispatcher
        .handle(vec![request(TrackerState::Stop)])
        .await
        .unwrap()
        .unwrap();

    assert_eq!(response.status, DispatchStatus::Stopped);
    assert_eq!(store.tracker(), Some(TrackerState::Stop));
    assert!(queue.sent().is_empty());
}

#[tokio::test]
async fn extra_requests_are_requeued_unprocessed() {
    let store = Arc::new(FakeStore::new());
    let queue = Arc::new(FakeQueue::new());
    let dispatcher = Dispatcher::new(Arc::clone(&store), Arc::clone(&queue));

    dispatcher
        .handle(vec![request(TrackerState::Stop), request(TrackerState::Start)])
        .await
        .unwrap();

    assert_eq!(store.tracker(), Some(TrackerState::Stop));
    let requeued = queue.sent_to(CONTROL_QUEUE);
    assert_eq!(requeued.len(), 1);
    assert_eq!(requeued[0].body, request(TrackerState::Start));
    assert_eq!(requeued[0].delay, Duration::ZERO);
}

#[tokio::test]
async fn invalid_requests_are_rejected() {
    let store = Arc::new(FakeStore::new());
    let queue = Arc::new(FakeQueue::new());
    let dispatcher = Dispatcher::new(Arc::clone(&store), Arc::clone(&queue));

    for body in [
        r#"{"clusterName":"prod","component":"event_writer"}"#,
        r#"{"clusterName":"prod","component":"event_writer","operation":"pause"}"#,
        r#"{"component":"event_writer","operation":"start"}"#,
        "not json",
    ] {
        let err = dispatcher.handle(vec![body.to_string()]).await.unwrap_err();
        assert!(err.is_validation(), "{body}: {err}");
    }

    assert_eq!(store.tracker(), None);
    assert!(queue.sent().is_empty());
}

#[tokio::test]
async fn empty_delivery_is_a_no_op() {
    let store = Arc::new(FakeStore::new());
    let queue = Arc::new(FakeQueue::new());
    let dispatcher = Dispatcher::new(Arc::clone(&store), Arc::clone(&queue));

    assert!(dispatcher.handle(Vec::new()).await.unwrap().is_none());
    assert!(queue.sent().is_empty());
}

// ---------------------------------------------------------------------------
// Lag monitor
// ---------------------------------------------------------------------------

fn ledger_entry(namespace: &Namespace, batch_id: u64, age_secs: i64) -> ChangeLedgerEntry {
    ChangeLedgerEntry::new(
        CLUSTER,
        namespace.clone(),
        batch_id,
        None,
        0,
        ResumeToken::Earliest,
        Utc::now() - ChronoDuration::seconds(age_secs),
    )
}

fn monitor(store: &Arc<FakeStore>, queue: &Arc<FakeQueue>) -> LagMonitor<FakeStore, FakeQueue> {
    LagMonitor::new(Arc::clone(store), Arc::clone(queue), LagMonitorConfig::default())
}

#[tokio::test]
async fn lag_is_skipped_while_writer_is_stopped() {
    let store = Arc::new(FakeStore::new().with_entry(ledger_entry(&orders(), 0, 60)));
    let queue = Arc::new(FakeQueue::new());

    assert!(monitor(&store, &queue).run_once(CLUSTER).await.unwrap().is_none());
    assert!(store.status().is_none());

    let stopped = Arc::new(FakeStore::new().with_tracker(TrackerState::Stop));
    assert!(monitor(&stopped, &queue).run_once(CLUSTER).await.unwrap().is_none());
}

#[tokio::test]
async fn lag_reports_oldest_pending_batch() {
    let done = ledger_entry(&carts(), 0, 120).processed(Utc::now() - ChronoDuration::seconds(110));
    let store = Arc::new(
        FakeStore::new()
            .with_tracker(TrackerState::Start)
            .with_entry(ledger_entry(&orders(), 3, 90))
            .with_entry(ledger_entry(&orders(), 4, 30))
            .with_entry(done),
    );
    let queue = Arc::new(FakeQueue::new());

    let status = monitor(&store, &queue).run_once(CLUSTER).await.unwrap().unwrap();

    assert!(status.gap_in_seconds >= 90);
    assert_eq!(status.details.len(), 2);
    assert_eq!(status.details[0].namespace, "shop.orders");
    assert_eq!(status.details[0].batch_id, 3);
    assert!(status.details[0].processed_at.is_none());
    assert_eq!(status.details[1].namespace, "shop.carts");
    assert_eq!(status.details[1].gap_in_seconds, 10);
    assert_eq!(store.status(), Some(status));
}

#[tokio::test]
async fn lag_handle_requeues_extra_triggers_with_jitter() {
    let store = Arc::new(FakeStore::new().with_tracker(TrackerState::Start));
    let queue = Arc::new(FakeQueue::new());
    let body = to_body(&LagTrigger {
        cluster_name: CLUSTER.to_string(),
    })
    .unwrap();

    let status = monitor(&store, &queue)
        .handle(vec![body.clone(), body.clone(), body])
        .await
        .unwrap();

    assert!(status.is_some());
    let requeued = queue.sent_to(LAG_QUEUE);
    assert_eq!(requeued.len(), 2);
    assert!(requeued.iter().all(|s| s.delay <= MAX_RESEND_JITTER));
}

#[tokio::test]
async fn lag_handle_rejects_blank_cluster() {
    let store = Arc::new(FakeStore::new().with_tracker(TrackerState::Start));
    let queue = Arc::new(FakeQueue::new());

    let err = monitor(&store, &queue)
        .handle(vec![r#"{"clusterName":"  "}"#.to_string()])
        .await
        .unwrap_err();
    assert!(err.is_validation());
}

#[tokio::test(start_paused = true)]
async fn recurring_lag_runs_until_writer_stops() {
    let store = Arc::new(
        FakeStore::new()
            .with_tracker(TrackerState::Start)
            .with_entry(ledger_entry(&orders(), 0, 5)),
    );
    let queue = Arc::new(FakeQueue::new());
    let config = LagMonitorConfig::builder()
        .interval(Duration::from_secs(10))
        .build()
        .unwrap();
    let monitor = Arc::new(LagMonitor::new(Arc::clone(&store), Arc::clone(&queue), config));

    let task = {
        let monitor = Arc::clone(&monitor);
        tokio::spawn(async move { monitor.run_recurring(CLUSTER, CancellationToken::new()).await })
    };

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(store.status().is_some());

    store
        .set_tracker(CLUSTER, "event_writer", TrackerState::Stop)
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(30), task)
        .await
        .expect("monitor kept running")
        .unwrap();
    assert!(queue.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn recurring_lag_stops_on_cancel() {
    let store = Arc::new(FakeStore::new().with_tracker(TrackerState::Start));
    let queue = Arc::new(FakeQueue::new());
    let monitor = Arc::new(monitor(&store, &queue));
    let cancel = CancellationToken::new();

    let task = {
        let monitor = Arc::clone(&monitor);
        let cancel = cancel.clone();
        tokio::spawn(async move { monitor.run_recurring(CLUSTER, cancel).await })
    };

    tokio::time::sleep(Duration::from_secs(25)).await;
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("monitor ignored cancellation")
        .unwrap();
}

// ---------------------------------------------------------------------------
// Batch replayer
// ---------------------------------------------------------------------------

struct Fixture {
    store: Arc<FakeStore>,
    sink: Arc<FakeSink>,
    target: Arc<FakeTarget>,
    queue: Arc<FakeQueue>,
}

impl Fixture {
    fn new(tracker: TrackerState) -> Self {
        Self {
            store: Arc::new(FakeStore::new().with_tracker(tracker)),
            sink: Arc::new(FakeSink::new()),
            target: Arc::new(FakeTarget::new()),
            queue: Arc::new(FakeQueue::new()),
        }
    }

    fn batcher(&self) -> DocumentBatcher<FakeStore, FakeSink> {
        DocumentBatcher::new(
            CLUSTER,
            orders(),
            None,
            batcher_config(),
            Arc::clone(&self.store),
            Arc::clone(&self.sink),
        )
    }

    fn replayer(&self) -> BatchReplayer<FakeStore, FakeSink, FakeTarget, FakeQueue> {
        BatchReplayer::new(
            Arc::clone(&self.store),
            Arc::clone(&self.sink),
            Arc::clone(&self.target),
            Arc::clone(&self.queue),
            BUCKET,
        )
        .with_idle_delay(Duration::from_secs(10))
    }
}

#[tokio::test]
async fn replays_captured_batch_into_target() {
    let fx = Fixture::new(TrackerState::Start);
    let batcher = fx.batcher();
    batcher.on_event(event(&orders(), 1, OperationType::Insert)).await.unwrap();
    batcher.on_event(event(&orders(), 2, OperationType::Update)).await.unwrap();
    batcher.on_tick().await.unwrap();

    let outcome = fx.replayer().handle(vec![trigger(&orders())]).await.unwrap();

    assert_eq!(
        outcome,
        Some(ReplayOutcome::Replayed {
            batch_id: 0,
            documents: 2
        })
    );
    assert_eq!(fx.target.documents(&orders()).len(), 2);

    let ledger = fx.store.ledger_for(&orders());
    assert!(ledger[0].is_processed);

    let reposted = fx.queue.sent_to(WATCH_QUEUE);
    assert_eq!(reposted.len(), 1);
    assert_eq!(reposted[0].body, trigger(&orders()));
    assert_eq!(reposted[0].delay, Duration::ZERO);
}

#[tokio::test]
async fn replays_batches_in_order() {
    let fx = Fixture::new(TrackerState::Start);
    let batcher = fx.batcher();
    batcher.on_event(event(&orders(), 1, OperationType::Insert)).await.unwrap();
    batcher.on_tick().await.unwrap();
    batcher.on_event(event(&orders(), 2, OperationType::Insert)).await.unwrap();
    batcher.on_event(event(&orders(), 3, OperationType::Insert)).await.unwrap();
    batcher.on_tick().await.unwrap();

    let replayer = fx.replayer();
    let first = replayer.replay_next(CLUSTER, &orders()).await.unwrap();
    let second = replayer.replay_next(CLUSTER, &orders()).await.unwrap();
    let third = replayer.replay_next(CLUSTER, &orders()).await.unwrap();

    assert_eq!(first, ReplayOutcome::Replayed { batch_id: 0, documents: 1 });
    assert_eq!(second, ReplayOutcome::Replayed { batch_id: 1, documents: 2 });
    assert_eq!(third, ReplayOutcome::Idle);
    assert_eq!(fx.target.documents(&orders()).len(), 3);
}

#[tokio::test]
async fn heartbeat_is_marked_without_reading_the_sink() {
    let fx = Fixture::new(TrackerState::Start);
    fx.batcher().on_tick().await.unwrap();

    let outcome = fx.replayer().replay_next(CLUSTER, &orders()).await.unwrap();

    assert_eq!(outcome, ReplayOutcome::Replayed { batch_id: 0, documents: 0 });
    assert_eq!(fx.sink.gets.load(Ordering::SeqCst), 0);
    assert!(fx.store.ledger_for(&orders())[0].is_processed);
}

#[tokio::test]
async fn idle_namespace_is_polled_again_later() {
    let fx = Fixture::new(TrackerState::Start);

    let outcome = fx.replayer().handle(vec![trigger(&orders())]).await.unwrap();

    assert_eq!(outcome, Some(ReplayOutcome::Idle));
    let reposted = fx.queue.sent_to(WATCH_QUEUE);
    assert_eq!(reposted.len(), 1);
    assert_eq!(reposted[0].delay, Duration::from_secs(10));
}

#[tokio::test]
async fn stopped_writer_ends_the_trigger_chain() {
    let fx = Fixture::new(TrackerState::Stop);
    let batcher = fx.batcher();
    batcher.on_event(event(&orders(), 1, OperationType::Insert)).await.unwrap();
    batcher.on_tick().await.unwrap();

    let outcome = fx.replayer().handle(vec![trigger(&orders())]).await.unwrap();

    assert_eq!(outcome, Some(ReplayOutcome::Stopped));
    assert!(fx.queue.sent().is_empty());
    assert!(!fx.store.ledger_for(&orders())[0].is_processed);
}

#[tokio::test]
async fn missing_payload_is_retried_later() {
    let fx = Fixture::new(TrackerState::Start);
    let entry = ChangeLedgerEntry::new(
        CLUSTER,
        orders(),
        0,
        Some("prod/shop/orders/gone.json".to_string()),
        4,
        ResumeToken::Earliest,
        Utc::now(),
    );
    let store = Arc::new(FakeStore::new().with_tracker(TrackerState::Start).with_entry(entry));
    let replayer = BatchReplayer::new(
        Arc::clone(&store),
        Arc::clone(&fx.sink),
        Arc::clone(&fx.target),
        Arc::clone(&fx.queue),
        BUCKET,
    );

    let err = replayer.handle(vec![trigger(&orders())]).await.unwrap_err();

    assert!(matches!(err, ReplayError::Sink(_)));
    assert!(!store.ledger_for(&orders())[0].is_processed);
    let reposted = fx.queue.sent_to(WATCH_QUEUE);
    assert_eq!(reposted.len(), 1);
    assert_eq!(reposted[0].delay, Duration::from_secs(10));
}

#[tokio::test]
async fn extra_watch_triggers_are_requeued_with_jitter() {
    let fx = Fixture::new(TrackerState::Start);

    fx.replayer()
        .handle(vec![trigger(&orders()), trigger(&carts())])
        .await
        .unwrap();

    let sent = fx.queue.sent_to(WATCH_QUEUE);
    assert_eq!(sent.len(), 2);
    let requeued = sent.iter().find(|s| s.body == trigger(&carts())).unwrap();
    assert!(requeued.delay <= MAX_RESEND_JITTER);
}

#[tokio::test]
async fn malformed_trigger_is_rejected() {
    let fx = Fixture::new(TrackerState::Start);

    let err = fx
        .replayer()
        .handle(vec![r#"{"clusterName":"prod","namespace":"orders"}"#.to_string()])
        .await
        .unwrap_err();

    assert!(matches!(err, ReplayError::Control(_)));
    assert!(fx.queue.sent().is_empty());
}
