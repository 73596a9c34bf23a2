//! End-to-end runs of the producer and consumer halves over the in-memory topic.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use lib_telemetry::core::{
    BatchSubscriber, BroadcastHub, HubSettings, MemoryStore, PersistenceCoordinator, SubscriberSettings,
};
use lib_telemetry::ingestors::{Poller, PollerSettings};
use lib_telemetry::retrieve::{RetryPolicy, UnauthorizedPolicy};
use lib_telemetry::transport::memory::MemoryTopic;
use lib_telemetry::transport::{TOPIC_RAW, TopicConsumer};
use lib_telemetry::{PollerError, TelemetryEvent};
use project_tests::{MockUpstream, ScriptedFetcher};

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        attempts: 3,
        initial_delay: Duration::from_millis(10),
        backoff_factor: 2.0,
    }
}

#[tokio::test]
async fn one_cycle_publishes_each_record_with_zeroed_nulls() {
    let upstream = MockUpstream::start().await;
    let client = Arc::new(upstream.client(UnauthorizedPolicy::RetryOnce, None));
    let (producer, mut consumer) = MemoryTopic::open(TOPIC_RAW);
    let poller = Poller::new(client, Arc::new(producer), PollerSettings::default());

    let report = poller.cycle().await.unwrap();
    assert_eq!((report.fetched, report.published, report.failed), (2, 2, 0));

    consumer.subscribe(TOPIC_RAW).await.unwrap();
    let mut events = Vec::new();
    while let Some(message) = consumer.poll(Duration::from_millis(50)).await.unwrap() {
        let event = TelemetryEvent::from_payload(&message.payload).unwrap();
        assert_eq!(message.key, event.icao24);
        events.push(event);
    }

    assert_eq!(events.len(), 2);
    assert_eq!(events[0].icao24, "8a02ff");
    assert_eq!(events[1].icao24, "76cdb1");
    assert_eq!(events[1].lon, 0.0);
    assert_eq!(events[1].baro_altitude, 0.0);
}

#[tokio::test(start_paused = true)]
async fn escalates_after_the_fifth_failed_cycle() {
    let fetcher = Arc::new(ScriptedFetcher::always_failing());
    let (producer, _consumer) = MemoryTopic::open(TOPIC_RAW);
    let settings = PollerSettings {
        interval: Duration::from_secs(10),
        retry: fast_retry(),
        escalation_threshold: 5,
    };
    let poller = Poller::new(fetcher.clone(), Arc::new(producer), settings);

    let err = poller.run(CancellationToken::new()).await.unwrap_err();
    let PollerError::Escalated { failures, .. } = err;
    assert_eq!(failures, 5);
    assert_eq!(fetcher.calls(), 5 * 3);
}

#[tokio::test(start_paused = true)]
async fn a_success_before_the_threshold_prevents_escalation() {
    // Four failed cycles (12 calls), then success forever.
    let fetcher = Arc::new(ScriptedFetcher::new(12, Vec::new()));
    let (producer, _consumer) = MemoryTopic::open(TOPIC_RAW);
    let settings = PollerSettings {
        interval: Duration::from_secs(10),
        retry: fast_retry(),
        escalation_threshold: 5,
    };
    let poller = Poller::new(fetcher.clone(), Arc::new(producer), settings);
    let cancel = CancellationToken::new();

    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(120)).await;
        stopper.cancel();
    });

    assert!(poller.run(cancel).await.is_ok());
    assert!(fetcher.calls() > 12);
}

#[tokio::test]
async fn fetched_snapshot_reaches_hub_and_store_as_one_ordered_batch() {
    let upstream = MockUpstream::start().await;
    let cancel = CancellationToken::new();

    // --- Producer half ---
    let (producer, consumer) = MemoryTopic::open(TOPIC_RAW);
    let poller = Poller::new(
        Arc::new(upstream.client(UnauthorizedPolicy::RetryOnce, None)),
        Arc::new(producer),
        PollerSettings::default(),
    );
    poller.cycle().await.unwrap();

    // --- Consumer half ---
    let (hub, hub_task) = BroadcastHub::spawn(HubSettings::default(), cancel.clone());
    let mut live = hub.join();
    let store = MemoryStore::new();
    let persistence = PersistenceCoordinator::new(Some(Arc::new(store.clone())), 1);
    let settings = SubscriberSettings {
        topic: TOPIC_RAW.into(),
        poll_timeout: Duration::from_millis(100),
        max_batch_size: 1000,
    };
    let subscriber = tokio::spawn(BatchSubscriber::new(consumer, hub.clone(), persistence, settings).run(cancel.clone()));

    let batch = tokio::time::timeout(Duration::from_secs(5), live.recv())
        .await
        .expect("no batch delivered")
        .expect("hub closed");
    let live_order: Vec<&str> = batch.iter().map(|e| e.icao24.as_str()).collect();
    assert_eq!(live_order, ["8a02ff", "76cdb1"]);

    // Persistence follows the live delivery.
    tokio::time::timeout(Duration::from_secs(5), async {
        while store.rows().len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("rows never committed");

    cancel.cancel();
    let report = subscriber.await.unwrap().unwrap();
    assert_eq!(report.events, 2);
    assert_eq!(report.batches, 1);

    let rows = store.rows();
    let stored_order: Vec<&str> = rows.iter().map(|r| r.icao24.as_str()).collect();
    assert_eq!(stored_order, ["8a02ff", "76cdb1"]);
    assert_eq!(rows[1].longitude, 0.0);
    assert_eq!(store.transactions(), (1, 0));

    // The hub closes the live channel on shutdown.
    assert!(live.recv().await.is_none());
    assert_eq!(hub_task.await.unwrap().batches_published, 1);
}
