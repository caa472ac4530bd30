use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::backend::memory::{MemoryEventStore, MemoryFanoutBus};
use crate::backend::{EventStore, LogEntry};
use crate::config::RelayConfig;
use crate::router::{EventProcessor, Outcome, PendingReclaimer, ShardConsumer};
use crate::sharding::{fanout_channel, state_key, stream_key_for_job};
use crate::types::{Domain, JobId, StageEvent, StreamPosition};

fn event_fields(job_id: &str, stage: &str, status: &str, seq: i64) -> HashMap<String, String> {
    HashMap::from([
        ("job_id".to_owned(), job_id.to_owned()),
        ("stage".to_owned(), stage.to_owned()),
        ("status".to_owned(), status.to_owned()),
        ("seq".to_owned(), seq.to_string()),
    ])
}

fn harness() -> (Arc<MemoryEventStore>, Arc<MemoryFanoutBus>, EventProcessor) {
    let store = Arc::new(MemoryEventStore::new());
    let bus = Arc::new(MemoryFanoutBus::new());
    let processor = EventProcessor::new(
        store.clone(),
        bus.clone(),
        Duration::from_secs(3600),
        Duration::from_secs(7200),
    );
    (store, bus, processor)
}

fn entry(ms: u64, fields: HashMap<String, String>) -> LogEntry {
    LogEntry {
        position: StreamPosition::new(ms, 0),
        fields,
    }
}

async fn snapshot_seq(store: &MemoryEventStore, stream: &str, job_id: &str) -> Option<i64> {
    let domain = Domain::of_stream_key(stream);
    let key = state_key(&domain, &JobId::from(job_id));
    let raw = store.get_json(&key).await.unwrap()?;
    let event: StageEvent = serde_json::from_str(&raw).unwrap();
    Some(event.seq)
}

#[tokio::test]
async fn out_of_order_arrival_keeps_newest_snapshot() {
    let (store, bus, processor) = harness();
    let stream = "scan:events:3";

    let out = processor
        .process(stream, &entry(1, event_fields("job-1", "classifying", "running", 1)))
        .await
        .unwrap();
    assert_eq!(out, Outcome::Applied);

    let out = processor
        .process(stream, &entry(2, event_fields("job-1", "done", "completed", 3)))
        .await
        .unwrap();
    assert_eq!(out, Outcome::Applied);

    // seq 2 arrives after seq 3: marked and published, snapshot untouched.
    let out = processor
        .process(stream, &entry(3, event_fields("job-1", "uploading", "running", 2)))
        .await
        .unwrap();
    assert_eq!(out, Outcome::Stale);

    assert_eq!(snapshot_seq(&store, stream, "job-1").await, Some(3));
    assert_eq!(bus.published().len(), 3);
}

#[tokio::test]
async fn snapshot_seq_is_monotonic_under_shuffled_delivery() {
    let (store, _bus, processor) = harness();
    let stream = "scan:events:1";
    for (ms, seq) in [(1, 3), (2, 1), (3, 5), (4, 2), (5, 4)] {
        processor
            .process(stream, &entry(ms, event_fields("job-mono", "classifying", "running", seq)))
            .await
            .unwrap();
    }
    assert_eq!(snapshot_seq(&store, stream, "job-mono").await, Some(5));
}

#[tokio::test]
async fn reprocessing_is_idempotent() {
    let (store, bus, processor) = harness();
    let stream = "scan:events:0";
    let e = entry(1, event_fields("job-2", "done", "completed", 5));

    assert_eq!(processor.process(stream, &e).await.unwrap(), Outcome::Applied);
    assert_eq!(processor.process(stream, &e).await.unwrap(), Outcome::Duplicate);

    assert_eq!(snapshot_seq(&store, stream, "job-2").await, Some(5));
    // The duplicate was not republished.
    assert_eq!(bus.published().len(), 1);
}

#[tokio::test]
async fn equal_seq_is_a_duplicate() {
    let (store, bus, processor) = harness();
    let stream = "scan:events:0";

    processor
        .process(stream, &entry(1, event_fields("job-3", "classifying", "running", 4)))
        .await
        .unwrap();
    // Same seq from a different log entry: the marker is keyed on
    // (job_id, seq), so this hits the existing marker and is not
    // republished.
    let out = processor
        .process(stream, &entry(2, event_fields("job-3", "classifying", "retried", 4)))
        .await
        .unwrap();
    assert_eq!(out, Outcome::Duplicate);
    assert_eq!(snapshot_seq(&store, stream, "job-3").await, Some(4));
    assert_eq!(bus.published().len(), 1);
}

#[tokio::test]
async fn token_events_bypass_state() {
    let (store, bus, processor) = harness();
    let stream = "scan:events:1";
    let mut fields = event_fields("job-4", "token", "streaming", 7);
    fields.insert("result".to_owned(), "{\"text\":\"hi\"}".to_owned());

    let out = processor.process(stream, &entry(1, fields)).await.unwrap();
    assert_eq!(out, Outcome::Applied);

    assert_eq!(snapshot_seq(&store, stream, "job-4").await, None);
    let published = bus.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, fanout_channel(&JobId::from("job-4")));
}

#[tokio::test]
async fn entry_without_job_id_is_skipped() {
    let (_store, bus, processor) = harness();
    let fields = HashMap::from([("stage".to_owned(), "done".to_owned())]);
    let out = processor
        .process("scan:events:0", &entry(1, fields))
        .await
        .unwrap();
    assert_eq!(out, Outcome::Skipped);
    assert!(bus.published().is_empty());
}

#[tokio::test]
async fn publish_failure_does_not_block_apply() {
    let (store, bus, processor) = harness();
    bus.fail_publish(true);
    let stream = "scan:events:0";

    let out = processor
        .process(stream, &entry(1, event_fields("job-5", "done", "completed", 1)))
        .await
        .unwrap();
    assert_eq!(out, Outcome::Applied);
    assert_eq!(snapshot_seq(&store, stream, "job-5").await, Some(1));
}

#[tokio::test]
async fn consumer_processes_and_acks_appended_events() {
    let (store, _bus, processor) = harness();
    let config = RelayConfig::for_tests();
    let consumer = ShardConsumer::new(store.clone(), Arc::new(processor), &config);
    consumer.setup().await.unwrap();

    let domain = Domain::new("scan");
    let stream = stream_key_for_job(&domain, &JobId::from("job-6"), config.shard_count(&domain).unwrap());
    store.append(&stream, event_fields("job-6", "classifying", "running", 1));
    store.append(&stream, event_fields("job-6", "done", "completed", 2));

    let cancel = CancellationToken::new();
    let handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move { consumer.run(cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();
    handle.await.unwrap();

    assert_eq!(snapshot_seq(&store, &stream, "job-6").await, Some(2));
    assert!(store.pending_positions(&stream, &config.consumer_group).is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_apply_is_reclaimed_and_acked() {
    let (store, _bus, processor) = harness();
    let processor = Arc::new(processor);
    let config = RelayConfig::for_tests();
    let stream = "scan:events:0".to_owned();
    store.ensure_group(&stream, &config.consumer_group).await.unwrap();
    store.append(&stream, event_fields("job-7", "done", "completed", 1));

    // First delivery fails at the apply step, so the consumer withholds ack.
    store.fail_apply(true);
    let batches = store
        .read_group(
            std::slice::from_ref(&stream),
            &config.consumer_group,
            &config.consumer_name,
            10,
            Duration::from_millis(10),
        )
        .await
        .unwrap();
    let delivered = &batches[0].1[0];
    assert!(processor.process(&stream, delivered).await.is_err());
    assert_eq!(store.pending_positions(&stream, &config.consumer_group).len(), 1);

    // Backend recovers; once the entry has idled past the threshold the
    // reclaimer picks it up, reprocesses, and acks.
    store.fail_apply(false);
    tokio::time::advance(config.reclaim_min_idle + Duration::from_secs(1)).await;

    let reclaimer =
        PendingReclaimer::new(store.clone(), processor, vec![stream.clone()], &config);
    reclaimer.scan_once().await;

    assert_eq!(snapshot_seq(&store, &stream, "job-7").await, Some(1));
    assert!(store.pending_positions(&stream, &config.consumer_group).is_empty());
}

#[tokio::test]
async fn entries_logged_before_group_creation_are_delivered() {
    let store = Arc::new(MemoryEventStore::new());
    let config = RelayConfig::for_tests();
    let stream = "scan:events:0".to_owned();

    // Producers were already writing when this instance (or a renamed
    // group) first came up; group creation must not skip their entries.
    store.append(&stream, event_fields("job-9", "done", "completed", 1));
    store.ensure_group(&stream, &config.consumer_group).await.unwrap();

    let batches = store
        .read_group(
            std::slice::from_ref(&stream),
            &config.consumer_group,
            &config.consumer_name,
            10,
            Duration::from_millis(10),
        )
        .await
        .unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].1.len(), 1);
}

#[tokio::test]
async fn idle_block_read_does_not_stall_other_store_calls() {
    let store = Arc::new(MemoryEventStore::new());
    let config = RelayConfig::for_tests();
    let stream = "scan:events:0".to_owned();
    store.ensure_group(&stream, &config.consumer_group).await.unwrap();

    // A blocked read on an empty partition must not delay snapshot reads
    // issued through the same store.
    let reader = {
        let store = store.clone();
        let group = config.consumer_group.clone();
        let consumer = config.consumer_name.clone();
        let stream = stream.clone();
        tokio::spawn(async move {
            store
                .read_group(
                    std::slice::from_ref(&stream),
                    &group,
                    &consumer,
                    10,
                    Duration::from_millis(500),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let lookup = tokio::time::timeout(Duration::from_millis(100), store.get_json("scan:state:j"))
        .await
        .expect("snapshot read stalled behind a blocked stream read");
    assert_eq!(lookup.unwrap(), None);
    assert!(reader.await.unwrap().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn fresh_pending_entries_are_not_reclaimed() {
    let store = Arc::new(MemoryEventStore::new());
    let config = RelayConfig::for_tests();
    let stream = "scan:events:1".to_owned();
    store.ensure_group(&stream, &config.consumer_group).await.unwrap();
    store.append(&stream, event_fields("job-8", "classifying", "running", 1));

    store
        .read_group(
            std::slice::from_ref(&stream),
            &config.consumer_group,
            &config.consumer_name,
            10,
            Duration::from_millis(10),
        )
        .await
        .unwrap();
    // Entry has been pending for less than the idle threshold.
    tokio::time::advance(Duration::from_secs(10)).await;

    let claimed = store
        .claim_idle(
            &stream,
            &config.consumer_group,
            "reclaim",
            config.reclaim_min_idle,
            10,
        )
        .await
        .unwrap();
    assert!(claimed.is_empty());
}
