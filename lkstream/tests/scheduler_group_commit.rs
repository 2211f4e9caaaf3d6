//! Exercises the group-commit scheduler end to end: a produced batch in
//! `group` mode should get picked up by `Scheduler::mark_dirty` and flushed,
//! either by the byte threshold or the timer, without the caller ever having
//! to call `Partition::sync` itself (spec.md §4.3).

use std::time::Duration;

use lkstream::broker::Broker;
use lkstream::config::{Config, FsyncMode};
use lkstream::record::Record;
use tempfile::tempdir;

async fn test_config(dir: &std::path::Path, fsync_group_bytes: u64, fsync_interval_ms: u64) -> Config {
    let mut config = Config::load(None).unwrap();
    config.persist_dir = dir.to_path_buf();
    config.fsync_mode = FsyncMode::Group;
    config.fsync_group_bytes = fsync_group_bytes;
    config.fsync_interval_ms = fsync_interval_ms;
    config.segment_max_bytes = 1024 * 1024;
    config
}

#[tokio::test]
async fn byte_threshold_flushes_before_the_timer_would() {
    let dir = tempdir().unwrap();
    // A 10s interval would never fire during this test; only the byte
    // trigger (4 bytes) can plausibly flush in time.
    let config = test_config(dir.path(), 4, 10_000).await;
    let broker = Broker::open(config).await.unwrap();
    broker.create_topic("orders", 1).await.unwrap();

    let scheduler = broker.scheduler();
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let lookup_broker = broker.clone();
    let handle = tokio::spawn({
        let scheduler = scheduler.clone();
        async move {
            scheduler
                .run(move |t, p| lookup_broker.partition(t, p).ok(), shutdown_rx)
                .await;
        }
    });

    broker
        .produce("orders", vec![Record::without_key("hello")])
        .await
        .unwrap();

    let partition = broker.partition("orders", 0).unwrap();
    let mut flushed = false;
    for _ in 0..50 {
        if partition.unsynced_bytes() == 0 {
            flushed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(flushed, "byte-triggered flush never cleared unsynced_bytes");

    let _ = shutdown_tx.send(());
    let _ = handle.await;
}

#[tokio::test]
async fn produced_records_are_durable_after_scheduler_shutdown_flush() {
    let dir = tempdir().unwrap();
    // A huge byte threshold and a long interval mean only the final
    // shutdown flush can make this durable within the test's lifetime.
    let config = test_config(dir.path(), u64::MAX, 60_000).await;
    let broker = Broker::open(config).await.unwrap();
    broker.create_topic("orders", 1).await.unwrap();

    let scheduler = broker.scheduler();
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let lookup_broker = broker.clone();
    let handle = tokio::spawn({
        let scheduler = scheduler.clone();
        async move {
            scheduler
                .run(move |t, p| lookup_broker.partition(t, p).ok(), shutdown_rx)
                .await;
        }
    });

    broker
        .produce("orders", vec![Record::without_key("hello")])
        .await
        .unwrap();

    let partition = broker.partition("orders", 0).unwrap();
    assert!(partition.unsynced_bytes() > 0, "nothing marked dirty yet");

    let _ = shutdown_tx.send(());
    let _ = handle.await;

    assert_eq!(partition.unsynced_bytes(), 0, "shutdown flush did not sync the partition");
}
