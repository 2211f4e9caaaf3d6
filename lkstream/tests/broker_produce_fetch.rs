//! End-to-end scenarios (a) and (e): keyed routing plus live subscription.

use bytes::Bytes;
use lkstream::config::Config;
use lkstream::hash::key_to_partition;
use lkstream::{Broker, Record};
use tempfile::tempdir;

async fn test_broker(dir: &std::path::Path) -> std::sync::Arc<Broker> {
    let mut config = Config::load(None).unwrap();
    config.persist_dir = dir.to_path_buf();
    Broker::open(config).await.unwrap()
}

#[tokio::test]
async fn keyed_values_land_on_the_expected_partition_in_order() {
    let dir = tempdir().unwrap();
    let broker = test_broker(dir.path()).await;
    broker.create_topic("t", 2).await.unwrap();

    let expected_pid = key_to_partition(b"AAPL", 2);
    let records = vec![
        Record::with_key("AAPL", Bytes::from_static(b"a")),
        Record::with_key("AAPL", Bytes::from_static(b"b")),
        Record::with_key("AAPL", Bytes::from_static(b"c")),
    ];
    let results = broker.produce("t", records).await.unwrap();

    assert_eq!(results, vec![(expected_pid, 0), (expected_pid, 1), (expected_pid, 2)]);

    let fetched = broker.fetch("t", expected_pid, 0, 10, 1 << 20).await.unwrap();
    let values: Vec<&[u8]> = fetched.iter().map(|r| r.value.as_ref()).collect();
    assert_eq!(values, vec![b"a".as_ref(), b"b".as_ref(), b"c".as_ref()]);
}

#[tokio::test]
async fn subscriber_receives_exactly_the_produced_record() {
    let dir = tempdir().unwrap();
    let broker = test_broker(dir.path()).await;
    broker.create_topic("t", 1).await.unwrap();

    let next = broker.describe_partition("t", 0).unwrap().next_offset;
    let subscription = broker.subscribe("t", 0, next).await.unwrap();

    let results = broker
        .produce("t", vec![Record::without_key(Bytes::from_static(b"hello"))])
        .await
        .unwrap();
    let (_, produced_offset) = results[0];

    let received = subscription
        .receiver
        .recv_async()
        .await
        .expect("subscriber should receive the new record");
    assert_eq!(received.offset, produced_offset);
    assert_eq!(received.value, Bytes::from_static(b"hello"));
}

#[tokio::test]
async fn create_topic_is_idempotent_for_matching_partition_count() {
    let dir = tempdir().unwrap();
    let broker = test_broker(dir.path()).await;
    broker.create_topic("t", 3).await.unwrap();
    broker.create_topic("t", 3).await.unwrap();
    assert_eq!(broker.describe_partition("t", 2).unwrap().partition_id, 2);
}
