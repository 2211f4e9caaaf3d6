//! Property 4 (idempotent recovery) and property 5 (crash safety): reopening
//! a broker against the same `persist_dir` reconstructs identical state, and
//! a torn tail write never surfaces to a reader after restart.

use bytes::Bytes;
use lkstream::config::Config;
use lkstream::{Broker, Record};
use tempfile::tempdir;
use tokio::io::AsyncWriteExt;

fn config_for(dir: &std::path::Path) -> Config {
    let mut config = Config::load(None).unwrap();
    config.persist_dir = dir.to_path_buf();
    config
}

#[tokio::test]
async fn reopening_an_unchanged_partition_reproduces_next_offset() {
    let dir = tempdir().unwrap();

    {
        let broker = Broker::open(config_for(dir.path())).await.unwrap();
        broker.create_topic("t", 1).await.unwrap();
        broker
            .produce(
                "t",
                vec![
                    Record::without_key(Bytes::from_static(b"one")),
                    Record::without_key(Bytes::from_static(b"two")),
                ],
            )
            .await
            .unwrap();
    }

    let reopened = Broker::open(config_for(dir.path())).await.unwrap();
    assert_eq!(reopened.describe_partition("t", 0).unwrap().next_offset, 2);

    let reopened_again = Broker::open(config_for(dir.path())).await.unwrap();
    assert_eq!(
        reopened_again.describe_partition("t", 0).unwrap().next_offset,
        2
    );
}

#[tokio::test]
async fn torn_tail_write_is_truncated_and_never_read() {
    let dir = tempdir().unwrap();
    let config = config_for(dir.path());

    {
        let broker = Broker::open(config.clone()).await.unwrap();
        broker.create_topic("t", 1).await.unwrap();
        broker
            .produce("t", vec![Record::without_key(Bytes::from_static(b"good"))])
            .await
            .unwrap();
    }

    let log_path = config.partition_path("t", 0).join(format!("{:020}.seg", 0));
    let mut file = tokio::fs::OpenOptions::new()
        .append(true)
        .open(&log_path)
        .await
        .unwrap();
    file.write_all(&500u32.to_be_bytes()).await.unwrap();
    file.write_all(b"partial").await.unwrap();
    file.flush().await.unwrap();
    drop(file);

    let recovered = Broker::open(config).await.unwrap();
    assert_eq!(recovered.describe_partition("t", 0).unwrap().next_offset, 1);
    let fetched = recovered.fetch("t", 0, 0, 10, 1 << 20).await.unwrap();
    assert_eq!(fetched.len(), 1);
    assert_eq!(fetched[0].value, Bytes::from_static(b"good"));
}
