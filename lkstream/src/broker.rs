//! Top-level entry point: owns every topic, routes produced records to a
//! partition, and enforces backpressure (spec.md §4.4, §6). Grounded on
//! `server/src/binary/command.rs`'s `streaming::system::System`, the single
//! owning object every command handler is dispatched through, generalized
//! from iggy's stream/topic hierarchy down to this spec's flat topic map.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::error::{LkStreamError, Result};
use crate::hash::key_to_partition;
use crate::metrics::Metrics;
use crate::offsets::OffsetStore;
use crate::partition::subscription::SubscriptionHandle;
use crate::partition::{Partition, PartitionLifecycle};
use crate::persister::{FilePersister, FileWithSyncPersister, Persister};
use crate::record::{PolledRecord, Record};
use crate::recovery;
use crate::scheduler::Scheduler;
use crate::topic::Topic;

pub struct Broker {
    config: Arc<Config>,
    persister: Arc<dyn Persister>,
    scheduler: Arc<Scheduler>,
    topics: DashMap<String, Arc<Topic>>,
    offsets: Arc<OffsetStore>,
    inflight_bytes: AtomicU64,
    metrics: Arc<Metrics>,
    closed: std::sync::atomic::AtomicBool,
}

impl Broker {
    /// Opens every topic already present under `config.persist_dir`, running
    /// recovery (spec.md §4.6) on each partition before it accepts traffic.
    #[instrument(skip(config))]
    pub async fn open(config: Config) -> Result<Arc<Self>> {
        let config = Arc::new(config);
        let persister: Arc<dyn Persister> = match config.fsync_mode {
            crate::config::FsyncMode::Sync => Arc::new(FileWithSyncPersister),
            _ => Arc::new(FilePersister),
        };

        let scheduler = Scheduler::new(config.clone());
        let metrics = Arc::new(Metrics::default());

        let offsets = Arc::new(OffsetStore::new(config.offsets_dir()));
        offsets.init().await?;

        let topics_root = config.persist_dir.join("topics");
        let topics = DashMap::new();
        if let Ok(mut entries) = tokio::fs::read_dir(&topics_root).await {
            while let Some(entry) = entries.next_entry().await? {
                if !entry.file_type().await?.is_dir() {
                    continue;
                }
                let topic_name = entry.file_name().to_string_lossy().into_owned();
                let topic = Self::open_topic(
                    &topic_name,
                    &config,
                    persister.clone(),
                    scheduler.clone(),
                    metrics.clone(),
                )
                .await?;
                topics.insert(topic_name, Arc::new(topic));
            }
        }

        info!(topics = topics.len(), "broker opened");
        Ok(Arc::new(Self {
            config,
            persister,
            scheduler,
            topics,
            offsets,
            inflight_bytes: AtomicU64::new(0),
            metrics,
            closed: std::sync::atomic::AtomicBool::new(false),
        }))
    }

    async fn open_topic(
        name: &str,
        config: &Arc<Config>,
        persister: Arc<dyn Persister>,
        scheduler: Arc<Scheduler>,
        metrics: Arc<Metrics>,
    ) -> Result<Topic> {
        let topic_path = config.persist_dir.join("topics").join(name);
        let mut partitions = Vec::new();
        let mut pid = 0u32;
        loop {
            let partition_path = topic_path.join(format!("part{pid}"));
            if !tokio::fs::try_exists(&partition_path).await? {
                break;
            }
            let bases = recovery::recover_partition(name, pid, config, persister.clone()).await?;
            let partition = Partition::open(
                name.to_string(),
                pid,
                config.clone(),
                persister.clone(),
                scheduler.clone(),
                metrics.clone(),
                bases,
            )
            .await?;
            partitions.push(Arc::new(partition));
            pid += 1;
        }
        Ok(Topic::from_partitions(name.to_string(), partitions))
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// The group-commit scheduler serving every partition this broker owns.
    /// The caller is expected to drive [`Scheduler::run`] in a background
    /// task alongside the broker (see `main.rs`).
    pub fn scheduler(&self) -> Arc<Scheduler> {
        self.scheduler.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stops accepting new appends; existing reads, subscriptions, and
    /// offset commits keep working (spec.md §4.2's `Draining` state, applied
    /// broker-wide).
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for topic in self.topics.iter() {
            for partition in &topic.partitions {
                partition.set_lifecycle(PartitionLifecycle::Draining);
            }
        }
    }

    pub fn list_topics(&self) -> Vec<String> {
        self.topics.iter().map(|e| e.key().clone()).collect()
    }

    pub fn topic(&self, name: &str) -> Option<Arc<Topic>> {
        self.topics.get(name).map(|e| e.clone())
    }

    pub fn partition(&self, topic: &str, pid: u32) -> Result<Arc<Partition>> {
        let topic = self
            .topics
            .get(topic)
            .ok_or_else(|| LkStreamError::TopicUnknown(topic.to_string()))?;
        Ok(topic.partition(pid)?.clone())
    }

    /// Creates a topic with a fixed partition count. Calling this again for
    /// an existing name with a different count is a conflict (spec.md §4.4);
    /// calling it again with the same count is a harmless no-op, matching
    /// idempotent-create semantics administrators expect.
    #[instrument(skip(self))]
    pub async fn create_topic(&self, name: &str, partition_count: u32) -> Result<()> {
        if self.is_closed() {
            return Err(LkStreamError::ClosedBroker);
        }
        if let Some(existing) = self.topics.get(name) {
            if existing.partition_count() != partition_count {
                return Err(LkStreamError::TopicExistsConflict(name.to_string()));
            }
            return Ok(());
        }

        let topic = Topic::create(
            name.to_string(),
            partition_count,
            self.config.clone(),
            self.persister.clone(),
            self.scheduler.clone(),
            self.metrics.clone(),
        )
        .await?;
        self.topics.insert(name.to_string(), Arc::new(topic));
        info!(topic = name, partition_count, "topic created");
        Ok(())
    }

    /// Appends every record in `records` to `topic`, routing each by key
    /// (spec.md §4.4: `hash(key) % partition_count`) or by round robin when
    /// unkeyed. Consecutive records that land on the same partition are
    /// appended together as one batch so their offsets stay adjacent;
    /// returns `(partition_id, offset)` in the same order as `records`.
    #[instrument(skip(self, records), fields(topic, count = records.len()))]
    pub async fn produce(&self, topic: &str, records: Vec<Record>) -> Result<Vec<(u32, u64)>> {
        if self.is_closed() {
            return Err(LkStreamError::ClosedBroker);
        }
        let topic_handle = self
            .topics
            .get(topic)
            .ok_or_else(|| LkStreamError::TopicUnknown(topic.to_string()))?
            .clone();

        let batch_bytes: u64 = records
            .iter()
            .map(|r| r.value.len() as u64 + r.key.as_ref().map(|k| k.len()).unwrap_or(0) as u64)
            .sum();
        self.admit_inflight(batch_bytes)?;
        let _guard = InflightGuard {
            broker: self,
            bytes: batch_bytes,
        };

        let mut results = vec![(0u32, 0u64); records.len()];
        let mut i = 0;
        while i < records.len() {
            let pid = match &records[i].key {
                Some(key) => key_to_partition(key, topic_handle.partition_count()),
                None => topic_handle.next_round_robin(),
            };

            let mut run_end = i + 1;
            let mut run = vec![records[i].clone()];
            while run_end < records.len() {
                let next_pid = match &records[run_end].key {
                    Some(key) => key_to_partition(key, topic_handle.partition_count()),
                    None => break, // unkeyed records each get their own round-robin slot
                };
                if next_pid != pid {
                    break;
                }
                run.push(records[run_end].clone());
                run_end += 1;
            }

            let run_bytes: u64 = run
                .iter()
                .map(|r| r.value.len() as u64 + r.key.as_ref().map(|k| k.len()).unwrap_or(0) as u64)
                .sum();
            let partition = topic_handle.partition(pid)?;
            let offsets = partition.append_many(&run).await?;
            self.metrics.record_append(offsets.len() as u64, run_bytes);
            for (j, offset) in offsets.into_iter().enumerate() {
                results[i + j] = (pid, offset);
            }
            i = run_end;
        }

        Ok(results)
    }

    fn admit_inflight(&self, bytes: u64) -> Result<()> {
        let current = self.inflight_bytes.fetch_add(bytes, Ordering::AcqRel);
        if current + bytes > self.config.inflight_max_bytes {
            self.inflight_bytes.fetch_sub(bytes, Ordering::AcqRel);
            self.metrics.record_backpressure_rejection();
            warn!("produce rejected: inflight bytes would exceed configured cap");
            return Err(LkStreamError::Backpressure);
        }
        Ok(())
    }

    pub async fn fetch(
        &self,
        topic: &str,
        pid: u32,
        offset: u64,
        max_msgs: usize,
        max_bytes: usize,
    ) -> Result<Vec<PolledRecord>> {
        let partition = self.partition(topic, pid)?;
        let records = partition.read_from(offset, max_msgs, max_bytes).await?;
        self.metrics.record_read(records.len() as u64);
        Ok(records)
    }

    /// Blocks the caller until `next_offset > offset` or `timeout` elapses —
    /// the long-poll building block for a fetch API (spec.md §4.2).
    pub async fn wait_for_offset(&self, topic: &str, pid: u32, offset: u64, timeout: Duration) -> Result<bool> {
        let partition = self.partition(topic, pid)?;
        Ok(partition.wait_for_offset(offset, timeout).await)
    }

    pub async fn subscribe(&self, topic: &str, pid: u32, from_offset: u64) -> Result<SubscriptionHandle> {
        let partition = self.partition(topic, pid)?;
        partition.subscribe(from_offset).await
    }

    pub async fn commit_offset(&self, group: &str, topic: &str, pid: u32, offset: u64) -> Result<()> {
        let partition = self.partition(topic, pid)?;
        self.offsets
            .commit(group, topic, pid, offset, partition.next_offset())
            .await
    }

    pub async fn read_committed_offset(&self, group: &str, topic: &str, pid: u32) -> Result<Option<u64>> {
        self.offsets.read_committed(group, topic, pid).await
    }

    pub fn describe_partition(&self, topic: &str, pid: u32) -> Result<PartitionDescriptor> {
        let partition = self.partition(topic, pid)?;
        Ok(PartitionDescriptor {
            topic: topic.to_string(),
            partition_id: pid,
            next_offset: partition.next_offset(),
            lifecycle: partition.lifecycle(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct PartitionDescriptor {
    pub topic: String,
    pub partition_id: u32,
    pub next_offset: u64,
    pub lifecycle: PartitionLifecycle,
}

struct InflightGuard<'a> {
    broker: &'a Broker,
    bytes: u64,
}

impl<'a> Drop for InflightGuard<'a> {
    fn drop(&mut self) {
        self.broker.inflight_bytes.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::tempdir;

    async fn test_broker(dir: &std::path::Path) -> Arc<Broker> {
        let mut config = Config::load(None).unwrap();
        config.persist_dir = dir.to_path_buf();
        config.segment_max_bytes = 1024 * 1024;
        Broker::open(config).await.unwrap()
    }

    #[tokio::test]
    async fn creates_topic_and_produces_and_fetches() {
        let dir = tempdir().unwrap();
        let broker = test_broker(dir.path()).await;
        broker.create_topic("orders", 4).await.unwrap();

        let records = vec![
            Record::with_key("AAPL", "buy 10"),
            Record::without_key("heartbeat"),
        ];
        let results = broker.produce("orders", records).await.unwrap();
        assert_eq!(results.len(), 2);

        let (pid, offset) = results[0];
        let fetched = broker.fetch("orders", pid, offset, 10, 1 << 20).await.unwrap();
        assert_eq!(fetched[0].value, Bytes::from_static(b"buy 10"));
    }

    #[tokio::test]
    async fn rejects_duplicate_topic_with_different_partition_count() {
        let dir = tempdir().unwrap();
        let broker = test_broker(dir.path()).await;
        broker.create_topic("orders", 4).await.unwrap();
        let result = broker.create_topic("orders", 8).await;
        assert!(matches!(result, Err(LkStreamError::TopicExistsConflict(_))));
    }

    #[tokio::test]
    async fn same_key_always_routes_to_same_partition() {
        let dir = tempdir().unwrap();
        let broker = test_broker(dir.path()).await;
        broker.create_topic("orders", 4).await.unwrap();

        let first = broker
            .produce("orders", vec![Record::with_key("AAPL", "1")])
            .await
            .unwrap();
        let second = broker
            .produce("orders", vec![Record::with_key("AAPL", "2")])
            .await
            .unwrap();
        assert_eq!(first[0].0, second[0].0);
    }

    #[tokio::test]
    async fn commit_offset_rejects_beyond_next_offset() {
        let dir = tempdir().unwrap();
        let broker = test_broker(dir.path()).await;
        broker.create_topic("orders", 1).await.unwrap();
        let result = broker.commit_offset("g1", "orders", 0, 5).await;
        assert!(matches!(result, Err(LkStreamError::OffsetOutOfRange { .. })));
    }
}
