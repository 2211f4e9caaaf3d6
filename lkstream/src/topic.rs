//! A named topic: a fixed-cardinality array of [`Partition`]s created once at
//! topic-creation time and never resized (spec.md §4.4).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::Config;
use crate::error::{LkStreamError, Result};
use crate::metrics::Metrics;
use crate::partition::Partition;
use crate::persister::Persister;
use crate::scheduler::Scheduler;

pub struct Topic {
    pub name: String,
    pub partitions: Vec<Arc<Partition>>,
    /// Round-robin cursor for unkeyed produce calls (spec.md §4.4). Seeded
    /// from wall-clock time at topic construction rather than always 0, so
    /// two brokers started together don't pile every first unkeyed record
    /// onto partition 0.
    round_robin: AtomicU32,
}

impl Topic {
    pub fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }

    /// Picks the next partition for an unkeyed record.
    pub fn next_round_robin(&self) -> u32 {
        self.round_robin.fetch_add(1, Ordering::Relaxed) % self.partition_count()
    }

    pub fn partition(&self, pid: u32) -> Result<&Arc<Partition>> {
        self.partitions
            .get(pid as usize)
            .ok_or_else(|| LkStreamError::PartitionUnknown {
                topic: self.name.clone(),
                pid,
            })
    }

    /// Creates every partition's first segment up front; spec.md §4.4 treats
    /// partition count as fixed for the lifetime of the topic.
    pub async fn create(
        name: String,
        partition_count: u32,
        config: Arc<Config>,
        persister: Arc<dyn Persister>,
        scheduler: Arc<Scheduler>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let mut partitions = Vec::with_capacity(partition_count as usize);
        for pid in 0..partition_count {
            let partition = Partition::create(
                name.clone(),
                pid,
                config.clone(),
                persister.clone(),
                scheduler.clone(),
                metrics.clone(),
            )
            .await?;
            partitions.push(Arc::new(partition));
        }
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos();
        Ok(Self {
            name,
            partitions,
            round_robin: AtomicU32::new(seed),
        })
    }

    /// Reconstructs a topic from partitions already recovered from disk.
    pub fn from_partitions(name: String, partitions: Vec<Arc<Partition>>) -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos();
        Self {
            name,
            partitions,
            round_robin: AtomicU32::new(seed),
        }
    }
}
