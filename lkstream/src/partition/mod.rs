//! Owns a sequence of segments, serializes appends, serves ranged reads, and
//! notifies waiters (spec.md §4.2). Grounded on the teacher's
//! `Partition::create` / `persist` / `load` / `get_segments` shape from
//! `integration/tests/streaming/partition.rs`, generalized from iggy's
//! stream/topic/partition triple to this spec's topic/partition pair.

pub mod subscription;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::fs::File;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::error::{LkStreamError, Result};
use crate::metrics::Metrics;
use crate::persister::Persister;
use crate::record::{decode_frame_payload, encode_frame_payload, PolledRecord, Record};
use crate::scheduler::Scheduler;
use crate::storage::hot_tail::{HotTail, HotTailEntry};
use crate::storage::index::{floor_of, Index, IndexEntry};
use crate::storage::segment::{read_frame, Segment};
use crate::storage::FrameError;
use subscription::{SubscriberTable, SubscriptionHandle};

/// `Initializing -> Recovering -> Active -> Draining -> Closed` (spec.md §4.2).
/// Only `Active` accepts appends; `Draining` accepts reads and commits but no
/// new appends; `Closed` rejects everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionLifecycle {
    Initializing,
    Recovering,
    Active,
    Draining,
    Closed,
}

struct SegmentEntry {
    segment: Segment,
    index: Index,
    /// Records written to this segment since the last index entry, for the
    /// sparse indexing policy (`index_every_n`, spec.md §4.2).
    since_last_index_entry: u32,
}

struct AppendState {
    segments: Vec<SegmentEntry>,
    hot_tail: HotTail,
}

struct SegmentSnapshot {
    base_offset: u64,
    current_offset: u64,
    log_path: PathBuf,
    index_entries: Vec<IndexEntry>,
}

pub struct Partition {
    pub topic: String,
    pub partition_id: u32,
    pub partition_path: PathBuf,
    config: Arc<Config>,
    persister: Arc<dyn Persister>,
    scheduler: Arc<Scheduler>,
    metrics: Arc<Metrics>,
    next_offset: AtomicU64,
    unsynced_bytes: AtomicU64,
    append_state: Mutex<AppendState>,
    lifecycle: StdMutex<PartitionLifecycle>,
    notify: Notify,
    subscribers: Arc<SubscriberTable>,
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

impl Partition {
    /// Creates a brand-new partition with a fresh segment at offset 0.
    #[instrument(skip(config, persister, scheduler), fields(topic = %topic, partition_id))]
    pub async fn create(
        topic: String,
        partition_id: u32,
        config: Arc<Config>,
        persister: Arc<dyn Persister>,
        scheduler: Arc<Scheduler>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let partition_path = config.partition_path(&topic, partition_id);
        tokio::fs::create_dir_all(&partition_path).await?;

        let mut segment = Segment::new(topic.clone(), partition_id, 0, &partition_path, persister.clone());
        segment.set_hard_cap(config.segment_max_bytes);
        segment.create().await?;
        let mut index = Index::new(&segment.index_path);
        index.create().await?;

        info!(path = %partition_path.display(), "partition created");

        Ok(Self {
            topic,
            partition_id,
            partition_path,
            config: config.clone(),
            persister,
            scheduler,
            metrics,
            next_offset: AtomicU64::new(0),
            unsynced_bytes: AtomicU64::new(0),
            append_state: Mutex::new(AppendState {
                segments: vec![SegmentEntry {
                    segment,
                    index,
                    since_last_index_entry: 0,
                }],
                hot_tail: HotTail::new(config.hot_tail_entries),
            }),
            lifecycle: StdMutex::new(PartitionLifecycle::Active),
            notify: Notify::new(),
            subscribers: SubscriberTable::new(),
        })
    }

    /// Opens a partition whose segments already exist on disk. Recovery
    /// (spec.md §4.6) is expected to have already truncated any torn write
    /// and rebuilt any missing index before this is called; this just loads
    /// what's there. `segment_bases` is the caller-supplied, already-sorted
    /// list of segment base offsets.
    pub async fn open(
        topic: String,
        partition_id: u32,
        config: Arc<Config>,
        persister: Arc<dyn Persister>,
        scheduler: Arc<Scheduler>,
        metrics: Arc<Metrics>,
        segment_bases: Vec<u64>,
    ) -> Result<Self> {
        let partition_path = config.partition_path(&topic, partition_id);
        let mut segments = Vec::with_capacity(segment_bases.len());
        for (i, base_offset) in segment_bases.iter().enumerate() {
            let mut segment = Segment::new(
                topic.clone(),
                partition_id,
                *base_offset,
                &partition_path,
                persister.clone(),
            );
            segment.set_hard_cap(config.segment_max_bytes);
            segment.load().await?;
            let mut index = Index::new(&segment.index_path);
            index.load().await?;
            if i + 1 < segment_bases.len() {
                segment.seal();
            }
            segments.push(SegmentEntry {
                segment,
                index,
                since_last_index_entry: 0,
            });
        }

        let next_offset = segments
            .last()
            .map(|e| e.segment.current_offset)
            .unwrap_or(0);

        let mut hot_tail = HotTail::new(config.hot_tail_entries);
        if let Some(active) = segments.last_mut() {
            rebuild_hot_tail(active, &mut hot_tail, config.hot_tail_entries).await?;
        }

        Ok(Self {
            topic,
            partition_id,
            partition_path,
            config,
            persister,
            scheduler,
            metrics,
            next_offset: AtomicU64::new(next_offset),
            unsynced_bytes: AtomicU64::new(0),
            append_state: Mutex::new(AppendState { segments, hot_tail }),
            lifecycle: StdMutex::new(PartitionLifecycle::Active),
            notify: Notify::new(),
            subscribers: SubscriberTable::new(),
        })
    }

    pub fn next_offset(&self) -> u64 {
        self.next_offset.load(Ordering::Acquire)
    }

    pub fn lifecycle(&self) -> PartitionLifecycle {
        *self.lifecycle.lock().unwrap()
    }

    pub fn set_lifecycle(&self, state: PartitionLifecycle) {
        *self.lifecycle.lock().unwrap() = state;
    }

    pub fn unsynced_bytes(&self) -> u64 {
        self.unsynced_bytes.load(Ordering::Acquire)
    }

    /// Appends every record in `records` as one atomic batch: all of them
    /// receive consecutive offsets and land adjacently in the segment
    /// (spec.md §4.2). Concurrent callers are serialized by `append_state`'s
    /// mutex; relative ordering across calls is mutex acquisition order.
    #[instrument(skip(self, records), fields(topic = %self.topic, partition_id = self.partition_id, count = records.len()))]
    pub async fn append_many(&self, records: &[Record]) -> Result<Vec<u64>> {
        if self.lifecycle() != PartitionLifecycle::Active {
            return Err(LkStreamError::ClosedPartition {
                topic: self.topic.clone(),
                pid: self.partition_id,
            });
        }
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let mut state = self.append_state.lock().await;
        let mut offsets = Vec::with_capacity(records.len());
        let mut delivered = Vec::with_capacity(records.len());
        let mut bytes_written = 0u64;
        let now = now_micros();

        for record in records {
            let framed_payload = encode_frame_payload(record.key.as_deref(), &record.value);
            let frame_len = crate::storage::segment::FRAME_HEADER_LEN + framed_payload.len() as u64;

            self.maybe_rotate(&mut state, frame_len).await?;

            let entry = state.segments.last_mut().expect("active segment always present");
            let (offset, pos) = entry.segment.append(&framed_payload).await?;

            entry.since_last_index_entry += 1;
            if entry.since_last_index_entry >= self.config.index_every_n || offset == entry.segment.base_offset {
                entry.index.append(offset, pos).await?;
                entry.since_last_index_entry = 0;
            }

            state.hot_tail.push(HotTailEntry {
                offset,
                key: record.key.clone(),
                value: record.value.clone(),
                timestamp_micros: now,
            });

            bytes_written += frame_len;
            offsets.push(offset);
            delivered.push(PolledRecord {
                offset,
                key: record.key.clone(),
                value: record.value.clone(),
                timestamp_micros: now,
            });
        }

        self.next_offset.store(
            state.segments.last().unwrap().segment.current_offset,
            Ordering::Release,
        );

        if self.config.fsync_mode == crate::config::FsyncMode::Sync {
            let entry = state.segments.last_mut().unwrap();
            entry.segment.sync().await?;
            entry.index.sync().await?;
        } else {
            self.unsynced_bytes.fetch_add(bytes_written, Ordering::AcqRel);
        }

        drop(state);

        if self.config.fsync_mode == crate::config::FsyncMode::Group {
            self.scheduler.mark_dirty(&self.topic, self.partition_id, bytes_written);
        }

        self.notify.notify_waiters();
        self.subscribers.notify(&delivered);

        Ok(offsets)
    }

    /// Rotation algorithm (spec.md §4.2): seal the active segment and its
    /// index, then open a fresh segment at `next_offset`, whenever the next
    /// frame would push the active segment past `segment_max_bytes`.
    async fn maybe_rotate(&self, state: &mut AppendState, incoming_frame_len: u64) -> Result<()> {
        let should_rotate = {
            let active = state.segments.last().unwrap();
            !active.segment.is_empty()
                && active.segment.size_bytes + incoming_frame_len > self.config.segment_max_bytes
        };
        if !should_rotate {
            return Ok(());
        }

        let (sealed_base_offset, base_offset) = {
            let active = state.segments.last_mut().unwrap();
            active.segment.sync().await?;
            active.index.sync().await?;
            active.segment.seal();
            (active.segment.base_offset, active.segment.current_offset)
        };

        let mut segment = Segment::new(
            self.topic.clone(),
            self.partition_id,
            base_offset,
            &self.partition_path,
            self.persister.clone(),
        );
        segment.set_hard_cap(self.config.segment_max_bytes);
        segment.create().await?;
        let mut index = Index::new(&segment.index_path);
        index.create().await?;

        write_checkpoint(&self.partition_path, sealed_base_offset, base_offset)
            .await
            .ok();
        self.metrics.record_segment_rotated();
        info!(base_offset, "segment rotated");
        state.segments.push(SegmentEntry {
            segment,
            index,
            since_last_index_entry: 0,
        });
        Ok(())
    }

    /// Reads up to `max_msgs` records (and no more than `max_bytes` total)
    /// starting at `offset`. Serves from the hot tail when possible, falls
    /// back to disk otherwise (spec.md §4.2).
    #[instrument(skip(self), fields(topic = %self.topic, partition_id = self.partition_id, offset))]
    pub async fn read_from(
        &self,
        offset: u64,
        max_msgs: usize,
        max_bytes: usize,
    ) -> Result<Vec<PolledRecord>> {
        let next = self.next_offset();
        if offset >= next {
            return Ok(Vec::new());
        }

        let (hot_hit, snapshot, earliest_base) = {
            let state = self.append_state.lock().await;
            let hot_hit = state.hot_tail.get_from(offset);
            let snapshot: Vec<SegmentSnapshot> = state
                .segments
                .iter()
                .map(|e| SegmentSnapshot {
                    base_offset: e.segment.base_offset,
                    current_offset: e.segment.current_offset,
                    log_path: e.segment.log_path.clone(),
                    index_entries: e.index.snapshot(),
                })
                .collect();
            let earliest_base = snapshot.first().map(|s| s.base_offset).unwrap_or(0);
            (hot_hit, snapshot, earliest_base)
        };

        if let Some(entries) = hot_hit {
            return Ok(trim(
                entries.into_iter().map(|e| PolledRecord {
                    offset: e.offset,
                    key: e.key,
                    value: e.value,
                    timestamp_micros: e.timestamp_micros,
                }),
                max_msgs,
                max_bytes,
            ));
        }

        if offset < earliest_base {
            return Err(LkStreamError::OffsetOutOfRange {
                offset,
                earliest: earliest_base,
                next,
            });
        }

        let seg_idx = snapshot
            .iter()
            .position(|s| offset >= s.base_offset && offset < s.current_offset)
            .ok_or(LkStreamError::OffsetOutOfRange {
                offset,
                earliest: earliest_base,
                next,
            })?;

        let mut out = Vec::new();
        let mut bytes_used = 0usize;

        'segments: for seg in &snapshot[seg_idx..] {
            if out.len() >= max_msgs {
                break;
            }
            let mut file = File::open(&seg.log_path).await?;
            let start_offset = offset.max(seg.base_offset);
            let floor = floor_of(&seg.index_entries, start_offset);
            let mut pos = floor.map(|e| e.pos).unwrap_or(0);
            let mut cur_offset = floor.map(|e| e.offset).unwrap_or(seg.base_offset);

            while cur_offset < seg.current_offset {
                match read_frame(&mut file, pos).await {
                    Ok((payload, next_pos)) => {
                        if cur_offset >= start_offset {
                            if out.len() >= max_msgs {
                                break 'segments;
                            }
                            let (key, value) = decode_frame_payload(payload);
                            let size = value.len() + key.as_ref().map(|k| k.len()).unwrap_or(0);
                            if bytes_used.saturating_add(size) > max_bytes && !out.is_empty() {
                                break 'segments;
                            }
                            bytes_used = bytes_used.saturating_add(size);
                            out.push(PolledRecord {
                                offset: cur_offset,
                                key,
                                value,
                                timestamp_micros: 0,
                            });
                        }
                        pos = next_pos;
                        cur_offset += 1;
                    }
                    Err(FrameError::Torn) => {
                        warn!(offset = cur_offset, "torn frame encountered during live read, truncating result");
                        break 'segments;
                    }
                    Err(FrameError::Io(e)) => return Err(e.into()),
                }
            }
        }

        Ok(out)
    }

    /// Blocks until `next_offset > offset` or `timeout` elapses. Correct
    /// under the usual Tokio `Notify` race: register interest before
    /// re-checking the condition.
    pub async fn wait_for_offset(&self, offset: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if self.next_offset() > offset {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return false;
            }
        }
    }

    /// Registers a waiter that is woken after every successful append batch
    /// whose offsets it is interested in (spec.md §4.2). Delivers any
    /// already-available backlog from `from_offset` before live-tailing.
    pub async fn subscribe(&self, from_offset: u64) -> Result<SubscriptionHandle> {
        let (id, rx) = self.subscribers.register(from_offset);
        let backlog = self.read_from(from_offset, usize::MAX, usize::MAX).await?;
        self.subscribers.deliver_backlog(id, &backlog);
        Ok(SubscriptionHandle::new(id, self.subscribers.clone(), rx))
    }

    pub async fn sealed_segment_count(&self) -> usize {
        self.append_state
            .lock()
            .await
            .segments
            .iter()
            .filter(|e| e.segment.is_closed)
            .count()
    }

    pub async fn total_size_bytes(&self) -> u64 {
        self.append_state
            .lock()
            .await
            .segments
            .iter()
            .map(|e| e.segment.size_bytes)
            .sum()
    }

    /// Used by the group-commit scheduler: syncs the active segment and its
    /// index, clearing the unsynced byte counter (spec.md §4.3).
    pub async fn sync(&self) -> Result<u64> {
        let mut state = self.append_state.lock().await;
        let durable_up_to = state.segments.last().unwrap().segment.current_offset;
        for entry in state.segments.iter_mut() {
            if !entry.segment.is_closed || entry.segment.size_bytes > 0 {
                entry.segment.sync().await?;
                entry.index.sync().await?;
            }
        }
        self.unsynced_bytes.store(0, Ordering::Release);
        debug!(durable_up_to, "partition synced");
        Ok(durable_up_to)
    }

    /// Deletes the oldest sealed segment, used by retention (spec.md §10).
    /// Never deletes the active segment.
    pub async fn delete_oldest_segment(&self) -> Result<Option<u64>> {
        let mut state = self.append_state.lock().await;
        if state.segments.len() <= 1 {
            return Ok(None);
        }
        let removed = state.segments.remove(0);
        tokio::fs::remove_file(&removed.segment.log_path).await.ok();
        tokio::fs::remove_file(&removed.segment.index_path).await.ok();
        info!(base_offset = removed.segment.base_offset, "segment deleted by retention");
        Ok(Some(removed.segment.base_offset))
    }

    /// Path of the oldest segment's log file, used by retention to read a
    /// mtime-based age (spec.md has no per-record timestamp index).
    pub async fn oldest_segment_log_path(&self) -> Option<PathBuf> {
        self.append_state
            .lock()
            .await
            .segments
            .first()
            .map(|e| e.segment.log_path.clone())
    }

    pub async fn earliest_retained_base(&self) -> u64 {
        self.append_state
            .lock()
            .await
            .segments
            .first()
            .map(|e| e.segment.base_offset)
            .unwrap_or(0)
    }
}

fn trim(
    iter: impl Iterator<Item = PolledRecord>,
    max_msgs: usize,
    max_bytes: usize,
) -> Vec<PolledRecord> {
    let mut out = Vec::new();
    let mut bytes_used = 0usize;
    for record in iter {
        if out.len() >= max_msgs {
            break;
        }
        let size = record.value.len() + record.key.as_ref().map(|k| k.len()).unwrap_or(0);
        if bytes_used.saturating_add(size) > max_bytes && !out.is_empty() {
            break;
        }
        bytes_used = bytes_used.saturating_add(size);
        out.push(record);
    }
    out
}

/// Advisory checkpoint written next to a partition's segments (spec.md §6):
/// the last sealed segment's base offset and the offset that was active at
/// seal time. Recovery correctness never depends on this file — it scans
/// segments from scratch regardless — so write failures here are ignored by
/// the caller rather than surfaced as `IO`.
async fn write_checkpoint(partition_path: &std::path::Path, sealed_base_offset: u64, last_offset: u64) -> Result<()> {
    let path = partition_path.join("checkpoint.meta");
    let mut buf = [0u8; 16];
    buf[0..8].copy_from_slice(&sealed_base_offset.to_be_bytes());
    buf[8..16].copy_from_slice(&last_offset.to_be_bytes());
    tokio::fs::write(path, buf).await?;
    Ok(())
}

/// Rebuilds the hot tail by reading the last `capacity` frames of the active
/// segment (spec.md §4.6 step 6).
async fn rebuild_hot_tail(
    active: &mut SegmentEntry,
    hot_tail: &mut HotTail,
    capacity: usize,
) -> Result<()> {
    if active.segment.is_empty() {
        return Ok(());
    }
    let start_offset = active
        .segment
        .current_offset
        .saturating_sub(capacity as u64)
        .max(active.segment.base_offset);
    let floor = floor_of(&active.index.snapshot(), start_offset);
    let mut pos = floor.map(|e| e.pos).unwrap_or(0);
    let mut cur_offset = floor.map(|e| e.offset).unwrap_or(active.segment.base_offset);

    while cur_offset < active.segment.current_offset {
        match active.segment.read_frame_at(pos).await {
            Ok((payload, next_pos)) => {
                let (key, value) = decode_frame_payload(payload);
                hot_tail.push(HotTailEntry {
                    offset: cur_offset,
                    key,
                    value,
                    timestamp_micros: 0,
                });
                pos = next_pos;
                cur_offset += 1;
            }
            Err(_) => break,
        }
    }
    Ok(())
}
