//! A single append-only segment file: `[u32_be len][len bytes payload]...`
//! (spec.md §4.1). Grounded on the teacher's segment test naming
//! (`should_persist_segment`, `LOG_EXTENSION`, `start_offset` /
//! `current_offset` / `end_offset` / `is_closed` fields) and on the
//! append/read shape of `proglog-rs`'s `Segment`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::{debug, info, instrument};

use crate::error::{LkStreamError, Result};
use crate::persister::Persister;
use crate::storage::FrameError;

pub const LOG_EXTENSION: &str = "seg";
pub const INDEX_EXTENSION: &str = "idx";

/// Length header size, in bytes, preceding every frame's payload.
pub const FRAME_HEADER_LEN: u64 = 4;

fn segment_stem(base_offset: u64) -> String {
    format!("{base_offset:020}")
}

pub fn log_path(partition_path: &Path, base_offset: u64) -> PathBuf {
    partition_path.join(format!("{}.{}", segment_stem(base_offset), LOG_EXTENSION))
}

pub fn index_path(partition_path: &Path, base_offset: u64) -> PathBuf {
    partition_path.join(format!("{}.{}", segment_stem(base_offset), INDEX_EXTENSION))
}

/// One contiguous offset range `[base_offset, base_offset + count)` for a
/// partition. A segment is either active (open, appendable) or sealed
/// (closed, read-only).
pub struct Segment {
    pub topic: String,
    pub partition_id: u32,
    pub base_offset: u64,
    /// One past the highest offset written so far (== base_offset when empty).
    pub current_offset: u64,
    pub size_bytes: u64,
    pub is_closed: bool,
    pub log_path: PathBuf,
    pub index_path: PathBuf,

    /// Hard cap on `size_bytes` an append may never cross (spec.md §4.1:
    /// `Segment.append` "fails with `StorageFull` if a configured cap is
    /// reached"). The partition rotates well before this is hit in normal
    /// operation; this is the last-resort check for whatever causes it not
    /// to — defaults to `u64::MAX` (no cap) until [`Self::set_hard_cap`] is
    /// called.
    hard_cap_bytes: u64,

    persister: Arc<dyn Persister>,
    log_file: Option<File>,
}

impl Segment {
    /// Builds an in-memory handle; does not touch disk. Call [`Segment::create`]
    /// to materialize new files or [`Segment::load`] to open existing ones.
    pub fn new(
        topic: String,
        partition_id: u32,
        base_offset: u64,
        partition_path: &Path,
        persister: Arc<dyn Persister>,
    ) -> Self {
        Self {
            topic,
            partition_id,
            base_offset,
            current_offset: base_offset,
            size_bytes: 0,
            is_closed: false,
            log_path: log_path(partition_path, base_offset),
            index_path: index_path(partition_path, base_offset),
            hard_cap_bytes: u64::MAX,
            persister,
            log_file: None,
        }
    }

    /// Sets the hard byte cap this segment's file may never cross.
    pub fn set_hard_cap(&mut self, cap: u64) {
        self.hard_cap_bytes = cap;
    }

    /// Creates the backing files for a brand-new segment.
    #[instrument(skip(self), fields(base_offset = self.base_offset))]
    pub async fn create(&mut self) -> Result<()> {
        let log_file = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .truncate(false)
            .open(&self.log_path)
            .await?;
        // Touching the index file ensures recovery always finds a (possibly
        // empty) companion index next to every log file.
        OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.index_path)
            .await?;
        self.log_file = Some(log_file);
        info!(path = %self.log_path.display(), "segment created");
        Ok(())
    }

    /// Opens an existing segment's log file for further appends or reads.
    /// Does not inspect or rebuild the index; that is [`crate::recovery`]'s job.
    pub async fn load(&mut self) -> Result<()> {
        let log_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.log_path)
            .await?;
        let size_bytes = log_file.metadata().await?.len();
        self.size_bytes = size_bytes;
        self.log_file = Some(log_file);
        Ok(())
    }

    fn file_mut(&mut self) -> &mut File {
        self.log_file.as_mut().expect("segment log file not open")
    }

    /// Appends `payload` as a single length-prefixed frame, returning the
    /// byte position of the frame's length header (what the index stores)
    /// and the offset assigned to this record.
    #[instrument(skip(self, payload), fields(base_offset = self.base_offset, len = payload.len()))]
    pub async fn append(&mut self, payload: &[u8]) -> Result<(u64, u64)> {
        if self.is_closed {
            return Err(LkStreamError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "append to sealed segment",
            )));
        }

        let frame_len = FRAME_HEADER_LEN + payload.len() as u64;
        if self.size_bytes + frame_len > self.hard_cap_bytes {
            return Err(LkStreamError::StorageFull);
        }

        let pos = self.size_bytes;
        let mut framed = BytesMut::with_capacity(FRAME_HEADER_LEN as usize + payload.len());
        framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        framed.extend_from_slice(payload);

        let file = self.file_mut();
        self.persister.append(file, &framed).await?;

        let offset = self.current_offset;
        self.current_offset += 1;
        self.size_bytes += framed.len() as u64;
        debug!(offset, pos, "frame appended");
        Ok((offset, pos))
    }

    /// Flushes OS buffers to stable storage. Latency is observable and
    /// bounded — the group-commit scheduler is the only caller in `group`
    /// mode (spec.md §4.3).
    pub async fn sync(&mut self) -> Result<()> {
        let file = self.file_mut();
        self.persister.sync(file).await
    }

    /// Reads the frame whose length header starts at `pos`.
    /// Returns `Torn` if fewer than 4 bytes remain or the declared length
    /// runs past the end of file — the recovery signal from spec.md §4.1.
    pub(crate) async fn read_frame_at(
        &mut self,
        pos: u64,
    ) -> std::result::Result<(Bytes, u64), FrameError> {
        let file = self.file_mut();
        read_frame(file, pos).await
    }

    pub fn seal(&mut self) {
        self.is_closed = true;
    }

    pub fn count(&self) -> u64 {
        self.current_offset - self.base_offset
    }

    pub fn is_empty(&self) -> bool {
        self.current_offset == self.base_offset
    }

    pub fn contains_offset(&self, offset: u64) -> bool {
        offset >= self.base_offset && offset < self.current_offset
    }

    /// Truncates the log to `len` bytes, used by recovery to discard a torn
    /// write at the tail (spec.md §4.6).
    pub async fn truncate_to(&mut self, len: u64) -> Result<()> {
        let file = self.file_mut();
        file.set_len(len).await?;
        file.seek(SeekFrom::Start(len)).await?;
        self.size_bytes = len;
        Ok(())
    }
}

/// Standalone frame reader shared by live reads and recovery scans — both
/// need identical torn-write detection (spec.md §4.1 / §4.6).
pub(crate) async fn read_frame(
    file: &mut File,
    pos: u64,
) -> std::result::Result<(Bytes, u64), FrameError> {
    let file_len = file.metadata().await?.len();
    if pos + FRAME_HEADER_LEN > file_len {
        return Err(FrameError::Torn);
    }

    file.seek(SeekFrom::Start(pos)).await?;
    let mut header = [0u8; 4];
    file.read_exact(&mut header).await?;
    let len = u32::from_be_bytes(header) as u64;

    if pos + FRAME_HEADER_LEN + len > file_len {
        return Err(FrameError::Torn);
    }

    let mut payload = vec![0u8; len as usize];
    file.read_exact(&mut payload).await?;
    let next_pos = pos + FRAME_HEADER_LEN + len;
    Ok((Bytes::from(payload), next_pos))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persister::FilePersister;
    use tempfile::tempdir;

    #[tokio::test]
    async fn persists_and_reloads() {
        let dir = tempdir().unwrap();
        let mut segment = Segment::new(
            "orders".into(),
            0,
            0,
            dir.path(),
            Arc::new(FilePersister),
        );
        segment.create().await.unwrap();
        let (offset, pos) = segment.append(b"hello").await.unwrap();
        assert_eq!(offset, 0);
        assert_eq!(pos, 0);
        segment.sync().await.unwrap();

        let mut reloaded = Segment::new("orders".into(), 0, 0, dir.path(), Arc::new(FilePersister));
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.size_bytes, segment.size_bytes);
        let (payload, next_pos) = reloaded.read_frame_at(0).await.unwrap();
        assert_eq!(&payload[..], b"hello");
        assert_eq!(next_pos, segment.size_bytes);
    }

    #[tokio::test]
    async fn append_fails_with_storage_full_past_hard_cap() {
        let dir = tempdir().unwrap();
        let mut segment = Segment::new("orders".into(), 0, 0, dir.path(), Arc::new(FilePersister));
        segment.create().await.unwrap();
        segment.set_hard_cap(10);

        segment.append(b"hello").await.unwrap(); // 4 + 5 = 9 bytes, under the cap
        let err = segment.append(b"x").await.unwrap_err();
        assert!(matches!(err, LkStreamError::StorageFull));
    }

    #[tokio::test]
    async fn read_frame_reports_torn_write() {
        let dir = tempdir().unwrap();
        let mut segment = Segment::new("t".into(), 0, 0, dir.path(), Arc::new(FilePersister));
        segment.create().await.unwrap();
        // Write a length header claiming 100 bytes of payload but only write 2.
        let file = segment.file_mut();
        file.write_all(&100u32.to_be_bytes()).await.unwrap();
        file.write_all(b"hi").await.unwrap();
        file.flush().await.unwrap();

        let result = segment.read_frame_at(0).await;
        assert!(matches!(result, Err(FrameError::Torn)));
    }
}
