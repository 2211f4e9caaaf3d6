//! Durable consumer-group offset storage (spec.md §4.5). One file per
//! `(group, topic, partition)` under `persist_dir/offsets/`, committed with
//! a tmp-write + fsync + rename + directory-fsync protocol: the tmp-then-
//! rename shape follows `persistence.rs`'s `Source::maybe_flush` pattern of
//! writing to a `-tmp` path and renaming it into place once complete, with
//! the `fsync` calls this crate's durability guarantee needs added around it.

use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, instrument};

use crate::error::{LkStreamError, Result};

pub struct OffsetStore {
    root: PathBuf,
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

impl OffsetStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// `{group}__{topic}__part{pid}.offset`, matching spec.md §6's
    /// authoritative on-disk layout exactly.
    fn path_for(&self, group: &str, topic: &str, pid: u32) -> PathBuf {
        self.root.join(format!(
            "{}__{}__part{}.offset",
            sanitize(group),
            sanitize(topic),
            pid
        ))
    }

    pub async fn init(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    /// Commits `offset` for `(group, topic, pid)`, rejecting any value past
    /// `next_offset` (spec.md §9's resolution of the open question: a
    /// consumer group can never commit an offset the log hasn't produced
    /// yet). Durable on return: tmp file write, fsync, rename, directory
    /// fsync, matching the crash-safety shape the teacher applies to its own
    /// persisted metadata.
    #[instrument(skip(self), fields(group, topic, pid, offset))]
    pub async fn commit(&self, group: &str, topic: &str, pid: u32, offset: u64, next_offset: u64) -> Result<()> {
        if offset > next_offset {
            return Err(LkStreamError::OffsetOutOfRange {
                offset,
                earliest: 0,
                next: next_offset,
            });
        }

        let final_path = self.path_for(group, topic, pid);
        let tmp_path = final_path.with_extension("offset.tmp");

        {
            let mut tmp_file = File::create(&tmp_path).await?;
            tmp_file.write_all(&offset.to_be_bytes()).await?;
            tmp_file.sync_all().await?;
        }

        tokio::fs::rename(&tmp_path, &final_path).await?;
        fsync_dir(&self.root).await?;

        debug!("offset committed");
        Ok(())
    }

    /// Returns the last committed offset, or `None` if this group has never
    /// committed against this partition — spec.md §4.5 says such a consumer
    /// starts from offset 0.
    pub async fn read_committed(&self, group: &str, topic: &str, pid: u32) -> Result<Option<u64>> {
        let path = self.path_for(group, topic, pid);
        let mut file = match OpenOptions::new().read(true).open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut buf = [0u8; 8];
        file.read_exact(&mut buf).await?;
        Ok(Some(u64::from_be_bytes(buf)))
    }
}

async fn fsync_dir(dir: &Path) -> Result<()> {
    let dir_file = File::open(dir).await?;
    dir_file.sync_all().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn commits_and_reads_back() {
        let dir = tempdir().unwrap();
        let store = OffsetStore::new(dir.path().to_path_buf());
        store.init().await.unwrap();

        assert_eq!(store.read_committed("g1", "orders", 0).await.unwrap(), None);
        store.commit("g1", "orders", 0, 42, 100).await.unwrap();
        assert_eq!(store.read_committed("g1", "orders", 0).await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn rejects_commit_past_next_offset() {
        let dir = tempdir().unwrap();
        let store = OffsetStore::new(dir.path().to_path_buf());
        store.init().await.unwrap();

        let result = store.commit("g1", "orders", 0, 50, 10).await;
        assert!(matches!(result, Err(LkStreamError::OffsetOutOfRange { .. })));
    }

    #[tokio::test]
    async fn survives_process_restart_simulation() {
        let dir = tempdir().unwrap();
        {
            let store = OffsetStore::new(dir.path().to_path_buf());
            store.init().await.unwrap();
            store.commit("g1", "orders", 3, 7, 100).await.unwrap();
        }
        let reopened = OffsetStore::new(dir.path().to_path_buf());
        assert_eq!(reopened.read_committed("g1", "orders", 3).await.unwrap(), Some(7));
    }
}
