//! Companion index file: fixed 16-byte entries `(offset: u64_be, pos: u64_be)`
//! in strictly increasing offset order (spec.md §3, §4.1). Sparse by design —
//! `index_every_n` controls how many records separate two entries — but the
//! first record of a segment always gets an entry.

use std::path::Path;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

use crate::error::Result;

pub const ENTRY_LEN: u64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub offset: u64,
    pub pos: u64,
}

/// In-memory cache of a segment's index, mirroring the on-disk file.
/// Appenders hold the partition mutex while extending it; readers take a
/// short read lock only to snapshot it (spec.md §5).
pub struct Index {
    path: std::path::PathBuf,
    file: Option<File>,
    entries: Vec<IndexEntry>,
}

impl Index {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            file: None,
            entries: Vec::new(),
        }
    }

    pub async fn create(&mut self) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .truncate(false)
            .open(&self.path)
            .await?;
        self.file = Some(file);
        Ok(())
    }

    /// Loads every entry from disk into memory. Indices are expected to stay
    /// small (sparse by construction) so this is a bounded, one-time cost per
    /// segment at startup.
    pub async fn load(&mut self) -> Result<()> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .await?;
        let len = file.metadata().await?.len();
        let usable_len = len - (len % ENTRY_LEN);
        if usable_len != len {
            // A torn index write; truncate to the last complete entry.
            file.set_len(usable_len).await?;
        }

        file.seek(SeekFrom::Start(0)).await?;
        let mut buf = vec![0u8; usable_len as usize];
        file.read_exact(&mut buf).await?;

        let mut entries = Vec::with_capacity((usable_len / ENTRY_LEN) as usize);
        for chunk in buf.chunks_exact(ENTRY_LEN as usize) {
            let offset = u64::from_be_bytes(chunk[0..8].try_into().unwrap());
            let pos = u64::from_be_bytes(chunk[8..16].try_into().unwrap());
            entries.push(IndexEntry { offset, pos });
        }

        self.entries = entries;
        self.file = Some(file);
        Ok(())
    }

    pub async fn append(&mut self, offset: u64, pos: u64) -> Result<()> {
        let mut encoded = [0u8; ENTRY_LEN as usize];
        encoded[0..8].copy_from_slice(&offset.to_be_bytes());
        encoded[8..16].copy_from_slice(&pos.to_be_bytes());
        let file = self.file.as_mut().expect("index file not open");
        file.write_all(&encoded).await?;
        self.entries.push(IndexEntry { offset, pos });
        Ok(())
    }

    pub async fn sync(&mut self) -> Result<()> {
        let file = self.file.as_mut().expect("index file not open");
        file.sync_data().await?;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn last(&self) -> Option<IndexEntry> {
        self.entries.last().copied()
    }

    /// Binary-searches for the greatest entry with `offset <= target`
    /// (spec.md §4.1 location algorithm).
    pub fn floor(&self, target: u64) -> Option<IndexEntry> {
        floor_of(&self.entries, target)
    }

    /// Clones the current in-memory entries, used by readers to snapshot the
    /// index tail pointer without holding the partition mutex for the
    /// duration of a scan (spec.md §5).
    pub fn snapshot(&self) -> Vec<IndexEntry> {
        self.entries.clone()
    }

    /// Rewrites the whole index file from a freshly computed set of entries,
    /// used when rebuilding a missing or invalid index during recovery
    /// (spec.md §4.6, §9).
    pub async fn rewrite(&mut self, entries: Vec<IndexEntry>) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
            .await?;
        for entry in &entries {
            let mut encoded = [0u8; ENTRY_LEN as usize];
            encoded[0..8].copy_from_slice(&entry.offset.to_be_bytes());
            encoded[8..16].copy_from_slice(&entry.pos.to_be_bytes());
            file.write_all(&encoded).await?;
        }
        file.sync_data().await?;
        self.entries = entries;
        self.file = Some(file);
        Ok(())
    }
}

/// Standalone binary search shared by the live `Index` and by read-path
/// snapshots taken under a brief lock (spec.md §4.1, §5).
pub fn floor_of(entries: &[IndexEntry], target: u64) -> Option<IndexEntry> {
    match entries.binary_search_by(|e| e.offset.cmp(&target)) {
        Ok(i) => Some(entries[i]),
        Err(0) => None,
        Err(i) => Some(entries[i - 1]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn append_and_floor_lookup() {
        let dir = tempdir().unwrap();
        let mut index = Index::new(&dir.path().join("0.idx"));
        index.create().await.unwrap();
        index.append(0, 0).await.unwrap();
        index.append(10, 120).await.unwrap();
        index.append(20, 260).await.unwrap();
        index.sync().await.unwrap();

        assert_eq!(index.floor(15).unwrap(), IndexEntry { offset: 10, pos: 120 });
        assert_eq!(index.floor(20).unwrap(), IndexEntry { offset: 20, pos: 260 });
        assert!(index.floor(0).is_some());
    }

    #[tokio::test]
    async fn reloads_from_disk_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.idx");
        {
            let mut index = Index::new(&path);
            index.create().await.unwrap();
            index.append(0, 0).await.unwrap();
            index.append(5, 60).await.unwrap();
            index.sync().await.unwrap();
        }

        let mut reloaded = Index::new(&path);
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.last().unwrap().offset, 5);
    }
}
