use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::error::Result;

/// Abstracts over how a write lands on disk. The group-commit scheduler
/// (spec.md §4.3) picks the implementation based on [`crate::config::FsyncMode`]:
/// `sync` mode wants [`FileWithSyncPersister`] on every append, `group` and
/// `none` modes write through [`FilePersister`] and let the scheduler (or the
/// OS) decide when to call `sync`.
#[async_trait]
pub trait Persister: Send + Sync {
    async fn append(&self, file: &mut File, bytes: &[u8]) -> Result<()>;
    async fn sync(&self, file: &mut File) -> Result<()>;
}

/// Buffered, non-durable write. Durability is established later, out of band,
/// by the group-commit scheduler calling `sync` on the same file handle.
#[derive(Debug, Default, Clone, Copy)]
pub struct FilePersister;

#[async_trait]
impl Persister for FilePersister {
    async fn append(&self, file: &mut File, bytes: &[u8]) -> Result<()> {
        file.write_all(bytes).await?;
        Ok(())
    }

    async fn sync(&self, file: &mut File) -> Result<()> {
        file.sync_data().await?;
        Ok(())
    }
}

/// Every append is immediately followed by an fsync before returning control
/// to the caller. Used when [`crate::config::FsyncMode::Sync`] is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileWithSyncPersister;

#[async_trait]
impl Persister for FileWithSyncPersister {
    async fn append(&self, file: &mut File, bytes: &[u8]) -> Result<()> {
        file.write_all(bytes).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn sync(&self, file: &mut File) -> Result<()> {
        file.sync_data().await?;
        Ok(())
    }
}
