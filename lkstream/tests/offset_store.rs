//! Scenario (f): a crash between writing the tmp file and renaming it must
//! leave the previously committed value intact.

use lkstream::offsets::OffsetStore;
use tempfile::tempdir;

#[tokio::test]
async fn crash_before_rename_preserves_previous_commit() {
    let dir = tempdir().unwrap();
    let store = OffsetStore::new(dir.path().to_path_buf());
    store.init().await.unwrap();

    store.commit("g", "t", 0, 42, 1000).await.unwrap();

    // Simulate a crash mid-commit: a tmp file was written but never renamed.
    let tmp_path = dir.path().join("g__t__part0.offset.tmp");
    tokio::fs::write(&tmp_path, 99u64.to_be_bytes()).await.unwrap();

    let reopened = OffsetStore::new(dir.path().to_path_buf());
    assert_eq!(reopened.read_committed("g", "t", 0).await.unwrap(), Some(42));
}

#[tokio::test]
async fn missing_offset_file_reads_as_none() {
    let dir = tempdir().unwrap();
    let store = OffsetStore::new(dir.path().to_path_buf());
    store.init().await.unwrap();
    assert_eq!(store.read_committed("g", "t", 5).await.unwrap(), None);
}
