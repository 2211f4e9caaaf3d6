use thiserror::Error;

/// Errors surfaced by the storage-and-concurrency core.
///
/// `Torn` is deliberately absent: it is an internal recovery signal (see
/// [`crate::recovery`]) and is never returned from a public API.
#[derive(Debug, Error)]
#[repr(u32)]
pub enum LkStreamError {
    #[error("offset {offset} out of range (earliest {earliest}, next {next})")]
    OffsetOutOfRange {
        offset: u64,
        earliest: u64,
        next: u64,
    } = 1,

    #[error("topic '{0}' is unknown")]
    TopicUnknown(String) = 2,

    #[error("partition {pid} of topic '{topic}' is unknown")]
    PartitionUnknown { topic: String, pid: u32 } = 3,

    #[error("topic '{0}' already exists with a different partition count")]
    TopicExistsConflict(String) = 4,

    #[error("partition {pid} of topic '{topic}' is closed")]
    ClosedPartition { topic: String, pid: u32 } = 5,

    #[error("broker is closed")]
    ClosedBroker = 6,

    #[error("backpressure: inflight bytes exceed the configured cap, retry later")]
    Backpressure = 7,

    #[error("segment storage is full")]
    StorageFull = 8,

    #[error("recovery found corrupt on-disk state: {0}")]
    RecoveryCorruption(String) = 9,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error) = 10,
}

pub type Result<T> = std::result::Result<T, LkStreamError>;
