//! Single-node, file-backed, append-only event log with Kafka-style
//! semantics: named topics, fixed-cardinality partitions, per-partition
//! total ordering, durable commits, and replayable consumption by consumer
//! groups. See [`broker::Broker`] for the entry point.

pub mod broker;
pub mod config;
pub mod error;
pub mod hash;
pub mod metrics;
pub mod offsets;
pub mod partition;
pub mod persister;
pub mod record;
pub mod recovery;
pub mod retention;
pub mod scheduler;
pub mod storage;
pub mod topic;

pub use broker::Broker;
pub use config::Config;
pub use error::{LkStreamError, Result};
pub use record::{PolledRecord, Record};
