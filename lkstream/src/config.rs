use std::path::{Path, PathBuf};

use byte_unit::Byte;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{LkStreamError, Result};

/// Durability policy for the group-commit scheduler (spec.md §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsyncMode {
    /// Every append triggers an immediate flush before the call returns.
    Sync,
    /// Asynchronous, batched by time or byte thresholds. Appenders never wait.
    Group,
    /// Never fsync; rely entirely on the OS page cache.
    None,
}

impl Default for FsyncMode {
    fn default() -> Self {
        FsyncMode::Group
    }
}

impl std::str::FromStr for FsyncMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sync" => Ok(FsyncMode::Sync),
            "group" => Ok(FsyncMode::Group),
            "none" => Ok(FsyncMode::None),
            other => Err(format!("unknown fsync mode: {other}")),
        }
    }
}

/// One Config value owns every tunable; there is no process-wide singleton
/// (spec.md §9).
#[derive(Debug, Clone)]
pub struct Config {
    pub persist_dir: PathBuf,
    pub fsync_mode: FsyncMode,
    pub fsync_interval_ms: u64,
    pub fsync_group_bytes: u64,
    pub segment_max_bytes: u64,
    pub index_every_n: u32,
    pub hot_tail_entries: usize,
    pub inflight_max_bytes: u64,
    pub retention_age_secs: u64,
    pub retention_max_bytes: u64,
    pub retention_check_interval_ms: u64,
}

/// Raw, directly-deserializable shape. Byte-size fields stay as strings
/// ("64 MB") until [`RawConfig::resolve`] parses them, mirroring how the
/// teacher keeps the TOML human-writable and resolves units in `Default`
/// impls rather than at the `serde` layer.
#[derive(Debug, Deserialize)]
struct RawConfig {
    persist_dir: String,
    fsync: RawFsync,
    segment: RawSegment,
    hot_tail: RawHotTail,
    backpressure: RawBackpressure,
    retention: RawRetention,
}

#[derive(Debug, Deserialize)]
struct RawFsync {
    mode: String,
    interval_ms: u64,
    group_bytes: String,
}

#[derive(Debug, Deserialize)]
struct RawSegment {
    max_bytes: String,
    index_every_n: u32,
}

#[derive(Debug, Deserialize)]
struct RawHotTail {
    entries: usize,
}

#[derive(Debug, Deserialize)]
struct RawBackpressure {
    inflight_max_bytes: String,
}

#[derive(Debug, Deserialize)]
struct RawRetention {
    age_secs: u64,
    max_bytes: u64,
    check_interval_ms: u64,
}

fn parse_bytes(value: &str) -> Result<u64> {
    Byte::parse_str(value, true)
        .map(|b| b.as_u64())
        .map_err(|e| LkStreamError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
}

impl RawConfig {
    fn resolve(self) -> Result<Config> {
        Ok(Config {
            persist_dir: PathBuf::from(self.persist_dir),
            fsync_mode: self
                .fsync
                .mode
                .parse()
                .map_err(|e: String| {
                    LkStreamError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
                })?,
            fsync_interval_ms: self.fsync.interval_ms,
            fsync_group_bytes: parse_bytes(&self.fsync.group_bytes)?,
            segment_max_bytes: parse_bytes(&self.segment.max_bytes)?,
            index_every_n: self.segment.index_every_n.max(1),
            hot_tail_entries: self.hot_tail.entries,
            inflight_max_bytes: parse_bytes(&self.backpressure.inflight_max_bytes)?,
            retention_age_secs: self.retention.age_secs,
            retention_max_bytes: self.retention.max_bytes,
            retention_check_interval_ms: self.retention.check_interval_ms,
        })
    }
}

impl Config {
    /// Loads the built-in defaults, layering an optional file and
    /// `LKSTREAM_`-prefixed environment variables on top, the same two-stage
    /// shape as the teacher's `FileConfigProvider` / `CustomEnvProvider`.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let mut figment = Figment::from(Toml::string(include_str!("../configs/lkstream.toml")));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("LKSTREAM_").split("_"));

        let raw: RawConfig = figment
            .extract()
            .map_err(|e| LkStreamError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        raw.resolve()
    }

    pub fn partition_path(&self, topic: &str, pid: u32) -> PathBuf {
        self.persist_dir
            .join("topics")
            .join(topic)
            .join(format!("part{pid}"))
    }

    pub fn offsets_dir(&self) -> PathBuf {
        self.persist_dir.join("offsets")
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::load(None).expect("built-in default configuration must parse")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.persist_dir, PathBuf::from("local_data"));
        assert_eq!(config.fsync_mode, FsyncMode::Group);
        assert_eq!(config.segment_max_bytes, 64 * 1024 * 1024);
        assert_eq!(config.hot_tail_entries, 1000);
        assert_eq!(config.index_every_n, 1);
    }

    #[test]
    fn partition_path_layout_matches_spec() {
        let config = Config::load(None).unwrap();
        let path = config.partition_path("orders", 3);
        assert_eq!(path, PathBuf::from("local_data/topics/orders/part3"));
    }
}
