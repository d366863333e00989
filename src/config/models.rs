use crate::humanize::ByteSize;
use crate::ledger::StorageOptions;
use serde::{Deserialize, Deserializer, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub gc: GcConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_admin_addr")]
    pub admin_addr: SocketAddr,
    /// Start without accepting writes
    #[serde(default)]
    pub readonly: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            admin_addr: default_admin_addr(),
            readonly: false,
        }
    }
}

fn default_admin_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8000))
}

/// On-disk layout and size limits
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_journal_dir")]
    pub journal_dir: PathBuf,
    #[serde(
        default = "default_ledger_dirs",
        deserialize_with = "deserialize_dir_list"
    )]
    pub ledger_dirs: Vec<PathBuf>,
    /// Defaults to `<first ledger dir>/index`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_dir: Option<PathBuf>,
    #[serde(default = "default_entry_log_size_limit")]
    pub entry_log_size_limit: ByteSize,
    #[serde(default = "default_journal_max_size")]
    pub journal_max_size: ByteSize,
    #[serde(default = "default_memtable_limit")]
    pub memtable_limit: ByteSize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            journal_dir: default_journal_dir(),
            ledger_dirs: default_ledger_dirs(),
            index_dir: None,
            entry_log_size_limit: default_entry_log_size_limit(),
            journal_max_size: default_journal_max_size(),
            memtable_limit: default_memtable_limit(),
        }
    }
}

fn default_journal_dir() -> PathBuf {
    PathBuf::from("data/journal")
}

fn default_ledger_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from("data/ledgers")]
}

fn default_entry_log_size_limit() -> ByteSize {
    ByteSize(1024 * 1024 * 1024) // 1 GB
}

fn default_journal_max_size() -> ByteSize {
    ByteSize(2 * 1024 * 1024 * 1024) // 2 GB
}

fn default_memtable_limit() -> ByteSize {
    ByteSize(64 * 1024 * 1024) // 64 MB
}

/// Accepts a list or a comma separated string, the form environment
/// variables arrive in.
fn deserialize_dir_list<'de, D>(deserializer: D) -> Result<Vec<PathBuf>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DirList {
        List(Vec<PathBuf>),
        Joined(String),
    }

    Ok(match DirList::deserialize(deserializer)? {
        DirList::List(dirs) => dirs,
        DirList::Joined(joined) => joined
            .split(',')
            .map(str::trim)
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .collect(),
    })
}

/// Periodic checkpoint settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_interval_ms")]
    pub interval_ms: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_checkpoint_interval_ms(),
        }
    }
}

fn default_checkpoint_interval_ms() -> u64 {
    1000
}

/// Garbage collection settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GcConfig {
    #[serde(default = "default_gc_interval_secs")]
    pub interval_secs: u64,
    /// Segments whose live fraction drops below this are compacted
    #[serde(default = "default_compaction_threshold")]
    pub compaction_threshold: f64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_gc_interval_secs(),
            compaction_threshold: default_compaction_threshold(),
        }
    }
}

fn default_gc_interval_secs() -> u64 {
    60
}

fn default_compaction_threshold() -> f64 {
    0.2
}

impl Config {
    /// Storage engine options derived from the `[storage]`, `[gc]` and
    /// `[server]` sections.
    pub fn storage_options(&self) -> StorageOptions {
        StorageOptions::builder()
            .journal_dir(self.storage.journal_dir.clone())
            .ledger_dirs(self.storage.ledger_dirs.clone())
            .maybe_index_dir(self.storage.index_dir.clone())
            .entry_log_size_limit(self.storage.entry_log_size_limit.as_u64())
            .journal_max_size(self.storage.journal_max_size.as_u64())
            .memtable_limit(self.storage.memtable_limit.as_u64())
            .compaction_threshold(self.gc.compaction_threshold)
            .readonly(self.server.readonly)
            .build()
    }
}
