//! Persistence configuration (`[persistence]` in `fisioflow.toml`).

use serde::{Deserialize, Serialize};

/// Persistence / database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Path to the SQLite database file. `:memory:` opens an in-memory store.
    #[serde(default = "default_path")]
    pub path: String,
    /// Use WAL mode for concurrent reads.
    #[serde(default = "default_true")]
    pub wal_mode: bool,
    /// How long SQLite waits on a locked database before failing.
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
    /// Number of rotating backups to keep.
    #[serde(default = "default_3")]
    pub backup_count: u32,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            wal_mode: true,
            busy_timeout_ms: 5000,
            backup_count: 3,
        }
    }
}

impl PersistenceConfig {
    /// Whether this configuration points at an in-memory database.
    #[must_use]
    pub fn is_in_memory(&self) -> bool {
        self.path == ":memory:"
    }
}

fn default_path() -> String { "fisioflow.db".to_string() }
fn default_true() -> bool { true }
fn default_busy_timeout() -> u64 { 5000 }
fn default_3() -> u32 { 3 }
