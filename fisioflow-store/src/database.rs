//! SQLite handle with serialized write transactions.
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS schema_migrations (
//!     component  TEXT NOT NULL,
//!     version    INTEGER NOT NULL,
//!     applied_at TEXT NOT NULL,
//!     PRIMARY KEY (component, version)
//! );
//! ```
//!
//! Each component (voucher core, LLM usage ledger, knowledge base) owns an
//! ordered list of migration scripts and applies them through
//! [`Database::migrate`]. Scripts are append-only: version N is the N-th
//! element of the list and is never edited once released.
//!
//! Locking model: one connection behind a mutex, and every write closure runs
//! inside `BEGIN IMMEDIATE`. A row read inside [`Database::write`] is
//! therefore exclusively held until the closure returns; the closure's
//! `Ok` commits, its `Err` rolls everything back.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior, params};
use tracing::{debug, info};

use crate::codec::ts_to_sql;
use crate::config::PersistenceConfig;
use crate::error::{Result, StoreError};

/// Handle to an open SQLite database.
///
/// # Usage
///
/// ```no_run
/// # use fisioflow_store::{Database, PersistenceConfig, StoreError};
/// let db = Database::open("clinic.db", &PersistenceConfig::default())?;
/// db.migrate("demo", &["CREATE TABLE IF NOT EXISTS demo (id INTEGER PRIMARY KEY)"])?;
/// let rows = db.write(|tx| {
///     tx.execute("INSERT INTO demo DEFAULT VALUES", [])?;
///     Ok::<_, StoreError>(tx.last_insert_rowid())
/// })?;
/// # Ok::<(), StoreError>(())
/// ```
pub struct Database {
    conn: Mutex<Connection>,
    config: PersistenceConfig,
    db_path: PathBuf,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("db_path", &self.db_path)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Open (or create) an SQLite database at `path`.
    ///
    /// WAL mode is enabled when `config.wal_mode` is `true`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on SQLite failures.
    pub fn open<P: AsRef<Path>>(path: P, config: &PersistenceConfig) -> Result<Self> {
        let db_path = path.as_ref().to_path_buf();
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(&db_path, flags)?;
        if config.wal_mode {
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        }
        conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
        Self::prepare(&conn, config)?;

        info!(
            path = %db_path.display(),
            wal = config.wal_mode,
            "FisioFlow database opened"
        );

        Ok(Self {
            conn: Mutex::new(conn),
            config: config.clone(),
            db_path,
        })
    }

    /// Open an in-memory database (useful for tests).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on SQLite failures.
    pub fn open_in_memory(config: &PersistenceConfig) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::prepare(&conn, config)?;

        Ok(Self {
            conn: Mutex::new(conn),
            config: config.clone(),
            db_path: PathBuf::from(":memory:"),
        })
    }

    /// Open whatever `config.path` names (`:memory:` included).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on SQLite failures.
    pub fn from_config(config: &PersistenceConfig) -> Result<Self> {
        if config.is_in_memory() {
            Self::open_in_memory(config)
        } else {
            Self::open(&config.path, config)
        }
    }

    fn prepare(conn: &Connection, config: &PersistenceConfig) -> Result<()> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                component  TEXT NOT NULL,
                version    INTEGER NOT NULL,
                applied_at TEXT NOT NULL,
                PRIMARY KEY (component, version)
            );",
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Migrations
    // ------------------------------------------------------------------

    /// Apply every script in `migrations` that `component` has not applied yet.
    ///
    /// Returns how many scripts ran.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Migration`] naming the failing version; nothing
    /// from that version is kept.
    pub fn migrate(&self, component: &str, migrations: &[&str]) -> Result<usize> {
        self.write(|tx| {
            let current: i64 = tx.query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations WHERE component = ?1",
                params![component],
                |row| row.get(0),
            )?;
            let current = usize::try_from(current).unwrap_or(0);

            let mut applied = 0;
            for (idx, script) in migrations.iter().enumerate().skip(current) {
                let version = idx + 1;
                tx.execute_batch(script).map_err(|e| StoreError::Migration {
                    component: component.to_string(),
                    version,
                    reason: e.to_string(),
                })?;
                tx.execute(
                    "INSERT INTO schema_migrations (component, version, applied_at) VALUES (?1, ?2, ?3)",
                    params![component, version as i64, ts_to_sql(&Utc::now())],
                )?;
                applied += 1;
            }

            if applied > 0 {
                info!(component, applied, "Schema migrations applied");
            }
            Ok(applied)
        })
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Run `f` inside an exclusive (`BEGIN IMMEDIATE`) transaction.
    ///
    /// Commits when `f` returns `Ok`, rolls back when it returns `Err`.
    ///
    /// # Errors
    ///
    /// Propagates `f`'s error unchanged, or a [`StoreError`] converted into
    /// `E` when the transaction cannot begin or commit.
    pub fn write<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&Transaction<'_>) -> std::result::Result<T, E>,
        E: From<StoreError>,
    {
        let start = Instant::now();
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;

        // Dropping `tx` on the error path rolls back.
        let value = f(&tx)?;
        tx.commit().map_err(StoreError::from)?;

        debug!(elapsed_us = start.elapsed().as_micros(), "Write transaction committed");
        Ok(value)
    }

    /// Run a read-only closure against the connection.
    ///
    /// # Errors
    ///
    /// Propagates `f`'s error unchanged.
    pub fn read<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&Connection) -> std::result::Result<T, E>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    // ------------------------------------------------------------------
    // Backup
    // ------------------------------------------------------------------

    /// Create a backup of the database to `dest_path` using SQLite's
    /// online-backup API.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on SQLite failures.
    pub fn backup<P: AsRef<Path>>(&self, dest_path: P) -> Result<()> {
        let start = Instant::now();
        let conn = self.conn.lock();
        let mut dest = Connection::open(dest_path.as_ref())?;
        let backup = rusqlite::backup::Backup::new(&conn, &mut dest)?;
        backup.run_to_completion(256, Duration::from_millis(50), None)?;

        info!(
            dest = %dest_path.as_ref().display(),
            elapsed_ms = start.elapsed().as_millis(),
            "Database backup completed"
        );
        Ok(())
    }

    /// Create a numbered backup alongside the database file, keeping at most
    /// `config.backup_count` of them.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] or [`StoreError::Io`] on failure.
    pub fn create_rotating_backup(&self) -> Result<()> {
        if self.db_path.as_os_str() == ":memory:" {
            return Ok(());
        }

        let max = self.config.backup_count;
        if max == 0 {
            return Ok(());
        }

        for i in (1..max).rev() {
            let src = self.backup_path(i);
            if src.exists() {
                std::fs::rename(&src, self.backup_path(i + 1))?;
            }
        }

        let oldest = self.backup_path(max + 1);
        if oldest.exists() {
            std::fs::remove_file(&oldest)?;
        }

        self.backup(self.backup_path(1))?;
        info!(max_backups = max, "Rotating backup created");
        Ok(())
    }

    /// Path to a numbered backup file (e.g. `clinic.db.bak.1`).
    fn backup_path(&self, n: u32) -> PathBuf {
        let mut p = self.db_path.clone();
        let ext = format!(
            "{}.bak.{n}",
            p.extension()
                .map_or(String::new(), |e| e.to_string_lossy().into_owned())
        );
        p.set_extension(ext);
        p
    }

    // ------------------------------------------------------------------
    // Utility
    // ------------------------------------------------------------------

    /// Path to the database file (or `:memory:`).
    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Run SQLite's integrity check.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the check itself fails.
    pub fn integrity_check(&self) -> Result<bool> {
        let conn = self.conn.lock();
        let result: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        Ok(result == "ok")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const DEMO: &[&str] = &[
        "CREATE TABLE counters (name TEXT PRIMARY KEY, value INTEGER NOT NULL);",
        "ALTER TABLE counters ADD COLUMN note TEXT;",
    ];

    fn db() -> Database {
        let db = Database::open_in_memory(&PersistenceConfig::default()).expect("open");
        db.migrate("demo", DEMO).expect("migrate");
        db
    }

    #[test]
    fn migrations_apply_once() {
        let db = db();
        assert_eq!(db.migrate("demo", DEMO).expect("re-run"), 0);

        let mut extended = DEMO.to_vec();
        extended.push("CREATE INDEX idx_counters_value ON counters(value);");
        assert_eq!(db.migrate("demo", &extended).expect("extend"), 1);
    }

    #[test]
    fn failed_migration_names_version() {
        let db = db();
        let broken = [DEMO[0], DEMO[1], "THIS IS NOT SQL"];
        let err = db.migrate("demo", &broken).expect_err("must fail");
        assert!(matches!(err, StoreError::Migration { version: 3, .. }));
    }

    #[test]
    fn write_error_rolls_back() {
        let db = db();
        let result: std::result::Result<(), StoreError> = db.write(|tx| {
            tx.execute("INSERT INTO counters (name, value) VALUES ('a', 1)", [])?;
            Err(StoreError::Decode {
                column: "value",
                value: "x".into(),
                reason: "forced".into(),
            })
        });
        assert!(result.is_err());

        let count: i64 = db
            .read(|conn| conn.query_row("SELECT COUNT(*) FROM counters", [], |row| row.get(0)))
            .expect("count");
        assert_eq!(count, 0);
    }

    #[test]
    fn concurrent_writes_serialize() {
        let db = Arc::new(db());
        db.write(|tx| {
            tx.execute("INSERT INTO counters (name, value) VALUES ('hits', 0)", [])?;
            Ok::<_, StoreError>(())
        })
        .expect("seed");

        std::thread::scope(|scope| {
            for _ in 0..8 {
                let db = Arc::clone(&db);
                scope.spawn(move || {
                    for _ in 0..25 {
                        db.write(|tx| {
                            let v: i64 = tx.query_row(
                                "SELECT value FROM counters WHERE name = 'hits'",
                                [],
                                |row| row.get(0),
                            )?;
                            tx.execute(
                                "UPDATE counters SET value = ?1 WHERE name = 'hits'",
                                params![v + 1],
                            )?;
                            Ok::<_, StoreError>(())
                        })
                        .expect("increment");
                    }
                });
            }
        });

        let hits: i64 = db
            .read(|conn| conn.query_row("SELECT value FROM counters WHERE name = 'hits'", [], |row| row.get(0)))
            .expect("read");
        assert_eq!(hits, 200, "read-modify-write must not lose updates");
    }

    #[test]
    fn file_based_open_and_rotating_backup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("clinic.db");
        let config = PersistenceConfig {
            backup_count: 2,
            ..PersistenceConfig::default()
        };
        let db = Database::open(&db_path, &config).expect("open");
        db.migrate("demo", DEMO).expect("migrate");

        db.create_rotating_backup().expect("backup 1");
        db.create_rotating_backup().expect("backup 2");
        db.create_rotating_backup().expect("backup 3");

        assert!(dir.path().join("clinic.db.bak.1").exists());
        assert!(dir.path().join("clinic.db.bak.2").exists());
        assert!(!dir.path().join("clinic.db.bak.3").exists());
        assert!(db.integrity_check().expect("check"));
    }
}
