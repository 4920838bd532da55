//! Usage ledger: one append-only record per successful provider call.
//!
//! ```sql
//! CREATE TABLE usage_records (
//!     id          TEXT PRIMARY KEY,
//!     user_id     TEXT NOT NULL,
//!     provider    TEXT NOT NULL,
//!     task_type   TEXT NOT NULL,
//!     tokens_used INTEGER NOT NULL,
//!     cost        TEXT NOT NULL,
//!     created_at  TEXT NOT NULL
//! );
//! ```
//!
//! Records reach SQLite through a background writer so the caller's reply
//! never waits on disk; a crash loses at most the records still queued. The
//! rate window used for admission is kept in memory and seeded from the
//! table on startup.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use fisioflow_store::codec::{decimal_to_sql, get_decimal, get_ts, ts_to_sql};
use fisioflow_store::{Clock, Connection, Database, params};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::LlmError;
use crate::types::TaskType;

const MIGRATIONS: &[&str] = &["CREATE TABLE IF NOT EXISTS usage_records (
        id          TEXT PRIMARY KEY,
        user_id     TEXT NOT NULL,
        provider    TEXT NOT NULL,
        task_type   TEXT NOT NULL,
        tokens_used INTEGER NOT NULL,
        cost        TEXT NOT NULL,
        created_at  TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_usage_provider_time ON usage_records(provider, created_at);
    CREATE INDEX IF NOT EXISTS idx_usage_user_time ON usage_records(user_id, created_at);"];

const WRITE_BATCH: usize = 64;

/// One successful provider call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Record id.
    pub id: Uuid,
    /// Caller.
    pub user_id: String,
    /// Provider that answered.
    pub provider: String,
    /// Task classification of the request.
    pub task_type: TaskType,
    /// Tokens billed.
    pub tokens_used: u32,
    /// `tokens_used * cost_per_token`.
    pub cost: Decimal,
    /// When the call completed.
    pub created_at: DateTime<Utc>,
}

/// Aggregation window for [`UsageLedger::stats`]. Windows are trailing:
/// `Month` is the last 30 days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageWindow {
    /// Last hour.
    Hour,
    /// Last 24 hours.
    Day,
    /// Last 30 days.
    Month,
}

impl UsageWindow {
    /// Window length.
    #[must_use]
    pub fn duration(self) -> Duration {
        match self {
            Self::Hour => Duration::hours(1),
            Self::Day => Duration::days(1),
            Self::Month => Duration::days(30),
        }
    }
}

/// Calls, tokens and cost for one bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UsageCounter {
    /// Successful calls.
    pub calls: u64,
    /// Tokens billed.
    pub tokens: u64,
    /// Summed cost.
    pub cost: Decimal,
}

impl UsageCounter {
    fn add(&mut self, tokens: u32, cost: Decimal) {
        self.calls += 1;
        self.tokens += u64::from(tokens);
        self.cost += cost;
    }
}

/// Aggregates over a window, optionally for one user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageStats {
    /// Window queried.
    pub window: UsageWindow,
    /// Inclusive start of the window.
    pub since: DateTime<Utc>,
    /// User filter, if any.
    pub user_id: Option<String>,
    /// Every record in the window.
    pub total: UsageCounter,
    /// Per provider name.
    pub by_provider: BTreeMap<String, UsageCounter>,
    /// Per task type.
    pub by_task: BTreeMap<TaskType, UsageCounter>,
}

enum WriterMsg {
    Record(UsageRecord),
    Flush(oneshot::Sender<()>),
}

/// Usage ledger with an in-memory admission window.
pub struct UsageLedger {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
    window: Duration,
    recent: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
    writer: Option<mpsc::UnboundedSender<WriterMsg>>,
}

impl std::fmt::Debug for UsageLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageLedger")
            .field("window", &self.window)
            .field("async_writer", &self.writer.is_some())
            .finish_non_exhaustive()
    }
}

impl UsageLedger {
    /// Migrate the table, seed the rate window and start the writer.
    ///
    /// Inside a tokio runtime records are written in the background; outside
    /// one every record is written synchronously.
    ///
    /// # Errors
    /// [`LlmError::Store`] if migration or seeding fails.
    pub fn new(db: Arc<Database>, clock: Arc<dyn Clock>, window_secs: u64) -> Result<Self, LlmError> {
        db.migrate("llm_usage", MIGRATIONS)?;
        let window = Duration::seconds(i64::try_from(window_secs).unwrap_or(i64::MAX / 1_000));

        let since = clock.now() - window;
        let seeded = db.read(|conn| {
            let mut stmt =
                conn.prepare("SELECT provider, created_at FROM usage_records WHERE created_at >= ?1 ORDER BY created_at")?;
            let rows = stmt.query_map(params![ts_to_sql(&since)], |row| Ok((row.get::<_, String>(0)?, get_ts(row, 1)?)))?;
            let mut recent: HashMap<String, VecDeque<DateTime<Utc>>> = HashMap::new();
            for row in rows {
                let (provider, at) = row?;
                recent.entry(provider).or_default().push_back(at);
            }
            Ok::<_, LlmError>(recent)
        })?;

        let writer = Handle::try_current().ok().map(|handle| {
            let (tx, rx) = mpsc::unbounded_channel();
            handle.spawn(run_writer(Arc::clone(&db), rx));
            tx
        });

        Ok(Self {
            db,
            clock,
            window,
            recent: Mutex::new(seeded),
            writer,
        })
    }

    /// Successful calls to `provider` in the trailing window.
    #[must_use]
    pub fn current_usage(&self, provider: &str) -> u32 {
        let cutoff = self.clock.now() - self.window;
        let mut recent = self.recent.lock();
        let Some(times) = recent.get_mut(provider) else {
            return 0;
        };
        while times.front().is_some_and(|t| *t < cutoff) {
            times.pop_front();
        }
        u32::try_from(times.len()).unwrap_or(u32::MAX)
    }

    /// Record a successful call. Counts toward the rate window immediately;
    /// the row is persisted asynchronously when a writer is running.
    pub fn record(&self, user_id: &str, provider: &str, task_type: TaskType, tokens_used: u32, cost: Decimal) -> UsageRecord {
        let record = UsageRecord {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            provider: provider.to_string(),
            task_type,
            tokens_used,
            cost,
            created_at: self.clock.now(),
        };
        self.recent
            .lock()
            .entry(record.provider.clone())
            .or_default()
            .push_back(record.created_at);

        match &self.writer {
            Some(tx) => {
                if tx.send(WriterMsg::Record(record.clone())).is_err() {
                    error!(provider, "Usage writer stopped; record kept in memory only");
                }
            }
            None => {
                if let Err(e) = self.db.write(|tx| insert_batch(tx, std::slice::from_ref(&record))) {
                    error!(provider, error = %e, "Failed to persist usage record");
                }
            }
        }
        record
    }

    /// Wait until every record queued so far is on disk.
    pub async fn flush(&self) {
        let Some(tx) = &self.writer else { return };
        let (done, wait) = oneshot::channel();
        if tx.send(WriterMsg::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    /// Aggregate counters over `window`, optionally for one user. Flushes
    /// first so the caller sees its own calls.
    ///
    /// # Errors
    /// [`LlmError::Store`] on query failure.
    pub async fn stats(&self, user_id: Option<&str>, window: UsageWindow) -> Result<UsageStats, LlmError> {
        self.flush().await;
        let since = self.clock.now() - window.duration();
        let db = Arc::clone(&self.db);
        let user = user_id.map(str::to_string);
        let user_filter = user.clone();
        let records = tokio::task::spawn_blocking(move || db.read(|conn| load_since(conn, since, user_filter.as_deref())))
            .await
            .map_err(|e| LlmError::RequestFailed(format!("usage query task failed: {e}")))??;
        Ok(aggregate(window, since, user, &records))
    }

    /// Every persisted record, oldest first.
    ///
    /// # Errors
    /// [`LlmError::Store`] on query failure.
    pub fn records(&self) -> Result<Vec<UsageRecord>, LlmError> {
        self.db.read(|conn| load_since(conn, DateTime::<Utc>::MIN_UTC, None))
    }
}

async fn run_writer(db: Arc<Database>, mut rx: mpsc::UnboundedReceiver<WriterMsg>) {
    debug!("Usage writer started");
    while let Some(first) = rx.recv().await {
        let mut batch = Vec::new();
        let mut waiters = Vec::new();
        let mut next = Some(first);
        while let Some(msg) = next.take() {
            match msg {
                WriterMsg::Record(r) => batch.push(r),
                WriterMsg::Flush(done) => waiters.push(done),
            }
            if batch.len() < WRITE_BATCH {
                next = rx.try_recv().ok();
            }
        }

        if !batch.is_empty() {
            let db = Arc::clone(&db);
            let count = batch.len();
            let result = tokio::task::spawn_blocking(move || db.write(|tx| insert_batch(tx, &batch))).await;
            match result {
                Ok(Ok(())) => debug!(count, "Usage records persisted"),
                Ok(Err(e)) => error!(count, error = %e, "Failed to persist usage records"),
                Err(e) => error!(count, error = %e, "Usage writer task panicked"),
            }
        }
        for done in waiters {
            let _ = done.send(());
        }
    }
    info!("Usage writer stopped");
}

fn insert_batch(conn: &Connection, records: &[UsageRecord]) -> Result<(), LlmError> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO usage_records (id, user_id, provider, task_type, tokens_used, cost, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?;
    for r in records {
        stmt.execute(params![
            r.id.to_string(),
            r.user_id,
            r.provider,
            r.task_type.as_str(),
            r.tokens_used,
            decimal_to_sql(&r.cost),
            ts_to_sql(&r.created_at),
        ])?;
    }
    Ok(())
}

fn load_since(conn: &Connection, since: DateTime<Utc>, user_id: Option<&str>) -> Result<Vec<UsageRecord>, LlmError> {
    let mut stmt = conn.prepare(
        "SELECT id, user_id, provider, task_type, tokens_used, cost, created_at
         FROM usage_records
         WHERE created_at >= ?1 AND (?2 IS NULL OR user_id = ?2)
         ORDER BY created_at, id",
    )?;
    let rows = stmt.query_map(params![ts_to_sql(&since), user_id], |row| {
        let id: String = row.get(0)?;
        let task: String = row.get(3)?;
        Ok(UsageRecord {
            id: id
                .parse()
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?,
            user_id: row.get(1)?,
            provider: row.get(2)?,
            task_type: task
                .parse()
                .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, e.into()))?,
            tokens_used: row.get(4)?,
            cost: get_decimal(row, 5)?,
            created_at: get_ts(row, 6)?,
        })
    })?;
    rows.collect::<Result<Vec<_>, _>>().map_err(LlmError::from)
}

fn aggregate(window: UsageWindow, since: DateTime<Utc>, user_id: Option<String>, records: &[UsageRecord]) -> UsageStats {
    let mut stats = UsageStats {
        window,
        since,
        user_id,
        total: UsageCounter::default(),
        by_provider: BTreeMap::new(),
        by_task: BTreeMap::new(),
    };
    for r in records {
        stats.total.add(r.tokens_used, r.cost);
        stats.by_provider.entry(r.provider.clone()).or_default().add(r.tokens_used, r.cost);
        stats.by_task.entry(r.task_type).or_default().add(r.tokens_used, r.cost);
    }
    stats
}
