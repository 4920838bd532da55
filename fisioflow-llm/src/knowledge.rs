//! Internal knowledge base.
//!
//! The orchestrator only sees [`KnowledgeSource`]; the SQLite store and its
//! substring matcher can be swapped for a smarter retriever without touching
//! routing.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fisioflow_store::codec::{OptionalExt, get_ts, ts_to_sql};
use fisioflow_store::{Clock, Connection, Database, params};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::LlmError;

const MIGRATIONS: &[&str] = &["CREATE TABLE IF NOT EXISTS knowledge_items (
        id              TEXT PRIMARY KEY,
        title           TEXT NOT NULL,
        content         TEXT NOT NULL,
        category        TEXT NOT NULL,
        tags            TEXT NOT NULL,
        relevance_score INTEGER NOT NULL CHECK (relevance_score BETWEEN 0 AND 100),
        created_at      TEXT NOT NULL,
        updated_at      TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_knowledge_score ON knowledge_items(relevance_score DESC);"];

/// Fields supplied on add and update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeInput {
    /// Short title.
    pub title: String,
    /// Answer text returned on a match.
    pub content: String,
    /// Free-form grouping.
    #[serde(default)]
    pub category: String,
    /// Search tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Curated score, 0..=100.
    pub relevance_score: u8,
}

impl KnowledgeInput {
    fn validate(&self) -> Result<(), LlmError> {
        if self.title.trim().is_empty() {
            return Err(LlmError::InvalidKnowledge("title must not be empty".into()));
        }
        if self.content.trim().is_empty() {
            return Err(LlmError::InvalidKnowledge("content must not be empty".into()));
        }
        if self.relevance_score > 100 {
            return Err(LlmError::InvalidKnowledge(format!(
                "relevance_score {} is above 100",
                self.relevance_score
            )));
        }
        Ok(())
    }
}

/// A stored item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeItem {
    /// Item id.
    pub id: Uuid,
    /// Short title.
    pub title: String,
    /// Answer text.
    pub content: String,
    /// Free-form grouping.
    pub category: String,
    /// Search tags.
    pub tags: Vec<String>,
    /// Curated score, 0..=100.
    pub relevance_score: u8,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update.
    pub updated_at: DateTime<Utc>,
}

impl KnowledgeItem {
    /// `min(relevance_score / 100, 1.0)`.
    #[must_use]
    pub fn confidence(&self) -> f64 {
        (f64::from(self.relevance_score) / 100.0).min(1.0)
    }
}

/// A search hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KnowledgeMatch {
    /// The item.
    pub item: KnowledgeItem,
    /// Confidence derived from the item's score.
    pub confidence: f64,
}

/// Anything the orchestrator can consult before calling a provider.
#[async_trait]
pub trait KnowledgeSource: Send + Sync {
    /// Items matching `query`, best first, at most `limit`.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<KnowledgeMatch>, LlmError>;
}

/// Case-insensitive match: the query occurs in the title, content or a tag,
/// or the title or a tag occurs in the query.
#[must_use]
pub fn matches(item: &KnowledgeItem, query: &str) -> bool {
    let q = query.trim().to_lowercase();
    if q.is_empty() {
        return false;
    }
    let title = item.title.to_lowercase();
    if title.contains(&q) || q.contains(&title) || item.content.to_lowercase().contains(&q) {
        return true;
    }
    item.tags.iter().any(|tag| {
        let tag = tag.trim().to_lowercase();
        !tag.is_empty() && (tag.contains(&q) || q.contains(&tag))
    })
}

/// Filter and rank: score descending, then id for a stable order.
#[must_use]
pub fn rank(items: Vec<KnowledgeItem>, query: &str, limit: usize) -> Vec<KnowledgeMatch> {
    let mut hits: Vec<KnowledgeItem> = items.into_iter().filter(|i| matches(i, query)).collect();
    hits.sort_by(|a, b| b.relevance_score.cmp(&a.relevance_score).then(a.id.cmp(&b.id)));
    hits.truncate(limit);
    hits.into_iter()
        .map(|item| KnowledgeMatch {
            confidence: item.confidence(),
            item,
        })
        .collect()
}

/// Knowledge items in SQLite.
pub struct SqliteKnowledgeBase {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for SqliteKnowledgeBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteKnowledgeBase").finish_non_exhaustive()
    }
}

impl SqliteKnowledgeBase {
    /// Migrate the table.
    ///
    /// # Errors
    /// [`LlmError::Store`] if migration fails.
    pub fn new(db: Arc<Database>, clock: Arc<dyn Clock>) -> Result<Self, LlmError> {
        db.migrate("llm_knowledge", MIGRATIONS)?;
        Ok(Self { db, clock })
    }

    /// # Errors
    /// [`LlmError::InvalidKnowledge`] on bad fields.
    pub fn add(&self, input: &KnowledgeInput) -> Result<KnowledgeItem, LlmError> {
        input.validate()?;
        let now = self.clock.now();
        let item = KnowledgeItem {
            id: Uuid::new_v4(),
            title: input.title.trim().to_string(),
            content: input.content.clone(),
            category: input.category.clone(),
            tags: input.tags.clone(),
            relevance_score: input.relevance_score,
            created_at: now,
            updated_at: now,
        };
        self.db.write(|tx| {
            tx.execute(
                "INSERT INTO knowledge_items (id, title, content, category, tags, relevance_score, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    item.id.to_string(),
                    item.title,
                    item.content,
                    item.category,
                    encode_tags(&item.tags)?,
                    item.relevance_score,
                    ts_to_sql(&item.created_at),
                    ts_to_sql(&item.updated_at),
                ],
            )?;
            Ok::<_, LlmError>(())
        })?;
        info!(id = %item.id, title = %item.title, score = item.relevance_score, "Knowledge item added");
        Ok(item)
    }

    /// Replace an item's fields. `None` when the id is unknown.
    ///
    /// # Errors
    /// [`LlmError::InvalidKnowledge`] on bad fields.
    pub fn update(&self, id: Uuid, input: &KnowledgeInput) -> Result<Option<KnowledgeItem>, LlmError> {
        input.validate()?;
        let now = self.clock.now();
        let updated = self.db.write(|tx| {
            let n = tx.execute(
                "UPDATE knowledge_items
                 SET title = ?2, content = ?3, category = ?4, tags = ?5, relevance_score = ?6, updated_at = ?7
                 WHERE id = ?1",
                params![
                    id.to_string(),
                    input.title.trim(),
                    input.content,
                    input.category,
                    encode_tags(&input.tags)?,
                    input.relevance_score,
                    ts_to_sql(&now),
                ],
            )?;
            if n == 0 {
                return Ok(None);
            }
            load_one(tx, id)
        })?;
        if updated.is_some() {
            info!(%id, "Knowledge item updated");
        }
        Ok(updated)
    }

    /// Remove an item. `false` when the id is unknown.
    ///
    /// # Errors
    /// [`LlmError::Store`] on failure.
    pub fn delete(&self, id: Uuid) -> Result<bool, LlmError> {
        let n = self.db.write(|tx| {
            tx.execute("DELETE FROM knowledge_items WHERE id = ?1", params![id.to_string()])
                .map_err(LlmError::from)
        })?;
        if n > 0 {
            info!(%id, "Knowledge item deleted");
        }
        Ok(n > 0)
    }

    /// # Errors
    /// [`LlmError::Store`] on failure.
    pub fn get(&self, id: Uuid) -> Result<Option<KnowledgeItem>, LlmError> {
        self.db.read(|conn| load_one(conn, id))
    }

    /// Synchronous search.
    ///
    /// # Errors
    /// [`LlmError::Store`] on failure.
    pub fn search_blocking(&self, query: &str, limit: usize) -> Result<Vec<KnowledgeMatch>, LlmError> {
        let items = self.db.read(load_all)?;
        Ok(rank(items, query, limit))
    }
}

#[async_trait]
impl KnowledgeSource for SqliteKnowledgeBase {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<KnowledgeMatch>, LlmError> {
        let db = Arc::clone(&self.db);
        let items = tokio::task::spawn_blocking(move || db.read(load_all))
            .await
            .map_err(|e| LlmError::RequestFailed(format!("knowledge query task failed: {e}")))??;
        Ok(rank(items, query, limit))
    }
}

fn encode_tags(tags: &[String]) -> Result<String, LlmError> {
    serde_json::to_string(tags).map_err(|e| LlmError::InvalidKnowledge(e.to_string()))
}

const COLUMNS: &str = "id, title, content, category, tags, relevance_score, created_at, updated_at";

fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<KnowledgeItem> {
    let conversion = |idx: usize, e: Box<dyn std::error::Error + Send + Sync>| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e)
    };
    let id: String = row.get(0)?;
    let tags: String = row.get(4)?;
    Ok(KnowledgeItem {
        id: id.parse().map_err(|e: uuid::Error| conversion(0, Box::new(e)))?,
        title: row.get(1)?,
        content: row.get(2)?,
        category: row.get(3)?,
        tags: serde_json::from_str(&tags).map_err(|e| conversion(4, Box::new(e)))?,
        relevance_score: row.get(5)?,
        created_at: get_ts(row, 6)?,
        updated_at: get_ts(row, 7)?,
    })
}

fn load_one(conn: &Connection, id: Uuid) -> Result<Option<KnowledgeItem>, LlmError> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM knowledge_items WHERE id = ?1"),
        params![id.to_string()],
        from_row,
    )
    .optional()
    .map_err(LlmError::from)
}

fn load_all(conn: &Connection) -> Result<Vec<KnowledgeItem>, LlmError> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {COLUMNS} FROM knowledge_items ORDER BY relevance_score DESC"
    ))?;
    let items = stmt.query_map([], from_row)?.collect::<Result<Vec<_>, _>>()?;
    Ok(items)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use fisioflow_store::{ManualClock, PersistenceConfig};

    use super::*;

    fn kb() -> SqliteKnowledgeBase {
        let db = Arc::new(Database::open_in_memory(&PersistenceConfig::default()).expect("db"));
        let start = Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).single().expect("valid");
        SqliteKnowledgeBase::new(db, Arc::new(ManualClock::new(start))).expect("kb")
    }

    fn input(title: &str, tags: &[&str], score: u8) -> KnowledgeInput {
        KnowledgeInput {
            title: title.into(),
            content: format!("Protocol for {title}"),
            category: "protocols".into(),
            tags: tags.iter().map(|t| (*t).to_string()).collect(),
            relevance_score: score,
        }
    }

    #[test]
    fn crud_round_trip() {
        let kb = kb();
        let item = kb.add(&input("ACL rehab", &["knee", "acl"], 70)).expect("add");
        assert_eq!(kb.get(item.id).expect("get"), Some(item.clone()));

        let updated = kb
            .update(item.id, &input("ACL rehabilitation", &["knee"], 95))
            .expect("update")
            .expect("exists");
        assert_eq!(updated.relevance_score, 95);
        assert_eq!(updated.created_at, item.created_at);

        assert!(kb.delete(item.id).expect("delete"));
        assert!(!kb.delete(item.id).expect("delete again"));
        assert!(kb.update(item.id, &input("x", &[], 1)).expect("update").is_none());
    }

    #[test]
    fn validation_rejects_out_of_range_score_and_empty_title() {
        let kb = kb();
        assert!(matches!(kb.add(&input("x", &[], 101)), Err(LlmError::InvalidKnowledge(_))));
        assert!(matches!(kb.add(&input("  ", &[], 50)), Err(LlmError::InvalidKnowledge(_))));
    }

    #[test]
    fn search_is_case_insensitive_and_ranked_by_score() {
        let kb = kb();
        kb.add(&input("Low back pain", &["lumbar"], 60)).expect("add");
        kb.add(&input("Lumbar stabilisation", &["core"], 85)).expect("add");
        kb.add(&input("Shoulder impingement", &["rotator cuff"], 90)).expect("add");

        let hits = kb.search_blocking("LUMBAR", 5).expect("search");
        let titles: Vec<&str> = hits.iter().map(|m| m.item.title.as_str()).collect();
        assert_eq!(titles, vec!["Lumbar stabilisation", "Low back pain"]);
        assert!((hits[0].confidence - 0.85).abs() < 1e-9);

        // Tag contained in a longer prompt.
        let hits = kb
            .search_blocking("What exercises help a rotator cuff tear?", 5)
            .expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].item.title, "Shoulder impingement");

        assert!(kb.search_blocking("", 5).expect("search").is_empty());
        assert_eq!(kb.search_blocking("lumbar", 1).expect("search").len(), 1);
    }

    #[tokio::test]
    async fn async_search_matches_blocking_search() {
        let kb = kb();
        kb.add(&input("Ankle sprain", &["ankle"], 80)).expect("add");
        let hits = kb.search("ankle", 5).await.expect("search");
        assert_eq!(hits.len(), 1);
        assert!((hits[0].confidence - 0.80).abs() < 1e-9);
    }
}
