//! Long-term summary archive.
//!
//! Summaries are written once by compression and read back by importance and
//! recency. The SQLite backend opens a connection per call; writes are rare.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{PoisonError, RwLock};

use rusqlite::{params, Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::turn::Turn;
use crate::error::{CoreError, CoreResult};

/// Summaries at or above this score survive pruning by default.
pub const HIGH_IMPORTANCE: f32 = 0.8;

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub id: i64,
    pub session_id: String,
    pub summary: String,
    /// Number of turns folded into this summary. Always at least one.
    pub original_turns: usize,
    pub token_count: usize,
    pub importance: f32,
    pub created_at_ms: i64,
    pub metadata: serde_json::Value,
}

/// Input to [`SummaryStore::add`].
#[derive(Debug, Clone)]
pub struct NewSummary {
    pub session_id: String,
    pub summary: String,
    pub turns: Vec<Turn>,
    pub token_count: usize,
    pub importance: f32,
    pub metadata: serde_json::Value,
}

impl NewSummary {
    fn validate(&self) -> CoreResult<()> {
        if self.turns.is_empty() {
            return Err(CoreError::Store("summary must reference at least one turn".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SummaryStats {
    pub count: usize,
    pub average_importance: f32,
}

pub trait SummaryStore: Send + Sync {
    fn add(&self, summary: NewSummary) -> CoreResult<i64>;

    /// Newest first, filtered by minimum importance.
    fn recent(&self, limit: usize, min_importance: f32) -> CoreResult<Vec<Summary>>;

    /// Newest first.
    fn by_session(&self, session_id: &str, limit: usize) -> CoreResult<Vec<Summary>>;

    /// Highest importance first, ties newest first.
    fn high_importance(&self, min_importance: f32, limit: usize) -> CoreResult<Vec<Summary>>;

    /// Returns `false` when the id is unknown.
    fn update_importance(&self, id: i64, importance: f32) -> CoreResult<bool>;

    /// Returns `false` when the id is unknown.
    fn delete(&self, id: i64) -> CoreResult<bool>;

    /// Delete summaries older than `days` unless their importance is at least `keep_at_or_above`.
    fn prune_older_than(&self, days: u32, keep_at_or_above: f32) -> CoreResult<usize>;

    fn stats(&self) -> CoreResult<SummaryStats>;
}

fn cutoff_ms(days: u32) -> i64 {
    now_ms() - i64::from(days) * 24 * 60 * 60 * 1000
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

pub struct SqliteSummaryStore {
    db_path: PathBuf,
}

impl SqliteSummaryStore {
    pub fn new(db_path: PathBuf) -> CoreResult<Self> {
        let this = Self { db_path };
        this.init()?;
        Ok(this)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn open(&self) -> CoreResult<Connection> {
        Ok(Connection::open_with_flags(
            &self.db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?)
    }

    fn init(&self) -> CoreResult<()> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CoreError::Store(format!("create {}: {e}", parent.display())))?;
        }
        let conn = self.open()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS conversation_summaries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                summary TEXT NOT NULL,
                original_messages TEXT NOT NULL,
                message_count INTEGER NOT NULL,
                token_count INTEGER NOT NULL,
                importance_score REAL NOT NULL DEFAULT 0.5,
                created_at_ms INTEGER NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}'
            );
            CREATE INDEX IF NOT EXISTS idx_summaries_session ON conversation_summaries(session_id);
            CREATE INDEX IF NOT EXISTS idx_summaries_importance ON conversation_summaries(importance_score);
            CREATE INDEX IF NOT EXISTS idx_summaries_created ON conversation_summaries(created_at_ms);
            "#,
        )?;
        Ok(())
    }

    fn query(&self, sql: &str, params: impl rusqlite::Params) -> CoreResult<Vec<Summary>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, |row| {
            let metadata: String = row.get(7)?;
            Ok(Summary {
                id: row.get(0)?,
                session_id: row.get(1)?,
                summary: row.get(2)?,
                original_turns: row.get::<_, i64>(3)? as usize,
                token_count: row.get::<_, i64>(4)? as usize,
                importance: row.get::<_, f64>(5)? as f32,
                created_at_ms: row.get(6)?,
                metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

const SELECT_COLUMNS: &str = "SELECT id, session_id, summary, message_count, token_count, importance_score, created_at_ms, metadata FROM conversation_summaries";

impl SummaryStore for SqliteSummaryStore {
    fn add(&self, summary: NewSummary) -> CoreResult<i64> {
        summary.validate()?;
        let originals = serde_json::to_string(&summary.turns)?;
        let metadata = serde_json::to_string(&summary.metadata)?;
        let conn = self.open()?;
        conn.execute(
            r#"
            INSERT INTO conversation_summaries
                (session_id, summary, original_messages, message_count, token_count, importance_score, created_at_ms, metadata)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                summary.session_id,
                summary.summary,
                originals,
                summary.turns.len() as i64,
                summary.token_count as i64,
                f64::from(summary.importance),
                now_ms(),
                metadata
            ],
        )?;
        let id = conn.last_insert_rowid();
        info!(target: "chino::memory", id, importance = summary.importance, "stored summary");
        Ok(id)
    }

    fn recent(&self, limit: usize, min_importance: f32) -> CoreResult<Vec<Summary>> {
        self.query(
            &format!("{SELECT_COLUMNS} WHERE importance_score >= ?1 ORDER BY created_at_ms DESC, id DESC LIMIT ?2"),
            params![f64::from(min_importance), limit as i64],
        )
    }

    fn by_session(&self, session_id: &str, limit: usize) -> CoreResult<Vec<Summary>> {
        self.query(
            &format!("{SELECT_COLUMNS} WHERE session_id = ?1 ORDER BY created_at_ms DESC, id DESC LIMIT ?2"),
            params![session_id, limit as i64],
        )
    }

    fn high_importance(&self, min_importance: f32, limit: usize) -> CoreResult<Vec<Summary>> {
        self.query(
            &format!(
                "{SELECT_COLUMNS} WHERE importance_score >= ?1 ORDER BY importance_score DESC, created_at_ms DESC, id DESC LIMIT ?2"
            ),
            params![f64::from(min_importance), limit as i64],
        )
    }

    fn update_importance(&self, id: i64, importance: f32) -> CoreResult<bool> {
        let conn = self.open()?;
        let n = conn.execute(
            "UPDATE conversation_summaries SET importance_score = ?1 WHERE id = ?2",
            params![f64::from(importance.clamp(0.0, 1.0)), id],
        )?;
        Ok(n > 0)
    }

    fn delete(&self, id: i64) -> CoreResult<bool> {
        let conn = self.open()?;
        let n = conn.execute("DELETE FROM conversation_summaries WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    fn prune_older_than(&self, days: u32, keep_at_or_above: f32) -> CoreResult<usize> {
        let conn = self.open()?;
        let n = conn.execute(
            "DELETE FROM conversation_summaries WHERE created_at_ms < ?1 AND importance_score < ?2",
            params![cutoff_ms(days), f64::from(keep_at_or_above)],
        )?;
        if n > 0 {
            info!(target: "chino::memory", removed = n, days, "pruned old summaries");
        }
        Ok(n)
    }

    fn stats(&self) -> CoreResult<SummaryStats> {
        let conn = self.open()?;
        let (count, avg): (i64, Option<f64>) = conn.query_row(
            "SELECT COUNT(*), AVG(importance_score) FROM conversation_summaries",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(SummaryStats {
            count: count as usize,
            average_importance: avg.unwrap_or(0.0) as f32,
        })
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemorySummaryStore {
    rows: RwLock<Vec<Summary>>,
    next_id: AtomicI64,
}

impl InMemorySummaryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn newest_first(mut rows: Vec<Summary>) -> Vec<Summary> {
        rows.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms).then(b.id.cmp(&a.id)));
        rows
    }
}

impl SummaryStore for InMemorySummaryStore {
    fn add(&self, summary: NewSummary) -> CoreResult<i64> {
        summary.validate()?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.rows.write().unwrap_or_else(PoisonError::into_inner).push(Summary {
            id,
            session_id: summary.session_id,
            summary: summary.summary,
            original_turns: summary.turns.len(),
            token_count: summary.token_count,
            importance: summary.importance,
            created_at_ms: now_ms(),
            metadata: summary.metadata,
        });
        Ok(id)
    }

    fn recent(&self, limit: usize, min_importance: f32) -> CoreResult<Vec<Summary>> {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        let matching = rows.iter().filter(|s| s.importance >= min_importance).cloned().collect();
        Ok(Self::newest_first(matching).into_iter().take(limit).collect())
    }

    fn by_session(&self, session_id: &str, limit: usize) -> CoreResult<Vec<Summary>> {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        let matching = rows.iter().filter(|s| s.session_id == session_id).cloned().collect();
        Ok(Self::newest_first(matching).into_iter().take(limit).collect())
    }

    fn high_importance(&self, min_importance: f32, limit: usize) -> CoreResult<Vec<Summary>> {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        let mut matching: Vec<Summary> =
            Self::newest_first(rows.iter().filter(|s| s.importance >= min_importance).cloned().collect());
        matching.sort_by(|a, b| b.importance.total_cmp(&a.importance));
        Ok(matching.into_iter().take(limit).collect())
    }

    fn update_importance(&self, id: i64, importance: f32) -> CoreResult<bool> {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        match rows.iter_mut().find(|s| s.id == id) {
            Some(row) => {
                row.importance = importance.clamp(0.0, 1.0);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn delete(&self, id: i64) -> CoreResult<bool> {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        let before = rows.len();
        rows.retain(|s| s.id != id);
        Ok(rows.len() != before)
    }

    fn prune_older_than(&self, days: u32, keep_at_or_above: f32) -> CoreResult<usize> {
        let cutoff = cutoff_ms(days);
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        let before = rows.len();
        rows.retain(|s| s.created_at_ms >= cutoff || s.importance >= keep_at_or_above);
        Ok(before - rows.len())
    }

    fn stats(&self) -> CoreResult<SummaryStats> {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        let count = rows.len();
        let average_importance = if count == 0 {
            0.0
        } else {
            rows.iter().map(|s| s.importance).sum::<f32>() / count as f32
        };
        Ok(SummaryStats { count, average_importance })
    }
}
