pub mod locks;
pub mod models;


use crate::error::{StoreError, StoreResult};
use chrono::{SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub use models::*;

const SCHEMA_VERSION: i64 = 1;

const ITEM_COLUMNS: &str = "id, queue_name, item_title, url, guid, status, error_message,
    audio_path, transcript_path, enrichment_path,
    download_started_at, download_completed_at,
    transcribe_started_at, transcribe_completed_at,
    enrich_started_at, enrich_completed_at,
    created_at, updated_at";

/// Durable item store and lock table backed by one SQLite file.
///
/// Every process (supervisor and each worker) opens its own handle on the
/// same file. WAL mode keeps readers from blocking behind the single writer,
/// and no item state is cached between calls.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("path", &self.path).finish()
    }
}

/// Timestamp format shared by every column, fixed-width so that text
/// comparison matches chronological order.
pub(crate) fn now_ts() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl Database {
    pub fn new(db_path: &Path) -> StoreResult<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(30))?;

        // Enable WAL mode for concurrent reads across worker processes
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA foreign_keys=ON;
            PRAGMA temp_store=MEMORY;
        ",
        )?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: db_path.to_path_buf(),
        };

        db.init_schema()?;

        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                queue_name TEXT NOT NULL,
                item_title TEXT NOT NULL,
                url TEXT,
                guid TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                error_message TEXT,
                audio_path TEXT,
                transcript_path TEXT,
                enrichment_path TEXT,
                download_started_at TEXT,
                download_completed_at TEXT,
                transcribe_started_at TEXT,
                transcribe_completed_at TEXT,
                enrich_started_at TEXT,
                enrich_completed_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(queue_name, item_title)
            );

            CREATE INDEX IF NOT EXISTS idx_items_status ON items(status);
            CREATE INDEX IF NOT EXISTS idx_items_queue ON items(queue_name);
            CREATE INDEX IF NOT EXISTS idx_items_queue_status ON items(queue_name, status);

            -- One row per claimed item, held by exactly one worker
            CREATE TABLE IF NOT EXISTS locks (
                item_id INTEGER PRIMARY KEY,
                worker_id TEXT NOT NULL,
                locked_at TEXT NOT NULL,
                FOREIGN KEY (item_id) REFERENCES items(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            "#,
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
            params![SCHEMA_VERSION],
        )?;
        Ok(())
    }

    /// Highest migration applied to this file.
    pub fn schema_version(&self) -> StoreResult<i64> {
        let conn = self.conn()?;
        let version = conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get::<_, Option<i64>>(0)
        })?;
        Ok(version.unwrap_or(0))
    }

    // =========================================================================
    // Item queries
    // =========================================================================

    /// Insert a new item or refresh `url`/`guid` on an existing one.
    ///
    /// Status is never touched on re-discovery.
    pub fn upsert(
        &self,
        queue_name: &str,
        item_title: &str,
        url: Option<&str>,
        guid: Option<&str>,
    ) -> StoreResult<i64> {
        self.upsert_item(queue_name, item_title, url, guid)
            .map(|(id, _)| id)
    }

    /// Same as [`Database::upsert`], also reporting whether the row is new.
    pub fn upsert_item(
        &self,
        queue_name: &str,
        item_title: &str,
        url: Option<&str>,
        guid: Option<&str>,
    ) -> StoreResult<(i64, bool)> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = now_ts();

        let existing_id: Option<i64> = tx
            .query_row(
                "SELECT id FROM items WHERE queue_name = ?1 AND item_title = ?2",
                params![queue_name, item_title],
                |row| row.get(0),
            )
            .optional()?;

        let result = if let Some(id) = existing_id {
            tx.execute(
                "UPDATE items SET
                    url = COALESCE(?1, url),
                    guid = COALESCE(?2, guid),
                    updated_at = ?3
                 WHERE id = ?4",
                params![url, guid, now, id],
            )?;
            (id, false)
        } else {
            tx.execute(
                "INSERT INTO items (queue_name, item_title, url, guid, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![queue_name, item_title, url, guid, ItemStatus::Pending, now],
            )?;
            (tx.last_insert_rowid(), true)
        };

        tx.commit()?;
        Ok(result)
    }

    /// Move an item to `new_status`.
    ///
    /// The status, its stage timestamp and the artifact path are written in
    /// one immediate transaction, guarded by a compare-and-set on the status
    /// that was validated.
    pub fn transition(
        &self,
        item_id: i64,
        new_status: ItemStatus,
        error_message: Option<&str>,
        artifact_path: Option<&str>,
    ) -> StoreResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: ItemStatus = tx
            .query_row(
                "SELECT status FROM items WHERE id = ?1",
                params![item_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(StoreError::NotFound(item_id))?;

        if !current.can_transition_to(new_status) {
            return Err(StoreError::InvalidTransition {
                item_id,
                from: current,
                to: new_status,
            });
        }

        let now = now_ts();
        let mut assignments: Vec<(&str, Value)> = vec![
            ("status", Value::Text(new_status.as_str().to_string())),
            ("updated_at", Value::Text(now.clone())),
        ];

        if matches!(new_status, ItemStatus::Failed | ItemStatus::Skipped) {
            let message = error_message.map(|m| Value::Text(m.to_string()));
            assignments.push(("error_message", message.unwrap_or(Value::Null)));
        }

        if let Some(column) = new_status.timestamp_column() {
            assignments.push((column, Value::Text(now)));
        }

        match (new_status.artifact_column(), artifact_path) {
            (Some(column), Some(path)) => assignments.push((column, Value::Text(path.to_string()))),
            (None, Some(path)) => {
                log::warn!(
                    "Ignoring artifact path {} for item {}: status {} has no artifact",
                    path,
                    item_id,
                    new_status
                );
            }
            _ => {}
        }

        let set_clause = assignments
            .iter()
            .enumerate()
            .map(|(i, (column, _))| format!("{} = ?{}", column, i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let n = assignments.len();
        let sql = format!(
            "UPDATE items SET {} WHERE id = ?{} AND status = ?{}",
            set_clause,
            n + 1,
            n + 2
        );

        let mut values: Vec<Value> = assignments.into_iter().map(|(_, v)| v).collect();
        values.push(Value::Integer(item_id));
        values.push(Value::Text(current.as_str().to_string()));

        let updated = tx.execute(&sql, params_from_iter(values))?;
        if updated != 1 {
            // Unreachable under an immediate transaction, kept as a hard guard.
            return Err(StoreError::InvalidTransition {
                item_id,
                from: current,
                to: new_status,
            });
        }

        tx.commit()?;
        log::debug!("Item {} status {} -> {}", item_id, current, new_status);
        Ok(())
    }

    /// Demote one in-progress item to the stable status before it.
    ///
    /// Used by a worker that gives an item back (transient source failure or
    /// interruption). Returns false if the item was not in progress.
    pub fn demote(&self, item_id: i64) -> StoreResult<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: ItemStatus = tx
            .query_row(
                "SELECT status FROM items WHERE id = ?1",
                params![item_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(StoreError::NotFound(item_id))?;

        let Some(target) = current.demoted() else {
            return Ok(false);
        };

        tx.execute(
            "UPDATE items SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
            params![target, now_ts(), item_id, current],
        )?;
        tx.commit()?;
        log::debug!("Item {} demoted {} -> {}", item_id, current, target);
        Ok(true)
    }

    pub fn get(&self, item_id: i64) -> StoreResult<Option<WorkItem>> {
        let conn = self.conn()?;
        let item = conn
            .query_row(
                &format!("SELECT {} FROM items WHERE id = ?1", ITEM_COLUMNS),
                params![item_id],
                map_item,
            )
            .optional()?;
        Ok(item)
    }

    pub fn find(&self, queue_name: &str, item_title: &str) -> StoreResult<Option<WorkItem>> {
        let conn = self.conn()?;
        let item = conn
            .query_row(
                &format!(
                    "SELECT {} FROM items WHERE queue_name = ?1 AND item_title = ?2",
                    ITEM_COLUMNS
                ),
                params![queue_name, item_title],
                map_item,
            )
            .optional()?;
        Ok(item)
    }

    /// Items in `status`, oldest first, optionally restricted to one queue.
    pub fn list_by_status(
        &self,
        status: ItemStatus,
        queue_name: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<WorkItem>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM items
             WHERE status = ?1 AND (?2 IS NULL OR queue_name = ?2)
             ORDER BY created_at ASC, id ASC
             LIMIT ?3",
            ITEM_COLUMNS
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let items = stmt
            .query_map(params![status, queue_name, limit], map_item)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }

    // =========================================================================
    // Stats queries
    // =========================================================================

    /// Item count per status; every status is present, zero when empty.
    pub fn stats(&self, queue_name: Option<&str>) -> StoreResult<BTreeMap<ItemStatus, i64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM items
             WHERE (?1 IS NULL OR queue_name = ?1)
             GROUP BY status",
        )?;
        let rows = stmt.query_map(params![queue_name], |row| {
            Ok((row.get::<_, ItemStatus>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut stats: BTreeMap<ItemStatus, i64> =
            ItemStatus::ALL.iter().map(|status| (*status, 0)).collect();
        for row in rows {
            let (status, count) = row?;
            stats.insert(status, count);
        }
        Ok(stats)
    }

    pub fn count_items(&self, queue_name: &str) -> StoreResult<i64> {
        let conn = self.conn()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM items WHERE queue_name = ?1",
            params![queue_name],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn queue_names(&self) -> StoreResult<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT DISTINCT queue_name FROM items ORDER BY queue_name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    pub fn queue_stats(&self) -> StoreResult<Vec<QueueStats>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT
                queue_name,
                COUNT(*),
                SUM(CASE WHEN status = 'enriched' THEN 1 ELSE 0 END),
                SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END),
                SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END)
             FROM items
             GROUP BY queue_name
             ORDER BY queue_name",
        )?;
        let stats = stmt
            .query_map([], |row| {
                Ok(QueueStats {
                    queue_name: row.get(0)?,
                    total: row.get(1)?,
                    enriched: row.get(2)?,
                    failed: row.get(3)?,
                    pending: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(stats)
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Demote every in-progress item one stage back after an unclean shutdown.
    ///
    /// Must run before any worker is launched. Locks still held on those items
    /// belong to dead workers and are cleared in the same transaction.
    pub fn recover_stuck(&self) -> StoreResult<RecoveryReport> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = now_ts();
        let mut report = RecoveryReport::default();

        report.orphaned = tx.query_row(
            "SELECT COUNT(*) FROM items i
             WHERE i.status IN ('downloading', 'transcribing', 'enriching')
               AND NOT EXISTS (SELECT 1 FROM locks l WHERE l.item_id = i.id)",
            [],
            |row| row.get::<_, i64>(0),
        )? as usize;

        report.locks_cleared = tx.execute(
            "DELETE FROM locks WHERE item_id IN (
                SELECT id FROM items WHERE status IN ('downloading', 'transcribing', 'enriching')
             )",
            [],
        )?;

        for status in ItemStatus::IN_PROGRESS {
            let Some(target) = status.demoted() else {
                continue;
            };
            let count = tx.execute(
                "UPDATE items SET status = ?1, updated_at = ?2 WHERE status = ?3",
                params![target, now, status],
            )?;
            match status {
                ItemStatus::Downloading => report.downloading = count,
                ItemStatus::Transcribing => report.transcribing = count,
                _ => report.enriching = count,
            }
        }

        tx.commit()?;

        if report.total() > 0 {
            log::info!(
                "Reset {} stuck items: {} downloading, {} transcribing, {} enriching ({} without a lock)",
                report.total(),
                report.downloading,
                report.transcribing,
                report.enriching,
                report.orphaned
            );
        }

        Ok(report)
    }
}

fn map_item(row: &Row<'_>) -> rusqlite::Result<WorkItem> {
    Ok(WorkItem {
        id: row.get(0)?,
        queue_name: row.get(1)?,
        item_title: row.get(2)?,
        url: row.get(3)?,
        guid: row.get(4)?,
        status: row.get(5)?,
        error_message: row.get(6)?,
        audio_path: row.get(7)?,
        transcript_path: row.get(8)?,
        enrichment_path: row.get(9)?,
        download_started_at: row.get(10)?,
        download_completed_at: row.get(11)?,
        transcribe_started_at: row.get(12)?,
        transcribe_completed_at: row.get(13)?,
        enrich_started_at: row.get(14)?,
        enrich_completed_at: row.get(15)?,
        created_at: row.get(16)?,
        updated_at: row.get(17)?,
    })
}
