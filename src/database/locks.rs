//! Per-item processing locks shared by every worker process.

use super::{now_ts, Database, ProcessingLock};
use crate::error::{StoreError, StoreResult};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{ffi, params, ErrorCode, OptionalExtension};
use std::time::Duration;

impl Database {
    /// Claim `item_id` for `worker_id`.
    ///
    /// A plain insert against the primary key: exactly one concurrent caller
    /// wins, the rest get `false` immediately. Never blocks on the holder.
    pub fn acquire(&self, item_id: i64, worker_id: &str) -> StoreResult<bool> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT INTO locks (item_id, worker_id, locked_at) VALUES (?1, ?2, ?3)",
            params![item_id, worker_id, now_ts()],
        );

        match inserted {
            Ok(_) => Ok(true),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                if err.extended_code == ffi::SQLITE_CONSTRAINT_FOREIGNKEY {
                    Err(StoreError::NotFound(item_id))
                } else {
                    Ok(false)
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Drop the lock on `item_id` if `worker_id` holds it.
    pub fn release(&self, item_id: i64, worker_id: &str) -> StoreResult<bool> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM locks WHERE item_id = ?1 AND worker_id = ?2",
            params![item_id, worker_id],
        )?;
        Ok(deleted > 0)
    }

    /// Delete every lock older than `max_age`, whoever holds it.
    pub fn sweep_stale(&self, max_age: Duration) -> StoreResult<usize> {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(max_age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.sweep_locked_before(cutoff)
    }

    pub(crate) fn sweep_locked_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let conn = self.conn()?;
        let cutoff = cutoff.to_rfc3339_opts(SecondsFormat::Micros, true);
        let count = conn.execute("DELETE FROM locks WHERE locked_at < ?1", params![cutoff])?;
        if count > 0 {
            log::info!("Cleaned up {} stale locks", count);
        }
        Ok(count)
    }

    pub fn lock_holder(&self, item_id: i64) -> StoreResult<Option<ProcessingLock>> {
        let conn = self.conn()?;
        let lock = conn
            .query_row(
                "SELECT item_id, worker_id, locked_at FROM locks WHERE item_id = ?1",
                params![item_id],
                |row| {
                    Ok(ProcessingLock {
                        item_id: row.get(0)?,
                        worker_id: row.get(1)?,
                        locked_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(lock)
    }

    pub fn count_locks(&self) -> StoreResult<i64> {
        let conn = self.conn()?;
        let count = conn.query_row("SELECT COUNT(*) FROM locks", [], |row| row.get(0))?;
        Ok(count)
    }
}
