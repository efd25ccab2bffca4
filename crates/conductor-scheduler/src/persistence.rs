//! SQLite-backed cron job source.
//! Rows are claimed per minute with a conditional UPDATE, so overlapping
//! polls never hand out the same row twice for one minute.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_core::error::{ConductorError, Result};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cron::{self, CronExpr};
use crate::job::{CommandJob, Job};
use crate::source::JobSource;

/// One row of the `cron_jobs` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJobRecord {
    pub id: Uuid,
    pub name: String,
    pub schedule: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    pub active: bool,
    /// Minute key of the last claim, e.g. "2026-02-22T10:30".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_claimed: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl CronJobRecord {
    pub fn new(name: &str, schedule: &str, command: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            schedule: schedule.to_string(),
            command: command.to_string(),
            user_id: None,
            active: true,
            last_claimed: None,
            created_at: Utc::now(),
        }
    }

    /// A fresh pending job carrying this row's id.
    pub fn to_job(&self) -> CommandJob {
        let job = CommandJob::with_id(self.id, &self.name, &self.schedule, &self.command);
        match self.user_id {
            Some(user) => job.with_user(user),
            None => job,
        }
    }
}

fn db_err(context: &'static str) -> impl FnOnce(rusqlite::Error) -> ConductorError {
    move |e| ConductorError::Database(format!("{context}: {e}"))
}

/// Cron jobs stored in SQLite.
pub struct SqliteJobSource {
    conn: Mutex<Connection>,
}

impl SqliteJobSource {
    /// Open or create the database file.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err("DB open"))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err("DB open"))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let source = Self {
            conn: Mutex::new(conn),
        };
        source.migrate()?;
        Ok(source)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn migrate(&self) -> Result<()> {
        self.conn()
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS cron_jobs (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                schedule TEXT NOT NULL,
                command TEXT NOT NULL,
                user_id TEXT,
                active INTEGER NOT NULL DEFAULT 1,
                last_claimed TEXT,              -- minute key of the last claim
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_cron_jobs_active ON cron_jobs(active);
         ",
            )
            .map_err(db_err("Migration"))
    }

    /// Insert or replace a job. The schedule must parse.
    pub fn add_job(&self, record: &CronJobRecord) -> Result<()> {
        CronExpr::parse(&record.schedule).map_err(ConductorError::Scheduling)?;
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO cron_jobs
                 (id, name, schedule, command, user_id, active, last_claimed, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    record.id.to_string(),
                    record.name,
                    record.schedule,
                    record.command,
                    record.user_id.map(|u| u.to_string()),
                    record.active as i32,
                    record.last_claimed,
                    record.created_at.to_rfc3339(),
                ],
            )
            .map_err(db_err("Save job"))?;
        tracing::info!("📅 Cron job stored: '{}' ({})", record.name, record.id);
        Ok(())
    }

    /// Returns whether a row was deleted.
    pub fn remove_job(&self, id: Uuid) -> Result<bool> {
        let changed = self
            .conn()
            .execute("DELETE FROM cron_jobs WHERE id = ?1", [id.to_string()])
            .map_err(db_err("Delete job"))?;
        Ok(changed > 0)
    }

    /// Returns whether the row exists.
    pub fn set_active(&self, id: Uuid, active: bool) -> Result<bool> {
        let changed = self
            .conn()
            .execute(
                "UPDATE cron_jobs SET active = ?1 WHERE id = ?2",
                rusqlite::params![active as i32, id.to_string()],
            )
            .map_err(db_err("Update job"))?;
        Ok(changed > 0)
    }

    /// Forget the last claim so the row can be claimed again this minute.
    pub fn release_claim(&self, id: Uuid) -> Result<bool> {
        let changed = self
            .conn()
            .execute(
                "UPDATE cron_jobs SET last_claimed = NULL WHERE id = ?1",
                [id.to_string()],
            )
            .map_err(db_err("Release job"))?;
        Ok(changed > 0)
    }

    pub fn get_job(&self, id: Uuid) -> Result<Option<CronJobRecord>> {
        self.conn()
            .query_row(
                "SELECT id, name, schedule, command, user_id, active, last_claimed, created_at
                 FROM cron_jobs WHERE id = ?1",
                [id.to_string()],
                row_to_record,
            )
            .optional()
            .map_err(db_err("Load job"))
    }

    /// All rows, oldest first.
    pub fn list_jobs(&self) -> Result<Vec<CronJobRecord>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, name, schedule, command, user_id, active, last_claimed, created_at
                 FROM cron_jobs ORDER BY created_at",
            )
            .map_err(db_err("List jobs"))?;
        let rows = stmt
            .query_map([], row_to_record)
            .map_err(db_err("List jobs"))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err("List jobs"))
    }

    /// Claim every active row due in the minute containing `at`.
    /// A row already claimed for that minute is skipped.
    pub fn claim_due(&self, at: DateTime<Utc>) -> Result<Vec<CronJobRecord>> {
        let key = cron::minute_key(at);
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(db_err("Begin claim"))?;

        let candidates = {
            let mut stmt = tx
                .prepare(
                    "SELECT id, name, schedule, command, user_id, active, last_claimed, created_at
                     FROM cron_jobs WHERE active = 1 ORDER BY created_at",
                )
                .map_err(db_err("Claim jobs"))?;
            let rows = stmt
                .query_map([], row_to_record)
                .map_err(db_err("Claim jobs"))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(db_err("Claim jobs"))?
        };

        let mut claimed = Vec::new();
        for mut record in candidates {
            if !cron::is_due(&record.schedule, at) {
                continue;
            }
            let changed = tx
                .execute(
                    "UPDATE cron_jobs SET last_claimed = ?1
                     WHERE id = ?2 AND (last_claimed IS NULL OR last_claimed <> ?1)",
                    rusqlite::params![key, record.id.to_string()],
                )
                .map_err(db_err("Claim job"))?;
            if changed == 1 {
                record.last_claimed = Some(key.clone());
                claimed.push(record);
            }
        }

        tx.commit().map_err(db_err("Commit claim"))?;
        Ok(claimed)
    }
}

#[async_trait]
impl JobSource for SqliteJobSource {
    async fn get_scheduled_cron_jobs(&self) -> Result<Vec<Arc<dyn Job>>> {
        let claimed = self.claim_due(Utc::now())?;
        Ok(claimed
            .iter()
            .map(|record| Arc::new(record.to_job()) as Arc<dyn Job>)
            .collect())
    }

    async fn release(&self, id: Uuid) -> Result<()> {
        self.release_claim(id)?;
        Ok(())
    }

    fn label(&self) -> &str {
        "sqlite"
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<CronJobRecord> {
    let id: String = row.get(0)?;
    let user_id: Option<String> = row.get(4)?;
    let created_at: String = row.get(7)?;
    Ok(CronJobRecord {
        // Malformed ids surface as nil so health checks can flag them.
        id: Uuid::parse_str(&id).unwrap_or_default(),
        name: row.get(1)?,
        schedule: row.get(2)?,
        command: row.get(3)?,
        user_id: user_id.and_then(|u| Uuid::parse_str(&u).ok()),
        active: row.get::<_, i32>(5)? != 0,
        last_claimed: row.get(6)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}
