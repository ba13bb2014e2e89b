//! SQLite persistence for scan state, tasks, and briefings.
//!
//! The database lives at `~/.mailminder/mailminder.db`. Schema application
//! is idempotent (every statement uses IF NOT EXISTS), so `open` can run on
//! every start. The connection wrapper is intentionally not `Clone` or
//! `Sync`; callers hold it behind a mutex where sharing is needed.

use std::path::PathBuf;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use uuid::Uuid;

use crate::types::{
    BriefingPreference, Notification, Priority, Provider, ScanConfig, ScanLog, ScanStatus,
    ScanTally, Task, TaskStatus,
};

/// Errors specific to database operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Duplicate source for external id {0}")]
    DuplicateSource(String),

    #[error("Unknown provider stored in config row: {0}")]
    UnknownProvider(String),
}

impl DbError {
    /// True when an insert collided with a unique constraint.
    pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
        matches!(
            err,
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == rusqlite::ErrorCode::ConstraintViolation
        )
    }
}

/// SQLite connection wrapper.
pub struct Db {
    conn: Connection,
}

impl Db {
    /// Open (or create) the database at `~/.mailminder/mailminder.db`.
    pub fn open() -> Result<Self, DbError> {
        let home = dirs::home_dir().ok_or(DbError::HomeDirNotFound)?;
        Self::open_at(home.join(".mailminder").join("mailminder.db"))
    }

    /// Open a database at an explicit path. Useful for testing.
    pub fn open_at(path: PathBuf) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok(Self { conn })
    }

    /// In-memory database for tests.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok(Self { conn })
    }

    // =========================================================================
    // Scan configs
    // =========================================================================

    /// Insert or update a config, keyed by (workspace, user, provider).
    pub fn upsert_scan_config(&self, config: &ScanConfig) -> Result<(), DbError> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO scan_configs (
                 id, workspace_id, user_id, provider, enabled, scan_interval_hours,
                 confidence_threshold, quiet_hours_start, quiet_hours_end,
                 weekend_scan, access_token_enc, refresh_token_enc,
                 mailbox_address, last_scan_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT (workspace_id, user_id, provider) DO UPDATE SET
                 enabled = excluded.enabled,
                 scan_interval_hours = excluded.scan_interval_hours,
                 confidence_threshold = excluded.confidence_threshold,
                 quiet_hours_start = excluded.quiet_hours_start,
                 quiet_hours_end = excluded.quiet_hours_end,
                 weekend_scan = excluded.weekend_scan,
                 access_token_enc = excluded.access_token_enc,
                 refresh_token_enc = excluded.refresh_token_enc,
                 mailbox_address = excluded.mailbox_address,
                 updated_at = excluded.updated_at",
            params![
                config.id,
                config.workspace_id,
                config.user_id,
                config.provider.as_str(),
                config.enabled,
                config.scan_interval_hours,
                config.confidence_threshold,
                config.quiet_hours_start,
                config.quiet_hours_end,
                config.weekend_scan,
                config.access_token_enc,
                config.refresh_token_enc,
                config.mailbox_address,
                config.last_scan_at,
                now,
            ],
        )?;
        Ok(())
    }

    pub fn get_scan_config(&self, id: &str) -> Result<Option<ScanConfig>, DbError> {
        let mut stmt = self
            .conn
            .prepare(&format!("{} WHERE id = ?1", SELECT_CONFIG))?;
        let row = stmt
            .query_row(params![id], map_config_row)
            .optional()?
            .transpose()?;
        Ok(row)
    }

    /// All enabled configs, for the recurring sweep.
    pub fn list_enabled_configs(&self) -> Result<Vec<ScanConfig>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE enabled = 1 ORDER BY workspace_id, user_id",
            SELECT_CONFIG
        ))?;
        let rows = stmt.query_map([], map_config_row)?;

        let mut configs = Vec::new();
        for row in rows {
            configs.push(row??);
        }
        Ok(configs)
    }

    /// Persist a freshly refreshed (re-encrypted) access token.
    ///
    /// Called immediately after a successful refresh, before any email work,
    /// so a later failure can't discard the new token.
    pub fn update_access_token(&self, config_id: &str, token_enc: &str) -> Result<(), DbError> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "UPDATE scan_configs SET access_token_enc = ?1, updated_at = ?2 WHERE id = ?3",
            params![token_enc, now, config_id],
        )?;
        Ok(())
    }

    pub fn update_last_scan(&self, config_id: &str, at: &str) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE scan_configs SET last_scan_at = ?1, updated_at = ?1 WHERE id = ?2",
            params![at, config_id],
        )?;
        Ok(())
    }

    // =========================================================================
    // Scan logs
    // =========================================================================

    /// Create a `running` log row at scan start. Returns the log id.
    pub fn insert_scan_log(&self, workspace_id: &str, user_id: &str) -> Result<String, DbError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO scan_logs (id, workspace_id, user_id, status, started_at)
             VALUES (?1, ?2, ?3, 'running', ?4)",
            params![id, workspace_id, user_id, now],
        )?;
        Ok(id)
    }

    /// Finalize a log row with counts, errors, and terminal status.
    pub fn finalize_scan_log(
        &self,
        log_id: &str,
        tally: &ScanTally,
        status: ScanStatus,
    ) -> Result<(), DbError> {
        let errors = serde_json::to_string(&tally.errors).unwrap_or_else(|_| "[]".to_string());
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "UPDATE scan_logs
             SET emails_scanned = ?1, tasks_extracted = ?2, tasks_for_review = ?3,
                 errors = ?4, status = ?5, completed_at = ?6
             WHERE id = ?7",
            params![
                tally.emails_scanned,
                tally.tasks_extracted,
                tally.tasks_for_review,
                errors,
                status.as_str(),
                now,
                log_id,
            ],
        )?;
        Ok(())
    }

    /// Most recent scan runs for a user, newest first.
    pub fn recent_scan_logs(
        &self,
        workspace_id: &str,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<ScanLog>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, workspace_id, user_id, emails_scanned, tasks_extracted,
                    tasks_for_review, errors, status, started_at, completed_at
             FROM scan_logs
             WHERE workspace_id = ?1 AND user_id = ?2
             ORDER BY started_at DESC
             LIMIT ?3",
        )?;

        let rows = stmt.query_map(params![workspace_id, user_id, limit], |row| {
            let errors_json: String = row.get(6)?;
            let status: String = row.get(7)?;
            Ok(ScanLog {
                id: row.get(0)?,
                workspace_id: row.get(1)?,
                user_id: row.get(2)?,
                emails_scanned: row.get(3)?,
                tasks_extracted: row.get(4)?,
                tasks_for_review: row.get(5)?,
                errors: serde_json::from_str(&errors_json).unwrap_or_default(),
                status: ScanStatus::parse(&status),
                started_at: row.get(8)?,
                completed_at: row.get(9)?,
            })
        })?;

        let mut logs = Vec::new();
        for row in rows {
            logs.push(row?);
        }
        Ok(logs)
    }

    // =========================================================================
    // Sources (dedup anchors)
    // =========================================================================

    pub fn source_exists(&self, workspace_id: &str, external_id: &str) -> Result<bool, DbError> {
        let found: Option<String> = self
            .conn
            .query_row(
                "SELECT id FROM sources
                 WHERE workspace_id = ?1 AND source_type = 'email' AND external_id = ?2",
                params![workspace_id, external_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Insert a dedup anchor. The unique index makes this idempotent-or-erroring:
    /// a concurrent duplicate surfaces as `DuplicateSource` rather than a second row.
    pub fn insert_source(&self, workspace_id: &str, external_id: &str) -> Result<String, DbError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let result = self.conn.execute(
            "INSERT INTO sources (id, workspace_id, source_type, external_id, created_at)
             VALUES (?1, ?2, 'email', ?3, ?4)",
            params![id, workspace_id, external_id, now],
        );
        match result {
            Ok(_) => Ok(id),
            Err(e) if DbError::is_unique_violation(&e) => {
                Err(DbError::DuplicateSource(external_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    // =========================================================================
    // Tasks
    // =========================================================================

    pub fn insert_task(&self, task: &Task) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO tasks (
                 id, workspace_id, user_id, title, description, priority, status,
                 due_date, needs_review, confidence, project_id, source_id,
                 completed_at, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                task.id,
                task.workspace_id,
                task.user_id,
                task.title,
                task.description,
                task.priority.as_str(),
                task.status.as_str(),
                task.due_date,
                task.needs_review,
                task.confidence,
                task.project_id,
                task.source_id,
                task.completed_at,
                task.created_at,
            ],
        )?;
        Ok(())
    }

    /// Snapshot of a user's tasks, for briefing generation.
    pub fn tasks_for_user(&self, workspace_id: &str, user_id: &str) -> Result<Vec<Task>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, workspace_id, user_id, title, description, priority, status,
                    due_date, needs_review, confidence, project_id, source_id,
                    completed_at, created_at
             FROM tasks
             WHERE workspace_id = ?1 AND user_id = ?2
             ORDER BY created_at",
        )?;

        let rows = stmt.query_map(params![workspace_id, user_id], |row| {
            let priority: String = row.get(5)?;
            let status: String = row.get(6)?;
            Ok(Task {
                id: row.get(0)?,
                workspace_id: row.get(1)?,
                user_id: row.get(2)?,
                title: row.get(3)?,
                description: row.get(4)?,
                priority: Priority::parse_lenient(&priority),
                status: TaskStatus::parse(&status),
                due_date: row.get(7)?,
                needs_review: row.get(8)?,
                confidence: row.get(9)?,
                project_id: row.get(10)?,
                source_id: row.get(11)?,
                completed_at: row.get(12)?,
                created_at: row.get(13)?,
            })
        })?;

        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }

    #[cfg(test)]
    pub fn count_tasks(&self, workspace_id: &str) -> Result<i64, DbError> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE workspace_id = ?1",
            params![workspace_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // =========================================================================
    // Briefings
    // =========================================================================

    /// Create or overwrite the briefing for (workspace, user, date).
    pub fn upsert_briefing(
        &self,
        workspace_id: &str,
        user_id: &str,
        briefing_date: &str,
        content_json: &str,
    ) -> Result<(), DbError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO briefings (id, workspace_id, user_id, briefing_date, content, generated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (workspace_id, user_id, briefing_date) DO UPDATE SET
                 content = excluded.content,
                 feedback = NULL,
                 generated_at = excluded.generated_at",
            params![id, workspace_id, user_id, briefing_date, content_json, now],
        )?;
        Ok(())
    }

    pub fn get_briefing(
        &self,
        workspace_id: &str,
        user_id: &str,
        briefing_date: &str,
    ) -> Result<Option<(String, Option<String>)>, DbError> {
        let row = self
            .conn
            .query_row(
                "SELECT content, feedback FROM briefings
                 WHERE workspace_id = ?1 AND user_id = ?2 AND briefing_date = ?3",
                params![workspace_id, user_id, briefing_date],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row)
    }

    /// Attach user feedback (thumbs_up / thumbs_down / none) to a briefing.
    pub fn set_briefing_feedback(
        &self,
        workspace_id: &str,
        user_id: &str,
        briefing_date: &str,
        feedback: Option<&str>,
    ) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE briefings SET feedback = ?1
             WHERE workspace_id = ?2 AND user_id = ?3 AND briefing_date = ?4",
            params![feedback, workspace_id, user_id, briefing_date],
        )?;
        Ok(())
    }

    // =========================================================================
    // Briefing preferences
    // =========================================================================

    pub fn upsert_preference(&self, pref: &BriefingPreference) -> Result<(), DbError> {
        let project_filter =
            serde_json::to_string(&pref.project_filter).unwrap_or_else(|_| "[]".to_string());
        let priority_filter =
            serde_json::to_string(&pref.priority_filter).unwrap_or_else(|_| "[]".to_string());
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO briefing_preferences (
                 workspace_id, user_id, delivery_time, timezone, enabled,
                 include_email, project_filter, priority_filter, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT (workspace_id, user_id) DO UPDATE SET
                 delivery_time = excluded.delivery_time,
                 timezone = excluded.timezone,
                 enabled = excluded.enabled,
                 include_email = excluded.include_email,
                 project_filter = excluded.project_filter,
                 priority_filter = excluded.priority_filter,
                 updated_at = excluded.updated_at",
            params![
                pref.workspace_id,
                pref.user_id,
                pref.delivery_time,
                pref.timezone,
                pref.enabled,
                pref.include_email,
                project_filter,
                priority_filter,
                now,
            ],
        )?;
        Ok(())
    }

    /// Stored preference, or the documented defaults when no row exists.
    pub fn preference_or_default(
        &self,
        workspace_id: &str,
        user_id: &str,
    ) -> Result<BriefingPreference, DbError> {
        let row = self
            .conn
            .query_row(
                "SELECT delivery_time, timezone, enabled, include_email,
                        project_filter, priority_filter
                 FROM briefing_preferences
                 WHERE workspace_id = ?1 AND user_id = ?2",
                params![workspace_id, user_id],
                |row| {
                    let project_filter: String = row.get(4)?;
                    let priority_filter: String = row.get(5)?;
                    Ok(BriefingPreference {
                        workspace_id: workspace_id.to_string(),
                        user_id: user_id.to_string(),
                        delivery_time: row.get(0)?,
                        timezone: row.get(1)?,
                        enabled: row.get(2)?,
                        include_email: row.get(3)?,
                        project_filter: serde_json::from_str(&project_filter).unwrap_or_default(),
                        priority_filter: serde_json::from_str(&priority_filter).unwrap_or_default(),
                    })
                },
            )
            .optional()?;
        Ok(row.unwrap_or_else(|| BriefingPreference::defaults(workspace_id, user_id)))
    }

    /// All enabled briefing preferences, for the delivery ticker.
    pub fn list_enabled_preferences(&self) -> Result<Vec<BriefingPreference>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT workspace_id, user_id, delivery_time, timezone, enabled,
                    include_email, project_filter, priority_filter
             FROM briefing_preferences
             WHERE enabled = 1",
        )?;

        let rows = stmt.query_map([], |row| {
            let project_filter: String = row.get(6)?;
            let priority_filter: String = row.get(7)?;
            Ok(BriefingPreference {
                workspace_id: row.get(0)?,
                user_id: row.get(1)?,
                delivery_time: row.get(2)?,
                timezone: row.get(3)?,
                enabled: row.get(4)?,
                include_email: row.get(5)?,
                project_filter: serde_json::from_str(&project_filter).unwrap_or_default(),
                priority_filter: serde_json::from_str(&priority_filter).unwrap_or_default(),
            })
        })?;

        let mut prefs = Vec::new();
        for row in rows {
            prefs.push(row?);
        }
        Ok(prefs)
    }

    // =========================================================================
    // Notifications
    // =========================================================================

    pub fn insert_notification(&self, notification: &Notification) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO notifications (id, workspace_id, user_id, kind, title, body, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                notification.id,
                notification.workspace_id,
                notification.user_id,
                notification.kind,
                notification.title,
                notification.body,
                notification.created_at,
            ],
        )?;
        Ok(())
    }

    #[cfg(test)]
    pub fn count_notifications(&self, workspace_id: &str, kind: &str) -> Result<i64, DbError> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM notifications WHERE workspace_id = ?1 AND kind = ?2",
            params![workspace_id, kind],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    #[cfg(test)]
    pub fn count_scan_logs(&self, workspace_id: &str) -> Result<i64, DbError> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM scan_logs WHERE workspace_id = ?1",
            params![workspace_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

const SELECT_CONFIG: &str = "SELECT id, workspace_id, user_id, provider, enabled,
        scan_interval_hours, confidence_threshold, quiet_hours_start,
        quiet_hours_end, weekend_scan, access_token_enc, refresh_token_enc,
        mailbox_address, last_scan_at
 FROM scan_configs";

fn map_config_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<ScanConfig, DbError>> {
    let provider: String = row.get(3)?;
    let Some(provider_tag) = Provider::parse(&provider) else {
        return Ok(Err(DbError::UnknownProvider(provider)));
    };
    Ok(Ok(ScanConfig {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        user_id: row.get(2)?,
        provider: provider_tag,
        enabled: row.get(4)?,
        scan_interval_hours: row.get(5)?,
        confidence_threshold: row.get(6)?,
        quiet_hours_start: row.get(7)?,
        quiet_hours_end: row.get(8)?,
        weekend_scan: row.get(9)?,
        access_token_enc: row.get(10)?,
        refresh_token_enc: row.get(11)?,
        mailbox_address: row.get(12)?,
        last_scan_at: row.get(13)?,
    }))
}

// ============================================================================
// Tests
// ============================================================================
