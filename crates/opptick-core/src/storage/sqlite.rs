use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::backend::{ReminderChange, StorageBackend, StoreStats};
use crate::error::{OppTickError, Result};
use crate::model::*;

/// Bumped whenever the table layout changes.
pub const SCHEMA_VERSION: i32 = 1;

const OPPORTUNITY_COLUMNS: &str = "id, owner_id, conversation_id, title, category, priority, \
     deadline, status, source_ref, created_at, updated_at, missed_prompted_at, version";

const REMINDER_COLUMNS: &str =
    "id, opportunity_id, owner_id, kind, fire_at, sent, cancelled, failed, attempts, last_error";

const PENDING: &str = "sent = 0 AND cancelled = 0 AND failed = 0";

/// SQLite-backed storage for opportunities and their reminders.
///
/// Uses a single `Connection` behind `Arc<Mutex<>>` so it can be shared
/// across async tasks.  All blocking SQLite calls go through
/// [`with_conn`](Self::with_conn) which runs them on the Tokio blocking
/// thread-pool.
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl SqliteStorage {
    /// Open (or create) a file-backed SQLite database at `path`.
    ///
    /// Sets WAL journal mode and enables foreign keys, then creates all
    /// tables and indexes if they don't already exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    OppTickError::Storage(format!(
                        "failed to create database directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }
        let conn = Connection::open(&path)
            .map_err(|e| OppTickError::Storage(format!("failed to open SQLite database: {e}")))?;

        Self::configure_and_init(conn, path)
    }

    /// Open an in-memory SQLite database (useful for tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            OppTickError::Storage(format!("failed to open in-memory SQLite database: {e}"))
        })?;

        Self::configure_and_init(conn, PathBuf::from(":memory:"))
    }

    /// Return the path this database was opened with (`:memory:` for in-memory).
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Return `(schema_version, last_writer_version)`.
    pub fn schema_info(&self) -> Result<(i32, Option<String>)> {
        let conn = self.lock()?;
        let version: Option<String> = conn
            .query_row(
                "SELECT value FROM schema_meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let writer: Option<String> = conn
            .query_row(
                "SELECT value FROM schema_meta WHERE key = 'last_writer_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let version = version.and_then(|v| v.parse().ok()).unwrap_or(0);
        Ok((version, writer))
    }

    // ── helpers ────────────────────────────────────────────────────────

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| OppTickError::Storage(format!("failed to acquire database lock: {e}")))
    }

    /// Shared initialisation: pragmas + table creation.
    fn configure_and_init(conn: Connection, path: PathBuf) -> Result<Self> {
        // WAL mode for better concurrent-read performance.
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .map_err(|e| OppTickError::Storage(format!("failed to set WAL mode: {e}")))?;

        // Enforce foreign-key constraints.
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| OppTickError::Storage(format!("failed to enable foreign keys: {e}")))?;

        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(|e| OppTickError::Storage(format!("failed to set busy timeout: {e}")))?;

        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        };

        storage.create_tables()?;
        Ok(storage)
    }

    /// Create all tables and indexes (idempotent).
    fn create_tables(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS schema_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS opportunities (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                title TEXT NOT NULL,
                category TEXT NOT NULL DEFAULT 'other',
                priority TEXT NOT NULL DEFAULT 'medium',
                deadline TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                source_ref TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                missed_prompted_at TEXT,
                version INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS reminders (
                id TEXT PRIMARY KEY,
                opportunity_id TEXT NOT NULL REFERENCES opportunities(id) ON DELETE CASCADE,
                owner_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                fire_at TEXT NOT NULL,
                sent INTEGER NOT NULL DEFAULT 0,
                cancelled INTEGER NOT NULL DEFAULT 0,
                failed INTEGER NOT NULL DEFAULT 0,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT
            );

            CREATE TABLE IF NOT EXISTS intake_sessions (
                owner_id TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                state TEXT NOT NULL,
                draft TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                PRIMARY KEY (owner_id, conversation_id)
            );

            CREATE TABLE IF NOT EXISTS user_settings (
                owner_id TEXT PRIMARY KEY,
                conversation_id TEXT,
                daily_summary_enabled INTEGER NOT NULL DEFAULT 1,
                daily_summary_time TEXT NOT NULL DEFAULT '20:00',
                last_summary_on TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_opportunities_owner ON opportunities(owner_id, status);
            CREATE INDEX IF NOT EXISTS idx_opportunities_deadline ON opportunities(deadline);
            CREATE INDEX IF NOT EXISTS idx_reminders_opportunity ON reminders(opportunity_id);
            CREATE INDEX IF NOT EXISTS idx_reminders_fire_at ON reminders(fire_at);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_reminders_pending_kind
                ON reminders(opportunity_id, kind)
                WHERE sent = 0 AND cancelled = 0 AND failed = 0;
            CREATE INDEX IF NOT EXISTS idx_sessions_expires ON intake_sessions(expires_at);
            ",
        )
        .map_err(|e| OppTickError::Storage(format!("failed to create tables: {e}")))?;

        conn.execute(
            "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', ?1)",
            params![SCHEMA_VERSION.to_string()],
        )?;
        conn.execute(
            "INSERT OR REPLACE INTO schema_meta (key, value) VALUES ('last_writer_version', ?1)",
            params![env!("CARGO_PKG_VERSION")],
        )?;

        Ok(())
    }

    /// Run a blocking closure against the SQLite connection on the Tokio
    /// blocking thread-pool.  This is the primary way trait methods
    /// interact with the database.
    pub(crate) async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|e| {
                OppTickError::Storage(format!("failed to acquire database lock: {e}"))
            })?;
            f(&conn)
        })
        .await
        .map_err(|e| OppTickError::Storage(format!("task join error: {e}")))?
    }
}

// -- Encoding --

/// Fixed-width RFC 3339 so that text ordering equals time ordering.
fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, format!("bad timestamp '{s}': {e}")))
}

fn parse_uuid(idx: usize, s: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| conversion_error(idx, format!("bad id '{s}': {e}")))
}

fn parse_enum<T: std::str::FromStr<Err = String>>(idx: usize, s: &str) -> rusqlite::Result<T> {
    s.parse().map_err(|e| conversion_error(idx, e))
}

fn opportunity_from_row(row: &Row<'_>, base: usize) -> rusqlite::Result<Opportunity> {
    let id: String = row.get(base)?;
    let category: String = row.get(base + 4)?;
    let priority: String = row.get(base + 5)?;
    let deadline: String = row.get(base + 6)?;
    let status: String = row.get(base + 7)?;
    let created_at: String = row.get(base + 9)?;
    let updated_at: String = row.get(base + 10)?;
    let missed: Option<String> = row.get(base + 11)?;

    Ok(Opportunity {
        id: parse_uuid(base, &id)?,
        owner_id: row.get(base + 1)?,
        conversation_id: row.get(base + 2)?,
        title: row.get(base + 3)?,
        category: parse_enum(base + 4, &category)?,
        priority: parse_enum(base + 5, &priority)?,
        deadline: parse_ts(base + 6, &deadline)?,
        status: parse_enum(base + 7, &status)?,
        source_ref: row.get(base + 8)?,
        created_at: parse_ts(base + 9, &created_at)?,
        updated_at: parse_ts(base + 10, &updated_at)?,
        missed_prompted_at: missed
            .as_deref()
            .map(|s| parse_ts(base + 11, s))
            .transpose()?,
        version: row.get(base + 12)?,
    })
}

fn reminder_from_row(row: &Row<'_>, base: usize) -> rusqlite::Result<Reminder> {
    let id: String = row.get(base)?;
    let opportunity_id: String = row.get(base + 1)?;
    let kind: String = row.get(base + 3)?;
    let fire_at: String = row.get(base + 4)?;
    let attempts: i64 = row.get(base + 8)?;

    Ok(Reminder {
        id: parse_uuid(base, &id)?,
        opportunity_id: parse_uuid(base + 1, &opportunity_id)?,
        owner_id: row.get(base + 2)?,
        kind: parse_enum(base + 3, &kind)?,
        fire_at: parse_ts(base + 4, &fire_at)?,
        sent: row.get(base + 5)?,
        cancelled: row.get(base + 6)?,
        failed: row.get(base + 7)?,
        attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
        last_error: row.get(base + 9)?,
    })
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<IntakeSession> {
    let state: String = row.get(2)?;
    let draft: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    let updated_at: String = row.get(5)?;
    let expires_at: String = row.get(6)?;

    Ok(IntakeSession {
        owner_id: row.get(0)?,
        conversation_id: row.get(1)?,
        state: serde_json::from_str(&format!("\"{state}\""))
            .map_err(|e| conversion_error(2, format!("bad intake state '{state}': {e}")))?,
        draft: serde_json::from_str(&draft)
            .map_err(|e| conversion_error(3, format!("bad draft: {e}")))?,
        created_at: parse_ts(4, &created_at)?,
        updated_at: parse_ts(5, &updated_at)?,
        expires_at: parse_ts(6, &expires_at)?,
    })
}

fn settings_from_row(row: &Row<'_>) -> rusqlite::Result<UserSettings> {
    let time: String = row.get(3)?;
    let last: Option<String> = row.get(4)?;

    Ok(UserSettings {
        owner_id: row.get(0)?,
        conversation_id: row.get(1)?,
        daily_summary_enabled: row.get(2)?,
        daily_summary_time: NaiveTime::parse_from_str(&time, "%H:%M")
            .map_err(|e| conversion_error(3, format!("bad time '{time}': {e}")))?,
        last_summary_on: last
            .as_deref()
            .map(|s| {
                NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .map_err(|e| conversion_error(4, format!("bad date '{s}': {e}")))
            })
            .transpose()?,
    })
}

// -- Statement helpers shared by several trait methods --

fn select_opportunity(conn: &Connection, id: Uuid) -> Result<Opportunity> {
    conn.query_row(
        &format!("SELECT {OPPORTUNITY_COLUMNS} FROM opportunities WHERE id = ?1"),
        params![id.to_string()],
        |row| opportunity_from_row(row, 0),
    )
    .optional()?
    .ok_or_else(|| OppTickError::NotFound(format!("opportunity {id}")))
}

fn select_reminder(conn: &Connection, id: Uuid) -> Result<Reminder> {
    conn.query_row(
        &format!("SELECT {REMINDER_COLUMNS} FROM reminders WHERE id = ?1"),
        params![id.to_string()],
        |row| reminder_from_row(row, 0),
    )
    .optional()?
    .ok_or_else(|| OppTickError::NotFound(format!("reminder {id}")))
}

fn select_reminders(conn: &Connection, opportunity_id: Uuid, pending_only: bool) -> Result<Vec<Reminder>> {
    let filter = if pending_only {
        format!(" AND {PENDING}")
    } else {
        String::new()
    };
    let mut stmt = conn.prepare(&format!(
        "SELECT {REMINDER_COLUMNS} FROM reminders WHERE opportunity_id = ?1{filter} \
         ORDER BY fire_at ASC, kind ASC"
    ))?;
    let rows = stmt
        .query_map(params![opportunity_id.to_string()], |row| {
            reminder_from_row(row, 0)
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn insert_reminder(conn: &Connection, reminder: &Reminder) -> Result<()> {
    conn.execute(
        &format!("INSERT INTO reminders ({REMINDER_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
        params![
            reminder.id.to_string(),
            reminder.opportunity_id.to_string(),
            reminder.owner_id,
            reminder.kind.as_str(),
            ts(&reminder.fire_at),
            reminder.sent,
            reminder.cancelled,
            reminder.failed,
            i64::from(reminder.attempts),
            reminder.last_error,
        ],
    )?;
    Ok(())
}

fn cancel_pending(conn: &Connection, opportunity_id: Uuid) -> Result<usize> {
    let n = conn.execute(
        &format!("UPDATE reminders SET cancelled = 1 WHERE opportunity_id = ?1 AND {PENDING}"),
        params![opportunity_id.to_string()],
    )?;
    Ok(n)
}

fn cancel_reminder(conn: &Connection, id: Uuid) -> Result<()> {
    conn.execute(
        "UPDATE reminders SET cancelled = 1 WHERE id = ?1",
        params![id.to_string()],
    )?;
    Ok(())
}

fn count(conn: &Connection, sql: &str, owner_id: Option<&str>) -> Result<usize> {
    let n: i64 = match owner_id {
        Some(owner) => conn.query_row(sql, params![owner], |row| row.get(0))?,
        None => conn.query_row(sql, [], |row| row.get(0))?,
    };
    Ok(usize::try_from(n).unwrap_or(0))
}

impl StorageBackend for SqliteStorage {
    async fn create_opportunity(
        &self,
        opportunity: &Opportunity,
        reminders: &[Reminder],
    ) -> Result<()> {
        validate_title(&opportunity.title)?;
        let opp = opportunity.clone();
        let reminders = reminders.to_vec();

        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                &format!(
                    "INSERT INTO opportunities ({OPPORTUNITY_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
                ),
                params![
                    opp.id.to_string(),
                    opp.owner_id,
                    opp.conversation_id,
                    opp.title,
                    opp.category.as_str(),
                    opp.priority.as_str(),
                    ts(&opp.deadline),
                    opp.status.as_str(),
                    opp.source_ref,
                    ts(&opp.created_at),
                    ts(&opp.updated_at),
                    opp.missed_prompted_at.as_ref().map(ts),
                    opp.version,
                ],
            )?;
            for reminder in &reminders {
                insert_reminder(&tx, reminder)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_opportunity(&self, id: Uuid) -> Result<Opportunity> {
        self.with_conn(move |conn| select_opportunity(conn, id))
            .await
    }

    async fn list_opportunities(&self, query: &OpportunityQuery) -> Result<Vec<Opportunity>> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(ref owner) = query.owner_id {
            clauses.push("owner_id = ?");
            values.push(Value::Text(owner.clone()));
        }
        if let Some(status) = query.status {
            clauses.push("status = ?");
            values.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(status) = query.exclude_status {
            clauses.push("status != ?");
            values.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(before) = query.deadline_before {
            clauses.push("deadline < ?");
            values.push(Value::Text(ts(&before)));
        }
        if query.unprompted_only {
            clauses.push("missed_prompted_at IS NULL");
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        values.push(Value::Integer(
            i64::try_from(query.limit).unwrap_or(i64::MAX),
        ));

        let sql = format!(
            "SELECT {OPPORTUNITY_COLUMNS} FROM opportunities{where_clause} \
             ORDER BY deadline ASC, created_at ASC LIMIT ?"
        );

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(values.iter()), |row| {
                    opportunity_from_row(row, 0)
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    async fn find_by_id_prefix(&self, owner_id: &str, prefix: &str) -> Result<Vec<Opportunity>> {
        let prefix = prefix.trim().to_lowercase();
        if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_hexdigit() || c == '-') {
            return Ok(Vec::new());
        }
        let owner = owner_id.to_string();
        let pattern = format!("{prefix}%");

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {OPPORTUNITY_COLUMNS} FROM opportunities \
                 WHERE owner_id = ?1 AND id LIKE ?2 ORDER BY deadline ASC"
            ))?;
            let rows = stmt
                .query_map(params![owner, pattern], |row| opportunity_from_row(row, 0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    async fn update_opportunity(
        &self,
        id: Uuid,
        input: &UpdateOpportunityInput,
        expected_version: Option<i64>,
        reminders: ReminderChange,
    ) -> Result<Opportunity> {
        if let Some(ref title) = input.title {
            validate_title(title)?;
        }
        let input = input.clone();

        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let mut opp = select_opportunity(&tx, id)?;
            if let Some(expected) = expected_version {
                if opp.version != expected {
                    return Err(OppTickError::Conflict(format!(
                        "opportunity {id} is at version {}, expected {expected}",
                        opp.version
                    )));
                }
            }
            let previous_version = opp.version;
            input.apply_to(&mut opp, Utc::now());

            let changed = tx.execute(
                "UPDATE opportunities SET title = ?1, category = ?2, priority = ?3, \
                 deadline = ?4, status = ?5, missed_prompted_at = ?6, updated_at = ?7, \
                 version = ?8 WHERE id = ?9 AND version = ?10",
                params![
                    opp.title,
                    opp.category.as_str(),
                    opp.priority.as_str(),
                    ts(&opp.deadline),
                    opp.status.as_str(),
                    opp.missed_prompted_at.as_ref().map(ts),
                    ts(&opp.updated_at),
                    opp.version,
                    id.to_string(),
                    previous_version,
                ],
            )?;
            if changed == 0 {
                return Err(OppTickError::Conflict(format!(
                    "opportunity {id} changed concurrently"
                )));
            }

            match reminders {
                ReminderChange::Keep => {}
                ReminderChange::CancelPending => {
                    cancel_pending(&tx, id)?;
                }
                ReminderChange::Replace(list) => {
                    cancel_pending(&tx, id)?;
                    for reminder in &list {
                        insert_reminder(&tx, reminder)?;
                    }
                }
            }

            tx.commit()?;
            Ok(opp)
        })
        .await
    }

    async fn delete_opportunity(&self, id: Uuid) -> Result<()> {
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            cancel_pending(&tx, id)?;
            let n = tx.execute(
                "DELETE FROM opportunities WHERE id = ?1",
                params![id.to_string()],
            )?;
            if n == 0 {
                return Err(OppTickError::NotFound(format!("opportunity {id}")));
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn replace_pending_reminders(
        &self,
        opportunity_id: Uuid,
        reminders: &[Reminder],
        mode: ReplaceMode,
    ) -> Result<Vec<Reminder>> {
        let planned = reminders.to_vec();

        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            // NotFound before any FK failure.
            select_opportunity(&tx, opportunity_id)?;

            let mut kept: HashSet<ReminderKind> = HashSet::new();
            for existing in select_reminders(&tx, opportunity_id, true)? {
                let matches = mode == ReplaceMode::KeepMatching
                    && planned
                        .iter()
                        .any(|p| p.kind == existing.kind && ts(&p.fire_at) == ts(&existing.fire_at));
                if matches {
                    kept.insert(existing.kind);
                } else {
                    cancel_reminder(&tx, existing.id)?;
                }
            }

            for reminder in planned.iter().filter(|r| !kept.contains(&r.kind)) {
                insert_reminder(&tx, reminder)?;
            }

            let pending = select_reminders(&tx, opportunity_id, true)?;
            tx.commit()?;
            Ok(pending)
        })
        .await
    }

    async fn cancel_pending_reminders(&self, opportunity_id: Uuid) -> Result<usize> {
        self.with_conn(move |conn| cancel_pending(conn, opportunity_id))
            .await
    }

    async fn get_reminder(&self, id: Uuid) -> Result<Reminder> {
        self.with_conn(move |conn| select_reminder(conn, id)).await
    }

    async fn list_reminders(&self, opportunity_id: Uuid, pending_only: bool) -> Result<Vec<Reminder>> {
        self.with_conn(move |conn| select_reminders(conn, opportunity_id, pending_only))
            .await
    }

    async fn due_reminders(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DueReminder>> {
        let now = ts(&now);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT r.id, r.opportunity_id, r.owner_id, r.kind, r.fire_at, r.sent, \
                        r.cancelled, r.failed, r.attempts, r.last_error, \
                        o.id, o.owner_id, o.conversation_id, o.title, o.category, o.priority, \
                        o.deadline, o.status, o.source_ref, o.created_at, o.updated_at, \
                        o.missed_prompted_at, o.version \
                 FROM reminders r JOIN opportunities o ON o.id = r.opportunity_id \
                 WHERE r.sent = 0 AND r.cancelled = 0 AND r.failed = 0 AND r.fire_at <= ?1 \
                 ORDER BY r.fire_at ASC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![now, limit], |row| {
                    Ok(DueReminder {
                        reminder: reminder_from_row(row, 0)?,
                        opportunity: opportunity_from_row(row, 10)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    async fn mark_reminder_sent(&self, id: Uuid) -> Result<bool> {
        self.with_conn(move |conn| {
            let n = conn.execute(
                &format!("UPDATE reminders SET sent = 1 WHERE id = ?1 AND {PENDING}"),
                params![id.to_string()],
            )?;
            Ok(n > 0)
        })
        .await
    }

    async fn record_reminder_failure(
        &self,
        id: Uuid,
        error: &str,
        max_attempts: u32,
    ) -> Result<Reminder> {
        let error = error.to_string();

        self.with_conn(move |conn| {
            conn.execute(
                &format!(
                    "UPDATE reminders SET attempts = attempts + 1, last_error = ?2, \
                     failed = CASE WHEN attempts + 1 >= ?3 THEN 1 ELSE 0 END \
                     WHERE id = ?1 AND {PENDING}"
                ),
                params![id.to_string(), error, i64::from(max_attempts)],
            )?;
            select_reminder(conn, id)
        })
        .await
    }

    async fn get_session(
        &self,
        owner_id: &str,
        conversation_id: &str,
    ) -> Result<Option<IntakeSession>> {
        let owner = owner_id.to_string();
        let conversation = conversation_id.to_string();

        self.with_conn(move |conn| {
            let session = conn
                .query_row(
                    "SELECT owner_id, conversation_id, state, draft, created_at, updated_at, \
                     expires_at FROM intake_sessions WHERE owner_id = ?1 AND conversation_id = ?2",
                    params![owner, conversation],
                    session_from_row,
                )
                .optional()?;
            Ok(session)
        })
        .await
    }

    async fn save_session(&self, session: &IntakeSession) -> Result<()> {
        let draft = serde_json::to_string(&session.draft)?;
        let state = serde_json::to_string(&session.state)?
            .trim_matches('"')
            .to_string();
        let session = session.clone();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO intake_sessions \
                 (owner_id, conversation_id, state, draft, created_at, updated_at, expires_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    session.owner_id,
                    session.conversation_id,
                    state,
                    draft,
                    ts(&session.created_at),
                    ts(&session.updated_at),
                    ts(&session.expires_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete_session(&self, owner_id: &str, conversation_id: &str) -> Result<()> {
        let owner = owner_id.to_string();
        let conversation = conversation_id.to_string();

        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM intake_sessions WHERE owner_id = ?1 AND conversation_id = ?2",
                params![owner, conversation],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<usize> {
        let now = ts(&now);
        self.with_conn(move |conn| {
            let n = conn.execute(
                "DELETE FROM intake_sessions WHERE expires_at <= ?1",
                params![now],
            )?;
            Ok(n)
        })
        .await
    }

    async fn get_settings(&self, owner_id: &str) -> Result<Option<UserSettings>> {
        let owner = owner_id.to_string();
        self.with_conn(move |conn| {
            let settings = conn
                .query_row(
                    "SELECT owner_id, conversation_id, daily_summary_enabled, \
                     daily_summary_time, last_summary_on FROM user_settings WHERE owner_id = ?1",
                    params![owner],
                    settings_from_row,
                )
                .optional()?;
            Ok(settings)
        })
        .await
    }

    async fn save_settings(&self, settings: &UserSettings) -> Result<()> {
        let settings = settings.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO user_settings \
                 (owner_id, conversation_id, daily_summary_enabled, daily_summary_time, \
                 last_summary_on) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    settings.owner_id,
                    settings.conversation_id,
                    settings.daily_summary_enabled,
                    settings.daily_summary_time.format("%H:%M").to_string(),
                    settings
                        .last_summary_on
                        .map(|d| d.format("%Y-%m-%d").to_string()),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_settings(&self) -> Result<Vec<UserSettings>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT owner_id, conversation_id, daily_summary_enabled, daily_summary_time, \
                 last_summary_on FROM user_settings ORDER BY owner_id",
            )?;
            let rows = stmt
                .query_map([], settings_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    async fn stats(&self, owner_id: Option<&str>) -> Result<StoreStats> {
        let owner = owner_id.map(str::to_string);
        self.with_conn(move |conn| {
            let owner = owner.as_deref();
            let scope = if owner.is_some() { " WHERE owner_id = ?1" } else { "" };
            let and_scope = if owner.is_some() { " AND owner_id = ?1" } else { "" };
            Ok(StoreStats {
                opportunities: count(
                    conn,
                    &format!("SELECT COUNT(*) FROM opportunities{scope}"),
                    owner,
                )?,
                active: count(
                    conn,
                    &format!("SELECT COUNT(*) FROM opportunities WHERE status = 'active'{and_scope}"),
                    owner,
                )?,
                pending_reminders: count(
                    conn,
                    &format!("SELECT COUNT(*) FROM reminders WHERE {PENDING}{and_scope}"),
                    owner,
                )?,
                sessions: count(
                    conn,
                    &format!("SELECT COUNT(*) FROM intake_sessions{scope}"),
                    owner,
                )?,
            })
        })
        .await
    }
}
