use crate::error::{StoreError, StoreResult};
use crate::session_db::schema::*;
use crate::session_db::{migration, SessionStore, SessionUpdate};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// SQLite-backed session documents.
///
/// The document lives in two tables: `sessions` keeps metadata and analytics
/// as JSON columns, `messages` keeps the append-only list. Every update runs
/// under `BEGIN IMMEDIATE`, so an update is atomic across processes sharing
/// the database file.
#[derive(Clone)]
pub struct SqliteSessionStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl SqliteSessionStore {
    pub fn open(db_path: &Path) -> anyhow::Result<Self> {
        info!("Opening session database at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
            )
            .with_init(|conn| {
                conn.execute_batch(
                    "PRAGMA foreign_keys = ON;
                     PRAGMA busy_timeout = 5000;",
                )
            });
        let pool = Pool::builder()
            .max_size(8)
            .build(manager)
            .map_err(|e| anyhow::anyhow!("Failed to create connection pool: {}", e))?;

        {
            let mut conn = pool.get()?;
            migration::MigrationManager::new(&mut conn).initialize_database()?;
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;",
            )?;
        }
        info!("Session database initialized successfully");
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Each in-memory SQLite connection is its own database, so the pool is
    /// pinned to a single connection.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));
        let pool = Pool::builder().max_size(1).build(manager)?;
        {
            let mut conn = pool.get()?;
            migration::MigrationManager::new(&mut conn).initialize_database()?;
        }
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    pub fn stats(&self) -> anyhow::Result<DatabaseStats> {
        let conn = self.pool.get()?;
        Ok(migration::get_database_stats(&conn)?)
    }

    async fn run_blocking<T, F>(&self, op: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let pool = Arc::clone(&self.pool);
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| StoreError::Transient(format!("connection pool: {}", e)))?;
            op(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Permanent(format!("store task failed: {}", e)))?
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn get(&self, session_id: &str) -> StoreResult<Option<Session>> {
        let session_id = session_id.to_string();
        self.run_blocking(move |conn| load_session(conn, &session_id)).await
    }

    async fn create(&self, session: &Session) -> StoreResult<bool> {
        let session = session.clone();
        self.run_blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO sessions
                     (id, created_at, last_active_at, metadata, analytics, revision)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    &session.session_id,
                    format_ts(&session.created_at),
                    format_ts(&session.last_active_at),
                    serde_json::to_string(&session.metadata)?,
                    serde_json::to_string(&session.analytics)?,
                    session.revision as i64,
                ],
            )? == 1;
            if inserted {
                insert_messages(&tx, &session.session_id, 0, &session.messages)?;
            }
            tx.commit()?;
            if inserted {
                info!("Created session with ID: {}", session.session_id);
            }
            Ok(inserted)
        })
        .await
    }

    async fn update(&self, session_id: &str, update: &SessionUpdate) -> StoreResult<Session> {
        let session_id = session_id.to_string();
        let update = update.clone();
        self.run_blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut session = load_session(&tx, &session_id)?
                .ok_or_else(|| StoreError::NotFound(session_id.clone()))?;

            let before = session.messages.len();
            update.apply_to(&mut session);

            tx.execute(
                "UPDATE sessions
                 SET last_active_at = ?1, metadata = ?2, analytics = ?3, revision = ?4
                 WHERE id = ?5",
                params![
                    format_ts(&session.last_active_at),
                    serde_json::to_string(&session.metadata)?,
                    serde_json::to_string(&session.analytics)?,
                    session.revision as i64,
                    &session_id,
                ],
            )?;
            insert_messages(&tx, &session_id, before, &session.messages[before..])?;
            tx.commit()?;

            debug!("Applied {} ops to session {}", update.ops().len(), session_id);
            Ok(session)
        })
        .await
    }

    async fn query(&self, query: &SessionQuery) -> StoreResult<Vec<Session>> {
        let query = query.clone();
        self.run_blocking(move |conn| {
            let mut sql = String::from("SELECT id FROM sessions WHERE 1=1");
            let mut args: Vec<String> = Vec::new();
            if let Some(from) = &query.created_from {
                args.push(format_ts(from));
                sql.push_str(&format!(" AND created_at >= ?{}", args.len()));
            }
            if let Some(before) = &query.created_before {
                args.push(format_ts(before));
                sql.push_str(&format!(" AND created_at < ?{}", args.len()));
            }
            sql.push_str(match query.order {
                QueryOrder::CreatedAsc => " ORDER BY created_at ASC",
                QueryOrder::CreatedDesc => " ORDER BY created_at DESC",
            });
            if let Some(limit) = query.limit {
                sql.push_str(&format!(" LIMIT {}", limit));
            }

            let ids: Vec<String> = {
                let mut stmt = conn.prepare(&sql)?;
                let rows =
                    stmt.query_map(rusqlite::params_from_iter(args.iter()), |row| row.get(0))?;
                rows.collect::<rusqlite::Result<Vec<String>>>()?
            };

            let mut sessions = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(session) = load_session(conn, &id)? {
                    sessions.push(session);
                }
            }
            Ok(sessions)
        })
        .await
    }
}

impl Drop for SqliteSessionStore {
    fn drop(&mut self) {
        if Arc::strong_count(&self.pool) == 1 {
            if let Ok(conn) = self.pool.get() {
                let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
            }
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        let transient = match &err {
            rusqlite::Error::SqliteFailure(failure, _) => matches!(
                failure.code,
                ErrorCode::DatabaseBusy
                    | ErrorCode::DatabaseLocked
                    | ErrorCode::OperationInterrupted
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::CannotOpen
                    | ErrorCode::FileLockingProtocolFailed
                    | ErrorCode::SchemaChanged
            ),
            _ => false,
        };
        if transient {
            StoreError::Transient(err.to_string())
        } else {
            StoreError::Permanent(err.to_string())
        }
    }
}

/// Fixed-width RFC 3339 so lexical order in SQL matches time order.
fn format_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime_safe(datetime_str: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(datetime_str) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(datetime_str, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
    }
    None
}

fn load_session(conn: &Connection, session_id: &str) -> StoreResult<Option<Session>> {
    let row = conn
        .query_row(
            "SELECT id, created_at, last_active_at, metadata, analytics, revision
             FROM sessions WHERE id = ?1",
            [session_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            },
        )
        .optional()?;

    let Some((id, created_at, last_active_at, metadata, analytics, revision)) = row else {
        return Ok(None);
    };

    let created_at = parse_datetime_safe(&created_at).ok_or_else(|| {
        StoreError::Permanent(format!(
            "session {} has unreadable created_at '{}'",
            id, created_at
        ))
    })?;
    let last_active_at = parse_datetime_safe(&last_active_at).unwrap_or_else(|| {
        warn!("Failed parse last_active_at for session {}", id);
        created_at
    });

    let messages = load_messages(conn, &id)?;
    Ok(Some(Session {
        session_id: id,
        created_at,
        last_active_at,
        messages,
        metadata: serde_json::from_str(&metadata)?,
        analytics: serde_json::from_str(&analytics)?,
        revision: u64::try_from(revision).unwrap_or_default(),
    }))
}

fn load_messages(conn: &Connection, session_id: &str) -> StoreResult<Vec<Message>> {
    let mut stmt = conn.prepare(
        "SELECT message_id, role, content, timestamp FROM messages
         WHERE session_id = ?1 ORDER BY position",
    )?;
    let mut rows = stmt.query([session_id])?;
    let mut messages = Vec::new();
    while let Some(row) = rows.next()? {
        let role: String = row.get(1)?;
        let timestamp: String = row.get(3)?;
        messages.push(Message {
            id: row.get(0)?,
            role: role.parse::<Role>().map_err(StoreError::Permanent)?,
            content: row.get(2)?,
            timestamp: parse_datetime_safe(&timestamp).ok_or_else(|| {
                StoreError::Permanent(format!("unreadable message timestamp '{}'", timestamp))
            })?,
        });
    }
    Ok(messages)
}

fn insert_messages(
    conn: &Connection,
    session_id: &str,
    first_position: usize,
    messages: &[Message],
) -> StoreResult<()> {
    if messages.is_empty() {
        return Ok(());
    }
    let mut stmt = conn.prepare(
        "INSERT INTO messages (session_id, position, message_id, role, content, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    for (offset, message) in messages.iter().enumerate() {
        stmt.execute(params![
            session_id,
            (first_position + offset) as i64,
            &message.id,
            message.role.as_str(),
            &message.content,
            format_ts(&message.timestamp),
        ])?;
    }
    Ok(())
}
