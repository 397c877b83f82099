//! libSQL backend: async `ThrottleStore` implementation.
//!
//! Supports local file and in-memory databases. The suppress check runs
//! inside an IMMEDIATE transaction so two workers sharing one database file
//! cannot both accept the same sender.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, SecondsFormat, TimeDelta, TimeZone, Utc};
use libsql::{Connection, Database as LibSqlDatabase, TransactionBehavior, params};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{ThrottleRecord, ThrottleStore, normalize_sender};

/// libSQL throttle store.
///
/// Stores a single connection reused for all operations. Transactions on
/// that connection are serialized through `tx_lock`.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    tx_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests and dry runs).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            tx_lock: Mutex::new(()),
        })
    }

    /// Idempotent schema creation.
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(&self.conn).await
    }

    /// All `(id, timestamp)` rows for a normalized sender.
    async fn rows_for(
        conn: &Connection,
        key: &str,
    ) -> Result<Vec<(i64, DateTime<Utc>)>, DatabaseError> {
        let mut rows = conn
            .query(
                "SELECT id, date FROM senders WHERE mail = ?1",
                params![key],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("select senders: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("read senders row: {e}")))?
        {
            let id: i64 = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("senders.id: {e}")))?;
            let date: String = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("senders.date: {e}")))?;
            out.push((id, parse_datetime(&date)));
        }
        Ok(out)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format: fixed-width RFC 3339 in UTC.
fn format_datetime(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 timestamp, or a naive local one from the legacy replier.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    // Legacy rows: naive local time, "%Y-%m-%d %H:%M:%S.%f"
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map_or(DateTime::<Utc>::MIN_UTC, local_to_utc)
}

/// Interpret a naive local timestamp. An ambiguous time (DST fold) takes
/// the earlier instant; a skipped one is read as UTC.
fn local_to_utc(naive: NaiveDateTime) -> DateTime<Utc> {
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map_or_else(|| naive.and_utc(), |local| local.with_timezone(&Utc))
}

fn window_delta(window: Duration) -> TimeDelta {
    TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX)
}

// ── ThrottleStore implementation ────────────────────────────────────

#[async_trait]
impl ThrottleStore for LibSqlBackend {
    async fn should_suppress(
        &self,
        sender: &str,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<bool, DatabaseError> {
        let key = normalize_sender(sender);
        let window = window_delta(window);

        let _guard = self.tx_lock.lock().await;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(|e| DatabaseError::Query(format!("begin should_suppress: {e}")))?;

        let rows = Self::rows_for(&tx, &key).await?;
        let recent = rows
            .iter()
            .filter(|(_, at)| now.signed_duration_since(*at) <= window)
            .max_by_key(|(_, at)| *at);

        if let Some((id, at)) = recent {
            debug!(sender = %key, id, replied_at = %at, "Recent entry found, suppressing");
            tx.rollback()
                .await
                .map_err(|e| DatabaseError::Query(format!("rollback should_suppress: {e}")))?;
            return Ok(true);
        }

        for (id, at) in &rows {
            debug!(sender = %key, id, replied_at = %at, "Deleting stale entry");
            tx.execute("DELETE FROM senders WHERE id = ?1", params![*id])
                .await
                .map_err(|e| DatabaseError::Query(format!("delete stale sender: {e}")))?;
        }

        tx.execute(
            "INSERT INTO senders (mail, date) VALUES (?1, ?2)",
            params![key.clone(), format_datetime(now)],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("insert sender: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("commit should_suppress: {e}")))?;

        info!(sender = %key, "Memorized sender");
        Ok(false)
    }

    async fn last_reply(&self, sender: &str) -> Result<Option<ThrottleRecord>, DatabaseError> {
        let key = normalize_sender(sender);
        let rows = Self::rows_for(&self.conn, &key).await?;
        Ok(rows
            .into_iter()
            .max_by_key(|(_, at)| *at)
            .map(|(id, replied_at)| ThrottleRecord {
                id,
                sender: key,
                replied_at,
            }))
    }

    async fn insert(&self, sender: &str, at: DateTime<Utc>) -> Result<i64, DatabaseError> {
        let key = normalize_sender(sender);
        let _guard = self.tx_lock.lock().await;
        self.conn
            .execute(
                "INSERT INTO senders (mail, date) VALUES (?1, ?2)",
                params![key, format_datetime(at)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert sender: {e}")))?;
        Ok(self.conn.last_insert_rowid())
    }

    async fn prune(&self, older_than: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let _guard = self.tx_lock.lock().await;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(|e| DatabaseError::Query(format!("begin prune: {e}")))?;

        let mut rows = tx
            .query("SELECT id, date FROM senders", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("select senders: {e}")))?;
        let mut stale = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("read senders row: {e}")))?
        {
            let id: i64 = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("senders.id: {e}")))?;
            let date: String = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("senders.date: {e}")))?;
            if parse_datetime(&date) < older_than {
                stale.push(id);
            }
        }
        drop(rows);

        for id in &stale {
            tx.execute("DELETE FROM senders WHERE id = ?1", params![*id])
                .await
                .map_err(|e| DatabaseError::Query(format!("prune sender: {e}")))?;
        }
        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("commit prune: {e}")))?;

        info!(deleted = stale.len(), "Pruned throttle history");
        Ok(stale.len())
    }

    async fn count(&self) -> Result<usize, DatabaseError> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(id) FROM senders", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("count senders: {e}")))?;
        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("count senders: {e}")))?;
        let count = row.and_then(|r| r.get::<i64>(0).ok()).unwrap_or(0);
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(12 * 3600);

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn hours(h: i64) -> TimeDelta {
        TimeDelta::hours(h)
    }

    #[tokio::test]
    async fn first_contact_is_accepted_and_recorded() {
        let db = test_db().await;
        let now = Utc::now();
        assert!(!db.should_suppress("alice@example.com", now, WINDOW).await.unwrap());
        assert_eq!(db.count().await.unwrap(), 1);
        let record = db.last_reply("alice@example.com").await.unwrap().unwrap();
        assert_eq!(record.sender, "alice@example.com");
        assert_eq!(format_datetime(record.replied_at), format_datetime(now));
    }

    #[tokio::test]
    async fn record_within_window_suppresses_without_writes() {
        let db = test_db().await;
        let now = Utc::now();
        let id = db.insert("alice@example.com", now - hours(11)).await.unwrap();

        assert!(db.should_suppress("alice@example.com", now, WINDOW).await.unwrap());

        assert_eq!(db.count().await.unwrap(), 1);
        assert_eq!(db.last_reply("alice@example.com").await.unwrap().unwrap().id, id);
    }

    #[tokio::test]
    async fn stale_record_is_replaced_by_fresh_one() {
        let db = test_db().await;
        let now = Utc::now();
        let old_id = db.insert("alice@example.com", now - hours(13)).await.unwrap();

        assert!(!db.should_suppress("alice@example.com", now, WINDOW).await.unwrap());

        assert_eq!(db.count().await.unwrap(), 1);
        let record = db.last_reply("alice@example.com").await.unwrap().unwrap();
        assert_ne!(record.id, old_id);
        assert_eq!(format_datetime(record.replied_at), format_datetime(now));
    }

    #[tokio::test]
    async fn second_check_within_window_is_suppressed() {
        let db = test_db().await;
        let now = Utc::now();
        assert!(!db.should_suppress("bob@example.com", now, WINDOW).await.unwrap());
        assert!(db.should_suppress("bob@example.com", now + hours(1), WINDOW).await.unwrap());
        assert_eq!(db.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn sender_key_is_normalized() {
        let db = test_db().await;
        let now = Utc::now();
        assert!(!db.should_suppress("Bob <Bob@Example.com>", now, WINDOW).await.unwrap());
        assert!(db.should_suppress("bob@example.com", now, WINDOW).await.unwrap());
    }

    #[tokio::test]
    async fn senders_are_independent() {
        let db = test_db().await;
        let now = Utc::now();
        assert!(!db.should_suppress("a@x.com", now, WINDOW).await.unwrap());
        assert!(!db.should_suppress("b@x.com", now, WINDOW).await.unwrap());
        assert_eq!(db.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn concurrent_checks_accept_once() {
        let db = Arc::new(test_db().await);
        let now = Utc::now();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let db = Arc::clone(&db);
            handles.push(tokio::spawn(async move {
                db.should_suppress("race@example.com", now, WINDOW).await.unwrap()
            }));
        }
        let mut accepted = 0;
        for handle in handles {
            if !handle.await.unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);
        assert_eq!(db.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn prune_removes_only_old_records() {
        let db = test_db().await;
        let now = Utc::now();
        db.insert("old@x.com", now - hours(48)).await.unwrap();
        db.insert("new@x.com", now - hours(1)).await.unwrap();

        let deleted = db.prune(now - hours(12)).await.unwrap();

        assert_eq!(deleted, 1);
        assert!(db.last_reply("old@x.com").await.unwrap().is_none());
        assert!(db.last_reply("new@x.com").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn local_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("throttle.db");
        let now = Utc::now();
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.insert("persist@x.com", now).await.unwrap();
        }
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert!(db.should_suppress("persist@x.com", now, WINDOW).await.unwrap());
    }

    #[test]
    fn parses_legacy_and_canonical_timestamps() {
        let naive = NaiveDateTime::parse_from_str("2022-05-01 10:00:00", "%Y-%m-%d %H:%M:%S").unwrap();
        let expected = Local
            .from_local_datetime(&naive)
            .earliest()
            .unwrap()
            .with_timezone(&Utc);
        let legacy = parse_datetime("2022-05-01 10:00:00.123456");
        assert_eq!(legacy.timestamp(), expected.timestamp());
        assert_eq!(parse_datetime("2022-05-01 10:00:00"), expected);
        let now = Utc::now();
        assert_eq!(format_datetime(parse_datetime(&format_datetime(now))), format_datetime(now));
        assert_eq!(parse_datetime("garbage"), DateTime::<Utc>::MIN_UTC);
    }
}
