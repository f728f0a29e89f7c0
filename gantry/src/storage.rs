use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{info, warn};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};

use crate::monitor::identity::ContainerIdentity;

const LOCK_RETRY_ATTEMPTS: u32 = 5;
const LOCK_BACKOFF_BASE: Duration = Duration::from_millis(50);
const LOCK_BACKOFF_CAP: Duration = Duration::from_millis(400);

/// One attributed connection, as persisted in the `flows` table.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowRecord {
    pub ts: DateTime<Utc>,
    pub pid: u32,
    pub container: ContainerIdentity,
    pub saddr: String,
    pub sport: u16,
    pub daddr: String,
    pub dport: u16,
    pub proto: u8,
}

#[derive(Clone)]
pub struct Ledger {
    pool: SqlitePool,
}

impl Ledger {
    pub async fn open(path: &Path) -> Result<Self, sqlx::Error> {
        info!("Opening flow ledger at {}", path.display());
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// Durably commit one record, retrying transient lock contention before
    /// surfacing the error.
    pub async fn append(&self, record: &FlowRecord) -> Result<(), sqlx::Error> {
        let mut attempt = 1;
        loop {
            let result = sqlx::query(
                "INSERT INTO flows (ts, pid, container, saddr, sport, daddr, dport, proto)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(record.ts)
            .bind(record.pid as i64)
            .bind(record.container.as_db_str())
            .bind(&record.saddr)
            .bind(record.sport as i64)
            .bind(&record.daddr)
            .bind(record.dport as i64)
            .bind(record.proto as i64)
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => return Ok(()),
                Err(err) if attempt < LOCK_RETRY_ATTEMPTS && is_locked(&err) => {
                    warn!("Flow ledger busy on append (attempt {attempt}): {err}");
                    tokio::time::sleep(backoff(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Newest-first slice of the ledger, `limit` rows at most. Safe to call
    /// while the pipeline is appending.
    pub async fn recent(&self, limit: u32) -> Result<Vec<FlowRecord>, sqlx::Error> {
        let mut attempt = 1;
        loop {
            let result = sqlx::query(
                "SELECT ts, pid, container, saddr, sport, daddr, dport, proto
                 FROM flows ORDER BY rowid DESC LIMIT ?",
            )
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await;

            match result {
                Ok(rows) => {
                    return Ok(rows
                        .iter()
                        .map(|row| FlowRecord {
                            ts: row.get("ts"),
                            pid: row.get::<i64, _>("pid") as u32,
                            container: ContainerIdentity::from_db(row.get("container")),
                            saddr: row.get("saddr"),
                            sport: row.get::<i64, _>("sport") as u16,
                            daddr: row.get("daddr"),
                            dport: row.get::<i64, _>("dport") as u16,
                            proto: row.get::<i64, _>("proto") as u8,
                        })
                        .collect());
                }
                Err(err) if attempt < LOCK_RETRY_ATTEMPTS && is_locked(&err) => {
                    warn!("Flow ledger busy on read (attempt {attempt}): {err}");
                    tokio::time::sleep(backoff(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub async fn count(&self) -> Result<i64, sqlx::Error> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM flows")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

// SQLITE_BUSY is primary code 5, SQLITE_LOCKED is 6.
fn is_locked(err: &sqlx::Error) -> bool {
    let Some(db_err) = err.as_database_error() else {
        return false;
    };
    match db_err.code().as_deref() {
        Some("5") | Some("6") => true,
        _ => db_err.message().contains("locked"),
    }
}

fn backoff(attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    LOCK_BACKOFF_BASE.saturating_mul(factor).min(LOCK_BACKOFF_CAP)
}
