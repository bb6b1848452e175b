use crate::store::error::StoreError;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode};
use sqlx::{ConnectOptions, Connection};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

const MAX_RETRIES: u32 = 7;
const BASE_DELAY: Duration = Duration::from_millis(20);
const MAX_DELAY: Duration = Duration::from_millis(2000);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Sub-millisecond jitter so concurrent writers back off out of phase.
fn jitter() -> Duration {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    Duration::from_micros(u64::from(nanos % 1000))
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = BASE_DELAY.saturating_mul(2u32.saturating_pow(attempt));
    std::cmp::min(exp, MAX_DELAY) + jitter()
}

/// Manages exactly one write connection and one read connection to the
/// database file.
///
/// All writes are serialized through the write mutex and run inside a
/// `BEGIN IMMEDIATE` transaction so the writer lock is taken up front;
/// contention on BEGIN is retried with exponential backoff and jitter.
/// Initialization is lazy behind an init lock (double-checked), enables WAL
/// and foreign-key enforcement, and creates the `_stores` metadata table.
/// Shutdown flips a flag that refuses new work, checkpoints the WAL, and
/// closes both connections with a bounded wait.
pub struct ConnectionManager {
    db_path: PathBuf,
    write_conn: Mutex<Option<SqliteConnection>>,
    read_conn: Mutex<Option<SqliteConnection>>,
    init_lock: Mutex<()>,
    initialized: AtomicBool,
    shutting_down: AtomicBool,
    // Set while a write transaction is open; lets the next writer roll back
    // a transaction abandoned by a cancelled task.
    tx_open: AtomicBool,
}

/// Guard over the shared read connection.
pub struct ReadGuard<'a> {
    guard: MutexGuard<'a, Option<SqliteConnection>>,
}

impl ReadGuard<'_> {
    pub fn conn(&mut self) -> Result<&mut SqliteConnection, StoreError> {
        self.guard.as_mut().ok_or(StoreError::ShuttingDown)
    }
}

/// An open write transaction. The unit of durability: commit on success,
/// roll back and re-raise on any error.
pub struct WriteTx<'a> {
    guard: MutexGuard<'a, Option<SqliteConnection>>,
    manager: &'a ConnectionManager,
}

impl<'a> WriteTx<'a> {
    pub fn conn(&mut self) -> Result<&mut SqliteConnection, StoreError> {
        self.guard.as_mut().ok_or(StoreError::ShuttingDown)
    }

    pub async fn commit(mut self) -> Result<(), StoreError> {
        let conn = self.guard.as_mut().ok_or(StoreError::ShuttingDown)?;
        sqlx::query("COMMIT").execute(&mut *conn).await?;
        self.manager.tx_open.store(false, Ordering::SeqCst);
        debug!("write transaction committed");
        Ok(())
    }

    pub async fn rollback(mut self) -> Result<(), StoreError> {
        let conn = self.guard.as_mut().ok_or(StoreError::ShuttingDown)?;
        if let Err(e) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
            error!("error during rollback: {e}");
            return Err(e.into());
        }
        self.manager.tx_open.store(false, Ordering::SeqCst);
        debug!("write transaction rolled back");
        Ok(())
    }
}

impl ConnectionManager {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
            write_conn: Mutex::new(None),
            read_conn: Mutex::new(None),
            init_lock: Mutex::new(()),
            initialized: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            tx_open: AtomicBool::new(false),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    async fn ensure_init(&self) -> Result<(), StoreError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(StoreError::ShuttingDown);
        }
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }

        let _init = self.init_lock.lock().await;
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(parent) = self.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Validation(format!("cannot create data dir: {e}")))?;
            }
        }

        for attempt in 0..MAX_RETRIES {
            info!(
                "initializing shared connections to {} (attempt {}/{})",
                self.db_path.display(),
                attempt + 1,
                MAX_RETRIES
            );
            match self.try_open().await {
                Ok(()) => {
                    self.initialized.store(true, Ordering::SeqCst);
                    return Ok(());
                }
                Err(e) if Self::retryable(&e) && attempt < MAX_RETRIES - 1 => {
                    let delay = backoff_delay(attempt);
                    warn!(
                        "database locked during init, retrying in {:?} (attempt {}/{})",
                        delay,
                        attempt + 1,
                        MAX_RETRIES
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!("failed to initialize database: {e}");
                    return Err(e);
                }
            }
        }
        Err(StoreError::WriteLock(format!(
            "failed to initialize database after {MAX_RETRIES} attempts"
        )))
    }

    async fn try_open(&self) -> Result<(), StoreError> {
        let write_opts = SqliteConnectOptions::new()
            .filename(&self.db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);
        let mut write = write_opts.connect().await?;
        info!("enabled WAL mode and foreign keys");

        let init_result = async {
            sqlx::query("BEGIN IMMEDIATE").execute(&mut write).await?;
            let create = sqlx::query(
                "CREATE TABLE IF NOT EXISTS _stores (
                    name TEXT PRIMARY KEY,
                    schema_json TEXT NOT NULL,
                    cacheable INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL
                )",
            )
            .execute(&mut write)
            .await;
            match create {
                Ok(_) => {
                    sqlx::query("COMMIT").execute(&mut write).await?;
                    Ok(())
                }
                Err(e) => {
                    error!("exception in initial transaction, rolling back");
                    let _ = sqlx::query("ROLLBACK").execute(&mut write).await;
                    Err(StoreError::from(e))
                }
            }
        }
        .await;

        if let Err(e) = init_result {
            let _ = write.close().await;
            return Err(e);
        }
        info!("core database tables initialized (_stores)");

        let read_opts = SqliteConnectOptions::new()
            .filename(&self.db_path)
            .read_only(true)
            .foreign_keys(true);
        let read = match read_opts.connect().await {
            Ok(c) => c,
            Err(e) => {
                let _ = write.close().await;
                return Err(e.into());
            }
        };
        info!("read-only connection initialized");

        *self.write_conn.lock().await = Some(write);
        *self.read_conn.lock().await = Some(read);
        Ok(())
    }

    fn retryable(err: &StoreError) -> bool {
        match err {
            StoreError::Database(e) => StoreError::is_locked(e),
            _ => false,
        }
    }

    /// Acquire the shared read connection.
    pub async fn read(&self) -> Result<ReadGuard<'_>, StoreError> {
        self.ensure_init().await?;
        let guard = self.read_conn.lock().await;
        if guard.is_none() {
            return Err(StoreError::ShuttingDown);
        }
        Ok(ReadGuard { guard })
    }

    /// Acquire the writer lock and open a `BEGIN IMMEDIATE` transaction,
    /// retrying with backoff while the database is locked.
    pub async fn begin_write(&self) -> Result<WriteTx<'_>, StoreError> {
        self.ensure_init().await?;
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(StoreError::ShuttingDown);
        }

        let mut guard = self.write_conn.lock().await;
        debug!("write lock acquired");

        if self.tx_open.swap(false, Ordering::SeqCst) {
            warn!("rolling back transaction abandoned by a cancelled task");
            let conn = guard.as_mut().ok_or(StoreError::ShuttingDown)?;
            let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
        }

        for attempt in 0..MAX_RETRIES {
            let conn = guard.as_mut().ok_or(StoreError::ShuttingDown)?;
            match sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await {
                Ok(_) => {
                    debug!("write transaction started on attempt {}", attempt + 1);
                    self.tx_open.store(true, Ordering::SeqCst);
                    return Ok(WriteTx {
                        guard,
                        manager: self,
                    });
                }
                Err(e) if StoreError::is_locked(&e) && attempt < MAX_RETRIES - 1 => {
                    let delay = backoff_delay(attempt);
                    warn!(
                        "database locked, retrying in {:?} (attempt {}/{})",
                        delay,
                        attempt + 1,
                        MAX_RETRIES
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) if StoreError::is_locked(&e) => {
                    return Err(StoreError::WriteLock(format!(
                        "failed to begin transaction after {MAX_RETRIES} attempts: {e}"
                    )));
                }
                Err(e) => {
                    error!("unexpected error beginning transaction: {e}");
                    return Err(e.into());
                }
            }
        }
        Err(StoreError::WriteLock(format!(
            "failed to begin transaction after {MAX_RETRIES} attempts"
        )))
    }

    /// Graceful shutdown: refuse new work, checkpoint the WAL, close both
    /// connections with a bounded wait.
    pub async fn shutdown(&self) {
        info!("starting store shutdown");
        self.shutting_down.store(true, Ordering::SeqCst);

        let write = self.write_conn.lock().await.take();
        let read = self.read_conn.lock().await.take();

        if let Some(mut conn) = write {
            info!("closing write connection");
            let checkpoint = tokio::time::timeout(
                CLOSE_TIMEOUT,
                sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(&mut conn),
            )
            .await;
            match checkpoint {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!("WAL checkpoint failed: {e}"),
                Err(_) => warn!("WAL checkpoint timed out"),
            }
            match tokio::time::timeout(CLOSE_TIMEOUT, conn.close()).await {
                Ok(Ok(())) => info!("write connection closed"),
                Ok(Err(e)) => warn!("error closing write connection: {e}"),
                Err(_) => warn!("write connection close timed out, dropping"),
            }
        }

        if let Some(conn) = read {
            info!("closing read connection");
            match tokio::time::timeout(CLOSE_TIMEOUT, conn.close()).await {
                Ok(Ok(())) => info!("read connection closed"),
                Ok(Err(e)) => warn!("error closing read connection: {e}"),
                Err(_) => warn!("read connection close timed out, dropping"),
            }
        }

        info!("store shutdown completed");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("test.db");
        (dir, path)
    }

    #[tokio::test]
    async fn init_creates_metadata_table() {
        let (_dir, path) = temp_db();
        let mgr = ConnectionManager::new(&path);
        let mut read = mgr.read().await.unwrap();
        let row = sqlx::query("SELECT COUNT(*) AS n FROM _stores")
            .fetch_one(&mut *read.conn().unwrap())
            .await
            .unwrap();
        use sqlx::Row;
        let n: i64 = row.try_get("n").unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn commit_persists_and_rollback_discards() {
        let (_dir, path) = temp_db();
        let mgr = ConnectionManager::new(&path);

        let mut tx = mgr.begin_write().await.unwrap();
        sqlx::query("INSERT INTO _stores (name, schema_json, cacheable, created_at) VALUES ('a', '{}', 0, 'now')")
            .execute(&mut *tx.conn().unwrap())
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mut tx = mgr.begin_write().await.unwrap();
        sqlx::query("INSERT INTO _stores (name, schema_json, cacheable, created_at) VALUES ('b', '{}', 0, 'now')")
            .execute(&mut *tx.conn().unwrap())
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        use sqlx::Row;
        let mut read = mgr.read().await.unwrap();
        let rows = sqlx::query("SELECT name FROM _stores ORDER BY name")
            .fetch_all(&mut *read.conn().unwrap())
            .await
            .unwrap();
        let names: Vec<String> = rows.iter().map(|r| r.try_get("name").unwrap()).collect();
        assert_eq!(names, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn operations_after_shutdown_are_refused() {
        let (_dir, path) = temp_db();
        let mgr = ConnectionManager::new(&path);
        mgr.read().await.unwrap();
        mgr.shutdown().await;
        assert!(matches!(mgr.read().await, Err(StoreError::ShuttingDown)));
        assert!(matches!(
            mgr.begin_write().await,
            Err(StoreError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn abandoned_transaction_is_rolled_back_by_next_writer() {
        let (_dir, path) = temp_db();
        let mgr = ConnectionManager::new(&path);

        {
            // Simulate a cancelled task: the guard drops without commit.
            let mut tx = mgr.begin_write().await.unwrap();
            sqlx::query("INSERT INTO _stores (name, schema_json, cacheable, created_at) VALUES ('x', '{}', 0, 'now')")
                .execute(&mut *tx.conn().unwrap())
                .await
                .unwrap();
            drop(tx);
        }

        let tx = mgr.begin_write().await.unwrap();
        tx.commit().await.unwrap();

        use sqlx::Row;
        let mut read = mgr.read().await.unwrap();
        let row = sqlx::query("SELECT COUNT(*) AS n FROM _stores")
            .fetch_one(&mut *read.conn().unwrap())
            .await
            .unwrap();
        let n: i64 = row.try_get("n").unwrap();
        assert_eq!(n, 0);
    }
}
