//! Embedded SQLite behind a dedicated worker thread.
//!
//! Architecture:
//! - `Db` is the async-facing handle, holding an `mpsc::SyncSender<DbCommand>`
//! - the worker runs on `std::thread::spawn` (rusqlite is sync) and owns the
//!   only `Connection`
//! - callers send boxed closures and await a `tokio::sync::oneshot` reply;
//!   multi-entity transactions are one closure running one transaction
//!
//! The single connection makes the store the single writer of entity state:
//! commands execute strictly in arrival order.

use std::path::Path;
use std::sync::mpsc;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::KilnError;

/// Bounded channel: prevents unbounded memory growth if the worker stalls.
const COMMAND_BUFFER: usize = 128;

enum DbCommand {
    Call(Box<dyn FnOnce(&mut Connection) + Send>),
    Shutdown,
}

pub struct Db {
    tx: mpsc::SyncSender<DbCommand>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl Db {
    /// Open (or create) the database at `path`, apply pragmas and schema,
    /// and spawn the worker thread.
    pub fn open(path: &Path) -> Result<Self, KilnError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let mut conn = Connection::open(path)?;
        init_connection(&mut conn)?;

        let (tx, rx) = mpsc::sync_channel::<DbCommand>(COMMAND_BUFFER);
        let builder = std::thread::Builder::new().name("kiln-db".into());
        let worker = builder
            .spawn(move || {
                while let Ok(cmd) = rx.recv() {
                    match cmd {
                        DbCommand::Call(f) => f(&mut conn),
                        DbCommand::Shutdown => break,
                    }
                }
            })
            .map_err(|e| KilnError::Db(format!("failed to spawn db worker: {e}")))?;

        Ok(Self {
            tx,
            worker: Some(worker),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self, KilnError> {
        let mut conn = Connection::open_in_memory()?;
        init_connection(&mut conn)?;

        let (tx, rx) = mpsc::sync_channel::<DbCommand>(COMMAND_BUFFER);
        let builder = std::thread::Builder::new().name("kiln-db".into());
        let worker = builder
            .spawn(move || {
                while let Ok(cmd) = rx.recv() {
                    match cmd {
                        DbCommand::Call(f) => f(&mut conn),
                        DbCommand::Shutdown => break,
                    }
                }
            })
            .map_err(|e| KilnError::Db(format!("failed to spawn db worker: {e}")))?;

        Ok(Self {
            tx,
            worker: Some(worker),
        })
    }

    /// Run a closure on the worker thread and await its result.
    pub async fn call<T, F>(&self, f: F) -> Result<T, KilnError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, KilnError> + Send + 'static,
    {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        let cmd = DbCommand::Call(Box::new(move |conn| {
            let _ = reply_tx.send(f(conn));
        }));

        self.tx
            .send(cmd)
            .map_err(|_| KilnError::Db("db worker is gone".to_string()))?;

        reply_rx
            .await
            .map_err(|_| KilnError::Db("db worker dropped the reply".to_string()))?
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        let _ = self.tx.send(DbCommand::Shutdown);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

fn init_connection(conn: &mut Connection) -> Result<(), KilnError> {
    // journal_mode and busy_timeout return rows; execute_batch discards them.
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

/// Fixed-width RFC 3339 (microseconds, Z suffix) so TEXT timestamps sort
/// lexicographically.
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>, KilnError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| KilnError::Db(format!("bad timestamp {raw:?}: {e}")))
}

pub fn parse_ts_opt(raw: Option<String>) -> Result<Option<DateTime<Utc>>, KilnError> {
    raw.as_deref().map(parse_ts).transpose()
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS requests (
    id                   TEXT PRIMARY KEY,
    external_user_id     TEXT NOT NULL,
    original_prompt      TEXT NOT NULL,
    status               TEXT NOT NULL,
    phase                TEXT NOT NULL,
    selected_image_index INTEGER,
    created_at           TEXT NOT NULL,
    updated_at           TEXT NOT NULL,
    completed_at         TEXT
);
CREATE INDEX IF NOT EXISTS idx_requests_user_created ON requests(external_user_id, created_at);
CREATE INDEX IF NOT EXISTS idx_requests_status_phase ON requests(status, phase);

CREATE TABLE IF NOT EXISTS images (
    id            TEXT PRIMARY KEY,
    request_id    TEXT NOT NULL REFERENCES requests(id) ON DELETE CASCADE,
    image_index   INTEGER NOT NULL,
    image_url     TEXT,
    image_prompt  TEXT,
    image_status  TEXT NOT NULL,
    error_message TEXT,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL,
    completed_at  TEXT,
    UNIQUE (request_id, image_index)
);
CREATE INDEX IF NOT EXISTS idx_images_request ON images(request_id);
CREATE INDEX IF NOT EXISTS idx_images_status ON images(image_status);

CREATE TABLE IF NOT EXISTS image_jobs (
    id            TEXT PRIMARY KEY,
    image_id      TEXT NOT NULL UNIQUE REFERENCES images(id) ON DELETE CASCADE,
    status        TEXT NOT NULL,
    priority      INTEGER NOT NULL DEFAULT 0,
    retry_count   INTEGER NOT NULL DEFAULT 0,
    max_retries   INTEGER NOT NULL DEFAULT 3,
    next_retry_at TEXT,
    timeout_at    TEXT,
    provider_name TEXT,
    error_message TEXT,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_image_jobs_sched ON image_jobs(status, priority, created_at);
CREATE INDEX IF NOT EXISTS idx_image_jobs_retry ON image_jobs(status, next_retry_at);

CREATE TABLE IF NOT EXISTS models (
    id                TEXT PRIMARY KEY,
    external_user_id  TEXT NOT NULL,
    source            TEXT NOT NULL,
    request_id        TEXT UNIQUE,
    source_image_id   TEXT,
    name              TEXT NOT NULL,
    model_url         TEXT,
    mtl_url           TEXT,
    texture_url       TEXT,
    preview_image_url TEXT,
    format            TEXT NOT NULL DEFAULT 'OBJ',
    file_size         INTEGER,
    visibility        TEXT NOT NULL,
    published_at      TEXT,
    view_count        INTEGER NOT NULL DEFAULT 0,
    like_count        INTEGER NOT NULL DEFAULT 0,
    favorite_count    INTEGER NOT NULL DEFAULT 0,
    download_count    INTEGER NOT NULL DEFAULT 0,
    slice_task_id     TEXT,
    print_status      TEXT NOT NULL DEFAULT 'NOT_STARTED',
    error_message     TEXT,
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL,
    completed_at      TEXT,
    failed_at         TEXT
);
CREATE INDEX IF NOT EXISTS idx_models_user_created ON models(external_user_id, created_at);
CREATE INDEX IF NOT EXISTS idx_models_visibility ON models(visibility, published_at);

CREATE TABLE IF NOT EXISTS model_jobs (
    id              TEXT PRIMARY KEY,
    model_id        TEXT NOT NULL UNIQUE REFERENCES models(id) ON DELETE CASCADE,
    status          TEXT NOT NULL,
    priority        INTEGER NOT NULL DEFAULT 0,
    retry_count     INTEGER NOT NULL DEFAULT 0,
    max_retries     INTEGER NOT NULL DEFAULT 3,
    next_retry_at   TEXT,
    timeout_at      TEXT,
    provider_name   TEXT,
    provider_job_id TEXT,
    progress        INTEGER NOT NULL DEFAULT 0,
    error_message   TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_model_jobs_sched ON model_jobs(status, priority, created_at);
CREATE INDEX IF NOT EXISTS idx_model_jobs_retry ON model_jobs(status, next_retry_at);

CREATE TABLE IF NOT EXISTS orphaned_files (
    id          TEXT PRIMARY KEY,
    s3_key      TEXT NOT NULL,
    request_id  TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_error  TEXT,
    created_at  TEXT NOT NULL,
    deleted_at  TEXT
);
CREATE INDEX IF NOT EXISTS idx_orphans_pending ON orphaned_files(deleted_at, retry_count);

CREATE TABLE IF NOT EXISTS queue_jobs (
    id            TEXT PRIMARY KEY,
    queue         TEXT NOT NULL,
    job_key       TEXT NOT NULL,
    request_id    TEXT NOT NULL,
    payload       TEXT NOT NULL,
    priority      INTEGER NOT NULL DEFAULT 0,
    attempts_max  INTEGER NOT NULL DEFAULT 3,
    attempts_made INTEGER NOT NULL DEFAULT 0,
    state         TEXT NOT NULL,
    run_at        TEXT NOT NULL,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL,
    claimed_at    TEXT,
    finished_at   TEXT,
    last_error    TEXT,
    UNIQUE (queue, job_key)
);
CREATE INDEX IF NOT EXISTS idx_queue_due ON queue_jobs(queue, state, run_at);
CREATE INDEX IF NOT EXISTS idx_queue_order ON queue_jobs(queue, state, priority, created_at);
CREATE INDEX IF NOT EXISTS idx_queue_request ON queue_jobs(request_id);
"#;
