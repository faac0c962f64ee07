use std::path::{Path, PathBuf};
use std::time::Duration;

use accessbridge_kernel::LabelKey;
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension, TransactionBehavior};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::debug;

use crate::error::StoreError;
use crate::ticket::Labels;

const KEY_HOOK_ID: &str = "hook_id";
const LABEL_KEY_PREFIX: &str = "label:";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const LOCK_WAIT: Duration = Duration::from_secs(60);
const LOCK_POLL: Duration = Duration::from_millis(10);

pub struct KvStore {
    path: PathBuf,
    writer: Mutex<Connection>,
}

pub struct Bucket<'a> {
    conn: &'a Connection,
    path: String,
}

impl Bucket<'_> {
    pub fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM entries WHERE bucket = ?1 AND key = ?2",
                params![self.path, key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "
            INSERT INTO entries(bucket, key, value) VALUES (?1, ?2, ?3)
            ON CONFLICT(bucket, key) DO UPDATE SET value = excluded.value
            ",
            params![self.path, key, value],
        )?;
        Ok(())
    }

    fn with_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT key, value FROM entries WHERE bucket = ?1 AND substr(key, 1, ?2) = ?3 ORDER BY key",
        )?;
        let rows = stmt.query_map(params![self.path, prefix.len() as i64, prefix], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

pub struct Settings<'a>(Bucket<'a>);

impl Settings<'_> {
    pub fn hook_id(&self) -> Result<Option<String>, StoreError> {
        self.0.get(KEY_HOOK_ID)
    }

    pub fn set_hook_id(&self, hook_id: &str) -> Result<(), StoreError> {
        self.0.put(KEY_HOOK_ID, hook_id)
    }

    pub fn label(&self, key: LabelKey) -> Result<Option<String>, StoreError> {
        self.0.get(&format!("{LABEL_KEY_PREFIX}{}", key.as_str()))
    }

    pub fn set_label(&self, key: LabelKey, name: &str) -> Result<(), StoreError> {
        self.0
            .put(&format!("{LABEL_KEY_PREFIX}{}", key.as_str()), name)
    }

    pub fn labels(&self) -> Result<Labels, StoreError> {
        let mut labels = Labels::new();
        for (key, value) in self.0.with_prefix(LABEL_KEY_PREFIX)? {
            let raw = &key[LABEL_KEY_PREFIX.len()..];
            let label_key = LabelKey::parse(raw).ok_or_else(|| StoreError::Encoding {
                key: key.clone(),
                value: value.clone(),
            })?;
            labels.insert(label_key, value);
        }
        Ok(labels)
    }

    pub fn set_labels(&self, labels: &Labels) -> Result<(), StoreError> {
        for (key, name) in labels {
            self.set_label(*key, name)?;
        }
        Ok(())
    }
}

pub struct Issues<'a>(Bucket<'a>);

impl Issues<'_> {
    pub fn request_id(&self, issue_key: &str) -> Result<Option<String>, StoreError> {
        self.0.get(issue_key)
    }

    pub fn set_request_id(&self, issue_key: &str, request_id: &str) -> Result<(), StoreError> {
        self.0.put(issue_key, request_id)
    }
}

fn settings_bucket(project: &str) -> String {
    format!("project:{project}/settings")
}

fn issues_bucket(project: &str) -> String {
    format!("project:{project}/issues")
}

impl KvStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS buckets (
                path TEXT PRIMARY KEY
            );
            CREATE TABLE IF NOT EXISTS entries (
                bucket TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (bucket, key)
            );
            ",
        )?;
        Ok(Self {
            path,
            writer: Mutex::new(conn),
        })
    }

    pub async fn update_settings<R, F>(&self, project: &str, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Settings<'_>) -> Result<R, StoreError>,
    {
        self.update(settings_bucket(project), |bucket| f(&Settings(bucket)))
            .await
    }

    pub async fn view_settings<R, F>(&self, project: &str, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Settings<'_>) -> Result<R, StoreError>,
    {
        self.view(settings_bucket(project), |bucket| f(&Settings(bucket)))
    }

    pub async fn update_issues<R, F>(&self, project: &str, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Issues<'_>) -> Result<R, StoreError>,
    {
        self.update(issues_bucket(project), |bucket| f(&Issues(bucket)))
            .await
    }

    pub async fn view_issues<R, F>(&self, project: &str, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Issues<'_>) -> Result<R, StoreError>,
    {
        self.view(issues_bucket(project), |bucket| f(&Issues(bucket)))
    }

    // Stays open across awaits; other handles on the same file wait for it.
    pub async fn begin_settings(&self, project: &str) -> Result<SettingsTxn<'_>, StoreError> {
        let mut conn = self.writer.lock().await;
        begin_immediate(&mut conn).await?;
        let txn = SettingsTxn {
            conn,
            path: settings_bucket(project),
            finished: false,
        };
        txn.conn.execute(
            "INSERT OR IGNORE INTO buckets(path) VALUES (?1)",
            params![txn.path],
        )?;
        Ok(txn)
    }

    async fn update<R, F>(&self, path: String, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(Bucket<'_>) -> Result<R, StoreError>,
    {
        let mut conn = self.writer.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT OR IGNORE INTO buckets(path) VALUES (?1)",
            params![path],
        )?;
        let out = f(Bucket { conn: &tx, path })?;
        tx.commit()?;
        Ok(out)
    }

    fn view<R, F>(&self, path: String, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(Bucket<'_>) -> Result<R, StoreError>,
    {
        let mut conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM buckets WHERE path = ?1",
                params![path],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::NoBucket(path));
        }
        f(Bucket { conn: &tx, path })
    }
}

// Rolls back when dropped without commit.
pub struct SettingsTxn<'a> {
    conn: MutexGuard<'a, Connection>,
    path: String,
    finished: bool,
}

impl SettingsTxn<'_> {
    pub fn settings(&self) -> Settings<'_> {
        Settings(Bucket {
            conn: &self.conn,
            path: self.path.clone(),
        })
    }

    pub fn commit(mut self) -> Result<(), StoreError> {
        self.conn.execute_batch("COMMIT")?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for SettingsTxn<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(err) = self.conn.execute_batch("ROLLBACK") {
                debug!(error = %err, "rollback of settings transaction failed");
            }
        }
    }
}

// The connection's busy handler would block the runtime thread while another
// writer holds the lock, so the wait happens here with async sleeps instead.
async fn begin_immediate(conn: &mut Connection) -> Result<(), StoreError> {
    let deadline = Instant::now() + LOCK_WAIT;
    conn.busy_timeout(Duration::ZERO)?;
    let begun = loop {
        match conn.execute_batch("BEGIN IMMEDIATE") {
            Ok(()) => break Ok(()),
            Err(err) if is_busy(&err) && Instant::now() < deadline => {
                tokio::time::sleep(LOCK_POLL).await
            }
            Err(err) => break Err(err),
        }
    };
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(begun?)
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::DatabaseBusy || e.code == ErrorCode::DatabaseLocked
    )
}
