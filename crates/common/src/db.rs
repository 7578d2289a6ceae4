//! SQLite store for MailProof entities
//!
//! Every table keeps the entity's serialized data form next to a few indexed columns.
//! Rows are decoded through the entities' serde form, so loading re-validates them.

use crate::client::EmailClient;
use crate::job::RenderJob;
use crate::result::TestResult;
use crate::screenshot::Screenshot;
use crate::{Error, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// An entity with its own table
pub trait Record: Serialize + DeserializeOwned {
    const TABLE: &'static str;
    const KIND: &'static str;

    fn key(&self) -> String;

    /// Owning render job, if any
    fn job_key(&self) -> Option<String>;

    fn status_label(&self) -> String;
}

impl Record for EmailClient {
    const TABLE: &'static str = "email_clients";
    const KIND: &'static str = "email client";

    fn key(&self) -> String {
        self.id().to_string()
    }

    fn job_key(&self) -> Option<String> {
        None
    }

    fn status_label(&self) -> String {
        if self.is_active() { "active" } else { "inactive" }.to_string()
    }
}

impl Record for RenderJob {
    const TABLE: &'static str = "render_jobs";
    const KIND: &'static str = "render job";

    fn key(&self) -> String {
        self.id().to_string()
    }

    fn job_key(&self) -> Option<String> {
        Some(self.id().to_string())
    }

    fn status_label(&self) -> String {
        self.status().to_string()
    }
}

impl Record for Screenshot {
    const TABLE: &'static str = "screenshots";
    const KIND: &'static str = "screenshot";

    fn key(&self) -> String {
        self.id().to_string()
    }

    fn job_key(&self) -> Option<String> {
        Some(self.job_id().to_string())
    }

    fn status_label(&self) -> String {
        self.status().to_string()
    }
}

impl Record for TestResult {
    const TABLE: &'static str = "test_results";
    const KIND: &'static str = "test result";

    fn key(&self) -> String {
        self.id().to_string()
    }

    fn job_key(&self) -> Option<String> {
        Some(self.job_id().to_string())
    }

    fn status_label(&self) -> String {
        self.overall_status().to_string()
    }
}

/// Database wrapper for entity persistence
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;

        info!("Opened store at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        let mut ddl = String::new();
        for table in [
            EmailClient::TABLE,
            RenderJob::TABLE,
            Screenshot::TABLE,
            TestResult::TABLE,
        ] {
            ddl.push_str(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    id TEXT PRIMARY KEY,
                    job_id TEXT,
                    status TEXT NOT NULL,
                    data TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    generation INTEGER NOT NULL DEFAULT 1
                );
                CREATE INDEX IF NOT EXISTS idx_{table}_job ON {table}(job_id);
                CREATE INDEX IF NOT EXISTS idx_{table}_status ON {table}(status);
                "#
            ));
        }
        conn.execute_batch(&ddl)?;
        Ok(())
    }

    // ========================================================================
    // Generic operations
    // ========================================================================

    /// Insert a new record, failing if the id is taken
    pub fn insert<R: Record>(&self, record: &R) -> Result<()> {
        let conn = self.conn.lock();
        if row_exists(&conn, R::TABLE, &record.key())? {
            return Err(Error::AlreadyExists {
                kind: R::KIND.to_string(),
                id: record.key(),
            });
        }
        upsert(&conn, record)
    }

    /// Insert or replace a record
    pub fn save<R: Record>(&self, record: &R) -> Result<()> {
        let conn = self.conn.lock();
        upsert(&conn, record)
    }

    /// Insert or replace several records atomically
    pub fn save_all<R: Record>(&self, records: &[R]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for record in records {
            upsert(&tx, record)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get<R: Record>(&self, id: &str) -> Result<Option<R>> {
        let conn = self.conn.lock();
        let data: Option<String> = conn
            .query_row(
                &format!("SELECT data FROM {} WHERE id = ?1", R::TABLE),
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        data.map(|d| decode(&d)).transpose()
    }

    /// Like [`Database::get`] but missing rows are an error
    pub fn load<R: Record>(&self, id: &str) -> Result<R> {
        self.get(id)?.ok_or_else(|| Error::not_found(R::KIND, id))
    }

    /// All records, oldest first
    pub fn list<R: Record>(&self) -> Result<Vec<R>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT data FROM {} ORDER BY created_at, rowid",
            R::TABLE
        ))?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(decode(&row?)?);
        }
        Ok(records)
    }

    /// Records owned by `job_id`, oldest first
    pub fn list_for_job<R: Record>(&self, job_id: Uuid) -> Result<Vec<R>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT data FROM {} WHERE job_id = ?1 ORDER BY created_at, rowid",
            R::TABLE
        ))?;
        let rows = stmt.query_map(params![job_id.to_string()], |row| row.get::<_, String>(0))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(decode(&row?)?);
        }
        Ok(records)
    }

    pub fn delete<R: Record>(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            &format!("DELETE FROM {} WHERE id = ?1", R::TABLE),
            params![id],
        )?;
        if rows > 0 {
            debug!("Deleted {} {}", R::KIND, id);
        }
        Ok(rows > 0)
    }

    pub fn exists<R: Record>(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        row_exists(&conn, R::TABLE, id)
    }

    pub fn count<R: Record>(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", R::TABLE),
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // ========================================================================
    // Job state
    // ========================================================================

    /// Persist a job together with its result and screenshots in one transaction
    pub fn save_job_state(
        &self,
        job: &RenderJob,
        result: &TestResult,
        screenshots: &[Screenshot],
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        upsert(&tx, job)?;
        upsert(&tx, result)?;
        for screenshot in screenshots {
            upsert(&tx, screenshot)?;
        }
        tx.commit()?;
        debug!(job_id = %job.id(), screenshots = screenshots.len(), "Saved job state");
        Ok(())
    }

    /// The test result belonging to `job_id`
    pub fn result_for_job(&self, job_id: Uuid) -> Result<TestResult> {
        self.list_for_job::<TestResult>(job_id)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found(TestResult::KIND, format!("job {}", job_id)))
    }

    /// Remove a job and everything it owns
    pub fn delete_job(&self, job_id: Uuid) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let id = job_id.to_string();
        for table in [Screenshot::TABLE, TestResult::TABLE] {
            tx.execute(&format!("DELETE FROM {} WHERE job_id = ?1", table), params![id])?;
        }
        let rows = tx.execute(
            &format!("DELETE FROM {} WHERE id = ?1", RenderJob::TABLE),
            params![id],
        )?;
        tx.commit()?;
        Ok(rows > 0)
    }
}

fn upsert<R: Record>(conn: &Connection, record: &R) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    conn.execute(
        &format!(
            "INSERT INTO {} (id, job_id, status, data, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(id) DO UPDATE SET
                job_id = excluded.job_id,
                status = excluded.status,
                data = excluded.data,
                updated_at = excluded.updated_at,
                generation = generation + 1",
            R::TABLE
        ),
        params![
            record.key(),
            record.job_key(),
            record.status_label(),
            serde_json::to_string(record)?,
            now,
        ],
    )?;
    debug!("Saved {} {}", R::KIND, record.key());
    Ok(())
}

fn row_exists(conn: &Connection, table: &str, id: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {} WHERE id = ?1", table),
        params![id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn decode<R: Record>(data: &str) -> Result<R> {
    Ok(serde_json::from_str(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SequentialIds;
    use crate::job::{CreateRenderJob, JobStatus, RenderJobConfig};
    use crate::plan::CapturePlanner;
    use crate::presets;
    use crate::result::CreateTestResult;

    #[test]
    fn test_client_crud() {
        let db = Database::open_memory().unwrap();
        let mut gmail = presets::gmail().unwrap();

        db.insert(&gmail).unwrap();
        assert!(matches!(db.insert(&gmail), Err(Error::AlreadyExists { .. })));

        gmail.deactivate();
        db.save(&gmail).unwrap();
        let loaded: EmailClient = db.load("gmail").unwrap();
        assert!(!loaded.is_active());
        assert_eq!(loaded, gmail);

        assert_eq!(db.count::<EmailClient>().unwrap(), 1);
        assert!(db.delete::<EmailClient>("gmail").unwrap());
        assert!(!db.exists::<EmailClient>("gmail").unwrap());
        assert!(matches!(
            db.load::<EmailClient>("gmail"),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_job_state_roundtrip() {
        let db = Database::open_memory().unwrap();
        let ids = SequentialIds::new();
        let clients = presets::all().unwrap();
        db.save_all(&clients).unwrap();

        let config = RenderJobConfig::new(["gmail", "apple-mail"]);
        let params = CreateRenderJob::new("user-7", "<p>hello</p>", config);
        let mut job = RenderJob::create(params, &ids).unwrap();
        job.queue().unwrap();
        let result = TestResult::create(CreateTestResult::for_job(&job), &ids).unwrap();
        let plan = CapturePlanner::new().plan(&job, &clients, &ids).unwrap();

        db.save_job_state(&job, &result, &plan.screenshots).unwrap();

        let loaded: RenderJob = db.load(&job.id().to_string()).unwrap();
        assert_eq!(loaded, job);
        assert_eq!(loaded.status(), JobStatus::Queued);
        assert_eq!(db.result_for_job(job.id()).unwrap(), result);
        let shots: Vec<Screenshot> = db.list_for_job(job.id()).unwrap();
        assert_eq!(shots, plan.screenshots);

        assert!(db.delete_job(job.id()).unwrap());
        assert!(db.list_for_job::<Screenshot>(job.id()).unwrap().is_empty());
        assert!(db.result_for_job(job.id()).is_err());
        assert_eq!(db.list::<EmailClient>().unwrap().len(), clients.len());
    }

    #[test]
    fn test_invalid_rows_are_rejected_on_load() {
        let db = Database::open_memory().unwrap();
        {
            let conn = db.conn.lock();
            conn.execute(
                "INSERT INTO email_clients (id, job_id, status, data, created_at, updated_at)
                 VALUES ('broken', NULL, 'active', '{\"id\":\"broken\"}', 0, 0)",
                [],
            )
            .unwrap();
        }
        assert!(matches!(
            db.get::<EmailClient>("broken"),
            Err(Error::Serialization(_))
        ));
    }
}
