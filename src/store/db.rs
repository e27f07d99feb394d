use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use super::models::*;

/// Async-safe handle to the store.
///
/// Wraps `StoreDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so SQLite I/O never ties up
/// async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<StoreDb>>,
}

impl DbHandle {
    pub fn new(db: StoreDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&StoreDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for startup and tests.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, StoreDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct StoreDb {
    conn: Connection,
}

impl StoreDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS projects (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS messages (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    content TEXT NOT NULL,
                    role TEXT NOT NULL,
                    type TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS fragments (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    message_id INTEGER NOT NULL UNIQUE REFERENCES messages(id) ON DELETE CASCADE,
                    sandbox_url TEXT NOT NULL,
                    title TEXT NOT NULL,
                    files TEXT NOT NULL DEFAULT '{}'
                );

                CREATE TABLE IF NOT EXISTS workflow_runs (
                    id TEXT PRIMARY KEY,
                    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    prompt TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'queued',
                    attempts INTEGER NOT NULL DEFAULT 0,
                    error TEXT,
                    started_at TEXT NOT NULL,
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS workflow_steps (
                    run_id TEXT NOT NULL REFERENCES workflow_runs(id) ON DELETE CASCADE,
                    step_key TEXT NOT NULL,
                    output TEXT NOT NULL,
                    completed_at TEXT NOT NULL,
                    terminal INTEGER NOT NULL DEFAULT 0,
                    PRIMARY KEY (run_id, step_key)
                );

                CREATE UNIQUE INDEX IF NOT EXISTS idx_workflow_steps_terminal
                    ON workflow_steps(run_id) WHERE terminal = 1;

                CREATE INDEX IF NOT EXISTS idx_messages_project ON messages(project_id, created_at);
                CREATE INDEX IF NOT EXISTS idx_workflow_runs_status ON workflow_runs(status);
                ",
            )
            .context("Failed to run schema migrations")?;
        Ok(())
    }

    // ── Projects ──────────────────────────────────────────────────────

    pub fn create_project(&self, name: &str) -> Result<Project> {
        let id = uuid::Uuid::new_v4().to_string();
        self.conn
            .execute(
                "INSERT INTO projects (id, name, created_at) VALUES (?1, ?2, ?3)",
                params![id, name, now_timestamp()],
            )
            .context("Failed to insert project")?;
        self.get_project(&id)?
            .context("Project not found after insert")
    }

    pub fn get_project(&self, id: &str) -> Result<Option<Project>> {
        self.conn
            .query_row(
                "SELECT id, name, created_at FROM projects WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Project {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                },
            )
            .optional()
            .context("Failed to query project")
    }

    // ── Messages ──────────────────────────────────────────────────────

    /// Append a message, and its fragment when given, in one transaction.
    pub fn create_message(
        &self,
        project_id: &str,
        content: &str,
        role: MessageRole,
        message_type: MessageType,
        fragment: Option<&NewFragment>,
    ) -> Result<Message> {
        self.create_message_at(project_id, content, role, message_type, fragment, &now_timestamp())
    }

    /// Same as [`create_message`](Self::create_message) with an explicit timestamp.
    pub fn create_message_at(
        &self,
        project_id: &str,
        content: &str,
        role: MessageRole,
        message_type: MessageType,
        fragment: Option<&NewFragment>,
        created_at: &str,
    ) -> Result<Message> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin message transaction")?;
        let message_id = insert_message(
            &tx,
            project_id,
            content,
            role,
            message_type,
            fragment,
            created_at,
        )?;
        tx.commit().context("Failed to commit message")?;

        self.get_message(message_id)?
            .context("Message not found after insert")
    }

    /// Write the single terminal record of a run together with its step row.
    ///
    /// Both rows commit in one transaction. Calling again with the same key
    /// returns the stored message; a run that already ended under another
    /// key is an error.
    pub fn create_terminal_message(
        &self,
        run_id: &str,
        step_key: &str,
        project_id: &str,
        content: &str,
        message_type: MessageType,
        fragment: Option<&NewFragment>,
    ) -> Result<Message> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin terminal transaction")?;

        if let Some((key, message_id)) = terminal_step_in(&tx, run_id)? {
            if key != step_key {
                anyhow::bail!("Run {} already ended with step '{}'", run_id, key);
            }
            drop(tx);
            return self
                .get_message(message_id)?
                .with_context(|| format!("Terminal message {} is missing", message_id));
        }

        let message_id = insert_message(
            &tx,
            project_id,
            content,
            MessageRole::Assistant,
            message_type,
            fragment,
            &now_timestamp(),
        )?;
        tx.execute(
            "INSERT INTO workflow_steps (run_id, step_key, output, completed_at, terminal)
             VALUES (?1, ?2, ?3, ?4, 1)",
            params![run_id, step_key, message_id.to_string(), now_timestamp()],
        )
        .context("Failed to record terminal step")?;
        tx.commit().context("Failed to commit terminal record")?;

        self.get_message(message_id)?
            .context("Message not found after insert")
    }

    /// The terminal step of a run, if one was written: its key and message.
    pub fn terminal_record(&self, run_id: &str) -> Result<Option<(String, Message)>> {
        let Some((key, message_id)) = terminal_step_in(&self.conn, run_id)? else {
            return Ok(None);
        };
        let message = self
            .get_message(message_id)?
            .with_context(|| format!("Terminal message {} is missing", message_id))?;
        Ok(Some((key, message)))
    }

    pub fn get_message(&self, id: i64) -> Result<Option<Message>> {
        let sql = format!("{} WHERE m.id = ?1", MESSAGE_SELECT);
        let row = self
            .conn
            .query_row(&sql, params![id], MessageRow::from_row)
            .optional()
            .context("Failed to query message")?;
        row.map(MessageRow::into_message).transpose()
    }

    /// All messages of a project, oldest first.
    pub fn list_messages(&self, project_id: &str) -> Result<Vec<Message>> {
        let sql = format!(
            "{} WHERE m.project_id = ?1 ORDER BY m.created_at ASC, m.id ASC",
            MESSAGE_SELECT
        );
        self.query_messages(&sql, params![project_id])
    }

    /// The `limit` most recent messages of a project, returned oldest first.
    pub fn recent_messages(&self, project_id: &str, limit: usize) -> Result<Vec<Message>> {
        let sql = format!(
            "{} WHERE m.project_id = ?1 ORDER BY m.created_at DESC, m.id DESC LIMIT ?2",
            MESSAGE_SELECT
        );
        let mut messages = self.query_messages(&sql, params![project_id, limit as i64])?;
        messages.reverse();
        Ok(messages)
    }

    /// Assistant messages of a project (terminal records).
    pub fn assistant_messages(&self, project_id: &str) -> Result<Vec<Message>> {
        Ok(self
            .list_messages(project_id)?
            .into_iter()
            .filter(|m| m.role == MessageRole::Assistant)
            .collect())
    }

    fn query_messages(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Message>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .context("Failed to prepare message query")?;
        let rows = stmt
            .query_map(params, MessageRow::from_row)
            .context("Failed to query messages")?;
        let mut messages = Vec::new();
        for row in rows {
            let row = row.context("Failed to read message row")?;
            messages.push(row.into_message()?);
        }
        Ok(messages)
    }

    // ── Workflow runs ─────────────────────────────────────────────────

    pub fn create_run(&self, id: &str, project_id: &str, prompt: &str) -> Result<WorkflowRun> {
        self.conn
            .execute(
                "INSERT INTO workflow_runs (id, project_id, prompt, started_at) VALUES (?1, ?2, ?3, ?4)",
                params![id, project_id, prompt, now_timestamp()],
            )
            .context("Failed to insert workflow run")?;
        self.get_run(id)?
            .context("Workflow run not found after insert")
    }

    /// Mark a run as running and count the attempt.
    pub fn start_run_attempt(&self, id: &str) -> Result<WorkflowRun> {
        self.conn
            .execute(
                "UPDATE workflow_runs SET status = 'running', attempts = attempts + 1 WHERE id = ?1",
                params![id],
            )
            .context("Failed to start workflow run attempt")?;
        self.get_run(id)?
            .context("Workflow run not found after update")
    }

    pub fn update_run_status(
        &self,
        id: &str,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<WorkflowRun> {
        if status.is_terminal() {
            self.conn
                .execute(
                    "UPDATE workflow_runs SET status = ?1, error = ?2, completed_at = ?3 WHERE id = ?4",
                    params![status.as_str(), error, now_timestamp(), id],
                )
                .context("Failed to update workflow run")?;
        } else {
            self.conn
                .execute(
                    "UPDATE workflow_runs SET status = ?1, error = ?2 WHERE id = ?3",
                    params![status.as_str(), error, id],
                )
                .context("Failed to update workflow run")?;
        }
        self.get_run(id)?
            .context("Workflow run not found after update")
    }

    pub fn get_run(&self, id: &str) -> Result<Option<WorkflowRun>> {
        let row = self
            .conn
            .query_row(
                &format!("{} WHERE id = ?1", RUN_SELECT),
                params![id],
                RunRow::from_row,
            )
            .optional()
            .context("Failed to query workflow run")?;
        row.map(RunRow::into_run).transpose()
    }

    /// Runs that were queued or running when the process last stopped.
    pub fn unfinished_runs(&self) -> Result<Vec<WorkflowRun>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "{} WHERE status IN ('queued', 'running') ORDER BY started_at ASC",
                RUN_SELECT
            ))
            .context("Failed to prepare unfinished_runs")?;
        let rows = stmt
            .query_map([], RunRow::from_row)
            .context("Failed to query unfinished runs")?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row.context("Failed to read workflow run row")?.into_run()?);
        }
        Ok(runs)
    }

    // ── Step log ──────────────────────────────────────────────────────

    /// Recorded output of a completed step, if any.
    pub fn step_output(&self, run_id: &str, step_key: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT output FROM workflow_steps WHERE run_id = ?1 AND step_key = ?2",
                params![run_id, step_key],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query step output")
    }

    /// Record a step output. The first recorded output for a key wins.
    pub fn record_step(&self, run_id: &str, step_key: &str, output: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO workflow_steps (run_id, step_key, output, completed_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(run_id, step_key) DO NOTHING",
                params![run_id, step_key, output, now_timestamp()],
            )
            .context("Failed to record step")?;
        Ok(())
    }

    /// Keys of all completed steps of a run, in completion order.
    pub fn step_keys(&self, run_id: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT step_key FROM workflow_steps WHERE run_id = ?1 ORDER BY completed_at ASC, rowid ASC",
            )
            .context("Failed to prepare step_keys")?;
        let rows = stmt
            .query_map(params![run_id], |row| row.get(0))
            .context("Failed to query step keys")?;
        let mut keys = Vec::new();
        for row in rows {
            keys.push(row.context("Failed to read step key")?);
        }
        Ok(keys)
    }
}

// ── Row helpers ───────────────────────────────────────────────────────

fn insert_message(
    conn: &Connection,
    project_id: &str,
    content: &str,
    role: MessageRole,
    message_type: MessageType,
    fragment: Option<&NewFragment>,
    created_at: &str,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO messages (project_id, content, role, type, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![project_id, content, role.as_str(), message_type.as_str(), created_at],
    )
    .context("Failed to insert message")?;
    let message_id = conn.last_insert_rowid();

    if let Some(fragment) = fragment {
        let files =
            serde_json::to_string(&fragment.files).context("Failed to serialize fragment files")?;
        conn.execute(
            "INSERT INTO fragments (message_id, sandbox_url, title, files) VALUES (?1, ?2, ?3, ?4)",
            params![message_id, fragment.sandbox_url, fragment.title, files],
        )
        .context("Failed to insert fragment")?;
    }
    Ok(message_id)
}

fn terminal_step_in(conn: &Connection, run_id: &str) -> Result<Option<(String, i64)>> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT step_key, output FROM workflow_steps WHERE run_id = ?1 AND terminal = 1",
            params![run_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .context("Failed to query terminal step")?;
    row.map(|(key, output)| {
        let message_id = output
            .trim()
            .parse::<i64>()
            .with_context(|| format!("Corrupt terminal step output '{}'", output))?;
        Ok((key, message_id))
    })
    .transpose()
}

const MESSAGE_SELECT: &str = "SELECT m.id, m.project_id, m.content, m.role, m.type, m.created_at,
        f.id, f.sandbox_url, f.title, f.files
     FROM messages m LEFT JOIN fragments f ON f.message_id = m.id";

const RUN_SELECT: &str = "SELECT id, project_id, prompt, status, attempts, error, started_at, completed_at
     FROM workflow_runs";

struct MessageRow {
    id: i64,
    project_id: String,
    content: String,
    role: String,
    message_type: String,
    created_at: String,
    fragment_id: Option<i64>,
    sandbox_url: Option<String>,
    title: Option<String>,
    files: Option<String>,
}

impl MessageRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            content: row.get(2)?,
            role: row.get(3)?,
            message_type: row.get(4)?,
            created_at: row.get(5)?,
            fragment_id: row.get(6)?,
            sandbox_url: row.get(7)?,
            title: row.get(8)?,
            files: row.get(9)?,
        })
    }

    fn into_message(self) -> Result<Message> {
        let role = MessageRole::from_str(&self.role)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse message role")?;
        let message_type = MessageType::from_str(&self.message_type)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse message type")?;
        let fragment = match self.fragment_id {
            Some(fragment_id) => {
                let files: BTreeMap<String, String> =
                    serde_json::from_str(self.files.as_deref().unwrap_or("{}"))
                        .context("Failed to parse fragment files")?;
                Some(Fragment {
                    id: fragment_id,
                    message_id: self.id,
                    sandbox_url: self.sandbox_url.unwrap_or_default(),
                    title: self.title.unwrap_or_default(),
                    files,
                })
            }
            None => None,
        };
        Ok(Message {
            id: self.id,
            project_id: self.project_id,
            content: self.content,
            role,
            message_type,
            created_at: self.created_at,
            fragment,
        })
    }
}

struct RunRow {
    id: String,
    project_id: String,
    prompt: String,
    status: String,
    attempts: i64,
    error: Option<String>,
    started_at: String,
    completed_at: Option<String>,
}

impl RunRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            prompt: row.get(2)?,
            status: row.get(3)?,
            attempts: row.get(4)?,
            error: row.get(5)?,
            started_at: row.get(6)?,
            completed_at: row.get(7)?,
        })
    }

    fn into_run(self) -> Result<WorkflowRun> {
        let status = RunStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse workflow run status")?;
        Ok(WorkflowRun {
            id: self.id,
            project_id: self.project_id,
            prompt: self.prompt,
            status,
            attempts: self.attempts.max(0) as u32,
            error: self.error,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn files(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_create_database_and_run_migrations() -> Result<()> {
        let db = StoreDb::new_in_memory()?;
        let table_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN
             ('projects', 'messages', 'fragments', 'workflow_runs', 'workflow_steps')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(table_count, 5);
        Ok(())
    }

    #[test]
    fn test_migrations_are_idempotent() -> Result<()> {
        let db = StoreDb::new_in_memory()?;
        db.run_migrations()?;
        db.run_migrations()?;
        Ok(())
    }

    #[test]
    fn test_create_and_get_project() -> Result<()> {
        let db = StoreDb::new_in_memory()?;
        let project = db.create_project("todo-app")?;
        assert_eq!(project.name, "todo-app");
        assert_eq!(project.id.len(), 36);

        let fetched = db.get_project(&project.id)?.expect("project should exist");
        assert_eq!(fetched.name, "todo-app");
        assert!(db.get_project("missing")?.is_none());
        Ok(())
    }

    #[test]
    fn test_result_message_with_fragment() -> Result<()> {
        let db = StoreDb::new_in_memory()?;
        let project = db.create_project("p")?;
        let fragment = NewFragment {
            sandbox_url: "https://3000-sbx.sandbox.local".into(),
            title: "Landing Page".into(),
            files: files(&[("app/page.tsx", "export default 1")]),
        };
        let msg = db.create_message(
            &project.id,
            "Built it.",
            MessageRole::Assistant,
            MessageType::Result,
            Some(&fragment),
        )?;

        assert_eq!(msg.message_type, MessageType::Result);
        let frag = msg.fragment.expect("fragment should be attached");
        assert_eq!(frag.message_id, msg.id);
        assert_eq!(frag.title, "Landing Page");
        assert_eq!(frag.files.get("app/page.tsx").unwrap(), "export default 1");
        Ok(())
    }

    #[test]
    fn test_error_message_has_no_fragment() -> Result<()> {
        let db = StoreDb::new_in_memory()?;
        let project = db.create_project("p")?;
        let msg = db.create_message(
            &project.id,
            "Something went wrong. Please try again.",
            MessageRole::Assistant,
            MessageType::Error,
            None,
        )?;
        assert!(msg.fragment.is_none());
        assert_eq!(db.assistant_messages(&project.id)?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_message_for_unknown_project_fails() -> Result<()> {
        let db = StoreDb::new_in_memory()?;
        let result = db.create_message(
            "nope",
            "hi",
            MessageRole::User,
            MessageType::Result,
            None,
        );
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn test_recent_messages_window_is_oldest_first() -> Result<()> {
        let db = StoreDb::new_in_memory()?;
        let project = db.create_project("p")?;
        // Inserted out of chronological order on purpose.
        let stamps = [
            "2026-01-01T00:00:05.000Z",
            "2026-01-01T00:00:01.000Z",
            "2026-01-01T00:00:07.000Z",
            "2026-01-01T00:00:03.000Z",
            "2026-01-01T00:00:02.000Z",
            "2026-01-01T00:00:06.000Z",
            "2026-01-01T00:00:04.000Z",
        ];
        for stamp in stamps {
            db.create_message_at(
                &project.id,
                stamp,
                MessageRole::User,
                MessageType::Result,
                None,
                stamp,
            )?;
        }

        let recent = db.recent_messages(&project.id, 5)?;
        let contents: Vec<&str> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(
            contents,
            vec![
                "2026-01-01T00:00:03.000Z",
                "2026-01-01T00:00:04.000Z",
                "2026-01-01T00:00:05.000Z",
                "2026-01-01T00:00:06.000Z",
                "2026-01-01T00:00:07.000Z",
            ]
        );
        Ok(())
    }

    #[test]
    fn test_recent_messages_fewer_than_window() -> Result<()> {
        let db = StoreDb::new_in_memory()?;
        let project = db.create_project("p")?;
        db.create_message(&project.id, "one", MessageRole::User, MessageType::Result, None)?;
        db.create_message(&project.id, "two", MessageRole::User, MessageType::Result, None)?;
        let recent = db.recent_messages(&project.id, 5)?;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].content, "one");
        assert_eq!(recent[1].content, "two");
        Ok(())
    }

    #[test]
    fn test_run_lifecycle() -> Result<()> {
        let db = StoreDb::new_in_memory()?;
        let project = db.create_project("p")?;
        let run = db.create_run("run-1", &project.id, "make a page")?;
        assert_eq!(run.status, RunStatus::Queued);
        assert_eq!(run.attempts, 0);

        let run = db.start_run_attempt("run-1")?;
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.attempts, 1);
        assert_eq!(db.unfinished_runs()?.len(), 1);

        let run = db.update_run_status("run-1", RunStatus::Failed, Some("boom"))?;
        assert_eq!(run.error.as_deref(), Some("boom"));
        assert!(run.completed_at.is_some());
        assert!(db.unfinished_runs()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_record_step_first_write_wins() -> Result<()> {
        let db = StoreDb::new_in_memory()?;
        let project = db.create_project("p")?;
        db.create_run("run-1", &project.id, "x")?;

        assert!(db.step_output("run-1", "create-sandbox")?.is_none());
        db.record_step("run-1", "create-sandbox", "\"sbx-1\"")?;
        db.record_step("run-1", "create-sandbox", "\"sbx-2\"")?;
        assert_eq!(
            db.step_output("run-1", "create-sandbox")?.as_deref(),
            Some("\"sbx-1\"")
        );
        assert_eq!(db.step_keys("run-1")?, vec!["create-sandbox".to_string()]);
        Ok(())
    }

    #[test]
    fn test_terminal_message_commits_with_step_row() -> Result<()> {
        let db = StoreDb::new_in_memory()?;
        let project = db.create_project("p")?;
        db.create_run("run-1", &project.id, "x")?;
        let fragment = NewFragment {
            sandbox_url: "https://3000-sbx1.sandbox.test".into(),
            title: "Page".into(),
            files: files(&[("index.html", "<h1/>")]),
        };

        let message = db.create_terminal_message(
            "run-1",
            "save-result",
            &project.id,
            "Done",
            MessageType::Result,
            Some(&fragment),
        )?;
        assert_eq!(message.role, MessageRole::Assistant);
        assert_eq!(
            db.step_output("run-1", "save-result")?,
            Some(message.id.to_string())
        );

        let (key, recorded) = db.terminal_record("run-1")?.unwrap();
        assert_eq!(key, "save-result");
        assert_eq!(recorded.id, message.id);
        assert!(recorded.fragment.is_some());
        Ok(())
    }

    #[test]
    fn test_terminal_message_is_written_once() -> Result<()> {
        let db = StoreDb::new_in_memory()?;
        let project = db.create_project("p")?;
        db.create_run("run-1", &project.id, "x")?;

        let write = |key: &str, content: &str, message_type| {
            db.create_terminal_message("run-1", key, &project.id, content, message_type, None)
        };
        let first = write("save-error", "boom", MessageType::Error)?;
        let again = write("save-error", "boom", MessageType::Error)?;
        assert_eq!(first.id, again.id);

        let err = write("save-result", "ok", MessageType::Result).unwrap_err();
        assert!(err.to_string().contains("already ended with step 'save-error'"));

        assert_eq!(db.assistant_messages(&project.id)?.len(), 1);
        assert!(db.step_output("run-1", "save-result")?.is_none());
        Ok(())
    }

    #[test]
    fn test_terminal_record_absent_for_open_run() -> Result<()> {
        let db = StoreDb::new_in_memory()?;
        let project = db.create_project("p")?;
        db.create_run("run-1", &project.id, "x")?;
        db.record_step("run-1", "create-sandbox", "\"sbx1\"")?;
        assert!(db.terminal_record("run-1")?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_db_handle_call() -> Result<()> {
        let handle = DbHandle::new(StoreDb::new_in_memory()?);
        let project = handle.call(|db| db.create_project("async")).await?;
        let id = project.id.clone();
        let fetched = handle.call(move |db| db.get_project(&id)).await?;
        assert_eq!(fetched.map(|p| p.name).as_deref(), Some("async"));
        Ok(())
    }
}
