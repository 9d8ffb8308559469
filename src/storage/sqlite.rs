// SQLite storage: conversation links, page bindings and expense rows in one file.
use crate::storage::{
    fold_conversation_rows, now_ts, AssistantExpenseRecord, ConversationKey, ConversationRecord,
    PageBindingRecord, StorageBackend,
};
use anyhow::Result;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub struct SqliteStorage {
    db_path: PathBuf,
    initialized: AtomicBool,
    init_guard: Mutex<()>,
}

impl SqliteStorage {
    pub fn new(db_path: String) -> Self {
        let path = if db_path.trim().is_empty() {
            PathBuf::from("./data/pagebot.db")
        } else {
            PathBuf::from(db_path)
        };
        Self {
            db_path: path,
            initialized: AtomicBool::new(false),
            init_guard: Mutex::new(()),
        }
    }

    fn ensure_db_dir(&self) -> Result<()> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    fn open(&self) -> Result<Connection> {
        self.ensure_db_dir()?;
        let conn = Connection::open(&self.db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }
}

impl StorageBackend for SqliteStorage {
    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.init_guard.lock();
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let conn = self.open()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS page_bindings (
              page_id TEXT PRIMARY KEY,
              assistant_id TEXT NOT NULL,
              access_token TEXT NOT NULL,
              active INTEGER NOT NULL DEFAULT 1,
              updated_time REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS conversation_threads (
              page_scoped_id TEXT NOT NULL,
              page_id TEXT NOT NULL,
              assistant_id TEXT NOT NULL,
              thread_id TEXT NOT NULL,
              created_time REAL NOT NULL,
              updated_time REAL NOT NULL,
              PRIMARY KEY (page_scoped_id, page_id, assistant_id)
            );
            CREATE INDEX IF NOT EXISTS idx_conversation_threads_thread
              ON conversation_threads (thread_id);
            CREATE TABLE IF NOT EXISTS assistant_expenses (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              assistant_id TEXT NOT NULL,
              run_id TEXT NOT NULL,
              input_tokens INTEGER NOT NULL,
              output_tokens INTEGER NOT NULL,
              created_time REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_assistant_expenses_assistant
              ON assistant_expenses (assistant_id, created_time);
            "#,
        )?;
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn get_page_binding(&self, page_id: &str) -> Result<Option<PageBindingRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let record = conn
            .query_row(
                "SELECT page_id, assistant_id, access_token, active, updated_time \
                 FROM page_bindings WHERE page_id = ?",
                params![page_id],
                |row| {
                    Ok(PageBindingRecord {
                        page_id: row.get(0)?,
                        assistant_id: row.get(1)?,
                        access_token: row.get(2)?,
                        active: row.get::<_, i64>(3)? != 0,
                        updated_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn upsert_page_binding(&self, record: &PageBindingRecord) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO page_bindings (page_id, assistant_id, access_token, active, updated_time) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(page_id) DO UPDATE SET assistant_id = excluded.assistant_id, \
             access_token = excluded.access_token, active = excluded.active, \
             updated_time = excluded.updated_time",
            params![
                record.page_id,
                record.assistant_id,
                record.access_token,
                if record.active { 1 } else { 0 },
                now_ts()
            ],
        )?;
        Ok(())
    }

    fn get_conversation(&self, key: &ConversationKey) -> Result<Option<ConversationRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT assistant_id, thread_id, updated_time FROM conversation_threads \
             WHERE page_scoped_id = ? AND page_id = ?",
        )?;
        let rows = stmt
            .query_map(params![key.page_scoped_id, key.page_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(fold_conversation_rows(key, rows))
    }

    fn link_conversation(
        &self,
        key: &ConversationKey,
        assistant_id: &str,
        thread_id: &str,
    ) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let now = now_ts();
        conn.execute(
            "INSERT INTO conversation_threads \
             (page_scoped_id, page_id, assistant_id, thread_id, created_time, updated_time) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(page_scoped_id, page_id, assistant_id) DO UPDATE SET \
             thread_id = excluded.thread_id, updated_time = excluded.updated_time",
            params![
                key.page_scoped_id,
                key.page_id,
                assistant_id,
                thread_id,
                now,
                now
            ],
        )?;
        Ok(())
    }

    fn replace_conversation_thread(
        &self,
        key: &ConversationKey,
        assistant_id: &str,
        thread_id: &str,
    ) -> Result<()> {
        self.ensure_initialized()?;
        let mut conn = self.open()?;
        let now = now_ts();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "UPDATE conversation_threads SET thread_id = ?, updated_time = ? \
             WHERE page_scoped_id = ? AND page_id = ?",
            params![thread_id, now, key.page_scoped_id, key.page_id],
        )?;
        tx.execute(
            "INSERT INTO conversation_threads \
             (page_scoped_id, page_id, assistant_id, thread_id, created_time, updated_time) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(page_scoped_id, page_id, assistant_id) DO NOTHING",
            params![
                key.page_scoped_id,
                key.page_id,
                assistant_id,
                thread_id,
                now,
                now
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn delete_conversation(&self, key: &ConversationKey) -> Result<usize> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let affected = conn.execute(
            "DELETE FROM conversation_threads WHERE page_scoped_id = ? AND page_id = ?",
            params![key.page_scoped_id, key.page_id],
        )?;
        Ok(affected)
    }

    fn insert_assistant_expense(&self, record: &AssistantExpenseRecord) -> Result<i64> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO assistant_expenses \
             (assistant_id, run_id, input_tokens, output_tokens, created_time) \
             VALUES (?, ?, ?, ?, ?)",
            params![
                record.assistant_id,
                record.run_id,
                record.input_tokens,
                record.output_tokens,
                record.created_at
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }
}
