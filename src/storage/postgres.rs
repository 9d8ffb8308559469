// Postgres storage: same tables as SQLite, shared by every worker process.
use crate::storage::{
    fold_conversation_rows, now_ts, AssistantExpenseRecord, ConversationKey, ConversationRecord,
    PageBindingRecord, StorageBackend,
};
use anyhow::{anyhow, Result};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_postgres::types::ToSql;
use tokio_postgres::NoTls;

const DEFAULT_POOL_SIZE: usize = 16;

pub struct PostgresStorage {
    pool: Pool,
    initialized: AtomicBool,
    init_guard: Mutex<()>,
    fallback_runtime: tokio::runtime::Runtime,
}

struct PgConn<'a> {
    storage: &'a PostgresStorage,
    client: deadpool_postgres::Client,
}

impl PgConn<'_> {
    fn batch_execute(&mut self, query: &str) -> Result<()> {
        self.storage.block_on(self.client.batch_execute(query))??;
        Ok(())
    }

    fn execute(&mut self, query: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64> {
        Ok(self
            .storage
            .block_on(self.client.execute(query, params))??)
    }

    fn query(
        &mut self,
        query: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<tokio_postgres::Row>> {
        Ok(self.storage.block_on(self.client.query(query, params))??)
    }

    fn query_opt(
        &mut self,
        query: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Option<tokio_postgres::Row>> {
        Ok(self
            .storage
            .block_on(self.client.query_opt(query, params))??)
    }

    fn query_one(
        &mut self,
        query: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<tokio_postgres::Row> {
        Ok(self
            .storage
            .block_on(self.client.query_one(query, params))??)
    }

    fn transaction<'a>(&'a mut self) -> Result<PgTx<'a>> {
        let tx = self.storage.block_on(self.client.transaction())??;
        Ok(PgTx {
            storage: self.storage,
            tx,
        })
    }
}

struct PgTx<'a> {
    storage: &'a PostgresStorage,
    tx: deadpool_postgres::Transaction<'a>,
}

impl PgTx<'_> {
    fn execute(&mut self, query: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64> {
        Ok(self.storage.block_on(self.tx.execute(query, params))??)
    }

    fn commit(self) -> Result<()> {
        self.storage.block_on(self.tx.commit())??;
        Ok(())
    }
}

impl PostgresStorage {
    pub fn new(dsn: String, connect_timeout_s: u64, pool_size: usize) -> Result<Self> {
        let cleaned = dsn.trim().to_string();
        if cleaned.is_empty() {
            return Err(anyhow!("postgres dsn is empty"));
        }
        let timeout = Duration::from_secs(connect_timeout_s.max(1));
        let mut config = cleaned.parse::<tokio_postgres::Config>()?;
        config.connect_timeout(timeout);
        let manager_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let manager = Manager::from_config(config, NoTls, manager_config);
        let max_size = if pool_size == 0 {
            DEFAULT_POOL_SIZE
        } else {
            pool_size
        };
        let pool = Pool::builder(manager).max_size(max_size).build()?;
        let fallback_runtime = tokio::runtime::Runtime::new()
            .map_err(|err| anyhow!("create tokio runtime for postgres: {err}"))?;
        Ok(Self {
            pool,
            initialized: AtomicBool::new(false),
            init_guard: Mutex::new(()),
            fallback_runtime,
        })
    }

    fn block_on<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => Ok(tokio::task::block_in_place(|| handle.block_on(fut))),
            Err(_) => Ok(self.fallback_runtime.block_on(fut)),
        }
    }

    fn conn(&self) -> Result<PgConn<'_>> {
        let client = self.block_on(self.pool.get())??;
        Ok(PgConn {
            storage: self,
            client,
        })
    }
}

impl StorageBackend for PostgresStorage {
    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.init_guard.lock();
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let mut conn = match self.conn() {
                Ok(conn) => conn,
                Err(err) => {
                    if attempts >= 5 {
                        return Err(err);
                    }
                    std::thread::sleep(Duration::from_secs(1));
                    continue;
                }
            };
            let result = conn.batch_execute(
                r#"
                CREATE TABLE IF NOT EXISTS page_bindings (
                  page_id TEXT PRIMARY KEY,
                  assistant_id TEXT NOT NULL,
                  access_token TEXT NOT NULL,
                  active INTEGER NOT NULL DEFAULT 1,
                  updated_time DOUBLE PRECISION NOT NULL
                );
                CREATE TABLE IF NOT EXISTS conversation_threads (
                  page_scoped_id TEXT NOT NULL,
                  page_id TEXT NOT NULL,
                  assistant_id TEXT NOT NULL,
                  thread_id TEXT NOT NULL,
                  created_time DOUBLE PRECISION NOT NULL,
                  updated_time DOUBLE PRECISION NOT NULL,
                  PRIMARY KEY (page_scoped_id, page_id, assistant_id)
                );
                CREATE INDEX IF NOT EXISTS idx_conversation_threads_thread
                  ON conversation_threads (thread_id);
                CREATE TABLE IF NOT EXISTS assistant_expenses (
                  id BIGSERIAL PRIMARY KEY,
                  assistant_id TEXT NOT NULL,
                  run_id TEXT NOT NULL,
                  input_tokens BIGINT NOT NULL,
                  output_tokens BIGINT NOT NULL,
                  created_time DOUBLE PRECISION NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_assistant_expenses_assistant
                  ON assistant_expenses (assistant_id, created_time);
                "#,
            );
            match result {
                Ok(_) => {
                    self.initialized.store(true, Ordering::SeqCst);
                    return Ok(());
                }
                Err(err) => {
                    if attempts >= 5 {
                        return Err(err);
                    }
                    std::thread::sleep(Duration::from_secs(1));
                }
            }
        }
    }

    fn get_page_binding(&self, page_id: &str) -> Result<Option<PageBindingRecord>> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let row = conn.query_opt(
            "SELECT page_id, assistant_id, access_token, active, updated_time \
             FROM page_bindings WHERE page_id = $1",
            &[&page_id],
        )?;
        Ok(row.map(|row| PageBindingRecord {
            page_id: row.get(0),
            assistant_id: row.get(1),
            access_token: row.get(2),
            active: row.get::<_, i32>(3) != 0,
            updated_at: row.get(4),
        }))
    }

    fn upsert_page_binding(&self, record: &PageBindingRecord) -> Result<()> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let active: i32 = if record.active { 1 } else { 0 };
        conn.execute(
            "INSERT INTO page_bindings (page_id, assistant_id, access_token, active, updated_time) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT(page_id) DO UPDATE SET assistant_id = EXCLUDED.assistant_id, \
             access_token = EXCLUDED.access_token, active = EXCLUDED.active, \
             updated_time = EXCLUDED.updated_time",
            &[
                &record.page_id,
                &record.assistant_id,
                &record.access_token,
                &active,
                &now_ts(),
            ],
        )?;
        Ok(())
    }

    fn get_conversation(&self, key: &ConversationKey) -> Result<Option<ConversationRecord>> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let rows = conn.query(
            "SELECT assistant_id, thread_id, updated_time FROM conversation_threads \
             WHERE page_scoped_id = $1 AND page_id = $2",
            &[&key.page_scoped_id, &key.page_id],
        )?;
        let rows = rows
            .into_iter()
            .map(|row| {
                (
                    row.get::<_, String>(0),
                    row.get::<_, String>(1),
                    row.get::<_, f64>(2),
                )
            })
            .collect();
        Ok(fold_conversation_rows(key, rows))
    }

    fn link_conversation(
        &self,
        key: &ConversationKey,
        assistant_id: &str,
        thread_id: &str,
    ) -> Result<()> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let now = now_ts();
        conn.execute(
            "INSERT INTO conversation_threads \
             (page_scoped_id, page_id, assistant_id, thread_id, created_time, updated_time) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT(page_scoped_id, page_id, assistant_id) DO UPDATE SET \
             thread_id = EXCLUDED.thread_id, updated_time = EXCLUDED.updated_time",
            &[
                &key.page_scoped_id,
                &key.page_id,
                &assistant_id,
                &thread_id,
                &now,
                &now,
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
        let mut conn = self.conn()?;
        let now = now_ts();
        let mut tx = conn.transaction()?;
        tx.execute(
            "UPDATE conversation_threads SET thread_id = $1, updated_time = $2 \
             WHERE page_scoped_id = $3 AND page_id = $4",
            &[&thread_id, &now, &key.page_scoped_id, &key.page_id],
        )?;
        tx.execute(
            "INSERT INTO conversation_threads \
             (page_scoped_id, page_id, assistant_id, thread_id, created_time, updated_time) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT(page_scoped_id, page_id, assistant_id) DO NOTHING",
            &[
                &key.page_scoped_id,
                &key.page_id,
                &assistant_id,
                &thread_id,
                &now,
                &now,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn delete_conversation(&self, key: &ConversationKey) -> Result<usize> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let affected = conn.execute(
            "DELETE FROM conversation_threads WHERE page_scoped_id = $1 AND page_id = $2",
            &[&key.page_scoped_id, &key.page_id],
        )?;
        Ok(affected as usize)
    }

    fn insert_assistant_expense(&self, record: &AssistantExpenseRecord) -> Result<i64> {
        self.ensure_initialized()?;
        let mut conn = self.conn()?;
        let row = conn.query_one(
            "INSERT INTO assistant_expenses \
             (assistant_id, run_id, input_tokens, output_tokens, created_time) \
             VALUES ($1, $2, $3, $4, $5) RETURNING id",
            &[
                &record.assistant_id,
                &record.run_id,
                &record.input_tokens,
                &record.output_tokens,
                &record.created_at,
            ],
        )?;
        Ok(row.get::<_, i64>(0))
    }
}
