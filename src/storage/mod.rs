// Storage: conversation-to-thread mapping, page bindings and usage accounting.
// SQLite for single-node deployments and tests, Postgres when several workers share state.

mod postgres;
mod sqlite;

use crate::config::StorageConfig;
use anyhow::{anyhow, Result};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

pub use postgres::PostgresStorage;
pub use sqlite::SqliteStorage;

/// One end-user-to-page relationship, `(page_scoped_id, page_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationKey {
    pub page_scoped_id: String,
    pub page_id: String,
}

impl ConversationKey {
    pub fn new(page_scoped_id: impl Into<String>, page_id: impl Into<String>) -> Self {
        Self {
            page_scoped_id: page_scoped_id.into(),
            page_id: page_id.into(),
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.page_scoped_id, self.page_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRecord {
    pub key: ConversationKey,
    pub thread_id: String,
    pub linked_assistant_ids: BTreeSet<String>,
}

impl ConversationRecord {
    pub fn is_linked(&self, assistant_id: &str) -> bool {
        self.linked_assistant_ids.contains(assistant_id)
    }
}

#[derive(Debug, Clone)]
pub struct PageBindingRecord {
    pub page_id: String,
    pub assistant_id: String,
    pub access_token: String,
    pub active: bool,
    pub updated_at: f64,
}

#[derive(Debug, Clone)]
pub struct AssistantExpenseRecord {
    pub assistant_id: String,
    pub run_id: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub created_at: f64,
}

/// Conversation store contract. Implementations must be safe to share across
/// processes: every mutation is a single statement or a single transaction.
pub trait StorageBackend: Send + Sync {
    fn ensure_initialized(&self) -> Result<()>;

    fn get_page_binding(&self, page_id: &str) -> Result<Option<PageBindingRecord>>;
    fn upsert_page_binding(&self, record: &PageBindingRecord) -> Result<()>;

    fn get_conversation(&self, key: &ConversationKey) -> Result<Option<ConversationRecord>>;
    /// Records `assistant_id` as linked to `thread_id` for the key. Used both for
    /// first creation and for linking an extra assistant to an existing thread.
    fn link_conversation(
        &self,
        key: &ConversationKey,
        assistant_id: &str,
        thread_id: &str,
    ) -> Result<()>;
    /// Points every link of the key at `thread_id`; inserts a link for
    /// `assistant_id` when the key has no rows left.
    fn replace_conversation_thread(
        &self,
        key: &ConversationKey,
        assistant_id: &str,
        thread_id: &str,
    ) -> Result<()>;
    fn delete_conversation(&self, key: &ConversationKey) -> Result<usize>;

    fn insert_assistant_expense(&self, record: &AssistantExpenseRecord) -> Result<i64>;
}

pub(crate) fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Folds `(assistant_id, thread_id, updated_at)` rows into one record. Rows are
/// expected to agree on the thread; if they don't, the most recently updated wins.
pub(crate) fn fold_conversation_rows(
    key: &ConversationKey,
    rows: Vec<(String, String, f64)>,
) -> Option<ConversationRecord> {
    let mut thread: Option<(String, f64)> = None;
    let mut linked = BTreeSet::new();
    for (assistant_id, thread_id, updated_at) in rows {
        linked.insert(assistant_id);
        match &thread {
            Some((_, best)) if *best >= updated_at => {}
            _ => thread = Some((thread_id, updated_at)),
        }
    }
    let (thread_id, _) = thread?;
    Some(ConversationRecord {
        key: key.clone(),
        thread_id,
        linked_assistant_ids: linked,
    })
}

pub fn build_storage(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>> {
    let backend = config.backend.trim().to_lowercase();
    let backend = if backend.is_empty() {
        "sqlite".to_string()
    } else {
        backend
    };
    match backend.as_str() {
        "sqlite" | "default" => Ok(Arc::new(SqliteStorage::new(
            config.db_path.trim().to_string(),
        ))),
        "postgres" | "postgresql" | "pg" => Ok(Arc::new(PostgresStorage::new(
            config.postgres.dsn.clone(),
            config.postgres.connect_timeout_s,
            config.postgres.pool_size,
        )?)),
        other => Err(anyhow!("unknown storage backend: {other}")),
    }
}
