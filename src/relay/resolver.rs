// Conversation resolver: maps (user, page) to its assistant thread and page bindings.
use crate::assistant::AssistantBackend;
use crate::relay::error::RelayError;
use crate::storage::{ConversationKey, PageBindingRecord, StorageBackend};
use anyhow::{anyhow, Result};
use std::sync::Arc;
use tracing::info;

pub struct ConversationResolver {
    storage: Arc<dyn StorageBackend>,
    backend: Arc<dyn AssistantBackend>,
}

impl ConversationResolver {
    pub fn new(storage: Arc<dyn StorageBackend>, backend: Arc<dyn AssistantBackend>) -> Self {
        Self { storage, backend }
    }

    async fn with_storage<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn StorageBackend) -> Result<T> + Send + 'static,
    {
        let storage = self.storage.clone();
        tokio::task::spawn_blocking(move || f(storage.as_ref()))
            .await
            .map_err(|err| anyhow!("storage task failed: {err}"))?
    }

    pub async fn page_binding(&self, page_id: &str) -> Result<PageBindingRecord> {
        let page = page_id.to_string();
        let binding = self
            .with_storage(move |storage| storage.get_page_binding(&page))
            .await
            .map_err(|err| RelayError::resolution(format!("load page binding: {err}")))?;
        match binding {
            Some(binding) if binding.active => Ok(binding),
            _ => Err(RelayError::page_not_bound(page_id).into()),
        }
    }

    /// Returns the thread for the key, creating it or recording the assistant link
    /// when needed. Repeated calls with an already linked assistant write nothing.
    pub async fn resolve(&self, key: &ConversationKey, assistant_id: &str) -> Result<String> {
        let lookup = key.clone();
        let record = self
            .with_storage(move |storage| storage.get_conversation(&lookup))
            .await
            .map_err(|err| RelayError::resolution(format!("load conversation {key}: {err}")))?;

        let thread_id = match record {
            Some(record) if record.is_linked(assistant_id) => return Ok(record.thread_id),
            Some(record) => {
                info!(
                    "linking assistant to existing thread: conversation={key}, assistant_id={assistant_id}, thread_id={}",
                    record.thread_id
                );
                record.thread_id
            }
            None => {
                let thread_id = self.backend.create_thread().await.map_err(|err| {
                    RelayError::resolution(format!("create thread for {key}: {err}"))
                })?;
                info!("thread created: conversation={key}, thread_id={thread_id}");
                thread_id
            }
        };

        let link_key = key.clone();
        let assistant = assistant_id.to_string();
        let thread = thread_id.clone();
        self.with_storage(move |storage| storage.link_conversation(&link_key, &assistant, &thread))
            .await
            .map_err(|err| RelayError::resolution(format!("link conversation {key}: {err}")))?;
        Ok(thread_id)
    }

    pub async fn replace_thread(
        &self,
        key: &ConversationKey,
        assistant_id: &str,
        thread_id: &str,
    ) -> Result<()> {
        let key = key.clone();
        let assistant = assistant_id.to_string();
        let thread = thread_id.to_string();
        self.with_storage(move |storage| {
            storage.replace_conversation_thread(&key, &assistant, &thread)
        })
        .await
    }

    pub async fn reset(&self, key: &ConversationKey) -> Result<usize> {
        let key = key.clone();
        self.with_storage(move |storage| storage.delete_conversation(&key))
            .await
    }
}
