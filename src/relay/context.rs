use crate::relay::buffer::BufferKey;
use crate::storage::ConversationKey;

/// Everything a handler needs to act on one conversation's run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationContext {
    pub user_channel_id: String,
    pub channel_page_id: String,
    pub access_token: String,
    pub thread_id: String,
    pub assistant_id: String,
    /// Number of migrations that led to this context.
    pub migration_depth: u32,
}

impl ConversationContext {
    pub fn conversation_key(&self) -> ConversationKey {
        ConversationKey::new(&self.user_channel_id, &self.channel_page_id)
    }

    pub fn buffer_key(&self) -> BufferKey {
        BufferKey::new(&self.thread_id, &self.user_channel_id)
    }

    pub fn migrated_to(&self, thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            migration_depth: self.migration_depth + 1,
            ..self.clone()
        }
    }
}
