// Relay core: decides buffer-vs-forward per message, drives run streams and recovers broken threads.
pub mod buffer;
pub mod content;
pub mod context;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod functions;
pub mod migration;
pub mod resolver;

use crate::assistant::AssistantBackend;
use crate::channels::messenger::DEFAULT_MAX_TEXT_CHARS;
use crate::channels::OutboundDelivery;
use crate::config::{Config, ReplyTexts};
use crate::storage::StorageBackend;
use std::sync::Arc;

pub use buffer::{chunk_parts, BufferKey, MemoryPendingBuffer, PendingBuffer, RedisPendingBuffer};
pub use content::{decompose, ContentPart, Decomposed};
pub use context::ConversationContext;
pub use coordinator::{RunCoordinator, RunState};
pub use dispatcher::{DispatchOutcome, EventDispatcher, FollowUp};
pub use error::{MigrationError, MigrationFailure, RelayError};
pub use functions::{build_default_function_registry, FunctionHandler, FunctionRegistry};
pub use migration::ThreadMigration;
pub use resolver::ConversationResolver;

const DEFAULT_MIGRATION_HISTORY_LIMIT: usize = 100;

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub max_parts_per_message: usize,
    pub migration_history_limit: usize,
    pub max_migration_depth: u32,
    pub serialize_conversations: bool,
    pub send_sender_actions: bool,
    pub max_text_chars: usize,
    pub replies: ReplyTexts,
}

impl RelaySettings {
    pub fn from_config(config: &Config) -> Self {
        let relay = &config.relay;
        Self {
            max_parts_per_message: non_zero(
                relay.max_parts_per_message,
                buffer::MAX_PARTS_PER_SUBMISSION,
            ),
            migration_history_limit: non_zero(
                relay.migration_history_limit,
                DEFAULT_MIGRATION_HISTORY_LIMIT,
            ),
            max_migration_depth: relay.max_migration_depth,
            serialize_conversations: relay.serialize_conversations,
            send_sender_actions: config.messenger.send_sender_actions,
            max_text_chars: non_zero(config.messenger.max_text_chars, DEFAULT_MAX_TEXT_CHARS),
            replies: config.messenger.replies.clone(),
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

fn non_zero(value: usize, fallback: usize) -> usize {
    if value == 0 {
        fallback
    } else {
        value
    }
}

/// Collaborators shared by the coordinator, dispatcher and migration.
pub struct RelayDeps {
    pub storage: Arc<dyn StorageBackend>,
    pub backend: Arc<dyn AssistantBackend>,
    pub buffer: Arc<dyn PendingBuffer>,
    pub delivery: Arc<dyn OutboundDelivery>,
    pub functions: FunctionRegistry,
    pub settings: RelaySettings,
}
