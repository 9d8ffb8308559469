// Thread migration: moves a conversation off a thread that reported an error.
use crate::assistant::{MessageContent, NewMessage, ThreadMessage};
use crate::relay::buffer::chunk_parts;
use crate::relay::content::ContentPart;
use crate::relay::context::ConversationContext;
use crate::relay::dispatcher::FollowUp;
use crate::relay::error::{MigrationError, MigrationFailure};
use crate::relay::resolver::ConversationResolver;
use crate::relay::RelayDeps;
use std::sync::Arc;
use tracing::{info, warn};

pub struct ThreadMigration {
    deps: Arc<RelayDeps>,
    resolver: Arc<ConversationResolver>,
}

impl ThreadMigration {
    pub fn new(deps: Arc<RelayDeps>, resolver: Arc<ConversationResolver>) -> Self {
        Self { deps, resolver }
    }

    /// Migrates, or falls back to the error reply plus a mapping reset.
    pub async fn recover(&self, context: &ConversationContext) -> Option<FollowUp> {
        match self.migrate(context).await {
            Ok(follow_up) => {
                info!(
                    "thread migrated: sender={}, page_id={}, from={}, to={}",
                    context.user_channel_id,
                    context.channel_page_id,
                    context.thread_id,
                    follow_up.context.thread_id
                );
                Some(follow_up)
            }
            Err(err) => {
                warn!(
                    "thread migration failed: sender={}, thread_id={}, failure={}, error={}",
                    context.user_channel_id,
                    context.thread_id,
                    err.failure.as_str(),
                    err.source
                );
                self.fallback(context).await;
                None
            }
        }
    }

    pub async fn migrate(&self, context: &ConversationContext) -> Result<FollowUp, MigrationError> {
        let settings = &self.deps.settings;
        if context.migration_depth >= settings.max_migration_depth {
            return Err(MigrationError::new(
                MigrationFailure::DepthExceeded,
                anyhow::anyhow!(
                    "already migrated {} time(s), limit {}",
                    context.migration_depth,
                    settings.max_migration_depth
                ),
            ));
        }
        let backend = &self.deps.backend;

        let history = backend
            .list_messages(&context.thread_id, settings.migration_history_limit)
            .await
            .map_err(|err| MigrationError::new(MigrationFailure::FetchFailed, err))?;

        let thread_id = backend
            .create_thread()
            .await
            .map_err(|err| MigrationError::new(MigrationFailure::CreateFailed, err))?;

        for message in build_replay_messages(history) {
            backend
                .create_message(&thread_id, &message)
                .await
                .map_err(|err| MigrationError::new(MigrationFailure::ReplayFailed, err))?;
        }

        let carried = match self.deps.buffer.drain_all(&context.buffer_key()).await {
            Ok(parts) => parts,
            Err(err) => {
                warn!(
                    "drain buffer during migration failed: key={}, error={err}",
                    context.buffer_key()
                );
                Vec::new()
            }
        };
        for chunk in chunk_parts(carried, settings.max_parts_per_message) {
            backend
                .create_message(&thread_id, &NewMessage::user(chunk))
                .await
                .map_err(|err| MigrationError::new(MigrationFailure::ReplayFailed, err))?;
        }

        self.resolver
            .replace_thread(&context.conversation_key(), &context.assistant_id, &thread_id)
            .await
            .map_err(|err| MigrationError::new(MigrationFailure::PersistFailed, err))?;

        let next = context.migrated_to(thread_id);
        let stream = backend
            .stream_run(&next.thread_id, &next.assistant_id)
            .await
            .map_err(|err| MigrationError::new(MigrationFailure::ResumeFailed, err))?;
        Ok(FollowUp {
            context: next,
            stream,
        })
    }

    /// Error reply, then the old buffer is discarded and the mapping removed.
    async fn fallback(&self, context: &ConversationContext) {
        if let Err(err) = self
            .deps
            .delivery
            .send_text(
                &context.access_token,
                &context.user_channel_id,
                &self.deps.settings.replies.system_error,
            )
            .await
        {
            warn!(
                "send fallback reply failed: recipient={}, error={err}",
                context.user_channel_id
            );
        }
        match self.deps.buffer.drain_all(&context.buffer_key()).await {
            Ok(parts) if !parts.is_empty() => warn!(
                "buffered parts discarded with the thread: key={}, parts={}",
                context.buffer_key(),
                parts.len()
            ),
            Ok(_) => {}
            Err(err) => warn!(
                "drain buffer during fallback failed: key={}, error={err}",
                context.buffer_key()
            ),
        }
        match self.resolver.reset(&context.conversation_key()).await {
            Ok(removed) => info!(
                "conversation reset: conversation={}, removed_links={removed}",
                context.conversation_key()
            ),
            Err(err) => warn!(
                "conversation reset failed: conversation={}, error={err}",
                context.conversation_key()
            ),
        }
    }
}

/// Turns a newest-first history page into replayable messages, oldest first.
/// Only text and image URLs survive; messages left empty are skipped.
pub fn build_replay_messages(history: Vec<ThreadMessage>) -> Vec<NewMessage> {
    history
        .into_iter()
        .rev()
        .filter_map(|message| {
            let content: Vec<ContentPart> = message
                .content
                .into_iter()
                .filter_map(|block| match block {
                    MessageContent::Text { text } => Some(ContentPart::text(text.value)),
                    MessageContent::ImageUrl { image_url } => {
                        Some(ContentPart::image(image_url.url))
                    }
                    MessageContent::ImageFile { .. }
                    | MessageContent::Refusal { .. }
                    | MessageContent::Unsupported => None,
                })
                .collect();
            if content.is_empty() {
                None
            } else {
                Some(NewMessage {
                    role: message.role,
                    content,
                })
            }
        })
        .collect()
}
