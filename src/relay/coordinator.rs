// Run coordinator: buffer-or-forward per inbound message, then pump the run stream.
use crate::assistant::{is_active_run_error, NewMessage, Run, RunEvent, RunEventStream, RunStatus};
use crate::channels::{AttachmentKind, InboundMessage, SenderAction};
use crate::relay::buffer::chunk_parts;
use crate::relay::content::{decompose, ContentPart, Decomposed};
use crate::relay::context::ConversationContext;
use crate::relay::dispatcher::{DispatchOutcome, EventDispatcher, FollowUp};
use crate::relay::error::RelayError;
use crate::relay::migration::ThreadMigration;
use crate::relay::resolver::ConversationResolver;
use crate::relay::RelayDeps;
use crate::storage::ConversationKey;
use anyhow::Result;
use dashmap::DashMap;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// Run state of a thread, derived from a single lookup and never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    NoRun,
    Active { run_id: String, status: RunStatus },
    Terminal { run_id: String, status: RunStatus },
}

impl RunState {
    pub fn classify(run: Option<&Run>) -> Self {
        match run {
            None => RunState::NoRun,
            Some(run) if run.status.is_terminal() => RunState::Terminal {
                run_id: run.id.clone(),
                status: run.status,
            },
            Some(run) => RunState::Active {
                run_id: run.id.clone(),
                status: run.status,
            },
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, RunState::Active { .. })
    }
}

pub struct RunCoordinator {
    deps: Arc<RelayDeps>,
    resolver: Arc<ConversationResolver>,
    dispatcher: EventDispatcher,
    locks: DashMap<ConversationKey, Arc<Mutex<()>>>,
}

impl RunCoordinator {
    pub fn new(deps: RelayDeps) -> Self {
        let deps = Arc::new(deps);
        let resolver = Arc::new(ConversationResolver::new(
            deps.storage.clone(),
            deps.backend.clone(),
        ));
        let migration = ThreadMigration::new(deps.clone(), resolver.clone());
        let dispatcher = EventDispatcher::new(deps.clone(), migration);
        Self {
            deps,
            resolver,
            dispatcher,
            locks: DashMap::new(),
        }
    }

    pub fn resolver(&self) -> &ConversationResolver {
        &self.resolver
    }

    /// Handles one inbound message end to end, including every stream it starts.
    /// Errors are store or binding failures; the queue decides on redelivery.
    pub async fn handle_inbound(&self, message: &InboundMessage) -> Result<()> {
        let binding = self.resolver.page_binding(&message.page_id).await?;
        let decomposed = decompose(message);
        if decomposed.parts.is_empty() {
            if decomposed.has_rejected() {
                self.send_rejection_notice(&binding.access_token, message, &decomposed)
                    .await;
            }
            return Ok(());
        }

        // Every fallible step runs before the first outbound call, so a
        // redelivered job never repeats a notice or a sender action.
        let key = ConversationKey::new(&message.sender_id, &message.page_id);
        let thread_id = self.resolver.resolve(&key, &binding.assistant_id).await?;
        let context = ConversationContext {
            user_channel_id: message.sender_id.clone(),
            channel_page_id: message.page_id.clone(),
            access_token: binding.access_token.clone(),
            thread_id,
            assistant_id: binding.assistant_id.clone(),
            migration_depth: 0,
        };
        let forwarded = {
            let _guard = self.lock_conversation(&key).await;
            self.forward_or_buffer(&context, decomposed.parts.clone()).await
        };
        self.release_lock(&key);
        let stream = forwarded?;

        if decomposed.has_rejected() {
            self.send_rejection_notice(&binding.access_token, message, &decomposed)
                .await;
        }
        if self.deps.settings.send_sender_actions {
            self.send_sender_actions(&binding.access_token, &message.sender_id)
                .await;
        }
        if let Some(stream) = stream {
            self.pump(FollowUp { context, stream }).await;
        }
        Ok(())
    }

    async fn send_rejection_notice(
        &self,
        access_token: &str,
        message: &InboundMessage,
        decomposed: &Decomposed,
    ) {
        let kinds: Vec<&str> = decomposed
            .rejected
            .iter()
            .map(AttachmentKind::as_str)
            .collect();
        info!(
            "unsupported attachment rejected: sender={}, page_id={}, kinds={}",
            message.sender_id,
            message.page_id,
            kinds.join(",")
        );
        if let Err(err) = self
            .deps
            .delivery
            .send_text(
                access_token,
                &message.sender_id,
                &self.deps.settings.replies.unsupported_attachment,
            )
            .await
        {
            warn!(
                "send attachment notice failed: recipient={}, error={err}",
                message.sender_id
            );
        }
    }

    async fn send_sender_actions(&self, access_token: &str, recipient_id: &str) {
        for action in [SenderAction::MarkSeen, SenderAction::TypingOn] {
            if let Err(err) = self
                .deps
                .delivery
                .send_action(access_token, recipient_id, action)
                .await
            {
                warn!(
                    "sender action failed: action={}, recipient={recipient_id}, error={err}",
                    action.as_str()
                );
            }
        }
    }

    async fn lock_conversation(&self, key: &ConversationKey) -> Option<OwnedMutexGuard<()>> {
        if !self.deps.settings.serialize_conversations {
            return None;
        }
        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        Some(lock.lock_owned().await)
    }

    fn release_lock(&self, key: &ConversationKey) {
        self.locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    async fn run_state(&self, thread_id: &str) -> RunState {
        match self.deps.backend.latest_run(thread_id).await {
            Ok(run) => RunState::classify(run.as_ref()),
            Err(err) => {
                warn!("run lookup failed, treating as no run: thread_id={thread_id}, error={err}");
                RunState::NoRun
            }
        }
    }

    async fn forward_or_buffer(
        &self,
        context: &ConversationContext,
        parts: Vec<ContentPart>,
    ) -> Result<Option<RunEventStream>> {
        let state = self.run_state(&context.thread_id).await;
        let buffer_key = context.buffer_key();
        if let RunState::Active { run_id, status } = &state {
            self.deps
                .buffer
                .append(&buffer_key, &parts)
                .await
                .map_err(|err| {
                    RelayError::buffer_unavailable(format!("append to {buffer_key}: {err}"))
                })?;
            info!(
                "run active, message buffered: thread_id={}, run_id={run_id}, status={status:?}, parts={}",
                context.thread_id,
                parts.len()
            );
            return Ok(None);
        }
        let mut combined = self
            .deps
            .buffer
            .drain_all(&buffer_key)
            .await
            .map_err(|err| RelayError::buffer_unavailable(format!("drain {buffer_key}: {err}")))?;
        combined.extend(parts);
        debug!(
            "forwarding to thread: thread_id={}, state={state:?}, parts={}",
            context.thread_id,
            combined.len()
        );
        Ok(self.submit_and_stream(context, combined).await)
    }

    /// Drains what accumulated during the last run and starts a follow-up run for it.
    /// Drain failures leave the parts in place for the next inbound message.
    async fn flush(&self, context: &ConversationContext) -> Option<RunEventStream> {
        let key = context.conversation_key();
        let stream = {
            let _guard = self.lock_conversation(&key).await;
            match self.deps.buffer.drain_all(&context.buffer_key()).await {
                Ok(parts) if parts.is_empty() => None,
                Ok(parts) => {
                    info!(
                        "flushing buffered parts: thread_id={}, parts={}",
                        context.thread_id,
                        parts.len()
                    );
                    self.submit_and_stream(context, parts).await
                }
                Err(err) => {
                    warn!("drain buffer failed: key={}, error={err}", context.buffer_key());
                    None
                }
            }
        };
        self.release_lock(&key);
        stream
    }

    async fn submit_and_stream(
        &self,
        context: &ConversationContext,
        parts: Vec<ContentPart>,
    ) -> Option<RunEventStream> {
        let backend = &self.deps.backend;
        let chunks = chunk_parts(parts, self.deps.settings.max_parts_per_message);
        for (index, chunk) in chunks.iter().enumerate() {
            if let Err(err) = backend
                .create_message(&context.thread_id, &NewMessage::user(chunk.clone()))
                .await
            {
                let unsent = chunks[index..].concat();
                return self.on_submit_failure(context, unsent, err).await;
            }
        }
        match backend
            .stream_run(&context.thread_id, &context.assistant_id)
            .await
        {
            Ok(stream) => Some(stream),
            Err(err) => self.on_submit_failure(context, Vec::new(), err).await,
        }
    }

    /// A concurrent run only rebuffers; anything else is routed to recovery as an `error` event.
    /// Unsent parts go back to the head of the buffer so they stay ahead of newer ones.
    async fn on_submit_failure(
        &self,
        context: &ConversationContext,
        unsent: Vec<ContentPart>,
        err: anyhow::Error,
    ) -> Option<RunEventStream> {
        if !unsent.is_empty() {
            if let Err(append_err) = self.deps.buffer.prepend(&context.buffer_key(), &unsent).await {
                warn!(
                    "rebuffer failed, parts dropped: key={}, parts={}, error={append_err}",
                    context.buffer_key(),
                    unsent.len()
                );
            }
        }
        if is_active_run_error(&err) {
            info!(
                "thread busy, parts kept for the active run: thread_id={}, parts={}",
                context.thread_id,
                unsent.len()
            );
            return None;
        }
        warn!("run start failed: thread_id={}, error={err}", context.thread_id);
        Some(FollowUp::failed(context.clone(), &err).stream)
    }

    /// Consumes streams for one conversation until no follow-up remains. Whenever
    /// the last stream ends, parts buffered at any point during it are flushed.
    pub async fn pump(&self, initial: FollowUp) {
        let mut queue = VecDeque::from([initial]);
        let mut last_ended: Option<ConversationContext> = None;
        loop {
            let Some(FollowUp {
                context,
                mut stream,
            }) = queue.pop_front()
            else {
                let Some(flush_context) = last_ended.take() else {
                    break;
                };
                if let Some(stream) = self.flush(&flush_context).await {
                    queue.push_back(FollowUp {
                        context: flush_context,
                        stream,
                    });
                }
                continue;
            };
            let mut abandoned = false;
            while let Some(item) = stream.next().await {
                let event = match item {
                    Ok(event) => event,
                    Err(err) => {
                        warn!("run stream broke: thread_id={}, error={err}", context.thread_id);
                        RunEvent::transport_error(err.to_string())
                    }
                };
                match self.dispatcher.dispatch(event, &context).await {
                    DispatchOutcome::Continue => {}
                    DispatchOutcome::ReplyDeferred => {
                        debug!("reply deferred until flush: thread_id={}", context.thread_id)
                    }
                    DispatchOutcome::Resume(next) => queue.push_back(next),
                    DispatchOutcome::Abandoned => abandoned = true,
                }
            }
            // A reset conversation has no thread left to flush onto.
            last_ended = if abandoned { None } else { Some(context) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(status: &str) -> Run {
        serde_json::from_value(json!({"id": "run_1", "thread_id": "t", "status": status})).unwrap()
    }

    #[test]
    fn classify_run_states() {
        assert_eq!(RunState::classify(None), RunState::NoRun);
        assert!(RunState::classify(Some(&run("requires_action"))).is_active());
        assert!(RunState::classify(Some(&run("cancelling"))).is_active());
        assert_eq!(
            RunState::classify(Some(&run("expired"))),
            RunState::Terminal {
                run_id: "run_1".to_string(),
                status: RunStatus::Expired
            }
        );
    }
}
