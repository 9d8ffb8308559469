// Event dispatcher: one arm per run event kind.
use crate::assistant::{MessageRole, RunEvent, RunEventKind, RunEventStream, ToolCall, ToolOutput};
use crate::channels::messenger::split_text;
use crate::relay::context::ConversationContext;
use crate::relay::migration::ThreadMigration;
use crate::relay::RelayDeps;
use crate::storage::{now_ts, AssistantExpenseRecord};
use anyhow::Result;
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// A stream the pump must consume after the current one ends.
pub struct FollowUp {
    pub context: ConversationContext,
    pub stream: RunEventStream,
}

impl FollowUp {
    /// Stream that yields a single synthetic `error` event.
    pub fn failed(context: ConversationContext, err: &anyhow::Error) -> Self {
        let event = RunEvent::transport_error(err.to_string());
        Self {
            context,
            stream: futures::stream::once(async move { Ok::<_, anyhow::Error>(event) }).boxed(),
        }
    }
}

pub enum DispatchOutcome {
    Continue,
    /// The user kept typing during generation; the reply is dropped and the
    /// buffered parts go out in the flush after this stream ends.
    ReplyDeferred,
    Resume(FollowUp),
    /// Recovery gave up and reset the conversation.
    Abandoned,
}

pub struct EventDispatcher {
    deps: Arc<RelayDeps>,
    migration: ThreadMigration,
}

impl EventDispatcher {
    pub fn new(deps: Arc<RelayDeps>, migration: ThreadMigration) -> Self {
        Self { deps, migration }
    }

    pub async fn dispatch(&self, event: RunEvent, context: &ConversationContext) -> DispatchOutcome {
        match &event.kind {
            RunEventKind::MessageCompleted => self.on_message_completed(&event, context).await,
            RunEventKind::RunRequiresAction => self.on_requires_action(&event, context).await,
            RunEventKind::RunCompleted => {
                self.on_run_completed(&event, context).await;
                DispatchOutcome::Continue
            }
            RunEventKind::RunFailed
            | RunEventKind::RunCancelled
            | RunEventKind::RunExpired
            | RunEventKind::RunIncomplete => {
                let run = event.run();
                warn!(
                    "run ended unsuccessfully: event={}, thread_id={}, run_id={}, last_error={}",
                    event.kind.as_str(),
                    context.thread_id,
                    run.as_ref().map(|run| run.id.as_str()).unwrap_or("-"),
                    run.as_ref()
                        .and_then(|run| run.last_error.as_ref())
                        .map(|value| value.to_string())
                        .unwrap_or_default()
                );
                DispatchOutcome::Continue
            }
            RunEventKind::RunCancelling
            | RunEventKind::RunStepFailed
            | RunEventKind::RunStepCancelled
            | RunEventKind::RunStepExpired
            | RunEventKind::MessageIncomplete => {
                warn!(
                    "run event: {}, thread_id={}",
                    event.kind.as_str(),
                    context.thread_id
                );
                DispatchOutcome::Continue
            }
            RunEventKind::Error => self.on_error(&event, context).await,
            RunEventKind::MessageDelta | RunEventKind::RunStepDelta => {
                trace!("run delta: {}, thread_id={}", event.kind.as_str(), context.thread_id);
                DispatchOutcome::Continue
            }
            RunEventKind::ThreadCreated
            | RunEventKind::RunCreated
            | RunEventKind::RunQueued
            | RunEventKind::RunInProgress
            | RunEventKind::RunStepCreated
            | RunEventKind::RunStepInProgress
            | RunEventKind::RunStepCompleted
            | RunEventKind::MessageCreated
            | RunEventKind::MessageInProgress
            | RunEventKind::Done => {
                debug!("run event: {}, thread_id={}", event.kind.as_str(), context.thread_id);
                DispatchOutcome::Continue
            }
            RunEventKind::Unknown(name) => {
                warn!("unhandled run event dropped: name={name}, thread_id={}", context.thread_id);
                DispatchOutcome::Continue
            }
        }
    }

    async fn on_message_completed(
        &self,
        event: &RunEvent,
        context: &ConversationContext,
    ) -> DispatchOutcome {
        let Some(message) = event.message() else {
            warn!("message.completed without a message body: thread_id={}", context.thread_id);
            return DispatchOutcome::Continue;
        };
        if message.role != MessageRole::Assistant {
            return DispatchOutcome::Continue;
        }
        match self.deps.buffer.pending_len(&context.buffer_key()).await {
            Ok(pending) if pending > 0 => {
                info!(
                    "reply deferred, user sent more while generating: thread_id={}, pending={pending}",
                    context.thread_id
                );
                return DispatchOutcome::ReplyDeferred;
            }
            Ok(_) => {}
            Err(err) => warn!("buffer length check failed: key={}, error={err}", context.buffer_key()),
        }
        let text = message.text();
        if text.trim().is_empty() {
            return DispatchOutcome::Continue;
        }
        for part in split_text(&text, self.deps.settings.max_text_chars) {
            if let Err(err) = self
                .deps
                .delivery
                .send_text(&context.access_token, &context.user_channel_id, &part)
                .await
            {
                warn!(
                    "send reply failed: recipient={}, error={err}",
                    context.user_channel_id
                );
                break;
            }
        }
        DispatchOutcome::Continue
    }

    async fn on_requires_action(
        &self,
        event: &RunEvent,
        context: &ConversationContext,
    ) -> DispatchOutcome {
        let Some(run) = event.run() else {
            warn!("requires_action without a run body: thread_id={}", context.thread_id);
            return DispatchOutcome::Continue;
        };
        let mut outputs = Vec::with_capacity(run.tool_calls().len());
        for call in run.tool_calls() {
            let output = self.invoke_tool_call(call, context).await;
            outputs.push(ToolOutput {
                tool_call_id: call.id.clone(),
                output,
            });
        }
        info!(
            "submitting tool outputs: thread_id={}, run_id={}, count={}",
            context.thread_id,
            run.id,
            outputs.len()
        );
        match self
            .deps
            .backend
            .submit_tool_outputs(&context.thread_id, &run.id, outputs)
            .await
        {
            Ok(stream) => DispatchOutcome::Resume(FollowUp {
                context: context.clone(),
                stream,
            }),
            Err(err) => {
                error!(
                    "submit tool outputs failed: thread_id={}, run_id={}, error={err}",
                    context.thread_id, run.id
                );
                DispatchOutcome::Resume(FollowUp::failed(context.clone(), &err))
            }
        }
    }

    async fn invoke_tool_call(&self, call: &ToolCall, context: &ConversationContext) -> String {
        let name = call.function.name.as_str();
        let result = match parse_arguments(&call.function.arguments) {
            Ok(args) => self.deps.functions.invoke(name, args, context).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(Value::String(text)) => text,
            Ok(value) => value.to_string(),
            Err(err) => {
                warn!(
                    "function call failed: name={name}, thread_id={}, error={err}",
                    context.thread_id
                );
                json!({ "error": err.to_string() }).to_string()
            }
        }
    }

    async fn on_run_completed(&self, event: &RunEvent, context: &ConversationContext) {
        let Some(run) = event.run() else {
            return;
        };
        let Some(usage) = run.usage else {
            debug!("run completed without usage: run_id={}", run.id);
            return;
        };
        let record = AssistantExpenseRecord {
            assistant_id: run
                .assistant_id
                .clone()
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| context.assistant_id.clone()),
            run_id: run.id.clone(),
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            created_at: now_ts(),
        };
        let storage = self.deps.storage.clone();
        let result = tokio::task::spawn_blocking(move || storage.insert_assistant_expense(&record))
            .await
            .map_err(anyhow::Error::from)
            .and_then(|inner| inner);
        match result {
            Ok(id) => info!(
                "run usage recorded: id={id}, run_id={}, input_tokens={}, output_tokens={}",
                run.id, usage.prompt_tokens, usage.completion_tokens
            ),
            Err(err) => warn!("record run usage failed: run_id={}, error={err}", run.id),
        }
    }

    async fn on_error(&self, event: &RunEvent, context: &ConversationContext) -> DispatchOutcome {
        warn!(
            "run stream error: thread_id={}, depth={}, message={}",
            context.thread_id,
            context.migration_depth,
            event.error_message()
        );
        match self.migration.recover(context).await {
            Some(follow_up) => DispatchOutcome::Resume(follow_up),
            None => DispatchOutcome::Abandoned,
        }
    }
}

fn parse_arguments(raw: &str) -> Result<Value> {
    if raw.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(raw).map_err(|err| anyhow::anyhow!("invalid function arguments: {err}"))
}
