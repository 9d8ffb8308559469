// Assistant backend: threads, runs and run event streams of an Assistants-style API.
mod openai;
mod stream;

use crate::relay::ContentPart;
use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use openai::OpenAiAssistantClient;
pub use stream::run_event_stream;

pub type RunEventStream = BoxStream<'static, Result<RunEvent>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Cancelling,
    Cancelled,
    Failed,
    Completed,
    Incomplete,
    Expired,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Cancelled
                | RunStatus::Failed
                | RunStatus::Completed
                | RunStatus::Incomplete
                | RunStatus::Expired
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Run {
    pub id: String,
    #[serde(default)]
    pub thread_id: String,
    #[serde(default)]
    pub assistant_id: Option<String>,
    pub status: RunStatus,
    #[serde(default)]
    pub required_action: Option<RequiredAction>,
    #[serde(default)]
    pub usage: Option<RunUsage>,
    #[serde(default)]
    pub last_error: Option<Value>,
}

impl Run {
    pub fn tool_calls(&self) -> &[ToolCall] {
        self.required_action
            .as_ref()
            .and_then(|action| action.submit_tool_outputs.as_ref())
            .map(|outputs| outputs.tool_calls.as_slice())
            .unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RequiredAction {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub submit_tool_outputs: Option<SubmitToolOutputs>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitToolOutputs {
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct RunUsage {
    #[serde(default)]
    pub prompt_tokens: i64,
    #[serde(default)]
    pub completion_tokens: i64,
    #[serde(default)]
    pub total_tokens: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolOutput {
    pub tool_call_id: String,
    pub output: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThreadMessage {
    #[serde(default)]
    pub id: String,
    pub role: MessageRole,
    #[serde(default)]
    pub content: Vec<MessageContent>,
}

impl ThreadMessage {
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                MessageContent::Text { text } => Some(text.value.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text { text: TextBlock },
    ImageUrl { image_url: ImageUrlBlock },
    ImageFile { image_file: ImageFileBlock },
    Refusal { refusal: String },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TextBlock {
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ImageUrlBlock {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ImageFileBlock {
    pub file_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: Vec<ContentPart>,
}

impl NewMessage {
    pub fn user(content: Vec<ContentPart>) -> Self {
        Self {
            role: MessageRole::User,
            content,
        }
    }
}

/// Closed set of stream event names; anything else lands in `Unknown`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEventKind {
    ThreadCreated,
    RunCreated,
    RunQueued,
    RunInProgress,
    RunRequiresAction,
    RunCompleted,
    RunIncomplete,
    RunFailed,
    RunCancelling,
    RunCancelled,
    RunExpired,
    RunStepCreated,
    RunStepInProgress,
    RunStepDelta,
    RunStepCompleted,
    RunStepFailed,
    RunStepCancelled,
    RunStepExpired,
    MessageCreated,
    MessageInProgress,
    MessageDelta,
    MessageCompleted,
    MessageIncomplete,
    Error,
    Done,
    Unknown(String),
}

impl RunEventKind {
    pub fn from_name(name: &str) -> Self {
        match name.trim() {
            "thread.created" => Self::ThreadCreated,
            "thread.run.created" => Self::RunCreated,
            "thread.run.queued" => Self::RunQueued,
            "thread.run.in_progress" => Self::RunInProgress,
            "thread.run.requires_action" => Self::RunRequiresAction,
            "thread.run.completed" => Self::RunCompleted,
            "thread.run.incomplete" => Self::RunIncomplete,
            "thread.run.failed" => Self::RunFailed,
            "thread.run.cancelling" => Self::RunCancelling,
            "thread.run.cancelled" => Self::RunCancelled,
            "thread.run.expired" => Self::RunExpired,
            "thread.run.step.created" => Self::RunStepCreated,
            "thread.run.step.in_progress" => Self::RunStepInProgress,
            "thread.run.step.delta" => Self::RunStepDelta,
            "thread.run.step.completed" => Self::RunStepCompleted,
            "thread.run.step.failed" => Self::RunStepFailed,
            "thread.run.step.cancelled" => Self::RunStepCancelled,
            "thread.run.step.expired" => Self::RunStepExpired,
            "thread.message.created" => Self::MessageCreated,
            "thread.message.in_progress" => Self::MessageInProgress,
            "thread.message.delta" => Self::MessageDelta,
            "thread.message.completed" => Self::MessageCompleted,
            "thread.message.incomplete" => Self::MessageIncomplete,
            "error" => Self::Error,
            "done" => Self::Done,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::ThreadCreated => "thread.created",
            Self::RunCreated => "thread.run.created",
            Self::RunQueued => "thread.run.queued",
            Self::RunInProgress => "thread.run.in_progress",
            Self::RunRequiresAction => "thread.run.requires_action",
            Self::RunCompleted => "thread.run.completed",
            Self::RunIncomplete => "thread.run.incomplete",
            Self::RunFailed => "thread.run.failed",
            Self::RunCancelling => "thread.run.cancelling",
            Self::RunCancelled => "thread.run.cancelled",
            Self::RunExpired => "thread.run.expired",
            Self::RunStepCreated => "thread.run.step.created",
            Self::RunStepInProgress => "thread.run.step.in_progress",
            Self::RunStepDelta => "thread.run.step.delta",
            Self::RunStepCompleted => "thread.run.step.completed",
            Self::RunStepFailed => "thread.run.step.failed",
            Self::RunStepCancelled => "thread.run.step.cancelled",
            Self::RunStepExpired => "thread.run.step.expired",
            Self::MessageCreated => "thread.message.created",
            Self::MessageInProgress => "thread.message.in_progress",
            Self::MessageDelta => "thread.message.delta",
            Self::MessageCompleted => "thread.message.completed",
            Self::MessageIncomplete => "thread.message.incomplete",
            Self::Error => "error",
            Self::Done => "done",
            Self::Unknown(name) => name.as_str(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunEvent {
    pub kind: RunEventKind,
    pub data: Value,
}

impl RunEvent {
    pub fn new(kind: RunEventKind, data: Value) -> Self {
        Self { kind, data }
    }

    /// Synthetic `error` event for transport failures so they share the recovery path.
    pub fn transport_error(message: impl Into<String>) -> Self {
        Self::new(
            RunEventKind::Error,
            serde_json::json!({ "error": { "type": "transport_error", "message": message.into() } }),
        )
    }

    pub fn run(&self) -> Option<Run> {
        serde_json::from_value(self.data.clone()).ok()
    }

    pub fn message(&self) -> Option<ThreadMessage> {
        serde_json::from_value(self.data.clone()).ok()
    }

    pub fn error_message(&self) -> String {
        let error = self.data.get("error").unwrap_or(&self.data);
        error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string())
    }
}

/// Failure reported by the assistant backend, tagged with a stable code.
#[derive(Debug)]
pub struct AssistantError {
    code: &'static str,
    status: Option<u16>,
    message: String,
}

impl AssistantError {
    pub const ACTIVE_RUN: &'static str = "ACTIVE_RUN";
    pub const HTTP_ERROR: &'static str = "HTTP_ERROR";
    pub const DECODE_ERROR: &'static str = "DECODE_ERROR";
    pub const NOT_FOUND: &'static str = "NOT_FOUND";

    pub fn new(code: &'static str, status: Option<u16>, message: String) -> Self {
        Self {
            code,
            status,
            message,
        }
    }

    pub fn active_run(message: String) -> Self {
        Self::new(Self::ACTIVE_RUN, Some(400), message)
    }

    pub fn decode(message: String) -> Self {
        Self::new(Self::DECODE_ERROR, None, message)
    }

    /// Maps a non-success response; the backend reports a concurrent run as a plain 400.
    pub fn from_response(status: u16, body: &str) -> Self {
        let message = serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|value| {
                value
                    .get("error")
                    .and_then(|error| error.get("message"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| body.trim().to_string());
        if status == 400 && message.contains("already has an active run") {
            return Self::active_run(message);
        }
        if status == 404 {
            return Self::new(Self::NOT_FOUND, Some(status), message);
        }
        Self::new(Self::HTTP_ERROR, Some(status), message)
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

}

impl std::fmt::Display for AssistantError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} ({status}): {}", self.code, self.message),
            None => write!(f, "{}: {}", self.code, self.message),
        }
    }
}

impl std::error::Error for AssistantError {}

pub fn is_active_run_error(err: &anyhow::Error) -> bool {
    err.downcast_ref::<AssistantError>()
        .map(|err| err.code() == AssistantError::ACTIVE_RUN)
        .unwrap_or(false)
}

/// Assistants-style backend. Streams are long-lived and end when the run does.
#[async_trait]
pub trait AssistantBackend: Send + Sync {
    async fn create_thread(&self) -> Result<String>;
    /// Most recent run of the thread, if any.
    async fn latest_run(&self, thread_id: &str) -> Result<Option<Run>>;
    async fn create_message(&self, thread_id: &str, message: &NewMessage) -> Result<()>;
    /// Up to `limit` messages, newest first.
    async fn list_messages(&self, thread_id: &str, limit: usize) -> Result<Vec<ThreadMessage>>;
    async fn stream_run(&self, thread_id: &str, assistant_id: &str) -> Result<RunEventStream>;
    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: Vec<ToolOutput>,
    ) -> Result<RunEventStream>;
}
