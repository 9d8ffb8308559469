use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::StreamExt;
use pagebot_server::assistant::{
    AssistantBackend, AssistantError, MessageRole, NewMessage, Run, RunEvent, RunEventKind,
    RunEventStream, ThreadMessage, ToolOutput,
};
use pagebot_server::channels::{
    AttachmentKind, InboundAttachment, InboundMessage, OutboundDelivery, SenderAction,
};
use pagebot_server::relay::{
    build_default_function_registry, BufferKey, ContentPart, MemoryPendingBuffer, PendingBuffer,
    RelayDeps, RelayError, RelaySettings, RunCoordinator,
};
use pagebot_server::storage::{
    AssistantExpenseRecord, ConversationKey, ConversationRecord, PageBindingRecord,
    SqliteStorage, StorageBackend,
};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

const PAGE: &str = "page_1";
const USER: &str = "user_1";
const ASSISTANT: &str = "asst_1";
const TOKEN: &str = "page_token";

#[derive(Default)]
struct FakeState {
    next_thread: usize,
    created_threads: Vec<String>,
    runs: HashMap<String, Run>,
    history: HashMap<String, Vec<ThreadMessage>>,
    messages: Vec<(String, NewMessage)>,
    streams: VecDeque<RunEventStream>,
    stream_calls: Vec<(String, String)>,
    tool_streams: VecDeque<RunEventStream>,
    tool_submissions: Vec<(String, String, Vec<ToolOutput>)>,
    fail_latest_run: bool,
    fail_list_messages: bool,
    reject_active_run: bool,
    /// Appended while a rejected submission is in flight, like a message racing the flush.
    append_on_reject: Option<(Arc<TestBuffer>, BufferKey, ContentPart)>,
}

#[derive(Default)]
struct FakeBackend {
    state: Mutex<FakeState>,
}

impl FakeBackend {
    fn set_run(&self, thread_id: &str, status: &str) {
        let run: Run = serde_json::from_value(json!({
            "id": "run_prev",
            "thread_id": thread_id,
            "status": status,
        }))
        .unwrap();
        self.state.lock().runs.insert(thread_id.to_string(), run);
    }

    fn push_stream(&self, stream: RunEventStream) {
        self.state.lock().streams.push_back(stream);
    }

    fn push_tool_stream(&self, stream: RunEventStream) {
        self.state.lock().tool_streams.push_back(stream);
    }

    fn messages(&self) -> Vec<(String, NewMessage)> {
        self.state.lock().messages.clone()
    }

    fn stream_calls(&self) -> Vec<(String, String)> {
        self.state.lock().stream_calls.clone()
    }
}

#[async_trait]
impl AssistantBackend for FakeBackend {
    async fn create_thread(&self) -> Result<String> {
        let mut state = self.state.lock();
        state.next_thread += 1;
        let thread_id = format!("thread_new_{}", state.next_thread);
        state.created_threads.push(thread_id.clone());
        Ok(thread_id)
    }

    async fn latest_run(&self, thread_id: &str) -> Result<Option<Run>> {
        let state = self.state.lock();
        if state.fail_latest_run {
            return Err(anyhow!("run lookup unavailable"));
        }
        Ok(state.runs.get(thread_id).cloned())
    }

    async fn create_message(&self, thread_id: &str, message: &NewMessage) -> Result<()> {
        let concurrent = {
            let mut state = self.state.lock();
            if !state.reject_active_run {
                state
                    .messages
                    .push((thread_id.to_string(), message.clone()));
                return Ok(());
            }
            state.append_on_reject.take()
        };
        if let Some((buffer, key, part)) = concurrent {
            buffer.append(&key, &[part]).await?;
        }
        Err(AssistantError::from_response(
            400,
            r#"{"error":{"message":"Thread already has an active run run_x."}}"#,
        )
        .into())
    }

    async fn list_messages(&self, thread_id: &str, limit: usize) -> Result<Vec<ThreadMessage>> {
        let state = self.state.lock();
        if state.fail_list_messages {
            return Err(anyhow!("history unavailable"));
        }
        let mut items = state.history.get(thread_id).cloned().unwrap_or_default();
        items.truncate(limit);
        Ok(items)
    }

    async fn stream_run(&self, thread_id: &str, assistant_id: &str) -> Result<RunEventStream> {
        let mut state = self.state.lock();
        state
            .stream_calls
            .push((thread_id.to_string(), assistant_id.to_string()));
        Ok(state
            .streams
            .pop_front()
            .unwrap_or_else(|| futures::stream::empty().boxed()))
    }

    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: Vec<ToolOutput>,
    ) -> Result<RunEventStream> {
        let mut state = self.state.lock();
        state
            .tool_submissions
            .push((thread_id.to_string(), run_id.to_string(), outputs));
        Ok(state
            .tool_streams
            .pop_front()
            .unwrap_or_else(|| futures::stream::empty().boxed()))
    }
}

#[derive(Default)]
struct FakeDelivery {
    texts: Mutex<Vec<String>>,
    attachments: Mutex<Vec<(String, String)>>,
    actions: Mutex<Vec<&'static str>>,
}

#[async_trait]
impl OutboundDelivery for FakeDelivery {
    async fn send_text(&self, access_token: &str, recipient_id: &str, text: &str) -> Result<()> {
        assert_eq!(access_token, TOKEN);
        assert_eq!(recipient_id, USER);
        self.texts.lock().push(text.to_string());
        Ok(())
    }

    async fn send_attachment(
        &self,
        _access_token: &str,
        _recipient_id: &str,
        attachment_type: &str,
        url: &str,
    ) -> Result<()> {
        self.attachments
            .lock()
            .push((attachment_type.to_string(), url.to_string()));
        Ok(())
    }

    async fn send_action(
        &self,
        _access_token: &str,
        _recipient_id: &str,
        action: SenderAction,
    ) -> Result<()> {
        self.actions.lock().push(action.as_str());
        Ok(())
    }
}

#[derive(Default)]
struct TestBuffer {
    inner: MemoryPendingBuffer,
    fail_append: AtomicBool,
}

#[async_trait]
impl PendingBuffer for TestBuffer {
    async fn append(&self, key: &BufferKey, parts: &[ContentPart]) -> Result<()> {
        if self.fail_append.load(Ordering::SeqCst) {
            return Err(anyhow!("buffer store unreachable"));
        }
        self.inner.append(key, parts).await
    }

    async fn prepend(&self, key: &BufferKey, parts: &[ContentPart]) -> Result<()> {
        self.inner.prepend(key, parts).await
    }

    async fn drain_all(&self, key: &BufferKey) -> Result<Vec<ContentPart>> {
        self.inner.drain_all(key).await
    }

    async fn pending_len(&self, key: &BufferKey) -> Result<usize> {
        self.inner.pending_len(key).await
    }
}

struct CountingStorage {
    inner: SqliteStorage,
    links: AtomicUsize,
    fail_conversations: AtomicBool,
}

impl StorageBackend for CountingStorage {
    fn ensure_initialized(&self) -> Result<()> {
        self.inner.ensure_initialized()
    }

    fn get_page_binding(&self, page_id: &str) -> Result<Option<PageBindingRecord>> {
        self.inner.get_page_binding(page_id)
    }

    fn upsert_page_binding(&self, record: &PageBindingRecord) -> Result<()> {
        self.inner.upsert_page_binding(record)
    }

    fn get_conversation(&self, key: &ConversationKey) -> Result<Option<ConversationRecord>> {
        if self.fail_conversations.load(Ordering::SeqCst) {
            return Err(anyhow!("database is locked"));
        }
        self.inner.get_conversation(key)
    }

    fn link_conversation(
        &self,
        key: &ConversationKey,
        assistant_id: &str,
        thread_id: &str,
    ) -> Result<()> {
        self.links.fetch_add(1, Ordering::SeqCst);
        self.inner.link_conversation(key, assistant_id, thread_id)
    }

    fn replace_conversation_thread(
        &self,
        key: &ConversationKey,
        assistant_id: &str,
        thread_id: &str,
    ) -> Result<()> {
        self.inner
            .replace_conversation_thread(key, assistant_id, thread_id)
    }

    fn delete_conversation(&self, key: &ConversationKey) -> Result<usize> {
        self.inner.delete_conversation(key)
    }

    fn insert_assistant_expense(&self, record: &AssistantExpenseRecord) -> Result<i64> {
        self.inner.insert_assistant_expense(record)
    }
}

struct Harness {
    coordinator: RunCoordinator,
    backend: Arc<FakeBackend>,
    delivery: Arc<FakeDelivery>,
    buffer: Arc<TestBuffer>,
    storage: Arc<CountingStorage>,
}

fn temp_sqlite() -> SqliteStorage {
    let db_path = std::env::temp_dir().join(format!(
        "pagebot_relay_{}.db",
        uuid::Uuid::new_v4().simple()
    ));
    let storage = SqliteStorage::new(db_path.to_string_lossy().to_string());
    storage.ensure_initialized().unwrap();
    storage
        .upsert_page_binding(&PageBindingRecord {
            page_id: PAGE.to_string(),
            assistant_id: ASSISTANT.to_string(),
            access_token: TOKEN.to_string(),
            active: true,
            updated_at: 0.0,
        })
        .unwrap();
    storage
}

fn harness() -> Harness {
    let storage = Arc::new(CountingStorage {
        inner: temp_sqlite(),
        links: AtomicUsize::new(0),
        fail_conversations: AtomicBool::new(false),
    });
    let backend = Arc::new(FakeBackend::default());
    let delivery = Arc::new(FakeDelivery::default());
    let buffer = Arc::new(TestBuffer::default());
    let coordinator = RunCoordinator::new(RelayDeps {
        storage: storage.clone(),
        backend: backend.clone(),
        buffer: buffer.clone(),
        delivery: delivery.clone(),
        functions: build_default_function_registry(delivery.clone()),
        settings: RelaySettings::default(),
    });
    Harness {
        coordinator,
        backend,
        delivery,
        buffer,
        storage,
    }
}

fn key() -> ConversationKey {
    ConversationKey::new(USER, PAGE)
}

fn link_existing_thread(harness: &Harness, thread_id: &str) {
    harness
        .storage
        .inner
        .link_conversation(&key(), ASSISTANT, thread_id)
        .unwrap();
}

fn text_message(text: &str) -> InboundMessage {
    InboundMessage {
        sender_id: USER.to_string(),
        page_id: PAGE.to_string(),
        mid: Some("mid_1".to_string()),
        text: Some(text.to_string()),
        attachments: Vec::new(),
        timestamp: Some(1),
    }
}

fn events(items: Vec<RunEvent>) -> RunEventStream {
    futures::stream::iter(items.into_iter().map(Ok)).boxed()
}

fn message_completed(text: &str) -> RunEvent {
    RunEvent::new(
        RunEventKind::MessageCompleted,
        json!({
            "id": "msg_reply",
            "role": "assistant",
            "content": [{"type": "text", "text": {"value": text, "annotations": []}}]
        }),
    )
}

fn run_completed(run_id: &str) -> RunEvent {
    RunEvent::new(
        RunEventKind::RunCompleted,
        json!({
            "id": run_id,
            "thread_id": "thread_1",
            "status": "completed",
            "usage": {"prompt_tokens": 12, "completion_tokens": 7, "total_tokens": 19}
        }),
    )
}

fn error_event() -> RunEvent {
    RunEvent::new(
        RunEventKind::Error,
        json!({"error": {"message": "thread is in a bad state"}}),
    )
}

fn run_ended(kind: RunEventKind, status: &str) -> RunEvent {
    RunEvent::new(
        kind,
        json!({
            "id": "run_1",
            "thread_id": "thread_1",
            "status": status,
            "last_error": {"code": "server_error", "message": "boom"}
        }),
    )
}

fn video_attachment() -> InboundAttachment {
    InboundAttachment {
        kind: AttachmentKind::Video,
        url: Some("https://cdn/clip.mp4".to_string()),
    }
}

fn submitted_contents(backend: &FakeBackend) -> Vec<Vec<ContentPart>> {
    backend
        .messages()
        .into_iter()
        .map(|(_, message)| message.content)
        .collect()
}

fn history_message(value: serde_json::Value) -> ThreadMessage {
    serde_json::from_value(value).unwrap()
}

fn texts(range: std::ops::Range<usize>) -> Vec<ContentPart> {
    range
        .map(|index| ContentPart::text(format!("m{index}")))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn active_run_buffers_message_without_submitting() {
    let h = harness();
    link_existing_thread(&h, "thread_1");
    h.backend.set_run("thread_1", "in_progress");

    h.coordinator
        .handle_inbound(&text_message("hello"))
        .await
        .unwrap();

    let buffered = h
        .buffer
        .drain_all(&BufferKey::new("thread_1", USER))
        .await
        .unwrap();
    assert_eq!(buffered, vec![ContentPart::text("hello")]);
    assert!(h.backend.messages().is_empty());
    assert!(h.backend.stream_calls().is_empty());
    assert!(h.delivery.texts.lock().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn terminal_run_flushes_drained_parts_first_in_chunks() {
    let h = harness();
    link_existing_thread(&h, "thread_1");
    h.backend.set_run("thread_1", "completed");
    h.buffer
        .append(&BufferKey::new("thread_1", USER), &texts(0..24))
        .await
        .unwrap();

    h.coordinator
        .handle_inbound(&text_message("m24"))
        .await
        .unwrap();

    let messages = h.backend.messages();
    let sizes: Vec<usize> = messages
        .iter()
        .map(|(_, message)| message.content.len())
        .collect();
    assert_eq!(sizes, vec![10, 10, 5]);
    assert!(messages.iter().all(|(thread, message)| {
        thread == "thread_1" && message.role == MessageRole::User
    }));
    let submitted: Vec<ContentPart> = messages
        .into_iter()
        .flat_map(|(_, message)| message.content)
        .collect();
    assert_eq!(submitted, texts(0..25));
    assert_eq!(
        h.buffer
            .pending_len(&BufferKey::new("thread_1", USER))
            .await
            .unwrap(),
        0
    );
    assert_eq!(
        h.backend.stream_calls(),
        vec![("thread_1".to_string(), ASSISTANT.to_string())]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn first_message_creates_thread_and_relays_reply() {
    let h = harness();
    h.backend.push_stream(events(vec![
        RunEvent::new(RunEventKind::RunCreated, json!({"id": "run_1", "status": "queued"})),
        RunEvent::new(RunEventKind::MessageDelta, json!({"delta": {}})),
        message_completed("Hi there"),
        run_completed("run_1"),
        RunEvent::new(RunEventKind::Unknown("thread.run.mystery".to_string()), json!({})),
        RunEvent::new(RunEventKind::Done, json!("[DONE]")),
    ]));

    h.coordinator
        .handle_inbound(&text_message("hello"))
        .await
        .unwrap();

    let record = h.storage.get_conversation(&key()).unwrap().unwrap();
    assert_eq!(record.thread_id, "thread_new_1");
    assert!(record.is_linked(ASSISTANT));
    assert_eq!(*h.delivery.texts.lock(), vec!["Hi there".to_string()]);
    assert_eq!(*h.delivery.actions.lock(), vec!["mark_seen", "typing_on"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn video_attachment_only_sends_notice() {
    let h = harness();
    let mut message = text_message("");
    message.text = None;
    message.attachments = vec![video_attachment()];

    h.coordinator.handle_inbound(&message).await.unwrap();

    assert_eq!(
        *h.delivery.texts.lock(),
        vec![RelaySettings::default().replies.unsupported_attachment]
    );
    assert!(h.backend.messages().is_empty());
    assert!(h.backend.stream_calls().is_empty());
    assert!(h.storage.get_conversation(&key()).unwrap().is_none());
    assert!(h.delivery.actions.lock().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reply_is_deferred_and_buffer_flushed_after_run() {
    let h = harness();
    link_existing_thread(&h, "thread_1");
    let buffer = h.buffer.clone();
    let first = futures::stream::once(async move {
        buffer
            .append(
                &BufferKey::new("thread_1", USER),
                &[ContentPart::text("and another thing")],
            )
            .await
            .unwrap();
        Ok::<_, anyhow::Error>(message_completed("first answer"))
    })
    .chain(futures::stream::iter(vec![Ok(run_completed("run_1"))]))
    .boxed();
    h.backend.push_stream(first);
    h.backend
        .push_stream(events(vec![message_completed("combined answer")]));

    h.coordinator
        .handle_inbound(&text_message("hello"))
        .await
        .unwrap();

    assert_eq!(*h.delivery.texts.lock(), vec!["combined answer".to_string()]);
    let submitted: Vec<Vec<ContentPart>> = h
        .backend
        .messages()
        .into_iter()
        .map(|(_, message)| message.content)
        .collect();
    assert_eq!(
        submitted,
        vec![
            vec![ContentPart::text("hello")],
            vec![ContentPart::text("and another thing")],
        ]
    );
    assert_eq!(h.backend.stream_calls().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn requires_action_runs_functions_and_resumes() {
    let h = harness();
    link_existing_thread(&h, "thread_1");
    h.backend.push_stream(events(vec![RunEvent::new(
        RunEventKind::RunRequiresAction,
        json!({
            "id": "run_1",
            "thread_id": "thread_1",
            "status": "requires_action",
            "required_action": {
                "type": "submit_tool_outputs",
                "submit_tool_outputs": {"tool_calls": [
                    {"id": "call_1", "type": "function", "function": {
                        "name": "sendAttachment",
                        "arguments": "{\"attachmentType\":\"image\",\"attachmentUrl\":\"https://cdn/menu.png\"}"
                    }},
                    {"id": "call_2", "type": "function", "function": {
                        "name": "bookTable", "arguments": "{}"
                    }}
                ]}
            }
        }),
    )]));
    h.backend
        .push_tool_stream(events(vec![message_completed("Here is the menu")]));

    h.coordinator
        .handle_inbound(&text_message("menu please"))
        .await
        .unwrap();

    assert_eq!(
        *h.delivery.attachments.lock(),
        vec![("image".to_string(), "https://cdn/menu.png".to_string())]
    );
    let submissions = h.backend.state.lock().tool_submissions.clone();
    assert_eq!(submissions.len(), 1);
    let (thread_id, run_id, outputs) = &submissions[0];
    assert_eq!(thread_id, "thread_1");
    assert_eq!(run_id, "run_1");
    assert_eq!(outputs[0].tool_call_id, "call_1");
    assert_eq!(outputs[0].output, "success");
    assert_eq!(outputs[1].tool_call_id, "call_2");
    assert!(outputs[1].output.contains("unknown function: bookTable"));
    assert_eq!(*h.delivery.texts.lock(), vec!["Here is the menu".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn error_event_migrates_history_to_new_thread() {
    let h = harness();
    link_existing_thread(&h, "thread_1");
    h.backend.state.lock().history.insert(
        "thread_1".to_string(),
        vec![
            history_message(json!({"id": "c", "role": "user", "content": [
                {"type": "image_url", "image_url": {"url": "https://cdn/c.png"}}
            ]})),
            history_message(json!({"id": "b", "role": "assistant", "content": [
                {"type": "text", "text": {"value": "B", "annotations": []}},
                {"type": "refusal", "refusal": "cannot"}
            ]})),
            history_message(json!({"id": "a", "role": "user", "content": [
                {"type": "text", "text": {"value": "A", "annotations": []}}
            ]})),
        ],
    );
    h.backend.push_stream(events(vec![error_event()]));
    h.backend
        .push_stream(events(vec![message_completed("recovered")]));

    h.coordinator
        .handle_inbound(&text_message("hello"))
        .await
        .unwrap();

    let replayed: Vec<(MessageRole, Vec<ContentPart>)> = h
        .backend
        .messages()
        .into_iter()
        .filter(|(thread, _)| thread == "thread_new_1")
        .map(|(_, message)| (message.role, message.content))
        .collect();
    assert_eq!(
        replayed,
        vec![
            (MessageRole::User, vec![ContentPart::text("A")]),
            (MessageRole::Assistant, vec![ContentPart::text("B")]),
            (
                MessageRole::User,
                vec![ContentPart::image("https://cdn/c.png")]
            ),
        ]
    );
    let record = h.storage.get_conversation(&key()).unwrap().unwrap();
    assert_eq!(record.thread_id, "thread_new_1");
    assert_eq!(
        h.backend.stream_calls(),
        vec![
            ("thread_1".to_string(), ASSISTANT.to_string()),
            ("thread_new_1".to_string(), ASSISTANT.to_string()),
        ]
    );
    assert_eq!(*h.delivery.texts.lock(), vec!["recovered".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_migration_sends_fallback_and_resets_mapping() {
    let h = harness();
    link_existing_thread(&h, "thread_1");
    h.backend.state.lock().fail_list_messages = true;
    h.backend.push_stream(events(vec![error_event()]));

    h.coordinator
        .handle_inbound(&text_message("hello"))
        .await
        .unwrap();

    assert_eq!(
        *h.delivery.texts.lock(),
        vec![RelaySettings::default().replies.system_error]
    );
    assert!(h.storage.get_conversation(&key()).unwrap().is_none());
    assert!(h.backend.state.lock().created_threads.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_error_after_migration_falls_back() {
    let h = harness();
    link_existing_thread(&h, "thread_1");
    h.backend.push_stream(events(vec![error_event()]));
    h.backend.push_stream(events(vec![error_event()]));

    h.coordinator
        .handle_inbound(&text_message("hello"))
        .await
        .unwrap();

    assert_eq!(h.backend.stream_calls().len(), 2);
    assert_eq!(
        *h.delivery.texts.lock(),
        vec![RelaySettings::default().replies.system_error]
    );
    assert!(h.storage.get_conversation(&key()).unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn broken_stream_takes_the_recovery_path() {
    let h = harness();
    link_existing_thread(&h, "thread_1");
    h.backend.state.lock().fail_list_messages = true;
    h.backend.push_stream(
        futures::stream::iter(vec![Err(anyhow!("connection reset"))]).boxed(),
    );

    h.coordinator
        .handle_inbound(&text_message("hello"))
        .await
        .unwrap();

    assert_eq!(
        *h.delivery.texts.lock(),
        vec![RelaySettings::default().replies.system_error]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn active_run_conflict_rebuffers_instead_of_migrating() {
    let h = harness();
    link_existing_thread(&h, "thread_1");
    h.backend.state.lock().reject_active_run = true;

    h.coordinator
        .handle_inbound(&text_message("hello"))
        .await
        .unwrap();

    assert_eq!(
        h.buffer
            .drain_all(&BufferKey::new("thread_1", USER))
            .await
            .unwrap(),
        vec![ContentPart::text("hello")]
    );
    assert!(h.backend.stream_calls().is_empty());
    assert!(h.delivery.texts.lock().is_empty());
    assert_eq!(
        h.storage.get_conversation(&key()).unwrap().unwrap().thread_id,
        "thread_1"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn run_lookup_failure_is_treated_as_no_run() {
    let h = harness();
    link_existing_thread(&h, "thread_1");
    h.backend.state.lock().fail_latest_run = true;

    h.coordinator
        .handle_inbound(&text_message("hello"))
        .await
        .unwrap();

    assert_eq!(h.backend.messages().len(), 1);
    assert_eq!(h.backend.stream_calls().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resolve_is_idempotent_and_links_new_assistants() {
    let h = harness();
    let resolver = h.coordinator.resolver();

    let first = resolver.resolve(&key(), ASSISTANT).await.unwrap();
    let second = resolver.resolve(&key(), ASSISTANT).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(h.storage.links.load(Ordering::SeqCst), 1);
    assert_eq!(h.backend.state.lock().created_threads.len(), 1);

    let other = resolver.resolve(&key(), "asst_2").await.unwrap();
    assert_eq!(other, first);
    assert_eq!(h.storage.links.load(Ordering::SeqCst), 2);
    assert_eq!(h.backend.state.lock().created_threads.len(), 1);
    let record = h.storage.get_conversation(&key()).unwrap().unwrap();
    assert!(record.is_linked(ASSISTANT));
    assert!(record.is_linked("asst_2"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unbound_page_is_not_retried() {
    let h = harness();
    let mut message = text_message("hello");
    message.page_id = "page_unknown".to_string();

    let err = h.coordinator.handle_inbound(&message).await.unwrap_err();
    let relay = err.downcast_ref::<RelayError>().unwrap();
    assert_eq!(relay.code(), RelayError::PAGE_NOT_BOUND);
    assert!(!relay.is_retryable());
    assert!(h.delivery.texts.lock().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn buffer_outage_while_run_active_is_retryable() {
    let h = harness();
    link_existing_thread(&h, "thread_1");
    h.backend.set_run("thread_1", "in_progress");
    h.buffer.fail_append.store(true, Ordering::SeqCst);

    let err = h
        .coordinator
        .handle_inbound(&text_message("hello"))
        .await
        .unwrap_err();
    let relay = err.downcast_ref::<RelayError>().unwrap();
    assert_eq!(relay.code(), RelayError::BUFFER_UNAVAILABLE);
    assert!(pagebot_server::relay::error::is_retryable(&err));
    assert!(h.backend.messages().is_empty());
    assert!(h.delivery.texts.lock().is_empty());
    assert!(h.delivery.actions.lock().is_empty());

    h.buffer.fail_append.store(false, Ordering::SeqCst);
    h.coordinator
        .handle_inbound(&text_message("hello"))
        .await
        .unwrap();
    assert_eq!(
        h.buffer
            .drain_all(&BufferKey::new("thread_1", USER))
            .await
            .unwrap(),
        vec![ContentPart::text("hello")]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn message_buffered_after_reply_is_flushed_when_run_ends() {
    let h = harness();
    link_existing_thread(&h, "thread_1");
    let buffer = h.buffer.clone();
    let first = futures::stream::iter(vec![Ok(message_completed("first"))])
        .chain(futures::stream::once(async move {
            buffer
                .append(&BufferKey::new("thread_1", USER), &[ContentPart::text("late")])
                .await
                .unwrap();
            Ok::<_, anyhow::Error>(run_completed("run_1"))
        }))
        .boxed();
    h.backend.push_stream(first);
    h.backend.push_stream(events(vec![message_completed("second")]));

    h.coordinator
        .handle_inbound(&text_message("hello"))
        .await
        .unwrap();

    assert_eq!(
        *h.delivery.texts.lock(),
        vec!["first".to_string(), "second".to_string()]
    );
    assert_eq!(
        submitted_contents(&h.backend),
        vec![
            vec![ContentPart::text("hello")],
            vec![ContentPart::text("late")],
        ]
    );
    assert_eq!(h.backend.stream_calls().len(), 2);
    assert_eq!(
        h.buffer
            .pending_len(&BufferKey::new("thread_1", USER))
            .await
            .unwrap(),
        0
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn store_outage_retries_do_not_repeat_outbound_calls() {
    let h = harness();
    h.storage.fail_conversations.store(true, Ordering::SeqCst);
    let mut message = text_message("look");
    message.attachments = vec![video_attachment()];

    for _ in 0..3 {
        let err = h.coordinator.handle_inbound(&message).await.unwrap_err();
        assert!(pagebot_server::relay::error::is_retryable(&err));
    }
    assert!(h.delivery.texts.lock().is_empty());
    assert!(h.delivery.actions.lock().is_empty());

    h.storage.fail_conversations.store(false, Ordering::SeqCst);
    h.coordinator.handle_inbound(&message).await.unwrap();

    assert_eq!(
        *h.delivery.texts.lock(),
        vec![RelaySettings::default().replies.unsupported_attachment]
    );
    assert_eq!(*h.delivery.actions.lock(), vec!["mark_seen", "typing_on"]);
    assert_eq!(
        submitted_contents(&h.backend),
        vec![vec![ContentPart::text("look")]]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn store_failure_surfaces_resolution_error() {
    let h = harness();
    h.storage.fail_conversations.store(true, Ordering::SeqCst);

    let err = h
        .coordinator
        .handle_inbound(&text_message("hello"))
        .await
        .unwrap_err();
    let relay = err.downcast_ref::<RelayError>().unwrap();
    assert_eq!(relay.code(), RelayError::RESOLUTION_FAILED);
    assert!(relay.is_retryable());
    assert!(h.backend.state.lock().created_threads.is_empty());
    assert!(h.backend.stream_calls().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mixed_text_and_video_sends_notice_and_forwards_text() {
    let h = harness();
    link_existing_thread(&h, "thread_1");
    h.backend.push_stream(events(vec![message_completed("nice clip")]));
    let mut message = text_message("look");
    message.attachments = vec![video_attachment()];

    h.coordinator.handle_inbound(&message).await.unwrap();

    assert_eq!(
        *h.delivery.texts.lock(),
        vec![
            RelaySettings::default().replies.unsupported_attachment,
            "nice clip".to_string(),
        ]
    );
    assert_eq!(
        submitted_contents(&h.backend),
        vec![vec![ContentPart::text("look")]]
    );
    assert_eq!(h.backend.stream_calls().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn migration_carries_buffered_parts_to_new_thread() {
    let h = harness();
    link_existing_thread(&h, "thread_1");
    let buffer = h.buffer.clone();
    h.backend.push_stream(
        futures::stream::once(async move {
            buffer
                .append(
                    &BufferKey::new("thread_1", USER),
                    &[ContentPart::text("while broken")],
                )
                .await
                .unwrap();
            Ok::<_, anyhow::Error>(error_event())
        })
        .boxed(),
    );
    h.backend
        .push_stream(events(vec![message_completed("recovered")]));

    h.coordinator
        .handle_inbound(&text_message("hello"))
        .await
        .unwrap();

    let carried: Vec<Vec<ContentPart>> = h
        .backend
        .messages()
        .into_iter()
        .filter(|(thread, _)| thread == "thread_new_1")
        .map(|(_, message)| message.content)
        .collect();
    assert_eq!(carried, vec![vec![ContentPart::text("while broken")]]);
    assert_eq!(
        h.buffer
            .pending_len(&BufferKey::new("thread_1", USER))
            .await
            .unwrap(),
        0
    );
    assert_eq!(*h.delivery.texts.lock(), vec!["recovered".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unsuccessful_run_is_logged_without_retry() {
    let h = harness();
    link_existing_thread(&h, "thread_1");
    h.backend.push_stream(events(vec![
        run_ended(RunEventKind::RunFailed, "failed"),
        run_ended(RunEventKind::RunCancelled, "cancelled"),
        run_ended(RunEventKind::RunExpired, "expired"),
        run_ended(RunEventKind::RunIncomplete, "incomplete"),
    ]));

    h.coordinator
        .handle_inbound(&text_message("hello"))
        .await
        .unwrap();

    assert_eq!(h.backend.stream_calls().len(), 1);
    assert!(h.delivery.texts.lock().is_empty());
    assert!(h.backend.state.lock().created_threads.is_empty());
    assert_eq!(
        h.storage.get_conversation(&key()).unwrap().unwrap().thread_id,
        "thread_1"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn active_run_conflict_keeps_unsent_parts_ahead_of_newer_ones() {
    let h = harness();
    link_existing_thread(&h, "thread_1");
    let buffer_key = BufferKey::new("thread_1", USER);
    {
        let mut state = h.backend.state.lock();
        state.reject_active_run = true;
        state.append_on_reject = Some((
            h.buffer.clone(),
            buffer_key.clone(),
            ContentPart::text("later"),
        ));
    }

    h.coordinator
        .handle_inbound(&text_message("hello"))
        .await
        .unwrap();

    assert_eq!(
        h.buffer.drain_all(&buffer_key).await.unwrap(),
        vec![ContentPart::text("hello"), ContentPart::text("later")]
    );
}
