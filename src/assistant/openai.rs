// OpenAI-compatible Assistants API client (v2 beta header, bearer auth).
use crate::assistant::{
    run_event_stream, AssistantBackend, AssistantError, NewMessage, Run, RunEventStream,
    ThreadMessage, ToolOutput,
};
use crate::config::AssistantConfig;
use anyhow::Result;
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const DEFAULT_TIMEOUT_S: u64 = 60;
const MAX_LIST_LIMIT: usize = 100;

#[derive(Deserialize)]
struct ListPage<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Deserialize)]
struct Created {
    id: String,
}

#[derive(Clone)]
pub struct OpenAiAssistantClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl OpenAiAssistantClient {
    pub fn new(http: Client, config: &AssistantConfig) -> Self {
        let base_url = config
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_string();
        let timeout_s = config
            .timeout_s
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_TIMEOUT_S);
        Self {
            http,
            base_url,
            api_key: config.api_key(),
            timeout: Duration::from_secs(timeout_s),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        if self.base_url.ends_with("/v1") {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}/v1{path}", self.base_url)
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut builder = self
            .http
            .request(method, self.endpoint(path))
            .header("OpenAI-Beta", "assistants=v2");
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key);
        }
        builder
    }

    async fn call<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let response = builder.timeout(self.timeout).send().await?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(AssistantError::from_response(status.as_u16(), &text).into());
        }
        serde_json::from_str::<T>(&text).map_err(|err| {
            AssistantError::decode(format!("decode assistant response: {err}")).into()
        })
    }

    async fn open_stream(&self, builder: RequestBuilder) -> Result<RunEventStream> {
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AssistantError::from_response(status.as_u16(), &text).into());
        }
        Ok(run_event_stream(response))
    }
}

#[async_trait]
impl AssistantBackend for OpenAiAssistantClient {
    async fn create_thread(&self) -> Result<String> {
        let created: Created = self
            .call(self.request(Method::POST, "/threads").json(&json!({})))
            .await?;
        debug!("assistant thread created: thread_id={}", created.id);
        Ok(created.id)
    }

    async fn latest_run(&self, thread_id: &str) -> Result<Option<Run>> {
        let page: ListPage<Run> = self
            .call(
                self.request(Method::GET, &format!("/threads/{thread_id}/runs"))
                    .query(&[("limit", "1"), ("order", "desc")]),
            )
            .await?;
        Ok(page.data.into_iter().next())
    }

    async fn create_message(&self, thread_id: &str, message: &NewMessage) -> Result<()> {
        let _: Value = self
            .call(
                self.request(Method::POST, &format!("/threads/{thread_id}/messages"))
                    .json(message),
            )
            .await?;
        Ok(())
    }

    async fn list_messages(&self, thread_id: &str, limit: usize) -> Result<Vec<ThreadMessage>> {
        let limit = limit.clamp(1, MAX_LIST_LIMIT).to_string();
        let page: ListPage<ThreadMessage> = self
            .call(
                self.request(Method::GET, &format!("/threads/{thread_id}/messages"))
                    .query(&[("limit", limit.as_str()), ("order", "desc")]),
            )
            .await?;
        Ok(page.data)
    }

    async fn stream_run(&self, thread_id: &str, assistant_id: &str) -> Result<RunEventStream> {
        self.open_stream(
            self.request(Method::POST, &format!("/threads/{thread_id}/runs"))
                .json(&json!({ "assistant_id": assistant_id, "stream": true })),
        )
        .await
    }

    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: Vec<ToolOutput>,
    ) -> Result<RunEventStream> {
        self.open_stream(
            self.request(
                Method::POST,
                &format!("/threads/{thread_id}/runs/{run_id}/submit_tool_outputs"),
            )
            .json(&json!({ "tool_outputs": outputs, "stream": true })),
        )
        .await
    }
}
