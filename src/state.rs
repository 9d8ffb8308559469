// Application state: wires storage, buffer, backend client and the worker pool.
use crate::assistant::{AssistantBackend, OpenAiAssistantClient};
use crate::channels::{MessengerSendApi, OutboundDelivery};
use crate::config::Config;
use crate::queue::{resolve_worker_settings, start_worker_pool, JobQueue};
use crate::relay::buffer::build_buffer;
use crate::relay::{build_default_function_registry, RelayDeps, RelaySettings, RunCoordinator};
use crate::storage::{build_storage, StorageBackend};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub queue: JobQueue,
}

impl AppState {
    pub async fn new(config: Config) -> Result<Self> {
        let storage = init_storage(&config).await?;
        let buffer = build_buffer(&config.buffer)
            .await
            .context("pending buffer initialization failed")?;
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        if config.assistant.api_key().is_none() {
            warn!("assistant api key is not configured, backend calls will be rejected");
        }
        let backend: Arc<dyn AssistantBackend> =
            Arc::new(OpenAiAssistantClient::new(http.clone(), &config.assistant));
        let delivery: Arc<dyn OutboundDelivery> =
            Arc::new(MessengerSendApi::new(http, &config.messenger));
        let coordinator = Arc::new(RunCoordinator::new(RelayDeps {
            storage,
            backend,
            buffer,
            functions: build_default_function_registry(delivery.clone()),
            delivery,
            settings: RelaySettings::from_config(&config),
        }));
        let (queue, _worker) = start_worker_pool(coordinator, resolve_worker_settings(&config.worker));
        info!(
            "pagebot state ready: storage={}, buffer={}",
            display_backend(&config.storage.backend, "sqlite"),
            display_backend(&config.buffer.backend, "memory")
        );
        Ok(Self::from_parts(config, queue))
    }

    pub fn from_parts(config: Config, queue: JobQueue) -> Self {
        Self {
            config: Arc::new(config),
            queue,
        }
    }
}

async fn init_storage(config: &Config) -> Result<Arc<dyn StorageBackend>> {
    let storage = build_storage(&config.storage)?;
    let init = storage.clone();
    tokio::task::spawn_blocking(move || init.ensure_initialized())
        .await
        .context("storage initialization task failed")?
        .context("storage initialization failed")?;
    Ok(storage)
}

fn display_backend<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback
    } else {
        trimmed
    }
}
