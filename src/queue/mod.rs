// Job queue: bounded in-process channel drained by a semaphore-capped worker pool.
// Delivery is at-least-once; retryable failures come back after an exponential backoff.
use crate::channels::InboundMessage;
use crate::config::WorkerConfig;
use crate::relay::error::is_retryable;
use crate::relay::RunCoordinator;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct MessengerJob {
    pub id: String,
    pub messages: Vec<InboundMessage>,
    pub attempt: u32,
}

impl MessengerJob {
    pub fn new(messages: Vec<InboundMessage>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            messages,
            attempt: 0,
        }
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle_message(&self, message: &InboundMessage) -> Result<()>;
}

#[async_trait]
impl JobHandler for RunCoordinator {
    async fn handle_message(&self, message: &InboundMessage) -> Result<()> {
        self.handle_inbound(message).await
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub max_concurrency: usize,
    pub queue_capacity: usize,
    pub max_retries: u32,
    pub retry_base_s: f64,
    pub retry_max_s: f64,
}

pub fn resolve_worker_settings(cfg: &WorkerConfig) -> WorkerSettings {
    WorkerSettings {
        max_concurrency: if cfg.max_concurrency == 0 {
            100
        } else {
            cfg.max_concurrency
        },
        queue_capacity: if cfg.queue_capacity == 0 {
            1024
        } else {
            cfg.queue_capacity
        },
        max_retries: if cfg.max_retries == 0 {
            3
        } else {
            cfg.max_retries
        },
        retry_base_s: if cfg.retry_base_s <= 0.0 {
            2.0
        } else {
            cfg.retry_base_s
        },
        retry_max_s: if cfg.retry_max_s <= 0.0 {
            60.0
        } else {
            cfg.retry_max_s
        },
    }
}

pub fn compute_retry_delay(attempt: u32, settings: &WorkerSettings) -> Duration {
    let base = settings.retry_base_s.max(0.001);
    let delay = base * 2_f64.powi(attempt.min(30) as i32);
    Duration::from_secs_f64(delay.min(settings.retry_max_s.max(base)))
}

#[derive(Clone)]
pub struct JobQueue {
    sender: mpsc::Sender<MessengerJob>,
}

impl JobQueue {
    pub async fn enqueue(&self, messages: Vec<InboundMessage>) -> Result<String> {
        let job = MessengerJob::new(messages);
        let id = job.id.clone();
        self.sender
            .send(job)
            .await
            .map_err(|_| anyhow!("job queue is closed"))?;
        Ok(id)
    }
}

/// Starts the dispatch loop. It exits once every `JobQueue` handle is dropped.
pub fn start_worker_pool(
    handler: Arc<dyn JobHandler>,
    settings: WorkerSettings,
) -> (JobQueue, JoinHandle<()>) {
    let (sender, receiver) = mpsc::channel(settings.queue_capacity.max(1));
    let retry_sender = sender.downgrade();
    let handle = tokio::spawn(run_dispatch_loop(receiver, retry_sender, handler, settings));
    (JobQueue { sender }, handle)
}

async fn run_dispatch_loop(
    mut receiver: mpsc::Receiver<MessengerJob>,
    retry_sender: mpsc::WeakSender<MessengerJob>,
    handler: Arc<dyn JobHandler>,
    settings: WorkerSettings,
) {
    let semaphore = Arc::new(Semaphore::new(settings.max_concurrency.max(1)));
    let settings = Arc::new(settings);
    info!(
        "worker pool started: max_concurrency={}, queue_capacity={}",
        settings.max_concurrency, settings.queue_capacity
    );
    while let Some(job) = receiver.recv().await {
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let handler = handler.clone();
        let retry_sender = retry_sender.clone();
        let settings = settings.clone();
        tokio::spawn(async move {
            let _permit = permit;
            process_job(job, handler.as_ref(), retry_sender, &settings).await;
        });
    }
    info!("worker pool stopped");
}

async fn process_job(
    job: MessengerJob,
    handler: &dyn JobHandler,
    retry_sender: mpsc::WeakSender<MessengerJob>,
    settings: &WorkerSettings,
) {
    debug!(
        "job started: id={}, attempt={}, messages={}",
        job.id,
        job.attempt,
        job.messages.len()
    );
    let mut failed = Vec::new();
    for message in &job.messages {
        if let Err(err) = handler.handle_message(message).await {
            if is_retryable(&err) {
                warn!(
                    "message failed, will retry: job={}, sender={}, page_id={}, error={err}",
                    job.id, message.sender_id, message.page_id
                );
                failed.push(message.clone());
            } else {
                error!(
                    "message dropped: job={}, sender={}, page_id={}, error={err}",
                    job.id, message.sender_id, message.page_id
                );
            }
        }
    }
    if failed.is_empty() {
        return;
    }
    if job.attempt >= settings.max_retries {
        error!(
            "job dropped after {} retries: id={}, messages={}",
            job.attempt,
            job.id,
            failed.len()
        );
        return;
    }
    let delay = compute_retry_delay(job.attempt, settings);
    let retry = MessengerJob {
        id: job.id,
        messages: failed,
        attempt: job.attempt + 1,
    };
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let Some(sender) = retry_sender.upgrade() else {
            warn!("job queue closed, retry discarded: id={}", retry.id);
            return;
        };
        if sender.send(retry).await.is_err() {
            warn!("job queue closed, retry discarded");
        }
    });
}
