// Function call registry: named handlers the assistant can invoke during a run.
use crate::channels::OutboundDelivery;
use crate::relay::context::ConversationContext;
use crate::relay::error::RelayError;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

pub const SEND_ATTACHMENT_FUNCTION: &str = "sendAttachment";

#[async_trait]
pub trait FunctionHandler: Send + Sync {
    fn name(&self) -> &'static str;
    async fn handle(&self, args: Value, context: &ConversationContext) -> Result<Value>;
}

#[derive(Clone, Default)]
pub struct FunctionRegistry {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn FunctionHandler>>>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_replace(&self, handler: Arc<dyn FunctionHandler>) {
        let key = handler.name().trim().to_string();
        if key.is_empty() {
            return;
        }
        self.handlers.write().insert(key, handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn FunctionHandler>> {
        self.handlers.read().get(name.trim()).cloned()
    }

    pub async fn invoke(
        &self,
        name: &str,
        args: Value,
        context: &ConversationContext,
    ) -> Result<Value> {
        let handler = self
            .get(name)
            .ok_or_else(|| RelayError::unknown_function(name))?;
        handler.handle(args, context).await
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendAttachmentArgs {
    attachment_type: String,
    attachment_url: String,
}

/// Sends a media attachment to the user. Reports `"success"` or `"fail"` back to the run.
pub struct SendAttachmentFunction {
    delivery: Arc<dyn OutboundDelivery>,
}

impl SendAttachmentFunction {
    pub fn new(delivery: Arc<dyn OutboundDelivery>) -> Self {
        Self { delivery }
    }
}

#[async_trait]
impl FunctionHandler for SendAttachmentFunction {
    fn name(&self) -> &'static str {
        SEND_ATTACHMENT_FUNCTION
    }

    async fn handle(&self, args: Value, context: &ConversationContext) -> Result<Value> {
        let args: SendAttachmentArgs = serde_json::from_value(args)
            .map_err(|err| anyhow!("invalid {SEND_ATTACHMENT_FUNCTION} arguments: {err}"))?;
        let result = self
            .delivery
            .send_attachment(
                &context.access_token,
                &context.user_channel_id,
                args.attachment_type.trim(),
                args.attachment_url.trim(),
            )
            .await;
        match result {
            Ok(()) => Ok(json!("success")),
            Err(err) => {
                warn!(
                    "send attachment failed: recipient={}, error={err}",
                    context.user_channel_id
                );
                Ok(json!("fail"))
            }
        }
    }
}

pub fn build_default_function_registry(delivery: Arc<dyn OutboundDelivery>) -> FunctionRegistry {
    let registry = FunctionRegistry::new();
    registry.register_replace(Arc::new(SendAttachmentFunction::new(delivery)));
    registry
}
