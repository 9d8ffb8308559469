// Messenger platform: webhook parsing, signature checks and the Send API client.
use crate::channels::types::{AttachmentKind, InboundAttachment, InboundMessage};
use crate::config::MessengerConfig;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";
const DEFAULT_GRAPH_API_BASE: &str = "https://graph.facebook.com";
const DEFAULT_API_VERSION: &str = "v20.0";
pub const DEFAULT_MAX_TEXT_CHARS: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderAction {
    MarkSeen,
    TypingOn,
}

impl SenderAction {
    pub fn as_str(self) -> &'static str {
        match self {
            SenderAction::MarkSeen => "mark_seen",
            SenderAction::TypingOn => "typing_on",
        }
    }
}

/// Outbound side of the platform. Every call carries the page access token.
#[async_trait]
pub trait OutboundDelivery: Send + Sync {
    async fn send_text(&self, access_token: &str, recipient_id: &str, text: &str) -> Result<()>;
    async fn send_attachment(
        &self,
        access_token: &str,
        recipient_id: &str,
        attachment_type: &str,
        url: &str,
    ) -> Result<()>;
    async fn send_action(
        &self,
        access_token: &str,
        recipient_id: &str,
        action: SenderAction,
    ) -> Result<()>;
}

pub fn is_page_payload(payload: &Value) -> bool {
    payload
        .get("object")
        .and_then(Value::as_str)
        .map(|value| value == "page")
        .unwrap_or(false)
}

/// Collects user messages from a webhook body. Delivery, read and echo events are skipped.
pub fn extract_inbound_messages(payload: &Value) -> Result<Vec<InboundMessage>> {
    let entries = payload
        .get("entry")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("invalid messenger payload: missing entry"))?;
    let mut items = Vec::new();
    for entry in entries {
        let Some(events) = entry.get("messaging").and_then(Value::as_array) else {
            continue;
        };
        for event in events {
            let Some(message) = event.get("message") else {
                continue;
            };
            if message
                .get("is_echo")
                .and_then(Value::as_bool)
                .unwrap_or(false)
            {
                continue;
            }
            let sender_id = string_at(event, &["sender", "id"]);
            let page_id = string_at(event, &["recipient", "id"])
                .or_else(|| entry.get("id").and_then(Value::as_str).map(str::to_string));
            let (Some(sender_id), Some(page_id)) = (sender_id, page_id) else {
                continue;
            };
            let attachments = message
                .get("attachments")
                .and_then(Value::as_array)
                .map(|items| items.iter().map(parse_attachment).collect())
                .unwrap_or_default();
            items.push(InboundMessage {
                sender_id,
                page_id,
                mid: message
                    .get("mid")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                text: message
                    .get("text")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                attachments,
                timestamp: event.get("timestamp").and_then(Value::as_i64),
            });
        }
    }
    Ok(items)
}

fn string_at(value: &Value, path: &[&str]) -> Option<String> {
    let mut current = value;
    for key in path {
        current = current.get(*key)?;
    }
    let text = match current {
        Value::String(text) => text.trim().to_string(),
        Value::Number(num) => num.to_string(),
        _ => return None,
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn parse_attachment(raw: &Value) -> InboundAttachment {
    let kind = AttachmentKind::parse(raw.get("type").and_then(Value::as_str).unwrap_or(""));
    let url = raw
        .get("payload")
        .and_then(|payload| payload.get("url"))
        .and_then(Value::as_str)
        .map(str::to_string);
    InboundAttachment { kind, url }
}

/// Checks `X-Hub-Signature-256` (`sha256=<hex>`) against the raw body.
pub fn verify_signature(body: &[u8], signature: &str, app_secret: &str) -> bool {
    let signature = signature
        .trim()
        .strip_prefix("sha256=")
        .unwrap_or(signature)
        .trim();
    let expected = match hex::decode(signature) {
        Ok(value) => value,
        Err(_) => return false,
    };
    let mut mac = match HmacSha256::new_from_slice(app_secret.as_bytes()) {
        Ok(value) => value,
        Err(_) => return false,
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Splits on character boundaries; the platform rejects longer text messages.
pub fn split_text(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = if max_chars == 0 {
        DEFAULT_MAX_TEXT_CHARS
    } else {
        max_chars
    };
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }
    chars
        .chunks(max_chars)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

#[derive(Clone)]
pub struct MessengerSendApi {
    http: Client,
    endpoint: String,
}

impl MessengerSendApi {
    pub fn new(http: Client, config: &MessengerConfig) -> Self {
        let base = config
            .graph_api_base
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_GRAPH_API_BASE)
            .trim_end_matches('/')
            .to_string();
        let version = config
            .api_version
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_API_VERSION);
        Self {
            http,
            endpoint: format!("{base}/{version}/me/messages"),
        }
    }

    async fn post(&self, access_token: &str, payload: Value) -> Result<()> {
        let response = self
            .http
            .post(&self.endpoint)
            .query(&[("access_token", access_token)])
            .json(&payload)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(anyhow!("messenger outbound failed: {status} {body}"))
        }
    }
}

#[async_trait]
impl OutboundDelivery for MessengerSendApi {
    async fn send_text(&self, access_token: &str, recipient_id: &str, text: &str) -> Result<()> {
        debug!("messenger send text: recipient={recipient_id}, chars={}", text.chars().count());
        self.post(
            access_token,
            json!({
                "recipient": { "id": recipient_id },
                "messaging_type": "RESPONSE",
                "message": { "text": text },
            }),
        )
        .await
    }

    async fn send_attachment(
        &self,
        access_token: &str,
        recipient_id: &str,
        attachment_type: &str,
        url: &str,
    ) -> Result<()> {
        debug!("messenger send attachment: recipient={recipient_id}, type={attachment_type}");
        self.post(
            access_token,
            json!({
                "recipient": { "id": recipient_id },
                "messaging_type": "RESPONSE",
                "message": {
                    "attachment": {
                        "type": attachment_type,
                        "payload": { "url": url, "is_reusable": true },
                    }
                },
            }),
        )
        .await
    }

    async fn send_action(
        &self,
        access_token: &str,
        recipient_id: &str,
        action: SenderAction,
    ) -> Result<()> {
        self.post(
            access_token,
            json!({
                "recipient": { "id": recipient_id },
                "sender_action": action.as_str(),
            }),
        )
        .await
    }
}
