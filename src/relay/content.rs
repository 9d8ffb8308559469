// Content parts: the unit submitted to a thread, either text or an image reference.
use crate::channels::{AttachmentKind, InboundMessage};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

/// Wire form: `{"type":"text","text":..}` or `{"type":"image_url","image_url":{"url":..}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

impl ContentPart {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text { text: value.into() }
    }

    pub fn image(url: impl Into<String>) -> Self {
        Self::ImageUrl {
            image_url: ImageUrl { url: url.into() },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decomposed {
    pub parts: Vec<ContentPart>,
    pub rejected: Vec<AttachmentKind>,
}

impl Decomposed {
    pub fn has_rejected(&self) -> bool {
        !self.rejected.is_empty()
    }
}

/// Text first, then images in platform order. Anything that is not an image
/// with a URL is rejected and never reaches the backend.
pub fn decompose(message: &InboundMessage) -> Decomposed {
    let mut decomposed = Decomposed::default();
    if let Some(text) = message.text.as_deref() {
        if !text.trim().is_empty() {
            decomposed.parts.push(ContentPart::text(text));
        }
    }
    for attachment in &message.attachments {
        let url = attachment
            .url
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty());
        match (&attachment.kind, url) {
            (AttachmentKind::Image, Some(url)) => decomposed.parts.push(ContentPart::image(url)),
            (kind, _) => decomposed.rejected.push(kind.clone()),
        }
    }
    decomposed
}
