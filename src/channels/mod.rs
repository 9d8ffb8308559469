pub mod messenger;
pub mod types;

pub use messenger::{MessengerSendApi, OutboundDelivery, SenderAction};
pub use types::{AttachmentKind, InboundAttachment, InboundMessage};
