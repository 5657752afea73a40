//! Parrot IPC
//!
//! Event bus between transport adapters and the core turn pipeline. The core
//! never touches a transport SDK; it only consumes inbound envelopes and
//! publishes outbound messages through this seam.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

fn generate_envelope_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn default_schema_version() -> u16 {
    1
}

fn default_envelope_id() -> String {
    generate_envelope_id()
}

/// Chat kind as the admission gate sees it. Transport-specific variants
/// (supergroup, channel) collapse onto `Group`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    #[default]
    Private,
    Group,
}

impl ChatKind {
    pub fn from_transport(raw: &str) -> Self {
        match raw {
            "group" | "supergroup" | "channel" => ChatKind::Group,
            _ => ChatKind::Private,
        }
    }
}

/// Remote attachment descriptor. Input only, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    #[serde(default)]
    pub mime: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(default = "default_schema_version")]
    pub schema_version: u16,
    #[serde(default = "default_envelope_id")]
    pub id: String,
    pub channel: String,
    pub chat_id: String,
    #[serde(default)]
    pub message_id: Option<i64>,
    pub from: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub chat_kind: ChatKind,
    #[serde(default)]
    pub text: String,
    /// True when the message is a direct reply to a message this bot sent.
    #[serde(default)]
    pub is_reply_to_self: bool,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl InboundMessage {
    pub fn new(channel: &str, chat_id: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            schema_version: default_schema_version(),
            id: generate_envelope_id(),
            channel: channel.to_string(),
            chat_id: chat_id.into(),
            message_id: None,
            from: from.into(),
            username: None,
            chat_kind: ChatKind::Private,
            text: String::new(),
            is_reply_to_self: false,
            attachments: Vec::new(),
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_chat_kind(mut self, kind: ChatKind) -> Self {
        self.chat_kind = kind;
        self
    }

    pub fn with_message_id(mut self, message_id: i64) -> Self {
        self.message_id = Some(message_id);
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }
}

#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub text: String,
    pub reply_to: Option<i64>,
    pub edit_message_id: Option<i64>,
    pub inline_keyboard: Option<Vec<Vec<InlineButton>>>,
    /// Chat action such as "typing"; when set, no text is sent.
    pub chat_action: Option<String>,
}

impl OutboundMessage {
    pub fn text(channel: &str, chat_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            channel: channel.to_string(),
            chat_id: chat_id.into(),
            text: text.into(),
            reply_to: None,
            edit_message_id: None,
            inline_keyboard: None,
            chat_action: None,
        }
    }

    /// Replace the text of an already-sent message instead of posting a new
    /// one. Used for in-place status updates.
    pub fn edit(
        channel: &str,
        chat_id: impl Into<String>,
        message_id: i64,
        text: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.to_string(),
            chat_id: chat_id.into(),
            text: text.into(),
            reply_to: None,
            edit_message_id: Some(message_id),
            inline_keyboard: None,
            chat_action: None,
        }
    }

    pub fn typing(channel: &str, chat_id: impl Into<String>) -> Self {
        Self {
            channel: channel.to_string(),
            chat_id: chat_id.into(),
            text: String::new(),
            reply_to: None,
            edit_message_id: None,
            inline_keyboard: None,
            chat_action: Some("typing".to_string()),
        }
    }

    pub fn with_reply_to(mut self, message_id: i64) -> Self {
        self.reply_to = Some(message_id);
        self
    }

    pub fn with_keyboard(mut self, keyboard: Vec<Vec<InlineButton>>) -> Self {
        self.inline_keyboard = Some(keyboard);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InlineButton {
    pub text: String,
    pub url: String,
}

pub const EVENT_BUS_CAPACITY: usize = 256;
pub const OUTBOUND_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    inbound: broadcast::Sender<InboundMessage>,
    outbound: broadcast::Sender<OutboundMessage>,
}

impl EventBus {
    pub fn new() -> Self {
        let (inbound_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let (outbound_tx, _) = broadcast::channel(OUTBOUND_CAPACITY);

        Self {
            inbound: inbound_tx,
            outbound: outbound_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InboundMessage> {
        self.inbound.subscribe()
    }

    pub fn publish(&self, message: InboundMessage) -> anyhow::Result<()> {
        self.inbound.send(message)?;
        Ok(())
    }

    pub fn send_outbound(&self, message: OutboundMessage) -> anyhow::Result<()> {
        self.outbound.send(message)?;
        Ok(())
    }

    pub fn outbound_subscribe(&self) -> broadcast::Receiver<OutboundMessage> {
        self.outbound.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
