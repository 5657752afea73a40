//! Parrot Telegram Adapter
//!
//! Telegram Bot API long-polling with offset persistence, client recreation,
//! inline URL keyboards, and message chunking. Maps Telegram updates onto the
//! transport-neutral envelopes the core consumes.

use anyhow::{anyhow, Result};
use parrot_config::TelegramConfig;
use parrot_ipc::{Attachment, ChatKind, EventBus, InboundMessage, InlineButton, OutboundMessage};
use reqwest::{Client, ClientBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::sync::broadcast;
use tracing::{info, warn};

const TELEGRAM_MAX_MESSAGE_LEN: usize = 4096;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    pub message: Option<TelegramMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    pub text: Option<String>,
    pub caption: Option<String>,
    #[serde(default)]
    pub photo: Option<Vec<TelegramPhotoSize>>,
    #[serde(default)]
    pub document: Option<TelegramDocument>,
    #[serde(default)]
    pub video: Option<TelegramVideo>,
    #[serde(default)]
    pub voice: Option<TelegramVoice>,
    #[serde(default)]
    pub audio: Option<TelegramAudio>,
    pub chat: TelegramChat,
    pub from: Option<TelegramUser>,
    #[serde(default)]
    pub reply_to_message: Option<Box<TelegramReplyToMessage>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramPhotoSize {
    pub file_id: String,
    pub width: i64,
    pub height: i64,
    #[serde(default)]
    pub file_size: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramDocument {
    pub file_id: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_size: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramVideo {
    pub file_id: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub file_size: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramVoice {
    pub file_id: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub duration: Option<i64>,
    #[serde(default)]
    pub file_size: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramAudio {
    pub file_id: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_size: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
    #[serde(rename = "type")]
    pub chat_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    #[serde(default)]
    pub is_bot: Option<bool>,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramReplyToMessage {
    pub message_id: i64,
    pub from: Option<TelegramUser>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: T,
}

#[derive(Debug, Deserialize)]
struct TelegramFile {
    file_path: Option<String>,
}

pub struct TelegramAdapter {
    client: Client,
    bot_token: String,
    allowed_chats: Option<HashSet<i64>>,
    api_url: String,
    data_dir: PathBuf,
    poll_timeout_secs: u64,
    client_recreate_interval_secs: u64,
    /// Resolved via getMe at poll start; reply-to-self detection needs it.
    self_id: tokio::sync::OnceCell<i64>,
    event_bus: Option<EventBus>,
}

impl TelegramAdapter {
    pub fn new(config: &TelegramConfig, data_dir: PathBuf) -> Self {
        let api_url = format!("https://api.telegram.org/bot{}", config.bot_token);
        let allowed_chats = config
            .allowed_chats
            .clone()
            .map(|items| items.into_iter().collect());
        let client = Self::build_client();

        Self {
            client,
            bot_token: config.bot_token.clone(),
            allowed_chats,
            api_url,
            data_dir,
            poll_timeout_secs: config.poll_timeout_secs.unwrap_or(60),
            client_recreate_interval_secs: config.client_recreate_interval_secs.unwrap_or(600),
            self_id: tokio::sync::OnceCell::new(),
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    fn build_client() -> Client {
        ClientBuilder::new()
            .pool_idle_timeout(Duration::from_secs(600))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .timeout(Duration::from_secs(180))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default()
    }

    fn offset_path(&self) -> PathBuf {
        let runtime_dir = self.data_dir.join("runtime");
        let _ = std::fs::create_dir_all(&runtime_dir);
        let bot_id = self.bot_token.split(':').next().unwrap_or("default");
        runtime_dir.join(format!("telegram.{}.offset", bot_id))
    }

    fn is_chat_allowed(&self, chat_id: i64) -> bool {
        self.allowed_chats
            .as_ref()
            .is_none_or(|allowed| allowed.contains(&chat_id))
    }

    async fn read_offset(&self) -> Option<i64> {
        let p = self.offset_path();
        match fs::read_to_string(&p).await {
            Ok(content) => content.trim().parse().ok(),
            Err(_) => None,
        }
    }

    async fn write_offset(&self, offset: i64) {
        let p = self.offset_path();
        if let Some(parent) = p.parent() {
            let _ = fs::create_dir_all(parent).await;
        }
        let _ = fs::write(&p, format!("{}\n", offset)).await;
    }

    async fn resolve_self_id(&self, client: &Client) -> Option<i64> {
        self.self_id
            .get_or_try_init(|| async {
                let url = format!("{}/getMe", self.api_url);
                let resp = client
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| anyhow!("telegram getMe request failed: {}", e))?;
                let parsed: ApiResponse<TelegramUser> = resp
                    .json()
                    .await
                    .map_err(|e| anyhow!("telegram getMe decode failed: {}", e))?;
                if !parsed.ok {
                    return Err(anyhow!("telegram getMe returned ok=false"));
                }
                Ok::<i64, anyhow::Error>(parsed.result.id)
            })
            .await
            .ok()
            .copied()
    }

    pub async fn get_updates(
        &self,
        client: &Client,
        offset: Option<i64>,
    ) -> Result<Vec<TelegramUpdate>> {
        let url = format!("{}/getUpdates", self.api_url);

        let mut payload = serde_json::json!({
            "timeout": self.poll_timeout_secs,
            "allowed_updates": ["message"],
        });

        if let Some(offset) = offset {
            payload["offset"] = serde_json::json!(offset);
        }

        let resp = client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| anyhow!("telegram getUpdates request failed: {}", e))?
            .error_for_status()
            .map_err(|e| anyhow!("telegram getUpdates HTTP error: {}", e))?;

        let parsed: ApiResponse<Vec<TelegramUpdate>> = resp
            .json()
            .await
            .map_err(|e| anyhow!("telegram getUpdates decode failed: {}", e))?;

        if !parsed.ok {
            return Err(anyhow!("telegram getUpdates returned ok=false"));
        }

        Ok(parsed.result)
    }

    /// Resolve a file_id to the direct download URL of the file API.
    async fn file_url(&self, file_id: &str) -> Result<String> {
        let url = format!("{}/getFile", self.api_url);
        let payload = serde_json::json!({ "file_id": file_id });

        let resp = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| anyhow!("telegram getFile request failed: {}", e))?;

        let parsed: ApiResponse<TelegramFile> = resp
            .json()
            .await
            .map_err(|e| anyhow!("telegram getFile decode failed: {}", e))?;

        if !parsed.ok {
            return Err(anyhow!("telegram getFile returned ok=false"));
        }

        let file_path = parsed
            .result
            .file_path
            .ok_or_else(|| anyhow!("telegram getFile returned no file_path"))?;

        Ok(format!(
            "https://api.telegram.org/file/bot{}/{}",
            self.bot_token, file_path
        ))
    }

    pub async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        reply_to: Option<i64>,
        inline_keyboard: Option<Vec<Vec<InlineButton>>>,
    ) -> Result<()> {
        let chunks = chunk_message(text);

        for (i, chunk) in chunks.iter().enumerate() {
            let url = format!("{}/sendMessage", self.api_url);

            let mut payload = serde_json::json!({
                "chat_id": chat_id,
                "text": chunk,
                "parse_mode": "Markdown",
            });

            if let Some(reply_to_message_id) = reply_to {
                if i == 0 {
                    payload["reply_to_message_id"] = serde_json::json!(reply_to_message_id);
                }
            }

            if i == chunks.len() - 1 {
                if let Some(keyboard) = &inline_keyboard {
                    payload["reply_markup"] = serde_json::json!({
                        "inline_keyboard": keyboard.iter().map(|row| {
                            row.iter().map(|btn| serde_json::json!({
                                "text": btn.text,
                                "url": btn.url,
                            })).collect::<Vec<_>>()
                        }).collect::<Vec<_>>()
                    });
                }
            }

            self.send_with_markdown_fallback(&url, payload).await?;
        }

        Ok(())
    }

    pub async fn edit_message_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        inline_keyboard: Option<Vec<Vec<InlineButton>>>,
    ) -> Result<()> {
        // editMessageText cannot be split into chunks: fallback to a new message if too long.
        if text.chars().count() > TELEGRAM_MAX_MESSAGE_LEN {
            return self
                .send_message(chat_id, text, None, inline_keyboard)
                .await;
        }

        let url = format!("{}/editMessageText", self.api_url);

        let mut payload = serde_json::json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "text": text,
            "parse_mode": "Markdown",
        });

        if let Some(keyboard) = &inline_keyboard {
            payload["reply_markup"] = serde_json::json!({
                "inline_keyboard": keyboard.iter().map(|row| {
                    row.iter().map(|btn| serde_json::json!({
                        "text": btn.text,
                        "url": btn.url,
                    })).collect::<Vec<_>>()
                }).collect::<Vec<_>>()
            });
        }

        self.send_with_markdown_fallback(&url, payload).await
    }

    pub async fn send_chat_action(&self, chat_id: i64, action: &str) -> Result<()> {
        let url = format!("{}/sendChatAction", self.api_url);
        let payload = serde_json::json!({
            "chat_id": chat_id,
            "action": action,
        });
        let _ = self.client.post(&url).json(&payload).send().await;
        Ok(())
    }

    async fn send_with_markdown_fallback(
        &self,
        url: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        let endpoint = url.rsplit('/').next().unwrap_or("telegram");

        let first_resp = self
            .client
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| anyhow!("telegram {} request failed: {}", endpoint, e))?;

        if first_resp.status().is_success() {
            let parsed: ApiResponse<serde_json::Value> = first_resp
                .json()
                .await
                .map_err(|e| anyhow!("telegram {} decode failed: {}", endpoint, e))?;
            if parsed.ok {
                return Ok(());
            }
            warn!(
                "telegram {} returned ok=false with Markdown payload, retrying without parse_mode",
                endpoint
            );
        } else {
            let status = first_resp.status();
            let body = first_resp.text().await.unwrap_or_default();
            warn!(
                "telegram {} HTTP {} with Markdown payload, retrying without parse_mode: {}",
                endpoint, status, body
            );
        }

        let mut fallback_payload = payload;
        if let Some(obj) = fallback_payload.as_object_mut() {
            obj.remove("parse_mode");
        }

        let fallback_resp = self
            .client
            .post(url)
            .json(&fallback_payload)
            .send()
            .await
            .map_err(|e| anyhow!("telegram {} fallback request failed: {}", endpoint, e))?;

        if !fallback_resp.status().is_success() {
            let status = fallback_resp.status();
            let body = fallback_resp.text().await.unwrap_or_default();
            if is_reply_target_missing(&body) {
                let mut no_reply_payload = fallback_payload.clone();
                if remove_reply_to_message_id(&mut no_reply_payload) {
                    warn!(
                        "telegram {} fallback failed due to missing reply target; retrying without reply_to_message_id",
                        endpoint
                    );
                    return self
                        .send_without_reply_target(url, endpoint, no_reply_payload)
                        .await;
                }
            }
            return Err(anyhow!(
                "telegram {} fallback HTTP {}: {}",
                endpoint,
                status,
                body
            ));
        }

        let parsed: ApiResponse<serde_json::Value> = fallback_resp
            .json()
            .await
            .map_err(|e| anyhow!("telegram {} fallback decode failed: {}", endpoint, e))?;
        if !parsed.ok {
            return Err(anyhow!("telegram {} fallback returned ok=false", endpoint));
        }

        Ok(())
    }

    async fn send_without_reply_target(
        &self,
        url: &str,
        endpoint: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        let resp = self
            .client
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| anyhow!("telegram {} no-reply retry request failed: {}", endpoint, e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!(
                "telegram {} no-reply retry HTTP {}: {}",
                endpoint,
                status,
                body
            ));
        }

        let parsed: ApiResponse<serde_json::Value> = resp
            .json()
            .await
            .map_err(|e| anyhow!("telegram {} no-reply retry decode failed: {}", endpoint, e))?;
        if !parsed.ok {
            return Err(anyhow!(
                "telegram {} no-reply retry returned ok=false",
                endpoint
            ));
        }

        Ok(())
    }

    pub async fn poll(&self) -> Result<()> {
        let mut offset: Option<i64> = self.read_offset().await;

        info!(offset = ?offset, "Telegram polling started");

        let mut client = self.client.clone();
        let mut client_recreate_at =
            Instant::now() + Duration::from_secs(self.client_recreate_interval_secs);

        match self.resolve_self_id(&client).await {
            Some(id) => info!(bot_id = id, "Telegram identity resolved"),
            None => warn!("Failed to resolve bot identity; reply detection degraded"),
        }

        if let Err(err) = self.sync_bot_commands(&client).await {
            warn!("Failed to sync Telegram bot commands: {}", err);
        }

        loop {
            if Instant::now() >= client_recreate_at {
                info!("Recreating HTTP client to prevent stale connections");
                client = Self::build_client();
                client_recreate_at =
                    Instant::now() + Duration::from_secs(self.client_recreate_interval_secs);
            }

            let updates = match self.get_updates(&client, offset).await {
                Ok(v) => v,
                Err(err) => {
                    warn!("Telegram polling error: {}", err);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    continue;
                }
            };

            for update in updates {
                offset = Some(update.update_id + 1);
                self.write_offset(update.update_id + 1).await;

                if let Some(message) = &update.message {
                    self.handle_message(message).await;
                }
            }
        }
    }

    async fn sync_bot_commands(&self, client: &Client) -> Result<()> {
        let url = format!("{}/setMyCommands", self.api_url);
        let payload = serde_json::json!({
            "commands": [
                { "command": "start", "description": "Introduction and contacts" },
                { "command": "stats", "description": "Usage and uptime" },
            ]
        });

        let resp = client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| anyhow!("telegram setMyCommands request failed: {}", e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("telegram setMyCommands HTTP {}: {}", status, body));
        }

        Ok(())
    }

    async fn handle_message(&self, message: &TelegramMessage) {
        let chat_id = message.chat.id;

        if !self.is_chat_allowed(chat_id) {
            info!("Skipping message from unauthorized chat {}", chat_id);
            return;
        }

        // Messages from other bots never enter the pipeline.
        if message
            .from
            .as_ref()
            .and_then(|u| u.is_bot)
            .unwrap_or(false)
        {
            return;
        }

        let Some(event_bus) = &self.event_bus else {
            info!("No event bus configured, message not forwarded");
            return;
        };

        let text = message
            .text
            .clone()
            .or_else(|| message.caption.clone())
            .unwrap_or_default();

        let is_reply_to_self = match (self.self_id.get(), &message.reply_to_message) {
            (Some(self_id), Some(reply)) => reply
                .from
                .as_ref()
                .map(|u| u.id == *self_id)
                .unwrap_or(false),
            _ => false,
        };

        let attachments = self.resolve_attachments(message).await;

        if text.is_empty() && attachments.is_empty() {
            return;
        }

        let from_id = message
            .from
            .as_ref()
            .map(|u| u.id.to_string())
            .unwrap_or_default();
        let username = message.from.as_ref().and_then(|u| u.username.clone());

        let mut inbound = InboundMessage::new("telegram", chat_id.to_string(), from_id)
            .with_text(text)
            .with_chat_kind(ChatKind::from_transport(&message.chat.chat_type))
            .with_message_id(message.message_id)
            .with_attachments(attachments);
        inbound.username = username;
        inbound.is_reply_to_self = is_reply_to_self;

        if let Err(e) = event_bus.publish(inbound) {
            warn!("Failed to publish message to event bus: {}", e);
        }
    }

    /// Turn the message's media references into downloadable attachments.
    /// A failed getFile drops that attachment with a warning; the message
    /// itself still goes through.
    async fn resolve_attachments(&self, message: &TelegramMessage) -> Vec<Attachment> {
        let mut refs: Vec<(&str, Option<String>)> = Vec::new();

        if let Some(best) = best_photo(message) {
            refs.push((best.file_id.as_str(), Some("image/jpeg".to_string())));
        }
        if let Some(voice) = &message.voice {
            refs.push((voice.file_id.as_str(), voice.mime_type.clone()));
        }
        if let Some(audio) = &message.audio {
            refs.push((audio.file_id.as_str(), audio.mime_type.clone()));
        }
        if let Some(video) = &message.video {
            refs.push((video.file_id.as_str(), video.mime_type.clone()));
        }
        if let Some(document) = &message.document {
            refs.push((document.file_id.as_str(), document.mime_type.clone()));
        }

        let mut attachments = Vec::with_capacity(refs.len());
        for (file_id, mime) in refs {
            match self.file_url(file_id).await {
                Ok(url) => attachments.push(Attachment { url, mime }),
                Err(err) => warn!(file_id, error = %err, "Failed to resolve attachment URL"),
            }
        }
        attachments
    }

    pub async fn run_outbound_handler(&self, mut receiver: broadcast::Receiver<OutboundMessage>) {
        info!("Telegram outbound handler started");

        loop {
            match receiver.recv().await {
                Ok(msg) => {
                    if msg.channel != "telegram" {
                        continue;
                    }

                    let chat_id: i64 = match msg.chat_id.parse() {
                        Ok(id) => id,
                        Err(_) => {
                            warn!(chat_id = %msg.chat_id, "Outbound chat_id is not numeric, dropping");
                            continue;
                        }
                    };

                    if let Some(action) = &msg.chat_action {
                        if let Err(e) = self.send_chat_action(chat_id, action).await {
                            warn!("Failed to send chat action: {}", e);
                        }
                        continue;
                    }

                    let send_result = if let Some(message_id) = msg.edit_message_id {
                        self.edit_message_text(chat_id, message_id, &msg.text, msg.inline_keyboard)
                            .await
                    } else {
                        self.send_message(chat_id, &msg.text, msg.reply_to, msg.inline_keyboard)
                            .await
                    };

                    if let Err(e) = send_result {
                        warn!("Failed to send outbound message: {}", e);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Telegram outbound handler stopped: channel closed");
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        "Telegram outbound handler lagged; skipped {} messages",
                        skipped
                    );
                }
            }
        }
    }
}

/// Largest photo variant of the message, by pixel area.
fn best_photo(message: &TelegramMessage) -> Option<&TelegramPhotoSize> {
    message
        .photo
        .as_ref()?
        .iter()
        .max_by_key(|item| item.width.saturating_mul(item.height))
}

fn remove_reply_to_message_id(payload: &mut serde_json::Value) -> bool {
    payload
        .as_object_mut()
        .map(|obj| obj.remove("reply_to_message_id").is_some())
        .unwrap_or(false)
}

fn is_reply_target_missing(body: &str) -> bool {
    body.to_ascii_lowercase()
        .contains("message to be replied not found")
}

fn chunk_message(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= TELEGRAM_MAX_MESSAGE_LEN {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < chars.len() {
        let mut end = (start + TELEGRAM_MAX_MESSAGE_LEN).min(chars.len());

        if end < chars.len() {
            let mut split = end;
            for i in (start..end).rev() {
                let c = chars[i];
                if c == '\n' || c == ' ' || c == '.' || c == '!' || c == '?' {
                    split = i + 1;
                    break;
                }
            }
            if split > start {
                end = split;
            }
        }

        chunks.push(chars[start..end].iter().collect::<String>());
        start = end;
    }

    chunks
}
