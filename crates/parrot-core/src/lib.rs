//! Parrot Core
//!
//! The turn pipeline: admission, media resolution, context assembly, model
//! call, persistence. One inbound message is one independent unit of work;
//! store mutations for a chat are serialized behind a per-chat lock.

mod admission;
mod commands;
mod context;

pub use admission::AdmissionGate;
pub use context::build_context;

use anyhow::Result;
use parrot_config::Config;
use parrot_gateway::CompletionBackend;
use parrot_ipc::{Attachment, EventBus, InboundMessage, OutboundMessage};
use parrot_media::{MediaDescriber, MediaFetcher, MediaKind};
use parrot_store::{ConversationStore, ConversationTurn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub const DEFAULT_PERSONA: &str = "You are Parrot, a concise and friendly assistant. \
Keep replies short (1-3 sentences) unless the user asks for depth. \
The system feeds you descriptions of media the user uploads, marked as [audio], \
[image], [video] or [document]; react to the content directly instead of \
mentioning the markers. If you cannot do something, say so plainly.";

pub const CLARIFY_REPLY: &str =
    "Could you give me a bit more detail? A couple of extra words help a lot.";

const MODEL_APOLOGY_PREFIX: &str = "Sorry, I could not get an answer from the model:";

const DOWNLOAD_FAILED_MARKER: &str = "[could not download media]";
const UNSUPPORTED_MEDIA_MARKER: &str = "[unsupported media type]";

const QUESTION_WORDS: &[&str] = &["what", "why", "how", "when", "where", "who"];

/// Outcome of the pre-model triage step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnAction {
    /// Too sparse to answer; reply with the fixed nudge, skip the model.
    Clarify,
    Answer,
}

/// Inputs of two or fewer whitespace-separated tokens route to Clarify.
/// Longer inputs answer, with a question word within the first five tokens
/// short-circuiting the decision.
pub fn triage(text: &str) -> TurnAction {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.len() <= 2 {
        return TurnAction::Clarify;
    }
    let is_question = tokens.iter().take(5).any(|t| {
        QUESTION_WORDS.contains(&t.to_lowercase().trim_matches(|c: char| !c.is_alphanumeric()))
    });
    if is_question {
        return TurnAction::Answer;
    }
    TurnAction::Answer
}

pub struct TurnOrchestrator {
    gate: AdmissionGate,
    store: Mutex<ConversationStore>,
    chat_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    backend: Arc<dyn CompletionBackend>,
    fetcher: MediaFetcher,
    describer: MediaDescriber,
    bus: EventBus,
    persona: String,
    history_window: usize,
    max_tokens: u32,
    stats_probe: bool,
    contacts: parrot_config::ContactsConfig,
    started_at: Instant,
}

impl TurnOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &Config,
        bot_handle: &str,
        store: ConversationStore,
        backend: Arc<dyn CompletionBackend>,
        fetcher: MediaFetcher,
        describer: MediaDescriber,
        bus: EventBus,
    ) -> Result<Self> {
        let gate = AdmissionGate::new(
            bot_handle,
            config.core.trigger_phrase.clone(),
            config.core.trigger_keyword.clone(),
        )?;
        let persona = config
            .persona
            .system_prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_PERSONA.to_string());

        Ok(Self {
            gate,
            store: Mutex::new(store),
            chat_locks: Mutex::new(HashMap::new()),
            backend,
            fetcher,
            describer,
            bus,
            persona,
            history_window: config.core.history_window,
            max_tokens: config.core.max_tokens,
            stats_probe: config
                .telegram
                .as_ref()
                .map(|t| t.stats_probe)
                .unwrap_or(false),
            contacts: config.contacts.clone(),
            started_at: Instant::now(),
        })
    }

    /// Consume inbound messages until the bus closes, one spawned task per
    /// message so slow turns in one chat never stall another.
    pub async fn run(self: Arc<Self>) {
        let mut inbound = self.bus.subscribe();
        info!("Turn pipeline started");

        loop {
            match inbound.recv().await {
                Ok(message) => {
                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Some(reply) = this.process(&message).await {
                            if let Err(err) = this.bus.send_outbound(reply) {
                                warn!("Failed to publish reply: {}", err);
                            }
                        }
                    });
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    info!("Turn pipeline stopped: bus closed");
                    break;
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Turn pipeline lagged; skipped {} messages", skipped);
                }
            }
        }
    }

    /// One full request/response cycle. `None` means the gate declined and
    /// nothing further happened.
    pub async fn process(&self, message: &InboundMessage) -> Option<OutboundMessage> {
        if !self
            .gate
            .should_respond(message.chat_kind, &message.text, message.is_reply_to_self)
        {
            debug!(chat_id = %message.chat_id, "Message rejected by admission gate");
            return None;
        }

        let text = self.gate.clean_text(&message.text);

        // Every admitted chat counts as a seen user, not just /start.
        self.remember_chat(&message.chat_id).await;

        if let Some(reply) = self.handle_command(&text, message).await {
            return Some(reply);
        }

        // Attachments carry their own content; sparse text alone is not a
        // reason to nudge when media came with it.
        if message.attachments.is_empty() && triage(&text) == TurnAction::Clarify {
            debug!(chat_id = %message.chat_id, "Turn routed to clarify");
            return Some(self.reply_to(message, CLARIFY_REPLY.to_string()));
        }

        // Typing indicator while the turn is in flight; best-effort.
        let _ = self
            .bus
            .send_outbound(OutboundMessage::typing(&message.channel, &message.chat_id));

        let summaries = self.resolve_attachments(&message.attachments).await;

        // Per-chat critical section: read-history, model call and append must
        // not interleave with another turn for the same chat.
        let lock = self.chat_lock(&message.chat_id).await;
        let outcome = {
            let _guard = lock.lock().await;

            let recent = {
                let store = self.store.lock().await;
                store
                    .recent_history(&message.chat_id, self.history_window)
                    .to_vec()
            };

            let context = build_context(&self.persona, &recent, &summaries, &text);

            match self.backend.complete(context, self.max_tokens).await {
                Ok(reply) => {
                    self.persist_turn(&message.chat_id, &text, &reply).await;
                    Some(self.reply_to(message, reply))
                }
                Err(err) => {
                    // An errored model call must never pollute future context.
                    warn!(chat_id = %message.chat_id, error = %err, "Model call failed; history unchanged");
                    Some(self.reply_to(message, format!("{} {}", MODEL_APOLOGY_PREFIX, err)))
                }
            }
        };
        self.release_chat_lock(&message.chat_id, &lock).await;
        outcome
    }

    /// Record the chat in the user registry on first contact.
    async fn remember_chat(&self, chat_id: &str) {
        let mut store = self.store.lock().await;
        if store.register_user(chat_id) {
            info!(chat_id = %chat_id, "Registered new user");
            if let Err(err) = store.save() {
                warn!("Failed to persist user registration: {}", err);
            }
        }
    }

    async fn handle_command(
        &self,
        text: &str,
        message: &InboundMessage,
    ) -> Option<OutboundMessage> {
        let command = text.split_whitespace().next()?;
        match command {
            "/start" => {
                let mut reply = self.reply_to(message, commands::WELCOME_TEXT.to_string());
                let keyboard = commands::start_keyboard(&self.contacts);
                if !keyboard.is_empty() {
                    reply = reply.with_keyboard(keyboard);
                }
                Some(reply)
            }
            "/stats" => {
                let user_count = {
                    let store = self.store.lock().await;
                    store.user_count()
                };
                let gateway_ok = if self.stats_probe {
                    Some(self.backend.health_check().await)
                } else {
                    None
                };
                let text = commands::stats_text(user_count, self.started_at.elapsed(), gateway_ok);
                Some(self.reply_to(message, text))
            }
            _ => None,
        }
    }

    /// Resolve every attachment independently; partial failures contribute
    /// markers to the prompt instead of aborting the turn.
    async fn resolve_attachments(&self, attachments: &[Attachment]) -> Vec<String> {
        let mut summaries = Vec::with_capacity(attachments.len());

        for attachment in attachments {
            let path = match self.fetcher.fetch(&attachment.url).await {
                Ok(path) => path,
                Err(err) => {
                    warn!(url = %attachment.url, error = %err, "Attachment download failed");
                    summaries.push(DOWNLOAD_FAILED_MARKER.to_string());
                    continue;
                }
            };

            let extension = path.extension().and_then(|e| e.to_str());
            match MediaKind::classify(extension, attachment.mime.as_deref()) {
                Some(kind) => {
                    let description = self.describer.describe(kind, &path).await;
                    summaries.push(format!("{} {}", kind.tag(), description));
                }
                None => summaries.push(UNSUPPORTED_MEDIA_MARKER.to_string()),
            }
        }

        summaries
    }

    /// Append the user/assistant pair and write the state file. The write is
    /// retried once; a second failure is logged and the reply still stands.
    async fn persist_turn(&self, chat_id: &str, user_text: &str, reply: &str) {
        let mut store = self.store.lock().await;
        store.append(chat_id, ConversationTurn::user(user_text));
        store.append(chat_id, ConversationTurn::assistant(reply));

        if let Err(first) = store.save() {
            warn!(error = %first, "State save failed, retrying once");
            if let Err(second) = store.save() {
                error!(error = %second, "State save failed twice; this turn's memory is not durable");
            }
        }
    }

    async fn chat_lock(&self, chat_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.chat_locks.lock().await;
        locks
            .entry(chat_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the map entry once no other turn holds a clone, so the lock map
    /// stays bounded by the number of chats currently in flight.
    async fn release_chat_lock(&self, chat_id: &str, lock: &Arc<Mutex<()>>) {
        let mut locks = self.chat_locks.lock().await;
        // 2 clones: the map entry and ours. Cloning requires the map mutex,
        // which we hold, so the count cannot change under us.
        if Arc::strong_count(lock) == 2 {
            locks.remove(chat_id);
        }
    }

    #[cfg(test)]
    async fn chat_lock_count(&self) -> usize {
        self.chat_locks.lock().await.len()
    }

    fn reply_to(&self, message: &InboundMessage, text: String) -> OutboundMessage {
        let mut reply = OutboundMessage::text(&message.channel, &message.chat_id, text);
        if let Some(message_id) = message.message_id {
            reply = reply.with_reply_to(message_id);
        }
        reply
    }

    pub async fn recent_history(&self, chat_id: &str, limit: usize) -> Vec<ConversationTurn> {
        let store = self.store.lock().await;
        store.recent_history(chat_id, limit).to_vec()
    }

    pub async fn user_count(&self) -> usize {
        let store = self.store.lock().await;
        store.user_count()
    }
}
