//! Admission gate: decides whether a message deserves a turn at all.
//!
//! Runs before any download or model call, so a declined message costs
//! nothing beyond the regex match.

use anyhow::Result;
use parrot_ipc::ChatKind;
use regex::Regex;

pub struct AdmissionGate {
    handle: String,
    mention_re: Regex,
    strip_re: Regex,
    trigger_phrase: Option<String>,
    trigger_keyword: String,
}

impl AdmissionGate {
    pub fn new(
        handle: &str,
        trigger_phrase: Option<String>,
        trigger_keyword: String,
    ) -> Result<Self> {
        let handle = handle.trim().trim_start_matches('@').to_lowercase();
        // Anchored on both sides: the handle inside a longer word never counts
        // as a mention, with or without the leading '@'.
        let mention_re = Regex::new(&format!(r"(?i)@?\b{}\b", regex::escape(&handle)))?;
        let strip_re = Regex::new(&format!(r"(?i)@?\b{}\b[:,]?\s*", regex::escape(&handle)))?;

        Ok(Self {
            handle,
            mention_re,
            strip_re,
            trigger_phrase: trigger_phrase
                .map(|p| p.trim().to_lowercase())
                .filter(|p| !p.is_empty()),
            trigger_keyword: trigger_keyword.trim().to_lowercase(),
        })
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn mentions(&self, text: &str) -> bool {
        self.mention_re.is_match(text)
    }

    /// Whether the system should respond to this message.
    ///
    /// Private chats always get a turn. Group chats require a handle mention,
    /// a direct reply to one of our own messages, or the secondary trigger
    /// phrase paired with either the detection keyword or the handle. The
    /// trigger path is additive only; a mention is always authoritative.
    pub fn should_respond(&self, kind: ChatKind, text: &str, is_reply_to_self: bool) -> bool {
        if kind == ChatKind::Private {
            return true;
        }

        if is_reply_to_self {
            return true;
        }

        if text.is_empty() {
            return false;
        }

        if self.mentions(text) {
            return true;
        }

        if let Some(phrase) = &self.trigger_phrase {
            let lowered = text.to_lowercase();
            if lowered.contains(phrase)
                && (lowered.contains(&self.trigger_keyword) || lowered.contains(&self.handle))
            {
                return true;
            }
        }

        false
    }

    /// Remove the mention token (and a trailing ':' or ',') from the text
    /// before it reaches the model.
    pub fn clean_text(&self, text: &str) -> String {
        self.strip_re.replace_all(text, "").trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::AdmissionGate;
    use parrot_ipc::ChatKind;

    fn gate() -> AdmissionGate {
        AdmissionGate::new("@parrot_bot", Some("geninj".to_string()), "detect".to_string())
            .expect("gate")
    }

    #[test]
    fn private_chat_always_responds() {
        let gate = gate();
        assert!(gate.should_respond(ChatKind::Private, "anything", false));
        assert!(gate.should_respond(ChatKind::Private, "", false));
    }

    #[test]
    fn group_without_mention_reply_or_trigger_is_silent() {
        let gate = gate();
        assert!(!gate.should_respond(ChatKind::Group, "just chatting here", false));
        assert!(!gate.should_respond(ChatKind::Group, "", false));
    }

    #[test]
    fn group_mention_as_whole_word_responds() {
        let gate = gate();
        assert!(gate.should_respond(ChatKind::Group, "hey @parrot_bot help", false));
        assert!(gate.should_respond(ChatKind::Group, "parrot_bot are you there?", false));
        assert!(gate.should_respond(ChatKind::Group, "HEY @PARROT_BOT", false));
    }

    #[test]
    fn embedded_handle_does_not_match() {
        let gate = gate();
        assert!(!gate.should_respond(ChatKind::Group, "the xparrot_botx plugin", false));
        assert!(!gate.should_respond(ChatKind::Group, "parrot_bots are loud", false));
    }

    #[test]
    fn reply_to_self_responds_even_without_text() {
        let gate = gate();
        assert!(gate.should_respond(ChatKind::Group, "", true));
        assert!(gate.should_respond(ChatKind::Group, "ok", true));
    }

    #[test]
    fn trigger_phrase_needs_keyword_or_handle() {
        let gate = gate();
        assert!(!gate.should_respond(ChatKind::Group, "geninj something", false));
        assert!(gate.should_respond(ChatKind::Group, "geninj detect this", false));
        assert!(gate.should_respond(ChatKind::Group, "geninj parrot_bot look", false));
    }

    #[test]
    fn no_trigger_configured_disables_trigger_path() {
        let gate = AdmissionGate::new("parrot_bot", None, "detect".to_string()).expect("gate");
        assert!(!gate.should_respond(ChatKind::Group, "geninj detect this", false));
    }

    #[test]
    fn clean_text_strips_mention_and_punctuation() {
        let gate = gate();
        assert_eq!(gate.clean_text("@parrot_bot: how are you"), "how are you");
        assert_eq!(gate.clean_text("hey @parrot_bot, listen"), "hey listen");
        assert_eq!(gate.clean_text("no mention here"), "no mention here");
    }
}
