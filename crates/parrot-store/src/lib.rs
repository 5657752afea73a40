//! Parrot Store
//!
//! Flat-file persistence for the user registry and per-chat conversation
//! history. One JSON document, full overwrite on save, tolerant load.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store io: {0}")]
    Io(#[from] std::io::Error),
    #[error("store encode: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One history entry. Immutable once created; only the final model reply and
/// the raw user text are persisted, never the multimodal summaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// The single persisted document. Legacy files missing either top-level key
/// deserialize with that key empty.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PersistedState {
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub history: HashMap<String, Vec<ConversationTurn>>,
}

pub struct ConversationStore {
    path: PathBuf,
    state: PersistedState,
}

impl ConversationStore {
    /// Load the state document. A missing or corrupt file yields an empty
    /// default; absence is a first run, not an error.
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let state = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<PersistedState>(&content) {
                Ok(state) => state,
                Err(err) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %err,
                        "State file is corrupt, starting from empty state"
                    );
                    PersistedState::default()
                }
            },
            Err(_) => PersistedState::default(),
        };

        Self { path, state }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> &PersistedState {
        &self.state
    }

    /// Register a chat identity. Idempotent: returns true only on first sight.
    pub fn register_user(&mut self, chat_id: &str) -> bool {
        if self.state.users.iter().any(|u| u == chat_id) {
            return false;
        }
        self.state.users.push(chat_id.to_string());
        true
    }

    pub fn user_count(&self) -> usize {
        self.state.users.len()
    }

    /// The only history mutation path.
    pub fn append(&mut self, chat_id: &str, turn: ConversationTurn) {
        self.state
            .history
            .entry(chat_id.to_string())
            .or_default()
            .push(turn);
    }

    /// Last `limit` turns for a chat, oldest first.
    pub fn recent_history(&self, chat_id: &str, limit: usize) -> &[ConversationTurn] {
        match self.state.history.get(chat_id) {
            Some(turns) => {
                let start = turns.len().saturating_sub(limit);
                &turns[start..]
            }
            None => &[],
        }
    }

    /// Full overwrite through a temp file plus rename, so a crash mid-write
    /// leaves the previous document intact.
    pub fn save(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let serialized = serde_json::to_string_pretty(&self.state)?;
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, serialized)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{ConversationStore, ConversationTurn, Role};
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_state_path(name: &str) -> std::path::PathBuf {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!("parrot-store-{}-{}.json", name, ts))
    }

    #[test]
    fn missing_file_loads_empty_state() {
        let store = ConversationStore::load(temp_state_path("missing"));
        assert_eq!(store.user_count(), 0);
        assert!(store.recent_history("1", 10).is_empty());
    }

    #[test]
    fn corrupt_file_loads_empty_state() {
        let path = temp_state_path("corrupt");
        std::fs::write(&path, "{not json").expect("seed");
        let store = ConversationStore::load(&path);
        assert_eq!(store.user_count(), 0);
    }

    #[test]
    fn legacy_document_missing_keys_is_tolerated() {
        let path = temp_state_path("legacy");
        std::fs::write(&path, r#"{"users": ["7"]}"#).expect("seed");
        let store = ConversationStore::load(&path);
        assert_eq!(store.user_count(), 1);
        assert!(store.recent_history("7", 10).is_empty());
    }

    #[test]
    fn save_then_load_round_trips_content() {
        let path = temp_state_path("roundtrip");
        let mut store = ConversationStore::load(&path);
        store.register_user("42");
        store.append("42", ConversationTurn::user("hello"));
        store.append("42", ConversationTurn::assistant("hi there"));
        store.save().expect("save");

        let reloaded = ConversationStore::load(&path);
        assert_eq!(reloaded.user_count(), 1);
        let history = reloaded.recent_history("42", 10);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[0].content, "hello");
        assert_eq!(history[1].role, Role::Assistant);

        // Second save of an untouched store must not change the document.
        reloaded.save().expect("save again");
        let first = {
            let again = ConversationStore::load(&path);
            serde_json::to_string(again.state()).expect("encode")
        };
        let second = serde_json::to_string(reloaded.state()).expect("encode");
        assert_eq!(first, second);
    }

    #[test]
    fn recent_history_enforces_window() {
        let mut store = ConversationStore::load(temp_state_path("window"));
        for i in 0..1000 {
            store.append("9", ConversationTurn::user(format!("msg {}", i)));
        }
        let recent = store.recent_history("9", 5);
        assert_eq!(recent.len(), 5);
        assert_eq!(recent[0].content, "msg 995");
        assert_eq!(recent[4].content, "msg 999");
    }

    #[test]
    fn register_user_is_idempotent() {
        let mut store = ConversationStore::load(temp_state_path("idempotent"));
        assert!(store.register_user("5"));
        assert!(!store.register_user("5"));
        assert_eq!(store.user_count(), 1);
    }
}
