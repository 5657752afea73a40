//! Parrot Configuration
//!
//! TOML configuration loading with validation and default path resolution

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub persona: PersonaConfig,
    #[serde(default)]
    pub contacts: ContactsConfig,
    pub telegram: Option<TelegramConfig>,
    pub stt: Option<SttConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    pub data_dir: Option<String>,
    pub log_level: Option<String>,
    /// Number of prior turns included in each model call.
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Secondary invocation phrase for group chats, in addition to the
    /// bot handle mention.
    #[serde(default)]
    pub trigger_phrase: Option<String>,
    #[serde(default = "default_trigger_keyword")]
    pub trigger_keyword: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            log_level: None,
            history_window: default_history_window(),
            max_tokens: default_max_tokens(),
            trigger_phrase: None,
            trigger_keyword: default_trigger_keyword(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_gateway_model")]
    pub model: String,
    #[serde(default = "default_gateway_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_gateway_base_url(),
            api_key: None,
            model: default_gateway_model(),
            request_timeout_secs: default_gateway_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    pub download_dir: Option<String>,
    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,
    /// Hard cap on any single download; per-kind limits apply at describe time.
    #[serde(default = "default_max_download_bytes")]
    pub max_download_bytes: u64,
    #[serde(default = "default_max_audio_bytes")]
    pub max_audio_bytes: u64,
    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: u64,
    #[serde(default = "default_max_document_chars")]
    pub max_document_chars: usize,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            download_dir: None,
            download_timeout_secs: default_download_timeout(),
            max_download_bytes: default_max_download_bytes(),
            max_audio_bytes: default_max_audio_bytes(),
            max_image_bytes: default_max_image_bytes(),
            max_document_chars: default_max_document_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PersonaConfig {
    /// System prompt prepended to every model call. Falls back to the
    /// built-in persona when unset.
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContactsConfig {
    pub support_handle: Option<String>,
    pub developer_handle: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// Handle the bot answers to in groups, with or without leading '@'.
    pub bot_handle: String,
    #[serde(default)]
    pub allowed_chats: Option<Vec<i64>>,
    pub poll_timeout_secs: Option<u64>,
    pub client_recreate_interval_secs: Option<u64>,
    /// Probe the model endpoint from /stats.
    #[serde(default)]
    pub stats_probe: bool,
}

/// Local speech-to-text tooling. Absence of this section is a configuration
/// fact: transcription then falls back to the model-assisted path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttConfig {
    pub bin: String,
    pub model_path: Option<String>,
    pub language: Option<String>,
    #[serde(default = "default_stt_threads")]
    pub threads: u32,
}

fn default_history_window() -> usize {
    8
}

fn default_max_tokens() -> u32 {
    512
}

fn default_trigger_keyword() -> String {
    "detect".to_string()
}

fn default_gateway_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_gateway_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_gateway_timeout() -> u64 {
    60
}

fn default_download_timeout() -> u64 {
    30
}

fn default_max_download_bytes() -> u64 {
    20_000_000
}

fn default_max_audio_bytes() -> u64 {
    2_000_000
}

fn default_max_image_bytes() -> u64 {
    1_500_000
}

fn default_max_document_chars() -> usize {
    4000
}

fn default_stt_threads() -> u32 {
    2
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_path() -> Option<std::path::PathBuf> {
        dirs::config_dir().map(|dir| dir.join("parrot").join("config.toml"))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.gateway.base_url.trim().is_empty() {
            anyhow::bail!("gateway.base_url cannot be empty");
        }
        if self.gateway.model.trim().is_empty() {
            anyhow::bail!("gateway.model cannot be empty");
        }
        if self.core.history_window == 0 {
            anyhow::bail!("core.history_window must be at least 1");
        }

        if let Some(telegram) = &self.telegram {
            if telegram.bot_token.trim().is_empty() {
                anyhow::bail!("telegram.bot_token cannot be empty");
            }
            if telegram.bot_handle.trim().trim_start_matches('@').is_empty() {
                anyhow::bail!("telegram.bot_handle cannot be empty");
            }
        }

        if let Some(stt) = &self.stt {
            if stt.bin.trim().is_empty() {
                anyhow::bail!("stt.bin cannot be empty");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn empty_config_uses_defaults() {
        let config: Config = toml::from_str("").expect("parse");
        assert_eq!(config.core.history_window, 8);
        assert_eq!(config.core.max_tokens, 512);
        assert_eq!(config.core.trigger_keyword, "detect");
        assert_eq!(config.gateway.request_timeout_secs, 60);
        assert_eq!(config.media.download_timeout_secs, 30);
        assert_eq!(config.media.max_download_bytes, 20_000_000);
        assert_eq!(config.media.max_audio_bytes, 2_000_000);
        assert_eq!(config.media.max_image_bytes, 1_500_000);
        assert!(config.telegram.is_none());
        assert!(config.stt.is_none());
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn full_config_parses() {
        let toml_str = r#"
            [core]
            history_window = 5
            trigger_phrase = "geninj"

            [gateway]
            base_url = "https://api.example.com/v1"
            api_key = "sk-test"
            model = "test-model"

            [telegram]
            bot_token = "123:ABC"
            bot_handle = "@parrot_bot"
            allowed_chats = [42]

            [contacts]
            support_handle = "@support"
        "#;
        let config: Config = toml::from_str(toml_str).expect("parse");
        config.validate().expect("valid");
        assert_eq!(config.core.history_window, 5);
        assert_eq!(config.core.trigger_phrase.as_deref(), Some("geninj"));
        let telegram = config.telegram.expect("telegram section");
        assert_eq!(telegram.bot_handle, "@parrot_bot");
        assert_eq!(telegram.allowed_chats, Some(vec![42]));
    }

    #[test]
    fn validate_rejects_blank_handle() {
        let toml_str = r#"
            [telegram]
            bot_token = "123:ABC"
            bot_handle = "@"
        "#;
        let config: Config = toml::from_str(toml_str).expect("parse");
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_history_window() {
        let toml_str = r#"
            [core]
            history_window = 0
        "#;
        let config: Config = toml::from_str(toml_str).expect("parse");
        assert!(config.validate().is_err());
    }
}
