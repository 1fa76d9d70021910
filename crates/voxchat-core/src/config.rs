//! Application configuration.
//!
//! Precedence: environment (`VOXCHAT_*`, nested keys joined with `__`) > TOML file
//! (`VOXCHAT_CONFIG` path, default `config/voxchat.toml`) > built-in defaults.
//!
//! | Key | Default | Description |
//! |-----|---------|-------------|
//! | host | 127.0.0.1 | Bind address of the gateway. |
//! | port | 5000 | Gateway port. |
//! | upload_dir | uploads | Raw and normalized user clips. |
//! | response_dir | responses | Synthesized replies (`<uuid>.wav`). |
//! | voice_model_dir | voice_models | One sub-directory of reference WAVs per profile. |
//! | db_path | database/voice_chatbot.db | SQLite file holding the `voice_models` table. |
//! | max_upload_bytes | 25 MiB | Multipart body limit. |
//! | log_dir | unset | When set, logs are also written to a daily-rolling file there. |
//! | llm.* | OpenRouter | See [`LlmConfig`]. `OPENROUTER_API_KEY` is honoured as a fallback key. |
//! | stt.* / tts.* | placeholder backends | See `voxchat_voice::{SttConfig, TtsConfig}`. |

use serde::Deserialize;
use std::path::{Path, PathBuf};
use voxchat_voice::{SttConfig, TtsConfig};

fn default_llm_api_base() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_llm_model() -> String {
    "meta-llama/llama-3-8b-instruct".to_string()
}

fn default_llm_timeout_secs() -> u64 {
    30
}

/// Chat-completion service used by the response generation stage.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_api_base")]
    pub api_base: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_llm_model")]
    pub model: String,
    /// Expiry is handled like any other failure: the fallback reply is used.
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_base: default_llm_api_base(),
            api_key: None,
            model: default_llm_model(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub upload_dir: PathBuf,
    pub response_dir: PathBuf,
    pub voice_model_dir: PathBuf,
    pub db_path: PathBuf,
    pub max_upload_bytes: usize,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub stt: SttConfig,
    #[serde(default)]
    pub tts: TtsConfig,
}

impl AppConfig {
    /// Load config from file and environment (see module docs for precedence).
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("VOXCHAT_CONFIG").unwrap_or_else(|_| "config/voxchat".to_string());
        Self::load_from(Path::new(&config_path))
    }

    /// Load with an explicit TOML path (missing file is fine; defaults and env still apply).
    pub fn load_from(path: &Path) -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .set_default("host", "127.0.0.1")?
            .set_default("port", 5000_i64)?
            .set_default("upload_dir", "uploads")?
            .set_default("response_dir", "responses")?
            .set_default("voice_model_dir", "voice_models")?
            .set_default("db_path", "database/voice_chatbot.db")?
            .set_default("max_upload_bytes", 25_i64 * 1024 * 1024)?;

        let builder = builder.add_source(config::File::from(path).required(false));

        let built = builder
            .add_source(
                config::Environment::with_prefix("VOXCHAT")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut cfg: AppConfig = built.try_deserialize()?;
        cfg.apply_key_fallbacks();
        Ok(cfg)
    }

    /// All state under one directory with default service settings. Used by tests and demos.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            upload_dir: root.join("uploads"),
            response_dir: root.join("responses"),
            voice_model_dir: root.join("voice_models"),
            db_path: root.join("database").join("voice_chatbot.db"),
            max_upload_bytes: 25 * 1024 * 1024,
            log_dir: None,
            llm: LlmConfig::default(),
            stt: SttConfig::default(),
            tts: TtsConfig::default(),
        }
    }

    fn apply_key_fallbacks(&mut self) {
        if self.llm.api_key.as_deref().map(str::trim).unwrap_or("").is_empty() {
            self.llm.api_key = env_opt_string("OPENROUTER_API_KEY");
        }
        if self.stt.api_key.as_deref().map(str::trim).unwrap_or("").is_empty() {
            self.stt.api_key = env_opt_string("STT_API_KEY");
        }
    }

    /// Create every directory the pipeline writes into.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [&self.upload_dir, &self.response_dir, &self.voice_model_dir] {
            std::fs::create_dir_all(dir)?;
        }
        if let Some(parent) = self.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        if let Some(ref dir) = self.log_dir {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_opt_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
