//! **Speech-to-Text (STT)**: turn a canonical WAV file into one transcript string.
//!
//! Implement `SttBackend` for local Whisper (whisper-rs) or a remote OpenAI-compatible
//! transcription API. Recognizers emit segments; `join_segments` concatenates them in
//! emission order with no separator.

use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

fn default_stt_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_stt_model() -> String {
    "whisper-1".to_string()
}

fn default_stt_timeout_secs() -> u64 {
    60
}

/// STT selection, embedded in the application config under `[stt]`.
#[derive(Debug, Clone, Deserialize)]
pub struct SttConfig {
    /// Base URL of the OpenAI-compatible transcription API (no trailing slash).
    #[serde(default = "default_stt_api_base")]
    pub api_base: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_stt_model")]
    pub model: String,
    /// ggml model for local Whisper (requires the `whisper` feature).
    #[serde(default)]
    pub whisper_model_path: Option<String>,
    #[serde(default = "default_stt_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            api_base: default_stt_api_base(),
            api_key: None,
            model: default_stt_model(),
            whisper_model_path: None,
            timeout_secs: default_stt_timeout_secs(),
        }
    }
}

/// Backend that converts a decodable audio file into text.
#[async_trait]
pub trait SttBackend: Send + Sync {
    /// Transcribe the whole file. Return an empty string if no speech was recognized.
    async fn transcribe(&self, audio_path: &Path) -> VoiceResult<String>;

    /// Short label for logs.
    fn name(&self) -> &'static str;
}

/// Concatenate recognizer segments in emission order, no separator; outer whitespace trimmed.
pub fn join_segments<I, S>(segments: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut text = String::new();
    for seg in segments {
        text.push_str(seg.as_ref());
    }
    text.trim().to_string()
}

/// Placeholder STT: returns a fixed string. Use for tests and offline runs.
#[derive(Debug, Default)]
pub struct PlaceholderStt {
    /// If set, return this instead of the default message.
    pub response: Option<String>,
}

impl PlaceholderStt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(s: impl Into<String>) -> Self {
        Self {
            response: Some(s.into()),
        }
    }
}

#[async_trait]
impl SttBackend for PlaceholderStt {
    async fn transcribe(&self, audio_path: &Path) -> VoiceResult<String> {
        if !audio_path.exists() {
            return Err(VoiceError::Stt(format!(
                "audio file not found: {}",
                audio_path.display()
            )));
        }
        if let Some(ref r) = self.response {
            return Ok(r.clone());
        }
        Ok(format!(
            "[STT placeholder: {}; configure a Whisper model or STT API key]",
            audio_path.display()
        ))
    }

    fn name(&self) -> &'static str {
        "placeholder"
    }
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    segments: Option<Vec<TranscriptionSegment>>,
}

#[derive(Debug, Deserialize)]
struct TranscriptionSegment {
    #[serde(default)]
    text: String,
}

/// Remote STT: OpenAI-compatible `/audio/transcriptions` (OpenAI Whisper, OpenRouter, local servers).
#[derive(Debug, Clone)]
pub struct WhisperApiStt {
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl WhisperApiStt {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            client,
        })
    }

    /// Build from config; requires `api_key`.
    pub fn from_config(config: &SttConfig) -> VoiceResult<Self> {
        let api_key = config
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| VoiceError::Config("STT API requires stt.api_key".to_string()))?;
        Self::new(
            config.api_base.clone(),
            api_key,
            config.model.clone(),
            Duration::from_secs(config.timeout_secs),
        )
    }
}

#[async_trait]
impl SttBackend for WhisperApiStt {
    async fn transcribe(&self, audio_path: &Path) -> VoiceResult<String> {
        let wav = tokio::fs::read(audio_path).await?;
        let url = format!("{}/audio/transcriptions", self.base_url.trim_end_matches('/'));
        let file_name = audio_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("audio.wav")
            .to_string();
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name(file_name)
            .mime_str("audio/wav")
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("response_format", "verbose_json");
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::Stt(format!("STT API error {}: {}", status, body)));
        }
        let body: TranscriptionResponse = res
            .json()
            .await
            .map_err(|e| VoiceError::Stt(format!("malformed STT response: {}", e)))?;
        let text = match body.segments {
            Some(segments) if !segments.is_empty() => {
                debug!(target: "voxchat::voice", "STT returned {} segments", segments.len());
                join_segments(segments.iter().map(|s| s.text.as_str()))
            }
            _ => body.text.unwrap_or_default().trim().to_string(),
        };
        Ok(text)
    }

    fn name(&self) -> &'static str {
        "whisper-api"
    }
}

// -----------------------------------------------------------------------------
// Local Whisper STT (optional feature). Requires whisper.cpp/ggml.
// -----------------------------------------------------------------------------
#[cfg(feature = "whisper")]
mod whisper_stt {
    use super::*;
    use crate::audio::read_mono_16k;
    use std::sync::{Arc, Mutex};
    use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

    struct WhisperInner {
        #[allow(dead_code)]
        context: WhisperContext,
        state: Mutex<whisper_rs::WhisperState>,
    }

    /// Local Whisper STT: loads a ggml model (e.g. ggml-tiny.en.bin) and runs inference
    /// on a blocking thread.
    #[derive(Clone)]
    pub struct WhisperStt {
        inner: Arc<WhisperInner>,
    }

    impl WhisperStt {
        pub fn new(model_path: &str) -> VoiceResult<Self> {
            let params = WhisperContextParameters::default();
            let context = WhisperContext::new_with_params(model_path, params)
                .map_err(|e| VoiceError::Stt(format!("Whisper load failed: {}", e)))?;
            let state = context
                .create_state()
                .map_err(|e| VoiceError::Stt(format!("Whisper state init failed: {}", e)))?;
            Ok(Self {
                inner: Arc::new(WhisperInner {
                    context,
                    state: Mutex::new(state),
                }),
            })
        }

        fn transcribe_blocking(inner: &WhisperInner, audio_path: &Path) -> VoiceResult<String> {
            let decoded = read_mono_16k(audio_path)
                .map_err(|e| VoiceError::Stt(format!("cannot read {}: {}", audio_path.display(), e)))?;
            if decoded.samples.is_empty() {
                return Ok(String::new());
            }
            let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
            params.set_print_progress(false);
            params.set_print_realtime(false);
            params.set_no_timestamps(true);
            params.set_language(Some("en"));

            let mut state = inner
                .state
                .lock()
                .map_err(|e| VoiceError::Stt(format!("Whisper lock poisoned: {}", e)))?;
            state
                .full(&params, &decoded.samples)
                .map_err(|e| VoiceError::Stt(format!("Whisper inference failed: {}", e)))?;
            Ok(join_segments(
                state.as_iter().filter_map(|seg| seg.to_str().ok().map(str::to_string)),
            ))
        }
    }

    #[async_trait]
    impl SttBackend for WhisperStt {
        async fn transcribe(&self, audio_path: &Path) -> VoiceResult<String> {
            let inner = Arc::clone(&self.inner);
            let path = audio_path.to_path_buf();
            tokio::task::spawn_blocking(move || Self::transcribe_blocking(&inner, &path))
                .await
                .map_err(|e| VoiceError::Stt(format!("Whisper task failed: {}", e)))?
        }

        fn name(&self) -> &'static str {
            "whisper-local"
        }
    }
}

#[cfg(feature = "whisper")]
pub use whisper_stt::WhisperStt;

/// Create the best available STT backend.
/// Priority: (1) local Whisper if `whisper_model_path` is set and loads (requires the `whisper`
/// feature), (2) the transcription API if `api_key` is set, (3) PlaceholderStt.
pub fn create_stt(config: &SttConfig) -> VoiceResult<Box<dyn SttBackend>> {
    #[cfg(feature = "whisper")]
    {
        if let Some(path) = config.whisper_model_path.as_deref().map(str::trim) {
            if !path.is_empty() {
                match whisper_stt::WhisperStt::new(path) {
                    Ok(w) => {
                        info!(target: "voxchat::voice", "STT: local Whisper ({})", path);
                        return Ok(Box::new(w));
                    }
                    Err(e) => tracing::warn!(target: "voxchat::voice", "STT: Whisper unavailable: {}", e),
                }
            }
        }
    }
    if config.api_key.as_deref().map(str::trim).is_some_and(|k| !k.is_empty()) {
        let api = WhisperApiStt::from_config(config)?;
        info!(target: "voxchat::voice", "STT: API {} ({})", config.api_base, config.model);
        return Ok(Box::new(api));
    }
    info!(target: "voxchat::voice", "STT: placeholder (set stt.api_key or stt.whisper_model_path)");
    Ok(Box::new(PlaceholderStt::new()))
}
