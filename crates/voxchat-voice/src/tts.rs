//! **Voice-cloning TTS**: synthesize text in the voice of a reference WAV sample.
//!
//! Backends return encoded audio bytes (WAV); writing the artifact to disk is the caller's job.

use crate::audio::{pcm_f32_to_wav, CANONICAL_SAMPLE_RATE};
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

fn default_tts_language() -> String {
    "en".to_string()
}

fn default_tts_timeout_secs() -> u64 {
    120
}

/// TTS selection, embedded in the application config under `[tts]`.
#[derive(Debug, Clone, Deserialize)]
pub struct TtsConfig {
    /// Base URL of a voice-cloning server (XTTS / YourTTS style). Unset → placeholder.
    #[serde(default)]
    pub server_url: Option<String>,
    #[serde(default = "default_tts_language")]
    pub language: String,
    #[serde(default = "default_tts_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            language: default_tts_language(),
            timeout_secs: default_tts_timeout_secs(),
        }
    }
}

/// One synthesis call: what to say, whose voice, which language.
#[derive(Debug, Clone)]
pub struct SynthesisRequest {
    pub text: String,
    /// Single reference sample; backends never blend several.
    pub reference_wav: PathBuf,
    pub language: String,
}

/// Backend that turns text into speech mimicking the reference speaker.
#[async_trait]
pub trait TtsBackend: Send + Sync {
    /// Synthesize to encoded audio bytes. An empty result is treated as a failure by callers.
    async fn synthesize(&self, request: &SynthesisRequest) -> VoiceResult<Vec<u8>>;

    fn name(&self) -> &'static str;
}

/// Placeholder TTS: silent canonical WAV whose length follows the text. Still requires a
/// readable reference WAV so profile problems surface the same way they would with a real model.
#[derive(Debug, Default)]
pub struct PlaceholderTts;

impl PlaceholderTts {
    const SECS_PER_CHAR: f32 = 0.06;
    const MIN_SECS: f32 = 0.5;
    const MAX_SECS: f32 = 30.0;

    fn duration_for(text: &str) -> Duration {
        let secs = (text.chars().count() as f32 * Self::SECS_PER_CHAR).clamp(Self::MIN_SECS, Self::MAX_SECS);
        Duration::from_secs_f32(secs)
    }
}

#[async_trait]
impl TtsBackend for PlaceholderTts {
    async fn synthesize(&self, request: &SynthesisRequest) -> VoiceResult<Vec<u8>> {
        hound::WavReader::open(&request.reference_wav).map_err(|e| {
            VoiceError::Tts(format!(
                "invalid reference audio {}: {}",
                request.reference_wav.display(),
                e
            ))
        })?;
        let frames = (Self::duration_for(&request.text).as_secs_f32() * CANONICAL_SAMPLE_RATE as f32).round() as usize;
        pcm_f32_to_wav(&vec![0.0; frames], CANONICAL_SAMPLE_RATE)
    }

    fn name(&self) -> &'static str {
        "placeholder"
    }
}

/// Remote voice-cloning server. Sends a multipart POST to `{server_url}/tts` with fields
/// `text`, `language` and the `speaker_wav` file; the response body is the audio.
#[derive(Debug, Clone)]
pub struct CloningTtsServer {
    base_url: String,
    client: reqwest::Client,
}

impl CloningTtsServer {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VoiceError::Tts(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            client,
        })
    }
}

#[async_trait]
impl TtsBackend for CloningTtsServer {
    async fn synthesize(&self, request: &SynthesisRequest) -> VoiceResult<Vec<u8>> {
        let text = request.text.trim();
        if text.is_empty() {
            return Err(VoiceError::Tts("nothing to synthesize".to_string()));
        }
        let reference = tokio::fs::read(&request.reference_wav).await.map_err(|e| {
            VoiceError::Tts(format!(
                "cannot read reference {}: {}",
                request.reference_wav.display(),
                e
            ))
        })?;
        let part = reqwest::multipart::Part::bytes(reference)
            .file_name("speaker.wav")
            .mime_str("audio/wav")
            .map_err(|e| VoiceError::Tts(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .text("text", text.to_string())
            .text("language", request.language.clone())
            .part("speaker_wav", part);
        let url = format!("{}/tts", self.base_url.trim_end_matches('/'));
        let res = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| VoiceError::Tts(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::Tts(format!("TTS server error {}: {}", status, body)));
        }
        let bytes = res.bytes().await.map_err(|e| VoiceError::Tts(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    fn name(&self) -> &'static str {
        "cloning-server"
    }
}

/// Create the configured TTS backend: the cloning server when `server_url` is set, else the placeholder.
pub fn create_tts(config: &TtsConfig) -> VoiceResult<Box<dyn TtsBackend>> {
    match config.server_url.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
        Some(url) => {
            info!(target: "voxchat::voice", "TTS: cloning server at {}", url);
            Ok(Box::new(CloningTtsServer::new(
                url,
                Duration::from_secs(config.timeout_secs),
            )?))
        }
        None => {
            info!(target: "voxchat::voice", "TTS: placeholder (set tts.server_url for voice cloning)");
            Ok(Box::new(PlaceholderTts))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(dir: &std::path::Path) -> PathBuf {
        let path = dir.join("0_sample.wav");
        std::fs::write(&path, pcm_f32_to_wav(&[0.0; 1600], CANONICAL_SAMPLE_RATE).unwrap()).unwrap();
        path
    }

    #[tokio::test]
    async fn placeholder_produces_wav_scaled_to_text() {
        let dir = tempfile::tempdir().unwrap();
        let req = SynthesisRequest {
            text: "x".repeat(100),
            reference_wav: reference(dir.path()),
            language: "en".to_string(),
        };
        let bytes = PlaceholderTts.synthesize(&req).await.unwrap();
        let reader = hound::WavReader::new(std::io::Cursor::new(bytes)).unwrap();
        assert_eq!(reader.spec().sample_rate, CANONICAL_SAMPLE_RATE);
        // 100 chars * 0.06 s
        assert_eq!(reader.duration(), 6 * CANONICAL_SAMPLE_RATE);
    }

    #[tokio::test]
    async fn placeholder_rejects_bad_reference() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("bad.wav");
        std::fs::write(&bad, b"not a wav").unwrap();
        let req = SynthesisRequest {
            text: "hi".to_string(),
            reference_wav: bad,
            language: "en".to_string(),
        };
        assert!(matches!(
            PlaceholderTts.synthesize(&req).await,
            Err(VoiceError::Tts(_))
        ));
    }

    #[test]
    fn create_tts_selects_backend() {
        assert_eq!(create_tts(&TtsConfig::default()).unwrap().name(), "placeholder");
        let config = TtsConfig {
            server_url: Some("http://127.0.0.1:8020".to_string()),
            ..TtsConfig::default()
        };
        assert_eq!(create_tts(&config).unwrap().name(), "cloning-server");
    }

    mod server {
        use super::*;
        use axum::extract::Multipart;
        use axum::http::StatusCode;
        use axum::response::{IntoResponse, Response};
        use axum::routing::post;
        use axum::Router;

        const CLONED: &[u8] = b"RIFF-cloned-voice";

        async fn serve(router: Router) -> String {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                axum::serve(listener, router).await.unwrap();
            });
            format!("http://{}", addr)
        }

        /// Accepts only `text`, `language` and a WAV `speaker_wav` upload.
        async fn clone_voice(mut multipart: Multipart) -> Response {
            let (mut text, mut language, mut speaker) = (None, None, None);
            while let Ok(Some(field)) = multipart.next_field().await {
                match field.name().unwrap_or_default().to_string().as_str() {
                    "text" => text = field.text().await.ok(),
                    "language" => language = field.text().await.ok(),
                    "speaker_wav" => {
                        let named = field.file_name() == Some("speaker.wav");
                        let bytes = field.bytes().await.unwrap_or_default();
                        speaker = Some(named && bytes.starts_with(b"RIFF"));
                    }
                    _ => {}
                }
            }
            if text.as_deref() == Some("[happy] hi there")
                && language.as_deref() == Some("de")
                && speaker == Some(true)
            {
                CLONED.to_vec().into_response()
            } else {
                (StatusCode::BAD_REQUEST, "unexpected form").into_response()
            }
        }

        async fn crashed() -> Response {
            (StatusCode::INTERNAL_SERVER_ERROR, "cuda out of memory").into_response()
        }

        fn request(dir: &std::path::Path, text: &str) -> SynthesisRequest {
            SynthesisRequest {
                text: text.to_string(),
                reference_wav: reference(dir),
                language: "de".to_string(),
            }
        }

        #[tokio::test]
        async fn posts_text_language_and_speaker_sample() {
            let dir = tempfile::tempdir().unwrap();
            let base = serve(Router::new().route("/tts", post(clone_voice))).await;
            let tts = CloningTtsServer::new(format!("{}/", base), Duration::from_secs(5)).unwrap();
            let audio = tts.synthesize(&request(dir.path(), "  [happy] hi there ")).await.unwrap();
            assert_eq!(audio, CLONED);
        }

        #[tokio::test]
        async fn error_status_becomes_tts_error() {
            let dir = tempfile::tempdir().unwrap();
            let base = serve(Router::new().route("/tts", post(crashed))).await;
            let tts = CloningTtsServer::new(base, Duration::from_secs(5)).unwrap();
            match tts.synthesize(&request(dir.path(), "hello")).await {
                Err(VoiceError::Tts(detail)) => {
                    assert!(detail.contains("500"), "{}", detail);
                    assert!(detail.contains("cuda out of memory"), "{}", detail);
                }
                other => panic!("unexpected: {:?}", other),
            }
        }

        #[tokio::test]
        async fn blank_text_is_rejected_before_any_request() {
            let dir = tempfile::tempdir().unwrap();
            // Nothing listens here; reaching the network would surface a connect error instead.
            let tts = CloningTtsServer::new("http://127.0.0.1:9", Duration::from_secs(5)).unwrap();
            match tts.synthesize(&request(dir.path(), "  \n ")).await {
                Err(VoiceError::Tts(detail)) => assert_eq!(detail, "nothing to synthesize"),
                other => panic!("unexpected: {:?}", other),
            }
        }
    }
}
