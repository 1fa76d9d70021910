//! Request orchestrator: one uploaded clip in, one synthesized reply out.
//!
//! ```text
//! Received ─► Normalized ─► Transcribed ─► Responded ─► VoiceResolved ─► Synthesized ─► Complete
//!     │            │             │                           │                 │
//!     └────────────┴─────────────┴──── Errored(stage) ◄──────┴─────────────────┘
//! ```
//!
//! `Responded` never fails: generation problems turn into the fallback reply. Every external
//! call is attempted exactly once.

use crate::config::AppConfig;
use crate::error::{from_normalizer, PipelineError};
use crate::generation::ResponseGenerator;
use crate::persona::Persona;
use crate::registry::VoiceProfileRegistry;
use crate::synthesis::SynthesisStage;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use voxchat_voice::{create_stt, create_tts, AudioNormalizer, ModelLane, SttBackend, TtsBackend};

pub const DEFAULT_EMOTION: &str = "neutral";
pub const DEFAULT_VOICE_ID: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Received,
    Normalized,
    Transcribed,
    Responded,
    VoiceResolved,
    Synthesized,
    Complete,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineStage::Received => "received",
            PipelineStage::Normalized => "normalized",
            PipelineStage::Transcribed => "transcribed",
            PipelineStage::Responded => "responded",
            PipelineStage::VoiceResolved => "voice_resolved",
            PipelineStage::Synthesized => "synthesized",
            PipelineStage::Complete => "complete",
        };
        f.write_str(s)
    }
}

/// `Errored(stage, detail)`: `stage` is the transition that could not be completed.
#[derive(Error, Debug)]
#[error("{stage} stage failed: {error}")]
pub struct StageFailure {
    pub stage: PipelineStage,
    #[source]
    pub error: PipelineError,
}

impl StageFailure {
    fn at(stage: PipelineStage) -> impl FnOnce(PipelineError) -> StageFailure {
        move |error| StageFailure { stage, error }
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub audio_filename: String,
    pub audio: Vec<u8>,
    pub emotion: Option<String>,
    pub voice_id: Option<String>,
    pub persona: Persona,
}

#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub clip_id: String,
    pub response_id: String,
    pub response_audio: PathBuf,
    pub transcript: String,
    pub reply_text: String,
    /// True when the fallback reply was spoken.
    pub degraded: bool,
    pub persona: Persona,
    pub voice_id: String,
}

/// `"[emotion] reply"`; a missing or blank emotion becomes `neutral`.
pub fn format_reply(emotion: Option<&str>, reply: &str) -> String {
    let emotion = emotion
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .unwrap_or(DEFAULT_EMOTION);
    format!("[{}] {}", emotion, reply)
}

pub struct ChatOrchestrator {
    normalizer: AudioNormalizer,
    stt: ModelLane<dyn SttBackend>,
    generator: ResponseGenerator,
    registry: Arc<VoiceProfileRegistry>,
    synthesis: SynthesisStage,
}

impl ChatOrchestrator {
    pub fn new(
        normalizer: AudioNormalizer,
        stt: Arc<dyn SttBackend>,
        generator: ResponseGenerator,
        registry: Arc<VoiceProfileRegistry>,
        synthesis: SynthesisStage,
    ) -> Self {
        Self {
            normalizer,
            stt: ModelLane::new("stt", stt),
            generator,
            registry,
            synthesis,
        }
    }

    /// Build every stage from configuration. Model backends are created here, once.
    pub fn from_config(config: &AppConfig) -> Result<Self, PipelineError> {
        config.ensure_dirs()?;
        let stt: Arc<dyn SttBackend> = Arc::from(
            create_stt(&config.stt).map_err(|e| PipelineError::Internal(e.to_string()))?,
        );
        let tts: Arc<dyn TtsBackend> = Arc::from(
            create_tts(&config.tts).map_err(|e| PipelineError::Internal(e.to_string()))?,
        );
        let generator = ResponseGenerator::from_config(&config.llm)
            .map_err(|e| PipelineError::Internal(e.to_string()))?;
        let registry = Arc::new(VoiceProfileRegistry::open(
            &config.db_path,
            &config.voice_model_dir,
        )?);
        Ok(Self::new(
            AudioNormalizer::new(&config.upload_dir),
            stt,
            generator,
            registry,
            SynthesisStage::new(tts, &config.response_dir, config.tts.language.clone()),
        ))
    }

    pub fn registry(&self) -> &Arc<VoiceProfileRegistry> {
        &self.registry
    }

    pub fn synthesis(&self) -> &SynthesisStage {
        &self.synthesis
    }

    pub fn stt_lane(&self) -> &ModelLane<dyn SttBackend> {
        &self.stt
    }

    pub async fn handle(&self, request: ChatRequest) -> Result<ChatOutcome, StageFailure> {
        let clip_id = uuid::Uuid::new_v4().to_string();
        let voice_id = request
            .voice_id
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(DEFAULT_VOICE_ID)
            .to_string();
        let persona = request.persona;
        info!(
            target: "voxchat::pipeline",
            clip = %clip_id,
            stage = %PipelineStage::Received,
            file = %request.audio_filename,
            bytes = request.audio.len(),
            %persona,
            voice = %voice_id,
            "Chat request received"
        );

        let result = self.run_stages(&clip_id, &voice_id, request).await;
        match result {
            Ok(outcome) => {
                info!(
                    target: "voxchat::pipeline",
                    clip = %clip_id,
                    stage = %PipelineStage::Complete,
                    response = %outcome.response_audio.display(),
                    degraded = outcome.degraded,
                    "Chat request complete"
                );
                Ok(outcome)
            }
            Err(failure) => {
                warn!(
                    target: "voxchat::pipeline",
                    clip = %clip_id,
                    stage = %failure.stage,
                    "Chat request errored: {}",
                    failure.error
                );
                Err(failure)
            }
        }
    }

    async fn run_stages(
        &self,
        clip_id: &str,
        voice_id: &str,
        request: ChatRequest,
    ) -> Result<ChatOutcome, StageFailure> {
        let ChatRequest {
            audio_filename,
            audio,
            emotion,
            persona,
            ..
        } = request;

        // Received → Normalized
        let normalizer = self.normalizer.clone();
        let id = clip_id.to_string();
        let normalized = tokio::task::spawn_blocking(move || {
            normalizer
                .normalize(&id, &audio_filename, &audio)
                .map_err(from_normalizer)
        })
        .await
        .map_err(PipelineError::from)
        .and_then(|r| r)
        .map_err(StageFailure::at(PipelineStage::Normalized))?;
        info!(
            target: "voxchat::pipeline",
            clip = %clip_id,
            stage = %PipelineStage::Normalized,
            converted = normalized.converted,
            "Audio at {} ({:.2}s)",
            normalized.wav_path.display(),
            normalized.duration.as_secs_f32()
        );

        // Normalized → Transcribed
        let wav_path = normalized.wav_path.clone();
        let transcript = self
            .stt
            .run(|stt| stt.transcribe(&wav_path))
            .await
            .map_err(|e| PipelineError::TranscriptionFailure(e.to_string()))
            .map_err(StageFailure::at(PipelineStage::Transcribed))?;
        info!(target: "voxchat::pipeline", clip = %clip_id, stage = %PipelineStage::Transcribed, "Transcript: {}", transcript);

        // Transcribed → Responded
        let reply = self.generator.generate(&transcript, persona).await;
        let reply_text = format_reply(emotion.as_deref(), &reply.text);
        info!(
            target: "voxchat::pipeline",
            clip = %clip_id,
            stage = %PipelineStage::Responded,
            degraded = reply.degraded,
            "Reply: {}",
            reply_text
        );

        // Responded → VoiceResolved
        let registry = Arc::clone(&self.registry);
        let name = voice_id.to_string();
        let reference = tokio::task::spawn_blocking(move || {
            let profile = registry.lookup(&name)?;
            registry.first_reference_sample(&profile)
        })
        .await
        .map_err(PipelineError::from)
        .and_then(|r| r.map_err(PipelineError::from))
        .map_err(StageFailure::at(PipelineStage::VoiceResolved))?;
        info!(
            target: "voxchat::pipeline",
            clip = %clip_id,
            stage = %PipelineStage::VoiceResolved,
            voice = %voice_id,
            "Reference sample {}",
            reference.display()
        );

        // VoiceResolved → Synthesized
        let synthesized = self
            .synthesis
            .synthesize(&reply_text, &reference)
            .await
            .map_err(StageFailure::at(PipelineStage::Synthesized))?;

        Ok(ChatOutcome {
            clip_id: clip_id.to_string(),
            response_id: synthesized.id,
            response_audio: synthesized.path,
            transcript,
            reply_text,
            degraded: reply.degraded,
            persona,
            voice_id: voice_id.to_string(),
        })
    }
}
