//! # voxchat-core
//!
//! Configuration, the voice profile registry and the request orchestrator that chains
//! normalization, transcription, reply generation, voice lookup and synthesis.

pub mod config;
pub mod error;
pub mod generation;
pub mod orchestrator;
pub mod persona;
pub mod registry;
pub mod synthesis;

pub use config::{AppConfig, LlmConfig};
pub use error::PipelineError;
pub use generation::{
    CompletionClient, GeneratedReply, GenerationError, OpenRouterClient, ResponseGenerator,
    FALLBACK_REPLY,
};
pub use orchestrator::{
    format_reply, ChatOrchestrator, ChatOutcome, ChatRequest, PipelineStage, StageFailure,
    DEFAULT_EMOTION, DEFAULT_VOICE_ID,
};
pub use persona::Persona;
pub use registry::{
    RegistrationReport, RegistryError, SampleUpload, SkippedSample, VoiceProfile,
    VoiceProfileRegistry,
};
pub use synthesis::{SynthesisStage, SynthesizedAudio};
