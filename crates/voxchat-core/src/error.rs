//! Error taxonomy of the request pipeline.
//!
//! Generation failures are deliberately absent: the generator absorbs them and returns the
//! fallback reply (see `generation`).

use crate::registry::RegistryError;
use thiserror::Error;
use voxchat_voice::VoiceError;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Unsupported audio format: {0}")]
    UnsupportedAudioFormat(String),

    #[error("Voice model not found: {0}")]
    ProfileNotFound(String),

    #[error("No .wav file found in the voice model folder for '{0}'")]
    NoReferenceSample(String),

    #[error("Invalid voice model name: {0}")]
    InvalidProfileName(String),

    #[error("Transcription failed: {0}")]
    TranscriptionFailure(String),

    #[error("TTS generation failed: {0}")]
    SynthesisFailed(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// True for failures caused by the request itself (bad audio, unknown or empty profile).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            PipelineError::UnsupportedAudioFormat(_)
                | PipelineError::ProfileNotFound(_)
                | PipelineError::NoReferenceSample(_)
                | PipelineError::InvalidProfileName(_)
        )
    }
}

impl From<RegistryError> for PipelineError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::InvalidName(n) => PipelineError::InvalidProfileName(n),
            RegistryError::ProfileNotFound(n) => PipelineError::ProfileNotFound(n),
            RegistryError::NoReferenceSample(n) => PipelineError::NoReferenceSample(n),
            RegistryError::Sqlite(e) => PipelineError::Storage(e.to_string()),
            RegistryError::Io(e) => PipelineError::Io(e),
        }
    }
}

impl From<tokio::task::JoinError> for PipelineError {
    fn from(err: tokio::task::JoinError) -> Self {
        PipelineError::Internal(format!("blocking task failed: {}", err))
    }
}

/// Normalizer errors: undecodable input is the caller's problem, anything else is ours.
pub(crate) fn from_normalizer(err: VoiceError) -> PipelineError {
    match err {
        VoiceError::UnsupportedAudioFormat(detail) => PipelineError::UnsupportedAudioFormat(detail),
        VoiceError::Io(e) => PipelineError::Io(e),
        other => PipelineError::Internal(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_are_classified() {
        assert!(PipelineError::ProfileNotFound("x".into()).is_client_error());
        assert!(PipelineError::NoReferenceSample("x".into()).is_client_error());
        assert!(!PipelineError::SynthesisFailed("boom".into()).is_client_error());
        assert!(!PipelineError::TranscriptionFailure("boom".into()).is_client_error());
    }

    #[test]
    fn undecodable_audio_maps_to_unsupported_format() {
        let err = from_normalizer(VoiceError::UnsupportedAudioFormat("no track".into()));
        assert!(matches!(err, PipelineError::UnsupportedAudioFormat(_)));
    }
}
