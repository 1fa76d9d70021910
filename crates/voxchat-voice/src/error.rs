//! Error types for the voxchat voice layer

use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors raised by the normalizer and the STT/TTS backends
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Unsupported audio format: {0}")]
    UnsupportedAudioFormat(String),

    #[error("WAV encoding error: {0}")]
    Encode(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("STT error: {0}")]
    Stt(String),

    #[error("TTS error: {0}")]
    Tts(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<hound::Error> for VoiceError {
    fn from(err: hound::Error) -> Self {
        match err {
            hound::Error::IoError(e) => VoiceError::Io(e),
            other => VoiceError::Encode(other.to_string()),
        }
    }
}

impl From<symphonia::core::errors::Error> for VoiceError {
    fn from(err: symphonia::core::errors::Error) -> Self {
        VoiceError::UnsupportedAudioFormat(err.to_string())
    }
}
