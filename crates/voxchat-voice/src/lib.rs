//! # voxchat-voice: audio in, speech out
//!
//! The model-facing half of the voice chat pipeline:
//!
//! ```text
//!  upload bytes ──► AudioNormalizer ──► <id>.wav (16 kHz mono)
//!                                          │
//!                                          ▼
//!                                   SttBackend (Whisper API / local Whisper)
//!
//!  reply text + reference WAV ──► TtsBackend (voice-cloning server) ──► WAV bytes
//! ```
//!
//! Backends are long-lived objects; wrap each in a [`ModelLane`] so a single instance never
//! runs two inferences at once.

pub mod audio;
pub mod error;
pub mod lane;
#[cfg(feature = "opus")]
pub mod opus;
pub mod stt;
pub mod tts;

pub use audio::{
    convert_to_wav, decode_to_mono_16k, pcm_f32_to_wav, read_mono_16k, AudioNormalizer,
    DecodedAudio, NormalizedAudio, CANONICAL_EXTENSION, CANONICAL_SAMPLE_RATE,
};
pub use error::{VoiceError, VoiceResult};
pub use lane::ModelLane;
pub use stt::{create_stt, join_segments, PlaceholderStt, SttBackend, SttConfig, WhisperApiStt};
#[cfg(feature = "whisper")]
pub use stt::WhisperStt;
pub use tts::{
    create_tts, CloningTtsServer, PlaceholderTts, SynthesisRequest, TtsBackend, TtsConfig,
};
