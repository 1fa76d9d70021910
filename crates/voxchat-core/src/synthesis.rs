//! Synthesis stage: reply text + one reference sample → `<response_dir>/<uuid>.wav`.

use crate::error::PipelineError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use voxchat_voice::{ModelLane, SynthesisRequest, TtsBackend, CANONICAL_EXTENSION};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesizedAudio {
    pub id: String,
    pub path: PathBuf,
    pub bytes_written: usize,
}

pub struct SynthesisStage {
    tts: ModelLane<dyn TtsBackend>,
    response_dir: PathBuf,
    language: String,
}

impl SynthesisStage {
    pub fn new(tts: Arc<dyn TtsBackend>, response_dir: impl Into<PathBuf>, language: impl Into<String>) -> Self {
        Self {
            tts: ModelLane::new("tts", tts),
            response_dir: response_dir.into(),
            language: language.into(),
        }
    }

    pub fn response_dir(&self) -> &Path {
        &self.response_dir
    }

    pub fn lane(&self) -> &ModelLane<dyn TtsBackend> {
        &self.tts
    }

    /// Every call gets a fresh id; an existing file is never overwritten.
    pub async fn synthesize(&self, text: &str, reference: &Path) -> Result<SynthesizedAudio, PipelineError> {
        let request = SynthesisRequest {
            text: text.to_string(),
            reference_wav: reference.to_path_buf(),
            language: self.language.clone(),
        };
        debug!(
            target: "voxchat::pipeline",
            backend = self.tts.backend().name(),
            reference = %reference.display(),
            "Synthesizing {} chars",
            text.chars().count()
        );
        let audio = self
            .tts
            .run(|tts| tts.synthesize(&request))
            .await
            .map_err(|e| PipelineError::SynthesisFailed(e.to_string()))?;
        if audio.is_empty() {
            return Err(PipelineError::SynthesisFailed(
                "TTS backend returned no audio".to_string(),
            ));
        }

        tokio::fs::create_dir_all(&self.response_dir).await?;
        let id = uuid::Uuid::new_v4().to_string();
        let path = self.response_dir.join(format!("{}.{}", id, CANONICAL_EXTENSION));
        write_artifact(&path, &audio).await?;

        info!(target: "voxchat::pipeline", "Synthesized {} ({} bytes)", path.display(), audio.len());
        Ok(SynthesizedAudio {
            id,
            path,
            bytes_written: audio.len(),
        })
    }
}

/// Create `path` (never overwriting) and fill it. A failed write removes the file again.
async fn write_artifact(path: &Path, audio: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    let written = async {
        file.write_all(audio).await?;
        file.flush().await
    }
    .await;
    drop(file);
    discard_on_error(path, written).await
}

async fn discard_on_error<T>(path: &Path, result: std::io::Result<T>) -> std::io::Result<T> {
    if result.is_err() {
        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!(target: "voxchat::pipeline", "Could not remove partial artifact {}: {}", path.display(), e);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use voxchat_voice::{pcm_f32_to_wav, PlaceholderTts, VoiceError, VoiceResult};

    struct Silent;

    #[async_trait]
    impl TtsBackend for Silent {
        async fn synthesize(&self, _request: &SynthesisRequest) -> VoiceResult<Vec<u8>> {
            Ok(Vec::new())
        }
        fn name(&self) -> &'static str {
            "silent"
        }
    }

    struct Broken;

    #[async_trait]
    impl TtsBackend for Broken {
        async fn synthesize(&self, _request: &SynthesisRequest) -> VoiceResult<Vec<u8>> {
            Err(VoiceError::Tts("model crashed".to_string()))
        }
        fn name(&self) -> &'static str {
            "broken"
        }
    }

    fn reference(dir: &Path) -> PathBuf {
        let path = dir.join("ref.wav");
        std::fs::write(&path, pcm_f32_to_wav(&[0.1; 1600], 16_000).unwrap()).unwrap();
        path
    }

    #[tokio::test]
    async fn writes_fresh_artifact_per_call() {
        let dir = tempfile::tempdir().unwrap();
        let reference = reference(dir.path());
        let stage = SynthesisStage::new(Arc::new(PlaceholderTts), dir.path().join("responses"), "en");

        let a = stage.synthesize("[neutral] hello", &reference).await.unwrap();
        let b = stage.synthesize("[neutral] hello", &reference).await.unwrap();
        assert_ne!(a.id, b.id);
        assert!(a.path.starts_with(dir.path().join("responses")));
        assert_eq!(std::fs::metadata(&a.path).unwrap().len() as usize, a.bytes_written);
        assert!(hound::WavReader::open(&b.path).is_ok());
        assert_eq!(stage.lane().calls(), 2);
    }

    #[tokio::test]
    async fn empty_output_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let reference = reference(dir.path());
        let stage = SynthesisStage::new(Arc::new(Silent), dir.path().join("responses"), "en");
        let err = stage.synthesize("hi", &reference).await.unwrap_err();
        assert!(matches!(err, PipelineError::SynthesisFailed(_)));
    }

    #[tokio::test]
    async fn backend_error_carries_details() {
        let dir = tempfile::tempdir().unwrap();
        let reference = reference(dir.path());
        let stage = SynthesisStage::new(Arc::new(Broken), dir.path().join("responses"), "en");
        match stage.synthesize("hi", &reference).await {
            Err(PipelineError::SynthesisFailed(detail)) => assert!(detail.contains("model crashed")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn failed_write_leaves_no_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.wav");
        std::fs::write(&path, b"RIFF\0\0").unwrap();
        let failed: std::io::Result<()> = Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"));
        let err = discard_on_error(&path, failed).await.unwrap_err();
        assert_eq!(err.to_string(), "disk full");
        assert!(!path.exists());

        let kept = dir.path().join("complete.wav");
        std::fs::write(&kept, b"RIFF").unwrap();
        discard_on_error(&kept, Ok(())).await.unwrap();
        assert!(kept.exists());
    }

    #[tokio::test]
    async fn artifact_write_never_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taken.wav");
        std::fs::write(&path, b"original").unwrap();
        let err = write_artifact(&path, b"new audio").await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::AlreadyExists);
        assert_eq!(std::fs::read(&path).unwrap(), b"original");

        let fresh = dir.path().join("fresh.wav");
        write_artifact(&fresh, b"new audio").await.unwrap();
        assert_eq!(std::fs::read(&fresh).unwrap(), b"new audio");
    }

    #[tokio::test]
    async fn unreadable_reference_fails_synthesis() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("bogus.wav");
        std::fs::write(&bogus, b"not riff").unwrap();
        let stage = SynthesisStage::new(Arc::new(PlaceholderTts), dir.path().join("responses"), "en");
        assert!(matches!(
            stage.synthesize("hi", &bogus).await,
            Err(PipelineError::SynthesisFailed(_))
        ));
    }
}
