//! Audio normalizer: arbitrary uploaded container → canonical mono 16 kHz 16-bit WAV.
//!
//! Uploads are stored as `<id>.<ext>`. A `.wav` upload that already parses as WAV is kept
//! untouched; everything else is decoded with symphonia, mixed down to mono, resampled to
//! 16 kHz and written as `<id>.wav`.

use crate::error::{VoiceError, VoiceResult};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL, CODEC_TYPE_OPUS};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, Packet};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, info, warn};

/// Sample rate of the canonical container (Whisper standard).
pub const CANONICAL_SAMPLE_RATE: u32 = 16000;

/// Extension of the canonical container.
pub const CANONICAL_EXTENSION: &str = "wav";

/// Mono f32 PCM at [`CANONICAL_SAMPLE_RATE`], plus what the source looked like.
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub source_sample_rate: u32,
    pub source_channels: usize,
}

impl DecodedAudio {
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / CANONICAL_SAMPLE_RATE as f64)
    }
}

/// Result of normalizing one upload.
#[derive(Debug, Clone)]
pub struct NormalizedAudio {
    /// Generated clip id (file stem of both paths).
    pub id: String,
    /// Where the raw upload was written.
    pub original_path: PathBuf,
    /// Canonical WAV used by the downstream stages.
    pub wav_path: PathBuf,
    /// True when the upload had to be decoded and re-encoded.
    pub converted: bool,
    pub duration: Duration,
}

/// Stores uploads under `upload_dir` and produces canonical WAV files.
#[derive(Debug, Clone)]
pub struct AudioNormalizer {
    upload_dir: PathBuf,
}

impl AudioNormalizer {
    pub fn new(upload_dir: impl Into<PathBuf>) -> Self {
        Self {
            upload_dir: upload_dir.into(),
        }
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    /// Store `bytes` as `<id>.<ext>` and make sure a canonical `<id>.wav` exists.
    /// Fails with [`VoiceError::UnsupportedAudioFormat`] when the bytes cannot be decoded.
    pub fn normalize(
        &self,
        id: &str,
        original_filename: &str,
        bytes: &[u8],
    ) -> VoiceResult<NormalizedAudio> {
        std::fs::create_dir_all(&self.upload_dir)?;
        let ext = extension_of(original_filename);
        let original_path = self.upload_dir.join(format!("{}.{}", id, ext));
        std::fs::write(&original_path, bytes)?;
        debug!(target: "voxchat::voice", "Saved upload {} to {}", original_filename, original_path.display());

        if ext == CANONICAL_EXTENSION {
            if let Some(duration) = probe_wav(&original_path) {
                return Ok(NormalizedAudio {
                    id: id.to_string(),
                    wav_path: original_path.clone(),
                    original_path,
                    converted: false,
                    duration,
                });
            }
            warn!(target: "voxchat::voice", "{} has a .wav name but is not RIFF/WAV; decoding", original_filename);
        }

        let wav_path = self.upload_dir.join(format!("{}.{}", id, CANONICAL_EXTENSION));
        let decoded = convert_to_wav(bytes, Some(ext.as_str()), &wav_path)?;
        info!(
            target: "voxchat::voice",
            "Converted {} ({} Hz, {} ch) to {}",
            original_filename,
            decoded.source_sample_rate,
            decoded.source_channels,
            wav_path.display()
        );
        Ok(NormalizedAudio {
            id: id.to_string(),
            original_path,
            wav_path,
            converted: true,
            duration: decoded.duration(),
        })
    }
}

/// Lowercased extension of `filename`, or `bin` when it has none (or a non-alphanumeric one).
pub fn extension_of(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .filter(|e| !e.is_empty() && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| "bin".to_string())
}

/// Duration of a readable WAV file, `None` when hound cannot parse it.
fn probe_wav(path: &Path) -> Option<Duration> {
    let reader = hound::WavReader::open(path).ok()?;
    let spec = reader.spec();
    if spec.sample_rate == 0 {
        return None;
    }
    Some(Duration::from_secs_f64(
        reader.duration() as f64 / spec.sample_rate as f64,
    ))
}

/// Decode `bytes` and write them to `dest` as canonical WAV.
pub fn convert_to_wav(bytes: &[u8], ext_hint: Option<&str>, dest: &Path) -> VoiceResult<DecodedAudio> {
    let decoded = decode_to_mono_16k(bytes, ext_hint)?;
    let wav = pcm_f32_to_wav(&decoded.samples, CANONICAL_SAMPLE_RATE)?;
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(dest, wav)?;
    Ok(decoded)
}

/// Read any decodable audio file into mono 16 kHz f32 PCM.
pub fn read_mono_16k(path: &Path) -> VoiceResult<DecodedAudio> {
    let bytes = std::fs::read(path)?;
    let ext = path.extension().and_then(|e| e.to_str());
    decode_to_mono_16k(&bytes, ext)
}

/// Decode the first audio track in `bytes` to mono 16 kHz f32 PCM.
pub fn decode_to_mono_16k(bytes: &[u8], ext_hint: Option<&str>) -> VoiceResult<DecodedAudio> {
    let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes.to_vec())), Default::default());
    let mut hint = Hint::new();
    if let Some(ext) = ext_hint {
        hint.with_extension(ext);
    }
    let probed = symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;
    let mut format = probed.format;
    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| VoiceError::UnsupportedAudioFormat("no audio track".to_string()))?;
    let track_id = track.id;
    let params = track.codec_params.clone();

    // Symphonia demuxes Opus (WebM/Ogg from browser recorders) but ships no decoder for it.
    if params.codec == CODEC_TYPE_OPUS {
        #[cfg(feature = "opus")]
        return crate::opus::decode_track(format.as_mut(), track_id, &params);
        #[cfg(not(feature = "opus"))]
        return Err(VoiceError::UnsupportedAudioFormat(
            "Opus audio requires the `opus` feature".to_string(),
        ));
    }

    let mut decoder = symphonia::default::get_codecs().make(&params, &DecoderOptions::default())?;

    let mut interleaved: Vec<f32> = Vec::new();
    let mut sample_rate = params.sample_rate.unwrap_or(0);
    let mut channels = params.channels.map(|c| c.count()).unwrap_or(0);

    while let Some(packet) = next_track_packet(format.as_mut(), track_id)? {
        match decoder.decode(&packet) {
            Ok(buf) => {
                let spec = *buf.spec();
                sample_rate = spec.rate;
                channels = spec.channels.count();
                let mut samples = SampleBuffer::<f32>::new(buf.capacity() as u64, spec);
                samples.copy_interleaved_ref(buf);
                interleaved.extend_from_slice(samples.samples());
            }
            // Corrupt packet: skip it, the rest of the stream may still decode.
            Err(SymphoniaError::DecodeError(e)) => {
                warn!(target: "voxchat::voice", "Skipping undecodable packet: {}", e);
            }
            Err(e) => return Err(e.into()),
        }
    }

    if interleaved.is_empty() || sample_rate == 0 || channels == 0 {
        return Err(VoiceError::UnsupportedAudioFormat(
            "no decodable audio frames".to_string(),
        ));
    }

    Ok(DecodedAudio {
        samples: to_mono_16k(&interleaved, channels, sample_rate),
        source_sample_rate: sample_rate,
        source_channels: channels,
    })
}

/// Next packet belonging to `track_id`, or `None` at end of stream.
pub(crate) fn next_track_packet(
    format: &mut dyn FormatReader,
    track_id: u32,
) -> VoiceResult<Option<Packet>> {
    loop {
        match format.next_packet() {
            Ok(p) if p.track_id() == track_id => return Ok(Some(p)),
            Ok(_) => continue,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(None)
            }
            Err(SymphoniaError::ResetRequired) => return Ok(None),
            Err(e) => return Err(e.into()),
        }
    }
}

/// Convert interleaved multi-channel at any rate to mono 16 kHz (nearest-sample resampling).
pub fn to_mono_16k(samples: &[f32], channels: usize, from_rate: u32) -> Vec<f32> {
    if channels == 0 || samples.is_empty() || from_rate == 0 {
        return Vec::new();
    }
    let mono: Vec<f32> = if channels == 1 {
        samples.to_vec()
    } else {
        samples
            .chunks_exact(channels)
            .map(|c| c.iter().sum::<f32>() / channels as f32)
            .collect()
    };
    if from_rate == CANONICAL_SAMPLE_RATE {
        return mono;
    }
    let out_len = (mono.len() as u64 * CANONICAL_SAMPLE_RATE as u64 / from_rate as u64) as usize;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let src_idx = (i as f64 * from_rate as f64 / CANONICAL_SAMPLE_RATE as f64) as usize;
        if src_idx >= mono.len() {
            break;
        }
        out.push(mono[src_idx]);
    }
    out
}

/// Encode mono f32 PCM to 16-bit WAV bytes.
pub fn pcm_f32_to_wav(samples: &[f32], sample_rate: u32) -> VoiceResult<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for &s in samples {
            let clamped = s.clamp(-1.0, 1.0);
            writer.write_sample((clamped * 32767.0).round() as i16)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}
