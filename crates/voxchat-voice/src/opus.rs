//! Opus decoding for browser recordings (WebM/Ogg) through libopus.
//!
//! Symphonia demuxes the container and hands over raw Opus packets; each packet is decoded
//! at 48 kHz, the encoder pre-skip is dropped and the result goes through the usual mono
//! 16 kHz mixdown.

use crate::audio::{next_track_packet, to_mono_16k, DecodedAudio};
use crate::error::{VoiceError, VoiceResult};
use audiopus::coder::Decoder;
use audiopus::{Channels, SampleRate};
use symphonia::core::codecs::CodecParameters;
use symphonia::core::formats::FormatReader;
use tracing::{debug, warn};

/// Opus always decodes at 48 kHz regardless of the input bandwidth.
pub const OPUS_SAMPLE_RATE: u32 = 48_000;

/// 120 ms at 48 kHz, the longest frame a single packet can carry.
const MAX_FRAME_SAMPLES: usize = 5_760;

pub(crate) fn decode_track(
    format: &mut dyn FormatReader,
    track_id: u32,
    params: &CodecParameters,
) -> VoiceResult<DecodedAudio> {
    let channel_count = params.channels.map(|c| c.count()).unwrap_or(1);
    let channels = match channel_count {
        1 => Channels::Mono,
        2 => Channels::Stereo,
        n => {
            return Err(VoiceError::UnsupportedAudioFormat(format!(
                "Opus stream with {} channels",
                n
            )))
        }
    };
    let mut decoder = Decoder::new(SampleRate::Hz48000, channels)
        .map_err(|e| VoiceError::UnsupportedAudioFormat(format!("Opus decoder: {}", e)))?;

    let mut frame = vec![0.0f32; MAX_FRAME_SAMPLES * channel_count];
    let mut interleaved: Vec<f32> = Vec::new();
    while let Some(packet) = next_track_packet(format, track_id)? {
        if packet.buf().is_empty() {
            continue;
        }
        match decoder.decode_float(Some(packet.buf()), &mut frame[..], false) {
            Ok(per_channel) => interleaved.extend_from_slice(&frame[..per_channel * channel_count]),
            Err(e) => warn!(target: "voxchat::voice", "Skipping undecodable Opus packet: {}", e),
        }
    }

    let pre_skip = params.delay.unwrap_or(0) as usize * channel_count;
    interleaved.drain(..pre_skip.min(interleaved.len()));
    if interleaved.is_empty() {
        return Err(VoiceError::UnsupportedAudioFormat(
            "no decodable audio frames".to_string(),
        ));
    }
    debug!(
        target: "voxchat::voice",
        "Decoded {} Opus frames ({} ch)",
        interleaved.len() / channel_count,
        channel_count
    );

    Ok(DecodedAudio {
        samples: to_mono_16k(&interleaved, channel_count, OPUS_SAMPLE_RATE),
        source_sample_rate: OPUS_SAMPLE_RATE,
        source_channels: channel_count,
    })
}
