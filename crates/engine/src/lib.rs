//! Real-time segmentation and speaker-diarization engine.
//!
//! Feed PCM16 audio through [`StreamingEngine::accept_chunk`] and poll
//! [`StreamingEngine::try_finalize`] for transcribed, speaker-attributed
//! segments. Voice activity gating, segment accumulation, and online
//! clustering run synchronously on the caller's thread; ASR decoding
//! runs on a dedicated worker so ingestion never blocks on a model.

mod accumulator;
mod config;
mod engine;
mod worker;

pub use accumulator::{ClosedSegment, SegmentAccumulator, SegmentConfig};
pub use config::EngineConfig;
pub use engine::{FinalizedSegment, StreamingEngine};
pub use worker::{DecodeOutcome, DecodeRequest, DecodeWorker};

/// Decode little-endian PCM16 bytes to f32 samples in [-1, 1). A
/// trailing odd byte is ignored; callers buffer it themselves.
pub fn pcm16_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32_768.0)
        .collect()
}

/// Encode f32 samples as little-endian PCM16, clamping out-of-range
/// values instead of wrapping.
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let v = (s.clamp(-1.0, 1.0) * 32_767.0) as i16;
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm16_round_trip() {
        let samples = vec![0.0, 0.5, -0.5, 0.999];
        let bytes = f32_to_pcm16(&samples);
        let back = pcm16_to_f32(&bytes);
        for (a, b) in samples.iter().zip(back.iter()) {
            assert!((a - b).abs() < 1e-3);
        }
    }

    #[test]
    fn test_pcm16_clamps_out_of_range() {
        let bytes = f32_to_pcm16(&[2.0, -2.0]);
        let back = pcm16_to_f32(&bytes);
        assert!((back[0] - 1.0).abs() < 1e-3);
        assert!((back[1] + 1.0).abs() < 1e-3);
    }
}
