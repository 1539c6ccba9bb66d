use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum SttError {
    #[error("model not loaded")]
    ModelNotLoaded,
    #[error("decode failed: {0}")]
    DecodeFailed(String),
    #[error("invalid audio format")]
    InvalidAudioFormat,
}

pub type Result<T> = std::result::Result<T, SttError>;

/// Standard sample rate for decoding.
pub const STT_SAMPLE_RATE: u32 = 16_000;

/// Black-box speech-to-text decoder over a finite audio buffer.
///
/// Empty text is a normal outcome (the segment had no recognizable
/// speech). An error disables decoding for the remainder of the session;
/// audio capture and diarization continue without it.
pub trait SttEngine: Send {
    /// Decode mono f32 samples at the given sample rate into text.
    fn transcribe(&self, audio: &[f32], sample_rate: u32) -> Result<String>;

    /// Decode an audio file directly.
    ///
    /// Default implementation reads the WAV file and calls `transcribe()`.
    fn transcribe_file(&self, path: &Path) -> Result<String> {
        let samples = read_wav_mono_f32(path)?;
        self.transcribe(&samples, STT_SAMPLE_RATE)
    }

    fn model_name(&self) -> &str;
}

/// Zero-pad a buffer to a minimum decode length. Decoders tend to produce
/// garbage on very short inputs, so closed segments are padded up to
/// `min_secs` before submission.
pub fn pad_for_decode(audio: &[f32], min_secs: f32, sample_rate: u32) -> Vec<f32> {
    let need = (min_secs.max(0.0) * sample_rate as f32) as usize;
    let mut out = audio.to_vec();
    if out.len() < need {
        out.resize(need, 0.0);
    }
    out
}

/// Read a WAV file as mono f32 samples (channels averaged).
fn read_wav_mono_f32(path: &Path) -> Result<Vec<f32>> {
    let mut reader =
        hound::WavReader::open(path).map_err(|e| SttError::DecodeFailed(e.to_string()))?;
    let spec = reader.spec();
    if spec.sample_rate != STT_SAMPLE_RATE {
        return Err(SttError::InvalidAudioFormat);
    }
    let channels = spec.channels.max(1) as usize;
    let raw: Vec<i16> = reader
        .samples::<i16>()
        .map(|s| s.map_err(|e| SttError::DecodeFailed(e.to_string())))
        .collect::<Result<_>>()?;

    let mut mono = Vec::with_capacity(raw.len() / channels);
    for frame in raw.chunks(channels) {
        let sum: i32 = frame.iter().map(|&s| s as i32).sum();
        mono.push(sum as f32 / channels as f32 / i16::MAX as f32);
    }
    Ok(mono)
}
