mod energy;
mod gate;

pub use energy::EnergyClassifier;
pub use gate::{GateEvent, SpeechGate};

#[derive(Debug, thiserror::Error)]
pub enum VadError {
    #[error("backend initialization failed: {0}")]
    BackendInit(String),
    #[error("classification failed: {0}")]
    Classification(String),
}

pub type Result<T> = std::result::Result<T, VadError>;

/// Per-frame speech/non-speech classifier.
///
/// `in_speech` tells the classifier which side of the hysteresis it is on;
/// adaptive backends use it to decide when the noise floor may be updated.
pub trait SpeechClassifier: Send {
    fn classify(&mut self, frame: &[f32], in_speech: bool) -> Result<bool>;

    fn name(&self) -> &'static str;

    fn reset(&mut self) {}
}

/// Tunables for the energy gate and the surrounding state machine.
///
/// Defaults assume 20ms frames of 16kHz mono audio. All values can be
/// overridden through the engine configuration surface.
#[derive(Debug, Clone, Copy)]
pub struct VadConfig {
    pub sample_rate: u32,
    pub frame_samples: usize,
    /// Initial noise floor RMS before calibration completes.
    pub noise_floor: f32,
    /// Start threshold = noise floor x this multiplier.
    pub start_multiplier: f32,
    /// Stop threshold = noise floor x this multiplier.
    pub stop_multiplier: f32,
    pub threshold_min: f32,
    pub threshold_max: f32,
    /// Seconds of audio used to seed the noise floor at startup.
    pub calibration_secs: f32,
    /// Consecutive speech frames required for idle -> speaking.
    pub min_speech_ms: f32,
    /// Consecutive non-speech frames required for speaking -> idle.
    pub hangover_ms: f32,
    /// Non-speech gaps shorter than this are bridged, not treated as a stop.
    pub bridge_ms: f32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            frame_samples: 320,
            noise_floor: 0.002,
            start_multiplier: 5.0,
            stop_multiplier: 3.5,
            threshold_min: 0.0005,
            threshold_max: 0.02,
            calibration_secs: 0.6,
            min_speech_ms: 160.0,
            hangover_ms: 300.0,
            bridge_ms: 0.0,
        }
    }
}

impl VadConfig {
    pub fn frame_secs(&self) -> f32 {
        self.frame_samples as f32 / self.sample_rate as f32
    }
}

/// Root-mean-square energy of a frame.
pub fn frame_rms(frame: &[f32]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    let sum: f64 = frame.iter().map(|&s| (s as f64) * (s as f64)).sum();
    ((sum / frame.len() as f64) + 1e-12).sqrt() as f32
}
