//! Adaptive energy (RMS) speech classifier.
//!
//! Maintains a noise floor that is seeded from a short calibration window
//! and then tracked exponentially while no speech is present. Start/stop
//! thresholds are derived from the floor and clamped to a fixed range.

use crate::{frame_rms, Result, SpeechClassifier, VadConfig};

pub struct EnergyClassifier {
    cfg: VadConfig,
    noise_floor: f32,
    start_threshold: f32,
    stop_threshold: f32,
    calibration: Vec<f32>,
    calibration_frames: usize,
    calibrated: bool,
}

impl EnergyClassifier {
    pub fn new(cfg: VadConfig) -> Self {
        let calibration_frames =
            ((cfg.calibration_secs / cfg.frame_secs()).round() as usize).max(1);
        let mut this = Self {
            cfg,
            noise_floor: cfg.noise_floor,
            start_threshold: 0.0,
            stop_threshold: 0.0,
            calibration: Vec::with_capacity(calibration_frames),
            calibration_frames,
            calibrated: false,
        };
        this.update_thresholds();
        this
    }

    pub fn start_threshold(&self) -> f32 {
        self.start_threshold
    }

    pub fn stop_threshold(&self) -> f32 {
        self.stop_threshold
    }

    pub fn noise_floor(&self) -> f32 {
        self.noise_floor
    }

    fn update_thresholds(&mut self) {
        let clamp = |v: f32| v.clamp(self.cfg.threshold_min, self.cfg.threshold_max);
        self.start_threshold = clamp(self.noise_floor * self.cfg.start_multiplier);
        self.stop_threshold = clamp(self.noise_floor * self.cfg.stop_multiplier);
    }

    /// Seed the noise floor from the calibration window once enough frames
    /// have been observed. Uses (median + p95) / 2 so that a burst of speech
    /// during calibration does not dominate the estimate.
    fn maybe_calibrate(&mut self, rms: f32) {
        if self.calibrated {
            return;
        }
        self.calibration.push(rms);
        if self.calibration.len() < self.calibration_frames {
            return;
        }
        let mut values = std::mem::take(&mut self.calibration);
        values.sort_by(|a, b| a.total_cmp(b));
        let median = values[values.len() / 2];
        let p95 = values[((values.len() - 1) as f32 * 0.95).round() as usize];
        self.noise_floor = ((median + p95) / 2.0).max(self.cfg.threshold_min);
        self.calibrated = true;
        self.update_thresholds();
        // Clamping can invert the pair; keep start strictly above stop.
        if self.start_threshold <= self.stop_threshold {
            self.start_threshold = (self.stop_threshold * 1.1).min(self.cfg.threshold_max);
            self.stop_threshold = (self.start_threshold * 0.7).max(self.cfg.threshold_min);
        }
        tracing::info!(
            noise_floor = self.noise_floor,
            start = self.start_threshold,
            stop = self.stop_threshold,
            "energy gate calibrated"
        );
    }
}

impl SpeechClassifier for EnergyClassifier {
    fn classify(&mut self, frame: &[f32], in_speech: bool) -> Result<bool> {
        let rms = frame_rms(frame);
        self.maybe_calibrate(rms);
        // Track the noise floor only on clearly quiet frames outside speech.
        if !in_speech && rms < self.stop_threshold * 0.9 {
            self.noise_floor = 0.98 * self.noise_floor + 0.02 * rms;
            self.update_thresholds();
        }
        let threshold = if in_speech {
            self.stop_threshold
        } else {
            self.start_threshold
        };
        Ok(rms >= threshold)
    }

    fn name(&self) -> &'static str {
        "energy"
    }

    fn reset(&mut self) {
        self.noise_floor = self.cfg.noise_floor;
        self.calibration.clear();
        self.calibrated = false;
        self.update_thresholds();
    }
}
