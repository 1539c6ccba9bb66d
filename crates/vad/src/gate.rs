//! Speech gate state machine.
//!
//! Wraps a [`SpeechClassifier`] with start/stop hysteresis: `idle` waits for
//! a run of consecutive speech frames, `speaking` waits for a hangover of
//! non-speech frames plus a bridge tolerance that rides over short pauses.

use crate::{EnergyClassifier, SpeechClassifier, VadConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateEvent {
    SpeechStart,
    SpeechEnd,
}

pub struct SpeechGate {
    classifier: Box<dyn SpeechClassifier>,
    cfg: VadConfig,
    start_frames: u32,
    stop_frames: u32,
    bridge_frames: u32,
    in_speech: bool,
    start_count: u32,
    stop_count: u32,
    gap_count: u32,
}

impl SpeechGate {
    /// Build a gate around the adaptive energy classifier.
    pub fn new(cfg: VadConfig) -> Self {
        Self::with_classifier(cfg, Box::new(EnergyClassifier::new(cfg)))
    }

    /// Build a gate around an external backend, falling back to the energy
    /// classifier if the backend fails to initialize. The fallback is logged
    /// and never fatal.
    pub fn with_backend<F>(cfg: VadConfig, init: F) -> Self
    where
        F: FnOnce() -> crate::Result<Box<dyn SpeechClassifier>>,
    {
        let classifier = match init() {
            Ok(backend) => {
                tracing::info!(backend = backend.name(), "VAD backend ready");
                backend
            }
            Err(e) => {
                tracing::warn!("VAD backend init failed ({e}); falling back to energy gate");
                Box::new(EnergyClassifier::new(cfg))
            }
        };
        Self::with_classifier(cfg, classifier)
    }

    pub fn with_classifier(cfg: VadConfig, classifier: Box<dyn SpeechClassifier>) -> Self {
        let frame_ms = cfg.frame_secs() * 1000.0;
        let start_frames = ((cfg.min_speech_ms / frame_ms).round() as u32).max(1);
        let stop_frames = ((cfg.hangover_ms / frame_ms).round() as u32).max(start_frames);
        let bridge_frames = (cfg.bridge_ms / frame_ms).round() as u32;
        tracing::debug!(
            backend = classifier.name(),
            start_frames,
            stop_frames,
            bridge_frames,
            "speech gate configured"
        );
        Self {
            classifier,
            cfg,
            start_frames,
            stop_frames,
            bridge_frames,
            in_speech: false,
            start_count: 0,
            stop_count: 0,
            gap_count: 0,
        }
    }

    pub fn in_speech(&self) -> bool {
        self.in_speech
    }

    pub fn config(&self) -> &VadConfig {
        &self.cfg
    }

    /// Feed one frame; returns a transition event when the state flips.
    pub fn push_frame(&mut self, frame: &[f32]) -> Option<GateEvent> {
        let speech = match self.classifier.classify(frame, self.in_speech) {
            Ok(speech) => speech,
            Err(e) => {
                tracing::warn!("VAD classification error: {e}");
                false
            }
        };

        if !self.in_speech {
            if speech {
                self.start_count += 1;
                if self.start_count >= self.start_frames {
                    self.in_speech = true;
                    self.start_count = 0;
                    self.stop_count = 0;
                    self.gap_count = 0;
                    return Some(GateEvent::SpeechStart);
                }
            } else {
                self.start_count = 0;
            }
            return None;
        }

        if speech {
            self.stop_count = 0;
            self.gap_count = 0;
            return None;
        }
        self.stop_count += 1;
        self.gap_count += 1;
        if self.stop_count >= self.stop_frames && self.gap_count > self.bridge_frames {
            self.in_speech = false;
            self.start_count = 0;
            self.stop_count = 0;
            self.gap_count = 0;
            return Some(GateEvent::SpeechEnd);
        }
        None
    }

    /// Force the gate back to idle (used when the accumulator closes a
    /// segment for a reason the gate did not see, e.g. a speaker cut).
    pub fn force_idle(&mut self) {
        self.in_speech = false;
        self.start_count = 0;
        self.stop_count = 0;
        self.gap_count = 0;
    }

    pub fn reset(&mut self) {
        self.force_idle();
        self.classifier.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Result;

    /// Scripted classifier for state machine tests.
    struct Scripted(Vec<bool>, usize);

    impl SpeechClassifier for Scripted {
        fn classify(&mut self, _frame: &[f32], _in_speech: bool) -> Result<bool> {
            let v = self.0[self.1.min(self.0.len() - 1)];
            self.1 += 1;
            Ok(v)
        }
        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    fn gate_with_script(script: Vec<bool>) -> SpeechGate {
        let cfg = VadConfig {
            min_speech_ms: 60.0,  // 3 frames
            hangover_ms: 100.0,   // 5 frames
            bridge_ms: 0.0,
            ..VadConfig::default()
        };
        SpeechGate::with_classifier(cfg, Box::new(Scripted(script, 0)))
    }

    fn run(gate: &mut SpeechGate, frames: usize) -> Vec<GateEvent> {
        let frame = vec![0.0f32; 320];
        (0..frames).filter_map(|_| gate.push_frame(&frame)).collect()
    }

    #[test]
    fn test_start_requires_consecutive_speech() {
        // Two speech frames, a break, then three: only the run of three opens.
        let mut gate = gate_with_script(vec![true, true, false, true, true, true, false]);
        let events = run(&mut gate, 6);
        assert_eq!(events, vec![GateEvent::SpeechStart]);
    }

    #[test]
    fn test_stop_requires_hangover() {
        let mut script = vec![true; 5];
        script.extend(vec![false; 5]);
        let mut gate = gate_with_script(script);
        let events = run(&mut gate, 10);
        assert_eq!(events, vec![GateEvent::SpeechStart, GateEvent::SpeechEnd]);
    }

    #[test]
    fn test_bridge_rides_over_short_pause() {
        let cfg = VadConfig {
            min_speech_ms: 60.0,
            hangover_ms: 100.0,
            bridge_ms: 160.0, // 8 frames: hangover alone cannot close the gate
            ..VadConfig::default()
        };
        let mut script = vec![true; 5];
        script.extend(vec![false; 6]); // longer than hangover, shorter than bridge
        script.extend(vec![true; 3]);
        let mut gate = SpeechGate::with_classifier(cfg, Box::new(Scripted(script, 0)));
        let events = run(&mut gate, 14);
        assert_eq!(events, vec![GateEvent::SpeechStart]);
        assert!(gate.in_speech());
    }

    #[test]
    fn test_backend_failure_falls_back_to_energy() {
        let cfg = VadConfig::default();
        let gate = SpeechGate::with_backend(cfg, || {
            Err(crate::VadError::BackendInit("model missing".into()))
        });
        assert!(!gate.in_speech());
    }

    #[test]
    fn test_silence_never_opens_gate() {
        let cfg = VadConfig::default();
        let mut gate = SpeechGate::new(cfg);
        let frame = vec![0.0f32; cfg.frame_samples];
        for _ in 0..2_000 {
            assert!(gate.push_frame(&frame).is_none());
        }
        assert!(!gate.in_speech());
    }
}
