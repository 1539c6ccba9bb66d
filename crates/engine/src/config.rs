//! Engine configuration.
//!
//! Correct gating depends heavily on venue acoustics, so every tunable
//! can be overridden from the environment (`PARLEY_*` keys) without a
//! rebuild. Unset or unparsable values fall back to the documented
//! defaults.

use std::time::Duration;

use parley_diarization::{ClustererConfig, IntrasegConfig, TimelineConfig};
use parley_vad::VadConfig;

use crate::accumulator::SegmentConfig;

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub sample_rate: u32,
    pub vad: VadConfig,
    pub segment: SegmentConfig,
    pub clusterer: ClustererConfig,
    pub intraseg: IntrasegConfig,
    pub timeline: TimelineConfig,
    /// When false, audio accumulates as one rolling segment bounded only
    /// by `segment.max_turn_s`.
    pub vad_enabled: bool,
    /// Mid-segment speaker-cut watchdog.
    pub intraseg_enabled: bool,
    /// Sliding-window labeling stream and segment splitting.
    pub timeline_enabled: bool,
    /// Segments are padded to this length before decoding.
    pub min_decode_s: f32,
    /// How long `flush` waits for each in-flight decode.
    pub flush_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            vad: VadConfig::default(),
            segment: SegmentConfig::default(),
            clusterer: ClustererConfig::default(),
            intraseg: IntrasegConfig::default(),
            timeline: TimelineConfig::default(),
            vad_enabled: true,
            intraseg_enabled: true,
            timeline_enabled: true,
            min_decode_s: 1.0,
            flush_timeout: Duration::from_secs(5),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by any `PARLEY_*` variables present.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        cfg.vad_enabled = env_bool("PARLEY_VAD_ENABLED", cfg.vad_enabled);
        cfg.intraseg_enabled = env_bool("PARLEY_INTRASEG_ENABLED", cfg.intraseg_enabled);
        cfg.timeline_enabled = env_bool("PARLEY_TIMELINE_ENABLED", cfg.timeline_enabled);
        cfg.min_decode_s = env_f32("PARLEY_MIN_DECODE_S", cfg.min_decode_s);

        cfg.vad.noise_floor = env_f32("PARLEY_VAD_NOISE_FLOOR", cfg.vad.noise_floor);
        cfg.vad.start_multiplier = env_f32("PARLEY_VAD_START_MULT", cfg.vad.start_multiplier);
        cfg.vad.stop_multiplier = env_f32("PARLEY_VAD_STOP_MULT", cfg.vad.stop_multiplier);
        cfg.vad.min_speech_ms = env_f32("PARLEY_VAD_MIN_SPEECH_MS", cfg.vad.min_speech_ms);
        cfg.vad.hangover_ms = env_f32("PARLEY_VAD_HANGOVER_MS", cfg.vad.hangover_ms);
        cfg.vad.bridge_ms = env_f32("PARLEY_VAD_BRIDGE_MS", cfg.vad.bridge_ms);

        cfg.segment.min_turn_s = env_f64("PARLEY_MIN_TURN_S", cfg.segment.min_turn_s);
        cfg.segment.max_turn_s = env_f64("PARLEY_MAX_TURN_S", cfg.segment.max_turn_s);
        cfg.segment.preroll_ms = env_u64("PARLEY_PREROLL_MS", cfg.segment.preroll_ms);
        cfg.segment.tail_carry_s = env_f64("PARLEY_TAIL_CARRY_S", cfg.segment.tail_carry_s);

        cfg.clusterer.k_max = env_usize("PARLEY_K_MAX", cfg.clusterer.k_max);
        cfg.clusterer.boot_duration_s = env_f64("PARLEY_BOOT_DURATION_S", cfg.clusterer.boot_duration_s);
        cfg.clusterer.freeze_s = env_f64("PARLEY_CLUSTER_FREEZE_S", cfg.clusterer.freeze_s);
        cfg.clusterer.same_speaker_threshold =
            env_f32("PARLEY_SAME_SPEAKER_THRESHOLD", cfg.clusterer.same_speaker_threshold);

        cfg.intraseg.margin_strong = env_f32("PARLEY_CUT_MARGIN", cfg.intraseg.margin_strong);
        cfg.intraseg.cut_cooldown_s = env_f64("PARLEY_CUT_COOLDOWN_S", cfg.intraseg.cut_cooldown_s);

        cfg.timeline.retention_s = env_f64("PARLEY_TIMELINE_RETENTION_S", cfg.timeline.retention_s);
        cfg.timeline.hop_s = env_f64("PARLEY_TIMELINE_HOP_S", cfg.timeline.hop_s);

        cfg
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(key, value = %raw, "unparsable config override ignored");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    env_parse(key, default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env_parse(key, default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env_parse(key, default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env_parse(key, default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(raw) => matches!(raw.trim(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_consistent() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.sample_rate, cfg.vad.sample_rate);
        assert_eq!(cfg.sample_rate, cfg.timeline.sample_rate);
        assert!(cfg.segment.min_turn_s < cfg.segment.max_turn_s);
    }

    #[test]
    fn test_env_override_applies() {
        std::env::set_var("PARLEY_MAX_TURN_S", "12.5");
        let cfg = EngineConfig::from_env();
        assert_eq!(cfg.segment.max_turn_s, 12.5);
        std::env::remove_var("PARLEY_MAX_TURN_S");
    }

    #[test]
    fn test_unparsable_override_keeps_default() {
        std::env::set_var("PARLEY_K_MAX", "lots");
        let cfg = EngineConfig::from_env();
        assert_eq!(cfg.clusterer.k_max, ClustererConfig::default().k_max);
        std::env::remove_var("PARLEY_K_MAX");
    }
}
