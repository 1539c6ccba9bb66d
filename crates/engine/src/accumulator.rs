//! Segment accumulation with pre-roll, tail carry, and backtrace cuts.

use std::collections::VecDeque;

#[derive(Debug, Clone, Copy)]
pub struct SegmentConfig {
    /// Segments shorter than half this are discarded after backtracing.
    pub min_turn_s: f64,
    /// Forced close ceiling while the speaker keeps talking.
    pub max_turn_s: f64,
    /// Audio kept ahead of the detection point, so word onsets survive.
    pub preroll_ms: u64,
    /// Trailing audio re-seeded into the next segment for continuity
    /// across forced cuts.
    pub tail_carry_s: f64,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            min_turn_s: 0.8,
            max_turn_s: 30.0,
            preroll_ms: 240,
            tail_carry_s: 0.3,
        }
    }
}

/// Audio finalized out of the accumulator, positioned in stream samples.
#[derive(Debug, Clone)]
pub struct ClosedSegment {
    pub start_sample: u64,
    pub samples: Vec<f32>,
}

impl ClosedSegment {
    pub fn start_s(&self, sample_rate: u32) -> f64 {
        self.start_sample as f64 / sample_rate as f64
    }

    pub fn end_s(&self, sample_rate: u32) -> f64 {
        (self.start_sample + self.samples.len() as u64) as f64 / sample_rate as f64
    }

    pub fn duration_s(&self, sample_rate: u32) -> f64 {
        self.samples.len() as f64 / sample_rate as f64
    }
}

struct OpenSegment {
    start_sample: u64,
    samples: Vec<f32>,
}

/// At most one segment is open at a time. While idle, incoming frames
/// fill a bounded pre-roll ring; opening a segment seeds it with that
/// ring plus any audio carried over from the previous close.
pub struct SegmentAccumulator {
    cfg: SegmentConfig,
    sample_rate: u32,
    preroll: VecDeque<Vec<f32>>,
    preroll_cap_frames: usize,
    /// Backtrace remainder + tail from the last close.
    carry: Vec<f32>,
    open: Option<OpenSegment>,
}

impl SegmentAccumulator {
    pub fn new(cfg: SegmentConfig, sample_rate: u32, frame_samples: usize) -> Self {
        let frame_ms = frame_samples as f64 * 1000.0 / sample_rate as f64;
        let preroll_cap_frames = ((cfg.preroll_ms as f64 / frame_ms).ceil() as usize).max(1);
        Self {
            cfg,
            sample_rate,
            preroll: VecDeque::with_capacity(preroll_cap_frames + 1),
            preroll_cap_frames,
            carry: Vec::new(),
            open: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    pub fn start_sample(&self) -> Option<u64> {
        self.open.as_ref().map(|s| s.start_sample)
    }

    pub fn len_samples(&self) -> usize {
        self.open.as_ref().map(|s| s.samples.len()).unwrap_or(0)
    }

    pub fn duration_s(&self) -> f64 {
        self.len_samples() as f64 / self.sample_rate as f64
    }

    /// Most recent `n` samples of the open segment (or all of it).
    pub fn recent(&self, n: usize) -> &[f32] {
        match &self.open {
            Some(seg) => {
                let len = seg.samples.len();
                &seg.samples[len.saturating_sub(n)..]
            }
            None => &[],
        }
    }

    /// Idle-time frame: goes into the pre-roll ring.
    pub fn push_idle_frame(&mut self, frame: &[f32]) {
        debug_assert!(self.open.is_none());
        self.preroll.push_back(frame.to_vec());
        while self.preroll.len() > self.preroll_cap_frames {
            self.preroll.pop_front();
        }
    }

    /// Open a segment at stream position `stream_sample` (samples
    /// processed so far), seeded with carry + pre-roll audio.
    pub fn open(&mut self, stream_sample: u64) {
        debug_assert!(self.open.is_none());
        let mut samples = std::mem::take(&mut self.carry);
        for frame in self.preroll.drain(..) {
            samples.extend_from_slice(&frame);
        }
        let start_sample = stream_sample.saturating_sub(samples.len() as u64);
        tracing::debug!(
            start_sample,
            seeded = samples.len(),
            "segment opened"
        );
        self.open = Some(OpenSegment {
            start_sample,
            samples,
        });
    }

    pub fn push_frame(&mut self, frame: &[f32]) {
        if let Some(seg) = self.open.as_mut() {
            seg.samples.extend_from_slice(frame);
        }
    }

    /// Close the open segment, cutting `backtrace_s` off the end. The
    /// cut remainder plus a `tail_carry_s` overlap seed the next open.
    /// Returns `None` when there was no open segment or the kept audio
    /// is too short to be worth emitting (the tail is still preserved).
    pub fn close(&mut self, backtrace_s: f64) -> Option<ClosedSegment> {
        let seg = self.open.take()?;
        let rate = self.sample_rate as f64;
        let len = seg.samples.len();
        let bt = ((backtrace_s.max(0.0) * rate) as usize).min(len);
        let kept = len - bt;

        let tail = ((self.cfg.tail_carry_s.max(0.0) * rate) as usize).min(kept);
        self.carry.clear();
        self.carry.extend_from_slice(&seg.samples[kept - tail..]);

        let min_keep = (self.cfg.min_turn_s * 0.5).max(0.1);
        if (kept as f64 / rate) < min_keep {
            tracing::debug!(kept, "segment too short after backtrace; discarded");
            return None;
        }

        let mut samples = seg.samples;
        samples.truncate(kept);
        Some(ClosedSegment {
            start_sample: seg.start_sample,
            samples,
        })
    }

    /// True once the open segment hits the forced-close ceiling.
    pub fn at_max_turn(&self) -> bool {
        self.duration_s() >= self.cfg.max_turn_s
    }

    pub fn config(&self) -> &SegmentConfig {
        &self.cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 16_000;
    const FRAME: usize = 320;

    fn acc(cfg: SegmentConfig) -> SegmentAccumulator {
        SegmentAccumulator::new(cfg, RATE, FRAME)
    }

    fn frame(value: f32) -> Vec<f32> {
        vec![value; FRAME]
    }

    #[test]
    fn test_preroll_seeds_segment_before_detection_point() {
        let mut a = acc(SegmentConfig::default());
        for _ in 0..30 {
            a.push_idle_frame(&frame(0.1));
        }
        a.open(30 * FRAME as u64);
        // 240ms pre-roll = 12 frames of the 30 pushed.
        assert_eq!(a.len_samples(), 12 * FRAME);
        assert_eq!(a.start_sample(), Some((30 - 12) * FRAME as u64));
    }

    #[test]
    fn test_close_returns_accumulated_audio() {
        let mut a = acc(SegmentConfig::default());
        a.open(0);
        for _ in 0..100 {
            a.push_frame(&frame(0.2));
        }
        let seg = a.close(0.0).expect("long enough");
        assert_eq!(seg.samples.len(), 100 * FRAME);
        assert_eq!(seg.start_sample, 0);
        assert!(seg.start_s(RATE) < seg.end_s(RATE));
    }

    #[test]
    fn test_backtrace_cut_carries_remainder_into_next_open() {
        let mut a = acc(SegmentConfig {
            tail_carry_s: 0.0,
            ..SegmentConfig::default()
        });
        a.open(0);
        for _ in 0..100 {
            a.push_frame(&frame(0.2));
        }
        let stream = 100 * FRAME as u64;
        let seg = a.close(0.5).expect("long enough");
        assert_eq!(seg.samples.len(), 100 * FRAME - 8_000);
        // Reopening right away picks the cut remainder back up.
        a.open(stream);
        assert_eq!(a.len_samples(), 8_000);
        assert_eq!(a.start_sample(), Some(stream - 8_000));
    }

    #[test]
    fn test_tail_carry_overlaps_consecutive_segments() {
        let mut a = acc(SegmentConfig::default());
        a.open(0);
        for _ in 0..150 {
            a.push_frame(&frame(0.2));
        }
        let seg = a.close(0.0).expect("long enough");
        assert_eq!(seg.samples.len(), 150 * FRAME);
        a.open(150 * FRAME as u64);
        // 0.3s tail = 4800 samples shared with the finalized audio.
        assert_eq!(a.len_samples(), 4_800);
    }

    #[test]
    fn test_short_segment_discarded_but_tail_kept() {
        let mut a = acc(SegmentConfig::default());
        a.open(0);
        for _ in 0..10 {
            a.push_frame(&frame(0.2)); // 200ms < 0.4s floor
        }
        assert!(a.close(0.0).is_none());
        a.open(10 * FRAME as u64);
        assert!(a.len_samples() > 0);
    }

    #[test]
    fn test_max_turn_ceiling() {
        let mut a = acc(SegmentConfig {
            max_turn_s: 1.0,
            ..SegmentConfig::default()
        });
        a.open(0);
        for _ in 0..49 {
            a.push_frame(&frame(0.2));
        }
        assert!(!a.at_max_turn());
        a.push_frame(&frame(0.2));
        assert!(a.at_max_turn());
    }
}
