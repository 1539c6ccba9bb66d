//! Mid-utterance speaker-change watchdog.
//!
//! Runs only while a segment is open: every embedding hop it scores the
//! most recent window against a local copy of the cluster label space
//! and decides whether the open segment should be cut early. It never
//! mutates shared clusters; the engine refreshes its centroid cache
//! from [`OnlineSpeakerClusterer::centroid_snapshot`] between segments.
//!
//! [`OnlineSpeakerClusterer::centroid_snapshot`]: crate::OnlineSpeakerClusterer::centroid_snapshot

use parley_embedding::{cosine_similarity, l2_normalize};

#[derive(Debug, Clone, Copy)]
pub struct IntrasegConfig {
    /// Window of segment audio embedded per hop.
    pub emb_win_s: f64,
    /// Hop between embeddings of the open segment.
    pub emb_hop_s: f64,
    /// Margin over the current speaker that cuts immediately.
    pub margin_strong: f32,
    /// No strong-margin cut before the segment reaches this duration.
    pub min_switch_s: f64,
    /// An opposition streak this long cuts regardless of margin.
    pub long_dominance_s: f64,
    /// Margins at or above this count toward weak-opposition persistence.
    pub weak_margin: f32,
    pub weak_min_count: u32,
    pub weak_min_duration_s: f64,
    /// Suppress further cuts for this long after any cut.
    pub cut_cooldown_s: f64,
    /// How much trailing audio a cut hands to the next segment.
    pub backtrace_s: f64,
}

impl Default for IntrasegConfig {
    fn default() -> Self {
        Self {
            emb_win_s: 1.0,
            emb_hop_s: 0.25,
            margin_strong: 0.15,
            min_switch_s: 1.2,
            long_dominance_s: 2.5,
            weak_margin: 0.05,
            weak_min_count: 4,
            weak_min_duration_s: 1.0,
            cut_cooldown_s: 2.0,
            backtrace_s: 0.5,
        }
    }
}

/// One `step()` verdict. `margin` is best-vs-current-speaker, which is
/// what the cut rules act on; `second_sim` is reported for logging.
#[derive(Debug, Clone)]
pub struct DiarizationDecision {
    pub label: String,
    pub best_sim: f32,
    pub second_sim: f32,
    pub last_sim: f32,
    pub margin: f32,
    pub cut: bool,
    pub backtrace_s: f64,
    pub reason: &'static str,
}

impl DiarizationDecision {
    fn hold(label: &str, reason: &'static str) -> Self {
        Self {
            label: label.to_string(),
            best_sim: 0.0,
            second_sim: 0.0,
            last_sim: 0.0,
            margin: 0.0,
            cut: false,
            backtrace_s: 0.0,
            reason,
        }
    }
}

pub struct IntraSegmentDiarizer {
    cfg: IntrasegConfig,
    centroids: Vec<(String, Vec<f32>)>,
    streak_s: f64,
    weak_count: u32,
    weak_s: f64,
    last_cut_s: f64,
}

impl IntraSegmentDiarizer {
    pub fn new(cfg: IntrasegConfig) -> Self {
        Self {
            cfg,
            centroids: Vec::new(),
            streak_s: 0.0,
            weak_count: 0,
            weak_s: 0.0,
            last_cut_s: f64::NEG_INFINITY,
        }
    }

    pub fn config(&self) -> &IntrasegConfig {
        &self.cfg
    }

    /// Replace the local centroid cache with the clusterer's current
    /// label space. Called by the engine at segment boundaries.
    pub fn sync_labels(&mut self, snapshot: Vec<(String, Vec<f32>)>) {
        self.centroids = snapshot;
    }

    /// Label of the most similar known centroid, without touching any
    /// opposition state. The engine uses this to resolve a segment's
    /// provisional label from the segment's own first embedding, since
    /// the label seeded at open time is whoever spoke last.
    pub fn best_match(&self, embedding: &[f32]) -> Option<String> {
        if self.centroids.is_empty() {
            return None;
        }
        let mut v = embedding.to_vec();
        l2_normalize(&mut v);
        let mut best = 0;
        let mut best_sim = f32::NEG_INFINITY;
        for (i, (_, c)) in self.centroids.iter().enumerate() {
            let s = cosine_similarity(c, &v);
            if s > best_sim {
                best_sim = s;
                best = i;
            }
        }
        Some(self.centroids[best].0.clone())
    }

    /// Score one hop of the open segment. `hop_s` is the stream time
    /// covered since the previous step (streak accounting), `now_s` the
    /// current stream time.
    pub fn step(
        &mut self,
        embedding: &[f32],
        current_label: &str,
        seg_duration_s: f64,
        hop_s: f64,
        now_s: f64,
    ) -> DiarizationDecision {
        // With fewer than two known speakers there is nothing to cut toward.
        if self.centroids.len() < 2 {
            return DiarizationDecision::hold(current_label, "too_few_speakers");
        }

        let mut v = embedding.to_vec();
        l2_normalize(&mut v);

        let sims: Vec<f32> = self
            .centroids
            .iter()
            .map(|(_, c)| cosine_similarity(c, &v))
            .collect();
        let mut best_idx = 0;
        for (i, &s) in sims.iter().enumerate() {
            if s > sims[best_idx] {
                best_idx = i;
            }
        }
        let best_sim = sims[best_idx];
        let second_sim = sims
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != best_idx)
            .map(|(_, &s)| s)
            .fold(-1.0f32, f32::max);
        let last_sim = self
            .centroids
            .iter()
            .position(|(l, _)| l == current_label)
            .map(|i| sims[i])
            .unwrap_or(best_sim);
        let margin = best_sim - last_sim;
        let best_label = self.centroids[best_idx].0.clone();

        let opposed = best_label != current_label;
        if opposed {
            self.streak_s += hop_s;
            if margin >= self.cfg.weak_margin {
                self.weak_count += 1;
                self.weak_s += hop_s;
            }
        } else {
            self.reset_streaks();
        }

        let mut decision = DiarizationDecision {
            label: current_label.to_string(),
            best_sim,
            second_sim,
            last_sim,
            margin,
            cut: false,
            backtrace_s: 0.0,
            reason: if opposed { "opposed" } else { "agree" },
        };

        if now_s - self.last_cut_s < self.cfg.cut_cooldown_s {
            decision.reason = "cooldown";
            return decision;
        }
        if !opposed {
            return decision;
        }

        let reason = if margin >= self.cfg.margin_strong && seg_duration_s >= self.cfg.min_switch_s
        {
            Some("strong_margin")
        } else if self.streak_s >= self.cfg.long_dominance_s {
            Some("long_dominance")
        } else if self.weak_count >= self.cfg.weak_min_count
            && self.weak_s >= self.cfg.weak_min_duration_s
        {
            Some("weak_persistence")
        } else {
            None
        };

        if let Some(reason) = reason {
            self.last_cut_s = now_s;
            self.reset_streaks();
            tracing::debug!(
                from = current_label,
                to = %best_label,
                margin,
                reason,
                "intra-segment speaker cut"
            );
            decision.label = best_label;
            decision.cut = true;
            decision.backtrace_s = self.cfg.backtrace_s;
            decision.reason = reason;
        }
        decision
    }

    /// Segment closed for any other reason: opposition evidence does not
    /// carry across segments.
    pub fn notify_segment_end(&mut self) {
        self.reset_streaks();
    }

    fn reset_streaks(&mut self) {
        self.streak_s = 0.0;
        self.weak_count = 0;
        self.weak_s = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn axis(dim: usize, i: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; dim];
        v[i] = 1.0;
        v
    }

    /// Unit vector between axes 0 and 1 with the given mix weights.
    fn mixed(w0: f32, w1: f32) -> Vec<f32> {
        let mut v = vec![0.0f32; 8];
        v[0] = w0;
        v[1] = w1;
        l2_normalize(&mut v);
        v
    }

    fn two_speaker_tracker(cfg: IntrasegConfig) -> IntraSegmentDiarizer {
        let mut d = IntraSegmentDiarizer::new(cfg);
        d.sync_labels(vec![("S1".into(), axis(8, 0)), ("S2".into(), axis(8, 1))]);
        d
    }

    #[test]
    fn test_best_match_reads_without_counting_opposition() {
        let empty = IntraSegmentDiarizer::new(IntrasegConfig::default());
        assert!(empty.best_match(&axis(8, 0)).is_none());

        let mut d = two_speaker_tracker(IntrasegConfig::default());
        assert_eq!(d.best_match(&axis(8, 1)).as_deref(), Some("S2"));
        // The read leaves no streak behind: stepping with the resolved
        // label counts as agreement, not opposition.
        let dec = d.step(&axis(8, 1), "S2", 2.0, 0.25, 2.0);
        assert!(!dec.cut);
        assert_eq!(dec.reason, "agree");
    }

    #[test]
    fn test_no_cut_without_second_speaker() {
        let mut d = IntraSegmentDiarizer::new(IntrasegConfig::default());
        d.sync_labels(vec![("S1".into(), axis(8, 0))]);
        let dec = d.step(&axis(8, 1), "S1", 5.0, 0.25, 5.0);
        assert!(!dec.cut);
        assert_eq!(dec.label, "S1");
    }

    #[test]
    fn test_matching_voice_never_cuts() {
        let mut d = two_speaker_tracker(IntrasegConfig::default());
        for i in 0..40 {
            let t = 1.0 + 0.25 * i as f64;
            let dec = d.step(&axis(8, 0), "S1", t, 0.25, t);
            assert!(!dec.cut);
        }
    }

    #[test]
    fn test_strong_margin_cuts_once_segment_is_long_enough() {
        let mut d = two_speaker_tracker(IntrasegConfig::default());
        // Below min_switch_s the strong margin is not enough.
        let dec = d.step(&axis(8, 1), "S1", 1.0, 0.25, 1.0);
        assert!(!dec.cut);
        let dec = d.step(&axis(8, 1), "S1", 1.5, 0.25, 1.5);
        assert!(dec.cut);
        assert_eq!(dec.label, "S2");
        assert_eq!(dec.reason, "strong_margin");
        assert!(dec.backtrace_s > 0.0);
    }

    #[test]
    fn test_long_dominance_cuts_on_sub_weak_margins() {
        let mut d = two_speaker_tracker(IntrasegConfig::default());
        // Barely favors S2: margin under the weak floor, so only the
        // streak accumulates.
        let v = mixed(1.0, 1.05);
        let mut cut_at = None;
        for i in 0..20 {
            let t = 2.0 + 0.25 * i as f64;
            let dec = d.step(&v, "S1", t, 0.25, t);
            assert!(dec.margin < d.cfg.weak_margin);
            if dec.cut {
                cut_at = Some((i, dec));
                break;
            }
        }
        let (i, dec) = cut_at.expect("streak should force a cut");
        assert_eq!(dec.reason, "long_dominance");
        assert_eq!(dec.label, "S2");
        // 2.5s of opposition at 0.25s hops.
        assert_eq!(i, 9);
    }

    #[test]
    fn test_weak_persistence_cuts_before_long_dominance() {
        let mut d = two_speaker_tracker(IntrasegConfig::default());
        // Margin between weak and strong floors.
        let v = mixed(1.0, 1.15);
        let mut cut = None;
        for i in 0..20 {
            let t = 2.0 + 0.25 * i as f64;
            let dec = d.step(&v, "S1", t, 0.25, t);
            assert!(dec.margin >= d.cfg.weak_margin && dec.margin < d.cfg.margin_strong);
            if dec.cut {
                cut = Some(dec);
                break;
            }
        }
        assert_eq!(cut.expect("weak opposition should cut").reason, "weak_persistence");
    }

    #[test]
    fn test_agreement_resets_opposition_evidence() {
        let mut d = two_speaker_tracker(IntrasegConfig::default());
        let weak = mixed(1.0, 1.15);
        for i in 0..3 {
            let t = 2.0 + 0.25 * i as f64;
            assert!(!d.step(&weak, "S1", t, 0.25, t).cut);
        }
        // One agreeing hop wipes the streaks; three more weak hops stay
        // under both persistence floors.
        d.step(&axis(8, 0), "S1", 2.75, 0.25, 2.75);
        for i in 0..3 {
            let t = 3.0 + 0.25 * i as f64;
            assert!(!d.step(&weak, "S1", t, 0.25, t).cut);
        }
    }

    #[test]
    fn test_cooldown_suppresses_back_to_back_cuts() {
        let mut d = two_speaker_tracker(IntrasegConfig::default());
        let dec = d.step(&axis(8, 1), "S1", 2.0, 0.25, 10.0);
        assert!(dec.cut);
        // Opposite direction right after: inside the cooldown.
        let dec = d.step(&axis(8, 0), "S2", 2.0, 0.25, 10.5);
        assert!(!dec.cut);
        assert_eq!(dec.reason, "cooldown");
        // Past the cooldown the same evidence cuts again.
        let mut last = None;
        for i in 0..4 {
            let t = 12.5 + 0.25 * i as f64;
            last = Some(d.step(&axis(8, 0), "S2", 2.0 + 0.25 * i as f64, 0.25, t));
            if last.as_ref().unwrap().cut {
                break;
            }
        }
        assert!(last.unwrap().cut);
    }
}
