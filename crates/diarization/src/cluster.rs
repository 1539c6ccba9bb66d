//! Variable-K online speaker clustering.
//!
//! Starts clusterless, buffers embeddings through a bootstrap window to
//! estimate the initial speaker count with an agglomerative sweep, then
//! assigns incrementally with a decision ladder that favors label
//! stability over eager switching. Distance metric throughout is
//! `1 - cosine_similarity`.

use parley_embedding::{cosine_similarity, l2_normalize};

#[derive(Debug, Clone, Copy)]
pub struct ClustererConfig {
    /// Hard ceiling on cluster count.
    pub k_max: usize,
    /// Seconds of stream time spent buffering before the initial batch
    /// clustering. Zero disables bootstrap (first embedding seeds S1).
    pub boot_duration_s: f64,
    /// Below this many buffered samples the bootstrap seeds a single
    /// cluster instead of running the sweep.
    pub boot_min_samples: usize,
    /// Bootstrap buffer cap; further samples are dropped.
    pub boot_max_samples: usize,
    /// Minimum separation score for the sweep to accept K >= 2.
    pub min_separation: f32,
    /// Utterances shorter than this stick with the active speaker unless
    /// the alternative is clearly better.
    pub min_short_s: f64,
    pub short_alt_threshold: f32,
    pub short_delta: f32,
    /// Below this duration, switching away from the active speaker
    /// requires the same clear-preference test.
    pub min_switch_s: f64,
    /// Scores above this are treated as "same speaker" regardless of
    /// which centroid nominally won.
    pub same_speaker_threshold: f32,
    /// Best-vs-active deltas below this do not justify a switch while the
    /// sticky window since the last switch is open.
    pub switch_delta: f32,
    pub sticky_s: f64,
    /// No new clusters before this stream time.
    pub freeze_s: f64,
    pub new_cluster_cooldown_s: f64,
    pub new_cluster_min_duration_s: f64,
    /// A new cluster requires similarity to every centroid below this.
    pub same_speaker_ceiling: f32,
    /// Best-vs-second margin floor for new clusters (waived below 2
    /// clusters so a second speaker can always be discovered).
    pub strong_margin: f32,
    /// Centroid EMA step bounds; the step scales with match confidence.
    pub ema_alpha_min: f32,
    pub ema_alpha_max: f32,
    pub ema_sim_lo: f32,
    pub ema_sim_hi: f32,
    pub prune_interval_s: f64,
    pub prune_min_duration_s: f64,
}

impl Default for ClustererConfig {
    fn default() -> Self {
        Self {
            k_max: 8,
            boot_duration_s: 10.0,
            boot_min_samples: 4,
            boot_max_samples: 64,
            min_separation: 0.08,
            min_short_s: 1.2,
            short_alt_threshold: 0.62,
            short_delta: 0.08,
            min_switch_s: 1.2,
            same_speaker_threshold: 0.70,
            switch_delta: 0.05,
            sticky_s: 2.0,
            freeze_s: 8.0,
            new_cluster_cooldown_s: 6.0,
            new_cluster_min_duration_s: 1.5,
            same_speaker_ceiling: 0.60,
            strong_margin: 0.12,
            ema_alpha_min: 0.02,
            ema_alpha_max: 0.12,
            ema_sim_lo: 0.50,
            ema_sim_hi: 0.85,
            prune_interval_s: 30.0,
            prune_min_duration_s: 3.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpeakerCluster {
    label: String,
    centroid: Vec<f32>,
    duration_s: f64,
}

impl SpeakerCluster {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn centroid(&self) -> &[f32] {
        &self.centroid
    }

    pub fn duration_s(&self) -> f64 {
        self.duration_s
    }
}

struct BootSample {
    start_s: f64,
    vector: Vec<f32>,
    duration_s: f64,
}

pub struct OnlineSpeakerClusterer {
    cfg: ClustererConfig,
    clusters: Vec<SpeakerCluster>,
    boot: Vec<BootSample>,
    boot_done: bool,
    active_label: Option<String>,
    last_switch_s: f64,
    last_new_cluster_s: f64,
    last_prune_s: f64,
    next_label_idx: usize,
}

impl OnlineSpeakerClusterer {
    pub fn new(cfg: ClustererConfig) -> Self {
        Self {
            cfg,
            clusters: Vec::new(),
            boot: Vec::new(),
            boot_done: cfg.boot_duration_s <= 0.0,
            active_label: None,
            last_switch_s: 0.0,
            last_new_cluster_s: f64::NEG_INFINITY,
            last_prune_s: 0.0,
            next_label_idx: 1,
        }
    }

    pub fn speaker_count(&self) -> usize {
        self.clusters.len()
    }

    pub fn active_label(&self) -> Option<&str> {
        self.active_label.as_deref()
    }

    pub fn clusters(&self) -> &[SpeakerCluster] {
        &self.clusters
    }

    /// Read-only copy of the current label space, used by the
    /// intra-segment tracker to seed its local centroid cache.
    pub fn centroid_snapshot(&self) -> Vec<(String, Vec<f32>)> {
        self.clusters
            .iter()
            .map(|c| (c.label.clone(), c.centroid.clone()))
            .collect()
    }

    /// Assign a label to an embedding spanning `[start_s, end_s)` at
    /// stream time `now_s`. The embedding need not be normalized.
    pub fn assign(&mut self, embedding: &[f32], start_s: f64, end_s: f64, now_s: f64) -> String {
        let mut v = embedding.to_vec();
        l2_normalize(&mut v);
        let duration_s = (end_s - start_s).max(0.0);

        if !self.boot_done && self.clusters.is_empty() {
            if now_s < self.cfg.boot_duration_s {
                if self.boot.len() < self.cfg.boot_max_samples {
                    self.boot.push(BootSample {
                        start_s,
                        vector: v,
                        duration_s,
                    });
                }
                return crate::FALLBACK_SPEAKER.to_string();
            }
            // Boot window expired: seed clusters, then fall through so the
            // triggering embedding gets a steady-state assignment.
            self.flush_bootstrap(now_s);
        }

        let label = self.steady_assign(&v, duration_s, now_s);
        self.maybe_prune(now_s);
        label
    }

    fn steady_assign(&mut self, v: &[f32], duration_s: f64, now_s: f64) -> String {
        if self.clusters.is_empty() {
            return self.create_cluster(v, duration_s, now_s);
        }

        let sims: Vec<f32> = self
            .clusters
            .iter()
            .map(|c| cosine_similarity(&c.centroid, v))
            .collect();
        let best_idx = argmax(&sims);
        let best = sims[best_idx];
        let second = sims
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != best_idx)
            .map(|(_, &s)| s)
            .fold(-1.0f32, f32::max);
        let margin = best - second;

        let active_idx = self
            .active_label
            .as_deref()
            .and_then(|l| self.clusters.iter().position(|c| c.label == l));
        let last_sim = active_idx.map(|i| sims[i]).unwrap_or(best);

        if let Some(active_idx) = active_idx {
            if best_idx != active_idx {
                let clearly_better = best >= self.cfg.short_alt_threshold
                    && best - last_sim >= self.cfg.short_delta;

                // Short utterances and early switches need clear preference.
                if duration_s < self.cfg.min_short_s && !clearly_better {
                    return self.merge(active_idx, v, last_sim, duration_s, now_s);
                }
                if duration_s < self.cfg.min_switch_s && !clearly_better {
                    return self.merge(active_idx, v, last_sim, duration_s, now_s);
                }

                // Both scores high: same voice heard through two centroids.
                if best >= self.cfg.same_speaker_threshold
                    && last_sim >= self.cfg.same_speaker_threshold
                {
                    return self.merge(active_idx, v, last_sim, duration_s, now_s);
                }

                // Marginal winner inside the sticky window: hold the label.
                if best - last_sim < self.cfg.switch_delta
                    && now_s - self.last_switch_s < self.cfg.sticky_s
                {
                    return self.merge(active_idx, v, last_sim, duration_s, now_s);
                }
            }
        }

        let margin_ok = self.clusters.len() < 2 || margin >= self.cfg.strong_margin;
        let can_create = self.clusters.len() < self.cfg.k_max
            && now_s >= self.cfg.freeze_s
            && now_s - self.last_new_cluster_s >= self.cfg.new_cluster_cooldown_s
            && duration_s >= self.cfg.new_cluster_min_duration_s
            && sims.iter().all(|&s| s < self.cfg.same_speaker_ceiling)
            && margin_ok;
        if can_create {
            return self.create_cluster(v, duration_s, now_s);
        }

        self.merge(best_idx, v, best, duration_s, now_s)
    }

    fn create_cluster(&mut self, v: &[f32], duration_s: f64, now_s: f64) -> String {
        debug_assert!(self.clusters.len() < self.cfg.k_max);
        let label = format!("S{}", self.next_label_idx);
        self.next_label_idx += 1;
        self.clusters.push(SpeakerCluster {
            label: label.clone(),
            centroid: v.to_vec(),
            duration_s,
        });
        self.last_new_cluster_s = now_s;
        self.note_active(&label, now_s);
        tracing::info!(label = %label, count = self.clusters.len(), "new speaker cluster");
        label
    }

    /// Fold the embedding into a cluster centroid. The EMA step scales
    /// with similarity so low-confidence matches barely move the centroid.
    fn merge(&mut self, idx: usize, v: &[f32], sim: f32, duration_s: f64, now_s: f64) -> String {
        let cfg = &self.cfg;
        let conf = ((sim - cfg.ema_sim_lo) / (cfg.ema_sim_hi - cfg.ema_sim_lo)).clamp(0.0, 1.0);
        let alpha = cfg.ema_alpha_min + (cfg.ema_alpha_max - cfg.ema_alpha_min) * conf;

        let cluster = &mut self.clusters[idx];
        for (c, &x) in cluster.centroid.iter_mut().zip(v.iter()) {
            *c = (1.0 - alpha) * *c + alpha * x;
        }
        l2_normalize(&mut cluster.centroid);
        cluster.duration_s += duration_s;
        let label = cluster.label.clone();
        self.note_active(&label, now_s);
        label
    }

    fn note_active(&mut self, label: &str, now_s: f64) {
        if self.active_label.as_deref() != Some(label) {
            self.active_label = Some(label.to_string());
            self.last_switch_s = now_s;
        }
    }

    /// Batch-cluster the bootstrap buffer and seed one centroid per group.
    fn flush_bootstrap(&mut self, now_s: f64) {
        self.boot_done = true;
        let samples = std::mem::take(&mut self.boot);
        if samples.is_empty() {
            return;
        }
        if samples.len() < self.cfg.boot_min_samples {
            let first = &samples[0];
            self.create_cluster(&first.vector, first.duration_s, now_s);
            return;
        }

        let vectors: Vec<&[f32]> = samples.iter().map(|s| s.vector.as_slice()).collect();
        let groups = agglomerate(&vectors, self.cfg.k_max, self.cfg.min_separation);

        // Label groups in order of earliest member so replays are stable.
        let mut ordered: Vec<Vec<usize>> = groups;
        ordered.sort_by(|a, b| {
            let ta = a.iter().map(|&i| samples[i].start_s).fold(f64::MAX, f64::min);
            let tb = b.iter().map(|&i| samples[i].start_s).fold(f64::MAX, f64::min);
            ta.total_cmp(&tb)
        });

        for members in &ordered {
            let dim = samples[members[0]].vector.len();
            let mut centroid = vec![0.0f32; dim];
            let mut duration = 0.0f64;
            for &i in members {
                for (c, &x) in centroid.iter_mut().zip(samples[i].vector.iter()) {
                    *c += x;
                }
                duration += samples[i].duration_s;
            }
            l2_normalize(&mut centroid);
            let label = format!("S{}", self.next_label_idx);
            self.next_label_idx += 1;
            self.clusters.push(SpeakerCluster {
                label,
                centroid,
                duration_s: duration,
            });
        }
        tracing::info!(
            samples = samples.len(),
            clusters = self.clusters.len(),
            "bootstrap clustering complete"
        );

        // The most recent sample decides the active label going forward.
        let last_idx = samples.len() - 1;
        let owner = ordered
            .iter()
            .position(|g| g.contains(&last_idx))
            .unwrap_or(0);
        let label = self.clusters[owner].label.clone();
        self.note_active(&label, now_s);
    }

    /// Merge clusters that never accumulated real speaking time into their
    /// nearest survivor. Never drops below one cluster.
    fn maybe_prune(&mut self, now_s: f64) {
        if now_s - self.last_prune_s < self.cfg.prune_interval_s {
            return;
        }
        self.last_prune_s = now_s;

        while self.clusters.len() > 1 {
            let victim = match self
                .clusters
                .iter()
                .position(|c| c.duration_s < self.cfg.prune_min_duration_s)
            {
                Some(i) => i,
                None => break,
            };
            let removed = self.clusters.remove(victim);
            let survivor = {
                let sims: Vec<f32> = self
                    .clusters
                    .iter()
                    .map(|c| cosine_similarity(&c.centroid, &removed.centroid))
                    .collect();
                argmax(&sims)
            };
            let target = &mut self.clusters[survivor];
            for (c, &x) in target.centroid.iter_mut().zip(removed.centroid.iter()) {
                *c += x;
            }
            l2_normalize(&mut target.centroid);
            tracing::debug!(
                pruned = %removed.label,
                into = %target.label,
                "pruned low-duration cluster"
            );
            if self.active_label.as_deref() == Some(removed.label.as_str()) {
                self.active_label = Some(target.label.clone());
            }
        }
    }
}

fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if v > values[best] {
            best = i;
        }
    }
    best
}

/// Average-linkage agglomerative clustering over `1 - cosine` distances.
///
/// Merges from singletons upward, scoring every level with K in
/// `[2, k_max]` by a silhouette-like criterion; returns the best-scoring
/// grouping, or a single group when no level separates well enough.
fn agglomerate(vectors: &[&[f32]], k_max: usize, min_separation: f32) -> Vec<Vec<usize>> {
    let n = vectors.len();
    let mut dist = vec![vec![0.0f32; n]; n];
    for i in 0..n {
        for j in (i + 1)..n {
            let d = 1.0 - cosine_similarity(vectors[i], vectors[j]);
            dist[i][j] = d;
            dist[j][i] = d;
        }
    }

    let mut groups: Vec<Vec<usize>> = (0..n).map(|i| vec![i]).collect();
    let mut best: Option<(f32, Vec<Vec<usize>>)> = None;

    while groups.len() > 1 {
        // Merge the closest pair under average linkage.
        let (mut mi, mut mj, mut md) = (0, 1, f32::MAX);
        for i in 0..groups.len() {
            for j in (i + 1)..groups.len() {
                let d = group_distance(&groups[i], &groups[j], &dist);
                if d < md {
                    (mi, mj, md) = (i, j, d);
                }
            }
        }
        let merged = groups.remove(mj);
        groups[mi].extend(merged);

        if groups.len() >= 2 && groups.len() <= k_max {
            let score = separation_score(&groups, &dist);
            if best.as_ref().map(|(s, _)| score > *s).unwrap_or(true) {
                best = Some((score, groups.clone()));
            }
        }
    }

    match best {
        Some((score, grouping)) if score >= min_separation => grouping,
        _ => vec![(0..n).collect()],
    }
}

/// Mean nearest-other-group distance minus mean intra-group distance,
/// in cosine-distance units (higher is better). Kept unnormalized so
/// that near-identical samples with microscopic gaps cannot score as
/// well separated.
fn separation_score(groups: &[Vec<usize>], dist: &[Vec<f32>]) -> f32 {
    let mut total = 0.0f32;
    let mut count = 0usize;
    for (gi, group) in groups.iter().enumerate() {
        for &i in group {
            let a = if group.len() > 1 {
                group
                    .iter()
                    .filter(|&&j| j != i)
                    .map(|&j| dist[i][j])
                    .sum::<f32>()
                    / (group.len() - 1) as f32
            } else {
                0.0
            };
            let b = groups
                .iter()
                .enumerate()
                .filter(|(gj, _)| *gj != gi)
                .map(|(_, other)| {
                    other.iter().map(|&j| dist[i][j]).sum::<f32>() / other.len() as f32
                })
                .fold(f32::MAX, f32::min);
            total += b - a;
            count += 1;
        }
    }
    if count == 0 {
        0.0
    } else {
        total / count as f32
    }
}

fn group_distance(a: &[usize], b: &[usize], dist: &[Vec<f32>]) -> f32 {
    let mut sum = 0.0f32;
    for &i in a {
        for &j in b {
            sum += dist[i][j];
        }
    }
    sum / (a.len() * b.len()) as f32
}
