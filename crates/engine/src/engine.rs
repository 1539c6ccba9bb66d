//! Streaming orchestrator: gate, accumulator, diarization, decode.

use serde::Serialize;
use uuid::Uuid;

use parley_diarization::{
    IntraSegmentDiarizer, LiveDiarizationTimeline, OnlineSpeakerClusterer, FALLBACK_SPEAKER,
};
use parley_embedding::EmbeddingProvider;
use parley_stt::SttEngine;
use parley_vad::{GateEvent, SpeechGate};

use crate::accumulator::{ClosedSegment, SegmentAccumulator};
use crate::worker::{DecodeOutcome, DecodeRequest, DecodeWorker};
use crate::{f32_to_pcm16, pcm16_to_f32, EngineConfig};

/// One transcribed, attributed utterance. Emitted in non-decreasing
/// start order, exactly once per closed segment with non-empty text.
#[derive(Debug, Clone, Serialize)]
pub struct FinalizedSegment {
    pub id: Uuid,
    pub start_s: f64,
    pub end_s: f64,
    pub text: String,
    pub speaker: String,
    /// Raw PCM16LE mono audio of the segment.
    pub audio: Vec<u8>,
}

/// Owns every stage of the pipeline and drives them synchronously per
/// frame; only ASR decoding leaves this thread. All timing is derived
/// from processed sample counts, so replaying a stream through a fresh
/// engine reproduces identical boundaries and labels.
pub struct StreamingEngine {
    cfg: EngineConfig,
    gate: SpeechGate,
    acc: SegmentAccumulator,
    clusterer: OnlineSpeakerClusterer,
    intraseg: IntraSegmentDiarizer,
    timeline: LiveDiarizationTimeline,
    embedder: Box<dyn EmbeddingProvider>,
    worker: Option<DecodeWorker>,
    asr_disabled: bool,
    byte_residual: Vec<u8>,
    sample_residual: Vec<f32>,
    processed_samples: u64,
    next_seq: u64,
    in_flight: usize,
    /// Provisional label of the open segment.
    current_label: Option<String>,
    /// Whether the open segment's own audio has corroborated
    /// `current_label`. Until then the label is just whoever spoke last.
    label_confirmed: bool,
    /// Open-segment length at the last intra-segment probe.
    last_probe_len: usize,
}

impl StreamingEngine {
    pub fn new(
        cfg: EngineConfig,
        stt: Option<Box<dyn SttEngine>>,
        embedder: Box<dyn EmbeddingProvider>,
    ) -> Self {
        let worker =
            stt.map(|engine| DecodeWorker::spawn(engine, cfg.sample_rate, cfg.min_decode_s));
        if worker.is_none() {
            tracing::warn!("no ASR engine configured; capture and diarization only");
        }
        Self {
            gate: SpeechGate::new(cfg.vad),
            acc: SegmentAccumulator::new(cfg.segment, cfg.sample_rate, cfg.vad.frame_samples),
            clusterer: OnlineSpeakerClusterer::new(cfg.clusterer),
            intraseg: IntraSegmentDiarizer::new(cfg.intraseg),
            timeline: LiveDiarizationTimeline::new(cfg.timeline),
            embedder,
            worker,
            asr_disabled: false,
            byte_residual: Vec::new(),
            sample_residual: Vec::new(),
            processed_samples: 0,
            next_seq: 0,
            in_flight: 0,
            current_label: None,
            label_confirmed: false,
            last_probe_len: 0,
            cfg,
        }
    }

    /// Seconds of audio processed so far. The engine's only clock.
    pub fn stream_time_s(&self) -> f64 {
        self.processed_samples as f64 / self.cfg.sample_rate as f64
    }

    pub fn speaker_count(&self) -> usize {
        self.clusterer.speaker_count()
    }

    pub fn asr_disabled(&self) -> bool {
        self.asr_disabled
    }

    /// Sole ingestion entry point: PCM16LE mono at the configured sample
    /// rate, arbitrary chunk lengths. Unaligned remainders are buffered.
    pub fn accept_chunk(&mut self, pcm16: &[u8]) {
        self.byte_residual.extend_from_slice(pcm16);
        let usable = self.byte_residual.len() & !1;
        self.sample_residual
            .extend(pcm16_to_f32(&self.byte_residual[..usable]));
        self.byte_residual.drain(..usable);

        let frame_len = self.cfg.vad.frame_samples;
        while self.sample_residual.len() >= frame_len {
            let frame: Vec<f32> = self.sample_residual.drain(..frame_len).collect();
            self.process_frame(&frame);
        }
    }

    /// Drain one pending finalized result, FIFO. Poll after each chunk.
    pub fn try_finalize(&mut self) -> Option<FinalizedSegment> {
        let outcome = self.worker.as_ref()?.try_recv()?;
        self.in_flight = self.in_flight.saturating_sub(1);
        self.finish(outcome)
    }

    /// Stream teardown: close any open segment and wait (bounded) for
    /// in-flight decodes. Results that miss the timeout are discarded by
    /// the worker's drop.
    pub fn flush(&mut self) -> Vec<FinalizedSegment> {
        if self.acc.is_open() {
            self.close_and_dispatch(0.0);
            self.gate.force_idle();
        }
        let mut out = Vec::new();
        while self.in_flight > 0 {
            let Some(worker) = self.worker.as_ref() else {
                break;
            };
            match worker.recv_timeout(self.cfg.flush_timeout) {
                Some(outcome) => {
                    self.in_flight -= 1;
                    if let Some(seg) = self.finish(outcome) {
                        out.push(seg);
                    }
                }
                None => {
                    tracing::warn!(
                        in_flight = self.in_flight,
                        "flush timed out waiting for decodes"
                    );
                    break;
                }
            }
        }
        out
    }

    fn process_frame(&mut self, frame: &[f32]) {
        if self.cfg.timeline_enabled {
            self.timeline
                .push_audio(frame, &mut self.clusterer, self.embedder.as_ref());
        }

        if self.cfg.vad_enabled {
            let event = self.gate.push_frame(frame);
            if self.acc.is_open() {
                self.acc.push_frame(frame);
            } else {
                self.acc.push_idle_frame(frame);
            }
            self.processed_samples += frame.len() as u64;
            match event {
                Some(GateEvent::SpeechStart) => self.open_segment(),
                Some(GateEvent::SpeechEnd) => self.close_and_dispatch(0.0),
                None => {}
            }
        } else {
            // One rolling segment bounded only by the max-turn ceiling.
            if !self.acc.is_open() {
                self.open_segment();
            }
            self.acc.push_frame(frame);
            self.processed_samples += frame.len() as u64;
        }

        if self.acc.is_open() && self.acc.at_max_turn() {
            tracing::debug!(t = self.stream_time_s(), "max-turn forced close");
            self.close_and_dispatch(0.0);
            if !self.cfg.vad_enabled || self.gate.in_speech() {
                self.open_segment();
            }
        } else if self.cfg.intraseg_enabled && self.acc.is_open() {
            self.probe_open_segment();
        }
    }

    fn open_segment(&mut self) {
        self.acc.open(self.processed_samples);
        self.current_label = self.clusterer.active_label().map(str::to_string);
        self.label_confirmed = false;
        self.intraseg.sync_labels(self.clusterer.centroid_snapshot());
        self.last_probe_len = 0;
    }

    /// Hop-gated mid-segment speaker check; cuts the segment early when
    /// the tracker is confident another speaker took over.
    fn probe_open_segment(&mut self) {
        let rate = self.cfg.sample_rate;
        let win = (self.cfg.intraseg.emb_win_s * rate as f64) as usize;
        let hop = ((self.cfg.intraseg.emb_hop_s * rate as f64) as usize).max(1);
        let len = self.acc.len_samples();
        if len < win || len < self.last_probe_len + hop {
            return;
        }
        self.last_probe_len = len;

        let window = self.acc.recent(win);
        let Some(embedding) = self.embedder.embed(window, rate) else {
            return;
        };
        let mut current = self
            .current_label
            .clone()
            .or_else(|| self.clusterer.active_label().map(str::to_string))
            .unwrap_or_else(|| FALLBACK_SPEAKER.to_string());
        // The seed label is whoever spoke last, which is wrong whenever a
        // new speaker opens the turn. The first probe is the segment's own
        // evidence: resolve the provisional label from it before any
        // opposition is counted.
        if !self.label_confirmed {
            if let Some(best) = self.intraseg.best_match(&embedding) {
                if best != current {
                    tracing::debug!(
                        seeded = %current,
                        adopted = %best,
                        "first probe revised the provisional label"
                    );
                    current = best;
                }
                self.current_label = Some(current.clone());
                self.label_confirmed = true;
            }
        }
        let decision = self.intraseg.step(
            &embedding,
            &current,
            self.acc.duration_s(),
            self.cfg.intraseg.emb_hop_s,
            self.stream_time_s(),
        );
        if decision.cut {
            tracing::info!(
                from = %current,
                to = %decision.label,
                reason = decision.reason,
                "mid-segment speaker cut"
            );
            self.close_and_dispatch(decision.backtrace_s);
            // The new voice is already talking; reopen immediately and
            // seed the provisional label from the cut verdict.
            self.open_segment();
            self.current_label = Some(decision.label);
            self.label_confirmed = true;
        }
    }

    fn close_and_dispatch(&mut self, backtrace_s: f64) {
        self.intraseg.notify_segment_end();
        self.last_probe_len = 0;
        if let Some(seg) = self.acc.close(backtrace_s) {
            self.dispatch(seg);
        }
        self.current_label = None;
    }

    fn dispatch(&mut self, seg: ClosedSegment) {
        let rate = self.cfg.sample_rate;
        let start_s = seg.start_s(rate);
        let end_s = seg.end_s(rate);
        let now_s = self.stream_time_s();

        // Run the whole segment through the clusterer so labels stay
        // fresh even when ASR is gone.
        let assigned = self
            .embedder
            .embed(&seg.samples, rate)
            .map(|emb| self.clusterer.assign(&emb, start_s, end_s, now_s));
        let hint = assigned.or_else(|| self.current_label.clone());

        let spans = if self.cfg.timeline_enabled {
            self.timeline.speaker_spans(start_s, end_s)
        } else {
            None
        };

        match spans {
            Some(spans) => {
                tracing::info!(parts = spans.len(), start_s, end_s, "splitting segment");
                for span in spans {
                    let s0 = ((span.start_s - start_s) * rate as f64) as usize;
                    let s1 =
                        ((span.end_s - start_s) * rate as f64).round() as usize;
                    let s1 = s1.min(seg.samples.len());
                    if s1 <= s0 {
                        continue;
                    }
                    let piece = ClosedSegment {
                        start_sample: seg.start_sample + s0 as u64,
                        samples: seg.samples[s0..s1].to_vec(),
                    };
                    self.submit(piece, Some(span.label));
                }
            }
            None => self.submit(seg, hint),
        }
    }

    fn submit(&mut self, seg: ClosedSegment, label_hint: Option<String>) {
        if self.asr_disabled {
            return;
        }
        let Some(worker) = self.worker.as_ref() else {
            return;
        };
        let rate = self.cfg.sample_rate;
        let request = DecodeRequest::Segment {
            seq: self.next_seq,
            start_s: seg.start_s(rate),
            end_s: seg.end_s(rate),
            samples: seg.samples,
            label_hint,
        };
        self.next_seq += 1;
        if worker.submit(request) {
            self.in_flight += 1;
        } else {
            tracing::warn!("decode worker gone; ASR disabled for this session");
            self.asr_disabled = true;
        }
    }

    fn finish(&mut self, outcome: DecodeOutcome) -> Option<FinalizedSegment> {
        let text = match outcome.text {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("ASR disabled for the rest of the session: {e}");
                self.asr_disabled = true;
                return None;
            }
        };
        let text = text.trim().to_string();
        if text.is_empty() {
            return None;
        }

        let speaker = outcome
            .label_hint
            .clone()
            .or_else(|| {
                self.cfg
                    .timeline_enabled
                    .then(|| self.timeline.majority_speaker(outcome.start_s, outcome.end_s))
            })
            .unwrap_or_else(|| FALLBACK_SPEAKER.to_string());
        if self.cfg.timeline_enabled {
            self.timeline
                .note_segment(outcome.start_s, outcome.end_s, &speaker);
        }

        Some(FinalizedSegment {
            id: Uuid::new_v4(),
            start_s: outcome.start_s,
            end_s: outcome.end_s,
            text,
            speaker,
            audio: f32_to_pcm16(&outcome.samples),
        })
    }
}
