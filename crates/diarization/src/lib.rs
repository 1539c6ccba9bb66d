//! Online speaker diarization: variable-K clustering, mid-segment speaker
//! tracking, and a sliding-window labeling timeline.
//!
//! All components take stream time (seconds derived from processed sample
//! counts) as an explicit argument; nothing in this crate reads a clock,
//! so identical input always produces identical labels.

mod cluster;
mod intraseg;
mod timeline;

pub use cluster::{ClustererConfig, OnlineSpeakerClusterer, SpeakerCluster};
pub use intraseg::{DiarizationDecision, IntraSegmentDiarizer, IntrasegConfig};
pub use timeline::{LiveDiarizationTimeline, SpeakerSpan, TimelineConfig, TimelineWindow};

/// Fallback label used when no evidence is available at all.
pub const FALLBACK_SPEAKER: &str = "S1";
