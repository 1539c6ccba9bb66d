//! Voice-characteristic embeddings.
//!
//! The trait deliberately has no error type: backend unavailability and
//! degenerate input are both normal outcomes expressed as `None`, and the
//! caller degrades to label-sticking instead of failing.

mod spectral;

pub use spectral::SpectralEmbedder;

/// Maps an audio window to a fixed-length voice-characteristic vector.
pub trait EmbeddingProvider: Send {
    /// Returns `None` when the backend is unavailable or the window is
    /// degenerate (empty, too short, near-silent). Must never panic.
    fn embed(&self, window: &[f32], sample_rate: u32) -> Option<Vec<f32>>;

    fn name(&self) -> &'static str;
}

/// Backend that is never available; exercises the fallback path.
pub struct UnavailableEmbedder;

impl EmbeddingProvider for UnavailableEmbedder {
    fn embed(&self, _window: &[f32], _sample_rate: u32) -> Option<Vec<f32>> {
        None
    }

    fn name(&self) -> &'static str {
        "unavailable"
    }
}

/// Cosine similarity between two vectors of equal length.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        dot += x as f64 * y as f64;
        na += x as f64 * x as f64;
        nb += y as f64 * y as f64;
    }
    (dot / (na.sqrt() * nb.sqrt() + 1e-6)) as f32
}

/// Scale a vector to unit L2 norm in place. No-op on the zero vector.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|&x| (x as f64) * (x as f64)).sum::<f64>().sqrt();
    if norm > 1e-9 {
        for x in v.iter_mut() {
            *x = (*x as f64 / norm) as f32;
        }
    }
}
