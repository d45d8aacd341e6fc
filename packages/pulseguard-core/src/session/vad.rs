//! Voice-activity detection over 16 kHz PCM16 chunks.
//!
//! The classifier is a seam: anything implementing [`VadEngine`] can judge
//! a chunk. The default [`EnergyVad`] maps RMS energy to a probability,
//! which is enough to drive the gate's streak counters; a model-backed
//! implementation plugs in behind the same trait.

/// Consecutive speech frames before the gate opens.
pub const VAD_START_FRAMES: u32 = 3;

/// Consecutive silence frames before the gate closes.
pub const VAD_STOP_FRAMES: u32 = 8;

/// Per-chunk classification.
#[derive(Debug, Clone, Copy)]
pub struct VadDecision {
    /// Speech probability in `[0, 1]`.
    pub probability: f64,
    /// Whether the chunk counts as speech for the streak counters.
    pub is_speech: bool,
}

/// Classifies one PCM16 chunk.
pub trait VadEngine: Send + Sync {
    fn assess(&self, pcm16: &[u8]) -> VadDecision;
}

/// RMS-energy classifier.
pub struct EnergyVad {
    /// Normalized RMS above which a chunk counts as speech.
    threshold: f64,
}

impl EnergyVad {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

impl Default for EnergyVad {
    fn default() -> Self {
        // Normal speech sits well above this; room noise below it.
        Self::new(0.015)
    }
}

impl VadEngine for EnergyVad {
    fn assess(&self, pcm16: &[u8]) -> VadDecision {
        if pcm16.len() < 2 {
            return VadDecision {
                probability: 0.0,
                is_speech: false,
            };
        }

        let mut sum_squares = 0.0f64;
        let sample_count = pcm16.len() / 2;
        for chunk in pcm16.chunks_exact(2) {
            let sample = i16::from_le_bytes([chunk[0], chunk[1]]) as f64 / 32768.0;
            sum_squares += sample * sample;
        }
        let rms = (sum_squares / sample_count as f64).sqrt();

        // Squash RMS into a probability that crosses 0.5 at the threshold.
        let probability = (rms / (self.threshold * 2.0)).clamp(0.0, 1.0);
        VadDecision {
            probability,
            is_speech: rms > self.threshold,
        }
    }
}
