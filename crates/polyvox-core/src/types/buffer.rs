//! Decoded audio buffer payload.

use std::sync::Arc;

/// A fully decoded audio asset, shared between every voice that plays it.
///
/// The engine itself only reads `duration`; the sample payload is opaque and
/// handed to the backend when a source node is built.
#[derive(Debug, Clone)]
pub struct DecodedBuffer {
    /// Total duration in seconds.
    pub duration: f64,
    /// Interleaved samples.
    pub samples: Arc<Vec<f32>>,
    /// Samples per second per channel.
    pub sample_rate: u32,
    /// Channel count.
    pub channels: u16,
}

impl DecodedBuffer {
    /// True when the decode produced no usable audio.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty() || self.duration <= 0.0
    }
}
