//! Decode and codec-probe contracts.
//!
//! Decoding codecs is out of scope for the engine itself; a decode service
//! is supplied by the embedder. These traits are the seam, together with two
//! small built-in implementations used for headless operation and tests.

use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::types::DecodedBuffer;

/// Asynchronous decode service contract. Called once per buffer-cache miss.
pub trait Decoder: Send + Sync {
    fn decode(&self, data: &Bytes) -> Result<DecodedBuffer>;
}

/// Codec support probe, consulted once per source candidate during load.
pub trait CodecProbe: Send + Sync {
    fn supports(&self, extension: &str) -> bool;
}

/// Probe backed by an explicit extension allow-list.
#[derive(Debug, Clone)]
pub struct TableProbe {
    extensions: Vec<String>,
}

impl TableProbe {
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            extensions: extensions
                .into_iter()
                .map(|e| e.into().to_ascii_lowercase())
                .collect(),
        }
    }
}

impl Default for TableProbe {
    /// The common container set most platforms can play.
    fn default() -> Self {
        Self::new(["mp3", "wav", "ogg", "flac", "m4a", "aac", "webm", "opus"])
    }
}

impl CodecProbe for TableProbe {
    fn supports(&self, extension: &str) -> bool {
        let ext = extension.to_ascii_lowercase();
        self.extensions.iter().any(|e| *e == ext)
    }
}

/// Decoder that synthesizes a sine tone of a fixed duration instead of
/// decoding the payload. Deterministic, so the whole engine can run
/// headless.
#[derive(Debug, Clone)]
pub struct ToneDecoder {
    duration: f64,
    sample_rate: u32,
}

impl ToneDecoder {
    pub const fn new(duration: f64) -> Self {
        Self {
            duration,
            sample_rate: 44_100,
        }
    }

    /// A decoder that always fails, for exercising decode-error paths.
    pub const fn broken() -> Self {
        Self {
            duration: -1.0,
            sample_rate: 44_100,
        }
    }
}

impl Decoder for ToneDecoder {
    fn decode(&self, _data: &Bytes) -> Result<DecodedBuffer> {
        if self.duration < 0.0 {
            return Err(Error::Decode("synthetic decode failure".into()));
        }
        let frames = (self.duration * f64::from(self.sample_rate)) as usize;
        let mut samples = Vec::with_capacity(frames);
        for i in 0..frames {
            let t = i as f64 / f64::from(self.sample_rate);
            samples.push((t * 440.0 * std::f64::consts::TAU).sin() as f32);
        }
        Ok(DecodedBuffer {
            duration: self.duration,
            samples: Arc::new(samples),
            sample_rate: self.sample_rate,
            channels: 1,
        })
    }
}
