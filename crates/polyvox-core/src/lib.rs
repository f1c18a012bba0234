//! # polyvox-core
//!
//! Core types, traits, and error handling for the Polyvox voice-group
//! playback engine.

pub mod decode;
pub mod error;
pub mod types;

pub use decode::{CodecProbe, Decoder, TableProbe, ToneDecoder};
pub use error::{Error, Result};
pub use types::*;
