//! Streaming media-element contract, the fallback playback path used when
//! no buffered backend is available (or a group opts out of buffering).

use polyvox_core::{Result, SourceSpec};

/// One native media element. Elements are pooled by the engine controller
/// and re-targeted with `load_source` when a voice acquires one.
pub trait MediaStream: Send {
    /// Point the element at a new source, resetting its position.
    fn load_source(&mut self, spec: &SourceSpec);

    /// True once enough data is buffered for playback to start.
    fn is_ready(&self) -> bool;

    /// Start or resume playback. Fails when the platform refuses, e.g.
    /// because of an autoplay policy.
    fn play(&mut self) -> Result<()>;

    fn pause(&mut self);

    fn set_position(&mut self, secs: f64);

    fn position(&self) -> f64;

    /// Total duration in seconds. `f64::INFINITY` for live sources.
    fn duration(&self) -> f64;

    fn set_volume(&mut self, volume: f64);

    fn set_muted(&mut self, muted: bool);

    fn set_rate(&mut self, rate: f64);

    /// Native end-of-playback signal.
    fn ended(&self) -> bool;

    /// Detach the element's source entirely, halting any ongoing download.
    /// Used when stopping live/effectively-infinite sources.
    fn clear_source(&mut self);
}

/// Factory producing blank media elements. Deliberately separate from the
/// graph backend: streaming playback must keep working when graph creation
/// fails and the engine falls back to streaming-only mode.
pub type StreamFactory = Box<dyn FnMut() -> Box<dyn MediaStream> + Send>;
