//! # polyvox-engine
//!
//! Group and voice playback: load sources into decoded buffers or media
//! elements, play sprites on pooled voices, and drive fades, rates, seeks
//! and spatialization through a shared [`EngineController`].
//!
//! The engine is cooperatively scheduled. Operations apply immediately when
//! possible; everything deferred (decodes, element readiness, end
//! deadlines, fades, backend resume) completes in [`Group::poll`], which
//! also delivers notifications to registered listeners.

pub mod cache;
pub mod controller;
pub mod deadline;
pub mod decode;
pub mod events;
pub mod fade;
pub mod group;
pub mod voice;

pub use cache::BufferCache;
pub use controller::{EngineController, AUTO_SUSPEND_SECS, STREAM_POOL_CAPACITY};
pub use decode::DecodeMode;
pub use events::EventCallback;
pub use group::{Group, GroupConfig, LoadState, DEFAULT_POOL_CAPACITY, LOOP_SPAN_SECS};
pub use voice::Voice;
