//! # polyvox-backend
//!
//! Abstraction over the audio graph and clock used for buffered playback,
//! plus the streaming media-element contract used by the fallback path.
//!
//! The engine never talks to a platform audio API directly; it schedules
//! node and parameter changes through [`AudioBackend`] and reads the shared
//! clock from it. [`offline::OfflineBackend`] is a fully deterministic
//! in-memory implementation used for headless operation and tests.

pub mod graph;
pub mod offline;
pub mod stream;

pub use graph::{AudioBackend, BackendFactory, LifecycleState, NodeId, Param};
pub use offline::{NodeKind, NodeRecord, OfflineBackend, OfflineStreamHandle, Scheduled, SourceStart};
pub use stream::{MediaStream, StreamFactory};
