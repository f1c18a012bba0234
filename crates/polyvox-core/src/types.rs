//! Core domain types for Polyvox.

pub mod buffer;
pub mod common;
pub mod event;
pub mod source;
pub mod spatial;
pub mod sprite;

pub use buffer::DecodedBuffer;
pub use common::{VoiceId, FIRST_VOICE_ID};
pub use event::{EventKind, Notification};
pub use source::SourceSpec;
pub use spatial::{DistanceModel, PannerAttrs, PanningModel};
pub use sprite::{Sprite, SpriteMap, DEFAULT_SPRITE};
