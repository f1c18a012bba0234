//! Sprite definitions: named sub-regions of an asset's timeline.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Name of the sprite synthesized for the whole asset when no sprite map is
/// supplied.
pub const DEFAULT_SPRITE: &str = "__default";

/// A named `[offset, duration, loop?]` sub-region of an asset's timeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sprite {
    /// Offset from the start of the asset, in milliseconds.
    pub offset_ms: u64,
    /// Length of the region, in milliseconds.
    pub duration_ms: u64,
    /// Whether playback of this sprite loops by default.
    #[serde(default)]
    pub looped: bool,
}

impl Sprite {
    pub const fn new(offset_ms: u64, duration_ms: u64) -> Self {
        Self {
            offset_ms,
            duration_ms,
            looped: false,
        }
    }

    pub const fn looping(offset_ms: u64, duration_ms: u64) -> Self {
        Self {
            offset_ms,
            duration_ms,
            looped: true,
        }
    }

    /// Region start in seconds.
    pub fn start_secs(&self) -> f64 {
        self.offset_ms as f64 / 1000.0
    }

    /// Region end in seconds.
    pub fn end_secs(&self) -> f64 {
        (self.offset_ms as f64 + self.duration_ms as f64) / 1000.0
    }
}

/// Mapping of sprite name to timeline region.
pub type SpriteMap = HashMap<String, Sprite>;
