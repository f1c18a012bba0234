//! Shared identifier types.

use serde::{Deserialize, Serialize};

/// First voice id handed out by an engine controller. Ids below this are
/// reserved so a raw sprite-position argument can never collide with one.
pub const FIRST_VOICE_ID: u64 = 1000;

/// Identifier of a single playback voice.
///
/// Monotonically increasing and unique for the lifetime of the process; a
/// recycled voice always receives a fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VoiceId(pub u64);

impl VoiceId {
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for VoiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "voice#{}", self.0)
    }
}
