//! Notification events produced by a group.

use serde::{Deserialize, Serialize};

use super::common::VoiceId;

/// Every notification kind a group can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Load,
    LoadError,
    Play,
    PlayError,
    Pause,
    Stop,
    End,
    Mute,
    Volume,
    Rate,
    Seek,
    Fade,
    Stereo,
    Position,
    Orientation,
    Unlock,
}

/// A single notification, delivered to listeners on the scheduling turn
/// after it was emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: EventKind,
    /// The voice the notification concerns, when it concerns one.
    pub voice: Option<VoiceId>,
    /// Human-readable detail, set for error notifications.
    pub message: Option<String>,
}

impl Notification {
    pub const fn new(kind: EventKind, voice: Option<VoiceId>) -> Self {
        Self {
            kind,
            voice,
            message: None,
        }
    }

    pub fn with_message(kind: EventKind, voice: Option<VoiceId>, message: impl Into<String>) -> Self {
        Self {
            kind,
            voice,
            message: Some(message.into()),
        }
    }
}
