//! A single playback instance inside a group's pool.

use polyvox_backend::{MediaStream, NodeId};
use polyvox_core::{PannerAttrs, VoiceId, DEFAULT_SPRITE};

use crate::fade::FadeState;

/// Which pan primitive a voice currently owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PannerKind {
    Stereo,
    Spatial,
}

/// Per-voice settings inherited from the group when a voice is created or
/// recycled.
#[derive(Debug, Clone)]
pub(crate) struct VoiceDefaults {
    pub volume: f64,
    pub rate: f64,
    pub looped: bool,
    pub muted: bool,
    pub stereo: Option<f64>,
    pub position: Option<[f64; 3]>,
    pub orientation: Option<[f64; 3]>,
    pub panner_attrs: PannerAttrs,
}

/// One voice. Created paused and ended so the pool can hand it out; `play`
/// brings it to life.
pub struct Voice {
    pub(crate) id: VoiceId,
    pub(crate) sprite: String,
    /// Last stored playhead, in seconds from the start of the buffer.
    pub(crate) seek: f64,
    /// Playhead captured at the most recent rate change; anchors seek reads
    /// across rate changes.
    pub(crate) rate_seek: f64,
    /// Clock value when playback last (re)started.
    pub(crate) play_start: f64,
    /// Sprite window, absolute seconds into the buffer.
    pub(crate) start: f64,
    pub(crate) stop: f64,
    pub(crate) paused: bool,
    pub(crate) ended: bool,
    pub(crate) volume: f64,
    pub(crate) rate: f64,
    pub(crate) looped: bool,
    pub(crate) muted: bool,
    pub(crate) stereo: Option<f64>,
    pub(crate) position: Option<[f64; 3]>,
    pub(crate) orientation: Option<[f64; 3]>,
    pub(crate) panner_attrs: PannerAttrs,
    pub(crate) gain: Option<NodeId>,
    pub(crate) panner: Option<(PannerKind, NodeId)>,
    pub(crate) source: Option<NodeId>,
    pub(crate) stream: Option<Box<dyn MediaStream>>,
    pub(crate) fade: Option<FadeState>,
    /// Whether this voice currently holds an active-voice count on the
    /// engine (buffered mode only).
    pub(crate) counted_active: bool,
}

impl Voice {
    pub(crate) fn new(id: VoiceId, defaults: &VoiceDefaults) -> Self {
        Self {
            id,
            sprite: DEFAULT_SPRITE.to_string(),
            seek: 0.0,
            rate_seek: 0.0,
            play_start: 0.0,
            start: 0.0,
            stop: 0.0,
            paused: true,
            ended: true,
            volume: defaults.volume,
            rate: defaults.rate,
            looped: defaults.looped,
            muted: defaults.muted,
            stereo: defaults.stereo,
            position: defaults.position,
            orientation: defaults.orientation,
            panner_attrs: defaults.panner_attrs,
            gain: None,
            panner: None,
            source: None,
            stream: None,
            fade: None,
            counted_active: false,
        }
    }

    /// Recycle an ended voice under a fresh id, re-inheriting the group's
    /// current settings. Graph nodes and any pooled media element survive.
    pub(crate) fn reset(&mut self, id: VoiceId, defaults: &VoiceDefaults) {
        self.id = id;
        self.sprite = DEFAULT_SPRITE.to_string();
        self.seek = 0.0;
        self.rate_seek = 0.0;
        self.play_start = 0.0;
        self.start = 0.0;
        self.stop = 0.0;
        self.paused = true;
        self.ended = true;
        self.volume = defaults.volume;
        self.rate = defaults.rate;
        self.looped = defaults.looped;
        self.muted = defaults.muted;
        self.stereo = defaults.stereo;
        self.position = defaults.position;
        self.orientation = defaults.orientation;
        self.panner_attrs = defaults.panner_attrs;
        self.source = None;
        self.fade = None;
        self.counted_active = false;
    }

    pub fn id(&self) -> VoiceId {
        self.id
    }

    pub fn sprite(&self) -> &str {
        &self.sprite
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn volume(&self) -> f64 {
        self.volume
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn is_looped(&self) -> bool {
        self.looped
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }
}
