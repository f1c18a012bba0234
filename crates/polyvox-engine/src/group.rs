//! A group: one loaded audio asset and its pool of voices.
//!
//! All mutation is cooperative: callers invoke operations directly and call
//! [`Group::poll`] regularly. Deferred work (decode results, element
//! readiness, end deadlines, fades, engine resume continuations) completes
//! during poll, and queued notifications are delivered to listeners at the
//! end of each poll.

use std::collections::VecDeque;
use std::sync::Arc;

use crossbeam_channel::{Receiver, TryRecvError};
use polyvox_backend::Param;
use polyvox_core::{
    DecodedBuffer, Error, EventKind, Notification, PannerAttrs, PanningModel, Result, SourceSpec,
    Sprite, SpriteMap, VoiceId, DEFAULT_SPRITE,
};
use tracing::{debug, info, warn};

use crate::controller::EngineController;
use crate::deadline::DeadlineSet;
use crate::decode;
use crate::events::ListenerSet;
use crate::fade::FadeState;
use crate::voice::{PannerKind, Voice, VoiceDefaults};

/// Default number of voices a group keeps pooled.
pub const DEFAULT_POOL_CAPACITY: usize = 5;

/// Span handed to a looping buffered source so it keeps playing across loop
/// boundaries without a restart: 24 hours.
pub const LOOP_SPAN_SECS: f64 = 86_400.0;

/// Load lifecycle of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadState {
    #[default]
    Unloaded,
    Loading,
    Loaded,
}

/// Construction settings for a [`Group`].
pub struct GroupConfig {
    /// Candidate sources, tried in order against the codec probe.
    pub sources: Vec<SourceSpec>,
    /// Named playback windows. A `__default` sprite spanning the whole
    /// asset is synthesized at load time if absent.
    pub sprites: SpriteMap,
    pub volume: f64,
    pub rate: f64,
    pub looped: bool,
    pub muted: bool,
    /// Pool size the group prunes down to.
    pub pool: usize,
    /// Decode into memory and play through the graph backend. When false
    /// (or when no backend exists) the group streams through media
    /// elements instead.
    pub buffered: bool,
    pub autoplay: bool,
    /// Start loading immediately on construction.
    pub preload: bool,
    pub stereo: Option<f64>,
    pub position: Option<[f64; 3]>,
    pub orientation: Option<[f64; 3]>,
    pub panner_attrs: PannerAttrs,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            sprites: SpriteMap::new(),
            volume: 1.0,
            rate: 1.0,
            looped: false,
            muted: false,
            pool: DEFAULT_POOL_CAPACITY,
            buffered: true,
            autoplay: false,
            preload: true,
            stereo: None,
            position: None,
            orientation: None,
            panner_attrs: PannerAttrs::default(),
        }
    }
}

/// How a play request names its target.
#[derive(Debug, Clone)]
enum PlayTarget {
    /// Default sprite, or the single paused voice if exactly one exists.
    Default,
    Sprite(String),
    Voice(VoiceId),
}

/// An operation captured for replay once the group is ready.
#[derive(Debug, Clone)]
enum GroupCommand {
    Play { target: PlayTarget },
    Pause { id: Option<VoiceId> },
    Stop { id: Option<VoiceId> },
    Mute { muted: bool, id: Option<VoiceId> },
    Volume { volume: f64, id: Option<VoiceId> },
    Fade { from: f64, to: f64, millis: u64, id: Option<VoiceId> },
    Rate { rate: f64, id: Option<VoiceId> },
    Seek { position: f64, id: Option<VoiceId> },
    Stereo { pan: f64, id: Option<VoiceId> },
    Position { position: [f64; 3], id: Option<VoiceId> },
    Orientation { orientation: [f64; 3], id: Option<VoiceId> },
}

#[derive(Debug)]
struct QueuedAction {
    /// Event that marks this action finished and pops it from the queue.
    tag: EventKind,
    command: GroupCommand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingWait {
    EngineResume,
    StreamReady,
}

/// A play that resolved its parameters but must wait for the backend or a
/// media element before starting.
#[derive(Debug)]
struct PendingPlay {
    voice: VoiceId,
    seek: f64,
    duration: f64,
    internal: bool,
    wait: PendingWait,
}

/// One loaded (or loading) audio asset plus the voices playing it.
pub struct Group {
    engine: Arc<EngineController>,
    state: LoadState,
    sources: Vec<SourceSpec>,
    chosen: Option<usize>,
    sprites: SpriteMap,
    volume: f64,
    rate: f64,
    looped: bool,
    muted: bool,
    pool_capacity: usize,
    buffered: bool,
    duration: Option<f64>,
    stereo: Option<f64>,
    position: Option<[f64; 3]>,
    orientation: Option<[f64; 3]>,
    panner_attrs: PannerAttrs,
    voices: Vec<Voice>,
    queue: VecDeque<QueuedAction>,
    play_lock: bool,
    pending_plays: Vec<PendingPlay>,
    deadlines: DeadlineSet,
    listeners: ListenerSet,
    pending_events: VecDeque<Notification>,
    decode_rx: Option<Receiver<Result<DecodedBuffer>>>,
    cache_retained: bool,
    seen_unlock_epoch: u64,
    seen_volume_epoch: u64,
}

impl Group {
    pub fn new(engine: Arc<EngineController>, config: GroupConfig) -> Result<Self> {
        if config.sources.is_empty() {
            return Err(Error::Config("a group needs at least one source".into()));
        }
        let buffered = config.buffered && engine.backend_available();
        let seen_unlock_epoch = engine.unlock_epoch();
        let seen_volume_epoch = engine.volume_epoch();
        let mut group = Self {
            engine,
            state: LoadState::Unloaded,
            sources: config.sources,
            chosen: None,
            sprites: config.sprites,
            volume: config.volume.clamp(0.0, 1.0),
            rate: if config.rate.is_finite() && config.rate > 0.0 {
                config.rate
            } else {
                1.0
            },
            looped: config.looped,
            muted: config.muted,
            pool_capacity: config.pool.max(1),
            buffered,
            duration: None,
            stereo: config.stereo,
            position: config.position,
            orientation: config.orientation,
            panner_attrs: config.panner_attrs,
            voices: Vec::new(),
            queue: VecDeque::new(),
            play_lock: false,
            pending_plays: Vec::new(),
            deadlines: DeadlineSet::new(),
            listeners: ListenerSet::new(),
            pending_events: VecDeque::new(),
            decode_rx: None,
            cache_retained: false,
            seen_unlock_epoch,
            seen_volume_epoch,
        };
        if config.autoplay {
            group.queue.push_back(QueuedAction {
                tag: EventKind::Play,
                command: GroupCommand::Play {
                    target: PlayTarget::Default,
                },
            });
        }
        if config.preload {
            if let Err(err) = group.load() {
                warn!(%err, "preload failed");
            }
        }
        Ok(group)
    }

    pub fn load_state(&self) -> LoadState {
        self.state
    }

    pub fn is_buffered(&self) -> bool {
        self.buffered
    }

    /// Asset duration in seconds; zero until known.
    pub fn duration(&self) -> f64 {
        self.duration.unwrap_or(0.0)
    }

    pub fn sprites(&self) -> &SpriteMap {
        &self.sprites
    }

    pub fn voice_count(&self) -> usize {
        self.voices.len()
    }

    pub fn voice_ids(&self) -> Vec<VoiceId> {
        self.voices.iter().map(|v| v.id).collect()
    }

    pub fn engine(&self) -> &Arc<EngineController> {
        &self.engine
    }

    /// Begin loading: pick a playable source, then decode (buffered) or
    /// wait for element readiness (streaming). Completion is observed on a
    /// later poll, except for a cache hit which completes immediately.
    pub fn load(&mut self) -> Result<()> {
        if self.state == LoadState::Loaded {
            return Ok(());
        }
        if self.chosen.is_none() {
            let probe = self.engine.probe();
            let chosen = self
                .sources
                .iter()
                .position(|src| src.extension().is_some_and(|ext| probe.supports(&ext)));
            let Some(index) = chosen else {
                let err = Error::NoCodec("no source with a supported codec".into());
                self.emit_with_message(EventKind::LoadError, None, &err.to_string());
                return Err(err);
            };
            self.chosen = Some(index);
        }
        self.state = LoadState::Loading;
        debug!(key = %self.sources[self.chosen.unwrap_or(0)].key, "loading group");
        if self.voices.is_empty() {
            self.spawn_voice();
        }
        if self.buffered {
            let key = self.chosen_key().unwrap_or_default();
            if let Some(buffer) = self.engine.cache().get(&key) {
                self.finish_load(buffer);
            } else if self.decode_rx.is_none() {
                let index = self.chosen.unwrap_or(0);
                let data = self.sources[index].data.clone();
                self.decode_rx = Some(decode::dispatch(
                    self.engine.decode_mode(),
                    self.engine.decoder(),
                    data,
                ));
            }
        }
        Ok(())
    }

    /// Stop everything, drop graph nodes, return media elements to the
    /// engine pool and release the cached buffer.
    pub fn unload(&mut self) {
        self.stop_impl(None, true);
        for idx in 0..self.voices.len() {
            self.dispose_voice_nodes(idx);
        }
        self.voices.clear();
        self.deadlines.clear();
        self.queue.clear();
        self.pending_plays.clear();
        self.pending_events.clear();
        self.play_lock = false;
        self.decode_rx = None;
        if self.cache_retained {
            if let Some(key) = self.chosen_key() {
                self.engine.cache().release(&key);
            }
            self.cache_retained = false;
        }
        self.state = LoadState::Unloaded;
        debug!("group unloaded");
    }

    // ---- playback -------------------------------------------------------

    /// Play the default sprite. If exactly one paused voice exists it is
    /// resumed instead of allocating a new one.
    pub fn play(&mut self) -> Option<VoiceId> {
        self.play_target(PlayTarget::Default, false)
    }

    /// Play a named sprite on a fresh (or recycled) voice.
    pub fn play_sprite(&mut self, name: &str) -> Option<VoiceId> {
        self.play_target(PlayTarget::Sprite(name.to_string()), false)
    }

    /// Resume or restart a specific voice.
    pub fn play_voice(&mut self, id: VoiceId) -> Option<VoiceId> {
        self.play_target(PlayTarget::Voice(id), false)
    }

    fn play_target(&mut self, target: PlayTarget, internal: bool) -> Option<VoiceId> {
        let mut id: Option<VoiceId> = None;
        let mut sprite: Option<String> = None;
        match target {
            PlayTarget::Voice(v) => id = Some(v),
            PlayTarget::Sprite(name) => {
                if self.state == LoadState::Loaded && !self.sprites.contains_key(&name) {
                    return None;
                }
                sprite = Some(name);
            }
            PlayTarget::Default => {
                sprite = Some(DEFAULT_SPRITE.to_string());
                if !self.play_lock {
                    let mut paused = self.voices.iter().filter(|v| v.paused && !v.ended);
                    if let (Some(only), None) = (paused.next(), paused.next()) {
                        id = Some(only.id);
                        sprite = None;
                    }
                }
            }
        }

        let idx = match id {
            Some(v) => self.voice_index(v)?,
            None => self.acquire_voice_index(),
        };
        let voice_id = self.voices[idx].id;
        let sprite = match sprite {
            Some(name) => name,
            None => self.voices[idx].sprite.clone(),
        };

        if self.state != LoadState::Loaded || self.play_lock {
            // Mark the voice claimed so the pool will not recycle it, and
            // replay once ready.
            self.voices[idx].sprite = sprite;
            self.voices[idx].ended = false;
            debug!(voice = %voice_id, "play deferred until the group is ready");
            self.queue.push_back(QueuedAction {
                tag: EventKind::Play,
                command: GroupCommand::Play {
                    target: PlayTarget::Voice(voice_id),
                },
            });
            return Some(voice_id);
        }

        // Playing already: nothing to do, but a queued play may be waiting
        // on this turn.
        if id.is_some() && !self.voices[idx].paused {
            if !internal {
                self.drain_queue(Some(EventKind::Play));
            }
            return Some(voice_id);
        }

        if self.buffered {
            self.engine.auto_resume();
        }

        let spr = self.sprites.get(&sprite).copied()?;
        {
            let voice = &mut self.voices[idx];
            voice.sprite = sprite;
            voice.ended = false;
        }
        let stop = spr.end_secs();
        let prior = self.voices[idx].seek;
        let seek = if prior > 0.0 { prior } else { spr.start_secs() }.max(0.0);
        let duration = (stop - seek).max(0.0);

        if seek >= stop {
            self.end_voice(idx);
            return Some(voice_id);
        }

        if self.buffered {
            if self.engine.is_running() {
                self.start_buffered(idx, seek, duration, internal);
            } else {
                debug!(voice = %voice_id, "waiting on backend resume");
                self.play_lock = true;
                self.pending_plays.push(PendingPlay {
                    voice: voice_id,
                    seek,
                    duration,
                    internal,
                    wait: PendingWait::EngineResume,
                });
                self.deadlines.cancel(voice_id);
            }
        } else {
            let ready = self.voices[idx]
                .stream
                .as_ref()
                .is_some_and(|s| s.is_ready());
            if ready {
                self.start_streaming(idx, seek, duration, internal);
            } else {
                debug!(voice = %voice_id, "waiting on element readiness");
                self.play_lock = true;
                self.pending_plays.push(PendingPlay {
                    voice: voice_id,
                    seek,
                    duration,
                    internal,
                    wait: PendingWait::StreamReady,
                });
                self.deadlines.cancel(voice_id);
            }
        }
        Some(voice_id)
    }

    /// Pause voices, recording the playhead so play resumes in place.
    pub fn pause(&mut self, id: Option<VoiceId>) {
        self.pause_impl(id, false);
    }

    fn pause_impl(&mut self, id: Option<VoiceId>, internal: bool) {
        if !internal && (self.state != LoadState::Loaded || self.play_lock) {
            self.queue.push_back(QueuedAction {
                tag: EventKind::Pause,
                command: GroupCommand::Pause { id },
            });
            return;
        }
        for voice_id in self.resolve_ids(id) {
            self.deadlines.cancel(voice_id);
            let Some(idx) = self.voice_index(voice_id) else {
                continue;
            };
            if !self.voices[idx].paused {
                let seek = self.seek_of_index(idx);
                self.stop_fade(idx);
                let Some(idx) = self.voice_index(voice_id) else {
                    continue;
                };
                {
                    let voice = &mut self.voices[idx];
                    voice.seek = seek;
                    voice.rate_seek = 0.0;
                    voice.paused = true;
                }
                self.mark_voice_inactive(idx);
                if self.buffered {
                    self.teardown_source(idx);
                } else if let Some(stream) = self.voices[idx].stream.as_mut() {
                    stream.pause();
                }
            }
            if !internal {
                self.emit(EventKind::Pause, Some(voice_id));
            }
        }
    }

    /// Stop voices: rewind to the sprite start and mark them recyclable.
    pub fn stop(&mut self, id: Option<VoiceId>) {
        self.stop_impl(id, false);
    }

    fn stop_impl(&mut self, id: Option<VoiceId>, internal: bool) {
        if !internal && (self.state != LoadState::Loaded || self.play_lock) {
            self.queue.push_back(QueuedAction {
                tag: EventKind::Stop,
                command: GroupCommand::Stop { id },
            });
            return;
        }
        for voice_id in self.resolve_ids(id) {
            self.deadlines.cancel(voice_id);
            let Some(idx) = self.voice_index(voice_id) else {
                continue;
            };
            self.stop_fade(idx);
            let Some(idx) = self.voice_index(voice_id) else {
                continue;
            };
            {
                let voice = &mut self.voices[idx];
                voice.seek = voice.start;
                voice.rate_seek = 0.0;
                voice.paused = true;
                voice.ended = true;
            }
            self.mark_voice_inactive(idx);
            if self.buffered {
                self.teardown_source(idx);
            } else {
                let start = self.voices[idx].start;
                if let Some(stream) = self.voices[idx].stream.as_mut() {
                    if stream.duration().is_infinite() {
                        // A live stream cannot rewind; detach it so the
                        // download halts too.
                        stream.clear_source();
                    } else {
                        stream.set_position(start);
                        stream.pause();
                    }
                }
            }
            if !internal {
                self.emit(EventKind::Stop, Some(voice_id));
            }
        }
    }

    // ---- attributes -----------------------------------------------------

    pub fn volume(&self) -> f64 {
        self.volume
    }

    pub fn voice_volume(&self, id: VoiceId) -> Option<f64> {
        self.voice_index(id).map(|i| self.voices[i].volume)
    }

    /// Set group or per-voice volume. Out-of-range values change nothing
    /// and read back the current value instead.
    pub fn set_volume(&mut self, volume: f64, id: Option<VoiceId>) -> f64 {
        if !volume.is_finite() || !(0.0..=1.0).contains(&volume) {
            return match id {
                Some(v) => self.voice_volume(v).unwrap_or(self.volume),
                None => self.volume,
            };
        }
        if self.state != LoadState::Loaded || self.play_lock {
            self.queue.push_back(QueuedAction {
                tag: EventKind::Volume,
                command: GroupCommand::Volume { volume, id },
            });
            return volume;
        }
        self.apply_volume(volume, id, true);
        volume
    }

    fn apply_volume(&mut self, volume: f64, id: Option<VoiceId>, cancel_fade: bool) {
        if id.is_none() {
            self.volume = volume;
        }
        let engine_volume = self.engine.volume();
        let now = self.engine.now();
        for voice_id in self.resolve_ids(id) {
            let Some(idx) = self.voice_index(voice_id) else {
                continue;
            };
            if cancel_fade {
                self.stop_fade(idx);
            }
            let Some(idx) = self.voice_index(voice_id) else {
                continue;
            };
            self.voices[idx].volume = volume;
            if !self.voices[idx].muted {
                if self.buffered {
                    if let Some(gain) = self.voices[idx].gain {
                        self.engine
                            .with_backend(|b| b.set_param_at(gain, Param::Gain, volume, now));
                    }
                } else if let Some(stream) = self.voices[idx].stream.as_mut() {
                    stream.set_volume(volume * engine_volume);
                }
            }
            self.emit(EventKind::Volume, Some(voice_id));
        }
    }

    pub fn muted(&self) -> bool {
        self.muted
    }

    pub fn set_muted(&mut self, muted: bool, id: Option<VoiceId>) {
        if self.state != LoadState::Loaded || self.play_lock {
            self.queue.push_back(QueuedAction {
                tag: EventKind::Mute,
                command: GroupCommand::Mute { muted, id },
            });
            return;
        }
        if id.is_none() {
            self.muted = muted;
        }
        let engine_muted = self.engine.muted();
        let now = self.engine.now();
        for voice_id in self.resolve_ids(id) {
            let Some(idx) = self.voice_index(voice_id) else {
                continue;
            };
            self.voices[idx].muted = muted;
            let gain_value = if muted { 0.0 } else { self.voices[idx].volume };
            if self.buffered {
                if let Some(gain) = self.voices[idx].gain {
                    self.engine
                        .with_backend(|b| b.set_param_at(gain, Param::Gain, gain_value, now));
                }
            } else if let Some(stream) = self.voices[idx].stream.as_mut() {
                stream.set_muted(muted || engine_muted);
            }
            self.emit(EventKind::Mute, Some(voice_id));
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn voice_rate(&self, id: VoiceId) -> Option<f64> {
        self.voice_index(id).map(|i| self.voices[i].rate)
    }

    /// Change playback rate. The playhead is re-anchored so seek reads stay
    /// continuous, and end deadlines are recomputed. Non-positive or
    /// non-finite rates read back the current value.
    pub fn set_rate(&mut self, rate: f64, id: Option<VoiceId>) -> f64 {
        if !rate.is_finite() || rate <= 0.0 {
            return match id {
                Some(v) => self.voice_rate(v).unwrap_or(self.rate),
                None => self.rate,
            };
        }
        if self.state != LoadState::Loaded || self.play_lock {
            self.queue.push_back(QueuedAction {
                tag: EventKind::Rate,
                command: GroupCommand::Rate { rate, id },
            });
            return rate;
        }
        if id.is_none() {
            self.rate = rate;
        }
        let now = self.engine.now();
        for voice_id in self.resolve_ids(id) {
            let Some(idx) = self.voice_index(voice_id) else {
                continue;
            };
            let playing = !self.voices[idx].paused;
            if playing {
                // Anchor the playhead under the old rate before switching.
                let current = self.seek_of_index(idx);
                let voice = &mut self.voices[idx];
                voice.rate_seek = current;
                voice.play_start = now;
            }
            self.voices[idx].rate = rate;
            if self.buffered {
                if let Some(source) = self.voices[idx].source {
                    self.engine
                        .with_backend(|b| b.set_param_at(source, Param::Rate, rate, now));
                }
            } else if let Some(stream) = self.voices[idx].stream.as_mut() {
                stream.set_rate(rate);
            }
            if playing || self.deadlines.is_armed(voice_id) {
                self.deadlines.cancel(voice_id);
                let position = self.seek_of_index(idx);
                let stop = self.voices[idx].stop;
                let remaining = ((stop - position) / rate).max(0.0);
                if remaining.is_finite() {
                    self.deadlines.arm(voice_id, now + remaining);
                }
            }
            self.emit(EventKind::Rate, Some(voice_id));
        }
        rate
    }

    /// Current playhead of a voice (the first voice when `id` is `None`).
    pub fn seek(&self, id: Option<VoiceId>) -> f64 {
        let voice_id = match id {
            Some(v) => Some(v),
            None => self.voices.first().map(|v| v.id),
        };
        voice_id
            .and_then(|v| self.voice_index(v))
            .map_or(0.0, |i| self.seek_of_index(i))
    }

    /// Move the playhead. A playing voice restarts at the new position; a
    /// position at or past the sprite end triggers the end transition
    /// instead of starting playback.
    pub fn set_seek(&mut self, position: f64, id: Option<VoiceId>) -> f64 {
        if !position.is_finite() || position < 0.0 {
            return self.seek(id);
        }
        if self.state != LoadState::Loaded || self.play_lock {
            self.queue.push_back(QueuedAction {
                tag: EventKind::Seek,
                command: GroupCommand::Seek { position, id },
            });
            return position;
        }
        let voice_id = match id {
            Some(v) => Some(v),
            None => self.voices.first().map(|v| v.id),
        };
        let Some(voice_id) = voice_id else {
            return position;
        };
        let Some(idx) = self.voice_index(voice_id) else {
            return position;
        };
        let playing = !self.voices[idx].paused;
        if playing {
            self.pause_impl(Some(voice_id), true);
        }
        let Some(idx) = self.voice_index(voice_id) else {
            return position;
        };
        {
            let voice = &mut self.voices[idx];
            voice.seek = position;
            voice.ended = false;
        }
        self.deadlines.cancel(voice_id);
        if !self.buffered {
            if let Some(stream) = self.voices[idx].stream.as_mut() {
                stream.set_position(position);
            }
        }
        if playing {
            self.play_target(PlayTarget::Voice(voice_id), true);
        }
        self.emit(EventKind::Seek, Some(voice_id));
        position
    }

    pub fn looped(&self) -> bool {
        self.looped
    }

    pub fn set_looped(&mut self, looped: bool, id: Option<VoiceId>) {
        if id.is_none() {
            self.looped = looped;
        }
        for voice_id in self.resolve_ids(id) {
            let Some(idx) = self.voice_index(voice_id) else {
                continue;
            };
            self.voices[idx].looped = looped;
            // A looping buffered source must outlive the sprite boundary;
            // restart it from the live playhead on the long span.
            if looped && self.buffered && !self.voices[idx].paused {
                if let Some(source) = self.voices[idx].source {
                    let position = self.seek_of_index(idx);
                    let now = self.engine.now();
                    {
                        let voice = &mut self.voices[idx];
                        voice.seek = position;
                        voice.rate_seek = 0.0;
                        voice.play_start = now;
                    }
                    self.engine.with_backend(|b| {
                        b.stop_source(source);
                        b.start_source(source, position, LOOP_SPAN_SECS);
                    });
                }
            }
        }
    }

    pub fn playing(&self, id: Option<VoiceId>) -> bool {
        match id {
            Some(v) => self
                .voice_index(v)
                .is_some_and(|i| !self.voices[i].paused),
            None => self.voices.iter().any(|v| !v.paused),
        }
    }

    /// Fade volume linearly over `millis`. Buffered voices get a native
    /// ramp; streaming voices are stepped on poll. A `Fade` notification
    /// fires per voice on completion or interruption.
    pub fn fade(&mut self, from: f64, to: f64, millis: u64, id: Option<VoiceId>) {
        if self.state != LoadState::Loaded || self.play_lock {
            self.queue.push_back(QueuedAction {
                tag: EventKind::Fade,
                command: GroupCommand::Fade { from, to, millis, id },
            });
            return;
        }
        self.apply_volume(from, id, true);
        let now = self.engine.now();
        let end = now + millis as f64 / 1000.0;
        for voice_id in self.resolve_ids(id) {
            let Some(idx) = self.voice_index(voice_id) else {
                continue;
            };
            self.voices[idx].fade = Some(FadeState {
                from,
                to,
                start_at: now,
                end_at: end,
                group_wide: id.is_none(),
            });
            if self.buffered && !self.voices[idx].muted {
                if let Some(gain) = self.voices[idx].gain {
                    self.engine.with_backend(|b| {
                        b.set_param_at(gain, Param::Gain, from, now);
                        b.ramp_param(gain, Param::Gain, to, end);
                    });
                }
            }
        }
    }

    /// Interrupt a fade: land on its target and notify.
    fn stop_fade(&mut self, idx: usize) {
        let Some(fade) = self.voices[idx].fade.take() else {
            return;
        };
        let voice_id = self.voices[idx].id;
        let now = self.engine.now();
        self.voices[idx].volume = fade.to;
        if self.buffered {
            if let Some(gain) = self.voices[idx].gain {
                self.engine.with_backend(|b| {
                    b.cancel_scheduled(gain, Param::Gain);
                    b.set_param_at(gain, Param::Gain, fade.to, now);
                });
            }
        } else {
            let engine_volume = self.engine.volume();
            let volume = self.voices[idx].volume;
            if let Some(stream) = self.voices[idx].stream.as_mut() {
                stream.set_volume(volume * engine_volume);
            }
        }
        if fade.group_wide {
            self.volume = fade.to;
        }
        self.emit(EventKind::Fade, Some(voice_id));
    }

    // ---- spatialization -------------------------------------------------

    pub fn stereo(&self) -> Option<f64> {
        self.stereo
    }

    /// Pan left/right in [-1, 1]. Uses the backend's cheap pan primitive
    /// when it has one, otherwise an equal-power spatial panner on the x
    /// axis. Streaming voices only record the value.
    pub fn set_stereo(&mut self, pan: f64, id: Option<VoiceId>) {
        if self.state != LoadState::Loaded || self.play_lock {
            self.queue.push_back(QueuedAction {
                tag: EventKind::Stereo,
                command: GroupCommand::Stereo { pan, id },
            });
            return;
        }
        if id.is_none() {
            self.stereo = Some(pan);
            self.position = Some([pan, 0.0, 0.0]);
        }
        let now = self.engine.now();
        for voice_id in self.resolve_ids(id) {
            let Some(idx) = self.voice_index(voice_id) else {
                continue;
            };
            {
                let voice = &mut self.voices[idx];
                voice.stereo = Some(pan);
                voice.position = Some([pan, 0.0, 0.0]);
            }
            if self.buffered {
                self.ensure_panner(idx, PannerKind::Stereo);
                let Some(idx) = self.voice_index(voice_id) else {
                    continue;
                };
                match self.voices[idx].panner {
                    Some((PannerKind::Stereo, node)) => {
                        self.engine
                            .with_backend(|b| b.set_param_at(node, Param::Pan, pan, now));
                    }
                    Some((PannerKind::Spatial, node)) => {
                        self.engine.with_backend(|b| {
                            b.set_param_at(node, Param::PositionX, pan, now);
                            b.set_param_at(node, Param::PositionY, 0.0, now);
                            b.set_param_at(node, Param::PositionZ, 0.0, now);
                        });
                    }
                    None => {}
                }
            }
            self.emit(EventKind::Stereo, Some(voice_id));
        }
    }

    pub fn position(&self) -> Option<[f64; 3]> {
        self.position
    }

    /// Place voices in 3D space. Creates (or upgrades to) a spatial panner.
    pub fn set_position(&mut self, x: f64, y: f64, z: f64, id: Option<VoiceId>) {
        if self.state != LoadState::Loaded || self.play_lock {
            self.queue.push_back(QueuedAction {
                tag: EventKind::Position,
                command: GroupCommand::Position {
                    position: [x, y, z],
                    id,
                },
            });
            return;
        }
        if id.is_none() {
            self.position = Some([x, y, z]);
        }
        let now = self.engine.now();
        for voice_id in self.resolve_ids(id) {
            let Some(idx) = self.voice_index(voice_id) else {
                continue;
            };
            self.voices[idx].position = Some([x, y, z]);
            if self.buffered {
                self.ensure_panner(idx, PannerKind::Spatial);
                let Some(idx) = self.voice_index(voice_id) else {
                    continue;
                };
                if let Some((PannerKind::Spatial, node)) = self.voices[idx].panner {
                    self.engine.with_backend(|b| {
                        b.set_param_at(node, Param::PositionX, x, now);
                        b.set_param_at(node, Param::PositionY, y, now);
                        b.set_param_at(node, Param::PositionZ, z, now);
                    });
                }
            }
            self.emit(EventKind::Position, Some(voice_id));
        }
    }

    pub fn orientation(&self) -> Option<[f64; 3]> {
        self.orientation
    }

    pub fn set_orientation(&mut self, x: f64, y: f64, z: f64, id: Option<VoiceId>) {
        if self.state != LoadState::Loaded || self.play_lock {
            self.queue.push_back(QueuedAction {
                tag: EventKind::Orientation,
                command: GroupCommand::Orientation {
                    orientation: [x, y, z],
                    id,
                },
            });
            return;
        }
        if id.is_none() {
            self.orientation = Some([x, y, z]);
        }
        let now = self.engine.now();
        for voice_id in self.resolve_ids(id) {
            let Some(idx) = self.voice_index(voice_id) else {
                continue;
            };
            self.voices[idx].orientation = Some([x, y, z]);
            if self.buffered {
                self.ensure_panner(idx, PannerKind::Spatial);
                let Some(idx) = self.voice_index(voice_id) else {
                    continue;
                };
                if let Some((PannerKind::Spatial, node)) = self.voices[idx].panner {
                    self.engine.with_backend(|b| {
                        b.set_param_at(node, Param::OrientationX, x, now);
                        b.set_param_at(node, Param::OrientationY, y, now);
                        b.set_param_at(node, Param::OrientationZ, z, now);
                    });
                }
            }
            self.emit(EventKind::Orientation, Some(voice_id));
        }
    }

    pub fn panner_attrs(&self) -> PannerAttrs {
        self.panner_attrs
    }

    /// Update distance-model and cone settings, creating spatial panners
    /// for voices that lack one.
    pub fn set_panner_attrs(&mut self, attrs: PannerAttrs, id: Option<VoiceId>) {
        if id.is_none() {
            self.panner_attrs = attrs;
        }
        for voice_id in self.resolve_ids(id) {
            let Some(idx) = self.voice_index(voice_id) else {
                continue;
            };
            self.voices[idx].panner_attrs = attrs;
            if !self.buffered {
                continue;
            }
            match self.voices[idx].panner {
                Some((_, node)) => {
                    self.engine.with_backend(|b| b.set_panner_attrs(node, &attrs));
                }
                None => self.ensure_panner(idx, PannerKind::Spatial),
            }
        }
    }

    /// Make sure the voice owns a panner of the right kind, splicing it
    /// into a live chain when necessary.
    fn ensure_panner(&mut self, idx: usize, desired: PannerKind) {
        if !self.buffered {
            return;
        }
        let supported = self.engine.supports_stereo_panner();
        let target_kind = match desired {
            PannerKind::Stereo if supported => PannerKind::Stereo,
            // No cheap pan primitive: emulate with an equal-power spatial
            // panner on the x axis.
            PannerKind::Stereo => {
                self.voices[idx].panner_attrs.panning_model = PanningModel::EqualPower;
                PannerKind::Spatial
            }
            PannerKind::Spatial => PannerKind::Spatial,
        };
        let attrs = self.voices[idx].panner_attrs;
        if self.voices[idx].panner.map(|(kind, _)| kind) == Some(target_kind) {
            if target_kind == PannerKind::Spatial {
                if let Some((_, node)) = self.voices[idx].panner {
                    self.engine.with_backend(|b| b.set_panner_attrs(node, &attrs));
                }
            }
            return;
        }
        let gain = self.voices[idx].gain;
        let old = self.voices[idx].panner.take();
        let created = self.engine.with_backend(|backend| {
            if let Some((_, node)) = old {
                backend.disconnect(node);
            }
            let node = match target_kind {
                PannerKind::Stereo => backend.create_stereo_panner(),
                PannerKind::Spatial => None,
            };
            let node = node.unwrap_or_else(|| backend.create_spatial_panner());
            if target_kind == PannerKind::Spatial {
                backend.set_panner_attrs(node, &attrs);
            }
            if let Some(gain) = gain {
                backend.connect(node, gain);
            }
            node
        });
        let Some(node) = created else {
            return;
        };
        self.voices[idx].panner = Some((target_kind, node));
        // A live source is wired straight to the gain; restart it so the
        // chain runs through the new panner.
        if !self.voices[idx].paused {
            let voice_id = self.voices[idx].id;
            self.pause_impl(Some(voice_id), true);
            self.play_target(PlayTarget::Voice(voice_id), true);
        }
    }

    // ---- events ---------------------------------------------------------

    /// Register a listener for an event kind.
    pub fn on(&mut self, kind: EventKind, callback: impl FnMut(&Notification) + Send + 'static) {
        self.listeners.on(kind, None, false, Box::new(callback));
    }

    /// Listener scoped to one voice.
    pub fn on_voice(
        &mut self,
        kind: EventKind,
        voice: VoiceId,
        callback: impl FnMut(&Notification) + Send + 'static,
    ) {
        self.listeners.on(kind, Some(voice), false, Box::new(callback));
    }

    /// One-shot listener, removed after it fires.
    pub fn once(&mut self, kind: EventKind, callback: impl FnMut(&Notification) + Send + 'static) {
        self.listeners.on(kind, None, true, Box::new(callback));
    }

    pub fn once_voice(
        &mut self,
        kind: EventKind,
        voice: VoiceId,
        callback: impl FnMut(&Notification) + Send + 'static,
    ) {
        self.listeners.on(kind, Some(voice), true, Box::new(callback));
    }

    /// Remove all listeners for an event kind.
    pub fn off(&mut self, kind: EventKind) {
        self.listeners.off(kind);
    }

    // ---- scheduling -----------------------------------------------------

    /// One cooperative turn: complete deferred work and deliver queued
    /// notifications.
    pub fn poll(&mut self) {
        self.engine.poll();
        self.poll_decode();
        self.poll_streaming_load();
        self.poll_pending_plays();
        self.poll_deadlines();
        self.poll_fades();
        self.poll_epochs();
        self.deliver_notifications();
    }

    fn poll_decode(&mut self) {
        let Some(rx) = self.decode_rx.as_ref() else {
            return;
        };
        match rx.try_recv() {
            Ok(Ok(buffer)) => {
                self.decode_rx = None;
                if buffer.is_empty() {
                    warn!("decode produced an empty buffer");
                    self.emit_with_message(EventKind::LoadError, None, "decoded buffer is empty");
                } else {
                    self.finish_load(Arc::new(buffer));
                }
            }
            Ok(Err(err)) => {
                self.decode_rx = None;
                warn!(%err, "decode failed");
                self.emit_with_message(EventKind::LoadError, None, &err.to_string());
            }
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => {
                self.decode_rx = None;
                self.emit_with_message(EventKind::LoadError, None, "decode worker vanished");
            }
        }
    }

    fn poll_streaming_load(&mut self) {
        if self.state != LoadState::Loading || self.buffered {
            return;
        }
        let ready = self
            .voices
            .first()
            .and_then(|v| v.stream.as_ref())
            .is_some_and(|s| s.is_ready());
        if !ready {
            return;
        }
        let duration = self
            .voices
            .first()
            .and_then(|v| v.stream.as_ref())
            .map_or(0.0, |s| s.duration());
        if self.duration.is_none() {
            self.duration = Some(duration);
        }
        self.ensure_default_sprite();
        self.state = LoadState::Loaded;
        info!(duration, "group loaded (streaming)");
        self.emit(EventKind::Load, None);
        self.drain_queue(None);
    }

    fn finish_load(&mut self, buffer: Arc<DecodedBuffer>) {
        if let Some(key) = self.chosen_key() {
            self.engine.cache().retain(&key, buffer.clone());
            self.cache_retained = true;
        }
        if self.duration.is_none() {
            self.duration = Some(buffer.duration);
        }
        self.ensure_default_sprite();
        self.state = LoadState::Loaded;
        info!(duration = buffer.duration, "group loaded");
        self.emit(EventKind::Load, None);
        self.drain_queue(None);
    }

    fn ensure_default_sprite(&mut self) {
        if self.sprites.contains_key(DEFAULT_SPRITE) {
            return;
        }
        let duration = self.duration.unwrap_or(0.0);
        let duration_ms = if duration.is_finite() {
            (duration * 1000.0).round() as u64
        } else {
            u64::MAX
        };
        self.sprites
            .insert(DEFAULT_SPRITE.to_string(), Sprite::new(0, duration_ms));
    }

    fn poll_pending_plays(&mut self) {
        if self.pending_plays.is_empty() {
            return;
        }
        let running = self.engine.is_running();
        let mut due = Vec::new();
        let mut i = 0;
        while i < self.pending_plays.len() {
            let pending = &self.pending_plays[i];
            let fire = match pending.wait {
                PendingWait::EngineResume => running,
                PendingWait::StreamReady => match self.voice_index(pending.voice) {
                    Some(idx) => self.voices[idx]
                        .stream
                        .as_ref()
                        .is_some_and(|s| s.is_ready()),
                    // Voice vanished; drop the record.
                    None => true,
                },
            };
            if fire {
                due.push(self.pending_plays.remove(i));
            } else {
                i += 1;
            }
        }
        let mut started = false;
        for pending in due {
            match self.voice_index(pending.voice) {
                Some(idx) => {
                    if self.buffered {
                        self.start_buffered(idx, pending.seek, pending.duration, pending.internal);
                    } else {
                        self.start_streaming(idx, pending.seek, pending.duration, pending.internal);
                    }
                    started = true;
                }
                None => {
                    if self.pending_plays.is_empty() {
                        self.play_lock = false;
                    }
                }
            }
        }
        if started && !self.play_lock {
            self.drain_queue(None);
        }
    }

    fn poll_deadlines(&mut self) {
        let now = self.engine.now();
        for voice_id in self.deadlines.take_due(now) {
            if let Some(idx) = self.voice_index(voice_id) {
                self.end_voice(idx);
            }
        }
        if self.buffered {
            return;
        }
        // Native end-of-media signals from the elements.
        let ended: Vec<VoiceId> = self
            .voices
            .iter()
            .filter(|v| !v.paused && v.stream.as_ref().is_some_and(|s| s.ended()))
            .map(|v| v.id)
            .collect();
        for voice_id in ended {
            self.deadlines.cancel(voice_id);
            if let Some(idx) = self.voice_index(voice_id) {
                self.end_voice(idx);
            }
        }
    }

    fn poll_fades(&mut self) {
        let now = self.engine.now();
        let fading: Vec<VoiceId> = self
            .voices
            .iter()
            .filter(|v| v.fade.is_some())
            .map(|v| v.id)
            .collect();
        for voice_id in fading {
            let Some(idx) = self.voice_index(voice_id) else {
                continue;
            };
            let Some(fade) = self.voices[idx].fade else {
                continue;
            };
            if fade.finished(now) {
                self.voices[idx].fade = None;
                if fade.group_wide {
                    self.volume = fade.to;
                }
                self.apply_volume(fade.to, Some(voice_id), false);
                self.emit(EventKind::Fade, Some(voice_id));
            } else {
                let value = fade.value_at(now);
                if fade.group_wide {
                    self.volume = value;
                }
                self.apply_volume(value, Some(voice_id), false);
            }
        }
    }

    fn poll_epochs(&mut self) {
        let unlock = self.engine.unlock_epoch();
        if unlock != self.seen_unlock_epoch {
            self.seen_unlock_epoch = unlock;
            self.emit(EventKind::Unlock, None);
        }
        let volume_epoch = self.engine.volume_epoch();
        if volume_epoch != self.seen_volume_epoch {
            self.seen_volume_epoch = volume_epoch;
            // Buffered voices run through the master gain; only streaming
            // elements carry the engine volume baked in.
            if !self.buffered {
                let engine_volume = self.engine.volume();
                let engine_muted = self.engine.muted();
                for voice in &mut self.voices {
                    if let Some(stream) = voice.stream.as_mut() {
                        if !voice.muted {
                            stream.set_volume(voice.volume * engine_volume);
                        }
                        stream.set_muted(voice.muted || engine_muted);
                    }
                }
            }
        }
    }

    fn deliver_notifications(&mut self) {
        while let Some(notification) = self.pending_events.pop_front() {
            self.listeners.notify(&notification);
        }
    }

    // ---- internals ------------------------------------------------------

    fn emit(&mut self, kind: EventKind, voice: Option<VoiceId>) {
        self.push_notification(Notification::new(kind, voice));
    }

    fn emit_with_message(&mut self, kind: EventKind, voice: Option<VoiceId>, message: &str) {
        self.push_notification(Notification::with_message(kind, voice, message));
    }

    fn push_notification(&mut self, notification: Notification) {
        let kind = notification.kind;
        self.pending_events.push_back(notification);
        self.drain_queue(Some(kind));
    }

    /// Advance the deferred-action queue. With an event, pop the head if
    /// its tag matches, then keep going. Bare, run the head's command; the
    /// event that command emits pops its record, so each action runs
    /// exactly once.
    fn drain_queue(&mut self, event: Option<EventKind>) {
        match event {
            Some(kind) => {
                let matches = self.queue.front().is_some_and(|head| head.tag == kind);
                if matches {
                    self.queue.pop_front();
                    self.drain_queue(None);
                }
            }
            None => {
                if self.play_lock {
                    return;
                }
                let Some(head) = self.queue.front() else {
                    return;
                };
                let command = head.command.clone();
                self.run_command(command);
            }
        }
    }

    fn run_command(&mut self, command: GroupCommand) {
        match command {
            GroupCommand::Play { target } => {
                self.play_target(target, false);
            }
            GroupCommand::Pause { id } => self.pause_impl(id, false),
            GroupCommand::Stop { id } => self.stop_impl(id, false),
            GroupCommand::Mute { muted, id } => self.set_muted(muted, id),
            GroupCommand::Volume { volume, id } => {
                self.set_volume(volume, id);
            }
            GroupCommand::Fade { from, to, millis, id } => self.fade(from, to, millis, id),
            GroupCommand::Rate { rate, id } => {
                self.set_rate(rate, id);
            }
            GroupCommand::Seek { position, id } => {
                self.set_seek(position, id);
            }
            GroupCommand::Stereo { pan, id } => self.set_stereo(pan, id),
            GroupCommand::Position { position, id } => {
                self.set_position(position[0], position[1], position[2], id);
            }
            GroupCommand::Orientation { orientation, id } => {
                self.set_orientation(orientation[0], orientation[1], orientation[2], id);
            }
        }
    }

    fn resolve_ids(&self, id: Option<VoiceId>) -> Vec<VoiceId> {
        match id {
            Some(v) => vec![v],
            None => self.voices.iter().map(|v| v.id).collect(),
        }
    }

    fn voice_index(&self, id: VoiceId) -> Option<usize> {
        self.voices.iter().position(|v| v.id == id)
    }

    fn chosen_key(&self) -> Option<String> {
        self.chosen.map(|i| self.sources[i].key.clone())
    }

    fn chosen_spec(&self) -> Option<SourceSpec> {
        self.chosen.map(|i| self.sources[i].clone())
    }

    fn voice_defaults(&self) -> VoiceDefaults {
        VoiceDefaults {
            volume: self.volume,
            rate: self.rate,
            looped: self.looped,
            muted: self.muted,
            stereo: self.stereo,
            position: self.position,
            orientation: self.orientation,
            panner_attrs: self.panner_attrs,
        }
    }

    /// Stored playhead plus elapsed wall progress under the current rate.
    fn seek_of_index(&self, idx: usize) -> f64 {
        let voice = &self.voices[idx];
        if self.buffered {
            let elapsed = if voice.paused {
                0.0
            } else {
                self.engine.now() - voice.play_start
            };
            let rate_anchor = if voice.rate_seek != 0.0 {
                voice.rate_seek - voice.seek
            } else {
                0.0
            };
            voice.seek + rate_anchor + elapsed * voice.rate.abs()
        } else {
            voice.stream.as_ref().map_or(voice.seek, |s| s.position())
        }
    }

    fn set_play_params(&mut self, idx: usize, seek: f64) {
        let sprite = self
            .sprites
            .get(&self.voices[idx].sprite)
            .copied()
            .unwrap_or(Sprite::new(0, 0));
        let voice = &mut self.voices[idx];
        voice.seek = seek;
        voice.start = sprite.start_secs();
        voice.stop = sprite.end_secs();
        voice.looped = voice.looped || sprite.looped;
    }

    fn start_buffered(&mut self, idx: usize, seek: f64, duration: f64, internal: bool) {
        self.play_lock = false;
        self.set_play_params(idx, seek);
        let voice_id = self.voices[idx].id;
        let Some(buffer) = self
            .chosen_key()
            .and_then(|key| self.engine.cache().get(&key))
        else {
            self.fail_play(idx, "decoded buffer missing from cache");
            return;
        };
        let Some(gain) = self.voices[idx].gain else {
            self.fail_play(idx, "voice has no gain node");
            return;
        };
        let looped = self.voices[idx].looped;
        let volume = if self.voices[idx].muted {
            0.0
        } else {
            self.voices[idx].volume
        };
        let rate = self.voices[idx].rate;
        let target = self.voices[idx].panner.map_or(gain, |(_, node)| node);
        let span = if looped { LOOP_SPAN_SECS } else { duration };
        let started = self.engine.with_backend(|backend| {
            let source = backend.create_source(&buffer);
            backend.connect(source, target);
            backend.set_param(source, Param::Rate, rate);
            let now = backend.now();
            backend.set_param_at(gain, Param::Gain, volume, now);
            backend.start_source(source, seek, span);
            (source, now)
        });
        match started {
            Some((source, now)) => {
                {
                    let voice = &mut self.voices[idx];
                    voice.source = Some(source);
                    voice.play_start = now;
                    voice.paused = false;
                }
                self.mark_voice_active(idx);
                let timeout = duration / rate.abs();
                if timeout.is_finite() {
                    self.deadlines.arm(voice_id, now + timeout);
                }
                debug!(voice = %voice_id, seek, duration, "buffered playback started");
                if !internal {
                    self.emit(EventKind::Play, Some(voice_id));
                }
            }
            None => self.fail_play(idx, "audio backend unavailable"),
        }
    }

    fn start_streaming(&mut self, idx: usize, seek: f64, duration: f64, internal: bool) {
        self.play_lock = false;
        self.set_play_params(idx, seek);
        let voice_id = self.voices[idx].id;
        let engine_volume = self.engine.volume();
        let engine_muted = self.engine.muted();
        let now = self.engine.now();
        let sprite_is_default = self.voices[idx].sprite == DEFAULT_SPRITE;
        let looped = self.voices[idx].looped;
        let rate = self.voices[idx].rate;
        let play_result = {
            let voice = &mut self.voices[idx];
            let volume = voice.volume;
            let muted = voice.muted;
            match voice.stream.as_mut() {
                Some(stream) => {
                    stream.set_position(seek);
                    stream.set_muted(muted || engine_muted);
                    stream.set_volume(volume * engine_volume);
                    stream.set_rate(rate);
                    Some(stream.play())
                }
                None => None,
            }
        };
        match play_result {
            Some(Ok(())) => {
                {
                    let voice = &mut self.voices[idx];
                    voice.paused = false;
                    voice.play_start = now;
                }
                // A sprite window or a loop needs our own deadline; a plain
                // full-length play relies on the native ended signal.
                if (!sprite_is_default || looped) && duration.is_finite() {
                    self.deadlines.arm(voice_id, now + duration / rate.abs());
                }
                debug!(voice = %voice_id, seek, "streaming playback started");
                if !internal {
                    self.emit(EventKind::Play, Some(voice_id));
                }
            }
            Some(Err(err)) => {
                {
                    let voice = &mut self.voices[idx];
                    voice.paused = true;
                    voice.ended = true;
                }
                warn!(voice = %voice_id, %err, "element refused playback");
                self.emit_with_message(EventKind::PlayError, Some(voice_id), &err.to_string());
            }
            None => self.fail_play(idx, "voice has no media element"),
        }
    }

    fn fail_play(&mut self, idx: usize, message: &str) {
        self.play_lock = false;
        let voice_id = self.voices[idx].id;
        {
            let voice = &mut self.voices[idx];
            voice.paused = true;
            voice.ended = true;
        }
        self.mark_voice_inactive(idx);
        self.deadlines.cancel(voice_id);
        warn!(voice = %voice_id, message, "playback failed");
        self.emit_with_message(EventKind::PlayError, Some(voice_id), message);
    }

    /// The end transition: emit `End`, then loop or settle the voice.
    fn end_voice(&mut self, idx: usize) {
        let voice_id = self.voices[idx].id;
        let sprite_loop = self
            .sprites
            .get(&self.voices[idx].sprite)
            .is_some_and(|s| s.looped);
        let looped = self.voices[idx].looped || sprite_loop;
        self.emit(EventKind::End, Some(voice_id));
        let Some(idx) = self.voice_index(voice_id) else {
            return;
        };
        match (self.buffered, looped) {
            (true, true) => {
                // The source keeps playing on its long span; just rewind
                // the bookkeeping and re-arm the boundary deadline.
                self.emit(EventKind::Play, Some(voice_id));
                let now = self.engine.now();
                let Some(idx) = self.voice_index(voice_id) else {
                    return;
                };
                let voice = &mut self.voices[idx];
                voice.seek = voice.start;
                voice.rate_seek = 0.0;
                voice.play_start = now;
                let cycle = (voice.stop - voice.start) / voice.rate.abs();
                if cycle.is_finite() {
                    self.deadlines.arm(voice_id, now + cycle);
                }
            }
            (true, false) => {
                {
                    let voice = &mut self.voices[idx];
                    voice.paused = true;
                    voice.ended = true;
                    voice.seek = voice.start;
                }
                self.deadlines.cancel(voice_id);
                self.mark_voice_inactive(idx);
                self.teardown_source(idx);
            }
            (false, true) => {
                self.stop_impl(Some(voice_id), true);
                self.play_target(PlayTarget::Voice(voice_id), false);
            }
            (false, false) => {
                self.stop_impl(Some(voice_id), true);
            }
        }
    }

    /// Stop and release the voice's source node.
    fn teardown_source(&mut self, idx: usize) {
        let Some(source) = self.voices[idx].source.take() else {
            return;
        };
        self.engine.with_backend(|backend| {
            backend.stop_source(source);
            let keep = backend.requires_scratch_attach();
            backend.dispose_source(source, keep);
        });
    }

    fn mark_voice_active(&mut self, idx: usize) {
        if self.buffered && !self.voices[idx].counted_active {
            self.voices[idx].counted_active = true;
            self.engine.voice_started();
        }
    }

    fn mark_voice_inactive(&mut self, idx: usize) {
        if self.voices[idx].counted_active {
            self.voices[idx].counted_active = false;
            self.engine.voice_stopped();
        }
    }

    /// Find a recyclable voice, creating one only when every pooled voice
    /// is busy. The pool may temporarily exceed its capacity then.
    fn acquire_voice_index(&mut self) -> usize {
        self.drain_pool();
        if let Some(idx) = self.voices.iter().position(|v| v.ended) {
            let id = self.engine.allocate_voice_id();
            let defaults = self.voice_defaults();
            self.voices[idx].reset(id, &defaults);
            return idx;
        }
        self.spawn_voice()
    }

    fn spawn_voice(&mut self) -> usize {
        let id = self.engine.allocate_voice_id();
        let defaults = self.voice_defaults();
        let mut voice = Voice::new(id, &defaults);
        if self.buffered {
            let volume = if voice.muted { 0.0 } else { voice.volume };
            voice.gain = self.engine.with_graph(|backend, master| {
                let gain = backend.create_gain();
                backend.connect(gain, master);
                let now = backend.now();
                backend.set_param_at(gain, Param::Gain, volume, now);
                gain
            });
        } else {
            let mut stream = self.engine.acquire_stream();
            if let Some(spec) = self.chosen_spec() {
                stream.load_source(&spec);
            }
            stream.set_volume(voice.volume * self.engine.volume());
            stream.set_muted(voice.muted || self.engine.muted());
            stream.set_rate(voice.rate);
            voice.stream = Some(stream);
        }
        self.voices.push(voice);
        self.voices.len() - 1
    }

    /// Prune ended voices from the back of the pool until at most
    /// `pool_capacity` of them remain. Never touches a live voice.
    fn drain_pool(&mut self) {
        let limit = self.pool_capacity;
        if self.voices.len() < limit {
            return;
        }
        let mut ended = self.voices.iter().filter(|v| v.ended).count();
        let mut i = self.voices.len();
        while i > 0 {
            i -= 1;
            if ended <= limit {
                break;
            }
            if self.voices[i].ended {
                self.dispose_voice_nodes(i);
                self.voices.remove(i);
                ended -= 1;
            }
        }
    }

    fn dispose_voice_nodes(&mut self, idx: usize) {
        self.teardown_source(idx);
        let gain = self.voices[idx].gain.take();
        let panner = self.voices[idx].panner.take();
        if gain.is_some() || panner.is_some() {
            self.engine.with_backend(|backend| {
                if let Some((_, node)) = panner {
                    backend.disconnect(node);
                }
                if let Some(node) = gain {
                    backend.disconnect(node);
                }
            });
        }
        if let Some(stream) = self.voices[idx].stream.take() {
            self.engine.release_stream(stream);
        }
    }
}

impl Drop for Group {
    fn drop(&mut self) {
        if self.state != LoadState::Unloaded {
            self.unload();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use parking_lot::Mutex;
    use polyvox_backend::{
        AudioBackend, LifecycleState, NodeKind, OfflineBackend, Param, Scheduled,
    };
    use polyvox_core::{
        Decoder, Error, EventKind, Notification, PanningModel, SourceSpec, Sprite, TableProbe,
        ToneDecoder, VoiceId, DEFAULT_SPRITE,
    };
    use proptest::prelude::*;

    use super::*;
    use crate::controller::{EngineController, AUTO_SUSPEND_SECS};
    use crate::decode::DecodeMode;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    fn engine_with_decoder(
        backend: &OfflineBackend,
        decoder: Arc<dyn Decoder>,
    ) -> Arc<EngineController> {
        let owned = backend.clone();
        let streams = backend.clone();
        Arc::new(
            EngineController::new(
                Box::new(move || Ok(Box::new(owned) as Box<dyn AudioBackend>)),
                Box::new(move || streams.create_stream()),
                decoder,
                Arc::new(TableProbe::default()),
            )
            .with_decode_mode(DecodeMode::Inline),
        )
    }

    fn engine_with(backend: &OfflineBackend) -> Arc<EngineController> {
        engine_with_decoder(backend, Arc::new(ToneDecoder::new(1.0)))
    }

    fn tone_source() -> SourceSpec {
        SourceSpec::new("tone.wav", Bytes::from_static(b"tone"))
    }

    fn config(sources: Vec<SourceSpec>) -> GroupConfig {
        GroupConfig {
            sources,
            ..GroupConfig::default()
        }
    }

    fn loaded_group(engine: &Arc<EngineController>) -> Group {
        let mut group = Group::new(engine.clone(), config(vec![tone_source()])).unwrap();
        group.poll();
        assert_eq!(group.load_state(), LoadState::Loaded);
        group
    }

    fn recorded(group: &mut Group, kind: EventKind) -> Arc<Mutex<Vec<Notification>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let probe = log.clone();
        group.on(kind, move |n| probe.lock().push(n.clone()));
        log
    }

    fn gain_value(backend: &OfflineBackend, group: &Group, id: VoiceId) -> f64 {
        let idx = group.voice_index(id).unwrap();
        let gain = group.voices[idx].gain.unwrap();
        backend.node(gain).unwrap().params[&Param::Gain]
    }

    fn source_of(group: &Group, id: VoiceId) -> polyvox_backend::NodeId {
        let idx = group.voice_index(id).unwrap();
        group.voices[idx].source.unwrap()
    }

    // ---- loading --------------------------------------------------------

    #[test]
    fn load_synthesizes_the_default_sprite() {
        init_tracing();
        let backend = OfflineBackend::new();
        let engine = engine_with(&backend);
        let mut group = Group::new(engine, config(vec![tone_source()])).unwrap();
        assert_eq!(group.load_state(), LoadState::Loading);
        let loads = recorded(&mut group, EventKind::Load);
        group.poll();
        assert_eq!(group.load_state(), LoadState::Loaded);
        assert_eq!(loads.lock().len(), 1);
        assert_eq!(group.sprites()[DEFAULT_SPRITE], Sprite::new(0, 1000));
        assert!((group.duration() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn unsupported_sources_report_load_error() {
        let backend = OfflineBackend::new();
        let engine = engine_with(&backend);
        let mut group =
            Group::new(engine, config(vec![SourceSpec::new("notes.txt", Bytes::new())])).unwrap();
        let errors = recorded(&mut group, EventKind::LoadError);
        group.poll();
        assert_eq!(group.load_state(), LoadState::Unloaded);
        assert_eq!(errors.lock().len(), 1);
        assert!(errors.lock()[0].message.is_some());
    }

    #[test]
    fn decode_failure_reports_load_error_and_stays_loading() {
        let backend = OfflineBackend::new();
        let engine = engine_with_decoder(&backend, Arc::new(ToneDecoder::broken()));
        let mut group = Group::new(engine, config(vec![tone_source()])).unwrap();
        let errors = recorded(&mut group, EventKind::LoadError);
        group.poll();
        assert_eq!(group.load_state(), LoadState::Loading);
        assert_eq!(errors.lock().len(), 1);
    }

    #[test]
    fn a_group_needs_sources() {
        let backend = OfflineBackend::new();
        let engine = engine_with(&backend);
        assert!(matches!(
            Group::new(engine, config(vec![])),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn shared_cache_evicts_after_last_unload() {
        let backend = OfflineBackend::new();
        let engine = engine_with(&backend);
        let mut first = Group::new(engine.clone(), config(vec![tone_source()])).unwrap();
        first.poll();
        // second group hits the cache and loads synchronously
        let second = Group::new(engine.clone(), config(vec![tone_source()])).unwrap();
        assert_eq!(second.load_state(), LoadState::Loaded);
        assert_eq!(engine.cache().len(), 1);
        first.unload();
        assert!(engine.cache().contains("tone.wav"));
        drop(second);
        assert!(!engine.cache().contains("tone.wav"));
    }

    // ---- playback -------------------------------------------------------

    #[test]
    fn play_assigns_fresh_increasing_ids() {
        let backend = OfflineBackend::new();
        let engine = engine_with(&backend);
        let mut group = loaded_group(&engine);
        let first = group.play().unwrap();
        let second = group.play().unwrap();
        assert!(second > first);
        assert!(group.playing(Some(first)) && group.playing(Some(second)));
        assert_eq!(group.voice_count(), 2);
    }

    #[test]
    fn play_starts_the_source_inside_the_sprite_window() {
        let backend = OfflineBackend::new();
        let engine = engine_with(&backend);
        let mut cfg = config(vec![tone_source()]);
        cfg.sprites.insert("laser".into(), Sprite::new(250, 500));
        let mut group = Group::new(engine, cfg).unwrap();
        group.poll();
        let id = group.play_sprite("laser").unwrap();
        let record = backend.node(source_of(&group, id)).unwrap();
        assert_eq!(record.starts.len(), 1);
        assert!((record.starts[0].offset - 0.25).abs() < 1e-9);
        assert!((record.starts[0].duration - 0.5).abs() < 1e-9);
    }

    #[test]
    fn unknown_sprites_are_refused() {
        let backend = OfflineBackend::new();
        let engine = engine_with(&backend);
        let mut group = loaded_group(&engine);
        assert!(group.play_sprite("missing").is_none());
        // load spawned one eager voice; the refusal left it untouched
        assert_eq!(group.voice_count(), 1);
        assert!(group.voices[0].ended);
    }

    #[test]
    fn replay_after_stop_restarts_from_the_sprite_start() {
        let backend = OfflineBackend::new();
        let engine = engine_with(&backend);
        let mut group = loaded_group(&engine);
        let id = group.play().unwrap();
        backend.advance(0.4);
        group.stop(Some(id));
        assert!(!group.playing(Some(id)));
        assert!(group.seek(Some(id)).abs() < 1e-9);
        group.play_voice(id).unwrap();
        assert!(group.playing(Some(id)));
        assert!(group.seek(Some(id)).abs() < 1e-9);
    }

    #[test]
    fn pause_records_the_playhead_and_resume_continues() {
        let backend = OfflineBackend::new();
        let engine = engine_with(&backend);
        let mut group = loaded_group(&engine);
        let id = group.play().unwrap();
        backend.advance(0.5);
        group.pause(Some(id));
        assert!((group.seek(Some(id)) - 0.5).abs() < 1e-9);
        // exactly one paused voice: a bare play resumes it in place
        let resumed = group.play().unwrap();
        assert_eq!(resumed, id);
        assert_eq!(group.voice_count(), 1);
        backend.advance(0.25);
        assert!((group.seek(Some(id)) - 0.75).abs() < 1e-9);
    }

    #[test]
    fn bare_play_with_two_paused_voices_starts_a_new_one() {
        let backend = OfflineBackend::new();
        let engine = engine_with(&backend);
        let mut group = loaded_group(&engine);
        let first = group.play().unwrap();
        let second = group.play().unwrap();
        group.pause(None);
        let third = group.play().unwrap();
        assert_ne!(third, first);
        assert_ne!(third, second);
        assert_eq!(group.voice_count(), 3);
    }

    #[test]
    fn natural_end_settles_the_voice() {
        let backend = OfflineBackend::new();
        let engine = engine_with(&backend);
        let mut group = loaded_group(&engine);
        let id = group.play().unwrap();
        let source = source_of(&group, id);
        let ends = recorded(&mut group, EventKind::End);
        backend.advance(1.0);
        group.poll();
        assert_eq!(ends.lock().len(), 1);
        let idx = group.voice_index(id).unwrap();
        assert!(group.voices[idx].paused && group.voices[idx].ended);
        assert!(group.seek(Some(id)).abs() < 1e-9);
        assert!(backend.node(source).unwrap().disposed.is_some());
    }

    #[test]
    fn scratch_attach_is_honored_on_dispose() {
        let backend = OfflineBackend::new().with_scratch_attach(true);
        let engine = engine_with(&backend);
        let mut group = loaded_group(&engine);
        let id = group.play().unwrap();
        let source = source_of(&group, id);
        backend.advance(1.0);
        group.poll();
        assert_eq!(backend.node(source).unwrap().disposed, Some(true));
    }

    #[test]
    fn looping_voice_rearms_with_an_end_per_cycle() {
        let backend = OfflineBackend::new();
        let engine = engine_with(&backend);
        let mut cfg = config(vec![tone_source()]);
        cfg.looped = true;
        let mut group = Group::new(engine, cfg).unwrap();
        group.poll();
        let id = group.play().unwrap();
        let source = source_of(&group, id);
        let ends = recorded(&mut group, EventKind::End);
        // looped sources start on the long span and never restart
        let record = backend.node(source).unwrap();
        assert!((record.starts[0].duration - LOOP_SPAN_SECS).abs() < 1e-9);
        backend.advance(1.0);
        group.poll();
        backend.advance(1.0);
        group.poll();
        assert_eq!(ends.lock().len(), 2);
        assert!(group.playing(Some(id)));
        assert_eq!(backend.node(source).unwrap().starts.len(), 1);
    }

    #[test]
    fn seeking_past_the_sprite_end_ends_without_a_restart() {
        let backend = OfflineBackend::new();
        let engine = engine_with(&backend);
        let mut group = loaded_group(&engine);
        let id = group.play().unwrap();
        let ends = recorded(&mut group, EventKind::End);
        group.set_seek(5.0, Some(id));
        let idx = group.voice_index(id).unwrap();
        assert!(group.voices[idx].ended);
        group.poll();
        assert_eq!(ends.lock().len(), 1);
        // only the original start was ever issued
        assert_eq!(backend.nodes_of_kind(NodeKind::Source).len(), 1);
    }

    #[test]
    fn autoplay_starts_once_loaded() {
        let backend = OfflineBackend::new();
        let engine = engine_with(&backend);
        let mut cfg = config(vec![tone_source()]);
        cfg.autoplay = true;
        let mut group = Group::new(engine, cfg).unwrap();
        let plays = recorded(&mut group, EventKind::Play);
        group.poll();
        assert!(group.playing(None));
        assert_eq!(plays.lock().len(), 1);
    }

    // ---- deferred-action queue ------------------------------------------

    #[test]
    fn queued_operations_apply_in_order_after_load() {
        let backend = OfflineBackend::new();
        let engine = engine_with(&backend);
        let mut group = Group::new(engine, config(vec![tone_source()])).unwrap();
        // still loading: everything below is captured, nothing applies yet
        let id = group.play().unwrap();
        group.set_volume(0.5, None);
        group.set_rate(1.5, None);
        assert!(!group.playing(Some(id)));
        let plays = recorded(&mut group, EventKind::Play);
        group.poll();
        assert_eq!(group.load_state(), LoadState::Loaded);
        assert!(group.playing(Some(id)));
        assert_eq!(plays.lock().len(), 1);
        assert!((group.volume() - 0.5).abs() < 1e-9);
        assert!((group.rate() - 1.5).abs() < 1e-9);
        assert!((gain_value(&backend, &group, id) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn deferred_queue_runs_each_action_exactly_once() {
        let backend = OfflineBackend::new();
        let engine = engine_with(&backend);
        let mut group = Group::new(engine, config(vec![tone_source()])).unwrap();
        // repeated bare plays while loading collapse onto the one claimed
        // voice, leaving two Play records with the same tag in the queue
        let first = group.play().unwrap();
        let second = group.play().unwrap();
        assert_eq!(second, first);
        group.set_volume(0.5, None);
        let plays = recorded(&mut group, EventKind::Play);
        group.poll();
        // the first Play event pops only its own record; the duplicate is
        // consumed by the already-playing turn, so the source starts once
        assert!(group.playing(Some(first)));
        assert_eq!(plays.lock().len(), 1);
        assert_eq!(backend.nodes_of_kind(NodeKind::Source).len(), 1);
        assert!((group.volume() - 0.5).abs() < 1e-9);
        assert!((gain_value(&backend, &group, first) - 0.5).abs() < 1e-9);
        assert!(group.queue.is_empty());
    }

    // ---- volume, mute, rate ---------------------------------------------

    #[test]
    fn out_of_range_volume_reads_back_instead() {
        let backend = OfflineBackend::new();
        let engine = engine_with(&backend);
        let mut group = loaded_group(&engine);
        assert!((group.set_volume(0.5, None) - 0.5).abs() < 1e-9);
        assert!((group.set_volume(1.5, None) - 0.5).abs() < 1e-9);
        let id = group.play().unwrap();
        group.set_volume(0.25, Some(id));
        assert!((group.set_volume(-1.0, Some(id)) - 0.25).abs() < 1e-9);
        // the group volume was untouched by the per-voice write
        assert!((group.volume() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn muting_a_voice_zeroes_its_gain() {
        let backend = OfflineBackend::new();
        let engine = engine_with(&backend);
        let mut group = loaded_group(&engine);
        let id = group.play().unwrap();
        group.set_muted(true, Some(id));
        assert!(gain_value(&backend, &group, id).abs() < 1e-9);
        group.set_muted(false, Some(id));
        assert!((gain_value(&backend, &group, id) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn rate_change_reanchors_the_playhead_and_deadline() {
        let backend = OfflineBackend::new();
        let engine = engine_with(&backend);
        let mut group = loaded_group(&engine);
        let id = group.play().unwrap();
        backend.advance(0.5);
        group.set_rate(2.0, Some(id));
        assert!((group.seek(Some(id)) - 0.5).abs() < 1e-9);
        backend.advance(0.2);
        assert!((group.seek(Some(id)) - 0.9).abs() < 1e-9);
        let ends = recorded(&mut group, EventKind::End);
        group.poll();
        assert!(ends.lock().is_empty());
        // remaining 0.5s of audio takes 0.25s at double speed
        backend.advance(0.05);
        group.poll();
        assert_eq!(ends.lock().len(), 1);
    }

    #[test]
    fn invalid_rates_read_back() {
        let backend = OfflineBackend::new();
        let engine = engine_with(&backend);
        let mut group = loaded_group(&engine);
        group.set_rate(1.25, None);
        assert!((group.set_rate(0.0, None) - 1.25).abs() < 1e-9);
        assert!((group.set_rate(f64::NAN, None) - 1.25).abs() < 1e-9);
    }

    // ---- fades ----------------------------------------------------------

    #[test]
    fn group_fade_ramps_and_completes() {
        let backend = OfflineBackend::new();
        let engine = engine_with(&backend);
        let mut group = loaded_group(&engine);
        let id = group.play().unwrap();
        let fades = recorded(&mut group, EventKind::Fade);
        group.fade(1.0, 0.0, 500, None);
        let idx = group.voice_index(id).unwrap();
        let gain = group.voices[idx].gain.unwrap();
        let scheduled = backend.node(gain).unwrap().scheduled;
        assert!(scheduled.iter().any(|s| matches!(
            s,
            Scheduled::RampTo { target, at, .. } if target.abs() < 1e-9 && (*at - 0.5).abs() < 1e-9
        )));
        backend.advance(0.25);
        group.poll();
        assert!((group.volume() - 0.5).abs() < 1e-9);
        assert!(fades.lock().is_empty());
        backend.advance(0.3);
        group.poll();
        assert!(group.volume().abs() < 1e-9);
        assert_eq!(fades.lock().len(), 1);
    }

    #[test]
    fn pausing_mid_fade_lands_on_the_target() {
        let backend = OfflineBackend::new();
        let engine = engine_with(&backend);
        let mut group = loaded_group(&engine);
        let id = group.play().unwrap();
        let fades = recorded(&mut group, EventKind::Fade);
        group.fade(1.0, 0.2, 1000, Some(id));
        backend.advance(0.3);
        group.pause(Some(id));
        group.poll();
        assert_eq!(fades.lock().len(), 1);
        assert!((group.voice_volume(id).unwrap() - 0.2).abs() < 1e-9);
    }

    // ---- backend lifecycle ----------------------------------------------

    #[test]
    fn idle_group_suspends_and_play_resumes_through_the_transition() {
        init_tracing();
        let backend = OfflineBackend::new();
        let engine = engine_with(&backend);
        let mut group = loaded_group(&engine);
        group.play().unwrap();
        backend.advance(1.0);
        group.poll(); // voice ends; the suspend countdown starts
        backend.advance(AUTO_SUSPEND_SECS);
        group.poll();
        assert_eq!(engine.lifecycle(), LifecycleState::Suspending);
        // playing while mid-suspend defers until the transition settles
        let id = group.play().unwrap();
        assert!(!group.playing(Some(id)));
        backend.advance(0.0); // suspend completes
        group.poll(); // deferred resume begins
        assert_eq!(engine.lifecycle(), LifecycleState::Resuming);
        backend.advance(0.0); // resume completes
        group.poll(); // pending play starts
        assert!(group.playing(Some(id)));
    }

    #[test]
    fn unlock_notification_reaches_groups() {
        let backend = OfflineBackend::new();
        let engine = engine_with(&backend);
        let mut group = loaded_group(&engine);
        let unlocks = recorded(&mut group, EventKind::Unlock);
        engine.notify_user_gesture();
        group.poll();
        group.poll();
        assert_eq!(unlocks.lock().len(), 1);
    }

    #[test]
    fn listener_placement_reaches_the_backend() {
        let backend = OfflineBackend::new();
        let engine = engine_with(&backend);
        assert!(engine.backend_available());
        engine.set_listener_position(1.0, 2.0, 3.0);
        engine.set_listener_orientation(0.0, 0.0, -1.0, 0.0, 1.0, 0.0);
        assert_eq!(backend.listener_position(), [1.0, 2.0, 3.0]);
        assert_eq!(backend.listener_orientation(), [0.0, 0.0, -1.0, 0.0, 1.0, 0.0]);
    }

    // ---- voice pool -----------------------------------------------------

    #[test]
    fn pool_recycles_only_ended_voices() {
        let backend = OfflineBackend::new();
        let engine = engine_with(&backend);
        let mut cfg = config(vec![tone_source()]);
        cfg.pool = 2;
        let mut group = Group::new(engine, cfg).unwrap();
        group.poll();
        let ids: Vec<VoiceId> = (0..4).map(|_| group.play().unwrap()).collect();
        assert_eq!(group.voice_count(), 4);
        group.stop(Some(ids[0]));
        let fresh = group.play().unwrap();
        // the stopped voice was recycled; the live ones were left alone
        assert_eq!(group.voice_count(), 4);
        assert!(fresh > ids[3]);
        for &id in &ids[1..] {
            assert!(group.playing(Some(id)));
        }
        assert!(group.playing(Some(fresh)));
    }

    #[test]
    fn pool_shrinks_back_to_capacity_after_a_burst() {
        let backend = OfflineBackend::new();
        let engine = engine_with(&backend);
        let mut cfg = config(vec![tone_source()]);
        cfg.pool = 3;
        let mut group = Group::new(engine, cfg).unwrap();
        group.poll();
        for _ in 0..6 {
            group.play().unwrap();
        }
        assert_eq!(group.voice_count(), 6);
        group.stop(None);
        group.play().unwrap();
        assert_eq!(group.voice_count(), 3);
    }

    // ---- streaming mode -------------------------------------------------

    fn streaming_group(engine: &Arc<EngineController>, key: &str) -> Group {
        let mut cfg = config(vec![SourceSpec::new(key, Bytes::new())]);
        cfg.buffered = false;
        Group::new(engine.clone(), cfg).unwrap()
    }

    #[test]
    fn streaming_playback_drives_the_element() {
        let backend = OfflineBackend::new();
        let engine = engine_with(&backend);
        let mut group = streaming_group(&engine, "radio.mp3");
        group.poll();
        assert_eq!(group.load_state(), LoadState::Loaded);
        group.play().unwrap();
        let handle = backend.stream_handle(0).unwrap();
        assert!(handle.is_playing());
        assert_eq!(handle.key(), Some("radio.mp3".into()));
        // global volume is baked into the element volume
        engine.set_volume(0.5);
        group.poll();
        assert!((handle.volume() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn streaming_rejection_emits_play_error() {
        let backend = OfflineBackend::new();
        let engine = engine_with(&backend);
        let mut group = streaming_group(&engine, "radio.mp3");
        group.poll();
        let errors = recorded(&mut group, EventKind::PlayError);
        backend.stream_handle(0).unwrap().fail_next_play();
        let id = group.play().unwrap();
        group.poll();
        assert_eq!(errors.lock().len(), 1);
        let idx = group.voice_index(id).unwrap();
        assert!(group.voices[idx].paused && group.voices[idx].ended);
    }

    #[test]
    fn streaming_play_waits_for_readiness() {
        let backend = OfflineBackend::new();
        let engine = engine_with(&backend);
        let mut group = streaming_group(&engine, "radio.mp3");
        group.poll();
        let handle = backend.stream_handle(0).unwrap();
        handle.set_ready(false);
        let plays = recorded(&mut group, EventKind::Play);
        group.play().unwrap();
        assert!(!handle.is_playing());
        group.poll();
        assert!(plays.lock().is_empty());
        handle.set_ready(true);
        group.poll();
        assert!(handle.is_playing());
        assert_eq!(plays.lock().len(), 1);
    }

    #[test]
    fn stopping_a_live_stream_detaches_the_source() {
        let backend = OfflineBackend::new();
        let engine = engine_with(&backend);
        let mut group = streaming_group(&engine, "radio.mp3");
        group.poll();
        let id = group.play().unwrap();
        group.stop(Some(id));
        let handle = backend.stream_handle(0).unwrap();
        assert!(handle.source_cleared());
        assert!(!handle.is_playing());
    }

    #[test]
    fn native_ended_signal_finishes_the_voice() {
        let backend = OfflineBackend::new();
        let engine = engine_with(&backend);
        let mut group = streaming_group(&engine, "song.mp3");
        let handle = backend.stream_handle(0).unwrap();
        handle.set_duration(30.0);
        group.poll();
        assert!((group.duration() - 30.0).abs() < 1e-9);
        let id = group.play().unwrap();
        let ends = recorded(&mut group, EventKind::End);
        handle.finish_playback();
        group.poll();
        assert_eq!(ends.lock().len(), 1);
        assert!(!group.playing(Some(id)));
    }

    // ---- spatialization -------------------------------------------------

    #[test]
    fn stereo_pan_uses_the_cheap_primitive() {
        let backend = OfflineBackend::new();
        let engine = engine_with(&backend);
        let mut group = loaded_group(&engine);
        let id = group.play().unwrap();
        group.set_stereo(0.5, Some(id));
        let panners = backend.nodes_of_kind(NodeKind::StereoPanner);
        assert_eq!(panners.len(), 1);
        assert!((backend.node(panners[0]).unwrap().params[&Param::Pan] - 0.5).abs() < 1e-9);
        // the chain now runs source -> panner -> gain and playback survived
        let idx = group.voice_index(id).unwrap();
        let (_, panner) = group.voices[idx].panner.unwrap();
        let gain = group.voices[idx].gain.unwrap();
        let source = group.voices[idx].source.unwrap();
        assert_eq!(backend.node(source).unwrap().connected_to, Some(panner));
        assert_eq!(backend.node(panner).unwrap().connected_to, Some(gain));
        assert!(group.playing(Some(id)));
    }

    #[test]
    fn stereo_pan_falls_back_to_an_equal_power_spatial_panner() {
        let backend = OfflineBackend::new().with_stereo_panner(false);
        let engine = engine_with(&backend);
        let mut group = loaded_group(&engine);
        let id = group.play().unwrap();
        group.set_stereo(-1.0, Some(id));
        assert!(backend.nodes_of_kind(NodeKind::StereoPanner).is_empty());
        let spatial = backend.nodes_of_kind(NodeKind::SpatialPanner);
        assert_eq!(spatial.len(), 1);
        let record = backend.node(spatial[0]).unwrap();
        assert!((record.params[&Param::PositionX] + 1.0).abs() < 1e-9);
        assert_eq!(
            record.panner_attrs.unwrap().panning_model,
            PanningModel::EqualPower
        );
    }

    #[test]
    fn positioning_upgrades_a_stereo_panner_to_spatial() {
        let backend = OfflineBackend::new();
        let engine = engine_with(&backend);
        let mut group = loaded_group(&engine);
        let id = group.play().unwrap();
        group.set_stereo(0.5, Some(id));
        group.set_position(1.0, 2.0, 3.0, Some(id));
        let idx = group.voice_index(id).unwrap();
        assert!(matches!(
            group.voices[idx].panner,
            Some((PannerKind::Spatial, _))
        ));
        let stereo = backend.nodes_of_kind(NodeKind::StereoPanner);
        assert_eq!(backend.node(stereo[0]).unwrap().connected_to, None);
        let (_, spatial) = group.voices[idx].panner.unwrap();
        let record = backend.node(spatial).unwrap();
        assert!((record.params[&Param::PositionX] - 1.0).abs() < 1e-9);
        assert!((record.params[&Param::PositionY] - 2.0).abs() < 1e-9);
        assert!((record.params[&Param::PositionZ] - 3.0).abs() < 1e-9);
    }

    #[test]
    fn panner_attrs_create_spatial_panners_on_demand() {
        let backend = OfflineBackend::new();
        let engine = engine_with(&backend);
        let mut group = loaded_group(&engine);
        let id = group.play().unwrap();
        let attrs = PannerAttrs {
            rolloff_factor: 2.5,
            ..PannerAttrs::default()
        };
        group.set_panner_attrs(attrs, Some(id));
        let spatial = backend.nodes_of_kind(NodeKind::SpatialPanner);
        assert_eq!(spatial.len(), 1);
        let recorded_attrs = backend.node(spatial[0]).unwrap().panner_attrs.unwrap();
        assert!((recorded_attrs.rolloff_factor - 2.5).abs() < 1e-9);
    }

    // ---- property: the pool never leaks under arbitrary op orders -------

    proptest! {
        #[test]
        fn pool_stays_bounded_under_random_ops(ops in proptest::collection::vec(0u8..4, 1..40)) {
            let backend = OfflineBackend::new();
            let engine = engine_with(&backend);
            let mut group = loaded_group(&engine);
            let mut peak_active = 0usize;
            for op in ops {
                match op {
                    0 => {
                        group.play();
                    }
                    1 => group.pause(None),
                    2 => group.stop(None),
                    _ => {
                        backend.advance(0.3);
                        group.poll();
                    }
                }
                let active = group.voices.iter().filter(|v| !v.ended).count();
                peak_active = peak_active.max(active);
                prop_assert!(group.voice_count() <= DEFAULT_POOL_CAPACITY.max(peak_active));
                // ids stay unique
                let mut ids = group.voice_ids();
                ids.sort_unstable();
                ids.dedup();
                prop_assert_eq!(ids.len(), group.voice_count());
            }
        }
    }
}
