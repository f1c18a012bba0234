//! The engine controller: one per process, shared by every group.
//!
//! Owns the lazily created audio backend and its master gain, the global
//! volume and mute, listener placement, the decoded-buffer cache, voice-id
//! allocation, the pooled streaming elements, the auto-suspend state machine
//! and the one-time gesture unlock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use polyvox_backend::{
    AudioBackend, BackendFactory, LifecycleState, MediaStream, NodeId, Param, StreamFactory,
};
use polyvox_core::{CodecProbe, Decoder, VoiceId, FIRST_VOICE_ID};
use tracing::{debug, info, warn};

use crate::cache::BufferCache;
use crate::decode::DecodeMode;

/// Seconds of global silence after which the backend is suspended.
pub const AUTO_SUSPEND_SECS: f64 = 30.0;

/// How many blank streaming elements the controller keeps pooled.
pub const STREAM_POOL_CAPACITY: usize = 10;

struct ControllerState {
    factory: Option<BackendFactory>,
    backend: Option<Box<dyn AudioBackend>>,
    backend_failed: bool,
    master_gain: Option<NodeId>,
    volume: f64,
    muted: bool,
    listener_position: [f64; 3],
    listener_orientation: [f64; 6],
    active_voices: usize,
    suspend_deadline: Option<f64>,
    resume_after_suspend: bool,
    stream_factory: StreamFactory,
    stream_pool: Vec<Box<dyn MediaStream>>,
    stream_pool_capacity: usize,
    unlocked: bool,
    unlock_epoch: u64,
    volume_epoch: u64,
}

/// Shared engine context. Groups hold an `Arc<EngineController>` and route
/// all backend access through it.
pub struct EngineController {
    state: Mutex<ControllerState>,
    next_voice_id: AtomicU64,
    cache: BufferCache,
    decoder: Arc<dyn Decoder>,
    probe: Arc<dyn CodecProbe>,
    decode_mode: DecodeMode,
    /// Wall-clock fallback when no backend exists; streaming deadlines
    /// still need a monotone clock.
    epoch: Instant,
}

/// Create the backend on first demand. Failure is remembered so the engine
/// degrades to streaming-only mode instead of retrying forever.
fn ensure_backend(state: &mut ControllerState) {
    if state.backend.is_some() || state.backend_failed {
        return;
    }
    let Some(factory) = state.factory.take() else {
        state.backend_failed = true;
        return;
    };
    match factory() {
        Ok(mut backend) => {
            let master = backend.create_gain();
            let destination = backend.destination();
            backend.connect(master, destination);
            let gain = if state.muted { 0.0 } else { state.volume };
            backend.set_param(master, Param::Gain, gain);
            info!("audio backend ready");
            state.master_gain = Some(master);
            state.backend = Some(backend);
        }
        Err(err) => {
            warn!(%err, "audio backend unavailable, falling back to streaming-only mode");
            state.backend_failed = true;
        }
    }
}

impl EngineController {
    pub fn new(
        backend: BackendFactory,
        streams: StreamFactory,
        decoder: Arc<dyn Decoder>,
        probe: Arc<dyn CodecProbe>,
    ) -> Self {
        Self {
            state: Mutex::new(ControllerState {
                factory: Some(backend),
                backend: None,
                backend_failed: false,
                master_gain: None,
                volume: 1.0,
                muted: false,
                listener_position: [0.0; 3],
                listener_orientation: [0.0, 0.0, -1.0, 0.0, 1.0, 0.0],
                active_voices: 0,
                suspend_deadline: None,
                resume_after_suspend: false,
                stream_factory: streams,
                stream_pool: Vec::new(),
                stream_pool_capacity: STREAM_POOL_CAPACITY,
                unlocked: false,
                unlock_epoch: 0,
                volume_epoch: 0,
            }),
            next_voice_id: AtomicU64::new(FIRST_VOICE_ID),
            cache: BufferCache::new(),
            decoder,
            probe,
            decode_mode: DecodeMode::default(),
            epoch: Instant::now(),
        }
    }

    /// Decode on the caller's stack instead of a worker thread. Mostly for
    /// deterministic headless use.
    #[must_use]
    pub fn with_decode_mode(mut self, mode: DecodeMode) -> Self {
        self.decode_mode = mode;
        self
    }

    #[must_use]
    pub fn with_stream_pool_capacity(self, capacity: usize) -> Self {
        self.state.lock().stream_pool_capacity = capacity;
        self
    }

    pub fn decode_mode(&self) -> DecodeMode {
        self.decode_mode
    }

    pub fn decoder(&self) -> Arc<dyn Decoder> {
        self.decoder.clone()
    }

    pub fn probe(&self) -> Arc<dyn CodecProbe> {
        self.probe.clone()
    }

    pub fn cache(&self) -> &BufferCache {
        &self.cache
    }

    pub fn allocate_voice_id(&self) -> VoiceId {
        VoiceId(self.next_voice_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Current clock in seconds: the backend clock when one exists,
    /// otherwise time since the controller was built.
    pub fn now(&self) -> f64 {
        let state = self.state.lock();
        match state.backend.as_ref() {
            Some(backend) => backend.now(),
            None => self.epoch.elapsed().as_secs_f64(),
        }
    }

    /// Whether buffered playback is possible. Forces backend creation.
    pub fn backend_available(&self) -> bool {
        let mut state = self.state.lock();
        ensure_backend(&mut state);
        state.backend.is_some()
    }

    pub fn is_running(&self) -> bool {
        let state = self.state.lock();
        state
            .backend
            .as_ref()
            .is_some_and(|b| b.lifecycle() == LifecycleState::Running)
    }

    pub fn lifecycle(&self) -> LifecycleState {
        let state = self.state.lock();
        state
            .backend
            .as_ref()
            .map_or(LifecycleState::Suspended, |b| b.lifecycle())
    }

    /// Run graph work against the backend. Returns `None` in streaming-only
    /// mode. The closure must not call back into the controller.
    pub(crate) fn with_backend<R>(
        &self,
        f: impl FnOnce(&mut dyn AudioBackend) -> R,
    ) -> Option<R> {
        let mut state = self.state.lock();
        ensure_backend(&mut state);
        state.backend.as_mut().map(|b| f(b.as_mut()))
    }

    /// Like [`Self::with_backend`] but also hands over the master gain node
    /// new voice chains connect to.
    pub(crate) fn with_graph<R>(
        &self,
        f: impl FnOnce(&mut dyn AudioBackend, NodeId) -> R,
    ) -> Option<R> {
        let mut state = self.state.lock();
        ensure_backend(&mut state);
        let master = state.master_gain?;
        state.backend.as_mut().map(|b| f(b.as_mut(), master))
    }

    pub fn supports_stereo_panner(&self) -> bool {
        let state = self.state.lock();
        state
            .backend
            .as_ref()
            .is_some_and(|b| b.supports_stereo_panner())
    }

    pub fn volume(&self) -> f64 {
        self.state.lock().volume
    }

    /// Set the global volume. Values outside `[0, 1]` leave it untouched
    /// and return the current value.
    pub fn set_volume(&self, volume: f64) -> f64 {
        let mut state = self.state.lock();
        let state = &mut *state;
        if !volume.is_finite() || !(0.0..=1.0).contains(&volume) {
            return state.volume;
        }
        state.volume = volume;
        state.volume_epoch += 1;
        if !state.muted {
            if let (Some(backend), Some(master)) = (state.backend.as_mut(), state.master_gain) {
                let now = backend.now();
                backend.set_param_at(master, Param::Gain, volume, now);
            }
        }
        volume
    }

    pub fn muted(&self) -> bool {
        self.state.lock().muted
    }

    pub fn set_muted(&self, muted: bool) {
        let mut state = self.state.lock();
        let state = &mut *state;
        state.muted = muted;
        state.volume_epoch += 1;
        let gain = if muted { 0.0 } else { state.volume };
        if let (Some(backend), Some(master)) = (state.backend.as_mut(), state.master_gain) {
            let now = backend.now();
            backend.set_param_at(master, Param::Gain, gain, now);
        }
    }

    pub fn listener_position(&self) -> [f64; 3] {
        self.state.lock().listener_position
    }

    pub fn set_listener_position(&self, x: f64, y: f64, z: f64) {
        let mut state = self.state.lock();
        state.listener_position = [x, y, z];
        if let Some(backend) = state.backend.as_mut() {
            backend.set_listener_position(x, y, z);
        }
    }

    pub fn listener_orientation(&self) -> [f64; 6] {
        self.state.lock().listener_orientation
    }

    /// Facing direction plus up vector.
    pub fn set_listener_orientation(&self, fx: f64, fy: f64, fz: f64, ux: f64, uy: f64, uz: f64) {
        let mut state = self.state.lock();
        state.listener_orientation = [fx, fy, fz, ux, uy, uz];
        if let Some(backend) = state.backend.as_mut() {
            backend.set_listener_orientation(fx, fy, fz, ux, uy, uz);
        }
    }

    /// A buffered voice went active: cancel any pending auto-suspend.
    pub(crate) fn voice_started(&self) {
        let mut state = self.state.lock();
        state.active_voices += 1;
        state.suspend_deadline = None;
    }

    /// A buffered voice went quiet. Once none remain, auto-suspend arms.
    pub(crate) fn voice_stopped(&self) {
        let mut state = self.state.lock();
        state.active_voices = state.active_voices.saturating_sub(1);
        if state.active_voices == 0 {
            let now = state.backend.as_ref().map(|b| b.now());
            if let Some(now) = now {
                state.suspend_deadline = Some(now + AUTO_SUSPEND_SECS);
            }
        }
    }

    pub fn active_voices(&self) -> usize {
        self.state.lock().active_voices
    }

    /// Bring a suspended backend back before playback. A resume landing in
    /// the middle of a suspend is deferred until the suspend completes.
    pub(crate) fn auto_resume(&self) {
        let mut state = self.state.lock();
        let state = &mut *state;
        state.suspend_deadline = None;
        ensure_backend(state);
        if let Some(backend) = state.backend.as_mut() {
            match backend.lifecycle() {
                LifecycleState::Suspended => {
                    debug!("resuming suspended backend");
                    backend.begin_resume();
                }
                LifecycleState::Suspending => {
                    state.resume_after_suspend = true;
                }
                _ => {}
            }
        }
    }

    /// One scheduling turn: fire a due auto-suspend, finish a deferred
    /// resume.
    pub fn poll(&self) {
        let mut state = self.state.lock();
        let state = &mut *state;
        let Some(backend) = state.backend.as_mut() else {
            return;
        };
        match backend.lifecycle() {
            LifecycleState::Suspended if state.resume_after_suspend => {
                state.resume_after_suspend = false;
                debug!("completing deferred resume");
                backend.begin_resume();
            }
            LifecycleState::Running => {
                if let Some(at) = state.suspend_deadline {
                    if state.active_voices == 0 && backend.now() >= at {
                        debug!("auto-suspending idle backend");
                        state.suspend_deadline = None;
                        backend.begin_suspend();
                    }
                }
            }
            _ => {}
        }
    }

    pub fn unlocked(&self) -> bool {
        self.state.lock().unlocked
    }

    pub(crate) fn unlock_epoch(&self) -> u64 {
        self.state.lock().unlock_epoch
    }

    pub(crate) fn volume_epoch(&self) -> u64 {
        self.state.lock().volume_epoch
    }

    /// Report a user gesture. The first successful call primes the stream
    /// pool, plays a silent probe through the backend and marks the engine
    /// unlocked; later calls are no-ops.
    pub fn notify_user_gesture(&self) -> bool {
        let mut state = self.state.lock();
        let state = &mut *state;
        if state.unlocked {
            return true;
        }
        while state.stream_pool.len() < state.stream_pool_capacity {
            let stream = (state.stream_factory)();
            state.stream_pool.push(stream);
        }
        ensure_backend(state);
        let probed = match state.backend.as_mut() {
            Some(backend) => backend.play_silent_probe().is_ok(),
            // Nothing to probe without a graph; elements alone suffice.
            None => true,
        };
        if probed {
            state.unlocked = true;
            state.unlock_epoch += 1;
            info!("audio unlocked by user gesture");
        } else {
            debug!("unlock probe rejected, still locked");
        }
        probed
    }

    /// Take a pooled blank element, or create a fresh one.
    pub(crate) fn acquire_stream(&self) -> Box<dyn MediaStream> {
        let mut state = self.state.lock();
        let state = &mut *state;
        match state.stream_pool.pop() {
            Some(stream) => stream,
            None => (state.stream_factory)(),
        }
    }

    /// Return an element to the pool; dropped when the pool is full.
    pub(crate) fn release_stream(&self, mut stream: Box<dyn MediaStream>) {
        stream.clear_source();
        let mut state = self.state.lock();
        if state.stream_pool.len() < state.stream_pool_capacity {
            state.stream_pool.push(stream);
        }
    }

    pub fn pooled_streams(&self) -> usize {
        self.state.lock().stream_pool.len()
    }

    /// Tear down the backend and drop every pooled element.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if let Some(mut backend) = state.backend.take() {
            backend.close();
        }
        state.factory = None;
        state.backend_failed = true;
        state.stream_pool.clear();
        state.suspend_deadline = None;
        info!("engine closed");
    }
}
