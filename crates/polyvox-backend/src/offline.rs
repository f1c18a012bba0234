//! Deterministic in-memory backend.
//!
//! `OfflineBackend` records every graph mutation instead of producing sound,
//! and runs against a manually advanced clock. It backs headless use of the
//! engine and the whole test suite: tests keep a clone of the backend and
//! inspect node records or drive stream readiness through it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use polyvox_core::{DecodedBuffer, Error, PannerAttrs, Result, SourceSpec};
use tracing::debug;

use crate::graph::{AudioBackend, LifecycleState, NodeId, Param};
use crate::stream::MediaStream;

/// What kind of node a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Destination,
    Gain,
    StereoPanner,
    SpatialPanner,
    Source,
}

/// A time-stamped parameter change.
#[derive(Debug, Clone, PartialEq)]
pub enum Scheduled {
    SetAt { param: Param, value: f64, at: f64 },
    RampTo { param: Param, target: f64, at: f64 },
}

/// One recorded `start_source` call.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceStart {
    /// Clock value when the start was issued.
    pub at: f64,
    pub offset: f64,
    pub duration: f64,
}

/// Everything the backend knows about one node.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub kind: NodeKind,
    pub params: HashMap<Param, f64>,
    pub scheduled: Vec<Scheduled>,
    pub connected_to: Option<NodeId>,
    pub starts: Vec<SourceStart>,
    pub stopped: bool,
    /// `Some(keep_scratch)` once the source has been disposed.
    pub disposed: Option<bool>,
    pub buffer_duration: Option<f64>,
    pub panner_attrs: Option<PannerAttrs>,
}

impl NodeRecord {
    fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            params: HashMap::new(),
            scheduled: Vec::new(),
            connected_to: None,
            starts: Vec::new(),
            stopped: false,
            disposed: None,
            buffer_duration: None,
            panner_attrs: None,
        }
    }
}

#[derive(Debug)]
struct OfflineState {
    clock: f64,
    lifecycle: LifecycleState,
    closed: bool,
    nodes: Vec<NodeRecord>,
    listener_position: [f64; 3],
    listener_orientation: [f64; 6],
    streams: Vec<Arc<Mutex<OfflineStreamState>>>,
    stereo_panner_supported: bool,
    scratch_attach: bool,
    silent_probe_ok: bool,
    silent_probes: u32,
}

/// Deterministic backend with a manually advanced clock.
///
/// Cloning is shallow; every clone observes and mutates the same graph,
/// which is how tests hold a probe onto a backend owned by the engine.
#[derive(Clone)]
pub struct OfflineBackend {
    inner: Arc<Mutex<OfflineState>>,
}

impl Default for OfflineBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl OfflineBackend {
    pub fn new() -> Self {
        let state = OfflineState {
            clock: 0.0,
            lifecycle: LifecycleState::Running,
            closed: false,
            // Node 0 is always the destination.
            nodes: vec![NodeRecord::new(NodeKind::Destination)],
            listener_position: [0.0; 3],
            listener_orientation: [0.0, 0.0, -1.0, 0.0, 1.0, 0.0],
            streams: Vec::new(),
            stereo_panner_supported: true,
            scratch_attach: false,
            silent_probe_ok: true,
            silent_probes: 0,
        };
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    /// Toggle availability of the dedicated stereo-pan primitive.
    pub fn with_stereo_panner(self, supported: bool) -> Self {
        self.inner.lock().stereo_panner_supported = supported;
        self
    }

    /// Make disposed sources require a scratch buffer.
    pub fn with_scratch_attach(self, required: bool) -> Self {
        self.inner.lock().scratch_attach = required;
        self
    }

    /// Advance the clock by `dt` seconds. Any in-flight lifecycle
    /// transition completes on this boundary, even when `dt` is zero.
    pub fn advance(&self, dt: f64) {
        let mut state = self.inner.lock();
        state.clock += dt;
        state.lifecycle = match state.lifecycle {
            LifecycleState::Suspending => LifecycleState::Suspended,
            LifecycleState::Resuming => LifecycleState::Running,
            other => other,
        };
    }

    /// Snapshot of a node's record.
    pub fn node(&self, id: NodeId) -> Option<NodeRecord> {
        self.inner.lock().nodes.get(id.0 as usize).cloned()
    }

    /// Ids of all nodes of the given kind, in creation order.
    pub fn nodes_of_kind(&self, kind: NodeKind) -> Vec<NodeId> {
        self.inner
            .lock()
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.kind == kind)
            .map(|(i, _)| NodeId(i as u64))
            .collect()
    }

    pub fn listener_position(&self) -> [f64; 3] {
        self.inner.lock().listener_position
    }

    pub fn listener_orientation(&self) -> [f64; 6] {
        self.inner.lock().listener_orientation
    }

    pub fn stream_count(&self) -> usize {
        self.inner.lock().streams.len()
    }

    /// Handle onto the `index`-th stream ever created, for driving
    /// readiness and ended signals from tests.
    pub fn stream_handle(&self, index: usize) -> Option<OfflineStreamHandle> {
        self.inner
            .lock()
            .streams
            .get(index)
            .map(|s| OfflineStreamHandle { state: s.clone() })
    }

    /// How many silent unlock probes have been played.
    pub fn silent_probes(&self) -> u32 {
        self.inner.lock().silent_probes
    }

    /// Make the next (and all later) silent probes fail or succeed.
    pub fn set_silent_probe_ok(&self, ok: bool) {
        self.inner.lock().silent_probe_ok = ok;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Create a blank media element backed by this backend's shared state.
    /// Doubles as the engine's [`crate::stream::StreamFactory`] in tests.
    pub fn create_stream(&self) -> Box<dyn MediaStream> {
        let state = Arc::new(Mutex::new(OfflineStreamState::new()));
        self.inner.lock().streams.push(state.clone());
        Box::new(OfflineStream { state })
    }

    fn add_node(&mut self, kind: NodeKind) -> NodeId {
        let mut state = self.inner.lock();
        let id = NodeId(state.nodes.len() as u64);
        state.nodes.push(NodeRecord::new(kind));
        id
    }
}

impl AudioBackend for OfflineBackend {
    fn now(&self) -> f64 {
        self.inner.lock().clock
    }

    fn lifecycle(&self) -> LifecycleState {
        self.inner.lock().lifecycle
    }

    fn begin_suspend(&mut self) {
        let mut state = self.inner.lock();
        if state.lifecycle == LifecycleState::Running {
            debug!("offline backend suspending");
            state.lifecycle = LifecycleState::Suspending;
        }
    }

    fn begin_resume(&mut self) {
        let mut state = self.inner.lock();
        if state.lifecycle == LifecycleState::Suspended {
            debug!("offline backend resuming");
            state.lifecycle = LifecycleState::Resuming;
        }
    }

    fn close(&mut self) {
        let mut state = self.inner.lock();
        state.closed = true;
        state.lifecycle = LifecycleState::Suspended;
    }

    fn destination(&self) -> NodeId {
        NodeId(0)
    }

    fn create_gain(&mut self) -> NodeId {
        let id = self.add_node(NodeKind::Gain);
        self.set_param(id, Param::Gain, 1.0);
        id
    }

    fn supports_stereo_panner(&self) -> bool {
        self.inner.lock().stereo_panner_supported
    }

    fn create_stereo_panner(&mut self) -> Option<NodeId> {
        if !self.inner.lock().stereo_panner_supported {
            return None;
        }
        let id = self.add_node(NodeKind::StereoPanner);
        self.set_param(id, Param::Pan, 0.0);
        Some(id)
    }

    fn create_spatial_panner(&mut self) -> NodeId {
        self.add_node(NodeKind::SpatialPanner)
    }

    fn create_source(&mut self, buffer: &DecodedBuffer) -> NodeId {
        let id = self.add_node(NodeKind::Source);
        let mut state = self.inner.lock();
        let record = &mut state.nodes[id.0 as usize];
        record.buffer_duration = Some(buffer.duration);
        record.params.insert(Param::Rate, 1.0);
        id
    }

    fn connect(&mut self, from: NodeId, to: NodeId) {
        let mut state = self.inner.lock();
        if let Some(node) = state.nodes.get_mut(from.0 as usize) {
            node.connected_to = Some(to);
        }
    }

    fn disconnect(&mut self, node: NodeId) {
        let mut state = self.inner.lock();
        if let Some(node) = state.nodes.get_mut(node.0 as usize) {
            node.connected_to = None;
        }
    }

    fn dispose_source(&mut self, node: NodeId, keep_scratch: bool) {
        let mut state = self.inner.lock();
        if let Some(node) = state.nodes.get_mut(node.0 as usize) {
            node.connected_to = None;
            node.disposed = Some(keep_scratch);
        }
    }

    fn set_param(&mut self, node: NodeId, param: Param, value: f64) {
        let mut state = self.inner.lock();
        if let Some(node) = state.nodes.get_mut(node.0 as usize) {
            node.params.insert(param, value);
        }
    }

    fn set_param_at(&mut self, node: NodeId, param: Param, value: f64, at: f64) {
        let mut state = self.inner.lock();
        if let Some(node) = state.nodes.get_mut(node.0 as usize) {
            node.scheduled.push(Scheduled::SetAt { param, value, at });
            node.params.insert(param, value);
        }
    }

    fn ramp_param(&mut self, node: NodeId, param: Param, target: f64, at: f64) {
        let mut state = self.inner.lock();
        if let Some(node) = state.nodes.get_mut(node.0 as usize) {
            node.scheduled.push(Scheduled::RampTo { param, target, at });
        }
    }

    fn cancel_scheduled(&mut self, node: NodeId, param: Param) {
        let mut state = self.inner.lock();
        if let Some(node) = state.nodes.get_mut(node.0 as usize) {
            node.scheduled.retain(|change| {
                let p = match change {
                    Scheduled::SetAt { param, .. } | Scheduled::RampTo { param, .. } => *param,
                };
                p != param
            });
        }
    }

    fn set_panner_attrs(&mut self, node: NodeId, attrs: &PannerAttrs) {
        let mut state = self.inner.lock();
        if let Some(node) = state.nodes.get_mut(node.0 as usize) {
            node.panner_attrs = Some(*attrs);
        }
    }

    fn set_listener_position(&mut self, x: f64, y: f64, z: f64) {
        self.inner.lock().listener_position = [x, y, z];
    }

    fn set_listener_orientation(&mut self, fx: f64, fy: f64, fz: f64, ux: f64, uy: f64, uz: f64) {
        self.inner.lock().listener_orientation = [fx, fy, fz, ux, uy, uz];
    }

    fn start_source(&mut self, node: NodeId, offset: f64, duration: f64) {
        let mut state = self.inner.lock();
        let at = state.clock;
        if let Some(node) = state.nodes.get_mut(node.0 as usize) {
            node.starts.push(SourceStart {
                at,
                offset,
                duration,
            });
            node.stopped = false;
        }
    }

    fn stop_source(&mut self, node: NodeId) {
        let mut state = self.inner.lock();
        if let Some(node) = state.nodes.get_mut(node.0 as usize) {
            node.stopped = true;
        }
    }

    fn requires_scratch_attach(&self) -> bool {
        self.inner.lock().scratch_attach
    }

    fn play_silent_probe(&mut self) -> Result<()> {
        let mut state = self.inner.lock();
        state.silent_probes += 1;
        if state.silent_probe_ok {
            Ok(())
        } else {
            Err(Error::Play("silent probe rejected".into()))
        }
    }
}

#[derive(Debug)]
struct OfflineStreamState {
    key: Option<String>,
    ready: bool,
    playing: bool,
    position: f64,
    duration: f64,
    volume: f64,
    muted: bool,
    rate: f64,
    ended: bool,
    fail_next_play: bool,
    source_cleared: bool,
    play_calls: u32,
}

impl OfflineStreamState {
    fn new() -> Self {
        Self {
            key: None,
            ready: true,
            playing: false,
            position: 0.0,
            duration: f64::INFINITY,
            volume: 1.0,
            muted: false,
            rate: 1.0,
            ended: false,
            fail_next_play: false,
            source_cleared: false,
            play_calls: 0,
        }
    }
}

/// A media element owned by a voice, backed by shared offline state.
struct OfflineStream {
    state: Arc<Mutex<OfflineStreamState>>,
}

impl MediaStream for OfflineStream {
    fn load_source(&mut self, spec: &SourceSpec) {
        let mut state = self.state.lock();
        state.key = Some(spec.key.clone());
        state.position = 0.0;
        state.ended = false;
        state.source_cleared = false;
    }

    fn is_ready(&self) -> bool {
        self.state.lock().ready
    }

    fn play(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.play_calls += 1;
        if state.fail_next_play {
            state.fail_next_play = false;
            return Err(Error::Play("autoplay policy refused the element".into()));
        }
        state.playing = true;
        state.ended = false;
        Ok(())
    }

    fn pause(&mut self) {
        self.state.lock().playing = false;
    }

    fn set_position(&mut self, secs: f64) {
        self.state.lock().position = secs;
    }

    fn position(&self) -> f64 {
        self.state.lock().position
    }

    fn duration(&self) -> f64 {
        self.state.lock().duration
    }

    fn set_volume(&mut self, volume: f64) {
        self.state.lock().volume = volume;
    }

    fn set_muted(&mut self, muted: bool) {
        self.state.lock().muted = muted;
    }

    fn set_rate(&mut self, rate: f64) {
        self.state.lock().rate = rate;
    }

    fn ended(&self) -> bool {
        self.state.lock().ended
    }

    fn clear_source(&mut self) {
        let mut state = self.state.lock();
        state.key = None;
        state.playing = false;
        state.source_cleared = true;
    }
}

/// Test-side handle for driving an [`OfflineStream`].
#[derive(Clone)]
pub struct OfflineStreamHandle {
    state: Arc<Mutex<OfflineStreamState>>,
}

impl OfflineStreamHandle {
    pub fn set_ready(&self, ready: bool) {
        self.state.lock().ready = ready;
    }

    pub fn set_duration(&self, duration: f64) {
        self.state.lock().duration = duration;
    }

    /// Raise the native ended signal, as the element would at end of media.
    pub fn finish_playback(&self) {
        let mut state = self.state.lock();
        state.ended = true;
        state.playing = false;
    }

    pub fn set_position(&self, secs: f64) {
        self.state.lock().position = secs;
    }

    /// Make the next `play()` call fail, emulating an autoplay rejection.
    pub fn fail_next_play(&self) {
        self.state.lock().fail_next_play = true;
    }

    pub fn is_playing(&self) -> bool {
        self.state.lock().playing
    }

    pub fn position(&self) -> f64 {
        self.state.lock().position
    }

    pub fn volume(&self) -> f64 {
        self.state.lock().volume
    }

    pub fn muted(&self) -> bool {
        self.state.lock().muted
    }

    pub fn rate(&self) -> f64 {
        self.state.lock().rate
    }

    pub fn key(&self) -> Option<String> {
        self.state.lock().key.clone()
    }

    pub fn source_cleared(&self) -> bool {
        self.state.lock().source_cleared
    }

    pub fn play_calls(&self) -> u32 {
        self.state.lock().play_calls
    }
}
