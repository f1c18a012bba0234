//! The audio-graph backend contract.

use polyvox_core::{DecodedBuffer, PannerAttrs, Result};

/// Opaque handle to a node inside a backend's audio graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) u64);

impl NodeId {
    pub const fn index(self) -> u64 {
        self.0
    }
}

/// Lifecycle of the shared audio clock/graph.
///
/// Suspend and resume complete asynchronously; the engine observes the
/// transition finishing through `lifecycle()` on a later scheduling turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifecycleState {
    #[default]
    Running,
    Suspending,
    Suspended,
    Resuming,
}

/// Schedulable node parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Param {
    Gain,
    Pan,
    Rate,
    PositionX,
    PositionY,
    PositionZ,
    OrientationX,
    OrientationY,
    OrientationZ,
}

/// Abstraction over an engine-managed audio graph: node creation, wiring,
/// time-stamped parameter scheduling, source control, and the clock.
///
/// All methods are cheap bookkeeping from the engine's point of view; any
/// real signal processing happens behind this seam.
pub trait AudioBackend: Send {
    /// Current value of the shared clock, in seconds. Monotone.
    fn now(&self) -> f64;

    fn lifecycle(&self) -> LifecycleState;

    /// Request the clock/graph be quiesced. Completion is observed via
    /// `lifecycle()` later.
    fn begin_suspend(&mut self);

    /// Request the clock/graph be brought back to `Running`.
    fn begin_resume(&mut self);

    /// Tear the graph down. No calls are valid afterwards.
    fn close(&mut self);

    /// The terminal mix node.
    fn destination(&self) -> NodeId;

    fn create_gain(&mut self) -> NodeId;

    /// Whether a dedicated cheap stereo-pan primitive exists. Checked before
    /// deciding which panner kind a plain stereo pan gets.
    fn supports_stereo_panner(&self) -> bool {
        true
    }

    /// A dedicated cheap stereo-pan primitive. `None` when the backend does
    /// not support one and a full spatial panner must be used instead.
    fn create_stereo_panner(&mut self) -> Option<NodeId>;

    fn create_spatial_panner(&mut self) -> NodeId;

    fn create_source(&mut self, buffer: &DecodedBuffer) -> NodeId;

    fn connect(&mut self, from: NodeId, to: NodeId);

    fn disconnect(&mut self, node: NodeId);

    /// Release a source node. `keep_scratch` keeps a harmless scratch
    /// buffer attached, for platforms that misbehave when a source is
    /// detached bare.
    fn dispose_source(&mut self, node: NodeId, keep_scratch: bool);

    /// Immediate parameter write.
    fn set_param(&mut self, node: NodeId, param: Param, value: f64);

    /// Schedule a parameter write at clock time `at`.
    fn set_param_at(&mut self, node: NodeId, param: Param, value: f64, at: f64);

    /// Schedule a linear ramp ending at clock time `at`.
    fn ramp_param(&mut self, node: NodeId, param: Param, target: f64, at: f64);

    /// Drop all scheduled changes for a parameter.
    fn cancel_scheduled(&mut self, node: NodeId, param: Param);

    fn set_panner_attrs(&mut self, node: NodeId, attrs: &PannerAttrs);

    fn set_listener_position(&mut self, x: f64, y: f64, z: f64);

    fn set_listener_orientation(&mut self, fx: f64, fy: f64, fz: f64, ux: f64, uy: f64, uz: f64);

    /// Start a source node at `offset` seconds into its buffer, playing for
    /// `duration` seconds.
    fn start_source(&mut self, node: NodeId, offset: f64, duration: f64);

    fn stop_source(&mut self, node: NodeId);

    /// True when disposed sources must keep a scratch buffer attached.
    fn requires_scratch_attach(&self) -> bool {
        false
    }

    /// Play a near-silent one-shot buffer, used to detect whether autoplay
    /// restrictions have lifted.
    fn play_silent_probe(&mut self) -> Result<()>;
}

/// Factory producing the backend on first use, so creation failure can fall
/// back to streaming-only mode without aborting engine construction.
pub type BackendFactory = Box<dyn FnOnce() -> Result<Box<dyn AudioBackend>> + Send>;
