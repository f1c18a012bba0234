//! Spatialization attributes applied to panner nodes.

use serde::{Deserialize, Serialize};

/// Distance attenuation model for a spatial panner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DistanceModel {
    Linear,
    #[default]
    Inverse,
    Exponential,
}

/// Spatialization algorithm for a spatial panner.
///
/// `EqualPower` is the cheap model used when a plain stereo pan has to be
/// emulated through a full spatial panner; `Hrtf` is reserved for true 3D
/// positioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PanningModel {
    EqualPower,
    #[default]
    Hrtf,
}

/// Full attribute set for a spatial panner node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PannerAttrs {
    pub cone_inner_angle: f64,
    pub cone_outer_angle: f64,
    pub cone_outer_gain: f64,
    pub distance_model: DistanceModel,
    pub max_distance: f64,
    pub ref_distance: f64,
    pub rolloff_factor: f64,
    pub panning_model: PanningModel,
}

impl Default for PannerAttrs {
    fn default() -> Self {
        Self {
            cone_inner_angle: 360.0,
            cone_outer_angle: 360.0,
            cone_outer_gain: 0.0,
            distance_model: DistanceModel::Inverse,
            max_distance: 10_000.0,
            ref_distance: 1.0,
            rolloff_factor: 1.0,
            panning_model: PanningModel::Hrtf,
        }
    }
}
