//! Structs shared by every protocol version (§3). These carry the
//! semantic fields the master controller and virtual AGV engines need;
//! fields that exist only for visualization/logging purposes in the
//! standard but are never read by the engines are kept as plain
//! `Option<f32>` passthroughs rather than modeled in depth (out of scope
//! per spec.md §1: "the concrete object-type schemas").

use serde::{Deserialize, Serialize};

/// Current position of the AGV on the map.
#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgvPosition {
    pub x: f32,
    pub y: f32,
    pub theta: f32,
    pub map_id: String,
    pub map_description: Option<String>,
    pub position_initialized: bool,
    pub localization_score: Option<f32>,
    pub deviation_range: Option<f32>,
}

/// Target pose on a map (§3 Node).
#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodePosition {
    pub x: f32,
    pub y: f32,
    pub theta: Option<f32>,
    pub allowed_deviation_xy: Option<f32>,
    pub allowed_deviation_theta: Option<f32>,
    pub map_id: String,
    pub map_description: Option<String>,
}

/// The AGV's velocity in vehicle coordinates.
#[serde_with::skip_serializing_none]
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Velocity {
    pub vx: Option<f32>,
    pub vy: Option<f32>,
    pub omega: Option<f32>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControlPoint {
    pub x: f32,
    pub y: f32,
    pub weight: Option<f32>,
    pub orientation: Option<f32>,
}

/// A NURBS trajectory an edge may carry in place of implicit straight-line
/// traversal (§4.7.2 generalizes the straight-line case; trajectory
/// following is an optional supplement, see SPEC_FULL.md §10).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Trajectory {
    pub degree: i64,
    pub knot_vector: Vec<f32>,
    pub control_points: Vec<ControlPoint>,
}

#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BoundingBoxReference {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub theta: Option<f32>,
}

#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoadDimensions {
    pub length: f32,
    pub width: f32,
    pub height: Option<f32>,
}

/// A load the AGV is carrying, synthesised by `pick`/removed by `drop`
/// (§4.7.5).
#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Load {
    pub load_id: Option<String>,
    pub load_type: Option<String>,
    pub load_position: Option<String>,
    pub bounding_box_reference: Option<BoundingBoxReference>,
    pub load_dimensions: Option<LoadDimensions>,
    pub weight: Option<f32>,
}

/// A key into `errorReferences`/`actionParameters` and its associated
/// value (§3).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReference {
    pub reference_key: String,
    pub reference_value: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ErrorLevel {
    Warning,
    Fatal,
}

/// An entry in `State.errors`, the sole error channel from AGV to
/// coordinator (§3, §7).
#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VdaError {
    pub error_type: String,
    pub error_level: ErrorLevel,
    pub error_description: Option<String>,
    #[serde(default)]
    pub error_references: Vec<ErrorReference>,
}

impl VdaError {
    pub fn reference(&self, key: &str) -> Option<&str> {
        self.error_references
            .iter()
            .find(|r| r.reference_key == key)
            .map(|r| r.reference_value.as_str())
    }
}

/// Well-known `errorReferences` keys used by the master controller's
/// correlation logic (§4.5.3).
pub mod error_reference_keys {
    pub const TOPIC: &str = "topic";
    pub const ORDER_ID: &str = "orderId";
    pub const ORDER_UPDATE_ID: &str = "orderUpdateId";
    pub const ACTION_ID: &str = "actionId";
}

/// Well-known `errorType` values (§7).
pub mod error_types {
    pub const VALIDATION_ERROR: &str = "validationError";
    pub const ORDER_ERROR: &str = "orderError";
    pub const ORDER_ACTION_ERROR: &str = "orderActionError";
    pub const NO_ORDER_TO_CANCEL: &str = "noOrderToCancel";
    pub const BATTERY_LOW_ERROR: &str = "batteryLowError";
}
