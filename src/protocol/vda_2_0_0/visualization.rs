use serde::{Deserialize, Serialize};

use crate::protocol::vda5050_common::{AgvPosition, Velocity};

/// The headerless body of a `visualization` message: a high-frequency,
/// low-latency position/velocity feed separate from `state` (§3).
#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VisualizationBody {
    pub agv_position: Option<AgvPosition>,
    pub velocity: Option<Velocity>,
}
