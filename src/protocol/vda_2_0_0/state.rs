use serde::{Deserialize, Serialize};

use crate::protocol::vda5050_common::{AgvPosition, Load, Trajectory, VdaError, Velocity};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ActionStatus {
    Waiting,
    Initializing,
    Running,
    Paused,
    Finished,
    Failed,
}

impl ActionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ActionStatus::Finished | ActionStatus::Failed)
    }
}

#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionState {
    pub action_id: String,
    pub action_type: Option<String>,
    pub action_description: Option<String>,
    pub action_status: ActionStatus,
    pub result_description: Option<String>,
}

#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeState {
    pub node_id: String,
    pub sequence_id: u32,
    pub node_description: Option<String>,
    pub released: bool,
    pub node_position: Option<crate::protocol::vda5050_common::NodePosition>,
}

#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EdgeState {
    pub edge_id: String,
    pub sequence_id: u32,
    pub edge_description: Option<String>,
    pub released: bool,
    pub trajectory: Option<Trajectory>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperatingMode {
    Automatic,
    Semiautomatic,
    Manual,
    Service,
    Teachin,
}

#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatteryState {
    pub battery_charge: f32,
    pub battery_voltage: Option<f32>,
    pub battery_health: Option<f32>,
    pub charging: bool,
    pub reach: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EStop {
    AutoAck,
    Manual,
    Remote,
    None,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafetyState {
    pub e_stop: EStop,
    pub field_violation: bool,
}

/// The headerless body of a `state` message: the bus carrying all
/// progress info the master controller derives events from (§3 State).
#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StateBody {
    pub order_id: String,
    pub order_update_id: u32,
    pub zone_set_id: Option<String>,
    pub last_node_id: String,
    pub last_node_sequence_id: u32,
    #[serde(default)]
    pub node_states: Vec<NodeState>,
    #[serde(default)]
    pub edge_states: Vec<EdgeState>,
    #[serde(default)]
    pub action_states: Vec<ActionState>,
    pub driving: bool,
    pub paused: Option<bool>,
    pub new_base_request: Option<bool>,
    pub distance_since_last_node: Option<f32>,
    pub operating_mode: OperatingMode,
    pub battery_state: BatteryState,
    pub safety_state: SafetyState,
    #[serde(default)]
    pub errors: Vec<VdaError>,
    #[serde(default)]
    pub loads: Vec<Load>,
    pub agv_position: Option<AgvPosition>,
    pub velocity: Option<Velocity>,
}

impl StateBody {
    pub fn action_state(&self, action_id: &str) -> Option<&ActionState> {
        self.action_states.iter().find(|a| a.action_id == action_id)
    }

    pub fn edge_state(&self, sequence_id: u32) -> Option<&EdgeState> {
        self.edge_states.iter().find(|e| e.sequence_id == sequence_id)
    }
}
