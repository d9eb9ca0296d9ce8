use serde::{Deserialize, Serialize};

use super::action::Action;
use crate::protocol::vda5050_common::{NodePosition, Trajectory};

/// A target pose plus the actions to run once reached (§3 Node).
#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub node_id: String,
    pub sequence_id: u32,
    pub node_description: Option<String>,
    pub released: bool,
    pub node_position: Option<NodePosition>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

/// A drivable connection between two nodes (§3 Edge).
#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub edge_id: String,
    pub sequence_id: u32,
    pub edge_description: Option<String>,
    pub released: bool,
    pub start_node_id: String,
    pub end_node_id: String,
    pub max_speed: Option<f32>,
    pub max_height: Option<f32>,
    pub min_height: Option<f32>,
    pub orientation: Option<f32>,
    pub orientation_type: Option<String>,
    pub direction: Option<String>,
    pub rotation_allowed: Option<bool>,
    pub max_rotation_speed: Option<f32>,
    pub length: Option<f32>,
    pub trajectory: Option<Trajectory>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

/// The headerless body of an `order` message (§3 Order). Identified by
/// `(orderId, orderUpdateId)`; `nodes`/`edges` are the order graph, with
/// released (base) segments preceding any unreleased (horizon) segment.
#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderBody {
    pub order_id: String,
    pub order_update_id: u32,
    pub zone_set_id: Option<String>,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl OrderBody {
    pub fn node(&self, node_id: &str, sequence_id: u32) -> Option<&Node> {
        self.nodes.iter().find(|n| n.node_id == node_id && n.sequence_id == sequence_id)
    }

    pub fn edge_after(&self, node_sequence_id: u32) -> Option<&Edge> {
        self.edges.iter().find(|e| e.sequence_id == node_sequence_id + 1)
    }

    /// Every released node/edge precedes any unreleased one (§3 Order
    /// invariant).
    pub fn base_precedes_horizon(&self) -> bool {
        let mut seen_unreleased = false;
        for n in &self.nodes {
            if n.released {
                if seen_unreleased {
                    return false;
                }
            } else {
                seen_unreleased = true;
            }
        }
        seen_unreleased = false;
        for e in &self.edges {
            if e.released {
                if seen_unreleased {
                    return false;
                }
            } else {
                seen_unreleased = true;
            }
        }
        true
    }
}
