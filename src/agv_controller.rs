//! AGV Controller (C6, §4.6): order-execution scaffolding atop
//! `AgvClient`. Consumes `Order`/`InstantActions`, maintains the current
//! order graph's `nodeStates`/`edgeStates`/`actionStates`, enforces the
//! new/update/stitching acceptance rules, and delegates vehicle-specific
//! work to a plug-in [`Adapter`] — by design a thin contract layer (§4.6:
//! "Contract only — treated thinly"); the heavy lifting lives in whatever
//! `Adapter` is plugged in (the virtual AGV, in this crate).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::agv_client::AgvClient;
use crate::agv_id::AgvId;
use crate::errors::ClientError;
use crate::protocol::vda5050_common::{
    error_reference_keys, error_types, AgvPosition, ErrorLevel, ErrorReference, Load, VdaError, Velocity,
};
use crate::protocol::vda_2_0_0::{
    Action, ActionState, ActionStatus, BatteryState, EStop, EdgeState, InstantActionsBody, NodeState, OperatingMode,
    OrderBody, SafetyState, StateBody,
};

/// A State fragment a running action's transition may contribute to the
/// next publication (§4.7.4 "linked state").
#[derive(Clone, Debug, Default)]
pub struct PartialStatePatch {
    pub agv_position: Option<AgvPosition>,
    pub loads: Option<Vec<Load>>,
    pub operating_mode: Option<OperatingMode>,
    pub paused: Option<bool>,
}

/// Where an action was attached (§3 Action: "scope is implicit from
/// location"). The adapter's action state machine needs this to pick the
/// right `ON_INIT` transition (§4.7.4: "Finished only for instant scope").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionScope {
    Node,
    Edge,
    Instant,
}

/// Callbacks an [`Adapter`] uses to push observed vehicle state back into
/// the controller (§4.6: "callbacks to push position/velocity/battery/
/// errors back to the controller").
pub trait AgvControllerCallbacks: Send + Sync {
    fn on_position_changed(&self, position: AgvPosition);
    fn on_velocity_changed(&self, velocity: Velocity);
    fn on_battery_changed(&self, battery: BatteryState);
    fn on_error_raised(&self, error: VdaError);
    fn on_error_cleared(&self, error_type: &str);
    fn on_driving_changed(&self, driving: bool);
    fn on_edge_traversed(&self, edge_id: &str);
    fn on_action_state_changed(&self, action_state: ActionState, linked_state: Option<PartialStatePatch>);
}

/// Vehicle-specific behaviour the controller drives an order through
/// (§4.6). Node/edge arguments are the controller's own `NodeState`/
/// `EdgeState` records (the remaining-route view it already maintains)
/// rather than the raw order `Node`/`Edge`, so the adapter sees exactly
/// what the controller is tracking.
pub trait Adapter: Send + Sync {
    fn attach(&self, callbacks: Arc<dyn AgvControllerCallbacks>);
    fn detach(&self);

    fn is_route_traversable(&self, nodes: &[NodeState], edges: &[EdgeState]) -> bool;
    fn is_node_within_deviation_range(&self, node: &NodeState) -> bool;
    fn is_action_executable(&self, action: &Action, scope: ActionScope) -> bool;

    fn traverse_edge(&self, edge: EdgeState, end_node: NodeState, kinematics: EdgeKinematics);
    fn stop_traverse(&self);

    fn execute_action(&self, action: Action, scope: ActionScope);
    fn cancel_action(&self, action_id: &str);
    fn finish_edge_action(&self, action_id: &str);
}

enum OrderKind {
    New,
    Update,
    Stitching,
}

fn node_to_state(n: &crate::protocol::vda_2_0_0::Node) -> NodeState {
    NodeState {
        node_id: n.node_id.clone(),
        sequence_id: n.sequence_id,
        node_description: n.node_description.clone(),
        released: n.released,
        node_position: n.node_position.clone(),
    }
}

fn edge_to_state(e: &crate::protocol::vda_2_0_0::Edge) -> EdgeState {
    EdgeState {
        edge_id: e.edge_id.clone(),
        sequence_id: e.sequence_id,
        edge_description: e.edge_description.clone(),
        released: e.released,
        trajectory: e.trajectory.clone(),
    }
}

/// The raw `Edge` fields `EdgeState` drops (it mirrors the wire `State`
/// schema, which carries no `maxSpeed`/`orientation`) but the adapter's
/// kinematics still needs (§4.7.2: "clamped to `edge.maxSpeed` if
/// specified"; "θ = `edge.orientation` if provided"). Looked up by
/// `edge_id` alongside the `EdgeState` at traversal time so the wire
/// projection stays schema-accurate.
#[derive(Clone, Copy, Debug, Default)]
pub struct EdgeKinematics {
    pub max_speed: Option<f32>,
    pub orientation: Option<f32>,
}

fn edge_kinematics(e: &crate::protocol::vda_2_0_0::Edge) -> EdgeKinematics {
    EdgeKinematics { max_speed: e.max_speed, orientation: e.orientation }
}

fn classify_order(state: &ControllerState, order: &OrderBody) -> Result<OrderKind, &'static str> {
    let terminated = state.node_states.is_empty() && state.edge_states.is_empty();

    if terminated {
        if order.order_id != state.order_id {
            return Ok(OrderKind::New);
        }
        if order.order_update_id > state.order_update_id {
            match order.nodes.first() {
                Some(first) if first.node_id == state.last_node_id && first.sequence_id == state.last_node_sequence_id => {
                    Ok(OrderKind::Update)
                }
                _ => Err("update order's first node does not match the AGV's current position"),
            }
        } else {
            Err("orderUpdateId does not exceed the terminated order's orderUpdateId")
        }
    } else {
        let is_fresh_or_newer =
            order.order_id != state.order_id || order.order_update_id > state.order_update_id;
        let extends_current_base_end = state
            .node_states
            .last()
            .zip(order.nodes.first())
            .is_some_and(|(current_end, new_first)| current_end.node_id == new_first.node_id);

        if is_fresh_or_newer && extends_current_base_end {
            Ok(OrderKind::Stitching)
        } else {
            Err("order received while the previous order is still active and is not a valid stitching extension")
        }
    }
}

fn register_actions(state: &mut ControllerState, actions: &[Action], scope: ActionScope) {
    for action in actions {
        state.actions.insert(action.action_id.clone(), action.clone());
        state.action_scopes.insert(action.action_id.clone(), scope);
        state.action_states.entry(action.action_id.clone()).or_insert_with(|| ActionState {
            action_id: action.action_id.clone(),
            action_type: Some(action.action_type.clone()),
            action_description: action.action_description.clone(),
            action_status: ActionStatus::Waiting,
            result_description: None,
        });
    }
}

fn apply_order(state: &mut ControllerState, order: &OrderBody, kind: OrderKind) {
    state.order_id = order.order_id.clone();
    state.order_update_id = order.order_update_id;
    state.zone_set_id = order.zone_set_id.clone();

    match kind {
        OrderKind::New | OrderKind::Update => {
            state.node_states = order.nodes.iter().map(node_to_state).collect();
            state.edge_states = order.edges.iter().map(edge_to_state).collect();
        }
        OrderKind::Stitching => {
            if state.node_states.last().map(|n| n.node_id.as_str()) == order.nodes.first().map(|n| n.node_id.as_str()) {
                state.node_states.pop();
            }
            state.node_states.extend(order.nodes.iter().map(node_to_state));
            state.edge_states.extend(order.edges.iter().map(edge_to_state));
        }
    }

    for edge in &order.edges {
        state.edge_kinematics.insert(edge.edge_id.clone(), edge_kinematics(edge));
    }

    for node in &order.nodes {
        register_actions(state, &node.actions, ActionScope::Node);
    }
    for edge in &order.edges {
        register_actions(state, &edge.actions, ActionScope::Edge);
    }
}

struct ControllerState {
    order_id: String,
    order_update_id: u32,
    zone_set_id: Option<String>,
    last_node_id: String,
    last_node_sequence_id: u32,
    node_states: Vec<NodeState>,
    edge_states: Vec<EdgeState>,
    edge_kinematics: HashMap<String, EdgeKinematics>,
    actions: HashMap<String, Action>,
    action_scopes: HashMap<String, ActionScope>,
    action_states: HashMap<String, ActionState>,
    driving: bool,
    traversal_started: bool,
    paused: bool,
    new_base_request: bool,
    distance_since_last_node: Option<f32>,
    operating_mode: OperatingMode,
    battery_state: BatteryState,
    safety_state: SafetyState,
    errors: Vec<VdaError>,
    loads: Vec<Load>,
    agv_position: Option<AgvPosition>,
    velocity: Option<Velocity>,
}

impl Default for ControllerState {
    fn default() -> Self {
        Self {
            order_id: String::new(),
            order_update_id: 0,
            zone_set_id: None,
            last_node_id: String::new(),
            last_node_sequence_id: 0,
            node_states: Vec::new(),
            edge_states: Vec::new(),
            edge_kinematics: HashMap::new(),
            actions: HashMap::new(),
            action_scopes: HashMap::new(),
            action_states: HashMap::new(),
            driving: false,
            traversal_started: false,
            paused: false,
            new_base_request: false,
            distance_since_last_node: None,
            operating_mode: OperatingMode::Automatic,
            battery_state: BatteryState { battery_charge: 100.0, battery_voltage: None, battery_health: None, charging: false, reach: None },
            safety_state: SafetyState { e_stop: EStop::None, field_violation: false },
            errors: Vec::new(),
            loads: Vec::new(),
            agv_position: None,
            velocity: None,
        }
    }
}

impl ControllerState {
    fn to_state_body(&self) -> StateBody {
        StateBody {
            order_id: self.order_id.clone(),
            order_update_id: self.order_update_id,
            zone_set_id: self.zone_set_id.clone(),
            last_node_id: self.last_node_id.clone(),
            last_node_sequence_id: self.last_node_sequence_id,
            node_states: self.node_states.clone(),
            edge_states: self.edge_states.clone(),
            action_states: self.action_states.values().cloned().collect(),
            driving: self.driving,
            paused: Some(self.paused),
            new_base_request: Some(self.new_base_request),
            distance_since_last_node: self.distance_since_last_node,
            operating_mode: self.operating_mode,
            battery_state: self.battery_state.clone(),
            safety_state: self.safety_state,
            errors: self.errors.clone(),
            loads: self.loads.clone(),
            agv_position: self.agv_position.clone(),
            velocity: self.velocity,
        }
    }
}

struct Inner {
    client: AgvClient,
    adapter: Arc<dyn Adapter>,
}

/// Cheaply `Clone`-able handle; clones share the same order state and are
/// what gets handed to the adapter as its callback sink.
#[derive(Clone)]
pub struct AgvController {
    inner: Arc<Inner>,
    state: Arc<Mutex<ControllerState>>,
}

impl AgvController {
    pub fn new(client: AgvClient, adapter: Arc<dyn Adapter>) -> Self {
        Self { inner: Arc::new(Inner { client, adapter }), state: Arc::new(Mutex::new(ControllerState::default())) }
    }

    pub fn client(&self) -> &AgvClient {
        &self.inner.client
    }

    /// Seeds the controller's `(lastNodeId, lastNodeSequenceId)` before
    /// any order is assigned — e.g. from the virtual AGV's configured
    /// `initialPosition` (§6).
    pub async fn set_initial_position(&self, last_node_id: impl Into<String>, last_node_sequence_id: u32, position: Option<AgvPosition>) {
        let mut state = self.state.lock().await;
        state.last_node_id = last_node_id.into();
        state.last_node_sequence_id = last_node_sequence_id;
        state.agv_position = position;
    }

    pub async fn start(&self) -> Result<(), ClientError> {
        self.inner.client.start().await?;

        let this = self.clone();
        self.inner
            .client
            .subscribe_order(move |_, agv_id, value| {
                let this = this.clone();
                let agv_id = agv_id.clone();
                match serde_json::from_value::<OrderBody>(value.clone()) {
                    Ok(order) => {
                        tokio::spawn(async move { this.handle_order(agv_id, order).await });
                    }
                    Err(e) => tracing::warn!(error = %e, "order payload did not match the expected schema"),
                }
                Ok(())
            })
            .await?;

        let this = self.clone();
        self.inner
            .client
            .subscribe_instant_actions(move |_, agv_id, value| {
                let this = this.clone();
                let agv_id = agv_id.clone();
                match serde_json::from_value::<InstantActionsBody>(value.clone()) {
                    Ok(instant_actions) => {
                        tokio::spawn(async move { this.handle_instant_actions(agv_id, instant_actions).await });
                    }
                    Err(e) => tracing::warn!(error = %e, "instantActions payload did not match the expected schema"),
                }
                Ok(())
            })
            .await?;

        self.inner.adapter.attach(Arc::new(self.clone()) as Arc<dyn AgvControllerCallbacks>);

        // Initial State must follow subscription installation (§4.6).
        self.publish_state().await?;
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), ClientError> {
        self.inner.adapter.detach();
        self.inner.client.stop().await
    }

    async fn handle_order(&self, _agv_id: AgvId, order: OrderBody) {
        let mut guard = self.state.lock().await;
        match classify_order(&guard, &order) {
            Ok(kind) => {
                apply_order(&mut guard, &order, kind);
                guard.traversal_started = false;
                drop(guard);
                self.drive_pending_work().await;
            }
            Err(reason) => {
                guard.errors.push(VdaError {
                    error_type: error_types::ORDER_ERROR.into(),
                    error_level: ErrorLevel::Warning,
                    error_description: Some(reason.to_string()),
                    error_references: vec![
                        ErrorReference { reference_key: error_reference_keys::TOPIC.into(), reference_value: "order".into() },
                        ErrorReference { reference_key: error_reference_keys::ORDER_ID.into(), reference_value: order.order_id.clone() },
                        ErrorReference {
                            reference_key: error_reference_keys::ORDER_UPDATE_ID.into(),
                            reference_value: order.order_update_id.to_string(),
                        },
                    ],
                });
                drop(guard);
            }
        }
        let _ = self.publish_state().await;
    }

    async fn handle_instant_actions(&self, _agv_id: AgvId, instant_actions: InstantActionsBody) {
        let mut executable = Vec::new();
        {
            let mut guard = self.state.lock().await;
            for action in instant_actions.actions {
                if action.action_type == "cancelOrder" {
                    guard.node_states.clear();
                    guard.edge_states.clear();
                    guard.edge_kinematics.clear();
                    guard.driving = false;
                }
                register_actions(&mut guard, std::slice::from_ref(&action), ActionScope::Instant);
                if self.inner.adapter.is_action_executable(&action, ActionScope::Instant) {
                    executable.push(action);
                } else {
                    guard.errors.push(VdaError {
                        error_type: error_types::VALIDATION_ERROR.into(),
                        error_level: ErrorLevel::Warning,
                        error_description: Some(format!("instant action {} is not executable", action.action_id)),
                        error_references: vec![
                            ErrorReference { reference_key: error_reference_keys::TOPIC.into(), reference_value: "instantActions".into() },
                            ErrorReference { reference_key: error_reference_keys::ACTION_ID.into(), reference_value: action.action_id.clone() },
                        ],
                    });
                }
            }
        }
        for action in executable {
            self.inner.adapter.execute_action(action, ActionScope::Instant);
        }
        let _ = self.publish_state().await;
    }

    /// Starts the next pending edge traversal and the current node's
    /// not-yet-started actions, unless traversal was already kicked off
    /// for this order assignment.
    async fn drive_pending_work(&self) {
        let mut guard = self.state.lock().await;
        if guard.traversal_started {
            return;
        }

        if !guard.node_states.is_empty() || !guard.edge_states.is_empty() {
            if !self.inner.adapter.is_route_traversable(&guard.node_states, &guard.edge_states) {
                guard.errors.push(VdaError {
                    error_type: error_types::ORDER_ERROR.into(),
                    error_level: ErrorLevel::Fatal,
                    error_description: Some("route is not traversable".into()),
                    error_references: vec![
                        ErrorReference { reference_key: error_reference_keys::TOPIC.into(), reference_value: "order".into() },
                        ErrorReference { reference_key: error_reference_keys::ORDER_ID.into(), reference_value: guard.order_id.clone() },
                    ],
                });
                return;
            }
        }

        let pending_actions: Vec<(Action, ActionScope)> = guard
            .action_states
            .values()
            .filter(|a| a.action_status == ActionStatus::Waiting)
            .filter_map(|a| {
                let action = guard.actions.get(&a.action_id).cloned()?;
                let scope = *guard.action_scopes.get(&a.action_id)?;
                Some((action, scope))
            })
            .filter(|(a, scope)| self.inner.adapter.is_action_executable(a, *scope))
            .collect();

        let next_edge = guard.edge_states.first().cloned();
        let next_end_node = next_edge.as_ref().and_then(|e| {
            guard.node_states.iter().find(|n| n.sequence_id == e.sequence_id + 1).cloned()
        });
        let next_kinematics =
            next_edge.as_ref().map(|e| guard.edge_kinematics.get(&e.edge_id).copied().unwrap_or_default());

        if next_edge.is_some() {
            guard.traversal_started = true;
        }
        drop(guard);

        for (action, scope) in pending_actions {
            self.inner.adapter.execute_action(action, scope);
        }
        if let (Some(edge), Some(end_node), Some(kinematics)) = (next_edge, next_end_node, next_kinematics) {
            self.inner.adapter.traverse_edge(edge, end_node, kinematics);
        }
    }

    async fn publish_state(&self) -> Result<(), ClientError> {
        let body = self.state.lock().await.to_state_body();
        self.inner.client.publish_state(body).await?;
        Ok(())
    }
}

impl AgvControllerCallbacks for AgvController {
    fn on_position_changed(&self, position: AgvPosition) {
        let this = self.clone();
        tokio::spawn(async move {
            this.state.lock().await.agv_position = Some(position);
            let _ = this.publish_state().await;
        });
    }

    fn on_velocity_changed(&self, velocity: Velocity) {
        let this = self.clone();
        tokio::spawn(async move {
            this.state.lock().await.velocity = Some(velocity);
            let _ = this.publish_state().await;
        });
    }

    fn on_battery_changed(&self, battery: BatteryState) {
        let this = self.clone();
        tokio::spawn(async move {
            this.state.lock().await.battery_state = battery;
            let _ = this.publish_state().await;
        });
    }

    fn on_error_raised(&self, error: VdaError) {
        let this = self.clone();
        tokio::spawn(async move {
            this.state.lock().await.errors.push(error);
            let _ = this.publish_state().await;
        });
    }

    fn on_error_cleared(&self, error_type: &str) {
        let this = self.clone();
        let error_type = error_type.to_string();
        tokio::spawn(async move {
            this.state.lock().await.errors.retain(|e| e.error_type != error_type);
            let _ = this.publish_state().await;
        });
    }

    fn on_driving_changed(&self, driving: bool) {
        let this = self.clone();
        tokio::spawn(async move {
            this.state.lock().await.driving = driving;
            let _ = this.publish_state().await;
        });
    }

    fn on_edge_traversed(&self, edge_id: &str) {
        let this = self.clone();
        let edge_id = edge_id.to_string();
        tokio::spawn(async move {
            {
                let mut guard = this.state.lock().await;
                if let Some(edge) = guard.edge_states.first() {
                    if edge.edge_id == edge_id {
                        let sequence_id = edge.sequence_id;
                        guard.edge_states.remove(0);
                        guard.edge_kinematics.remove(&edge_id);
                        if let Some(pos) = guard.node_states.iter().position(|n| n.sequence_id == sequence_id + 1) {
                            let node = guard.node_states.remove(pos);
                            guard.last_node_id = node.node_id;
                            guard.last_node_sequence_id = node.sequence_id;
                        }
                        guard.driving = false;
                        guard.traversal_started = false;
                    }
                }
            }
            this.drive_pending_work().await;
            let _ = this.publish_state().await;
        });
    }

    fn on_action_state_changed(&self, action_state: ActionState, linked_state: Option<PartialStatePatch>) {
        let this = self.clone();
        tokio::spawn(async move {
            {
                let mut guard = this.state.lock().await;
                guard.action_states.insert(action_state.action_id.clone(), action_state);
                if let Some(patch) = linked_state {
                    if let Some(position) = patch.agv_position {
                        guard.agv_position = Some(position);
                    }
                    if let Some(loads) = patch.loads {
                        guard.loads = loads;
                    }
                    if let Some(mode) = patch.operating_mode {
                        guard.operating_mode = mode;
                    }
                    if let Some(paused) = patch.paused {
                        guard.paused = paused;
                    }
                }
            }
            this.drive_pending_work().await;
            let _ = this.publish_state().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::vda_2_0_0::{Edge, Node};

    fn order(id: &str, update: u32, nodes: Vec<Node>, edges: Vec<Edge>) -> OrderBody {
        OrderBody { order_id: id.into(), order_update_id: update, zone_set_id: None, nodes, edges }
    }

    fn node(id: &str, seq: u32, released: bool) -> Node {
        Node { node_id: id.into(), sequence_id: seq, node_description: None, released, node_position: None, actions: Vec::new() }
    }

    fn edge(id: &str, seq: u32, start: &str, end: &str, released: bool) -> Edge {
        Edge {
            edge_id: id.into(),
            sequence_id: seq,
            edge_description: None,
            released,
            start_node_id: start.into(),
            end_node_id: end.into(),
            max_speed: None,
            max_height: None,
            min_height: None,
            orientation: None,
            orientation_type: None,
            direction: None,
            rotation_allowed: None,
            max_rotation_speed: None,
            length: None,
            trajectory: None,
            actions: Vec::new(),
        }
    }

    #[test]
    fn fresh_order_is_new_when_no_prior_order_active() {
        let state = ControllerState::default();
        let o = order("o1", 0, vec![node("n1", 0, true)], vec![]);
        assert!(matches!(classify_order(&state, &o), Ok(OrderKind::New)));
    }

    #[test]
    fn update_requires_first_node_to_match_current_position() {
        let mut state = ControllerState::default();
        state.last_node_id = "n1".into();
        state.last_node_sequence_id = 0;
        state.order_id = "o1".into();
        let good = order("o1", 1, vec![node("n1", 0, true)], vec![]);
        assert!(matches!(classify_order(&state, &good), Ok(OrderKind::Update)));
        let bad = order("o1", 1, vec![node("n9", 0, true)], vec![]);
        assert!(classify_order(&state, &bad).is_err());
    }

    #[test]
    fn stitching_requires_extension_of_current_base_end() {
        let mut state = ControllerState::default();
        state.order_id = "o1".into();
        state.node_states = vec![node_to_state(&node("n2", 2, true))];
        let stitch = order("o1", 1, vec![node("n2", 2, true), node("n3", 4, true)], vec![edge("e23", 3, "n2", "n3", true)]);
        assert!(matches!(classify_order(&state, &stitch), Ok(OrderKind::Stitching)));
        let rejected = order("o1", 1, vec![node("n9", 2, true)], vec![]);
        assert!(classify_order(&state, &rejected).is_err());
    }

    #[test]
    fn applying_stitching_order_appends_without_duplicating_shared_end_node() {
        let mut state = ControllerState::default();
        state.order_id = "o1".into();
        state.node_states = vec![node_to_state(&node("n2", 2, true))];
        let stitch = order("o1", 1, vec![node("n2", 2, true), node("n3", 4, true)], vec![edge("e23", 3, "n2", "n3", true)]);
        apply_order(&mut state, &stitch, OrderKind::Stitching);
        assert_eq!(state.node_states.len(), 2);
        assert_eq!(state.node_states[0].node_id, "n2");
        assert_eq!(state.node_states[1].node_id, "n3");
        assert_eq!(state.edge_states.len(), 1);
    }
}
