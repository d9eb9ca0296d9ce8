//! Virtual AGV (C7, §4.7): the `Adapter` implementation backing the
//! simulated vehicle — tick-driven kinematics, a linear battery model,
//! and the declarative action state machine of §4.7.4.
//!
//! All mutable vehicle state lives behind a single `std::sync::Mutex`
//! rather than `tokio::sync::Mutex`: every `Adapter` method here runs to
//! completion without an `.await` inside the critical section, matching
//! §4.7.1's "no thread-level blocking occurs inside a tick".

pub mod action_sm;
pub mod actions;
pub mod battery;
pub mod execution_time;
pub mod kinematics;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::agv_controller::{Adapter, AgvControllerCallbacks, ActionScope, EdgeKinematics, PartialStatePatch};
use crate::config::VirtualAgvConfig;
use crate::protocol::vda5050_common::{error_reference_keys, error_types, AgvPosition, BatteryState, ErrorLevel, ErrorReference, VdaError, Velocity};
use crate::protocol::vda_2_0_0::{Action, ActionState, EdgeState, NodeState};

use self::action_sm::{ActionStateMachine, TickOutcome};
use self::actions::{behavior_for, is_executable, is_known_action_type, ActionContext, ActionEffect, WorldSnapshot};
use self::kinematics::{TraverseEdgeContext, TraversalStep};

struct RunningAction {
    scope: ActionScope,
    machine: ActionStateMachine,
}

struct State {
    position: AgvPosition,
    velocity: Velocity,
    battery_charge: f32,
    last_published_battery_charge: f32,
    charging: bool,
    driving: bool,
    has_load: bool,
    paused: bool,
    battery_low_error_raised: bool,
    traversal: Option<TraverseEdgeContext>,
    actions: HashMap<String, RunningAction>,
    callbacks: Option<Arc<dyn AgvControllerCallbacks>>,
}

fn initial_position(config: &VirtualAgvConfig) -> AgvPosition {
    match &config.initial_position {
        Some(p) => AgvPosition {
            x: p.x,
            y: p.y,
            theta: p.theta,
            map_id: p.map_id.clone(),
            map_description: None,
            position_initialized: true,
            localization_score: None,
            deviation_range: None,
        },
        None => AgvPosition {
            x: 0.0,
            y: 0.0,
            theta: 0.0,
            map_id: String::new(),
            map_description: None,
            position_initialized: false,
            localization_score: None,
            deviation_range: None,
        },
    }
}

/// The simulated vehicle, driven by a `tokio::time::interval` at
/// `tickRate` Hz (§4.7.1), scaled by `timeLapse`.
pub struct VirtualAgv {
    config: VirtualAgvConfig,
    state: Mutex<State>,
    tick_task: Mutex<Option<JoinHandle<()>>>,
}

impl VirtualAgv {
    pub fn new(config: VirtualAgvConfig) -> Self {
        let battery_charge = config.initial_battery_charge;
        let position = initial_position(&config);
        Self {
            state: Mutex::new(State {
                position,
                velocity: Velocity::default(),
                battery_charge,
                last_published_battery_charge: battery_charge,
                charging: false,
                driving: false,
                has_load: false,
                paused: false,
                battery_low_error_raised: false,
                traversal: None,
                actions: HashMap::new(),
                callbacks: None,
            }),
            config,
            tick_task: Mutex::new(None),
        }
    }

    /// The vehicle's starting position, for seeding the controller's
    /// `(lastNodeId, lastNodeSequenceId)` before any order arrives (§6).
    pub fn initial_agv_position(&self) -> AgvPosition {
        self.state.lock().expect("virtual agv state poisoned").position.clone()
    }

    /// Whether an order's route/actions currently occupy the vehicle —
    /// the adapter has no direct "order started" signal from the
    /// controller, so this is inferred from live node/edge work (§4.7.5:
    /// instant `startCharging` is forbidden while an order is active).
    fn order_active(state: &State) -> bool {
        state.driving || state.traversal.is_some() || state.actions.values().any(|r| r.scope != ActionScope::Instant)
    }

    fn context_for<'a>(state: &State, action: &'a Action, scope: ActionScope) -> ActionContext<'a> {
        ActionContext { action, scope, has_load: state.has_load, driving: state.driving, charging: state.charging, order_active: Self::order_active(state) }
    }

    fn emit_action_state(callbacks: &Option<Arc<dyn AgvControllerCallbacks>>, machine: &ActionStateMachine, outcome: &TickOutcome, patch: PartialStatePatch) {
        let Some(callbacks) = callbacks else { return };
        let action_state = ActionState {
            action_id: machine.action.action_id.clone(),
            action_type: Some(machine.action.action_type.clone()),
            action_description: machine.action.action_description.clone(),
            action_status: outcome.status,
            result_description: outcome.result_description.clone(),
        };
        callbacks.on_action_state_changed(action_state, Some(patch));
    }

    fn raise_battery_low(state: &mut State) {
        if state.battery_low_error_raised {
            return;
        }
        state.battery_low_error_raised = true;
        if let Some(callbacks) = &state.callbacks {
            callbacks.on_error_raised(VdaError {
                error_type: error_types::BATTERY_LOW_ERROR.into(),
                error_level: ErrorLevel::Fatal,
                error_description: Some(format!("battery charge {:.1}% below threshold", state.battery_charge)),
                error_references: vec![ErrorReference { reference_key: error_reference_keys::TOPIC.into(), reference_value: "state".into() }],
            });
        }
    }

    fn withdraw_battery_low(state: &mut State) {
        if !state.battery_low_error_raised {
            return;
        }
        state.battery_low_error_raised = false;
        if let Some(callbacks) = &state.callbacks {
            callbacks.on_error_cleared(error_types::BATTERY_LOW_ERROR);
        }
    }

    /// Applies a terminal transition's side effect to vehicle state,
    /// returning the partial State patch the controller should merge in.
    fn apply_effect(state: &mut State, effect: &ActionEffect) -> PartialStatePatch {
        let mut patch = PartialStatePatch::default();
        match effect {
            ActionEffect::None => {}
            ActionEffect::AddLoad(load) => {
                state.has_load = true;
                patch.loads = Some(vec![load.clone()]);
            }
            ActionEffect::RemoveLoad => {
                state.has_load = false;
                patch.loads = Some(Vec::new());
            }
            ActionEffect::OverridePosition { x, y, theta, map_id, .. } => {
                state.position = AgvPosition {
                    x: *x,
                    y: *y,
                    theta: *theta,
                    map_id: map_id.clone(),
                    map_description: None,
                    position_initialized: true,
                    localization_score: None,
                    deviation_range: None,
                };
                patch.agv_position = Some(state.position.clone());
            }
            ActionEffect::StartPause => {
                state.paused = true;
                patch.paused = Some(true);
            }
            ActionEffect::StopPause => {
                state.paused = false;
                patch.paused = Some(false);
            }
            ActionEffect::StartCharging => state.charging = true,
            ActionEffect::StopCharging => state.charging = false,
        }
        patch
    }

    /// One tick: advance every live action state machine, then edge
    /// kinematics, then battery charging (§4.7.1), scaled by `timeLapse`.
    /// `spawn_tick_loop` calls this on a timer; exposed directly so a test
    /// can drive the vehicle deterministically without waiting on real
    /// time.
    pub fn tick(&self, dt: f32) {
        let mut guard = self.state.lock().expect("virtual agv state poisoned");

        let ids: Vec<String> = guard.actions.keys().cloned().collect();
        for id in ids {
            let Some(mut running) = guard.actions.remove(&id) else { continue };
            // `ctx` must not alias `running.machine.action` while `tick`
            // borrows `running.machine` mutably, hence the clone.
            let action_snapshot = running.machine.action.clone();
            let ctx = Self::context_for(&guard, &action_snapshot, running.scope);
            let outcome = running.machine.tick(dt, &ctx);
            if let Some(outcome) = outcome {
                if outcome.terminal {
                    let patch = Self::apply_effect(&mut guard, &outcome.effect);
                    Self::emit_action_state(&guard.callbacks, &running.machine, &outcome, patch);
                    continue;
                }
                Self::emit_action_state(&guard.callbacks, &running.machine, &outcome, PartialStatePatch::default());
            }
            guard.actions.insert(id, running);
        }

        self.tick_traversal(&mut guard, dt);
        self.tick_battery(&mut guard, dt);
    }

    fn tick_traversal(&self, guard: &mut State, dt: f32) {
        if guard.paused || guard.charging {
            return;
        }
        let Some(mut traversal) = guard.traversal.take() else { return };

        match traversal.step(&mut guard.position, &mut guard.velocity, &mut guard.battery_charge, dt, &self.config) {
            TraversalStep::Driving => {
                if !guard.driving {
                    guard.driving = true;
                    if let Some(cb) = &guard.callbacks {
                        cb.on_driving_changed(true);
                    }
                }
                guard.traversal = Some(traversal);
            }
            TraversalStep::Arrived => {
                let edge_id = traversal.edge_id().to_string();
                guard.driving = false;
                if let Some(cb) = guard.callbacks.clone() {
                    cb.on_driving_changed(false);
                    cb.on_position_changed(guard.position.clone());
                    cb.on_velocity_changed(guard.velocity);
                    cb.on_edge_traversed(&edge_id);
                }
            }
            TraversalStep::BatteryLow => {
                guard.driving = false;
                if let Some(cb) = &guard.callbacks {
                    cb.on_driving_changed(false);
                }
                Self::raise_battery_low(guard);
            }
        }
    }

    fn tick_battery(&self, guard: &mut State, dt: f32) {
        if guard.charging {
            let rate = battery::charge_rate_per_second(self.config.full_battery_charge_time_hours);
            guard.battery_charge = battery::charge(guard.battery_charge, rate, dt);
            if guard.battery_charge >= 100.0 {
                guard.charging = false;
            }
            if guard.battery_charge >= self.config.low_battery_charge_threshold + 10.0 {
                Self::withdraw_battery_low(guard);
            }
        }

        if (guard.battery_charge - guard.last_published_battery_charge).abs() >= 1.0 {
            guard.last_published_battery_charge = guard.battery_charge;
            if let Some(cb) = &guard.callbacks {
                cb.on_battery_changed(BatteryState {
                    battery_charge: guard.battery_charge,
                    battery_voltage: None,
                    battery_health: None,
                    charging: guard.charging,
                    reach: Some(battery::reach(guard.battery_charge, self.config.battery_max_reach)),
                });
            }
        }
    }

    /// Spawns the `tokio::time::interval`-driven tick loop (§4.7.1); the
    /// binary calls this once per vehicle after `AgvController::start`.
    pub fn spawn_tick_loop(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let period = Duration::from_secs_f32(1.0 / this.config.tick_rate.max(0.1));
        let time_lapse = this.config.time_lapse;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                this.tick(period.as_secs_f32() * time_lapse);
            }
        });
        *self.tick_task.lock().expect("virtual agv state poisoned") = Some(handle);
    }

    pub fn stop_tick_loop(&self) {
        if let Some(handle) = self.tick_task.lock().expect("virtual agv state poisoned").take() {
            handle.abort();
        }
    }
}

impl Adapter for VirtualAgv {
    fn attach(&self, callbacks: Arc<dyn AgvControllerCallbacks>) {
        self.state.lock().expect("virtual agv state poisoned").callbacks = Some(callbacks);
    }

    fn detach(&self) {
        self.state.lock().expect("virtual agv state poisoned").callbacks = None;
    }

    fn is_route_traversable(&self, nodes: &[NodeState], edges: &[EdgeState]) -> bool {
        edges.iter().all(|edge| nodes.iter().any(|n| n.sequence_id == edge.sequence_id + 1 && n.node_position.is_some()))
    }

    fn is_node_within_deviation_range(&self, node: &NodeState) -> bool {
        let Some(target) = &node.node_position else { return true };
        let guard = self.state.lock().expect("virtual agv state poisoned");

        if guard.position.map_id != target.map_id {
            return false;
        }
        let dx = guard.position.x - target.x;
        let dy = guard.position.y - target.y;
        let xy_tolerance = target.allowed_deviation_xy.unwrap_or(self.config.agv_normal_deviation_xy_tolerance);
        if (dx * dx + dy * dy).sqrt() > xy_tolerance {
            return false;
        }
        if let Some(theta) = target.theta {
            let theta_tolerance = target.allowed_deviation_theta.unwrap_or(self.config.agv_normal_deviation_theta_tolerance);
            if (guard.position.theta - theta).abs() > theta_tolerance {
                return false;
            }
        }
        true
    }

    fn is_action_executable(&self, action: &Action, scope: ActionScope) -> bool {
        if !is_known_action_type(&action.action_type) {
            return false;
        }
        let guard = self.state.lock().expect("virtual agv state poisoned");
        let ctx = Self::context_for(&guard, action, scope);
        is_executable(action, scope, &ctx)
    }

    fn traverse_edge(&self, edge: EdgeState, end_node: NodeState, kinematics: EdgeKinematics) {
        self.state.lock().expect("virtual agv state poisoned").traversal =
            Some(TraverseEdgeContext::new(edge, end_node, kinematics));
    }

    fn stop_traverse(&self) {
        let mut guard = self.state.lock().expect("virtual agv state poisoned");
        guard.traversal = None;
        guard.driving = false;
    }

    fn execute_action(&self, action: Action, scope: ActionScope) {
        if action.action_type == "cancelOrder" {
            return;
        }
        let mut guard = self.state.lock().expect("virtual agv state poisoned");
        let world = WorldSnapshot { config: &self.config, position: Some((guard.position.x, guard.position.y)) };
        let Some(behavior) = behavior_for(&action, scope, &world) else { return };

        let action_id = action.action_id.clone();
        let action_snapshot = action.clone();
        let mut machine = ActionStateMachine::new(action, scope, behavior);
        let ctx = Self::context_for(&guard, &action_snapshot, scope);
        match machine.tick(0.0, &ctx) {
            Some(outcome) => {
                let patch = Self::apply_effect(&mut guard, &outcome.effect);
                let terminal = outcome.terminal;
                Self::emit_action_state(&guard.callbacks, &machine, &outcome, patch);
                if !terminal {
                    guard.actions.insert(action_id, RunningAction { scope, machine });
                }
            }
            None => {
                guard.actions.insert(action_id, RunningAction { scope, machine });
            }
        }
    }

    fn cancel_action(&self, action_id: &str) {
        if let Some(running) = self.state.lock().expect("virtual agv state poisoned").actions.get_mut(action_id) {
            running.machine.should_cancel = true;
        }
    }

    fn finish_edge_action(&self, action_id: &str) {
        if let Some(running) = self.state.lock().expect("virtual agv state poisoned").actions.get_mut(action_id) {
            running.machine.should_terminate = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::vda5050_common::NodePosition;

    fn node_state(id: &str, x: f32, y: f32) -> NodeState {
        NodeState {
            node_id: id.into(),
            sequence_id: 0,
            node_description: None,
            released: true,
            node_position: Some(NodePosition { x, y, theta: None, allowed_deviation_xy: None, allowed_deviation_theta: None, map_id: "local".into(), map_description: None }),
        }
    }

    #[test]
    fn fresh_vehicle_starts_at_configured_initial_position() {
        let config = VirtualAgvConfig {
            initial_position: Some(crate::config::InitialPosition { map_id: "local".into(), x: 1.0, y: 2.0, theta: 0.0 }),
            ..Default::default()
        };
        let agv = VirtualAgv::new(config);
        let pos = agv.initial_agv_position();
        assert!(pos.position_initialized);
        assert_eq!(pos.x, 1.0);
        assert_eq!(pos.y, 2.0);
    }

    #[test]
    fn node_within_default_xy_tolerance_is_in_range() {
        let config = VirtualAgvConfig {
            initial_position: Some(crate::config::InitialPosition { map_id: "local".into(), x: 0.0, y: 0.0, theta: 0.0 }),
            ..Default::default()
        };
        let agv = VirtualAgv::new(config);
        assert!(agv.is_node_within_deviation_range(&node_state("n1", 0.1, 0.1)));
        assert!(!agv.is_node_within_deviation_range(&node_state("n1", 5.0, 5.0)));
    }

    #[test]
    fn unknown_action_type_is_never_executable() {
        let config = VirtualAgvConfig::default();
        let agv = VirtualAgv::new(config);
        let action = Action { action_type: "doBarrelRoll".into(), action_id: "a1".into(), action_description: None, blocking_type: crate::protocol::vda_2_0_0::BlockingType::Hard, action_parameters: None };
        assert!(!agv.is_action_executable(&action, ActionScope::Node));
    }
}
