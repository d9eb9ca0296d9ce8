use std::sync::{Arc, Mutex};

use vda5050::agv_controller::{Adapter, AgvControllerCallbacks, ActionScope, EdgeKinematics, PartialStatePatch};
use vda5050::config::{InitialPosition, VirtualAgvConfig};
use vda5050::protocol::vda5050_common::{error_types, AgvPosition, NodePosition, VdaError, Velocity};
use vda5050::protocol::vda_2_0_0::{
    Action, ActionParameter, ActionParameterValue, ActionState, BatteryState, BlockingType, EdgeState, NodeState,
};
use vda5050::virtual_agv::VirtualAgv;

#[derive(Default)]
struct Recorder {
    action_states: Mutex<Vec<ActionState>>,
    positions: Mutex<Vec<AgvPosition>>,
    edges_traversed: Mutex<Vec<String>>,
    errors: Mutex<Vec<VdaError>>,
    errors_cleared: Mutex<Vec<String>>,
}

impl AgvControllerCallbacks for Recorder {
    fn on_position_changed(&self, position: AgvPosition) {
        self.positions.lock().unwrap().push(position);
    }
    fn on_velocity_changed(&self, _velocity: Velocity) {}
    fn on_battery_changed(&self, _battery: BatteryState) {}
    fn on_error_raised(&self, error: VdaError) {
        self.errors.lock().unwrap().push(error);
    }
    fn on_error_cleared(&self, error_type: &str) {
        self.errors_cleared.lock().unwrap().push(error_type.to_string());
    }
    fn on_driving_changed(&self, _driving: bool) {}
    fn on_edge_traversed(&self, edge_id: &str) {
        self.edges_traversed.lock().unwrap().push(edge_id.to_string());
    }
    fn on_action_state_changed(&self, action_state: ActionState, _linked_state: Option<PartialStatePatch>) {
        self.action_states.lock().unwrap().push(action_state);
    }
}

fn pick_action(id: &str) -> Action {
    Action {
        action_type: "pick".into(),
        action_id: id.into(),
        action_description: None,
        blocking_type: BlockingType::Hard,
        action_parameters: Some(vec![
            ActionParameter { key: "stationType".into(), value: ActionParameterValue::Str("floor1".into()) },
            ActionParameter { key: "loadType".into(), value: ActionParameterValue::Str("EPAL".into()) },
            ActionParameter { key: "duration".into(), value: ActionParameterValue::Float(0.2) },
        ]),
    }
}

fn attach(config: VirtualAgvConfig) -> (Arc<VirtualAgv>, Arc<Recorder>) {
    let agv = Arc::new(VirtualAgv::new(config));
    let recorder = Arc::new(Recorder::default());
    agv.attach(recorder.clone() as Arc<dyn AgvControllerCallbacks>);
    (agv, recorder)
}

#[test]
fn pick_action_runs_to_completion_and_adds_a_load() {
    let (agv, recorder) = attach(VirtualAgvConfig::default());

    agv.execute_action(pick_action("a1"), ActionScope::Node);
    // First tick (ON_INIT) already happened inside execute_action, landing
    // in Running; tick through the 0.2s duration.
    for _ in 0..5 {
        agv.tick(0.1);
    }

    let states = recorder.action_states.lock().unwrap();
    let finished = states.iter().find(|s| s.action_id == "a1" && s.action_status.is_terminal());
    assert!(finished.is_some(), "pick action should have reached a terminal status");
    assert_eq!(finished.unwrap().result_description.as_deref(), Some("load picked up"));
}

#[test]
fn canceling_a_running_pick_fails_it_instead_of_finishing() {
    let (agv, recorder) = attach(VirtualAgvConfig::default());

    agv.execute_action(pick_action("a1"), ActionScope::Node);
    agv.tick(0.01); // still Running, well short of the 0.2s duration
    agv.cancel_action("a1");
    agv.tick(0.01);

    let states = recorder.action_states.lock().unwrap();
    let last = states.iter().rev().find(|s| s.action_id == "a1").expect("expected at least one action state");
    assert_eq!(last.action_status, vda5050::protocol::vda_2_0_0::ActionStatus::Failed);
}

#[test]
fn unexecutable_action_never_reaches_is_action_executable_true() {
    let agv = VirtualAgv::new(VirtualAgvConfig::default());
    let bad = Action {
        action_type: "pick".into(),
        action_id: "a1".into(),
        action_description: None,
        blocking_type: BlockingType::Hard,
        action_parameters: Some(vec![ActionParameter { key: "stationType".into(), value: ActionParameterValue::Str("dock".into()) }]),
    };
    assert!(!agv.is_action_executable(&bad, ActionScope::Node));
}

fn node_state(id: &str, seq: u32, x: f32, y: f32) -> NodeState {
    NodeState {
        node_id: id.into(),
        sequence_id: seq,
        node_description: None,
        released: true,
        node_position: Some(NodePosition { x, y, theta: Some(0.0), allowed_deviation_xy: None, allowed_deviation_theta: None, map_id: "local".into(), map_description: None }),
    }
}

fn edge_state(id: &str, seq: u32) -> EdgeState {
    EdgeState { edge_id: id.into(), sequence_id: seq, edge_description: None, released: true, trajectory: None }
}

#[test]
fn edge_traversal_arrives_and_fires_edge_traversed() {
    let config = VirtualAgvConfig {
        initial_position: Some(InitialPosition { map_id: "local".into(), x: 0.0, y: 0.0, theta: 0.0 }),
        vehicle_speed: 5.0,
        ..Default::default()
    };
    let (agv, recorder) = attach(config);

    agv.traverse_edge(edge_state("e1", 0), node_state("n2", 1, 10.0, 0.0), EdgeKinematics::default());
    for _ in 0..20 {
        agv.tick(0.5);
        if !recorder.edges_traversed.lock().unwrap().is_empty() {
            break;
        }
    }

    assert_eq!(recorder.edges_traversed.lock().unwrap().as_slice(), ["e1"]);
    let last_position = recorder.positions.lock().unwrap().last().cloned().expect("position should have been published");
    assert!((last_position.x - 10.0).abs() < 1e-3);
}

#[test]
fn traversal_raises_battery_low_error_before_starting_when_charge_is_already_below_threshold() {
    let config = VirtualAgvConfig {
        initial_position: Some(InitialPosition { map_id: "local".into(), x: 0.0, y: 0.0, theta: 0.0 }),
        initial_battery_charge: 0.5,
        low_battery_charge_threshold: 1.0,
        ..Default::default()
    };
    let (agv, recorder) = attach(config);

    agv.traverse_edge(edge_state("e1", 0), node_state("n2", 1, 1000.0, 0.0), EdgeKinematics::default());
    agv.tick(1.0);

    let errors = recorder.errors.lock().unwrap();
    assert!(errors.iter().any(|e| e.error_type == error_types::BATTERY_LOW_ERROR));
}

#[test]
fn edge_orientation_is_honored_on_arrival_even_without_end_node_theta() {
    let config = VirtualAgvConfig {
        initial_position: Some(InitialPosition { map_id: "local".into(), x: 0.0, y: 0.0, theta: 0.0 }),
        vehicle_speed: 5.0,
        ..Default::default()
    };
    let (agv, recorder) = attach(config);

    let mut end_node = node_state("n2", 1, 10.0, 0.0);
    end_node.node_position.as_mut().unwrap().theta = None;
    let kinematics = EdgeKinematics { max_speed: None, orientation: Some(0.7) };
    agv.traverse_edge(edge_state("e1", 0), end_node, kinematics);
    for _ in 0..20 {
        agv.tick(0.5);
        if !recorder.edges_traversed.lock().unwrap().is_empty() {
            break;
        }
    }

    let last_position = recorder.positions.lock().unwrap().last().cloned().expect("position should have been published");
    assert!((last_position.theta - 0.7).abs() < 1e-3, "edge orientation should be applied even without an end-node theta");
}
