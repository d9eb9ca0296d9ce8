//! Edge traversal kinematics (§4.7.2). Straight-line by default; when the
//! edge carries a `trajectory`, traversal follows it via
//! `crate::utils::iterate_position_with_trajectory` instead — an optional
//! supplement gated so it never changes straight-line-edge behavior (see
//! SPEC_FULL.md §10). The `EdgeState`/`NodeState` the controller hands
//! down mirror the wire `State` schema and carry no `maxSpeed`/
//! `orientation`, so those two §4.7.2 inputs arrive separately as
//! `EdgeKinematics`, looked up by the controller from the order's raw
//! `Edge` at traversal start.

use crate::agv_controller::EdgeKinematics;
use crate::config::{SpeedSelection, VirtualAgvConfig};
use crate::protocol::vda5050_common::{AgvPosition, NodePosition, Trajectory, Velocity};
use crate::protocol::vda_2_0_0::{EdgeState, NodeState};
use crate::utils::get_distance;

pub enum TraversalStep {
    BatteryLow,
    Driving,
    Arrived,
}

/// Target speed for a fresh traversal: constant, sampled from a speed
/// distribution, or derived from a time distribution and the distance to
/// cover (these three are mutually exclusive, §4.7.2/§6).
pub fn pick_target_speed(config: &VirtualAgvConfig, distance: f32) -> f32 {
    match config.speed_selection() {
        SpeedSelection::Constant(v) => v,
        SpeedSelection::Speed(d) => d.sample(),
        SpeedSelection::Time(t) => {
            let secs = if t.max_secs > t.min_secs {
                t.min_secs + rand::random::<f32>() * (t.max_secs - t.min_secs)
            } else {
                t.min_secs
            };
            if secs > 0.0 {
                distance / secs
            } else {
                0.0
            }
        }
    }
}

/// Pending traversal of one released edge towards its end node.
pub struct TraverseEdgeContext {
    edge: EdgeState,
    end_node: NodeState,
    kinematics: EdgeKinematics,
    started: bool,
    target_speed: f32,
}

impl TraverseEdgeContext {
    pub fn new(edge: EdgeState, end_node: NodeState, kinematics: EdgeKinematics) -> Self {
        Self { edge, end_node, kinematics, started: false, target_speed: 0.0 }
    }

    pub fn edge_id(&self) -> &str {
        &self.edge.edge_id
    }

    /// One kinematic step. Mutates `position`/`velocity`/`battery_charge`
    /// in place; `config` supplies the speed selection and the
    /// low-battery threshold.
    pub fn step(
        &mut self,
        position: &mut AgvPosition,
        velocity: &mut Velocity,
        battery_charge: &mut f32,
        dt: f32,
        config: &VirtualAgvConfig,
    ) -> TraversalStep {
        let Some(end) = self.end_node.node_position.clone() else {
            *velocity = Velocity::default();
            return TraversalStep::Arrived;
        };

        if !self.started {
            if *battery_charge < config.low_battery_charge_threshold {
                return TraversalStep::BatteryLow;
            }
            let dist = get_distance(position.x, position.y, end.x, end.y);
            self.target_speed = pick_target_speed(config, dist);
            // §4.7.2: clamped to edge.maxSpeed only when no distribution is in play.
            if matches!(config.speed_selection(), SpeedSelection::Constant(_)) {
                if let Some(max_speed) = self.kinematics.max_speed {
                    self.target_speed = self.target_speed.min(max_speed);
                }
            }
            let alpha = f32::atan2(end.y - position.y, end.x - position.x);
            velocity.vx = Some(self.target_speed * alpha.cos());
            velocity.vy = Some(self.target_speed * alpha.sin());
            self.started = true;
        }

        if let Some(trajectory) = self.edge.trajectory.clone() {
            return self.step_trajectory(&end, position, velocity, battery_charge, dt, config, trajectory);
        }

        let vx = velocity.vx.unwrap_or(0.0);
        let vy = velocity.vy.unwrap_or(0.0);
        let dx = vx * dt;
        let dy = vy * dt;
        let tx = end.x - position.x;
        let ty = end.y - position.y;

        if tx.abs() <= dx.abs() && ty.abs() <= dy.abs() {
            let traveled = get_distance(position.x, position.y, end.x, end.y);
            position.x = end.x;
            position.y = end.y;
            // §4.7.2: θ = edge.orientation if provided, else end-node θ if provided, else retain.
            position.theta = self.kinematics.orientation.or(end.theta).unwrap_or(position.theta);
            *velocity = Velocity::default();
            *battery_charge = crate::virtual_agv::battery::discharge(*battery_charge, traveled, config.battery_max_reach);
            return TraversalStep::Arrived;
        }

        position.x += dx;
        position.y += dy;
        // §4.7.2: θ = edge.orientation if provided, else the heading angle.
        position.theta = self.kinematics.orientation.unwrap_or_else(|| f32::atan2(vy, vx));
        let traveled = get_distance(0.0, 0.0, dx, dy);
        *battery_charge = crate::virtual_agv::battery::discharge(*battery_charge, traveled, config.battery_max_reach);

        if *battery_charge < config.low_battery_charge_threshold {
            *velocity = Velocity::default();
            return TraversalStep::BatteryLow;
        }

        TraversalStep::Driving
    }

    /// NURBS path-following variant of [`step`](Self::step), taken instead
    /// of straight-line integration whenever `self.edge.trajectory` is
    /// `Some` (§4.7.2 supplement, SPEC_FULL.md §10). Snapping, battery
    /// discharge and the low-battery abort mirror the straight-line path
    /// exactly; only the position update itself differs.
    fn step_trajectory(
        &mut self,
        end: &NodePosition,
        position: &mut AgvPosition,
        velocity: &mut Velocity,
        battery_charge: &mut f32,
        dt: f32,
        config: &VirtualAgvConfig,
        trajectory: Trajectory,
    ) -> TraversalStep {
        let step_distance = self.target_speed * dt;
        let (next_x, next_y, heading) =
            crate::utils::iterate_position_with_trajectory(position.x, position.y, end.x, end.y, step_distance, trajectory);
        let traveled = get_distance(position.x, position.y, next_x, next_y);
        if dt > 0.0 {
            velocity.vx = Some((next_x - position.x) / dt);
            velocity.vy = Some((next_y - position.y) / dt);
        }

        let arrived = (next_x - end.x).abs() < f32::EPSILON && (next_y - end.y).abs() < f32::EPSILON;
        position.x = next_x;
        position.y = next_y;
        // §4.7.2: θ = edge.orientation if provided, else the trajectory's own heading/control-point orientation.
        position.theta = self.kinematics.orientation.unwrap_or(heading);
        *battery_charge = crate::virtual_agv::battery::discharge(*battery_charge, traveled, config.battery_max_reach);

        if arrived {
            // §4.7.2: θ = edge.orientation if provided, else end-node θ if provided, else retain.
            position.theta = self.kinematics.orientation.or(end.theta).unwrap_or(position.theta);
            *velocity = Velocity::default();
            return TraversalStep::Arrived;
        }

        if *battery_charge < config.low_battery_charge_threshold {
            *velocity = Velocity::default();
            return TraversalStep::BatteryLow;
        }

        TraversalStep::Driving
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
            node_position: Some(NodePosition { x, y, theta: Some(0.0), allowed_deviation_xy: None, allowed_deviation_theta: None, map_id: "local".into(), map_description: None }),
        }
    }

    fn edge_state(id: &str) -> EdgeState {
        EdgeState { edge_id: id.into(), sequence_id: 1, edge_description: None, released: true, trajectory: None }
    }

    fn straight_line_trajectory(end_x: f32, end_y: f32) -> crate::protocol::vda5050_common::Trajectory {
        use crate::protocol::vda5050_common::ControlPoint;
        crate::protocol::vda5050_common::Trajectory {
            degree: 1,
            knot_vector: vec![0.0, 0.0, 1.0, 1.0],
            control_points: vec![
                ControlPoint { x: 0.0, y: 0.0, weight: None, orientation: None },
                ControlPoint { x: end_x, y: end_y, weight: None, orientation: None },
            ],
        }
    }

    fn position(x: f32, y: f32) -> AgvPosition {
        AgvPosition { x, y, theta: 0.0, map_id: "local".into(), map_description: None, position_initialized: true, localization_score: None, deviation_range: None }
    }

    #[test]
    fn axis_parallel_edge_reaches_end_node_without_overshoot() {
        let mut ctx = TraverseEdgeContext::new(edge_state("e1"), node_state("n2", 10.0, 0.0), EdgeKinematics::default());
        let mut pos = position(0.0, 0.0);
        let mut vel = Velocity::default();
        let mut battery = 100.0;
        let config = VirtualAgvConfig { vehicle_speed: 1.0, ..Default::default() };

        let mut arrived = false;
        for _ in 0..50 {
            match ctx.step(&mut pos, &mut vel, &mut battery, 1.0, &config) {
                TraversalStep::Arrived => {
                    arrived = true;
                    break;
                }
                TraversalStep::Driving => continue,
                TraversalStep::BatteryLow => panic!("battery should not run out over 10m"),
            }
        }

        assert!(arrived);
        assert!((pos.x - 10.0).abs() < 1e-4);
        assert!((pos.y - 0.0).abs() < 1e-4);
    }

    #[test]
    fn low_battery_stops_traversal_before_start() {
        let mut ctx = TraverseEdgeContext::new(edge_state("e1"), node_state("n2", 1000.0, 0.0), EdgeKinematics::default());
        let mut pos = position(0.0, 0.0);
        let mut vel = Velocity::default();
        let mut battery = 0.5;
        let config = VirtualAgvConfig { low_battery_charge_threshold: 1.0, ..Default::default() };

        assert!(matches!(ctx.step(&mut pos, &mut vel, &mut battery, 1.0, &config), TraversalStep::BatteryLow));
    }

    #[test]
    fn constant_speed_is_clamped_to_edge_max_speed() {
        let kinematics = EdgeKinematics { max_speed: Some(0.5), orientation: None };
        let mut ctx = TraverseEdgeContext::new(edge_state("e1"), node_state("n2", 10.0, 0.0), kinematics);
        let mut pos = position(0.0, 0.0);
        let mut vel = Velocity::default();
        let mut battery = 100.0;
        let config = VirtualAgvConfig { vehicle_speed: 2.0, ..Default::default() };

        ctx.step(&mut pos, &mut vel, &mut battery, 0.1, &config);
        assert!((vel.vx.unwrap() - 0.5).abs() < 1e-4, "target speed should be clamped to the edge's maxSpeed");
    }

    #[test]
    fn edge_orientation_overrides_end_node_theta_on_arrival() {
        let kinematics = EdgeKinematics { max_speed: None, orientation: Some(1.2) };
        let mut ctx = TraverseEdgeContext::new(edge_state("e1"), node_state("n2", 10.0, 0.0), kinematics);
        let mut pos = position(0.0, 0.0);
        let mut vel = Velocity::default();
        let mut battery = 100.0;
        let config = VirtualAgvConfig { vehicle_speed: 1.0, ..Default::default() };

        let mut arrived = false;
        for _ in 0..50 {
            if matches!(ctx.step(&mut pos, &mut vel, &mut battery, 1.0, &config), TraversalStep::Arrived) {
                arrived = true;
                break;
            }
        }
        assert!(arrived);
        assert!((pos.theta - 1.2).abs() < 1e-4, "edge orientation should override the end node's theta");
    }

    #[test]
    fn edge_carrying_a_trajectory_follows_it_instead_of_the_straight_line_integrator() {
        let mut edge = edge_state("e1");
        edge.trajectory = Some(straight_line_trajectory(10.0, 0.0));
        let mut ctx = TraverseEdgeContext::new(edge, node_state("n2", 10.0, 0.0), EdgeKinematics::default());
        let mut pos = position(0.0, 0.0);
        let mut vel = Velocity::default();
        let mut battery = 100.0;
        let config = VirtualAgvConfig { vehicle_speed: 1.0, ..Default::default() };

        let mut arrived = false;
        for _ in 0..50 {
            match ctx.step(&mut pos, &mut vel, &mut battery, 1.0, &config) {
                TraversalStep::Arrived => {
                    arrived = true;
                    break;
                }
                TraversalStep::Driving => continue,
                TraversalStep::BatteryLow => panic!("battery should not run out over 10m"),
            }
        }

        assert!(arrived, "trajectory-following traversal should still reach the end node");
        assert!((pos.x - 10.0).abs() < 1e-4);
        assert!((pos.y - 0.0).abs() < 1e-4);
    }
}
