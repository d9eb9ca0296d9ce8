//! Execution-time estimation for the `orderExecutionTime` instant action
//! (§4.7.6). Walks a sequence of orders, consumed back to back and
//! seeding each order's starting position with the previous order's
//! last node, and returns one estimate (in seconds) per order — or
//! `None` if any order turns out to be unexecutable.

use crate::agv_controller::ActionScope;
use crate::config::{SpeedSelection, VirtualAgvConfig};
use crate::protocol::vda_2_0_0::{Action, BlockingType, Edge, Node, OrderBody};
use crate::utils::get_distance;

use super::actions::{is_executable, ActionContext};

fn action_duration_secs(action: &Action) -> f32 {
    let default = match action.action_type.as_str() {
        "pick" | "drop" => 3.0,
        _ => 0.0,
    };
    action.parameter("duration").and_then(|v| v.as_f64()).map(|d| d as f32).unwrap_or(default)
}

/// Flushes the running concurrent-actions maximum into `sum` whenever a
/// `Hard` action is encountered, then adds that action's own duration;
/// non-`Hard` actions only ever update the running maximum, since they
/// execute in parallel until a `Hard` action forces a sync point
/// (§4.7.6).
fn node_action_time(actions: &[Action]) -> f32 {
    let mut sum = 0.0;
    let mut concurrent_max: f32 = 0.0;
    for action in actions {
        let duration = action_duration_secs(action);
        if action.blocking_type == BlockingType::Hard {
            sum += concurrent_max;
            concurrent_max = 0.0;
            sum += duration;
        } else {
            concurrent_max = concurrent_max.max(duration);
        }
    }
    sum + concurrent_max
}

fn node_position<'a>(nodes: &'a [Node], node_id: &str) -> Option<(&'a Node, f32, f32)> {
    nodes.iter().find(|n| n.node_id == node_id).and_then(|n| n.node_position.as_ref().map(|p| (n, p.x, p.y)))
}

fn edge_speed(edge: &Edge, config: &VirtualAgvConfig) -> f32 {
    let base = match config.speed_selection() {
        SpeedSelection::Constant(v) => v,
        SpeedSelection::Speed(d) => d.mean(),
        SpeedSelection::Time(_) => return f32::NAN,
    };
    edge.max_speed.map(|max| base.min(max)).unwrap_or(base)
}

fn edge_traversal_time(edge: &Edge, distance: f32, config: &VirtualAgvConfig) -> f32 {
    if let SpeedSelection::Time(t) = config.speed_selection() {
        return (t.min_secs + t.max_secs) / 2.0;
    }
    let speed = edge_speed(edge, config);
    if speed > 0.0 {
        distance / speed
    } else {
        0.0
    }
}

/// Whether every node action in `order` is executable and every edge's
/// endpoints resolve to a positioned node — the two ways an order can be
/// judged unexecutable (§4.7.6).
fn order_is_executable(order: &OrderBody) -> bool {
    for node in &order.nodes {
        for action in &node.actions {
            let ctx = ActionContext { action, scope: ActionScope::Node, has_load: false, driving: false, charging: false, order_active: true };
            if !is_executable(action, ActionScope::Node, &ctx) {
                return false;
            }
        }
    }
    for edge in &order.edges {
        if node_position(&order.nodes, &edge.start_node_id).is_none() || node_position(&order.nodes, &edge.end_node_id).is_none() {
            return false;
        }
    }
    true
}

/// Estimates one order's total execution time in seconds plus the
/// position to seed the next order with (its last node's position, or
/// `start` if the order has no positioned nodes).
fn estimate_order(order: &OrderBody, start: (f32, f32), config: &VirtualAgvConfig) -> Option<(f32, (f32, f32))> {
    if !order_is_executable(order) {
        return None;
    }

    let mut total = 0.0;
    for node in &order.nodes {
        total += node_action_time(&node.actions);
    }

    let mut last_position = start;
    for edge in &order.edges {
        let Some((_, sx, sy)) = node_position(&order.nodes, &edge.start_node_id) else { return None };
        let Some((end_node, ex, ey)) = node_position(&order.nodes, &edge.end_node_id) else { return None };
        let distance = get_distance(sx, sy, ex, ey);
        total += edge_traversal_time(edge, distance, config);
        last_position = (ex, ey);
        let _ = end_node;
    }

    Some((total, last_position))
}

/// `orders` consumed in sequence, each seeded with the previous order's
/// ending position (§4.7.6). Returns `None` if any order is
/// unexecutable — the caller renders that as an empty result string.
pub fn estimate_orders(orders: &[OrderBody], start: (f32, f32), config: &VirtualAgvConfig) -> Option<Vec<f32>> {
    let mut position = start;
    let mut estimates = Vec::with_capacity(orders.len());
    for order in orders {
        let (seconds, next_position) = estimate_order(order, position, config)?;
        estimates.push(seconds);
        position = next_position;
    }
    Some(estimates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::vda_2_0_0::{ActionParameter, ActionParameterValue};
    use crate::protocol::vda5050_common::NodePosition;

    fn node(id: &str, seq: u32, x: f32, y: f32, actions: Vec<Action>) -> Node {
        Node {
            node_id: id.into(),
            sequence_id: seq,
            node_description: None,
            released: true,
            node_position: Some(NodePosition { x, y, theta: None, allowed_deviation_xy: None, allowed_deviation_theta: None, map_id: "local".into(), map_description: None }),
            actions,
        }
    }

    fn edge(seq: u32, start: &str, end: &str) -> Edge {
        Edge {
            edge_id: format!("e{seq}"),
            sequence_id: seq,
            edge_description: None,
            released: true,
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

    fn pick(id: &str) -> Action {
        Action {
            action_type: "pick".into(),
            action_id: id.into(),
            action_description: None,
            blocking_type: BlockingType::Hard,
            action_parameters: Some(vec![
                ActionParameter { key: "stationType".into(), value: ActionParameterValue::Str("floor1".into()) },
                ActionParameter { key: "loadType".into(), value: ActionParameterValue::Str("EPAL".into()) },
            ]),
        }
    }

    #[test]
    fn straight_edge_time_is_distance_over_speed() {
        let order = OrderBody {
            order_id: "o1".into(),
            order_update_id: 0,
            zone_set_id: None,
            nodes: vec![node("n1", 0, 0.0, 0.0, vec![]), node("n2", 2, 10.0, 0.0, vec![])],
            edges: vec![edge(1, "n1", "n2")],
        };
        let config = VirtualAgvConfig { vehicle_speed: 2.0, ..Default::default() };
        let (seconds, _) = estimate_order(&order, (0.0, 0.0), &config).unwrap();
        assert!((seconds - 5.0).abs() < 1e-4);
    }

    #[test]
    fn hard_action_flushes_concurrent_maximum_into_the_running_sum() {
        let order = OrderBody {
            order_id: "o1".into(),
            order_update_id: 0,
            zone_set_id: None,
            nodes: vec![node("n1", 0, 0.0, 0.0, vec![pick("a1")])],
            edges: vec![],
        };
        let config = VirtualAgvConfig::default();
        let (seconds, _) = estimate_order(&order, (0.0, 0.0), &config).unwrap();
        assert!((seconds - 3.0).abs() < 1e-4);
    }

    #[test]
    fn unexecutable_node_action_fails_the_whole_order() {
        let bad_pick = Action { action_parameters: None, ..pick("a1") };
        let order = OrderBody {
            order_id: "o1".into(),
            order_update_id: 0,
            zone_set_id: None,
            nodes: vec![node("n1", 0, 0.0, 0.0, vec![bad_pick])],
            edges: vec![],
        };
        let config = VirtualAgvConfig::default();
        assert!(estimate_order(&order, (0.0, 0.0), &config).is_none());
    }
}
