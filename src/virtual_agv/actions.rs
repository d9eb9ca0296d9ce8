//! Supported action catalog (§4.7.5): `pick`/`drop`, `initPosition`,
//! `startPause`/`stopPause`, `startCharging`/`stopCharging`, and the
//! custom `orderExecutionTime`.

use crate::agv_controller::ActionScope;
use crate::config::VirtualAgvConfig;
use crate::protocol::vda5050_common::Load;
use crate::protocol::vda_2_0_0::{Action, ActionStatus, OrderBody};

use super::action_sm::ActionBehavior;
use super::execution_time;

/// Read-only context a behaviour consults when deciding a transition.
pub struct ActionContext<'a> {
    pub action: &'a Action,
    pub scope: ActionScope,
    pub has_load: bool,
    pub driving: bool,
    pub charging: bool,
    pub order_active: bool,
}

/// Side effect a terminal transition applies to the vehicle. Computed by
/// the behaviour, applied by the tick loop — keeps behaviours free of
/// direct vehicle-state access.
pub enum ActionEffect {
    None,
    AddLoad(Load),
    RemoveLoad,
    OverridePosition { x: f32, y: f32, theta: f32, map_id: String, last_node_id: String, last_node_sequence_id: u32 },
    StartPause,
    StopPause,
    StartCharging,
    StopCharging,
}

/// Whatever a behaviour needs to know about the world at the moment an
/// action is first scheduled (only `orderExecutionTime` actually reads
/// this, to compute its estimate once up front).
pub struct WorldSnapshot<'a> {
    pub config: &'a VirtualAgvConfig,
    pub position: Option<(f32, f32)>,
}

fn duration_override(action: &Action, default_secs: f32) -> f32 {
    action.parameter("duration").and_then(|v| v.as_f64()).map(|d| d as f32).unwrap_or(default_secs)
}

fn f32_param(action: &Action, key: &str, default: f32) -> f32 {
    action.parameter(key).and_then(|v| v.as_f64()).map(|d| d as f32).unwrap_or(default)
}

fn str_param(action: &Action, key: &str) -> String {
    action.parameter(key).and_then(|v| v.as_str()).unwrap_or_default().to_string()
}

/// Node/edge-capable actions that can also run as an instant action must
/// go straight to `Finished` only in the instant case (§4.7.4); otherwise
/// they take one brief `Running` tick.
fn on_init_for_dual_scope(scope: ActionScope) -> ActionStatus {
    if scope == ActionScope::Instant {
        ActionStatus::Finished
    } else {
        ActionStatus::Running
    }
}

struct PickBehavior {
    duration: f32,
}

impl PickBehavior {
    fn new(action: &Action) -> Self {
        Self { duration: duration_override(action, 3.0) }
    }
}

impl ActionBehavior for PickBehavior {
    fn on_init(&self, _ctx: &ActionContext) -> ActionStatus {
        ActionStatus::Running
    }

    fn duration(&self, status: ActionStatus, _ctx: &ActionContext) -> Option<f32> {
        (status == ActionStatus::Running).then_some(self.duration)
    }

    fn next_after(&self, _status: ActionStatus, ctx: &ActionContext) -> Option<ActionStatus> {
        Some(if ctx.has_load { ActionStatus::Failed } else { ActionStatus::Finished })
    }

    fn is_cancelable(&self) -> bool {
        true
    }

    fn result_description(&self, _ctx: &ActionContext) -> String {
        "load picked up".into()
    }

    fn error_description(&self, _ctx: &ActionContext) -> Option<String> {
        Some("a load is already present".into())
    }

    fn effect(&self, status: ActionStatus, _ctx: &ActionContext) -> ActionEffect {
        if status == ActionStatus::Finished {
            ActionEffect::AddLoad(Load {
                load_id: None,
                load_type: Some("EPAL".into()),
                load_position: None,
                bounding_box_reference: None,
                load_dimensions: None,
                weight: None,
            })
        } else {
            ActionEffect::None
        }
    }
}

struct DropBehavior {
    duration: f32,
}

impl DropBehavior {
    fn new(action: &Action) -> Self {
        Self { duration: duration_override(action, 3.0) }
    }
}

impl ActionBehavior for DropBehavior {
    fn on_init(&self, _ctx: &ActionContext) -> ActionStatus {
        ActionStatus::Running
    }

    fn duration(&self, status: ActionStatus, _ctx: &ActionContext) -> Option<f32> {
        (status == ActionStatus::Running).then_some(self.duration)
    }

    fn next_after(&self, _status: ActionStatus, ctx: &ActionContext) -> Option<ActionStatus> {
        Some(if ctx.has_load { ActionStatus::Finished } else { ActionStatus::Failed })
    }

    fn is_cancelable(&self) -> bool {
        true
    }

    fn result_description(&self, _ctx: &ActionContext) -> String {
        "load dropped off".into()
    }

    fn error_description(&self, _ctx: &ActionContext) -> Option<String> {
        Some("no load is present".into())
    }

    fn effect(&self, status: ActionStatus, _ctx: &ActionContext) -> ActionEffect {
        if status == ActionStatus::Finished {
            ActionEffect::RemoveLoad
        } else {
            ActionEffect::None
        }
    }
}

struct InitPositionBehavior;

impl ActionBehavior for InitPositionBehavior {
    fn on_init(&self, ctx: &ActionContext) -> ActionStatus {
        on_init_for_dual_scope(ctx.scope)
    }

    fn duration(&self, status: ActionStatus, _ctx: &ActionContext) -> Option<f32> {
        (status == ActionStatus::Running).then_some(0.0)
    }

    fn next_after(&self, _status: ActionStatus, _ctx: &ActionContext) -> Option<ActionStatus> {
        Some(ActionStatus::Finished)
    }

    fn is_cancelable(&self) -> bool {
        true
    }

    fn result_description(&self, _ctx: &ActionContext) -> String {
        "position overridden".into()
    }

    fn effect(&self, status: ActionStatus, ctx: &ActionContext) -> ActionEffect {
        if status != ActionStatus::Finished {
            return ActionEffect::None;
        }
        ActionEffect::OverridePosition {
            x: f32_param(ctx.action, "x", 0.0),
            y: f32_param(ctx.action, "y", 0.0),
            theta: f32_param(ctx.action, "theta", 0.0),
            map_id: str_param(ctx.action, "mapId"),
            last_node_id: str_param(ctx.action, "lastNodeId"),
            last_node_sequence_id: f32_param(ctx.action, "lastNodeSequenceId", 0.0) as u32,
        }
    }
}

struct StartPauseBehavior;

impl ActionBehavior for StartPauseBehavior {
    fn on_init(&self, _ctx: &ActionContext) -> ActionStatus {
        ActionStatus::Finished
    }

    fn duration(&self, _status: ActionStatus, _ctx: &ActionContext) -> Option<f32> {
        None
    }

    fn next_after(&self, _status: ActionStatus, _ctx: &ActionContext) -> Option<ActionStatus> {
        None
    }

    fn result_description(&self, _ctx: &ActionContext) -> String {
        "paused".into()
    }

    fn effect(&self, status: ActionStatus, _ctx: &ActionContext) -> ActionEffect {
        if status == ActionStatus::Finished {
            ActionEffect::StartPause
        } else {
            ActionEffect::None
        }
    }
}

struct StopPauseBehavior;

impl ActionBehavior for StopPauseBehavior {
    fn on_init(&self, _ctx: &ActionContext) -> ActionStatus {
        ActionStatus::Finished
    }

    fn duration(&self, _status: ActionStatus, _ctx: &ActionContext) -> Option<f32> {
        None
    }

    fn next_after(&self, _status: ActionStatus, _ctx: &ActionContext) -> Option<ActionStatus> {
        None
    }

    fn result_description(&self, _ctx: &ActionContext) -> String {
        "unpaused".into()
    }

    fn effect(&self, status: ActionStatus, _ctx: &ActionContext) -> ActionEffect {
        if status == ActionStatus::Finished {
            ActionEffect::StopPause
        } else {
            ActionEffect::None
        }
    }
}

struct StartChargingBehavior;

impl ActionBehavior for StartChargingBehavior {
    fn on_init(&self, ctx: &ActionContext) -> ActionStatus {
        on_init_for_dual_scope(ctx.scope)
    }

    fn duration(&self, status: ActionStatus, _ctx: &ActionContext) -> Option<f32> {
        (status == ActionStatus::Running).then_some(0.0)
    }

    fn next_after(&self, _status: ActionStatus, _ctx: &ActionContext) -> Option<ActionStatus> {
        Some(ActionStatus::Finished)
    }

    fn is_cancelable(&self) -> bool {
        true
    }

    fn result_description(&self, _ctx: &ActionContext) -> String {
        "charging started".into()
    }

    fn effect(&self, status: ActionStatus, _ctx: &ActionContext) -> ActionEffect {
        if status == ActionStatus::Finished {
            ActionEffect::StartCharging
        } else {
            ActionEffect::None
        }
    }
}

struct StopChargingBehavior;

impl ActionBehavior for StopChargingBehavior {
    fn on_init(&self, ctx: &ActionContext) -> ActionStatus {
        on_init_for_dual_scope(ctx.scope)
    }

    fn duration(&self, status: ActionStatus, _ctx: &ActionContext) -> Option<f32> {
        (status == ActionStatus::Running).then_some(0.0)
    }

    fn next_after(&self, _status: ActionStatus, _ctx: &ActionContext) -> Option<ActionStatus> {
        Some(ActionStatus::Finished)
    }

    fn is_cancelable(&self) -> bool {
        true
    }

    fn result_description(&self, _ctx: &ActionContext) -> String {
        "charging stopped".into()
    }

    fn effect(&self, status: ActionStatus, _ctx: &ActionContext) -> ActionEffect {
        if status == ActionStatus::Finished {
            ActionEffect::StopCharging
        } else {
            ActionEffect::None
        }
    }
}

/// `orders`' parameter has no representation as an `ActionParameterValue`
/// (no nested-object/array-of-objects variant), so it is carried as a
/// JSON-serialized string and parsed here; the estimate is computed once,
/// at construction, since `orderExecutionTime` always resolves to
/// `Finished` on its first tick.
struct OrderExecutionTimeBehavior {
    result: String,
}

impl OrderExecutionTimeBehavior {
    fn new(action: &Action, world: &WorldSnapshot) -> Self {
        let result = action
            .parameter("orders")
            .and_then(|v| v.as_str())
            .and_then(|s| serde_json::from_str::<Vec<OrderBody>>(s).ok())
            .and_then(|orders| execution_time::estimate_orders(&orders, world.position.unwrap_or((0.0, 0.0)), world.config))
            .map(|secs| secs.iter().map(|s| format!("{s:.1}")).collect::<Vec<_>>().join(","))
            .unwrap_or_default();
        Self { result }
    }
}

impl ActionBehavior for OrderExecutionTimeBehavior {
    fn on_init(&self, _ctx: &ActionContext) -> ActionStatus {
        ActionStatus::Finished
    }

    fn duration(&self, _status: ActionStatus, _ctx: &ActionContext) -> Option<f32> {
        None
    }

    fn next_after(&self, _status: ActionStatus, _ctx: &ActionContext) -> Option<ActionStatus> {
        None
    }

    fn result_description(&self, _ctx: &ActionContext) -> String {
        self.result.clone()
    }

    fn effect(&self, _status: ActionStatus, _ctx: &ActionContext) -> ActionEffect {
        ActionEffect::None
    }
}

pub fn is_known_action_type(action_type: &str) -> bool {
    matches!(
        action_type,
        "pick" | "drop" | "initPosition" | "startPause" | "stopPause" | "startCharging" | "stopCharging" | "orderExecutionTime"
    )
}

/// Syntactic/parameter validity and scope-dependent preconditions
/// (§4.7.5). Checked before an action is ever scheduled, independent of
/// constructing a behaviour for it.
pub fn is_executable(action: &Action, scope: ActionScope, ctx: &ActionContext) -> bool {
    match action.action_type.as_str() {
        "pick" | "drop" => {
            let station_ok = action.parameter("stationType").and_then(|v| v.as_str()).is_some_and(|s| s.starts_with("floor"));
            let load_ok = action.parameter("loadType").and_then(|v| v.as_str()) == Some("EPAL");
            station_ok && load_ok
        }
        "initPosition" => {
            matches!(scope, ActionScope::Instant | ActionScope::Node)
                && action.parameter("x").is_some()
                && action.parameter("y").is_some()
                && action.parameter("mapId").is_some()
        }
        "startPause" | "stopPause" => scope == ActionScope::Instant,
        "startCharging" => {
            matches!(scope, ActionScope::Instant | ActionScope::Node) && !ctx.driving && !(scope == ActionScope::Instant && ctx.order_active)
        }
        "stopCharging" => matches!(scope, ActionScope::Instant | ActionScope::Node),
        "orderExecutionTime" => scope == ActionScope::Instant && action.parameter("orders").is_some(),
        _ => false,
    }
}

pub fn behavior_for(action: &Action, scope: ActionScope, world: &WorldSnapshot) -> Option<Box<dyn ActionBehavior>> {
    match action.action_type.as_str() {
        "pick" => Some(Box::new(PickBehavior::new(action))),
        "drop" => Some(Box::new(DropBehavior::new(action))),
        "initPosition" => Some(Box::new(InitPositionBehavior)),
        "startPause" => Some(Box::new(StartPauseBehavior)),
        "stopPause" => Some(Box::new(StopPauseBehavior)),
        "startCharging" => Some(Box::new(StartChargingBehavior)),
        "stopCharging" => Some(Box::new(StopChargingBehavior)),
        "orderExecutionTime" => Some(Box::new(OrderExecutionTimeBehavior::new(action, world))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::vda_2_0_0::BlockingType;

    fn action(action_type: &str, params: Vec<(&str, crate::protocol::vda_2_0_0::ActionParameterValue)>) -> Action {
        Action {
            action_type: action_type.into(),
            action_id: "a1".into(),
            action_description: None,
            blocking_type: BlockingType::Hard,
            action_parameters: Some(
                params
                    .into_iter()
                    .map(|(key, value)| crate::protocol::vda_2_0_0::ActionParameter { key: key.into(), value })
                    .collect(),
            ),
        }
    }

    fn ctx<'a>(action: &'a Action, scope: ActionScope) -> ActionContext<'a> {
        ActionContext { action, scope, has_load: false, driving: false, charging: false, order_active: false }
    }

    #[test]
    fn pick_requires_floor_station_and_epal_load_type() {
        use crate::protocol::vda_2_0_0::ActionParameterValue::Str;
        let ok = action("pick", vec![("stationType", Str("floor1".into())), ("loadType", Str("EPAL".into()))]);
        assert!(is_executable(&ok, ActionScope::Node, &ctx(&ok, ActionScope::Node)));

        let bad = action("pick", vec![("stationType", Str("dock".into())), ("loadType", Str("EPAL".into()))]);
        assert!(!is_executable(&bad, ActionScope::Node, &ctx(&bad, ActionScope::Node)));
    }

    #[test]
    fn pick_fails_when_load_already_present() {
        let a = action("pick", vec![]);
        let behavior = PickBehavior::new(&a);
        let mut c = ctx(&a, ActionScope::Node);
        c.has_load = true;
        assert_eq!(behavior.next_after(ActionStatus::Running, &c), Some(ActionStatus::Failed));
    }

    #[test]
    fn drop_requires_a_load_present() {
        let a = action("drop", vec![]);
        let behavior = DropBehavior::new(&a);
        let c = ctx(&a, ActionScope::Node);
        assert_eq!(behavior.next_after(ActionStatus::Running, &c), Some(ActionStatus::Failed));
    }

    #[test]
    fn instant_start_charging_forbidden_while_order_active() {
        let a = action("startCharging", vec![]);
        let mut c = ctx(&a, ActionScope::Instant);
        c.order_active = true;
        assert!(!is_executable(&a, ActionScope::Instant, &c));
    }

    #[test]
    fn init_position_goes_straight_to_finished_only_for_instant_scope() {
        let behavior = InitPositionBehavior;
        let a = action("initPosition", vec![]);
        assert_eq!(behavior.on_init(&ctx(&a, ActionScope::Instant)), ActionStatus::Finished);
        assert_eq!(behavior.on_init(&ctx(&a, ActionScope::Node)), ActionStatus::Running);
    }
}
