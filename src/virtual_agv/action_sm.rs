//! The declarative per-action state machine (§4.7.4). Each action type
//! supplies an [`ActionBehavior`]; [`ActionStateMachine`] runs the
//! seven-step per-tick priority logic that is common to every action,
//! independent of what the action actually does.

use crate::protocol::vda_2_0_0::ActionStatus;

use super::actions::{ActionContext, ActionEffect};

/// Behaviour specific to one action type — the declarative transition
/// table of §4.7.4, expressed as trait methods rather than a literal
/// table so each action can consult live context (load state, driving,
/// scope) when deciding a transition.
pub trait ActionBehavior: Send + Sync {
    /// `ON_INIT.next`. Finished is only valid when `ctx.scope` is
    /// `Instant` — behaviours for node/edge-capable action types must
    /// check `ctx.scope` themselves before returning it.
    fn on_init(&self, ctx: &ActionContext) -> ActionStatus;

    /// `durationTime` for `status`, if that status has one.
    fn duration(&self, status: ActionStatus, ctx: &ActionContext) -> Option<f32>;

    /// The status to transition to once `status`'s duration elapses.
    fn next_after(&self, status: ActionStatus, ctx: &ActionContext) -> Option<ActionStatus>;

    /// Whether `ON_CANCEL` is defined for this action.
    fn is_cancelable(&self) -> bool {
        false
    }

    /// Whether `ON_TERMINATE` is mandatory (edge actions only).
    fn is_edge_action(&self) -> bool {
        false
    }

    fn on_terminate(&self, _ctx: &ActionContext) -> ActionStatus {
        ActionStatus::Finished
    }

    fn result_description(&self, ctx: &ActionContext) -> String;

    fn error_description(&self, _ctx: &ActionContext) -> Option<String> {
        None
    }

    /// Side effect to apply to the vehicle when reaching `status`
    /// (only ever called for `Finished`/`Failed`).
    fn effect(&self, status: ActionStatus, ctx: &ActionContext) -> ActionEffect;
}

/// Result of one `tick()`: `None` if nothing changed this tick.
pub struct TickOutcome {
    pub status: ActionStatus,
    pub terminal: bool,
    pub effect: ActionEffect,
    pub result_description: Option<String>,
    pub error_description: Option<String>,
}

pub struct ActionStateMachine {
    pub action: crate::protocol::vda_2_0_0::Action,
    pub scope: crate::agv_controller::ActionScope,
    behavior: Box<dyn ActionBehavior>,
    current_status: Option<ActionStatus>,
    elapsed: f32,
    resume_status_on_unpause: Option<ActionStatus>,
    pub should_cancel: bool,
    pub should_terminate: bool,
    pub should_pause: bool,
}

impl ActionStateMachine {
    pub fn new(
        action: crate::protocol::vda_2_0_0::Action,
        scope: crate::agv_controller::ActionScope,
        behavior: Box<dyn ActionBehavior>,
    ) -> Self {
        Self {
            action,
            scope,
            behavior,
            current_status: None,
            elapsed: 0.0,
            resume_status_on_unpause: None,
            should_cancel: false,
            should_terminate: false,
            should_pause: false,
        }
    }

    pub fn current_status(&self) -> Option<ActionStatus> {
        self.current_status
    }

    /// Advances the machine by `dt` seconds under the seven-step
    /// priority logic of §4.7.4. Returns `Some` exactly when the status
    /// changed this tick.
    pub fn tick(&mut self, dt: f32, ctx: &ActionContext) -> Option<TickOutcome> {
        // 1. pause takes priority over everything else.
        if self.should_pause && self.current_status != Some(ActionStatus::Paused) {
            self.resume_status_on_unpause = self.current_status;
            return Some(self.transition_to(ActionStatus::Paused, ctx));
        }
        // 2. unpause.
        if !self.should_pause && self.current_status == Some(ActionStatus::Paused) {
            let resume = self.resume_status_on_unpause.take().unwrap_or(ActionStatus::Running);
            return Some(self.transition_to(resume, ctx));
        }
        // 3. first tick: ON_INIT.
        if self.current_status.is_none() {
            let next = self.behavior.on_init(ctx);
            return Some(self.transition_to(next, ctx));
        }
        // 4. cancel.
        if self.should_cancel && self.behavior.is_cancelable() {
            return Some(self.transition_to(ActionStatus::Failed, ctx));
        }
        // 5. terminate (edge actions only).
        if self.should_terminate && self.behavior.is_edge_action() {
            let next = self.behavior.on_terminate(ctx);
            return Some(self.transition_to(next, ctx));
        }
        // 6. paused: idle.
        if self.current_status == Some(ActionStatus::Paused) {
            return None;
        }
        // 7. duration-based transition.
        self.elapsed += dt;
        let status = self.current_status.expect("checked above");
        if let Some(duration) = self.behavior.duration(status, ctx) {
            if self.elapsed >= duration {
                if let Some(next) = self.behavior.next_after(status, ctx) {
                    return Some(self.transition_to(next, ctx));
                }
            }
        }
        None
    }

    fn transition_to(&mut self, new_status: ActionStatus, ctx: &ActionContext) -> TickOutcome {
        self.current_status = Some(new_status);
        self.elapsed = 0.0;

        let (effect, result_description, error_description) = match new_status {
            ActionStatus::Finished => {
                (self.behavior.effect(new_status, ctx), Some(self.behavior.result_description(ctx)), None)
            }
            ActionStatus::Failed => (self.behavior.effect(new_status, ctx), None, self.behavior.error_description(ctx)),
            _ => (ActionEffect::None, None, None),
        };

        TickOutcome { status: new_status, terminal: new_status.is_terminal(), effect, result_description, error_description }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agv_controller::ActionScope;
    use crate::protocol::vda_2_0_0::{Action, BlockingType};

    struct RunsFor(f32);

    impl ActionBehavior for RunsFor {
        fn on_init(&self, _ctx: &ActionContext) -> ActionStatus {
            ActionStatus::Running
        }
        fn duration(&self, status: ActionStatus, _ctx: &ActionContext) -> Option<f32> {
            (status == ActionStatus::Running).then_some(self.0)
        }
        fn next_after(&self, _status: ActionStatus, _ctx: &ActionContext) -> Option<ActionStatus> {
            Some(ActionStatus::Finished)
        }
        fn is_cancelable(&self) -> bool {
            true
        }
        fn result_description(&self, _ctx: &ActionContext) -> String {
            "done".into()
        }
        fn effect(&self, _status: ActionStatus, _ctx: &ActionContext) -> ActionEffect {
            ActionEffect::None
        }
    }

    fn action() -> Action {
        Action { action_type: "test".into(), action_id: "a1".into(), action_description: None, blocking_type: BlockingType::Hard, action_parameters: None }
    }

    fn ctx(action: &Action) -> ActionContext<'_> {
        ActionContext { action, scope: ActionScope::Node, has_load: false, driving: false, charging: false, order_active: false }
    }

    #[test]
    fn first_tick_runs_on_init_regardless_of_dt() {
        let a = action();
        let mut machine = ActionStateMachine::new(a, ActionScope::Node, Box::new(RunsFor(1.0)));
        let a2 = action();
        let outcome = machine.tick(0.0, &ctx(&a2)).expect("ON_INIT always produces a transition");
        assert_eq!(outcome.status, ActionStatus::Running);
        assert!(!outcome.terminal);
    }

    #[test]
    fn duration_elapses_across_several_ticks_and_reaches_finished() {
        let a = action();
        let mut machine = ActionStateMachine::new(a, ActionScope::Node, Box::new(RunsFor(1.0)));
        let a2 = action();
        let c = ctx(&a2);
        machine.tick(0.0, &c);
        assert!(machine.tick(0.4, &c).is_none());
        assert!(machine.tick(0.4, &c).is_none());
        let outcome = machine.tick(0.4, &c).expect("cumulative elapsed now exceeds the 1.0s duration");
        assert_eq!(outcome.status, ActionStatus::Finished);
        assert!(outcome.terminal);
    }

    #[test]
    fn pause_takes_priority_and_resumes_to_the_status_it_interrupted() {
        let a = action();
        let mut machine = ActionStateMachine::new(a, ActionScope::Node, Box::new(RunsFor(10.0)));
        let a2 = action();
        let c = ctx(&a2);
        machine.tick(0.0, &c); // -> Running

        machine.should_pause = true;
        let paused = machine.tick(1.0, &c).expect("pause pre-empts the duration check");
        assert_eq!(paused.status, ActionStatus::Paused);

        // while paused, ticks are idle — no duration accrues.
        assert!(machine.tick(5.0, &c).is_none());

        machine.should_pause = false;
        let resumed = machine.tick(0.0, &c).expect("unpause produces a transition");
        assert_eq!(resumed.status, ActionStatus::Running);
    }

    #[test]
    fn cancel_fails_a_cancelable_action_immediately() {
        let a = action();
        let mut machine = ActionStateMachine::new(a, ActionScope::Node, Box::new(RunsFor(10.0)));
        let a2 = action();
        let c = ctx(&a2);
        machine.tick(0.0, &c); // -> Running

        machine.should_cancel = true;
        let outcome = machine.tick(0.1, &c).expect("cancel pre-empts the duration check");
        assert_eq!(outcome.status, ActionStatus::Failed);
        assert!(outcome.terminal);
    }
}
