use crate::error::Error;
use crate::plan::{PlanContext, PlanCore, PlanKind, ThreadPlan};
use crate::stop::{StopReason, Vote};
use crate::thread::RunState;

/// The immortal plan at the bottom of every stack. It explains any stop no
/// other plan claims and stops the thread for events that carry user
/// relevance on their own.
pub struct BasePlan {
    core: PlanCore,
}

impl BasePlan {
    pub fn new() -> Self {
        let mut core = PlanCore::new(PlanKind::Base);
        core.is_master = true;
        core.okay_to_discard = false;
        core.stop_vote = Vote::Yes;
        core.run_vote = Vote::Yes;
        Self { core }
    }
}

impl Default for BasePlan {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadPlan for BasePlan {
    fn core(&self) -> &PlanCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut PlanCore {
        &mut self.core
    }

    fn description(&self) -> String {
        "base plan".to_string()
    }

    fn run_state(&self) -> RunState {
        RunState::Running
    }

    fn explains_stop(&mut self, _ctx: &mut PlanContext) -> Result<bool, Error> {
        Ok(true)
    }

    fn should_stop(&mut self, ctx: &mut PlanContext) -> Result<bool, Error> {
        let should_stop = match ctx.stop_reason() {
            Some(
                StopReason::Breakpoint { .. }
                | StopReason::Watchpoint { .. }
                | StopReason::Signal(_)
                | StopReason::Exception,
            ) => true,
            Some(StopReason::Trace | StopReason::None | StopReason::PlanComplete { .. }) | None => {
                false
            }
        };
        Ok(should_stop)
    }

    fn mischief_managed(&mut self, _ctx: &mut PlanContext) -> Result<bool, Error> {
        Ok(false)
    }
}
