use crate::address::RelocatedAddress;
use crate::control::SiteId;
use crate::error::Error;
use crate::plan::{PlanContext, PlanCore, PlanKind, ThreadPlan};
use crate::stop::{StopReason, Vote};
use crate::thread::RunState;
use crate::unwind::{FrameComparison, StackID};

/// Run until the selected frame returns to its caller. Implemented with an
/// internal breakpoint at the return address, guarded by a frame comparison
/// so recursion into the same address does not finish the plan early.
pub struct StepOutPlan {
    core: PlanCore,
    frame_idx: u32,
    return_addr: RelocatedAddress,
    caller_stack_id: Option<StackID>,
    /// Site installed by this plan, absent when an enabled user breakpoint
    /// already covers the return address.
    our_site: Option<SiteId>,
}

impl StepOutPlan {
    /// Step out of frame `frame_idx`, reporting the resulting stop.
    pub fn new(frame_idx: u32) -> Self {
        let mut core = PlanCore::new(PlanKind::StepOut);
        core.stop_vote = Vote::Yes;
        Self {
            core,
            frame_idx,
            return_addr: RelocatedAddress::default(),
            caller_stack_id: None,
            our_site: None,
        }
    }

    /// Step out as a helper for another plan, invisible to the user.
    pub fn internal(frame_idx: u32) -> Self {
        let mut plan = Self::new(frame_idx);
        plan.core.private = true;
        plan.core.stop_vote = Vote::NoOpinion;
        plan
    }
}

impl ThreadPlan for StepOutPlan {
    fn core(&self) -> &PlanCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut PlanCore {
        &mut self.core
    }

    fn description(&self) -> String {
        format!(
            "step out of frame {} to {}",
            self.frame_idx, self.return_addr,
        )
    }

    fn run_state(&self) -> RunState {
        RunState::Running
    }

    fn validate(&mut self, ctx: &mut PlanContext) -> Result<bool, Error> {
        ctx.frames.ensure(ctx.control, ctx.tid)?;
        // no caller frame means nowhere to step out to
        let Ok(caller) = ctx.frames.frame(self.frame_idx + 1) else {
            return Ok(false);
        };
        self.return_addr = caller.pc;
        self.caller_stack_id = Some(caller.stack_id);
        Ok(true)
    }

    fn did_push(&mut self, ctx: &mut PlanContext) -> Result<(), Error> {
        let existing = ctx.control.breakpoint_site_at(self.return_addr);
        if !existing.map(|s| s.enabled).unwrap_or(false) {
            self.our_site = Some(ctx.control.set_internal_breakpoint(self.return_addr)?);
        }
        Ok(())
    }

    fn will_pop(&mut self, ctx: &mut PlanContext) -> Result<(), Error> {
        if let Some(site) = self.our_site.take() {
            ctx.control.remove_internal_breakpoint(site)?;
        }
        Ok(())
    }

    fn explains_stop(&mut self, ctx: &mut PlanContext) -> Result<bool, Error> {
        match ctx.stop_reason() {
            Some(StopReason::Breakpoint { site }) => {
                Ok(self.our_site == Some(site) || ctx.pc()? == self.return_addr)
            }
            _ => Ok(false),
        }
    }

    fn should_stop(&mut self, ctx: &mut PlanContext) -> Result<bool, Error> {
        let caller = self.caller_stack_id.expect("set by validate");
        // recursion can hit the return address in a younger activation
        if ctx.frame_order(&caller)? == FrameComparison::Younger {
            return Ok(false);
        }
        self.core.mark_complete(true);
        Ok(true)
    }

    fn mischief_managed(&mut self, _ctx: &mut PlanContext) -> Result<bool, Error> {
        Ok(self.core.is_complete())
    }
}
