use crate::address::RelocatedAddress;
use crate::control::SiteId;
use crate::error::Error;
use crate::plan::{PlanContext, PlanCore, PlanKind, ThreadPlan};
use crate::stop::StopReason;
use crate::thread::RunState;
use crate::unwind::{FrameComparison, StackID};

/// Cross a linker trampoline (PLT stub or similar) to the function it
/// dispatches to. A backstop breakpoint at the return address catches the
/// case where the trampoline never reaches the expected target.
pub struct StepThroughPlan {
    core: PlanCore,
    target: RelocatedAddress,
    target_site: Option<SiteId>,
    backstop_addr: Option<RelocatedAddress>,
    backstop_site: Option<SiteId>,
    caller_stack_id: Option<StackID>,
}

impl StepThroughPlan {
    pub fn new() -> Self {
        let mut core = PlanCore::new(PlanKind::StepThrough);
        core.private = true;
        Self {
            core,
            target: RelocatedAddress::default(),
            target_site: None,
            backstop_addr: None,
            backstop_site: None,
            caller_stack_id: None,
        }
    }
}

impl Default for StepThroughPlan {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadPlan for StepThroughPlan {
    fn core(&self) -> &PlanCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut PlanCore {
        &mut self.core
    }

    fn description(&self) -> String {
        format!("step through trampoline to {}", self.target)
    }

    fn run_state(&self) -> RunState {
        RunState::Running
    }

    fn validate(&mut self, ctx: &mut PlanContext) -> Result<bool, Error> {
        let pc = ctx.pc()?;
        let Some(target) = ctx.control.trampoline_target(pc) else {
            return Ok(false);
        };
        self.target = target;
        ctx.frames.ensure(ctx.control, ctx.tid)?;
        if let Ok(caller) = ctx.frames.frame(1) {
            self.backstop_addr = Some(caller.pc);
            self.caller_stack_id = Some(caller.stack_id);
        }
        Ok(true)
    }

    fn did_push(&mut self, ctx: &mut PlanContext) -> Result<(), Error> {
        self.target_site = Some(ctx.control.set_internal_breakpoint(self.target)?);
        if let Some(addr) = self.backstop_addr {
            self.backstop_site = Some(ctx.control.set_internal_breakpoint(addr)?);
        }
        Ok(())
    }

    fn will_pop(&mut self, ctx: &mut PlanContext) -> Result<(), Error> {
        if let Some(site) = self.target_site.take() {
            ctx.control.remove_internal_breakpoint(site)?;
        }
        if let Some(site) = self.backstop_site.take() {
            ctx.control.remove_internal_breakpoint(site)?;
        }
        Ok(())
    }

    fn explains_stop(&mut self, ctx: &mut PlanContext) -> Result<bool, Error> {
        match ctx.stop_reason() {
            Some(StopReason::Breakpoint { site }) => {
                Ok(self.target_site == Some(site) || self.backstop_site == Some(site))
            }
            _ => Ok(false),
        }
    }

    fn should_stop(&mut self, ctx: &mut PlanContext) -> Result<bool, Error> {
        let pc = ctx.pc()?;
        if pc == self.target {
            self.core.mark_complete(true);
            return Ok(true);
        }
        if let Some(caller) = self.caller_stack_id {
            // backstop hit in the frame we came from: the trampoline went
            // somewhere else entirely
            if ctx.frame_order(&caller)? != FrameComparison::Younger {
                self.core.mark_complete(false);
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn mischief_managed(&mut self, _ctx: &mut PlanContext) -> Result<bool, Error> {
        Ok(self.core.is_complete())
    }
}
