use crate::address::RelocatedAddress;
use crate::control::{BreakpointSite, SiteId};
use crate::error::Error;
use crate::plan::{PlanContext, PlanCore, PlanKind, ThreadPlan};
use crate::stop::StopReason;
use crate::thread::RunState;

/// Move the thread off a breakpoint it is currently sitting on: disable the
/// site, single step one instruction, re-enable. Queued automatically when a
/// thread resumes with its program counter on an enabled site.
pub struct StepOverBreakpointPlan {
    core: PlanCore,
    site: SiteId,
    bp_addr: RelocatedAddress,
    reenabled: bool,
}

impl StepOverBreakpointPlan {
    pub fn new(site: BreakpointSite) -> Self {
        let mut core = PlanCore::new(PlanKind::StepOverBreakpoint);
        core.private = true;
        core.auto_continue = true;
        Self {
            core,
            site: site.id,
            bp_addr: site.addr,
            reenabled: false,
        }
    }

    pub fn breakpoint_addr(&self) -> RelocatedAddress {
        self.bp_addr
    }

    fn reenable(&mut self, ctx: &mut PlanContext) -> Result<(), Error> {
        if !self.reenabled {
            ctx.control.enable_breakpoint_site(self.site)?;
            self.reenabled = true;
        }
        Ok(())
    }
}

impl ThreadPlan for StepOverBreakpointPlan {
    fn core(&self) -> &PlanCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut PlanCore {
        &mut self.core
    }

    fn description(&self) -> String {
        format!("step over breakpoint site {} at {}", self.site, self.bp_addr)
    }

    fn run_state(&self) -> RunState {
        RunState::Stepping
    }

    fn will_resume(
        &mut self,
        ctx: &mut PlanContext,
        _state: RunState,
        is_top: bool,
    ) -> Result<bool, Error> {
        if is_top {
            ctx.control.disable_breakpoint_site(self.site)?;
            self.reenabled = false;
        }
        Ok(true)
    }

    fn will_pop(&mut self, ctx: &mut PlanContext) -> Result<(), Error> {
        // a discarded plan must leave the site armed
        self.reenable(ctx)
    }

    fn explains_stop(&mut self, ctx: &mut PlanContext) -> Result<bool, Error> {
        match ctx.stop_reason() {
            Some(StopReason::Trace) => Ok(true),
            Some(StopReason::Breakpoint { site }) => Ok(site == self.site),
            _ => Ok(false),
        }
    }

    fn should_stop(&mut self, _ctx: &mut PlanContext) -> Result<bool, Error> {
        Ok(false)
    }

    fn mischief_managed(&mut self, ctx: &mut PlanContext) -> Result<bool, Error> {
        let pc = ctx.pc()?;
        if pc != self.bp_addr {
            self.reenable(ctx)?;
            self.core.mark_complete(true);
            Ok(true)
        } else {
            Ok(false)
        }
    }
}
