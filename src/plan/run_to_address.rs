use crate::address::RelocatedAddress;
use crate::control::SiteId;
use crate::error::Error;
use crate::plan::{PlanContext, PlanCore, PlanKind, ThreadPlan};
use crate::stop::{StopReason, Vote};
use crate::thread::RunState;

/// Run until the thread reaches a single address.
pub struct RunToAddressPlan {
    core: PlanCore,
    target: RelocatedAddress,
    our_site: Option<SiteId>,
}

impl RunToAddressPlan {
    pub fn new(target: RelocatedAddress) -> Self {
        let mut core = PlanCore::new(PlanKind::RunToAddress);
        core.stop_vote = Vote::Yes;
        Self {
            core,
            target,
            our_site: None,
        }
    }

    /// Helper flavor used by other plans (prologue skip), invisible to the
    /// user.
    pub fn internal(target: RelocatedAddress) -> Self {
        let mut plan = Self::new(target);
        plan.core.private = true;
        plan.core.stop_vote = Vote::NoOpinion;
        plan
    }
}

impl ThreadPlan for RunToAddressPlan {
    fn core(&self) -> &PlanCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut PlanCore {
        &mut self.core
    }

    fn description(&self) -> String {
        format!("run to {}", self.target)
    }

    fn run_state(&self) -> RunState {
        RunState::Running
    }

    fn did_push(&mut self, ctx: &mut PlanContext) -> Result<(), Error> {
        let existing = ctx.control.breakpoint_site_at(self.target);
        if !existing.map(|s| s.enabled).unwrap_or(false) {
            self.our_site = Some(ctx.control.set_internal_breakpoint(self.target)?);
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
                Ok(self.our_site == Some(site) || ctx.pc()? == self.target)
            }
            _ => Ok(false),
        }
    }

    fn should_stop(&mut self, ctx: &mut PlanContext) -> Result<bool, Error> {
        if ctx.pc()? == self.target {
            self.core.mark_complete(true);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn mischief_managed(&mut self, _ctx: &mut PlanContext) -> Result<bool, Error> {
        Ok(self.core.is_complete())
    }
}
