use crate::address::RelocatedAddress;
use crate::control::SiteId;
use crate::error::Error;
use crate::plan::{PlanContext, PlanCore, PlanKind, ThreadPlan};
use crate::stop::{StopReason, Vote};
use crate::thread::RunState;
use crate::unwind::{FrameComparison, StackID};
use itertools::Itertools;
use smallvec::SmallVec;

/// Run until one of the given addresses is reached in the starting frame,
/// or until that frame returns. Hits inside deeper activations (recursion,
/// calls) do not count.
pub struct StepUntilPlan {
    core: PlanCore,
    addrs: Vec<RelocatedAddress>,
    sites: SmallVec<[SiteId; 4]>,
    return_addr: RelocatedAddress,
    return_site: Option<SiteId>,
    start_stack_id: Option<StackID>,
}

impl StepUntilPlan {
    pub fn new(addrs: Vec<RelocatedAddress>) -> Self {
        let mut core = PlanCore::new(PlanKind::StepUntil);
        core.stop_vote = Vote::Yes;
        Self {
            core,
            addrs,
            sites: SmallVec::new(),
            return_addr: RelocatedAddress::default(),
            return_site: None,
            start_stack_id: None,
        }
    }
}

impl ThreadPlan for StepUntilPlan {
    fn core(&self) -> &PlanCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut PlanCore {
        &mut self.core
    }

    fn description(&self) -> String {
        let addrs = self.addrs.iter().map(ToString::to_string).join(", ");
        format!("run until one of [{addrs}] or frame return")
    }

    fn run_state(&self) -> RunState {
        RunState::Running
    }

    fn validate(&mut self, ctx: &mut PlanContext) -> Result<bool, Error> {
        if self.addrs.is_empty() {
            return Ok(false);
        }
        ctx.frames.ensure(ctx.control, ctx.tid)?;
        let Ok(caller) = ctx.frames.frame(1) else {
            return Ok(false);
        };
        self.return_addr = caller.pc;
        self.start_stack_id = Some(ctx.frames.frame(0)?.stack_id);
        Ok(true)
    }

    fn did_push(&mut self, ctx: &mut PlanContext) -> Result<(), Error> {
        for &addr in &self.addrs {
            self.sites.push(ctx.control.set_internal_breakpoint(addr)?);
        }
        self.return_site = Some(ctx.control.set_internal_breakpoint(self.return_addr)?);
        Ok(())
    }

    fn will_pop(&mut self, ctx: &mut PlanContext) -> Result<(), Error> {
        for site in self.sites.drain(..) {
            ctx.control.remove_internal_breakpoint(site)?;
        }
        if let Some(site) = self.return_site.take() {
            ctx.control.remove_internal_breakpoint(site)?;
        }
        Ok(())
    }

    fn explains_stop(&mut self, ctx: &mut PlanContext) -> Result<bool, Error> {
        match ctx.stop_reason() {
            Some(StopReason::Breakpoint { site }) => {
                Ok(self.sites.contains(&site) || self.return_site == Some(site))
            }
            _ => Ok(false),
        }
    }

    fn should_stop(&mut self, ctx: &mut PlanContext) -> Result<bool, Error> {
        let Some(StopReason::Breakpoint { site }) = ctx.stop_reason() else {
            return Ok(false);
        };
        let start = self.start_stack_id.expect("set by validate");
        let order = ctx.frame_order(&start)?;
        if self.sites.contains(&site) && order == FrameComparison::Equal {
            self.core.mark_complete(true);
            return Ok(true);
        }
        if self.return_site == Some(site) && order == FrameComparison::Older {
            self.core.mark_complete(true);
            return Ok(true);
        }
        Ok(false)
    }

    fn mischief_managed(&mut self, _ctx: &mut PlanContext) -> Result<bool, Error> {
        Ok(self.core.is_complete())
    }
}
