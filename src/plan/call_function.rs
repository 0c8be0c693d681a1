use crate::address::RelocatedAddress;
use crate::control::{RegisterSnapshot, SiteId};
use crate::error::Error;
use crate::plan::{PlanContext, PlanCore, PlanKind, ThreadPlan};
use crate::stop::{StopReason, Vote};
use crate::thread::RunState;
use bytes::Bytes;

/// Execute a function in the debugee on behalf of the user: rewrite the
/// thread to call `func(arg)`, run until it returns to an internal
/// breakpoint, then restore the saved register file. A master plan, so the
/// helper plans it spawns never leak their verdicts past it.
pub struct CallFunctionPlan {
    core: PlanCore,
    func: RelocatedAddress,
    arg: u64,
    /// On error (signal or exception inside the call) unwind the call and
    /// carry on, instead of leaving the broken frame up for inspection.
    discard_on_error: bool,
    return_to: RelocatedAddress,
    return_site: Option<SiteId>,
    saved_regs: Option<RegisterSnapshot>,
    return_value: Option<Bytes>,
}

impl CallFunctionPlan {
    pub fn new(func: RelocatedAddress, arg: u64, discard_on_error: bool) -> Self {
        let mut core = PlanCore::new(PlanKind::CallFunction);
        core.is_master = true;
        core.okay_to_discard = discard_on_error;
        core.stop_vote = Vote::Yes;
        Self {
            core,
            func,
            arg,
            discard_on_error,
            return_to: RelocatedAddress::default(),
            return_site: None,
            saved_regs: None,
            return_value: None,
        }
    }

    /// Undo everything the call changed: capture the raw register file as
    /// the return value carrier on success, restore saved registers, drop
    /// the return breakpoint.
    fn take_down(&mut self, ctx: &mut PlanContext, success: bool) -> Result<(), Error> {
        if success {
            let after = ctx.control.read_registers(ctx.tid)?;
            self.return_value = Some(after.0);
        }
        if let Some(saved) = self.saved_regs.take() {
            ctx.control.write_registers(ctx.tid, &saved)?;
        }
        if let Some(site) = self.return_site.take() {
            ctx.control.remove_internal_breakpoint(site)?;
        }
        Ok(())
    }
}

impl ThreadPlan for CallFunctionPlan {
    fn core(&self) -> &PlanCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut PlanCore {
        &mut self.core
    }

    fn description(&self) -> String {
        format!("call function {}({:#x})", self.func, self.arg)
    }

    fn run_state(&self) -> RunState {
        RunState::Running
    }

    fn validate(&mut self, ctx: &mut PlanContext) -> Result<bool, Error> {
        self.saved_regs = Some(ctx.control.read_registers(ctx.tid)?);
        self.return_to = ctx.pc()?;
        Ok(true)
    }

    fn did_push(&mut self, ctx: &mut PlanContext) -> Result<(), Error> {
        ctx.control
            .prepare_call(ctx.tid, self.func, self.arg, self.return_to)?;
        self.return_site = Some(ctx.control.set_internal_breakpoint(self.return_to)?);
        Ok(())
    }

    fn will_pop(&mut self, ctx: &mut PlanContext) -> Result<(), Error> {
        if self.saved_regs.is_some() || self.return_site.is_some() {
            // discarded mid-call, put the thread back together
            self.take_down(ctx, false)?;
        }
        Ok(())
    }

    fn explains_stop(&mut self, ctx: &mut PlanContext) -> Result<bool, Error> {
        match ctx.stop_reason() {
            Some(StopReason::Breakpoint { site }) => Ok(self.return_site == Some(site)),
            Some(StopReason::Signal(_) | StopReason::Exception) => Ok(true),
            _ => Ok(false),
        }
    }

    fn should_stop(&mut self, ctx: &mut PlanContext) -> Result<bool, Error> {
        match ctx.stop_reason() {
            Some(StopReason::Breakpoint { site }) if self.return_site == Some(site) => {
                self.take_down(ctx, true)?;
                self.core.mark_complete(true);
                Ok(true)
            }
            Some(StopReason::Signal(_) | StopReason::Exception) => {
                if self.discard_on_error {
                    self.take_down(ctx, false)?;
                    self.core.mark_complete(false);
                } else {
                    // leave the broken call frame up so it can be inspected
                    log::warn!(target: "stepper", "function call interrupted, frame left on stack");
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn mischief_managed(&mut self, _ctx: &mut PlanContext) -> Result<bool, Error> {
        Ok(self.core.is_complete())
    }

    fn return_value(&self) -> Option<Bytes> {
        self.return_value.clone()
    }
}
