use crate::address::RelocatedAddress;
use crate::error::Error;
use crate::plan::step_out::StepOutPlan;
use crate::plan::{PlanContext, PlanCore, PlanKind, ThreadPlan};
use crate::stop::StopReason;
use crate::thread::RunState;
use crate::unwind::{FrameComparison, StackID};

/// Step exactly one machine instruction. With `step_over` set, a call
/// instruction is stepped across by planting a step out of the callee.
pub struct StepInstructionPlan {
    core: PlanCore,
    step_over: bool,
    start_pc: RelocatedAddress,
    start_stack_id: Option<StackID>,
}

impl StepInstructionPlan {
    pub fn new(step_over: bool) -> Self {
        Self {
            core: PlanCore::new(PlanKind::StepInstruction),
            step_over,
            start_pc: RelocatedAddress::default(),
            start_stack_id: None,
        }
    }
}

impl ThreadPlan for StepInstructionPlan {
    fn core(&self) -> &PlanCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut PlanCore {
        &mut self.core
    }

    fn description(&self) -> String {
        if self.step_over {
            format!("step one instruction over calls from {}", self.start_pc)
        } else {
            format!("step one instruction from {}", self.start_pc)
        }
    }

    fn run_state(&self) -> RunState {
        RunState::Stepping
    }

    fn validate(&mut self, ctx: &mut PlanContext) -> Result<bool, Error> {
        self.start_pc = ctx.pc()?;
        self.start_stack_id = Some(ctx.stack_id(0)?);
        Ok(true)
    }

    fn explains_stop(&mut self, ctx: &mut PlanContext) -> Result<bool, Error> {
        Ok(matches!(ctx.stop_reason(), Some(StopReason::Trace)))
    }

    fn should_stop(&mut self, ctx: &mut PlanContext) -> Result<bool, Error> {
        if !self.step_over {
            self.core.mark_complete(true);
            return Ok(true);
        }
        let start = self.start_stack_id.expect("set by validate");
        if ctx.frame_order(&start)? == FrameComparison::Younger {
            // stepped into a call, get back out and try again
            ctx.try_defer(Box::new(StepOutPlan::internal(0)))?;
            Ok(false)
        } else {
            self.core.mark_complete(true);
            Ok(true)
        }
    }

    fn mischief_managed(&mut self, _ctx: &mut PlanContext) -> Result<bool, Error> {
        Ok(self.core.is_complete())
    }
}
