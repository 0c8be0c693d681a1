//! Source line stepping. A range plan keeps the thread single stepping while
//! its program counter stays inside the address ranges of one source line,
//! and decides what to do when execution escapes: a new line in the same
//! function finishes the step, a call is either stepped out of (step over)
//! or presented (step in), trampolines are stepped through.

use crate::address::AddressRange;
use crate::control::Place;
use crate::error::Error;
use crate::muted_error;
use crate::plan::run_to_address::RunToAddressPlan;
use crate::plan::should_stop_here::{ShouldStopHere, StepFlags};
use crate::plan::step_out::StepOutPlan;
use crate::plan::step_through::StepThroughPlan;
use crate::plan::{PlanContext, PlanCore, PlanKind, ThreadPlan};
use crate::stop::{StopReason, Vote};
use crate::thread::RunState;
use crate::unwind::{FrameComparison, StackID};
use regex::Regex;
use smallvec::SmallVec;

/// State shared by the step over and step in flavors of line stepping.
struct RangeCore {
    /// Line table rows already visited for the line being stepped. A single
    /// source line frequently owns several discontiguous ranges.
    ranges: SmallVec<[AddressRange; 2]>,
    start_stack_id: StackID,
    start_place: Place,
    fn_range: Option<AddressRange>,
    /// Set when the plan gave up queueing helper plans and must finish.
    no_more_plans: bool,
}

impl RangeCore {
    /// Snapshot the line and frame the step starts from. `None` when there
    /// is no line information at the current program counter.
    fn capture(ctx: &mut PlanContext) -> Result<Option<RangeCore>, Error> {
        let pc = ctx.pc()?;
        let Some(place) = ctx.control.place(pc) else {
            return Ok(None);
        };
        let mut ranges = SmallVec::new();
        ranges.push(place.range);
        Ok(Some(RangeCore {
            ranges,
            start_stack_id: ctx.stack_id(0)?,
            fn_range: ctx.control.function_range(pc),
            start_place: place,
            no_more_plans: false,
        }))
    }

    /// Whether the thread is still inside the line being stepped. The range
    /// set grows lazily: reaching another row of the same source line, or
    /// landing in the middle of a row (a return into a line, a loop back
    /// edge), extends the step instead of ending it.
    fn in_range(&mut self, ctx: &mut PlanContext) -> Result<bool, Error> {
        let pc = ctx.pc()?;
        if self.ranges.iter().any(|r| r.contains(pc)) {
            return Ok(true);
        }
        if let Some(place) = ctx.control.place(pc) {
            let same_line =
                place.line == self.start_place.line && place.file == self.start_place.file;
            let mid_row = place.range.contains(pc) && pc != place.range.begin;
            if same_line || mid_row {
                log::trace!(target: "stepper", "extend step range with {}", place.range);
                self.ranges.push(place.range);
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Whether the thread is still in the function the step started in.
    fn in_symbol(&self, ctx: &mut PlanContext) -> Result<bool, Error> {
        let pc = ctx.pc()?;
        Ok(self.fn_range.map(|r| r.contains(pc)).unwrap_or(false))
    }

    fn frame_order(&self, ctx: &mut PlanContext) -> Result<FrameComparison, Error> {
        ctx.frame_order(&self.start_stack_id)
    }
}

/// Try to continue through a linker trampoline at the current position.
fn try_step_through(ctx: &mut PlanContext) -> Result<bool, Error> {
    ctx.try_defer(Box::new(StepThroughPlan::new()))
}

/// Step one source line without entering function calls.
pub struct StepOverRangePlan {
    core: PlanCore,
    range: Option<RangeCore>,
    first_resume: bool,
}

impl StepOverRangePlan {
    pub fn new() -> Self {
        Self {
            core: PlanCore::new(PlanKind::StepOverRange),
            range: None,
            first_resume: true,
        }
    }

    fn range_mut(&mut self) -> &mut RangeCore {
        self.range.as_mut().expect("set by validate")
    }
}

impl Default for StepOverRangePlan {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadPlan for StepOverRangePlan {
    fn core(&self) -> &PlanCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut PlanCore {
        &mut self.core
    }

    fn description(&self) -> String {
        match &self.range {
            Some(r) => format!(
                "step over line {}:{} {}",
                r.start_place.file, r.start_place.line, r.start_place.range,
            ),
            None => "step over line".to_string(),
        }
    }

    fn run_state(&self) -> RunState {
        RunState::Stepping
    }

    fn validate(&mut self, ctx: &mut PlanContext) -> Result<bool, Error> {
        self.range = RangeCore::capture(ctx)?;
        Ok(self.range.is_some())
    }

    fn explains_stop(&mut self, ctx: &mut PlanContext) -> Result<bool, Error> {
        Ok(matches!(ctx.stop_reason(), Some(StopReason::Trace)))
    }

    fn should_stop(&mut self, ctx: &mut PlanContext) -> Result<bool, Error> {
        if self.core.is_complete() {
            return Ok(true);
        }
        let mut range = self.range.take().expect("set by validate");
        let result = self.decide(&mut range, ctx);
        self.range = Some(range);
        result
    }

    fn mischief_managed(&mut self, _ctx: &mut PlanContext) -> Result<bool, Error> {
        Ok(self.range_mut().no_more_plans && self.core.is_complete())
    }

    fn is_stale(&mut self, ctx: &mut PlanContext) -> Result<bool, Error> {
        let mut range = self.range.take().expect("set by validate");
        let stale = match range.frame_order(ctx)? {
            FrameComparison::Older => true,
            FrameComparison::Equal => range.in_symbol(ctx)? && !range.in_range(ctx)?,
            FrameComparison::Younger => false,
        };
        self.range = Some(range);
        Ok(stale)
    }

    fn will_resume(
        &mut self,
        ctx: &mut PlanContext,
        state: RunState,
        is_top: bool,
    ) -> Result<bool, Error> {
        if std::mem::take(&mut self.first_resume)
            && is_top
            && state == RunState::Stepping
            && ctx.frames.decrement_inlined_depth()
        {
            // the step only surfaces the next inline level, the thread
            // does not actually move
            self.range_mut().no_more_plans = true;
            self.core.mark_complete(true);
            return Ok(false);
        }
        Ok(true)
    }

    fn should_report_stop(&self) -> Vote {
        if self.core.is_complete() {
            Vote::Yes
        } else {
            Vote::No
        }
    }
}

impl StepOverRangePlan {
    fn decide(&mut self, range: &mut RangeCore, ctx: &mut PlanContext) -> Result<bool, Error> {
        let mut queued = false;
        match range.frame_order(ctx)? {
            FrameComparison::Equal => {
                if range.in_range(ctx)? {
                    return Ok(false);
                }
                if !range.in_symbol(ctx)? {
                    queued = try_step_through(ctx)?;
                }
            }
            FrameComparison::Younger => {
                let caller = muted_error!(ctx.stack_id(1), "caller frame lookup");
                if caller == Some(range.start_stack_id) {
                    // stepped into a call, get back out without reporting
                    queued = ctx.try_defer(Box::new(StepOutPlan::internal(0)))?;
                }
                if !queued {
                    queued = try_step_through(ctx)?;
                }
            }
            FrameComparison::Older => {
                queued = try_step_through(ctx)?;
            }
        }
        if queued {
            return Ok(false);
        }
        range.no_more_plans = true;
        self.core.mark_complete(true);
        Ok(true)
    }
}

/// Step one source line, entering function calls that carry debug
/// information (and stepping past their prologues), while leaving avoided
/// or opaque code via an automatic step out.
pub struct StepInRangePlan {
    core: PlanCore,
    range: Option<RangeCore>,
    policy: ShouldStopHere,
    /// Set when the last resume was faked to surface an inlined callee.
    virtual_step: bool,
}

impl StepInRangePlan {
    pub fn new(flags: StepFlags, avoid: Option<Regex>) -> Self {
        let policy = match avoid {
            Some(re) => ShouldStopHere::with_avoid_regex(flags, re),
            None => ShouldStopHere::new(flags),
        };
        Self {
            core: PlanCore::new(PlanKind::StepInRange),
            range: None,
            policy,
            virtual_step: false,
        }
    }

    fn range_mut(&mut self) -> &mut RangeCore {
        self.range.as_mut().expect("set by validate")
    }
}

impl ThreadPlan for StepInRangePlan {
    fn core(&self) -> &PlanCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut PlanCore {
        &mut self.core
    }

    fn description(&self) -> String {
        match &self.range {
            Some(r) => format!(
                "step into line {}:{} {}",
                r.start_place.file, r.start_place.line, r.start_place.range,
            ),
            None => "step into line".to_string(),
        }
    }

    fn run_state(&self) -> RunState {
        RunState::Stepping
    }

    fn validate(&mut self, ctx: &mut PlanContext) -> Result<bool, Error> {
        self.range = RangeCore::capture(ctx)?;
        Ok(self.range.is_some())
    }

    fn explains_stop(&mut self, ctx: &mut PlanContext) -> Result<bool, Error> {
        match ctx.stop_reason() {
            Some(StopReason::Trace | StopReason::None) | None => {}
            // interrupted by an unrelated event, give the stop back
            _ => self.core.mark_complete(false),
        }
        Ok(true)
    }

    fn should_stop(&mut self, ctx: &mut PlanContext) -> Result<bool, Error> {
        if self.core.is_complete() {
            return Ok(true);
        }
        if std::mem::take(&mut self.virtual_step) {
            self.range_mut().no_more_plans = true;
            self.core.mark_complete(true);
            return Ok(true);
        }
        let mut range = self.range.take().expect("set by validate");
        let result = self.decide(&mut range, ctx);
        self.range = Some(range);
        result
    }

    fn mischief_managed(&mut self, _ctx: &mut PlanContext) -> Result<bool, Error> {
        Ok(self.range_mut().no_more_plans && self.core.is_complete())
    }

    fn is_stale(&mut self, ctx: &mut PlanContext) -> Result<bool, Error> {
        let mut range = self.range.take().expect("set by validate");
        let stale = matches!(range.frame_order(ctx)?, FrameComparison::Older);
        self.range = Some(range);
        Ok(stale)
    }

    fn will_resume(
        &mut self,
        ctx: &mut PlanContext,
        state: RunState,
        is_top: bool,
    ) -> Result<bool, Error> {
        if is_top && state == RunState::Stepping && ctx.frames.decrement_inlined_depth() {
            // stepping into an inlined callee is purely presentational
            self.virtual_step = true;
            return Ok(false);
        }
        Ok(true)
    }

    fn should_report_stop(&self) -> Vote {
        if self.core.is_complete() {
            Vote::Yes
        } else {
            Vote::No
        }
    }
}

impl StepInRangePlan {
    fn decide(&mut self, range: &mut RangeCore, ctx: &mut PlanContext) -> Result<bool, Error> {
        let mut queued = false;
        match range.frame_order(ctx)? {
            FrameComparison::Equal => {
                if range.in_range(ctx)? {
                    return Ok(false);
                }
                if !range.in_symbol(ctx)? {
                    queued = try_step_through(ctx)?;
                }
            }
            FrameComparison::Younger => {
                if let Some(plan) = self.policy.invoke(ctx)? {
                    ctx.defer(plan);
                    queued = true;
                }
                if !queued {
                    queued = self.try_step_past_prologue(ctx)?;
                }
                if !queued {
                    queued = try_step_through(ctx)?;
                }
            }
            FrameComparison::Older => {
                queued = try_step_through(ctx)?;
            }
        }
        if queued {
            return Ok(false);
        }
        range.no_more_plans = true;
        self.core.mark_complete(true);
        Ok(true)
    }

    /// Entering a function lands on its first instruction; run to the end of
    /// the prologue so arguments and locals are already set up when the user
    /// looks at them.
    fn try_step_past_prologue(&mut self, ctx: &mut PlanContext) -> Result<bool, Error> {
        let pc = ctx.pc()?;
        let Some(fn_range) = ctx.control.function_range(pc) else {
            return Ok(false);
        };
        if pc != fn_range.begin {
            return Ok(false);
        }
        let Some(prologue) = ctx.control.prologue_size(pc) else {
            return Ok(false);
        };
        if prologue == 0 {
            return Ok(false);
        }
        let target = fn_range.begin.offset(prologue as isize);
        ctx.try_defer(Box::new(RunToAddressPlan::internal(target)))
    }
}
