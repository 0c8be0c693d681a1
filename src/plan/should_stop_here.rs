//! Policy deciding whether a freshly reached location is a good place to
//! present to the user, and if not, which follow-up plan moves past it.

use crate::error::Error;
use crate::plan::step_out::StepOutPlan;
use crate::plan::{PlanContext, ThreadPlan};
use regex::Regex;

/// Behavior switches for stepping plans.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct StepFlags(u32);

impl StepFlags {
    /// Do not present frames that have no debug information, step out of
    /// them instead.
    pub const AVOID_NO_DEBUG: StepFlags = StepFlags(1);

    pub fn contains(&self, flag: StepFlags) -> bool {
        self.0 & flag.0 == flag.0
    }

    pub fn insert(&mut self, flag: StepFlags) {
        self.0 |= flag.0;
    }

    pub fn remove(&mut self, flag: StepFlags) {
        self.0 &= !flag.0;
    }
}

pub type ShouldStopHereCallback =
    Box<dyn FnMut(&mut PlanContext, StepFlags) -> Result<Option<Box<dyn ThreadPlan>>, Error>>;

/// A stepping plan consults this policy when it lands somewhere new. `None`
/// means stop here; a plan means keep going by running that plan first.
pub struct ShouldStopHere {
    callback: ShouldStopHereCallback,
    pub flags: StepFlags,
}

impl ShouldStopHere {
    pub fn new(flags: StepFlags) -> Self {
        Self {
            callback: Box::new(default_callback(None)),
            flags,
        }
    }

    /// Default policy extended with a pattern of function names to step past.
    pub fn with_avoid_regex(flags: StepFlags, avoid: Regex) -> Self {
        Self {
            callback: Box::new(default_callback(Some(avoid))),
            flags,
        }
    }

    pub fn with_callback(flags: StepFlags, callback: ShouldStopHereCallback) -> Self {
        Self { callback, flags }
    }

    pub fn invoke(&mut self, ctx: &mut PlanContext) -> Result<Option<Box<dyn ThreadPlan>>, Error> {
        (self.callback)(ctx, self.flags)
    }
}

/// Stop everywhere except code without debug information (when asked to
/// avoid it) and functions matching the avoid pattern, which are left by
/// stepping out.
fn default_callback(
    avoid: Option<Regex>,
) -> impl FnMut(&mut PlanContext, StepFlags) -> Result<Option<Box<dyn ThreadPlan>>, Error> {
    move |ctx: &mut PlanContext, flags: StepFlags| {
        let pc = ctx.pc()?;
        let mut leave = false;
        if flags.contains(StepFlags::AVOID_NO_DEBUG) && !ctx.control.has_debug_info(pc) {
            log::debug!(target: "stepper", "no debug info at {pc}, stepping out");
            leave = true;
        }
        if !leave {
            if let (Some(re), Some(fn_name)) = (avoid.as_ref(), ctx.control.function_name(pc)) {
                if re.is_match(&fn_name) {
                    log::debug!(target: "stepper", "function `{fn_name}` is avoided, stepping out");
                    leave = true;
                }
            }
        }
        if !leave {
            return Ok(None);
        }
        let mut step_out: Box<dyn ThreadPlan> = Box::new(StepOutPlan::internal(0));
        if step_out.validate(ctx)? {
            Ok(Some(step_out))
        } else {
            Ok(None)
        }
    }
}
