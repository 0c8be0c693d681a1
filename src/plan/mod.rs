//! Execution control plans.
//!
//! Every stepping operation (single instruction, source line, step out, a
//! function call made on behalf of the user) is expressed as a plan. Plans
//! live on a per thread stack: the plan on top controls how the thread
//! resumes, and when the thread stops each plan gets to say whether the stop
//! belongs to it and whether its work is done. A finished plan moves to the
//! completed list, an abandoned one to the discarded list; the base plan at
//! the bottom of the stack never leaves.

pub mod base;
pub mod call_function;
pub mod range;
pub mod run_to_address;
pub mod should_stop_here;
pub mod step_instruction;
pub mod step_out;
pub mod step_over_breakpoint;
pub mod step_through;
pub mod step_until;

use crate::address::RelocatedAddress;
use crate::control::DebugeeControl;
use crate::error::Error;
use crate::stop::{StopInfo, StopReason, Vote};
use crate::thread::{RunState, ThreadId};
use crate::unwind::{FrameComparison, StackFrameList, StackID};
use bytes::Bytes;
use smallvec::SmallVec;
use std::cell::RefCell;
use std::fmt::Write as _;
use std::fmt::{Display, Formatter};
use std::rc::Rc;
use strum_macros::Display as StrumDisplay;

/// Plan identifier, unique within one thread and stable while the plan
/// moves between the active, completed and discarded lists.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct PlanId(pub u64);

impl Display for PlanId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, StrumDisplay)]
pub enum PlanKind {
    Base,
    StepInstruction,
    StepOverBreakpoint,
    StepOverRange,
    StepInRange,
    StepOut,
    StepThrough,
    StepUntil,
    RunToAddress,
    CallFunction,
}

/// Single step tracer attachable to a plan. When present it logs every
/// private stop and may claim single step traps as its own, suppressing
/// them before any plan unwinding happens.
pub trait PlanTracer {
    fn enabled(&self) -> bool;

    /// Emit a line describing the current position.
    fn log(&mut self, ctx: &mut PlanContext);

    /// Whether this trap belongs to the tracer rather than any plan.
    fn explains_stop(&self, reason: Option<StopReason>) -> bool;
}

pub type SharedTracer = Rc<RefCell<dyn PlanTracer>>;

/// State shared by every plan implementation.
pub struct PlanCore {
    pub kind: PlanKind,
    pub id: PlanId,
    /// Master plans fence the stack: plans above a master may complete or be
    /// discarded, the master itself yields the verdict for all of them.
    pub is_master: bool,
    pub okay_to_discard: bool,
    /// Private plans are invisible to stop reporting.
    pub private: bool,
    /// When set the thread resumes without reporting even if the plan wants
    /// a stop.
    pub auto_continue: bool,
    complete: bool,
    succeeded: bool,
    pub stop_vote: Vote,
    pub run_vote: Vote,
    pub tracer: Option<SharedTracer>,
}

impl PlanCore {
    pub fn new(kind: PlanKind) -> Self {
        Self {
            kind,
            id: PlanId(0),
            is_master: false,
            okay_to_discard: true,
            private: false,
            auto_continue: false,
            complete: false,
            succeeded: false,
            stop_vote: Vote::NoOpinion,
            run_vote: Vote::NoOpinion,
            tracer: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn succeeded(&self) -> bool {
        self.succeeded
    }

    pub fn mark_complete(&mut self, success: bool) {
        self.complete = true;
        self.succeeded = success;
    }
}

/// Everything a plan may touch while the thread machinery consults it:
/// the process control layer, the thread backtrace and the raw stop info.
/// Plans queue follow-up plans through [`PlanContext::defer`]; the thread
/// pushes them once the current consultation returns.
pub struct PlanContext<'a> {
    pub tid: ThreadId,
    pub control: &'a mut dyn DebugeeControl,
    pub frames: &'a mut StackFrameList,
    stop: Option<&'a StopInfo>,
    deferred: Vec<Box<dyn ThreadPlan>>,
}

impl<'a> PlanContext<'a> {
    pub fn new(
        tid: ThreadId,
        control: &'a mut dyn DebugeeControl,
        frames: &'a mut StackFrameList,
        stop: Option<&'a StopInfo>,
    ) -> Self {
        Self {
            tid,
            control,
            frames,
            stop,
            deferred: vec![],
        }
    }

    pub fn pc(&self) -> Result<RelocatedAddress, Error> {
        self.control.pc(self.tid)
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop.map(|s| s.reason)
    }

    pub fn stack_id(&mut self, frame_num: u32) -> Result<StackID, Error> {
        self.frames.ensure(self.control, self.tid)?;
        Ok(self.frames.frame(frame_num)?.stack_id)
    }

    /// Compare the current frame against a frame captured when a plan started.
    pub fn frame_order(&mut self, start: &StackID) -> Result<FrameComparison, Error> {
        let current = self.stack_id(0)?;
        Ok(current.compare(start))
    }

    /// Program counter of the caller frame.
    pub fn return_addr(&mut self) -> Result<RelocatedAddress, Error> {
        self.frames.ensure(self.control, self.tid)?;
        Ok(self.frames.frame(1)?.pc)
    }

    /// Queue a plan to be pushed on the stack after the current plan call
    /// returns.
    pub fn defer(&mut self, plan: Box<dyn ThreadPlan>) {
        self.deferred.push(plan);
    }

    /// Validate a plan and queue it only if it makes sense in the current
    /// thread state.
    pub fn try_defer(&mut self, mut plan: Box<dyn ThreadPlan>) -> Result<bool, Error> {
        if plan.validate(self)? {
            self.deferred.push(plan);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn take_deferred(&mut self) -> Vec<Box<dyn ThreadPlan>> {
        std::mem::take(&mut self.deferred)
    }
}

/// A single execution control plan.
///
/// The thread consults plans bottom-up on resume and top-down on stop, see
/// [`crate::thread::Thread::should_stop`] for the full protocol. Querying
/// methods take the plan mutably: a plan is a little state machine that
/// records what it learned at each stop.
pub trait ThreadPlan {
    fn core(&self) -> &PlanCore;
    fn core_mut(&mut self) -> &mut PlanCore;

    /// Human readable summary for plan stack dumps.
    fn description(&self) -> String;

    /// How this plan wants the thread to move when it controls the resume.
    fn run_state(&self) -> RunState;

    /// Whether the plan makes sense in the current thread state. Called once
    /// before the plan is pushed; an invalid plan is never queued.
    fn validate(&mut self, _ctx: &mut PlanContext) -> Result<bool, Error> {
        Ok(true)
    }

    /// Called right after the plan lands on the stack.
    fn did_push(&mut self, _ctx: &mut PlanContext) -> Result<(), Error> {
        Ok(())
    }

    /// Called right before the plan leaves the stack, whether popped or
    /// discarded. Plans release resources (internal breakpoints) here.
    fn will_pop(&mut self, _ctx: &mut PlanContext) -> Result<(), Error> {
        Ok(())
    }

    /// Does the current stop reason belong to this plan.
    fn explains_stop(&mut self, ctx: &mut PlanContext) -> Result<bool, Error>;

    /// Verdict of the plan about halting the thread. Only consulted when the
    /// plan (or one below it) explains the stop.
    fn should_stop(&mut self, ctx: &mut PlanContext) -> Result<bool, Error>;

    /// True when the plan finished its job at this stop.
    fn mischief_managed(&mut self, ctx: &mut PlanContext) -> Result<bool, Error>;

    /// A stale plan no longer matches reality (the frame it watched is gone)
    /// and is swept from the stack before new work is queued.
    fn is_stale(&mut self, _ctx: &mut PlanContext) -> Result<bool, Error> {
        Ok(false)
    }

    fn should_auto_continue(&mut self, _ctx: &mut PlanContext) -> Result<bool, Error> {
        Ok(self.core().auto_continue)
    }

    /// Prepare for the thread to resume. Returning false vetoes the real
    /// resume: the thread pretends it ran and stopped again (used to surface
    /// inlined frames one at a time).
    fn will_resume(
        &mut self,
        _ctx: &mut PlanContext,
        _state: RunState,
        _is_top: bool,
    ) -> Result<bool, Error> {
        Ok(true)
    }

    /// Called on every plan when the thread publicly stops.
    fn will_stop(&mut self, _ctx: &mut PlanContext) -> Result<(), Error> {
        Ok(())
    }

    fn should_report_stop(&self) -> Vote {
        self.core().stop_vote
    }

    fn should_report_run(&self) -> Vote {
        self.core().run_vote
    }

    /// Result produced by the plan, if any (function call plans).
    fn return_value(&self) -> Option<Bytes> {
        None
    }
}

impl dyn ThreadPlan + '_ {
    pub fn id(&self) -> PlanId {
        self.core().id
    }

    pub fn kind(&self) -> PlanKind {
        self.core().kind
    }

    pub fn is_master(&self) -> bool {
        self.core().is_master
    }

    pub fn okay_to_discard(&self) -> bool {
        self.core().okay_to_discard
    }

    pub fn is_private(&self) -> bool {
        self.core().private
    }

    pub fn is_complete(&self) -> bool {
        self.core().is_complete()
    }

    pub fn succeeded(&self) -> bool {
        self.core().succeeded()
    }
}

/// Per thread plan stack. The base plan occupies the bottom slot for the
/// thread lifetime, so the active list is never empty.
pub struct PlanStack {
    active: SmallVec<[Box<dyn ThreadPlan>; 4]>,
    completed: SmallVec<[Box<dyn ThreadPlan>; 4]>,
    discarded: SmallVec<[Box<dyn ThreadPlan>; 4]>,
    next_id: u64,
}

impl PlanStack {
    pub fn new() -> Self {
        let mut stack = Self {
            active: SmallVec::new(),
            completed: SmallVec::new(),
            discarded: SmallVec::new(),
            next_id: 0,
        };
        let base: Box<dyn ThreadPlan> = Box::new(base::BasePlan::new());
        stack.install(base);
        stack
    }

    fn assign_id(&mut self) -> PlanId {
        let id = PlanId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Put a plan on top of the stack without the push notification.
    fn install(&mut self, mut plan: Box<dyn ThreadPlan>) -> PlanId {
        let id = self.assign_id();
        plan.core_mut().id = id;
        // a plan without its own tracer inherits the one below
        if plan.core().tracer.is_none() {
            if let Some(parent) = self.active.last() {
                plan.core_mut().tracer = parent.core().tracer.clone();
            }
        }
        self.active.push(plan);
        id
    }

    /// Push a plan and notify it.
    pub fn push(
        &mut self,
        plan: Box<dyn ThreadPlan>,
        ctx: &mut PlanContext,
    ) -> Result<PlanId, Error> {
        let id = self.install(plan);
        log::debug!(target: "stepper", "push plan {}: {}", id, self.top().description());
        if let Err(e) = self.active.last_mut().expect("infallible").did_push(ctx) {
            // a plan that failed to arm must not stay on the stack
            let mut plan = self.active.pop().expect("infallible");
            _ = plan.will_pop(ctx);
            self.discarded.push(plan);
            return Err(e);
        }
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn top(&self) -> &dyn ThreadPlan {
        self.active.last().expect("base plan always exists").as_ref()
    }

    pub fn top_mut(&mut self) -> &mut Box<dyn ThreadPlan> {
        self.active.last_mut().expect("base plan always exists")
    }

    pub fn top_id(&self) -> PlanId {
        self.top().id()
    }

    pub fn position(&self, id: PlanId) -> Option<usize> {
        self.active.iter().position(|p| p.id() == id)
    }

    pub fn plan(&self, id: PlanId) -> Option<&dyn ThreadPlan> {
        self.active
            .iter()
            .find(|p| p.id() == id)
            .map(|p| p.as_ref())
    }

    pub fn plan_mut(&mut self, id: PlanId) -> Option<&mut Box<dyn ThreadPlan>> {
        self.active.iter_mut().find(|p| p.id() == id)
    }

    pub fn active_plans(&self) -> &[Box<dyn ThreadPlan>] {
        &self.active
    }

    pub fn active_plans_mut(&mut self) -> &mut [Box<dyn ThreadPlan>] {
        &mut self.active
    }

    pub fn completed_plans(&self) -> &[Box<dyn ThreadPlan>] {
        &self.completed
    }

    pub fn completed_plans_mut(&mut self) -> &mut [Box<dyn ThreadPlan>] {
        &mut self.completed
    }

    pub fn discarded_plans(&self) -> &[Box<dyn ThreadPlan>] {
        &self.discarded
    }

    /// Move the top plan to the completed list. Popping the base plan is a
    /// silent no-op.
    pub fn pop_top(&mut self, ctx: &mut PlanContext) -> Result<(), Error> {
        if self.active.len() <= 1 {
            log::debug!(target: "stepper", "refusing to pop the base plan");
            return Ok(());
        }
        let mut plan = self.active.pop().expect("infallible");
        log::debug!(target: "stepper", "pop plan {}: {}", plan.id(), plan.description());
        plan.will_pop(ctx)?;
        self.completed.push(plan);
        Ok(())
    }

    /// Move the top plan to the discarded list. Discarding the base plan is
    /// a silent no-op.
    pub fn discard_top(&mut self, ctx: &mut PlanContext) -> Result<(), Error> {
        if self.active.len() <= 1 {
            log::debug!(target: "stepper", "refusing to discard the base plan");
            return Ok(());
        }
        let mut plan = self.active.pop().expect("infallible");
        log::debug!(target: "stepper", "discard plan {}: {}", plan.id(), plan.description());
        plan.will_pop(ctx)?;
        self.discarded.push(plan);
        Ok(())
    }

    /// Pop every plan strictly above the given one.
    pub fn pop_above(&mut self, id: PlanId, ctx: &mut PlanContext) -> Result<(), Error> {
        while self.active.len() > 1 && self.top_id() != id {
            self.pop_top(ctx)?;
        }
        Ok(())
    }

    /// Pop every plan above the given one and the plan itself.
    pub fn pop_through(&mut self, id: PlanId, ctx: &mut PlanContext) -> Result<(), Error> {
        self.pop_above(id, ctx)?;
        if self.top_id() == id {
            self.pop_top(ctx)?;
        }
        Ok(())
    }

    /// Discard every plan strictly above the given one.
    pub fn discard_up_to(&mut self, id: PlanId, ctx: &mut PlanContext) -> Result<(), Error> {
        while self.active.len() > 1 && self.top_id() != id {
            self.discard_top(ctx)?;
        }
        Ok(())
    }

    /// Discard plans from the top of the stack.
    ///
    /// With `force` everything above the base plan goes. Without it the
    /// sweep honors master plans: plans above the topmost master are
    /// discarded, then the master itself only if it agreed to be discarded,
    /// and the sweep continues below it. The base plan is a master that
    /// never agrees, which terminates the walk.
    pub fn discard_all(&mut self, force: bool, ctx: &mut PlanContext) -> Result<(), Error> {
        if force {
            while self.active.len() > 1 {
                self.discard_top(ctx)?;
            }
            return Ok(());
        }
        loop {
            let Some(master_idx) = self.active.iter().rposition(|p| p.is_master()) else {
                break;
            };
            let master_id = self.active[master_idx].id();
            self.discard_up_to(master_id, ctx)?;
            if !self.active[master_idx].okay_to_discard() {
                break;
            }
            if master_idx == 0 {
                break;
            }
            self.discard_top(ctx)?;
        }
        Ok(())
    }

    /// The plan logically below the given one. Completed plans sit above the
    /// active stack in pop order: the first popped plan was the old top, and
    /// the plan below the earliest popped one is the current active top.
    pub fn previous_of(&self, id: PlanId) -> Option<&dyn ThreadPlan> {
        if let Some(idx) = self.completed.iter().position(|p| p.id() == id) {
            return if idx > 0 {
                Some(self.completed[idx - 1].as_ref())
            } else {
                Some(self.top())
            };
        }
        let idx = self.position(id)?;
        if idx > 0 {
            Some(self.active[idx - 1].as_ref())
        } else {
            None
        }
    }

    /// Forget completed and discarded plans, called when the thread resumes.
    pub fn clear_history(&mut self) {
        self.completed.clear();
        self.discarded.clear();
    }

    /// Tear down the whole stack, base plan included. Valid only while the
    /// owning thread is being destroyed.
    pub fn clear(&mut self, ctx: &mut PlanContext) {
        while let Some(mut plan) = self.active.pop() {
            muted_error_will_pop(&mut plan, ctx);
        }
        self.completed.clear();
        self.discarded.clear();
    }

    pub fn dump(&self) -> String {
        let mut out = String::new();
        _ = writeln!(out, "active plans:");
        for (i, plan) in self.active.iter().enumerate().rev() {
            _ = writeln!(
                out,
                "  [{i}] {kind} (id {id}): {descr}",
                kind = plan.kind(),
                id = plan.id(),
                descr = plan.description(),
            );
        }
        if !self.completed.is_empty() {
            _ = writeln!(out, "completed plans:");
            for plan in &self.completed {
                _ = writeln!(
                    out,
                    "  {kind} (id {id}): {descr}",
                    kind = plan.kind(),
                    id = plan.id(),
                    descr = plan.description(),
                );
            }
        }
        if !self.discarded.is_empty() {
            _ = writeln!(out, "discarded plans:");
            for plan in &self.discarded {
                _ = writeln!(
                    out,
                    "  {kind} (id {id}): {descr}",
                    kind = plan.kind(),
                    id = plan.id(),
                    descr = plan.description(),
                );
            }
        }
        out
    }
}

impl Default for PlanStack {
    fn default() -> Self {
        Self::new()
    }
}

fn muted_error_will_pop(plan: &mut Box<dyn ThreadPlan>, ctx: &mut PlanContext) {
    if let Err(e) = plan.will_pop(ctx) {
        log::debug!(target: "stepper", "plan teardown: {e:#}");
    }
}
