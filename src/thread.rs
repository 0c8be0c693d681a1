//! Per thread execution control state and the stop decision procedure.

use crate::address::RelocatedAddress;
use crate::control::{DebugeeControl, RegisterSnapshot, StopId};
use crate::error::Error;
use crate::plan::call_function::CallFunctionPlan;
use crate::plan::range::{StepInRangePlan, StepOverRangePlan};
use crate::plan::run_to_address::RunToAddressPlan;
use crate::plan::should_stop_here::StepFlags;
use crate::plan::step_instruction::StepInstructionPlan;
use crate::plan::step_out::StepOutPlan;
use crate::plan::step_over_breakpoint::StepOverBreakpointPlan;
use crate::plan::step_until::StepUntilPlan;
use crate::plan::{PlanContext, PlanId, PlanKind, PlanStack, SharedTracer, ThreadPlan};
use crate::stop::{StopInfo, StopReason, Vote};
use crate::unwind::StackFrameList;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use regex::Regex;
use std::fmt::{Display, Formatter};
use strum_macros::Display as StrumDisplay;

/// Operating system thread identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ThreadId(pub Pid);

impl ThreadId {
    pub fn new(raw: i32) -> Self {
        ThreadId(Pid::from_raw(raw))
    }
}

impl Display for ThreadId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a thread is doing, or is about to do on the next resume.
#[derive(Clone, Copy, PartialEq, Eq, Debug, StrumDisplay)]
pub enum RunState {
    Invalid,
    Stopped,
    Running,
    Stepping,
    /// Excluded from the next resume.
    Suspended,
    Crashed,
}

/// Saved thread state for speculative operations (function calls made on the
/// user's behalf), restored if the operation goes sideways.
pub struct ThreadCheckpoint {
    stop_info: Option<StopInfo>,
    stop_info_stop_id: StopId,
    regs: RegisterSnapshot,
}

/// A single debugee thread as the stepping engine sees it: its plan stack,
/// its interpretation of the last stop and its cached backtrace.
pub struct Thread {
    pub id: ThreadId,
    /// Small per-session ordinal used in user facing output.
    pub index_id: u32,
    state: RunState,
    resume_state: RunState,
    /// The state the thread was actually resumed with last time, which may
    /// differ from `resume_state` when a plan overrode it.
    temporary_resume_state: RunState,
    resume_signal: Option<Signal>,
    stack: PlanStack,
    stop_info: Option<StopInfo>,
    stop_info_stop_id: StopId,
    frames: StackFrameList,
    prev_frames: StackFrameList,
    destroy_called: bool,
}

impl Thread {
    pub fn new(id: ThreadId, index_id: u32) -> Self {
        Self {
            id,
            index_id,
            state: RunState::Stopped,
            resume_state: RunState::Running,
            temporary_resume_state: RunState::Running,
            resume_signal: None,
            stack: PlanStack::new(),
            stop_info: None,
            stop_info_stop_id: StopId(0),
            frames: StackFrameList::default(),
            prev_frames: StackFrameList::default(),
            destroy_called: false,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn resume_state(&self) -> RunState {
        self.resume_state
    }

    pub fn set_resume_state(&mut self, state: RunState) {
        self.resume_state = state;
    }

    pub fn resume_signal(&self) -> Option<Signal> {
        self.resume_signal
    }

    /// Deliver this signal to the thread on the next resume.
    pub fn set_resume_signal(&mut self, signal: Option<Signal>) {
        self.resume_signal = signal;
    }

    pub fn plans(&self) -> &PlanStack {
        &self.stack
    }

    pub fn frames(&mut self, control: &mut dyn DebugeeControl) -> Result<&StackFrameList, Error> {
        self.frames.ensure(control, self.id)?;
        Ok(&self.frames)
    }

    pub fn dump_plans(&self) -> String {
        self.stack.dump()
    }

    /// Attach a single step tracer to the plan currently on top. Plans
    /// queued later inherit it.
    pub fn set_tracer(&mut self, tracer: Option<SharedTracer>) {
        self.stack.top_mut().core_mut().tracer = tracer;
    }

    /// Make sure the cached stop info reflects the current stop generation,
    /// recomputing it from the raw reason when it went stale.
    fn refresh_stop_info(&mut self, control: &mut dyn DebugeeControl) -> Result<(), Error> {
        let stop_id = control.stop_id();
        let cached_ok = self
            .stop_info
            .as_ref()
            .map(|i| i.is_valid())
            .unwrap_or(false)
            && self.stop_info_stop_id == stop_id;
        if !cached_ok {
            let reason = control.raw_stop_reason(self.id)?;
            self.stop_info = Some(StopInfo::from_reason(self.id, reason));
            self.stop_info_stop_id = stop_id;
        }
        Ok(())
    }

    /// The stop interpretation to report for this thread. A finished plan
    /// outranks the raw operating system reason: stepping that ends on a
    /// breakpoint instruction is still a completed step.
    pub fn stop_info(&mut self, control: &mut dyn DebugeeControl) -> Result<StopInfo, Error> {
        let completed = self
            .stack
            .completed_plans()
            .iter()
            .rev()
            .find(|p| !p.is_private() && p.succeeded());
        if let Some(plan) = completed {
            let mut info = StopInfo::with_plan(self.id, plan.id(), plan.description());
            info.return_value = plan.return_value();
            return Ok(info);
        }
        // a fenced master that finished but stayed on the stack owns the
        // stop as well
        let top = self.stack.top();
        if self.stack.len() > 1 && top.is_complete() && top.succeeded() && !top.is_private() {
            let mut info = StopInfo::with_plan(self.id, top.id(), top.description());
            info.return_value = top.return_value();
            return Ok(info);
        }
        self.refresh_stop_info(control)?;
        Ok(self.stop_info.clone().expect("refreshed above"))
    }

    /// Decide whether this thread halts the debugee.
    ///
    /// The stop is first offered to the plan stack top down until some plan
    /// claims it; that plan gives the initial verdict. A plan that finished
    /// moves to the completed list and the plans underneath get to amend the
    /// verdict, except that a master plan that refused discarding fences the
    /// walk. When only the base plan claims the stop, plans that no longer
    /// match the call stack are swept away.
    pub fn should_stop(&mut self, control: &mut dyn DebugeeControl) -> Result<bool, Error> {
        if matches!(
            self.temporary_resume_state,
            RunState::Suspended | RunState::Invalid
        ) || matches!(self.resume_state, RunState::Suspended | RunState::Invalid)
        {
            return Ok(false);
        }
        self.refresh_stop_info(control)?;
        if let Some(info) = &self.stop_info {
            if !info.should_stop_synchronous() {
                return Ok(false);
            }
        }

        let Thread {
            id,
            stack,
            frames,
            stop_info,
            ..
        } = self;
        let mut ctx = PlanContext::new(*id, control, frames, stop_info.as_ref());
        log::debug!(target: "stepper", "thread {id} stop decision, {}", stack.dump());

        // the inlined depth of frame zero must be re-derived per stop
        ctx.frames.ensure(ctx.control, ctx.tid)?;

        // the tracer logs every private stop, whatever comes of it
        let tracer = stack.top().core().tracer.clone();
        if let Some(tracer) = &tracer {
            let mut tracer = tracer.borrow_mut();
            if tracer.enabled() {
                tracer.log(&mut ctx);
            }
        }

        // find the plan that explains the stop: the top is authoritative,
        // otherwise a single step trap may belong to the tracer, otherwise
        // walk down
        let mut explaining = None;
        let mut cursor = Some(stack.top_id());
        while let Some(cur) = cursor {
            let plan = stack.plan_mut(cur).expect("cursor is on the stack");
            if plan.explains_stop(&mut ctx)? {
                explaining = Some(cur);
                break;
            }
            if cur == stack.top_id() {
                if let Some(tracer) = &tracer {
                    if tracer.borrow().explains_stop(ctx.stop_reason()) {
                        Self::flush_deferred(stack, &mut ctx)?;
                        return Ok(false);
                    }
                }
            }
            let pos = stack.position(cur).expect("cursor is on the stack");
            cursor = (pos > 0).then(|| stack.active_plans()[pos - 1].id());
        }
        let explaining = explaining.expect("base plan explains any stop");

        let (mut should_stop, mut auto_continue, managed, keep_master) = {
            let plan = stack.plan_mut(explaining).expect("still on the stack");
            let verdict = plan.should_stop(&mut ctx)?;
            let auto_continue = plan.should_auto_continue(&mut ctx)?;
            let managed = plan.mischief_managed(&mut ctx)?;
            let keep_master = plan.is_master() && !plan.okay_to_discard();
            (verdict, auto_continue, managed, keep_master)
        };

        let mut done = true;
        if managed {
            if should_stop {
                // plans retiring with a stop verdict get a last notification
                let mut cursor = Some(stack.top_id());
                while let Some(cur) = cursor {
                    let last = cur == explaining;
                    if !(last && keep_master) {
                        let pos = stack.position(cur).expect("cursor is on the stack");
                        stack
                            .plan_mut(cur)
                            .expect("cursor is on the stack")
                            .will_stop(&mut ctx)?;
                        cursor = (pos > 0).then(|| stack.active_plans()[pos - 1].id());
                    }
                    if last {
                        break;
                    }
                }
            }
            if keep_master {
                // the master stays on top with its verdict pending, only the
                // plans it spawned retire
                stack.pop_above(explaining, &mut ctx)?;
            } else {
                stack.pop_through(explaining, &mut ctx)?;
            }
            done = false;
        }

        // the plans underneath amend the verdict of a finished plan
        if !done {
            if stack.len() > 1 {
                auto_continue = stack.top_mut().should_auto_continue(&mut ctx)?;
            }
            loop {
                if stack.len() == 1 {
                    break;
                }
                let (verdict, managed, fenced) = {
                    let top = stack.top_mut();
                    let verdict = top.should_stop(&mut ctx)?;
                    let managed = top.mischief_managed(&mut ctx)?;
                    let fenced = top.is_master() && !top.okay_to_discard();
                    (verdict, managed, fenced)
                };
                should_stop = verdict;
                if !managed {
                    break;
                }
                if fenced && verdict {
                    // a master that wants to stop and refuses discarding
                    // stays on the stack, its verdict is final
                    break;
                }
                if should_stop {
                    stack.top_mut().will_stop(&mut ctx)?;
                }
                stack.pop_top(&mut ctx)?;
            }
        }

        if should_stop && auto_continue {
            log::debug!(target: "stepper", "plan auto continue overrides the stop");
            should_stop = false;
        }

        // on a stop verdict, a plan whose goal was reached behind its back
        // takes everything above it down with it
        if should_stop {
            let mut lowest_stale = None;
            for plan in stack.active_plans_mut().iter_mut().skip(1) {
                let stale = crate::weak_error!(plan.is_stale(&mut ctx), "stale plan check")
                    .unwrap_or(false);
                if stale {
                    lowest_stale = Some(plan.id());
                    break;
                }
            }
            if let Some(stale_id) = lowest_stale {
                log::debug!(target: "stepper", "sweep stale plans from {stale_id}");
                stack.discard_up_to(stale_id, &mut ctx)?;
                stack.discard_top(&mut ctx)?;
            }
        }

        Self::flush_deferred(stack, &mut ctx)?;
        Ok(should_stop)
    }

    /// A thread that stopped because some other thread halted the debugee
    /// has no stop reason of its own.
    fn stopped_for_a_reason(&self) -> bool {
        matches!(&self.stop_info, Some(info) if info.reason != StopReason::None)
    }

    /// Opinion on reporting this stop to the user. Finished plans speak
    /// first; suspended threads and threads without their own stop reason
    /// abstain.
    pub fn should_report_stop(&self) -> Vote {
        if matches!(
            self.temporary_resume_state,
            RunState::Suspended | RunState::Invalid
        ) || matches!(self.resume_state, RunState::Suspended | RunState::Invalid)
            || !self.stopped_for_a_reason()
        {
            return Vote::NoOpinion;
        }
        let mut plan = match self.stack.completed_plans().last() {
            Some(completed) => completed.as_ref(),
            None => self.stack.top(),
        };
        let mut vote = plan.should_report_stop();
        while vote == Vote::NoOpinion {
            match self.stack.previous_of(plan.id()) {
                Some(prev) => {
                    vote = prev.should_report_stop();
                    plan = prev;
                }
                None => break,
            }
        }
        vote
    }

    /// Opinion on reporting the upcoming resume to the user.
    pub fn should_report_run(&self) -> Vote {
        if matches!(
            self.temporary_resume_state,
            RunState::Suspended | RunState::Invalid
        ) || matches!(self.resume_state, RunState::Suspended | RunState::Invalid)
            || !self.stopped_for_a_reason()
        {
            return Vote::NoOpinion;
        }
        let mut plan = match self.stack.completed_plans().last() {
            Some(completed) => completed.as_ref(),
            None => self.stack.top(),
        };
        let mut vote = plan.should_report_run();
        while vote == Vote::NoOpinion {
            match self.stack.previous_of(plan.id()) {
                Some(prev) => {
                    vote = prev.should_report_run();
                    plan = prev;
                }
                None => break,
            }
        }
        vote
    }

    /// Runs before every resume. A thread sitting on an enabled breakpoint
    /// site cannot just continue (it would hit the site again without
    /// moving), so a private step over breakpoint plan goes on top first.
    pub fn setup_for_resume(&mut self, control: &mut dyn DebugeeControl) -> Result<(), Error> {
        if matches!(self.resume_state, RunState::Suspended) {
            return Ok(());
        }
        let pc = control.pc(self.id)?;
        let Some(site) = control.breakpoint_site_at(pc) else {
            return Ok(());
        };
        if !site.enabled {
            return Ok(());
        }
        if self.stack.top().kind() == PlanKind::StepOverBreakpoint {
            return Ok(());
        }
        let stepping = self.stack.top().run_state() == RunState::Stepping;
        let mut plan = Box::new(StepOverBreakpointPlan::new(site));
        // a plain continue runs on after clearing the site, a step does not
        plan.core_mut().auto_continue = !stepping;
        let Thread {
            id,
            stack,
            frames,
            stop_info,
            ..
        } = self;
        let mut ctx = PlanContext::new(*id, control, frames, stop_info.as_ref());
        stack.push(plan, &mut ctx)?;
        Ok(())
    }

    /// Prepare the thread to resume with the given state. Returns false when
    /// the resume must be faked: a plan decided the thread should appear to
    /// run and stop without the debugee moving (inlined stepping).
    pub fn will_resume(
        &mut self,
        control: &mut dyn DebugeeControl,
        state: RunState,
    ) -> Result<bool, Error> {
        self.temporary_resume_state = state;
        self.stack.clear_history();
        if let Some(info) = &mut self.stop_info {
            if info.is_valid() && self.stop_info_stop_id == control.stop_id() {
                info.will_resume(state);
            }
        }

        let Thread {
            id,
            stack,
            frames,
            stop_info,
            stop_info_stop_id,
            ..
        } = self;
        let mut ctx = PlanContext::new(*id, control, frames, stop_info.as_ref());
        let mut need_resume = true;
        let mut cursor = Some(stack.top_id());
        let mut is_top = true;
        while let Some(cur) = cursor {
            let pos = stack.position(cur).expect("cursor is on the stack");
            let plan = stack.plan_mut(cur).expect("cursor is on the stack");
            let need = plan.will_resume(&mut ctx, state, is_top)?;
            if is_top {
                need_resume = need;
            }
            is_top = false;
            cursor = (pos > 0).then(|| stack.active_plans()[pos - 1].id());
        }
        Self::flush_deferred(stack, &mut ctx)?;
        let stop_id = ctx.control.stop_id();
        drop(ctx);

        if need_resume {
            // the interpretation of the previous stop dies here, a new one
            // is computed at the next stop
            *stop_info = None;
        } else {
            // faked resume: the thread pretends it single stepped and
            // trapped again without the debugee moving
            *stop_info = Some(StopInfo::trace(*id));
            *stop_info_stop_id = stop_id;
        }
        Ok(need_resume)
    }

    /// Runs after the thread actually resumed.
    pub fn did_resume(&mut self) {
        self.resume_signal = None;
        std::mem::swap(&mut self.prev_frames, &mut self.frames);
        self.frames.invalidate();
        self.state = self.temporary_resume_state;
    }

    /// Runs when the debugee publicly stops.
    pub fn did_stop(&mut self, control: &mut dyn DebugeeControl) -> Result<(), Error> {
        self.state = RunState::Stopped;
        let Thread {
            id,
            stack,
            frames,
            stop_info,
            ..
        } = self;
        let mut ctx = PlanContext::new(*id, control, frames, stop_info.as_ref());
        let mut cursor = Some(stack.top_id());
        while let Some(cur) = cursor {
            let pos = stack.position(cur).expect("cursor is on the stack");
            stack
                .plan_mut(cur)
                .expect("cursor is on the stack")
                .will_stop(&mut ctx)?;
            cursor = (pos > 0).then(|| stack.active_plans()[pos - 1].id());
        }
        Ok(())
    }

    pub fn checkpoint(
        &mut self,
        control: &mut dyn DebugeeControl,
    ) -> Result<ThreadCheckpoint, Error> {
        Ok(ThreadCheckpoint {
            stop_info: self.stop_info.clone(),
            stop_info_stop_id: self.stop_info_stop_id,
            regs: control.read_registers(self.id)?,
        })
    }

    pub fn restore_checkpoint(
        &mut self,
        checkpoint: ThreadCheckpoint,
        control: &mut dyn DebugeeControl,
    ) -> Result<(), Error> {
        control.write_registers(self.id, &checkpoint.regs)?;
        self.stop_info = checkpoint.stop_info;
        if let Some(info) = &mut self.stop_info {
            info.make_valid();
        }
        self.stop_info_stop_id = checkpoint.stop_info_stop_id;
        self.frames.invalidate();
        Ok(())
    }

    /// Queue a plan on this thread. The plan is validated against the
    /// current thread state first and rejected (returning `None`) when it
    /// cannot work, leaving the stack untouched.
    pub fn queue_plan(
        &mut self,
        mut plan: Box<dyn ThreadPlan>,
        abort_others: bool,
        control: &mut dyn DebugeeControl,
    ) -> Result<Option<PlanId>, Error> {
        let Thread {
            id,
            stack,
            frames,
            stop_info,
            ..
        } = self;
        let mut ctx = PlanContext::new(*id, control, frames, stop_info.as_ref());
        if !plan.validate(&mut ctx)? {
            log::debug!(target: "stepper", "plan rejected: {}", plan.description());
            return Ok(None);
        }
        if abort_others {
            stack.discard_all(true, &mut ctx)?;
        }
        let plan_id = stack.push(plan, &mut ctx)?;
        Self::flush_deferred(stack, &mut ctx)?;
        Ok(Some(plan_id))
    }

    pub fn queue_step_single_instruction(
        &mut self,
        step_over: bool,
        abort_others: bool,
        control: &mut dyn DebugeeControl,
    ) -> Result<Option<PlanId>, Error> {
        self.queue_plan(
            Box::new(StepInstructionPlan::new(step_over)),
            abort_others,
            control,
        )
    }

    pub fn queue_step_over_line(
        &mut self,
        abort_others: bool,
        control: &mut dyn DebugeeControl,
    ) -> Result<Option<PlanId>, Error> {
        self.queue_plan(Box::new(StepOverRangePlan::new()), abort_others, control)
    }

    pub fn queue_step_into_line(
        &mut self,
        flags: StepFlags,
        avoid: Option<Regex>,
        abort_others: bool,
        control: &mut dyn DebugeeControl,
    ) -> Result<Option<PlanId>, Error> {
        self.queue_plan(
            Box::new(StepInRangePlan::new(flags, avoid)),
            abort_others,
            control,
        )
    }

    pub fn queue_step_out(
        &mut self,
        frame_idx: u32,
        abort_others: bool,
        control: &mut dyn DebugeeControl,
    ) -> Result<Option<PlanId>, Error> {
        self.queue_plan(Box::new(StepOutPlan::new(frame_idx)), abort_others, control)
    }

    pub fn queue_step_until(
        &mut self,
        addrs: Vec<RelocatedAddress>,
        abort_others: bool,
        control: &mut dyn DebugeeControl,
    ) -> Result<Option<PlanId>, Error> {
        self.queue_plan(Box::new(StepUntilPlan::new(addrs)), abort_others, control)
    }

    pub fn queue_run_to_address(
        &mut self,
        addr: RelocatedAddress,
        abort_others: bool,
        control: &mut dyn DebugeeControl,
    ) -> Result<Option<PlanId>, Error> {
        self.queue_plan(Box::new(RunToAddressPlan::new(addr)), abort_others, control)
    }

    pub fn queue_call_function(
        &mut self,
        func: RelocatedAddress,
        arg: u64,
        discard_on_error: bool,
        abort_others: bool,
        control: &mut dyn DebugeeControl,
    ) -> Result<Option<PlanId>, Error> {
        self.queue_plan(
            Box::new(CallFunctionPlan::new(func, arg, discard_on_error)),
            abort_others,
            control,
        )
    }

    /// Drop plans from the stack, with `force` everything above the base.
    pub fn discard_plans(
        &mut self,
        force: bool,
        control: &mut dyn DebugeeControl,
    ) -> Result<(), Error> {
        let Thread {
            id,
            stack,
            frames,
            stop_info,
            ..
        } = self;
        let mut ctx = PlanContext::new(*id, control, frames, stop_info.as_ref());
        stack.discard_all(force, &mut ctx)
    }

    /// Tear the thread down: every plan (the base included) releases its
    /// resources. Must run before the thread is dropped.
    pub fn destroy(&mut self, control: &mut dyn DebugeeControl) {
        let Thread {
            id, stack, frames, ..
        } = self;
        let mut ctx = PlanContext::new(*id, control, frames, None);
        stack.clear(&mut ctx);
        drop(ctx);
        self.stop_info = None;
        self.frames.invalidate();
        self.prev_frames.invalidate();
        self.state = RunState::Invalid;
        self.destroy_called = true;
    }

    fn flush_deferred(stack: &mut PlanStack, ctx: &mut PlanContext) -> Result<(), Error> {
        loop {
            let deferred = ctx.take_deferred();
            if deferred.is_empty() {
                return Ok(());
            }
            for plan in deferred {
                stack.push(plan, ctx)?;
            }
        }
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            assert!(self.destroy_called, "thread dropped without destroy");
        }
    }
}
