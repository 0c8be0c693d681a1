use crate::control::SiteId;
use crate::plan::PlanId;
use crate::thread::{RunState, ThreadId};
use bytes::Bytes;
use nix::sys::signal::Signal;
use strum_macros::Display;

/// Opinion of a plan (or thread) about whether a stop or a resume should be
/// reported to the user. Later opinions override `NoOpinion` only.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
pub enum Vote {
    Yes,
    No,
    NoOpinion,
}

impl Vote {
    /// Combine with a subordinate vote: `self` wins unless it has no opinion.
    pub fn combine(self, other: Vote) -> Vote {
        match self {
            Vote::NoOpinion => other,
            _ => self,
        }
    }
}

/// Why a thread halted.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StopReason {
    /// Thread did not stop for a reason of its own (another thread did).
    None,
    /// Single instruction step completed.
    Trace,
    Breakpoint { site: SiteId },
    Watchpoint { id: u32 },
    Signal(Signal),
    Exception,
    /// A plan finished and claimed the stop.
    PlanComplete { plan: PlanId },
}

/// Interpretation of a stop for one thread, valid for a single stop generation.
#[derive(Clone, Debug)]
pub struct StopInfo {
    pub reason: StopReason,
    pub tid: ThreadId,
    valid: bool,
    /// Decision made during synchronous breakpoint callbacks, before the plan
    /// machinery runs. `None` until a callback decides.
    sync_should_stop: Option<bool>,
    pub description: Option<String>,
    /// Present for function call plan completions.
    pub return_value: Option<Bytes>,
}

impl StopInfo {
    fn new(tid: ThreadId, reason: StopReason) -> Self {
        Self {
            reason,
            tid,
            valid: true,
            sync_should_stop: None,
            description: None,
            return_value: None,
        }
    }

    pub fn with_breakpoint(tid: ThreadId, site: SiteId) -> Self {
        Self::new(tid, StopReason::Breakpoint { site })
    }

    pub fn with_watchpoint(tid: ThreadId, id: u32) -> Self {
        Self::new(tid, StopReason::Watchpoint { id })
    }

    pub fn with_signal(tid: ThreadId, signal: Signal) -> Self {
        Self::new(tid, StopReason::Signal(signal))
    }

    pub fn with_exception(tid: ThreadId, description: Option<String>) -> Self {
        let mut info = Self::new(tid, StopReason::Exception);
        info.description = description;
        info
    }

    pub fn trace(tid: ThreadId) -> Self {
        Self::new(tid, StopReason::Trace)
    }

    pub fn none(tid: ThreadId) -> Self {
        Self::new(tid, StopReason::None)
    }

    pub fn from_reason(tid: ThreadId, reason: StopReason) -> Self {
        Self::new(tid, reason)
    }

    pub fn with_plan(tid: ThreadId, plan: PlanId, description: String) -> Self {
        let mut info = Self::new(tid, StopReason::PlanComplete { plan });
        info.description = Some(description);
        info
    }

    pub fn set_sync_should_stop(&mut self, should_stop: bool) {
        self.sync_should_stop = Some(should_stop);
    }

    /// Verdict of synchronous callbacks, defaulting to stop when none ran.
    pub fn should_stop_synchronous(&self) -> bool {
        self.sync_should_stop.unwrap_or(true)
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn make_valid(&mut self) {
        self.valid = true;
    }

    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    /// Called when the owning thread is about to resume with the given state.
    /// Resets per-stop callback decisions so a reused stop info does not carry
    /// a stale verdict.
    pub fn will_resume(&mut self, _state: RunState) {
        self.sync_should_stop = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vote_combine_respects_priority() {
        assert_eq!(Vote::Yes.combine(Vote::No), Vote::Yes);
        assert_eq!(Vote::No.combine(Vote::Yes), Vote::No);
        assert_eq!(Vote::NoOpinion.combine(Vote::No), Vote::No);
        assert_eq!(Vote::NoOpinion.combine(Vote::NoOpinion), Vote::NoOpinion);
    }

    #[test]
    fn stop_info_sync_decision_resets_on_resume() {
        let mut info = StopInfo::with_breakpoint(ThreadId::new(1), SiteId(7));
        assert!(info.should_stop_synchronous());
        info.set_sync_should_stop(false);
        assert!(!info.should_stop_synchronous());
        info.will_resume(RunState::Running);
        assert!(info.should_stop_synchronous());
    }

    #[test]
    fn stop_info_validity() {
        let mut info = StopInfo::trace(ThreadId::new(1));
        assert!(info.is_valid());
        info.invalidate();
        assert!(!info.is_valid());
        info.make_valid();
        assert!(info.is_valid());
    }
}
