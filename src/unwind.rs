use crate::address::RelocatedAddress;
use crate::control::DebugeeControl;
use crate::error::Error;
use crate::thread::ThreadId;
use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

/// A single unwound frame as produced by the process control layer.
#[derive(Clone, Copy, Debug)]
pub struct FrameSnapshot {
    pub pc: RelocatedAddress,
    /// Canonical frame address. Grows towards older frames on a descending stack.
    pub cfa: RelocatedAddress,
    /// True if this frame was synthesized from inlined function information
    /// rather than a real call.
    pub inlined: bool,
}

/// Frame identity that survives re-unwinding: two stack ids compare equal
/// iff they denote the same activation record.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct StackID(RelocatedAddress);

impl StackID {
    pub fn new(cfa: RelocatedAddress) -> Self {
        StackID(cfa)
    }

    /// How `self` relates to `other` in call stack age.
    /// A bigger canonical frame address means an older frame.
    pub fn compare(&self, other: &StackID) -> FrameComparison {
        match self.0.cmp(&other.0) {
            Ordering::Less => FrameComparison::Younger,
            Ordering::Equal => FrameComparison::Equal,
            Ordering::Greater => FrameComparison::Older,
        }
    }
}

impl Display for StackID {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of comparing the current frame against a frame captured earlier.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FrameComparison {
    /// Current frame is deeper in the call stack (a call happened).
    Younger,
    /// Same activation record.
    Equal,
    /// Current frame is shallower (a return happened).
    Older,
}

#[derive(Clone, Copy, Debug)]
pub struct StackFrame {
    pub num: u32,
    pub pc: RelocatedAddress,
    pub stack_id: StackID,
}

/// Lazily fetched backtrace of a thread, invalidated on every resume.
#[derive(Default, Debug)]
pub struct StackFrameList {
    frames: Vec<StackFrame>,
    fetched: bool,
    inlined_depth: u32,
}

impl StackFrameList {
    /// Unwind if not already done for the current stop.
    pub fn ensure(&mut self, control: &mut dyn DebugeeControl, tid: ThreadId) -> Result<(), Error> {
        if self.fetched {
            return Ok(());
        }
        let snapshots = control.unwind(tid)?;
        if snapshots.is_empty() {
            return Err(Error::EmptyBacktrace(tid));
        }
        self.frames = snapshots
            .iter()
            .enumerate()
            .map(|(num, snap)| StackFrame {
                num: num as u32,
                pc: snap.pc,
                stack_id: StackID::new(snap.cfa),
            })
            .collect();
        self.fetched = true;
        self.inlined_depth = Self::calculate_inlined_depth(&snapshots);
        Ok(())
    }

    fn calculate_inlined_depth(snapshots: &[FrameSnapshot]) -> u32 {
        snapshots.iter().take_while(|s| s.inlined).count() as u32
    }

    pub fn frame(&self, num: u32) -> Result<&StackFrame, Error> {
        self.frames
            .get(num as usize)
            .ok_or(Error::FrameNotFound(num))
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// How many inline expansions sit above the concrete frame at the
    /// current program counter.
    pub fn current_inlined_depth(&self) -> u32 {
        self.inlined_depth
    }

    /// Step the presentation one inline level up. Returns true when a level
    /// was consumed, in which case the thread has not really moved and the
    /// resume must be faked.
    pub fn decrement_inlined_depth(&mut self) -> bool {
        if self.inlined_depth > 0 {
            self.inlined_depth -= 1;
            true
        } else {
            false
        }
    }

    pub fn invalidate(&mut self) {
        self.frames.clear();
        self.fetched = false;
        self.inlined_depth = 0;
    }
}
