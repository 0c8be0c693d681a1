use crate::address::{AddressRange, RelocatedAddress};
use crate::error::Error;
use crate::stop::StopReason;
use crate::thread::ThreadId;
use crate::unwind::FrameSnapshot;
use bytes::Bytes;
use std::fmt::{Display, Formatter};

/// Monotonic counter incremented on every public stop of the debugee.
/// Cached per-thread state (stop info, frames) is valid only for the stop
/// generation it was computed at.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub struct StopId(pub u64);

impl Display for StopId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Breakpoint site identifier, assigned by the process control layer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SiteId(pub u32);

impl Display for SiteId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A source position with the address range of its line table row.
#[derive(Clone, Debug)]
pub struct Place {
    pub file: String,
    pub line: u64,
    pub range: AddressRange,
}

/// Description of a breakpoint site as seen by the stepping engine.
#[derive(Clone, Copy, Debug)]
pub struct BreakpointSite {
    pub id: SiteId,
    pub addr: RelocatedAddress,
    pub enabled: bool,
    /// Internal sites are owned by plans and never reported to the user.
    pub internal: bool,
}

/// Saved general purpose register file, opaque to the stepping engine.
#[derive(Clone, Debug, PartialEq)]
pub struct RegisterSnapshot(pub Bytes);

/// The services a stepping engine needs from the underlying debugger:
/// thread registers and memory, breakpoint sites, unwinding and a minimal
/// slice of debug information (line table and function boundaries).
///
/// Methods that take a program counter consult debug information and are
/// allowed to answer `None` when it is absent for that address.
pub trait DebugeeControl {
    /// Current stop generation.
    fn stop_id(&self) -> StopId;

    /// The reason the thread halted, as reported by the operating system,
    /// before any plan interpretation.
    fn raw_stop_reason(&mut self, tid: ThreadId) -> Result<StopReason, Error>;

    fn pc(&self, tid: ThreadId) -> Result<RelocatedAddress, Error>;
    fn set_pc(&mut self, tid: ThreadId, addr: RelocatedAddress) -> Result<(), Error>;
    fn sp(&self, tid: ThreadId) -> Result<RelocatedAddress, Error>;

    fn read_registers(&self, tid: ThreadId) -> Result<RegisterSnapshot, Error>;
    fn write_registers(&mut self, tid: ThreadId, regs: &RegisterSnapshot) -> Result<(), Error>;

    fn read_memory(&self, addr: RelocatedAddress, len: usize) -> Result<Bytes, Error>;
    fn write_memory(&mut self, addr: RelocatedAddress, data: &[u8]) -> Result<(), Error>;

    fn breakpoint_site_at(&self, addr: RelocatedAddress) -> Option<BreakpointSite>;
    fn enable_breakpoint_site(&mut self, id: SiteId) -> Result<(), Error>;
    fn disable_breakpoint_site(&mut self, id: SiteId) -> Result<(), Error>;

    /// Install an internal (plan owned) breakpoint, returning its site.
    fn set_internal_breakpoint(&mut self, addr: RelocatedAddress) -> Result<SiteId, Error>;
    fn remove_internal_breakpoint(&mut self, id: SiteId) -> Result<(), Error>;

    /// Unwind the call stack of a thread, youngest frame first.
    fn unwind(&mut self, tid: ThreadId) -> Result<Vec<FrameSnapshot>, Error>;

    /// Whether debug information exists for code at this address.
    fn has_debug_info(&self, _pc: RelocatedAddress) -> bool {
        true
    }

    fn function_name(&self, pc: RelocatedAddress) -> Option<String>;

    /// The line table row covering this address.
    fn place(&self, pc: RelocatedAddress) -> Option<Place>;

    /// Address range of the function containing this address.
    fn function_range(&self, pc: RelocatedAddress) -> Option<AddressRange>;

    /// Size in bytes of the prologue of the function containing this address.
    fn prologue_size(&self, pc: RelocatedAddress) -> Option<usize>;

    /// If `pc` is the start of a linker trampoline (PLT stub or similar),
    /// the address the trampoline dispatches to.
    fn trampoline_target(&self, pc: RelocatedAddress) -> Option<RelocatedAddress>;

    /// Rewrite thread state so that on next resume it executes `func(arg)`
    /// and returns to `return_to`.
    fn prepare_call(
        &mut self,
        tid: ThreadId,
        func: RelocatedAddress,
        arg: u64,
        return_to: RelocatedAddress,
    ) -> Result<(), Error>;
}
