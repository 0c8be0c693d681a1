//! Scriptable fake process control layer for exercising stop decisions
//! without a live tracee.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Once;

use stepline::address::{AddressRange, RelocatedAddress};
use stepline::control::{
    BreakpointSite, DebugeeControl, Place, RegisterSnapshot, SiteId, StopId,
};
use stepline::error::Error;
use stepline::stop::StopReason;
use stepline::thread::ThreadId;
use stepline::unwind::FrameSnapshot;

pub const TID: i32 = 1000;

pub fn tid() -> ThreadId {
    ThreadId::new(TID)
}

/// One frame of a scripted backtrace: `(pc, cfa)`.
pub type MockFrame = (usize, usize);

pub struct MockDebugee {
    stop_id: u64,
    pc: usize,
    frames: Vec<MockFrame>,
    /// How many of the youngest frames are inline expansions.
    inline_depth: usize,
    reason: StopReason,
    sites: HashMap<u32, (usize, bool, bool)>,
    next_site: u32,
    regs: Vec<u8>,
    places: Vec<Place>,
    fn_ranges: Vec<AddressRange>,
    fn_names: Vec<(AddressRange, String)>,
    no_debug: Vec<AddressRange>,
    prologues: HashMap<usize, usize>,
    trampolines: HashMap<usize, usize>,
}

static LOG_INIT: Once = Once::new();

impl MockDebugee {
    pub fn new() -> Self {
        LOG_INIT.call_once(|| {
            _ = env_logger::builder().is_test(true).try_init();
        });
        Self {
            stop_id: 0,
            pc: 0,
            frames: vec![],
            inline_depth: 0,
            reason: StopReason::None,
            sites: HashMap::new(),
            next_site: 0,
            regs: vec![0; 16],
            places: vec![],
            fn_ranges: vec![],
            fn_names: vec![],
            no_debug: vec![],
            prologues: HashMap::new(),
            trampolines: HashMap::new(),
        }
    }

    /// Script the position the thread stopped at: program counter, stop
    /// reason and the backtrace (youngest first).
    pub fn stop_at(&mut self, pc: usize, reason: StopReason, frames: Vec<MockFrame>) {
        self.stop_id += 1;
        self.pc = pc;
        self.reason = reason;
        self.frames = frames;
        self.inline_depth = 0;
    }

    /// Like [`Self::stop_at`], with the youngest `inline_depth` frames
    /// synthesized from inlined function information.
    pub fn stop_at_inlined(
        &mut self,
        pc: usize,
        reason: StopReason,
        frames: Vec<MockFrame>,
        inline_depth: usize,
    ) {
        self.stop_at(pc, reason, frames);
        self.inline_depth = inline_depth;
    }

    pub fn add_user_site(&mut self, addr: usize) -> SiteId {
        let id = self.next_site;
        self.next_site += 1;
        self.sites.insert(id, (addr, true, false));
        SiteId(id)
    }

    pub fn add_place(&mut self, file: &str, line: u64, begin: usize, end: usize) {
        self.places.push(Place {
            file: file.to_string(),
            line,
            range: AddressRange::new(begin, end),
        });
    }

    pub fn add_fn_range(&mut self, begin: usize, end: usize) {
        self.fn_ranges.push(AddressRange::new(begin, end));
    }

    pub fn add_fn_name(&mut self, begin: usize, end: usize, name: &str) {
        self.fn_names
            .push((AddressRange::new(begin, end), name.to_string()));
    }

    pub fn mark_no_debug_info(&mut self, begin: usize, end: usize) {
        self.no_debug.push(AddressRange::new(begin, end));
    }

    pub fn set_prologue(&mut self, fn_begin: usize, size: usize) {
        self.prologues.insert(fn_begin, size);
    }

    pub fn add_trampoline(&mut self, stub: usize, target: usize) {
        self.trampolines.insert(stub, target);
    }

    pub fn site_exists(&self, id: SiteId) -> bool {
        self.sites.contains_key(&id.0)
    }

    pub fn site_enabled(&self, id: SiteId) -> bool {
        self.sites.get(&id.0).map(|s| s.1).unwrap_or(false)
    }

    pub fn internal_site_count(&self) -> usize {
        self.sites.values().filter(|s| s.2).count()
    }
}

impl DebugeeControl for MockDebugee {
    fn stop_id(&self) -> StopId {
        StopId(self.stop_id)
    }

    fn raw_stop_reason(&mut self, _tid: ThreadId) -> Result<StopReason, Error> {
        Ok(self.reason)
    }

    fn pc(&self, _tid: ThreadId) -> Result<RelocatedAddress, Error> {
        Ok(self.pc.into())
    }

    fn set_pc(&mut self, _tid: ThreadId, addr: RelocatedAddress) -> Result<(), Error> {
        self.pc = addr.as_usize();
        Ok(())
    }

    fn sp(&self, _tid: ThreadId) -> Result<RelocatedAddress, Error> {
        Ok(self.frames.first().map(|f| f.1).unwrap_or_default().into())
    }

    fn read_registers(&self, _tid: ThreadId) -> Result<RegisterSnapshot, Error> {
        Ok(RegisterSnapshot(bytes::Bytes::copy_from_slice(&self.regs)))
    }

    fn write_registers(&mut self, _tid: ThreadId, regs: &RegisterSnapshot) -> Result<(), Error> {
        self.regs = regs.0.to_vec();
        Ok(())
    }

    fn read_memory(&self, _addr: RelocatedAddress, len: usize) -> Result<bytes::Bytes, Error> {
        Ok(bytes::Bytes::from(vec![0; len]))
    }

    fn write_memory(&mut self, _addr: RelocatedAddress, _data: &[u8]) -> Result<(), Error> {
        Ok(())
    }

    fn breakpoint_site_at(&self, addr: RelocatedAddress) -> Option<BreakpointSite> {
        self.sites
            .iter()
            .find(|(_, (a, _, _))| *a == addr.as_usize())
            .map(|(id, (a, enabled, internal))| BreakpointSite {
                id: SiteId(*id),
                addr: (*a).into(),
                enabled: *enabled,
                internal: *internal,
            })
    }

    fn enable_breakpoint_site(&mut self, id: SiteId) -> Result<(), Error> {
        let site = self.sites.get_mut(&id.0).ok_or(Error::SiteNotFound(id))?;
        site.1 = true;
        Ok(())
    }

    fn disable_breakpoint_site(&mut self, id: SiteId) -> Result<(), Error> {
        let site = self.sites.get_mut(&id.0).ok_or(Error::SiteNotFound(id))?;
        site.1 = false;
        Ok(())
    }

    fn set_internal_breakpoint(&mut self, addr: RelocatedAddress) -> Result<SiteId, Error> {
        let id = self.next_site;
        self.next_site += 1;
        self.sites.insert(id, (addr.as_usize(), true, true));
        Ok(SiteId(id))
    }

    fn remove_internal_breakpoint(&mut self, id: SiteId) -> Result<(), Error> {
        self.sites.remove(&id.0).ok_or(Error::SiteNotFound(id))?;
        Ok(())
    }

    fn unwind(&mut self, _tid: ThreadId) -> Result<Vec<FrameSnapshot>, Error> {
        Ok(self
            .frames
            .iter()
            .enumerate()
            .map(|(num, &(pc, cfa))| FrameSnapshot {
                pc: pc.into(),
                cfa: cfa.into(),
                inlined: num < self.inline_depth,
            })
            .collect())
    }

    fn has_debug_info(&self, pc: RelocatedAddress) -> bool {
        !self.no_debug.iter().any(|r| r.contains(pc))
    }

    fn function_name(&self, pc: RelocatedAddress) -> Option<String> {
        self.fn_names
            .iter()
            .find(|(r, _)| r.contains(pc))
            .map(|(_, name)| name.clone())
    }

    fn place(&self, pc: RelocatedAddress) -> Option<Place> {
        self.places.iter().find(|p| p.range.contains(pc)).cloned()
    }

    fn function_range(&self, pc: RelocatedAddress) -> Option<AddressRange> {
        self.fn_ranges.iter().find(|r| r.contains(pc)).copied()
    }

    fn prologue_size(&self, pc: RelocatedAddress) -> Option<usize> {
        let range = self.function_range(pc)?;
        self.prologues.get(&range.begin.as_usize()).copied()
    }

    fn trampoline_target(&self, pc: RelocatedAddress) -> Option<RelocatedAddress> {
        self.trampolines.get(&pc.as_usize()).map(|&t| t.into())
    }

    fn prepare_call(
        &mut self,
        _tid: ThreadId,
        func: RelocatedAddress,
        _arg: u64,
        _return_to: RelocatedAddress,
    ) -> Result<(), Error> {
        self.pc = func.as_usize();
        Ok(())
    }
}
