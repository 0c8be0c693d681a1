use std::fmt::{Display, Formatter};

/// Address in the debugee virtual address space.
/// All stepping logic operates on load addresses; mapping to and from object
/// file addresses is a debug information concern and happens outside this crate.
#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub struct RelocatedAddress(usize);

impl RelocatedAddress {
    pub fn offset(self, offset: isize) -> RelocatedAddress {
        if offset >= 0 {
            self.0 + offset as usize
        } else {
            self.0 - offset.unsigned_abs()
        }
        .into()
    }

    pub fn as_u64(self) -> u64 {
        u64::from(self)
    }

    pub fn as_usize(self) -> usize {
        usize::from(self)
    }
}

impl From<usize> for RelocatedAddress {
    fn from(addr: usize) -> Self {
        RelocatedAddress(addr)
    }
}

impl From<u64> for RelocatedAddress {
    fn from(addr: u64) -> Self {
        RelocatedAddress(addr as usize)
    }
}

impl From<RelocatedAddress> for usize {
    fn from(addr: RelocatedAddress) -> Self {
        addr.0
    }
}

impl From<RelocatedAddress> for u64 {
    fn from(addr: RelocatedAddress) -> Self {
        addr.0 as u64
    }
}

impl Display for RelocatedAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&format!("{:#016X}", self.0))
    }
}

/// Half-open address interval `[begin, end)`.
#[derive(Clone, Copy, Hash, PartialEq, Eq, Debug)]
pub struct AddressRange {
    pub begin: RelocatedAddress,
    pub end: RelocatedAddress,
}

impl AddressRange {
    pub fn new(begin: impl Into<RelocatedAddress>, end: impl Into<RelocatedAddress>) -> Self {
        Self {
            begin: begin.into(),
            end: end.into(),
        }
    }

    pub fn contains(&self, addr: RelocatedAddress) -> bool {
        addr >= self.begin && addr < self.end
    }

    pub fn is_empty(&self) -> bool {
        self.begin >= self.end
    }

    pub fn size(&self) -> usize {
        self.end.as_usize().saturating_sub(self.begin.as_usize())
    }
}

impl Display for AddressRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}; {})", self.begin, self.end)
    }
}
