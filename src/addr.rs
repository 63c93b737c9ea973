//! address types for the two address spaces the engine works in.
//!
//! `OrigAddr` is a virtual address in the source image, `NewAddr` a virtual address inside the
//! emitted section. the two never convert implicitly: code outside the transformed range keeps its
//! address, and `NewAddr::from_untouched` is the only bridge between the spaces.
use std::fmt;

/// virtual address in the original image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OrigAddr(u32);

impl OrigAddr {
    pub const fn new(va: u32) -> Self {
        OrigAddr(va)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    pub fn checked_add(self, n: u32) -> Option<Self> {
        self.0.checked_add(n).map(OrigAddr)
    }

    /// distance from `base` to this address, or `None` if it lies below `base`.
    pub fn offset_from(self, base: OrigAddr) -> Option<u32> {
        self.0.checked_sub(base.0)
    }
}

/// virtual address inside the emitted section.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NewAddr(u32);

impl NewAddr {
    pub const fn new(va: u32) -> Self {
        NewAddr(va)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    /// an address outside the transformed range: the image keeps it where it was.
    pub const fn from_untouched(addr: OrigAddr) -> Self {
        NewAddr(addr.0)
    }

    pub fn checked_add(self, n: u32) -> Option<Self> {
        self.0.checked_add(n).map(NewAddr)
    }

    /// signed distance `self - from`, as a branch displacement would see it.
    pub fn displacement_from(self, from: NewAddr) -> i64 {
        self.0 as i64 - from.0 as i64
    }
}

/// half-open range `[begin, end)` of original addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddrRange {
    pub begin: OrigAddr,
    pub end: OrigAddr,
}

impl AddrRange {
    /// returns `None` when `end` precedes `begin`.
    pub fn new(begin: OrigAddr, end: OrigAddr) -> Option<Self> {
        (begin <= end).then_some(AddrRange { begin, end })
    }

    pub fn len(&self) -> u32 {
        self.end.0 - self.begin.0
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    pub fn contains(&self, addr: OrigAddr) -> bool {
        self.begin <= addr && addr < self.end
    }
}

impl fmt::Display for OrigAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl fmt::Display for NewAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl fmt::Display for AddrRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.begin, self.end)
    }
}
