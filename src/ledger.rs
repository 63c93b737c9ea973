//! address relocation ledger.
//!
//! every byte field of the emitted buffer whose value depends on where something ended up is a
//! site in the ledger. the emitter places owners (instructions, continuation jumps, table slots)
//! and blocks, records sites with their symbolic targets, then `resolve_all` patches each site
//! exactly once.
use crate::addr::{NewAddr, OrigAddr};
use crate::cfg::{BlockId, InsnId, SlotId, Target};
use crate::cipher::Cipher;
use crate::decoder::Width;
use crate::error::RelocationError;
use std::collections::{HashMap, HashSet};
use std::fmt;

/// what a site's bytes belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SiteOwner {
    Insn(InsnId),
    /// the `jmp` appended after a block whose fallthrough the layout does not satisfy.
    Continuation(BlockId),
    Slot(SlotId),
}

/// a field inside its owner's encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Site {
    pub owner: SiteOwner,
    pub offset: u32,
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.owner {
            SiteOwner::Insn(id) => write!(f, "site {}+{}", id, self.offset),
            SiteOwner::Continuation(id) => write!(f, "site {}.cont+{}", id, self.offset),
            SiteOwner::Slot(id) => write!(f, "site {}+{}", id, self.offset),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelocTarget {
    Flow(Target),
    /// address of a jump table slot.
    Slot(SlotId),
}

impl fmt::Display for RelocTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelocTarget::Flow(target) => write!(f, "{}", target),
            RelocTarget::Slot(slot) => write!(f, "{}", slot),
        }
    }
}

/// how the resolved address is written into the field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelocKind {
    /// signed displacement from the end of the field.
    Relative { width: Width },
    /// 32-bit absolute address.
    Absolute,
    /// 32-bit absolute address stored in a jump table slot.
    TableSlot,
    /// 32-bit absolute address stored enciphered.
    Encoded(Cipher),
}

impl RelocKind {
    pub fn field_len(&self) -> u32 {
        match self {
            RelocKind::Relative { width: Width::Short } => 1,
            _ => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocationEntry {
    pub site: Site,
    pub target: RelocTarget,
    pub kind: RelocKind,
}

#[derive(Debug, Clone, Default)]
pub struct RelocationLedger {
    base: NewAddr,
    entries: Vec<RelocationEntry>,
    recorded: HashSet<Site>,
    owners: HashMap<SiteOwner, (u32, u32)>,
    blocks: HashMap<BlockId, u32>,
    moved: HashMap<OrigAddr, NewAddr>,
}

impl RelocationLedger {
    /// an empty ledger for a buffer mapped at `base`.
    pub fn new(base: NewAddr) -> Self {
        RelocationLedger {
            base,
            ..Default::default()
        }
    }

    pub fn base(&self) -> NewAddr {
        self.base
    }

    pub fn entries(&self) -> &[RelocationEntry] {
        &self.entries
    }

    pub fn record(
        &mut self,
        site: Site,
        target: RelocTarget,
        kind: RelocKind,
    ) -> Result<(), RelocationError> {
        if !self.recorded.insert(site) {
            return Err(RelocationError::DuplicateSite(site));
        }
        self.entries.push(RelocationEntry { site, target, kind });
        Ok(())
    }

    /// notes that the instruction originally at `original` now starts at `new_address`.
    pub fn retarget(&mut self, original: OrigAddr, new_address: NewAddr) {
        self.moved.insert(original, new_address);
    }

    /// where the instruction originally at `original` was emitted, if it was.
    pub fn address_of(&self, original: OrigAddr) -> Option<NewAddr> {
        self.moved.get(&original).copied()
    }

    /// places an owner's encoding at `offset` of the buffer.
    pub fn place(&mut self, owner: SiteOwner, offset: u32, len: u32) {
        self.owners.insert(owner, (offset, len));
    }

    pub fn place_block(&mut self, block: BlockId, offset: u32) {
        self.blocks.insert(block, offset);
    }

    fn at(&self, offset: u32) -> Option<NewAddr> {
        self.base.checked_add(offset)
    }

    /// address a target resolves to. external targets keep their original address.
    pub fn resolve(&self, target: &RelocTarget) -> Option<NewAddr> {
        match target {
            RelocTarget::Flow(Target::External(addr)) => Some(NewAddr::from_untouched(*addr)),
            RelocTarget::Flow(Target::Block(id)) => self.at(*self.blocks.get(id)?),
            RelocTarget::Slot(slot) => self.at(self.owners.get(&SiteOwner::Slot(*slot))?.0),
        }
    }

    /// buffer offset of a site's field.
    fn site_offset(
        &self,
        entry: &RelocationEntry,
        buffer_len: usize,
    ) -> Result<usize, RelocationError> {
        let site = entry.site;
        let &(start, len) = self
            .owners
            .get(&site.owner)
            .ok_or(RelocationError::UnplacedSite(site))?;
        let field_end = site.offset as u64 + entry.kind.field_len() as u64;
        if field_end > len as u64 || start as u64 + field_end > buffer_len as u64 {
            return Err(RelocationError::SiteOutOfBounds(site));
        }
        Ok((start + site.offset) as usize)
    }

    /// patches every recorded site in `buffer`.
    ///
    /// # returns
    /// the number of sites written.
    pub fn resolve_all(&self, buffer: &mut [u8]) -> Result<usize, RelocationError> {
        let end = self.base.get() as u64 + buffer.len() as u64;
        if end > u32::MAX as u64 + 1 {
            return Err(RelocationError::AddressSpace);
        }

        for entry in &self.entries {
            let site = entry.site;
            let offset = self.site_offset(entry, buffer.len())?;
            let target = self
                .resolve(&entry.target)
                .ok_or(RelocationError::DanglingTarget {
                    site,
                    target: entry.target,
                })?;

            let internal = !matches!(entry.target, RelocTarget::Flow(Target::External(_)));
            if internal && (target < self.base || target.get() as u64 >= end) {
                return Err(RelocationError::TargetOutOfBounds {
                    site,
                    target: target.get(),
                });
            }

            match &entry.kind {
                RelocKind::Relative { width } => {
                    let field_end = self
                        .at((offset as u32) + entry.kind.field_len())
                        .ok_or(RelocationError::AddressSpace)?;
                    let value = target.displacement_from(field_end);
                    match width {
                        Width::Short => {
                            let disp = i8::try_from(value)
                                .map_err(|_| RelocationError::Overflow { site, value })?;
                            buffer[offset] = disp as u8;
                        }
                        Width::Near => {
                            // wraps like the cpu does
                            let disp = value as i32;
                            buffer[offset..offset + 4].copy_from_slice(&disp.to_le_bytes());
                        }
                    }
                }
                RelocKind::Absolute | RelocKind::TableSlot => {
                    buffer[offset..offset + 4].copy_from_slice(&target.get().to_le_bytes());
                }
                RelocKind::Encoded(cipher) => {
                    let stored = cipher.encode(target.get());
                    buffer[offset..offset + 4].copy_from_slice(&stored.to_le_bytes());
                }
            }
        }

        log::debug!(
            "resolved {} relocation sites in {} bytes at {}",
            self.entries.len(),
            buffer.len(),
            self.base
        );
        Ok(self.entries.len())
    }
}
