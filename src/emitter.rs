//! code emitter. lays the graph out at a base address, widens short branches that cannot reach,
//! encodes every op and resolves the relocation ledger over the result.
use crate::addr::{NewAddr, OrigAddr};
use crate::cfg::{BlockId, ControlFlowGraph, InsnId, Op, SlotId, Target, VectorForm};
use crate::cipher::Cipher;
use crate::decoder::{BranchShape, Cond, Width, BITNESS};
use crate::error::RelocationError;
use crate::ledger::{RelocKind, RelocTarget, RelocationLedger, Site, SiteOwner};
use iced_x86::{Code, Encoder, Instruction as RawInsn, MemoryOperand, Register};
use log::debug;
use std::collections::HashMap;

/// the bytes of one owner plus its unresolved fields, offsets relative to the owner.
#[derive(Debug, Clone, Default)]
struct Fragment {
    bytes: Vec<u8>,
    sites: Vec<(u32, RelocTarget, RelocKind)>,
}

impl Fragment {
    fn len(&self) -> u32 {
        self.bytes.len() as u32
    }
}

/// output of a successful emission.
#[derive(Debug, Clone)]
pub struct Emission {
    pub buffer: Vec<u8>,
    pub base: NewAddr,
    /// where the graph's entry block landed.
    pub entry: NewAddr,
    /// bytes of code before the jump table padding.
    pub code_size: u32,
    /// buffer offset of the first jump table slot.
    pub table_offset: Option<u32>,
    pub ledger: RelocationLedger,
}

fn encode_error(what: impl ToString, err: impl ToString) -> RelocationError {
    RelocationError::Encode {
        what: what.to_string(),
        message: err.to_string(),
    }
}

/// assembles a sequence of iced instructions, remembering where immediates that need
/// relocation ended up.
struct Asm {
    encoder: Encoder,
    len: u32,
    sites: Vec<(u32, RelocTarget, RelocKind)>,
}

impl Asm {
    fn new() -> Self {
        Asm {
            encoder: Encoder::new(BITNESS),
            len: 0,
            sites: Vec::new(),
        }
    }

    fn emit(&mut self, raw: Result<RawInsn, iced_x86::IcedError>) -> Result<(), RelocationError> {
        let raw = raw.map_err(|e| encode_error("synthesized instruction", e))?;
        let n = self
            .encoder
            .encode(&raw, 0)
            .map_err(|e| encode_error(format!("{:?}", raw.code()), e))?;
        self.len += n as u32;
        Ok(())
    }

    /// emits `mov reg, imm32` with the immediate left to the ledger.
    fn mov_address(
        &mut self,
        reg: Register,
        target: Target,
        kind: RelocKind,
    ) -> Result<(), RelocationError> {
        let start = self.len;
        self.emit(RawInsn::with2(Code::Mov_r32_imm32, reg, 0u32))?;
        let offset = self.encoder.get_constant_offsets().immediate_offset() as u32;
        self.sites
            .push((start + offset, RelocTarget::Flow(target), kind));
        Ok(())
    }

    /// `pushfd; <cipher steps on reg>; popfd`
    fn decode_in_place(&mut self, reg: Register, cipher: &Cipher) -> Result<(), RelocationError> {
        self.emit(Ok(RawInsn::with(Code::Pushfd)))?;
        let steps = cipher
            .instructions(reg)
            .map_err(|e| encode_error(cipher, e))?;
        for step in steps {
            self.emit(Ok(step))?;
        }
        self.emit(Ok(RawInsn::with(Code::Popfd)))
    }

    /// `xchg [esp], reg; ret` - restores `reg` and enters the address it held.
    fn enter_through_stack(&mut self, reg: Register) -> Result<(), RelocationError> {
        self.emit(RawInsn::with2(
            Code::Xchg_rm32_r32,
            MemoryOperand::with_base(Register::ESP),
            reg,
        ))?;
        self.emit(Ok(RawInsn::with(Code::Retnd)))
    }

    fn finish(mut self) -> Fragment {
        Fragment {
            bytes: self.encoder.take_buffer(),
            sites: self.sites,
        }
    }
}

fn branch_fragment(shape: BranchShape, width: Width, target: Target, prefix: &[u8]) -> Fragment {
    let width = width.max(shape.narrowest());
    let mut bytes = prefix.to_vec();
    match (shape, width) {
        (BranchShape::Jmp, Width::Short) => bytes.push(0xeb),
        (BranchShape::Jmp, Width::Near) => bytes.push(0xe9),
        (BranchShape::Jcc(cond), Width::Short) => bytes.push(0x70 | cond.nibble()),
        (BranchShape::Jcc(cond), Width::Near) => bytes.extend([0x0f, 0x80 | cond.nibble()]),
        (BranchShape::Call, _) => bytes.push(0xe8),
        (BranchShape::Loop(op), Width::Short) => bytes.push(op.opcode()),
        // loop +2; jmp short +5; jmp rel32
        (BranchShape::Loop(op), Width::Near) => bytes.extend([op.opcode(), 0x02, 0xeb, 0x05, 0xe9]),
    }
    let offset = bytes.len() as u32;
    let field = match width {
        Width::Short => 1,
        Width::Near => 4,
    };
    bytes.resize(bytes.len() + field, 0);
    Fragment {
        bytes,
        sites: vec![(
            offset,
            RelocTarget::Flow(target),
            RelocKind::Relative { width },
        )],
    }
}

fn select_fragment(
    cond: Cond,
    taken: Target,
    not_taken: Target,
    scratch: [Register; 2],
    cipher: Option<&Cipher>,
) -> Result<Fragment, RelocationError> {
    let [a, b] = scratch;
    let kind = cipher.map_or(RelocKind::Absolute, |c| RelocKind::Encoded(c.clone()));
    let mut asm = Asm::new();
    asm.emit(RawInsn::with1(Code::Push_r32, a))?;
    asm.mov_address(a, not_taken, kind.clone())?;
    asm.emit(RawInsn::with1(Code::Push_r32, b))?;
    asm.mov_address(b, taken, kind)?;
    asm.emit(RawInsn::with2(cond.cmov_code(), a, b))?;
    asm.emit(RawInsn::with1(Code::Pop_r32, b))?;
    if let Some(cipher) = cipher {
        asm.decode_in_place(a, cipher)?;
    }
    asm.enter_through_stack(a)?;
    Ok(asm.finish())
}

fn encrypted_fragment(
    cond: Cond,
    target: Target,
    scratch: Register,
    cipher: &Cipher,
) -> Result<Fragment, RelocationError> {
    let mut asm = Asm::new();
    asm.emit(RawInsn::with1(Code::Push_r32, scratch))?;
    asm.emit(Ok(RawInsn::with(Code::Pushfd)))?;
    asm.mov_address(scratch, target, RelocKind::Encoded(cipher.clone()))?;
    let steps = cipher
        .instructions(scratch)
        .map_err(|e| encode_error(cipher, e))?;
    for step in steps {
        asm.emit(Ok(step))?;
    }
    asm.emit(Ok(RawInsn::with(Code::Popfd)))?;
    asm.enter_through_stack(scratch)?;
    let body = asm.finish();

    // j!cc over the body
    let skip = u8::try_from(body.len())
        .ok()
        .filter(|n| *n <= i8::MAX as u8)
        .ok_or_else(|| encode_error("encrypted branch", "body does not fit a short skip"))?;
    let mut bytes = vec![0x70 | cond.inverse().nibble(), skip];
    bytes.extend(body.bytes);
    Ok(Fragment {
        bytes,
        sites: body
            .sites
            .into_iter()
            .map(|(offset, target, kind)| (offset + 2, target, kind))
            .collect(),
    })
}

fn vector_fragment(slot: SlotId, form: VectorForm) -> Fragment {
    let mut bytes = match form {
        VectorForm::Jmp => vec![0xff, 0x25],
        VectorForm::PushRet => vec![0xff, 0x35],
    };
    bytes.extend([0; 4]);
    if form == VectorForm::PushRet {
        bytes.push(0xc3);
    }
    Fragment {
        bytes,
        sites: vec![(2, RelocTarget::Slot(slot), RelocKind::Absolute)],
    }
}

fn fragment(op: &Op, width: Option<Width>) -> Result<Fragment, RelocationError> {
    Ok(match op {
        Op::Plain { bytes, .. } | Op::Junk(bytes) => Fragment {
            bytes: bytes.clone(),
            sites: Vec::new(),
        },
        Op::Branch {
            shape,
            target,
            width: own,
            prefix,
        } => branch_fragment(*shape, width.unwrap_or(*own), *target, prefix),
        Op::Select {
            cond,
            taken,
            not_taken,
            scratch,
            cipher,
        } => select_fragment(*cond, *taken, *not_taken, *scratch, cipher.as_ref())?,
        Op::VectorJump { slot, form, .. } => vector_fragment(*slot, *form),
        Op::Encrypted {
            cond,
            target,
            scratch,
            cipher,
        } => encrypted_fragment(*cond, *target, *scratch, cipher)?,
    })
}

fn continuation(target: Target) -> Fragment {
    branch_fragment(BranchShape::Jmp, Width::Near, target, &[])
}

struct Piece {
    /// `None` for alignment padding.
    owner: Option<SiteOwner>,
    origin: Option<OrigAddr>,
    offset: u32,
    fragment: Fragment,
}

struct Layout {
    pieces: Vec<Piece>,
    blocks: HashMap<BlockId, u32>,
    code_size: u32,
    table_offset: Option<u32>,
    size: u32,
}

fn lay_out(
    cfg: &ControlFlowGraph,
    base: NewAddr,
    widths: &HashMap<InsnId, Width>,
) -> Result<Layout, RelocationError> {
    let mut pieces = Vec::new();
    let mut blocks = HashMap::new();
    let mut offset: u32 = 0;
    let mut slot_targets: HashMap<SlotId, Target> = HashMap::new();

    let layout = cfg.blocks();
    for (i, block) in layout.iter().enumerate() {
        blocks.insert(block.id, offset);
        for insn in &block.insns {
            let fragment = fragment(&insn.op, widths.get(&insn.id).copied())?;
            if let Op::VectorJump { slot, target, .. } = insn.op {
                slot_targets.insert(slot, target);
            }
            let len = fragment.len();
            pieces.push(Piece {
                owner: Some(SiteOwner::Insn(insn.id)),
                origin: insn.origin,
                offset,
                fragment,
            });
            offset = offset
                .checked_add(len)
                .ok_or(RelocationError::AddressSpace)?;
        }

        let next = layout.get(i + 1).map(|b| b.id);
        match block.fallthrough {
            None => {}
            Some(Target::Block(id)) if next == Some(id) => {}
            Some(Target::Block(_)) => return Err(RelocationError::BrokenFallthrough(block.id)),
            Some(Target::External(addr)) => {
                let reached = next.is_none()
                    && base.checked_add(offset) == Some(NewAddr::from_untouched(addr));
                if !reached {
                    let fragment = continuation(Target::External(addr));
                    let len = fragment.len();
                    pieces.push(Piece {
                        owner: Some(SiteOwner::Continuation(block.id)),
                        origin: None,
                        offset,
                        fragment,
                    });
                    offset = offset
                        .checked_add(len)
                        .ok_or(RelocationError::AddressSpace)?;
                }
            }
        }
    }

    let code_size = offset;
    let mut table_offset = None;
    if !cfg.table().is_empty() {
        let misalign = base.get().wrapping_add(offset) % 4;
        if misalign != 0 {
            let pad = 4 - misalign;
            pieces.push(Piece {
                owner: None,
                origin: None,
                offset,
                fragment: Fragment {
                    bytes: vec![0xcc; pad as usize],
                    sites: Vec::new(),
                },
            });
            offset += pad;
        }
        table_offset = Some(offset);
        for slot in cfg.table() {
            let target = slot_targets.get(slot).copied().ok_or_else(|| {
                encode_error(slot, "no vectorized jump owns this jump table slot")
            })?;
            pieces.push(Piece {
                owner: Some(SiteOwner::Slot(*slot)),
                origin: None,
                offset,
                fragment: Fragment {
                    bytes: vec![0; 4],
                    sites: vec![(0, RelocTarget::Flow(target), RelocKind::TableSlot)],
                },
            });
            offset = offset.checked_add(4).ok_or(RelocationError::AddressSpace)?;
        }
    }

    if base.get() as u64 + offset as u64 > u32::MAX as u64 + 1 {
        return Err(RelocationError::AddressSpace);
    }

    Ok(Layout {
        pieces,
        blocks,
        code_size,
        table_offset,
        size: offset,
    })
}

/// emits the graph at `base`.
///
/// short branches start at the width they have in the graph and are widened one relaxation
/// round at a time until every one of them reaches. widening only ever grows the code, so the
/// loop ends.
///
/// # arguments
/// * `cfg` - the graph, blocks in emission order.
/// * `base` - address the buffer will be mapped at.
///
/// # returns
/// the resolved buffer with its ledger, or the first relocation that could not be honoured.
pub fn emit(cfg: &ControlFlowGraph, base: NewAddr) -> Result<Emission, RelocationError> {
    let mut widths: HashMap<InsnId, Width> = HashMap::new();
    let mut rounds = 0;

    let layout = loop {
        rounds += 1;
        let layout = lay_out(cfg, base, &widths)?;
        let mut widened = false;

        for piece in &layout.pieces {
            let Some(SiteOwner::Insn(id)) = piece.owner else {
                continue;
            };
            for (offset, target, kind) in &piece.fragment.sites {
                if *kind != (RelocKind::Relative { width: Width::Short }) {
                    continue;
                }
                let destination = match target {
                    RelocTarget::Flow(Target::Block(block)) => layout
                        .blocks
                        .get(block)
                        .and_then(|o| base.checked_add(*o)),
                    RelocTarget::Flow(Target::External(addr)) => {
                        Some(NewAddr::from_untouched(*addr))
                    }
                    RelocTarget::Slot(_) => None,
                };
                let field_end = base.checked_add(piece.offset + offset + 1);
                if let (Some(destination), Some(field_end)) = (destination, field_end) {
                    if i8::try_from(destination.displacement_from(field_end)).is_err() {
                        widths.insert(id, Width::Near);
                        widened = true;
                    }
                }
            }
        }

        if !widened {
            break layout;
        }
    };

    let mut buffer = Vec::with_capacity(layout.size as usize);
    let mut ledger = RelocationLedger::new(base);
    for (id, offset) in &layout.blocks {
        ledger.place_block(*id, *offset);
    }
    for piece in layout.pieces {
        if let Some(owner) = piece.owner {
            ledger.place(owner, piece.offset, piece.fragment.len());
            for (offset, target, kind) in piece.fragment.sites {
                ledger.record(Site { owner, offset }, target, kind)?;
            }
        }
        if let (Some(origin), Some(at)) = (piece.origin, base.checked_add(piece.offset)) {
            ledger.retarget(origin, at);
        }
        buffer.extend(piece.fragment.bytes);
    }

    let resolved = ledger.resolve_all(&mut buffer)?;
    let entry = layout
        .blocks
        .get(&cfg.entry())
        .and_then(|o| base.checked_add(*o))
        .ok_or(RelocationError::DanglingTarget {
            site: Site {
                owner: SiteOwner::Continuation(cfg.entry()),
                offset: 0,
            },
            target: RelocTarget::Flow(Target::Block(cfg.entry())),
        })?;

    debug!(
        "emitted {} bytes at {} in {} relaxation rounds, {} sites resolved",
        buffer.len(),
        base,
        rounds,
        resolved
    );

    Ok(Emission {
        buffer,
        base,
        entry,
        code_size: layout.code_size,
        table_offset: layout.table_offset,
        ledger,
    })
}
