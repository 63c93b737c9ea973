//! control-flow model of the designated range.
//!
//! the graph owns basic blocks in layout order, each holding instructions as `Op`s. branch
//! targets are symbolic (`Target::Block` or `Target::External`), so passes can move, split and
//! rewrite blocks without tracking addresses; the emitter turns targets into bytes at the end.
use crate::addr::{AddrRange, OrigAddr};
use crate::cipher::Cipher;
use crate::decoder::{format_raw, BranchShape, Cond, DecodedInsn, FlowKind, Width, BITNESS};
use crate::error::ModelError;
use iced_x86::{
    Decoder, DecoderOptions, Encoder, IcedError, Instruction as RawInsn, Mnemonic, Register,
};
use log::{debug, warn};
use std::collections::{HashMap, HashSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InsnId(pub u32);

/// a jump table slot, owned by exactly one `Op::VectorJump`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(pub u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

impl fmt::Display for InsnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "i{}", self.0)
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// where control goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    /// a block of the graph.
    Block(BlockId),
    /// an address the graph does not own. the bytes there stay in the image untouched.
    External(OrigAddr),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Block(id) => write!(f, "{}", id),
            Target::External(addr) => write!(f, "{}", addr),
        }
    }
}

/// how a vectorized jump reads its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VectorForm {
    /// `jmp dword ptr [slot]`
    Jmp,
    /// `push dword ptr [slot]; ret`
    PushRet,
}

/// the instruction vocabulary passes rewrite into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// a position-independent machine instruction.
    Plain {
        raw: RawInsn,
        bytes: Vec<u8>,
        kind: FlowKind,
    },
    /// bytes that do nothing at runtime.
    Junk(Vec<u8>),
    /// a relative transfer.
    Branch {
        shape: BranchShape,
        target: Target,
        width: Width,
        prefix: Vec<u8>,
    },
    /// conditional branch with both destinations materialized, picked by `cmovcc` and entered
    /// through `ret`.
    Select {
        cond: Cond,
        taken: Target,
        not_taken: Target,
        scratch: [Register; 2],
        cipher: Option<Cipher>,
    },
    /// indirect jump through a jump table slot holding `target`.
    VectorJump {
        slot: SlotId,
        target: Target,
        form: VectorForm,
    },
    /// conditional branch whose target is stored enciphered and decoded before a `ret`.
    Encrypted {
        cond: Cond,
        target: Target,
        scratch: Register,
        cipher: Cipher,
    },
}

impl Op {
    /// wraps an instruction built by a pass. only sequential instructions are accepted here.
    pub fn plain(raw: RawInsn) -> Result<Op, IcedError> {
        Ok(Op::Plain {
            bytes: encode_raw(&raw)?,
            raw,
            kind: FlowKind::Sequential,
        })
    }

    pub fn kind(&self) -> FlowKind {
        match self {
            Op::Plain { kind, .. } => *kind,
            Op::Junk(_) => FlowKind::Sequential,
            Op::Branch { shape, .. } => shape.kind(),
            Op::Select { .. } | Op::Encrypted { .. } => FlowKind::ConditionalBranch,
            Op::VectorJump { .. } => FlowKind::UnconditionalBranch,
        }
    }

    /// whether execution can continue with the next op.
    pub fn falls_through(&self) -> bool {
        match self {
            Op::Plain { kind, .. } => matches!(
                kind,
                FlowKind::Sequential | FlowKind::ConditionalBranch | FlowKind::Call
            ),
            Op::Junk(_) => true,
            Op::Branch { shape, .. } => !matches!(shape, BranchShape::Jmp),
            Op::Select { .. } | Op::VectorJump { .. } => false,
            Op::Encrypted { .. } => true,
        }
    }

    /// explicit destinations of this op, not counting the fallthrough.
    pub fn targets(&self) -> Vec<Target> {
        match self {
            Op::Plain { .. } | Op::Junk(_) => Vec::new(),
            Op::Branch { target, .. }
            | Op::VectorJump { target, .. }
            | Op::Encrypted { target, .. } => vec![*target],
            Op::Select {
                taken, not_taken, ..
            } => vec![*taken, *not_taken],
        }
    }

    /// a transfer whose destination only exists at runtime.
    pub fn is_unresolved(&self) -> bool {
        matches!(
            self,
            Op::Plain {
                kind: FlowKind::Indirect | FlowKind::Call,
                ..
            }
        )
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Plain { raw, .. } => write!(f, "{}", format_raw(raw)),
            Op::Junk(bytes) => write!(f, "db {}", hex::encode(bytes)),
            Op::Branch {
                shape,
                target,
                width,
                ..
            } => {
                let name = match shape {
                    BranchShape::Jmp => "jmp".to_string(),
                    BranchShape::Jcc(cond) => format!("j{}", cond.suffix()),
                    BranchShape::Call => "call".to_string(),
                    BranchShape::Loop(op) => op.name().to_string(),
                };
                let width = match width {
                    Width::Short => " short",
                    Width::Near => "",
                };
                write!(f, "{}{} {}", name, width, target)
            }
            Op::Select {
                cond,
                taken,
                not_taken,
                scratch,
                cipher,
            } => {
                write!(
                    f,
                    "select.{} {}, {} via {:?}/{:?}",
                    cond.suffix(),
                    taken,
                    not_taken,
                    scratch[0],
                    scratch[1]
                )?;
                if let Some(cipher) = cipher {
                    write!(f, " [{}]", cipher)?;
                }
                Ok(())
            }
            Op::VectorJump { slot, target, form } => match form {
                VectorForm::Jmp => write!(f, "jmp [{}] -> {}", slot, target),
                VectorForm::PushRet => write!(f, "push [{}]; ret -> {}", slot, target),
            },
            Op::Encrypted {
                cond,
                target,
                scratch,
                cipher,
            } => write!(
                f,
                "encrypted.{} {} via {:?} [{}]",
                cond.suffix(),
                target,
                scratch,
                cipher
            ),
        }
    }
}

/// encodes a position-independent instruction.
pub fn encode_raw(raw: &RawInsn) -> Result<Vec<u8>, IcedError> {
    let mut encoder = Encoder::new(BITNESS);
    encoder.encode(raw, 0)?;
    Ok(encoder.take_buffer())
}

/// an instruction of the graph. its address and final bytes only exist after emission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub id: InsnId,
    /// address in the source image; `None` for synthesized code.
    pub origin: Option<OrigAddr>,
    /// how many substitution rounds produced this instruction.
    pub depth: u8,
    pub op: Op,
}

impl Instruction {
    pub fn kind(&self) -> FlowKind {
        self.op.kind()
    }

    pub fn mnemonic(&self) -> Option<Mnemonic> {
        match &self.op {
            Op::Plain { raw, .. } => Some(raw.mnemonic()),
            _ => None,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.origin {
            Some(addr) => write!(f, "{}  {}", addr, self.op),
            None => write!(f, "{:10}  {}", "", self.op),
        }
    }
}

/// a successor edge of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Edge {
    Fallthrough(Target),
    Taken(Target),
    Call(Target),
    /// register or memory transfer; the destination is unknown.
    Unresolved,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicBlock {
    pub id: BlockId,
    /// leader address in the source image; `None` for blocks without an original leader.
    pub origin: Option<OrigAddr>,
    pub insns: Vec<Instruction>,
    /// where execution continues after the last op, if it falls through.
    pub fallthrough: Option<Target>,
    /// entered only through transfers the model cannot see (jump tables, computed jumps).
    pub indirect_entry: bool,
}

impl BasicBlock {
    pub fn terminator(&self) -> Option<&Instruction> {
        self.insns.last()
    }

    pub fn terminator_mut(&mut self) -> Option<&mut Instruction> {
        self.insns.last_mut()
    }

    pub fn successors(&self) -> Vec<Edge> {
        let mut edges = Vec::new();
        for insn in &self.insns {
            if insn.op.is_unresolved() {
                edges.push(Edge::Unresolved);
            }
            for target in insn.op.targets() {
                edges.push(match insn.op {
                    Op::Branch {
                        shape: BranchShape::Call,
                        ..
                    } => Edge::Call(target),
                    _ => Edge::Taken(target),
                });
            }
        }
        if let Some(ft) = self.fallthrough {
            edges.push(Edge::Fallthrough(ft));
        }
        edges
    }

    /// block ids this block can transfer to.
    fn referenced_blocks(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.insns
            .iter()
            .flat_map(|insn| insn.op.targets())
            .chain(self.fallthrough)
            .filter_map(|t| match t {
                Target::Block(id) => Some(id),
                Target::External(_) => None,
            })
    }
}

/// `call $+n` only pushes the address that follows it. it becomes `push <that address>`, so
/// code reading its own return address still sees the original one.
fn push_return_address(decoded: &DecodedInsn) -> Option<Op> {
    let branch = decoded.branch.as_ref()?;
    if branch.shape != BranchShape::Call || branch.target != decoded.next() {
        return None;
    }
    let mut bytes = vec![0x68];
    bytes.extend(decoded.next().get().to_le_bytes());
    let raw = Decoder::with_ip(
        BITNESS,
        &bytes,
        decoded.address.get() as u64,
        DecoderOptions::NONE,
    )
    .decode();
    Some(Op::Plain {
        raw,
        bytes,
        kind: FlowKind::Sequential,
    })
}

/// the working model the passes rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFlowGraph {
    range: AddrRange,
    entry: BlockId,
    blocks: Vec<BasicBlock>,
    table: Vec<SlotId>,
    next_block: u32,
    next_insn: u32,
    next_slot: u32,
}

impl ControlFlowGraph {
    /// cuts decoded instructions into basic blocks.
    ///
    /// leaders are the range begin, every in-range branch or call target that lands on an
    /// instruction boundary and every instruction that follows a non-sequential one. a target
    /// inside the range that splits an instruction is kept as external: its bytes stay in the
    /// image and keep their meaning there.
    ///
    /// # arguments
    /// * `insns` - output of `decoder::decode` for `range`.
    /// * `range` - the designated range.
    ///
    /// # returns
    /// the graph in original layout order, or `ModelError::UnresolvedEntry` when no instruction
    /// starts at the range begin.
    pub fn build(insns: &[DecodedInsn], range: AddrRange) -> Result<Self, ModelError> {
        if insns.first().map(|i| i.address) != Some(range.begin) {
            return Err(ModelError::UnresolvedEntry(range));
        }

        let index_of: HashMap<OrigAddr, usize> = insns
            .iter()
            .enumerate()
            .map(|(i, insn)| (insn.address, i))
            .collect();

        let mut leaders = vec![false; insns.len()];
        leaders[0] = true;
        for (i, insn) in insns.iter().enumerate() {
            if let Some(branch) = &insn.branch {
                if range.contains(branch.target) {
                    match index_of.get(&branch.target) {
                        Some(&j) => leaders[j] = true,
                        None => warn!(
                            "branch at {} lands inside an instruction at {}, kept external",
                            insn.address, branch.target
                        ),
                    }
                }
            }
            if insn.kind != FlowKind::Sequential && i + 1 < insns.len() {
                leaders[i + 1] = true;
            }
        }

        let mut block_at: HashMap<OrigAddr, BlockId> = HashMap::new();
        let mut next_block = 0;
        for (i, insn) in insns.iter().enumerate() {
            if leaders[i] {
                block_at.insert(insn.address, BlockId(next_block));
                next_block += 1;
            }
        }
        let resolve = |addr: OrigAddr| match block_at.get(&addr) {
            Some(&id) => Target::Block(id),
            None => Target::External(addr),
        };

        let mut blocks: Vec<BasicBlock> = Vec::new();
        let mut next_insn = 0;
        for (i, decoded) in insns.iter().enumerate() {
            if leaders[i] {
                blocks.push(BasicBlock {
                    id: block_at[&decoded.address],
                    origin: Some(decoded.address),
                    insns: Vec::new(),
                    fallthrough: None,
                    indirect_entry: false,
                });
            }
            let op = match (push_return_address(decoded), &decoded.branch) {
                (Some(push), _) => push,
                (None, Some(branch)) => Op::Branch {
                    shape: branch.shape,
                    target: resolve(branch.target),
                    width: branch.width,
                    prefix: branch.prefix.clone(),
                },
                (None, None) => Op::Plain {
                    raw: decoded.raw,
                    bytes: decoded.bytes.clone(),
                    kind: decoded.kind,
                },
            };
            let falls = op.falls_through();
            // leaders[0] is set, so a block is always open here
            if let Some(block) = blocks.last_mut() {
                block.insns.push(Instruction {
                    id: InsnId(next_insn),
                    origin: Some(decoded.address),
                    depth: 0,
                    op,
                });
                let ends_block = i + 1 == insns.len() || leaders[i + 1];
                if ends_block && falls {
                    block.fallthrough = Some(resolve(decoded.next()));
                }
            }
            next_insn += 1;
        }

        let entry = BlockId(0);
        let referenced: HashSet<BlockId> =
            blocks.iter().flat_map(|b| b.referenced_blocks()).collect();
        for block in blocks.iter_mut() {
            block.indirect_entry = block.id != entry && !referenced.contains(&block.id);
        }

        debug!(
            "built {} blocks over {} ({} indirect entries)",
            blocks.len(),
            range,
            blocks.iter().filter(|b| b.indirect_entry).count()
        );

        Ok(ControlFlowGraph {
            range,
            entry,
            blocks,
            table: Vec::new(),
            next_block,
            next_insn,
            next_slot: 0,
        })
    }

    pub fn range(&self) -> AddrRange {
        self.range
    }

    pub fn entry(&self) -> BlockId {
        self.entry
    }

    /// blocks in emission order.
    pub fn blocks(&self) -> &[BasicBlock] {
        &self.blocks
    }

    pub fn blocks_mut(&mut self) -> &mut Vec<BasicBlock> {
        &mut self.blocks
    }

    pub fn block(&self, id: BlockId) -> Option<&BasicBlock> {
        self.blocks.iter().find(|b| b.id == id)
    }

    pub fn block_mut(&mut self, id: BlockId) -> Option<&mut BasicBlock> {
        self.blocks.iter_mut().find(|b| b.id == id)
    }

    /// layout position of a block.
    pub fn position(&self, id: BlockId) -> Option<usize> {
        self.blocks.iter().position(|b| b.id == id)
    }

    pub fn insn_count(&self) -> usize {
        self.blocks.iter().map(|b| b.insns.len()).sum()
    }

    /// jump table slots in emission order.
    pub fn table(&self) -> &[SlotId] {
        &self.table
    }

    /// allocates a slot and places it at `position` in the table (clamped to its length).
    pub fn insert_slot(&mut self, position: usize) -> SlotId {
        let slot = SlotId(self.next_slot);
        self.next_slot += 1;
        let position = position.min(self.table.len());
        self.table.insert(position, slot);
        slot
    }

    pub fn alloc_insn(&mut self) -> InsnId {
        let id = InsnId(self.next_insn);
        self.next_insn += 1;
        id
    }

    fn alloc_block(&mut self) -> BlockId {
        let id = BlockId(self.next_block);
        self.next_block += 1;
        id
    }

    /// a fresh synthesized instruction.
    pub fn synthesize(&mut self, depth: u8, op: Op) -> Instruction {
        Instruction {
            id: self.alloc_insn(),
            origin: None,
            depth,
            op,
        }
    }

    /// splits `id` before its instruction `at`.
    ///
    /// the head keeps the id and falls through to the tail, which is placed right after it and
    /// inherits the old fallthrough.
    pub fn split_block(&mut self, id: BlockId, at: usize) -> Result<BlockId, ModelError> {
        let position = self.position(id).ok_or(ModelError::DanglingBlock(id))?;
        let len = self.blocks[position].insns.len();
        if at == 0 || at >= len {
            return Err(ModelError::EmptyBlock(id));
        }
        if !self.blocks[position].insns[at - 1].op.falls_through() {
            return Err(ModelError::EarlyExit(id));
        }

        let tail_id = self.alloc_block();
        let head = &mut self.blocks[position];
        let insns = head.insns.split_off(at);
        let tail = BasicBlock {
            id: tail_id,
            origin: insns.first().and_then(|i| i.origin),
            insns,
            fallthrough: head.fallthrough.take(),
            indirect_entry: false,
        };
        head.fallthrough = Some(Target::Block(tail_id));
        self.blocks.insert(position + 1, tail);
        Ok(tail_id)
    }

    pub fn successors(&self, id: BlockId) -> Vec<Edge> {
        self.block(id).map(|b| b.successors()).unwrap_or_default()
    }

    /// blocks with an explicit edge into `id`.
    pub fn predecessors(&self, id: BlockId) -> Vec<BlockId> {
        self.blocks
            .iter()
            .filter(|b| b.referenced_blocks().any(|r| r == id))
            .map(|b| b.id)
            .collect()
    }

    /// checks the structural invariants every pass must keep.
    pub fn validate(&self) -> Result<(), ModelError> {
        let mut seen = HashSet::new();
        for block in &self.blocks {
            if !seen.insert(block.id) {
                return Err(ModelError::DuplicateBlock(block.id));
            }
        }
        if !seen.contains(&self.entry) {
            return Err(ModelError::DanglingBlock(self.entry));
        }

        let mut owners: HashMap<SlotId, usize> = HashMap::new();
        for block in &self.blocks {
            let last = block.insns.last().ok_or(ModelError::EmptyBlock(block.id))?;
            if block.insns[..block.insns.len() - 1]
                .iter()
                .any(|i| !i.op.falls_through())
            {
                return Err(ModelError::EarlyExit(block.id));
            }
            if block.fallthrough.is_some() != last.op.falls_through() {
                return Err(ModelError::FallthroughMismatch(block.id));
            }
            if let Some(missing) = block.referenced_blocks().find(|id| !seen.contains(id)) {
                return Err(ModelError::DanglingBlock(missing));
            }
            for insn in &block.insns {
                if let Op::VectorJump { slot, .. } = insn.op {
                    *owners.entry(slot).or_default() += 1;
                }
            }
        }

        for slot in &self.table {
            if owners.remove(slot) != Some(1) {
                return Err(ModelError::OrphanSlot(slot.0));
            }
        }
        if let Some(slot) = owners.keys().next() {
            return Err(ModelError::OrphanSlot(slot.0));
        }
        Ok(())
    }
}

impl fmt::Display for ControlFlowGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "cfg {} entry {}, {} blocks, {} instructions, {} table slots",
            self.range,
            self.entry,
            self.blocks.len(),
            self.insn_count(),
            self.table.len()
        )?;
        for block in &self.blocks {
            match block.origin {
                Some(addr) => write!(f, "{} @ {}:", block.id, addr)?,
                None => write!(f, "{}:", block.id)?,
            }
            if block.indirect_entry {
                write!(f, " (indirect entry)")?;
            }
            writeln!(f)?;
            for insn in &block.insns {
                writeln!(f, "    {}", insn)?;
            }
            if let Some(ft) = block.fallthrough {
                writeln!(f, "    -> {}", ft)?;
            }
        }
        Ok(())
    }
}
