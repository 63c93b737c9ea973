//! backward liveness of the arithmetic status flags.
//!
//! passes that write flags (substitution, junk) ask whether any status flag can still be read at
//! a given point. the answer is conservative: anything leaving the graph, returning, jumping
//! through a register or calling out counts as reading every flag.
use crate::cfg::{BlockId, ControlFlowGraph, Instruction, Op, Target};
use crate::decoder::{BranchShape, Cond, FlowKind, LoopOp};
use iced_x86::{Mnemonic, RflagsBits};
use std::collections::HashMap;

/// OF, SF, ZF, AF, CF and PF.
pub const STATUS: u32 = RflagsBits::OF
    | RflagsBits::SF
    | RflagsBits::ZF
    | RflagsBits::AF
    | RflagsBits::CF
    | RflagsBits::PF;

/// flags a condition code tests.
pub fn cond_reads(cond: Cond) -> u32 {
    match cond {
        Cond::O | Cond::No => RflagsBits::OF,
        Cond::B | Cond::Ae => RflagsBits::CF,
        Cond::E | Cond::Ne => RflagsBits::ZF,
        Cond::Be | Cond::A => RflagsBits::CF | RflagsBits::ZF,
        Cond::S | Cond::Ns => RflagsBits::SF,
        Cond::P | Cond::Np => RflagsBits::PF,
        Cond::L | Cond::Ge => RflagsBits::SF | RflagsBits::OF,
        Cond::Le | Cond::G => RflagsBits::ZF | RflagsBits::SF | RflagsBits::OF,
    }
}

/// (read, killed) status flags of one op.
fn effect(insn: &Instruction) -> (u32, u32) {
    match &insn.op {
        Op::Plain { raw, kind, .. } => match kind {
            FlowKind::Sequential => {
                // a count of zero leaves the flags alone
                let kills = match raw.mnemonic() {
                    Mnemonic::Shl
                    | Mnemonic::Sal
                    | Mnemonic::Shr
                    | Mnemonic::Sar
                    | Mnemonic::Rol
                    | Mnemonic::Ror
                    | Mnemonic::Rcl
                    | Mnemonic::Rcr
                    | Mnemonic::Shld
                    | Mnemonic::Shrd => 0,
                    _ => raw.rflags_modified() & STATUS,
                };
                (raw.rflags_read() & STATUS, kills)
            }
            _ => (STATUS, 0),
        },
        Op::Junk(_) => (0, 0),
        Op::Branch { shape, .. } => match shape {
            BranchShape::Jmp => (0, 0),
            BranchShape::Jcc(cond) => (cond_reads(*cond), 0),
            BranchShape::Loop(LoopOp::Loope | LoopOp::Loopne) => (RflagsBits::ZF, 0),
            BranchShape::Loop(_) => (0, 0),
            BranchShape::Call => (STATUS, 0),
        },
        Op::Select { cond, .. } | Op::Encrypted { cond, .. } => (cond_reads(*cond), 0),
        Op::VectorJump { .. } => (0, 0),
    }
}

/// per-gap live status flags of a graph.
#[derive(Debug, Clone)]
pub struct FlagLiveness {
    /// `gaps[b][g]` is live before instruction `g` of block `b`; the extra last entry is live
    /// after the block along its fallthrough.
    gaps: HashMap<BlockId, Vec<u32>>,
}

impl FlagLiveness {
    pub fn compute(cfg: &ControlFlowGraph) -> Self {
        let mut gaps: HashMap<BlockId, Vec<u32>> = cfg
            .blocks()
            .iter()
            .map(|b| (b.id, vec![0; b.insns.len() + 1]))
            .collect();

        let mut rounds = 0;
        loop {
            rounds += 1;
            let mut changed = false;
            for block in cfg.blocks().iter().rev() {
                let live_in = |gaps: &HashMap<BlockId, Vec<u32>>, target: Target| match target {
                    Target::Block(id) => gaps
                        .get(&id)
                        .and_then(|v| v.first().copied())
                        .unwrap_or(STATUS),
                    Target::External(_) => STATUS,
                };

                let mut live = vec![0; block.insns.len() + 1];
                live[block.insns.len()] = block.fallthrough.map_or(0, |t| live_in(&gaps, t));
                for (i, insn) in block.insns.iter().enumerate().rev() {
                    let mut after = if insn.op.falls_through() { live[i + 1] } else { 0 };
                    for target in insn.op.targets() {
                        after |= live_in(&gaps, target);
                    }
                    let (reads, kills) = effect(insn);
                    live[i] = reads | (after & !kills);
                }

                if gaps.get(&block.id) != Some(&live) {
                    changed = true;
                    gaps.insert(block.id, live);
                }
            }
            if !changed {
                break;
            }
        }

        log::trace!("flag liveness settled after {} rounds", rounds);
        FlagLiveness { gaps }
    }

    /// status flags live before instruction `gap` of `block` (`gap == len` is after the last one).
    /// unknown points report every flag live.
    pub fn live_at(&self, block: BlockId, gap: usize) -> u32 {
        self.gaps
            .get(&block)
            .and_then(|v| v.get(gap).copied())
            .unwrap_or(STATUS)
    }

    /// status flags live right after instruction `index` of `block`, along its fallthrough.
    pub fn live_after(&self, block: BlockId, index: usize) -> u32 {
        self.live_at(block, index + 1)
    }
}
