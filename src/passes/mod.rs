//! behavior-preserving transformations over the control-flow model.
//!
//! each pass rewrites the graph in place and reports whether it changed anything. the session
//! runs a pass on a copy of the graph and only keeps the copy when the pass succeeds and the
//! result still validates, so a failing pass never leaves a half-rewritten graph behind.
pub mod encrypt;
pub mod junk;
pub mod no_jcc;
pub mod reorder;
pub mod substitute;
pub mod vector;

pub use encrypt::EncryptJcc;
pub use junk::LocalObf;
pub use no_jcc::NoJcc;
pub use reorder::OutOfOrder;
pub use substitute::EquivalentVariation;
pub use vector::VectorJmp;

use crate::cfg::{ControlFlowGraph, Op, Target};
use crate::decoder::{BranchShape, Width};
use crate::error::PassError;
use iced_x86::{IcedError, Register};
use rand::{rngs::StdRng, seq::SliceRandom, Rng};

/// instructions produced by this many rounds of substitution are left alone.
pub const MAX_SUBSTITUTION_DEPTH: u8 = 3;

/// registers passes may borrow as scratch. esp is never one of them.
pub const GENERAL: [Register; 7] = [
    Register::EAX,
    Register::ECX,
    Register::EDX,
    Register::EBX,
    Register::EBP,
    Register::ESI,
    Register::EDI,
];

/// a graph transformation.
pub trait Pass {
    fn name(&self) -> &'static str;

    /// rewrites `cfg`. `Ok(false)` means the pass found nothing to do.
    fn apply(&self, cfg: &mut ControlFlowGraph, rng: &mut StdRng) -> Result<bool, PassError>;
}

pub(crate) fn scratch(rng: &mut StdRng) -> Register {
    GENERAL[rng.gen_range(0..GENERAL.len())]
}

/// two distinct scratch registers.
pub(crate) fn scratch_pair(rng: &mut StdRng) -> [Register; 2] {
    let mut picked = GENERAL.choose_multiple(rng, 2);
    let a = picked.next().copied().unwrap_or(Register::EAX);
    let b = picked.next().copied().unwrap_or(Register::ECX);
    [a, b]
}

/// keeps each candidate with probability `p`; when the draw keeps none, one is forced so that
/// every call changes something.
pub(crate) fn select_some<T: Copy>(candidates: &[T], p: f64, rng: &mut StdRng) -> Vec<T> {
    let mut chosen: Vec<T> = candidates
        .iter()
        .copied()
        .filter(|_| rng.gen_bool(p))
        .collect();
    if chosen.is_empty() {
        if let Some(&forced) = candidates.choose(rng) {
            chosen.push(forced);
        }
    }
    chosen
}

pub(crate) fn encode_error(pass: &'static str, err: IcedError) -> PassError {
    PassError::Encode {
        pass,
        message: err.to_string(),
    }
}

/// turns every fallthrough the layout no longer satisfies into an explicit `jmp`.
///
/// an external fallthrough is only satisfied by the last block, where the emitter decides.
///
/// # returns
/// the number of jumps added.
pub(crate) fn repair_fallthroughs(cfg: &mut ControlFlowGraph) -> usize {
    let broken: Vec<(usize, Target)> = cfg
        .blocks()
        .iter()
        .enumerate()
        .filter_map(|(i, block)| {
            let next = cfg.blocks().get(i + 1).map(|b| b.id);
            match block.fallthrough? {
                Target::Block(id) if next == Some(id) => None,
                Target::External(_) if next.is_none() => None,
                target => Some((i, target)),
            }
        })
        .collect();

    for &(i, target) in &broken {
        let jmp = cfg.synthesize(
            0,
            Op::Branch {
                shape: BranchShape::Jmp,
                target,
                width: Width::Short,
                prefix: Vec::new(),
            },
        );
        let block = &mut cfg.blocks_mut()[i];
        block.insns.push(jmp);
        block.fallthrough = None;
    }
    broken.len()
}
