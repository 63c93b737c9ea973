//! branch normalization: conditional jumps become `cmovcc`-selected returns.
//!
//! ```text
//! push a
//! mov  a, not_taken
//! push b
//! mov  b, taken
//! cmovcc a, b
//! pop  b
//! xchg [esp], a
//! ret
//! ```
//! no instruction of the sequence writes a flag, so the condition is tested exactly where the
//! `jcc` tested it.
use super::{scratch_pair, Pass};
use crate::cfg::{ControlFlowGraph, Op};
use crate::decoder::BranchShape;
use crate::error::PassError;
use log::debug;
use rand::rngs::StdRng;

pub struct NoJcc;

impl Pass for NoJcc {
    fn name(&self) -> &'static str {
        "no_jcc"
    }

    fn apply(&self, cfg: &mut ControlFlowGraph, rng: &mut StdRng) -> Result<bool, PassError> {
        let mut converted = 0;
        for block in cfg.blocks_mut().iter_mut() {
            let Some(not_taken) = block.fallthrough else {
                continue;
            };
            let Some(last) = block.insns.last_mut() else {
                continue;
            };
            // counter branches (`loop`, `jecxz`) also update or test ecx, they stay as they are
            let Op::Branch {
                shape: BranchShape::Jcc(cond),
                target,
                ..
            } = last.op
            else {
                continue;
            };

            last.op = Op::Select {
                cond,
                taken: target,
                not_taken,
                scratch: scratch_pair(rng),
                cipher: None,
            };
            block.fallthrough = None;
            converted += 1;
        }

        debug!("{}: normalized {} conditional branches", self.name(), converted);
        Ok(converted > 0)
    }
}
