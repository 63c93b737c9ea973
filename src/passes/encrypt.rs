//! branch target encryption.
//!
//! a conditional branch keeps its condition but stops naming its destination: the target is
//! stored enciphered as an immediate and decoded at runtime right before a `ret` enters it.
//! selects produced by [`NoJcc`](super::NoJcc) get the same treatment for their chosen value.
use super::{scratch, select_some, Pass};
use crate::cfg::{BlockId, ControlFlowGraph, Op};
use crate::cipher::Cipher;
use crate::decoder::BranchShape;
use crate::error::PassError;
use log::debug;
use rand::rngs::StdRng;

const PROBABILITY: f64 = 0.5;

pub struct EncryptJcc;

fn eligible(op: &Op) -> bool {
    matches!(
        op,
        Op::Branch {
            shape: BranchShape::Jcc(_),
            ..
        } | Op::Select { cipher: None, .. }
    )
}

impl Pass for EncryptJcc {
    fn name(&self) -> &'static str {
        "encrypt_jcc"
    }

    fn apply(&self, cfg: &mut ControlFlowGraph, rng: &mut StdRng) -> Result<bool, PassError> {
        let candidates: Vec<BlockId> = cfg
            .blocks()
            .iter()
            .filter(|b| b.terminator().is_some_and(|i| eligible(&i.op)))
            .map(|b| b.id)
            .collect();
        if candidates.is_empty() {
            debug!("{}: no conditional branches left in the clear", self.name());
            return Ok(false);
        }

        let chosen = select_some(&candidates, PROBABILITY, rng);
        let (mut branches, mut selects) = (0, 0);
        for id in &chosen {
            let Some(last) = cfg.block_mut(*id).and_then(|b| b.terminator_mut()) else {
                continue;
            };
            match &mut last.op {
                Op::Branch {
                    shape: BranchShape::Jcc(cond),
                    target,
                    ..
                } => {
                    let (cond, target) = (*cond, *target);
                    last.op = Op::Encrypted {
                        cond,
                        target,
                        scratch: scratch(rng),
                        cipher: Cipher::random(rng),
                    };
                    branches += 1;
                }
                Op::Select { cipher, .. } if cipher.is_none() => {
                    *cipher = Some(Cipher::random(rng));
                    selects += 1;
                }
                _ => {}
            }
        }

        debug!(
            "{}: encrypted {} branches and {} selects",
            self.name(),
            branches,
            selects
        );
        Ok(branches + selects > 0)
    }
}
