//! jump vectorization: direct jumps become indirect jumps through a table appended to the code.
use super::{select_some, Pass};
use crate::cfg::{BlockId, ControlFlowGraph, Op, VectorForm};
use crate::decoder::BranchShape;
use crate::error::PassError;
use log::debug;
use rand::{rngs::StdRng, Rng};

const PROBABILITY: f64 = 0.5;

pub struct VectorJmp;

impl Pass for VectorJmp {
    fn name(&self) -> &'static str {
        "vector_jmp"
    }

    fn apply(&self, cfg: &mut ControlFlowGraph, rng: &mut StdRng) -> Result<bool, PassError> {
        let candidates: Vec<BlockId> = cfg
            .blocks()
            .iter()
            .filter(|b| {
                matches!(
                    b.terminator().map(|i| &i.op),
                    Some(Op::Branch {
                        shape: BranchShape::Jmp,
                        ..
                    })
                )
            })
            .map(|b| b.id)
            .collect();
        if candidates.is_empty() {
            debug!("{}: no direct jumps", self.name());
            return Ok(false);
        }

        let chosen = select_some(&candidates, PROBABILITY, rng);
        for id in &chosen {
            let position = rng.gen_range(0..=cfg.table().len());
            let form = if rng.gen_bool(0.5) {
                VectorForm::Jmp
            } else {
                VectorForm::PushRet
            };
            let slot = cfg.insert_slot(position);
            let Some(last) = cfg.block_mut(*id).and_then(|b| b.terminator_mut()) else {
                continue;
            };
            if let Op::Branch { target, .. } = last.op {
                last.op = Op::VectorJump { slot, target, form };
            }
        }

        debug!(
            "{}: vectorized {} jumps, table holds {} slots",
            self.name(),
            chosen.len(),
            cfg.table().len()
        );
        Ok(true)
    }
}
