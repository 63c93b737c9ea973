//! block reordering: splits blocks at random points and shuffles the layout.
use super::{repair_fallthroughs, Pass};
use crate::cfg::{BlockId, ControlFlowGraph};
use crate::error::PassError;
use log::debug;
use rand::{rngs::StdRng, seq::SliceRandom, Rng};

/// `intensity` is a percentage: it drives both how often blocks are split and how many blocks
/// are moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfOrder {
    pub intensity: u8,
}

impl OutOfOrder {
    pub fn new(intensity: u8) -> Self {
        OutOfOrder { intensity }
    }

    fn split(&self, cfg: &mut ControlFlowGraph, rng: &mut StdRng) -> Result<usize, PassError> {
        let p = self.intensity as f64 / 200.0;
        let plan: Vec<(BlockId, Vec<usize>)> = cfg
            .blocks()
            .iter()
            .map(|block| {
                let points = (1..block.insns.len())
                    .filter(|&at| block.insns[at - 1].op.falls_through() && rng.gen_bool(p))
                    .collect();
                (block.id, points)
            })
            .collect();

        let mut splits = 0;
        for (id, points) in plan {
            // highest point first so lower indices stay valid
            for &at in points.iter().rev() {
                cfg.split_block(id, at)
                    .map_err(|source| PassError::Inconsistent {
                        pass: self.name(),
                        source,
                    })?;
                splits += 1;
            }
        }
        Ok(splits)
    }
}

impl Pass for OutOfOrder {
    fn name(&self) -> &'static str {
        "out_of_order"
    }

    fn apply(&self, cfg: &mut ControlFlowGraph, rng: &mut StdRng) -> Result<bool, PassError> {
        if self.intensity > 100 {
            return Err(PassError::Intensity {
                pass: self.name(),
                intensity: self.intensity,
            });
        }
        let eligible = cfg.blocks().iter().filter(|b| !b.indirect_entry).count();
        if eligible < 2 {
            return Err(PassError::NoCandidate {
                pass: self.name(),
                what: "pair of movable blocks",
            });
        }

        let splits = self.split(cfg, rng)?;

        // blocks reached through computed jumps keep their place
        let movable: Vec<BlockId> = cfg
            .blocks()
            .iter()
            .filter(|b| !b.indirect_entry)
            .map(|b| b.id)
            .collect();
        let count = (movable.len() * self.intensity as usize).div_ceil(100);
        let mut moved = 0;
        for _ in 0..count {
            let Some(&id) = movable.choose(rng) else {
                break;
            };
            let Some(from) = cfg.position(id) else {
                continue;
            };
            let blocks = cfg.blocks_mut();
            let block = blocks.remove(from);
            let to = rng.gen_range(0..=blocks.len());
            blocks.insert(to, block);
            if to != from {
                moved += 1;
            }
        }

        let jumps = repair_fallthroughs(cfg);
        debug!(
            "{}({}): {} splits, {} moves, {} jumps added",
            self.name(),
            self.intensity,
            splits,
            moved,
            jumps
        );
        Ok(splits > 0 || moved > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::cfg::{Op, Target};
    use crate::decoder::BranchShape;
    use rand::SeedableRng;

    fn assert_layout_consistent(cfg: &ControlFlowGraph) {
        cfg.validate().unwrap();
        let blocks = cfg.blocks();
        for (i, block) in blocks.iter().enumerate() {
            match block.fallthrough {
                Some(Target::Block(id)) => assert_eq!(blocks[i + 1].id, id),
                Some(Target::External(_)) => assert_eq!(i + 1, blocks.len()),
                None => {}
            }
        }
    }

    #[test]
    fn test_rejects_intensity_above_100() {
        let mut cfg = graph(&FUNCTION);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(
            OutOfOrder::new(101).apply(&mut cfg, &mut rng),
            Err(PassError::Intensity {
                pass: "out_of_order",
                intensity: 101
            })
        );
    }

    #[test]
    fn test_needs_two_movable_blocks() {
        // single block: inc eax; ret
        let mut cfg = graph(&[0x40, 0xc3]);
        let mut rng = StdRng::seed_from_u64(1);
        assert!(matches!(
            OutOfOrder::new(50).apply(&mut cfg, &mut rng),
            Err(PassError::NoCandidate { .. })
        ));
    }

    #[test]
    fn test_reorder_repairs_fallthroughs() {
        for seed in 0..32 {
            let mut cfg = graph(&FUNCTION);
            let originals = cfg.insn_count();
            let mut rng = StdRng::seed_from_u64(seed);
            OutOfOrder::new(100).apply(&mut cfg, &mut rng).unwrap();
            assert_layout_consistent(&cfg);
            // only explicit jumps were added
            let jumps = count_ops(&cfg, |op| {
                matches!(
                    op,
                    Op::Branch {
                        shape: BranchShape::Jmp,
                        ..
                    }
                )
            });
            assert_eq!(cfg.insn_count() - originals, jumps - 1);
        }
    }

    #[test]
    fn test_zero_intensity_keeps_layout() {
        let mut cfg = graph(&FUNCTION);
        let before = cfg.clone();
        let mut rng = StdRng::seed_from_u64(3);
        assert!(!OutOfOrder::new(0).apply(&mut cfg, &mut rng).unwrap());
        assert_eq!(cfg, before);
    }

    #[test]
    fn test_indirect_entries_stay_put() {
        // jmp eax; inc eax; ret; dec eax; ret
        let mut cfg = graph(&[0xff, 0xe0, 0x40, 0xc3, 0x48, 0xc3]);
        assert!(cfg.blocks()[1].indirect_entry);
        assert!(cfg.blocks()[2].indirect_entry);
        let mut rng = StdRng::seed_from_u64(3);
        // only the entry is movable
        assert!(OutOfOrder::new(100).apply(&mut cfg, &mut rng).is_err());
    }
}
