//! junk insertion: drops do-nothing sequences into blocks.
use super::{encode_error, scratch, select_some, Pass, MAX_SUBSTITUTION_DEPTH};
use crate::cfg::{BlockId, ControlFlowGraph, Op};
use crate::error::PassError;
use crate::liveness::FlagLiveness;
use iced_x86::{Code, IcedError, Instruction as RawInsn, MemoryOperand, Register};
use log::debug;
use rand::{rngs::StdRng, Rng};

const PROBABILITY: f64 = 0.5;

/// longest run of garbage a flower jump skips.
const MAX_FLOWER: u8 = 6;

/// an arithmetic step on `r` used to churn a saved register.
fn churn(r: Register, rng: &mut StdRng) -> Result<RawInsn, IcedError> {
    match rng.gen_range(0..4) {
        0 => RawInsn::with2(Code::Add_rm32_imm32, r, rng.gen::<u32>()),
        1 => RawInsn::with2(Code::Xor_rm32_imm32, r, rng.gen::<u32>()),
        2 => RawInsn::with2(Code::Rol_rm32_imm8, r, rng.gen_range(1u32..32)),
        _ => RawInsn::with1(Code::Neg_rm32, r),
    }
}

/// a sequence that leaves every register, memory above esp and (when `live != 0`) every
/// status flag as it found them.
fn sequence(live: u32, rng: &mut StdRng) -> Result<Vec<Op>, IcedError> {
    let r = scratch(rng);
    let choices = if live == 0 { 6 } else { 5 };
    let raw = match rng.gen_range(0..choices) {
        0 => {
            if rng.gen_bool(0.5) {
                vec![RawInsn::with2(
                    Code::Lea_r32_m,
                    r,
                    MemoryOperand::with_base(r),
                )?]
            } else {
                vec![RawInsn::with2(Code::Mov_r32_rm32, r, r)?]
            }
        }
        1 => vec![
            RawInsn::with1(Code::Push_r32, r)?,
            RawInsn::with1(Code::Pop_r32, r)?,
        ],
        2 => {
            let k = 4 * rng.gen_range(1i64..=8);
            vec![
                RawInsn::with2(
                    Code::Lea_r32_m,
                    Register::ESP,
                    MemoryOperand::with_base_displ(Register::ESP, -k),
                )?,
                RawInsn::with2(
                    Code::Lea_r32_m,
                    Register::ESP,
                    MemoryOperand::with_base_displ(Register::ESP, k),
                )?,
            ]
        }
        3 => {
            let mut raw = vec![RawInsn::with(Code::Pushfd), RawInsn::with1(Code::Push_r32, r)?];
            for _ in 0..rng.gen_range(1..=3) {
                raw.push(churn(r, rng)?);
            }
            raw.push(RawInsn::with1(Code::Pop_r32, r)?);
            raw.push(RawInsn::with(Code::Popfd));
            raw
        }
        4 => {
            // jmp short over garbage
            let n = rng.gen_range(1..=MAX_FLOWER);
            let mut bytes = vec![0xeb, n];
            bytes.extend((0..n).map(|_| rng.gen::<u8>()));
            return Ok(vec![Op::Junk(bytes)]);
        }
        _ => {
            let mut raw = vec![RawInsn::with1(Code::Push_r32, r)?];
            for _ in 0..rng.gen_range(1..=3) {
                raw.push(churn(r, rng)?);
            }
            raw.push(RawInsn::with1(Code::Pop_r32, r)?);
            raw
        }
    };
    raw.into_iter().map(Op::plain).collect()
}

pub struct LocalObf;

impl Pass for LocalObf {
    fn name(&self) -> &'static str {
        "local_obf"
    }

    fn apply(&self, cfg: &mut ControlFlowGraph, rng: &mut StdRng) -> Result<bool, PassError> {
        let candidates: Vec<BlockId> = cfg
            .blocks()
            .iter()
            .filter(|b| !b.insns.is_empty())
            .map(|b| b.id)
            .collect();
        if candidates.is_empty() {
            return Err(PassError::NoCandidate {
                pass: self.name(),
                what: "insertion point",
            });
        }

        let liveness = FlagLiveness::compute(cfg);
        let chosen = select_some(&candidates, PROBABILITY, rng);
        let mut inserted = 0;

        for id in &chosen {
            let Some(len) = cfg.block(*id).map(|b| b.insns.len()) else {
                continue;
            };
            // any gap up to and including the one before the terminator
            let gap = rng.gen_range(0..len);
            let ops = sequence(liveness.live_at(*id, gap), rng)
                .map_err(|e| encode_error(self.name(), e))?;
            let insns: Vec<_> = ops
                .into_iter()
                .map(|op| cfg.synthesize(MAX_SUBSTITUTION_DEPTH - 1, op))
                .collect();
            inserted += insns.len();
            if let Some(block) = cfg.block_mut(*id) {
                block.insns.splice(gap..gap, insns);
            }
        }

        debug!(
            "{}: {} instructions of junk in {} blocks",
            self.name(),
            inserted,
            chosen.len()
        );
        Ok(inserted > 0)
    }
}
