//! instruction substitution: swaps instructions for equivalent sequences.
//!
//! every alternative is either flag-exact (same result, same status flags) or flag-clobbering
//! (same result, different flags). clobbering alternatives are only used where flag liveness
//! says no status flag is read before being written again.
use super::{encode_error, Pass, GENERAL, MAX_SUBSTITUTION_DEPTH};
use crate::cfg::{ControlFlowGraph, Instruction, Op};
use crate::decoder::FlowKind;
use crate::error::PassError;
use crate::liveness::FlagLiveness;
use iced_x86::{Code, IcedError, Instruction as RawInsn, MemoryOperand, OpKind, Register};
use log::debug;
use rand::{rngs::StdRng, Rng};

const PROBABILITY: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Effect {
    Exact,
    Clobbers,
}

type Alternative = (Effect, Vec<Result<RawInsn, IcedError>>);

fn mov_imm(r: Register, v: u32) -> Result<RawInsn, IcedError> {
    RawInsn::with2(Code::Mov_r32_imm32, r, v)
}

fn lea(r: Register, mem: MemoryOperand) -> Result<RawInsn, IcedError> {
    RawInsn::with2(Code::Lea_r32_m, r, mem)
}

fn push(r: Register) -> Result<RawInsn, IcedError> {
    RawInsn::with1(Code::Push_r32, r)
}

fn pop(r: Register) -> Result<RawInsn, IcedError> {
    RawInsn::with1(Code::Pop_r32, r)
}

fn stack_down() -> Result<RawInsn, IcedError> {
    lea(Register::ESP, MemoryOperand::with_base_displ(Register::ESP, -4))
}

fn stack_up() -> Result<RawInsn, IcedError> {
    lea(Register::ESP, MemoryOperand::with_base_displ(Register::ESP, 4))
}

fn top() -> MemoryOperand {
    MemoryOperand::with_base(Register::ESP)
}

fn reg(raw: &RawInsn, operand: u32) -> Option<Register> {
    (raw.op_kind(operand) == OpKind::Register).then(|| raw.op_register(operand))
}

fn imm(raw: &RawInsn, operand: u32) -> Option<u32> {
    match raw.op_kind(operand) {
        OpKind::Immediate8 | OpKind::Immediate32 | OpKind::Immediate8to32 => {
            Some(raw.immediate(operand) as u32)
        }
        _ => None,
    }
}

/// two register operands naming the same register.
fn same_reg(raw: &RawInsn) -> Option<Register> {
    let a = reg(raw, 0)?;
    (reg(raw, 1)? == a).then_some(a)
}

fn eligible(raw: &RawInsn) -> bool {
    if raw.has_lock_prefix() || raw.segment_prefix() != Register::None {
        return false;
    }
    (0..raw.op_count()).all(|i| reg(raw, i) != Some(Register::ESP))
}

/// the equivalence class of `raw`, or nothing when it has none.
fn alternatives(raw: &RawInsn, rng: &mut StdRng) -> Vec<Alternative> {
    use Effect::*;
    let k: u32 = rng.gen();
    match raw.code() {
        Code::Mov_r32_imm32 | Code::Mov_rm32_imm32 => {
            let (Some(r), Some(v)) = (reg(raw, 0), imm(raw, 1)) else {
                return Vec::new();
            };
            vec![
                (Exact, vec![RawInsn::with1(Code::Pushd_imm32, v), pop(r)]),
                (Exact, vec![lea(r, MemoryOperand::with_displ(v as u64, 4))]),
                (
                    Clobbers,
                    vec![
                        mov_imm(r, v ^ k),
                        RawInsn::with2(Code::Xor_rm32_imm32, r, k),
                    ],
                ),
                (
                    Clobbers,
                    vec![
                        mov_imm(r, v.wrapping_sub(k)),
                        RawInsn::with2(Code::Add_rm32_imm32, r, k),
                    ],
                ),
            ]
        }
        Code::Mov_r32_rm32 | Code::Mov_rm32_r32 => {
            let (Some(dst), Some(src)) = (reg(raw, 0), reg(raw, 1)) else {
                return Vec::new();
            };
            vec![
                (Exact, vec![push(src), pop(dst)]),
                (Exact, vec![lea(dst, MemoryOperand::with_base(src))]),
            ]
        }
        Code::Add_rm32_imm32 | Code::Add_rm32_imm8 | Code::Add_EAX_imm32 => {
            let (Some(r), Some(v)) = (reg(raw, 0), imm(raw, 1)) else {
                return Vec::new();
            };
            vec![
                (
                    Clobbers,
                    vec![RawInsn::with2(Code::Sub_rm32_imm32, r, v.wrapping_neg())],
                ),
                (
                    Clobbers,
                    vec![lea(r, MemoryOperand::with_base_displ(r, v as i32 as i64))],
                ),
                (
                    Clobbers,
                    vec![
                        RawInsn::with2(Code::Add_rm32_imm32, r, k),
                        RawInsn::with2(Code::Add_rm32_imm32, r, v.wrapping_sub(k)),
                    ],
                ),
            ]
        }
        Code::Sub_rm32_imm32 | Code::Sub_rm32_imm8 | Code::Sub_EAX_imm32 => {
            let (Some(r), Some(v)) = (reg(raw, 0), imm(raw, 1)) else {
                return Vec::new();
            };
            vec![
                (
                    Clobbers,
                    vec![RawInsn::with2(Code::Add_rm32_imm32, r, v.wrapping_neg())],
                ),
                (
                    Clobbers,
                    vec![lea(
                        r,
                        MemoryOperand::with_base_displ(r, v.wrapping_neg() as i32 as i64),
                    )],
                ),
            ]
        }
        Code::Inc_r32 | Code::Inc_rm32 | Code::Dec_r32 | Code::Dec_rm32 => {
            let Some(r) = reg(raw, 0) else {
                return Vec::new();
            };
            let step: i32 = if matches!(raw.code(), Code::Inc_r32 | Code::Inc_rm32) {
                1
            } else {
                -1
            };
            vec![
                (
                    Clobbers,
                    vec![RawInsn::with2(Code::Add_rm32_imm8, r, step)],
                ),
                (
                    Clobbers,
                    vec![RawInsn::with2(Code::Sub_rm32_imm8, r, -step)],
                ),
                (
                    Clobbers,
                    vec![lea(r, MemoryOperand::with_base_displ(r, step as i64))],
                ),
            ]
        }
        Code::Xor_r32_rm32 | Code::Xor_rm32_r32 | Code::Sub_r32_rm32 | Code::Sub_rm32_r32 => {
            let Some(r) = same_reg(raw) else {
                return Vec::new();
            };
            vec![
                (Exact, vec![RawInsn::with2(Code::Xor_rm32_r32, r, r)]),
                (Exact, vec![RawInsn::with2(Code::Sub_rm32_r32, r, r)]),
                (Exact, vec![RawInsn::with2(Code::And_rm32_imm8, r, 0i32)]),
                (Clobbers, vec![mov_imm(r, 0)]),
                (
                    Clobbers,
                    vec![RawInsn::with1(Code::Pushd_imm8, 0i32), pop(r)],
                ),
            ]
        }
        Code::Push_r32 => {
            let Some(r) = reg(raw, 0) else {
                return Vec::new();
            };
            vec![
                (
                    Exact,
                    vec![stack_down(), RawInsn::with2(Code::Mov_rm32_r32, top(), r)],
                ),
                (
                    Clobbers,
                    vec![
                        RawInsn::with2(Code::Sub_rm32_imm8, Register::ESP, 4i32),
                        RawInsn::with2(Code::Mov_rm32_r32, top(), r),
                    ],
                ),
            ]
        }
        Code::Pop_r32 => {
            let Some(r) = reg(raw, 0) else {
                return Vec::new();
            };
            vec![
                (
                    Exact,
                    vec![RawInsn::with2(Code::Mov_r32_rm32, r, top()), stack_up()],
                ),
                (
                    Clobbers,
                    vec![
                        RawInsn::with2(Code::Mov_r32_rm32, r, top()),
                        RawInsn::with2(Code::Add_rm32_imm8, Register::ESP, 4i32),
                    ],
                ),
            ]
        }
        Code::Pushd_imm32 | Code::Pushd_imm8 => {
            let Some(v) = imm(raw, 0) else {
                return Vec::new();
            };
            vec![(
                Exact,
                vec![stack_down(), RawInsn::with2(Code::Mov_rm32_imm32, top(), v)],
            )]
        }
        Code::Not_rm32 => {
            let Some(r) = reg(raw, 0) else {
                return Vec::new();
            };
            vec![(
                Clobbers,
                vec![RawInsn::with2(Code::Xor_rm32_imm32, r, u32::MAX)],
            )]
        }
        Code::Neg_rm32 => {
            let Some(r) = reg(raw, 0) else {
                return Vec::new();
            };
            vec![(
                Clobbers,
                vec![
                    RawInsn::with1(Code::Not_rm32, r),
                    RawInsn::with1(Code::Inc_rm32, r),
                ],
            )]
        }
        Code::Test_rm32_r32
        | Code::Or_rm32_r32
        | Code::Or_r32_rm32
        | Code::And_rm32_r32
        | Code::And_r32_rm32
        | Code::Cmp_rm32_imm8
        | Code::Cmp_rm32_imm32 => {
            let r = match raw.code() {
                Code::Cmp_rm32_imm8 | Code::Cmp_rm32_imm32 => match (reg(raw, 0), imm(raw, 1)) {
                    (Some(r), Some(0)) => r,
                    _ => return Vec::new(),
                },
                _ => match same_reg(raw) {
                    Some(r) => r,
                    None => return Vec::new(),
                },
            };
            vec![
                (Exact, vec![RawInsn::with2(Code::Test_rm32_r32, r, r)]),
                (Exact, vec![RawInsn::with2(Code::Cmp_rm32_imm8, r, 0i32)]),
                (Exact, vec![RawInsn::with2(Code::Or_rm32_r32, r, r)]),
                (Exact, vec![RawInsn::with2(Code::And_rm32_r32, r, r)]),
            ]
        }
        Code::Nopd => {
            let r = GENERAL[rng.gen_range(0..GENERAL.len())];
            vec![
                (Exact, vec![RawInsn::with2(Code::Mov_r32_rm32, r, r)]),
                (Exact, vec![lea(r, MemoryOperand::with_base(r))]),
                (Exact, vec![push(r), pop(r)]),
            ]
        }
        _ => Vec::new(),
    }
}

pub struct EquivalentVariation;

impl EquivalentVariation {
    /// picks a replacement for `insn`, honouring the flags live after it.
    fn replacement(
        &self,
        insn: &Instruction,
        live_after: u32,
        rng: &mut StdRng,
    ) -> Result<Option<Vec<RawInsn>>, PassError> {
        let Op::Plain {
            raw,
            kind: FlowKind::Sequential,
            ..
        } = &insn.op
        else {
            return Ok(None);
        };
        if insn.depth >= MAX_SUBSTITUTION_DEPTH || !eligible(raw) {
            return Ok(None);
        }

        let mut allowed: Vec<Alternative> = alternatives(raw, rng)
            .into_iter()
            .filter(|(effect, _)| *effect == Effect::Exact || live_after == 0)
            .collect();
        if allowed.is_empty() {
            return Ok(None);
        }
        let (_, sequence) = allowed.swap_remove(rng.gen_range(0..allowed.len()));

        sequence
            .into_iter()
            .map(|r| r.map_err(|e| encode_error(self.name(), e)))
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }
}

impl Pass for EquivalentVariation {
    fn name(&self) -> &'static str {
        "equivalent_variation"
    }

    fn apply(&self, cfg: &mut ControlFlowGraph, rng: &mut StdRng) -> Result<bool, PassError> {
        let liveness = FlagLiveness::compute(cfg);
        let mut replaced = 0;
        let mut grown = 0;

        for b in 0..cfg.blocks().len() {
            let id = cfg.blocks()[b].id;
            let old = std::mem::take(&mut cfg.blocks_mut()[b].insns);
            let mut insns = Vec::with_capacity(old.len());

            for (i, insn) in old.into_iter().enumerate() {
                if !rng.gen_bool(PROBABILITY) {
                    insns.push(insn);
                    continue;
                }
                let Some(sequence) = self.replacement(&insn, liveness.live_after(id, i), rng)?
                else {
                    insns.push(insn);
                    continue;
                };

                replaced += 1;
                grown += sequence.len() - 1;
                for (n, raw) in sequence.into_iter().enumerate() {
                    let op = Op::plain(raw).map_err(|e| encode_error(self.name(), e))?;
                    let mut new = cfg.synthesize(insn.depth + 1, op);
                    if n == 0 {
                        new.origin = insn.origin;
                    }
                    insns.push(new);
                }
            }

            cfg.blocks_mut()[b].insns = insns;
        }

        debug!(
            "{}: replaced {} instructions, {} added",
            self.name(),
            replaced,
            grown
        );
        Ok(replaced > 0)
    }
}
