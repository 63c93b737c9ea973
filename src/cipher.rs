//! reversible 32-bit transforms protecting stored branch targets.
//! a cipher is a short list of steps; the runtime stub applies them in order to recover the
//! target, so the emitter stores the value obtained by running the inverses backwards.
use iced_x86::{Code, IcedError, Instruction as RawInsn, Register};
use rand::{rngs::StdRng, Rng};
use std::fmt;

/// one reversible operation on a 32-bit register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Xor(u32),
    Add(u32),
    Sub(u32),
    Rol(u8),
    Ror(u8),
    Not,
    Bswap,
}

impl Step {
    fn apply(self, v: u32) -> u32 {
        match self {
            Step::Xor(k) => v ^ k,
            Step::Add(k) => v.wrapping_add(k),
            Step::Sub(k) => v.wrapping_sub(k),
            Step::Rol(n) => v.rotate_left(n as u32),
            Step::Ror(n) => v.rotate_right(n as u32),
            Step::Not => !v,
            Step::Bswap => v.swap_bytes(),
        }
    }

    fn inverse(self) -> Step {
        match self {
            Step::Xor(k) => Step::Xor(k),
            Step::Add(k) => Step::Sub(k),
            Step::Sub(k) => Step::Add(k),
            Step::Rol(n) => Step::Ror(n),
            Step::Ror(n) => Step::Rol(n),
            Step::Not => Step::Not,
            Step::Bswap => Step::Bswap,
        }
    }

    fn random(rng: &mut StdRng) -> Step {
        match rng.gen_range(0..7) {
            0 => Step::Xor(rng.gen()),
            1 => Step::Add(rng.gen()),
            2 => Step::Sub(rng.gen()),
            3 => Step::Rol(rng.gen_range(1..32)),
            4 => Step::Ror(rng.gen_range(1..32)),
            5 => Step::Not,
            _ => Step::Bswap,
        }
    }

    /// the instruction performing this step on `reg`.
    fn instruction(self, reg: Register) -> Result<RawInsn, IcedError> {
        match self {
            Step::Xor(k) => RawInsn::with2(Code::Xor_rm32_imm32, reg, k),
            Step::Add(k) => RawInsn::with2(Code::Add_rm32_imm32, reg, k),
            Step::Sub(k) => RawInsn::with2(Code::Sub_rm32_imm32, reg, k),
            Step::Rol(n) => RawInsn::with2(Code::Rol_rm32_imm8, reg, n as u32),
            Step::Ror(n) => RawInsn::with2(Code::Ror_rm32_imm8, reg, n as u32),
            Step::Not => RawInsn::with1(Code::Not_rm32, reg),
            Step::Bswap => RawInsn::with1(Code::Bswap_r32, reg),
        }
    }
}

/// an ordered list of steps. `decode` is what runs at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cipher {
    steps: Vec<Step>,
}

impl Cipher {
    pub fn new(steps: Vec<Step>) -> Self {
        Cipher { steps }
    }

    /// draws between two and five steps.
    pub fn random(rng: &mut StdRng) -> Self {
        let len = rng.gen_range(2..=5);
        Cipher {
            steps: (0..len).map(|_| Step::random(rng)).collect(),
        }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn decode(&self, value: u32) -> u32 {
        self.steps.iter().fold(value, |v, step| step.apply(v))
    }

    pub fn encode(&self, value: u32) -> u32 {
        self.steps
            .iter()
            .rev()
            .fold(value, |v, step| step.inverse().apply(v))
    }

    /// the runtime decoder operating in place on `reg`. clobbers the status flags.
    pub fn instructions(&self, reg: Register) -> Result<Vec<RawInsn>, IcedError> {
        self.steps.iter().map(|step| step.instruction(reg)).collect()
    }
}

impl fmt::Display for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, step) in self.steps.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            match step {
                Step::Xor(k) => write!(f, "xor:{:#x}", k)?,
                Step::Add(k) => write!(f, "add:{:#x}", k)?,
                Step::Sub(k) => write!(f, "sub:{:#x}", k)?,
                Step::Rol(n) => write!(f, "rol:{}", n)?,
                Step::Ror(n) => write!(f, "ror:{}", n)?,
                Step::Not => write!(f, "not")?,
                Step::Bswap => write!(f, "bswap")?,
            }
        }
        Ok(())
    }
}
