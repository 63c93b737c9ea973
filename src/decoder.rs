//! module for decoding ia-32 machine code into instruction records.
//! splits a designated byte range into discrete instructions and classifies every one of them by how
//! it transfers control, which is all the control-flow model needs to cut the range into blocks.
use crate::addr::{AddrRange, OrigAddr};
use crate::error::DecodeError;
use iced_x86::{
    Code, ConditionCode, Decoder, DecoderError, DecoderOptions, FlowControl, Formatter,
    Instruction as RawInsn, IntelFormatter, Mnemonic, OpKind,
};

/// the engine only handles protected-mode 32-bit code.
pub const BITNESS: u32 = 32;

/// how an instruction hands over control once it has executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowKind {
    Sequential,
    ConditionalBranch,
    UnconditionalBranch,
    Call,
    Return,
    /// target unknown until runtime (`jmp eax`, `jmp [table+ecx*4]`, far jumps, `ud2`).
    Indirect,
}

/// x86 condition code, numbered the way the `jcc`/`cmovcc` opcodes encode it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cond {
    O,
    No,
    B,
    Ae,
    E,
    Ne,
    Be,
    A,
    S,
    Ns,
    P,
    Np,
    L,
    Ge,
    Le,
    G,
}

const CONDS: [Cond; 16] = [
    Cond::O,
    Cond::No,
    Cond::B,
    Cond::Ae,
    Cond::E,
    Cond::Ne,
    Cond::Be,
    Cond::A,
    Cond::S,
    Cond::Ns,
    Cond::P,
    Cond::Np,
    Cond::L,
    Cond::Ge,
    Cond::Le,
    Cond::G,
];

impl Cond {
    /// the low nibble of `jcc`/`setcc`/`cmovcc` opcodes.
    pub fn nibble(self) -> u8 {
        self as u8
    }

    pub fn from_nibble(n: u8) -> Cond {
        CONDS[(n & 0x0f) as usize]
    }

    /// the condition that holds exactly when this one does not.
    pub fn inverse(self) -> Cond {
        Cond::from_nibble(self.nibble() ^ 1)
    }

    pub(crate) fn from_iced(cc: ConditionCode) -> Option<Cond> {
        Some(match cc {
            ConditionCode::o => Cond::O,
            ConditionCode::no => Cond::No,
            ConditionCode::b => Cond::B,
            ConditionCode::ae => Cond::Ae,
            ConditionCode::e => Cond::E,
            ConditionCode::ne => Cond::Ne,
            ConditionCode::be => Cond::Be,
            ConditionCode::a => Cond::A,
            ConditionCode::s => Cond::S,
            ConditionCode::ns => Cond::Ns,
            ConditionCode::p => Cond::P,
            ConditionCode::np => Cond::Np,
            ConditionCode::l => Cond::L,
            ConditionCode::ge => Cond::Ge,
            ConditionCode::le => Cond::Le,
            ConditionCode::g => Cond::G,
            _ => return None,
        })
    }

    /// `cmovcc r32, r/m32` for this condition.
    pub fn cmov_code(self) -> Code {
        match self {
            Cond::O => Code::Cmovo_r32_rm32,
            Cond::No => Code::Cmovno_r32_rm32,
            Cond::B => Code::Cmovb_r32_rm32,
            Cond::Ae => Code::Cmovae_r32_rm32,
            Cond::E => Code::Cmove_r32_rm32,
            Cond::Ne => Code::Cmovne_r32_rm32,
            Cond::Be => Code::Cmovbe_r32_rm32,
            Cond::A => Code::Cmova_r32_rm32,
            Cond::S => Code::Cmovs_r32_rm32,
            Cond::Ns => Code::Cmovns_r32_rm32,
            Cond::P => Code::Cmovp_r32_rm32,
            Cond::Np => Code::Cmovnp_r32_rm32,
            Cond::L => Code::Cmovl_r32_rm32,
            Cond::Ge => Code::Cmovge_r32_rm32,
            Cond::Le => Code::Cmovle_r32_rm32,
            Cond::G => Code::Cmovg_r32_rm32,
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            Cond::O => "o",
            Cond::No => "no",
            Cond::B => "b",
            Cond::Ae => "ae",
            Cond::E => "e",
            Cond::Ne => "ne",
            Cond::Be => "be",
            Cond::A => "a",
            Cond::S => "s",
            Cond::Ns => "ns",
            Cond::P => "p",
            Cond::Np => "np",
            Cond::L => "l",
            Cond::Ge => "ge",
            Cond::Le => "le",
            Cond::G => "g",
        }
    }
}

/// the rel8-only counter branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopOp {
    Loopne,
    Loope,
    Loop,
    Jecxz,
}

impl LoopOp {
    pub fn opcode(self) -> u8 {
        match self {
            LoopOp::Loopne => 0xe0,
            LoopOp::Loope => 0xe1,
            LoopOp::Loop => 0xe2,
            LoopOp::Jecxz => 0xe3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            LoopOp::Loopne => "loopne",
            LoopOp::Loope => "loope",
            LoopOp::Loop => "loop",
            LoopOp::Jecxz => "jecxz",
        }
    }
}

/// the relative control transfers the engine can relocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BranchShape {
    Jmp,
    Jcc(Cond),
    Call,
    Loop(LoopOp),
}

/// size class of a relative displacement field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Width {
    /// rel8
    Short,
    /// rel32
    Near,
}

impl BranchShape {
    pub fn kind(self) -> FlowKind {
        match self {
            BranchShape::Jmp => FlowKind::UnconditionalBranch,
            BranchShape::Jcc(_) | BranchShape::Loop(_) => FlowKind::ConditionalBranch,
            BranchShape::Call => FlowKind::Call,
        }
    }

    /// encoded length without legacy prefixes.
    ///
    /// a near counter branch has no native encoding, so it is expanded to
    /// `loop +2; jmp short +5; jmp rel32`.
    pub fn encoded_len(self, width: Width) -> usize {
        match (self, width) {
            (BranchShape::Jmp, Width::Short)
            | (BranchShape::Jcc(_), Width::Short)
            | (BranchShape::Loop(_), Width::Short) => 2,
            (BranchShape::Jmp, Width::Near) | (BranchShape::Call, _) => 5,
            (BranchShape::Jcc(_), Width::Near) => 6,
            (BranchShape::Loop(_), Width::Near) => 9,
        }
    }

    /// the narrowest width this shape can be encoded with.
    pub fn narrowest(self) -> Width {
        match self {
            BranchShape::Call => Width::Near,
            _ => Width::Short,
        }
    }
}

/// branch details of a decoded relative transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedBranch {
    pub shape: BranchShape,
    pub width: Width,
    pub target: OrigAddr,
    /// legacy prefixes in front of the opcode (branch hints, address size), kept verbatim.
    pub prefix: Vec<u8>,
}

/// one decoded instruction of the designated range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInsn {
    pub address: OrigAddr,
    pub bytes: Vec<u8>,
    pub raw: RawInsn,
    pub kind: FlowKind,
    pub branch: Option<DecodedBranch>,
}

impl DecodedInsn {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// address of the instruction that follows this one in the original stream.
    pub fn next(&self) -> OrigAddr {
        OrigAddr::new(self.address.get().wrapping_add(self.bytes.len() as u32))
    }

    pub fn mnemonic(&self) -> Mnemonic {
        self.raw.mnemonic()
    }
}

/// decodes `bytes`, the contents of `range`, into instruction records.
///
/// # arguments
/// * `bytes` - raw machine code; must be exactly `range.len()` bytes long.
/// * `range` - the virtual addresses `bytes` is mapped at.
///
/// # returns
/// the instructions in address order, or the first reason the range is not a clean instruction
/// stream.
///
/// # example
/// ```
/// use xbo::addr::{AddrRange, OrigAddr};
/// use xbo::decoder::{decode, FlowKind};
///
/// let code = [0x55, 0x89, 0xe5, 0x5d, 0xc3]; // push ebp; mov ebp, esp; pop ebp; ret
/// let range = AddrRange::new(OrigAddr::new(0x401000), OrigAddr::new(0x401005)).unwrap();
/// let insns = decode(&code, range).unwrap();
/// assert_eq!(insns.len(), 4);
/// assert_eq!(insns[3].kind, FlowKind::Return);
/// ```
pub fn decode(bytes: &[u8], range: AddrRange) -> Result<Vec<DecodedInsn>, DecodeError> {
    if bytes.len() != range.len() as usize {
        return Err(DecodeError::LengthMismatch {
            range,
            expected: range.len() as usize,
            actual: bytes.len(),
        });
    }

    let mut decoder = Decoder::with_ip(
        BITNESS,
        bytes,
        range.begin.get() as u64,
        DecoderOptions::NONE,
    );
    let mut raw = RawInsn::default();
    let mut insns = Vec::new();

    while decoder.can_decode() {
        let offset = decoder.position();
        let at = OrigAddr::new(range.begin.get().wrapping_add(offset as u32));
        decoder.decode_out(&mut raw);

        if raw.is_invalid() {
            return Err(match decoder.last_error() {
                DecoderError::NoMoreBytes => DecodeError::TruncatedInstruction(at),
                _ => DecodeError::InvalidOpcode(at),
            });
        }

        let encoded = bytes[offset..offset + raw.len()].to_vec();
        insns.push(classify(at, encoded, raw)?);
    }

    log::debug!("decoded {} instructions in {}", insns.len(), range);
    Ok(insns)
}

fn classify(at: OrigAddr, bytes: Vec<u8>, raw: RawInsn) -> Result<DecodedInsn, DecodeError> {
    let unsupported = || DecodeError::Unsupported {
        at,
        text: format_raw(&raw),
    };

    let kind = match raw.flow_control() {
        FlowControl::Next | FlowControl::Interrupt => FlowKind::Sequential,
        FlowControl::Return => FlowKind::Return,
        FlowControl::IndirectBranch | FlowControl::Exception => FlowKind::Indirect,
        FlowControl::IndirectCall => FlowKind::Call,
        FlowControl::XbeginXabortXend => return Err(unsupported()),
        FlowControl::UnconditionalBranch | FlowControl::ConditionalBranch | FlowControl::Call => {
            return classify_relative(at, bytes, raw);
        }
    };

    Ok(DecodedInsn {
        address: at,
        bytes,
        raw,
        kind,
        branch: None,
    })
}

fn classify_relative(
    at: OrigAddr,
    bytes: Vec<u8>,
    raw: RawInsn,
) -> Result<DecodedInsn, DecodeError> {
    let unsupported = || DecodeError::Unsupported {
        at,
        text: format_raw(&raw),
    };

    match raw.op0_kind() {
        OpKind::NearBranch32 => {}
        // ptr16:32 operands are absolute, the bytes stay valid anywhere
        OpKind::FarBranch32 | OpKind::FarBranch16 => {
            let kind = if raw.flow_control() == FlowControl::Call {
                FlowKind::Call
            } else {
                FlowKind::Indirect
            };
            return Ok(DecodedInsn {
                address: at,
                bytes,
                raw,
                kind,
                branch: None,
            });
        }
        _ => return Err(unsupported()),
    }

    let (shape, width) = match raw.mnemonic() {
        Mnemonic::Loop => (BranchShape::Loop(LoopOp::Loop), Width::Short),
        Mnemonic::Loope => (BranchShape::Loop(LoopOp::Loope), Width::Short),
        Mnemonic::Loopne => (BranchShape::Loop(LoopOp::Loopne), Width::Short),
        Mnemonic::Jecxz | Mnemonic::Jcxz => (BranchShape::Loop(LoopOp::Jecxz), Width::Short),
        _ if raw.is_jmp_short() => (BranchShape::Jmp, Width::Short),
        _ if raw.is_jmp_near() => (BranchShape::Jmp, Width::Near),
        _ if raw.is_call_near() => (BranchShape::Call, Width::Near),
        _ if raw.is_jcc_short() || raw.is_jcc_near() => {
            let cond = Cond::from_iced(raw.condition_code()).ok_or_else(unsupported)?;
            let width = if raw.is_jcc_short() {
                Width::Short
            } else {
                Width::Near
            };
            (BranchShape::Jcc(cond), width)
        }
        _ => return Err(unsupported()),
    };

    let prefix_len = bytes
        .len()
        .checked_sub(shape.encoded_len(width))
        .ok_or_else(unsupported)?;
    let prefix = bytes[..prefix_len].to_vec();

    Ok(DecodedInsn {
        address: at,
        raw,
        kind: shape.kind(),
        branch: Some(DecodedBranch {
            shape,
            width,
            target: OrigAddr::new(raw.near_branch32()),
            prefix,
        }),
        bytes,
    })
}

/// intel-syntax rendering of a raw instruction, for listings and diagnostics.
pub fn format_raw(raw: &RawInsn) -> String {
    let mut formatter = IntelFormatter::new();
    let mut out = String::new();
    formatter.format(raw, &mut out);
    out
}
