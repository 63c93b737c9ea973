//! a small ia-32 interpreter for checking that rewritten code still does what the original did.
//!
//! covers the integer subset the decoder, the passes and the test programs produce. both versions
//! of a program start from the same registers and memory; the registers, status flags and a data
//! window are compared once each returns to the sentinel address.
use crate::addr::{NewAddr, OrigAddr};
use crate::decoder::{Cond, BITNESS};
use crate::image::FlatImage;
use crate::session::{ObfuscationSession, SessionConfig, SessionOutput};
use iced_x86::{Decoder, DecoderOptions, Instruction, Mnemonic, OpKind, Register};
use std::collections::HashMap;

pub const CF: u32 = 1 << 0;
pub const PF: u32 = 1 << 2;
pub const AF: u32 = 1 << 4;
pub const ZF: u32 = 1 << 6;
pub const SF: u32 = 1 << 7;
pub const DF: u32 = 1 << 10;
pub const OF: u32 = 1 << 11;
pub const STATUS: u32 = CF | PF | AF | ZF | SF | OF;

/// eflags bit 1 always reads as set.
const RESERVED: u32 = 1 << 1;

const PAGE: u32 = 0x1000;

pub const STACK_TOP: u32 = 0x0080_0000;
pub const SENTINEL: u32 = 0xdead_0000;
pub const DATA: u32 = 0x0050_0000;
pub const DATA_LEN: u32 = 0x40;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    Decode(u32),
    Unsupported { eip: u32, text: String },
    StepLimit(u32),
}

/// sparse little-endian memory; untouched bytes read as zero.
#[derive(Debug, Clone, Default)]
pub struct Memory {
    pages: HashMap<u32, Box<[u8; PAGE as usize]>>,
}

impl Memory {
    pub fn read_u8(&self, addr: u32) -> u8 {
        self.pages
            .get(&(addr / PAGE))
            .map_or(0, |page| page[(addr % PAGE) as usize])
    }

    pub fn write_u8(&mut self, addr: u32, value: u8) {
        let page = self
            .pages
            .entry(addr / PAGE)
            .or_insert_with(|| Box::new([0; PAGE as usize]));
        page[(addr % PAGE) as usize] = value;
    }

    pub fn read_u32(&self, addr: u32) -> u32 {
        u32::from_le_bytes([0, 1, 2, 3].map(|i| self.read_u8(addr.wrapping_add(i))))
    }

    pub fn write_u32(&mut self, addr: u32, value: u32) {
        self.load(addr, &value.to_le_bytes());
    }

    pub fn load(&mut self, addr: u32, bytes: &[u8]) {
        for (i, b) in bytes.iter().enumerate() {
            self.write_u8(addr.wrapping_add(i as u32), *b);
        }
    }

    pub fn read(&self, addr: u32, len: u32) -> Vec<u8> {
        (0..len).map(|i| self.read_u8(addr.wrapping_add(i))).collect()
    }
}

/// architectural state compared between runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cpu {
    /// eax, ecx, edx, ebx, esp, ebp, esi, edi
    pub regs: [u32; 8],
    pub eip: u32,
    pub eflags: u32,
}

fn slot(reg: Register) -> Option<usize> {
    Some(match reg {
        Register::EAX => 0,
        Register::ECX => 1,
        Register::EDX => 2,
        Register::EBX => 3,
        Register::ESP => 4,
        Register::EBP => 5,
        Register::ESI => 6,
        Register::EDI => 7,
        _ => return None,
    })
}

fn parity(value: u32) -> bool {
    (value as u8).count_ones() % 2 == 0
}

pub struct Emulator {
    pub cpu: Cpu,
    pub mem: Memory,
    pub steps: u64,
}

impl Emulator {
    pub fn new(mem: Memory, regs: [u32; 8], eflags: u32) -> Self {
        Emulator {
            cpu: Cpu {
                regs,
                eip: 0,
                eflags: (eflags & (STATUS | DF)) | RESERVED,
            },
            mem,
            steps: 0,
        }
    }

    fn unsupported(&self, insn: &Instruction) -> Fault {
        Fault::Unsupported {
            eip: insn.ip32(),
            text: insn.to_string(),
        }
    }

    fn reg(&self, insn: &Instruction, reg: Register) -> Result<u32, Fault> {
        if let Some(i) = slot(reg) {
            return Ok(self.cpu.regs[i]);
        }
        // low byte registers only show up as shift counts and byte tests
        match reg {
            Register::AL => Ok(self.cpu.regs[0] & 0xff),
            Register::CL => Ok(self.cpu.regs[1] & 0xff),
            Register::DL => Ok(self.cpu.regs[2] & 0xff),
            Register::BL => Ok(self.cpu.regs[3] & 0xff),
            _ => Err(self.unsupported(insn)),
        }
    }

    fn set_reg(&mut self, insn: &Instruction, reg: Register, value: u32) -> Result<(), Fault> {
        let i = slot(reg).ok_or_else(|| self.unsupported(insn))?;
        self.cpu.regs[i] = value;
        Ok(())
    }

    fn address(&self, insn: &Instruction) -> Result<u32, Fault> {
        let mut addr = insn.memory_displacement32();
        if insn.memory_base() != Register::None {
            addr = addr.wrapping_add(self.reg(insn, insn.memory_base())?);
        }
        if insn.memory_index() != Register::None {
            let index = self.reg(insn, insn.memory_index())?;
            addr = addr.wrapping_add(index.wrapping_mul(insn.memory_index_scale()));
        }
        Ok(addr)
    }

    fn read(&self, insn: &Instruction, operand: u32) -> Result<u32, Fault> {
        match insn.op_kind(operand) {
            OpKind::Register => self.reg(insn, insn.op_register(operand)),
            OpKind::Memory => Ok(self.mem.read_u32(self.address(insn)?)),
            OpKind::Immediate8 | OpKind::Immediate8to32 | OpKind::Immediate32 => {
                Ok(insn.immediate(operand) as u32)
            }
            OpKind::NearBranch32 => Ok(insn.near_branch32()),
            _ => Err(self.unsupported(insn)),
        }
    }

    fn write(&mut self, insn: &Instruction, operand: u32, value: u32) -> Result<(), Fault> {
        match insn.op_kind(operand) {
            OpKind::Register => self.set_reg(insn, insn.op_register(operand), value),
            OpKind::Memory => {
                let addr = self.address(insn)?;
                self.mem.write_u32(addr, value);
                Ok(())
            }
            _ => Err(self.unsupported(insn)),
        }
    }

    fn push(&mut self, value: u32) {
        let esp = self.cpu.regs[4].wrapping_sub(4);
        self.cpu.regs[4] = esp;
        self.mem.write_u32(esp, value);
    }

    fn pop(&mut self) -> u32 {
        let esp = self.cpu.regs[4];
        self.cpu.regs[4] = esp.wrapping_add(4);
        self.mem.read_u32(esp)
    }

    fn flag(&self, bit: u32) -> bool {
        self.cpu.eflags & bit != 0
    }

    fn set_flag(&mut self, bit: u32, on: bool) {
        if on {
            self.cpu.eflags |= bit;
        } else {
            self.cpu.eflags &= !bit;
        }
    }

    fn set_result(&mut self, result: u32) {
        self.set_flag(ZF, result == 0);
        self.set_flag(SF, result >> 31 != 0);
        self.set_flag(PF, parity(result));
    }

    fn add_flags(&mut self, a: u32, b: u32, result: u32, carry: bool) {
        self.set_result(result);
        self.set_flag(CF, carry);
        self.set_flag(AF, (a ^ b ^ result) & 0x10 != 0);
        self.set_flag(OF, (a ^ result) & (b ^ result) & 0x8000_0000 != 0);
    }

    fn sub_flags(&mut self, a: u32, b: u32, result: u32, borrow: bool) {
        self.set_result(result);
        self.set_flag(CF, borrow);
        self.set_flag(AF, (a ^ b ^ result) & 0x10 != 0);
        self.set_flag(OF, (a ^ b) & (a ^ result) & 0x8000_0000 != 0);
    }

    fn logic_flags(&mut self, result: u32) {
        self.set_result(result);
        self.set_flag(CF, false);
        self.set_flag(OF, false);
        self.set_flag(AF, false);
    }

    fn holds(&self, cond: Cond) -> bool {
        let (cf, zf, sf, of, pf) = (
            self.flag(CF),
            self.flag(ZF),
            self.flag(SF),
            self.flag(OF),
            self.flag(PF),
        );
        match cond {
            Cond::O => of,
            Cond::No => !of,
            Cond::B => cf,
            Cond::Ae => !cf,
            Cond::E => zf,
            Cond::Ne => !zf,
            Cond::Be => cf || zf,
            Cond::A => !cf && !zf,
            Cond::S => sf,
            Cond::Ns => !sf,
            Cond::P => pf,
            Cond::Np => !pf,
            Cond::L => sf != of,
            Cond::Ge => sf == of,
            Cond::Le => zf || sf != of,
            Cond::G => !zf && sf == of,
        }
    }

    fn condition(&self, insn: &Instruction) -> Result<bool, Fault> {
        Cond::from_iced(insn.condition_code())
            .map(|cond| self.holds(cond))
            .ok_or_else(|| self.unsupported(insn))
    }

    fn fetch(&self) -> Result<Instruction, Fault> {
        let eip = self.cpu.eip;
        let bytes = self.mem.read(eip, 15);
        let mut decoder = Decoder::with_ip(BITNESS, &bytes, eip as u64, DecoderOptions::NONE);
        let insn = decoder.decode();
        if insn.is_invalid() {
            return Err(Fault::Decode(eip));
        }
        Ok(insn)
    }

    /// executes one instruction.
    pub fn step(&mut self) -> Result<(), Fault> {
        let insn = self.fetch()?;
        let next = insn.next_ip32();
        self.cpu.eip = next;
        self.steps += 1;

        if insn.is_jcc_short_or_near() {
            if self.condition(&insn)? {
                self.cpu.eip = insn.near_branch32();
            }
            return Ok(());
        }

        match insn.mnemonic() {
            Mnemonic::Nop => {}
            Mnemonic::Mov => {
                let value = self.read(&insn, 1)?;
                self.write(&insn, 0, value)?;
            }
            Mnemonic::Lea => {
                let addr = self.address(&insn)?;
                self.write(&insn, 0, addr)?;
            }
            Mnemonic::Xchg => {
                let (a, b) = (self.read(&insn, 0)?, self.read(&insn, 1)?);
                self.write(&insn, 0, b)?;
                self.write(&insn, 1, a)?;
            }
            Mnemonic::Push => {
                let value = self.read(&insn, 0)?;
                self.push(value);
            }
            Mnemonic::Pop => {
                let value = self.pop();
                self.write(&insn, 0, value)?;
            }
            Mnemonic::Pushfd => {
                let flags = self.cpu.eflags | RESERVED;
                self.push(flags);
            }
            Mnemonic::Popfd => {
                let flags = self.pop();
                self.cpu.eflags = (flags & (STATUS | DF)) | RESERVED;
            }
            Mnemonic::Add | Mnemonic::Adc => {
                let (a, b) = (self.read(&insn, 0)?, self.read(&insn, 1)?);
                let carry_in = insn.mnemonic() == Mnemonic::Adc && self.flag(CF);
                let wide = a as u64 + b as u64 + carry_in as u64;
                let result = wide as u32;
                self.add_flags(a, b, result, wide > u32::MAX as u64);
                self.write(&insn, 0, result)?;
            }
            Mnemonic::Sub | Mnemonic::Cmp | Mnemonic::Sbb => {
                let (a, b) = (self.read(&insn, 0)?, self.read(&insn, 1)?);
                let borrow_in = insn.mnemonic() == Mnemonic::Sbb && self.flag(CF);
                let result = a.wrapping_sub(b).wrapping_sub(borrow_in as u32);
                let borrow = (a as u64) < b as u64 + borrow_in as u64;
                self.sub_flags(a, b, result, borrow);
                if insn.mnemonic() != Mnemonic::Cmp {
                    self.write(&insn, 0, result)?;
                }
            }
            Mnemonic::And | Mnemonic::Or | Mnemonic::Xor | Mnemonic::Test => {
                let (a, b) = (self.read(&insn, 0)?, self.read(&insn, 1)?);
                let result = match insn.mnemonic() {
                    Mnemonic::Or => a | b,
                    Mnemonic::Xor => a ^ b,
                    _ => a & b,
                };
                self.logic_flags(result);
                if insn.mnemonic() != Mnemonic::Test {
                    self.write(&insn, 0, result)?;
                }
            }
            Mnemonic::Inc | Mnemonic::Dec => {
                let a = self.read(&insn, 0)?;
                let carry = self.flag(CF);
                let result = if insn.mnemonic() == Mnemonic::Inc {
                    let r = a.wrapping_add(1);
                    self.add_flags(a, 1, r, carry);
                    r
                } else {
                    let r = a.wrapping_sub(1);
                    self.sub_flags(a, 1, r, carry);
                    r
                };
                self.write(&insn, 0, result)?;
            }
            Mnemonic::Neg => {
                let a = self.read(&insn, 0)?;
                let result = 0u32.wrapping_sub(a);
                self.sub_flags(0, a, result, a != 0);
                self.write(&insn, 0, result)?;
            }
            Mnemonic::Not => {
                let a = self.read(&insn, 0)?;
                self.write(&insn, 0, !a)?;
            }
            Mnemonic::Bswap => {
                let a = self.read(&insn, 0)?;
                self.write(&insn, 0, a.swap_bytes())?;
            }
            Mnemonic::Rol | Mnemonic::Ror => {
                let a = self.read(&insn, 0)?;
                let count = self.read(&insn, 1)? & 31;
                if count != 0 {
                    let result = if insn.mnemonic() == Mnemonic::Rol {
                        let r = a.rotate_left(count);
                        self.set_flag(CF, r & 1 != 0);
                        self.set_flag(OF, (r >> 31 != 0) != (r & 1 != 0));
                        r
                    } else {
                        let r = a.rotate_right(count);
                        self.set_flag(CF, r >> 31 != 0);
                        self.set_flag(OF, ((r >> 31) ^ (r >> 30)) & 1 != 0);
                        r
                    };
                    self.write(&insn, 0, result)?;
                }
            }
            Mnemonic::Shl | Mnemonic::Shr | Mnemonic::Sar => {
                let a = self.read(&insn, 0)?;
                let count = self.read(&insn, 1)? & 31;
                if count != 0 {
                    let (result, carry, overflow) = match insn.mnemonic() {
                        Mnemonic::Shl => {
                            let r = a << count;
                            let c = (a >> (32 - count)) & 1 != 0;
                            (r, c, (r >> 31 != 0) != c)
                        }
                        Mnemonic::Shr => (a >> count, (a >> (count - 1)) & 1 != 0, a >> 31 != 0),
                        _ => (
                            ((a as i32) >> count) as u32,
                            ((a as i32) >> (count - 1)) & 1 != 0,
                            false,
                        ),
                    };
                    self.set_result(result);
                    self.set_flag(CF, carry);
                    self.set_flag(OF, overflow);
                    self.set_flag(AF, false);
                    self.write(&insn, 0, result)?;
                }
            }
            Mnemonic::Cmovo
            | Mnemonic::Cmovno
            | Mnemonic::Cmovb
            | Mnemonic::Cmovae
            | Mnemonic::Cmove
            | Mnemonic::Cmovne
            | Mnemonic::Cmovbe
            | Mnemonic::Cmova
            | Mnemonic::Cmovs
            | Mnemonic::Cmovns
            | Mnemonic::Cmovp
            | Mnemonic::Cmovnp
            | Mnemonic::Cmovl
            | Mnemonic::Cmovge
            | Mnemonic::Cmovle
            | Mnemonic::Cmovg => {
                if self.condition(&insn)? {
                    let value = self.read(&insn, 1)?;
                    self.write(&insn, 0, value)?;
                }
            }
            Mnemonic::Jmp => {
                self.cpu.eip = self.read(&insn, 0)?;
            }
            Mnemonic::Call => {
                let target = self.read(&insn, 0)?;
                self.push(next);
                self.cpu.eip = target;
            }
            Mnemonic::Ret => {
                self.cpu.eip = self.pop();
                if insn.op_count() == 1 {
                    let extra = insn.immediate16() as u32;
                    self.cpu.regs[4] = self.cpu.regs[4].wrapping_add(extra);
                }
            }
            Mnemonic::Loop | Mnemonic::Loope | Mnemonic::Loopne => {
                let ecx = self.cpu.regs[1].wrapping_sub(1);
                self.cpu.regs[1] = ecx;
                let taken = ecx != 0
                    && match insn.mnemonic() {
                        Mnemonic::Loope => self.flag(ZF),
                        Mnemonic::Loopne => !self.flag(ZF),
                        _ => true,
                    };
                if taken {
                    self.cpu.eip = insn.near_branch32();
                }
            }
            Mnemonic::Jecxz => {
                if self.cpu.regs[1] == 0 {
                    self.cpu.eip = insn.near_branch32();
                }
            }
            _ => return Err(self.unsupported(&insn)),
        }
        Ok(())
    }

    /// calls `entry` with the sentinel as return address and runs until it returns.
    pub fn call(&mut self, entry: u32, limit: u64) -> Result<(), Fault> {
        self.push(SENTINEL);
        self.cpu.eip = entry;
        while self.cpu.eip != SENTINEL {
            if self.steps >= limit {
                return Err(Fault::StepLimit(self.cpu.eip));
            }
            self.step()?;
        }
        Ok(())
    }
}

/// what a run leaves behind that the caller can observe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub regs: [u32; 8],
    pub flags: u32,
    pub data: Vec<u8>,
}

pub const STEP_LIMIT: u64 = 1_000_000;

/// runs `entry` over `mem` from the given registers (esp is replaced by the stack top).
pub fn execute(mem: Memory, entry: u32, mut regs: [u32; 8], eflags: u32) -> Result<Outcome, Fault> {
    regs[4] = STACK_TOP;
    let mut emu = Emulator::new(mem, regs, eflags);
    emu.call(entry, STEP_LIMIT)?;
    Ok(Outcome {
        regs: emu.cpu.regs,
        flags: emu.cpu.eflags & STATUS,
        data: emu.mem.read(DATA, DATA_LEN),
    })
}

/// a function with a counted loop, a diamond, a call out of the range, a jump table and a `loop`
/// instruction, placed inside a flat image together with the helper it calls.
pub struct Scenario {
    pub image: Vec<u8>,
    pub base: u32,
    pub begin: u32,
    pub end: u32,
    /// switch table, stored at `TABLE`.
    pub table: Vec<u32>,
}

pub const IMAGE_BASE: u32 = 0x0040_1000;
pub const FUNCTION: u32 = 0x0040_1040;
pub const HELPER: u32 = 0x0040_1200;
pub const TABLE: u32 = 0x0050_0100;

impl Scenario {
    pub fn build() -> Result<Self, iced_x86::IcedError> {
        use iced_x86::code_asm::*;
        use iced_x86::BlockEncoderOptions;

        let mut a = CodeAssembler::new(BITNESS)?;
        let mut top = a.create_label();
        let mut even = a.create_label();
        let mut join = a.create_label();
        let mut cases = [
            a.create_label(),
            a.create_label(),
            a.create_label(),
            a.create_label(),
        ];
        let mut after = a.create_label();

        a.push(ebx)?;
        a.push(esi)?;
        a.push(edi)?;
        a.mov(edi, DATA)?;
        a.xor(eax, eax)?;
        a.mov(ecx, 10u32)?;

        a.set_label(&mut top)?;
        a.add(eax, ecx)?;
        a.mov(dword_ptr(edi), eax)?;
        a.dec(ecx)?;
        a.jne(top)?;

        a.test(eax, 1u32)?;
        a.je(even)?;
        a.inc(eax)?;
        a.jmp(join)?;
        a.set_label(&mut even)?;
        a.add(eax, 3u32)?;
        a.set_label(&mut join)?;
        a.mov(dword_ptr(edi + 4), eax)?;

        a.call(HELPER as u64)?;
        a.mov(edx, eax)?;
        a.and(edx, 3u32)?;
        a.jmp(dword_ptr(edx * 4 + TABLE))?;

        a.set_label(&mut cases[0])?;
        a.add(eax, 0x11u32)?;
        a.jmp(after)?;
        a.set_label(&mut cases[1])?;
        a.sub(eax, 0x22u32)?;
        a.jmp(after)?;
        a.set_label(&mut cases[2])?;
        a.xor(eax, 0x33u32)?;
        a.jmp(after)?;
        a.set_label(&mut cases[3])?;
        a.not(eax)?;

        a.set_label(&mut after)?;
        a.mov(dword_ptr(edi + 8), eax)?;
        a.mov(ecx, 4u32)?;
        // add [edi+12], ecx; loop -5
        a.db(&[0x01, 0x4f, 0x0c, 0xe2, 0xfb])?;
        a.mov(esi, eax)?;
        a.rol(esi, 5u32)?;
        a.neg(esi)?;
        a.mov(dword_ptr(edi + 16), esi)?;
        a.pop(edi)?;
        a.pop(esi)?;
        a.pop(ebx)?;
        a.cmp(eax, 0u32)?;
        a.ret()?;

        let result = a.assemble_options(
            FUNCTION as u64,
            BlockEncoderOptions::RETURN_NEW_INSTRUCTION_OFFSETS,
        )?;
        let mut table = Vec::with_capacity(cases.len());
        for case in &cases {
            table.push(result.label_ip(case)? as u32);
        }
        let code = result.inner.code_buffer;

        let mut image = vec![0xcc; (HELPER - IMAGE_BASE) as usize];
        let at = (FUNCTION - IMAGE_BASE) as usize;
        image[at..at + code.len()].copy_from_slice(&code);
        // lea eax, [eax+eax*2]; ret
        image.extend([0x8d, 0x04, 0x40, 0xc3]);

        Ok(Scenario {
            image,
            base: IMAGE_BASE,
            begin: FUNCTION,
            end: FUNCTION + code.len() as u32,
            table,
        })
    }

    /// the image plus the data the function expects.
    pub fn memory(&self) -> Memory {
        let mut mem = Memory::default();
        mem.load(self.base, &self.image);
        for (i, target) in self.table.iter().enumerate() {
            mem.write_u32(TABLE + 4 * i as u32, *target);
        }
        mem
    }

    pub fn session(&self, seed: u64) -> ObfuscationSession {
        let image = FlatImage::new(OrigAddr::new(self.base), self.image.clone());
        ObfuscationSession::with_image(
            Box::new(image),
            SessionConfig {
                seed,
                load_address: None,
            },
        )
    }

    /// the original memory with the entry patched and the new section mapped.
    pub fn patched(&self, output: &SessionOutput) -> Memory {
        let mut mem = self.memory();
        if let Some(patch) = output.entry_patch {
            mem.load(patch.address.get(), &patch.bytes);
        }
        mem.load(output.base.get(), &output.buffer);
        mem
    }
}

/// whether `addr` falls inside the emitted buffer.
pub fn inside(output: &SessionOutput, addr: NewAddr) -> bool {
    addr >= output.base && (addr.get() as u64) < output.base.get() as u64 + output.buffer.len() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::Target;
    use crate::ledger::RelocTarget;
    use crate::plan::Plan;
    use proptest::prelude::*;

    const REGS: [u32; 8] = [
        0x1111_1111,
        0x2222_2222,
        0x3333_3333,
        0x4444_4444,
        0,
        0x5555_5555,
        0x6666_6666,
        0x7777_7777,
    ];

    fn original(scenario: &Scenario, regs: [u32; 8]) -> Outcome {
        execute(scenario.memory(), scenario.begin, regs, 0).unwrap()
    }

    fn obfuscated(scenario: &Scenario, output: &SessionOutput, regs: [u32; 8]) -> Outcome {
        assert!(output.entry_patch.is_some());
        execute(scenario.patched(output), scenario.begin, regs, 0).unwrap()
    }

    fn seal(
        scenario: &Scenario,
        seed: u64,
        passes: impl FnOnce(&mut ObfuscationSession),
    ) -> SessionOutput {
        let mut session = scenario.session(seed);
        session.begin_set(scenario.begin, scenario.end).unwrap();
        passes(&mut session);
        session.end_set().unwrap();
        session.output().unwrap().clone()
    }

    #[test]
    fn test_emulator_arithmetic() {
        // mov eax, 0x7fffffff; add eax, 1; ret
        let mut mem = Memory::default();
        mem.load(0x1000, &[0xb8, 0xff, 0xff, 0xff, 0x7f, 0x83, 0xc0, 0x01, 0xc3]);
        let out = execute(mem, 0x1000, [0; 8], 0).unwrap();
        assert_eq!(out.regs[0], 0x8000_0000);
        assert_eq!(out.flags & (OF | SF | ZF | CF), OF | SF);
        assert_eq!(out.regs[4], STACK_TOP);
    }

    #[test]
    fn test_scenario_runs() {
        let scenario = Scenario::build().unwrap();
        let out = original(&scenario, REGS);
        // esi, edi, ebx and ebp come back untouched
        assert_eq!(out.regs[3], REGS[3]);
        assert_eq!(out.regs[5], REGS[5]);
        assert_eq!(out.regs[6], REGS[6]);
        assert_eq!(out.regs[7], REGS[7]);
        // 10 + 9 + ... + 1 = 55, odd
        assert_eq!(&out.data[..4], &55u32.to_le_bytes());
        assert_eq!(&out.data[4..8], &56u32.to_le_bytes());
        assert_eq!(&out.data[12..16], &10u32.to_le_bytes());
    }

    #[test]
    fn test_no_passes_is_equivalent() {
        let scenario = Scenario::build().unwrap();
        let output = seal(&scenario, 1, |_| {});
        assert_eq!(original(&scenario, REGS), obfuscated(&scenario, &output, REGS));
    }

    #[test]
    fn test_get_pc_sees_original_address() {
        // call $+5; pop eax; nop; nop; ret
        let code = vec![0xe8, 0x00, 0x00, 0x00, 0x00, 0x58, 0x90, 0x90, 0xc3];
        let scenario = Scenario {
            begin: IMAGE_BASE,
            end: IMAGE_BASE + code.len() as u32,
            image: code,
            base: IMAGE_BASE,
            table: Vec::new(),
        };
        let expected = original(&scenario, REGS);
        assert_eq!(expected.regs[0], IMAGE_BASE + 5);

        let output = seal(&scenario, 1, |_| {});
        assert!(output.base.get() > scenario.end);
        assert_eq!(obfuscated(&scenario, &output, REGS), expected);

        for seed in 0..4 {
            let output = seal(&scenario, seed, |s| {
                Plan::default().run(s).unwrap();
            });
            assert_eq!(obfuscated(&scenario, &output, REGS), expected, "seed {}", seed);
        }
    }

    #[test]
    fn test_reference_sequence_is_equivalent() {
        let scenario = Scenario::build().unwrap();
        let output = seal(&scenario, 42, |s| {
            s.no_jcc().unwrap();
            for _ in 0..20 {
                s.equivalent_variation().unwrap();
            }
            for _ in 0..5 {
                s.local_obf().unwrap();
            }
            for _ in 0..5 {
                s.out_of_order(50).unwrap();
                s.vector_jmp().unwrap();
            }
        });
        assert!(output.buffer.len() > (scenario.end - scenario.begin) as usize);
        assert_eq!(original(&scenario, REGS), obfuscated(&scenario, &output, REGS));
    }

    #[test]
    fn test_reorder_with_vectors_is_equivalent() {
        let scenario = Scenario::build().unwrap();
        for seed in 0..8 {
            let output = seal(&scenario, seed, |s| {
                for _ in 0..4 {
                    s.out_of_order(100).unwrap();
                    s.vector_jmp().unwrap();
                }
            });
            assert_eq!(
                original(&scenario, REGS),
                obfuscated(&scenario, &output, REGS),
                "seed {}",
                seed
            );
        }
    }

    #[test]
    fn test_encryption_is_equivalent() {
        let scenario = Scenario::build().unwrap();
        let output = seal(&scenario, 3, |s| {
            while s.encrypt_jcc().unwrap() {}
        });
        assert_eq!(original(&scenario, REGS), obfuscated(&scenario, &output, REGS));

        let output = seal(&scenario, 4, |s| {
            s.no_jcc().unwrap();
            while s.encrypt_jcc().unwrap() {}
            s.out_of_order(60).unwrap();
        });
        assert_eq!(original(&scenario, REGS), obfuscated(&scenario, &output, REGS));
    }

    #[test]
    fn test_internal_targets_stay_in_the_section() {
        let scenario = Scenario::build().unwrap();
        let output = seal(&scenario, 9, |s| {
            Plan::default().run(s).unwrap();
        });
        let mut internal = 0;
        for entry in output.ledger.entries() {
            match entry.target {
                RelocTarget::Flow(Target::Block(_)) | RelocTarget::Slot(_) => {
                    let resolved = output.ledger.resolve(&entry.target).unwrap();
                    assert!(inside(&output, resolved), "{} -> {}", entry.site, resolved);
                    internal += 1;
                }
                RelocTarget::Flow(Target::External(addr)) => {
                    assert!(!inside(&output, NewAddr::from_untouched(addr)));
                }
            }
        }
        assert!(internal > 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]
        #[test]
        fn fuzz_default_plan_is_equivalent(seed in 0u64..1000u64, ebp in any::<u32>(), flags in any::<u32>()) {
            let scenario = Scenario::build().unwrap();
            let output = seal(&scenario, seed, |s| {
                Plan::default().run(s).unwrap();
                while s.encrypt_jcc().unwrap() {}
            });
            let mut regs = REGS;
            regs[5] = ebp;
            let expected = execute(scenario.memory(), scenario.begin, regs, flags).unwrap();
            let actual = execute(scenario.patched(&output), scenario.begin, regs, flags).unwrap();
            prop_assert_eq!(expected, actual);
        }
    }
}
