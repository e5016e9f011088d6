//! Toy guest ISA shared by the integration tests
//!
//! Every instruction is four bytes: `[op:8][rd:8][imm:16]`, with `imm`
//! signed. Branch offsets count instructions from the branch itself.

#![allow(dead_code)]

use std::collections::BTreeSet;

use rustc_hash::FxHashMap;
use xlat_engine::ir::Comparison;
use xlat_engine::pipeline::frontend::emit_undefined;
use xlat_engine::{
    DecodeError, DecodedBlock, DecodedInstruction, ExecutionMode, GuestDecoder, GuestEmitter,
    InstEmitter, Operand,
};

pub const OP_NOP: u8 = 0x00;
pub const OP_ADDI: u8 = 0x01;
pub const OP_B: u8 = 0x02;
pub const OP_BNZ: u8 = 0x03;
pub const OP_RET: u8 = 0x04;
pub const OP_BR: u8 = 0x05;
pub const OP_BL: u8 = 0x06;
pub const OP_SVC: u8 = 0x07;
pub const OP_UDF: u8 = 0xFF;

/// Register holding the return address
pub const LINK: u32 = 30;

pub fn encode(op: u8, rd: u8, imm: i16) -> u32 {
    ((op as u32) << 24) | ((rd as u32) << 16) | (imm as u16 as u32)
}

fn fields(raw: u32) -> (u8, u32, i64) {
    ((raw >> 24) as u8, (raw >> 16) & 0xFF, (raw & 0xFFFF) as u16 as i16 as i64)
}

fn branch_target(address: u64, raw: u32) -> u64 {
    let (_, _, imm) = fields(raw);
    address.wrapping_add((imm * 4) as u64)
}

/// Guest memory with a tiny assembler
#[derive(Default)]
pub struct ToyProgram {
    words: FxHashMap<u64, u32>,
}

impl ToyProgram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place `code` starting at `address`
    pub fn assemble(&mut self, address: u64, code: &[u32]) -> &mut Self {
        for (i, word) in code.iter().enumerate() {
            self.words.insert(address + i as u64 * 4, *word);
        }
        self
    }

    pub fn read(&self, address: u64) -> Option<u32> {
        self.words.get(&address).copied()
    }
}

/// Decoder for `ToyProgram`
///
/// Static branch targets inside mapped memory become part of the function;
/// call targets never do.
pub struct ToyDecoder {
    program: ToyProgram,
}

impl ToyDecoder {
    pub fn new(program: ToyProgram) -> Self {
        ToyDecoder { program }
    }

    fn decode_one(&self, address: u64) -> Result<DecodedInstruction, DecodeError> {
        let raw = self.program.read(address).ok_or(DecodeError::Unmapped(address))?;
        let emitter: InstEmitter = match fields(raw).0 {
            OP_NOP => emit_nop,
            OP_ADDI => emit_addi,
            OP_B => emit_b,
            OP_BNZ => emit_bnz,
            OP_RET => emit_ret,
            OP_BR => emit_br,
            OP_BL => emit_bl,
            OP_SVC => emit_svc,
            OP_UDF => emit_undefined,
            _ => return Err(DecodeError::InvalidEncoding { address, raw }),
        };
        Ok(DecodedInstruction { address, size: 4, raw, emitter: Some(emitter) })
    }

    /// Addresses that start a block
    fn find_leaders(&self, entry: u64) -> Result<BTreeSet<u64>, DecodeError> {
        let mut leaders = BTreeSet::new();
        let mut work = vec![entry];
        while let Some(start) = work.pop() {
            if !leaders.insert(start) {
                continue;
            }
            let mut address = start;
            loop {
                let inst = self.decode_one(address)?;
                let next = inst.next_address();
                match fields(inst.raw).0 {
                    OP_B => {
                        let target = branch_target(address, inst.raw);
                        if self.program.read(target).is_some() {
                            work.push(target);
                        }
                        break;
                    }
                    OP_BNZ => {
                        let target = branch_target(address, inst.raw);
                        if self.program.read(target).is_some() {
                            work.push(target);
                        }
                        work.push(next);
                        break;
                    }
                    OP_RET | OP_BR | OP_SVC | OP_UDF => break,
                    _ => address = next,
                }
            }
        }
        Ok(leaders)
    }
}

impl GuestDecoder for ToyDecoder {
    fn decode_function(&self, address: u64, _mode: ExecutionMode) -> Result<Vec<DecodedBlock>, DecodeError> {
        let leaders = self.find_leaders(address)?;

        let mut blocks = Vec::with_capacity(leaders.len());
        for &start in &leaders {
            let mut block = DecodedBlock {
                address: start,
                end_address: start,
                instructions: Vec::new(),
                branch: None,
                next: None,
                exit: false,
            };
            let mut pc = start;
            loop {
                let inst = self.decode_one(pc)?;
                let next = inst.next_address();
                let raw = inst.raw;
                block.instructions.push(inst);
                block.end_address = next;
                match fields(raw).0 {
                    OP_B => {
                        block.branch = Some(branch_target(pc, raw));
                        break;
                    }
                    OP_BNZ => {
                        block.branch = Some(branch_target(pc, raw));
                        block.next = Some(next);
                        break;
                    }
                    OP_RET | OP_BR | OP_SVC | OP_UDF => {
                        block.exit = true;
                        break;
                    }
                    _ if leaders.contains(&next) => {
                        block.next = Some(next);
                        break;
                    }
                    _ => pc = next,
                }
            }
            blocks.push(block);
        }

        if blocks.is_empty() {
            return Err(DecodeError::Empty(address));
        }
        Ok(blocks)
    }
}

fn immediate(em: &GuestEmitter<'_>, value: i64) -> Operand {
    if em.mode().is_64_bit() {
        Operand::const_i64(value)
    } else {
        Operand::const_i32(value as i32)
    }
}

fn emit_nop(_: &mut GuestEmitter<'_>, _: &DecodedInstruction) {}

fn emit_addi(em: &mut GuestEmitter<'_>, inst: &DecodedInstruction) {
    let (_, rd, imm) = fields(inst.raw);
    let value = em.register(rd);
    let imm = immediate(em, imm);
    let sum = em.add_values(value, imm);
    em.set_register(rd, sum);
}

fn emit_b(em: &mut GuestEmitter<'_>, inst: &DecodedInstruction) {
    em.jump_to(branch_target(inst.address, inst.raw));
}

fn emit_bnz(em: &mut GuestEmitter<'_>, inst: &DecodedInstruction) {
    let (_, rd, _) = fields(inst.raw);
    let value = em.register(rd);
    let zero = immediate(em, 0);
    let cond = em.compare(value, zero, Comparison::NotEqual);
    em.jump_to_if(branch_target(inst.address, inst.raw), cond);
}

fn emit_ret(em: &mut GuestEmitter<'_>, _: &DecodedInstruction) {
    let link = em.register(LINK);
    em.exit_dynamic(link);
}

fn emit_br(em: &mut GuestEmitter<'_>, inst: &DecodedInstruction) {
    let (_, rd, _) = fields(inst.raw);
    let target = em.register(rd);
    em.jump_dynamic(target);
}

fn emit_bl(em: &mut GuestEmitter<'_>, inst: &DecodedInstruction) {
    let return_address = inst.next_address();
    let link = immediate(em, return_address as i64);
    em.set_register(LINK, link);
    em.call_guest(branch_target(inst.address, inst.raw), return_address);
}

fn emit_svc(em: &mut GuestEmitter<'_>, inst: &DecodedInstruction) {
    let (_, _, imm) = fields(inst.raw);
    em.supervisor_call(imm as u16 as u32, inst.next_address());
}

// ===== Assembler helpers =====

pub fn nop() -> u32 {
    encode(OP_NOP, 0, 0)
}

pub fn addi(rd: u8, imm: i16) -> u32 {
    encode(OP_ADDI, rd, imm)
}

/// Unconditional branch `offset` instructions away
pub fn b(offset: i16) -> u32 {
    encode(OP_B, 0, offset)
}

pub fn bnz(rd: u8, offset: i16) -> u32 {
    encode(OP_BNZ, rd, offset)
}

pub fn ret() -> u32 {
    encode(OP_RET, 0, 0)
}

pub fn br(rd: u8) -> u32 {
    encode(OP_BR, rd, 0)
}

pub fn bl(offset: i16) -> u32 {
    encode(OP_BL, 0, offset)
}

pub fn svc(imm: i16) -> u32 {
    encode(OP_SVC, 0, imm)
}

pub fn udf() -> u32 {
    encode(OP_UDF, 0, 0)
}
