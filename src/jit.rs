// SPDX-License-Identifier: (Apache-2.0 OR MIT)
// Derived from uBPF <https://github.com/iovisor/ubpf>
// Copyright 2015 Big Switch Networks, Inc
//      (uBPF: JIT algorithm, originally in C)
//
// Licensed under the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
// the MIT license <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! JIT compiler for x86-64 hosts.
//!
//! One pass over the instruction stream emits machine code into a
//! caller-provided buffer, recording where each eBPF instruction starts and
//! which 4-byte branch displacements still need patching. A second pass
//! resolves those displacements against the recorded locations and the two
//! out-of-line blocks (the shared epilogue and the division-by-zero trap).
//! The finished code is then copied into an executable mapping.
//!
//! The generated function follows the host C calling convention: it takes
//! the context pointer and the context length, and returns the final value
//! of eBPF register R0. Memory accesses are emitted without bounds checks,
//! on the assumption that a verifier accepted the program.

use std::mem;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, trace};
use rand::{rngs::SmallRng, seq::SliceRandom, SeedableRng};

use crate::ebpf;
use crate::error::EbpfError;
use crate::vm::{stderr_location, EbpfVm, DIV_BY_ZERO_FMT};
use crate::x86::*;

const REGISTER_MAP_SIZE: usize = 11;

// There are two common x86-64 calling conventions; the host convention
// decides which registers the prologue must preserve, where the generated
// function finds its arguments, and which register stands in for RCX while
// RCX is reserved for shifts.

#[cfg(windows)]
const R12: u8 = 12;

#[cfg(windows)]
const PLATFORM_NONVOLATILE_REGISTERS: [u8; 8] = [RBP, RBX, RDI, RSI, R12, R13, R14, R15];
#[cfg(windows)]
const PLATFORM_PARAMETER_REGISTERS: [u8; 4] = [RCX, RDX, R8, R9];
#[cfg(windows)]
const RCX_ALT: u8 = R10;
// Register assignments:
// BPF R0-R4 are "volatile"
// BPF R5-R10 are "non-volatile"
// Map BPF volatile registers to x64 volatile and map BPF non-volatile to
// x64 non-volatile.
// Avoid R12 as we don't support encoding modrm modifier for using R12.
#[cfg(windows)]
const DEFAULT_REGISTER_MAP: [u8; REGISTER_MAP_SIZE] =
    [RAX, R10, RDX, R8, R9, R14, R15, RDI, RSI, RBX, RBP];

#[cfg(not(windows))]
const PLATFORM_NONVOLATILE_REGISTERS: [u8; 5] = [RBP, RBX, R13, R14, R15];
#[cfg(not(windows))]
const PLATFORM_PARAMETER_REGISTERS: [u8; 6] = [RDI, RSI, RDX, RCX, R8, R9];
#[cfg(not(windows))]
const RCX_ALT: u8 = R9;
#[cfg(not(windows))]
const DEFAULT_REGISTER_MAP: [u8; REGISTER_MAP_SIZE] =
    [RAX, RDI, RSI, RDX, R9, R8, RBX, R13, R14, R15, RBP];

/// A bijection from the eleven eBPF registers onto host registers.
///
/// BPF R0-R4 map to host caller-saved registers and BPF R5-R10 to host
/// callee-saved ones, so that external function calls clobber exactly the
/// registers the eBPF calling convention says they may. RCX stays free for
/// variable shifts, R11 is the encoder's scratch register, and R12 never
/// appears because the encoder does not support its memory form.
///
/// The translation is valid under any permutation of the default table; the
/// [`rotated`](RegisterMap::rotated) and [`shuffled`](RegisterMap::shuffled)
/// constructors exist so tests can prove that.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterMap([u8; REGISTER_MAP_SIZE]);

impl RegisterMap {
    /// The standard map for the host calling convention.
    pub const fn platform_default() -> Self {
        Self(DEFAULT_REGISTER_MAP)
    }

    /// The default map cycled forward by `offset` positions.
    pub fn rotated(offset: usize) -> Self {
        let mut map = [0u8; REGISTER_MAP_SIZE];
        for (i, slot) in map.iter_mut().enumerate() {
            *slot = DEFAULT_REGISTER_MAP[(i + offset) % REGISTER_MAP_SIZE];
        }
        Self(map)
    }

    /// The default map shuffled by a deterministic RNG.
    pub fn shuffled(seed: u64) -> Self {
        let mut map = DEFAULT_REGISTER_MAP;
        map.shuffle(&mut SmallRng::seed_from_u64(seed));
        Self(map)
    }

    /// Returns the host register for the given eBPF register.
    fn map(&self, r: u8) -> u8 {
        self.0[r as usize % REGISTER_MAP_SIZE]
    }
}

impl Default for RegisterMap {
    fn default() -> Self {
        Self::platform_default()
    }
}

/// Logical destination of a pending branch fixup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JumpTarget {
    /// An eBPF instruction index.
    Pc(usize),
    /// The shared epilogue.
    Exit,
    /// The division-by-zero trap.
    DivByZero,
}

/// A 4-byte displacement field awaiting resolution.
#[derive(Debug)]
pub(crate) struct Jump {
    /// Position of the displacement field in the output buffer.
    pub(crate) offset_loc: usize,
    pub(crate) target: JumpTarget,
}

/// Mutable state of one translation pass, discarded once the resolved code
/// has been copied out of the buffer.
pub(crate) struct JitState<'a> {
    pub(crate) contents: &'a mut [u8],
    pub(crate) offset: usize,
    pub(crate) pc_locs: Vec<usize>,
    pub(crate) jumps: Vec<Jump>,
    pub(crate) exit_loc: usize,
    pub(crate) div_by_zero_loc: usize,
}

impl<'a> JitState<'a> {
    pub(crate) fn new(contents: &'a mut [u8], num_insts: usize) -> Self {
        Self {
            contents,
            offset: 0,
            pc_locs: vec![0; num_insts + 1],
            jumps: Vec::with_capacity(num_insts),
            exit_loc: 0,
            div_by_zero_loc: 0,
        }
    }

    pub(crate) fn record_jump(&mut self, target: JumpTarget) {
        self.jumps.push(Jump {
            offset_loc: self.offset,
            target,
        });
    }
}

/// Translate the program loaded in `vm` into `buffer`.
///
/// On success returns the number of bytes written, starting at `buffer[0]`.
/// The caller owns the buffer; nothing is retained between calls.
pub fn translate(vm: &EbpfVm, buffer: &mut [u8]) -> Result<usize, EbpfError> {
    let prog = vm.prog.ok_or(EbpfError::NoProgramLoaded)?;
    let capacity = buffer.len();
    let num_insts = prog.len() / ebpf::INSN_SIZE;

    let mut jit = JitCompiler {
        state: JitState::new(buffer, num_insts),
        map: vm.register_map,
    };
    jit.translate(vm)?;
    if jit.state.offset > capacity {
        return Err(EbpfError::BufferTooSmall {
            required: jit.state.offset,
            capacity,
        });
    }
    jit.resolve_jumps()?;
    debug!(
        "translated {} eBPF instructions into {} bytes of x86-64 code",
        num_insts, jit.state.offset
    );
    Ok(jit.state.offset)
}

struct JitCompiler<'a> {
    state: JitState<'a>,
    map: RegisterMap,
}

impl JitCompiler<'_> {
    fn translate(&mut self, vm: &EbpfVm) -> Result<(), EbpfError> {
        let prog = vm.prog.ok_or(EbpfError::NoProgramLoaded)?;
        let num_insts = prog.len() / ebpf::INSN_SIZE;
        let state = &mut self.state;

        // Save platform non-volatile registers
        for reg in PLATFORM_NONVOLATILE_REGISTERS.iter() {
            emit_push(state, *reg);
        }

        // Move first platform parameter register into register 1. The second
        // parameter register already holds the context length in the register
        // mapped to R2 and is left alone.
        if self.map.map(1) != PLATFORM_PARAMETER_REGISTERS[0] {
            emit_mov(state, PLATFORM_PARAMETER_REGISTERS[0], self.map.map(1));
        }

        // Copy stack pointer to R10
        emit_mov(state, RSP, self.map.map(10));

        // Allocate stack space
        emit_alu64_imm32(state, 0x81, 5, RSP, ebpf::STACK_SIZE as i32);

        let mut i = 0;
        while i < num_insts {
            let insn = ebpf::get_insn(prog, i);
            self.state.pc_locs[i] = self.state.offset;

            let dst = self.map.map(insn.dst);
            let src = self.map.map(insn.src);
            let target_pc = JumpTarget::Pc((i as isize + insn.off as isize + 1) as usize);
            let state = &mut self.state;

            match insn.opc {
                // BPF_ALU class
                ebpf::ADD32_IMM => emit_alu32_imm32(state, 0x81, 0, dst, insn.imm),
                ebpf::ADD32_REG => emit_alu32(state, 0x01, src, dst),
                ebpf::SUB32_IMM => emit_alu32_imm32(state, 0x81, 5, dst, insn.imm),
                ebpf::SUB32_REG => emit_alu32(state, 0x29, src, dst),
                ebpf::MUL32_IMM | ebpf::DIV32_IMM | ebpf::MOD32_IMM => {
                    self.muldivmod(i, insn.opc, dst, dst, Some(insn.imm))
                }
                ebpf::MUL32_REG | ebpf::DIV32_REG | ebpf::MOD32_REG => {
                    self.muldivmod(i, insn.opc, src, dst, None)
                }
                ebpf::OR32_IMM => emit_alu32_imm32(state, 0x81, 1, dst, insn.imm),
                ebpf::OR32_REG => emit_alu32(state, 0x09, src, dst),
                ebpf::AND32_IMM => emit_alu32_imm32(state, 0x81, 4, dst, insn.imm),
                ebpf::AND32_REG => emit_alu32(state, 0x21, src, dst),
                ebpf::LSH32_IMM => emit_alu32_imm8(state, 0xc1, 4, dst, insn.imm as i8),
                ebpf::LSH32_REG => {
                    emit_mov(state, src, RCX);
                    emit_alu32(state, 0xd3, 4, dst);
                }
                ebpf::RSH32_IMM => emit_alu32_imm8(state, 0xc1, 5, dst, insn.imm as i8),
                ebpf::RSH32_REG => {
                    emit_mov(state, src, RCX);
                    emit_alu32(state, 0xd3, 5, dst);
                }
                ebpf::NEG32 => emit_alu32(state, 0xf7, 3, dst),
                ebpf::XOR32_IMM => emit_alu32_imm32(state, 0x81, 6, dst, insn.imm),
                ebpf::XOR32_REG => emit_alu32(state, 0x31, src, dst),
                ebpf::MOV32_IMM => emit_alu32_imm32(state, 0xc7, 0, dst, insn.imm),
                ebpf::MOV32_REG => emit_alu32(state, 0x89, src, dst),
                ebpf::ARSH32_IMM => emit_alu32_imm8(state, 0xc1, 7, dst, insn.imm as i8),
                ebpf::ARSH32_REG => {
                    emit_mov(state, src, RCX);
                    emit_alu32(state, 0xd3, 7, dst);
                }

                ebpf::LE => {
                    // The host is little-endian already; like the kernel, the
                    // 16 and 32-bit variants leave the upper bits alone.
                }
                ebpf::BE => match insn.imm {
                    16 => {
                        // rol dst, 8 on the 16-bit half, then mask
                        emit1(state, 0x66); // 16-bit override
                        emit_alu32_imm8(state, 0xc1, 0, dst, 8);
                        emit_alu32_imm32(state, 0x81, 4, dst, 0xffff);
                    }
                    32 | 64 => {
                        // bswap
                        emit_basic_rex(state, u8::from(insn.imm == 64), 0, dst);
                        emit1(state, 0x0f);
                        emit1(state, 0xc8 | (dst & 0b111));
                    }
                    _ => {}
                },

                // BPF_ALU64 class
                ebpf::ADD64_IMM => emit_alu64_imm32(state, 0x81, 0, dst, insn.imm),
                ebpf::ADD64_REG => emit_alu64(state, 0x01, src, dst),
                ebpf::SUB64_IMM => emit_alu64_imm32(state, 0x81, 5, dst, insn.imm),
                ebpf::SUB64_REG => emit_alu64(state, 0x29, src, dst),
                ebpf::MUL64_IMM | ebpf::DIV64_IMM | ebpf::MOD64_IMM => {
                    self.muldivmod(i, insn.opc, dst, dst, Some(insn.imm))
                }
                ebpf::MUL64_REG | ebpf::DIV64_REG | ebpf::MOD64_REG => {
                    self.muldivmod(i, insn.opc, src, dst, None)
                }
                ebpf::OR64_IMM => emit_alu64_imm32(state, 0x81, 1, dst, insn.imm),
                ebpf::OR64_REG => emit_alu64(state, 0x09, src, dst),
                ebpf::AND64_IMM => emit_alu64_imm32(state, 0x81, 4, dst, insn.imm),
                ebpf::AND64_REG => emit_alu64(state, 0x21, src, dst),
                ebpf::LSH64_IMM => emit_alu64_imm8(state, 0xc1, 4, dst, insn.imm as i8),
                ebpf::LSH64_REG => {
                    emit_mov(state, src, RCX);
                    emit_alu64(state, 0xd3, 4, dst);
                }
                ebpf::RSH64_IMM => emit_alu64_imm8(state, 0xc1, 5, dst, insn.imm as i8),
                ebpf::RSH64_REG => {
                    emit_mov(state, src, RCX);
                    emit_alu64(state, 0xd3, 5, dst);
                }
                ebpf::NEG64 => emit_alu64(state, 0xf7, 3, dst),
                ebpf::XOR64_IMM => emit_alu64_imm32(state, 0x81, 6, dst, insn.imm),
                ebpf::XOR64_REG => emit_alu64(state, 0x31, src, dst),
                ebpf::MOV64_IMM => emit_load_imm(state, dst, insn.imm as i64),
                ebpf::MOV64_REG => emit_mov(state, src, dst),
                ebpf::ARSH64_IMM => emit_alu64_imm8(state, 0xc1, 7, dst, insn.imm as i8),
                ebpf::ARSH64_REG => {
                    emit_mov(state, src, RCX);
                    emit_alu64(state, 0xd3, 7, dst);
                }

                // BPF_JMP class
                ebpf::JA => emit_jmp(state, target_pc),
                ebpf::JEQ_IMM => {
                    emit_cmp_imm32(state, dst, insn.imm);
                    emit_jcc(state, 0x84, target_pc);
                }
                ebpf::JEQ_REG => {
                    emit_cmp(state, src, dst);
                    emit_jcc(state, 0x84, target_pc);
                }
                ebpf::JGT_IMM => {
                    emit_cmp_imm32(state, dst, insn.imm);
                    emit_jcc(state, 0x87, target_pc);
                }
                ebpf::JGT_REG => {
                    emit_cmp(state, src, dst);
                    emit_jcc(state, 0x87, target_pc);
                }
                ebpf::JGE_IMM => {
                    emit_cmp_imm32(state, dst, insn.imm);
                    emit_jcc(state, 0x83, target_pc);
                }
                ebpf::JGE_REG => {
                    emit_cmp(state, src, dst);
                    emit_jcc(state, 0x83, target_pc);
                }
                ebpf::JLT_IMM => {
                    emit_cmp_imm32(state, dst, insn.imm);
                    emit_jcc(state, 0x82, target_pc);
                }
                ebpf::JLT_REG => {
                    emit_cmp(state, src, dst);
                    emit_jcc(state, 0x82, target_pc);
                }
                ebpf::JLE_IMM => {
                    emit_cmp_imm32(state, dst, insn.imm);
                    emit_jcc(state, 0x86, target_pc);
                }
                ebpf::JLE_REG => {
                    emit_cmp(state, src, dst);
                    emit_jcc(state, 0x86, target_pc);
                }
                ebpf::JSET_IMM => {
                    // test dst, imm
                    emit_alu64_imm32(state, 0xf7, 0, dst, insn.imm);
                    emit_jcc(state, 0x85, target_pc);
                }
                ebpf::JSET_REG => {
                    // test dst, src
                    emit_alu64(state, 0x85, src, dst);
                    emit_jcc(state, 0x85, target_pc);
                }
                ebpf::JNE_IMM => {
                    emit_cmp_imm32(state, dst, insn.imm);
                    emit_jcc(state, 0x85, target_pc);
                }
                ebpf::JNE_REG => {
                    emit_cmp(state, src, dst);
                    emit_jcc(state, 0x85, target_pc);
                }
                ebpf::JSGT_IMM => {
                    emit_cmp_imm32(state, dst, insn.imm);
                    emit_jcc(state, 0x8f, target_pc);
                }
                ebpf::JSGT_REG => {
                    emit_cmp(state, src, dst);
                    emit_jcc(state, 0x8f, target_pc);
                }
                ebpf::JSGE_IMM => {
                    emit_cmp_imm32(state, dst, insn.imm);
                    emit_jcc(state, 0x8d, target_pc);
                }
                ebpf::JSGE_REG => {
                    emit_cmp(state, src, dst);
                    emit_jcc(state, 0x8d, target_pc);
                }
                ebpf::JSLT_IMM => {
                    emit_cmp_imm32(state, dst, insn.imm);
                    emit_jcc(state, 0x8c, target_pc);
                }
                ebpf::JSLT_REG => {
                    emit_cmp(state, src, dst);
                    emit_jcc(state, 0x8c, target_pc);
                }
                ebpf::JSLE_IMM => {
                    emit_cmp_imm32(state, dst, insn.imm);
                    emit_jcc(state, 0x8e, target_pc);
                }
                ebpf::JSLE_REG => {
                    emit_cmp(state, src, dst);
                    emit_jcc(state, 0x8e, target_pc);
                }
                ebpf::CALL => {
                    let idx = insn.imm as u32;
                    let func = vm
                        .ext_funcs
                        .get(&idx)
                        .copied()
                        .ok_or(EbpfError::ExtFunctionNotRegistered { pc: i, idx })?;
                    // We reserve RCX for shifts
                    emit_mov(state, RCX_ALT, RCX);
                    emit_call(state, func as usize);
                    if vm.unwind_stack_ext_index == Some(idx) {
                        emit_cmp_imm32(state, self.map.map(0), 0);
                        emit_jcc(state, 0x84, JumpTarget::Exit);
                    }
                }
                ebpf::EXIT => {
                    if i != num_insts - 1 {
                        emit_jmp(state, JumpTarget::Exit);
                    }
                }

                // BPF_LDX class
                ebpf::LD_B_REG => emit_load(state, OperandSize::S8, src, dst, insn.off as i32),
                ebpf::LD_H_REG => emit_load(state, OperandSize::S16, src, dst, insn.off as i32),
                ebpf::LD_W_REG => emit_load(state, OperandSize::S32, src, dst, insn.off as i32),
                ebpf::LD_DW_REG => emit_load(state, OperandSize::S64, src, dst, insn.off as i32),

                // BPF_ST class
                ebpf::ST_B_IMM => {
                    emit_store_imm32(state, OperandSize::S8, dst, insn.off as i32, insn.imm)
                }
                ebpf::ST_H_IMM => {
                    emit_store_imm32(state, OperandSize::S16, dst, insn.off as i32, insn.imm)
                }
                ebpf::ST_W_IMM => {
                    emit_store_imm32(state, OperandSize::S32, dst, insn.off as i32, insn.imm)
                }
                ebpf::ST_DW_IMM => {
                    emit_store_imm32(state, OperandSize::S64, dst, insn.off as i32, insn.imm)
                }

                // BPF_STX class
                ebpf::ST_B_REG => emit_store(state, OperandSize::S8, src, dst, insn.off as i32),
                ebpf::ST_H_REG => emit_store(state, OperandSize::S16, src, dst, insn.off as i32),
                ebpf::ST_W_REG => emit_store(state, OperandSize::S32, src, dst, insn.off as i32),
                ebpf::ST_DW_REG => emit_store(state, OperandSize::S64, src, dst, insn.off as i32),

                ebpf::LD_DW_IMM => {
                    if i + 1 >= num_insts {
                        return Err(EbpfError::IncompleteLddw { pc: i });
                    }
                    i += 1;
                    // The second slot carries no code of its own; a branch
                    // into it lands on the whole load.
                    self.state.pc_locs[i] = self.state.pc_locs[i - 1];
                    let next = ebpf::get_insn(prog, i);
                    let imm = (insn.imm as u32 as u64) | ((next.imm as u64) << 32);
                    emit_load_imm(&mut self.state, dst, imm as i64);
                }

                _ => {
                    return Err(EbpfError::UnknownOpcode {
                        pc: i,
                        opcode: insn.opc,
                    })
                }
            }

            i += 1;
        }
        self.state.pc_locs[num_insts] = self.state.offset;

        let state = &mut self.state;

        // Epilogue
        state.exit_loc = state.offset;

        // Move register 0 into rax
        if self.map.map(0) != RAX {
            emit_mov(state, self.map.map(0), RAX);
        }

        // Deallocate stack space
        emit_alu64_imm32(state, 0x81, 0, RSP, ebpf::STACK_SIZE as i32);

        // Restore platform non-volatile registers
        for reg in PLATFORM_NONVOLATILE_REGISTERS.iter().rev() {
            emit_pop(state, *reg);
        }

        emit1(state, 0xc3); // ret

        // Division by zero trap: muldivmod stored the faulting PC in RCX.
        // RCX is the first parameter register on Windows, so move it out
        // before loading the error_printf arguments.
        state.div_by_zero_loc = state.offset;
        emit_mov(state, RCX, PLATFORM_PARAMETER_REGISTERS[2]);
        emit_load_imm(
            state,
            PLATFORM_PARAMETER_REGISTERS[0],
            stderr_location() as i64,
        );
        emit_load_imm(
            state,
            PLATFORM_PARAMETER_REGISTERS[1],
            DIV_BY_ZERO_FMT.as_ptr() as i64,
        );
        emit_call(state, vm.error_printf as usize);

        emit_load_imm(state, self.map.map(0), -1);
        emit_jmp(state, JumpTarget::Exit);

        Ok(())
    }

    /// MUL, DIV and MOD share one emitter: x86 forces their operands into
    /// RAX and RDX no matter which registers the eBPF instruction names.
    ///
    /// `imm` distinguishes the immediate forms from the register forms. eBPF
    /// division is unsigned; a zero divisor diverts to the trap, which the
    /// register forms test at run time and the immediate forms decide right
    /// here.
    fn muldivmod(&mut self, pc: usize, opc: u8, src: u8, dst: u8, imm: Option<i32>) {
        let state = &mut self.state;
        let mul = (opc & ebpf::BPF_ALU_OP_MASK) == (ebpf::MUL32_IMM & ebpf::BPF_ALU_OP_MASK);
        let div = (opc & ebpf::BPF_ALU_OP_MASK) == (ebpf::DIV32_IMM & ebpf::BPF_ALU_OP_MASK);
        let modrm = (opc & ebpf::BPF_ALU_OP_MASK) == (ebpf::MOD32_IMM & ebpf::BPF_ALU_OP_MASK);
        let is64 = (opc & ebpf::BPF_CLS_MASK) == ebpf::BPF_ALU64;

        if div || modrm {
            match imm {
                Some(0) => {
                    // The divisor is a constant zero; there is nothing to
                    // test at run time.
                    emit_load_imm(state, RCX, pc as i64);
                    emit_jmp(state, JumpTarget::DivByZero);
                    return;
                }
                Some(_) => {}
                None => {
                    emit_load_imm(state, RCX, pc as i64);

                    // test src, src
                    if is64 {
                        emit_alu64(state, 0x85, src, src);
                    } else {
                        emit_alu32(state, 0x85, src, src);
                    }

                    // jz div_by_zero
                    emit_jcc(state, 0x84, JumpTarget::DivByZero);
                }
            }
        }

        if dst != RAX {
            emit_push(state, RAX);
        }
        if dst != RDX {
            emit_push(state, RDX);
        }
        match imm {
            Some(imm) => emit_load_imm(state, RCX, imm as i64),
            None => emit_mov(state, src, RCX),
        }

        emit_mov(state, dst, RAX);

        if div || modrm {
            // xor %edx, %edx
            emit_alu32(state, 0x31, RDX, RDX);
        }

        if is64 {
            emit_rex(state, 1, 0, 0, 0);
        }

        // mul %ecx or div %ecx
        emit_alu32(state, 0xf7, if mul { 4 } else { 6 }, RCX);

        if dst != RDX {
            if modrm {
                emit_mov(state, RDX, dst);
            }
            emit_pop(state, RDX);
        }
        if dst != RAX {
            if div || mul {
                emit_mov(state, RAX, dst);
            }
            emit_pop(state, RAX);
        }
    }

    fn resolve_jumps(&mut self) -> Result<(), EbpfError> {
        for jump in &self.state.jumps {
            let target_loc = match jump.target {
                JumpTarget::Pc(pc) => self.state.pc_locs[pc],
                JumpTarget::Exit => self.state.exit_loc,
                JumpTarget::DivByZero => self.state.div_by_zero_loc,
            };

            // The displacement is relative to the end of the jump
            // instruction, which is the end of the displacement field itself.
            let rel = target_loc as i64 - (jump.offset_loc as i64 + mem::size_of::<i32>() as i64);
            if rel < i32::MIN as i64 || rel > i32::MAX as i64 {
                return Err(EbpfError::DisplacementOverflow {
                    offset_loc: jump.offset_loc,
                    target_loc,
                });
            }

            LittleEndian::write_i32(
                &mut self.state.contents[jump.offset_loc..jump.offset_loc + 4],
                rel as i32,
            );
        }
        trace!("resolved {} branch fixups", self.state.jumps.len());
        Ok(())
    }
}

#[cfg(not(windows))]
fn round_to_page_size(value: usize, page_size: usize) -> usize {
    (value + page_size - 1) / page_size * page_size
}

#[cfg(not(windows))]
fn errno() -> i32 {
    #[cfg(any(target_os = "freebsd", target_os = "ios", target_os = "macos"))]
    return unsafe { *libc::__error() };
    #[cfg(not(any(target_os = "freebsd", target_os = "ios", target_os = "macos")))]
    return unsafe { *libc::__errno_location() };
}

/// Native entry point of a compiled program: context pointer and context
/// length in, final value of eBPF register R0 out.
pub type JitFunction = unsafe extern "C" fn(*mut u8, usize) -> u64;

/// An executable memory mapping holding compiled code.
///
/// The mapping is created read-write for the copy and sealed to read-execute
/// before anything can call into it; it is unmapped on drop.
#[cfg(not(windows))]
#[derive(Debug)]
pub(crate) struct JitMemory {
    ptr: *mut u8,
    mapped_len: usize,
}

#[cfg(not(windows))]
impl JitMemory {
    pub(crate) fn new(code: &[u8]) -> Result<Self, EbpfError> {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let mapped_len = round_to_page_size(code.len(), page_size);
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapped_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(EbpfError::LibcInvocationFailed {
                function: "mmap",
                errno: errno(),
            });
        }
        let ptr = ptr as *mut u8;
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
            // Fill the page remainder with debugger traps
            std::ptr::write_bytes(ptr.add(code.len()), 0xcc, mapped_len - code.len());
            if libc::mprotect(
                ptr as *mut libc::c_void,
                mapped_len,
                libc::PROT_READ | libc::PROT_EXEC,
            ) != 0
            {
                let errno = errno();
                libc::munmap(ptr as *mut libc::c_void, mapped_len);
                return Err(EbpfError::LibcInvocationFailed {
                    function: "mprotect",
                    errno,
                });
            }
        }
        debug!(
            "installed {} bytes of machine code in a {} byte executable mapping",
            code.len(),
            mapped_len
        );
        Ok(Self { ptr, mapped_len })
    }

    pub(crate) fn as_function(&self) -> JitFunction {
        unsafe { mem::transmute(self.ptr) }
    }
}

#[cfg(not(windows))]
impl Drop for JitMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.mapped_len);
        }
    }
}
