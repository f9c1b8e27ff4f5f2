// SPDX-License-Identifier: (Apache-2.0 OR MIT)
// Derived from uBPF <https://github.com/iovisor/ubpf>
// Copyright 2015 Big Switch Networks, Inc
//      (uBPF: JIT algorithm, originally in C)
//
// Licensed under the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
// the MIT license <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! x86-64 instruction encoder.
//!
//! A library of primitive emitters appending encoded instructions to the JIT
//! output buffer. The emitters know nothing about eBPF; they produce REX
//! prefixes, ModR/M bytes, displacements and immediates for the handful of
//! instruction forms the translator needs.
//!
//! Register operands are the numeric x86-64 register codes. Base registers
//! whose ModR/M encoding requires a SIB byte (RSP, R12) are not supported and
//! never appear in the register map.

use std::mem;
use std::ptr;

use crate::jit::{JitState, JumpTarget};

pub(crate) const RAX: u8 = 0;
pub(crate) const RCX: u8 = 1;
pub(crate) const RDX: u8 = 2;
pub(crate) const RBX: u8 = 3;
pub(crate) const RSP: u8 = 4;
pub(crate) const RBP: u8 = 5;
pub(crate) const RSI: u8 = 6;
pub(crate) const RDI: u8 = 7;
pub(crate) const R8: u8 = 8;
pub(crate) const R9: u8 = 9;
pub(crate) const R10: u8 = 10;
pub(crate) const R11: u8 = 11;
//pub(crate) const R12: u8 = 12;
pub(crate) const R13: u8 = 13;
pub(crate) const R14: u8 = 14;
pub(crate) const R15: u8 = 15;

/// Operand width of a memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OperandSize {
    S8,
    S16,
    S32,
    S64,
}

#[inline]
fn emit<T: Copy>(state: &mut JitState, data: T) {
    let size = mem::size_of::<T>();
    if state.offset + size <= state.contents.len() {
        unsafe {
            let ptr = state.contents.as_mut_ptr().add(state.offset);
            #[allow(clippy::cast_ptr_alignment)]
            ptr::write_unaligned(ptr as *mut T, data);
        }
    }
    // Keep advancing past the end so that the final cursor reports the size
    // the translation would have needed.
    state.offset += size;
}

pub(crate) fn emit1(state: &mut JitState, data: u8) {
    emit::<u8>(state, data);
}

pub(crate) fn emit2(state: &mut JitState, data: u16) {
    emit::<u16>(state, data);
}

pub(crate) fn emit4(state: &mut JitState, data: u32) {
    emit::<u32>(state, data);
}

pub(crate) fn emit8(state: &mut JitState, data: u64) {
    emit::<u64>(state, data);
}

fn emit_modrm(state: &mut JitState, modrm: u8, r: u8, m: u8) {
    debug_assert_eq!(modrm & 0x3f, 0);
    emit1(state, modrm | ((r & 0b111) << 3) | (m & 0b111));
}

fn emit_modrm_reg2reg(state: &mut JitState, r: u8, m: u8) {
    emit_modrm(state, 0xc0, r, m);
}

fn emit_modrm_and_displacement(state: &mut JitState, r: u8, m: u8, d: i32) {
    // mod=00 with rm=101 selects RIP-relative addressing, mod!=11 with rm=100
    // requires a SIB byte.
    debug_assert_ne!(m & 0b111, RSP & 0b111);
    if d == 0 && (m & 0b111) != RBP {
        emit_modrm(state, 0x00, r, m);
    } else if (-128..=127).contains(&d) {
        emit_modrm(state, 0x40, r, m);
        emit1(state, d as u8);
    } else {
        emit_modrm(state, 0x80, r, m);
        emit4(state, d as u32);
    }
}

fn basic_rex_would_set_bits(w: u8, src: u8, dst: u8) -> bool {
    w != 0 || (src & 0b1000) != 0 || (dst & 0b1000) != 0
}

pub(crate) fn emit_rex(state: &mut JitState, w: u8, r: u8, x: u8, b: u8) {
    debug_assert_eq!(w | 1, 1);
    debug_assert_eq!(r | 1, 1);
    debug_assert_eq!(x | 1, 1);
    debug_assert_eq!(b | 1, 1);
    emit1(state, 0x40 | (w << 3) | (r << 2) | (x << 1) | b);
}

/// Emits a REX prefix with the top bit of src and dst.
/// Skipped if no bits would be set.
pub(crate) fn emit_basic_rex(state: &mut JitState, w: u8, src: u8, dst: u8) {
    if basic_rex_would_set_bits(w, src, dst) {
        emit_rex(state, w, (src & 0b1000) >> 3, 0, (dst & 0b1000) >> 3);
    }
}

pub(crate) fn emit_push(state: &mut JitState, r: u8) {
    emit_basic_rex(state, 0, 0, r);
    emit1(state, 0x50 | (r & 0b111));
}

pub(crate) fn emit_pop(state: &mut JitState, r: u8) {
    emit_basic_rex(state, 0, 0, r);
    emit1(state, 0x58 | (r & 0b111));
}

// REX prefix and ModRM byte
// We use the MR encoding when there is a choice
// 'src' is often used as an opcode extension
pub(crate) fn emit_alu32(state: &mut JitState, op: u8, src: u8, dst: u8) {
    emit_basic_rex(state, 0, src, dst);
    emit1(state, op);
    emit_modrm_reg2reg(state, src, dst);
}

// REX prefix, ModRM byte, and 32-bit immediate
pub(crate) fn emit_alu32_imm32(state: &mut JitState, op: u8, src: u8, dst: u8, imm: i32) {
    emit_alu32(state, op, src, dst);
    emit4(state, imm as u32);
}

// REX prefix, ModRM byte, and 8-bit immediate
pub(crate) fn emit_alu32_imm8(state: &mut JitState, op: u8, src: u8, dst: u8, imm: i8) {
    emit_alu32(state, op, src, dst);
    emit1(state, imm as u8);
}

// REX.W prefix and ModRM byte
// We use the MR encoding when there is a choice
// 'src' is often used as an opcode extension
pub(crate) fn emit_alu64(state: &mut JitState, op: u8, src: u8, dst: u8) {
    emit_basic_rex(state, 1, src, dst);
    emit1(state, op);
    emit_modrm_reg2reg(state, src, dst);
}

// REX.W prefix, ModRM byte, and 32-bit immediate
pub(crate) fn emit_alu64_imm32(state: &mut JitState, op: u8, src: u8, dst: u8, imm: i32) {
    emit_alu64(state, op, src, dst);
    emit4(state, imm as u32);
}

// REX.W prefix, ModRM byte, and 8-bit immediate
pub(crate) fn emit_alu64_imm8(state: &mut JitState, op: u8, src: u8, dst: u8, imm: i8) {
    emit_alu64(state, op, src, dst);
    emit1(state, imm as u8);
}

/// 64-bit register to register move.
pub(crate) fn emit_mov(state: &mut JitState, src: u8, dst: u8) {
    emit_alu64(state, 0x89, src, dst);
}

pub(crate) fn emit_cmp(state: &mut JitState, src: u8, dst: u8) {
    emit_alu64(state, 0x39, src, dst);
}

pub(crate) fn emit_cmp_imm32(state: &mut JitState, dst: u8, imm: i32) {
    emit_alu64_imm32(state, 0x81, 7, dst, imm);
}

/// Load `[src + offset]` into `dst`, zero-extending narrow values.
pub(crate) fn emit_load(state: &mut JitState, size: OperandSize, src: u8, dst: u8, offset: i32) {
    let w = match size {
        OperandSize::S64 => 1,
        _ => 0,
    };
    emit_basic_rex(state, w, dst, src);

    match size {
        OperandSize::S8 => {
            // movzx
            emit1(state, 0x0f);
            emit1(state, 0xb6);
        }
        OperandSize::S16 => {
            // movzx
            emit1(state, 0x0f);
            emit1(state, 0xb7);
        }
        OperandSize::S32 | OperandSize::S64 => {
            // mov
            emit1(state, 0x8b);
        }
    }

    emit_modrm_and_displacement(state, dst, src, offset);
}

/// Load a sign-extended immediate into `dst`, using the ten-byte MOVABS form
/// when the value does not fit a sign-extended 32-bit immediate.
pub(crate) fn emit_load_imm(state: &mut JitState, dst: u8, imm: i64) {
    if imm >= i32::MIN as i64 && imm <= i32::MAX as i64 {
        emit_alu64_imm32(state, 0xc7, 0, dst, imm as i32);
    } else {
        // movabs $imm,dst
        emit_basic_rex(state, 1, 0, dst);
        emit1(state, 0xb8 | (dst & 0b111));
        emit8(state, imm as u64);
    }
}

/// Store register `src` to `[dst + offset]`.
#[rustfmt::skip]
pub(crate) fn emit_store(state: &mut JitState, size: OperandSize, src: u8, dst: u8, offset: i32) {
    if size == OperandSize::S16 {
        emit1(state, 0x66); // 16-bit override
    }
    let (is_s8, w) = match size {
        OperandSize::S8  => (true, 0),
        OperandSize::S64 => (false, 1),
        _                => (false, 0),
    };
    // Byte stores of SIL, DIL, BPL and SPL are only addressable with a REX
    // prefix, so S8 always emits one.
    if is_s8 || basic_rex_would_set_bits(w, src, dst) {
        emit_rex(state, w, (src & 0b1000) >> 3, 0, (dst & 0b1000) >> 3);
    }
    match size {
        OperandSize::S8 => emit1(state, 0x88),
        _               => emit1(state, 0x89),
    }
    emit_modrm_and_displacement(state, src, dst, offset);
}

/// Store an immediate to `[dst + offset]`.
#[rustfmt::skip]
pub(crate) fn emit_store_imm32(state: &mut JitState, size: OperandSize, dst: u8, offset: i32, imm: i32) {
    if size == OperandSize::S16 {
        emit1(state, 0x66); // 16-bit override
    }
    match size {
        OperandSize::S64 => emit_basic_rex(state, 1, 0, dst),
        _                => emit_basic_rex(state, 0, 0, dst),
    }
    match size {
        OperandSize::S8 => emit1(state, 0xc6),
        _               => emit1(state, 0xc7),
    }
    emit_modrm_and_displacement(state, 0, dst, offset);
    match size {
        OperandSize::S8  => emit1(state, imm as u8),
        OperandSize::S16 => emit2(state, imm as u16),
        _                => emit4(state, imm as u32),
    }
}

/// Record a pending fixup for the 4-byte displacement field written at the
/// current cursor, then reserve the field.
fn emit_jump_offset(state: &mut JitState, target: JumpTarget) {
    state.record_jump(target);
    emit4(state, 0);
}

/// `Jcc rel32`: `cc` is the second opcode byte (0x0f prefixed family).
pub(crate) fn emit_jcc(state: &mut JitState, cc: u8, target: JumpTarget) {
    emit1(state, 0x0f);
    emit1(state, cc);
    emit_jump_offset(state, target);
}

/// `JMP rel32`.
pub(crate) fn emit_jmp(state: &mut JitState, target: JumpTarget) {
    emit1(state, 0xe9);
    emit_jump_offset(state, target);
}

/// Call the absolute address `target`.
///
/// The target is materialized in R11 and called indirectly: the output buffer
/// is moved to its final executable mapping only after translation, so a
/// rel32 form computed here would not survive, and host functions may sit
/// further than ±2 GiB away regardless. EAX is cleared first; for variadic
/// callees AL carries the number of vector-register arguments.
pub(crate) fn emit_call(state: &mut JitState, target: usize) {
    emit_load_imm(state, R11, target as i64);
    emit_alu32(state, 0x31, RAX, RAX);
    // The Microsoft ABI makes the caller reserve 32 bytes of spill space for
    // the callee's register arguments; 32 keeps the stack 16-byte aligned.
    #[cfg(windows)]
    emit_alu64_imm32(state, 0x81, 5, RSP, 32);
    // callq *%r11
    emit_basic_rex(state, 0, 0, R11);
    emit1(state, 0xff);
    emit_modrm_reg2reg(state, 2, R11);
    #[cfg(windows)]
    emit_alu64_imm32(state, 0x81, 0, RSP, 32);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_state(f: impl FnOnce(&mut JitState)) -> Vec<u8> {
        let mut buf = [0u8; 64];
        let mut state = JitState::new(&mut buf, 0);
        f(&mut state);
        let len = state.offset;
        buf[..len].to_vec()
    }

    #[test]
    fn test_push_pop() {
        assert_eq!(with_state(|s| emit_push(s, RBP)), [0x55]);
        assert_eq!(with_state(|s| emit_push(s, R13)), [0x41, 0x55]);
        assert_eq!(with_state(|s| emit_pop(s, RBX)), [0x5b]);
        assert_eq!(with_state(|s| emit_pop(s, R15)), [0x41, 0x5f]);
    }

    #[test]
    fn test_mov_reg2reg() {
        // mov rsi, rdi
        assert_eq!(with_state(|s| emit_mov(s, RDI, RSI)), [0x48, 0x89, 0xfe]);
        // mov r15, rax
        assert_eq!(with_state(|s| emit_mov(s, RAX, R15)), [0x49, 0x89, 0xc7]);
    }

    #[test]
    fn test_alu64_imm32() {
        // sub rsp, 512
        assert_eq!(
            with_state(|s| emit_alu64_imm32(s, 0x81, 5, RSP, 512)),
            [0x48, 0x81, 0xec, 0x00, 0x02, 0x00, 0x00]
        );
    }

    #[test]
    fn test_alu32_no_rex() {
        // add eax, ebx
        assert_eq!(with_state(|s| emit_alu32(s, 0x01, RBX, RAX)), [0x01, 0xd8]);
        // xor r9d, r9d
        assert_eq!(
            with_state(|s| emit_alu32(s, 0x31, R9, R9)),
            [0x45, 0x31, 0xc9]
        );
    }

    #[test]
    fn test_shift_imm8() {
        // shl rdx, 3
        assert_eq!(
            with_state(|s| emit_alu64_imm8(s, 0xc1, 4, RDX, 3)),
            [0x48, 0xc1, 0xe2, 0x03]
        );
    }

    #[test]
    fn test_load_imm_small_and_large() {
        // mov rcx, 5 (sign-extended imm32 form)
        assert_eq!(
            with_state(|s| emit_load_imm(s, RCX, 5)),
            [0x48, 0xc7, 0xc1, 0x05, 0x00, 0x00, 0x00]
        );
        // movabs rax, 0x1122334455667788
        assert_eq!(
            with_state(|s| emit_load_imm(s, RAX, 0x1122334455667788)),
            [0x48, 0xb8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
        // movabs r13, -1 would fit imm32
        assert_eq!(
            with_state(|s| emit_load_imm(s, R13, -1)),
            [0x49, 0xc7, 0xc5, 0xff, 0xff, 0xff, 0xff]
        );
    }

    #[test]
    fn test_load_sizes() {
        // movzx eax, byte ptr [rdi + 10]
        assert_eq!(
            with_state(|s| emit_load(s, OperandSize::S8, RDI, RAX, 10)),
            [0x0f, 0xb6, 0x47, 0x0a]
        );
        // movzx ecx, word ptr [rsi]
        assert_eq!(
            with_state(|s| emit_load(s, OperandSize::S16, RSI, RCX, 0)),
            [0x0f, 0xb7, 0x0e]
        );
        // mov ebx, dword ptr [rdx + 0x200]
        assert_eq!(
            with_state(|s| emit_load(s, OperandSize::S32, RDX, RBX, 0x200)),
            [0x8b, 0x9a, 0x00, 0x02, 0x00, 0x00]
        );
        // mov r8, qword ptr [r9 - 8]
        assert_eq!(
            with_state(|s| emit_load(s, OperandSize::S64, R9, R8, -8)),
            [0x4d, 0x8b, 0x41, 0xf8]
        );
    }

    #[test]
    fn test_load_rbp_base_needs_displacement() {
        // mov rax, qword ptr [rbp + 0]: mod=00 rm=101 would be RIP-relative
        assert_eq!(
            with_state(|s| emit_load(s, OperandSize::S64, RBP, RAX, 0)),
            [0x48, 0x8b, 0x45, 0x00]
        );
    }

    #[test]
    fn test_store_sizes() {
        // mov word ptr [rbx], ax
        assert_eq!(
            with_state(|s| emit_store(s, OperandSize::S16, RAX, RBX, 0)),
            [0x66, 0x89, 0x03]
        );
        // mov byte ptr [rax], sil (REX forced for SIL)
        assert_eq!(
            with_state(|s| emit_store(s, OperandSize::S8, RSI, RAX, 0)),
            [0x40, 0x88, 0x30]
        );
        // mov qword ptr [r14 - 16], rdi
        assert_eq!(
            with_state(|s| emit_store(s, OperandSize::S64, RDI, R14, -16)),
            [0x49, 0x89, 0x7e, 0xf0]
        );
    }

    #[test]
    fn test_store_imm32() {
        // mov dword ptr [rdi + 4], 0x11223344
        assert_eq!(
            with_state(|s| emit_store_imm32(s, OperandSize::S32, RDI, 4, 0x11223344)),
            [0xc7, 0x47, 0x04, 0x44, 0x33, 0x22, 0x11]
        );
        // mov qword ptr [rbx], -1 (sign-extended imm32)
        assert_eq!(
            with_state(|s| emit_store_imm32(s, OperandSize::S64, RBX, 0, -1)),
            [0x48, 0xc7, 0x03, 0xff, 0xff, 0xff, 0xff]
        );
        // mov byte ptr [r10], 7
        assert_eq!(
            with_state(|s| emit_store_imm32(s, OperandSize::S8, R10, 0, 7)),
            [0x41, 0xc6, 0x02, 0x07]
        );
    }

    #[test]
    fn test_jumps_record_fixups() {
        let mut buf = [0u8; 64];
        let mut state = JitState::new(&mut buf, 0);
        emit_jmp(&mut state, JumpTarget::Exit);
        emit_jcc(&mut state, 0x84, JumpTarget::Pc(7));
        assert_eq!(state.offset, 5 + 6);
        assert_eq!(state.jumps.len(), 2);
        // Displacement fields sit at the end of each instruction.
        assert_eq!(state.jumps[0].offset_loc, 1);
        assert_eq!(state.jumps[1].offset_loc, 7);
        assert_eq!(state.jumps[1].target, JumpTarget::Pc(7));
        assert_eq!(&state.contents[..2], &[0xe9, 0x00]);
        assert_eq!(&state.contents[5..7], &[0x0f, 0x84]);
    }

    #[cfg(not(windows))]
    #[test]
    fn test_call_indirect_through_r11() {
        assert_eq!(
            with_state(|s| emit_call(s, 0x1122334455667788)),
            [
                0x49, 0xbb, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11, // movabs r11, target
                0x31, 0xc0, // xor eax, eax
                0x41, 0xff, 0xd3, // callq *%r11
            ]
        );
    }

    #[test]
    fn test_overflowing_emission_keeps_counting() {
        let mut buf = [0u8; 4];
        let mut state = JitState::new(&mut buf, 0);
        for _ in 0..4 {
            emit_load_imm(&mut state, RAX, i64::MAX);
        }
        assert_eq!(state.offset, 40);
        // The in-bounds prefix was still written.
        assert_eq!(buf[..2], [0x48, 0xb8]);
    }
}
