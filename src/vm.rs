// SPDX-License-Identifier: (Apache-2.0 OR MIT)
// Derived from uBPF <https://github.com/iovisor/ubpf>
// Copyright 2015 Big Switch Networks, Inc
//      (uBPF: VM architecture, originally in C)
//
// Licensed under the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
// the MIT license <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The virtual machine hosting a single eBPF program.

use std::collections::HashMap;

use crate::ebpf;
use crate::error::EbpfError;
use crate::interpreter;
#[cfg(all(target_arch = "x86_64", not(windows)))]
use crate::jit::{self, JitFunction, JitMemory};
#[cfg(target_arch = "x86_64")]
use crate::jit::RegisterMap;

/// An external function callable from eBPF through the `call` instruction.
///
/// The five eBPF argument registers R1-R5 arrive as the five arguments; the
/// return value lands in R0. The C ABI is load-bearing: compiled programs
/// call these functions directly from generated code.
pub type Helper = extern "C" fn(u64, u64, u64, u64, u64) -> u64;

/// Sink for runtime diagnostics, `fprintf`-shaped so that generated code can
/// call it with a `FILE *` and a format string.
pub type PrintfFn =
    unsafe extern "C" fn(*mut libc::FILE, *const libc::c_char, ...) -> libc::c_int;

/// Format string for the division-by-zero diagnostic; the single argument is
/// the program counter of the faulting instruction.
pub(crate) static DIV_BY_ZERO_FMT: &[u8] = b"BPF error: division by zero at PC %u\n\0";

#[cfg(not(windows))]
#[allow(non_upper_case_globals)]
mod cstdio {
    extern "C" {
        #[cfg_attr(
            any(target_os = "macos", target_os = "ios", target_os = "freebsd"),
            link_name = "__stderrp"
        )]
        pub static mut stderr: *mut libc::FILE;
    }
}

#[cfg(windows)]
mod cstdio {
    extern "C" {
        pub fn __acrt_iob_func(idx: libc::c_uint) -> *mut libc::FILE;
    }
}

/// The C `stderr` stream, resolved once so its address can be baked into
/// generated code.
pub(crate) fn stderr_location() -> *mut libc::FILE {
    #[cfg(not(windows))]
    return unsafe { cstdio::stderr };
    #[cfg(windows)]
    return unsafe { cstdio::__acrt_iob_func(2) };
}

fn validate_prog(prog: &[u8]) -> Result<(), EbpfError> {
    if prog.len() % ebpf::INSN_SIZE != 0 {
        return Err(EbpfError::InvalidProgramLength { len: prog.len() });
    }
    let insts = prog.len() / ebpf::INSN_SIZE;
    if insts > ebpf::MAX_INSTS {
        return Err(EbpfError::ProgramTooLong { insts });
    }
    Ok(())
}

/// A virtual machine executing one eBPF program.
///
/// The program runs against a caller-provided context buffer: R1 holds its
/// address and R2 its length on entry. External functions registered under a
/// 32-bit index are reachable through the `call` instruction.
///
/// ```
/// use nanobpf::{ebpf, EbpfVm};
///
/// // mov64 r0, 10; add64 r0, 13; exit
/// let prog = [
///     ebpf::Insn { opc: ebpf::MOV64_IMM, dst: 0, src: 0, off: 0, imm: 10 }.to_array(),
///     ebpf::Insn { opc: ebpf::ADD64_IMM, dst: 0, src: 0, off: 0, imm: 13 }.to_array(),
///     ebpf::Insn { opc: ebpf::EXIT, dst: 0, src: 0, off: 0, imm: 0 }.to_array(),
/// ]
/// .concat();
///
/// let vm = EbpfVm::new(Some(&prog)).unwrap();
/// assert_eq!(vm.execute_program(&mut []).unwrap(), 23);
/// ```
pub struct EbpfVm<'a> {
    pub(crate) prog: Option<&'a [u8]>,
    pub(crate) ext_funcs: HashMap<u32, Helper>,
    pub(crate) unwind_stack_ext_index: Option<u32>,
    pub(crate) error_printf: PrintfFn,
    #[cfg(target_arch = "x86_64")]
    pub(crate) register_map: RegisterMap,
    #[cfg(all(target_arch = "x86_64", not(windows)))]
    jit: Option<JitMemory>,
}

impl<'a> EbpfVm<'a> {
    /// Create a VM, optionally loading a program right away.
    pub fn new(prog: Option<&'a [u8]>) -> Result<EbpfVm<'a>, EbpfError> {
        if let Some(prog) = prog {
            validate_prog(prog)?;
        }
        Ok(EbpfVm {
            prog,
            ext_funcs: HashMap::new(),
            unwind_stack_ext_index: None,
            error_printf: libc::fprintf,
            #[cfg(target_arch = "x86_64")]
            register_map: RegisterMap::platform_default(),
            #[cfg(all(target_arch = "x86_64", not(windows)))]
            jit: None,
        })
    }

    /// Load (or replace) the program, dropping any compiled code.
    pub fn set_program(&mut self, prog: &'a [u8]) -> Result<(), EbpfError> {
        validate_prog(prog)?;
        self.prog = Some(prog);
        self.invalidate_jit();
        Ok(())
    }

    /// Register an external function under `idx`, the value `call`
    /// instructions name in their immediate field.
    ///
    /// Functions must be registered before compiling: the generated code
    /// calls their addresses directly.
    pub fn register_helper(&mut self, idx: u32, func: Helper) -> Result<(), EbpfError> {
        self.ext_funcs.insert(idx, func);
        self.invalidate_jit();
        Ok(())
    }

    /// Mark an external function index as the stack-unwinding one: when a
    /// call to it returns zero, the program terminates immediately with
    /// return value zero.
    pub fn set_unwind_function_index(&mut self, idx: u32) {
        self.unwind_stack_ext_index = Some(idx);
        self.invalidate_jit();
    }

    /// Replace the diagnostic sink, `libc::fprintf` by default.
    pub fn set_error_printf(&mut self, printf: PrintfFn) {
        self.error_printf = printf;
        self.invalidate_jit();
    }

    /// Replace the eBPF-to-host register assignment.
    ///
    /// Test instrumentation: any permutation of the default map must leave
    /// program results unchanged. Not useful in production.
    #[cfg(target_arch = "x86_64")]
    pub fn set_register_map(&mut self, map: RegisterMap) {
        self.register_map = map;
        self.invalidate_jit();
    }

    fn invalidate_jit(&mut self) {
        #[cfg(all(target_arch = "x86_64", not(windows)))]
        {
            self.jit = None;
        }
    }

    /// Run the program through the interpreter.
    pub fn execute_program(&self, mem: &mut [u8]) -> Result<u64, EbpfError> {
        interpreter::execute_program(self, mem)
    }

    /// Translate the loaded program to machine code and install it in an
    /// executable mapping.
    ///
    /// Compiling twice is a no-op: the previously installed code is kept and
    /// [`jit_function`](EbpfVm::jit_function) keeps returning the same entry
    /// point.
    #[cfg(all(target_arch = "x86_64", not(windows)))]
    pub fn jit_compile(&mut self) -> Result<(), EbpfError> {
        if self.jit.is_some() {
            return Ok(());
        }
        let mut buffer = vec![0u8; 65536];
        let size = jit::translate(self, &mut buffer)?;
        self.jit = Some(JitMemory::new(&buffer[..size])?);
        Ok(())
    }

    /// The native entry point of the compiled program, if
    /// [`jit_compile`](EbpfVm::jit_compile) has run.
    #[cfg(all(target_arch = "x86_64", not(windows)))]
    pub fn jit_function(&self) -> Option<JitFunction> {
        self.jit.as_ref().map(|jit| jit.as_function())
    }

    /// Run the compiled program.
    ///
    /// # Safety
    ///
    /// The generated code performs unchecked memory accesses: calling it is
    /// only sound for programs a verifier accepted, with a context buffer
    /// matching what the program expects.
    #[cfg(all(target_arch = "x86_64", not(windows)))]
    pub unsafe fn execute_program_jit(&self, mem: &mut [u8]) -> Result<u64, EbpfError> {
        let func = self.jit_function().ok_or(EbpfError::NotJitCompiled)?;
        Ok(func(mem.as_mut_ptr(), mem.len()))
    }
}
