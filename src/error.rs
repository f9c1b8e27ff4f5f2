// SPDX-License-Identifier: (Apache-2.0 OR MIT)
//
// Licensed under the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
// the MIT license <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Error types for program loading, translation and execution.

use thiserror::Error;

/// Errors reported by the virtual machine and the JIT compiler.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EbpfError {
    /// An opcode the machine does not implement was encountered.
    #[error("Unknown instruction at PC {pc}: opcode {opcode:#04x}")]
    UnknownOpcode {
        /// Index of the offending instruction.
        pc: usize,
        /// The unrecognized opcode byte.
        opcode: u8,
    },
    /// A two-slot LDDW instruction started in the last slot of the program.
    #[error("Incomplete LDDW instruction at PC {pc}")]
    IncompleteLddw {
        /// Index of the offending instruction.
        pc: usize,
    },
    /// No program has been loaded into the VM.
    #[error("code has not been loaded into this VM")]
    NoProgramLoaded,
    /// JIT-compiled execution was requested before `jit_compile` succeeded.
    #[error("program has not been JIT-compiled")]
    NotJitCompiled,
    /// The program byte stream does not divide into 64-bit instruction slots.
    #[error("program length must be a multiple of 8 bytes (got {len})")]
    InvalidProgramLength {
        /// Length of the rejected byte stream.
        len: usize,
    },
    /// The program holds more instruction slots than the machine supports.
    #[error("program too long: {insts} instructions (limit 65536)")]
    ProgramTooLong {
        /// Number of instruction slots in the rejected program.
        insts: usize,
    },
    /// A call instruction names an index with no registered function.
    #[error("call to unregistered external function {idx} at PC {pc}")]
    ExtFunctionNotRegistered {
        /// Index of the call instruction.
        pc: usize,
        /// The unresolved external function index.
        idx: u32,
    },
    /// The generated machine code does not fit the output buffer.
    #[error("generated code too large: {required} bytes exceed the {capacity} byte output buffer")]
    BufferTooSmall {
        /// Bytes the full translation would have occupied.
        required: usize,
        /// Capacity of the buffer handed to the translator.
        capacity: usize,
    },
    /// A resolved branch displacement does not fit in a signed 32-bit field.
    #[error("jump displacement from {offset_loc:#x} to {target_loc:#x} does not fit in 32 bits")]
    DisplacementOverflow {
        /// Location of the displacement field in the output buffer.
        offset_loc: usize,
        /// Location the branch resolves to.
        target_loc: usize,
    },
    /// The interpreter caught a memory access outside the context buffer and
    /// the stack.
    #[error("out of bounds memory {access} at PC {pc}: address {addr:#x}, {len} bytes")]
    OutOfBoundsAccess {
        /// Index of the offending instruction.
        pc: usize,
        /// `"load"` or `"store"`.
        access: &'static str,
        /// The rejected address.
        addr: u64,
        /// Width of the rejected access, in bytes.
        len: usize,
    },
    /// A libc call made while installing executable memory failed.
    #[error("libc call {function} failed, errno {errno}")]
    LibcInvocationFailed {
        /// Name of the failing function.
        function: &'static str,
        /// The reported errno value.
        errno: i32,
    },
}
