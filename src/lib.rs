//! QASM: a deterministic register-and-structure virtual machine with a
//! companion single-pass assembler.
//!
//! Source text compiles to a compact [`program::Program`]; a [`cpu::Cpu`]
//! executes it step by step over a fixed register file and four families of
//! bulk structures (stacks, queues, tapes, memories), with cooperative
//! interrupts and precise fault reporting tied back to source lines.

pub mod compiler;
pub mod cpu;
pub mod errors;
pub mod isa;
pub mod limits;
pub mod program;
pub mod utils;
