//! The CPU: a step-driven interpreter over a compiled program.
//!
//! A [`Cpu`] owns its register file, structure instances, call stack, I/O
//! buffers, and PRNG; the program is shared read-only and must outlive every
//! CPU referencing it. Execution is single-threaded and cooperative: `run`
//! dispatches steps until the CPU leaves the `Running` state, yielding to
//! `Interrupted` every `interrupt_period` steps. The state cell is atomic, so
//! [`CpuSignal`] handles can interrupt or terminate from other threads with
//! at most one opcode of latency.
//!
//! Any fault transitions the CPU to `Terminated` and surfaces as
//! [`RuntimeError::Fault`] carrying the enclosing function name, 1-based
//! source line, and step index.

pub mod iobuf;
pub mod registers;
pub mod structures;
#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rand::Rng;
use rand_pcg::Pcg32;

use crate::errors::RuntimeError;
use crate::isa::Opcode;
use crate::limits::{CpuLimits, LimitsError, INSTANCES};
use crate::program::Program;
use crate::utils::log::Logger;
use iobuf::{InputDelegate, LineBuffer, OutputDelegate};
use registers::{implicit, RegisterFile, REG_D, REG_I, REG_J, REG_S, REG_U, REG_Z};
use structures::{Family, Memory, Queue, Stack, StructError, Tape};

pub use registers::{EXPLICIT_COUNT, IMPLICIT_COUNT, REGISTER_COUNT};

/// PCG-32 reference seed; unseeded programs draw a fixed sequence.
const DEFAULT_RNG_STATE: u64 = 0xcafe_f00d_d15e_a5e5;
const DEFAULT_RNG_STREAM: u64 = 0x0a02_bdbf_7bb3_c0a7;

/// The CPU life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CpuState {
    /// No program loaded.
    None = 0,
    /// Program loaded, registers and structures reset.
    Initialized = 1,
    /// Inside `run`/`step`.
    Running = 2,
    /// Cooperative yield or breakpoint; resumable.
    Interrupted = 3,
    /// The program executed `exit`.
    Finished = 4,
    /// Faulted, explicitly terminated, or signalled; not resumable.
    Terminated = 5,
}

impl CpuState {
    fn from_u8(value: u8) -> CpuState {
        match value {
            1 => CpuState::Initialized,
            2 => CpuState::Running,
            3 => CpuState::Interrupted,
            4 => CpuState::Finished,
            5 => CpuState::Terminated,
            _ => CpuState::None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CpuState::None => "None",
            CpuState::Initialized => "Initialized",
            CpuState::Running => "Running",
            CpuState::Interrupted => "Interrupted",
            CpuState::Finished => "Finished",
            CpuState::Terminated => "Terminated",
        }
    }
}

/// Construction parameters: limits plus the host I/O delegates.
///
/// A missing input delegate reads as immediate end of input; a missing
/// output delegate discards lines.
#[derive(Default)]
pub struct CpuConfig {
    pub limits: CpuLimits,
    pub input: Option<InputDelegate>,
    pub output: Option<OutputDelegate>,
}

/// Cloneable cross-thread handle to a CPU's state cell.
#[derive(Clone)]
pub struct CpuSignal {
    state: Arc<AtomicU8>,
}

impl CpuSignal {
    /// Requests a cooperative interrupt; only a `Running` CPU transitions.
    pub fn interrupt(&self) {
        signal_interrupt(&self.state);
    }

    /// Terminates any loaded CPU; not resumable.
    pub fn terminate(&self) {
        signal_terminate(&self.state);
    }
}

fn signal_interrupt(state: &AtomicU8) {
    let _ = state.compare_exchange(
        CpuState::Running as u8,
        CpuState::Interrupted as u8,
        Ordering::AcqRel,
        Ordering::Acquire,
    );
}

fn signal_terminate(state: &AtomicU8) {
    let _ = state.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
        (current != CpuState::None as u8).then_some(CpuState::Terminated as u8)
    });
}

/// Little-endian reader over an instruction's slice of the parameter blob.
struct Params<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Params<'a> {
    fn new(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos }
    }

    fn u8(&mut self) -> Result<u8, RuntimeError> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or(RuntimeError::TruncatedParams { offset: self.pos })?;
        self.pos += 1;
        Ok(byte)
    }

    fn u32(&mut self) -> Result<u32, RuntimeError> {
        let end = self.pos + 4;
        let bytes = self
            .data
            .get(self.pos..end)
            .ok_or(RuntimeError::TruncatedParams { offset: self.pos })?;
        self.pos = end;
        Ok(u32::from_le_bytes(bytes.try_into().expect("4-byte slice")))
    }

    fn i32(&mut self) -> Result<i32, RuntimeError> {
        Ok(self.u32()? as i32)
    }

    fn f32(&mut self) -> Result<f32, RuntimeError> {
        Ok(f32::from_bits(self.u32()?))
    }

    fn reg2(&mut self) -> Result<(u8, u8), RuntimeError> {
        Ok((self.u8()?, self.u8()?))
    }

    fn reg3(&mut self) -> Result<(u8, u8, u8), RuntimeError> {
        Ok((self.u8()?, self.u8()?, self.u8()?))
    }
}

/// Maps a structure-local failure to a runtime fault naming the instance.
fn st(family: Family, index: u8) -> impl FnOnce(StructError) -> RuntimeError {
    move |e| e.into_runtime(family, index)
}

/// The virtual machine.
pub struct Cpu {
    limits: CpuLimits,
    input: Option<InputDelegate>,
    output: Option<OutputDelegate>,
    state: Arc<AtomicU8>,
    program: Option<Arc<Program>>,
    regs: RegisterFile,
    stacks: [Stack; INSTANCES],
    queues: [Queue; INSTANCES],
    tapes: [Tape; INSTANCES],
    memories: [Memory; INSTANCES],
    callstack: Vec<u32>,
    /// Index of the next instruction to fetch.
    pc: u32,
    /// Index of the most recently fetched instruction; fault context.
    last_pc: u32,
    /// Count of executed steps, 1-based after the first.
    step_index: u64,
    rng: Pcg32,
    read_buf: LineBuffer,
    write_buf: LineBuffer,
    epoch: Instant,
    profiling_on: bool,
    tracing_on: bool,
    profile: HashMap<&'static str, u64>,
    trace_log: Logger,
}

impl Cpu {
    /// Builds a CPU, validating the limits. No program is loaded yet.
    pub fn new(config: CpuConfig) -> Result<Self, LimitsError> {
        config.limits.validate()?;
        Ok(Self {
            limits: config.limits,
            input: config.input,
            output: config.output,
            state: Arc::new(AtomicU8::new(CpuState::None as u8)),
            program: None,
            regs: RegisterFile::new(),
            stacks: std::array::from_fn(|_| Stack::default()),
            queues: std::array::from_fn(|_| Queue::default()),
            tapes: std::array::from_fn(|_| Tape::default()),
            memories: std::array::from_fn(|_| Memory::default()),
            callstack: Vec::new(),
            pc: 0,
            last_pc: 0,
            step_index: 0,
            rng: Pcg32::new(DEFAULT_RNG_STATE, DEFAULT_RNG_STREAM),
            read_buf: LineBuffer::default(),
            write_buf: LineBuffer::default(),
            epoch: Instant::now(),
            profiling_on: false,
            tracing_on: false,
            profile: HashMap::new(),
            trace_log: Logger::new("cpu"),
        })
    }

    // ==================== Control surface ====================

    /// Loads a program and initializes, or unloads with `None`.
    ///
    /// The program is shared read-only; pass the same `Arc` to as many CPUs
    /// as needed.
    pub fn load_program(&mut self, program: Option<Arc<Program>>) {
        self.program = program;
        if self.program.is_some() {
            self.initialize();
        } else {
            self.set_state(CpuState::None);
        }
    }

    /// Resets registers, structures, buffers, and counters to a fresh
    /// `Initialized` state, keeping the loaded program.
    pub fn reinitialize(&mut self) -> Result<(), RuntimeError> {
        if self.program.is_none() {
            return Err(RuntimeError::NoProgram);
        }
        self.initialize();
        Ok(())
    }

    fn initialize(&mut self) {
        self.regs = RegisterFile::new();
        for i in 0..INSTANCES {
            let enabled = |count: u32| (i as u32) < count;
            self.stacks[i].configure(self.limits.stack_capacity, enabled(self.limits.stacks_count));
            self.queues[i].configure(self.limits.queue_capacity, enabled(self.limits.queues_count));
            self.tapes[i].configure(self.limits.tape_capacity, enabled(self.limits.tapes_count));
            self.memories[i].configure(
                self.limits.memory_capacity[i],
                self.limits.memory_read_only[i],
                enabled(self.limits.memories_count),
            );
        }
        self.callstack = Vec::new();
        self.pc = 0;
        self.last_pc = 0;
        self.step_index = 0;
        self.rng = Pcg32::new(DEFAULT_RNG_STATE, DEFAULT_RNG_STREAM);
        self.read_buf.clear();
        self.write_buf.clear();
        self.epoch = Instant::now();
        self.profiling_on = false;
        self.tracing_on = false;
        self.profile.clear();
        self.set_state(CpuState::Initialized);
    }

    /// Runs until the CPU reaches `Finished`, `Interrupted`, or
    /// `Terminated`. Resumes from the current pc when called again after an
    /// interrupt.
    pub fn run(&mut self) -> Result<(), RuntimeError> {
        self.begin()?;
        while self.state() == CpuState::Running {
            if let Err(e) = self.step_once() {
                self.set_state(CpuState::Terminated);
                return Err(self.fault(e));
            }
        }
        Ok(())
    }

    /// Executes exactly one step.
    pub fn step(&mut self) -> Result<(), RuntimeError> {
        self.begin()?;
        if let Err(e) = self.step_once() {
            self.set_state(CpuState::Terminated);
            return Err(self.fault(e));
        }
        Ok(())
    }

    /// Checks resumability and enters the `Running` state.
    fn begin(&mut self) -> Result<(), RuntimeError> {
        match self.state() {
            CpuState::Initialized | CpuState::Running | CpuState::Interrupted => {
                self.set_state(CpuState::Running);
                Ok(())
            }
            CpuState::None => Err(RuntimeError::NoProgram),
            other => Err(RuntimeError::InvalidState {
                actual: other.name(),
            }),
        }
    }

    /// Requests a cooperative interrupt; may be called from any thread via
    /// [`Cpu::signal`]. Only a `Running` CPU transitions.
    pub fn interrupt(&self) {
        signal_interrupt(&self.state);
    }

    /// Terminates the CPU from any loaded state; not resumable.
    pub fn terminate(&self) {
        signal_terminate(&self.state);
    }

    /// A cloneable handle for signalling from other threads.
    pub fn signal(&self) -> CpuSignal {
        CpuSignal {
            state: Arc::clone(&self.state),
        }
    }

    pub fn state(&self) -> CpuState {
        CpuState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: CpuState) {
        self.state.store(state as u8, Ordering::Release);
    }

    // ==================== Inspection surface ====================

    /// The explicit registers `A..Z`.
    pub fn explicit_registers(&self) -> &[u32] {
        self.regs.explicit()
    }

    /// The implicit registers `a..z`.
    pub fn implicit_registers(&self) -> &[u32] {
        self.regs.implicit_cells()
    }

    /// Overwrites the explicit registers; valid in `Initialized` only.
    pub fn set_explicit_registers(
        &mut self,
        values: &[u32; EXPLICIT_COUNT],
    ) -> Result<(), RuntimeError> {
        self.require_initialized()?;
        self.regs.set_explicit(values);
        Ok(())
    }

    /// Snapshot of a stack's contents, bottom first. Panics if `index >= 26`.
    pub fn stack(&self, index: u8) -> Vec<u32> {
        self.stacks[index as usize].snapshot()
    }

    /// Snapshot of a queue's contents, front first. Panics if `index >= 26`.
    pub fn queue(&self, index: u8) -> Vec<u32> {
        self.queues[index as usize].snapshot()
    }

    /// Snapshot of a tape's buffer, leftmost first. Panics if `index >= 26`.
    pub fn tape(&self, index: u8) -> Vec<u32> {
        self.tapes[index as usize].snapshot()
    }

    /// A memory's cells. Panics if `index >= 26`.
    pub fn memory(&self, index: u8) -> &[u32] {
        self.memories[index as usize].cells()
    }

    /// Overwrites a memory; size-matched, valid in `Initialized` only.
    /// Panics if `index >= 26`.
    pub fn set_memory(&mut self, index: u8, data: &[u32]) -> Result<(), RuntimeError> {
        self.require_initialized()?;
        let cells = self.memories[index as usize].cells_mut();
        if cells.len() != data.len() {
            return Err(RuntimeError::SizeMismatch {
                expected: cells.len() as u32,
                actual: data.len() as u32,
            });
        }
        cells.copy_from_slice(data);
        Ok(())
    }

    /// The call stack, outermost return address first.
    pub fn callstack(&self) -> &[u32] {
        &self.callstack
    }

    /// Count of executed steps.
    pub fn step_index(&self) -> u64 {
        self.step_index
    }

    /// Function index of the current instruction.
    pub fn function_index(&self) -> u32 {
        self.program
            .as_ref()
            .and_then(|p| p.function_indices.get(self.last_pc as usize).copied())
            .unwrap_or(0)
    }

    /// 0-based source line of the current instruction; display as `+ 1`.
    pub fn source_line(&self) -> u32 {
        self.program
            .as_ref()
            .and_then(|p| p.source_lines.get(self.last_pc as usize).copied())
            .unwrap_or(0)
    }

    /// Per-opcode step counts collected while `profiling` was on.
    pub fn profile(&self) -> Vec<(&'static str, u64)> {
        let mut counts: Vec<_> = self.profile.iter().map(|(&k, &v)| (k, v)).collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        counts
    }

    fn require_initialized(&self) -> Result<(), RuntimeError> {
        match self.state() {
            CpuState::Initialized => Ok(()),
            other => Err(RuntimeError::InvalidState {
                actual: other.name(),
            }),
        }
    }

    /// Attaches function, source line, and step context to a fault.
    fn fault(&self, source: RuntimeError) -> RuntimeError {
        RuntimeError::Fault {
            function: self
                .program
                .as_ref()
                .map(|p| p.function_name(self.function_index()).to_string())
                .unwrap_or_default(),
            line: self.source_line() + 1,
            step: self.step_index,
            source: Box::new(source),
        }
    }

    // ==================== Execution ====================

    /// One step: count, maybe yield, else fetch and execute.
    fn step_once(&mut self) -> Result<(), RuntimeError> {
        self.step_index += 1;
        if self.step_index % u64::from(self.limits.interrupt_period) == 0 {
            // The yielding step consumes a step slot without fetching; the
            // next run or step resumes from the same pc.
            self.set_state(CpuState::Interrupted);
            return Ok(());
        }

        let program = self.program.clone().ok_or(RuntimeError::NoProgram)?;
        let pc = self.pc;
        let op = *program
            .ops
            .get(pc as usize)
            .ok_or(RuntimeError::InvalidProgramCounter { pc })?;
        self.last_pc = pc;
        self.pc = pc + 1;

        if self.tracing_on {
            self.trace_log.info(&format!(
                "step {} pc {} {}",
                self.step_index,
                pc,
                op.mnemonic()
            ));
        }
        if self.profiling_on {
            *self.profile.entry(op.mnemonic()).or_insert(0) += 1;
        }

        let offset = program.param_offsets[pc as usize] as usize;
        self.exec(op, &mut Params::new(&program.params, offset))
    }

    fn exec(&mut self, op: Opcode, p: &mut Params<'_>) -> Result<(), RuntimeError> {
        match op {
            Opcode::Nop => {}

            // Registers
            Opcode::Reset => {
                let r = p.u8()?;
                self.regs.set(r, 0);
            }
            Opcode::Set => {
                let r = p.u8()?;
                let v = p.u32()?;
                self.regs.set(r, v);
            }
            Opcode::ISet => {
                let r = p.u8()?;
                let v = p.i32()?;
                self.regs.set_i(r, v);
            }
            Opcode::FSet => {
                let r = p.u8()?;
                let v = p.f32()?;
                self.regs.set_f(r, v);
            }
            Opcode::Copy => {
                let (d, s) = p.reg2()?;
                self.regs.set(d, self.regs.get(s));
            }
            Opcode::CondRst => {
                let r = p.u8()?;
                if self.regs.condition() {
                    self.regs.set(r, 0);
                }
            }
            Opcode::CondSet => {
                let r = p.u8()?;
                let v = p.u32()?;
                if self.regs.condition() {
                    self.regs.set(r, v);
                }
            }
            Opcode::CondISet => {
                let r = p.u8()?;
                let v = p.i32()?;
                if self.regs.condition() {
                    self.regs.set_i(r, v);
                }
            }
            Opcode::CondFSet => {
                let r = p.u8()?;
                let v = p.f32()?;
                if self.regs.condition() {
                    self.regs.set_f(r, v);
                }
            }
            Opcode::CondCpy => {
                let (d, s) = p.reg2()?;
                if self.regs.condition() {
                    self.regs.set(d, self.regs.get(s));
                }
            }
            Opcode::IndCpy => {
                let d = self.regs.get(REG_D);
                let s = self.regs.get(REG_S);
                for v in [d, s] {
                    if v >= REGISTER_COUNT as u32 {
                        return Err(RuntimeError::RegisterIndexOutOfRange { value: v });
                    }
                }
                self.regs.set(d as u8, self.regs.get(s as u8));
            }

            // Unsigned arithmetic
            Opcode::Add => self.bin_u(p, |l, r| Ok(l.wrapping_add(r)))?,
            Opcode::Sub => self.bin_u(p, |l, r| Ok(l.wrapping_sub(r)))?,
            Opcode::Mul => self.bin_u(p, |l, r| Ok(l.wrapping_mul(r)))?,
            Opcode::Div => self.bin_u(p, |l, r| {
                l.checked_div(r).ok_or(RuntimeError::DivisionByZero)
            })?,
            Opcode::Mod => self.bin_u(p, |l, r| {
                l.checked_rem(r).ok_or(RuntimeError::DivisionByZero)
            })?,
            Opcode::Inc => {
                let r = p.u8()?;
                self.regs.set(r, self.regs.get(r).wrapping_add(1));
            }
            Opcode::Dec => {
                let r = p.u8()?;
                self.regs.set(r, self.regs.get(r).wrapping_sub(1));
            }

            // Signed arithmetic
            Opcode::IAdd => self.bin_i(p, |l, r| Ok(l.wrapping_add(r)))?,
            Opcode::ISub => self.bin_i(p, |l, r| Ok(l.wrapping_sub(r)))?,
            Opcode::IMul => self.bin_i(p, |l, r| Ok(l.wrapping_mul(r)))?,
            Opcode::IDiv => self.bin_i(p, |l, r| {
                if r == 0 {
                    return Err(RuntimeError::DivisionByZero);
                }
                Ok(l.wrapping_div(r))
            })?,
            Opcode::IMod => self.bin_i(p, |l, r| {
                if r == 0 {
                    return Err(RuntimeError::DivisionByZero);
                }
                Ok(l.wrapping_rem(r))
            })?,
            Opcode::IInc => {
                let r = p.u8()?;
                self.regs.set_i(r, self.regs.get_i(r).wrapping_add(1));
            }
            Opcode::IDec => {
                let r = p.u8()?;
                self.regs.set_i(r, self.regs.get_i(r).wrapping_sub(1));
            }
            Opcode::IAbs => {
                let (d, s) = p.reg2()?;
                self.regs.set_i(d, self.regs.get_i(s).wrapping_abs());
            }

            // Float arithmetic
            Opcode::FAdd => self.bin_f(p, |l, r| l + r)?,
            Opcode::FSub => self.bin_f(p, |l, r| l - r)?,
            Opcode::FMul => self.bin_f(p, |l, r| l * r)?,
            Opcode::FDiv => self.bin_f(p, |l, r| l / r)?,
            Opcode::FPow => self.bin_f(p, f32::powf)?,
            Opcode::FAtan2 => self.bin_f(p, f32::atan2)?,
            Opcode::FAbs => self.un_f(p, f32::abs)?,
            Opcode::FSqrt => self.un_f(p, f32::sqrt)?,
            Opcode::FLog => self.un_f(p, f32::ln)?,
            Opcode::FSin => self.un_f(p, f32::sin)?,
            Opcode::FCos => self.un_f(p, f32::cos)?,
            Opcode::FTan => self.un_f(p, f32::tan)?,
            Opcode::FAsin => self.un_f(p, f32::asin)?,
            Opcode::FAcos => self.un_f(p, f32::acos)?,
            Opcode::FAtan => self.un_f(p, f32::atan)?,
            Opcode::FFloor => self.un_f(p, f32::floor)?,
            Opcode::FRound => self.un_f(p, f32::round)?,
            Opcode::FCeil => self.un_f(p, f32::ceil)?,
            Opcode::S2F => {
                let (d, s) = p.reg2()?;
                self.regs.set_f(d, self.regs.get_i(s) as f32);
            }
            Opcode::U2F => {
                let (d, s) = p.reg2()?;
                self.regs.set_f(d, self.regs.get(s) as f32);
            }
            Opcode::F2S => {
                let (d, s) = p.reg2()?;
                self.regs.set_i(d, self.regs.get_f(s) as i32);
            }
            Opcode::F2U => {
                let (d, s) = p.reg2()?;
                self.regs.set(d, self.regs.get_f(s) as u32);
            }

            // Logic
            Opcode::And => self.bin_u(p, |l, r| Ok((l != 0 && r != 0) as u32))?,
            Opcode::Or => self.bin_u(p, |l, r| Ok((l != 0 || r != 0) as u32))?,
            Opcode::Xor => self.bin_u(p, |l, r| Ok(((l != 0) != (r != 0)) as u32))?,
            Opcode::Not => {
                let (d, s) = p.reg2()?;
                self.regs.set(d, (self.regs.get(s) == 0) as u32);
            }
            Opcode::Inv => {
                let r = p.u8()?;
                self.regs.set(r, (self.regs.get(r) == 0) as u32);
            }
            Opcode::Shl => self.bin_u(p, |l, r| Ok(l.checked_shl(r).unwrap_or(0)))?,
            Opcode::Shr => self.bin_u(p, |l, r| Ok(l.checked_shr(r).unwrap_or(0)))?,
            Opcode::Rol => self.bin_u(p, |l, r| Ok(l.rotate_left(r % 32)))?,
            Opcode::Ror => self.bin_u(p, |l, r| Ok(l.rotate_right(r % 32)))?,
            Opcode::BAnd => self.bin_u(p, |l, r| Ok(l & r))?,
            Opcode::BOr => self.bin_u(p, |l, r| Ok(l | r))?,
            Opcode::BXor => self.bin_u(p, |l, r| Ok(l ^ r))?,
            Opcode::BNot => {
                let (d, s) = p.reg2()?;
                self.regs.set(d, !self.regs.get(s));
            }
            Opcode::BInv => {
                let r = p.u8()?;
                self.regs.set(r, !self.regs.get(r));
            }

            // Comparisons
            Opcode::Eq => self.bin_u(p, |l, r| Ok((l == r) as u32))?,
            Opcode::Neq => self.bin_u(p, |l, r| Ok((l != r) as u32))?,
            Opcode::Lt => self.bin_u(p, |l, r| Ok((l < r) as u32))?,
            Opcode::Gt => self.bin_u(p, |l, r| Ok((l > r) as u32))?,
            Opcode::Lte => self.bin_u(p, |l, r| Ok((l <= r) as u32))?,
            Opcode::Gte => self.bin_u(p, |l, r| Ok((l >= r) as u32))?,
            Opcode::IEq => self.cmp_i(p, |l, r| l == r)?,
            Opcode::INeq => self.cmp_i(p, |l, r| l != r)?,
            Opcode::ILt => self.cmp_i(p, |l, r| l < r)?,
            Opcode::IGt => self.cmp_i(p, |l, r| l > r)?,
            Opcode::ILte => self.cmp_i(p, |l, r| l <= r)?,
            Opcode::IGte => self.cmp_i(p, |l, r| l >= r)?,
            Opcode::FEq => self.cmp_f(p, |l, r| l == r)?,
            Opcode::FNeq => self.cmp_f(p, |l, r| l != r)?,
            Opcode::FLt => self.cmp_f(p, |l, r| l < r)?,
            Opcode::FGt => self.cmp_f(p, |l, r| l > r)?,
            Opcode::FLte => self.cmp_f(p, |l, r| l <= r)?,
            Opcode::FGte => self.cmp_f(p, |l, r| l >= r)?,
            Opcode::FIsNan => self.class_f(p, f32::is_nan)?,
            Opcode::FIsInf => self.class_f(p, f32::is_infinite)?,
            Opcode::FIsFin => self.class_f(p, f32::is_finite)?,
            Opcode::FIsNorm => self.class_f(p, f32::is_normal)?,
            Opcode::Test => {
                let (d, s) = p.reg2()?;
                self.regs.set(d, (self.regs.get(s) != 0) as u32);
            }

            // Stacks
            Opcode::SLoad => {
                let (d, i) = p.reg2()?;
                let v = self.stacks[i as usize].load().map_err(st(Family::Stack, i))?;
                self.regs.set(d, v);
            }
            Opcode::SStore => {
                let (i, s) = p.reg2()?;
                let v = self.regs.get(s);
                self.stacks[i as usize]
                    .store(v)
                    .map_err(st(Family::Stack, i))?;
            }
            Opcode::Pop => {
                let (d, i) = p.reg2()?;
                let v = self.stacks[i as usize].pop().map_err(st(Family::Stack, i))?;
                self.regs.set(d, v);
            }
            Opcode::Push => {
                let (i, s) = p.reg2()?;
                let v = self.regs.get(s);
                self.stacks[i as usize]
                    .push(v)
                    .map_err(st(Family::Stack, i))?;
            }
            Opcode::SSwap => {
                let (a, b) = p.reg2()?;
                self.swap_structs(Family::Stack, a, b)?;
            }
            Opcode::IndSSwap => {
                let (a, b) = self.indirect_pair()?;
                self.swap_structs(Family::Stack, a, b)?;
            }
            Opcode::SStat => {
                let i = p.u8()?;
                self.regs.set_stat(self.stacks[i as usize].stat());
            }
            Opcode::IndSStat => {
                let i = self.indirect_index()?;
                self.regs.set_stat(self.stacks[i as usize].stat());
            }

            // Queues
            Opcode::QLoad => {
                let (d, i) = p.reg2()?;
                let v = self.queues[i as usize].load().map_err(st(Family::Queue, i))?;
                self.regs.set(d, v);
            }
            Opcode::QStore => {
                let (i, s) = p.reg2()?;
                let v = self.regs.get(s);
                self.queues[i as usize]
                    .store(v)
                    .map_err(st(Family::Queue, i))?;
            }
            Opcode::Dequeue => {
                let (d, i) = p.reg2()?;
                let v = self.queues[i as usize]
                    .dequeue()
                    .map_err(st(Family::Queue, i))?;
                self.regs.set(d, v);
            }
            Opcode::Enqueue => {
                let (i, s) = p.reg2()?;
                let v = self.regs.get(s);
                self.queues[i as usize]
                    .enqueue(v)
                    .map_err(st(Family::Queue, i))?;
            }
            Opcode::QSwap => {
                let (a, b) = p.reg2()?;
                self.swap_structs(Family::Queue, a, b)?;
            }
            Opcode::IndQSwap => {
                let (a, b) = self.indirect_pair()?;
                self.swap_structs(Family::Queue, a, b)?;
            }
            Opcode::QStat => {
                let i = p.u8()?;
                self.regs.set_stat(self.queues[i as usize].stat());
            }
            Opcode::IndQStat => {
                let i = self.indirect_index()?;
                self.regs.set_stat(self.queues[i as usize].stat());
            }

            // Tapes
            Opcode::TLoad => {
                let (d, i) = p.reg2()?;
                let v = self.tapes[i as usize].load().map_err(st(Family::Tape, i))?;
                self.regs.set(d, v);
            }
            Opcode::TStore => {
                let (i, s) = p.reg2()?;
                let v = self.regs.get(s);
                self.tapes[i as usize].store(v).map_err(st(Family::Tape, i))?;
            }
            Opcode::Left => {
                let i = p.u8()?;
                self.tapes[i as usize].left().map_err(st(Family::Tape, i))?;
            }
            Opcode::Right => {
                let i = p.u8()?;
                self.tapes[i as usize].right().map_err(st(Family::Tape, i))?;
            }
            Opcode::Center => {
                let i = p.u8()?;
                self.tapes[i as usize].center().map_err(st(Family::Tape, i))?;
            }
            Opcode::TSwap => {
                let (a, b) = p.reg2()?;
                self.swap_structs(Family::Tape, a, b)?;
            }
            Opcode::IndTSwap => {
                let (a, b) = self.indirect_pair()?;
                self.swap_structs(Family::Tape, a, b)?;
            }
            Opcode::TStat => {
                let i = p.u8()?;
                self.regs.set_stat(self.tapes[i as usize].stat());
            }
            Opcode::IndTStat => {
                let i = self.indirect_index()?;
                self.regs.set_stat(self.tapes[i as usize].stat());
            }

            // Memories
            Opcode::MLoad => {
                let (d, i) = p.reg2()?;
                let addr = p.u32()?;
                let v = self.memories[i as usize]
                    .load(addr)
                    .map_err(st(Family::Memory, i))?;
                self.regs.set(d, v);
            }
            Opcode::IndLoad => {
                let (d, i) = p.reg2()?;
                let addr = self.regs.get(REG_I);
                let v = self.memories[i as usize]
                    .load(addr)
                    .map_err(st(Family::Memory, i))?;
                self.regs.set(d, v);
            }
            Opcode::IndIndLoad => {
                let d = p.u8()?;
                let i = self.indirect_memory()?;
                let addr = self.regs.get(REG_I);
                let v = self.memories[i as usize]
                    .load(addr)
                    .map_err(st(Family::Memory, i))?;
                self.regs.set(d, v);
            }
            Opcode::MStore => {
                let i = p.u8()?;
                let addr = p.u32()?;
                let s = p.u8()?;
                let v = self.regs.get(s);
                self.memories[i as usize]
                    .store(addr, v)
                    .map_err(st(Family::Memory, i))?;
            }
            Opcode::IndStore => {
                let (i, s) = p.reg2()?;
                let addr = self.regs.get(REG_I);
                let v = self.regs.get(s);
                self.memories[i as usize]
                    .store(addr, v)
                    .map_err(st(Family::Memory, i))?;
            }
            Opcode::IndIndStore => {
                let s = p.u8()?;
                let i = self.indirect_memory()?;
                let addr = self.regs.get(REG_I);
                let v = self.regs.get(s);
                self.memories[i as usize]
                    .store(addr, v)
                    .map_err(st(Family::Memory, i))?;
            }
            Opcode::MSwap => {
                let (a, b) = p.reg2()?;
                self.swap_structs(Family::Memory, a, b)?;
            }
            Opcode::IndMSwap => {
                let (a, b) = self.indirect_pair()?;
                self.swap_structs(Family::Memory, a, b)?;
            }
            Opcode::MStat => {
                let i = p.u8()?;
                self.regs.set_stat(self.memories[i as usize].stat());
            }
            Opcode::IndMStat => {
                let i = self.indirect_index()?;
                self.regs.set_stat(self.memories[i as usize].stat());
            }

            // Jumps and calls
            Opcode::Jump => {
                self.pc = p.u32()?;
            }
            Opcode::CondJmp => {
                let target = p.u32()?;
                if self.regs.condition() {
                    self.pc = target;
                }
            }
            Opcode::Call => {
                let target = p.u32()?;
                self.call(target)?;
            }
            Opcode::CondCall => {
                let target = p.u32()?;
                if self.regs.condition() {
                    self.call(target)?;
                }
            }
            Opcode::Return => self.ret()?,
            Opcode::CondReturn => {
                if self.regs.condition() {
                    self.ret()?;
                }
            }

            // Input / output
            Opcode::RStat => {
                let remaining = self.read_buf.remaining_chars();
                let (u, i, f) = match self.read_buf.peek_token() {
                    Some(t) => (
                        t.parse::<u32>().is_ok(),
                        t.parse::<i32>().is_ok(),
                        t.parse::<f32>().is_ok(),
                    ),
                    None => (false, false, false),
                };
                self.regs.set(implicit('a'), (remaining > 0) as u32);
                self.regs.set(implicit('c'), remaining);
                self.regs.set(implicit('s'), remaining);
                self.regs.set(REG_U, u as u32);
                self.regs.set(implicit('i'), i as u32);
                self.regs.set(implicit('f'), f as u32);
            }
            Opcode::WStat => {
                let len = self.write_buf.len_chars();
                self.regs
                    .set(implicit('a'), (!self.write_buf.is_empty()) as u32);
                self.regs.set(implicit('c'), len);
                self.regs.set(implicit('s'), len);
            }
            Opcode::Read => {
                let r = p.u8()?;
                let v = self.read_token::<u32>("u32")?;
                self.regs.set(r, v);
            }
            Opcode::IRead => {
                let r = p.u8()?;
                let v = self.read_token::<i32>("i32")?;
                self.regs.set_i(r, v);
            }
            Opcode::FRead => {
                let r = p.u8()?;
                let v = self.read_token::<f32>("f32")?;
                self.regs.set_f(r, v);
            }
            Opcode::CRead => {
                let r = p.u8()?;
                let c = self.read_buf.next_char().ok_or(RuntimeError::EndOfLine)?;
                self.regs.set(r, c as u32);
            }
            Opcode::ReadLn => {
                let line = self.input.as_mut().and_then(|read| read());
                match line {
                    Some(line) => {
                        self.read_buf.fill(line);
                        self.regs.set(REG_Z, 1);
                    }
                    None => self.regs.set(REG_Z, 0),
                }
            }
            Opcode::RReset => self.read_buf.reset(),
            Opcode::RClear => self.read_buf.clear(),
            Opcode::Write => {
                let r = p.u8()?;
                let text = self.regs.get(r).to_string();
                self.write_buf.append(&text);
            }
            Opcode::IWrite => {
                let r = p.u8()?;
                let text = self.regs.get_i(r).to_string();
                self.write_buf.append(&text);
            }
            Opcode::FWrite => {
                let r = p.u8()?;
                let text = self.regs.get_f(r).to_string();
                self.write_buf.append(&text);
            }
            Opcode::CWrite => {
                let r = p.u8()?;
                let v = self.regs.get(r);
                let c = char::from_u32(v)
                    .ok_or(RuntimeError::InvalidCharacterValue { value: v })?;
                self.write_buf.append(&c.to_string());
            }
            Opcode::WriteLn => {
                let ok = match self.output.as_mut() {
                    Some(write) => write(self.write_buf.content()),
                    None => true,
                };
                if !ok {
                    return Err(RuntimeError::OutputFailed);
                }
                self.write_buf.clear();
            }
            Opcode::WReset => self.write_buf.reset(),
            Opcode::WClear => self.write_buf.clear(),
            Opcode::RwSwap => std::mem::swap(&mut self.read_buf, &mut self.write_buf),

            // Miscellaneous
            Opcode::Timer => {
                let (lo, hi) = p.reg2()?;
                let micros = self.epoch.elapsed().as_micros() as u64;
                self.regs.set(lo, micros as u32);
                self.regs.set(hi, (micros >> 32) as u32);
            }
            Opcode::RdSeedAny => {
                self.rng = Pcg32::new(rand::random(), rand::random());
            }
            Opcode::RdSeed => {
                let (a, b) = p.reg2()?;
                let (c, d) = p.reg2()?;
                let state =
                    (u64::from(self.regs.get(a)) << 32) | u64::from(self.regs.get(b));
                let stream =
                    (u64::from(self.regs.get(c)) << 32) | u64::from(self.regs.get(d));
                self.rng = Pcg32::new(state, stream);
            }
            Opcode::Rand => {
                let r = p.u8()?;
                let v: u32 = self.rng.gen();
                self.regs.set(r, v);
            }
            Opcode::IRand => {
                let r = p.u8()?;
                let v: i32 = self.rng.gen();
                self.regs.set_i(r, v);
            }
            Opcode::FRand => {
                let r = p.u8()?;
                let v: f32 = self.rng.gen();
                self.regs.set_f(r, v);
            }
            Opcode::Profiling => {
                self.profiling_on = p.u8()? != 0;
            }
            Opcode::Tracing => {
                self.tracing_on = p.u8()? != 0;
            }
            Opcode::Breakpoint => self.set_state(CpuState::Interrupted),
            Opcode::Terminate => return Err(RuntimeError::ExplicitTerminate),
            Opcode::Unreachable => return Err(RuntimeError::FellOffFunction),
            Opcode::Exit => self.set_state(CpuState::Finished),
        }
        Ok(())
    }

    // ==================== Execution helpers ====================

    fn bin_u(
        &mut self,
        p: &mut Params<'_>,
        f: impl FnOnce(u32, u32) -> Result<u32, RuntimeError>,
    ) -> Result<(), RuntimeError> {
        let (d, l, r) = p.reg3()?;
        let v = f(self.regs.get(l), self.regs.get(r))?;
        self.regs.set(d, v);
        Ok(())
    }

    fn bin_i(
        &mut self,
        p: &mut Params<'_>,
        f: impl FnOnce(i32, i32) -> Result<i32, RuntimeError>,
    ) -> Result<(), RuntimeError> {
        let (d, l, r) = p.reg3()?;
        let v = f(self.regs.get_i(l), self.regs.get_i(r))?;
        self.regs.set_i(d, v);
        Ok(())
    }

    fn bin_f(
        &mut self,
        p: &mut Params<'_>,
        f: impl FnOnce(f32, f32) -> f32,
    ) -> Result<(), RuntimeError> {
        let (d, l, r) = p.reg3()?;
        let v = f(self.regs.get_f(l), self.regs.get_f(r));
        self.regs.set_f(d, v);
        Ok(())
    }

    fn un_f(
        &mut self,
        p: &mut Params<'_>,
        f: impl FnOnce(f32) -> f32,
    ) -> Result<(), RuntimeError> {
        let (d, s) = p.reg2()?;
        self.regs.set_f(d, f(self.regs.get_f(s)));
        Ok(())
    }

    fn cmp_i(
        &mut self,
        p: &mut Params<'_>,
        f: impl FnOnce(i32, i32) -> bool,
    ) -> Result<(), RuntimeError> {
        let (d, l, r) = p.reg3()?;
        let v = f(self.regs.get_i(l), self.regs.get_i(r));
        self.regs.set(d, v as u32);
        Ok(())
    }

    fn cmp_f(
        &mut self,
        p: &mut Params<'_>,
        f: impl FnOnce(f32, f32) -> bool,
    ) -> Result<(), RuntimeError> {
        let (d, l, r) = p.reg3()?;
        let v = f(self.regs.get_f(l), self.regs.get_f(r));
        self.regs.set(d, v as u32);
        Ok(())
    }

    fn class_f(
        &mut self,
        p: &mut Params<'_>,
        f: impl FnOnce(f32) -> bool,
    ) -> Result<(), RuntimeError> {
        let (d, s) = p.reg2()?;
        self.regs.set(d, f(self.regs.get_f(s)) as u32);
        Ok(())
    }

    /// Parses the next read-buffer token; faults at end of line or on a
    /// token of the wrong shape.
    fn read_token<T: std::str::FromStr>(
        &mut self,
        expected: &'static str,
    ) -> Result<T, RuntimeError> {
        let token = self.read_buf.take_token().ok_or(RuntimeError::EndOfLine)?;
        token.parse().map_err(|_| RuntimeError::MalformedToken {
            expected,
            text: token.to_string(),
        })
    }

    fn call(&mut self, target: u32) -> Result<(), RuntimeError> {
        let depth = self.callstack.len() as u32;
        if depth >= self.limits.callstack_capacity {
            return Err(RuntimeError::CallStackOverflow { depth });
        }
        // pc already points past the call; return resumes there.
        self.callstack.push(self.pc);
        self.pc = target;
        Ok(())
    }

    fn ret(&mut self) -> Result<(), RuntimeError> {
        self.pc = self
            .callstack
            .pop()
            .ok_or(RuntimeError::CallStackUnderflow)?;
        Ok(())
    }

    /// Structure index from implicit `i`.
    fn indirect_index(&self) -> Result<u8, RuntimeError> {
        let value = self.regs.get(REG_I);
        if value >= INSTANCES as u32 {
            return Err(RuntimeError::StructureIndexOutOfRange { value });
        }
        Ok(value as u8)
    }

    /// Structure index pair from implicit `i` and `j`.
    fn indirect_pair(&self) -> Result<(u8, u8), RuntimeError> {
        let (i, j) = (self.regs.get(REG_I), self.regs.get(REG_J));
        for value in [i, j] {
            if value >= INSTANCES as u32 {
                return Err(RuntimeError::StructureIndexOutOfRange { value });
            }
        }
        Ok((i as u8, j as u8))
    }

    /// Memory index from implicit `j` for the doubly-indirect opcodes.
    fn indirect_memory(&self) -> Result<u8, RuntimeError> {
        let value = self.regs.get(REG_J);
        if value >= INSTANCES as u32 {
            return Err(RuntimeError::StructureIndexOutOfRange { value });
        }
        Ok(value as u8)
    }

    /// Exchanges two instances of one family wholesale; both must be enabled.
    fn swap_structs(&mut self, family: Family, a: u8, b: u8) -> Result<(), RuntimeError> {
        let enabled = |cpu: &Cpu, i: u8| match family {
            Family::Stack => cpu.stacks[i as usize].enabled(),
            Family::Queue => cpu.queues[i as usize].enabled(),
            Family::Tape => cpu.tapes[i as usize].enabled(),
            Family::Memory => cpu.memories[i as usize].enabled(),
        };
        for i in [a, b] {
            if !enabled(self, i) {
                return Err(RuntimeError::DisabledStructure {
                    name: family.instance_name(i),
                });
            }
        }
        match family {
            Family::Stack => self.stacks.swap(a as usize, b as usize),
            Family::Queue => self.queues.swap(a as usize, b as usize),
            Family::Tape => self.tapes.swap(a as usize, b as usize),
            Family::Memory => self.memories.swap(a as usize, b as usize),
        }
        Ok(())
    }
}
