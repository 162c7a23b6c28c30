//! Instruction Set Architecture (ISA) definitions.
//!
//! Defines the virtual machine's instruction set. The
//! [`for_each_opcode!`](crate::for_each_opcode) macro holds the canonical
//! opcode definitions and invokes a callback macro for code generation, so
//! several modules can generate opcode-related code without duplicating the
//! definitions.
//!
//! This module generates:
//! - The [`Opcode`] enum with tag values
//! - `TryFrom<u16>` for decoding tags
//! - [`OPCODE_TABLE`], the declarative table the assembler drives its operand
//!   parsing from
//!
//! # Parameter encoding
//!
//! Opcodes are stored out-of-line from their parameters: the program keeps a
//! parallel array of byte offsets into a single parameter blob. Within the
//! blob, operands are packed little-endian:
//! - Register operand: 1 byte (cell index 0-51)
//! - Structure instance index: 1 byte (0-25)
//! - Immediate u32 / i32 / f32: 4 bytes (little-endian)
//! - Memory address: 4 bytes (little-endian)
//! - Jump / call target: 4 bytes (little-endian absolute instruction index,
//!   written as a placeholder and patched during fixup resolution)
//! - Flag: 1 byte (0 = false, nonzero = true)

use crate::errors::RuntimeError;

/// How the assembler reaches an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsmMode {
    /// Matched directly by its mnemonic; operands parsed from the schema.
    Direct,
    /// Selected by the assembler from a structure token (e.g. `load R TA`
    /// becomes `tload`), or synthesized (scope exits). Never matched by
    /// mnemonic.
    Derived,
}

/// Operand shapes appearing in the parameter blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    /// Register cell index, 1 byte.
    Reg,
    /// Unsigned 32-bit immediate.
    ImmU32,
    /// Signed 32-bit immediate.
    ImmI32,
    /// Single-precision float immediate.
    ImmF32,
    /// Boolean flag, 1 byte.
    Flag,
    /// Label reference resolved within the enclosing function scope.
    Label,
    /// Function reference resolved against function entry points.
    Func,
    /// Structure instance index, 1 byte.
    Idx,
    /// Memory cell address, 4 bytes.
    Addr,
}

/// One row of the declarative opcode table.
#[derive(Debug, Clone, Copy)]
pub struct OpcodeInfo {
    pub opcode: Opcode,
    pub mnemonic: &'static str,
    pub mode: AsmMode,
    pub operands: &'static [OperandKind],
}

/// Invokes a callback macro with the complete opcode definition list.
///
/// Each row is `Name = tag, "mnemonic", Mode => [field: Kind, ...]`.
#[macro_export]
macro_rules! for_each_opcode {
    ($callback:ident) => {
        $callback! {
            /// nop ; does nothing
            Nop = 0x00, "nop", Direct => [],
            // =========================
            // Registers
            // =========================
            /// reset R ; R = 0
            Reset = 0x01, "reset", Direct => [r: Reg],
            /// set R u32 ; R = u32
            Set = 0x02, "set", Direct => [r: Reg, value: ImmU32],
            /// iset R i32 ; R = i32
            ISet = 0x03, "iset", Direct => [r: Reg, value: ImmI32],
            /// fset R f32 ; R = f32
            FSet = 0x04, "fset", Direct => [r: Reg, value: ImmF32],
            /// copy D S ; D = S
            Copy = 0x05, "copy", Direct => [dst: Reg, src: Reg],
            /// condrst R ; if z: R = 0
            CondRst = 0x06, "condrst", Direct => [r: Reg],
            /// condset R u32 ; if z: R = u32
            CondSet = 0x07, "condset", Direct => [r: Reg, value: ImmU32],
            /// condiset R i32 ; if z: R = i32
            CondISet = 0x08, "condiset", Direct => [r: Reg, value: ImmI32],
            /// condfset R f32 ; if z: R = f32
            CondFSet = 0x09, "condfset", Direct => [r: Reg, value: ImmF32],
            /// condcpy D S ; if z: D = S
            CondCpy = 0x0A, "condcpy", Direct => [dst: Reg, src: Reg],
            /// indcpy ; reg[d] = reg[s], cell indices taken from implicit d and s
            IndCpy = 0x0B, "indcpy", Direct => [],
            // =========================
            // Unsigned arithmetic
            // =========================
            /// add D L R ; D = L + R (wrapping)
            Add = 0x10, "add", Direct => [dst: Reg, lhs: Reg, rhs: Reg],
            /// sub D L R ; D = L - R (wrapping)
            Sub = 0x11, "sub", Direct => [dst: Reg, lhs: Reg, rhs: Reg],
            /// mul D L R ; D = L * R (wrapping)
            Mul = 0x12, "mul", Direct => [dst: Reg, lhs: Reg, rhs: Reg],
            /// div D L R ; D = L / R (fault on zero divisor)
            Div = 0x13, "div", Direct => [dst: Reg, lhs: Reg, rhs: Reg],
            /// mod D L R ; D = L % R (fault on zero divisor)
            Mod = 0x14, "mod", Direct => [dst: Reg, lhs: Reg, rhs: Reg],
            /// inc R ; R += 1
            Inc = 0x15, "inc", Direct => [r: Reg],
            /// dec R ; R -= 1
            Dec = 0x16, "dec", Direct => [r: Reg],
            // =========================
            // Signed arithmetic
            // =========================
            /// iadd D L R ; D = L + R (two's-complement wrapping)
            IAdd = 0x18, "iadd", Direct => [dst: Reg, lhs: Reg, rhs: Reg],
            /// isub D L R ; D = L - R
            ISub = 0x19, "isub", Direct => [dst: Reg, lhs: Reg, rhs: Reg],
            /// imul D L R ; D = L * R
            IMul = 0x1A, "imul", Direct => [dst: Reg, lhs: Reg, rhs: Reg],
            /// idiv D L R ; D = L / R (fault on zero divisor)
            IDiv = 0x1B, "idiv", Direct => [dst: Reg, lhs: Reg, rhs: Reg],
            /// imod D L R ; D = L % R (fault on zero divisor)
            IMod = 0x1C, "imod", Direct => [dst: Reg, lhs: Reg, rhs: Reg],
            /// iinc R ; R += 1
            IInc = 0x1D, "iinc", Direct => [r: Reg],
            /// idec R ; R -= 1
            IDec = 0x1E, "idec", Direct => [r: Reg],
            /// iabs D S ; D = |S|
            IAbs = 0x1F, "iabs", Direct => [dst: Reg, src: Reg],
            // =========================
            // Float arithmetic
            // =========================
            /// fadd D L R ; D = L + R
            FAdd = 0x20, "fadd", Direct => [dst: Reg, lhs: Reg, rhs: Reg],
            /// fsub D L R ; D = L - R
            FSub = 0x21, "fsub", Direct => [dst: Reg, lhs: Reg, rhs: Reg],
            /// fmul D L R ; D = L * R
            FMul = 0x22, "fmul", Direct => [dst: Reg, lhs: Reg, rhs: Reg],
            /// fdiv D L R ; D = L / R
            FDiv = 0x23, "fdiv", Direct => [dst: Reg, lhs: Reg, rhs: Reg],
            /// fpow D L R ; D = L ^ R
            FPow = 0x24, "fpow", Direct => [dst: Reg, lhs: Reg, rhs: Reg],
            /// fatan2 D L R ; D = atan2(L, R), radians
            FAtan2 = 0x25, "fatan2", Direct => [dst: Reg, lhs: Reg, rhs: Reg],
            /// fabs D S ; D = |S|
            FAbs = 0x26, "fabs", Direct => [dst: Reg, src: Reg],
            /// fsqrt D S ; D = sqrt(S)
            FSqrt = 0x27, "fsqrt", Direct => [dst: Reg, src: Reg],
            /// flog D S ; D = ln(S)
            FLog = 0x28, "flog", Direct => [dst: Reg, src: Reg],
            /// fsin D S ; D = sin(S), S in radians
            FSin = 0x29, "fsin", Direct => [dst: Reg, src: Reg],
            /// fcos D S ; D = cos(S), S in radians
            FCos = 0x2A, "fcos", Direct => [dst: Reg, src: Reg],
            /// ftan D S ; D = tan(S), S in radians
            FTan = 0x2B, "ftan", Direct => [dst: Reg, src: Reg],
            /// fasin D S ; D = asin(S), radians
            FAsin = 0x2C, "fasin", Direct => [dst: Reg, src: Reg],
            /// facos D S ; D = acos(S), radians
            FAcos = 0x2D, "facos", Direct => [dst: Reg, src: Reg],
            /// fatan D S ; D = atan(S), radians
            FAtan = 0x2E, "fatan", Direct => [dst: Reg, src: Reg],
            /// ffloor D S ; D = floor(S)
            FFloor = 0x2F, "ffloor", Direct => [dst: Reg, src: Reg],
            /// fround D S ; D = round(S)
            FRound = 0x30, "fround", Direct => [dst: Reg, src: Reg],
            /// fceil D S ; D = ceil(S)
            FCeil = 0x31, "fceil", Direct => [dst: Reg, src: Reg],
            /// s2f D S ; D = S as f32, S read as i32
            S2F = 0x32, "s2f", Direct => [dst: Reg, src: Reg],
            /// u2f D S ; D = S as f32, S read as u32
            U2F = 0x33, "u2f", Direct => [dst: Reg, src: Reg],
            /// f2s D S ; D = S as i32 (saturating cast)
            F2S = 0x34, "f2s", Direct => [dst: Reg, src: Reg],
            /// f2u D S ; D = S as u32 (saturating cast)
            F2U = 0x35, "f2u", Direct => [dst: Reg, src: Reg],
            // =========================
            // Logic
            // =========================
            /// and D L R ; D = (L != 0) && (R != 0)
            And = 0x40, "and", Direct => [dst: Reg, lhs: Reg, rhs: Reg],
            /// or D L R ; D = (L != 0) || (R != 0)
            Or = 0x41, "or", Direct => [dst: Reg, lhs: Reg, rhs: Reg],
            /// xor D L R ; D = (L != 0) != (R != 0)
            Xor = 0x42, "xor", Direct => [dst: Reg, lhs: Reg, rhs: Reg],
            /// not D S ; D = (S == 0)
            Not = 0x43, "not", Direct => [dst: Reg, src: Reg],
            /// inv R ; R = (R == 0), in place
            Inv = 0x44, "inv", Direct => [r: Reg],
            /// shl D L R ; D = L << R (0 fill, zero when R >= 32)
            Shl = 0x45, "shl", Direct => [dst: Reg, lhs: Reg, rhs: Reg],
            /// shr D L R ; D = L >> R (0 fill, zero when R >= 32)
            Shr = 0x46, "shr", Direct => [dst: Reg, lhs: Reg, rhs: Reg],
            /// rol D L R ; D = L rotated left by R mod 32
            Rol = 0x47, "rol", Direct => [dst: Reg, lhs: Reg, rhs: Reg],
            /// ror D L R ; D = L rotated right by R mod 32
            Ror = 0x48, "ror", Direct => [dst: Reg, lhs: Reg, rhs: Reg],
            /// band D L R ; D = L & R
            BAnd = 0x49, "band", Direct => [dst: Reg, lhs: Reg, rhs: Reg],
            /// bor D L R ; D = L | R
            BOr = 0x4A, "bor", Direct => [dst: Reg, lhs: Reg, rhs: Reg],
            /// bxor D L R ; D = L ^ R
            BXor = 0x4B, "bxor", Direct => [dst: Reg, lhs: Reg, rhs: Reg],
            /// bnot D S ; D = ~S
            BNot = 0x4C, "bnot", Direct => [dst: Reg, src: Reg],
            /// binv R ; R = ~R, in place
            BInv = 0x4D, "binv", Direct => [r: Reg],
            // =========================
            // Comparisons
            // =========================
            /// eq D L R ; D = (L == R), unsigned
            Eq = 0x50, "eq", Direct => [dst: Reg, lhs: Reg, rhs: Reg],
            /// neq D L R ; D = (L != R), unsigned
            Neq = 0x51, "neq", Direct => [dst: Reg, lhs: Reg, rhs: Reg],
            /// lt D L R ; D = (L < R), unsigned
            Lt = 0x52, "lt", Direct => [dst: Reg, lhs: Reg, rhs: Reg],
            /// gt D L R ; D = (L > R), unsigned
            Gt = 0x53, "gt", Direct => [dst: Reg, lhs: Reg, rhs: Reg],
            /// lte D L R ; D = (L <= R), unsigned
            Lte = 0x54, "lte", Direct => [dst: Reg, lhs: Reg, rhs: Reg],
            /// gte D L R ; D = (L >= R), unsigned
            Gte = 0x55, "gte", Direct => [dst: Reg, lhs: Reg, rhs: Reg],
            /// ieq D L R ; D = (L == R), signed
            IEq = 0x56, "ieq", Direct => [dst: Reg, lhs: Reg, rhs: Reg],
            /// ineq D L R ; D = (L != R), signed
            INeq = 0x57, "ineq", Direct => [dst: Reg, lhs: Reg, rhs: Reg],
            /// ilt D L R ; D = (L < R), signed
            ILt = 0x58, "ilt", Direct => [dst: Reg, lhs: Reg, rhs: Reg],
            /// igt D L R ; D = (L > R), signed
            IGt = 0x59, "igt", Direct => [dst: Reg, lhs: Reg, rhs: Reg],
            /// ilte D L R ; D = (L <= R), signed
            ILte = 0x5A, "ilte", Direct => [dst: Reg, lhs: Reg, rhs: Reg],
            /// igte D L R ; D = (L >= R), signed
            IGte = 0x5B, "igte", Direct => [dst: Reg, lhs: Reg, rhs: Reg],
            /// feq D L R ; D = (L == R), float
            FEq = 0x5C, "feq", Direct => [dst: Reg, lhs: Reg, rhs: Reg],
            /// fneq D L R ; D = (L != R), float
            FNeq = 0x5D, "fneq", Direct => [dst: Reg, lhs: Reg, rhs: Reg],
            /// flt D L R ; D = (L < R), float
            FLt = 0x5E, "flt", Direct => [dst: Reg, lhs: Reg, rhs: Reg],
            /// fgt D L R ; D = (L > R), float
            FGt = 0x5F, "fgt", Direct => [dst: Reg, lhs: Reg, rhs: Reg],
            /// flte D L R ; D = (L <= R), float
            FLte = 0x60, "flte", Direct => [dst: Reg, lhs: Reg, rhs: Reg],
            /// fgte D L R ; D = (L >= R), float
            FGte = 0x61, "fgte", Direct => [dst: Reg, lhs: Reg, rhs: Reg],
            /// fisnan D S ; D = S is NaN
            FIsNan = 0x62, "fisnan", Direct => [dst: Reg, src: Reg],
            /// fisinf D S ; D = S is infinite
            FIsInf = 0x63, "fisinf", Direct => [dst: Reg, src: Reg],
            /// fisfin D S ; D = S is finite
            FIsFin = 0x64, "fisfin", Direct => [dst: Reg, src: Reg],
            /// fisnorm D S ; D = S is normal
            FIsNorm = 0x65, "fisnorm", Direct => [dst: Reg, src: Reg],
            /// test D S ; D = (S != 0)
            Test = 0x66, "test", Direct => [dst: Reg, src: Reg],
            // =========================
            // Stacks
            // =========================
            /// load R SI ; R = top of stack I
            SLoad = 0x70, "sload", Derived => [dst: Reg, idx: Idx],
            /// store SI R ; overwrite top of stack I with R
            SStore = 0x71, "sstore", Derived => [idx: Idx, src: Reg],
            /// pop R SI ; remove top of stack I into R
            Pop = 0x72, "pop", Derived => [dst: Reg, idx: Idx],
            /// push SI R ; append R to stack I
            Push = 0x73, "push", Derived => [idx: Idx, src: Reg],
            /// swap SI SJ ; exchange stacks I and J wholesale
            SSwap = 0x74, "sswap", Derived => [a: Idx, b: Idx],
            /// indswap SA SA ; exchange stacks, indices from implicit i and j
            IndSSwap = 0x75, "indsswap", Derived => [],
            /// stat SI ; stat tuple of stack I into implicit registers
            SStat = 0x76, "sstat", Derived => [idx: Idx],
            /// indstat SA ; stat tuple, index from implicit i
            IndSStat = 0x77, "indsstat", Derived => [],
            // =========================
            // Queues
            // =========================
            /// load R QI ; R = front of queue I
            QLoad = 0x78, "qload", Derived => [dst: Reg, idx: Idx],
            /// store QI R ; overwrite front of queue I with R
            QStore = 0x79, "qstore", Derived => [idx: Idx, src: Reg],
            /// dequeue R QI ; remove front of queue I into R
            Dequeue = 0x7A, "dequeue", Derived => [dst: Reg, idx: Idx],
            /// enqueue QI R ; append R to queue I
            Enqueue = 0x7B, "enqueue", Derived => [idx: Idx, src: Reg],
            /// swap QI QJ ; exchange queues I and J wholesale
            QSwap = 0x7C, "qswap", Derived => [a: Idx, b: Idx],
            /// indswap QA QA ; exchange queues, indices from implicit i and j
            IndQSwap = 0x7D, "indqswap", Derived => [],
            /// stat QI ; stat tuple of queue I into implicit registers
            QStat = 0x7E, "qstat", Derived => [idx: Idx],
            /// indstat QA ; stat tuple, index from implicit i
            IndQStat = 0x7F, "indqstat", Derived => [],
            // =========================
            // Tapes
            // =========================
            /// load R TI ; R = cell under the head of tape I
            TLoad = 0x80, "tload", Derived => [dst: Reg, idx: Idx],
            /// store TI R ; overwrite cell under the head of tape I with R
            TStore = 0x81, "tstore", Derived => [idx: Idx, src: Reg],
            /// left TI ; move head left, growing the tape on underflow
            Left = 0x82, "left", Derived => [idx: Idx],
            /// right TI ; move head right, growing the tape on overflow
            Right = 0x83, "right", Derived => [idx: Idx],
            /// center TI ; reset head position to 0
            Center = 0x84, "center", Derived => [idx: Idx],
            /// swap TI TJ ; exchange tapes I and J wholesale
            TSwap = 0x85, "tswap", Derived => [a: Idx, b: Idx],
            /// indswap TA TA ; exchange tapes, indices from implicit i and j
            IndTSwap = 0x86, "indtswap", Derived => [],
            /// stat TI ; stat tuple of tape I into implicit registers
            TStat = 0x87, "tstat", Derived => [idx: Idx],
            /// indstat TA ; stat tuple, index from implicit i
            IndTStat = 0x88, "indtstat", Derived => [],
            // =========================
            // Memories
            // =========================
            /// load R MI@addr ; R = memory I at addr
            MLoad = 0x90, "mload", Derived => [dst: Reg, idx: Idx, addr: Addr],
            /// indload R MI ; R = memory I at address from implicit i
            IndLoad = 0x91, "indload", Derived => [dst: Reg, idx: Idx],
            /// indindload R ; R = memory[j] at address from implicit i
            IndIndLoad = 0x92, "indindload", Direct => [dst: Reg],
            /// store MI@addr R ; memory I at addr = R
            MStore = 0x93, "mstore", Derived => [idx: Idx, addr: Addr, src: Reg],
            /// indstore MI R ; memory I at address from implicit i = R
            IndStore = 0x94, "indstore", Derived => [idx: Idx, src: Reg],
            /// indindstore R ; memory[j] at address from implicit i = R
            IndIndStore = 0x95, "indindstore", Direct => [src: Reg],
            /// swap MI MJ ; exchange memories I and J wholesale
            MSwap = 0x96, "mswap", Derived => [a: Idx, b: Idx],
            /// indswap MA MA ; exchange memories, indices from implicit i and j
            IndMSwap = 0x97, "indmswap", Derived => [],
            /// stat MI ; stat tuple of memory I into implicit registers
            MStat = 0x98, "mstat", Derived => [idx: Idx],
            /// indstat MA ; stat tuple, index from implicit i
            IndMStat = 0x99, "indmstat", Derived => [],
            // =========================
            // Jumps and calls
            // =========================
            /// jump L ; pc = L
            Jump = 0xA0, "jump", Direct => [target: Label],
            /// condjmp L ; if z: pc = L
            CondJmp = 0xA1, "condjmp", Direct => [target: Label],
            /// call F ; push pc, pc = entry of F
            Call = 0xA4, "call", Direct => [target: Func],
            /// condcall F ; if z: push pc, pc = entry of F
            CondCall = 0xA5, "condcall", Direct => [target: Func],
            /// return ; pop pc
            Return = 0xA6, "return", Direct => [],
            /// condreturn ; if z: pop pc
            CondReturn = 0xA7, "condreturn", Direct => [],
            // =========================
            // Input / output
            // =========================
            /// rstat ; read-buffer state into implicit registers
            RStat = 0xB0, "rstat", Direct => [],
            /// wstat ; write-buffer state into implicit registers
            WStat = 0xB1, "wstat", Direct => [],
            /// read R ; parse next token of the read buffer as u32
            Read = 0xB2, "read", Direct => [r: Reg],
            /// iread R ; parse next token of the read buffer as i32
            IRead = 0xB3, "iread", Direct => [r: Reg],
            /// fread R ; parse next token of the read buffer as f32
            FRead = 0xB4, "fread", Direct => [r: Reg],
            /// cread R ; next character of the read buffer
            CRead = 0xB5, "cread", Direct => [r: Reg],
            /// readln ; fetch one input line into the read buffer; z = success
            ReadLn = 0xB6, "readln", Direct => [],
            /// rreset ; rewind the read buffer
            RReset = 0xB7, "rreset", Direct => [],
            /// rclear ; discard the read buffer
            RClear = 0xB8, "rclear", Direct => [],
            /// write R ; append R as u32 text to the write buffer
            Write = 0xB9, "write", Direct => [r: Reg],
            /// iwrite R ; append R as i32 text to the write buffer
            IWrite = 0xBA, "iwrite", Direct => [r: Reg],
            /// fwrite R ; append R as f32 text to the write buffer
            FWrite = 0xBB, "fwrite", Direct => [r: Reg],
            /// cwrite R ; append R as a character to the write buffer
            CWrite = 0xBC, "cwrite", Direct => [r: Reg],
            /// writeln ; flush the write buffer to the output delegate
            WriteLn = 0xBD, "writeln", Direct => [],
            /// wreset ; rewind the write buffer
            WReset = 0xBE, "wreset", Direct => [],
            /// wclear ; discard the write buffer
            WClear = 0xBF, "wclear", Direct => [],
            /// rwswap ; exchange the read and write buffers
            RwSwap = 0xC0, "rwswap", Direct => [],
            // =========================
            // Miscellaneous
            // =========================
            /// timer LO HI ; elapsed microseconds since initialization
            Timer = 0xD0, "timer", Direct => [lo: Reg, hi: Reg],
            /// rdseedany ; reseed the generator from host entropy
            RdSeedAny = 0xD1, "rdseedany", Direct => [],
            /// rdseed A B C D ; reseed the generator from four registers
            RdSeed = 0xD2, "rdseed", Direct => [a: Reg, b: Reg, c: Reg, d: Reg],
            /// rand R ; R = next u32 from the generator
            Rand = 0xD3, "rand", Direct => [r: Reg],
            /// irand R ; R = next i32 from the generator
            IRand = 0xD4, "irand", Direct => [r: Reg],
            /// frand R ; R = next f32 in [0, 1) from the generator
            FRand = 0xD5, "frand", Direct => [r: Reg],
            /// profiling true|false ; toggle per-opcode step counting
            Profiling = 0xD6, "profiling", Direct => [on: Flag],
            /// tracing true|false ; toggle per-step trace logging
            Tracing = 0xD7, "tracing", Direct => [on: Flag],
            /// breakpoint ; transition to Interrupted (resumable)
            Breakpoint = 0xD8, "breakpoint", Direct => [],
            /// terminate ; fault with "explicit terminate"
            Terminate = 0xD9, "terminate", Direct => [],
            /// synthesized at the end of a function body; executing it faults
            Unreachable = 0xDA, "unreachable", Derived => [],
            /// exit ; successful program termination
            Exit = 0xDB, "exit", Direct => [],
        }
    };
}

macro_rules! define_opcodes {
    (
        $(
            $(#[$doc:meta])*
            $name:ident = $tag:literal, $mnemonic:literal, $mode:ident => [
                $( $field:ident : $kind:ident ),* $(,)?
            ]
        ),* $(,)?
    ) => {
        /// Instruction tag stored in the program's opcode sequence.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u16)]
        pub enum Opcode {
            $(
                $(#[$doc])*
                $name = $tag,
            )*
        }

        impl TryFrom<u16> for Opcode {
            type Error = RuntimeError;

            fn try_from(value: u16) -> Result<Self, Self::Error> {
                match value {
                    $( $tag => Ok(Opcode::$name), )*
                    _ => Err(RuntimeError::InvalidOpcode { tag: value }),
                }
            }
        }

        impl Opcode {
            /// Returns the assembly mnemonic for this opcode.
            pub const fn mnemonic(&self) -> &'static str {
                match self {
                    $( Opcode::$name => $mnemonic, )*
                }
            }
        }

        /// The declarative opcode table, one row per opcode.
        pub static OPCODE_TABLE: &[OpcodeInfo] = &[
            $(
                OpcodeInfo {
                    opcode: Opcode::$name,
                    mnemonic: $mnemonic,
                    mode: AsmMode::$mode,
                    operands: &[ $( OperandKind::$kind ),* ],
                },
            )*
        ];
    };
}

for_each_opcode!(define_opcodes);

/// Looks up a directly-assembled opcode by mnemonic.
///
/// Derived opcodes (structure dispatch, synthetic sentinels) are not matched;
/// the assembler selects those through their own grammar.
pub fn lookup_mnemonic(mnemonic: &str) -> Option<&'static OpcodeInfo> {
    OPCODE_TABLE
        .iter()
        .find(|info| info.mode == AsmMode::Direct && info.mnemonic == mnemonic)
}
