//! Error types for compilation and execution.

use thiserror::Error;

/// Errors raised while compiling assembly source.
///
/// The compiler wraps every per-line failure in [`CompileError::AtLine`],
/// attaching the 1-based line number and the original line text.
#[derive(Debug, Error)]
pub enum CompileError {
    /// Character outside the permitted set for code or comments.
    #[error("invalid character")]
    InvalidCharacter,
    /// Unrecognized instruction mnemonic.
    #[error("unknown instruction: {0}")]
    UnknownInstruction(String),
    /// An operand the instruction requires was not present.
    #[error("missing {what} parameter")]
    MissingParameter { what: &'static str },
    /// Tokens remained after all operands were consumed.
    #[error("superfluous argument")]
    SuperfluousArgument,
    /// Register token is not a single letter.
    #[error("invalid register name: {0}")]
    InvalidRegister(String),
    /// Structure token is not `TyI` with `Ty` in `SQTM` and `I` in `A..Z`.
    #[error("invalid structure name: {0}")]
    InvalidStructure(String),
    /// `@address` suffix used where the instruction forbids it.
    #[error("address specifier is forbidden here")]
    ForbiddenAddress,
    /// Literal failed to parse as the required type.
    #[error("invalid {expected} literal: {text}")]
    InvalidLiteral {
        expected: &'static str,
        text: String,
    },
    /// Function or label name violates the length or character grammar.
    #[error("invalid function/label name: {0}")]
    InvalidName(String),
    /// Instruction constrains the structure family and the token disagrees,
    /// e.g. "pop requires stack".
    #[error("{mnemonic} requires {family}")]
    FamilyMismatch {
        mnemonic: &'static str,
        family: &'static str,
    },
    /// `swap`/`indswap` operands name different structure families.
    #[error("{mnemonic} requires structures of same type")]
    MixedFamilies { mnemonic: &'static str },
    /// `indswap`/`indstat` must name instance `A` to denote the family.
    #[error("{mnemonic} requires the A instance to denote the structure type")]
    RequiresInstanceA { mnemonic: &'static str },
    /// Label defined more than once within a scope.
    #[error("duplicate label: {0}")]
    DuplicateLabel(String),
    /// Function name defined more than once.
    #[error("duplicate function: {0}")]
    DuplicateFunction(String),
    /// Jump or call target never defined in the referenced scope.
    #[error("label not found: {0}")]
    LabelNotFound(String),
    /// Per-line context wrapper added by the compiler driver.
    #[error("on line {line}: {text}: {source}")]
    AtLine {
        /// 1-based source line number.
        line: u32,
        /// Original (unnormalized) line text.
        text: String,
        #[source]
        source: Box<CompileError>,
    },
}

impl CompileError {
    /// Wraps the error with its source location.
    pub(crate) fn at_line(self, line: u32, text: &str) -> CompileError {
        CompileError::AtLine {
            line,
            text: text.to_string(),
            source: Box::new(self),
        }
    }

    /// The underlying error kind, unwrapping line context.
    pub fn kind(&self) -> &CompileError {
        match self {
            CompileError::AtLine { source, .. } => source.kind(),
            other => other,
        }
    }
}

/// Faults raised while executing a program.
///
/// Any fault transitions the CPU to `Terminated`; the interpreter re-raises
/// it wrapped in [`RuntimeError::Fault`] with the enclosing function name,
/// 1-based source line, and step index attached.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Opcode tag not present in the instruction table.
    #[error("invalid opcode: {tag:#x}")]
    InvalidOpcode { tag: u16 },
    /// Parameter blob ended while decoding operands.
    #[error("truncated instruction parameters at offset {offset}")]
    TruncatedParams { offset: usize },
    /// Program counter outside the instruction sequence.
    #[error("program counter {pc} out of range")]
    InvalidProgramCounter { pc: u32 },
    /// Operation requires a different CPU state.
    #[error("operation invalid in state {actual}")]
    InvalidState { actual: &'static str },
    /// No program is loaded.
    #[error("no program loaded")]
    NoProgram,
    /// Division or modulo by zero.
    #[error("division by zero")]
    DivisionByZero,
    /// Access to a structure instance beyond the configured count.
    #[error("structure {name} is disabled")]
    DisabledStructure { name: String },
    /// Push/enqueue/tape growth beyond the configured capacity.
    #[error("structure {name} is full")]
    StructureOverflow { name: String },
    /// Pop/dequeue/load/store on an empty stack or queue.
    #[error("structure {name} is empty")]
    StructureUnderflow { name: String },
    /// Memory address at or beyond the memory size.
    #[error("address {address} out of bounds for {name} of size {size}")]
    MemoryOutOfBounds {
        name: String,
        address: u32,
        size: u32,
    },
    /// Write to a read-only memory.
    #[error("memory {name} is read only")]
    ReadOnlyMemory { name: String },
    /// Host-side memory write whose length differs from the memory size.
    #[error("data size {actual} does not match memory size {expected}")]
    SizeMismatch { expected: u32, actual: u32 },
    /// Indirect structure index register holds a value >= 26.
    #[error("structure index {value} out of range")]
    StructureIndexOutOfRange { value: u32 },
    /// Indirect register index (implicit `d`/`s`) holds a value >= 52.
    #[error("register index {value} out of range")]
    RegisterIndexOutOfRange { value: u32 },
    /// Call with the call stack at its configured depth.
    #[error("call stack overflow at depth {depth}")]
    CallStackOverflow { depth: u32 },
    /// Return with an empty call stack.
    #[error("return without matching call")]
    CallStackUnderflow,
    /// Execution ran past the last instruction of a function body.
    #[error("fell off the end of a function")]
    FellOffFunction,
    /// The `terminate` opcode.
    #[error("explicit terminate")]
    ExplicitTerminate,
    /// The output delegate reported failure.
    #[error("output delegate failed")]
    OutputFailed,
    /// `cread` past the end of the read buffer.
    #[error("reading beyond the end of the line")]
    EndOfLine,
    /// `read`/`iread`/`fread` token does not parse as the requested type.
    #[error("malformed {expected} token: {text}")]
    MalformedToken {
        expected: &'static str,
        text: String,
    },
    /// `cwrite` of a value that is not a Unicode scalar.
    #[error("invalid character value: {value:#x}")]
    InvalidCharacterValue { value: u32 },
    /// Fault context wrapper added by the interpreter.
    #[error("in function '{function}' on line {line} at step {step}: {source}")]
    Fault {
        /// Enclosing function name; empty for the outer scope.
        function: String,
        /// 1-based source line number.
        line: u32,
        /// 1-based step index at the moment of fault.
        step: u64,
        #[source]
        source: Box<RuntimeError>,
    },
}

impl RuntimeError {
    /// The underlying fault kind, unwrapping execution context.
    pub fn kind(&self) -> &RuntimeError {
        match self {
            RuntimeError::Fault { source, .. } => source.kind(),
            other => other,
        }
    }
}
