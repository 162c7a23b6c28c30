//! Assembly source to program compilation.
//!
//! Single pass over the source with deferred label patching. Each non-blank
//! line yields exactly one instruction; `label` and `function` are
//! pseudo-instructions consumed by the symbol tables. Operand parsing for
//! ordinary instructions is driven by the declarative
//! [`OPCODE_TABLE`](crate::isa::OPCODE_TABLE); the structure-access mnemonics
//! (`load`, `push`, `swap`, ...) pick their opcode from the structure token's
//! family instead.
//!
//! # Scopes
//!
//! The outer scope is function index 0 with the empty name. A `function`
//! line closes the previous scope with a synthetic instruction (`exit` for
//! the outer scope, `unreachable` inside a body, so that running past the
//! end of a function faults) and registers the entry point as the label
//! `(Name, Name)`. Labels are keyed by `(enclosing function, name)`, so
//! bodies cannot jump across scopes. Jump and call operands are encoded as
//! u32 placeholders and patched once the whole source has been scanned.

pub(crate) mod lexer;

use std::collections::HashMap;

use crate::errors::CompileError;
use crate::isa::{lookup_mnemonic, Opcode, OperandKind};
use crate::program::Program;
use lexer::{
    decomment, parse_f32, parse_flag, parse_i32, parse_register, parse_structure, parse_u32,
    validate_name, LineCursor, StructureRef,
};
use crate::cpu::structures::Family;

/// Rejects an `@address` suffix where the grammar forbids one.
fn no_address(s: StructureRef) -> Result<StructureRef, CompileError> {
    if s.address.is_some() {
        return Err(CompileError::ForbiddenAddress);
    }
    Ok(s)
}

/// Parses a structure token constrained to one family, without address.
fn required_family(
    cur: &mut LineCursor<'_>,
    mnemonic: &'static str,
    family: Family,
    family_name: &'static str,
) -> Result<StructureRef, CompileError> {
    let s = no_address(parse_structure(cur.expect("structure")?)?)?;
    if s.family != family {
        return Err(CompileError::FamilyMismatch {
            mnemonic,
            family: family_name,
        });
    }
    Ok(s)
}

/// A recorded forward reference: patch the u32 at `offset` in the parameter
/// blob with the instruction index of label `(scope, name)`.
struct Fixup {
    scope: String,
    name: String,
    offset: usize,
    /// 0-based source line of the referencing instruction.
    line: u32,
}

#[derive(Default)]
struct Compiler {
    ops: Vec<Opcode>,
    param_offsets: Vec<u32>,
    source_lines: Vec<u32>,
    function_indices: Vec<u32>,
    params: Vec<u8>,
    function_names: Vec<String>,
    labels: HashMap<(String, String), u32>,
    fixups: Vec<Fixup>,
    current_function: u32,
    current_line: u32,
}

/// Compiles assembly source into an immutable [`Program`].
///
/// Errors carry the 1-based line number and the original line text.
pub fn compile(source: &str) -> Result<Program, CompileError> {
    let mut compiler = Compiler {
        function_names: vec![String::new()],
        ..Compiler::default()
    };

    for (index, raw) in source.lines().enumerate() {
        compiler.current_line = index as u32;
        let wrap = |e: CompileError| e.at_line(index as u32 + 1, raw);
        let line = decomment(raw).map_err(wrap)?;
        if line.is_empty() {
            continue;
        }
        compiler.process_line(&line).map_err(wrap)?;
    }
    compiler.scope_exit();
    compiler.resolve_fixups(source)?;

    debug_assert_eq!(compiler.ops.len(), compiler.param_offsets.len());
    debug_assert_eq!(compiler.ops.len(), compiler.source_lines.len());
    debug_assert_eq!(compiler.ops.len(), compiler.function_indices.len());

    Ok(Program {
        ops: compiler.ops,
        param_offsets: compiler.param_offsets,
        source_lines: compiler.source_lines,
        function_indices: compiler.function_indices,
        params: compiler.params,
        function_names: compiler.function_names,
        source: source.to_string(),
    })
}

impl Compiler {
    /// Appends an instruction, recording its parameter offset, source line,
    /// and enclosing function.
    fn emit(&mut self, opcode: Opcode) {
        self.ops.push(opcode);
        self.param_offsets.push(self.params.len() as u32);
        self.source_lines.push(self.current_line);
        self.function_indices.push(self.current_function);
    }

    /// Closes the current scope with its synthetic terminator.
    fn scope_exit(&mut self) {
        // Running off the outer scope finishes the program; running off a
        // function body is a fault, forcing an explicit return.
        self.emit(if self.current_function == 0 {
            Opcode::Exit
        } else {
            Opcode::Unreachable
        });
    }

    fn scope_name(&self) -> &str {
        &self.function_names[self.current_function as usize]
    }

    fn define_label(&mut self, scope: String, name: String, target: u32) -> Result<(), CompileError> {
        let display = name.clone();
        if self.labels.insert((scope, name), target).is_some() {
            return Err(CompileError::DuplicateLabel(display));
        }
        Ok(())
    }

    fn process_line(&mut self, line: &str) -> Result<(), CompileError> {
        let mut cur = LineCursor::new(line);
        let Some(mnemonic) = cur.next() else {
            return Ok(());
        };

        match mnemonic {
            "label" => {
                let name = cur.expect("label name")?;
                validate_name(name)?;
                let target = self.ops.len() as u32;
                self.define_label(self.scope_name().to_string(), name.to_string(), target)?;
            }
            "function" => {
                let name = cur.expect("function name")?;
                validate_name(name)?;
                if self.function_names.iter().any(|f| f == name) {
                    return Err(CompileError::DuplicateFunction(name.to_string()));
                }
                self.scope_exit();
                self.current_function = self.function_names.len() as u32;
                self.function_names.push(name.to_string());
                let entry = self.ops.len() as u32;
                self.define_label(name.to_string(), name.to_string(), entry)?;
            }
            "load" => {
                let dst = parse_register(cur.expect("register")?)?;
                let s = parse_structure(cur.expect("structure")?)?;
                match s.family {
                    Family::Stack => self.emit_struct(Opcode::SLoad, &[dst, s.index], &s)?,
                    Family::Queue => self.emit_struct(Opcode::QLoad, &[dst, s.index], &s)?,
                    Family::Tape => self.emit_struct(Opcode::TLoad, &[dst, s.index], &s)?,
                    Family::Memory => {
                        self.emit(Opcode::MLoad);
                        self.params.extend([dst, s.index]);
                        self.params
                            .extend(s.address.unwrap_or(0).to_le_bytes());
                    }
                }
            }
            "store" => {
                let s = parse_structure(cur.expect("structure")?)?;
                let src = parse_register(cur.expect("register")?)?;
                match s.family {
                    Family::Stack => self.emit_struct(Opcode::SStore, &[s.index, src], &s)?,
                    Family::Queue => self.emit_struct(Opcode::QStore, &[s.index, src], &s)?,
                    Family::Tape => self.emit_struct(Opcode::TStore, &[s.index, src], &s)?,
                    Family::Memory => {
                        self.emit(Opcode::MStore);
                        self.params.push(s.index);
                        self.params
                            .extend(s.address.unwrap_or(0).to_le_bytes());
                        self.params.push(src);
                    }
                }
            }
            "indload" => {
                let dst = parse_register(cur.expect("register")?)?;
                let s = required_family(&mut cur, "indload", Family::Memory, "memory")?;
                self.emit(Opcode::IndLoad);
                self.params.extend([dst, s.index]);
            }
            "indstore" => {
                let s = required_family(&mut cur, "indstore", Family::Memory, "memory")?;
                let src = parse_register(cur.expect("register")?)?;
                self.emit(Opcode::IndStore);
                self.params.extend([s.index, src]);
            }
            "pop" => {
                let dst = parse_register(cur.expect("register")?)?;
                let s = required_family(&mut cur, "pop", Family::Stack, "stack")?;
                self.emit(Opcode::Pop);
                self.params.extend([dst, s.index]);
            }
            "push" => {
                let s = required_family(&mut cur, "push", Family::Stack, "stack")?;
                let src = parse_register(cur.expect("register")?)?;
                self.emit(Opcode::Push);
                self.params.extend([s.index, src]);
            }
            "dequeue" => {
                let dst = parse_register(cur.expect("register")?)?;
                let s = required_family(&mut cur, "dequeue", Family::Queue, "queue")?;
                self.emit(Opcode::Dequeue);
                self.params.extend([dst, s.index]);
            }
            "enqueue" => {
                let s = required_family(&mut cur, "enqueue", Family::Queue, "queue")?;
                let src = parse_register(cur.expect("register")?)?;
                self.emit(Opcode::Enqueue);
                self.params.extend([s.index, src]);
            }
            "left" | "right" | "center" => {
                let (opcode, name) = match mnemonic {
                    "left" => (Opcode::Left, "left"),
                    "right" => (Opcode::Right, "right"),
                    _ => (Opcode::Center, "center"),
                };
                let s = required_family(&mut cur, name, Family::Tape, "tape")?;
                self.emit(opcode);
                self.params.push(s.index);
            }
            "swap" => {
                let a = no_address(parse_structure(cur.expect("structure")?)?)?;
                let b = no_address(parse_structure(cur.expect("structure")?)?)?;
                if a.family != b.family {
                    return Err(CompileError::MixedFamilies { mnemonic: "swap" });
                }
                self.emit(match a.family {
                    Family::Stack => Opcode::SSwap,
                    Family::Queue => Opcode::QSwap,
                    Family::Tape => Opcode::TSwap,
                    Family::Memory => Opcode::MSwap,
                });
                self.params.extend([a.index, b.index]);
            }
            "indswap" => {
                let a = no_address(parse_structure(cur.expect("structure")?)?)?;
                let b = no_address(parse_structure(cur.expect("structure")?)?)?;
                if a.family != b.family {
                    return Err(CompileError::MixedFamilies { mnemonic: "indswap" });
                }
                if a.index != 0 || b.index != 0 {
                    return Err(CompileError::RequiresInstanceA { mnemonic: "indswap" });
                }
                self.emit(match a.family {
                    Family::Stack => Opcode::IndSSwap,
                    Family::Queue => Opcode::IndQSwap,
                    Family::Tape => Opcode::IndTSwap,
                    Family::Memory => Opcode::IndMSwap,
                });
            }
            "stat" => {
                let s = no_address(parse_structure(cur.expect("structure")?)?)?;
                self.emit(match s.family {
                    Family::Stack => Opcode::SStat,
                    Family::Queue => Opcode::QStat,
                    Family::Tape => Opcode::TStat,
                    Family::Memory => Opcode::MStat,
                });
                self.params.push(s.index);
            }
            "indstat" => {
                let s = no_address(parse_structure(cur.expect("structure")?)?)?;
                if s.index != 0 {
                    return Err(CompileError::RequiresInstanceA { mnemonic: "indstat" });
                }
                self.emit(match s.family {
                    Family::Stack => Opcode::IndSStat,
                    Family::Queue => Opcode::IndQStat,
                    Family::Tape => Opcode::IndTStat,
                    Family::Memory => Opcode::IndMStat,
                });
            }
            _ => {
                let info = lookup_mnemonic(mnemonic)
                    .ok_or_else(|| CompileError::UnknownInstruction(mnemonic.to_string()))?;
                self.emit(info.opcode);
                for kind in info.operands {
                    self.encode_operand(*kind, &mut cur)?;
                }
            }
        }

        if !cur.is_empty() {
            return Err(CompileError::SuperfluousArgument);
        }
        Ok(())
    }

    /// Encodes one schema-driven operand of a mnemonic-matched instruction.
    fn encode_operand(
        &mut self,
        kind: OperandKind,
        cur: &mut LineCursor<'_>,
    ) -> Result<(), CompileError> {
        match kind {
            OperandKind::Reg => {
                let r = parse_register(cur.expect("register")?)?;
                self.params.push(r);
            }
            OperandKind::ImmU32 => {
                let v = parse_u32(cur.expect("value")?)?;
                self.params.extend(v.to_le_bytes());
            }
            OperandKind::ImmI32 => {
                let v = parse_i32(cur.expect("value")?)?;
                self.params.extend(v.to_le_bytes());
            }
            OperandKind::ImmF32 => {
                let v = parse_f32(cur.expect("value")?)?;
                self.params.extend(v.to_le_bytes());
            }
            OperandKind::Flag => {
                let v = parse_flag(cur.expect("flag")?)?;
                self.params.push(v as u8);
            }
            OperandKind::Label => {
                let name = cur.expect("label")?;
                validate_name(name)?;
                self.add_fixup(self.scope_name().to_string(), name);
            }
            OperandKind::Func => {
                let name = cur.expect("function")?;
                validate_name(name)?;
                self.add_fixup(name.to_string(), name);
            }
            // Structure operands are assembled through their own grammar and
            // never appear in a mnemonic-matched schema.
            OperandKind::Idx | OperandKind::Addr => {
                unreachable!("structure operand in a direct schema")
            }
        }
        Ok(())
    }

    /// Writes a u32 placeholder and records the fixup to patch it.
    fn add_fixup(&mut self, scope: String, name: &str) {
        self.fixups.push(Fixup {
            scope,
            name: name.to_string(),
            offset: self.params.len(),
            line: self.current_line,
        });
        self.params.extend(0u32.to_le_bytes());
    }

    /// Emits a non-memory structure access: fixed params, no address allowed.
    fn emit_struct(
        &mut self,
        opcode: Opcode,
        params: &[u8],
        s: &StructureRef,
    ) -> Result<(), CompileError> {
        if s.address.is_some() {
            return Err(CompileError::ForbiddenAddress);
        }
        self.emit(opcode);
        self.params.extend_from_slice(params);
        Ok(())
    }

    /// Patches every recorded placeholder with its resolved target.
    fn resolve_fixups(&mut self, source: &str) -> Result<(), CompileError> {
        for fixup in &self.fixups {
            let key = (fixup.scope.clone(), fixup.name.clone());
            let Some(&target) = self.labels.get(&key) else {
                let text = source.lines().nth(fixup.line as usize).unwrap_or("");
                return Err(
                    CompileError::LabelNotFound(fixup.name.clone()).at_line(fixup.line + 1, text)
                );
            };
            self.params[fixup.offset..fixup.offset + 4].copy_from_slice(&target.to_le_bytes());
        }
        Ok(())
    }
}
