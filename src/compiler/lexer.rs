//! Line validation and token parsing.
//!
//! A source line is validated and normalized before instruction parsing:
//! the `#` comment is stripped, the character whitelist is enforced (the
//! comment side accepts a few extra punctuation characters), tabs become
//! spaces, and space runs collapse.

use crate::cpu::structures::Family;
use crate::errors::CompileError;

/// Characters permitted in code, besides ASCII alphanumerics.
const CODE_CHARS: &[char] = &[' ', '\t', '-', '+', '.', '_', '@', '#'];

/// Additional characters permitted after the comment marker.
const COMMENT_CHARS: &[char] = &[
    '*', '/', ',', '(', ')', '<', '>', '=', '?', '!', ':', ';',
];

/// Strips the comment and normalizes whitespace.
///
/// Returns the code portion of the line, trimmed, with tabs converted to
/// spaces and space runs collapsed. Returns an empty string for blank and
/// comment-only lines. The whole line (comment included) is validated
/// against the character whitelist.
pub(crate) fn decomment(line: &str) -> Result<String, CompileError> {
    let comment_start = line.find('#').unwrap_or(line.len());
    for (pos, c) in line.char_indices() {
        if c.is_ascii_alphanumeric() || CODE_CHARS.contains(&c) {
            continue;
        }
        if pos >= comment_start && COMMENT_CHARS.contains(&c) {
            continue;
        }
        return Err(CompileError::InvalidCharacter);
    }
    let mut code = line[..comment_start].replace('\t', " ");
    while code.contains("  ") {
        code = code.replace("  ", " ");
    }
    Ok(code.trim().to_string())
}

/// Whitespace-token cursor over one normalized line.
///
/// Mirrors the consume-as-you-parse discipline of the encoder: each operand
/// parser takes the next token, and whatever remains afterwards is a
/// superfluous-argument error.
pub(crate) struct LineCursor<'a> {
    rest: &'a str,
}

impl<'a> LineCursor<'a> {
    pub(crate) fn new(line: &'a str) -> Self {
        Self { rest: line }
    }

    /// Takes the next token, or `None` at end of line.
    pub(crate) fn next(&mut self) -> Option<&'a str> {
        let rest = self.rest.trim_start();
        if rest.is_empty() {
            self.rest = rest;
            return None;
        }
        match rest.split_once(' ') {
            Some((tok, tail)) => {
                self.rest = tail;
                Some(tok)
            }
            None => {
                self.rest = "";
                Some(rest)
            }
        }
    }

    /// Takes the next token, failing with a missing-parameter error naming
    /// what the instruction expected.
    pub(crate) fn expect(&mut self, what: &'static str) -> Result<&'a str, CompileError> {
        self.next().ok_or(CompileError::MissingParameter { what })
    }

    /// True when every token has been consumed.
    pub(crate) fn is_empty(&self) -> bool {
        self.rest.trim_start().is_empty()
    }
}

/// Parses a register token: one letter, `A..Z` explicit, `a..z` implicit.
pub(crate) fn parse_register(tok: &str) -> Result<u8, CompileError> {
    let mut chars = tok.chars();
    let (Some(c), None) = (chars.next(), chars.next()) else {
        return Err(CompileError::InvalidRegister(tok.to_string()));
    };
    match c {
        'A'..='Z' => Ok(c as u8 - b'A'),
        'a'..='z' => Ok(26 + (c as u8 - b'a')),
        _ => Err(CompileError::InvalidRegister(tok.to_string())),
    }
}

/// A parsed structure token `TyI[@addr]`.
pub(crate) struct StructureRef {
    pub family: Family,
    pub index: u8,
    pub address: Option<u32>,
}

/// Parses a structure token like `SA`, `TB`, or `MA@42`.
pub(crate) fn parse_structure(tok: &str) -> Result<StructureRef, CompileError> {
    let (name, address) = match tok.split_once('@') {
        Some((name, addr)) => (name, Some(parse_u32(addr)?)),
        None => (tok, None),
    };
    let bytes = name.as_bytes();
    if bytes.len() != 2 {
        return Err(CompileError::InvalidStructure(tok.to_string()));
    }
    let family = Family::from_letter(bytes[0] as char)
        .ok_or_else(|| CompileError::InvalidStructure(tok.to_string()))?;
    if !bytes[1].is_ascii_uppercase() {
        return Err(CompileError::InvalidStructure(tok.to_string()));
    }
    Ok(StructureRef {
        family,
        index: bytes[1] - b'A',
        address,
    })
}

/// Validates a function or label name: 3..=20 ASCII alphanumerics, starting
/// with a capital letter.
pub(crate) fn validate_name(name: &str) -> Result<(), CompileError> {
    let len = name.chars().count();
    if !(3..=20).contains(&len)
        || !name.chars().all(|c| c.is_ascii_alphanumeric())
        || !name.starts_with(|c: char| c.is_ascii_uppercase())
    {
        return Err(CompileError::InvalidName(name.to_string()));
    }
    Ok(())
}

pub(crate) fn parse_u32(tok: &str) -> Result<u32, CompileError> {
    tok.parse().map_err(|_| CompileError::InvalidLiteral {
        expected: "u32",
        text: tok.to_string(),
    })
}

pub(crate) fn parse_i32(tok: &str) -> Result<i32, CompileError> {
    tok.parse().map_err(|_| CompileError::InvalidLiteral {
        expected: "i32",
        text: tok.to_string(),
    })
}

pub(crate) fn parse_f32(tok: &str) -> Result<f32, CompileError> {
    tok.parse().map_err(|_| CompileError::InvalidLiteral {
        expected: "f32",
        text: tok.to_string(),
    })
}

pub(crate) fn parse_flag(tok: &str) -> Result<bool, CompileError> {
    match tok {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(CompileError::InvalidLiteral {
            expected: "bool",
            text: tok.to_string(),
        }),
    }
}
