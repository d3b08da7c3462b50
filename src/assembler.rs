//! Two pass assembler for the 8080 mnemonics.
//!
//! Supported: every mnemonic in the opcode table, `label:`, `NAME EQU value`,
//! `ORG`, `DB`, `DW`, `DS`, `END` and `;` comments. Operands are decimal,
//! `0x..`, `..H`, `..B`, `'c'`, symbols and `$`, combined with `+` and `-`.
//! Errors are collected per line and never stop the remaining lines from
//! being processed.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::opcodes::{OpcodeInfo, OPCODE_TABLE};

pub const DEFAULT_ORIGIN: u16 = 0x0100;

const REGISTERS: [&str; 10] = ["A", "B", "C", "D", "E", "H", "L", "M", "SP", "PSW"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssemblerError {
    #[error("unknown mnemonic {0}")]
    UnknownMnemonic(String),
    #[error("invalid operands for {0}")]
    InvalidOperands(String),
    #[error("missing operand for {0}")]
    MissingOperand(String),
    #[error("malformed number {0}")]
    MalformedNumber(String),
    #[error("undefined symbol {0}")]
    UndefinedSymbol(String),
    #[error("duplicate label {0}")]
    DuplicateLabel(String),
    #[error("invalid label {0}")]
    InvalidLabel(String),
    #[error("EQU needs a label")]
    MissingLabel,
    #[error("value {value} does not fit in {bits} bits")]
    OutOfRange { value: i64, bits: u8 },
    #[error("unterminated string")]
    UnterminatedString,
    #[error("ORG {0:04X}H is below the current address")]
    OrgBackwards(u16),
    #[error("program runs past the end of memory")]
    AddressOverflow,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub line: usize,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Assembly {
    pub origin: u16,
    /// Image starting at `origin`; empty when there are diagnostics
    pub bytes: Vec<u8>,
    pub symbols: BTreeMap<String, u16>,
    pub diagnostics: Vec<Diagnostic>,
}

impl Assembly {
    pub fn is_ok(&self) -> bool {
        self.diagnostics.is_empty()
    }
}

pub fn assemble(source: &str) -> Assembly {
    assemble_at(source, DEFAULT_ORIGIN)
}

/// Assemble with `origin` as the address used until the first `ORG`.
pub fn assemble_at(source: &str, origin: u16) -> Assembly {
    let mut assembler = Assembler::new(origin);

    let mut statements = Vec::new();
    for (index, text) in source.lines().enumerate() {
        let line = index + 1;
        match parse_line(text) {
            Ok(Some(statement)) => {
                let end = statement.mnemonic.as_deref() == Some("END");
                statements.push((line, statement));
                if end {
                    break;
                }
            }
            Ok(None) => {}
            Err(err) => assembler.report(line, err),
        }
    }

    assembler.run_pass(&statements, false);
    assembler.run_pass(&statements, true);
    assembler.finish()
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Statement {
    label: Option<String>,
    mnemonic: Option<String>,
    operands: Vec<String>,
}

struct Assembler {
    start: u16,
    origin: u16,
    address: u32,
    statement_address: u16,
    bytes: Vec<u8>,
    symbols: BTreeMap<String, u16>,
    diagnostics: Vec<Diagnostic>,
    failed_lines: HashSet<usize>,
}

impl Assembler {
    fn new(origin: u16) -> Self {
        Assembler {
            start: origin,
            origin,
            address: origin as u32,
            statement_address: origin,
            bytes: Vec::new(),
            symbols: BTreeMap::new(),
            diagnostics: Vec::new(),
            failed_lines: HashSet::new(),
        }
    }

    fn report(&mut self, line: usize, err: AssemblerError) {
        self.failed_lines.insert(line);
        self.diagnostics.push(Diagnostic {
            line,
            message: err.to_string(),
        });
    }

    // The first pass only sizes statements and defines symbols; the second
    // emits bytes. Lines that failed in the first pass are not retried.
    fn run_pass(&mut self, statements: &[(usize, Statement)], emit: bool) {
        self.origin = self.start;
        self.address = self.start as u32;
        self.bytes.clear();

        for (line, statement) in statements {
            if emit && self.failed_lines.contains(line) {
                continue;
            }
            self.statement_address = self.address as u16;
            if let Err(err) = self.statement(statement, emit) {
                self.report(*line, err);
            }
        }
    }

    fn finish(mut self) -> Assembly {
        self.diagnostics.sort_by_key(|diagnostic| diagnostic.line);

        if self.diagnostics.is_empty() {
            info!("assembled {} bytes at {:04X}H, {} symbols", self.bytes.len(), self.origin, self.symbols.len());
        } else {
            warn!("assembly failed with {} errors", self.diagnostics.len());
            self.bytes.clear();
        }

        Assembly {
            origin: self.origin,
            bytes: self.bytes,
            symbols: self.symbols,
            diagnostics: self.diagnostics,
        }
    }

    fn statement(&mut self, statement: &Statement, emit: bool) -> Result<(), AssemblerError> {
        let mnemonic = statement.mnemonic.as_deref();

        if let Some(label) = &statement.label {
            if !emit && mnemonic != Some("EQU") {
                self.define(label, self.address as u16)?;
            }
        }

        let Some(mnemonic) = mnemonic else {
            return Ok(());
        };
        let operands = &statement.operands;

        match mnemonic {
            "END" => Ok(()),
            "EQU" => {
                let label = statement.label.as_ref().ok_or(AssemblerError::MissingLabel)?;
                if !emit {
                    let value = self.word_value(single_operand(mnemonic, operands)?)?;
                    self.define(label, value)?;
                }
                Ok(())
            }
            "ORG" => {
                let value = self.word_value(single_operand(mnemonic, operands)?)?;
                self.org(value)
            }
            "DB" => {
                if operands.is_empty() {
                    return Err(AssemblerError::MissingOperand(mnemonic.to_string()));
                }
                for operand in operands {
                    match string_literal(operand)? {
                        Some(text) => self.emit(text.as_bytes(), emit)?,
                        None => {
                            let value = if emit { self.byte_value(operand)? } else { 0 };
                            self.emit(&[value], emit)?;
                        }
                    }
                }
                Ok(())
            }
            "DW" => {
                if operands.is_empty() {
                    return Err(AssemblerError::MissingOperand(mnemonic.to_string()));
                }
                for operand in operands {
                    let value = if emit { self.word_value(operand)? } else { 0 };
                    self.emit(&value.to_le_bytes(), emit)?;
                }
                Ok(())
            }
            "DS" => {
                let count = self.word_value(single_operand(mnemonic, operands)?)?;
                self.emit(&vec![0; count as usize], emit)
            }
            _ => self.instruction(mnemonic, operands, emit),
        }
    }

    fn define(&mut self, label: &str, value: u16) -> Result<(), AssemblerError> {
        if self.symbols.contains_key(label) {
            return Err(AssemblerError::DuplicateLabel(label.to_string()));
        }
        self.symbols.insert(label.to_string(), value);
        Ok(())
    }

    fn org(&mut self, value: u16) -> Result<(), AssemblerError> {
        let emitted = self.address - self.origin as u32;
        if emitted == 0 {
            self.origin = value;
            self.address = value as u32;
            return Ok(());
        }
        if (value as u32) < self.address {
            return Err(AssemblerError::OrgBackwards(value));
        }
        let gap = value as u32 - self.address;
        self.emit(&vec![0; gap as usize], true)
    }

    fn emit(&mut self, bytes: &[u8], write: bool) -> Result<(), AssemblerError> {
        let end = self.address + bytes.len() as u32;
        if end > 0x10000 {
            return Err(AssemblerError::AddressOverflow);
        }
        if write {
            self.bytes.extend_from_slice(bytes);
        }
        self.address = end;
        Ok(())
    }

    fn instruction(&mut self, mnemonic: &str, operands: &[String], emit: bool) -> Result<(), AssemblerError> {
        let candidates: Vec<(u8, &OpcodeInfo)> = OPCODE_TABLE
            .iter()
            .enumerate()
            .filter(|(_, info)| info.is_defined() && info.mnemonic == mnemonic)
            .map(|(opcode, info)| (opcode as u8, info))
            .collect();

        let Some((_, first)) = candidates.first() else {
            return Err(AssemblerError::UnknownMnemonic(mnemonic.to_string()));
        };

        if !emit {
            let size = first.size as usize;
            return self.emit(&vec![0; size], false);
        }

        for (opcode, info) in candidates {
            if let Some(encoded) = self.encode(opcode, info, operands)? {
                return self.emit(&encoded, true);
            }
        }
        Err(AssemblerError::InvalidOperands(mnemonic.to_string()))
    }

    /// Encode against one table entry, `None` when the operands do not fit
    /// its template.
    fn encode(&self, opcode: u8, info: &OpcodeInfo, operands: &[String]) -> Result<Option<Vec<u8>>, AssemblerError> {
        let template: Vec<&str> = if info.operands.is_empty() {
            Vec::new()
        } else {
            info.operands.split(',').collect()
        };
        if template.len() != operands.len() {
            return Ok(None);
        }

        let mut encoded = vec![opcode];
        for (slot, operand) in template.iter().zip(operands) {
            match *slot {
                "d8" | "d16" | "a16" if is_register(operand) => return Ok(None),
                "d8" => encoded.push(self.byte_value(operand)?),
                "d16" | "a16" => encoded.extend_from_slice(&self.word_value(operand)?.to_le_bytes()),
                vector if vector.chars().all(|c| c.is_ascii_digit()) => {
                    // RST vector
                    if is_register(operand) || self.eval(operand)?.to_string() != vector {
                        return Ok(None);
                    }
                }
                register => {
                    if !operand.eq_ignore_ascii_case(register) {
                        return Ok(None);
                    }
                }
            }
        }
        Ok(Some(encoded))
    }

    fn byte_value(&self, expr: &str) -> Result<u8, AssemblerError> {
        let value = self.eval(expr)?;
        if !(-128..=255).contains(&value) {
            return Err(AssemblerError::OutOfRange { value, bits: 8 });
        }
        Ok((value & 0xFF) as u8)
    }

    fn word_value(&self, expr: &str) -> Result<u16, AssemblerError> {
        let value = self.eval(expr)?;
        if !(-32768..=65535).contains(&value) {
            return Err(AssemblerError::OutOfRange { value, bits: 16 });
        }
        Ok((value & 0xFFFF) as u16)
    }

    /// Evaluate `term (+|- term)*`.
    fn eval(&self, expr: &str) -> Result<i64, AssemblerError> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err(AssemblerError::MalformedNumber(expr.to_string()));
        }

        let mut total: i64 = 0;
        for (negative, term) in split_terms(expr)? {
            let value = self.term(term.trim())?;
            let sum = if negative { total.checked_sub(value) } else { total.checked_add(value) };
            total = sum.ok_or_else(|| AssemblerError::MalformedNumber(expr.to_string()))?;
        }
        Ok(total)
    }

    fn term(&self, term: &str) -> Result<i64, AssemblerError> {
        if term.is_empty() {
            return Err(AssemblerError::MalformedNumber(term.to_string()));
        }
        if term == "$" {
            return Ok(self.statement_address as i64);
        }
        if term.starts_with('\'') || term.starts_with('"') {
            return match string_literal(term)? {
                Some(text) if text.len() == 1 => Ok(text.as_bytes()[0] as i64),
                _ => Err(AssemblerError::MalformedNumber(term.to_string())),
            };
        }
        if term.starts_with(|c: char| c.is_ascii_digit()) {
            return parse_number(term);
        }

        let name = term.to_ascii_uppercase();
        self.symbols
            .get(&name)
            .map(|&value| value as i64)
            .ok_or(AssemblerError::UndefinedSymbol(name))
    }
}

fn parse_number(text: &str) -> Result<i64, AssemblerError> {
    let upper = text.to_ascii_uppercase();
    let parsed = if let Some(hex) = upper.strip_prefix("0X") {
        i64::from_str_radix(hex, 16)
    } else if let Some(hex) = upper.strip_suffix('H') {
        i64::from_str_radix(hex, 16)
    } else if let Some(binary) = upper.strip_suffix('B') {
        i64::from_str_radix(binary, 2)
    } else if let Some(decimal) = upper.strip_suffix('D') {
        decimal.parse::<i64>()
    } else {
        upper.parse::<i64>()
    };

    match parsed {
        Ok(value) if upper.chars().all(|c| c.is_ascii_alphanumeric()) => Ok(value),
        _ => Err(AssemblerError::MalformedNumber(text.to_string())),
    }
}

fn is_register(operand: &str) -> bool {
    REGISTERS.iter().any(|register| operand.eq_ignore_ascii_case(register))
}

fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '?' || c == '@' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '?' || c == '@')
}

fn single_operand<'a>(mnemonic: &str, operands: &'a [String]) -> Result<&'a str, AssemblerError> {
    match operands {
        [operand] => Ok(operand.as_str()),
        [] => Err(AssemblerError::MissingOperand(mnemonic.to_string())),
        _ => Err(AssemblerError::InvalidOperands(mnemonic.to_string())),
    }
}

/// Contents of a quoted operand, `None` when the operand is not a single
/// quoted string (`'A'+1` is an expression).
fn string_literal(operand: &str) -> Result<Option<String>, AssemblerError> {
    let Some(quote) = operand.chars().next().filter(|c| *c == '\'' || *c == '"') else {
        return Ok(None);
    };
    match operand[1..].find(quote) {
        None => Err(AssemblerError::UnterminatedString),
        Some(end) if end + 2 == operand.len() => Ok(Some(operand[1..end + 1].to_string())),
        Some(_) => Ok(None),
    }
}

/// Split an expression into signed terms, ignoring operators inside quotes.
fn split_terms(expr: &str) -> Result<Vec<(bool, &str)>, AssemblerError> {
    let mut terms = Vec::new();
    let mut quote: Option<char> = None;
    let mut start = 0;
    let mut negative = false;

    for (index, c) in expr.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' => quote = Some(c),
            None if c == '+' || c == '-' => {
                let term = &expr[start..index];
                if term.trim().is_empty() {
                    // Leading sign
                    if index != 0 && !terms.is_empty() {
                        return Err(AssemblerError::MalformedNumber(expr.to_string()));
                    }
                } else {
                    terms.push((negative, term));
                }
                negative = c == '-';
                start = index + 1;
            }
            None => {}
        }
    }
    if quote.is_some() {
        return Err(AssemblerError::UnterminatedString);
    }
    terms.push((negative, &expr[start..]));
    Ok(terms)
}

fn strip_comment(text: &str) -> &str {
    let mut quote: Option<char> = None;
    for (index, c) in text.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' => quote = Some(c),
            None if c == ';' => return &text[..index],
            None => {}
        }
    }
    text
}

fn split_operands(text: &str) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    let mut operands = Vec::new();
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (index, c) in text.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' => quote = Some(c),
            None if c == ',' => {
                operands.push(text[start..index].trim().to_string());
                start = index + 1;
            }
            None => {}
        }
    }
    operands.push(text[start..].trim().to_string());
    operands
}

fn split_word(text: &str) -> (&str, &str) {
    let text = text.trim_start();
    match text.find(char::is_whitespace) {
        Some(index) => (&text[..index], &text[index..]),
        None => (text, ""),
    }
}

fn parse_line(text: &str) -> Result<Option<Statement>, AssemblerError> {
    let text = strip_comment(text).trim();
    if text.is_empty() {
        return Ok(None);
    }

    let mut statement = Statement::default();
    let mut rest = text;

    // label: ...
    if let Some(index) = text.find(':') {
        let candidate = &text[..index];
        if !candidate.contains(char::is_whitespace) && !candidate.contains(['\'', '"']) {
            if !is_identifier(candidate) {
                return Err(AssemblerError::InvalidLabel(candidate.to_string()));
            }
            statement.label = Some(candidate.to_ascii_uppercase());
            rest = &text[index + 1..];
        }
    }

    let (first, after) = split_word(rest);
    if first.is_empty() {
        return Ok(Some(statement));
    }

    // NAME EQU value
    let (second, after_second) = split_word(after);
    if statement.label.is_none() && second.eq_ignore_ascii_case("EQU") {
        if !is_identifier(first) {
            return Err(AssemblerError::InvalidLabel(first.to_string()));
        }
        statement.label = Some(first.to_ascii_uppercase());
        statement.mnemonic = Some("EQU".to_string());
        statement.operands = split_operands(after_second);
        return Ok(Some(statement));
    }

    statement.mnemonic = Some(first.to_ascii_uppercase());
    statement.operands = split_operands(after);
    Ok(Some(statement))
}
