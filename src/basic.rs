//! Line-numbered BASIC started by `BASIC`.
//!
//! Like the editor, the interpreter is fed one console line at a time.
//! Numbered lines are stored, anything else is a direct command. A running
//! program that reaches `INPUT` parks itself until the next line arrives,
//! and every call executes at most `budget` statements so a runaway loop
//! cannot hold the session.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use thiserror::Error;
use tracing::{debug, info};

use crate::bdos::{Bdos, Console};
use crate::editor::split_lines;

const PROMPT: &[u8] = b"] ";
const PRINT_ZONE: usize = 14;
const EOF_MARK: u8 = 0x1A;

const HELP: &str = "\
Commands:\r
  NEW         - Clear program\r
  LIST [n-m]  - List program\r
  RUN         - Run program\r
  CLR         - Clear variables\r
  SAVE file   - Save program\r
  LOAD file   - Load program\r
  QUIT        - Exit BASIC\r
\r
Statements:\r
  PRINT       - Print value\r
  LET         - Assign variable\r
  INPUT       - Get input\r
  IF...THEN   - Conditional\r
  GOTO        - Jump to line\r
  GOSUB/RETURN- Subroutine\r
  FOR...NEXT  - Loop\r
  END/STOP    - End program\r
";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BasicError {
    #[error("SYNTAX ERROR")]
    Syntax,
    #[error("TYPE MISMATCH")]
    TypeMismatch,
    #[error("DIVISION BY ZERO")]
    DivisionByZero,
    #[error("UNDEFINED LINE {0}")]
    UndefinedLine(u32),
    #[error("RETURN WITHOUT GOSUB")]
    ReturnWithoutGosub,
    #[error("NEXT WITHOUT FOR")]
    NextWithoutFor,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(f64),
    Text(String),
}

impl Value {
    fn number(&self) -> Result<f64, BasicError> {
        match self {
            Value::Number(n) => Ok(*n),
            Value::Text(_) => Err(BasicError::TypeMismatch),
        }
    }

    fn is_true(&self) -> bool {
        match self {
            Value::Number(n) => *n != 0.0,
            Value::Text(text) => !text.is_empty(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{}", n),
            Value::Text(text) => f.write_str(text),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BasicStatus {
    /// At the `]` prompt
    Ready,
    /// A running program is waiting in `INPUT`
    AwaitingInput,
    Quit,
}

enum Flow {
    Next,
    Jump(usize),
    End,
    Input(String),
}

#[derive(Debug, Clone, PartialEq)]
struct ForFrame {
    variable: String,
    end: f64,
    step: f64,
    /// Index of the line after the FOR
    body: usize,
}

#[derive(Debug, Clone, PartialEq)]
struct RunState {
    lines: Vec<(u32, String)>,
    index: usize,
    gosub: Vec<usize>,
    loops: Vec<ForFrame>,
    /// Variable the pending INPUT assigns
    input: Option<String>,
}

impl RunState {
    fn find(&self, number: u32) -> Result<usize, BasicError> {
        self.lines
            .binary_search_by_key(&number, |(line, _)| *line)
            .map_err(|_| BasicError::UndefinedLine(number))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Basic {
    program: BTreeMap<u32, String>,
    variables: HashMap<String, Value>,
    run: Option<RunState>,
}

impl Basic {
    /// A fresh interpreter; prints the banner and the first prompt.
    pub fn start(console: &mut dyn Console) -> Self {
        print_line(console, "BASIC Interpreter v1.0");
        print_line(console, "Type LIST to list program, RUN to execute");
        print_line(console, "");
        console.put_str(PROMPT);
        Basic::default()
    }

    pub fn program(&self) -> &BTreeMap<u32, String> {
        &self.program
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(&name.to_ascii_uppercase())
    }

    pub fn is_running(&self) -> bool {
        self.run.is_some()
    }

    /// Handle one line of input. `budget` caps the statements a program
    /// may execute before this call returns.
    pub fn handle_line(&mut self, line: &str, bdos: &mut Bdos, console: &mut dyn Console, budget: u64) -> BasicStatus {
        if let Some(variable) = self.run.as_mut().and_then(|run| run.input.take()) {
            if let Err(err) = self.assign_input(&variable, line) {
                debug!("input for {} rejected: {}", variable, err);
                print_line(console, "?REDO FROM START");
                console.put_str(b"? ");
                if let Some(run) = self.run.as_mut() {
                    run.input = Some(variable);
                }
                return BasicStatus::AwaitingInput;
            }
            return self.resume(console, budget);
        }

        let line = line.trim();
        if line.starts_with(|c: char| c.is_ascii_digit()) {
            if self.store_line(line).is_err() {
                print_line(console, "?SYNTAX ERROR");
            }
        } else if !line.is_empty() {
            let (command, args) = match line.split_once(char::is_whitespace) {
                Some((command, args)) => (command, args.trim()),
                None => (line, ""),
            };
            match command.to_ascii_uppercase().as_str() {
                "NEW" => {
                    self.program.clear();
                    self.variables.clear();
                    print_line(console, "Program cleared");
                }
                "LIST" => self.list(args, console),
                "RUN" => return self.run_program(console, budget),
                "CLR" => {
                    self.variables.clear();
                    print_line(console, "Variables cleared");
                }
                "SAVE" => self.save(args, bdos, console),
                "LOAD" => self.load(args, bdos, console),
                "HELP" => console.put_str(HELP.as_bytes()),
                "QUIT" | "EXIT" => return BasicStatus::Quit,
                _ => print_line(console, "?SYNTAX ERROR"),
            }
        }
        console.put_str(PROMPT);
        BasicStatus::Ready
    }

    fn store_line(&mut self, line: &str) -> Result<(), BasicError> {
        let digits = line.find(|c: char| !c.is_ascii_digit()).unwrap_or(line.len());
        let number: u32 = line[..digits].parse().map_err(|_| BasicError::Syntax)?;
        let code = line[digits..].trim();
        if code.is_empty() {
            self.program.remove(&number);
        } else {
            self.program.insert(number, code.to_string());
        }
        Ok(())
    }

    fn list(&self, args: &str, console: &mut dyn Console) {
        let range: Option<(u32, u32)> = match args.split_once('-') {
            Some((from, to)) => from.trim().parse().ok().zip(to.trim().parse().ok()),
            None => args.parse().ok().map(|n| (n, n)),
        };
        let (from, to) = range.unwrap_or((0, u32::MAX));
        for (number, code) in self.program.range(from..=to.max(from)) {
            print_line(console, &format!("{} {}", number, code));
        }
    }

    fn file_name(args: &str) -> String {
        let name = args.trim().trim_matches('"').to_ascii_uppercase();
        if name.contains('.') {
            name
        } else {
            format!("{}.BAS", name)
        }
    }

    fn save(&self, args: &str, bdos: &mut Bdos, console: &mut dyn Console) {
        if args.is_empty() {
            print_line(console, "?SYNTAX ERROR");
            return;
        }
        let name = Self::file_name(args);
        let mut data = Vec::new();
        for (number, code) in &self.program {
            data.extend_from_slice(format!("{} {}\r\n", number, code).as_bytes());
        }
        data.push(EOF_MARK);

        match bdos.current_mut().save_file(&name, data) {
            Ok(()) => {
                info!("saved BASIC program {} ({} lines)", name, self.program.len());
                print_line(console, &format!("Saved {} lines to {}", self.program.len(), name));
            }
            Err(err) => print_line(console, &format!("?{}", err)),
        }
    }

    fn load(&mut self, args: &str, bdos: &Bdos, console: &mut dyn Console) {
        let name = Self::file_name(args);
        let Some(data) = bdos.current().get_file(&name) else {
            print_line(console, "?FILE NOT FOUND");
            return;
        };

        self.program.clear();
        self.variables.clear();
        for line in split_lines(data) {
            let line = line.trim();
            if line.starts_with(|c: char| c.is_ascii_digit()) && self.store_line(line).is_ok() {
                continue;
            }
            if !line.is_empty() {
                debug!("skipping unnumbered line in {}: {:?}", name, line);
            }
        }
        print_line(console, &format!("Loaded {} lines from {}", self.program.len(), name));
    }

    fn run_program(&mut self, console: &mut dyn Console, budget: u64) -> BasicStatus {
        if self.program.is_empty() {
            print_line(console, "No program to run");
            console.put_str(PROMPT);
            return BasicStatus::Ready;
        }

        self.variables.clear();
        self.run = Some(RunState {
            lines: self.program.iter().map(|(n, code)| (*n, code.clone())).collect(),
            index: 0,
            gosub: Vec::new(),
            loops: Vec::new(),
            input: None,
        });
        self.resume(console, budget)
    }

    fn resume(&mut self, console: &mut dyn Console, budget: u64) -> BasicStatus {
        let Some(mut run) = self.run.take() else {
            console.put_str(PROMPT);
            return BasicStatus::Ready;
        };

        let mut executed = 0u64;
        while run.index < run.lines.len() {
            let (number, code) = run.lines[run.index].clone();
            if executed == budget {
                print_line(console, &format!("?BREAK IN {}", number));
                break;
            }
            executed += 1;

            match self.execute(&code, &mut run, console) {
                Ok(Flow::Next) => run.index += 1,
                Ok(Flow::Jump(index)) => run.index = index,
                Ok(Flow::End) => break,
                Ok(Flow::Input(variable)) => {
                    run.index += 1;
                    run.input = Some(variable);
                    self.run = Some(run);
                    return BasicStatus::AwaitingInput;
                }
                Err(err) => {
                    print_line(console, &format!("?{} IN {}", err, number));
                    break;
                }
            }
        }

        debug!("BASIC program stopped after {} statements", executed);
        console.put_str(PROMPT);
        BasicStatus::Ready
    }

    fn execute(&mut self, code: &str, run: &mut RunState, console: &mut dyn Console) -> Result<Flow, BasicError> {
        if code.trim_start().get(..3).is_some_and(|word| word.eq_ignore_ascii_case("REM")) {
            return Ok(Flow::Next);
        }

        let mut parser = Parser::new(code);
        if parser.eat(b'?') {
            return self.print(&mut parser, console);
        }
        let word = parser.identifier().unwrap_or_default();
        let flow = match word.as_str() {
            "" => Flow::Next,
            "PRINT" => return self.print(&mut parser, console),
            "LET" => {
                self.assign(&mut parser)?;
                Flow::Next
            }
            "INPUT" => {
                let mut prompt = String::new();
                if parser.peek() == Some(b'"') {
                    prompt = parser.string()?;
                    if !parser.eat(b';') && !parser.eat(b',') {
                        return Err(BasicError::Syntax);
                    }
                }
                let variable = parser.identifier().ok_or(BasicError::Syntax)?;
                parser.end()?;
                console.put_str(prompt.as_bytes());
                console.put_str(b"? ");
                return Ok(Flow::Input(variable));
            }
            "IF" => {
                let condition = parser.expr(&self.variables)?;
                if !parser.keyword("THEN") {
                    return Err(BasicError::Syntax);
                }
                let branch = parser.rest().trim();
                if !condition.is_true() {
                    return Ok(Flow::Next);
                }
                return match branch.parse::<u32>() {
                    Ok(number) => Ok(Flow::Jump(run.find(number)?)),
                    Err(_) => self.execute(branch, run, console),
                };
            }
            "GOTO" => Flow::Jump(run.find(parser.line_number()?)?),
            "GOSUB" => {
                let target = run.find(parser.line_number()?)?;
                run.gosub.push(run.index + 1);
                Flow::Jump(target)
            }
            "RETURN" => Flow::Jump(run.gosub.pop().ok_or(BasicError::ReturnWithoutGosub)?),
            "FOR" => {
                let variable = parser.identifier().ok_or(BasicError::Syntax)?;
                if !parser.eat(b'=') {
                    return Err(BasicError::Syntax);
                }
                let start = parser.expr(&self.variables)?.number()?;
                if !parser.keyword("TO") {
                    return Err(BasicError::Syntax);
                }
                let end = parser.expr(&self.variables)?.number()?;
                let step = if parser.keyword("STEP") {
                    parser.expr(&self.variables)?.number()?
                } else {
                    1.0
                };
                if variable.ends_with('$') {
                    return Err(BasicError::TypeMismatch);
                }

                // Re-entering a loop drops it and everything nested in it
                if let Some(open) = run.loops.iter().position(|frame| frame.variable == variable) {
                    run.loops.truncate(open);
                }
                self.variables.insert(variable.clone(), Value::Number(start));
                run.loops.push(ForFrame {
                    variable,
                    end,
                    step,
                    body: run.index + 1,
                });
                Flow::Next
            }
            "NEXT" => {
                let open = match parser.identifier() {
                    Some(variable) => run.loops.iter().rposition(|frame| frame.variable == variable),
                    None => run.loops.len().checked_sub(1),
                };
                let open = open.ok_or(BasicError::NextWithoutFor)?;
                run.loops.truncate(open + 1);
                let frame = &run.loops[open];

                let current = self
                    .variables
                    .get(&frame.variable)
                    .map(Value::number)
                    .transpose()?
                    .unwrap_or(0.0);
                let value = current + frame.step;
                self.variables.insert(frame.variable.clone(), Value::Number(value));

                let again = if frame.step < 0.0 { value >= frame.end } else { value <= frame.end };
                if again {
                    Flow::Jump(frame.body)
                } else {
                    run.loops.pop();
                    Flow::Next
                }
            }
            "END" | "STOP" => Flow::End,
            _ => {
                parser = Parser::new(code);
                self.assign(&mut parser)?;
                Flow::Next
            }
        };
        parser.end()?;
        Ok(flow)
    }

    fn print(&mut self, parser: &mut Parser<'_>, console: &mut dyn Console) -> Result<Flow, BasicError> {
        let mut out = String::new();
        let mut newline = true;
        while parser.peek().is_some() {
            let value = parser.expr(&self.variables)?;
            out.push_str(&value.to_string());
            newline = true;
            if parser.eat(b';') {
                newline = false;
            } else if parser.eat(b',') {
                let pad = PRINT_ZONE - out.len() % PRINT_ZONE;
                out.extend(std::iter::repeat(' ').take(pad));
                newline = false;
            } else if parser.peek().is_some() {
                return Err(BasicError::Syntax);
            }
        }

        console.put_str(out.as_bytes());
        if newline {
            console.put_str(b"\r\n");
        }
        Ok(Flow::Next)
    }

    fn assign(&mut self, parser: &mut Parser<'_>) -> Result<(), BasicError> {
        let variable = parser.identifier().ok_or(BasicError::Syntax)?;
        if !parser.eat(b'=') {
            return Err(BasicError::Syntax);
        }
        let value = parser.expr(&self.variables)?;
        if variable.ends_with('$') != matches!(value, Value::Text(_)) {
            return Err(BasicError::TypeMismatch);
        }
        self.variables.insert(variable, value);
        Ok(())
    }

    fn assign_input(&mut self, variable: &str, text: &str) -> Result<(), BasicError> {
        let value = if variable.ends_with('$') {
            Value::Text(text.to_string())
        } else {
            Value::Number(text.trim().parse().map_err(|_| BasicError::TypeMismatch)?)
        };
        self.variables.insert(variable.to_string(), value);
        Ok(())
    }
}

/// Cursor over one statement.
struct Parser<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Parser { text, pos: 0 }
    }

    fn bytes(&self) -> &'a [u8] {
        self.text.as_bytes()
    }

    fn skip_whitespace(&mut self) {
        while self.bytes().get(self.pos).is_some_and(u8::is_ascii_whitespace) {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_whitespace();
        self.bytes().get(self.pos).copied()
    }

    fn eat(&mut self, byte: u8) -> bool {
        if self.peek() == Some(byte) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_str(&mut self, token: &str) -> bool {
        self.skip_whitespace();
        if self.text[self.pos..].starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn keyword(&mut self, word: &str) -> bool {
        self.skip_whitespace();
        match self.text.get(self.pos..self.pos + word.len()) {
            Some(found) if found.eq_ignore_ascii_case(word) => {
                self.pos += word.len();
                true
            }
            _ => false,
        }
    }

    fn end(&mut self) -> Result<(), BasicError> {
        match self.peek() {
            None => Ok(()),
            Some(_) => Err(BasicError::Syntax),
        }
    }

    fn rest(&mut self) -> &'a str {
        let rest = &self.text[self.pos..];
        self.pos = self.text.len();
        rest
    }

    /// Variable or keyword: a letter, then letters and digits, then an
    /// optional `$`. Upper-cased.
    fn identifier(&mut self) -> Option<String> {
        self.skip_whitespace();
        let bytes = self.bytes();
        let start = self.pos;
        if !bytes.get(start)?.is_ascii_alphabetic() {
            return None;
        }
        let mut end = start + 1;
        while bytes.get(end).is_some_and(u8::is_ascii_alphanumeric) {
            end += 1;
        }
        if bytes.get(end) == Some(&b'$') {
            end += 1;
        }
        self.pos = end;
        Some(self.text[start..end].to_ascii_uppercase())
    }

    fn line_number(&mut self) -> Result<u32, BasicError> {
        self.skip_whitespace();
        let digits = self.text[self.pos..]
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(self.text.len() - self.pos);
        let number = self.text[self.pos..self.pos + digits].parse().map_err(|_| BasicError::Syntax)?;
        self.pos += digits;
        Ok(number)
    }

    fn number(&mut self) -> Option<f64> {
        self.skip_whitespace();
        let bytes = self.bytes();
        let start = self.pos;
        let mut end = start;
        while bytes.get(end).is_some_and(|b| b.is_ascii_digit() || *b == b'.') {
            end += 1;
        }
        if end == start {
            return None;
        }
        if matches!(bytes.get(end), Some(b'E' | b'e')) {
            let mut exponent = end + 1;
            if matches!(bytes.get(exponent), Some(b'+' | b'-')) {
                exponent += 1;
            }
            if bytes.get(exponent).is_some_and(u8::is_ascii_digit) {
                end = exponent;
                while bytes.get(end).is_some_and(u8::is_ascii_digit) {
                    end += 1;
                }
            }
        }
        let value = self.text[start..end].parse().ok()?;
        self.pos = end;
        Some(value)
    }

    fn string(&mut self) -> Result<String, BasicError> {
        if !self.eat(b'"') {
            return Err(BasicError::Syntax);
        }
        let length = self.text[self.pos..].find('"').ok_or(BasicError::Syntax)?;
        let text = self.text[self.pos..self.pos + length].to_string();
        self.pos += length + 1;
        Ok(text)
    }

    /// `sum [relation sum]`; a relation yields 1 or 0.
    fn expr(&mut self, variables: &HashMap<String, Value>) -> Result<Value, BasicError> {
        let left = self.sum(variables)?;
        for relation in ["<=", ">=", "<>", "<", ">", "="] {
            if self.eat_str(relation) {
                let right = self.sum(variables)?;
                let holds = compare(relation, &left, &right)?;
                return Ok(Value::Number(if holds { 1.0 } else { 0.0 }));
            }
        }
        Ok(left)
    }

    fn sum(&mut self, variables: &HashMap<String, Value>) -> Result<Value, BasicError> {
        let mut value = self.product(variables)?;
        loop {
            if self.eat(b'+') {
                let right = self.product(variables)?;
                value = match (value, right) {
                    (Value::Number(a), Value::Number(b)) => Value::Number(a + b),
                    (Value::Text(a), Value::Text(b)) => Value::Text(a + &b),
                    _ => return Err(BasicError::TypeMismatch),
                };
            } else if self.eat(b'-') {
                let right = self.product(variables)?.number()?;
                value = Value::Number(value.number()? - right);
            } else {
                return Ok(value);
            }
        }
    }

    fn product(&mut self, variables: &HashMap<String, Value>) -> Result<Value, BasicError> {
        let mut value = self.unary(variables)?;
        loop {
            if self.eat(b'*') {
                let right = self.unary(variables)?.number()?;
                value = Value::Number(value.number()? * right);
            } else if self.eat(b'/') {
                let right = self.unary(variables)?.number()?;
                if right == 0.0 {
                    return Err(BasicError::DivisionByZero);
                }
                value = Value::Number(value.number()? / right);
            } else {
                return Ok(value);
            }
        }
    }

    fn unary(&mut self, variables: &HashMap<String, Value>) -> Result<Value, BasicError> {
        if self.eat(b'-') {
            return Ok(Value::Number(-self.unary(variables)?.number()?));
        }
        if self.eat(b'+') {
            return Ok(Value::Number(self.unary(variables)?.number()?));
        }
        self.power(variables)
    }

    fn power(&mut self, variables: &HashMap<String, Value>) -> Result<Value, BasicError> {
        let base = self.primary(variables)?;
        if self.eat(b'^') {
            let exponent = self.unary(variables)?.number()?;
            return Ok(Value::Number(base.number()?.powf(exponent)));
        }
        Ok(base)
    }

    fn primary(&mut self, variables: &HashMap<String, Value>) -> Result<Value, BasicError> {
        match self.peek() {
            Some(b'(') => {
                self.pos += 1;
                let value = self.expr(variables)?;
                if !self.eat(b')') {
                    return Err(BasicError::Syntax);
                }
                Ok(value)
            }
            Some(b'"') => Ok(Value::Text(self.string()?)),
            Some(c) if c.is_ascii_digit() || c == b'.' => self.number().map(Value::Number).ok_or(BasicError::Syntax),
            Some(c) if c.is_ascii_alphabetic() => {
                let name = self.identifier().ok_or(BasicError::Syntax)?;
                Ok(variables.get(&name).cloned().unwrap_or_else(|| {
                    if name.ends_with('$') {
                        Value::Text(String::new())
                    } else {
                        Value::Number(0.0)
                    }
                }))
            }
            _ => Err(BasicError::Syntax),
        }
    }
}

fn compare(relation: &str, left: &Value, right: &Value) -> Result<bool, BasicError> {
    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
        (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
        _ => return Err(BasicError::TypeMismatch),
    };
    let Some(ordering) = ordering else {
        return Ok(relation == "<>");
    };
    Ok(match relation {
        "<=" => ordering.is_le(),
        ">=" => ordering.is_ge(),
        "<>" => ordering.is_ne(),
        "<" => ordering.is_lt(),
        ">" => ordering.is_gt(),
        _ => ordering.is_eq(),
    })
}

fn print_line(console: &mut dyn Console, text: &str) {
    console.put_str(text.as_bytes());
    console.put_str(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{Drive, MemoryDrive};

    const BUDGET: u64 = 10_000;

    #[derive(Default)]
    struct Screen(Vec<u8>);

    impl Console for Screen {
        fn put_char(&mut self, ch: u8) {
            self.0.push(ch);
        }

        fn get_char(&mut self) -> Option<u8> {
            None
        }
    }

    impl Screen {
        fn take(&mut self) -> String {
            String::from_utf8_lossy(&std::mem::take(&mut self.0)).into_owned()
        }
    }

    fn setup() -> (Basic, Bdos, Screen) {
        let drives: Vec<Box<dyn Drive>> = vec![Box::new(MemoryDrive::new())];
        let mut screen = Screen::default();
        let basic = Basic::start(&mut screen);
        screen.take();
        (basic, Bdos::new(drives), screen)
    }

    fn enter(basic: &mut Basic, bdos: &mut Bdos, screen: &mut Screen, lines: &[&str]) -> BasicStatus {
        let mut status = BasicStatus::Ready;
        for line in lines {
            status = basic.handle_line(line, bdos, screen, BUDGET);
        }
        status
    }

    #[test]
    fn test_banner() {
        let mut screen = Screen::default();
        Basic::start(&mut screen);
        assert_eq!(
            screen.take(),
            "BASIC Interpreter v1.0\r\nType LIST to list program, RUN to execute\r\n\r\n] "
        );
    }

    #[test]
    fn test_store_list_and_delete_lines() {
        let (mut basic, mut bdos, mut screen) = setup();
        enter(&mut basic, &mut bdos, &mut screen, &["20 PRINT \"B\"", "10 PRINT \"A\"", "30 END", "30"]);
        screen.take();

        basic.handle_line("LIST", &mut bdos, &mut screen, BUDGET);
        assert_eq!(screen.take(), "10 PRINT \"A\"\r\n20 PRINT \"B\"\r\n] ");

        basic.handle_line("list 20", &mut bdos, &mut screen, BUDGET);
        assert_eq!(screen.take(), "20 PRINT \"B\"\r\n] ");
    }

    #[test]
    fn test_run_arithmetic_and_print() {
        let (mut basic, mut bdos, mut screen) = setup();
        enter(
            &mut basic,
            &mut bdos,
            &mut screen,
            &[
                "10 LET A = 2 + 3 * 4",
                "20 B = (2 + 3) * 4 - 2 ^ 3",
                "30 N$ = \"SUM \"",
                "40 PRINT N$; A + B;",
                "50 ? \"!\"",
                "60 PRINT 7 / 2, -A",
            ],
        );
        screen.take();

        basic.handle_line("RUN", &mut bdos, &mut screen, BUDGET);

        assert_eq!(screen.take(), "SUM 26!\r\n3.5           -14\r\n] ");
        assert_eq!(basic.variable("a"), Some(&Value::Number(14.0)));
        assert!(!basic.is_running());
    }

    #[test]
    fn test_for_next_and_gosub() {
        let (mut basic, mut bdos, mut screen) = setup();
        enter(
            &mut basic,
            &mut bdos,
            &mut screen,
            &[
                "10 FOR I = 1 TO 3",
                "20 GOSUB 100",
                "30 NEXT I",
                "40 FOR J = 10 TO 0 STEP -5: REM counts down",
                "100 PRINT I;",
                "110 RETURN",
            ],
        );
        // `:` does not separate statements, so line 40 is rejected
        screen.take();

        basic.handle_line("RUN", &mut bdos, &mut screen, BUDGET);

        assert_eq!(screen.take(), "123?SYNTAX ERROR IN 40\r\n] ");
    }

    #[test]
    fn test_if_then_and_goto_loop() {
        let (mut basic, mut bdos, mut screen) = setup();
        enter(
            &mut basic,
            &mut bdos,
            &mut screen,
            &[
                "10 N = 0",
                "20 N = N + 1",
                "30 IF N < 5 THEN 20",
                "40 IF N = 5 THEN PRINT \"FIVE\"",
                "50 IF N <> 5 THEN PRINT \"NOT FIVE\"",
                "60 IF \"A\" < \"B\" THEN GOTO 80",
                "70 PRINT \"SKIPPED\"",
                "80 END",
                "90 PRINT \"AFTER END\"",
            ],
        );
        screen.take();

        basic.handle_line("RUN", &mut bdos, &mut screen, BUDGET);

        assert_eq!(screen.take(), "FIVE\r\n] ");
        assert_eq!(basic.variable("N"), Some(&Value::Number(5.0)));
    }

    #[test]
    fn test_input_parks_the_program() {
        let (mut basic, mut bdos, mut screen) = setup();
        enter(
            &mut basic,
            &mut bdos,
            &mut screen,
            &["10 INPUT \"NAME\"; N$", "20 INPUT X", "30 PRINT \"HI \"; N$; X * 2"],
        );
        screen.take();

        assert_eq!(basic.handle_line("RUN", &mut bdos, &mut screen, BUDGET), BasicStatus::AwaitingInput);
        assert_eq!(screen.take(), "NAME? ");
        assert!(basic.is_running());

        assert_eq!(basic.handle_line("Ada", &mut bdos, &mut screen, BUDGET), BasicStatus::AwaitingInput);
        assert_eq!(screen.take(), "? ");

        assert_eq!(basic.handle_line("lots", &mut bdos, &mut screen, BUDGET), BasicStatus::AwaitingInput);
        assert_eq!(screen.take(), "?REDO FROM START\r\n? ");

        assert_eq!(basic.handle_line("21", &mut bdos, &mut screen, BUDGET), BasicStatus::Ready);
        assert_eq!(screen.take(), "HI Ada42\r\n] ");
        assert!(!basic.is_running());
    }

    #[test]
    fn test_runaway_loop_is_broken() {
        let (mut basic, mut bdos, mut screen) = setup();
        enter(&mut basic, &mut bdos, &mut screen, &["10 GOTO 10"]);
        screen.take();

        assert_eq!(basic.handle_line("RUN", &mut bdos, &mut screen, 50), BasicStatus::Ready);
        assert_eq!(screen.take(), "?BREAK IN 10\r\n] ");
    }

    #[test]
    fn test_runtime_errors() {
        let (mut basic, mut bdos, mut screen) = setup();
        for (program, message) in [
            ("10 GOTO 99", "?UNDEFINED LINE 99 IN 10\r\n] "),
            ("10 RETURN", "?RETURN WITHOUT GOSUB IN 10\r\n] "),
            ("10 NEXT", "?NEXT WITHOUT FOR IN 10\r\n] "),
            ("10 PRINT 1 / 0", "?DIVISION BY ZERO IN 10\r\n] "),
            ("10 A = \"X\"", "?TYPE MISMATCH IN 10\r\n] "),
            ("10 PRINT (1", "?SYNTAX ERROR IN 10\r\n] "),
        ] {
            enter(&mut basic, &mut bdos, &mut screen, &["NEW", program]);
            screen.take();
            basic.handle_line("RUN", &mut bdos, &mut screen, BUDGET);
            assert_eq!(screen.take(), message, "{}", program);
        }
    }

    #[test]
    fn test_save_and_load() {
        let (mut basic, mut bdos, mut screen) = setup();
        enter(&mut basic, &mut bdos, &mut screen, &["10 PRINT 1", "20 END", "SAVE prog"]);
        assert!(screen.take().ends_with("Saved 2 lines to PROG.BAS\r\n] "));
        assert_eq!(bdos.current().get_file("PROG.BAS"), Some(&b"10 PRINT 1\r\n20 END\r\n\x1A"[..]));

        enter(&mut basic, &mut bdos, &mut screen, &["NEW", "LOAD \"PROG\""]);
        assert!(screen.take().ends_with("Loaded 2 lines from PROG.BAS\r\n] "));
        assert_eq!(basic.program().len(), 2);

        basic.handle_line("LOAD NONE", &mut bdos, &mut screen, BUDGET);
        assert_eq!(screen.take(), "?FILE NOT FOUND\r\n] ");
    }

    #[test]
    fn test_direct_commands() {
        let (mut basic, mut bdos, mut screen) = setup();

        basic.handle_line("RUN", &mut bdos, &mut screen, BUDGET);
        assert_eq!(screen.take(), "No program to run\r\n] ");

        basic.handle_line("FROB", &mut bdos, &mut screen, BUDGET);
        assert_eq!(screen.take(), "?SYNTAX ERROR\r\n] ");

        basic.handle_line("help", &mut bdos, &mut screen, BUDGET);
        assert!(screen.take().starts_with("Commands:"));

        assert_eq!(basic.handle_line("quit", &mut bdos, &mut screen, BUDGET), BasicStatus::Quit);
    }
}
