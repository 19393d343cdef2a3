//! Listing module: decodes `dis`-style disassembly listings into instructions.
//!
//! Each non-empty line describes one instruction:
//!
//! ```text
//!   [line]  [>>]  <offset> <OPNAME> [arg] [(argrepr)]
//! ```
//!
//! The argument is interpreted according to the opcode, so `LOAD_CONST 10` yields an
//! integer constant while `LOAD_ATTR gpa` yields a name. When a raw numeric argument
//! is followed by a parenthesised argrepr (as `dis` prints it), the argrepr wins.

use crate::instruction::{Instruction, Offset, Opcode, Operand, OperandKind};
use crate::types::ConstantValue;
use crate::LambdaQueryError;

/// Decodes a whole listing. Blank lines and `#` comments are skipped.
pub fn parse_listing(input: &str) -> Result<Vec<Instruction>, LambdaQueryError> {
    let mut instructions = Vec::new();
    for (number, raw) in input.lines().enumerate() {
        let line = match comment_start(raw) {
            Some(idx) => &raw[..idx],
            None => raw,
        };
        if line.trim().is_empty() {
            continue;
        }
        let instr = ListingParser::new(line)
            .parse_line()
            .map_err(|e| LambdaQueryError::ListingError(format!("line {}: {}", number + 1, e)))?;
        instructions.push(instr);
    }
    Ok(instructions)
}

/// Byte index of the first `#` outside a quoted constant.
fn comment_start(line: &str) -> Option<usize> {
    let mut quote = None;
    for (idx, c) in line.char_indices() {
        match (quote, c) {
            (None, '#') => return Some(idx),
            (None, '\'' | '"') => quote = Some(c),
            (Some(q), c) if c == q => quote = None,
            _ => {}
        }
    }
    None
}

// Hand-written recursive descent parser for a single listing line
struct ListingParser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> ListingParser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn parse_line(&mut self) -> Result<Instruction, String> {
        let mut numbers = Vec::new();
        loop {
            self.skip_whitespace();
            if self.consume(">>") {
                continue;
            }
            match self.peek() {
                Some(c) if c.is_ascii_digit() => numbers.push(self.parse_unsigned()?),
                _ => break,
            }
        }
        let (line, offset) = match numbers.as_slice() {
            [offset] => (None, *offset),
            [line, offset] => (Some(*line), *offset),
            [] => return Err(format!("expected instruction offset at position {}", self.pos)),
            _ => return Err(format!("too many leading numbers at position {}", self.pos)),
        };
        let opname = self.parse_opname()?;
        let opcode = Opcode::from_name(&opname);
        self.skip_whitespace();
        let operand = self.parse_operand(&opcode)?;
        self.skip_whitespace();
        if self.pos < self.input.len() {
            return Err(format!("unexpected input at position {}", self.pos));
        }
        let offset = Offset::try_from(offset).map_err(|_| format!("offset {} out of range", offset))?;
        let mut instr = Instruction::new(opcode, operand, offset);
        if let Some(line) = line {
            let line = u32::try_from(line).map_err(|_| format!("line number {} out of range", line))?;
            instr = instr.with_line(line);
        }
        Ok(instr)
    }

    fn parse_opname(&mut self) -> Result<String, String> {
        self.skip_whitespace();
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_' {
                self.consume_char();
            } else {
                break;
            }
        }
        if self.pos == start {
            return Err(format!("expected operation name at position {}", self.pos));
        }
        Ok(self.input[start..self.pos].to_string())
    }

    fn parse_operand(&mut self, opcode: &Opcode) -> Result<Operand, String> {
        if let Opcode::Other(_) = opcode {
            // Unknown opcodes keep their raw argument text; they are rejected when visited.
            let rest = self.input[self.pos..].trim().to_string();
            self.skip_argument();
            return Ok(if rest.is_empty() { Operand::None } else { Operand::Name(rest) });
        }
        if self.pos >= self.input.len() {
            return match opcode.operand_kind() {
                OperandKind::None => Ok(Operand::None),
                _ => Err(format!("{} requires an argument", opcode)),
            };
        }
        match opcode.operand_kind() {
            OperandKind::None => {
                // Some disassemblers print a dummy argument for argument-less opcodes.
                self.skip_argument();
                Ok(Operand::None)
            }
            OperandKind::Count => {
                let count = self.parse_unsigned()?;
                usize::try_from(count).map(Operand::Count).map_err(|_| format!("count {} out of range", count))
            }
            OperandKind::Flag => {
                let flag = self.parse_unsigned()?;
                self.skip_argrepr()?;
                u32::try_from(flag).map(Operand::Flag).map_err(|_| format!("flag {} out of range", flag))
            }
            OperandKind::Jump => {
                self.consume("to");
                self.skip_whitespace();
                let mut target = self.parse_unsigned()?;
                // Newer `dis` prints an instruction index followed by `(to <offset>)`.
                if let Some(repr) = self.parse_argrepr()? {
                    if let Some(offset) = repr.strip_prefix("to ") {
                        target = offset
                            .trim()
                            .parse::<u64>()
                            .map_err(|_| format!("invalid jump target {:?}", repr))?;
                    }
                }
                Offset::try_from(target).map(Operand::Jump).map_err(|_| format!("jump target {} out of range", target))
            }
            OperandKind::Name => {
                let name = match self.parse_argrepr_after_index()? {
                    Some(repr) => repr,
                    None => self.parse_identifier()?,
                };
                Ok(Operand::Name(name))
            }
            OperandKind::Operator => {
                let symbol = match self.parse_argrepr_after_index()? {
                    Some(repr) => repr,
                    None => self.parse_symbol()?,
                };
                Ok(Operand::Operator(symbol))
            }
            OperandKind::Constant => {
                if let Some(repr) = self.parse_argrepr_after_index()? {
                    let mut inner = ListingParser::new(&repr);
                    let value = inner.parse_constant()?;
                    inner.skip_whitespace();
                    if inner.pos < inner.input.len() {
                        return Err(format!("unexpected input in constant {:?}", repr));
                    }
                    return Ok(Operand::Constant(value));
                }
                Ok(Operand::Constant(self.parse_constant()?))
            }
        }
    }

    /// Handles the `<index> (<argrepr>)` form printed by `dis`; returns the argrepr text.
    fn parse_argrepr_after_index(&mut self) -> Result<Option<String>, String> {
        let start = self.pos;
        if !self.peek().map_or(false, |c| c.is_ascii_digit()) {
            return Ok(None);
        }
        self.parse_unsigned()?;
        let repr = self.parse_argrepr()?;
        if repr.is_none() {
            self.pos = start;
        }
        Ok(repr)
    }

    fn parse_argrepr(&mut self) -> Result<Option<String>, String> {
        self.skip_whitespace();
        if self.peek() != Some('(') {
            return Ok(None);
        }
        let end = self.input.rfind(')').ok_or_else(|| format!("unterminated argrepr at position {}", self.pos))?;
        let repr = self.input[self.pos + 1..end].trim().to_string();
        self.pos = end + 1;
        Ok(Some(repr))
    }

    fn skip_argrepr(&mut self) -> Result<(), String> {
        self.parse_argrepr().map(|_| ())
    }

    fn skip_argument(&mut self) {
        self.pos = self.input.len();
    }

    fn parse_constant(&mut self) -> Result<ConstantValue, String> {
        self.skip_whitespace();
        match self.peek() {
            Some('\'') | Some('"') => self.parse_string_literal(),
            Some('(') => self.parse_tuple_literal(),
            Some(c) if c.is_ascii_digit() || c == '-' => self.parse_number_literal(),
            _ => {
                if self.consume("None") {
                    Ok(ConstantValue::None)
                } else if self.consume("True") {
                    Ok(ConstantValue::Bool(true))
                } else if self.consume("False") {
                    Ok(ConstantValue::Bool(false))
                } else {
                    Err(format!("expected constant at position {}", self.pos))
                }
            }
        }
    }

    fn parse_tuple_literal(&mut self) -> Result<ConstantValue, String> {
        if !self.consume("(") {
            return Err(format!("expected '(' at position {}", self.pos));
        }
        let mut items = Vec::new();
        loop {
            self.skip_whitespace();
            if self.consume(")") {
                break;
            }
            items.push(self.parse_constant()?);
            self.skip_whitespace();
            if self.consume(",") {
                continue;
            }
            if !self.consume(")") {
                return Err(format!("expected ',' or ')' at position {}", self.pos));
            }
            break;
        }
        Ok(ConstantValue::Tuple(items))
    }

    fn parse_string_literal(&mut self) -> Result<ConstantValue, String> {
        let quote = self.consume_char().ok_or_else(|| format!("expected quote at position {}", self.pos))?;
        let mut value = String::new();
        loop {
            match self.consume_char() {
                None => return Err(format!("unterminated string literal at position {}", self.pos)),
                Some('\\') => match self.consume_char() {
                    Some('n') => value.push('\n'),
                    Some('t') => value.push('\t'),
                    Some(c) => value.push(c),
                    None => return Err(format!("unterminated escape at position {}", self.pos)),
                },
                Some(c) if c == quote => break,
                Some(c) => value.push(c),
            }
        }
        Ok(ConstantValue::Str(value))
    }

    fn parse_number_literal(&mut self) -> Result<ConstantValue, String> {
        let start = self.pos;
        if self.peek() == Some('-') {
            self.consume_char();
        }
        let mut is_float = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                self.consume_char();
            } else if (c == '.' || c == 'e' || c == 'E') && self.pos > start {
                is_float = true;
                self.consume_char();
                if c != '.' && matches!(self.peek(), Some('-') | Some('+')) {
                    self.consume_char();
                }
            } else {
                break;
            }
        }
        let s = &self.input[start..self.pos];
        if is_float {
            s.parse::<f64>()
                .map(ConstantValue::Float)
                .map_err(|_| format!("invalid float literal at position {}", start))
        } else {
            s.parse::<i64>()
                .map(ConstantValue::Int)
                .map_err(|_| format!("invalid integer literal at position {}", start))
        }
    }

    fn parse_unsigned(&mut self) -> Result<u64, String> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                self.consume_char();
            } else {
                break;
            }
        }
        self.input[start..self.pos]
            .parse::<u64>()
            .map_err(|_| format!("expected number at position {}", start))
    }

    fn parse_identifier(&mut self) -> Result<String, String> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' || c == '.' || c == '<' || c == '>' {
                self.consume_char();
            } else {
                break;
            }
        }
        if self.pos == start {
            return Err(format!("expected identifier at position {}", self.pos));
        }
        Ok(self.input[start..self.pos].to_string())
    }

    fn parse_symbol(&mut self) -> Result<String, String> {
        // Two-word operators first so that "not in" is not read as "not".
        for word in ["not in", "is not"] {
            if self.consume(word) {
                return Ok(word.to_string());
            }
        }
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                break;
            }
            self.consume_char();
        }
        if self.pos == start {
            return Err(format!("expected operator at position {}", self.pos));
        }
        Ok(self.input[start..self.pos].to_string())
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.consume_char();
            } else {
                break;
            }
        }
    }

    fn consume(&mut self, s: &str) -> bool {
        if self.input[self.pos..].starts_with(s) {
            self.pos += s.len();
            true
        } else {
            false
        }
    }

    fn consume_char(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += ch.len_utf8();
        Some(ch)
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }
}
