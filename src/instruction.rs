//! Instruction module: the decoded form of a closure's compiled body.
//!
//! This module defines the opcodes the decompiler understands, their operands and
//! static stack effects, and the CodeObject that carries a closure's parameters.

use crate::types::ConstantValue;
use crate::LambdaQueryError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Byte offset of an instruction within its code object.
pub type Offset = u32;

/// Operation names recognised by the decompiler. Anything else decodes to `Other`
/// and is rejected when visited.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    LoadFast,
    LoadName,
    LoadGlobal,
    LoadDeref,
    LoadConst,
    LoadAttr,
    CompareOp,
    ContainsOp,
    IsOp,
    BinaryAdd,
    BinarySubtract,
    BinaryMultiply,
    BinaryTrueDivide,
    BinaryFloorDivide,
    BinaryModulo,
    BinaryPower,
    /// 3.11+ generic binary operator; the operand carries the symbol.
    BinaryOp,
    UnaryNot,
    UnaryNegative,
    BuildTuple,
    BuildList,
    BuildMap,
    BuildConstKeyMap,
    JumpIfFalseOrPop,
    JumpIfTrueOrPop,
    PopJumpIfFalse,
    PopJumpIfTrue,
    /// 3.11 relative conditional jumps; listings print the absolute target.
    PopJumpForwardIfFalse,
    PopJumpForwardIfTrue,
    PopJumpBackwardIfFalse,
    PopJumpBackwardIfTrue,
    /// 3.11 `is None` / `is not None` tests fused into the jump.
    PopJumpForwardIfNone,
    PopJumpForwardIfNotNone,
    PopJumpBackwardIfNone,
    PopJumpBackwardIfNotNone,
    JumpForward,
    JumpAbsolute,
    JumpBackward,
    ReturnValue,
    Resume,
    Nop,
    Cache,
    ExtendedArg,
    Other(String),
}

const OPCODE_NAMES: &[(&str, Opcode)] = &[
    ("LOAD_FAST", Opcode::LoadFast),
    ("LOAD_NAME", Opcode::LoadName),
    ("LOAD_GLOBAL", Opcode::LoadGlobal),
    ("LOAD_DEREF", Opcode::LoadDeref),
    ("LOAD_CONST", Opcode::LoadConst),
    ("LOAD_ATTR", Opcode::LoadAttr),
    ("COMPARE_OP", Opcode::CompareOp),
    ("CONTAINS_OP", Opcode::ContainsOp),
    ("IS_OP", Opcode::IsOp),
    ("BINARY_ADD", Opcode::BinaryAdd),
    ("BINARY_SUBTRACT", Opcode::BinarySubtract),
    ("BINARY_MULTIPLY", Opcode::BinaryMultiply),
    ("BINARY_TRUE_DIVIDE", Opcode::BinaryTrueDivide),
    ("BINARY_FLOOR_DIVIDE", Opcode::BinaryFloorDivide),
    ("BINARY_MODULO", Opcode::BinaryModulo),
    ("BINARY_POWER", Opcode::BinaryPower),
    ("BINARY_OP", Opcode::BinaryOp),
    ("UNARY_NOT", Opcode::UnaryNot),
    ("UNARY_NEGATIVE", Opcode::UnaryNegative),
    ("BUILD_TUPLE", Opcode::BuildTuple),
    ("BUILD_LIST", Opcode::BuildList),
    ("BUILD_MAP", Opcode::BuildMap),
    ("BUILD_CONST_KEY_MAP", Opcode::BuildConstKeyMap),
    ("JUMP_IF_FALSE_OR_POP", Opcode::JumpIfFalseOrPop),
    ("JUMP_IF_TRUE_OR_POP", Opcode::JumpIfTrueOrPop),
    ("POP_JUMP_IF_FALSE", Opcode::PopJumpIfFalse),
    ("POP_JUMP_IF_TRUE", Opcode::PopJumpIfTrue),
    ("POP_JUMP_FORWARD_IF_FALSE", Opcode::PopJumpForwardIfFalse),
    ("POP_JUMP_FORWARD_IF_TRUE", Opcode::PopJumpForwardIfTrue),
    ("POP_JUMP_BACKWARD_IF_FALSE", Opcode::PopJumpBackwardIfFalse),
    ("POP_JUMP_BACKWARD_IF_TRUE", Opcode::PopJumpBackwardIfTrue),
    ("POP_JUMP_FORWARD_IF_NONE", Opcode::PopJumpForwardIfNone),
    ("POP_JUMP_FORWARD_IF_NOT_NONE", Opcode::PopJumpForwardIfNotNone),
    ("POP_JUMP_BACKWARD_IF_NONE", Opcode::PopJumpBackwardIfNone),
    ("POP_JUMP_BACKWARD_IF_NOT_NONE", Opcode::PopJumpBackwardIfNotNone),
    ("JUMP_FORWARD", Opcode::JumpForward),
    ("JUMP_ABSOLUTE", Opcode::JumpAbsolute),
    ("JUMP_BACKWARD", Opcode::JumpBackward),
    ("RETURN_VALUE", Opcode::ReturnValue),
    ("RESUME", Opcode::Resume),
    ("NOP", Opcode::Nop),
    ("CACHE", Opcode::Cache),
    ("EXTENDED_ARG", Opcode::ExtendedArg),
];

/// How the argument of an opcode is interpreted when decoding a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    None,
    Count,
    Jump,
    Constant,
    Name,
    Operator,
    Flag,
}

impl Opcode {
    pub fn from_name(name: &str) -> Self {
        OPCODE_NAMES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, op)| op.clone())
            .unwrap_or_else(|| Opcode::Other(name.to_string()))
    }

    pub fn name(&self) -> &str {
        match self {
            Opcode::Other(name) => name,
            known => OPCODE_NAMES
                .iter()
                .find(|(_, op)| op == known)
                .map(|(n, _)| *n)
                .unwrap_or("UNKNOWN"),
        }
    }

    pub fn operand_kind(&self) -> OperandKind {
        match self {
            Opcode::LoadFast | Opcode::LoadName | Opcode::LoadGlobal | Opcode::LoadDeref | Opcode::LoadAttr => {
                OperandKind::Name
            }
            Opcode::LoadConst => OperandKind::Constant,
            Opcode::CompareOp | Opcode::BinaryOp => OperandKind::Operator,
            Opcode::ContainsOp | Opcode::IsOp => OperandKind::Flag,
            Opcode::BuildTuple | Opcode::BuildList | Opcode::BuildMap | Opcode::BuildConstKeyMap => OperandKind::Count,
            Opcode::JumpIfFalseOrPop
            | Opcode::JumpIfTrueOrPop
            | Opcode::JumpForward
            | Opcode::JumpAbsolute
            | Opcode::JumpBackward => OperandKind::Jump,
            op if op.is_conditional_jump() => OperandKind::Jump,
            Opcode::Other(_) => OperandKind::Name,
            _ => OperandKind::None,
        }
    }

    /// `JUMP_IF_*_OR_POP`: leaves the tested value on the stack when jumping.
    pub fn is_short_circuit(&self) -> bool {
        matches!(self, Opcode::JumpIfFalseOrPop | Opcode::JumpIfTrueOrPop)
    }

    /// `POP_JUMP_*`: always consumes the tested value.
    pub fn is_conditional_jump(&self) -> bool {
        matches!(
            self,
            Opcode::PopJumpIfFalse
                | Opcode::PopJumpIfTrue
                | Opcode::PopJumpForwardIfFalse
                | Opcode::PopJumpForwardIfTrue
                | Opcode::PopJumpBackwardIfFalse
                | Opcode::PopJumpBackwardIfTrue
                | Opcode::PopJumpForwardIfNone
                | Opcode::PopJumpForwardIfNotNone
                | Opcode::PopJumpBackwardIfNone
                | Opcode::PopJumpBackwardIfNotNone
        )
    }

    /// Instructions after which control never falls through.
    pub fn is_terminator(&self) -> bool {
        matches!(self, Opcode::JumpForward | Opcode::JumpAbsolute | Opcode::JumpBackward | Opcode::ReturnValue)
    }

    /// Interpreter bookkeeping with no effect on the value computed.
    pub fn is_no_op(&self) -> bool {
        matches!(self, Opcode::Resume | Opcode::Nop | Opcode::Cache | Opcode::ExtendedArg)
    }

    pub fn is_jump(&self) -> bool {
        self.operand_kind() == OperandKind::Jump
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Decoded argument of an instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    None,
    Count(usize),
    Jump(Offset),
    Constant(ConstantValue),
    Name(String),
    Operator(String),
    Flag(u32),
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::None => Ok(()),
            Operand::Count(n) => write!(f, "{}", n),
            Operand::Jump(target) => write!(f, "to {}", target),
            Operand::Constant(c) => write!(f, "{}", c),
            Operand::Name(n) | Operand::Operator(n) => f.write_str(n),
            Operand::Flag(flag) => write!(f, "{}", flag),
        }
    }
}

/// Number of values an instruction pops and pushes when control falls through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticEffect {
    pub pops: usize,
    pub pushes: usize,
}

impl StaticEffect {
    pub const fn new(pops: usize, pushes: usize) -> Self {
        Self { pops, pushes }
    }

    pub const fn net(&self) -> isize {
        self.pushes as isize - self.pops as isize
    }
}

/// A single decoded instruction. Immutable once decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub opcode: Opcode,
    pub operand: Operand,
    pub line: Option<u32>,
    pub offset: Offset,
}

impl Instruction {
    pub fn new(opcode: Opcode, operand: Operand, offset: Offset) -> Self {
        Self { opcode, operand, line: None, offset }
    }

    pub fn with_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }

    pub fn opname(&self) -> &str {
        self.opcode.name()
    }

    pub fn jump_target(&self) -> Option<Offset> {
        match self.operand {
            Operand::Jump(target) => Some(target),
            _ => None,
        }
    }

    pub fn count(&self) -> Result<usize, LambdaQueryError> {
        match self.operand {
            Operand::Count(n) => Ok(n),
            _ => Err(self.bad_operand("a count")),
        }
    }

    pub fn name(&self) -> Result<&str, LambdaQueryError> {
        match &self.operand {
            Operand::Name(n) => Ok(n),
            _ => Err(self.bad_operand("a name")),
        }
    }

    pub fn constant(&self) -> Result<&ConstantValue, LambdaQueryError> {
        match &self.operand {
            Operand::Constant(c) => Ok(c),
            _ => Err(self.bad_operand("a constant")),
        }
    }

    pub fn operator(&self) -> Result<&str, LambdaQueryError> {
        match &self.operand {
            Operand::Operator(op) => Ok(op),
            _ => Err(self.bad_operand("an operator symbol")),
        }
    }

    pub fn flag(&self) -> Result<u32, LambdaQueryError> {
        match self.operand {
            Operand::Flag(flag) => Ok(flag),
            _ => Err(self.bad_operand("a flag")),
        }
    }

    /// Fall-through stack effect; `None` for opcodes the decompiler does not know.
    pub fn stack_effect(&self) -> Option<StaticEffect> {
        let n = match self.operand {
            Operand::Count(n) => n,
            _ => 0,
        };
        Some(match self.opcode {
            Opcode::LoadFast | Opcode::LoadName | Opcode::LoadGlobal | Opcode::LoadDeref | Opcode::LoadConst => {
                StaticEffect::new(0, 1)
            }
            Opcode::LoadAttr | Opcode::UnaryNot | Opcode::UnaryNegative => StaticEffect::new(1, 1),
            Opcode::CompareOp
            | Opcode::ContainsOp
            | Opcode::IsOp
            | Opcode::BinaryAdd
            | Opcode::BinarySubtract
            | Opcode::BinaryMultiply
            | Opcode::BinaryTrueDivide
            | Opcode::BinaryFloorDivide
            | Opcode::BinaryModulo
            | Opcode::BinaryPower
            | Opcode::BinaryOp => StaticEffect::new(2, 1),
            Opcode::BuildTuple | Opcode::BuildList => StaticEffect::new(n, 1),
            Opcode::BuildMap => StaticEffect::new(2 * n, 1),
            Opcode::BuildConstKeyMap => StaticEffect::new(n + 1, 1),
            Opcode::JumpIfFalseOrPop
            | Opcode::JumpIfTrueOrPop
            | Opcode::PopJumpIfFalse
            | Opcode::PopJumpIfTrue
            | Opcode::PopJumpForwardIfFalse
            | Opcode::PopJumpForwardIfTrue
            | Opcode::PopJumpBackwardIfFalse
            | Opcode::PopJumpBackwardIfTrue
            | Opcode::PopJumpForwardIfNone
            | Opcode::PopJumpForwardIfNotNone
            | Opcode::PopJumpBackwardIfNone
            | Opcode::PopJumpBackwardIfNotNone
            | Opcode::ReturnValue => StaticEffect::new(1, 0),
            Opcode::JumpForward
            | Opcode::JumpAbsolute
            | Opcode::JumpBackward
            | Opcode::Resume
            | Opcode::Nop
            | Opcode::Cache
            | Opcode::ExtendedArg => StaticEffect::new(0, 0),
            Opcode::Other(_) => return None,
        })
    }

    fn bad_operand(&self, expected: &str) -> LambdaQueryError {
        LambdaQueryError::MalformedClosure(format!(
            "{} at offset {} expects {}, found {:?}",
            self.opname(),
            self.offset,
            expected,
            self.operand
        ))
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:>4} {}", self.offset, self.opname())?;
        if self.operand != Operand::None {
            write!(f, " {}", self.operand)?;
        }
        Ok(())
    }
}

/// Flag bits of a code object relevant to parameter recovery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeFlags(pub u32);

impl CodeFlags {
    pub const VARARGS: u32 = 0x04;
    pub const VARKEYWORDS: u32 = 0x08;

    pub fn contains(&self, bit: u32) -> bool {
        self.0 & bit != 0
    }
}

/// The compiled body of a closure together with its parameter metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeObject {
    pub name: String,
    pub arg_count: usize,
    pub kwonly_arg_count: usize,
    /// Local variable names; parameters come first, then `*args`, then `**kwargs`.
    pub var_names: Vec<String>,
    pub flags: CodeFlags,
    pub instructions: Vec<Instruction>,
}

impl CodeObject {
    /// A lambda taking the given positional parameters.
    pub fn new(params: &[&str], instructions: Vec<Instruction>) -> Self {
        Self {
            name: "<lambda>".to_string(),
            arg_count: params.len(),
            kwonly_arg_count: 0,
            var_names: params.iter().map(|p| p.to_string()).collect(),
            flags: CodeFlags::default(),
            instructions,
        }
    }

    /// Decodes a `dis`-style listing into a lambda body.
    pub fn from_listing(params: &[&str], listing: &str) -> Result<Self, LambdaQueryError> {
        Ok(Self::new(params, crate::listing::parse_listing(listing)?))
    }

    /// Declares a trailing `*args` local.
    pub fn with_varargs(mut self, name: &str) -> Self {
        self.flags.0 |= CodeFlags::VARARGS;
        let at = self.arg_count + self.kwonly_arg_count;
        self.var_names.insert(at.min(self.var_names.len()), name.to_string());
        self
    }

    /// Declares a trailing `**kwargs` local.
    pub fn with_varkeywords(mut self, name: &str) -> Self {
        self.flags.0 |= CodeFlags::VARKEYWORDS;
        let mut at = self.arg_count + self.kwonly_arg_count;
        if self.flags.contains(CodeFlags::VARARGS) {
            at += 1;
        }
        self.var_names.insert(at.min(self.var_names.len()), name.to_string());
        self
    }

    pub fn parameter_names(&self) -> Vec<String> {
        self.var_names.iter().take(self.arg_count + self.kwonly_arg_count).cloned().collect()
    }

    pub fn vararg_name(&self) -> Option<String> {
        if !self.flags.contains(CodeFlags::VARARGS) {
            return None;
        }
        self.var_names.get(self.arg_count + self.kwonly_arg_count).cloned()
    }

    pub fn kwarg_name(&self) -> Option<String> {
        if !self.flags.contains(CodeFlags::VARKEYWORDS) {
            return None;
        }
        let mut at = self.arg_count + self.kwonly_arg_count;
        if self.flags.contains(CodeFlags::VARARGS) {
            at += 1;
        }
        self.var_names.get(at).cloned()
    }
}
