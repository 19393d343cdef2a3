//! Decompiler module: rebuilds a closure's expression tree from its instructions.
//!
//! The instruction stream is scanned range by range. Straight-line instructions are
//! pushed onto an InstructionStack as they are met. Each branch instruction closes
//! a group: the operand it tests is split off the accumulated instructions into a
//! sub-decompiler, and the code the branch skips is parsed as its own range. A
//! short-circuit `and`/`or` becomes a LIFO group (reverse traversal); a conditional
//! expression becomes a FIFO group of test, then-arm and else-arm (forward
//! traversal). Running a group pops its items and dispatches on each opcode.

use crate::ast::{
    BinOperator, BoolOperator, CompareOperator, Expr, ExprKind, LambdaExpr, NodeIdGen, ReturnStmt, UnaryOperator,
};
use crate::instruction::{CodeObject, Instruction, Offset, Opcode, Operand, StaticEffect};
use crate::stack::{Discipline, InstructionStack};
use crate::types::ConstantValue;
use crate::LambdaQueryError;
use std::collections::HashMap;
use tracing::{debug, instrument, trace, warn};

/// How a sub-decompiler consumes its items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Traversal {
    /// Straight-line code producing one operand.
    Linear,
    /// `a and b` / `a or b`: the left operand sits in a branch below the right
    /// operand's instructions, which are popped last-in-first-out.
    ShortCircuit,
    /// `b if a else c`: test, then-arm and else-arm popped first-in-first-out.
    Conditional,
}

impl Traversal {
    pub fn discipline(&self) -> Discipline {
        match self {
            Traversal::Conditional => Discipline::Fifo,
            Traversal::Linear | Traversal::ShortCircuit => Discipline::Lifo,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchKind {
    /// Joins the branch operand with the expression that follows it.
    ShortCircuit(BoolOperator),
    /// Test of a conditional expression.
    Condition,
}

/// A branch instruction together with the operand it tests.
#[derive(Debug, Clone)]
pub struct Branch {
    pub jump: Instruction,
    pub kind: BranchKind,
    pub operand: SubDecompiler,
}

#[derive(Debug, Clone)]
pub enum StackItem {
    Instruction(Instruction),
    /// A nested group producing exactly one value.
    Group(SubDecompiler),
    Branch(Box<Branch>),
}

impl StackItem {
    fn effect(&self) -> Result<StaticEffect, LambdaQueryError> {
        match self {
            StackItem::Instruction(instr) => instr
                .stack_effect()
                .ok_or_else(|| LambdaQueryError::UnsupportedOperation(instr.opname().to_string())),
            StackItem::Group(_) => Ok(StaticEffect::new(0, 1)),
            StackItem::Branch(branch) => Err(LambdaQueryError::MalformedClosure(format!(
                "branch at offset {} used as an operand",
                branch.jump.offset
            ))),
        }
    }
}

/// An independent unit of decompilation owning a snapshot of its items.
#[derive(Debug, Clone)]
pub struct SubDecompiler {
    traversal: Traversal,
    negated: bool,
    stack: InstructionStack<StackItem>,
}

impl SubDecompiler {
    pub fn new(traversal: Traversal, items: InstructionStack<StackItem>) -> Self {
        let mut stack = InstructionStack::new(traversal.discipline());
        stack.append(items);
        Self { traversal, negated: false, stack }
    }

    fn negate(mut self) -> Self {
        self.negated = !self.negated;
        self
    }

    pub fn traversal(&self) -> Traversal {
        self.traversal
    }

    pub fn items(&self) -> &InstructionStack<StackItem> {
        &self.stack
    }

    /// Decompiles the items into one expression. Works on a copy, so a
    /// sub-decompiler can be run any number of times.
    pub fn run(&self, ids: &mut NodeIdGen) -> Result<Expr, LambdaQueryError> {
        let mut frame = Frame { stack: self.stack.copy(), ids };
        let expr = match self.traversal {
            Traversal::Linear | Traversal::ShortCircuit => frame.run_operand()?,
            Traversal::Conditional => frame.run_conditional()?,
        };
        if let Some(item) = frame.stack.peek() {
            return Err(LambdaQueryError::MalformedClosure(format!(
                "unconsumed {} after decompiling {}",
                describe(item),
                expr
            )));
        }
        if self.negated {
            return Ok(Expr::new(
                frame.ids.fresh(),
                ExprKind::UnaryOp { op: UnaryOperator::Not, operand: Box::new(expr) },
            ));
        }
        Ok(expr)
    }
}

fn describe(item: &StackItem) -> String {
    match item {
        StackItem::Instruction(instr) => format!("{} at offset {}", instr.opname(), instr.offset),
        StackItem::Group(_) => "nested group".to_string(),
        StackItem::Branch(branch) => format!("branch at offset {}", branch.jump.offset),
    }
}

/// Turns a closure's instruction stream into sub-decompilers.
pub struct Decompiler {
    instructions: Vec<Instruction>,
    positions: HashMap<Offset, usize>,
    end: usize,
}

impl Decompiler {
    pub fn new(code: &CodeObject) -> Result<Self, LambdaQueryError> {
        let (mut instructions, positions) = normalize(&code.instructions);
        if instructions.is_empty() {
            return Err(LambdaQueryError::MalformedClosure("empty instruction stream".to_string()));
        }
        let mut end = instructions.len();
        if instructions[end - 1].opcode == Opcode::ReturnValue {
            end -= 1;
        }
        if end == 0 {
            return Err(LambdaQueryError::MalformedClosure("closure returns no value".to_string()));
        }
        relink_short_circuits(&mut instructions, &positions);
        Ok(Self { instructions, positions, end })
    }

    /// Decompiles a closure into its Lambda node.
    #[instrument(level = "trace", skip(code), fields(name = %code.name, instructions = code.instructions.len()))]
    pub fn decompile(code: &CodeObject) -> Result<LambdaExpr, LambdaQueryError> {
        let mut ids = NodeIdGen::new();
        Self::decompile_with(code, &mut ids)
    }

    pub fn decompile_with(code: &CodeObject, ids: &mut NodeIdGen) -> Result<LambdaExpr, LambdaQueryError> {
        let vararg = code.vararg_name();
        let kwarg = code.kwarg_name();
        if vararg.is_some() || kwarg.is_some() {
            warn!(name = %code.name, "closure declares variadic parameters; they are ignored");
        }
        let body = Self::new(code)?.root()?.run(ids)?;
        debug!(body = %body, shape = body.variant_name(), "decompiled closure body");
        let body = ReturnStmt { id: ids.fresh(), value: body };
        Ok(LambdaExpr { id: ids.fresh(), params: code.parameter_names(), vararg, kwarg, body })
    }

    /// The whole stream (minus the terminal return) as one sub-decompiler.
    pub fn root(&self) -> Result<SubDecompiler, LambdaQueryError> {
        Ok(SubDecompiler::new(Traversal::Linear, self.parse_range(0, self.end)?))
    }

    /// Instructions after normalization and peephole de-optimization.
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    fn parse_range(&self, lo: usize, hi: usize) -> Result<InstructionStack<StackItem>, LambdaQueryError> {
        let mut items = InstructionStack::lifo();
        let mut i = lo;
        while i < hi {
            let instr = &self.instructions[i];
            match instr.opcode {
                Opcode::JumpIfFalseOrPop | Opcode::JumpIfTrueOrPop => {
                    let target = self.target_index(instr)?;
                    if target <= i || target > hi {
                        return Err(self.bad_jump(instr));
                    }
                    let op = if instr.opcode == Opcode::JumpIfFalseOrPop { BoolOperator::And } else { BoolOperator::Or };
                    trace!(offset = instr.offset, op = op.symbol(), "short-circuit group");
                    let left = split_operand(&mut items, instr)?;
                    let mut group = InstructionStack::lifo();
                    group.push(StackItem::Branch(Box::new(Branch {
                        jump: instr.clone(),
                        kind: BranchKind::ShortCircuit(op),
                        operand: left,
                    })));
                    group.append(self.parse_range(i + 1, target)?);
                    items.push(StackItem::Group(SubDecompiler::new(Traversal::ShortCircuit, group)));
                    i = target;
                }
                Opcode::PopJumpIfFalse | Opcode::PopJumpIfTrue => {
                    let (group, resume) = self.parse_conditional(&mut items, i, hi)?;
                    items.push(StackItem::Group(group));
                    i = resume;
                }
                Opcode::JumpForward | Opcode::JumpAbsolute | Opcode::JumpBackward | Opcode::ReturnValue => {
                    return Err(LambdaQueryError::MalformedClosure(format!(
                        "unexpected {} at offset {}",
                        instr.opname(),
                        instr.offset
                    )));
                }
                _ => {
                    items.push(StackItem::Instruction(instr.clone()));
                    i += 1;
                }
            }
        }
        Ok(items)
    }

    /// Builds the FIFO group of a conditional expression whose first test jump is at `at`.
    /// Returns the group and the index where scanning resumes.
    fn parse_conditional(
        &self,
        items: &mut InstructionStack<StackItem>,
        at: usize,
        hi: usize,
    ) -> Result<(SubDecompiler, usize), LambdaQueryError> {
        let first = &self.instructions[at];
        // The else-arm is the only test target that control cannot fall into.
        let else_start = (at..hi)
            .filter(|&k| self.instructions[k].opcode.is_conditional_jump())
            .find_map(|k| {
                self.target_index(&self.instructions[k])
                    .ok()
                    .filter(|&t| t > k + 1 && t <= hi && self.ends_arm(t))
            })
            .ok_or_else(|| {
                LambdaQueryError::MalformedClosure(format!(
                    "{} at offset {} does not open a conditional expression",
                    first.opname(),
                    first.offset
                ))
            })?;
        let last = (at..else_start).rev().find(|&k| self.is_test_jump(k, else_start)).unwrap_or(at);
        let then_start = last + 1;

        let jumps: Vec<usize> =
            (at..=last).filter(|&k| self.instructions[k].opcode.is_conditional_jump()).collect();
        let mut targets = Vec::with_capacity(jumps.len());
        let mut atoms = Vec::with_capacity(jumps.len());
        let mut start = at + 1;
        for (n, &k) in jumps.iter().enumerate() {
            let instr = &self.instructions[k];
            targets.push(self.target_index(instr)?);
            atoms.push(Some(if n == 0 {
                split_operand(items, instr)?
            } else {
                SubDecompiler::new(Traversal::Linear, self.parse_range(start, k)?)
            }));
            start = k + 1;
        }
        trace!(offset = first.offset, atoms = atoms.len(), "conditional group");
        let test = TestJumps { decompiler: self, jumps: &jumps, targets: &targets }.fold(
            &mut atoms,
            0,
            jumps.len(),
            else_start,
            false,
        )?;

        let terminator = &self.instructions[else_start - 1];
        let resume = match terminator.opcode {
            Opcode::ReturnValue => hi,
            _ => {
                let join = self.target_index(terminator)?;
                if join < else_start || join > hi {
                    return Err(self.bad_jump(terminator));
                }
                join
            }
        };
        let then_arm = SubDecompiler::new(Traversal::Linear, self.parse_range(then_start, else_start - 1)?);
        let else_arm = SubDecompiler::new(Traversal::Linear, self.parse_range(else_start, resume)?);

        let mut group = InstructionStack::fifo();
        group.push(StackItem::Branch(Box::new(Branch {
            jump: self.instructions[last].clone(),
            kind: BranchKind::Condition,
            operand: test,
        })));
        group.push(StackItem::Group(then_arm));
        group.push(StackItem::Group(else_arm));
        Ok((SubDecompiler::new(Traversal::Conditional, group), resume))
    }

    fn is_test_jump(&self, k: usize, else_start: usize) -> bool {
        let instr = &self.instructions[k];
        instr.opcode.is_conditional_jump() && self.target_index(instr).map_or(false, |t| t == else_start)
    }

    /// Whether control cannot fall through into the instruction at `idx`.
    fn ends_arm(&self, idx: usize) -> bool {
        idx > 0 && self.instructions[idx - 1].opcode.is_terminator()
    }

    fn target_index(&self, instr: &Instruction) -> Result<usize, LambdaQueryError> {
        instr
            .jump_target()
            .and_then(|target| self.positions.get(&target).copied())
            .ok_or_else(|| self.bad_jump(instr))
    }

    fn bad_jump(&self, instr: &Instruction) -> LambdaQueryError {
        LambdaQueryError::MalformedClosure(format!(
            "unresolvable jump {} at offset {}",
            instr.operand, instr.offset
        ))
    }
}

/// The conditional jumps of a ternary test, in order, with their resolved targets.
/// Atom `i` is the code computing the value tested by `jumps[i]`.
struct TestJumps<'d> {
    decompiler: &'d Decompiler,
    jumps: &'d [usize],
    targets: &'d [usize],
}

impl TestJumps<'_> {
    /// Index of the instruction control falls through to after atom `hi - 1`.
    fn end(&self, hi: usize) -> usize {
        self.jumps[hi - 1] + 1
    }

    fn jump(&self, i: usize) -> &Instruction {
        &self.decompiler.instructions[self.jumps[i]]
    }

    /// Rebuilds the test made of atoms `lo..hi`, which jumps to `label` when it
    /// evaluates to `when` and falls through otherwise.
    ///
    /// The operands of a boolean operator either all leave early to `label` (an `or`
    /// jumping on true, an `and` jumping on false) or leave to the fall-through point,
    /// with the last operand deciding the jump to `label`. Each operand is the
    /// shortest run of atoms ending in such an exit whose other jumps stay inside it.
    fn fold(
        &self,
        atoms: &mut [Option<SubDecompiler>],
        lo: usize,
        hi: usize,
        label: usize,
        when: bool,
    ) -> Result<SubDecompiler, LambdaQueryError> {
        if hi - lo == 1 {
            let jump = self.jump(lo);
            if self.targets[lo] != label {
                return Err(self.decompiler.bad_jump(jump));
            }
            let atom = atoms[lo].take().ok_or_else(|| self.decompiler.bad_jump(jump))?;
            let jumps_on_true = jump.opcode == Opcode::PopJumpIfTrue;
            return Ok(if jumps_on_true == when { atom } else { atom.negate() });
        }
        let end = self.end(hi);
        let exit = (lo..hi - 1)
            .map(|i| self.targets[i])
            .find(|&t| t == label || t == end)
            .ok_or_else(|| self.unsupported(lo))?;
        let inner = if exit == label { when } else { !when };
        let op = if inner { BoolOperator::Or } else { BoolOperator::And };

        let mut operands = Vec::new();
        let mut a = lo;
        while a < hi {
            let b = (a + 1..hi)
                .find(|&b| {
                    self.targets[b - 1] == exit
                        && (a..b).all(|i| {
                            let t = self.targets[i];
                            t == exit || (t > self.jumps[i] && t <= self.end(b))
                        })
                })
                .unwrap_or(hi);
            if a == lo && b == hi {
                return Err(self.unsupported(lo));
            }
            let operand = if b == hi {
                self.fold(atoms, a, hi, label, when)?
            } else {
                self.fold(atoms, a, b, exit, inner)?
            };
            operands.push((operand, self.jumps[b - 1]));
            a = b;
        }

        let mut chain = InstructionStack::lifo();
        let root = operands.pop();
        for (operand, k) in operands {
            chain.push(StackItem::Branch(Box::new(Branch {
                jump: self.decompiler.instructions[k].clone(),
                kind: BranchKind::ShortCircuit(op),
                operand,
            })));
        }
        if let Some((root, _)) = root {
            chain.push(StackItem::Group(root));
        }
        Ok(SubDecompiler::new(Traversal::ShortCircuit, chain))
    }

    fn unsupported(&self, lo: usize) -> LambdaQueryError {
        LambdaQueryError::MalformedClosure(format!(
            "unsupported test shape for conditional at offset {}",
            self.jump(lo).offset
        ))
    }
}

/// Rewrites the stream onto the instruction forms structure recovery works on.
/// Interpreter no-ops are dropped, 3.11 directional jumps become `POP_JUMP_IF_*`
/// and fused `None` tests are expanded into `LOAD_CONST None; IS_OP` before the
/// jump. Every original offset maps to the first instruction emitted at or after it.
fn normalize(instructions: &[Instruction]) -> (Vec<Instruction>, HashMap<Offset, usize>) {
    let mut out: Vec<Instruction> = Vec::with_capacity(instructions.len());
    let mut positions = HashMap::new();
    let mut pending = Vec::new();
    for instr in instructions {
        pending.push(instr.offset);
        if instr.opcode.is_no_op() {
            continue;
        }
        for offset in pending.drain(..) {
            positions.entry(offset).or_insert(out.len());
        }
        let retagged = |opcode: Opcode| Instruction { opcode, ..instr.clone() };
        match instr.opcode {
            Opcode::PopJumpForwardIfFalse | Opcode::PopJumpBackwardIfFalse => {
                out.push(retagged(Opcode::PopJumpIfFalse));
            }
            Opcode::PopJumpForwardIfTrue | Opcode::PopJumpBackwardIfTrue => {
                out.push(retagged(Opcode::PopJumpIfTrue));
            }
            Opcode::JumpBackward => out.push(retagged(Opcode::JumpAbsolute)),
            Opcode::PopJumpForwardIfNone
            | Opcode::PopJumpForwardIfNotNone
            | Opcode::PopJumpBackwardIfNone
            | Opcode::PopJumpBackwardIfNotNone => {
                let on_none = matches!(instr.opcode, Opcode::PopJumpForwardIfNone | Opcode::PopJumpBackwardIfNone);
                out.push(Instruction::new(Opcode::LoadConst, Operand::Constant(ConstantValue::None), instr.offset));
                out.push(Instruction::new(Opcode::IsOp, Operand::Flag(0), instr.offset));
                out.push(retagged(if on_none { Opcode::PopJumpIfTrue } else { Opcode::PopJumpIfFalse }));
            }
            _ => out.push(instr.clone()),
        }
    }
    for offset in pending {
        positions.entry(offset).or_insert(out.len());
    }
    (out, positions)
}

/// Re-reads `POP_JUMP_IF_FALSE t` as `JUMP_IF_FALSE_OR_POP` when `t` directly follows a
/// `JUMP_IF_TRUE_OR_POP` (and the mirrored case), retargeting it at that instruction.
/// The compiler emits this form for `(a and b) or c`; the rewrite keeps behavior and
/// lets every short-circuit group end at its own target.
fn relink_short_circuits(instructions: &mut [Instruction], positions: &HashMap<Offset, usize>) {
    for i in (0..instructions.len()).rev() {
        let (replacement, partner) = match instructions[i].opcode {
            Opcode::PopJumpIfFalse => (Opcode::JumpIfFalseOrPop, Opcode::JumpIfTrueOrPop),
            Opcode::PopJumpIfTrue => (Opcode::JumpIfTrueOrPop, Opcode::JumpIfFalseOrPop),
            _ => continue,
        };
        let Some(target) = instructions[i].jump_target().and_then(|t| positions.get(&t).copied()) else {
            continue;
        };
        if target == 0 || target <= i + 1 || instructions[target - 1].opcode != partner {
            continue;
        }
        let via = instructions[target - 1].offset;
        trace!(offset = instructions[i].offset, via, "relinked conditional jump as short-circuit");
        instructions[i].opcode = replacement;
        instructions[i].operand = Operand::Jump(via);
    }
}

/// Splits the instructions producing the value tested by `jump` off the end of `items`.
fn split_operand(
    items: &mut InstructionStack<StackItem>,
    jump: &Instruction,
) -> Result<SubDecompiler, LambdaQueryError> {
    let mut need: isize = 1;
    let mut count = 0;
    for item in items.iter().rev() {
        let effect = item.effect()?;
        need += effect.pops as isize - effect.pushes as isize;
        count += 1;
        if need <= 0 {
            break;
        }
    }
    if need != 0 {
        return Err(LambdaQueryError::MalformedClosure(format!(
            "no operand for {} at offset {}",
            jump.opname(),
            jump.offset
        )));
    }
    let mut operand = InstructionStack::lifo();
    for _ in 0..count {
        if let Some(item) = items.pop() {
            operand.push(item);
        }
    }
    operand.reverse();
    Ok(SubDecompiler::new(Traversal::Linear, operand))
}

struct Frame<'g> {
    stack: InstructionStack<StackItem>,
    ids: &'g mut NodeIdGen,
}

impl Frame<'_> {
    /// Visits the top operand, then folds any short-circuit branches below it.
    fn run_operand(&mut self) -> Result<Expr, LambdaQueryError> {
        let mut expr = self.visit()?;
        while let Some(StackItem::Branch(branch)) = self.stack.peek() {
            let BranchKind::ShortCircuit(op) = branch.kind else {
                break;
            };
            let Some(StackItem::Branch(branch)) = self.stack.pop() else {
                break;
            };
            trace!(offset = branch.jump.offset, op = op.symbol(), "fused short-circuit branch");
            let left = branch.operand.run(self.ids)?;
            expr = Expr::bool_op(self.ids.fresh(), op, vec![left, expr]);
        }
        Ok(expr)
    }

    fn run_conditional(&mut self) -> Result<Expr, LambdaQueryError> {
        let test = match self.stack.pop() {
            Some(StackItem::Branch(branch)) if branch.kind == BranchKind::Condition => branch.operand.run(self.ids)?,
            other => {
                return Err(LambdaQueryError::MalformedClosure(format!(
                    "conditional expression without a test, found {}",
                    other.as_ref().map_or_else(|| "nothing".to_string(), describe)
                )))
            }
        };
        let body = self.visit()?;
        let orelse = self.visit()?;
        Ok(self.node(ExprKind::IfExp { test: Box::new(test), body: Box::new(body), orelse: Box::new(orelse) }))
    }

    fn node(&mut self, kind: ExprKind) -> Expr {
        Expr::new(self.ids.fresh(), kind)
    }

    fn visit(&mut self) -> Result<Expr, LambdaQueryError> {
        match self.stack.pop() {
            Some(StackItem::Instruction(instr)) => self.visit_instruction(&instr),
            Some(StackItem::Group(group)) => group.run(self.ids),
            Some(StackItem::Branch(branch)) => Err(LambdaQueryError::MalformedClosure(format!(
                "branch at offset {} used as an operand",
                branch.jump.offset
            ))),
            None => Err(LambdaQueryError::MalformedClosure("missing operand".to_string())),
        }
    }

    fn visit_instruction(&mut self, instr: &Instruction) -> Result<Expr, LambdaQueryError> {
        trace!(offset = instr.offset, opcode = instr.opname(), "visit");
        match &instr.opcode {
            Opcode::LoadConst => {
                let value = instr.constant()?.clone();
                Ok(self.constant(value))
            }
            Opcode::LoadFast | Opcode::LoadName | Opcode::LoadGlobal | Opcode::LoadDeref => {
                let name = instr.name()?.to_string();
                Ok(self.node(ExprKind::Name(name)))
            }
            Opcode::LoadAttr => {
                let attr = instr.name()?.to_string();
                let value = self.visit()?;
                Ok(self.node(ExprKind::Attribute { value: Box::new(value), attr }))
            }
            Opcode::CompareOp => {
                let symbol = instr.operator()?;
                let op = CompareOperator::from_symbol(symbol)
                    .ok_or_else(|| LambdaQueryError::UnknownOperator(symbol.to_string()))?;
                self.compare(op)
            }
            Opcode::ContainsOp => {
                let op = if instr.flag()? == 1 { CompareOperator::NotIn } else { CompareOperator::In };
                self.compare(op)
            }
            Opcode::IsOp => {
                let op = if instr.flag()? == 1 { CompareOperator::IsNot } else { CompareOperator::Is };
                self.compare(op)
            }
            Opcode::BinaryAdd => self.binary(BinOperator::Add),
            Opcode::BinarySubtract => self.binary(BinOperator::Sub),
            Opcode::BinaryMultiply => self.binary(BinOperator::Mult),
            Opcode::BinaryTrueDivide => self.binary(BinOperator::Div),
            Opcode::BinaryFloorDivide => self.binary(BinOperator::FloorDiv),
            Opcode::BinaryModulo => self.binary(BinOperator::Mod),
            Opcode::BinaryPower => self.binary(BinOperator::Pow),
            Opcode::BinaryOp => {
                let symbol = instr.operator()?;
                let op = BinOperator::from_symbol(symbol)
                    .ok_or_else(|| LambdaQueryError::UnknownOperator(symbol.to_string()))?;
                self.binary(op)
            }
            Opcode::UnaryNot => self.unary(UnaryOperator::Not),
            Opcode::UnaryNegative => self.unary(UnaryOperator::Neg),
            Opcode::BuildTuple => {
                let items = self.operands(instr.count()?)?;
                Ok(self.node(ExprKind::Tuple(items)))
            }
            Opcode::BuildList => {
                let items = self.operands(instr.count()?)?;
                Ok(self.node(ExprKind::List(items)))
            }
            Opcode::BuildConstKeyMap => {
                let count = instr.count()?;
                let keys = match self.visit()?.kind {
                    ExprKind::Tuple(keys) if keys.len() == count => keys,
                    _ => {
                        return Err(LambdaQueryError::MalformedClosure(format!(
                            "BUILD_CONST_KEY_MAP at offset {} expects a tuple of {} keys",
                            instr.offset, count
                        )))
                    }
                };
                let values = self.operands(count)?;
                Ok(self.node(ExprKind::Dict { keys, values }))
            }
            Opcode::BuildMap => {
                let count = instr.count()?;
                let mut keys = Vec::with_capacity(count);
                let mut values = Vec::with_capacity(count);
                for _ in 0..count {
                    values.push(self.visit()?);
                    keys.push(self.visit()?);
                }
                keys.reverse();
                values.reverse();
                Ok(self.node(ExprKind::Dict { keys, values }))
            }
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
            | Opcode::JumpForward
            | Opcode::JumpAbsolute
            | Opcode::JumpBackward
            | Opcode::ReturnValue
            | Opcode::Resume
            | Opcode::Nop
            | Opcode::Cache
            | Opcode::ExtendedArg => Err(LambdaQueryError::MalformedClosure(format!(
                "{} at offset {} cannot be an operand",
                instr.opname(),
                instr.offset
            ))),
            Opcode::Other(name) => Err(LambdaQueryError::UnsupportedOperation(name.clone())),
        }
    }

    fn constant(&mut self, value: ConstantValue) -> Expr {
        match value {
            ConstantValue::Tuple(items) => {
                let items = items.into_iter().map(|item| self.constant(item)).collect();
                self.node(ExprKind::Tuple(items))
            }
            scalar => self.node(ExprKind::Constant(scalar)),
        }
    }

    fn compare(&mut self, op: CompareOperator) -> Result<Expr, LambdaQueryError> {
        let right = self.visit()?;
        let left = self.visit()?;
        Ok(self.node(ExprKind::Compare { left: Box::new(left), op, right: Box::new(right) }))
    }

    fn binary(&mut self, op: BinOperator) -> Result<Expr, LambdaQueryError> {
        let right = self.visit()?;
        let left = self.visit()?;
        Ok(self.node(ExprKind::BinOp { left: Box::new(left), op, right: Box::new(right) }))
    }

    fn unary(&mut self, op: UnaryOperator) -> Result<Expr, LambdaQueryError> {
        let operand = self.visit()?;
        Ok(self.node(ExprKind::UnaryOp { op, operand: Box::new(operand) }))
    }

    /// Pops `count` operands and returns them in source order.
    fn operands(&mut self, count: usize) -> Result<Vec<Expr>, LambdaQueryError> {
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(self.visit()?);
        }
        items.reverse();
        Ok(items)
    }
}
