//! AST module: the closure-expression tree rebuilt by the decompiler.
//!
//! This module provides the Expr node type, the operator enums and the Lambda/Return
//! wrappers. Every node carries a NodeId so derived data can live in side tables.

use crate::types::ConstantValue;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a node, unique within one tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

/// Hands out fresh NodeIds in allocation order.
#[derive(Debug, Default)]
pub struct NodeIdGen {
    next: u32,
}

impl NodeIdGen {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fresh(&mut self) -> NodeId {
        let id = NodeId(self.next);
        self.next += 1;
        id
    }

    pub fn allocated(&self) -> usize {
        self.next as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareOperator {
    Eq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    In,
    NotIn,
    Is,
    IsNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinOperator {
    Add,
    Sub,
    Mult,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOperator {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BoolOperator {
    And,
    Or,
}

impl CompareOperator {
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        Some(match symbol {
            "==" => CompareOperator::Eq,
            "!=" => CompareOperator::NotEq,
            "<" => CompareOperator::Lt,
            "<=" => CompareOperator::LtE,
            ">" => CompareOperator::Gt,
            ">=" => CompareOperator::GtE,
            "in" => CompareOperator::In,
            "not in" => CompareOperator::NotIn,
            "is" => CompareOperator::Is,
            "is not" => CompareOperator::IsNot,
            _ => return None,
        })
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            CompareOperator::Eq => "==",
            CompareOperator::NotEq => "!=",
            CompareOperator::Lt => "<",
            CompareOperator::LtE => "<=",
            CompareOperator::Gt => ">",
            CompareOperator::GtE => ">=",
            CompareOperator::In => "in",
            CompareOperator::NotIn => "not in",
            CompareOperator::Is => "is",
            CompareOperator::IsNot => "is not",
        }
    }

    /// The operator that gives the same result with its operands swapped.
    pub fn mirrored(&self) -> Option<Self> {
        match self {
            CompareOperator::Lt => Some(CompareOperator::Gt),
            CompareOperator::LtE => Some(CompareOperator::GtE),
            CompareOperator::Gt => Some(CompareOperator::Lt),
            CompareOperator::GtE => Some(CompareOperator::LtE),
            CompareOperator::In | CompareOperator::NotIn => None,
            symmetric => Some(*symmetric),
        }
    }
}

impl BinOperator {
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        Some(match symbol {
            "+" => BinOperator::Add,
            "-" => BinOperator::Sub,
            "*" => BinOperator::Mult,
            "/" => BinOperator::Div,
            "//" => BinOperator::FloorDiv,
            "%" => BinOperator::Mod,
            "**" => BinOperator::Pow,
            _ => return None,
        })
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            BinOperator::Add => "+",
            BinOperator::Sub => "-",
            BinOperator::Mult => "*",
            BinOperator::Div => "/",
            BinOperator::FloorDiv => "//",
            BinOperator::Mod => "%",
            BinOperator::Pow => "**",
        }
    }
}

impl UnaryOperator {
    pub fn symbol(&self) -> &'static str {
        match self {
            UnaryOperator::Not => "not",
            UnaryOperator::Neg => "-",
        }
    }
}

impl BoolOperator {
    pub fn symbol(&self) -> &'static str {
        match self {
            BoolOperator::And => "and",
            BoolOperator::Or => "or",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expr {
    pub id: NodeId,
    pub kind: ExprKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ExprKind {
    /// Parameter or global reference.
    Name(String),
    Attribute {
        value: Box<Expr>,
        attr: String,
    },
    Constant(ConstantValue),
    Tuple(Vec<Expr>),
    List(Vec<Expr>),
    Dict {
        keys: Vec<Expr>,
        values: Vec<Expr>,
    },
    Compare {
        left: Box<Expr>,
        op: CompareOperator,
        right: Box<Expr>,
    },
    /// Flattened: an operand never is a BoolOp with the same operator.
    BoolOp {
        op: BoolOperator,
        values: Vec<Expr>,
    },
    BinOp {
        left: Box<Expr>,
        op: BinOperator,
        right: Box<Expr>,
    },
    UnaryOp {
        op: UnaryOperator,
        operand: Box<Expr>,
    },
    IfExp {
        test: Box<Expr>,
        body: Box<Expr>,
        orelse: Box<Expr>,
    },
}

impl Expr {
    pub fn new(id: NodeId, kind: ExprKind) -> Self {
        Self { id, kind }
    }

    /// Builds a BoolOp, splicing operands that already use the same operator.
    pub fn bool_op(id: NodeId, op: BoolOperator, operands: Vec<Expr>) -> Self {
        let mut values = Vec::with_capacity(operands.len());
        for operand in operands {
            match operand.kind {
                ExprKind::BoolOp { op: inner, values: nested } if inner == op => values.extend(nested),
                kind => values.push(Expr::new(operand.id, kind)),
            }
        }
        Expr::new(id, ExprKind::BoolOp { op, values })
    }

    pub fn variant_name(&self) -> &'static str {
        match &self.kind {
            ExprKind::Name(_) => "Name",
            ExprKind::Attribute { .. } => "Attribute",
            ExprKind::Constant(_) => "Constant",
            ExprKind::Tuple(_) => "Tuple",
            ExprKind::List(_) => "List",
            ExprKind::Dict { .. } => "Dict",
            ExprKind::Compare { .. } => "Compare",
            ExprKind::BoolOp { .. } => "BoolOp",
            ExprKind::BinOp { .. } => "BinOp",
            ExprKind::UnaryOp { .. } => "UnaryOp",
            ExprKind::IfExp { .. } => "IfExp",
        }
    }

    /// Dotted path of an attribute chain rooted at a Name (`x.a.b` ⇒ `a.b`).
    pub fn attribute_path(&self) -> Option<String> {
        match &self.kind {
            ExprKind::Attribute { value, attr } => match &value.kind {
                ExprKind::Name(_) => Some(attr.clone()),
                _ => value.attribute_path().map(|base| format!("{}.{}", base, attr)),
            },
            _ => None,
        }
    }

    pub fn as_constant(&self) -> Option<&ConstantValue> {
        match &self.kind {
            ExprKind::Constant(value) => Some(value),
            _ => None,
        }
    }

    /// Direct children in evaluation order.
    pub fn children(&self) -> Vec<&Expr> {
        match &self.kind {
            ExprKind::Name(_) | ExprKind::Constant(_) => Vec::new(),
            ExprKind::Attribute { value, .. } => vec![value.as_ref()],
            ExprKind::Tuple(items) | ExprKind::List(items) => items.iter().collect(),
            ExprKind::Dict { keys, values } => keys.iter().zip(values).flat_map(|(k, v)| [k, v]).collect(),
            ExprKind::Compare { left, right, .. } | ExprKind::BinOp { left, right, .. } => vec![left.as_ref(), right.as_ref()],
            ExprKind::BoolOp { values, .. } => values.iter().collect(),
            ExprKind::UnaryOp { operand, .. } => vec![operand.as_ref()],
            ExprKind::IfExp { test, body, orelse } => vec![test.as_ref(), body.as_ref(), orelse.as_ref()],
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join(f: &mut fmt::Formatter<'_>, items: &[Expr], sep: &str) -> fmt::Result {
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    f.write_str(sep)?;
                }
                write!(f, "{}", item)?;
            }
            Ok(())
        }
        match &self.kind {
            ExprKind::Name(name) => f.write_str(name),
            ExprKind::Attribute { value, attr } => write!(f, "{}.{}", value, attr),
            ExprKind::Constant(value) => write!(f, "{}", value),
            ExprKind::Tuple(items) => {
                f.write_str("(")?;
                join(f, items, ", ")?;
                if items.len() == 1 {
                    f.write_str(",")?;
                }
                f.write_str(")")
            }
            ExprKind::List(items) => {
                f.write_str("[")?;
                join(f, items, ", ")?;
                f.write_str("]")
            }
            ExprKind::Dict { keys, values } => {
                f.write_str("{")?;
                for (i, (k, v)) in keys.iter().zip(values).enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                f.write_str("}")
            }
            ExprKind::Compare { left, op, right } => write!(f, "{} {} {}", left, op.symbol(), right),
            ExprKind::BoolOp { op, values } => {
                f.write_str("(")?;
                join(f, values, &format!(" {} ", op.symbol()))?;
                f.write_str(")")
            }
            ExprKind::BinOp { left, op, right } => write!(f, "({} {} {})", left, op.symbol(), right),
            ExprKind::UnaryOp { op: UnaryOperator::Not, operand } => write!(f, "not {}", operand),
            ExprKind::UnaryOp { op: UnaryOperator::Neg, operand } => write!(f, "-{}", operand),
            ExprKind::IfExp { test, body, orelse } => write!(f, "({} if {} else {})", body, test, orelse),
        }
    }
}

/// The `return <expr>` statement forming a lambda body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReturnStmt {
    pub id: NodeId,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LambdaExpr {
    pub id: NodeId,
    pub params: Vec<String>,
    pub vararg: Option<String>,
    pub kwarg: Option<String>,
    pub body: ReturnStmt,
}

impl LambdaExpr {
    /// The returned expression.
    pub fn expr(&self) -> &Expr {
        &self.body.value
    }
}

impl fmt::Display for LambdaExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut params = self.params.clone();
        if let Some(vararg) = &self.vararg {
            params.push(format!("*{}", vararg));
        }
        if let Some(kwarg) = &self.kwarg {
            params.push(format!("**{}", kwarg));
        }
        write!(f, "lambda {}: {}", params.join(", "), self.body.value)
    }
}

// Visitor trait for traversing the AST
pub trait ExprVisitor {
    type Output;

    fn visit(&mut self, expr: &Expr) -> Self::Output;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(ids: &mut NodeIdGen, n: &str) -> Expr {
        Expr::new(ids.fresh(), ExprKind::Name(n.to_string()))
    }

    fn attr(ids: &mut NodeIdGen, base: Expr, a: &str) -> Expr {
        Expr::new(ids.fresh(), ExprKind::Attribute { value: Box::new(base), attr: a.to_string() })
    }

    #[test]
    fn test_operator_symbols() {
        for symbol in ["==", "!=", "<", "<=", ">", ">=", "in", "not in", "is", "is not"] {
            let op = CompareOperator::from_symbol(symbol).unwrap();
            assert_eq!(op.symbol(), symbol);
        }
        for symbol in ["+", "-", "*", "/", "//", "%", "**"] {
            assert_eq!(BinOperator::from_symbol(symbol).unwrap().symbol(), symbol);
        }
        assert_eq!(CompareOperator::from_symbol("<>"), None);
        assert_eq!(BinOperator::from_symbol("@"), None);
    }

    #[test]
    fn test_mirrored_comparisons() {
        assert_eq!(CompareOperator::Lt.mirrored(), Some(CompareOperator::Gt));
        assert_eq!(CompareOperator::GtE.mirrored(), Some(CompareOperator::LtE));
        assert_eq!(CompareOperator::Eq.mirrored(), Some(CompareOperator::Eq));
        assert_eq!(CompareOperator::In.mirrored(), None);
    }

    #[test]
    fn test_bool_op_flattens_same_operator() {
        let mut ids = NodeIdGen::new();
        let a = name(&mut ids, "a");
        let b = name(&mut ids, "b");
        let c = name(&mut ids, "c");
        let inner = Expr::bool_op(ids.fresh(), BoolOperator::And, vec![a, b]);
        let outer = Expr::bool_op(ids.fresh(), BoolOperator::And, vec![inner, c]);
        match &outer.kind {
            ExprKind::BoolOp { op, values } => {
                assert_eq!(*op, BoolOperator::And);
                assert_eq!(values.len(), 3);
            }
            _ => panic!("Expected BoolOp"),
        }
    }

    #[test]
    fn test_bool_op_keeps_mixed_nesting() {
        let mut ids = NodeIdGen::new();
        let a = name(&mut ids, "a");
        let b = name(&mut ids, "b");
        let c = name(&mut ids, "c");
        let inner = Expr::bool_op(ids.fresh(), BoolOperator::And, vec![a, b]);
        let outer = Expr::bool_op(ids.fresh(), BoolOperator::Or, vec![inner, c]);
        assert_eq!(outer.to_string(), "((a and b) or c)");
    }

    #[test]
    fn test_attribute_path() {
        let mut ids = NodeIdGen::new();
        let x = name(&mut ids, "x");
        let address = attr(&mut ids, x, "address");
        let city = attr(&mut ids, address, "city");
        assert_eq!(city.attribute_path().as_deref(), Some("address.city"));
        assert_eq!(name(&mut ids, "x").attribute_path(), None);
        assert_eq!(ids.allocated(), 4);
    }

    #[test]
    fn test_lambda_display() {
        let mut ids = NodeIdGen::new();
        let x = name(&mut ids, "x");
        let gpa = attr(&mut ids, x, "gpa");
        let ten = Expr::new(ids.fresh(), ExprKind::Constant(ConstantValue::Int(10)));
        let cmp = Expr::new(
            ids.fresh(),
            ExprKind::Compare { left: Box::new(gpa), op: CompareOperator::GtE, right: Box::new(ten) },
        );
        let lambda = LambdaExpr {
            id: ids.fresh(),
            params: vec!["x".to_string()],
            vararg: Some("args".to_string()),
            kwarg: None,
            body: ReturnStmt { id: ids.fresh(), value: cmp },
        };
        assert_eq!(lambda.to_string(), "lambda x, *args: x.gpa >= 10");
        assert_eq!(lambda.expr().variant_name(), "Compare");
        assert_eq!(lambda.expr().children().len(), 2);
    }
}
