//! Translator module: derives the query representation of every AST node.
//!
//! Translation is a single bottom-up pass. Each node's QueryRepr is computed from
//! its children's representations and recorded in an Annotations side table keyed
//! by NodeId; the tree itself is never modified. The representation stays
//! structured until the root is serialized into one of two dialects: match
//! documents (`{"gpa": {"$gte": 10}}`) or aggregation expressions
//! (`{"$gte": ["$gpa", 10]}`).

use crate::ast::{BinOperator, BoolOperator, CompareOperator, Expr, ExprKind, ExprVisitor, LambdaExpr, NodeId, UnaryOperator};
use crate::model::CollectionModel;
use crate::LambdaQueryError;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use tracing::{debug, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOperator {
    And,
    Or,
    /// Negated disjunction, produced by `not` over a logical group.
    Nor,
}

impl LogicalOperator {
    pub fn token(&self) -> &'static str {
        match self {
            LogicalOperator::And => "$and",
            LogicalOperator::Or => "$or",
            LogicalOperator::Nor => "$nor",
        }
    }
}

impl From<BoolOperator> for LogicalOperator {
    fn from(op: BoolOperator) -> Self {
        match op {
            BoolOperator::And => LogicalOperator::And,
            BoolOperator::Or => LogicalOperator::Or,
        }
    }
}

pub fn compare_token(op: CompareOperator) -> &'static str {
    match op {
        CompareOperator::Eq | CompareOperator::Is => "$eq",
        CompareOperator::NotEq | CompareOperator::IsNot => "$ne",
        CompareOperator::Lt => "$lt",
        CompareOperator::LtE => "$lte",
        CompareOperator::Gt => "$gt",
        CompareOperator::GtE => "$gte",
        CompareOperator::In => "$in",
        CompareOperator::NotIn => "$nin",
    }
}

pub fn arithmetic_token(op: BinOperator) -> Result<&'static str, LambdaQueryError> {
    match op {
        BinOperator::Add => Ok("$add"),
        BinOperator::Sub => Ok("$subtract"),
        BinOperator::Mult => Ok("$multiply"),
        BinOperator::Div => Ok("$divide"),
        BinOperator::Mod => Ok("$mod"),
        BinOperator::FloorDiv | BinOperator::Pow => Err(LambdaQueryError::UnknownOperator(op.symbol().to_string())),
    }
}

pub const NOT_TOKEN: &str = "$not";

/// Structured query representation of a subtree.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryRepr {
    /// Document field path.
    Field(String),
    Literal(Value),
    /// `field <op> value`, optionally negated.
    Predicate {
        field: String,
        op: CompareOperator,
        value: Value,
        negated: bool,
    },
    Logical {
        op: LogicalOperator,
        terms: Vec<QueryRepr>,
    },
    Arithmetic {
        token: &'static str,
        operands: Vec<QueryRepr>,
    },
    Conditional {
        test: Box<QueryRepr>,
        then: Box<QueryRepr>,
        otherwise: Box<QueryRepr>,
    },
}

impl QueryRepr {
    /// Whether the representation can stand alone as a filter.
    pub fn is_predicate(&self) -> bool {
        match self {
            QueryRepr::Predicate { .. } => true,
            QueryRepr::Logical { terms, .. } => terms.iter().all(QueryRepr::is_predicate),
            _ => false,
        }
    }

    pub fn as_field(&self) -> Option<&str> {
        match self {
            QueryRepr::Field(path) => Some(path),
            _ => None,
        }
    }

    /// Renders a match document. Arithmetic and conditional terms are wrapped in `$expr`.
    pub fn to_query_document(&self) -> Result<Value, LambdaQueryError> {
        match self {
            QueryRepr::Predicate { field, op, value, negated } => {
                let mut condition = Map::new();
                condition.insert(compare_token(*op).to_string(), value.clone());
                let condition = if *negated { json!({ NOT_TOKEN: condition }) } else { Value::Object(condition) };
                let mut doc = Map::new();
                doc.insert(field.clone(), condition);
                Ok(Value::Object(doc))
            }
            QueryRepr::Logical { op, terms } => {
                let terms = terms.iter().map(QueryRepr::to_query_document).collect::<Result<Vec<_>, _>>()?;
                Ok(json!({ op.token(): terms }))
            }
            QueryRepr::Arithmetic { .. } | QueryRepr::Conditional { .. } => Ok(json!({ "$expr": self.to_expression() })),
            QueryRepr::Field(path) => {
                Err(LambdaQueryError::UnsupportedExpression(format!("field '{}' is not a predicate", path)))
            }
            QueryRepr::Literal(value) => {
                Err(LambdaQueryError::UnsupportedExpression(format!("literal {} is not a predicate", value)))
            }
        }
    }

    /// Renders an aggregation expression; fields become `$`-prefixed references.
    pub fn to_expression(&self) -> Value {
        match self {
            QueryRepr::Field(path) => Value::String(format!("${}", path)),
            QueryRepr::Literal(value) => value.clone(),
            QueryRepr::Predicate { field, op, value, negated } => {
                let field = Value::String(format!("${}", field));
                let comparison = match op {
                    CompareOperator::NotIn => json!({ NOT_TOKEN: [{ "$in": [field, value] }] }),
                    _ => json!({ compare_token(*op): [field, value] }),
                };
                if *negated {
                    json!({ NOT_TOKEN: [comparison] })
                } else {
                    comparison
                }
            }
            QueryRepr::Logical { op: LogicalOperator::Nor, terms } => {
                let terms: Vec<Value> = terms.iter().map(QueryRepr::to_expression).collect();
                json!({ NOT_TOKEN: [{ "$or": terms }] })
            }
            QueryRepr::Logical { op, terms } => {
                let terms: Vec<Value> = terms.iter().map(QueryRepr::to_expression).collect();
                json!({ op.token(): terms })
            }
            QueryRepr::Arithmetic { token, operands } => {
                let operands: Vec<Value> = operands.iter().map(QueryRepr::to_expression).collect();
                json!({ *token: operands })
            }
            QueryRepr::Conditional { test, then, otherwise } => json!({
                "$cond": {
                    "if": test.to_expression(),
                    "then": then.to_expression(),
                    "else": otherwise.to_expression(),
                }
            }),
        }
    }
}

/// Side table of derived representations.
#[derive(Debug, Clone, Default)]
pub struct Annotations {
    reprs: HashMap<NodeId, QueryRepr>,
}

impl Annotations {
    pub fn get(&self, id: NodeId) -> Option<&QueryRepr> {
        self.reprs.get(&id)
    }

    pub fn len(&self) -> usize {
        self.reprs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reprs.is_empty()
    }

    fn record(&mut self, id: NodeId, repr: Option<QueryRepr>) -> Option<QueryRepr> {
        if let Some(repr) = &repr {
            self.reprs.insert(id, repr.clone());
        }
        repr
    }
}

/// A decompiled closure together with its derived representations.
#[derive(Debug, Clone)]
pub struct ExpressionTree {
    lambda: LambdaExpr,
    annotations: Annotations,
}

impl ExpressionTree {
    pub fn root(&self) -> &LambdaExpr {
        &self.lambda
    }

    /// The returned expression.
    pub fn body(&self) -> &Expr {
        self.lambda.expr()
    }

    /// Representation of the whole closure, if its body has one.
    pub fn representation(&self) -> Option<&QueryRepr> {
        self.annotations.get(self.lambda.id)
    }

    pub fn representation_of(&self, id: NodeId) -> Option<&QueryRepr> {
        self.annotations.get(id)
    }

    pub fn annotations(&self) -> &Annotations {
        &self.annotations
    }

    pub fn to_query_document(&self) -> Result<Value, LambdaQueryError> {
        self.require_representation()?.to_query_document()
    }

    pub fn to_expression(&self) -> Result<Value, LambdaQueryError> {
        Ok(self.require_representation()?.to_expression())
    }

    fn require_representation(&self) -> Result<&QueryRepr, LambdaQueryError> {
        self.representation().ok_or_else(|| {
            LambdaQueryError::UnsupportedExpression(format!(
                "{} body has no query representation",
                self.body().variant_name()
            ))
        })
    }
}

pub struct Translator<'m> {
    model: Option<&'m CollectionModel>,
    annotations: Annotations,
}

impl<'m> Translator<'m> {
    pub fn new(model: Option<&'m CollectionModel>) -> Self {
        Self { model, annotations: Annotations::default() }
    }

    /// Annotates every node of `lambda`, children before parents.
    #[instrument(level = "trace", skip(self, lambda), fields(body = %lambda.expr()))]
    pub fn translate(mut self, lambda: LambdaExpr) -> Result<ExpressionTree, LambdaQueryError> {
        let repr = self.visit(lambda.expr())?;
        let repr = self.annotations.record(lambda.body.id, repr);
        self.annotations.record(lambda.id, repr);
        debug!(annotated = self.annotations.len(), "translated closure");
        Ok(ExpressionTree { lambda, annotations: self.annotations })
    }

    fn field(&self, path: String) -> String {
        match self.model {
            Some(model) => model.resolve_path(&path),
            None => path,
        }
    }

    fn translate_node(&mut self, expr: &Expr) -> Result<Option<QueryRepr>, LambdaQueryError> {
        match &expr.kind {
            ExprKind::Name(_) => Ok(None),
            ExprKind::Constant(value) => Ok(Some(QueryRepr::Literal(value.to_json()))),
            ExprKind::Attribute { value, .. } => {
                self.visit(value)?;
                let path = expr.attribute_path().ok_or_else(|| {
                    LambdaQueryError::UnsupportedExpression(format!("attribute of a non-parameter in {}", expr))
                })?;
                Ok(Some(QueryRepr::Field(self.field(path))))
            }
            ExprKind::Tuple(items) | ExprKind::List(items) => {
                let mut literals = Vec::with_capacity(items.len());
                for item in items {
                    match self.visit(item)? {
                        Some(QueryRepr::Literal(value)) => literals.push(value),
                        _ => return Ok(None),
                    }
                }
                Ok(Some(QueryRepr::Literal(Value::Array(literals))))
            }
            ExprKind::Dict { keys, values } => {
                for item in keys.iter().chain(values) {
                    self.visit(item)?;
                }
                Ok(None)
            }
            ExprKind::Compare { left, op, right } => {
                let l = self.visit(left)?;
                let r = self.visit(right)?;
                let predicate = match (l, r) {
                    (Some(QueryRepr::Field(field)), Some(QueryRepr::Literal(value))) => {
                        QueryRepr::Predicate { field, op: *op, value, negated: false }
                    }
                    (Some(QueryRepr::Literal(value)), Some(QueryRepr::Field(field))) => {
                        let mirrored = op.mirrored().ok_or_else(|| {
                            LambdaQueryError::UnsupportedExpression(format!("cannot mirror '{}' in {}", op.symbol(), expr))
                        })?;
                        QueryRepr::Predicate { field, op: mirrored, value, negated: false }
                    }
                    _ => {
                        return Err(LambdaQueryError::UnsupportedExpression(format!(
                            "comparison needs a field and a literal: {}",
                            expr
                        )))
                    }
                };
                Ok(Some(predicate))
            }
            ExprKind::BoolOp { op, values } => {
                let op = LogicalOperator::from(*op);
                let mut terms = Vec::with_capacity(values.len());
                for value in values {
                    if let ExprKind::Name(name) = &value.kind {
                        return Err(LambdaQueryError::MalformedClosure(format!(
                            "bare name '{}' used as a boolean operand",
                            name
                        )));
                    }
                    match self.visit(value)? {
                        Some(QueryRepr::Logical { op: inner, terms: nested }) if inner == op => terms.extend(nested),
                        Some(term) => terms.push(term),
                        None => {
                            return Err(LambdaQueryError::UnsupportedExpression(format!(
                                "{} operand of '{}' has no query representation",
                                value.variant_name(),
                                op.token()
                            )))
                        }
                    }
                }
                Ok(Some(QueryRepr::Logical { op, terms }))
            }
            ExprKind::BinOp { left, op, right } => {
                let token = arithmetic_token(*op)?;
                let mut operands = Vec::with_capacity(2);
                for operand in [left, right] {
                    match self.visit(operand)? {
                        Some(repr) => operands.push(repr),
                        None => {
                            return Err(LambdaQueryError::UnsupportedExpression(format!(
                                "{} operand of '{}' has no query representation",
                                operand.variant_name(),
                                token
                            )))
                        }
                    }
                }
                Ok(Some(QueryRepr::Arithmetic { token, operands }))
            }
            ExprKind::UnaryOp { op: UnaryOperator::Neg, operand } => {
                self.visit(operand)?;
                Err(LambdaQueryError::UnknownOperator(UnaryOperator::Neg.symbol().to_string()))
            }
            ExprKind::UnaryOp { op: UnaryOperator::Not, operand } => match self.visit(operand)? {
                Some(QueryRepr::Predicate { field, op, value, negated }) => {
                    Ok(Some(QueryRepr::Predicate { field, op, value, negated: !negated }))
                }
                Some(group @ QueryRepr::Logical { .. }) => {
                    Ok(Some(QueryRepr::Logical { op: LogicalOperator::Nor, terms: vec![group] }))
                }
                _ => Err(LambdaQueryError::UnsupportedExpression(format!("cannot negate {}", operand))),
            },
            ExprKind::IfExp { test, body, orelse } => {
                let mut parts = Vec::with_capacity(3);
                for part in [test, body, orelse] {
                    let repr = self.visit(part)?.ok_or_else(|| {
                        LambdaQueryError::UnsupportedExpression(format!(
                            "{} in conditional has no query representation",
                            part.variant_name()
                        ))
                    })?;
                    parts.push(Box::new(repr));
                }
                let otherwise = parts.pop();
                let then = parts.pop();
                let test = parts.pop();
                match (test, then, otherwise) {
                    (Some(test), Some(then), Some(otherwise)) => Ok(Some(QueryRepr::Conditional { test, then, otherwise })),
                    _ => Err(LambdaQueryError::MalformedClosure(format!("incomplete conditional {}", expr))),
                }
            }
        }
    }
}

impl ExprVisitor for Translator<'_> {
    type Output = Result<Option<QueryRepr>, LambdaQueryError>;

    fn visit(&mut self, expr: &Expr) -> Self::Output {
        let repr = self.translate_node(expr)?;
        Ok(self.annotations.record(expr.id, repr))
    }
}
