//! Pipeline module: aggregation stage descriptors and the builders that read compiled closures.
//!
//! Filters read the translator's representation of the closure root. Projections,
//! sort keys and grouping keys inspect the body's node variant and read field paths
//! off the annotated children.

use crate::ast::{Expr, ExprKind};
use crate::translator::ExpressionTree;
use crate::LambdaQueryError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

impl SortDirection {
    pub fn value(&self) -> i64 {
        match self {
            SortDirection::Ascending => 1,
            SortDirection::Descending => -1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    pub direction: SortDirection,
}

impl SortKey {
    /// A sort key from a selector whose body is an attribute access.
    pub fn from_tree(tree: &ExpressionTree, direction: SortDirection) -> Result<Self, LambdaQueryError> {
        let body = tree.body();
        match &body.kind {
            ExprKind::Attribute { .. } => Ok(SortKey { field: field_of(tree, body)?, direction }),
            _ => Err(LambdaQueryError::UnsupportedProjection(format!(
                "sort key must select a field, got {}",
                body.variant_name()
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Accumulator {
    Max,
    Min,
    Sum,
    Avg,
    Push,
}

impl Accumulator {
    pub fn token(&self) -> &'static str {
        match self {
            Accumulator::Max => "$max",
            Accumulator::Min => "$min",
            Accumulator::Sum => "$sum",
            Accumulator::Avg => "$avg",
            Accumulator::Push => "$push",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "$max" => Some(Accumulator::Max),
            "$min" => Some(Accumulator::Min),
            "$sum" => Some(Accumulator::Sum),
            "$avg" => Some(Accumulator::Avg),
            "$push" => Some(Accumulator::Push),
            _ => None,
        }
    }
}

/// One computed output field of a `$group` stage.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupField {
    pub name: String,
    pub accumulator: Accumulator,
    pub expression: Value,
}

/// One aggregation pipeline stage.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Match(Value),
    Project(Map<String, Value>),
    Sort(Vec<SortKey>),
    Group { key: Value, fields: Vec<GroupField> },
    Limit(u64),
    Skip(u64),
    /// Replaces the documents with one document holding their count under this name.
    Count(String),
}

impl Stage {
    /// A `$match` stage from a predicate closure.
    pub fn filter(tree: &ExpressionTree) -> Result<Stage, LambdaQueryError> {
        let stage = Stage::Match(tree.to_query_document()?);
        debug!(stage = %stage.to_document(), "built filter stage");
        Ok(stage)
    }

    /// `{"$group": {"_id": null, "value": {<accumulator>: "$field"}}}`.
    pub fn scalar(accumulator: Accumulator, field: &str) -> Stage {
        Stage::Group {
            key: Value::Null,
            fields: vec![GroupField {
                name: "value".to_string(),
                accumulator,
                expression: Value::String(format!("${}", field)),
            }],
        }
    }

    /// Groups whole documents under the key the selector produces.
    pub fn group_by(tree: &ExpressionTree) -> Result<Stage, LambdaQueryError> {
        let key = match Projection::from_tree(tree)? {
            Projection::Identity => {
                return Err(LambdaQueryError::UnsupportedProjection("grouping key must select fields, got Name".to_string()))
            }
            Projection::Field(field) => Value::String(format!("${}", field)),
            Projection::Positional(fields) => {
                Value::Object(fields.into_iter().map(|field| (field.clone(), Value::String(format!("${}", field)))).collect())
            }
            Projection::Keyed(entries) => Value::Object(entries.into_iter().collect()),
        };
        let stage = Stage::Group {
            key,
            fields: vec![GroupField {
                name: "items".to_string(),
                accumulator: Accumulator::Push,
                expression: Value::String("$$ROOT".to_string()),
            }],
        };
        debug!(stage = %stage.to_document(), "built group stage");
        Ok(stage)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Match(_) => "$match",
            Stage::Project(_) => "$project",
            Stage::Sort(_) => "$sort",
            Stage::Group { .. } => "$group",
            Stage::Limit(_) => "$limit",
            Stage::Skip(_) => "$skip",
            Stage::Count(_) => "$count",
        }
    }

    pub fn to_document(&self) -> Value {
        let body = match self {
            Stage::Match(doc) => doc.clone(),
            Stage::Project(spec) => Value::Object(spec.clone()),
            Stage::Sort(keys) => {
                Value::Object(keys.iter().map(|key| (key.field.clone(), json!(key.direction.value()))).collect())
            }
            Stage::Group { key, fields } => {
                let mut group = Map::new();
                group.insert("_id".to_string(), key.clone());
                for field in fields {
                    group.insert(field.name.clone(), json!({ field.accumulator.token(): field.expression }));
                }
                Value::Object(group)
            }
            Stage::Limit(n) | Stage::Skip(n) => json!(n),
            Stage::Count(name) => Value::String(name.clone()),
        };
        json!({ self.name(): body })
    }

    /// Reads a stage back from its document form.
    pub fn from_document(doc: &Value) -> Result<Stage, LambdaQueryError> {
        let (name, body) = match doc.as_object() {
            Some(map) if map.len() == 1 => match map.iter().next() {
                Some(entry) => entry,
                None => return Err(invalid_stage(doc)),
            },
            _ => return Err(invalid_stage(doc)),
        };
        match name.as_str() {
            "$match" if body.is_object() => Ok(Stage::Match(body.clone())),
            "$project" => body.as_object().map(|spec| Stage::Project(spec.clone())).ok_or_else(|| invalid_stage(doc)),
            "$sort" => {
                let spec = body.as_object().ok_or_else(|| invalid_stage(doc))?;
                let mut keys = Vec::with_capacity(spec.len());
                for (field, direction) in spec {
                    let direction = match direction.as_i64() {
                        Some(1) => SortDirection::Ascending,
                        Some(-1) => SortDirection::Descending,
                        _ => return Err(invalid_stage(doc)),
                    };
                    keys.push(SortKey { field: field.clone(), direction });
                }
                Ok(Stage::Sort(keys))
            }
            "$group" => {
                let spec = body.as_object().ok_or_else(|| invalid_stage(doc))?;
                let key = spec.get("_id").cloned().ok_or_else(|| invalid_stage(doc))?;
                let mut fields = Vec::new();
                for (name, value) in spec.iter().filter(|(name, _)| name.as_str() != "_id") {
                    let (token, expression) = match value.as_object() {
                        Some(acc) if acc.len() == 1 => match acc.iter().next() {
                            Some(entry) => entry,
                            None => return Err(invalid_stage(doc)),
                        },
                        _ => return Err(invalid_stage(doc)),
                    };
                    let accumulator = Accumulator::from_token(token)
                        .ok_or_else(|| LambdaQueryError::ExecutionError(format!("unknown accumulator '{}'", token)))?;
                    fields.push(GroupField { name: name.clone(), accumulator, expression: expression.clone() });
                }
                Ok(Stage::Group { key, fields })
            }
            "$limit" => body.as_u64().map(Stage::Limit).ok_or_else(|| invalid_stage(doc)),
            "$skip" => body.as_u64().map(Stage::Skip).ok_or_else(|| invalid_stage(doc)),
            "$count" => match body.as_str() {
                Some(name) if !name.is_empty() && !name.starts_with('$') => Ok(Stage::Count(name.to_string())),
                _ => Err(invalid_stage(doc)),
            },
            "$match" => Err(invalid_stage(doc)),
            other => Err(LambdaQueryError::ExecutionError(format!("unknown stage '{}'", other))),
        }
    }
}

fn invalid_stage(doc: &Value) -> LambdaQueryError {
    LambdaQueryError::ExecutionError(format!("invalid stage document {}", doc))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProjectionOptions {
    /// Keep the document `_id` in projected output.
    pub include_id: bool,
}

/// The shape of a selector closure.
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    /// `lambda x: x`
    Identity,
    /// `lambda x: x.a`
    Field(String),
    /// `lambda x: (x.a, x.b)` or a list of attributes.
    Positional(Vec<String>),
    /// `lambda x: {"a": x.a, "total": x.price * x.quantity}`; values are aggregation expressions.
    Keyed(Vec<(String, Value)>),
}

impl Projection {
    /// Classifies a selector by the node variant of its body.
    pub fn from_tree(tree: &ExpressionTree) -> Result<Projection, LambdaQueryError> {
        let body = tree.body();
        match &body.kind {
            ExprKind::Name(_) => Ok(Projection::Identity),
            ExprKind::Attribute { .. } => Ok(Projection::Field(field_of(tree, body)?)),
            ExprKind::Tuple(items) | ExprKind::List(items) => {
                let mut fields = Vec::with_capacity(items.len());
                for item in items {
                    match &item.kind {
                        ExprKind::Attribute { .. } => {
                            let field = field_of(tree, item)?;
                            // Output documents are keyed by field path, so a repeat would collapse.
                            if fields.contains(&field) {
                                return Err(LambdaQueryError::UnsupportedProjection(format!(
                                    "field '{}' selected twice in {} projection",
                                    field,
                                    body.variant_name()
                                )));
                            }
                            fields.push(field);
                        }
                        _ => {
                            return Err(LambdaQueryError::UnsupportedProjection(format!(
                                "{} element in {} projection",
                                item.variant_name(),
                                body.variant_name()
                            )))
                        }
                    }
                }
                Ok(Projection::Positional(fields))
            }
            ExprKind::Dict { keys, values } => {
                let mut entries = Vec::with_capacity(keys.len());
                for (key, value) in keys.iter().zip(values) {
                    let name = key.as_constant().and_then(|c| c.as_str()).ok_or_else(|| {
                        LambdaQueryError::UnsupportedProjection(format!("projection key must be a string, got {}", key))
                    })?;
                    match &value.kind {
                        ExprKind::Attribute { .. } | ExprKind::BinOp { .. } => {
                            let repr = tree.representation_of(value.id).ok_or_else(|| {
                                LambdaQueryError::UnsupportedProjection(format!("value of '{}' has no representation", name))
                            })?;
                            entries.push((name.to_string(), repr.to_expression()));
                        }
                        _ => {
                            return Err(LambdaQueryError::UnsupportedProjection(format!(
                                "{} value for key '{}'",
                                value.variant_name(),
                                name
                            )))
                        }
                    }
                }
                Ok(Projection::Keyed(entries))
            }
            _ => Err(LambdaQueryError::UnsupportedProjection(format!("cannot project {} node", body.variant_name()))),
        }
    }

    /// The `$project` stage for this shape; identity selectors need none.
    pub fn stage(&self, options: ProjectionOptions) -> Option<Stage> {
        let mut spec = Map::new();
        spec.insert("_id".to_string(), json!(if options.include_id { 1 } else { 0 }));
        match self {
            Projection::Identity => return None,
            Projection::Field(field) => {
                spec.insert(field.clone(), Value::String(format!("${}", field)));
            }
            Projection::Positional(fields) => {
                for field in fields {
                    spec.insert(field.clone(), Value::String(format!("${}", field)));
                }
            }
            Projection::Keyed(entries) => {
                for (name, expr) in entries {
                    spec.insert(name.clone(), expr.clone());
                }
            }
        }
        let stage = Stage::Project(spec);
        debug!(stage = %stage.to_document(), "built projection stage");
        Some(stage)
    }
}

fn field_of(tree: &ExpressionTree, expr: &Expr) -> Result<String, LambdaQueryError> {
    tree.representation_of(expr.id)
        .and_then(|repr| repr.as_field())
        .map(str::to_string)
        .ok_or_else(|| LambdaQueryError::UnsupportedProjection(format!("{} does not select a field", expr)))
}
