//! Memory module: an in-memory executor for aggregation pipelines over JSON documents.
//!
//! Match documents and aggregation expressions are compiled once per stage into boxed
//! closures; unknown operators are rejected while compiling, so evaluating a compiled
//! stage never fails. Missing fields and operands of the wrong type evaluate to `null`.

use crate::pipeline::{Accumulator, SortDirection, SortKey, Stage};
use crate::query::{Documents, Executor};
use crate::LambdaQueryError;
use serde_json::{Map, Number, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::{debug, trace};

type Matcher = Box<dyn Fn(&Value) -> bool + Send + Sync + 'static>;
type Evaluator = Box<dyn Fn(&Value) -> Value + Send + Sync + 'static>;

static NULL: Value = Value::Null;

/// Named collections of documents held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryExecutor {
    collections: HashMap<String, Vec<Value>>,
}

impl MemoryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collection(mut self, name: impl Into<String>, documents: impl IntoIterator<Item = Value>) -> Self {
        self.insert_many(name, documents);
        self
    }

    pub fn insert(&mut self, collection: impl Into<String>, document: Value) {
        self.collections.entry(collection.into()).or_default().push(document);
    }

    pub fn insert_many(&mut self, collection: impl Into<String>, documents: impl IntoIterator<Item = Value>) {
        self.collections.entry(collection.into()).or_default().extend(documents);
    }

    pub fn collection(&self, name: &str) -> Option<&[Value]> {
        self.collections.get(name).map(Vec::as_slice)
    }
}

impl Executor for MemoryExecutor {
    fn aggregate<'a>(&'a self, collection: &str, pipeline: &[Value]) -> Result<Documents<'a>, LambdaQueryError> {
        let stages = pipeline.iter().map(Stage::from_document).collect::<Result<Vec<_>, _>>()?;
        debug!(collection, stages = stages.len(), "aggregating in memory");
        // An unknown collection behaves like an empty one.
        let source = self.collections.get(collection).map(Vec::as_slice).unwrap_or(&[]);
        let mut documents: Documents<'a> = Box::new(source.iter().cloned());
        for stage in stages {
            trace!(stage = stage.name(), "applying stage");
            documents = apply_stage(documents, stage)?;
        }
        Ok(documents)
    }
}

fn apply_stage<'a>(documents: Documents<'a>, stage: Stage) -> Result<Documents<'a>, LambdaQueryError> {
    match stage {
        Stage::Match(doc) => {
            let matcher = compile_match(&doc)?;
            Ok(Box::new(documents.filter(move |d| matcher(d))))
        }
        Stage::Project(spec) => {
            let projector = compile_projection(&spec)?;
            Ok(Box::new(documents.map(move |d| projector(&d))))
        }
        Stage::Sort(keys) => {
            let mut sorted: Vec<Value> = documents.collect();
            sorted.sort_by(|a, b| compare_documents(a, b, &keys));
            Ok(Box::new(sorted.into_iter()))
        }
        Stage::Group { key, fields } => {
            let key = compile_expression(&key)?;
            let fields = fields
                .into_iter()
                .map(|field| Ok((field.name, field.accumulator, compile_expression(&field.expression)?)))
                .collect::<Result<Vec<_>, LambdaQueryError>>()?;
            Ok(Box::new(group(documents, &key, &fields).into_iter()))
        }
        Stage::Limit(n) => Ok(Box::new(documents.take(usize::try_from(n).unwrap_or(usize::MAX)))),
        Stage::Skip(n) => Ok(Box::new(documents.skip(usize::try_from(n).unwrap_or(usize::MAX)))),
        Stage::Count(name) => {
            let total = documents.count();
            if total == 0 {
                return Ok(Box::new(std::iter::empty()));
            }
            let mut doc = Map::new();
            doc.insert(name, Value::from(total as u64));
            Ok(Box::new(std::iter::once(Value::Object(doc))))
        }
    }
}

/// Compiles a match document into a predicate over documents.
pub fn compile_match(doc: &Value) -> Result<Box<dyn Fn(&Value) -> bool + Send + Sync + 'static>, LambdaQueryError> {
    let map = doc
        .as_object()
        .ok_or_else(|| LambdaQueryError::ExecutionError(format!("match document must be an object, got {}", doc)))?;
    let mut clauses: Vec<Matcher> = Vec::with_capacity(map.len());
    for (key, value) in map {
        let clause: Matcher = match key.as_str() {
            "$and" | "$or" | "$nor" => {
                let terms = value
                    .as_array()
                    .filter(|terms| !terms.is_empty())
                    .ok_or_else(|| LambdaQueryError::ExecutionError(format!("{} needs a non-empty array", key)))?
                    .iter()
                    .map(compile_match)
                    .collect::<Result<Vec<_>, _>>()?;
                match key.as_str() {
                    "$and" => Box::new(move |d: &Value| terms.iter().all(|t| t(d))),
                    "$or" => Box::new(move |d: &Value| terms.iter().any(|t| t(d))),
                    _ => Box::new(move |d: &Value| !terms.iter().any(|t| t(d))),
                }
            }
            "$expr" => {
                let expr = compile_expression(value)?;
                Box::new(move |d: &Value| truthy(&expr(d)))
            }
            op if op.starts_with('$') => {
                return Err(LambdaQueryError::ExecutionError(format!("unknown query operator '{}'", op)))
            }
            field => compile_condition(field, value)?,
        };
        clauses.push(clause);
    }
    Ok(Box::new(move |d: &Value| clauses.iter().all(|c| c(d))))
}

fn compile_condition(field: &str, condition: &Value) -> Result<Matcher, LambdaQueryError> {
    let operators = match condition.as_object() {
        Some(ops) if !ops.is_empty() && ops.keys().all(|k| k.starts_with('$')) => ops,
        // `{field: value}` is shorthand for `$eq`.
        _ => return Ok(field_test(field, "$eq", condition.clone())),
    };
    let mut tests: Vec<Matcher> = Vec::with_capacity(operators.len());
    for (op, operand) in operators {
        let test: Matcher = match op.as_str() {
            "$eq" | "$lt" | "$lte" | "$gt" | "$gte" => field_test(field, op, operand.clone()),
            "$ne" => {
                let eq = field_test(field, "$eq", operand.clone());
                Box::new(move |d: &Value| !eq(d))
            }
            "$in" | "$nin" => {
                if !operand.is_array() {
                    return Err(LambdaQueryError::ExecutionError(format!("{} needs an array, got {}", op, operand)));
                }
                let found = field_test(field, "$in", operand.clone());
                if op == "$in" {
                    found
                } else {
                    Box::new(move |d: &Value| !found(d))
                }
            }
            "$not" => {
                let inner = compile_condition(field, operand)?;
                Box::new(move |d: &Value| !inner(d))
            }
            other => return Err(LambdaQueryError::ExecutionError(format!("unknown query operator '{}'", other))),
        };
        tests.push(test);
    }
    Ok(Box::new(move |d: &Value| tests.iter().all(|t| t(d))))
}

/// Tests the field value, or any element of it when the field holds an array.
fn field_test(field: &str, op: &str, operand: Value) -> Matcher {
    let field = field.to_string();
    let op = op.to_string();
    Box::new(move |d: &Value| {
        let value = lookup(d, &field).unwrap_or(&NULL);
        let test = |v: &Value| match op.as_str() {
            "$eq" => values_equal(v, &operand),
            "$lt" => cmp_ord(v, &operand, |o| o == Ordering::Less),
            "$lte" => cmp_ord(v, &operand, |o| o != Ordering::Greater),
            "$gt" => cmp_ord(v, &operand, |o| o == Ordering::Greater),
            "$gte" => cmp_ord(v, &operand, |o| o != Ordering::Less),
            "$in" => cmp_in(v, &operand),
            _ => false,
        };
        match value {
            Value::Array(items) => test(value) || items.iter().any(test),
            _ => test(value),
        }
    })
}

fn compile_projection(spec: &Map<String, Value>) -> Result<Evaluator, LambdaQueryError> {
    let include_id = !spec.get("_id").map_or(false, is_exclusion);
    let entries: Vec<(&String, &Value)> = spec.iter().filter(|(k, _)| k.as_str() != "_id").collect();
    if !entries.is_empty() && entries.iter().all(|(_, v)| is_exclusion(v)) {
        let excluded: Vec<String> = entries.into_iter().map(|(k, _)| k.clone()).collect();
        return Ok(Box::new(move |d: &Value| {
            let mut out = d.as_object().cloned().unwrap_or_default();
            for key in &excluded {
                out.remove(key);
            }
            if !include_id {
                out.remove("_id");
            }
            Value::Object(out)
        }));
    }
    let mut outputs: Vec<(String, Option<Evaluator>)> = Vec::with_capacity(entries.len());
    for (name, value) in entries {
        if is_exclusion(value) {
            return Err(LambdaQueryError::ExecutionError(format!(
                "cannot exclude '{}' in an inclusion projection",
                name
            )));
        }
        let evaluator = if is_inclusion(value) { None } else { Some(compile_expression(value)?) };
        outputs.push((name.clone(), evaluator));
    }
    Ok(Box::new(move |d: &Value| {
        let mut out = Map::new();
        if include_id {
            if let Some(id) = d.get("_id") {
                out.insert("_id".to_string(), id.clone());
            }
        }
        for (name, evaluator) in &outputs {
            match evaluator {
                Some(evaluator) => {
                    out.insert(name.clone(), evaluator(d));
                }
                None => {
                    if let Some(value) = lookup(d, name) {
                        out.insert(name.clone(), value.clone());
                    }
                }
            }
        }
        Value::Object(out)
    }))
}

fn is_exclusion(value: &Value) -> bool {
    matches!(value, Value::Bool(false)) || value.as_f64() == Some(0.0)
}

fn is_inclusion(value: &Value) -> bool {
    matches!(value, Value::Bool(true)) || value.as_f64().map_or(false, |n| n != 0.0)
}

/// Compiles an aggregation expression such as `{"$add": ["$gpa", 10]}`.
pub fn compile_expression(expr: &Value) -> Result<Box<dyn Fn(&Value) -> Value + Send + Sync + 'static>, LambdaQueryError> {
    match expr {
        Value::String(s) if s == "$$ROOT" => Ok(Box::new(|d: &Value| d.clone())),
        Value::String(s) if s.starts_with("$$") => {
            Err(LambdaQueryError::ExecutionError(format!("unknown variable '{}'", s)))
        }
        Value::String(s) if s.starts_with('$') => {
            let path = s[1..].to_string();
            Ok(Box::new(move |d: &Value| lookup(d, &path).cloned().unwrap_or(Value::Null)))
        }
        Value::Array(items) => {
            let items = items.iter().map(compile_expression).collect::<Result<Vec<_>, _>>()?;
            Ok(Box::new(move |d: &Value| Value::Array(items.iter().map(|item| item(d)).collect())))
        }
        Value::Object(map) => match map.iter().next() {
            Some((op, args)) if map.len() == 1 && op.starts_with('$') => compile_operator(op, args),
            _ => {
                let fields = map
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), compile_expression(v)?)))
                    .collect::<Result<Vec<_>, LambdaQueryError>>()?;
                Ok(Box::new(move |d: &Value| Value::Object(fields.iter().map(|(k, f)| (k.clone(), f(d))).collect())))
            }
        },
        literal => {
            let literal = literal.clone();
            Ok(Box::new(move |_: &Value| literal.clone()))
        }
    }
}

fn compile_operator(op: &str, args: &Value) -> Result<Evaluator, LambdaQueryError> {
    if op == "$literal" {
        let literal = args.clone();
        return Ok(Box::new(move |_: &Value| literal.clone()));
    }
    if op == "$cond" {
        let (test, then, otherwise) = match args {
            Value::Object(map) => match (map.get("if"), map.get("then"), map.get("else")) {
                (Some(t), Some(a), Some(b)) if map.len() == 3 => (t, a, b),
                _ => return Err(arity(op, args)),
            },
            Value::Array(items) if items.len() == 3 => (&items[0], &items[1], &items[2]),
            _ => return Err(arity(op, args)),
        };
        let test = compile_expression(test)?;
        let then = compile_expression(then)?;
        let otherwise = compile_expression(otherwise)?;
        return Ok(Box::new(move |d: &Value| if truthy(&test(d)) { then(d) } else { otherwise(d) }));
    }
    let operands = match args {
        Value::Array(items) => items.iter().map(compile_expression).collect::<Result<Vec<_>, _>>()?,
        single => vec![compile_expression(single)?],
    };
    let evaluator: Evaluator = match (op, operands.len()) {
        ("$add", n) | ("$multiply", n) if n >= 1 => {
            let op = op.to_string();
            Box::new(move |d: &Value| {
                let values: Vec<Value> = operands.iter().map(|o| o(d)).collect();
                values
                    .iter()
                    .skip(1)
                    .try_fold(values[0].clone(), |acc, v| arithmetic(&op, &acc, v))
                    .unwrap_or(Value::Null)
            })
        }
        ("$subtract", 2) | ("$divide", 2) | ("$mod", 2) => {
            let op = op.to_string();
            binary(operands, move |a, b| arithmetic(&op, a, b).unwrap_or(Value::Null))
        }
        ("$eq", 2) => binary(operands, |a, b| Value::Bool(values_equal(a, b))),
        ("$ne", 2) => binary(operands, |a, b| Value::Bool(!values_equal(a, b))),
        ("$lt", 2) => binary(operands, |a, b| Value::Bool(cmp_ord(a, b, |o| o == Ordering::Less))),
        ("$lte", 2) => binary(operands, |a, b| Value::Bool(cmp_ord(a, b, |o| o != Ordering::Greater))),
        ("$gt", 2) => binary(operands, |a, b| Value::Bool(cmp_ord(a, b, |o| o == Ordering::Greater))),
        ("$gte", 2) => binary(operands, |a, b| Value::Bool(cmp_ord(a, b, |o| o != Ordering::Less))),
        ("$in", 2) => binary(operands, |a, b| Value::Bool(cmp_in(a, b))),
        ("$not", 1) => Box::new(move |d: &Value| Value::Bool(!truthy(&operands[0](d)))),
        ("$and", _) => Box::new(move |d: &Value| Value::Bool(operands.iter().all(|o| truthy(&o(d))))),
        ("$or", _) => Box::new(move |d: &Value| Value::Bool(operands.iter().any(|o| truthy(&o(d))))),
        (
            "$add" | "$multiply" | "$subtract" | "$divide" | "$mod" | "$eq" | "$ne" | "$lt" | "$lte" | "$gt" | "$gte"
            | "$in" | "$not",
            _,
        ) => return Err(arity(op, args)),
        _ => return Err(LambdaQueryError::ExecutionError(format!("unknown expression operator '{}'", op))),
    };
    Ok(evaluator)
}

fn binary<F>(operands: Vec<Evaluator>, f: F) -> Evaluator
where
    F: Fn(&Value, &Value) -> Value + Send + Sync + 'static,
{
    Box::new(move |d: &Value| f(&operands[0](d), &operands[1](d)))
}

fn arity(op: &str, args: &Value) -> LambdaQueryError {
    LambdaQueryError::ExecutionError(format!("wrong arguments for '{}': {}", op, args))
}

/// Integer arithmetic when both sides are integers and the result is exact, float otherwise.
fn arithmetic(op: &str, a: &Value, b: &Value) -> Option<Value> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        let exact = match op {
            "$add" => x.checked_add(y),
            "$subtract" => x.checked_sub(y),
            "$multiply" => x.checked_mul(y),
            "$mod" => x.checked_rem(y),
            _ => None,
        };
        if let Some(n) = exact {
            return Some(Value::from(n));
        }
    }
    let (x, y) = (a.as_f64()?, b.as_f64()?);
    let result = match op {
        "$add" => x + y,
        "$subtract" => x - y,
        "$multiply" => x * y,
        "$divide" if y != 0.0 => x / y,
        "$mod" if y != 0.0 => x % y,
        _ => return None,
    };
    Number::from_f64(result).map(Value::Number)
}

fn group(documents: Documents<'_>, key: &Evaluator, fields: &[(String, Accumulator, Evaluator)]) -> Vec<Value> {
    let mut order: Vec<(Value, Vec<AccumulatorState>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for doc in documents {
        let group_key = key(&doc);
        let slot = *index.entry(group_key.to_string()).or_insert_with(|| {
            order.push((group_key.clone(), fields.iter().map(|(_, acc, _)| AccumulatorState::new(*acc)).collect()));
            order.len() - 1
        });
        for (state, (_, _, expr)) in order[slot].1.iter_mut().zip(fields) {
            state.add(expr(&doc));
        }
    }
    order
        .into_iter()
        .map(|(group_key, states)| {
            let mut out = Map::new();
            out.insert("_id".to_string(), group_key);
            for ((name, _, _), state) in fields.iter().zip(states) {
                out.insert(name.clone(), state.finish());
            }
            Value::Object(out)
        })
        .collect()
}

enum AccumulatorState {
    Sum { int: i64, float: f64, exact: bool },
    Min(Option<Value>),
    Max(Option<Value>),
    Avg { total: f64, count: u64 },
    Push(Vec<Value>),
}

impl AccumulatorState {
    fn new(accumulator: Accumulator) -> Self {
        match accumulator {
            Accumulator::Sum => AccumulatorState::Sum { int: 0, float: 0.0, exact: true },
            Accumulator::Min => AccumulatorState::Min(None),
            Accumulator::Max => AccumulatorState::Max(None),
            Accumulator::Avg => AccumulatorState::Avg { total: 0.0, count: 0 },
            Accumulator::Push => AccumulatorState::Push(Vec::new()),
        }
    }

    fn add(&mut self, value: Value) {
        if value.is_null() && matches!(self, AccumulatorState::Min(_) | AccumulatorState::Max(_)) {
            return;
        }
        match self {
            AccumulatorState::Sum { int, float, exact } => {
                // Non-numeric values are ignored.
                if let Some(n) = value.as_f64() {
                    *float += n;
                    match value.as_i64().and_then(|i| int.checked_add(i)) {
                        Some(total) if *exact => *int = total,
                        _ => *exact = false,
                    }
                }
            }
            AccumulatorState::Min(current) => {
                if current.as_ref().map_or(true, |c| order_values(&value, c) == Ordering::Less) {
                    *current = Some(value);
                }
            }
            AccumulatorState::Max(current) => {
                if current.as_ref().map_or(true, |c| order_values(&value, c) == Ordering::Greater) {
                    *current = Some(value);
                }
            }
            AccumulatorState::Avg { total, count } => {
                if let Some(n) = value.as_f64() {
                    *total += n;
                    *count += 1;
                }
            }
            AccumulatorState::Push(items) => items.push(value),
        }
    }

    fn finish(self) -> Value {
        match self {
            AccumulatorState::Sum { int, exact: true, .. } => Value::from(int),
            AccumulatorState::Sum { float, .. } => Number::from_f64(float).map_or(Value::Null, Value::Number),
            AccumulatorState::Min(value) | AccumulatorState::Max(value) => value.unwrap_or(Value::Null),
            AccumulatorState::Avg { count: 0, .. } => Value::Null,
            AccumulatorState::Avg { total, count } => {
                Number::from_f64(total / count as f64).map_or(Value::Null, Value::Number)
            }
            AccumulatorState::Push(items) => Value::Array(items),
        }
    }
}

fn compare_documents(a: &Value, b: &Value, keys: &[SortKey]) -> Ordering {
    for key in keys {
        let left = lookup(a, &key.field).unwrap_or(&NULL);
        let right = lookup(b, &key.field).unwrap_or(&NULL);
        let ordering = match key.direction {
            SortDirection::Ascending => order_values(left, right),
            SortDirection::Descending => order_values(right, left),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// Resolves a dotted path; numeric segments index into arrays.
fn lookup<'v>(doc: &'v Value, path: &str) -> Option<&'v Value> {
    path.split('.').try_fold(doc, |value, segment| match value {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |x| x != 0.0),
        _ => true,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

// Helper for ordered comparisons; values of different types never compare
fn cmp_ord<F>(a: &Value, b: &Value, cmp: F) -> bool
where
    F: Fn(Ordering) -> bool,
{
    let ordering = match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64().zip(y.as_f64()).and_then(|(x, y)| x.partial_cmp(&y)),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    };
    ordering.map_or(false, cmp)
}

// Helper for membership tests
fn cmp_in(a: &Value, b: &Value) -> bool {
    match b {
        Value::Array(items) => items.iter().any(|item| values_equal(a, item)),
        _ => false,
    }
}

/// Total order used by `$sort`, `$min` and `$max`: null < numbers < strings < objects < arrays < booleans.
fn order_values(a: &Value, b: &Value) -> Ordering {
    fn rank(value: &Value) -> u8 {
        match value {
            Value::Null => 0,
            Value::Number(_) => 1,
            Value::String(_) => 2,
            Value::Object(_) => 3,
            Value::Array(_) => 4,
            Value::Bool(_) => 5,
        }
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            x.as_f64().zip(y.as_f64()).and_then(|(x, y)| x.partial_cmp(&y)).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => x
            .iter()
            .zip(y)
            .map(|(x, y)| order_values(x, y))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        (Value::Object(_), Value::Object(_)) => a.to_string().cmp(&b.to_string()),
        _ => rank(a).cmp(&rank(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sales() -> MemoryExecutor {
        MemoryExecutor::new().with_collection(
            "sales",
            vec![
                json!({"_id": 1, "item": "abc", "price": 10, "quantity": 2, "tags": ["a", "b"]}),
                json!({"_id": 2, "item": "jkl", "price": 20, "quantity": 1, "tags": ["b"]}),
                json!({"_id": 3, "item": "xyz", "price": 5, "quantity": 10, "tags": []}),
                json!({"_id": 4, "item": "xyz", "price": 5, "quantity": 5}),
                json!({"_id": 5, "item": "abc", "price": 10, "quantity": 10, "tags": ["c"]}),
            ],
        )
    }

    fn run(pipeline: Vec<Value>) -> Vec<Value> {
        sales().aggregate("sales", &pipeline).unwrap().collect()
    }

    fn ids(docs: &[Value]) -> Vec<i64> {
        docs.iter().filter_map(|d| d["_id"].as_i64()).collect()
    }

    #[test]
    fn test_match_comparisons() {
        assert_eq!(ids(&run(vec![json!({"$match": {"price": {"$gte": 10}}})])), vec![1, 2, 5]);
        assert_eq!(ids(&run(vec![json!({"$match": {"price": {"$lt": 10}}})])), vec![3, 4]);
        assert_eq!(ids(&run(vec![json!({"$match": {"item": {"$ne": "abc"}}})])), vec![2, 3, 4]);
        assert_eq!(ids(&run(vec![json!({"$match": {"item": "jkl"}})])), vec![2]);
        assert_eq!(ids(&run(vec![json!({"$match": {"price": {"$eq": 5.0}}})])), vec![3, 4]);
    }

    #[test]
    fn test_match_membership_and_arrays() {
        assert_eq!(ids(&run(vec![json!({"$match": {"item": {"$in": ["abc", "jkl"]}}})])), vec![1, 2, 5]);
        assert_eq!(ids(&run(vec![json!({"$match": {"item": {"$nin": ["abc", "jkl"]}}})])), vec![3, 4]);
        assert_eq!(ids(&run(vec![json!({"$match": {"tags": {"$eq": "b"}}})])), vec![1, 2]);
        // Missing fields compare equal to null.
        assert_eq!(ids(&run(vec![json!({"$match": {"tags": {"$eq": null}}})])), vec![4]);
    }

    #[test]
    fn test_match_logical() {
        let docs = run(vec![json!({"$match": {"$and": [{"item": {"$eq": "abc"}}, {"quantity": {"$gt": 5}}]}})]);
        assert_eq!(ids(&docs), vec![5]);
        let docs = run(vec![json!({"$match": {"$or": [{"price": {"$eq": 20}}, {"quantity": {"$eq": 5}}]}})]);
        assert_eq!(ids(&docs), vec![2, 4]);
        let docs = run(vec![json!({"$match": {"$nor": [{"$or": [{"price": {"$eq": 20}}, {"price": {"$eq": 5}}]}]}})]);
        assert_eq!(ids(&docs), vec![1, 5]);
        let docs = run(vec![json!({"$match": {"price": {"$not": {"$eq": 10}}}})]);
        assert_eq!(ids(&docs), vec![2, 3, 4]);
    }

    #[test]
    fn test_match_expr() {
        let docs = run(vec![json!({"$match": {"$expr": {"$gt": [{"$multiply": ["$price", "$quantity"]}, 40]}}})]);
        assert_eq!(ids(&docs), vec![3, 5]);
    }

    #[test]
    fn test_project_fields_and_expressions() {
        let docs = run(vec![
            json!({"$match": {"_id": 1}}),
            json!({"$project": {"_id": 0, "item": "$item", "total": {"$multiply": ["$price", "$quantity"]}}}),
        ]);
        assert_eq!(docs, vec![json!({"item": "abc", "total": 20})]);
        let docs = run(vec![json!({"$match": {"_id": 2}}), json!({"$project": {"item": 1}})]);
        assert_eq!(docs, vec![json!({"_id": 2, "item": "jkl"})]);
        let docs = run(vec![json!({"$match": {"_id": 2}}), json!({"$project": {"tags": 0, "quantity": 0}})]);
        assert_eq!(docs, vec![json!({"_id": 2, "item": "jkl", "price": 20})]);
    }

    #[test]
    fn test_project_conditional() {
        let docs = run(vec![
            json!({"$sort": {"_id": 1}}),
            json!({"$project": {"_id": 0, "band": {"$cond": {"if": {"$gt": ["$price", 8]}, "then": "high", "else": "low"}}}}),
        ]);
        let bands: Vec<&str> = docs.iter().filter_map(|d| d["band"].as_str()).collect();
        assert_eq!(bands, vec!["high", "high", "low", "low", "high"]);
    }

    #[test]
    fn test_sort_skip_limit() {
        let docs = run(vec![json!({"$sort": {"price": -1, "quantity": 1}}), json!({"$skip": 1}), json!({"$limit": 3})]);
        assert_eq!(ids(&docs), vec![1, 5, 4]);
    }

    #[test]
    fn test_count() {
        assert_eq!(run(vec![json!({"$count": "total"})]), vec![json!({"total": 5})]);
        assert!(run(vec![json!({"$match": {"price": {"$gt": 100}}}), json!({"$count": "total"})]).is_empty());
    }

    #[test]
    fn test_scalar_group() {
        let value = |acc: &str, field: &str| {
            run(vec![json!({"$group": {"_id": null, "value": { acc: field }}})])[0]["value"].clone()
        };
        assert_eq!(value("$max", "$price"), json!(20));
        assert_eq!(value("$min", "$price"), json!(5));
        assert_eq!(value("$sum", "$quantity"), json!(28));
        assert_eq!(value("$avg", "$quantity"), json!(5.6));
    }

    #[test]
    fn test_group_push_root() {
        let docs = run(vec![json!({"$group": {"_id": "$price", "items": {"$push": "$$ROOT"}}}), json!({"$sort": {"_id": 1}})]);
        assert_eq!(docs.len(), 3);
        assert_eq!(docs[0]["_id"], json!(5));
        assert_eq!(docs[0]["items"].as_array().map(Vec::len), Some(2));
        assert_eq!(docs[2]["items"][0]["item"], json!("jkl"));
    }

    #[test]
    fn test_unknown_collection_is_empty() {
        let docs: Vec<Value> = sales().aggregate("nope", &[]).unwrap().collect();
        assert!(docs.is_empty());
    }

    #[test]
    fn test_unknown_operators_are_errors() {
        for stage in [
            json!({"$match": {"price": {"$regex": "a"}}}),
            json!({"$match": {"$where": "true"}}),
            json!({"$project": {"x": {"$concat": ["$item", "!"]}}}),
            json!({"$project": {"x": {"$add": []}}}),
            json!({"$group": {"_id": "$$CURRENT"}}),
            json!({"$out": "copy"}),
        ] {
            let store = sales();
            let result = store.aggregate("sales", &[stage.clone()]);
            assert!(matches!(result, Err(LambdaQueryError::ExecutionError(_))), "{}", stage);
        }
    }

    #[test]
    fn test_arithmetic_types() {
        assert_eq!(arithmetic("$add", &json!(1), &json!(2)), Some(json!(3)));
        assert_eq!(arithmetic("$divide", &json!(7), &json!(2)), Some(json!(3.5)));
        assert_eq!(arithmetic("$divide", &json!(7), &json!(0)), None);
        assert_eq!(arithmetic("$mod", &json!(7), &json!(4)), Some(json!(3)));
        assert_eq!(arithmetic("$add", &json!("a"), &json!(2)), None);
    }

    #[test]
    fn test_value_ordering() {
        assert_eq!(order_values(&json!(null), &json!(0)), Ordering::Less);
        assert_eq!(order_values(&json!(2), &json!(10.5)), Ordering::Less);
        assert_eq!(order_values(&json!("b"), &json!("a")), Ordering::Greater);
        assert_eq!(order_values(&json!(true), &json!("z")), Ordering::Greater);
        assert!(!cmp_ord(&json!("10"), &json!(5), |o| o == Ordering::Greater));
    }
}
