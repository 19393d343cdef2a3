//! Query module: fluent composition of pipeline stages over an executor.
//!
//! A Queryable accumulates stages built from compiled closures. Terminal operators
//! hand the pipeline to an Executor and read the documents it yields.

use crate::ast::ExprKind;
use crate::compiler::{compile, CompileOptions};
use crate::instruction::CodeObject;
use crate::model::CollectionModel;
use crate::pipeline::{Accumulator, Projection, ProjectionOptions, SortDirection, SortKey, Stage};
use crate::translator::ExpressionTree;
use crate::LambdaQueryError;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// A lazy sequence of result documents.
pub type Documents<'a> = Box<dyn Iterator<Item = Value> + 'a>;

/// Runs aggregation pipelines against named collections.
pub trait Executor {
    fn aggregate<'a>(&'a self, collection: &str, pipeline: &[Value]) -> Result<Documents<'a>, LambdaQueryError>;
}

#[derive(Clone)]
pub struct Queryable<'e> {
    executor: &'e dyn Executor,
    collection: String,
    options: CompileOptions,
    stages: Vec<Stage>,
}

impl fmt::Debug for Queryable<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queryable")
            .field("collection", &self.collection)
            .field("stages", &self.stages)
            .finish()
    }
}

impl<'e> Queryable<'e> {
    pub fn new(executor: &'e dyn Executor, collection: impl Into<String>) -> Self {
        Self { executor, collection: collection.into(), options: CompileOptions::default(), stages: Vec::new() }
    }

    /// Queries the model's collection, resolving attribute names through the model.
    pub fn for_model(executor: &'e dyn Executor, model: Arc<CollectionModel>) -> Self {
        Self {
            executor,
            collection: model.collection().to_string(),
            options: CompileOptions::with_model(model),
            stages: Vec::new(),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Keeps documents satisfying the predicate. Consecutive filters merge into one `$and`.
    pub fn filter(mut self, predicate: &CodeObject) -> Result<Self, LambdaQueryError> {
        let tree = self.compile(predicate)?;
        let Stage::Match(doc) = Stage::filter(&tree)? else {
            return Err(LambdaQueryError::UnsupportedExpression("filter did not produce a match stage".to_string()));
        };
        match self.stages.last_mut() {
            Some(Stage::Match(existing)) => {
                match existing.get_mut("$and").and_then(Value::as_array_mut) {
                    Some(terms) => terms.push(doc),
                    None => *existing = json!({ "$and": [existing.take(), doc] }),
                }
            }
            _ => self.stages.push(Stage::Match(doc)),
        }
        Ok(self)
    }

    pub fn select(self, selector: &CodeObject) -> Result<Self, LambdaQueryError> {
        self.select_with(selector, ProjectionOptions::default())
    }

    pub fn select_with(mut self, selector: &CodeObject, options: ProjectionOptions) -> Result<Self, LambdaQueryError> {
        let tree = self.compile(selector)?;
        if let Some(stage) = Projection::from_tree(&tree)?.stage(options) {
            self.stages.push(stage);
        }
        Ok(self)
    }

    pub fn order_by(self, selector: &CodeObject) -> Result<Self, LambdaQueryError> {
        self.sort(selector, SortDirection::Ascending, false)
    }

    pub fn order_by_descending(self, selector: &CodeObject) -> Result<Self, LambdaQueryError> {
        self.sort(selector, SortDirection::Descending, false)
    }

    /// Adds a secondary key to the preceding `order_by`.
    pub fn then_by(self, selector: &CodeObject) -> Result<Self, LambdaQueryError> {
        self.sort(selector, SortDirection::Ascending, true)
    }

    pub fn then_by_descending(self, selector: &CodeObject) -> Result<Self, LambdaQueryError> {
        self.sort(selector, SortDirection::Descending, true)
    }

    fn sort(mut self, selector: &CodeObject, direction: SortDirection, extend: bool) -> Result<Self, LambdaQueryError> {
        let key = SortKey::from_tree(&self.compile(selector)?, direction)?;
        match (self.stages.last_mut(), extend) {
            (Some(Stage::Sort(keys)), true) => {
                keys.retain(|k| k.field != key.field);
                keys.push(key);
            }
            (_, true) => {
                return Err(LambdaQueryError::UnsupportedExpression(
                    "then_by must follow order_by or another then_by".to_string(),
                ))
            }
            (_, false) => self.stages.push(Stage::Sort(vec![key])),
        }
        Ok(self)
    }

    pub fn take(mut self, limit: u64) -> Self {
        self.stages.push(Stage::Limit(limit));
        self
    }

    pub fn skip(mut self, offset: u64) -> Self {
        self.stages.push(Stage::Skip(offset));
        self
    }

    /// Groups documents by key; each result holds the key in `_id` and the members in `items`.
    pub fn group_by(mut self, selector: &CodeObject) -> Result<Self, LambdaQueryError> {
        let tree = self.compile(selector)?;
        self.stages.push(Stage::group_by(&tree)?);
        Ok(self)
    }

    /// The stage documents handed to the executor.
    pub fn pipeline(&self) -> Vec<Value> {
        self.stages.iter().map(Stage::to_document).collect()
    }

    pub fn iter(&self) -> Result<Documents<'e>, LambdaQueryError> {
        let pipeline = self.pipeline();
        debug!(collection = %self.collection, stages = pipeline.len(), "executing pipeline");
        self.executor.aggregate(&self.collection, &pipeline)
    }

    pub fn to_list(&self) -> Result<Vec<Value>, LambdaQueryError> {
        Ok(self.iter()?.collect())
    }

    pub fn count(&self) -> Result<u64, LambdaQueryError> {
        let counted = self.clone().push(Stage::Count("total".to_string()));
        let total = counted.iter()?.next().and_then(|doc| doc.get("total").and_then(Value::as_u64));
        Ok(total.unwrap_or(0))
    }

    pub fn any(&self, predicate: Option<&CodeObject>) -> Result<bool, LambdaQueryError> {
        match predicate {
            Some(predicate) => Ok(self.clone().filter(predicate)?.count()? > 0),
            None => Ok(self.count()? > 0),
        }
    }

    /// True when every document satisfies the predicate; vacuously true without one.
    pub fn all(&self, predicate: Option<&CodeObject>) -> Result<bool, LambdaQueryError> {
        match predicate {
            Some(predicate) => Ok(self.clone().filter(predicate)?.count()? == self.count()?),
            None => Ok(true),
        }
    }

    pub fn first(&self, predicate: Option<&CodeObject>) -> Result<Value, LambdaQueryError> {
        self.first_or_default(predicate)?.ok_or(LambdaQueryError::NoElements)
    }

    pub fn first_or_default(&self, predicate: Option<&CodeObject>) -> Result<Option<Value>, LambdaQueryError> {
        Ok(self.narrowed(predicate)?.take(1).iter()?.next())
    }

    /// The only matching document; fails when there are none or more than one.
    pub fn single(&self, predicate: Option<&CodeObject>) -> Result<Value, LambdaQueryError> {
        self.single_or_default(predicate)?.ok_or(LambdaQueryError::NoElements)
    }

    pub fn single_or_default(&self, predicate: Option<&CodeObject>) -> Result<Option<Value>, LambdaQueryError> {
        let mut found = self.narrowed(predicate)?.take(2).to_list()?;
        if found.len() > 1 {
            return Err(LambdaQueryError::MoreThanOneElement);
        }
        Ok(found.pop())
    }

    pub fn min(&self, selector: &CodeObject) -> Result<Value, LambdaQueryError> {
        self.scalar(Accumulator::Min, selector)
    }

    pub fn max(&self, selector: &CodeObject) -> Result<Value, LambdaQueryError> {
        self.scalar(Accumulator::Max, selector)
    }

    pub fn sum(&self, selector: &CodeObject) -> Result<Value, LambdaQueryError> {
        self.scalar(Accumulator::Sum, selector)
    }

    pub fn average(&self, selector: &CodeObject) -> Result<Value, LambdaQueryError> {
        self.scalar(Accumulator::Avg, selector)
    }

    fn scalar(&self, accumulator: Accumulator, selector: &CodeObject) -> Result<Value, LambdaQueryError> {
        let tree = self.compile(selector)?;
        let body = tree.body();
        if !matches!(body.kind, ExprKind::Attribute { .. }) {
            return Err(LambdaQueryError::UnsupportedProjection(format!(
                "{} needs a selector returning a field, got {}",
                accumulator.token(),
                body.variant_name()
            )));
        }
        if let (Some(model), Some(path)) = (self.options.model.as_deref(), body.attribute_path()) {
            if let Some(ty) = model.field_type(&path).filter(|ty| !ty.is_scalar()) {
                return Err(LambdaQueryError::UnsupportedProjection(format!(
                    "cannot apply {} to '{}' of type {:?}",
                    accumulator.token(),
                    path,
                    ty
                )));
            }
        }
        let field = tree
            .representation()
            .and_then(|repr| repr.as_field())
            .map(str::to_string)
            .ok_or_else(|| LambdaQueryError::UnsupportedProjection(format!("{} does not select a field", body)))?;
        let grouped = self.clone().push(Stage::scalar(accumulator, &field));
        let value = grouped.iter()?.next().and_then(|mut doc| doc.get_mut("value").map(Value::take));
        match value {
            Some(Value::Array(_)) | Some(Value::Object(_)) => Err(LambdaQueryError::UnsupportedProjection(format!(
                "{} of '{}' is not a scalar",
                accumulator.token(),
                field
            ))),
            Some(value) => Ok(value),
            None => Err(LambdaQueryError::NoElements),
        }
    }

    fn narrowed(&self, predicate: Option<&CodeObject>) -> Result<Self, LambdaQueryError> {
        match predicate {
            Some(predicate) => self.clone().filter(predicate),
            None => Ok(self.clone()),
        }
    }

    fn push(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    fn compile(&self, code: &CodeObject) -> Result<ExpressionTree, LambdaQueryError> {
        compile(code, &self.options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryExecutor;
    use crate::model::CollectionModelBuilder;
    use crate::types::FieldType;

    fn closure(listing: &str) -> CodeObject {
        CodeObject::from_listing(&["s"], listing).unwrap()
    }

    fn field(name: &str) -> CodeObject {
        closure(&format!("0 LOAD_FAST s\n2 LOAD_ATTR {}\n4 RETURN_VALUE", name))
    }

    fn price_at_least(n: i64) -> CodeObject {
        closure(&format!("0 LOAD_FAST s\n2 LOAD_ATTR price\n4 LOAD_CONST {}\n6 COMPARE_OP >=\n8 RETURN_VALUE", n))
    }

    fn item_is(name: &str) -> CodeObject {
        closure(&format!("0 LOAD_FAST s\n2 LOAD_ATTR item\n4 LOAD_CONST '{}'\n6 COMPARE_OP ==\n8 RETURN_VALUE", name))
    }

    fn sales() -> MemoryExecutor {
        MemoryExecutor::new().with_collection(
            "sales",
            vec![
                json!({"_id": 1, "item": "abc", "price": 10, "quantity": 2}),
                json!({"_id": 2, "item": "jkl", "price": 20, "quantity": 1}),
                json!({"_id": 3, "item": "xyz", "price": 5, "quantity": 10}),
                json!({"_id": 4, "item": "xyz", "price": 5, "quantity": 5}),
                json!({"_id": 5, "item": "abc", "price": 10, "quantity": 10}),
            ],
        )
    }

    #[test]
    fn test_filters_merge_into_and() {
        let executor = sales();
        let query = Queryable::new(&executor, "sales")
            .filter(&price_at_least(10))
            .unwrap()
            .filter(&item_is("abc"))
            .unwrap()
            .filter(&closure("0 LOAD_FAST s\n2 LOAD_ATTR quantity\n4 LOAD_CONST 5\n6 COMPARE_OP >\n8 RETURN_VALUE"))
            .unwrap();
        assert_eq!(
            query.pipeline(),
            vec![json!({"$match": {"$and": [
                {"price": {"$gte": 10}},
                {"item": {"$eq": "abc"}},
                {"quantity": {"$gt": 5}}
            ]}})]
        );
        assert_eq!(query.to_list().unwrap(), vec![json!({"_id": 5, "item": "abc", "price": 10, "quantity": 10})]);
    }

    #[test]
    fn test_order_then_take_skip() {
        let executor = sales();
        let query = Queryable::new(&executor, "sales")
            .order_by_descending(&field("price"))
            .unwrap()
            .then_by(&field("quantity"))
            .unwrap()
            .skip(1)
            .take(2);
        assert_eq!(
            query.pipeline(),
            vec![json!({"$sort": {"price": -1, "quantity": 1}}), json!({"$skip": 1}), json!({"$limit": 2})]
        );
        let ids: Vec<Value> = query.to_list().unwrap().into_iter().map(|d| d["_id"].clone()).collect();
        assert_eq!(ids, vec![json!(1), json!(5)]);
    }

    #[test]
    fn test_then_by_without_order_by() {
        let executor = sales();
        let result = Queryable::new(&executor, "sales").then_by(&field("price"));
        assert!(matches!(result, Err(LambdaQueryError::UnsupportedExpression(_))));
    }

    #[test]
    fn test_count_any_all() {
        let executor = sales();
        let query = Queryable::new(&executor, "sales");
        assert_eq!(query.count().unwrap(), 5);
        assert!(query.any(None).unwrap());
        assert!(query.any(Some(&price_at_least(20))).unwrap());
        assert!(!query.any(Some(&price_at_least(21))).unwrap());
        assert!(query.all(Some(&price_at_least(5))).unwrap());
        assert!(!query.all(Some(&price_at_least(10))).unwrap());
        assert!(query.all(None).unwrap());
        let empty = Queryable::new(&executor, "missing");
        assert_eq!(empty.count().unwrap(), 0);
        assert!(!empty.any(None).unwrap());
    }

    #[test]
    fn test_first_and_single() {
        let executor = sales();
        let query = Queryable::new(&executor, "sales");
        assert_eq!(query.first(Some(&item_is("xyz"))).unwrap()["_id"], json!(3));
        assert_eq!(query.first(Some(&item_is("nope"))), Err(LambdaQueryError::NoElements));
        assert_eq!(query.first_or_default(Some(&item_is("nope"))).unwrap(), None);
        assert_eq!(query.single(Some(&item_is("jkl"))).unwrap()["_id"], json!(2));
        assert_eq!(query.single(Some(&item_is("abc"))), Err(LambdaQueryError::MoreThanOneElement));
        assert_eq!(query.single_or_default(Some(&item_is("abc"))), Err(LambdaQueryError::MoreThanOneElement));
        assert_eq!(query.single_or_default(Some(&item_is("nope"))).unwrap(), None);
    }

    #[test]
    fn test_scalar_operators() {
        let executor = sales();
        let query = Queryable::new(&executor, "sales");
        assert_eq!(query.max(&field("price")).unwrap(), json!(20));
        assert_eq!(query.min(&field("price")).unwrap(), json!(5));
        assert_eq!(query.sum(&field("quantity")).unwrap(), json!(28));
        assert_eq!(query.average(&field("quantity")).unwrap(), json!(5.6));
        let predicate = query.max(&price_at_least(20));
        assert!(matches!(predicate, Err(LambdaQueryError::UnsupportedProjection(_))));
    }

    #[test]
    fn test_scalar_rejects_array_attribute() {
        let model = CollectionModelBuilder::new("students")
            .attribute("labs", FieldType::Array(Box::new(FieldType::Integer)))
            .build()
            .unwrap();
        let executor = MemoryExecutor::new().with_collection("students", vec![json!({"labs": [1, 2]})]);
        let query = Queryable::for_model(&executor, Arc::new(model));
        let labs = CodeObject::from_listing(&["s"], "0 LOAD_FAST s\n2 LOAD_ATTR labs\n4 RETURN_VALUE").unwrap();
        assert!(matches!(query.max(&labs), Err(LambdaQueryError::UnsupportedProjection(_))));
    }

    #[test]
    fn test_select_and_model_mapping() {
        let model = CollectionModelBuilder::new("sales")
            .mapped_attribute("name", "item", FieldType::String)
            .build()
            .unwrap();
        let executor = sales();
        let query = Queryable::for_model(&executor, Arc::new(model))
            .filter(&closure("0 LOAD_FAST s\n2 LOAD_ATTR name\n4 LOAD_CONST 'jkl'\n6 COMPARE_OP ==\n8 RETURN_VALUE"))
            .unwrap()
            .select(&field("name"))
            .unwrap();
        assert_eq!(query.collection(), "sales");
        assert_eq!(query.to_list().unwrap(), vec![json!({"item": "jkl"})]);
        assert_eq!(query.count().unwrap(), 1);
    }

    #[test]
    fn test_group_by() {
        let executor = sales();
        let groups = Queryable::new(&executor, "sales").group_by(&field("price")).unwrap().to_list().unwrap();
        assert_eq!(groups.len(), 3);
        let fives = groups.iter().find(|g| g["_id"] == json!(5)).unwrap();
        assert_eq!(fives["items"].as_array().map(Vec::len), Some(2));
    }
}
