// Integration tests for lambdaquery: end-to-end closure decompilation, translation and execution

use lambdaquery::*;
use proptest::prelude::*;
use serde_json::{json, Value};
use std::sync::Arc;

const WHL_FILTER: &str = r#"
  1           0 LOAD_FAST                0 (x)
              2 LOAD_ATTR                0 (name)
              4 LOAD_CONST               1 ('Western Hockey League')
              6 COMPARE_OP               2 (==)
              8 JUMP_IF_FALSE_OR_POP    18
             10 LOAD_FAST                0 (x)
             12 LOAD_ATTR                1 (short_name)
             14 LOAD_CONST               2 ('WHL')
             16 COMPARE_OP               2 (==)
        >>   18 RETURN_VALUE
"#;

// (x.gpa >= 60 and x.gpa <= 80) or x.last_name == 'Wu'
const GROUPED_FILTER: &str = r#"
              0 LOAD_FAST x
              2 LOAD_ATTR gpa
              4 LOAD_CONST 60
              6 COMPARE_OP >=
              8 POP_JUMP_IF_FALSE 20
             10 LOAD_FAST x
             12 LOAD_ATTR gpa
             14 LOAD_CONST 80
             16 COMPARE_OP <=
             18 JUMP_IF_TRUE_OR_POP 28
        >>   20 LOAD_FAST x
             22 LOAD_ATTR last_name
             24 LOAD_CONST 'Wu'
             26 COMPARE_OP ==
        >>   28 RETURN_VALUE
"#;

fn make_students() -> MemoryExecutor {
    MemoryExecutor::new().with_collection(
        "students",
        vec![
            json!({"_id": 1, "FirstName": "Bruce", "LastName": "Fenske", "gpa": 75, "address": {"city": "Regina"}, "labs": [80, 90]}),
            json!({"_id": 2, "FirstName": "Alice", "LastName": "Moore", "gpa": 92, "address": {"city": "Calgary"}, "labs": [95]}),
            json!({"_id": 3, "FirstName": "Chen", "LastName": "Wu", "gpa": 48, "address": {"city": "Regina"}, "labs": []}),
            json!({"_id": 4, "FirstName": "Dana", "LastName": "Fenske", "gpa": 63, "address": {"city": "Saskatoon"}, "labs": [70]}),
        ],
    )
}

fn make_model() -> Arc<CollectionModel> {
    Arc::new(
        CollectionModelBuilder::new("students")
            .mapped_attribute("first_name", "FirstName", FieldType::String)
            .mapped_attribute("last_name", "LastName", FieldType::String)
            .attribute("gpa", FieldType::Integer)
            .attribute("address", FieldType::Document)
            .attribute("labs", FieldType::Array(Box::new(FieldType::Integer)))
            .build()
            .unwrap(),
    )
}

fn closure(listing: &str) -> CodeObject {
    CodeObject::from_listing(&["x"], listing).unwrap()
}

fn attribute(name: &str) -> CodeObject {
    closure(&format!("0 LOAD_FAST x\n2 LOAD_ATTR {}\n4 RETURN_VALUE", name))
}

fn ids(docs: &[Value]) -> Vec<i64> {
    docs.iter().filter_map(|d| d["_id"].as_i64()).collect()
}

#[test]
fn test_whl_conjunction_document() {
    let tree = compile(&closure(WHL_FILTER), &CompileOptions::default()).unwrap();
    assert_eq!(
        tree.root().to_string(),
        "lambda x: (x.name == \"Western Hockey League\" and x.short_name == \"WHL\")"
    );
    assert_eq!(
        tree.to_query_document().unwrap(),
        json!({"$and": [{"name": {"$eq": "Western Hockey League"}}, {"short_name": {"$eq": "WHL"}}]})
    );
}

#[test]
fn test_explicit_grouping_is_preserved() {
    let options = CompileOptions::with_model(make_model());
    let doc = compile(&closure(GROUPED_FILTER), &options).unwrap().to_query_document().unwrap();
    assert_eq!(
        doc,
        json!({"$or": [
            {"$and": [{"gpa": {"$gte": 60}}, {"gpa": {"$lte": 80}}]},
            {"LastName": {"$eq": "Wu"}}
        ]})
    );

    let executor = make_students();
    let matched = Queryable::for_model(&executor, make_model())
        .filter(&closure(GROUPED_FILTER))
        .unwrap()
        .to_list()
        .unwrap();
    assert_eq!(ids(&matched), vec![1, 3, 4]);
}

#[test]
fn test_negated_filter_and_nested_attribute() {
    // not x.address.city == 'Regina'
    let code = closure(
        r#"
          0 LOAD_FAST x
          2 LOAD_ATTR address
          4 LOAD_ATTR city
          6 LOAD_CONST 'Regina'
          8 COMPARE_OP ==
         10 UNARY_NOT
         12 RETURN_VALUE
        "#,
    );
    let doc = compile(&code, &CompileOptions::default()).unwrap().to_query_document().unwrap();
    assert_eq!(doc, json!({"address.city": {"$not": {"$eq": "Regina"}}}));

    let executor = make_students();
    let docs = Queryable::new(&executor, "students").filter(&code).unwrap().to_list().unwrap();
    assert_eq!(ids(&docs), vec![2, 4]);
}

#[test]
fn test_membership_filter() {
    // x.last_name in ('Wu', 'Moore')
    let code = closure("0 LOAD_FAST x\n2 LOAD_ATTR last_name\n4 LOAD_CONST ('Wu', 'Moore')\n6 CONTAINS_OP 0\n8 RETURN_VALUE");
    let executor = make_students();
    let query = Queryable::for_model(&executor, make_model()).filter(&code).unwrap();
    assert_eq!(query.pipeline(), vec![json!({"$match": {"LastName": {"$in": ["Wu", "Moore"]}}})]);
    assert_eq!(ids(&query.to_list().unwrap()), vec![2, 3]);
}

#[test]
fn test_arithmetic_comparison_is_unsupported() {
    // x.gpa + 10 > 80
    let code = closure("0 LOAD_FAST x\n2 LOAD_ATTR gpa\n4 LOAD_CONST 10\n6 BINARY_ADD\n8 LOAD_CONST 80\n10 COMPARE_OP >\n12 RETURN_VALUE");
    let result = compile(&code, &CompileOptions::default());
    assert!(matches!(result, Err(LambdaQueryError::UnsupportedExpression(_))));

    let add = compile(&closure("0 LOAD_FAST x\n2 LOAD_ATTR gpa\n4 LOAD_CONST 10\n6 BINARY_ADD\n8 RETURN_VALUE"), &CompileOptions::default())
        .unwrap();
    assert_eq!(add.to_expression().unwrap(), json!({"$add": ["$gpa", 10]}));
}

#[test]
fn test_tuple_projection_end_to_end() {
    let code = closure(
        r#"
          0 LOAD_FAST                0 (x)
          2 LOAD_ATTR                0 (first_name)
          4 LOAD_FAST                0 (x)
          6 LOAD_ATTR                1 (last_name)
          8 LOAD_FAST                0 (x)
         10 LOAD_ATTR                2 (gpa)
         12 BUILD_TUPLE              3
         14 RETURN_VALUE
        "#,
    );
    let tree = compile(&code, &CompileOptions::default()).unwrap();
    assert_eq!(
        Projection::from_tree(&tree).unwrap(),
        Projection::Positional(vec!["first_name".to_string(), "last_name".to_string(), "gpa".to_string()])
    );

    let executor = make_students();
    let rows = Queryable::for_model(&executor, make_model())
        .order_by(&attribute("gpa"))
        .unwrap()
        .select(&code)
        .unwrap()
        .take(2)
        .to_list()
        .unwrap();
    assert_eq!(
        rows,
        vec![
            json!({"FirstName": "Chen", "LastName": "Wu", "gpa": 48}),
            json!({"FirstName": "Dana", "LastName": "Fenske", "gpa": 63}),
        ]
    );
    let first_row: Vec<&Value> = rows[0].as_object().unwrap().values().collect();
    assert_eq!(first_row, vec![&json!("Chen"), &json!("Wu"), &json!(48)]);
}

#[test]
fn test_dict_projection() {
    // {'name': x.first_name, 'bonus': x.gpa * 2}
    let selector = closure(
        r#"
          0 LOAD_FAST x
          2 LOAD_ATTR first_name
          4 LOAD_FAST x
          6 LOAD_ATTR gpa
          8 LOAD_CONST 2
         10 BINARY_MULTIPLY
         12 LOAD_CONST ('name', 'bonus')
         14 BUILD_CONST_KEY_MAP 2
         16 RETURN_VALUE
        "#,
    );
    let executor = make_students();
    let rows = Queryable::for_model(&executor, make_model())
        .filter(&closure("0 LOAD_FAST x\n2 LOAD_ATTR last_name\n4 LOAD_CONST 'Fenske'\n6 COMPARE_OP ==\n8 RETURN_VALUE"))
        .unwrap()
        .select_with(&selector, ProjectionOptions { include_id: true })
        .unwrap()
        .to_list()
        .unwrap();
    assert_eq!(
        rows,
        vec![json!({"_id": 1, "name": "Bruce", "bonus": 150}), json!({"_id": 4, "name": "Dana", "bonus": 126})]
    );
}

#[test]
fn test_ternary_selector_renders_cond() {
    // 'pass' if x.gpa >= 50 else 'fail'
    let tree = compile(
        &closure(
            r#"
              0 LOAD_FAST x
              2 LOAD_ATTR gpa
              4 LOAD_CONST 50
              6 COMPARE_OP >=
              8 POP_JUMP_IF_FALSE 14
             10 LOAD_CONST 'pass'
             12 RETURN_VALUE
        >>   14 LOAD_CONST 'fail'
             16 RETURN_VALUE
            "#,
        ),
        &CompileOptions::default(),
    )
    .unwrap();
    let expr = tree.to_expression().unwrap();
    assert_eq!(expr, json!({"$cond": {"if": {"$gte": ["$gpa", 50]}, "then": "pass", "else": "fail"}}));

    let executor = make_students();
    let docs = executor
        .aggregate("students", &[json!({"$sort": {"_id": 1}}), json!({"$project": {"_id": 0, "result": expr}})])
        .unwrap()
        .collect::<Vec<_>>();
    let results: Vec<&str> = docs.iter().filter_map(|d| d["result"].as_str()).collect();
    assert_eq!(results, vec!["pass", "pass", "fail", "pass"]);
}

#[test]
fn test_ternary_with_mixed_test() {
    // 'honour' if (x.gpa >= 70 and x.last_name == 'Fenske') or x.gpa > 90 else 'other'
    let code = closure(
        r#"
          0 LOAD_FAST                0 (x)
          2 LOAD_ATTR                0 (gpa)
          4 LOAD_CONST               1 (70)
          6 COMPARE_OP               5 (>=)
          8 POP_JUMP_IF_FALSE       20
         10 LOAD_FAST                0 (x)
         12 LOAD_ATTR                1 (last_name)
         14 LOAD_CONST               2 ('Fenske')
         16 COMPARE_OP               2 (==)
         18 POP_JUMP_IF_TRUE        30
    >>   20 LOAD_FAST                0 (x)
         22 LOAD_ATTR                0 (gpa)
         24 LOAD_CONST               3 (90)
         26 COMPARE_OP               4 (>)
         28 POP_JUMP_IF_FALSE       34
    >>   30 LOAD_CONST               4 ('honour')
         32 RETURN_VALUE
    >>   34 LOAD_CONST               5 ('other')
         36 RETURN_VALUE
        "#,
    );
    let expr = compile(&code, &CompileOptions::with_model(make_model())).unwrap().to_expression().unwrap();
    assert_eq!(
        expr,
        json!({"$cond": {
            "if": {"$or": [
                {"$and": [{"$gte": ["$gpa", 70]}, {"$eq": ["$LastName", "Fenske"]}]},
                {"$gt": ["$gpa", 90]}
            ]},
            "then": "honour",
            "else": "other"
        }})
    );

    let executor = make_students();
    let docs = executor
        .aggregate("students", &[json!({"$sort": {"_id": 1}}), json!({"$project": {"_id": 0, "result": expr}})])
        .unwrap()
        .collect::<Vec<_>>();
    let results: Vec<&str> = docs.iter().filter_map(|d| d["result"].as_str()).collect();
    assert_eq!(results, vec!["honour", "honour", "other", "other"]);
}

#[test]
fn test_resume_prefixed_listing_compiles() {
    let tree = compile(
        &closure(
            r#"
  1           0 RESUME                   0
              2 LOAD_FAST                0 (x)
              4 LOAD_ATTR                0 (gpa)
             14 LOAD_CONST               1 (10)
             16 COMPARE_OP               5 (>=)
             22 RETURN_VALUE
            "#,
        ),
        &CompileOptions::default(),
    )
    .unwrap();
    assert_eq!(tree.to_query_document().unwrap(), json!({"gpa": {"$gte": 10}}));
}

#[test]
fn test_scalars_and_grouping() {
    let executor = make_students();
    let query = Queryable::for_model(&executor, make_model());
    assert_eq!(query.max(&attribute("gpa")).unwrap(), json!(92));
    assert_eq!(query.min(&attribute("gpa")).unwrap(), json!(48));
    assert_eq!(query.sum(&attribute("gpa")).unwrap(), json!(278));
    assert_eq!(query.average(&attribute("gpa")).unwrap(), json!(69.5));
    assert!(matches!(query.max(&attribute("labs")), Err(LambdaQueryError::UnsupportedProjection(_))));

    let groups = query.clone().group_by(&attribute("last_name")).unwrap().to_list().unwrap();
    assert_eq!(groups.len(), 3);
    assert_eq!(groups[0]["_id"], json!("Fenske"));
    assert_eq!(ids(groups[0]["items"].as_array().unwrap()), vec![1, 4]);
}

#[test]
fn test_terminal_operators() {
    let executor = make_students();
    let query = Queryable::for_model(&executor, make_model());
    let fenske = closure("0 LOAD_FAST x\n2 LOAD_ATTR last_name\n4 LOAD_CONST 'Fenske'\n6 COMPARE_OP ==\n8 RETURN_VALUE");
    let wu = closure("0 LOAD_FAST x\n2 LOAD_ATTR last_name\n4 LOAD_CONST 'Wu'\n6 COMPARE_OP ==\n8 RETURN_VALUE");
    assert_eq!(query.count().unwrap(), 4);
    assert!(query.any(Some(&wu)).unwrap());
    assert!(!query.all(Some(&wu)).unwrap());
    assert_eq!(query.first(Some(&fenske)).unwrap()["_id"], json!(1));
    assert_eq!(query.single(Some(&wu)).unwrap()["_id"], json!(3));
    assert_eq!(query.single(Some(&fenske)), Err(LambdaQueryError::MoreThanOneElement));
    let nobody = closure("0 LOAD_FAST x\n2 LOAD_ATTR gpa\n4 LOAD_CONST 100\n6 COMPARE_OP >\n8 RETURN_VALUE");
    assert_eq!(query.first(Some(&nobody)), Err(LambdaQueryError::NoElements));
    assert_eq!(query.single_or_default(Some(&nobody)).unwrap(), None);
}

#[test]
fn test_compile_errors_propagate() {
    let executor = make_students();
    let query = Queryable::new(&executor, "students");
    let unsupported = closure("0 LOAD_FAST x\n2 LOAD_ATTR name\n4 LOAD_METHOD upper\n6 RETURN_VALUE");
    assert!(matches!(query.clone().filter(&unsupported), Err(LambdaQueryError::UnsupportedOperation(_))));
    let floor = closure("0 LOAD_FAST x\n2 LOAD_ATTR gpa\n4 LOAD_CONST 2\n6 BINARY_FLOOR_DIVIDE\n8 RETURN_VALUE");
    assert!(matches!(query.clone().filter(&floor), Err(LambdaQueryError::UnknownOperator(_))));
    let predicate = closure("0 LOAD_FAST x\n2 LOAD_ATTR gpa\n4 LOAD_CONST 2\n6 COMPARE_OP >\n8 RETURN_VALUE");
    assert!(matches!(query.clone().select(&predicate), Err(LambdaQueryError::UnsupportedProjection(_))));
    let empty = CodeObject::new(&["x"], Vec::new());
    assert!(matches!(compile(&empty, &CompileOptions::default()), Err(LambdaQueryError::MalformedClosure(_))));
}

const COMPARISONS: [(&str, &str); 8] = [
    ("==", "$eq"),
    ("!=", "$ne"),
    ("<", "$lt"),
    ("<=", "$lte"),
    (">", "$gt"),
    (">=", "$gte"),
    ("in", "$in"),
    ("not in", "$nin"),
];

fn conjunction_listing(n: usize) -> String {
    let end = 10 * n - 2;
    let mut listing = String::new();
    for i in 0..n {
        let at = 10 * i;
        listing.push_str(&format!(
            "{} LOAD_FAST x\n{} LOAD_ATTR f{}\n{} LOAD_CONST {}\n{} COMPARE_OP ==\n",
            at,
            at + 2,
            i,
            at + 4,
            i,
            at + 6
        ));
        if i + 1 < n {
            listing.push_str(&format!("{} JUMP_IF_FALSE_OR_POP {}\n", at + 8, end));
        }
    }
    listing.push_str(&format!("{} RETURN_VALUE\n", end));
    listing
}

proptest! {
    #[test]
    fn comparison_operator_table(idx in 0usize..8, val in -1000i64..1000) {
        let (symbol, token) = COMPARISONS[idx];
        let operand = if symbol.ends_with("in") { format!("({}, {})", val, val + 1) } else { val.to_string() };
        let listing = format!("0 LOAD_FAST x\n2 LOAD_ATTR a\n4 LOAD_CONST {}\n6 COMPARE_OP {}\n8 RETURN_VALUE", operand, symbol);
        let doc = compile_listing("x", &listing, &CompileOptions::default()).unwrap().to_query_document().unwrap();
        let expected = if symbol.ends_with("in") { json!([val, val + 1]) } else { json!(val) };
        prop_assert_eq!(doc, json!({"a": { token: expected }}));
    }
}

proptest! {
    #[test]
    fn same_operator_conjuncts_stay_flat(n in 2usize..9) {
        let tree = compile_listing("x", &conjunction_listing(n), &CompileOptions::default()).unwrap();
        let doc = tree.to_query_document().unwrap();
        let terms = doc["$and"].as_array().unwrap();
        prop_assert_eq!(terms.len(), n);
        for (i, term) in terms.iter().enumerate() {
            prop_assert_eq!(term, &json!({ format!("f{}", i): {"$eq": i} }));
        }
    }
}

proptest! {
    #[test]
    fn literals_pass_through_unchanged(val in any::<i64>(), text in "[a-zA-Z0-9 ]{0,24}") {
        let add = compile_listing(
            "x",
            &format!("0 LOAD_FAST x\n2 LOAD_ATTR gpa\n4 LOAD_CONST {}\n6 BINARY_ADD\n8 RETURN_VALUE", val),
            &CompileOptions::default(),
        )
        .unwrap();
        prop_assert_eq!(add.to_expression().unwrap(), json!({"$add": ["$gpa", val]}));
        let eq = compile_listing(
            "x",
            &format!("0 LOAD_FAST x\n2 LOAD_ATTR name\n4 LOAD_CONST '{}'\n6 COMPARE_OP ==\n8 RETURN_VALUE", text),
            &CompileOptions::default(),
        )
        .unwrap();
        prop_assert_eq!(eq.to_query_document().unwrap(), json!({"name": {"$eq": text}}));
    }
}

proptest! {
    #[test]
    fn memory_filter_agrees_with_direct_count(prices in prop::collection::vec(0i64..100, 0..40), threshold in 0i64..100) {
        let docs: Vec<Value> = prices.iter().map(|p| json!({"price": p})).collect();
        let executor = MemoryExecutor::new().with_collection("sales", docs);
        let code = closure(&format!("0 LOAD_FAST x\n2 LOAD_ATTR price\n4 LOAD_CONST {}\n6 COMPARE_OP >=\n8 RETURN_VALUE", threshold));
        let counted = Queryable::new(&executor, "sales").filter(&code).unwrap().count().unwrap();
        let expected = prices.iter().filter(|p| **p >= threshold).count() as u64;
        prop_assert_eq!(counted, expected);
    }
}
