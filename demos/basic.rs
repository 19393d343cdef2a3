use lambdaquery::*;
use serde_json::json;
use std::sync::Arc;

fn main() -> Result<(), LambdaQueryError> {
    // 1. Describe the collection
    let model = CollectionModelBuilder::new("students")
        .mapped_attribute("first_name", "FirstName", FieldType::String)
        .mapped_attribute("last_name", "LastName", FieldType::String)
        .attribute("gpa", FieldType::Integer)
        .build()?;
    let model = Arc::new(model);

    // 2. Load closures from their disassembly
    // lambda x: x.gpa >= 60 and x.last_name == 'Fenske'
    let predicate = CodeObject::from_listing(
        &["x"],
        r#"
          0 LOAD_FAST                0 (x)
          2 LOAD_ATTR                0 (gpa)
          4 LOAD_CONST               1 (60)
          6 COMPARE_OP               5 (>=)
          8 JUMP_IF_FALSE_OR_POP    18
         10 LOAD_FAST                0 (x)
         12 LOAD_ATTR                1 (last_name)
         14 LOAD_CONST               2 ('Fenske')
         16 COMPARE_OP               2 (==)
    >>   18 RETURN_VALUE
        "#,
    )?;
    // lambda x: (x.first_name, x.gpa)
    let selector = CodeObject::from_listing(
        &["x"],
        "0 LOAD_FAST x\n2 LOAD_ATTR first_name\n4 LOAD_FAST x\n6 LOAD_ATTR gpa\n8 BUILD_TUPLE 2\n10 RETURN_VALUE",
    )?;
    let gpa = CodeObject::from_listing(&["x"], "0 LOAD_FAST x\n2 LOAD_ATTR gpa\n4 RETURN_VALUE")?;

    // 3. Inspect the translation
    let tree = compile(&predicate, &CompileOptions::with_model(model.clone()))?;
    println!("Closure: {}", tree.root());
    println!("Match document: {}", tree.to_query_document()?);

    // 4. Build and run a query against in-memory documents
    let executor = MemoryExecutor::new().with_collection(
        "students",
        vec![
            json!({"_id": 1, "FirstName": "Bruce", "LastName": "Fenske", "gpa": 75}),
            json!({"_id": 2, "FirstName": "Alice", "LastName": "Moore", "gpa": 92}),
            json!({"_id": 3, "FirstName": "Dana", "LastName": "Fenske", "gpa": 63}),
        ],
    );
    let query = Queryable::for_model(&executor, model)
        .filter(&predicate)?
        .order_by_descending(&gpa)?
        .select(&selector)?;
    println!("Pipeline: {}", serde_json::Value::Array(query.pipeline()));
    for row in query.iter()? {
        println!("Row: {}", row);
    }
    Ok(())
}
