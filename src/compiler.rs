//! Compiler module: the closure-to-query entry point.
//!
//! `compile` decompiles a closure body into an AST and translates it in one call.
//! The result is consumed by the pipeline stage builders.

use crate::decompiler::Decompiler;
use crate::instruction::CodeObject;
use crate::model::CollectionModel;
use crate::translator::{ExpressionTree, Translator};
use crate::LambdaQueryError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompileOptions {
    /// Maps closure attribute names onto document field names.
    pub model: Option<Arc<CollectionModel>>,
}

impl CompileOptions {
    pub fn with_model(model: Arc<CollectionModel>) -> Self {
        Self { model: Some(model) }
    }
}

/// Decompiles and translates a `(record) -> value` closure.
#[instrument(level = "trace", skip(code, options), fields(name = %code.name))]
pub fn compile(code: &CodeObject, options: &CompileOptions) -> Result<ExpressionTree, LambdaQueryError> {
    if code.arg_count != 1 {
        return Err(LambdaQueryError::MalformedClosure(format!(
            "closure '{}' takes {} positional parameters, expected 1",
            code.name, code.arg_count
        )));
    }
    let lambda = Decompiler::decompile(code)?;
    let tree = Translator::new(options.model.as_deref()).translate(lambda)?;
    debug!(closure = %tree.root(), annotated = tree.annotations().len(), "compiled closure");
    Ok(tree)
}

/// Compiles a closure given as a disassembly listing.
pub fn compile_listing(param: &str, listing: &str, options: &CompileOptions) -> Result<ExpressionTree, LambdaQueryError> {
    let code = CodeObject::from_listing(&[param], listing)?;
    compile(&code, options)
}
