//! Model module: declares a collection and how closure attributes map onto document fields.
//!
//! This module provides the CollectionModel type and its builder.

use crate::types::FieldType;
use crate::LambdaQueryError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelAttribute {
    pub name: String,
    /// Name of the stored document field.
    pub field: String,
    pub field_type: FieldType,
}

/// Deserializing goes through the builder, so the name index is always rebuilt
/// and a stored model gets the same validation as a built one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "CollectionModelBuilder")]
#[non_exhaustive]
pub struct CollectionModel {
    collection: String,
    attributes: Vec<ModelAttribute>,
    #[serde(skip_serializing)]
    by_name: HashMap<String, usize>,
}

impl CollectionModel {
    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn attributes(&self) -> &[ModelAttribute] {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&ModelAttribute> {
        self.by_name.get(name).and_then(|&idx| self.attributes.get(idx))
    }

    pub fn field_type(&self, name: &str) -> Option<&FieldType> {
        self.attribute(name).map(|attr| &attr.field_type)
    }

    /// Resolves a dotted attribute path to its document path. Only the first
    /// segment is mapped; unknown attributes pass through unchanged.
    pub fn resolve_path(&self, path: &str) -> String {
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };
        let head = self.attribute(head).map_or(head, |attr| attr.field.as_str());
        match rest {
            Some(rest) => format!("{}.{}", head, rest),
            None => head.to_string(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CollectionModelBuilder {
    collection: String,
    attributes: Vec<ModelAttribute>,
}

impl CollectionModelBuilder {
    pub fn new(collection: impl Into<String>) -> Self {
        Self { collection: collection.into(), attributes: Vec::new() }
    }

    /// An attribute stored under its own name.
    pub fn attribute(self, name: impl Into<String>, ty: FieldType) -> Self {
        let name = name.into();
        let field = name.clone();
        self.mapped_attribute(name, field, ty)
    }

    /// An attribute stored under a different document field name.
    pub fn mapped_attribute(mut self, name: impl Into<String>, field: impl Into<String>, ty: FieldType) -> Self {
        let name = name.into();
        // Last declaration of an attribute wins
        self.attributes.retain(|attr| attr.name != name);
        self.attributes.push(ModelAttribute { name, field: field.into(), field_type: ty });
        self
    }

    pub fn build(self) -> Result<CollectionModel, LambdaQueryError> {
        if self.collection.trim().is_empty() {
            return Err(LambdaQueryError::InvalidModel("collection name is empty".to_string()));
        }
        let mut by_name = HashMap::new();
        let mut fields = HashMap::new();
        for (idx, attr) in self.attributes.iter().enumerate() {
            if attr.field.is_empty() {
                return Err(LambdaQueryError::InvalidModel(format!("attribute '{}' maps to an empty field", attr.name)));
            }
            if let Some(other) = fields.insert(attr.field.as_str(), attr.name.as_str()) {
                return Err(LambdaQueryError::InvalidModel(format!(
                    "attributes '{}' and '{}' both map to field '{}'",
                    other, attr.name, attr.field
                )));
            }
            by_name.insert(attr.name.clone(), idx);
        }
        Ok(CollectionModel { collection: self.collection, attributes: self.attributes, by_name })
    }
}

impl TryFrom<CollectionModelBuilder> for CollectionModel {
    type Error = LambdaQueryError;

    fn try_from(builder: CollectionModelBuilder) -> Result<Self, Self::Error> {
        builder.build()
    }
}
