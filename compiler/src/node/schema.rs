//! Node kind schemas
//!
//! A schema lists the declared fields of a kind (in order), the hidden
//! attributes analyses may attach later, and whether nodes of the kind compare
//! by identity or structurally. The registry is open: embedders add kinds at
//! startup, and ids handed out earlier stay valid.

use crate::error::{CoreError, CoreResult};
use crate::ids::KindId;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    /// Reference to another node, optionally restricted to one kind
    Node(Option<String>),
    List(Box<FieldType>),
    Optional(Box<FieldType>),
    Int,
    Float,
    Str,
    Bool,
    Type,
}

impl FieldType {
    pub fn node() -> Self {
        FieldType::Node(None)
    }

    pub fn node_of(kind: &str) -> Self {
        FieldType::Node(Some(kind.to_string()))
    }

    pub fn list(inner: FieldType) -> Self {
        FieldType::List(Box::new(inner))
    }

    pub fn optional(inner: FieldType) -> Self {
        FieldType::Optional(Box::new(inner))
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Node(None) => write!(f, "node"),
            FieldType::Node(Some(kind)) => write!(f, "node<{}>", kind),
            FieldType::List(inner) => write!(f, "list<{}>", inner),
            FieldType::Optional(inner) => write!(f, "optional<{}>", inner),
            FieldType::Int => write!(f, "int"),
            FieldType::Float => write!(f, "float"),
            FieldType::Str => write!(f, "str"),
            FieldType::Bool => write!(f, "bool"),
            FieldType::Type => write!(f, "type"),
        }
    }
}

/// How two nodes of a kind are compared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareMode {
    /// Equal only to itself; may be mutated and may sit on reference cycles
    Identity,
    /// Immutable and acyclic; equal when kind and fields are structurally equal
    Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub ty: FieldType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindSchema {
    pub name: String,
    pub mode: CompareMode,
    pub fields: Vec<FieldSpec>,
    pub hidden: Vec<FieldSpec>,
}

impl KindSchema {
    pub fn identity(name: impl Into<String>) -> Self {
        Self::new(name, CompareMode::Identity)
    }

    pub fn value(name: impl Into<String>) -> Self {
        Self::new(name, CompareMode::Value)
    }

    fn new(name: impl Into<String>, mode: CompareMode) -> Self {
        Self {
            name: name.into(),
            mode,
            fields: Vec::new(),
            hidden: Vec::new(),
        }
    }

    pub fn field(mut self, name: &str, ty: FieldType) -> Self {
        self.fields.push(FieldSpec {
            name: name.to_string(),
            ty,
        });
        self
    }

    pub fn hidden(mut self, name: &str, ty: FieldType) -> Self {
        self.hidden.push(FieldSpec {
            name: name.to_string(),
            ty,
        });
        self
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn hidden_spec(&self, name: &str) -> Option<&FieldSpec> {
        self.hidden.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    kinds: IndexMap<String, KindSchema>,
}

impl SchemaRegistry {
    /// Registry with no kinds at all
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry preloaded with the statement and expression kinds the CFG
    /// builder understands
    pub fn with_builtin_kinds() -> Self {
        let mut registry = Self::empty();
        for schema in super::ast::builtin_kinds() {
            registry.insert(schema);
        }
        registry
    }

    /// Add the built-in kinds to a registry that may already hold others
    pub fn add_builtin_kinds(&mut self) -> CoreResult<()> {
        for schema in super::ast::builtin_kinds() {
            self.register(schema)?;
        }
        Ok(())
    }

    pub fn register(&mut self, schema: KindSchema) -> CoreResult<KindId> {
        if self.kinds.contains_key(&schema.name) {
            return Err(CoreError::schema(&schema.name, "kind is already registered"));
        }
        let mut seen = Vec::new();
        for field in schema.fields.iter().chain(schema.hidden.iter()) {
            if seen.contains(&field.name.as_str()) {
                return Err(CoreError::schema(
                    &schema.name,
                    format!("field `{}` declared twice", field.name),
                ));
            }
            seen.push(field.name.as_str());
        }
        Ok(self.insert(schema))
    }

    fn insert(&mut self, schema: KindSchema) -> KindId {
        let id = KindId::from_raw(self.kinds.len() as u32);
        self.kinds.insert(schema.name.clone(), schema);
        id
    }

    pub fn kind_id(&self, name: &str) -> Option<KindId> {
        self.kinds
            .get_index_of(name)
            .map(|index| KindId::from_raw(index as u32))
    }

    pub fn schema(&self, kind: KindId) -> Option<&KindSchema> {
        self.kinds.get_index(kind.index()).map(|(_, schema)| schema)
    }

    pub fn get(&self, name: &str) -> Option<&KindSchema> {
        self.kinds.get(name)
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let mut registry = SchemaRegistry::empty();
        let id = registry
            .register(
                KindSchema::value("Pair")
                    .field("left", FieldType::node())
                    .field("right", FieldType::node()),
            )
            .unwrap();

        assert_eq!(registry.kind_id("Pair"), Some(id));
        let schema = registry.schema(id).unwrap();
        assert_eq!(schema.mode, CompareMode::Value);
        assert_eq!(schema.field_index("right"), Some(1));
    }

    #[test]
    fn test_duplicate_kind_rejected() {
        let mut registry = SchemaRegistry::empty();
        registry.register(KindSchema::identity("A")).unwrap();
        let err = registry.register(KindSchema::identity("A")).unwrap_err();
        assert!(matches!(err, CoreError::SchemaViolation { .. }));
    }

    #[test]
    fn test_builtin_kinds_register_cleanly() {
        let mut checked = SchemaRegistry::empty();
        checked.add_builtin_kinds().unwrap();
        let preloaded = SchemaRegistry::with_builtin_kinds();
        assert_eq!(checked.len(), preloaded.len());
        for (index, schema) in super::super::ast::builtin_kinds().iter().enumerate() {
            assert_eq!(preloaded.kind_id(&schema.name), Some(KindId::from_raw(index as u32)));
            assert_eq!(checked.kind_id(&schema.name), preloaded.kind_id(&schema.name));
        }
    }

    #[test]
    fn test_builtin_kind_clash_is_reported() {
        let mut registry = SchemaRegistry::empty();
        registry
            .register(KindSchema::identity("Name").field("text", FieldType::Str))
            .unwrap();
        let err = registry.add_builtin_kinds().unwrap_err();
        assert!(matches!(err, CoreError::SchemaViolation { .. }));
    }

    #[test]
    fn test_duplicate_field_rejected() {
        let mut registry = SchemaRegistry::empty();
        let schema = KindSchema::identity("B")
            .field("x", FieldType::Int)
            .hidden("x", FieldType::Type);
        assert!(registry.register(schema).is_err());
    }

    #[test]
    fn test_field_type_display() {
        let ty = FieldType::list(FieldType::optional(FieldType::node_of("Name")));
        assert_eq!(ty.to_string(), "list<optional<node<Name>>>");
    }
}
