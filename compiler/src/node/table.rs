//! Flat `(kind, id, fields)` export of an arena
//!
//! References are plain ids inside the rows, so cyclic identity graphs export
//! without special casing. Import runs in two passes: allocate every row, then
//! resolve and validate fields, so forward and backward references both work.

use super::arena::{FieldValue, Node, NodeArena};
use super::schema::SchemaRegistry;
use crate::context::CompilationContext;
use crate::error::{CoreError, CoreResult};
use crate::ids::NodeId;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRow {
    pub kind: String,
    pub id: NodeId,
    pub fields: Vec<FieldValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attrs: Vec<(String, FieldValue)>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeTable {
    pub rows: Vec<NodeRow>,
}

impl NodeTable {
    /// Export every node in id order
    pub fn export(arena: &NodeArena) -> CoreResult<Self> {
        let rows = arena
            .iter()
            .map(|node| {
                let kind = arena
                    .registry()
                    .schema(node.kind)
                    .ok_or_else(|| CoreError::Import(format!("node {} has unregistered kind", node.id)))?;
                Ok(NodeRow {
                    kind: kind.name.clone(),
                    id: node.id,
                    fields: node.fields().to_vec(),
                    attrs: node
                        .attrs()
                        .map(|(name, value)| (name.to_string(), value.clone()))
                        .collect(),
                })
            })
            .collect::<CoreResult<Vec<_>>>()?;
        Ok(Self { rows })
    }

    /// Rebuild an arena against `registry`
    pub fn import(&self, registry: SchemaRegistry, ctx: &CompilationContext) -> CoreResult<NodeArena> {
        let mut arena = NodeArena::new(registry);

        // Pass 1: allocate
        for row in &self.rows {
            let kind = arena
                .registry()
                .kind_id(&row.kind)
                .ok_or_else(|| CoreError::Import(format!("unknown kind `{}` for {}", row.kind, row.id)))?;
            let mode = arena
                .registry()
                .schema(kind)
                .map(|schema| schema.mode)
                .ok_or_else(|| CoreError::Import(format!("unknown kind `{}`", row.kind)))?;
            if !row.id.is_valid() {
                return Err(CoreError::Import("row with invalid id".to_string()));
            }
            arena.insert_raw(Node {
                id: row.id,
                kind,
                mode,
                fields: Vec::new(),
                attrs: IndexMap::new(),
            })?;
        }

        // Pass 2: resolve fields
        for row in &self.rows {
            let schema = arena
                .registry()
                .get(&row.kind)
                .ok_or_else(|| CoreError::Import(format!("unknown kind `{}`", row.kind)))?;
            if schema.fields.len() != row.fields.len() {
                return Err(CoreError::Import(format!(
                    "{} `{}` has {} field(s), schema declares {}",
                    row.id,
                    row.kind,
                    row.fields.len(),
                    schema.fields.len()
                )));
            }
            for (spec, value) in schema.fields.iter().zip(&row.fields) {
                arena.check_value(&spec.ty, value).map_err(|reason| {
                    CoreError::Import(format!("{} field `{}`: {}", row.id, spec.name, reason))
                })?;
            }
            let mut attrs = IndexMap::new();
            for (name, value) in &row.attrs {
                let spec = schema.hidden_spec(name).ok_or_else(|| {
                    CoreError::Import(format!("{} has undeclared attribute `{}`", row.id, name))
                })?;
                arena.check_value(&spec.ty, value).map_err(|reason| {
                    CoreError::Import(format!("{} attribute `{}`: {}", row.id, name, reason))
                })?;
                attrs.insert(name.clone(), value.clone());
            }

            if let Some(node) = arena.node_mut(row.id) {
                node.fields = row.fields.clone();
                node.attrs = attrs;
            }
        }

        arena.check_value_acyclic().map_err(|e| CoreError::Import(e.to_string()))?;

        if let Some(max) = self.rows.iter().map(|row| row.id).max() {
            ctx.reserve_node_id(max);
        }
        log::debug!("imported {} node(s)", arena.len());
        Ok(arena)
    }

    pub fn to_json(&self) -> CoreResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| CoreError::Import(e.to_string()))
    }

    pub fn from_json(json: &str) -> CoreResult<Self> {
        serde_json::from_str(json).map_err(|e| CoreError::Import(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::schema::{FieldType, KindSchema};
    use pretty_assertions::assert_eq;

    fn registry() -> SchemaRegistry {
        let mut registry = SchemaRegistry::empty();
        registry
            .register(
                KindSchema::identity("Cell")
                    .field("next", FieldType::optional(FieldType::node_of("Cell")))
                    .hidden("tag", FieldType::Str),
            )
            .unwrap();
        registry
            .register(KindSchema::value("Leaf").field("v", FieldType::Int))
            .unwrap();
        registry
            .register(KindSchema::value("Box").field("inner", FieldType::node()))
            .unwrap();
        registry
    }

    #[test]
    fn test_cyclic_identity_round_trip() {
        let ctx = CompilationContext::default();
        let mut arena = NodeArena::new(registry());
        let a = arena.create_node(&ctx, "Cell", vec![FieldValue::Absent]).unwrap();
        let b = arena.create_node(&ctx, "Cell", vec![FieldValue::Node(a)]).unwrap();
        arena.set_field(a, "next", FieldValue::Node(b)).unwrap();
        arena.set_attr(a, "tag", FieldValue::Str("head".into())).unwrap();

        let table = NodeTable::export(&arena).unwrap();
        let json = table.to_json().unwrap();
        let restored = NodeTable::from_json(&json)
            .unwrap()
            .import(registry(), &ctx)
            .unwrap();

        assert_eq!(NodeTable::export(&restored).unwrap(), table);
        assert_eq!(restored.get(a).unwrap().children(), vec![b]);
        assert_eq!(restored.get(b).unwrap().children(), vec![a]);
        // the allocator moved past the imported ids
        assert!(ctx.alloc_node_id() > b);
    }

    #[test]
    fn test_import_advances_fresh_context() {
        let table = NodeTable {
            rows: vec![NodeRow {
                kind: "Leaf".into(),
                id: NodeId::from_raw(41),
                fields: vec![FieldValue::Int(3)],
                attrs: vec![],
            }],
        };
        let ctx = CompilationContext::default();
        table.import(registry(), &ctx).unwrap();
        assert_eq!(ctx.alloc_node_id(), NodeId::from_raw(42));
    }

    #[test]
    fn test_value_cycle_rejected() {
        let table = NodeTable {
            rows: vec![
                NodeRow {
                    kind: "Box".into(),
                    id: NodeId::from_raw(0),
                    fields: vec![FieldValue::Node(NodeId::from_raw(1))],
                    attrs: vec![],
                },
                NodeRow {
                    kind: "Box".into(),
                    id: NodeId::from_raw(1),
                    fields: vec![FieldValue::Node(NodeId::from_raw(0))],
                    attrs: vec![],
                },
            ],
        };
        let err = table.import(registry(), &CompilationContext::default()).unwrap_err();
        assert!(matches!(err, CoreError::Import(_)));
    }

    #[test]
    fn test_dangling_reference_rejected() {
        let table = NodeTable {
            rows: vec![NodeRow {
                kind: "Box".into(),
                id: NodeId::from_raw(0),
                fields: vec![FieldValue::Node(NodeId::from_raw(9))],
                attrs: vec![],
            }],
        };
        assert!(table.import(registry(), &CompilationContext::default()).is_err());
    }
}
