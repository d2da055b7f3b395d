//! Node storage
//!
//! Nodes live in a single arena and refer to each other by [`NodeId`], which
//! makes cyclic graphs of identity nodes representable without shared
//! ownership. Value nodes are immutable after creation and must never sit on a
//! cycle made only of value nodes.

use super::schema::{CompareMode, FieldType, SchemaRegistry};
use crate::context::CompilationContext;
use crate::error::{CoreError, CoreResult};
use crate::ids::collections::{new_id_map, IdMap};
use crate::ids::{KindId, NodeId};
use crate::types::Type;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Node(NodeId),
    List(Vec<FieldValue>),
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Type(Type),
    /// Empty optional
    Absent,
}

impl FieldValue {
    pub fn as_node(&self) -> Option<NodeId> {
        match self {
            FieldValue::Node(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_type(&self) -> Option<&Type> {
        match self {
            FieldValue::Type(ty) => Some(ty),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Node references in declared order, looking through lists
    pub fn node_refs(&self, out: &mut Vec<NodeId>) {
        match self {
            FieldValue::Node(id) => out.push(*id),
            FieldValue::List(items) => items.iter().for_each(|item| item.node_refs(out)),
            _ => {}
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            FieldValue::Node(_) => "node",
            FieldValue::List(_) => "list",
            FieldValue::Int(_) => "int",
            FieldValue::Float(_) => "float",
            FieldValue::Str(_) => "str",
            FieldValue::Bool(_) => "bool",
            FieldValue::Type(_) => "type",
            FieldValue::Absent => "absent",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub kind: KindId,
    pub mode: CompareMode,
    pub(crate) fields: Vec<FieldValue>,
    pub(crate) attrs: IndexMap<String, FieldValue>,
}

impl Node {
    pub fn fields(&self) -> &[FieldValue] {
        &self.fields
    }

    pub fn field(&self, index: usize) -> Option<&FieldValue> {
        self.fields.get(index)
    }

    pub fn attr(&self, name: &str) -> Option<&FieldValue> {
        self.attrs.get(name)
    }

    pub fn attrs(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn children(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        for field in &self.fields {
            field.node_refs(&mut out);
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct NodeArena {
    registry: SchemaRegistry,
    nodes: BTreeMap<NodeId, Node>,
}

impl NodeArena {
    pub fn new(registry: SchemaRegistry) -> Self {
        Self {
            registry,
            nodes: BTreeMap::new(),
        }
    }

    pub fn with_builtin_kinds() -> Self {
        Self::new(SchemaRegistry::with_builtin_kinds())
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Kinds may be added at any time; existing kind ids are unaffected
    pub fn registry_mut(&mut self) -> &mut SchemaRegistry {
        &mut self.registry
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn node(&self, id: NodeId) -> CoreResult<&Node> {
        self.nodes
            .get(&id)
            .ok_or_else(|| CoreError::schema("<unknown>", format!("no node with id {}", id)))
    }

    pub fn kind_name(&self, id: NodeId) -> Option<&str> {
        let node = self.nodes.get(&id)?;
        self.registry.schema(node.kind).map(|s| s.name.as_str())
    }

    /// Nodes in id order
    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn create_node(
        &mut self,
        ctx: &CompilationContext,
        kind: &str,
        fields: Vec<FieldValue>,
    ) -> CoreResult<NodeId> {
        let kind_id = self
            .registry
            .kind_id(kind)
            .ok_or_else(|| CoreError::schema(kind, "unknown node kind"))?;
        let schema = self
            .registry
            .schema(kind_id)
            .ok_or_else(|| CoreError::schema(kind, "unknown node kind"))?;

        if fields.len() != schema.fields.len() {
            return Err(CoreError::schema(
                kind,
                format!(
                    "expected {} field(s), got {}",
                    schema.fields.len(),
                    fields.len()
                ),
            ));
        }
        for (spec, value) in schema.fields.iter().zip(&fields) {
            self.check_value(&spec.ty, value)
                .map_err(|reason| CoreError::schema(kind, format!("field `{}`: {}", spec.name, reason)))?;
        }

        let mode = schema.mode;
        let id = ctx.alloc_node_id();
        self.nodes.insert(
            id,
            Node {
                id,
                kind: kind_id,
                mode,
                fields,
                attrs: IndexMap::new(),
            },
        );
        Ok(id)
    }

    /// Replace a declared field of an identity node
    pub fn set_field(&mut self, id: NodeId, field: &str, value: FieldValue) -> CoreResult<()> {
        let (kind_name, index, ty) = {
            let node = self.node(id)?;
            let schema = self
                .registry
                .schema(node.kind)
                .ok_or_else(|| CoreError::schema("<unknown>", "node has unregistered kind"))?;
            if node.mode == CompareMode::Value {
                return Err(CoreError::schema(
                    &schema.name,
                    "value nodes are immutable after creation",
                ));
            }
            let index = schema
                .field_index(field)
                .ok_or_else(|| CoreError::schema(&schema.name, format!("no field `{}`", field)))?;
            (schema.name.clone(), index, schema.fields[index].ty.clone())
        };

        self.check_value(&ty, &value)
            .map_err(|reason| CoreError::schema(&kind_name, format!("field `{}`: {}", field, reason)))?;

        if let Some(node) = self.nodes.get_mut(&id) {
            node.fields[index] = value;
        }
        Ok(())
    }

    /// Attach a hidden attribute declared by the kind's schema
    pub fn set_attr(&mut self, id: NodeId, name: &str, value: FieldValue) -> CoreResult<()> {
        let (kind_name, ty) = {
            let node = self.node(id)?;
            let schema = self
                .registry
                .schema(node.kind)
                .ok_or_else(|| CoreError::schema("<unknown>", "node has unregistered kind"))?;
            let spec = schema.hidden_spec(name).ok_or_else(|| {
                CoreError::schema(&schema.name, format!("no hidden attribute `{}`", name))
            })?;
            (schema.name.clone(), spec.ty.clone())
        };

        self.check_value(&ty, &value)
            .map_err(|reason| CoreError::schema(&kind_name, format!("attribute `{}`: {}", name, reason)))?;

        if let Some(node) = self.nodes.get_mut(&id) {
            node.attrs.insert(name.to_string(), value);
        }
        Ok(())
    }

    /// Look up a declared field by name
    pub fn field(&self, id: NodeId, name: &str) -> CoreResult<&FieldValue> {
        let node = self.node(id)?;
        let schema = self
            .registry
            .schema(node.kind)
            .ok_or_else(|| CoreError::schema("<unknown>", "node has unregistered kind"))?;
        schema
            .field_index(name)
            .and_then(|index| node.fields.get(index))
            .ok_or_else(|| CoreError::schema(&schema.name, format!("no field `{}`", name)))
    }

    pub(crate) fn check_value(&self, ty: &FieldType, value: &FieldValue) -> Result<(), String> {
        match (ty, value) {
            (FieldType::Optional(_), FieldValue::Absent) => Ok(()),
            (FieldType::Optional(inner), value) => self.check_value(inner, value),
            (FieldType::Node(constraint), FieldValue::Node(target)) => {
                let target_kind = self
                    .kind_name(*target)
                    .ok_or_else(|| format!("reference to missing node {}", target))?;
                match constraint {
                    Some(expected) if expected != target_kind => Err(format!(
                        "expected node of kind `{}`, found `{}`",
                        expected, target_kind
                    )),
                    _ => Ok(()),
                }
            }
            (FieldType::List(inner), FieldValue::List(items)) => {
                items.iter().try_for_each(|item| self.check_value(inner, item))
            }
            (FieldType::Int, FieldValue::Int(_))
            | (FieldType::Float, FieldValue::Float(_))
            | (FieldType::Str, FieldValue::Str(_))
            | (FieldType::Bool, FieldValue::Bool(_))
            | (FieldType::Type, FieldValue::Type(_)) => Ok(()),
            (expected, found) => Err(format!("expected {}, found {}", expected, found.describe())),
        }
    }

    /// Structural equality: identity nodes compare by id, value nodes by kind
    /// and fields
    pub fn equals(&self, a: NodeId, b: NodeId) -> bool {
        if a == b {
            return true;
        }
        match (self.nodes.get(&a), self.nodes.get(&b)) {
            (Some(na), Some(nb)) => {
                na.mode == CompareMode::Value
                    && nb.mode == CompareMode::Value
                    && na.kind == nb.kind
                    && na.fields.len() == nb.fields.len()
                    && na
                        .fields
                        .iter()
                        .zip(&nb.fields)
                        .all(|(fa, fb)| self.values_equal(fa, fb))
            }
            _ => false,
        }
    }

    fn values_equal(&self, a: &FieldValue, b: &FieldValue) -> bool {
        match (a, b) {
            (FieldValue::Node(x), FieldValue::Node(y)) => self.equals(*x, *y),
            (FieldValue::List(xs), FieldValue::List(ys)) => {
                xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| self.values_equal(x, y))
            }
            _ => a == b,
        }
    }

    /// Verify that no cycle consists solely of value nodes
    pub fn check_value_acyclic(&self) -> CoreResult<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Active,
            Done,
        }
        let mut marks: IdMap<NodeId, Mark> = new_id_map();

        for root in self.nodes.values().filter(|n| n.mode == CompareMode::Value) {
            if marks.contains_key(&root.id) {
                continue;
            }
            // (node, children, next child index)
            let mut stack = vec![(root.id, self.value_children(root.id), 0usize)];
            marks.insert(root.id, Mark::Active);

            while let Some(frame) = stack.last_mut() {
                if frame.2 < frame.1.len() {
                    let child = frame.1[frame.2];
                    frame.2 += 1;
                    match marks.get(&child) {
                        Some(Mark::Active) => {
                            let kind = self.kind_name(child).unwrap_or("<unknown>").to_string();
                            return Err(CoreError::schema(
                                kind,
                                format!("value node {} lies on a cycle of value nodes", child),
                            ));
                        }
                        Some(Mark::Done) => {}
                        None => {
                            marks.insert(child, Mark::Active);
                            let children = self.value_children(child);
                            stack.push((child, children, 0));
                        }
                    }
                } else {
                    marks.insert(frame.0, Mark::Done);
                    stack.pop();
                }
            }
        }
        Ok(())
    }

    fn value_children(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes
            .get(&id)
            .map(|node| {
                node.children()
                    .into_iter()
                    .filter(|child| {
                        self.nodes
                            .get(child)
                            .is_some_and(|c| c.mode == CompareMode::Value)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Insert a node with a known id; used by table import
    pub(crate) fn insert_raw(&mut self, node: Node) -> CoreResult<()> {
        if self.nodes.contains_key(&node.id) {
            return Err(CoreError::Import(format!("duplicate node id {}", node.id)));
        }
        self.nodes.insert(node.id, node);
        Ok(())
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::schema::KindSchema;

    fn arena() -> NodeArena {
        let mut registry = SchemaRegistry::empty();
        registry
            .register(KindSchema::value("Leaf").field("v", FieldType::Int))
            .unwrap();
        registry
            .register(
                KindSchema::value("Pair")
                    .field("l", FieldType::node())
                    .field("r", FieldType::node()),
            )
            .unwrap();
        registry
            .register(
                KindSchema::identity("Cell")
                    .field("next", FieldType::optional(FieldType::node_of("Cell")))
                    .hidden("note", FieldType::Str),
            )
            .unwrap();
        NodeArena::new(registry)
    }

    #[test]
    fn test_value_nodes_compare_structurally() {
        let ctx = CompilationContext::default();
        let mut arena = arena();
        let a = arena.create_node(&ctx, "Leaf", vec![FieldValue::Int(1)]).unwrap();
        let b = arena.create_node(&ctx, "Leaf", vec![FieldValue::Int(1)]).unwrap();
        let c = arena.create_node(&ctx, "Leaf", vec![FieldValue::Int(2)]).unwrap();
        let p1 = arena
            .create_node(&ctx, "Pair", vec![FieldValue::Node(a), FieldValue::Node(c)])
            .unwrap();
        let p2 = arena
            .create_node(&ctx, "Pair", vec![FieldValue::Node(b), FieldValue::Node(c)])
            .unwrap();

        assert!(arena.equals(a, b));
        assert!(!arena.equals(a, c));
        assert!(arena.equals(p1, p2));
    }

    #[test]
    fn test_identity_nodes_compare_by_id() {
        let ctx = CompilationContext::default();
        let mut arena = arena();
        let x = arena.create_node(&ctx, "Cell", vec![FieldValue::Absent]).unwrap();
        let y = arena.create_node(&ctx, "Cell", vec![FieldValue::Absent]).unwrap();
        assert!(arena.equals(x, x));
        assert!(!arena.equals(x, y));
    }

    #[test]
    fn test_identity_cycle_allowed() {
        let ctx = CompilationContext::default();
        let mut arena = arena();
        let x = arena.create_node(&ctx, "Cell", vec![FieldValue::Absent]).unwrap();
        let y = arena.create_node(&ctx, "Cell", vec![FieldValue::Node(x)]).unwrap();
        arena.set_field(x, "next", FieldValue::Node(y)).unwrap();

        assert_eq!(arena.get(x).unwrap().children(), vec![y]);
        assert!(arena.check_value_acyclic().is_ok());
    }

    #[test]
    fn test_schema_violations() {
        let ctx = CompilationContext::default();
        let mut arena = arena();
        let leaf = arena.create_node(&ctx, "Leaf", vec![FieldValue::Int(0)]).unwrap();

        assert!(arena.create_node(&ctx, "Leaf", vec![]).is_err());
        assert!(arena.create_node(&ctx, "Leaf", vec![FieldValue::Str("x".into())]).is_err());
        assert!(arena.create_node(&ctx, "Nope", vec![]).is_err());
        // kind-restricted reference
        assert!(arena.create_node(&ctx, "Cell", vec![FieldValue::Node(leaf)]).is_err());
        // dangling reference
        assert!(arena
            .create_node(&ctx, "Pair", vec![FieldValue::Node(leaf), FieldValue::Node(NodeId::from_raw(999))])
            .is_err());
        // value nodes are frozen
        assert!(arena.set_field(leaf, "v", FieldValue::Int(3)).is_err());
    }

    #[test]
    fn test_hidden_attributes() {
        let ctx = CompilationContext::default();
        let mut arena = arena();
        let cell = arena.create_node(&ctx, "Cell", vec![FieldValue::Absent]).unwrap();

        arena.set_attr(cell, "note", FieldValue::Str("hot".into())).unwrap();
        assert_eq!(arena.get(cell).unwrap().attr("note").and_then(|v| v.as_str()), Some("hot"));
        assert!(arena.set_attr(cell, "missing", FieldValue::Bool(true)).is_err());
        assert!(arena.set_attr(cell, "note", FieldValue::Int(1)).is_err());
    }
}
