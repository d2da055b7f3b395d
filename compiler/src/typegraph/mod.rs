//! Type dependency graph
//!
//! One node per SSA definition plus one per typed expression. Edges point from
//! a node to the nodes its type is computed from, so the graph is resolved
//! dependencies first after condensing its strongly connected components.

pub mod builder;
pub mod resolve;
pub mod rules;
pub mod scc;

use crate::ids::{DefId, NodeId, TypeNodeId};
use crate::types::Type;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

pub use builder::{link, CallSite, FunctionTypeGraph, LinkedFunction, ProgramGraph};
pub use resolve::{Resolution, Resolver, ResolverStats, SccFailure};
pub use rules::{FunctionRules, TypeRule};
pub use scc::{Condensation, Component};

/// How a node's type is computed from its dependencies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TypeNodeKind {
    /// Declared or literal type, known up front
    Constant(Type),
    /// Same type as another node
    Copy(TypeNodeId),
    /// Phi or merged call-site arguments; unresolved inputs are skipped
    Join(SmallVec<[TypeNodeId; 4]>),
    /// Result of the named rule applied to the argument types
    Apply { rule: String, args: Vec<TypeNodeId> },
    /// A variable with no assignment on some path; has no type of its own
    Undefined,
}

impl TypeNodeKind {
    pub fn dependencies(&self) -> SmallVec<[TypeNodeId; 4]> {
        match self {
            TypeNodeKind::Constant(_) | TypeNodeKind::Undefined => SmallVec::new(),
            TypeNodeKind::Copy(n) => smallvec::smallvec![*n],
            TypeNodeKind::Join(inputs) => inputs.clone(),
            TypeNodeKind::Apply { args, .. } => args.iter().copied().collect(),
        }
    }

    fn remap(&mut self, offset: u32) {
        let shift = |n: &mut TypeNodeId| *n = TypeNodeId::from_raw(n.as_raw() + offset);
        match self {
            TypeNodeKind::Copy(n) => shift(n),
            TypeNodeKind::Join(inputs) => inputs.iter_mut().for_each(shift),
            TypeNodeKind::Apply { args, .. } => args.iter_mut().for_each(shift),
            TypeNodeKind::Constant(_) | TypeNodeKind::Undefined => {}
        }
    }
}

/// What a type node stands for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeOrigin {
    /// Type of an SSA definition
    Def(DefId),
    /// Type of an expression node
    Expr(NodeId),
    /// Return type of the owning function
    Return,
    /// Internal node with no counterpart in the source
    Synthetic,
}

/// One vertex of the type dependency graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeGraphNode {
    /// Index of the node in its graph
    pub id: TypeNodeId,
    pub kind: TypeNodeKind,
    /// What the node's type is reported for
    pub origin: NodeOrigin,
    /// Function the node was built for
    pub function: Option<String>,
}

/// Type dependency graph; node ids are indices into it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeGraph {
    nodes: Vec<TypeGraphNode>,
}

impl TypeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, kind: TypeNodeKind, origin: NodeOrigin) -> TypeNodeId {
        let id = TypeNodeId::from_raw(self.nodes.len() as u32);
        self.nodes.push(TypeGraphNode {
            id,
            kind,
            origin,
            function: None,
        });
        id
    }

    /// Allocate a node to be filled by [`TypeGraph::set`]
    pub fn reserve(&mut self, origin: NodeOrigin) -> TypeNodeId {
        self.add(TypeNodeKind::Undefined, origin)
    }

    pub fn set(&mut self, id: TypeNodeId, kind: TypeNodeKind) {
        if let Some(node) = self.nodes.get_mut(id.index()) {
            node.kind = kind;
        }
    }

    pub fn node(&self, id: TypeNodeId) -> Option<&TypeGraphNode> {
        self.nodes.get(id.index())
    }

    pub(crate) fn node_mut(&mut self, id: TypeNodeId) -> Option<&mut TypeGraphNode> {
        self.nodes.get_mut(id.index())
    }

    pub fn kind(&self, id: TypeNodeId) -> Option<&TypeNodeKind> {
        self.node(id).map(|n| &n.kind)
    }

    pub fn dependencies(&self, id: TypeNodeId) -> SmallVec<[TypeNodeId; 4]> {
        self.kind(id).map(TypeNodeKind::dependencies).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TypeGraphNode> {
        self.nodes.iter()
    }

    pub fn edge_count(&self) -> usize {
        self.nodes.iter().map(|n| n.kind.dependencies().len()).sum()
    }

    pub fn condense(&self) -> Condensation {
        Condensation::build(self.len(), |id| self.dependencies(id))
    }

    /// Append every node of `other`, shifting its ids; returns the shift
    pub(crate) fn absorb(&mut self, other: TypeGraph, function: &str) -> u32 {
        let offset = self.nodes.len() as u32;
        for mut node in other.nodes {
            node.id = TypeNodeId::from_raw(node.id.as_raw() + offset);
            node.kind.remap(offset);
            node.function = Some(function.to_string());
            self.nodes.push(node);
        }
        offset
    }
}

impl fmt::Display for TypeGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for node in &self.nodes {
            write!(f, "{} = ", node.id)?;
            match &node.kind {
                TypeNodeKind::Constant(ty) => write!(f, "{}", ty)?,
                TypeNodeKind::Copy(n) => write!(f, "copy {}", n)?,
                TypeNodeKind::Join(inputs) => {
                    let names: Vec<String> = inputs.iter().map(|n| n.to_string()).collect();
                    write!(f, "join({})", names.join(", "))?
                }
                TypeNodeKind::Apply { rule, args } => {
                    let names: Vec<String> = args.iter().map(|n| n.to_string()).collect();
                    write!(f, "{}({})", rule, names.join(", "))?
                }
                TypeNodeKind::Undefined => write!(f, "undefined")?,
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
