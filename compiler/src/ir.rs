//! Typed SSA IR handed to lowering, and its flat export table
//!
//! [`TypedFunction`] is the query surface: definitions of uses, types of
//! definitions, phi inputs and blocks in dominator preorder. [`IrTable`] is the
//! serialization boundary. Every part is exported as plain rows keyed by id,
//! so nothing in the table holds a native reference and cyclic node graphs
//! round-trip unchanged.

use crate::cfg::{BasicBlock, ControlFlowGraph, LoopInfo};
use crate::context::CompilationContext;
use crate::error::{CoreError, CoreResult};
use crate::ids::{BlockId, DefId, NodeId, UseId};
use crate::node::{NodeArena, NodeTable, SchemaRegistry};
use crate::ssa::{Def, DefKind, DominanceTree, SsaEvent, SsaFunction, Use};
use crate::types::Type;
use crate::unbound::SentinelRequirement;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of type resolution for one definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DefType {
    Resolved(Type),
    /// No type could be assigned; carries the reason
    Unresolved(String),
    /// The `Undefined` reaching value of a variable; lowered as poison
    Unbound,
}

impl DefType {
    pub fn resolved(&self) -> Option<&Type> {
        match self {
            DefType::Resolved(ty) => Some(ty),
            _ => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, DefType::Resolved(_))
    }
}

impl fmt::Display for DefType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefType::Resolved(ty) => write!(f, "{}", ty),
            DefType::Unresolved(reason) => write!(f, "<unresolved: {}>", reason),
            DefType::Unbound => write!(f, "<unbound>"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TypedFunction {
    pub name: String,
    pub node: NodeId,
    pub cfg: ControlFlowGraph,
    pub ssa: SsaFunction,
    pub types: IndexMap<DefId, DefType>,
    pub return_type: DefType,
    /// Reads that need a poison-initialized slot
    pub requirements: Vec<SentinelRequirement>,
}

impl TypedFunction {
    /// Dominance must already be computed on `cfg`
    pub fn new(
        cfg: ControlFlowGraph,
        ssa: SsaFunction,
        types: IndexMap<DefId, DefType>,
        return_type: DefType,
        requirements: Vec<SentinelRequirement>,
    ) -> CoreResult<Self> {
        if cfg.dominance().is_none() {
            return Err(CoreError::malformed_cfg(&cfg.function, None, "dominance not computed"));
        }
        Ok(Self {
            name: ssa.function.clone(),
            node: ssa.node,
            cfg,
            ssa,
            types,
            return_type,
            requirements,
        })
    }

    pub fn definition_of(&self, use_id: UseId) -> Option<&Def> {
        self.ssa.definition_of(use_id)
    }

    pub fn type_of(&self, def: DefId) -> Option<&DefType> {
        self.types.get(&def)
    }

    /// Resolved type of the definition reaching `use_id`
    pub fn type_of_use(&self, use_id: UseId) -> Option<&Type> {
        let def = self.definition_of(use_id)?;
        self.type_of(def.id)?.resolved()
    }

    pub fn incoming_of(&self, phi: DefId) -> Option<&[UseId]> {
        self.ssa.incoming_of(phi)
    }

    pub fn dominance(&self) -> Option<&DominanceTree> {
        self.cfg.dominance()
    }

    pub fn blocks_in_dominator_preorder(&self) -> Vec<BlockId> {
        self.dominance()
            .map(|tree| tree.preorder().to_vec())
            .unwrap_or_default()
    }

    /// Defs whose type could not be resolved
    pub fn unresolved(&self) -> impl Iterator<Item = (DefId, &str)> {
        self.types.iter().filter_map(|(def, ty)| match ty {
            DefType::Unresolved(reason) => Some((*def, reason.as_str())),
            _ => None,
        })
    }

    /// Variable definitions with their types, skipping `Undefined` defs
    pub fn typed_defs(&self) -> impl Iterator<Item = (&Def, &DefType)> {
        self.ssa
            .defs()
            .filter(|d| d.kind != DefKind::Undefined)
            .filter_map(|d| self.types.get(&d.id).map(|ty| (d, ty)))
    }

    pub fn to_table(&self) -> FunctionTable {
        FunctionTable {
            name: self.name.clone(),
            node: self.node,
            entry_block: self.cfg.entry_block,
            blocks: self.cfg.blocks().cloned().collect(),
            loops: self.cfg.loops().cloned().collect(),
            params: self.ssa.params.clone(),
            defs: self.ssa.defs().cloned().collect(),
            uses: self.ssa.uses().cloned().collect(),
            events: self
                .ssa
                .block_events()
                .into_iter()
                .map(|(block, events)| (block, events.to_vec()))
                .collect(),
            types: self.types.iter().map(|(d, t)| (*d, t.clone())).collect(),
            return_type: self.return_type.clone(),
            requirements: self.requirements.clone(),
        }
    }

    pub fn from_table(table: &FunctionTable) -> CoreResult<Self> {
        let mut cfg = ControlFlowGraph::from_parts(
            table.name.clone(),
            table.entry_block,
            table.blocks.clone(),
            table.loops.clone(),
        )?;
        cfg.ensure_dominance()?;
        let ssa = SsaFunction::from_parts(
            table.name.clone(),
            table.node,
            table.params.clone(),
            table.defs.clone(),
            table.uses.clone(),
            table.events.clone(),
        )?;
        ssa.verify(&cfg)?;

        let mut types = IndexMap::with_capacity(table.types.len());
        for (def, ty) in &table.types {
            if ssa.def(*def).is_none() {
                return Err(CoreError::Import(format!(
                    "type row for missing def {} in `{}`",
                    def, table.name
                )));
            }
            types.insert(*def, ty.clone());
        }
        Self::new(cfg, ssa, types, table.return_type.clone(), table.requirements.clone())
    }
}

impl fmt::Display for TypedFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "fn {} -> {}", self.name, self.return_type)?;
        for block in self.blocks_in_dominator_preorder() {
            writeln!(f, "  {}:", block)?;
            for event in self.ssa.events(block) {
                match event {
                    SsaEvent::Def(id) => {
                        if let Some(def) = self.ssa.def(*id) {
                            let ty = self
                                .types
                                .get(id)
                                .map(ToString::to_string)
                                .unwrap_or_else(|| "?".to_string());
                            writeln!(f, "    {} {} : {}", def.id, def.variable, ty)?;
                        }
                    }
                    SsaEvent::Use(id) => {
                        if let Some(u) = self.ssa.use_(*id) {
                            writeln!(f, "    {} {} <- {}", u.id, u.variable, u.def)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// One function of an exported program
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionTable {
    pub name: String,
    pub node: NodeId,
    pub entry_block: BlockId,
    pub blocks: Vec<BasicBlock>,
    pub loops: Vec<LoopInfo>,
    pub params: Vec<DefId>,
    pub defs: Vec<Def>,
    pub uses: Vec<Use>,
    pub events: Vec<(BlockId, Vec<SsaEvent>)>,
    pub types: Vec<(DefId, DefType)>,
    pub return_type: DefType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requirements: Vec<SentinelRequirement>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IrTable {
    pub nodes: NodeTable,
    pub functions: Vec<FunctionTable>,
}

impl IrTable {
    pub fn export<'f, I>(arena: &NodeArena, functions: I) -> CoreResult<Self>
    where
        I: IntoIterator<Item = &'f TypedFunction>,
    {
        Ok(Self {
            nodes: NodeTable::export(arena)?,
            functions: functions.into_iter().map(TypedFunction::to_table).collect(),
        })
    }

    /// Rebuild the arena against `registry`, then every function
    pub fn import(
        &self,
        registry: SchemaRegistry,
        ctx: &CompilationContext,
    ) -> CoreResult<(NodeArena, Vec<TypedFunction>)> {
        let arena = self.nodes.import(registry, ctx)?;
        let functions = self
            .functions
            .iter()
            .map(|table| {
                if arena.get(table.node).is_none() {
                    return Err(CoreError::Import(format!(
                        "function `{}` refers to missing node {}",
                        table.name, table.node
                    )));
                }
                TypedFunction::from_table(table)
            })
            .collect::<CoreResult<Vec<_>>>()?;
        log::debug!("imported {} typed function(s)", functions.len());
        Ok((arena, functions))
    }

    pub fn to_json(&self) -> CoreResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| CoreError::Import(e.to_string()))
    }

    pub fn from_json(json: &str) -> CoreResult<Self> {
        serde_json::from_str(json).map_err(|e| CoreError::Import(e.to_string()))
    }
}
