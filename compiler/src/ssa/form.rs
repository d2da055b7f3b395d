//! SSA definitions and uses of one function

use crate::cfg::ControlFlowGraph;
use crate::error::{CoreError, CoreResult};
use crate::ids::collections::{new_id_map, IdMap};
use crate::ids::{BlockId, DefId, NodeId, UseId};
use crate::types::Type;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

/// What produced a definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DefKind {
    /// Value of the `index`th parameter on entry
    Param {
        index: usize,
        node: NodeId,
    },
    /// `stmt` assigning the value of `value`
    Assign {
        stmt: NodeId,
        value: NodeId,
    },
    /// `target = start` of a counted loop
    LoopInit {
        construct: NodeId,
        start: NodeId,
    },
    /// `target = previous + step` of a counted loop
    LoopStep {
        construct: NodeId,
        step: Option<NodeId>,
        previous: UseId,
    },
    /// One incoming use per predecessor, in predecessor order
    Phi {
        incoming: SmallVec<[UseId; 4]>,
    },
    /// Converts `source` to the joined type of `phi` on the edge into the phi's block
    Promotion {
        source: UseId,
        phi: DefId,
    },
    /// Reaching value of a variable nothing has assigned yet
    Undefined,
}

impl DefKind {
    pub fn is_phi(&self) -> bool {
        matches!(self, DefKind::Phi { .. })
    }
}

/// A single SSA definition of a variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Def {
    /// Unique within the function
    pub id: DefId,

    /// Source variable this def gives a version of
    pub variable: String,

    /// Block the def belongs to; phis live in the merge block
    pub block: BlockId,

    pub kind: DefKind,

    /// Type known before resolution: an annotation, literal or promotion target
    pub declared_type: Option<Type>,

    /// Set on `Undefined` defs whose value may actually be read
    #[serde(default)]
    pub needs_poison: bool,
}

/// Where a use occurs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UseSite {
    /// A `Name` node read in the block
    Name(NodeId),
    /// Read of the loop target by `target < stop`
    LoopTest { construct: NodeId },
    /// Read of the loop target by the increment
    LoopStep { construct: NodeId },
    /// Incoming slot of `phi` for the edge from `predecessor`
    PhiIncoming { phi: DefId, predecessor: BlockId },
    /// Source operand of a promotion
    Promotion { def: DefId },
}

/// Whether a variable is assigned on the paths reaching a use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BindState {
    /// Assigned on every path
    AlwaysBound,
    /// Assigned on some paths only
    MaybeUnbound,
    /// Assigned on no path
    NeverBound,
}

impl fmt::Display for BindState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindState::AlwaysBound => write!(f, "always-bound"),
            BindState::MaybeUnbound => write!(f, "maybe-unbound"),
            BindState::NeverBound => write!(f, "never-bound"),
        }
    }
}

/// A read of a variable, linked to the one def that reaches it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Use {
    /// Unique within the function
    pub id: UseId,

    /// Variable being read
    pub variable: String,

    /// Block containing the read; for phi slots, the predecessor the value flows from
    pub block: BlockId,

    pub site: UseSite,

    /// The reaching definition
    pub def: DefId,

    /// Filled in by the unbound-variable analysis
    #[serde(default)]
    pub bind_state: Option<BindState>,
}

/// Def or use in block execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SsaEvent {
    Def(DefId),
    Use(UseId),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SsaStats {
    pub defs: usize,
    pub uses: usize,
    pub phis: usize,
    pub promotions: usize,
    pub undefined: usize,
}

/// SSA form of one function: defs, uses and per-block event order
#[derive(Debug, Clone, Default)]
pub struct SsaFunction {
    /// Function name
    pub function: String,
    /// The `Function` node
    pub node: NodeId,
    /// Parameter defs, in declaration order
    pub params: Vec<DefId>,
    defs: IndexMap<DefId, Def>,
    uses: IndexMap<UseId, Use>,
    events: IdMap<BlockId, Vec<SsaEvent>>,
    name_uses: IdMap<NodeId, SmallVec<[UseId; 1]>>,
    next_def: u32,
    next_use: u32,
}

impl SsaFunction {
    pub fn new(function: impl Into<String>, node: NodeId) -> Self {
        Self {
            function: function.into(),
            node,
            events: new_id_map(),
            name_uses: new_id_map(),
            ..Self::default()
        }
    }

    /// Reassemble exported parts, checking every cross reference
    pub fn from_parts(
        function: String,
        node: NodeId,
        params: Vec<DefId>,
        defs: Vec<Def>,
        uses: Vec<Use>,
        events: Vec<(BlockId, Vec<SsaEvent>)>,
    ) -> CoreResult<Self> {
        let mut ssa = Self::new(function, node);
        ssa.next_def = defs.iter().map(|d| d.id.as_raw() + 1).max().unwrap_or(0);
        ssa.next_use = uses.iter().map(|u| u.id.as_raw() + 1).max().unwrap_or(0);
        ssa.defs = defs.into_iter().map(|d| (d.id, d)).collect();
        for u in uses {
            if !ssa.defs.contains_key(&u.def) {
                return Err(CoreError::Import(format!(
                    "use {} of `{}` points at missing def {}",
                    u.id, ssa.function, u.def
                )));
            }
            if let UseSite::Name(name) = u.site {
                ssa.name_uses.entry(name).or_default().push(u.id);
            }
            ssa.uses.insert(u.id, u);
        }
        for def in ssa.defs.values() {
            let dangling = match &def.kind {
                DefKind::Phi { incoming } => incoming.iter().find(|u| !ssa.uses.contains_key(*u)).copied(),
                DefKind::LoopStep { previous, .. } => Some(*previous).filter(|u| !ssa.uses.contains_key(u)),
                DefKind::Promotion { source, .. } => Some(*source).filter(|u| !ssa.uses.contains_key(u)),
                _ => None,
            };
            if let Some(missing) = dangling {
                return Err(CoreError::Import(format!(
                    "def {} of `{}` refers to missing use {}",
                    def.id, ssa.function, missing
                )));
            }
        }
        for param in &params {
            if !ssa.defs.contains_key(param) {
                return Err(CoreError::Import(format!("missing parameter def {}", param)));
            }
        }
        ssa.params = params;
        for (block, list) in events {
            for event in &list {
                let known = match event {
                    SsaEvent::Def(d) => ssa.defs.contains_key(d),
                    SsaEvent::Use(u) => ssa.uses.contains_key(u),
                };
                if !known {
                    return Err(CoreError::Import(format!(
                        "block {} of `{}` records unknown event {:?}",
                        block, ssa.function, event
                    )));
                }
            }
            ssa.events.insert(block, list);
        }
        Ok(ssa)
    }

    /// Event lists of every block, in block id order
    pub fn block_events(&self) -> Vec<(BlockId, &[SsaEvent])> {
        let mut blocks: Vec<(BlockId, &[SsaEvent])> =
            self.events.iter().map(|(b, e)| (*b, e.as_slice())).collect();
        blocks.sort_by_key(|(b, _)| *b);
        blocks
    }

    /// Allocate a def; events are recorded separately by the caller
    pub fn add_def(
        &mut self,
        variable: &str,
        block: BlockId,
        kind: DefKind,
        declared_type: Option<Type>,
    ) -> DefId {
        let id = DefId::from_raw(self.next_def);
        self.next_def += 1;
        self.defs.insert(
            id,
            Def {
                id,
                variable: variable.to_string(),
                block,
                kind,
                declared_type,
                needs_poison: false,
            },
        );
        id
    }

    pub fn add_use(&mut self, variable: &str, block: BlockId, site: UseSite, def: DefId) -> UseId {
        let id = UseId::from_raw(self.next_use);
        self.next_use += 1;
        if let UseSite::Name(node) = site {
            self.name_uses.entry(node).or_default().push(id);
        }
        self.uses.insert(
            id,
            Use {
                id,
                variable: variable.to_string(),
                block,
                site,
                def,
                bind_state: None,
            },
        );
        id
    }

    pub fn record(&mut self, block: BlockId, event: SsaEvent) {
        self.events.entry(block).or_default().push(event);
    }

    /// Record a phi ahead of every non-phi event of the block
    pub fn record_phi(&mut self, block: BlockId, def: DefId) {
        let events = self.events.entry(block).or_default();
        let at = events
            .iter()
            .position(|e| match e {
                SsaEvent::Def(d) => !self.defs.get(d).is_some_and(|d| d.kind.is_phi()),
                SsaEvent::Use(_) => true,
            })
            .unwrap_or(events.len());
        events.insert(at, SsaEvent::Def(def));
    }

    pub fn def(&self, id: DefId) -> Option<&Def> {
        self.defs.get(&id)
    }

    pub fn def_mut(&mut self, id: DefId) -> Option<&mut Def> {
        self.defs.get_mut(&id)
    }

    pub fn use_(&self, id: UseId) -> Option<&Use> {
        self.uses.get(&id)
    }

    pub fn use_mut(&mut self, id: UseId) -> Option<&mut Use> {
        self.uses.get_mut(&id)
    }

    pub fn defs(&self) -> impl Iterator<Item = &Def> {
        self.defs.values()
    }

    pub fn uses(&self) -> impl Iterator<Item = &Use> {
        self.uses.values()
    }

    pub fn def_count(&self) -> usize {
        self.defs.len()
    }

    pub fn use_count(&self) -> usize {
        self.uses.len()
    }

    pub fn events(&self, block: BlockId) -> &[SsaEvent] {
        self.events.get(&block).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn phis(&self) -> impl Iterator<Item = &Def> {
        self.defs.values().filter(|d| d.kind.is_phi())
    }

    /// Phis owned by `block`, in creation order
    pub fn phis_in(&self, block: BlockId) -> Vec<&Def> {
        self.phis().filter(|d| d.block == block).collect()
    }

    /// Uses reading the `Name` node
    pub fn uses_of_name(&self, node: NodeId) -> &[UseId] {
        self.name_uses.get(&node).map(|u| u.as_slice()).unwrap_or(&[])
    }

    /// The use of a `Name` node inside `block`
    pub fn name_use_in(&self, node: NodeId, block: BlockId) -> Option<&Use> {
        self.uses_of_name(node)
            .iter()
            .filter_map(|u| self.uses.get(u))
            .find(|u| u.block == block)
    }

    /// Use at a synthetic loop site inside `block`
    pub fn site_use(&self, site: UseSite, block: BlockId) -> Option<&Use> {
        self.uses.values().find(|u| u.site == site && u.block == block)
    }

    pub fn definition_of(&self, use_id: UseId) -> Option<&Def> {
        self.uses.get(&use_id).and_then(|u| self.defs.get(&u.def))
    }

    /// Incoming uses of a phi, in predecessor order
    pub fn incoming_of(&self, phi: DefId) -> Option<&[UseId]> {
        match &self.defs.get(&phi)?.kind {
            DefKind::Phi { incoming } => Some(incoming.as_slice()),
            _ => None,
        }
    }

    pub fn undefined_def(&self, variable: &str) -> Option<&Def> {
        self.defs
            .values()
            .find(|d| d.kind == DefKind::Undefined && d.variable == variable)
    }

    pub fn stats(&self) -> SsaStats {
        let mut stats = SsaStats {
            defs: self.defs.len(),
            uses: self.uses.len(),
            ..SsaStats::default()
        };
        for def in self.defs.values() {
            match def.kind {
                DefKind::Phi { .. } => stats.phis += 1,
                DefKind::Promotion { .. } => stats.promotions += 1,
                DefKind::Undefined => stats.undefined += 1,
                _ => {}
            }
        }
        stats
    }

    /// Check phi arity and that every use is dominated by its def
    pub fn verify(&self, cfg: &ControlFlowGraph) -> CoreResult<()> {
        let tree = cfg.dominance().ok_or_else(|| {
            CoreError::malformed_cfg(&self.function, None, "dominance not computed")
        })?;
        let fail = |block: BlockId, reason: String| {
            Err(CoreError::malformed_cfg(&self.function, Some(block), reason))
        };

        for def in self.defs.values() {
            if let DefKind::Phi { incoming } = &def.kind {
                let preds = cfg.predecessors(def.block);
                if incoming.len() != preds.len() {
                    return fail(
                        def.block,
                        format!(
                            "phi {} has {} incoming value(s) for {} predecessor(s)",
                            def.id,
                            incoming.len(),
                            preds.len()
                        ),
                    );
                }
                for (slot, pred) in incoming.iter().zip(preds) {
                    let ok = self.uses.get(slot).is_some_and(|u| {
                        u.site
                            == UseSite::PhiIncoming {
                                phi: def.id,
                                predecessor: *pred,
                            }
                    });
                    if !ok {
                        return fail(def.block, format!("phi {} slot out of predecessor order", def.id));
                    }
                }
            }
        }

        for u in self.uses.values() {
            let def = match self.defs.get(&u.def) {
                Some(def) => def,
                None => return fail(u.block, format!("use {} points at missing def {}", u.id, u.def)),
            };
            if !tree.is_reachable(def.block) {
                return fail(def.block, format!("use {} reads unreachable def {}", u.id, def.id));
            }
            // a phi slot is read at the end of its predecessor
            let dominated = match u.site {
                UseSite::PhiIncoming { predecessor, .. } => tree.dominates(def.block, predecessor),
                _ => tree.dominates(def.block, u.block),
            };
            if !dominated {
                return fail(
                    u.block,
                    format!("def {} in {} does not dominate use {}", def.id, def.block, u.id),
                );
            }
        }
        Ok(())
    }
}

impl fmt::Display for SsaFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ssa {}", self.function)?;
        for def in self.defs.values() {
            write!(f, "  {} = {} @{} {:?}", def.id, def.variable, def.block, def.kind)?;
            if let Some(ty) = &def.declared_type {
                write!(f, " : {}", ty)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
