//! Control Flow Graph for one function
//!
//! Blocks hold references to statement nodes of the input tree plus two
//! synthetic statements that stand for the init and step of a counted `For`
//! loop. Every edge carries a label saying why control flows along it, and
//! blocks created while lowering a structured construct point back at that
//! construct so later checks can find it again.
//!
//! Predecessor lists are kept in sync by [`ControlFlowGraph::set_terminator`]
//! and [`ControlFlowGraph::add_exception_edge`]; each predecessor block
//! appears once no matter how many edges connect the two blocks. Dominance is
//! computed lazily and dropped whenever edges change.

pub mod builder;
pub mod checks;
pub mod effects;

use crate::error::{CoreError, CoreResult};
use crate::ids::collections::{new_id_set, IdSet};
use crate::ids::{BlockId, NodeId};
use crate::ssa::dominance::DominanceTree;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

pub use builder::CfgBuilder;

/// Why control flows along an edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeKind {
    /// Fallthrough or unconditional jump
    Normal,
    /// Taken when the branch condition holds
    True,
    False,
    /// From a protected block to a handler
    Exception,
    /// Jump to the exit of the innermost loop
    Break,
    /// Jump back to the innermost loop's header or latch
    Continue,
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EdgeKind::Normal => "normal",
            EdgeKind::True => "true",
            EdgeKind::False => "false",
            EdgeKind::Exception => "exception",
            EdgeKind::Break => "break",
            EdgeKind::Continue => "continue",
        };
        write!(f, "{}", name)
    }
}

/// Outgoing edge of a basic block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// Block control flows to
    pub target: BlockId,
    pub kind: EdgeKind,
}

/// A statement slot in a basic block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockStmt {
    /// An `Assign` or `ExprStmt` node
    Node(NodeId),
    /// `target = start` of the `For` node
    LoopInit { construct: NodeId },
    /// `target = target + step` of the `For` node
    LoopStep { construct: NodeId },
}

/// Branch condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Condition {
    /// Test expression of an `If` or `While` node
    Expr(NodeId),
    /// `target < stop` of the `For` node
    LoopTest { construct: NodeId },
}

/// How control flow exits a basic block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Terminator {
    /// Unconditional jump; `kind` tells a fallthrough from a `break` or `continue`
    Jump {
        target: BlockId,
        kind: EdgeKind,
    },
    /// Two-way branch on a condition
    Branch {
        condition: Condition,
        true_target: BlockId,
        false_target: BlockId,
    },
    /// Function return, with the returned expression if any
    Return {
        value: Option<NodeId>,
    },
    /// Raise leaving the function or reaching a handler
    Raise {
        value: Option<NodeId>,
    },
    /// Control never reaches the end of the block
    Unreachable,
}

impl Terminator {
    pub fn edges(&self) -> SmallVec<[Edge; 2]> {
        match self {
            Terminator::Jump { target, kind } => smallvec::smallvec![Edge {
                target: *target,
                kind: *kind,
            }],
            Terminator::Branch {
                true_target,
                false_target,
                ..
            } => smallvec::smallvec![
                Edge {
                    target: *true_target,
                    kind: EdgeKind::True,
                },
                Edge {
                    target: *false_target,
                    kind: EdgeKind::False,
                },
            ],
            Terminator::Return { .. } | Terminator::Raise { .. } | Terminator::Unreachable => {
                SmallVec::new()
            }
        }
    }

    pub fn is_exit(&self) -> bool {
        matches!(self, Terminator::Return { .. } | Terminator::Raise { .. })
    }
}

/// Which part of a structured construct a block was created for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockRole {
    Entry,
    Then,
    Else,
    Join,
    LoopHeader,
    LoopBody,
    LoopLatch,
    LoopExit,
    TryBody,
    Handler,
    AfterTry,
    /// Opened after a terminator; holds statements nothing can reach
    Detached,
}

/// Additional information about a block for analysis and printing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockMetadata {
    /// Role in the construct that created the block
    pub role: BlockRole,
    /// Number of enclosing loops
    pub loop_depth: u32,
    /// Innermost structured construct this block was created for
    pub construct: Option<NodeId>,
}

/// A basic block in the control flow graph
///
/// Statements run in order with a single entry at the top; control leaves
/// through the terminator or, inside a `try` body, along an exception edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicBlock {
    /// Unique identifier for this block
    pub id: BlockId,

    /// Statement slots in execution order
    pub statements: Vec<BlockStmt>,

    /// How control leaves the block; `None` while the builder is still filling it
    pub terminator: Option<Terminator>,

    /// Blocks with an edge into this one, in the order the edges were added
    pub predecessors: Vec<BlockId>,

    /// Terminator edges followed by exception edges
    pub successors: SmallVec<[Edge; 2]>,

    pub metadata: BlockMetadata,
}

impl BasicBlock {
    fn new(id: BlockId, metadata: BlockMetadata) -> Self {
        Self {
            id,
            statements: Vec::new(),
            terminator: None,
            predecessors: Vec::new(),
            successors: SmallVec::new(),
            metadata,
        }
    }

    /// Distinct successor blocks, in edge order
    pub fn successor_blocks(&self) -> SmallVec<[BlockId; 4]> {
        let mut out: SmallVec<[BlockId; 4]> = SmallVec::new();
        for edge in &self.successors {
            if !out.contains(&edge.target) {
                out.push(edge.target);
            }
        }
        out
    }

    pub fn exception_targets(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.successors
            .iter()
            .filter(|e| e.kind == EdgeKind::Exception)
            .map(|e| e.target)
    }

    pub fn is_exit(&self) -> bool {
        self.terminator.as_ref().is_some_and(Terminator::is_exit)
    }
}

/// A lowered `While` or `For` loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopInfo {
    /// The `While` or `For` node
    pub construct: NodeId,
    /// Block evaluating the loop condition
    pub header: BlockId,
    /// Block holding the step of a `For` loop
    pub latch: Option<BlockId>,
    /// Block control reaches when the condition fails or on `break`
    pub exit: BlockId,
    /// Every block created for the loop body, including nested constructs
    pub body: Vec<BlockId>,
    /// Set from the `parallel` attribute of a `For` node
    pub parallel: bool,
    /// Nesting depth, 1 for an outermost loop
    pub depth: u32,
}

fn missing_block(function: &str, id: BlockId) -> CoreError {
    CoreError::malformed_cfg(function, Some(id), format!("no block {}", id))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CfgStats {
    pub blocks: usize,
    /// All edges, exception edges included
    pub edges: usize,
    pub exception_edges: usize,
    pub loops: usize,
    pub max_loop_depth: u32,
}

/// Control flow graph of one function
#[derive(Debug, Clone)]
pub struct ControlFlowGraph {
    /// Name of the function the graph was built for
    pub function: String,

    /// Block control enters first
    pub entry_block: BlockId,

    blocks: IndexMap<BlockId, BasicBlock>,
    loops: IndexMap<NodeId, LoopInfo>,
    next_block: u32,
    dominance: Option<Arc<DominanceTree>>,
}

impl ControlFlowGraph {
    /// New graph holding only its entry block
    pub fn new(function: impl Into<String>) -> Self {
        let mut cfg = Self {
            function: function.into(),
            entry_block: BlockId::invalid(),
            blocks: IndexMap::new(),
            loops: IndexMap::new(),
            next_block: 0,
            dominance: None,
        };
        cfg.entry_block = cfg.create_block(BlockRole::Entry, None, 0);
        cfg
    }

    /// Reassemble a graph from exported blocks, checking edge consistency
    pub fn from_parts(
        function: String,
        entry_block: BlockId,
        blocks: Vec<BasicBlock>,
        loops: Vec<LoopInfo>,
    ) -> CoreResult<Self> {
        let next_block = blocks
            .iter()
            .map(|b| b.id.as_raw().saturating_add(1))
            .max()
            .unwrap_or(0);
        let cfg = Self {
            function,
            entry_block,
            blocks: blocks.into_iter().map(|b| (b.id, b)).collect(),
            loops: loops.into_iter().map(|l| (l.construct, l)).collect(),
            next_block,
            dominance: None,
        };
        cfg.validate()?;
        cfg.check_edge_consistency()?;
        Ok(cfg)
    }

    pub fn create_block(
        &mut self,
        role: BlockRole,
        construct: Option<NodeId>,
        loop_depth: u32,
    ) -> BlockId {
        let id = BlockId::from_raw(self.next_block);
        self.next_block += 1;
        self.blocks.insert(
            id,
            BasicBlock::new(
                id,
                BlockMetadata {
                    role,
                    loop_depth,
                    construct,
                },
            ),
        );
        self.dominance = None;
        id
    }

    pub fn block(&self, id: BlockId) -> Option<&BasicBlock> {
        self.blocks.get(&id)
    }

    pub(crate) fn block_mut(&mut self, id: BlockId) -> Option<&mut BasicBlock> {
        self.blocks.get_mut(&id)
    }

    /// Blocks in creation order
    pub fn blocks(&self) -> impl Iterator<Item = &BasicBlock> {
        self.blocks.values()
    }

    pub fn block_ids(&self) -> Vec<BlockId> {
        self.blocks.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Id the next created block will get
    pub fn peek_next_block(&self) -> BlockId {
        BlockId::from_raw(self.next_block)
    }

    pub fn predecessors(&self, id: BlockId) -> &[BlockId] {
        self.blocks
            .get(&id)
            .map(|b| b.predecessors.as_slice())
            .unwrap_or(&[])
    }

    pub fn successors(&self, id: BlockId) -> &[Edge] {
        self.blocks
            .get(&id)
            .map(|b| b.successors.as_slice())
            .unwrap_or(&[])
    }

    pub fn push_statement(&mut self, block: BlockId, stmt: BlockStmt) -> CoreResult<()> {
        self.blocks
            .get_mut(&block)
            .ok_or_else(|| missing_block(&self.function, block))?
            .statements
            .push(stmt);
        Ok(())
    }

    /// Replace a block's terminator and relink predecessor lists
    pub fn set_terminator(&mut self, block: BlockId, terminator: Terminator) -> CoreResult<()> {
        let new_edges = terminator.edges();
        for edge in &new_edges {
            if !self.blocks.contains_key(&edge.target) {
                return Err(missing_block(&self.function, edge.target));
            }
        }

        let bb = self
            .blocks
            .get_mut(&block)
            .ok_or_else(|| missing_block(&self.function, block))?;
        let old_targets = bb.successor_blocks();
        let exception_edges: SmallVec<[Edge; 2]> = bb
            .successors
            .iter()
            .filter(|e| e.kind == EdgeKind::Exception)
            .copied()
            .collect();
        bb.successors = new_edges;
        bb.successors.extend(exception_edges);
        bb.terminator = Some(terminator);

        self.relink(block, &old_targets);
        Ok(())
    }

    /// Add an exceptional edge taken from anywhere inside `from`
    pub fn add_exception_edge(&mut self, from: BlockId, handler: BlockId) -> CoreResult<()> {
        if !self.blocks.contains_key(&handler) {
            return Err(missing_block(&self.function, handler));
        }
        let bb = self
            .blocks
            .get_mut(&from)
            .ok_or_else(|| missing_block(&self.function, from))?;
        let edge = Edge {
            target: handler,
            kind: EdgeKind::Exception,
        };
        if bb.successors.contains(&edge) {
            return Ok(());
        }
        let old_targets = bb.successor_blocks();
        bb.successors.push(edge);
        self.relink(from, &old_targets);
        Ok(())
    }

    fn relink(&mut self, block: BlockId, old_targets: &[BlockId]) {
        let new_targets = self
            .blocks
            .get(&block)
            .map(|b| b.successor_blocks())
            .unwrap_or_default();

        for target in old_targets.iter().filter(|t| !new_targets.contains(t)) {
            if let Some(bb) = self.blocks.get_mut(target) {
                bb.predecessors.retain(|p| *p != block);
            }
        }
        for target in new_targets.iter().filter(|t| !old_targets.contains(t)) {
            if let Some(bb) = self.blocks.get_mut(target) {
                if !bb.predecessors.contains(&block) {
                    bb.predecessors.push(block);
                }
            }
        }
        self.dominance = None;
    }

    pub fn add_loop(&mut self, info: LoopInfo) {
        self.loops.insert(info.construct, info);
    }

    pub fn loops(&self) -> impl Iterator<Item = &LoopInfo> {
        self.loops.values()
    }

    pub fn loop_info(&self, construct: NodeId) -> Option<&LoopInfo> {
        self.loops.get(&construct)
    }

    pub fn exit_blocks(&self) -> Vec<BlockId> {
        self.blocks
            .values()
            .filter(|b| b.is_exit())
            .map(|b| b.id)
            .collect()
    }

    /// Blocks reachable from entry in reverse postorder
    pub fn reverse_postorder(&self) -> Vec<BlockId> {
        let mut visited = new_id_set();
        let mut postorder = Vec::with_capacity(self.blocks.len());
        // (block, successors, next index)
        let mut stack: Vec<(BlockId, SmallVec<[BlockId; 4]>, usize)> = Vec::new();

        if let Some(entry) = self.blocks.get(&self.entry_block) {
            visited.insert(entry.id);
            stack.push((entry.id, entry.successor_blocks(), 0));
        }

        while let Some(frame) = stack.last_mut() {
            if frame.2 < frame.1.len() {
                let next = frame.1[frame.2];
                frame.2 += 1;
                if visited.insert(next) {
                    let succs = self
                        .blocks
                        .get(&next)
                        .map(|b| b.successor_blocks())
                        .unwrap_or_default();
                    stack.push((next, succs, 0));
                }
            } else {
                postorder.push(frame.0);
                stack.pop();
            }
        }

        postorder.reverse();
        postorder
    }

    pub fn reachable_blocks(&self) -> IdSet<BlockId> {
        self.reverse_postorder().into_iter().collect()
    }

    /// Drop blocks unreachable from entry; returns the removed ids
    pub fn remove_unreachable_blocks(&mut self) -> Vec<BlockId> {
        let reachable = self.reachable_blocks();
        let removed: Vec<BlockId> = self
            .blocks
            .keys()
            .filter(|id| !reachable.contains(id))
            .copied()
            .collect();
        if removed.is_empty() {
            return removed;
        }

        self.blocks.retain(|id, _| reachable.contains(id));
        for bb in self.blocks.values_mut() {
            bb.predecessors.retain(|p| reachable.contains(p));
        }
        for info in self.loops.values_mut() {
            info.body.retain(|b| reachable.contains(b));
            if info.latch.is_some_and(|l| !reachable.contains(&l)) {
                info.latch = None;
            }
        }
        // Loops whose header is gone were never entered
        self.loops.retain(|_, info| reachable.contains(&info.header));
        self.dominance = None;
        removed
    }

    /// Compute the dominator tree if it is not cached
    pub fn ensure_dominance(&mut self) -> CoreResult<Arc<DominanceTree>> {
        if let Some(tree) = &self.dominance {
            return Ok(Arc::clone(tree));
        }
        let tree = Arc::new(DominanceTree::build(self)?);
        self.dominance = Some(Arc::clone(&tree));
        Ok(tree)
    }

    /// Cached dominator tree, if still valid
    pub fn dominance(&self) -> Option<&DominanceTree> {
        self.dominance.as_deref()
    }

    pub fn validate(&self) -> CoreResult<()> {
        if !self.blocks.contains_key(&self.entry_block) {
            return Err(CoreError::malformed_cfg(
                &self.function,
                None,
                "missing entry block",
            ));
        }
        for bb in self.blocks.values() {
            if bb.terminator.is_none() {
                return Err(CoreError::malformed_cfg(
                    &self.function,
                    Some(bb.id),
                    format!("block {} has no terminator", bb.id),
                ));
            }
            for edge in &bb.successors {
                if !self.blocks.contains_key(&edge.target) {
                    return Err(CoreError::malformed_cfg(
                        &self.function,
                        Some(bb.id),
                        format!("edge from {} to missing block {}", bb.id, edge.target),
                    ));
                }
            }
        }
        Ok(())
    }

    fn check_edge_consistency(&self) -> CoreResult<()> {
        for bb in self.blocks.values() {
            let expected: Vec<Edge> = bb
                .terminator
                .as_ref()
                .map(|t| t.edges().into_vec())
                .unwrap_or_default();
            let from_terminator: Vec<Edge> = bb
                .successors
                .iter()
                .filter(|e| e.kind != EdgeKind::Exception)
                .copied()
                .collect();
            if expected != from_terminator {
                return Err(CoreError::malformed_cfg(
                    &self.function,
                    Some(bb.id),
                    "successor edges disagree with the terminator",
                ));
            }
            for target in bb.successor_blocks() {
                if !self.predecessors(target).contains(&bb.id) {
                    return Err(CoreError::malformed_cfg(
                        &self.function,
                        Some(target),
                        format!("{} missing from predecessors of {}", bb.id, target),
                    ));
                }
            }
            for pred in &bb.predecessors {
                let linked = self
                    .block(*pred)
                    .is_some_and(|p| p.successor_blocks().contains(&bb.id));
                if !linked {
                    return Err(CoreError::malformed_cfg(
                        &self.function,
                        Some(bb.id),
                        format!("{} listed as predecessor without an edge", pred),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> CfgStats {
        let mut stats = CfgStats {
            blocks: self.blocks.len(),
            loops: self.loops.len(),
            ..CfgStats::default()
        };
        for bb in self.blocks.values() {
            stats.edges += bb.successors.len();
            stats.exception_edges += bb.exception_targets().count();
            stats.max_loop_depth = stats.max_loop_depth.max(bb.metadata.loop_depth);
        }
        stats
    }
}

impl fmt::Display for ControlFlowGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "cfg {} (entry {})", self.function, self.entry_block)?;
        for bb in self.blocks.values() {
            write!(f, "  {} {:?} preds=[", bb.id, bb.metadata.role)?;
            for (i, p) in bb.predecessors.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", p)?;
            }
            write!(f, "] ->")?;
            for edge in &bb.successors {
                write!(f, " {}({})", edge.target, edge.kind)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jump(target: BlockId) -> Terminator {
        Terminator::Jump {
            target,
            kind: EdgeKind::Normal,
        }
    }

    #[test]
    fn test_edges_maintain_predecessors() {
        let mut cfg = ControlFlowGraph::new("f");
        let entry = cfg.entry_block;
        let a = cfg.create_block(BlockRole::Then, None, 0);
        let b = cfg.create_block(BlockRole::Else, None, 0);
        let join = cfg.create_block(BlockRole::Join, None, 0);

        cfg.set_terminator(
            entry,
            Terminator::Branch {
                condition: Condition::Expr(NodeId::from_raw(0)),
                true_target: a,
                false_target: b,
            },
        )
        .unwrap();
        cfg.set_terminator(a, jump(join)).unwrap();
        cfg.set_terminator(b, jump(join)).unwrap();
        cfg.set_terminator(join, Terminator::Return { value: None }).unwrap();

        assert_eq!(cfg.predecessors(join), &[a, b]);
        assert_eq!(cfg.successors(entry)[0].kind, EdgeKind::True);
        assert!(cfg.validate().is_ok());

        // retarget a: join loses a as predecessor
        cfg.set_terminator(a, Terminator::Return { value: None }).unwrap();
        assert_eq!(cfg.predecessors(join), &[b]);
        assert_eq!(cfg.exit_blocks(), vec![a, join]);
    }

    #[test]
    fn test_exception_edges_survive_terminator_change() {
        let mut cfg = ControlFlowGraph::new("f");
        let entry = cfg.entry_block;
        let handler = cfg.create_block(BlockRole::Handler, None, 0);
        let after = cfg.create_block(BlockRole::AfterTry, None, 0);

        cfg.add_exception_edge(entry, handler).unwrap();
        cfg.add_exception_edge(entry, handler).unwrap();
        cfg.set_terminator(entry, jump(after)).unwrap();
        cfg.set_terminator(handler, jump(after)).unwrap();
        cfg.set_terminator(after, Terminator::Return { value: None }).unwrap();

        let kinds: Vec<EdgeKind> = cfg.successors(entry).iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EdgeKind::Normal, EdgeKind::Exception]);
        assert_eq!(cfg.predecessors(handler), &[entry]);
        assert_eq!(cfg.stats().exception_edges, 1);
    }

    #[test]
    fn test_missing_terminator_is_malformed() {
        let mut cfg = ControlFlowGraph::new("f");
        let dangling = cfg.create_block(BlockRole::Join, None, 0);
        cfg.set_terminator(cfg.entry_block, jump(dangling)).unwrap();
        match cfg.validate() {
            Err(CoreError::MalformedCfg { block, .. }) => assert_eq!(block, Some(dangling)),
            other => panic!("expected MalformedCfg, got {:?}", other),
        }
    }

    #[test]
    fn test_remove_unreachable() {
        let mut cfg = ControlFlowGraph::new("f");
        let entry = cfg.entry_block;
        let live = cfg.create_block(BlockRole::Join, None, 0);
        let dead = cfg.create_block(BlockRole::Detached, None, 0);
        cfg.set_terminator(entry, jump(live)).unwrap();
        cfg.set_terminator(dead, jump(live)).unwrap();
        cfg.set_terminator(live, Terminator::Return { value: None }).unwrap();
        assert_eq!(cfg.predecessors(live), &[entry, dead]);

        assert_eq!(cfg.remove_unreachable_blocks(), vec![dead]);
        assert_eq!(cfg.predecessors(live), &[entry]);
        assert_eq!(cfg.reverse_postorder(), vec![entry, live]);
    }

    #[test]
    fn test_dominance_cache_invalidated() {
        let mut cfg = ControlFlowGraph::new("f");
        let entry = cfg.entry_block;
        cfg.set_terminator(entry, Terminator::Return { value: None }).unwrap();
        cfg.ensure_dominance().unwrap();
        assert!(cfg.dominance().is_some());

        let extra = cfg.create_block(BlockRole::Join, None, 0);
        assert!(cfg.dominance().is_none());
        cfg.set_terminator(extra, Terminator::Return { value: None }).unwrap();
        cfg.set_terminator(entry, jump(extra)).unwrap();
        let tree = cfg.ensure_dominance().unwrap();
        assert_eq!(tree.immediate_dominator(extra), Some(entry));
    }
}
