//! Dominance Analysis
//!
//! Immediate dominators are computed with the iterative algorithm of Cooper,
//! Harvey and Kennedy over reverse postorder, which converges in a couple of
//! passes on reducible graphs and stays correct on irreducible ones.
//! Dominance frontiers follow from the idom tree by walking each join
//! block's predecessors up to its immediate dominator.
//!
//! Only blocks reachable from entry take part; unreachable blocks have no
//! dominator and dominate nothing.

use crate::cfg::ControlFlowGraph;
use crate::error::{CoreError, CoreResult};
use crate::ids::collections::{new_id_map, new_id_set, IdMap, IdSet};
use crate::ids::BlockId;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DominanceStats {
    /// Passes over reverse postorder until the idoms settled
    pub iterations: usize,
    pub blocks_processed: usize,
    pub edges_processed: usize,
}

#[derive(Debug, Clone)]
pub struct DominanceTree {
    pub entry: BlockId,

    /// Immediate dominator for each block; the entry maps to itself
    pub idom: IdMap<BlockId, BlockId>,

    /// Children in the dominator tree, ordered by reverse postorder
    pub dom_tree_children: IdMap<BlockId, Vec<BlockId>>,

    /// Dominance frontier of each block, ordered by reverse postorder
    pub dominance_frontiers: IdMap<BlockId, Vec<BlockId>>,

    /// Reverse postorder over the CFG (good ordering for forward dataflow)
    pub reverse_postorder: Vec<BlockId>,

    rpo_index: IdMap<BlockId, usize>,

    /// Preorder of the dominator tree
    preorder: Vec<BlockId>,

    /// Dominator-tree interval numbering for O(1) `dominates`
    tree_enter: IdMap<BlockId, usize>,
    tree_exit: IdMap<BlockId, usize>,

    pub stats: DominanceStats,
}

impl DominanceTree {
    pub fn build(cfg: &ControlFlowGraph) -> CoreResult<Self> {
        if cfg.block(cfg.entry_block).is_none() {
            return Err(CoreError::malformed_cfg(
                &cfg.function,
                None,
                "cannot compute dominance without an entry block",
            ));
        }

        let entry = cfg.entry_block;
        let reverse_postorder = cfg.reverse_postorder();
        let rpo_index: IdMap<BlockId, usize> = reverse_postorder
            .iter()
            .enumerate()
            .map(|(i, b)| (*b, i))
            .collect();

        let mut stats = DominanceStats {
            blocks_processed: reverse_postorder.len(),
            ..DominanceStats::default()
        };

        // Idoms indexed by rpo position
        let mut idom: Vec<Option<usize>> = vec![None; reverse_postorder.len()];
        idom[0] = Some(0);

        let preds: Vec<Vec<usize>> = reverse_postorder
            .iter()
            .map(|b| {
                cfg.predecessors(*b)
                    .iter()
                    .filter_map(|p| rpo_index.get(p).copied())
                    .collect()
            })
            .collect();
        stats.edges_processed = preds.iter().map(Vec::len).sum();

        let mut changed = true;
        while changed {
            changed = false;
            stats.iterations += 1;
            for b in 1..reverse_postorder.len() {
                let mut new_idom: Option<usize> = None;
                for &p in &preds[b] {
                    if idom[p].is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => p,
                        Some(current) => intersect(&idom, p, current),
                    });
                }
                if new_idom.is_some() && idom[b] != new_idom {
                    idom[b] = new_idom;
                    changed = true;
                }
            }
        }

        let mut tree = Self {
            entry,
            idom: new_id_map(),
            dom_tree_children: new_id_map(),
            dominance_frontiers: new_id_map(),
            reverse_postorder,
            rpo_index,
            preorder: Vec::new(),
            tree_enter: new_id_map(),
            tree_exit: new_id_map(),
            stats,
        };

        for (i, dom) in idom.iter().enumerate() {
            let block = tree.reverse_postorder[i];
            let dom = dom.ok_or_else(|| {
                CoreError::malformed_cfg(
                    &cfg.function,
                    Some(block),
                    "reachable block without an immediate dominator",
                )
            })?;
            let dom_block = tree.reverse_postorder[dom];
            tree.idom.insert(block, dom_block);
            if i != 0 {
                tree.dom_tree_children.entry(dom_block).or_default().push(block);
            }
        }

        tree.number_tree();
        tree.compute_frontiers(cfg);
        log::trace!(
            "dominance for `{}`: {} block(s), {} pass(es)",
            cfg.function,
            tree.reverse_postorder.len(),
            tree.stats.iterations
        );
        Ok(tree)
    }

    fn number_tree(&mut self) {
        let mut counter = 0usize;
        let mut stack: Vec<(BlockId, usize)> = vec![(self.entry, 0)];
        self.tree_enter.insert(self.entry, counter);
        self.preorder.push(self.entry);
        counter += 1;

        while let Some(frame) = stack.last_mut() {
            let (block, next) = *frame;
            let child = self
                .dom_tree_children
                .get(&block)
                .and_then(|children| children.get(next))
                .copied();
            match child {
                Some(child) => {
                    frame.1 += 1;
                    self.tree_enter.insert(child, counter);
                    self.preorder.push(child);
                    counter += 1;
                    stack.push((child, 0));
                }
                None => {
                    self.tree_exit.insert(block, counter);
                    counter += 1;
                    stack.pop();
                }
            }
        }
    }

    fn compute_frontiers(&mut self, cfg: &ControlFlowGraph) {
        for &block in &self.reverse_postorder {
            let preds: Vec<BlockId> = cfg
                .predecessors(block)
                .iter()
                .filter(|p| self.rpo_index.contains_key(p))
                .copied()
                .collect();
            if preds.len() < 2 {
                continue;
            }
            let Some(&block_idom) = self.idom.get(&block) else {
                continue;
            };
            for pred in preds {
                let mut runner = pred;
                while runner != block_idom {
                    let frontier = self.dominance_frontiers.entry(runner).or_default();
                    if !frontier.contains(&block) {
                        frontier.push(block);
                    }
                    match self.idom.get(&runner) {
                        Some(&up) if up != runner => runner = up,
                        _ => break,
                    }
                }
            }
        }
        let rpo_index = &self.rpo_index;
        for frontier in self.dominance_frontiers.values_mut() {
            frontier.sort_by_key(|b| rpo_index.get(b).copied().unwrap_or(usize::MAX));
        }
    }

    /// Whether every path from entry to `b` passes through `a`
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        match (
            self.tree_enter.get(&a),
            self.tree_exit.get(&a),
            self.tree_enter.get(&b),
            self.tree_exit.get(&b),
        ) {
            (Some(ea), Some(xa), Some(eb), Some(xb)) => ea <= eb && xb <= xa,
            _ => false,
        }
    }

    pub fn strictly_dominates(&self, a: BlockId, b: BlockId) -> bool {
        a != b && self.dominates(a, b)
    }

    /// `None` for the entry block and for unreachable blocks
    pub fn immediate_dominator(&self, block: BlockId) -> Option<BlockId> {
        self.idom.get(&block).copied().filter(|&idom| idom != block)
    }

    pub fn dominance_frontier(&self, block: BlockId) -> &[BlockId] {
        self.dominance_frontiers
            .get(&block)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn dom_tree_children(&self, block: BlockId) -> &[BlockId] {
        self.dom_tree_children
            .get(&block)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Blocks in dominator-tree preorder
    pub fn preorder(&self) -> &[BlockId] {
        &self.preorder
    }

    pub fn is_reachable(&self, block: BlockId) -> bool {
        self.rpo_index.contains_key(&block)
    }

    pub fn rpo_position(&self, block: BlockId) -> Option<usize> {
        self.rpo_index.get(&block).copied()
    }

    /// Iterated dominance frontier of a set of blocks
    pub fn iterated_frontier(&self, blocks: impl IntoIterator<Item = BlockId>) -> Vec<BlockId> {
        let mut result = new_id_set();
        let mut worklist: Vec<BlockId> = blocks.into_iter().collect();
        let mut queued: IdSet<BlockId> = worklist.iter().copied().collect();

        while let Some(block) = worklist.pop() {
            for &frontier in self.dominance_frontier(block) {
                if result.insert(frontier) && queued.insert(frontier) {
                    worklist.push(frontier);
                }
            }
        }

        let mut out: Vec<BlockId> = result.into_iter().collect();
        out.sort_by_key(|b| self.rpo_position(*b).unwrap_or(usize::MAX));
        out
    }

    /// Lowest common ancestor in the dominator tree
    pub fn lca(&self, a: BlockId, b: BlockId) -> Option<BlockId> {
        if !self.is_reachable(a) || !self.is_reachable(b) {
            return None;
        }
        let mut x = a;
        while !self.dominates(x, b) {
            x = self.immediate_dominator(x)?;
        }
        Some(x)
    }
}

fn intersect(idom: &[Option<usize>], a: usize, b: usize) -> usize {
    let mut finger1 = a;
    let mut finger2 = b;
    while finger1 != finger2 {
        while finger1 > finger2 {
            finger1 = idom[finger1].unwrap_or(0);
        }
        while finger2 > finger1 {
            finger2 = idom[finger2].unwrap_or(0);
        }
    }
    finger1
}
