//! SSA construction over a finished CFG
//!
//! 1. Variable liveness from the per-block effects.
//! 2. Params and an `Undefined` def for every other variable live into the
//!    entry block.
//! 3. Phis at the iterated dominance frontier of each variable's def blocks,
//!    kept only where the variable is live-in. Handler entries always get a
//!    phi for their live-in variables since the value along an exception edge
//!    is the one at the start of the raising block.
//! 4. Renaming by a walk of the dominator tree with one def stack per
//!    variable.

use super::dominance::DominanceTree;
use super::form::{DefKind, SsaEvent, SsaFunction, UseSite};
use crate::cfg::effects::{function_effects, DefOrigin, Effect, FunctionEffects};
use crate::cfg::{ControlFlowGraph, EdgeKind};
use crate::error::{CoreError, CoreResult};
use crate::ids::collections::{new_id_map, IdMap};
use crate::ids::{BlockId, DefId, NodeId, UseId};
use crate::node::ast;
use crate::node::NodeArena;
use crate::types::Type;
use fxhash::{FxHashMap, FxHashSet};
use indexmap::IndexSet;
use smallvec::SmallVec;

/// Variables live on entry to each block
#[derive(Debug, Clone)]
pub struct Liveness<'a> {
    live_in: IdMap<BlockId, FxHashSet<&'a str>>,
}

impl<'a> Liveness<'a> {
    pub fn compute(cfg: &ControlFlowGraph, effects: &FunctionEffects<'a>) -> Self {
        let mut upward: IdMap<BlockId, FxHashSet<&'a str>> = new_id_map();
        let mut killed: IdMap<BlockId, FxHashSet<&'a str>> = new_id_map();
        for (block, list) in effects {
            let up = upward.entry(*block).or_default();
            let kill = killed.entry(*block).or_default();
            for effect in list {
                match effect {
                    Effect::Use { name, .. } => {
                        if !kill.contains(name) {
                            up.insert(*name);
                        }
                    }
                    Effect::Def { name, .. } => {
                        kill.insert(*name);
                    }
                }
            }
        }

        let mut order = cfg.reverse_postorder();
        order.reverse();
        let mut live_in: IdMap<BlockId, FxHashSet<&'a str>> = new_id_map();
        let mut changed = true;
        while changed {
            changed = false;
            for &block in &order {
                let mut live: FxHashSet<&'a str> = upward.get(&block).cloned().unwrap_or_default();
                let kill = killed.get(&block);
                for edge in cfg.successors(block) {
                    let Some(succ_live) = live_in.get(&edge.target) else {
                        continue;
                    };
                    for name in succ_live {
                        let passes = edge.kind == EdgeKind::Exception
                            || !kill.is_some_and(|k| k.contains(name));
                        if passes {
                            live.insert(*name);
                        }
                    }
                }
                if live_in.get(&block) != Some(&live) {
                    live_in.insert(block, live);
                    changed = true;
                }
            }
        }
        Self { live_in }
    }

    pub fn is_live_in(&self, block: BlockId, name: &str) -> bool {
        self.live_in.get(&block).is_some_and(|l| l.contains(name))
    }

    pub fn live_in(&self, block: BlockId) -> Option<&FxHashSet<&'a str>> {
        self.live_in.get(&block)
    }
}

enum Step<'a> {
    Enter(BlockId),
    Exit(Vec<&'a str>),
}

struct Renamer<'a, 'c> {
    arena: &'a NodeArena,
    cfg: &'c ControlFlowGraph,
    ssa: SsaFunction,
    stacks: FxHashMap<&'a str, Vec<DefId>>,
    phi_at: IdMap<BlockId, Vec<(&'a str, DefId)>>,
}

impl<'a, 'c> Renamer<'a, 'c> {
    fn top(&self, name: &str, block: BlockId) -> CoreResult<DefId> {
        self.stacks
            .get(name)
            .and_then(|stack| stack.last().copied())
            .ok_or_else(|| {
                CoreError::malformed_cfg(
                    &self.ssa.function,
                    Some(block),
                    format!("no reaching definition for `{}`", name),
                )
            })
    }

    fn push(&mut self, name: &'a str, def: DefId) {
        self.stacks.entry(name).or_default().push(def);
    }

    /// Fill the slot of `block` in every phi of its successors reached by `exceptional` edges
    fn fill_successor_slots(&mut self, block: BlockId, exceptional: bool) -> CoreResult<()> {
        let cfg = self.cfg;
        let Some(bb) = cfg.block(block) else {
            return Ok(());
        };
        for succ in bb.successor_blocks() {
            let is_exception = bb
                .successors
                .iter()
                .any(|e| e.target == succ && e.kind == EdgeKind::Exception);
            if is_exception != exceptional {
                continue;
            }
            let Some(slot) = cfg.predecessors(succ).iter().position(|p| *p == block) else {
                continue;
            };
            let phis = self.phi_at.get(&succ).cloned().unwrap_or_default();
            for (name, phi) in phis {
                let def = self.top(name, block)?;
                let use_id = self.ssa.add_use(
                    name,
                    block,
                    UseSite::PhiIncoming {
                        phi,
                        predecessor: block,
                    },
                    def,
                );
                if let Some(DefKind::Phi { incoming }) = self.ssa.def_mut(phi).map(|d| &mut d.kind) {
                    if let Some(entry) = incoming.get_mut(slot) {
                        *entry = use_id;
                    }
                }
            }
        }
        Ok(())
    }

    fn def_from_origin(
        &self,
        origin: DefOrigin,
        last_step_use: Option<UseId>,
        block: BlockId,
    ) -> CoreResult<(DefKind, Option<Type>)> {
        Ok(match origin {
            DefOrigin::Assign { stmt, value } => (
                DefKind::Assign { stmt, value },
                ast::declared_type(self.arena, stmt).or_else(|| ast::literal_type(self.arena, value)),
            ),
            DefOrigin::LoopInit { construct, start } => (
                DefKind::LoopInit { construct, start },
                ast::literal_type(self.arena, start),
            ),
            DefOrigin::LoopStep { construct, step } => {
                let previous = last_step_use.ok_or_else(|| {
                    CoreError::malformed_cfg(
                        &self.ssa.function,
                        Some(block),
                        "loop step without a read of its target",
                    )
                })?;
                (DefKind::LoopStep { construct, step, previous }, None)
            }
        })
    }

    fn rename(&mut self, tree: &DominanceTree, effects: &FunctionEffects<'a>) -> CoreResult<()> {
        let mut work = vec![Step::Enter(tree.entry)];
        while let Some(step) = work.pop() {
            let block = match step {
                Step::Enter(block) => block,
                Step::Exit(pushed) => {
                    for name in pushed {
                        if let Some(stack) = self.stacks.get_mut(name) {
                            stack.pop();
                        }
                    }
                    continue;
                }
            };

            let mut pushed: Vec<&'a str> = Vec::new();
            for (name, phi) in self.phi_at.get(&block).cloned().unwrap_or_default() {
                self.push(name, phi);
                pushed.push(name);
            }
            self.fill_successor_slots(block, true)?;

            let mut last_step_use = None;
            for effect in effects.get(&block).map(Vec::as_slice).unwrap_or(&[]) {
                match *effect {
                    Effect::Use { name, site } => {
                        let def = self.top(name, block)?;
                        let use_id = self.ssa.add_use(name, block, site, def);
                        self.ssa.record(block, SsaEvent::Use(use_id));
                        if matches!(site, UseSite::LoopStep { .. }) {
                            last_step_use = Some(use_id);
                        }
                    }
                    Effect::Def { name, origin } => {
                        let (kind, declared) = self.def_from_origin(origin, last_step_use, block)?;
                        let def = self.ssa.add_def(name, block, kind, declared);
                        self.ssa.record(block, SsaEvent::Def(def));
                        self.push(name, def);
                        pushed.push(name);
                    }
                }
            }
            self.fill_successor_slots(block, false)?;

            work.push(Step::Exit(pushed));
            for &child in tree.dom_tree_children(block).iter().rev() {
                work.push(Step::Enter(child));
            }
        }
        Ok(())
    }
}

/// Build the SSA form of `function`, whose CFG is `cfg`
pub fn build_ssa(
    arena: &NodeArena,
    cfg: &mut ControlFlowGraph,
    function: NodeId,
) -> CoreResult<SsaFunction> {
    let view = ast::function(arena, function)?;
    let _span = tracing::debug_span!("build_ssa", function = view.name).entered();

    let tree = cfg.ensure_dominance()?;
    let cfg: &ControlFlowGraph = cfg;
    let effects = function_effects(arena, cfg)?;
    let liveness = Liveness::compute(cfg, &effects);
    let entry = cfg.entry_block;

    // Variables in order of first appearance
    let mut variables: IndexSet<&str> = view.params.iter().map(|p| p.name).collect();
    let mut def_blocks: FxHashMap<&str, Vec<BlockId>> = FxHashMap::default();
    for &block in tree.preorder() {
        for effect in effects.get(&block).map(Vec::as_slice).unwrap_or(&[]) {
            variables.insert(effect.name());
            if let Effect::Def { name, .. } = effect {
                def_blocks.entry(*name).or_default().push(block);
            }
        }
    }

    let mut renamer = Renamer {
        arena,
        cfg,
        ssa: SsaFunction::new(view.name, function),
        stacks: FxHashMap::default(),
        phi_at: new_id_map(),
    };

    for (index, param) in view.params.iter().enumerate() {
        let def = renamer.ssa.add_def(
            param.name,
            entry,
            DefKind::Param {
                index,
                node: param.node,
            },
            param.declared_type.cloned(),
        );
        renamer.ssa.record(entry, SsaEvent::Def(def));
        renamer.ssa.params.push(def);
        renamer.push(param.name, def);
    }
    for &name in &variables {
        let is_param = view.params.iter().any(|p| p.name == name);
        if !is_param && liveness.is_live_in(entry, name) {
            let def = renamer.ssa.add_def(name, entry, DefKind::Undefined, None);
            renamer.ssa.record(entry, SsaEvent::Def(def));
            renamer.push(name, def);
        }
    }

    let handlers: Vec<BlockId> = tree
        .preorder()
        .iter()
        .copied()
        .filter(|b| {
            cfg.predecessors(*b).iter().any(|p| {
                cfg.successors(*p)
                    .iter()
                    .any(|e| e.target == *b && e.kind == EdgeKind::Exception)
            })
        })
        .collect();

    for &name in &variables {
        let mut seeds: Vec<BlockId> = def_blocks.get(name).cloned().unwrap_or_default();
        seeds.push(entry);
        let forced: Vec<BlockId> = handlers
            .iter()
            .copied()
            .filter(|h| liveness.is_live_in(*h, name))
            .collect();
        seeds.extend(forced.iter().copied());

        let mut placed: Vec<BlockId> = tree.iterated_frontier(seeds);
        for h in forced {
            if !placed.contains(&h) {
                placed.push(h);
            }
        }
        placed.sort_by_key(|b| tree.rpo_position(*b));

        for block in placed {
            let preds = cfg.predecessors(block).len();
            if block == entry || preds == 0 || !liveness.is_live_in(block, name) {
                continue;
            }
            let incoming: SmallVec<[UseId; 4]> = smallvec::smallvec![UseId::invalid(); preds];
            let phi = renamer.ssa.add_def(name, block, DefKind::Phi { incoming }, None);
            renamer.ssa.record_phi(block, phi);
            renamer.phi_at.entry(block).or_default().push((name, phi));
        }
    }

    renamer.rename(&tree, &effects)?;
    let ssa = renamer.ssa;

    for phi in ssa.phis() {
        if let DefKind::Phi { incoming } = &phi.kind {
            if incoming.iter().any(|u| !u.is_valid()) {
                return Err(CoreError::malformed_cfg(
                    &ssa.function,
                    Some(phi.block),
                    format!("phi {} for `{}` has an unfilled slot", phi.id, phi.variable),
                ));
            }
        }
    }
    ssa.verify(cfg)?;

    let stats = ssa.stats();
    log::debug!(
        "`{}`: {} def(s), {} use(s), {} phi(s), {} undefined",
        ssa.function,
        stats.defs,
        stats.uses,
        stats.phis,
        stats.undefined
    );
    Ok(ssa)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::CfgBuilder;
    use crate::context::CompilationContext;
    use crate::node::AstBuilder;
    use pretty_assertions::assert_eq;

    fn ssa_of(make: impl FnOnce(&mut AstBuilder) -> NodeId) -> (NodeArena, ControlFlowGraph, SsaFunction) {
        let ctx = CompilationContext::default();
        let mut arena = NodeArena::with_builtin_kinds();
        let f = {
            let mut b = AstBuilder::new(&mut arena, &ctx);
            make(&mut b)
        };
        let mut cfg = CfgBuilder::build(&arena, f).unwrap();
        let ssa = build_ssa(&arena, &mut cfg, f).unwrap();
        (arena, cfg, ssa)
    }

    #[test]
    fn test_diamond_places_one_phi() {
        let (_, cfg, ssa) = ssa_of(|b| {
            let c = b.param("c", Some(Type::Bool)).unwrap();
            let test = b.name("c").unwrap();
            let one = b.int(1).unwrap();
            let two = b.int(2).unwrap();
            let then = b.assign("x", one).unwrap();
            let orelse = b.assign("x", two).unwrap();
            let branch = b.if_(test, &[then], &[orelse]).unwrap();
            let x = b.name("x").unwrap();
            let ret = b.ret(Some(x)).unwrap();
            b.function("f", &[c], &[branch, ret]).unwrap()
        });

        let phis: Vec<_> = ssa.phis().collect();
        assert_eq!(phis.len(), 1);
        let phi = phis[0];
        assert_eq!(phi.variable, "x");
        let incoming = ssa.incoming_of(phi.id).unwrap();
        assert_eq!(incoming.len(), cfg.predecessors(phi.block).len());
        // the return reads the phi
        let ret_use = ssa
            .uses()
            .find(|u| matches!(u.site, UseSite::Name(_)) && u.variable == "x")
            .unwrap();
        assert_eq!(ret_use.def, phi.id);
        // x is assigned on both paths, so nothing is undefined
        assert_eq!(ssa.stats().undefined, 0);
    }

    #[test]
    fn test_one_sided_assignment_merges_undefined() {
        let (_, _, ssa) = ssa_of(|b| {
            let test = b.name("c").unwrap();
            let one = b.int(1).unwrap();
            let then = b.assign("x", one).unwrap();
            let branch = b.if_(test, &[then], &[]).unwrap();
            let x = b.name("x").unwrap();
            let ret = b.ret(Some(x)).unwrap();
            b.function("f", &[], &[branch, ret]).unwrap()
        });

        let undefined = ssa.undefined_def("x").unwrap();
        let phi = ssa.phis().next().unwrap();
        let incoming_defs: Vec<DefId> = ssa
            .incoming_of(phi.id)
            .unwrap()
            .iter()
            .map(|u| ssa.definition_of(*u).unwrap().id)
            .collect();
        assert!(incoming_defs.contains(&undefined.id));
        // c is read but never assigned
        assert!(ssa.undefined_def("c").is_some());
    }

    #[test]
    fn test_loop_carried_phi_in_header() {
        let (_, cfg, ssa) = ssa_of(|b| {
            let zero = b.int(0).unwrap();
            let init = b.assign("s", zero).unwrap();
            let start = b.int(0).unwrap();
            let stop = b.int(10).unwrap();
            let s = b.name("s").unwrap();
            let i = b.name("i").unwrap();
            let sum = b.binop("+", s, i).unwrap();
            let body = b.assign("s", sum).unwrap();
            let l = b.for_range("i", start, stop, None, &[body]).unwrap();
            let s_out = b.name("s").unwrap();
            let ret = b.ret(Some(s_out)).unwrap();
            b.function("f", &[], &[init, l, ret]).unwrap()
        });

        let info = cfg.loops().next().unwrap();
        let mut header_vars: Vec<&str> = ssa.phis_in(info.header).iter().map(|d| d.variable.as_str()).collect();
        header_vars.sort();
        assert_eq!(header_vars, vec!["i", "s"]);

        let step = ssa
            .defs()
            .find(|d| matches!(d.kind, DefKind::LoopStep { .. }))
            .unwrap();
        if let DefKind::LoopStep { previous, .. } = step.kind {
            let read = ssa.definition_of(previous).unwrap();
            assert_eq!(read.variable, "i");
            assert!(read.kind.is_phi());
        }
        assert!(ssa.verify(&cfg).is_ok());
    }

    #[test]
    fn test_dead_variable_gets_no_phi() {
        let (_, _, ssa) = ssa_of(|b| {
            let test = b.name("c").unwrap();
            let one = b.int(1).unwrap();
            let two = b.int(2).unwrap();
            let then = b.assign("t", one).unwrap();
            let orelse = b.assign("t", two).unwrap();
            let branch = b.if_(test, &[then], &[orelse]).unwrap();
            b.function("f", &[], &[branch]).unwrap()
        });
        assert_eq!(ssa.phis().count(), 0);
    }

    #[test]
    fn test_handler_sees_value_before_raising_statement() {
        let (_, _, ssa) = ssa_of(|b| {
            let call = b.call("g", &[]).unwrap();
            let assign = b.assign("x", call).unwrap();
            let x = b.name("x").unwrap();
            let use_x = b.expr_stmt(x).unwrap();
            let handler = b.handler(&[use_x]).unwrap();
            let t = b.try_(&[assign], &[handler]).unwrap();
            b.function("f", &[], &[t]).unwrap()
        });

        let handler_use = ssa.uses().find(|u| matches!(u.site, UseSite::Name(_))).unwrap();
        let phi = ssa.definition_of(handler_use.id).unwrap();
        assert!(phi.kind.is_phi());
        let sources: Vec<DefKind> = ssa
            .incoming_of(phi.id)
            .unwrap()
            .iter()
            .map(|u| ssa.definition_of(*u).unwrap().kind.clone())
            .collect();
        // raised inside the assignment: still undefined
        assert_eq!(sources[0], DefKind::Undefined);
    }
}
