//! Variable reads and writes of block statements, in execution order
//!
//! Liveness, SSA renaming and the unbound analysis all walk the same sequence,
//! so it is computed once per function here.

use super::{BasicBlock, BlockStmt, Condition, ControlFlowGraph, Terminator};
use crate::error::CoreResult;
use crate::ids::collections::{new_id_map, IdMap};
use crate::ids::{BlockId, NodeId};
use crate::node::ast::{self, Expr, Stmt};
use crate::node::{visit, KindDispatch, NodeArena, VisitAction};
use crate::ssa::form::UseSite;

/// Where a definition comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefOrigin {
    Assign { stmt: NodeId, value: NodeId },
    LoopInit { construct: NodeId, start: NodeId },
    LoopStep { construct: NodeId, step: Option<NodeId> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect<'a> {
    Use { name: &'a str, site: UseSite },
    Def { name: &'a str, origin: DefOrigin },
}

impl<'a> Effect<'a> {
    pub fn name(&self) -> &'a str {
        match self {
            Effect::Use { name, .. } | Effect::Def { name, .. } => name,
        }
    }
}

pub type FunctionEffects<'a> = IdMap<BlockId, Vec<Effect<'a>>>;

/// `Name` nodes read by the expression rooted at `root`, in evaluation order
pub fn names_read<'a>(arena: &'a NodeArena, root: NodeId) -> CoreResult<Vec<(&'a str, NodeId)>> {
    let mut found: Vec<NodeId> = Vec::new();
    let mut dispatch = KindDispatch::new().on(
        arena.registry(),
        ast::NAME,
        |found: &mut Vec<NodeId>, _, node| {
            found.push(node.id);
            VisitAction::Skip
        },
    )?;
    visit(arena, root, &mut dispatch, &mut found)?;

    found
        .into_iter()
        .filter_map(|id| match ast::expr(arena, id) {
            Ok(Expr::Name { name }) => Some(Ok((name, id))),
            Ok(_) => None,
            Err(e) => Some(Err(e)),
        })
        .collect()
}

fn reads<'a>(arena: &'a NodeArena, root: NodeId, out: &mut Vec<Effect<'a>>) -> CoreResult<()> {
    for (name, node) in names_read(arena, root)? {
        out.push(Effect::Use {
            name,
            site: UseSite::Name(node),
        });
    }
    Ok(())
}

/// `(target name, start, stop, step)` of a `For` node
fn for_parts(arena: &NodeArena, construct: NodeId) -> CoreResult<(&str, NodeId, NodeId, Option<NodeId>)> {
    match ast::stmt(arena, construct)? {
        Stmt::For {
            name,
            start,
            stop,
            step,
            ..
        } => Ok((name, start, stop, step)),
        _ => Err(crate::error::CoreError::schema(
            arena.kind_name(construct).unwrap_or("<unknown>"),
            "loop statement is not a `For`",
        )),
    }
}

pub fn block_effects<'a>(arena: &'a NodeArena, block: &BasicBlock) -> CoreResult<Vec<Effect<'a>>> {
    let mut out = Vec::new();

    for stmt in &block.statements {
        match *stmt {
            BlockStmt::Node(id) => match ast::stmt(arena, id)? {
                Stmt::Assign { name, value, .. } => {
                    reads(arena, value, &mut out)?;
                    out.push(Effect::Def {
                        name,
                        origin: DefOrigin::Assign { stmt: id, value },
                    });
                }
                Stmt::Expr { value } => reads(arena, value, &mut out)?,
                _ => {}
            },
            BlockStmt::LoopInit { construct } => {
                let (name, start, _, _) = for_parts(arena, construct)?;
                reads(arena, start, &mut out)?;
                out.push(Effect::Def {
                    name,
                    origin: DefOrigin::LoopInit { construct, start },
                });
            }
            BlockStmt::LoopStep { construct } => {
                let (name, _, _, step) = for_parts(arena, construct)?;
                out.push(Effect::Use {
                    name,
                    site: UseSite::LoopStep { construct },
                });
                if let Some(step) = step {
                    reads(arena, step, &mut out)?;
                }
                out.push(Effect::Def {
                    name,
                    origin: DefOrigin::LoopStep { construct, step },
                });
            }
        }
    }

    match &block.terminator {
        Some(Terminator::Branch { condition, .. }) => match *condition {
            Condition::Expr(test) => reads(arena, test, &mut out)?,
            Condition::LoopTest { construct } => {
                let (name, _, stop, _) = for_parts(arena, construct)?;
                out.push(Effect::Use {
                    name,
                    site: UseSite::LoopTest { construct },
                });
                reads(arena, stop, &mut out)?;
            }
        },
        Some(Terminator::Return { value: Some(value) })
        | Some(Terminator::Raise { value: Some(value) }) => reads(arena, *value, &mut out)?,
        _ => {}
    }

    Ok(out)
}

pub fn function_effects<'a>(arena: &'a NodeArena, cfg: &ControlFlowGraph) -> CoreResult<FunctionEffects<'a>> {
    let mut effects = new_id_map();
    for block in cfg.blocks() {
        effects.insert(block.id, block_effects(arena, block)?);
    }
    Ok(effects)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::CfgBuilder;
    use crate::context::CompilationContext;
    use crate::node::AstBuilder;

    #[test]
    fn test_assign_reads_before_write() {
        let ctx = CompilationContext::default();
        let mut arena = NodeArena::with_builtin_kinds();
        let mut b = AstBuilder::new(&mut arena, &ctx);
        let x = b.name("x").unwrap();
        let y = b.name("y").unwrap();
        let sum = b.binop("+", x, y).unwrap();
        let stmt = b.assign("x", sum).unwrap();
        let f = b.function("f", &[], &[stmt]).unwrap();

        let cfg = CfgBuilder::build(&arena, f).unwrap();
        let effects = function_effects(&arena, &cfg).unwrap();
        let entry = &effects[&cfg.entry_block];
        let names: Vec<(&str, bool)> = entry
            .iter()
            .map(|e| (e.name(), matches!(e, Effect::Def { .. })))
            .collect();
        assert_eq!(names, vec![("x", false), ("y", false), ("x", true)]);
    }

    #[test]
    fn test_for_loop_effects() {
        let ctx = CompilationContext::default();
        let mut arena = NodeArena::with_builtin_kinds();
        let mut b = AstBuilder::new(&mut arena, &ctx);
        let start = b.int(0).unwrap();
        let n = b.name("n").unwrap();
        let l = b.for_range("i", start, n, None, &[]).unwrap();
        let f = b.function("f", &[], &[l]).unwrap();

        let cfg = CfgBuilder::build(&arena, f).unwrap();
        let info = cfg.loops().next().unwrap();
        let effects = function_effects(&arena, &cfg).unwrap();

        let header = &effects[&info.header];
        assert_eq!(
            header[0],
            Effect::Use {
                name: "i",
                site: UseSite::LoopTest { construct: l }
            }
        );
        assert_eq!(header[1].name(), "n");

        let latch = &effects[&info.latch.unwrap()];
        assert_eq!(latch.len(), 2);
        assert!(matches!(latch[1], Effect::Def { origin: DefOrigin::LoopStep { step: None, .. }, .. }));
    }
}
