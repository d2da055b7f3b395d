//! Construct checks that need the finished graph
//!
//! A parallel `For` must not be left early: a `break` out of it or a `return`
//! from inside it is rejected. The offending loop is found again through the
//! construct back-pointers on its blocks.

use super::{ControlFlowGraph, EdgeKind, LoopInfo, Terminator};
use crate::error::{CoreError, CoreResult};
use crate::ids::{BlockId, NodeId};

/// Loops whose body contains `block`, innermost first
pub fn enclosing_loops(cfg: &ControlFlowGraph, block: BlockId) -> Vec<&LoopInfo> {
    let mut loops: Vec<&LoopInfo> = cfg.loops().filter(|l| l.body.contains(&block)).collect();
    loops.sort_by(|a, b| b.depth.cmp(&a.depth));
    loops
}

/// Construct a block was created for, if it is a loop
pub fn owning_loop(cfg: &ControlFlowGraph, block: BlockId) -> Option<&LoopInfo> {
    let construct: NodeId = cfg.block(block)?.metadata.construct?;
    cfg.loop_info(construct)
}

pub fn check_constructs(cfg: &ControlFlowGraph) -> CoreResult<()> {
    for bb in cfg.blocks() {
        let reason = match &bb.terminator {
            Some(Terminator::Jump {
                target,
                kind: EdgeKind::Break,
            }) => enclosing_loops(cfg, bb.id)
                .into_iter()
                .find(|l| l.exit == *target && l.parallel)
                .map(|l| (l.construct, "`break` out of a parallel loop")),
            Some(Terminator::Return { .. }) => enclosing_loops(cfg, bb.id)
                .into_iter()
                .find(|l| l.parallel)
                .map(|l| (l.construct, "`return` inside a parallel loop")),
            _ => None,
        };

        if let Some((construct, reason)) = reason {
            log::debug!(
                "`{}`: {} at {} (block construct {:?})",
                cfg.function,
                reason,
                bb.id,
                owning_loop(cfg, bb.id).map(|l| l.construct)
            );
            return Err(CoreError::IllegalConstruct {
                function: cfg.function.clone(),
                node: construct,
                reason: reason.to_string(),
            });
        }
    }
    Ok(())
}
