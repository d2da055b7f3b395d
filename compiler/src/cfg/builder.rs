//! Lowering of a function's structured statements into a CFG
//!
//! `If`, `While`, counted `For` and `Try` become the usual block shapes:
//!
//! - `If`: the current block branches to a then-region and an else-region
//!   (or straight to the join block when there is no else)
//! - `While`: header tests the condition, body jumps back to the header
//! - `For`: init in the preheader, header tests `target < stop`, the latch
//!   holds the step and jumps back; `continue` goes to the latch
//! - `Try`: every block of the protected body gets an exception edge to each
//!   handler entry; body and handlers rejoin after the statement
//!
//! Inside a protected region each statement gets a block of its own, so the
//! value flowing along an exception edge is the one live at the start of the
//! raising block.
//!
//! `Return`, `Raise`, `Break` and `Continue` end the current block; statements
//! that follow them land in a detached block which is pruned at the end.

use super::checks;
use super::{BlockRole, BlockStmt, Condition, ControlFlowGraph, EdgeKind, LoopInfo, Terminator};
use crate::error::{CoreError, CoreResult};
use crate::ids::{BlockId, NodeId};
use crate::node::ast::{self, Stmt};
use crate::node::NodeArena;

#[derive(Debug, Clone, Copy)]
struct LoopFrame {
    break_target: BlockId,
    continue_target: BlockId,
}

pub struct CfgBuilder<'a> {
    arena: &'a NodeArena,
    cfg: ControlFlowGraph,
    current: Option<BlockId>,
    loops: Vec<LoopFrame>,
    constructs: Vec<NodeId>,
    loop_depth: u32,
    protected: u32,
}

impl<'a> CfgBuilder<'a> {
    /// Build, prune and check the CFG of a `Function` node
    pub fn build(arena: &'a NodeArena, function: NodeId) -> CoreResult<ControlFlowGraph> {
        let view = ast::function(arena, function)?;
        let _span = tracing::debug_span!("build_cfg", function = view.name).entered();

        let cfg = ControlFlowGraph::new(view.name);
        let mut builder = CfgBuilder {
            arena,
            current: Some(cfg.entry_block),
            cfg,
            loops: Vec::new(),
            constructs: Vec::new(),
            loop_depth: 0,
            protected: 0,
        };

        builder.lower_body(&view.body)?;
        if let Some(block) = builder.current.take() {
            builder
                .cfg
                .set_terminator(block, Terminator::Return { value: None })?;
        }

        let mut cfg = builder.cfg;
        let removed = cfg.remove_unreachable_blocks();
        if !removed.is_empty() {
            log::debug!(
                "`{}`: pruned {} unreachable block(s)",
                cfg.function,
                removed.len()
            );
        }
        cfg.validate()?;
        checks::check_constructs(&cfg)?;

        let stats = cfg.stats();
        log::debug!(
            "`{}`: {} block(s), {} edge(s), {} loop(s)",
            cfg.function,
            stats.blocks,
            stats.edges,
            stats.loops
        );
        Ok(cfg)
    }

    fn new_block(&mut self, role: BlockRole) -> BlockId {
        self.cfg
            .create_block(role, self.constructs.last().copied(), self.loop_depth)
    }

    fn ensure_block(&mut self) -> BlockId {
        match self.current {
            Some(block) => block,
            None => {
                let block = self.new_block(BlockRole::Detached);
                self.current = Some(block);
                block
            }
        }
    }

    fn terminate(&mut self, terminator: Terminator) -> CoreResult<()> {
        let block = self.ensure_block();
        self.cfg.set_terminator(block, terminator)?;
        self.current = None;
        Ok(())
    }

    /// Fall through to `target` if control can reach the end of the current block
    fn jump_to(&mut self, target: BlockId) -> CoreResult<()> {
        if let Some(block) = self.current.take() {
            self.cfg.set_terminator(
                block,
                Terminator::Jump {
                    target,
                    kind: EdgeKind::Normal,
                },
            )?;
        }
        Ok(())
    }

    fn illegal(&self, node: NodeId, reason: &str) -> CoreError {
        CoreError::IllegalConstruct {
            function: self.cfg.function.clone(),
            node,
            reason: reason.to_string(),
        }
    }

    fn lower_body(&mut self, stmts: &[NodeId]) -> CoreResult<()> {
        for &stmt in stmts {
            self.lower_stmt(stmt)?;
        }
        Ok(())
    }

    fn lower_stmt(&mut self, id: NodeId) -> CoreResult<()> {
        match ast::stmt(self.arena, id)? {
            Stmt::Assign { .. } | Stmt::Expr { .. } => {
                let block = self.ensure_block();
                self.cfg.push_statement(block, BlockStmt::Node(id))?;
                if self.protected > 0 {
                    let next = self.new_block(BlockRole::TryBody);
                    self.jump_to(next)?;
                    self.current = Some(next);
                }
                Ok(())
            }
            Stmt::If { test, body, orelse } => self.lower_if(id, test, &body, &orelse),
            Stmt::While { test, body } => self.lower_while(id, test, &body),
            Stmt::For { body, parallel, .. } => self.lower_for(id, &body, parallel),
            Stmt::Try { body, handlers } => self.lower_try(id, &body, &handlers),
            Stmt::Break => {
                let frame = self
                    .loops
                    .last()
                    .copied()
                    .ok_or_else(|| self.illegal(id, "`break` outside of a loop"))?;
                self.terminate(Terminator::Jump {
                    target: frame.break_target,
                    kind: EdgeKind::Break,
                })
            }
            Stmt::Continue => {
                let frame = self
                    .loops
                    .last()
                    .copied()
                    .ok_or_else(|| self.illegal(id, "`continue` outside of a loop"))?;
                self.terminate(Terminator::Jump {
                    target: frame.continue_target,
                    kind: EdgeKind::Continue,
                })
            }
            Stmt::Return { value } => self.terminate(Terminator::Return { value }),
            Stmt::Raise { value } => self.terminate(Terminator::Raise { value }),
        }
    }

    fn lower_if(
        &mut self,
        id: NodeId,
        test: NodeId,
        body: &[NodeId],
        orelse: &[NodeId],
    ) -> CoreResult<()> {
        let cond_block = self.ensure_block();
        let join = self.new_block(BlockRole::Join);

        self.constructs.push(id);
        let then_block = self.new_block(BlockRole::Then);
        let else_block = if orelse.is_empty() {
            None
        } else {
            Some(self.new_block(BlockRole::Else))
        };
        self.cfg.set_terminator(
            cond_block,
            Terminator::Branch {
                condition: Condition::Expr(test),
                true_target: then_block,
                false_target: else_block.unwrap_or(join),
            },
        )?;

        self.current = Some(then_block);
        self.lower_body(body)?;
        self.jump_to(join)?;

        if let Some(else_block) = else_block {
            self.current = Some(else_block);
            self.lower_body(orelse)?;
            self.jump_to(join)?;
        }
        self.constructs.pop();

        self.current = Some(join);
        Ok(())
    }

    fn lower_while(&mut self, id: NodeId, test: NodeId, body: &[NodeId]) -> CoreResult<()> {
        let preheader = self.ensure_block();
        let exit = self.new_block(BlockRole::LoopExit);

        self.constructs.push(id);
        self.loop_depth += 1;
        let header = self.new_block(BlockRole::LoopHeader);
        let first_body = self.cfg.peek_next_block();
        let body_block = self.new_block(BlockRole::LoopBody);

        self.cfg.set_terminator(
            preheader,
            Terminator::Jump {
                target: header,
                kind: EdgeKind::Normal,
            },
        )?;
        self.cfg.set_terminator(
            header,
            Terminator::Branch {
                condition: Condition::Expr(test),
                true_target: body_block,
                false_target: exit,
            },
        )?;

        self.loops.push(LoopFrame {
            break_target: exit,
            continue_target: header,
        });
        self.current = Some(body_block);
        self.lower_body(body)?;
        self.jump_to(header)?;
        self.loops.pop();

        let depth = self.loop_depth;
        self.loop_depth -= 1;
        self.constructs.pop();

        let body_blocks = self.blocks_since(first_body);
        self.cfg.add_loop(LoopInfo {
            construct: id,
            header,
            latch: None,
            exit,
            body: body_blocks,
            parallel: false,
            depth,
        });
        self.current = Some(exit);
        Ok(())
    }

    fn lower_for(&mut self, id: NodeId, body: &[NodeId], parallel: bool) -> CoreResult<()> {
        let preheader = self.ensure_block();
        self.cfg
            .push_statement(preheader, BlockStmt::LoopInit { construct: id })?;
        let exit = self.new_block(BlockRole::LoopExit);

        self.constructs.push(id);
        self.loop_depth += 1;
        let header = self.new_block(BlockRole::LoopHeader);
        let first_body = self.cfg.peek_next_block();
        let body_block = self.new_block(BlockRole::LoopBody);
        let latch = self.new_block(BlockRole::LoopLatch);

        self.cfg.set_terminator(
            preheader,
            Terminator::Jump {
                target: header,
                kind: EdgeKind::Normal,
            },
        )?;
        self.cfg.set_terminator(
            header,
            Terminator::Branch {
                condition: Condition::LoopTest { construct: id },
                true_target: body_block,
                false_target: exit,
            },
        )?;
        self.cfg
            .push_statement(latch, BlockStmt::LoopStep { construct: id })?;
        self.cfg.set_terminator(
            latch,
            Terminator::Jump {
                target: header,
                kind: EdgeKind::Normal,
            },
        )?;

        self.loops.push(LoopFrame {
            break_target: exit,
            continue_target: latch,
        });
        self.current = Some(body_block);
        self.lower_body(body)?;
        self.jump_to(latch)?;
        self.loops.pop();

        let depth = self.loop_depth;
        self.loop_depth -= 1;
        self.constructs.pop();

        let body_blocks = self.blocks_since(first_body);
        self.cfg.add_loop(LoopInfo {
            construct: id,
            header,
            latch: Some(latch),
            exit,
            body: body_blocks,
            parallel,
            depth,
        });
        self.current = Some(exit);
        Ok(())
    }

    fn lower_try(&mut self, id: NodeId, body: &[NodeId], handlers: &[NodeId]) -> CoreResult<()> {
        let preheader = self.ensure_block();
        let after = self.new_block(BlockRole::AfterTry);

        self.constructs.push(id);
        let try_block = self.new_block(BlockRole::TryBody);
        let handler_blocks: Vec<(NodeId, BlockId)> = handlers
            .iter()
            .map(|&handler| (handler, self.new_block(BlockRole::Handler)))
            .collect();
        self.cfg.set_terminator(
            preheader,
            Terminator::Jump {
                target: try_block,
                kind: EdgeKind::Normal,
            },
        )?;

        let first_nested = self.cfg.peek_next_block();
        self.current = Some(try_block);
        self.protected += 1;
        self.lower_body(body)?;
        self.protected -= 1;
        self.jump_to(after)?;

        let mut protected = vec![try_block];
        protected.extend(self.blocks_since(first_nested));
        for &block in &protected {
            for &(_, handler_block) in &handler_blocks {
                self.cfg.add_exception_edge(block, handler_block)?;
            }
        }

        for (handler, handler_block) in handler_blocks {
            let handler_body = ast::handler_body(self.arena, handler)?;
            self.current = Some(handler_block);
            self.lower_body(&handler_body)?;
            self.jump_to(after)?;
        }
        self.constructs.pop();

        self.current = Some(after);
        Ok(())
    }

    /// Blocks created from `first` up to now, in creation order
    fn blocks_since(&self, first: BlockId) -> Vec<BlockId> {
        let end = self.cfg.peek_next_block().as_raw();
        (first.as_raw()..end)
            .map(BlockId::from_raw)
            .filter(|b| self.cfg.block(*b).is_some())
            .collect()
    }
}
