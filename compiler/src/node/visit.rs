//! Kind-dispatched traversal
//!
//! Handlers are looked up by [`KindId`]; a node without a handler falls back to
//! the default handler, or simply has its children visited. Traversal is
//! preorder with children in declared field order, and each identity node is
//! visited once even when the graph is cyclic.

use super::arena::{Node, NodeArena};
use super::schema::{CompareMode, SchemaRegistry};
use crate::error::{CoreError, CoreResult};
use crate::ids::collections::{new_id_map, new_id_set, IdMap};
use crate::ids::{KindId, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitAction {
    /// Visit this node's children
    Descend,
    /// Do not visit this node's children
    Skip,
    /// Abort the traversal
    Stop,
}

pub type Handler<'h, C> = Box<dyn FnMut(&mut C, &NodeArena, &Node) -> VisitAction + 'h>;

pub struct KindDispatch<'h, C> {
    handlers: IdMap<KindId, Handler<'h, C>>,
    fallback: Option<Handler<'h, C>>,
}

impl<'h, C> Default for KindDispatch<'h, C> {
    fn default() -> Self {
        Self {
            handlers: new_id_map(),
            fallback: None,
        }
    }
}

impl<'h, C> KindDispatch<'h, C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(mut self, registry: &SchemaRegistry, kind: &str, handler: F) -> CoreResult<Self>
    where
        F: FnMut(&mut C, &NodeArena, &Node) -> VisitAction + 'h,
    {
        let id = registry
            .kind_id(kind)
            .ok_or_else(|| CoreError::schema(kind, "cannot dispatch on an unknown kind"))?;
        self.handlers.insert(id, Box::new(handler));
        Ok(self)
    }

    pub fn otherwise<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&mut C, &NodeArena, &Node) -> VisitAction + 'h,
    {
        self.fallback = Some(Box::new(handler));
        self
    }

    fn dispatch(&mut self, state: &mut C, arena: &NodeArena, node: &Node) -> VisitAction {
        if let Some(handler) = self.handlers.get_mut(&node.kind) {
            return handler(state, arena, node);
        }
        match self.fallback.as_mut() {
            Some(handler) => handler(state, arena, node),
            None => VisitAction::Descend,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VisitOutcome {
    pub visited: usize,
    pub stopped: bool,
}

/// Walk the graph reachable from `root`
pub fn visit<C>(
    arena: &NodeArena,
    root: NodeId,
    dispatch: &mut KindDispatch<'_, C>,
    state: &mut C,
) -> CoreResult<VisitOutcome> {
    let mut outcome = VisitOutcome::default();
    let mut seen = new_id_set();
    let mut stack = vec![root];

    while let Some(id) = stack.pop() {
        let node = arena.node(id)?;
        if node.mode == CompareMode::Identity && !seen.insert(id) {
            continue;
        }

        outcome.visited += 1;
        match dispatch.dispatch(state, arena, node) {
            VisitAction::Descend => {
                let children = node.children();
                stack.extend(children.into_iter().rev());
            }
            VisitAction::Skip => {}
            VisitAction::Stop => {
                outcome.stopped = true;
                break;
            }
        }
    }
    Ok(outcome)
}
