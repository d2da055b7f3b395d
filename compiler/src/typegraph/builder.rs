//! Per-function type graphs and whole-program linking
//!
//! A [`FunctionTypeGraph`] only knows its own function. Calls to other
//! functions of the program stay `Apply` nodes until [`link`] runs, which
//! turns them into copies of the callee's return node and feeds the argument
//! nodes into the callee's parameter joins.

use super::{NodeOrigin, TypeGraph, TypeNodeKind};
use crate::cfg::{BlockStmt, Condition, ControlFlowGraph, Terminator};
use crate::error::{CoreError, CoreResult};
use crate::ids::{BlockId, DefId, NodeId, TypeNodeId, UseId};
use crate::node::ast::{self, Expr, Stmt};
use crate::node::NodeArena;
use crate::ssa::{DefKind, SsaFunction};
use crate::types::Type;
use fxhash::FxHashMap;
use indexmap::IndexMap;
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// A `Call` expression and the `Apply` node built for it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSite {
    pub callee: String,
    pub block: BlockId,
    pub node: NodeId,
    pub apply: TypeNodeId,
    pub args: Vec<TypeNodeId>,
}

#[derive(Debug, Clone)]
pub struct FunctionTypeGraph {
    pub function: String,
    pub graph: TypeGraph,
    pub def_nodes: IndexMap<DefId, TypeNodeId>,
    /// One node per parameter, in declaration order
    pub param_nodes: Vec<TypeNodeId>,
    pub return_node: TypeNodeId,
    pub calls: Vec<CallSite>,
}

struct GraphBuilder<'a> {
    arena: &'a NodeArena,
    ssa: &'a SsaFunction,
    graph: TypeGraph,
    def_nodes: IndexMap<DefId, TypeNodeId>,
    exprs: FxHashMap<(BlockId, NodeId), TypeNodeId>,
    calls: Vec<CallSite>,
    none_node: Option<TypeNodeId>,
}

impl<'a> GraphBuilder<'a> {
    fn def_node(&self, def: DefId) -> CoreResult<TypeNodeId> {
        self.def_nodes.get(&def).copied().ok_or_else(|| {
            CoreError::malformed_cfg(&self.ssa.function, None, format!("no type node for {}", def))
        })
    }

    fn use_node(&self, use_id: UseId) -> CoreResult<TypeNodeId> {
        let def = self.ssa.use_(use_id).map(|u| u.def).ok_or_else(|| {
            CoreError::malformed_cfg(&self.ssa.function, None, format!("missing use {}", use_id))
        })?;
        self.def_node(def)
    }

    fn constant(&mut self, ty: Type, origin: NodeOrigin) -> TypeNodeId {
        self.graph.add(TypeNodeKind::Constant(ty), origin)
    }

    fn none_constant(&mut self) -> TypeNodeId {
        match self.none_node {
            Some(node) => node,
            None => {
                let node = self.constant(Type::None, NodeOrigin::Synthetic);
                self.none_node = Some(node);
                node
            }
        }
    }

    /// Type node for the expression `node` evaluated in `block`
    fn expr_node(&mut self, block: BlockId, node: NodeId) -> CoreResult<TypeNodeId> {
        if let Some(&existing) = self.exprs.get(&(block, node)) {
            return Ok(existing);
        }
        let origin = NodeOrigin::Expr(node);
        let id = match ast::expr(self.arena, node)? {
            Expr::Name { name } => {
                let def = self
                    .ssa
                    .name_use_in(node, block)
                    .map(|u| u.def)
                    .ok_or_else(|| {
                        CoreError::malformed_cfg(
                            &self.ssa.function,
                            Some(block),
                            format!("read of `{}` has no SSA use", name),
                        )
                    })?;
                let source = self.def_node(def)?;
                self.graph.add(TypeNodeKind::Copy(source), origin)
            }
            Expr::Const { ty } => self.constant(ty.clone(), origin),
            Expr::Call { func, args } => {
                let args = args
                    .into_iter()
                    .map(|arg| self.expr_node(block, arg))
                    .collect::<CoreResult<Vec<_>>>()?;
                let apply = self.graph.add(
                    TypeNodeKind::Apply {
                        rule: func.to_string(),
                        args: args.clone(),
                    },
                    origin,
                );
                self.calls.push(CallSite {
                    callee: func.to_string(),
                    block,
                    node,
                    apply,
                    args,
                });
                apply
            }
            Expr::BinOp { op, left, right } => {
                let left = self.expr_node(block, left)?;
                let right = self.expr_node(block, right)?;
                self.graph.add(
                    TypeNodeKind::Apply {
                        rule: op.to_string(),
                        args: vec![left, right],
                    },
                    origin,
                )
            }
            Expr::Cast { value, ty } => {
                // the operand may still contain calls that need linking
                self.expr_node(block, value)?;
                self.constant(ty.clone(), origin)
            }
            Expr::Other { kind } => {
                trace!("{}: no type rule for `{}` node {}, assuming dynamic", self.ssa.function, kind, node);
                self.constant(Type::Dynamic, origin)
            }
        };
        self.exprs.insert((block, node), id);
        Ok(id)
    }

    fn fill_def(&mut self, def: DefId) -> CoreResult<()> {
        let ssa = self.ssa;
        let Some(d) = ssa.def(def) else {
            return Ok(());
        };
        let node = self.def_node(def)?;
        let declared = d.declared_type.clone().map(TypeNodeKind::Constant);
        let kind = match &d.kind {
            DefKind::Param { .. } => {
                declared.unwrap_or_else(|| TypeNodeKind::Join(SmallVec::new()))
            }
            DefKind::Assign { value, .. } => {
                let value = self.expr_node(d.block, *value)?;
                declared.unwrap_or(TypeNodeKind::Copy(value))
            }
            DefKind::LoopInit { start, .. } => {
                let start = self.expr_node(d.block, *start)?;
                declared.unwrap_or(TypeNodeKind::Copy(start))
            }
            DefKind::LoopStep { step, previous, .. } => {
                let previous = self.use_node(*previous)?;
                let step = match step {
                    Some(step) => self.expr_node(d.block, *step)?,
                    None => self.constant(Type::INT64, NodeOrigin::Synthetic),
                };
                declared.unwrap_or(TypeNodeKind::Apply {
                    rule: "+".to_string(),
                    args: vec![previous, step],
                })
            }
            DefKind::Phi { incoming } => match declared {
                Some(kind) => kind,
                None => {
                    let mut inputs = SmallVec::new();
                    for slot in incoming {
                        let Some(source) = ssa.definition_of(*slot) else {
                            continue;
                        };
                        if source.kind == DefKind::Undefined {
                            continue;
                        }
                        let input = self.def_node(source.id)?;
                        if !inputs.contains(&input) {
                            inputs.push(input);
                        }
                    }
                    TypeNodeKind::Join(inputs)
                }
            },
            DefKind::Promotion { source, .. } => match declared {
                Some(kind) => kind,
                None => TypeNodeKind::Copy(self.use_node(*source)?),
            },
            DefKind::Undefined => TypeNodeKind::Undefined,
        };
        self.graph.set(node, kind);
        Ok(())
    }

    fn visit_block_exprs(&mut self, cfg: &ControlFlowGraph, block: BlockId) -> CoreResult<Vec<TypeNodeId>> {
        let Some(bb) = cfg.block(block) else {
            return Ok(Vec::new());
        };
        for stmt in &bb.statements {
            if let BlockStmt::Node(id) = stmt {
                if let Stmt::Expr { value } = ast::stmt(self.arena, *id)? {
                    self.expr_node(block, value)?;
                }
            }
        }

        let mut returns = Vec::new();
        match &bb.terminator {
            Some(Terminator::Branch { condition, .. }) => match condition {
                Condition::Expr(test) => {
                    self.expr_node(block, *test)?;
                }
                Condition::LoopTest { construct } => {
                    if let Stmt::For { stop, .. } = ast::stmt(self.arena, *construct)? {
                        self.expr_node(block, stop)?;
                    }
                }
            },
            Some(Terminator::Return { value }) => {
                let node = match value {
                    Some(value) => self.expr_node(block, *value)?,
                    None => self.none_constant(),
                };
                returns.push(node);
            }
            Some(Terminator::Raise { value: Some(value) }) => {
                self.expr_node(block, *value)?;
            }
            _ => {}
        }
        Ok(returns)
    }
}

impl FunctionTypeGraph {
    pub fn build(arena: &NodeArena, cfg: &ControlFlowGraph, ssa: &SsaFunction) -> CoreResult<Self> {
        let view = ast::function(arena, ssa.node)?;
        let mut builder = GraphBuilder {
            arena,
            ssa,
            graph: TypeGraph::new(),
            def_nodes: IndexMap::new(),
            exprs: FxHashMap::default(),
            calls: Vec::new(),
            none_node: None,
        };

        // Defs refer to each other through phis and loop steps
        for def in ssa.defs() {
            let node = builder.graph.reserve(NodeOrigin::Def(def.id));
            builder.def_nodes.insert(def.id, node);
        }
        let def_ids: Vec<DefId> = ssa.defs().map(|d| d.id).collect();
        for def in def_ids {
            builder.fill_def(def)?;
        }
        // A declared signature types the parameters that carry no type of their own
        if let Some(signature) = &view.signature {
            for (param, ty) in ssa.params.iter().zip(signature) {
                let untyped = ssa.def(*param).is_some_and(|d| d.declared_type.is_none());
                if untyped {
                    let node = builder.def_node(*param)?;
                    builder.graph.set(node, TypeNodeKind::Constant((*ty).clone()));
                }
            }
        }

        let mut returns = Vec::new();
        for block in cfg.block_ids() {
            returns.extend(builder.visit_block_exprs(cfg, block)?);
        }

        let return_kind = match view.return_type {
            Some(ty) => TypeNodeKind::Constant(ty.clone()),
            None if returns.is_empty() => TypeNodeKind::Constant(Type::None),
            None => {
                let mut inputs: SmallVec<[TypeNodeId; 4]> = SmallVec::new();
                for r in returns {
                    if !inputs.contains(&r) {
                        inputs.push(r);
                    }
                }
                TypeNodeKind::Join(inputs)
            }
        };
        let return_node = builder.graph.add(return_kind, NodeOrigin::Return);

        let param_nodes = ssa
            .params
            .iter()
            .map(|p| builder.def_node(*p))
            .collect::<CoreResult<Vec<_>>>()?;

        debug!(
            "type graph for {}: {} node(s), {} edge(s), {} call(s)",
            view.name,
            builder.graph.len(),
            builder.graph.edge_count(),
            builder.calls.len()
        );

        Ok(Self {
            function: view.name.to_string(),
            graph: builder.graph,
            def_nodes: builder.def_nodes,
            param_nodes,
            return_node,
            calls: builder.calls,
        })
    }

    pub fn def_node(&self, def: DefId) -> Option<TypeNodeId> {
        self.def_nodes.get(&def).copied()
    }
}

/// A function's nodes after they were moved into the program graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkedFunction {
    pub function: String,
    pub def_nodes: IndexMap<DefId, TypeNodeId>,
    pub param_nodes: Vec<TypeNodeId>,
    pub return_node: TypeNodeId,
    pub calls: Vec<CallSite>,
}

impl LinkedFunction {
    /// Program functions this one calls, in first-call order
    pub fn local_callees<'p>(&'p self, program: &'p ProgramGraph) -> impl Iterator<Item = &'p str> + 'p {
        let mut seen: Vec<&str> = Vec::new();
        self.calls.iter().filter_map(move |call| {
            let callee = call.callee.as_str();
            if program.functions.contains_key(callee) && !seen.contains(&callee) {
                seen.push(callee);
                Some(callee)
            } else {
                None
            }
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProgramGraph {
    pub graph: TypeGraph,
    pub functions: IndexMap<String, LinkedFunction>,
    /// Link failures, keyed by the calling function
    pub errors: Vec<(String, CoreError)>,
}

impl ProgramGraph {
    pub fn function(&self, name: &str) -> Option<&LinkedFunction> {
        self.functions.get(name)
    }
}

/// Merge per-function graphs and connect calls between them
pub fn link(functions: Vec<FunctionTypeGraph>) -> ProgramGraph {
    let mut program = ProgramGraph::default();

    for f in functions {
        let offset = program.graph.absorb(f.graph, &f.function);
        let shift = |n: TypeNodeId| TypeNodeId::from_raw(n.as_raw() + offset);
        let linked = LinkedFunction {
            function: f.function.clone(),
            def_nodes: f.def_nodes.into_iter().map(|(d, n)| (d, shift(n))).collect(),
            param_nodes: f.param_nodes.into_iter().map(shift).collect(),
            return_node: shift(f.return_node),
            calls: f
                .calls
                .into_iter()
                .map(|call| CallSite {
                    apply: shift(call.apply),
                    args: call.args.into_iter().map(shift).collect(),
                    ..call
                })
                .collect(),
        };
        program.functions.insert(f.function, linked);
    }

    // (apply node, callee return node, (param node, argument node) pairs)
    let mut rewrites: Vec<(TypeNodeId, TypeNodeId, Vec<(TypeNodeId, TypeNodeId)>)> = Vec::new();
    for caller in program.functions.values() {
        for call in &caller.calls {
            let Some(callee) = program.functions.get(&call.callee) else {
                continue;
            };
            if callee.param_nodes.len() != call.args.len() {
                program.errors.push((
                    caller.function.clone(),
                    CoreError::schema(
                        "Call",
                        format!(
                            "`{}` expects {} argument(s), got {}",
                            callee.function,
                            callee.param_nodes.len(),
                            call.args.len()
                        ),
                    ),
                ));
                rewrites.push((call.apply, callee.return_node, Vec::new()));
                continue;
            }
            let bindings = callee.param_nodes.iter().copied().zip(call.args.iter().copied()).collect();
            rewrites.push((call.apply, callee.return_node, bindings));
        }
    }

    for (apply, callee_return, bindings) in rewrites {
        program.graph.set(apply, TypeNodeKind::Copy(callee_return));
        for (param, arg) in bindings {
            if let Some(node) = program.graph.node_mut(param) {
                if let TypeNodeKind::Join(inputs) = &mut node.kind {
                    if !inputs.contains(&arg) {
                        inputs.push(arg);
                    }
                }
            }
        }
    }

    for f in program.functions.values() {
        for (index, param) in f.param_nodes.iter().enumerate() {
            let Some(node) = program.graph.node_mut(*param) else {
                continue;
            };
            if matches!(&node.kind, TypeNodeKind::Join(inputs) if inputs.is_empty()) {
                warn!(
                    "parameter {} of `{}` has no declared type and no call site, assuming dynamic",
                    index, f.function
                );
                node.kind = TypeNodeKind::Constant(Type::Dynamic);
            }
        }
    }

    debug!(
        "linked {} function(s) into {} type node(s)",
        program.functions.len(),
        program.graph.len()
    );
    program
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::builder::CfgBuilder;
    use crate::context::CompilationContext;
    use crate::node::AstBuilder;
    use crate::ssa::build_ssa;

    fn graph_of(arena: &NodeArena, function: NodeId) -> FunctionTypeGraph {
        let mut cfg = CfgBuilder::build(arena, function).unwrap();
        let ssa = build_ssa(arena, &mut cfg, function).unwrap();
        FunctionTypeGraph::build(arena, &cfg, &ssa).unwrap()
    }

    #[test]
    fn test_literal_assignment_is_copy_of_constant() {
        let ctx = CompilationContext::default();
        let mut arena = NodeArena::with_builtin_kinds();
        let mut b = AstBuilder::new(&mut arena, &ctx);
        let one = b.int(1).unwrap();
        let x = b.assign("x", one).unwrap();
        let read = b.name("x").unwrap();
        let ret = b.ret(Some(read)).unwrap();
        let f = b.function("f", &[], &[x, ret]).unwrap();

        let g = graph_of(&arena, f);
        // x has a declared type from its literal
        let x_def = g.def_nodes.values().find(|n| {
            matches!(g.graph.kind(**n), Some(TypeNodeKind::Constant(Type::Int { .. })))
        });
        assert!(x_def.is_some());
        match g.graph.kind(g.return_node) {
            Some(TypeNodeKind::Join(inputs)) => assert_eq!(inputs.len(), 1),
            other => panic!("unexpected return node {:?}", other),
        }
    }

    #[test]
    fn test_untyped_assignment_copies_call() {
        let ctx = CompilationContext::default();
        let mut arena = NodeArena::with_builtin_kinds();
        let mut b = AstBuilder::new(&mut arena, &ctx);
        let arg = b.float(2.0).unwrap();
        let call = b.call("abs", &[arg]).unwrap();
        let y = b.assign("y", call).unwrap();
        let f = b.function("f", &[], &[y]).unwrap();

        let g = graph_of(&arena, f);
        assert_eq!(g.calls.len(), 1);
        assert_eq!(g.calls[0].callee, "abs");
        let copies_call = g
            .def_nodes
            .values()
            .any(|n| g.graph.kind(*n) == Some(&TypeNodeKind::Copy(g.calls[0].apply)));
        assert!(copies_call);
        // implicit `return None`
        match g.graph.kind(g.return_node) {
            Some(TypeNodeKind::Join(inputs)) => {
                assert_eq!(g.graph.kind(inputs[0]), Some(&TypeNodeKind::Constant(Type::None)))
            }
            other => panic!("unexpected return node {:?}", other),
        }
    }

    #[test]
    fn test_link_connects_call_sites_to_params() {
        let ctx = CompilationContext::default();
        let mut arena = NodeArena::with_builtin_kinds();
        let mut b = AstBuilder::new(&mut arena, &ctx);

        let p = b.param("p", None).unwrap();
        let read = b.name("p").unwrap();
        let ret = b.ret(Some(read)).unwrap();
        let id_fn = b.function("ident", &[p], &[ret]).unwrap();

        let seven = b.int(7).unwrap();
        let call = b.call("ident", &[seven]).unwrap();
        let x = b.assign("x", call).unwrap();
        let main = b.function("main", &[], &[x]).unwrap();

        let lonely = b.param("q", None).unwrap();
        let unused = b.function("unused", &[lonely], &[]).unwrap();

        let graphs = vec![graph_of(&arena, id_fn), graph_of(&arena, main), graph_of(&arena, unused)];
        let program = link(graphs);
        assert!(program.errors.is_empty());

        let ident = program.function("ident").unwrap();
        let main = program.function("main").unwrap();
        let call = &main.calls[0];
        assert_eq!(
            program.graph.kind(call.apply),
            Some(&TypeNodeKind::Copy(ident.return_node))
        );
        match program.graph.kind(ident.param_nodes[0]) {
            Some(TypeNodeKind::Join(inputs)) => assert_eq!(inputs.as_slice(), call.args.as_slice()),
            other => panic!("unexpected param node {:?}", other),
        }
        assert_eq!(main.local_callees(&program).collect::<Vec<_>>(), vec!["ident"]);

        let unused = program.function("unused").unwrap();
        assert_eq!(
            program.graph.kind(unused.param_nodes[0]),
            Some(&TypeNodeKind::Constant(Type::Dynamic))
        );
    }

    #[test]
    fn test_link_reports_arity_mismatch() {
        let ctx = CompilationContext::default();
        let mut arena = NodeArena::with_builtin_kinds();
        let mut b = AstBuilder::new(&mut arena, &ctx);
        let p = b.param("p", Some(Type::INT64)).unwrap();
        let callee = b.function("g", &[p], &[]).unwrap();
        let call = b.call("g", &[]).unwrap();
        let stmt = b.expr_stmt(call).unwrap();
        let caller = b.function("h", &[], &[stmt]).unwrap();

        let program = link(vec![graph_of(&arena, callee), graph_of(&arena, caller)]);
        assert_eq!(program.errors.len(), 1);
        assert_eq!(program.errors[0].0, "h");
    }
}
