//! Whole-program compilation: normalized AST functions -> typed SSA IR
//!
//! Stages, per function and independent of every other function:
//! 1. Signature validators
//! 2. CFG construction and construct checks
//! 3. SSA construction and promotion insertion
//! 4. Reaching-definition (unbound variable) analysis
//! 5. Local type graph
//!
//! Then, once every function has its local graph:
//! 6. Link the graphs and build the call graph
//! 7. Resolve the program graph
//! 8. Attribute failures and assemble one [`TypedFunction`] per function
//!
//! Errors are collected per function. A function that fails never stops the
//! others from compiling.

use crate::callgraph::CallGraph;
use crate::cfg::{CfgBuilder, ControlFlowGraph};
use crate::context::{CompilationContext, Signature};
use crate::error::{CoreError, CoreResult};
use crate::ids::{NodeId, TypeNodeId};
use crate::ir::{DefType, TypedFunction};
use crate::node::ast;
use crate::node::NodeArena;
use crate::ssa::{build_ssa, insert_promotions, DefKind, SsaFunction};
use crate::typegraph::{link, FunctionRules, FunctionTypeGraph, Resolution, Resolver, ResolverStats};
use crate::unbound::{self, SentinelRequirement};
use crate::validators::{default_validators, run_validators, FunctionValidator};
use diagnostics::{DiagnosticBuilder, DiagnosticSeverity, Diagnostics, IrLocation};
use indexmap::IndexMap;
use log::{debug, info, warn};
use rayon::prelude::*;
use std::time::Instant;

/// Statistics collected during compilation
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    pub functions: usize,
    /// Functions that stopped before producing IR
    pub failed_functions: usize,
    pub blocks: usize,
    pub defs: usize,
    pub phis: usize,
    pub promotions: usize,
    pub type_nodes: usize,
    pub resolver: ResolverStats,

    /// Per-function construction time in microseconds
    pub local_time_us: u64,

    /// Linking and resolution time in microseconds
    pub resolve_time_us: u64,

    /// Total compilation time in microseconds
    pub total_time_us: u64,
}

#[derive(Debug, Clone)]
pub struct FunctionReport {
    pub name: String,
    pub node: NodeId,
    /// Absent when construction failed before types could be resolved
    pub ir: Option<TypedFunction>,
    pub errors: Vec<CoreError>,
    /// Errors recovered by a fallback type
    pub warnings: Vec<CoreError>,
    /// Validator messages
    pub lints: Vec<String>,
}

impl FunctionReport {
    fn failed(name: String, node: NodeId, error: CoreError) -> Self {
        Self {
            name,
            node,
            ir: None,
            errors: vec![error],
            warnings: Vec::new(),
            lints: Vec::new(),
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn push_error(&mut self, error: CoreError) {
        if !self.errors.contains(&error) {
            self.errors.push(error);
        }
    }

    pub fn push_warning(&mut self, warning: CoreError) {
        if !self.warnings.contains(&warning) {
            self.warnings.push(warning);
        }
    }

    pub fn diagnostics(&self) -> Diagnostics {
        let mut out = Diagnostics::new();
        for error in &self.errors {
            out.push(error.to_diagnostic(&self.name, DiagnosticSeverity::Error));
        }
        for warning in &self.warnings {
            out.push(warning.to_diagnostic(&self.name, DiagnosticSeverity::Warning));
        }
        for lint in &self.lints {
            out.push(
                DiagnosticBuilder::warning(lint.clone(), IrLocation::function(&self.name))
                    .code("W0101")
                    .build(),
            );
        }
        out
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProgramReport {
    pub functions: IndexMap<String, FunctionReport>,
    pub call_graph: CallGraph,
    pub stats: PipelineStats,
}

impl ProgramReport {
    pub fn function(&self, name: &str) -> Option<&FunctionReport> {
        self.functions.get(name)
    }

    pub fn ir(&self, name: &str) -> Option<&TypedFunction> {
        self.function(name).and_then(|f| f.ir.as_ref())
    }

    pub fn has_errors(&self) -> bool {
        self.functions.values().any(FunctionReport::has_errors)
    }

    pub fn error_count(&self) -> usize {
        self.functions.values().map(|f| f.errors.len()).sum()
    }

    pub fn warning_count(&self) -> usize {
        self.functions.values().map(|f| f.warnings.len()).sum()
    }

    pub fn diagnostics(&self) -> Diagnostics {
        let mut out = Diagnostics::new();
        for f in self.functions.values() {
            out.extend(f.diagnostics());
        }
        out
    }

    /// Every produced IR, in input order
    pub fn typed_functions(&self) -> impl Iterator<Item = &TypedFunction> {
        self.functions.values().filter_map(|f| f.ir.as_ref())
    }
}

/// A function that made it through every local stage
struct LocalUnit {
    report: FunctionReport,
    cfg: ControlFlowGraph,
    ssa: SsaFunction,
    graph: FunctionTypeGraph,
    requirements: Vec<SentinelRequirement>,
}

enum LocalOutcome {
    Built(Box<LocalUnit>),
    Failed(FunctionReport),
}

pub struct Pipeline<'c> {
    ctx: &'c CompilationContext,
    rules: FunctionRules,
    validators: Vec<Box<dyn FunctionValidator>>,
}

impl<'c> Pipeline<'c> {
    pub fn new(ctx: &'c CompilationContext) -> Self {
        Self {
            ctx,
            rules: FunctionRules::builtin(),
            validators: default_validators(),
        }
    }

    pub fn with_rules(mut self, rules: FunctionRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_validators(mut self, validators: Vec<Box<dyn FunctionValidator>>) -> Self {
        self.validators = validators;
        self
    }

    pub fn rules(&self) -> &FunctionRules {
        &self.rules
    }

    pub fn compile(&self, arena: &NodeArena, functions: &[NodeId]) -> ProgramReport {
        let start = Instant::now();
        let parallel = self.ctx.config().parallel;
        info!(
            "compiling {} function(s){}",
            functions.len(),
            if parallel { " in parallel" } else { "" }
        );

        let outcomes: Vec<LocalOutcome> = if parallel {
            functions.par_iter().map(|f| self.build_local(arena, *f)).collect()
        } else {
            functions.iter().map(|f| self.build_local(arena, *f)).collect()
        };
        let local_time = start.elapsed();

        let mut report = ProgramReport::default();
        report.stats.functions = functions.len();
        report.stats.local_time_us = local_time.as_micros() as u64;

        let mut units: Vec<LocalUnit> = Vec::new();
        for outcome in outcomes {
            match outcome {
                LocalOutcome::Built(unit) => {
                    let name = unit.report.name.clone();
                    if report.functions.contains_key(&name) || units.iter().any(|u| u.report.name == name) {
                        let key = format!("{}@{}", name, unit.report.node);
                        let error = CoreError::schema(
                            ast::FUNCTION,
                            format!("function `{}` is defined more than once", name),
                        );
                        report
                            .functions
                            .insert(key, FunctionReport::failed(name, unit.report.node, error));
                        report.stats.failed_functions += 1;
                        continue;
                    }
                    units.push(*unit);
                }
                LocalOutcome::Failed(failed) => {
                    report.stats.failed_functions += 1;
                    let key = if report.functions.contains_key(&failed.name) {
                        format!("{}@{}", failed.name, failed.node)
                    } else {
                        failed.name.clone()
                    };
                    report.functions.insert(key, failed);
                }
            }
        }

        // Barrier: every local graph exists from here on
        let resolve_start = Instant::now();
        let mut graphs = Vec::with_capacity(units.len());
        let mut parts = Vec::with_capacity(units.len());
        for unit in units {
            let LocalUnit {
                report: function_report,
                cfg,
                ssa,
                graph,
                requirements,
            } = unit;
            report.stats.blocks += cfg.len();
            let ssa_stats = ssa.stats();
            report.stats.defs += ssa_stats.defs;
            report.stats.phis += ssa_stats.phis;
            report.stats.promotions += ssa_stats.promotions;
            graphs.push(graph);
            parts.push((function_report, cfg, ssa, requirements));
        }

        let program = link(graphs);
        let call_graph = CallGraph::from_program(&program);
        let resolution = Resolver::new(self.ctx, &self.rules).resolve(&program.graph);
        report.stats.type_nodes = program.graph.len();
        report.stats.resolver = resolution.stats;

        let mut reports: IndexMap<String, FunctionReport> = IndexMap::new();
        for (function_report, _, _, _) in &parts {
            reports.insert(function_report.name.clone(), function_report.clone());
        }
        for (function, error) in &program.errors {
            if let Some(r) = reports.get_mut(function) {
                r.push_error(error.clone());
            }
        }
        attribute_resolution(&resolution, &program.graph, &call_graph, &mut reports);

        for (function_report, cfg, ssa, requirements) in parts {
            let name = function_report.name.clone();
            let Some(linked) = program.function(&name) else {
                continue;
            };
            let mut types = IndexMap::with_capacity(ssa.def_count());
            for def in ssa.defs() {
                let ty = match (&def.kind, linked.def_nodes.get(&def.id)) {
                    (DefKind::Undefined, _) => DefType::Unbound,
                    (_, Some(node)) => def_type(&resolution, *node),
                    (_, None) => DefType::Unresolved("no type node".to_string()),
                };
                types.insert(def.id, ty);
            }
            let return_type = def_type(&resolution, linked.return_node);

            if let Some(ret) = return_type.resolved() {
                let params: Option<Vec<_>> = linked
                    .param_nodes
                    .iter()
                    .map(|p| resolution.type_of(*p).cloned())
                    .collect();
                if let Some(params) = params {
                    let signature = Signature::local(name.as_str(), params);
                    let previous = self.ctx.signatures().record(&signature, ret.clone());
                    if let Some(previous) = previous.filter(|p| p != ret) {
                        debug!("`{}`: signature changed from `{}` to `{}`", name, previous, ret);
                    }
                }
            }

            let Some(r) = reports.get_mut(&name) else {
                continue;
            };
            match TypedFunction::new(cfg, ssa, types, return_type, requirements) {
                Ok(ir) => r.ir = Some(ir),
                Err(error) => r.push_error(error),
            }
        }

        for (name, r) in reports {
            report.functions.insert(name, r);
        }
        report.call_graph = call_graph;
        report.stats.resolve_time_us = resolve_start.elapsed().as_micros() as u64;
        report.stats.total_time_us = start.elapsed().as_micros() as u64;

        info!(
            "compiled {} function(s): {} error(s), {} warning(s), {} type node(s)",
            report.stats.functions,
            report.error_count(),
            report.warning_count(),
            report.stats.type_nodes
        );
        report
    }

    fn build_local(&self, arena: &NodeArena, function: NodeId) -> LocalOutcome {
        let name = match ast::function(arena, function) {
            Ok(view) => view.name.to_string(),
            Err(error) => {
                return LocalOutcome::Failed(FunctionReport::failed(function.to_string(), function, error))
            }
        };
        let _span = tracing::debug_span!("compile_function", function = name.as_str()).entered();

        match self.run_local(arena, function, &name) {
            Ok(unit) => LocalOutcome::Built(Box::new(unit)),
            Err((error, lints)) => {
                warn!("`{}` failed: {}", name, error);
                let mut failed = FunctionReport::failed(name, function, error);
                failed.lints = lints;
                LocalOutcome::Failed(failed)
            }
        }
    }

    fn run_local(
        &self,
        arena: &NodeArena,
        function: NodeId,
        name: &str,
    ) -> Result<LocalUnit, (CoreError, Vec<String>)> {
        let lints = run_validators(&self.validators, arena, function).map_err(|e| (e, Vec::new()))?;
        let with_lints = |e: CoreError| (e, lints.clone());

        let mut cfg = CfgBuilder::build(arena, function).map_err(with_lints)?;
        let mut ssa = build_ssa(arena, &mut cfg, function).map_err(with_lints)?;

        let mut report = FunctionReport {
            name: name.to_string(),
            node: function,
            ir: None,
            errors: Vec::new(),
            warnings: Vec::new(),
            lints: lints.clone(),
        };

        let promotions = insert_promotions(&mut ssa, self.ctx.lattice());
        promotions.errors.into_iter().for_each(|e| report.push_error(e));
        promotions.warnings.into_iter().for_each(|w| report.push_warning(w));

        let unbound = unbound::analyze(&cfg, &mut ssa, self.ctx.config().unbound_policy);
        unbound.errors.into_iter().for_each(|e| report.push_error(e));
        unbound.warnings.into_iter().for_each(|w| report.push_warning(w));

        let graph = FunctionTypeGraph::build(arena, &cfg, &ssa).map_err(with_lints)?;
        debug!(
            "{}: {} block(s), {} def(s), {} promotion(s), {} sentinel(s)",
            name,
            cfg.len(),
            ssa.def_count(),
            promotions.inserted.len(),
            unbound.requirements.len()
        );

        Ok(LocalUnit {
            report,
            cfg,
            ssa,
            graph,
            requirements: unbound.requirements,
        })
    }
}

fn def_type(resolution: &Resolution, node: TypeNodeId) -> DefType {
    if let Some(ty) = resolution.type_of(node) {
        return DefType::Resolved(ty.clone());
    }
    if let Some(error) = resolution.error_for(node) {
        return DefType::Unresolved(error.to_string());
    }
    if let Some(failure) = resolution.failure_for(node) {
        return DefType::Unresolved(failure.error.to_string());
    }
    DefType::Unresolved("depends on a value with no type".to_string())
}

/// Route resolver errors to the functions owning the failing nodes
fn attribute_resolution(
    resolution: &Resolution,
    graph: &crate::typegraph::TypeGraph,
    call_graph: &CallGraph,
    reports: &mut IndexMap<String, FunctionReport>,
) {
    let owner = |node: TypeNodeId| graph.node(node).and_then(|n| n.function.clone());

    for (node, error) in &resolution.errors {
        let Some(f) = owner(*node) else { continue };
        if let Some(r) = reports.get_mut(&f) {
            r.push_error(error.clone());
        }
    }
    for (node, warning) in &resolution.warnings {
        let Some(f) = owner(*node) else { continue };
        if let Some(r) = reports.get_mut(&f) {
            r.push_warning(warning.clone());
        }
    }

    for failure in &resolution.failures {
        let mut functions: Vec<String> = Vec::new();
        for member in &failure.members {
            let Some(f) = owner(*member) else {
                continue;
            };
            for g in call_graph.component_members(&f).iter().cloned().chain(std::iter::once(f)) {
                if !functions.contains(&g) {
                    functions.push(g);
                }
            }
        }
        for f in functions {
            let Some(r) = reports.get_mut(&f) else {
                continue;
            };
            if failure.fallback.is_some() {
                r.push_warning(failure.error.clone());
            } else {
                r.push_error(failure.error.clone());
            }
        }
    }
}

/// Compile with the default rules and validators
pub fn compile(ctx: &CompilationContext, arena: &NodeArena, functions: &[NodeId]) -> ProgramReport {
    Pipeline::new(ctx).compile(arena, functions)
}

/// Every `Function` node in the arena, in id order
pub fn functions_in(arena: &NodeArena) -> Vec<NodeId> {
    arena
        .iter()
        .filter(|n| arena.kind_name(n.id) == Some(ast::FUNCTION))
        .map(|n| n.id)
        .collect()
}

/// Compile and fail on the first function with errors
pub fn compile_strict(
    ctx: &CompilationContext,
    arena: &NodeArena,
    functions: &[NodeId],
) -> CoreResult<ProgramReport> {
    let report = compile(ctx, arena, functions);
    if let Some(error) = report.functions.values().flat_map(|f| f.errors.iter()).next() {
        return Err(error.clone());
    }
    Ok(report)
}
