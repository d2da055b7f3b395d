//! Fixpoint type resolution over the condensed dependency graph
//!
//! Components are visited dependencies first. A component without a cycle is
//! evaluated exactly once. A cyclic component runs explicit rounds over its
//! members, each round reading the values the previous member evaluations
//! produced, until a round changes nothing or the round bound is hit.
//!
//! Components on the same level of the condensation never depend on one
//! another, so with `parallel` enabled each level is resolved on the rayon
//! pool.

use super::rules::FunctionRules;
use super::scc::{Component, Condensation};
use super::{TypeGraph, TypeNodeKind};
use crate::context::{CompilationContext, Signature};
use crate::error::CoreError;
use crate::ids::{SccId, TypeNodeId};
use crate::types::{JoinOutcome, Type};
use fxhash::FxHashMap;
use log::{debug, trace, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverStats {
    /// Node evaluations across all components and rounds
    pub evaluations: usize,
    /// Rounds spent in cyclic components
    pub rounds: usize,
    pub sccs: usize,
    pub cyclic_sccs: usize,
}

/// A cyclic component that did not settle within the round bound
#[derive(Debug, Clone, PartialEq)]
pub struct SccFailure {
    pub scc: SccId,
    pub members: Vec<TypeNodeId>,
    pub error: CoreError,
    /// Type substituted for every member, if a recursion fallback is configured
    pub fallback: Option<Type>,
}

#[derive(Debug, Clone, Default)]
pub struct Resolution {
    types: Vec<Option<Type>>,
    pub condensation: Condensation,
    pub failures: Vec<SccFailure>,
    /// Evaluation failures with no fallback
    pub errors: Vec<(TypeNodeId, CoreError)>,
    /// Evaluation failures recovered by the unification fallback
    pub warnings: Vec<(TypeNodeId, CoreError)>,
    pub stats: ResolverStats,
}

impl Resolution {
    pub fn type_of(&self, node: TypeNodeId) -> Option<&Type> {
        self.types.get(node.index()).and_then(Option::as_ref)
    }

    pub fn is_resolved(&self, node: TypeNodeId) -> bool {
        self.type_of(node).is_some()
    }

    pub fn types(&self) -> &[Option<Type>] {
        &self.types
    }

    /// The failed component containing `node`
    pub fn failure_for(&self, node: TypeNodeId) -> Option<&SccFailure> {
        self.failures.iter().find(|f| f.members.contains(&node))
    }

    pub fn error_for(&self, node: TypeNodeId) -> Option<&CoreError> {
        self.errors.iter().find(|(n, _)| *n == node).map(|(_, e)| e)
    }

    pub fn unresolved_count(&self) -> usize {
        self.types.iter().filter(|t| t.is_none()).count()
    }
}

#[derive(Debug, Default)]
struct Evaluated {
    ty: Option<Type>,
    error: Option<CoreError>,
    warning: Option<CoreError>,
}

impl Evaluated {
    fn known(ty: Type) -> Self {
        Self {
            ty: Some(ty),
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
struct ComponentResult {
    assigned: Vec<(TypeNodeId, Option<Type>)>,
    errors: Vec<(TypeNodeId, CoreError)>,
    warnings: Vec<(TypeNodeId, CoreError)>,
    failure: Option<SccFailure>,
    evaluations: usize,
    rounds: usize,
}

pub struct Resolver<'c> {
    ctx: &'c CompilationContext,
    rules: &'c FunctionRules,
    max_rounds: usize,
    recursion_fallback: Option<Type>,
    parallel: bool,
}

impl<'c> Resolver<'c> {
    pub fn new(ctx: &'c CompilationContext, rules: &'c FunctionRules) -> Self {
        let config = ctx.config();
        Self {
            ctx,
            rules,
            max_rounds: config.max_fixpoint_rounds.max(1),
            recursion_fallback: config.recursion_fallback.clone(),
            parallel: config.parallel,
        }
    }

    pub fn with_max_rounds(mut self, rounds: usize) -> Self {
        self.max_rounds = rounds.max(1);
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_recursion_fallback(mut self, fallback: Option<Type>) -> Self {
        self.recursion_fallback = fallback;
        self
    }

    pub fn resolve(&self, graph: &TypeGraph) -> Resolution {
        let _span = tracing::debug_span!("resolve_types", nodes = graph.len()).entered();
        let condensation = graph.condense();
        let mut types: Vec<Option<Type>> = vec![None; graph.len()];
        let mut resolution = Resolution {
            stats: ResolverStats {
                sccs: condensation.len(),
                cyclic_sccs: condensation.cyclic_count(),
                ..ResolverStats::default()
            },
            ..Resolution::default()
        };

        for wave in condensation.waves() {
            let components: Vec<&Component> =
                wave.iter().filter_map(|id| condensation.component(*id)).collect();
            let results: Vec<ComponentResult> = if self.parallel && components.len() > 1 {
                components
                    .par_iter()
                    .map(|c| self.resolve_component(graph, c, &types))
                    .collect()
            } else {
                components
                    .iter()
                    .map(|c| self.resolve_component(graph, c, &types))
                    .collect()
            };

            for result in results {
                for (node, ty) in result.assigned {
                    types[node.index()] = ty;
                }
                resolution.errors.extend(result.errors);
                resolution.warnings.extend(result.warnings);
                resolution.failures.extend(result.failure);
                resolution.stats.evaluations += result.evaluations;
                resolution.stats.rounds += result.rounds;
            }
        }

        debug!(
            "resolved {} type node(s) in {} component(s) ({} cyclic): {} evaluation(s), {} round(s), {} failure(s)",
            graph.len(),
            resolution.stats.sccs,
            resolution.stats.cyclic_sccs,
            resolution.stats.evaluations,
            resolution.stats.rounds,
            resolution.failures.len()
        );

        resolution.types = types;
        resolution.condensation = condensation;
        resolution
    }

    fn resolve_component(
        &self,
        graph: &TypeGraph,
        component: &Component,
        types: &[Option<Type>],
    ) -> ComponentResult {
        let mut result = ComponentResult::default();

        if !component.cyclic {
            for &member in &component.members {
                let Some(kind) = graph.kind(member) else {
                    continue;
                };
                let evaluated = self.evaluate(kind, |n| types.get(n.index()).cloned().flatten());
                result.evaluations += 1;
                self.record(&mut result, member, evaluated);
            }
            return result;
        }

        let _span = tracing::trace_span!(
            "resolve_scc",
            scc = component.id.as_raw(),
            members = component.members.len()
        )
        .entered();

        let mut current: FxHashMap<TypeNodeId, Option<Type>> =
            component.members.iter().map(|m| (*m, None)).collect();
        let mut last: FxHashMap<TypeNodeId, Evaluated> = FxHashMap::default();
        let mut converged = false;

        for round in 1..=self.max_rounds {
            result.rounds = round;
            let mut changed = false;
            for &member in &component.members {
                let Some(kind) = graph.kind(member) else {
                    continue;
                };
                let evaluated = self.evaluate(kind, |n| match current.get(&n) {
                    Some(ty) => ty.clone(),
                    None => types.get(n.index()).cloned().flatten(),
                });
                result.evaluations += 1;
                if current.get(&member) != Some(&evaluated.ty) {
                    changed = true;
                    current.insert(member, evaluated.ty.clone());
                }
                last.insert(member, evaluated);
            }
            trace!("scc {} round {}: changed = {}", component.id, round, changed);
            if !changed {
                converged = true;
                break;
            }
        }

        if converged {
            for &member in &component.members {
                let evaluated = last.remove(&member).unwrap_or_default();
                self.record(&mut result, member, evaluated);
            }
            return result;
        }

        let error = CoreError::UnresolvedRecursiveType {
            members: component.members.clone(),
            rounds: self.max_rounds,
        };
        match &self.recursion_fallback {
            Some(fallback) => warn!(
                "recursive component {} did not converge after {} round(s), using `{}`",
                component.id, self.max_rounds, fallback
            ),
            None => warn!(
                "recursive component {} did not converge after {} round(s)",
                component.id, self.max_rounds
            ),
        }
        for &member in &component.members {
            result.assigned.push((member, self.recursion_fallback.clone()));
        }
        result.failure = Some(SccFailure {
            scc: component.id,
            members: component.members.clone(),
            error,
            fallback: self.recursion_fallback.clone(),
        });
        result
    }

    fn record(&self, result: &mut ComponentResult, node: TypeNodeId, evaluated: Evaluated) {
        if let Some(error) = evaluated.error {
            result.errors.push((node, error));
        }
        if let Some(warning) = evaluated.warning {
            result.warnings.push((node, warning));
        }
        result.assigned.push((node, evaluated.ty));
    }

    /// Type of one node given the current types of its inputs
    fn evaluate<F>(&self, kind: &TypeNodeKind, lookup: F) -> Evaluated
    where
        F: Fn(TypeNodeId) -> Option<Type>,
    {
        match kind {
            TypeNodeKind::Constant(ty) => Evaluated::known(ty.clone()),
            TypeNodeKind::Copy(source) => Evaluated {
                ty: lookup(*source),
                ..Evaluated::default()
            },
            TypeNodeKind::Undefined => Evaluated::default(),
            TypeNodeKind::Join(inputs) => {
                let known: Vec<Type> = inputs.iter().filter_map(|n| lookup(*n)).collect();
                match self.ctx.lattice().join_all(known.iter()) {
                    Ok(None) => Evaluated::default(),
                    Ok(Some(JoinOutcome::Joined(ty))) => Evaluated::known(ty),
                    Ok(Some(JoinOutcome::Fallback { ty, error })) => Evaluated {
                        ty: Some(ty),
                        warning: Some(error),
                        ..Evaluated::default()
                    },
                    Err(error) => Evaluated {
                        error: Some(error),
                        ..Evaluated::default()
                    },
                }
            }
            TypeNodeKind::Apply { rule, args } => {
                let mut arg_types = Vec::with_capacity(args.len());
                for arg in args {
                    match lookup(*arg) {
                        Some(ty) => arg_types.push(ty),
                        None => return Evaluated::default(),
                    }
                }
                match self.apply(rule, arg_types) {
                    Ok(ty) => Evaluated::known(ty),
                    Err(error) => match self.ctx.lattice().fallback() {
                        Some(fallback) if error.is_recoverable() => Evaluated {
                            ty: Some(fallback.clone()),
                            warning: Some(error),
                            ..Evaluated::default()
                        },
                        _ => Evaluated {
                            error: Some(error),
                            ..Evaluated::default()
                        },
                    },
                }
            }
        }
    }

    fn apply(&self, name: &str, args: Vec<Type>) -> Result<Type, CoreError> {
        let lattice = self.ctx.lattice();
        let rule = self.rules.get(name).ok_or_else(|| CoreError::UnknownFunction {
            name: name.to_string(),
        })?;
        if !rule.cacheable() {
            return rule.apply(&args, lattice);
        }
        let signature = Signature::rule(self.rules.id(), name, args);
        self.ctx
            .signatures()
            .get_or_try_insert_with(&signature, || rule.apply(&signature.args, lattice))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompilerConfig;
    use crate::typegraph::NodeOrigin;
    use smallvec::smallvec;

    fn constant(graph: &mut TypeGraph, ty: Type) -> TypeNodeId {
        graph.add(TypeNodeKind::Constant(ty), NodeOrigin::Synthetic)
    }

    /// x0 = int64; x1 = join(x0, x2); x2 = apply(rule, x1)
    fn recursive_graph(rule: &str) -> (TypeGraph, TypeNodeId, TypeNodeId) {
        let mut graph = TypeGraph::new();
        let x0 = constant(&mut graph, Type::INT64);
        let x1 = graph.reserve(NodeOrigin::Synthetic);
        let x2 = graph.add(
            TypeNodeKind::Apply {
                rule: rule.to_string(),
                args: vec![x1],
            },
            NodeOrigin::Synthetic,
        );
        graph.set(x1, TypeNodeKind::Join(smallvec![x0, x2]));
        (graph, x1, x2)
    }

    fn oscillating_rules() -> FunctionRules {
        FunctionRules::empty().with_closure("osc", |args, _| match &args[0] {
            ty if *ty == Type::FLOAT64 => Ok(Type::INT32),
            ty if *ty == Type::INT64 => Ok(Type::FLOAT64),
            other => Err(CoreError::UnificationError {
                left: other.clone(),
                right: Type::INT64,
            }),
        })
    }

    #[test]
    fn test_acyclic_copy() {
        let ctx = CompilationContext::default();
        let rules = FunctionRules::builtin();
        let mut graph = TypeGraph::new();
        let x0 = constant(&mut graph, Type::INT64);
        let y0 = graph.add(TypeNodeKind::Copy(x0), NodeOrigin::Synthetic);

        let resolution = Resolver::new(&ctx, &rules).resolve(&graph);
        assert_eq!(resolution.type_of(y0), Some(&Type::INT64));
        assert_eq!(resolution.stats.evaluations, graph.len());
        assert_eq!(resolution.stats.rounds, 0);
        assert_eq!(resolution.stats.cyclic_sccs, 0);
    }

    #[test]
    fn test_cycle_converges() {
        let ctx = CompilationContext::default();
        let mut rules = FunctionRules::builtin();
        rules.register(crate::typegraph::rules::FixedSignature::new("f", Some(1), Type::INT64));
        let (graph, x1, x2) = recursive_graph("f");

        let resolution = Resolver::new(&ctx, &rules).resolve(&graph);
        assert_eq!(resolution.type_of(x1), Some(&Type::INT64));
        assert_eq!(resolution.type_of(x2), Some(&Type::INT64));
        assert!(resolution.failures.is_empty());
        assert_eq!(resolution.stats.cyclic_sccs, 1);
        assert_eq!(resolution.stats.rounds, 2);
    }

    #[test]
    fn test_oscillating_rule_reports_unresolved() {
        let ctx = CompilationContext::default();
        let rules = oscillating_rules();
        let (graph, x1, x2) = recursive_graph("osc");

        let resolution = Resolver::new(&ctx, &rules).with_max_rounds(16).resolve(&graph);
        assert_eq!(resolution.failures.len(), 1);
        let failure = &resolution.failures[0];
        assert_eq!(failure.members, vec![x1, x2]);
        assert!(matches!(
            failure.error,
            CoreError::UnresolvedRecursiveType { rounds: 16, .. }
        ));
        assert!(failure.fallback.is_none());
        assert!(!resolution.is_resolved(x1));
        assert_eq!(resolution.stats.rounds, 16);
    }

    #[test]
    fn test_recursion_fallback() {
        let config = CompilerConfig::default().with_recursion_fallback(Type::Dynamic);
        let ctx = CompilationContext::new(config).unwrap();
        let rules = oscillating_rules();
        let (graph, x1, _) = recursive_graph("osc");

        let resolution = Resolver::new(&ctx, &rules).resolve(&graph);
        assert_eq!(resolution.type_of(x1), Some(&Type::Dynamic));
        assert_eq!(resolution.failure_for(x1).and_then(|f| f.fallback.clone()), Some(Type::Dynamic));
    }

    #[test]
    fn test_join_failure_and_fallback() {
        let rules = FunctionRules::builtin();
        let mut graph = TypeGraph::new();
        let a = constant(&mut graph, Type::INT32);
        let b = constant(&mut graph, Type::opaque("Handle"));
        let j = graph.add(TypeNodeKind::Join(smallvec![a, b]), NodeOrigin::Synthetic);

        let strict = CompilationContext::default();
        let resolution = Resolver::new(&strict, &rules).resolve(&graph);
        assert!(!resolution.is_resolved(j));
        assert!(matches!(
            resolution.error_for(j),
            Some(CoreError::UnificationError { .. })
        ));

        let lenient =
            CompilationContext::new(CompilerConfig::default().with_unification_fallback(Type::Dynamic))
                .unwrap();
        let resolution = Resolver::new(&lenient, &rules).resolve(&graph);
        assert_eq!(resolution.type_of(j), Some(&Type::Dynamic));
        assert_eq!(resolution.warnings.len(), 1);
        assert!(resolution.errors.is_empty());
    }

    #[test]
    fn test_unknown_rule_leaves_node_unresolved() {
        let ctx = CompilationContext::default();
        let rules = FunctionRules::builtin();
        let mut graph = TypeGraph::new();
        let a = constant(&mut graph, Type::INT64);
        let call = graph.add(
            TypeNodeKind::Apply {
                rule: "missing".to_string(),
                args: vec![a],
            },
            NodeOrigin::Synthetic,
        );
        let copy = graph.add(TypeNodeKind::Copy(call), NodeOrigin::Synthetic);

        let resolution = Resolver::new(&ctx, &rules).resolve(&graph);
        assert!(!resolution.is_resolved(copy));
        assert!(matches!(
            resolution.error_for(call),
            Some(CoreError::UnknownFunction { .. })
        ));
        assert_eq!(resolution.unresolved_count(), 2);
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let ctx = CompilationContext::default();
        let rules = FunctionRules::builtin();
        let mut graph = TypeGraph::new();
        let mut previous = constant(&mut graph, Type::INT32);
        for i in 0..200 {
            let leaf = constant(&mut graph, if i % 2 == 0 { Type::INT64 } else { Type::FLOAT32 });
            previous = graph.add(
                TypeNodeKind::Apply {
                    rule: "+".to_string(),
                    args: vec![previous, leaf],
                },
                NodeOrigin::Synthetic,
            );
        }

        let sequential = Resolver::new(&ctx, &rules).with_parallel(false).resolve(&graph);
        let parallel = Resolver::new(&ctx, &rules).with_parallel(true).resolve(&graph);
        assert_eq!(sequential.types(), parallel.types());
        assert_eq!(sequential.type_of(previous), Some(&Type::FLOAT64));
    }
}
