use midend::context::Signature;
use midend::ssa::DefKind;
use midend::typegraph::FunctionRules;
use midend::{AstBuilder, CompilationContext, CompilerConfig, CoreError, DefType, NodeArena, Pipeline, Type};
use pretty_assertions::assert_eq;

fn program(
    ctx: &CompilationContext,
    make: impl FnOnce(&mut AstBuilder),
) -> NodeArena {
    midend::logging::init_test();
    let mut arena = NodeArena::with_builtin_kinds();
    {
        let mut b = AstBuilder::new(&mut arena, ctx);
        make(&mut b);
    }
    arena
}

/// `x` is assigned `first` and, when `c` holds, `second`; returns `x`
fn merge(b: &mut AstBuilder, first: (Type, &str), second: (Type, &str)) {
    let c = b.param("c", Some(Type::Bool)).unwrap();
    let v1 = b.constant(first.0.clone(), first.1).unwrap();
    let init = b.assign_typed("x", v1, first.0).unwrap();
    let test = b.name("c").unwrap();
    let v2 = b.constant(second.0.clone(), second.1).unwrap();
    let then = b.assign_typed("x", v2, second.0).unwrap();
    let branch = b.if_(test, &[then], &[]).unwrap();
    let x = b.name("x").unwrap();
    let ret = b.ret(Some(x)).unwrap();
    b.function("f", &[c], &[init, branch, ret]).unwrap();
}

fn compile(ctx: &CompilationContext, arena: &NodeArena) -> midend::ProgramReport {
    Pipeline::new(ctx).compile(arena, &midend::functions_in(arena))
}

#[test]
fn test_straight_line_types() {
    let ctx = CompilationContext::default();
    let arena = program(&ctx, |b| {
        let one = b.int(1).unwrap();
        let half = b.float(0.5).unwrap();
        let x = b.assign("x", one).unwrap();
        let xr = b.name("x").unwrap();
        let sum = b.binop("+", xr, half).unwrap();
        let y = b.assign("y", sum).unwrap();
        let yr = b.name("y").unwrap();
        let cmp = b.binop("<", yr, one).unwrap();
        let ret = b.ret(Some(cmp)).unwrap();
        b.function("f", &[], &[x, y, ret]).unwrap();
    });

    let report = compile(&ctx, &arena);
    assert!(!report.has_errors(), "{:?}", report.diagnostics());
    let ir = report.ir("f").unwrap();
    let types: Vec<(String, DefType)> = ir
        .typed_defs()
        .map(|(d, t)| (d.variable.clone(), t.clone()))
        .collect();
    assert_eq!(
        types,
        vec![
            ("x".to_string(), DefType::Resolved(Type::INT64)),
            ("y".to_string(), DefType::Resolved(Type::FLOAT64)),
        ]
    );
    assert_eq!(ir.return_type, DefType::Resolved(Type::Bool));
    assert_eq!(report.stats.resolver.cyclic_sccs, 0);
}

#[test]
fn test_self_recursive_function_converges() {
    // def f(n): if n < 1: return n; return f(n - 1)
    let ctx = CompilationContext::default();
    let arena = program(&ctx, |b| {
        let n = b.param("n", None).unwrap();
        let nr = b.name("n").unwrap();
        let one = b.int(1).unwrap();
        let test = b.binop("<", nr, one).unwrap();
        let base = b.name("n").unwrap();
        let early = b.ret(Some(base)).unwrap();
        let branch = b.if_(test, &[early], &[]).unwrap();
        let arg = b.name("n").unwrap();
        let one = b.int(1).unwrap();
        let dec = b.binop("-", arg, one).unwrap();
        let call = b.call("f", &[dec]).unwrap();
        let ret = b.ret(Some(call)).unwrap();
        b.function("f", &[n], &[branch, ret]).unwrap();

        let ten = b.int(10).unwrap();
        let call = b.call("f", &[ten]).unwrap();
        let stmt = b.expr_stmt(call).unwrap();
        b.function("main", &[], &[stmt]).unwrap();
    });

    let report = compile(&ctx, &arena);
    assert!(!report.has_errors(), "{:?}", report.diagnostics());
    let f = report.ir("f").unwrap();
    assert_eq!(f.return_type, DefType::Resolved(Type::INT64));
    let param = f.ssa.params[0];
    assert_eq!(f.type_of(param), Some(&DefType::Resolved(Type::INT64)));
    assert!(report.call_graph.is_recursive("f"));
    assert!(!report.call_graph.is_recursive("main"));
    assert!(report.stats.resolver.cyclic_sccs >= 1);
    assert_eq!(
        ctx.signatures().get(&Signature::local("f", vec![Type::INT64])),
        Some(Type::INT64)
    );
}

#[test]
fn test_mixed_numeric_merge_promotes() {
    let ctx = CompilationContext::default();
    let arena = program(&ctx, |b| {
        merge(b, (Type::INT32, "1"), (Type::FLOAT64, "2.5"));
    });

    let report = compile(&ctx, &arena);
    assert!(!report.has_errors(), "{:?}", report.diagnostics());
    let ir = report.ir("f").unwrap();
    assert_eq!(ir.return_type, DefType::Resolved(Type::FLOAT64));

    let phi = ir.ssa.phis().next().unwrap();
    assert_eq!(ir.type_of(phi.id), Some(&DefType::Resolved(Type::FLOAT64)));
    let promotions: Vec<_> = ir
        .ssa
        .defs()
        .filter(|d| matches!(d.kind, DefKind::Promotion { .. }))
        .collect();
    assert_eq!(promotions.len(), 1);
    assert_eq!(ir.type_of(promotions[0].id), Some(&DefType::Resolved(Type::FLOAT64)));
    assert_eq!(report.stats.promotions, 1);
}

#[test]
fn test_incompatible_merge_is_a_unification_error() {
    let ctx = CompilationContext::default();
    let arena = program(&ctx, |b| {
        merge(b, (Type::INT32, "1"), (Type::opaque("Handle"), "h"));
    });

    let report = compile(&ctx, &arena);
    let f = report.function("f").unwrap();
    assert!(!f.errors.is_empty());
    assert!(f
        .errors
        .iter()
        .all(|e| matches!(e, CoreError::UnificationError { .. })));
    // the function still gets IR, with the merged value left untyped
    let ir = f.ir.as_ref().unwrap();
    let phi = ir.ssa.phis().next().unwrap();
    assert!(matches!(ir.type_of(phi.id), Some(DefType::Unresolved(_))));
}

#[test]
fn test_unification_fallback_downgrades_to_warning() {
    let config = CompilerConfig::default().with_unification_fallback(Type::Dynamic);
    let ctx = CompilationContext::new(config).unwrap();
    let arena = program(&ctx, |b| {
        merge(b, (Type::INT32, "1"), (Type::opaque("Handle"), "h"));
    });

    let report = compile(&ctx, &arena);
    let f = report.function("f").unwrap();
    assert!(f.errors.is_empty(), "{:?}", f.errors);
    assert!(!f.warnings.is_empty());
    assert_eq!(f.ir.as_ref().unwrap().return_type, DefType::Resolved(Type::Dynamic));
}

#[test]
fn test_loop_counter_types_from_start_and_step() {
    let ctx = CompilationContext::default();
    let arena = program(&ctx, |b| {
        let zero = b.float(0.0).unwrap();
        let init = b.assign("s", zero).unwrap();
        let start = b.int(0).unwrap();
        let stop = b.int(10).unwrap();
        let s = b.name("s").unwrap();
        let i = b.name("i").unwrap();
        let sum = b.binop("+", s, i).unwrap();
        let body = b.assign("s", sum).unwrap();
        let l = b.for_range("i", start, stop, None, &[body]).unwrap();
        let out = b.name("s").unwrap();
        let ret = b.ret(Some(out)).unwrap();
        b.function("f", &[], &[init, l, ret]).unwrap();
    });

    let report = compile(&ctx, &arena);
    assert!(!report.has_errors(), "{:?}", report.diagnostics());
    let ir = report.ir("f").unwrap();
    assert_eq!(ir.return_type, DefType::Resolved(Type::FLOAT64));
    for (def, ty) in ir.typed_defs() {
        let expected = if def.variable == "i" { Type::INT64 } else { Type::FLOAT64 };
        assert_eq!(ty, &DefType::Resolved(expected), "{}", def.id);
    }
}

#[test]
fn test_oscillating_recursion_reports_unresolved_type() {
    let config = CompilerConfig::default().with_max_fixpoint_rounds(8);
    let ctx = CompilationContext::new(config).unwrap();
    let rules = FunctionRules::builtin().with_closure("osc", |args, _| {
        if args[0] == Type::INT64 {
            Ok(Type::FLOAT64)
        } else {
            Ok(Type::INT32)
        }
    });
    // x = 1; while c: x = osc(x)
    let arena = program(&ctx, |b| {
        let c = b.param("c", Some(Type::Bool)).unwrap();
        let one = b.int(1).unwrap();
        let init = b.assign("x", one).unwrap();
        let test = b.name("c").unwrap();
        let xr = b.name("x").unwrap();
        let call = b.call("osc", &[xr]).unwrap();
        let step = b.assign("x", call).unwrap();
        let l = b.while_(test, &[step]).unwrap();
        let out = b.name("x").unwrap();
        let ret = b.ret(Some(out)).unwrap();
        b.function("f", &[c], &[init, l, ret]).unwrap();
    });

    let report = Pipeline::new(&ctx)
        .with_rules(rules)
        .compile(&arena, &midend::functions_in(&arena));
    let f = report.function("f").unwrap();
    assert!(matches!(
        f.errors[..],
        [CoreError::UnresolvedRecursiveType { rounds: 8, .. }]
    ));
    let ir = f.ir.as_ref().unwrap();
    assert!(matches!(ir.return_type, DefType::Unresolved(_)));
}
