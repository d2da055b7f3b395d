use midend::typegraph::FunctionRules;
use midend::{
    compile_strict, functions_in, AstBuilder, CompilationContext, CompilerConfig, CoreError, DefType,
    NodeArena, Pipeline, Type,
};
use pretty_assertions::assert_eq;

fn program(ctx: &CompilationContext, make: impl FnOnce(&mut AstBuilder)) -> NodeArena {
    midend::logging::init_test();
    let mut arena = NodeArena::with_builtin_kinds();
    {
        let mut b = AstBuilder::new(&mut arena, ctx);
        make(&mut b);
    }
    arena
}

/// `osc` flips between `float64` and `int32`; joined with an `int64` seed it never settles
fn oscillating() -> FunctionRules {
    FunctionRules::builtin().with_closure("osc", |args, _| {
        if args[0] == Type::INT64 {
            Ok(Type::FLOAT64)
        } else {
            Ok(Type::INT32)
        }
    })
}

/// def f(a): return g(osc(a))
/// def g(b): return f(b)
/// def main(): f(1)
fn mutual(b: &mut AstBuilder) {
    let a = b.param("a", None).unwrap();
    let ar = b.name("a").unwrap();
    let flipped = b.call("osc", &[ar]).unwrap();
    let call = b.call("g", &[flipped]).unwrap();
    let ret = b.ret(Some(call)).unwrap();
    b.function("f", &[a], &[ret]).unwrap();

    let p = b.param("b", None).unwrap();
    let pr = b.name("b").unwrap();
    let call = b.call("f", &[pr]).unwrap();
    let ret = b.ret(Some(call)).unwrap();
    b.function("g", &[p], &[ret]).unwrap();

    let one = b.int(1).unwrap();
    let call = b.call("f", &[one]).unwrap();
    let stmt = b.expr_stmt(call).unwrap();
    b.function("main", &[], &[stmt]).unwrap();
}

#[test]
fn test_mutual_recursion_failure_reaches_every_member() {
    let ctx = CompilationContext::new(CompilerConfig::default().with_max_fixpoint_rounds(10)).unwrap();
    let arena = program(&ctx, mutual);
    let report = Pipeline::new(&ctx)
        .with_rules(oscillating())
        .compile(&arena, &functions_in(&arena));

    let mut members: Vec<&String> = report
        .call_graph
        .component_members("f")
        .iter()
        .collect();
    members.sort();
    assert_eq!(members, vec!["f", "g"]);

    for name in ["f", "g"] {
        let function = report.function(name).unwrap();
        assert!(
            function
                .errors
                .iter()
                .any(|e| matches!(e, CoreError::UnresolvedRecursiveType { rounds: 10, .. })),
            "{}: {:?}",
            name,
            function.errors
        );
        let ir = function.ir.as_ref().unwrap();
        let param = ir.ssa.params[0];
        assert!(matches!(ir.type_of(param), Some(DefType::Unresolved(_))));
    }
    assert!(!report.function("main").unwrap().has_errors());
}

#[test]
fn test_recursion_fallback_turns_failure_into_warnings() {
    let config = CompilerConfig::default()
        .with_max_fixpoint_rounds(10)
        .with_recursion_fallback(Type::Dynamic);
    let ctx = CompilationContext::new(config).unwrap();
    let arena = program(&ctx, mutual);
    let report = Pipeline::new(&ctx)
        .with_rules(oscillating())
        .compile(&arena, &functions_in(&arena));

    assert!(!report.has_errors(), "{:?}", report.diagnostics());
    for name in ["f", "g"] {
        let function = report.function(name).unwrap();
        assert!(function
            .warnings
            .iter()
            .any(|e| matches!(e, CoreError::UnresolvedRecursiveType { .. })));
        let ir = function.ir.as_ref().unwrap();
        assert_eq!(ir.type_of(ir.ssa.params[0]), Some(&DefType::Resolved(Type::Dynamic)));
    }
    let codes: Vec<String> = report
        .diagnostics()
        .warnings()
        .filter_map(|d| d.code.clone())
        .collect();
    assert!(codes.iter().any(|c| c == "W0400"), "{:?}", codes);
}

#[test]
fn test_parallel_and_sequential_agree() {
    let build = |parallel: bool| {
        let ctx = CompilationContext::new(CompilerConfig::default().with_parallel(parallel)).unwrap();
        let arena = program(&ctx, mutual);
        let report = Pipeline::new(&ctx)
            .with_rules(FunctionRules::builtin().with_closure("osc", |_, _| Ok(Type::INT64)))
            .compile(&arena, &functions_in(&arena));
        report
            .typed_functions()
            .map(|f| {
                let params: Vec<Option<DefType>> =
                    f.ssa.params.iter().map(|p| f.type_of(*p).cloned()).collect();
                (f.name.clone(), f.return_type.clone(), params)
            })
            .collect::<Vec<_>>()
    };
    assert_eq!(build(true), build(false));
}

#[test]
fn test_call_arity_mismatch_is_reported_on_the_caller() {
    let ctx = CompilationContext::default();
    let arena = program(&ctx, |b| {
        let x = b.param("x", Some(Type::INT64)).unwrap();
        let xr = b.name("x").unwrap();
        let ret = b.ret(Some(xr)).unwrap();
        b.function("id", &[x], &[ret]).unwrap();

        let one = b.int(1).unwrap();
        let two = b.int(2).unwrap();
        let call = b.call("id", &[one, two]).unwrap();
        let stmt = b.expr_stmt(call).unwrap();
        b.function("main", &[], &[stmt]).unwrap();
    });
    let report = Pipeline::new(&ctx).compile(&arena, &functions_in(&arena));

    assert!(!report.function("id").unwrap().has_errors());
    let main = report.function("main").unwrap();
    assert!(matches!(
        &main.errors[..],
        [CoreError::SchemaViolation { reason, .. }] if reason.contains("expects 1 argument")
    ));
}

#[test]
fn test_illegal_construct_fails_only_its_function() {
    let ctx = CompilationContext::default();
    let arena = program(&ctx, |b| {
        let stray = b.brk().unwrap();
        b.function("broken", &[], &[stray]).unwrap();

        let one = b.int(1).unwrap();
        let ret = b.ret(Some(one)).unwrap();
        b.function("fine", &[], &[ret]).unwrap();
    });
    let report = Pipeline::new(&ctx).compile(&arena, &functions_in(&arena));

    let broken = report.function("broken").unwrap();
    assert!(broken.ir.is_none());
    assert!(matches!(broken.errors[..], [CoreError::IllegalConstruct { .. }]));
    assert_eq!(
        report.ir("fine").unwrap().return_type,
        DefType::Resolved(Type::INT64)
    );
    assert_eq!(report.stats.failed_functions, 1);

    let err = compile_strict(&ctx, &arena, &functions_in(&arena)).unwrap_err();
    assert!(matches!(err, CoreError::IllegalConstruct { .. }));
}

#[test]
fn test_duplicate_function_names() {
    let ctx = CompilationContext::default();
    let arena = program(&ctx, |b| {
        let first = b.ret(None).unwrap();
        b.function("f", &[], &[first]).unwrap();
        let second = b.ret(None).unwrap();
        b.function("f", &[], &[second]).unwrap();
    });
    let report = Pipeline::new(&ctx).compile(&arena, &functions_in(&arena));

    assert_eq!(report.functions.len(), 2);
    assert!(report.ir("f").is_some());
    let duplicate = report
        .functions
        .values()
        .find(|f| f.ir.is_none())
        .unwrap();
    assert!(matches!(duplicate.errors[..], [CoreError::SchemaViolation { .. }]));
}

#[test]
fn test_declared_signature_types_parameters() {
    let ctx = CompilationContext::default();
    let arena = program(&ctx, |b| {
        let x = b.param("x", None).unwrap();
        let xr = b.name("x").unwrap();
        let two = b.int(2).unwrap();
        let doubled = b.binop("*", xr, two).unwrap();
        let ret = b.ret(Some(doubled)).unwrap();
        let f = b.function("double", &[x], &[ret]).unwrap();
        b.declare_signature(f, &[Type::FLOAT64]).unwrap();
    });
    let report = Pipeline::new(&ctx).compile(&arena, &functions_in(&arena));

    let function = report.function("double").unwrap();
    assert!(function.lints.is_empty());
    assert_eq!(
        function.ir.as_ref().unwrap().return_type,
        DefType::Resolved(Type::FLOAT64)
    );
}

#[test]
fn test_local_function_does_not_leak_into_builtin_of_same_name() {
    let ctx = CompilationContext::default();
    // def abs(x: int32): return float(x)
    let first = program(&ctx, |b| {
        let x = b.param("x", Some(Type::INT32)).unwrap();
        let xr = b.name("x").unwrap();
        let widened = b.call("float", &[xr]).unwrap();
        let ret = b.ret(Some(widened)).unwrap();
        b.function("abs", &[x], &[ret]).unwrap();
    });
    let report = Pipeline::new(&ctx).compile(&first, &functions_in(&first));
    assert_eq!(
        report.ir("abs").unwrap().return_type,
        DefType::Resolved(Type::FLOAT64)
    );

    // def g(y: int32): return abs(y), with the builtin `abs`
    let second = program(&ctx, |b| {
        let y = b.param("y", Some(Type::INT32)).unwrap();
        let yr = b.name("y").unwrap();
        let call = b.call("abs", &[yr]).unwrap();
        let ret = b.ret(Some(call)).unwrap();
        b.function("g", &[y], &[ret]).unwrap();
    });
    let report = Pipeline::new(&ctx).compile(&second, &functions_in(&second));
    assert!(!report.has_errors(), "{:?}", report.diagnostics());
    assert_eq!(
        report.ir("g").unwrap().return_type,
        DefType::Resolved(Type::INT32)
    );
}

#[test]
fn test_rule_sets_on_one_context_stay_apart() {
    let ctx = CompilationContext::default();
    let arena = program(&ctx, |b| {
        let one = b.int(1).unwrap();
        let call = b.call("widen", &[one]).unwrap();
        let ret = b.ret(Some(call)).unwrap();
        b.function("main", &[], &[ret]).unwrap();
    });
    let return_type = |rules: FunctionRules| {
        let report = Pipeline::new(&ctx)
            .with_rules(rules)
            .compile(&arena, &functions_in(&arena));
        report.ir("main").unwrap().return_type.clone()
    };

    let to_float = FunctionRules::builtin().with_closure("widen", |_, _| Ok(Type::FLOAT64));
    let to_str = FunctionRules::builtin().with_closure("widen", |_, _| Ok(Type::Str));
    assert_eq!(return_type(to_float.clone()), DefType::Resolved(Type::FLOAT64));
    assert_eq!(return_type(to_str), DefType::Resolved(Type::Str));
    assert_eq!(return_type(to_float), DefType::Resolved(Type::FLOAT64));
}
