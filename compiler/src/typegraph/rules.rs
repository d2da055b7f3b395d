//! Result-type rules for operators and builtin functions
//!
//! An `Apply` node names its rule by string. Operators (`+`, `<`, ...) and a
//! handful of builtin functions are registered by [`FunctionRules::builtin`];
//! embedders add their own with [`FunctionRules::register`] or
//! [`FunctionRules::closure`].

use crate::error::{CoreError, CoreResult};
use crate::types::{Type, TypeLattice};
use fxhash::FxHashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub trait TypeRule: Send + Sync {
    fn name(&self) -> &str;

    /// Result type for fully known argument types
    fn apply(&self, args: &[Type], lattice: &TypeLattice) -> CoreResult<Type>;

    /// Whether results may be memoized in the signature cache
    fn cacheable(&self) -> bool {
        true
    }
}

fn join_args(name: &str, args: &[Type], lattice: &TypeLattice) -> CoreResult<Type> {
    match lattice.join_all(args.iter())? {
        Some(outcome) => Ok(outcome.into_type()),
        None => Err(CoreError::schema(name, "operator applied to no operands")),
    }
}

/// `+ - * // % ** and or`: operands join; `bool` arithmetic yields `int64`
pub struct ArithmeticRule {
    op: String,
}

impl TypeRule for ArithmeticRule {
    fn name(&self) -> &str {
        &self.op
    }

    fn apply(&self, args: &[Type], lattice: &TypeLattice) -> CoreResult<Type> {
        let joined = join_args(&self.op, args, lattice)?;
        let logical = self.op == "and" || self.op == "or";
        match joined {
            Type::Bool if !logical => Ok(Type::INT64),
            Type::Str if self.op == "+" => Ok(Type::Str),
            ty if ty.is_numeric() || ty == Type::Dynamic || logical => Ok(ty),
            other => Err(CoreError::UnificationError {
                left: other,
                right: Type::INT64,
            }),
        }
    }
}

/// `/` always produces a float
pub struct TrueDivRule;

impl TypeRule for TrueDivRule {
    fn name(&self) -> &str {
        "/"
    }

    fn apply(&self, args: &[Type], lattice: &TypeLattice) -> CoreResult<Type> {
        match join_args("/", args, lattice)? {
            Type::Bool | Type::Int { .. } => Ok(Type::FLOAT64),
            ty @ (Type::Float { .. } | Type::Dynamic) => Ok(ty),
            other => Err(CoreError::UnificationError {
                left: other,
                right: Type::FLOAT64,
            }),
        }
    }
}

/// Comparisons and `not`
pub struct PredicateRule {
    op: String,
}

impl TypeRule for PredicateRule {
    fn name(&self) -> &str {
        &self.op
    }

    fn apply(&self, _args: &[Type], _lattice: &TypeLattice) -> CoreResult<Type> {
        Ok(Type::Bool)
    }
}

/// A function whose result type does not depend on its arguments
pub struct FixedSignature {
    name: String,
    arity: Option<usize>,
    result: Type,
}

impl FixedSignature {
    pub fn new(name: impl Into<String>, arity: Option<usize>, result: Type) -> Self {
        Self {
            name: name.into(),
            arity,
            result,
        }
    }
}

impl TypeRule for FixedSignature {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, args: &[Type], _lattice: &TypeLattice) -> CoreResult<Type> {
        if let Some(arity) = self.arity {
            if args.len() != arity {
                return Err(CoreError::schema(
                    &self.name,
                    format!("expected {} argument(s), got {}", arity, args.len()),
                ));
            }
        }
        Ok(self.result.clone())
    }
}

/// `abs(x)` keeps the type of its operand
pub struct SameAsFirst {
    name: String,
}

impl TypeRule for SameAsFirst {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, args: &[Type], _lattice: &TypeLattice) -> CoreResult<Type> {
        args.first()
            .cloned()
            .ok_or_else(|| CoreError::schema(&self.name, "expected an argument"))
    }
}

type RuleFn = dyn Fn(&[Type], &TypeLattice) -> CoreResult<Type> + Send + Sync;

/// Rule backed by a closure
pub struct ClosureRule {
    name: String,
    f: Box<RuleFn>,
    cacheable: bool,
}

impl TypeRule for ClosureRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, args: &[Type], lattice: &TypeLattice) -> CoreResult<Type> {
        (self.f)(args, lattice)
    }

    fn cacheable(&self) -> bool {
        self.cacheable
    }
}

static NEXT_RULE_SET: AtomicU64 = AtomicU64::new(1);

/// Rules by callee name
///
/// Every set carries an id that changes whenever a rule is registered, so
/// memoized applications of one set are never served to another.
#[derive(Clone)]
pub struct FunctionRules {
    id: u64,
    rules: FxHashMap<String, Arc<dyn TypeRule>>,
}

impl Default for FunctionRules {
    fn default() -> Self {
        Self {
            id: NEXT_RULE_SET.fetch_add(1, Ordering::Relaxed),
            rules: FxHashMap::default(),
        }
    }
}

impl fmt::Debug for FunctionRules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.rules.keys().collect();
        names.sort();
        f.debug_struct("FunctionRules")
            .field("id", &self.id)
            .field("rules", &names)
            .finish()
    }
}

impl FunctionRules {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut rules = Self::empty();
        for op in ["+", "-", "*", "//", "%", "**", "and", "or"] {
            rules.register(ArithmeticRule { op: op.to_string() });
        }
        rules.register(TrueDivRule);
        for op in ["<", "<=", ">", ">=", "==", "!=", "not", "is", "in"] {
            rules.register(PredicateRule { op: op.to_string() });
        }
        rules.register(FixedSignature::new("len", Some(1), Type::INT64));
        rules.register(FixedSignature::new("int", Some(1), Type::INT64));
        rules.register(FixedSignature::new("float", Some(1), Type::FLOAT64));
        rules.register(FixedSignature::new("bool", Some(1), Type::Bool));
        rules.register(FixedSignature::new("str", Some(1), Type::Str));
        rules.register(FixedSignature::new("print", None, Type::None));
        rules.register(SameAsFirst { name: "abs".to_string() });
        rules
    }

    pub fn register(&mut self, rule: impl TypeRule + 'static) {
        self.rules.insert(rule.name().to_string(), Arc::new(rule));
        self.id = NEXT_RULE_SET.fetch_add(1, Ordering::Relaxed);
    }

    /// Key of this set in the signature cache
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn closure<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&[Type], &TypeLattice) -> CoreResult<Type> + Send + Sync + 'static,
    {
        self.register(ClosureRule {
            name: name.to_string(),
            f: Box::new(f),
            cacheable: true,
        });
    }

    /// Closure rule whose results are never memoized
    pub fn uncached_closure<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&[Type], &TypeLattice) -> CoreResult<Type> + Send + Sync + 'static,
    {
        self.register(ClosureRule {
            name: name.to_string(),
            f: Box::new(f),
            cacheable: false,
        });
    }

    pub fn with_closure<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&[Type], &TypeLattice) -> CoreResult<Type> + Send + Sync + 'static,
    {
        self.closure(name, f);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn TypeRule>> {
        self.rules.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.rules.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn apply(&self, name: &str, args: &[Type], lattice: &TypeLattice) -> CoreResult<Type> {
        let rule = self.get(name).ok_or_else(|| CoreError::UnknownFunction {
            name: name.to_string(),
        })?;
        rule.apply(args, lattice)
    }
}
