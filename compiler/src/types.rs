//! Value types and the join lattice used for phis and promotions
//!
//! Types are closed over a small set of scalar kinds plus `dynamic` (the top of
//! the lattice) and named opaque types supplied by the embedder. The numeric
//! part of the lattice follows the usual widening rules:
//!
//! - `bool` widens into any integer or float
//! - integers of equal signedness widen to the larger width
//! - mixed signedness widens to a signed integer wide enough for both, or to
//!   `float64` when no such integer exists (`uint64` + `int64`)
//! - integers join floats to a float able to hold the integer's range
//!
//! Anything else must be listed in the configured join table.

use crate::config::{CompilerConfig, JoinRule};
use crate::error::{CoreError, CoreResult};
use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Type {
    /// Result of statements without a value
    None,
    Bool,
    Int { bits: u8, signed: bool },
    Float { bits: u8 },
    Str,
    /// Top of the lattice
    Dynamic,
    Opaque(String),
}

impl Type {
    pub const INT32: Type = Type::Int { bits: 32, signed: true };
    pub const INT64: Type = Type::Int { bits: 64, signed: true };
    pub const FLOAT32: Type = Type::Float { bits: 32 };
    pub const FLOAT64: Type = Type::Float { bits: 64 };

    pub fn int(bits: u8) -> Self {
        Type::Int { bits, signed: true }
    }

    pub fn uint(bits: u8) -> Self {
        Type::Int { bits, signed: false }
    }

    pub fn float(bits: u8) -> Self {
        Type::Float { bits }
    }

    pub fn opaque(name: impl Into<String>) -> Self {
        Type::Opaque(name.into())
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Type::Bool | Type::Int { .. } | Type::Float { .. })
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, Type::Int { .. })
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Type::Float { .. })
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::None => write!(f, "none"),
            Type::Bool => write!(f, "bool"),
            Type::Int { bits, signed: true } => write!(f, "int{}", bits),
            Type::Int { bits, signed: false } => write!(f, "uint{}", bits),
            Type::Float { bits } => write!(f, "float{}", bits),
            Type::Str => write!(f, "str"),
            Type::Dynamic => write!(f, "dynamic"),
            Type::Opaque(name) => write!(f, "opaque:{}", name),
        }
    }
}

impl FromStr for Type {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "none" => return Ok(Type::None),
            "bool" => return Ok(Type::Bool),
            "str" => return Ok(Type::Str),
            "dynamic" => return Ok(Type::Dynamic),
            _ => {}
        }

        if let Some(name) = s.strip_prefix("opaque:") {
            if name.is_empty() {
                return Err("opaque type needs a name".to_string());
            }
            return Ok(Type::Opaque(name.to_string()));
        }

        let (make, digits): (fn(u8) -> Type, &str) = if let Some(d) = s.strip_prefix("uint") {
            (Type::uint, d)
        } else if let Some(d) = s.strip_prefix("int") {
            (Type::int, d)
        } else if let Some(d) = s.strip_prefix("float") {
            (Type::float, d)
        } else {
            return Err(format!("unknown type name `{}`", s));
        };

        let bits: u8 = digits
            .parse()
            .map_err(|_| format!("invalid bit width in `{}`", s))?;
        let valid = if s.starts_with("float") {
            matches!(bits, 32 | 64)
        } else {
            matches!(bits, 8 | 16 | 32 | 64)
        };
        if !valid {
            return Err(format!("unsupported bit width in `{}`", s));
        }
        Ok(make(bits))
    }
}

impl From<Type> for String {
    fn from(ty: Type) -> String {
        ty.to_string()
    }
}

impl TryFrom<String> for Type {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Result of a join that may have used the configured fallback
#[derive(Debug, Clone, PartialEq)]
pub enum JoinOutcome {
    Joined(Type),
    /// The types had no join; `ty` is the fallback and `error` the recovered failure
    Fallback { ty: Type, error: CoreError },
}

impl JoinOutcome {
    pub fn ty(&self) -> &Type {
        match self {
            JoinOutcome::Joined(ty) => ty,
            JoinOutcome::Fallback { ty, .. } => ty,
        }
    }

    pub fn into_type(self) -> Type {
        match self {
            JoinOutcome::Joined(ty) => ty,
            JoinOutcome::Fallback { ty, .. } => ty,
        }
    }
}

/// Join operation over [`Type`]
#[derive(Debug, Clone, Default)]
pub struct TypeLattice {
    joins: FxHashMap<(Type, Type), Type>,
    fallback: Option<Type>,
}

impl TypeLattice {
    /// Numeric lattice with no extra joins and no fallback
    pub fn numeric() -> Self {
        Self::default()
    }

    pub fn from_config(config: &CompilerConfig) -> Self {
        let mut lattice = Self::numeric();
        for JoinRule { left, right, result } in &config.joins {
            lattice.add_join(left.clone(), right.clone(), result.clone());
        }
        lattice.fallback = config.unification_fallback.clone();
        lattice
    }

    pub fn with_join(mut self, left: Type, right: Type, result: Type) -> Self {
        self.add_join(left, right, result);
        self
    }

    pub fn with_fallback(mut self, fallback: Type) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn add_join(&mut self, left: Type, right: Type, result: Type) {
        self.joins.insert(Self::key(left, right), result);
    }

    pub fn fallback(&self) -> Option<&Type> {
        self.fallback.as_ref()
    }

    fn key(a: Type, b: Type) -> (Type, Type) {
        if a <= b { (a, b) } else { (b, a) }
    }

    /// Least upper bound of two types, without the fallback
    pub fn join(&self, a: &Type, b: &Type) -> CoreResult<Type> {
        if a == b {
            return Ok(a.clone());
        }
        if let Some(result) = self.joins.get(&Self::key(a.clone(), b.clone())) {
            return Ok(result.clone());
        }
        if matches!(a, Type::Dynamic) || matches!(b, Type::Dynamic) {
            return Ok(Type::Dynamic);
        }
        numeric_join(a, b).ok_or_else(|| CoreError::UnificationError {
            left: a.clone(),
            right: b.clone(),
        })
    }

    /// Join that substitutes the configured fallback on failure
    pub fn join_or_fallback(&self, a: &Type, b: &Type) -> CoreResult<JoinOutcome> {
        match self.join(a, b) {
            Ok(ty) => Ok(JoinOutcome::Joined(ty)),
            Err(error) => match &self.fallback {
                Some(ty) => Ok(JoinOutcome::Fallback {
                    ty: ty.clone(),
                    error,
                }),
                None => Err(error),
            },
        }
    }

    /// Join a whole set, left to right. `None` for an empty set.
    pub fn join_all<'t, I>(&self, types: I) -> CoreResult<Option<JoinOutcome>>
    where
        I: IntoIterator<Item = &'t Type>,
    {
        let mut acc: Option<JoinOutcome> = None;
        for ty in types {
            acc = Some(match acc {
                None => JoinOutcome::Joined(ty.clone()),
                Some(JoinOutcome::Joined(current)) => self.join_or_fallback(&current, ty)?,
                Some(fallback @ JoinOutcome::Fallback { .. }) => fallback,
            });
        }
        Ok(acc)
    }
}

fn numeric_join(a: &Type, b: &Type) -> Option<Type> {
    match (a, b) {
        (Type::Bool, other @ (Type::Int { .. } | Type::Float { .. }))
        | (other @ (Type::Int { .. } | Type::Float { .. }), Type::Bool) => Some(other.clone()),
        (Type::Int { bits: wa, signed: sa }, Type::Int { bits: wb, signed: sb }) => {
            if sa == sb {
                return Some(Type::Int { bits: (*wa).max(*wb), signed: *sa });
            }
            let (signed_bits, unsigned_bits) = if *sa { (*wa, *wb) } else { (*wb, *wa) };
            if signed_bits > unsigned_bits {
                Some(Type::int(signed_bits))
            } else if unsigned_bits < 64 {
                Some(Type::int(unsigned_bits * 2))
            } else {
                Some(Type::FLOAT64)
            }
        }
        (Type::Int { bits: wi, .. }, Type::Float { bits: wf })
        | (Type::Float { bits: wf }, Type::Int { bits: wi, .. }) => {
            let needed = if *wi >= 32 { 64 } else { 32 };
            Some(Type::float((*wf).max(needed)))
        }
        (Type::Float { bits: wa }, Type::Float { bits: wb }) => Some(Type::float((*wa).max(*wb))),
        _ => Option::None,
    }
}
