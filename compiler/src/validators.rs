//! Declared-signature checks run before a function is lowered
//!
//! A validator either rejects the function with an error or returns lint
//! messages. Lints never stop compilation.

use crate::error::{CoreError, CoreResult};
use crate::ids::NodeId;
use crate::node::ast::{self, FunctionView, FUNCTION};
use crate::node::NodeArena;

pub trait FunctionValidator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Check one function, returning lint messages
    fn validate(&self, function: &FunctionView<'_>) -> CoreResult<Vec<String>>;
}

/// A declared signature must list one type per parameter
pub struct ArgcountValidator;

impl FunctionValidator for ArgcountValidator {
    fn name(&self) -> &'static str {
        "argcount"
    }

    fn validate(&self, function: &FunctionView<'_>) -> CoreResult<Vec<String>> {
        let Some(signature) = &function.signature else {
            return Ok(Vec::new());
        };
        let expected = function.params.len();
        if signature.len() != expected {
            return Err(CoreError::schema(
                FUNCTION,
                format!(
                    "expected {} argument types in function {}",
                    expected, function.name
                ),
            ));
        }
        Ok(Vec::new())
    }
}

/// Warns about untyped parameters that no signature covers
pub struct MissingSignatureValidator;

impl FunctionValidator for MissingSignatureValidator {
    fn name(&self) -> &'static str {
        "missing-signature"
    }

    fn validate(&self, function: &FunctionView<'_>) -> CoreResult<Vec<String>> {
        if function.signature.is_some() {
            return Ok(Vec::new());
        }
        let untyped: Vec<&str> = function
            .params
            .iter()
            .filter(|p| p.declared_type.is_none())
            .map(|p| p.name)
            .collect();
        if untyped.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![format!(
            "function {} has no signature; parameter(s) {} are typed from call sites or assumed dynamic",
            function.name,
            untyped.join(", ")
        )])
    }
}

/// Declared signature and per-parameter types must agree
pub struct SignatureTypeValidator;

impl FunctionValidator for SignatureTypeValidator {
    fn name(&self) -> &'static str {
        "signature-type"
    }

    fn validate(&self, function: &FunctionView<'_>) -> CoreResult<Vec<String>> {
        let Some(signature) = &function.signature else {
            return Ok(Vec::new());
        };
        for (index, (param, declared)) in function.params.iter().zip(signature).enumerate() {
            if let Some(param_ty) = param.declared_type {
                if param_ty != *declared {
                    return Err(CoreError::schema(
                        FUNCTION,
                        format!(
                            "parameter {} (`{}`) of function {} is declared `{}` but the signature says `{}`",
                            index, param.name, function.name, param_ty, declared
                        ),
                    ));
                }
            }
        }
        Ok(Vec::new())
    }
}

pub fn default_validators() -> Vec<Box<dyn FunctionValidator>> {
    vec![
        Box::new(ArgcountValidator),
        Box::new(MissingSignatureValidator),
        Box::new(SignatureTypeValidator),
    ]
}

/// Run `validators` in order, stopping at the first error
pub fn run_validators(
    validators: &[Box<dyn FunctionValidator>],
    arena: &NodeArena,
    function: NodeId,
) -> CoreResult<Vec<String>> {
    let view = ast::function(arena, function)?;
    let mut lints = Vec::new();
    for validator in validators {
        let found = validator.validate(&view)?;
        for lint in &found {
            log::warn!("{}: {}", validator.name(), lint);
        }
        lints.extend(found);
    }
    Ok(lints)
}
