//! Compiler configuration, read from TOML.
//!
//! ```toml
//! max-fixpoint-rounds = 32
//! unification-fallback = "dynamic"
//! recursion-fallback = "dynamic"
//! unbound-policy = "poison"
//! parallel = false
//!
//! [[join]]
//! left = "opaque:Handle"
//! right = "int64"
//! result = "int64"
//! ```

use crate::error::{CoreError, CoreResult};
use crate::types::Type;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_MAX_FIXPOINT_ROUNDS: usize = 64;

/// What to do with a variable read on a path where it is never bound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnboundPolicy {
    /// Report `UnboundVariable` for uses that are never bound
    #[default]
    Error,
    /// Keep the use and materialize a poison value for it
    Poison,
}

/// `[[join]]` entry: an explicit join for a non-numeric pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRule {
    pub left: Type,
    pub right: Type,
    pub result: Type,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct CompilerConfig {
    /// Upper bound on rounds spent on one recursive component
    pub max_fixpoint_rounds: usize,
    /// Substituted when a join fails
    pub unification_fallback: Option<Type>,
    /// Substituted for recursive components that do not converge
    pub recursion_fallback: Option<Type>,
    pub unbound_policy: UnboundPolicy,
    /// Build functions and resolve independent components on the rayon pool
    pub parallel: bool,
    #[serde(rename = "join")]
    pub joins: Vec<JoinRule>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            max_fixpoint_rounds: DEFAULT_MAX_FIXPOINT_ROUNDS,
            unification_fallback: None,
            recursion_fallback: None,
            unbound_policy: UnboundPolicy::Error,
            parallel: true,
            joins: Vec::new(),
        }
    }
}

impl CompilerConfig {
    pub fn from_toml_str(content: &str) -> CoreResult<Self> {
        let config: CompilerConfig = toml::from_str(content)
            .map_err(|e| CoreError::Config(format!("failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.max_fixpoint_rounds == 0 {
            return Err(CoreError::Config(
                "max-fixpoint-rounds must be at least 1".to_string(),
            ));
        }
        for rule in &self.joins {
            if rule.left == rule.right && rule.result != rule.left {
                return Err(CoreError::Config(format!(
                    "join of `{}` with itself must be `{}`",
                    rule.left, rule.left
                )));
            }
        }
        Ok(())
    }

    pub fn with_max_fixpoint_rounds(mut self, rounds: usize) -> Self {
        self.max_fixpoint_rounds = rounds;
        self
    }

    pub fn with_unification_fallback(mut self, ty: Type) -> Self {
        self.unification_fallback = Some(ty);
        self
    }

    pub fn with_recursion_fallback(mut self, ty: Type) -> Self {
        self.recursion_fallback = Some(ty);
        self
    }

    pub fn with_unbound_policy(mut self, policy: UnboundPolicy) -> Self {
        self.unbound_policy = policy;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_join(mut self, left: Type, right: Type, result: Type) -> Self {
        self.joins.push(JoinRule { left, right, result });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let config = CompilerConfig::from_toml_str("").unwrap();
        assert_eq!(config, CompilerConfig::default());
        assert_eq!(config.max_fixpoint_rounds, 64);
        assert!(config.parallel);
    }

    #[test]
    fn test_parse_full_config() {
        let config = CompilerConfig::from_toml_str(
            r#"
max-fixpoint-rounds = 8
unification-fallback = "dynamic"
unbound-policy = "poison"
parallel = false

[[join]]
left = "opaque:Handle"
right = "int64"
result = "int64"
"#,
        )
        .unwrap();

        assert_eq!(config.max_fixpoint_rounds, 8);
        assert_eq!(config.unification_fallback, Some(Type::Dynamic));
        assert_eq!(config.recursion_fallback, None);
        assert_eq!(config.unbound_policy, UnboundPolicy::Poison);
        assert!(!config.parallel);
        assert_eq!(config.joins.len(), 1);
        assert_eq!(config.joins[0].left, Type::opaque("Handle"));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(
            CompilerConfig::from_toml_str("max-fixpoint-rounds = 0"),
            Err(CoreError::Config(_))
        ));
        assert!(CompilerConfig::from_toml_str("unification-fallback = \"int12\"").is_err());
        assert!(CompilerConfig::from_toml_str("no-such-key = 1").is_err());
    }
}
