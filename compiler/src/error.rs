//! Error taxonomy of the middle tier
//!
//! Every pass reports failures as a [`CoreError`]. Schema and CFG errors are
//! fatal for the function that produced them; unification and recursion
//! failures may be recovered by a configured fallback type, in which case they
//! are reported as warnings instead.

use crate::ids::{BlockId, NodeId, TypeNodeId, UseId};
use crate::types::Type;
use diagnostics::{Diagnostic, DiagnosticSeverity, IrLocation};
use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
    #[error("schema violation in `{kind}`: {reason}")]
    SchemaViolation { kind: String, reason: String },

    #[error("malformed CFG in `{function}`: {reason}")]
    MalformedCfg {
        function: String,
        block: Option<BlockId>,
        reason: String,
    },

    #[error("cannot unify `{left}` with `{right}`")]
    UnificationError { left: Type, right: Type },

    #[error("no type rule for `{name}`")]
    UnknownFunction { name: String },

    #[error(
        "recursive type did not converge after {rounds} round(s) ({} node(s) involved)",
        .members.len()
    )]
    UnresolvedRecursiveType {
        members: Vec<TypeNodeId>,
        rounds: usize,
    },

    #[error("variable `{variable}` is never bound before use in `{function}`")]
    UnboundVariable {
        function: String,
        variable: String,
        block: BlockId,
        use_id: UseId,
    },

    #[error("illegal construct in `{function}`: {reason}")]
    IllegalConstruct {
        function: String,
        node: NodeId,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("malformed IR table: {0}")]
    Import(String),
}

impl CoreError {
    pub fn schema(kind: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::SchemaViolation {
            kind: kind.into(),
            reason: reason.into(),
        }
    }

    pub fn malformed_cfg(
        function: impl Into<String>,
        block: Option<BlockId>,
        reason: impl Into<String>,
    ) -> Self {
        CoreError::MalformedCfg {
            function: function.into(),
            block,
            reason: reason.into(),
        }
    }

    /// Whether a configured fallback type may stand in for the failed result
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CoreError::UnificationError { .. }
                | CoreError::UnknownFunction { .. }
                | CoreError::UnresolvedRecursiveType { .. }
        )
    }

    /// Stable diagnostic code
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::SchemaViolation { .. } => "E0100",
            CoreError::Import(_) => "E0101",
            CoreError::MalformedCfg { .. } => "E0200",
            CoreError::UnificationError { .. } => "E0300",
            CoreError::UnknownFunction { .. } => "E0301",
            CoreError::UnresolvedRecursiveType { .. } => "E0400",
            CoreError::UnboundVariable { .. } => "E0500",
            CoreError::IllegalConstruct { .. } => "E0600",
            CoreError::Config(_) => "E0700",
        }
    }

    /// Code used when the error was recovered and downgraded to a warning
    pub fn warning_code(&self) -> String {
        self.code().replacen('E', "W", 1)
    }

    /// Render as a diagnostic attributed to `function`
    pub fn to_diagnostic(&self, function: &str, severity: DiagnosticSeverity) -> Diagnostic {
        let mut location = IrLocation::function(function);
        match self {
            CoreError::MalformedCfg { block: Some(block), .. } => {
                location = location.with_block(block.as_raw());
            }
            CoreError::UnboundVariable { block, use_id, .. } => {
                location = location.with_block(block.as_raw()).with_use(use_id.as_raw());
            }
            CoreError::IllegalConstruct { node, .. } => {
                location = location.with_node(node.as_raw());
            }
            _ => {}
        }

        let code = match severity {
            DiagnosticSeverity::Warning => self.warning_code(),
            _ => self.code().to_string(),
        };

        let mut diagnostic = Diagnostic {
            severity,
            code: Some(code),
            message: self.to_string(),
            location,
            labels: Vec::new(),
            notes: Vec::new(),
            help: Vec::new(),
        };

        match self {
            CoreError::UnificationError { .. } => diagnostic
                .help
                .push("configure a [[join]] entry or a unification-fallback type".to_string()),
            CoreError::UnresolvedRecursiveType { .. } => diagnostic
                .help
                .push("annotate one of the recursive definitions or set recursion-fallback".to_string()),
            CoreError::UnboundVariable { .. } => diagnostic
                .help
                .push("assign the variable on every path, or use unbound-policy = \"poison\"".to_string()),
            _ => {}
        }
        diagnostic
    }
}
