//! Diagnostics library for middle-tier error reporting
//!
//! The middle tier works on IR rather than source text, so diagnostics point at
//! IR locations: a function, optionally narrowed to a basic block, a node of
//! the input tree, or an SSA use. The library provides:
//! - Multiple severity levels (Error, Warning, Info, Hint)
//! - Primary and secondary labels at IR locations
//! - Help and note attachments
//! - Plain or colored terminal output

use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity level for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DiagnosticSeverity {
    Error,
    Warning,
    Info,
    Hint,
}

impl fmt::Display for DiagnosticSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticSeverity::Error => write!(f, "error"),
            DiagnosticSeverity::Warning => write!(f, "warning"),
            DiagnosticSeverity::Info => write!(f, "info"),
            DiagnosticSeverity::Hint => write!(f, "hint"),
        }
    }
}

/// Where in the IR a diagnostic applies
///
/// Ids are stored raw so this crate does not depend on the compiler's id types.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IrLocation {
    pub function: Option<String>,
    pub block: Option<u32>,
    pub node: Option<u32>,
    pub use_id: Option<u32>,
}

impl IrLocation {
    pub fn function(name: impl Into<String>) -> Self {
        Self {
            function: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_block(mut self, block: u32) -> Self {
        self.block = Some(block);
        self
    }

    pub fn with_node(mut self, node: u32) -> Self {
        self.node = Some(node);
        self
    }

    pub fn with_use(mut self, use_id: u32) -> Self {
        self.use_id = Some(use_id);
        self
    }

    pub fn is_unknown(&self) -> bool {
        self.function.is_none() && self.block.is_none() && self.node.is_none() && self.use_id.is_none()
    }
}

impl fmt::Display for IrLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(function) = &self.function {
            parts.push(format!("fn `{}`", function));
        }
        if let Some(block) = self.block {
            parts.push(format!("bb{}", block));
        }
        if let Some(node) = self.node {
            parts.push(format!("node n{}", node));
        }
        if let Some(use_id) = self.use_id {
            parts.push(format!("use u{}", use_id));
        }
        if parts.is_empty() {
            write!(f, "<unknown>")
        } else {
            write!(f, "{}", parts.join(", "))
        }
    }
}

/// Style for diagnostic labels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabelStyle {
    Primary,
    Secondary,
}

/// A label that points at an IR location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub location: IrLocation,
    pub message: String,
    pub style: LabelStyle,
}

impl Label {
    pub fn primary(location: IrLocation, message: impl Into<String>) -> Self {
        Self {
            location,
            message: message.into(),
            style: LabelStyle::Primary,
        }
    }

    pub fn secondary(location: IrLocation, message: impl Into<String>) -> Self {
        Self {
            location,
            message: message.into(),
            style: LabelStyle::Secondary,
        }
    }
}

/// A diagnostic message with severity, location and labels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: DiagnosticSeverity,
    pub code: Option<String>,
    pub message: String,
    pub location: IrLocation,
    pub labels: Vec<Label>,
    pub notes: Vec<String>,
    pub help: Vec<String>,
}

/// Collection of diagnostics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Diagnostics {
    pub diagnostics: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.diagnostics.extend(other.diagnostics);
    }

    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }

    pub fn len(&self) -> usize {
        self.diagnostics.len()
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == DiagnosticSeverity::Error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == DiagnosticSeverity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == DiagnosticSeverity::Warning)
    }

    /// Diagnostics attributed to one function
    pub fn for_function<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Diagnostic> + 'a {
        self.diagnostics
            .iter()
            .filter(move |d| d.location.function.as_deref() == Some(name))
    }
}

/// Builder for creating diagnostics
pub struct DiagnosticBuilder {
    severity: DiagnosticSeverity,
    code: Option<String>,
    message: String,
    location: IrLocation,
    labels: Vec<Label>,
    notes: Vec<String>,
    help: Vec<String>,
}

impl DiagnosticBuilder {
    fn new(severity: DiagnosticSeverity, message: impl Into<String>, location: IrLocation) -> Self {
        Self {
            severity,
            code: None,
            message: message.into(),
            location,
            labels: vec![],
            notes: vec![],
            help: vec![],
        }
    }

    pub fn error(message: impl Into<String>, location: IrLocation) -> Self {
        Self::new(DiagnosticSeverity::Error, message, location)
    }

    pub fn warning(message: impl Into<String>, location: IrLocation) -> Self {
        Self::new(DiagnosticSeverity::Warning, message, location)
    }

    pub fn info(message: impl Into<String>, location: IrLocation) -> Self {
        Self::new(DiagnosticSeverity::Info, message, location)
    }

    pub fn hint(message: impl Into<String>, location: IrLocation) -> Self {
        Self::new(DiagnosticSeverity::Hint, message, location)
    }

    pub fn code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn label(mut self, location: IrLocation, message: impl Into<String>) -> Self {
        self.labels.push(Label::primary(location, message));
        self
    }

    pub fn secondary_label(mut self, location: IrLocation, message: impl Into<String>) -> Self {
        self.labels.push(Label::secondary(location, message));
        self
    }

    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn help(mut self, help_msg: impl Into<String>) -> Self {
        self.help.push(help_msg.into());
        self
    }

    pub fn build(self) -> Diagnostic {
        Diagnostic {
            severity: self.severity,
            code: self.code,
            message: self.message,
            location: self.location,
            labels: self.labels,
            notes: self.notes,
            help: self.help,
        }
    }
}

/// Formatter for displaying diagnostics
pub struct ErrorFormatter {
    use_colors: bool,
}

impl ErrorFormatter {
    pub fn new() -> Self {
        Self { use_colors: false }
    }

    pub fn with_colors() -> Self {
        Self { use_colors: true }
    }

    pub fn format_diagnostics(&self, diagnostics: &Diagnostics) -> String {
        let mut output = String::new();
        for (i, diagnostic) in diagnostics.diagnostics.iter().enumerate() {
            if i > 0 {
                output.push('\n');
            }
            output.push_str(&self.format_diagnostic(diagnostic));
        }
        output
    }

    pub fn format_diagnostic(&self, diagnostic: &Diagnostic) -> String {
        let mut output = String::new();

        // Header
        if self.use_colors {
            let color = match diagnostic.severity {
                DiagnosticSeverity::Error => "\x1b[31m",
                DiagnosticSeverity::Warning => "\x1b[33m",
                DiagnosticSeverity::Info => "\x1b[36m",
                DiagnosticSeverity::Hint => "\x1b[32m",
            };
            output.push_str(color);
            output.push_str(&diagnostic.severity.to_string());
            if let Some(code) = &diagnostic.code {
                output.push_str(&format!("[{}]", code));
            }
            output.push_str("\x1b[0m: \x1b[1;97m");
            output.push_str(&diagnostic.message);
            output.push_str("\x1b[0m\n");
        } else {
            output.push_str(&diagnostic.severity.to_string());
            if let Some(code) = &diagnostic.code {
                output.push_str(&format!("[{}]", code));
            }
            output.push_str(&format!(": {}\n", diagnostic.message));
        }

        if !diagnostic.location.is_unknown() {
            output.push_str(&self.arrow(&diagnostic.location, None));
        }

        for label in &diagnostic.labels {
            let prefix = match label.style {
                LabelStyle::Primary => "",
                LabelStyle::Secondary => "also ",
            };
            let message = format!("{}{}", prefix, label.message);
            output.push_str(&self.arrow(&label.location, Some(&message)));
        }

        for help_msg in &diagnostic.help {
            if self.use_colors {
                output.push_str("     \x1b[32mhelp\x1b[0m: \x1b[33m");
                output.push_str(help_msg);
                output.push_str("\x1b[0m\n");
            } else {
                output.push_str("     help: ");
                output.push_str(help_msg);
                output.push('\n');
            }
        }

        for note in &diagnostic.notes {
            if self.use_colors {
                output.push_str("\x1b[34mnote\x1b[0m: ");
            } else {
                output.push_str("note: ");
            }
            output.push_str(note);
            output.push('\n');
        }

        output
    }

    fn arrow(&self, location: &IrLocation, message: Option<&str>) -> String {
        let suffix = message.map(|m| format!(": {}", m)).unwrap_or_default();
        if self.use_colors {
            format!("  \x1b[96m-->\x1b[0m {}{}\n", location, suffix)
        } else {
            format!("  --> {}{}\n", location, suffix)
        }
    }
}

impl Default for ErrorFormatter {
    fn default() -> Self {
        Self::new()
    }
}

/// Result type that includes diagnostics
pub type DiagnosticResult<T> = Result<T, Diagnostics>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_display() {
        let location = IrLocation::function("f").with_block(2).with_use(7);
        assert_eq!(location.to_string(), "fn `f`, bb2, use u7");
        assert_eq!(IrLocation::default().to_string(), "<unknown>");
    }

    #[test]
    fn test_diagnostic_builder() {
        let location = IrLocation::function("f").with_node(4);

        let diagnostic = DiagnosticBuilder::error("test error", location.clone())
            .code("E0600")
            .label(location, "here")
            .help("try this")
            .note("additional info")
            .build();

        assert_eq!(diagnostic.severity, DiagnosticSeverity::Error);
        assert_eq!(diagnostic.code, Some("E0600".to_string()));
        assert_eq!(diagnostic.message, "test error");
        assert_eq!(diagnostic.labels.len(), 1);
        assert_eq!(diagnostic.help.len(), 1);
        assert_eq!(diagnostic.notes.len(), 1);
    }

    #[test]
    fn test_plain_formatting() {
        let diagnostic = DiagnosticBuilder::warning("fell back", IrLocation::function("g"))
            .code("W0300")
            .secondary_label(IrLocation::function("h"), "same recursive group")
            .build();

        let text = ErrorFormatter::new().format_diagnostic(&diagnostic);
        assert!(text.starts_with("warning[W0300]: fell back\n"));
        assert!(text.contains("  --> fn `g`\n"));
        assert!(text.contains("  --> fn `h`: also same recursive group\n"));
    }

    #[test]
    fn test_filter_by_function() {
        let mut diagnostics = Diagnostics::new();
        diagnostics.push(DiagnosticBuilder::error("a", IrLocation::function("f")).build());
        diagnostics.push(DiagnosticBuilder::warning("b", IrLocation::function("g")).build());

        assert!(diagnostics.has_errors());
        assert_eq!(diagnostics.for_function("g").count(), 1);
        assert_eq!(diagnostics.warnings().count(), 1);
    }
}
