mod ast;
mod codegen;
mod lexer;
mod parser;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::compiled::CompiledUnit;
use crate::session::SessionId;
use crate::source::{SourceError, SourceUnit, total_size, validate_units};

/// Name of the function invoked on the entry unit
pub const ENTRY_FUNCTION: &str = "main";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// A compiler message attached to a position in one source unit
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub unit: String,
    pub line: u32,
    pub column: u32,
    pub severity: Severity,
    pub message: String,
}

impl Diagnostic {
    pub fn error(unit: &str, line: u32, column: u32, message: impl Into<String>) -> Self {
        Self {
            unit: unit.to_string(),
            line,
            column,
            severity: Severity::Error,
            message: message.into(),
        }
    }

    pub fn warning(unit: &str, line: u32, column: u32, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(unit, line, column, message)
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let severity = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(
            f,
            "{}:{}:{}: {severity}: {}",
            self.unit, self.line, self.column, self.message
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    /// The source has at least one error-severity diagnostic
    #[error("compilation failed with {} diagnostic(s)", .0.len())]
    Failure(Vec<Diagnostic>),
    /// The submission does not have the shape the compiler requires
    #[error("invalid submission: {0}")]
    Invalid(#[from] SourceError),
    /// The compiler ran out of capacity; not a defect of the source
    #[error("compiler unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone)]
pub struct CompilerLimits {
    pub max_source_bytes: usize,
    pub max_function_instructions: usize,
}

impl Default for CompilerLimits {
    fn default() -> Self {
        Self {
            max_source_bytes: 1024 * 1024,
            max_function_instructions: 1 << 20,
        }
    }
}

/// In-memory compiler from source units to a [`CompiledUnit`]
///
/// Every call builds a fresh symbol space, so two compilations never share
/// definitions even when they use the same names.
#[derive(Debug, Default)]
pub struct Compiler {
    limits: CompilerLimits,
}

impl Compiler {
    pub fn new(limits: CompilerLimits) -> Self {
        Self { limits }
    }

    pub fn compile(
        &self,
        session: SessionId,
        units: &[SourceUnit],
    ) -> Result<CompiledUnit, CompileError> {
        let entry = validate_units(units)?;

        let size = total_size(units);
        if size > self.limits.max_source_bytes {
            return Err(CompileError::Unavailable(format!(
                "source size {size} exceeds the compiler capacity of {} bytes",
                self.limits.max_source_bytes
            )));
        }

        let mut diagnostics = Vec::new();
        let mut parsed = Vec::with_capacity(units.len());
        for unit in units {
            let tokens = lexer::tokenize(&unit.name, &unit.text, &mut diagnostics);
            let items = parser::parse(&unit.name, tokens, &mut diagnostics);
            parsed.push(ast::ParsedUnit {
                name: unit.name.as_str(),
                items,
            });
        }
        if diagnostics.iter().any(Diagnostic::is_error) {
            return Err(CompileError::Failure(diagnostics));
        }

        let space = codegen::generate(
            session,
            &parsed,
            &entry.name,
            &self.limits,
            &mut diagnostics,
        )
        .map_err(|e| CompileError::Unavailable(e.0))?;
        if diagnostics.iter().any(Diagnostic::is_error) {
            return Err(CompileError::Failure(diagnostics));
        }

        log::debug!(
            "Compiled {} unit(s) for session {session} with {} warning(s)",
            units.len(),
            diagnostics.len()
        );

        Ok(CompiledUnit::new(space, entry.name.clone(), diagnostics))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn compile(units: &[SourceUnit]) -> Result<CompiledUnit, CompileError> {
        Compiler::default().compile(SessionId(1), units)
    }

    fn failure(units: &[SourceUnit]) -> Vec<Diagnostic> {
        match compile(units) {
            Err(CompileError::Failure(d)) => d,
            other => panic!("expected compile failure, got {other:?}"),
        }
    }

    #[test]
    fn test_compile_multi_unit() {
        let units = vec![
            SourceUnit::entry("Main", "fn main() { return helper(20) + 2; }"),
            SourceUnit::library("Helper", "fn helper(x) { return x * 2; }"),
        ];
        let compiled = compile(&units).unwrap();
        assert_eq!(compiled.function_count(), 2);
        assert_eq!(compiled.session(), SessionId(1));
        assert!(compiled.entry_point("main", 0).is_some());
        assert!(compiled.entry_point("main", 1).is_none());
        // helper lives outside the entry unit
        assert!(compiled.entry_point("helper", 1).is_none());
        assert_eq!(compiled.lookup("helper").unwrap().unit, "Helper");
    }

    #[test]
    fn test_syntax_error_reports_position() {
        let diags = failure(&[SourceUnit::entry("Main", "fn main() {\n  let x = ;\n}")]);
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].unit, "Main");
        assert_eq!((diags[0].line, diags[0].column), (2, 11));
        assert!(diags[0].is_error());
    }

    #[test]
    fn test_errors_from_several_units_keep_emission_order() {
        let diags = failure(&[
            SourceUnit::entry("Main", "fn main() { return 1 }"),
            SourceUnit::library("Other", "fn other() { @ }"),
        ]);
        let units: Vec<_> = diags.iter().map(|d| d.unit.as_str()).collect();
        assert_eq!(units, vec!["Main", "Other"]);
    }

    #[test]
    fn test_semantic_errors() {
        let diags = failure(&[SourceUnit::entry(
            "Main",
            "fn main() { let a = b; missing(); helper(1, 2); break; }\nfn helper(x) { return x; }",
        )]);
        let messages: Vec<_> = diags.iter().map(|d| d.message.as_str()).collect();
        assert_eq!(
            messages,
            vec![
                "undefined variable 'b'",
                "undefined function 'missing'",
                "function 'helper' expects 1 argument(s), found 2",
                "'break' outside of a loop",
                "unused variable 'a'",
            ]
        );
    }

    #[test]
    fn test_duplicate_function_across_units() {
        let diags = failure(&[
            SourceUnit::entry("Main", "fn main() {}\nfn shared() {}"),
            SourceUnit::library("Lib", "fn shared() {}"),
        ]);
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].unit, "Lib");
        assert_eq!(
            diags[0].message,
            "function 'shared' is already defined in unit 'Main' at line 2"
        );
    }

    #[test]
    fn test_missing_main() {
        let diags = failure(&[SourceUnit::entry("Main", "fn start() {}")]);
        assert_eq!(diags[0].message, "entry unit 'Main' does not define 'fn main'");
    }

    #[test]
    fn test_warnings_do_not_fail() {
        let compiled = compile(&[SourceUnit::entry(
            "Main",
            "fn main() {\n  let unused = 1;\n  return 0;\n  println(1);\n}",
        )])
        .unwrap();
        let warnings: Vec<_> = compiled
            .warnings()
            .iter()
            .map(|d| (d.line, d.message.as_str()))
            .collect();
        assert_eq!(
            warnings,
            vec![(4, "unreachable statement"), (2, "unused variable 'unused'")]
        );
    }

    #[test]
    fn test_invalid_shape_and_capacity() {
        let err = compile(&[SourceUnit::library("Main", "fn main() {}")]).unwrap_err();
        assert!(matches!(err, CompileError::Invalid(SourceError::NoEntryPoint)));

        let compiler = Compiler::new(CompilerLimits {
            max_source_bytes: 8,
            ..CompilerLimits::default()
        });
        let err = compiler
            .compile(SessionId(2), &[SourceUnit::entry("Main", "fn main() {}")])
            .unwrap_err();
        assert!(matches!(err, CompileError::Unavailable(_)));
    }

    #[test]
    fn test_diagnostic_display() {
        let d = Diagnostic::warning("Main", 3, 7, "unused variable 'x'");
        assert_eq!(d.to_string(), "Main:3:7: warning: unused variable 'x'");
    }
}
