//! Error taxonomy shared by the compilation pipeline and the virtual machine.
//!
//! Compile passes abort with the first [`Error`]; the VM dispatch loop carries
//! errors as values and decides once, at loop exit, whether to print a
//! backtrace or hand the error back to the caller.

use std::fmt::{self, Write};

use strum::{Display, EnumString, IntoStaticStr};

/// Result type alias for operations that can produce a runtime error.
pub type RunResult<T> = Result<T, Error>;

/// Every failure class the language can report.
///
/// Uses strum derives so the rendered name matches the diagnostic prefix
/// exactly (e.g. `Mutability` -> "MutabilityError").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr)]
pub enum ErrorKind {
    /// Bad character or malformed escape in source text.
    #[strum(serialize = "TokenizingError")]
    Tokenizing,
    /// Grammar violation detected while building a form.
    #[strum(serialize = "SyntaxError")]
    Syntax,
    /// Grammar violation detected between forms (missing token, stray atom).
    #[strum(serialize = "ParseError")]
    Parse,
    /// Malformed macro, argument mismatch, expansion overflow, spread misuse.
    #[strum(serialize = "MacroProcessingError")]
    MacroProcessing,
    /// Unbound use detected by the name resolution pass.
    #[strum(serialize = "NameError")]
    Name,
    /// Re-`let` in the same scope, `set` on a constant, mutating a constant list.
    #[strum(serialize = "MutabilityError")]
    Mutability,
    /// Table overflow or illegal n-ary operator use during lowering.
    #[strum(serialize = "CompilationError")]
    Compilation,
    /// Builtin or operator called with a value of the wrong variant.
    #[strum(serialize = "TypeError")]
    Type,
    #[strum(serialize = "DivisionByZeroError")]
    DivisionByZero,
    /// Out-of-range access on `@`, `pop` or `pop!`.
    #[strum(serialize = "IndexError")]
    Index,
    /// Unbound symbol at runtime, write to an undefined binding.
    #[strum(serialize = "ScopeError")]
    Scope,
    /// Plugin not found or its function mapping could not be loaded.
    #[strum(serialize = "ModuleError")]
    Module,
    /// `(assert cond "msg")` with a false condition.
    #[strum(serialize = "AssertionFailed")]
    Assertion,
    /// Stack overflow, unknown opcode, corrupted container.
    #[strum(serialize = "VMError")]
    Vm,
}

/// A position in a source file, 0-based line and column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLoc {
    pub filename: String,
    pub line: usize,
    pub col: usize,
}

impl SourceLoc {
    pub fn new(filename: impl Into<String>, line: usize, col: usize) -> Self {
        Self {
            filename: filename.into(),
            line,
            col,
        }
    }
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ (line {}, col {})", self.filename, self.line, self.col)
    }
}

/// A diagnostic: kind, message, and where in the source it happened.
///
/// `context` holds pre-rendered source lines with a caret under the offending
/// column; it is attached by whoever still has the source text in hand.
#[derive(Debug, Clone, PartialEq)]
pub struct Error {
    kind: ErrorKind,
    message: String,
    loc: Option<SourceLoc>,
    context: Option<String>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            loc: None,
            context: None,
        }
    }

    #[must_use]
    pub fn with_loc(mut self, loc: SourceLoc) -> Self {
        self.loc = Some(loc);
        self
    }

    /// Attaches rendered source context (see [`render_context`]).
    #[must_use]
    pub fn with_context(mut self, context: String) -> Self {
        self.context = Some(context);
        self
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn loc(&self) -> Option<&SourceLoc> {
        self.loc.as_ref()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(loc) = &self.loc {
            writeln!(f, "At {loc}")?;
        }
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(context) = &self.context {
            write!(f, "\n{context}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

/// How many lines of leading context a rendered diagnostic shows.
const CONTEXT_LINES: usize = 3;

/// Renders source lines around `(line, col)` with a caret under the column.
///
/// `width` controls how many caret characters are drawn (the length of the
/// offending token), with a minimum of one.
#[must_use]
pub fn render_context(source: &str, line: usize, col: usize, width: usize) -> String {
    let lines: Vec<&str> = source.lines().collect();
    let mut out = String::new();
    let first = line.saturating_sub(CONTEXT_LINES);

    for (number, text) in lines.iter().enumerate().take(line + 1).skip(first) {
        let _ = writeln!(out, "{:>5} | {}", number + 1, text);
    }
    // caret line under the reported column
    let _ = write!(out, "{:>5} | {}{}", "", " ".repeat(col), "^".repeat(width.max(1)));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_renders_taxonomy_name() {
        assert_eq!(ErrorKind::Mutability.to_string(), "MutabilityError");
        assert_eq!(ErrorKind::Assertion.to_string(), "AssertionFailed");
        assert_eq!(ErrorKind::Vm.to_string(), "VMError");
    }

    #[test]
    fn display_includes_location_and_message() {
        let err = Error::new(ErrorKind::Syntax, "expected a value")
            .with_loc(SourceLoc::new("test.ark", 2, 4));
        let rendered = err.to_string();
        assert!(rendered.contains("test.ark @ (line 2, col 4)"));
        assert!(rendered.contains("SyntaxError: expected a value"));
    }

    #[test]
    fn context_draws_caret_under_column() {
        let context = render_context("(let a 1)\n(set a 2)", 1, 5, 1);
        assert!(context.contains("2 | (set a 2)"));
        assert!(context.ends_with("     ^"));
    }
}
