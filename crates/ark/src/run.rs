//! Public pipeline: source text to bytecode to a running VM.
//!
//! `compile_source` wires lexer, parser, import solver, macro expander,
//! name resolver and compiler; `eval` and `run_file` drive the VM on the
//! result.

use std::path::{Path, PathBuf};

use crate::bytecode::compiler;
use crate::bytecode::serializer::Bytecode;
use crate::error::Error;
use crate::imports::ImportSolver;
use crate::macros;
use crate::parser;
use crate::resolver;
use crate::state::State;
use crate::vm::Vm;
use crate::vm::value::Value;

/// Pipeline and VM configuration.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Verbosity, 0 (silent) and up.
    pub debug: u8,
    /// Library search paths for imports and native modules.
    pub lib_paths: Vec<PathBuf>,
    /// Propagate runtime errors to the caller instead of printing a
    /// backtrace and returning exit code 1.
    pub fail_with_exception: bool,
    /// Symbols the host will bind before running (`State::bind`); name
    /// resolution treats them as mutable globals.
    pub bound_symbols: Vec<String>,
}

impl Options {
    /// Search paths from `ARKSCRIPT_PATH` (semicolon separated), plus
    /// `./lib` when it exists.
    #[must_use]
    pub fn from_env() -> Self {
        let mut lib_paths: Vec<PathBuf> = std::env::var("ARKSCRIPT_PATH")
            .map(|raw| raw.split(';').map(PathBuf::from).collect())
            .unwrap_or_default();
        let local_lib = PathBuf::from("./lib");
        if local_lib.is_dir() {
            lib_paths.push(local_lib);
        }
        Self {
            debug: 0,
            lib_paths,
            fail_with_exception: false,
            bound_symbols: Vec::new(),
        }
    }
}

/// Compiles source text into a bytecode image.
///
/// `filename` names the compilation unit in diagnostics and anchors
/// relative imports.
pub fn compile_source(code: &str, filename: &str, options: &Options) -> Result<Bytecode, Error> {
    let parsed = parser::parse(code, filename)?;
    if options.debug >= 2 {
        eprintln!("[pipeline] parsed {} top-level forms", parsed.ast.children().len() - 1);
    }

    let solver = ImportSolver::new(options.debug, options.lib_paths.clone());
    let ast = solver.process(Path::new(filename), parsed.ast, &parsed.imports)?;

    let ast = macros::expand(ast, options.debug)?;
    resolver::resolve_with_bound(&ast, options.debug, &options.bound_symbols)?;
    compiler::compile(&ast, options.debug)
}

/// Compiles a file to its binary container.
pub fn compile_file(path: &Path, options: &Options) -> Result<Vec<u8>, Error> {
    let code = std::fs::read_to_string(path).map_err(|e| {
        Error::new(
            crate::error::ErrorKind::Module,
            format!("can not read {}: {e}", path.display()),
        )
    })?;
    Ok(compile_source(&code, &path.to_string_lossy(), options)?.encode())
}

/// Compiles and runs `code`, returning the value of its last top-level
/// expression. Every error, compile-time or runtime, propagates.
pub fn eval(code: &str, filename: &str, options: &Options) -> Result<Value, Error> {
    let bytecode = compile_source(code, filename, options)?;
    let mut state = State::from_bytecode(bytecode);
    state.set_filename(filename);
    state.set_lib_paths(options.lib_paths.clone());
    let mut vm = Vm::new(&state).with_exceptions();
    vm.run_value()
}

/// Runs a file (compiling first when it isn't already bytecode) and
/// returns the process exit code.
pub fn run_file(path: &Path, options: &Options) -> Result<i32, Error> {
    let bytes = std::fs::read(path).map_err(|e| {
        Error::new(
            crate::error::ErrorKind::Module,
            format!("can not read {}: {e}", path.display()),
        )
    })?;

    let mut state = if State::looks_like_bytecode(&bytes) {
        State::from_bytes(&bytes)?
    } else {
        let code = String::from_utf8(bytes).map_err(|_| {
            Error::new(
                crate::error::ErrorKind::Tokenizing,
                format!("{} is not valid UTF-8", path.display()),
            )
        })?;
        let bytecode = compile_source(&code, &path.to_string_lossy(), options)?;
        State::from_bytecode(bytecode)
    };
    state.set_filename(path.to_string_lossy());
    state.set_lib_paths(options.lib_paths.clone());
    state.set_args(std::env::args().skip(1).collect());

    let mut vm = Vm::new(&state);
    if options.fail_with_exception {
        vm = vm.with_exceptions();
    }
    vm.run()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eval_returns_the_last_toplevel_value() {
        let value = eval("(let x 40) (+ x 2)", "test.ark", &Options::default()).expect("eval failed");
        assert_eq!(value, Value::Number(42.0));
    }

    #[test]
    fn compile_source_produces_a_decodable_container() {
        let bytecode =
            compile_source("(let a 1)", "test.ark", &Options::default()).expect("compile failed");
        let encoded = bytecode.encode();
        let decoded = Bytecode::decode(&encoded).expect("decode failed");
        assert_eq!(decoded, bytecode);
    }

    #[test]
    fn compile_errors_carry_their_stage() {
        let err = compile_source("(let a ghost)", "test.ark", &Options::default())
            .expect_err("expected resolution error");
        assert_eq!(err.kind(), crate::error::ErrorKind::Name);
    }
}
