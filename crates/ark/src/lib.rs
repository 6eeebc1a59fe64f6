//! ArkScript language core: a small, dynamically typed, LISP-like
//! language compiled to bytecode and executed on a stack-based virtual
//! machine.
//!
//! The pipeline runs source text through the lexer, parser, import
//! solver, macro expander and name resolver, then lowers the AST to a
//! binary bytecode container that the VM executes with closures, scopes
//! and native-module plugins.

pub mod builtins;
pub mod bytecode;
pub mod error;
pub mod imports;
pub mod lexer;
pub mod macros;
pub mod node;
pub mod parser;
pub mod resolver;
pub mod run;
pub mod state;
pub mod tracer;
pub mod vm;

pub use crate::{
    bytecode::serializer::{Bytecode, TableEntry},
    error::{Error, ErrorKind, RunResult, SourceLoc},
    run::{Options, compile_file, compile_source, eval, run_file},
    state::State,
    tracer::{NoopTracer, RecordingTracer, StderrTracer, TraceEvent, VmTracer},
    vm::{
        FutureId, Vm,
        plugin::{ModuleRegistry, NativeModule},
        value::{Closure, NativeProc, Value},
    },
};
