//! Shared, read-only program state: decoded bytecode plus host bindings.
//!
//! A `State` can back several VMs. The tables and pages never change after
//! construction; host bindings (`bind`, `set_args`) are copied into each
//! VM's global scope at init.

use std::path::PathBuf;

use crate::bytecode::Word;
use crate::bytecode::serializer::{Bytecode, TableEntry};
use crate::error::Error;
use crate::vm::value::Value;

/// Name used when the program didn't come from a file.
pub const NO_NAME_FILE: &str = "FILE";

#[derive(Debug)]
pub struct State {
    symbols: Vec<String>,
    constants: Vec<Value>,
    pages: Vec<Vec<Word>>,
    binded: Vec<(String, Value)>,
    lib_paths: Vec<PathBuf>,
    filename: String,
}

impl State {
    /// Builds a state from a decoded bytecode image.
    #[must_use]
    pub fn from_bytecode(bytecode: Bytecode) -> Self {
        let constants = bytecode
            .constants
            .iter()
            .map(|entry| match entry {
                TableEntry::Number(n) => Value::Number(*n),
                TableEntry::String(text) => Value::String(text.clone()),
                TableEntry::PageAddr(addr) => Value::PageAddr(*addr),
            })
            .collect();
        Self {
            symbols: bytecode.symbols,
            constants,
            pages: bytecode.pages,
            binded: Vec::new(),
            lib_paths: Vec::new(),
            filename: NO_NAME_FILE.to_owned(),
        }
    }

    /// Decodes a binary container, verifying magic, version and hash.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        Ok(Self::from_bytecode(Bytecode::decode(bytes)?))
    }

    /// Quick magic check, to tell bytecode files from source files.
    #[must_use]
    pub fn looks_like_bytecode(bytes: &[u8]) -> bool {
        bytes.len() > 4 && &bytes[0..4] == b"ark\0"
    }

    pub fn set_filename(&mut self, filename: impl Into<String>) {
        self.filename = filename.into();
    }

    #[must_use]
    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn set_lib_paths(&mut self, lib_paths: Vec<PathBuf>) {
        self.lib_paths = lib_paths;
    }

    #[must_use]
    pub fn lib_paths(&self) -> &[PathBuf] {
        &self.lib_paths
    }

    /// Binds a host value under `name`; picked up at VM init when the
    /// program mentions that symbol.
    pub fn bind(&mut self, name: impl Into<String>, value: Value) {
        self.binded.push((name.into(), value));
    }

    /// Exposes the command line as `sys:args` and the platform name as
    /// `sys:platform`.
    pub fn set_args(&mut self, args: Vec<String>) {
        let list = args.into_iter().map(Value::String).collect();
        self.bind("sys:args", Value::List(list));
        self.bind("sys:platform", Value::String(std::env::consts::OS.to_owned()));
    }

    #[must_use]
    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    #[must_use]
    pub fn symbol_id(&self, name: &str) -> Option<u16> {
        self.symbols
            .iter()
            .position(|s| s == name)
            .and_then(|index| u16::try_from(index).ok())
    }

    #[must_use]
    pub fn symbol_name(&self, id: u16) -> &str {
        self.symbols
            .get(id as usize)
            .map_or("<unknown>", String::as_str)
    }

    #[must_use]
    pub fn constants(&self) -> &[Value] {
        &self.constants
    }

    #[must_use]
    pub fn pages(&self) -> &[Vec<Word>] {
        &self.pages
    }

    #[must_use]
    pub fn binded(&self) -> &[(String, Value)] {
        &self.binded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Opcode;
    use crate::bytecode::serializer::crate_version;

    #[test]
    fn constants_materialize_to_values() {
        let bytecode = Bytecode {
            version: crate_version(),
            timestamp: 0,
            symbols: vec!["x".to_owned()],
            constants: vec![TableEntry::Number(1.5), TableEntry::PageAddr(2)],
            pages: vec![vec![Word::bare(Opcode::Nop)]],
        };
        let state = State::from_bytecode(bytecode);
        assert_eq!(state.constants()[0], Value::Number(1.5));
        assert_eq!(state.constants()[1], Value::PageAddr(2));
        assert_eq!(state.symbol_id("x"), Some(0));
        assert_eq!(state.symbol_name(0), "x");
    }

    #[test]
    fn magic_detection() {
        assert!(State::looks_like_bytecode(b"ark\0rest"));
        assert!(!State::looks_like_bytecode(b"(let a 1)"));
    }
}
