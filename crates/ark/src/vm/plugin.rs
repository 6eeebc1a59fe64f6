//! Native module loading behind the `PLUGIN` instruction.
//!
//! The concrete shared-library mechanics (dlopen/LoadLibrary) live outside
//! the language core; a module is anything implementing [`NativeModule`],
//! registered with the VM before the program runs. The `PLUGIN id`
//! instruction resolves the module by the file stem of its recorded
//! `.arkm` path and splices its function mapping into the global scope.
//! Loading is idempotent: a module is spliced at most once per VM.

use ahash::AHashSet;

use crate::vm::value::NativeProc;

/// A loadable native module: a name and its exported function mapping.
///
/// This is the trait-shaped equivalent of the original `getFunctionsMapping`
/// ABI (a NUL-terminated array of name/function pairs).
pub trait NativeModule {
    /// The module stem, matched against `(import pkg)` prefixes.
    fn name(&self) -> &str;

    /// Exported `(symbol, function)` pairs, e.g. `("math:pi", ...)`.
    fn functions(&self) -> Vec<(String, NativeProc)>;
}

/// The VM-wide set of registered modules plus the loaded-file set.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: Vec<Box<dyn NativeModule>>,
    loaded: AHashSet<String>,
}

impl ModuleRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, module: Box<dyn NativeModule>) {
        self.modules.push(module);
    }

    #[must_use]
    pub fn find(&self, stem: &str) -> Option<&dyn NativeModule> {
        self.modules
            .iter()
            .find(|module| module.name() == stem)
            .map(Box::as_ref)
    }

    /// Marks a module file as loaded; false when it already was.
    pub fn mark_loaded(&mut self, file: &str) -> bool {
        self.loaded.insert(file.to_owned())
    }

    #[must_use]
    pub fn is_loaded(&self, file: &str) -> bool {
        self.loaded.contains(file)
    }

    /// Forgets load state so a REPL-style host can force a reload.
    pub fn reset_loaded(&mut self) {
        self.loaded.clear();
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.modules.iter().map(|m| m.name()).collect();
        f.debug_struct("ModuleRegistry")
            .field("modules", &names)
            .field("loaded", &self.loaded)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RunResult;
    use crate::vm::Vm;
    use crate::vm::value::Value;

    struct Trig;

    fn cosine(_vm: &mut Vm<'_>, _args: Vec<Value>) -> RunResult<Value> {
        Ok(Value::Number(1.0))
    }

    impl NativeModule for Trig {
        fn name(&self) -> &str {
            "trig"
        }

        fn functions(&self) -> Vec<(String, NativeProc)> {
            vec![("trig:cos".to_owned(), cosine)]
        }
    }

    #[test]
    fn registry_finds_modules_by_stem() {
        let mut registry = ModuleRegistry::new();
        registry.register(Box::new(Trig));
        assert!(registry.find("trig").is_some());
        assert!(registry.find("other").is_none());
    }

    #[test]
    fn loading_is_idempotent() {
        let mut registry = ModuleRegistry::new();
        assert!(registry.mark_loaded("trig.arkm"));
        assert!(!registry.mark_loaded("trig.arkm"));
        assert!(registry.is_loaded("trig.arkm"));
    }
}
