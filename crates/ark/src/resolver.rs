//! Name resolution: binding, scoping and mutability checks.
//!
//! Walks the post-expansion AST with a stack of scopes recording each
//! binding's mutability. Structural errors (re-`let`, `set` on a constant,
//! capture of unbound) abort immediately; unresolved uses are collected and
//! reported at the end with a Levenshtein-based suggestion when one is
//! close enough.

use ahash::AHashSet;

use crate::builtins;
use crate::error::{Error, ErrorKind, SourceLoc};
use crate::node::{Keyword, Node, NodeValue};

/// In-place list mutators whose first argument must be a mutable binding.
const UPDATE_REF: [&str; 3] = ["append!", "concat!", "pop!"];

/// Checks the whole tree; `Ok(())` means every name resolves.
pub fn resolve(ast: &Node, debug: u8) -> Result<(), Error> {
    resolve_with_bound(ast, debug, &[])
}

/// Like [`resolve`], with extra names the host promises to bind at VM
/// init (`State::bind`). They resolve as mutable globals.
pub fn resolve_with_bound(ast: &Node, debug: u8, bound: &[String]) -> Result<(), Error> {
    let mut pass = NameResolutionPass::new(debug);
    for name in bound {
        pass.add_defined_symbol(name, true);
    }
    pass.visit(ast)?;
    pass.check_undefined()
}

#[derive(Debug, Clone)]
struct Variable {
    name: String,
    mutable: bool,
}

/// Stack of lexical scopes, innermost last.
#[derive(Debug, Default)]
struct ScopeResolver {
    scopes: Vec<Vec<Variable>>,
}

impl ScopeResolver {
    fn new() -> Self {
        Self {
            scopes: vec![Vec::new()],
        }
    }

    fn create(&mut self) {
        self.scopes.push(Vec::new());
    }

    fn drop_innermost(&mut self) {
        self.scopes.pop();
    }

    fn register(&mut self, name: &str, mutable: bool) {
        let scope = self.scopes.last_mut().expect("scope stack is never empty");
        match scope.iter_mut().find(|v| v.name == name) {
            Some(variable) => variable.mutable = mutable,
            None => scope.push(Variable {
                name: name.to_owned(),
                mutable,
            }),
        }
    }

    /// Mutability of the nearest binding, `None` when unbound.
    fn is_immutable(&self, name: &str) -> Option<bool> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.iter().find(|v| v.name == name))
            .map(|variable| !variable.mutable)
    }

    fn is_registered(&self, name: &str) -> bool {
        self.is_immutable(name).is_some()
    }

    fn is_in_innermost(&self, name: &str) -> bool {
        self.scopes
            .last()
            .is_some_and(|scope| scope.iter().any(|v| v.name == name))
    }

    /// Drops the nearest binding of `name`, for `del`.
    fn remove_nearest(&mut self, name: &str) {
        for scope in self.scopes.iter_mut().rev() {
            if let Some(index) = scope.iter().position(|v| v.name == name) {
                scope.remove(index);
                return;
            }
        }
    }
}

struct NameResolutionPass {
    scope_resolver: ScopeResolver,
    defined_symbols: AHashSet<String>,
    symbol_uses: Vec<Node>,
    plugin_prefixes: Vec<String>,
    debug: u8,
}

impl NameResolutionPass {
    fn new(debug: u8) -> Self {
        Self {
            scope_resolver: ScopeResolver::new(),
            defined_symbols: AHashSet::new(),
            symbol_uses: Vec::new(),
            plugin_prefixes: Vec::new(),
            debug,
        }
    }

    fn add_defined_symbol(&mut self, name: &str, mutable: bool) {
        self.defined_symbols.insert(name.to_owned());
        self.scope_resolver.register(name, mutable);
    }

    fn visit(&mut self, node: &Node) -> Result<(), Error> {
        match &node.value {
            NodeValue::Symbol(_) => {
                self.record_use(node);
                Ok(())
            }
            NodeValue::Field(children) => {
                // the base symbol is an ordinary use; field names resolve
                // against the closure's scope, which is also program text
                for child in children {
                    self.record_use(child);
                }
                Ok(())
            }
            NodeValue::List(children) => {
                if let Some(keyword) = children.first().and_then(Node::keyword) {
                    return self.visit_keyword(node, keyword);
                }
                self.check_in_place_mutation(node)?;
                for child in children {
                    self.visit(child)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn visit_keyword(&mut self, node: &Node, keyword: Keyword) -> Result<(), Error> {
        let children = node.children();
        match keyword {
            Keyword::Let | Keyword::Mut | Keyword::Set => {
                // value first: (let foo (fun (&foo) ...)) must not see foo
                if children.len() > 2 {
                    self.visit(&children[2])?;
                }
                let Some(name_node) = children.get(1) else {
                    return Ok(());
                };
                let Some(name) = name_node.symbol_name() else {
                    return Ok(());
                };

                if builtins::is_reserved(name) {
                    return Err(name_error(
                        format!(
                            "can not use a reserved identifier ('{name}') as a {} name",
                            if keyword == Keyword::Let { "constant" } else { "variable" }
                        ),
                        name_node,
                    ));
                }

                if keyword == Keyword::Let && self.scope_resolver.is_in_innermost(name) {
                    return Err(mutability_error(
                        format!("can not use 'let' to redefine variable `{name}'"),
                        name_node,
                    ));
                }
                if keyword == Keyword::Set {
                    if !self.scope_resolver.is_registered(name) {
                        return Err(name_error(
                            format!("can not set unbound variable `{name}'"),
                            name_node,
                        ));
                    }
                    if self.scope_resolver.is_immutable(name).unwrap_or(false) {
                        let value = children.get(2).map(Node::repr).unwrap_or_default();
                        return Err(mutability_error(
                            format!("can not set the constant `{name}' to {value}"),
                            name_node,
                        ));
                    }
                } else {
                    self.add_defined_symbol(name, keyword != Keyword::Let);
                }
                Ok(())
            }
            Keyword::Import => {
                // only native module markers survive the import solver
                if let Some(prefix) = plugin_prefix(node) {
                    if self.debug >= 2 {
                        eprintln!("[resolver] plugin prefix `{prefix}'");
                    }
                    self.plugin_prefixes.push(prefix);
                }
                Ok(())
            }
            Keyword::Fun => {
                self.scope_resolver.create();
                if let Some(NodeValue::List(args)) = children.get(1).map(|n| &n.value) {
                    for arg in args {
                        match &arg.value {
                            NodeValue::Capture(name) => {
                                if !self.defined_symbols.contains(name) {
                                    return Err(name_error(
                                        format!(
                                            "can not capture {name} because it is referencing an unbound variable"
                                        ),
                                        arg,
                                    ));
                                }
                                if !self.scope_resolver.is_registered(name) {
                                    return Err(name_error(
                                        format!(
                                            "can not capture {name} because it is referencing a variable defined in an unreachable scope"
                                        ),
                                        arg,
                                    ));
                                }
                                self.add_defined_symbol(name, true);
                            }
                            NodeValue::Symbol(name) => self.add_defined_symbol(name, true),
                            _ => {}
                        }
                    }
                }
                if children.len() > 2 {
                    self.visit(&children[2])?;
                }
                self.scope_resolver.drop_innermost();
                Ok(())
            }
            Keyword::Del => {
                for child in &children[1..] {
                    self.visit(child)?;
                }
                // the binding is gone from here on; earlier uses stay valid
                if let Some(name) = children.get(1).and_then(Node::symbol_name) {
                    self.scope_resolver.remove_nearest(name);
                }
                Ok(())
            }
            _ => {
                for child in children {
                    self.visit(child)?;
                }
                Ok(())
            }
        }
    }

    /// `(append! a ...)` needs a mutable `a`, and never `(append! a a)`.
    fn check_in_place_mutation(&self, node: &Node) -> Result<(), Error> {
        let children = node.children();
        let (Some(func), Some(arg)) = (
            children.first().and_then(Node::symbol_name),
            children.get(1).and_then(Node::symbol_name),
        ) else {
            return Ok(());
        };
        if !UPDATE_REF.contains(&func) {
            return Ok(());
        }

        if self.scope_resolver.is_immutable(arg).unwrap_or(false) {
            return Err(mutability_error(
                format!("can not modify the constant list `{arg}' using `{func}'"),
                &children[1],
            ));
        }
        if func == "append!" || func == "concat!" {
            for extra in &children[2..] {
                if extra.symbol_name() == Some(arg) {
                    return Err(mutability_error(
                        format!("can not {func} the list `{arg}' to itself"),
                        &children[1],
                    ));
                }
            }
        }
        Ok(())
    }

    fn record_use(&mut self, node: &Node) {
        let Some(name) = node.symbol_name() else {
            return;
        };
        // builtins and operators are always available
        if builtins::is_reserved(name) {
            return;
        }
        if !self.symbol_uses.iter().any(|n| n.symbol_name() == Some(name)) {
            self.symbol_uses.push(node.clone());
        }
    }

    fn may_be_from_plugin(&self, name: &str) -> bool {
        let prefix = name.split(':').next().unwrap_or(name);
        self.plugin_prefixes.iter().any(|plugin| plugin == prefix)
    }

    fn check_undefined(&self) -> Result<(), Error> {
        for node in &self.symbol_uses {
            let name = node.symbol_name().expect("only symbols are recorded");
            if self.defined_symbols.contains(name) || self.may_be_from_plugin(name) {
                continue;
            }
            let message = match self.suggestion(name) {
                Some(suggestion) => format!(
                    "unbound variable \"{name}\" (did you mean \"{suggestion}\"?)"
                ),
                None => format!("unbound variable \"{name}\" (variable is used but not defined)"),
            };
            return Err(name_error(message, node));
        }
        Ok(())
    }

    /// Closest defined symbol, if fixing the name costs at most half of it.
    fn suggestion(&self, name: &str) -> Option<String> {
        let mut best_distance = name.chars().count() / 2;
        let mut best: Option<String> = None;
        for symbol in &self.defined_symbols {
            let distance = levenshtein(name, symbol);
            if distance <= best_distance {
                best_distance = distance;
                best = Some(symbol.clone());
            }
        }
        best
    }
}

/// Prefix a native module will bind its symbols under.
fn plugin_prefix(node: &Node) -> Option<String> {
    let children = node.children();
    match children.get(1).map(|n| &n.value) {
        Some(NodeValue::String(path)) => children
            .get(2)
            .and_then(Node::symbol_name)
            .map(str::to_owned)
            .or_else(|| {
                std::path::Path::new(path)
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
            }),
        _ => None,
    }
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];

    for (i, &ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution
                .min(previous[j + 1] + 1)
                .min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

fn name_error(message: impl Into<String>, node: &Node) -> Error {
    Error::new(ErrorKind::Name, message)
        .with_loc(SourceLoc::new(node.filename.as_ref(), node.line, node.col))
}

fn mutability_error(message: impl Into<String>, node: &Node) -> Error {
    Error::new(ErrorKind::Mutability, message)
        .with_loc(SourceLoc::new(node.filename.as_ref(), node.line, node.col))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn resolve_source(code: &str) -> Result<(), Error> {
        let parsed = parse(code, "test.ark").expect("parse failed");
        let expanded = crate::macros::expand(parsed.ast, 0).expect("expansion failed");
        resolve(&expanded, 0)
    }

    #[test]
    fn simple_bindings_resolve() {
        assert!(resolve_source("(let a 1) (let b (+ a 1))").is_ok());
    }

    #[test]
    fn unbound_use_is_reported() {
        let err = resolve_source("(let a 1) (print missing)").expect_err("expected error");
        assert_eq!(err.kind(), ErrorKind::Name);
        assert!(err.message().contains("missing"));
    }

    #[test]
    fn suggestion_is_offered_for_typos() {
        let err = resolve_source("(let counter 1) (print counteer)").expect_err("expected error");
        assert!(err.message().contains("did you mean \"counter\""));
    }

    #[test]
    fn set_on_constant_is_a_mutability_error() {
        let err = resolve_source("(let a 1) (set a 2)").expect_err("expected error");
        assert_eq!(err.kind(), ErrorKind::Mutability);
        assert!(err.message().contains("can not set the constant `a'"));
    }

    #[test]
    fn relet_in_same_scope_is_rejected() {
        let err = resolve_source("(let a 1) (let a 2)").expect_err("expected error");
        assert_eq!(err.kind(), ErrorKind::Mutability);
    }

    #[test]
    fn mut_allows_shadowing() {
        assert!(resolve_source("(mut a 1) (mut a 2)").is_ok());
    }

    #[test]
    fn set_on_unbound_is_rejected() {
        let err = resolve_source("(set ghost 1)").expect_err("expected error");
        assert_eq!(err.kind(), ErrorKind::Name);
    }

    #[test]
    fn function_arguments_are_scoped() {
        assert!(resolve_source("(let f (fun (x) (+ x 1))) (f 1)").is_ok());
    }

    #[test]
    fn capture_requires_an_existing_binding() {
        let err = resolve_source("(let f (fun (&ghost) ghost))").expect_err("expected error");
        assert!(err.message().contains("can not capture ghost"));
    }

    #[test]
    fn capture_of_outer_binding_is_fine() {
        assert!(resolve_source("(let n 1) (let f (fun (&n) n)) (f)").is_ok());
    }

    #[test]
    fn reserved_names_can_not_be_rebound() {
        let err = resolve_source("(let list 1)").expect_err("expected error");
        assert!(err.message().contains("reserved identifier"));
    }

    #[test]
    fn in_place_append_needs_a_mutable_list() {
        let err = resolve_source("(let l [1]) (append! l 2)").expect_err("expected error");
        assert_eq!(err.kind(), ErrorKind::Mutability);
    }

    #[test]
    fn appending_a_list_to_itself_is_rejected() {
        let err = resolve_source("(mut l [1]) (append! l l)").expect_err("expected error");
        assert!(err.message().contains("to itself"));
    }

    #[test]
    fn del_requires_a_known_symbol() {
        let err = resolve_source("(del ghost)").expect_err("expected error");
        assert_eq!(err.kind(), ErrorKind::Name);
    }

    #[test]
    fn recursive_function_can_reference_itself() {
        assert!(resolve_source("(let f (fun (n) (if (= n 0) 0 (f (- n 1))))) (f 3)").is_ok());
    }

    #[test]
    fn levenshtein_distance_basics() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("abc", "abc"), 0);
        assert_eq!(levenshtein("", "ab"), 2);
    }
}
