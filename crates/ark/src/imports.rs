//! Module discovery and AST splicing for `(import ...)` declarations.
//!
//! Imports are resolved breadth-last on a LIFO stack: each package is located
//! on disk (importer directory first, then the library search paths, trying
//! `.ark` then `.arkm`), parsed if it is a source module, and finally spliced
//! in place of its import node. A package is inlined at most once no matter
//! how many times it is imported; repeats collapse to an empty begin block,
//! which also breaks import cycles.

use std::path::{Path, PathBuf};
use std::rc::Rc;

use ahash::AHashSet;
use indexmap::IndexMap;

use crate::error::{Error, ErrorKind, SourceLoc};
use crate::node::{Import, Keyword, Node, NodeValue};
use crate::parser;

/// A resolved module: its AST, or a marker node for native (`.arkm`) modules.
#[derive(Debug)]
struct Module {
    ast: Node,
    processed: bool,
}

/// Resolves every import reachable from the entry file and splices the
/// resulting module graph into a single AST.
#[derive(Debug)]
pub struct ImportSolver {
    lib_paths: Vec<PathBuf>,
    modules: IndexMap<String, Module>,
    imported: AHashSet<String>,
    debug: u8,
}

impl ImportSolver {
    #[must_use]
    pub fn new(debug: u8, lib_paths: Vec<PathBuf>) -> Self {
        Self {
            lib_paths,
            modules: IndexMap::new(),
            imported: AHashSet::new(),
            debug,
        }
    }

    /// Builds the import graph rooted at `root` and returns the spliced AST.
    pub fn process(mut self, root: &Path, ast: Node, imports: &[Import]) -> Result<Node, Error> {
        let root_dir = root.parent().map(Path::to_path_buf).unwrap_or_default();

        // the entry file is its own package: a cycle reaching back to it
        // collapses to a no-op instead of inlining the root twice
        if let Some(stem) = root.file_stem() {
            self.imported.insert(stem.to_string_lossy().into_owned());
        }

        let mut queue: Vec<Import> = imports.iter().rev().cloned().collect();
        while let Some(import) = queue.pop() {
            let key = import.package_string();
            if self.modules.contains_key(&key) {
                continue;
            }
            let additional = self.load_module(&root_dir, &import)?;
            for nested in additional.into_iter().rev() {
                queue.push(nested);
            }
        }

        let mut ast = ast;
        self.replace_imports(&mut ast);
        Ok(ast)
    }

    /// Locates and parses one package, returning the imports it declares.
    fn load_module(&mut self, root_dir: &Path, import: &Import) -> Result<Vec<Import>, Error> {
        let key = import.package_string();
        let path = self.find_file(root_dir, import)?;

        if path.extension().is_some_and(|ext| ext == "arkm") {
            // native module: keep an import marker for the PLUGIN instruction
            let marker = Node::synthetic(NodeValue::List(vec![
                Node::synthetic(NodeValue::Keyword(Keyword::Import)),
                Node::synthetic(NodeValue::String(format!("{}.arkm", import.package_path()))),
                Node::synthetic(NodeValue::Symbol(import.prefix.clone())),
            ]));
            self.modules.insert(
                key,
                Module {
                    ast: marker,
                    processed: true,
                },
            );
            return Ok(Vec::new());
        }

        if self.debug >= 2 {
            eprintln!("[imports] parsing module {key} from {}", path.display());
        }
        let code = std::fs::read_to_string(&path).map_err(|e| {
            Error::new(
                ErrorKind::Module,
                format!("couldn't read module {key} at {}: {e}", path.display()),
            )
        })?;
        let parsed = parser::parse(&code, &path.to_string_lossy())?;
        self.modules.insert(
            key,
            Module {
                ast: parsed.ast,
                processed: false,
            },
        );
        Ok(parsed.imports)
    }

    fn find_file(&self, root_dir: &Path, import: &Import) -> Result<PathBuf, Error> {
        let package_path = import.package_path();
        let mut folders = vec![root_dir.to_path_buf()];
        folders.extend(self.lib_paths.iter().cloned());

        for folder in &folders {
            for extension in ["ark", "arkm"] {
                let candidate = folder.join(format!("{package_path}.{extension}"));
                if candidate.exists() {
                    return Ok(candidate);
                }
            }
        }

        let searched: Vec<String> = folders.iter().map(|f| f.display().to_string()).collect();
        Err(Error::new(
            ErrorKind::Module,
            format!(
                "couldn't import {}: file not found, searched under {}",
                import.package_string(),
                searched.join(", ")
            ),
        )
        .with_loc(SourceLoc::new("", import.line, import.col)))
    }

    /// Walks the AST replacing import nodes by their module bodies.
    fn replace_imports(&mut self, node: &mut Node) {
        if !matches!(node.value, NodeValue::List(_)) {
            return;
        }

        let mut i = 0;
        while i < node.children().len() {
            let Some(key) = source_import_key(&node.children()[i]) else {
                self.replace_imports(&mut node.children_mut()[i]);
                i += 1;
                continue;
            };

            if self.imported.insert(key.clone()) {
                let module = self
                    .modules
                    .get(&key)
                    .expect("import graph discovery missed a package");
                let mut replacement = module.ast.clone();
                if !module.processed {
                    if let Some(module) = self.modules.get_mut(&key) {
                        module.processed = true;
                    }
                    self.replace_imports(&mut replacement);
                }

                if replacement.is_begin_block() {
                    // splice the module body where the import node sat
                    let body: Vec<Node> = replacement.children()[1..].to_vec();
                    let count = body.len();
                    node.children_mut().splice(i..=i, body);
                    i += count;
                } else {
                    node.children_mut()[i] = replacement;
                    i += 1;
                }
            } else {
                // already inlined elsewhere: collapse to a no-op block
                node.children_mut()[i] = empty_begin(node.children()[i].filename.clone());
                i += 1;
            }
        }
    }
}

/// Returns the package key if `node` is a source import (not a native
/// module marker, which keeps a String payload and must stay in the tree).
fn source_import_key(node: &Node) -> Option<String> {
    let children = node.children();
    if !matches!(node.value, NodeValue::List(_))
        || children.first().and_then(Node::keyword) != Some(Keyword::Import)
    {
        return None;
    }
    match children.get(1).map(|n| &n.value) {
        Some(NodeValue::List(segments)) => {
            let names: Vec<&str> = segments.iter().filter_map(Node::symbol_name).collect();
            Some(names.join("."))
        }
        _ => None,
    }
}

fn empty_begin(filename: Rc<str>) -> Node {
    Node::new(
        NodeValue::List(vec![Node::new(
            NodeValue::Keyword(Keyword::Begin),
            Rc::clone(&filename),
            0,
            0,
        )]),
        filename,
        0,
        0,
    )
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::parser::parse;

    fn solve(dir: &Path, entry: &str) -> Node {
        let path = dir.join(entry);
        let code = fs::read_to_string(&path).expect("read entry");
        let parsed = parse(&code, &path.to_string_lossy()).expect("parse entry");
        ImportSolver::new(0, vec![])
            .process(&path, parsed.ast, &parsed.imports)
            .expect("solve imports")
    }

    fn count_symbol(node: &Node, name: &str) -> usize {
        let mut count = usize::from(node.symbol_name() == Some(name));
        for child in node.children() {
            count += count_symbol(child, name);
        }
        count
    }

    #[test]
    fn module_body_is_spliced_in_place() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("util.ark"), "(let helper 1)").expect("write");
        fs::write(dir.path().join("main.ark"), "(import util)\n(let x helper)").expect("write");

        let ast = solve(dir.path(), "main.ark");
        assert_eq!(count_symbol(&ast, "helper"), 2);
        // no import node survives
        assert!(!ast.repr().contains("import"));
    }

    #[test]
    fn package_is_inlined_at_most_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("util.ark"), "(let once 1)").expect("write");
        fs::write(
            dir.path().join("main.ark"),
            "(import util)\n(import util)\n(let x once)",
        )
        .expect("write");

        let ast = solve(dir.path(), "main.ark");
        // one definition + one use
        assert_eq!(count_symbol(&ast, "once"), 2);
    }

    #[test]
    fn cyclic_imports_terminate_with_one_expansion() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("a.ark"), "(import b)\n(let from-a 1)").expect("write");
        fs::write(dir.path().join("b.ark"), "(import a)\n(let from-b 2)").expect("write");

        let path = dir.path().join("a.ark");
        let code = fs::read_to_string(&path).expect("read entry");
        let parsed = parse(&code, &path.to_string_lossy()).expect("parse entry");
        let ast = ImportSolver::new(0, vec![])
            .process(&path, parsed.ast, &parsed.imports)
            .expect("solve imports");

        assert_eq!(count_symbol(&ast, "from-b"), 1);
    }

    #[test]
    fn missing_module_is_a_module_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("main.ark"), "(import nope)").expect("write");

        let path = dir.path().join("main.ark");
        let code = fs::read_to_string(&path).expect("read entry");
        let parsed = parse(&code, &path.to_string_lossy()).expect("parse entry");
        let err = ImportSolver::new(0, vec![])
            .process(&path, parsed.ast, &parsed.imports)
            .expect_err("expected module error");
        assert_eq!(err.kind(), ErrorKind::Module);
    }

    #[test]
    fn lib_path_is_searched_after_importer_directory() {
        let lib = tempfile::tempdir().expect("tempdir");
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(lib.path().join("shared.ark"), "(let shared-value 3)").expect("write");
        fs::write(dir.path().join("main.ark"), "(import shared)\n(let x shared-value)")
            .expect("write");

        let path = dir.path().join("main.ark");
        let code = fs::read_to_string(&path).expect("read entry");
        let parsed = parse(&code, &path.to_string_lossy()).expect("parse entry");
        let ast = ImportSolver::new(0, vec![lib.path().to_path_buf()])
            .process(&path, parsed.ast, &parsed.imports)
            .expect("solve imports");
        assert_eq!(count_symbol(&ast, "shared-value"), 2);
    }

    #[test]
    fn native_module_marker_survives_splicing() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("gfx.arkm"), b"\x00").expect("write");
        fs::write(dir.path().join("main.ark"), "(import gfx)").expect("write");

        let ast = solve(dir.path(), "main.ark");
        assert!(ast.repr().contains("gfx.arkm"));
    }
}
