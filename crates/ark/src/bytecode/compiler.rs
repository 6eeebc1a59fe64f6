//! Lowers the resolved AST to an instruction stream split across pages.
//!
//! Page 0 is the top level; every function body and quoted expression gets
//! its own page. Symbols and constants are interned into tables capped at
//! 65 535 entries. Direct self-recursion in tail position compiles to a
//! `JUMP 0` back to the top of the current page instead of a call.

use crate::builtins;
use crate::bytecode::serializer::{Bytecode, TableEntry, crate_version};
use crate::bytecode::{FIRST_OPERATOR, Opcode, Word};
use crate::error::{Error, ErrorKind, SourceLoc};
use crate::lexer::OPERATORS;
use crate::node::{Keyword, Node, NodeValue};

/// Compiles a resolved AST into a bytecode image.
pub fn compile(ast: &Node, debug: u8) -> Result<Bytecode, Error> {
    let mut compiler = Compiler::new(debug);
    compiler.pages.push(Vec::new()); // page 0: top level
    compiler.compile_expr(ast, 0, false, false, None)?;

    // the container stores a page size as u16 bytes, guard word included
    for (index, page) in compiler.pages.iter().enumerate() {
        if 4 * (page.len() + 1) > usize::from(u16::MAX) {
            return Err(Error::new(
                ErrorKind::Compilation,
                format!("size of page {index} exceeds the maximum size of 2^16 - 1"),
            ));
        }
    }

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    Ok(Bytecode {
        version: crate_version(),
        timestamp,
        symbols: compiler.symbols,
        constants: compiler.constants,
        pages: compiler.pages,
    })
}

struct Compiler {
    debug: u8,
    pages: Vec<Vec<Word>>,
    symbols: Vec<String>,
    constants: Vec<TableEntry>,
    /// Names bound per function nesting level; index 0 is the global scope.
    /// Drives automatic capture of free variables into closures.
    scopes: Vec<Vec<String>>,
}

impl Compiler {
    fn new(debug: u8) -> Self {
        Self {
            debug,
            pages: Vec::new(),
            symbols: Vec::new(),
            constants: Vec::new(),
            scopes: vec![Vec::new()],
        }
    }

    fn page(&mut self, p: usize) -> &mut Vec<Word> {
        &mut self.pages[p]
    }

    // ------------------------------------------------------------------
    // dispatch
    // ------------------------------------------------------------------

    /// `is_result_unused` marks expressions whose value the parent drops;
    /// atoms are then skipped entirely and calls get a trailing `POP`.
    /// `is_terminal` is true in tail position of `var_name`'s body.
    fn compile_expr(
        &mut self,
        node: &Node,
        p: usize,
        is_result_unused: bool,
        is_terminal: bool,
        var_name: Option<&str>,
    ) -> Result<(), Error> {
        match &node.value {
            NodeValue::Symbol(_) => self.compile_symbol(node, p, is_result_unused),
            NodeValue::Field(_) => {
                self.compile_field(node, p)?;
                if is_result_unused {
                    self.page(p).push(Word::bare(Opcode::Pop));
                }
                Ok(())
            }
            NodeValue::String(text) => {
                let id = self.add_constant(TableEntry::String(text.clone()), node)?;
                if !is_result_unused {
                    self.page(p).push(Word::new(Opcode::LoadConst, id));
                }
                Ok(())
            }
            NodeValue::Number(n) => {
                let id = self.add_constant(TableEntry::Number(*n), node)?;
                if !is_result_unused {
                    self.page(p).push(Word::new(Opcode::LoadConst, id));
                }
                Ok(())
            }
            NodeValue::List(children) if children.is_empty() => {
                // an empty code block is nil
                if !is_result_unused {
                    self.push_nil(p);
                }
                Ok(())
            }
            NodeValue::List(children) => {
                if let Some(keyword) = children[0].keyword() {
                    return self.compile_keyword(
                        node,
                        keyword,
                        p,
                        is_result_unused,
                        is_terminal,
                        var_name,
                    );
                }
                if let Some(head) = children[0].symbol_name() {
                    if head == "quote" {
                        return self.compile_quote(node, p, is_result_unused);
                    }
                    if let Some(instruction) = list_instruction(head) {
                        return self.compile_list_instruction(
                            node,
                            head,
                            instruction,
                            p,
                            is_result_unused,
                        );
                    }
                    if let Some(index) = operator_index(head) {
                        return self.compile_operator(node, index, p, is_result_unused);
                    }
                }
                self.compile_call(node, p, is_result_unused, is_terminal, var_name)
            }
            NodeValue::Keyword(_) => Ok(()),
            _ => Err(compile_error(
                format!("can not compile a {} node", node.type_name()),
                node,
            )),
        }
    }

    fn compile_keyword(
        &mut self,
        node: &Node,
        keyword: Keyword,
        p: usize,
        is_result_unused: bool,
        is_terminal: bool,
        var_name: Option<&str>,
    ) -> Result<(), Error> {
        match keyword {
            Keyword::If => self.compile_if(node, p, is_result_unused, is_terminal, var_name),
            Keyword::Let | Keyword::Mut | Keyword::Set => self.compile_let_mut_set(node, keyword, p),
            Keyword::Fun => self.compile_function(node, p, is_result_unused, var_name),
            Keyword::Begin => {
                let children = node.children();
                for (index, child) in children.iter().enumerate().skip(1) {
                    let is_last = index == children.len() - 1;
                    self.compile_expr(
                        child,
                        p,
                        // every non-last node's result is dropped
                        if is_last { is_result_unused } else { true },
                        is_terminal && is_last,
                        var_name,
                    )?;
                }
                Ok(())
            }
            Keyword::While => self.compile_while(node, p),
            Keyword::Import => self.compile_plugin_import(node, p),
            Keyword::Del => {
                let id = self.add_symbol(&node.children()[1])?;
                self.page(p).push(Word::new(Opcode::Del, id));
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // atoms and names
    // ------------------------------------------------------------------

    fn compile_symbol(&mut self, node: &Node, p: usize, is_result_unused: bool) -> Result<(), Error> {
        let name = node.symbol_name().expect("symbol node carries a name");

        if let Some(id) = builtins::builtin_index(name) {
            self.page(p).push(Word::new(Opcode::Builtin, id));
        } else if let Some(index) = operator_index(name) {
            let opcode = Opcode::from_repr(FIRST_OPERATOR + index).expect("operator range is valid");
            self.page(p).push(Word::bare(opcode));
        } else {
            let id = self.add_symbol(node)?;
            self.page(p).push(Word::new(Opcode::LoadSymbol, id));
        }

        if is_result_unused {
            self.warn("statement has no effect", node);
            self.page(p).push(Word::bare(Opcode::Pop));
        }
        Ok(())
    }

    /// `base.f.g`: load the base, then walk the closure fields.
    fn compile_field(&mut self, node: &Node, p: usize) -> Result<(), Error> {
        let children = node.children();
        self.compile_expr(&children[0], p, false, false, None)?;
        for field in &children[1..] {
            let id = self.add_symbol(field)?;
            self.page(p).push(Word::new(Opcode::GetField, id));
        }
        Ok(())
    }

    fn push_nil(&mut self, p: usize) {
        let id = builtins::builtin_index("nil").expect("nil is a builtin");
        self.page(p).push(Word::new(Opcode::Builtin, id));
    }

    // ------------------------------------------------------------------
    // control flow
    // ------------------------------------------------------------------

    fn compile_if(
        &mut self,
        node: &Node,
        p: usize,
        is_result_unused: bool,
        is_terminal: bool,
        var_name: Option<&str>,
    ) -> Result<(), Error> {
        let children = node.children();
        self.compile_expr(&children[1], p, false, false, None)?;

        let jump_to_then = self.page(p).len();
        self.page(p).push(Word::bare(Opcode::PopJumpIfTrue));

        if children.len() == 4 {
            self.compile_expr(&children[3], p, is_result_unused, is_terminal, var_name)?;
        } else if !is_result_unused {
            // a missing else branch in value position yields nil
            self.push_nil(p);
        }
        let jump_to_end = self.page(p).len();
        self.page(p).push(Word::bare(Opcode::Jump));

        let then_target = self.page(p).len() as u16;
        self.page(p)[jump_to_then].arg = then_target;
        self.compile_expr(&children[2], p, is_result_unused, is_terminal, var_name)?;
        let end_target = self.page(p).len() as u16;
        self.page(p)[jump_to_end].arg = end_target;
        Ok(())
    }

    fn compile_while(&mut self, node: &Node, p: usize) -> Result<(), Error> {
        let children = node.children();
        let loop_start = self.page(p).len() as u16;
        self.compile_expr(&children[1], p, false, false, None)?;
        let jump_to_end = self.page(p).len();
        self.page(p).push(Word::bare(Opcode::PopJumpIfFalse));

        self.compile_expr(&children[2], p, true, false, None)?;
        self.page(p).push(Word::new(Opcode::Jump, loop_start));

        let end_target = self.page(p).len() as u16;
        self.page(p)[jump_to_end].arg = end_target;
        Ok(())
    }

    // ------------------------------------------------------------------
    // bindings
    // ------------------------------------------------------------------

    fn compile_let_mut_set(&mut self, node: &Node, keyword: Keyword, p: usize) -> Result<(), Error> {
        let children = node.children();
        let name_node = &children[1];
        let id = self.add_symbol(name_node)?;
        let name = name_node
            .symbol_name()
            .ok_or_else(|| compile_error("expected a symbol as binding name", name_node))?;

        if keyword != Keyword::Set {
            self.scopes
                .last_mut()
                .expect("compiler scope stack is never empty")
                .push(name.to_owned());
        }

        self.compile_expr(&children[2], p, false, false, Some(name))?;

        let opcode = if keyword == Keyword::Set {
            Opcode::SetVal
        } else {
            Opcode::Store
        };
        self.page(p).push(Word::new(opcode, id));
        Ok(())
    }

    // ------------------------------------------------------------------
    // functions and quotes
    // ------------------------------------------------------------------

    fn compile_function(
        &mut self,
        node: &Node,
        p: usize,
        is_result_unused: bool,
        var_name: Option<&str>,
    ) -> Result<(), Error> {
        let children = node.children();
        let args = children[1].children();
        let body = &children[2];

        let mut captured: Vec<String> = Vec::new();
        for arg in args {
            if let NodeValue::Capture(name) = &arg.value {
                let id = self.add_symbol_name(name, arg)?;
                self.page(p).push(Word::new(Opcode::Capture, id));
                captured.push(name.clone());
            }
        }

        // close over free variables bound in enclosing function scopes;
        // globals stay reachable through the scope chain and are skipped
        let mut seed: Vec<String> = args
            .iter()
            .filter_map(|a| a.symbol_name().map(str::to_owned))
            .collect();
        let mut free = Vec::new();
        collect_free_symbols(body, &mut seed, &mut free);
        for name in free {
            if captured.contains(&name) || !self.is_bound_in_enclosing_function(&name) {
                continue;
            }
            let id = self.add_symbol_name(&name, node)?;
            self.page(p).push(Word::new(Opcode::Capture, id));
            captured.push(name);
        }

        self.pages.push(Vec::new());
        let page_id = self.pages.len() - 1;
        let page_addr =
            u16::try_from(page_id).map_err(|_| compile_error("too many code pages", node))?;
        let const_id = self.add_constant(TableEntry::PageAddr(page_addr), node)?;

        // prologue: pop arguments into the callee scope, declaration order
        let mut scope = captured;
        for arg in args {
            if let Some(name) = arg.symbol_name() {
                let id = self.add_symbol(arg)?;
                self.pages[page_id].push(Word::new(Opcode::Store, id));
                scope.push(name.to_owned());
            }
        }

        self.scopes.push(scope);
        self.compile_expr(body, page_id, false, true, var_name)?;
        self.scopes.pop();
        self.pages[page_id].push(Word::bare(Opcode::Ret));

        self.page(p).push(Word::new(Opcode::MakeClosure, const_id));

        if is_result_unused {
            self.warn("unused declared function", node);
            self.page(p).push(Word::bare(Opcode::Pop));
        }
        Ok(())
    }

    /// `(quote e)` compiles `e` on its own page; the value is that page's
    /// address, evaluated by calling it with no arguments.
    fn compile_quote(&mut self, node: &Node, p: usize, is_result_unused: bool) -> Result<(), Error> {
        let children = node.children();
        if children.len() != 2 {
            return Err(compile_error("quote expects exactly one expression", node));
        }
        self.pages.push(Vec::new());
        let page_id = self.pages.len() - 1;
        self.compile_expr(&children[1], page_id, false, false, None)?;
        self.pages[page_id].push(Word::bare(Opcode::Ret));

        let page_addr =
            u16::try_from(page_id).map_err(|_| compile_error("too many code pages", node))?;
        let const_id = self.add_constant(TableEntry::PageAddr(page_addr), node)?;
        self.page(p).push(Word::new(Opcode::LoadConst, const_id));

        if is_result_unused {
            self.warn("unused quote expression", node);
            self.page(p).push(Word::bare(Opcode::Pop));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // calls, operators, list instructions
    // ------------------------------------------------------------------

    fn compile_call(
        &mut self,
        node: &Node,
        p: usize,
        is_result_unused: bool,
        is_terminal: bool,
        var_name: Option<&str>,
    ) -> Result<(), Error> {
        let children = node.children();
        let head = &children[0];
        let argc = u16::try_from(children.len() - 1)
            .map_err(|_| compile_error("too many call arguments", node))?;

        // direct self-recursion in tail position: re-enter the page
        if is_terminal && head.symbol_name().is_some() && head.symbol_name() == var_name {
            for argument in children[1..].iter().rev() {
                self.compile_expr(argument, p, false, false, None)?;
            }
            self.page(p).push(Word::new(Opcode::Jump, 0));
            return Ok(());
        }

        for argument in &children[1..] {
            self.compile_expr(argument, p, false, false, None)?;
        }
        self.compile_expr(head, p, false, false, None)?;
        self.page(p).push(Word::new(Opcode::Call, argc));

        if is_result_unused {
            self.page(p).push(Word::bare(Opcode::Pop));
        }
        Ok(())
    }

    fn compile_operator(
        &mut self,
        node: &Node,
        operator: u8,
        p: usize,
        is_result_unused: bool,
    ) -> Result<(), Error> {
        let children = node.children();
        let opcode = Opcode::from_repr(FIRST_OPERATOR + operator).expect("operator range is valid");
        // assert pushes nothing, there is no result to drop
        let is_result_unused = is_result_unused && opcode != Opcode::Assert;

        let mut exp_count = 0usize;
        for argument in &children[1..] {
            self.compile_expr(argument, p, false, false, None)?;
            exp_count += 1;
            // (op a b c ...) lowers to a b op c op ... with TOS accumulation
            if exp_count >= 2 {
                self.page(p).push(Word::bare(opcode));
            }
        }

        if exp_count == 1 {
            if opcode.is_unary() {
                self.page(p).push(Word::bare(opcode));
            } else {
                return Err(compile_error(
                    "operator needs two arguments, but was called with only one",
                    &children[0],
                ));
            }
        }
        if exp_count > 2 && !opcode.supports_chaining() {
            return Err(compile_error(
                format!(
                    "can not create a chained expression (of length {exp_count}) for operator `{}'; you most likely forgot a `)'",
                    OPERATORS[operator as usize]
                ),
                node,
            ));
        }

        if is_result_unused {
            self.page(p).push(Word::bare(Opcode::Pop));
        }
        Ok(())
    }

    fn compile_list_instruction(
        &mut self,
        node: &Node,
        name: &str,
        instruction: Opcode,
        p: usize,
        is_result_unused: bool,
    ) -> Result<(), Error> {
        let children = node.children();
        let argc = u16::try_from(children.len() - 1)
            .map_err(|_| compile_error("too many arguments", node))?;
        if argc < 2 && instruction != Opcode::List {
            return Err(compile_error(
                format!("can not use {name} with less than 2 arguments"),
                node,
            ));
        }

        // arguments go in reverse so the target list ends up on top
        for argument in children[1..].iter().rev() {
            self.compile_expr(argument, p, false, false, None)?;
        }

        // one counting rule: LIST carries the element count, APPEND/CONCAT
        // and their in-place forms carry the appended-item count
        let arg = match instruction {
            Opcode::List => argc,
            Opcode::Append | Opcode::Concat | Opcode::AppendInPlace | Opcode::ConcatInPlace => {
                argc - 1
            }
            _ => 0,
        };
        self.page(p).push(Word::new(instruction, arg));

        // in-place instructions never push a value
        if is_result_unused && !name.ends_with('!') {
            self.warn("ignoring return value of function", node);
            self.page(p).push(Word::bare(Opcode::Pop));
        }
        Ok(())
    }

    fn compile_plugin_import(&mut self, node: &Node, p: usize) -> Result<(), Error> {
        let children = node.children();
        let Some(NodeValue::String(path)) = children.get(1).map(|n| &n.value) else {
            return Err(compile_error(
                "import survived the solver without a module path",
                node,
            ));
        };
        let id = self.add_constant(TableEntry::String(path.clone()), node)?;
        self.page(p).push(Word::new(Opcode::Plugin, id));
        Ok(())
    }

    // ------------------------------------------------------------------
    // tables
    // ------------------------------------------------------------------

    fn add_symbol(&mut self, node: &Node) -> Result<u16, Error> {
        let name = node
            .symbol_name()
            .or(match &node.value {
                NodeValue::Capture(name) => Some(name),
                _ => None,
            })
            .ok_or_else(|| compile_error("expected a symbol", node))?
            .to_owned();
        self.add_symbol_name(&name, node)
    }

    fn add_symbol_name(&mut self, name: &str, node: &Node) -> Result<u16, Error> {
        if let Some(index) = self.symbols.iter().position(|s| s == name) {
            return Ok(index as u16);
        }
        let index = self.symbols.len();
        if index >= usize::from(u16::MAX) {
            return Err(compile_error(
                "too many symbols (exceeds 65'536), aborting compilation",
                node,
            ));
        }
        self.symbols.push(name.to_owned());
        Ok(index as u16)
    }

    fn add_constant(&mut self, entry: TableEntry, node: &Node) -> Result<u16, Error> {
        if let Some(index) = self.constants.iter().position(|c| *c == entry) {
            return Ok(index as u16);
        }
        let index = self.constants.len();
        if index >= usize::from(u16::MAX) {
            return Err(compile_error(
                "too many values (exceeds 65'536), aborting compilation",
                node,
            ));
        }
        self.constants.push(entry);
        Ok(index as u16)
    }

    // ------------------------------------------------------------------
    // misc
    // ------------------------------------------------------------------

    fn is_bound_in_enclosing_function(&self, name: &str) -> bool {
        // skip the global scope: globals resolve through the chain anyway
        self.scopes[1..]
            .iter()
            .any(|scope| scope.iter().any(|bound| bound == name))
    }

    fn warn(&self, message: &str, node: &Node) {
        if self.debug >= 1 {
            eprintln!(
                "warning: {message} ({}:{}:{})",
                node.filename, node.line, node.col
            );
        }
    }
}

/// Maps a list-instruction head to its opcode.
fn list_instruction(name: &str) -> Option<Opcode> {
    match name {
        "list" => Some(Opcode::List),
        "append" => Some(Opcode::Append),
        "concat" => Some(Opcode::Concat),
        "append!" => Some(Opcode::AppendInPlace),
        "concat!" => Some(Opcode::ConcatInPlace),
        "pop" => Some(Opcode::PopList),
        "pop!" => Some(Opcode::PopListInPlace),
        _ => None,
    }
}

fn operator_index(name: &str) -> Option<u8> {
    OPERATORS
        .iter()
        .position(|&op| op == name)
        .and_then(|index| u8::try_from(index).ok())
}

/// Collects symbols used but not bound inside a function body.
///
/// `bound` seeds the walk with the argument names; `let`/`mut` bindings
/// extend it, nested functions recurse with their own frame so their free
/// variables propagate outward.
fn collect_free_symbols(node: &Node, bound: &mut Vec<String>, free: &mut Vec<String>) {
    match &node.value {
        NodeValue::Symbol(name) => {
            if !builtins::is_reserved(name) && !bound.contains(name) && !free.contains(name) {
                free.push(name.clone());
            }
        }
        NodeValue::Capture(name) => {
            if !bound.contains(name) && !free.contains(name) {
                free.push(name.clone());
            }
        }
        NodeValue::Field(children) => {
            // only the base resolves lexically; fields live in the closure
            if let Some(base) = children.first() {
                collect_free_symbols(base, bound, free);
            }
        }
        NodeValue::List(children) => {
            if let Some(keyword) = children.first().and_then(Node::keyword) {
                match keyword {
                    Keyword::Let | Keyword::Mut => {
                        if let Some(value) = children.get(2) {
                            collect_free_symbols(value, bound, free);
                        }
                        if let Some(name) = children.get(1).and_then(Node::symbol_name) {
                            bound.push(name.to_owned());
                        }
                        return;
                    }
                    Keyword::Fun => {
                        let mut inner = bound.clone();
                        for arg in children[1].children() {
                            match &arg.value {
                                NodeValue::Symbol(name) => inner.push(name.clone()),
                                // explicit captures resolve outside the
                                // nested function, in our scope
                                NodeValue::Capture(name) => {
                                    if !bound.contains(name) && !free.contains(name) {
                                        free.push(name.clone());
                                    }
                                    inner.push(name.clone());
                                }
                                _ => {}
                            }
                        }
                        if let Some(body) = children.get(2) {
                            collect_free_symbols(body, &mut inner, free);
                        }
                        return;
                    }
                    _ => {}
                }
            }
            for child in children {
                collect_free_symbols(child, bound, free);
            }
        }
        _ => {}
    }
}

fn compile_error(message: impl Into<String>, node: &Node) -> Error {
    Error::new(ErrorKind::Compilation, message)
        .with_loc(SourceLoc::new(node.filename.as_ref(), node.line, node.col))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::parser::parse;

    fn compile_source(code: &str) -> Bytecode {
        let parsed = parse(code, "test.ark").expect("parse failed");
        let expanded = crate::macros::expand(parsed.ast, 0).expect("expansion failed");
        crate::resolver::resolve(&expanded, 0).expect("resolution failed");
        compile(&expanded, 0).expect("compilation failed")
    }

    fn ops(page: &[Word]) -> Vec<Opcode> {
        page.iter().map(|w| w.opcode).collect()
    }

    #[test]
    fn let_compiles_to_const_then_store() {
        let bytecode = compile_source("(let x 42)");
        assert_eq!(
            ops(&bytecode.pages[0]),
            vec![Opcode::LoadConst, Opcode::Store]
        );
        assert_eq!(bytecode.symbols, vec!["x".to_owned()]);
        assert_eq!(bytecode.constants, vec![TableEntry::Number(42.0)]);
    }

    #[test]
    fn same_identifier_interns_to_one_symbol_id() {
        let bytecode = compile_source("(let x 1) (let y (+ x x))");
        let loads: Vec<u16> = bytecode.pages[0]
            .iter()
            .filter(|w| w.opcode == Opcode::LoadSymbol)
            .map(|w| w.arg)
            .collect();
        assert_eq!(loads.len(), 2);
        assert_eq!(loads[0], loads[1]);
    }

    #[test]
    fn operator_chain_repeats_the_opcode() {
        let bytecode = compile_source("(+ 1 2 3 4)");
        let adds = bytecode.pages[0]
            .iter()
            .filter(|w| w.opcode == Opcode::Add)
            .count();
        assert_eq!(adds, 3);
    }

    #[test]
    fn chained_comparison_is_rejected() {
        let parsed = parse("(< 1 2 3)", "test.ark").expect("parse failed");
        let err = compile(&parsed.ast, 0).expect_err("expected chain error");
        assert_eq!(err.kind(), ErrorKind::Compilation);
        assert!(err.message().contains("chained expression"));
    }

    #[test]
    fn unary_operator_takes_one_argument() {
        let bytecode = compile_source("(len [1 2])");
        assert!(ops(&bytecode.pages[0]).contains(&Opcode::Len));
    }

    #[test]
    fn binary_operator_with_one_argument_is_rejected() {
        let parsed = parse("(let a (- 1))", "test.ark").expect("parse failed");
        let err = compile(&parsed.ast, 0).expect_err("expected arity error");
        assert!(err.message().contains("two arguments"));
    }

    #[test]
    fn function_body_gets_its_own_page_ending_in_ret() {
        let bytecode = compile_source("(let f (fun (a) (+ a 1)))");
        assert_eq!(bytecode.pages.len(), 2);
        let body = &bytecode.pages[1];
        assert_eq!(body.first().map(|w| w.opcode), Some(Opcode::Store));
        assert_eq!(body.last().map(|w| w.opcode), Some(Opcode::Ret));
        assert!(ops(&bytecode.pages[0]).contains(&Opcode::MakeClosure));
    }

    #[test]
    fn explicit_capture_emits_capture_words() {
        let bytecode = compile_source("(let n 1) (let f (fun (&n) n))");
        assert!(ops(&bytecode.pages[0]).contains(&Opcode::Capture));
    }

    #[test]
    fn free_variable_of_inner_function_is_captured() {
        let bytecode = compile_source("(let mk (fun (n) (fun () n)))");
        // page 1 is mk's body; it must capture n for the inner function
        assert!(ops(&bytecode.pages[1]).contains(&Opcode::Capture));
    }

    #[test]
    fn tail_self_call_compiles_to_jump_zero() {
        let bytecode = compile_source("(let f (fun (n) (if (= n 0) 0 (f (- n 1)))))");
        let body = &bytecode.pages[1];
        assert!(
            body.iter()
                .any(|w| w.opcode == Opcode::Jump && w.arg == 0),
            "expected a JUMP 0 in {body:?}"
        );
        assert!(!ops(body).contains(&Opcode::Call));
    }

    #[test]
    fn non_tail_recursion_still_calls() {
        let bytecode = compile_source("(let f (fun (n) (if (= n 0) 0 (+ 1 (f (- n 1))))))");
        assert!(ops(&bytecode.pages[1]).contains(&Opcode::Call));
    }

    #[test]
    fn begin_pops_every_non_last_result() {
        let bytecode = compile_source("(let a { 1 2 3 })");
        let pops = bytecode.pages[0]
            .iter()
            .filter(|w| w.opcode == Opcode::Pop)
            .count();
        // the first two values of the block are dropped
        assert_eq!(pops, 2);
    }

    #[test]
    fn list_instruction_carries_element_count() {
        let bytecode = compile_source("(let l [1 2 3])");
        let list = bytecode.pages[0]
            .iter()
            .find(|w| w.opcode == Opcode::List)
            .expect("expected a LIST word");
        assert_eq!(list.arg, 3);
    }

    #[test]
    fn append_carries_appended_item_count() {
        let bytecode = compile_source("(mut l [1]) (let m (append l 2 3))");
        let append = bytecode.pages[0]
            .iter()
            .find(|w| w.opcode == Opcode::Append)
            .expect("expected an APPEND word");
        assert_eq!(append.arg, 2);
    }

    #[test]
    fn quote_compiles_to_a_page_constant() {
        let bytecode = compile_source("(let q '(+ 1 2))");
        assert_eq!(bytecode.pages.len(), 2);
        assert!(
            bytecode
                .constants
                .iter()
                .any(|c| matches!(c, TableEntry::PageAddr(1)))
        );
    }

    #[test]
    fn if_branch_layout_matches_the_convention() {
        // condition; POP_JUMP_IF_TRUE -> then; else; JUMP -> end; then
        let bytecode = compile_source("(let x (if true 1 2))");
        let page = &bytecode.pages[0];
        let jump_if = page
            .iter()
            .position(|w| w.opcode == Opcode::PopJumpIfTrue)
            .expect("expected POP_JUMP_IF_TRUE");
        let jump = page
            .iter()
            .position(|w| w.opcode == Opcode::Jump)
            .expect("expected JUMP");
        assert!(jump_if < jump);
        // the conditional jump lands after the unconditional one
        assert_eq!(usize::from(page[jump_if].arg), jump + 1);
    }
}
