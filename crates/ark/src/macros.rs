//! Fixed-point macro expansion.
//!
//! Macro definitions are tracked in a stack of scopes keyed by AST depth.
//! Three executors run in order on every node: symbol substitution for
//! constant macros, `$if` compile-time conditionals, and function macros
//! with argument binding and spread splicing. A compile-time evaluation
//! sub-language folds arithmetic, comparisons, list primitives, `symcat`,
//! `argcount`, `$repr` and `$paste` while expanding.

use ahash::AHashMap;
use indexmap::IndexMap;

use crate::builtins;
use crate::error::{Error, ErrorKind, SourceLoc};
use crate::lexer::OPERATORS;
use crate::node::{Keyword, Node, NodeValue};

/// Hard cap on recursive expansion, against self-feeding macros.
pub const MAX_MACRO_PROCESSING_DEPTH: u32 = 600;
/// Hard cap on substitution depth inside one macro body.
pub const MAX_MACRO_UNIFICATION_DEPTH: u32 = 200;

/// Macro functions that exist without being defined by the program.
const PREDEFINED_MACROS: [&str; 4] = ["symcat", "argcount", "$repr", "$paste"];

/// Expands every macro in `ast`, returning the rewritten tree.
pub fn expand(ast: Node, debug: u8) -> Result<Node, Error> {
    let mut processor = MacroProcessor::new(debug);
    let mut ast = ast;
    processor.process_node(&mut ast, 0)?;
    if debug >= 3 {
        eprintln!("[macros] AST after expansion:\n{ast}");
    }
    Ok(ast)
}

/// One lexical macro scope, created lazily at the AST depth that first
/// defines a macro and discarded when leaving that depth.
#[derive(Debug)]
struct MacroScope {
    depth: u32,
    macros: IndexMap<String, Node>,
}

#[derive(Debug)]
struct MacroProcessor {
    scopes: Vec<MacroScope>,
    /// `(let name (fun (args) ...))` definitions, for `argcount`.
    defined_functions: AHashMap<String, Node>,
    debug: u8,
}

impl MacroProcessor {
    fn new(debug: u8) -> Self {
        Self {
            scopes: Vec::new(),
            defined_functions: AHashMap::new(),
            debug,
        }
    }

    // ------------------------------------------------------------------
    // traversal
    // ------------------------------------------------------------------

    fn process_node(&mut self, node: &mut Node, depth: u32) -> Result<(), Error> {
        if depth >= MAX_MACRO_PROCESSING_DEPTH {
            return Err(macro_error(
                format!(
                    "max recursion depth reached ({MAX_MACRO_PROCESSING_DEPTH}); a recursive macro is most likely missing its exit condition"
                ),
                node,
            ));
        }
        if !matches!(node.value, NodeValue::List(_)) {
            return Ok(());
        }

        let mut created_scope = false;
        let mut i = 0;
        while i < node.children().len() {
            if matches!(node.children()[i].value, NodeValue::Macro(_)) {
                let needs_scope = self
                    .scopes
                    .last()
                    .is_some_and(|scope| !scope.macros.is_empty() && scope.depth < depth);
                if needs_scope || !created_scope {
                    created_scope = true;
                    self.scopes.push(MacroScope {
                        depth,
                        macros: IndexMap::new(),
                    });
                }

                let had_begin = node.children()[i].is_begin_block();
                let definition = node.children()[i].clone();
                self.register_macro(&definition)?;
                if matches!(node.children()[i].value, NodeValue::Macro(_)) {
                    self.recur_apply(&mut node.children_mut()[i])?;
                }

                if node.children()[i].is_begin_block() && !had_begin {
                    splice_begin(node, i);
                } else if matches!(
                    node.children()[i].value,
                    NodeValue::Macro(_) | NodeValue::Unused(_)
                ) {
                    node.children_mut().remove(i);
                }
                // no increment: the next child shifted into position i
            } else {
                let had_begin = node.children()[i].is_begin_block();
                self.apply_macro(&mut node.children_mut()[i], 0)?;
                self.recur_apply(&mut node.children_mut()[i])?;

                let added_begin = node.children()[i].is_begin_block() && !had_begin;
                if !added_begin && matches!(node.children()[i].value, NodeValue::Unused(_)) {
                    node.children_mut().remove(i);
                    continue;
                }

                self.process_node(&mut node.children_mut()[i], depth + 1)?;
                let processed = node.children()[i].clone();
                self.register_func_def(&processed)?;

                if added_begin {
                    // a macro expanded to a begin block: inline its children
                    splice_begin(node, i);
                }
                i += 1;
            }
        }

        if self.scopes.last().is_some_and(|scope| scope.depth == depth) {
            self.scopes.pop();
        }
        Ok(())
    }

    /// Applies macros on `node` and, if anything changed, on its children.
    fn recur_apply(&mut self, node: &mut Node) -> Result<(), Error> {
        if self.apply_macro(node, 0)? && node.is_list_like() {
            let mut children = std::mem::take(node.children_mut());
            for child in &mut children {
                self.recur_apply(child)?;
            }
            *node.children_mut() = children;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // registration
    // ------------------------------------------------------------------

    fn register_macro(&mut self, node: &Node) -> Result<(), Error> {
        let children = node.children();
        if children.len() < 2 {
            return Err(macro_error("invalid macro, missing value", node));
        }
        let first = &children[0];
        let second = &children[1];

        // ($ name value)
        if children.len() == 2 {
            return match first.symbol_name() {
                Some("$undef") => match second.symbol_name() {
                    Some(name) => {
                        self.delete_nearest_macro(name);
                        Ok(())
                    }
                    None => Err(macro_error("can not un-define a macro without a name", second)),
                },
                Some(name) => {
                    self.add_macro(name, node);
                    Ok(())
                }
                None if first.keyword().is_some() => Ok(()), // $if, handled by apply
                None => Err(macro_error("can not define a macro without a symbol", first)),
            };
        }

        // ($ name (args) body)
        if children.len() == 3
            && let Some(name) = first.symbol_name()
        {
            let NodeValue::List(args) = &second.value else {
                return Err(macro_error("invalid macro argument list", second));
            };
            let mut had_spread = false;
            for arg in args {
                match &arg.value {
                    NodeValue::Spread(_) if had_spread => {
                        return Err(macro_error(
                            "invalid macro, only one spread is allowed in an argument list",
                            arg,
                        ));
                    }
                    NodeValue::Spread(_) => had_spread = true,
                    NodeValue::Symbol(text) if had_spread => {
                        return Err(macro_error(
                            format!(
                                "invalid macro, a spread should mark the end of an argument list, but found another argument: {text}"
                            ),
                            arg,
                        ));
                    }
                    NodeValue::Symbol(_) => {}
                    _ => {
                        return Err(macro_error(
                            "invalid macro argument list, expected symbols",
                            arg,
                        ));
                    }
                }
            }
            self.add_macro(name, node);
        }
        Ok(())
    }

    fn add_macro(&mut self, name: &str, node: &Node) {
        if self.debug >= 3 {
            eprintln!("[macros] registering `{name}'");
        }
        if self.scopes.is_empty() {
            self.scopes.push(MacroScope {
                depth: 0,
                macros: IndexMap::new(),
            });
        }
        let scope = self.scopes.last_mut().expect("a macro scope exists at this point");
        scope.macros.insert(name.to_owned(), node.clone());
    }

    /// Remembers `(let|mut|set name (fun (args) ...))` for `argcount`.
    fn register_func_def(&mut self, node: &Node) -> Result<(), Error> {
        let children = node.children();
        if !matches!(node.value, NodeValue::List(_))
            || children.len() != 3
            || !matches!(
                children[0].keyword(),
                Some(Keyword::Let | Keyword::Mut | Keyword::Set)
            )
        {
            return Ok(());
        }
        let inner = &children[2];
        if inner.children().first().and_then(Node::keyword) != Some(Keyword::Fun) {
            return Ok(());
        }
        match children[1].symbol_name() {
            Some(name) => {
                self.defined_functions
                    .insert(name.to_owned(), inner.children()[1].clone());
                Ok(())
            }
            None => Err(macro_error(
                format!(
                    "can not use a {} to define a variable",
                    children[1].type_name()
                ),
                &children[1],
            )),
        }
    }

    fn find_nearest_macro(&self, name: &str) -> Option<&Node> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.macros.get(name))
    }

    fn delete_nearest_macro(&mut self, name: &str) {
        for scope in self.scopes.iter_mut().rev() {
            if scope.macros.shift_remove(name).is_some() {
                return;
            }
        }
    }

    // ------------------------------------------------------------------
    // executors
    // ------------------------------------------------------------------

    /// Applies the first matching executor; true if the node was rewritten.
    fn apply_macro(&mut self, node: &mut Node, depth: u32) -> Result<bool, Error> {
        if depth > MAX_MACRO_PROCESSING_DEPTH {
            return Err(macro_error(
                format!(
                    "max macro processing depth reached ({MAX_MACRO_PROCESSING_DEPTH}); a macro may be trying to evaluate itself"
                ),
                node,
            ));
        }

        // constant macro on a bare symbol
        if let NodeValue::Symbol(name) = &node.value {
            if let Some(definition) = self.find_nearest_macro(name)
                && definition.children().len() == 2
            {
                let replacement = definition.children()[1].clone();
                replace_keeping_pos(node, replacement);
                return Ok(true);
            }
            return Ok(false);
        }

        // $if
        if matches!(node.value, NodeValue::Macro(_))
            && node.children().first().and_then(Node::keyword) == Some(Keyword::If)
        {
            return self.apply_conditional(node, depth);
        }

        // function macro call site
        if matches!(node.value, NodeValue::List(_))
            && let Some(name) = node.children().first().and_then(Node::symbol_name)
        {
            let name = name.to_owned();
            return self.apply_function(node, &name, depth);
        }

        Ok(false)
    }

    fn apply_conditional(&mut self, node: &mut Node, depth: u32) -> Result<bool, Error> {
        if node.children().len() < 3 {
            return Err(macro_error("$if needs a condition and a truthy branch", node));
        }
        let condition = self.evaluate(node.children()[1].clone(), depth + 1, true)?;
        if self.is_truthy(&condition)? {
            let branch = node.children()[2].clone();
            replace_keeping_pos(node, branch);
        } else if node.children().len() > 3 {
            let branch = node.children()[3].clone();
            replace_keeping_pos(node, branch);
        } else {
            node.value = NodeValue::Unused(String::new());
            return Ok(true);
        }
        self.apply_macro(node, depth + 1)?;
        // the selected branch may itself define a macro
        if matches!(node.value, NodeValue::Macro(_))
            && node.children().first().is_some_and(|c| c.symbol_name().is_some())
        {
            let definition = node.clone();
            self.register_macro(&definition)?;
        }
        Ok(true)
    }

    fn apply_function(&mut self, node: &mut Node, name: &str, depth: u32) -> Result<bool, Error> {
        let Some(definition) = self.find_nearest_macro(name).cloned() else {
            if PREDEFINED_MACROS.contains(&name) {
                let evaluated = self.evaluate(node.clone(), depth + 1, false)?;
                replace_keeping_pos(node, evaluated);
                return Ok(true);
            }
            return Ok(false);
        };

        // constant macro used in head position
        if definition.children().len() == 2 {
            let mut head = node.children()[0].clone();
            self.apply_macro(&mut head, depth + 1)?;
            node.children_mut()[0] = head;
            return Ok(true);
        }
        if definition.children().len() != 3 {
            return Ok(false);
        }

        let params = definition.children()[1].children().to_vec();
        let positional = params
            .iter()
            .filter(|p| matches!(p.value, NodeValue::Symbol(_)))
            .count();
        let has_spread = params
            .last()
            .is_some_and(|p| matches!(p.value, NodeValue::Spread(_)));
        let provided = node.children().len() - 1;
        if provided < positional || (!has_spread && provided > positional) {
            return Err(macro_error(
                format!("macro `{name}' got {provided} argument(s) but needed {positional}"),
                node,
            ));
        }

        // bind call-site arguments to parameters; the spread collects the
        // rest into a (list ...) node
        let mut bindings: AHashMap<String, Node> = AHashMap::new();
        let mut param_index = 0;
        for argument in &node.children()[1..] {
            match &params[param_index].value {
                NodeValue::Symbol(param) => {
                    bindings.insert(param.clone(), argument.clone());
                    param_index += 1;
                }
                NodeValue::Spread(param) => {
                    bindings
                        .entry(param.clone())
                        .or_insert_with(|| list_marker_node(argument))
                        .children_mut()
                        .push(argument.clone());
                }
                _ => unreachable!("macro parameters are symbols or spreads"),
            }
        }
        if has_spread
            && let NodeValue::Spread(param) = &params[params.len() - 1].value
        {
            bindings
                .entry(param.clone())
                .or_insert_with(|| list_marker_node(node));
        }

        let mut body = definition.children()[2].clone();
        self.unify(&bindings, &mut body, 0)?;
        let evaluated = self.evaluate(body, depth + 1, false)?;
        replace_keeping_pos(node, evaluated);
        self.apply_macro(node, depth + 1)?;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // substitution
    // ------------------------------------------------------------------

    /// Depth-first substitution of bound parameters, splicing spreads into
    /// their parent list.
    fn unify(
        &self,
        bindings: &AHashMap<String, Node>,
        target: &mut Node,
        depth: u32,
    ) -> Result<(), Error> {
        if depth > MAX_MACRO_UNIFICATION_DEPTH {
            return Err(macro_error(
                format!(
                    "max macro unification depth reached ({MAX_MACRO_UNIFICATION_DEPTH}); a macro may be trying to evaluate itself"
                ),
                target,
            ));
        }

        if let NodeValue::Symbol(name) = &target.value {
            if let Some(bound) = bindings.get(name) {
                *target = bound.clone();
            }
            return Ok(());
        }
        if !target.is_list_like() {
            return Ok(());
        }

        let mut i = 0;
        while i < target.children().len() {
            if let NodeValue::Spread(name) = &target.children()[i].value {
                let Some(bound) = bindings.get(name.as_str()) else {
                    return Err(macro_error(
                        format!("can not unify a Spread: `{name}' is not a macro parameter"),
                        &target.children()[i],
                    ));
                };
                if !matches!(bound.value, NodeValue::List(_)) {
                    return Err(macro_error(
                        format!("can not unify a {} to a Spread", bound.type_name()),
                        bound,
                    ));
                }
                // skip the leading `list' marker and splice the elements
                let elements: Vec<Node> = bound.children()[1..].to_vec();
                let count = elements.len();
                target.children_mut().splice(i..=i, elements);
                i += count;
            } else {
                self.unify(bindings, &mut target.children_mut()[i], depth + 1)?;
                i += 1;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // compile-time evaluation
    // ------------------------------------------------------------------

    /// Evaluates the compile-time sub-language. `is_not_body` enables the
    /// arithmetic/comparison folds, which only apply inside conditions.
    fn evaluate(&mut self, node: Node, depth: u32, is_not_body: bool) -> Result<Node, Error> {
        let mut node = node;

        if let NodeValue::Symbol(name) = &node.value {
            if let Some(definition) = self.find_nearest_macro(name)
                && definition.children().len() == 2
            {
                return Ok(definition.children()[1].clone());
            }
            return Ok(node);
        }

        if matches!(node.value, NodeValue::List(_))
            && node.children().len() > 1
            && node.children()[0].symbol_name().is_some()
        {
            let name = node.children()[0]
                .symbol_name()
                .expect("checked above")
                .to_owned();
            let argcount = node.children().len() - 1;

            if self.find_nearest_macro(&name).is_some() {
                let mut head = node.children()[0].clone();
                self.apply_macro(&mut head, depth + 1)?;
                if matches!(head.value, NodeValue::Unused(_)) {
                    node.children_mut().remove(0);
                } else {
                    node.children_mut()[0] = head;
                }
            } else {
                match name.as_str() {
                    "=" | "!=" | "<" | ">" | "<=" | ">=" if is_not_body => {
                        check_macro_arg_count(&node, 2, &name, "condition")?;
                        let one = self.evaluate(node.children()[1].clone(), depth + 1, is_not_body)?;
                        let two = self.evaluate(node.children()[2].clone(), depth + 1, is_not_body)?;
                        let truth = match name.as_str() {
                            "=" => nodes_equal(&one, &two),
                            "!=" => !nodes_equal(&one, &two),
                            "<" => node_less(&one, &two),
                            ">" => !node_less(&one, &two) && !nodes_equal(&one, &two),
                            "<=" => node_less(&one, &two) || nodes_equal(&one, &two),
                            ">=" => !node_less(&one, &two),
                            _ => unreachable!(),
                        };
                        return Ok(bool_node(truth, &node));
                    }
                    "+" | "-" | "*" | "/" if is_not_body => {
                        check_macro_arg_count(&node, 2, &name, "operator")?;
                        let one = self.evaluate(node.children()[1].clone(), depth + 1, is_not_body)?;
                        let two = self.evaluate(node.children()[2].clone(), depth + 1, is_not_body)?;
                        // folds only when both operands are numbers
                        if let (NodeValue::Number(a), NodeValue::Number(b)) = (&one.value, &two.value) {
                            let folded = match name.as_str() {
                                "+" => a + b,
                                "-" => a - b,
                                "*" => a * b,
                                "/" => a / b,
                                _ => unreachable!(),
                            };
                            return Ok(number_node(folded, &node));
                        }
                        return Ok(node);
                    }
                    "not" if is_not_body => {
                        check_macro_arg_count(&node, 1, "not", "condition")?;
                        let value = self.evaluate(node.children()[1].clone(), depth + 1, is_not_body)?;
                        return Ok(bool_node(!self.is_truthy(&value)?, &node));
                    }
                    "and" if is_not_body => {
                        if node.children().len() < 3 {
                            return Err(macro_error(
                                format!("interpreting an `and' chain with {argcount} arguments, expected at least 2"),
                                &node,
                            ));
                        }
                        for child in node.children()[1..].to_vec() {
                            let value = self.evaluate(child, depth + 1, is_not_body)?;
                            if !self.is_truthy(&value)? {
                                return Ok(bool_node(false, &node));
                            }
                        }
                        return Ok(bool_node(true, &node));
                    }
                    "or" if is_not_body => {
                        if node.children().len() < 3 {
                            return Err(macro_error(
                                format!("interpreting an `or' chain with {argcount} arguments, expected at least 2"),
                                &node,
                            ));
                        }
                        for child in node.children()[1..].to_vec() {
                            let value = self.evaluate(child, depth + 1, is_not_body)?;
                            if self.is_truthy(&value)? {
                                return Ok(bool_node(true, &node));
                            }
                        }
                        return Ok(bool_node(false, &node));
                    }
                    "len" => {
                        if node.children().len() > 2 {
                            return Err(macro_error(
                                format!("when expanding `len' inside a macro, got {argcount} arguments, expected 1"),
                                &node,
                            ));
                        }
                        let target = &node.children()[1];
                        if matches!(target.value, NodeValue::List(_)) && self.is_const_eval(target) {
                            let length = list_payload_len(target);
                            return Ok(number_node(length as f64, &node));
                        }
                    }
                    "empty?" => {
                        if node.children().len() > 2 {
                            return Err(macro_error(
                                format!("when expanding `empty?' inside a macro, got {argcount} arguments, expected 1"),
                                &node,
                            ));
                        }
                        let target = &node.children()[1];
                        if matches!(target.value, NodeValue::List(_)) && self.is_const_eval(target) {
                            return Ok(bool_node(list_payload_len(target) == 0, &node));
                        }
                    }
                    "@" => {
                        check_macro_arg_count(&node, 2, "@", "")?;
                        let sublist = self.evaluate(node.children()[1].clone(), depth + 1, is_not_body)?;
                        let index = self.evaluate(node.children()[2].clone(), depth + 1, is_not_body)?;
                        if let (NodeValue::List(items), NodeValue::Number(n)) =
                            (&sublist.value, &index.value)
                        {
                            return index_list(items, *n, &node);
                        }
                    }
                    "head" => {
                        if node.children().len() > 2 {
                            return Err(macro_error(
                                format!("when expanding `head' inside a macro, got {argcount} arguments, expected 1"),
                                &node,
                            ));
                        }
                        if matches!(node.children()[1].value, NodeValue::List(_)) {
                            return Ok(self.eval_head(&node));
                        }
                    }
                    "tail" => {
                        if node.children().len() > 2 {
                            return Err(macro_error(
                                format!("when expanding `tail' inside a macro, got {argcount} arguments, expected 1"),
                                &node,
                            ));
                        }
                        if matches!(node.children()[1].value, NodeValue::List(_)) {
                            return Ok(eval_tail(&node));
                        }
                    }
                    "symcat" => return self.eval_symcat(node, depth),
                    "argcount" => return self.eval_argcount(&node),
                    "$repr" => {
                        let repr = node.children()[1].repr();
                        return Ok(with_pos(NodeValue::String(repr), &node));
                    }
                    "$paste" => {
                        if node.children().len() != 2 {
                            return Err(macro_error(
                                format!("when expanding `$paste', expected one argument, got {argcount} arguments"),
                                &node,
                            ));
                        }
                        return Ok(node.children()[1].clone());
                    }
                    _ => {}
                }
            }
        }

        if matches!(node.value, NodeValue::List(_)) && !node.children().is_empty() {
            let children = std::mem::take(node.children_mut());
            let mut evaluated = Vec::with_capacity(children.len());
            for child in children {
                let mut value = self.evaluate(child, depth + 1, is_not_body)?;
                value.set_pos_from(&node);
                evaluated.push(value);
            }
            *node.children_mut() = evaluated;
        }

        if let NodeValue::Spread(name) = &node.value {
            return Err(macro_error(format!("found an unevaluated spread: `{name}'"), &node));
        }
        Ok(node)
    }

    fn eval_head(&mut self, node: &Node) -> Node {
        let sublist = &node.children()[1];
        let children = sublist.children();
        if starts_with_list_marker(sublist) {
            if children.len() > 1 {
                let mut out = children[1].clone();
                out.set_pos_from(node);
                out
            } else {
                with_pos(NodeValue::Symbol("nil".to_owned()), node)
            }
        } else if children.is_empty() {
            with_pos(NodeValue::Symbol("nil".to_owned()), node)
        } else {
            let mut out = children[0].clone();
            out.set_pos_from(node);
            out
        }
    }

    fn eval_symcat(&mut self, node: Node, depth: u32) -> Result<Node, Error> {
        let argcount = node.children().len() - 1;
        if node.children().len() <= 2 {
            return Err(macro_error(
                format!("when expanding `symcat', expected at least 2 arguments, got {argcount} arguments"),
                &node,
            ));
        }
        let Some(base) = node.children()[1].symbol_name() else {
            return Err(macro_error(
                format!(
                    "when expanding `symcat', expected the first argument to be a Symbol, got a {}",
                    node.children()[1].type_name()
                ),
                &node,
            ));
        };

        let mut symbol = base.to_owned();
        for child in node.children()[2..].to_vec() {
            let evaluated = self.evaluate(child, depth + 1, true)?;
            match &evaluated.value {
                // no dots in identifiers: numbers concatenate as integers
                NodeValue::Number(n) => symbol.push_str(&format!("{}", *n as i64)),
                NodeValue::String(text) | NodeValue::Symbol(text) => symbol.push_str(text),
                _ => {
                    return Err(macro_error(
                        format!(
                            "when expanding `symcat', expected either a Number, String or Symbol, got a {}",
                            evaluated.type_name()
                        ),
                        &evaluated,
                    ));
                }
            }
        }
        Ok(with_pos(NodeValue::Symbol(symbol), &node))
    }

    fn eval_argcount(&mut self, node: &Node) -> Result<Node, Error> {
        let target = &node.children()[1];
        if let Some(name) = target.symbol_name() {
            return match self.defined_functions.get(name) {
                Some(args) => Ok(number_node(args.children().len() as f64, node)),
                None => Err(macro_error(
                    format!("when expanding `argcount', expected a known function name, got unbound variable {name}"),
                    target,
                )),
            };
        }
        if target.children().first().and_then(Node::keyword) == Some(Keyword::Fun)
            && target.children().len() == 3
        {
            return Ok(number_node(target.children()[1].children().len() as f64, node));
        }
        Err(macro_error(
            format!(
                "when trying to apply `argcount', got a {} instead of a Symbol or Function",
                target.type_name()
            ),
            target,
        ))
    }

    // ------------------------------------------------------------------
    // predicates
    // ------------------------------------------------------------------

    fn is_truthy(&self, node: &Node) -> Result<bool, Error> {
        match &node.value {
            NodeValue::Symbol(name) if name == "true" => Ok(true),
            NodeValue::Symbol(name) if name == "false" || name == "nil" => Ok(false),
            NodeValue::Number(n) => Ok(*n != 0.0),
            NodeValue::String(text) => Ok(!text.is_empty()),
            NodeValue::Spread(_) => Err(macro_error(
                "can not determine the truth value of a spread symbol",
                node,
            )),
            _ => Ok(false),
        }
    }

    /// True when the node only references things known at expansion time.
    fn is_const_eval(&self, node: &Node) -> bool {
        match &node.value {
            NodeValue::Symbol(name) => {
                OPERATORS.contains(&name.as_str())
                    || builtins::builtin_index(name).is_some()
                    || self.find_nearest_macro(name).is_some()
                    || name == "list"
            }
            NodeValue::List(children) => children.iter().all(|child| self.is_const_eval(child)),
            NodeValue::Capture(_) | NodeValue::Field(_) => false,
            _ => true,
        }
    }
}

// ----------------------------------------------------------------------
// helpers
// ----------------------------------------------------------------------

fn macro_error(message: impl Into<String>, node: &Node) -> Error {
    Error::new(ErrorKind::MacroProcessing, message)
        .with_loc(SourceLoc::new(node.filename.as_ref(), node.line, node.col))
}

fn check_macro_arg_count(node: &Node, expected: usize, name: &str, kind: &str) -> Result<(), Error> {
    let argcount = node.children().len() - 1;
    if argcount != expected {
        let kind = if kind.is_empty() {
            String::new()
        } else {
            format!(" {kind}")
        };
        return Err(macro_error(
            format!("interpreting a `{name}'{kind} with {argcount} arguments, expected {expected}"),
            node,
        ));
    }
    Ok(())
}

/// Replaces the node's payload while keeping its original position.
fn replace_keeping_pos(node: &mut Node, replacement: Node) {
    let filename = node.filename.clone();
    let line = node.line;
    let col = node.col;
    *node = replacement;
    node.filename = filename;
    node.line = line;
    node.col = col;
}

fn with_pos(value: NodeValue, origin: &Node) -> Node {
    let mut node = Node::synthetic(value);
    node.set_pos_from(origin);
    node
}

fn bool_node(truth: bool, origin: &Node) -> Node {
    with_pos(
        NodeValue::Symbol(if truth { "true" } else { "false" }.to_owned()),
        origin,
    )
}

fn number_node(value: f64, origin: &Node) -> Node {
    with_pos(NodeValue::Number(value), origin)
}

/// `(list ...)` node seeded with just the marker symbol.
fn list_marker_node(origin: &Node) -> Node {
    with_pos(
        NodeValue::List(vec![with_pos(NodeValue::Symbol("list".to_owned()), origin)]),
        origin,
    )
}

fn starts_with_list_marker(node: &Node) -> bool {
    node.children().first().and_then(Node::symbol_name) == Some("list")
}

/// Element count of a list node, not counting a leading `list' marker.
fn list_payload_len(node: &Node) -> usize {
    let len = node.children().len();
    if starts_with_list_marker(node) { len - 1 } else { len }
}

fn eval_tail(node: &Node) -> Node {
    let sublist = &node.children()[1];
    if starts_with_list_marker(sublist) {
        let mut out = sublist.clone();
        if out.children().len() > 1 {
            out.children_mut().remove(1);
        }
        out.set_pos_from(node);
        out
    } else if sublist.children().is_empty() {
        list_marker_node(node)
    } else {
        let mut out = sublist.clone();
        out.children_mut().remove(0);
        out.set_pos_from(node);
        out
    }
}

fn index_list(items: &[Node], index: f64, origin: &Node) -> Result<Node, Error> {
    let size = items.len();
    let mut real_size = size;
    #[expect(clippy::cast_possible_truncation, reason = "indices are small integers")]
    let mut idx = index as i64;

    // a leading `list' marker is not addressable
    if size > 0 && items[0].symbol_name() == Some("list") {
        real_size -= 1;
        if idx >= 0 {
            idx += 1;
        }
    }

    let resolved = if idx >= 0 && (idx as usize) < size {
        Some(idx as usize)
    } else if idx < 0 {
        let wrapped = size as i64 + idx;
        (wrapped >= 0 && (wrapped as usize) < size).then_some(wrapped as usize)
    } else {
        None
    };

    match resolved {
        Some(i) => {
            let mut out = items[i].clone();
            out.set_pos_from(origin);
            Ok(out)
        }
        None => Err(macro_error(
            format!("index ({index}) out of range (list size: {real_size})"),
            origin,
        )),
    }
}

fn nodes_equal(a: &Node, b: &Node) -> bool {
    a.value == b.value
}

fn node_less(a: &Node, b: &Node) -> bool {
    match (&a.value, &b.value) {
        (NodeValue::Number(x), NodeValue::Number(y)) => x < y,
        (NodeValue::String(x), NodeValue::String(y)) | (NodeValue::Symbol(x), NodeValue::Symbol(y)) => {
            x < y
        }
        _ => false,
    }
}

/// Inlines the children of a begin block sitting at `node.children[i]`.
fn splice_begin(node: &mut Node, i: usize) {
    if !node.is_list_like() || !node.children()[i].is_begin_block() {
        return;
    }
    let block = node.children()[i].clone();
    let body: Vec<Node> = block.children()[1..].to_vec();
    node.children_mut().splice(i..=i, body);
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::parser::parse;

    fn expand_source(code: &str) -> Node {
        let parsed = parse(code, "test.ark").expect("parse failed");
        expand(parsed.ast, 0).expect("expansion failed")
    }

    fn expand_err(code: &str) -> Error {
        let parsed = parse(code, "test.ark").expect("parse failed");
        expand(parsed.ast, 0).expect_err("expected expansion error")
    }

    #[test]
    fn constant_macro_substitutes_symbol() {
        let ast = expand_source("($ answer 42)\n(let x answer)");
        let binding = &ast.children()[1];
        assert_eq!(binding.children()[2].value, NodeValue::Number(42.0));
    }

    #[test]
    fn macro_definitions_are_removed_from_the_tree() {
        let ast = expand_source("($ answer 42)\n(let x answer)");
        assert_eq!(ast.children().len(), 2); // begin + let
    }

    #[test]
    fn function_macro_binds_arguments() {
        let ast = expand_source("($ twice (x) (* x 2))\n(let y (twice 21))");
        let value = &ast.children()[1].children()[2];
        assert_eq!(value.repr(), "(* 21.0 2.0)");
    }

    #[test]
    fn conditional_macro_picks_truthy_branch() {
        let ast = expand_source("($if (= 1 1) (let a 1) (let a 2))");
        assert_eq!(ast.children()[1].repr(), "(let a 1.0)");
    }

    #[test]
    fn conditional_macro_without_else_vanishes() {
        let ast = expand_source("($if (= 1 2) (let a 1))\n(let b 2)");
        assert_eq!(ast.children().len(), 2);
        assert_eq!(ast.children()[1].repr(), "(let b 2.0)");
    }

    #[test]
    fn spread_binds_remaining_arguments() {
        let ast = expand_source("($ rest-len (x ...rest) (len rest))\n(let n (rest-len 1 2 3))");
        let value = &ast.children()[1].children()[2];
        assert_eq!(value.value, NodeValue::Number(2.0));
    }

    #[test]
    fn spread_splices_into_sibling_list() {
        let ast = expand_source("($ wrap (...rest) [...rest])\n(let l (wrap 1 2 3))");
        let value = &ast.children()[1].children()[2];
        assert_eq!(value.repr(), "(list 1.0 2.0 3.0)");
    }

    #[test]
    fn recursive_macro_with_spread_terminates() {
        // recursive sum macro: each round re-spreads one argument fewer
        let ast = expand_source(
            "($ sum (x ...rest) ($if (= (len rest) 1) (+ x (@ rest 0)) (+ x (sum ...rest))))\n(let s (sum 1 2 3))",
        );
        let value = &ast.children()[1].children()[2];
        // `@` on the final pair stays runtime code; arithmetic in bodies is
        // not folded
        assert_eq!(value.repr(), "(+ 1.0 (+ 2.0 (@ (list 3.0) 0.0)))");
    }

    #[test]
    fn undef_removes_macro() {
        let parsed = parse("($ a 1)\n($undef a)\n(let x a)", "test.ark").expect("parse failed");
        let ast = expand(parsed.ast, 0).expect("expansion failed");
        // `a` is no longer a macro, stays a symbol for the resolver to reject
        assert_eq!(ast.children()[1].children()[2].symbol_name(), Some("a"));
    }

    #[test]
    fn expansion_is_idempotent_at_fixed_point() {
        let code = "($ twice (x) (* x 2))\n(let y (twice 21))";
        let once = expand_source(code);
        let twice = expand(once.clone(), 0).expect("second expansion failed");
        assert_eq!(once, twice);
    }

    #[test]
    fn multiple_spreads_are_rejected() {
        let err = expand_err("($ bad (...a ...b) a)");
        assert_eq!(err.kind(), ErrorKind::MacroProcessing);
    }

    #[test]
    fn too_few_macro_arguments_error() {
        let err = expand_err("($ two (a b) (+ a b))\n(two 1)");
        assert!(err.message().contains("argument"));
    }

    #[test]
    fn symcat_builds_identifiers() {
        let ast = expand_source("($ make (n) (let (symcat var n) n))\n(make 1)");
        assert_eq!(ast.children()[1].children()[1].symbol_name(), Some("var1"));
    }

    #[test]
    fn argcount_answers_for_known_functions() {
        let ast = expand_source("(let f (fun (a b c) a))\n(let n (argcount f))");
        assert_eq!(ast.children()[2].children()[2].value, NodeValue::Number(3.0));
    }

    #[test]
    fn repr_quotes_the_ast() {
        let ast = expand_source("(let s ($repr (+ 1 2)))");
        assert_eq!(
            ast.children()[1].children()[2].value,
            NodeValue::String("(+ 1.0 2.0)".to_owned())
        );
    }

    #[test]
    fn paste_passes_through_unevaluated() {
        let ast = expand_source("($ three 3)\n(let x ($paste three))");
        assert_eq!(ast.children()[1].children()[2].symbol_name(), Some("three"));
    }

    #[test]
    fn macro_scope_ends_with_its_block() {
        let ast = expand_source("(begin ($ local 1) (let a local))\n(let b local)");
        // inside the block the macro applies; outside it stays a bare symbol
        let block = &ast.children()[1];
        assert_eq!(block.children()[1].children()[2].value, NodeValue::Number(1.0));
        assert_eq!(ast.children()[2].children()[2].symbol_name(), Some("local"));
    }

    #[test]
    fn runaway_recursion_is_capped() {
        let err = expand_err("($ loop (x) (loop x))\n(loop 1)");
        assert!(err.message().contains("depth"));
    }
}
