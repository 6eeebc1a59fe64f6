//! Recursive-descent parser over the token stream.
//!
//! Produces a single top-level `(begin ...)` list holding every form, records
//! `(import ...)` declarations in a side channel, and reattaches comments to
//! the nearest following node (before) or the just-closed node (after).

use std::rc::Rc;

use crate::error::{Error, ErrorKind, SourceLoc, render_context};
use crate::lexer::{Comment, Token, TokenKind, tokenize};
use crate::node::{Import, Keyword, Node, NodeValue};

/// Output of [`parse`]: the AST plus the imports found while building it.
#[derive(Debug)]
pub struct ParseResult {
    pub ast: Node,
    pub imports: Vec<Import>,
}

/// Parses `code` into a top-level begin block.
pub fn parse(code: &str, filename: &str) -> Result<ParseResult, Error> {
    let stream = tokenize(code, filename)?;
    Parser::new(code, filename, stream.tokens, stream.comments).run()
}

struct Parser<'a> {
    code: &'a str,
    filename: Rc<str>,
    tokens: Vec<Token>,
    comments: Vec<Comment>,
    pos: usize,
    comment_pos: usize,
    imports: Vec<Import>,
    /// Non-zero while parsing macro bodies, where spreads and loose shapes
    /// are allowed.
    allow_macro_behavior: u32,
    last_line: usize,
}

impl<'a> Parser<'a> {
    fn new(code: &'a str, filename: &str, tokens: Vec<Token>, comments: Vec<Comment>) -> Self {
        Self {
            code,
            filename: Rc::from(filename),
            tokens,
            comments,
            pos: 0,
            comment_pos: 0,
            imports: Vec::new(),
            allow_macro_behavior: 0,
            last_line: 0,
        }
    }

    fn run(mut self) -> Result<ParseResult, Error> {
        let mut toplevel = vec![self.keyword_node(Keyword::Begin)];
        while !self.at_eof() {
            let node = self.parse_node()?;
            toplevel.push(node);
        }
        let mut ast = Node::new(NodeValue::List(toplevel), Rc::clone(&self.filename), 0, 0);
        // trailing comments belong to the last form
        if let Some(trailing) = self.take_comments_through(usize::MAX) {
            if let Some(last) = ast.children_mut().last_mut() {
                append_comment(&mut last.comment_after, &trailing);
            }
        }
        Ok(ParseResult {
            ast,
            imports: self.imports,
        })
    }

    // ------------------------------------------------------------------
    // node dispatch
    // ------------------------------------------------------------------

    /// Parses one node and binds surrounding comments to it.
    fn parse_node(&mut self) -> Result<Node, Error> {
        let before = self
            .peek()
            .map(|t| t.line)
            .and_then(|line| self.take_comments_through(line));
        let mut node = self.parse_bare_node()?;
        if let Some(comment) = before {
            append_comment(&mut node.comment_before, &comment);
        }
        // a comment on the closing line belongs to the node we just finished
        if self
            .comments
            .get(self.comment_pos)
            .is_some_and(|c| c.line == self.last_line)
        {
            let comment = self.comments[self.comment_pos].text.clone();
            self.comment_pos += 1;
            append_comment(&mut node.comment_after, &comment);
        }
        Ok(node)
    }

    fn parse_bare_node(&mut self) -> Result<Node, Error> {
        let token = self.next_token("expected a node")?;
        match token.kind {
            TokenKind::Grouping if token.text == "(" => self.parse_form(&token),
            TokenKind::Grouping if token.text == "[" => self.parse_list_sugar(&token),
            TokenKind::Grouping if token.text == "{" => self.parse_begin_sugar(&token),
            TokenKind::Shorthand if token.text == "'" => {
                let quoted = self.parse_node()?;
                Ok(self.list_at(
                    &token,
                    vec![self.symbol_node("quote", &token), quoted],
                ))
            }
            TokenKind::Shorthand => self.parse_macro_shorthand(&token),
            _ => self.parse_atom(token),
        }
    }

    /// Parses a `(...)` form, the opening token already consumed.
    fn parse_form(&mut self, open: &Token) -> Result<Node, Error> {
        if self.peek_is_grouping(")") {
            self.pos += 1;
            // () is nil
            return Ok(self.list_at(open, Vec::new()));
        }

        let head = self.peek_cloned("expected a form head")?;
        if head.kind == TokenKind::Keyword {
            self.pos += 1;
            let keyword = Keyword::from_name(&head.text)
                .ok_or_else(|| self.syntax_error("unknown keyword", &head))?;
            return match keyword {
                Keyword::If => self.parse_if(open, &head),
                Keyword::Let | Keyword::Mut | Keyword::Set => {
                    self.parse_let_mut_set(open, keyword, &head)
                }
                Keyword::Fun => self.parse_fun(open, &head),
                Keyword::While => self.parse_while(open, &head),
                Keyword::Begin => self.parse_begin(open),
                Keyword::Import => self.parse_import(open, &head),
                Keyword::Del => self.parse_del(open, &head),
            };
        }

        if head.kind == TokenKind::Identifier {
            match head.text.as_str() {
                "$" => {
                    self.pos += 1;
                    return self.parse_macro_definition(open, &head);
                }
                "$if" => {
                    self.pos += 1;
                    return self.parse_macro_condition(open);
                }
                "$undef" => {
                    self.pos += 1;
                    let name = self.expect_identifier("$undef needs a macro name")?;
                    let children = vec![
                        self.symbol_node("$undef", &head),
                        self.symbol_from(&name),
                    ];
                    self.expect_grouping(")", "$undef")?;
                    return Ok(Node::new(
                        NodeValue::Macro(children),
                        Rc::clone(&self.filename),
                        open.line,
                        open.col,
                    ));
                }
                _ => {}
            }
        }

        self.parse_call(open)
    }

    fn parse_if(&mut self, open: &Token, head: &Token) -> Result<Node, Error> {
        let mut children = vec![self.keyword_node_at(Keyword::If, head)];
        children.push(self.node_or_value("if needs a valid condition")?);
        children.push(self.node_or_value("expected a value for the truthy branch")?);
        if !self.peek_is_grouping(")") {
            children.push(self.node_or_value("expected a value for the falsy branch")?);
        } else if self.allow_macro_behavior == 0 {
            return Err(self.syntax_error("if requires an else branch outside of macros", head));
        }
        if !self.peek_is_grouping(")") {
            let stray = self.peek_cloned("unterminated if")?;
            return Err(self.syntax_error("too many arguments given to if", &stray));
        }
        self.expect_grouping(")", "if")?;
        Ok(self.list_at(open, children))
    }

    fn parse_let_mut_set(
        &mut self,
        open: &Token,
        keyword: Keyword,
        head: &Token,
    ) -> Result<Node, Error> {
        let mut children = vec![self.keyword_node_at(keyword, head)];

        if self.allow_macro_behavior > 0 {
            // inside a macro body the binding name may itself be generated
            let name = self.node_or_value("expected a symbol name")?;
            match &name.value {
                NodeValue::Symbol(_) | NodeValue::List(_) | NodeValue::Macro(_) | NodeValue::Spread(_) => {
                    children.push(name);
                }
                _ => {
                    return Err(self.syntax_error(
                        &format!(
                            "can not use a {} as a symbol name, even in a macro",
                            name.type_name()
                        ),
                        head,
                    ));
                }
            }
        } else {
            let name = self.next_token(&format!("{keyword} needs a symbol"))?;
            if name.kind != TokenKind::Identifier {
                return Err(self.syntax_error(&format!("{keyword} needs a symbol"), &name));
            }
            if keyword == Keyword::Set && self.peek().is_some_and(|t| t.kind == TokenKind::GetField) {
                return Err(self.syntax_error("can not set a field of a closure", &name));
            }
            children.push(self.symbol_from(&name));
        }

        children.push(self.node_or_value("expected a value")?);
        self.expect_grouping(")", &keyword.to_string())?;
        Ok(self.list_at(open, children))
    }

    fn parse_fun(&mut self, open: &Token, head: &Token) -> Result<Node, Error> {
        let mut children = vec![self.keyword_node_at(Keyword::Fun, head)];

        if self.allow_macro_behavior > 0 && !self.peek_is_grouping("(") {
            // argument list generated by the macro; `nil` stands for no args
            let args = self.node_or_value("expected an argument list")?;
            if args.symbol_name() == Some("nil") {
                children.push(self.list_at(head, Vec::new()));
            } else {
                children.push(args);
            }
        } else {
            children.push(self.parse_fun_args()?);
        }

        children.push(self.node_or_value("expected a body for the function")?);
        self.expect_grouping(")", "fun")?;
        Ok(self.list_at(open, children))
    }

    fn parse_fun_args(&mut self) -> Result<Node, Error> {
        let open = self.next_token("expected an argument list")?;
        if open.kind != TokenKind::Grouping || open.text != "(" {
            return Err(self.syntax_error("expected an argument list", &open));
        }
        let mut args = Vec::new();
        let mut has_captures = false;
        loop {
            let token = self.next_token("unterminated argument list")?;
            match token.kind {
                TokenKind::Grouping if token.text == ")" => break,
                TokenKind::Identifier => {
                    if has_captures {
                        return Err(self.syntax_error(
                            "captured variables should be at the end of the argument list",
                            &token,
                        ));
                    }
                    args.push(self.symbol_from(&token));
                }
                TokenKind::Capture => {
                    has_captures = true;
                    args.push(Node::new(
                        NodeValue::Capture(token.text.clone()),
                        Rc::clone(&self.filename),
                        token.line,
                        token.col,
                    ));
                }
                _ => return Err(self.syntax_error("expected an argument name", &token)),
            }
        }
        Ok(self.list_at(&open, args))
    }

    fn parse_while(&mut self, open: &Token, head: &Token) -> Result<Node, Error> {
        let children = vec![
            self.keyword_node_at(Keyword::While, head),
            self.node_or_value("while needs a valid condition")?,
            self.node_or_value("expected a body for the loop")?,
        ];
        self.expect_grouping(")", "while")?;
        Ok(self.list_at(open, children))
    }

    fn parse_begin(&mut self, open: &Token) -> Result<Node, Error> {
        let mut children = vec![self.keyword_node(Keyword::Begin)];
        while !self.peek_is_grouping(")") {
            children.push(self.parse_node()?);
        }
        self.expect_grouping(")", "begin")?;
        Ok(self.list_at(open, children))
    }

    fn parse_del(&mut self, open: &Token, head: &Token) -> Result<Node, Error> {
        let name = self.expect_identifier("del needs a symbol")?;
        let children = vec![self.keyword_node_at(Keyword::Del, head), self.symbol_from(&name)];
        self.expect_grouping(")", "del")?;
        Ok(self.list_at(open, children))
    }

    /// `(import a.b.c)`, `(import a.b:*)`, `(import a.b :x :y)`.
    fn parse_import(&mut self, open: &Token, head: &Token) -> Result<Node, Error> {
        let first = self.next_token("import expected a package name")?;
        if first.kind != TokenKind::Identifier {
            return Err(self.syntax_error("import expected a package name", &first));
        }

        let mut glob = false;
        let mut package = Vec::new();
        let mut push_segment = |text: &str, glob: &mut bool| {
            if let Some(stripped) = text.strip_suffix(":*") {
                *glob = true;
                package.push(stripped.to_owned());
            } else {
                package.push(text.to_owned());
            }
        };
        push_segment(&first.text, &mut glob);

        while !glob && self.peek().is_some_and(|t| t.kind == TokenKind::GetField) {
            let segment = self.next_token("package name expected after '.'")?;
            push_segment(&segment.text, &mut glob);
        }

        let mut symbols = Vec::new();
        while !glob && !self.peek_is_grouping(")") {
            let token = self.next_token("unterminated import")?;
            let symbol = token
                .text
                .strip_prefix(':')
                .filter(|s| !s.is_empty() && token.kind == TokenKind::Identifier);
            match symbol {
                Some("*") => {
                    return Err(self.syntax_error(
                        "glob patterns can not be separated from the package",
                        &token,
                    ));
                }
                Some(name) => symbols.push(name.to_owned()),
                None => {
                    return Err(self.syntax_error("expected a valid symbol to import", &token));
                }
            }
        }
        self.expect_grouping(")", "import")?;

        let prefix = package.last().cloned().unwrap_or_default();
        self.imports.push(Import {
            package: package.clone(),
            prefix,
            symbols: symbols.clone(),
            glob,
            line: head.line,
            col: head.col,
        });

        let package_nodes = package
            .iter()
            .map(|segment| self.symbol_node(segment, head))
            .collect();
        let mut children = vec![
            self.keyword_node_at(Keyword::Import, head),
            self.list_at(head, package_nodes),
        ];
        if glob {
            children.push(self.symbol_node("*", head));
        } else {
            let symbol_nodes = symbols.iter().map(|s| self.symbol_node(s, head)).collect();
            children.push(self.list_at(head, symbol_nodes));
        }
        Ok(self.list_at(open, children))
    }

    /// `($ name value)` or `($ name (args) body)`.
    fn parse_macro_definition(&mut self, open: &Token, head: &Token) -> Result<Node, Error> {
        let name = self.expect_identifier("$ needs a symbol to declare a macro")?;
        let mut children = vec![self.symbol_from(&name)];

        let saved = self.pos;
        if let Some(args) = self.try_parse_macro_args()? {
            children.push(args);
            // a body must follow an argument list
            self.allow_macro_behavior += 1;
            let body = self.node_or_value(&format!(
                "expected a value while defining macro `{}'",
                name.text
            ));
            self.allow_macro_behavior -= 1;
            children.push(body?);
        } else {
            self.pos = saved;
            self.allow_macro_behavior += 1;
            let value = self.node_or_value(&format!(
                "expected an argument list, atom or node while defining macro `{}'",
                name.text
            ));
            self.allow_macro_behavior -= 1;
            children.push(value?);
        }

        self.expect_grouping(")", "macro definition")?;
        Ok(Node::new(
            NodeValue::Macro(children),
            Rc::clone(&self.filename),
            open.line,
            open.col,
        ))
    }

    /// Speculatively parses `(a b ...rest)`; `None` means "not an argument
    /// list" and the caller must backtrack.
    fn try_parse_macro_args(&mut self) -> Result<Option<Node>, Error> {
        if !self.peek_is_grouping("(") {
            return Ok(None);
        }
        let open = self.next_token("expected an argument list")?;
        let mut args = Vec::new();
        let mut names: Vec<String> = Vec::new();
        let mut seen_spread = false;
        loop {
            let token = self.next_token("unterminated macro argument list")?;
            match token.kind {
                TokenKind::Grouping if token.text == ")" => break,
                TokenKind::Identifier if !seen_spread => {
                    if names.contains(&token.text) {
                        return Err(self.syntax_error(
                            &format!(
                                "argument names must be unique, can not reuse `{}'",
                                token.text
                            ),
                            &token,
                        ));
                    }
                    names.push(token.text.clone());
                    args.push(self.symbol_from(&token));
                }
                TokenKind::Spread if !seen_spread => {
                    if names.contains(&token.text) {
                        return Err(self.syntax_error(
                            &format!(
                                "argument names must be unique, can not reuse `{}'",
                                token.text
                            ),
                            &token,
                        ));
                    }
                    seen_spread = true;
                    names.push(token.text.clone());
                    args.push(Node::new(
                        NodeValue::Spread(token.text.clone()),
                        Rc::clone(&self.filename),
                        token.line,
                        token.col,
                    ));
                }
                _ => return Ok(None),
            }
        }
        Ok(Some(self.list_at(&open, args)))
    }

    /// `($if cond then else?)`; the else branch stays optional here.
    fn parse_macro_condition(&mut self, open: &Token) -> Result<Node, Error> {
        self.allow_macro_behavior += 1;
        let result = (|| {
            let mut children = vec![self.keyword_node(Keyword::If)];
            children.push(self.node_or_value("$if needs a valid condition")?);
            children.push(self.node_or_value("expected a value for the truthy branch")?);
            if !self.peek_is_grouping(")") {
                children.push(self.node_or_value("expected a value for the falsy branch")?);
            }
            self.expect_grouping(")", "$if")?;
            Ok(Node::new(
                NodeValue::Macro(children),
                Rc::clone(&self.filename),
                open.line,
                open.col,
            ))
        })();
        self.allow_macro_behavior -= 1;
        result
    }

    /// `!{...}`: macro node in shorthand form.
    fn parse_macro_shorthand(&mut self, bang: &Token) -> Result<Node, Error> {
        let open = self.next_token("expected a block after `!'")?;
        if open.kind != TokenKind::Grouping || open.text != "{" {
            return Err(self.syntax_error("expected a block after `!'", &open));
        }
        self.allow_macro_behavior += 1;
        let result = (|| {
            let mut children = Vec::new();
            if self.peek().is_some_and(|t| t.kind == TokenKind::Keyword && t.text == "if") {
                self.pos += 1;
                children.push(self.keyword_node(Keyword::If));
            }
            while !self.peek_is_grouping("}") {
                children.push(self.node_or_value("unterminated macro block")?);
            }
            self.expect_grouping("}", "macro block")?;
            Ok(Node::new(
                NodeValue::Macro(children),
                Rc::clone(&self.filename),
                bang.line,
                bang.col,
            ))
        })();
        self.allow_macro_behavior -= 1;
        result
    }

    /// `(head args...)`: function/operator/builtin call or macro use.
    fn parse_call(&mut self, open: &Token) -> Result<Node, Error> {
        let head_token = self.peek_cloned("expected a function to call")?;
        let head = match head_token.kind {
            TokenKind::Identifier | TokenKind::Operator => {
                self.pos += 1;
                self.maybe_field(&head_token)?
            }
            TokenKind::Grouping | TokenKind::Shorthand => self.parse_bare_node()?,
            _ => return Err(self.syntax_error("expected a function to call", &head_token)),
        };

        let mut children = vec![head];
        while !self.peek_is_grouping(")") {
            children.push(self.node_or_value("unterminated function call")?);
        }
        self.expect_grouping(")", "function call")?;
        Ok(self.list_at(open, children))
    }

    fn parse_list_sugar(&mut self, open: &Token) -> Result<Node, Error> {
        let mut children = vec![self.symbol_node("list", open)];
        while !self.peek_is_grouping("]") {
            children.push(self.node_or_value("unterminated list literal")?);
        }
        self.expect_grouping("]", "list literal")?;
        Ok(self.list_at(open, children))
    }

    fn parse_begin_sugar(&mut self, open: &Token) -> Result<Node, Error> {
        let mut children = vec![self.keyword_node(Keyword::Begin)];
        while !self.peek_is_grouping("}") {
            children.push(self.parse_node()?);
        }
        self.expect_grouping("}", "block")?;
        Ok(self.list_at(open, children))
    }

    // ------------------------------------------------------------------
    // atoms
    // ------------------------------------------------------------------

    /// Parses either an atom or a nested node.
    fn node_or_value(&mut self, expectation: &str) -> Result<Node, Error> {
        let Some(token) = self.peek().cloned() else {
            return Err(self.eof_error(expectation));
        };
        match token.kind {
            TokenKind::Grouping if token.text == ")" || token.text == "}" || token.text == "]" => {
                Err(self.syntax_error(expectation, &token))
            }
            _ => self.parse_node(),
        }
    }

    fn parse_atom(&mut self, token: Token) -> Result<Node, Error> {
        match token.kind {
            TokenKind::Number => {
                let value: f64 = token
                    .text
                    .parse()
                    .map_err(|_| self.syntax_error("malformed number", &token))?;
                Ok(Node::new(
                    NodeValue::Number(value),
                    Rc::clone(&self.filename),
                    token.line,
                    token.col,
                ))
            }
            TokenKind::String => Ok(Node::new(
                NodeValue::String(token.text.clone()),
                Rc::clone(&self.filename),
                token.line,
                token.col,
            )),
            TokenKind::Identifier => self.maybe_field(&token),
            TokenKind::Spread => {
                if self.allow_macro_behavior == 0 {
                    return Err(
                        self.syntax_error("spread arguments are only allowed in macros", &token)
                    );
                }
                Ok(Node::new(
                    NodeValue::Spread(token.text.clone()),
                    Rc::clone(&self.filename),
                    token.line,
                    token.col,
                ))
            }
            TokenKind::Operator => {
                Err(self.syntax_error("operators are only allowed in head position", &token))
            }
            TokenKind::Capture => {
                Err(self.syntax_error("captures are only allowed in argument lists", &token))
            }
            _ => Err(self.syntax_error("unexpected token", &token)),
        }
    }

    /// Folds `base .f .g` token runs into a Field node.
    fn maybe_field(&mut self, base: &Token) -> Result<Node, Error> {
        let mut fields = Vec::new();
        while self.peek().is_some_and(|t| t.kind == TokenKind::GetField) {
            let field = self.next_token("expected a field name")?;
            fields.push(self.symbol_from(&field));
        }
        if fields.is_empty() {
            return Ok(self.symbol_from(base));
        }
        let mut children = vec![self.symbol_from(base)];
        children.append(&mut fields);
        Ok(Node::new(
            NodeValue::Field(children),
            Rc::clone(&self.filename),
            base.line,
            base.col,
        ))
    }

    // ------------------------------------------------------------------
    // token plumbing
    // ------------------------------------------------------------------

    fn at_eof(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_cloned(&self, expectation: &str) -> Result<Token, Error> {
        self.peek().cloned().ok_or_else(|| self.eof_error(expectation))
    }

    fn peek_is_grouping(&self, text: &str) -> bool {
        self.peek()
            .is_some_and(|t| t.kind == TokenKind::Grouping && t.text == text)
    }

    fn next_token(&mut self, expectation: &str) -> Result<Token, Error> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| self.eof_error(expectation))?;
        self.pos += 1;
        self.last_line = token.line;
        Ok(token)
    }

    fn expect_identifier(&mut self, expectation: &str) -> Result<Token, Error> {
        let token = self.next_token(expectation)?;
        if token.kind == TokenKind::Identifier {
            Ok(token)
        } else {
            Err(self.syntax_error(expectation, &token))
        }
    }

    fn expect_grouping(&mut self, text: &str, context: &str) -> Result<(), Error> {
        let token = self.next_token(&format!("missing `{text}' to close {context}"))?;
        if token.kind == TokenKind::Grouping && token.text == text {
            Ok(())
        } else {
            Err(self.syntax_error(&format!("missing `{text}' to close {context}"), &token))
        }
    }

    /// Joins and consumes comments located strictly before `line`.
    fn take_comments_through(&mut self, line: usize) -> Option<String> {
        let mut joined: Option<String> = None;
        while self
            .comments
            .get(self.comment_pos)
            .is_some_and(|c| c.line < line)
        {
            let text = self.comments[self.comment_pos].text.clone();
            self.comment_pos += 1;
            append_comment(&mut joined, &text);
        }
        joined
    }

    // ------------------------------------------------------------------
    // node construction helpers
    // ------------------------------------------------------------------

    fn keyword_node(&self, keyword: Keyword) -> Node {
        Node::new(NodeValue::Keyword(keyword), Rc::clone(&self.filename), 0, 0)
    }

    fn keyword_node_at(&self, keyword: Keyword, token: &Token) -> Node {
        Node::new(
            NodeValue::Keyword(keyword),
            Rc::clone(&self.filename),
            token.line,
            token.col,
        )
    }

    fn symbol_node(&self, name: &str, token: &Token) -> Node {
        Node::new(
            NodeValue::Symbol(name.to_owned()),
            Rc::clone(&self.filename),
            token.line,
            token.col,
        )
    }

    fn symbol_from(&self, token: &Token) -> Node {
        self.symbol_node(&token.text, token)
    }

    fn list_at(&self, token: &Token, children: Vec<Node>) -> Node {
        Node::new(
            NodeValue::List(children),
            Rc::clone(&self.filename),
            token.line,
            token.col,
        )
    }

    fn syntax_error(&self, message: &str, token: &Token) -> Error {
        Error::new(ErrorKind::Syntax, message)
            .with_loc(SourceLoc::new(self.filename.as_ref(), token.line, token.col))
            .with_context(render_context(
                self.code,
                token.line,
                token.col,
                token.text.chars().count(),
            ))
    }

    fn eof_error(&self, expectation: &str) -> Error {
        let loc = self
            .tokens
            .last()
            .map_or_else(|| SourceLoc::new(self.filename.as_ref(), 0, 0), |t| {
                SourceLoc::new(self.filename.as_ref(), t.line, t.col)
            });
        Error::new(
            ErrorKind::Parse,
            format!("no more token to consume: {expectation}"),
        )
        .with_loc(loc)
    }
}

fn append_comment(slot: &mut Option<String>, text: &str) {
    match slot {
        Some(existing) => {
            existing.push('\n');
            existing.push_str(text);
        }
        None => *slot = Some(text.to_owned()),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn parse_ok(code: &str) -> ParseResult {
        parse(code, "test.ark").expect("parse failed")
    }

    fn top(code: &str) -> Node {
        let result = parse_ok(code);
        result.ast.children()[1].clone()
    }

    #[test]
    fn toplevel_is_a_begin_block() {
        let result = parse_ok("(let a 1) (let b 2)");
        assert_eq!(result.ast.children()[0].keyword(), Some(Keyword::Begin));
        assert_eq!(result.ast.children().len(), 3);
    }

    #[test]
    fn every_node_carries_a_position() {
        fn check(node: &Node) {
            assert_eq!(node.filename.as_ref(), "test.ark");
            for child in node.children() {
                check(child);
            }
        }
        let result = parse_ok("(let f (fun (a &b) (+ a b)))\n(f 1)");
        for child in result.ast.children() {
            check(child);
        }
    }

    #[test]
    fn let_parses_to_three_children() {
        let node = top("(let x 42)");
        assert_eq!(node.children().len(), 3);
        assert_eq!(node.children()[0].keyword(), Some(Keyword::Let));
        assert_eq!(node.children()[1].symbol_name(), Some("x"));
        assert_eq!(node.children()[2].value, NodeValue::Number(42.0));
    }

    #[test]
    fn brackets_are_list_sugar() {
        let node = top("[1 2 3]");
        assert_eq!(node.children()[0].symbol_name(), Some("list"));
        assert_eq!(node.children().len(), 4);
    }

    #[test]
    fn braces_are_begin_sugar() {
        let node = top("{ (let a 1) a }");
        assert_eq!(node.children()[0].keyword(), Some(Keyword::Begin));
        assert_eq!(node.children().len(), 3);
    }

    #[test]
    fn quote_shorthand_wraps() {
        let node = top("'(+ 1 2)");
        assert_eq!(node.children()[0].symbol_name(), Some("quote"));
    }

    #[test]
    fn captures_must_come_last() {
        let err = parse("(fun (&a b) b)", "test.ark").expect_err("expected error");
        assert!(err.message().contains("end of the argument list"));
    }

    #[test]
    fn if_without_else_is_rejected_outside_macros() {
        let err = parse("(if true 1)", "test.ark").expect_err("expected error");
        assert!(err.message().contains("else"));
    }

    #[test]
    fn import_records_package_and_symbols() {
        let result = parse_ok("(import std.math :pi :cos)");
        assert_eq!(result.imports.len(), 1);
        let import = &result.imports[0];
        assert_eq!(import.package, vec!["std".to_owned(), "math".to_owned()]);
        assert_eq!(import.prefix, "math");
        assert_eq!(import.symbols, vec!["pi".to_owned(), "cos".to_owned()]);
        assert!(!import.glob);
    }

    #[test]
    fn glob_import() {
        let result = parse_ok("(import std.list:*)");
        assert!(result.imports[0].glob);
        assert_eq!(result.imports[0].package_string(), "std.list");
    }

    #[test]
    fn macro_definition_with_args_and_spread() {
        let node = top("($ sum (x ...rest) (+ x rest))");
        assert!(matches!(node.value, NodeValue::Macro(_)));
        let args = &node.children()[1];
        assert_eq!(args.children().len(), 2);
        assert!(matches!(args.children()[1].value, NodeValue::Spread(_)));
    }

    #[test]
    fn constant_macro_definition() {
        let node = top("($ answer 42)");
        assert!(matches!(node.value, NodeValue::Macro(_)));
        assert_eq!(node.children()[1].value, NodeValue::Number(42.0));
    }

    #[test]
    fn macro_condition_allows_missing_else() {
        let node = top("($if (= a b) 1)");
        assert!(matches!(node.value, NodeValue::Macro(_)));
        assert_eq!(node.children()[0].keyword(), Some(Keyword::If));
        assert_eq!(node.children().len(), 3);
    }

    #[test]
    fn field_access_chain() {
        let node = top("(closure.field 1)");
        let head = &node.children()[0];
        assert!(matches!(head.value, NodeValue::Field(_)));
        assert_eq!(head.children()[0].symbol_name(), Some("closure"));
        assert_eq!(head.children()[1].symbol_name(), Some("field"));
    }

    #[test]
    fn operator_outside_head_position_is_rejected() {
        let err = parse("(map + lst)", "test.ark").expect_err("expected error");
        assert!(err.message().contains("head position"));
    }

    #[test]
    fn set_on_field_is_rejected() {
        let err = parse("(set a.b 2)", "test.ark").expect_err("expected error");
        assert!(err.message().contains("field"));
    }

    #[test]
    fn comment_binds_to_following_node() {
        let result = parse_ok("# header\n(let a 1)");
        let node = &result.ast.children()[1];
        assert_eq!(node.comment_before.as_deref(), Some("header"));
    }

    #[test]
    fn trailing_comment_binds_to_previous_node() {
        let result = parse_ok("(let a 1) # bound after");
        let node = &result.ast.children()[1];
        assert_eq!(node.comment_after.as_deref(), Some("bound after"));
    }

    #[test]
    fn empty_parens_are_allowed() {
        let node = top("()");
        assert!(node.children().is_empty());
    }
}
