//! AST cells produced by the parser, rewritten by the macro expander and
//! consumed read-only from name resolution onward.

use std::fmt::{self, Write};
use std::rc::Rc;

use strum::Display;

/// The closed keyword set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Keyword {
    If,
    Let,
    Mut,
    Set,
    Fun,
    While,
    Begin,
    Import,
    Del,
}

impl Keyword {
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "if" => Some(Self::If),
            "let" => Some(Self::Let),
            "mut" => Some(Self::Mut),
            "set" => Some(Self::Set),
            "fun" => Some(Self::Fun),
            "while" => Some(Self::While),
            "begin" => Some(Self::Begin),
            "import" => Some(Self::Import),
            "del" => Some(Self::Del),
            _ => None,
        }
    }
}

/// Payload of a [`Node`].
///
/// List-like variants (`List`, `Macro`, `Field`) carry child sequences;
/// `Symbol`, `Capture`, `String`, `Spread` and `Unused` carry text; `Number`
/// carries a double. `Unused` marks a consumed macro definition awaiting
/// removal from its parent list.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeValue {
    Symbol(String),
    Capture(String),
    Keyword(Keyword),
    String(String),
    Number(f64),
    List(Vec<Node>),
    Macro(Vec<Node>),
    Field(Vec<Node>),
    Spread(String),
    Unused(String),
}

/// One AST cell: payload, source position, and optionally the comments that
/// surrounded it in the source.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub value: NodeValue,
    pub filename: Rc<str>,
    pub line: usize,
    pub col: usize,
    pub comment_before: Option<String>,
    pub comment_after: Option<String>,
}

impl Node {
    #[must_use]
    pub fn new(value: NodeValue, filename: Rc<str>, line: usize, col: usize) -> Self {
        Self {
            value,
            filename,
            line,
            col,
            comment_before: None,
            comment_after: None,
        }
    }

    /// A node carrying no real position, for synthesized cells.
    #[must_use]
    pub fn synthetic(value: NodeValue) -> Self {
        Self::new(value, Rc::from(""), 0, 0)
    }

    #[must_use]
    pub fn symbol(name: impl Into<String>) -> NodeValue {
        NodeValue::Symbol(name.into())
    }

    /// Copies position and filename from another node.
    pub fn set_pos_from(&mut self, other: &Self) {
        self.filename = Rc::clone(&other.filename);
        self.line = other.line;
        self.col = other.col;
    }

    #[must_use]
    pub fn is_list_like(&self) -> bool {
        matches!(
            self.value,
            NodeValue::List(_) | NodeValue::Macro(_) | NodeValue::Field(_)
        )
    }

    /// Children of a list-like node, empty slice otherwise.
    #[must_use]
    pub fn children(&self) -> &[Node] {
        match &self.value {
            NodeValue::List(list) | NodeValue::Macro(list) | NodeValue::Field(list) => list,
            _ => &[],
        }
    }

    pub fn children_mut(&mut self) -> &mut Vec<Node> {
        match &mut self.value {
            NodeValue::List(list) | NodeValue::Macro(list) | NodeValue::Field(list) => list,
            _ => panic!("children_mut called on a non-list node"),
        }
    }

    /// The symbol name, if this node is a Symbol.
    #[must_use]
    pub fn symbol_name(&self) -> Option<&str> {
        match &self.value {
            NodeValue::Symbol(name) => Some(name),
            _ => None,
        }
    }

    #[must_use]
    pub fn keyword(&self) -> Option<Keyword> {
        match &self.value {
            NodeValue::Keyword(kw) => Some(*kw),
            _ => None,
        }
    }

    /// True when this is a `(begin ...)` list.
    #[must_use]
    pub fn is_begin_block(&self) -> bool {
        matches!(&self.value, NodeValue::List(list)
            if list.first().and_then(Self::keyword) == Some(Keyword::Begin))
    }

    /// Short type name used in diagnostics.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match &self.value {
            NodeValue::Symbol(_) => "Symbol",
            NodeValue::Capture(_) => "Capture",
            NodeValue::Keyword(_) => "Keyword",
            NodeValue::String(_) => "String",
            NodeValue::Number(_) => "Number",
            NodeValue::List(_) => "List",
            NodeValue::Macro(_) => "Macro",
            NodeValue::Field(_) => "Field",
            NodeValue::Spread(_) => "Spread",
            NodeValue::Unused(_) => "Unused",
        }
    }

    /// Re-serializes the node as source text, for diagnostics and `$repr`.
    #[must_use]
    pub fn repr(&self) -> String {
        let mut out = String::new();
        self.write_repr(&mut out);
        out
    }

    fn write_repr(&self, out: &mut String) {
        match &self.value {
            NodeValue::Symbol(name) | NodeValue::Unused(name) => out.push_str(name),
            NodeValue::Capture(name) => {
                out.push('&');
                out.push_str(name);
            }
            NodeValue::Keyword(kw) => {
                let _ = write!(out, "{kw}");
            }
            NodeValue::String(text) => {
                let _ = write!(out, "{text:?}");
            }
            NodeValue::Number(n) => out.push_str(ryu::Buffer::new().format(*n)),
            NodeValue::Spread(name) => {
                out.push_str("...");
                out.push_str(name);
            }
            NodeValue::List(list) | NodeValue::Field(list) => {
                Self::write_seq(out, list, "(", ")");
            }
            NodeValue::Macro(list) => {
                Self::write_seq(out, list, "($ ", ")");
            }
        }
    }

    fn write_seq(out: &mut String, list: &[Node], open: &str, close: &str) {
        out.push_str(open);
        for (i, child) in list.iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            child.write_repr(out);
        }
        out.push_str(close);
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr())
    }
}

/// One `(import ...)` record collected by the parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Import {
    /// Dotted package segments, e.g. `["std", "math"]`.
    pub package: Vec<String>,
    /// Last package segment, the default namespace prefix.
    pub prefix: String,
    /// Selective import symbols (`:a :b`); empty for plain imports.
    pub symbols: Vec<String>,
    /// True for `(import pkg:*)`.
    pub glob: bool,
    pub line: usize,
    pub col: usize,
}

impl Import {
    /// Dotted form used as the de-duplication key, e.g. `"std.math"`.
    #[must_use]
    pub fn package_string(&self) -> String {
        self.package.join(".")
    }

    /// Relative file path without extension, e.g. `"std/math"`.
    #[must_use]
    pub fn package_path(&self) -> String {
        self.package.join("/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(name: &str) -> Node {
        Node::synthetic(NodeValue::Symbol(name.to_owned()))
    }

    #[test]
    fn repr_round_trips_simple_forms() {
        let node = Node::synthetic(NodeValue::List(vec![
            Node::synthetic(NodeValue::Keyword(Keyword::Let)),
            sym("x"),
            Node::synthetic(NodeValue::Number(42.0)),
        ]));
        assert_eq!(node.repr(), "(let x 42.0)");
    }

    #[test]
    fn repr_of_macro_and_spread() {
        let node = Node::synthetic(NodeValue::Macro(vec![
            sym("sum"),
            Node::synthetic(NodeValue::List(vec![
                sym("x"),
                Node::synthetic(NodeValue::Spread("rest".to_owned())),
            ])),
        ]));
        assert_eq!(node.repr(), "($ sum (x ...rest))");
    }

    #[test]
    fn begin_detection() {
        let node = Node::synthetic(NodeValue::List(vec![Node::synthetic(NodeValue::Keyword(
            Keyword::Begin,
        ))]));
        assert!(node.is_begin_block());
        assert!(!sym("begin-like").is_begin_block());
    }
}
