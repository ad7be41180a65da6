//! AST node types.
//!
//! Nodes reference the template source by byte offset (and length where the
//! original text must be echoed in graceful mode); the owning [`Template`]
//! keeps the source alive for the renderer.
//!
//! [`Template`]: crate::Template

use crate::functions::{Callback, InplaceCallback, Op};
use serde_json::Value;

/// An expression tree node.
#[derive(Debug, Clone)]
pub enum Expression {
    Literal(LiteralNode),
    Data(DataNode),
    Function(FunctionNode),
}

impl Expression {
    pub fn pos(&self) -> usize {
        match self {
            Expression::Literal(node) => node.pos,
            Expression::Data(node) => node.pos,
            Expression::Function(node) => node.pos,
        }
    }
}

/// A constant precomputed at parse time.
#[derive(Debug, Clone)]
pub struct LiteralNode {
    pub value: Value,
    pub pos: usize,
}

/// A variable reference. `pointer` is the dotted name converted to the
/// slash-delimited lookup form (`user.name` becomes `/user/name`).
#[derive(Debug, Clone)]
pub struct DataNode {
    pub name: String,
    pub pointer: String,
    pub pos: usize,
}

impl DataNode {
    pub fn new(name: impl Into<String>, pos: usize) -> Self {
        let name = name.into();
        let pointer = format!("/{}", name.replace('.', "/"));
        DataNode { name, pointer, pos }
    }
}

/// An operator or function call. Callbacks are bound when the template is
/// parsed, from the function-storage snapshot current at that time.
#[derive(Clone)]
pub struct FunctionNode {
    pub name: String,
    pub op: Op,
    pub args: Vec<Expression>,
    pub callback: Option<Callback>,
    pub inplace_callback: Option<InplaceCallback>,
    pub pos: usize,
}

impl std::fmt::Debug for FunctionNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionNode")
            .field("name", &self.name)
            .field("op", &self.op)
            .field("args", &self.args)
            .field("callback", &self.callback.is_some())
            .field("inplace_callback", &self.inplace_callback.is_some())
            .field("pos", &self.pos)
            .finish()
    }
}

/// Root of a parsed expression. For expression output statements the span
/// covers the whole tag including delimiters, so graceful mode can echo the
/// original text on failure.
#[derive(Debug, Clone)]
pub struct ExpressionList {
    pub root: Option<Expression>,
    pub pos: usize,
    pub len: usize,
}

/// A sequence of statements.
#[derive(Debug, Clone, Default)]
pub struct Block {
    pub nodes: Vec<Statement>,
}

#[derive(Debug, Clone)]
pub enum Statement {
    /// Raw template text, a slice of the owning template's content.
    Text { pos: usize, len: usize },
    /// Expression output: `{{ … }}`.
    Expression(ExpressionList),
    If(IfStatement),
    ForArray(ForArrayStatement),
    ForObject(ForObjectStatement),
    Include { name: String, pos: usize },
    Extends { name: String, pos: usize },
    /// Reference to a named block; the body lives in the template's block
    /// storage so inheritance can substitute it.
    Block { name: String, pos: usize },
    Set(SetStatement),
    /// Verbatim passthrough: `{% raw %}…{% endraw %}`.
    Raw { pos: usize, len: usize },
}

#[derive(Debug, Clone)]
pub struct IfStatement {
    pub condition: ExpressionList,
    pub true_branch: Block,
    /// `else` body; an `else if` chain nests another [`IfStatement`] here.
    pub false_branch: Option<Block>,
    pub pos: usize,
}

#[derive(Debug, Clone)]
pub struct ForArrayStatement {
    pub value_name: String,
    pub condition: ExpressionList,
    pub body: Block,
    pub pos: usize,
}

#[derive(Debug, Clone)]
pub struct ForObjectStatement {
    pub key_name: String,
    pub value_name: String,
    pub condition: ExpressionList,
    pub body: Block,
    pub pos: usize,
}

#[derive(Debug, Clone)]
pub struct SetStatement {
    pub key: String,
    /// `key` converted to slash form, the assignment target in the overlay.
    pub pointer: String,
    pub expression: ExpressionList,
    pub pos: usize,
}
