//! Parsed template representation.

use crate::ast::Block;
use std::collections::HashMap;
use std::sync::Arc;

/// A named block body together with the source text it was parsed from.
///
/// Bodies inherited from a parent template keep the parent's content so the
/// text spans inside them resolve against the right source.
#[derive(Debug, Clone)]
pub struct BlockSlot {
    pub body: Block,
    pub content: Arc<String>,
}

/// A parsed template: the owned source text, the root statement block, and
/// the block storage used by inheritance and `super()`.
///
/// After parsing a template that `extends` a parent, `blocks` holds the
/// effective body for every block name: the template's own definitions win,
/// and the parent's bodies fill in the names it does not define.
#[derive(Debug, Clone)]
pub struct Template {
    pub content: Arc<String>,
    pub root: Block,
    pub blocks: HashMap<String, BlockSlot>,
}
