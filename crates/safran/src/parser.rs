//! Template parser.
//!
//! Statements are parsed by recursive descent over the lexer's token stream;
//! expressions by a shunting-yard pass over the linear token run up to the
//! tag close. Function calls are resolved against the function-storage
//! snapshot at parse time, and `include`/`extends` pull referenced templates
//! through a call-local cache that the environment merges into shared
//! storage once the whole parse succeeds.

use crate::ast::{
    Block, DataNode, Expression, ExpressionList, ForArrayStatement, ForObjectStatement,
    FunctionNode, IfStatement, LiteralNode, SetStatement, Statement,
};
use crate::config::{LexerConfig, ParserConfig};
use crate::environment::TemplateStorage;
use crate::error::{source_location, Error, Result};
use crate::functions::{FunctionStorage, Op};
use crate::lexer::Lexer;
use crate::template::{BlockSlot, Template};
use crate::token::{Token, TokenKind};
use camino::Utf8Path;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Call-local parser state: templates discovered while resolving includes,
/// plus the chain of templates currently being parsed (cycle detection).
/// Dropped wholesale when a parse fails, so partial results never leak into
/// shared storage.
pub(crate) struct ParseState {
    pub(crate) cache: HashMap<String, Arc<Template>>,
    chain: Vec<String>,
}

impl ParseState {
    pub(crate) fn new() -> Self {
        ParseState {
            cache: HashMap::new(),
            chain: Vec::new(),
        }
    }
}

struct Tokens<'a> {
    lexer: Lexer<'a>,
    source: &'a str,
    current: Token,
}

impl<'a> Tokens<'a> {
    fn new(config: &'a LexerConfig, source: &'a str) -> Result<Self> {
        let mut lexer = Lexer::new(config, source);
        let current = lexer.next()?;
        Ok(Tokens {
            lexer,
            source,
            current,
        })
    }

    fn advance(&mut self) -> Result<()> {
        self.current = self.lexer.next()?;
        Ok(())
    }

    fn text(&self) -> &'a str {
        self.current.span.slice(self.source)
    }

    /// Consumes verbatim content up to the matching `endraw` tag. The
    /// current token must be the `raw` statement's close.
    fn advance_raw(&mut self) -> Result<Token> {
        let content = self.lexer.scan_raw()?;
        self.current = self.lexer.next()?;
        Ok(content)
    }
}

#[derive(Debug, Clone)]
struct OperatorEntry {
    op: Op,
    name: &'static str,
    precedence: u8,
    right_assoc: bool,
    arity: u8,
    pos: usize,
}

pub(crate) struct Parser<'e> {
    parser_config: &'e ParserConfig,
    lexer_config: &'e LexerConfig,
    function_storage: &'e FunctionStorage,
    template_storage: &'e TemplateStorage,
    input_path: &'e Utf8Path,
}

impl<'e> Parser<'e> {
    pub(crate) fn new(
        parser_config: &'e ParserConfig,
        lexer_config: &'e LexerConfig,
        function_storage: &'e FunctionStorage,
        template_storage: &'e TemplateStorage,
        input_path: &'e Utf8Path,
    ) -> Self {
        Parser {
            parser_config,
            lexer_config,
            function_storage,
            template_storage,
            input_path,
        }
    }

    fn error(&self, source: &str, message: impl Into<String>, offset: usize) -> Error {
        Error::parse(message, source_location(source, offset))
    }

    /// Parses template source into a [`Template`].
    pub(crate) fn parse(&self, input: &str, state: &mut ParseState) -> Result<Template> {
        self.parse_named(input, None, state)
    }

    /// Parses template source, tracking `name` in the include/extends chain
    /// for cycle detection.
    pub(crate) fn parse_named(
        &self,
        input: &str,
        name: Option<&str>,
        state: &mut ParseState,
    ) -> Result<Template> {
        if let Some(name) = name {
            state.chain.push(name.to_string());
        }
        let result = self.parse_source(input, state);
        if name.is_some() {
            state.chain.pop();
        }
        let (root, blocks, extended) = result?;

        let content = Arc::new(input.to_string());
        let mut slots: HashMap<String, BlockSlot> = blocks
            .into_iter()
            .map(|(block_name, body)| {
                (
                    block_name,
                    BlockSlot {
                        body,
                        content: Arc::clone(&content),
                    },
                )
            })
            .collect();

        // Block inheritance is resolved here: parent bodies fill in the
        // names this template does not define, so the block storage holds
        // the effective body for every block name.
        for parent_name in &extended {
            if let Some(parent) = self.lookup_template(parent_name, state) {
                for (block_name, slot) in &parent.blocks {
                    slots
                        .entry(block_name.clone())
                        .or_insert_with(|| slot.clone());
                }
            }
        }

        Ok(Template {
            content,
            root,
            blocks: slots,
        })
    }

    fn lookup_template(&self, name: &str, state: &ParseState) -> Option<Arc<Template>> {
        state
            .cache
            .get(name)
            .cloned()
            .or_else(|| self.template_storage.get(name).cloned())
    }

    fn parse_source(
        &self,
        source: &str,
        state: &mut ParseState,
    ) -> Result<(Block, HashMap<String, Block>, Vec<String>)> {
        let mut tokens = Tokens::new(self.lexer_config, source)?;
        let mut blocks = HashMap::new();
        let mut extended = Vec::new();
        let (root, terminator) =
            self.parse_block_nodes(&mut tokens, source, state, &mut blocks, &mut extended, &[])?;
        if let Some((keyword, pos)) = terminator {
            return Err(self.error(source, format!("unexpected '{keyword}' statement"), pos));
        }
        Ok((root, blocks, extended))
    }

    /// Parses statements until end of input or one of `enders` is seen as a
    /// statement keyword. The ender keyword is consumed; the rest of its tag
    /// is left to the caller.
    fn parse_block_nodes(
        &self,
        tokens: &mut Tokens<'_>,
        source: &str,
        state: &mut ParseState,
        blocks: &mut HashMap<String, Block>,
        extended: &mut Vec<String>,
        enders: &[&str],
    ) -> Result<(Block, Option<(String, usize)>)> {
        let mut nodes = Vec::new();
        loop {
            match tokens.current.kind {
                TokenKind::Eof => {
                    if enders.is_empty() {
                        return Ok((Block { nodes }, None));
                    }
                    return Err(self.error(
                        source,
                        format!("unmatched statement, expected one of: {}", enders.join(", ")),
                        tokens.current.span.offset,
                    ));
                }
                TokenKind::Text => {
                    nodes.push(Statement::Text {
                        pos: tokens.current.span.offset,
                        len: tokens.current.span.len,
                    });
                    tokens.advance()?;
                }
                TokenKind::ExpressionOpen => {
                    let open = tokens.current;
                    tokens.advance()?;
                    let (root, close) =
                        self.parse_expression(tokens, source, TokenKind::ExpressionClose)?;
                    nodes.push(Statement::Expression(ExpressionList {
                        root,
                        pos: open.span.offset,
                        len: close.span.end() - open.span.offset,
                    }));
                }
                TokenKind::StatementOpen => {
                    let statement_pos = tokens.current.span.offset;
                    tokens.advance()?;
                    if tokens.current.kind != TokenKind::Id {
                        return Err(self.error(
                            source,
                            "expected statement keyword",
                            tokens.current.span.offset,
                        ));
                    }
                    let keyword = tokens.text().to_string();
                    let keyword_pos = tokens.current.span.offset;
                    if enders.contains(&keyword.as_str()) {
                        tokens.advance()?;
                        return Ok((Block { nodes }, Some((keyword, keyword_pos))));
                    }
                    tokens.advance()?;
                    match keyword.as_str() {
                        "if" => nodes.push(self.parse_if(
                            tokens,
                            source,
                            state,
                            blocks,
                            extended,
                            statement_pos,
                        )?),
                        "for" => nodes.push(self.parse_for(
                            tokens,
                            source,
                            state,
                            blocks,
                            extended,
                            statement_pos,
                        )?),
                        "include" => {
                            let name = self.expect_template_name(tokens, source)?;
                            let name_pos = tokens.current.span.offset;
                            tokens.advance()?;
                            self.expect_close(tokens, source)?;
                            self.resolve_template(&name, source, name_pos, state)?;
                            nodes.push(Statement::Include {
                                name,
                                pos: statement_pos,
                            });
                        }
                        "extends" => {
                            let name = self.expect_template_name(tokens, source)?;
                            let name_pos = tokens.current.span.offset;
                            tokens.advance()?;
                            self.expect_close(tokens, source)?;
                            self.resolve_template(&name, source, name_pos, state)?;
                            extended.push(name.clone());
                            nodes.push(Statement::Extends {
                                name,
                                pos: statement_pos,
                            });
                        }
                        "block" => {
                            let (name, _) = self.expect_id(tokens, source)?;
                            self.expect_close(tokens, source)?;
                            let (body, _) = self.parse_block_nodes(
                                tokens,
                                source,
                                state,
                                blocks,
                                extended,
                                &["endblock"],
                            )?;
                            self.expect_close(tokens, source)?;
                            blocks.insert(name.clone(), body);
                            nodes.push(Statement::Block {
                                name,
                                pos: statement_pos,
                            });
                        }
                        "set" => {
                            let (key, _) = self.expect_id(tokens, source)?;
                            if tokens.current.kind != TokenKind::Assign {
                                return Err(self.error(
                                    source,
                                    "expected '=' in set statement",
                                    tokens.current.span.offset,
                                ));
                            }
                            tokens.advance()?;
                            let expression = self.parse_expression_list(
                                tokens,
                                source,
                                TokenKind::StatementClose,
                            )?;
                            let pointer = format!("/{}", key.replace('.', "/"));
                            nodes.push(Statement::Set(SetStatement {
                                key,
                                pointer,
                                expression,
                                pos: statement_pos,
                            }));
                        }
                        "raw" => {
                            if tokens.current.kind != TokenKind::StatementClose {
                                return Err(self.error(
                                    source,
                                    "expected end of raw statement",
                                    tokens.current.span.offset,
                                ));
                            }
                            let content = tokens.advance_raw()?;
                            nodes.push(Statement::Raw {
                                pos: content.span.offset,
                                len: content.span.len,
                            });
                        }
                        "else" | "endif" | "endfor" | "endblock" | "endraw" => {
                            return Err(self.error(
                                source,
                                format!("unexpected '{keyword}' statement"),
                                keyword_pos,
                            ));
                        }
                        other => {
                            return Err(self.error(
                                source,
                                format!("unknown statement '{other}'"),
                                keyword_pos,
                            ));
                        }
                    }
                }
                _ => {
                    return Err(self.error(
                        source,
                        format!("unexpected token '{}'", tokens.text()),
                        tokens.current.span.offset,
                    ));
                }
            }
        }
    }

    fn parse_if(
        &self,
        tokens: &mut Tokens<'_>,
        source: &str,
        state: &mut ParseState,
        blocks: &mut HashMap<String, Block>,
        extended: &mut Vec<String>,
        pos: usize,
    ) -> Result<Statement> {
        let condition = self.parse_expression_list(tokens, source, TokenKind::StatementClose)?;
        let (true_branch, terminator) =
            self.parse_block_nodes(tokens, source, state, blocks, extended, &["else", "endif"])?;
        let Some((keyword, keyword_pos)) = terminator else {
            return Err(self.error(source, "unmatched if statement", pos));
        };

        let false_branch = if keyword == "endif" {
            self.expect_close(tokens, source)?;
            None
        } else if tokens.current.kind == TokenKind::Id && tokens.text() == "if" {
            // `else if`: the chain nests as a single-statement else branch.
            tokens.advance()?;
            let nested = self.parse_if(tokens, source, state, blocks, extended, keyword_pos)?;
            Some(Block {
                nodes: vec![nested],
            })
        } else {
            self.expect_close(tokens, source)?;
            let (else_block, _) =
                self.parse_block_nodes(tokens, source, state, blocks, extended, &["endif"])?;
            self.expect_close(tokens, source)?;
            Some(else_block)
        };

        Ok(Statement::If(IfStatement {
            condition,
            true_branch,
            false_branch,
            pos,
        }))
    }

    fn parse_for(
        &self,
        tokens: &mut Tokens<'_>,
        source: &str,
        state: &mut ParseState,
        blocks: &mut HashMap<String, Block>,
        extended: &mut Vec<String>,
        pos: usize,
    ) -> Result<Statement> {
        let (first_name, _) = self.expect_id(tokens, source)?;
        let key_value = if tokens.current.kind == TokenKind::Comma {
            tokens.advance()?;
            let (second_name, _) = self.expect_id(tokens, source)?;
            Some(second_name)
        } else {
            None
        };

        if tokens.current.kind != TokenKind::Id || tokens.text() != "in" {
            return Err(self.error(
                source,
                "expected 'in' in for statement",
                tokens.current.span.offset,
            ));
        }
        tokens.advance()?;

        let condition = self.parse_expression_list(tokens, source, TokenKind::StatementClose)?;
        let (body, _) =
            self.parse_block_nodes(tokens, source, state, blocks, extended, &["endfor"])?;
        self.expect_close(tokens, source)?;

        Ok(match key_value {
            Some(value_name) => Statement::ForObject(ForObjectStatement {
                key_name: first_name,
                value_name,
                condition,
                body,
                pos,
            }),
            None => Statement::ForArray(ForArrayStatement {
                value_name: first_name,
                condition,
                body,
                pos,
            }),
        })
    }

    fn expect_close(&self, tokens: &mut Tokens<'_>, source: &str) -> Result<()> {
        if tokens.current.kind != TokenKind::StatementClose {
            return Err(self.error(
                source,
                format!("expected end of statement, found '{}'", tokens.text()),
                tokens.current.span.offset,
            ));
        }
        tokens.advance()
    }

    fn expect_id(&self, tokens: &mut Tokens<'_>, source: &str) -> Result<(String, usize)> {
        if tokens.current.kind != TokenKind::Id {
            return Err(self.error(
                source,
                format!("expected identifier, found '{}'", tokens.text()),
                tokens.current.span.offset,
            ));
        }
        let name = tokens.text().to_string();
        let pos = tokens.current.span.offset;
        tokens.advance()?;
        Ok((name, pos))
    }

    /// Expects a quoted template name; the token is not consumed.
    fn expect_template_name(&self, tokens: &Tokens<'_>, source: &str) -> Result<String> {
        if tokens.current.kind != TokenKind::String {
            return Err(self.error(
                source,
                "expected template name string",
                tokens.current.span.offset,
            ));
        }
        match serde_json::from_str::<Value>(tokens.text()) {
            Ok(Value::String(name)) => Ok(name),
            _ => Err(self.error(
                source,
                "invalid template name string",
                tokens.current.span.offset,
            )),
        }
    }

    /// Makes the referenced template available for rendering: the parse
    /// cache and shared storage are checked first, then the file system
    /// (when configured), then the include callback. Names that remain
    /// unresolved are left to the renderer's missing-include policy.
    fn resolve_template(
        &self,
        name: &str,
        source: &str,
        pos: usize,
        state: &mut ParseState,
    ) -> Result<()> {
        if state.cache.contains_key(name) || self.template_storage.contains_key(name) {
            return Ok(());
        }
        if state.chain.iter().any(|entry| entry == name) {
            return Err(self.error(
                source,
                format!("circular include of template '{name}'"),
                pos,
            ));
        }
        if self.parser_config.search_included_templates_in_files {
            let path = self.input_path.join(name);
            match std::fs::read_to_string(path.as_std_path()) {
                Ok(content) => {
                    tracing::debug!(template = name, "parsing included template");
                    let template = self.parse_named(&content, Some(name), state)?;
                    state.cache.insert(name.to_string(), Arc::new(template));
                    return Ok(());
                }
                Err(err) => {
                    tracing::debug!(template = name, error = %err, "included template not found on disk");
                }
            }
        }
        if let Some(callback) = &self.parser_config.include_callback {
            let template = callback(self.input_path, name)?;
            state.cache.insert(name.to_string(), Arc::new(template));
        }
        Ok(())
    }

    fn parse_expression_list(
        &self,
        tokens: &mut Tokens<'_>,
        source: &str,
        close: TokenKind,
    ) -> Result<ExpressionList> {
        let start = tokens.current.span.offset;
        let (root, close_token) = self.parse_expression(tokens, source, close)?;
        Ok(ExpressionList {
            root,
            pos: start,
            len: close_token.span.offset.saturating_sub(start),
        })
    }

    /// Parses an expression up to and including the close token of `close`
    /// kind; returns the root (if any) and the consumed close token.
    fn parse_expression(
        &self,
        tokens: &mut Tokens<'_>,
        source: &str,
        close: TokenKind,
    ) -> Result<(Option<Expression>, Token)> {
        let root = self.parse_subexpression(tokens, source, &[close])?;
        let close_token = tokens.current;
        tokens.advance()?;
        Ok((root, close_token))
    }

    /// Shunting-yard over a flat token run. Stops (without consuming) at any
    /// token kind in `stops`. Groups, calls, indexing, and pipes recurse.
    fn parse_subexpression(
        &self,
        tokens: &mut Tokens<'_>,
        source: &str,
        stops: &[TokenKind],
    ) -> Result<Option<Expression>> {
        let mut operands: Vec<Expression> = Vec::new();
        let mut operators: Vec<OperatorEntry> = Vec::new();
        let mut expect_operand = true;

        loop {
            let token = tokens.current;
            if stops.contains(&token.kind) {
                break;
            }
            match token.kind {
                TokenKind::Eof => {
                    return Err(self.error(
                        source,
                        "unexpected end of template inside expression",
                        token.span.offset,
                    ));
                }
                TokenKind::Number | TokenKind::String => {
                    let text = tokens.text();
                    let value: Value = serde_json::from_str(text).map_err(|err| {
                        self.error(
                            source,
                            format!("invalid literal '{text}': {err}"),
                            token.span.offset,
                        )
                    })?;
                    operands.push(Expression::Literal(LiteralNode {
                        value,
                        pos: token.span.offset,
                    }));
                    expect_operand = false;
                    tokens.advance()?;
                }
                TokenKind::Id => {
                    let text = tokens.text();
                    match text {
                        "true" | "false" | "null" => {
                            let value: Value = serde_json::from_str(text).map_err(|err| {
                                self.error(
                                    source,
                                    format!("invalid literal '{text}': {err}"),
                                    token.span.offset,
                                )
                            })?;
                            operands.push(Expression::Literal(LiteralNode {
                                value,
                                pos: token.span.offset,
                            }));
                            expect_operand = false;
                            tokens.advance()?;
                        }
                        "not" => {
                            operators.push(OperatorEntry {
                                op: Op::Not,
                                name: "not",
                                precedence: 7,
                                right_assoc: true,
                                arity: 1,
                                pos: token.span.offset,
                            });
                            expect_operand = true;
                            tokens.advance()?;
                        }
                        "and" | "or" | "in" => {
                            let entry = match text {
                                "and" => OperatorEntry {
                                    op: Op::And,
                                    name: "and",
                                    precedence: 2,
                                    right_assoc: false,
                                    arity: 2,
                                    pos: token.span.offset,
                                },
                                "or" => OperatorEntry {
                                    op: Op::Or,
                                    name: "or",
                                    precedence: 1,
                                    right_assoc: false,
                                    arity: 2,
                                    pos: token.span.offset,
                                },
                                _ => OperatorEntry {
                                    op: Op::In,
                                    name: "in",
                                    precedence: 3,
                                    right_assoc: false,
                                    arity: 2,
                                    pos: token.span.offset,
                                },
                            };
                            self.push_operator(&mut operands, &mut operators, entry, source)?;
                            expect_operand = true;
                            tokens.advance()?;
                        }
                        _ => {
                            let name = text.to_string();
                            let id_token = token;
                            tokens.advance()?;
                            // A parenthesis directly after the identifier
                            // (no whitespace) makes this a call.
                            if tokens.current.kind == TokenKind::LeftParen
                                && tokens.current.span.offset == id_token.span.end()
                            {
                                tokens.advance()?;
                                let args = self.parse_call_args(tokens, source)?;
                                operands.push(self.make_named_function(
                                    source,
                                    &name,
                                    args,
                                    id_token.span.offset,
                                )?);
                            } else {
                                operands
                                    .push(Expression::Data(DataNode::new(name, id_token.span.offset)));
                            }
                            expect_operand = false;
                        }
                    }
                }
                TokenKind::LeftParen => {
                    if !expect_operand {
                        return Err(self.error(source, "unexpected '('", token.span.offset));
                    }
                    tokens.advance()?;
                    let inner =
                        self.parse_subexpression(tokens, source, &[TokenKind::RightParen])?;
                    let Some(inner) = inner else {
                        return Err(self.error(source, "empty parentheses", token.span.offset));
                    };
                    tokens.advance()?;
                    operands.push(inner);
                    expect_operand = false;
                }
                TokenKind::LeftBracket => {
                    if expect_operand {
                        return Err(self.error(source, "unexpected '['", token.span.offset));
                    }
                    tokens.advance()?;
                    let index = self
                        .parse_subexpression(tokens, source, &[TokenKind::RightBracket])?
                        .ok_or_else(|| {
                            self.error(source, "empty index expression", token.span.offset)
                        })?;
                    tokens.advance()?;
                    let base = operands.pop().ok_or_else(|| {
                        self.error(source, "missing value before '['", token.span.offset)
                    })?;
                    operands.push(Expression::Function(FunctionNode {
                        name: "at".to_string(),
                        op: Op::At,
                        args: vec![base, index],
                        callback: None,
                        inplace_callback: None,
                        pos: token.span.offset,
                    }));
                }
                TokenKind::Pipe => {
                    // A pipe applies to the whole expression on its left:
                    // `x | f(a)` desugars to `f(x, a)`.
                    self.drain_operators(&mut operands, &mut operators, source)?;
                    tokens.advance()?;
                    if tokens.current.kind != TokenKind::Id {
                        return Err(self.error(
                            source,
                            "expected function name after '|'",
                            tokens.current.span.offset,
                        ));
                    }
                    let name = tokens.text().to_string();
                    let id_token = tokens.current;
                    tokens.advance()?;
                    let piped = operands.pop().ok_or_else(|| {
                        self.error(source, "missing value before '|'", id_token.span.offset)
                    })?;
                    let mut args = vec![piped];
                    if tokens.current.kind == TokenKind::LeftParen
                        && tokens.current.span.offset == id_token.span.end()
                    {
                        tokens.advance()?;
                        args.extend(self.parse_call_args(tokens, source)?);
                    }
                    operands.push(self.make_named_function(
                        source,
                        &name,
                        args,
                        id_token.span.offset,
                    )?);
                    expect_operand = false;
                }
                TokenKind::Plus | TokenKind::Minus if expect_operand => {
                    // Leading sign of a numeric literal.
                    let negative = token.kind == TokenKind::Minus;
                    let sign_pos = token.span.offset;
                    tokens.advance()?;
                    if tokens.current.kind != TokenKind::Number {
                        return Err(self.error(source, "expected number after sign", sign_pos));
                    }
                    let text = tokens.text();
                    let literal = if negative {
                        format!("-{text}")
                    } else {
                        text.to_string()
                    };
                    let value: Value = serde_json::from_str(&literal).map_err(|err| {
                        self.error(source, format!("invalid literal '{literal}': {err}"), sign_pos)
                    })?;
                    operands.push(Expression::Literal(LiteralNode {
                        value,
                        pos: sign_pos,
                    }));
                    tokens.advance()?;
                    expect_operand = false;
                }
                TokenKind::Equal
                | TokenKind::NotEqual
                | TokenKind::GreaterThan
                | TokenKind::GreaterEqual
                | TokenKind::LessThan
                | TokenKind::LessEqual
                | TokenKind::Plus
                | TokenKind::Minus
                | TokenKind::Times
                | TokenKind::Slash
                | TokenKind::Percent
                | TokenKind::Power => {
                    if expect_operand {
                        return Err(self.error(
                            source,
                            format!("unexpected operator '{}'", tokens.text()),
                            token.span.offset,
                        ));
                    }
                    let entry = binary_operator(token);
                    self.push_operator(&mut operands, &mut operators, entry, source)?;
                    expect_operand = true;
                    tokens.advance()?;
                }
                _ => {
                    return Err(self.error(
                        source,
                        format!("unexpected token '{}' in expression", tokens.text()),
                        token.span.offset,
                    ));
                }
            }
        }

        self.drain_operators(&mut operands, &mut operators, source)?;
        match operands.len() {
            0 => Ok(None),
            1 => Ok(operands.pop()),
            _ => Err(self.error(
                source,
                "malformed expression",
                tokens.current.span.offset,
            )),
        }
    }

    /// Comma-separated arguments; the current token is just past `(`.
    /// Consumes the closing `)`.
    fn parse_call_args(
        &self,
        tokens: &mut Tokens<'_>,
        source: &str,
    ) -> Result<Vec<Expression>> {
        let mut args = Vec::new();
        if tokens.current.kind == TokenKind::RightParen {
            tokens.advance()?;
            return Ok(args);
        }
        loop {
            let arg = self
                .parse_subexpression(
                    tokens,
                    source,
                    &[TokenKind::Comma, TokenKind::RightParen],
                )?
                .ok_or_else(|| {
                    self.error(source, "empty function argument", tokens.current.span.offset)
                })?;
            args.push(arg);
            let kind = tokens.current.kind;
            tokens.advance()?;
            if kind == TokenKind::RightParen {
                return Ok(args);
            }
        }
    }

    /// Resolves a named call against the function registry: exact arity
    /// first, then the variadic fallback. Unknown functions are a parse
    /// error in strict mode and a deferred [`Op::None`] node in graceful
    /// mode.
    fn make_named_function(
        &self,
        source: &str,
        name: &str,
        args: Vec<Expression>,
        pos: usize,
    ) -> Result<Expression> {
        let arity = args.len() as i32;
        match self.function_storage.find_function(name, arity) {
            Some(data) => Ok(Expression::Function(FunctionNode {
                name: name.to_string(),
                op: data.op,
                args,
                callback: data.callback,
                inplace_callback: data.inplace_callback,
                pos,
            })),
            None if self.parser_config.graceful_errors => {
                Ok(Expression::Function(FunctionNode {
                    name: name.to_string(),
                    op: Op::None,
                    args,
                    callback: None,
                    inplace_callback: None,
                    pos,
                }))
            }
            None => Err(self.error(
                source,
                format!("unknown function '{name}' with {arity} arguments"),
                pos,
            )),
        }
    }

    fn push_operator(
        &self,
        operands: &mut Vec<Expression>,
        operators: &mut Vec<OperatorEntry>,
        entry: OperatorEntry,
        source: &str,
    ) -> Result<()> {
        while let Some(top) = operators.last() {
            let tighter = top.precedence > entry.precedence
                || (top.precedence == entry.precedence && !entry.right_assoc);
            if !tighter {
                break;
            }
            let top = operators.pop().ok_or_else(|| {
                self.error(source, "malformed expression", entry.pos)
            })?;
            self.apply_operator(operands, top, source)?;
        }
        operators.push(entry);
        Ok(())
    }

    fn drain_operators(
        &self,
        operands: &mut Vec<Expression>,
        operators: &mut Vec<OperatorEntry>,
        source: &str,
    ) -> Result<()> {
        while let Some(top) = operators.pop() {
            self.apply_operator(operands, top, source)?;
        }
        Ok(())
    }

    fn apply_operator(
        &self,
        operands: &mut Vec<Expression>,
        entry: OperatorEntry,
        source: &str,
    ) -> Result<()> {
        let arity = entry.arity as usize;
        if operands.len() < arity {
            return Err(self.error(source, "malformed expression", entry.pos));
        }
        let args = operands.split_off(operands.len() - arity);
        operands.push(Expression::Function(FunctionNode {
            name: entry.name.to_string(),
            op: entry.op,
            args,
            callback: None,
            inplace_callback: None,
            pos: entry.pos,
        }));
        Ok(())
    }
}

fn binary_operator(token: Token) -> OperatorEntry {
    let pos = token.span.offset;
    let (op, name, precedence, right_assoc) = match token.kind {
        TokenKind::Equal => (Op::Equal, "==", 3, false),
        TokenKind::NotEqual => (Op::NotEqual, "!=", 3, false),
        TokenKind::GreaterThan => (Op::Greater, ">", 3, false),
        TokenKind::GreaterEqual => (Op::GreaterEqual, ">=", 3, false),
        TokenKind::LessThan => (Op::Less, "<", 3, false),
        TokenKind::LessEqual => (Op::LessEqual, "<=", 3, false),
        TokenKind::Plus => (Op::Add, "+", 4, false),
        TokenKind::Minus => (Op::Subtract, "-", 4, false),
        TokenKind::Times => (Op::Multiplication, "*", 5, false),
        TokenKind::Slash => (Op::Division, "/", 5, false),
        TokenKind::Percent => (Op::Modulo, "%", 5, false),
        _ => (Op::Power, "^", 6, true),
    };
    OperatorEntry {
        op,
        name,
        precedence,
        right_assoc,
        arity: 2,
        pos,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(input: &str) -> Template {
        let parser_config = ParserConfig::default();
        let lexer_config = LexerConfig::default();
        let functions = FunctionStorage::default();
        let templates = TemplateStorage::new();
        let parser = Parser::new(
            &parser_config,
            &lexer_config,
            &functions,
            &templates,
            Utf8Path::new(""),
        );
        parser.parse(input, &mut ParseState::new()).unwrap()
    }

    fn parse_error(input: &str) -> Error {
        let parser_config = ParserConfig::default();
        let lexer_config = LexerConfig::default();
        let functions = FunctionStorage::default();
        let templates = TemplateStorage::new();
        let parser = Parser::new(
            &parser_config,
            &lexer_config,
            &functions,
            &templates,
            Utf8Path::new(""),
        );
        parser.parse(input, &mut ParseState::new()).unwrap_err()
    }

    #[test]
    fn test_text_and_expression_nodes() {
        let template = parse_one("Hello {{ name }}!");
        assert_eq!(template.root.nodes.len(), 3);
        assert!(matches!(template.root.nodes[0], Statement::Text { .. }));
        let Statement::Expression(list) = &template.root.nodes[1] else {
            panic!("expected expression statement");
        };
        assert!(matches!(list.root, Some(Expression::Data(_))));
        // The span covers the whole tag for graceful echo.
        assert_eq!(
            &template.content[list.pos..list.pos + list.len],
            "{{ name }}"
        );
    }

    #[test]
    fn test_operator_precedence() {
        let template = parse_one("{{ 1 + 2 * 3 }}");
        let Statement::Expression(list) = &template.root.nodes[0] else {
            panic!("expected expression");
        };
        let Some(Expression::Function(add)) = &list.root else {
            panic!("expected add at the root");
        };
        assert_eq!(add.op, Op::Add);
        let Expression::Function(mul) = &add.args[1] else {
            panic!("expected multiplication as right operand");
        };
        assert_eq!(mul.op, Op::Multiplication);
    }

    #[test]
    fn test_power_is_right_associative() {
        let template = parse_one("{{ 2 ^ 3 ^ 2 }}");
        let Statement::Expression(list) = &template.root.nodes[0] else {
            panic!("expected expression");
        };
        let Some(Expression::Function(outer)) = &list.root else {
            panic!("expected power at the root");
        };
        assert_eq!(outer.op, Op::Power);
        assert!(matches!(&outer.args[0], Expression::Literal(_)));
        assert!(matches!(
            &outer.args[1],
            Expression::Function(inner) if inner.op == Op::Power
        ));
    }

    #[test]
    fn test_pipe_desugars_to_call() {
        let template = parse_one("{{ name | upper }}");
        let Statement::Expression(list) = &template.root.nodes[0] else {
            panic!("expected expression");
        };
        let Some(Expression::Function(call)) = &list.root else {
            panic!("expected function at the root");
        };
        assert_eq!(call.op, Op::Upper);
        assert_eq!(call.args.len(), 1);
    }

    #[test]
    fn test_index_desugars_to_at() {
        let template = parse_one("{{ xs[2] }}");
        let Statement::Expression(list) = &template.root.nodes[0] else {
            panic!("expected expression");
        };
        let Some(Expression::Function(call)) = &list.root else {
            panic!("expected function at the root");
        };
        assert_eq!(call.op, Op::At);
        assert_eq!(call.args.len(), 2);
    }

    #[test]
    fn test_dotted_identifier_becomes_pointer() {
        let template = parse_one("{{ user.profile.name }}");
        let Statement::Expression(list) = &template.root.nodes[0] else {
            panic!("expected expression");
        };
        let Some(Expression::Data(data)) = &list.root else {
            panic!("expected data node");
        };
        assert_eq!(data.pointer, "/user/profile/name");
    }

    #[test]
    fn test_unknown_function_is_a_parse_error_in_strict_mode() {
        let err = parse_error("{{ nope(1) }}");
        assert!(matches!(err, Error::Parse { .. }), "{err:?}");
    }

    #[test]
    fn test_unknown_function_is_deferred_in_graceful_mode() {
        let parser_config = ParserConfig {
            graceful_errors: true,
            ..ParserConfig::default()
        };
        let lexer_config = LexerConfig::default();
        let functions = FunctionStorage::default();
        let templates = TemplateStorage::new();
        let parser = Parser::new(
            &parser_config,
            &lexer_config,
            &functions,
            &templates,
            Utf8Path::new(""),
        );
        let template = parser.parse("{{ nope(1) }}", &mut ParseState::new()).unwrap();
        let Statement::Expression(list) = &template.root.nodes[0] else {
            panic!("expected expression");
        };
        assert!(matches!(
            &list.root,
            Some(Expression::Function(node)) if node.op == Op::None
        ));
    }

    #[test]
    fn test_unmatched_endif_errors() {
        let err = parse_error("{% if x %}y");
        assert!(err.to_string().contains("unmatched"), "{err}");
    }

    #[test]
    fn test_blocks_are_collected() {
        let template = parse_one("a{% block body %}default{% endblock %}b");
        assert!(template.blocks.contains_key("body"));
        assert!(matches!(
            template.root.nodes[1],
            Statement::Block { ref name, .. } if name == "body"
        ));
    }

    #[test]
    fn test_else_if_chain() {
        let template = parse_one("{% if a %}1{% else if b %}2{% else %}3{% endif %}");
        let Statement::If(node) = &template.root.nodes[0] else {
            panic!("expected if statement");
        };
        let nested = node.false_branch.as_ref().unwrap();
        assert!(matches!(nested.nodes[0], Statement::If(_)));
    }

    #[test]
    fn test_for_key_value() {
        let template = parse_one("{% for k, v in obj %}{{ k }}{% endfor %}");
        assert!(matches!(
            &template.root.nodes[0],
            Statement::ForObject(node) if node.key_name == "k" && node.value_name == "v"
        ));
    }
}
