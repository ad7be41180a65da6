//! Template tokenizer.
//!
//! A single-pass, stateful lexer suspended between [`Lexer::next`] calls. It
//! operates in two macro-states: outside a tag, where it scans text and looks
//! for open delimiters, and inside a tag, where it produces identifiers,
//! literals, and operators until the matching close delimiter.
//!
//! Whitespace control: a `-` flavoured close strips all whitespace that
//! follows it, and `trim_blocks` removes the single newline after a statement
//! or comment close. A `-` flavoured open strips all whitespace before the
//! tag, and `lstrip_blocks` removes spaces and tabs from the start of the
//! line before a statement or comment open (suppressed by the `+` open
//! variant). Comments are consumed entirely and never reach the parser.

use crate::config::LexerConfig;
use crate::error::{source_location, Error, Result};
use crate::token::{Token, TokenKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Text,
    ExpressionBody,
    StatementBody,
    /// Inside a line statement; a newline closes the tag.
    LineBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenKind {
    Expression,
    Statement,
    Line,
    Comment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lstrip {
    /// No stripping for this open flavour.
    Off,
    /// Subject to `lstrip_blocks`.
    Auto,
    /// `-` variant: strip all preceding whitespace.
    Force,
}

#[derive(Debug, Clone, Copy)]
struct OpenTag {
    kind: OpenKind,
    len: usize,
    lstrip: Lstrip,
}

pub struct Lexer<'a> {
    config: &'a LexerConfig,
    source: &'a str,
    pos: usize,
    state: State,
    /// Open token to emit after the text token that precedes it.
    pending: Option<Token>,
    /// A `-` close requested stripping of all following whitespace.
    skip_whitespace: bool,
    /// `trim_blocks` requested removal of the next newline.
    skip_newline: bool,
}

impl<'a> Lexer<'a> {
    pub fn new(config: &'a LexerConfig, source: &'a str) -> Self {
        Lexer {
            config,
            source,
            pos: 0,
            state: State::Text,
            pending: None,
            skip_whitespace: false,
            skip_newline: false,
        }
    }

    /// Produces the next token. `Eof` is returned indefinitely once the end
    /// of input is reached.
    pub fn next(&mut self) -> Result<Token> {
        if let Some(token) = self.pending.take() {
            return Ok(token);
        }
        match self.state {
            State::Text => self.scan_text(),
            State::ExpressionBody | State::StatementBody | State::LineBody => self.scan_body(),
        }
    }

    fn error(&self, message: impl Into<String>, offset: usize) -> Error {
        Error::parse(message, source_location(self.source, offset))
    }

    fn apply_pending_trims(&mut self) {
        if self.skip_whitespace {
            let rest = &self.source[self.pos..];
            let trimmed = rest.trim_start();
            self.pos += rest.len() - trimmed.len();
        } else if self.skip_newline {
            let rest = &self.source[self.pos..];
            if let Some(stripped) = rest.strip_prefix("\r\n") {
                self.pos += rest.len() - stripped.len();
            } else if rest.starts_with('\n') {
                self.pos += 1;
            }
        }
        self.skip_whitespace = false;
        self.skip_newline = false;
    }

    fn scan_text(&mut self) -> Result<Token> {
        loop {
            self.apply_pending_trims();
            let start = self.pos;
            let Some((open_pos, tag)) = self.find_open(start) else {
                self.pos = self.source.len();
                if start == self.source.len() {
                    return Ok(Token::new(TokenKind::Eof, start, 0));
                }
                return Ok(Token::new(TokenKind::Text, start, self.source.len() - start));
            };

            let text_end = self.lstripped_end(start, open_pos, tag.lstrip);
            self.pos = open_pos + tag.len;

            let open_token = match tag.kind {
                OpenKind::Comment => {
                    self.skip_comment(open_pos)?;
                    None
                }
                OpenKind::Expression => {
                    self.state = State::ExpressionBody;
                    Some(Token::new(TokenKind::ExpressionOpen, open_pos, tag.len))
                }
                OpenKind::Statement => {
                    self.state = State::StatementBody;
                    Some(Token::new(TokenKind::StatementOpen, open_pos, tag.len))
                }
                OpenKind::Line => {
                    self.state = State::LineBody;
                    Some(Token::new(TokenKind::StatementOpen, open_pos, tag.len))
                }
            };

            if text_end > start {
                self.pending = open_token;
                return Ok(Token::new(TokenKind::Text, start, text_end - start));
            }
            match open_token {
                Some(token) => return Ok(token),
                None => continue,
            }
        }
    }

    /// Finds the next open delimiter at or after `from`.
    fn find_open(&self, from: usize) -> Option<(usize, OpenTag)> {
        for (rel, c) in self.source[from..].char_indices() {
            if !self.config.open_chars.contains(c) {
                continue;
            }
            let abs = from + rel;
            if let Some(tag) = self.match_open_at(abs) {
                return Some((abs, tag));
            }
        }
        None
    }

    fn match_open_at(&self, pos: usize) -> Option<OpenTag> {
        let rest = &self.source[pos..];
        let at_line_start = pos == 0 || self.source.as_bytes()[pos - 1] == b'\n';
        if at_line_start && rest.starts_with(self.config.line_statement.as_str()) {
            return Some(OpenTag {
                kind: OpenKind::Line,
                len: self.config.line_statement.len(),
                lstrip: Lstrip::Off,
            });
        }
        let candidates = [
            (
                &self.config.expression_open_force_lstrip,
                OpenKind::Expression,
                Lstrip::Force,
            ),
            (&self.config.expression_open, OpenKind::Expression, Lstrip::Off),
            (
                &self.config.statement_open_force_lstrip,
                OpenKind::Statement,
                Lstrip::Force,
            ),
            (
                &self.config.statement_open_no_lstrip,
                OpenKind::Statement,
                Lstrip::Off,
            ),
            (&self.config.statement_open, OpenKind::Statement, Lstrip::Auto),
            (
                &self.config.comment_open_force_lstrip,
                OpenKind::Comment,
                Lstrip::Force,
            ),
            (&self.config.comment_open, OpenKind::Comment, Lstrip::Auto),
        ];
        for (open, kind, lstrip) in candidates {
            if rest.starts_with(open.as_str()) {
                return Some(OpenTag {
                    kind,
                    len: open.len(),
                    lstrip,
                });
            }
        }
        None
    }

    /// End of the text token preceding an open tag, after lstrip rules.
    fn lstripped_end(&self, start: usize, open_pos: usize, lstrip: Lstrip) -> usize {
        let bytes = self.source.as_bytes();
        match lstrip {
            Lstrip::Force => {
                let mut end = open_pos;
                while end > start && bytes[end - 1].is_ascii_whitespace() {
                    end -= 1;
                }
                end
            }
            Lstrip::Auto if self.config.lstrip_blocks => {
                let line_start = self.source[start..open_pos]
                    .rfind('\n')
                    .map(|p| start + p + 1)
                    .unwrap_or(start);
                let tail_is_blank = bytes[line_start..open_pos]
                    .iter()
                    .all(|b| *b == b' ' || *b == b'\t');
                if tail_is_blank {
                    line_start
                } else {
                    open_pos
                }
            }
            _ => open_pos,
        }
    }

    /// Consumes a comment body and its close tag; comments produce no tokens.
    fn skip_comment(&mut self, open_pos: usize) -> Result<()> {
        let rest = &self.source[self.pos..];
        let force = rest.find(self.config.comment_close_force_rstrip.as_str());
        let plain = rest.find(self.config.comment_close.as_str());
        let (idx, close_len, rstrip) = match (force, plain) {
            (Some(f), Some(p)) if f < p => (f, self.config.comment_close_force_rstrip.len(), true),
            (_, Some(p)) => (p, self.config.comment_close.len(), false),
            (Some(f), None) => (f, self.config.comment_close_force_rstrip.len(), true),
            (None, None) => return Err(self.error("unterminated comment", open_pos)),
        };
        self.pos += idx + close_len;
        if rstrip {
            self.skip_whitespace = true;
        } else if self.config.trim_blocks {
            self.skip_newline = true;
        }
        Ok(())
    }

    fn scan_body(&mut self) -> Result<Token> {
        // Inside a tag whitespace is insignificant; in a line statement the
        // newline is the close, so it must survive the skip.
        while self.pos < self.source.len() {
            let b = self.source.as_bytes()[self.pos];
            let skippable = match self.state {
                State::LineBody => b == b' ' || b == b'\t' || b == b'\r',
                _ => b.is_ascii_whitespace(),
            };
            if !skippable {
                break;
            }
            // A carriage return directly before the closing newline belongs
            // to the close in a line statement.
            if self.state == State::LineBody
                && b == b'\r'
                && self.source[self.pos + 1..].starts_with('\n')
            {
                break;
            }
            self.pos += 1;
        }

        let pos = self.pos;
        if pos >= self.source.len() {
            if self.state == State::LineBody {
                self.state = State::Text;
                return Ok(Token::new(TokenKind::StatementClose, pos, 0));
            }
            return Ok(Token::new(TokenKind::Eof, pos, 0));
        }

        if self.state == State::LineBody {
            let rest = &self.source[pos..];
            if rest.starts_with("\r\n") {
                self.state = State::Text;
                self.pos += 2;
                return Ok(Token::new(TokenKind::StatementClose, pos, 2));
            }
            if rest.starts_with('\n') {
                self.state = State::Text;
                self.pos += 1;
                return Ok(Token::new(TokenKind::StatementClose, pos, 1));
            }
        } else if let Some(token) = self.match_close_at(pos) {
            return Ok(token);
        }

        let rest = &self.source[pos..];
        let c = match rest.chars().next() {
            Some(c) => c,
            None => return Ok(Token::new(TokenKind::Eof, pos, 0)),
        };

        if c == '"' {
            return self.scan_string(pos);
        }
        if c.is_ascii_digit() {
            return Ok(self.scan_number(pos));
        }
        if c.is_ascii_alphabetic() || c == '_' {
            return Ok(self.scan_identifier(pos));
        }

        let two = if rest.len() >= 2 && rest.is_char_boundary(2) {
            &rest[..2]
        } else {
            ""
        };
        let (kind, len) = match two {
            "==" => (TokenKind::Equal, 2),
            "!=" => (TokenKind::NotEqual, 2),
            ">=" => (TokenKind::GreaterEqual, 2),
            "<=" => (TokenKind::LessEqual, 2),
            _ => match c {
                '>' => (TokenKind::GreaterThan, 1),
                '<' => (TokenKind::LessThan, 1),
                '=' => (TokenKind::Assign, 1),
                ',' => (TokenKind::Comma, 1),
                ':' => (TokenKind::Colon, 1),
                '(' => (TokenKind::LeftParen, 1),
                ')' => (TokenKind::RightParen, 1),
                '[' => (TokenKind::LeftBracket, 1),
                ']' => (TokenKind::RightBracket, 1),
                '+' => (TokenKind::Plus, 1),
                '-' => (TokenKind::Minus, 1),
                '*' => (TokenKind::Times, 1),
                '/' => (TokenKind::Slash, 1),
                '%' => (TokenKind::Percent, 1),
                '^' => (TokenKind::Power, 1),
                '|' => (TokenKind::Pipe, 1),
                _ => (TokenKind::Unknown, c.len_utf8()),
            },
        };
        self.pos += len;
        Ok(Token::new(kind, pos, len))
    }

    /// Matches a close delimiter for the current body state, `-` variant
    /// first since it is a superstring of the plain close.
    fn match_close_at(&mut self, pos: usize) -> Option<Token> {
        let rest = &self.source[pos..];
        let (force, plain, kind) = match self.state {
            State::StatementBody => (
                &self.config.statement_close_force_rstrip,
                &self.config.statement_close,
                TokenKind::StatementClose,
            ),
            State::ExpressionBody => (
                &self.config.expression_close_force_rstrip,
                &self.config.expression_close,
                TokenKind::ExpressionClose,
            ),
            _ => return None,
        };
        let (len, rstrip) = if rest.starts_with(force.as_str()) {
            (force.len(), true)
        } else if rest.starts_with(plain.as_str()) {
            (plain.len(), false)
        } else {
            return None;
        };
        if rstrip {
            self.skip_whitespace = true;
        } else if self.config.trim_blocks && kind == TokenKind::StatementClose {
            self.skip_newline = true;
        }
        self.state = State::Text;
        self.pos += len;
        Some(Token::new(kind, pos, len))
    }

    fn scan_string(&mut self, start: usize) -> Result<Token> {
        let bytes = self.source.as_bytes();
        let mut i = start + 1;
        while i < bytes.len() {
            match bytes[i] {
                b'\\' => i += 2,
                b'"' => {
                    self.pos = i + 1;
                    return Ok(Token::new(TokenKind::String, start, i + 1 - start));
                }
                _ => i += 1,
            }
        }
        Err(self.error("unterminated string", start))
    }

    fn scan_number(&mut self, start: usize) -> Token {
        let bytes = self.source.as_bytes();
        let mut i = start;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if i < bytes.len()
            && bytes[i] == b'.'
            && i + 1 < bytes.len()
            && bytes[i + 1].is_ascii_digit()
        {
            i += 1;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
        }
        if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
            let mut j = i + 1;
            if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
                j += 1;
            }
            if j < bytes.len() && bytes[j].is_ascii_digit() {
                i = j;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
            }
        }
        self.pos = i;
        Token::new(TokenKind::Number, start, i - start)
    }

    /// Identifier with optional dotted segments; dots compose a data path,
    /// and numeric segments index into arrays (`xs.0`).
    fn scan_identifier(&mut self, start: usize) -> Token {
        let bytes = self.source.as_bytes();
        let is_ident = |b: u8| b.is_ascii_alphanumeric() || b == b'_';
        let mut i = start + 1;
        while i < bytes.len() && is_ident(bytes[i]) {
            i += 1;
        }
        while i + 1 < bytes.len() && bytes[i] == b'.' && is_ident(bytes[i + 1]) {
            i += 1;
            while i < bytes.len() && is_ident(bytes[i]) {
                i += 1;
            }
        }
        self.pos = i;
        Token::new(TokenKind::Id, start, i - start)
    }

    /// Scans verbatim content up to the matching `endraw` statement. Used by
    /// the parser after it has consumed the `raw` statement's close tag.
    /// Returns the content span and leaves the lexer positioned after the
    /// `endraw` close.
    pub fn scan_raw(&mut self) -> Result<Token> {
        self.apply_pending_trims();
        let content_start = self.pos;
        let mut search = content_start;
        loop {
            let Some((open_pos, tag)) = self.find_statement_open(search) else {
                return Err(self.error("unmatched raw statement", content_start));
            };
            if let Some(after_close) = self.match_endraw(open_pos + tag.len) {
                let text_end = self.lstripped_end(content_start, open_pos, tag.lstrip);
                self.pos = after_close;
                self.state = State::Text;
                return Ok(Token::new(
                    TokenKind::Text,
                    content_start,
                    text_end - content_start,
                ));
            }
            search = open_pos + 1;
        }
    }

    fn find_statement_open(&self, from: usize) -> Option<(usize, OpenTag)> {
        let mut search = from;
        while let Some((pos, tag)) = self.find_open(search) {
            if tag.kind == OpenKind::Statement {
                return Some((pos, tag));
            }
            search = pos + 1;
        }
        None
    }

    /// Checks for `endraw` plus a statement close starting at `pos`; returns
    /// the position after the close tag and applies its trim flags.
    fn match_endraw(&mut self, pos: usize) -> Option<usize> {
        let rest = &self.source[pos..];
        let trimmed = rest.trim_start();
        let mut i = pos + (rest.len() - trimmed.len());
        let keyword = "endraw";
        if !self.source[i..].starts_with(keyword) {
            return None;
        }
        i += keyword.len();
        let rest = &self.source[i..];
        let trimmed = rest.trim_start();
        i += rest.len() - trimmed.len();
        let rest = &self.source[i..];
        if rest.starts_with(self.config.statement_close_force_rstrip.as_str()) {
            self.skip_whitespace = true;
            Some(i + self.config.statement_close_force_rstrip.len())
        } else if rest.starts_with(self.config.statement_close.as_str()) {
            if self.config.trim_blocks {
                self.skip_newline = true;
            }
            Some(i + self.config.statement_close.len())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(config: &LexerConfig, source: &str) -> Vec<(TokenKind, String)> {
        let mut lexer = Lexer::new(config, source);
        let mut tokens = Vec::new();
        loop {
            let token = lexer.next().unwrap();
            if token.kind == TokenKind::Eof {
                break;
            }
            tokens.push((token.kind, token.span.slice(source).to_string()));
        }
        tokens
    }

    #[test]
    fn test_text_and_expression() {
        let config = LexerConfig::default();
        let tokens = collect(&config, "Hello {{ name }}!");
        assert_eq!(
            tokens,
            vec![
                (TokenKind::Text, "Hello ".into()),
                (TokenKind::ExpressionOpen, "{{".into()),
                (TokenKind::Id, "name".into()),
                (TokenKind::ExpressionClose, "}}".into()),
                (TokenKind::Text, "!".into()),
            ]
        );
    }

    #[test]
    fn test_operators_and_literals() {
        let config = LexerConfig::default();
        let tokens = collect(&config, r#"{{ a.b == 3.5 + "x" }}"#);
        let kinds: Vec<_> = tokens.iter().map(|(k, _)| *k).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::ExpressionOpen,
                TokenKind::Id,
                TokenKind::Equal,
                TokenKind::Number,
                TokenKind::Plus,
                TokenKind::String,
                TokenKind::ExpressionClose,
            ]
        );
        assert_eq!(tokens[1].1, "a.b");
        assert_eq!(tokens[3].1, "3.5");
        assert_eq!(tokens[5].1, "\"x\"");
    }

    #[test]
    fn test_force_trim_variants() {
        let config = LexerConfig::default();
        let tokens = collect(&config, "a   {{- x -}}   b");
        assert_eq!(tokens[0], (TokenKind::Text, "a".into()));
        assert_eq!(tokens.last().unwrap(), &(TokenKind::Text, "b".into()));
    }

    #[test]
    fn test_trim_blocks_eats_newline_after_statement() {
        let mut config = LexerConfig::default();
        config.trim_blocks = true;
        let tokens = collect(&config, "{% if x %}\nA{% endif %}\n");
        let texts: Vec<_> = tokens
            .iter()
            .filter(|(k, _)| *k == TokenKind::Text)
            .map(|(_, t)| t.clone())
            .collect();
        assert_eq!(texts, vec!["A"]);
    }

    #[test]
    fn test_lstrip_blocks() {
        let mut config = LexerConfig::default();
        config.lstrip_blocks = true;
        let tokens = collect(&config, "x\n   {% if y %}{% endif %}");
        assert_eq!(tokens[0], (TokenKind::Text, "x\n".into()));
    }

    #[test]
    fn test_plus_variant_suppresses_lstrip() {
        let mut config = LexerConfig::default();
        config.lstrip_blocks = true;
        let tokens = collect(&config, "x\n   {%+ if y %}{% endif %}");
        assert_eq!(tokens[0], (TokenKind::Text, "x\n   ".into()));
    }

    #[test]
    fn test_comments_are_swallowed() {
        let config = LexerConfig::default();
        let tokens = collect(&config, "a{# hidden #}b");
        assert_eq!(
            tokens,
            vec![
                (TokenKind::Text, "a".into()),
                (TokenKind::Text, "b".into()),
            ]
        );
    }

    #[test]
    fn test_line_statement() {
        let config = LexerConfig::default();
        let tokens = collect(&config, "## if x\nA");
        assert_eq!(tokens[0].0, TokenKind::StatementOpen);
        assert_eq!(tokens[1], (TokenKind::Id, "if".into()));
        assert_eq!(tokens[2], (TokenKind::Id, "x".into()));
        assert_eq!(tokens[3].0, TokenKind::StatementClose);
        assert_eq!(tokens[4], (TokenKind::Text, "A".into()));
    }

    #[test]
    fn test_line_statement_only_at_line_start() {
        let config = LexerConfig::default();
        let tokens = collect(&config, "a ## b");
        assert_eq!(tokens, vec![(TokenKind::Text, "a ## b".into())]);
    }

    #[test]
    fn test_custom_delimiters() {
        let mut config = LexerConfig::default();
        config.expression_open = "<<".into();
        config.expression_open_force_lstrip = "<<-".into();
        config.expression_close = ">>".into();
        config.expression_close_force_rstrip = "->>".into();
        config.update_open_chars();
        let tokens = collect(&config, "v: << x >> {{ y }}");
        assert_eq!(tokens[0], (TokenKind::Text, "v: ".into()));
        assert_eq!(tokens[1], (TokenKind::ExpressionOpen, "<<".into()));
        assert_eq!(tokens[2], (TokenKind::Id, "x".into()));
        assert_eq!(tokens[3], (TokenKind::ExpressionClose, ">>".into()));
    }

    #[test]
    fn test_raw_scan() {
        let config = LexerConfig::default();
        let source = "{% raw %}x {{ y }} z{% endraw %}done";
        let mut lexer = Lexer::new(&config, source);
        assert_eq!(lexer.next().unwrap().kind, TokenKind::StatementOpen);
        let keyword = lexer.next().unwrap();
        assert_eq!(keyword.span.slice(source), "raw");
        assert_eq!(lexer.next().unwrap().kind, TokenKind::StatementClose);
        let content = lexer.scan_raw().unwrap();
        assert_eq!(content.span.slice(source), "x {{ y }} z");
        let tail = lexer.next().unwrap();
        assert_eq!(tail.span.slice(source), "done");
    }

    #[test]
    fn test_unterminated_comment_errors() {
        let config = LexerConfig::default();
        let mut lexer = Lexer::new(&config, "a {# never closed");
        assert!(lexer.next().is_err());
    }
}
