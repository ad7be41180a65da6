//! Engine configuration: delimiters, parser flags, render flags, and the
//! instrumentation/wrapper hooks.

use crate::error::Result;
use crate::template::Template;
use camino::Utf8Path;
use serde_json::Value;
use std::sync::Arc;

/// Wrapper around user-callback execution.
///
/// The wrapper receives the function name, the evaluated arguments, and a
/// thunk that executes the actual callback. This lets external code add
/// timing, tracing spans, or caching around every callback invocation.
pub type CallbackWrapper =
    Arc<dyn Fn(&str, &[Value], &dyn Fn() -> Result<Value>) -> Result<Value> + Send + Sync>;

/// Hook invoked when an included template cannot be resolved from storage or
/// the file system. Receives the environment's input root and the requested
/// name, and returns a parsed template.
pub type IncludeCallback = Arc<dyn Fn(&Utf8Path, &str) -> Result<Template> + Send + Sync>;

/// Receiver for [`InstrumentationData`] events, called synchronously during
/// rendering. Implementations should be fast.
pub type InstrumentationCallback = Arc<dyn Fn(&InstrumentationData) + Send + Sync>;

/// Events emitted during template rendering for debugging and performance
/// analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrumentationEvent {
    RenderStart,
    RenderEnd,
    SetStatementStart,
    SetStatementEnd,
    /// The in-place self-assignment optimisation was used.
    InplaceOptUsed,
    /// The in-place optimisation was skipped; `detail` names the reason.
    InplaceOptSkipped,
    ExpressionEvalStart,
    ExpressionEvalEnd,
    ForLoopStart,
    ForLoopIteration,
    ForLoopEnd,
    IncludeStart,
    IncludeEnd,
}

/// Payload attached to an instrumentation event.
#[derive(Debug, Clone)]
pub struct InstrumentationData {
    pub event: InstrumentationEvent,
    /// Variable name, template name, or function name, depending on the event.
    pub name: String,
    /// Free-form detail, e.g. a skip reason or loop kind.
    pub detail: String,
    /// Numeric data, e.g. an iteration count or container size.
    pub count: usize,
}

/// Lexer configuration: delimiter strings and whitespace-control flags.
#[derive(Debug, Clone)]
pub struct LexerConfig {
    pub statement_open: String,
    pub statement_open_no_lstrip: String,
    pub statement_open_force_lstrip: String,
    pub statement_close: String,
    pub statement_close_force_rstrip: String,
    pub line_statement: String,
    pub expression_open: String,
    pub expression_open_force_lstrip: String,
    pub expression_close: String,
    pub expression_close_force_rstrip: String,
    pub comment_open: String,
    pub comment_open_force_lstrip: String,
    pub comment_close: String,
    pub comment_close_force_rstrip: String,
    /// Unique first characters of all open tokens; accelerates text scanning.
    pub open_chars: String,
    /// Remove the newline immediately following a statement or comment close.
    pub trim_blocks: bool,
    /// Strip spaces and tabs from the start of a line to a statement open.
    pub lstrip_blocks: bool,
}

impl Default for LexerConfig {
    fn default() -> Self {
        let mut config = LexerConfig {
            statement_open: "{%".into(),
            statement_open_no_lstrip: "{%+".into(),
            statement_open_force_lstrip: "{%-".into(),
            statement_close: "%}".into(),
            statement_close_force_rstrip: "-%}".into(),
            line_statement: "##".into(),
            expression_open: "{{".into(),
            expression_open_force_lstrip: "{{-".into(),
            expression_close: "}}".into(),
            expression_close_force_rstrip: "-}}".into(),
            comment_open: "{#".into(),
            comment_open_force_lstrip: "{#-".into(),
            comment_close: "#}".into(),
            comment_close_force_rstrip: "-#}".into(),
            open_chars: String::new(),
            trim_blocks: false,
            lstrip_blocks: false,
        };
        config.update_open_chars();
        config
    }
}

impl LexerConfig {
    /// Rebuilds [`LexerConfig::open_chars`] from the first character of every
    /// open token. Must be called after changing any delimiter.
    pub fn update_open_chars(&mut self) {
        let mut open_chars = String::new();
        let opens = [
            &self.line_statement,
            &self.statement_open,
            &self.statement_open_no_lstrip,
            &self.statement_open_force_lstrip,
            &self.expression_open,
            &self.expression_open_force_lstrip,
            &self.comment_open,
            &self.comment_open_force_lstrip,
        ];
        for open in opens {
            if let Some(first) = open.chars().next() {
                if !open_chars.contains(first) {
                    open_chars.push(first);
                }
            }
        }
        self.open_chars = open_chars;
    }
}

/// Parser configuration.
#[derive(Clone)]
pub struct ParserConfig {
    /// Resolve `include`/`extends` names against the file system, rooted at
    /// the environment's input path.
    pub search_included_templates_in_files: bool,
    /// Defer unknown-function errors from parse time to render time.
    pub graceful_errors: bool,
    /// Fallback resolver for template names that cannot be found.
    pub include_callback: Option<IncludeCallback>,
}

impl Default for ParserConfig {
    fn default() -> Self {
        ParserConfig {
            search_included_templates_in_files: true,
            graceful_errors: false,
            include_callback: None,
        }
    }
}

/// Render configuration.
#[derive(Clone)]
pub struct RenderConfig {
    /// Raise an error when an included or extended template is missing from
    /// storage; otherwise the statement is silently skipped.
    pub throw_at_missing_includes: bool,
    /// HTML-escape string values produced by expression output.
    pub html_autoescape: bool,
    /// Record recoverable errors and keep rendering instead of aborting.
    pub graceful_errors: bool,
    /// Optional wrapper around every user-callback invocation.
    pub callback_wrapper: Option<CallbackWrapper>,
    /// Optional receiver for instrumentation events.
    pub instrumentation_callback: Option<InstrumentationCallback>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        RenderConfig {
            throw_at_missing_includes: true,
            html_autoescape: false,
            graceful_errors: false,
            callback_wrapper: None,
            instrumentation_callback: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_open_chars() {
        let config = LexerConfig::default();
        // '#' from the line statement and comment open, '{' from the rest.
        assert_eq!(config.open_chars, "#{");
    }

    #[test]
    fn test_update_open_chars_after_delimiter_change() {
        let mut config = LexerConfig::default();
        config.expression_open = "<<".into();
        config.expression_open_force_lstrip = "<<-".into();
        config.update_open_chars();
        assert!(config.open_chars.contains('<'));
        assert!(config.open_chars.contains('{'));
        assert!(config.open_chars.contains('#'));
    }
}
