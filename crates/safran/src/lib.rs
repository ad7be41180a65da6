//! safran - a Jinja-style text template engine over JSON data.
//!
//! Templates are parsed once into an AST and rendered against a
//! [`serde_json::Value`] tree. The [`Environment`] owns template and
//! function storage behind copy-on-write snapshots, so renders running on
//! one thread are never disturbed by writes on another; an optional
//! LRU+TTL [`CallbackCache`] memoises user-callback results.
//!
//! # Syntax overview
//!
//! ```text
//! {{ expr }}                          - Expression output
//! {% if cond %}...{% else %}...{% endif %}
//! {% for x in items %}...{% endfor %}
//! {% for k, v in object %}...{% endfor %}
//! {% include "partial" %}             - Template inclusion
//! {% extends "base" %}                - Template inheritance
//! {% block name %}...{% endblock %}   - Overridable block; super() renders the parent's body
//! {% set key = expr %}                - Assignment into the overlay data
//! {% raw %}...{% endraw %}            - Verbatim passthrough
//! {# comment #}                       - Produces no output
//! ## stmt                             - Whole-line statement
//! ```
//!
//! Delimiters are configurable, and the `-`/`+` flavours plus
//! `trim_blocks`/`lstrip_blocks` control surrounding whitespace.
//!
//! # Example
//!
//! ```
//! use serde_json::json;
//!
//! let env = safran::Environment::new();
//! let output = env
//!     .render("Hello {{ name }}!", &json!({"name": "world"}))
//!     .unwrap();
//! assert_eq!(output, "Hello world!");
//! ```

pub mod ast;
mod cache;
mod config;
mod environment;
mod error;
mod functions;
pub mod lexer;
mod parser;
mod render;
mod template;
pub mod token;
mod value;

pub use cache::{CachePredicate, CallbackCache, CallbackCacheConfig};
pub use config::{
    CallbackWrapper, IncludeCallback, InstrumentationCallback, InstrumentationData,
    InstrumentationEvent, LexerConfig, ParserConfig, RenderConfig,
};
pub use environment::{render, render_to, Environment, TemplateStorage};
pub use error::{Error, RenderErrorRecord, Result, SourceLocation};
pub use functions::{
    register_array_functions, Callback, FunctionStorage, InplaceCallback, Op, VARIADIC,
};
pub use template::{BlockSlot, Template};
pub use value::ValueExt;

// Re-exported so callers can build data with the same crate version.
pub use serde_json::Value;
