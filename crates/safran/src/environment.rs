//! The engine's public entry point.
//!
//! An [`Environment`] owns configuration, the function and template
//! storages, and an optional callback cache, and exposes the parse/render
//! API. Multiple threads may parse and render against the same environment
//! concurrently:
//!
//! - Both storages are copy-on-write snapshots behind an atomic swap:
//!   readers clone the `Arc` and keep that snapshot for the whole call,
//!   writers clone the storage, mutate, and publish. A render started
//!   before `add_callback` or `include_template` never observes the write.
//! - The render config contains function-valued fields, so it is cloned
//!   under its lock at render entry to prevent torn reads.
//! - Templates discovered while parsing accumulate in a call-local cache
//!   that is merged into shared storage only when the parse succeeds.
//! - Graceful-mode render errors land in a thread-local list, so each
//!   caller retrieves its own.

use crate::cache::{CachePredicate, CallbackCache, CallbackCacheConfig};
use crate::config::{
    CallbackWrapper, IncludeCallback, InstrumentationCallback, LexerConfig, ParserConfig,
    RenderConfig,
};
use crate::error::{Error, RenderErrorRecord, Result};
use crate::functions::{Callback, FunctionStorage, InplaceCallback};
use crate::parser::{ParseState, Parser};
use crate::render::Renderer;
use crate::template::Template;
use camino::{Utf8Path, Utf8PathBuf};
use serde_json::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex, RwLock};

/// Shared template storage: name to parsed template.
pub type TemplateStorage = HashMap<String, Arc<Template>>;

thread_local! {
    static LAST_RENDER_ERRORS: RefCell<Vec<RenderErrorRecord>> = RefCell::new(Vec::new());
}

pub struct Environment {
    lexer_config: LexerConfig,
    parser_config: ParserConfig,
    render_config: Mutex<RenderConfig>,
    function_storage: RwLock<Arc<FunctionStorage>>,
    template_storage: RwLock<Arc<TemplateStorage>>,
    callback_cache: Mutex<Option<Arc<CallbackCache>>>,
    input_path: Utf8PathBuf,
    output_path: Utf8PathBuf,
}

impl Default for Environment {
    fn default() -> Self {
        Environment::new()
    }
}

impl Environment {
    pub fn new() -> Self {
        Environment::with_paths(Utf8PathBuf::new(), Utf8PathBuf::new())
    }

    /// Uses `path` as both the input root (template and data loading) and
    /// the output root (`write`).
    pub fn with_root(path: impl Into<Utf8PathBuf>) -> Self {
        let path = path.into();
        Environment::with_paths(path.clone(), path)
    }

    pub fn with_paths(
        input_path: impl Into<Utf8PathBuf>,
        output_path: impl Into<Utf8PathBuf>,
    ) -> Self {
        Environment {
            lexer_config: LexerConfig::default(),
            parser_config: ParserConfig::default(),
            render_config: Mutex::new(RenderConfig::default()),
            function_storage: RwLock::new(Arc::new(FunctionStorage::default())),
            template_storage: RwLock::new(Arc::new(TemplateStorage::new())),
            callback_cache: Mutex::new(None),
            input_path: input_path.into(),
            output_path: output_path.into(),
        }
    }

    // === Configuration ===

    /// Sets the opener and closer for template statements; the `+`/`-`
    /// variants are derived.
    pub fn set_statement(&mut self, open: &str, close: &str) {
        self.lexer_config.statement_open = open.to_string();
        self.lexer_config.statement_open_no_lstrip = format!("{open}+");
        self.lexer_config.statement_open_force_lstrip = format!("{open}-");
        self.lexer_config.statement_close = close.to_string();
        self.lexer_config.statement_close_force_rstrip = format!("-{close}");
        self.lexer_config.update_open_chars();
    }

    /// Sets the prefix for whole-line statements.
    pub fn set_line_statement(&mut self, open: &str) {
        self.lexer_config.line_statement = open.to_string();
        self.lexer_config.update_open_chars();
    }

    /// Sets the opener and closer for expressions.
    pub fn set_expression(&mut self, open: &str, close: &str) {
        self.lexer_config.expression_open = open.to_string();
        self.lexer_config.expression_open_force_lstrip = format!("{open}-");
        self.lexer_config.expression_close = close.to_string();
        self.lexer_config.expression_close_force_rstrip = format!("-{close}");
        self.lexer_config.update_open_chars();
    }

    /// Sets the opener and closer for comments.
    pub fn set_comment(&mut self, open: &str, close: &str) {
        self.lexer_config.comment_open = open.to_string();
        self.lexer_config.comment_open_force_lstrip = format!("{open}-");
        self.lexer_config.comment_close = close.to_string();
        self.lexer_config.comment_close_force_rstrip = format!("-{close}");
        self.lexer_config.update_open_chars();
    }

    /// Remove the first newline after a statement or comment block.
    pub fn set_trim_blocks(&mut self, trim_blocks: bool) {
        self.lexer_config.trim_blocks = trim_blocks;
    }

    /// Strip spaces and tabs from the start of a line to a statement.
    pub fn set_lstrip_blocks(&mut self, lstrip_blocks: bool) {
        self.lexer_config.lstrip_blocks = lstrip_blocks;
    }

    /// Resolve `include`/`extends` against the file system under the input
    /// root.
    pub fn set_search_included_templates_in_files(&mut self, search_in_files: bool) {
        self.parser_config.search_included_templates_in_files = search_in_files;
    }

    /// Fallback resolver called when an included template cannot be found.
    pub fn set_include_callback(&mut self, callback: IncludeCallback) {
        self.parser_config.include_callback = Some(callback);
    }

    /// Whether a missing include raises an error (thread-safe).
    pub fn set_throw_at_missing_includes(&self, will_throw: bool) {
        self.render_config.lock().unwrap().throw_at_missing_includes = will_throw;
    }

    /// Whether string values from expression output are HTML-escaped
    /// (thread-safe).
    pub fn set_html_autoescape(&self, will_escape: bool) {
        self.render_config.lock().unwrap().html_autoescape = will_escape;
    }

    /// Graceful error handling: unknown functions survive parsing, and
    /// recoverable render errors are recorded while the original template
    /// text (or null, for assignments) is emitted.
    pub fn set_graceful_errors(&mut self, graceful: bool) {
        self.parser_config.graceful_errors = graceful;
        self.render_config.lock().unwrap().graceful_errors = graceful;
    }

    /// Routes every user-callback invocation through `wrapper`, for timing,
    /// tracing, or caching (thread-safe).
    pub fn set_callback_wrapper(&self, wrapper: CallbackWrapper) {
        self.render_config.lock().unwrap().callback_wrapper = Some(wrapper);
    }

    pub fn clear_callback_wrapper(&self) {
        self.render_config.lock().unwrap().callback_wrapper = None;
    }

    /// Receiver for instrumentation events emitted during rendering
    /// (thread-safe).
    pub fn set_instrumentation_callback(&self, callback: InstrumentationCallback) {
        self.render_config.lock().unwrap().instrumentation_callback = Some(callback);
    }

    pub fn clear_instrumentation_callback(&self) {
        self.render_config.lock().unwrap().instrumentation_callback = None;
    }

    // === Callbacks (copy-on-write) ===

    /// Adds a callback with the given arity ([`crate::VARIADIC`] matches
    /// any argument count). Renders in progress keep the old storage; the
    /// new one is visible to subsequent parses and renders.
    pub fn add_callback<F>(&self, name: &str, num_args: i32, callback: F)
    where
        F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(callback);
        self.publish_functions(|storage| storage.add_callback(name, num_args, callback));
    }

    /// Adds a callback together with an in-place variant used by the
    /// self-assignment fast path (`set x = f(x, …)`).
    pub fn add_callback_with_inplace<F, G>(&self, name: &str, num_args: i32, callback: F, inplace: G)
    where
        F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
        G: Fn(&mut Value, &[Value]) -> Result<()> + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(callback);
        let inplace: InplaceCallback = Arc::new(inplace);
        self.publish_functions(|storage| {
            storage.add_callback_with_inplace(name, num_args, callback, inplace)
        });
    }

    /// Adds a callback that is invoked for its side effects and renders as
    /// null.
    pub fn add_void_callback<F>(&self, name: &str, num_args: i32, callback: F)
    where
        F: Fn(&[Value]) -> Result<()> + Send + Sync + 'static,
    {
        self.add_callback(name, num_args, move |args| {
            callback(args)?;
            Ok(Value::Null)
        });
    }

    fn publish_functions(&self, mutate: impl FnOnce(&mut FunctionStorage)) {
        let mut guard = self.function_storage.write().unwrap();
        let mut next = (**guard).clone();
        mutate(&mut next);
        *guard = Arc::new(next);
    }

    // === Templates (copy-on-write) ===

    /// Publishes a parsed template under a name, so `include "<name>"` and
    /// `extends "<name>"` can find it.
    pub fn include_template(&self, name: &str, template: Template) {
        let mut guard = self.template_storage.write().unwrap();
        let mut next = (**guard).clone();
        next.insert(name.to_string(), Arc::new(template));
        *guard = Arc::new(next);
        tracing::debug!(template = name, "published template");
    }

    fn merge_parse_cache(&self, state: ParseState) {
        if state.cache.is_empty() {
            return;
        }
        let count = state.cache.len();
        let mut guard = self.template_storage.write().unwrap();
        let mut next = (**guard).clone();
        for (name, template) in state.cache {
            next.entry(name).or_insert(template);
        }
        *guard = Arc::new(next);
        tracing::debug!(templates = count, "merged parse cache into template storage");
    }

    // === Parsing ===

    pub fn parse(&self, input: &str) -> Result<Template> {
        let function_storage = self.function_storage.read().unwrap().clone();
        let template_storage = self.template_storage.read().unwrap().clone();
        let parser = Parser::new(
            &self.parser_config,
            &self.lexer_config,
            &function_storage,
            &template_storage,
            &self.input_path,
        );
        let mut state = ParseState::new();
        let template = parser.parse(input, &mut state)?;
        self.merge_parse_cache(state);
        Ok(template)
    }

    /// Loads and parses a template file under the input root.
    pub fn parse_template(&self, filename: impl AsRef<Utf8Path>) -> Result<Template> {
        let filename = filename.as_ref();
        let content = self.load_file(filename)?;
        let function_storage = self.function_storage.read().unwrap().clone();
        let template_storage = self.template_storage.read().unwrap().clone();
        let parser = Parser::new(
            &self.parser_config,
            &self.lexer_config,
            &function_storage,
            &template_storage,
            &self.input_path,
        );
        let mut state = ParseState::new();
        let template = parser.parse_named(&content, Some(filename.as_str()), &mut state)?;
        self.merge_parse_cache(state);
        Ok(template)
    }

    // === Rendering ===

    pub fn render(&self, input: &str, data: &Value) -> Result<String> {
        let template = self.parse(input)?;
        self.render_template(&template, data)
    }

    pub fn render_template(&self, template: &Template, data: &Value) -> Result<String> {
        let mut buffer = Vec::new();
        self.render_to(&mut buffer, template, data)?;
        String::from_utf8(buffer).map_err(|_| Error::Data {
            message: "rendered output was not valid UTF-8".to_string(),
        })
    }

    /// Renders into a caller-supplied stream. Storage snapshots and the
    /// render config are taken once at entry; concurrent writes affect only
    /// subsequent renders.
    pub fn render_to(&self, out: &mut dyn Write, template: &Template, data: &Value) -> Result<()> {
        LAST_RENDER_ERRORS.with(|errors| errors.borrow_mut().clear());
        let template_storage = self.template_storage.read().unwrap().clone();
        let function_storage = self.function_storage.read().unwrap().clone();
        let config = self.render_config.lock().unwrap().clone();
        let mut renderer = Renderer::new(config, &template_storage, &function_storage, data);
        let result = renderer.render_to(out, template);
        LAST_RENDER_ERRORS.with(|errors| *errors.borrow_mut() = renderer.take_render_errors());
        result
    }

    pub fn render_file(&self, filename: impl AsRef<Utf8Path>, data: &Value) -> Result<String> {
        let template = self.parse_template(filename)?;
        self.render_template(&template, data)
    }

    pub fn render_file_with_json_file(
        &self,
        filename: impl AsRef<Utf8Path>,
        data_filename: impl AsRef<Utf8Path>,
    ) -> Result<String> {
        let data = self.load_json(data_filename)?;
        self.render_file(filename, &data)
    }

    /// Renders a template file and writes the result under the output root.
    pub fn write(
        &self,
        filename: impl AsRef<Utf8Path>,
        data: &Value,
        output_filename: impl AsRef<Utf8Path>,
    ) -> Result<()> {
        let rendered = self.render_file(filename, data)?;
        self.write_output(&rendered, output_filename.as_ref())
    }

    pub fn write_template(
        &self,
        template: &Template,
        data: &Value,
        output_filename: impl AsRef<Utf8Path>,
    ) -> Result<()> {
        let rendered = self.render_template(template, data)?;
        self.write_output(&rendered, output_filename.as_ref())
    }

    pub fn write_with_json_file(
        &self,
        filename: impl AsRef<Utf8Path>,
        data_filename: impl AsRef<Utf8Path>,
        output_filename: impl AsRef<Utf8Path>,
    ) -> Result<()> {
        let data = self.load_json(data_filename)?;
        self.write(filename, &data, output_filename)
    }

    fn write_output(&self, rendered: &str, output_filename: &Utf8Path) -> Result<()> {
        let path = self.output_path.join(output_filename);
        std::fs::write(path.as_std_path(), rendered)
            .map_err(|err| Error::file(format!("failed writing file at '{path}': {err}")))
    }

    // === File loading ===

    pub fn load_file(&self, filename: impl AsRef<Utf8Path>) -> Result<String> {
        let path = self.input_path.join(filename.as_ref());
        std::fs::read_to_string(path.as_std_path())
            .map_err(|err| Error::file(format!("failed accessing file at '{path}': {err}")))
    }

    pub fn load_json(&self, filename: impl AsRef<Utf8Path>) -> Result<Value> {
        let content = self.load_file(filename)?;
        serde_json::from_str(&content).map_err(|err| Error::Data {
            message: err.to_string(),
        })
    }

    // === Render errors (per thread) ===

    /// The errors recorded by this thread's most recent graceful render.
    pub fn last_render_errors(&self) -> Vec<RenderErrorRecord> {
        LAST_RENDER_ERRORS.with(|errors| errors.borrow().clone())
    }

    pub fn clear_render_errors(&self) {
        LAST_RENDER_ERRORS.with(|errors| errors.borrow_mut().clear());
    }

    // === Callback cache ===

    /// Enables callback-result caching; the cache's wrapper becomes this
    /// environment's callback wrapper.
    pub fn enable_callback_cache(&self, config: CallbackCacheConfig) {
        let cache = Arc::new(CallbackCache::new(config));
        self.install_cache(cache, None, None);
    }

    /// Enables caching with a predicate vetoing specific function names
    /// (side-effectful or non-deterministic callbacks).
    pub fn enable_callback_cache_with_predicate(
        &self,
        config: CallbackCacheConfig,
        predicate: CachePredicate,
    ) {
        let cache = Arc::new(CallbackCache::new(config));
        self.install_cache(cache, Some(predicate), None);
    }

    /// Enables caching chained over an inner wrapper (e.g. tracing); the
    /// inner wrapper runs on cache misses only.
    pub fn enable_callback_cache_with_wrapper(
        &self,
        config: CallbackCacheConfig,
        inner: CallbackWrapper,
        predicate: Option<CachePredicate>,
    ) {
        let cache = Arc::new(CallbackCache::new(config));
        self.install_cache(cache, predicate, Some(inner));
    }

    /// Shares an existing cache instance with this environment.
    pub fn set_callback_cache(&self, cache: Arc<CallbackCache>, predicate: Option<CachePredicate>) {
        self.install_cache(cache, predicate, None);
    }

    fn install_cache(
        &self,
        cache: Arc<CallbackCache>,
        predicate: Option<CachePredicate>,
        inner: Option<CallbackWrapper>,
    ) {
        if let Some(predicate) = predicate {
            cache.set_cache_predicate(predicate);
        }
        let wrapper = match inner {
            Some(inner) => Arc::clone(&cache).make_caching_wrapper_with_inner(inner),
            None => Arc::clone(&cache).make_caching_wrapper(),
        };
        *self.callback_cache.lock().unwrap() = Some(cache);
        self.render_config.lock().unwrap().callback_wrapper = Some(wrapper);
    }

    /// Disables caching and removes the caching wrapper. A wrapper set
    /// before caching was enabled must be re-set by the caller.
    pub fn disable_callback_cache(&self) {
        *self.callback_cache.lock().unwrap() = None;
        self.render_config.lock().unwrap().callback_wrapper = None;
    }

    pub fn callback_cache(&self) -> Option<Arc<CallbackCache>> {
        self.callback_cache.lock().unwrap().clone()
    }

    pub fn clear_callback_cache(&self) {
        if let Some(cache) = self.callback_cache() {
            cache.clear();
        }
    }

    /// Invalidates cached entries for one callback; returns how many were
    /// removed.
    pub fn invalidate_callback_cache(&self, function_name: &str) -> usize {
        self.callback_cache()
            .map(|cache| cache.invalidate(function_name))
            .unwrap_or(0)
    }
}

/// Renders `input` against `data` with default settings.
pub fn render(input: &str, data: &Value) -> Result<String> {
    Environment::new().render(input, data)
}

/// Renders `input` against `data` into the given stream with default
/// settings.
pub fn render_to(out: &mut dyn Write, input: &str, data: &Value) -> Result<()> {
    let env = Environment::new();
    let template = env.parse(input)?;
    env.render_to(out, &template, data)
}
