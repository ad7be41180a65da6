//! AST rendering.
//!
//! The renderer walks statement blocks depth-first, evaluating expressions
//! over a single tagged stack: each entry is either a computed value or a
//! missing-variable marker. Consumers that need a concrete value turn a
//! marker into an error, which in graceful mode is recorded instead of
//! raised and substituted with null.
//!
//! Loop variables and `set` bindings live in an overlay value (`additional
//! data`) consulted before the read-only input data. Inheritance renders
//! through a template stack with the leaf at index 0; `super()` re-renders
//! an ancestor's body for the block currently on the block stack.

use crate::ast::{
    Block, DataNode, Expression, ExpressionList, ForArrayStatement, ForObjectStatement,
    FunctionNode, IfStatement, SetStatement, Statement,
};
use crate::config::{InstrumentationData, InstrumentationEvent, RenderConfig};
use crate::environment::TemplateStorage;
use crate::error::{source_location, Error, RenderErrorRecord, Result};
use crate::functions::{Callback, FunctionStorage, Op};
use crate::template::Template;
use crate::value::{pointer_set, value_cmp, value_eq, ValueExt};
use serde_json::{json, Map, Value};
use std::cmp::Ordering;
use std::io::Write;

/// One entry on the combined evaluation stack.
#[derive(Debug)]
enum Evaluated {
    Val(Value),
    Missing { name: String, pos: usize },
}

pub(crate) struct Renderer<'r> {
    config: RenderConfig,
    template_storage: &'r TemplateStorage,
    function_storage: &'r FunctionStorage,
    data_input: &'r Value,
    /// Source text the current statement's spans index into; switches when
    /// rendering an inherited block body.
    current_content: &'r str,
    /// Inheritance chain, leaf template at index 0.
    template_stack: Vec<&'r Template>,
    /// Names of the blocks currently being rendered, for `super()`.
    block_stack: Vec<&'r str>,
    current_level: usize,
    additional_data: Value,
    eval_stack: Vec<Evaluated>,
    break_rendering: bool,
    render_errors: Vec<RenderErrorRecord>,
}

impl<'r> Renderer<'r> {
    pub(crate) fn new(
        config: RenderConfig,
        template_storage: &'r TemplateStorage,
        function_storage: &'r FunctionStorage,
        data_input: &'r Value,
    ) -> Self {
        Renderer {
            config,
            template_storage,
            function_storage,
            data_input,
            current_content: "",
            template_stack: Vec::new(),
            block_stack: Vec::new(),
            current_level: 0,
            additional_data: Value::Object(Map::new()),
            eval_stack: Vec::new(),
            break_rendering: false,
            render_errors: Vec::new(),
        }
    }

    pub(crate) fn set_additional_data(&mut self, data: Value) {
        self.additional_data = data;
    }

    pub(crate) fn take_render_errors(&mut self) -> Vec<RenderErrorRecord> {
        std::mem::take(&mut self.render_errors)
    }

    pub(crate) fn render_to(&mut self, out: &mut dyn Write, template: &'r Template) -> Result<()> {
        self.emit_event(InstrumentationEvent::RenderStart, "", "", 0);
        self.template_stack.push(template);
        self.current_content = template.content.as_str();
        let result = self.render_block_nodes(out, &template.root);
        self.emit_event(InstrumentationEvent::RenderEnd, "", "", 0);
        result
    }

    fn render_block_nodes(&mut self, out: &mut dyn Write, block: &'r Block) -> Result<()> {
        for node in &block.nodes {
            self.render_statement(out, node)?;
            if self.break_rendering {
                break;
            }
        }
        Ok(())
    }

    fn render_statement(&mut self, out: &mut dyn Write, node: &'r Statement) -> Result<()> {
        match node {
            Statement::Text { pos, len } | Statement::Raw { pos, len } => {
                out.write_all(self.current_content[*pos..*pos + *len].as_bytes())?;
                Ok(())
            }
            Statement::Expression(list) => self.render_expression_statement(out, list),
            Statement::If(node) => self.render_if(out, node),
            Statement::ForArray(node) => self.render_for_array(out, node),
            Statement::ForObject(node) => self.render_for_object(out, node),
            Statement::Include { name, pos } => self.render_include(out, name, *pos),
            Statement::Extends { name, pos } => self.render_extends(out, name, *pos),
            Statement::Block { name, pos: _ } => self.render_block_statement(out, name),
            Statement::Set(node) => self.render_set(out, node),
        }
    }

    fn render_expression_statement(
        &mut self,
        out: &mut dyn Write,
        list: &'r ExpressionList,
    ) -> Result<()> {
        match self.eval_expression_list(out, list)? {
            Some(value) => self.print_value(out, &value),
            None => {
                // Graceful fallback: the original tag text is echoed.
                if self.config.graceful_errors && list.len > 0 {
                    let span = &self.current_content[list.pos..list.pos + list.len];
                    out.write_all(span.as_bytes())?;
                }
                Ok(())
            }
        }
    }

    fn render_if(&mut self, out: &mut dyn Write, node: &'r IfStatement) -> Result<()> {
        let condition = self.eval_expression_list(out, &node.condition)?;
        let truthy = condition.as_ref().map(|value| value.is_truthy()).unwrap_or(false);
        if truthy {
            self.render_block_nodes(out, &node.true_branch)
        } else if let Some(false_branch) = &node.false_branch {
            self.render_block_nodes(out, false_branch)
        } else {
            Ok(())
        }
    }

    fn render_for_array(&mut self, out: &mut dyn Write, node: &'r ForArrayStatement) -> Result<()> {
        let Some(result) = self.eval_expression_list(out, &node.condition)? else {
            // Missing collection in graceful mode: no iterations, no output.
            return Ok(());
        };
        let Some(items) = result.as_array() else {
            return self.renderer_error(
                format!("object must be an array, found {}", result.type_name()),
                node.pos,
                String::new(),
            );
        };

        let size = items.len();
        self.emit_event(InstrumentationEvent::ForLoopStart, &node.value_name, "array", size);
        self.push_loop_data();
        for (index, item) in items.iter().enumerate() {
            self.set_additional(&node.value_name, item.clone());
            self.update_loop_data(index, size);
            self.emit_event(
                InstrumentationEvent::ForLoopIteration,
                &node.value_name,
                "",
                index,
            );
            self.render_block_nodes(out, &node.body)?;
        }
        self.remove_additional(&node.value_name);
        self.pop_loop_data();
        self.emit_event(InstrumentationEvent::ForLoopEnd, &node.value_name, "array", size);
        Ok(())
    }

    fn render_for_object(
        &mut self,
        out: &mut dyn Write,
        node: &'r ForObjectStatement,
    ) -> Result<()> {
        let Some(result) = self.eval_expression_list(out, &node.condition)? else {
            return Ok(());
        };
        let Some(entries) = result.as_object() else {
            return self.renderer_error(
                format!("object must be an object, found {}", result.type_name()),
                node.pos,
                String::new(),
            );
        };

        let size = entries.len();
        self.emit_event(InstrumentationEvent::ForLoopStart, &node.value_name, "object", size);
        self.push_loop_data();
        for (index, (key, value)) in entries.iter().enumerate() {
            self.set_additional(&node.key_name, Value::String(key.clone()));
            self.set_additional(&node.value_name, value.clone());
            self.update_loop_data(index, size);
            self.emit_event(
                InstrumentationEvent::ForLoopIteration,
                &node.value_name,
                "",
                index,
            );
            self.render_block_nodes(out, &node.body)?;
        }
        self.remove_additional(&node.key_name);
        self.remove_additional(&node.value_name);
        self.pop_loop_data();
        self.emit_event(InstrumentationEvent::ForLoopEnd, &node.value_name, "object", size);
        Ok(())
    }

    fn render_include(&mut self, out: &mut dyn Write, name: &str, pos: usize) -> Result<()> {
        self.emit_event(InstrumentationEvent::IncludeStart, name, "", 0);
        if let Some(template) = self.template_storage.get(name) {
            let mut sub = Renderer::new(
                self.config.clone(),
                self.template_storage,
                self.function_storage,
                self.data_input,
            );
            sub.set_additional_data(self.additional_data.clone());
            let result = sub.render_to(out, template.as_ref());
            self.render_errors.append(&mut sub.render_errors);
            result?;
            self.emit_event(InstrumentationEvent::IncludeEnd, name, "success", 0);
            Ok(())
        } else if self.config.throw_at_missing_includes {
            self.emit_event(InstrumentationEvent::IncludeEnd, name, "not_found", 0);
            self.renderer_error(format!("include '{name}' not found"), pos, String::new())
        } else {
            self.emit_event(InstrumentationEvent::IncludeEnd, name, "not_found_ignored", 0);
            Ok(())
        }
    }

    fn render_extends(&mut self, out: &mut dyn Write, name: &str, pos: usize) -> Result<()> {
        if let Some(parent) = self.template_storage.get(name) {
            self.render_to(out, parent.as_ref())?;
            // The rest of the extending template is layout only; skip it.
            self.break_rendering = true;
            Ok(())
        } else if self.config.throw_at_missing_includes {
            self.renderer_error(format!("extends '{name}' not found"), pos, String::new())
        } else {
            Ok(())
        }
    }

    fn render_block_statement(&mut self, out: &mut dyn Write, name: &'r str) -> Result<()> {
        let Some(leaf) = self.template_stack.first().copied() else {
            return Err(Error::render(
                "no template on the stack",
                source_location(self.current_content, 0),
            ));
        };
        // The leaf's block storage holds the effective body for every name
        // along the inheritance chain.
        if let Some(slot) = leaf.blocks.get(name) {
            let old_level = self.current_level;
            let old_content = self.current_content;
            self.current_level = 0;
            self.current_content = slot.content.as_str();
            self.block_stack.push(name);
            let result = self.render_block_nodes(out, &slot.body);
            self.block_stack.pop();
            self.current_level = old_level;
            self.current_content = old_content;
            result?;
        }
        Ok(())
    }

    fn render_set(&mut self, out: &mut dyn Write, node: &'r SetStatement) -> Result<()> {
        self.emit_event(InstrumentationEvent::SetStatementStart, &node.key, "", 0);
        if self.try_inplace_self_assignment(out, node)? {
            return Ok(());
        }
        match self.eval_expression_list(out, &node.expression)? {
            Some(value) => {
                pointer_set(&mut self.additional_data, &node.pointer, value);
                self.emit_event(InstrumentationEvent::SetStatementEnd, &node.key, "copy", 0);
            }
            None => {
                // Graceful: the failure is recorded, the target becomes null.
                pointer_set(&mut self.additional_data, &node.pointer, Value::Null);
                self.emit_event(
                    InstrumentationEvent::SetStatementEnd,
                    &node.key,
                    "null_graceful",
                    0,
                );
            }
        }
        Ok(())
    }

    /// The self-assignment fast path for `set k = f(k, …)`: when `f` has a
    /// registered in-place variant and `k` is already bound, the first
    /// argument is not re-evaluated; the in-place callback mutates the
    /// existing value, avoiding a copy of a potentially large container.
    ///
    /// A value still only present in the input data is seeded into the
    /// overlay once, so repeated self-assignments (e.g. appends in a loop)
    /// hit the fast path from then on.
    fn try_inplace_self_assignment(
        &mut self,
        out: &mut dyn Write,
        node: &'r SetStatement,
    ) -> Result<bool> {
        let Some(Expression::Function(func)) = node.expression.root.as_ref() else {
            return Ok(false);
        };
        if func.op != Op::Callback || func.args.is_empty() {
            return Ok(false);
        }
        let Expression::Data(first) = &func.args[0] else {
            return Ok(false);
        };
        if first.name != node.key {
            return Ok(false);
        }

        // The registry is consulted at render time, on this render's
        // snapshot, not with the parse-time binding.
        let inplace = self
            .function_storage
            .find_function(&func.name, func.args.len() as i32)
            .filter(|data| data.op == Op::Callback)
            .and_then(|data| data.inplace_callback);
        let Some(inplace) = inplace else {
            self.emit_event(
                InstrumentationEvent::InplaceOptSkipped,
                &node.key,
                &format!("no_inplace_cb:{}", func.name),
                0,
            );
            return Ok(false);
        };

        if self.additional_data.pointer(&node.pointer).is_none() {
            match self.data_input.pointer(&node.pointer) {
                Some(value) => {
                    // Seed the overlay from the input data once.
                    pointer_set(&mut self.additional_data, &node.pointer, value.clone());
                }
                None => {
                    self.emit_event(
                        InstrumentationEvent::InplaceOptSkipped,
                        &node.key,
                        &format!("var_not_exists:{}", func.name),
                        0,
                    );
                    return Ok(false);
                }
            }
        }

        let mut remaining = Vec::with_capacity(func.args.len() - 1);
        for arg in &func.args[1..] {
            self.eval_expression(out, arg)?;
            let evaluated = self.eval_stack.pop().ok_or_else(|| {
                Error::render(
                    "malformed expression",
                    source_location(self.current_content, func.pos),
                )
            })?;
            remaining.push(self.concrete(evaluated)?);
        }

        let Some(slot) = self.additional_data.pointer_mut(&node.pointer) else {
            return Ok(false);
        };
        let mut target = std::mem::take(slot);

        let call_result = match self.config.callback_wrapper.clone() {
            Some(wrapper) => {
                // The wrapper observes the remaining arguments and a small
                // synthetic result instead of the mutated container, which
                // would cost an O(n) copy. The mutation must happen exactly
                // once even if the wrapper skips the thunk (a caching
                // wrapper reporting a hit), hence the executed flag.
                let (result, executed) = {
                    let executed = std::cell::Cell::new(false);
                    let target_cell = std::cell::RefCell::new(&mut target);
                    let inplace_ref = &inplace;
                    let remaining_ref = &remaining;
                    let executed_ref = &executed;
                    let thunk = move || -> Result<Value> {
                        executed_ref.set(true);
                        let mut guard = target_cell.borrow_mut();
                        inplace_ref(&mut **guard, remaining_ref)?;
                        let size = guard.as_array().map(Vec::len).unwrap_or(0);
                        Ok(json!({ "_inplace": true, "size": size }))
                    };
                    let result = wrapper(&func.name, &remaining, &thunk);
                    (result, executed.get())
                };
                match result {
                    Ok(_) if !executed => inplace(&mut target, &remaining),
                    Ok(_) => Ok(()),
                    Err(err) => Err(err),
                }
            }
            None => inplace(&mut target, &remaining),
        };

        let size = target.as_array().map(Vec::len).unwrap_or(0);
        if let Some(slot) = self.additional_data.pointer_mut(&node.pointer) {
            *slot = target;
        }

        match call_result {
            Ok(()) => {
                self.emit_event(InstrumentationEvent::InplaceOptUsed, &node.key, &func.name, size);
                self.emit_event(InstrumentationEvent::SetStatementEnd, &node.key, "inplace", 0);
                Ok(true)
            }
            Err(err) if self.config.graceful_errors => {
                pointer_set(&mut self.additional_data, &node.pointer, Value::Null);
                self.emit_event(
                    InstrumentationEvent::SetStatementEnd,
                    &node.key,
                    "exception_graceful",
                    0,
                );
                tracing::warn!(key = %node.key, error = %err, "in-place assignment failed");
                Ok(true)
            }
            Err(err) => Err(err),
        }
    }

    // === Expression evaluation ===

    fn eval_expression_list(
        &mut self,
        out: &mut dyn Write,
        list: &'r ExpressionList,
    ) -> Result<Option<Value>> {
        self.emit_event(InstrumentationEvent::ExpressionEvalStart, "", "", 0);
        let result = self.eval_expression_list_inner(out, list);
        self.emit_event(InstrumentationEvent::ExpressionEvalEnd, "", "", 0);
        result
    }

    fn eval_expression_list_inner(
        &mut self,
        out: &mut dyn Write,
        list: &'r ExpressionList,
    ) -> Result<Option<Value>> {
        let Some(root) = &list.root else {
            let echo = self.echo_text(list);
            self.renderer_error("empty expression", list.pos, echo)?;
            return Ok(None);
        };

        let depth = self.eval_stack.len();
        self.eval_expression(out, root)?;
        if self.eval_stack.len() != depth + 1 {
            self.eval_stack.truncate(depth);
            let echo = self.echo_text(list);
            self.renderer_error("malformed expression", list.pos, echo)?;
            return Ok(None);
        }

        match self.eval_stack.pop() {
            Some(Evaluated::Val(value)) => Ok(Some(value)),
            Some(Evaluated::Missing { name, pos }) => {
                let echo = self.echo_text(list);
                self.renderer_error(format!("variable '{name}' not found"), pos, echo)?;
                Ok(None)
            }
            None => {
                let echo = self.echo_text(list);
                self.renderer_error("empty expression", list.pos, echo)?;
                Ok(None)
            }
        }
    }

    fn eval_expression(&mut self, out: &mut dyn Write, expression: &'r Expression) -> Result<()> {
        match expression {
            Expression::Literal(node) => {
                self.eval_stack.push(Evaluated::Val(node.value.clone()));
                Ok(())
            }
            Expression::Data(node) => self.eval_data(node),
            Expression::Function(node) => self.eval_function(out, node),
        }
    }

    /// Variable lookup: overlay data first, then input data, then a
    /// zero-argument callback of the same name.
    fn eval_data(&mut self, node: &'r DataNode) -> Result<()> {
        if let Some(value) = self.additional_data.pointer(&node.pointer) {
            self.eval_stack.push(Evaluated::Val(value.clone()));
            return Ok(());
        }
        if let Some(value) = self.data_input.pointer(&node.pointer) {
            self.eval_stack.push(Evaluated::Val(value.clone()));
            return Ok(());
        }
        if let Some(data) = self.function_storage.find_function(&node.name, 0) {
            if data.op == Op::Callback {
                if let Some(callback) = &data.callback {
                    match self.call_callback(&node.name, &[], callback) {
                        Ok(value) => {
                            self.eval_stack.push(Evaluated::Val(value));
                            return Ok(());
                        }
                        Err(err) => {
                            if !self.config.graceful_errors {
                                return Err(err);
                            }
                            self.renderer_error(
                                format!("callback '{}' failed: {err}", node.name),
                                node.pos,
                                String::new(),
                            )?;
                            self.eval_stack.push(Evaluated::Missing {
                                name: node.name.clone(),
                                pos: node.pos,
                            });
                            return Ok(());
                        }
                    }
                }
            }
        }
        self.eval_stack.push(Evaluated::Missing {
            name: node.name.clone(),
            pos: node.pos,
        });
        Ok(())
    }

    fn eval_function(&mut self, out: &mut dyn Write, node: &'r FunctionNode) -> Result<()> {
        match node.op {
            Op::Super => return self.eval_super(out, node),
            Op::Default => return self.eval_default(out, node),
            Op::Callback => return self.eval_callback(out, node),
            Op::None => {
                if self.config.graceful_errors {
                    self.eval_stack.push(Evaluated::Missing {
                        name: node.name.clone(),
                        pos: node.pos,
                    });
                    return Ok(());
                }
                return Err(self.hard_error(format!("unknown function '{}'", node.name), node.pos));
            }
            _ => {}
        }

        let args = self.eval_concrete_args(out, node)?;
        match self.apply_operation(node, &args) {
            Ok(value) => {
                self.eval_stack.push(Evaluated::Val(value));
                Ok(())
            }
            Err(message) => {
                if self.config.graceful_errors {
                    // The failed operation propagates as a missing entry;
                    // the consuming statement decides how to fall back.
                    self.eval_stack.push(Evaluated::Missing {
                        name: node.name.clone(),
                        pos: node.pos,
                    });
                    Ok(())
                } else {
                    Err(self.hard_error(message, node.pos))
                }
            }
        }
    }

    fn eval_concrete_args(
        &mut self,
        out: &mut dyn Write,
        node: &'r FunctionNode,
    ) -> Result<Vec<Value>> {
        let mut args = Vec::with_capacity(node.args.len());
        for arg in &node.args {
            self.eval_expression(out, arg)?;
            let evaluated = self.eval_stack.pop().ok_or_else(|| {
                Error::render(
                    "malformed expression",
                    source_location(self.current_content, node.pos),
                )
            })?;
            args.push(self.concrete(evaluated)?);
        }
        Ok(args)
    }

    /// Turns a stack entry into a concrete value. A missing entry raises in
    /// strict mode; in graceful mode it is recorded and becomes null so the
    /// surrounding operation can fail (and be recorded) on its own terms.
    fn concrete(&mut self, evaluated: Evaluated) -> Result<Value> {
        match evaluated {
            Evaluated::Val(value) => Ok(value),
            Evaluated::Missing { name, pos } => {
                self.renderer_error(format!("variable '{name}' not found"), pos, String::new())?;
                Ok(Value::Null)
            }
        }
    }

    fn eval_default(&mut self, out: &mut dyn Write, node: &'r FunctionNode) -> Result<()> {
        if node.args.len() != 2 {
            return Err(self.hard_error("default expects two arguments", node.pos));
        }
        self.eval_expression(out, &node.args[0])?;
        let first = self.eval_stack.pop().ok_or_else(|| {
            self.hard_error("malformed expression", node.pos)
        })?;
        match first {
            Evaluated::Val(value) => {
                self.eval_stack.push(Evaluated::Val(value));
                Ok(())
            }
            Evaluated::Missing { .. } => {
                // The fallback is evaluated normally; a missing fallback is
                // an error of its own.
                self.eval_expression(out, &node.args[1])?;
                let fallback = self.eval_stack.pop().ok_or_else(|| {
                    self.hard_error("malformed expression", node.pos)
                })?;
                let value = self.concrete(fallback)?;
                self.eval_stack.push(Evaluated::Val(value));
                Ok(())
            }
        }
    }

    fn eval_callback(&mut self, out: &mut dyn Write, node: &'r FunctionNode) -> Result<()> {
        let Some(callback) = &node.callback else {
            if self.config.graceful_errors {
                self.eval_stack.push(Evaluated::Missing {
                    name: node.name.clone(),
                    pos: node.pos,
                });
                return Ok(());
            }
            return Err(self.hard_error(
                format!("function '{}' not found or has no callback", node.name),
                node.pos,
            ));
        };

        let args = self.eval_concrete_args(out, node)?;
        match self.call_callback(&node.name, &args, callback) {
            Ok(value) => {
                self.eval_stack.push(Evaluated::Val(value));
                Ok(())
            }
            Err(err) => {
                if !self.config.graceful_errors {
                    return Err(err);
                }
                self.renderer_error(
                    format!("callback '{}' failed: {err}", node.name),
                    node.pos,
                    String::new(),
                )?;
                self.eval_stack.push(Evaluated::Missing {
                    name: node.name.clone(),
                    pos: node.pos,
                });
                Ok(())
            }
        }
    }

    fn eval_super(&mut self, out: &mut dyn Write, node: &'r FunctionNode) -> Result<()> {
        let args = self.eval_concrete_args(out, node)?;
        let level_diff = match args.first() {
            None => 1,
            Some(value) => match value.as_i64() {
                Some(diff) if diff >= 1 => diff as usize,
                _ => {
                    return Err(
                        self.hard_error("super() level must be a positive integer", node.pos)
                    );
                }
            },
        };

        if self.block_stack.is_empty() {
            return Err(self.hard_error("super() call is not within a block", node.pos));
        }
        let level = self.current_level + level_diff;
        if level < 1 || level + 1 > self.template_stack.len() {
            return Err(self.hard_error(
                format!(
                    "level of super() call does not match parent templates (between 1 and {})",
                    self.template_stack.len().saturating_sub(1)
                ),
                node.pos,
            ));
        }

        let Some(block_name) = self.block_stack.last().copied() else {
            return Err(self.hard_error("super() call is not within a block", node.pos));
        };
        let template = self.template_stack[level];
        let Some(slot) = template.blocks.get(block_name) else {
            return Err(self.hard_error(
                format!("could not find block with name '{block_name}'"),
                node.pos,
            ));
        };

        let old_level = self.current_level;
        let old_content = self.current_content;
        self.current_level = level;
        self.current_content = slot.content.as_str();
        let result = self.render_block_nodes(out, &slot.body);
        self.current_level = old_level;
        self.current_content = old_content;
        result?;

        // The ancestor body was written directly; the expression itself
        // produces nothing.
        self.eval_stack.push(Evaluated::Val(Value::Null));
        Ok(())
    }

    fn call_callback(&self, name: &str, args: &[Value], callback: &Callback) -> Result<Value> {
        match &self.config.callback_wrapper {
            Some(wrapper) => wrapper(name, args, &|| callback(args)),
            None => callback(args),
        }
    }

    /// Builtin operations over concrete argument values. Failures surface as
    /// complete messages; the caller decides between raising and recording.
    fn apply_operation(
        &self,
        node: &FunctionNode,
        args: &[Value],
    ) -> std::result::Result<Value, String> {
        let name = node.name.as_str();
        match node.op {
            Op::Not => Ok(Value::Bool(!arg(args, 0, name)?.is_truthy())),
            Op::And => Ok(Value::Bool(
                arg(args, 0, name)?.is_truthy() && arg(args, 1, name)?.is_truthy(),
            )),
            Op::Or => Ok(Value::Bool(
                arg(args, 0, name)?.is_truthy() || arg(args, 1, name)?.is_truthy(),
            )),
            Op::In => {
                let needle = arg(args, 0, name)?;
                match arg(args, 1, name)? {
                    Value::Array(items) => {
                        Ok(Value::Bool(items.iter().any(|item| value_eq(item, needle))))
                    }
                    Value::Object(entries) => Ok(Value::Bool(
                        entries.values().any(|item| value_eq(item, needle)),
                    )),
                    other => Err(op_failure(name, &format!("cannot search in {}", other.type_name()))),
                }
            }
            Op::Equal => Ok(Value::Bool(value_eq(arg(args, 0, name)?, arg(args, 1, name)?))),
            Op::NotEqual => Ok(Value::Bool(!value_eq(
                arg(args, 0, name)?,
                arg(args, 1, name)?,
            ))),
            Op::Greater => Ok(Value::Bool(
                compare(args, name)? == Ordering::Greater,
            )),
            Op::GreaterEqual => Ok(Value::Bool(compare(args, name)? != Ordering::Less)),
            Op::Less => Ok(Value::Bool(compare(args, name)? == Ordering::Less)),
            Op::LessEqual => Ok(Value::Bool(compare(args, name)? != Ordering::Greater)),
            Op::Add => {
                let (a, b) = (arg(args, 0, name)?, arg(args, 1, name)?);
                if let (Value::String(x), Value::String(y)) = (a, b) {
                    return Ok(Value::String(format!("{x}{y}")));
                }
                if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
                    return x
                        .checked_add(y)
                        .map(Value::from)
                        .ok_or_else(|| op_failure(name, "integer overflow"));
                }
                float_op(a, b, name, |x, y| x + y)
            }
            Op::Subtract => {
                let (a, b) = (arg(args, 0, name)?, arg(args, 1, name)?);
                if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
                    return x
                        .checked_sub(y)
                        .map(Value::from)
                        .ok_or_else(|| op_failure(name, "integer overflow"));
                }
                float_op(a, b, name, |x, y| x - y)
            }
            Op::Multiplication => {
                let (a, b) = (arg(args, 0, name)?, arg(args, 1, name)?);
                if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
                    return x
                        .checked_mul(y)
                        .map(Value::from)
                        .ok_or_else(|| op_failure(name, "integer overflow"));
                }
                float_op(a, b, name, |x, y| x * y)
            }
            Op::Division => {
                let (a, b) = (arg(args, 0, name)?, arg(args, 1, name)?);
                let x = a.as_f64().ok_or_else(|| op_failure(name, "expected a number"))?;
                let y = b.as_f64().ok_or_else(|| op_failure(name, "expected a number"))?;
                if y == 0.0 {
                    return Err("division by zero".to_string());
                }
                serde_json::Number::from_f64(x / y)
                    .map(Value::Number)
                    .ok_or_else(|| op_failure(name, "result is not a finite number"))
            }
            Op::Power => {
                let (a, b) = (arg(args, 0, name)?, arg(args, 1, name)?);
                if let (Some(base), Some(exp)) = (a.as_i64(), b.as_i64()) {
                    if exp >= 0 {
                        return u32::try_from(exp)
                            .ok()
                            .and_then(|exp| base.checked_pow(exp))
                            .map(Value::from)
                            .ok_or_else(|| op_failure(name, "integer overflow"));
                    }
                }
                float_op(a, b, name, f64::powf)
            }
            Op::Modulo => {
                let (a, b) = (arg(args, 0, name)?, arg(args, 1, name)?);
                let x = a.as_i64().ok_or_else(|| op_failure(name, "expected an integer"))?;
                let y = b.as_i64().ok_or_else(|| op_failure(name, "expected an integer"))?;
                x.checked_rem(y)
                    .map(Value::from)
                    .ok_or_else(|| "modulo by zero".to_string())
            }
            Op::At => {
                let (container, key) = (arg(args, 0, name)?, arg(args, 1, name)?);
                match container {
                    Value::Object(entries) => {
                        let key = key
                            .as_str()
                            .ok_or_else(|| op_failure(name, "object key must be a string"))?;
                        entries
                            .get(key)
                            .cloned()
                            .ok_or_else(|| format!("key '{key}' not found in object"))
                    }
                    Value::Array(items) => {
                        let index = key
                            .as_i64()
                            .ok_or_else(|| op_failure(name, "array index must be an integer"))?;
                        usize::try_from(index)
                            .ok()
                            .and_then(|index| items.get(index))
                            .cloned()
                            .ok_or_else(|| format!("index {index} out of bounds"))
                    }
                    _ => Err("cannot access element on non-container type".to_string()),
                }
            }
            Op::Capitalize => {
                let text = string_arg(args, 0, name)?;
                let mut chars = text.chars();
                Ok(Value::String(match chars.next() {
                    None => String::new(),
                    Some(first) => {
                        first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                    }
                }))
            }
            Op::DivisibleBy => {
                let x = int_arg(args, 0, name)?;
                let divisor = int_arg(args, 1, name)?;
                Ok(Value::Bool(divisor != 0 && x % divisor == 0))
            }
            Op::Even => Ok(Value::Bool(int_arg(args, 0, name)? % 2 == 0)),
            Op::Odd => Ok(Value::Bool(int_arg(args, 0, name)? % 2 != 0)),
            Op::Exists => {
                let dotted = string_arg(args, 0, name)?;
                let pointer = format!("/{}", dotted.replace('.', "/"));
                Ok(Value::Bool(self.data_input.pointer(&pointer).is_some()))
            }
            Op::ExistsInObject => {
                let container = arg(args, 0, name)?;
                let key = string_arg(args, 1, name)?;
                let entries = container
                    .as_object()
                    .ok_or_else(|| op_failure(name, "expected an object"))?;
                Ok(Value::Bool(entries.contains_key(key)))
            }
            Op::First => {
                let items = array_arg(args, 0, name)?;
                items
                    .first()
                    .cloned()
                    .ok_or_else(|| "cannot get first element of empty array".to_string())
            }
            Op::Last => {
                let items = array_arg(args, 0, name)?;
                items
                    .last()
                    .cloned()
                    .ok_or_else(|| "cannot get last element of empty array".to_string())
            }
            Op::Float => {
                let text = string_arg(args, 0, name)?;
                let parsed: f64 = text
                    .trim()
                    .parse()
                    .map_err(|_| op_failure(name, "string is not a number"))?;
                serde_json::Number::from_f64(parsed)
                    .map(Value::Number)
                    .ok_or_else(|| op_failure(name, "result is not a finite number"))
            }
            Op::Int => {
                let text = string_arg(args, 0, name)?;
                let parsed: i64 = text
                    .trim()
                    .parse()
                    .map_err(|_| op_failure(name, "string is not an integer"))?;
                Ok(Value::from(parsed))
            }
            Op::Length => match arg(args, 0, name)? {
                Value::String(text) => Ok(Value::from(text.len() as i64)),
                Value::Array(items) => Ok(Value::from(items.len() as i64)),
                Value::Object(entries) => Ok(Value::from(entries.len() as i64)),
                other => Err(op_failure(
                    name,
                    &format!("cannot take the length of {}", other.type_name()),
                )),
            },
            Op::Lower => Ok(Value::String(string_arg(args, 0, name)?.to_lowercase())),
            Op::Upper => Ok(Value::String(string_arg(args, 0, name)?.to_uppercase())),
            Op::Max => {
                let items = array_arg(args, 0, name)?;
                extremum(items, name, Ordering::Greater)
            }
            Op::Min => {
                let items = array_arg(args, 0, name)?;
                extremum(items, name, Ordering::Less)
            }
            Op::Range => {
                let n = int_arg(args, 0, name)?;
                Ok(Value::Array((0..n.max(0)).map(Value::from).collect()))
            }
            Op::Replace => {
                let text = string_arg(args, 0, name)?;
                let from = string_arg(args, 1, name)?;
                let to = string_arg(args, 2, name)?;
                Ok(Value::String(text.replace(from, to)))
            }
            Op::Round => {
                let x = arg(args, 0, name)?
                    .as_f64()
                    .ok_or_else(|| op_failure(name, "expected a number"))?;
                let precision = int_arg(args, 1, name)?;
                let factor = 10f64.powi(precision as i32);
                let rounded = (x * factor).round() / factor;
                if precision == 0 {
                    Ok(Value::from(rounded as i64))
                } else {
                    serde_json::Number::from_f64(rounded)
                        .map(Value::Number)
                        .ok_or_else(|| op_failure(name, "result is not a finite number"))
                }
            }
            Op::Sort => {
                let mut items = array_arg(args, 0, name)?.clone();
                items.sort_by(|a, b| value_cmp(a, b).unwrap_or(Ordering::Equal));
                Ok(Value::Array(items))
            }
            Op::Join => {
                let items = array_arg(args, 0, name)?;
                let separator = string_arg(args, 1, name)?;
                let parts: Vec<String> = items
                    .iter()
                    .map(|item| match item {
                        Value::String(text) => text.clone(),
                        other => other.dump(),
                    })
                    .collect();
                Ok(Value::String(parts.join(separator)))
            }
            Op::IsArray => Ok(Value::Bool(arg(args, 0, name)?.is_array())),
            Op::IsBoolean => Ok(Value::Bool(arg(args, 0, name)?.is_boolean())),
            Op::IsFloat => Ok(Value::Bool(arg(args, 0, name)?.is_f64())),
            Op::IsInteger => {
                let value = arg(args, 0, name)?;
                Ok(Value::Bool(value.is_i64() || value.is_u64()))
            }
            Op::IsNumber => Ok(Value::Bool(arg(args, 0, name)?.is_number())),
            Op::IsObject => Ok(Value::Bool(arg(args, 0, name)?.is_object())),
            Op::IsString => Ok(Value::Bool(arg(args, 0, name)?.is_string())),
            Op::Super | Op::Default | Op::Callback | Op::None => {
                Err(op_failure(name, "operation handled elsewhere"))
            }
        }
    }

    // === Output ===

    fn print_value(&self, out: &mut dyn Write, value: &Value) -> Result<()> {
        match value {
            Value::String(text) => {
                if self.config.html_autoescape {
                    out.write_all(html_escape(text).as_bytes())?;
                } else {
                    out.write_all(text.as_bytes())?;
                }
            }
            Value::Number(number) => write!(out, "{number}")?,
            Value::Null => {}
            other => out.write_all(other.dump().as_bytes())?,
        }
        Ok(())
    }

    // === Loop data ===

    fn set_additional(&mut self, name: &str, value: Value) {
        if let Some(map) = self.additional_data.as_object_mut() {
            map.insert(name.to_string(), value);
        }
    }

    fn remove_additional(&mut self, name: &str) {
        if let Some(map) = self.additional_data.as_object_mut() {
            map.remove(name);
        }
    }

    fn push_loop_data(&mut self) {
        let previous = self.additional_data.get("loop").cloned();
        let mut fresh = Map::new();
        if let Some(previous) = previous {
            if previous.as_object().map(|o| !o.is_empty()).unwrap_or(false) {
                fresh.insert("parent".to_string(), previous);
            }
        }
        self.set_additional("loop", Value::Object(fresh));
    }

    fn update_loop_data(&mut self, index: usize, size: usize) {
        if let Some(entries) = self
            .additional_data
            .get_mut("loop")
            .and_then(Value::as_object_mut)
        {
            entries.insert("index".to_string(), json!(index));
            entries.insert("index1".to_string(), json!(index + 1));
            entries.insert("is_first".to_string(), json!(index == 0));
            entries.insert("is_last".to_string(), json!(index + 1 == size));
        }
    }

    fn pop_loop_data(&mut self) {
        let parent = self
            .additional_data
            .get_mut("loop")
            .and_then(Value::as_object_mut)
            .and_then(|entries| entries.remove("parent"));
        match parent {
            Some(parent) => self.set_additional("loop", parent),
            None => self.remove_additional("loop"),
        }
    }

    // === Errors and events ===

    fn emit_event(&self, event: InstrumentationEvent, name: &str, detail: &str, count: usize) {
        if let Some(callback) = &self.config.instrumentation_callback {
            callback(&InstrumentationData {
                event,
                name: name.to_string(),
                detail: detail.to_string(),
                count,
            });
        }
    }

    fn echo_text(&self, list: &ExpressionList) -> String {
        if self.config.graceful_errors && list.len > 0 {
            self.current_content[list.pos..list.pos + list.len].to_string()
        } else {
            String::new()
        }
    }

    fn hard_error(&self, message: impl Into<String>, pos: usize) -> Error {
        Error::render(message, source_location(self.current_content, pos))
    }

    /// Raises in strict mode; records and continues in graceful mode.
    fn renderer_error(
        &mut self,
        message: impl Into<String>,
        pos: usize,
        original_text: String,
    ) -> Result<()> {
        let location = source_location(self.current_content, pos);
        let message = message.into();
        if self.config.graceful_errors {
            tracing::warn!(%message, line = location.line, column = location.column, "recoverable render error");
            self.render_errors.push(RenderErrorRecord {
                message,
                location,
                original_text,
            });
            Ok(())
        } else {
            Err(Error::render(message, location))
        }
    }
}

fn arg<'v>(args: &'v [Value], index: usize, name: &str) -> std::result::Result<&'v Value, String> {
    args.get(index)
        .ok_or_else(|| op_failure(name, "missing argument"))
}

fn string_arg<'v>(
    args: &'v [Value],
    index: usize,
    name: &str,
) -> std::result::Result<&'v str, String> {
    arg(args, index, name)?
        .as_str()
        .ok_or_else(|| op_failure(name, "expected a string"))
}

fn int_arg(args: &[Value], index: usize, name: &str) -> std::result::Result<i64, String> {
    arg(args, index, name)?
        .as_i64()
        .ok_or_else(|| op_failure(name, "expected an integer"))
}

fn array_arg<'v>(
    args: &'v [Value],
    index: usize,
    name: &str,
) -> std::result::Result<&'v Vec<Value>, String> {
    arg(args, index, name)?
        .as_array()
        .ok_or_else(|| op_failure(name, "expected an array"))
}

fn compare(args: &[Value], name: &str) -> std::result::Result<Ordering, String> {
    let a = arg(args, 0, name)?;
    let b = arg(args, 1, name)?;
    value_cmp(a, b).ok_or_else(|| {
        op_failure(
            name,
            &format!("cannot compare {} with {}", a.type_name(), b.type_name()),
        )
    })
}

fn float_op(
    a: &Value,
    b: &Value,
    name: &str,
    op: impl Fn(f64, f64) -> f64,
) -> std::result::Result<Value, String> {
    let x = a.as_f64().ok_or_else(|| op_failure(name, "expected a number"))?;
    let y = b.as_f64().ok_or_else(|| op_failure(name, "expected a number"))?;
    serde_json::Number::from_f64(op(x, y))
        .map(Value::Number)
        .ok_or_else(|| op_failure(name, "result is not a finite number"))
}

fn extremum(
    items: &[Value],
    name: &str,
    keep: Ordering,
) -> std::result::Result<Value, String> {
    let mut iter = items.iter();
    let Some(first) = iter.next() else {
        return Err(op_failure(name, "empty array"));
    };
    let mut best = first;
    for item in iter {
        let ordering = value_cmp(item, best)
            .ok_or_else(|| op_failure(name, "array elements are not comparable"))?;
        if ordering == keep {
            best = item;
        }
    }
    Ok(best.clone())
}

fn op_failure(name: &str, detail: &str) -> String {
    format!("operation '{name}' failed: {detail}")
}

fn html_escape(data: &str) -> String {
    let mut buffer = String::with_capacity(data.len() + data.len() / 8);
    for c in data.chars() {
        match c {
            '&' => buffer.push_str("&amp;"),
            '"' => buffer.push_str("&quot;"),
            '\'' => buffer.push_str("&apos;"),
            '<' => buffer.push_str("&lt;"),
            '>' => buffer.push_str("&gt;"),
            _ => buffer.push(c),
        }
    }
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_html_escape() {
        assert_eq!(
            html_escape(r#"<a href="x">'&'</a>"#),
            "&lt;a href=&quot;x&quot;&gt;&apos;&amp;&apos;&lt;/a&gt;"
        );
    }

    #[test]
    fn test_extremum() {
        let items = vec![json!(3), json!(1), json!(2)];
        assert_eq!(extremum(&items, "max", Ordering::Greater).unwrap(), json!(3));
        assert_eq!(extremum(&items, "min", Ordering::Less).unwrap(), json!(1));
        assert!(extremum(&[], "max", Ordering::Greater).is_err());
    }
}
