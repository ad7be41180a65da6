//! Builtin operations and the user-callback registry.
//!
//! The registry maps `(name, arity)` to a [`FunctionData`]: a builtin
//! operation identifier, or a user callback with an optional in-place
//! variant. Arity [`VARIADIC`] marks a fallback entry used when no
//! exact-arity entry matches.

use crate::environment::Environment;
use crate::error::{Error, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A user callback: receives the evaluated arguments, returns a value.
pub type Callback = Arc<dyn Fn(&[Value]) -> Result<Value> + Send + Sync>;

/// In-place variant of a callback: mutates its first argument instead of
/// returning a new value, enabling the self-assignment fast path for
/// `set x = f(x, …)`.
pub type InplaceCallback = Arc<dyn Fn(&mut Value, &[Value]) -> Result<()> + Send + Sync>;

/// Registry arity that matches any number of arguments greater than zero.
pub const VARIADIC: i32 = -1;

/// Identifier of a builtin operation, or [`Op::Callback`] for user functions.
/// [`Op::None`] marks an unknown function deferred to render time in
/// graceful mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Not,
    And,
    Or,
    In,
    Equal,
    NotEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    Add,
    Subtract,
    Multiplication,
    Division,
    Power,
    Modulo,
    At,
    Capitalize,
    Default,
    DivisibleBy,
    Even,
    Exists,
    ExistsInObject,
    First,
    Float,
    Int,
    IsArray,
    IsBoolean,
    IsFloat,
    IsInteger,
    IsNumber,
    IsObject,
    IsString,
    Last,
    Length,
    Lower,
    Max,
    Min,
    Odd,
    Range,
    Replace,
    Round,
    Sort,
    Upper,
    Super,
    Join,
    Callback,
    None,
}

/// A registry entry.
#[derive(Clone)]
pub struct FunctionData {
    pub op: Op,
    pub callback: Option<Callback>,
    pub inplace_callback: Option<InplaceCallback>,
}

impl FunctionData {
    fn builtin(op: Op) -> Self {
        FunctionData {
            op,
            callback: None,
            inplace_callback: None,
        }
    }
}

impl std::fmt::Debug for FunctionData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionData")
            .field("op", &self.op)
            .field("callback", &self.callback.is_some())
            .field("inplace_callback", &self.inplace_callback.is_some())
            .finish()
    }
}

/// Storage for builtin functions and user-defined callbacks, keyed by
/// `(name, arity)`. Append-only: entries are added, never removed.
#[derive(Clone)]
pub struct FunctionStorage {
    map: BTreeMap<(String, i32), FunctionData>,
}

impl Default for FunctionStorage {
    fn default() -> Self {
        let mut storage = FunctionStorage {
            map: BTreeMap::new(),
        };
        let builtins: &[(&str, i32, Op)] = &[
            ("at", 2, Op::At),
            ("capitalize", 1, Op::Capitalize),
            ("default", 2, Op::Default),
            ("divisibleBy", 2, Op::DivisibleBy),
            ("even", 1, Op::Even),
            ("exists", 1, Op::Exists),
            ("existsIn", 2, Op::ExistsInObject),
            ("first", 1, Op::First),
            ("float", 1, Op::Float),
            ("int", 1, Op::Int),
            ("isArray", 1, Op::IsArray),
            ("isBoolean", 1, Op::IsBoolean),
            ("isFloat", 1, Op::IsFloat),
            ("isInteger", 1, Op::IsInteger),
            ("isNumber", 1, Op::IsNumber),
            ("isObject", 1, Op::IsObject),
            ("isString", 1, Op::IsString),
            ("last", 1, Op::Last),
            ("length", 1, Op::Length),
            ("lower", 1, Op::Lower),
            ("max", 1, Op::Max),
            ("min", 1, Op::Min),
            ("odd", 1, Op::Odd),
            ("range", 1, Op::Range),
            ("replace", 3, Op::Replace),
            ("round", 2, Op::Round),
            ("sort", 1, Op::Sort),
            ("upper", 1, Op::Upper),
            ("super", 0, Op::Super),
            ("super", 1, Op::Super),
            ("join", 2, Op::Join),
        ];
        for (name, arity, op) in builtins {
            storage.add_builtin(name, *arity, *op);
        }
        storage
    }
}

impl FunctionStorage {
    pub fn add_builtin(&mut self, name: &str, num_args: i32, op: Op) {
        self.map
            .insert((name.to_string(), num_args), FunctionData::builtin(op));
    }

    pub fn add_callback(&mut self, name: &str, num_args: i32, callback: Callback) {
        self.map.insert(
            (name.to_string(), num_args),
            FunctionData {
                op: Op::Callback,
                callback: Some(callback),
                inplace_callback: None,
            },
        );
    }

    pub fn add_callback_with_inplace(
        &mut self,
        name: &str,
        num_args: i32,
        callback: Callback,
        inplace_callback: InplaceCallback,
    ) {
        self.map.insert(
            (name.to_string(), num_args),
            FunctionData {
                op: Op::Callback,
                callback: Some(callback),
                inplace_callback: Some(inplace_callback),
            },
        );
    }

    /// Looks up `(name, num_args)`, preferring an exact arity over a
    /// variadic entry. Zero-argument calls never match the variadic entry.
    pub fn find_function(&self, name: &str, num_args: i32) -> Option<FunctionData> {
        if let Some(data) = self.map.get(&(name.to_string(), num_args)) {
            return Some(data.clone());
        }
        if num_args > 0 {
            return self.map.get(&(name.to_string(), VARIADIC)).cloned();
        }
        None
    }
}

/// Registers array-manipulation callbacks on an environment.
///
/// `append(arr, x)` comes with an in-place variant, so
/// `{% set xs = append(xs, v) %}` mutates the existing array instead of
/// copying it.
pub fn register_array_functions(env: &Environment) {
    env.add_callback_with_inplace(
        "append",
        2,
        |args: &[Value]| {
            let mut array = args
                .first()
                .and_then(Value::as_array)
                .cloned()
                .ok_or_else(|| Error::callback("append expects an array as first argument"))?;
            array.push(args.get(1).cloned().unwrap_or(Value::Null));
            Ok(Value::Array(array))
        },
        |target: &mut Value, rest: &[Value]| {
            let array = target
                .as_array_mut()
                .ok_or_else(|| Error::callback("append expects an array as first argument"))?;
            array.push(rest.first().cloned().unwrap_or(Value::Null));
            Ok(())
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_arity_preferred_over_variadic() {
        let mut storage = FunctionStorage::default();
        storage.add_callback("f", VARIADIC, Arc::new(|_| Ok(Value::from("variadic"))));
        storage.add_callback("f", 2, Arc::new(|_| Ok(Value::from("exact"))));

        let exact = storage.find_function("f", 2).unwrap();
        let value = (exact.callback.unwrap())(&[]).unwrap();
        assert_eq!(value, Value::from("exact"));

        let fallback = storage.find_function("f", 3).unwrap();
        let value = (fallback.callback.unwrap())(&[]).unwrap();
        assert_eq!(value, Value::from("variadic"));
    }

    #[test]
    fn test_variadic_does_not_match_zero_args() {
        let mut storage = FunctionStorage::default();
        storage.add_callback("f", VARIADIC, Arc::new(|_| Ok(Value::Null)));
        assert!(storage.find_function("f", 0).is_none());
    }

    #[test]
    fn test_builtins_present() {
        let storage = FunctionStorage::default();
        assert_eq!(storage.find_function("upper", 1).unwrap().op, Op::Upper);
        assert_eq!(storage.find_function("super", 0).unwrap().op, Op::Super);
        assert_eq!(storage.find_function("super", 1).unwrap().op, Op::Super);
        assert!(storage.find_function("upper", 2).is_none());
    }
}
