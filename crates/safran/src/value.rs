//! Extensions over the JSON value algebra.
//!
//! Templates operate on [`serde_json::Value`] trees. This module adds the
//! handful of operations the engine needs beyond what the value type itself
//! offers: truthiness, type names, compact serialisation, ordering for
//! comparisons and `sort`, and pointer-creating assignment for `set`.

use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Helper trait extending [`Value`] with template-specific operations.
pub trait ValueExt {
    /// Truthiness for conditionals: booleans as themselves, numbers truthy
    /// iff non-zero, null false, containers and strings truthy iff non-empty.
    fn is_truthy(&self) -> bool;

    /// A human-readable type name for error messages.
    fn type_name(&self) -> &'static str;

    /// Compact JSON serialisation.
    fn dump(&self) -> String;
}

impl ValueExt for Value {
    fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    i != 0
                } else if let Some(u) = n.as_u64() {
                    u != 0
                } else {
                    n.as_f64().map(|f| f != 0.0).unwrap_or(true)
                }
            }
            Value::String(s) => !s.is_empty(),
            Value::Array(a) => !a.is_empty(),
            Value::Object(o) => !o.is_empty(),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    fn dump(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Equality with cross-representation numeric comparison (`1 == 1.0`).
pub(crate) fn value_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(xi), Some(yi)) = (x.as_i64(), y.as_i64()) {
                xi == yi
            } else {
                match (x.as_f64(), y.as_f64()) {
                    (Some(xf), Some(yf)) => xf == yf,
                    _ => false,
                }
            }
        }
        _ => a == b,
    }
}

/// Ordering used by comparisons, `sort`, `max`, and `min`. Returns `None`
/// for values of incomparable types.
pub(crate) fn value_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(xi), Some(yi)) = (x.as_i64(), y.as_i64()) {
                Some(xi.cmp(&yi))
            } else {
                x.as_f64()?.partial_cmp(&y.as_f64()?)
            }
        }
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Array(x), Value::Array(y)) => {
            for (xe, ye) in x.iter().zip(y.iter()) {
                match value_cmp(xe, ye)? {
                    Ordering::Equal => continue,
                    other => return Some(other),
                }
            }
            Some(x.len().cmp(&y.len()))
        }
        _ => None,
    }
}

/// Writes `value` at a slash-delimited pointer inside `target`, creating
/// intermediate objects along the way. Non-object values on the path are
/// replaced, matching how assignment into the overlay tree behaves for
/// `set a.b = …` after `set a = 1`.
pub(crate) fn pointer_set(target: &mut Value, pointer: &str, value: Value) {
    fn set_inner<'a>(
        current: &mut Value,
        mut tokens: impl Iterator<Item = &'a str>,
        value: Value,
    ) {
        match tokens.next() {
            None => *current = value,
            Some(token) => {
                if !current.is_object() {
                    *current = Value::Object(Map::new());
                }
                if let Some(map) = current.as_object_mut() {
                    let slot = map.entry(token.to_string()).or_insert(Value::Null);
                    set_inner(slot, tokens, value);
                }
            }
        }
    }

    let mut tokens = pointer.split('/');
    tokens.next(); // pointer starts with '/'
    set_inner(target, tokens, value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(json!(true).is_truthy());
        assert!(!json!(false).is_truthy());
        assert!(json!(1).is_truthy());
        assert!(!json!(0).is_truthy());
        assert!(!json!(0.0).is_truthy());
        assert!(json!("x").is_truthy());
        assert!(!json!("").is_truthy());
        assert!(json!([1]).is_truthy());
        assert!(!json!([]).is_truthy());
        assert!(!json!({}).is_truthy());
    }

    #[test]
    fn test_numeric_equality_across_representations() {
        assert!(value_eq(&json!(1), &json!(1.0)));
        assert!(!value_eq(&json!(1), &json!(2)));
        assert!(value_eq(&json!("a"), &json!("a")));
    }

    #[test]
    fn test_ordering() {
        assert_eq!(value_cmp(&json!(1), &json!(2)), Some(Ordering::Less));
        assert_eq!(value_cmp(&json!(2.5), &json!(2)), Some(Ordering::Greater));
        assert_eq!(value_cmp(&json!("a"), &json!("b")), Some(Ordering::Less));
        assert_eq!(value_cmp(&json!(1), &json!("a")), None);
        assert_eq!(
            value_cmp(&json!([1, 2]), &json!([1, 3])),
            Some(Ordering::Less)
        );
    }

    #[test]
    fn test_pointer_set_creates_intermediates() {
        let mut target = json!({});
        pointer_set(&mut target, "/a/b/c", json!(7));
        assert_eq!(target, json!({"a": {"b": {"c": 7}}}));
    }

    #[test]
    fn test_pointer_set_overwrites_scalar_on_path() {
        let mut target = json!({"a": 1});
        pointer_set(&mut target, "/a/b", json!(2));
        assert_eq!(target, json!({"a": {"b": 2}}));
    }
}
