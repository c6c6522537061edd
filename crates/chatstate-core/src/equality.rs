#![forbid(unsafe_code)]

//! Structural equality for state values.
//!
//! # Invariants
//!
//! 1. `deep_equal(v, v)` holds for every value.
//! 2. Object key order is irrelevant; array element order is significant.
//! 3. Numbers compare by numeric value, so `1` equals `1.0`.
//! 4. Values of different kinds are never equal (`null` != `{}` != `[]`).

use serde_json::{Number, Value};

/// Compare two values structurally, independent of identity and key order.
#[must_use]
pub fn deep_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => numbers_equal(x, y),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| deep_equal(l, r))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(key, l)| y.get(key).is_some_and(|r| deep_equal(l, r)))
        }
        _ => a == b,
    }
}

/// [`deep_equal`] lifted over absent values: two absent values are equal,
/// an absent value never equals a present one (not even `null`).
#[must_use]
pub fn option_deep_equal(a: Option<&Value>, b: Option<&Value>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => deep_equal(a, b),
        (None, None) => true,
        _ => false,
    }
}

/// Nesting depth of a value. Scalars have depth 0; each object or array
/// level adds one.
#[must_use]
pub fn value_depth(value: &Value) -> usize {
    match value {
        Value::Object(map) => 1 + map.values().map(value_depth).max().unwrap_or(0),
        Value::Array(items) => 1 + items.iter().map(value_depth).max().unwrap_or(0),
        _ => 0,
    }
}

fn numbers_equal(x: &Number, y: &Number) -> bool {
    if let (Some(a), Some(b)) = (x.as_i64(), y.as_i64()) {
        return a == b;
    }
    if let (Some(a), Some(b)) = (x.as_u64(), y.as_u64()) {
        return a == b;
    }
    match (x.as_f64(), y.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}
