use serde::Serialize;
use serde_json::{json, Value};

use crate::task::Action;

/// Field-level structural difference between two action sequences.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ActionDiff {
    /// Present in the actual sequence only.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub added: Vec<DiffEntry>,
    /// Present in the expected sequence only.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub removed: Vec<DiffEntry>,
    /// Present in both with differing values.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub changed: Vec<ValueChange>,
}

impl ActionDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiffEntry {
    pub path: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueChange {
    pub path: String,
    pub expected: Value,
    pub actual: Value,
}

/// Diffs two action sequences structurally (name + kwargs).
///
/// Order-sensitive mode compares position by position. The
/// order-insensitive mode treats both sequences as multisets: exact
/// structural matches cancel first, and only the unmatched remainder
/// is paired up and value-diffed, so permutations of equal content
/// produce an empty diff.
pub fn diff_actions(expected: &[Action], actual: &[Action], order_sensitive: bool) -> ActionDiff {
    let expected: Vec<Value> = expected.iter().map(comparable).collect();
    let actual: Vec<Value> = actual.iter().map(comparable).collect();
    let mut diff = ActionDiff::default();

    if order_sensitive {
        let shared = expected.len().min(actual.len());
        for i in 0..shared {
            diff_value(&format!("actions[{i}]"), &expected[i], &actual[i], &mut diff);
        }
        for (i, value) in expected.iter().enumerate().skip(shared) {
            diff.removed.push(DiffEntry {
                path: format!("actions[{i}]"),
                value: value.clone(),
            });
        }
        for (i, value) in actual.iter().enumerate().skip(shared) {
            diff.added.push(DiffEntry {
                path: format!("actions[{i}]"),
                value: value.clone(),
            });
        }
        return diff;
    }

    let mut remaining: Vec<(usize, Value)> = actual.into_iter().enumerate().collect();
    let mut unmatched: Vec<(usize, Value)> = Vec::new();

    for (i, value) in expected.into_iter().enumerate() {
        match remaining.iter().position(|(_, a)| *a == value) {
            Some(pos) => {
                remaining.remove(pos);
            }
            None => unmatched.push((i, value)),
        }
    }

    let pairs = unmatched.len().min(remaining.len());
    for k in 0..pairs {
        let (index, expected_value) = &unmatched[k];
        let (_, actual_value) = &remaining[k];
        diff_value(
            &format!("actions[{index}]"),
            expected_value,
            actual_value,
            &mut diff,
        );
    }
    for (index, value) in unmatched.into_iter().skip(pairs) {
        diff.removed.push(DiffEntry {
            path: format!("actions[{index}]"),
            value,
        });
    }
    for (index, value) in remaining.into_iter().skip(pairs) {
        diff.added.push(DiffEntry {
            path: format!("actions[{index}]"),
            value,
        });
    }

    diff
}

fn comparable(action: &Action) -> Value {
    json!({
        "name": action.name,
        "kwargs": Value::Object(action.kwargs.clone()),
    })
}

fn diff_value(path: &str, expected: &Value, actual: &Value, out: &mut ActionDiff) {
    if expected == actual {
        return;
    }

    match (expected, actual) {
        (Value::Object(expected), Value::Object(actual)) => {
            for (key, expected_value) in expected {
                let child = format!("{path}.{key}");
                match actual.get(key) {
                    Some(actual_value) => diff_value(&child, expected_value, actual_value, out),
                    None => out.removed.push(DiffEntry {
                        path: child,
                        value: expected_value.clone(),
                    }),
                }
            }
            for (key, actual_value) in actual {
                if !expected.contains_key(key) {
                    out.added.push(DiffEntry {
                        path: format!("{path}.{key}"),
                        value: actual_value.clone(),
                    });
                }
            }
        }
        (Value::Array(expected), Value::Array(actual)) => {
            let shared = expected.len().min(actual.len());
            for i in 0..shared {
                diff_value(&format!("{path}[{i}]"), &expected[i], &actual[i], out);
            }
            for (i, value) in expected.iter().enumerate().skip(shared) {
                out.removed.push(DiffEntry {
                    path: format!("{path}[{i}]"),
                    value: value.clone(),
                });
            }
            for (i, value) in actual.iter().enumerate().skip(shared) {
                out.added.push(DiffEntry {
                    path: format!("{path}[{i}]"),
                    value: value.clone(),
                });
            }
        }
        _ => out.changed.push(ValueChange {
            path: path.to_string(),
            expected: expected.clone(),
            actual: actual.clone(),
        }),
    }
}
