//! Transform tasks: pure reshaping of dependency outputs.
//!
//! A transform config names an `operation` (`filter`, `map`, `aggregate`,
//! `format`) plus its parameters. Transforms never touch the network and
//! are never healed; a bad config fails the task.

use std::collections::BTreeMap;

use serde_json::{Map, Number, Value};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum TransformError {
    #[error("missing transform parameter: {0}")]
    MissingParameter(&'static str),

    #[error("unsupported transform operation: {0}")]
    UnsupportedOperation(String),

    #[error("unsupported {kind}: {value}")]
    Unsupported { kind: &'static str, value: String },

    #[error("{operation} expects an array input")]
    ExpectedArray { operation: &'static str },
}

/// Runs the transform described by `config` over `input`
pub fn apply_transform(config: &Value, input: &Value) -> Result<Value, TransformError> {
    let operation = config
        .get("operation")
        .and_then(Value::as_str)
        .ok_or(TransformError::MissingParameter("operation"))?;

    match operation {
        "filter" => filter(config, input),
        "map" => map(config, input),
        "aggregate" => aggregate(config, input),
        "format" => format(config, input),
        other => Err(TransformError::UnsupportedOperation(other.to_string())),
    }
}

fn items<'a>(input: &'a Value, operation: &'static str) -> Result<&'a Vec<Value>, TransformError> {
    input
        .as_array()
        .ok_or(TransformError::ExpectedArray { operation })
}

/// Dotted path lookup (`contact.email`)
fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, key| current.get(key))
}

fn filter(config: &Value, input: &Value) -> Result<Value, TransformError> {
    let field = config
        .get("field")
        .and_then(Value::as_str)
        .ok_or(TransformError::MissingParameter("field"))?;
    let op = config.get("op").and_then(Value::as_str).unwrap_or("eq");
    let expected = config.get("value").unwrap_or(&Value::Null);

    let mut kept = Vec::new();
    for item in items(input, "filter")? {
        if matches_condition(lookup(item, field), op, expected)? {
            kept.push(item.clone());
        }
    }
    Ok(Value::Array(kept))
}

fn matches_condition(actual: Option<&Value>, op: &str, expected: &Value) -> Result<bool, TransformError> {
    let ordered = |f: fn(f64, f64) -> bool| match (actual.and_then(Value::as_f64), expected.as_f64()) {
        (Some(a), Some(b)) => f(a, b),
        _ => false,
    };

    Ok(match op {
        "eq" => actual == Some(expected),
        "ne" => actual != Some(expected),
        "gt" => ordered(|a, b| a > b),
        "gte" => ordered(|a, b| a >= b),
        "lt" => ordered(|a, b| a < b),
        "lte" => ordered(|a, b| a <= b),
        "contains" => match (actual, expected) {
            (Some(Value::String(s)), Value::String(needle)) => s.contains(needle.as_str()),
            (Some(Value::Array(values)), needle) => values.contains(needle),
            _ => false,
        },
        "exists" => actual.map_or(false, |v| !v.is_null()),
        other => {
            return Err(TransformError::Unsupported {
                kind: "filter op",
                value: other.to_string(),
            })
        }
    })
}

/// `fields` is either a list of paths to keep or an object of
/// `{"newName": "source.path"}` renames
fn map(config: &Value, input: &Value) -> Result<Value, TransformError> {
    let fields = config
        .get("fields")
        .ok_or(TransformError::MissingParameter("fields"))?;

    let project = |item: &Value| -> Value {
        let mut out = Map::new();
        match fields {
            Value::Array(paths) => {
                for path in paths.iter().filter_map(Value::as_str) {
                    if let Some(v) = lookup(item, path) {
                        out.insert(path.to_string(), v.clone());
                    }
                }
            }
            Value::Object(renames) => {
                for (target, source) in renames {
                    let source = source.as_str().unwrap_or(target);
                    if let Some(v) = lookup(item, source) {
                        out.insert(target.clone(), v.clone());
                    }
                }
            }
            _ => {}
        }
        Value::Object(out)
    };

    match input {
        Value::Array(values) => Ok(Value::Array(values.iter().map(project).collect())),
        Value::Object(_) => Ok(project(input)),
        _ => Err(TransformError::ExpectedArray { operation: "map" }),
    }
}

fn aggregate(config: &Value, input: &Value) -> Result<Value, TransformError> {
    let function = config
        .get("function")
        .and_then(Value::as_str)
        .unwrap_or("count");
    let field = config.get("field").and_then(Value::as_str);
    let values = items(input, "aggregate")?;

    let Some(group_by) = config.get("groupBy").and_then(Value::as_str) else {
        return reduce(function, field, values.iter());
    };

    let mut groups: BTreeMap<String, Vec<&Value>> = BTreeMap::new();
    for item in values {
        let key = match lookup(item, group_by) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => "null".to_string(),
        };
        groups.entry(key).or_default().push(item);
    }

    let mut out = Map::new();
    for (key, members) in groups {
        out.insert(key, reduce(function, field, members.into_iter())?);
    }
    Ok(Value::Object(out))
}

fn reduce<'a, I>(function: &str, field: Option<&str>, values: I) -> Result<Value, TransformError>
where
    I: Iterator<Item = &'a Value>,
{
    if function == "count" {
        return Ok(Value::from(values.count()));
    }

    let field = field.ok_or(TransformError::MissingParameter("field"))?;
    let numbers: Vec<f64> = values
        .filter_map(|v| lookup(v, field).and_then(Value::as_f64))
        .collect();

    let result = match function {
        "sum" => Some(numbers.iter().sum()),
        "avg" if numbers.is_empty() => None,
        "avg" => Some(numbers.iter().sum::<f64>() / numbers.len() as f64),
        "min" => numbers.iter().copied().reduce(f64::min),
        "max" => numbers.iter().copied().reduce(f64::max),
        other => {
            return Err(TransformError::Unsupported {
                kind: "aggregate function",
                value: other.to_string(),
            })
        }
    };

    Ok(result
        .and_then(Number::from_f64)
        .map(Value::Number)
        .unwrap_or(Value::Null))
}

/// `{{field}}` placeholders filled from each item; arrays render one line
/// per item
fn format(config: &Value, input: &Value) -> Result<Value, TransformError> {
    let template = config
        .get("template")
        .and_then(Value::as_str)
        .ok_or(TransformError::MissingParameter("template"))?;

    let rendered = match input {
        Value::Array(values) => values
            .iter()
            .map(|item| render(template, item))
            .collect::<Vec<_>>()
            .join("\n"),
        other => render(template, other),
    };
    Ok(Value::String(rendered))
}

fn render(template: &str, item: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let path = after[..end].trim();
                match lookup(item, path) {
                    Some(Value::String(s)) => out.push_str(s),
                    Some(Value::Null) | None => {}
                    Some(other) => out.push_str(&other.to_string()),
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deals() -> Value {
        json!([
            {"name": "Acme", "stage": "won", "amount": 100, "owner": {"email": "a@x.io"}},
            {"name": "Globex", "stage": "lost", "amount": 40, "owner": {"email": "b@x.io"}},
            {"name": "Initech", "stage": "won", "amount": 60}
        ])
    }

    #[test]
    fn filter_by_comparison() {
        let out = apply_transform(
            &json!({"operation": "filter", "field": "amount", "op": "gte", "value": 60}),
            &deals(),
        )
        .unwrap();
        assert_eq!(out.as_array().unwrap().len(), 2);

        let out = apply_transform(
            &json!({"operation": "filter", "field": "owner.email", "op": "exists"}),
            &deals(),
        )
        .unwrap();
        assert_eq!(out.as_array().unwrap().len(), 2);
    }

    #[test]
    fn map_picks_and_renames() {
        let out = apply_transform(
            &json!({"operation": "map", "fields": {"company": "name", "email": "owner.email"}}),
            &deals(),
        )
        .unwrap();
        assert_eq!(out[0], json!({"company": "Acme", "email": "a@x.io"}));
        assert_eq!(out[2], json!({"company": "Initech"}));
    }

    #[test]
    fn aggregate_with_group_by() {
        let out = apply_transform(
            &json!({"operation": "aggregate", "function": "sum", "field": "amount", "groupBy": "stage"}),
            &deals(),
        )
        .unwrap();
        assert_eq!(out, json!({"lost": 40.0, "won": 160.0}));

        let count = apply_transform(&json!({"operation": "aggregate"}), &deals()).unwrap();
        assert_eq!(count, json!(3));
    }

    #[test]
    fn format_joins_lines() {
        let out = apply_transform(
            &json!({"operation": "format", "template": "{{name}}: {{amount}}"}),
            &deals(),
        )
        .unwrap();
        assert_eq!(out, json!("Acme: 100\nGlobex: 40\nInitech: 60"));
    }

    #[test]
    fn rejects_unknown_operation() {
        let err = apply_transform(&json!({"operation": "pivot"}), &deals()).unwrap_err();
        assert_eq!(err, TransformError::UnsupportedOperation("pivot".into()));
    }
}
