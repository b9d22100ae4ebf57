//! Built-in capability operations

use anyhow::{anyhow, Result};
use chrono::Utc;
use serde_json::Value;

use super::Capability;

/// String form used for concatenation and text operations: strings are
/// taken verbatim, everything else as compact JSON.
pub fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinOp {
    Identity,
    Upper,
    Lower,
    Reverse,
    Length,
    Concat,
    Split,
    Join,
    Json,
    Parse,
    Now,
}

impl BuiltinOp {
    const ALL: [(BuiltinOp, &'static str, &'static str); 11] = [
        (BuiltinOp::Identity, "return", "Return the first argument unchanged"),
        (BuiltinOp::Upper, "upper", "Uppercase text"),
        (BuiltinOp::Lower, "lower", "Lowercase text"),
        (BuiltinOp::Reverse, "reverse", "Reverse text or an array"),
        (BuiltinOp::Length, "length", "Length of text, array or object"),
        (BuiltinOp::Concat, "concat", "Join all arguments as text"),
        (BuiltinOp::Split, "split", "Split text by a separator (default: whitespace)"),
        (BuiltinOp::Join, "join", "Join an array with a separator (default: empty)"),
        (BuiltinOp::Json, "json", "Serialize a value to JSON text"),
        (BuiltinOp::Parse, "parse", "Parse JSON text into a value"),
        (BuiltinOp::Now, "now", "Current UTC time as RFC 3339 text"),
    ];

    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim().to_lowercase();
        if name == "identity" {
            return Some(BuiltinOp::Identity);
        }
        Self::ALL.iter().find(|(_, n, _)| *n == name).map(|(op, _, _)| *op)
    }

    fn apply(&self, args: &[Value]) -> Result<Value> {
        let first = args.first().cloned().unwrap_or(Value::Null);
        Ok(match self {
            BuiltinOp::Identity => first,
            BuiltinOp::Upper => Value::String(render(&first).to_uppercase()),
            BuiltinOp::Lower => Value::String(render(&first).to_lowercase()),
            BuiltinOp::Reverse => match first {
                Value::Array(mut items) => {
                    items.reverse();
                    Value::Array(items)
                }
                other => Value::String(render(&other).chars().rev().collect()),
            },
            BuiltinOp::Length => {
                let len = match &first {
                    Value::Array(items) => items.len(),
                    Value::Object(map) => map.len(),
                    Value::Null => 0,
                    other => render(other).chars().count(),
                };
                Value::from(len)
            }
            BuiltinOp::Concat => Value::String(args.iter().map(render).collect()),
            BuiltinOp::Split => {
                let source = render(&first);
                let parts: Vec<Value> = match args.get(1) {
                    Some(sep) => source.split(render(sep).as_str()).map(|s| Value::String(s.to_string())).collect(),
                    None => source.split_whitespace().map(|s| Value::String(s.to_string())).collect(),
                };
                Value::Array(parts)
            }
            BuiltinOp::Join => {
                let sep = args.get(1).map(render).unwrap_or_default();
                match first {
                    Value::Array(items) => Value::String(items.iter().map(render).collect::<Vec<_>>().join(&sep)),
                    other => return Err(anyhow!("join expects an array, got {}", other)),
                }
            }
            BuiltinOp::Json => Value::String(first.to_string()),
            BuiltinOp::Parse => serde_json::from_str(&render(&first)).map_err(|e| anyhow!("parse failed: {}", e))?,
            BuiltinOp::Now => Value::String(Utc::now().to_rfc3339()),
        })
    }
}

pub struct BuiltinCapability {
    name: String,
    description: String,
    op: BuiltinOp,
}

impl BuiltinCapability {
    pub fn new(name: impl Into<String>, description: impl Into<String>, op: BuiltinOp) -> Self {
        let description = description.into();
        let description = if description.is_empty() {
            BuiltinOp::ALL
                .iter()
                .find(|(candidate, _, _)| *candidate == op)
                .map(|(_, _, d)| d.to_string())
                .unwrap_or_default()
        } else {
            description
        };
        Self { name: name.into(), description, op }
    }

    /// Every operation under its default name.
    pub fn standard_set() -> Vec<Self> {
        BuiltinOp::ALL
            .iter()
            .map(|(op, name, description)| Self::new(*name, *description, *op))
            .collect()
    }
}

impl Capability for BuiltinCapability {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn call(&self, args: &[Value]) -> Result<Value> {
        self.op.apply(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(op: BuiltinOp, args: &[Value]) -> Value {
        op.apply(args).unwrap()
    }

    #[test]
    fn test_text_operations() {
        assert_eq!(call(BuiltinOp::Upper, &[json!("abc")]), json!("ABC"));
        assert_eq!(call(BuiltinOp::Reverse, &[json!("abc")]), json!("cba"));
        assert_eq!(call(BuiltinOp::Length, &[json!("héllo")]), json!(5));
        assert_eq!(call(BuiltinOp::Concat, &[json!("a"), json!(1), json!(null)]), json!("a1null"));
    }

    #[test]
    fn test_split_and_join() {
        let parts = call(BuiltinOp::Split, &[json!("a,b,c"), json!(",")]);
        assert_eq!(parts, json!(["a", "b", "c"]));
        assert_eq!(call(BuiltinOp::Join, &[parts, json!("-")]), json!("a-b-c"));
        assert!(BuiltinOp::Join.apply(&[json!("nope")]).is_err());
    }

    #[test]
    fn test_parse_errors_surface() {
        assert_eq!(call(BuiltinOp::Parse, &[json!("{\"a\":1}")]), json!({ "a": 1 }));
        assert!(BuiltinOp::Parse.apply(&[json!("{")]).is_err());
    }

    #[test]
    fn test_lookup_by_name() {
        assert_eq!(BuiltinOp::parse("identity"), Some(BuiltinOp::Identity));
        assert_eq!(BuiltinOp::parse("return"), Some(BuiltinOp::Identity));
        assert_eq!(BuiltinOp::parse(" Upper "), Some(BuiltinOp::Upper));
        assert_eq!(BuiltinOp::parse("teleport"), None);
        assert_eq!(BuiltinCapability::standard_set().len(), 11);
    }
}
