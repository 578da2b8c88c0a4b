//! The tagged-variant value tree backing every definition.
//!
//! Definition files are YAML with three local tags that drive the merge
//! rules: `!delete` (remove a key or matching list element), `!replace`
//! (take this value verbatim, no recursive merge) and `!unquoted` (render
//! without quoting in pretty-printed output). Parsing converts the YAML
//! document into [`DefValue`] immediately, so the merge logic in
//! [`super::merge`] never sees a serialization type.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::error::ConfigError;

/// One node of a definition tree.
#[derive(Debug, Clone, PartialEq)]
pub enum DefValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// A string that pretty-prints without surrounding quotes.
    Unquoted(String),
    List(Vec<DefValue>),
    Map(BTreeMap<String, DefValue>),
    /// Merge instruction: remove this key, or remove list elements equal
    /// to the wrapped payload.
    Delete(Box<DefValue>),
    /// Merge instruction: the wrapped payload wins verbatim.
    Replace(Box<DefValue>),
}

impl DefValue {
    /// Converts a parsed YAML document into a definition tree.
    ///
    /// `file` is used only for error reporting.
    pub fn from_yaml(value: serde_yaml::Value, file: &str) -> Result<DefValue, ConfigError> {
        use serde_yaml::Value;
        Ok(match value {
            Value::Null => DefValue::Null,
            Value::Bool(b) => DefValue::Bool(b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    DefValue::Int(i)
                } else if let Some(f) = n.as_f64() {
                    DefValue::Float(f)
                } else {
                    return Err(ConfigError::Invalid {
                        file: file.to_string(),
                        reason: format!("unrepresentable number: {n}"),
                    });
                }
            }
            Value::String(s) => DefValue::Str(s),
            Value::Sequence(seq) => DefValue::List(
                seq.into_iter()
                    .map(|v| DefValue::from_yaml(v, file))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Mapping(map) => {
                let mut out = BTreeMap::new();
                for (k, v) in map {
                    let key = match k {
                        Value::String(s) => s,
                        other => {
                            return Err(ConfigError::Invalid {
                                file: file.to_string(),
                                reason: format!("non-string mapping key: {other:?}"),
                            })
                        }
                    };
                    out.insert(key, DefValue::from_yaml(v, file)?);
                }
                DefValue::Map(out)
            }
            Value::Tagged(tagged) => {
                let inner = DefValue::from_yaml(tagged.value, file)?;
                if tagged.tag == "delete" {
                    DefValue::Delete(Box::new(inner))
                } else if tagged.tag == "replace" {
                    DefValue::Replace(Box::new(inner))
                } else if tagged.tag == "unquoted" {
                    match inner {
                        DefValue::Str(s) => DefValue::Unquoted(s),
                        other => {
                            return Err(ConfigError::Invalid {
                                file: file.to_string(),
                                reason: format!("!unquoted applies to strings, got {other:?}"),
                            })
                        }
                    }
                } else {
                    return Err(ConfigError::Invalid {
                        file: file.to_string(),
                        reason: format!("unhandled YAML tag: {}", tagged.tag),
                    });
                }
            }
        })
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DefValue::Str(s) | DefValue::Unquoted(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DefValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            DefValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[DefValue]> {
        match self {
            DefValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, DefValue>> {
        match self {
            DefValue::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Renders a scalar the way the pretty-printer shows it: plain strings
    /// are quoted (they may need escaping when templated into output
    /// files), everything else prints bare.
    fn display_scalar(&self) -> String {
        match self {
            DefValue::Null => String::new(),
            DefValue::Bool(b) => b.to_string(),
            DefValue::Int(i) => i.to_string(),
            DefValue::Float(f) => f.to_string(),
            DefValue::Str(s) => format!("'{s}'"),
            DefValue::Unquoted(s) => s.clone(),
            DefValue::Replace(inner) => inner.display_scalar(),
            DefValue::Delete(_) => "!delete".to_string(),
            DefValue::List(_) | DefValue::Map(_) => String::new(),
        }
    }

    /// Sorted, diff-friendly pretty-print of a definition tree.
    ///
    /// Maps print one `key: value` line per entry (sorted); nested maps and
    /// lists put the key on its own line with children indented below it.
    pub fn pretty(&self, depth: usize) -> String {
        let mut out = String::new();
        let pad = "  ".repeat(depth);
        match self {
            DefValue::Map(map) => {
                for (k, v) in map {
                    match v {
                        DefValue::Map(_) | DefValue::List(_) => {
                            let _ = writeln!(out, "{pad}{k}:");
                            out.push_str(&v.pretty(depth + 1));
                        }
                        scalar => {
                            let _ = writeln!(out, "{pad}{k}: {}", scalar.display_scalar());
                        }
                    }
                }
            }
            DefValue::List(list) => {
                let mut lines: Vec<String> = list
                    .iter()
                    .map(|v| format!("{pad}{}", v.display_scalar()))
                    .collect();
                lines.sort();
                for line in lines {
                    let _ = writeln!(out, "{line}");
                }
            }
            scalar => {
                let _ = writeln!(out, "{pad}{}", scalar.display_scalar());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> DefValue {
        let yaml: serde_yaml::Value = serde_yaml::from_str(src).unwrap();
        DefValue::from_yaml(yaml, "test").unwrap()
    }

    #[test]
    fn converts_tagged_values() {
        let v = parse("a: !delete\nb: !replace [1, 2]\nc: !unquoted bare");
        let map = v.as_map().unwrap();
        assert!(matches!(map["a"], DefValue::Delete(_)));
        match &map["b"] {
            DefValue::Replace(inner) => assert_eq!(inner.as_list().unwrap().len(), 2),
            other => panic!("expected replace, got {other:?}"),
        }
        assert_eq!(map["c"], DefValue::Unquoted("bare".to_string()));
    }

    #[test]
    fn rejects_unknown_tag() {
        let yaml: serde_yaml::Value = serde_yaml::from_str("a: !mystery 1").unwrap();
        let err = DefValue::from_yaml(yaml, "test").unwrap_err();
        assert!(err.to_string().contains("unhandled YAML tag"));
    }

    #[test]
    fn pretty_quotes_plain_strings_only() {
        let v = parse("msg: hello\ncmd: !unquoted make all\nn: 4");
        let text = v.pretty(0);
        assert!(text.contains("msg: 'hello'"));
        assert!(text.contains("cmd: make all"));
        assert!(text.contains("n: 4"));
    }

    #[test]
    fn pretty_is_sorted() {
        let v = parse("b: 1\na: 2\nc: 3");
        let text = v.pretty(0);
        let lines: Vec<&str> = text.lines().map(|l| l.trim()).collect();
        assert_eq!(lines, vec!["a: 2", "b: 1", "c: 3"]);
    }
}
