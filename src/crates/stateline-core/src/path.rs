//! Path expressions over the execution document and context object
//!
//! A path expression addresses a location in JSON: `$` is the execution
//! document, `$$` is the read-only context object, and segments are property
//! access (`.name`) or non-negative bracketed indices (`[2]`). `$` alone
//! denotes the whole document.
//!
//! Reads are total: a path that walks off the document yields `None` (the
//! out-of-band "missing" marker) rather than an error, so consumers like
//! `IsPresent` can observe absence while everything else raises
//! `States.ParameterPathFailure`. Writes create missing intermediate objects
//! and fail with `States.ResultPathMatchFailure` when they hit a non-object
//! in the middle of the path.

use serde_json::{Map, Value};

use crate::error::ExecutionError;

/// Which root a path starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathRoot {
    /// `$` - the execution document
    Document,
    /// `$$` - the context object
    Context,
}

/// One step of a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Property access, `.name`
    Key(String),
    /// Array index, `[i]`; negative indices are not part of the grammar
    Index(usize),
}

/// A parsed path expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    root: PathRoot,
    segments: Vec<Segment>,
}

impl Path {
    /// Parse a path expression. Syntax errors raise
    /// `States.ParameterPathFailure`.
    pub fn parse(expr: &str) -> Result<Self, ExecutionError> {
        let rest = expr
            .strip_prefix('$')
            .ok_or_else(|| ExecutionError::path_failure(format!("path '{expr}' must start with '$'")))?;
        let (root, mut rest) = match rest.strip_prefix('$') {
            Some(r) => (PathRoot::Context, r),
            None => (PathRoot::Document, rest),
        };

        let mut segments = Vec::new();
        while !rest.is_empty() {
            if let Some(r) = rest.strip_prefix('.') {
                let end = r.find(['.', '[']).unwrap_or(r.len());
                let name = &r[..end];
                if name.is_empty() {
                    return Err(ExecutionError::path_failure(format!(
                        "path '{expr}' has an empty property segment"
                    )));
                }
                segments.push(Segment::Key(name.to_string()));
                rest = &r[end..];
            } else if let Some(r) = rest.strip_prefix('[') {
                let end = r.find(']').ok_or_else(|| {
                    ExecutionError::path_failure(format!("path '{expr}' has an unclosed index"))
                })?;
                let index: usize = r[..end].trim().parse().map_err(|_| {
                    ExecutionError::path_failure(format!(
                        "path '{expr}' has an invalid index '{}'",
                        &r[..end]
                    ))
                })?;
                segments.push(Segment::Index(index));
                rest = &r[end + 1..];
            } else {
                return Err(ExecutionError::path_failure(format!(
                    "unexpected character in path '{expr}'"
                )));
            }
        }

        Ok(Self { root, segments })
    }

    /// Which root this path reads from.
    pub fn root(&self) -> PathRoot {
        self.root
    }

    /// Resolve the path against a document and context object. `None` is the
    /// missing marker: some key or index along the way did not exist.
    pub fn read<'a>(&self, document: &'a Value, context: &'a Value) -> Option<&'a Value> {
        let mut current = match self.root {
            PathRoot::Document => document,
            PathRoot::Context => context,
        };
        for segment in &self.segments {
            current = match (segment, current) {
                (Segment::Key(key), Value::Object(map)) => map.get(key)?,
                (Segment::Index(index), Value::Array(items)) => items.get(*index)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Return a new document with `value` placed at this path. Missing
    /// intermediate keys are created as empty objects; a non-object in an
    /// intermediate position raises `States.ResultPathMatchFailure`.
    pub fn write(&self, document: Value, value: Value) -> Result<Value, ExecutionError> {
        if self.root == PathRoot::Context {
            return Err(ExecutionError::result_path_failure(
                "cannot write through a context-object path ('$$')",
            ));
        }
        if self.segments.is_empty() {
            return Ok(value);
        }
        let mut document = document;
        write_into(&mut document, &self.segments, value)?;
        Ok(document)
    }
}

fn write_into(target: &mut Value, segments: &[Segment], value: Value) -> Result<(), ExecutionError> {
    let Some((segment, rest)) = segments.split_first() else {
        *target = value;
        return Ok(());
    };
    match segment {
        Segment::Key(key) => {
            if target.is_null() {
                *target = Value::Object(Map::new());
            }
            let map = target.as_object_mut().ok_or_else(|| {
                ExecutionError::result_path_failure(format!(
                    "cannot write key '{key}' into a non-object value"
                ))
            })?;
            let slot = map.entry(key.clone()).or_insert(Value::Null);
            write_into(slot, rest, value)
        }
        Segment::Index(index) => {
            let items = target.as_array_mut().ok_or_else(|| {
                ExecutionError::result_path_failure(format!(
                    "cannot write index [{index}] into a non-array value"
                ))
            })?;
            let len = items.len();
            let slot = items.get_mut(*index).ok_or_else(|| {
                ExecutionError::result_path_failure(format!(
                    "index [{index}] is out of bounds for array of length {len}"
                ))
            })?;
            write_into(slot, rest, value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::codes;
    use serde_json::json;

    fn read(expr: &str, document: &Value) -> Option<Value> {
        Path::parse(expr)
            .unwrap()
            .read(document, &Value::Null)
            .cloned()
    }

    #[test]
    fn test_whole_document() {
        let doc = json!({"a": 1});
        assert_eq!(read("$", &doc), Some(doc.clone()));
    }

    #[test]
    fn test_nested_property_and_index() {
        let doc = json!({"a": {"b": [10, {"c": "deep"}]}});
        assert_eq!(read("$.a.b[0]", &doc), Some(json!(10)));
        assert_eq!(read("$.a.b[1].c", &doc), Some(json!("deep")));
    }

    #[test]
    fn test_missing_paths_yield_none() {
        let doc = json!({"a": {"b": null}});
        assert_eq!(read("$.a.missing", &doc), None);
        assert_eq!(read("$.a.b.deeper", &doc), None);
        // Present-but-null is not missing.
        assert_eq!(read("$.a.b", &doc), Some(Value::Null));
    }

    #[test]
    fn test_context_root() {
        let doc = json!({"a": 1});
        let context = json!({"Map": {"Item": {"Index": 2}}});
        let path = Path::parse("$$.Map.Item.Index").unwrap();
        assert_eq!(path.read(&doc, &context), Some(&json!(2)));
        assert_eq!(path.root(), PathRoot::Context);
    }

    #[test]
    fn test_parse_rejects_bad_syntax() {
        assert!(Path::parse("a.b").is_err());
        assert!(Path::parse("$.").is_err());
        assert!(Path::parse("$.a[").is_err());
        assert!(Path::parse("$.a[-1]").is_err());
        assert!(Path::parse("$.a[x]").is_err());
    }

    #[test]
    fn test_write_replaces_root() {
        let path = Path::parse("$").unwrap();
        let written = path.write(json!({"old": 1}), json!({"new": 2})).unwrap();
        assert_eq!(written, json!({"new": 2}));
    }

    #[test]
    fn test_write_creates_intermediate_objects() {
        let path = Path::parse("$.a.b.c").unwrap();
        let written = path.write(json!({"x": 1}), json!(9)).unwrap();
        assert_eq!(written, json!({"x": 1, "a": {"b": {"c": 9}}}));
    }

    #[test]
    fn test_write_into_array_slot() {
        let path = Path::parse("$.items[1]").unwrap();
        let written = path.write(json!({"items": [1, 2, 3]}), json!("two")).unwrap();
        assert_eq!(written, json!({"items": [1, "two", 3]}));
    }

    #[test]
    fn test_write_conflict_raises_result_path_failure() {
        let path = Path::parse("$.a.b").unwrap();
        let err = path.write(json!({"a": 5}), json!(1)).unwrap_err();
        assert_eq!(err.code, codes::RESULT_PATH_MATCH_FAILURE);

        let path = Path::parse("$.a[0]").unwrap();
        let err = path.write(json!({"a": {"b": 1}}), json!(1)).unwrap_err();
        assert_eq!(err.code, codes::RESULT_PATH_MATCH_FAILURE);
    }

    #[test]
    fn test_write_through_context_rejected() {
        let path = Path::parse("$$.State.Name").unwrap();
        assert!(path.write(json!({}), json!(1)).is_err());
    }

    #[test]
    fn test_write_is_idempotent_for_same_inputs() {
        let path = Path::parse("$.out.value").unwrap();
        let a = path.write(json!({"in": 1}), json!(42)).unwrap();
        let b = path.write(json!({"in": 1}), json!(42)).unwrap();
        assert_eq!(a, b);
    }

    mod round_trip {
        use super::*;
        use proptest::prelude::*;

        fn arb_value() -> impl Strategy<Value = Value> {
            let leaf = prop_oneof![
                Just(Value::Null),
                any::<bool>().prop_map(Value::Bool),
                any::<i32>().prop_map(|n| json!(n)),
                "[a-z]{0,6}".prop_map(Value::String),
            ];
            leaf.prop_recursive(3, 24, 4, |inner| {
                prop_oneof![
                    prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                    prop::collection::btree_map("[a-z]{1,4}", inner, 0..4).prop_map(|m| {
                        Value::Object(m.into_iter().collect())
                    }),
                ]
            })
        }

        fn resolvable_paths(value: &Value, prefix: String, out: &mut Vec<String>) {
            out.push(prefix.clone());
            match value {
                Value::Object(map) => {
                    for (k, v) in map {
                        resolvable_paths(v, format!("{prefix}.{k}"), out);
                    }
                }
                Value::Array(items) => {
                    for (i, v) in items.iter().enumerate() {
                        resolvable_paths(v, format!("{prefix}[{i}]"), out);
                    }
                }
                _ => {}
            }
        }

        proptest! {
            // Writing back what was read leaves the document unchanged, for
            // every path that resolves in it.
            #[test]
            fn test_read_write_round_trip(doc in arb_value()) {
                let mut paths = Vec::new();
                resolvable_paths(&doc, "$".to_string(), &mut paths);
                for expr in paths {
                    let path = Path::parse(&expr).unwrap();
                    let value = path.read(&doc, &Value::Null).unwrap().clone();
                    let rewritten = path.write(doc.clone(), value).unwrap();
                    prop_assert_eq!(&rewritten, &doc);
                }
            }
        }
    }
}
