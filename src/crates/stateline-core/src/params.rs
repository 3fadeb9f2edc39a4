//! Parameter templates: `.$`-keyed substitution
//!
//! `Parameters`, `ResultSelector`, `ItemSelector`, and approval `Prompt`
//! blocks are all static templates walked by [`resolve_template`]. A key
//! ending in `.$` flags its value as an expression - a path read or an
//! intrinsic call - and the stripped key carries the evaluated result into
//! the output. Everything else is copied structurally.

use serde_json::{Map, Value};

use crate::context::EvalScope;
use crate::error::ExecutionError;
use crate::intrinsics;
use crate::path::Path;

/// Evaluate a single `.$` expression: an intrinsic call when it begins with
/// `States.`, otherwise a path read. A path that does not resolve raises
/// `States.ParameterPathFailure`.
pub fn evaluate_expression(expr: &str, scope: &EvalScope<'_>) -> Result<Value, ExecutionError> {
    if intrinsics::is_intrinsic_expression(expr) {
        return intrinsics::evaluate(expr, scope);
    }
    let path = Path::parse(expr)?;
    path.read(scope.document, scope.context)
        .cloned()
        .ok_or_else(|| {
            ExecutionError::path_failure(format!("path '{expr}' did not resolve in the input"))
        })
}

/// Walk a template, substituting every `.$`-suffixed key.
pub fn resolve_template(template: &Value, scope: &EvalScope<'_>) -> Result<Value, ExecutionError> {
    match template {
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, value) in map {
                if let Some(stripped) = key.strip_suffix(".$") {
                    let expr = value.as_str().ok_or_else(|| {
                        ExecutionError::path_failure(format!(
                            "template key '{key}' must have a string expression value"
                        ))
                    })?;
                    out.insert(stripped.to_string(), evaluate_expression(expr, scope)?);
                } else {
                    out.insert(key.clone(), resolve_template(value, scope)?);
                }
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => Ok(Value::Array(
            items
                .iter()
                .map(|item| resolve_template(item, scope))
                .collect::<Result<_, _>>()?,
        )),
        other => Ok(other.clone()),
    }
}
