//! Intrinsic functions: the `States.*` expression language
//!
//! A `.$`-flagged template value whose expression begins with `States.` is an
//! intrinsic call rather than a bare path. Arguments are themselves
//! expressions - string literals in single quotes (escape `\'`), numbers,
//! booleans, `null`, path reads, or further intrinsic calls - so expressions
//! nest arbitrarily:
//!
//! ```text
//! States.Format('{} of {}', States.ArrayLength($.items), $.total)
//! ```
//!
//! Evaluation is pure apart from the explicitly nondeterministic functions
//! (`States.UUID`, `States.MathRandom` without a seed), which draw from the
//! injected [`Environment`](crate::context::Environment) / thread RNG.
//! Argument-shape problems raise `States.IntrinsicFailure`; unresolvable path
//! arguments raise `States.ParameterPathFailure`, except inside
//! `States.Coalesce`, which treats missing as skippable.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use md5::Md5;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{Number, Value};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::context::EvalScope;
use crate::error::ExecutionError;
use crate::path::Path;
use crate::value::shallow_merge;

/// Whether a `.$` expression is an intrinsic call rather than a path.
pub fn is_intrinsic_expression(expr: &str) -> bool {
    expr.trim_start().starts_with("States.")
}

/// Evaluate an intrinsic expression against the given scope.
pub fn evaluate(expr: &str, scope: &EvalScope<'_>) -> Result<Value, ExecutionError> {
    let mut parser = Parser::new(expr);
    let parsed = parser.parse_expr()?;
    parser.skip_whitespace();
    if !parser.at_end() {
        return Err(ExecutionError::intrinsic(format!(
            "trailing input after expression in '{expr}'"
        )));
    }
    match eval(&parsed, scope)? {
        Resolved::Value(value) => Ok(value),
        Resolved::Missing => Err(ExecutionError::path_failure(format!(
            "expression '{expr}' resolved to a missing value"
        ))),
    }
}

#[derive(Debug, Clone)]
enum Expr {
    Call { name: String, args: Vec<Expr> },
    Path(Path),
    Str(String),
    Num(Number),
    Bool(bool),
    Null,
}

enum Resolved {
    Value(Value),
    Missing,
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.bump();
        }
    }

    fn fail(&self, message: &str) -> ExecutionError {
        ExecutionError::intrinsic(format!("{message} at offset {} in '{}'", self.pos, self.src))
    }

    fn parse_expr(&mut self) -> Result<Expr, ExecutionError> {
        self.skip_whitespace();
        match self.peek() {
            Some('\'') => self.parse_string(),
            Some('$') => self.parse_path(),
            Some(c) if c.is_ascii_digit() || c == '-' => self.parse_number(),
            Some(c) if c.is_ascii_alphabetic() => self.parse_ident(),
            _ => Err(self.fail("expected an expression")),
        }
    }

    fn parse_string(&mut self) -> Result<Expr, ExecutionError> {
        self.bump(); // opening quote
        let mut out = String::new();
        loop {
            match self.bump() {
                Some('\'') => return Ok(Expr::Str(out)),
                Some('\\') => match self.bump() {
                    Some('\'') => out.push('\''),
                    Some('\\') => out.push('\\'),
                    Some(other) => {
                        out.push('\\');
                        out.push(other);
                    }
                    None => return Err(self.fail("unterminated escape in string literal")),
                },
                Some(c) => out.push(c),
                None => return Err(self.fail("unterminated string literal")),
            }
        }
    }

    fn parse_path(&mut self) -> Result<Expr, ExecutionError> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if !c.is_whitespace() && c != ',' && c != ')') {
            self.bump();
        }
        let expr = &self.src[start..self.pos];
        Ok(Expr::Path(Path::parse(expr)?))
    }

    fn parse_number(&mut self) -> Result<Expr, ExecutionError> {
        let start = self.pos;
        if self.peek() == Some('-') {
            self.bump();
        }
        while matches!(self.peek(), Some(c) if c.is_ascii_digit() || c == '.' || c == 'e' || c == 'E' || c == '+')
        {
            self.bump();
        }
        let text = &self.src[start..self.pos];
        if let Ok(n) = text.parse::<i64>() {
            return Ok(Expr::Num(Number::from(n)));
        }
        let float: f64 = text
            .parse()
            .map_err(|_| self.fail("invalid number literal"))?;
        Number::from_f64(float)
            .map(Expr::Num)
            .ok_or_else(|| self.fail("number literal is not finite"))
    }

    fn parse_ident(&mut self) -> Result<Expr, ExecutionError> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == '.' || c == '_') {
            self.bump();
        }
        let name = &self.src[start..self.pos];
        match name {
            "true" => return Ok(Expr::Bool(true)),
            "false" => return Ok(Expr::Bool(false)),
            "null" => return Ok(Expr::Null),
            _ => {}
        }
        if !name.starts_with("States.") {
            return Err(self.fail("expected an intrinsic name, literal, or path"));
        }
        self.skip_whitespace();
        if self.peek() != Some('(') {
            return Err(self.fail("expected '(' after intrinsic name"));
        }
        self.bump();
        let mut args = Vec::new();
        self.skip_whitespace();
        if self.peek() == Some(')') {
            self.bump();
            return Ok(Expr::Call {
                name: name.to_string(),
                args,
            });
        }
        loop {
            args.push(self.parse_expr()?);
            self.skip_whitespace();
            match self.bump() {
                Some(',') => continue,
                Some(')') => break,
                _ => return Err(self.fail("expected ',' or ')' in argument list")),
            }
        }
        Ok(Expr::Call {
            name: name.to_string(),
            args,
        })
    }
}

fn eval(expr: &Expr, scope: &EvalScope<'_>) -> Result<Resolved, ExecutionError> {
    match expr {
        Expr::Str(s) => Ok(Resolved::Value(Value::String(s.clone()))),
        Expr::Num(n) => Ok(Resolved::Value(Value::Number(n.clone()))),
        Expr::Bool(b) => Ok(Resolved::Value(Value::Bool(*b))),
        Expr::Null => Ok(Resolved::Value(Value::Null)),
        Expr::Path(path) => Ok(match path.read(scope.document, scope.context) {
            Some(value) => Resolved::Value(value.clone()),
            None => Resolved::Missing,
        }),
        Expr::Call { name, args } => {
            if name == "States.Coalesce" {
                return coalesce(args, scope);
            }
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                match eval(arg, scope)? {
                    Resolved::Value(value) => values.push(value),
                    Resolved::Missing => {
                        return Err(ExecutionError::path_failure(format!(
                            "argument of {name} resolved to a missing value"
                        )))
                    }
                }
            }
            apply(name, values, scope).map(Resolved::Value)
        }
    }
}

/// First argument that is neither missing nor null; `null` when none is.
fn coalesce(args: &[Expr], scope: &EvalScope<'_>) -> Result<Resolved, ExecutionError> {
    for arg in args {
        match eval(arg, scope)? {
            Resolved::Value(Value::Null) | Resolved::Missing => continue,
            found => return Ok(found),
        }
    }
    Ok(Resolved::Value(Value::Null))
}

fn expect_arity(name: &str, args: &[Value], expected: usize) -> Result<(), ExecutionError> {
    if args.len() != expected {
        return Err(ExecutionError::intrinsic(format!(
            "{name} takes {expected} argument(s), got {}",
            args.len()
        )));
    }
    Ok(())
}

fn as_str<'a>(name: &str, value: &'a Value) -> Result<&'a str, ExecutionError> {
    value
        .as_str()
        .ok_or_else(|| ExecutionError::intrinsic(format!("{name} expects a string argument")))
}

fn as_array<'a>(name: &str, value: &'a Value) -> Result<&'a Vec<Value>, ExecutionError> {
    value
        .as_array()
        .ok_or_else(|| ExecutionError::intrinsic(format!("{name} expects an array argument")))
}

fn as_int(name: &str, value: &Value) -> Result<i64, ExecutionError> {
    value
        .as_i64()
        .ok_or_else(|| ExecutionError::intrinsic(format!("{name} expects an integer argument")))
}

fn as_f64(name: &str, value: &Value) -> Result<f64, ExecutionError> {
    value
        .as_f64()
        .ok_or_else(|| ExecutionError::intrinsic(format!("{name} expects a numeric argument")))
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn number_from_f64(name: &str, value: f64) -> Result<Value, ExecutionError> {
    Number::from_f64(value)
        .map(Value::Number)
        .ok_or_else(|| ExecutionError::intrinsic(format!("{name} produced a non-finite number")))
}

fn apply(name: &str, args: Vec<Value>, scope: &EvalScope<'_>) -> Result<Value, ExecutionError> {
    match name {
        "States.Format" => {
            if args.is_empty() {
                return Err(ExecutionError::intrinsic(
                    "States.Format takes a format string and one argument per '{}'",
                ));
            }
            let template = as_str(name, &args[0])?;
            let mut fills = args[1..].iter();
            let mut out = String::new();
            let mut rest = template;
            while let Some(idx) = rest.find("{}") {
                out.push_str(&rest[..idx]);
                let fill = fills.next().ok_or_else(|| {
                    ExecutionError::intrinsic("States.Format has more '{}' than arguments")
                })?;
                out.push_str(&stringify(fill));
                rest = &rest[idx + 2..];
            }
            out.push_str(rest);
            if fills.next().is_some() {
                return Err(ExecutionError::intrinsic(
                    "States.Format has more arguments than '{}'",
                ));
            }
            Ok(Value::String(out))
        }
        "States.StringToJson" => {
            expect_arity(name, &args, 1)?;
            serde_json::from_str(as_str(name, &args[0])?)
                .map_err(|e| ExecutionError::intrinsic(format!("States.StringToJson: {e}")))
        }
        "States.JsonToString" => {
            expect_arity(name, &args, 1)?;
            serde_json::to_string(&args[0])
                .map(Value::String)
                .map_err(|e| ExecutionError::intrinsic(format!("States.JsonToString: {e}")))
        }
        "States.StringSplit" => {
            expect_arity(name, &args, 2)?;
            let input = as_str(name, &args[0])?;
            let separator = as_str(name, &args[1])?;
            if separator.is_empty() {
                return Err(ExecutionError::intrinsic(
                    "States.StringSplit separator must be non-empty",
                ));
            }
            Ok(Value::Array(
                input
                    .split(separator)
                    .filter(|part| !part.is_empty())
                    .map(|part| Value::String(part.to_string()))
                    .collect(),
            ))
        }
        "States.Array" => Ok(Value::Array(args)),
        "States.ArrayPartition" => {
            expect_arity(name, &args, 2)?;
            let items = as_array(name, &args[0])?;
            let size = as_int(name, &args[1])?;
            if size <= 0 {
                return Err(ExecutionError::intrinsic(
                    "States.ArrayPartition chunk size must be positive",
                ));
            }
            Ok(Value::Array(
                items
                    .chunks(size as usize)
                    .map(|chunk| Value::Array(chunk.to_vec()))
                    .collect(),
            ))
        }
        "States.ArrayContains" => {
            expect_arity(name, &args, 2)?;
            let items = as_array(name, &args[0])?;
            Ok(Value::Bool(items.contains(&args[1])))
        }
        "States.ArrayRange" => {
            if args.len() != 2 && args.len() != 3 {
                return Err(ExecutionError::intrinsic(
                    "States.ArrayRange takes (start, end) or (start, end, step)",
                ));
            }
            let start = as_int(name, &args[0])?;
            let end = as_int(name, &args[1])?;
            let step = match args.get(2) {
                Some(v) => as_int(name, v)?,
                None => 1,
            };
            if step == 0 {
                return Err(ExecutionError::intrinsic("States.ArrayRange step must be non-zero"));
            }
            let mut out = Vec::new();
            let mut current = start;
            while (step > 0 && current <= end) || (step < 0 && current >= end) {
                out.push(Value::Number(Number::from(current)));
                current += step;
            }
            Ok(Value::Array(out))
        }
        "States.ArrayGetItem" => {
            expect_arity(name, &args, 2)?;
            let items = as_array(name, &args[0])?;
            let index = as_int(name, &args[1])?;
            usize::try_from(index)
                .ok()
                .and_then(|i| items.get(i))
                .cloned()
                .ok_or_else(|| {
                    ExecutionError::intrinsic(format!(
                        "States.ArrayGetItem index {index} out of bounds for length {}",
                        items.len()
                    ))
                })
        }
        "States.ArrayLength" => {
            expect_arity(name, &args, 1)?;
            Ok(Value::Number(Number::from(as_array(name, &args[0])?.len())))
        }
        "States.ArrayUnique" => {
            expect_arity(name, &args, 1)?;
            let items = as_array(name, &args[0])?;
            // Order-preserving: first occurrence wins.
            let mut out: Vec<Value> = Vec::new();
            for item in items {
                if !out.contains(item) {
                    out.push(item.clone());
                }
            }
            Ok(Value::Array(out))
        }
        "States.MathAdd" => {
            if args.len() < 2 {
                return Err(ExecutionError::intrinsic(
                    "States.MathAdd takes at least two arguments",
                ));
            }
            if args.iter().all(|v| v.as_i64().is_some()) {
                let mut total = 0i64;
                for v in &args {
                    total = total
                        .checked_add(v.as_i64().unwrap_or(0))
                        .ok_or_else(|| ExecutionError::intrinsic("States.MathAdd overflowed"))?;
                }
                return Ok(Value::Number(Number::from(total)));
            }
            let mut total = 0.0;
            for v in &args {
                total += as_f64(name, v)?;
            }
            number_from_f64(name, total)
        }
        "States.MathSubtract" => {
            expect_arity(name, &args, 2)?;
            match (args[0].as_i64(), args[1].as_i64()) {
                (Some(a), Some(b)) => Ok(Value::Number(Number::from(a - b))),
                _ => number_from_f64(name, as_f64(name, &args[0])? - as_f64(name, &args[1])?),
            }
        }
        "States.MathMultiply" => {
            expect_arity(name, &args, 2)?;
            match (args[0].as_i64(), args[1].as_i64()) {
                (Some(a), Some(b)) => Ok(Value::Number(Number::from(a * b))),
                _ => number_from_f64(name, as_f64(name, &args[0])? * as_f64(name, &args[1])?),
            }
        }
        "States.MathDivide" => {
            expect_arity(name, &args, 2)?;
            let divisor = as_f64(name, &args[1])?;
            if divisor == 0.0 {
                return Err(ExecutionError::intrinsic("States.MathDivide by zero"));
            }
            number_from_f64(name, as_f64(name, &args[0])? / divisor)
        }
        "States.MathRandom" => {
            if args.len() != 2 && args.len() != 3 {
                return Err(ExecutionError::intrinsic(
                    "States.MathRandom takes (low, high) or (low, high, seed)",
                ));
            }
            let low = as_int(name, &args[0])?;
            let high = as_int(name, &args[1])?;
            if low > high {
                return Err(ExecutionError::intrinsic(
                    "States.MathRandom low bound exceeds high bound",
                ));
            }
            let drawn = match args.get(2) {
                Some(seed) => {
                    let mut rng = StdRng::seed_from_u64(as_int(name, seed)? as u64);
                    rng.gen_range(low..=high)
                }
                None => rand::thread_rng().gen_range(low..=high),
            };
            Ok(Value::Number(Number::from(drawn)))
        }
        "States.Hash" => {
            expect_arity(name, &args, 2)?;
            let input = as_str(name, &args[0])?;
            let algorithm = as_str(name, &args[1])?;
            let digest = match algorithm {
                "sha256" => hex::encode(Sha256::digest(input.as_bytes())),
                "sha1" => hex::encode(Sha1::digest(input.as_bytes())),
                "md5" => hex::encode(Md5::digest(input.as_bytes())),
                other => {
                    return Err(ExecutionError::intrinsic(format!(
                        "States.Hash does not support algorithm '{other}'"
                    )))
                }
            };
            Ok(Value::String(digest))
        }
        "States.Base64Encode" => {
            expect_arity(name, &args, 1)?;
            Ok(Value::String(BASE64.encode(as_str(name, &args[0])?)))
        }
        "States.Base64Decode" => {
            expect_arity(name, &args, 1)?;
            let bytes = BASE64
                .decode(as_str(name, &args[0])?)
                .map_err(|e| ExecutionError::intrinsic(format!("States.Base64Decode: {e}")))?;
            String::from_utf8(bytes)
                .map(Value::String)
                .map_err(|_| ExecutionError::intrinsic("States.Base64Decode produced non-UTF-8 output"))
        }
        "States.UUID" => {
            expect_arity(name, &args, 0)?;
            Ok(Value::String(scope.env.uuid()))
        }
        "States.JsonMerge" => {
            expect_arity(name, &args, 2)?;
            if !args[0].is_object() || !args[1].is_object() {
                return Err(ExecutionError::intrinsic(
                    "States.JsonMerge takes two objects",
                ));
            }
            Ok(shallow_merge(&args[0], &args[1]))
        }
        "States.IsString" | "States.IsNumber" | "States.IsBoolean" | "States.IsNull"
        | "States.IsArray" | "States.IsObject" => {
            expect_arity(name, &args, 1)?;
            let matched = match name {
                "States.IsString" => args[0].is_string(),
                "States.IsNumber" => args[0].is_number(),
                "States.IsBoolean" => args[0].is_boolean(),
                "States.IsNull" => args[0].is_null(),
                "States.IsArray" => args[0].is_array(),
                _ => args[0].is_object(),
            };
            Ok(Value::Bool(matched))
        }
        other => Err(ExecutionError::intrinsic(format!(
            "unknown intrinsic function '{other}'"
        ))),
    }
}
