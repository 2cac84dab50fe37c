use std::cmp::Ordering;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use regex::RegexBuilder;
use serde_json::{Number, Value};

use crate::error::{Error, Result};
use crate::plan::{CmpOp, Expr, Filter};
use crate::types::{Document, ResourceId, get_path};

/// Values at a path, with arrays expanded into their elements.
#[must_use]
pub fn values_at(doc: &Document, path: &str) -> Vec<Value> {
    match get_path(doc, path) {
        None => Vec::new(),
        Some(Value::Array(items)) => items,
        Some(v) => vec![v],
    }
}

/// Orders JSON scalars of the same class; `None` across classes.
#[must_use]
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Total order used for sorting: null < numbers < strings < bools < other.
#[must_use]
pub fn sort_order(a: &Value, b: &Value) -> Ordering {
    fn class(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Number(_) => 1,
            Value::String(_) => 2,
            Value::Bool(_) => 3,
            _ => 4,
        }
    }
    compare(a, b).unwrap_or_else(|| class(a).cmp(&class(b)))
}

fn equals(a: &Value, b: &Value) -> bool {
    compare(a, b) == Some(Ordering::Equal)
}

fn cmp_holds(op: CmpOp, a: &Value, b: &Value) -> bool {
    match op {
        CmpOp::Eq => equals(a, b),
        CmpOp::Ne => !equals(a, b),
        CmpOp::Gt => compare(a, b) == Some(Ordering::Greater),
        CmpOp::Gte => matches!(compare(a, b), Some(Ordering::Greater | Ordering::Equal)),
        CmpOp::Lt => compare(a, b) == Some(Ordering::Less),
        CmpOp::Lte => matches!(compare(a, b), Some(Ordering::Less | Ordering::Equal)),
    }
}

fn regex_matches(value: &str, pattern: &str) -> bool {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .is_ok_and(|re| re.is_match(value))
}

/// Evaluates a filter. Comparisons against an array path hold when any
/// element satisfies them; a missing field compares as null.
#[must_use]
pub fn matches(doc: &Document, filter: &Filter, ctx: Option<&ResourceId>) -> bool {
    match filter {
        Filter::Cmp { field, op, value } => {
            let mut values = values_at(doc, field);
            if values.is_empty() {
                values.push(Value::Null);
            }
            if *op == CmpOp::Ne {
                values.iter().all(|v| !equals(v, value))
            } else {
                values.iter().any(|v| cmp_holds(*op, v, value))
            }
        }
        Filter::Regex { field, pattern } => values_at(doc, field)
            .iter()
            .any(|v| v.as_str().is_some_and(|s| regex_matches(s, pattern))),
        Filter::In { field, values } => values_at(doc, field)
            .iter()
            .any(|v| values.iter().any(|w| equals(v, w))),
        Filter::Exists { field, exists } => get_path(doc, field).is_some() == *exists,
        Filter::Prefix { field, prefix } => values_at(doc, field)
            .iter()
            .any(|v| v.as_str().is_some_and(|s| s.starts_with(prefix.as_str()))),
        Filter::Context(field) => ctx.is_some_and(|id| {
            values_at(doc, field)
                .iter()
                .any(|v| v.as_str() == Some(id.as_str()))
        }),
        Filter::And(parts) => parts.iter().all(|f| matches(doc, f, ctx)),
        Filter::Or(parts) => parts.iter().any(|f| matches(doc, f, ctx)),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_i64() => "int",
        Value::Number(_) => "float",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

fn float(f: f64) -> Result<Value> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| Error::Compute(format!("non-finite result {f}")))
}

fn arith(
    name: &str,
    a: &Value,
    b: &Value,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Result<Value> {
    if a.is_null() || b.is_null() {
        return Ok(Value::Null);
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                if let Some(v) = int_op(x, y) {
                    return Ok(Value::from(v));
                }
            }
            match (x.as_f64(), y.as_f64()) {
                (Some(x), Some(y)) => float(float_op(x, y)),
                _ => Err(Error::Compute(format!("cannot {name} {x} and {y}"))),
            }
        }
        _ => Err(Error::Compute(format!(
            "cannot {name} {} and {}",
            type_name(a),
            type_name(b)
        ))),
    }
}

fn parse_datetime(value: &Value) -> Result<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| Error::Compute(format!("not a datetime: {value}")))
}

fn format_datetime(dt: DateTime<Utc>) -> Value {
    Value::String(dt.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Evaluates an expression against one document.
pub fn evaluate(doc: &Document, expr: &Expr, ctx: Option<&ResourceId>) -> Result<Value> {
    let eval = |e: &Expr| evaluate(doc, e, ctx);
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Field(path) => Ok(get_path(doc, path).unwrap_or(Value::Null)),
        Expr::Context => Ok(ctx.map_or(Value::Null, |id| Value::String(id.as_str().to_string()))),
        Expr::Add(a, b) => arith("add", &eval(a)?, &eval(b)?, i64::checked_add, |x, y| x + y),
        Expr::Subtract(a, b) => arith("subtract", &eval(a)?, &eval(b)?, i64::checked_sub, |x, y| x - y),
        Expr::Multiply(a, b) => arith("multiply", &eval(a)?, &eval(b)?, i64::checked_mul, |x, y| x * y),
        Expr::Divide(a, b) => {
            let (x, y) = (eval(a)?, eval(b)?);
            if y.as_f64() == Some(0.0) {
                return Err(Error::Compute("division by zero".into()));
            }
            arith("divide", &x, &y, |_, _| None, |x, y| x / y)
        }
        Expr::Negate(a) => match eval(a)? {
            Value::Null => Ok(Value::Null),
            Value::Number(n) => match n.as_i64() {
                Some(i) => i.checked_neg().map_or_else(|| float(-(i as f64)), |n| Ok(Value::from(n))),
                None => float(-n.as_f64().unwrap_or_default()),
            },
            other => Err(Error::Compute(format!("cannot negate {}", type_name(&other)))),
        },
        Expr::Concat(a, b) => match (eval(a)?, eval(b)?) {
            (Value::String(x), Value::String(y)) => Ok(Value::String(x + &y)),
            (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
            (x, y) => Err(Error::Compute(format!(
                "cannot concatenate {} and {}",
                type_name(&x),
                type_name(&y)
            ))),
        },
        Expr::DateAdd(date, millis) => {
            let (date, millis) = (eval(date)?, eval(millis)?);
            if date.is_null() || millis.is_null() {
                return Ok(Value::Null);
            }
            let ms = millis
                .as_f64()
                .ok_or_else(|| Error::Compute(format!("not a duration: {millis}")))?;
            let base = parse_datetime(&date)?;
            let shifted = Duration::try_milliseconds(ms.round() as i64)
                .and_then(|delta| base.checked_add_signed(delta))
                .ok_or_else(|| Error::Compute(format!("datetime out of range: {date} + {ms}ms")))?;
            Ok(format_datetime(shifted))
        }
        Expr::DateDiff(a, b) => {
            let (a, b) = (eval(a)?, eval(b)?);
            if a.is_null() || b.is_null() {
                return Ok(Value::Null);
            }
            let diff = parse_datetime(&a)? - parse_datetime(&b)?;
            Ok(Value::from(diff.num_milliseconds()))
        }
        Expr::Cmp(op, a, b) => {
            let (a, b) = (eval(a)?, eval(b)?);
            if a.is_null() || b.is_null() {
                return Ok(Value::Null);
            }
            Ok(Value::Bool(cmp_holds(*op, &a, &b)))
        }
        Expr::Regex(a, b) => match (eval(a)?, eval(b)?) {
            (Value::String(s), Value::String(p)) => Ok(Value::Bool(regex_matches(&s, &p))),
            _ => Ok(Value::Null),
        },
        Expr::And(a, b) => Ok(Value::Bool(truthy(&eval(a)?) && truthy(&eval(b)?))),
        Expr::Or(a, b) => Ok(Value::Bool(truthy(&eval(a)?) || truthy(&eval(b)?))),
        Expr::Cond {
            when,
            then,
            otherwise,
        } => {
            if truthy(&eval(when)?) {
                eval(then)
            } else {
                eval(otherwise)
            }
        }
        Expr::Switch { branches, default } => {
            for (case, body) in branches {
                if truthy(&eval(case)?) {
                    return eval(body);
                }
            }
            eval(default)
        }
        Expr::IfNull(a, b) => match eval(a)? {
            Value::Null => eval(b),
            v => Ok(v),
        },
        Expr::ArrayElemAt(a, index) => match eval(a)? {
            Value::Array(items) => {
                let len = items.len() as i64;
                let i = if *index < 0 { len + index } else { *index };
                Ok(usize::try_from(i)
                    .ok()
                    .and_then(|i| items.get(i).cloned())
                    .unwrap_or(Value::Null))
            }
            _ => Ok(Value::Null),
        },
        Expr::Round(a, digits) => {
            let (value, digits) = (eval(a)?, eval(digits)?);
            if value.is_null() {
                return Ok(Value::Null);
            }
            let x = value
                .as_f64()
                .ok_or_else(|| Error::Compute(format!("cannot round {}", type_name(&value))))?;
            let scale = 10f64.powi(digits.as_i64().unwrap_or(0).clamp(-15, 15) as i32);
            float((x * scale).round() / scale)
        }
    }
}
