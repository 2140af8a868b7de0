//! Evaluation of parsed expressions over JSON values.

use std::cmp::Ordering;

use serde_json::{Number, Value};

use super::parser::{BinaryOp, CompareOp, Expr};
use crate::{
    error::{EngineError, EngineResult},
    resolve::display_value,
    variables::VariableStore,
};

/// Upper bound on the size of strings and lists built by `*` and `+`.
const MAX_SEQUENCE_SIZE: usize = 1 << 20;

/// String bytes plus list and map entries, counted through every nesting level.
fn sequence_size(value: &Value) -> usize {
    match value {
        Value::String(text) => text.len(),
        Value::Array(items) => items
            .iter()
            .fold(items.len(), |total, item| total.saturating_add(sequence_size(item))),
        Value::Object(map) => map.iter().fold(map.len(), |total, (key, item)| {
            total.saturating_add(key.len()).saturating_add(sequence_size(item))
        }),
        _ => 0,
    }
}

fn ensure_within_cap(size: usize, what: &str) -> EngineResult<()> {
    if size > MAX_SEQUENCE_SIZE {
        return Err(EngineError::expression(format!("{what} is too long")));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Num::Int(value) => value as f64,
            Num::Float(value) => value,
        }
    }

    fn into_value(self) -> EngineResult<Value> {
        match self {
            Num::Int(value) => Ok(Value::from(value)),
            Num::Float(value) => Number::from_f64(value)
                .map(Value::Number)
                .ok_or_else(|| EngineError::expression("result is not a finite number")),
        }
    }
}

fn as_num(value: &Value) -> Option<Num> {
    match value {
        Value::Number(number) => Some(match number.as_i64() {
            Some(int) => Num::Int(int),
            None => Num::Float(number.as_f64()?),
        }),
        Value::Bool(flag) => Some(Num::Int(i64::from(*flag))),
        _ => None,
    }
}

/// Truthiness: `null`, `false`, zero, and empty strings or containers are false.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|value| value != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Short type name used in error messages.
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "None",
        Value::Bool(_) => "bool",
        Value::Number(number) if number.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

pub fn evaluate_expr(expr: &Expr, variables: &VariableStore) -> EngineResult<Value> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Variable(name) => variables
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::undefined_variable(name.clone())),
        Expr::List(items) => items
            .iter()
            .map(|item| evaluate_expr(item, variables))
            .collect::<EngineResult<Vec<_>>>()
            .map(Value::Array),
        Expr::Negate(operand) => {
            let value = evaluate_expr(operand, variables)?;
            match as_num(&value) {
                Some(Num::Int(int)) => int
                    .checked_neg()
                    .map(Value::from)
                    .ok_or_else(|| EngineError::expression("integer overflow")),
                Some(Num::Float(float)) => Num::Float(-float).into_value(),
                None => Err(EngineError::expression(format!("bad operand type for unary -: '{}'", type_name(&value)))),
            }
        }
        Expr::Not(operand) => Ok(Value::Bool(!truthy(&evaluate_expr(operand, variables)?))),
        Expr::And(left, right) => {
            let left = evaluate_expr(left, variables)?;
            if truthy(&left) { evaluate_expr(right, variables) } else { Ok(left) }
        }
        Expr::Or(left, right) => {
            let left = evaluate_expr(left, variables)?;
            if truthy(&left) { Ok(left) } else { evaluate_expr(right, variables) }
        }
        Expr::Binary(op, left, right) => {
            let left = evaluate_expr(left, variables)?;
            let right = evaluate_expr(right, variables)?;
            binary(*op, &left, &right)
        }
        Expr::Compare(first, rest) => {
            let mut left = evaluate_expr(first, variables)?;
            for (op, operand) in rest {
                let right = evaluate_expr(operand, variables)?;
                if !compare(*op, &left, &right)? {
                    return Ok(Value::Bool(false));
                }
                left = right;
            }
            Ok(Value::Bool(true))
        }
        Expr::Index(target, index) => {
            let target = evaluate_expr(target, variables)?;
            let index = evaluate_expr(index, variables)?;
            subscript(&target, &index)
        }
        Expr::Call(name, args) => {
            let args = args
                .iter()
                .map(|arg| evaluate_expr(arg, variables))
                .collect::<EngineResult<Vec<_>>>()?;
            call(name, &args)
        }
    }
}

fn binary(op: BinaryOp, left: &Value, right: &Value) -> EngineResult<Value> {
    match (op, left, right) {
        (BinaryOp::Add, Value::String(a), Value::String(b)) => {
            ensure_within_cap(a.len().saturating_add(b.len()), "concatenated string")?;
            Ok(Value::String(format!("{a}{b}")))
        }
        (BinaryOp::Add, Value::Array(a), Value::Array(b)) => {
            ensure_within_cap(sequence_size(left).saturating_add(sequence_size(right)), "concatenated list")?;
            Ok(Value::Array(a.iter().chain(b).cloned().collect()))
        }
        (BinaryOp::Mul, Value::String(_) | Value::Array(_), _) => repeat(left, right),
        (BinaryOp::Mul, _, Value::String(_) | Value::Array(_)) => repeat(right, left),
        _ => {
            let (Some(a), Some(b)) = (as_num(left), as_num(right)) else {
                return Err(EngineError::expression(format!(
                    "unsupported operand types for {}: '{}' and '{}'",
                    symbol(op),
                    type_name(left),
                    type_name(right)
                )));
            };
            arithmetic(op, a, b)?.into_value()
        }
    }
}

fn symbol(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "+",
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        BinaryOp::FloorDiv => "//",
        BinaryOp::Mod => "%",
    }
}

fn arithmetic(op: BinaryOp, a: Num, b: Num) -> EngineResult<Num> {
    let overflow = || EngineError::expression("integer overflow");
    let zero_division = || EngineError::expression("division by zero");

    if matches!(op, BinaryOp::Div | BinaryOp::FloorDiv | BinaryOp::Mod) && b.as_f64() == 0.0 {
        return Err(zero_division());
    }

    match (a, b) {
        (Num::Int(a), Num::Int(b)) => match op {
            BinaryOp::Add => a.checked_add(b).map(Num::Int).ok_or_else(overflow),
            BinaryOp::Sub => a.checked_sub(b).map(Num::Int).ok_or_else(overflow),
            BinaryOp::Mul => a.checked_mul(b).map(Num::Int).ok_or_else(overflow),
            BinaryOp::Div => Ok(Num::Float(a as f64 / b as f64)),
            BinaryOp::FloorDiv => {
                let quotient = a.checked_div(b).ok_or_else(overflow)?;
                let adjust = a % b != 0 && ((a < 0) != (b < 0));
                Ok(Num::Int(if adjust { quotient - 1 } else { quotient }))
            }
            BinaryOp::Mod => {
                let remainder = a.checked_rem(b).ok_or_else(overflow)?;
                let adjust = remainder != 0 && ((remainder < 0) != (b < 0));
                Ok(Num::Int(if adjust { remainder + b } else { remainder }))
            }
        },
        _ => {
            let (a, b) = (a.as_f64(), b.as_f64());
            Ok(Num::Float(match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div => a / b,
                BinaryOp::FloorDiv => (a / b).floor(),
                BinaryOp::Mod => a - b * (a / b).floor(),
            }))
        }
    }
}

fn repeat(sequence: &Value, count: &Value) -> EngineResult<Value> {
    let Some(Num::Int(count)) = as_num(count) else {
        return Err(EngineError::expression(format!(
            "can't multiply sequence by non-int of type '{}'",
            type_name(count)
        )));
    };
    let count = usize::try_from(count).unwrap_or(0);
    match sequence {
        Value::String(text) => {
            ensure_within_cap(text.len().saturating_mul(count), "repeated string")?;
            Ok(Value::String(text.repeat(count)))
        }
        Value::Array(items) => {
            ensure_within_cap(sequence_size(sequence).saturating_mul(count), "repeated list")?;
            Ok(Value::Array(items.iter().cloned().cycle().take(items.len() * count).collect()))
        }
        other => Err(EngineError::expression(format!("cannot repeat '{}'", type_name(other)))),
    }
}

/// Equality with numeric promotion: `1 == 1.0` and `True == 1` hold.
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (as_num(left), as_num(right)) {
        (Some(Num::Int(a)), Some(Num::Int(b))) => a == b,
        (Some(a), Some(b)) => a.as_f64() == b.as_f64(),
        _ => match (left, right) {
            (Value::Array(a), Value::Array(b)) => a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y)),
            _ => left == right,
        },
    }
}

fn order(left: &Value, right: &Value) -> EngineResult<Ordering> {
    let unorderable = || {
        EngineError::expression(format!(
            "'<' not supported between '{}' and '{}'",
            type_name(left),
            type_name(right)
        ))
    };
    match (as_num(left), as_num(right)) {
        (Some(Num::Int(a)), Some(Num::Int(b))) => Ok(a.cmp(&b)),
        (Some(a), Some(b)) => a.as_f64().partial_cmp(&b.as_f64()).ok_or_else(unorderable),
        _ => match (left, right) {
            (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
            _ => Err(unorderable()),
        },
    }
}

fn contains(container: &Value, item: &Value) -> EngineResult<bool> {
    match (container, item) {
        (Value::String(haystack), Value::String(needle)) => Ok(haystack.contains(needle.as_str())),
        (Value::Array(items), _) => Ok(items.iter().any(|candidate| values_equal(candidate, item))),
        (Value::Object(map), Value::String(key)) => Ok(map.contains_key(key)),
        _ => Err(EngineError::expression(format!(
            "'in <{}>' requires a matching operand, got '{}'",
            type_name(container),
            type_name(item)
        ))),
    }
}

fn compare(op: CompareOp, left: &Value, right: &Value) -> EngineResult<bool> {
    Ok(match op {
        CompareOp::Eq => values_equal(left, right),
        CompareOp::NotEq => !values_equal(left, right),
        CompareOp::Lt => order(left, right)? == Ordering::Less,
        CompareOp::LtEq => order(left, right)? != Ordering::Greater,
        CompareOp::Gt => order(left, right)? == Ordering::Greater,
        CompareOp::GtEq => order(left, right)? != Ordering::Less,
        CompareOp::In => contains(right, left)?,
        CompareOp::NotIn => !contains(right, left)?,
    })
}

fn subscript(target: &Value, index: &Value) -> EngineResult<Value> {
    let position = |len: usize| -> EngineResult<usize> {
        let Some(Num::Int(raw)) = as_num(index) else {
            return Err(EngineError::expression(format!("indices must be integers, not '{}'", type_name(index))));
        };
        let len = i64::try_from(len).unwrap_or(i64::MAX);
        let resolved = if raw < 0 { raw + len } else { raw };
        if (0..len).contains(&resolved) {
            Ok(resolved as usize)
        } else {
            Err(EngineError::expression("index out of range"))
        }
    };

    match target {
        Value::Array(items) => Ok(items[position(items.len())?].clone()),
        Value::String(text) => {
            let chars: Vec<char> = text.chars().collect();
            Ok(Value::String(chars[position(chars.len())?].to_string()))
        }
        Value::Object(map) => {
            let key = match index {
                Value::String(key) => key.clone(),
                other => display_value(other),
            };
            map.get(&key)
                .cloned()
                .ok_or_else(|| EngineError::expression(format!("key not found: '{key}'")))
        }
        other => Err(EngineError::expression(format!("'{}' is not subscriptable", type_name(other)))),
    }
}

fn call(name: &str, args: &[Value]) -> EngineResult<Value> {
    match name {
        "len" => match single(name, args)? {
            Value::String(text) => Ok(Value::from(text.chars().count())),
            Value::Array(items) => Ok(Value::from(items.len())),
            Value::Object(map) => Ok(Value::from(map.len())),
            other => Err(EngineError::expression(format!("object of type '{}' has no len()", type_name(other)))),
        },
        "str" => Ok(Value::String(display_value(single(name, args)?))),
        "bool" => Ok(Value::Bool(truthy(single(name, args)?))),
        "int" => to_int(single(name, args)?).map(Value::from),
        "float" => to_float(single(name, args)?).and_then(|value| Num::Float(value).into_value()),
        "abs" => match as_num(single(name, args)?) {
            Some(Num::Int(int)) => int
                .checked_abs()
                .map(Value::from)
                .ok_or_else(|| EngineError::expression("integer overflow")),
            Some(Num::Float(float)) => Num::Float(float.abs()).into_value(),
            None => Err(EngineError::expression("abs() requires a number")),
        },
        "round" => {
            let (value, digits) = match args {
                [value] => (value, 0),
                [value, digits] => (value, to_int(digits)?),
                _ => return Err(EngineError::expression("round() takes one or two arguments")),
            };
            let number = as_num(value).ok_or_else(|| EngineError::expression("round() requires a number"))?;
            if digits <= 0 && args.len() == 1 {
                return Ok(Value::from(number.as_f64().round_ties_even() as i64));
            }
            let scale = 10f64.powi(i32::try_from(digits).unwrap_or(0));
            Num::Float((number.as_f64() * scale).round_ties_even() / scale).into_value()
        }
        "min" | "max" => {
            let candidates: &[Value] = match args {
                [Value::Array(items)] => items,
                _ => args,
            };
            let mut best = candidates
                .first()
                .ok_or_else(|| EngineError::expression(format!("{name}() arg is an empty sequence")))?;
            for candidate in &candidates[1..] {
                let ordering = order(candidate, best)?;
                if (name == "min" && ordering == Ordering::Less) || (name == "max" && ordering == Ordering::Greater) {
                    best = candidate;
                }
            }
            Ok(best.clone())
        }
        _ => Err(EngineError::expression(format!("unknown function '{name}'"))),
    }
}

fn single<'a>(name: &str, args: &'a [Value]) -> EngineResult<&'a Value> {
    match args {
        [value] => Ok(value),
        _ => Err(EngineError::expression(format!("{name}() takes exactly one argument"))),
    }
}

fn to_int(value: &Value) -> EngineResult<i64> {
    match value {
        Value::String(text) => text
            .trim()
            .parse::<i64>()
            .map_err(|_| EngineError::expression(format!("invalid literal for int(): '{text}'"))),
        other => match as_num(other) {
            Some(Num::Int(int)) => Ok(int),
            Some(Num::Float(float)) if float.is_finite() => Ok(float.trunc() as i64),
            _ => Err(EngineError::expression(format!("int() argument must be a number or string, not '{}'", type_name(other)))),
        },
    }
}

fn to_float(value: &Value) -> EngineResult<f64> {
    match value {
        Value::String(text) => text
            .trim()
            .parse::<f64>()
            .map_err(|_| EngineError::expression(format!("could not convert string to float: '{text}'"))),
        other => as_num(other)
            .map(Num::as_f64)
            .ok_or_else(|| EngineError::expression(format!("float() argument must be a number or string, not '{}'", type_name(other)))),
    }
}

#[cfg(test)]
mod tests {
    use super::super::parser::parse;
    use super::*;
    use serde_json::json;

    fn eval(source: &str) -> EngineResult<Value> {
        let mut variables = VariableStore::new();
        variables.set("i", json!(3));
        variables.set("name", json!("bob"));
        variables.set("items", json!([1, 2, 3]));
        variables.set("config", json!({"port": 8080}));
        evaluate_expr(&parse(source)?, &variables)
    }

    #[test]
    fn integer_arithmetic_follows_floor_semantics() {
        assert_eq!(eval("7 // 2").unwrap(), json!(3));
        assert_eq!(eval("-7 // 2").unwrap(), json!(-4));
        assert_eq!(eval("-7 % 3").unwrap(), json!(2));
        assert_eq!(eval("7 / 2").unwrap(), json!(3.5));
        assert_eq!(eval("2 + 3 * i").unwrap(), json!(11));
    }

    #[test]
    fn comparisons_promote_numbers_and_chain() {
        assert_eq!(eval("1 == 1.0").unwrap(), json!(true));
        assert_eq!(eval("0 < i < 4").unwrap(), json!(true));
        assert_eq!(eval("0 < i < 3").unwrap(), json!(false));
        assert_eq!(eval("'2' == 2").unwrap(), json!(false));
    }

    #[test]
    fn boolean_operators_return_operands() {
        assert_eq!(eval("0 or name").unwrap(), json!("bob"));
        assert_eq!(eval("i and 0").unwrap(), json!(0));
        assert_eq!(eval("!items").unwrap(), json!(false));
        assert_eq!(eval("i > 1 && name == 'bob'").unwrap(), json!(true));
    }

    #[test]
    fn membership_subscripts_and_builtins() {
        assert_eq!(eval("2 in items").unwrap(), json!(true));
        assert_eq!(eval("'port' in config").unwrap(), json!(true));
        assert_eq!(eval("'x' not in name").unwrap(), json!(true));
        assert_eq!(eval("items[-1] + config['port']").unwrap(), json!(8083));
        assert_eq!(eval("len(name) + int('4')").unwrap(), json!(7));
        assert_eq!(eval("max(items)").unwrap(), json!(3));
        assert_eq!(eval("name + str(i)").unwrap(), json!("bob3"));
    }

    #[test]
    fn runtime_errors_are_reported() {
        assert!(matches!(eval("missing + 1"), Err(EngineError::UndefinedVariable { .. })));
        assert!(matches!(eval("1 / 0"), Err(EngineError::Expression { .. })));
        assert!(matches!(eval("name - 1"), Err(EngineError::Expression { .. })));
        assert!(matches!(eval("items[10]"), Err(EngineError::Expression { .. })));
        assert!(matches!(eval("9223372036854775807 + 1"), Err(EngineError::Expression { .. })));
        assert!(matches!(eval("system('ls')"), Err(EngineError::Expression { .. })));
    }

    #[test]
    fn built_sequences_are_bounded_through_nesting() {
        assert_eq!(eval("len([0] * 1048576)").unwrap(), json!(1_048_576));
        assert!(matches!(eval("[[0] * 1048576] * 8"), Err(EngineError::Expression { .. })));
        assert!(matches!(eval("[[0] * 1048576] + [[0] * 1048576]"), Err(EngineError::Expression { .. })));

        let mut variables = VariableStore::new();
        variables.set("s", json!("x".repeat(1 << 19)));
        let doubled = evaluate_expr(&parse("s + s").unwrap(), &variables).unwrap();
        variables.set("s", doubled);
        assert!(matches!(
            evaluate_expr(&parse("s + s").unwrap(), &variables),
            Err(EngineError::Expression { .. })
        ));
    }

    #[test]
    fn truthiness_matches_python_rules() {
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(!truthy(&json!({})));
        assert!(truthy(&json!([0])));
        assert!(truthy(&json!(-0.5)));
    }
}
