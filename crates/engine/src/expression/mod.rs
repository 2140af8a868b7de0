//! # Expression Sandbox
//!
//! Evaluates arithmetic, comparison and boolean expressions against a run's
//! variables. Expressions never reach host capabilities: the grammar only
//! knows literals, variable names, operators, subscripts and a fixed set of
//! pure builtins (`len`, `str`, `int`, `float`, `bool`, `abs`, `round`,
//! `min`, `max`).
//!
//! Every expression is screened against a deny-list before parsing. The
//! screen runs inside [`evaluate`] itself so no caller can skip it.

mod eval;
mod parser;
mod screen;

pub use eval::{truthy, type_name, values_equal};
pub use parser::{BinaryOp, CompareOp, Expr, parse};
pub use screen::screen_expression;

use serde_json::Value;

use crate::{error::EngineResult, variables::VariableStore};

/// Screens, parses and evaluates `expression`, returning the raw result.
pub fn evaluate(expression: &str, variables: &VariableStore) -> EngineResult<Value> {
    screen_expression(expression)?;
    let expr = parse(expression)?;
    eval::evaluate_expr(&expr, variables)
}

/// Evaluates `expression` and coerces the result to a boolean.
pub fn evaluate_condition(expression: &str, variables: &VariableStore) -> EngineResult<bool> {
    evaluate(expression, variables).map(|value| truthy(&value))
}
