//! Generic expression evaluator, built on [pest](https://pest.rs/).
//!
//! This is the collaborator the execution engine hands substituted
//! expressions to: an expression string plus a flat `name -> Value`
//! parameter table in, a scalar [`Value`] out. It knows nothing about
//! scopes, documents, or directives.
//!
//! The grammar is defined in `expr.pest`. Parsing and evaluation are
//! split so that a compiled expression site can parse once and evaluate
//! on every repeater iteration.

use std::collections::HashMap;

use pest::Parser;
use pest_derive::Parser;
use thiserror::Error;

use crate::value::Value;

#[derive(Parser)]
#[grammar = "expr/expr.pest"]
struct ExprParser;

/// An error produced while parsing or evaluating an expression.
///
/// These are never fatal to a lenient compile: the engine absorbs them
/// and leaves the original `{{...}}` text in the output.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("expected {expected}, got {got}")]
    Type { expected: String, got: String },
    #[error("division by zero")]
    DivisionByZero,
    #[error("unknown parameter '{0}'")]
    UnknownParameter(String),
}

impl ExprError {
    fn type_error(expected: &str, got: &str) -> Self {
        ExprError::Type {
            expected: expected.to_string(),
            got: got.to_string(),
        }
    }
}

// ── AST ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub(crate) enum Expr {
    Literal(Value),
    Param(String),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        left: Box<Expr>,
        op: BinOp,
        right: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinOp {
    Eq,
    NotEq,
    Lt,
    Gt,
    LtEq,
    GtEq,
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
}

impl BinOp {
    fn precedence(&self) -> u8 {
        match self {
            BinOp::Or => 1,
            BinOp::And => 2,
            BinOp::Eq | BinOp::NotEq => 3,
            BinOp::Lt | BinOp::Gt | BinOp::LtEq | BinOp::GtEq => 4,
            BinOp::Add | BinOp::Sub => 5,
            BinOp::Mul | BinOp::Div => 6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnaryOp {
    Not,
    Neg,
}

/// Parse an expression string into an AST.
pub(crate) fn parse(source: &str) -> Result<Expr, ExprError> {
    let mut pairs = ExprParser::parse(Rule::input, source)
        .map_err(|e| ExprError::Syntax(e.to_string()))?;
    build_expr(pairs.next().expect("input always contains an expr"))
}

/// Evaluate a parsed expression against a parameter table.
pub(crate) fn eval(expr: &Expr, params: &HashMap<String, Value>) -> Result<Value, ExprError> {
    match expr {
        Expr::Literal(val) => Ok(val.clone()),
        Expr::Param(name) => params
            .get(name)
            .cloned()
            .ok_or_else(|| ExprError::UnknownParameter(name.clone())),
        Expr::Unary { op, operand } => {
            let val = eval(operand, params)?;
            eval_unary_op(*op, &val)
        }
        Expr::Binary { left, op, right } => {
            let left_val = eval(left, params)?;
            let right_val = eval(right, params)?;
            eval_binary_op(&left_val, *op, &right_val)
        }
    }
}

/// Parse and evaluate in one step: the boundary the engine calls through.
pub fn evaluate(source: &str, params: &HashMap<String, Value>) -> Result<Value, ExprError> {
    let ast = parse(source)?;
    eval(&ast, params)
}

// ── pest tree -> AST ────────────────────────────────────────────────────

fn build_expr(pair: pest::iterators::Pair<Rule>) -> Result<Expr, ExprError> {
    let mut inner = pair.into_inner();

    let first = build_unary(inner.next().expect("expr starts with a unary"))?;

    let mut rest: Vec<(BinOp, Expr)> = Vec::new();
    while let Some(op_pair) = inner.next() {
        let op = parse_bin_op(op_pair.as_str());
        let right_pair = inner.next().expect("operator is always followed by an operand");
        rest.push((op, build_unary(right_pair)?));
    }

    let mut rest = rest.into_iter().peekable();
    Ok(climb(first, &mut rest, 0))
}

/// Precedence-climbing fold over the flat `operand (op operand)*` list.
fn climb(
    mut lhs: Expr,
    rest: &mut std::iter::Peekable<std::vec::IntoIter<(BinOp, Expr)>>,
    min_prec: u8,
) -> Expr {
    while let Some((op, _)) = rest.peek() {
        let prec = op.precedence();
        if prec < min_prec {
            break;
        }
        let (op, mut rhs) = rest.next().expect("peek succeeded");
        while let Some((next_op, _)) = rest.peek() {
            if next_op.precedence() > prec {
                rhs = climb(rhs, rest, prec + 1);
            } else {
                break;
            }
        }
        lhs = Expr::Binary {
            left: Box::new(lhs),
            op,
            right: Box::new(rhs),
        };
    }
    lhs
}

fn build_unary(pair: pest::iterators::Pair<Rule>) -> Result<Expr, ExprError> {
    let mut inner = pair.into_inner();
    let first = inner.next().expect("unary is never empty");

    if first.as_rule() == Rule::unary_op {
        let op = match first.as_str() {
            "!" => UnaryOp::Not,
            "-" => UnaryOp::Neg,
            other => return Err(ExprError::Syntax(format!("unknown unary operator {other:?}"))),
        };
        let operand = build_atom(inner.next().expect("unary op is followed by an atom"))?;
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand),
        })
    } else {
        build_atom(first)
    }
}

fn build_atom(pair: pest::iterators::Pair<Rule>) -> Result<Expr, ExprError> {
    match pair.as_rule() {
        // atom wraps the actual content — unwrap one level
        Rule::atom => build_atom(pair.into_inner().next().expect("atom wraps one rule")),
        Rule::group => build_expr(pair.into_inner().next().expect("group wraps an expr")),
        Rule::number => {
            let n: f64 = pair
                .as_str()
                .parse()
                .map_err(|_| ExprError::Syntax(format!("invalid number: {}", pair.as_str())))?;
            Ok(Expr::Literal(Value::Number(n)))
        }
        Rule::quoted => {
            let inner = pair
                .into_inner()
                .next()
                .map(|p| p.as_str())
                .unwrap_or("");
            Ok(Expr::Literal(Value::String(inner.to_string())))
        }
        Rule::bool_lit => Ok(Expr::Literal(Value::Bool(pair.as_str() == "true"))),
        Rule::null_lit => Ok(Expr::Literal(Value::Null)),
        Rule::ident => Ok(Expr::Param(pair.as_str().to_string())),
        other => Err(ExprError::Syntax(format!(
            "unexpected rule in atom position: {other:?}"
        ))),
    }
}

fn parse_bin_op(s: &str) -> BinOp {
    match s {
        "==" => BinOp::Eq,
        "!=" => BinOp::NotEq,
        "<" => BinOp::Lt,
        ">" => BinOp::Gt,
        "<=" => BinOp::LtEq,
        ">=" => BinOp::GtEq,
        "&&" => BinOp::And,
        "||" => BinOp::Or,
        "+" => BinOp::Add,
        "-" => BinOp::Sub,
        "*" => BinOp::Mul,
        "/" => BinOp::Div,
        _ => unreachable!("unknown operator: {s}"),
    }
}

// ── Pure operator evaluation ────────────────────────────────────────────

fn eval_binary_op(left: &Value, op: BinOp, right: &Value) -> Result<Value, ExprError> {
    match op {
        BinOp::Eq => Ok(Value::Bool(values_equal(left, right))),
        BinOp::NotEq => Ok(Value::Bool(!values_equal(left, right))),

        BinOp::Lt | BinOp::Gt | BinOp::LtEq | BinOp::GtEq => {
            let l = require_number(left)?;
            let r = require_number(right)?;
            let result = match op {
                BinOp::Lt => l < r,
                BinOp::Gt => l > r,
                BinOp::LtEq => l <= r,
                BinOp::GtEq => l >= r,
                _ => unreachable!(),
            };
            Ok(Value::Bool(result))
        }

        BinOp::And => Ok(Value::Bool(left.is_truthy() && right.is_truthy())),
        BinOp::Or => Ok(Value::Bool(left.is_truthy() || right.is_truthy())),

        BinOp::Add => eval_add(left, right),
        BinOp::Sub | BinOp::Mul | BinOp::Div => {
            let l = require_number(left)?;
            let r = require_number(right)?;
            let result = match op {
                BinOp::Sub => l - r,
                BinOp::Mul => l * r,
                BinOp::Div => {
                    if r == 0.0 {
                        return Err(ExprError::DivisionByZero);
                    }
                    l / r
                }
                _ => unreachable!(),
            };
            Ok(Value::Number(result))
        }
    }
}

/// `+` is numeric addition when both sides are numbers, string
/// concatenation when either side is a string.
fn eval_add(left: &Value, right: &Value) -> Result<Value, ExprError> {
    if let (Some(l), Some(r)) = (left.as_number(), right.as_number()) {
        return Ok(Value::Number(l + r));
    }
    if matches!(left, Value::String(_)) || matches!(right, Value::String(_)) {
        return Ok(Value::String(format!(
            "{}{}",
            left.to_output_string(),
            right.to_output_string()
        )));
    }
    Err(ExprError::type_error(
        "number or string",
        &format!("{} + {}", left.type_name(), right.type_name()),
    ))
}

fn eval_unary_op(op: UnaryOp, val: &Value) -> Result<Value, ExprError> {
    match op {
        UnaryOp::Not => Ok(Value::Bool(!val.is_truthy())),
        UnaryOp::Neg => {
            let n = require_number(val)?;
            Ok(Value::Number(-n))
        }
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => (a - b).abs() < f64::EPSILON,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Null, Value::Null) => true,
        _ => false,
    }
}

fn require_number(val: &Value) -> Result<f64, ExprError> {
    val.as_number()
        .ok_or_else(|| ExprError::type_error("number", val.type_name()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval_str(source: &str) -> Value {
        evaluate(source, &HashMap::new()).expect("eval failed")
    }

    fn eval_with(source: &str, params: &[(&str, Value)]) -> Value {
        let table = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        evaluate(source, &table).expect("eval failed")
    }

    #[test]
    fn arithmetic_with_precedence() {
        assert_eq!(eval_str("1 + 2 * 3"), Value::Number(7.0));
        assert_eq!(eval_str("(1 + 2) * 3"), Value::Number(9.0));
        assert_eq!(eval_str("10 - 4 - 3"), Value::Number(3.0));
        assert_eq!(eval_str("7 / 2"), Value::Number(3.5));
    }

    #[test]
    fn comparisons_and_logic() {
        assert_eq!(eval_str("1 + 2 == 3"), Value::Bool(true));
        assert_eq!(eval_str("2 > 3"), Value::Bool(false));
        assert_eq!(eval_str("2 <= 2 && 1 < 2"), Value::Bool(true));
        assert_eq!(eval_str("false || true"), Value::Bool(true));
        assert_eq!(eval_str("!false"), Value::Bool(true));
    }

    #[test]
    fn string_concat_and_equality() {
        assert_eq!(eval_str("'a' + 'b'"), Value::String("ab".into()));
        assert_eq!(eval_str("'n=' + 2"), Value::String("n=2".into()));
        assert_eq!(eval_str("'x' == 'x'"), Value::Bool(true));
    }

    #[test]
    fn parameters_resolve_from_table() {
        assert_eq!(
            eval_with("p0 + 1", &[("p0", Value::Number(41.0))]),
            Value::Number(42.0)
        );
        assert_eq!(
            eval_with("p0 && p1", &[("p0", Value::Bool(true)), ("p1", Value::Number(1.0))]),
            Value::Bool(true)
        );
    }

    #[test]
    fn unknown_parameter_is_an_error() {
        let err = evaluate("p9", &HashMap::new()).unwrap_err();
        assert_eq!(err, ExprError::UnknownParameter("p9".into()));
    }

    #[test]
    fn type_mismatch_is_an_error() {
        let err = evaluate("true + 1", &HashMap::new()).unwrap_err();
        assert!(matches!(err, ExprError::Type { .. }));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        assert_eq!(
            evaluate("1 / 0", &HashMap::new()).unwrap_err(),
            ExprError::DivisionByZero
        );
    }

    #[test]
    fn syntax_errors_are_reported() {
        assert!(matches!(
            evaluate("1 +", &HashMap::new()).unwrap_err(),
            ExprError::Syntax(_)
        ));
        assert!(matches!(
            evaluate("", &HashMap::new()).unwrap_err(),
            ExprError::Syntax(_)
        ));
    }

    #[test]
    fn negative_numbers() {
        assert_eq!(eval_str("-5 + 2"), Value::Number(-3.0));
        assert_eq!(eval_str("2 - -3"), Value::Number(5.0));
    }

    #[test]
    fn null_compares_only_to_null() {
        assert_eq!(eval_str("null == null"), Value::Bool(true));
        assert_eq!(eval_str("null == 0"), Value::Bool(false));
    }
}
