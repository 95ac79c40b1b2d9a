use std::borrow::Cow;
use std::cmp::Ordering;

use serde_json::{Map, Number, Value};

use super::builtins;
use super::parser::{BinaryOp, Expr, UnaryOp};
use crate::error::ExpressionError;
use crate::store::StoreView;

/// Walks an [`Expr`] against a store view. Paths into the store are borrowed,
/// computed values are owned.
pub(crate) struct Evaluator<'s> {
    view: StoreView<'s>,
}

impl<'s> Evaluator<'s> {
    pub(crate) fn new(view: StoreView<'s>) -> Self {
        Self { view }
    }

    pub(crate) fn eval(&self, expr: &Expr) -> Result<Cow<'s, Value>, ExpressionError> {
        match expr {
            Expr::Literal(value) => Ok(Cow::Owned(value.clone())),
            Expr::Ident(name) => self.root(name),
            Expr::Array(items) => {
                let values = items
                    .iter()
                    .map(|item| self.eval(item).map(Cow::into_owned))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Cow::Owned(Value::Array(values)))
            }
            Expr::Member(base, field) => {
                if let Expr::Ident(root) = base.as_ref()
                    && let Some(value) = self.root_member(root, field)
                {
                    return Ok(value);
                }
                member(self.eval(base)?, field)
            }
            Expr::Index(base, index) => {
                let index = self.eval(index)?;
                if let Expr::Ident(root) = base.as_ref()
                    && let Some(key) = index_key(&index)
                    && let Some(value) = self.root_member(root, &key)
                {
                    return Ok(value);
                }
                index_into(self.eval(base)?, &index)
            }
            Expr::Call(function, arguments) => {
                let values = arguments
                    .iter()
                    .map(|argument| self.eval(argument).map(Cow::into_owned))
                    .collect::<Result<Vec<_>, _>>()?;
                if let Some(custom) = self.view.functions().get(function) {
                    return custom(values.as_slice())
                        .map(Cow::Owned)
                        .map_err(|message| ExpressionError::function(function, message));
                }
                builtins::call(function, values).map(Cow::Owned)
            }
            Expr::Unary(op, operand) => {
                let value = self.eval(operand)?;
                match op {
                    UnaryOp::Not => Ok(Cow::Owned(Value::Bool(!is_truthy(&value)))),
                    UnaryOp::Negate => negate(&value).map(Cow::Owned),
                }
            }
            Expr::Binary(BinaryOp::And, lhs, rhs) => {
                let lhs = self.eval(lhs)?;
                let result = is_truthy(&lhs) && {
                    let rhs = self.eval(rhs)?;
                    is_truthy(&rhs)
                };
                Ok(Cow::Owned(Value::Bool(result)))
            }
            Expr::Binary(BinaryOp::Or, lhs, rhs) => {
                let lhs = self.eval(lhs)?;
                let result = is_truthy(&lhs) || {
                    let rhs = self.eval(rhs)?;
                    is_truthy(&rhs)
                };
                Ok(Cow::Owned(Value::Bool(result)))
            }
            Expr::Binary(op, lhs, rhs) => {
                let lhs = self.eval(lhs)?;
                let rhs = self.eval(rhs)?;
                binary(*op, &lhs, &rhs).map(Cow::Owned)
            }
            Expr::Ternary(condition, when_true, when_false) => {
                let condition = self.eval(condition)?;
                if is_truthy(&condition) {
                    self.eval(when_true)
                } else {
                    self.eval(when_false)
                }
            }
        }
    }

    fn root(&self, name: &str) -> Result<Cow<'s, Value>, ExpressionError> {
        match name {
            "vars" => Ok(Cow::Owned(Value::Object(self.view.vars().clone()))),
            "steps" => Ok(Cow::Owned(Value::Array(self.view.steps().to_vec()))),
            "current" => Ok(Cow::Borrowed(self.view.current())),
            "i" => Ok(Cow::Owned(self.view.loop_index().map(Value::from).unwrap_or(Value::Null))),
            "env" => Ok(Cow::Owned(Value::Object(
                std::env::vars().map(|(key, value)| (key, Value::String(value))).collect::<Map<_, _>>(),
            ))),
            other => Err(ExpressionError::UnknownIdentifier(other.to_string())),
        }
    }

    /// Direct lookups that avoid materializing a whole root namespace.
    fn root_member(&self, root: &str, key: &str) -> Option<Cow<'s, Value>> {
        match root {
            "vars" => Some(self.view.var(key).map(Cow::Borrowed).unwrap_or(Cow::Owned(Value::Null))),
            "steps" => {
                let slot = match key.parse::<usize>() {
                    Ok(index) => self.view.step(index),
                    Err(_) => self.view.step_by_alias(key),
                };
                Some(Cow::Borrowed(slot))
            }
            "env" => Some(Cow::Owned(std::env::var(key).map(Value::String).unwrap_or(Value::Null))),
            _ => None,
        }
    }
}

fn index_key(index: &Value) -> Option<String> {
    match index {
        Value::String(key) => Some(key.clone()),
        Value::Number(number) => number.as_u64().map(|value| value.to_string()),
        _ => None,
    }
}

fn member<'s>(base: Cow<'s, Value>, field: &str) -> Result<Cow<'s, Value>, ExpressionError> {
    match base {
        Cow::Borrowed(Value::Object(map)) => Ok(map.get(field).map(Cow::Borrowed).unwrap_or(Cow::Owned(Value::Null))),
        Cow::Owned(Value::Object(mut map)) => Ok(Cow::Owned(map.remove(field).unwrap_or(Value::Null))),
        Cow::Borrowed(Value::Null) | Cow::Owned(Value::Null) => Ok(Cow::Owned(Value::Null)),
        other => Err(ExpressionError::type_error(format!(
            "cannot read field '{field}' of {}",
            type_name(&other)
        ))),
    }
}

fn index_into<'s>(base: Cow<'s, Value>, index: &Value) -> Result<Cow<'s, Value>, ExpressionError> {
    match (base, index) {
        (Cow::Borrowed(Value::Null) | Cow::Owned(Value::Null), _) => Ok(Cow::Owned(Value::Null)),
        (base, Value::String(key)) if base.is_object() => member(base, key),
        (Cow::Borrowed(Value::Array(items)), Value::Number(number)) => Ok(number
            .as_u64()
            .and_then(|position| items.get(position as usize))
            .map(Cow::Borrowed)
            .unwrap_or(Cow::Owned(Value::Null))),
        (Cow::Owned(Value::Array(mut items)), Value::Number(number)) => {
            let element = match number.as_u64() {
                Some(position) if (position as usize) < items.len() => items.swap_remove(position as usize),
                _ => Value::Null,
            };
            Ok(Cow::Owned(element))
        }
        (base, index) => Err(ExpressionError::type_error(format!(
            "cannot index {} with {}",
            type_name(&base),
            type_name(index)
        ))),
    }
}

fn negate(value: &Value) -> Result<Value, ExpressionError> {
    match value {
        Value::Number(number) => match number.as_i64() {
            Some(integer) => integer
                .checked_neg()
                .map(Value::from)
                .ok_or_else(|| ExpressionError::type_error("integer overflow")),
            None => Ok(Value::from(-number.as_f64().unwrap_or_default())),
        },
        other => Err(ExpressionError::type_error(format!("cannot negate {}", type_name(other)))),
    }
}

fn binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, ExpressionError> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(values_equal(lhs, rhs))),
        BinaryOp::NotEq => Ok(Value::Bool(!values_equal(lhs, rhs))),
        BinaryOp::Less | BinaryOp::LessEq | BinaryOp::Greater | BinaryOp::GreaterEq => {
            let ordering = compare_ordered(lhs, rhs)?;
            Ok(Value::Bool(match op {
                BinaryOp::Less => ordering == Ordering::Less,
                BinaryOp::LessEq => ordering != Ordering::Greater,
                BinaryOp::Greater => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            }))
        }
        BinaryOp::In => contains(rhs, lhs).map(Value::Bool),
        BinaryOp::Add => match (lhs, rhs) {
            (Value::String(left), Value::String(right)) => Ok(Value::String(format!("{left}{right}"))),
            (Value::Array(left), Value::Array(right)) => Ok(Value::Array(left.iter().chain(right).cloned().collect())),
            _ => arithmetic(op, lhs, rhs),
        },
        _ => arithmetic(op, lhs, rhs),
    }
}

fn arithmetic(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, ExpressionError> {
    let (Value::Number(left), Value::Number(right)) = (lhs, rhs) else {
        return Err(ExpressionError::type_error(format!(
            "unsupported operands {} and {} for {op:?}",
            type_name(lhs),
            type_name(rhs)
        )));
    };

    if let (Some(left), Some(right)) = (left.as_i64(), right.as_i64()) {
        let result = match op {
            BinaryOp::Add => left.checked_add(right),
            BinaryOp::Sub => left.checked_sub(right),
            BinaryOp::Mul => left.checked_mul(right),
            BinaryOp::Div if right == 0 => return Err(ExpressionError::type_error("division by zero")),
            BinaryOp::Div if left.checked_rem(right).is_some_and(|remainder| remainder != 0) => {
                return Ok(Value::from(left as f64 / right as f64));
            }
            BinaryOp::Div => left.checked_div(right),
            BinaryOp::Rem if right == 0 => return Err(ExpressionError::type_error("division by zero")),
            BinaryOp::Rem => left.checked_rem(right),
            _ => None,
        };
        return result
            .map(Value::from)
            .ok_or_else(|| ExpressionError::type_error("integer overflow"));
    }

    let left = left.as_f64().unwrap_or_default();
    let right = right.as_f64().unwrap_or_default();
    let result = match op {
        BinaryOp::Add => left + right,
        BinaryOp::Sub => left - right,
        BinaryOp::Mul => left * right,
        BinaryOp::Div | BinaryOp::Rem if right == 0.0 => return Err(ExpressionError::type_error("division by zero")),
        BinaryOp::Div => left / right,
        BinaryOp::Rem => left % right,
        _ => return Err(ExpressionError::type_error(format!("unsupported operator {op:?}"))),
    };
    Ok(Value::from(result))
}

fn compare_ordered(lhs: &Value, rhs: &Value) -> Result<Ordering, ExpressionError> {
    match (lhs, rhs) {
        (Value::Number(left), Value::Number(right)) => compare_numbers(left, right)
            .ok_or_else(|| ExpressionError::type_error("numbers are not comparable")),
        (Value::String(left), Value::String(right)) => Ok(left.cmp(right)),
        _ => Err(ExpressionError::type_error(format!(
            "cannot compare {} with {}",
            type_name(lhs),
            type_name(rhs)
        ))),
    }
}

fn compare_numbers(left: &Number, right: &Number) -> Option<Ordering> {
    if let (Some(left), Some(right)) = (left.as_i64(), right.as_i64()) {
        return Some(left.cmp(&right));
    }
    left.as_f64()?.partial_cmp(&right.as_f64()?)
}

/// Deep equality where `1` and `1.0` are equal.
pub(crate) fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Number(left), Value::Number(right)) => compare_numbers(left, right) == Some(Ordering::Equal),
        (Value::Array(left), Value::Array(right)) => {
            left.len() == right.len() && left.iter().zip(right).all(|(left, right)| values_equal(left, right))
        }
        (Value::Object(left), Value::Object(right)) => {
            left.len() == right.len()
                && left
                    .iter()
                    .all(|(key, value)| right.get(key).is_some_and(|other| values_equal(value, other)))
        }
        _ => lhs == rhs,
    }
}

/// Membership test backing both the `in` operator and `contains()`.
pub(crate) fn contains(haystack: &Value, needle: &Value) -> Result<bool, ExpressionError> {
    match haystack {
        Value::Array(items) => Ok(items.iter().any(|item| values_equal(item, needle))),
        Value::Object(map) => match needle {
            Value::String(key) => Ok(map.contains_key(key)),
            other => Err(ExpressionError::type_error(format!(
                "object keys are strings, got {}",
                type_name(other)
            ))),
        },
        Value::String(text) => match needle {
            Value::String(fragment) => Ok(text.contains(fragment.as_str())),
            other => Err(ExpressionError::type_error(format!(
                "cannot search a string for {}",
                type_name(other)
            ))),
        },
        Value::Null => Ok(false),
        other => Err(ExpressionError::type_error(format!("cannot search {}", type_name(other)))),
    }
}

/// `false`, `null`, `0`, `""`, `[]` and `{}` are falsy; everything else is truthy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|value| value != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
