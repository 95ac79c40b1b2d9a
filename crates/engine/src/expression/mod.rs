//! # Expression evaluation
//!
//! Expressions are evaluated against a read-only [`StoreView`] and return
//! dynamically typed JSON values. The language is intentionally small:
//!
//! - roots: `vars`, `steps` (`steps[0]`, `steps.login`), `current`, `i`, `env`
//! - literals: numbers, strings (single or double quoted), `true`, `false`, `nil`/`null`, arrays
//! - operators: `! - + * / % == != < <= > >= && || in` and `cond ? a : b`
//! - builtins: `urlencode`, `string`, `int`, `float`, `bool`, `len`, `time`,
//!   `compare`, `sprintf`, `contains`, plus any [`Functions`] carried by the
//!   store, which take precedence over builtins of the same name
//!
//! Reading a missing key or an out-of-range index yields `null`; reading a
//! field of a scalar is a type error. Evaluation never mutates the store.
//!
//! ```rust
//! use runbook_engine::expression::{evaluate, evaluate_condition, interpolate};
//! use runbook_engine::store::Store;
//! use serde_json::json;
//!
//! let mut store = Store::new(serde_json::Map::new(), 0);
//! store.set("user", json!({ "name": "alice", "roles": ["admin"] }));
//! let view = store.view(None);
//!
//! assert_eq!(evaluate("vars.user.name", &view).unwrap(), json!("alice"));
//! assert!(evaluate_condition("'admin' in vars.user.roles", &view).unwrap());
//! assert_eq!(
//!     interpolate(&json!({ "path": "/users/${{ vars.user.name }}" }), &view).unwrap(),
//!     json!({ "path": "/users/alice" })
//! );
//! ```

mod builtins;
mod eval;
mod functions;
mod lexer;
mod parser;

use serde_json::{Map, Value};

pub use eval::is_truthy;
pub use functions::{CustomFunction, Functions};

use crate::error::ExpressionError;
use crate::store::StoreView;

const TEMPLATE_OPEN: &str = "${{";
const TEMPLATE_CLOSE: &str = "}}";

/// Evaluates `expression` and returns its value.
///
/// A surrounding `${{ ... }}` wrapper is accepted and ignored.
pub fn evaluate(expression: &str, view: &StoreView<'_>) -> Result<Value, ExpressionError> {
    let source = strip_template_wrapper(expression);
    let ast = parser::parse(source)?;
    eval::Evaluator::new(*view).eval(&ast).map(|value| value.into_owned())
}

/// Evaluates `expression` in boolean context.
///
/// An evaluation error is returned as such and never coerced to `false`.
pub fn evaluate_condition(expression: &str, view: &StoreView<'_>) -> Result<bool, ExpressionError> {
    let source = strip_template_wrapper(expression);
    let ast = parser::parse(source)?;
    let value = eval::Evaluator::new(*view).eval(&ast)?;
    Ok(is_truthy(&value))
}

/// Checks that `expression` parses, without evaluating it.
pub fn validate(expression: &str) -> Result<(), ExpressionError> {
    parser::parse(strip_template_wrapper(expression)).map(|_| ())
}

/// Expands every `${{ expr }}` template inside `value`, recursing through arrays and objects.
///
/// A string consisting of exactly one template is replaced by the typed
/// result; templates embedded in longer strings are rendered as text.
pub fn interpolate(value: &Value, view: &StoreView<'_>) -> Result<Value, ExpressionError> {
    match value {
        Value::String(text) => interpolate_string(text, view),
        Value::Array(items) => items
            .iter()
            .map(|item| interpolate(item, view))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut interpolated = Map::with_capacity(map.len());
            for (key, child) in map {
                interpolated.insert(key.clone(), interpolate(child, view)?);
            }
            Ok(Value::Object(interpolated))
        }
        other => Ok(other.clone()),
    }
}

fn interpolate_string(text: &str, view: &StoreView<'_>) -> Result<Value, ExpressionError> {
    if !text.contains(TEMPLATE_OPEN) {
        return Ok(Value::String(text.to_string()));
    }

    let trimmed = text.trim();
    if let Some(inner) = single_template(trimmed) {
        return evaluate(inner, view);
    }

    let mut rendered = String::with_capacity(text.len());
    let mut rest = text;
    let mut offset = 0;
    while let Some(start) = rest.find(TEMPLATE_OPEN) {
        rendered.push_str(&rest[..start]);
        let after_open = &rest[start + TEMPLATE_OPEN.len()..];
        let Some(end) = after_open.find(TEMPLATE_CLOSE) else {
            return Err(ExpressionError::syntax(offset + start, "unterminated '${{' template"));
        };
        let value = evaluate(&after_open[..end], view)?;
        rendered.push_str(&builtins::to_display_string(&value));
        let consumed = start + TEMPLATE_OPEN.len() + end + TEMPLATE_CLOSE.len();
        offset += consumed;
        rest = &rest[consumed..];
    }
    rendered.push_str(rest);
    Ok(Value::String(rendered))
}

/// Returns the inner expression when `text` is exactly one `${{ ... }}` template.
fn single_template(text: &str) -> Option<&str> {
    let inner = text.strip_prefix(TEMPLATE_OPEN)?.strip_suffix(TEMPLATE_CLOSE)?;
    if inner.contains(TEMPLATE_OPEN) || inner.contains(TEMPLATE_CLOSE) {
        return None;
    }
    Some(inner)
}

fn strip_template_wrapper(expression: &str) -> &str {
    let trimmed = expression.trim();
    single_template(trimmed).map(str::trim).unwrap_or(trimmed)
}
