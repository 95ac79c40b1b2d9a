//! Builtin functions callable from expressions.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde_json::Value;

use super::eval::{contains as value_contains, is_truthy, type_name, values_equal};
use crate::error::ExpressionError;

const QUERY_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.').remove(b'~');

pub(crate) fn call(function: &str, arguments: Vec<Value>) -> Result<Value, ExpressionError> {
    match function {
        "urlencode" => {
            let [value] = exact::<1>(function, arguments)?;
            Ok(Value::String(utf8_percent_encode(&to_display_string(&value), QUERY_ESCAPE).to_string()))
        }
        "string" => {
            let [value] = exact::<1>(function, arguments)?;
            Ok(Value::String(to_display_string(&value)))
        }
        "int" => {
            let [value] = exact::<1>(function, arguments)?;
            to_int(&value).map(Value::from)
        }
        "float" => {
            let [value] = exact::<1>(function, arguments)?;
            to_float(&value).map(Value::from)
        }
        "bool" => {
            let [value] = exact::<1>(function, arguments)?;
            Ok(Value::Bool(to_bool(&value)))
        }
        "len" => {
            let [value] = exact::<1>(function, arguments)?;
            length(&value).map(Value::from)
        }
        "time" => {
            let [value] = exact::<1>(function, arguments)?;
            to_time(&value).map(|time| Value::String(time.to_rfc3339_opts(SecondsFormat::AutoSi, true)))
        }
        "compare" => compare(arguments),
        "sprintf" => sprintf(arguments).map(Value::String),
        "contains" => {
            let [haystack, needle] = exact::<2>(function, arguments)?;
            value_contains(&haystack, &needle).map(Value::Bool)
        }
        other => Err(ExpressionError::UnknownFunction(other.to_string())),
    }
}

fn exact<const N: usize>(function: &str, arguments: Vec<Value>) -> Result<[Value; N], ExpressionError> {
    let received = arguments.len();
    arguments
        .try_into()
        .map_err(|_| ExpressionError::function(function, format!("expected {N} argument(s), got {received}")))
}

/// Strings render bare, `null` renders empty, everything else as JSON.
pub(crate) fn to_display_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn to_int(value: &Value) -> Result<i64, ExpressionError> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|float| float.trunc() as i64))
            .ok_or_else(|| ExpressionError::function("int", "number out of range")),
        Value::String(text) => {
            let trimmed = text.trim();
            trimmed
                .parse::<i64>()
                .or_else(|_| trimmed.parse::<f64>().map(|float| float.trunc() as i64))
                .map_err(|_| ExpressionError::function("int", format!("cannot parse '{text}'")))
        }
        Value::Bool(flag) => Ok(i64::from(*flag)),
        other => Err(ExpressionError::function("int", format!("cannot convert {}", type_name(other)))),
    }
}

fn to_float(value: &Value) -> Result<f64, ExpressionError> {
    match value {
        Value::Number(number) => number
            .as_f64()
            .ok_or_else(|| ExpressionError::function("float", "number out of range")),
        Value::String(text) => text
            .trim()
            .parse::<f64>()
            .map_err(|_| ExpressionError::function("float", format!("cannot parse '{text}'"))),
        Value::Bool(flag) => Ok(if *flag { 1.0 } else { 0.0 }),
        other => Err(ExpressionError::function("float", format!("cannot convert {}", type_name(other)))),
    }
}

fn to_bool(value: &Value) -> bool {
    match value {
        Value::String(text) => match text.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => true,
            "false" | "0" | "no" | "off" | "" => false,
            _ => true,
        },
        other => is_truthy(other),
    }
}

fn length(value: &Value) -> Result<usize, ExpressionError> {
    match value {
        Value::String(text) => Ok(text.chars().count()),
        Value::Array(items) => Ok(items.len()),
        Value::Object(map) => Ok(map.len()),
        Value::Null => Ok(0),
        other => Err(ExpressionError::function("len", format!("{} has no length", type_name(other)))),
    }
}

fn to_time(value: &Value) -> Result<DateTime<Utc>, ExpressionError> {
    match value {
        Value::String(text) => DateTime::parse_from_rfc3339(text.trim())
            .map(|time| time.with_timezone(&Utc))
            .map_err(|error| ExpressionError::function("time", format!("cannot parse '{text}': {error}"))),
        Value::Number(number) => {
            let seconds = number.as_f64().unwrap_or_default();
            let whole = seconds.floor();
            // always within [0, 1s) because it is measured from the floor
            let nanos = (((seconds - whole) * 1_000_000_000.0).round() as u32).min(999_999_999);
            Utc.timestamp_opt(whole as i64, nanos)
                .single()
                .ok_or_else(|| ExpressionError::function("time", format!("timestamp {seconds} out of range")))
        }
        other => Err(ExpressionError::function("time", format!("cannot convert {}", type_name(other)))),
    }
}

/// `compare(a, b, ignored_keys...)`: deep equality, optionally ignoring object keys at any depth.
fn compare(arguments: Vec<Value>) -> Result<Value, ExpressionError> {
    if arguments.len() < 2 {
        return Err(ExpressionError::function("compare", "expected at least 2 arguments"));
    }
    let mut arguments = arguments.into_iter();
    let (Some(mut left), Some(mut right)) = (arguments.next(), arguments.next()) else {
        return Err(ExpressionError::function("compare", "expected at least 2 arguments"));
    };
    let ignored: Vec<String> = arguments.map(|key| to_display_string(&key)).collect();
    if !ignored.is_empty() {
        strip_keys(&mut left, &ignored);
        strip_keys(&mut right, &ignored);
    }
    Ok(Value::Bool(values_equal(&left, &right)))
}

fn strip_keys(value: &mut Value, ignored: &[String]) {
    match value {
        Value::Object(map) => {
            map.retain(|key, _| !ignored.contains(key));
            map.values_mut().for_each(|child| strip_keys(child, ignored));
        }
        Value::Array(items) => items.iter_mut().for_each(|child| strip_keys(child, ignored)),
        _ => {}
    }
}

/// Printf-style formatting supporting `%s`, `%v`, `%d`, `%f` (with optional precision) and `%%`.
fn sprintf(arguments: Vec<Value>) -> Result<String, ExpressionError> {
    let mut arguments = arguments.into_iter();
    let Some(format) = arguments.next() else {
        return Err(ExpressionError::function("sprintf", "missing format string"));
    };
    let Value::String(format) = format else {
        return Err(ExpressionError::function("sprintf", "format must be a string"));
    };

    let mut output = String::with_capacity(format.len());
    let mut characters = format.chars().peekable();
    while let Some(character) = characters.next() {
        if character != '%' {
            output.push(character);
            continue;
        }

        let mut precision = None;
        if characters.peek() == Some(&'.') {
            characters.next();
            let mut digits = String::new();
            while let Some(&digit) = characters.peek().filter(|c| c.is_ascii_digit()) {
                digits.push(digit);
                characters.next();
            }
            precision = digits.parse::<usize>().ok();
        }

        let Some(verb) = characters.next() else {
            return Err(ExpressionError::function("sprintf", "format ends with a dangling '%'"));
        };
        if verb == '%' {
            output.push('%');
            continue;
        }
        let argument = arguments
            .next()
            .ok_or_else(|| ExpressionError::function("sprintf", format!("missing argument for %{verb}")))?;
        match verb {
            's' | 'v' => output.push_str(&to_display_string(&argument)),
            'd' => output.push_str(&to_int(&argument)?.to_string()),
            'f' => {
                let value = to_float(&argument)?;
                output.push_str(&format!("{value:.*}", precision.unwrap_or(6)));
            }
            other => return Err(ExpressionError::function("sprintf", format!("unsupported verb %{other}"))),
        }
    }
    Ok(output)
}
