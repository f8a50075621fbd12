//! Assertion evaluation: typed expected values and a closed comparator
//! table.
//!
//! Every rule of a step is evaluated even when an earlier one fails; the
//! failures are folded into a single message for the step.

use regex::Regex;
use serde_json::Value;
use std::str::FromStr;

use crate::error::{EngineError, Result};
use crate::extractor;
use crate::functions::FunctionRegistry;
use crate::model::{AssertRule, AssertionOutcome, DataSource};
use crate::response::ResponseSnapshot;
use crate::scope::{self, Scope};

/// Comparator outcome; the error is a readable failure message.
type Check<T> = std::result::Result<T, String>;

/// Declared type of an expected literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedType {
    Str,
    Json,
    Int,
    Float,
    Bool,
    List,
    Dict,
    /// The expected value names a scope variable.
    Variable,
    /// The expected value is a function-call expression.
    Func,
}

impl FromStr for ExpectedType {
    type Err = EngineError;

    fn from_str(name: &str) -> Result<Self> {
        Ok(match name.trim() {
            "str" | "string" => ExpectedType::Str,
            "json" => ExpectedType::Json,
            "int" | "integer" => ExpectedType::Int,
            "float" | "number" => ExpectedType::Float,
            "bool" | "boolean" => ExpectedType::Bool,
            "list" | "array" => ExpectedType::List,
            "dict" | "object" => ExpectedType::Dict,
            "variable" => ExpectedType::Variable,
            "func" | "function" => ExpectedType::Func,
            other => {
                return Err(EngineError::DeclaredType {
                    name: other.to_string(),
                })
            }
        })
    }
}

impl ExpectedType {
    fn name(self) -> &'static str {
        match self {
            ExpectedType::Str => "str",
            ExpectedType::Json => "json",
            ExpectedType::Int => "int",
            ExpectedType::Float => "float",
            ExpectedType::Bool => "bool",
            ExpectedType::List => "list",
            ExpectedType::Dict => "dict",
            ExpectedType::Variable => "variable",
            ExpectedType::Func => "func",
        }
    }
}

/// Convert the declared expected literal to a value of its declared type.
pub fn coerce_expected(
    raw: &Value,
    declared: ExpectedType,
    scope: &Scope,
    functions: &FunctionRegistry,
) -> Result<Value> {
    let fail = |message: String| EngineError::Coercion {
        value: raw.to_string(),
        expected_type: declared.name().to_string(),
        message,
    };
    let text = scope::to_text(raw);

    match declared {
        ExpectedType::Str => match raw {
            Value::String(_) => scope::substitute(raw, scope, functions),
            other => Ok(Value::String(scope::to_text(other))),
        },
        ExpectedType::Int => match raw {
            Value::Number(n) if n.is_i64() || n.is_u64() => Ok(raw.clone()),
            Value::Number(n) => n
                .as_f64()
                .filter(|f| f.fract() == 0.0)
                .map(|f| Value::from(f as i64))
                .ok_or_else(|| fail("not an integer".to_string())),
            _ => text
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|e| fail(e.to_string())),
        },
        ExpectedType::Float => {
            let float = match raw {
                Value::Number(n) => n.as_f64(),
                _ => text.trim().parse::<f64>().ok(),
            };
            float
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| fail("not a number".to_string()))
        }
        ExpectedType::Bool => match raw {
            Value::Bool(_) => Ok(raw.clone()),
            _ => match text.trim() {
                "true" | "True" | "1" => Ok(Value::Bool(true)),
                "false" | "False" | "0" => Ok(Value::Bool(false)),
                other => Err(fail(format!("'{other}' is not a boolean"))),
            },
        },
        ExpectedType::Json | ExpectedType::List | ExpectedType::Dict => {
            let parsed = match raw {
                Value::String(s) => serde_json::from_str::<Value>(s)
                    .map_err(|e| fail(e.to_string()))?,
                other => other.clone(),
            };
            match (declared, &parsed) {
                (ExpectedType::List, Value::Array(_))
                | (ExpectedType::Dict, Value::Object(_))
                | (ExpectedType::Json, _) => Ok(parsed),
                _ => Err(fail(format!(
                    "parsed value {parsed} has the wrong shape"
                ))),
            }
        }
        ExpectedType::Variable => {
            let reference = if text.starts_with('$') {
                text
            } else {
                format!("${text}")
            };
            scope::substitute_str(&reference, scope, functions)
        }
        ExpectedType::Func => scope::substitute_str(&text, scope, functions),
    }
}

/// The closed set of comparators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Equals,
    NotEquals,
    JsonEquals,
    StringEquals,
    Contains,
    NotContains,
    ContainedBy,
    NotContainedBy,
    StartsWith,
    EndsWith,
    IsTrue,
    IsFalse,
    IsNull,
    NotNull,
    GreaterThan,
    GreaterOrEquals,
    LessThan,
    LessOrEquals,
    LengthEquals,
    LengthGreaterThan,
    LengthGreaterOrEquals,
    LengthLessThan,
    LengthLessOrEquals,
    TypeMatch,
    RegexMatch,
    NotRegexMatch,
}

impl FromStr for Comparator {
    type Err = String;

    fn from_str(name: &str) -> std::result::Result<Self, String> {
        use Comparator::*;
        Ok(match name.trim() {
            "equals" | "equal" | "eq" | "==" => Equals,
            "not_equals" | "not_equal" | "ne" | "!=" => NotEquals,
            "json_equals" | "json_eq" => JsonEquals,
            "string_equals" | "str_eq" => StringEquals,
            "contains" => Contains,
            "not_contains" => NotContains,
            "contained_by" | "included" => ContainedBy,
            "not_contained_by" | "not_included" => NotContainedBy,
            "startswith" | "starts_with" => StartsWith,
            "endswith" | "ends_with" => EndsWith,
            "is_true" | "truthy" => IsTrue,
            "is_false" | "falsy" => IsFalse,
            "is_null" | "is_none" => IsNull,
            "not_null" | "not_none" => NotNull,
            "greater_than" | "gt" => GreaterThan,
            "greater_or_equals" | "ge" => GreaterOrEquals,
            "less_than" | "lt" => LessThan,
            "less_or_equals" | "le" => LessOrEquals,
            "length_equals" | "length_equal" | "len_eq" => LengthEquals,
            "length_greater_than" | "len_gt" => LengthGreaterThan,
            "length_greater_or_equals" | "len_ge" => LengthGreaterOrEquals,
            "length_less_than" | "len_lt" => LengthLessThan,
            "length_less_or_equals" | "len_le" => LengthLessOrEquals,
            "type_match" => TypeMatch,
            "regex_match" => RegexMatch,
            "not_regex_match" => NotRegexMatch,
            other => return Err(format!("unknown comparator '{other}'")),
        })
    }
}

impl Comparator {
    /// Pass/fail check. Failure messages name both values.
    pub fn check(self, actual: &Value, expected: &Value) -> Check<()> {
        use Comparator::*;
        let text = scope::to_text;
        let ok = match self {
            Equals => loose_equals(actual, expected),
            NotEquals => !loose_equals(actual, expected),
            JsonEquals => as_json(actual) == as_json(expected),
            StringEquals => text(actual) == text(expected),
            Contains => contains(actual, expected)?,
            NotContains => !contains(actual, expected)?,
            ContainedBy => contains(expected, actual)?,
            NotContainedBy => !contains(expected, actual)?,
            StartsWith => text(actual).starts_with(&text(expected)),
            EndsWith => text(actual).ends_with(&text(expected)),
            IsTrue => truthy(actual),
            IsFalse => !truthy(actual),
            IsNull => actual.is_null(),
            NotNull => !actual.is_null(),
            GreaterThan => number(actual)? > number(expected)?,
            GreaterOrEquals => number(actual)? >= number(expected)?,
            LessThan => number(actual)? < number(expected)?,
            LessOrEquals => number(actual)? <= number(expected)?,
            LengthEquals => length(actual)? as f64 == number(expected)?,
            LengthGreaterThan => length(actual)? as f64 > number(expected)?,
            LengthGreaterOrEquals => {
                length(actual)? as f64 >= number(expected)?
            }
            LengthLessThan => (length(actual)? as f64) < number(expected)?,
            LengthLessOrEquals => length(actual)? as f64 <= number(expected)?,
            TypeMatch => {
                type_name(actual) == normalize_type_name(&text(expected))
            }
            RegexMatch => regex_matches(actual, expected)?,
            NotRegexMatch => !regex_matches(actual, expected)?,
        };

        if ok {
            return Ok(());
        }
        Err(match self {
            LengthEquals
            | LengthGreaterThan
            | LengthGreaterOrEquals
            | LengthLessThan
            | LengthLessOrEquals => format!(
                "{self:?} failed: actual {actual} (length {}), \
                 expected {expected}",
                length(actual).unwrap_or_default()
            ),
            TypeMatch => format!(
                "{self:?} failed: actual {actual} is {}, expected {expected}",
                type_name(actual)
            ),
            _ => format!(
                "{self:?} failed: actual {actual}, expected {expected}"
            ),
        })
    }
}

/// Numbers compare by value (`1 == 1.0`); everything else structurally.
fn loose_equals(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => actual == expected,
    }
}

/// JSON strings are parsed so `'{"a":1}'` equals `{"a": 1}`.
fn as_json(value: &Value) -> Value {
    match value {
        Value::String(s) => {
            serde_json::from_str(s).unwrap_or_else(|_| value.clone())
        }
        other => other.clone(),
    }
}

fn contains(container: &Value, item: &Value) -> Check<bool> {
    match container {
        Value::String(s) => Ok(s.contains(&scope::to_text(item))),
        Value::Array(items) => Ok(items.iter().any(|v| loose_equals(v, item))),
        Value::Object(map) => Ok(map.contains_key(&scope::to_text(item))),
        other => Err(format!("{other} cannot contain values")),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn number(value: &Value) -> Check<f64> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| format!("{n} is not comparable")),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("'{s}' is not a number")),
        other => Err(format!("{other} is not a number")),
    }
}

fn length(value: &Value) -> Check<usize> {
    match value {
        Value::String(s) => Ok(s.chars().count()),
        Value::Array(items) => Ok(items.len()),
        Value::Object(map) => Ok(map.len()),
        other => Err(format!("{other} has no length")),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

fn normalize_type_name(name: &str) -> &str {
    match name.trim() {
        "None" | "NoneType" | "null" => "null",
        "bool" | "boolean" => "bool",
        "float" | "double" => "float",
        "int" | "integer" => "int",
        "str" | "string" => "str",
        "list" | "array" => "list",
        "dict" | "object" | "map" => "dict",
        other => other,
    }
}

fn regex_matches(actual: &Value, pattern: &Value) -> Check<bool> {
    let pattern = scope::to_text(pattern);
    let re = Regex::new(&pattern)
        .map_err(|e| format!("invalid pattern '{pattern}': {e}"))?;
    Ok(re.is_match(&scope::to_text(actual)))
}

/// Evaluate every rule against one response.
pub fn evaluate(
    rules: &[AssertRule],
    response: &ResponseSnapshot,
    scope: &Scope,
    functions: &FunctionRegistry,
) -> Vec<AssertionOutcome> {
    rules
        .iter()
        .map(|rule| evaluate_rule(rule, response, scope, functions))
        .collect()
}

fn evaluate_rule(
    rule: &AssertRule,
    response: &ResponseSnapshot,
    scope: &Scope,
    functions: &FunctionRegistry,
) -> AssertionOutcome {
    let mut outcome = AssertionOutcome {
        comparator: rule.comparator.clone(),
        actual_locator: rule.actual.clone(),
        actual: Value::Null,
        expected: rule.expected.clone(),
        passed: false,
        message: None,
    };

    let comparator = match rule.comparator.parse::<Comparator>() {
        Ok(comparator) => comparator,
        Err(message) => {
            outcome.message = Some(message);
            return outcome;
        }
    };
    let expected = rule
        .expected_type
        .parse::<ExpectedType>()
        .and_then(|declared| {
            coerce_expected(&rule.expected, declared, scope, functions)
        });
    let expected = match expected {
        Ok(value) => value,
        Err(err) => {
            outcome.message = Some(err.to_string());
            return outcome;
        }
    };
    outcome.expected = expected;

    match extractor::read_source(
        rule.source,
        &rule.actual,
        DataSource::Body,
        response,
        scope,
        functions,
    ) {
        Ok(actual) => outcome.actual = actual,
        Err(err) => {
            outcome.message =
                Some(format!("cannot read '{}': {err}", rule.actual));
            return outcome;
        }
    }

    match comparator.check(&outcome.actual, &outcome.expected) {
        Ok(()) => outcome.passed = true,
        Err(message) => {
            outcome.message = Some(format!("{}: {message}", rule.actual))
        }
    }
    outcome
}

/// One message covering every failed outcome, or `None` when all passed.
pub fn failure_message(outcomes: &[AssertionOutcome]) -> Option<String> {
    let failures: Vec<&str> = outcomes
        .iter()
        .filter(|o| !o.passed)
        .filter_map(|o| o.message.as_deref())
        .collect();
    if failures.is_empty() {
        None
    } else {
        Some(failures.join("; "))
    }
}
