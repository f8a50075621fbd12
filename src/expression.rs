//! CEL evaluation for `skip_if` predicates on cases and steps.
//!
//! Predicates see the current scope as CEL variables, e.g.
//! `env == "prod" && size(items) > 0`.

use cel::{Context, Program};
use indexmap::IndexMap;
use serde_json::Value;
use std::sync::LazyLock;
use tracing::debug;

use crate::error::{EngineError, Result};

/// Evaluate `expr` against `vars` and coerce the result to a boolean.
///
/// Non-boolean results are truthy when non-zero / non-empty.
pub fn evaluate_predicate(
    expr: &str,
    vars: &IndexMap<String, Value>,
) -> Result<bool> {
    let fail = |message: String| EngineError::Predicate {
        expr: expr.to_string(),
        message,
    };

    let program = compile(expr).map_err(fail)?;
    let context = build_context(vars).map_err(fail)?;
    let result = program
        .execute(&context)
        .map_err(|e| fail(format!("CEL execution error: {e}")))?;

    Ok(cel_value_is_truthy(&result))
}

/// `len(x)` is accepted as an alias of CEL's `size(x)`.
fn preprocess_expr(expr: &str) -> String {
    use regex::Regex;

    static LEN_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\blen\(").expect("failed to compile len regex")
    });

    LEN_RE.replace_all(expr, "size(").into_owned()
}

fn compile(expr: &str) -> std::result::Result<Program, String> {
    let processed = preprocess_expr(expr);
    debug!("Compiling CEL predicate: {processed}");
    Program::compile(&processed)
        .map_err(|e| format!("CEL compile error for '{processed}': {e}"))
}

fn build_context<'a>(
    vars: &IndexMap<String, Value>,
) -> std::result::Result<Context<'a>, String> {
    let mut context = Context::default();

    for (key, value) in vars {
        context
            .add_variable(key.as_str(), value.clone())
            .map_err(|e| {
                format!("Failed to add variable '{key}' to CEL context: {e}")
            })?;
    }

    context.add_function("is_empty", |v: cel::Value| -> bool {
        !cel_value_is_truthy(&v)
    });

    Ok(context)
}

fn cel_value_is_truthy(value: &cel::Value) -> bool {
    match value {
        cel::Value::Bool(b) => *b,
        cel::Value::Int(i) => *i != 0,
        cel::Value::UInt(u) => *u != 0,
        cel::Value::Float(f) => *f != 0.0,
        cel::Value::String(s) => !s.is_empty(),
        cel::Value::Null => false,
        cel::Value::List(list) => !list.is_empty(),
        cel::Value::Map(map) => !map.map.is_empty(),
        _ => true,
    }
}
