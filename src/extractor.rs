//! Extraction rules: pull values out of a response into the case scope.

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::functions::FunctionRegistry;
use crate::model::{DataSource, ExtractRule};
use crate::parser;
use crate::response::ResponseSnapshot;
use crate::scope::{self, Scope};

/// Apply one rule and return the variable it binds.
pub fn extract(
    rule: &ExtractRule,
    response: &ResponseSnapshot,
    scope: &Scope,
    functions: &FunctionRegistry,
) -> Result<(String, Value)> {
    let section = rule.section.unwrap_or(DataSource::Body);
    let value = read_source(
        rule.source,
        &rule.locator,
        section,
        response,
        scope,
        functions,
    )
    .map_err(|err| match err {
        EngineError::Extraction { message, .. } => EngineError::Extraction {
            name: rule.name.clone(),
            message,
        },
        other => other,
    })?;
    debug!(name = %rule.name, ?value, "Extracted variable");
    Ok((rule.name.clone(), value))
}

/// Resolve `locator` against `source`. Shared with assertions, which read
/// their actual values the same way.
pub fn read_source(
    source: DataSource,
    locator: &str,
    section: DataSource,
    response: &ResponseSnapshot,
    scope: &Scope,
    functions: &FunctionRegistry,
) -> Result<Value> {
    match source {
        DataSource::Body
        | DataSource::Header
        | DataSource::Cookie
        | DataSource::Status => {
            let locator = scope::substitute_text(locator, scope, functions)?;
            response.lookup(source, &locator).map_err(failure)
        }
        DataSource::Regexp => {
            let pattern = scope::substitute_text(locator, scope, functions)?;
            first_capture(&pattern, &response.body)
        }
        DataSource::Constant => {
            scope::substitute_str(locator, scope, functions)
        }
        DataSource::Function => {
            call_with_response(locator, section, response, scope, functions)
        }
    }
}

fn failure(message: String) -> EngineError {
    EngineError::Extraction {
        name: String::new(),
        message,
    }
}

/// First capture group of `pattern` in `text`; the whole match when the
/// pattern has no groups.
fn first_capture(pattern: &str, text: &str) -> Result<Value> {
    let re = Regex::new(pattern)
        .map_err(|e| failure(format!("invalid pattern '{pattern}': {e}")))?;
    let caps = re.captures(text).ok_or_else(|| {
        failure(format!(
            "pattern '{pattern}' did not match the response body"
        ))
    })?;
    let matched = caps
        .get(1)
        .or_else(|| caps.get(0))
        .map(|m| m.as_str())
        .unwrap_or_default();
    Ok(Value::String(matched.to_string()))
}

/// Call a function whose plain arguments name response fields: each
/// argument that is not a `$variable` becomes `<section>.<arg>` and is
/// read from the response before the call.
fn call_with_response(
    locator: &str,
    section: DataSource,
    response: &ResponseSnapshot,
    scope: &Scope,
    functions: &FunctionRegistry,
) -> Result<Value> {
    let call = parser::parse_call(locator)?;
    let prefix = section.field_prefix();

    let resolve_arg = |arg: &Value| -> Result<Value> {
        match arg {
            Value::String(text) if text.starts_with('$') => {
                scope::substitute(arg, scope, functions)
            }
            other => {
                let field = format!("{prefix}.{}", scope::to_text(other));
                response.resolve_field(&field).map_err(failure)
            }
        }
    };

    let args = call.args.iter().map(&resolve_arg).collect::<Result<Vec<_>>>()?;
    let mut kwargs = indexmap::IndexMap::with_capacity(call.kwargs.len());
    for (key, arg) in &call.kwargs {
        kwargs.insert(key.clone(), resolve_arg(arg)?);
    }
    functions.call(&call.name, &args, &kwargs)
}
