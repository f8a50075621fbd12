//! Layered variable scopes and `$var` / `${fn()}` substitution.
//!
//! Precedence is environment < project < case < step. Layers carry their
//! level, so the merge result does not depend on the order callers pass
//! them in.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::trace;

use crate::error::{EngineError, Result};
use crate::functions::FunctionRegistry;
use crate::parser::{self, Segment};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerLevel {
    Environment,
    Project,
    Case,
    Step,
}

/// One dictionary in a layered merge.
#[derive(Debug, Clone, Copy)]
pub struct Layer<'a, V> {
    pub level: LayerLevel,
    pub values: &'a IndexMap<String, V>,
}

impl<'a, V> Layer<'a, V> {
    pub fn new(level: LayerLevel, values: &'a IndexMap<String, V>) -> Self {
        Self { level, values }
    }
}

/// Merge layers with the narrowest level winning on key collisions. An
/// empty narrow layer leaves broader values untouched. Layers of the same
/// level apply in the order given.
pub fn resolve<V: Clone>(layers: &[Layer<'_, V>]) -> IndexMap<String, V> {
    let mut ordered: Vec<&Layer<'_, V>> = layers.iter().collect();
    ordered.sort_by_key(|layer| layer.level);

    let mut merged = IndexMap::new();
    for layer in ordered {
        for (key, value) in layer.values {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// Variables visible to one case while it runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scope {
    vars: IndexMap<String, Value>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(vars: IndexMap<String, Value>) -> Self {
        Self { vars }
    }

    /// Merge `layers` by precedence, substituting each value against the
    /// variables merged so far. A case variable may therefore reference a
    /// project variable, including one it overrides.
    pub fn evaluate_layers(
        layers: &[Layer<'_, Value>],
        functions: &FunctionRegistry,
    ) -> Result<Self> {
        let mut ordered: Vec<&Layer<'_, Value>> = layers.iter().collect();
        ordered.sort_by_key(|layer| layer.level);

        let mut scope = Scope::new();
        for layer in ordered {
            scope = scope.with_layer(layer.values, functions)?;
        }
        Ok(scope)
    }

    /// A copy of this scope with `values` evaluated and layered on top.
    pub fn with_layer(
        &self,
        values: &IndexMap<String, Value>,
        functions: &FunctionRegistry,
    ) -> Result<Self> {
        let mut next = self.clone();
        for (key, raw) in values {
            let value = substitute(raw, &next, functions)?;
            next.vars.insert(key.clone(), value);
        }
        Ok(next)
    }

    /// Like [`Scope::with_layer`], but only names this scope does not
    /// hold yet are added.
    pub fn with_defaults(
        &self,
        values: &IndexMap<String, Value>,
        functions: &FunctionRegistry,
    ) -> Result<Self> {
        let missing: IndexMap<String, Value> = values
            .iter()
            .filter(|(name, _)| !self.contains(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        self.with_layer(&missing, functions)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
    }

    pub fn vars(&self) -> &IndexMap<String, Value> {
        &self.vars
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    fn lookup(&self, name: &str) -> Result<&Value> {
        self.vars.get(name).ok_or_else(|| EngineError::UnresolvedVariable {
            name: name.to_string(),
        })
    }
}

/// Recursively substitute every string inside `value`.
///
/// A string that is exactly one `$var` or one `${call()}` keeps the native
/// type of the result; any other string gets results spliced in as text.
/// Substitution is single-pass: text produced by a variable or a call is
/// not scanned again.
pub fn substitute(
    value: &Value,
    scope: &Scope,
    functions: &FunctionRegistry,
) -> Result<Value> {
    match value {
        Value::String(text) => substitute_str(text, scope, functions),
        Value::Array(items) => items
            .iter()
            .map(|item| substitute(item, scope, functions))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, item) in map {
                let key = to_text(&substitute_str(key, scope, functions)?);
                out.insert(key, substitute(item, scope, functions)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Substitute a single string.
pub fn substitute_str(
    text: &str,
    scope: &Scope,
    functions: &FunctionRegistry,
) -> Result<Value> {
    let segments = parser::segments(text)?;
    match segments.as_slice() {
        [] => Ok(Value::String(String::new())),
        [Segment::Variable(name)] => scope.lookup(name).cloned(),
        [Segment::Call(raw)] => call_expression(raw, scope, functions),
        _ => {
            let mut out = String::with_capacity(text.len());
            for segment in &segments {
                match segment {
                    Segment::Text(literal) => out.push_str(literal),
                    Segment::Variable(name) => {
                        out.push_str(&to_text(scope.lookup(name)?))
                    }
                    Segment::Call(raw) => {
                        let value = call_expression(raw, scope, functions)?;
                        out.push_str(&to_text(&value))
                    }
                }
            }
            Ok(Value::String(out))
        }
    }
}

/// Substitute and render as text, for headers, URLs and query values.
pub fn substitute_text(
    text: &str,
    scope: &Scope,
    functions: &FunctionRegistry,
) -> Result<String> {
    substitute_str(text, scope, functions).map(|value| to_text(&value))
}

/// Evaluate one raw `${name(args)}` call. Arguments are substituted from
/// the same scope before the function runs.
pub fn call_expression(
    raw: &str,
    scope: &Scope,
    functions: &FunctionRegistry,
) -> Result<Value> {
    let call = parser::parse_call(raw)?;
    let args = call
        .args
        .iter()
        .map(|arg| substitute(arg, scope, functions))
        .collect::<Result<Vec<_>>>()?;
    let mut kwargs = IndexMap::with_capacity(call.kwargs.len());
    for (key, arg) in &call.kwargs {
        kwargs.insert(key.clone(), substitute(arg, scope, functions)?);
    }
    let result = functions.call(&call.name, &args, &kwargs)?;
    trace!(call = raw, ?result, "Evaluated function call");
    Ok(result)
}

/// Strings render bare; everything else renders as JSON.
pub fn to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
