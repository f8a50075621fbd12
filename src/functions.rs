//! Run-scoped registry of callables used by `${name(args)}` expressions.
//!
//! Script resources are Rhai sources; every top-level `fn` becomes a
//! registered function. A registry is always built fresh for a run and is
//! read-only afterwards, so concurrent runs against different environments
//! never see each other's function bodies.

use indexmap::IndexMap;
use rhai::{Dynamic, Engine, AST};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::model::ScriptFile;

/// Keyword arguments of a call, in call-site order.
pub type Kwargs = IndexMap<String, Value>;

/// What a native closure returns; the error is a plain message.
pub type NativeResult = std::result::Result<Value, String>;

/// An opaque callable reachable from expressions.
pub trait ScriptFunction: Send + Sync {
    fn call(&self, args: &[Value], kwargs: &Kwargs) -> Result<Value>;
}

/// Adapter for native Rust closures.
pub struct NativeFunction<F> {
    name: String,
    func: F,
}

impl<F> NativeFunction<F>
where
    F: Fn(&[Value], &Kwargs) -> NativeResult
        + Send
        + Sync,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> ScriptFunction for NativeFunction<F>
where
    F: Fn(&[Value], &Kwargs) -> NativeResult
        + Send
        + Sync,
{
    fn call(&self, args: &[Value], kwargs: &Kwargs) -> Result<Value> {
        (self.func)(args, kwargs).map_err(|message| EngineError::FunctionCall {
            name: self.name.clone(),
            message,
        })
    }
}

/// A function defined in a compiled script.
struct RhaiFunction {
    namespace: String,
    name: String,
    params: Vec<String>,
    engine: Arc<Engine>,
    ast: Arc<AST>,
}

impl RhaiFunction {
    fn fail(&self, message: impl fmt::Display) -> EngineError {
        EngineError::FunctionCall {
            name: format!("{}::{}", self.namespace, self.name),
            message: message.to_string(),
        }
    }

    /// Lay positional and keyword args out in declared parameter order.
    fn bind_args(
        &self,
        args: &[Value],
        kwargs: &Kwargs,
    ) -> Result<Vec<Dynamic>> {
        if args.len() > self.params.len() {
            return Err(self.fail(format!(
                "takes {} arguments but {} were given",
                self.params.len(),
                args.len()
            )));
        }
        let unknown = kwargs.keys().find(|k| !self.params.contains(*k));
        if let Some(unknown) = unknown {
            return Err(
                self.fail(format!("unexpected keyword argument '{unknown}'"))
            );
        }

        let mut bound = Vec::with_capacity(self.params.len());
        for (idx, param) in self.params.iter().enumerate() {
            let value = match (args.get(idx), kwargs.get(param)) {
                (Some(_), Some(_)) => {
                    return Err(self.fail(format!(
                        "multiple values for argument '{param}'"
                    )))
                }
                (Some(value), None) | (None, Some(value)) => value,
                (None, None) => {
                    return Err(
                        self.fail(format!("missing argument '{param}'"))
                    )
                }
            };
            let value =
                rhai::serde::to_dynamic(value).map_err(|e| self.fail(e))?;
            bound.push(value);
        }
        Ok(bound)
    }
}

impl ScriptFunction for RhaiFunction {
    fn call(&self, args: &[Value], kwargs: &Kwargs) -> Result<Value> {
        let bound = self.bind_args(args, kwargs)?;
        let mut scope = rhai::Scope::new();
        let result: Dynamic = self
            .engine
            .call_fn(&mut scope, &self.ast, &self.name, bound)
            .map_err(|e| self.fail(e))?;
        rhai::serde::from_dynamic::<Value>(&result).map_err(|e| self.fail(e))
    }
}

/// Name -> callable mapping for one run.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<dyn ScriptFunction>>,
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("FunctionRegistry")
            .field("functions", &names)
            .finish()
    }
}

impl FunctionRegistry {
    /// An empty registry without builtins.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding only the native builtins.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtins::register(&mut registry);
        registry
    }

    /// Build a fresh registry: builtins first, then every function of every
    /// referenced script, compiled for `environment`. Later references win
    /// on name clashes.
    pub fn load<'a, I>(
        refs: I,
        library: &[ScriptFile],
        environment: Option<&str>,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut registry = Self::with_builtins();
        let engine = Arc::new(script_engine());

        for name in refs {
            let script = library
                .iter()
                .find(|s| &s.name == name)
                .ok_or_else(|| EngineError::UnknownScript {
                    name: name.clone(),
                })?;
            let namespace = match environment {
                Some(env) => format!("{env}::{}", script.name),
                None => script.name.clone(),
            };
            let ast = engine
                .compile(script.source_for(environment))
                .map_err(|e| EngineError::Script {
                    namespace: namespace.clone(),
                    message: e.to_string(),
                })?;
            let ast = Arc::new(ast);

            let mut exposed = 0;
            for meta in ast.iter_functions() {
                let function = RhaiFunction {
                    namespace: namespace.clone(),
                    name: meta.name.to_string(),
                    params: meta.params.iter().map(|p| p.to_string()).collect(),
                    engine: Arc::clone(&engine),
                    ast: Arc::clone(&ast),
                };
                registry
                    .functions
                    .insert(function.name.clone(), Arc::new(function));
                exposed += 1;
            }
            debug!(namespace = %namespace, exposed, "Loaded script functions");
        }

        Ok(registry)
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        function: Arc<dyn ScriptFunction>,
    ) {
        self.functions.insert(name.into(), function);
    }

    /// Register a native closure under `name`.
    pub fn register_fn<F>(&mut self, name: &str, func: F)
    where
        F: Fn(&[Value], &Kwargs) -> NativeResult
            + Send
            + Sync
            + 'static,
    {
        self.register(name, Arc::new(NativeFunction::new(name, func)));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn call(
        &self,
        name: &str,
        args: &[Value],
        kwargs: &Kwargs,
    ) -> Result<Value> {
        let function = self
            .functions
            .get(name)
            .ok_or_else(|| EngineError::UnknownFunction {
                name: name.to_string(),
            })?;
        debug!(function = name, ?args, "Calling function");
        function.call(args, kwargs)
    }
}

fn script_engine() -> Engine {
    let mut engine = Engine::new();
    engine.set_max_call_levels(64);
    engine.set_max_operations(1_000_000);
    engine
}

mod builtins {
    use super::FunctionRegistry;
    use chrono::Utc;
    use serde_json::Value;

    fn as_text(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    fn single<'a>(name: &str, args: &'a [Value]) -> Result<&'a Value, String> {
        match args {
            [value] => Ok(value),
            _ => Err(format!(
                "{name} takes exactly one argument, got {}",
                args.len()
            )),
        }
    }

    pub(super) fn register(registry: &mut FunctionRegistry) {
        registry.register_fn("timestamp", |_, _| {
            Ok(Value::from(Utc::now().timestamp()))
        });
        registry.register_fn("timestamp_ms", |_, _| {
            Ok(Value::from(Utc::now().timestamp_millis()))
        });
        registry.register_fn("concat", |args, _| {
            Ok(Value::String(args.iter().map(as_text).collect()))
        });
        registry.register_fn("upper", |args, _| {
            Ok(Value::String(as_text(single("upper", args)?).to_uppercase()))
        });
        registry.register_fn("lower", |args, _| {
            Ok(Value::String(as_text(single("lower", args)?).to_lowercase()))
        });
        registry.register_fn("len", |args, _| {
            let len = match single("len", args)? {
                Value::String(s) => s.chars().count(),
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                other => return Err(format!("len() of {other} is undefined")),
            };
            Ok(Value::from(len))
        });
        registry.register_fn("to_json", |args, _| {
            serde_json::to_string(single("to_json", args)?)
                .map(Value::String)
                .map_err(|e| e.to_string())
        });
        registry.register_fn("urlencode", |args, _| {
            let text = as_text(single("urlencode", args)?);
            Ok(Value::String(
                url::form_urlencoded::byte_serialize(text.as_bytes()).collect(),
            ))
        });
    }
}
