//! Turns an expanded step into a fully substituted [`ConcreteCall`].

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::functions::FunctionRegistry;
use crate::graph::ExpandedStep;
use crate::model::{
    BodyType, Case, HostMode, HttpMethod, Project, RequestInfo, Suite,
};
use crate::scope::{self, resolve, Layer, LayerLevel, Scope};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CallBody {
    Empty,
    Json(Value),
    Form(IndexMap<String, String>),
    /// File fields hold paths; files are opened by the transport at send
    /// time.
    Multipart {
        fields: IndexMap<String, String>,
        files: IndexMap<String, PathBuf>,
    },
    Text(String),
}

/// A request ready to be dispatched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConcreteCall {
    pub name: String,
    pub method: HttpMethod,
    pub url: String,
    pub headers: IndexMap<String, String>,
    pub params: IndexMap<String, String>,
    pub body: CallBody,
    pub timeout: Duration,
}

impl ConcreteCall {
    pub fn to_request_info(&self) -> RequestInfo {
        let body = match &self.body {
            CallBody::Empty => None,
            CallBody::Json(value) => Some(value.to_string()),
            CallBody::Form(fields) => Some(
                url::form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(fields.iter())
                    .finish(),
            ),
            CallBody::Multipart { fields, files } => {
                let mut parts: Vec<String> =
                    fields.iter().map(|(k, v)| format!("{k}={v}")).collect();
                parts.extend(
                    files
                        .iter()
                        .map(|(k, p)| format!("{k}=@{}", p.display())),
                );
                Some(parts.join("; "))
            }
            CallBody::Text(text) => Some(text.clone()),
        };
        RequestInfo {
            method: self.method.to_string(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            params: self.params.clone(),
            body,
        }
    }
}

/// Records and run settings a step is built against.
pub struct BuildContext<'a> {
    pub suite: &'a Suite,
    pub environment: Option<&'a str>,
    /// The case being run (the root of the expansion).
    pub case: &'a Case,
    pub functions: &'a FunctionRegistry,
    pub default_timeout: Duration,
}

impl<'a> BuildContext<'a> {
    fn project(&self, id: u64) -> Result<&'a Project> {
        self.suite
            .project(id)
            .ok_or_else(|| {
                EngineError::build(format!("project {id} does not exist"))
            })
    }

    fn case(&self, id: u64) -> Result<&'a Case> {
        self.suite
            .case(id)
            .ok_or_else(|| {
                EngineError::build(format!("case {id} does not exist"))
            })
    }
}

/// Build the call for one step. `scope` already includes the step's own
/// variables.
pub fn build(
    expanded: &ExpandedStep,
    scope: &Scope,
    ctx: &BuildContext<'_>,
) -> Result<ConcreteCall> {
    let step = &expanded.step;
    let functions = ctx.functions;

    // The host flag also decides which project's defaults apply.
    let project = match step.host_mode {
        HostMode::Case => ctx.project(ctx.case.project_id)?,
        HostMode::Origin => ctx.project(expanded.origin_project)?,
    };
    let origin_case = if expanded.origin_case == ctx.case.id {
        None
    } else {
        Some(ctx.case(expanded.origin_case)?)
    };
    let environment = ctx
        .environment
        .and_then(|name| project.environments.get(name));

    let empty_headers = IndexMap::new();
    let empty_params = IndexMap::new();

    let mut header_layers = vec![
        Layer::new(
            LayerLevel::Environment,
            environment.map(|e| &e.headers).unwrap_or(&empty_headers),
        ),
        Layer::new(LayerLevel::Project, &project.headers),
        Layer::new(LayerLevel::Case, &ctx.case.headers),
    ];
    let mut param_layers = vec![
        Layer::new(
            LayerLevel::Environment,
            environment.map(|e| &e.params).unwrap_or(&empty_params),
        ),
        Layer::new(LayerLevel::Project, &project.params),
        Layer::new(LayerLevel::Case, &ctx.case.params),
    ];
    if let Some(origin) = origin_case {
        header_layers.push(Layer::new(LayerLevel::Case, &origin.headers));
        param_layers.push(Layer::new(LayerLevel::Case, &origin.params));
    }
    header_layers.push(Layer::new(LayerLevel::Step, &step.headers));
    param_layers.push(Layer::new(LayerLevel::Step, &step.params));

    let mut headers = IndexMap::new();
    for (name, raw) in resolve(&header_layers) {
        headers.insert(name, scope::substitute_text(&raw, scope, functions)?);
    }
    let mut params = IndexMap::new();
    for (name, raw) in resolve(&param_layers) {
        let value = scope::substitute(&raw, scope, functions)?;
        params.insert(name, scope::to_text(&value));
    }

    let host = environment
        .and_then(|e| e.host.as_deref())
        .unwrap_or(&project.host);
    let host = scope::substitute_text(host, scope, functions)?;
    let address = scope::substitute_text(&step.address, scope, functions)?;
    let url = join_url(&host, &address)?;

    let body = build_body(
        step.body_type,
        step.body.as_ref(),
        &step.files,
        scope,
        functions,
    )?;

    let timeout = step
        .timeout
        .map(Duration::from_secs)
        .unwrap_or(ctx.default_timeout);

    debug!(step = %step.name, method = %step.method, url = %url, "Built call");
    Ok(ConcreteCall {
        name: step.name.clone(),
        method: step.method,
        url,
        headers,
        params,
        body,
        timeout,
    })
}

fn build_body(
    body_type: BodyType,
    body: Option<&Value>,
    files: &IndexMap<String, String>,
    scope: &Scope,
    functions: &FunctionRegistry,
) -> Result<CallBody> {
    let substituted = body
        .map(|value| scope::substitute(value, scope, functions))
        .transpose()?;

    match body_type {
        BodyType::Json => Ok(match substituted {
            None | Some(Value::Null) => CallBody::Empty,
            Some(value) => CallBody::Json(value),
        }),
        BodyType::Text => Ok(match substituted {
            None | Some(Value::Null) => CallBody::Empty,
            Some(value) => CallBody::Text(scope::to_text(&value)),
        }),
        BodyType::Form => Ok(CallBody::Form(form_fields(substituted)?)),
        BodyType::Multipart => {
            let fields = form_fields(substituted)?;
            let mut paths = IndexMap::new();
            for (field, raw) in files {
                let path = scope::substitute_text(raw, scope, functions)?;
                paths.insert(field.clone(), PathBuf::from(path));
            }
            Ok(CallBody::Multipart {
                fields,
                files: paths,
            })
        }
    }
}

fn form_fields(body: Option<Value>) -> Result<IndexMap<String, String>> {
    match body {
        None | Some(Value::Null) => Ok(IndexMap::new()),
        Some(Value::Object(map)) => Ok(map
            .iter()
            .map(|(k, v)| (k.clone(), scope::to_text(v)))
            .collect()),
        Some(other) => Err(EngineError::build(format!(
            "form body must be an object, got {other}"
        ))),
    }
}

/// Absolute addresses are used as-is; relative ones are appended to the
/// host.
fn join_url(host: &str, address: &str) -> Result<String> {
    let joined = if address.contains("://") {
        address.to_string()
    } else if host.is_empty() {
        return Err(EngineError::build(format!(
            "relative address '{address}' but no host is configured"
        )));
    } else if address.is_empty() {
        host.to_string()
    } else {
        format!(
            "{}/{}",
            host.trim_end_matches('/'),
            address.trim_start_matches('/')
        )
    };
    url::Url::parse(&joined)
        .map_err(|e| {
            EngineError::build(format!("invalid url '{joined}': {e}"))
        })?;
    Ok(joined)
}
