//! Case execution: the transport seam, the per-case state machine and the
//! sequential/concurrent schedulers.

use async_trait::async_trait;
use chrono::Utc;
use indexmap::{IndexMap, IndexSet};
use reqwest::header::HeaderMap;
use reqwest::{multipart, Client, Method as ReqMethod};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::assertion;
use crate::builder::{self, BuildContext, CallBody, ConcreteCall};
use crate::config::EngineConfig;
use crate::error::{EngineError, TransportError};
use crate::expression;
use crate::extractor;
use crate::functions::FunctionRegistry;
use crate::graph::{CaseGraph, ExpandedCase, ExpandedStep};
use crate::model::*;
use crate::report::{self, RunObserver};
use crate::response::ResponseSnapshot;
use crate::scope::{Layer, LayerLevel, Scope};

/// Outcome of one transport round trip.
pub type SendResult = Result<ResponseSnapshot, TransportError>;

/// Sends a built call and captures the response.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, call: &ConcreteCall) -> SendResult;
}

/// HTTP transport backed by reqwest.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    /// Use a preconfigured client (proxies, TLS roots, ...).
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn convert_method(method: HttpMethod) -> ReqMethod {
        match method {
            HttpMethod::Get => ReqMethod::GET,
            HttpMethod::Post => ReqMethod::POST,
            HttpMethod::Put => ReqMethod::PUT,
            HttpMethod::Delete => ReqMethod::DELETE,
            HttpMethod::Patch => ReqMethod::PATCH,
            HttpMethod::Head => ReqMethod::HEAD,
            HttpMethod::Options => ReqMethod::OPTIONS,
        }
    }

    async fn multipart_form(
        fields: &IndexMap<String, String>,
        files: &IndexMap<String, std::path::PathBuf>,
    ) -> Result<multipart::Form, TransportError> {
        let mut form = multipart::Form::new();
        for (name, value) in fields {
            form = form.text(name.clone(), value.clone());
        }
        for (field, path) in files {
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|e| TransportError::File {
                    field: field.clone(),
                    path: path.display().to_string(),
                    message: e.to_string(),
                })?;
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| field.clone());
            form = form.part(
                field.clone(),
                multipart::Part::bytes(bytes).file_name(file_name),
            );
        }
        Ok(form)
    }
}

fn classify(err: reqwest::Error, timeout: Duration) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout {
            timeout_secs: timeout.as_secs(),
            message: err.to_string(),
        }
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(
        skip(self, call),
        fields(url = %call.url, method = %call.method)
    )]
    async fn send(&self, call: &ConcreteCall) -> SendResult {
        let mut req_builder = self
            .client
            .request(Self::convert_method(call.method), &call.url)
            .timeout(call.timeout);

        for (name, value) in &call.headers {
            req_builder = req_builder.header(name, value);
        }
        if !call.params.is_empty() {
            req_builder = req_builder.query(&call.params);
        }

        req_builder = match &call.body {
            CallBody::Empty => req_builder,
            CallBody::Json(value) => req_builder.json(value),
            CallBody::Form(fields) => req_builder.form(fields),
            CallBody::Multipart { fields, files } => {
                let form = Self::multipart_form(fields, files).await?;
                req_builder.multipart(form)
            }
            CallBody::Text(text) => req_builder.body(text.clone()),
        };

        debug!("Sending request to {}", call.url);
        let started = Instant::now();
        let response = req_builder
            .send()
            .await
            .map_err(|e| classify(e, call.timeout))?;
        debug!("Received response with status: {}", response.status());

        let status = response.status().as_u16();
        let headers = header_text(response.headers());
        let cookies: IndexMap<String, String> = response
            .cookies()
            .map(|c| (c.name().to_string(), c.value().to_string()))
            .collect();
        let body = response
            .text()
            .await
            .map_err(|e| classify(e, call.timeout))?;

        Ok(ResponseSnapshot::new(
            status,
            headers,
            cookies,
            body,
            started.elapsed().as_millis() as u64,
        ))
    }
}

/// Header values as text; bytes that are not UTF-8 are replaced rather
/// than dropping the value.
fn header_text(headers: &HeaderMap) -> IndexMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

/// Executes run requests.
#[async_trait]
pub trait TestRunner: Send + Sync {
    /// Run every requested case and return the merged summary. Case level
    /// failures are reported in the summary, never raised.
    async fn run(&self, request: &RunRequest) -> RunSummary;
}

/// Runner over an in-memory [`Suite`].
pub struct DefaultRunner {
    suite: Arc<Suite>,
    transport: Arc<dyn Transport>,
    config: EngineConfig,
    observers: Vec<Arc<dyn RunObserver>>,
}

impl DefaultRunner {
    pub fn new(suite: Suite, config: EngineConfig) -> Self {
        Self::with_transport(suite, config, Arc::new(HttpTransport::new()))
    }

    pub fn with_transport(
        suite: Suite,
        config: EngineConfig,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            suite: Arc::new(suite),
            transport,
            config,
            observers: Vec::new(),
        }
    }

    /// Register a completion observer; each is notified once per run.
    pub fn add_observer(
        &mut self,
        observer: Arc<dyn RunObserver>,
    ) -> &mut Self {
        self.observers.push(observer);
        self
    }

    pub fn suite(&self) -> &Suite {
        &self.suite
    }

    /// Script references of every case reachable from the request.
    fn script_refs(&self, case_ids: &[CaseId]) -> IndexSet<String> {
        let mut refs = IndexSet::new();
        let mut seen = HashSet::new();
        let mut pending: Vec<CaseId> = case_ids.to_vec();

        while let Some(id) = pending.pop() {
            if !seen.insert(id) {
                continue;
            }
            let Some(case) = self.suite.case(id) else {
                continue;
            };
            if let Some(project) = self.suite.project(case.project_id) {
                refs.extend(project.scripts.iter().cloned());
            }
            refs.extend(case.scripts.iter().cloned());
            pending.extend(case.steps.iter().filter_map(|s| s.quote_case));
        }
        refs
    }

    async fn notify(&self, summary: &RunSummary) {
        for observer in &self.observers {
            let run_id = &summary.run_id;
            if let Err(err) = observer.on_complete(run_id, summary).await {
                warn!(%run_id, "Run observer failed: {err:#}");
            }
        }
    }
}

#[async_trait]
impl TestRunner for DefaultRunner {
    #[instrument(skip(self, request), fields(run_id = %request.run_id))]
    async fn run(&self, request: &RunRequest) -> RunSummary {
        let mode = request.mode.unwrap_or(self.config.mode);
        info!(
            ?mode,
            "Starting run {} with {} case(s)",
            request.run_id,
            request.case_ids.len()
        );

        let refs = self.script_refs(&request.case_ids);
        let environment = request.environment.as_deref();
        let loaded =
            FunctionRegistry::load(&refs, &self.suite.scripts, environment);
        let case_ids = &request.case_ids;
        let summaries = match loaded {
            Ok(functions) => {
                let timeout = self.config.default_timeout_secs;
                let worker = CaseWorker {
                    suite: Arc::clone(&self.suite),
                    transport: Arc::clone(&self.transport),
                    functions: Arc::new(functions),
                    environment: request.environment.clone(),
                    default_timeout: Duration::from_secs(timeout),
                };
                match mode {
                    ExecutionMode::Sequential => {
                        let mut summaries = Vec::with_capacity(case_ids.len());
                        for &case_id in case_ids {
                            summaries.push(worker.run_case(case_id).await);
                        }
                        summaries
                    }
                    ExecutionMode::Concurrent => {
                        run_concurrently(&worker, case_ids).await
                    }
                }
            }
            Err(err) => {
                error!("Failed to load script functions: {}", err);
                case_ids
                    .iter()
                    .map(|&id| {
                        let name = case_name(&self.suite, id);
                        failed_summary(id, name, err.to_string())
                    })
                    .collect()
            }
        };

        let summary = report::merge(&request.run_id, summaries, mode);
        info!(
            "Run {} finished: {}/{} case(s) passed ({} ms) - Success: {}",
            summary.run_id,
            summary.counts.pass,
            summary.counts.total,
            summary.duration_ms,
            summary.success
        );
        self.notify(&summary).await;
        summary
    }
}

/// One task per case; handles are awaited in submission order so the
/// summaries come back in that order.
async fn run_concurrently(
    worker: &CaseWorker,
    case_ids: &[CaseId],
) -> Vec<CaseSummary> {
    let handles: Vec<_> = case_ids
        .iter()
        .map(|&case_id| {
            let worker = worker.clone();
            (
                case_id,
                tokio::spawn(async move { worker.run_case(case_id).await }),
            )
        })
        .collect();

    let mut summaries = Vec::with_capacity(handles.len());
    for (case_id, handle) in handles {
        match handle.await {
            Ok(summary) => summaries.push(summary),
            Err(err) => {
                error!(case_id, "Case worker did not complete: {}", err);
                summaries.push(failed_summary(
                    case_id,
                    case_name(&worker.suite, case_id),
                    format!("case worker did not complete: {err}"),
                ));
            }
        }
    }
    summaries
}

fn case_name(suite: &Suite, case_id: CaseId) -> String {
    suite
        .case(case_id)
        .map(|c| c.name.clone())
        .unwrap_or_default()
}

fn failed_summary(case_id: CaseId, name: String, error: String) -> CaseSummary {
    CaseSummary {
        case_id,
        name,
        status: CaseStatus::Failed,
        success: false,
        error: Some(error),
        counts: Counts::default(),
        start_time: Utc::now(),
        duration_ms: 0,
        steps: Vec::new(),
    }
}

fn failed_step(
    name: &str,
    case_id: CaseId,
    error: String,
    started: Instant,
) -> StepResult {
    StepResult {
        name: name.to_string(),
        case_id,
        success: false,
        error: Some(error),
        request: None,
        response: None,
        extractions: Vec::new(),
        assertions: Vec::new(),
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

enum StepFlow {
    Continue,
    Abort(String),
}

/// Everything one case needs; cheap to clone into a spawned task.
#[derive(Clone)]
struct CaseWorker {
    suite: Arc<Suite>,
    transport: Arc<dyn Transport>,
    functions: Arc<FunctionRegistry>,
    environment: Option<String>,
    default_timeout: Duration,
}

impl CaseWorker {
    fn transition(summary: &mut CaseSummary, status: CaseStatus) {
        info!(
            case_id = summary.case_id,
            from = ?summary.status,
            to = ?status,
            "Case '{}' state changed",
            summary.name
        );
        summary.status = status;
    }

    /// Environment < project < case variables, evaluated in that order.
    fn case_scope(&self, case: &Case) -> Result<Scope, EngineError> {
        let empty = IndexMap::new();
        let project = self.suite.project(case.project_id);
        let environment = match (project, self.environment.as_deref()) {
            (Some(project), Some(env)) => project.environments.get(env),
            _ => None,
        };
        let layers = [
            Layer::new(
                LayerLevel::Environment,
                environment.map(|e| &e.variables).unwrap_or(&empty),
            ),
            Layer::new(
                LayerLevel::Project,
                project.map(|p| &p.variables).unwrap_or(&empty),
            ),
            Layer::new(LayerLevel::Case, &case.variables),
        ];
        Scope::evaluate_layers(&layers, &self.functions)
    }

    #[instrument(skip(self))]
    async fn run_case(&self, case_id: CaseId) -> CaseSummary {
        let started = Instant::now();
        let mut summary = CaseSummary {
            case_id,
            name: case_name(&self.suite, case_id),
            status: CaseStatus::Pending,
            success: false,
            error: None,
            counts: Counts::default(),
            start_time: Utc::now(),
            duration_ms: 0,
            steps: Vec::new(),
        };

        let Some(case) = self.suite.case(case_id) else {
            let err = EngineError::UnknownCase { id: case_id };
            warn!("{}", err);
            summary.error = Some(err.to_string());
            Self::transition(&mut summary, CaseStatus::Failed);
            return summary;
        };

        let prepared = self.case_scope(case).and_then(|scope| {
            let expanded = CaseGraph::new(&*self.suite, &self.functions)
                .expand(case_id, &scope)?;
            Ok((scope, expanded))
        });
        let (mut scope, expanded) = match prepared {
            Ok(prepared) => prepared,
            Err(err @ EngineError::CyclicReference { .. }) => {
                warn!(case_id, "Excluding case: {}", err);
                summary.error = Some(err.to_string());
                Self::transition(&mut summary, CaseStatus::Excluded);
                return summary;
            }
            Err(err) => {
                warn!(case_id, "Case could not be prepared: {}", err);
                summary.error = Some(err.to_string());
                Self::transition(&mut summary, CaseStatus::Failed);
                return summary;
            }
        };

        if expanded.skipped {
            summary.success = true;
            Self::transition(&mut summary, CaseStatus::Skipped);
            return summary;
        }

        Self::transition(&mut summary, CaseStatus::Running);
        let ctx = BuildContext {
            suite: &self.suite,
            environment: self.environment.as_deref(),
            case,
            functions: &self.functions,
            default_timeout: self.default_timeout,
        };

        for (index, step) in expanded.steps.iter().enumerate() {
            info!(
                "Running step {}/{}: {}",
                index + 1,
                expanded.steps.len(),
                step.step.name
            );
            let flow = self
                .run_step(step, &expanded, &mut scope, &ctx, &mut summary)
                .await;
            if let StepFlow::Abort(reason) = flow {
                info!("Stopping case due to transport failure");
                summary.error = Some(reason);
                break;
            }
        }

        for step in &summary.steps {
            summary.counts.record(step.success);
        }
        summary.success = summary.error.is_none()
            && summary.steps.iter().all(|s| s.success);
        if summary.error.is_none() && !summary.success {
            summary.error = Some("some steps failed".to_string());
        }
        summary.duration_ms = started.elapsed().as_millis() as u64;

        let status = if summary.success {
            CaseStatus::Passed
        } else {
            CaseStatus::Failed
        };
        Self::transition(&mut summary, status);
        info!(
            "Case '{}' finished ({} ms) - Success: {}",
            summary.name, summary.duration_ms, summary.success
        );
        summary
    }

    /// Step-local scope, predicate check, build, send (`run_times` times),
    /// extraction and assertions for one expanded step.
    async fn run_step(
        &self,
        expanded: &ExpandedStep,
        case: &ExpandedCase,
        scope: &mut Scope,
        ctx: &BuildContext<'_>,
        summary: &mut CaseSummary,
    ) -> StepFlow {
        let step = &expanded.step;
        let started = Instant::now();
        let origin = expanded.origin_case;
        let functions = &self.functions;
        let failed = |err: EngineError| {
            failed_step(&step.name, origin, err.to_string(), started)
        };

        let step_scope = self
            .origin_scope(expanded, case.case_id, scope)
            .and_then(|s| s.with_layer(&step.variables, functions));
        let mut step_scope = match step_scope {
            Ok(step_scope) => step_scope,
            Err(err) => {
                warn!(step = %step.name, "Step variables failed: {}", err);
                summary.steps.push(failed(err));
                return StepFlow::Continue;
            }
        };

        let predicates = expanded.guards.iter().chain(step.skip_if.iter());
        for predicate in predicates {
            let vars = step_scope.vars();
            match expression::evaluate_predicate(predicate, vars) {
                Ok(true) => {
                    debug!(step = %step.name, %predicate, "Skipping step");
                    summary.counts.skip();
                    return StepFlow::Continue;
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(step = %step.name, "Skip predicate failed: {}", err);
                    summary.steps.push(failed(err));
                    return StepFlow::Continue;
                }
            }
        }

        let call = match builder::build(expanded, &step_scope, ctx) {
            Ok(call) => call,
            Err(err) => {
                warn!(step = %step.name, "Failed to build request: {}", err);
                summary.steps.push(failed(err));
                return StepFlow::Continue;
            }
        };

        let times = step.run_times.max(1);
        for iteration in 1..=times {
            let name = if times > 1 {
                format!("{} [{iteration}/{times}]", step.name)
            } else {
                step.name.clone()
            };
            let sent = Instant::now();

            let response = match self.transport.send(&call).await {
                Ok(response) => response,
                Err(err) => {
                    error!(step = %name, "Failed to send request: {}", err);
                    let mut result =
                        failed_step(&name, origin, err.to_string(), sent);
                    result.request = Some(call.to_request_info());
                    summary.steps.push(result);
                    return StepFlow::Abort(format!(
                        "step '{name}' failed to send: {err}"
                    ));
                }
            };

            let mut extractions = Vec::with_capacity(step.extract.len());
            for rule in &step.extract {
                let extracted =
                    extractor::extract(rule, &response, &step_scope, functions);
                match extracted {
                    Ok((var, value)) => {
                        scope.insert(var.clone(), value.clone());
                        step_scope.insert(var.clone(), value.clone());
                        extractions.push(ExtractionOutcome {
                            name: var,
                            value: Some(value),
                            error: None,
                        });
                    }
                    Err(err) => {
                        warn!(step = %name, "Extraction failed: {}", err);
                        extractions.push(ExtractionOutcome {
                            name: rule.name.clone(),
                            value: None,
                            error: Some(err.to_string()),
                        });
                    }
                }
            }

            let assertions = assertion::evaluate(
                &step.validate,
                &response,
                &step_scope,
                functions,
            );

            let mut errors: Vec<String> =
                extractions.iter().filter_map(|e| e.error.clone()).collect();
            errors.extend(assertion::failure_message(&assertions));
            let success = errors.is_empty();
            if !success {
                warn!(step = %name, "Step failed: {}", errors.join("; "));
            }

            summary.steps.push(StepResult {
                name,
                case_id: origin,
                success,
                error: (!success).then(|| errors.join("; ")),
                request: Some(call.to_request_info()),
                response: Some(response.to_info()),
                extractions,
                assertions,
                duration_ms: sent.elapsed().as_millis() as u64,
            });
        }
        StepFlow::Continue
    }

    /// Quoted steps also see their declaring case's variables, without
    /// overriding anything the running case already holds.
    fn origin_scope(
        &self,
        expanded: &ExpandedStep,
        root: CaseId,
        scope: &Scope,
    ) -> Result<Scope, EngineError> {
        if expanded.origin_case == root {
            return Ok(scope.clone());
        }
        let Some(origin) = self.suite.case(expanded.origin_case) else {
            return Ok(scope.clone());
        };
        scope.with_defaults(&origin.variables, &self.functions)
    }
}
