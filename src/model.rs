//! Stored test definitions and the result records produced by a run.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub type CaseId = u64;
pub type ProjectId = u64;

/// Everything a run needs: projects, cases and the script library.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Suite {
    #[serde(default)]
    pub projects: Vec<Project>,
    #[serde(default)]
    pub cases: Vec<Case>,
    #[serde(default)]
    pub scripts: Vec<ScriptFile>,
}

impl Suite {
    /// Deserialize a suite from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Serialize the suite to a YAML string.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    pub fn project(&self, id: ProjectId) -> Option<&Project> {
        self.projects.iter().find(|p| p.id == id)
    }

    pub fn case(&self, id: CaseId) -> Option<&Case> {
        self.cases.iter().find(|c| c.id == id)
    }

    pub fn script(&self, name: &str) -> Option<&ScriptFile> {
        self.scripts.iter().find(|s| s.name == name)
    }

    /// Append another suite's records. Later records with a duplicate id
    /// or name replace earlier ones.
    pub fn merge(&mut self, other: Suite) {
        for project in other.projects {
            self.projects.retain(|p| p.id != project.id);
            self.projects.push(project);
        }
        for case in other.cases {
            self.cases.retain(|c| c.id != case.id);
            self.cases.push(case);
        }
        for script in other.scripts {
            self.scripts.retain(|s| s.name != script.name);
            self.scripts.push(script);
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    /// Base URL joined with relative step addresses.
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub headers: IndexMap<String, String>,
    #[serde(default)]
    pub params: IndexMap<String, Value>,
    #[serde(default)]
    pub variables: IndexMap<String, Value>,
    /// Names of script files whose functions this project exposes.
    #[serde(default)]
    pub scripts: Vec<String>,
    #[serde(default)]
    pub environments: IndexMap<String, Environment>,
}

/// Per-environment overrides for a project.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Environment {
    /// Replaces the project host when set.
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub headers: IndexMap<String, String>,
    #[serde(default)]
    pub params: IndexMap<String, Value>,
    #[serde(default)]
    pub variables: IndexMap<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Case {
    pub id: CaseId,
    pub project_id: ProjectId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub variables: IndexMap<String, Value>,
    #[serde(default)]
    pub headers: IndexMap<String, String>,
    #[serde(default)]
    pub params: IndexMap<String, Value>,
    #[serde(default)]
    pub scripts: Vec<String>,
    /// CEL predicate; a true result removes the whole case.
    #[serde(default)]
    pub skip_if: Option<String>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// One unit of work inside a case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Ordering key within the case, ascending.
    #[serde(default)]
    pub num: u32,
    pub name: String,
    #[serde(default)]
    pub method: HttpMethod,
    /// Absolute URL or a path joined onto the selected host.
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub headers: IndexMap<String, String>,
    #[serde(default)]
    pub params: IndexMap<String, Value>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub body_type: BodyType,
    /// Multipart file fields: field name -> file path expression.
    #[serde(default)]
    pub files: IndexMap<String, String>,
    /// Step-local variables, layered over the case scope.
    #[serde(default)]
    pub variables: IndexMap<String, Value>,
    #[serde(default)]
    pub extract: Vec<ExtractRule>,
    #[serde(default)]
    pub validate: Vec<AssertRule>,
    /// Delegate to another case's steps instead of issuing a call.
    #[serde(default)]
    pub quote_case: Option<CaseId>,
    #[serde(default = "default_run_times")]
    pub run_times: u32,
    #[serde(default)]
    pub skip_if: Option<String>,
    /// Per-request timeout in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub host_mode: HostMode,
}

fn default_run_times() -> u32 {
    1
}

impl Step {
    /// A concrete GET step with everything else defaulted.
    pub fn request(
        num: u32,
        name: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            num,
            name: name.into(),
            method: HttpMethod::Get,
            address: address.into(),
            headers: IndexMap::new(),
            params: IndexMap::new(),
            body: None,
            body_type: BodyType::Json,
            files: IndexMap::new(),
            variables: IndexMap::new(),
            extract: Vec::new(),
            validate: Vec::new(),
            quote_case: None,
            run_times: 1,
            skip_if: None,
            timeout: None,
            host_mode: HostMode::Case,
        }
    }

    /// A step that expands to the steps of `case_id`.
    pub fn quote(num: u32, name: impl Into<String>, case_id: CaseId) -> Self {
        Self {
            quote_case: Some(case_id),
            ..Self::request(num, name, "")
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyType {
    #[default]
    Json,
    Form,
    Multipart,
    Text,
}

/// Which host a relative step address is joined onto.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostMode {
    /// The project of the case being run.
    #[default]
    Case,
    /// The project owning the case that declared the step.
    Origin,
}

/// Where a value is read from in a response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    #[default]
    #[serde(alias = "content", alias = "json")]
    Body,
    #[serde(alias = "headers")]
    Header,
    #[serde(alias = "cookies")]
    Cookie,
    #[serde(alias = "regex")]
    Regexp,
    Constant,
    #[serde(alias = "func")]
    Function,
    #[serde(alias = "status_code")]
    Status,
}

impl DataSource {
    /// Prefix used when a function argument is rewritten into a response
    /// field reference.
    pub fn field_prefix(self) -> &'static str {
        match self {
            DataSource::Header => "headers",
            DataSource::Cookie => "cookies",
            DataSource::Status => "status_code",
            _ => "content",
        }
    }
}

/// Pulls one value out of a response into the case scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractRule {
    pub name: String,
    #[serde(default)]
    pub source: DataSource,
    #[serde(default)]
    pub locator: String,
    /// Response section read by `function` arguments; body when unset.
    #[serde(default)]
    pub section: Option<DataSource>,
}

/// One declared expectation on a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssertRule {
    /// Locator of the actual value, interpreted according to `source`.
    #[serde(default)]
    pub actual: String,
    #[serde(default)]
    pub source: DataSource,
    pub comparator: String,
    #[serde(default)]
    pub expected: Value,
    #[serde(default = "default_expected_type")]
    pub expected_type: String,
}

fn default_expected_type() -> String {
    "str".to_string()
}

/// A named script resource exposing functions to `${name(args)}` calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptFile {
    pub name: String,
    #[serde(default)]
    pub source: String,
    /// Environment-specific bodies that replace `source`.
    #[serde(default)]
    pub environments: IndexMap<String, String>,
}

impl ScriptFile {
    pub fn source_for(&self, environment: Option<&str>) -> &str {
        environment
            .and_then(|env| self.environments.get(env))
            .map(String::as_str)
            .unwrap_or(&self.source)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Sequential,
    Concurrent,
}

/// One execution request handed to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub run_id: String,
    #[serde(default)]
    pub environment: Option<String>,
    pub case_ids: Vec<CaseId>,
    /// Falls back to the engine's configured mode when absent.
    #[serde(default)]
    pub mode: Option<ExecutionMode>,
}

// ── results ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    pub total: usize,
    pub pass: usize,
    pub fail: usize,
    #[serde(default)]
    pub skipped: usize,
}

impl Counts {
    pub fn record(&mut self, success: bool) {
        self.total += 1;
        if success {
            self.pass += 1;
        } else {
            self.fail += 1;
        }
    }

    /// Skipped entries stay out of `total`.
    pub fn skip(&mut self) {
        self.skipped += 1;
    }

    pub fn add(&mut self, other: &Counts) {
        self.total += other.total;
        self.pass += other.pass;
        self.fail += other.fail;
        self.skipped += other.skipped;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestInfo {
    pub method: String,
    pub url: String,
    pub headers: IndexMap<String, String>,
    #[serde(default)]
    pub params: IndexMap<String, String>,
    pub body: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseInfo {
    pub status: u16,
    pub headers: IndexMap<String, String>,
    #[serde(default)]
    pub cookies: IndexMap<String, String>,
    pub body: Option<String>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionOutcome {
    pub name: String,
    pub value: Option<Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssertionOutcome {
    pub comparator: String,
    pub actual_locator: String,
    pub actual: Value,
    pub expected: Value,
    pub passed: bool,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub name: String,
    /// Case that declared the step (differs from the running case for
    /// quoted steps).
    pub case_id: CaseId,
    pub success: bool,
    pub error: Option<String>,
    pub request: Option<RequestInfo>,
    pub response: Option<ResponseInfo>,
    #[serde(default)]
    pub extractions: Vec<ExtractionOutcome>,
    #[serde(default)]
    pub assertions: Vec<AssertionOutcome>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Pending,
    Running,
    Passed,
    Failed,
    /// Skipped by its own `skip_if` predicate.
    Skipped,
    /// Removed before running, e.g. by a cyclic quote.
    Excluded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseSummary {
    pub case_id: CaseId,
    pub name: String,
    pub status: CaseStatus,
    pub success: bool,
    pub error: Option<String>,
    pub counts: Counts,
    pub start_time: DateTime<Utc>,
    pub duration_ms: u64,
    pub steps: Vec<StepResult>,
}

/// Final merged record for one execution request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    /// The mode the cases were scheduled with.
    #[serde(default)]
    pub mode: ExecutionMode,
    pub success: bool,
    /// Case-level counts.
    pub counts: Counts,
    pub step_counts: Counts,
    pub start_time: DateTime<Utc>,
    pub duration_ms: u64,
    pub details: Vec<CaseSummary>,
}
