//! Engine settings and suite file loading.

use crate::model::{ExecutionMode, Suite};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Run-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Per-request timeout when a step sets none.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Mode for requests that do not pick one.
    #[serde(default)]
    pub mode: ExecutionMode,
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout_secs(),
            mode: ExecutionMode::default(),
        }
    }
}

/// Loads suite files and merges them into one [`Suite`].
#[derive(Debug)]
pub struct SuiteLoader {
    pub paths: Vec<PathBuf>,
}

impl SuiteLoader {
    pub fn new() -> Self {
        Self { paths: Vec::new() }
    }

    pub fn add_path<P: AsRef<Path>>(&mut self, path: P) -> &mut Self {
        self.paths.push(path.as_ref().to_path_buf());
        self
    }

    /// Load a single YAML suite file.
    pub fn load_file<P: AsRef<Path>>(&self, path: P) -> Result<Suite> {
        let path = path.as_ref();
        info!("Loading suite from {}", path.display());

        let content = fs::read_to_string(path)
            .context(format!("Failed to read suite file: {}", path.display()))?;
        let suite = Suite::from_yaml(&content)
            .context(format!("Failed to parse YAML from {}", path.display()))?;

        debug!(
            projects = suite.projects.len(),
            cases = suite.cases.len(),
            scripts = suite.scripts.len(),
            "Loaded suite file"
        );
        Ok(suite)
    }

    /// Merge every `.yaml`/`.yml` file of `dir`, in file name order.
    pub fn load_dir<P: AsRef<Path>>(&self, dir: P) -> Result<Suite> {
        let dir = dir.as_ref();
        info!("Loading suites from directory: {}", dir.display());

        let mut files = Vec::new();
        let entries = fs::read_dir(dir).with_context(|| {
            format!("Failed to read directory: {}", dir.display())
        })?;
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && is_suite_file(&path) {
                files.push(path);
            }
        }
        files.sort();

        let mut suite = Suite::default();
        for path in &files {
            suite.merge(self.load_file(path)?);
        }
        info!("Loaded {} suite file(s) from {}", files.len(), dir.display());
        Ok(suite)
    }

    /// Load a file or a directory.
    pub fn load_path<P: AsRef<Path>>(&self, path: P) -> Result<Suite> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(anyhow!("Path does not exist: {}", path.display()));
        }
        if path.is_dir() {
            self.load_dir(path)
        } else {
            self.load_file(path)
        }
    }

    /// Load every configured path into one suite.
    pub fn load_all(&self) -> Result<Suite> {
        let mut suite = Suite::default();
        for path in &self.paths {
            suite.merge(self.load_path(path)?);
        }
        if suite.cases.is_empty() {
            return Err(anyhow!("No test cases found"));
        }
        info!(
            "Loaded {} project(s) and {} case(s) in total",
            suite.projects.len(),
            suite.cases.len()
        );
        Ok(suite)
    }
}

impl Default for SuiteLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn is_suite_file(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext == "yaml" || ext == "yml")
}
