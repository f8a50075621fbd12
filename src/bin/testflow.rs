//! testflow CLI: load suite files and run cases against their hosts.

use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use testflow::{
    CaseSummary, DefaultRunner, EngineConfig, ExecutionMode, ReportFormat,
    ReportWriter, RunRequest, RunSummary, SuiteLoader, TestRunner,
};
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, EnvFilter};

/// Declarative API test runner.
#[derive(Parser, Debug)]
#[command(name = "testflow", version, about)]
struct Cli {
    /// Suite file or directory path.
    #[arg(short = 'p', long = "path", default_value = "tests/suites")]
    path: PathBuf,

    /// Environment whose host, headers, variables and scripts apply.
    #[arg(short = 'e', long = "env", env = "TESTFLOW_ENV")]
    env: Option<String>,

    /// Case id to run; repeat for several. All cases when omitted.
    #[arg(short = 'c', long = "case")]
    cases: Vec<u64>,

    /// Run cases concurrently, one task per case.
    #[arg(long = "concurrent")]
    concurrent: bool,

    /// Default timeout in seconds per request.
    #[arg(short = 't', long = "timeout")]
    timeout: Option<u64>,

    /// Identifier for this run; generated when omitted.
    #[arg(long = "run-id")]
    run_id: Option<String>,

    /// Directory to save the run report in.
    #[arg(short = 'r', long = "report-dir")]
    report_dir: Option<PathBuf>,

    /// Report output format.
    #[arg(long = "report-format", value_enum, default_value = "json")]
    report_format: ReportFormat,

    /// Enable verbose logging.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    if std::env::var_os("RUST_LOG").is_none() {
        let level = if verbose { "debug" } else { "info" };
        std::env::set_var("RUST_LOG", level);
    }

    if tracing::dispatcher::has_been_set() {
        return;
    }

    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .try_init();
}

fn truncate(body: &str) -> String {
    if body.len() > 500 {
        let cut = (0..=500)
            .rev()
            .find(|&i| body.is_char_boundary(i))
            .unwrap_or(0);
        format!("{}...(truncated)", &body[..cut])
    } else {
        body.to_string()
    }
}

fn print_case(case: &CaseSummary, verbose: bool) {
    let status = if case.success {
        "\x1b[32mPASS\x1b[0m"
    } else {
        "\x1b[31mFAIL\x1b[0m"
    };
    info!(
        "{} case {}: {} ({:?}, {} ms)",
        status, case.case_id, case.name, case.status, case.duration_ms
    );
    if let Some(error) = &case.error {
        error!("   \x1b[31m{}\x1b[0m", error);
    }

    for (i, step) in case.steps.iter().enumerate() {
        let step_status = if step.success {
            "\x1b[32m✓\x1b[0m"
        } else {
            "\x1b[31m✗\x1b[0m"
        };
        info!(
            "  {}. {} {} ({} ms)",
            i + 1,
            step_status,
            step.name,
            step.duration_ms
        );
        if let Some(error) = &step.error {
            error!("     \x1b[31mError: {}\x1b[0m", error);
        }

        if verbose {
            if let Some(request) = &step.request {
                debug!("     Request: {} {}", request.method, request.url);
                if let Some(body) = &request.body {
                    debug!("     Request body: {}", truncate(body));
                }
            }
            if let Some(response) = &step.response {
                debug!("     Response: Status {}", response.status);
                if let Some(body) = &response.body {
                    debug!("     Response body: {}", truncate(body));
                }
            }
        }
    }
}

fn print_summary(summary: &RunSummary) {
    info!(
        concat!(
            "Summary:\n",
            "  Cases: {}\n",
            "  \x1b[32mPassed: {}\x1b[0m\n",
            "  \x1b[31mFailed: {}\x1b[0m\n",
            "  Skipped: {}\n",
            "  Steps: {} ({} failed, {} skipped)\n",
            "  Duration: {} ms",
        ),
        summary.counts.total,
        summary.counts.pass,
        summary.counts.fail,
        summary.counts.skipped,
        summary.step_counts.total,
        summary.step_counts.fail,
        summary.step_counts.skipped,
        summary.duration_ms
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    init_tracing(args.verbose);

    let mut loader = SuiteLoader::new();
    loader.add_path(&args.path);
    let suite = loader.load_all()?;

    let case_ids = if args.cases.is_empty() {
        suite.cases.iter().map(|c| c.id).collect()
    } else {
        for id in &args.cases {
            if suite.case(*id).is_none() {
                return Err(anyhow!(
                    "Case {id} not found in {}",
                    args.path.display()
                ));
            }
        }
        args.cases.clone()
    };

    let mut config = EngineConfig::default();
    if let Some(timeout) = args.timeout {
        config.default_timeout_secs = timeout;
    }
    if args.concurrent {
        config.mode = ExecutionMode::Concurrent;
    }

    let request = RunRequest {
        run_id: args.run_id.unwrap_or_else(|| {
            format!("run-{}", Utc::now().timestamp_millis())
        }),
        environment: args.env,
        case_ids,
        mode: None,
    };

    let mut runner = DefaultRunner::new(suite, config);
    if let Some(dir) = args.report_dir {
        let writer = ReportWriter::new(dir, args.report_format);
        runner.add_observer(Arc::new(writer));
    }

    info!("Running {} case(s)...", request.case_ids.len());
    let summary = runner.run(&request).await;

    for case in &summary.details {
        print_case(case, args.verbose);
    }
    print_summary(&summary);

    if !summary.success {
        exit(1);
    }

    Ok(())
}
