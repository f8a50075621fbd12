//! Declarative API test execution.
//!
//! A [`Suite`] holds projects, cases and script resources. Running a case
//! expands its `quote_case` steps into a flat list, resolves layered
//! variables, substitutes `$var` and `${func(args)}` expressions, sends
//! each request, extracts values into the case scope and checks the
//! declared assertions. Per-case summaries are merged into one
//! [`RunSummary`] handed to the registered [`RunObserver`]s.

pub mod assertion;
pub mod builder;
pub mod config;
pub mod error;
pub mod expression;
pub mod extractor;
pub mod functions;
pub mod graph;
pub mod model;
pub mod parser;
pub mod report;
pub mod response;
pub mod runner;
pub mod scope;

pub use config::*;
pub use error::{EngineError, Result, TransportError};
pub use functions::{FunctionRegistry, ScriptFunction};
pub use graph::{CaseGraph, CaseStore};
pub use model::*;
pub use report::{ReportFormat, ReportWriter, RunObserver};
pub use runner::*;
pub use scope::Scope;

/// Crate version, reported by the CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn suite_yaml_round_trips_through_the_public_api() {
        let yaml = r#"
projects:
  - id: 1
    name: shop
    host: http://shop.test
    environments:
      staging:
        host: http://staging.shop.test
cases:
  - id: 10
    project_id: 1
    name: list items
    variables:
      page: 1
    steps:
      - num: 1
        name: list
        address: /items
        params:
          page: $page
        extract:
          - name: first_id
            source: body
            locator: items.0.id
        validate:
          - actual: items
            comparator: length_greater_than
            expected: "0"
            expected_type: int
"#;
        let suite = Suite::from_yaml(yaml).unwrap();
        let case = suite.case(10).unwrap();
        assert_eq!(case.steps[0].params.get("page"), Some(&json!("$page")));
        assert_eq!(case.steps[0].run_times, 1);
        assert_eq!(case.steps[0].validate[0].comparator, "length_greater_than");

        let again = Suite::from_yaml(&suite.to_yaml().unwrap()).unwrap();
        assert_eq!(again.cases.len(), 1);
        assert_eq!(
            again.project(1).unwrap().environments["staging"].host.as_deref(),
            Some("http://staging.shop.test")
        );
    }
}
