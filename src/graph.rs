//! Expansion of `quote_case` references into a flat, ordered step list.

use indexmap::{IndexMap, IndexSet};
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::expression;
use crate::functions::FunctionRegistry;
use crate::model::{Case, CaseId, ProjectId, Step, Suite};
use crate::scope::Scope;

/// Read access to stored cases.
pub trait CaseStore {
    fn find_case(&self, id: CaseId) -> Option<&Case>;
}

impl CaseStore for Suite {
    fn find_case(&self, id: CaseId) -> Option<&Case> {
        self.case(id)
    }
}

impl CaseStore for IndexMap<CaseId, Case> {
    fn find_case(&self, id: CaseId) -> Option<&Case> {
        self.get(&id)
    }
}

/// A concrete step together with where it was declared.
#[derive(Debug, Clone)]
pub struct ExpandedStep {
    pub step: Step,
    pub origin_case: CaseId,
    pub origin_project: ProjectId,
    /// `skip_if` predicates of the quoting steps that led here, outermost
    /// first.
    pub guards: Vec<String>,
}

/// The flattened steps of one case, built once per run.
#[derive(Debug, Clone)]
pub struct ExpandedCase {
    pub case_id: CaseId,
    pub name: String,
    pub project_id: ProjectId,
    /// The root case's own `skip_if` was true.
    pub skipped: bool,
    pub steps: Vec<ExpandedStep>,
}

pub struct CaseGraph<'a, S: CaseStore + ?Sized> {
    store: &'a S,
    functions: &'a FunctionRegistry,
}

impl<'a, S: CaseStore + ?Sized> CaseGraph<'a, S> {
    pub fn new(store: &'a S, functions: &'a FunctionRegistry) -> Self {
        Self { store, functions }
    }

    /// Depth-first expansion of `case_id`. Steps are visited by ascending
    /// `num`; a quoting step is replaced by the quoted case's expansion.
    ///
    /// `scope` is the root case's evaluated scope. A quoted case's
    /// variables are evaluated against it and only fill names it lacks;
    /// each case's `skip_if` reads the resulting values.
    pub fn expand(
        &self,
        case_id: CaseId,
        scope: &Scope,
    ) -> Result<ExpandedCase> {
        let root = self
            .store
            .find_case(case_id)
            .ok_or(EngineError::UnknownCase { id: case_id })?;

        let mut expanded = ExpandedCase {
            case_id,
            name: root.name.clone(),
            project_id: root.project_id,
            skipped: false,
            steps: Vec::new(),
        };
        let mut visiting = IndexSet::new();
        let visited = self.visit(
            case_id,
            scope,
            &[],
            &mut visiting,
            &mut expanded.steps,
        )?;
        expanded.skipped = !visited;

        debug!(
            case_id,
            steps = expanded.steps.len(),
            skipped = expanded.skipped,
            "Expanded case graph"
        );
        Ok(expanded)
    }

    /// Returns `false` when the case was skipped by its predicate.
    fn visit(
        &self,
        case_id: CaseId,
        scope: &Scope,
        guards: &[String],
        visiting: &mut IndexSet<CaseId>,
        out: &mut Vec<ExpandedStep>,
    ) -> Result<bool> {
        if visiting.contains(&case_id) {
            let mut chain: Vec<CaseId> = visiting.iter().copied().collect();
            chain.push(case_id);
            return Err(EngineError::CyclicReference { chain });
        }
        let case = self
            .store
            .find_case(case_id)
            .ok_or(EngineError::UnknownCase { id: case_id })?;

        let local = if visiting.is_empty() {
            scope.clone()
        } else {
            match scope.with_defaults(&case.variables, self.functions) {
                Ok(local) => local,
                // Values built from extractions only resolve at run time.
                Err(err) if case.skip_if.is_none() => {
                    debug!(case_id, "Deferring quoted case variables: {}", err);
                    scope.clone()
                }
                Err(err) => return Err(err),
            }
        };
        if let Some(predicate) = &case.skip_if {
            if expression::evaluate_predicate(predicate, local.vars())? {
                debug!(case_id, %predicate, "Case skipped by predicate");
                return Ok(false);
            }
        }

        visiting.insert(case_id);
        let mut steps: Vec<&Step> = case.steps.iter().collect();
        steps.sort_by_key(|step| step.num);

        for step in steps {
            match step.quote_case {
                Some(quoted) => {
                    let mut nested = guards.to_vec();
                    nested.extend(step.skip_if.iter().cloned());
                    self.visit(quoted, &local, &nested, visiting, out)?;
                }
                None => out.push(ExpandedStep {
                    step: step.clone(),
                    origin_case: case.id,
                    origin_project: case.project_id,
                    guards: guards.to_vec(),
                }),
            }
        }
        visiting.pop();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Step;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn case(id: CaseId, steps: Vec<Step>) -> Case {
        Case {
            id,
            project_id: 1,
            name: format!("case {id}"),
            steps,
            ..Case::default()
        }
    }

    fn store(cases: Vec<Case>) -> IndexMap<CaseId, Case> {
        cases.into_iter().map(|c| (c.id, c)).collect()
    }

    fn expand(
        cases: &IndexMap<CaseId, Case>,
        id: CaseId,
    ) -> Result<ExpandedCase> {
        let functions = FunctionRegistry::with_builtins();
        CaseGraph::new(cases, &functions).expand(id, &Scope::new())
    }

    fn request(num: u32, name: &str) -> Step {
        Step::request(num, name, format!("/{name}"))
    }

    fn quote(num: u32, target: CaseId) -> Step {
        Step::quote(num, format!("use {target}"), target)
    }

    fn names(expanded: &ExpandedCase) -> Vec<String> {
        expanded.steps.iter().map(|s| s.step.name.clone()).collect()
    }

    #[test]
    fn nested_quotes_expand_innermost_first() {
        let cases = store(vec![
            case(1, vec![quote(1, 2), request(2, "a1")]),
            case(2, vec![quote(1, 3), request(2, "b1")]),
            case(3, vec![request(1, "c1"), request(2, "c2")]),
        ]);
        let expanded = expand(&cases, 1).unwrap();
        assert_eq!(names(&expanded), vec!["c1", "c2", "b1", "a1"]);
        assert_eq!(expanded.steps[0].origin_case, 3);
        assert_eq!(expanded.steps[3].origin_case, 1);
    }

    #[test]
    fn quoting_the_root_again_is_a_cycle() {
        let cases = store(vec![
            case(1, vec![Step::quote(1, "use b", 2)]),
            case(2, vec![Step::quote(1, "use c", 3)]),
            case(3, vec![request(1, "c1"), quote(2, 1)]),
        ]);
        let err = expand(&cases, 1).unwrap_err();
        assert_eq!(
            err,
            EngineError::CyclicReference {
                chain: vec![1, 2, 3, 1]
            }
        );
    }

    #[test]
    fn self_quote_is_a_cycle() {
        let cases = store(vec![case(7, vec![Step::quote(1, "me", 7)])]);
        let err = expand(&cases, 7).unwrap_err();
        assert!(matches!(err, EngineError::CyclicReference { .. }));
    }

    #[test]
    fn repeated_quote_of_same_case_is_not_a_cycle() {
        let cases = store(vec![
            case(1, vec![quote(1, 2), quote(2, 2)]),
            case(2, vec![Step::request(1, "shared", "/s")]),
        ]);
        let expanded = expand(&cases, 1).unwrap();
        assert_eq!(names(&expanded), vec!["shared", "shared"]);
    }

    #[test]
    fn steps_follow_num_not_declaration_order() {
        let cases = store(vec![case(
            1,
            vec![
                Step::request(3, "third", "/3"),
                Step::request(1, "first", "/1"),
                Step::request(2, "second", "/2"),
            ],
        )]);
        let expanded = expand(&cases, 1).unwrap();
        assert_eq!(names(&expanded), vec!["first", "second", "third"]);
    }

    #[test]
    fn skipped_case_contributes_nothing() {
        let mut skipped = case(2, vec![Step::quote(1, "would cycle", 1)]);
        skipped.skip_if = Some("true".to_string());
        let cases = store(vec![
            case(1, vec![quote(1, 2), request(2, "a1")]),
            skipped,
        ]);
        let expanded = expand(&cases, 1).unwrap();
        assert_eq!(names(&expanded), vec!["a1"]);
        assert!(!expanded.skipped);
    }

    #[test]
    fn skip_predicate_reads_vars() {
        let mut root = case(1, vec![Step::request(1, "a1", "/a")]);
        root.skip_if = Some("env == \"prod\"".to_string());
        let cases = store(vec![root]);
        let mut scope = Scope::new();
        scope.insert("env", json!("prod"));
        let functions = FunctionRegistry::new();
        let expanded = CaseGraph::new(&cases, &functions)
            .expand(1, &scope)
            .unwrap();
        assert!(expanded.skipped);
        assert!(expanded.steps.is_empty());
    }

    #[test]
    fn quoted_case_skip_reads_evaluated_variables() {
        let mut quoted = case(2, vec![Step::request(1, "inner", "/i")]);
        quoted.variables.insert("stage".into(), json!("$env_name"));
        quoted.skip_if = Some("stage == \"prod\"".to_string());
        let cases = store(vec![
            case(1, vec![quote(1, 2), request(2, "a1")]),
            quoted,
        ]);
        let mut scope = Scope::new();
        scope.insert("env_name", json!("prod"));
        let functions = FunctionRegistry::new();
        let expanded = CaseGraph::new(&cases, &functions)
            .expand(1, &scope)
            .unwrap();
        assert_eq!(names(&expanded), vec!["a1"]);
    }

    #[test]
    fn quoted_case_does_not_override_running_scope() {
        let mut quoted = case(2, vec![Step::request(1, "inner", "/i")]);
        quoted.variables.insert("env".into(), json!("prod"));
        quoted.skip_if = Some("env == \"prod\"".to_string());
        let cases = store(vec![case(1, vec![quote(1, 2)]), quoted]);
        let mut scope = Scope::new();
        scope.insert("env", json!("dev"));
        let functions = FunctionRegistry::new();
        let expanded = CaseGraph::new(&cases, &functions)
            .expand(1, &scope)
            .unwrap();
        assert_eq!(names(&expanded), vec!["inner"]);
    }

    #[test]
    fn runtime_only_variables_do_not_block_expansion() {
        let mut quoted = case(2, vec![request(1, "inner")]);
        quoted
            .variables
            .insert("auth".into(), json!("Bearer $token"));
        let cases = store(vec![case(1, vec![quote(1, 2)]), quoted.clone()]);
        assert_eq!(names(&expand(&cases, 1).unwrap()), vec!["inner"]);

        quoted.skip_if = Some("auth == \"\"".to_string());
        let cases = store(vec![case(1, vec![quote(1, 2)]), quoted]);
        let err = expand(&cases, 1).unwrap_err();
        assert!(matches!(err, EngineError::UnresolvedVariable { .. }));
    }

    #[test]
    fn quote_step_guards_are_carried() {
        let mut quote = Step::quote(1, "maybe", 2);
        quote.skip_if = Some("flag".to_string());
        let cases = store(vec![
            case(1, vec![quote]),
            case(2, vec![Step::request(1, "inner", "/i")]),
        ]);
        let expanded = expand(&cases, 1).unwrap();
        assert_eq!(expanded.steps[0].guards, vec!["flag".to_string()]);
    }

    #[test]
    fn unknown_case_is_reported() {
        let cases = store(vec![case(1, vec![Step::quote(1, "ghost", 99)])]);
        let err = expand(&cases, 1).unwrap_err();
        assert_eq!(err, EngineError::UnknownCase { id: 99 });
    }
}
