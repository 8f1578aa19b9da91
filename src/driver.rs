//! Query driver.
//!
//! Owns the stores and the loaded program, seeds a worker per query, and
//! exposes solutions as name-to-term snapshots. Query variables are
//! upgraded into a distinguished query environment so that every binding
//! of them goes through suspension mechanics; solutions are reflected to
//! ground snapshots with fresh display names for any variable left free.

use crate::env::EnvStore;
use crate::metrics::MetricsSnapshot;
use crate::program::Program;
use crate::symbol::SymbolStore;
use crate::term::{format_term, TermId, TermStore};
use crate::var::VarStore;
use crate::worker::{Worker, WorkerError};

/// One solution: bindings for the named query variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Solution {
    bindings: Vec<(String, TermId)>,
}

impl Solution {
    pub fn get(&self, name: &str) -> Option<TermId> {
        self.bindings
            .iter()
            .find(|(n, _)| n == name)
            .map(|&(_, t)| t)
    }

    /// True for a solution that binds no query variable (e.g. a ground
    /// query or a successful negation).
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn bindings(&self) -> &[(String, TermId)] {
        &self.bindings
    }
}

/// All solutions of one query plus captured output and counters.
#[derive(Debug)]
pub struct SolveOutcome {
    pub solutions: Vec<Solution>,
    /// Everything `write/1` and friends emitted.
    pub output: String,
    pub metrics: MetricsSnapshot,
}

/// Driver-level failures.
#[derive(Debug)]
pub enum SolveError {
    /// The step budget ran out; partial solutions are attached.
    StepLimit {
        solutions: Vec<Solution>,
        output: String,
    },
    /// Fatal engine invariant violation.
    Invariant(String),
}

impl std::fmt::Display for SolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SolveError::StepLimit { solutions, .. } => write!(
                f,
                "step limit exhausted after {} solution(s)",
                solutions.len()
            ),
            SolveError::Invariant(msg) => write!(f, "invariant violation: {}", msg),
        }
    }
}

impl std::error::Error for SolveError {}

/// The query driver: stores, program, and the solve entry point.
pub struct Driver {
    pub symbols: SymbolStore,
    pub terms: TermStore,
    pub vars: VarStore,
    program: Program,
}

impl Driver {
    pub fn new() -> Self {
        Self {
            symbols: SymbolStore::new(),
            terms: TermStore::new(),
            vars: VarStore::new(),
            program: Program::new(),
        }
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn program_mut(&mut self) -> &mut Program {
        &mut self.program
    }

    /// Solve a query, returning every solution (splitting enumerates them
    /// without backtracking). `max_steps` bounds worker iterations.
    pub fn solve(
        &mut self,
        goal: TermId,
        max_steps: Option<u64>,
    ) -> Result<SolveOutcome, SolveError> {
        let vars = std::mem::take(&mut self.vars);
        let envs = EnvStore::new();
        let mut worker = Worker::new(
            &self.program,
            &self.terms,
            &self.symbols,
            vars,
            envs,
            max_steps,
        );
        worker.seed(goal);
        let result = worker.run();

        let solutions: Vec<Solution> = worker
            .solutions
            .drain(..)
            .map(|bindings| Solution { bindings })
            .collect();
        let output = std::mem::take(&mut worker.out);
        let metrics = worker.metrics.snapshot();
        self.vars = worker.vars;

        match result {
            Ok(()) => Ok(SolveOutcome {
                solutions,
                output,
                metrics,
            }),
            Err(WorkerError::StepLimit) => Err(SolveError::StepLimit { solutions, output }),
            Err(WorkerError::Invariant(msg)) => Err(SolveError::Invariant(msg)),
        }
    }

    /// Render a term (e.g. a solution binding) for display.
    pub fn render(&self, term: TermId) -> String {
        format_term(term, &self.terms, &self.symbols, &self.vars)
            .unwrap_or_else(|e| format!("<{}>", e))
    }
}

impl Default for Driver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ground_true_query_yields_one_empty_solution() {
        let mut driver = Driver::new();
        let goal = driver.terms.atom(driver.symbols.intern("true"));
        let out = driver.solve(goal, None).unwrap();
        assert_eq!(out.solutions.len(), 1);
        assert!(out.solutions[0].is_empty());
    }

    #[test]
    fn fail_query_yields_no_solution() {
        let mut driver = Driver::new();
        let goal = driver.terms.atom(driver.symbols.intern("fail"));
        let out = driver.solve(goal, None).unwrap();
        assert!(out.solutions.is_empty());
    }

    #[test]
    fn unknown_predicate_fails() {
        let mut driver = Driver::new();
        let goal = driver.terms.atom(driver.symbols.intern("no_such_thing"));
        let out = driver.solve(goal, None).unwrap();
        assert!(out.solutions.is_empty());
    }

    #[test]
    fn unify_query_reports_binding() {
        let mut driver = Driver::new();
        let eq = driver.symbols.intern("=");
        let x = driver.vars.fresh("X", None);
        let xt = driver.terms.var(x);
        let goal = driver.terms.compound2(eq, xt, driver.terms.int(42));
        let out = driver.solve(goal, None).unwrap();
        assert_eq!(out.solutions.len(), 1);
        assert_eq!(out.solutions[0].get("X"), Some(driver.terms.int(42)));
        assert_eq!(driver.render(out.solutions[0].get("X").unwrap()), "42");
    }

    #[test]
    fn step_limit_surfaces_as_error() {
        let mut driver = Driver::new();
        let goal = driver.terms.atom(driver.symbols.intern("true"));
        let err = driver.solve(goal, Some(0)).unwrap_err();
        match err {
            SolveError::StepLimit { solutions, .. } => assert!(solutions.is_empty()),
            other => panic!("expected StepLimit, got {:?}", other),
        }
    }

    #[test]
    fn query_vars_are_reset_between_solutions_of_separate_queries() {
        let mut driver = Driver::new();
        let eq = driver.symbols.intern("=");
        let x = driver.vars.fresh("X", None);
        let xt = driver.terms.var(x);
        let goal = driver.terms.compound2(eq, xt, driver.terms.int(1));
        let out = driver.solve(goal, None).unwrap();
        assert_eq!(out.solutions.len(), 1);
        assert!(
            !driver.vars.is_bound(x),
            "solution reflection must not leave the query variable bound"
        );
    }
}
