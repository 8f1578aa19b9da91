//! The execution worker.
//!
//! Drives the and-box/choice-box tree: expands goals into choice-boxes,
//! checks guard conditions, promotes solved boxes into their parents,
//! propagates failure, and realises nondeterminism by copying stable
//! subtrees (splitting) instead of backtracking.
//!
//! Single-threaded cooperative scheduling: one work item at a time, wake
//! entries before regular tasks, splitting only when every queue is dry.

use crate::builtin::{call_builtin, is_builtin, trial_unify, BuiltinCtx, BuiltinOutcome};
use crate::copy::{copy_subtree, CopyCtx};
use crate::env::EnvStore;
use crate::metrics::WorkerMetrics;
use crate::program::{GuardType, Program};
use crate::symbol::{ControlAtoms, SymbolStore};
use crate::term::{Term, TermId, TermStore};
use crate::trail::Trail;
use crate::tree::{AndId, ChoiceId, Status, Tree};
use crate::unify::{deref, unify, UnifyCtx};
use crate::var::{Suspension, VarId, VarStore};
use std::collections::VecDeque;

#[cfg(feature = "tracing")]
use crate::trace::{debug, trace};

/// Typed work items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    /// Run the root alternatives of the query.
    Start,
    /// Re-check a box whose guard may now be satisfiable.
    Promote(AndId),
    /// Search a stable box for a split candidate.
    Split(AndId),
    /// Terminal marker.
    Root,
}

/// Worker failure modes surfaced to the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// The step budget ran out; solutions so far are still valid.
    StepLimit,
    /// An internal invariant broke; the worker halts.
    Invariant(String),
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerError::StepLimit => write!(f, "step limit exhausted"),
            WorkerError::Invariant(msg) => write!(f, "invariant violation: {}", msg),
        }
    }
}

impl std::error::Error for WorkerError {}

/// Snapshot of the four work streams plus the pending-solution count, for
/// isolated sub-execution (negation, if-then-else conditions).
struct ContextFrame {
    tasks: VecDeque<Task>,
    wake: VecDeque<AndId>,
    recall: VecDeque<ChoiceId>,
    trail_pos: usize,
    solutions_len: usize,
}

enum GoalStep {
    Continue,
    Failed,
}

/// The execution worker for one query.
pub struct Worker<'a> {
    program: &'a Program,
    terms: &'a TermStore,
    symbols: &'a SymbolStore,
    ctl: ControlAtoms,
    pub envs: EnvStore,
    pub vars: VarStore,
    pub tree: Tree,
    pub trail: Trail,
    tasks: VecDeque<Task>,
    wake: VecDeque<AndId>,
    recall: VecDeque<ChoiceId>,
    contexts: Vec<ContextFrame>,
    root_choice: Option<ChoiceId>,
    query_vars: Vec<(String, VarId)>,
    /// Reflected bindings per solution, in emission order.
    pub solutions: Vec<Vec<(String, TermId)>>,
    pub metrics: WorkerMetrics,
    /// Captured `write/1` output.
    pub out: String,
    steps: u64,
    max_steps: Option<u64>,
}

impl<'a> Worker<'a> {
    pub fn new(
        program: &'a Program,
        terms: &'a TermStore,
        symbols: &'a SymbolStore,
        vars: VarStore,
        envs: EnvStore,
        max_steps: Option<u64>,
    ) -> Self {
        let ctl = ControlAtoms::intern(symbols);
        Self {
            program,
            terms,
            symbols,
            ctl,
            envs,
            vars,
            tree: Tree::new(),
            trail: Trail::new(),
            tasks: VecDeque::new(),
            wake: VecDeque::new(),
            recall: VecDeque::new(),
            contexts: Vec::new(),
            root_choice: None,
            query_vars: Vec::new(),
            solutions: Vec::new(),
            metrics: WorkerMetrics::new(),
            out: String::new(),
            steps: 0,
            max_steps,
        }
    }

    /// Seed the root configuration for a query.
    ///
    /// Free variables of the goal (no env yet) are upgraded into the query
    /// env, the parent of the root and-box's env, so every binding of them
    /// goes through suspension mechanics. Named ones are reported in
    /// solutions.
    pub fn seed(&mut self, goal: TermId) {
        let query_env = self.envs.fresh(None);
        let root_env = self.envs.fresh(Some(query_env));

        let mut seen = Vec::new();
        self.collect_query_vars(goal, &mut seen);
        for v in seen {
            self.vars.set_env(v, Some(query_env));
            let name = self.vars.name(v).to_string();
            if !name.starts_with('_') && !self.query_vars.iter().any(|(n, _)| *n == name) {
                self.query_vars.push((name, v));
            }
        }

        let root_choice = self.tree.new_choice(None, GuardType::None, None);
        let root = self.tree.new_and(root_env, Some(root_choice), self.trail.position());
        self.tree.add_alternative(root_choice, root);
        self.tree.and_mut(root).goals.push_back(goal);
        self.root_choice = Some(root_choice);
        self.tasks.push_back(Task::Start);
        self.tasks.push_back(Task::Root);
    }

    fn collect_query_vars(&self, term: TermId, out: &mut Vec<VarId>) {
        match self.terms.resolve(term) {
            Some(Term::Var(v)) => {
                if self.vars.env(v).is_none() && !out.contains(&v) {
                    out.push(v);
                }
            }
            Some(Term::Struct(_, args)) => {
                for a in args {
                    self.collect_query_vars(a, out);
                }
            }
            Some(Term::Cons(h, t)) => {
                self.collect_query_vars(h, out);
                self.collect_query_vars(t, out);
            }
            _ => {}
        }
    }

    /// Main loop: wake entries first, then recall, then regular tasks;
    /// when everything is dry, look for a split candidate. Returns when
    /// the computation is finished or deadlocked.
    pub fn run(&mut self) -> Result<(), WorkerError> {
        loop {
            self.bump_step()?;
            if let Some(a) = self.wake.pop_front() {
                self.process_wake(a)?;
                continue;
            }
            if let Some(c) = self.recall.pop_front() {
                self.process_recall(c)?;
                continue;
            }
            if let Some(task) = self.tasks.pop_front() {
                self.process_task(task)?;
                continue;
            }
            if self.try_split()? {
                continue;
            }
            break;
        }
        Ok(())
    }

    fn bump_step(&mut self) -> Result<(), WorkerError> {
        self.steps += 1;
        self.metrics.steps += 1;
        match self.max_steps {
            Some(max) if self.steps > max => Err(WorkerError::StepLimit),
            _ => Ok(()),
        }
    }

    // ========== queue processing ==========

    fn process_wake(&mut self, a: AndId) -> Result<(), WorkerError> {
        if self.tree.is_dead(a) {
            return Ok(());
        }
        self.metrics.wakes += 1;

        #[cfg(feature = "tracing")]
        trace!(andb = a.raw(), "wake");

        self.tree.and_mut(a).status = Status::Stable;
        if !self.refresh_unifiers(a)? {
            return Ok(());
        }
        self.refresh_constraints(a);
        self.try_andbox(a)
    }

    /// Re-examine deferred unifier entries whose variable has since been
    /// bound: the entry turns into an ordinary unification, which may bind
    /// locals, defer further, or expose a conflict that fails the box.
    fn refresh_unifiers(&mut self, a: AndId) -> Result<bool, WorkerError> {
        let needs_refresh = {
            let b = self.tree.and(a);
            b.unifiers.iter().any(|&(v, _)| self.vars.is_bound(v))
        };
        if !needs_refresh {
            return Ok(true);
        }

        let old = std::mem::take(&mut self.tree.and_mut(a).unifiers);
        let old_mark = self.tree.and(a).quiet_mark;
        let mut kept = Vec::with_capacity(old.len());
        let mut kept_mark = 0usize;

        for (i, (v, t)) in old.into_iter().enumerate() {
            if self.vars.is_bound(v) {
                let vt = self.terms.var(v);
                if !self.unify_in(a, vt, t) {
                    self.fail_andbox(a)?;
                    return Ok(false);
                }
            } else {
                if i < old_mark {
                    kept_mark += 1;
                }
                kept.push((v, t));
            }
        }

        // Re-unification above may have deferred new entries; they are
        // guard-time (noisy) and go after the kept head entries.
        let appended = std::mem::take(&mut self.tree.and_mut(a).unifiers);
        let b = self.tree.and_mut(a);
        b.unifiers = kept;
        b.unifiers.extend(appended);
        b.quiet_mark = kept_mark;
        Ok(true)
    }

    /// Move entailed constraints (variable now bound) back to the front of
    /// the goal queue, preserving their relative order.
    fn refresh_constraints(&mut self, a: AndId) {
        let drained: Vec<(TermId, VarId)> =
            self.tree.and_mut(a).constraints.drain(..).collect();
        let mut entailed = Vec::new();
        for (g, v) in drained {
            if self.vars.is_bound(v) {
                entailed.push(g);
            } else {
                self.tree.and_mut(a).constraints.push((g, v));
            }
        }
        for g in entailed.into_iter().rev() {
            self.tree.and_mut(a).goals.push_front(g);
        }
    }

    /// Recall: expand a choice-box's untried clauses against its original
    /// call. Rare; untried lists stay empty under eager expansion.
    fn process_recall(&mut self, c: ChoiceId) -> Result<(), WorkerError> {
        let Some(parent) = self.tree.choice(c).father else {
            return Ok(());
        };
        if self.tree.is_dead(parent) {
            return Ok(());
        }
        let untried = std::mem::take(&mut self.tree.choice_mut(c).untried);
        if untried.is_empty() {
            return Ok(());
        }
        let (Some((name, arity)), Some(goal)) =
            (self.tree.choice(c).predicate, self.tree.choice(c).call)
        else {
            return Ok(());
        };
        let clauses = self.program.clauses(name, arity).to_vec();
        let mut added = Vec::new();
        for idx in untried {
            if let Some(clause) = clauses.get(idx) {
                if let Some(child) = self.add_clause_alternative(c, parent, goal, clause) {
                    added.push(child);
                }
            }
        }
        if self.tree.choice(c).alternatives.is_empty() {
            self.tree.remove_choice(parent, c);
            self.fail_andbox(parent)?;
            return Ok(());
        }
        for child in added {
            self.wake.push_back(child);
        }
        Ok(())
    }

    fn process_task(&mut self, task: Task) -> Result<(), WorkerError> {
        match task {
            Task::Start => {
                let Some(rc) = self.root_choice else {
                    return Ok(());
                };
                for alt in self.tree.choice(rc).alternatives.clone() {
                    if !self.tree.is_dead(alt) {
                        self.try_andbox(alt)?;
                    }
                }
                Ok(())
            }
            Task::Promote(a) => {
                if !self.tree.is_dead(a) {
                    self.check_guard(a)?;
                }
                Ok(())
            }
            Task::Split(a) => {
                if self.tree.is_dead(a) {
                    return Ok(());
                }
                if let Some(candidate) = self.find_candidate(a) {
                    self.do_split(candidate)?;
                }
                Ok(())
            }
            Task::Root => Ok(()),
        }
    }

    // ========== goal processing ==========

    /// Make progress on an and-box: expand pending goals, then check the
    /// guard once the box is solved.
    fn try_andbox(&mut self, a: AndId) -> Result<(), WorkerError> {
        if self.tree.is_dead(a) {
            return Ok(());
        }

        while let Some(goal) = self.tree.and_mut(a).goals.pop_front() {
            match self.dispatch_goal(a, goal)? {
                GoalStep::Continue => {}
                GoalStep::Failed => {
                    self.fail_andbox(a)?;
                    return Ok(());
                }
            }
            if self.tree.is_dead(a) {
                return Ok(());
            }
        }

        if self.tree.is_solved(a) {
            self.check_guard(a)?;
        }
        Ok(())
    }

    fn dispatch_goal(&mut self, a: AndId, goal: TermId) -> Result<GoalStep, WorkerError> {
        let goal = deref(goal, self.terms, &self.vars);

        #[cfg(feature = "tracing")]
        trace!(andb = a.raw(), goal = goal.raw(), "goal");

        match self.terms.resolve(goal) {
            Some(Term::Atom(at)) => {
                let name = self.symbols.resolve(at).unwrap_or_default().to_string();
                if is_builtin(&name, 0) {
                    return self.dispatch_builtin(a, goal, &name, &[]);
                }
                self.expand_predicate(a, at, goal)
            }
            Some(Term::Struct(f, args)) => {
                if f == self.ctl.comma && args.len() == 2 {
                    let b = self.tree.and_mut(a);
                    b.goals.push_front(args[1]);
                    b.goals.push_front(args[0]);
                    return Ok(GoalStep::Continue);
                }
                if f == self.ctl.semicolon && args.len() == 2 {
                    let left = deref(args[0], self.terms, &self.vars);
                    if let Some(Term::Struct(lf, largs)) = self.terms.resolve(left) {
                        if lf == self.ctl.arrow && largs.len() == 2 {
                            return self.if_then_else(a, largs[0], largs[1], args[1]);
                        }
                    }
                    return self.expand_disjunction(a, args[0], args[1]);
                }
                if f == self.ctl.naf && args.len() == 1 {
                    return self.negation(a, args[0]);
                }
                let name = self.symbols.resolve(f).unwrap_or_default().to_string();
                if is_builtin(&name, args.len()) {
                    return self.dispatch_builtin(a, goal, &name, &args);
                }
                self.expand_predicate(a, f, goal)
            }
            // Numbers, list cells, and unbound variables are not callable.
            _ => Ok(GoalStep::Failed),
        }
    }

    fn dispatch_builtin(
        &mut self,
        a: AndId,
        goal: TermId,
        name: &str,
        args: &[TermId],
    ) -> Result<GoalStep, WorkerError> {
        let mut woken = Vec::new();
        let outcome = {
            let mut ctx = BuiltinCtx {
                terms: self.terms,
                symbols: self.symbols,
                envs: &self.envs,
                vars: &mut self.vars,
                trail: &mut self.trail,
                tree: &mut self.tree,
                woken: &mut woken,
                out: &mut self.out,
            };
            call_builtin(&mut ctx, name, a, args)
        };
        self.route_woken(woken);
        match outcome {
            BuiltinOutcome::Succeeded => Ok(GoalStep::Continue),
            BuiltinOutcome::Failed => Ok(GoalStep::Failed),
            BuiltinOutcome::Suspended(v) => {
                // Post the goal as a constraint on the variable; the box
                // stays quiescent-but-waiting until the binding arrives.
                self.metrics.suspensions += 1;
                self.tree.and_mut(a).constraints.push((goal, v));
                self.vars.suspend(v, Suspension::And(a));
                if self.tree.and(a).status != Status::Dead {
                    self.tree.and_mut(a).status = Status::XUnstable;
                }
                Ok(GoalStep::Continue)
            }
        }
    }

    /// Expand an atomic goal into a choice-box with one alternative per
    /// clause whose head unifies.
    fn expand_predicate(
        &mut self,
        a: AndId,
        name: crate::symbol::AtomId,
        goal: TermId,
    ) -> Result<GoalStep, WorkerError> {
        let arity = match self.terms.resolve(goal) {
            Some(Term::Struct(_, args)) => args.len(),
            _ => 0,
        };
        let clauses = self.program.clauses(name, arity);
        if clauses.is_empty() {
            return Ok(GoalStep::Failed);
        }
        self.metrics.expansions += 1;

        let guard_type = clauses[0].guard_type;
        let chb = self
            .tree
            .new_choice(Some(a), guard_type, Some((name, arity)));
        self.tree.and_mut(a).tried.push(chb);
        self.tree.choice_mut(chb).call = Some(goal);

        let clauses: Vec<crate::program::Clause> = clauses.to_vec();
        for clause in &clauses {
            self.add_clause_alternative(chb, a, goal, clause);
        }

        if self.tree.choice(chb).alternatives.is_empty() {
            self.tree.remove_choice(a, chb);
            return Ok(GoalStep::Failed);
        }

        for child in self.tree.choice(chb).alternatives.clone() {
            self.wake.push_back(child);
        }
        Ok(GoalStep::Continue)
    }

    /// Create one alternative for a clause: fresh child env, fresh
    /// variable set, immediate head unification in the child's context
    /// (externals defer, clause locals bind). Returns None if the head
    /// does not match.
    fn add_clause_alternative(
        &mut self,
        chb: ChoiceId,
        parent: AndId,
        goal: TermId,
        clause: &crate::program::Clause,
    ) -> Option<AndId> {
        let env = self.envs.fresh(Some(self.tree.and(parent).env));
        let child = self.tree.new_and(env, Some(chb), self.trail.position());
        self.tree.add_alternative(chb, child);

        let activation = crate::program::instantiate(clause, env, self.terms, &mut self.vars);
        self.tree
            .and_mut(child)
            .local_vars
            .extend(activation.fresh_vars.iter().copied());

        if !self.unify_in(child, goal, activation.head) {
            self.metrics.failures += 1;
            self.tree.mark_dead_subtree(child);
            self.tree.remove_alternative(chb, child);
            return None;
        }

        let mark = self.trail.position();
        let b = self.tree.and_mut(child);
        b.quiet_mark = b.unifiers.len();
        b.trail_mark = mark;
        if let Some(g) = activation.guard {
            b.goals.push_back(g);
        }
        b.body_goals = activation.body;
        Some(child)
    }

    /// `;/2` becomes a choice-box with two unguarded alternatives.
    fn expand_disjunction(
        &mut self,
        a: AndId,
        left: TermId,
        right: TermId,
    ) -> Result<GoalStep, WorkerError> {
        self.metrics.expansions += 1;
        let chb = self.tree.new_choice(Some(a), GuardType::None, None);
        self.tree.and_mut(a).tried.push(chb);
        for goal in [left, right] {
            let env = self.envs.fresh(Some(self.tree.and(a).env));
            let child = self.tree.new_and(env, Some(chb), self.trail.position());
            self.tree.add_alternative(chb, child);
            self.tree.and_mut(child).goals.push_back(goal);
            self.wake.push_back(child);
        }
        Ok(GoalStep::Continue)
    }

    /// `(Cond -> Then ; Else)`: run Cond in an isolated context; its
    /// bindings are discarded either way, then one branch is prepended.
    fn if_then_else(
        &mut self,
        a: AndId,
        cond: TermId,
        then: TermId,
        els: TermId,
    ) -> Result<GoalStep, WorkerError> {
        let succeeded = self.run_isolated(a, cond)?;
        let branch = if succeeded { then } else { els };
        self.tree.and_mut(a).goals.push_front(branch);
        Ok(GoalStep::Continue)
    }

    /// Negation as failure: succeed iff the goal has no solution; leak
    /// nothing regardless of outcome.
    fn negation(&mut self, a: AndId, goal: TermId) -> Result<GoalStep, WorkerError> {
        let succeeded = self.run_isolated(a, goal)?;
        if succeeded {
            Ok(GoalStep::Failed)
        } else {
            Ok(GoalStep::Continue)
        }
    }

    // ========== isolated sub-execution ==========

    fn push_context(&mut self) {
        self.contexts.push(ContextFrame {
            tasks: std::mem::take(&mut self.tasks),
            wake: std::mem::take(&mut self.wake),
            recall: std::mem::take(&mut self.recall),
            trail_pos: self.trail.position(),
            solutions_len: self.solutions.len(),
        });
    }

    fn pop_context(&mut self) {
        let frame = self.contexts.pop().expect("context underflow");
        self.trail.undo_to(frame.trail_pos, &mut self.vars);
        self.solutions.truncate(frame.solutions_len);
        self.tasks = frame.tasks;
        self.wake = frame.wake;
        self.recall = frame.recall;
    }

    /// Run a goal to its first solution in a detached root, with all four
    /// work streams isolated. The full worker loop applies, splitting
    /// included; a run that quiesces without a solved alternative counts
    /// as failure.
    fn run_isolated(&mut self, parent: AndId, goal: TermId) -> Result<bool, WorkerError> {
        self.push_context();

        let tc = self.tree.new_choice(None, GuardType::None, None);
        let env = self.envs.fresh(Some(self.tree.and(parent).env));
        let t = self.tree.new_and(env, Some(tc), self.trail.position());
        self.tree.add_alternative(tc, t);
        self.tree.and_mut(t).goals.push_back(goal);
        self.wake.push_back(t);

        let result = self.run_nested(tc);

        for alt in self.tree.choice(tc).alternatives.clone() {
            self.tree.mark_dead_subtree(alt);
        }
        self.pop_context();
        result
    }

    /// A box counts as an answer only when solved with every posted
    /// constraint entailed; a pending constraint is unfinished work that
    /// may still fail.
    fn answer_ready(&self, a: AndId) -> bool {
        self.tree.is_solved(a)
            && self
                .tree
                .and(a)
                .constraints
                .iter()
                .all(|&(_, v)| self.vars.is_bound(v))
    }

    fn nested_solved(&self, tc: ChoiceId) -> bool {
        self.tree
            .choice(tc)
            .alternatives
            .iter()
            .any(|&alt| !self.tree.is_dead(alt) && self.answer_ready(alt))
    }

    fn run_nested(&mut self, tc: ChoiceId) -> Result<bool, WorkerError> {
        loop {
            if self.nested_solved(tc) {
                return Ok(true);
            }
            self.bump_step()?;
            if let Some(a) = self.wake.pop_front() {
                self.process_wake(a)?;
                continue;
            }
            if let Some(c) = self.recall.pop_front() {
                self.process_recall(c)?;
                continue;
            }
            if let Some(task) = self.tasks.pop_front() {
                self.process_task(task)?;
                continue;
            }
            // quiescent: try splitting inside the detached root
            let mut split = false;
            for alt in self.tree.choice(tc).alternatives.clone() {
                if self.tree.is_dead(alt) || self.tree.is_solved(alt) {
                    continue;
                }
                if let Some(candidate) = self.find_candidate(alt) {
                    self.do_split(candidate)?;
                    split = true;
                    break;
                }
            }
            if !split {
                return Ok(self.nested_solved(tc));
            }
        }
    }

    // ========== guards and promotion ==========

    /// Guard dispatch for a solved box, per the guard table.
    fn check_guard(&mut self, a: AndId) -> Result<(), WorkerError> {
        if self.tree.is_dead(a) || !self.tree.is_solved(a) {
            return Ok(());
        }
        let Some(c) = self.tree.and(a).father else {
            return Ok(());
        };

        let Some(p) = self.tree.choice(c).father else {
            // Root level: a solved alternative of the driver's root
            // choice-box is a solution, unless a constraint is still
            // pending (the box stays suspended; an unbound constraint
            // variable is a deadlock, not an answer). Detached (isolated)
            // roots are read by their nested loop instead.
            if Some(c) == self.root_choice {
                if self.answer_ready(a) {
                    self.record_solution(a, c);
                } else {
                    self.tree.and_mut(a).status = Status::XStable;
                }
            }
            return Ok(());
        };

        let gt = self.tree.choice(c).guard_type;
        let quiet = self.tree.is_quiet(a, &self.vars);
        let empty_trail = self.empty_trail(a);
        let leftmost = self.tree.is_leftmost(c, a);
        let last = self.tree.is_last(c, a);
        let qet = quiet && empty_trail;

        let (promote, prune) = match gt {
            GuardType::None | GuardType::Wait => (last, Prune::No),
            GuardType::QuietWait => (qet && leftmost, Prune::Right),
            GuardType::Commit => (qet, Prune::All),
            GuardType::Arrow => (qet && leftmost, Prune::Right),
            GuardType::Cut => ((qet && leftmost) || last, Prune::Right),
        };

        #[cfg(feature = "tracing")]
        debug!(
            andb = a.raw(),
            guard = ?gt,
            quiet = quiet,
            leftmost = leftmost,
            last = last,
            promote = promote,
            "guard_check"
        );

        if promote {
            self.prune_siblings(a, c, prune)?;
            self.promote(a, c, p)?;
        } else {
            self.tree.and_mut(a).status = if quiet { Status::Stable } else { Status::XStable };
        }
        Ok(())
    }

    /// `EmptyTrail`: the box's trail segment holds no binding, owned by
    /// its own subtree, of a variable external to it. The unify discipline
    /// never binds externals directly, so this guards an invariant more
    /// than it branches.
    fn empty_trail(&self, a: AndId) -> bool {
        let mark = self.tree.and(a).trail_mark;
        let env = self.tree.and(a).env;
        self.trail.entries_since(mark).iter().all(|e| {
            !(self.tree.is_in_subtree(e.owner, a)
                && self.envs.is_external(self.vars.env(e.var), env))
        })
    }

    fn prune_siblings(&mut self, a: AndId, c: ChoiceId, prune: Prune) -> Result<(), WorkerError> {
        if matches!(prune, Prune::No) {
            return Ok(());
        }
        let alts = self.tree.choice(c).alternatives.clone();
        let my_pos = alts.iter().position(|&x| x == a).ok_or_else(|| {
            WorkerError::Invariant("pruning box absent from its choice-box".into())
        })?;
        for (i, &sib) in alts.iter().enumerate() {
            if sib == a {
                continue;
            }
            if matches!(prune, Prune::Right) && i < my_pos {
                continue;
            }
            self.kill_subtree(sib);
            self.tree.remove_alternative(c, sib);
        }
        self.tree.choice_mut(c).untried.clear();
        Ok(())
    }

    /// Mark a subtree dead and undo the bindings it contributed.
    fn kill_subtree(&mut self, root: AndId) {
        let from = self.tree.and(root).trail_mark;
        self.tree.mark_dead_subtree(root);
        let tree = &self.tree;
        self.trail
            .undo_owned_since(from, &mut self.vars, |owner| tree.is_in_subtree(owner, root));
    }

    /// Promotion: splice a solved box's body and bindings into the parent
    /// of its choice-box.
    fn promote(&mut self, a: AndId, c: ChoiceId, p: AndId) -> Result<(), WorkerError> {
        self.metrics.promotions += 1;

        #[cfg(feature = "tracing")]
        debug!(from = a.raw(), into = p.raw(), "promote");

        // 1. Re-home local variables: they now belong to the parent, so
        // bindings of them become observable there. Terms need no rewrite;
        // locality lives in the variable cells.
        let rehomed = std::mem::take(&mut self.tree.and_mut(a).local_vars);
        let p_env = self.tree.and(p).env;
        for &v in &rehomed {
            self.vars.set_env(v, Some(p_env));
            self.tree.and_mut(p).local_vars.push(v);
        }

        // 2. Discharge deferred unifiers: bind what is now in scope,
        // re-defer what is still external to the parent.
        let unifiers = std::mem::take(&mut self.tree.and_mut(a).unifiers);
        for (v, t) in unifiers {
            let t = deref(t, self.terms, &self.vars);
            if self.envs.is_external(self.vars.env(v), p_env) {
                self.tree.and_mut(p).unifiers.push((v, t));
                self.vars.suspend(v, Suspension::And(p));
                self.metrics.deferrals += 1;
            } else {
                let vt = self.terms.var(v);
                if !self.unify_in(p, vt, t) {
                    // Conflicting deferrals surface here; the parent dies.
                    self.fail_andbox(p)?;
                    return Ok(());
                }
            }
        }

        // 3. Propagate constraints; entailed ones are re-posted as goals.
        let constraints = std::mem::take(&mut self.tree.and_mut(a).constraints);
        let mut entailed = Vec::new();
        for (g, v) in constraints {
            if self.vars.is_bound(v) {
                entailed.push(g);
            } else {
                self.tree.and_mut(p).constraints.push((g, v));
                self.vars.suspend(v, Suspension::And(p));
            }
        }
        for g in entailed.into_iter().rev() {
            self.tree.and_mut(p).goals.push_front(g);
        }

        // 4. Splice body goals at the front: inner goals run before the
        // outer continuation.
        let body = std::mem::take(&mut self.tree.and_mut(a).body_goals);
        for g in body.into_iter().rev() {
            self.tree.and_mut(p).goals.push_front(g);
        }

        // 5. Delink the promoted box; drop the choice-box once empty.
        self.tree.remove_alternative(c, a);
        self.tree.and_mut(a).status = Status::Dead;
        if self.tree.choice(c).alternatives.is_empty() && self.tree.choice(c).untried.is_empty() {
            self.tree.remove_choice(p, c);
        }

        // 6. Wake the parent, and anything waiting on a variable whose
        // binding just became observable.
        let mut woken = Vec::new();
        for &v in &rehomed {
            if self.vars.is_bound(v) && self.vars.has_suspensions(v) {
                woken.extend(self.vars.take_suspensions(v));
            }
        }
        self.route_woken(woken);
        if !self.tree.is_dead(p) {
            self.wake.push_back(p);
        }
        Ok(())
    }

    // ========== failure ==========

    /// Failure: mark the box dead, undo its trail contributions, release
    /// it from its choice-box, and propagate per the disjunction rules.
    fn fail_andbox(&mut self, a: AndId) -> Result<(), WorkerError> {
        if self.tree.is_dead(a) {
            return Ok(());
        }
        self.metrics.failures += 1;

        #[cfg(feature = "tracing")]
        trace!(andb = a.raw(), "fail");

        self.kill_subtree(a);

        let Some(c) = self.tree.and(a).father else {
            return Ok(());
        };
        self.tree.remove_alternative(c, a);

        if self.tree.choice(c).alternatives.is_empty() {
            if !self.tree.choice(c).untried.is_empty() {
                self.recall.push_back(c);
                return Ok(());
            }
            match self.tree.choice(c).father {
                Some(p) => {
                    self.tree.remove_choice(p, c);
                    self.fail_andbox(p)?;
                }
                None => {
                    // Root-level alternative exhausted; nothing above it.
                }
            }
        } else if self.tree.is_determinate(c) {
            // The survivor may now satisfy its guard.
            let survivor = self.tree.choice(c).alternatives[0];
            self.wake.push_back(survivor);
        }
        Ok(())
    }

    // ========== splitting ==========

    /// Candidate search: depth first, left to right, deepest first. A
    /// candidate is a solved box that is the leftmost alternative of a
    /// NONE- or WAIT-guarded, non-determinate choice-box.
    fn find_candidate(&self, a: AndId) -> Option<AndId> {
        for &c in &self.tree.and(a).tried {
            let guard_ok = matches!(
                self.tree.choice(c).guard_type,
                GuardType::None | GuardType::Wait
            );
            for &alt in &self.tree.choice(c).alternatives {
                if self.tree.is_dead(alt) {
                    continue;
                }
                if let Some(deep) = self.find_candidate(alt) {
                    return Some(deep);
                }
                if guard_ok
                    && self.tree.is_solved(alt)
                    && self.tree.is_leftmost(c, alt)
                    && !self.tree.is_determinate(c)
                {
                    return Some(alt);
                }
            }
        }
        None
    }

    /// Split at a candidate: copy the mother subtree, keep only the
    /// candidate in the copy's fork, drop the candidate from the original,
    /// and promote the copy.
    fn do_split(&mut self, candidate: AndId) -> Result<(), WorkerError> {
        let fork = self
            .tree
            .and(candidate)
            .father
            .ok_or_else(|| WorkerError::Invariant("split candidate without a fork".into()))?;
        let mother = self
            .tree
            .choice(fork)
            .father
            .ok_or_else(|| WorkerError::Invariant("split fork without a mother".into()))?;
        let parent_choice = self
            .tree
            .and(mother)
            .father
            .ok_or_else(|| WorkerError::Invariant("split mother without a parent".into()))?;

        self.metrics.splits += 1;

        #[cfg(feature = "tracing")]
        debug!(
            candidate = candidate.raw(),
            mother = mother.raw(),
            "split"
        );

        let fork_idx = self
            .tree
            .and(mother)
            .tried
            .iter()
            .position(|&c| c == fork)
            .ok_or_else(|| WorkerError::Invariant("fork not among mother's tried".into()))?;
        let cand_idx = self
            .tree
            .choice(fork)
            .alternatives
            .iter()
            .position(|&x| x == candidate)
            .ok_or_else(|| WorkerError::Invariant("candidate not in its fork".into()))?;

        // 1. Copy the mother subtree; externals stay shared.
        let outcome = {
            let mut ctx = CopyCtx {
                terms: self.terms,
                envs: &mut self.envs,
                vars: &mut self.vars,
                tree: &mut self.tree,
            };
            copy_subtree(&mut ctx, mother, self.trail.position())
        };
        self.metrics.copied_boxes += outcome.boxes_copied;
        let mother_copy = outcome.root;

        // 2. In the copy, retain only the candidate's image.
        let fork_copy = self.tree.and(mother_copy).tried[fork_idx];
        let cand_copy = self.tree.choice(fork_copy).alternatives[cand_idx];
        for alt in self.tree.choice(fork_copy).alternatives.clone() {
            if alt != cand_copy {
                self.tree.mark_dead_subtree(alt);
                self.tree.remove_alternative(fork_copy, alt);
            }
        }
        self.tree.choice_mut(fork_copy).untried.clear();

        // In the original, the candidate moves wholly into the copy.
        self.tree.remove_alternative(fork, candidate);
        self.tree.mark_dead_subtree(candidate);

        // 3. The copy becomes the left sibling of the mother.
        self.tree.and_mut(mother_copy).father = Some(parent_choice);
        let mother_pos = self
            .tree
            .choice(parent_choice)
            .alternatives
            .iter()
            .position(|&x| x == mother)
            .ok_or_else(|| WorkerError::Invariant("mother not in its parent choice".into()))?;
        self.tree
            .choice_mut(parent_choice)
            .alternatives
            .insert(mother_pos, mother_copy);

        // 4. Promote the copied candidate, now alone in its fork. The copy
        // is the left sibling, so its promotion is scheduled first to keep
        // solutions in sibling order.
        self.tasks.push_back(Task::Promote(cand_copy));

        // 5. The original fork may have collapsed to determinacy.
        if self.tree.is_determinate(fork) {
            let survivor = self.tree.choice(fork).alternatives[0];
            if self.tree.is_solved(survivor) {
                self.tasks.push_back(Task::Promote(survivor));
            } else {
                self.wake.push_back(survivor);
            }
        } else if self.tree.and(mother).status.is_stable() {
            self.tasks.push_back(Task::Split(mother));
        }
        Ok(())
    }

    /// Split search across the root alternatives when everything is dry.
    fn try_split(&mut self) -> Result<bool, WorkerError> {
        let Some(rc) = self.root_choice else {
            return Ok(false);
        };
        for alt in self.tree.choice(rc).alternatives.clone() {
            if self.tree.is_dead(alt) || self.tree.is_solved(alt) {
                continue;
            }
            if let Some(candidate) = self.find_candidate(alt) {
                self.do_split(candidate)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    // ========== solutions ==========

    /// Record a solved root alternative: discharge its pending unifiers
    /// against the shared query variables just long enough to reflect the
    /// bindings, then put everything back so sibling branches see the
    /// query variables unbound.
    fn record_solution(&mut self, a: AndId, root: ChoiceId) {
        let entries = self.tree.and(a).unifiers.clone();
        let mut undo = Vec::new();
        let mut consistent = true;
        for (v, t) in entries {
            let vt = self.terms.var(v);
            if !trial_unify(self.terms, &mut self.vars, vt, t, &mut undo) {
                consistent = false;
                break;
            }
        }

        if consistent {
            let mut bindings = Vec::new();
            for (name, v) in self.query_vars.clone() {
                let vt = self.terms.var(v);
                let d = deref(vt, self.terms, &self.vars);
                if d != vt {
                    let snapshot = self.reflect(d);
                    bindings.push((name, snapshot));
                }
            }
            self.solutions.push(bindings);
            self.metrics.solutions += 1;

            #[cfg(feature = "tracing")]
            debug!(count = self.solutions.len(), "solution");
        }

        for v in undo {
            self.vars.set_binding(v, None);
        }

        self.tree.and_mut(a).status = Status::Dead;
        self.tree.remove_alternative(root, a);
    }

    /// Deep snapshot of a term: bindings followed, remaining unbound
    /// variables replaced by fresh ones with unique display names.
    fn reflect(&mut self, term: TermId) -> TermId {
        let term = deref(term, self.terms, &self.vars);
        match self.terms.resolve(term) {
            Some(Term::Var(_)) => {
                let fresh = self.vars.fresh_anon(None);
                self.terms.var(fresh)
            }
            Some(Term::Struct(f, args)) => {
                let new_args: smallvec::SmallVec<[TermId; 4]> =
                    args.iter().map(|&t| self.reflect(t)).collect();
                self.terms.compound(f, new_args)
            }
            Some(Term::Cons(h, t)) => {
                let nh = self.reflect(h);
                let nt = self.reflect(t);
                self.terms.cons(nh, nt)
            }
            _ => term,
        }
    }

    // ========== plumbing ==========

    fn unify_in(&mut self, a: AndId, t1: TermId, t2: TermId) -> bool {
        self.metrics.unifications += 1;
        let before = self.tree.and(a).unifiers.len();
        let mut woken = Vec::new();
        let ok = {
            let mut ctx = UnifyCtx {
                terms: self.terms,
                envs: &self.envs,
                vars: &mut self.vars,
                trail: &mut self.trail,
                tree: &mut self.tree,
                woken: &mut woken,
            };
            unify(&mut ctx, t1, t2, a)
        };
        self.route_woken(woken);
        if ok {
            let after = self.tree.and(a).unifiers.len();
            self.metrics.deferrals += (after - before) as u64;
        }
        ok
    }

    fn route_woken(&mut self, woken: Vec<Suspension>) {
        for s in woken {
            match s {
                Suspension::And(a) => {
                    if !self.tree.is_dead(a) {
                        self.tree.and_mut(a).status = Status::Unstable;
                        self.wake.push_back(a);
                    }
                }
                Suspension::Choice(c) => self.recall.push_back(c),
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Prune {
    No,
    Right,
    All,
}
