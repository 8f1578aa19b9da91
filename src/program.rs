//! Loaded programs: clauses, guard operators, and predicate lookup.
//!
//! The surface parser and clause compiler are external; this module is the
//! interface they feed. A clause arrives pre-split into head, guard, guard
//! type, and body, together with the variables it mentions so each
//! activation can be instantiated with a fresh variable set.

use crate::env::EnvId;
use crate::symbol::AtomId;
use crate::term::{Term, TermId, TermStore};
use crate::var::{VarId, VarStore};
use hashbrown::HashMap;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

/// Guard operator of a clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuardType {
    /// Clause without a guard operator.
    None,
    /// `?` - noisy wait.
    Wait,
    /// `??` - quiet ordered wait.
    QuietWait,
    /// `->` - conditional.
    Arrow,
    /// `|` - quiet commit.
    Commit,
    /// `!` - noisy cut.
    Cut,
}

impl GuardType {
    /// Surface operator mapping (`?`, `??`, `->`, `|`, `!`).
    pub fn from_operator(op: &str) -> Option<GuardType> {
        match op {
            "?" => Some(GuardType::Wait),
            "??" => Some(GuardType::QuietWait),
            "->" => Some(GuardType::Arrow),
            "|" => Some(GuardType::Commit),
            "!" => Some(GuardType::Cut),
            _ => None,
        }
    }

    /// Quiet guards forbid external bindings during guard execution.
    pub fn is_quiet(self) -> bool {
        matches!(self, GuardType::QuietWait | GuardType::Arrow | GuardType::Commit)
    }

    /// Pruning guards remove other alternatives on commit.
    pub fn is_pruning(self) -> bool {
        matches!(
            self,
            GuardType::QuietWait | GuardType::Arrow | GuardType::Commit | GuardType::Cut
        )
    }
}

/// A compiled clause. Head, guard, and body share the variables listed in
/// `vars`; instantiation renames them all consistently.
#[derive(Debug, Clone)]
pub struct Clause {
    pub head: TermId,
    pub guard: Option<TermId>,
    pub guard_type: GuardType,
    pub body: Vec<TermId>,
    pub vars: Vec<VarId>,
}

/// All clauses for one functor/arity.
#[derive(Debug, Clone, Default)]
pub struct Predicate {
    pub clauses: Vec<Clause>,
}

/// A database of predicates keyed by (name, arity).
#[derive(Debug, Default)]
pub struct Program {
    predicates: HashMap<(AtomId, usize), Predicate>,
}

impl Program {
    pub fn new() -> Self {
        Self {
            predicates: HashMap::new(),
        }
    }

    pub fn add_clause(&mut self, name: AtomId, arity: usize, clause: Clause) {
        self.predicates
            .entry((name, arity))
            .or_default()
            .clauses
            .push(clause);
    }

    pub fn lookup(&self, name: AtomId, arity: usize) -> Option<&Predicate> {
        self.predicates.get(&(name, arity))
    }

    pub fn clauses(&self, name: AtomId, arity: usize) -> &[Clause] {
        self.lookup(name, arity)
            .map(|p| p.clauses.as_slice())
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.predicates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }
}

/// Collect the distinct variables of a term, left to right, without
/// following bindings. Used by clause construction.
pub fn collect_vars(term: TermId, terms: &TermStore, out: &mut Vec<VarId>) {
    match terms.resolve(term) {
        Some(Term::Var(v)) => {
            if !out.contains(&v) {
                out.push(v);
            }
        }
        Some(Term::Struct(_, args)) => {
            for a in args {
                collect_vars(a, terms, out);
            }
        }
        Some(Term::Cons(h, t)) => {
            collect_vars(h, terms, out);
            collect_vars(t, terms, out);
        }
        _ => {}
    }
}

/// An instantiated clause activation: fresh head, guard, and body.
#[derive(Debug)]
pub struct Activation {
    pub head: TermId,
    pub guard: Option<TermId>,
    pub body: Vec<TermId>,
    pub fresh_vars: Vec<VarId>,
}

/// Instantiate a clause with a fresh variable set local to `env`.
///
/// Every variable in the clause's `vars` list maps to one fresh variable,
/// so repeated occurrences stay shared within the activation; variables
/// never in the list (there are none in well-formed clauses) fall back to
/// per-occurrence fresh cells, which is the anonymous-variable rule.
pub fn instantiate(
    clause: &Clause,
    env: EnvId,
    terms: &TermStore,
    vars: &mut VarStore,
) -> Activation {
    let mut map: FxHashMap<VarId, VarId> = FxHashMap::default();
    let mut fresh_vars = Vec::with_capacity(clause.vars.len());
    for &v in &clause.vars {
        let name = vars.name(v).to_string();
        let fresh = vars.fresh(&name, Some(env));
        map.insert(v, fresh);
        fresh_vars.push(fresh);
    }

    let head = rename(clause.head, &map, env, terms, vars, &mut fresh_vars);
    let guard = clause
        .guard
        .map(|g| rename(g, &map, env, terms, vars, &mut fresh_vars));
    let body = clause
        .body
        .iter()
        .map(|&b| rename(b, &map, env, terms, vars, &mut fresh_vars))
        .collect();

    Activation {
        head,
        guard,
        body,
        fresh_vars,
    }
}

fn rename(
    term: TermId,
    map: &FxHashMap<VarId, VarId>,
    env: EnvId,
    terms: &TermStore,
    vars: &mut VarStore,
    fresh_vars: &mut Vec<VarId>,
) -> TermId {
    match terms.resolve(term) {
        Some(Term::Var(v)) => {
            let mapped = match map.get(&v) {
                Some(&m) => m,
                None => {
                    let fresh = vars.fresh_anon(Some(env));
                    fresh_vars.push(fresh);
                    fresh
                }
            };
            terms.var(mapped)
        }
        Some(Term::Struct(f, args)) => {
            let new_args: SmallVec<[TermId; 4]> = args
                .iter()
                .map(|&a| rename(a, map, env, terms, vars, fresh_vars))
                .collect();
            terms.compound(f, new_args)
        }
        Some(Term::Cons(h, t)) => {
            let nh = rename(h, map, env, terms, vars, fresh_vars);
            let nt = rename(t, map, env, terms, vars, fresh_vars);
            terms.cons(nh, nt)
        }
        _ => term,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::EnvStore;
    use crate::symbol::SymbolStore;

    #[test]
    fn operator_mapping() {
        assert_eq!(GuardType::from_operator("?"), Some(GuardType::Wait));
        assert_eq!(GuardType::from_operator("??"), Some(GuardType::QuietWait));
        assert_eq!(GuardType::from_operator("->"), Some(GuardType::Arrow));
        assert_eq!(GuardType::from_operator("|"), Some(GuardType::Commit));
        assert_eq!(GuardType::from_operator("!"), Some(GuardType::Cut));
        assert_eq!(GuardType::from_operator(":-"), None);
    }

    #[test]
    fn guard_classes() {
        assert!(GuardType::QuietWait.is_quiet());
        assert!(GuardType::Commit.is_quiet());
        assert!(GuardType::Arrow.is_quiet());
        assert!(!GuardType::Wait.is_quiet());
        assert!(!GuardType::Cut.is_quiet());

        assert!(GuardType::Cut.is_pruning());
        assert!(!GuardType::Wait.is_pruning());
        assert!(!GuardType::None.is_pruning());
    }

    #[test]
    fn lookup_by_name_and_arity() {
        let symbols = SymbolStore::new();
        let terms = TermStore::new();
        let mut program = Program::new();
        let p = symbols.intern("p");

        let head = terms.atom(p);
        program.add_clause(
            p,
            0,
            Clause {
                head,
                guard: None,
                guard_type: GuardType::None,
                body: vec![],
                vars: vec![],
            },
        );

        assert_eq!(program.clauses(p, 0).len(), 1);
        assert!(program.clauses(p, 1).is_empty(), "arity is part of the key");
    }

    #[test]
    fn instantiation_shares_repeated_vars_and_freshens_each_activation() {
        let symbols = SymbolStore::new();
        let terms = TermStore::new();
        let mut vars = VarStore::new();
        let mut envs = EnvStore::new();
        let env = envs.fresh(None);

        // p(X, X) :- q(X).
        let p = symbols.intern("p");
        let q = symbols.intern("q");
        let x = vars.fresh("X", None);
        let xt = terms.var(x);
        let head = terms.compound2(p, xt, xt);
        let body = vec![terms.compound1(q, xt)];
        let clause = Clause {
            head,
            guard: None,
            guard_type: GuardType::None,
            body,
            vars: vec![x],
        };

        let act1 = instantiate(&clause, env, &terms, &mut vars);
        let act2 = instantiate(&clause, env, &terms, &mut vars);

        let head_args = match terms.resolve(act1.head) {
            Some(Term::Struct(_, args)) => args,
            other => panic!("expected compound head, got {:?}", other),
        };
        assert_eq!(
            head_args[0], head_args[1],
            "repeated X shares one fresh variable within an activation"
        );
        assert_ne!(
            act1.head, act2.head,
            "each activation gets its own variable set"
        );
        assert_eq!(act1.fresh_vars.len(), 1);
        assert_eq!(vars.env(act1.fresh_vars[0]), Some(env));
    }

    #[test]
    fn unlisted_vars_are_fresh_per_occurrence() {
        let symbols = SymbolStore::new();
        let terms = TermStore::new();
        let mut vars = VarStore::new();
        let mut envs = EnvStore::new();
        let env = envs.fresh(None);

        // p(_, _) with the anonymous variable appearing twice as one cell
        // left out of the clause var list: each occurrence must freshen.
        let p = symbols.intern("p");
        let anon = vars.fresh("_", None);
        let at = terms.var(anon);
        let head = terms.compound2(p, at, at);
        let clause = Clause {
            head,
            guard: None,
            guard_type: GuardType::None,
            body: vec![],
            vars: vec![],
        };

        let act = instantiate(&clause, env, &terms, &mut vars);
        let args = match terms.resolve(act.head) {
            Some(Term::Struct(_, args)) => args,
            other => panic!("expected compound head, got {:?}", other),
        };
        assert_ne!(args[0], args[1], "every `_` occurrence is a fresh variable");
    }

    #[test]
    fn collect_vars_is_ordered_and_deduped() {
        let symbols = SymbolStore::new();
        let terms = TermStore::new();
        let mut vars = VarStore::new();
        let f = symbols.intern("f");
        let x = vars.fresh("X", None);
        let y = vars.fresh("Y", None);
        let t = terms.compound2(f, terms.var(x), terms.cons(terms.var(y), terms.var(x)));
        let mut out = Vec::new();
        collect_vars(t, &terms, &mut out);
        assert_eq!(out, vec![x, y]);
    }
}
