//! Built-in predicates.
//!
//! A built-in runs in the context of an and-box and reports one of three
//! outcomes: succeeded, failed, or suspended on a variable. Built-ins
//! respect the local/external discipline by going through `unify`, never
//! binding variables directly; arithmetic over an unbound variable
//! suspends (the goal is re-posted as a constraint by the worker), while a
//! bound non-numeric argument is a domain violation and fails.

use crate::env::EnvStore;
use crate::symbol::SymbolStore;
use crate::term::{format_term, Term, TermId, TermStore};
use crate::trail::Trail;
use crate::tree::{AndId, Tree};
use crate::unify::{deref, unify, UnifyCtx};
use crate::var::{Suspension, VarId, VarStore};

/// Result of invoking a built-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinOutcome {
    Succeeded,
    Failed,
    /// Re-post the goal as a constraint on this variable.
    Suspended(VarId),
}

/// State a built-in may touch.
pub struct BuiltinCtx<'a> {
    pub terms: &'a TermStore,
    pub symbols: &'a SymbolStore,
    pub envs: &'a EnvStore,
    pub vars: &'a mut VarStore,
    pub trail: &'a mut Trail,
    pub tree: &'a mut Tree,
    pub woken: &'a mut Vec<Suspension>,
    /// Captured `write/1` output.
    pub out: &'a mut String,
}

/// Whether a name/arity pair is a built-in.
pub fn is_builtin(name: &str, arity: usize) -> bool {
    matches!(
        (name, arity),
        ("true", 0)
            | ("fail", 0)
            | ("false", 0)
            | ("=", 2)
            | ("\\=", 2)
            | ("==", 2)
            | ("\\==", 2)
            | ("is", 2)
            | ("<", 2)
            | (">", 2)
            | ("=<", 2)
            | (">=", 2)
            | ("=:=", 2)
            | ("=\\=", 2)
            | ("var", 1)
            | ("nonvar", 1)
            | ("atom", 1)
            | ("number", 1)
            | ("integer", 1)
            | ("float", 1)
            | ("compound", 1)
            | ("write", 1)
            | ("writeln", 1)
            | ("nl", 0)
    )
}

/// Invoke a built-in. The caller has already matched `is_builtin`.
pub fn call_builtin(
    ctx: &mut BuiltinCtx,
    name: &str,
    andb: AndId,
    args: &[TermId],
) -> BuiltinOutcome {
    match (name, args.len()) {
        ("true", 0) => BuiltinOutcome::Succeeded,
        ("fail", 0) | ("false", 0) => BuiltinOutcome::Failed,

        ("=", 2) => {
            let mut uctx = UnifyCtx {
                terms: ctx.terms,
                envs: ctx.envs,
                vars: &mut *ctx.vars,
                trail: &mut *ctx.trail,
                tree: &mut *ctx.tree,
                woken: &mut *ctx.woken,
            };
            if unify(&mut uctx, args[0], args[1], andb) {
                BuiltinOutcome::Succeeded
            } else {
                BuiltinOutcome::Failed
            }
        }

        ("\\=", 2) => {
            // Trial unification with no deferral and no suspension side
            // effects; bindings are taken back before returning.
            let mut undo = Vec::new();
            let unifiable = trial_unify(ctx.terms, ctx.vars, args[0], args[1], &mut undo);
            for v in undo {
                ctx.vars.set_binding(v, None);
            }
            if unifiable {
                BuiltinOutcome::Failed
            } else {
                BuiltinOutcome::Succeeded
            }
        }

        ("==", 2) => bool_outcome(identical(ctx.terms, ctx.vars, args[0], args[1])),
        ("\\==", 2) => bool_outcome(!identical(ctx.terms, ctx.vars, args[0], args[1])),

        ("is", 2) => match eval_arith(ctx.terms, ctx.symbols, ctx.vars, args[1]) {
            Ok(num) => {
                let value = match num {
                    Num::Int(i) => ctx.terms.int(i),
                    Num::Float(f) => ctx.terms.float(f),
                };
                let mut uctx = UnifyCtx {
                    terms: ctx.terms,
                    envs: ctx.envs,
                    vars: &mut *ctx.vars,
                    trail: &mut *ctx.trail,
                    tree: &mut *ctx.tree,
                    woken: &mut *ctx.woken,
                };
                bool_outcome(unify(&mut uctx, args[0], value, andb))
            }
            Err(ArithStop::Unbound(v)) => BuiltinOutcome::Suspended(v),
            Err(ArithStop::Domain) => BuiltinOutcome::Failed,
        },

        ("<", 2) | (">", 2) | ("=<", 2) | (">=", 2) | ("=:=", 2) | ("=\\=", 2) => {
            let lhs = match eval_arith(ctx.terms, ctx.symbols, ctx.vars, args[0]) {
                Ok(n) => n,
                Err(ArithStop::Unbound(v)) => return BuiltinOutcome::Suspended(v),
                Err(ArithStop::Domain) => return BuiltinOutcome::Failed,
            };
            let rhs = match eval_arith(ctx.terms, ctx.symbols, ctx.vars, args[1]) {
                Ok(n) => n,
                Err(ArithStop::Unbound(v)) => return BuiltinOutcome::Suspended(v),
                Err(ArithStop::Domain) => return BuiltinOutcome::Failed,
            };
            let (a, b) = (lhs.as_f64(), rhs.as_f64());
            bool_outcome(match name {
                "<" => a < b,
                ">" => a > b,
                "=<" => a <= b,
                ">=" => a >= b,
                "=:=" => a == b,
                _ => a != b,
            })
        }

        ("var", 1) => bool_outcome(is_unbound_var(ctx.terms, ctx.vars, args[0])),
        ("nonvar", 1) => bool_outcome(!is_unbound_var(ctx.terms, ctx.vars, args[0])),

        ("atom", 1) => bool_outcome(matches!(
            resolve_deref(ctx.terms, ctx.vars, args[0]),
            Some(Term::Atom(_))
        )),
        ("number", 1) => bool_outcome(matches!(
            resolve_deref(ctx.terms, ctx.vars, args[0]),
            Some(Term::Int(_)) | Some(Term::Float(_))
        )),
        ("integer", 1) => bool_outcome(matches!(
            resolve_deref(ctx.terms, ctx.vars, args[0]),
            Some(Term::Int(_))
        )),
        ("float", 1) => bool_outcome(matches!(
            resolve_deref(ctx.terms, ctx.vars, args[0]),
            Some(Term::Float(_))
        )),
        ("compound", 1) => bool_outcome(matches!(
            resolve_deref(ctx.terms, ctx.vars, args[0]),
            Some(Term::Struct(_, _)) | Some(Term::Cons(_, _))
        )),

        ("write", 1) => {
            match format_term(args[0], ctx.terms, ctx.symbols, ctx.vars) {
                Ok(s) => ctx.out.push_str(&s),
                Err(_) => return BuiltinOutcome::Failed,
            }
            BuiltinOutcome::Succeeded
        }
        ("writeln", 1) => {
            match format_term(args[0], ctx.terms, ctx.symbols, ctx.vars) {
                Ok(s) => {
                    ctx.out.push_str(&s);
                    ctx.out.push('\n');
                }
                Err(_) => return BuiltinOutcome::Failed,
            }
            BuiltinOutcome::Succeeded
        }
        ("nl", 0) => {
            ctx.out.push('\n');
            BuiltinOutcome::Succeeded
        }

        _ => BuiltinOutcome::Failed,
    }
}

fn bool_outcome(b: bool) -> BuiltinOutcome {
    if b {
        BuiltinOutcome::Succeeded
    } else {
        BuiltinOutcome::Failed
    }
}

fn resolve_deref(terms: &TermStore, vars: &VarStore, t: TermId) -> Option<Term> {
    terms.resolve(deref(t, terms, vars))
}

fn is_unbound_var(terms: &TermStore, vars: &VarStore, t: TermId) -> bool {
    matches!(resolve_deref(terms, vars, t), Some(Term::Var(_)))
}

/// Structural identity without binding anything.
fn identical(terms: &TermStore, vars: &VarStore, a: TermId, b: TermId) -> bool {
    let a = deref(a, terms, vars);
    let b = deref(b, terms, vars);
    if a == b {
        return true;
    }
    match (terms.resolve(a), terms.resolve(b)) {
        (Some(Term::Struct(f1, args1)), Some(Term::Struct(f2, args2))) => {
            f1 == f2
                && args1.len() == args2.len()
                && args1
                    .iter()
                    .zip(args2.iter())
                    .all(|(&x, &y)| identical(terms, vars, x, y))
        }
        (Some(Term::Cons(h1, t1)), Some(Term::Cons(h2, t2))) => {
            identical(terms, vars, h1, h2) && identical(terms, vars, t1, t2)
        }
        // Vars, atoms, and numbers are fully decided by id equality.
        _ => false,
    }
}

/// Unification for `\=` and solution reflection: binds any variable it
/// meets (tracked in `undo`), defers nothing, wakes nothing.
pub(crate) fn trial_unify(
    terms: &TermStore,
    vars: &mut VarStore,
    a: TermId,
    b: TermId,
    undo: &mut Vec<VarId>,
) -> bool {
    let a = deref(a, terms, vars);
    let b = deref(b, terms, vars);
    if a == b {
        return true;
    }
    match (terms.resolve(a), terms.resolve(b)) {
        (Some(Term::Var(v)), _) => {
            vars.set_binding(v, Some(b));
            undo.push(v);
            true
        }
        (_, Some(Term::Var(v))) => {
            vars.set_binding(v, Some(a));
            undo.push(v);
            true
        }
        (Some(Term::Struct(f1, args1)), Some(Term::Struct(f2, args2))) => {
            f1 == f2
                && args1.len() == args2.len()
                && args1
                    .iter()
                    .zip(args2.iter())
                    .all(|(&x, &y)| trial_unify(terms, vars, x, y, undo))
        }
        (Some(Term::Cons(h1, t1)), Some(Term::Cons(h2, t2))) => {
            trial_unify(terms, vars, h1, h2, undo) && trial_unify(terms, vars, t1, t2, undo)
        }
        _ => false,
    }
}

// ========== arithmetic ==========

#[derive(Debug, Clone, Copy, PartialEq)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ArithStop {
    /// Expression contains an unbound variable; suspend on it.
    Unbound(VarId),
    /// Non-numeric leaf, unknown operator, or division by zero.
    Domain,
}

/// Evaluate an arithmetic expression term.
fn eval_arith(
    terms: &TermStore,
    symbols: &SymbolStore,
    vars: &VarStore,
    t: TermId,
) -> Result<Num, ArithStop> {
    let t = deref(t, terms, vars);
    match terms.resolve(t) {
        Some(Term::Int(i)) => Ok(Num::Int(i)),
        Some(Term::Float(bits)) => Ok(Num::Float(Term::float_value(bits))),
        Some(Term::Var(v)) => Err(ArithStop::Unbound(v)),
        Some(Term::Struct(f, args)) => {
            let op = symbols.resolve(f).ok_or(ArithStop::Domain)?;
            match (op, args.len()) {
                ("-", 1) => Ok(match eval_arith(terms, symbols, vars, args[0])? {
                    Num::Int(i) => Num::Int(-i),
                    Num::Float(f) => Num::Float(-f),
                }),
                ("+", 1) => eval_arith(terms, symbols, vars, args[0]),
                ("abs", 1) => Ok(match eval_arith(terms, symbols, vars, args[0])? {
                    Num::Int(i) => Num::Int(i.abs()),
                    Num::Float(f) => Num::Float(f.abs()),
                }),
                (_, 2) => {
                    let lhs = eval_arith(terms, symbols, vars, args[0])?;
                    let rhs = eval_arith(terms, symbols, vars, args[1])?;
                    eval_binop(op, lhs, rhs)
                }
                _ => Err(ArithStop::Domain),
            }
        }
        _ => Err(ArithStop::Domain),
    }
}

fn eval_binop(op: &str, lhs: Num, rhs: Num) -> Result<Num, ArithStop> {
    use Num::{Float, Int};
    match (op, lhs, rhs) {
        ("+", Int(a), Int(b)) => Ok(Int(a.wrapping_add(b))),
        ("-", Int(a), Int(b)) => Ok(Int(a.wrapping_sub(b))),
        ("*", Int(a), Int(b)) => Ok(Int(a.wrapping_mul(b))),
        ("/", Int(a), Int(b)) => {
            if b == 0 {
                Err(ArithStop::Domain)
            } else if a % b == 0 {
                Ok(Int(a / b))
            } else {
                Ok(Float(a as f64 / b as f64))
            }
        }
        ("//", Int(a), Int(b)) => {
            if b == 0 {
                Err(ArithStop::Domain)
            } else {
                Ok(Int(a.div_euclid(b)))
            }
        }
        ("mod", Int(a), Int(b)) => {
            if b == 0 {
                Err(ArithStop::Domain)
            } else {
                Ok(Int(a.rem_euclid(b)))
            }
        }
        ("min", Int(a), Int(b)) => Ok(Int(a.min(b))),
        ("max", Int(a), Int(b)) => Ok(Int(a.max(b))),
        ("//", _, _) | ("mod", _, _) => Err(ArithStop::Domain),
        ("+", a, b) => Ok(Float(a.as_f64() + b.as_f64())),
        ("-", a, b) => Ok(Float(a.as_f64() - b.as_f64())),
        ("*", a, b) => Ok(Float(a.as_f64() * b.as_f64())),
        ("/", a, b) => {
            if b.as_f64() == 0.0 {
                Err(ArithStop::Domain)
            } else {
                Ok(Float(a.as_f64() / b.as_f64()))
            }
        }
        ("min", a, b) => Ok(Float(a.as_f64().min(b.as_f64()))),
        ("max", a, b) => Ok(Float(a.as_f64().max(b.as_f64()))),
        _ => Err(ArithStop::Domain),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::EnvStore;
    use crate::program::GuardType;
    use crate::tree::Tree;

    struct Fixture {
        symbols: SymbolStore,
        terms: TermStore,
        vars: VarStore,
        envs: EnvStore,
        trail: Trail,
        tree: Tree,
        woken: Vec<Suspension>,
        out: String,
        query_env: crate::env::EnvId,
        andb: AndId,
    }

    impl Fixture {
        fn new() -> Self {
            let mut envs = EnvStore::new();
            let query_env = envs.fresh(None);
            let box_env = envs.fresh(Some(query_env));
            let mut tree = Tree::new();
            let choice = tree.new_choice(None, GuardType::None, None);
            let andb = tree.new_and(box_env, Some(choice), 0);
            tree.choice_mut(choice).alternatives.push(andb);
            Self {
                symbols: SymbolStore::new(),
                terms: TermStore::new(),
                vars: VarStore::new(),
                envs,
                trail: Trail::new(),
                tree,
                woken: Vec::new(),
                out: String::new(),
                query_env,
                andb,
            }
        }

        fn local(&mut self, name: &str) -> VarId {
            let env = self.tree.and(self.andb).env;
            self.vars.fresh(name, Some(env))
        }

        fn call(&mut self, name: &str, args: &[TermId]) -> BuiltinOutcome {
            let mut ctx = BuiltinCtx {
                terms: &self.terms,
                symbols: &self.symbols,
                envs: &self.envs,
                vars: &mut self.vars,
                trail: &mut self.trail,
                tree: &mut self.tree,
                woken: &mut self.woken,
                out: &mut self.out,
            };
            call_builtin(&mut ctx, name, self.andb, args)
        }

        fn expr2(&mut self, op: &str, a: TermId, b: TermId) -> TermId {
            let f = self.symbols.intern(op);
            self.terms.compound2(f, a, b)
        }
    }

    // ========== CONTROL / UNIFICATION ==========

    #[test]
    fn true_and_fail() {
        let mut fx = Fixture::new();
        assert_eq!(fx.call("true", &[]), BuiltinOutcome::Succeeded);
        assert_eq!(fx.call("fail", &[]), BuiltinOutcome::Failed);
        assert_eq!(fx.call("false", &[]), BuiltinOutcome::Failed);
    }

    #[test]
    fn unify_builtin_binds_local() {
        let mut fx = Fixture::new();
        let x = fx.local("X");
        let xt = fx.terms.var(x);
        let one = fx.terms.int(1);
        assert_eq!(fx.call("=", &[xt, one]), BuiltinOutcome::Succeeded);
        assert_eq!(fx.vars.binding(x), Some(one));
        assert_eq!(fx.call("=", &[xt, fx.terms.int(2)]), BuiltinOutcome::Failed);
    }

    #[test]
    fn not_unifiable_makes_no_bindings() {
        let mut fx = Fixture::new();
        let x = fx.local("X");
        let xt = fx.terms.var(x);
        let one = fx.terms.int(1);
        // X \= 1 fails (they unify) and leaves X unbound
        assert_eq!(fx.call("\\=", &[xt, one]), BuiltinOutcome::Failed);
        assert!(!fx.vars.is_bound(x));
        // 1 \= 2 succeeds
        assert_eq!(
            fx.call("\\=", &[one, fx.terms.int(2)]),
            BuiltinOutcome::Succeeded
        );
    }

    #[test]
    fn structural_identity() {
        let mut fx = Fixture::new();
        let f = fx.symbols.intern("f");
        let x = fx.local("X");
        let xt = fx.terms.var(x);
        let t1 = fx.terms.compound1(f, xt);
        let t2 = fx.terms.compound1(f, xt);
        let t3 = fx.terms.compound1(f, fx.terms.int(1));
        assert_eq!(fx.call("==", &[t1, t2]), BuiltinOutcome::Succeeded);
        assert_eq!(fx.call("==", &[t1, t3]), BuiltinOutcome::Failed);
        assert_eq!(fx.call("\\==", &[t1, t3]), BuiltinOutcome::Succeeded);
        // identity follows bindings
        fx.vars.set_binding(x, Some(fx.terms.int(1)));
        assert_eq!(fx.call("==", &[t1, t3]), BuiltinOutcome::Succeeded);
    }

    // ========== TYPE TESTS ==========

    #[test]
    fn var_and_nonvar_follow_bindings() {
        let mut fx = Fixture::new();
        let x = fx.local("X");
        let xt = fx.terms.var(x);
        assert_eq!(fx.call("var", &[xt]), BuiltinOutcome::Succeeded);
        assert_eq!(fx.call("nonvar", &[xt]), BuiltinOutcome::Failed);
        fx.vars.set_binding(x, Some(fx.terms.int(1)));
        assert_eq!(fx.call("var", &[xt]), BuiltinOutcome::Failed);
        assert_eq!(fx.call("nonvar", &[xt]), BuiltinOutcome::Succeeded);
    }

    #[test]
    fn type_tests() {
        let mut fx = Fixture::new();
        let a = fx.terms.atom(fx.symbols.intern("a"));
        let i = fx.terms.int(1);
        let fl = fx.terms.float(1.5);
        let f = fx.symbols.intern("f");
        let c = fx.terms.compound1(f, i);
        let nil = fx.terms.atom(fx.symbols.intern("[]"));
        let l = fx.terms.cons(i, nil);

        assert_eq!(fx.call("atom", &[a]), BuiltinOutcome::Succeeded);
        assert_eq!(fx.call("atom", &[i]), BuiltinOutcome::Failed);
        assert_eq!(fx.call("number", &[i]), BuiltinOutcome::Succeeded);
        assert_eq!(fx.call("number", &[fl]), BuiltinOutcome::Succeeded);
        assert_eq!(fx.call("integer", &[fl]), BuiltinOutcome::Failed);
        assert_eq!(fx.call("float", &[fl]), BuiltinOutcome::Succeeded);
        assert_eq!(fx.call("compound", &[c]), BuiltinOutcome::Succeeded);
        assert_eq!(fx.call("compound", &[l]), BuiltinOutcome::Succeeded);
        assert_eq!(fx.call("compound", &[a]), BuiltinOutcome::Failed);
    }

    // ========== ARITHMETIC ==========

    #[test]
    fn is_evaluates_and_unifies() {
        let mut fx = Fixture::new();
        let x = fx.local("X");
        let xt = fx.terms.var(x);
        let expr = fx.expr2("+", fx.terms.int(2), fx.terms.int(3));
        assert_eq!(fx.call("is", &[xt, expr]), BuiltinOutcome::Succeeded);
        assert_eq!(fx.vars.binding(x), Some(fx.terms.int(5)));
    }

    #[test]
    fn is_suspends_on_unbound_argument() {
        let mut fx = Fixture::new();
        let x = fx.local("X");
        let m = fx.local("M");
        let expr = fx.expr2("+", fx.terms.var(m), fx.terms.int(1));
        let xt = fx.terms.var(x);
        assert_eq!(fx.call("is", &[xt, expr]), BuiltinOutcome::Suspended(m));
        assert!(!fx.vars.is_bound(x));
    }

    #[test]
    fn is_fails_on_non_numeric() {
        let mut fx = Fixture::new();
        let x = fx.local("X");
        let a = fx.terms.atom(fx.symbols.intern("a"));
        let expr = fx.expr2("+", a, fx.terms.int(1));
        let xt = fx.terms.var(x);
        assert_eq!(fx.call("is", &[xt, expr]), BuiltinOutcome::Failed);
    }

    #[test]
    fn division_rules() {
        let mut fx = Fixture::new();
        let x = fx.local("X");
        let xt = fx.terms.var(x);

        let exact = fx.expr2("/", fx.terms.int(6), fx.terms.int(3));
        assert_eq!(fx.call("is", &[xt, exact]), BuiltinOutcome::Succeeded);
        assert_eq!(fx.vars.binding(x), Some(fx.terms.int(2)));

        let y = fx.local("Y");
        let yt = fx.terms.var(y);
        let inexact = fx.expr2("/", fx.terms.int(7), fx.terms.int(2));
        assert_eq!(fx.call("is", &[yt, inexact]), BuiltinOutcome::Succeeded);
        assert_eq!(fx.vars.binding(y), Some(fx.terms.float(3.5)));

        let z = fx.local("Z");
        let zt = fx.terms.var(z);
        let by_zero = fx.expr2("//", fx.terms.int(1), fx.terms.int(0));
        assert_eq!(fx.call("is", &[zt, by_zero]), BuiltinOutcome::Failed);
    }

    #[test]
    fn comparisons() {
        let mut fx = Fixture::new();
        let two = fx.terms.int(2);
        let three = fx.terms.int(3);
        assert_eq!(fx.call("<", &[two, three]), BuiltinOutcome::Succeeded);
        assert_eq!(fx.call(">", &[two, three]), BuiltinOutcome::Failed);
        assert_eq!(fx.call("=<", &[two, two]), BuiltinOutcome::Succeeded);
        assert_eq!(fx.call(">=", &[three, two]), BuiltinOutcome::Succeeded);
        assert_eq!(fx.call("=:=", &[two, two]), BuiltinOutcome::Succeeded);
        assert_eq!(fx.call("=\\=", &[two, three]), BuiltinOutcome::Succeeded);
        // mixed int/float compares numerically
        let two_f = fx.terms.float(2.0);
        assert_eq!(fx.call("=:=", &[two, two_f]), BuiltinOutcome::Succeeded);
    }

    #[test]
    fn comparison_suspends_on_unbound() {
        let mut fx = Fixture::new();
        let m = fx.local("M");
        let mt = fx.terms.var(m);
        assert_eq!(
            fx.call("<", &[mt, fx.terms.int(3)]),
            BuiltinOutcome::Suspended(m)
        );
    }

    // ========== OUTPUT ==========

    #[test]
    fn write_captures_output() {
        let mut fx = Fixture::new();
        let first = fx.terms.atom(fx.symbols.intern("first"));
        assert_eq!(fx.call("write", &[first]), BuiltinOutcome::Succeeded);
        assert_eq!(fx.call("nl", &[]), BuiltinOutcome::Succeeded);
        let second = fx.terms.atom(fx.symbols.intern("second"));
        assert_eq!(fx.call("writeln", &[second]), BuiltinOutcome::Succeeded);
        assert_eq!(fx.out, "first\nsecond\n");
    }
}
