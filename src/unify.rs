//! Structural unification with deferred external bindings.
//!
//! Unification runs in the context of an and-box. Variables that are not
//! external to the box are bound directly (and trailed); variables external
//! to it are never bound here — the pair goes onto the box's unifier list,
//! the box suspends on the variable, and the binding is committed only when
//! the box promotes into the variable's scope.

use crate::env::EnvStore;
use crate::term::{Term, TermId, TermStore};
use crate::trail::Trail;
use crate::tree::{AndId, Status, Tree};
use crate::var::{Suspension, VarId, VarStore};
use smallvec::SmallVec;

#[cfg(feature = "tracing")]
use crate::trace::trace;

/// Mutable pieces of worker state that unification touches.
pub struct UnifyCtx<'a> {
    pub terms: &'a TermStore,
    pub envs: &'a EnvStore,
    pub vars: &'a mut VarStore,
    pub trail: &'a mut Trail,
    pub tree: &'a mut Tree,
    /// Suspensions drained by bindings made during this unification; the
    /// worker routes them to the wake/recall queues.
    pub woken: &'a mut Vec<Suspension>,
}

/// Dereference: follow variable bindings until a non-variable or an
/// unbound variable is reached. Idempotent.
pub fn deref(term: TermId, terms: &TermStore, vars: &VarStore) -> TermId {
    let mut current = term;
    loop {
        match terms.resolve(current) {
            Some(Term::Var(v)) => match vars.binding(v) {
                Some(bound) => current = bound,
                None => return current,
            },
            _ => return current,
        }
    }
}

/// Occurs check: does `var` occur in `term` (following bindings)?
pub fn occurs(var: VarId, term: TermId, terms: &TermStore, vars: &VarStore) -> bool {
    let mut stack: SmallVec<[TermId; 16]> = SmallVec::new();
    stack.push(term);

    while let Some(t) = stack.pop() {
        let t = deref(t, terms, vars);
        match terms.resolve(t) {
            Some(Term::Var(v)) => {
                if v == var {
                    return true;
                }
            }
            Some(Term::Struct(_, args)) => {
                stack.extend(args.iter().copied());
            }
            Some(Term::Cons(h, tl)) => {
                stack.push(h);
                stack.push(tl);
            }
            _ => {}
        }
    }
    false
}

/// Unify two terms in the context of `andb`.
///
/// On failure every binding made by this call is undone; deferred unifier
/// entries are the caller's to discard with the box. Uses an explicit
/// worklist to avoid recursion.
pub fn unify(ctx: &mut UnifyCtx, t1: TermId, t2: TermId, andb: AndId) -> bool {
    let start = ctx.trail.position();
    let mut worklist: SmallVec<[(TermId, TermId); 32]> = SmallVec::new();
    worklist.push((t1, t2));

    while let Some((a, b)) = worklist.pop() {
        let a = deref(a, ctx.terms, ctx.vars);
        let b = deref(b, ctx.terms, ctx.vars);

        if a == b {
            // Hashconsing makes structural equality id equality for
            // ground terms, and deref reduced both sides.
            continue;
        }

        let ta = ctx.terms.resolve(a);
        let tb = ctx.terms.resolve(b);

        match (ta, tb) {
            (Some(Term::Var(va)), Some(Term::Var(vb))) => {
                // Bind whichever side is in scope; defer if both external.
                if !is_external(ctx, va, andb) {
                    bind(ctx, va, b, andb);
                } else if !is_external(ctx, vb, andb) {
                    bind(ctx, vb, a, andb);
                } else {
                    defer(ctx, va, b, andb);
                }
            }
            (Some(Term::Var(v)), Some(_)) => {
                if occurs(v, b, ctx.terms, ctx.vars) {
                    #[cfg(feature = "tracing")]
                    trace!(var = v.raw(), "unify_occurs_check_failed");
                    ctx.trail.undo_to(start, ctx.vars);
                    return false;
                }
                if is_external(ctx, v, andb) {
                    defer(ctx, v, b, andb);
                } else {
                    bind(ctx, v, b, andb);
                }
            }
            (Some(_), Some(Term::Var(v))) => {
                if occurs(v, a, ctx.terms, ctx.vars) {
                    #[cfg(feature = "tracing")]
                    trace!(var = v.raw(), "unify_occurs_check_failed");
                    ctx.trail.undo_to(start, ctx.vars);
                    return false;
                }
                if is_external(ctx, v, andb) {
                    defer(ctx, v, a, andb);
                } else {
                    bind(ctx, v, a, andb);
                }
            }
            (Some(Term::Struct(f1, args1)), Some(Term::Struct(f2, args2))) => {
                if f1 != f2 || args1.len() != args2.len() {
                    ctx.trail.undo_to(start, ctx.vars);
                    return false;
                }
                for (x, y) in args1.iter().zip(args2.iter()) {
                    worklist.push((*x, *y));
                }
            }
            (Some(Term::Cons(h1, t1)), Some(Term::Cons(h2, t2))) => {
                worklist.push((t1, t2));
                worklist.push((h1, h2));
            }
            _ => {
                // Distinct atoms/numbers, or mismatched shapes.
                ctx.trail.undo_to(start, ctx.vars);
                return false;
            }
        }
    }

    true
}

fn is_external(ctx: &UnifyCtx, v: VarId, andb: AndId) -> bool {
    let box_env = ctx.tree.and(andb).env;
    ctx.envs.is_external(ctx.vars.env(v), box_env)
}

/// Bind an in-scope variable, trail the binding, and collect the woken
/// suspensions for the worker.
fn bind(ctx: &mut UnifyCtx, v: VarId, value: TermId, owner: AndId) {
    debug_assert!(
        ctx.vars.binding(v).is_none(),
        "rebinding outside the trail protocol"
    );
    ctx.trail.record(v, None, owner);
    ctx.vars.set_binding(v, Some(value));
    let woken = ctx.vars.take_suspensions(v);
    ctx.woken.extend(woken);

    #[cfg(feature = "tracing")]
    trace!(var = v.raw(), "unify_bind");
}

/// Defer a binding on an external variable into the box's unifier list and
/// suspend the box on the variable.
fn defer(ctx: &mut UnifyCtx, v: VarId, value: TermId, andb: AndId) {
    ctx.tree.and_mut(andb).unifiers.push((v, value));
    ctx.vars.suspend(v, Suspension::And(andb));
    let b = ctx.tree.and_mut(andb);
    if b.status != Status::Dead {
        b.status = Status::XUnstable;
    }

    #[cfg(feature = "tracing")]
    trace!(var = v.raw(), "unify_defer_external");
}
