//! Deep copy of an and-box subtree for splitting.
//!
//! Everything whose environment lies inside the copied subtree is
//! duplicated: boxes, environments, variables (with their bindings), and
//! the suspensions among them. Everything external is shared — an external
//! variable with suspensions into the subtree gains additional suspension
//! entries pointing at the copies, so a later binding wakes both branches.

use crate::env::{EnvId, EnvStore};
use crate::term::{Term, TermId, TermStore};
use crate::tree::{AndId, ChoiceId, Tree};
use crate::var::{Suspension, VarId, VarStore};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

#[cfg(feature = "tracing")]
use crate::trace::debug;

/// Stores the copy operation reads and extends.
pub struct CopyCtx<'a> {
    pub terms: &'a TermStore,
    pub envs: &'a mut EnvStore,
    pub vars: &'a mut VarStore,
    pub tree: &'a mut Tree,
}

/// Result of a subtree copy.
pub struct CopyOutcome {
    pub root: AndId,
    pub boxes_copied: u64,
}

/// Copy the subtree rooted at `mother`.
///
/// The copy's root environment is a fresh child of the mother's parent
/// env; `trail_mark` (normally the current trail position) seeds the
/// copies' trail marks, since the copy starts with an empty segment.
pub fn copy_subtree(ctx: &mut CopyCtx, mother: AndId, trail_mark: usize) -> CopyOutcome {
    let mother_env = ctx.tree.and(mother).env;
    let mut copier = Copier {
        ctx,
        mother_env,
        trail_mark,
        and_map: FxHashMap::default(),
        choice_map: FxHashMap::default(),
        var_map: FxHashMap::default(),
        env_map: FxHashMap::default(),
        externals: FxHashSet::default(),
        boxes_copied: 0,
    };

    let root = copier.copy_and(mother, None);
    copier.duplicate_suspensions();

    #[cfg(feature = "tracing")]
    debug!(boxes = copier.boxes_copied, "split_copy");

    CopyOutcome {
        root,
        boxes_copied: copier.boxes_copied,
    }
}

struct Copier<'a, 'b> {
    ctx: &'a mut CopyCtx<'b>,
    mother_env: EnvId,
    trail_mark: usize,
    and_map: FxHashMap<AndId, AndId>,
    choice_map: FxHashMap<ChoiceId, ChoiceId>,
    var_map: FxHashMap<VarId, VarId>,
    env_map: FxHashMap<EnvId, EnvId>,
    externals: FxHashSet<VarId>,
    boxes_copied: u64,
}

impl Copier<'_, '_> {
    fn env_inside(&self, env: EnvId) -> bool {
        self.ctx.envs.is_ancestor_of(self.mother_env, env)
    }

    fn var_inside(&self, v: VarId) -> bool {
        match self.ctx.vars.env(v) {
            Some(e) => self.env_inside(e),
            None => false,
        }
    }

    fn copy_env(&mut self, env: EnvId) -> EnvId {
        if !self.env_inside(env) {
            return env;
        }
        if let Some(&mapped) = self.env_map.get(&env) {
            return mapped;
        }
        let parent = self.ctx.envs.parent(env).map(|p| self.copy_env(p));
        let fresh = self.ctx.envs.fresh(parent);
        self.env_map.insert(env, fresh);
        fresh
    }

    fn copy_var(&mut self, v: VarId) -> VarId {
        if !self.var_inside(v) {
            self.externals.insert(v);
            return v;
        }
        if let Some(&mapped) = self.var_map.get(&v) {
            return mapped;
        }
        let env = self.ctx.vars.env(v).map(|e| self.copy_env(e));
        let name = self.ctx.vars.name(v).to_string();
        let fresh = self.ctx.vars.fresh(&name, env);
        self.var_map.insert(v, fresh);
        // Bindings are rewritten through the map; installing them directly
        // is safe since no other branch can observe a fresh cell.
        if let Some(bound) = self.ctx.vars.binding(v) {
            let copied = self.copy_term(bound);
            self.ctx.vars.set_binding(fresh, Some(copied));
        }
        fresh
    }

    fn copy_term(&mut self, term: TermId) -> TermId {
        match self.ctx.terms.resolve(term) {
            Some(Term::Var(v)) => {
                let mapped = self.copy_var(v);
                self.ctx.terms.var(mapped)
            }
            Some(Term::Struct(f, args)) => {
                let new_args: SmallVec<[TermId; 4]> =
                    args.iter().map(|&a| self.copy_term(a)).collect();
                self.ctx.terms.compound(f, new_args)
            }
            Some(Term::Cons(h, t)) => {
                let nh = self.copy_term(h);
                let nt = self.copy_term(t);
                self.ctx.terms.cons(nh, nt)
            }
            _ => term,
        }
    }

    fn copy_and(&mut self, and: AndId, father: Option<ChoiceId>) -> AndId {
        if let Some(&mapped) = self.and_map.get(&and) {
            return mapped;
        }
        let env = self.copy_env(self.ctx.tree.and(and).env);
        let copy = self.ctx.tree.new_and(env, father, self.trail_mark);
        self.and_map.insert(and, copy);
        self.boxes_copied += 1;

        let status = self.ctx.tree.and(and).status;
        let quiet_mark = self.ctx.tree.and(and).quiet_mark;
        let goals: Vec<TermId> = self.ctx.tree.and(and).goals.iter().copied().collect();
        let body_goals = self.ctx.tree.and(and).body_goals.clone();
        let unifiers = self.ctx.tree.and(and).unifiers.clone();
        let constraints = self.ctx.tree.and(and).constraints.clone();
        let local_vars = self.ctx.tree.and(and).local_vars.clone();
        let tried = self.ctx.tree.and(and).tried.clone();

        let new_goals: Vec<TermId> = goals.iter().map(|&g| self.copy_term(g)).collect();
        let new_body: Vec<TermId> = body_goals.iter().map(|&g| self.copy_term(g)).collect();
        let new_unifiers: Vec<(VarId, TermId)> = unifiers
            .iter()
            .map(|&(v, t)| (self.copy_var(v), self.copy_term(t)))
            .collect();
        let new_constraints: Vec<(TermId, VarId)> = constraints
            .iter()
            .map(|&(g, v)| (self.copy_term(g), self.copy_var(v)))
            .collect();
        let new_locals: Vec<VarId> = local_vars.iter().map(|&v| self.copy_var(v)).collect();
        let new_tried: Vec<ChoiceId> = tried.iter().map(|&c| self.copy_choice(c, copy)).collect();

        let b = self.ctx.tree.and_mut(copy);
        b.status = status;
        b.quiet_mark = quiet_mark;
        b.goals = new_goals.into_iter().collect();
        b.body_goals = new_body;
        b.unifiers = new_unifiers;
        b.constraints = new_constraints;
        b.local_vars = new_locals;
        b.tried = new_tried;

        copy
    }

    fn copy_choice(&mut self, choice: ChoiceId, father: AndId) -> ChoiceId {
        if let Some(&mapped) = self.choice_map.get(&choice) {
            return mapped;
        }
        let guard_type = self.ctx.tree.choice(choice).guard_type;
        let predicate = self.ctx.tree.choice(choice).predicate;
        let untried = self.ctx.tree.choice(choice).untried.clone();
        let call = self.ctx.tree.choice(choice).call;
        let alternatives = self.ctx.tree.choice(choice).alternatives.clone();

        let copy = self.ctx.tree.new_choice(Some(father), guard_type, predicate);
        self.choice_map.insert(choice, copy);
        let new_call = call.map(|g| self.copy_term(g));
        let cb = self.ctx.tree.choice_mut(copy);
        cb.untried = untried;
        cb.call = new_call;

        let new_alts: Vec<AndId> = alternatives
            .iter()
            .map(|&a| self.copy_and(a, Some(copy)))
            .collect();
        self.ctx.tree.choice_mut(copy).alternatives = new_alts;

        copy
    }

    fn map_suspension(&self, susp: Suspension) -> Option<Suspension> {
        match susp {
            Suspension::And(a) => self.and_map.get(&a).map(|&na| Suspension::And(na)),
            Suspension::Choice(c) => self.choice_map.get(&c).map(|&nc| Suspension::Choice(nc)),
        }
    }

    /// Second pass: copied local variables receive the mapped suspensions
    /// of their originals; shared external variables gain extra entries
    /// pointing at the copied boxes.
    fn duplicate_suspensions(&mut self) {
        let local_pairs: Vec<(VarId, VarId)> =
            self.var_map.iter().map(|(&o, &n)| (o, n)).collect();
        for (orig, copy) in local_pairs {
            let susps: Vec<Suspension> = self.ctx.vars.suspensions(orig).to_vec();
            for s in susps {
                if let Some(mapped) = self.map_suspension(s) {
                    self.ctx.vars.suspend(copy, mapped);
                }
            }
        }
        let externals: Vec<VarId> = self.externals.iter().copied().collect();
        for ext in externals {
            let susps: Vec<Suspension> = self.ctx.vars.suspensions(ext).to_vec();
            for s in susps {
                if let Some(mapped) = self.map_suspension(s) {
                    self.ctx.vars.suspend(ext, mapped);
                }
            }
        }
    }
}
